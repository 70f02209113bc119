//! # Archetype Store
//!
//! Archetype/chunk storage engine for component-based simulation runtimes.
//!
//! ## Design Goals
//! - Entities grouped by component composition into fixed-size SoA chunks
//! - Amortized O(1) structural changes with swap-with-last compaction
//! - Incrementally cached query matching
//! - Per chunk-column change versions
//! - Declared-access bookkeeping for parallel chunk iteration
//! - Relocatable, offset-based blob assets

#![forbid(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![allow(clippy::module_inception)]

pub mod engine;

// ─────────────────────────────────────────────────────────────────────────────
// Re-exports (Public API)
// ─────────────────────────────────────────────────────────────────────────────

pub use engine::world::{World, WorldConfig};

pub use engine::entity::{Entity, EntityLocation};

pub use engine::component::{
    Bundle,
    Component,
    ComponentDesc,
    ComponentTraits,
    ComponentValue,
    TypeKey,
    TypeRegistry,
};

pub use engine::archetype::{Archetype, ArchetypeTable};

pub use engine::chunk::{AllocatorStats, ChunkLayout};

pub use engine::query::{ChunkView, ColumnView, Query, QueryBatch, QueryBuilder, QueryDesc};

pub use engine::borrow::{AccessDeclaration, AccessGuard, AccessToken, ComponentRef, ViolationPolicy};

pub use engine::blob::{BlobArray, BlobAssetReference, BlobBuilder, BlobPtr, BlobStore};

pub use engine::commands::{Command, CommandBuffer};

pub use engine::scheduler::{make_stages, run_schedule, FnJob, Job, Stage};

pub use engine::error::{
    StoreError,
    StoreResult,
    InvalidHandleError,
    TypeNotRegisteredError,
    CapacityError,
    ConcurrentAccessViolation,
    FormatMismatchError,
};

pub use engine::types::{
    AccessMode,
    AccessSets,
    ArchetypeID,
    ChunkID,
    ComponentID,
    Signature,
    Version,
};

// ─────────────────────────────────────────────────────────────────────────────
// Prelude
// ─────────────────────────────────────────────────────────────────────────────

/// Commonly used types.
///
/// Import with:
/// ```rust
/// use archetype_store::prelude::*;
/// ```
pub mod prelude {
    pub use crate::{
        AccessMode,
        BlobAssetReference,
        Bundle,
        Entity,
        Query,
        QueryBuilder,
        StoreError,
        StoreResult,
        TypeRegistry,
        World,
        WorldConfig,
    };
}
