//! Error types for the storage engine.
//!
//! This module declares focused, composable error types used across the
//! registry, chunk allocator, entity table, structural change engine,
//! concurrency guard, and blob allocator. Each error carries enough context to
//! make failures actionable while remaining small and cheap to pass around or
//! convert into the aggregate [`StoreError`].
//!
//! ## Taxonomy
//! * [`InvalidHandleError`]: operation on a destroyed, out-of-range or stale
//!   entity handle.
//! * [`TypeNotRegisteredError`]: component type used before registration.
//! * [`CapacityError`]: chunk or entity-table ceiling reached.
//! * [`ConcurrentAccessViolation`]: direct access conflicts with an
//!   unfinished job-declared access.
//! * [`FormatMismatchError`]: blob header inconsistent with the requested
//!   root type on deserialize.
//! * Supporting errors: [`RegistryError`], [`TypeMismatchError`],
//!   [`MissingComponentError`], [`BlobError`].
//!
//! ## Typical flow
//! Low-level operations return the dedicated error type; orchestration code
//! uses `?` to bubble failures into [`StoreError`], which callers can match on:
//!
//! ```ignore
//! match world.destroy(entity) {
//!     Ok(()) => {}
//!     Err(StoreError::InvalidHandle(e)) => eprintln!("{e}"),
//!     Err(other) => return Err(other),
//! }
//! ```
//!
//! ## Display vs. Debug
//! * `Display` is short and imperative, suitable for logs.
//! * `Debug` (derived) retains full structure for diagnostics.

use thiserror::Error;

use crate::engine::entity::Entity;
use crate::engine::types::{AccessMode, ArchetypeID, ChunkID, ComponentID};

/// Returned when an `Entity` handle is not live: destroyed, recycled under a
/// newer generation, or never issued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("invalid entity handle {entity}")]
pub struct InvalidHandleError {
    /// The offending handle.
    pub entity: Entity,
}

/// Returned when a component type is used before it was registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TypeNotRegisteredError {
    /// Lookup by component id failed.
    #[error("component id {0} is not registered")]
    Id(ComponentID),

    /// Lookup by Rust type failed.
    #[error("component type `{0}` is not registered")]
    Type(&'static str),
}

/// Which resource a [`CapacityError`] refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapacityResource {
    /// Live chunk blocks.
    Chunks,
    /// Entity table slots.
    Entities,
    /// Registered component types.
    Components,
}

/// Returned when an allocation ceiling is reached.
///
/// This is a recoverable condition: the caller may raise the configured limit
/// and retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("{resource:?} limit reached ({requested} requested; limit {limit})")]
pub struct CapacityError {
    /// Resource whose limit was hit.
    pub resource: CapacityResource,

    /// Total amount the operation attempted to hold.
    pub requested: u64,

    /// The configured upper bound that prevented the operation.
    pub limit: u64,
}

/// Returned when a direct access request overlaps an outstanding job access
/// with a conflicting mode.
///
/// This indicates a race in the calling code rather than an expected runtime
/// condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error(
    "concurrent access violation on chunk {chunk}, component {component}: \
     {requested:?} requested while a job holds {held:?} access"
)]
pub struct ConcurrentAccessViolation {
    /// Chunk whose column was requested.
    pub chunk: ChunkID,

    /// Component column that was requested.
    pub component: ComponentID,

    /// Mode requested by the direct caller.
    pub requested: AccessMode,

    /// Conflicting mode held by the outstanding job access.
    pub held: AccessMode,
}

/// Returned when serialized blob bytes do not describe the requested type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FormatMismatchError {
    /// Fewer bytes than the fixed header.
    #[error("blob bytes truncated: {length} bytes, header needs {header}")]
    Truncated {
        /// Bytes supplied.
        length: usize,
        /// Header size.
        header: usize,
    },

    /// Root type hash differs from the requested root type.
    #[error("blob root type hash {found:#018x} does not match expected {expected:#018x}")]
    RootType {
        /// Hash of the requested root type.
        expected: u64,
        /// Hash stored in the header.
        found: u64,
    },

    /// Declared payload length differs from the bytes that follow the header.
    #[error("blob declares {declared} payload bytes but {actual} follow the header")]
    Length {
        /// Length recorded in the header.
        declared: u32,
        /// Actual payload length.
        actual: usize,
    },

    /// Payload is too small to hold the root value.
    #[error("blob payload of {payload} bytes cannot hold a root of {root} bytes")]
    RootOutOfBounds {
        /// Payload length.
        payload: usize,
        /// Root value size.
        root: usize,
    },
}

/// Registration-time failures of the type registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// The registry was frozen before this registration.
    #[error("registry is frozen; cannot register `{name}`")]
    Frozen {
        /// Name of the rejected type.
        name: &'static str,
    },

    /// Size/alignment pair cannot describe a Rust layout.
    #[error("invalid layout for `{name}`: size {size}, align {align}")]
    InvalidLayout {
        /// Name of the rejected type.
        name: &'static str,
        /// Requested byte size.
        size: usize,
        /// Requested alignment.
        align: usize,
    },
}

/// Returned when a typed access names a different type than the column holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("type mismatch: column holds `{expected}`, accessed as `{actual}`")]
pub struct TypeMismatchError {
    /// Registered name of the column type.
    pub expected: &'static str,

    /// Name of the type used by the caller.
    pub actual: &'static str,
}

/// Returned when an entity's archetype lacks the requested component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("entity {entity} has no component {component}")]
pub struct MissingComponentError {
    /// Entity that was addressed.
    pub entity: Entity,

    /// Component that was requested.
    pub component: ComponentID,
}

/// Failures building or resolving blob data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum BlobError {
    /// Type alignment exceeds what blob buffers guarantee.
    #[error("blob value alignment {align} exceeds the supported maximum {max}")]
    AlignmentTooLarge {
        /// Requested alignment.
        align: usize,
        /// Maximum supported alignment.
        max: usize,
    },

    /// A blob reference points outside the buffer or is misaligned.
    #[error("blob reference at offset {offset} ({bytes} bytes) lies outside the {len}-byte buffer or is misaligned")]
    OutOfBounds {
        /// Referenced offset.
        offset: u32,
        /// Referenced byte span.
        bytes: usize,
        /// Buffer length.
        len: usize,
    },

    /// Blob grew beyond what `u32` offsets can address.
    #[error("blob exceeds the addressable size of {max} bytes")]
    TooLarge {
        /// Maximum payload size.
        max: usize,
    },
}

/// Aggregate error for every store operation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// An entity handle was stale or out of range.
    #[error(transparent)]
    InvalidHandle(#[from] InvalidHandleError),

    /// A component type was used before registration.
    #[error(transparent)]
    TypeNotRegistered(#[from] TypeNotRegisteredError),

    /// A chunk or entity-table ceiling was reached.
    #[error(transparent)]
    CapacityExceeded(#[from] CapacityError),

    /// A direct access conflicted with an unfinished job access.
    #[error(transparent)]
    ConcurrentAccessViolation(#[from] ConcurrentAccessViolation),

    /// Blob bytes did not describe the requested root type.
    #[error(transparent)]
    SerializationFormatMismatch(#[from] FormatMismatchError),

    /// The registry rejected a registration.
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// A typed access used the wrong Rust type.
    #[error(transparent)]
    TypeMismatch(#[from] TypeMismatchError),

    /// The entity does not carry the requested component.
    #[error(transparent)]
    MissingComponent(#[from] MissingComponentError),

    /// Blob construction failed.
    #[error(transparent)]
    Blob(#[from] BlobError),

    /// A component owning resources cannot be default-initialized with zeroes.
    #[error("component `{name}` ({component}) owns resources and needs an explicit value")]
    ValueRequired {
        /// Component id.
        component: ComponentID,
        /// Registered component name.
        name: &'static str,
    },

    /// No archetype has this id.
    #[error("unknown archetype {0}")]
    UnknownArchetype(ArchetypeID),

    /// The configuration cannot produce a usable chunk layout.
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
}

/// Result alias used across the crate.
pub type StoreResult<T> = Result<T, StoreError>;
