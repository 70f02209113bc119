//! # Engine Module
//!
//! Internal storage engine implementation.
//!
//! This module contains the core building blocks, leaves first:
//! - Type registry
//! - Chunk allocation
//! - Archetypes
//! - Entity handles
//! - Structural changes
//! - Query matching and chunk iteration
//! - Change versions
//! - Concurrent access bookkeeping
//! - Blob assets
//!
//! Public API exposure is controlled by `lib.rs`.

pub mod types;
pub mod error;
pub mod component;
pub mod chunk;
pub mod entity;
pub mod archetype;
pub mod structural;
pub mod query;
pub mod version;
pub mod borrow;
pub mod blob;
pub mod commands;
pub mod scheduler;
pub mod world;
