//! Core identifiers, capacities, and bit-level signatures.
//!
//! This module defines the small copyable types shared by every subsystem of
//! the store: entity index/generation widths, component and archetype ids,
//! chunk coordinates, change versions, and the [`Signature`] bitset used for
//! archetype identity checks and query matching.
//!
//! ## Signatures
//!
//! Archetypes carry both a canonical sorted list of component ids (their
//! identity) and a [`Signature`] bitset (their fast-path predicate form):
//!
//! - fixed-size arrays of `u64`,
//! - subset/disjointness tests are a handful of word operations,
//! - iteration over set bits uses `trailing_zeros`.
//!
//! ## Access declarations
//!
//! [`AccessMode`] and [`AccessSets`] describe how a job or query touches
//! component data. They are the input of the concurrency guard and of the
//! stage planner.
//!
//! This module contains **no unsafe code**.

/// Slot index within the entity table.
pub type IndexID = u32;
/// Generation counter used to detect stale entities.
pub type GenerationID = u32;
/// Count of live entities.
pub type EntityCount = u32;

/// Unique identifier for a component type.
pub type ComponentID = u16;
/// Unique identifier for an archetype.
pub type ArchetypeID = u32;
/// Process-unique identifier of a handed-out chunk block.
pub type ChunkID = u64;
/// Position of a chunk in its archetype's chunk list.
pub type ChunkIndex = u32;
/// Row index within a chunk.
pub type RowID = u32;
/// Monotonic change version. `0` means "never changed".
pub type Version = u64;

/// Maximum number of registered component types.
pub const COMPONENT_CAP: usize = 1024;
/// Number of `u64` words required to represent a full component signature.
pub const SIGNATURE_SIZE: usize = (COMPONENT_CAP + 63) / 64;

/// Default byte budget of a single chunk.
pub const DEFAULT_CHUNK_BYTES: usize = 16 * 1024;
/// Minimum alignment of every chunk block (one cache line).
pub const CHUNK_ALIGN: usize = 64;

/// Bitset representing a set of components.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Signature {
    /// Packed component bitset.
    pub components: [u64; SIGNATURE_SIZE],
}

impl Default for Signature {
    fn default() -> Self {
        Self {
            components: [0u64; SIGNATURE_SIZE],
        }
    }
}

impl Signature {
    /// Builds a signature from a list of component ids.
    pub fn from_ids(component_ids: &[ComponentID]) -> Self {
        let mut signature = Signature::default();
        for &component_id in component_ids { signature.set(component_id); }
        signature
    }

    /// Sets the bit corresponding to `component_id`.
    #[inline]
    pub fn set(&mut self, component_id: ComponentID) {
        let index = (component_id as usize) / 64;
        let bits = (component_id as usize) % 64;
        self.components[index] |= 1u64 << bits;
    }

    /// Clears the bit corresponding to `component_id`.
    #[inline]
    pub fn clear(&mut self, component_id: ComponentID) {
        let index = (component_id as usize) / 64;
        let bits = (component_id as usize) % 64;
        self.components[index] &= !(1u64 << bits);
    }

    /// Returns `true` if `component_id` is present in this signature.
    #[inline]
    pub fn has(&self, component_id: ComponentID) -> bool {
        let index = (component_id as usize) / 64;
        let bits = (component_id as usize) % 64;
        (self.components[index] >> bits) & 1 == 1
    }

    /// Returns `true` if all components in `signature` are present.
    #[inline]
    pub fn contains_all(&self, signature: &Signature) -> bool {
        self.components
            .iter()
            .zip(signature.components.iter())
            .all(|(a, b)| (a & b) == *b)
    }

    /// Returns `true` if no component of `signature` is present.
    #[inline]
    pub fn is_disjoint(&self, signature: &Signature) -> bool {
        self.components
            .iter()
            .zip(signature.components.iter())
            .all(|(a, b)| (a & b) == 0)
    }

    /// Returns `true` if no bit is set.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.components.iter().all(|w| *w == 0)
    }

    /// Iterates over all component ids set in this signature, ascending.
    pub fn iter(&self) -> impl Iterator<Item = ComponentID> + '_ {
        self.components
            .iter()
            .enumerate()
            .flat_map(|(word_index, &word)| {
                let base = word_index * 64;
                let mut bits = word;
                std::iter::from_fn(move || {
                    if bits == 0 {
                        return None;
                    }
                    let tz = bits.trailing_zeros() as usize;
                    bits &= bits - 1;
                    Some((base + tz) as ComponentID)
                })
            })
    }
}

/// Access mode for a component column.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AccessMode {
    /// Shared read-only access.
    Read,
    /// Exclusive write access.
    Write,
}

impl AccessMode {
    /// Returns `true` if two accesses to the same column must be ordered.
    #[inline]
    pub fn conflicts_with(self, other: AccessMode) -> bool {
        self == AccessMode::Write || other == AccessMode::Write
    }
}

/// Declares the component access set of a job.
#[derive(Clone, Debug, Default)]
pub struct AccessSets {
    /// Components read by the job.
    pub read: Signature,
    /// Components written by the job.
    pub write: Signature,
}

impl AccessSets {
    /// Returns `true` if this access set conflicts with another.
    #[inline]
    pub fn conflicts_with(&self, other: &AccessSets) -> bool {
        // Conflicts if: (W ∩ W) or (W ∩ R) or (R ∩ W)
        for ((a_w, a_r), (b_w, b_r)) in self.write.components.iter().zip(self.read.components.iter())
            .zip(other.write.components.iter().zip(other.read.components.iter()))
        {
            if (a_w & b_w) != 0 || (a_w & b_r) != 0 || (a_r & b_w) != 0 {
                return true;
            }
        }
        false
    }
}
