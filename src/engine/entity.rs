//! # Entity Store
//!
//! Maps opaque [`Entity`] handles to their current storage location and manages
//! the handle lifecycle.
//!
//! ## Handles
//! An [`Entity`] is an `(index, generation)` pair. The index addresses a slot in
//! the table; the generation is bumped each time the slot is released, so a
//! handle issued before the release no longer matches the slot and is rejected.
//!
//! ## Recycling
//! Released indices go to a min-heap free list. Creation always reuses the
//! lowest free index before growing the table, which keeps the table dense and
//! handle reuse deterministic.
//!
//! ## Ownership
//! The store only records locations. Placing rows in chunks, moving them, and
//! updating locations of swapped rows is the job of the structural change
//! engine, which holds the only mutable path to this table.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::fmt;

use crate::engine::error::{CapacityError, CapacityResource, InvalidHandleError};
use crate::engine::types::{ArchetypeID, ChunkIndex, EntityCount, GenerationID, IndexID, RowID};

/// Opaque handle to a logical record.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default, PartialOrd, Ord)]
pub struct Entity {
    index: IndexID,
    generation: GenerationID,
}

impl Entity {
    /// Builds a handle from its parts.
    #[inline]
    pub const fn new(index: IndexID, generation: GenerationID) -> Self {
        Self { index, generation }
    }

    /// Slot index.
    #[inline]
    pub const fn index(self) -> IndexID {
        self.index
    }

    /// Slot generation at issue time.
    #[inline]
    pub const fn generation(self) -> GenerationID {
        self.generation
    }

    /// Packs the handle into a `u64` (generation in the high half).
    #[inline]
    pub const fn to_bits(self) -> u64 {
        ((self.generation as u64) << 32) | self.index as u64
    }

    /// Inverse of [`to_bits`](Self::to_bits).
    #[inline]
    pub const fn from_bits(bits: u64) -> Self {
        Self { index: bits as u32, generation: (bits >> 32) as u32 }
    }
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}v{}", self.index, self.generation)
    }
}

/// Where a live entity's row currently lives.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EntityLocation {
    /// Archetype owning the row.
    pub archetype: ArchetypeID,
    /// Position of the chunk in the archetype's chunk list.
    pub chunk: ChunkIndex,
    /// Row within the chunk.
    pub row: RowID,
}

#[derive(Clone, Copy, Debug, Default)]
struct Slot {
    generation: GenerationID,
    alive: bool,
    location: EntityLocation,
}

/// Handle table with generation checks and a lowest-index free list.
#[derive(Debug, Default)]
pub struct EntityStore {
    slots: Vec<Slot>,
    free: BinaryHeap<Reverse<IndexID>>,
    live: EntityCount,
    limit: Option<EntityCount>,
}

impl EntityStore {
    /// Creates an empty table, optionally bounded to `limit` slots.
    pub fn new(limit: Option<EntityCount>) -> Self {
        Self { slots: Vec::new(), free: BinaryHeap::new(), live: 0, limit }
    }

    /// Issues a handle for a row already placed at `location`.
    ///
    /// Reuses the lowest released index if any, otherwise appends a slot.
    /// The handle carries the slot's stored generation.
    pub fn allocate(&mut self, location: EntityLocation) -> Result<Entity, CapacityError> {
        let index = match self.free.pop() {
            Some(Reverse(index)) => index,
            None => self.grow()?,
        };

        let slot = &mut self.slots[index as usize];
        slot.alive = true;
        slot.location = location;
        self.live += 1;
        Ok(Entity::new(index, slot.generation))
    }

    /// Fails with `CapacityExceeded` before issuing a new slot would pass the limit.
    pub fn check_capacity(&self) -> Result<(), CapacityError> {
        if !self.free.is_empty() {
            return Ok(());
        }
        let requested = self.slots.len() as u64 + 1;
        let limit = self.limit.map_or(IndexID::MAX as u64, u64::from);
        if requested > limit {
            return Err(CapacityError { resource: CapacityResource::Entities, requested, limit });
        }
        Ok(())
    }

    fn grow(&mut self) -> Result<IndexID, CapacityError> {
        self.check_capacity()?;
        let index = self.slots.len() as IndexID;
        self.slots.push(Slot::default());
        Ok(index)
    }

    /// Marks the slot dead, bumps its generation, and frees its index.
    ///
    /// Returns the location the entity occupied.
    pub fn release(&mut self, entity: Entity) -> Result<EntityLocation, InvalidHandleError> {
        let location = self.location(entity)?;
        let slot = &mut self.slots[entity.index as usize];
        slot.alive = false;
        slot.generation = slot.generation.wrapping_add(1);
        slot.location = EntityLocation::default();
        self.free.push(Reverse(entity.index));
        self.live -= 1;
        Ok(location)
    }

    /// Returns `true` iff the slot is live and generations match.
    #[inline]
    pub fn exists(&self, entity: Entity) -> bool {
        self.slots
            .get(entity.index as usize)
            .is_some_and(|slot| slot.alive && slot.generation == entity.generation)
    }

    /// Current location of a live entity.
    pub fn location(&self, entity: Entity) -> Result<EntityLocation, InvalidHandleError> {
        if self.exists(entity) {
            Ok(self.slots[entity.index as usize].location)
        } else {
            Err(InvalidHandleError { entity })
        }
    }

    /// Records a new location for a live entity.
    pub fn set_location(&mut self, entity: Entity, location: EntityLocation) {
        debug_assert!(
            self.exists(entity),
            "set_location was called on a dead or stale entity. Entity: {entity}, Location: {location:?}"
        );
        if let Some(slot) = self.slots.get_mut(entity.index as usize) {
            slot.location = location;
        }
    }

    /// Number of live entities.
    #[inline]
    pub fn len(&self) -> EntityCount {
        self.live
    }

    /// Returns `true` when no entity is live.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Number of slots ever allocated.
    #[inline]
    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    /// Replaces the slot limit.
    pub fn set_limit(&mut self, limit: Option<EntityCount>) {
        self.limit = limit;
    }

    /// Iterates every live handle in index order.
    pub fn iter(&self) -> impl Iterator<Item = Entity> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.alive)
            .map(|(index, slot)| Entity::new(index as IndexID, slot.generation))
    }
}
