//! # Structural Change Engine
//!
//! Creates, destroys, and moves entities between archetypes.
//!
//! ## Protocol
//!
//! Every structural change on an entity follows the same steps:
//!
//! 1. Validate the handle (`InvalidHandle`).
//! 2. Resolve its `(archetype, chunk, row)`.
//! 3. Compute the target archetype (current set plus or minus one component),
//!    creating it on first use.
//! 4. If the target differs, reserve a destination row (allocating a chunk when
//!    the target has no free row), copy every column shared by both sets byte
//!    for byte, initialize new columns, and destroy values of removed columns.
//! 5. Remove the source row by swap-with-last and repoint the entity that was
//!    moved into the vacated row.
//! 6. Record the new location and stamp every touched `(chunk, component)`
//!    pair with a fresh version.
//!
//! Destruction is steps 1, 2 and 5 without a destination.
//!
//! ## Synchronization
//!
//! Structural operations take `&mut World`, so at most one runs at a time and
//! none overlaps a [`QueryBatch`](crate::engine::query::QueryBatch). Accesses
//! granted directly through the guard may still be outstanding; before a chunk
//! is touched, every column of it is checked out for writing under the world's
//! [`ViolationPolicy`](crate::engine::borrow::ViolationPolicy). Only the chunks
//! an operation touches are synchronized.
//!
//! ## Failure atomicity
//!
//! All fallible steps (handle validation, type lookup, archetype creation,
//! guard checkout, destination reservation) run before any value is copied or
//! dropped, so a failed operation leaves the world unchanged.

use std::mem;
use std::ptr;

use tracing::trace;

use crate::engine::archetype::Archetype;
use crate::engine::component::{Bundle, Component, ComponentValue};
use crate::engine::entity::{Entity, EntityLocation};
use crate::engine::error::{MissingComponentError, StoreError, StoreResult};
use crate::engine::types::{AccessMode, ArchetypeID, ChunkIndex, ComponentID, Version};
use crate::engine::world::World;

impl World {
    pub(crate) fn archetype_checked(&self, archetype: ArchetypeID) -> StoreResult<&Archetype> {
        self.archetypes.get(archetype).ok_or(StoreError::UnknownArchetype(archetype))
    }

    /// Checks out every column of a chunk for writing.
    fn sync_chunk(&self, archetype: ArchetypeID, index: ChunkIndex) -> StoreResult<()> {
        let archetype = self.archetype_checked(archetype)?;
        let Some(chunk) = archetype.chunk(index) else { return Ok(()) };
        for &component in archetype.types() {
            self.guard.acquire_direct(chunk.id(), component, AccessMode::Write)?;
        }
        Ok(())
    }

    /// Checks out the chunk a new row of `archetype` would land in.
    fn sync_destination(&self, archetype: ArchetypeID) -> StoreResult<()> {
        match self.archetype_checked(archetype)?.open_chunk() {
            Some(index) => self.sync_chunk(archetype, index),
            None => Ok(()),
        }
    }

    /// Reserves a row in `archetype` and issues a handle for it.
    ///
    /// Component cells of the row are left for the caller to initialize.
    fn place(&mut self, archetype: ArchetypeID) -> StoreResult<(Entity, EntityLocation)> {
        self.entities.check_capacity()?;
        self.sync_destination(archetype)?;

        let (chunk, row) = self.archetypes.push_row(archetype, Entity::default(), &self.allocator)?;
        let location = EntityLocation { archetype, chunk, row };
        let entity = self.entities.allocate(location)?;
        if let Some(owner) = self.archetypes.get_mut(archetype) {
            owner.set_row_entity(chunk, row, entity);
        }
        Ok((entity, location))
    }

    fn stamp(&self, location: EntityLocation, version: Version) {
        if let Some(chunk) = self.archetypes.get(location.archetype).and_then(|a| a.chunk(location.chunk)) {
            chunk.mark_all_changed(version);
        }
    }

    fn zero_row(&self, location: EntityLocation) {
        let Some(archetype) = self.archetypes.get(location.archetype) else { return };
        let Some(chunk) = archetype.chunk(location.chunk) else { return };
        for column in &archetype.layout().columns {
            // SAFETY: `row` is a reserved row of this chunk.
            unsafe { ptr::write_bytes(chunk.cell_ptr(column, location.row as usize), 0, column.size) };
        }
    }

    fn reject_managed(&self, archetype: ArchetypeID) -> StoreResult<()> {
        match self.archetype_checked(archetype)?.descs().iter().find(|d| d.is_managed()) {
            Some(desc) => Err(StoreError::ValueRequired { component: desc.component_id, name: desc.name }),
            None => Ok(()),
        }
    }

    /// Swap-removes the row at `location`, repoints the entity moved into it,
    /// and releases the chunk if it became empty.
    ///
    /// Values in the row must already be moved out or dropped.
    fn remove_row(&mut self, location: EntityLocation, version: Version) {
        let EntityLocation { archetype, chunk, row } = location;
        let Some(owner) = self.archetypes.get_mut(archetype) else { return };

        if let Some(moved) = owner.swap_remove_row(chunk, row) {
            self.entities.set_location(moved, location);
            trace!(entity = %moved, archetype, chunk, row, "row compacted");
        }
        self.stamp(location, version);

        if let Some(release) = self.archetypes.release_if_empty(archetype, chunk, &self.allocator) {
            if let Some(index) = release.relocated {
                let owner = self.archetypes.get(archetype);
                let relocated = owner.and_then(|a| a.chunk(index).map(|c| c.entities(a.layout())));
                for (row, &entity) in relocated.unwrap_or_default().iter().enumerate() {
                    self.entities.set_location(entity, EntityLocation { archetype, chunk: index, row: row as u32 });
                }
            }
        }
    }

    /// Creates an entity in `archetype` with zero-initialized components.
    ///
    /// ## Errors
    /// - `ValueRequired` if a component of the archetype owns resources; use
    ///   [`spawn`](Self::spawn) to provide values instead.
    /// - `CapacityExceeded` when the entity or chunk limit is reached.
    pub fn create(&mut self, archetype: ArchetypeID) -> StoreResult<Entity> {
        self.reject_managed(archetype)?;
        let (entity, location) = self.place(archetype)?;
        self.zero_row(location);
        self.stamp(location, self.clock.advance());
        trace!(entity = %entity, archetype, "entity created");
        Ok(entity)
    }

    /// Creates an entity in the archetype of `types`, in any order.
    pub fn create_with(&mut self, types: &[ComponentID]) -> StoreResult<Entity> {
        let archetype = self.archetypes.get_or_create(types, &self.registry)?;
        self.create(archetype)
    }

    /// Creates an entity holding the values of `bundle`.
    pub fn spawn(&mut self, bundle: Bundle) -> StoreResult<Entity> {
        let values = bundle.into_values();
        for value in &values {
            value.check(&self.registry)?;
        }
        let types: Vec<ComponentID> = values.iter().map(ComponentValue::component_id).collect();
        let archetype = self.archetypes.get_or_create(&types, &self.registry)?;
        let (entity, location) = self.place(archetype)?;

        let owner = self.archetype_checked(archetype)?;
        if let Some(chunk) = owner.chunk(location.chunk) {
            for value in values {
                let Some(index) = owner.layout().column_index(value.component_id()) else { continue };
                let cell = chunk.cell_ptr(&owner.layout().columns[index], location.row as usize);
                // SAFETY: freshly reserved cell of the value's own column.
                unsafe { value.write_into(cell) };
            }
        }
        self.stamp(location, self.clock.advance());
        trace!(entity = %entity, archetype, "entity spawned");
        Ok(entity)
    }

    /// Destroys `entity`, dropping its values and recycling its handle.
    pub fn destroy(&mut self, entity: Entity) -> StoreResult<()> {
        let location = self.entities.location(entity)?;
        self.sync_chunk(location.archetype, location.chunk)?;

        if let Some(owner) = self.archetypes.get(location.archetype) {
            owner.drop_row_values(location.chunk, location.row, None);
        }
        self.remove_row(location, self.clock.advance());
        self.entities.release(entity)?;
        trace!(entity = %entity, "entity destroyed");
        Ok(())
    }

    /// Moves `entity` into `target`.
    ///
    /// Shared columns are copied, `value` (if any) fills its new column, other
    /// new columns are zeroed, and removed columns are dropped except `taken`,
    /// whose value the caller has already read out.
    fn move_entity(
        &mut self,
        entity: Entity,
        target: ArchetypeID,
        value: Option<ComponentValue>,
        taken: Option<ComponentID>,
    ) -> StoreResult<EntityLocation> {
        let source = self.entities.location(entity)?;
        if source.archetype == target {
            return Ok(source);
        }

        self.sync_chunk(source.archetype, source.chunk)?;
        self.sync_destination(target)?;
        let (chunk, row) = self.archetypes.push_row(target, entity, &self.allocator)?;
        let destination = EntityLocation { archetype: target, chunk, row };

        let from = self.archetype_checked(source.archetype)?;
        let to = self.archetype_checked(target)?;
        let (Some(from_chunk), Some(to_chunk)) = (from.chunk(source.chunk), to.chunk(chunk)) else {
            return Err(StoreError::UnknownArchetype(target));
        };

        let mut value = value;
        for column in &to.layout().columns {
            let cell = to_chunk.cell_ptr(column, row as usize);
            match from.layout().column_index(column.component) {
                Some(index) => {
                    let src = from_chunk.cell_ptr(&from.layout().columns[index], source.row as usize);
                    // SAFETY: cells of distinct chunks never overlap; same size.
                    unsafe { ptr::copy_nonoverlapping(src, cell, column.size) };
                }
                None => match value.take() {
                    // SAFETY: reserved cell of the value's own column.
                    Some(v) if v.component_id() == column.component => unsafe { v.write_into(cell) },
                    other => {
                        value = other;
                        // SAFETY: reserved cell.
                        unsafe { ptr::write_bytes(cell, 0, column.size) };
                    }
                },
            }
        }

        let mut keep = *to.signature();
        if let Some(taken) = taken {
            keep.set(taken);
        }
        from.drop_row_values(source.chunk, source.row, Some(&keep));

        let version = self.clock.advance();
        self.remove_row(source, version);
        self.entities.set_location(entity, destination);
        self.stamp(destination, version);
        trace!(entity = %entity, from = source.archetype, to = target, "entity moved");
        Ok(destination)
    }

    /// Adds component `T` with `value`, or overwrites it if already present.
    pub fn add_component<T: Component>(&mut self, entity: Entity, value: T) -> StoreResult<()> {
        let value = ComponentValue::new(&self.registry, value)?;
        self.add_component_value(entity, value)
    }

    /// Replaces the value in column `index` of the entity's row in place.
    fn overwrite(&self, location: EntityLocation, index: usize, value: ComponentValue) -> StoreResult<()> {
        let owner = self.archetype_checked(location.archetype)?;
        let Some(chunk) = owner.chunk(location.chunk) else {
            return Err(StoreError::UnknownArchetype(location.archetype));
        };
        let column = &owner.layout().columns[index];
        self.guard.acquire_direct(chunk.id(), column.component, AccessMode::Write)?;

        let cell = chunk.cell_ptr(column, location.row as usize);
        // SAFETY: live cell of the value's own column, checked against the
        // registry; the old value is dropped before the new one is written.
        unsafe {
            if let Some(drop_fn) = column.drop_fn {
                drop_fn(cell);
            }
            value.write_into(cell);
        }
        chunk.mark_changed(index, self.clock.advance());
        Ok(())
    }

    /// Removes component `T` and returns its value.
    ///
    /// ## Errors
    /// `MissingComponent` if the entity has no `T`.
    pub fn remove_component<T: Component>(&mut self, entity: Entity) -> StoreResult<T> {
        let component = self.registry.id_of::<T>()?;
        let location = self.entities.location(entity)?;
        let owner = self.archetype_checked(location.archetype)?;
        let Some(index) = owner.layout().column_index(component) else {
            return Err(MissingComponentError { entity, component }.into());
        };
        owner.descs()[index].expect_type::<T>()?;

        let target = self.archetypes.archetype_without(location.archetype, component, &self.registry)?;
        self.sync_chunk(location.archetype, location.chunk)?;

        let owner = self.archetype_checked(location.archetype)?;
        let Some(chunk) = owner.chunk(location.chunk) else {
            return Err(MissingComponentError { entity, component }.into());
        };
        let cell = chunk.cell_ptr(&owner.layout().columns[index], location.row as usize);
        // SAFETY: live cell holding a `T`; ownership is settled below.
        let value = unsafe { ptr::read(cell.cast::<T>()) };

        match self.move_entity(entity, target, None, Some(component)) {
            Ok(_) => Ok(value),
            Err(error) => {
                // The cell still owns the value.
                mem::forget(value);
                Err(error)
            }
        }
    }

    /// Adds `component` zero-initialized. No-op if already present.
    ///
    /// ## Errors
    /// `ValueRequired` if the component owns resources.
    pub fn add_component_raw(&mut self, entity: Entity, component: ComponentID) -> StoreResult<()> {
        let desc = self.registry.metadata(component)?;
        if desc.is_managed() {
            return Err(StoreError::ValueRequired { component, name: desc.name });
        }
        let location = self.entities.location(entity)?;
        let target = self.archetypes.archetype_with(location.archetype, component, &self.registry)?;
        self.move_entity(entity, target, None, None).map(|_| ())
    }

    /// Adds `value` to the entity, or overwrites the existing value in place.
    ///
    /// ## Errors
    /// `TypeMismatch` if `value` was built against a registry that gives its
    /// component id a different type.
    pub fn add_component_value(&mut self, entity: Entity, value: ComponentValue) -> StoreResult<()> {
        value.check(&self.registry)?;
        let component = value.component_id();
        let location = self.entities.location(entity)?;
        if let Some(index) = self.archetype_checked(location.archetype)?.layout().column_index(component) {
            return self.overwrite(location, index, value);
        }
        let target = self.archetypes.archetype_with(location.archetype, component, &self.registry)?;
        self.move_entity(entity, target, Some(value), None).map(|_| ())
    }

    /// Removes `component`, dropping its value. No-op if absent.
    pub fn remove_component_raw(&mut self, entity: Entity, component: ComponentID) -> StoreResult<()> {
        self.registry.metadata(component)?;
        let location = self.entities.location(entity)?;
        let target = self.archetypes.archetype_without(location.archetype, component, &self.registry)?;
        self.move_entity(entity, target, None, None).map(|_| ())
    }
}
