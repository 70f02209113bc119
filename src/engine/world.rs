//! # World
//!
//! The context object tying the store together: it owns the archetype table,
//! the entity table, the chunk allocator, the version clock, and a shared
//! handle to the concurrency guard, and it holds the type registry it was
//! configured with.
//!
//! ## Access discipline
//!
//! - `&mut World`: structural changes (see [`structural`](crate::engine::structural)),
//!   typed mutable access, deferred command application.
//! - `&World`: typed reads, change filters, and chunk iteration through
//!   [`QueryBatch`]es, which run on the rayon pool and are ordered against
//!   each other by the guard.
//!
//! ## Configuration
//!
//! [`WorldConfig`] is plain serde data so hosts can load it from their own
//! configuration files.

use std::mem::size_of;
use std::sync::Arc;

use parking_lot::Mutex;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::engine::archetype::{Archetype, ArchetypeTable};
use crate::engine::borrow::{AccessDeclaration, AccessGuard, ComponentRef, ViolationPolicy};
use crate::engine::chunk::{AllocatorStats, ChunkAllocator};
use crate::engine::commands::{Command, CommandBuffer};
use crate::engine::component::{Component, TypeRegistry};
use crate::engine::entity::{Entity, EntityLocation, EntityStore};
use crate::engine::error::{MissingComponentError, StoreError, StoreResult};
use crate::engine::query::{ChunkView, Query, QueryBatch};
use crate::engine::types::{
    AccessMode, ArchetypeID, ChunkID, ComponentID, EntityCount, Version, DEFAULT_CHUNK_BYTES,
};
use crate::engine::version::{changed_since, VersionClock};

/// Tunables of a [`World`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorldConfig {
    /// Byte budget of one chunk.
    pub chunk_byte_budget: usize,
    /// Ceiling on live chunks; `None` is unlimited.
    pub chunk_limit: Option<usize>,
    /// Ceiling on entity slots; `None` is unlimited.
    pub entity_limit: Option<EntityCount>,
    /// Reaction to direct accesses racing job accesses.
    pub violation_policy: ViolationPolicy,
}

impl Default for WorldConfig {
    fn default() -> Self {
        Self {
            chunk_byte_budget: DEFAULT_CHUNK_BYTES,
            chunk_limit: None,
            entity_limit: None,
            violation_policy: ViolationPolicy::default(),
        }
    }
}

impl WorldConfig {
    /// Sets the chunk byte budget.
    pub fn with_chunk_byte_budget(mut self, bytes: usize) -> Self {
        self.chunk_byte_budget = bytes;
        self
    }

    /// Sets the live-chunk ceiling.
    pub fn with_chunk_limit(mut self, limit: Option<usize>) -> Self {
        self.chunk_limit = limit;
        self
    }

    /// Sets the entity-slot ceiling.
    pub fn with_entity_limit(mut self, limit: Option<EntityCount>) -> Self {
        self.entity_limit = limit;
        self
    }

    /// Sets the violation policy.
    pub fn with_violation_policy(mut self, policy: ViolationPolicy) -> Self {
        self.violation_policy = policy;
        self
    }

    /// Checks that the configuration can produce chunk layouts.
    pub fn validate(&self) -> StoreResult<()> {
        if self.chunk_byte_budget < size_of::<Entity>() {
            return Err(StoreError::InvalidConfig("chunk_byte_budget cannot hold a single entity row"));
        }
        if self.chunk_limit == Some(0) {
            return Err(StoreError::InvalidConfig("chunk_limit must allow at least one chunk"));
        }
        Ok(())
    }
}

/// Archetype/chunk entity store.
pub struct World {
    pub(crate) registry: Arc<TypeRegistry>,
    pub(crate) archetypes: ArchetypeTable,
    pub(crate) entities: EntityStore,
    pub(crate) allocator: ChunkAllocator,
    pub(crate) clock: VersionClock,
    pub(crate) guard: Arc<AccessGuard>,
    deferred: Mutex<CommandBuffer>,
    config: WorldConfig,
}

impl World {
    /// Creates a world with the default configuration.
    pub fn new(registry: Arc<TypeRegistry>) -> Self {
        Self::build(registry, WorldConfig::default())
    }

    /// Creates a world after validating `config`.
    pub fn with_config(registry: Arc<TypeRegistry>, config: WorldConfig) -> StoreResult<Self> {
        config.validate()?;
        Ok(Self::build(registry, config))
    }

    fn build(registry: Arc<TypeRegistry>, config: WorldConfig) -> Self {
        debug!(?config, "world created");
        Self {
            registry,
            archetypes: ArchetypeTable::new(config.chunk_byte_budget),
            entities: EntityStore::new(config.entity_limit),
            allocator: ChunkAllocator::new(config.chunk_limit),
            clock: VersionClock::new(),
            guard: Arc::new(AccessGuard::new(config.violation_policy)),
            deferred: Mutex::new(CommandBuffer::new()),
            config,
        }
    }

    /// Registry this world resolves types against.
    #[inline]
    pub fn registry(&self) -> &Arc<TypeRegistry> {
        &self.registry
    }

    /// Active configuration.
    #[inline]
    pub fn config(&self) -> &WorldConfig {
        &self.config
    }

    /// Concurrency guard shared with job threads.
    #[inline]
    pub fn guard(&self) -> &Arc<AccessGuard> {
        &self.guard
    }

    /// Archetype table.
    #[inline]
    pub fn archetypes(&self) -> &ArchetypeTable {
        &self.archetypes
    }

    /// Singleton archetype for `types`, in any order.
    pub fn archetype_for(&mut self, types: &[ComponentID]) -> StoreResult<ArchetypeID> {
        self.archetypes.get_or_create(types, &self.registry)
    }

    /// Archetype by id.
    #[inline]
    pub fn archetype(&self, id: ArchetypeID) -> Option<&Archetype> {
        self.archetypes.get(id)
    }

    /// Returns `true` iff `entity` is live.
    #[inline]
    pub fn exists(&self, entity: Entity) -> bool {
        self.entities.exists(entity)
    }

    /// Current location of `entity`.
    #[inline]
    pub fn location(&self, entity: Entity) -> StoreResult<EntityLocation> {
        Ok(self.entities.location(entity)?)
    }

    /// Number of live entities.
    #[inline]
    pub fn len(&self) -> EntityCount {
        self.entities.len()
    }

    /// Returns `true` when no entity is live.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Iterates live handles in index order.
    pub fn entities(&self) -> impl Iterator<Item = Entity> + '_ {
        self.entities.iter()
    }

    /// Returns `true` if `entity` carries `component`.
    pub fn has(&self, entity: Entity, component: ComponentID) -> StoreResult<bool> {
        let location = self.entities.location(entity)?;
        Ok(self.archetype_checked(location.archetype)?.has(component))
    }

    /// Chunk allocator counters.
    pub fn allocator_stats(&self) -> AllocatorStats {
        self.allocator.stats()
    }

    /// Returns pooled chunk blocks to the system allocator.
    pub fn trim_chunk_pool(&self) -> usize {
        self.allocator.trim()
    }

    /// Resolves the cell of `component` for `entity`.
    fn cell(&self, entity: Entity, component: ComponentID) -> StoreResult<(*mut u8, ChunkID, usize)> {
        let location = self.entities.location(entity)?;
        let archetype = self.archetype_checked(location.archetype)?;
        let index = archetype
            .layout()
            .column_index(component)
            .ok_or(MissingComponentError { entity, component })?;
        let chunk = archetype
            .chunk(location.chunk)
            .ok_or(MissingComponentError { entity, component })?;
        Ok((chunk.cell_ptr(&archetype.layout().columns[index], location.row as usize), chunk.id(), index))
    }

    /// Shared reference to `entity`'s `T`.
    ///
    /// The reference holds a read access on its column until dropped; batches
    /// writing that column wait for it.
    pub fn get<T: Component>(&self, entity: Entity) -> StoreResult<ComponentRef<'_, T>> {
        let component = self.registry.id_of::<T>()?;
        self.registry.metadata(component)?.expect_type::<T>()?;
        let (cell, chunk, _) = self.cell(entity, component)?;
        let access = self.guard.hold_direct_read(chunk, component)?;
        // SAFETY: the cell is a live, aligned `T`. Structural changes need
        // `&mut self`, and job writes to the column wait for `access`.
        let value = unsafe { &*cell.cast::<T>() };
        Ok(ComponentRef::new(&self.guard, access, value))
    }

    /// Mutable reference to `entity`'s `T`; stamps the column as changed.
    pub fn get_mut<T: Component>(&mut self, entity: Entity) -> StoreResult<&mut T> {
        let component = self.registry.id_of::<T>()?;
        self.registry.metadata(component)?.expect_type::<T>()?;
        let (cell, chunk, index) = self.cell(entity, component)?;
        self.guard.acquire_direct(chunk, component, AccessMode::Write)?;
        if let Some((_, chunk)) = self.archetypes.chunk_by_id(chunk) {
            chunk.mark_changed(index, self.clock.advance());
        }
        // SAFETY: as in `get`, and `&mut self` makes the reference unique.
        Ok(unsafe { &mut *cell.cast::<T>() })
    }

    /// Latest issued change version.
    #[inline]
    pub fn current_version(&self) -> Version {
        self.clock.current()
    }

    /// Version at which `(chunk, component)` last changed; `0` if never or if
    /// the chunk is not live.
    pub fn last_changed(&self, chunk: ChunkID, component: ComponentID) -> Version {
        self.archetypes
            .chunk_by_id(chunk)
            .and_then(|(archetype, chunk)| Some(chunk.column_version(archetype.layout().column_index(component)?)))
            .unwrap_or(0)
    }

    /// Returns `true` if `(chunk, component)` changed after `since`.
    pub fn has_changed_since(&self, chunk: ChunkID, component: ComponentID, since: Version) -> bool {
        changed_since(self.last_changed(chunk, component), since)
    }

    /// Snapshots the chunks matching `query` and requests access to them.
    ///
    /// Write-intent columns are stamped with a fresh version at grant time.
    pub fn schedule(&self, query: &mut Query) -> QueryBatch<'_> {
        let matched = query.matching_archetypes(&self.archetypes).to_vec();
        let intents = query.intents();
        let writes = intents.iter().any(|&(_, mode)| mode == AccessMode::Write);
        let version = if writes { self.clock.advance() } else { self.clock.current() };

        let mut declarations = Vec::new();
        let mut views = Vec::new();
        for archetype in matched.iter().filter_map(|&id| self.archetypes.get(id)) {
            for (index, chunk) in archetype.chunks().iter().enumerate() {
                if chunk.is_empty() {
                    continue;
                }
                for &(component, mode) in intents {
                    declarations.push(AccessDeclaration::new(chunk.id(), component, mode));
                    if mode == AccessMode::Write {
                        if let Some(column) = archetype.layout().column_index(component) {
                            chunk.mark_changed(column, version);
                        }
                    }
                }
                views.extend(ChunkView::new(archetype, index as u32, intents));
            }
        }

        let token = self.guard.request_access(&declarations);
        QueryBatch::new(&self.guard, token, views)
    }

    /// Runs `f` on every matched chunk on the rayon pool.
    pub fn par_for_each_chunk<F>(&self, query: &mut Query, f: F)
    where
        F: Fn(&mut ChunkView<'_>) + Send + Sync,
    {
        let mut batch = self.schedule(query);
        batch.chunks().par_iter_mut().for_each(|view| f(view));
    }

    /// Runs `f` on every entity holding both `R` and `W`, chunks in parallel.
    pub fn par_for_each_read_write<R, W, F>(&self, f: F) -> StoreResult<()>
    where
        R: Component,
        W: Component,
        F: Fn(&R, &mut W) + Send + Sync,
    {
        let read = self.registry.id_of::<R>()?;
        let write = self.registry.id_of::<W>()?;
        let mut query = Query::compile(&[], &[], &[(read, AccessMode::Read), (write, AccessMode::Write)]);
        self.par_for_each_chunk(&mut query, |view| {
            if let Some((reads, writes)) = view.read_write::<R, W>(read, write) {
                reads.iter().zip(writes.iter_mut()).for_each(|(r, w)| f(r, w));
            }
        });
        Ok(())
    }

    /// Records a command for the next [`apply_deferred`](Self::apply_deferred).
    pub fn defer(&self, command: Command) {
        self.deferred.lock().push(command);
    }

    /// Applies every deferred command in recording order.
    pub fn apply_deferred(&mut self) -> StoreResult<Vec<Entity>> {
        let buffer = std::mem::take(self.deferred.get_mut());
        buffer.apply(self)
    }
}
