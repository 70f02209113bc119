//! # Archetype Manager
//!
//! Canonicalizes component-type sets into singleton [`Archetype`]s and owns each
//! archetype's list of chunks.
//!
//! ## Identity
//!
//! An archetype is identified by its sorted, duplicate-free list of component
//! ids. [`ArchetypeTable::get_or_create`] canonicalizes its input first, so any
//! permutation of the same set resolves to the same [`ArchetypeID`]. Archetypes
//! are never destroyed: ids stay valid for the life of the table, which lets
//! query caches hold plain ids.
//!
//! ## Creation version
//!
//! Every newly created archetype advances the table's creation version. Since
//! archetypes are append-only, the version equals the number of archetypes and
//! doubles as the index from which a stale query cache must resume scanning.
//!
//! ## Transition edges
//!
//! `archetype_with` / `archetype_without` are pure functions of the canonical
//! set. Results are memoized per `(archetype, component)` so repeated
//! add/remove traffic skips the canonicalize-and-hash step.
//!
//! ## Chunk bookkeeping
//!
//! - Each archetype keeps an open list of chunks with free rows.
//! - Empty chunks are released to the allocator immediately; the last chunk is
//!   swapped into the vacated slot, and the caller fixes the locations of the
//!   rows it carries.
//! - The table maps every live [`ChunkID`] to its `(archetype, index)` so the
//!   version and guard APIs can address chunks by id.

use std::collections::HashMap;

use tracing::debug;

use crate::engine::chunk::{Chunk, ChunkAllocator, ChunkLayout};
use crate::engine::component::{ComponentDesc, TypeRegistry};
use crate::engine::entity::Entity;
use crate::engine::error::{CapacityError, StoreResult};
use crate::engine::types::{ArchetypeID, ChunkID, ChunkIndex, ComponentID, RowID, Signature};

/// A canonical component-type set and the chunks storing its entities.
///
/// ## Invariants
/// - `types` is sorted and duplicate-free; `signature` has exactly those bits.
/// - `descs[i]` and `layout.columns[i]` describe `types[i]`.
/// - `open` lists exactly the chunks with `len < capacity`.
/// - No chunk in `chunks` is empty between structural operations.

pub struct Archetype {
    id: ArchetypeID,
    types: Box<[ComponentID]>,
    signature: Signature,
    descs: Box<[ComponentDesc]>,
    layout: ChunkLayout,
    chunks: Vec<Chunk>,
    open: Vec<ChunkIndex>,
    len: usize,
}

impl Archetype {
    fn new(id: ArchetypeID, types: Box<[ComponentID]>, descs: Box<[ComponentDesc]>, budget: usize) -> StoreResult<Self> {
        let layout = ChunkLayout::compute(&descs, budget)?;
        Ok(Self {
            id,
            signature: Signature::from_ids(&types),
            types,
            descs,
            layout,
            chunks: Vec::new(),
            open: Vec::new(),
            len: 0,
        })
    }

    /// Id of this archetype.
    #[inline]
    pub fn id(&self) -> ArchetypeID {
        self.id
    }

    /// Canonical component set.
    #[inline]
    pub fn types(&self) -> &[ComponentID] {
        &self.types
    }

    /// Component set as a bitset.
    #[inline]
    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    /// Descriptors parallel to [`types`](Self::types).
    #[inline]
    pub fn descs(&self) -> &[ComponentDesc] {
        &self.descs
    }

    /// Shared byte layout of this archetype's chunks.
    #[inline]
    pub fn layout(&self) -> &ChunkLayout {
        &self.layout
    }

    /// Returns `true` if the archetype stores `component`.
    #[inline]
    pub fn has(&self, component: ComponentID) -> bool {
        self.signature.has(component)
    }

    /// Chunks in list order.
    #[inline]
    pub fn chunks(&self) -> &[Chunk] {
        &self.chunks
    }

    /// Chunk at `index`.
    #[inline]
    pub fn chunk(&self, index: ChunkIndex) -> Option<&Chunk> {
        self.chunks.get(index as usize)
    }

    /// Number of live entities across all chunks.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` if no entity lives in this archetype.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// A chunk with a free row, if any.
    #[inline]
    pub fn open_chunk(&self) -> Option<ChunkIndex> {
        self.open.last().copied()
    }

    fn push_row(&mut self, allocator: &ChunkAllocator, entity: Entity) -> Result<(ChunkIndex, RowID, Option<ChunkID>), CapacityError> {
        let (index, fresh) = match self.open.last().copied() {
            Some(index) => (index, None),
            None => {
                let chunk = allocator.allocate(&self.layout)?;
                let id = chunk.id();
                self.chunks.push(chunk);
                let index = (self.chunks.len() - 1) as ChunkIndex;
                self.open.push(index);
                (index, Some(id))
            }
        };

        let chunk = &mut self.chunks[index as usize];
        let row = chunk.push_entity(&self.layout, entity);
        if chunk.is_full() {
            self.open.retain(|&i| i != index);
        }
        self.len += 1;
        Ok((index, row, fresh))
    }

    /// Compacts `row` out of chunk `index`, returning the entity moved into it.
    ///
    /// The values in `row` must have been moved out or dropped already.
    pub(crate) fn swap_remove_row(&mut self, index: ChunkIndex, row: RowID) -> Option<Entity> {
        let chunk = &mut self.chunks[index as usize];
        let was_full = chunk.is_full();
        let moved = chunk.swap_remove(&self.layout, row as usize);
        if was_full {
            self.open.push(index);
        }
        self.len -= 1;
        moved
    }

    /// Runs the destructor of every managed value in `row` whose component is
    /// not in `keep`.
    pub(crate) fn drop_row_values(&self, index: ChunkIndex, row: RowID, keep: Option<&Signature>) {
        let chunk = &self.chunks[index as usize];
        for column in &self.layout.columns {
            let Some(drop_fn) = column.drop_fn else { continue };
            if keep.is_some_and(|k| k.has(column.component)) {
                continue;
            }
            // SAFETY: `row` is live and holds an initialized value of this column.
            unsafe { drop_fn(chunk.cell_ptr(column, row as usize)) };
        }
    }

    pub(crate) fn set_row_entity(&mut self, index: ChunkIndex, row: RowID, entity: Entity) {
        self.chunks[index as usize].set_entity(&self.layout, row as usize, entity);
    }

    fn release_chunk(&mut self, index: ChunkIndex, allocator: &ChunkAllocator) -> (ChunkID, Option<ChunkID>) {
        let last = (self.chunks.len() - 1) as ChunkIndex;
        self.open.retain(|&i| i != index);
        let chunk = self.chunks.swap_remove(index as usize);
        let freed = chunk.id();
        allocator.free(chunk, &self.layout);

        let mut moved = None;
        if index != last {
            for open in self.open.iter_mut().filter(|i| **i == last) {
                *open = index;
            }
            moved = Some(self.chunks[index as usize].id());
        }
        (freed, moved)
    }
}

impl Drop for Archetype {
    fn drop(&mut self) {
        for chunk in &self.chunks {
            for column in &self.layout.columns {
                let Some(drop_fn) = column.drop_fn else { continue };
                for row in 0..chunk.len() {
                    // SAFETY: live rows hold initialized values.
                    unsafe { drop_fn(chunk.cell_ptr(column, row)) };
                }
            }
        }
    }
}

/// Result of releasing an empty chunk.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChunkRelease {
    /// Id of the chunk returned to the allocator.
    pub freed: ChunkID,
    /// Chunk swapped into the vacated list slot, whose rows need new locations.
    pub relocated: Option<ChunkIndex>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
enum Edge {
    With(ComponentID),
    Without(ComponentID),
}

/// All archetypes of a world, keyed by canonical type set.
pub struct ArchetypeTable {
    archetypes: Vec<Archetype>,
    by_types: HashMap<Box<[ComponentID]>, ArchetypeID>,
    edges: HashMap<(ArchetypeID, Edge), ArchetypeID>,
    chunk_map: HashMap<ChunkID, (ArchetypeID, ChunkIndex)>,
    chunk_budget: usize,
}

impl ArchetypeTable {
    /// Creates an empty table whose chunks use `chunk_budget` bytes.
    pub fn new(chunk_budget: usize) -> Self {
        Self {
            archetypes: Vec::new(),
            by_types: HashMap::new(),
            edges: HashMap::new(),
            chunk_map: HashMap::new(),
            chunk_budget,
        }
    }

    /// Returns the singleton archetype for `types` in any order, creating it
    /// on first use.
    ///
    /// ## Errors
    /// `TypeNotRegistered` if any id is unknown to `registry`.
    pub fn get_or_create(&mut self, types: &[ComponentID], registry: &TypeRegistry) -> StoreResult<ArchetypeID> {
        let mut canonical = types.to_vec();
        canonical.sort_unstable();
        canonical.dedup();

        if let Some(&id) = self.by_types.get(canonical.as_slice()) {
            return Ok(id);
        }

        let descs = canonical
            .iter()
            .map(|&component| registry.metadata(component))
            .collect::<StoreResult<Box<[ComponentDesc]>>>()?;

        let id = self.archetypes.len() as ArchetypeID;
        let types: Box<[ComponentID]> = canonical.into_boxed_slice();
        let archetype = Archetype::new(id, types.clone(), descs, self.chunk_budget)?;
        debug!(
            archetype = id,
            components = ?archetype.types(),
            capacity = archetype.layout().capacity,
            "archetype created"
        );

        self.archetypes.push(archetype);
        self.by_types.insert(types, id);
        Ok(id)
    }

    /// Looks up the archetype for `types` without creating it.
    pub fn find(&self, types: &[ComponentID]) -> Option<ArchetypeID> {
        let mut canonical = types.to_vec();
        canonical.sort_unstable();
        canonical.dedup();
        self.by_types.get(canonical.as_slice()).copied()
    }

    /// Archetype holding the set of `id` plus `added`.
    pub fn archetype_with(&mut self, id: ArchetypeID, added: ComponentID, registry: &TypeRegistry) -> StoreResult<ArchetypeID> {
        self.transition(id, Edge::With(added), registry)
    }

    /// Archetype holding the set of `id` minus `removed`.
    pub fn archetype_without(&mut self, id: ArchetypeID, removed: ComponentID, registry: &TypeRegistry) -> StoreResult<ArchetypeID> {
        self.transition(id, Edge::Without(removed), registry)
    }

    fn transition(&mut self, id: ArchetypeID, edge: Edge, registry: &TypeRegistry) -> StoreResult<ArchetypeID> {
        if let Some(&target) = self.edges.get(&(id, edge)) {
            return Ok(target);
        }

        let source = &self.archetypes[id as usize];
        let types: Vec<ComponentID> = match edge {
            Edge::With(added) if source.has(added) => return Ok(id),
            Edge::Without(removed) if !source.has(removed) => return Ok(id),
            Edge::With(added) => source.types().iter().copied().chain(std::iter::once(added)).collect(),
            Edge::Without(removed) => source.types().iter().copied().filter(|&c| c != removed).collect(),
        };

        let target = self.get_or_create(&types, registry)?;
        self.edges.insert((id, edge), target);
        Ok(target)
    }

    /// Appends a row owned by `entity` to `archetype`, allocating a chunk when
    /// every existing chunk is full.
    pub fn push_row(&mut self, archetype: ArchetypeID, entity: Entity, allocator: &ChunkAllocator) -> Result<(ChunkIndex, RowID), CapacityError> {
        let (index, row, fresh) = self.archetypes[archetype as usize].push_row(allocator, entity)?;
        if let Some(chunk) = fresh {
            self.chunk_map.insert(chunk, (archetype, index));
        }
        Ok((index, row))
    }

    /// Releases chunk `index` of `archetype` if it has no live rows.
    pub fn release_if_empty(&mut self, archetype: ArchetypeID, index: ChunkIndex, allocator: &ChunkAllocator) -> Option<ChunkRelease> {
        let owner = &mut self.archetypes[archetype as usize];
        if !owner.chunk(index)?.is_empty() {
            return None;
        }

        let (freed, moved) = owner.release_chunk(index, allocator);
        self.chunk_map.remove(&freed);
        if let Some(moved) = moved {
            self.chunk_map.insert(moved, (archetype, index));
        }
        Some(ChunkRelease { freed, relocated: moved.map(|_| index) })
    }

    /// Archetype by id.
    #[inline]
    pub fn get(&self, id: ArchetypeID) -> Option<&Archetype> {
        self.archetypes.get(id as usize)
    }

    #[inline]
    pub(crate) fn get_mut(&mut self, id: ArchetypeID) -> Option<&mut Archetype> {
        self.archetypes.get_mut(id as usize)
    }

    /// All archetypes in creation order.
    #[inline]
    pub fn archetypes(&self) -> &[Archetype] {
        &self.archetypes
    }

    /// Number of archetypes.
    #[inline]
    pub fn len(&self) -> usize {
        self.archetypes.len()
    }

    /// Returns `true` if no archetype exists.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.archetypes.is_empty()
    }

    /// Advances once per archetype creation.
    #[inline]
    pub fn creation_version(&self) -> u64 {
        self.archetypes.len() as u64
    }

    /// Resolves a live chunk id to `(archetype, index)`.
    #[inline]
    pub fn locate_chunk(&self, chunk: ChunkID) -> Option<(ArchetypeID, ChunkIndex)> {
        self.chunk_map.get(&chunk).copied()
    }

    /// Resolves a live chunk id to its archetype and chunk.
    pub fn chunk_by_id(&self, chunk: ChunkID) -> Option<(&Archetype, &Chunk)> {
        let (archetype, index) = self.locate_chunk(chunk)?;
        let archetype = self.get(archetype)?;
        Some((archetype, archetype.chunk(index)?))
    }
}
