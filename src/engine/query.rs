//! # Query Matcher
//!
//! Compiles include / exclude / intent predicates over component sets and
//! caches the archetypes that satisfy them.
//!
//! ## Matching
//! An archetype matches iff every included component is in its type set and no
//! excluded component is. Both tests are word-wise [`Signature`] operations.
//!
//! ## Incremental cache
//! A [`Query`] remembers the archetype creation version it last scanned up to.
//! Archetypes are append-only, so a stale cache only scans the archetypes created
//! since, appending new matches; already cached ids are never revisited, which
//! rules out duplicates.
//!
//! ## Iteration
//! [`QueryBatch`] is the chunk iteration surface handed to job layers: a
//! snapshot of matched chunks, each exposed as a [`ChunkView`] of column base
//! pointers, strides and row counts, plus the [`AccessToken`] ordering the batch
//! against other declared accesses. Match lists are snapshots; entities created
//! or moved afterwards do not appear in a batch already taken.

use std::any::{type_name, TypeId};
use std::marker::PhantomData;
use std::slice;

use crate::engine::archetype::{Archetype, ArchetypeTable};
use crate::engine::borrow::{AccessGuard, AccessToken};
use crate::engine::component::{ComponentDesc, TypeKey, TypeRegistry};
use crate::engine::entity::Entity;
use crate::engine::error::{StoreResult, TypeNotRegisteredError};
use crate::engine::types::{AccessMode, AccessSets, ArchetypeID, ChunkID, ChunkIndex, ComponentID, Signature};

/// Id-level query descriptor consumed from external collaborators.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct QueryDesc {
    /// Components that must be present.
    pub include: Vec<ComponentID>,
    /// Components that must be absent.
    pub exclude: Vec<ComponentID>,
    /// Access mode per component; an intent implies inclusion.
    pub intents: Vec<(ComponentID, AccessMode)>,
}

/// A compiled predicate plus its cache of matching archetypes.
///
/// ## Invariants
/// - `intents` is sorted by component and covers exactly the included set.
/// - `cache` holds each matching archetype with id `< scanned` exactly once,
///   in creation order.

#[derive(Clone, Debug)]
pub struct Query {
    include: Signature,
    exclude: Signature,
    intents: Box<[(ComponentID, AccessMode)]>,
    cache: Vec<ArchetypeID>,
    scanned: u64,
}

impl Query {
    /// Compiles a query.
    ///
    /// Intents add their component to the include set. Included components
    /// without an intent are read. If a component carries both intents, write
    /// wins.
    pub fn compile(include: &[ComponentID], exclude: &[ComponentID], intents: &[(ComponentID, AccessMode)]) -> Self {
        let mut merged: Vec<(ComponentID, AccessMode)> = include.iter().map(|&c| (c, AccessMode::Read)).collect();
        merged.extend_from_slice(intents);
        merged.sort_unstable_by_key(|&(c, mode)| (c, mode == AccessMode::Read));
        merged.dedup_by_key(|&mut (c, _)| c);

        let include = merged.iter().fold(Signature::default(), |mut s, &(c, _)| {
            s.set(c);
            s
        });
        Self {
            include,
            exclude: Signature::from_ids(exclude),
            intents: merged.into_boxed_slice(),
            cache: Vec::new(),
            scanned: 0,
        }
    }

    /// Compiles a query from an id-level descriptor.
    pub fn from_desc(desc: &QueryDesc) -> Self {
        Self::compile(&desc.include, &desc.exclude, &desc.intents)
    }

    /// Tests one archetype against the predicate.
    #[inline]
    pub fn matches(&self, archetype: &Archetype) -> bool {
        archetype.signature().contains_all(&self.include) && archetype.signature().is_disjoint(&self.exclude)
    }

    /// Archetypes matching the query, in creation order.
    ///
    /// Scans only archetypes created since the last call.
    pub fn matching_archetypes(&mut self, table: &ArchetypeTable) -> &[ArchetypeID] {
        let current = table.creation_version();
        if self.scanned < current {
            let (include, exclude) = (self.include, self.exclude);
            let fresh = &table.archetypes()[self.scanned as usize..];
            self.cache.extend(
                fresh
                    .iter()
                    .filter(|a| a.signature().contains_all(&include) && a.signature().is_disjoint(&exclude))
                    .map(Archetype::id),
            );
            self.scanned = current;
        }
        &self.cache
    }

    /// Snapshot of every non-empty chunk in matching archetypes.
    pub fn matching_chunks(&mut self, table: &ArchetypeTable) -> Vec<ChunkRef> {
        self.matching_archetypes(table);
        self.cache
            .iter()
            .filter_map(|&id| table.get(id))
            .flat_map(|archetype| {
                archetype.chunks().iter().enumerate().filter(|(_, c)| !c.is_empty()).map(move |(index, chunk)| ChunkRef {
                    archetype: archetype.id(),
                    index: index as ChunkIndex,
                    chunk: chunk.id(),
                    len: chunk.len(),
                })
            })
            .collect()
    }

    /// Number of entities currently matching.
    pub fn entity_count(&mut self, table: &ArchetypeTable) -> usize {
        self.matching_archetypes(table);
        self.cache.iter().filter_map(|&id| table.get(id)).map(Archetype::len).sum()
    }

    /// Creation version the cache is current with.
    #[inline]
    pub fn cached_version(&self) -> u64 {
        self.scanned
    }

    /// Per-component access modes, sorted by component.
    #[inline]
    pub fn intents(&self) -> &[(ComponentID, AccessMode)] {
        &self.intents
    }

    /// Included components.
    #[inline]
    pub fn include(&self) -> &Signature {
        &self.include
    }

    /// Excluded components.
    #[inline]
    pub fn exclude(&self) -> &Signature {
        &self.exclude
    }

    /// Read and write sets, as consumed by [`make_stages`](crate::engine::scheduler::make_stages).
    pub fn access_sets(&self) -> AccessSets {
        let mut sets = AccessSets::default();
        for &(component, mode) in self.intents.iter() {
            match mode {
                AccessMode::Read => sets.read.set(component),
                AccessMode::Write => sets.write.set(component),
            }
        }
        sets
    }
}

/// Position of a matched chunk.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChunkRef {
    /// Owning archetype.
    pub archetype: ArchetypeID,
    /// Index in the archetype's chunk list.
    pub index: ChunkIndex,
    /// Process-unique chunk id.
    pub chunk: ChunkID,
    /// Live rows at snapshot time.
    pub len: usize,
}

#[derive(Clone, Copy, Debug)]
enum Role {
    Read,
    Write,
    Without,
}

/// Typed builder resolving Rust component types against a registry.
///
/// ```ignore
/// let mut query = QueryBuilder::new()
///     .read::<Velocity>()
///     .write::<Position>()
///     .without::<Frozen>()
///     .build(&registry)?;
/// ```
#[derive(Default)]
pub struct QueryBuilder {
    terms: Vec<(TypeId, &'static str, Role)>,
}

impl QueryBuilder {
    /// Creates an empty builder.
    pub fn new() -> Self {
        Self { terms: Vec::new() }
    }

    /// Requires `T` with read access.
    pub fn read<T: 'static>(mut self) -> Self {
        self.terms.push((TypeId::of::<T>(), type_name::<T>(), Role::Read));
        self
    }

    /// Requires `T` with write access.
    pub fn write<T: 'static>(mut self) -> Self {
        self.terms.push((TypeId::of::<T>(), type_name::<T>(), Role::Write));
        self
    }

    /// Excludes archetypes carrying `T`.
    pub fn without<T: 'static>(mut self) -> Self {
        self.terms.push((TypeId::of::<T>(), type_name::<T>(), Role::Without));
        self
    }

    /// Resolves every term and compiles the query.
    ///
    /// ## Errors
    /// `TypeNotRegistered` for any term whose type is unknown to `registry`.
    pub fn build(self, registry: &TypeRegistry) -> StoreResult<Query> {
        let mut desc = QueryDesc::default();
        for (type_id, name, role) in self.terms {
            let component = registry
                .id_of_key(TypeKey::Rust(type_id))
                .ok_or(TypeNotRegisteredError::Type(name))?;
            match role {
                Role::Read => desc.intents.push((component, AccessMode::Read)),
                Role::Write => desc.intents.push((component, AccessMode::Write)),
                Role::Without => desc.exclude.push(component),
            }
        }
        Ok(Query::from_desc(&desc))
    }
}

/// Column of a [`ChunkView`]: base pointer, stride, and granted mode.
#[derive(Clone, Copy, Debug)]
pub struct ColumnView {
    /// Descriptor of the stored type.
    pub desc: ComponentDesc,
    /// Mode granted to the batch.
    pub mode: AccessMode,
    /// Address of row 0.
    pub base: *mut u8,
    /// Byte distance between rows.
    pub stride: usize,
}

/// One matched chunk as seen by a job.
pub struct ChunkView<'w> {
    chunk: ChunkID,
    archetype: ArchetypeID,
    len: usize,
    entities: *const Entity,
    columns: Box<[ColumnView]>,
    _world: PhantomData<&'w ()>,
}

// SAFETY: views of one batch address distinct chunks, and the batch token orders
// them against every other declared access to the same columns.
unsafe impl Send for ChunkView<'_> {}
// SAFETY: shared views only hand out read slices of read-intent columns.
unsafe impl Sync for ChunkView<'_> {}

impl<'w> ChunkView<'w> {
    pub(crate) fn new(
        archetype: &'w Archetype,
        index: ChunkIndex,
        intents: &[(ComponentID, AccessMode)],
    ) -> Option<Self> {
        let chunk = archetype.chunk(index)?;
        let layout = archetype.layout();
        let columns = intents
            .iter()
            .filter_map(|&(component, mode)| {
                let column_index = layout.column_index(component)?;
                let column = &layout.columns[column_index];
                Some(ColumnView {
                    desc: archetype.descs()[column_index],
                    mode,
                    base: chunk.cell_ptr(column, 0),
                    stride: column.size,
                })
            })
            .collect();
        Some(Self {
            chunk: chunk.id(),
            archetype: archetype.id(),
            len: chunk.len(),
            entities: chunk.entities(layout).as_ptr(),
            columns,
            _world: PhantomData,
        })
    }

    /// Id of the viewed chunk.
    #[inline]
    pub fn chunk_id(&self) -> ChunkID {
        self.chunk
    }

    /// Owning archetype.
    #[inline]
    pub fn archetype(&self) -> ArchetypeID {
        self.archetype
    }

    /// Live rows.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` when the chunk has no rows.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Handles of the rows, in row order.
    pub fn entities(&self) -> &[Entity] {
        // SAFETY: the hidden column holds `len` initialized handles and
        // structural changes are excluded for `'w`.
        unsafe { slice::from_raw_parts(self.entities, self.len) }
    }

    /// Raw column views in component order.
    #[inline]
    pub fn columns(&self) -> &[ColumnView] {
        &self.columns
    }

    /// Raw view of `component`.
    pub fn column(&self, component: ComponentID) -> Option<&ColumnView> {
        self.columns.iter().find(|c| c.desc.component_id == component)
    }

    /// Typed slice of a read-intent column.
    ///
    /// Returns `None` if the column is absent, granted for write, or stores
    /// a type other than `T`.
    pub fn read<T: 'static>(&self, component: ComponentID) -> Option<&[T]> {
        let column = self.column(component)?;
        if column.mode != AccessMode::Read || !column.desc.matches_type::<T>() {
            return None;
        }
        // SAFETY: type checked; rows `[0, len)` are initialized; no writer
        // exists for this column while the batch holds read access.
        Some(unsafe { slice::from_raw_parts(column.base.cast::<T>(), self.len) })
    }

    /// Typed mutable slice of a write-intent column.
    ///
    /// Returns `None` if the column is absent, granted for read, or stores
    /// a type other than `T`.
    pub fn write<T: 'static>(&mut self, component: ComponentID) -> Option<&mut [T]> {
        let column = *self.column(component)?;
        if column.mode != AccessMode::Write || !column.desc.matches_type::<T>() {
            return None;
        }
        // SAFETY: type checked; `&mut self` makes this the only live slice
        // derived from this view, and the batch holds write access.
        Some(unsafe { slice::from_raw_parts_mut(column.base.cast::<T>(), self.len) })
    }

    /// A read slice and a write slice of two distinct columns at once.
    pub fn read_write<R: 'static, W: 'static>(&mut self, read: ComponentID, write: ComponentID) -> Option<(&[R], &mut [W])> {
        if read == write {
            return None;
        }
        let (reads, len) = {
            let slice = self.read::<R>(read)?;
            (slice.as_ptr(), slice.len())
        };
        let writes = self.write::<W>(write)?;
        // SAFETY: distinct columns of one chunk never overlap.
        Some((unsafe { slice::from_raw_parts(reads, len) }, writes))
    }
}

/// A snapshot of matched chunks plus the access token covering them.
///
/// The token's dependencies are awaited before the first view is handed out.
/// The access is completed on [`complete`](Self::complete) or drop.

pub struct QueryBatch<'w> {
    guard: &'w AccessGuard,
    token: AccessToken,
    views: Vec<ChunkView<'w>>,
    ready: bool,
}

impl<'w> QueryBatch<'w> {
    pub(crate) fn new(guard: &'w AccessGuard, token: AccessToken, views: Vec<ChunkView<'w>>) -> Self {
        Self { guard, token, views, ready: false }
    }

    /// Access token of the batch.
    #[inline]
    pub fn token(&self) -> &AccessToken {
        &self.token
    }

    /// Number of matched chunks.
    #[inline]
    pub fn len(&self) -> usize {
        self.views.len()
    }

    /// Returns `true` if no chunk matched.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.views.is_empty()
    }

    /// Blocks until the batch's dependencies completed.
    pub fn wait(&mut self) {
        if !self.ready {
            self.guard.wait_for_dependencies(&self.token);
            self.ready = true;
        }
    }

    /// Matched chunks; waits for dependencies first.
    pub fn chunks(&mut self) -> &mut [ChunkView<'w>] {
        self.wait();
        &mut self.views
    }

    /// Completes the batch's access.
    pub fn complete(self) {
        drop(self);
    }
}

impl Drop for QueryBatch<'_> {
    fn drop(&mut self) {
        self.guard.complete_access(&self.token);
    }
}
