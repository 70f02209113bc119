//! # Chunk Allocator
//!
//! Fixed-size memory blocks carved into per-component column arrays.
//!
//! ## Layout
//!
//! A chunk is one aligned allocation holding `capacity` rows of an archetype in
//! structure-of-arrays form:
//!
//! ```text
//! [ Entity column | column(c0) | pad | column(c1) | pad | ... ]
//! ```
//!
//! - The hidden `Entity` column maps row → owning handle.
//! - Columns follow in ascending component id order; each column starts at an
//!   offset aligned to its component's alignment.
//! - `capacity = floor(budget / stride)` where `stride` is the sum of the
//!   component sizes plus `size_of::<Entity>()`; capacity shrinks while column
//!   padding would overflow the budget, and never drops below one row.
//!
//! ## Pools
//!
//! Blocks are recycled through size-class pools keyed by
//! `(block_size, block_align)`. Every archetype whose rows fit the budget uses
//! the same size class, so a block freed by one archetype can back a chunk of
//! any other. Rows larger than the budget get a dedicated, larger size class.
//!
//! ## Invariants
//!
//! - Blocks handed out by [`ChunkAllocator::allocate`] are zero-filled.
//! - Columns of managed types are zeroed again on [`ChunkAllocator::free`].
//! - Every handed-out chunk carries a fresh [`ChunkID`]; ids are never reused.

use std::alloc::{self, Layout};
use std::collections::HashMap;
use std::mem::{align_of, size_of};
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use parking_lot::Mutex;
use tracing::debug;

use crate::engine::component::{ComponentDesc, DropFn};
use crate::engine::entity::Entity;
use crate::engine::error::{CapacityError, CapacityResource, StoreError, StoreResult};
use crate::engine::types::{ChunkID, ComponentID, RowID, Version, CHUNK_ALIGN};

#[inline]
const fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

/// Position and shape of one component column inside a chunk.
#[derive(Clone, Copy, Debug)]
pub struct ColumnLayout {
    /// Component stored in the column.
    pub component: ComponentID,
    /// Byte offset of row 0 from the chunk base.
    pub offset: usize,
    /// Distance in bytes between consecutive rows.
    pub size: usize,
    /// Alignment of the column start.
    pub align: usize,
    /// Destruction for managed values.
    pub drop_fn: Option<DropFn>,
}

/// Byte layout shared by every chunk of one archetype.
#[derive(Clone, Debug)]
pub struct ChunkLayout {
    /// Rows per chunk.
    pub capacity: usize,
    /// Columns sorted by component id.
    pub columns: Vec<ColumnLayout>,
    /// Offset of the hidden entity column.
    pub entity_offset: usize,
    /// Sum of component sizes plus per-row metadata.
    pub stride: usize,
    /// Size and alignment of the backing block (its size class).
    pub block: Layout,
}

impl ChunkLayout {
    /// Computes the layout of an archetype whose components are `descs`,
    /// sorted by id, for a chunk of `budget` bytes.
    pub fn compute(descs: &[ComponentDesc], budget: usize) -> StoreResult<Self> {
        let stride = descs.iter().map(|d| d.size).sum::<usize>() + size_of::<Entity>();
        let block_align = descs.iter().map(|d| d.align).fold(CHUNK_ALIGN, usize::max);

        let mut capacity = (budget / stride).max(1);
        let (mut columns, mut used) = Self::place(descs, capacity);
        while used > budget && capacity > 1 {
            capacity -= 1;
            (columns, used) = Self::place(descs, capacity);
        }

        let block = Layout::from_size_align(align_up(used.max(budget), block_align), block_align)
            .map_err(|_| StoreError::InvalidConfig("chunk layout exceeds addressable memory"))?;

        Ok(Self { capacity, columns, entity_offset: 0, stride, block })
    }

    // The entity column sits at offset 0.
    fn place(descs: &[ComponentDesc], capacity: usize) -> (Vec<ColumnLayout>, usize) {
        let mut cursor = size_of::<Entity>() * capacity;
        let mut columns = Vec::with_capacity(descs.len());
        for desc in descs {
            cursor = align_up(cursor, desc.align);
            columns.push(ColumnLayout {
                component: desc.component_id,
                offset: cursor,
                size: desc.size,
                align: desc.align,
                drop_fn: desc.traits.drop_fn,
            });
            cursor += desc.size * capacity;
        }
        (columns, cursor)
    }

    /// Index of `component` in [`columns`](Self::columns).
    #[inline]
    pub fn column_index(&self, component: ComponentID) -> Option<usize> {
        self.columns.binary_search_by_key(&component, |c| c.component).ok()
    }

    /// Size class of the backing block.
    #[inline]
    pub fn size_class(&self) -> (usize, usize) {
        (self.block.size(), self.block.align())
    }
}

/// An owned, aligned, raw block of chunk memory.
pub struct ChunkMemory {
    ptr: NonNull<u8>,
    layout: Layout,
}

// SAFETY: the block is plain memory; access is coordinated by the world and
// the concurrency guard.
unsafe impl Send for ChunkMemory {}
// SAFETY: see above.
unsafe impl Sync for ChunkMemory {}

impl ChunkMemory {
    fn zeroed(layout: Layout) -> Self {
        // SAFETY: `layout` has non-zero size (at least one entity row).
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        match NonNull::new(raw) {
            Some(ptr) => Self { ptr, layout },
            None => alloc::handle_alloc_error(layout),
        }
    }

    fn clear(&mut self) {
        // SAFETY: the block spans `layout.size()` writable bytes.
        unsafe { ptr::write_bytes(self.ptr.as_ptr(), 0, self.layout.size()) }
    }

    #[inline]
    fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }
}

impl Drop for ChunkMemory {
    fn drop(&mut self) {
        // SAFETY: allocated with exactly this layout in `zeroed`.
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) }
    }
}

/// A live chunk: a memory block plus row count and per-column change versions.
///
/// ## Invariants
/// - Rows `[0, len)` are initialized and contiguous; `len <= capacity`.
/// - `versions[i]` is the last-changed version of `layout.columns[i]`.

pub struct Chunk {
    id: ChunkID,
    len: usize,
    capacity: usize,
    memory: ChunkMemory,
    versions: Box<[AtomicU64]>,
}

impl Chunk {
    /// Process-unique id of this chunk.
    #[inline]
    pub fn id(&self) -> ChunkID {
        self.id
    }

    /// Number of live rows.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` when no row is live.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Rows the chunk can hold.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Returns `true` when every row is live.
    #[inline]
    pub fn is_full(&self) -> bool {
        self.len == self.capacity
    }

    /// Base address of the block.
    #[inline]
    pub fn base_ptr(&self) -> *mut u8 {
        self.memory.as_ptr()
    }

    /// Address of `row` within `column`.
    ///
    /// The pointer is only meaningful for `row < capacity`.
    #[inline]
    pub fn cell_ptr(&self, column: &ColumnLayout, row: usize) -> *mut u8 {
        debug_assert!(row < self.capacity);
        self.base_ptr().wrapping_add(column.offset + row * column.size)
    }

    fn entity_ptr(&self, layout: &ChunkLayout) -> *mut Entity {
        self.base_ptr().wrapping_add(layout.entity_offset).cast::<Entity>()
    }

    /// Handle stored in the hidden column at `row`.
    pub fn entity(&self, layout: &ChunkLayout, row: usize) -> Option<Entity> {
        if row >= self.len {
            return None;
        }
        // SAFETY: row is live; entity column is aligned for `Entity`.
        Some(unsafe { self.entity_ptr(layout).add(row).read() })
    }

    /// Live handles of this chunk, in row order.
    pub fn entities<'a>(&'a self, layout: &ChunkLayout) -> &'a [Entity] {
        // SAFETY: rows `[0, len)` of the entity column are initialized.
        unsafe { std::slice::from_raw_parts(self.entity_ptr(layout), self.len) }
    }

    /// Appends a row owned by `entity` and returns its index.
    ///
    /// Component cells of the new row are left as-is; the caller initializes them.
    pub(crate) fn push_entity(&mut self, layout: &ChunkLayout, entity: Entity) -> RowID {
        debug_assert!(!self.is_full());
        let row = self.len;
        // SAFETY: `row < capacity`.
        unsafe { self.entity_ptr(layout).add(row).write(entity) };
        self.len += 1;
        row as RowID
    }

    pub(crate) fn set_entity(&mut self, layout: &ChunkLayout, row: usize, entity: Entity) {
        debug_assert!(row < self.len);
        // SAFETY: `row` is live.
        unsafe { self.entity_ptr(layout).add(row).write(entity) };
    }

    /// Removes `row` by moving the last row into it.
    ///
    /// Performs a raw byte move; values in `row` must already have been moved
    /// out or dropped. Returns the entity relocated into `row`, if any.
    pub(crate) fn swap_remove(&mut self, layout: &ChunkLayout, row: usize) -> Option<Entity> {
        debug_assert!(row < self.len);
        let last = self.len - 1;
        let mut moved = None;
        if row != last {
            for column in &layout.columns {
                let src = self.cell_ptr(column, last);
                let dst = self.cell_ptr(column, row);
                // SAFETY: distinct rows of the same column never overlap.
                unsafe { ptr::copy_nonoverlapping(src, dst, column.size) };
            }
            // SAFETY: `last` and `row` are live rows.
            unsafe {
                let entity = self.entity_ptr(layout).add(last).read();
                self.entity_ptr(layout).add(row).write(entity);
                moved = Some(entity);
            }
        }
        self.len = last;
        moved
    }

    /// Last-changed version of column `index`.
    #[inline]
    pub fn column_version(&self, index: usize) -> Version {
        self.versions.get(index).map_or(0, |v| v.load(Ordering::Acquire))
    }

    /// Raises the version of column `index` to `version`.
    #[inline]
    pub fn mark_changed(&self, index: usize, version: Version) {
        if let Some(v) = self.versions.get(index) {
            v.fetch_max(version, Ordering::AcqRel);
        }
    }

    /// Raises the version of every column to `version`.
    pub fn mark_all_changed(&self, version: Version) {
        for v in self.versions.iter() {
            v.fetch_max(version, Ordering::AcqRel);
        }
    }
}

/// Snapshot of allocator bookkeeping.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AllocatorStats {
    /// Chunks currently handed out.
    pub live: usize,
    /// Blocks waiting in pools.
    pub pooled: usize,
    /// Blocks ever obtained from the system allocator.
    pub allocated_total: usize,
}

/// Hands out zeroed chunk blocks and recycles freed ones by size class.
pub struct ChunkAllocator {
    pools: Mutex<HashMap<(usize, usize), Vec<ChunkMemory>>>,
    live: AtomicUsize,
    allocated_total: AtomicUsize,
    next_id: AtomicU64,
    limit: Option<usize>,
}

impl ChunkAllocator {
    /// Creates an allocator bounded to `limit` live chunks.
    pub fn new(limit: Option<usize>) -> Self {
        Self {
            pools: Mutex::new(HashMap::new()),
            live: AtomicUsize::new(0),
            allocated_total: AtomicUsize::new(0),
            next_id: AtomicU64::new(0),
            limit,
        }
    }

    /// Returns a zero-initialized chunk for `layout`.
    ///
    /// ## Errors
    /// `CapacityExceeded` when the live-chunk limit is reached.
    pub fn allocate(&self, layout: &ChunkLayout) -> Result<Chunk, CapacityError> {
        let live = self.live.load(Ordering::Acquire);
        if let Some(limit) = self.limit {
            if live >= limit {
                return Err(CapacityError {
                    resource: CapacityResource::Chunks,
                    requested: live as u64 + 1,
                    limit: limit as u64,
                });
            }
        }

        let pooled = self.pools.lock().get_mut(&layout.size_class()).and_then(Vec::pop);
        let memory = match pooled {
            Some(mut memory) => {
                memory.clear();
                memory
            }
            None => {
                self.allocated_total.fetch_add(1, Ordering::Relaxed);
                ChunkMemory::zeroed(layout.block)
            }
        };

        self.live.fetch_add(1, Ordering::AcqRel);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        debug!(chunk = id, block_size = layout.block.size(), capacity = layout.capacity, "chunk allocated");

        Ok(Chunk {
            id,
            len: 0,
            capacity: layout.capacity,
            memory,
            versions: (0..layout.columns.len()).map(|_| AtomicU64::new(0)).collect(),
        })
    }

    /// Returns an empty chunk's block to its size-class pool.
    ///
    /// Columns of managed types are zeroed so no stale resource handle
    /// survives into the next user of the block.
    pub fn free(&self, chunk: Chunk, layout: &ChunkLayout) {
        debug_assert!(chunk.is_empty(), "freeing a chunk with live rows");
        let Chunk { id, memory, .. } = chunk;
        for column in layout.columns.iter().filter(|c| c.drop_fn.is_some()) {
            // SAFETY: the column lies within the block.
            unsafe { ptr::write_bytes(memory.as_ptr().add(column.offset), 0, column.size * layout.capacity) };
        }
        self.pools.lock().entry(layout.size_class()).or_default().push(memory);
        self.live.fetch_sub(1, Ordering::AcqRel);
        debug!(chunk = id, "chunk released to pool");
    }

    /// Releases every pooled block to the system allocator.
    pub fn trim(&self) -> usize {
        let mut pools = self.pools.lock();
        let released = pools.values().map(Vec::len).sum();
        pools.clear();
        debug!(released, "chunk pools trimmed");
        released
    }

    /// Current bookkeeping counters.
    pub fn stats(&self) -> AllocatorStats {
        AllocatorStats {
            live: self.live.load(Ordering::Acquire),
            pooled: self.pools.lock().values().map(Vec::len).sum(),
            allocated_total: self.allocated_total.load(Ordering::Relaxed),
        }
    }

    /// Configured live-chunk limit.
    pub fn limit(&self) -> Option<usize> {
        self.limit
    }
}

impl Default for ChunkAllocator {
    fn default() -> Self {
        Self::new(None)
    }
}

const _: () = assert!(align_of::<Entity>() <= CHUNK_ALIGN);
