//! # Blob Asset Allocator
//!
//! Immutable, relocatable binary graphs shared across entities.
//!
//! ## Relocation
//!
//! A blob is one contiguous byte buffer. Internal references are
//! [`BlobPtr`] / [`BlobArray`] values holding **byte offsets from the buffer
//! start**, never addresses, so the buffer stays valid after being copied,
//! memory-mapped or sent elsewhere. Only `Pod` data goes into a blob.
//!
//! ## Byte format
//!
//! ```text
//! [u32 payload length][u64 root type hash][payload bytes]
//! ```
//!
//! Both header fields are little-endian. The root value sits at offset 0 of the
//! payload. The root type hash is FNV-1a over the root type's name, size and
//! alignment; deserializing with a different root type fails with
//! `SerializationFormatMismatch`.
//!
//! ## Lifetime
//!
//! [`BlobAssetReference`] is a refcounted handle; the buffer is freed when the
//! last handle drops. [`BlobStore`] deduplicates identical blobs by content
//! hash without keeping them alive.

use std::any::type_name;
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::mem::{align_of, size_of};
use std::sync::{Arc, Weak};

use bytemuck::{Pod, Zeroable};
use parking_lot::Mutex;
use tracing::debug;

use crate::engine::error::{BlobError, FormatMismatchError, StoreResult};

/// Alignment guaranteed for every blob buffer, and the maximum alignment of
/// values stored in one.
pub const BLOB_ALIGN: usize = 16;

/// Bytes in the serialized header.
pub const BLOB_HEADER_LEN: usize = 4 + 8;

const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

fn fnv1a(mut hash: u64, bytes: &[u8]) -> u64 {
    for &byte in bytes {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// Stable hash identifying a root type in the blob header.
pub fn root_type_hash<R: 'static>() -> u64 {
    let hash = fnv1a(FNV_OFFSET, type_name::<R>().as_bytes());
    let hash = fnv1a(hash, &(size_of::<R>() as u64).to_le_bytes());
    fnv1a(hash, &(align_of::<R>() as u64).to_le_bytes())
}

/// Offset reference to one `T` inside the same blob.
#[repr(C)]
pub struct BlobPtr<T> {
    offset: u32,
    _marker: PhantomData<T>,
}

impl<T> BlobPtr<T> {
    /// Byte offset from the buffer start.
    #[inline]
    pub fn offset(&self) -> u32 {
        self.offset
    }
}

impl<T> Clone for BlobPtr<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T> Copy for BlobPtr<T> {}

impl<T> fmt::Debug for BlobPtr<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlobPtr<{}>(+{})", type_name::<T>(), self.offset)
    }
}

impl<T> PartialEq for BlobPtr<T> {
    fn eq(&self, other: &Self) -> bool {
        self.offset == other.offset
    }
}
impl<T> Eq for BlobPtr<T> {}

// SAFETY: `repr(C)` over a single `u32` plus a zero-sized marker; every bit
// pattern is valid and there is no padding.
unsafe impl<T: 'static> Zeroable for BlobPtr<T> {}
// SAFETY: see above.
unsafe impl<T: 'static> Pod for BlobPtr<T> {}

/// Offset reference to a contiguous run of `T` inside the same blob.
#[repr(C)]
pub struct BlobArray<T> {
    offset: u32,
    len: u32,
    _marker: PhantomData<T>,
}

impl<T> BlobArray<T> {
    /// Byte offset of the first element.
    #[inline]
    pub fn offset(&self) -> u32 {
        self.offset
    }

    /// Number of elements.
    #[inline]
    pub fn len(&self) -> usize {
        self.len as usize
    }

    /// Returns `true` for an empty run.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl<T> Clone for BlobArray<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T> Copy for BlobArray<T> {}

impl<T> fmt::Debug for BlobArray<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlobArray<{}>(+{}, len {})", type_name::<T>(), self.offset, self.len)
    }
}

impl<T> PartialEq for BlobArray<T> {
    fn eq(&self, other: &Self) -> bool {
        self.offset == other.offset && self.len == other.len
    }
}
impl<T> Eq for BlobArray<T> {}

// SAFETY: `repr(C)` over two `u32`s plus a zero-sized marker.
unsafe impl<T: 'static> Zeroable for BlobArray<T> {}
// SAFETY: see above.
unsafe impl<T: 'static> Pod for BlobArray<T> {}

/// One aligned storage unit of a blob buffer.
#[derive(Clone, Copy)]
#[repr(C, align(16))]
struct Block([u8; BLOB_ALIGN]);

// SAFETY: plain bytes with no padding (size equals alignment).
unsafe impl Zeroable for Block {}
// SAFETY: see above.
unsafe impl Pod for Block {}

fn check_align<T>() -> Result<(), BlobError> {
    if align_of::<T>() > BLOB_ALIGN {
        return Err(BlobError::AlignmentTooLarge { align: align_of::<T>(), max: BLOB_ALIGN });
    }
    Ok(())
}

/// Append-only writer producing a blob payload.
#[derive(Debug, Default)]
pub struct BlobBuilder {
    bytes: Vec<u8>,
}

impl BlobBuilder {
    fn reserve<T>(&mut self, count: usize) -> Result<u32, BlobError> {
        check_align::<T>()?;
        let start = self.bytes.len().next_multiple_of(align_of::<T>());
        let end = start + size_of::<T>() * count;
        if end > u32::MAX as usize {
            return Err(BlobError::TooLarge { max: u32::MAX as usize });
        }
        self.bytes.resize(end, 0);
        Ok(start as u32)
    }

    /// Appends `value` and returns a reference to it.
    pub fn allocate<T: Pod>(&mut self, value: T) -> Result<BlobPtr<T>, BlobError> {
        let offset = self.reserve::<T>(1)?;
        let start = offset as usize;
        self.bytes[start..start + size_of::<T>()].copy_from_slice(bytemuck::bytes_of(&value));
        Ok(BlobPtr { offset, _marker: PhantomData })
    }

    /// Appends `values` contiguously and returns a reference to the run.
    pub fn allocate_array<T: Pod>(&mut self, values: &[T]) -> Result<BlobArray<T>, BlobError> {
        let offset = self.reserve::<T>(values.len())?;
        let start = offset as usize;
        let bytes: &[u8] = bytemuck::cast_slice(values);
        self.bytes[start..start + bytes.len()].copy_from_slice(bytes);
        Ok(BlobArray { offset, len: values.len() as u32, _marker: PhantomData })
    }

    /// Overwrites a previously allocated value.
    pub fn set<T: Pod>(&mut self, ptr: BlobPtr<T>, value: T) {
        let start = ptr.offset as usize;
        if let Some(slot) = self.bytes.get_mut(start..start + size_of::<T>()) {
            slot.copy_from_slice(bytemuck::bytes_of(&value));
        }
    }

    /// Payload bytes written so far.
    #[inline]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Returns `true` if nothing was written.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

struct BlobData {
    blocks: Box<[Block]>,
    len: usize,
    root_hash: u64,
    content_hash: u64,
}

impl BlobData {
    fn from_payload(payload: &[u8], root_hash: u64) -> Self {
        let mut blocks = vec![Block([0; BLOB_ALIGN]); payload.len().div_ceil(BLOB_ALIGN)].into_boxed_slice();
        bytemuck::cast_slice_mut::<Block, u8>(&mut blocks)[..payload.len()].copy_from_slice(payload);
        let content_hash = fnv1a(fnv1a(FNV_OFFSET, &root_hash.to_le_bytes()), payload);
        Self { blocks, len: payload.len(), root_hash, content_hash }
    }

    #[inline]
    fn bytes(&self) -> &[u8] {
        &bytemuck::cast_slice::<Block, u8>(&self.blocks)[..self.len]
    }
}

/// Refcounted handle to an immutable blob whose root value is an `R`.
pub struct BlobAssetReference<R> {
    data: Arc<BlobData>,
    _marker: PhantomData<fn() -> R>,
}

impl<R> Clone for BlobAssetReference<R> {
    fn clone(&self) -> Self {
        Self { data: Arc::clone(&self.data), _marker: PhantomData }
    }
}

impl<R> fmt::Debug for BlobAssetReference<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlobAssetReference")
            .field("root", &type_name::<R>())
            .field("len", &self.data.len)
            .field("content_hash", &format_args!("{:#018x}", self.data.content_hash))
            .finish()
    }
}

impl<R: Pod> BlobAssetReference<R> {
    /// Builds a blob. The root slot is reserved at offset 0 and filled with the
    /// value `writer` returns; `writer` appends everything the root references.
    pub fn build<F>(writer: F) -> StoreResult<Self>
    where
        F: FnOnce(&mut BlobBuilder) -> StoreResult<R>,
    {
        let mut builder = BlobBuilder::default();
        let root = builder.allocate(R::zeroed())?;
        let value = writer(&mut builder)?;
        builder.set(root, value);

        let data = BlobData::from_payload(&builder.bytes, root_type_hash::<R>());
        debug!(root = type_name::<R>(), bytes = data.len, "blob built");
        Ok(Self { data: Arc::new(data), _marker: PhantomData })
    }

    /// The root value.
    pub fn value(&self) -> &R {
        bytemuck::from_bytes(&self.data.bytes()[..size_of::<R>()])
    }

    /// Dereferences an offset reference of this blob.
    pub fn resolve<T: Pod>(&self, ptr: BlobPtr<T>) -> Result<&T, BlobError> {
        let start = ptr.offset as usize;
        self.data
            .bytes()
            .get(start..start + size_of::<T>())
            .and_then(|bytes| bytemuck::try_from_bytes(bytes).ok())
            .ok_or(BlobError::OutOfBounds { offset: ptr.offset, bytes: size_of::<T>(), len: self.data.len })
    }

    /// Dereferences an offset array of this blob.
    pub fn resolve_array<T: Pod>(&self, array: BlobArray<T>) -> Result<&[T], BlobError> {
        let start = array.offset as usize;
        let bytes = size_of::<T>() * array.len();
        if array.is_empty() {
            return Ok(&[]);
        }
        self.data
            .bytes()
            .get(start..start + bytes)
            .and_then(|slice| bytemuck::try_cast_slice(slice).ok())
            .ok_or(BlobError::OutOfBounds { offset: array.offset, bytes, len: self.data.len })
    }

    /// Encodes the blob as `[u32 len][u64 root hash][payload]`.
    pub fn serialize_to_bytes(&self) -> Vec<u8> {
        let payload = self.data.bytes();
        let mut out = Vec::with_capacity(BLOB_HEADER_LEN + payload.len());
        out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        out.extend_from_slice(&self.data.root_hash.to_le_bytes());
        out.extend_from_slice(payload);
        out
    }

    /// Decodes bytes produced by [`serialize_to_bytes`](Self::serialize_to_bytes)
    /// from any address, copying the payload into a fresh aligned buffer.
    ///
    /// ## Errors
    /// `SerializationFormatMismatch` if the header is truncated, names another
    /// root type, or declares a length other than the bytes that follow.
    pub fn deserialize_from_bytes(bytes: &[u8]) -> StoreResult<Self> {
        check_align::<R>()?;
        if bytes.len() < BLOB_HEADER_LEN {
            return Err(FormatMismatchError::Truncated { length: bytes.len(), header: BLOB_HEADER_LEN }.into());
        }
        let (header, payload) = bytes.split_at(BLOB_HEADER_LEN);
        let declared: u32 = bytemuck::pod_read_unaligned(&header[..4]);
        let declared = u32::from_le(declared);
        let found = u64::from_le(bytemuck::pod_read_unaligned(&header[4..]));

        let expected = root_type_hash::<R>();
        if found != expected {
            return Err(FormatMismatchError::RootType { expected, found }.into());
        }
        if declared as usize != payload.len() {
            return Err(FormatMismatchError::Length { declared, actual: payload.len() }.into());
        }
        if payload.len() < size_of::<R>() {
            return Err(FormatMismatchError::RootOutOfBounds { payload: payload.len(), root: size_of::<R>() }.into());
        }

        let data = BlobData::from_payload(payload, expected);
        Ok(Self { data: Arc::new(data), _marker: PhantomData })
    }
}

impl<R> BlobAssetReference<R> {
    /// Hash of the root type hash and payload.
    #[inline]
    pub fn content_hash(&self) -> u64 {
        self.data.content_hash
    }

    /// Payload length in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.data.len
    }

    /// Returns `true` for an empty payload.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.len == 0
    }

    /// Number of live handles to this buffer.
    #[inline]
    pub fn strong_count(&self) -> usize {
        Arc::strong_count(&self.data)
    }

    /// Returns `true` if both handles share one buffer.
    #[inline]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.data, &other.data)
    }

    /// Base address of the buffer, for diagnostics.
    #[inline]
    pub fn as_ptr(&self) -> *const u8 {
        self.data.blocks.as_ptr().cast()
    }
}

/// Content-addressed registry of live blobs.
///
/// Holds weak entries only; a blob is freed when its last handle drops.
#[derive(Default)]
pub struct BlobStore {
    entries: Mutex<HashMap<u64, Vec<Weak<BlobData>>>>,
}

impl BlobStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the live blob with identical contents, or registers `blob`.
    pub fn intern<R>(&self, blob: BlobAssetReference<R>) -> BlobAssetReference<R> {
        let mut entries = self.entries.lock();
        let bucket = entries.entry(blob.data.content_hash).or_default();
        bucket.retain(|weak| weak.strong_count() > 0);

        for weak in bucket.iter() {
            if let Some(existing) = weak.upgrade() {
                if existing.root_hash == blob.data.root_hash && existing.bytes() == blob.data.bytes() {
                    return BlobAssetReference { data: existing, _marker: PhantomData };
                }
            }
        }

        bucket.push(Arc::downgrade(&blob.data));
        blob
    }

    /// Drops entries whose blobs were freed and returns how many remain.
    pub fn purge(&self) -> usize {
        let mut entries = self.entries.lock();
        entries.retain(|_, bucket| {
            bucket.retain(|weak| weak.strong_count() > 0);
            !bucket.is_empty()
        });
        entries.values().map(Vec::len).sum()
    }

    /// Number of registered blobs still alive.
    pub fn len(&self) -> usize {
        self.entries.lock().values().flatten().filter(|weak| weak.strong_count() > 0).count()
    }

    /// Returns `true` if no registered blob is alive.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
