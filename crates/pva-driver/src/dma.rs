//! Device-addressable memory.
//!
//! A [`DmaRegion`] is a CPU mapping paired with the address the accelerator
//! uses for it (the IOVA). It has exactly one owner; dropping it releases the
//! IOVA. A [`DmaHandle`] is a non-owning view of a region (or a slice of one)
//! that keeps the pages mapped but does not keep the IOVA registered.
//!
//! [`HostDmaAllocator`] backs regions with anonymous host pages and hands out
//! page-granular IOVAs from a fixed window. It keeps an IOVA → region registry
//! so a firmware model can translate device addresses the way an IOMMU would.
//!
//! Word accessors are atomic (acquire loads, release stores): head, tail and
//! fence words are shared with firmware, which runs concurrently.

use crate::error::{PvaError, Result};
use rustix::mm::{mmap_anonymous, munmap, MapFlags, ProtFlags};
use std::collections::BTreeMap;
use std::fmt;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

/// IOVA and mapping granularity.
pub const PAGE_SIZE: usize = 4096;

/// Default first IOVA handed out by [`HostDmaAllocator`].
pub const DEFAULT_IOVA_BASE: u64 = 0x1_0000_0000;

/// Default IOVA window size (4 GiB).
pub const DEFAULT_IOVA_SPACE: u64 = 1 << 32;

/// Accelerator access permission of a region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Access {
    /// Firmware may only read.
    ReadOnly,
    /// Firmware may read and write.
    ReadWrite,
}

/// Device-memory allocator consumed by the driver.
pub trait DeviceMemory: Send + Sync + fmt::Debug {
    /// Allocate `size` bytes, map them for the accelerator with `access` in
    /// address space `asid`, and return the owning region.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` for a zero size and `OutOfMemory` when host
    /// memory or IOVA space is exhausted.
    fn alloc_map(&self, size: usize, access: Access, asid: u32) -> Result<DmaRegion>;

    /// Unmap and free a region.
    fn free(&self, region: DmaRegion) {
        drop(region);
    }
}

/// One anonymous mapping. Unmapped when the last handle goes away.
struct Mapping {
    ptr: NonNull<u8>,
    mapped: usize,
    iova: u64,
    access: Access,
    asid: u32,
}

impl Drop for Mapping {
    fn drop(&mut self) {
        // SAFETY: ptr/mapped come from the successful mmap_anonymous in
        // `map_pages`, and every handle that could reach the pages holds an
        // Arc to this Mapping, so none is left once we get here.
        unsafe {
            if let Err(e) = munmap(self.ptr.as_ptr().cast(), self.mapped) {
                tracing::error!("munmap failed during drop: {e}");
            }
        }
    }
}

// SAFETY: the mapping is plain anonymous memory owned by this struct; all
// concurrent access goes through DmaHandle, which uses atomics for words that
// are shared between threads and raw copies for bulk data.
unsafe impl Send for Mapping {}
// SAFETY: see Send. Nothing in Mapping itself is mutated after creation.
unsafe impl Sync for Mapping {}

fn map_pages(len: usize) -> Result<NonNull<u8>> {
    // SAFETY: a fresh private anonymous mapping with a null hint cannot alias
    // any existing Rust object. len is non-zero and page aligned (caller).
    let addr = unsafe {
        mmap_anonymous(
            std::ptr::null_mut(),
            len,
            ProtFlags::READ | ProtFlags::WRITE,
            MapFlags::PRIVATE,
        )
    }
    .map_err(|e| PvaError::out_of_memory(format!("mmap of {len} bytes failed: {e}")))?;

    NonNull::new(addr.cast::<u8>())
        .ok_or_else(|| PvaError::out_of_memory("mmap returned a null mapping"))
}

/// Non-owning view of device memory.
///
/// Cloning is cheap. A handle keeps the pages mapped, so it is always safe to
/// access, but once the owning [`DmaRegion`] is dropped its IOVA is no longer
/// valid for the accelerator.
#[derive(Clone)]
pub struct DmaHandle {
    mapping: Arc<Mapping>,
    offset: usize,
    len: usize,
}

impl fmt::Debug for DmaHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DmaHandle")
            .field("iova", &format_args!("{:#x}", self.iova()))
            .field("len", &self.len)
            .field("access", &self.mapping.access)
            .finish()
    }
}

impl DmaHandle {
    /// Accelerator-visible address of the first byte.
    pub fn iova(&self) -> u64 {
        self.mapping.iova + self.offset as u64
    }

    /// Size in bytes.
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Whether the view is empty.
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Accelerator access permission.
    pub fn access(&self) -> Access {
        self.mapping.access
    }

    /// Address space the region is mapped in.
    pub fn asid(&self) -> u32 {
        self.mapping.asid
    }

    /// Sub-view `[offset, offset + len)`, or `None` if it does not fit.
    pub fn slice(&self, offset: usize, len: usize) -> Option<Self> {
        let end = offset.checked_add(len)?;
        (end <= self.len).then(|| Self {
            mapping: Arc::clone(&self.mapping),
            offset: self.offset + offset,
            len,
        })
    }

    fn ptr(&self, offset: usize, len: usize) -> *mut u8 {
        assert!(
            offset.checked_add(len).is_some_and(|end| end <= self.len),
            "DMA access out of bounds: offset={offset:#x} len={len:#x} limit={:#x}",
            self.len
        );
        // SAFETY: offset + len <= self.len and self.offset + self.len <=
        // mapping.mapped, so the result stays inside the mapping.
        unsafe { self.mapping.ptr.as_ptr().add(self.offset + offset) }
    }

    #[allow(clippy::cast_ptr_alignment)] // alignment asserted below
    fn word(&self, offset: usize) -> &AtomicU32 {
        let ptr = self.ptr(offset, 4).cast::<u32>();
        assert!(ptr.is_aligned(), "unaligned DMA word at offset {offset:#x}");
        // SAFETY: ptr is in bounds, 4-byte aligned and the pages outlive the
        // returned borrow of self. The word is only ever accessed atomically
        // by host threads; firmware-side writers use the same accessors.
        unsafe { AtomicU32::from_ptr(ptr) }
    }

    /// Acquire-load a little-endian word.
    ///
    /// # Panics
    ///
    /// Panics if the word is out of bounds or not 4-byte aligned.
    pub fn read_u32(&self, offset: usize) -> u32 {
        u32::from_le(self.word(offset).load(Ordering::Acquire))
    }

    /// Release-store a little-endian word.
    ///
    /// # Panics
    ///
    /// Panics if the word is out of bounds or not 4-byte aligned.
    pub fn write_u32(&self, offset: usize, value: u32) {
        self.word(offset).store(value.to_le(), Ordering::Release);
    }

    /// Atomically set `bits`, returning the previous value.
    ///
    /// # Panics
    ///
    /// Panics if the word is out of bounds or not 4-byte aligned.
    pub fn fetch_or_u32(&self, offset: usize, bits: u32) -> u32 {
        u32::from_le(self.word(offset).fetch_or(bits.to_le(), Ordering::AcqRel))
    }

    /// Atomically clear `bits`, returning the previous value.
    ///
    /// # Panics
    ///
    /// Panics if the word is out of bounds or not 4-byte aligned.
    pub fn clear_bits_u32(&self, offset: usize, bits: u32) -> u32 {
        u32::from_le(self.word(offset).fetch_and(!bits.to_le(), Ordering::AcqRel))
    }

    /// Copy bytes out of the region.
    ///
    /// # Panics
    ///
    /// Panics if the range is out of bounds.
    pub fn read_bytes(&self, offset: usize, out: &mut [u8]) {
        let src = self.ptr(offset, out.len());
        // SAFETY: src is valid for out.len() bytes (checked in ptr()); the
        // destination is a distinct Rust slice, so they cannot overlap.
        unsafe { std::ptr::copy_nonoverlapping(src, out.as_mut_ptr(), out.len()) };
    }

    /// Copy bytes into the region.
    ///
    /// # Panics
    ///
    /// Panics if the range is out of bounds.
    pub fn write_bytes(&self, offset: usize, data: &[u8]) {
        let dst = self.ptr(offset, data.len());
        // SAFETY: dst is valid for data.len() bytes (checked in ptr()); the
        // source is a distinct Rust slice, so they cannot overlap.
        unsafe { std::ptr::copy_nonoverlapping(data.as_ptr(), dst, data.len()) };
    }

    /// Set `len` bytes starting at `offset` to `value`.
    ///
    /// # Panics
    ///
    /// Panics if the range is out of bounds.
    pub fn fill(&self, offset: usize, len: usize, value: u8) {
        let dst = self.ptr(offset, len);
        // SAFETY: dst is valid for len bytes (checked in ptr()).
        unsafe { std::ptr::write_bytes(dst, value, len) };
    }

    /// Copy the whole view into a vector.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = vec![0u8; self.len];
        self.read_bytes(0, &mut out);
        out
    }
}

/// Owning device-memory region.
///
/// Dereferences to [`DmaHandle`] for access. Dropping the region releases its
/// IOVA; the pages are unmapped once no [`DmaHandle`] refers to them.
pub struct DmaRegion {
    handle: DmaHandle,
    space: Weak<AllocatorInner>,
}

impl fmt::Debug for DmaRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("DmaRegion").field(&self.handle).finish()
    }
}

impl DmaRegion {
    /// A non-owning view of the whole region.
    pub fn handle(&self) -> DmaHandle {
        self.handle.clone()
    }
}

impl std::ops::Deref for DmaRegion {
    type Target = DmaHandle;

    fn deref(&self) -> &DmaHandle {
        &self.handle
    }
}

impl Drop for DmaRegion {
    fn drop(&mut self) {
        if let Some(space) = self.space.upgrade() {
            space.release(self.handle.mapping.iova);
        }
    }
}

#[derive(Debug)]
struct AllocatorState {
    next_iova: u64,
    live: BTreeMap<u64, DmaHandle>,
}

#[derive(Debug)]
struct AllocatorInner {
    base: u64,
    end: u64,
    state: Mutex<AllocatorState>,
}

impl AllocatorInner {
    fn lock(&self) -> std::sync::MutexGuard<'_, AllocatorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn release(&self, iova: u64) {
        if let Some(handle) = self.lock().live.remove(&iova) {
            tracing::debug!("Released IOVA {iova:#x} ({} bytes)", handle.len());
        }
    }
}

/// Host-memory implementation of [`DeviceMemory`].
///
/// IOVAs are assigned page by page from a bump pointer and never reused, so
/// a stale device address always fails to resolve instead of aliasing a
/// newer allocation.
#[derive(Debug, Clone)]
pub struct HostDmaAllocator {
    inner: Arc<AllocatorInner>,
}

impl Default for HostDmaAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl HostDmaAllocator {
    /// Allocator over the default IOVA window.
    pub fn new() -> Self {
        Self::with_iova_range(DEFAULT_IOVA_BASE, DEFAULT_IOVA_SPACE)
    }

    /// Allocator handing out IOVAs from `[base, base + len)`.
    pub fn with_iova_range(base: u64, len: u64) -> Self {
        Self {
            inner: Arc::new(AllocatorInner {
                base,
                end: base.saturating_add(len),
                state: Mutex::new(AllocatorState {
                    next_iova: base,
                    live: BTreeMap::new(),
                }),
            }),
        }
    }

    /// Translate a device address range, as an IOMMU would.
    ///
    /// Returns `None` unless `[iova, iova + len)` lies inside one live region.
    pub fn resolve(&self, iova: u64, len: usize) -> Option<DmaHandle> {
        let state = self.inner.lock();
        let (&start, handle) = state.live.range(..=iova).next_back()?;
        let offset = usize::try_from(iova - start).ok()?;
        handle.slice(offset, len)
    }

    /// Number of regions whose IOVA is still registered.
    pub fn live_regions(&self) -> usize {
        self.inner.lock().live.len()
    }

    /// Total bytes of live regions.
    pub fn live_bytes(&self) -> usize {
        self.inner.lock().live.values().map(DmaHandle::len).sum()
    }

    /// First IOVA of the window.
    pub fn iova_base(&self) -> u64 {
        self.inner.base
    }
}

impl DeviceMemory for HostDmaAllocator {
    fn alloc_map(&self, size: usize, access: Access, asid: u32) -> Result<DmaRegion> {
        if size == 0 {
            return Err(PvaError::invalid_argument("zero-size DMA allocation"));
        }
        let mapped = size
            .checked_next_multiple_of(PAGE_SIZE)
            .ok_or_else(|| PvaError::out_of_memory(format!("{size} bytes")))?;

        let mut state = self.inner.lock();
        let iova = state.next_iova;
        let iova_end = iova
            .checked_add(mapped as u64)
            .filter(|&end| end <= self.inner.end)
            .ok_or_else(|| {
                PvaError::out_of_memory(format!("IOVA space exhausted allocating {size} bytes"))
            })?;

        let ptr = map_pages(mapped)?;
        state.next_iova = iova_end;

        let handle = DmaHandle {
            mapping: Arc::new(Mapping {
                ptr,
                mapped,
                iova,
                access,
                asid,
            }),
            offset: 0,
            len: size,
        };
        state.live.insert(iova, handle.clone());
        tracing::debug!("Mapped {size} bytes at IOVA {iova:#x} ({access:?}, asid {asid})");

        Ok(DmaRegion {
            handle,
            space: Arc::downgrade(&self.inner),
        })
    }
}
