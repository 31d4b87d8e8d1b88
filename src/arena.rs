use std::fmt;
use std::mem::{align_of, size_of};
use std::ptr::NonNull;

use crate::error::{Result, RssError};
use crate::maps::VmaRecord;

///////////////////////////////////////////////////////////////////////////////////////////////////
//
// ArenaConfig
//
///////////////////////////////////////////////////////////////////////////////////////////////////

/// Capacities of the two regions of a [`ScratchArena`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArenaConfig {
    /// Size of the raw byte region, i.e., of the largest page-table or smaps snapshot.
    ///
    /// The default of 1 GiB holds 2^27 page-table entries, which covers 512 TiB of virtual
    /// address space with 4 KiB pages.
    pub snapshot_bytes: usize,
    /// Maximum number of VMAs per sample.
    pub max_vmas: usize,
}

impl ArenaConfig {
    pub const DEFAULT_SNAPSHOT_BYTES: usize = 1 << 30;
    pub const DEFAULT_MAX_VMAS: usize = 1_000_000;
}

impl Default for ArenaConfig {
    fn default() -> Self {
        ArenaConfig {
            snapshot_bytes: Self::DEFAULT_SNAPSHOT_BYTES,
            max_vmas: Self::DEFAULT_MAX_VMAS,
        }
    }
}

///////////////////////////////////////////////////////////////////////////////////////////////////
//
// MmapRegion
//
///////////////////////////////////////////////////////////////////////////////////////////////////

/// A private anonymous mapping, reserved once and unmapped on drop.
///
/// The mapping is created with `MAP_NORESERVE`: pages only become resident once written, so a
/// large region costs nothing until a tick actually needs it.
pub struct MmapRegion {
    ptr: NonNull<u8>,
    len: usize,
}

// The region is plain memory exclusively owned by this handle.
unsafe impl Send for MmapRegion {}

impl MmapRegion {
    /// Reserve `len` bytes.
    pub fn new(len: usize) -> Result<Self> {
        // mmap(2) rejects zero-length mappings.
        let len = len.max(1);
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(RssError::Map {
                len,
                source: std::io::Error::last_os_error(),
            });
        }
        // mmap(2) never hands out address 0 on success without MAP_FIXED.
        let ptr = NonNull::new(ptr as *mut u8).ok_or_else(|| RssError::Map {
            len,
            source: std::io::ErrorKind::AddrNotAvailable.into(),
        })?;
        tracing::debug!(len, "reserved arena region");
        Ok(MmapRegion { ptr, len })
    }

    /// Length of the region, in bytes.
    #[inline(always)]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The whole region as bytes.
    #[inline(always)]
    pub fn bytes(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    /// The whole region as mutable bytes.
    #[inline(always)]
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }

    /// The region as `u64` words; a trailing partial word is not included.
    #[inline(always)]
    pub fn words(&self) -> &[u64] {
        // mmap(2) returns page-aligned memory.
        debug_assert_eq!(self.ptr.as_ptr() as usize % align_of::<u64>(), 0);
        unsafe {
            std::slice::from_raw_parts(self.ptr.as_ptr() as *const u64, self.len / size_of::<u64>())
        }
    }

    /// The region as mutable `u64` words; a trailing partial word is not included.
    #[inline(always)]
    pub fn words_mut(&mut self) -> &mut [u64] {
        debug_assert_eq!(self.ptr.as_ptr() as usize % align_of::<u64>(), 0);
        unsafe {
            std::slice::from_raw_parts_mut(
                self.ptr.as_ptr() as *mut u64,
                self.len / size_of::<u64>(),
            )
        }
    }
}

impl Drop for MmapRegion {
    fn drop(&mut self) {
        if unsafe { libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.len) } != 0 {
            tracing::warn!(
                len = self.len,
                error = %std::io::Error::last_os_error(),
                "munmap of arena region failed"
            );
        }
    }
}

impl fmt::Debug for MmapRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MmapRegion")
            .field("ptr", &self.ptr)
            .field("len", &self.len)
            .finish()
    }
}

///////////////////////////////////////////////////////////////////////////////////////////////////
//
// VmaArray
//
///////////////////////////////////////////////////////////////////////////////////////////////////

/// A bounded, reusable array of [`VmaRecord`]s backed by its own [`MmapRegion`].
#[derive(Debug)]
pub struct VmaArray {
    region: MmapRegion,
    len: usize,
    capacity: usize,
}

impl VmaArray {
    /// Reserve room for `capacity` records.
    pub fn with_capacity(capacity: usize) -> Result<Self> {
        let bytes = capacity
            .checked_mul(size_of::<VmaRecord>())
            .ok_or(RssError::VmaCapacity { capacity })?;
        Ok(VmaArray {
            region: MmapRegion::new(bytes)?,
            len: 0,
            capacity,
        })
    }

    /// Append a record, failing with [`RssError::VmaCapacity`] once the array is full.
    #[inline]
    pub fn push(&mut self, vma: VmaRecord) -> Result<()> {
        if self.len == self.capacity {
            return Err(RssError::VmaCapacity {
                capacity: self.capacity,
            });
        }
        // In bounds: `len < capacity` and the region holds `capacity` records.
        unsafe { (self.region.ptr.as_ptr() as *mut VmaRecord).add(self.len).write(vma) };
        self.len += 1;
        Ok(())
    }

    /// Forget every record; the memory is reused by subsequent pushes.
    #[inline(always)]
    pub fn clear(&mut self) {
        self.len = 0;
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline(always)]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline(always)]
    pub fn as_slice(&self) -> &[VmaRecord] {
        let ptr = self.region.ptr.as_ptr() as *const VmaRecord;
        unsafe { std::slice::from_raw_parts(ptr, self.len) }
    }

    #[inline(always)]
    pub fn as_mut_slice(&mut self) -> &mut [VmaRecord] {
        unsafe {
            std::slice::from_raw_parts_mut(self.region.ptr.as_ptr() as *mut VmaRecord, self.len)
        }
    }
}

///////////////////////////////////////////////////////////////////////////////////////////////////
//
// ScratchArena
//
///////////////////////////////////////////////////////////////////////////////////////////////////

/// The two regions a sampling engine reuses on every tick: raw pseudo-file bytes and the VMA
/// result array. Both are released exactly once, when the arena is dropped.
#[derive(Debug)]
pub struct ScratchArena {
    pub(crate) snapshot: MmapRegion,
    pub(crate) vmas: VmaArray,
}

impl ScratchArena {
    pub fn new(config: ArenaConfig) -> Result<Self> {
        Ok(ScratchArena {
            snapshot: MmapRegion::new(config.snapshot_bytes)?,
            vmas: VmaArray::with_capacity(config.max_vmas)?,
        })
    }

    /// Capacity of the byte region.
    #[inline(always)]
    pub fn snapshot_capacity(&self) -> usize {
        self.snapshot.len()
    }

    /// The VMA array, as filled by the last tick.
    #[inline(always)]
    pub fn vmas(&self) -> &[VmaRecord] {
        self.vmas.as_slice()
    }
}

///////////////////////////////////////////////////////////////////////////////////////////////////
//
// tests
//
///////////////////////////////////////////////////////////////////////////////////////////////////
