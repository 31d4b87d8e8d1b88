use std::fmt;
use std::fs::File;
use std::io;
use std::os::unix::fs::FileExt;
use std::path::Path;

use bitflags::bitflags;
use serde::Serialize;

use crate::{
    arena::{ArenaConfig, ScratchArena},
    clock,
    error::{Result, RssError},
    maps::MapsReader,
    page_size,
    sampler::{RssEngine, Sample},
};

///////////////////////////////////////////////////////////////////////////////////////////////////
//
// PageMapEntry
//
///////////////////////////////////////////////////////////////////////////////////////////////////

bitflags! {
    /// The status field of a [`PageMapEntry`], i.e., its top [`PageMapEntry::PM_STATUS_BITS`]
    /// bits.
    #[derive(Default)]
    pub struct PageStatus: u8 {
        /// The page is backed by a page frame.
        const PRESENT = 0b100;
        /// The page is in swap.
        const SWAP    = 0b010;
        /// The page is file-mapped or shared-anonymous.
        const FILE    = 0b001;
    }
}

/// A raw status word read from `/proc/<PID>/pagemap`, one per virtual page.
///
/// Documentation and details about the various bits of the API can be found in Linux, at
/// [`doc/Documentation/vm/pagemap.txt`](https://www.kernel.org/doc/Documentation/vm/pagemap.txt).
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct PageMapEntry(u64);

impl std::convert::From<u64> for PageMapEntry {
    fn from(pgmap: u64) -> Self {
        PageMapEntry(pgmap)
    }
}

/// Field layout: status in the top 3 bits, page shift in the next 6, frame number below.
impl PageMapEntry {
    pub const PM_PFRAME_BITS: u64 = 55;
    pub const PM_PFRAME_MASK: u64 = (1 << Self::PM_PFRAME_BITS) - 1;
    pub const PM_PSHIFT_BITS: u64 = 6;
    pub const PM_PSHIFT_OFFSET: u64 = Self::PM_PFRAME_BITS;
    pub const PM_PSHIFT_MASK: u64 = ((1 << Self::PM_PSHIFT_BITS) - 1) << Self::PM_PSHIFT_OFFSET;
    pub const PM_STATUS_BITS: u64 = 3;
    pub const PM_STATUS_OFFSET: u64 = 64 - Self::PM_STATUS_BITS;
    pub const PM_STATUS_MASK: u64 = ((1 << Self::PM_STATUS_BITS) - 1) << Self::PM_STATUS_OFFSET;
    pub const PM_PRESENT: u64 = 1 << 63;
    pub const PM_SWAP: u64 = 1 << 62;

    /// The raw `u64` value as read from [`procfs(5)`].
    ///
    /// [`procfs(5)`]: https://man7.org/linux/man-pages/man5/proc.5.html
    #[inline(always)]
    pub fn raw(&self) -> u64 {
        self.0
    }

    /// The status field.
    #[inline(always)]
    pub fn status(&self) -> PageStatus {
        PageStatus::from_bits_truncate((self.0 >> Self::PM_STATUS_OFFSET) as u8)
    }

    /// Returns `true` if the [`Self::PM_PRESENT`] bit is set; `false` otherwise.
    #[inline(always)]
    pub fn present(&self) -> bool {
        self.0 & Self::PM_PRESENT != 0
    }

    /// Returns `true` if the [`Self::PM_SWAP`] bit is set; `false` otherwise.
    #[inline(always)]
    pub fn swapped(&self) -> bool {
        self.0 & Self::PM_SWAP != 0
    }

    /// The page-shift field.
    #[inline(always)]
    pub fn page_shift(&self) -> u8 {
        ((self.0 & Self::PM_PSHIFT_MASK) >> Self::PM_PSHIFT_OFFSET) as u8
    }

    /// The page frame number, if the page is present.
    ///
    /// Reads as 0 without `CAP_SYS_ADMIN`.
    #[inline(always)]
    pub fn pfn(&self) -> Option<u64> {
        self.present().then(|| self.0 & Self::PM_PFRAME_MASK)
    }
}

impl fmt::Display for PageMapEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.pfn() {
            Some(pfn) => write!(
                f,
                "PageMapEntry{{ status: {:?}; pshift: {}; pfn: 0x{:x} }}",
                self.status(),
                self.page_shift(),
                pfn,
            ),
            None => write!(
                f,
                "PageMapEntry{{ status: {:?}; pshift: {} }}",
                self.status(),
                self.page_shift(),
            ),
        }
    }
}

///////////////////////////////////////////////////////////////////////////////////////////////////
//
// PageMapReader
//
///////////////////////////////////////////////////////////////////////////////////////////////////

/// A handle on `/proc/<PID>/pagemap`, opened once; every read is positioned, so there is no
/// cursor to maintain between ticks.
#[derive(Debug)]
pub struct PageMapReader {
    path: String,
    file: File,
    page_size: u64,
}

impl PageMapReader {
    const ENTRY_SIZE: u64 = std::mem::size_of::<u64>() as u64;

    /// First address of the upper half of the address space, which belongs to the kernel. The
    /// only user-visible mapping there is the `[vsyscall]` page of x86-64.
    const KERNEL_HALF: u64 = 1 << 63;

    /// Open `/proc/<PID>/pagemap`.
    pub fn open(pid: u32) -> Result<Self> {
        Self::from_path(format!("/proc/{}/pagemap", pid))
    }

    /// Open a file in the `pagemap` format at an arbitrary path.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().display().to_string();
        let file = File::open(&path).map_err(|e| RssError::Open {
            path: path.clone(),
            source: e,
        })?;
        Ok(PageMapReader {
            path,
            file,
            page_size: page_size()?,
        })
    }

    /// Fill `buf` with the status words of `buf.len()` pages, starting from virtual page number
    /// `start_page`.
    ///
    /// Short reads are resumed. End-of-file before the range is complete fails with
    /// [`RssError::TruncatedRead`]; this is also how a target that exited after its VMAs were
    /// listed shows up. The one exception is a range in the kernel half of the address space
    /// (`[vsyscall]`), which the kernel does not report on: it reads as all-zero.
    pub fn read_pages(&self, start_page: u64, buf: &mut [u64]) -> Result<()> {
        let offset = start_page * Self::ENTRY_SIZE;
        let in_kernel_half = start_page.saturating_mul(self.page_size) >= Self::KERNEL_HALF;
        let bytes = unsafe {
            std::slice::from_raw_parts_mut(
                buf.as_mut_ptr() as *mut u8,
                buf.len() * Self::ENTRY_SIZE as usize,
            )
        };
        let mut done = 0;
        while done < bytes.len() {
            match self.file.read_at(&mut bytes[done..], offset + done as u64) {
                Ok(0) if done == 0 && in_kernel_half => {
                    tracing::debug!(start_page, "range in the kernel half, zeroed");
                    bytes.fill(0);
                    return Ok(());
                }
                Ok(0) => {
                    return Err(RssError::TruncatedRead {
                        path: self.path.clone(),
                        offset,
                        expected: bytes.len(),
                        read: done,
                    })
                }
                Ok(n) => done += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    return Err(RssError::Read {
                        path: self.path.clone(),
                        source: e,
                    })
                }
            }
        }
        Ok(())
    }
}

///////////////////////////////////////////////////////////////////////////////////////////////////
//
// Aggregation
//
///////////////////////////////////////////////////////////////////////////////////////////////////

/// How the status words of a VMA are turned into a resident page count. Both policies yield the
/// same count.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum Aggregation {
    /// One increment per present page.
    #[default]
    Simple,
    /// Sum of the lengths of the runs of contiguous present pages.
    Segments,
}

impl Aggregation {
    /// Resident pages among `words`, the status words of the pages starting at `start_page`.
    #[inline]
    pub fn count(self, words: &[u64], start_page: u64) -> u64 {
        match self {
            Aggregation::Simple => count_present(words),
            Aggregation::Segments => count_present_segmented(words, start_page),
        }
    }
}

/// Number of status words with the present bit set.
pub fn count_present(words: &[u64]) -> u64 {
    words
        .iter()
        .filter(|&&w| PageMapEntry(w).present())
        .count() as u64
}

/// Number of present pages, obtained by summing the lengths of the runs of [`PresentRuns`].
pub fn count_present_segmented(words: &[u64], start_page: u64) -> u64 {
    PresentRuns::new(words, start_page).map(|r| r.len()).sum()
}

/// A run of contiguous virtual pages, `[start_page, end_page)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PageRange {
    pub start_page: u64,
    pub end_page: u64,
}

impl PageRange {
    #[inline(always)]
    pub fn len(&self) -> u64 {
        self.end_page - self.start_page
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.start_page == self.end_page
    }
}

/// The maximal runs of present pages in the status words of a VMA, in ascending order.
///
/// A run still open at the last word ends at the VMA's end page.
#[derive(Debug, Clone)]
pub struct PresentRuns<'a> {
    words: &'a [u64],
    start_page: u64,
    pos: usize,
}

impl<'a> PresentRuns<'a> {
    /// Runs over `words`, the status words of the pages starting at `start_page`.
    pub fn new(words: &'a [u64], start_page: u64) -> Self {
        PresentRuns {
            words,
            start_page,
            pos: 0,
        }
    }
}

impl Iterator for PresentRuns<'_> {
    type Item = PageRange;

    fn next(&mut self) -> Option<Self::Item> {
        let rest = &self.words[self.pos..];
        let begin = self.pos + rest.iter().position(|&w| PageMapEntry(w).present())?;
        let end = self.words[begin..]
            .iter()
            .position(|&w| !PageMapEntry(w).present())
            .map_or(self.words.len(), |n| begin + n);
        self.pos = end;
        Some(PageRange {
            start_page: self.start_page + begin as u64,
            end_page: self.start_page + end as u64,
        })
    }
}

///////////////////////////////////////////////////////////////////////////////////////////////////
//
// PageTableEngine
//
///////////////////////////////////////////////////////////////////////////////////////////////////

/// Computes resident pages by reading the page-table status word of every page of every VMA.
#[derive(Debug)]
pub struct PageTableEngine {
    pid: u32,
    maps: MapsReader,
    pagemap: PageMapReader,
    arena: ScratchArena,
    aggregation: Aggregation,
    page_size: u64,
}

impl PageTableEngine {
    /// Open the `maps` and `pagemap` files of the process with the given `PID` and reserve the
    /// scratch arena.
    pub fn open(pid: u32, config: ArenaConfig, aggregation: Aggregation) -> Result<Self> {
        let engine = PageTableEngine {
            pid,
            maps: MapsReader::open(pid)?,
            pagemap: PageMapReader::open(pid)?,
            arena: ScratchArena::new(config)?,
            aggregation,
            page_size: page_size()?,
        };
        tracing::debug!(pid, ?aggregation, ?config, "opened page-table engine");
        Ok(engine)
    }

    #[inline(always)]
    pub fn aggregation(&self) -> Aggregation {
        self.aggregation
    }
}

impl RssEngine for PageTableEngine {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn sample(&mut self) -> Result<Sample<'_>> {
        let ps = self.page_size;
        let total_pages = self.maps.read_into(&mut self.arena.vmas)?;

        let needed = total_pages.saturating_mul(PageMapReader::ENTRY_SIZE);
        let capacity = self.arena.snapshot.len() as u64;
        if needed > capacity {
            return Err(RssError::SnapshotTooLarge { needed, capacity });
        }

        // Status words of all VMAs, back to back.
        let words = self.arena.snapshot.words_mut();
        let mut filled = 0;
        for vma in self.arena.vmas.as_slice() {
            let n = vma.pages(ps) as usize;
            self.pagemap
                .read_pages(vma.start_page(ps), &mut words[filled..filled + n])?;
            filled += n;
        }
        let timestamp_ns = clock::now_ns();

        let words = &self.arena.snapshot.words()[..filled];
        let mut offset = 0;
        for vma in self.arena.vmas.as_mut_slice() {
            let n = vma.pages(ps) as usize;
            vma.rss = self
                .aggregation
                .count(&words[offset..offset + n], vma.start_page(ps));
            offset += n;
        }
        tracing::debug!(
            pid = self.pid,
            vmas = self.arena.vmas.len(),
            total_pages,
            "sampled page table"
        );

        let sample = Sample::new(self.pid, timestamp_ns, self.arena.vmas.as_slice(), ps);
        Ok(sample.with_status_words(words))
    }
}

///////////////////////////////////////////////////////////////////////////////////////////////////
//
// tests
//
///////////////////////////////////////////////////////////////////////////////////////////////////
