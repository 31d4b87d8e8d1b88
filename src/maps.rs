use std::fmt;
use std::fs::File;
use std::io::{BufRead, BufReader, Seek, SeekFrom};
use std::path::Path;

use serde::Serialize;

use crate::arena::VmaArray;
use crate::error::{Result, RssError};

///////////////////////////////////////////////////////////////////////////////////////////////////
//
// VmaRecord
//
///////////////////////////////////////////////////////////////////////////////////////////////////

/// A virtual memory area of the target, `[start_addr, end_addr)`, and the number of its pages
/// found resident by the last sampling tick.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct VmaRecord {
    /// First address included in the area.
    pub start_addr: u64,
    /// First address past the end of the area.
    pub end_addr: u64,
    /// Resident pages, in units of the system page size.
    pub rss: u64,
}

impl VmaRecord {
    /// A record for `[start_addr, end_addr)` with `rss` zeroed.
    #[inline(always)]
    pub fn new(start_addr: u64, end_addr: u64) -> Self {
        debug_assert!(start_addr < end_addr);
        VmaRecord {
            start_addr,
            end_addr,
            rss: 0,
        }
    }

    /// Size of the area, in bytes.
    #[inline(always)]
    pub fn size(&self) -> u64 {
        self.end_addr - self.start_addr
    }

    /// Number of pages spanned by the area.
    #[inline(always)]
    pub fn pages(&self, page_size: u64) -> u64 {
        self.size() / page_size
    }

    /// Virtual page number of the first page.
    #[inline(always)]
    pub fn start_page(&self, page_size: u64) -> u64 {
        self.start_addr / page_size
    }

    /// Virtual page number one past the last page.
    #[inline(always)]
    pub fn end_page(&self, page_size: u64) -> u64 {
        self.end_addr / page_size
    }
}

impl fmt::Display for VmaRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "0x{:016x}-0x{:016x} ({:8}K) rss={}",
            self.start_addr,
            self.end_addr,
            self.size() / 1024,
            self.rss,
        )
    }
}

/// Parse the address range at the start of a `maps` or `smaps` header line: two hexadecimal
/// addresses separated by a dash, the second one terminated by whitespace or the end of the line.
///
/// Returns `None` for anything else, including empty or inverted ranges.
pub fn parse_region(line: &str) -> Option<(u64, u64)> {
    let range = line.split_ascii_whitespace().next()?;
    let (start, end) = range.split_once('-')?;
    let start = u64::from_str_radix(start, 16).ok()?;
    let end = u64::from_str_radix(end, 16).ok()?;
    (start < end).then(|| (start, end))
}

///////////////////////////////////////////////////////////////////////////////////////////////////
//
// MapsReader
//
///////////////////////////////////////////////////////////////////////////////////////////////////

/// A handle on `/proc/<PID>/maps`, opened once and re-read from offset 0 on every call.
#[derive(Debug)]
pub struct MapsReader {
    path: String,
    rdr: BufReader<File>,
    line: String,
    page_size: u64,
}

impl MapsReader {
    /// Open `/proc/<PID>/maps`.
    pub fn open(pid: u32) -> Result<Self> {
        Self::from_path(format!("/proc/{}/maps", pid), crate::page_size()?)
    }

    /// Open a file in the `maps` format at an arbitrary path.
    pub fn from_path<P: AsRef<Path>>(path: P, page_size: u64) -> Result<Self> {
        let path = path.as_ref().display().to_string();
        let file = File::open(&path).map_err(|e| RssError::Open {
            path: path.clone(),
            source: e,
        })?;
        Ok(MapsReader {
            path,
            rdr: BufReader::with_capacity(1 << 14, file),
            line: String::with_capacity(256),
            page_size,
        })
    }

    /// The path being read.
    #[inline(always)]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Replace the contents of `vmas` with the areas currently listed, in listing order, and
    /// return the total number of pages they span.
    ///
    /// Lines that do not start with an address range are skipped. An empty listing fails with
    /// [`RssError::Open`]: a live process always has mappings, so its address space is gone.
    pub fn read_into(&mut self, vmas: &mut VmaArray) -> Result<u64> {
        self.rdr
            .seek(SeekFrom::Start(0))
            .map_err(|e| RssError::Seek {
                path: self.path.clone(),
                source: e,
            })?;
        vmas.clear();
        let mut total_pages = 0;
        let mut lines = 0;
        loop {
            self.line.clear();
            let n = self
                .rdr
                .read_line(&mut self.line)
                .map_err(|e| read_error(&self.path, e))?;
            if n == 0 {
                break;
            }
            lines += 1;
            match parse_region(&self.line) {
                Some((start, end)) => {
                    let vma = VmaRecord::new(start, end);
                    total_pages += vma.pages(self.page_size);
                    vmas.push(vma)?;
                }
                None => {
                    tracing::trace!(line = %self.line.trim_end(), "skipping malformed maps line")
                }
            }
        }
        if lines == 0 {
            return Err(exited(&self.path));
        }
        tracing::debug!(path = %self.path, vmas = vmas.len(), total_pages, "read VMA directory");
        Ok(total_pages)
    }
}

/// A failed read of a `/proc/<PID>/...` file; `ESRCH` means the process is gone.
pub(crate) fn read_error(path: &str, e: std::io::Error) -> RssError {
    match e.raw_os_error() {
        Some(libc::ESRCH) => RssError::Open {
            path: path.to_owned(),
            source: e,
        },
        _ => RssError::Read {
            path: path.to_owned(),
            source: e,
        },
    }
}

/// The error reported when a process's pseudo-files read as empty.
pub(crate) fn exited(path: &str) -> RssError {
    RssError::Open {
        path: path.to_owned(),
        source: std::io::Error::from_raw_os_error(libc::ESRCH),
    }
}

///////////////////////////////////////////////////////////////////////////////////////////////////
//
// tests
//
///////////////////////////////////////////////////////////////////////////////////////////////////
