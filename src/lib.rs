#![doc(html_root_url = "https://docs.rs/rsswatch/0.1.0")]
#![warn(rust_2018_idioms)]
#![deny(
    //missing_docs,
    unreachable_pub,
    rustdoc::broken_intra_doc_links,
)]

pub mod allocations;
mod arena;
pub mod clock;
pub mod correlate;
mod error;
pub mod events;
mod maps;
mod pagemap;
mod sampler;
mod smaps;
pub mod tracer;

pub use crate::arena::{ArenaConfig, MmapRegion, ScratchArena, VmaArray};
pub use crate::error::{Result, RssError};
pub use crate::maps::{parse_region, MapsReader, VmaRecord};
pub use crate::pagemap::{
    count_present, count_present_segmented, Aggregation, PageMapEntry, PageMapReader, PageRange,
    PageStatus, PageTableEngine, PresentRuns,
};
pub use crate::sampler::{RssEngine, Sample, Sampler, Schedule};
pub use crate::smaps::{parse_rss_kb, parse_smaps, SmapsEngine};

/// Returns the system page size, in bytes.
pub fn page_size() -> Result<u64> {
    match unsafe { libc::sysconf(libc::_SC_PAGESIZE) } {
        -1 => Err(std::io::Error::last_os_error().into()),
        sz => Ok(sz as u64),
    }
}
