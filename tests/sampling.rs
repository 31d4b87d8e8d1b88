//! Both engines, sampling the test process itself while it maps, touches and unmaps memory.

use std::ptr::NonNull;

use rsswatch::{
    page_size, Aggregation, ArenaConfig, PageRange, PageTableEngine, RssEngine, RssError,
    SmapsEngine, VmaRecord,
};

const PAGES: usize = 64;

/// Anonymous read-write pages fenced by an inaccessible page on each side, so that the kernel
/// keeps them in a VMA of their own.
struct Fenced {
    base: NonNull<u8>,
    page_size: usize,
    pages: usize,
    unmapped: bool,
}

impl Fenced {
    fn new(pages: usize) -> anyhow::Result<Self> {
        let page_size = page_size()? as usize;
        let len = (pages + 2) * page_size;
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        anyhow::ensure!(ptr != libc::MAP_FAILED, std::io::Error::last_os_error());
        let base = NonNull::new(ptr as *mut u8).ok_or_else(|| anyhow::anyhow!("null mapping"))?;
        let fenced = Fenced {
            base,
            page_size,
            pages,
            unmapped: false,
        };
        unsafe {
            anyhow::ensure!(
                libc::mprotect(ptr, page_size, libc::PROT_NONE) == 0,
                std::io::Error::last_os_error()
            );
            let last = base.as_ptr().add((pages + 1) * page_size);
            anyhow::ensure!(
                libc::mprotect(last as *mut libc::c_void, page_size, libc::PROT_NONE) == 0,
                std::io::Error::last_os_error()
            );
        }
        Ok(fenced)
    }

    fn start(&self) -> u64 {
        self.base.as_ptr() as u64 + self.page_size as u64
    }

    fn end(&self) -> u64 {
        self.start() + (self.pages * self.page_size) as u64
    }

    fn touch(&mut self) {
        for i in 0..self.pages {
            unsafe {
                let p = self.base.as_ptr().add((i + 1) * self.page_size);
                std::ptr::write_volatile(p, 0xa5);
            }
        }
    }

    fn unmap(&mut self) {
        if !self.unmapped {
            unsafe {
                libc::munmap(
                    self.base.as_ptr() as *mut libc::c_void,
                    (self.pages + 2) * self.page_size,
                );
            }
            self.unmapped = true;
        }
    }
}

impl Drop for Fenced {
    fn drop(&mut self) {
        self.unmap();
    }
}

fn find(vmas: &[VmaRecord], start: u64) -> Option<VmaRecord> {
    vmas.iter().copied().find(|v| v.start_addr == start)
}

fn check_bounds(vmas: &[VmaRecord], page_size: u64) {
    for vma in vmas {
        assert!(vma.rss <= vma.pages(page_size), "{}", vma);
    }
}

fn small_arena() -> ArenaConfig {
    ArenaConfig {
        snapshot_bytes: 1 << 28,
        max_vmas: 1 << 16,
    }
}

fn page_table_lifecycle(aggregation: Aggregation) -> anyhow::Result<()> {
    let ps = page_size()?;
    let mut region = Fenced::new(PAGES)?;
    let mut engine = PageTableEngine::open(std::process::id(), small_arena(), aggregation)?;

    {
        let sample = engine.sample()?;
        check_bounds(sample.vmas, ps);
        let vma = find(sample.vmas, region.start()).ok_or_else(|| anyhow::anyhow!("no VMA"))?;
        assert_eq!(vma.end_addr, region.end());
        assert_eq!(vma.rss, 0);
    }

    region.touch();
    {
        let sample = engine.sample()?;
        check_bounds(sample.vmas, ps);
        let vma = find(sample.vmas, region.start()).ok_or_else(|| anyhow::anyhow!("no VMA"))?;
        assert_eq!(vma.rss, PAGES as u64);

        let runs: Vec<PageRange> = sample
            .present_runs()
            .ok_or_else(|| anyhow::anyhow!("no status words"))?
            .find(|(v, _)| v.start_addr == region.start())
            .map(|(_, runs)| runs.collect())
            .unwrap_or_default();
        assert_eq!(
            runs,
            vec![PageRange {
                start_page: region.start() / ps,
                end_page: region.end() / ps,
            }]
        );
    }

    let start = region.start();
    region.unmap();
    let sample = engine.sample()?;
    check_bounds(sample.vmas, ps);
    assert!(find(sample.vmas, start).map_or(true, |v| v.rss == 0));
    Ok(())
}

#[test]
fn test_page_table_simple() -> anyhow::Result<()> {
    page_table_lifecycle(Aggregation::Simple)
}

#[test]
fn test_page_table_segments() -> anyhow::Result<()> {
    page_table_lifecycle(Aggregation::Segments)
}

#[test]
fn test_smaps_lifecycle() -> anyhow::Result<()> {
    let ps = page_size()?;
    let mut region = Fenced::new(PAGES)?;
    let mut engine = SmapsEngine::open(std::process::id(), small_arena())?;

    {
        let sample = engine.sample()?;
        check_bounds(sample.vmas, ps);
        assert!(sample.present_runs().is_none());
        let vma = find(sample.vmas, region.start()).ok_or_else(|| anyhow::anyhow!("no VMA"))?;
        assert_eq!(vma.rss, 0);
    }

    region.touch();
    {
        let sample = engine.sample()?;
        let vma = find(sample.vmas, region.start()).ok_or_else(|| anyhow::anyhow!("no VMA"))?;
        assert_eq!(vma.rss, PAGES as u64);
    }

    let start = region.start();
    region.unmap();
    let sample = engine.sample()?;
    assert!(find(sample.vmas, start).map_or(true, |v| v.rss == 0));
    Ok(())
}

#[test]
fn test_capacity_limits() -> anyhow::Result<()> {
    let pid = std::process::id();

    let tiny = ArenaConfig {
        snapshot_bytes: 8,
        max_vmas: 1 << 16,
    };
    let mut engine = PageTableEngine::open(pid, tiny, Aggregation::Simple)?;
    match engine.sample() {
        Err(e @ RssError::SnapshotTooLarge { .. }) => assert_eq!(e.exit_code(), -1),
        r => panic!("unexpected {:?}", r.map(|s| s.vmas.len())),
    }

    let one = ArenaConfig {
        snapshot_bytes: 1 << 28,
        max_vmas: 1,
    };
    let mut engine = SmapsEngine::open(pid, one)?;
    match engine.sample() {
        Err(e @ RssError::VmaCapacity { capacity: 1 }) => assert_eq!(e.exit_code(), -10),
        r => panic!("unexpected {:?}", r.map(|s| s.vmas.len())),
    }
    Ok(())
}

#[test]
fn test_target_gone() -> anyhow::Result<()> {
    let mut child = std::process::Command::new("sleep").arg("30").spawn()?;
    let pid = child.id();
    let mut pagemap = PageTableEngine::open(pid, small_arena(), Aggregation::Simple)?;
    let mut smaps = SmapsEngine::open(pid, small_arena())?;
    child.kill()?;
    child.wait()?;

    for result in [pagemap.sample().map(|_| ()), smaps.sample().map(|_| ())] {
        match result {
            Err(e) => {
                assert!(e.ends_sampling(), "{}", e);
                assert_eq!(e.exit_code(), -3);
            }
            Ok(()) => panic!("sampled a reaped process"),
        }
    }

    match PageTableEngine::open(pid, small_arena(), Aggregation::Simple) {
        Err(RssError::Open { .. }) => Ok(()),
        r => panic!("unexpected {:?}", r.map(|e| e.pid())),
    }
}
