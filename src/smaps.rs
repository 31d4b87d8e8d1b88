use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use crate::{
    arena::{ArenaConfig, ScratchArena, VmaArray},
    clock,
    error::{Result, RssError},
    maps::{exited, parse_region, read_error, VmaRecord},
    page_size,
    sampler::{RssEngine, Sample},
};

/// Lines between a block's header and its `Rss:` field: `Size:`, `KernelPageSize:`,
/// `MMUPageSize:`.
const LINES_BEFORE_RSS: usize = 3;

const RSS_FIELD: &str = "Rss:";

/// Parse the value of an `Rss:` field, e.g. `"      4 kB"`, into kB.
///
/// The unit is recognised by its first letter, case-insensitively: `k`, `m` or `g`. Each unit
/// above kB scales the value by a further 1024.
pub fn parse_rss_kb(field: &str) -> Result<u64> {
    let mut tokens = field.split_ascii_whitespace();
    let value: u64 = tokens
        .next()
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| RssError::parse(field, "expected a decimal Rss value"))?;
    let unit = tokens
        .next()
        .ok_or_else(|| RssError::parse(field, "missing Rss unit"))?;
    let shift = match unit.as_bytes().first().map(u8::to_ascii_lowercase) {
        Some(b'g') => 20,
        Some(b'm') => 10,
        Some(b'k') => 0,
        _ => return Err(RssError::parse(field, "unknown Rss unit")),
    };
    value
        .checked_mul(1 << shift)
        .ok_or_else(|| RssError::parse(field, "Rss value out of range"))
}

/// Replace the contents of `vmas` with the areas of a `/proc/<PID>/smaps` report, with `rss` set
/// from each block's `Rss:` field, in units of `page_size`.
///
/// The whole pass fails if any block lacks a well-formed `Rss:` field where it is expected.
pub fn parse_smaps(text: &str, vmas: &mut VmaArray, page_size: u64) -> Result<()> {
    vmas.clear();
    let mut lines = text.lines();
    while let Some(line) = lines.next() {
        // Everything up to the next block header is of no interest.
        let (start, end) = match parse_region(line) {
            Some(region) => region,
            None => continue,
        };
        let rss_line = lines
            .by_ref()
            .nth(LINES_BEFORE_RSS)
            .ok_or_else(|| RssError::parse(line, "block ends before its Rss field"))?;
        let field = rss_line
            .strip_prefix(RSS_FIELD)
            .ok_or_else(|| RssError::parse(rss_line, "expected the Rss field"))?;
        let mut vma = VmaRecord::new(start, end);
        vma.rss = (parse_rss_kb(field)? * 1024 / page_size).min(vma.pages(page_size));
        vmas.push(vma)?;
    }
    Ok(())
}

/// Computes resident pages from the kernel's own per-VMA summary in `/proc/<PID>/smaps`.
///
/// The file is reopened on every tick, so that the kernel walks the page tables afresh.
#[derive(Debug)]
pub struct SmapsEngine {
    pid: u32,
    path: PathBuf,
    arena: ScratchArena,
    page_size: u64,
}

impl SmapsEngine {
    /// Check that `/proc/<PID>/smaps` can be opened and reserve the scratch arena.
    pub fn open(pid: u32, config: ArenaConfig) -> Result<Self> {
        Self::from_path(pid, format!("/proc/{}/smaps", pid), config)
    }

    /// Like [`SmapsEngine::open`], but reading a file in the `smaps` format at an arbitrary path.
    pub fn from_path<P: AsRef<Path>>(pid: u32, path: P, config: ArenaConfig) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        open(&path)?;
        let engine = SmapsEngine {
            pid,
            path,
            arena: ScratchArena::new(config)?,
            page_size: page_size()?,
        };
        tracing::debug!(pid, path = %engine.path.display(), ?config, "opened smaps engine");
        Ok(engine)
    }

    /// Read the whole report into the byte region; returns its length.
    fn snapshot(&mut self) -> Result<usize> {
        let mut file = open(&self.path)?;
        let read_err = |e| read_error(&self.path.display().to_string(), e);
        let buf = self.arena.snapshot.bytes_mut();
        let mut len = 0;
        while len < buf.len() {
            match file.read(&mut buf[len..]) {
                Ok(0) => return Ok(len),
                Ok(n) => len += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(read_err(e)),
            }
        }
        // The region is full: anything left means the report does not fit.
        let mut probe = [0; 4096];
        loop {
            match file.read(&mut probe) {
                Ok(0) => return Ok(len),
                Ok(n) => {
                    return Err(RssError::SnapshotTooLarge {
                        needed: (len + n) as u64,
                        capacity: len as u64,
                    })
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(read_err(e)),
            }
        }
    }
}

fn open(path: &Path) -> Result<File> {
    File::open(path).map_err(|e| RssError::Open {
        path: path.display().to_string(),
        source: e,
    })
}

impl RssEngine for SmapsEngine {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn sample(&mut self) -> Result<Sample<'_>> {
        let len = self.snapshot()?;
        let timestamp_ns = clock::now_ns();
        if len == 0 {
            // A zombie's smaps can still be opened, but reads as empty.
            return Err(exited(&self.path.display().to_string()));
        }
        // Path names need not be UTF-8; they are never looked at.
        let text = String::from_utf8_lossy(&self.arena.snapshot.bytes()[..len]);
        parse_smaps(&text, &mut self.arena.vmas, self.page_size)?;
        tracing::debug!(pid = self.pid, bytes = len, vmas = self.arena.vmas.len(), "sampled smaps");
        Ok(Sample::new(
            self.pid,
            timestamp_ns,
            self.arena.vmas.as_slice(),
            self.page_size,
        ))
    }
}

///////////////////////////////////////////////////////////////////////////////////////////////////
//
// tests
//
///////////////////////////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    const SMAPS: &str = "\
00400000-00404000 r-xp 00000000 fe:00 1234                               /usr/bin/cat
Size:                 16 kB
KernelPageSize:        4 kB
MMUPageSize:           4 kB
Rss:                   8 kB
Pss:                   8 kB
Shared_Clean:          0 kB
Shared_Dirty:          0 kB
Private_Clean:         8 kB
Private_Dirty:         0 kB
Referenced:            8 kB
Anonymous:             0 kB
LazyFree:              0 kB
AnonHugePages:         0 kB
ShmemPmdMapped:        0 kB
FilePmdMapped:         0 kB
Shared_Hugetlb:        0 kB
Private_Hugetlb:       0 kB
Swap:                  0 kB
SwapPss:               0 kB
Locked:                0 kB
THPeligible:    0
VmFlags: rd ex mr mw me dw
7f0000000000-7f0000400000 rw-p 00000000 00:00 0
Size:               4096 kB
KernelPageSize:        4 kB
MMUPageSize:           4 kB
Rss:                   2 mB
Pss:                2048 kB
VmFlags: rd wr mr mw me ac
7ffd00000000-7ffd00021000 rw-p 00000000 00:00 0                          [stack]
Size:                132 kB
KernelPageSize:        4 kB
MMUPageSize:           4 kB
Rss:                  12 KB
VmFlags: rd wr mr mw me gd ac
";

    #[test]
    fn test_parse_rss_kb_units() -> anyhow::Result<()> {
        assert_eq!(parse_rss_kb("4 kB")?, 4);
        assert_eq!(parse_rss_kb("4 mB")?, 4096);
        assert_eq!(parse_rss_kb("1 gB")?, 1048576);
        assert_eq!(parse_rss_kb("   16 KB")?, 16);
        assert_eq!(parse_rss_kb("3 MB")?, 3072);
        assert_eq!(parse_rss_kb("0 kB")?, 0);
        Ok(())
    }

    #[test]
    fn test_parse_rss_kb_errors() {
        for field in &["", "   ", "kB", "4", "4 tB", "-4 kB", "x kB"] {
            match parse_rss_kb(field) {
                Err(e @ RssError::Parse { .. }) => assert_eq!(e.exit_code(), -5),
                r => panic!("{:?} -> {:?}", field, r),
            }
        }
        assert!(parse_rss_kb(&format!("{} gB", u64::MAX)).is_err());
    }

    #[test]
    fn test_parse_smaps_blocks() -> anyhow::Result<()> {
        let mut vmas = VmaArray::with_capacity(8)?;
        parse_smaps(SMAPS, &mut vmas, 4096)?;
        assert_eq!(
            vmas.as_slice(),
            &[
                VmaRecord { start_addr: 0x400000, end_addr: 0x404000, rss: 2 },
                VmaRecord { start_addr: 0x7f0000000000, end_addr: 0x7f0000400000, rss: 512 },
                VmaRecord { start_addr: 0x7ffd00000000, end_addr: 0x7ffd00021000, rss: 3 },
            ]
        );
        Ok(())
    }

    #[test]
    fn test_misplaced_rss_fails_the_whole_pass() -> anyhow::Result<()> {
        let broken = SMAPS.replacen(
            "Rss:                   2 mB",
            "Pss:                   2 mB",
            1,
        );
        let mut vmas = VmaArray::with_capacity(8)?;
        match parse_smaps(&broken, &mut vmas, 4096) {
            Err(RssError::Parse { line, .. }) => assert!(line.starts_with("Pss:")),
            r => panic!("unexpected {:?}", r),
        }

        let cut = "00400000-00404000 r-xp 00000000 fe:00 1234 /usr/bin/cat\nSize: 16 kB\n";
        assert!(matches!(
            parse_smaps(cut, &mut vmas, 4096),
            Err(RssError::Parse { .. })
        ));
        Ok(())
    }

    #[test]
    fn test_engine_reopens_each_tick() -> anyhow::Result<()> {
        let mut f = tempfile::NamedTempFile::new()?;
        f.write_all(SMAPS.as_bytes())?;
        f.flush()?;
        let config = ArenaConfig {
            snapshot_bytes: 1 << 16,
            max_vmas: 16,
        };
        let ps = page_size()?;
        let mut engine = SmapsEngine::from_path(7, f.path(), config)?;
        {
            let sample = engine.sample()?;
            assert_eq!(sample.pid, 7);
            assert_eq!(sample.vmas.len(), 3);
            assert_eq!(sample.total_rss_bytes(), (8 + 2048 + 12) * 1024);
            assert!(sample.vmas.iter().all(|v| v.rss <= v.pages(ps)));
        }

        std::fs::write(f.path(), SMAPS.lines().take(23).collect::<Vec<_>>().join("\n"))?;
        assert_eq!(engine.sample()?.vmas.len(), 1);
        Ok(())
    }

    #[test]
    fn test_engine_snapshot_too_large() -> anyhow::Result<()> {
        let mut f = tempfile::NamedTempFile::new()?;
        f.write_all(SMAPS.as_bytes())?;
        f.flush()?;
        let config = ArenaConfig {
            snapshot_bytes: 64,
            max_vmas: 16,
        };
        let mut engine = SmapsEngine::from_path(7, f.path(), config)?;
        match engine.sample() {
            Err(RssError::SnapshotTooLarge { capacity: 64, needed }) => assert!(needed > 64),
            r => panic!("unexpected {:?}", r),
        }
        Ok(())
    }

    #[test]
    fn test_engine_target_gone() -> anyhow::Result<()> {
        let f = tempfile::NamedTempFile::new()?;
        let config = ArenaConfig {
            snapshot_bytes: 4096,
            max_vmas: 4,
        };
        let mut engine = SmapsEngine::from_path(7, f.path(), config)?;
        let path = f.path().to_path_buf();
        drop(f);
        assert!(!path.exists());
        match engine.sample() {
            Err(e @ RssError::Open { .. }) => {
                assert!(e.ends_sampling());
                assert_eq!(e.exit_code(), -3);
            }
            r => panic!("unexpected {:?}", r),
        }
        Ok(())
    }
}
