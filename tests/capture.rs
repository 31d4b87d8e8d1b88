//! Syscall capture against the loaded probes. Needs root and the compiled probe object:
//!
//! ```text
//! RSSWATCH_PROBES=target/bpfel-unknown-none/release/rsswatch-ebpf \
//!     cargo test --test capture -- --ignored
//! ```

use std::time::{Duration, Instant};

use rsswatch::correlate::{Correlated, Correlator, CorrelatorConfig};
use rsswatch::events::{EventType, Payload};
use rsswatch::tracer::Probes;

const LEN: usize = 1 << 20;

#[test]
#[ignore]
fn test_mmap_pair_and_munmap() -> anyhow::Result<()> {
    let path = std::env::var("RSSWATCH_PROBES")?;
    let mut probes = Probes::load(&path)?;
    assert!(probes.attached() >= 9);

    let pid = std::process::id();
    let addr = unsafe {
        let ptr = libc::mmap(
            std::ptr::null_mut(),
            LEN,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        );
        anyhow::ensure!(ptr != libc::MAP_FAILED, std::io::Error::last_os_error());
        std::ptr::write_bytes(ptr as *mut u8, 1, LEN);
        libc::munmap(ptr, LEN);
        ptr as u64
    };

    let mut correlator = Correlator::new(pid, CorrelatorConfig::default());
    let mut reports = Vec::new();
    let deadline = Instant::now() + Duration::from_secs(5);
    let found = |reports: &[Correlated]| {
        let mapped = reports.iter().any(|c| match c {
            Correlated::Pair { enter, exit } => {
                enter.pid_tid() == exit.pid_tid()
                    && matches!(
                        enter.payload,
                        Payload::MmapEnter { size, .. } if size == LEN as u64
                    )
                    && matches!(exit.payload, Payload::MmapExit { ret } if ret as u64 == addr)
            }
            Correlated::Single(_) => false,
        });
        let unmapped = reports.iter().any(|c| match c {
            Correlated::Single(e) => {
                matches!(e.payload, Payload::Munmap { start_addr, .. } if start_addr == addr)
            }
            Correlated::Pair { .. } => false,
        });
        mapped && unmapped
    };
    while !found(&reports) && Instant::now() < deadline {
        probes.poll(Duration::from_millis(100), |event| {
            correlator.observe(event, |c| reports.push(c))
        })?;
    }

    assert!(found(&reports), "{} reports, none matching", reports.len());
    assert!(reports.iter().all(|c| c.pid() == pid));
    assert!(reports
        .iter()
        .all(|c| c.event_type() != EventType::MmapEnter));
    Ok(())
}
