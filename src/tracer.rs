//! Loading the syscall probes into the kernel and draining their ring buffer.

use std::io;
use std::os::fd::AsRawFd;
use std::path::Path;
use std::time::Duration;

use aya::maps::{MapData, RingBuf};
use aya::programs::TracePoint;
use aya::Ebpf;
use caps::{CapSet, Capability};
use thiserror::Error;

use crate::events::{self, Event};

/// Name of the ring buffer map in the probe object.
const EVENTS_MAP: &str = "EVENTS";

const SYSCALLS: &str = "syscalls";

/// Every program of the probe object, named after the `syscalls` tracepoint it attaches to, and
/// whether the tracepoint must exist. `clone3` and `vfork` are missing on some architectures.
const TRACEPOINTS: &[(&str, bool)] = &[
    ("sys_enter_brk", true),
    ("sys_exit_brk", true),
    ("sys_enter_mmap", true),
    ("sys_exit_mmap", true),
    ("sys_enter_mremap", true),
    ("sys_exit_mremap", true),
    ("sys_enter_munmap", true),
    ("sys_enter_clone", true),
    ("sys_exit_clone", true),
    ("sys_enter_clone3", false),
    ("sys_exit_clone3", false),
    ("sys_enter_vfork", false),
    ("sys_exit_vfork", false),
];

/// Errors while setting up or reading the probes.
#[derive(Debug, Error)]
pub enum TraceError {
    #[error("loading probes needs CAP_BPF or CAP_SYS_ADMIN")]
    MissingCapability,

    #[error("could not query capabilities: {0}")]
    Caps(#[from] caps::errors::CapsError),

    #[error("could not load '{path}': {source}")]
    Load {
        path: String,
        #[source]
        source: aya::EbpfError,
    },

    #[error("program '{0}' not found in the probe object")]
    ProgramNotFound(&'static str),

    #[error("attaching syscalls/{name}: {source}")]
    Attach {
        name: &'static str,
        #[source]
        source: aya::programs::ProgramError,
    },

    #[error("map '{0}' not found in the probe object")]
    MapNotFound(&'static str),

    #[error("ring buffer: {0}")]
    Map(#[from] aya::maps::MapError),

    #[error("polling the ring buffer: {0}")]
    Poll(#[from] io::Error),
}

/// The syscall probes, loaded and attached. Dropping this detaches and unloads them.
pub struct Probes {
    // Owns the programs and their links.
    _ebpf: Ebpf,
    ring: RingBuf<MapData>,
    attached: usize,
    discarded: u64,
}

impl std::fmt::Debug for Probes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Probes")
            .field("attached", &self.attached)
            .field("discarded", &self.discarded)
            .finish()
    }
}

impl Probes {
    /// Load the compiled probe object at `path` and attach every tracepoint program.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, TraceError> {
        check_capabilities()?;
        raise_memlock_limit();

        let path = path.as_ref();
        let mut ebpf = Ebpf::load_file(path).map_err(|e| TraceError::Load {
            path: path.display().to_string(),
            source: e,
        })?;

        let mut attached = 0;
        for &(name, required) in TRACEPOINTS {
            match attach(&mut ebpf, name) {
                Ok(()) => {
                    attached += 1;
                    tracing::debug!(name, "attached tracepoint");
                }
                Err(e) if !required => {
                    tracing::warn!(name, error = %e, "optional tracepoint not attached");
                }
                Err(e) => return Err(e),
            }
        }

        let map = ebpf
            .take_map(EVENTS_MAP)
            .ok_or(TraceError::MapNotFound(EVENTS_MAP))?;
        let ring = RingBuf::try_from(map)?;
        tracing::info!(path = %path.display(), attached, "syscall probes loaded");

        Ok(Probes {
            _ebpf: ebpf,
            ring,
            attached,
            discarded: 0,
        })
    }

    /// Number of tracepoints attached.
    #[inline]
    pub fn attached(&self) -> usize {
        self.attached
    }

    /// Records that could not be decoded so far.
    #[inline]
    pub fn discarded(&self) -> u64 {
        self.discarded
    }

    /// Wait up to `timeout` for records, then hand every available one to `handler`, decoded.
    /// Returns the number of events handled.
    ///
    /// Records that cannot be decoded are skipped.
    pub fn poll<F: FnMut(Event)>(
        &mut self,
        timeout: Duration,
        mut handler: F,
    ) -> Result<usize, TraceError> {
        let mut pfd = libc::pollfd {
            fd: self.ring.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        let timeout_ms = i32::try_from(timeout.as_millis()).unwrap_or(i32::MAX);
        if unsafe { libc::poll(&mut pfd, 1, timeout_ms) } < 0 {
            let e = io::Error::last_os_error();
            if e.kind() != io::ErrorKind::Interrupted {
                return Err(e.into());
            }
        }

        let mut handled = 0;
        while let Some(item) = self.ring.next() {
            if handle_record(&item, &mut self.discarded, &mut handler) {
                handled += 1;
            }
        }
        Ok(handled)
    }
}

/// Decode one record and pass it on; returns whether it was. Undecodable records, including
/// empty ones, only bump `discarded`.
fn handle_record<F: FnMut(Event)>(data: &[u8], discarded: &mut u64, handler: &mut F) -> bool {
    match events::decode(data) {
        Ok(event) => {
            handler(event);
            true
        }
        Err(e) => {
            *discarded += 1;
            tracing::debug!(error = %e, len = data.len(), "discarding malformed record");
            false
        }
    }
}

fn attach(ebpf: &mut Ebpf, name: &'static str) -> Result<(), TraceError> {
    let prog: &mut TracePoint = ebpf
        .program_mut(name)
        .ok_or(TraceError::ProgramNotFound(name))?
        .try_into()
        .map_err(|e| TraceError::Attach { name, source: e })?;
    prog.load()
        .map_err(|e| TraceError::Attach { name, source: e })?;
    prog.attach(SYSCALLS, name)
        .map_err(|e| TraceError::Attach { name, source: e })?;
    Ok(())
}

fn check_capabilities() -> Result<(), TraceError> {
    // Kernels older than 5.8 know nothing of CAP_BPF.
    let bpf = caps::has_cap(None, CapSet::Effective, Capability::CAP_BPF).unwrap_or(false);
    if bpf || caps::has_cap(None, CapSet::Effective, Capability::CAP_SYS_ADMIN)? {
        Ok(())
    } else {
        Err(TraceError::MissingCapability)
    }
}

/// Kernels before 5.11 charge BPF maps against `RLIMIT_MEMLOCK`.
fn raise_memlock_limit() {
    let rlim = libc::rlimit {
        rlim_cur: libc::RLIM_INFINITY,
        rlim_max: libc::RLIM_INFINITY,
    };
    if unsafe { libc::setrlimit(libc::RLIMIT_MEMLOCK, &rlim) } != 0 {
        tracing::debug!(
            error = %io::Error::last_os_error(),
            "could not remove the locked memory limit"
        );
    }
}
