//! Per-process virtual memory footprint, folded from correlated syscall reports.
//!
//! Every process keeps a set of disjoint address ranges. A successful `mmap` adds one, `munmap`
//! removes one (splitting a range it only partly covers), and `mremap` moves one. Ranges that
//! touch or overlap are coalesced. The program break is followed per thread: once a baseline is
//! known, growing the break adds the new heap range and shrinking it removes the freed one.

use std::collections::{BTreeMap, HashMap};

use serde::Serialize;

use crate::correlate::Correlated;
use crate::events::{Event, Payload};

/// A range of virtual memory, `[start_addr, end_addr)`, and the command that allocated it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Allocation {
    pub start_addr: u64,
    pub end_addr: u64,
    pub comm: String,
}

impl Allocation {
    #[inline(always)]
    pub fn size(&self) -> u64 {
        self.end_addr - self.start_addr
    }

    /// Pages spanned, counting a partial last page as a whole one.
    #[inline(always)]
    pub fn pages(&self, page_size: u64) -> u64 {
        (self.size() + page_size - 1) / page_size
    }
}

/// Totals of one process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Footprint {
    pub pid: u32,
    pub allocations: usize,
    pub bytes: u64,
    pub pages: u64,
}

/// Keeps the allocations of every process seen in the reports it is fed.
#[derive(Debug)]
pub struct AllocationTracker {
    page_size: u64,
    /// Keyed by start address; ranges never touch each other.
    by_pid: HashMap<u32, BTreeMap<u64, Allocation>>,
    /// Last known program break, per `pid_tid`.
    breaks: HashMap<u64, u64>,
}

impl AllocationTracker {
    pub fn new(page_size: u64) -> Self {
        AllocationTracker {
            page_size,
            by_pid: HashMap::new(),
            breaks: HashMap::new(),
        }
    }

    /// Fold one report in. Failed syscalls and process creation leave the footprint alone.
    pub fn observe(&mut self, report: &Correlated) {
        match report {
            Correlated::Pair { enter, exit } => self.observe_pair(enter, exit),
            Correlated::Single(event) => match &event.payload {
                Payload::Munmap {
                    start_addr, size, ..
                } => {
                    self.remove(event.pid, *start_addr, *size);
                }
                Payload::BrkExit { actual_brk, comm } => {
                    self.program_break(event, *actual_brk, comm);
                }
                _ => {}
            },
        }
    }

    fn observe_pair(&mut self, enter: &Event, exit: &Event) {
        let pid = exit.pid;
        match (&enter.payload, &exit.payload) {
            (Payload::MmapEnter { size, comm, .. }, Payload::MmapExit { ret }) => {
                if let Some(addr) = succeeded(*ret) {
                    self.add(pid, addr, *size, comm);
                }
            }
            (
                Payload::MremapEnter {
                    old_addr,
                    old_size,
                    new_size,
                    comm,
                    ..
                },
                Payload::MremapExit { ret },
            ) => {
                if let Some(addr) = succeeded(*ret) {
                    self.remove(pid, *old_addr, *old_size);
                    self.add(pid, addr, *new_size, comm);
                }
            }
            (_, Payload::BrkExit { actual_brk, comm }) => {
                self.program_break(exit, *actual_brk, comm);
            }
            _ => {}
        }
    }

    /// Add `[start_addr, start_addr + size)` to the allocations of `pid`, coalescing it with
    /// every range it touches. The merged range keeps the command of the lowest one.
    pub fn add(&mut self, pid: u32, start_addr: u64, size: u64, comm: &str) {
        if size == 0 {
            return;
        }
        let set = self.by_pid.entry(pid).or_default();
        let mut merged = Allocation {
            start_addr,
            end_addr: start_addr.saturating_add(size),
            comm: comm.to_owned(),
        };
        // Ranges are disjoint, so walking down from the last one starting at or before the end,
        // ends decrease as well.
        let touching: Vec<u64> = set
            .range(..=merged.end_addr)
            .rev()
            .take_while(|(_, a)| a.end_addr >= merged.start_addr)
            .map(|(&start, _)| start)
            .collect();
        for start in touching {
            if let Some(a) = set.remove(&start) {
                merged.end_addr = merged.end_addr.max(a.end_addr);
                if a.start_addr <= merged.start_addr {
                    merged.start_addr = a.start_addr;
                    merged.comm = a.comm;
                }
            }
        }
        tracing::trace!(pid, start = merged.start_addr, end = merged.end_addr, "allocation");
        set.insert(merged.start_addr, merged);
    }

    /// Remove `[start_addr, start_addr + size)` from the allocations of `pid`, trimming or
    /// splitting the ranges it partly covers. Returns `false` if nothing was tracked there.
    pub fn remove(&mut self, pid: u32, start_addr: u64, size: u64) -> bool {
        let end_addr = start_addr.saturating_add(size);
        let set = match self.by_pid.get_mut(&pid) {
            Some(set) if size > 0 => set,
            _ => return false,
        };
        let overlapping: Vec<u64> = set
            .range(..end_addr)
            .rev()
            .take_while(|(_, a)| a.end_addr > start_addr)
            .map(|(&start, _)| start)
            .collect();
        if overlapping.is_empty() {
            tracing::debug!(pid, start_addr, size, "release of untracked memory");
            return false;
        }
        for start in overlapping {
            if let Some(a) = set.remove(&start) {
                if a.start_addr < start_addr {
                    let head = Allocation {
                        start_addr: a.start_addr,
                        end_addr: start_addr,
                        comm: a.comm.clone(),
                    };
                    set.insert(head.start_addr, head);
                }
                if a.end_addr > end_addr {
                    let tail = Allocation {
                        start_addr: end_addr,
                        end_addr: a.end_addr,
                        comm: a.comm,
                    };
                    set.insert(tail.start_addr, tail);
                }
            }
        }
        if set.is_empty() {
            self.by_pid.remove(&pid);
        }
        true
    }

    fn program_break(&mut self, exit: &Event, new_brk: u64, comm: &str) {
        let old_brk = match self.breaks.insert(exit.pid_tid(), new_brk) {
            Some(old) => old,
            None => {
                tracing::debug!(pid = exit.pid, tid = exit.tid, base = new_brk, "heap baseline");
                return;
            }
        };
        if new_brk > old_brk {
            self.add(exit.pid, old_brk, new_brk - old_brk, comm);
        } else if new_brk < old_brk {
            self.remove(exit.pid, new_brk, old_brk - new_brk);
        }
    }

    /// The allocations of `pid`, in address order.
    pub fn allocations(&self, pid: u32) -> impl Iterator<Item = &Allocation> + '_ {
        self.by_pid.get(&pid).into_iter().flat_map(|set| set.values())
    }

    /// Per-process totals, by pid.
    pub fn footprints(&self) -> Vec<Footprint> {
        let mut out: Vec<_> = self
            .by_pid
            .iter()
            .map(|(&pid, set)| Footprint {
                pid,
                allocations: set.len(),
                bytes: set.values().map(Allocation::size).sum(),
                pages: set.values().map(|a| a.pages(self.page_size)).sum(),
            })
            .collect();
        out.sort_unstable_by_key(|f| f.pid);
        out
    }
}

/// The address returned by a successful `mmap`/`mremap`; failures return a negated errno.
#[inline(always)]
fn succeeded(ret: i64) -> Option<u64> {
    u64::try_from(ret).ok()
}

///////////////////////////////////////////////////////////////////////////////////////////////////
//
// tests
//
///////////////////////////////////////////////////////////////////////////////////////////////////
