//! Records exchanged between the rsswatch kernel probes and user space, and the logic the probes
//! run on every traced syscall.
//!
//! The crate is `no_std` so that the very same definitions are compiled into the eBPF object and
//! into the user-space decoder; a record is never described twice.
#![cfg_attr(not(test), no_std)]
#![warn(rust_2018_idioms)]
#![deny(unreachable_pub)]

pub mod probe;
pub mod wire;

pub use wire::{
    pid_tid, BrkEnter, BrkExit, Clone3Enter, Clone3Exit, CloneEnter, CloneExit, EventHeader,
    EventType, MmapEnter, MmapExit, MremapEnter, MremapExit, Munmap, Record,
    VforkEnter, VforkExit, CLONE_THREAD, HEADER_SIZE, TASK_COMM_LEN, WIRE_VERSION,
};
