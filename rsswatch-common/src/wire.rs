//! The ring buffer wire format.
//!
//! Every record starts with an [`EventHeader`]: the type tag, the `pid_tid` of the calling thread
//! and a `CLOCK_MONOTONIC` timestamp in nanoseconds. The payload that follows is fixed per type,
//! and record sizes differ per type, so a consumer must dispatch on the tag before touching
//! anything past the header.
//!
//! Records are built exclusively out of `u64` words and `[u8; TASK_COMM_LEN]` arrays, hence they
//! carry no padding and their layout is identical on the producer and the consumer side.

use core::fmt;
use core::mem::size_of;

/// Version of the layout below; bumped whenever any record changes shape.
pub const WIRE_VERSION: u8 = 1;

/// Length of `task_struct::comm`, the kernel's process name buffer.
pub const TASK_COMM_LEN: usize = 16;

/// `CLONE_THREAD`, from `include/uapi/linux/sched.h`.
pub const CLONE_THREAD: u64 = 0x0001_0000;

/// Size of [`EventHeader`] on the wire.
pub const HEADER_SIZE: usize = size_of::<EventHeader>();

///////////////////////////////////////////////////////////////////////////////////////////////////
//
// EventType
//
///////////////////////////////////////////////////////////////////////////////////////////////////

/// The kind of a record, as carried in the low byte of [`EventHeader::type_tag`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum EventType {
    MmapEnter = 1,
    MmapExit = 2,
    MremapEnter = 3,
    MremapExit = 4,
    Munmap = 5,
    BrkEnter = 6,
    BrkExit = 7,
    CloneEnter = 8,
    CloneExit = 9,
    Clone3Enter = 10,
    Clone3Exit = 11,
    VforkEnter = 12,
    VforkExit = 13,
}

impl EventType {
    /// Convert from a raw u8 value.
    pub const fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(Self::MmapEnter),
            2 => Some(Self::MmapExit),
            3 => Some(Self::MremapEnter),
            4 => Some(Self::MremapExit),
            5 => Some(Self::Munmap),
            6 => Some(Self::BrkEnter),
            7 => Some(Self::BrkExit),
            8 => Some(Self::CloneEnter),
            9 => Some(Self::CloneExit),
            10 => Some(Self::Clone3Enter),
            11 => Some(Self::Clone3Exit),
            12 => Some(Self::VforkEnter),
            13 => Some(Self::VforkExit),
            _ => None,
        }
    }

    /// Returns the canonical label name.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::MmapEnter => "mmap_enter",
            Self::MmapExit => "mmap_exit",
            Self::MremapEnter => "mremap_enter",
            Self::MremapExit => "mremap_exit",
            Self::Munmap => "munmap",
            Self::BrkEnter => "brk_enter",
            Self::BrkExit => "brk_exit",
            Self::CloneEnter => "clone_enter",
            Self::CloneExit => "clone_exit",
            Self::Clone3Enter => "clone3_enter",
            Self::Clone3Exit => "clone3_exit",
            Self::VforkEnter => "vfork_enter",
            Self::VforkExit => "vfork_exit",
        }
    }

    /// `true` for the syscall-entry half of an enter/exit pair.
    pub const fn is_enter(self) -> bool {
        matches!(
            self,
            Self::MmapEnter
                | Self::MremapEnter
                | Self::BrkEnter
                | Self::CloneEnter
                | Self::Clone3Enter
                | Self::VforkEnter
        )
    }

    /// `true` for the syscall-exit half of an enter/exit pair.
    pub const fn is_exit(self) -> bool {
        matches!(
            self,
            Self::MmapExit
                | Self::MremapExit
                | Self::BrkExit
                | Self::CloneExit
                | Self::Clone3Exit
                | Self::VforkExit
        )
    }

    /// The exit type that completes this enter type, if any.
    pub const fn exit_of(self) -> Option<Self> {
        match self {
            Self::MmapEnter => Some(Self::MmapExit),
            Self::MremapEnter => Some(Self::MremapExit),
            Self::BrkEnter => Some(Self::BrkExit),
            Self::CloneEnter => Some(Self::CloneExit),
            Self::Clone3Enter => Some(Self::Clone3Exit),
            Self::VforkEnter => Some(Self::VforkExit),
            _ => None,
        }
    }

    /// `true` for the exits of the process-creating syscalls, whose return value is a child pid.
    pub const fn creates_process(self) -> bool {
        matches!(self, Self::CloneExit | Self::Clone3Exit | Self::VforkExit)
    }

    /// The value stored in [`EventHeader::type_tag`] for this type.
    #[inline(always)]
    pub const fn tag(self) -> u64 {
        (WIRE_VERSION as u64) << 8 | self as u64
    }

    /// Split a raw tag into its version and raw event type.
    #[inline(always)]
    pub const fn split_tag(tag: u64) -> (u8, u8) {
        ((tag >> 8) as u8, tag as u8)
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

///////////////////////////////////////////////////////////////////////////////////////////////////
//
// EventHeader
//
///////////////////////////////////////////////////////////////////////////////////////////////////

/// Compose a `pid_tid` word the way `bpf_get_current_pid_tgid()` does.
#[inline(always)]
pub const fn pid_tid(pid: u32, tid: u32) -> u64 {
    (pid as u64) << 32 | tid as u64
}

/// The common prefix of every record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct EventHeader {
    pub type_tag: u64,
    /// Process id in the high 32 bits, thread id in the low 32 bits.
    pub pid_tid: u64,
    pub timestamp_ns: u64,
}

impl EventHeader {
    #[inline(always)]
    pub const fn new(event_type: EventType, pid_tid: u64, timestamp_ns: u64) -> Self {
        EventHeader {
            type_tag: event_type.tag(),
            pid_tid,
            timestamp_ns,
        }
    }

    #[inline(always)]
    pub const fn pid(&self) -> u32 {
        (self.pid_tid >> 32) as u32
    }

    #[inline(always)]
    pub const fn tid(&self) -> u32 {
        self.pid_tid as u32
    }
}

///////////////////////////////////////////////////////////////////////////////////////////////////
//
// Records
//
///////////////////////////////////////////////////////////////////////////////////////////////////

/// A fixed-layout record that can be published to, and read back from, the ring buffer.
///
/// # Safety
///
/// Implementors must be `#[repr(C)]`, start with an [`EventHeader`], contain no padding, and be
/// valid for every bit pattern, so that a consumer may materialize one out of raw bytes.
pub unsafe trait Record: Copy {
    const EVENT_TYPE: EventType;

    /// Size of the record on the wire.
    const SIZE: usize = size_of::<Self>();

    fn header(&self) -> &EventHeader;
}

macro_rules! record {
    (
        $(#[$meta:meta])*
        $name:ident, $size:literal {
            $( $(#[$fmeta:meta])* $field:ident : $fty:ty ),* $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        #[repr(C)]
        pub struct $name {
            pub header: EventHeader,
            $( $(#[$fmeta])* pub $field: $fty, )*
        }

        unsafe impl Record for $name {
            const EVENT_TYPE: EventType = EventType::$name;

            #[inline(always)]
            fn header(&self) -> &EventHeader {
                &self.header
            }
        }

        const _: () = assert!(size_of::<$name>() == $size);
    };
}

record! {
    /// `brk(2)` entry: the requested program break.
    BrkEnter, 48 {
        requested_brk: u64,
        comm: [u8; TASK_COMM_LEN],
    }
}

record! {
    /// `brk(2)` exit: the program break after the call.
    BrkExit, 48 {
        actual_brk: u64,
        comm: [u8; TASK_COMM_LEN],
    }
}

record! {
    /// `mmap(2)` entry.
    MmapEnter, 72 {
        /// Address hint; usually 0.
        requested_addr: u64,
        size: u64,
        prot: u64,
        flags: u64,
        comm: [u8; TASK_COMM_LEN],
    }
}

record! {
    /// `mmap(2)` exit: the mapped address, or a negated errno.
    MmapExit, 32 {
        actual_addr: u64,
    }
}

record! {
    /// `mremap(2)` entry.
    MremapEnter, 80 {
        old_addr: u64,
        old_size: u64,
        /// Only meaningful with `MREMAP_FIXED`.
        new_addr: u64,
        new_size: u64,
        flags: u64,
        comm: [u8; TASK_COMM_LEN],
    }
}

record! {
    /// `mremap(2)` exit: the new address, or a negated errno.
    MremapExit, 32 {
        new_addr: u64,
    }
}

record! {
    /// `munmap(2)`; reported on entry only.
    Munmap, 56 {
        start_addr: u64,
        size: u64,
        comm: [u8; TASK_COMM_LEN],
    }
}

record! {
    /// `clone(2)` entry, with the raw arguments in x86-64 order. Never emitted for
    /// `CLONE_THREAD`.
    CloneEnter, 80 {
        flags: u64,
        newsp: u64,
        parent_tid: u64,
        child_tid: u64,
        tls: u64,
        comm: [u8; TASK_COMM_LEN],
    }
}

record! {
    /// `clone(2)` exit: the child pid in the parent, 0 in the child, or a negated errno.
    CloneExit, 32 {
        child_pid: u64,
    }
}

record! {
    /// `clone3(2)` entry. The arguments live in user memory; `args_valid` is 0 when they could
    /// not be read and every argument field is then 0.
    Clone3Enter, 80 {
        args_valid: u64,
        flags: u64,
        pidfd: u64,
        child_tid: u64,
        parent_tid: u64,
        comm: [u8; TASK_COMM_LEN],
    }
}

record! {
    /// `clone3(2)` exit.
    Clone3Exit, 32 {
        child_pid: u64,
    }
}

record! {
    /// `vfork(2)` entry.
    VforkEnter, 40 {
        comm: [u8; TASK_COMM_LEN],
    }
}

record! {
    /// `vfork(2)` exit.
    VforkExit, 32 {
        child_pid: u64,
    }
}

const _: () = assert!(HEADER_SIZE == 24);

///////////////////////////////////////////////////////////////////////////////////////////////////
//
// tests
//
///////////////////////////////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tag_round_trip_for_every_type() {
        for raw in 1..=13u8 {
            let ty = EventType::from_u8(raw).unwrap();
            assert_eq!(EventType::split_tag(ty.tag()), (WIRE_VERSION, raw));
        }
        assert_eq!(EventType::from_u8(0), None);
        assert_eq!(EventType::from_u8(14), None);
    }

    #[test]
    fn test_enter_exit_pairs() {
        for raw in 1..=13u8 {
            let ty = EventType::from_u8(raw).unwrap();
            assert!(!(ty.is_enter() && ty.is_exit()), "{}", ty);
            if let Some(exit) = ty.exit_of() {
                assert!(ty.is_enter());
                assert!(exit.is_exit());
            }
        }
        assert!(!EventType::Munmap.is_enter());
        assert!(!EventType::Munmap.is_exit());
    }

    #[test]
    fn test_header_splits_pid_tid() {
        let h = EventHeader::new(EventType::MmapEnter, pid_tid(4242, 4243), 7);
        assert_eq!(h.pid(), 4242);
        assert_eq!(h.tid(), 4243);
        assert_eq!(h.type_tag & 0xff, EventType::MmapEnter as u64);
    }

    #[test]
    fn test_header_is_the_record_prefix() {
        // The consumer reads the header out of the first bytes of any record.
        let rec = Munmap {
            header: EventHeader::new(EventType::Munmap, pid_tid(1, 2), 99),
            start_addr: 0x1000,
            size: 0x2000,
            comm: *b"munmapper\0\0\0\0\0\0\0",
        };
        let bytes = as_bytes(&rec);
        assert_eq!(bytes.len(), 56);
        assert_eq!(&bytes[..8], &EventType::Munmap.tag().to_ne_bytes());
        assert_eq!(&bytes[8..16], &pid_tid(1, 2).to_ne_bytes());
        assert_eq!(&bytes[16..24], &99u64.to_ne_bytes());
        assert_eq!(&bytes[24..32], &0x1000u64.to_ne_bytes());
    }

    fn as_bytes<R: Record>(rec: &R) -> &[u8] {
        unsafe { core::slice::from_raw_parts(rec as *const R as *const u8, R::SIZE) }
    }
}
