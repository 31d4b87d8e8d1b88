//! What every syscall tracepoint does, independent of where it runs.
//!
//! The eBPF object adapts the tracepoint context and the ring buffer to [`SyscallContext`] and
//! [`RecordSink`] and calls one handler per tracepoint; the same handlers run under test with an
//! in-memory context and sink. Handlers are bounded, never allocate, never block and never fail:
//! a record the sink cannot take is dropped.

use crate::wire::{
    BrkEnter, BrkExit, Clone3Enter, Clone3Exit, CloneEnter, CloneExit, EventHeader, EventType,
    MmapEnter, MmapExit, MremapEnter, MremapExit, Munmap, Record, VforkEnter, VforkExit,
    CLONE_THREAD, TASK_COMM_LEN,
};

/// The leading fields of the kernel's `struct clone_args` (`include/uapi/linux/sched.h`).
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct CloneArgsHead {
    pub flags: u64,
    pub pidfd: u64,
    pub child_tid: u64,
    pub parent_tid: u64,
}

/// The view of the current syscall a handler needs.
pub trait SyscallContext {
    /// `bpf_get_current_pid_tgid()`: pid in the high half, tid in the low half.
    fn pid_tid(&self) -> u64;

    /// Monotonic nanoseconds.
    fn timestamp_ns(&self) -> u64;

    /// The current task's command name; truncated, not necessarily NUL-terminated.
    fn comm(&self) -> [u8; TASK_COMM_LEN];

    /// Syscall argument `n` on entry tracepoints; 0 when it cannot be read.
    fn arg(&self, n: usize) -> u64;

    /// Syscall return value on exit tracepoints.
    fn ret(&self) -> i64;

    /// Copy the head of a `struct clone_args` out of user memory at `uargs`.
    fn read_user_clone_args(&self, uargs: u64) -> Option<CloneArgsHead>;
}

/// Where records go.
pub trait RecordSink {
    /// Publish one record. Returns `false` when it was dropped (e.g., the ring buffer is full).
    fn submit<R: Record>(&self, record: &R) -> bool;
}

#[inline(always)]
fn header<C: SyscallContext>(ctx: &C, event_type: EventType) -> EventHeader {
    EventHeader::new(event_type, ctx.pid_tid(), ctx.timestamp_ns())
}

/// `true` when `clone` flags describe a new thread in the caller's thread group.
#[inline(always)]
pub const fn creates_thread(flags: u64) -> bool {
    flags & CLONE_THREAD != 0
}

#[inline(always)]
pub fn brk_enter<C: SyscallContext, S: RecordSink>(ctx: &C, sink: &S) {
    sink.submit(&BrkEnter {
        header: header(ctx, EventType::BrkEnter),
        requested_brk: ctx.arg(0),
        comm: ctx.comm(),
    });
}

#[inline(always)]
pub fn brk_exit<C: SyscallContext, S: RecordSink>(ctx: &C, sink: &S) {
    sink.submit(&BrkExit {
        header: header(ctx, EventType::BrkExit),
        actual_brk: ctx.ret() as u64,
        comm: ctx.comm(),
    });
}

#[inline(always)]
pub fn mmap_enter<C: SyscallContext, S: RecordSink>(ctx: &C, sink: &S) {
    sink.submit(&MmapEnter {
        header: header(ctx, EventType::MmapEnter),
        requested_addr: ctx.arg(0),
        size: ctx.arg(1),
        prot: ctx.arg(2),
        flags: ctx.arg(3),
        comm: ctx.comm(),
    });
}

#[inline(always)]
pub fn mmap_exit<C: SyscallContext, S: RecordSink>(ctx: &C, sink: &S) {
    sink.submit(&MmapExit {
        header: header(ctx, EventType::MmapExit),
        actual_addr: ctx.ret() as u64,
    });
}

#[inline(always)]
pub fn mremap_enter<C: SyscallContext, S: RecordSink>(ctx: &C, sink: &S) {
    // mremap(addr, old_len, new_len, flags, new_addr)
    sink.submit(&MremapEnter {
        header: header(ctx, EventType::MremapEnter),
        old_addr: ctx.arg(0),
        old_size: ctx.arg(1),
        new_size: ctx.arg(2),
        flags: ctx.arg(3),
        new_addr: ctx.arg(4),
        comm: ctx.comm(),
    });
}

#[inline(always)]
pub fn mremap_exit<C: SyscallContext, S: RecordSink>(ctx: &C, sink: &S) {
    sink.submit(&MremapExit {
        header: header(ctx, EventType::MremapExit),
        new_addr: ctx.ret() as u64,
    });
}

#[inline(always)]
pub fn munmap_enter<C: SyscallContext, S: RecordSink>(ctx: &C, sink: &S) {
    sink.submit(&Munmap {
        header: header(ctx, EventType::Munmap),
        start_addr: ctx.arg(0),
        size: ctx.arg(1),
        comm: ctx.comm(),
    });
}

/// Only process creation is reported; `CLONE_THREAD` clones are dropped here.
#[inline(always)]
pub fn clone_enter<C: SyscallContext, S: RecordSink>(ctx: &C, sink: &S) {
    let flags = ctx.arg(0);
    if creates_thread(flags) {
        return;
    }
    sink.submit(&CloneEnter {
        header: header(ctx, EventType::CloneEnter),
        flags,
        newsp: ctx.arg(1),
        parent_tid: ctx.arg(2),
        child_tid: ctx.arg(3),
        tls: ctx.arg(4),
        comm: ctx.comm(),
    });
}

#[inline(always)]
pub fn clone_exit<C: SyscallContext, S: RecordSink>(ctx: &C, sink: &S) {
    sink.submit(&CloneExit {
        header: header(ctx, EventType::CloneExit),
        child_pid: ctx.ret() as u64,
    });
}

/// `clone3(uargs, size)`. When `uargs` cannot be read the record still goes out, with
/// `args_valid == 0`; when it can, thread creation is dropped just like for `clone`.
#[inline(always)]
pub fn clone3_enter<C: SyscallContext, S: RecordSink>(ctx: &C, sink: &S) {
    let args = ctx.read_user_clone_args(ctx.arg(0));
    if let Some(args) = args {
        if creates_thread(args.flags) {
            return;
        }
    }
    let (args_valid, args) = match args {
        Some(args) => (1, args),
        None => (0, CloneArgsHead::default()),
    };
    sink.submit(&Clone3Enter {
        header: header(ctx, EventType::Clone3Enter),
        args_valid,
        flags: args.flags,
        pidfd: args.pidfd,
        child_tid: args.child_tid,
        parent_tid: args.parent_tid,
        comm: ctx.comm(),
    });
}

#[inline(always)]
pub fn clone3_exit<C: SyscallContext, S: RecordSink>(ctx: &C, sink: &S) {
    sink.submit(&Clone3Exit {
        header: header(ctx, EventType::Clone3Exit),
        child_pid: ctx.ret() as u64,
    });
}

#[inline(always)]
pub fn vfork_enter<C: SyscallContext, S: RecordSink>(ctx: &C, sink: &S) {
    sink.submit(&VforkEnter {
        header: header(ctx, EventType::VforkEnter),
        comm: ctx.comm(),
    });
}

#[inline(always)]
pub fn vfork_exit<C: SyscallContext, S: RecordSink>(ctx: &C, sink: &S) {
    sink.submit(&VforkExit {
        header: header(ctx, EventType::VforkExit),
        child_pid: ctx.ret() as u64,
    });
}

///////////////////////////////////////////////////////////////////////////////////////////////////
//
// tests
//
///////////////////////////////////////////////////////////////////////////////////////////////////
