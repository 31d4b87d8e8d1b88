#![no_std]
#![no_main]

use aya_ebpf::{
    helpers::{
        bpf_get_current_comm, bpf_get_current_pid_tgid, bpf_ktime_get_ns, bpf_probe_read_user,
    },
    macros::{map, tracepoint},
    maps::RingBuf,
    programs::TracePointContext,
};
use rsswatch_common::{
    probe::{self, CloneArgsHead, RecordSink, SyscallContext},
    Record, TASK_COMM_LEN,
};

/// Byte size of the ring buffer shared with user space; a power of two multiple of the page size.
const RING_BUFFER_BYTES: u32 = 256 * 1024;

/// Offset of `args[0]` in `trace_event_raw_sys_enter` (8 bytes of common fields, `int
/// __syscall_nr`, 4 bytes of padding).
const SYS_ENTER_ARGS_OFFSET: usize = 16;
/// Offset of `ret` in `trace_event_raw_sys_exit`.
const SYS_EXIT_RET_OFFSET: usize = 16;

#[map]
static EVENTS: RingBuf = RingBuf::with_byte_size(RING_BUFFER_BYTES, 0);

struct Syscall<'a>(&'a TracePointContext);

impl SyscallContext for Syscall<'_> {
    #[inline(always)]
    fn pid_tid(&self) -> u64 {
        bpf_get_current_pid_tgid()
    }

    #[inline(always)]
    fn timestamp_ns(&self) -> u64 {
        unsafe { bpf_ktime_get_ns() }
    }

    #[inline(always)]
    fn comm(&self) -> [u8; TASK_COMM_LEN] {
        bpf_get_current_comm().unwrap_or([0; TASK_COMM_LEN])
    }

    #[inline(always)]
    fn arg(&self, n: usize) -> u64 {
        unsafe { self.0.read_at::<u64>(SYS_ENTER_ARGS_OFFSET + n * 8) }.unwrap_or(0)
    }

    #[inline(always)]
    fn ret(&self) -> i64 {
        unsafe { self.0.read_at::<i64>(SYS_EXIT_RET_OFFSET) }.unwrap_or(0)
    }

    #[inline(always)]
    fn read_user_clone_args(&self, uargs: u64) -> Option<CloneArgsHead> {
        if uargs == 0 {
            return None;
        }
        unsafe { bpf_probe_read_user(uargs as *const CloneArgsHead) }.ok()
    }
}

struct Ring;

impl RecordSink for Ring {
    #[inline(always)]
    fn submit<R: Record>(&self, record: &R) -> bool {
        // A full ring buffer drops the record; nothing can be done about it from here.
        EVENTS.output(record, 0).is_ok()
    }
}

macro_rules! syscall_tracepoint {
    ($($prog:ident => $handler:path;)*) => {
        $(
            #[tracepoint]
            pub fn $prog(ctx: TracePointContext) -> u32 {
                $handler(&Syscall(&ctx), &Ring);
                0
            }
        )*
    };
}

syscall_tracepoint! {
    sys_enter_brk => probe::brk_enter;
    sys_exit_brk => probe::brk_exit;
    sys_enter_mmap => probe::mmap_enter;
    sys_exit_mmap => probe::mmap_exit;
    sys_enter_mremap => probe::mremap_enter;
    sys_exit_mremap => probe::mremap_exit;
    sys_enter_munmap => probe::munmap_enter;
    sys_enter_clone => probe::clone_enter;
    sys_exit_clone => probe::clone_exit;
    sys_enter_clone3 => probe::clone3_enter;
    sys_exit_clone3 => probe::clone3_exit;
    sys_enter_vfork => probe::vfork_enter;
    sys_exit_vfork => probe::vfork_exit;
}

#[cfg(not(test))]
#[panic_handler]
fn panic(_info: &core::panic::PanicInfo<'_>) -> ! {
    loop {}
}

#[link_section = "license"]
#[no_mangle]
static LICENSE: [u8; 4] = *b"GPL\0";
