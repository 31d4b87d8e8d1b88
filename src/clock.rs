//! Monotonic time, shared with the kernel probes.
//!
//! Samples are stamped with `CLOCK_MONOTONIC`, the clock behind `bpf_ktime_get_ns`, so sample
//! timestamps and event timestamps can be compared directly.

use std::io;
use std::time::Duration;

const NANOS_PER_SEC: u64 = 1_000_000_000;

/// Current `CLOCK_MONOTONIC` time, in nanoseconds.
pub fn now_ns() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // CLOCK_MONOTONIC is always supported and `ts` is valid, so this cannot fail.
    unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
    ts.tv_sec as u64 * NANOS_PER_SEC + ts.tv_nsec as u64
}

/// Block until `CLOCK_MONOTONIC` reaches `deadline_ns`.
///
/// Returns immediately if the deadline has already passed. Interrupted sleeps are resumed.
pub fn sleep_until(deadline_ns: u64) -> io::Result<()> {
    let ts = libc::timespec {
        tv_sec: (deadline_ns / NANOS_PER_SEC) as libc::time_t,
        tv_nsec: (deadline_ns % NANOS_PER_SEC) as libc::c_long,
    };
    loop {
        // clock_nanosleep(2) returns the error number rather than setting errno.
        match unsafe {
            libc::clock_nanosleep(
                libc::CLOCK_MONOTONIC,
                libc::TIMER_ABSTIME,
                &ts,
                std::ptr::null_mut(),
            )
        } {
            0 => return Ok(()),
            libc::EINTR => continue,
            errno => return Err(io::Error::from_raw_os_error(errno)),
        }
    }
}

/// Convert a [`Duration`] to nanoseconds, saturating at `u64::MAX`.
#[inline]
pub fn duration_ns(d: Duration) -> u64 {
    u64::try_from(d.as_nanos()).unwrap_or(u64::MAX)
}
