//! Futex wait/wake on words that live in shared memory.
//!
//! The words are addressed from several processes, so the private futex flag
//! is never used. Targets without futexes fall back to short sleeps.

use std::io;
use std::time::Duration;

use crate::sync::AtomicU32;

#[cfg(all(not(target_os = "linux"), not(feature = "loom")))]
const POLL_SLEEP: Duration = Duration::from_millis(1);

/// Block while `word` still holds `expected`, for at most `timeout`.
///
/// Returns `Ok(())` when woken, when the value already differs, on a
/// spurious wakeup, and once the timeout elapses. Callers re-check their
/// condition in a loop.
#[cfg(all(target_os = "linux", not(feature = "loom")))]
pub fn wait(word: &AtomicU32, expected: u32, timeout: Duration) -> io::Result<()> {
    let ts = libc::timespec {
        tv_sec: timeout.as_secs().min(libc::time_t::MAX as u64) as libc::time_t,
        tv_nsec: timeout.subsec_nanos() as libc::c_long,
    };
    // SAFETY: `word` is a live, 4-byte aligned u32 for the duration of the
    // call and `ts` outlives the syscall.
    let rc = unsafe {
        libc::syscall(
            libc::SYS_futex,
            word.as_ptr(),
            libc::FUTEX_WAIT,
            expected,
            &ts as *const libc::timespec,
        )
    };
    if rc == 0 {
        return Ok(());
    }
    let err = io::Error::last_os_error();
    match err.raw_os_error() {
        Some(libc::EAGAIN) | Some(libc::EINTR) | Some(libc::ETIMEDOUT) => Ok(()),
        _ => Err(err),
    }
}

/// Wake up to `count` waiters blocked on `word`.
#[cfg(all(target_os = "linux", not(feature = "loom")))]
pub fn wake(word: &AtomicU32, count: i32) {
    // SAFETY: `word` is a live, 4-byte aligned u32. FUTEX_WAKE only uses the
    // address as a key and never dereferences it.
    unsafe {
        libc::syscall(libc::SYS_futex, word.as_ptr(), libc::FUTEX_WAKE, count);
    }
}

#[cfg(any(not(target_os = "linux"), feature = "loom"))]
pub fn wait(word: &AtomicU32, expected: u32, timeout: Duration) -> io::Result<()> {
    use crate::sync::Ordering;

    if word.load(Ordering::Acquire) == expected {
        #[cfg(feature = "loom")]
        {
            let _ = timeout;
            crate::sync::thread::yield_now();
        }
        #[cfg(not(feature = "loom"))]
        std::thread::sleep(timeout.min(POLL_SLEEP));
    }
    Ok(())
}

#[cfg(any(not(target_os = "linux"), feature = "loom"))]
pub fn wake(_word: &AtomicU32, _count: i32) {}
