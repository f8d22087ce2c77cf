//! Cross-process wait/wake on the header's size cell.
//!
//! Linux futexes compare a 32-bit word, while the size cell is 64 bits.
//! The cell only ever grows, so its low-order word changes on every
//! publish; waiters sleep on that word and recheck the full 64-bit value
//! around the syscall. No `FUTEX_PRIVATE_FLAG`: the cell lives in a
//! shared file mapping and the waiters are other processes.

use crate::errors::MfdError;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Outcome of a bounded wait on a cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WaitOutcome {
    /// The cell left `expected`; carries the observed value.
    Changed(u64),
    /// The timeout elapsed with the cell still at `expected`.
    TimedOut,
    /// Woken or interrupted without a change. Callers recheck their own
    /// conditions and wait again.
    Woken,
}

#[cfg(target_os = "linux")]
mod sys {
    use super::*;
    use std::io;
    use std::ptr;

    fn futex_word(cell: &AtomicU64) -> *mut u32 {
        let base = cell.as_ptr().cast::<u32>();
        if cfg!(target_endian = "big") {
            // The low-order word of a big-endian u64 is the second one.
            // SAFETY: an AtomicU64 spans exactly two u32 words.
            unsafe { base.add(1) }
        } else {
            base
        }
    }

    fn futex(
        word: *mut u32,
        op: libc::c_int,
        val: u32,
        timeout: *const libc::timespec,
    ) -> libc::c_long {
        // SAFETY: `word` points into a mapping that outlives the call;
        // the kernel only reads the remaining arguments.
        unsafe { libc::syscall(libc::SYS_futex, word, op, val, timeout, ptr::null::<u32>(), 0u32) }
    }

    /// Block until the cell's value differs from `expected` and return
    /// the observed value. Interrupts and already-changed races are
    /// absorbed by rechecking.
    #[cfg_attr(not(test), allow(dead_code))]
    pub(crate) fn wait(cell: &AtomicU64, expected: u64) -> Result<u64, MfdError> {
        loop {
            let current = cell.load(Ordering::Acquire);
            if current != expected {
                return Ok(current);
            }
            let rc = futex(
                futex_word(cell),
                libc::FUTEX_WAIT,
                expected as u32,
                ptr::null(),
            );
            if rc == 0 {
                continue;
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EAGAIN) | Some(libc::EINTR) => continue,
                _ => {
                    return Err(MfdError::Wait {
                        op: "FUTEX_WAIT",
                        source: err,
                    });
                }
            }
        }
    }

    /// Like `wait`, but bounded. A wake that leaves the value unchanged
    /// is reported as `Woken` rather than re-armed, so callers can poll
    /// shutdown flags.
    pub(crate) fn wait_timeout(
        cell: &AtomicU64,
        expected: u64,
        timeout: Duration,
    ) -> Result<WaitOutcome, MfdError> {
        let current = cell.load(Ordering::Acquire);
        if current != expected {
            return Ok(WaitOutcome::Changed(current));
        }
        let ts = libc::timespec {
            tv_sec: timeout.as_secs() as libc::time_t,
            tv_nsec: timeout.subsec_nanos() as libc::c_long,
        };
        let rc = futex(futex_word(cell), libc::FUTEX_WAIT, expected as u32, &ts);
        if rc == 0 {
            let now = cell.load(Ordering::Acquire);
            return Ok(if now != expected {
                WaitOutcome::Changed(now)
            } else {
                WaitOutcome::Woken
            });
        }
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::ETIMEDOUT) => {
                let now = cell.load(Ordering::Acquire);
                Ok(if now != expected {
                    WaitOutcome::Changed(now)
                } else {
                    WaitOutcome::TimedOut
                })
            }
            Some(libc::EAGAIN) => {
                // The word changed between our load and the syscall.
                let now = cell.load(Ordering::Acquire);
                Ok(if now != expected {
                    WaitOutcome::Changed(now)
                } else {
                    WaitOutcome::Woken
                })
            }
            Some(libc::EINTR) => Ok(WaitOutcome::Woken),
            _ => Err(MfdError::Wait {
                op: "FUTEX_WAIT",
                source: err,
            }),
        }
    }

    /// Wake every process sleeping on the cell. Returns how many waiters
    /// the kernel released.
    pub(crate) fn wake_all(cell: &AtomicU64) -> Result<usize, MfdError> {
        let rc = futex(
            futex_word(cell),
            libc::FUTEX_WAKE,
            i32::MAX as u32,
            ptr::null(),
        );
        if rc < 0 {
            return Err(MfdError::Wait {
                op: "FUTEX_WAKE",
                source: io::Error::last_os_error(),
            });
        }
        Ok(rc as usize)
    }
}

#[cfg(not(target_os = "linux"))]
mod sys {
    use super::*;
    use std::thread;
    use std::time::Instant;

    // No portable cross-process futex; fall back to a short sleep-poll.
    const POLL: Duration = Duration::from_millis(2);

    #[cfg_attr(not(test), allow(dead_code))]
    pub(crate) fn wait(cell: &AtomicU64, expected: u64) -> Result<u64, MfdError> {
        loop {
            let current = cell.load(Ordering::Acquire);
            if current != expected {
                return Ok(current);
            }
            thread::sleep(POLL);
        }
    }

    pub(crate) fn wait_timeout(
        cell: &AtomicU64,
        expected: u64,
        timeout: Duration,
    ) -> Result<WaitOutcome, MfdError> {
        let deadline = Instant::now() + timeout;
        loop {
            let current = cell.load(Ordering::Acquire);
            if current != expected {
                return Ok(WaitOutcome::Changed(current));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(WaitOutcome::TimedOut);
            }
            thread::sleep(POLL.min(deadline - now));
        }
    }

    pub(crate) fn wake_all(_cell: &AtomicU64) -> Result<usize, MfdError> {
        Ok(0)
    }
}

pub(crate) use sys::{wait, wait_timeout, wake_all};
