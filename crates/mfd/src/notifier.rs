//! Background thread that turns futex size changes into pipe bytes.
//!
//! Futexes cannot be polled, so each reader runs one notifier thread that
//! sleeps on the size cell and forwards every new size it observes as an
//! 8-byte native-endian write into a pipe. The pipe's read end is the
//! pollable descriptor handed to the application; when the thread exits
//! it drops the write end and the descriptor reports EOF.

use crate::futex::{self, WaitOutcome};
use crate::header::HeaderMap;
use std::fs::File;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// How long each futex sleep lasts before the shutdown flag is rechecked.
/// Bounds teardown latency when a wake races the sleep's entry.
const WAIT_SLICE: Duration = Duration::from_millis(100);

/// Stat interval while an empty backing file waits for its first writer.
const BACKING_POLL: Duration = Duration::from_millis(2);

/// Grace window between the backing file appearing and its signature
/// becoming valid. The writer stages the file length before it stamps
/// the header, so a freshly observed file may be signed a moment later.
const SIGNATURE_GRACE: Duration = Duration::from_secs(1);

/// State shared between a reader handle and its notifier thread.
pub(crate) struct ReaderShared {
    pub(crate) header: HeaderMap,
    /// Flips once the header page is backed and signed. No header cell
    /// may be touched before that; the page would fault.
    pub(crate) ready: AtomicBool,
    pub(crate) shutdown: AtomicBool,
}

pub(crate) struct Notifier {
    pub(crate) shared: Arc<ReaderShared>,
    pub(crate) tx: OwnedFd,
    pub(crate) file: File,
    pub(crate) page_size: u64,
    pub(crate) last_seen: u64,
    /// Set when the reader attached to an empty file. The thread must
    /// wait for a writer to materialize the stream before sleeping on
    /// the size cell.
    pub(crate) await_backing: bool,
}

impl Notifier {
    pub(crate) fn spawn(self) -> io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name("mfd-notify".into())
            .spawn(move || self.run())
    }

    fn run(mut self) {
        if self.await_backing && !self.wait_for_backing() {
            // Dropping `tx` here closes the pipe and signals EOF.
            return;
        }
        loop {
            if self.shared.shutdown.load(Ordering::Acquire) {
                break;
            }
            match futex::wait_timeout(self.shared.header.size_cell(), self.last_seen, WAIT_SLICE) {
                Ok(WaitOutcome::Changed(size)) => {
                    self.last_seen = size;
                    if !self.push(size) {
                        break;
                    }
                }
                Ok(WaitOutcome::TimedOut) | Ok(WaitOutcome::Woken) => {}
                Err(err) => {
                    tracing::error!(error = %err, "size wait failed; notifications stop");
                    break;
                }
            }
        }
        tracing::debug!("notifier exiting");
    }

    /// Poll until the backing file is long enough to fault the header
    /// page in, then wait for the writer's signature. Returns false if
    /// the stream never materializes, the header page cannot be locked
    /// resident, or shutdown is requested.
    fn wait_for_backing(&self) -> bool {
        loop {
            if self.shared.shutdown.load(Ordering::Acquire) {
                return false;
            }
            match self.file.metadata() {
                Ok(meta) if meta.len() >= self.page_size => break,
                Ok(_) => {}
                Err(err) => {
                    tracing::error!(error = %err, "backing file stat failed; notifications stop");
                    return false;
                }
            }
            thread::sleep(BACKING_POLL);
        }

        if let Err(err) = self.shared.header.lock_resident() {
            tracing::error!(error = %err, "header page not locked resident; notifications stop");
            return false;
        }

        let deadline = Instant::now() + SIGNATURE_GRACE;
        while !self.shared.header.signature_valid() {
            if self.shared.shutdown.load(Ordering::Acquire) {
                return false;
            }
            if Instant::now() >= deadline {
                tracing::error!("backing file grew without a valid stream signature");
                return false;
            }
            thread::sleep(BACKING_POLL);
        }

        self.shared.ready.store(true, Ordering::Release);
        true
    }

    /// Forward one observed size. Returns false once the read end is
    /// gone or the pipe is otherwise unusable.
    fn push(&self, size: u64) -> bool {
        let bytes = size.to_ne_bytes();
        loop {
            // SAFETY: the fd is open and the buffer outlives the call.
            let rc =
                unsafe { libc::write(self.tx.as_raw_fd(), bytes.as_ptr().cast(), bytes.len()) };
            if rc == bytes.len() as isize {
                return true;
            }
            if rc < 0 {
                let err = io::Error::last_os_error();
                match err.raw_os_error() {
                    Some(libc::EINTR) => continue,
                    Some(libc::EPIPE) => return false,
                    _ => {
                        tracing::error!(error = %err, "notification write failed");
                        return false;
                    }
                }
            }
            // Pipe writes of 8 bytes are atomic; a short count means the
            // descriptor is not the pipe we created.
            tracing::error!(written = rc, "short notification write");
            return false;
        }
    }
}
