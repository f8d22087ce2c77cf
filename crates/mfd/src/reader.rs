use crate::errors::MfdError;
use crate::futex;
use crate::header::{FileHeader, HeaderMap, USER_SLOTS};
use crate::mapping;
use crate::notifier::{Notifier, ReaderShared};
use crate::probe::MfdConfig;
use memmap2::{Mmap, UncheckedAdvice};
use nix::fcntl::OFlag;
use nix::unistd::pipe2;
use std::fs::File;
use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;

/// An attach-side handle for an mfd stream.
///
/// Readers never block the writer and never poll the header: a notifier
/// thread sleeps on the size futex and forwards every observed size
/// through a pipe, so the application can select/poll/epoll on
/// [`notify_fd`](Self::notify_fd) alongside its other descriptors.
///
/// Opening an existing stream validates the signature up front. Opening
/// an empty file succeeds and arms the notifier to wait for a writer;
/// until the stream materializes, `size` reports 0.
pub struct MfdReader {
    config: MfdConfig,
    file: File,
    shared: Arc<ReaderShared>,
    data: Mmap,
    /// File offset one past the mapped data region.
    off_eom: u64,
    /// Read frontier, data-relative.
    cursor: u64,
    /// Data-relative boundary below which pages were advised away.
    evicted_to: u64,
    notify_rx: OwnedFd,
    notifier: Option<JoinHandle<()>>,
}

impl MfdReader {
    /// Attach to the stream at `path`. The file must exist; it may be
    /// empty, in which case the reader waits for the first writer.
    pub fn open(path: impl AsRef<Path>, config: &MfdConfig) -> Result<Self, MfdError> {
        let file = mapping::open_backing(path.as_ref(), false, false)?;
        let page = config.page_size();
        let len = file.metadata()?.len();
        if len > 0 && len < FileHeader::SIZE as u64 {
            return Err(MfdError::TruncatedHeader { len });
        }

        // The header page carries the futex and is mapped writable so the
        // kernel can key it; a transient descriptor grants that without
        // keeping write access open.
        let header = {
            let rw = mapping::open_backing(path.as_ref(), true, false)?;
            HeaderMap::new(&rw, config)?
        };

        let live = len > 0;
        let last_seen = if live {
            header.lock_resident()?;
            if !header.signature_valid() {
                return Err(MfdError::BadSignature {
                    found: header.signature(),
                });
            }
            let stored = header.size();
            let from_len = len.saturating_sub(page);
            if stored > from_len {
                tracing::warn!(
                    stored,
                    file_estimate = from_len,
                    "recorded size exceeds the backing file length"
                );
            }
            stored
        } else {
            0
        };

        let data_len = mapping::data_extent_for(last_seen, config);
        let data = mapping::map_data_ro(&file, config, data_len)?;

        let shared = Arc::new(ReaderShared {
            header,
            ready: AtomicBool::new(live),
            shutdown: AtomicBool::new(false),
        });

        let (notify_rx, notify_tx) = pipe2(OFlag::O_CLOEXEC).map_err(io::Error::from)?;
        set_nonblocking(&notify_rx)?;

        let notifier = Notifier {
            shared: Arc::clone(&shared),
            tx: notify_tx,
            file: file.try_clone()?,
            page_size: page,
            last_seen,
            await_backing: !live,
        };
        let handle = notifier.spawn()?;

        Ok(Self {
            config: *config,
            file,
            shared,
            data,
            off_eom: page + data_len,
            cursor: 0,
            evicted_to: 0,
            notify_rx,
            notifier: Some(handle),
        })
    }

    /// Bytes published by the writer so far. Reports 0 until an empty
    /// stream materializes.
    pub fn size(&self) -> u64 {
        if !self.shared.ready.load(Ordering::Acquire) {
            return 0;
        }
        self.shared.header.size()
    }

    /// Published bytes not yet consumed by [`read`](Self::read).
    pub fn available(&self) -> u64 {
        self.size().saturating_sub(self.cursor)
    }

    /// Current read frontier, in stream bytes.
    pub fn position(&self) -> u64 {
        self.cursor
    }

    /// Copy up to `buf.len()` published bytes at the read frontier into
    /// `buf`. Returns the number of bytes copied; 0 means nothing new
    /// has been published, never end-of-stream.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize, MfdError> {
        let size = self.size();
        let want = (buf.len() as u64).min(size.saturating_sub(self.cursor));
        if want == 0 {
            return Ok(0);
        }
        self.ensure_mapped(self.cursor + want)?;

        let start = self.cursor as usize;
        buf[..want as usize].copy_from_slice(&self.data[start..start + want as usize]);
        self.cursor += want;

        self.evict_consumed_pages();
        Ok(want as usize)
    }

    /// Move the read frontier, clamped to the published size. Returns
    /// the new position.
    pub fn seek(&mut self, pos: u64) -> u64 {
        self.cursor = pos.min(self.size());
        self.cursor
    }

    /// Jump past everything already published, so only future appends
    /// are read. Returns the size that was skipped to.
    pub fn skip_to_end(&mut self) -> u64 {
        let size = self.size();
        self.cursor = size;
        size
    }

    /// Drain one notification without blocking. `Ok(Some(size))` is the
    /// stream size the notifier observed, `Ok(None)` means no pending
    /// notification, and [`MfdError::NotifyClosed`] means the notifier
    /// has terminated.
    pub fn try_recv_size(&mut self) -> Result<Option<u64>, MfdError> {
        let mut bytes = [0u8; 8];
        loop {
            // SAFETY: the fd is open and the buffer outlives the call.
            let rc = unsafe {
                libc::read(
                    self.notify_rx.as_raw_fd(),
                    bytes.as_mut_ptr().cast(),
                    bytes.len(),
                )
            };
            if rc == bytes.len() as isize {
                return Ok(Some(u64::from_ne_bytes(bytes)));
            }
            if rc == 0 {
                return Err(MfdError::NotifyClosed);
            }
            if rc < 0 {
                let err = io::Error::last_os_error();
                match err.raw_os_error() {
                    Some(libc::EAGAIN) => return Ok(None),
                    Some(libc::EINTR) => continue,
                    _ => return Err(MfdError::IoError(err)),
                }
            }
            // Pipe reads of 8 bytes are all or nothing below PIPE_BUF.
            return Err(MfdError::IoError(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "partial notification read",
            )));
        }
    }

    /// The pollable notification descriptor. It becomes readable when a
    /// new size is available and reports EOF once the notifier thread
    /// has terminated. The descriptor is nonblocking.
    pub fn notify_fd(&self) -> BorrowedFd<'_> {
        self.notify_rx.as_fd()
    }

    /// Duplicate the notification descriptor, e.g. to register with an
    /// event loop that outlives this handle. The duplicate shares the
    /// EOF-on-teardown behavior.
    pub fn try_clone_notify_fd(&self) -> io::Result<OwnedFd> {
        self.notify_rx.try_clone()
    }

    /// Wait for the next notification. Must be called from within a
    /// Tokio runtime.
    #[cfg(feature = "tokio")]
    pub async fn next_size(&mut self) -> Result<u64, MfdError> {
        use tokio::io::Interest;
        use tokio::io::unix::AsyncFd;

        loop {
            if let Some(size) = self.try_recv_size()? {
                return Ok(size);
            }
            let fd = AsyncFd::with_interest(self.notify_fd(), Interest::READABLE)?;
            let mut guard = fd.readable().await?;
            guard.clear_ready();
        }
    }

    /// Opaque per-stream metadata slots written by the writer. Reports 0
    /// until an empty stream materializes.
    pub fn user_slot(&self, index: usize) -> u64 {
        assert!(index < USER_SLOTS, "user slot index out of range");
        if !self.shared.ready.load(Ordering::Acquire) {
            return 0;
        }
        self.shared.header.user_slot(index)
    }

    fn ensure_mapped(&mut self, upto: u64) -> Result<(), MfdError> {
        let mapped = self.off_eom - self.config.page_size();
        if upto <= mapped {
            return Ok(());
        }
        let data_len = mapping::data_extent_for(upto, &self.config);
        mapping::grow_data_ro(&mut self.data, &self.file, &self.config, data_len)?;
        self.off_eom = self.config.page_size() + data_len;
        Ok(())
    }

    /// Advise fully consumed pages out of our working set. The pages stay
    /// in the page cache for other attached processes.
    fn evict_consumed_pages(&mut self) {
        let boundary = mapping::page_floor(self.cursor, &self.config);
        if boundary <= self.evicted_to {
            return;
        }
        let offset = self.evicted_to as usize;
        let len = (boundary - self.evicted_to) as usize;
        if let Err(err) = unsafe {
            self.data
                .unchecked_advise_range(UncheckedAdvice::DontNeed, offset, len)
        } {
            tracing::debug!(error = %err, "page eviction hint failed");
        }
        self.evicted_to = boundary;
    }
}

impl Drop for MfdReader {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::Release);
        // The wake fails with EFAULT if the header page never got backed;
        // the notifier is then in its stat loop and needs no wake.
        let _ = futex::wake_all(self.shared.header.size_cell());

        // A full pipe would park the notifier in write(); drain it so the
        // thread can observe the shutdown flag.
        let mut scratch = [0u8; 64];
        loop {
            // SAFETY: the fd is open and nonblocking.
            let rc = unsafe {
                libc::read(
                    self.notify_rx.as_raw_fd(),
                    scratch.as_mut_ptr().cast(),
                    scratch.len(),
                )
            };
            if rc > 0 {
                continue;
            }
            if rc < 0 && io::Error::last_os_error().raw_os_error() == Some(libc::EINTR) {
                continue;
            }
            break;
        }

        if let Some(handle) = self.notifier.take()
            && handle.join().is_err()
        {
            tracing::error!("notifier thread panicked during shutdown");
        }
    }
}

fn set_nonblocking(fd: &OwnedFd) -> io::Result<()> {
    // SAFETY: the fd is owned and open.
    let flags = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    let rc = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_SETFL, flags | libc::O_NONBLOCK) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
