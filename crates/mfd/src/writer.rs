use crate::errors::MfdError;
use crate::futex;
use crate::header::{FileHeader, HeaderMap};
use crate::mapping;
use crate::probe::MfdConfig;
use memmap2::{MmapMut, UncheckedAdvice};
use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use std::fs::File;
use std::io::{Seek, SeekFrom};
use std::path::Path;
use std::sync::atomic::AtomicU64;

/// The single append-side handle for an mfd stream.
///
/// Holds an exclusive advisory lock on the backing file for its whole
/// lifetime; a second writer on the same file fails fast. Appends are
/// plain memory copies into the premapped data region followed by a
/// Release publish of the new size and a futex wake, so attached readers
/// never poll.
pub struct MfdWriter {
    config: MfdConfig,
    file: Flock<File>,
    header: HeaderMap,
    data: MmapMut,
    /// File offset one past the mapped data region.
    off_eom: u64,
    /// Current file length; trails `off_eom` by almost a page.
    off_eof: u64,
    /// Write frontier, data-relative. Always equals the published size.
    cursor: u64,
    /// Data-relative boundary below which pages were advised away.
    evicted_to: u64,
}

impl MfdWriter {
    /// Create or resume the writer for `path`.
    ///
    /// A fresh (missing or zero-length) file is stamped with the stream
    /// header. An existing file must carry the signature and resumes at
    /// its recorded size; when the recorded size and the file length
    /// disagree, the larger estimate wins so nothing already published
    /// gets overwritten.
    pub fn create(path: impl AsRef<Path>, config: &MfdConfig) -> Result<Self, MfdError> {
        let file = mapping::open_backing(path.as_ref(), true, true)?;
        let file = match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(locked) => locked,
            Err((_, errno)) if errno == Errno::EWOULDBLOCK => return Err(MfdError::WriterActive),
            Err((_, errno)) => return Err(MfdError::IoError(errno.into())),
        };

        let page = config.page_size();
        let len = file.metadata()?.len();
        if len > 0 && len < FileHeader::SIZE as u64 {
            return Err(MfdError::TruncatedHeader { len });
        }

        let mut off_eof = len;
        let (resume, header) = if len == 0 {
            // Back the header page before anything touches it.
            let off_eom = page + mapping::data_extent_for(0, config);
            mapping::advance_eof(&file, off_eom, &mut off_eof, config)?;

            let header = HeaderMap::new(&file, config)?;
            header.lock_resident()?;
            header.init();
            (0, header)
        } else {
            let header = HeaderMap::new(&file, config)?;
            header.lock_resident()?;
            if !header.signature_valid() {
                return Err(MfdError::BadSignature {
                    found: header.signature(),
                });
            }
            let stored = header.size();
            let from_len = len.saturating_sub(page);
            if stored != from_len {
                tracing::warn!(
                    stored,
                    file_estimate = from_len,
                    "recorded size and file length disagree; resuming from the larger"
                );
            }
            (stored.max(from_len), header)
        };

        let data_len = mapping::data_extent_for(resume, config);
        let off_eom = page + data_len;
        mapping::advance_eof(&file, off_eom, &mut off_eof, config)?;
        let data = mapping::map_data_rw(&file, config, data_len)?;

        let mut writer = Self {
            config: *config,
            file,
            header,
            data,
            off_eom,
            off_eof,
            cursor: resume,
            evicted_to: mapping::page_floor(resume, config),
        };
        writer.header.publish_size(resume);
        writer.sync_file_position()?;
        Ok(writer)
    }

    /// Append `payload` to the stream and wake every waiting reader.
    /// Returns the new total size.
    pub fn write(&mut self, payload: &[u8]) -> Result<u64, MfdError> {
        if payload.is_empty() {
            return Ok(self.cursor);
        }
        self.ensure_capacity(payload.len() as u64)?;

        let start = self.cursor as usize;
        self.data[start..start + payload.len()].copy_from_slice(payload);
        self.cursor += payload.len() as u64;

        // Publish after the copy; readers load with Acquire.
        self.header.publish_size(self.cursor);
        if let Err(err) = futex::wake_all(self.size_cell()) {
            tracing::error!(error = %err, "waiters were not woken after publish");
        }

        self.evict_consumed_pages();
        Ok(self.cursor)
    }

    /// Bytes published so far.
    pub fn size(&self) -> u64 {
        self.cursor
    }

    /// Opaque per-stream metadata slots. Only the writer stores them;
    /// every attached process can read them.
    pub fn set_user_slot(&self, index: usize, value: u64) {
        self.header.set_user_slot(index, value);
    }

    pub fn user_slot(&self, index: usize) -> u64 {
        self.header.user_slot(index)
    }

    /// Force published bytes and the header out to the backing file.
    /// Appends never flush implicitly.
    pub fn flush(&mut self) -> Result<(), MfdError> {
        self.data.flush()?;
        self.header.flush()?;
        Ok(())
    }

    /// Move the descriptor's own cursor to the write frontier so plain
    /// file I/O on the same descriptor lands after the mapped appends.
    pub fn sync_file_position(&mut self) -> Result<(), MfdError> {
        let pos = self.config.page_size() + self.cursor;
        self.file.seek(SeekFrom::Start(pos))?;
        Ok(())
    }

    fn size_cell(&self) -> &AtomicU64 {
        self.header.size_cell()
    }

    fn ensure_capacity(&mut self, additional: u64) -> Result<(), MfdError> {
        let needed = self.cursor + additional;
        // The staged EOF trails the mapping by almost a page, so the file
        // extent, not the mapping, is the binding limit. Bytes copied past
        // it would live only in cache pages the kernel never writes back.
        let backed = self.off_eof - self.config.page_size();
        if needed <= backed {
            return Ok(());
        }
        let data_len = mapping::data_extent_for(needed, &self.config);
        mapping::grow_data_rw(&mut self.data, &self.file, &self.config, data_len)?;
        self.off_eom = self.config.page_size() + data_len;
        mapping::advance_eof(&self.file, self.off_eom, &mut self.off_eof, &self.config)?;
        Ok(())
    }

    /// Advise fully written pages out of our working set. The mapping is
    /// shared and file-backed, so this drops only our references; readers
    /// still fault the bytes in from the page cache.
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

impl Drop for MfdWriter {
    fn drop(&mut self) {
        // Trim the premap slack so a reopen resumes exactly at `size`
        // without a length mismatch warning.
        let final_len = self.config.page_size() + self.cursor;
        if let Err(err) = self.file.set_len(final_len) {
            tracing::warn!(error = %err, "backing file not trimmed on close");
        }
    }
}
