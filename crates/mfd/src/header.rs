use crate::errors::MfdError;
use crate::probe::MfdConfig;
use memmap2::{Advice, MmapMut, MmapOptions};
use std::fs::File;
use std::sync::atomic::{AtomicU64, Ordering};

/// Opaque u64 slots applications may stash in the header. The writer
/// sets them; every attached process can read them.
pub const USER_SLOTS: usize = 7;

/// Marks a file as an mfd stream.
pub(crate) const SIGNATURE: u64 = 0x1c1c_1c1c_1c1c_1c1c;

/// SAFETY & MEMORY ORDERING:
///
/// This header is the first page of the backing file and is shared by
/// every process that maps it.
///
/// Writer protocol:
/// 1. Copy payload bytes into the data region
/// 2. Publish the new size with `Ordering::Release`
/// 3. Wake size waiters
///
/// Reader protocol:
/// 1. Load size with `Ordering::Acquire`
/// 2. Every byte below the loaded size is guaranteed visible
///
/// The Release-Acquire pair ensures:
/// - All payload writes happen-before the size store
/// - All size loads happen-before payload reads
/// - No torn reads on x86, ARM, or other architectures
///
/// Alignment:
/// The `#[repr(C, align(8))]` keeps every cell 8-byte aligned, which is
/// required both for AtomicU64 and for the futex word inside `size`.
#[repr(C, align(8))]
pub(crate) struct FileHeader {
    /// Constant `SIGNATURE`; anything else is not an mfd file.
    pub(crate) signature: AtomicU64,
    /// Data bytes published after the header page. Monotonically
    /// non-decreasing while a writer is attached; the sole subject of
    /// futex wait/wake.
    pub(crate) size: AtomicU64,
    pub(crate) user: [AtomicU64; USER_SLOTS],
}

impl FileHeader {
    pub(crate) const SIZE: usize = std::mem::size_of::<Self>();
}

// The layout is shared across processes; pin it at compile time instead
// of trusting host padding.
const _: () = assert!(FileHeader::SIZE == 72);
const _: () = assert!(std::mem::align_of::<FileHeader>() == 8);
const _: () = assert!(std::mem::offset_of!(FileHeader, signature) == 0);
const _: () = assert!(std::mem::offset_of!(FileHeader, size) == 8);
const _: () = assert!(std::mem::offset_of!(FileHeader, user) == 16);

/// The writable mapping of the header page.
///
/// Created over the first page of the backing file. Callers must not
/// load or store any cell until the file is long enough to back the
/// header; the page faults in lazily and a wholly unbacked page raises
/// SIGBUS on first touch. `MfdWriter` extends the file before touching;
/// `MfdReader` defers all access until its notifier sees the file grow.
pub(crate) struct HeaderMap {
    map: MmapMut,
}

impl HeaderMap {
    pub(crate) fn new(file: &File, config: &MfdConfig) -> Result<Self, MfdError> {
        let map = unsafe {
            MmapOptions::new()
                .len(config.page_size() as usize)
                .map_mut(file)?
        };
        Ok(Self { map })
    }

    /// Fault the page in and pin it resident. Size waits and publishes
    /// hit this page constantly; reclaim stalls would turn into wakeup
    /// latency for every attached reader.
    pub(crate) fn lock_resident(&self) -> Result<(), MfdError> {
        self.map.advise(Advice::Random)?;
        self.map.advise(Advice::WillNeed)?;
        self.map.lock()?;
        Ok(())
    }

    fn header(&self) -> &FileHeader {
        // SAFETY: the mapping is page-sized, page-aligned, and lives as
        // long as `self`; FileHeader is repr(C, align(8)) and fits well
        // inside one page. All fields are atomics, so shared mutation
        // through &self is sound.
        unsafe { &*(self.map.as_ptr() as *const FileHeader) }
    }

    /// Stamp a fresh header: zeroed size and user slots, signature last
    /// so a concurrent reader never sees a signed but half-built header.
    pub(crate) fn init(&self) {
        let header = self.header();
        header.size.store(0, Ordering::Relaxed);
        for slot in &header.user {
            slot.store(0, Ordering::Relaxed);
        }
        header.signature.store(SIGNATURE, Ordering::Release);
    }

    pub(crate) fn signature(&self) -> u64 {
        self.header().signature.load(Ordering::Acquire)
    }

    pub(crate) fn signature_valid(&self) -> bool {
        self.signature() == SIGNATURE
    }

    pub(crate) fn size_cell(&self) -> &AtomicU64 {
        &self.header().size
    }

    pub(crate) fn size(&self) -> u64 {
        self.header().size.load(Ordering::Acquire)
    }

    pub(crate) fn publish_size(&self, size: u64) {
        self.header().size.store(size, Ordering::Release);
    }

    pub(crate) fn user_slot(&self, index: usize) -> u64 {
        assert!(index < USER_SLOTS, "user slot index out of range");
        self.header().user[index].load(Ordering::Acquire)
    }

    pub(crate) fn set_user_slot(&self, index: usize, value: u64) {
        assert!(index < USER_SLOTS, "user slot index out of range");
        self.header().user[index].store(value, Ordering::Release);
    }

    pub(crate) fn flush(&self) -> Result<(), MfdError> {
        self.map.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_header_alignment() {
        assert_eq!(
            std::mem::align_of::<FileHeader>(),
            8,
            "FileHeader must be 8-byte aligned for AtomicU64"
        );
    }

    #[test]
    fn test_header_layout_is_pinned() {
        assert_eq!(
            FileHeader::SIZE,
            72,
            "FileHeader should be exactly 72 bytes (signature + size + 7 user slots)"
        );
        assert_eq!(std::mem::offset_of!(FileHeader, signature), 0);
        assert_eq!(std::mem::offset_of!(FileHeader, size), 8);
        assert_eq!(std::mem::offset_of!(FileHeader, user), 16);
    }

    #[test]
    fn test_init_and_roundtrip_through_mapping() {
        let temp_file = NamedTempFile::new().unwrap();
        let config = MfdConfig::default();
        temp_file
            .as_file()
            .set_len(config.page_size())
            .expect("failed to size backing file");

        let header = HeaderMap::new(temp_file.as_file(), &config).unwrap();
        header.lock_resident().unwrap();
        header.init();

        assert!(
            header.signature_valid(),
            "init should stamp the stream signature"
        );
        assert_eq!(header.size(), 0, "Fresh header should publish size 0");

        header.publish_size(42);
        assert_eq!(header.size(), 42, "Published size should read back");

        header.set_user_slot(0, 7);
        header.set_user_slot(6, 99);
        assert_eq!(header.user_slot(0), 7);
        assert_eq!(header.user_slot(6), 99);
        assert_eq!(header.user_slot(3), 0, "Untouched slots stay zero");
    }

    #[test]
    fn test_two_maps_of_one_file_share_cells() {
        let temp_file = NamedTempFile::new().unwrap();
        let config = MfdConfig::default();
        temp_file.as_file().set_len(config.page_size()).unwrap();

        let a = HeaderMap::new(temp_file.as_file(), &config).unwrap();
        let b = HeaderMap::new(temp_file.as_file(), &config).unwrap();
        a.init();
        a.publish_size(1234);

        assert!(b.signature_valid(), "Second mapping should see the signature");
        assert_eq!(
            b.size(),
            1234,
            "Size published through one mapping should be visible through the other"
        );
    }
}
