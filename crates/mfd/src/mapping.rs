//! File and mapping geometry shared by the writer and reader engines.
//!
//! The first page of the backing file holds the header; logical data
//! offset 0 is file offset `page_size`. The data region is mapped past
//! its current end by `pages_ahead` pages so appends rarely remap, and
//! the file length trails the mapping: it is pushed only to
//! `EOF_TAIL` bytes into the last mapped page. That keeps every mapped
//! page at least partially backed (touching it cannot raise SIGBUS)
//! without declaring the tail page complete to the kernel.

use crate::errors::MfdError;
use crate::probe::MfdConfig;
use memmap2::{Advice, Mmap, MmapMut, MmapOptions};
use std::fs::{File, OpenOptions};
use std::io;
use std::path::Path;

/// Bytes the file length keeps past the start of the last mapped page.
pub(crate) const EOF_TAIL: u64 = 2;

pub(crate) fn round_up_to_page(len: u64, config: &MfdConfig) -> u64 {
    let page = config.page_size();
    len.div_ceil(page) * page
}

pub(crate) fn page_floor(off: u64, config: &MfdConfig) -> u64 {
    off - off % config.page_size()
}

/// Mapped length of the data region for a logical size, including the
/// premapped pages ahead of the frontier.
pub(crate) fn data_extent_for(size: u64, config: &MfdConfig) -> u64 {
    round_up_to_page(size, config) + config.pages_ahead() * config.page_size()
}

/// Open the backing file. Uses `O_NOATIME` where the kernel allows it so
/// that a hot stream does not churn inode timestamps; the flag is
/// owner-only and EPERM falls back to a plain open.
pub(crate) fn open_backing(path: &Path, write: bool, create: bool) -> io::Result<File> {
    #[cfg(target_os = "linux")]
    {
        use std::os::unix::fs::OpenOptionsExt;
        let attempt = OpenOptions::new()
            .read(true)
            .write(write)
            .create(create)
            .truncate(false)
            .custom_flags(libc::O_NOATIME)
            .open(path);
        match attempt {
            Err(err) if err.raw_os_error() == Some(libc::EPERM) => {}
            other => return other,
        }
    }
    OpenOptions::new()
        .read(true)
        .write(write)
        .create(create)
        .truncate(false)
        .open(path)
}

pub(crate) fn map_data_rw(
    file: &File,
    config: &MfdConfig,
    data_len: u64,
) -> Result<MmapMut, MfdError> {
    let map = unsafe {
        MmapOptions::new()
            .offset(config.page_size())
            .len(data_len as usize)
            .map_mut(file)?
    };
    map.advise(Advice::Sequential)?;
    Ok(map)
}

pub(crate) fn map_data_ro(
    file: &File,
    config: &MfdConfig,
    data_len: u64,
) -> Result<Mmap, MfdError> {
    let map = unsafe {
        MmapOptions::new()
            .offset(config.page_size())
            .len(data_len as usize)
            .map(file)?
    };
    map.advise(Advice::Sequential)?;
    Ok(map)
}

#[cfg(target_os = "linux")]
pub(crate) fn grow_data_rw(
    map: &mut MmapMut,
    _file: &File,
    _config: &MfdConfig,
    new_len: u64,
) -> Result<(), MfdError> {
    use memmap2::RemapOptions;
    // SAFETY: callers hold no slices into the old mapping across growth,
    // only numeric cursors.
    unsafe { map.remap(new_len as usize, RemapOptions::new().may_move(true))? };
    map.advise(Advice::Sequential)?;
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn grow_data_rw(
    map: &mut MmapMut,
    file: &File,
    config: &MfdConfig,
    new_len: u64,
) -> Result<(), MfdError> {
    *map = map_data_rw(file, config, new_len)?;
    Ok(())
}

#[cfg(target_os = "linux")]
pub(crate) fn grow_data_ro(
    map: &mut Mmap,
    _file: &File,
    _config: &MfdConfig,
    new_len: u64,
) -> Result<(), MfdError> {
    use memmap2::RemapOptions;
    // SAFETY: as in grow_data_rw.
    unsafe { map.remap(new_len as usize, RemapOptions::new().may_move(true))? };
    map.advise(Advice::Sequential)?;
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn grow_data_ro(
    map: &mut Mmap,
    file: &File,
    config: &MfdConfig,
    new_len: u64,
) -> Result<(), MfdError> {
    *map = map_data_ro(file, config, new_len)?;
    Ok(())
}

/// Push the file length to `EOF_TAIL` bytes past the start of the last
/// mapped page. Never shrinks; only the writer calls this.
pub(crate) fn advance_eof(
    file: &File,
    off_eom: u64,
    off_eof: &mut u64,
    config: &MfdConfig,
) -> Result<(), MfdError> {
    let target = off_eom - config.page_size() + EOF_TAIL;
    if target > *off_eof {
        file.set_len(target)?;
        *off_eof = target;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    fn test_config() -> MfdConfig {
        MfdConfig::detect(2)
    }

    #[test]
    fn test_round_up_to_page() {
        let config = test_config();
        let page = config.page_size();
        assert_eq!(round_up_to_page(0, &config), 0);
        assert_eq!(round_up_to_page(1, &config), page);
        assert_eq!(round_up_to_page(page, &config), page);
        assert_eq!(round_up_to_page(page + 1, &config), 2 * page);
    }

    #[test]
    fn test_page_floor() {
        let config = test_config();
        let page = config.page_size();
        assert_eq!(page_floor(0, &config), 0);
        assert_eq!(page_floor(page - 1, &config), 0);
        assert_eq!(page_floor(page, &config), page);
        assert_eq!(page_floor(2 * page + 7, &config), 2 * page);
    }

    #[test]
    fn test_data_extent_always_reaches_past_the_frontier() {
        let config = test_config();
        let page = config.page_size();
        assert_eq!(
            data_extent_for(0, &config),
            2 * page,
            "Empty stream still premaps pages_ahead pages"
        );
        assert_eq!(data_extent_for(1, &config), 3 * page);
        assert_eq!(data_extent_for(page, &config), 3 * page);
        assert_eq!(data_extent_for(page + 1, &config), 4 * page);
    }

    #[test]
    fn test_advance_eof_lands_inside_last_mapped_page() {
        let temp_file = NamedTempFile::new().unwrap();
        let config = test_config();
        let page = config.page_size();

        let mut off_eof = 0;
        // Header page plus two data pages mapped.
        let off_eom = 3 * page;
        advance_eof(temp_file.as_file(), off_eom, &mut off_eof, &config).unwrap();

        let len = temp_file.as_file().metadata().unwrap().len();
        assert_eq!(
            len,
            2 * page + EOF_TAIL,
            "EOF should sit two bytes into the last mapped page"
        );
        assert_eq!(off_eof, len, "Tracked EOF should follow the truncate");

        // A second call with the same extent is a no-op, never a shrink.
        advance_eof(temp_file.as_file(), off_eom, &mut off_eof, &config).unwrap();
        assert_eq!(temp_file.as_file().metadata().unwrap().len(), len);
    }

    #[test]
    fn test_open_backing_creates_and_reopens() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stream.mfd");

        let file = open_backing(&path, true, true).unwrap();
        file.set_len(128).unwrap();
        drop(file);

        let reopened = open_backing(&path, false, false).unwrap();
        assert_eq!(
            reopened.metadata().unwrap().len(),
            128,
            "Read-only reopen should see the same file"
        );
    }
}
