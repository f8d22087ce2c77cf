use std::num::NonZeroUsize;
use std::thread;

/// System page size in bytes. Mapping offsets and extents are always
/// multiples of this.
pub fn page_size() -> u64 {
    // SAFETY: sysconf reads a static limit and touches no caller memory.
    let n = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if n > 0 { n as u64 } else { 4096 }
}

/// Number of CPUs currently online, used to size default pools.
pub fn cpu_count() -> usize {
    // SAFETY: same as above.
    let n = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
    if n > 0 {
        n as usize
    } else {
        thread::available_parallelism()
            .map(NonZeroUsize::get)
            .unwrap_or(1)
    }
}

pub const DEFAULT_PAGES_AHEAD: u64 = 2;

/// Probed platform values plus tuning, captured once and passed to every
/// constructor. There is no process-global state to configure.
#[derive(Debug, Clone, Copy)]
pub struct MfdConfig {
    page_size: u64,
    pages_ahead: u64,
}

impl MfdConfig {
    /// Probe the page size and keep `pages_ahead` pages mapped past the
    /// write frontier. Values below 1 are clamped up; the frontier page
    /// itself must always be mapped.
    pub fn detect(pages_ahead: u64) -> Self {
        Self {
            page_size: page_size(),
            pages_ahead: pages_ahead.max(1),
        }
    }

    pub fn page_size(&self) -> u64 {
        self.page_size
    }

    pub fn pages_ahead(&self) -> u64 {
        self.pages_ahead
    }
}

impl Default for MfdConfig {
    fn default() -> Self {
        Self::detect(DEFAULT_PAGES_AHEAD)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_size_is_sane() {
        let page = page_size();
        assert!(
            page.is_power_of_two(),
            "Page size should be a power of two, got {}",
            page
        );
        assert!(page >= 4096, "Page size should be at least 4KiB");
    }

    #[test]
    fn test_cpu_count_is_nonzero() {
        assert!(cpu_count() >= 1, "At least one CPU must be online");
    }

    #[test]
    fn test_detect_clamps_pages_ahead() {
        let config = MfdConfig::detect(0);
        assert_eq!(
            config.pages_ahead(),
            1,
            "pages_ahead = 0 would unmap the frontier page and must clamp to 1"
        );
        assert_eq!(MfdConfig::detect(8).pages_ahead(), 8);
    }

    #[test]
    fn test_default_config_matches_probe() {
        let config = MfdConfig::default();
        assert_eq!(config.page_size(), page_size());
        assert_eq!(config.pages_ahead(), DEFAULT_PAGES_AHEAD);
    }
}
