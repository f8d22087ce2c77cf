use std::env;
use std::path::PathBuf;

pub use common::Environment;

#[derive(Debug, Clone)]
pub struct FollowConfig {
    pub environment: Environment,
    pub stream_path: PathBuf,
    pub pages_ahead: u64,
    pub from_start: bool,
    pub poll_interval_ms: u16,
}

impl FollowConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let environment = Environment::from_env();

        let stream_path = env::var("MFD_STREAM_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/dev/shm/mfd_stream"));

        let pages_ahead = env::var("MFD_PAGES_AHEAD")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(2);

        let from_start = env::var("FOLLOW_FROM_START")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(false);

        let poll_interval_ms = env::var("POLL_INTERVAL_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(250);

        Ok(Self {
            environment,
            stream_path,
            pages_ahead,
            from_start,
            poll_interval_ms,
        })
    }
}
