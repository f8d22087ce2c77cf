use std::env;
use std::path::PathBuf;

pub use common::Environment;

#[derive(Debug, Clone)]
pub struct FeedConfig {
    pub environment: Environment,
    pub stream_path: PathBuf,
    pub pages_ahead: u64,
    pub stats_every: u64,
}

impl FeedConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let environment = Environment::from_env();

        let stream_path = env::var("MFD_STREAM_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/dev/shm/mfd_stream"));

        let pages_ahead = env::var("MFD_PAGES_AHEAD")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(2);

        let stats_every = env::var("FEED_STATS_EVERY")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(1000)
            .max(1);

        Ok(Self {
            environment,
            stream_path,
            pages_ahead,
            stats_every,
        })
    }
}
