mod config;

use anyhow::Context;
use common::setup_logging;
use config::FeedConfig;
use mfd::{MfdConfig, MfdWriter};
use signal_hook::{
    consts::{SIGINT, SIGTERM},
    flag,
};
use std::io::{self, BufRead};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

fn main() -> anyhow::Result<()> {
    let config = FeedConfig::from_env()?;
    setup_logging(config.environment.clone());
    let shutdown = Arc::new(AtomicBool::new(false));

    flag::register(SIGTERM, Arc::clone(&shutdown))?;
    flag::register(SIGINT, Arc::clone(&shutdown))?;

    let mfd_config = MfdConfig::detect(config.pages_ahead);
    let mut writer = MfdWriter::create(&config.stream_path, &mfd_config)
        .with_context(|| format!("Failed to open stream at {}", config.stream_path.display()))?;

    tracing::info!(
        path = %config.stream_path.display(),
        resumed_bytes = writer.size(),
        "Feeding stdin into the stream"
    );

    let stdin = io::stdin();
    let mut lines = 0u64;
    for line in stdin.lock().lines() {
        if shutdown.load(Ordering::Relaxed) {
            tracing::info!("Shutdown requested, stopping feed");
            break;
        }

        let mut line = line.context("Failed to read from stdin")?;
        line.push('\n');
        let size = writer.write(line.as_bytes()).context("Append failed")?;

        lines += 1;
        if lines % config.stats_every == 0 {
            tracing::info!(lines, bytes = size, "Feed progress");
        }
    }

    writer.flush().context("Final flush failed")?;
    tracing::info!(lines, bytes = writer.size(), "Feed finished");
    Ok(())
}
