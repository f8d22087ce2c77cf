mod config;

use anyhow::Context;
use common::setup_logging;
use config::FollowConfig;
use mfd::{MfdConfig, MfdError, MfdReader};
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use signal_hook::{
    consts::{SIGINT, SIGTERM},
    flag,
};
use std::io::{self, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

fn main() -> anyhow::Result<()> {
    let config = FollowConfig::from_env()?;
    setup_logging(config.environment.clone());
    let shutdown = Arc::new(AtomicBool::new(false));

    flag::register(SIGTERM, Arc::clone(&shutdown))?;
    flag::register(SIGINT, Arc::clone(&shutdown))?;

    let mfd_config = MfdConfig::detect(config.pages_ahead);
    let mut reader = MfdReader::open(&config.stream_path, &mfd_config)
        .with_context(|| format!("Failed to open stream at {}", config.stream_path.display()))?;

    if config.from_start {
        tracing::info!(
            path = %config.stream_path.display(),
            bytes = reader.size(),
            "Following from the start of the stream"
        );
    } else {
        let skipped = reader.skip_to_end();
        tracing::info!(
            path = %config.stream_path.display(),
            skipped,
            "Following new appends only"
        );
    }

    let mut stdout = io::stdout().lock();
    let mut buf = vec![0u8; 64 * 1024];
    let mut closed = false;

    while !shutdown.load(Ordering::Relaxed) {
        {
            let mut fds = [PollFd::new(reader.notify_fd(), PollFlags::POLLIN)];
            // EINTR here just means a signal arrived; the loop condition
            // handles it.
            let _ = poll(&mut fds, PollTimeout::from(config.poll_interval_ms));
        }

        loop {
            match reader.try_recv_size() {
                Ok(Some(_)) => continue,
                Ok(None) => break,
                Err(MfdError::NotifyClosed) => {
                    tracing::warn!("Notifier terminated; draining what is left");
                    closed = true;
                    break;
                }
                Err(err) => return Err(err).context("Notification channel failed"),
            }
        }

        let mut wrote = false;
        loop {
            let n = reader.read(&mut buf).context("Stream read failed")?;
            if n == 0 {
                break;
            }
            stdout.write_all(&buf[..n]).context("Stdout write failed")?;
            wrote = true;
        }
        if wrote {
            stdout.flush().context("Stdout flush failed")?;
        }

        if closed {
            break;
        }
    }

    tracing::info!(bytes = reader.position(), "Follow stopped");
    Ok(())
}
