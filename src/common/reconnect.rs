//! Backoff-driven reconnection for driver listen loops.
//!
//! Drivers keep their own receive loop; this only decides how long to wait
//! between attempts and when to give up (on shutdown).

use std::future::Future;
use std::time::Duration;

use backon::BackoffBuilder;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Delay and jitter parameters for a reconnecting loop.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    /// Delay before the first reconnection attempt.
    pub delay: Duration,
    /// Upper bound for the delay.
    pub max_delay: Duration,
    /// Multiplier for each successive attempt; 1.0 keeps the delay fixed.
    pub factor: f32,
    /// Randomize each delay to avoid synchronized reconnect storms.
    pub jitter: bool,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(300),
            factor: 1.5,
            jitter: true,
        }
    }
}

impl ReconnectPolicy {
    /// A policy that always waits `delay`.
    #[cfg(test)]
    pub fn fixed(delay: Duration) -> Self {
        Self {
            delay,
            max_delay: delay,
            factor: 1.0,
            jitter: false,
        }
    }

    /// Unlimited backoff iterator for this policy.
    pub fn backoff(&self) -> impl Iterator<Item = Duration> {
        let builder = backon::ExponentialBuilder::default()
            .with_min_delay(self.delay)
            .with_max_delay(self.max_delay.max(self.delay))
            .with_factor(self.factor.max(1.0))
            .without_max_times();
        if self.jitter {
            builder.with_jitter().build()
        } else {
            builder.build()
        }
    }
}

/// Re-run `connect` until shutdown is signalled.
///
/// Each call to `connect` runs one session of a driver's receive loop. A
/// session that returns (cleanly or with an error) is followed by a backoff
/// sleep; a session that lasted longer than the policy's `max_delay` resets
/// the backoff.
pub async fn run_with_reconnect<F, Fut>(
    name: &str,
    policy: &ReconnectPolicy,
    mut shutdown_rx: watch::Receiver<bool>,
    mut connect: F,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<()>>,
{
    let mut backoff = policy.backoff();

    loop {
        if *shutdown_rx.borrow() {
            info!(driver = name, "Shutdown signal detected, stopping reconnection loop");
            break;
        }

        let started = tokio::time::Instant::now();
        let result = tokio::select! {
            result = connect() => result,
            _ = shutdown_rx.changed() => {
                info!(driver = name, "Shutdown signal received, leaving listen loop");
                break;
            }
        };

        match result {
            Ok(()) => info!(driver = name, "Listen loop ended"),
            Err(e) => error!(driver = name, "Listen loop failed: {:#}", e),
        }

        if started.elapsed() > policy.max_delay {
            backoff = policy.backoff();
        }

        let delay = backoff.next().unwrap_or(policy.max_delay);
        warn!(driver = name, "Reconnecting in {:.1} seconds...", delay.as_secs_f64());

        tokio::select! {
            _ = tokio::time::sleep(delay) => {},
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    info!(driver = name, "Shutdown signal received during backoff");
                    break;
                }
            }
        }
    }
}
