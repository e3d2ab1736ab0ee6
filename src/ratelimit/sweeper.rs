//! Background eviction of stale entries.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace};

use crate::error::{AccumulatorError, Result};

use super::limiter::SlidingWindowLimiter;

/// Periodically calls [`SlidingWindowLimiter::evict_stale`] on a tokio task.
#[derive(Debug)]
pub struct Sweeper {
    shutdown: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

impl Sweeper {
    /// Spawn the sweeper on the current tokio runtime.
    pub fn spawn(limiter: Arc<SlidingWindowLimiter>, interval: Duration) -> Result<Self> {
        if interval.is_zero() {
            return Err(AccumulatorError::Config(
                "sweep interval must be greater than zero".to_string(),
            ));
        }

        let (shutdown, mut shutdown_rx) = oneshot::channel();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    _ = ticker.tick() => {
                        let evicted = limiter.evict_stale();
                        trace!(evicted, remaining = limiter.entry_count(), "Sweep finished");
                    }
                }
            }

            debug!("Sweeper stopped");
        });

        info!(?interval, "Sweeper started");
        Ok(Self { shutdown, handle })
    }

    /// Stop the sweeper and wait for its task to finish.
    pub async fn shutdown(self) {
        // The task may already be gone if the runtime is shutting down.
        let _ = self.shutdown.send(());
        let _ = self.handle.await;
    }
}
