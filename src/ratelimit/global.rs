//! Process-wide default limiter.
//!
//! Callers that do not need isolated state can use the free functions here.
//! Install a configured limiter with [`init_default`] early in startup;
//! otherwise one is built from the default configuration on first use.

use std::sync::OnceLock;
use std::time::Duration;

use tracing::warn;

use crate::config::AccumulatorConfig;
use crate::error::{AccumulatorError, Result};

use super::limiter::SlidingWindowLimiter;

static DEFAULT_LIMITER: OnceLock<SlidingWindowLimiter> = OnceLock::new();

/// Install the process-wide limiter.
///
/// Fails if a limiter was already installed or lazily created.
pub fn init_default(limiter: SlidingWindowLimiter) -> Result<()> {
    DEFAULT_LIMITER
        .set(limiter)
        .map_err(|_| AccumulatorError::AlreadyInitialized)
}

/// Get the process-wide limiter, creating it from defaults if needed.
pub fn default_limiter() -> &'static SlidingWindowLimiter {
    DEFAULT_LIMITER.get_or_init(|| {
        SlidingWindowLimiter::from_config(&AccumulatorConfig::default()).unwrap_or_else(|error| {
            warn!(%error, "Falling back to a plain default limiter");
            SlidingWindowLimiter::new()
        })
    })
}

/// [`SlidingWindowLimiter::allow`] on the process-wide limiter.
pub fn allow(key: &str, limit: u64, window: Duration) -> bool {
    default_limiter().allow(key, limit, window)
}

/// [`SlidingWindowLimiter::allow_n`] on the process-wide limiter.
pub fn allow_n(key: &str, cost: u64, limit: u64, window: Duration) -> bool {
    default_limiter().allow_n(key, cost, limit, window)
}
