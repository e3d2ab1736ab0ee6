//! Quota validation and composite key hashing.

use std::hash::{BuildHasher, Hasher};
use std::time::Duration;

use ahash::RandomState;

use crate::error::{AccumulatorError, Result};

/// A validated limit and window length.
///
/// The limit is non-zero and the window length is non-zero and fits in
/// nanoseconds as a `u64`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Quota {
    limit: u64,
    window: u64,
}

impl Quota {
    /// Validate a limit and window length.
    pub fn new(limit: u64, window: Duration) -> Result<Self> {
        if window.is_zero() {
            return Err(AccumulatorError::ZeroWindow);
        }
        if limit == 0 {
            return Err(AccumulatorError::ZeroLimit);
        }
        let window_nanos = u64::try_from(window.as_nanos())
            .map_err(|_| AccumulatorError::WindowTooLong(window))?;

        Ok(Self {
            limit,
            window: window_nanos,
        })
    }

    /// `limit` per second.
    pub fn per_second(limit: u64) -> Result<Self> {
        Self::new(limit, Duration::from_secs(1))
    }

    /// `limit` per minute.
    pub fn per_minute(limit: u64) -> Result<Self> {
        Self::new(limit, Duration::from_secs(60))
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    pub fn window(&self) -> Duration {
        Duration::from_nanos(self.window)
    }

    pub(crate) fn window_nanos(&self) -> u64 {
        self.window
    }
}

/// The identity of one entry: caller key plus quota.
///
/// The same caller key under a different limit or window is a different
/// entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimitKey<'a> {
    key: &'a str,
    quota: Quota,
}

impl<'a> LimitKey<'a> {
    pub fn new(key: &'a str, quota: Quota) -> Self {
        Self { key, quota }
    }

    pub fn key(&self) -> &'a str {
        self.key
    }

    pub fn quota(&self) -> Quota {
        self.quota
    }

    /// Hash the composite key with a seeded hasher.
    pub fn hash_with(&self, state: &RandomState) -> u64 {
        let mut hasher = state.build_hasher();
        hasher.write(self.key.as_bytes());
        // Terminates the variable-length key so no two compositions share bytes.
        hasher.write_u8(0xff);
        hasher.write_u64(self.quota.limit);
        hasher.write_u64(self.quota.window);
        hasher.finish()
    }
}

impl std::fmt::Display for LimitKey<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}|{}|{:?}",
            self.key,
            self.quota.limit,
            self.quota.window()
        )
    }
}
