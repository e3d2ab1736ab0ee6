//! Per-key sliding window state.

use std::time::Duration;

use super::key::Quota;
use super::window::Window;

/// The rate limiting state for one `(key, limit, window length)` triple.
///
/// Holds the previous and current fixed windows. Both start zeroed at the
/// epoch, so the first observation always rolls forward to the real window.
#[derive(Debug, Clone)]
pub struct Entry {
    previous: Window,
    current: Window,
    limit: u64,
    window_length: u64,
    last_access: u64,
    evicted: bool,
}

impl Entry {
    /// Create an entry for a validated quota.
    pub fn new(quota: &Quota) -> Self {
        Self {
            previous: Window::default(),
            current: Window::default(),
            limit: quota.limit(),
            window_length: quota.window_nanos(),
            last_access: 0,
            evicted: false,
        }
    }

    /// Create an entry already rolled to the window containing `now`.
    pub fn started_at(quota: &Quota, now: u64) -> Self {
        let mut entry = Self::new(quota);
        entry.roll(now);
        entry
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    pub fn window_length(&self) -> u64 {
        self.window_length
    }

    pub fn previous(&self) -> &Window {
        &self.previous
    }

    pub fn current(&self) -> &Window {
        &self.current
    }

    pub(crate) fn current_mut(&mut self) -> &mut Window {
        &mut self.current
    }

    fn aligned(&self, now: u64) -> u64 {
        now - now % self.window_length
    }

    /// Slide the windows forward so that `current` contains `now`.
    ///
    /// A clock reading earlier than the current window never moves it back.
    pub fn roll(&mut self, now: u64) {
        let aligned = self.aligned(now);
        let slides = aligned.saturating_sub(self.current.start()) / self.window_length;

        match slides {
            0 => {}
            1 => {
                self.previous
                    .set_state(aligned - self.window_length, self.current.count());
                self.current.reset(aligned);
            }
            _ => {
                self.previous
                    .reset(aligned.saturating_sub(self.window_length));
                self.current.reset(aligned);
            }
        }
    }

    /// Fraction of the previous window still counted at `now`.
    ///
    /// Expects `roll(now)` to have run.
    pub fn overlap_weight(&self, now: u64) -> f64 {
        let elapsed = now
            .saturating_sub(self.current.start())
            .min(self.window_length);
        (self.window_length - elapsed) as f64 / self.window_length as f64
    }

    /// Blended count of the two windows at `now`, truncated.
    ///
    /// Expects `roll(now)` to have run.
    pub fn estimated_count(&self, now: u64) -> u64 {
        let weighted = (self.overlap_weight(now) * self.previous.count() as f64) as u64;
        weighted.saturating_add(self.current.count())
    }

    /// True when the next observation would discard both windows.
    pub fn is_stale(&self, now: u64) -> bool {
        self.aligned(now).saturating_sub(self.current.start())
            >= self.window_length.saturating_mul(2)
    }

    /// Record an access with a shard-ordered stamp.
    pub(crate) fn touch(&mut self, stamp: u64) {
        self.last_access = self.last_access.max(stamp);
    }

    /// Stamp of the most recent check, allowed or not.
    pub fn last_access(&self) -> u64 {
        self.last_access
    }

    /// Mark the entry as removed from its shard.
    ///
    /// A caller that fetched the entry before removal must look it up again.
    pub(crate) fn mark_evicted(&mut self) {
        self.evicted = true;
    }

    pub(crate) fn is_evicted(&self) -> bool {
        self.evicted
    }

    /// Copy out the state for inspection.
    pub fn snapshot(&self) -> EntrySnapshot {
        EntrySnapshot {
            limit: self.limit,
            window_length: Duration::from_nanos(self.window_length),
            previous_count: self.previous.count(),
            previous_start: Duration::from_nanos(self.previous.start()),
            current_count: self.current.count(),
            current_start: Duration::from_nanos(self.current.start()),
        }
    }
}

/// Point-in-time copy of an entry's windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntrySnapshot {
    pub limit: u64,
    pub window_length: Duration,
    pub previous_count: u64,
    /// Start of the previous window, since the UNIX epoch
    pub previous_start: Duration,
    pub current_count: u64,
    /// Start of the current window, since the UNIX epoch
    pub current_start: Duration,
}
