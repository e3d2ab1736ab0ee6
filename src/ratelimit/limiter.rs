//! Core rate limiter implementation.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ahash::RandomState;
use tracing::{debug, info, trace, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::{AccumulatorConfig, LimiterConfig};
use crate::error::{AccumulatorError, Result};

use super::entry::{Entry, EntrySnapshot};
use super::key::{LimitKey, Quota};
use super::shard::Shard;

/// Default number of shards.
pub const DEFAULT_SHARD_COUNT: usize = 512;

/// Sliding-window rate limiter over a sharded key space.
///
/// Each `(key, limit, window)` triple owns one entry with a previous and a
/// current fixed window. Admission blends the previous window's count,
/// weighted by how much of it still overlaps the sliding window, with the
/// current window's count.
///
/// When a sweep interval is set, the first check after each interval
/// elapses evicts stale entries from every shard before returning.
///
/// This struct is thread-safe and can be shared across threads.
pub struct SlidingWindowLimiter {
    shards: Box<[Shard]>,
    mask: u64,
    hasher: RandomState,
    clock: Arc<dyn Clock>,
    sweep_interval: Option<u64>,
    next_sweep: AtomicU64,
}

impl std::fmt::Debug for SlidingWindowLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlidingWindowLimiter")
            .field("shards", &self.shards.len())
            .field("clock", &self.clock)
            .field("sweep_interval", &self.sweep_interval.map(Duration::from_nanos))
            .finish()
    }
}

/// Builder for [`SlidingWindowLimiter`].
#[derive(Debug, Default)]
pub struct LimiterBuilder {
    shard_count: Option<usize>,
    max_entries_per_shard: Option<usize>,
    sweep_interval: Option<Duration>,
    clock: Option<Arc<dyn Clock>>,
}

impl LimiterBuilder {
    /// Number of shards; must be a non-zero power of two.
    pub fn shard_count(mut self, shard_count: usize) -> Self {
        self.shard_count = Some(shard_count);
        self
    }

    /// Bound each shard's entry count. Unbounded when unset.
    pub fn max_entries_per_shard(mut self, max: usize) -> Self {
        self.max_entries_per_shard = Some(max);
        self
    }

    /// Sweep stale entries inline once per `interval`. Off when unset.
    pub fn sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = Some(interval);
        self
    }

    /// Apply shard count, capacity and sweep interval from configuration.
    pub fn limiter_config(mut self, config: &LimiterConfig) -> Self {
        self.shard_count = Some(config.shard_count);
        self.max_entries_per_shard = config.max_entries_per_shard;
        self.sweep_interval = config.sweep_interval();
        self
    }

    /// Time source. Defaults to [`SystemClock`].
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn build(self) -> Result<SlidingWindowLimiter> {
        let shard_count = self.shard_count.unwrap_or(DEFAULT_SHARD_COUNT);
        if shard_count == 0 || !shard_count.is_power_of_two() {
            return Err(AccumulatorError::InvalidShardCount(shard_count));
        }
        if self.max_entries_per_shard == Some(0) {
            return Err(AccumulatorError::Config(
                "max_entries_per_shard must be greater than zero".to_string(),
            ));
        }

        let sweep_interval = match self.sweep_interval {
            Some(interval) if interval.is_zero() => {
                return Err(AccumulatorError::Config(
                    "sweep interval must be greater than zero".to_string(),
                ));
            }
            Some(interval) => Some(
                u64::try_from(interval.as_nanos())
                    .map_err(|_| AccumulatorError::Config("sweep interval is too long".to_string()))?,
            ),
            None => None,
        };

        let shards = (0..shard_count)
            .map(|_| Shard::new(self.max_entries_per_shard))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Ok(SlidingWindowLimiter {
            shards,
            mask: shard_count as u64 - 1,
            hasher: RandomState::new(),
            clock: self
                .clock
                .unwrap_or_else(|| Arc::new(SystemClock) as Arc<dyn Clock>),
            sweep_interval,
            next_sweep: AtomicU64::new(0),
        })
    }
}

impl SlidingWindowLimiter {
    /// Create a limiter with the default shard count and the system clock.
    pub fn new() -> Self {
        Self {
            shards: (0..DEFAULT_SHARD_COUNT).map(|_| Shard::new(None)).collect(),
            mask: DEFAULT_SHARD_COUNT as u64 - 1,
            hasher: RandomState::new(),
            clock: Arc::new(SystemClock),
            sweep_interval: None,
            next_sweep: AtomicU64::new(0),
        }
    }

    /// Create a limiter with `shard_count` shards.
    pub fn with_shard_count(shard_count: usize) -> Result<Self> {
        Self::builder().shard_count(shard_count).build()
    }

    pub fn builder() -> LimiterBuilder {
        LimiterBuilder::default()
    }

    /// Create a limiter from loaded configuration.
    pub fn from_config(config: &AccumulatorConfig) -> Result<Self> {
        config.validate()?;

        let limiter = Self::builder()
            .limiter_config(&config.limiter)
            .clock(config.clock.build()?)
            .build()?;
        info!(
            shards = config.limiter.shard_count,
            max_entries_per_shard = ?config.limiter.max_entries_per_shard,
            sweep_interval = ?config.limiter.sweep_interval(),
            clock = ?config.clock.source,
            "Rate limiter initialized"
        );
        Ok(limiter)
    }

    /// Admit a single request for `key` if it fits within `limit` per `window`.
    pub fn allow(&self, key: &str, limit: u64, window: Duration) -> bool {
        self.allow_n(key, 1, limit, window)
    }

    /// Admit a request of `cost` for `key` if it fits within `limit` per `window`.
    ///
    /// An invalid limit or window is logged and rejected. Use [`check_n`]
    /// to receive the error instead.
    ///
    /// [`check_n`]: Self::check_n
    pub fn allow_n(&self, key: &str, cost: u64, limit: u64, window: Duration) -> bool {
        match self.check_n(key, cost, limit, window) {
            Ok(admitted) => admitted,
            Err(error) => {
                warn!(key = %key, limit, ?window, %error, "Rejecting request with invalid quota");
                false
            }
        }
    }

    /// Like [`allow_n`](Self::allow_n), but fails on an invalid limit or window.
    pub fn check_n(&self, key: &str, cost: u64, limit: u64, window: Duration) -> Result<bool> {
        let quota = Quota::new(limit, window)?;
        Ok(self.check_quota(key, cost, &quota))
    }

    /// Admit a request of `cost` against a pre-validated quota.
    pub fn check_quota(&self, key: &str, cost: u64, quota: &Quota) -> bool {
        let key = LimitKey::new(key, *quota);
        let hash = key.hash_with(&self.hasher);
        let shard = self.shard_for(hash);

        let admitted = loop {
            let created_at = self.now_nanos();
            let entry = shard.get_or_insert_with(hash, created_at, || {
                debug!(key = %key, "Creating new rate limit entry");
                let mut entry = Entry::started_at(quota, created_at);
                entry.touch(shard.next_stamp());
                entry
            });

            let mut entry = entry.lock();
            if entry.is_evicted() {
                continue;
            }
            // Rejected checks count as accesses too, so a key kept busy past
            // its limit is never the capacity victim.
            entry.touch(shard.next_stamp());
            // Read the clock under the entry lock so time never runs backwards
            // between callers that serialize on this entry.
            let now = self.now_nanos();
            break Self::admit(&mut entry, now, cost, &key);
        };

        self.maybe_sweep();
        admitted
    }

    fn maybe_sweep(&self) {
        let Some(interval) = self.sweep_interval else {
            return;
        };
        let now = self.now_nanos();
        let due = self.next_sweep.load(Ordering::Relaxed);
        if now < due {
            return;
        }
        // Only the caller that wins the exchange pays for the sweep.
        if self
            .next_sweep
            .compare_exchange(due, now.saturating_add(interval), Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
        {
            self.evict_stale_at(now);
        }
    }

    fn admit(entry: &mut Entry, now: u64, cost: u64, key: &LimitKey<'_>) -> bool {
        entry.roll(now);
        let estimated = entry.estimated_count(now);

        trace!(key = %key, cost, estimated, "Checking rate limit");

        if estimated.saturating_add(cost) > entry.limit() {
            debug!(
                key = %key,
                cost,
                estimated,
                limit = entry.limit(),
                "Rate limit exceeded"
            );
            return false;
        }

        entry.current_mut().add_count(cost);
        true
    }

    /// Get a copy of the stored state for a key, if any.
    ///
    /// The state is as of the last admission check; windows are not rolled.
    pub fn snapshot(&self, key: &str, quota: &Quota) -> Option<EntrySnapshot> {
        let hash = LimitKey::new(key, *quota).hash_with(&self.hasher);
        self.shard_for(hash)
            .get(hash)
            .map(|entry| entry.lock().snapshot())
    }

    /// Drop every entry whose windows would both be discarded on next use.
    ///
    /// Returns the number of entries removed.
    pub fn evict_stale(&self) -> usize {
        self.evict_stale_at(self.now_nanos())
    }

    fn evict_stale_at(&self, now: u64) -> usize {
        let evicted: usize = self.shards.iter().map(|shard| shard.evict_stale(now)).sum();
        if evicted > 0 {
            debug!(evicted, "Evicted stale rate limit entries");
        }
        evicted
    }

    /// Get the number of live entries.
    pub fn entry_count(&self) -> usize {
        self.shards.iter().map(Shard::len).sum()
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// Clear all entries.
    pub fn clear(&self) {
        for shard in self.shards.iter() {
            shard.clear();
        }
    }

    fn shard_for(&self, hash: u64) -> &Shard {
        &self.shards[(hash & self.mask) as usize]
    }

    fn now_nanos(&self) -> u64 {
        u64::try_from(self.clock.now().as_nanos()).unwrap_or(u64::MAX)
    }
}

impl Default for SlidingWindowLimiter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::sync::Barrier;

    const SECOND: Duration = Duration::from_secs(1);
    const BASE: Duration = Duration::from_secs(1_700_000_000);

    fn ms(millis: u64) -> Duration {
        Duration::from_millis(millis)
    }

    fn limiter_at(start: Duration) -> (SlidingWindowLimiter, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(start));
        let limiter = SlidingWindowLimiter::builder()
            .shard_count(16)
            .clock(clock.clone())
            .build()
            .unwrap();
        (limiter, clock)
    }

    fn drain(limiter: &SlidingWindowLimiter, key: &str, limit: u64, window: Duration) -> u64 {
        let mut admitted = 0;
        while limiter.allow(key, limit, window) {
            admitted += 1;
        }
        admitted
    }

    #[test]
    fn test_limiter_creation() {
        let limiter = SlidingWindowLimiter::new();
        assert_eq!(limiter.shard_count(), DEFAULT_SHARD_COUNT);
        assert_eq!(limiter.entry_count(), 0);
    }

    #[test]
    fn test_shard_count_must_be_power_of_two() {
        assert!(matches!(
            SlidingWindowLimiter::with_shard_count(0),
            Err(AccumulatorError::InvalidShardCount(0))
        ));
        assert!(matches!(
            SlidingWindowLimiter::with_shard_count(100),
            Err(AccumulatorError::InvalidShardCount(100))
        ));
        assert_eq!(SlidingWindowLimiter::with_shard_count(64).unwrap().shard_count(), 64);
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let result = SlidingWindowLimiter::builder().max_entries_per_shard(0).build();
        assert!(matches!(result, Err(AccumulatorError::Config(_))));
    }

    #[test]
    fn test_three_per_second_rollover() {
        let (limiter, clock) = limiter_at(BASE);

        for offset in [0, 100, 200] {
            clock.set(BASE + ms(offset));
            assert!(limiter.allow("client", 3, SECOND));
        }
        clock.set(BASE + ms(300));
        assert!(!limiter.allow("client", 3, SECOND));

        // 95% of the previous window still counts: floor(0.95 * 3) = 2
        clock.set(BASE + ms(1050));
        assert!(limiter.allow("client", 3, SECOND));
        assert!(!limiter.allow("client", 3, SECOND));
    }

    #[test]
    fn test_weighted_blend() {
        let (limiter, clock) = limiter_at(BASE);

        for i in 0..10 {
            clock.set(BASE + ms(i * 90));
            assert!(limiter.allow("blend", 10, SECOND), "request {} should pass", i);
        }
        assert!(!limiter.allow("blend", 10, SECOND));

        clock.set(BASE + ms(1500));
        assert_eq!(drain(&limiter, "blend", 10, SECOND), 5);

        let quota = Quota::new(10, SECOND).unwrap();
        let snapshot = limiter.snapshot("blend", &quota).unwrap();
        assert_eq!(snapshot.previous_count, 10);
        assert_eq!(snapshot.current_count, 5);
        assert_eq!(snapshot.current_start, BASE + SECOND);
    }

    #[test]
    fn test_idle_windows_fully_decay() {
        let (limiter, clock) = limiter_at(BASE);
        assert_eq!(drain(&limiter, "idle", 4, SECOND), 4);

        clock.set(BASE + ms(2500));
        assert_eq!(drain(&limiter, "idle", 4, SECOND), 4);
    }

    #[test]
    fn test_allow_n_respects_cost() {
        let (limiter, _clock) = limiter_at(BASE);

        assert!(limiter.allow_n("bulk", 7, 10, SECOND));
        assert!(!limiter.allow_n("bulk", 4, 10, SECOND));
        assert!(limiter.allow_n("bulk", 3, 10, SECOND));
        assert!(!limiter.allow("bulk", 10, SECOND));
    }

    #[test]
    fn test_zero_cost_admitted_at_limit() {
        let (limiter, _clock) = limiter_at(BASE);
        assert_eq!(drain(&limiter, "free", 2, SECOND), 2);

        assert!(limiter.allow_n("free", 0, 2, SECOND));
        let snapshot = limiter
            .snapshot("free", &Quota::new(2, SECOND).unwrap())
            .unwrap();
        assert_eq!(snapshot.current_count, 2);
    }

    #[test]
    fn test_invalid_quota() {
        let (limiter, _clock) = limiter_at(BASE);

        assert!(matches!(
            limiter.check_n("bad", 1, 10, Duration::ZERO),
            Err(AccumulatorError::ZeroWindow)
        ));
        assert!(matches!(
            limiter.check_n("bad", 1, 0, SECOND),
            Err(AccumulatorError::ZeroLimit)
        ));
        assert!(!limiter.allow("bad", 10, Duration::ZERO));
        assert_eq!(limiter.entry_count(), 0);
    }

    #[test]
    fn test_keys_are_isolated() {
        let (limiter, _clock) = limiter_at(BASE);

        assert_eq!(drain(&limiter, "a", 5, SECOND), 5);
        assert_eq!(drain(&limiter, "b", 5, SECOND), 5);
        assert_eq!(limiter.entry_count(), 2);
    }

    #[test]
    fn test_quota_changes_address_new_entries() {
        let (limiter, _clock) = limiter_at(BASE);

        assert_eq!(drain(&limiter, "same", 2, SECOND), 2);
        assert_eq!(drain(&limiter, "same", 3, SECOND), 3);
        assert_eq!(drain(&limiter, "same", 2, Duration::from_secs(60)), 2);
        assert_eq!(limiter.entry_count(), 3);
    }

    #[test]
    fn test_separate_limiters_do_not_interfere() {
        let (first, _c1) = limiter_at(BASE);
        let (second, _c2) = limiter_at(BASE);

        assert_eq!(drain(&first, "shared", 3, SECOND), 3);
        assert_eq!(drain(&second, "shared", 3, SECOND), 3);
    }

    #[test]
    fn test_replay_is_deterministic() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut offset = 0;
        let sequence: Vec<(u64, u64)> = (0..500)
            .map(|_| {
                offset += rng.gen_range(0..40);
                (offset, rng.gen_range(0..4))
            })
            .collect();

        let replay = |sequence: &[(u64, u64)]| {
            let (limiter, clock) = limiter_at(BASE);
            sequence
                .iter()
                .map(|&(at, cost)| {
                    clock.set(BASE + ms(at));
                    limiter.allow_n("replay", cost, 12, ms(250))
                })
                .collect::<Vec<_>>()
        };

        assert_eq!(replay(sequence.as_slice()), replay(sequence.as_slice()));
    }

    #[test]
    fn test_admitted_cost_is_bounded_per_window() {
        let limit = 20;
        let window = ms(100);
        let (limiter, clock) = limiter_at(BASE);
        let mut rng = StdRng::seed_from_u64(42);

        let mut per_window = std::collections::BTreeMap::<u64, u64>::new();
        let mut offset = 0;
        for _ in 0..5_000 {
            offset += rng.gen_range(0..3);
            clock.set(BASE + ms(offset));
            if limiter.allow("bounded", limit, window) {
                *per_window.entry(offset / 100).or_default() += 1;
            }
        }

        for (index, admitted) in &per_window {
            assert!(*admitted <= limit, "window {} admitted {}", index, admitted);
            let next = per_window.get(&(index + 1)).copied().unwrap_or(0);
            assert!(admitted + next <= 2 * limit);
        }
    }

    #[test]
    fn test_concurrent_callers_never_exceed_limit() {
        const THREADS: usize = 64;
        const LIMIT: u64 = 10;

        let (limiter, _clock) = limiter_at(BASE);
        let limiter = Arc::new(limiter);
        let barrier = Arc::new(Barrier::new(THREADS));

        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    limiter.allow("contended", LIMIT, SECOND)
                })
            })
            .collect();

        let admitted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|admitted| *admitted)
            .count();

        assert_eq!(admitted as u64, LIMIT);
    }

    #[test]
    fn test_concurrent_bursts_across_keys() {
        const THREADS: usize = 8;
        const CALLS: usize = 200;
        const LIMIT: u64 = 50;

        let (limiter, _clock) = limiter_at(BASE);
        let limiter = Arc::new(limiter);
        let barrier = Arc::new(Barrier::new(THREADS));

        let handles: Vec<_> = (0..THREADS)
            .map(|t| {
                let limiter = Arc::clone(&limiter);
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    let mut admitted = [0u64; 4];
                    for i in 0..CALLS {
                        let slot = (i + t) % 4;
                        if limiter.allow(&format!("key-{}", slot), LIMIT, SECOND) {
                            admitted[slot] += 1;
                        }
                    }
                    admitted
                })
            })
            .collect();

        let mut totals = [0u64; 4];
        for handle in handles {
            for (total, admitted) in totals.iter_mut().zip(handle.join().unwrap()) {
                *total += admitted;
            }
        }

        assert_eq!(totals, [LIMIT; 4]);
    }

    #[test]
    fn test_evict_stale() {
        let (limiter, clock) = limiter_at(BASE);

        limiter.allow("old", 5, SECOND);
        clock.set(BASE + ms(1500));
        limiter.allow("recent", 5, SECOND);

        assert_eq!(limiter.evict_stale(), 0);

        clock.set(BASE + ms(2100));
        assert_eq!(limiter.evict_stale(), 1);
        assert!(limiter
            .snapshot("old", &Quota::new(5, SECOND).unwrap())
            .is_none());
        assert_eq!(limiter.entry_count(), 1);
    }

    #[test]
    fn test_eviction_does_not_change_decisions() {
        let (evicting, clock) = limiter_at(BASE);
        let (keeping, other_clock) = limiter_at(BASE);

        for at in [0, 400, 2600, 2700, 6000, 6100, 6950] {
            clock.set(BASE + ms(at));
            other_clock.set(BASE + ms(at));
            evicting.evict_stale();
            assert_eq!(
                drain(&evicting, "k", 4, SECOND),
                drain(&keeping, "k", 4, SECOND),
                "diverged at {}ms",
                at
            );
        }
    }

    #[test]
    fn test_capacity_bounds_entries() {
        let clock = Arc::new(ManualClock::new(BASE));
        let limiter = SlidingWindowLimiter::builder()
            .shard_count(1)
            .max_entries_per_shard(8)
            .clock(clock)
            .build()
            .unwrap();

        for i in 0..100 {
            assert!(limiter.allow(&format!("client-{}", i), 1, SECOND));
        }
        assert_eq!(limiter.entry_count(), 8);
    }

    #[test]
    fn test_busy_key_survives_capacity_churn() {
        let clock = Arc::new(ManualClock::new(BASE));
        let limiter = SlidingWindowLimiter::builder()
            .shard_count(1)
            .max_entries_per_shard(2)
            .clock(clock)
            .build()
            .unwrap();

        let mut hot_admitted = 0;
        for i in 0..50 {
            if limiter.allow("hot", 3, SECOND) {
                hot_admitted += 1;
            }
            limiter.allow(&format!("other-{}", i), 3, SECOND);
        }

        assert_eq!(hot_admitted, 3);
        let snapshot = limiter
            .snapshot("hot", &Quota::per_second(3).unwrap())
            .unwrap();
        assert_eq!(snapshot.current_count, 3);
    }

    #[test]
    fn test_zero_sweep_interval_rejected() {
        let result = SlidingWindowLimiter::builder()
            .sweep_interval(Duration::ZERO)
            .build();
        assert!(matches!(result, Err(AccumulatorError::Config(_))));
    }

    #[test]
    fn test_default_config_sweeps_stale_entries() {
        let config = AccumulatorConfig::default();
        let clock = Arc::new(ManualClock::new(BASE));
        let limiter = SlidingWindowLimiter::builder()
            .limiter_config(&config.limiter)
            .clock(clock.clone())
            .build()
            .unwrap();

        assert!(limiter.allow("idle", 5, SECOND));
        clock.advance(Duration::from_secs(30));
        assert!(limiter.allow("active", 5, SECOND));
        // Not yet due: the first sweep ran at BASE.
        assert_eq!(limiter.entry_count(), 2);

        clock.advance(Duration::from_secs(31));
        assert!(limiter.allow("active", 5, SECOND));
        assert_eq!(limiter.entry_count(), 1);
        assert!(limiter
            .snapshot("idle", &Quota::per_second(5).unwrap())
            .is_none());
    }

    #[test]
    fn test_no_inline_sweep_by_default() {
        let (limiter, clock) = limiter_at(BASE);
        assert!(limiter.allow("idle", 5, SECOND));
        clock.advance(Duration::from_secs(3600));
        assert!(limiter.allow("active", 5, SECOND));
        assert_eq!(limiter.entry_count(), 2);
    }

    #[test]
    fn test_clear() {
        let (limiter, _clock) = limiter_at(BASE);
        assert_eq!(drain(&limiter, "reset", 2, SECOND), 2);

        limiter.clear();
        assert_eq!(limiter.entry_count(), 0);
        assert_eq!(drain(&limiter, "reset", 2, SECOND), 2);
    }
}
