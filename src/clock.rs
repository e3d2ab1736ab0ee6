//! Time sources for the limiter.
//!
//! Every admission check reads the clock once, so the default source is a
//! cached clock backed by `quanta`'s recent time, kept fresh by a
//! process-wide upkeep thread instead of a system call per request.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::{debug, warn};

/// Default interval between upkeep ticks of the cached clock.
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_millis(20);

/// Only one upkeep thread may run per process. Held here for the process
/// lifetime; `None` once starting it has failed.
static UPKEEP: OnceLock<Option<quanta::Handle>> = OnceLock::new();

/// A source of the current time, expressed as time since the UNIX epoch.
pub trait Clock: Send + Sync + std::fmt::Debug {
    fn now(&self) -> Duration;
}

fn system_now() -> Duration {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
}

fn as_nanos(d: Duration) -> u64 {
    u64::try_from(d.as_nanos()).unwrap_or(u64::MAX)
}

fn start_upkeep(refresh: Duration) -> bool {
    UPKEEP
        .get_or_init(|| match quanta::Upkeep::new(refresh).start() {
            Ok(handle) => {
                debug!(?refresh, "Clock upkeep started");
                Some(handle)
            }
            Err(error) => {
                warn!(%error, "Failed to start clock upkeep, cached clock will read the TSC directly");
                None
            }
        })
        .is_some()
}

/// Clock backed by `SystemTime::now()` on every call.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Duration {
        system_now()
    }
}

/// Coarse wall clock built on `quanta::Clock::recent`.
///
/// The wall time is sampled once at construction and advanced by the
/// monotonic quanta reading, so it never runs backwards. Staleness is
/// bounded by roughly one upkeep interval, which must stay well below any
/// window length in use. The upkeep interval is fixed by the first clock
/// started in the process.
#[derive(Debug, Clone)]
pub struct CachedClock {
    clock: quanta::Clock,
    anchor: quanta::Instant,
    anchor_wall: Duration,
}

impl CachedClock {
    /// Start a cached clock with the default upkeep interval.
    pub fn start() -> Self {
        Self::with_refresh(DEFAULT_REFRESH_INTERVAL)
    }

    /// Start a cached clock, launching upkeep at `refresh` if none is running.
    pub fn with_refresh(refresh: Duration) -> Self {
        let upkeep = start_upkeep(refresh);
        let clock = quanta::Clock::new();
        let anchor = clock.now();
        debug!(?refresh, upkeep, "Cached clock started");

        Self {
            clock,
            anchor,
            anchor_wall: system_now(),
        }
    }
}

impl Clock for CachedClock {
    fn now(&self) -> Duration {
        // recent() falls back to a direct read when upkeep is not running.
        self.anchor_wall + self.clock.recent().saturating_duration_since(self.anchor)
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    nanos: AtomicU64,
}

impl ManualClock {
    /// Create a clock reading `now`.
    pub fn new(now: Duration) -> Self {
        Self {
            nanos: AtomicU64::new(as_nanos(now)),
        }
    }

    /// Jump to an absolute time.
    pub fn set(&self, now: Duration) {
        self.nanos.store(as_nanos(now), Ordering::SeqCst);
    }

    /// Move forward by `delta`.
    pub fn advance(&self, delta: Duration) {
        self.nanos.fetch_add(as_nanos(delta), Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        Duration::from_nanos(self.nanos.load(Ordering::SeqCst))
    }
}
