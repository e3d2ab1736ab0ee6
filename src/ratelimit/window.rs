//! A single fixed counting window.

/// Count of admitted cost since an aligned start time.
///
/// Times are nanoseconds since the UNIX epoch. A window has no locking of its
/// own; the owning entry serializes access.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Window {
    count: u64,
    start: u64,
}

impl Window {
    /// Create a window with an initial count and start time.
    pub fn new(count: u64, start: u64) -> Self {
        Self { count, start }
    }

    /// Zero the count and move the window to `start`.
    pub fn reset(&mut self, start: u64) {
        self.count = 0;
        self.start = start;
    }

    /// Overwrite both fields.
    pub fn set_state(&mut self, start: u64, count: u64) {
        self.start = start;
        self.count = count;
    }

    /// Add `n` to the count.
    pub fn add_count(&mut self, n: u64) {
        self.count = self.count.wrapping_add(n);
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn start(&self) -> u64 {
        self.start
    }
}
