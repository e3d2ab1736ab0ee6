//! Rate limiting logic and state management.

mod entry;
mod global;
mod key;
mod limiter;
mod shard;
mod sweeper;
mod window;

pub use entry::{Entry, EntrySnapshot};
pub use global::{allow, allow_n, default_limiter, init_default};
pub use key::{LimitKey, Quota};
pub use limiter::{LimiterBuilder, SlidingWindowLimiter, DEFAULT_SHARD_COUNT};
pub use sweeper::Sweeper;
pub use window::Window;
