//! Accumulator - In-process sliding-window rate limiting
//!
//! This crate decides whether to admit a request for a caller-supplied key
//! given a cost, a limit and a window length. State lives in a sharded map
//! of per-key entries, each blending a previous and a current fixed window
//! to approximate a true sliding window.

pub mod clock;
pub mod config;
pub mod error;
pub mod ratelimit;

pub use error::{AccumulatorError, Result};
pub use ratelimit::{allow, allow_n, Quota, SlidingWindowLimiter};
