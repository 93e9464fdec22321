//! Reliability patterns for activity execution
//!
//! This module provides:
//! - [`RetryPolicy`] - Per-activity retry with exponential backoff

mod retry;

pub(crate) use retry::duration_millis;
pub use retry::RetryPolicy;
