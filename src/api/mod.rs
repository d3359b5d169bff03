//! Provides the client and scheduling utilities for the upstream station feed.
//!
//! Includes:
//! - `waqi`: client for the station feed endpoint.
//! - `retry`: the retry state machine and typed fetch failures.
//! - `batch`: fixed-window concurrency for multi-station fetches.

mod batch;
mod retry;
mod waqi;
#[cfg(test)]
mod waqi_test;

pub use batch::*;
pub use retry::*;
pub use waqi::*;
