//! Fixed-window batch scheduling for station fetches.
//!
//! Station ids are split into windows of `batch_size`. All fetches in a window run
//! concurrently, the whole window is awaited, and a fixed delay separates consecutive
//! windows (none after the last). Peak concurrency is therefore `batch_size` regardless
//! of how many stations a city has.

use crate::config::FetchConfig;
use futures::future::join_all;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct BatchScheduler {
    batch_size: usize,
    delay: Duration,
}

impl BatchScheduler {
    pub fn new(batch_size: usize, delay: Duration) -> Self {
        Self {
            batch_size: batch_size.max(1),
            delay,
        }
    }

    pub fn from_config(config: &FetchConfig) -> Self {
        Self::new(config.batch_size, config.batch_delay())
    }

    /// Runs `task` once per id and returns `(id, output)` pairs in input order.
    pub async fn run<T, F, Fut>(&self, ids: &[String], task: F) -> Vec<(String, T)>
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = T>,
    {
        let windows = (ids.len() + self.batch_size - 1) / self.batch_size;
        let mut results = Vec::with_capacity(ids.len());

        for (index, window) in ids.chunks(self.batch_size).enumerate() {
            debug!(
                "Fetching window {}/{} ({} stations)",
                index + 1,
                windows,
                window.len()
            );
            let outputs = join_all(window.iter().cloned().map(&task)).await;
            results.extend(window.iter().cloned().zip(outputs));

            if index + 1 < windows && !self.delay.is_zero() {
                sleep(self.delay).await;
            }
        }

        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::time::Instant;

    fn ids(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("@{}", i)).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_never_exceeds_window() {
        let scheduler = BatchScheduler::new(5, Duration::from_millis(100));
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let results = scheduler
            .run(&ids(12), |id| {
                let active = active.clone();
                let peak = peak.clone();
                async move {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    sleep(Duration::from_millis(50)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    id.len()
                }
            })
            .await;

        assert_eq!(results.len(), 12);
        assert_eq!(peak.load(Ordering::SeqCst), 5);
        assert_eq!(results[0].0, "@0");
        assert_eq!(results[11].0, "@11");
    }

    #[tokio::test(start_paused = true)]
    async fn test_delay_only_between_windows() {
        let scheduler = BatchScheduler::new(2, Duration::from_secs(1));
        let start = Instant::now();
        scheduler.run(&ids(5), |_| async {}).await;
        // Three windows, two gaps.
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(2));
        assert!(elapsed < Duration::from_secs(3));

        let start = Instant::now();
        scheduler.run(&ids(2), |_| async {}).await;
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_empty_input() {
        let scheduler = BatchScheduler::new(5, Duration::from_secs(1));
        let results: Vec<(String, ())> = scheduler.run(&[], |_| async {}).await;
        assert!(results.is_empty());
    }

    #[test]
    fn test_zero_batch_size_is_clamped() {
        let scheduler = BatchScheduler::new(0, Duration::ZERO);
        assert_eq!(scheduler.batch_size, 1);
    }
}
