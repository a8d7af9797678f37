//! Rate-paced request governor.
//!
//! Outbound heavy calls (stream-URL extraction, provider search fan-out)
//! are paced two ways: a semaphore bounds parallelism, and a last-extraction
//! timestamp plus uniform random jitter enforces a minimum gap between
//! consecutive extractions so requests look organic rather than scripted.

use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tracing::debug;

pub struct RequestGovernor {
    semaphore: Arc<Semaphore>,
    last_extract: Mutex<Option<Instant>>,
    extract_delay: (f64, f64),
    batch_delay: (f64, f64),
}

impl RequestGovernor {
    pub fn new(
        concurrency: usize,
        extract_delay: (f64, f64),
        batch_delay: (f64, f64),
    ) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(concurrency.max(1))),
            last_extract: Mutex::new(None),
            extract_delay,
            batch_delay,
        }
    }

    /// Acquire a batch fan-out slot, then sleep a random inter-request
    /// delay while holding it.
    pub async fn acquire_batch_slot(&self) -> OwnedSemaphorePermit {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .expect("governor semaphore closed");
        tokio::time::sleep(jitter(self.batch_delay)).await;
        permit
    }

    /// Enforce the inter-extraction gap. Extractions are serialized through
    /// the timestamp mutex; the timestamp is updated on every invocation.
    pub async fn pace_extraction(&self) {
        let mut last = self.last_extract.lock().await;
        let min_gap = jitter(self.extract_delay);
        if let Some(previous) = *last {
            let elapsed = previous.elapsed();
            if elapsed < min_gap {
                let wait = min_gap - elapsed;
                debug!(wait_ms = wait.as_millis() as u64, "Throttling extraction");
                tokio::time::sleep(wait).await;
            }
        }
        *last = Some(Instant::now());
    }

    pub fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }
}

/// Uniform random duration in `[min, max]` seconds.
pub fn jitter((min, max): (f64, f64)) -> Duration {
    let (lo, hi) = if min <= max { (min, max) } else { (max, min) };
    let secs = if (hi - lo).abs() < f64::EPSILON {
        lo
    } else {
        rand::thread_rng().gen_range(lo..=hi)
    };
    Duration::from_secs_f64(secs.max(0.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_jitter_within_bounds() {
        for _ in 0..100 {
            let d = jitter((0.3, 1.0));
            assert!(d >= Duration::from_secs_f64(0.3));
            assert!(d <= Duration::from_secs_f64(1.0));
        }
    }

    #[test]
    fn test_jitter_degenerate_range() {
        assert_eq!(jitter((0.5, 0.5)), Duration::from_secs_f64(0.5));
        assert_eq!(jitter((0.0, 0.0)), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_semaphore_bounds_parallelism() {
        let governor = Arc::new(RequestGovernor::new(2, (0.0, 0.0), (0.0, 0.0)));
        let first = governor.acquire_batch_slot().await;
        let _second = governor.acquire_batch_slot().await;
        assert_eq!(governor.available_permits(), 0);

        drop(first);
        assert_eq!(governor.available_permits(), 1);
    }

    #[tokio::test]
    async fn test_pace_updates_timestamp() {
        let governor = RequestGovernor::new(1, (0.0, 0.0), (0.0, 0.0));
        governor.pace_extraction().await;
        let last = governor.last_extract.lock().await;
        assert!(last.is_some());
    }
}
