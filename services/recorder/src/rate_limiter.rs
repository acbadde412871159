//! Sliding-window limiter for outbound API calls.

use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

/// Admits at most `max_requests` calls within any window of `period`.
///
/// One instance is shared by every task that talks to the remote API. Waiters
/// hold the internal lock while sleeping, so admissions are serialized; the
/// order in which queued waiters are admitted is not guaranteed.
#[derive(Debug)]
pub struct RateLimiter {
    max_requests: usize,
    period: Duration,
    admitted: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    /// Create a limiter admitting `max_requests` per `period`.
    pub fn new(max_requests: usize, period: Duration) -> Self {
        let max_requests = max_requests.max(1);

        Self {
            max_requests,
            period,
            admitted: Mutex::new(VecDeque::with_capacity(max_requests)),
        }
    }

    pub fn max_requests(&self) -> usize {
        self.max_requests
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Block until another request may be issued, then record it.
    pub async fn wait(&self) {
        let mut admitted = self.admitted.lock().await;

        loop {
            let now = Instant::now();

            while let Some(&oldest) = admitted.front() {
                if now.duration_since(oldest) >= self.period {
                    admitted.pop_front();
                } else {
                    break;
                }
            }

            if admitted.len() < self.max_requests {
                admitted.push_back(now);
                return;
            }

            let Some(&oldest) = admitted.front() else {
                continue;
            };
            let delay = self.period.saturating_sub(now.duration_since(oldest));

            debug!(delay_ms = delay.as_millis() as u64, "Rate limit reached, waiting");
            tokio::time::sleep(delay).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn assert_window(times: &mut [Instant], max_requests: usize, period: Duration) {
        times.sort();
        for pair in times.windows(max_requests + 1) {
            let first = pair[0];
            let last = pair[max_requests];
            assert!(
                last.duration_since(first) >= period,
                "{} requests admitted within {:?}",
                max_requests + 1,
                last.duration_since(first)
            );
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_admits_up_to_limit_immediately() {
        let limiter = RateLimiter::new(3, Duration::from_secs(10));
        let start = Instant::now();

        for _ in 0..3 {
            limiter.wait().await;
        }

        assert_eq!(Instant::now(), start);
    }

    #[tokio::test(start_paused = true)]
    async fn test_blocks_until_oldest_expires() {
        let limiter = RateLimiter::new(1, Duration::from_secs(5));
        let start = Instant::now();

        limiter.wait().await;
        limiter.wait().await;

        assert_eq!(Instant::now().duration_since(start), Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sequential_burst_respects_window() {
        let period = Duration::from_secs(1);
        let limiter = RateLimiter::new(2, period);
        let mut times = Vec::new();

        for _ in 0..9 {
            limiter.wait().await;
            times.push(Instant::now());
        }

        assert_window(&mut times, 2, period);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_callers_respect_window() {
        let period = Duration::from_secs(2);
        let limiter = Arc::new(RateLimiter::new(3, period));

        let mut handles = Vec::new();
        for i in 0..12u64 {
            let limiter = limiter.clone();
            handles.push(tokio::spawn(async move {
                // Irregular arrivals
                tokio::time::sleep(Duration::from_millis((i % 4) * 150)).await;
                limiter.wait().await;
                Instant::now()
            }));
        }

        let mut times = Vec::new();
        for handle in handles {
            times.push(handle.await.unwrap());
        }

        assert_eq!(times.len(), 12);
        assert_window(&mut times, 3, period);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_gap_resets_window() {
        let limiter = RateLimiter::new(1, Duration::from_secs(1));

        limiter.wait().await;
        tokio::time::sleep(Duration::from_secs(3)).await;

        let before = Instant::now();
        limiter.wait().await;
        assert_eq!(Instant::now(), before);
    }

    #[test]
    fn test_zero_max_requests_is_clamped() {
        let limiter = RateLimiter::new(0, Duration::from_secs(1));
        assert_eq!(limiter.max_requests(), 1);
    }
}
