use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// Fixed-window request counter keyed by an arbitrary string. Good enough for
/// throttling credential endpoints; not a distributed limiter.
#[derive(Default)]
pub struct RateLimiter {
    inner: Mutex<HashMap<String, WindowState>>,
}

#[derive(Clone, Copy)]
pub struct RateLimitOutcome {
    pub allowed: bool,
    pub retry_after: Option<Duration>,
}

struct WindowState {
    window_start: Instant,
    count: u64,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn check(&self, key: &str, limit: u64, window: Duration) -> RateLimitOutcome {
        if limit == 0 {
            return RateLimitOutcome {
                allowed: false,
                retry_after: Some(window),
            };
        }

        let mut guard = self.inner.lock().await;
        let entry = guard.entry(key.to_string()).or_insert_with(|| WindowState {
            window_start: Instant::now(),
            count: 0,
        });

        if entry.window_start.elapsed() >= window {
            entry.window_start = Instant::now();
            entry.count = 0;
        }

        entry.count += 1;
        if entry.count > limit {
            let retry_after = window.saturating_sub(entry.window_start.elapsed());
            return RateLimitOutcome {
                allowed: false,
                retry_after: Some(retry_after),
            };
        }

        RateLimitOutcome {
            allowed: true,
            retry_after: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn allows_up_to_the_limit_then_blocks() {
        let limiter = RateLimiter::new();
        let window = Duration::from_secs(60);

        for _ in 0..3 {
            assert!(limiter.check("signup:a@example.com", 3, window).await.allowed);
        }
        let blocked = limiter.check("signup:a@example.com", 3, window).await;
        assert!(!blocked.allowed);
        assert!(blocked.retry_after.is_some());
    }

    #[tokio::test]
    async fn keys_are_tracked_independently() {
        let limiter = RateLimiter::new();
        let window = Duration::from_secs(60);

        assert!(limiter.check("k1", 1, window).await.allowed);
        assert!(!limiter.check("k1", 1, window).await.allowed);
        assert!(limiter.check("k2", 1, window).await.allowed);
    }

    #[tokio::test]
    async fn zero_limit_blocks_everything() {
        let limiter = RateLimiter::new();
        let outcome = limiter.check("k", 0, Duration::from_secs(1)).await;
        assert!(!outcome.allowed);
    }
}
