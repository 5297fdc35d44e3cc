use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::{interval, Interval, MissedTickBehavior};

/// Steady-rate token emitter shared by all concurrent callers of one
/// provider client.
///
/// `acquire` resolves on the next tick of a fixed-interval clock; there is
/// no burst credit, so a caller that was idle for a while still waits for
/// the next tick like everyone else. Dropping the `acquire` future before
/// it resolves does not consume a tick.
#[derive(Clone)]
pub struct RateLimiter {
    ticker: Arc<Mutex<Interval>>,
}

impl RateLimiter {
    pub fn new(tick: Duration) -> Self {
        let mut ticker = interval(tick.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self {
            ticker: Arc::new(Mutex::new(ticker)),
        }
    }

    /// Limiter for a requests-per-second budget; `None` or a non-positive
    /// value falls back to `default_rps`.
    pub fn per_second(rps: Option<f64>, default_rps: f64) -> Self {
        let rps = match rps {
            Some(r) if r > 0.0 => r,
            _ => default_rps,
        };
        Self::new(Duration::from_secs_f64(1.0 / rps))
    }

    /// Blocks until the next steady tick.
    pub async fn acquire(&self) {
        let mut ticker = self.ticker.lock().await;
        ticker.tick().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[tokio::test(start_paused = true)]
    async fn test_acquire_paces_callers() {
        let limiter = RateLimiter::new(Duration::from_millis(100));
        let start = Instant::now();

        // First tick fires immediately, the following ones at the cadence.
        limiter.acquire().await;
        limiter.acquire().await;
        limiter.acquire().await;

        // Paused tokio time auto-advances: the 200ms of virtual waiting
        // after the immediate first tick costs no real time.
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_is_shared_across_clones() {
        let limiter = RateLimiter::new(Duration::from_millis(50));
        let other = limiter.clone();

        limiter.acquire().await;
        let before = tokio::time::Instant::now();
        other.acquire().await;
        // The clone waited for the shared clock, not a fresh one.
        assert!(tokio::time::Instant::now() - before >= Duration::from_millis(50));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_acquire_does_not_consume_a_tick() {
        let limiter = RateLimiter::new(Duration::from_millis(50));
        limiter.acquire().await;

        {
            // Poll an acquire once, then drop it before it resolves.
            let pending = limiter.acquire();
            tokio::pin!(pending);
            let poll = futures_poll_once(&mut pending).await;
            assert!(poll.is_none());
        }

        // The next acquire waits one period, not two: the dropped future
        // neither skipped nor consumed a tick.
        let before = tokio::time::Instant::now();
        limiter.acquire().await;
        let waited = tokio::time::Instant::now() - before;
        assert!(waited >= Duration::from_millis(50));
        assert!(waited < Duration::from_millis(100));
    }

    async fn futures_poll_once<F: std::future::Future + Unpin>(f: &mut F) -> Option<F::Output> {
        use std::future::Future;
        use std::pin::Pin;
        use std::task::{Context, Poll};

        struct Once<'a, F>(&'a mut F);
        impl<F: Future + Unpin> Future for Once<'_, F> {
            type Output = Option<F::Output>;
            fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
                match Pin::new(&mut *self.0).poll(cx) {
                    Poll::Ready(v) => Poll::Ready(Some(v)),
                    Poll::Pending => Poll::Ready(None),
                }
            }
        }
        Once(f).await
    }
}
