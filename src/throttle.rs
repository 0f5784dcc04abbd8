//! Adaptive admission control for concurrent document operations.
//!
//! The throttler discovers a safe concurrency level instead of requiring a
//! hand-tuned worker count: the permitted window grows additively while
//! operations succeed below the target latency and shrinks
//! multiplicatively on overload signals (transport errors, 429/5xx), the
//! same feedback shape TCP congestion control uses.
//!
//! The window and the in-flight count are always updated together under
//! one lock, so the number of outstanding permits can never exceed the
//! window as it shrinks and grows. Cancelling an [`Throttler::acquire`]
//! is dropping its future.

use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::trace;

/// Tuning parameters for the adaptive window.
#[derive(Debug, Clone)]
pub struct ThrottlerOptions {
    /// Lower bound for the window. At least 1.
    pub min_window: usize,
    /// Upper bound for the window, capping resource use.
    pub max_window: usize,
    /// Window at the start of the feeding session.
    pub initial_window: usize,
    /// Successful operations at or above this latency stop window growth.
    pub target_latency: Duration,
    /// Multiplier applied on overload (transport error, 429, 5xx).
    pub backoff_factor: f64,
    /// Milder multiplier for request-shaped errors (other non-2xx).
    pub client_error_backoff: f64,
    /// Smoothing factor for the latency moving average, in (0, 1].
    pub ewma_alpha: f64,
}

impl Default for ThrottlerOptions {
    fn default() -> Self {
        Self {
            min_window: 1,
            max_window: 256,
            initial_window: 8,
            target_latency: Duration::from_secs(1),
            backoff_factor: 0.5,
            client_error_backoff: 0.9,
            ewma_alpha: 0.3,
        }
    }
}

/// The observed outcome of one operation, fed back on release.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// HTTP 2xx.
    Success { latency: Duration },
    /// Non-2xx status that signals a bad request rather than overload.
    ClientError,
    /// Transport failure or an overload status (429, 5xx).
    Overload,
}

/// Proof of admission. Must be given back via [`Throttler::release`].
#[derive(Debug)]
pub struct Permit {
    _priv: (),
}

#[derive(Debug)]
struct State {
    window: f64,
    inflight: usize,
    latency_ewma_ms: Option<f64>,
}

/// AIMD admission controller. The sole authority on how many operations
/// may be in flight at any instant.
#[derive(Debug)]
pub struct Throttler {
    opts: ThrottlerOptions,
    state: Mutex<State>,
    notify: Notify,
}

impl Throttler {
    pub fn new() -> Self {
        Self::with_options(ThrottlerOptions::default())
    }

    pub fn with_options(mut opts: ThrottlerOptions) -> Self {
        opts.min_window = opts.min_window.max(1);
        opts.max_window = opts.max_window.max(opts.min_window);
        let initial = opts
            .initial_window
            .clamp(opts.min_window, opts.max_window);
        Self {
            state: Mutex::new(State {
                window: initial as f64,
                inflight: 0,
                latency_ewma_ms: None,
            }),
            notify: Notify::new(),
            opts,
        }
    }

    /// Wait until fewer operations are in flight than the current window
    /// permits, then take a permit.
    pub async fn acquire(&self) -> Permit {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register for wakeups before checking, so a release between
            // the check and the await is not lost.
            notified.as_mut().enable();
            {
                let mut state = self.state.lock();
                if state.inflight < state.window as usize {
                    state.inflight += 1;
                    return Permit { _priv: () };
                }
            }
            notified.await;
        }
    }

    /// Give back a permit and adjust the window from the outcome.
    pub fn release(&self, permit: Permit, outcome: Outcome) {
        drop(permit);
        {
            let mut state = self.state.lock();
            state.inflight = state.inflight.saturating_sub(1);
            match outcome {
                Outcome::Success { latency } => {
                    let millis = latency.as_secs_f64() * 1000.0;
                    let smoothed = match state.latency_ewma_ms {
                        Some(prev) => prev + self.opts.ewma_alpha * (millis - prev),
                        None => millis,
                    };
                    state.latency_ewma_ms = Some(smoothed);
                    if smoothed < self.opts.target_latency.as_secs_f64() * 1000.0 {
                        // +1 spread over a full window of fast successes.
                        state.window += 1.0 / state.window.max(1.0);
                    }
                }
                Outcome::ClientError => state.window *= self.opts.client_error_backoff,
                Outcome::Overload => state.window *= self.opts.backoff_factor,
            }
            state.window = state
                .window
                .clamp(self.opts.min_window as f64, self.opts.max_window as f64);
            trace!(
                window = state.window,
                inflight = state.inflight,
                ?outcome,
                "throttler adjusted"
            );
        }
        self.notify.notify_waiters();
    }

    /// Current permitted concurrency.
    pub fn window(&self) -> usize {
        self.state.lock().window as usize
    }

    /// Operations currently holding a permit.
    pub fn inflight(&self) -> usize {
        self.state.lock().inflight
    }
}

impl Default for Throttler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn fast_success() -> Outcome {
        Outcome::Success {
            latency: Duration::from_millis(1),
        }
    }

    #[tokio::test]
    async fn window_never_exceeds_max_on_sustained_success() {
        let throttler = Throttler::with_options(ThrottlerOptions {
            max_window: 16,
            ..Default::default()
        });
        for _ in 0..10_000 {
            let permit = throttler.acquire().await;
            throttler.release(permit, fast_success());
        }
        assert_eq!(throttler.window(), 16);
    }

    #[tokio::test]
    async fn window_never_drops_below_min_on_sustained_failure() {
        let throttler = Throttler::with_options(ThrottlerOptions {
            min_window: 2,
            ..Default::default()
        });
        for _ in 0..1_000 {
            let permit = throttler.acquire().await;
            throttler.release(permit, Outcome::Overload);
        }
        assert_eq!(throttler.window(), 2);
    }

    #[tokio::test]
    async fn overload_halves_the_window() {
        let throttler = Throttler::new();
        assert_eq!(throttler.window(), 8);
        let permit = throttler.acquire().await;
        throttler.release(permit, Outcome::Overload);
        assert_eq!(throttler.window(), 4);
    }

    #[tokio::test]
    async fn client_errors_shrink_less_aggressively() {
        let overload = Throttler::new();
        let client_err = Throttler::new();
        let permit = overload.acquire().await;
        overload.release(permit, Outcome::Overload);
        let permit = client_err.acquire().await;
        client_err.release(permit, Outcome::ClientError);
        assert!(client_err.window() > overload.window());
    }

    #[tokio::test]
    async fn slow_successes_hold_the_window() {
        let throttler = Throttler::with_options(ThrottlerOptions {
            target_latency: Duration::from_millis(10),
            ..Default::default()
        });
        for _ in 0..100 {
            let permit = throttler.acquire().await;
            throttler.release(
                permit,
                Outcome::Success {
                    latency: Duration::from_millis(500),
                },
            );
        }
        assert_eq!(throttler.window(), 8);
    }

    #[tokio::test]
    async fn acquire_blocks_when_window_is_exhausted() {
        let throttler = Arc::new(Throttler::with_options(ThrottlerOptions {
            min_window: 1,
            max_window: 1,
            initial_window: 1,
            ..Default::default()
        }));
        let held = throttler.acquire().await;
        assert_eq!(throttler.inflight(), 1);

        let blocked = tokio::time::timeout(Duration::from_millis(50), throttler.acquire()).await;
        assert!(blocked.is_err(), "second acquire must block at window 1");

        let waiter = tokio::spawn({
            let throttler = Arc::clone(&throttler);
            async move { throttler.acquire().await }
        });
        throttler.release(held, fast_success());
        let permit = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter must be woken by release")
            .expect("waiter task must not panic");
        throttler.release(permit, fast_success());
        assert_eq!(throttler.inflight(), 0);
    }

    #[tokio::test]
    async fn shrinking_window_blocks_new_admissions_until_drained() {
        let throttler = Arc::new(Throttler::with_options(ThrottlerOptions {
            initial_window: 4,
            ..Default::default()
        }));
        let permits: Vec<_> = [
            throttler.acquire().await,
            throttler.acquire().await,
            throttler.acquire().await,
            throttler.acquire().await,
        ]
        .into_iter()
        .collect();

        let mut permits = permits.into_iter();
        // 4 -> 2: two in flight above the new window.
        throttler.release(permits.next().expect("permit"), Outcome::Overload);
        assert_eq!(throttler.window(), 2);
        assert_eq!(throttler.inflight(), 3);
        let blocked = tokio::time::timeout(Duration::from_millis(50), throttler.acquire()).await;
        assert!(blocked.is_err(), "no admission while inflight exceeds window");
        for permit in permits {
            throttler.release(permit, fast_success());
        }
        let _ = tokio::time::timeout(Duration::from_secs(1), throttler.acquire())
            .await
            .expect("admission resumes once drained below the window");
    }
}
