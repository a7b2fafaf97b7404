//! Bounded polling with an injectable clock.
//!
//! Waiting for the agent to finish writing its archives is a "check, sleep,
//! check again" loop. This module keeps that loop in one place so that the
//! interval, the ceiling and the stop condition are explicit and so tests can
//! drive time with [`ManualClock`] instead of sleeping.

use log::debug;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Source of elapsed time and sleeping.
pub trait Clock: Send + Sync {
    /// Monotonic time since an arbitrary origin.
    fn now(&self) -> Duration;
    fn sleep(&self, duration: Duration);
}

/// Wall clock backed by [`Instant`] and [`thread::sleep`].
#[derive(Debug)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }

    fn sleep(&self, duration: Duration) {
        thread::sleep(duration);
    }
}

/// Clock that only moves when slept on or advanced explicitly.
#[derive(Debug, Default)]
pub struct ManualClock {
    elapsed_ms: AtomicU64,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, duration: Duration) {
        self.elapsed_ms
            .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        Duration::from_millis(self.elapsed_ms.load(Ordering::SeqCst))
    }

    fn sleep(&self, duration: Duration) {
        self.advance(duration);
    }
}

/// Shared cancellation flag checked at step boundaries and poll iterations.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Interval and ceiling of a poll loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollConfig {
    pub interval: Duration,
    pub ceiling: Duration,
}

impl PollConfig {
    pub fn new(interval: Duration, ceiling: Duration) -> Self {
        Self { interval, ceiling }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// The predicate held after `attempts` checks.
    Satisfied { attempts: u32, elapsed: Duration },
    /// The ceiling passed without the predicate holding.
    TimedOut { attempts: u32, elapsed: Duration },
    Cancelled { attempts: u32, elapsed: Duration },
}

impl PollOutcome {
    pub fn is_satisfied(&self) -> bool {
        matches!(self, PollOutcome::Satisfied { .. })
    }

    pub fn elapsed(&self) -> Duration {
        match *self {
            PollOutcome::Satisfied { elapsed, .. }
            | PollOutcome::TimedOut { elapsed, .. }
            | PollOutcome::Cancelled { elapsed, .. } => elapsed,
        }
    }
}

/// Checks `predicate` immediately and then once per interval until it holds,
/// the ceiling is reached, or `cancel` fires.
///
/// The final sleep is shortened so the loop never runs past the ceiling.
pub fn poll_until<F>(
    config: &PollConfig,
    clock: &dyn Clock,
    cancel: &CancellationToken,
    mut predicate: F,
) -> PollOutcome
where
    F: FnMut() -> bool,
{
    let start = clock.now();
    let mut attempts = 0;

    loop {
        let elapsed = clock.now().saturating_sub(start);
        if cancel.is_cancelled() {
            debug!("Poll cancelled after {} attempts", attempts);
            return PollOutcome::Cancelled { attempts, elapsed };
        }

        attempts += 1;
        if predicate() {
            return PollOutcome::Satisfied { attempts, elapsed };
        }

        let elapsed = clock.now().saturating_sub(start);
        if elapsed >= config.ceiling {
            debug!(
                "Poll gave up after {} attempts ({:?})",
                attempts, elapsed
            );
            return PollOutcome::TimedOut { attempts, elapsed };
        }

        let remaining = config.ceiling - elapsed;
        clock.sleep(config.interval.min(remaining));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn config(interval_ms: u64, ceiling_ms: u64) -> PollConfig {
        PollConfig::new(
            Duration::from_millis(interval_ms),
            Duration::from_millis(ceiling_ms),
        )
    }

    #[test]
    fn test_satisfied_immediately() {
        let clock = ManualClock::new();
        let outcome = poll_until(&config(1000, 30_000), &clock, &CancellationToken::new(), || true);

        assert_eq!(
            outcome,
            PollOutcome::Satisfied {
                attempts: 1,
                elapsed: Duration::ZERO
            }
        );
    }

    #[test]
    fn test_satisfied_after_some_polls() {
        let clock = ManualClock::new();
        let calls = Cell::new(0);

        let outcome = poll_until(&config(1000, 30_000), &clock, &CancellationToken::new(), || {
            calls.set(calls.get() + 1);
            calls.get() == 4
        });

        assert_eq!(
            outcome,
            PollOutcome::Satisfied {
                attempts: 4,
                elapsed: Duration::from_secs(3)
            }
        );
    }

    #[test]
    fn test_times_out_at_ceiling() {
        let clock = ManualClock::new();
        let outcome = poll_until(&config(1000, 15_000), &clock, &CancellationToken::new(), || false);

        match outcome {
            PollOutcome::TimedOut { attempts, elapsed } => {
                assert_eq!(elapsed, Duration::from_secs(15));
                assert_eq!(attempts, 16);
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[test]
    fn test_last_sleep_is_clamped_to_ceiling() {
        let clock = ManualClock::new();
        let outcome = poll_until(&config(4000, 10_000), &clock, &CancellationToken::new(), || false);

        assert_eq!(outcome.elapsed(), Duration::from_secs(10));
        assert_eq!(clock.now(), Duration::from_secs(10));
    }

    #[test]
    fn test_cancellation_stops_polling() {
        let clock = ManualClock::new();
        let cancel = CancellationToken::new();
        let calls = Cell::new(0);

        let outcome = poll_until(&config(1000, 30_000), &clock, &cancel, || {
            calls.set(calls.get() + 1);
            if calls.get() == 2 {
                cancel.cancel();
            }
            false
        });

        assert!(matches!(outcome, PollOutcome::Cancelled { attempts: 2, .. }));
        assert_eq!(calls.get(), 2);
    }

    #[test]
    fn test_cancellation_token_is_shared_between_clones() {
        let token = CancellationToken::new();
        let clone = token.clone();
        assert!(!token.is_cancelled());
        clone.cancel();
        assert!(token.is_cancelled());
    }
}
