//! Time abstractions for testable timing operations.
//!
//! Every component that reads the time or waits for a deadline takes a
//! [`Clock`]. Production code uses [`RealClock`]; tests use [`TestClock`],
//! whose sleeps only complete when the test moves time forward.

use std::{future::Future, pin::Pin, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use tokio::sync::watch;

/// Boxed sleep future returned by [`Clock`] implementations.
pub type Sleep = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Clock abstraction for time operations.
///
/// Sleep futures are `'static` so they can be moved into spawned timer
/// tasks.
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Returns the current wall-clock time.
    fn now(&self) -> DateTime<Utc>;

    /// Sleeps for the specified duration.
    fn sleep(&self, duration: Duration) -> Sleep;

    /// Sleeps until `deadline`; returns immediately if it has passed.
    fn sleep_until(&self, deadline: DateTime<Utc>) -> Sleep {
        let remaining = (deadline - self.now()).to_std().unwrap_or(Duration::ZERO);
        self.sleep(remaining)
    }
}

/// Real clock implementation using system time and tokio timers.
#[derive(Debug, Clone, Copy, Default)]
pub struct RealClock;

impl RealClock {
    /// Creates a new real clock instance.
    pub fn new() -> Self {
        Self
    }
}

impl Clock for RealClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn sleep(&self, duration: Duration) -> Sleep {
        Box::pin(tokio::time::sleep(duration))
    }
}

/// Test clock for deterministic time control.
///
/// Time stands still until [`TestClock::advance`] or [`TestClock::jump_to`]
/// is called. Pending sleeps whose deadline has been reached then complete.
/// Clones share the same timeline.
#[derive(Debug, Clone)]
pub struct TestClock {
    now: Arc<watch::Sender<DateTime<Utc>>>,
}

impl TestClock {
    /// Creates a new test clock starting at the current time.
    pub fn new() -> Self {
        Self::with_start_time(Utc::now())
    }

    /// Creates a test clock starting at a specific time.
    pub fn with_start_time(start: DateTime<Utc>) -> Self {
        let (now, _) = watch::channel(start);
        Self { now: Arc::new(now) }
    }

    /// Moves time forward, waking every sleep that is now due.
    pub fn advance(&self, duration: Duration) {
        let step = chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX);
        self.now.send_modify(|now| {
            *now = now.checked_add_signed(step).unwrap_or(DateTime::<Utc>::MAX_UTC);
        });
    }

    /// Sets the clock to a specific time. Jumping backwards is allowed and
    /// simply delays pending sleeps.
    pub fn jump_to(&self, time: DateTime<Utc>) {
        self.now.send_replace(time);
    }
}

impl Default for TestClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TestClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.borrow()
    }

    fn sleep(&self, duration: Duration) -> Sleep {
        let step = chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX);
        let deadline = self.now().checked_add_signed(step).unwrap_or(DateTime::<Utc>::MAX_UTC);
        self.sleep_until(deadline)
    }

    fn sleep_until(&self, deadline: DateTime<Utc>) -> Sleep {
        let mut rx = self.now.subscribe();
        Box::pin(async move {
            // A closed channel means every clock handle is gone; nothing
            // can advance time any more, so stop waiting.
            let _ = rx.wait_for(|now| *now >= deadline).await;
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clock_advances() {
        let clock = TestClock::new();
        let start = clock.now();

        clock.advance(Duration::from_secs(10));

        assert_eq!(clock.now() - start, chrono::Duration::seconds(10));
    }

    #[test]
    fn test_clock_jump() {
        let clock = TestClock::new();
        let target = DateTime::<Utc>::from_timestamp(2000, 0).unwrap();

        clock.jump_to(target);
        assert_eq!(clock.now(), target);
    }

    #[tokio::test]
    async fn sleep_completes_only_after_advance() {
        let clock = TestClock::new();
        let sleeper = tokio::spawn(clock.sleep(Duration::from_secs(5)));

        tokio::task::yield_now().await;
        assert!(!sleeper.is_finished());

        clock.advance(Duration::from_secs(4));
        tokio::task::yield_now().await;
        assert!(!sleeper.is_finished());

        clock.advance(Duration::from_secs(1));
        tokio::time::timeout(Duration::from_secs(1), sleeper).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn sleep_until_past_deadline_is_immediate() {
        let clock = TestClock::new();
        let past = clock.now() - chrono::Duration::seconds(1);

        tokio::time::timeout(Duration::from_millis(100), clock.sleep_until(past)).await.unwrap();
    }

    #[tokio::test]
    async fn real_clock_sleeps() {
        let clock = RealClock::new();
        let start = std::time::Instant::now();

        clock.sleep(Duration::from_millis(10)).await;

        assert!(start.elapsed() >= Duration::from_millis(10));
    }
}
