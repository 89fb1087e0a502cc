//! Single-deadline timer for the next due message.
//!
//! The scheduler holds at most one armed deadline. Arming with an earlier
//! instant replaces the pending timer; arming with the same or a later
//! instant is ignored, because the earlier fire will re-query the store and
//! re-arm with whatever is actually due next. When the deadline is reached
//! the armed state is cleared and the fire callback runs exactly once.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use outbox_core::Clock;
use tokio::task::JoinHandle;
use tracing::trace;

/// Callback invoked when an armed deadline is reached.
pub type FireCallback = Arc<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct TimerState {
    armed_at: Option<DateTime<Utc>>,
    generation: u64,
    timer: Option<JoinHandle<()>>,
}

/// Timer tracking the earliest pending due time.
pub struct Scheduler {
    clock: Arc<dyn Clock>,
    on_fire: FireCallback,
    state: Arc<Mutex<TimerState>>,
}

impl Scheduler {
    /// Creates a disarmed scheduler.
    pub fn new(clock: Arc<dyn Clock>, on_fire: FireCallback) -> Self {
        Self { clock, on_fire, state: Arc::new(Mutex::new(TimerState::default())) }
    }

    /// Arms the timer for `instant` unless an earlier or equal deadline is
    /// already armed. A deadline in the past fires immediately.
    ///
    /// Returns whether the armed deadline changed. Must be called from
    /// within a tokio runtime.
    pub fn arm(&self, instant: DateTime<Utc>) -> bool {
        let mut state = self.lock();
        if state.armed_at.is_some_and(|current| instant >= current) {
            return false;
        }

        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
        state.generation = state.generation.wrapping_add(1);
        state.armed_at = Some(instant);

        let generation = state.generation;
        let sleep = self.clock.sleep_until(instant);
        let shared = Arc::clone(&self.state);
        let on_fire = Arc::clone(&self.on_fire);
        state.timer = Some(tokio::spawn(async move {
            sleep.await;
            {
                let mut state = shared.lock().unwrap_or_else(PoisonError::into_inner);
                if state.generation != generation {
                    return;
                }
                state.armed_at = None;
                state.timer = None;
            }
            on_fire();
        }));

        trace!(armed_at = %instant, "scheduler armed");
        true
    }

    /// Cancels any pending deadline.
    pub fn disarm(&self) {
        let mut state = self.lock();
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
        state.armed_at = None;
        state.generation = state.generation.wrapping_add(1);
    }

    /// Currently armed deadline.
    pub fn armed_at(&self) -> Option<DateTime<Utc>> {
        self.lock().armed_at
    }

    fn lock(&self) -> MutexGuard<'_, TimerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.disarm();
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler").field("armed_at", &self.armed_at()).finish()
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    use outbox_core::TestClock;

    use super::*;

    fn counting_scheduler(clock: &TestClock) -> (Scheduler, Arc<AtomicUsize>) {
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        let scheduler = Scheduler::new(
            Arc::new(clock.clone()),
            Arc::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        (scheduler, fired)
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn fires_once_at_deadline() {
        let clock = TestClock::new();
        let (scheduler, fired) = counting_scheduler(&clock);

        assert!(scheduler.arm(clock.now() + chrono::Duration::seconds(5)));
        settle().await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        clock.advance(Duration::from_secs(5));
        settle().await;

        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(scheduler.armed_at(), None);

        clock.advance(Duration::from_secs(60));
        settle().await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn earlier_deadline_replaces_later() {
        let clock = TestClock::new();
        let (scheduler, fired) = counting_scheduler(&clock);
        let later = clock.now() + chrono::Duration::seconds(10);
        let earlier = clock.now() + chrono::Duration::seconds(2);

        assert!(scheduler.arm(later));
        assert!(scheduler.arm(earlier));
        assert_eq!(scheduler.armed_at(), Some(earlier));

        clock.advance(Duration::from_secs(2));
        settle().await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        clock.advance(Duration::from_secs(10));
        settle().await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn later_deadline_is_ignored() {
        let clock = TestClock::new();
        let (scheduler, _) = counting_scheduler(&clock);
        let earlier = clock.now() + chrono::Duration::seconds(2);

        assert!(scheduler.arm(earlier));
        assert!(!scheduler.arm(earlier + chrono::Duration::seconds(1)));
        assert!(!scheduler.arm(earlier));
        assert_eq!(scheduler.armed_at(), Some(earlier));
    }

    #[tokio::test]
    async fn past_deadline_fires_immediately() {
        let clock = TestClock::new();
        let (scheduler, fired) = counting_scheduler(&clock);

        scheduler.arm(clock.now() - chrono::Duration::seconds(1));
        settle().await;

        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn disarm_cancels_pending_fire() {
        let clock = TestClock::new();
        let (scheduler, fired) = counting_scheduler(&clock);

        scheduler.arm(clock.now() + chrono::Duration::seconds(1));
        scheduler.disarm();
        clock.advance(Duration::from_secs(2));
        settle().await;

        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert_eq!(scheduler.armed_at(), None);
    }

    #[tokio::test]
    async fn can_rearm_after_fire() {
        let clock = TestClock::new();
        let (scheduler, fired) = counting_scheduler(&clock);

        scheduler.arm(clock.now() + chrono::Duration::seconds(1));
        clock.advance(Duration::from_secs(1));
        settle().await;

        assert!(scheduler.arm(clock.now() + chrono::Duration::seconds(1)));
        clock.advance(Duration::from_secs(1));
        settle().await;

        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }
}
