//! The scheduler/executor pair owned by the current leader.
//!
//! A follower holds [`Dispatcher::Dormant`], on which every operation is a
//! no-op. A leader holds [`Dispatcher::Active`], which owns a [`Scheduler`]
//! and a driver task that runs one executor cycle per trigger. Timer fires
//! and wake signals share a single [`Notify`] permit, so cycles never overlap
//! and any number of triggers arriving mid-cycle collapse into one more
//! cycle.

use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use outbox_core::Clock;
use tokio::{sync::Notify, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::{executor::Executor, scheduler::Scheduler};

/// Running scheduler plus cycle driver.
pub struct ActiveDispatcher {
    scheduler: Arc<Scheduler>,
    trigger: Arc<Notify>,
    cancellation_token: CancellationToken,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl ActiveDispatcher {
    /// Spawns the driver task. Nothing runs until the first trigger.
    pub fn start(executor: Executor, clock: Arc<dyn Clock>) -> Arc<Self> {
        let trigger = Arc::new(Notify::new());
        let on_fire = {
            let trigger = trigger.clone();
            Arc::new(move || trigger.notify_one())
        };
        let scheduler = Arc::new(Scheduler::new(clock, on_fire));
        let cancellation_token = CancellationToken::new();

        let driver = tokio::spawn(drive(
            executor,
            scheduler.clone(),
            trigger.clone(),
            cancellation_token.clone(),
        ));

        Arc::new(Self { scheduler, trigger, cancellation_token, driver: Mutex::new(Some(driver)) })
    }

    /// Stops the driver after any in-flight cycle and disarms the timer.
    pub async fn stop(&self) {
        self.cancellation_token.cancel();
        let driver = self.driver.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(driver) = driver {
            if let Err(e) = driver.await {
                debug!(error = %e, "dispatcher driver ended abnormally");
            }
        }
        self.scheduler.disarm();
    }
}

async fn drive(
    executor: Executor,
    scheduler: Arc<Scheduler>,
    trigger: Arc<Notify>,
    cancellation_token: CancellationToken,
) {
    debug!("dispatcher driver started");

    loop {
        tokio::select! {
            biased;
            () = cancellation_token.cancelled() => break,
            () = trigger.notified() => {},
        }

        let report = executor.run_cycle().await;
        if cancellation_token.is_cancelled() {
            break;
        }
        if let Some(next) = report.next_wake {
            scheduler.arm(next);
        }
    }

    scheduler.disarm();
    info!("dispatcher driver stopped");
}

/// Scheduler/executor pair as seen by the rest of the instance.
#[derive(Clone, Default)]
pub enum Dispatcher {
    /// Follower: ignores every request.
    #[default]
    Dormant,
    /// Leader: drives deliveries.
    Active(Arc<ActiveDispatcher>),
}

impl Dispatcher {
    /// Arms the timer if `instant` is earlier than the current deadline.
    /// Returns whether the deadline moved; always `false` when dormant.
    pub fn arm(&self, instant: DateTime<Utc>) -> bool {
        match self {
            Self::Dormant => false,
            Self::Active(active) => active.scheduler.arm(instant),
        }
    }

    /// Requests a cycle as soon as the current one, if any, finishes.
    pub fn wake(&self) {
        if let Self::Active(active) = self {
            active.trigger.notify_one();
        }
    }

    /// Currently armed deadline.
    pub fn armed_at(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Dormant => None,
            Self::Active(active) => active.scheduler.armed_at(),
        }
    }

    /// Whether this is a leader's live pair.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active(_))
    }

    /// Stops an active pair; no-op when dormant.
    pub async fn stop(&self) {
        if let Self::Active(active) = self {
            active.stop().await;
        }
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Dormant => write!(f, "Dispatcher::Dormant"),
            Self::Active(active) => f
                .debug_struct("Dispatcher::Active")
                .field("armed_at", &active.scheduler.armed_at())
                .finish(),
        }
    }
}
