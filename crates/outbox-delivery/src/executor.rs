//! One delivery cycle: fetch due messages, deliver, persist, report.
//!
//! Every message in a batch is processed on its own task and the cycle waits
//! for all of them to settle. A message's outcome, its dead-letter copy and
//! its cron successor are committed together in one transaction, so a crash
//! or a failed commit leaves the message pending and it is delivered again by
//! a later cycle. Receivers should deduplicate on `x-outbox-message-id`.

use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use outbox_core::{
    models::{
        CronId, DueMessage, Headers, Message, MessageTransition, MessageUpdate, NewMessage,
        QueueId,
    },
    Clock,
};
use serde::{Deserialize, Serialize};
use tokio::{sync::RwLock, task::JoinSet};
use tracing::{debug, error, info, warn};

use crate::{
    backoff::{max_retries_from_stored, Backoff},
    client::{DeliveryClient, DeliveryOutcome, DeliveryRequest},
    config::DeliveryConfig,
    cron::CronSchedule,
    error::{DeliveryError, ErrorCategory},
    storage::DeliveryStorage,
};

/// Content type applied when neither queue nor message sets one.
const DEFAULT_CONTENT_TYPE: &str = "application/json";

/// Cumulative counters since startup, exposed on the health endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryStats {
    /// Cycles run.
    pub cycles: u64,
    /// Messages delivered.
    pub delivered: u64,
    /// Failed attempts rescheduled.
    pub retried: u64,
    /// Messages that exhausted their retries.
    pub exhausted: u64,
    /// Dead-letter copies created.
    pub dead_lettered: u64,
    /// Dead-letter forwards skipped because the hop limit was reached.
    pub dead_letter_skipped: u64,
    /// Cron successors created.
    pub cron_successors: u64,
    /// Cron chains that could not be continued.
    pub cron_failures: u64,
    /// Storage errors, each leaving its message for a later cycle.
    pub storage_errors: u64,
    /// When the last cycle finished.
    pub last_cycle_at: Option<DateTime<Utc>>,
}

/// Result of one cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Messages fetched.
    pub claimed: usize,
    /// Messages delivered.
    pub delivered: usize,
    /// Failed attempts rescheduled.
    pub retried: usize,
    /// Messages that exhausted their retries.
    pub exhausted: usize,
    /// Dead-letter copies created.
    pub dead_lettered: usize,
    /// Dead-letter forwards skipped by the hop limit.
    pub dead_letter_skipped: usize,
    /// Cron successors created.
    pub cron_successors: usize,
    /// Cron chains that could not be continued.
    pub cron_failures: usize,
    /// Storage errors.
    pub errors: usize,
    /// When the next cycle should run, if anything is pending.
    pub next_wake: Option<DateTime<Utc>>,
}

impl CycleReport {
    fn absorb(&mut self, message: MessageReport) {
        if message.commit_failed {
            self.errors += 1;
            return;
        }
        match message.update {
            Some(UpdateKind::Sent) => self.delivered += 1,
            Some(UpdateKind::Retry) => self.retried += 1,
            Some(UpdateKind::Failed) => self.exhausted += 1,
            None => {},
        }
        self.dead_lettered += usize::from(message.dead_lettered);
        self.dead_letter_skipped += usize::from(message.dead_letter_skipped);
        self.cron_successors += usize::from(message.cron_successor);
        self.cron_failures += usize::from(message.cron_failed);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UpdateKind {
    Sent,
    Retry,
    Failed,
}

#[derive(Debug, Default)]
struct MessageReport {
    update: Option<UpdateKind>,
    dead_lettered: bool,
    dead_letter_skipped: bool,
    cron_successor: bool,
    cron_failed: bool,
    commit_failed: bool,
}

impl MessageReport {
    fn commit_failed() -> Self {
        Self { commit_failed: true, ..Self::default() }
    }
}

/// Runs delivery cycles against a storage backend.
///
/// Cheap to clone; clones share storage, client and statistics.
#[derive(Clone)]
pub struct Executor {
    storage: Arc<dyn DeliveryStorage>,
    client: DeliveryClient,
    clock: Arc<dyn Clock>,
    config: Arc<DeliveryConfig>,
    stats: Arc<RwLock<DeliveryStats>>,
}

impl Executor {
    /// Creates an executor.
    pub fn new(
        storage: Arc<dyn DeliveryStorage>,
        client: DeliveryClient,
        clock: Arc<dyn Clock>,
        config: Arc<DeliveryConfig>,
    ) -> Self {
        let stats = Arc::new(RwLock::new(DeliveryStats::default()));
        Self { storage, client, clock, config, stats }
    }

    /// Returns cumulative statistics.
    pub async fn stats(&self) -> DeliveryStats {
        self.stats.read().await.clone()
    }

    /// Runs one cycle. Never fails; problems are logged and counted.
    pub async fn run_cycle(&self) -> CycleReport {
        let now = self.clock.now();
        let mut report = CycleReport::default();

        match self.storage.find_due_messages(now, self.config.batch_size).await {
            Ok(due) => {
                report.claimed = due.len();
                let mut tasks = JoinSet::new();
                for message in due {
                    let executor = self.clone();
                    tasks.spawn(async move { executor.process(message).await });
                }
                while let Some(joined) = tasks.join_next().await {
                    match joined {
                        Ok(message_report) => report.absorb(message_report),
                        Err(e) => {
                            error!(error = %e, "delivery task aborted");
                            report.errors += 1;
                        },
                    }
                }
            },
            Err(e) => {
                error!(error = %e, "failed to fetch due messages");
                report.errors += 1;
            },
        }

        report.next_wake = self.next_wake(report.errors > 0).await;
        self.record(&report).await;

        if report.claimed > 0 || report.errors > 0 {
            info!(
                claimed = report.claimed,
                delivered = report.delivered,
                retried = report.retried,
                exhausted = report.exhausted,
                dead_lettered = report.dead_lettered,
                cron_successors = report.cron_successors,
                cron_failures = report.cron_failures,
                errors = report.errors,
                next_wake = ?report.next_wake,
                "delivery cycle finished"
            );
        } else {
            debug!(next_wake = ?report.next_wake, "delivery cycle found nothing due");
        }

        report
    }

    async fn process(&self, due: DueMessage) -> MessageReport {
        let DueMessage {
            message,
            callback_url,
            method,
            queue_headers,
            max_retries,
            dead_letter_queue_id,
        } = due;

        let request = DeliveryRequest {
            message_id: message.id,
            url: callback_url,
            method,
            headers: merge_headers(&queue_headers, &message.headers),
            body: Bytes::from(message.body.clone().unwrap_or_default()),
            attempt_number: u32::try_from(message.retries).unwrap_or(0).saturating_add(1),
        };
        let outcome = self.client.deliver(request).await;
        let now = self.clock.now();

        let mut report = MessageReport::default();
        let (update, kind) = self.decide(&message, &outcome, max_retries, now);
        report.update = Some(kind);
        let mut transition = MessageTransition::new(message.id, update);

        if kind == UpdateKind::Failed {
            warn!(
                message_id = %message.id,
                queue_id = %message.queue_id,
                retries = message.retries,
                "message exhausted its retries"
            );
            if let Some(dlq) = dead_letter_queue_id {
                if message.dead_letter_hops < self.config.max_dead_letter_hops {
                    transition.insert(dead_letter_copy(&message, dlq, now));
                    report.dead_lettered = true;
                } else {
                    error!(
                        message_id = %message.id,
                        dead_letter_queue_id = %dlq,
                        hops = message.dead_letter_hops,
                        "dead-letter hop limit reached, message dropped from chain"
                    );
                    report.dead_letter_skipped = true;
                }
            }
        }

        if let Some(cron_id) = message.cron_id {
            match self.successor(cron_id, now).await {
                Ok(successor) => {
                    transition.insert(successor);
                    report.cron_successor = true;
                },
                Err(e @ DeliveryError::DatabaseError { .. }) => {
                    error!(
                        message_id = %message.id,
                        cron_id = %cron_id,
                        error = %e,
                        "cron lookup failed, outcome left for a later cycle"
                    );
                    return MessageReport::commit_failed();
                },
                Err(e) => {
                    error!(
                        message_id = %message.id,
                        cron_id = %cron_id,
                        error = %e,
                        "cron chain broken, no successor scheduled"
                    );
                    report.cron_failed = true;
                },
            }
        }

        if let Err(e) = self.storage.commit_transition(transition).await {
            error!(
                message_id = %message.id,
                error = %e,
                "failed to persist delivery outcome, message will be delivered again"
            );
            return MessageReport::commit_failed();
        }

        report
    }

    fn decide(
        &self,
        message: &Message,
        outcome: &DeliveryOutcome,
        max_retries: i32,
        now: DateTime<Utc>,
    ) -> (MessageUpdate, UpdateKind) {
        let error = match outcome {
            DeliveryOutcome::Delivered { status_code, duration } => {
                info!(
                    message_id = %message.id,
                    status = status_code,
                    duration_ms = duration.as_millis(),
                    "callback delivered"
                );
                return (MessageUpdate::Sent { sent_at: now }, UpdateKind::Sent);
            },
            DeliveryOutcome::Failed { error, .. } => error,
        };

        let retries = u32::try_from(message.retries).unwrap_or(0);
        match self.config.backoff.compute(retries, max_retries_from_stored(max_retries)) {
            Ok(Backoff::Retry { retries, wait_for }) => {
                let when = chrono::Duration::from_std(wait_for)
                    .ok()
                    .and_then(|delay| now.checked_add_signed(delay))
                    .unwrap_or(DateTime::<Utc>::MAX_UTC);
                info!(
                    message_id = %message.id,
                    category = %ErrorCategory::from(error),
                    error = %error,
                    retries,
                    next_attempt = %when,
                    "callback failed, retry scheduled"
                );
                let retries = i32::try_from(retries).unwrap_or(i32::MAX);
                (MessageUpdate::Retry { retries, when }, UpdateKind::Retry)
            },
            Ok(Backoff::Exhausted) => {
                info!(message_id = %message.id, error = %error, "callback failed on last attempt");
                (MessageUpdate::Failed { failed_at: now }, UpdateKind::Failed)
            },
            Err(e) => {
                error!(
                    message_id = %message.id,
                    queue_id = %message.queue_id,
                    max_retries,
                    error = %e,
                    "queue retry limit is invalid, treating message as exhausted"
                );
                (MessageUpdate::Failed { failed_at: now }, UpdateKind::Failed)
            },
        }
    }

    async fn successor(&self, cron_id: CronId, now: DateTime<Utc>) -> crate::Result<Message> {
        let cron = self
            .storage
            .find_cron(cron_id)
            .await?
            .ok_or_else(|| DeliveryError::not_found(format!("cron {cron_id} no longer exists")))?;
        let next = CronSchedule::parse(&cron.schedule)?.next_after(now)?;
        Ok(cron.spawn_message(next, now))
    }

    async fn next_wake(&self, had_errors: bool) -> Option<DateTime<Utc>> {
        let backoff_floor = || {
            chrono::Duration::from_std(self.config.cycle_error_delay)
                .ok()
                .and_then(|delay| self.clock.now().checked_add_signed(delay))
        };

        match self.storage.find_soonest_pending().await {
            Ok(Some(when)) if had_errors => backoff_floor().map(|floor| when.max(floor)),
            Ok(next) => next,
            Err(e) => {
                error!(error = %e, "failed to query next due message");
                backoff_floor()
            },
        }
    }

    async fn record(&self, report: &CycleReport) {
        let mut stats = self.stats.write().await;
        stats.cycles += 1;
        stats.delivered += report.delivered as u64;
        stats.retried += report.retried as u64;
        stats.exhausted += report.exhausted as u64;
        stats.dead_lettered += report.dead_lettered as u64;
        stats.dead_letter_skipped += report.dead_letter_skipped as u64;
        stats.cron_successors += report.cron_successors as u64;
        stats.cron_failures += report.cron_failures as u64;
        stats.storage_errors += report.errors as u64;
        stats.last_cycle_at = Some(self.clock.now());
    }
}

/// Overlays message headers on queue headers. Names are compared
/// case-insensitively and emitted in lowercase; the message wins.
pub fn merge_headers(queue: &Headers, message: &Headers) -> Headers {
    let mut merged = Headers::with_capacity(queue.len() + message.len() + 1);
    for (name, value) in queue.iter().chain(message.iter()) {
        merged.insert(name.to_ascii_lowercase(), value.clone());
    }
    merged.entry("content-type".to_string()).or_insert_with(|| DEFAULT_CONTENT_TYPE.to_string());
    merged
}

fn dead_letter_copy(
    message: &Message,
    dead_letter_queue_id: QueueId,
    now: DateTime<Utc>,
) -> Message {
    let mut copy = NewMessage::new(dead_letter_queue_id).due_at(now);
    copy.body = message.body.clone();
    copy.headers = message.headers.clone();
    copy.dead_letter_hops = message.dead_letter_hops.saturating_add(1);
    copy.into_message(now)
}
