//! Test infrastructure for deterministic outbox testing.
//!
//! [`TestEnv`] bundles a wiremock server standing in for callback targets, a
//! [`TestClock`], in-memory storage, an in-memory lock registry and an
//! in-memory wake channel. Every [`OutboxService`] built from one
//! environment shares all of them, so several services behave like several
//! instances pointed at the same database.

#![warn(missing_docs)]
#![forbid(unsafe_code)]

use std::{future::Future, sync::Arc, time::Duration};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use outbox_core::{Clock, Message, Queue};
use outbox_delivery::{
    storage::{mock::MockDeliveryStorage, DeliveryStorage},
    BackoffPolicy, ClientConfig, DeliveryClient, DeliveryConfig, Executor, MemoryLockRegistry,
    MemoryWakeChannel, OutboxService, Role,
};
use wiremock::MockServer;

pub mod fixtures;

pub use fixtures::{MessageBuilder, QueueBuilder};
pub use outbox_core::TestClock;

/// Default upper bound for [`eventually`].
pub const DEFAULT_WAIT: Duration = Duration::from_secs(5);

/// Builder for configuring a [`TestEnv`].
#[derive(Debug, Clone)]
pub struct TestEnvBuilder {
    config: DeliveryConfig,
}

impl Default for TestEnvBuilder {
    fn default() -> Self {
        let config = DeliveryConfig {
            poll_interval: Duration::from_secs(1),
            backoff: BackoffPolicy::new(Duration::from_millis(100)),
            client_config: ClientConfig {
                timeout: Duration::from_secs(2),
                ..ClientConfig::default()
            },
            cycle_error_delay: Duration::from_secs(1),
            restart_delay: Duration::from_millis(100),
            ..DeliveryConfig::default()
        };
        Self { config }
    }
}

impl TestEnvBuilder {
    /// Creates a builder with fast test defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the batch size (default: 10).
    #[must_use]
    pub fn batch_size(mut self, size: usize) -> Self {
        self.config.batch_size = size;
        self
    }

    /// Sets the election poll interval (default: 1s of test time).
    #[must_use]
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.config.poll_interval = interval;
        self
    }

    /// Sets the backoff base delay (default: 100ms).
    #[must_use]
    pub fn base_delay(mut self, delay: Duration) -> Self {
        self.config.backoff = BackoffPolicy::new(delay);
        self
    }

    /// Sets the per-request timeout (default: 2s, real time).
    #[must_use]
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.config.client_config.timeout = timeout;
        self
    }

    /// Sets the dead-letter hop limit (default: 3).
    #[must_use]
    pub fn max_dead_letter_hops(mut self, hops: i32) -> Self {
        self.config.max_dead_letter_hops = hops;
        self
    }

    /// Starts the mock server and builds the environment.
    pub async fn build(self) -> TestEnv {
        TestEnv {
            http_mock: MockServer::start().await,
            clock: TestClock::new(),
            storage: MockDeliveryStorage::new(),
            locks: MemoryLockRegistry::new(),
            wake: MemoryWakeChannel::new(),
            config: self.config,
        }
    }
}

/// Shared test environment.
pub struct TestEnv {
    /// Stand-in for callback targets.
    pub http_mock: MockServer,
    /// Deterministic clock; time only moves when advanced.
    pub clock: TestClock,
    /// In-memory storage shared by every service built here.
    pub storage: MockDeliveryStorage,
    /// Lock table shared by every service built here.
    pub locks: MemoryLockRegistry,
    /// Wake channel shared by every service built here.
    pub wake: MemoryWakeChannel,
    config: DeliveryConfig,
}

impl TestEnv {
    /// Environment with default settings.
    pub async fn new() -> Self {
        TestEnvBuilder::new().build().await
    }

    /// Builder for custom settings.
    pub fn builder() -> TestEnvBuilder {
        TestEnvBuilder::new()
    }

    /// Delivery settings used by services built here.
    pub fn config(&self) -> &DeliveryConfig {
        &self.config
    }

    /// URL on the mock server for `path`.
    pub fn callback_url(&self, path: &str) -> String {
        format!("{}{}", self.http_mock.uri(), path)
    }

    /// A new instance sharing storage, locks and wake channel. Not started.
    pub fn service(&self) -> Result<OutboxService> {
        OutboxService::new(
            Arc::new(self.storage.clone()),
            Arc::new(self.locks.lock()),
            Arc::new(self.wake.clone()),
            Arc::new(self.clock.clone()),
            self.config.clone(),
        )
        .context("failed to build outbox service")
    }

    /// Starts a new instance and waits until it leads.
    pub async fn leader(&self) -> Result<OutboxService> {
        let service = self.service()?;
        service.start().await;
        wait_for_role(&service, Role::Leader).await?;
        Ok(service)
    }

    /// A bare executor for driving cycles by hand.
    pub fn executor(&self) -> Result<Executor> {
        let client = DeliveryClient::new(self.config.client_config.clone())
            .context("failed to build delivery client")?;
        Ok(Executor::new(
            Arc::new(self.storage.clone()),
            client,
            Arc::new(self.clock.clone()),
            Arc::new(self.config.clone()),
        ))
    }

    /// Current test time.
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Advances test time and lets woken tasks run.
    pub async fn advance(&self, duration: Duration) {
        self.clock.advance(duration);
        settle().await;
    }

    /// Inserts a queue directly into storage.
    pub async fn create_queue(&self, builder: QueueBuilder) -> Result<Queue> {
        let queue = builder.build(self.now());
        self.storage.create_queue(queue.clone()).await?;
        Ok(queue)
    }

    /// Inserts a message directly into storage, bypassing scheduling.
    pub async fn insert_message(&self, builder: MessageBuilder) -> Result<Message> {
        let message = builder.build(self.now());
        self.storage.insert_messages(vec![message.clone()]).await?;
        Ok(message)
    }

    /// Reloads a message.
    pub async fn message(&self, message: &Message) -> Result<Message> {
        self.storage
            .find_message(message.id)
            .await?
            .with_context(|| format!("message {} not found", message.id))
    }

    /// Number of requests the mock server has seen.
    pub async fn request_count(&self) -> usize {
        self.http_mock.received_requests().await.map_or(0, |requests| requests.len())
    }
}

/// Yields repeatedly so spawned tasks can observe state changes.
pub async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}

/// Polls `check` in real time until it holds or [`DEFAULT_WAIT`] elapses.
pub async fn eventually<F, Fut>(description: &str, mut check: F) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + DEFAULT_WAIT;
    loop {
        if check().await {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            bail!("timed out waiting for {description}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Waits until `service` reports `role`.
pub async fn wait_for_role(service: &OutboxService, role: Role) -> Result<()> {
    let mut receiver = service.subscribe_role();
    tokio::time::timeout(DEFAULT_WAIT, receiver.wait_for(|current| *current == role))
        .await
        .with_context(|| format!("timed out waiting for role {role:?}"))?
        .context("role channel closed")?;
    Ok(())
}

/// Installs a test-writer tracing subscriber once per process.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}
