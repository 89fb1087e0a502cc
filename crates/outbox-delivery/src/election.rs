//! Leader election over a shared lock.
//!
//! Every instance polls [`LockBackend::try_acquire`] on a fixed interval.
//! The holder becomes leader: it starts an [`ActiveDispatcher`], subscribes
//! to wake signals and runs one cycle straight away. Losing the lock, or any
//! error in the poll loop, demotes the instance back to follower. Errors
//! also release the lock and restart the loop after a short pause, so a
//! crashed loop never leaves the lock held by an instance that is not
//! delivering.

use std::{future::Future, pin::Pin, sync::Arc};

use outbox_core::Clock;
use serde::Serialize;
use sqlx::{pool::PoolConnection, PgPool, Postgres};
use tokio::{
    sync::{watch, Mutex, RwLock},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    config::DeliveryConfig,
    dispatcher::{ActiveDispatcher, Dispatcher},
    error::{DeliveryError, Result},
    executor::Executor,
    notify::{WakeChannel, WakeSubscription},
};

/// Boxed future returned by lock operations.
pub type LockFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Exclusive, session-scoped lock shared by all instances.
pub trait LockBackend: Send + Sync + 'static {
    /// Attempts to take the lock without blocking.
    ///
    /// Returns `Ok(true)` while this backend holds the lock, including on
    /// repeated calls, and `Ok(false)` when another holder has it.
    fn try_acquire(&self, lock_id: i64) -> LockFuture<'_, bool>;

    /// Releases the lock if held.
    fn release(&self, lock_id: i64) -> LockFuture<'_, ()>;
}

/// Session-level PostgreSQL advisory lock.
///
/// The lock lives on one dedicated pooled connection. While it is held, a
/// poll only checks that the session is still alive, since the lock ends
/// with the session. A failed connection is closed rather than returned to
/// the pool.
pub struct PostgresAdvisoryLock {
    pool: PgPool,
    session: Mutex<LockSession>,
}

#[derive(Default)]
struct LockSession {
    connection: Option<PoolConnection<Postgres>>,
    held: bool,
}

impl PostgresAdvisoryLock {
    /// Creates a lock backend on `pool`.
    pub fn new(pool: PgPool) -> Self {
        Self { pool, session: Mutex::new(LockSession::default()) }
    }
}

impl LockSession {
    async fn discard(&mut self) {
        self.held = false;
        if let Some(connection) = self.connection.take() {
            if let Err(e) = connection.close().await {
                debug!(error = %e, "failed to close lock connection");
            }
        }
    }
}

impl LockBackend for PostgresAdvisoryLock {
    fn try_acquire(&self, lock_id: i64) -> LockFuture<'_, bool> {
        Box::pin(async move {
            let mut guard = self.session.lock().await;
            let session = &mut *guard;

            if session.connection.is_none() {
                let connection = self.pool.acquire().await.map_err(|e| {
                    DeliveryError::lock(format!("failed to acquire lock connection: {e}"))
                })?;
                session.connection = Some(connection);
            }
            let Some(connection) = session.connection.as_mut() else {
                return Err(DeliveryError::lock("lock connection missing"));
            };

            let query = if session.held {
                sqlx::query_scalar::<_, bool>("SELECT true").fetch_one(&mut **connection).await
            } else {
                sqlx::query_scalar::<_, bool>("SELECT pg_try_advisory_lock($1)")
                    .bind(lock_id)
                    .fetch_one(&mut **connection)
                    .await
            };

            match query {
                Ok(acquired) => {
                    session.held = acquired;
                    Ok(acquired)
                },
                Err(e) => {
                    session.discard().await;
                    Err(DeliveryError::lock(format!("advisory lock query failed: {e}")))
                },
            }
        })
    }

    fn release(&self, lock_id: i64) -> LockFuture<'_, ()> {
        Box::pin(async move {
            let mut guard = self.session.lock().await;
            let session = &mut *guard;
            if !session.held {
                return Ok(());
            }
            let Some(connection) = session.connection.as_mut() else {
                session.held = false;
                return Ok(());
            };

            let released = sqlx::query_scalar::<_, bool>("SELECT pg_advisory_unlock($1)")
                .bind(lock_id)
                .fetch_one(&mut **connection)
                .await;

            match released {
                Ok(_) => {
                    session.held = false;
                    debug!(lock_id, "advisory lock released");
                    Ok(())
                },
                // Closing the session releases the lock server-side.
                Err(e) => {
                    session.discard().await;
                    Err(DeliveryError::lock(format!("advisory unlock failed: {e}")))
                },
            }
        })
    }
}

/// In-process lock backends for tests and single-node runs.
pub mod memory {
    use std::{
        collections::HashMap,
        sync::atomic::{AtomicU64, Ordering},
    };

    use super::*;

    #[derive(Default)]
    struct Registry {
        holders: HashMap<i64, u64>,
        failures: usize,
    }

    /// Shared lock table. Every [`MemoryLock`] created from the same
    /// registry competes for the same locks.
    #[derive(Clone, Default)]
    pub struct MemoryLockRegistry {
        inner: Arc<std::sync::Mutex<Registry>>,
        next_owner: Arc<AtomicU64>,
    }

    impl MemoryLockRegistry {
        /// Creates an empty registry.
        pub fn new() -> Self {
            Self::default()
        }

        /// Creates a new contender.
        pub fn lock(&self) -> MemoryLock {
            let owner = self.next_owner.fetch_add(1, Ordering::SeqCst) + 1;
            MemoryLock { registry: self.clone(), owner }
        }

        /// Current holder of `lock_id`, if any.
        pub fn holder(&self, lock_id: i64) -> Option<u64> {
            self.registry().holders.get(&lock_id).copied()
        }

        /// Drops the lock regardless of holder, as a database would when the
        /// holding session dies.
        pub fn force_release(&self, lock_id: i64) {
            self.registry().holders.remove(&lock_id);
        }

        /// Makes the next `count` acquire attempts, from any contender, fail.
        pub fn fail_next_attempts(&self, count: usize) {
            self.registry().failures = count;
        }

        fn registry(&self) -> std::sync::MutexGuard<'_, Registry> {
            self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
        }
    }

    /// One contender for locks in a [`MemoryLockRegistry`].
    #[derive(Clone)]
    pub struct MemoryLock {
        registry: MemoryLockRegistry,
        owner: u64,
    }

    impl MemoryLock {
        /// Identifier reported by [`MemoryLockRegistry::holder`].
        pub fn owner(&self) -> u64 {
            self.owner
        }
    }

    impl LockBackend for MemoryLock {
        fn try_acquire(&self, lock_id: i64) -> LockFuture<'_, bool> {
            let result = {
                let mut registry = self.registry.registry();
                if registry.failures > 0 {
                    registry.failures -= 1;
                    Err(DeliveryError::lock("injected lock failure"))
                } else {
                    let holder = *registry.holders.entry(lock_id).or_insert(self.owner);
                    Ok(holder == self.owner)
                }
            };
            Box::pin(async move { result })
        }

        fn release(&self, lock_id: i64) -> LockFuture<'_, ()> {
            {
                let mut registry = self.registry.registry();
                if registry.holders.get(&lock_id) == Some(&self.owner) {
                    registry.holders.remove(&lock_id);
                }
            }
            Box::pin(async { Ok(()) })
        }
    }
}

/// Role of this instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Not holding the lock; schedules nothing.
    Follower,
    /// Holding the lock; delivers messages.
    Leader,
}

/// Runs the election loop and swaps the shared dispatcher on role changes.
pub struct LeaderElection {
    inner: Arc<ElectionInner>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

struct ElectionInner {
    lock: Arc<dyn LockBackend>,
    wake: Arc<dyn WakeChannel>,
    executor: Executor,
    clock: Arc<dyn Clock>,
    config: Arc<DeliveryConfig>,
    dispatcher: Arc<RwLock<Dispatcher>>,
    role: watch::Sender<Role>,
    listener: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
    cancellation_token: CancellationToken,
}

impl LeaderElection {
    /// Creates a follower. Call [`LeaderElection::start`] to begin polling.
    pub fn new(
        lock: Arc<dyn LockBackend>,
        wake: Arc<dyn WakeChannel>,
        executor: Executor,
        clock: Arc<dyn Clock>,
        config: Arc<DeliveryConfig>,
        dispatcher: Arc<RwLock<Dispatcher>>,
    ) -> Self {
        let (role, _) = watch::channel(Role::Follower);
        let inner = ElectionInner {
            lock,
            wake,
            executor,
            clock,
            config,
            dispatcher,
            role,
            listener: Mutex::new(None),
            cancellation_token: CancellationToken::new(),
        };
        Self { inner: Arc::new(inner), supervisor: Mutex::new(None) }
    }

    /// Spawns the election loop. Calling it twice has no effect.
    pub async fn start(&self) {
        let mut supervisor = self.supervisor.lock().await;
        if supervisor.is_some() || self.inner.cancellation_token.is_cancelled() {
            return;
        }
        let inner = self.inner.clone();
        *supervisor = Some(tokio::spawn(async move { inner.supervise().await }));
        info!(lock_id = self.inner.config.lock_id, "leader election started");
    }

    /// Stops polling, demotes and releases the lock.
    pub async fn stop(&self) {
        self.inner.cancellation_token.cancel();
        let supervisor = self.supervisor.lock().await.take();
        if let Some(handle) = supervisor {
            if let Err(e) = handle.await {
                error!(error = %e, "leader election task ended abnormally");
            }
        }
    }

    /// Current role.
    pub fn role(&self) -> Role {
        *self.inner.role.borrow()
    }

    /// Receiver notified on every role change.
    pub fn subscribe_role(&self) -> watch::Receiver<Role> {
        self.inner.role.subscribe()
    }
}

impl ElectionInner {
    async fn supervise(&self) {
        loop {
            match self.poll_loop().await {
                Ok(()) => break,
                Err(e) => {
                    error!(error = %e, "leader election loop failed, restarting");
                    self.demote().await;
                    self.release().await;
                },
            }

            tokio::select! {
                () = self.cancellation_token.cancelled() => break,
                () = self.clock.sleep(self.config.restart_delay) => {},
            }
        }

        self.demote().await;
        self.release().await;
        info!("leader election stopped");
    }

    async fn poll_loop(&self) -> Result<()> {
        loop {
            if self.cancellation_token.is_cancelled() {
                return Ok(());
            }

            let acquired = self.lock.try_acquire(self.config.lock_id).await?;
            let leading = *self.role.borrow() == Role::Leader;

            match (acquired, leading) {
                (true, false) => self.promote().await?,
                (true, true) => self.check_listener().await?,
                (false, true) => {
                    warn!(lock_id = self.config.lock_id, "leadership lock lost");
                    self.demote().await;
                },
                (false, false) => {},
            }

            tokio::select! {
                () = self.cancellation_token.cancelled() => return Ok(()),
                () = self.clock.sleep(self.config.poll_interval) => {},
            }
        }
    }

    async fn promote(&self) -> Result<()> {
        let subscription = self.wake.subscribe().await?;

        let dispatcher =
            Dispatcher::Active(ActiveDispatcher::start(self.executor.clone(), self.clock.clone()));
        *self.dispatcher.write().await = dispatcher.clone();

        let token = self.cancellation_token.child_token();
        let listener = tokio::spawn(listen(subscription, dispatcher.clone(), token.clone()));
        *self.listener.lock().await = Some((token, listener));

        self.role.send_replace(Role::Leader);
        info!(lock_id = self.config.lock_id, "promoted to leader");

        dispatcher.wake();
        Ok(())
    }

    async fn check_listener(&self) -> Result<()> {
        let listener = self.listener.lock().await;
        match listener.as_ref() {
            Some((_, handle)) if !handle.is_finished() => Ok(()),
            _ => Err(DeliveryError::channel("wake listener stopped")),
        }
    }

    async fn demote(&self) {
        let listener = self.listener.lock().await.take();
        if let Some((token, handle)) = listener {
            token.cancel();
            if let Err(e) = handle.await {
                debug!(error = %e, "wake listener ended abnormally");
            }
        }

        let previous = std::mem::take(&mut *self.dispatcher.write().await);
        previous.stop().await;

        if self.role.send_replace(Role::Follower) == Role::Leader {
            info!(lock_id = self.config.lock_id, "demoted to follower");
        }
    }

    async fn release(&self) {
        if let Err(e) = self.lock.release(self.config.lock_id).await {
            warn!(lock_id = self.config.lock_id, error = %e, "failed to release leadership lock");
        }
    }
}

async fn listen(
    mut subscription: Box<dyn WakeSubscription>,
    dispatcher: Dispatcher,
    cancellation_token: CancellationToken,
) {
    loop {
        tokio::select! {
            () = cancellation_token.cancelled() => break,
            received = subscription.recv() => match received {
                Ok(()) => dispatcher.wake(),
                Err(e) => {
                    warn!(error = %e, "wake subscription closed");
                    break;
                },
            },
        }
    }
}
