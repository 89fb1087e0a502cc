//! Cross-instance wake signal.
//!
//! Any instance publishes after inserting work; only the leader subscribes.
//! Signals carry no payload and may be coalesced or, after a reconnect,
//! spuriously repeated; receivers just run another cycle.

use std::{future::Future, pin::Pin};

use sqlx::{postgres::PgListener, PgPool};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::error::{DeliveryError, Result};

/// Boxed future returned by wake channel operations.
pub type WakeFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Publish/subscribe channel for "something changed, re-check due work".
pub trait WakeChannel: Send + Sync + 'static {
    /// Broadcasts a wake signal to every subscriber, on any instance.
    fn publish(&self) -> WakeFuture<'_, ()>;

    /// Opens a subscription that sees signals published from now on.
    fn subscribe(&self) -> WakeFuture<'_, Box<dyn WakeSubscription>>;
}

/// An open wake subscription.
pub trait WakeSubscription: Send {
    /// Waits for the next signal.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::ChannelError` once the subscription can no
    /// longer deliver signals.
    fn recv(&mut self) -> WakeFuture<'_, ()>;
}

/// Wake channel over PostgreSQL `LISTEN`/`NOTIFY`.
#[derive(Clone)]
pub struct PostgresWakeChannel {
    pool: PgPool,
    channel: String,
}

impl PostgresWakeChannel {
    /// Creates a channel with the given `NOTIFY` channel name.
    pub fn new(pool: PgPool, channel: impl Into<String>) -> Self {
        Self { pool, channel: channel.into() }
    }
}

impl WakeChannel for PostgresWakeChannel {
    fn publish(&self) -> WakeFuture<'_, ()> {
        Box::pin(async move {
            sqlx::query("SELECT pg_notify($1, '')")
                .bind(&self.channel)
                .execute(&self.pool)
                .await
                .map_err(|e| DeliveryError::channel(format!("NOTIFY failed: {e}")))?;
            Ok(())
        })
    }

    fn subscribe(&self) -> WakeFuture<'_, Box<dyn WakeSubscription>> {
        Box::pin(async move {
            let mut listener = PgListener::connect_with(&self.pool)
                .await
                .map_err(|e| DeliveryError::channel(format!("LISTEN connection failed: {e}")))?;
            listener
                .listen(&self.channel)
                .await
                .map_err(|e| DeliveryError::channel(format!("LISTEN failed: {e}")))?;
            debug!(channel = %self.channel, "listening for wake signals");

            Ok(Box::new(PostgresSubscription { listener }) as Box<dyn WakeSubscription>)
        })
    }
}

struct PostgresSubscription {
    listener: PgListener,
}

impl WakeSubscription for PostgresSubscription {
    fn recv(&mut self) -> WakeFuture<'_, ()> {
        Box::pin(async move {
            match self.listener.try_recv().await {
                Ok(Some(_)) => Ok(()),
                // Connection dropped and will reconnect on the next call;
                // anything sent meanwhile is lost, so report a wake.
                Ok(None) => {
                    warn!("wake listener connection lost, reconnecting");
                    Ok(())
                },
                Err(e) => Err(DeliveryError::channel(format!("wake listener failed: {e}"))),
            }
        })
    }
}

/// In-process wake channel over a tokio broadcast channel.
///
/// Clones share the channel, so two services built from clones of the same
/// channel behave like two instances on one database.
#[derive(Clone)]
pub struct MemoryWakeChannel {
    sender: broadcast::Sender<()>,
}

impl MemoryWakeChannel {
    /// Creates a channel.
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(64);
        Self { sender }
    }
}

impl Default for MemoryWakeChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl WakeChannel for MemoryWakeChannel {
    fn publish(&self) -> WakeFuture<'_, ()> {
        // No receivers just means no leader is listening right now.
        let _ = self.sender.send(());
        Box::pin(async { Ok(()) })
    }

    fn subscribe(&self) -> WakeFuture<'_, Box<dyn WakeSubscription>> {
        let receiver = self.sender.subscribe();
        Box::pin(async move {
            Ok(Box::new(MemorySubscription { receiver }) as Box<dyn WakeSubscription>)
        })
    }
}

struct MemorySubscription {
    receiver: broadcast::Receiver<()>,
}

impl WakeSubscription for MemorySubscription {
    fn recv(&mut self) -> WakeFuture<'_, ()> {
        Box::pin(async move {
            match self.receiver.recv().await {
                Ok(()) | Err(broadcast::error::RecvError::Lagged(_)) => Ok(()),
                Err(broadcast::error::RecvError::Closed) => {
                    Err(DeliveryError::channel("wake channel closed"))
                },
            }
        })
    }
}
