//! The fast keyed store: a shared, low-latency key/value and pub/sub service
//! reachable by every gateway instance.
//!
//! The gateway only ever talks to the [`FastStore`] trait. Every call is a
//! potential suspension point, and all cross-instance coordination (flush
//! locks, presence, buffered messages) goes through these operations.

pub mod memory;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};

pub use memory::MemoryFastStore;

#[derive(Debug, Error)]
pub enum FastStoreError {
    #[error("value at {0} has the wrong type for this operation")]
    WrongType(String),

    #[error("fast store unavailable: {0}")]
    Unavailable(String),
}

pub type FastResult<T> = Result<T, FastStoreError>;

#[async_trait]
pub trait FastStore: Send + Sync {
    async fn get(&self, key: &str) -> FastResult<Option<String>>;

    /// `SET key value EX ttl`.
    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> FastResult<()>;

    /// `SET key value EX ttl NX`. Returns `true` only for the caller that
    /// created the key; atomic across all clients of the store.
    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> FastResult<bool>;

    async fn exists(&self, key: &str) -> FastResult<bool>;

    async fn del(&self, key: &str) -> FastResult<bool>;

    /// Delete `key` only while it still holds `expected`, atomically.
    async fn del_if_eq(&self, key: &str, expected: &str) -> FastResult<bool>;

    async fn expire(&self, key: &str, ttl: Duration) -> FastResult<bool>;

    /// Append to the tail of a list. Returns the list length afterwards.
    async fn rpush(&self, key: &str, values: Vec<String>) -> FastResult<usize>;

    /// Inclusive range with negative indexes counting from the tail.
    async fn lrange(&self, key: &str, start: isize, stop: isize) -> FastResult<Vec<String>>;

    async fn llen(&self, key: &str) -> FastResult<usize>;

    /// Keep only the inclusive range; an empty result removes the key.
    async fn ltrim(&self, key: &str, start: isize, stop: isize) -> FastResult<()>;

    /// `ltrim`, applied only while `guard` still holds `expected`, atomically
    /// (a script on a Redis-backed store). Returns whether the trim ran.
    async fn ltrim_if_eq(&self, key: &str, start: isize, stop: isize, guard: &str, expected: &str)
    -> FastResult<bool>;

    async fn sadd(&self, key: &str, member: &str) -> FastResult<bool>;

    async fn srem(&self, key: &str, member: &str) -> FastResult<bool>;

    async fn smembers(&self, key: &str) -> FastResult<Vec<String>>;

    /// Deliver to every current subscriber of `channel`. Returns how many
    /// subscribers received it; nothing is queued for absent ones.
    async fn publish(&self, channel: &str, payload: String) -> FastResult<usize>;

    async fn subscribe(&self, channel: &str) -> FastResult<ChannelSubscription>;

    /// Keyspace-expiry notifications: the name of every key that expired.
    fn expired_keys(&self) -> broadcast::Receiver<String>;
}

/// A live pub/sub subscription. Dropping it unsubscribes.
pub struct ChannelSubscription {
    channel: String,
    receiver: mpsc::UnboundedReceiver<String>,
    on_drop: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl ChannelSubscription {
    pub fn new(
        channel: impl Into<String>,
        receiver: mpsc::UnboundedReceiver<String>,
        on_drop: impl FnOnce() + Send + Sync + 'static,
    ) -> Self {
        Self {
            channel: channel.into(),
            receiver,
            on_drop: Some(Box::new(on_drop)),
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Next published payload, or `None` once the store side is gone.
    pub async fn recv(&mut self) -> Option<String> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<String> {
        self.receiver.try_recv().ok()
    }

    pub fn unsubscribe(self) {
        drop(self);
    }
}

impl Drop for ChannelSubscription {
    fn drop(&mut self) {
        if let Some(on_drop) = self.on_drop.take() {
            on_drop();
        }
    }
}

impl fmt::Debug for ChannelSubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelSubscription")
            .field("channel", &self.channel)
            .finish_non_exhaustive()
    }
}
