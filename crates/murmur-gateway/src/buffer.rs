//! Write-behind buffer between the real-time path and the durable store.
//!
//! Accepted messages are pushed onto a list in the fast store at
//! `buffer:{tenantCode}:{conversationId}` and drained into the durable store
//! in batches. A drain is triggered either by size (the list reaches
//! `batch_size`) or by time: the first append of a window creates the marker
//! key `{bufferKey}:ttl` with a `flush_interval` expiry, and the expiry
//! listener turns the marker's expiry notification into a flush. Both
//! triggers can fire on any gateway instance, so every flush first takes the
//! lock `lock:{bufferKey}` with an atomic conditional set; whoever loses the
//! race simply returns [`FlushOutcome::Contended`].
//!
//! Persistence is at-least-once. Messages carry their id from the moment
//! they are accepted, which makes a repeated insert a counted duplicate
//! rather than a second copy.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use murmur_db::DurableStore;
use murmur_fast::FastStore;
use murmur_types::models::Message;

use crate::config::GatewayConfig;
use crate::error::{GatewayError, GatewayResult};

const TTL_SUFFIX: &str = ":ttl";
const SETTLE_POLL: Duration = Duration::from_millis(25);

pub fn buffer_key(tenant_code: &str, conversation_id: Uuid) -> String {
    format!("buffer:{}:{}", tenant_code, conversation_id)
}

fn ttl_key(buffer_key: &str) -> String {
    format!("{}{}", buffer_key, TTL_SUFFIX)
}

fn lock_key(buffer_key: &str) -> String {
    format!("lock:{}", buffer_key)
}

/// The buffer a `:ttl` marker belongs to, if `expired_key` is one.
pub fn buffer_key_for_expired(expired_key: &str) -> Option<&str> {
    expired_key
        .strip_suffix(TTL_SUFFIX)
        .filter(|key| key.starts_with("buffer:"))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Another flush holds the lock for this buffer. Not an error.
    Contended,
    Empty,
    Flushed {
        written: usize,
        duplicates: usize,
        failed: usize,
    },
}

#[derive(Clone)]
pub struct MessageBuffer {
    fast: Arc<dyn FastStore>,
    durable: Arc<dyn DurableStore>,
    flush_interval: Duration,
    batch_size: usize,
    lock_ttl: Duration,
}

impl MessageBuffer {
    pub fn new(fast: Arc<dyn FastStore>, durable: Arc<dyn DurableStore>, config: &GatewayConfig) -> Self {
        Self {
            fast,
            durable,
            flush_interval: config.flush_interval,
            batch_size: config.batch_size.max(1),
            lock_ttl: config.flush_lock_ttl,
        }
    }

    /// Buffer `message` and return the buffer length after the push. A flush
    /// started by the size trigger runs before this returns; its failure is
    /// logged, the message stays buffered.
    pub async fn append(&self, buffer_key: &str, message: &Message) -> GatewayResult<usize> {
        let payload = serde_json::to_string(message)?;
        let len = self.fast.rpush(buffer_key, vec![payload]).await?;

        if self
            .fast
            .set_nx_ex(&ttl_key(buffer_key), "1", self.flush_interval)
            .await?
        {
            trace!("Armed flush timer for {}", buffer_key);
        }

        if len >= self.batch_size {
            debug!("{} reached {} messages, flushing", buffer_key, len);
            if let Err(e) = self.flush(buffer_key).await {
                warn!("Size-triggered flush of {} failed: {}", buffer_key, e);
            }
        }

        Ok(len)
    }

    /// Drain the buffer into the durable store under the flush lock.
    pub async fn flush(&self, buffer_key: &str) -> GatewayResult<FlushOutcome> {
        let lock = lock_key(buffer_key);
        let token = Uuid::new_v4().to_string();

        if !self.fast.set_nx_ex(&lock, &token, self.lock_ttl).await? {
            trace!("Flush of {} already in progress", buffer_key);
            return Ok(FlushOutcome::Contended);
        }

        let result = self.drain(buffer_key, &lock, &token).await;

        match self.fast.del_if_eq(&lock, &token).await {
            Ok(true) => {}
            Ok(false) => warn!("Flush lock for {} expired before it was released", buffer_key),
            Err(e) => warn!("Could not release flush lock for {}: {}", buffer_key, e),
        }

        result
    }

    async fn drain(&self, buffer_key: &str, lock: &str, token: &str) -> GatewayResult<FlushOutcome> {
        let timer = ttl_key(buffer_key);
        let entries = self.fast.lrange(buffer_key, 0, -1).await?;
        if entries.is_empty() {
            self.reset_timer(buffer_key).await?;
            return Ok(FlushOutcome::Empty);
        }

        let drained = entries.len();
        let messages = decode_entries(buffer_key, entries);

        let report = if messages.is_empty() {
            Default::default()
        } else {
            match self.durable.insert_messages(messages).await {
                Ok(report) => report,
                Err(e) => {
                    // Leave the buffer as it is and make sure the time trigger
                    // fires again even if no new message arrives.
                    if let Err(e) = self.fast.set_ex(&timer, "1", self.flush_interval).await {
                        warn!("Could not re-arm flush timer for {}: {}", buffer_key, e);
                    }
                    return Err(GatewayError::PersistenceDegraded(format!(
                        "{} messages from {} not written: {:#}",
                        drained, buffer_key, e
                    )));
                }
            }
        };

        // Only the prefix that was read, and only while the lock is still
        // ours: once it has lapsed another flush owns the list.
        let trimmed = self
            .fast
            .ltrim_if_eq(buffer_key, drained as isize, -1, lock, token)
            .await?;
        if !trimmed {
            warn!(
                "Flush lock for {} lapsed during the insert; leaving {} entries to the next flush",
                buffer_key, drained
            );
        }
        self.reset_timer(buffer_key).await?;

        if report.failed > 0 {
            warn!(
                "Flushed {}: {} written, {} duplicates, {} failed",
                buffer_key, report.written, report.duplicates, report.failed
            );
        } else {
            debug!(
                "Flushed {}: {} written, {} duplicates",
                buffer_key, report.written, report.duplicates
            );
        }

        Ok(FlushOutcome::Flushed {
            written: report.written,
            duplicates: report.duplicates,
            failed: report.failed,
        })
    }

    /// Drop the `:ttl` marker, then arm a fresh one if anything is still
    /// buffered. An append that raced the delete either armed its own marker
    /// or is seen by the length check.
    async fn reset_timer(&self, buffer_key: &str) -> GatewayResult<()> {
        let timer = ttl_key(buffer_key);
        self.fast.del(&timer).await?;
        if self.fast.llen(buffer_key).await? > 0
            && self.fast.set_nx_ex(&timer, "1", self.flush_interval).await?
        {
            trace!("Re-armed flush timer for {}", buffer_key);
        }
        Ok(())
    }

    /// Make sure everything buffered before this call is in the durable
    /// store, waiting out a flush that is running elsewhere.
    pub async fn settle(&self, buffer_key: &str) -> GatewayResult<()> {
        for _ in 0..2 {
            match self.flush(buffer_key).await? {
                FlushOutcome::Contended => self.wait_for_lock(buffer_key).await?,
                _ => return Ok(()),
            }
        }
        Ok(())
    }

    async fn wait_for_lock(&self, buffer_key: &str) -> GatewayResult<()> {
        let lock = lock_key(buffer_key);
        let deadline = Instant::now() + self.lock_ttl;
        while self.fast.exists(&lock).await? {
            if Instant::now() >= deadline {
                warn!("Gave up waiting for flush lock on {}", buffer_key);
                break;
            }
            tokio::time::sleep(SETTLE_POLL).await;
        }
        Ok(())
    }

    /// Messages accepted but not yet flushed, oldest first.
    pub async fn pending(&self, buffer_key: &str) -> GatewayResult<Vec<Message>> {
        let entries = self.fast.lrange(buffer_key, 0, -1).await?;
        Ok(decode_entries(buffer_key, entries))
    }

    /// Listen for expired `:ttl` markers and flush the matching buffer. Each
    /// flush runs in its own task so a slow insert does not hold back others.
    pub fn spawn_expiry_listener(&self) -> JoinHandle<()> {
        let mut expired = self.fast.expired_keys();
        let buffer = self.clone();

        tokio::spawn(async move {
            info!("Buffer expiry listener started");
            loop {
                match expired.recv().await {
                    Ok(key) => {
                        let Some(target) = buffer_key_for_expired(&key) else {
                            continue;
                        };
                        let target = target.to_string();
                        let buffer = buffer.clone();
                        tokio::spawn(async move {
                            match buffer.flush(&target).await {
                                Ok(outcome) => trace!("Timed flush of {}: {:?}", target, outcome),
                                Err(e) => warn!("Timed flush of {} failed: {}", target, e),
                            }
                        });
                    }
                    Err(RecvError::Lagged(n)) => {
                        warn!("Expiry listener lagged, {} notifications lost", n);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            info!("Buffer expiry listener stopped");
        })
    }
}

fn decode_entries(buffer_key: &str, entries: Vec<String>) -> Vec<Message> {
    entries
        .into_iter()
        .filter_map(|raw| match serde_json::from_str::<Message>(&raw) {
            Ok(message) => Some(message),
            Err(e) => {
                warn!("Dropping undecodable entry in {}: {}", buffer_key, e);
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{Fixture, RacingAppend, SlowInserts};

    #[test]
    fn expired_marker_maps_back_to_buffer() {
        let key = buffer_key("acme", Uuid::nil());
        assert_eq!(buffer_key_for_expired(&ttl_key(&key)), Some(key.as_str()));
        assert_eq!(buffer_key_for_expired("acme:connection:1:online"), None);
        assert_eq!(buffer_key_for_expired(&key), None);
    }

    #[tokio::test]
    async fn append_arms_timer_once() {
        let fx = Fixture::new().await;
        let conversation = fx.conversation(&[1, 2]).await;
        let key = buffer_key("acme", conversation);

        assert_eq!(fx.gateway.buffer.append(&key, &fx.message(conversation, 1)).await.unwrap(), 1);
        assert_eq!(fx.gateway.buffer.append(&key, &fx.message(conversation, 1)).await.unwrap(), 2);
        assert!(fx.fast.exists(&ttl_key(&key)).await.unwrap());
        assert_eq!(fx.gateway.buffer.pending(&key).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn flush_moves_messages_and_clears_keys() {
        let fx = Fixture::new().await;
        let conversation = fx.conversation(&[1, 2]).await;
        let key = buffer_key("acme", conversation);
        for _ in 0..3 {
            fx.gateway.buffer.append(&key, &fx.message(conversation, 1)).await.unwrap();
        }

        let outcome = fx.gateway.buffer.flush(&key).await.unwrap();
        assert_eq!(
            outcome,
            FlushOutcome::Flushed {
                written: 3,
                duplicates: 0,
                failed: 0
            }
        );
        assert_eq!(fx.fast.llen(&key).await.unwrap(), 0);
        assert!(!fx.fast.exists(&ttl_key(&key)).await.unwrap());
        assert!(!fx.fast.exists(&lock_key(&key)).await.unwrap());
        assert_eq!(fx.gateway.buffer.flush(&key).await.unwrap(), FlushOutcome::Empty);
        assert_eq!(fx.stored_messages(conversation), 3);
    }

    #[tokio::test]
    async fn held_lock_means_contended() {
        let fx = Fixture::new().await;
        let conversation = fx.conversation(&[1, 2]).await;
        let key = buffer_key("acme", conversation);
        fx.gateway.buffer.append(&key, &fx.message(conversation, 1)).await.unwrap();

        // Another instance owns the flush.
        fx.fast
            .set_nx_ex(&lock_key(&key), "elsewhere", Duration::from_secs(3))
            .await
            .unwrap();
        assert_eq!(fx.gateway.buffer.flush(&key).await.unwrap(), FlushOutcome::Contended);
        assert_eq!(fx.fast.llen(&key).await.unwrap(), 1);
        // The foreign lock is left alone.
        assert_eq!(fx.fast.get(&lock_key(&key)).await.unwrap().as_deref(), Some("elsewhere"));
    }

    #[tokio::test]
    async fn concurrent_flushes_write_once() {
        let fx = Fixture::new().await;
        let conversation = fx.conversation(&[1, 2]).await;
        let key = buffer_key("acme", conversation);
        for _ in 0..10 {
            fx.gateway.buffer.append(&key, &fx.message(conversation, 1)).await.unwrap();
        }

        let flushes: Vec<_> = (0..8)
            .map(|_| {
                let buffer = fx.gateway.buffer.clone();
                let key = key.clone();
                tokio::spawn(async move { buffer.flush(&key).await.unwrap() })
            })
            .collect();

        let mut written = 0;
        for flush in flushes {
            if let FlushOutcome::Flushed { written: n, duplicates, .. } = flush.await.unwrap() {
                assert_eq!(duplicates, 0);
                written += n;
            }
        }
        assert_eq!(written, 10);
        assert_eq!(fx.stored_messages(conversation), 10);
    }

    #[tokio::test]
    async fn size_trigger_flushes_at_batch_size() {
        let fx = Fixture::new().await;
        let conversation = fx.conversation(&[1, 2]).await;
        let key = buffer_key("acme", conversation);

        for i in 1..=150 {
            let len = fx.gateway.buffer.append(&key, &fx.message(conversation, 1)).await.unwrap();
            if i == 100 {
                assert_eq!(len, 100);
            }
        }

        assert_eq!(fx.stored_messages(conversation), 100);
        assert_eq!(fx.fast.llen(&key).await.unwrap(), 50);
        // The remainder waits for the time trigger.
        assert!(fx.fast.exists(&ttl_key(&key)).await.unwrap());
    }

    #[tokio::test]
    async fn failed_insert_keeps_buffer_and_rearms_timer() {
        let fx = Fixture::new().await;
        // Not a conversation the durable store knows: every insert fails the
        // foreign key, which is reported per document.
        let conversation = Uuid::new_v4();
        let key = buffer_key("acme", conversation);
        fx.gateway.buffer.append(&key, &fx.message(conversation, 1)).await.unwrap();

        let outcome = fx.gateway.buffer.flush(&key).await.unwrap();
        assert_eq!(
            outcome,
            FlushOutcome::Flushed {
                written: 0,
                duplicates: 0,
                failed: 1
            }
        );

        fx.break_durable_store();
        fx.gateway.buffer.append(&key, &fx.message(conversation, 1)).await.unwrap();
        fx.fast.del(&ttl_key(&key)).await.unwrap();

        let err = fx.gateway.buffer.flush(&key).await.unwrap_err();
        assert!(matches!(err, GatewayError::PersistenceDegraded(_)));
        assert_eq!(fx.fast.llen(&key).await.unwrap(), 1);
        assert!(fx.fast.exists(&ttl_key(&key)).await.unwrap());
        assert!(!fx.fast.exists(&lock_key(&key)).await.unwrap());
    }

    #[tokio::test]
    async fn undecodable_entries_are_dropped() {
        let fx = Fixture::new().await;
        let conversation = fx.conversation(&[1, 2]).await;
        let key = buffer_key("acme", conversation);
        fx.fast.rpush(&key, vec!["{not json".into()]).await.unwrap();
        fx.gateway.buffer.append(&key, &fx.message(conversation, 1)).await.unwrap();

        let outcome = fx.gateway.buffer.flush(&key).await.unwrap();
        assert!(matches!(outcome, FlushOutcome::Flushed { written: 1, .. }));
        assert_eq!(fx.fast.llen(&key).await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn expiry_listener_flushes_on_timer() {
        let fx = Fixture::new().await;
        let _sweeper = fx.fast.spawn_sweeper(Duration::from_millis(100));
        let _listener = fx.gateway.buffer.spawn_expiry_listener();

        let conversation = fx.conversation(&[1, 2]).await;
        let key = buffer_key("acme", conversation);
        fx.gateway.buffer.append(&key, &fx.message(conversation, 1)).await.unwrap();
        fx.gateway.buffer.append(&key, &fx.message(conversation, 1)).await.unwrap();

        let deadline = Instant::now() + Duration::from_secs(10);
        while fx.stored_messages(conversation) < 2 {
            assert!(Instant::now() < deadline, "timed flush never happened");
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert_eq!(fx.fast.llen(&key).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn settle_waits_for_foreign_flush() {
        let fx = Fixture::new().await;
        let conversation = fx.conversation(&[1, 2]).await;
        let key = buffer_key("acme", conversation);
        fx.gateway.buffer.append(&key, &fx.message(conversation, 1)).await.unwrap();

        fx.fast
            .set_nx_ex(&lock_key(&key), "elsewhere", Duration::from_millis(200))
            .await
            .unwrap();
        fx.gateway.buffer.settle(&key).await.unwrap();
        assert_eq!(fx.stored_messages(conversation), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn append_racing_the_timer_reset_is_still_flushed() {
        let fx = Fixture::new().await;
        let config = GatewayConfig::default();
        let _sweeper = fx.fast.spawn_sweeper(Duration::from_millis(100));
        let conversation = fx.conversation(&[1, 2]).await;
        let key = buffer_key("acme", conversation);

        let racing = Arc::new(RacingAppend::new(fx.fast.clone(), config.flush_interval));
        let buffer = MessageBuffer::new(racing.clone(), fx.gateway.durable.clone(), &config);
        let _listener = buffer.spawn_expiry_listener();

        buffer.append(&key, &fx.message(conversation, 1)).await.unwrap();
        let late = fx.message(conversation, 2);
        racing.append_before_timer_delete(&key, &late);

        assert!(matches!(
            buffer.flush(&key).await.unwrap(),
            FlushOutcome::Flushed { written: 1, .. }
        ));
        // The late append still saw the old marker and armed nothing itself.
        assert_eq!(racing.raced_append_armed(), Some(false));
        assert_eq!(fx.fast.llen(&key).await.unwrap(), 1);
        assert!(fx.fast.exists(&ttl_key(&key)).await.unwrap());

        let deadline = Instant::now() + Duration::from_secs(10);
        while fx.stored_messages(conversation) < 2 {
            assert!(Instant::now() < deadline, "late append never persisted");
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(fx.messages(conversation).iter().any(|m| m.id == late.id));
        assert_eq!(fx.fast.llen(&key).await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn flush_outliving_its_lock_keeps_later_appends() {
        let fx = Fixture::new().await;
        let config = GatewayConfig::default();
        let conversation = fx.conversation(&[1, 2]).await;
        let key = buffer_key("acme", conversation);

        // Inserts take longer than the flush lock lives.
        let stall = config.flush_lock_ttl + Duration::from_secs(1);
        let slow_store = SlowInserts::new(fx.gateway.durable.clone(), stall);
        let slow = MessageBuffer::new(Arc::new(fx.fast.clone()), Arc::new(slow_store), &config);
        let other = &fx.gateway.buffer;

        other.append(&key, &fx.message(conversation, 1)).await.unwrap();
        let stalled = {
            let slow = slow.clone();
            let key = key.clone();
            tokio::spawn(async move { slow.flush(&key).await.unwrap() })
        };

        tokio::time::sleep(config.flush_lock_ttl + Duration::from_millis(500)).await;
        // The lock has lapsed; another instance appends and flushes meanwhile.
        other.append(&key, &fx.message(conversation, 1)).await.unwrap();
        other.append(&key, &fx.message(conversation, 2)).await.unwrap();
        assert_eq!(
            other.flush(&key).await.unwrap(),
            FlushOutcome::Flushed {
                written: 3,
                duplicates: 0,
                failed: 0
            }
        );
        let late = fx.message(conversation, 2);
        other.append(&key, &late).await.unwrap();

        assert_eq!(
            stalled.await.unwrap(),
            FlushOutcome::Flushed {
                written: 0,
                duplicates: 1,
                failed: 0
            }
        );
        let pending: Vec<Uuid> = other.pending(&key).await.unwrap().iter().map(|m| m.id).collect();
        assert_eq!(pending, vec![late.id]);
        assert!(fx.fast.exists(&ttl_key(&key)).await.unwrap());

        other.flush(&key).await.unwrap();
        assert_eq!(fx.stored_messages(conversation), 4);
        assert!(fx.messages(conversation).iter().any(|m| m.id == late.id));
    }
}
