use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::{ChannelSubscription, FastResult, FastStore, FastStoreError};

/// Capacity of the expiry notification channel. A listener that falls this
/// far behind sees `RecvError::Lagged`.
const EXPIRED_CAPACITY: usize = 4096;

#[derive(Debug)]
enum Value {
    Str(String),
    List(VecDeque<String>),
    Set(BTreeSet<String>),
}

#[derive(Debug)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn new(value: Value) -> Self {
        Self {
            value,
            expires_at: None,
        }
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

struct Subscriber {
    id: u64,
    tx: mpsc::UnboundedSender<String>,
}

struct Inner {
    keys: Mutex<HashMap<String, Entry>>,
    channels: Mutex<HashMap<String, Vec<Subscriber>>>,
    next_subscriber: AtomicU64,
    expired_tx: broadcast::Sender<String>,
}

impl Inner {
    fn keys(&self) -> FastResult<MutexGuard<'_, HashMap<String, Entry>>> {
        self.keys
            .lock()
            .map_err(|e| FastStoreError::Unavailable(format!("keyspace lock poisoned: {}", e)))
    }

    fn channels(&self) -> FastResult<MutexGuard<'_, HashMap<String, Vec<Subscriber>>>> {
        self.channels
            .lock()
            .map_err(|e| FastStoreError::Unavailable(format!("channel lock poisoned: {}", e)))
    }

    /// Lazy expiry on access. Emits the same notification as the sweeper.
    fn purge_if_expired(&self, keys: &mut HashMap<String, Entry>, key: &str) {
        if keys.get(key).is_some_and(|e| e.is_expired(Instant::now())) {
            keys.remove(key);
            self.notify_expired(key);
        }
    }

    fn notify_expired(&self, key: &str) {
        trace!("key expired: {}", key);
        let _ = self.expired_tx.send(key.to_string());
    }

    fn unsubscribe(&self, channel: &str, id: u64) {
        if let Ok(mut channels) = self.channels() {
            if let Some(subs) = channels.get_mut(channel) {
                subs.retain(|s| s.id != id);
                if subs.is_empty() {
                    channels.remove(channel);
                }
            }
        }
    }
}

/// In-process [`FastStore`]. Cloning shares the same keyspace, so several
/// gateway instances in one process (or one test) see each other's keys,
/// locks and publishes.
#[derive(Clone)]
pub struct MemoryFastStore {
    inner: Arc<Inner>,
}

impl Default for MemoryFastStore {
    fn default() -> Self {
        let (expired_tx, _) = broadcast::channel(EXPIRED_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                keys: Mutex::new(HashMap::new()),
                channels: Mutex::new(HashMap::new()),
                next_subscriber: AtomicU64::new(1),
                expired_tx,
            }),
        }
    }
}

impl MemoryFastStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove every key whose deadline has passed. Returns how many expired.
    pub fn sweep_expired(&self) -> FastResult<usize> {
        let now = Instant::now();
        let mut keys = self.inner.keys()?;
        let expired: Vec<String> = keys
            .iter()
            .filter(|(_, entry)| entry.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect();

        for key in &expired {
            keys.remove(key);
            self.inner.notify_expired(key);
        }
        Ok(expired.len())
    }

    /// Active expiry, so timer keys fire even when nobody reads them again.
    /// Stops once every handle to the store is gone.
    pub fn spawn_sweeper(&self, period: Duration) -> JoinHandle<()> {
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                let Some(inner) = weak.upgrade() else {
                    debug!("fast store dropped, sweeper exiting");
                    break;
                };
                let store = MemoryFastStore { inner };
                if let Err(e) = store.sweep_expired() {
                    debug!("expiry sweep failed: {}", e);
                }
            }
        })
    }
}

/// Resolve a Redis-style inclusive range against a list of `len` items.
fn resolve_range(len: usize, start: isize, stop: isize) -> Option<(usize, usize)> {
    let len = len as isize;
    let start = if start < 0 { (len + start).max(0) } else { start };
    let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };
    if len == 0 || start > stop || start >= len {
        return None;
    }
    Some((start as usize, stop as usize))
}

/// Keep the inclusive range of the list at `key`; an empty result removes it.
fn trim_list(keys: &mut HashMap<String, Entry>, key: &str, start: isize, stop: isize) -> FastResult<()> {
    let now_empty = match keys.get_mut(key).map(|e| &mut e.value) {
        Some(Value::List(list)) => {
            match resolve_range(list.len(), start, stop) {
                Some((from, to)) => {
                    list.truncate(to + 1);
                    list.drain(..from);
                }
                None => list.clear(),
            }
            list.is_empty()
        }
        Some(_) => return Err(FastStoreError::WrongType(key.to_string())),
        None => false,
    };
    if now_empty {
        keys.remove(key);
    }
    Ok(())
}

#[async_trait]
impl FastStore for MemoryFastStore {
    async fn get(&self, key: &str) -> FastResult<Option<String>> {
        let mut keys = self.inner.keys()?;
        self.inner.purge_if_expired(&mut keys, key);
        match keys.get(key).map(|e| &e.value) {
            Some(Value::Str(s)) => Ok(Some(s.clone())),
            Some(_) => Err(FastStoreError::WrongType(key.to_string())),
            None => Ok(None),
        }
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> FastResult<()> {
        let mut keys = self.inner.keys()?;
        keys.insert(
            key.to_string(),
            Entry {
                value: Value::Str(value.to_string()),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> FastResult<bool> {
        let mut keys = self.inner.keys()?;
        self.inner.purge_if_expired(&mut keys, key);
        if keys.contains_key(key) {
            return Ok(false);
        }
        keys.insert(
            key.to_string(),
            Entry {
                value: Value::Str(value.to_string()),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(true)
    }

    async fn exists(&self, key: &str) -> FastResult<bool> {
        let mut keys = self.inner.keys()?;
        self.inner.purge_if_expired(&mut keys, key);
        Ok(keys.contains_key(key))
    }

    async fn del(&self, key: &str) -> FastResult<bool> {
        let mut keys = self.inner.keys()?;
        self.inner.purge_if_expired(&mut keys, key);
        Ok(keys.remove(key).is_some())
    }

    async fn del_if_eq(&self, key: &str, expected: &str) -> FastResult<bool> {
        let mut keys = self.inner.keys()?;
        self.inner.purge_if_expired(&mut keys, key);
        let matches = matches!(keys.get(key).map(|e| &e.value), Some(Value::Str(s)) if s == expected);
        if matches {
            keys.remove(key);
        }
        Ok(matches)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> FastResult<bool> {
        let mut keys = self.inner.keys()?;
        self.inner.purge_if_expired(&mut keys, key);
        match keys.get_mut(key) {
            Some(entry) => {
                entry.expires_at = Some(Instant::now() + ttl);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn rpush(&self, key: &str, values: Vec<String>) -> FastResult<usize> {
        let mut keys = self.inner.keys()?;
        self.inner.purge_if_expired(&mut keys, key);
        let entry = keys
            .entry(key.to_string())
            .or_insert_with(|| Entry::new(Value::List(VecDeque::new())));
        match &mut entry.value {
            Value::List(list) => {
                list.extend(values);
                Ok(list.len())
            }
            _ => Err(FastStoreError::WrongType(key.to_string())),
        }
    }

    async fn lrange(&self, key: &str, start: isize, stop: isize) -> FastResult<Vec<String>> {
        let mut keys = self.inner.keys()?;
        self.inner.purge_if_expired(&mut keys, key);
        match keys.get(key).map(|e| &e.value) {
            Some(Value::List(list)) => Ok(resolve_range(list.len(), start, stop)
                .map(|(from, to)| list.range(from..=to).cloned().collect())
                .unwrap_or_default()),
            Some(_) => Err(FastStoreError::WrongType(key.to_string())),
            None => Ok(Vec::new()),
        }
    }

    async fn llen(&self, key: &str) -> FastResult<usize> {
        let mut keys = self.inner.keys()?;
        self.inner.purge_if_expired(&mut keys, key);
        match keys.get(key).map(|e| &e.value) {
            Some(Value::List(list)) => Ok(list.len()),
            Some(_) => Err(FastStoreError::WrongType(key.to_string())),
            None => Ok(0),
        }
    }

    async fn ltrim(&self, key: &str, start: isize, stop: isize) -> FastResult<()> {
        let mut keys = self.inner.keys()?;
        self.inner.purge_if_expired(&mut keys, key);
        trim_list(&mut keys, key, start, stop)
    }

    async fn ltrim_if_eq(
        &self,
        key: &str,
        start: isize,
        stop: isize,
        guard: &str,
        expected: &str,
    ) -> FastResult<bool> {
        let mut keys = self.inner.keys()?;
        self.inner.purge_if_expired(&mut keys, guard);
        if !matches!(keys.get(guard).map(|e| &e.value), Some(Value::Str(s)) if s == expected) {
            return Ok(false);
        }
        self.inner.purge_if_expired(&mut keys, key);
        trim_list(&mut keys, key, start, stop)?;
        Ok(true)
    }

    async fn sadd(&self, key: &str, member: &str) -> FastResult<bool> {
        let mut keys = self.inner.keys()?;
        self.inner.purge_if_expired(&mut keys, key);
        let entry = keys
            .entry(key.to_string())
            .or_insert_with(|| Entry::new(Value::Set(BTreeSet::new())));
        match &mut entry.value {
            Value::Set(set) => Ok(set.insert(member.to_string())),
            _ => Err(FastStoreError::WrongType(key.to_string())),
        }
    }

    async fn srem(&self, key: &str, member: &str) -> FastResult<bool> {
        let mut keys = self.inner.keys()?;
        self.inner.purge_if_expired(&mut keys, key);
        let (removed, now_empty) = match keys.get_mut(key).map(|e| &mut e.value) {
            Some(Value::Set(set)) => (set.remove(member), set.is_empty()),
            Some(_) => return Err(FastStoreError::WrongType(key.to_string())),
            None => (false, false),
        };
        if now_empty {
            keys.remove(key);
        }
        Ok(removed)
    }

    async fn smembers(&self, key: &str) -> FastResult<Vec<String>> {
        let mut keys = self.inner.keys()?;
        self.inner.purge_if_expired(&mut keys, key);
        match keys.get(key).map(|e| &e.value) {
            Some(Value::Set(set)) => Ok(set.iter().cloned().collect()),
            Some(_) => Err(FastStoreError::WrongType(key.to_string())),
            None => Ok(Vec::new()),
        }
    }

    async fn publish(&self, channel: &str, payload: String) -> FastResult<usize> {
        let mut channels = self.inner.channels()?;
        let Some(subs) = channels.get_mut(channel) else {
            return Ok(0);
        };
        subs.retain(|s| !s.tx.is_closed());
        let mut delivered = 0;
        for sub in subs.iter() {
            if sub.tx.send(payload.clone()).is_ok() {
                delivered += 1;
            }
        }
        if subs.is_empty() {
            channels.remove(channel);
        }
        Ok(delivered)
    }

    async fn subscribe(&self, channel: &str) -> FastResult<ChannelSubscription> {
        let id = self.inner.next_subscriber.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner
            .channels()?
            .entry(channel.to_string())
            .or_default()
            .push(Subscriber { id, tx });

        let weak = Arc::downgrade(&self.inner);
        let name = channel.to_string();
        Ok(ChannelSubscription::new(channel, rx, move || {
            if let Some(inner) = weak.upgrade() {
                inner.unsubscribe(&name, id);
            }
        }))
    }

    fn expired_keys(&self) -> broadcast::Receiver<String> {
        self.inner.expired_tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_range_matches_redis() {
        assert_eq!(resolve_range(5, 0, -1), Some((0, 4)));
        assert_eq!(resolve_range(5, 2, -1), Some((2, 4)));
        assert_eq!(resolve_range(5, -2, -1), Some((3, 4)));
        assert_eq!(resolve_range(5, 0, 100), Some((0, 4)));
        assert_eq!(resolve_range(5, 5, -1), None);
        assert_eq!(resolve_range(0, 0, -1), None);
        assert_eq!(resolve_range(3, 2, 1), None);
    }

    #[tokio::test]
    async fn set_nx_is_exclusive_until_expiry() {
        tokio::time::pause();
        let store = MemoryFastStore::new();
        let ttl = Duration::from_secs(3);

        assert!(store.set_nx_ex("lock:a", "x", ttl).await.unwrap());
        assert!(!store.set_nx_ex("lock:a", "y", ttl).await.unwrap());

        tokio::time::advance(Duration::from_secs(4)).await;
        assert!(store.set_nx_ex("lock:a", "y", ttl).await.unwrap());
        assert_eq!(store.get("lock:a").await.unwrap().as_deref(), Some("y"));
    }

    #[tokio::test]
    async fn del_if_eq_only_releases_own_value() {
        let store = MemoryFastStore::new();
        store.set_ex("lock:a", "mine", Duration::from_secs(3)).await.unwrap();

        assert!(!store.del_if_eq("lock:a", "theirs").await.unwrap());
        assert!(store.exists("lock:a").await.unwrap());
        assert!(store.del_if_eq("lock:a", "mine").await.unwrap());
        assert!(!store.exists("lock:a").await.unwrap());
    }

    #[tokio::test]
    async fn list_push_range_trim() {
        let store = MemoryFastStore::new();
        let len = store
            .rpush("buf", vec!["a".into(), "b".into(), "c".into()])
            .await
            .unwrap();
        assert_eq!(len, 3);
        assert_eq!(store.rpush("buf", vec!["d".into()]).await.unwrap(), 4);
        assert_eq!(store.lrange("buf", 0, -1).await.unwrap(), vec!["a", "b", "c", "d"]);

        store.ltrim("buf", 2, -1).await.unwrap();
        assert_eq!(store.lrange("buf", 0, -1).await.unwrap(), vec!["c", "d"]);

        store.ltrim("buf", 2, -1).await.unwrap();
        assert_eq!(store.llen("buf").await.unwrap(), 0);
        assert!(!store.exists("buf").await.unwrap());
    }

    #[tokio::test]
    async fn guarded_trim_needs_the_guard_value() {
        tokio::time::pause();
        let store = MemoryFastStore::new();
        store.rpush("buf", vec!["a".into(), "b".into(), "c".into()]).await.unwrap();
        store.set_ex("lock:buf", "mine", Duration::from_secs(3)).await.unwrap();

        assert!(!store.ltrim_if_eq("buf", 1, -1, "lock:buf", "theirs").await.unwrap());
        assert_eq!(store.llen("buf").await.unwrap(), 3);

        assert!(store.ltrim_if_eq("buf", 1, -1, "lock:buf", "mine").await.unwrap());
        assert_eq!(store.lrange("buf", 0, -1).await.unwrap(), vec!["b", "c"]);

        tokio::time::advance(Duration::from_secs(4)).await;
        assert!(!store.ltrim_if_eq("buf", 1, -1, "lock:buf", "mine").await.unwrap());
        assert_eq!(store.llen("buf").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn wrong_type_is_reported() {
        let store = MemoryFastStore::new();
        store.set_ex("k", "v", Duration::from_secs(10)).await.unwrap();
        assert!(matches!(
            store.rpush("k", vec!["x".into()]).await,
            Err(FastStoreError::WrongType(_))
        ));
    }

    #[tokio::test]
    async fn sets_remove_empty_keys() {
        let store = MemoryFastStore::new();
        assert!(store.sadd("typing", "1").await.unwrap());
        assert!(!store.sadd("typing", "1").await.unwrap());
        assert!(store.sadd("typing", "2").await.unwrap());
        assert_eq!(store.smembers("typing").await.unwrap(), vec!["1", "2"]);

        assert!(store.srem("typing", "1").await.unwrap());
        assert!(store.srem("typing", "2").await.unwrap());
        assert!(!store.exists("typing").await.unwrap());
    }

    #[tokio::test]
    async fn lazy_expiry_emits_notification() {
        tokio::time::pause();
        let store = MemoryFastStore::new();
        let mut expired = store.expired_keys();

        store.set_ex("buffer:t:c:ttl", "1", Duration::from_secs(2)).await.unwrap();
        tokio::time::advance(Duration::from_secs(3)).await;

        assert!(!store.exists("buffer:t:c:ttl").await.unwrap());
        assert_eq!(expired.recv().await.unwrap(), "buffer:t:c:ttl");
    }

    #[tokio::test]
    async fn sweeper_expires_untouched_keys() {
        tokio::time::pause();
        let store = MemoryFastStore::new();
        let mut expired = store.expired_keys();
        let sweeper = store.spawn_sweeper(Duration::from_millis(100));

        store.set_ex("timer", "1", Duration::from_secs(1)).await.unwrap();
        store.set_ex("later", "1", Duration::from_secs(60)).await.unwrap();

        let key = tokio::time::timeout(Duration::from_secs(5), expired.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(key, "timer");
        assert!(store.exists("later").await.unwrap());
        sweeper.abort();
    }

    #[tokio::test]
    async fn publish_reaches_only_live_subscribers() {
        let store = MemoryFastStore::new();
        assert_eq!(store.publish("acme:connection:2", "x".into()).await.unwrap(), 0);

        let mut first = store.subscribe("acme:connection:2").await.unwrap();
        let second = store.subscribe("acme:connection:2").await.unwrap();
        assert_eq!(store.publish("acme:connection:2", "hello".into()).await.unwrap(), 2);
        assert_eq!(first.recv().await.as_deref(), Some("hello"));

        second.unsubscribe();
        assert_eq!(store.publish("acme:connection:2", "again".into()).await.unwrap(), 1);
        assert_eq!(first.try_recv().as_deref(), Some("again"));

        drop(first);
        assert_eq!(store.publish("acme:connection:2", "gone".into()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn clones_share_keyspace() {
        let a = MemoryFastStore::new();
        let b = a.clone();
        assert!(a.set_nx_ex("lock:x", "a", Duration::from_secs(3)).await.unwrap());
        assert!(!b.set_nx_ex("lock:x", "b", Duration::from_secs(3)).await.unwrap());
    }
}
