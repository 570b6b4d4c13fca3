//! An in-memory [`Transport`] double, grounded on the reference event-bus
//! implementation's `InMemoryBus` (tokio `broadcast` channels standing in
//! for a pub/sub backend; a `Mutex<HashMap>` standing in for the KV store
//! with TTL expiry checked lazily on read).
//!
//! Used by `fulcrum-core`'s own test suite so C3-C6 can be exercised
//! without a live Redis, and re-exported by `fulcrum-transport-redis` for
//! integration tests that want the same double.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::error::FulcrumError;
use crate::transport::{RawHandler, ReadyCallback, SubscriptionId, Transport};

struct Subscription {
    id: SubscriptionId,
    handler: RawHandler,
}

struct Entry {
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

#[derive(Default)]
struct Store {
    channels: HashMap<String, Vec<Subscription>>,
    kv: HashMap<String, Entry>,
    sets: HashMap<String, std::collections::BTreeSet<String>>,
}

/// In-process stand-in for a Redis-like pub/sub + KV store.
pub struct InMemoryTransport {
    store: Mutex<Store>,
    next_id: AtomicU64,
    connected: std::sync::atomic::AtomicBool,
}

impl Default for InMemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryTransport {
    pub fn new() -> Self {
        Self {
            store: Mutex::new(Store::default()),
            next_id: AtomicU64::new(1),
            connected: std::sync::atomic::AtomicBool::new(true),
        }
    }

    /// Test hook: simulate a transport outage.
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn subscribe(
        &self,
        channel: &str,
        handler: RawHandler,
        ready: Option<ReadyCallback>,
    ) -> Result<SubscriptionId, FulcrumError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut store = self.store.lock().await;
        store
            .channels
            .entry(channel.to_string())
            .or_default()
            .push(Subscription { id, handler });
        drop(store);
        if let Some(ready) = ready {
            ready();
        }
        Ok(id)
    }

    async fn unsubscribe(&self, channel: &str, id: SubscriptionId) -> Result<(), FulcrumError> {
        let mut store = self.store.lock().await;
        if let Some(subs) = store.channels.get_mut(channel) {
            subs.retain(|s| s.id != id);
        }
        Ok(())
    }

    async fn publish(&self, channel: &str, bytes: Vec<u8>) -> Result<(), FulcrumError> {
        let handlers: Vec<RawHandler> = {
            let store = self.store.lock().await;
            store
                .channels
                .get(channel)
                .map(|subs| subs.iter().map(|s| s.handler.clone()).collect())
                .unwrap_or_default()
        };
        for handler in handlers {
            handler(bytes.clone()).await;
        }
        Ok(())
    }

    async fn set_with_ttl(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), FulcrumError> {
        let mut store = self.store.lock().await;
        store.kv.insert(
            key.to_string(),
            Entry {
                value,
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, FulcrumError> {
        let mut store = self.store.lock().await;
        if let Some(entry) = store.kv.get(key) {
            if let Some(expires_at) = entry.expires_at {
                if Instant::now() >= expires_at {
                    store.kv.remove(key);
                    return Ok(None);
                }
            }
            return Ok(Some(entry.value.clone()));
        }
        Ok(None)
    }

    async fn del(&self, keys: &[String]) -> Result<(), FulcrumError> {
        let mut store = self.store.lock().await;
        for key in keys {
            store.kv.remove(key);
        }
        Ok(())
    }

    async fn scan(&self, prefix: &str) -> Result<Vec<String>, FulcrumError> {
        let store = self.store.lock().await;
        Ok(store
            .kv
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<(), FulcrumError> {
        let mut store = self.store.lock().await;
        store.sets.entry(key.to_string()).or_default().insert(member.to_string());
        Ok(())
    }

    async fn set_remove(&self, key: &str, member: &str) -> Result<(), FulcrumError> {
        let mut store = self.store.lock().await;
        if let Some(set) = store.sets.get_mut(key) {
            set.remove(member);
        }
        Ok(())
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>, FulcrumError> {
        let store = self.store.lock().await;
        Ok(store.sets.get(key).map(|s| s.iter().cloned().collect()).unwrap_or_default())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

pub fn new_in_memory_transport() -> Arc<dyn Transport> {
    Arc::new(InMemoryTransport::new())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_reaches_subscribed_handler() {
        let t = InMemoryTransport::new();
        let received = Arc::new(Mutex::new(Vec::new()));
        let received2 = received.clone();
        let handler: RawHandler = Arc::new(move |bytes| {
            let received = received2.clone();
            Box::pin(async move {
                received.lock().await.push(bytes);
            })
        });
        t.subscribe("chan", handler, None).await.unwrap();
        t.publish("chan", b"hello".to_vec()).await.unwrap();
        assert_eq!(received.lock().await.as_slice(), &[b"hello".to_vec()]);
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let t = InMemoryTransport::new();
        let count = Arc::new(AtomicU64::new(0));
        let count2 = count.clone();
        let handler: RawHandler = Arc::new(move |_| {
            let count = count2.clone();
            Box::pin(async move {
                count.fetch_add(1, Ordering::SeqCst);
            })
        });
        let id = t.subscribe("chan", handler, None).await.unwrap();
        t.publish("chan", b"1".to_vec()).await.unwrap();
        t.unsubscribe("chan", id).await.unwrap();
        t.publish("chan", b"2".to_vec()).await.unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn ttl_expiry_is_observed_on_read() {
        let t = InMemoryTransport::new();
        t.set_with_ttl("k", b"v".to_vec(), Duration::from_millis(10)).await.unwrap();
        assert_eq!(t.get("k").await.unwrap(), Some(b"v".to_vec()));
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(t.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn set_membership_roundtrip() {
        let t = InMemoryTransport::new();
        t.set_add("ids", "a").await.unwrap();
        t.set_add("ids", "b").await.unwrap();
        let mut members = t.set_members("ids").await.unwrap();
        members.sort();
        assert_eq!(members, vec!["a".to_string(), "b".to_string()]);
        t.set_remove("ids", "a").await.unwrap();
        assert_eq!(t.set_members("ids").await.unwrap(), vec!["b".to_string()]);
    }
}
