//! Redis-backed [`Transport`] (spec.md §4.2): `PUBLISH`/`SUBSCRIBE` for the
//! pub/sub half, `SET ... PX`/`GET`/`DEL`/`SCAN`/`SADD`/`SREM`/`SMEMBERS`
//! for the key-value half. One dedicated pub/sub connection is opened per
//! distinct channel the first time it gains a subscriber; `publish` and the
//! key-value operations share a single `ConnectionManager`, which
//! reconnects and retries transparently under the hood.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{error, warn};

use fulcrum_core::error::FulcrumError;
use fulcrum_core::transport::{RawHandler, ReadyCallback, SubscriptionId, Transport};

type Handlers = Arc<Mutex<Vec<(SubscriptionId, RawHandler)>>>;

struct ChannelWorker {
    task: JoinHandle<()>,
    handlers: Handlers,
}

fn redis_err(e: redis::RedisError) -> FulcrumError {
    FulcrumError::TransportUnavailable(e.to_string())
}

/// Redis-backed [`Transport`]. Cheap to clone: internally `Arc`-wrapped
/// connection state, matching the convention the rest of the fabric uses
/// for its own shared handles.
pub struct RedisTransport {
    client: redis::Client,
    commands: ConnectionManager,
    channels: Mutex<HashMap<String, ChannelWorker>>,
    next_id: AtomicU64,
    connected: AtomicBool,
}

impl RedisTransport {
    /// Connect to `url` (e.g. `redis://127.0.0.1:6379`) and open the shared
    /// command connection eagerly, so a bad URL fails at construction
    /// rather than on the first operation.
    pub async fn connect(url: &str) -> Result<Self, FulcrumError> {
        let client = redis::Client::open(url).map_err(redis_err)?;
        let commands = ConnectionManager::new(client.clone()).await.map_err(redis_err)?;
        Ok(Self {
            client,
            commands,
            channels: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            connected: AtomicBool::new(true),
        })
    }

    fn commands(&self) -> ConnectionManager {
        self.commands.clone()
    }

    async fn note_result<T>(&self, result: Result<T, redis::RedisError>) -> Result<T, FulcrumError> {
        match result {
            Ok(v) => {
                self.connected.store(true, Ordering::SeqCst);
                Ok(v)
            }
            Err(e) => {
                self.connected.store(false, Ordering::SeqCst);
                Err(redis_err(e))
            }
        }
    }
}

#[async_trait]
impl Transport for RedisTransport {
    async fn subscribe(
        &self,
        channel: &str,
        handler: RawHandler,
        ready: Option<ReadyCallback>,
    ) -> Result<SubscriptionId, FulcrumError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut channels = self.channels.lock().await;

        if let Some(worker) = channels.get(channel) {
            worker.handlers.lock().await.push((id, handler));
            if let Some(ready) = ready {
                ready();
            }
            return Ok(id);
        }

        let handlers: Handlers = Arc::new(Mutex::new(vec![(id, handler)]));
        let handlers_for_task = handlers.clone();
        let client = self.client.clone();
        let channel_owned = channel.to_string();
        let (ready_tx, ready_rx) = tokio::sync::oneshot::channel();

        let task = tokio::spawn(async move {
            let mut pubsub = match client.get_async_pubsub().await {
                Ok(p) => p,
                Err(e) => {
                    error!(error = %e, channel = %channel_owned, "failed to open redis pubsub connection");
                    let _ = ready_tx.send(());
                    return;
                }
            };
            if let Err(e) = pubsub.subscribe(&channel_owned).await {
                error!(error = %e, channel = %channel_owned, "redis SUBSCRIBE failed");
                let _ = ready_tx.send(());
                return;
            }
            let _ = ready_tx.send(());

            let mut stream = pubsub.on_message();
            while let Some(msg) = stream.next().await {
                let payload: Vec<u8> = match msg.get_payload() {
                    Ok(p) => p,
                    Err(e) => {
                        warn!(error = %e, channel = %channel_owned, "dropping malformed redis payload");
                        continue;
                    }
                };
                let list = handlers_for_task.lock().await.clone();
                for (_, h) in list {
                    h(payload.clone()).await;
                }
            }
        });

        // Wait for the subscriber task to confirm it has issued SUBSCRIBE
        // (or failed trying) before telling the caller it's ready.
        let _ = ready_rx.await;
        if let Some(ready) = ready {
            ready();
        }
        channels.insert(channel.to_string(), ChannelWorker { task, handlers });
        Ok(id)
    }

    async fn unsubscribe(&self, channel: &str, id: SubscriptionId) -> Result<(), FulcrumError> {
        let mut channels = self.channels.lock().await;
        let Some(worker) = channels.get(channel) else {
            return Ok(());
        };
        let mut handlers = worker.handlers.lock().await;
        handlers.retain(|(hid, _)| *hid != id);
        let empty = handlers.is_empty();
        drop(handlers);
        if empty {
            if let Some(worker) = channels.remove(channel) {
                worker.task.abort();
            }
        }
        Ok(())
    }

    async fn publish(&self, channel: &str, bytes: Vec<u8>) -> Result<(), FulcrumError> {
        let mut conn = self.commands();
        let result: Result<(), redis::RedisError> = conn.publish(channel, bytes).await;
        self.note_result(result).await
    }

    async fn set_with_ttl(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), FulcrumError> {
        let mut conn = self.commands();
        let result: Result<(), redis::RedisError> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("PX")
            .arg(ttl.as_millis().max(1) as u64)
            .query_async(&mut conn)
            .await;
        self.note_result(result).await
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, FulcrumError> {
        let mut conn = self.commands();
        let result: Result<Option<Vec<u8>>, redis::RedisError> = conn.get(key).await;
        self.note_result(result).await
    }

    async fn del(&self, keys: &[String]) -> Result<(), FulcrumError> {
        if keys.is_empty() {
            return Ok(());
        }
        let mut conn = self.commands();
        let result: Result<i64, redis::RedisError> = conn.del(keys).await;
        self.note_result(result).await.map(|_| ())
    }

    async fn scan(&self, prefix: &str) -> Result<Vec<String>, FulcrumError> {
        let mut conn = self.commands();
        let pattern = format!("{prefix}*");
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();
        loop {
            let result: Result<(u64, Vec<String>), redis::RedisError> = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(200)
                .query_async(&mut conn)
                .await;
            let (next_cursor, batch) = self.note_result(result).await?;
            keys.extend(batch);
            if next_cursor == 0 {
                break;
            }
            cursor = next_cursor;
        }
        Ok(keys)
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<(), FulcrumError> {
        let mut conn = self.commands();
        let result: Result<i64, redis::RedisError> = conn.sadd(key, member).await;
        self.note_result(result).await.map(|_| ())
    }

    async fn set_remove(&self, key: &str, member: &str) -> Result<(), FulcrumError> {
        let mut conn = self.commands();
        let result: Result<i64, redis::RedisError> = conn.srem(key, member).await;
        self.note_result(result).await.map(|_| ())
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>, FulcrumError> {
        let mut conn = self.commands();
        let result: Result<Vec<String>, redis::RedisError> = conn.smembers(key).await;
        self.note_result(result).await
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

#[cfg(all(test, feature = "redis-integration"))]
mod tests {
    use super::*;
    use std::time::Duration as StdDuration;

    fn redis_url() -> String {
        std::env::var("FULCRUM_TEST_REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string())
    }

    async fn redis_available() -> bool {
        RedisTransport::connect(&redis_url()).await.is_ok()
    }

    #[tokio::test]
    async fn publish_reaches_subscriber() {
        if !redis_available().await {
            eprintln!("skipping: no redis reachable at {}", redis_url());
            return;
        }
        let transport = RedisTransport::connect(&redis_url()).await.unwrap();
        let received = Arc::new(Mutex::new(Vec::new()));
        let received2 = received.clone();
        let handler: RawHandler = Arc::new(move |bytes| {
            let received = received2.clone();
            Box::pin(async move {
                received.lock().await.push(bytes);
            })
        });
        transport.subscribe("fulcrum.test.redis", handler, None).await.unwrap();
        tokio::time::sleep(StdDuration::from_millis(100)).await;
        transport.publish("fulcrum.test.redis", b"hi".to_vec()).await.unwrap();
        tokio::time::sleep(StdDuration::from_millis(200)).await;
        assert_eq!(received.lock().await.as_slice(), &[b"hi".to_vec()]);
    }

    #[tokio::test]
    async fn kv_roundtrip_with_ttl() {
        if !redis_available().await {
            eprintln!("skipping: no redis reachable at {}", redis_url());
            return;
        }
        let transport = RedisTransport::connect(&redis_url()).await.unwrap();
        transport
            .set_with_ttl("fulcrum:test:k", b"v".to_vec(), StdDuration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(transport.get("fulcrum:test:k").await.unwrap(), Some(b"v".to_vec()));
        transport.del(&["fulcrum:test:k".to_string()]).await.unwrap();
        assert_eq!(transport.get("fulcrum:test:k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn set_membership_roundtrip() {
        if !redis_available().await {
            eprintln!("skipping: no redis reachable at {}", redis_url());
            return;
        }
        let transport = RedisTransport::connect(&redis_url()).await.unwrap();
        transport.set_add("fulcrum:test:set", "a").await.unwrap();
        transport.set_add("fulcrum:test:set", "b").await.unwrap();
        let mut members = transport.set_members("fulcrum:test:set").await.unwrap();
        members.sort();
        assert_eq!(members, vec!["a".to_string(), "b".to_string()]);
        transport.set_remove("fulcrum:test:set", "a").await.unwrap();
        assert_eq!(transport.set_members("fulcrum:test:set").await.unwrap(), vec!["b".to_string()]);
        transport.del(&["fulcrum:test:set".to_string()]).await.unwrap();
    }
}
