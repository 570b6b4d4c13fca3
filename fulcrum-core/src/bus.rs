//! Message Bus (C3, spec.md §4.3).
//!
//! Dispatches inbound envelopes to handlers registered by `type`, and
//! implements request/response correlation, per-receiver dedup, and the
//! stable channel namespace (spec.md §6).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock as StdRwLock};
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::sync::{oneshot, Mutex as AsyncMutex, RwLock as AsyncRwLock};
use tracing::{debug, error, warn};

use crate::dedup::{DedupCache, DedupClass};
use crate::envelope::{Decoder, Envelope, TypeRegistry};
use crate::error::FulcrumError;
use crate::transport::{SubscriptionId, Transport};

pub type HandlerToken = u64;

/// A handler invoked for every envelope whose `type` it is registered for.
pub type MessageHandler = Arc<dyn Fn(Envelope) -> BoxFuture<'static, ()> + Send + Sync>;

const BROADCAST_CHANNEL: &str = "fulcrum.broadcast";

/// The type used on `fulcrum.server.registration.response` (spec.md §9:
/// "Registration-response dedup is intentionally bypassed"). This channel
/// is not one of `server.<id>`/`request.<id>`/`response.<id>`, so it is
/// never classified as "directed" and structurally never hits the dedup
/// step at all — every interested registering service must independently
/// decide whether a given response is theirs by `temp_id`, which is
/// exactly the "dedup happens at the handler" language in spec.md §4.3.
/// We still special-case the type name defensively in `is_directed`'s
/// caller so the bypass holds even if a future channel design ever
/// delivered this type over a directed channel.
pub const REGISTRATION_RESPONSE_TYPE: &str = "fulcrum.server.registration.response";

fn is_registration_response_class(type_name: &str) -> bool {
    type_name == REGISTRATION_RESPONSE_TYPE
}

pub fn broadcast_channel() -> String {
    BROADCAST_CHANNEL.to_string()
}

pub fn server_channel(id: &str) -> String {
    format!("fulcrum.server.{id}")
}

pub fn request_channel(id: &str) -> String {
    format!("fulcrum.request.{id}")
}

pub fn response_channel(id: &str) -> String {
    format!("fulcrum.response.{id}")
}

/// spec.md §4.3: "if a type string already starts with `fulcrum.` it names
/// its own channel; otherwise the channel is `fulcrum.custom.<type>`."
pub fn channel_for_type(type_name: &str) -> String {
    if type_name.starts_with("fulcrum.") {
        type_name.to_string()
    } else {
        format!("fulcrum.custom.{type_name}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DirectedKind {
    Server,
    Request,
    Response,
}

struct Inner {
    transport: Arc<dyn Transport>,
    type_registry: AsyncRwLock<TypeRegistry>,
    handlers: AsyncRwLock<HashMap<String, Vec<(HandlerToken, MessageHandler)>>>,
    pending: AsyncMutex<HashMap<String, oneshot::Sender<Result<Envelope, FulcrumError>>>>,
    dedup: DedupCache,
    current_id: StdRwLock<String>,
    channel_subs: AsyncMutex<HashMap<String, SubscriptionId>>,
    next_handler_id: AtomicU64,
    shut_down: AtomicBool,
}

impl Inner {
    fn current_id(&self) -> String {
        self.current_id.read().expect("current_id lock poisoned").clone()
    }
}

/// Dispatches inbound envelopes to handlers, and provides request/response,
/// broadcast, and targeted send over a [`Transport`].
#[derive(Clone)]
pub struct MessageBus {
    inner: Arc<Inner>,
}

impl MessageBus {
    /// Build a bus for a service currently known by `initial_id` (its
    /// temp id before registration, typically), and subscribe to the
    /// always-on channels (`broadcast`, `server.<id>`, `request.<id>`,
    /// `response.<id>`).
    pub async fn new(
        transport: Arc<dyn Transport>,
        initial_id: impl Into<String>,
        dedup_ttl_seconds: u64,
        registration_dedup_ttl_seconds: u64,
    ) -> Result<Self, FulcrumError> {
        let initial_id = initial_id.into();
        let dedup = DedupCache::new(transport.clone(), dedup_ttl_seconds, registration_dedup_ttl_seconds);
        dedup.cleanup_stale().await?;

        let inner = Arc::new(Inner {
            transport,
            type_registry: AsyncRwLock::new(TypeRegistry::new()),
            handlers: AsyncRwLock::new(HashMap::new()),
            pending: AsyncMutex::new(HashMap::new()),
            dedup,
            current_id: StdRwLock::new(initial_id.clone()),
            channel_subs: AsyncMutex::new(HashMap::new()),
            next_handler_id: AtomicU64::new(1),
            shut_down: AtomicBool::new(false),
        });

        let bus = Self { inner };
        bus.subscribe_always_on(&initial_id).await?;
        Ok(bus)
    }

    async fn subscribe_always_on(&self, id: &str) -> Result<(), FulcrumError> {
        self.ensure_channel_subscribed(&broadcast_channel(), None).await?;
        self.ensure_channel_subscribed(&server_channel(id), Some(DirectedKind::Server))
            .await?;
        self.ensure_channel_subscribed(&request_channel(id), Some(DirectedKind::Request))
            .await?;
        self.ensure_channel_subscribed(&response_channel(id), Some(DirectedKind::Response))
            .await?;
        Ok(())
    }

    async fn ensure_channel_subscribed(
        &self,
        channel: &str,
        directed: Option<DirectedKind>,
    ) -> Result<(), FulcrumError> {
        let mut subs = self.inner.channel_subs.lock().await;
        if subs.contains_key(channel) {
            return Ok(());
        }
        let inner = self.inner.clone();
        let channel_owned = channel.to_string();
        let expected_id = self.inner.current_id();
        let handler: crate::transport::RawHandler = Arc::new(move |bytes| {
            let inner = inner.clone();
            let channel = channel_owned.clone();
            let expected_id = expected_id.clone();
            Box::pin(async move {
                dispatch_inbound(inner, &channel, directed, &expected_id, bytes).await;
            })
        });
        let id = self.inner.transport.subscribe(channel, handler, None).await?;
        subs.insert(channel.to_string(), id);
        Ok(())
    }

    /// Register `decoder` for `type_name` on the underlying type registry.
    pub async fn register_type(&self, type_name: impl Into<String>, decoder: Decoder) -> Result<(), FulcrumError> {
        self.inner.type_registry.write().await.register(type_name, decoder)
    }

    /// Register `handler` for every envelope of `type_name`. Returns a
    /// token usable with [`unsubscribe`](Self::unsubscribe). Safe to call
    /// before or after the transport is observed ready.
    pub async fn subscribe(&self, type_name: impl Into<String>, handler: MessageHandler) -> Result<HandlerToken, FulcrumError> {
        let type_name = type_name.into();
        let channel = channel_for_type(&type_name);
        // Custom channels (anything other than the always-on four) need
        // their own transport-level subscription the first time a type
        // mapped to them gains a handler.
        if ![broadcast_channel(), server_channel(&self.inner.current_id()), request_channel(&self.inner.current_id()), response_channel(&self.inner.current_id())]
            .contains(&channel)
        {
            self.ensure_channel_subscribed(&channel, None).await?;
        }
        let token = self.inner.next_handler_id.fetch_add(1, Ordering::SeqCst);
        self.inner
            .handlers
            .write()
            .await
            .entry(type_name)
            .or_default()
            .push((token, handler));
        Ok(token)
    }

    /// Stop dispatching to `token`'s handler for `type_name`. In-flight
    /// dispatches already spawned may still complete.
    pub async fn unsubscribe(&self, type_name: &str, token: HandlerToken) {
        if let Some(list) = self.inner.handlers.write().await.get_mut(type_name) {
            list.retain(|(t, _)| *t != token);
        }
    }

    /// Publish on the topic channel for `type_name` (best-effort fan-out).
    pub async fn broadcast(&self, type_name: impl Into<String>, payload: serde_json::Value) -> Result<(), FulcrumError> {
        let type_name = type_name.into();
        let channel = channel_for_type(&type_name);
        let envelope = Envelope::new(type_name, self.inner.current_id(), None, payload);
        self.publish_on(&channel, &envelope).await
    }

    /// Publish directly on `target_service_id`'s direct channel.
    pub async fn send(
        &self,
        target_service_id: impl Into<String>,
        type_name: impl Into<String>,
        payload: serde_json::Value,
    ) -> Result<(), FulcrumError> {
        let target = target_service_id.into();
        let envelope = Envelope::new(type_name, self.inner.current_id(), Some(target.clone()), payload);
        self.publish_on(&server_channel(&target), &envelope).await
    }

    async fn publish_on(&self, channel: &str, envelope: &Envelope) -> Result<(), FulcrumError> {
        if let Err(e) = self.inner.transport.publish(channel, envelope.encode()).await {
            // spec.md §4.3: "publish failures are logged, not raised to the caller."
            warn!(channel, error = %e, "publish failed");
        }
        Ok(())
    }

    /// Send a request to `target` and await a matching response, or fail
    /// with `Timeout` if none arrives within `timeout`.
    pub async fn request(
        &self,
        target: impl Into<String>,
        type_name: impl Into<String>,
        payload: serde_json::Value,
        timeout: Duration,
    ) -> Result<Envelope, FulcrumError> {
        if self.inner.shut_down.load(Ordering::SeqCst) {
            return Err(FulcrumError::BusShutdown);
        }
        let target = target.into();
        let envelope = Envelope::new(type_name, self.inner.current_id(), Some(target.clone()), payload);
        let correlation_id = envelope.correlation_id.clone();

        let (tx, rx) = oneshot::channel();
        self.inner.pending.lock().await.insert(correlation_id.clone(), tx);

        if let Err(e) = self.inner.transport.publish(&request_channel(&target), envelope.encode()).await {
            self.inner.pending.lock().await.remove(&correlation_id);
            return Err(FulcrumError::TransportUnavailable(e.to_string()));
        }

        let started = tokio::time::Instant::now();
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_canceled)) => {
                self.inner.pending.lock().await.remove(&correlation_id);
                Err(FulcrumError::BusShutdown)
            }
            Err(_elapsed) => {
                self.inner.pending.lock().await.remove(&correlation_id);
                Err(FulcrumError::Timeout {
                    target,
                    elapsed_ms: started.elapsed().as_millis() as u64,
                })
            }
        }
    }

    /// Atomically move this bus's identity from `old_id` to `new_id`:
    /// subscribe the new directed triple first (so nothing arriving there
    /// is ever dropped as "too early"), then unsubscribe the old triple.
    /// Dispatch on the old channels is ignored from the moment `current_id`
    /// flips, regardless of how long the old transport-level subscription
    /// lingers (spec.md §4.3 "Server-id rotation").
    pub async fn rotate_server_id(&self, new_id: impl Into<String>) -> Result<(), FulcrumError> {
        let new_id = new_id.into();
        let old_id = {
            let mut guard = self.inner.current_id.write().expect("current_id lock poisoned");
            let old = guard.clone();
            *guard = new_id.clone();
            old
        };
        if old_id == new_id {
            return Ok(());
        }

        self.subscribe_always_on(&new_id).await?;

        let mut subs = self.inner.channel_subs.lock().await;
        for channel in [server_channel(&old_id), request_channel(&old_id), response_channel(&old_id)] {
            if let Some(id) = subs.remove(&channel) {
                if let Err(e) = self.inner.transport.unsubscribe(&channel, id).await {
                    warn!(channel = %channel, error = %e, "failed to unsubscribe old channel during rotation");
                }
            }
        }
        Ok(())
    }

    pub fn current_id(&self) -> String {
        self.inner.current_id()
    }

    pub fn is_healthy(&self) -> bool {
        self.inner.transport.is_connected()
    }

    /// Cancel pending requests with `BusShutdown`, unsubscribe from every
    /// channel this bus holds, and release resources.
    pub async fn shutdown(&self) {
        self.inner.shut_down.store(true, Ordering::SeqCst);

        let mut pending = self.inner.pending.lock().await;
        for (_, tx) in pending.drain() {
            let _ = tx.send(Err(FulcrumError::BusShutdown));
        }
        drop(pending);

        let mut subs = self.inner.channel_subs.lock().await;
        for (channel, id) in subs.drain() {
            if let Err(e) = self.inner.transport.unsubscribe(&channel, id).await {
                warn!(channel = %channel, error = %e, "failed to unsubscribe during shutdown");
            }
        }
        self.inner.handlers.write().await.clear();
    }
}

async fn dispatch_inbound(
    inner: Arc<Inner>,
    channel: &str,
    directed: Option<DirectedKind>,
    expected_id: &str,
    bytes: Vec<u8>,
) {
    // Server-id rotation: a dispatcher bound to an old directed channel is
    // dead weight the instant `current_id` no longer matches what it was
    // subscribed under, even before the transport-level unsubscribe lands.
    if directed.is_some() && inner.current_id() != expected_id {
        return;
    }

    let envelope = match Envelope::decode(&bytes) {
        Ok(e) => e,
        Err(e) => {
            warn!(channel, error = %e, "dropping malformed envelope");
            return;
        }
    };

    if let Some(_kind) = directed {
        if !is_registration_response_class(&envelope.type_name) {
            match inner
                .dedup
                .check_and_record(expected_id, &envelope.correlation_id, dedup_class_for(&envelope.type_name))
                .await
            {
                Ok(true) => {}
                Ok(false) => {
                    debug!(correlation_id = %envelope.correlation_id, "dropping duplicate envelope");
                    return;
                }
                Err(e) => {
                    warn!(error = %e, "dedup check failed, processing envelope anyway");
                }
            }
        }
    }

    match directed {
        Some(DirectedKind::Response) => complete_pending(&inner, envelope).await,
        Some(DirectedKind::Request) => dispatch_request(&inner, envelope).await,
        _ => dispatch_to_handlers(&inner, envelope).await,
    }
}

fn dedup_class_for(type_name: &str) -> DedupClass {
    if type_name.contains("registration") || type_name.contains("reregister") {
        DedupClass::Registration
    } else {
        DedupClass::Default
    }
}

async fn complete_pending(inner: &Arc<Inner>, envelope: Envelope) {
    let sender = inner.pending.lock().await.remove(&envelope.correlation_id);
    match sender {
        Some(tx) => {
            let _ = tx.send(Ok(envelope));
        }
        None => {
            debug!(correlation_id = %envelope.correlation_id, "no pending request for response, dropping");
        }
    }
}

async fn dispatch_request(inner: &Arc<Inner>, envelope: Envelope) {
    let handlers = inner.handlers.read().await.get(&envelope.type_name).cloned();
    match handlers {
        Some(list) if !list.is_empty() => {
            run_handlers(list, envelope).await;
        }
        _ => {
            let response_type = format!("{}_response", envelope.type_name);
            let payload = serde_json::json!({ "error": format!("No handler for {}", envelope.type_name) });
            let response = Envelope::response_to(&envelope, response_type, inner.current_id(), payload);
            if let Some(sender_id) = response.target_id.clone() {
                if let Err(e) = inner.transport.publish(&response_channel(&sender_id), response.encode()).await {
                    warn!(error = %e, "failed to publish synthesized no-handler response");
                }
            }
        }
    }
}

async fn dispatch_to_handlers(inner: &Arc<Inner>, envelope: Envelope) {
    let handlers = inner.handlers.read().await.get(&envelope.type_name).cloned();
    if let Some(list) = handlers {
        run_handlers(list, envelope).await;
    } else {
        debug!(type_name = %envelope.type_name, "no handler registered, dropping");
    }
}

async fn run_handlers(list: Vec<(HandlerToken, MessageHandler)>, envelope: Envelope) {
    for (_, handler) in list {
        let envelope = envelope.clone();
        let fut = handler(envelope);
        // spec.md §4.3: "Handler exceptions are caught, logged, and never
        // propagate to other handlers." Each handler runs in its own task
        // so a panic there can't take down the dispatch loop or siblings.
        let task = tokio::spawn(fut);
        tokio::spawn(async move {
            if let Err(e) = task.await {
                error!(error = %e, "handler task panicked");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::InMemoryTransport;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    async fn bus_pair() -> (MessageBus, MessageBus, Arc<InMemoryTransport>) {
        let transport = Arc::new(InMemoryTransport::new());
        let a = MessageBus::new(transport.clone(), "lobby-0", 60, 30).await.unwrap();
        let b = MessageBus::new(transport.clone(), "proxy-0", 60, 30).await.unwrap();
        (a, b, transport)
    }

    #[tokio::test]
    async fn broadcast_is_received_by_subscriber() {
        let (a, b, _t) = bus_pair().await;
        let received = Arc::new(AsyncMutex::new(Vec::new()));
        let received2 = received.clone();
        b.subscribe(
            "chat.message",
            Arc::new(move |env| {
                let received = received2.clone();
                Box::pin(async move {
                    received.lock().await.push(env.payload);
                })
            }),
        )
        .await
        .unwrap();

        a.broadcast("chat.message", serde_json::json!({"text": "hi"})).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(received.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn request_response_round_trip() {
        let (a, b, _t) = bus_pair().await;
        b.subscribe(
            "ping",
            Arc::new(|env| {
                Box::pin(async move {
                    // can't reach bus `a` from here directly in this simplified
                    // handler; exercised end-to-end below via `respond_on`.
                    let _ = env;
                })
            }),
        )
        .await
        .unwrap();

        // Re-register a handler that actually replies, using b to publish
        // the response on a's response channel.
        let b2 = b.clone();
        b.subscribe(
            "ping",
            Arc::new(move |env| {
                let b2 = b2.clone();
                Box::pin(async move {
                    let resp = Envelope::response_to(&env, "ping_response", b2.current_id(), serde_json::json!({"pong": true}));
                    let _ = b2
                        .inner
                        .transport
                        .publish(&response_channel(&resp.target_id.clone().unwrap()), resp.encode())
                        .await;
                })
            }),
        )
        .await
        .unwrap();

        let resp = a
            .request("proxy-0", "ping", serde_json::json!({}), Duration::from_millis(500))
            .await
            .unwrap();
        assert_eq!(resp.payload["pong"], true);
    }

    #[tokio::test]
    async fn request_times_out_with_no_handler() {
        let (a, _b, _t) = bus_pair().await;
        let err = a
            .request("ghost", "ping", serde_json::json!({}), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, FulcrumError::Timeout { .. }));
    }

    #[tokio::test]
    async fn request_channel_synthesizes_no_handler_response() {
        let (a, _b, _t) = bus_pair().await;
        // `_b` has no handler for "mystery"; request from `a` should come
        // back promptly with a synthesized error rather than timing out.
        let resp = a
            .request("proxy-0", "mystery", serde_json::json!({}), Duration::from_millis(500))
            .await
            .unwrap();
        assert_eq!(resp.type_name, "mystery_response");
        assert!(resp.payload["error"].as_str().unwrap().contains("No handler"));
    }

    #[tokio::test]
    async fn duplicate_correlation_id_is_delivered_once() {
        let (a, b, _t) = bus_pair().await;
        let count = Arc::new(AtomicU32::new(0));
        let count2 = count.clone();
        b.subscribe(
            "cmd",
            Arc::new(move |_env| {
                let count = count2.clone();
                Box::pin(async move {
                    count.fetch_add(1, Ordering::SeqCst);
                })
            }),
        )
        .await
        .unwrap();

        let envelope = Envelope::new("cmd", "lobby-0", Some("proxy-0".into()), serde_json::json!({}));
        let bytes = envelope.encode();
        a.inner.transport.publish(&server_channel("proxy-0"), bytes.clone()).await.unwrap();
        a.inner.transport.publish(&server_channel("proxy-0"), bytes).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unsubscribe_stops_future_dispatch() {
        let (a, b, _t) = bus_pair().await;
        let count = Arc::new(AtomicU32::new(0));
        let count2 = count.clone();
        let token = b
            .subscribe(
                "chat.message",
                Arc::new(move |_env| {
                    let count = count2.clone();
                    Box::pin(async move {
                        count.fetch_add(1, Ordering::SeqCst);
                    })
                }),
            )
            .await
            .unwrap();

        a.broadcast("chat.message", serde_json::json!({})).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        b.unsubscribe("chat.message", token).await;
        a.broadcast("chat.message", serde_json::json!({})).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn shutdown_fails_pending_requests() {
        let (a, _b, _t) = bus_pair().await;
        let a2 = a.clone();
        let handle = tokio::spawn(async move {
            a2.request("nobody", "ping", serde_json::json!({}), Duration::from_secs(5)).await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        a.shutdown().await;
        let result = handle.await.unwrap();
        assert!(matches!(result, Err(FulcrumError::BusShutdown)));
    }

    #[tokio::test]
    async fn rotate_server_id_moves_direct_channel() {
        let (a, b, _t) = bus_pair().await;
        a.rotate_server_id("lobby-7").await.unwrap();
        assert_eq!(a.current_id(), "lobby-7");

        let received = Arc::new(AsyncMutex::new(false));
        let received2 = received.clone();
        a.subscribe(
            "fulcrum.custom.ping-direct",
            Arc::new(move |_env| {
                let received = received2.clone();
                Box::pin(async move {
                    *received.lock().await = true;
                })
            }),
        )
        .await
        .unwrap();

        b.send("lobby-7", "fulcrum.custom.ping-direct", serde_json::json!({})).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(*received.lock().await);
    }
}
