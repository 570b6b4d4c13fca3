//! The Transport Adapter contract (C2, spec.md §4.2).
//!
//! `fulcrum-core` depends only on this trait, never on a concrete broker —
//! `fulcrum-transport-redis` provides the Redis-backed implementation, and
//! an in-memory implementation lives alongside it for tests that shouldn't
//! need a live broker. This mirrors the Design Notes' call to replace
//! global/singleton wiring with explicit dependency injection: a `Runtime`
//! is handed a `Arc<dyn Transport>` at construction.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::BoxFuture;

use crate::error::FulcrumError;

/// Opaque handle identifying one `subscribe` registration, returned so the
/// caller can `unsubscribe` the exact same registration later.
pub type SubscriptionId = u64;

/// A raw byte handler invoked by the transport's delivery path for every
/// message received on a channel it is subscribed to. Kept deliberately
/// low-level (bytes in, no envelope decoding) — `fulcrum-core`'s
/// `MessageBus` is the only thing that interprets bytes as envelopes; the
/// transport layer is payload-agnostic, matching spec.md §4.2's adapter
/// abstraction.
pub type RawHandler = Arc<dyn Fn(Vec<u8>) -> BoxFuture<'static, ()> + Send + Sync>;

/// A one-shot callback invoked once a `subscribe` call is observed ready by
/// the transport (spec.md §4.2: "the adapter reports ready by invoking a
/// one-shot callback once the subscription is observed").
pub type ReadyCallback = Box<dyn FnOnce() + Send>;

/// Abstracts a pub/sub + key-value store with TTL (spec.md §4.2). Every
/// operation but `publish` is asynchronous; `publish` itself does not block
/// on delivery (fire-and-forget at the transport level).
#[async_trait]
pub trait Transport: Send + Sync {
    /// Subscribe a raw handler to `channel`. Multiple handlers may share one
    /// channel. Asynchronous: the subscription is not guaranteed observed by
    /// the broker until `ready` fires.
    async fn subscribe(
        &self,
        channel: &str,
        handler: RawHandler,
        ready: Option<ReadyCallback>,
    ) -> Result<SubscriptionId, FulcrumError>;

    /// Stop delivering to the handler registered under `id` for `channel`.
    /// In-flight deliveries already dispatched may still complete.
    async fn unsubscribe(&self, channel: &str, id: SubscriptionId) -> Result<(), FulcrumError>;

    /// Publish `bytes` on `channel`. Best-effort; does not block on delivery.
    async fn publish(&self, channel: &str, bytes: Vec<u8>) -> Result<(), FulcrumError>;

    async fn set_with_ttl(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), FulcrumError>;

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, FulcrumError>;

    /// Delete zero or more keys. Deleting a missing key is not an error.
    async fn del(&self, keys: &[String]) -> Result<(), FulcrumError>;

    /// List keys matching `prefix` (a plain prefix, not a glob).
    async fn scan(&self, prefix: &str) -> Result<Vec<String>, FulcrumError>;

    /// Add `member` to the set stored at `key` (used for registry membership
    /// indices like `fulcrum:server_ids`).
    async fn set_add(&self, key: &str, member: &str) -> Result<(), FulcrumError>;

    /// Remove `member` from the set stored at `key`.
    async fn set_remove(&self, key: &str, member: &str) -> Result<(), FulcrumError>;

    /// All members of the set stored at `key`.
    async fn set_members(&self, key: &str) -> Result<Vec<String>, FulcrumError>;

    fn is_connected(&self) -> bool;
}
