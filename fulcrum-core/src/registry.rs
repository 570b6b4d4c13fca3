//! Server Registry (C5, spec.md §4.5).
//!
//! Holds the authoritative view of every live service in
//! `fulcrum:servers:<service_id>` (TTL ≈ 2× heartbeat interval) plus a
//! `fulcrum:server_ids` membership set, both held in the transport's
//! key-value store so every registry-role process (and any inspector) sees
//! the same state.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::FulcrumError;
use crate::identity::{ServiceStatus, ServiceType};
use crate::transport::Transport;

const SERVER_IDS_SET_KEY: &str = "fulcrum:server_ids";

fn server_key(service_id: &str) -> String {
    format!("fulcrum:servers:{service_id}")
}

/// spec.md §4.5: "for proxies, prefix `fulcrum-proxy-`; for game servers,
/// prefix `<family>-`."
fn id_prefix(service_type: ServiceType, family: &str) -> String {
    match service_type {
        ServiceType::Proxy => "fulcrum-proxy-".to_string(),
        _ => format!("{family}-"),
    }
}

/// A live service's registry record (spec.md §4.5).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerRecord {
    pub service_id: String,
    pub instance_uuid: String,
    pub service_type: ServiceType,
    pub role: String,
    pub family: String,
    pub address: String,
    pub port: u16,
    pub status: ServiceStatus,
    pub player_count: u32,
    pub max_capacity: u32,
    pub tps: f64,
    pub last_heartbeat_at: i64,
}

impl ServerRecord {
    fn load_factor(&self) -> f64 {
        let capacity_term = if self.max_capacity == 0 {
            1.0
        } else {
            self.player_count as f64 / self.max_capacity as f64
        };
        let tps_term = (20.0 - self.tps) / 20.0;
        0.6 * capacity_term + 0.4 * tps_term
    }

    fn is_healthy(&self) -> bool {
        self.tps >= 18.0 && self.player_count < self.max_capacity
    }
}

/// Input to [`ServerRegistry::register`].
#[derive(Debug, Clone)]
pub struct Registration {
    pub service_type: ServiceType,
    pub role: String,
    pub family: String,
    pub address: String,
    pub port: u16,
    pub instance_uuid: String,
    pub max_capacity: u32,
}

#[derive(Debug, Clone)]
pub enum RegisterOutcome {
    Success { service_id: String },
    Reclaimed { service_id: String },
    Failure { reason: String },
}

/// Aggregate counters exposed beyond spec.md's literal query list, for
/// operational visibility (a monitoring dashboard or CLI status command).
#[derive(Debug, Clone, Serialize)]
pub struct RegistryStats {
    pub total: usize,
    pub by_status: std::collections::BTreeMap<String, usize>,
    pub by_family: std::collections::BTreeMap<String, usize>,
}

pub struct ServerRegistry {
    transport: Arc<dyn Transport>,
    record_ttl: Duration,
}

impl ServerRegistry {
    pub fn new(transport: Arc<dyn Transport>, record_ttl_seconds: u64) -> Self {
        Self {
            transport,
            record_ttl: Duration::from_secs(record_ttl_seconds),
        }
    }

    fn allocate_id(&self, existing: &[String], prefix: &str) -> String {
        let mut taken = std::collections::BTreeSet::new();
        for id in existing {
            if let Some(rest) = id.strip_prefix(prefix) {
                if let Ok(n) = rest.parse::<u64>() {
                    taken.insert(n);
                }
            }
        }
        let mut n = 0u64;
        while taken.contains(&n) {
            n += 1;
        }
        format!("{prefix}{n}")
    }

    async fn load_record(&self, service_id: &str) -> Result<Option<ServerRecord>, FulcrumError> {
        match self.transport.get(&server_key(service_id)).await? {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| FulcrumError::MalformedEnvelope(e.to_string())),
            None => Ok(None),
        }
    }

    async fn store_record(&self, record: &ServerRecord) -> Result<(), FulcrumError> {
        let bytes = serde_json::to_vec(record).expect("ServerRecord is always JSON-representable");
        self.transport
            .set_with_ttl(&server_key(&record.service_id), bytes, self.record_ttl)
            .await?;
        self.transport.set_add(SERVER_IDS_SET_KEY, &record.service_id).await
    }

    /// spec.md §4.5: id collision is reclaimable if the existing record's
    /// `instance_uuid` matches the requester (a restart under the same
    /// instance) or its last heartbeat is older than 60 s (presumed dead);
    /// otherwise the id is genuinely in use and registration fails.
    pub async fn register(&self, registration: Registration) -> Result<RegisterOutcome, FulcrumError> {
        let prefix = id_prefix(registration.service_type, &registration.family);
        let existing_ids = self.transport.set_members(SERVER_IDS_SET_KEY).await?;
        let service_id = self.allocate_id(&existing_ids, &prefix);

        let reclaiming = match self.load_record(&service_id).await? {
            None => false,
            Some(existing) => {
                let stale = crate::envelope::now_ms() - existing.last_heartbeat_at > 60_000;
                if existing.instance_uuid == registration.instance_uuid || stale {
                    true
                } else {
                    return Ok(RegisterOutcome::Failure { reason: "id in use".into() });
                }
            }
        };

        let record = ServerRecord {
            service_id: service_id.clone(),
            instance_uuid: registration.instance_uuid,
            service_type: registration.service_type,
            role: registration.role,
            family: registration.family,
            address: registration.address,
            port: registration.port,
            status: ServiceStatus::Starting,
            player_count: 0,
            max_capacity: registration.max_capacity,
            tps: 20.0,
            last_heartbeat_at: crate::envelope::now_ms(),
        };
        self.store_record(&record).await?;
        info!(service_id = %service_id, reclaimed = reclaiming, "registered server");

        Ok(if reclaiming {
            RegisterOutcome::Reclaimed { service_id }
        } else {
            RegisterOutcome::Success { service_id }
        })
    }

    pub async fn update_status(&self, service_id: &str, status: ServiceStatus) -> Result<bool, FulcrumError> {
        match self.load_record(service_id).await? {
            Some(mut record) => {
                record.status = status;
                self.store_record(&record).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub async fn heartbeat(
        &self,
        service_id: &str,
        player_count: u32,
        tps: f64,
    ) -> Result<bool, FulcrumError> {
        match self.load_record(service_id).await? {
            Some(mut record) => {
                record.player_count = player_count;
                record.tps = tps;
                record.last_heartbeat_at = crate::envelope::now_ms();
                self.store_record(&record).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub async fn get_server(&self, service_id: &str) -> Result<Option<ServerRecord>, FulcrumError> {
        self.load_record(service_id).await
    }

    pub async fn list_all(&self) -> Result<Vec<ServerRecord>, FulcrumError> {
        let ids = self.transport.set_members(SERVER_IDS_SET_KEY).await?;
        let mut records = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(record) = self.load_record(&id).await? {
                records.push(record);
            }
        }
        Ok(records)
    }

    pub async fn list_by_family(&self, family: &str) -> Result<Vec<ServerRecord>, FulcrumError> {
        Ok(self.list_all().await?.into_iter().filter(|r| r.family == family).collect())
    }

    pub async fn list_by_type(&self, service_type: ServiceType) -> Result<Vec<ServerRecord>, FulcrumError> {
        Ok(self
            .list_all()
            .await?
            .into_iter()
            .filter(|r| r.service_type == service_type)
            .collect())
    }

    pub async fn list_by_status(&self, status: ServiceStatus) -> Result<Vec<ServerRecord>, FulcrumError> {
        Ok(self.list_all().await?.into_iter().filter(|r| r.status == status).collect())
    }

    pub async fn unregister(&self, service_id: &str) -> Result<(), FulcrumError> {
        self.transport.del(&[server_key(service_id)]).await?;
        self.transport.set_remove(SERVER_IDS_SET_KEY, service_id).await
    }

    /// Scans every record and marks any whose last heartbeat exceeds
    /// `timeout_seconds` as `OFFLINE`, returning the affected ids.
    pub async fn check_crashed(&self, timeout_seconds: u64) -> Result<Vec<String>, FulcrumError> {
        let threshold_ms = (timeout_seconds * 1000) as i64;
        let now = crate::envelope::now_ms();
        let mut crashed = Vec::new();
        for mut record in self.list_all().await? {
            if now - record.last_heartbeat_at > threshold_ms {
                record.status = ServiceStatus::Offline;
                self.store_record(&record).await?;
                crashed.push(record.service_id.clone());
                warn!(service_id = %record.service_id, "server marked crashed");
            }
        }
        Ok(crashed)
    }

    /// Lowest-load-factor record of `family` that is registered, not
    /// crashed, and currently healthy.
    pub async fn best_server(&self, family: &str) -> Result<Option<ServerRecord>, FulcrumError> {
        let mut candidates: Vec<ServerRecord> = self
            .list_by_family(family)
            .await?
            .into_iter()
            .filter(|r| r.status != ServiceStatus::Offline && r.is_healthy())
            .collect();
        candidates.sort_by(|a, b| a.load_factor().partial_cmp(&b.load_factor()).unwrap());
        Ok(candidates.into_iter().next())
    }

    pub async fn stats(&self) -> Result<RegistryStats, FulcrumError> {
        let records = self.list_all().await?;
        let mut by_status = std::collections::BTreeMap::new();
        let mut by_family = std::collections::BTreeMap::new();
        for record in &records {
            *by_status.entry(format!("{:?}", record.status)).or_insert(0) += 1;
            *by_family.entry(record.family.clone()).or_insert(0) += 1;
        }
        Ok(RegistryStats {
            total: records.len(),
            by_status,
            by_family,
        })
    }
}
