//! Service Identity and Service Metadata (spec.md §3).
//!
//! Identity is immutable after the `service_id` single-assignment on
//! successful registration ("Mutable-after-construction identity" in the
//! Design Notes is modeled as an immutable tuple plus a single-assignment
//! cell, not a setter method).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ServiceType {
    Proxy,
    Server,
    Registry,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ServiceStatus {
    Starting,
    Registering,
    Available,
    Full,
    Evacuating,
    Stopping,
    Stopped,
    Unresponsive,
    Maintenance,
    /// Set by `ServerRegistry::check_crashed` (spec.md §4.5); not a
    /// state the lifecycle FSM itself transitions through.
    Offline,
}

fn new_temp_id() -> String {
    let raw = Uuid::new_v4().simple().to_string();
    format!("temp-{}", &raw[..8])
}

/// Immutable facts about a service, fixed for the process lifetime except
/// for the single `service_id` assignment at registration.
#[derive(Debug)]
pub struct ServiceIdentity {
    temp_id: String,
    service_id: RwLock<Option<String>>,
    registered: AtomicBool,
    pub service_type: ServiceType,
    pub role: String,
    pub address: String,
    pub port: u16,
    pub instance_uuid: String,
    pub started_at: i64,
}

impl ServiceIdentity {
    pub fn new(service_type: ServiceType, role: impl Into<String>, address: impl Into<String>, port: u16) -> Self {
        Self {
            temp_id: new_temp_id(),
            service_id: RwLock::new(None),
            registered: AtomicBool::new(false),
            service_type,
            role: role.into(),
            address: address.into(),
            port,
            instance_uuid: Uuid::new_v4().to_string(),
            started_at: crate::envelope::now_ms(),
        }
    }

    pub fn temp_id(&self) -> &str {
        &self.temp_id
    }

    /// The permanent id, if registration has completed.
    pub fn service_id(&self) -> Option<String> {
        self.service_id.read().expect("identity lock poisoned").clone()
    }

    /// The id to address this service by right now: the permanent id once
    /// assigned, the temp id until then.
    pub fn current_id(&self) -> String {
        self.service_id().unwrap_or_else(|| self.temp_id.clone())
    }

    pub fn is_registered(&self) -> bool {
        self.registered.load(Ordering::Acquire)
    }

    /// Single assignment: once set, further calls are no-ops. Returns
    /// whether this call performed the assignment (false if already set).
    pub fn assign_service_id(&self, service_id: impl Into<String>) -> bool {
        if self.registered.swap(true, Ordering::AcqRel) {
            return false;
        }
        *self.service_id.write().expect("identity lock poisoned") = Some(service_id.into());
        true
    }
}

/// Mutable runtime state for a service (spec.md §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceMetadata {
    pub status: ServiceStatus,
    pub player_count: u32,
    pub max_capacity: u32,
    pub tps: f64,
    pub last_heartbeat_at: i64,
    #[serde(default)]
    pub properties: std::collections::BTreeMap<String, serde_json::Value>,
}

impl ServiceMetadata {
    pub fn new(max_capacity: u32) -> Self {
        Self {
            status: ServiceStatus::Starting,
            player_count: 0,
            max_capacity,
            tps: 20.0,
            last_heartbeat_at: crate::envelope::now_ms(),
            properties: Default::default(),
        }
    }

    /// `0.6·(players/max) + 0.4·((20−tps)/20)` (spec.md glossary).
    pub fn load_factor(&self) -> f64 {
        let capacity_term = if self.max_capacity == 0 {
            1.0
        } else {
            self.player_count as f64 / self.max_capacity as f64
        };
        let tps_term = (20.0 - self.tps) / 20.0;
        0.6 * capacity_term + 0.4 * tps_term
    }

    /// `tps ≥ 18 ∧ players < max` (spec.md glossary).
    pub fn is_healthy(&self) -> bool {
        self.tps >= 18.0 && self.player_count < self.max_capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn temp_id_has_expected_shape() {
        let id = ServiceIdentity::new(ServiceType::Server, "lobby", "127.0.0.1", 25565);
        assert!(id.temp_id().starts_with("temp-"));
        assert_eq!(id.temp_id().len(), "temp-".len() + 8);
        assert!(!id.is_registered());
        assert_eq!(id.current_id(), id.temp_id());
    }

    #[test]
    fn assign_service_id_is_single_assignment() {
        let id = ServiceIdentity::new(ServiceType::Server, "lobby", "127.0.0.1", 25565);
        assert!(id.assign_service_id("lobby-0"));
        assert!(id.is_registered());
        assert_eq!(id.service_id().as_deref(), Some("lobby-0"));
        // Second assignment is a no-op; the id never changes afterward.
        assert!(!id.assign_service_id("lobby-7"));
        assert_eq!(id.service_id().as_deref(), Some("lobby-0"));
        assert_eq!(id.current_id(), "lobby-0");
    }

    #[test]
    fn load_factor_and_healthy() {
        let mut meta = ServiceMetadata::new(100);
        meta.player_count = 60;
        meta.tps = 20.0;
        assert!((meta.load_factor() - 0.36).abs() < 1e-9);
        assert!(meta.is_healthy());

        meta.tps = 10.0;
        assert!(!meta.is_healthy());
    }
}
