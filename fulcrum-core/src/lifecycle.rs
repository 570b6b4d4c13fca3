//! Service Lifecycle Manager (C4, spec.md §4.4).
//!
//! Drives a service through `STARTING → REGISTERING → AVAILABLE ⇄ FULL →
//! EVACUATING → STOPPING → STOPPED`, with a `MAINTENANCE` branch reachable
//! from `AVAILABLE`/`FULL` and returning to `AVAILABLE`. `UNRESPONSIVE` and
//! `OFFLINE` are set by the registry (`ServerRegistry::check_crashed`), not
//! transitioned through here.

use std::sync::{Arc, RwLock as StdRwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{oneshot, Mutex as AsyncMutex, Notify};
use tracing::{info, warn};

use crate::bus::MessageBus;
use crate::config::FulcrumConfig;
use crate::error::FulcrumError;
use crate::identity::{ServiceIdentity, ServiceMetadata, ServiceStatus};

const REGISTRATION_REQUEST_TYPE: &str = "fulcrum.registry.registration.request";
const REGISTRATION_RESPONSE_TYPE: &str = crate::bus::REGISTRATION_RESPONSE_TYPE;
const REREGISTER_GLOBAL_TYPE: &str = "fulcrum.registry.reregister.request";
const EVACUATION_REQUEST_TYPE: &str = "fulcrum.server.evacuation.request";
const EVACUATION_RESPONSE_TYPE: &str = "fulcrum.server.evacuation.response";
const REMOVAL_NOTIFICATION_TYPE: &str = "fulcrum.registry.server.removed";
const HEARTBEAT_TYPE: &str = "fulcrum.server.heartbeat";
const ANNOUNCEMENT_TYPE: &str = "fulcrum.server.announcement";

fn reregister_targeted_type(id: &str) -> String {
    format!("fulcrum.server.{id}.reregister")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ServiceRegistrationAck {
    #[serde(rename = "tempId")]
    temp_id: String,
    accepted: bool,
    #[serde(rename = "serviceId")]
    service_id: Option<String>,
    reason: Option<String>,
}

/// Hooks a caller can supply into the lifecycle state machine. All are
/// plain synchronous callbacks invoked from inside the manager's own async
/// tasks — long-running work inside one should be spawned separately.
#[derive(Default, Clone)]
pub struct LifecycleCallbacks {
    pub on_started: Option<Arc<dyn Fn() + Send + Sync>>,
    pub on_registration_success: Option<Arc<dyn Fn(&str) + Send + Sync>>,
    pub on_registration_failure: Option<Arc<dyn Fn(&FulcrumError) + Send + Sync>>,
    /// Invoked immediately before each heartbeat is composed, with the
    /// metadata about to be sent, so the owner can refresh player count and
    /// tick rate just-in-time.
    pub on_heartbeat: Option<Arc<dyn Fn(&mut ServiceMetadata) + Send + Sync>>,
    pub on_shutdown: Option<Arc<dyn Fn() + Send + Sync>>,
    pub on_stopped: Option<Arc<dyn Fn() + Send + Sync>>,
}

/// Table of state transitions this manager drives directly (spec.md §4.4).
/// `UNRESPONSIVE`/`OFFLINE` are excluded — those are registry-observed,
/// never self-transitioned.
fn is_allowed_transition(from: ServiceStatus, to: ServiceStatus) -> bool {
    use ServiceStatus::*;
    matches!(
        (from, to),
        (Starting, Registering)
            | (Registering, Available)
            | (Available, Full)
            | (Full, Available)
            | (Available, Evacuating)
            | (Full, Evacuating)
            | (Available, Maintenance)
            | (Full, Maintenance)
            | (Maintenance, Available)
            | (Evacuating, Stopping)
            | (Available, Stopping)
            | (Registering, Stopping)
            | (Stopping, Stopped)
    )
}

pub struct LifecycleManager {
    bus: MessageBus,
    identity: Arc<ServiceIdentity>,
    metadata: Arc<AsyncMutex<ServiceMetadata>>,
    config: FulcrumConfig,
    callbacks: LifecycleCallbacks,
    status: StdRwLock<ServiceStatus>,
    registration_waiter: AsyncMutex<Option<oneshot::Sender<ServiceRegistrationAck>>>,
    shutdown_notify: Notify,
}

impl LifecycleManager {
    pub fn new(
        bus: MessageBus,
        identity: Arc<ServiceIdentity>,
        metadata: Arc<AsyncMutex<ServiceMetadata>>,
        config: FulcrumConfig,
        callbacks: LifecycleCallbacks,
    ) -> Arc<Self> {
        Arc::new(Self {
            bus,
            identity,
            metadata,
            config,
            callbacks,
            status: StdRwLock::new(ServiceStatus::Starting),
            registration_waiter: AsyncMutex::new(None),
            shutdown_notify: Notify::new(),
        })
    }

    pub fn status(&self) -> ServiceStatus {
        *self.status.read().expect("status lock poisoned")
    }

    /// Drive a local transition, rejecting ones the state machine doesn't
    /// permit. `UNRESPONSIVE`/`OFFLINE` are never requested through here.
    fn transition(&self, to: ServiceStatus) -> Result<(), FulcrumError> {
        let mut guard = self.status.write().expect("status lock poisoned");
        if !is_allowed_transition(*guard, to) {
            warn!(from = ?*guard, to = ?to, "rejected lifecycle transition");
            return Err(FulcrumError::MalformedEnvelope(format!(
                "illegal lifecycle transition {:?} -> {:?}",
                *guard, to
            )));
        }
        info!(from = ?*guard, to = ?to, "lifecycle transition");
        *guard = to;
        Ok(())
    }

    /// Subscribe the response/reregister handlers, run registration to
    /// completion, then start the heartbeat loop. Returns once the service
    /// is `AVAILABLE` (or registration has permanently failed).
    pub async fn start(self: &Arc<Self>) -> Result<(), FulcrumError> {
        if let Some(cb) = &self.callbacks.on_started {
            cb();
        }

        let this = self.clone();
        self.bus
            .subscribe(
                REGISTRATION_RESPONSE_TYPE,
                Arc::new(move |env| {
                    let this = this.clone();
                    Box::pin(async move { this.handle_registration_response(env).await })
                }),
            )
            .await?;

        let this = self.clone();
        self.bus
            .subscribe(
                REREGISTER_GLOBAL_TYPE,
                Arc::new(move |_env| {
                    let this = this.clone();
                    Box::pin(async move { this.handle_reregister_request().await })
                }),
            )
            .await?;
        self.subscribe_targeted_reregister(self.identity.temp_id()).await?;

        let this = self.clone();
        self.bus
            .subscribe(
                EVACUATION_REQUEST_TYPE,
                Arc::new(move |env| {
                    let this = this.clone();
                    Box::pin(async move { this.handle_evacuation_request(env).await })
                }),
            )
            .await?;

        self.transition(ServiceStatus::Registering)?;
        self.register().await?;
        self.transition(ServiceStatus::Available)?;
        let max_capacity = self.metadata.lock().await.max_capacity;
        self.bus
            .broadcast(
                ANNOUNCEMENT_TYPE,
                serde_json::json!({
                    "serviceId": self.identity.current_id(),
                    // `family` mirrors `role` (identity.rs has no separate
                    // family field; spec.md glossary treats them as
                    // interchangeable), matching `runtime.rs::parse_registration`.
                    "family": self.identity.role,
                    "role": self.identity.role,
                    "maxCapacity": max_capacity,
                }),
            )
            .await?;

        let this = self.clone();
        tokio::spawn(async move { this.run_heartbeat_loop().await });

        Ok(())
    }

    async fn subscribe_targeted_reregister(self: &Arc<Self>, id: &str) -> Result<(), FulcrumError> {
        let this = self.clone();
        self.bus
            .subscribe(
                reregister_targeted_type(id),
                Arc::new(move |_env| {
                    let this = this.clone();
                    Box::pin(async move { this.handle_reregister_request().await })
                }),
            )
            .await?;
        Ok(())
    }

    async fn handle_evacuation_request(self: &Arc<Self>, env: crate::envelope::Envelope) {
        if env.payload.get("serviceId").and_then(|v| v.as_str()) != Some(self.identity.current_id().as_str()) {
            return;
        }
        if let Err(e) = self.begin_evacuation().await {
            warn!(error = %e, "failed to enter evacuation");
            return;
        }
        let _ = self
            .bus
            .broadcast(
                EVACUATION_RESPONSE_TYPE,
                serde_json::json!({ "serviceId": self.identity.current_id(), "accepted": true }),
            )
            .await;
    }

    async fn handle_registration_response(self: &Arc<Self>, env: crate::envelope::Envelope) {
        if env.payload.get("tempId").and_then(|v| v.as_str()) != Some(self.identity.temp_id()) {
            return;
        }
        let ack: ServiceRegistrationAck = match serde_json::from_value(env.payload.clone()) {
            Ok(ack) => ack,
            Err(e) => {
                warn!(error = %e, "malformed registration ack, ignoring");
                return;
            }
        };
        if let Some(tx) = self.registration_waiter.lock().await.take() {
            let _ = tx.send(ack);
        }
    }

    /// spec.md §4.4: "on either event, resend the registration request
    /// and, if already registered, send an immediate heartbeat."
    async fn handle_reregister_request(self: &Arc<Self>) {
        if let Err(e) = self.reregister().await {
            warn!(error = %e, "re-registration failed");
        }
        if self.identity.is_registered() {
            self.send_heartbeat().await;
        }
    }

    /// Re-announce the identity. Because `service_id` is single-assignment
    /// (spec.md §3), a registry ack naming a *different* id than the one
    /// already held is a conflict, not a new identity — the second
    /// `assign_service_id` call is a no-op and we surface the mismatch
    /// through `on_registration_failure` rather than adopting it.
    async fn reregister(self: &Arc<Self>) -> Result<(), FulcrumError> {
        let ack = self.attempt_registration_once().await?;
        self.apply_ack(&ack).await
    }

    async fn register(self: &Arc<Self>) -> Result<(), FulcrumError> {
        let mut last_err = None;
        for attempt in 1..=self.config.registration_max_attempts {
            match self.attempt_registration_once().await {
                Ok(ack) => {
                    return match self.apply_ack(&ack).await {
                        Ok(()) => Ok(()),
                        Err(e) => {
                            if let Some(cb) = &self.callbacks.on_registration_failure {
                                cb(&e);
                            }
                            Err(e)
                        }
                    };
                }
                Err(e) => {
                    warn!(attempt, error = %e, "registration attempt failed");
                    last_err = Some(e);
                    tokio::time::sleep(Duration::from_millis(self.config.registration_retry_delay_ms)).await;
                }
            }
        }
        let err = last_err.unwrap_or(FulcrumError::TransportUnavailable("registry unreachable".into()));
        if let Some(cb) = &self.callbacks.on_registration_failure {
            cb(&err);
        }
        Err(err)
    }

    async fn apply_ack(self: &Arc<Self>, ack: &ServiceRegistrationAck) -> Result<(), FulcrumError> {
        if !ack.accepted {
            return Err(FulcrumError::MalformedEnvelope(
                ack.reason.clone().unwrap_or_else(|| "registration rejected".into()),
            ));
        }
        let service_id = ack
            .service_id
            .clone()
            .ok_or_else(|| FulcrumError::MalformedEnvelope("accepted ack missing serviceId".into()))?;

        let assigned = self.identity.assign_service_id(service_id.clone());
        if !assigned && self.identity.service_id().as_deref() != Some(service_id.as_str()) {
            return Err(FulcrumError::IdentityConflict { service_id });
        }
        if assigned {
            self.bus.rotate_server_id(service_id.clone()).await?;
            // The fixed four channels migrate automatically via
            // `rotate_server_id`; the targeted reregister channel is keyed
            // by id too but isn't one of those four, so it needs its own
            // subscription under the new id.
            self.subscribe_targeted_reregister(&service_id).await?;
        }
        if let Some(cb) = &self.callbacks.on_registration_success {
            cb(&service_id);
        }
        Ok(())
    }

    async fn attempt_registration_once(&self) -> Result<ServiceRegistrationAck, FulcrumError> {
        let (tx, rx) = oneshot::channel();
        *self.registration_waiter.lock().await = Some(tx);

        let metadata = self.metadata.lock().await.clone();
        let payload = serde_json::json!({
            "tempId": self.identity.temp_id(),
            "currentId": self.identity.current_id(),
            "serviceType": self.identity.service_type,
            "role": self.identity.role,
            "address": self.identity.address,
            "port": self.identity.port,
            "instanceUuid": self.identity.instance_uuid,
            "metadata": metadata,
        });
        self.bus.broadcast(REGISTRATION_REQUEST_TYPE, payload).await?;

        match tokio::time::timeout(Duration::from_millis(self.config.registration_timeout_ms), rx).await {
            Ok(Ok(ack)) => Ok(ack),
            Ok(Err(_)) => Err(FulcrumError::Timeout {
                target: "registry".into(),
                elapsed_ms: self.config.registration_timeout_ms,
            }),
            Err(_elapsed) => {
                self.registration_waiter.lock().await.take();
                Err(FulcrumError::Timeout {
                    target: "registry".into(),
                    elapsed_ms: self.config.registration_timeout_ms,
                })
            }
        }
    }

    /// Fires immediately on entering `AVAILABLE`, then every
    /// `heartbeat_interval_ms` until shutdown is signaled.
    async fn run_heartbeat_loop(self: Arc<Self>) {
        loop {
            self.send_heartbeat().await;
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(self.config.heartbeat_interval_ms)) => {}
                _ = self.shutdown_notify.notified() => return,
            }
        }
    }

    async fn send_heartbeat(&self) {
        if !self.bus.is_healthy() {
            warn!("skipping heartbeat, transport unavailable");
            return;
        }
        let snapshot = {
            let mut guard = self.metadata.lock().await;
            guard.last_heartbeat_at = crate::envelope::now_ms();
            if let Some(cb) = &self.callbacks.on_heartbeat {
                cb(&mut guard);
            }
            guard.clone()
        };
        let payload = serde_json::json!({
            "serviceId": self.identity.current_id(),
            "metadata": snapshot,
        });
        if let Err(e) = self.bus.broadcast(HEARTBEAT_TYPE, payload).await {
            warn!(error = %e, "heartbeat publish failed");
        }
    }

    pub async fn begin_evacuation(&self) -> Result<(), FulcrumError> {
        self.transition(ServiceStatus::Evacuating)
    }

    pub async fn enter_maintenance(&self) -> Result<(), FulcrumError> {
        self.transition(ServiceStatus::Maintenance)
    }

    pub async fn leave_maintenance(&self) -> Result<(), FulcrumError> {
        self.transition(ServiceStatus::Available)
    }

    pub async fn mark_full(&self) -> Result<(), FulcrumError> {
        self.transition(ServiceStatus::Full)
    }

    pub async fn mark_available(&self) -> Result<(), FulcrumError> {
        self.transition(ServiceStatus::Available)
    }

    /// Graceful shutdown: stop the heartbeat loop, give in-flight work up
    /// to 5 seconds to settle, then transition to `STOPPED` regardless.
    pub async fn shutdown(&self) -> Result<(), FulcrumError> {
        // Shutdown can be requested from REGISTERING/AVAILABLE in an
        // emergency as well as the normal EVACUATING path; tolerate
        // whichever state we're already in rather than requiring
        // evacuation first.
        let _ = self.transition(ServiceStatus::Stopping);

        if let Some(cb) = &self.callbacks.on_shutdown {
            cb();
        }
        self.shutdown_notify.notify_waiters();

        self.bus
            .broadcast(
                REMOVAL_NOTIFICATION_TYPE,
                serde_json::json!({
                    "serviceId": self.identity.current_id(),
                    "serviceType": self.identity.service_type,
                    "reason": "SHUTDOWN",
                }),
            )
            .await?;
        {
            let mut guard = self.metadata.lock().await;
            guard.status = ServiceStatus::Stopped;
        }
        self.send_heartbeat().await;

        tokio::time::sleep(Duration::from_secs(5)).await;
        self.transition(ServiceStatus::Stopped)?;
        if let Some(cb) = &self.callbacks.on_stopped {
            cb();
        }
        self.bus.shutdown().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::ServiceType;
    use crate::testing::InMemoryTransport;
    use std::sync::atomic::{AtomicBool, Ordering};

    async fn run_fake_registry(bus: MessageBus, assigned_id: &'static str, accept: bool) {
        bus.subscribe(
            REGISTRATION_REQUEST_TYPE,
            Arc::new(move |env| {
                let bus = bus.clone();
                Box::pin(async move {
                    let temp_id = env.payload["tempId"].as_str().unwrap().to_string();
                    let payload = serde_json::json!({
                        "tempId": temp_id,
                        "accepted": accept,
                        "serviceId": if accept { Some(assigned_id) } else { None },
                        "reason": if accept { None } else { Some("full") },
                    });
                    let _ = bus.broadcast(REGISTRATION_RESPONSE_TYPE, payload).await;
                })
            }),
        )
        .await
        .unwrap();
    }

    fn fast_config() -> FulcrumConfig {
        let mut cfg = FulcrumConfig::default();
        cfg.registration_timeout_ms = 200;
        cfg.registration_retry_delay_ms = 10;
        cfg.registration_max_attempts = 3;
        cfg.heartbeat_interval_ms = 20;
        cfg
    }

    #[tokio::test]
    async fn registration_success_transitions_to_available() {
        let transport = Arc::new(InMemoryTransport::new());
        let identity = Arc::new(ServiceIdentity::new(ServiceType::Server, "lobby", "127.0.0.1", 25565));
        let metadata = Arc::new(AsyncMutex::new(ServiceMetadata::new(100)));

        let registry_bus = MessageBus::new(transport.clone(), "registry", 60, 30).await.unwrap();
        run_fake_registry(registry_bus, "lobby-3", true).await;

        let bus = MessageBus::new(transport.clone(), identity.temp_id().to_string(), 60, 30)
            .await
            .unwrap();
        let manager = LifecycleManager::new(bus, identity.clone(), metadata, fast_config(), LifecycleCallbacks::default());
        manager.start().await.unwrap();

        assert_eq!(manager.status(), ServiceStatus::Available);
        assert_eq!(identity.service_id().as_deref(), Some("lobby-3"));
    }

    #[tokio::test]
    async fn registration_rejected_retries_then_fails() {
        let transport = Arc::new(InMemoryTransport::new());
        let identity = Arc::new(ServiceIdentity::new(ServiceType::Server, "lobby", "127.0.0.1", 25565));
        let metadata = Arc::new(AsyncMutex::new(ServiceMetadata::new(100)));

        let registry_bus = MessageBus::new(transport.clone(), "registry", 60, 30).await.unwrap();
        run_fake_registry(registry_bus, "lobby-3", false).await;

        let bus = MessageBus::new(transport.clone(), identity.temp_id().to_string(), 60, 30)
            .await
            .unwrap();
        let failed = Arc::new(AtomicBool::new(false));
        let failed2 = failed.clone();
        let callbacks = LifecycleCallbacks {
            on_registration_failure: Some(Arc::new(move |_e| {
                failed2.store(true, Ordering::SeqCst);
            })),
            ..Default::default()
        };
        let manager = LifecycleManager::new(bus, identity.clone(), metadata, fast_config(), callbacks);
        let result = manager.start().await;
        assert!(result.is_err());
        assert!(failed.load(Ordering::SeqCst));
        assert_eq!(manager.status(), ServiceStatus::Registering);
    }

    #[tokio::test]
    async fn heartbeat_invokes_pre_heartbeat_hook() {
        let transport = Arc::new(InMemoryTransport::new());
        let identity = Arc::new(ServiceIdentity::new(ServiceType::Server, "lobby", "127.0.0.1", 25565));
        let metadata = Arc::new(AsyncMutex::new(ServiceMetadata::new(100)));

        let registry_bus = MessageBus::new(transport.clone(), "registry", 60, 30).await.unwrap();
        run_fake_registry(registry_bus, "lobby-9", true).await;

        let bus = MessageBus::new(transport.clone(), identity.temp_id().to_string(), 60, 30)
            .await
            .unwrap();

        let hits = Arc::new(std::sync::atomic::AtomicU32::new(0));
        let hits2 = hits.clone();
        let callbacks = LifecycleCallbacks {
            on_heartbeat: Some(Arc::new(move |meta| {
                meta.player_count += 1;
                hits2.fetch_add(1, Ordering::SeqCst);
            })),
            ..Default::default()
        };
        let manager = LifecycleManager::new(bus, identity, metadata.clone(), fast_config(), callbacks);
        manager.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(hits.load(Ordering::SeqCst) >= 1);
        assert!(metadata.lock().await.player_count >= 1);
    }

    #[test]
    fn illegal_transition_is_rejected() {
        assert!(!is_allowed_transition(ServiceStatus::Starting, ServiceStatus::Available));
        assert!(is_allowed_transition(ServiceStatus::Starting, ServiceStatus::Registering));
        assert!(is_allowed_transition(ServiceStatus::Maintenance, ServiceStatus::Available));
    }
}
