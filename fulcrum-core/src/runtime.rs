//! Root composition (Design Notes: "replace global/singleton wiring with
//! explicit dependency injection").
//!
//! `Runtime` wires a `Transport` into a `MessageBus`, `ServiceIdentity`,
//! `LifecycleManager`, and (for proxies) a `PlayerRouter`, constructed
//! explicitly by the entrypoint rather than reached for through statics.
//! `RegistryRuntime` is the counterpart for the process that plays the
//! registry role: it has no lifecycle of its own to run (the registry
//! does not register with itself) and instead answers the lifecycle
//! protocol's wire messages by driving a `ServerRegistry`.

use std::sync::Arc;

use tokio::sync::Mutex as AsyncMutex;
use tracing::warn;

use crate::bus::MessageBus;
use crate::config::FulcrumConfig;
use crate::error::FulcrumError;
use crate::identity::{ServiceIdentity, ServiceMetadata, ServiceStatus, ServiceType};
use crate::lifecycle::{LifecycleCallbacks, LifecycleManager};
use crate::registry::{RegisterOutcome, Registration, ServerRegistry};
use crate::router::{Connector, Kicker, PlayerRouter};
use crate::transport::Transport;

const REGISTRATION_REQUEST_TYPE: &str = "fulcrum.registry.registration.request";
const REREGISTER_GLOBAL_TYPE: &str = "fulcrum.registry.reregister.request";
const REMOVAL_NOTIFICATION_TYPE: &str = "fulcrum.registry.server.removed";
const HEARTBEAT_TYPE: &str = "fulcrum.server.heartbeat";

const REGISTRY_BUS_ID: &str = "registry";

/// Runtime for a `Server` or `Proxy` process: identity, bus, lifecycle, and
/// (for proxies) the player router, all constructed up front.
pub struct Runtime {
    pub bus: MessageBus,
    pub identity: Arc<ServiceIdentity>,
    pub metadata: Arc<AsyncMutex<ServiceMetadata>>,
    pub lifecycle: Arc<LifecycleManager>,
    pub router: Option<Arc<PlayerRouter>>,
    pub config: FulcrumConfig,
}

impl Runtime {
    /// Build every always-needed piece without starting any of them (no
    /// registration request sent, no channels subscribed beyond what
    /// `MessageBus::new` always does). Call [`start`](Self::start) once the
    /// caller is ready to register and begin heartbeating. Proxies get a
    /// default connector/kicker pair that always succeeds; use
    /// [`with_router`](Self::with_router) to inject the real ones.
    pub async fn new(
        transport: Arc<dyn Transport>,
        service_type: ServiceType,
        role: impl Into<String>,
        address: impl Into<String>,
        port: u16,
        max_capacity: u32,
        config: FulcrumConfig,
        callbacks: LifecycleCallbacks,
    ) -> Result<Arc<Self>, FulcrumError> {
        Self::build(
            transport,
            service_type,
            role,
            address,
            port,
            max_capacity,
            config,
            callbacks,
            default_connector(),
            default_kicker(),
        )
        .await
    }

    /// Like [`new`](Self::new), but for a proxy with an explicit
    /// connector/kicker pair for the player router (production entrypoints
    /// inject the real plugin-message transport here; tests inject a
    /// double). `service_type` is always `Proxy`.
    pub async fn with_router(
        transport: Arc<dyn Transport>,
        role: impl Into<String>,
        address: impl Into<String>,
        port: u16,
        config: FulcrumConfig,
        callbacks: LifecycleCallbacks,
        connector: Connector,
        kicker: Kicker,
    ) -> Result<Arc<Self>, FulcrumError> {
        Self::build(
            transport,
            ServiceType::Proxy,
            role,
            address,
            port,
            0,
            config,
            callbacks,
            connector,
            kicker,
        )
        .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn build(
        transport: Arc<dyn Transport>,
        service_type: ServiceType,
        role: impl Into<String>,
        address: impl Into<String>,
        port: u16,
        max_capacity: u32,
        config: FulcrumConfig,
        callbacks: LifecycleCallbacks,
        connector: Connector,
        kicker: Kicker,
    ) -> Result<Arc<Self>, FulcrumError> {
        let identity = Arc::new(ServiceIdentity::new(service_type, role, address, port));
        let metadata = Arc::new(AsyncMutex::new(ServiceMetadata::new(max_capacity)));

        let bus = MessageBus::new(
            transport,
            identity.temp_id().to_string(),
            config.dedup_ttl_seconds,
            config.registration_dedup_ttl_seconds,
        )
        .await?;

        let router = if service_type == ServiceType::Proxy {
            Some(PlayerRouter::new(bus.clone(), identity.current_id(), connector, kicker))
        } else {
            None
        };

        // spec.md §4.6 "Failure model": when this proxy's permanent id is
        // assigned, the router must resubscribe its route channel under
        // the new id. Chain onto whatever success hook the caller supplied
        // rather than replacing it.
        let callbacks = if let Some(router) = router.clone() {
            let user_hook = callbacks.on_registration_success.clone();
            LifecycleCallbacks {
                on_registration_success: Some(Arc::new(move |service_id: &str| {
                    if let Some(hook) = &user_hook {
                        hook(service_id);
                    }
                    let router = router.clone();
                    let service_id = service_id.to_string();
                    tokio::spawn(async move {
                        if let Err(e) = router.rotate_proxy_id(service_id).await {
                            warn!(error = %e, "failed to rotate router proxy id after registration");
                        }
                    });
                })),
                ..callbacks
            }
        } else {
            callbacks
        };

        let lifecycle = LifecycleManager::new(bus.clone(), identity.clone(), metadata.clone(), config.clone(), callbacks);

        Ok(Arc::new(Self {
            bus,
            identity,
            metadata,
            lifecycle,
            router,
            config,
        }))
    }

    /// Subscribe everything, register with the registry, start
    /// heartbeating, and (for proxies) start the router.
    pub async fn start(self: &Arc<Self>) -> Result<(), FulcrumError> {
        self.lifecycle.start().await?;
        if let Some(router) = &self.router {
            router.start().await?;
        }
        Ok(())
    }

    pub async fn shutdown(&self) -> Result<(), FulcrumError> {
        self.lifecycle.shutdown().await
    }
}

fn default_connector() -> Connector {
    Arc::new(|_player, _server| Box::pin(async { Ok(()) }))
}

fn default_kicker() -> Kicker {
    Arc::new(|_player, _reason| Box::pin(async {}))
}

/// Runtime for the process playing the registry role. Unlike `Runtime` it
/// never registers itself — it *is* the registration authority the other
/// processes' `LifecycleManager`s talk to.
pub struct RegistryRuntime {
    bus: MessageBus,
    registry: Arc<ServerRegistry>,
    config: FulcrumConfig,
}

impl RegistryRuntime {
    pub async fn new(transport: Arc<dyn Transport>, config: FulcrumConfig) -> Result<Arc<Self>, FulcrumError> {
        let bus = MessageBus::new(
            transport.clone(),
            REGISTRY_BUS_ID,
            config.dedup_ttl_seconds,
            config.registration_dedup_ttl_seconds,
        )
        .await?;
        let registry = Arc::new(ServerRegistry::new(transport, config.registry_record_ttl_seconds));
        Ok(Arc::new(Self { bus, registry, config }))
    }

    pub fn registry(&self) -> Arc<ServerRegistry> {
        self.registry.clone()
    }

    pub async fn start(self: &Arc<Self>) -> Result<(), FulcrumError> {
        let this = self.clone();
        self.bus
            .subscribe(
                REGISTRATION_REQUEST_TYPE,
                Arc::new(move |env| {
                    let this = this.clone();
                    Box::pin(async move { this.handle_registration_request(env).await })
                }),
            )
            .await?;

        let this = self.clone();
        self.bus
            .subscribe(
                HEARTBEAT_TYPE,
                Arc::new(move |env| {
                    let this = this.clone();
                    Box::pin(async move { this.handle_heartbeat(env).await })
                }),
            )
            .await?;

        let this = self.clone();
        self.bus
            .subscribe(
                REMOVAL_NOTIFICATION_TYPE,
                Arc::new(move |env| {
                    let this = this.clone();
                    Box::pin(async move { this.handle_removed(env).await })
                }),
            )
            .await?;

        let this = self.clone();
        tokio::spawn(async move { this.run_crash_detection_loop().await });

        Ok(())
    }

    /// Ask every live service to resend its registration request (e.g.
    /// after the registry lost its backing store and needs the world
    /// re-announced to it).
    pub async fn request_global_reregistration(&self) -> Result<(), FulcrumError> {
        self.bus.broadcast(REREGISTER_GLOBAL_TYPE, serde_json::json!({})).await
    }

    async fn handle_registration_request(&self, env: crate::envelope::Envelope) {
        let Some(temp_id) = env.payload.get("tempId").and_then(|v| v.as_str()).map(str::to_string) else {
            warn!("registration request missing tempId, dropping");
            return;
        };
        let registration = match parse_registration(&env.payload) {
            Ok(r) => r,
            Err(reason) => {
                self.reply(&temp_id, false, None, Some(reason)).await;
                return;
            }
        };

        match self.registry.register(registration).await {
            Ok(RegisterOutcome::Success { service_id } | RegisterOutcome::Reclaimed { service_id }) => {
                self.reply(&temp_id, true, Some(service_id), None).await;
            }
            Ok(RegisterOutcome::Failure { reason }) => {
                self.reply(&temp_id, false, None, Some(reason)).await;
            }
            Err(e) => {
                warn!(error = %e, "registration storage failed");
                self.reply(&temp_id, false, None, Some("registry storage error".into())).await;
            }
        }
    }

    async fn reply(&self, temp_id: &str, accepted: bool, service_id: Option<String>, reason: Option<String>) {
        let payload = serde_json::json!({
            "tempId": temp_id,
            "accepted": accepted,
            "serviceId": service_id,
            "reason": reason,
        });
        if let Err(e) = self
            .bus
            .broadcast(crate::bus::REGISTRATION_RESPONSE_TYPE, payload)
            .await
        {
            warn!(error = %e, "failed to publish registration response");
        }
    }

    async fn handle_heartbeat(&self, env: crate::envelope::Envelope) {
        let Some(service_id) = env.payload.get("serviceId").and_then(|v| v.as_str()) else {
            return;
        };
        let Some(metadata) = env.payload.get("metadata") else { return };
        let player_count = metadata.get("player_count").and_then(|v| v.as_u64()).unwrap_or(0) as u32;
        let tps = metadata.get("tps").and_then(|v| v.as_f64()).unwrap_or(20.0);
        if let Some(status) = metadata
            .get("status")
            .and_then(|v| serde_json::from_value::<ServiceStatus>(v.clone()).ok())
        {
            let _ = self.registry.update_status(service_id, status).await;
        }
        if let Err(e) = self.registry.heartbeat(service_id, player_count, tps).await {
            warn!(error = %e, "failed to record heartbeat");
        }
    }

    async fn handle_removed(&self, env: crate::envelope::Envelope) {
        if let Some(service_id) = env.payload.get("serviceId").and_then(|v| v.as_str()) {
            if let Err(e) = self.registry.unregister(service_id).await {
                warn!(error = %e, service_id, "failed to unregister removed service");
            }
        }
    }

    async fn run_crash_detection_loop(&self) {
        let interval = std::time::Duration::from_secs(self.config.crash_detection_timeout_seconds.max(1));
        loop {
            tokio::time::sleep(interval).await;
            match self.registry.check_crashed(self.config.crash_detection_timeout_seconds).await {
                Ok(crashed) if !crashed.is_empty() => {
                    warn!(count = crashed.len(), "crash detection marked servers offline");
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "crash detection scan failed"),
            }
        }
    }
}

fn parse_registration(payload: &serde_json::Value) -> Result<Registration, String> {
    let service_type: ServiceType =
        serde_json::from_value(payload.get("serviceType").cloned().unwrap_or_default()).map_err(|_| "missing or invalid serviceType".to_string())?;
    let role = payload
        .get("role")
        .and_then(|v| v.as_str())
        .ok_or("missing role")?
        .to_string();
    let address = payload
        .get("address")
        .and_then(|v| v.as_str())
        .ok_or("missing address")?
        .to_string();
    let port = payload.get("port").and_then(|v| v.as_u64()).ok_or("missing port")? as u16;
    let instance_uuid = payload
        .get("instanceUuid")
        .and_then(|v| v.as_str())
        .ok_or("missing instanceUuid")?
        .to_string();
    let max_capacity = payload
        .get("metadata")
        .and_then(|m| m.get("max_capacity"))
        .and_then(|v| v.as_u64())
        .unwrap_or(0) as u32;

    Ok(Registration {
        service_type,
        family: role.clone(),
        role,
        address,
        port,
        instance_uuid,
        max_capacity,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::InMemoryTransport;

    #[tokio::test]
    async fn server_registers_through_registry_runtime() {
        let transport = Arc::new(InMemoryTransport::new());
        let registry_runtime = RegistryRuntime::new(transport.clone(), FulcrumConfig::default()).await.unwrap();
        registry_runtime.start().await.unwrap();

        let mut config = FulcrumConfig::default();
        config.registration_timeout_ms = 300;
        config.heartbeat_interval_ms = 10_000;
        let runtime = Runtime::new(
            transport,
            ServiceType::Server,
            "lobby",
            "10.0.0.5",
            25565,
            100,
            config,
            LifecycleCallbacks::default(),
        )
        .await
        .unwrap();

        runtime.start().await.unwrap();
        assert_eq!(runtime.lifecycle.status(), ServiceStatus::Available);
        assert!(runtime.identity.service_id().unwrap().starts_with("lobby-"));

        let records = registry_runtime.registry().list_by_family("lobby").await.unwrap();
        assert_eq!(records.len(), 1);
    }

    #[tokio::test]
    async fn proxy_runtime_starts_router() {
        let transport = Arc::new(InMemoryTransport::new());
        let registry_runtime = RegistryRuntime::new(transport.clone(), FulcrumConfig::default()).await.unwrap();
        registry_runtime.start().await.unwrap();

        let mut config = FulcrumConfig::default();
        config.registration_timeout_ms = 300;
        config.heartbeat_interval_ms = 10_000;
        let runtime = Runtime::new(
            transport,
            ServiceType::Proxy,
            "proxy",
            "10.0.0.9",
            25577,
            0,
            config,
            LifecycleCallbacks::default(),
        )
        .await
        .unwrap();

        runtime.start().await.unwrap();
        assert!(runtime.router.is_some());
    }
}
