//! Player Routing Core (C6, spec.md §4.6).
//!
//! Runs on a proxy. Maintains a server view fed by heartbeat/announcement/
//! removal broadcasts (not by calling the registry directly — a proxy and
//! the registry are separate processes communicating only over the bus),
//! and drives the slot-request / route-command / ack choreography that
//! moves a player onto a specific backend slot.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock as StdRwLock};
use std::time::{Duration, Instant};

use dashmap::{DashMap, DashSet};
use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use crate::bus::MessageBus;
use crate::error::FulcrumError;

const HEARTBEAT_TYPE: &str = "fulcrum.server.heartbeat";
const ANNOUNCEMENT_TYPE: &str = "fulcrum.server.announcement";
const REMOVED_TYPE: &str = "fulcrum.registry.server.removed";
const PLAYER_REQUEST_TYPE: &str = "fulcrum.registry.player.request";
const LOCATE_REQUEST_TYPE: &str = "fulcrum.registry.player.locate.request";
const LOCATE_RESPONSE_TYPE: &str = "fulcrum.registry.player.locate.response";
const ROUTE_ACK_TYPE: &str = "fulcrum.player.route.ack";

fn route_channel_type(proxy_id: &str) -> String {
    format!("fulcrum.player.route.{proxy_id}")
}

/// A connector abstracts the proxy-specific act of actually moving a
/// player's backend connection (a plugin-message / protocol-level concern
/// this fabric does not itself implement). Tests and the default runtime
/// both inject one.
pub type Connector = Arc<dyn Fn(String, String) -> BoxFuture<'static, Result<(), FulcrumError>> + Send + Sync>;
/// Invoked to forcibly disconnect a player already on this proxy.
pub type Kicker = Arc<dyn Fn(String, String) -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(Debug, Clone)]
struct ServerView {
    family: String,
    role: String,
    player_count: u32,
    max_capacity: u32,
    tps: f64,
    last_update: Instant,
}

impl ServerView {
    fn load_factor(&self) -> f64 {
        let capacity_term = if self.max_capacity == 0 {
            1.0
        } else {
            self.player_count as f64 / self.max_capacity as f64
        };
        0.6 * capacity_term + 0.4 * ((20.0 - self.tps) / 20.0)
    }

    fn is_healthy(&self) -> bool {
        self.tps >= 18.0 && self.player_count < self.max_capacity
    }

    fn is_stale(&self, threshold: Duration) -> bool {
        self.last_update.elapsed() > threshold
    }
}

#[derive(Debug, Clone)]
struct Assignment {
    server_id: String,
    slot_id: String,
    slot_suffix: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteCommand {
    pub request_id: String,
    pub player_id: String,
    pub target_server_id: String,
    pub slot_id: String,
    #[serde(default)]
    pub slot_suffix: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DisconnectCommand {
    pub player_id: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocateRequest {
    pub request_id: String,
    pub player_id: String,
}

const STALENESS_THRESHOLD: Duration = Duration::from_secs(10);

pub struct PlayerRouter {
    bus: MessageBus,
    views: DashMap<String, ServerView>,
    assignments: DashMap<String, Assignment>,
    known_players: DashSet<String>,
    current_proxy_id: StdRwLock<String>,
    route_subscriptions: StdRwLock<BTreeMap<String, crate::bus::HandlerToken>>,
    connector: Connector,
    kicker: Kicker,
    request_counter: AtomicU64,
}

impl PlayerRouter {
    pub fn new(bus: MessageBus, proxy_id: impl Into<String>, connector: Connector, kicker: Kicker) -> Arc<Self> {
        Arc::new(Self {
            bus,
            views: DashMap::new(),
            assignments: DashMap::new(),
            known_players: DashSet::new(),
            current_proxy_id: StdRwLock::new(proxy_id.into()),
            route_subscriptions: StdRwLock::new(BTreeMap::new()),
            connector,
            kicker,
            request_counter: AtomicU64::new(0),
        })
    }

    fn current_proxy_id(&self) -> String {
        self.current_proxy_id.read().expect("proxy id lock poisoned").clone()
    }

    pub async fn start(self: &Arc<Self>) -> Result<(), FulcrumError> {
        let this = self.clone();
        self.bus
            .subscribe(
                HEARTBEAT_TYPE,
                Arc::new(move |env| {
                    let this = this.clone();
                    Box::pin(async move { this.on_heartbeat(env).await })
                }),
            )
            .await?;

        let this = self.clone();
        self.bus
            .subscribe(
                ANNOUNCEMENT_TYPE,
                Arc::new(move |env| {
                    let this = this.clone();
                    Box::pin(async move { this.on_announcement(env).await })
                }),
            )
            .await?;

        let this = self.clone();
        self.bus
            .subscribe(
                REMOVED_TYPE,
                Arc::new(move |env| {
                    let this = this.clone();
                    Box::pin(async move { this.on_removed(env).await })
                }),
            )
            .await?;

        let this = self.clone();
        self.bus
            .subscribe(
                LOCATE_REQUEST_TYPE,
                Arc::new(move |env| {
                    let this = this.clone();
                    Box::pin(async move { this.handle_locate_request_envelope(env).await })
                }),
            )
            .await?;

        self.subscribe_route_channel(&self.current_proxy_id()).await
    }

    async fn subscribe_route_channel(self: &Arc<Self>, proxy_id: &str) -> Result<(), FulcrumError> {
        let this = self.clone();
        let expected_id = proxy_id.to_string();
        let token = self
            .bus
            .subscribe(
                route_channel_type(proxy_id),
                Arc::new(move |env| {
                    let this = this.clone();
                    let expected_id = expected_id.clone();
                    Box::pin(async move {
                        if this.current_proxy_id() != expected_id {
                            return;
                        }
                        this.handle_route_command_envelope(env).await;
                    })
                }),
            )
            .await?;
        self.route_subscriptions
            .write()
            .expect("route subscriptions lock poisoned")
            .insert(proxy_id.to_string(), token);
        Ok(())
    }

    /// spec.md §4.6 "Failure model": re-subscribe to the new proxy-id
    /// channel; in-flight commands on the old channel are ignored (the
    /// stale-id check inside the old channel's dispatcher handles that,
    /// covering the window before the old subscription is actually torn
    /// down below).
    pub async fn rotate_proxy_id(self: &Arc<Self>, new_id: impl Into<String>) -> Result<(), FulcrumError> {
        let old_id = self.current_proxy_id();
        let new_id = new_id.into();
        *self.current_proxy_id.write().expect("proxy id lock poisoned") = new_id.clone();
        self.subscribe_route_channel(&new_id).await?;

        let old_token = self
            .route_subscriptions
            .write()
            .expect("route subscriptions lock poisoned")
            .remove(&old_id);
        if let Some(token) = old_token {
            self.bus.unsubscribe(&route_channel_type(&old_id), token).await;
        }
        Ok(())
    }

    pub fn note_player_connected(&self, player_id: impl Into<String>) {
        self.known_players.insert(player_id.into());
    }

    pub fn note_player_disconnected(&self, player_id: &str) {
        self.known_players.remove(player_id);
        self.assignments.remove(player_id);
    }

    async fn on_heartbeat(&self, env: crate::envelope::Envelope) {
        let Some(service_id) = env.payload.get("serviceId").and_then(|v| v.as_str()) else {
            return;
        };
        let Some(metadata) = env.payload.get("metadata") else { return };
        let player_count = metadata.get("player_count").and_then(|v| v.as_u64()).unwrap_or(0) as u32;
        let tps = metadata.get("tps").and_then(|v| v.as_f64()).unwrap_or(20.0);
        if let Some(mut view) = self.views.get_mut(service_id) {
            view.player_count = player_count;
            view.tps = tps;
            view.last_update = Instant::now();
        }
    }

    async fn on_announcement(&self, env: crate::envelope::Envelope) {
        let Some(service_id) = env.payload.get("serviceId").and_then(|v| v.as_str()) else {
            return;
        };
        let family = env
            .payload
            .get("family")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string();
        let role = env.payload.get("role").and_then(|v| v.as_str()).unwrap_or("").to_string();
        let max_capacity = env.payload.get("maxCapacity").and_then(|v| v.as_u64()).unwrap_or(0) as u32;
        self.views.insert(
            service_id.to_string(),
            ServerView {
                family,
                role,
                player_count: 0,
                max_capacity,
                tps: 20.0,
                last_update: Instant::now(),
            },
        );
    }

    async fn on_removed(&self, env: crate::envelope::Envelope) {
        if let Some(service_id) = env.payload.get("serviceId").and_then(|v| v.as_str()) {
            self.views.remove(service_id);
        }
    }

    fn non_stale_views(&self) -> Vec<(String, ServerView)> {
        self.views
            .iter()
            .filter(|e| !e.value().is_stale(STALENESS_THRESHOLD))
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    /// Lowest-load healthy record with `role`; if none healthy, the first
    /// unhealthy record of the same role. Never crosses roles.
    pub fn find_optimal(&self, role: &str) -> Option<String> {
        let mut candidates: Vec<(String, ServerView)> =
            self.non_stale_views().into_iter().filter(|(_, v)| v.role == role).collect();
        candidates.sort_by(|a, b| a.1.load_factor().partial_cmp(&b.1.load_factor()).unwrap());
        if let Some((id, _)) = candidates.iter().find(|(_, v)| v.is_healthy()) {
            return Some(id.clone());
        }
        candidates.into_iter().next().map(|(id, _)| id)
    }

    /// Best lobby; else best healthy server of any role; else any
    /// registered server; else `None` (caller should disconnect).
    pub fn choose_initial_server(&self) -> Option<String> {
        if let Some(id) = self.find_optimal("lobby") {
            return Some(id);
        }
        let mut all = self.non_stale_views();
        all.sort_by(|a, b| a.1.load_factor().partial_cmp(&b.1.load_factor()).unwrap());
        if let Some((id, _)) = all.iter().find(|(_, v)| v.is_healthy()) {
            return Some(id.clone());
        }
        all.into_iter().next().map(|(id, _)| id)
    }

    fn next_request_id(&self) -> String {
        let n = self.request_counter.fetch_add(1, Ordering::SeqCst);
        format!("{}-{n}", Uuid::new_v4())
    }

    pub async fn handle_slot_request(
        &self,
        player_id: impl Into<String>,
        family: impl Into<String>,
        metadata: serde_json::Value,
    ) -> Result<String, FulcrumError> {
        let request_id = self.next_request_id();
        let payload = serde_json::json!({
            "requestId": request_id,
            "playerId": player_id.into(),
            "proxyId": self.current_proxy_id(),
            "family": family.into(),
            "metadata": metadata,
        });
        self.bus.broadcast(PLAYER_REQUEST_TYPE, payload).await?;
        Ok(request_id)
    }

    async fn handle_route_command_envelope(&self, env: crate::envelope::Envelope) {
        let cmd: RouteCommand = match serde_json::from_value(env.payload.clone()) {
            Ok(cmd) => cmd,
            Err(e) => {
                warn!(error = %e, "malformed route command, dropping");
                return;
            }
        };
        self.handle_route_command(cmd).await;
    }

    pub async fn handle_route_command(&self, cmd: RouteCommand) {
        if !self.known_players.contains(&cmd.player_id) {
            self.send_ack(&cmd.request_id, &cmd.player_id, false, Some("player-offline")).await;
            return;
        }
        if !self.views.contains_key(&cmd.target_server_id) {
            self.send_ack(&cmd.request_id, &cmd.player_id, false, Some("backend-not-found")).await;
            return;
        }

        let already_connected = self
            .assignments
            .get(&cmd.player_id)
            .map(|a| a.server_id == cmd.target_server_id)
            .unwrap_or(false);

        if already_connected {
            tokio::time::sleep(Duration::from_millis(50)).await;
            self.send_ack(&cmd.request_id, &cmd.player_id, true, None).await;
            return;
        }

        match (self.connector)(cmd.player_id.clone(), cmd.target_server_id.clone()).await {
            Ok(()) => {
                self.assignments.insert(
                    cmd.player_id.clone(),
                    Assignment {
                        server_id: cmd.target_server_id.clone(),
                        slot_id: cmd.slot_id.clone(),
                        slot_suffix: cmd.slot_suffix.clone(),
                    },
                );
                self.send_ack(&cmd.request_id, &cmd.player_id, true, None).await;
            }
            Err(e) => {
                warn!(player_id = %cmd.player_id, error = %e, "connection failed");
                self.send_ack(&cmd.request_id, &cmd.player_id, false, Some("connection-failed")).await;
            }
        }
    }

    async fn send_ack(&self, request_id: &str, player_id: &str, success: bool, reason: Option<&str>) {
        let payload = serde_json::json!({
            "requestId": request_id,
            "playerId": player_id,
            "proxyId": self.current_proxy_id(),
            "status": if success { "SUCCESS" } else { "FAILED" },
            "reason": reason,
        });
        if let Err(e) = self.bus.broadcast(ROUTE_ACK_TYPE, payload).await {
            warn!(error = %e, "failed to publish route ack");
        }
    }

    pub async fn handle_disconnect_command(&self, cmd: DisconnectCommand) {
        (self.kicker)(cmd.player_id.clone(), cmd.reason).await;
        self.note_player_disconnected(&cmd.player_id);
    }

    async fn handle_locate_request_envelope(&self, env: crate::envelope::Envelope) {
        let req: LocateRequest = match serde_json::from_value(env.payload.clone()) {
            Ok(req) => req,
            Err(e) => {
                warn!(error = %e, "malformed locate request, dropping");
                return;
            }
        };
        self.handle_locate_request(req).await;
    }

    pub async fn handle_locate_request(&self, req: LocateRequest) {
        let Some(assignment) = self.assignments.get(&req.player_id) else {
            return;
        };
        let family = self
            .views
            .get(&assignment.server_id)
            .map(|v| v.family.clone())
            .unwrap_or_default();
        let payload = serde_json::json!({
            "requestId": req.request_id,
            "found": true,
            "serverId": assignment.server_id,
            "slotId": assignment.slot_id,
            "slotSuffix": assignment.slot_suffix,
            "familyId": family,
        });
        if let Err(e) = self.bus.broadcast(LOCATE_RESPONSE_TYPE, payload).await {
            warn!(error = %e, "failed to publish locate response");
        }
    }
}
