//! Namespace Engine (NE): the generic state machine driving every
//! namespace flavor — router election, peer registry maintenance,
//! broadcast, ping/TTL cleanup, failover, level escalation, and the
//! NAT peer-slot reverse-connect dance.
//!
//! One [`NsConfig`] (four closures: label, `router_id(level)`,
//! `discovery_id()`, `peer_slot_id()`) parameterizes the same engine
//! for every namespace flavor in [`super::drivers`] — this module
//! knows nothing about IP addresses, geohashes, or group ids.
//!
//! The engine runs as a single-owner actor task (§5): all registry and
//! role mutation happens inside `run`, never shared behind a mutex
//! across tasks, matching the design document's explicit actor
//! recommendation.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::{mpsc, oneshot};

use crate::config::OverlayConfig;
use crate::signaling::{JobOutcome, Priority, SignalingGate};
use crate::transport::{Channel, EndpointHandle, SignalingTransport, TransportError};
use crate::types::RegistryEntry;
use crate::wire::{self, Message, RegistryPeer};

use super::registry::Registry;

/// The four closures from §3's Namespace config, generalized over any
/// namespace flavor.
#[derive(Clone)]
pub struct NsConfig {
    pub label: String,
    pub router_id: Arc<dyn Fn(u8) -> String + Send + Sync>,
    pub discovery_id: Arc<dyn Fn(&str) -> String + Send + Sync>,
    pub peer_slot_id: Arc<dyn Fn() -> String + Send + Sync>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NsRole {
    None,
    Router,
    Member,
    PeerSlotWaiter,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinStatus {
    Electing,
    Joining,
    PeerSlot,
    Settled,
}

#[derive(Debug, Clone)]
pub struct NsSnapshot {
    pub role: NsRole,
    pub level: u8,
    pub join_status: JoinStatus,
    pub registry_len: usize,
    pub offline: bool,
}

enum EngineMsg {
    Inbound(Message, Arc<dyn Channel>, ConnRole),
    RouterChannelClosed,
    Snapshot(oneshot::Sender<NsSnapshot>),
    GetRegistry(oneshot::Sender<Vec<RegistryEntry>>),
    DrainDiscoveryExchanges(oneshot::Sender<Vec<(Message, Arc<dyn Channel>)>>),
    DrainRelay(oneshot::Sender<Vec<Message>>),
    SendToRouter(Message, oneshot::Sender<bool>),
    Shutdown,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum ConnRole {
    /// A peer connected to us while we are router.
    RouterSide,
    /// Our own connection to the namespace's router.
    MemberSide,
    /// A peer dialed our own discovery endpoint directly (§4.6).
    DiscoverySide,
}

/// Handle to a running namespace engine instance.
pub struct NamespaceHandle {
    cmd_tx: mpsc::UnboundedSender<EngineMsg>,
    active: Arc<AtomicBool>,
}

impl NamespaceHandle {
    pub async fn snapshot(&self) -> Option<NsSnapshot> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx.send(EngineMsg::Snapshot(tx)).ok()?;
        rx.await.ok()
    }

    /// Current registry contents, for callers that need to scan it
    /// (e.g. the rendezvous subsystem looking for a matching public
    /// key, §4.6 Discovery).
    pub async fn registry_entries(&self) -> Vec<RegistryEntry> {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(EngineMsg::GetRegistry(tx)).is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    /// Drain any inbound rendezvous exchanges received on our own
    /// discovery endpoint (§4.6 Discovery) along with the channel each
    /// arrived on, so the caller can verify and reply over it.
    pub async fn drain_discovery_exchanges(&self) -> Vec<(Message, Arc<dyn Channel>)> {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(EngineMsg::DrainDiscoveryExchanges(tx)).is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    /// Drain messages the router relayed to us that the engine itself
    /// doesn't interpret (group/call traffic, §4.7) — opaque to the
    /// namespace engine, meaningful to the caller.
    pub async fn drain_relay(&self) -> Vec<Message> {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(EngineMsg::DrainRelay(tx)).is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    /// Send an opaque message to this namespace's router for relay to
    /// every other member. Returns `false` if we aren't currently
    /// connected to a router.
    pub async fn send_to_router(&self, msg: Message) -> bool {
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(EngineMsg::SendToRouter(msg, tx)).is_err() {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    pub fn teardown(&self) {
        self.active.store(false, Ordering::Relaxed);
        let _ = self.cmd_tx.send(EngineMsg::Shutdown);
    }
}

pub fn spawn(
    ns_config: NsConfig,
    overlay_config: OverlayConfig,
    gate: SignalingGate,
    transport: Arc<dyn SignalingTransport>,
    my_friendly_name: String,
    my_public_key: Vec<u8>,
) -> NamespaceHandle {
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let active = Arc::new(AtomicBool::new(true));

    let worker = EngineWorker {
        ns_config,
        overlay_config,
        gate,
        transport,
        my_friendly_name,
        my_public_key,
        self_cmd_tx: cmd_tx.clone(),
        active: active.clone(),
        role: NsRole::None,
        level: 0,
        join_status: JoinStatus::Electing,
        offline: false,
        registry: Registry::new(),
        router_connections: Vec::new(),
        member_router_channel: None,
        self_discovery_address: None,
        discovery_endpoint: None,
        pending_discovery_exchanges: VecDeque::new(),
        pending_relay: VecDeque::new(),
        rng: rand::rngs::StdRng::from_entropy(),
    };

    tokio::spawn(worker.run(cmd_rx));

    NamespaceHandle { cmd_tx, active }
}

struct EngineWorker {
    ns_config: NsConfig,
    overlay_config: OverlayConfig,
    gate: SignalingGate,
    transport: Arc<dyn SignalingTransport>,
    my_friendly_name: String,
    my_public_key: Vec<u8>,
    self_cmd_tx: mpsc::UnboundedSender<EngineMsg>,
    active: Arc<AtomicBool>,

    role: NsRole,
    level: u8,
    join_status: JoinStatus,
    offline: bool,
    registry: Registry,
    /// Router-side: every peer currently checked in.
    router_connections: Vec<Arc<dyn Channel>>,
    /// Member-side: our single connection to the router.
    member_router_channel: Option<Arc<dyn Channel>>,
    self_discovery_address: Option<String>,
    /// Our own listening endpoint at `self_discovery_address`, so other
    /// peers can dial us directly for a rendezvous exchange (§4.6)
    /// without going through the router at all.
    discovery_endpoint: Option<Arc<dyn EndpointHandle>>,
    /// Inbound exchanges received on `discovery_endpoint`, awaiting a
    /// caller with signing/verification context to drain them.
    pending_discovery_exchanges: VecDeque<(Message, Arc<dyn Channel>)>,
    /// Messages the router relayed to us that the engine has no
    /// opinion about, awaiting a caller to interpret them.
    pending_relay: VecDeque<Message>,
    rng: rand::rngs::StdRng,
}

use rand::SeedableRng;

impl EngineWorker {
    async fn run(mut self, mut cmd_rx: mpsc::UnboundedReceiver<EngineMsg>) {
        self.attempt(0).await;

        let mut ping_tick = tokio::time::interval(Duration::from_millis(self.overlay_config.ping_interval_ms));
        let mut monitor_tick =
            tokio::time::interval(Duration::from_millis(self.overlay_config.monitor_l1_interval_ms));
        let mut peer_slot_probe_tick =
            tokio::time::interval(Duration::from_millis(self.overlay_config.peer_slot_probe_interval_ms));

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(EngineMsg::Shutdown) | None => {
                            self.active.store(false, Ordering::Relaxed);
                            if let Some(ep) = self.discovery_endpoint.take() {
                                ep.close();
                            }
                            return;
                        }
                        Some(EngineMsg::Snapshot(reply)) => {
                            let _ = reply.send(self.snapshot());
                        }
                        Some(EngineMsg::GetRegistry(reply)) => {
                            let _ = reply.send(self.registry.values().cloned().collect());
                        }
                        Some(EngineMsg::DrainDiscoveryExchanges(reply)) => {
                            let drained = self.pending_discovery_exchanges.drain(..).collect();
                            let _ = reply.send(drained);
                        }
                        Some(EngineMsg::DrainRelay(reply)) => {
                            let drained = self.pending_relay.drain(..).collect();
                            let _ = reply.send(drained);
                        }
                        Some(EngineMsg::SendToRouter(msg, reply)) => {
                            let ok = self.send_to_router(msg).await;
                            let _ = reply.send(ok);
                        }
                        Some(EngineMsg::RouterChannelClosed) => {
                            self.on_router_channel_closed().await;
                        }
                        Some(EngineMsg::Inbound(msg, chan, conn_role)) => {
                            self.on_inbound(msg, chan, conn_role).await;
                        }
                    }
                }
                _ = ping_tick.tick(), if self.role == NsRole::Router => {
                    self.router_ping_and_evict().await;
                }
                _ = monitor_tick.tick(), if self.role != NsRole::None && self.level > 1 => {
                    self.monitor_for_l1().await;
                }
                _ = peer_slot_probe_tick.tick(), if self.role == NsRole::Router => {
                    self.probe_peer_slot().await;
                }
            }
        }
    }

    fn snapshot(&self) -> NsSnapshot {
        NsSnapshot {
            role: self.role,
            level: self.level,
            join_status: self.join_status,
            registry_len: self.registry.len(),
            offline: self.offline,
        }
    }

    /// `attempt(level)`: submit an election job to the signaling gate.
    fn attempt<'a>(&'a mut self, level: u8) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send + 'a>> {
        Box::pin(async move {
            if level > self.overlay_config.max_level {
                self.offline = true;
                self.role = NsRole::None;
                log::warn!("namespace {}: exhausted levels, going offline", self.ns_config.label);
                return;
            }
            self.level = level;
            self.join_status = JoinStatus::Electing;
            let router_id = (self.ns_config.router_id)(level);
            let transport = self.transport.clone();
            let id = router_id.clone();
            let active = self.active.clone();

            let outcome = self
                .gate
                .schedule(Priority::Normal, active, move || {
                    Box::pin(async move {
                        match transport.create_endpoint(&id).await {
                            Ok(endpoint) => JobOutcome::Success.with_endpoint(endpoint),
                            Err(TransportError::AddressTaken) => JobOutcome::Failure,
                            Err(_) => JobOutcome::Failure,
                        }
                    })
                })
                .await;

            match outcome {
                EngineOutcome::ClaimedRouter(endpoint) => {
                    self.gate.report_success();
                    self.become_router(endpoint).await;
                }
                EngineOutcome::Refused => {
                    self.gate.report_success();
                    self.try_join(level).await;
                }
                EngineOutcome::Skipped => {}
            }
        })
    }

    async fn try_join(&mut self, level: u8) {
        self.join_status = JoinStatus::Joining;
        let router_id = (self.ns_config.router_id)(level);

        for _ in 0..self.overlay_config.join_max_retries {
            if !self.active.load(Ordering::Relaxed) {
                return;
            }
            let connect_fut = self.transport.connect(&router_id);
            let timeout = Duration::from_millis(self.overlay_config.join_timeout_ms);
            match tokio::time::timeout(timeout, connect_fut).await {
                Ok(Ok(channel)) => {
                    self.gate.report_success();
                    self.send_checkin(&channel).await;
                    self.member_router_channel = Some(channel.clone());
                    self.role = NsRole::Member;
                    self.join_status = JoinStatus::Settled;
                    self.spawn_reader(channel, ConnRole::MemberSide);
                    return;
                }
                Ok(Err(TransportError::NetworkDown)) => {
                    self.gate.report_failure();
                    // Pause, don't escalate (§4.3 election protocol).
                    return;
                }
                Ok(Err(_)) | Err(_) => {
                    self.gate.report_failure();
                    continue;
                }
            }
        }

        self.try_peer_slot(level).await;
    }

    async fn send_checkin(&mut self, channel: &Arc<dyn Channel>) {
        let discovery_id = (self.ns_config.discovery_id)(&uuid::Uuid::new_v4().to_string());
        self.self_discovery_address = Some(discovery_id.clone());
        self.claim_discovery_endpoint(discovery_id.clone()).await;
        let msg = Message::Checkin {
            discovery_id,
            friendly_name: self.my_friendly_name.clone(),
            public_key: self.my_public_key.clone(),
        };
        if let Ok(bytes) = wire::encode(&msg) {
            let _ = channel.send(bytes).await;
        }
    }

    /// Claim our own discovery address as a real listenable endpoint so
    /// another peer can dial us directly (§4.6), instead of the id
    /// being a label that only ever appears inside registry broadcasts.
    async fn claim_discovery_endpoint(&mut self, discovery_id: String) {
        if let Some(old) = self.discovery_endpoint.take() {
            old.close();
        }
        let endpoint = match self.transport.create_endpoint(&discovery_id).await {
            Ok(ep) => ep,
            Err(_) => {
                log::debug!("{}: could not claim own discovery endpoint {discovery_id}", self.ns_config.label);
                return;
            }
        };
        self.discovery_endpoint = Some(endpoint.clone());

        let cmd_tx = self.self_cmd_tx.clone();
        let active = self.active.clone();
        tokio::spawn(async move {
            loop {
                if !active.load(Ordering::Relaxed) {
                    return;
                }
                match endpoint.accept().await {
                    Some(channel) => {
                        spawn_reader_task(channel, ConnRole::DiscoverySide, cmd_tx.clone(), active.clone());
                    }
                    None => return,
                }
            }
        });
    }

    async fn send_to_router(&self, msg: Message) -> bool {
        let Some(channel) = &self.member_router_channel else {
            return false;
        };
        match wire::encode(&msg) {
            Ok(bytes) => channel.send(bytes).await.is_ok(),
            Err(_) => false,
        }
    }

    /// Router-side half of the peer-slot reverse-connect dance (§4.3):
    /// periodically dial our own peer-slot id. If a waiter is parked
    /// there, the connect succeeds and we welcome them in as a member.
    async fn probe_peer_slot(&mut self) {
        let peer_slot_id = (self.ns_config.peer_slot_id)();
        let channel = match self.transport.connect(&peer_slot_id).await {
            Ok(c) => c,
            Err(_) => return, // no one waiting right now
        };
        if let Ok(bytes) = wire::encode(&Message::ReverseWelcome) {
            let _ = channel.send(bytes).await;
        }
        // The waiter replies with its own Checkin over this channel,
        // which the normal RouterSide Checkin handler registers — don't
        // double-register it here.
        self.spawn_reader(channel, ConnRole::RouterSide);
    }

    async fn try_peer_slot(&mut self, level: u8) {
        self.join_status = JoinStatus::PeerSlot;
        self.role = NsRole::PeerSlotWaiter;
        let peer_slot_id = (self.ns_config.peer_slot_id)();

        let endpoint = match self.transport.create_endpoint(&peer_slot_id).await {
            Ok(ep) => ep,
            Err(_) => {
                // Someone else already waiting; treat like a failed
                // retry round and escalate after exhausting retries.
                self.escalate(level).await;
                return;
            }
        };

        for attempt_no in 0..self.overlay_config.peer_slot_max_retries {
            if !self.active.load(Ordering::Relaxed) {
                return;
            }
            let jitter_ms = self.rng.gen_range(
                self.overlay_config.peer_slot_jitter_min_ms..=self.overlay_config.peer_slot_jitter_max_ms,
            );
            let wait = Duration::from_millis(jitter_ms);
            match tokio::time::timeout(wait, endpoint.accept()).await {
                Ok(Some(channel)) => {
                    // Router reached us; expect reverse-welcome, then
                    // reply with checkin over the very same channel.
                    self.send_checkin(&channel).await;
                    self.member_router_channel = Some(channel.clone());
                    self.role = NsRole::Member;
                    self.join_status = JoinStatus::Settled;
                    self.spawn_reader(channel, ConnRole::MemberSide);
                    return;
                }
                Ok(None) => {
                    log::debug!("{}: peer-slot endpoint closed unexpectedly", self.ns_config.label);
                    break;
                }
                Err(_) => {
                    log::debug!(
                        "{}: peer-slot retry {}/{}",
                        self.ns_config.label,
                        attempt_no + 1,
                        self.overlay_config.peer_slot_max_retries
                    );
                }
            }
        }

        self.escalate(level).await;
    }

    async fn escalate(&mut self, level: u8) {
        let next = level + 1;
        Box::pin(self.attempt(next)).await;
    }

    async fn become_router(&mut self, endpoint: Arc<dyn EndpointHandle>) {
        self.role = NsRole::Router;
        self.join_status = JoinStatus::Settled;
        self.registry = Registry::new();
        log::info!("namespace {} level {}: became router", self.ns_config.label, self.level);

        let cmd_tx = self.self_cmd_tx.clone();
        let active = self.active.clone();
        tokio::spawn(async move {
            loop {
                if !active.load(Ordering::Relaxed) {
                    return;
                }
                match endpoint.accept().await {
                    Some(channel) => {
                        spawn_reader_task(channel, ConnRole::RouterSide, cmd_tx.clone(), active.clone());
                    }
                    None => return,
                }
            }
        });
    }

    fn spawn_reader(&self, channel: Arc<dyn Channel>, role: ConnRole) {
        spawn_reader_task(channel, role, self.self_cmd_tx.clone(), self.active.clone());
    }

    async fn on_inbound(&mut self, msg: Message, chan: Arc<dyn Channel>, conn_role: ConnRole) {
        if conn_role == ConnRole::DiscoverySide {
            if let Message::RvzExchange { .. } = &msg {
                self.pending_discovery_exchanges.push_back((msg, chan));
            } else {
                log::debug!("{}: ignoring non-exchange message on discovery endpoint", self.ns_config.label);
            }
            return;
        }

        match (conn_role, msg) {
            (ConnRole::RouterSide, Message::Checkin { discovery_id, friendly_name, public_key }) => {
                self.registry.checkin(discovery_id, friendly_name, Some(public_key), None, crate::now_ms());
                self.router_connections.push(chan);
                self.broadcast_registry().await;
            }
            (ConnRole::RouterSide, Message::Pong) => {
                // Best-effort: we don't track which address this
                // channel maps to beyond checkin, so the periodic
                // TTL sweep handles refresh via subsequent checkins;
                // explicit pong handling is a placeholder seam for a
                // transport that exposes per-channel peer identity.
                let _ = chan;
            }
            (ConnRole::RouterSide, other) => {
                // The router doesn't interpret group/call payload
                // semantics (§9) — relay anything else verbatim to
                // every other member, the same pattern a group's
                // ciphertext relay rides on.
                if let Ok(bytes) = wire::encode(&other) {
                    for conn in &self.router_connections {
                        if !Arc::ptr_eq(conn, &chan) {
                            let _ = conn.send(bytes.clone()).await;
                        }
                    }
                }
            }
            (ConnRole::MemberSide, Message::Registry { peers }) => {
                self.apply_registry_broadcast(peers).await;
            }
            (ConnRole::MemberSide, Message::Ping) => {
                if let Ok(bytes) = wire::encode(&Message::Pong) {
                    let _ = chan.send(bytes).await;
                }
            }
            (ConnRole::MemberSide, Message::Migrate { level: target }) => {
                if target < self.level {
                    self.teardown_member_link();
                    self.attempt(target).await;
                }
            }
            (ConnRole::MemberSide, Message::ReverseWelcome) => {
                // Presence acknowledgment only; we already completed
                // our checkin as soon as the router accepted us.
            }
            (ConnRole::MemberSide, other) => {
                self.pending_relay.push_back(other);
            }
            (ConnRole::DiscoverySide, _) => unreachable!("handled by the early return above"),
        }
    }

    async fn apply_registry_broadcast(&mut self, peers: Vec<RegistryPeer>) {
        let self_entry = self.self_discovery_address.clone().map(|addr| {
            (
                addr.clone(),
                RegistryEntry {
                    discovery_address: addr,
                    friendly_name: self.my_friendly_name.clone(),
                    last_seen_ms: crate::now_ms(),
                    public_key: Some(self.my_public_key.clone()),
                    contact_fingerprint: None,
                },
            )
        });
        self.registry.replace_from_broadcast(peers, crate::now_ms(), self_entry);
    }

    async fn broadcast_registry(&mut self) {
        let wire_peers = self.registry.to_wire();
        let msg = Message::Registry { peers: wire_peers };
        if let Ok(bytes) = wire::encode(&msg) {
            for conn in &self.router_connections {
                let _ = conn.send(bytes.clone()).await;
            }
        }
    }

    async fn router_ping_and_evict(&mut self) {
        let evicted = self.registry.evict_expired(
            crate::now_ms(),
            self.overlay_config.peer_ttl_ms,
            self.overlay_config.peer_ttl_grace_ms,
        );
        if let Ok(bytes) = wire::encode(&Message::Ping) {
            for conn in &self.router_connections {
                let _ = conn.send(bytes.clone()).await;
            }
        }
        if !evicted.is_empty() {
            self.broadcast_registry().await;
        }
    }

    async fn monitor_for_l1(&mut self) {
        let router_id_l1 = (self.ns_config.router_id)(1);
        let exists = self.transport.connect(&router_id_l1).await.is_ok();
        if !exists {
            return;
        }
        if self.role == NsRole::Router {
            let msg = Message::Migrate { level: 1 };
            if let Ok(bytes) = wire::encode(&msg) {
                for conn in &self.router_connections {
                    let _ = conn.send(bytes.clone()).await;
                }
            }
        }
        self.teardown_member_link();
        self.attempt(1).await;
    }

    async fn on_router_channel_closed(&mut self) {
        self.teardown_member_link();
        let jitter_ms = self.rng.gen_range(
            self.overlay_config.failover_jitter_min_ms..=self.overlay_config.failover_jitter_max_ms.max(1),
        );
        tokio::time::sleep(Duration::from_millis(jitter_ms)).await;
        if !self.active.load(Ordering::Relaxed) {
            return;
        }
        self.attempt(self.level).await;
    }

    fn teardown_member_link(&mut self) {
        if let Some(chan) = self.member_router_channel.take() {
            chan.close();
        }
        self.role = NsRole::None;
        self.registry = Registry::new();
    }
}

fn spawn_reader_task(
    channel: Arc<dyn Channel>,
    role: ConnRole,
    cmd_tx: mpsc::UnboundedSender<EngineMsg>,
    active: Arc<AtomicBool>,
) {
    tokio::spawn(async move {
        loop {
            if !active.load(Ordering::Relaxed) {
                return;
            }
            match channel.recv().await {
                Some(bytes) => match wire::decode(&bytes) {
                    Ok(msg) => {
                        if cmd_tx
                            .send(EngineMsg::Inbound(msg, channel.clone(), role))
                            .is_err()
                        {
                            return;
                        }
                    }
                    Err(_) => log::debug!("namespace: dropped malformed wire message"),
                },
                None => {
                    if role == ConnRole::MemberSide {
                        let _ = cmd_tx.send(EngineMsg::RouterChannelClosed);
                    }
                    return;
                }
            }
        }
    });
}

/// Outcome of the election job run through the signaling gate. The
/// gate only understands `Success`/`Failure`/`Skipped`; this wraps the
/// extra payload (the claimed endpoint) the namespace engine needs.
enum EngineOutcome {
    ClaimedRouter(Arc<dyn EndpointHandle>),
    Refused,
    Skipped,
}

trait JobOutcomeExt {
    fn with_endpoint(self, endpoint: Arc<dyn EndpointHandle>) -> EngineOutcome;
}

impl JobOutcomeExt for JobOutcome {
    fn with_endpoint(self, endpoint: Arc<dyn EndpointHandle>) -> EngineOutcome {
        match self {
            JobOutcome::Success => EngineOutcome::ClaimedRouter(endpoint),
            JobOutcome::Failure => EngineOutcome::Refused,
            JobOutcome::Skipped => EngineOutcome::Skipped,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::LoopbackTransport;

    fn test_config(label: &str) -> NsConfig {
        let prefix = label.to_string();
        NsConfig {
            label: prefix.clone(),
            router_id: Arc::new({
                let prefix = prefix.clone();
                move |level| format!("{prefix}-{level}")
            }),
            discovery_id: Arc::new({
                let prefix = prefix.clone();
                move |uuid| format!("{prefix}-disc-{uuid}")
            }),
            peer_slot_id: Arc::new(move || format!("{prefix}-p1")),
        }
    }

    fn fast_config() -> OverlayConfig {
        let mut c = OverlayConfig::default();
        c.sg_base_interval_ms = 5;
        c.join_timeout_ms = 200;
        c.peer_slot_jitter_min_ms = 20;
        c.peer_slot_jitter_max_ms = 40;
        c.peer_slot_max_retries = 2;
        c.failover_jitter_min_ms = 1;
        c.failover_jitter_max_ms = 5;
        c.ping_interval_ms = 200;
        c.monitor_l1_interval_ms = 200;
        c.peer_ttl_ms = 50;
        c.peer_ttl_grace_ms = 10;
        c
    }

    #[tokio::test]
    async fn first_peer_becomes_router_second_becomes_member() {
        let transport: Arc<dyn SignalingTransport> = Arc::new(LoopbackTransport::new());
        let gate = SignalingGate::spawn(fast_config(), crate::signaling::default_probe());
        let config = test_config("t-election");

        let router = spawn(
            config.clone(),
            fast_config(),
            gate.clone(),
            transport.clone(),
            "router".into(),
            vec![1],
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(router.snapshot().await.unwrap().role, NsRole::Router);

        let member = spawn(config, fast_config(), gate, transport, "member".into(), vec![2]);
        tokio::time::sleep(Duration::from_millis(100)).await;
        let snap = member.snapshot().await.unwrap();
        assert_eq!(snap.role, NsRole::Member);

        router.teardown();
        member.teardown();
    }
}
