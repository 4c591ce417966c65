//! The overlay's single-owner manager task (§5): the actor that owns
//! the contact map, chat history, group state, and rendezvous
//! activations, and is the only place that mutates any of them —
//! mirroring the same actor-with-cloneable-handle shape used by
//! [`crate::signaling::SignalingGate`] and [`crate::namespace::engine`].
//!
//! [`OverlayManager`] is the crate's top-level facade: construct one
//! per local identity, and drive every contact/group/message operation
//! through its methods rather than touching [`crate::identity_router`],
//! [`crate::rendezvous`], or [`crate::group`] directly.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};

use crate::config::OverlayConfig;
use crate::group::{GroupError, GroupSubsystem, StoredGroupMessage};
use crate::identity::Identity;
use crate::identity_router::{IdentityRouter, IdentityRouterError};
use crate::namespace::{self, drivers, NamespaceHandle};
use crate::rendezvous::RendezvousSubsystem;
use crate::signaling::SignalingGate;
use crate::storage::{Storage, StorageError};
use crate::transport::{Channel, SignalingTransport};
use crate::types::{ChatMessage, Contact, Fingerprint, GroupInfo, MessageBody};
use crate::wire::{self, Message, SignedEnvelope};

#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error(transparent)]
    IdentityRouter(#[from] IdentityRouterError),
    #[error(transparent)]
    Group(#[from] GroupError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("manager task is no longer running")]
    Gone,
}

pub type Result<T> = std::result::Result<T, ManagerError>;

enum ManagerMsg {
    AddContact(Contact),
    SendMessage { to: Fingerprint, body: MessageBody, reply: oneshot::Sender<Result<()>> },
    Inbound { address: String, bytes: Vec<u8>, reply: oneshot::Sender<()> },
    ContactCount(oneshot::Sender<usize>),
    CreateGroup { group_id: String, name: String, reply: oneshot::Sender<()> },
    GroupCount(oneshot::Sender<usize>),
    SendGroupMessage { group_id: String, text: String, reply: oneshot::Sender<Result<()>> },
    InviteToGroup { group_id: String, invitee: Fingerprint, reply: oneshot::Sender<Result<()>> },
    KickFromGroup { group_id: String, target: Fingerprint, reply: oneshot::Sender<Result<()>> },
    LeaveGroup { group_id: String, reply: oneshot::Sender<Result<()>> },
    GroupBackfill { group_id: String, since_ts: u64, reply: oneshot::Sender<Vec<StoredGroupMessage>> },
    Shutdown,
}

/// Cloneable handle to the running manager actor.
#[derive(Clone)]
pub struct OverlayManager {
    cmd_tx: mpsc::UnboundedSender<ManagerMsg>,
    active: Arc<AtomicBool>,
    pub fingerprint: Fingerprint,
}

impl OverlayManager {
    pub fn spawn(
        identity: Identity,
        overlay_config: OverlayConfig,
        transport: Arc<dyn SignalingTransport>,
        storage: Storage,
        friendly_name: String,
    ) -> Self {
        let fingerprint = identity.fingerprint();
        let public_key = identity.public().encoded;
        let gate = SignalingGate::spawn(overlay_config.clone(), crate::signaling::default_probe());

        let router = match storage.load_contacts() {
            Ok(contacts) => {
                let mut r = IdentityRouter::new(overlay_config.max_connect_retries);
                for c in contacts.into_values() {
                    r.insert_contact(c);
                }
                r
            }
            Err(_) => IdentityRouter::new(overlay_config.max_connect_retries),
        };
        let groups = match storage.load_groups() {
            Ok(map) => {
                let mut gs = GroupSubsystem::from_groups(map);
                let group_ids: Vec<String> = gs.groups().map(|g| g.group_id.clone()).collect();
                for id in group_ids {
                    if let Ok(messages) = storage.load_group_messages(&id) {
                        gs.seed_history(&id, messages);
                    }
                }
                gs
            }
            Err(_) => GroupSubsystem::new(),
        };
        let rendezvous = RendezvousSubsystem::new(
            transport.clone(),
            gate.clone(),
            overlay_config.clone(),
            friendly_name.clone(),
            public_key.clone(),
        );

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let active = Arc::new(AtomicBool::new(true));

        let worker = ManagerWorker {
            identity,
            friendly_name,
            public_key,
            overlay_config,
            transport,
            gate,
            storage,
            router,
            rendezvous,
            groups,
            group_namespaces: HashMap::new(),
            direct_channels: HashMap::new(),
            chat_history: HashMap::new(),
            self_cmd_tx: cmd_tx.clone(),
            active: active.clone(),
        };

        tokio::spawn(worker.run(cmd_rx));

        Self { cmd_tx, active, fingerprint }
    }

    pub fn add_contact(&self, contact: Contact) {
        let _ = self.cmd_tx.send(ManagerMsg::AddContact(contact));
    }

    pub async fn send_text(&self, to: Fingerprint, text: String) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(ManagerMsg::SendMessage { to, body: MessageBody::Text(text), reply })
            .map_err(|_| ManagerError::Gone)?;
        rx.await.map_err(|_| ManagerError::Gone)?
    }

    /// Feed the manager a message that arrived out-of-band (e.g. from a
    /// direct inbound connection accepted by the host application).
    pub async fn handle_inbound(&self, address: String, bytes: Vec<u8>) {
        let (reply, rx) = oneshot::channel();
        if self.cmd_tx.send(ManagerMsg::Inbound { address, bytes, reply }).is_ok() {
            let _ = rx.await;
        }
    }

    pub async fn contact_count(&self) -> usize {
        let (reply, rx) = oneshot::channel();
        if self.cmd_tx.send(ManagerMsg::ContactCount(reply)).is_err() {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    /// Mint a new group with this identity as its sole admin member.
    pub async fn create_group(&self, group_id: String, name: String) {
        let (reply, rx) = oneshot::channel();
        if self.cmd_tx.send(ManagerMsg::CreateGroup { group_id, name, reply }).is_ok() {
            let _ = rx.await;
        }
    }

    pub async fn group_count(&self) -> usize {
        let (reply, rx) = oneshot::channel();
        if self.cmd_tx.send(ManagerMsg::GroupCount(reply)).is_err() {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    /// Encrypt and relay a text message to every other member of `group_id`.
    pub async fn send_group_text(&self, group_id: String, text: String) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(ManagerMsg::SendGroupMessage { group_id, text, reply })
            .map_err(|_| ManagerError::Gone)?;
        rx.await.map_err(|_| ManagerError::Gone)?
    }

    /// Invite a known contact into a group we admin or belong to.
    pub async fn invite_to_group(&self, group_id: String, invitee: Fingerprint) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(ManagerMsg::InviteToGroup { group_id, invitee, reply })
            .map_err(|_| ManagerError::Gone)?;
        rx.await.map_err(|_| ManagerError::Gone)?
    }

    /// Admin-only: remove a member and rotate the group key.
    pub async fn kick_from_group(&self, group_id: String, target: Fingerprint) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(ManagerMsg::KickFromGroup { group_id, target, reply })
            .map_err(|_| ManagerError::Gone)?;
        rx.await.map_err(|_| ManagerError::Gone)?
    }

    pub async fn leave_group(&self, group_id: String) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(ManagerMsg::LeaveGroup { group_id, reply })
            .map_err(|_| ManagerError::Gone)?;
        rx.await.map_err(|_| ManagerError::Gone)?
    }

    pub async fn group_backfill(&self, group_id: String, since_ts: u64) -> Vec<StoredGroupMessage> {
        let (reply, rx) = oneshot::channel();
        if self.cmd_tx.send(ManagerMsg::GroupBackfill { group_id, since_ts, reply }).is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    pub fn shutdown(&self) {
        self.active.store(false, Ordering::Relaxed);
        let _ = self.cmd_tx.send(ManagerMsg::Shutdown);
    }
}

struct ManagerWorker {
    identity: Identity,
    friendly_name: String,
    public_key: Vec<u8>,
    overlay_config: OverlayConfig,
    transport: Arc<dyn SignalingTransport>,
    gate: SignalingGate,
    storage: Storage,
    router: IdentityRouter,
    rendezvous: RendezvousSubsystem,
    groups: GroupSubsystem,
    /// Namespace handle per group we're currently a member of, keyed by
    /// group id (§4.7 — each group gets its own namespace).
    group_namespaces: HashMap<String, NamespaceHandle>,
    direct_channels: HashMap<Fingerprint, Arc<dyn Channel>>,
    chat_history: HashMap<Fingerprint, Vec<ChatMessage>>,
    self_cmd_tx: mpsc::UnboundedSender<ManagerMsg>,
    active: Arc<AtomicBool>,
}

impl ManagerWorker {
    async fn run(mut self, mut cmd_rx: mpsc::UnboundedReceiver<ManagerMsg>) {
        let group_ids: Vec<String> = self.groups.groups().map(|g| g.group_id.clone()).collect();
        for group_id in group_ids {
            self.join_group_namespace(&group_id);
        }

        let mut sweep_contacts = tokio::time::interval(Duration::from_millis(self.overlay_config.contact_sweep_interval_ms));
        let mut sweep_rendezvous = tokio::time::interval(Duration::from_millis(self.overlay_config.rendezvous_sweep_interval_ms));
        let mut sweep_acks = tokio::time::interval(Duration::from_millis(self.overlay_config.message_ack_timeout_ms.max(1000)));
        let mut sweep_groups = tokio::time::interval(Duration::from_millis(self.overlay_config.group_poll_interval_ms));

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(ManagerMsg::Shutdown) | None => {
                            self.active.store(false, Ordering::Relaxed);
                            let _ = self.storage.save_contacts(&self.router.contacts().cloned().map(|c| (c.fingerprint, c)).collect());
                            for (fp, history) in &self.chat_history {
                                let _ = self.storage.save_chat_history(fp, history);
                            }
                            let groups_map: HashMap<String, GroupInfo> =
                                self.groups.groups().map(|g| (g.group_id.clone(), g.clone())).collect();
                            let _ = self.storage.save_groups(&groups_map);
                            for group_id in groups_map.keys() {
                                let _ = self.storage.save_group_messages(group_id, self.groups.history(group_id));
                            }
                            return;
                        }
                        Some(ManagerMsg::AddContact(c)) => {
                            self.router.insert_contact(c);
                        }
                        Some(ManagerMsg::SendMessage { to, body, reply }) => {
                            let result = self.send_message(to, body).await;
                            let _ = reply.send(result);
                        }
                        Some(ManagerMsg::Inbound { address, bytes, reply }) => {
                            self.on_inbound(address, bytes).await;
                            let _ = reply.send(());
                        }
                        Some(ManagerMsg::ContactCount(reply)) => {
                            let _ = reply.send(self.router.contacts().count());
                        }
                        Some(ManagerMsg::CreateGroup { group_id, name, reply }) => {
                            self.groups.create_group(
                                group_id.clone(),
                                name,
                                self.identity.fingerprint(),
                                self.friendly_name.clone(),
                                self.public_key.clone(),
                                crate::now_ms(),
                            );
                            self.join_group_namespace(&group_id);
                            let _ = reply.send(());
                        }
                        Some(ManagerMsg::GroupCount(reply)) => {
                            let _ = reply.send(self.groups.groups().count());
                        }
                        Some(ManagerMsg::SendGroupMessage { group_id, text, reply }) => {
                            let result = self.send_group_message(&group_id, &text).await;
                            let _ = reply.send(result);
                        }
                        Some(ManagerMsg::InviteToGroup { group_id, invitee, reply }) => {
                            let result = self.invite_to_group(&group_id, invitee).await;
                            let _ = reply.send(result);
                        }
                        Some(ManagerMsg::KickFromGroup { group_id, target, reply }) => {
                            let result = self.kick_from_group(&group_id, target).await;
                            let _ = reply.send(result);
                        }
                        Some(ManagerMsg::LeaveGroup { group_id, reply }) => {
                            let result = self.leave_group(&group_id).await;
                            let _ = reply.send(result);
                        }
                        Some(ManagerMsg::GroupBackfill { group_id, since_ts, reply }) => {
                            let messages = self.groups.backfill(&group_id, since_ts).into_iter().cloned().collect();
                            let _ = reply.send(messages);
                        }
                    }
                }
                _ = sweep_contacts.tick() => {
                    self.run_contact_sweep().await;
                }
                _ = sweep_rendezvous.tick() => {
                    self.rendezvous.sweep_rotation(crate::now_ms());
                    self.run_rendezvous_discovery().await;
                }
                _ = sweep_acks.tick() => {
                    self.router.sweep_unacked(crate::now_ms(), self.overlay_config.message_ack_timeout_ms);
                }
                _ = sweep_groups.tick() => {
                    self.drain_group_relays().await;
                }
            }
        }
    }

    async fn send_message(&mut self, to: Fingerprint, body: MessageBody) -> Result<()> {
        let id = uuid::Uuid::new_v4().to_string();
        let msg = ChatMessage::new_outgoing(id, body);
        self.router.enqueue(to, msg);
        self.flush(to).await
    }

    async fn flush(&mut self, to: Fingerprint) -> Result<()> {
        if let Some(channel) = self.direct_channels.get(&to).cloned() {
            self.send_queued_over(to, &channel).await;
            return Ok(());
        }
        self.connect_and_flush(to).await
    }

    async fn connect_and_flush(&mut self, to: Fingerprint) -> Result<()> {
        let Some(contact) = self.router.contact(&to).cloned() else {
            return Err(IdentityRouterError::UnknownContact(to).into());
        };
        let Some(address) = contact.current_address.clone() else {
            self.router.record_connect_failure(to);
            return Ok(()); // nothing to connect to yet; rendezvous sweep will pick it up
        };
        if !self.router.mark_connecting(to) {
            return Ok(()); // already connecting
        }
        match self.transport.connect(&address).await {
            Ok(channel) => {
                self.router.clear_connecting(to);
                self.router.record_connect_success(to);
                self.direct_channels.insert(to, channel.clone());
                self.send_hello(&channel).await;
                self.send_queued_over(to, &channel).await;
            }
            Err(_) => {
                self.router.clear_connecting(to);
                if self.router.record_connect_failure(to) {
                    if let Ok(shared) = self.router.shared_key(&self.identity, to) {
                        self.rendezvous.activate(to, shared, crate::now_ms());
                    }
                }
            }
        }
        Ok(())
    }

    async fn send_hello(&self, channel: &Arc<dyn Channel>) {
        let timestamp_ms = crate::now_ms();
        let envelope = SignedEnvelope {
            public_key: self.public_key.clone(),
            timestamp_ms,
            signature: self.identity.sign(&timestamp_ms.to_be_bytes()),
        };
        let msg = Message::Hello { friendly_name: self.friendly_name.clone(), public_key: self.public_key.clone(), envelope };
        if let Ok(bytes) = wire::encode(&msg) {
            let _ = channel.send(bytes).await;
        }
    }

    async fn send_queued_over(&mut self, to: Fingerprint, channel: &Arc<dyn Channel>) {
        while let Some(msg) = self.router.pop_for_flush(to) {
            let Ok(shared) = self.router.shared_key(&self.identity, to) else { continue };
            let MessageBody::Text(text) = &msg.body else { continue };
            let Ok((iv, ciphertext)) = shared.encrypt(text.as_bytes()) else { continue };
            let signature = self.identity.sign(&ciphertext);
            let wire_msg = Message::EncryptedChat {
                id: msg.id.clone(),
                timestamp_ms: msg.timestamp_ms,
                iv,
                ciphertext,
                signature,
            };
            if let Ok(bytes) = wire::encode(&wire_msg) {
                let _ = channel.send(bytes).await;
            }
        }
    }

    async fn on_inbound(&mut self, address: String, bytes: Vec<u8>) {
        let Ok(msg) = wire::decode(&bytes) else {
            log::debug!("manager: dropped malformed inbound message from {address}");
            return;
        };
        match msg {
            Message::Hello { public_key, envelope, .. } => {
                let peer_public = crate::identity::PublicIdentity { encoded: public_key };
                if crate::identity::verify(&peer_public, &envelope.signature, &envelope.timestamp_ms.to_be_bytes()).is_err() {
                    log::warn!("manager: dropped Hello with invalid signature from {address}");
                    return;
                }
                let fp = crate::identity::fingerprint(&peer_public);
                if let Some(migration) = self.router.migrate_on_verified_message(&address, fp) {
                    log::info!("manager: contact migrated {:?} -> {}", migration.old_fingerprint, migration.new_fingerprint);
                }
            }
            Message::EncryptedChat { id, timestamp_ms, iv, ciphertext, .. } => {
                if let Some(fp) = self.fingerprint_for_address(&address) {
                    if let Ok(shared) = self.router.shared_key(&self.identity, fp) {
                        if let Ok(plaintext) = shared.decrypt(&iv, &ciphertext) {
                            if let Ok(text) = String::from_utf8(plaintext) {
                                let mut incoming = ChatMessage::new_outgoing(id.clone(), MessageBody::Text(text));
                                incoming.direction = crate::types::Direction::Incoming;
                                incoming.timestamp_ms = timestamp_ms;
                                self.chat_history.entry(fp).or_default().push(incoming);
                                if let Some(channel) = self.direct_channels.get(&fp) {
                                    if let Ok(bytes) = wire::encode(&Message::MessageAck { id }) {
                                        let _ = channel.send(bytes).await;
                                    }
                                }
                            }
                        }
                    }
                }
            }
            Message::MessageAck { id } => {
                if let Some(fp) = self.fingerprint_for_address(&address) {
                    self.router.ack(fp, &id);
                }
            }
            Message::GroupInvite { group_id, name, inviter_fp, info, group_key_iv, group_key_ct } => {
                self.handle_group_invite(group_id, name, inviter_fp, info, group_key_iv, group_key_ct).await;
            }
            Message::GroupKicked { group_id } => {
                if let Some(handle) = self.group_namespaces.remove(&group_id) {
                    handle.teardown();
                }
                self.groups.forget(&group_id);
            }
            other => {
                log::debug!("manager: unhandled inbound variant {other:?}");
            }
        }
    }

    fn fingerprint_for_address(&self, address: &str) -> Option<Fingerprint> {
        self.router.contacts().find(|c| c.current_address.as_deref() == Some(address)).map(|c| c.fingerprint)
    }

    async fn run_contact_sweep(&mut self) {
        let batch = self.router.sweep_offline_contacts(self.overlay_config.contact_sweep_batch);
        for (i, fp) in batch.into_iter().enumerate() {
            let stagger = self.overlay_config.contact_sweep_stagger_ms * i as u64;
            tokio::time::sleep(Duration::from_millis(stagger)).await;
            let _ = self.connect_and_flush(fp).await;
        }
    }

    async fn run_rendezvous_discovery(&mut self) {
        let discoveries = self.rendezvous.poll_discovery(&self.identity).await;
        for d in discoveries {
            if let Some(contact) = self.router.contact(&d.fingerprint).cloned() {
                let mut updated = contact;
                updated.observe_address(d.address);
                self.router.insert_contact(updated);
                self.rendezvous.deactivate(&d.fingerprint);
                let _ = self.connect_and_flush(d.fingerprint).await;
            }
        }
    }

    /// Spawn (if not already joined) the dedicated namespace a group's
    /// members use to relay ciphertext (§4.7).
    fn join_group_namespace(&mut self, group_id: &str) {
        if self.group_namespaces.contains_key(group_id) {
            return;
        }
        let ns_config = drivers::group(&self.overlay_config.app_prefix, group_id);
        let handle = namespace::spawn(
            ns_config,
            self.overlay_config.clone(),
            self.gate.clone(),
            self.transport.clone(),
            self.friendly_name.clone(),
            self.public_key.clone(),
        );
        self.group_namespaces.insert(group_id.to_string(), handle);
    }

    async fn send_group_message(&mut self, group_id: &str, text: &str) -> Result<()> {
        let (iv, ciphertext) = self.groups.encrypt_message(group_id, text.as_bytes())?;
        let Some(handle) = self.group_namespaces.get(group_id) else {
            return Err(GroupError::UnknownGroup(group_id.to_string()).into());
        };
        let id = uuid::Uuid::new_v4().to_string();
        let from_fp = self.identity.fingerprint();
        let msg = Message::GroupRelay {
            from_fp: from_fp.to_hex(),
            id: id.clone(),
            ciphertext: ciphertext.clone(),
            iv: iv.clone(),
        };
        handle.send_to_router(msg).await;
        self.groups.record_message(group_id, StoredGroupMessage {
            id,
            from_fp,
            ciphertext,
            iv,
            timestamp_ms: crate::now_ms(),
            delivered_to: vec![from_fp],
        });
        Ok(())
    }

    /// Encrypt the group key for `invitee` under the pairwise key and
    /// send the invite directly over their existing connection (they
    /// aren't a group member yet, so there's no group namespace to
    /// relay this through).
    async fn invite_to_group(&mut self, group_id: &str, invitee: Fingerprint) -> Result<()> {
        let info = self
            .groups
            .group(group_id)
            .cloned()
            .ok_or_else(|| GroupError::UnknownGroup(group_id.to_string()))?;
        let pairwise = self.router.shared_key(&self.identity, invitee)?;
        let (key_iv, key_ct) = self.groups.encrypt_invite_key(group_id, &pairwise)?;
        let config = bincode::config::standard();
        let Ok(info_bytes) = bincode::encode_to_vec(&info, config) else {
            return Ok(());
        };
        let msg = Message::GroupInvite {
            group_id: group_id.to_string(),
            name: info.name.clone(),
            inviter_fp: self.identity.fingerprint().to_hex(),
            info: info_bytes,
            group_key_iv: Some(key_iv),
            group_key_ct: Some(key_ct),
        };
        if let Some(channel) = self.direct_channels.get(&invitee).cloned() {
            if let Ok(bytes) = wire::encode(&msg) {
                let _ = channel.send(bytes).await;
            }
        }
        Ok(())
    }

    async fn kick_from_group(&mut self, group_id: &str, target: Fingerprint) -> Result<()> {
        self.groups.kick(group_id, self.identity.fingerprint(), target)?;
        if let Some(channel) = self.direct_channels.get(&target).cloned() {
            let msg = Message::GroupKicked { group_id: group_id.to_string() };
            if let Ok(bytes) = wire::encode(&msg) {
                let _ = channel.send(bytes).await;
            }
        }
        Ok(())
    }

    async fn leave_group(&mut self, group_id: &str) -> Result<()> {
        self.groups.leave(group_id, self.identity.fingerprint())?;
        if let Some(handle) = self.group_namespaces.remove(group_id) {
            let msg = Message::GroupLeave {
                fp: self.identity.fingerprint().to_hex(),
                name: self.friendly_name.clone(),
            };
            handle.send_to_router(msg).await;
            handle.teardown();
        }
        self.groups.forget(group_id);
        Ok(())
    }

    /// Drain every joined group namespace's relayed traffic and apply
    /// it to local group state (§4.7). The namespace engine itself
    /// never interprets this payload (§9) — that happens here, the one
    /// place with both the group key and identity-verification context.
    async fn drain_group_relays(&mut self) {
        let group_ids: Vec<String> = self.group_namespaces.keys().cloned().collect();
        for group_id in group_ids {
            let Some(handle) = self.group_namespaces.get(&group_id) else { continue };
            let messages = handle.drain_relay().await;
            for msg in messages {
                self.handle_group_relay_message(&group_id, msg).await;
            }
        }
    }

    async fn handle_group_relay_message(&mut self, group_id: &str, msg: Message) {
        match msg {
            Message::GroupRelay { from_fp, id, ciphertext, iv } => {
                if self.groups.decrypt_message(group_id, &iv, &ciphertext).is_err() {
                    log::warn!("manager: dropped undecryptable message in group {group_id}");
                    return;
                }
                let Some(from) = Fingerprint::from_hex(&from_fp) else { return };
                self.groups.record_message(group_id, StoredGroupMessage {
                    id,
                    from_fp: from,
                    ciphertext,
                    iv,
                    timestamp_ms: crate::now_ms(),
                    delivered_to: vec![self.identity.fingerprint()],
                });
            }
            Message::GroupLeave { fp, name } => {
                if let Some(departed) = Fingerprint::from_hex(&fp) {
                    log::info!("manager: {name} left group {group_id}");
                    let _ = self.groups.leave(group_id, departed);
                }
            }
            Message::GroupBackfill { messages } => {
                for m in messages {
                    let Some(from) = Fingerprint::from_hex(&m.from_fp) else { continue };
                    self.groups.record_message(group_id, StoredGroupMessage {
                        id: m.id,
                        from_fp: from,
                        ciphertext: m.ciphertext,
                        iv: m.iv,
                        timestamp_ms: m.timestamp_ms,
                        delivered_to: m.delivered_to.iter().filter_map(|f| Fingerprint::from_hex(f)).collect(),
                    });
                }
            }
            other => {
                log::debug!("manager: unhandled group relay variant in {group_id}: {other:?}");
            }
        }
    }

    async fn handle_group_invite(
        &mut self,
        group_id: String,
        name: String,
        inviter_fp: String,
        info: Vec<u8>,
        group_key_iv: Option<Vec<u8>>,
        group_key_ct: Option<Vec<u8>>,
    ) {
        let (Some(iv), Some(ct)) = (group_key_iv, group_key_ct) else {
            log::warn!("manager: dropped group invite to {group_id} missing key material");
            return;
        };
        let Some(inviter) = Fingerprint::from_hex(&inviter_fp) else { return };
        let Ok(pairwise) = self.router.shared_key(&self.identity, inviter) else {
            log::warn!("manager: dropped group invite from unknown inviter {inviter_fp}");
            return;
        };
        let config = bincode::config::standard();
        let Ok((group_info, _)) = bincode::decode_from_slice::<GroupInfo, _>(&info, config) else {
            log::warn!("manager: dropped group invite with malformed info for {group_id}");
            return;
        };
        log::info!(
            "manager: received invite to group '{name}' ({group_id}) from {inviter_fp} at {}",
            crate::format_ms(crate::now_ms())
        );
        if self.groups.accept_invite(group_info, &pairwise, &iv, &ct).is_ok() {
            self.join_group_namespace(&group_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::LoopbackTransport;

    fn fast_config() -> OverlayConfig {
        let mut c = OverlayConfig::default();
        c.sg_base_interval_ms = 5;
        c.contact_sweep_interval_ms = 50;
        c.rendezvous_sweep_interval_ms = 50;
        c.message_ack_timeout_ms = 1000;
        c
    }

    #[tokio::test]
    async fn add_contact_is_visible_through_count() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::open(dir.path().to_path_buf()).unwrap();
        let identity = Identity::generate();
        let transport: Arc<dyn SignalingTransport> = Arc::new(LoopbackTransport::new());
        let manager = OverlayManager::spawn(identity, fast_config(), transport, storage, "me".into());

        let peer = Identity::generate();
        manager.add_contact(Contact::new(peer.fingerprint(), "friend".into(), peer.public().encoded));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(manager.contact_count().await, 1);
        manager.shutdown();
    }

    #[tokio::test]
    async fn send_to_unknown_contact_errors() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::open(dir.path().to_path_buf()).unwrap();
        let identity = Identity::generate();
        let transport: Arc<dyn SignalingTransport> = Arc::new(LoopbackTransport::new());
        let manager = OverlayManager::spawn(identity, fast_config(), transport, storage, "me".into());

        let ghost = Fingerprint::from_bytes([9; 8]);
        let result = manager.send_text(ghost, "hi".into()).await;
        assert!(result.is_err());
        manager.shutdown();
    }

    #[tokio::test]
    async fn group_lifecycle_through_the_facade() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::open(dir.path().to_path_buf()).unwrap();
        let identity = Identity::generate();
        let transport: Arc<dyn SignalingTransport> = Arc::new(LoopbackTransport::new());
        let manager = OverlayManager::spawn(identity, fast_config(), transport, storage, "me".into());

        manager.create_group("g1".into(), "room".into()).await;
        assert_eq!(manager.group_count().await, 1);

        manager.send_group_text("g1".into(), "hello".into()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        let backfill = manager.group_backfill("g1".into(), 0).await;
        assert_eq!(backfill.len(), 1);

        manager.leave_group("g1".into()).await.unwrap();
        assert_eq!(manager.group_count().await, 0);
        manager.shutdown();
    }

    #[tokio::test]
    async fn groups_survive_a_restart() {
        let dir = tempfile::tempdir().unwrap();
        let identity = Identity::generate();
        let transport: Arc<dyn SignalingTransport> = Arc::new(LoopbackTransport::new());

        let identity_bytes = identity.to_bytes();
        let storage = Storage::open(dir.path().to_path_buf()).unwrap();
        let manager = OverlayManager::spawn(identity, fast_config(), transport.clone(), storage, "me".into());
        manager.create_group("g1".into(), "room".into()).await;
        manager.send_group_text("g1".into(), "hello".into()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        manager.shutdown();
        tokio::time::sleep(Duration::from_millis(30)).await;

        let reloaded = Identity::from_bytes(&identity_bytes).unwrap();
        let storage = Storage::open(dir.path().to_path_buf()).unwrap();
        let manager = OverlayManager::spawn(reloaded, fast_config(), transport, storage, "me".into());
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(manager.group_count().await, 1);
        assert_eq!(manager.group_backfill("g1".into(), 0).await.len(), 1);
        manager.shutdown();
    }
}
