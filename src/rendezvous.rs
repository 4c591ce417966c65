//! Rendezvous Subsystem (RS): time-rotating, per-contact fallback
//! discovery namespaces used once direct connect attempts to a
//! contact's last known address have been exhausted (§4.6).
//!
//! Like [`crate::identity_router`], this is a plain state container —
//! no background task of its own. The manager drives it by calling
//! [`RendezvousSubsystem::activate`] when a contact needs rendezvous,
//! [`RendezvousSubsystem::sweep_rotation`] on a ticking interval to
//! rebuild windows that have rolled over, and
//! [`RendezvousSubsystem::poll_discovery`] to check whether a peer has
//! shown up in one of the active namespaces.

use std::collections::HashMap;
use std::sync::Arc;

use crate::config::OverlayConfig;
use crate::identity::{self, Identity, PublicIdentity, SharedKey};
use crate::namespace::{self, drivers, NamespaceHandle};
use crate::signaling::SignalingGate;
use crate::transport::SignalingTransport;
use crate::types::Fingerprint;
use crate::wire::{self, Message, SignedEnvelope};

/// A contact successfully reconnected via rendezvous; the caller
/// merges this into the identity router's contact map.
#[derive(Debug, Clone)]
pub struct RendezvousDiscovery {
    pub fingerprint: Fingerprint,
    pub address: String,
    pub friendly_name: String,
}

struct ActiveRendezvous {
    handle: NamespaceHandle,
    shared_key: SharedKey,
    window_index: u64,
    /// Ping-pong protection (§4.6): once we've completed one exchange
    /// with this contact this activation, don't answer a second one
    /// that arrives from a stale duplicate connection attempt.
    exchanged: bool,
}

pub struct RendezvousSubsystem {
    transport: Arc<dyn SignalingTransport>,
    gate: SignalingGate,
    overlay_config: OverlayConfig,
    my_friendly_name: String,
    my_public_key: Vec<u8>,
    active: HashMap<Fingerprint, ActiveRendezvous>,
}

impl RendezvousSubsystem {
    pub fn new(
        transport: Arc<dyn SignalingTransport>,
        gate: SignalingGate,
        overlay_config: OverlayConfig,
        my_friendly_name: String,
        my_public_key: Vec<u8>,
    ) -> Self {
        Self {
            transport,
            gate,
            overlay_config,
            my_friendly_name,
            my_public_key,
            active: HashMap::new(),
        }
    }

    pub fn is_active(&self, fp: &Fingerprint) -> bool {
        self.active.contains_key(fp)
    }

    /// Enroll a contact: spawn (or re-spawn) its rendezvous namespace
    /// under the slug for the current time window.
    pub fn activate(&mut self, fp: Fingerprint, shared_key: SharedKey, now_ms: u64) {
        if self.active.contains_key(&fp) {
            return;
        }
        let window_index = now_ms / self.overlay_config.rendezvous_window_ms;
        let handle = self.spawn_for_window(&shared_key, window_index);
        self.active.insert(
            fp,
            ActiveRendezvous {
                handle,
                shared_key,
                window_index,
                exchanged: false,
            },
        );
    }

    pub fn deactivate(&mut self, fp: &Fingerprint) {
        if let Some(entry) = self.active.remove(fp) {
            entry.handle.teardown();
        }
    }

    fn spawn_for_window(&self, shared_key: &SharedKey, window_index: u64) -> NamespaceHandle {
        let slug = shared_key.rendezvous_slug(window_index);
        let ns_config = drivers::rendezvous(&self.overlay_config.app_prefix, &slug);
        namespace::spawn(
            ns_config,
            self.overlay_config.clone(),
            self.gate.clone(),
            self.transport.clone(),
            self.my_friendly_name.clone(),
            self.my_public_key.clone(),
        )
    }

    /// Window-boundary rotation (§4.6): every active rendezvous whose
    /// window has rolled over gets torn down and rebuilt under the new
    /// slug. Calling this more often than the window width is cheap —
    /// it's a no-op for every entry still in its current window.
    pub fn sweep_rotation(&mut self, now_ms: u64) {
        let current_window = now_ms / self.overlay_config.rendezvous_window_ms;
        let stale: Vec<Fingerprint> = self
            .active
            .iter()
            .filter(|(_, e)| e.window_index != current_window)
            .map(|(fp, _)| *fp)
            .collect();
        for fp in stale {
            if let Some(mut entry) = self.active.remove(&fp) {
                entry.handle.teardown();
                let new_handle = self.spawn_for_window(&entry.shared_key, current_window);
                entry.handle = new_handle;
                entry.window_index = current_window;
                entry.exchanged = false;
                self.active.insert(fp, entry);
            }
        }
    }

    /// Discovery (§4.6): for each active namespace, first answer anyone
    /// who has already dialed our own discovery endpoint directly, then
    /// (if still unanswered) scan the registry for a candidate and dial
    /// them. Both directions end up connecting to a real, listenable
    /// discovery endpoint — the namespace engine claims one for us as
    /// soon as we check in. Returns one [`RendezvousDiscovery`] per
    /// contact that answered this round; the caller is responsible for
    /// merging the result into the identity router and calling
    /// [`Self::deactivate`] once reconnection on the direct path
    /// succeeds.
    pub async fn poll_discovery(&mut self, identity: &Identity) -> Vec<RendezvousDiscovery> {
        let mut found = Vec::new();
        let my_key = self.my_public_key.clone();

        for (fp, entry) in self.active.iter_mut() {
            if entry.exchanged {
                continue;
            }

            for (msg, channel) in entry.handle.drain_discovery_exchanges().await {
                let Message::RvzExchange { address, public_key, envelope, .. } = msg else { continue };
                let payload = exchange_payload(&address, envelope.timestamp_ms);
                let peer_public = PublicIdentity { encoded: public_key.clone() };
                if identity::verify(&peer_public, &envelope.signature, &payload).is_err() {
                    log::warn!("rendezvous: dropped inbound exchange with bad signature");
                    continue;
                }
                let verified_fp = identity::fingerprint(&peer_public);
                if verified_fp != *fp {
                    log::warn!("rendezvous: inbound exchange from unexpected fingerprint");
                    continue;
                }

                let timestamp_ms = crate::now_ms();
                let reply_payload = exchange_payload(&address, timestamp_ms);
                let reply = Message::RvzExchange {
                    address: address.clone(),
                    friendly_name: self.my_friendly_name.clone(),
                    public_key: my_key.clone(),
                    envelope: SignedEnvelope {
                        public_key: my_key.clone(),
                        timestamp_ms,
                        signature: identity.sign(&reply_payload),
                    },
                };
                if let Ok(bytes) = wire::encode(&reply) {
                    let _ = channel.send(bytes).await;
                }

                entry.exchanged = true;
                found.push(RendezvousDiscovery {
                    fingerprint: verified_fp,
                    address,
                    friendly_name: self.my_friendly_name.clone(),
                });
            }
            if entry.exchanged {
                continue;
            }

            let peers = entry.handle.registry_entries().await;
            let candidate = peers
                .iter()
                .find(|p| p.public_key.as_ref().is_some_and(|pk| pk != &my_key));
            let Some(candidate) = candidate else { continue };

            let channel = match self.transport.connect(&candidate.discovery_address).await {
                Ok(c) => c,
                Err(_) => continue,
            };

            let timestamp_ms = crate::now_ms();
            let payload = exchange_payload(&candidate.discovery_address, timestamp_ms);
            let envelope = SignedEnvelope {
                public_key: my_key.clone(),
                timestamp_ms,
                signature: identity.sign(&payload),
            };
            let outbound = Message::RvzExchange {
                address: candidate.discovery_address.clone(),
                friendly_name: self.my_friendly_name.clone(),
                public_key: my_key.clone(),
                envelope,
            };
            let Ok(bytes) = wire::encode(&outbound) else { continue };
            if channel.send(bytes).await.is_err() {
                continue;
            }

            let reply_wait = std::time::Duration::from_millis(self.overlay_config.join_timeout_ms);
            let Ok(Some(reply_bytes)) = tokio::time::timeout(reply_wait, channel.recv()).await else {
                continue;
            };
            let Ok(Message::RvzExchange { address, friendly_name, public_key, envelope }) =
                wire::decode(&reply_bytes)
            else {
                continue;
            };
            let reply_payload = exchange_payload(&address, envelope.timestamp_ms);
            let peer_public = PublicIdentity { encoded: public_key.clone() };
            if identity::verify(&peer_public, &envelope.signature, &reply_payload).is_err() {
                log::warn!("rendezvous: dropped exchange with bad signature");
                continue;
            }
            let verified_fp = identity::fingerprint(&peer_public);
            if verified_fp != *fp {
                log::warn!("rendezvous: exchange answered by unexpected fingerprint");
                continue;
            }

            entry.exchanged = true;
            found.push(RendezvousDiscovery {
                fingerprint: verified_fp,
                address,
                friendly_name,
            });
        }

        found
    }
}

fn exchange_payload(address: &str, timestamp_ms: u64) -> Vec<u8> {
    let mut buf = Vec::with_capacity(address.len() + 8);
    buf.extend_from_slice(address.as_bytes());
    buf.extend_from_slice(&timestamp_ms.to_be_bytes());
    buf
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::LoopbackTransport;

    fn fast_config() -> OverlayConfig {
        let mut c = OverlayConfig::default();
        c.sg_base_interval_ms = 5;
        c.rendezvous_window_ms = 200;
        c
    }

    #[tokio::test]
    async fn activate_is_idempotent_and_deactivate_tears_down() {
        let transport: Arc<dyn SignalingTransport> = Arc::new(LoopbackTransport::new());
        let gate = SignalingGate::spawn(fast_config(), crate::signaling::default_probe());
        let mut rs = RendezvousSubsystem::new(transport, gate, fast_config(), "me".into(), vec![1]);

        let alice = Identity::generate();
        let bob = Identity::generate();
        let shared = alice.derive_shared(&bob.public()).unwrap();
        let fp = bob.fingerprint();

        rs.activate(fp, shared.clone(), 1_000);
        assert!(rs.is_active(&fp));
        rs.activate(fp, shared, 1_000); // second call is a no-op
        assert_eq!(rs.active.len(), 1);

        rs.deactivate(&fp);
        assert!(!rs.is_active(&fp));
    }

    #[tokio::test]
    async fn rotation_rebuilds_namespace_after_window_rolls_over() {
        let transport: Arc<dyn SignalingTransport> = Arc::new(LoopbackTransport::new());
        let gate = SignalingGate::spawn(fast_config(), crate::signaling::default_probe());
        let mut rs = RendezvousSubsystem::new(transport, gate, fast_config(), "me".into(), vec![1]);

        let alice = Identity::generate();
        let bob = Identity::generate();
        let shared = alice.derive_shared(&bob.public()).unwrap();
        let fp = bob.fingerprint();

        rs.activate(fp, shared, 0);
        let first_window = rs.active.get(&fp).unwrap().window_index;
        rs.sweep_rotation(fast_config().rendezvous_window_ms * 3);
        let second_window = rs.active.get(&fp).unwrap().window_index;
        assert_ne!(first_window, second_window);
    }

    #[tokio::test]
    async fn poll_discovery_finds_nothing_before_a_peer_checks_in() {
        let transport: Arc<dyn SignalingTransport> = Arc::new(LoopbackTransport::new());
        let gate = SignalingGate::spawn(fast_config(), crate::signaling::default_probe());

        let alice = Identity::generate();
        let bob = Identity::generate();
        let shared_a = alice.derive_shared(&bob.public()).unwrap();

        let mut rs_a = RendezvousSubsystem::new(
            transport,
            gate,
            fast_config(),
            "alice".into(),
            alice.public().encoded,
        );
        rs_a.activate(bob.fingerprint(), shared_a, 0);
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        // Solo in the namespace (no peer with a matching slug has
        // shown up), so discovery finds no candidate to exchange with.
        let found = rs_a.poll_discovery(&alice).await;
        assert!(found.is_empty());
    }
}
