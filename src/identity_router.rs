//! Identity Router (IR): presents the outer API in terms of
//! fingerprints while the transport speaks addresses (§4.5).
//!
//! Owned by one logical task (§5) — every method here takes `&mut
//! self` and is meant to be driven from the single manager task in
//! [`crate::manager`], the same way the design document describes the
//! contact map as "owned by one logical task (the core manager)".

use std::collections::{HashMap, HashSet, VecDeque};

use crate::identity::{Identity, PublicIdentity, SharedKey};
use crate::types::{ChatMessage, Contact, Fingerprint, MessageStatus};

#[derive(Debug, thiserror::Error)]
pub enum IdentityRouterError {
    #[error("no contact known for fingerprint {0}")]
    UnknownContact(Fingerprint),
    #[error("contact unreachable after {attempts} attempts")]
    ContactUnreachable { fingerprint: Fingerprint, attempts: u32 },
    #[error(transparent)]
    Crypto(#[from] crate::identity::CryptoError),
}

pub type Result<T> = std::result::Result<T, IdentityRouterError>;

/// Emitted so callers holding a `Fingerprint` keep working across a
/// migration (§4.5 Address-change migration).
#[derive(Debug, Clone)]
pub struct ContactMigrated {
    pub old_fingerprint: Option<Fingerprint>,
    pub new_fingerprint: Fingerprint,
}

#[derive(Default)]
struct OutboundQueue {
    messages: VecDeque<ChatMessage>,
    direct_attempts: u32,
}

pub struct IdentityRouter {
    contacts: HashMap<Fingerprint, Contact>,
    address_to_fingerprint: HashMap<String, Fingerprint>,
    shared_keys: HashMap<Fingerprint, SharedKey>,
    outbound: HashMap<Fingerprint, OutboundQueue>,
    connecting: HashSet<Fingerprint>,
    max_connect_retries: u32,
}

impl IdentityRouter {
    pub fn new(max_connect_retries: u32) -> Self {
        Self {
            contacts: HashMap::new(),
            address_to_fingerprint: HashMap::new(),
            shared_keys: HashMap::new(),
            outbound: HashMap::new(),
            connecting: HashSet::new(),
            max_connect_retries,
        }
    }

    pub fn insert_contact(&mut self, contact: Contact) {
        self.address_to_fingerprint
            .retain(|_, fp| *fp != contact.fingerprint);
        if let Some(addr) = &contact.current_address {
            self.address_to_fingerprint
                .insert(addr.clone(), contact.fingerprint);
        }
        self.contacts.insert(contact.fingerprint, contact);
    }

    pub fn contact(&self, fingerprint: &Fingerprint) -> Option<&Contact> {
        self.contacts.get(fingerprint)
    }

    pub fn contacts(&self) -> impl Iterator<Item = &Contact> {
        self.contacts.values()
    }

    /// §4.5 Address-change migration: a message arrived over transport
    /// address `address` carrying a verified public key whose
    /// fingerprint is `new_fp`. If an address-keyed record for
    /// `address` already exists under a *different* fingerprint, merge
    /// the two. Idempotent: calling this twice with the same inputs
    /// after the first merge is a no-op (the second call finds
    /// `address` already mapped to `new_fp` and does nothing).
    pub fn migrate_on_verified_message(
        &mut self,
        address: &str,
        new_fp: Fingerprint,
    ) -> Option<ContactMigrated> {
        let old_fp = self.address_to_fingerprint.get(address).copied();
        match old_fp {
            Some(fp) if fp == new_fp => None, // already migrated, idempotent no-op
            Some(old_fp) => {
                if let Some(mut old_contact) = self.contacts.remove(&old_fp) {
                    let merged = match self.contacts.remove(&new_fp) {
                        Some(mut newer) => {
                            newer
                                .known_addresses
                                .extend(std::mem::take(&mut old_contact.known_addresses));
                            if newer.current_address.is_none() {
                                newer.current_address = old_contact.current_address.clone();
                            }
                            newer
                        }
                        None => {
                            old_contact.fingerprint = new_fp;
                            old_contact
                        }
                    };
                    self.address_to_fingerprint.insert(address.to_string(), new_fp);
                    self.contacts.insert(new_fp, merged);
                }
                Some(ContactMigrated {
                    old_fingerprint: Some(old_fp),
                    new_fingerprint: new_fp,
                })
            }
            None => {
                self.address_to_fingerprint.insert(address.to_string(), new_fp);
                None
            }
        }
    }

    /// `shared_key(F)`: returns the cached key or derives it once via
    /// ECDH and caches it, persisting the derived fingerprint on the
    /// contact for restart recovery (§4.5 Pairwise shared key cache).
    pub fn shared_key(&mut self, identity: &Identity, fp: Fingerprint) -> Result<SharedKey> {
        if let Some(key) = self.shared_keys.get(&fp) {
            return Ok(key.clone());
        }
        let contact = self
            .contacts
            .get_mut(&fp)
            .ok_or(IdentityRouterError::UnknownContact(fp))?;
        let peer_public = PublicIdentity { encoded: contact.public_key.clone() };
        let key = identity.derive_shared(&peer_public)?;
        contact.shared_key_fingerprint = Some(key.fingerprint());
        self.shared_keys.insert(fp, key.clone());
        Ok(key)
    }

    pub fn invalidate_shared_key(&mut self, fp: Fingerprint) {
        self.shared_keys.remove(&fp);
        if let Some(c) = self.contacts.get_mut(&fp) {
            c.shared_key_fingerprint = None;
        }
    }

    /// `send(F, msg)` — append to the queue; the caller (manager) is
    /// responsible for attempting delivery via `connect(F)` if no
    /// channel is open. This method only manages queue state, per the
    /// single-owner rule: networking stays in the manager/transport
    /// layer.
    pub fn enqueue(&mut self, fp: Fingerprint, msg: ChatMessage) {
        self.outbound.entry(fp).or_default().messages.push_back(msg);
    }

    pub fn mark_connecting(&mut self, fp: Fingerprint) -> bool {
        self.connecting.insert(fp)
    }

    pub fn clear_connecting(&mut self, fp: Fingerprint) {
        self.connecting.remove(&fp);
    }

    pub fn is_connecting(&self, fp: &Fingerprint) -> bool {
        self.connecting.contains(fp)
    }

    /// Pop the next queued message to send, marking it `Sent`. Caller
    /// performs the actual encrypt+sign+transmit.
    pub fn pop_for_flush(&mut self, fp: Fingerprint) -> Option<ChatMessage> {
        let queue = self.outbound.get_mut(&fp)?;
        let msg = queue.messages.iter_mut().find(|m| m.status == MessageStatus::Waiting)?;
        msg.advance(MessageStatus::Sent);
        Some(msg.clone())
    }

    /// Record a direct-connect failure; once `max_connect_retries` is
    /// exceeded, mark all queued messages `Failed` and report that the
    /// contact should be enrolled in rendezvous.
    pub fn record_connect_failure(&mut self, fp: Fingerprint) -> bool {
        let queue = self.outbound.entry(fp).or_default();
        queue.direct_attempts += 1;
        if queue.direct_attempts >= self.max_connect_retries {
            for m in queue.messages.iter_mut() {
                m.advance(MessageStatus::Failed);
            }
            true
        } else {
            false
        }
    }

    pub fn record_connect_success(&mut self, fp: Fingerprint) {
        if let Some(q) = self.outbound.get_mut(&fp) {
            q.direct_attempts = 0;
        }
    }

    /// §8 property 7: unacked `Sent` messages older than
    /// `ack_timeout_ms` revert to `Waiting` so the next reconnect flush
    /// re-sends them, at most once per flush.
    pub fn sweep_unacked(&mut self, now_ms: u64, ack_timeout_ms: u64) {
        for queue in self.outbound.values_mut() {
            for msg in queue.messages.iter_mut() {
                if msg.status == MessageStatus::Sent
                    && now_ms.saturating_sub(msg.timestamp_ms) > ack_timeout_ms
                {
                    msg.status = MessageStatus::Waiting;
                }
            }
        }
    }

    pub fn ack(&mut self, fp: Fingerprint, id: &str) {
        if let Some(queue) = self.outbound.get_mut(&fp) {
            if let Some(msg) = queue.messages.iter_mut().find(|m| m.id == id) {
                msg.advance(MessageStatus::Delivered);
            }
        }
    }

    /// Contact sweeper (§4.5): up to `batch` offline saved contacts not
    /// currently connecting, for the caller to stagger-reconnect.
    pub fn sweep_offline_contacts(&self, batch: usize) -> Vec<Fingerprint> {
        self.contacts
            .values()
            .filter(|c| !c.is_online() && !self.connecting.contains(&c.fingerprint))
            .take(batch)
            .map(|c| c.fingerprint)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MessageBody;

    fn fp(byte: u8) -> Fingerprint {
        Fingerprint::from_bytes([byte; 8])
    }

    #[test]
    fn migration_is_idempotent() {
        let mut ir = IdentityRouter::new(3);
        let mut old = Contact::new(fp(1), "old".into(), vec![1]);
        old.observe_address("addr-A".into());
        ir.insert_contact(old);

        let first = ir.migrate_on_verified_message("addr-A", fp(2));
        assert!(first.is_some());
        assert!(ir.contact(&fp(2)).is_some());
        assert!(ir.contact(&fp(1)).is_none());

        let second = ir.migrate_on_verified_message("addr-A", fp(2));
        assert!(second.is_none(), "second migration must be a no-op");
    }

    #[test]
    fn queue_flushes_in_order() {
        let mut ir = IdentityRouter::new(3);
        let target = fp(9);
        ir.enqueue(target, ChatMessage::new_outgoing("m1".into(), MessageBody::Text("a".into())));
        ir.enqueue(target, ChatMessage::new_outgoing("m2".into(), MessageBody::Text("b".into())));

        let first = ir.pop_for_flush(target).unwrap();
        assert_eq!(first.id, "m1");
        let second = ir.pop_for_flush(target).unwrap();
        assert_eq!(second.id, "m2");
        assert!(ir.pop_for_flush(target).is_none());
    }

    #[test]
    fn unacked_sent_reverts_to_waiting_after_timeout() {
        let mut ir = IdentityRouter::new(3);
        let target = fp(3);
        let mut msg = ChatMessage::new_outgoing("m1".into(), MessageBody::Text("a".into()));
        msg.timestamp_ms = 0;
        msg.advance(MessageStatus::Sent);
        ir.outbound.entry(target).or_default().messages.push_back(msg);

        ir.sweep_unacked(1000, 2 * 60_000);
        assert_eq!(ir.outbound[&target].messages[0].status, MessageStatus::Sent);

        ir.sweep_unacked(2 * 60_000 + 1000, 2 * 60_000);
        assert_eq!(ir.outbound[&target].messages[0].status, MessageStatus::Waiting);
    }

    #[test]
    fn retry_exhaustion_marks_queue_failed() {
        let mut ir = IdentityRouter::new(2);
        let target = fp(4);
        ir.enqueue(target, ChatMessage::new_outgoing("m1".into(), MessageBody::Text("a".into())));
        assert!(!ir.record_connect_failure(target));
        assert!(ir.record_connect_failure(target));
        assert_eq!(
            ir.outbound[&target].messages[0].status,
            MessageStatus::Failed
        );
    }
}
