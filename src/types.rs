//! Shared data types for the overlay: identities, contacts, chat
//! messages, registry entries, and group metadata.
//!
//! These mirror the data model in the design document (§3) directly —
//! this module holds no behavior beyond small invariant-preserving
//! constructors, leaving the state machines to `namespace`,
//! `identity_router`, `rendezvous`, and `group`.

use std::collections::{BTreeSet, HashMap};
use std::fmt;

/// 16-hex-character truncated SHA-256 of a public key — the stable
/// identity of a contact, chosen independently of transport address.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, bincode::Encode, bincode::Decode)]
pub struct Fingerprint([u8; 8]);

impl Fingerprint {
    pub fn from_bytes(bytes: [u8; 8]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 8] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes = hex::decode(s).ok()?;
        let arr: [u8; 8] = bytes.try_into().ok()?;
        Some(Self(arr))
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", self.to_hex())
    }
}

/// Whether a contact request is pending, and in which direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub enum PendingState {
    None,
    Outgoing,
    Incoming,
}

/// A remote identity the user has accepted (or is in the process of
/// accepting). Keyed by [`Fingerprint`] in the owning map.
///
/// Invariants upheld by constructors/mutators in this module:
/// (a) the key under which a `Contact` is stored is always
///     `fingerprint(contact.public_key)`;
/// (b) `current_address`, when set, is always a member of
///     `known_addresses`;
/// (c) `pending == Outgoing` implies `shared_key_fingerprint.is_none()`.
#[derive(Debug, Clone, bincode::Encode, bincode::Decode)]
pub struct Contact {
    pub fingerprint: Fingerprint,
    pub friendly_name: String,
    pub public_key: Vec<u8>,
    pub current_address: Option<String>,
    pub known_addresses: BTreeSet<String>,
    pub shared_key_fingerprint: Option<Fingerprint>,
    pub pending: PendingState,
    pub last_seen_ms: u64,
}

impl Contact {
    pub fn new(fingerprint: Fingerprint, friendly_name: String, public_key: Vec<u8>) -> Self {
        Self {
            fingerprint,
            friendly_name,
            public_key,
            current_address: None,
            known_addresses: BTreeSet::new(),
            shared_key_fingerprint: None,
            pending: PendingState::None,
            last_seen_ms: crate::now_ms(),
        }
    }

    /// Record a newly-seen transport address, maintaining invariant (b).
    pub fn observe_address(&mut self, address: String) {
        self.known_addresses.insert(address.clone());
        self.current_address = Some(address);
        self.last_seen_ms = crate::now_ms();
    }

    pub fn is_online(&self) -> bool {
        self.current_address.is_some()
    }
}

/// Direction of a chat message relative to the local device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub enum Direction {
    Outgoing,
    Incoming,
}

/// Delivery status. Must only ever advance `Waiting -> Sent ->
/// Delivered`, except that a retry may reset `Sent` back to `Waiting`
/// (§3, chat message invariants; §8 property 7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub enum MessageStatus {
    Waiting,
    Sent,
    Delivered,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub enum MessageBody {
    Text(String),
    File { transfer_id: String },
    CallLog { kind: String, duration_ms: u64 },
}

#[derive(Debug, Clone, bincode::Encode, bincode::Decode)]
pub struct ChatMessage {
    pub id: String,
    pub direction: Direction,
    pub body: MessageBody,
    pub timestamp_ms: u64,
    pub status: MessageStatus,
    pub edited: bool,
    pub deleted: bool,
}

impl ChatMessage {
    pub fn new_outgoing(id: String, body: MessageBody) -> Self {
        Self {
            id,
            direction: Direction::Outgoing,
            body,
            timestamp_ms: crate::now_ms(),
            status: MessageStatus::Waiting,
            edited: false,
            deleted: false,
        }
    }

    /// Advance `Waiting -> Sent` or `Sent -> Delivered`. Attempting any
    /// other transition is a no-op (the invariant in §3 is enforced
    /// here rather than trusted to callers).
    pub fn advance(&mut self, target: MessageStatus) {
        use MessageStatus::*;
        let allowed = matches!(
            (self.status, target),
            (Waiting, Sent) | (Sent, Delivered) | (Sent, Waiting) | (_, Failed)
        );
        if allowed {
            self.status = target;
        }
    }
}

/// A peer registry entry, local to one namespace. The transport handle
/// it references is owned by the router; the registry owns the entry
/// itself (design note §9: treat the transport reference as a weak
/// handle invalidated on close, never a second owner).
#[derive(Debug, Clone)]
pub struct RegistryEntry {
    pub discovery_address: String,
    pub friendly_name: String,
    pub last_seen_ms: u64,
    pub public_key: Option<Vec<u8>>,
    pub contact_fingerprint: Option<Fingerprint>,
}

impl RegistryEntry {
    pub fn is_expired(&self, now_ms: u64, ttl_ms: u64, grace_ms: u64) -> bool {
        now_ms.saturating_sub(self.last_seen_ms) > ttl_ms + grace_ms
    }
}

/// A member of a group, as stored in [`GroupInfo::members`].
#[derive(Debug, Clone, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub enum GroupRole {
    Admin,
    Member,
}

#[derive(Debug, Clone, bincode::Encode, bincode::Decode)]
pub struct GroupMember {
    pub friendly_name: String,
    pub role: GroupRole,
    pub public_key: Vec<u8>,
    pub current_address: Option<String>,
    pub joined_at_ms: u64,
}

/// Group metadata, including the live key and archived history needed
/// to decrypt older messages after a rotation (§4.7).
#[derive(Debug, Clone, bincode::Encode, bincode::Decode)]
pub struct GroupInfo {
    pub group_id: String,
    pub name: String,
    pub admin: Fingerprint,
    pub members: HashMap<Fingerprint, GroupMember>,
    pub invite_slug: Option<String>,
    pub current_key: Vec<u8>,
    pub key_history: Vec<Vec<u8>>,
}

impl GroupInfo {
    /// Every decryptable message corresponds to a key in
    /// `{current_key} ∪ key_history` (§3 invariant).
    pub fn decrypt_candidates(&self) -> impl Iterator<Item = &Vec<u8>> {
        std::iter::once(&self.current_key).chain(self.key_history.iter())
    }

    pub fn rotate_key(&mut self, new_key: Vec<u8>) {
        let old = std::mem::replace(&mut self.current_key, new_key);
        self.key_history.push(old);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub enum CallKind {
    Audio,
    Video,
    Screen,
}

#[derive(Debug, Clone, bincode::Encode, bincode::Decode)]
pub struct CallParticipant {
    pub friendly_name: String,
    pub address: String,
    pub joined_at_ms: u64,
    /// `true` once this participant has a negotiated media stream;
    /// `false` means "connecting" even though present in the map.
    pub has_media: bool,
}

#[derive(Debug, Clone, bincode::Encode, bincode::Decode)]
pub struct GroupCallState {
    pub call_id: String,
    pub kind: CallKind,
    pub participants: HashMap<Fingerprint, CallParticipant>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_hex_roundtrip() {
        let fp = Fingerprint::from_bytes([1, 2, 3, 4, 5, 6, 7, 8]);
        let hex = fp.to_hex();
        assert_eq!(hex.len(), 16);
        assert_eq!(Fingerprint::from_hex(&hex), Some(fp));
    }

    #[test]
    fn contact_observe_address_upholds_invariant() {
        let fp = Fingerprint::from_bytes([0; 8]);
        let mut c = Contact::new(fp, "alice".into(), vec![1, 2, 3]);
        c.observe_address("addr-1".into());
        assert!(c.known_addresses.contains(c.current_address.as_ref().unwrap()));
    }

    #[test]
    fn message_status_only_advances_forward() {
        let mut m = ChatMessage::new_outgoing("m1".into(), MessageBody::Text("hi".into()));
        assert_eq!(m.status, MessageStatus::Waiting);
        m.advance(MessageStatus::Delivered); // illegal jump, no-op
        assert_eq!(m.status, MessageStatus::Waiting);
        m.advance(MessageStatus::Sent);
        assert_eq!(m.status, MessageStatus::Sent);
        m.advance(MessageStatus::Delivered);
        assert_eq!(m.status, MessageStatus::Delivered);
    }

    #[test]
    fn group_key_rotation_preserves_history() {
        let mut g = GroupInfo {
            group_id: "g1".into(),
            name: "room".into(),
            admin: Fingerprint::from_bytes([9; 8]),
            members: HashMap::new(),
            invite_slug: None,
            current_key: vec![1; 32],
            key_history: vec![],
        };
        g.rotate_key(vec![2; 32]);
        assert_eq!(g.current_key, vec![2; 32]);
        assert_eq!(g.key_history, vec![vec![1; 32]]);
        assert_eq!(g.decrypt_candidates().count(), 2);
    }
}
