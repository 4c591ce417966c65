//! Group Subsystem (GS): multi-party chat layered on top of a
//! dedicated "group" namespace (§4.7). The router for a group
//! namespace only ever relays opaque ciphertext — it never holds the
//! group key — so this module's job is entirely the crypto and local
//! state around that: key lifecycle, message (de/en)cryption against
//! the live key and its history, backfill, file chunking, and call
//! roster bookkeeping.
//!
//! Like [`crate::identity_router`] and [`crate::rendezvous`], groups
//! are owned by the single manager task; nothing here spawns a
//! background task of its own.

use std::collections::HashMap;

use getrandom::SysRng;
use rand_core::{Rng, UnwrapErr};

use crate::identity::{CryptoError, SharedKey};
use crate::types::{
    CallKind, CallParticipant, Fingerprint, GroupCallState, GroupInfo, GroupMember, GroupRole,
};

/// Chunk size for group file transfer (§4.7 Chunked file transfer).
pub const FILE_CHUNK_SIZE: usize = 16 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum GroupError {
    #[error("no group known with id {0}")]
    UnknownGroup(String),
    #[error("caller is not a member of group {0}")]
    NotAMember(String),
    #[error("only the admin may perform this action")]
    NotAdmin,
    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

pub type Result<T> = std::result::Result<T, GroupError>;

#[derive(Debug, Clone, bincode::Encode, bincode::Decode)]
pub struct StoredGroupMessage {
    pub id: String,
    pub from_fp: Fingerprint,
    pub ciphertext: Vec<u8>,
    pub iv: Vec<u8>,
    pub timestamp_ms: u64,
    pub delivered_to: Vec<Fingerprint>,
}

pub struct GroupSubsystem {
    groups: HashMap<String, GroupInfo>,
    history: HashMap<String, Vec<StoredGroupMessage>>,
    calls: HashMap<String, GroupCallState>,
}

fn random_group_key() -> Vec<u8> {
    let mut bytes = [0u8; 32];
    UnwrapErr(SysRng).fill_bytes(&mut bytes);
    bytes.to_vec()
}

impl GroupSubsystem {
    pub fn new() -> Self {
        Self {
            groups: HashMap::new(),
            history: HashMap::new(),
            calls: HashMap::new(),
        }
    }

    /// Re-hydrate from a persisted group map (storage's `load_groups`)
    /// on startup, rather than starting every process with no groups.
    pub fn from_groups(groups: HashMap<String, GroupInfo>) -> Self {
        let history = groups.keys().map(|id| (id.clone(), Vec::new())).collect();
        Self { groups, history, calls: HashMap::new() }
    }

    /// Seed one group's message history from persisted storage. Only
    /// meaningful right after [`Self::from_groups`], before any new
    /// messages have been recorded for that group.
    pub fn seed_history(&mut self, group_id: &str, messages: Vec<StoredGroupMessage>) {
        self.history.insert(group_id.to_string(), messages);
    }

    pub fn group(&self, group_id: &str) -> Option<&GroupInfo> {
        self.groups.get(group_id)
    }

    pub fn groups(&self) -> impl Iterator<Item = &GroupInfo> {
        self.groups.values()
    }

    /// Full stored history for a group, for persistence on shutdown.
    pub fn history(&self, group_id: &str) -> &[StoredGroupMessage] {
        self.history.get(group_id).map(|v| v.as_slice()).unwrap_or(&[])
    }

    /// `create_group`: admin mints a fresh random AES-256 key and
    /// becomes the sole initial member.
    pub fn create_group(
        &mut self,
        group_id: String,
        name: String,
        admin: Fingerprint,
        admin_name: String,
        admin_public_key: Vec<u8>,
        now_ms: u64,
    ) -> &GroupInfo {
        let mut members = HashMap::new();
        members.insert(
            admin,
            GroupMember {
                friendly_name: admin_name,
                role: GroupRole::Admin,
                public_key: admin_public_key,
                current_address: None,
                joined_at_ms: now_ms,
            },
        );
        let info = GroupInfo {
            group_id: group_id.clone(),
            name,
            admin,
            members,
            invite_slug: None,
            current_key: random_group_key(),
            key_history: Vec::new(),
        };
        self.history.insert(group_id.clone(), Vec::new());
        self.groups.entry(group_id).or_insert(info)
    }

    /// Encrypt the current group key for one invitee, using the
    /// pairwise ECDH key the identity router already cached for them
    /// (§4.7 Invite encryption reuses the pairwise key, not a new one).
    pub fn encrypt_invite_key(&self, group_id: &str, invitee_pairwise_key: &SharedKey) -> Result<(Vec<u8>, Vec<u8>)> {
        let info = self.groups.get(group_id).ok_or_else(|| GroupError::UnknownGroup(group_id.to_string()))?;
        let (iv, ct) = invitee_pairwise_key.encrypt(&info.current_key)?;
        Ok((iv, ct))
    }

    /// Decrypt a received invite's group key using the pairwise key
    /// shared with the inviter, then register the group locally from
    /// the accompanying (already-decoded) [`GroupInfo`] snapshot.
    pub fn accept_invite(
        &mut self,
        mut info: GroupInfo,
        inviter_pairwise_key: &SharedKey,
        key_iv: &[u8],
        key_ct: &[u8],
    ) -> Result<()> {
        let key = inviter_pairwise_key.decrypt(key_iv, key_ct)?;
        info.current_key = key;
        self.history.entry(info.group_id.clone()).or_default();
        self.groups.insert(info.group_id.clone(), info);
        Ok(())
    }

    pub fn add_member(&mut self, group_id: &str, fp: Fingerprint, member: GroupMember) -> Result<()> {
        let info = self.groups.get_mut(group_id).ok_or_else(|| GroupError::UnknownGroup(group_id.to_string()))?;
        info.members.insert(fp, member);
        Ok(())
    }

    pub fn encrypt_message(&self, group_id: &str, plaintext: &[u8]) -> Result<(Vec<u8>, Vec<u8>)> {
        let info = self.groups.get(group_id).ok_or_else(|| GroupError::UnknownGroup(group_id.to_string()))?;
        let key = SharedKey::from_raw(to_key_array(&info.current_key)?);
        Ok(key.encrypt(plaintext)?)
    }

    /// Decrypt against the live key, falling back through history
    /// (§3 invariant: every decryptable message's key is in
    /// `{current_key} ∪ key_history`) — needed because a message sent
    /// just before a rotation may arrive just after it.
    pub fn decrypt_message(&self, group_id: &str, iv: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
        let info = self.groups.get(group_id).ok_or_else(|| GroupError::UnknownGroup(group_id.to_string()))?;
        for candidate in info.decrypt_candidates() {
            let Ok(arr) = to_key_array(candidate) else { continue };
            let key = SharedKey::from_raw(arr);
            if let Ok(pt) = key.decrypt(iv, ciphertext) {
                return Ok(pt);
            }
        }
        Err(GroupError::Crypto(CryptoError::DecryptFailed))
    }

    pub fn record_message(&mut self, group_id: &str, msg: StoredGroupMessage) {
        self.history.entry(group_id.to_string()).or_default().push(msg);
    }

    pub fn record_delivery(&mut self, group_id: &str, id: &str, to: Fingerprint) {
        if let Some(msgs) = self.history.get_mut(group_id) {
            if let Some(m) = msgs.iter_mut().find(|m| m.id == id) {
                if !m.delivered_to.contains(&to) {
                    m.delivered_to.push(to);
                }
            }
        }
    }

    /// `backfill(since_ts)`: everything stored strictly after `since_ts`.
    pub fn backfill(&self, group_id: &str, since_ts: u64) -> Vec<&StoredGroupMessage> {
        self.history
            .get(group_id)
            .map(|msgs| msgs.iter().filter(|m| m.timestamp_ms > since_ts).collect())
            .unwrap_or_default()
    }

    /// Kick (admin-only): remove the member and rotate the key so they
    /// lose access to future messages (§4.7).
    pub fn kick(&mut self, group_id: &str, acting_admin: Fingerprint, target: Fingerprint) -> Result<()> {
        let info = self.groups.get_mut(group_id).ok_or_else(|| GroupError::UnknownGroup(group_id.to_string()))?;
        if info.admin != acting_admin {
            return Err(GroupError::NotAdmin);
        }
        info.members.remove(&target);
        info.rotate_key(random_group_key());
        Ok(())
    }

    /// Leave: any member may remove themselves; the group rotates the
    /// key the same way a kick does, so a departed member can't keep
    /// decrypting future traffic even though they knew a prior key.
    pub fn leave(&mut self, group_id: &str, fp: Fingerprint) -> Result<()> {
        let info = self.groups.get_mut(group_id).ok_or_else(|| GroupError::UnknownGroup(group_id.to_string()))?;
        if !info.members.contains_key(&fp) {
            return Err(GroupError::NotAMember(group_id.to_string()));
        }
        info.members.remove(&fp);
        info.rotate_key(random_group_key());
        Ok(())
    }

    pub fn rotate_key(&mut self, group_id: &str) -> Result<()> {
        let info = self.groups.get_mut(group_id).ok_or_else(|| GroupError::UnknownGroup(group_id.to_string()))?;
        info.rotate_key(random_group_key());
        Ok(())
    }

    /// Drop all local state for a group we're no longer part of (left
    /// or kicked) so it stops surfacing through [`Self::group`]/[`Self::groups`].
    pub fn forget(&mut self, group_id: &str) {
        self.groups.remove(group_id);
        self.history.remove(group_id);
    }

    // --- Calls (mesh-only; the router relays signaling, never media) ---

    pub fn start_call(&mut self, call_id: String, kind: CallKind) {
        self.calls.insert(
            call_id.clone(),
            GroupCallState { call_id, kind, participants: HashMap::new() },
        );
    }

    pub fn join_call(&mut self, call_id: &str, fp: Fingerprint, participant: CallParticipant) {
        if let Some(call) = self.calls.get_mut(call_id) {
            call.participants.insert(fp, participant);
        }
    }

    pub fn leave_call(&mut self, call_id: &str, fp: Fingerprint) -> bool {
        if let Some(call) = self.calls.get_mut(call_id) {
            call.participants.remove(&fp);
            if call.participants.is_empty() {
                self.calls.remove(call_id);
                return true; // call ended
            }
        }
        false
    }

    pub fn call(&self, call_id: &str) -> Option<&GroupCallState> {
        self.calls.get(call_id)
    }
}

impl Default for GroupSubsystem {
    fn default() -> Self {
        Self::new()
    }
}

fn to_key_array(bytes: &[u8]) -> Result<[u8; 32]> {
    bytes.try_into().map_err(|_| GroupError::Crypto(CryptoError::KeyDeriveFailed))
}

/// Split a file's bytes into `FILE_CHUNK_SIZE` pieces for
/// [`crate::wire::Message::GroupFileChunk`] (§4.7 Chunked file transfer).
pub fn chunk_file(bytes: &[u8]) -> Vec<&[u8]> {
    bytes.chunks(FILE_CHUNK_SIZE).collect()
}

/// Reassemble chunks received in arbitrary order, keyed by index.
pub fn reassemble_file(chunks: &mut HashMap<u32, Vec<u8>>, total_chunks: u32) -> Option<Vec<u8>> {
    if chunks.len() as u32 != total_chunks {
        return None;
    }
    let mut out = Vec::new();
    for i in 0..total_chunks {
        out.extend_from_slice(chunks.get(&i)?);
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Identity;

    fn fp(byte: u8) -> Fingerprint {
        Fingerprint::from_bytes([byte; 8])
    }

    #[test]
    fn message_roundtrips_and_survives_one_rotation() {
        let mut gs = GroupSubsystem::new();
        gs.create_group("g1".into(), "room".into(), fp(1), "admin".into(), vec![9], 0);

        let (iv, ct) = gs.encrypt_message("g1", b"hello group").unwrap();
        let pt = gs.decrypt_message("g1", &iv, &ct).unwrap();
        assert_eq!(pt, b"hello group");

        gs.rotate_key("g1").unwrap();
        // Old ciphertext still decrypts via key_history.
        let pt_after_rotation = gs.decrypt_message("g1", &iv, &ct).unwrap();
        assert_eq!(pt_after_rotation, b"hello group");
    }

    #[test]
    fn kick_requires_admin_and_rotates_key() {
        let mut gs = GroupSubsystem::new();
        gs.create_group("g1".into(), "room".into(), fp(1), "admin".into(), vec![9], 0);
        gs.add_member(
            "g1",
            fp(2),
            GroupMember {
                friendly_name: "bob".into(),
                role: GroupRole::Member,
                public_key: vec![2],
                current_address: None,
                joined_at_ms: 0,
            },
        )
        .unwrap();
        let key_before = gs.group("g1").unwrap().current_key.clone();

        assert!(matches!(gs.kick("g1", fp(2), fp(2)), Err(GroupError::NotAdmin)));
        gs.kick("g1", fp(1), fp(2)).unwrap();

        let info = gs.group("g1").unwrap();
        assert!(!info.members.contains_key(&fp(2)));
        assert_ne!(info.current_key, key_before);
    }

    #[test]
    fn backfill_only_returns_messages_after_the_watermark() {
        let mut gs = GroupSubsystem::new();
        gs.create_group("g1".into(), "room".into(), fp(1), "admin".into(), vec![9], 0);
        gs.record_message("g1", StoredGroupMessage {
            id: "m1".into(), from_fp: fp(1), ciphertext: vec![], iv: vec![], timestamp_ms: 100, delivered_to: vec![],
        });
        gs.record_message("g1", StoredGroupMessage {
            id: "m2".into(), from_fp: fp(1), ciphertext: vec![], iv: vec![], timestamp_ms: 200, delivered_to: vec![],
        });
        let since_150 = gs.backfill("g1", 150);
        assert_eq!(since_150.len(), 1);
        assert_eq!(since_150[0].id, "m2");
    }

    #[test]
    fn invite_key_roundtrips_through_pairwise_encryption() {
        let mut gs = GroupSubsystem::new();
        gs.create_group("g1".into(), "room".into(), fp(1), "admin".into(), vec![9], 0);
        let original_key = gs.group("g1").unwrap().current_key.clone();

        let inviter = Identity::generate();
        let invitee = Identity::generate();
        let pairwise_for_invitee = inviter.derive_shared(&invitee.public()).unwrap();
        let (iv, ct) = gs.encrypt_invite_key("g1", &pairwise_for_invitee).unwrap();

        let pairwise_for_inviter = invitee.derive_shared(&inviter.public()).unwrap();
        let received_info = gs.group("g1").unwrap().clone();
        let mut gs2 = GroupSubsystem::new();
        gs2.accept_invite(received_info, &pairwise_for_inviter, &iv, &ct).unwrap();
        assert_eq!(gs2.group("g1").unwrap().current_key, original_key);
    }

    #[test]
    fn file_chunking_roundtrips() {
        let data = vec![7u8; FILE_CHUNK_SIZE * 2 + 100];
        let chunks: Vec<Vec<u8>> = chunk_file(&data).into_iter().map(|c| c.to_vec()).collect();
        assert_eq!(chunks.len(), 3);
        let mut map = HashMap::new();
        for (i, c) in chunks.into_iter().enumerate() {
            map.insert(i as u32, c);
        }
        let reassembled = reassemble_file(&mut map, 3).unwrap();
        assert_eq!(reassembled, data);
    }

    #[test]
    fn call_roster_ends_when_last_participant_leaves() {
        let mut gs = GroupSubsystem::new();
        gs.start_call("c1".into(), CallKind::Audio);
        gs.join_call("c1", fp(1), CallParticipant {
            friendly_name: "admin".into(), address: "a".into(), joined_at_ms: 0, has_media: true,
        });
        assert!(gs.call("c1").is_some());
        let ended = gs.leave_call("c1", fp(1));
        assert!(ended);
        assert!(gs.call("c1").is_none());
    }
}
