//! Tagged wire protocol.
//!
//! Design note §9 warns against re-inspecting messages as a loose map
//! inside the engine — decode once at the edge into a single tagged
//! enum per direction, then match on the variant everywhere else. This
//! module is that edge: every message the overlay sends or receives is
//! a [`Message`] variant, encoded with `bincode` rather than the
//! teacher's bespoke binary schema.

use bincode::{Decode, Encode};

#[derive(Debug, Clone, Encode, Decode)]
pub struct SignedEnvelope {
    pub public_key: Vec<u8>,
    pub timestamp_ms: u64,
    pub signature: Vec<u8>,
}

#[derive(Debug, Clone, Encode, Decode)]
pub enum Message {
    // --- Handshake ---
    Request {
        friendly_name: String,
        public_key: Vec<u8>,
        address: String,
        envelope: SignedEnvelope,
    },
    Accepted {
        address: String,
        discovery_uuid: String,
    },
    Rejected,
    Confirm {
        address: String,
        friendly_name: String,
        discovery_uuid: String,
        public_key: Vec<u8>,
    },

    // --- Direct session ---
    Hello {
        friendly_name: String,
        public_key: Vec<u8>,
        envelope: SignedEnvelope,
    },
    EncryptedChat {
        id: String,
        timestamp_ms: u64,
        iv: Vec<u8>,
        ciphertext: Vec<u8>,
        signature: Vec<u8>,
    },
    PlaintextChat {
        id: String,
        timestamp_ms: u64,
        content: String,
    },
    MessageAck {
        id: String,
    },
    MessageEdit {
        id: String,
        iv: Option<Vec<u8>>,
        content: Option<String>,
        signature: Option<Vec<u8>>,
    },
    MessageDelete {
        id: String,
        transfer_id: Option<String>,
    },
    NameUpdate {
        name: String,
    },

    // --- Namespace ---
    Checkin {
        discovery_id: String,
        friendly_name: String,
        public_key: Vec<u8>,
    },
    Registry {
        peers: Vec<RegistryPeer>,
    },
    Ping,
    Pong,
    Migrate {
        level: u8,
    },
    ReverseWelcome,

    // --- Rendezvous ---
    RvzExchange {
        address: String,
        friendly_name: String,
        public_key: Vec<u8>,
        envelope: SignedEnvelope,
    },

    // --- Files ---
    FileStart {
        transfer_id: String,
        name: String,
        size: u64,
        total_chunks: u32,
    },
    FileChunk {
        transfer_id: String,
        index: u32,
        bytes: Vec<u8>,
    },
    FileEnd {
        transfer_id: String,
    },
    FileAck {
        transfer_id: String,
    },

    // --- Calls (1:1) ---
    CallNotify {
        kind: String,
    },
    CallReceived {
        kind: String,
    },
    CallAnswered {
        kind: String,
    },
    CallRejected {
        kind: String,
    },

    // --- Group ---
    GroupInvite {
        group_id: String,
        name: String,
        inviter_fp: String,
        info: Vec<u8>,
        group_key_iv: Option<Vec<u8>>,
        group_key_ct: Option<Vec<u8>>,
    },
    GroupCheckin {
        fp: String,
        name: String,
        public_key: Vec<u8>,
        address: String,
        since_ts: u64,
    },
    GroupMessage {
        id: String,
        ciphertext: Vec<u8>,
        iv: Vec<u8>,
    },
    GroupRelay {
        from_fp: String,
        id: String,
        ciphertext: Vec<u8>,
        iv: Vec<u8>,
    },
    GroupMessageAck {
        id: String,
        fp: String,
    },
    GroupAckRelay {
        id: String,
        delivered_to: Vec<String>,
    },
    GroupEdit {
        id: String,
        iv: Vec<u8>,
        ciphertext: Vec<u8>,
    },
    GroupEditRelay {
        from_fp: String,
        id: String,
        iv: Vec<u8>,
        ciphertext: Vec<u8>,
    },
    GroupDelete {
        id: String,
    },
    GroupDeleteRelay {
        from_fp: String,
        id: String,
    },
    GroupInfoUpdate {
        info: Vec<u8>,
    },
    GroupBackfill {
        messages: Vec<GroupBackfillMessage>,
    },
    GroupKeyDistribute {
        iv: Vec<u8>,
        ciphertext: Vec<u8>,
    },
    GroupKeyRotate {
        iv: Vec<u8>,
        ciphertext: Vec<u8>,
    },
    GroupKicked {
        group_id: String,
    },
    GroupLeave {
        fp: String,
        name: String,
    },
    GroupFileStart {
        transfer_id: String,
        name: String,
        size: u64,
        total_chunks: u32,
    },
    GroupFileChunk {
        transfer_id: String,
        index: u32,
        bytes: Vec<u8>,
    },
    GroupFileEnd {
        transfer_id: String,
    },
    GroupCallSignal {
        signal_type: String,
        payload: Vec<u8>,
    },
    GroupCallStart {
        call_id: String,
        kind: String,
    },
    GroupCallJoin {
        call_id: String,
    },
    GroupCallLeave {
        call_id: String,
    },
}

#[derive(Debug, Clone, Encode, Decode)]
pub struct RegistryPeer {
    pub discovery_address: String,
    pub friendly_name: String,
    pub public_key: Option<Vec<u8>>,
    pub last_seen_ms: u64,
}

#[derive(Debug, Clone, Encode, Decode)]
pub struct GroupBackfillMessage {
    pub id: String,
    pub from_fp: String,
    pub ciphertext: Vec<u8>,
    pub iv: Vec<u8>,
    pub timestamp_ms: u64,
    pub delivered_to: Vec<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("failed to encode message")]
    Encode,
    #[error("failed to decode message: unknown type or missing field")]
    Decode,
}

/// Decode once at the edge, per design note §9.
pub fn decode(bytes: &[u8]) -> Result<Message, WireError> {
    let config = bincode::config::standard();
    bincode::decode_from_slice(bytes, config)
        .map(|(msg, _len)| msg)
        .map_err(|_| WireError::Decode)
}

pub fn encode(msg: &Message) -> Result<Vec<u8>, WireError> {
    let config = bincode::config::standard();
    bincode::encode_to_vec(msg, config).map_err(|_| WireError::Encode)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ping_roundtrips() {
        let bytes = encode(&Message::Ping).unwrap();
        match decode(&bytes).unwrap() {
            Message::Ping => {}
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn decode_garbage_is_an_error_not_a_panic() {
        assert!(decode(&[0xff, 0x00, 0x01]).is_err());
    }
}
