//! The peer registry a namespace's router maintains, and the mirror a
//! member keeps of it. Keyed by each peer's discovery address (§3,
//! Peer registry entry / Namespace state).

use std::collections::HashMap;

use crate::types::RegistryEntry;
use crate::wire::RegistryPeer;

#[derive(Debug, Default, Clone)]
pub struct Registry {
    entries: HashMap<String, RegistryEntry>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, discovery_address: &str) -> Option<&RegistryEntry> {
        self.entries.get(discovery_address)
    }

    pub fn values(&self) -> impl Iterator<Item = &RegistryEntry> {
        self.entries.values()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &RegistryEntry)> {
        self.entries.iter()
    }

    /// Handle a `checkin`: dedupe by public key (evict any older entry
    /// with the same key under a different address), then upsert by
    /// discovery address and refresh last-seen (§4.3 Router
    /// responsibilities).
    pub fn checkin(
        &mut self,
        discovery_address: String,
        friendly_name: String,
        public_key: Option<Vec<u8>>,
        contact_fingerprint: Option<crate::types::Fingerprint>,
        now_ms: u64,
    ) {
        if let Some(ref pk) = public_key {
            let stale: Vec<String> = self
                .entries
                .iter()
                .filter(|(addr, e)| {
                    e.public_key.as_deref() == Some(pk.as_slice()) && **addr != discovery_address
                })
                .map(|(addr, _)| addr.clone())
                .collect();
            for addr in stale {
                self.entries.remove(&addr);
            }
        }
        self.entries.insert(
            discovery_address.clone(),
            RegistryEntry {
                discovery_address,
                friendly_name,
                last_seen_ms: now_ms,
                public_key,
                contact_fingerprint,
            },
        );
    }

    pub fn touch(&mut self, discovery_address: &str, now_ms: u64) {
        if let Some(entry) = self.entries.get_mut(discovery_address) {
            entry.last_seen_ms = now_ms;
        }
    }

    pub fn remove(&mut self, discovery_address: &str) -> Option<RegistryEntry> {
        self.entries.remove(discovery_address)
    }

    /// Evict entries whose last-seen exceeds TTL + grace; returns the
    /// evicted addresses so the caller can decide whether to
    /// rebroadcast.
    pub fn evict_expired(&mut self, now_ms: u64, ttl_ms: u64, grace_ms: u64) -> Vec<String> {
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, e)| e.is_expired(now_ms, ttl_ms, grace_ms))
            .map(|(addr, _)| addr.clone())
            .collect();
        for addr in &expired {
            self.entries.remove(addr);
        }
        expired
    }

    pub fn to_wire(&self) -> Vec<RegistryPeer> {
        self.entries
            .values()
            .map(|e| RegistryPeer {
                discovery_address: e.discovery_address.clone(),
                friendly_name: e.friendly_name.clone(),
                public_key: e.public_key.clone(),
                last_seen_ms: e.last_seen_ms,
            })
            .collect()
    }

    /// Replace the full registry from a broadcast, preserving a single
    /// self-entry the caller supplies (§4.3 Merge rules: "a later
    /// broadcast fully replaces a member's view, with the exception of
    /// the member's own self-entry").
    pub fn replace_from_broadcast(
        &mut self,
        peers: Vec<RegistryPeer>,
        now_ms: u64,
        self_entry: Option<(String, RegistryEntry)>,
    ) {
        self.entries.clear();
        for p in peers {
            self.entries.insert(
                p.discovery_address.clone(),
                RegistryEntry {
                    discovery_address: p.discovery_address,
                    friendly_name: p.friendly_name,
                    last_seen_ms: p.last_seen_ms.min(now_ms),
                    public_key: p.public_key,
                    contact_fingerprint: None,
                },
            );
        }
        if let Some((addr, entry)) = self_entry {
            self.entries.insert(addr, entry);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checkin_dedupes_by_public_key() {
        let mut reg = Registry::new();
        reg.checkin("addr-1".into(), "alice".into(), Some(vec![1, 2, 3]), None, 100);
        reg.checkin("addr-2".into(), "alice".into(), Some(vec![1, 2, 3]), None, 200);
        assert_eq!(reg.len(), 1);
        assert!(reg.get("addr-1").is_none());
        assert!(reg.get("addr-2").is_some());
    }

    #[test]
    fn eviction_respects_ttl_and_grace() {
        let mut reg = Registry::new();
        reg.checkin("addr-1".into(), "alice".into(), None, None, 0);
        let evicted = reg.evict_expired(50_000, 90_000, 10_000);
        assert!(evicted.is_empty());
        let evicted = reg.evict_expired(100_001, 90_000, 10_000);
        assert_eq!(evicted, vec!["addr-1".to_string()]);
    }

    #[test]
    fn broadcast_replace_preserves_self_entry() {
        let mut reg = Registry::new();
        reg.checkin("stale".into(), "ghost".into(), None, None, 0);
        let self_entry = (
            "self-addr".to_string(),
            RegistryEntry {
                discovery_address: "self-addr".into(),
                friendly_name: "me".into(),
                last_seen_ms: 0,
                public_key: None,
                contact_fingerprint: None,
            },
        );
        reg.replace_from_broadcast(vec![], 1_000, Some(self_entry));
        assert!(reg.get("stale").is_none());
        assert!(reg.get("self-addr").is_some());
    }
}
