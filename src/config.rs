//! Runtime-tunable constants.
//!
//! Section 5 of the design document is explicit that the timer table is
//! part of the contract — peers running with different values will drop
//! each other. [`OverlayConfig::default`] matches those contract values
//! exactly; callers (mainly tests) may override individual fields to
//! run the overlay on a compressed clock.

/// App-wide namespace id prefix, e.g. `peerns`.
pub const DEFAULT_APP_PREFIX: &str = "peerns";

#[derive(Debug, Clone)]
pub struct OverlayConfig {
    /// Namespace id prefix shared by every namespace flavor.
    pub app_prefix: String,

    /// Highest router-election level before a namespace goes "offline".
    pub max_level: u8,

    /// Registry entry eviction: no check-in for this long → evicted.
    pub peer_ttl_ms: u64,
    /// Grace window added on top of `peer_ttl_ms` before eviction.
    pub peer_ttl_grace_ms: u64,
    /// Router ping interval.
    pub ping_interval_ms: u64,
    /// Member interval for probing level-1 router for migration.
    pub monitor_l1_interval_ms: u64,
    /// Peer-slot reverse-connect probe interval (router side).
    pub peer_slot_probe_interval_ms: u64,
    /// Peer-slot waiter retry count before escalating a level.
    pub peer_slot_max_retries: u32,
    /// Peer-slot retry jitter bounds.
    pub peer_slot_jitter_min_ms: u64,
    pub peer_slot_jitter_max_ms: u64,
    /// Channel-open timeout while joining before retrying.
    pub join_timeout_ms: u64,
    /// Join retries before falling back to peer-slot.
    pub join_max_retries: u32,
    /// Failover jitter bounds (every member waits a random delay before
    /// re-attempting election after the router disappears).
    pub failover_jitter_min_ms: u64,
    pub failover_jitter_max_ms: u64,

    /// Rendezvous window width (time-rotating pairwise slug).
    pub rendezvous_window_ms: u64,
    /// Rendezvous activation sweep interval.
    pub rendezvous_sweep_interval_ms: u64,

    /// How often the manager drains each joined group namespace's
    /// relayed traffic (group messages, leaves, kicks, backfill).
    pub group_poll_interval_ms: u64,

    /// Identity Router contact sweep interval.
    pub contact_sweep_interval_ms: u64,
    /// Stagger between successive sweep attempts.
    pub contact_sweep_stagger_ms: u64,
    /// Max contacts touched per sweep tick.
    pub contact_sweep_batch: usize,
    /// Direct-connect attempts before enrolling a contact in rendezvous.
    pub max_connect_retries: u32,
    /// Unacked `sent` messages older than this revert to `waiting`.
    pub message_ack_timeout_ms: u64,

    /// Signaling Gate base inter-emission interval.
    pub sg_base_interval_ms: u64,
    /// Signaling Gate capped interval under throttle.
    pub sg_max_interval_ms: u64,
    /// Signaling Gate external-reachability probe cache TTL.
    pub sg_probe_cache_ms: u64,
    /// Signaling Gate throttle-count decay window with no new throttles.
    pub sg_throttle_decay_idle_ms: u64,
    /// Signaling Gate throttle-count escalation cap (3^min(count,4)).
    pub sg_throttle_escalation_cap: u32,

    /// Keep-alive heartbeat on a pairwise direct channel.
    pub keepalive_heartbeat_ms: u64,
    /// Persistent-endpoint heartbeat (the signaling gate's own endpoint).
    pub persistent_endpoint_heartbeat_ms: u64,
    /// Five-minute periodic checkin some drivers use to refresh presence.
    pub periodic_checkin_ms: u64,
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            app_prefix: DEFAULT_APP_PREFIX.to_string(),
            max_level: 5,

            peer_ttl_ms: 90_000,
            peer_ttl_grace_ms: 10_000,
            ping_interval_ms: 60_000,
            monitor_l1_interval_ms: 30_000,
            peer_slot_probe_interval_ms: 30_000,
            peer_slot_max_retries: 5,
            peer_slot_jitter_min_ms: 3_000,
            peer_slot_jitter_max_ms: 5_000,
            join_timeout_ms: 8_000,
            join_max_retries: 3,
            failover_jitter_min_ms: 0,
            failover_jitter_max_ms: 3_000,

            rendezvous_window_ms: 10 * 60_000,
            rendezvous_sweep_interval_ms: 60_000,

            group_poll_interval_ms: 5_000,

            contact_sweep_interval_ms: 30_000,
            contact_sweep_stagger_ms: 2_000,
            contact_sweep_batch: 3,
            max_connect_retries: 3,
            message_ack_timeout_ms: 2 * 60_000,

            sg_base_interval_ms: 1_500,
            sg_max_interval_ms: 15_000,
            sg_probe_cache_ms: 10_000,
            sg_throttle_decay_idle_ms: 60_000,
            sg_throttle_escalation_cap: 4,

            keepalive_heartbeat_ms: 45_000,
            persistent_endpoint_heartbeat_ms: 20_000,
            periodic_checkin_ms: 300_000,
        }
    }
}
