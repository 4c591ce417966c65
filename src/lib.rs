//! Serverless, end-to-end encrypted peer discovery and rendezvous overlay.
//!
//! This crate implements the "core" described in the project's design
//! document: a discovery-and-reconnection overlay that elects a
//! per-namespace coordinator ("router"), maintains peer registries,
//! fails over when the router leaves, derives deterministic per-pair
//! rendezvous addresses from shared secrets, and distributes/rotates
//! encrypted group keys. It never touches a signaling service, a media
//! transport, or a UI directly — those are supplied by the host
//! application through the [`transport::SignalingTransport`] trait and
//! the public API surfaces of each module.
//!
//! Module-to-component map:
//!
//! | module | component |
//! |---|---|
//! | [`identity`] | Identity & Crypto |
//! | [`signaling`] | Signaling Gate |
//! | [`namespace`] | Namespace Engine + Drivers |
//! | [`identity_router`] | Identity Router |
//! | [`rendezvous`] | Rendezvous Subsystem |
//! | [`group`] | Group Subsystem |
//! | [`storage`] | persistence adapter |
//! | [`transport`] | transport abstraction |
//! | [`wire`] | tagged wire protocol |

pub mod config;
pub mod group;
pub mod identity;
pub mod identity_router;
pub mod manager;
pub mod namespace;
pub mod rendezvous;
pub mod signaling;
pub mod storage;
pub mod transport;
pub mod types;
pub mod wire;

pub use config::OverlayConfig;
pub use manager::OverlayManager;

/// Milliseconds since the Unix epoch. The crate uses integer millisecond
/// timestamps everywhere rather than floats so that ordering comparisons
/// (message status transitions, TTL math, rendezvous windows) are exact.
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Render a millisecond timestamp (as produced by [`now_ms`]) as an
/// RFC 3339 string in UTC, for log lines and diagnostics where a raw
/// integer isn't legible.
pub fn format_ms(ms: u64) -> String {
    chrono::DateTime::<chrono::Utc>::from_timestamp_millis(ms as i64)
        .map(|dt| dt.to_rfc3339())
        .unwrap_or_else(|| ms.to_string())
}

/// Initialize the `log`/`env_logger` backend. Safe to call more than once.
pub fn init_logging() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .is_test(cfg!(test))
        .try_init();
}
