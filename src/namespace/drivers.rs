//! Namespace Drivers (ND): thin config wrappers over the generic
//! [`super::engine`], one per namespace flavor (§4.4). Each driver's
//! only job is producing an [`NsConfig`] with the right id format and,
//! for the geo driver, deciding how many [`NsConfig`]s (one per
//! covering cell) to hand to the engine. None of this module computes
//! geohash math itself — that's the named external collaborator; the
//! geo driver is handed already-computed cell strings.

use std::sync::Arc;

use super::engine::NsConfig;

fn router_id_fn(prefix: String) -> Arc<dyn Fn(u8) -> String + Send + Sync> {
    Arc::new(move |level| format!("{prefix}-{level}"))
}

fn discovery_id_fn(prefix: String) -> Arc<dyn Fn(&str) -> String + Send + Sync> {
    Arc::new(move |uuid| format!("{prefix}-{uuid}"))
}

fn peer_slot_id_fn(prefix: String) -> Arc<dyn Fn() -> String + Send + Sync> {
    Arc::new(move || format!("{prefix}-p1"))
}

fn make_config(app_prefix: &str, label: String, slug: String) -> NsConfig {
    let router_prefix = format!("{app_prefix}-{slug}");
    let discovery_prefix = router_prefix.clone();
    let peer_slot_prefix = router_prefix.clone();
    NsConfig {
        label,
        router_id: router_id_fn(router_prefix),
        discovery_id: discovery_id_fn(discovery_prefix),
        peer_slot_id: peer_slot_id_fn(peer_slot_prefix),
    }
}

/// Same-network auto-discovery, keyed by the device's public IP
/// (octets pre-formatted by the caller, e.g. `"203-0-113-7"`).
pub fn public_ip(app_prefix: &str, ip_octets: &str) -> NsConfig {
    make_config(app_prefix, format!("ip:{ip_octets}"), format!("{ip_octets}"))
}

/// A named room the user explicitly joined.
pub fn custom(app_prefix: &str, slug: &str) -> NsConfig {
    make_config(app_prefix, format!("custom:{slug}"), format!("ns-{slug}"))
}

/// One physical-proximity cell. [`geo_covering`] builds one of these
/// per cell in the covering set.
pub fn geo_cell(app_prefix: &str, geohash7: &str) -> NsConfig {
    make_config(app_prefix, format!("geo:{geohash7}"), format!("geo-{geohash7}"))
}

/// Group chat routing namespace for one group id.
pub fn group(app_prefix: &str, group_id: &str) -> NsConfig {
    make_config(app_prefix, format!("group:{group_id}"), format!("group-{group_id}"))
}

/// Per-pair reconnection namespace under a time-rotating rendezvous
/// slug (§4.6). A new `NsConfig` is built every window rotation; the
/// caller tears down the old one and builds a fresh one with the new
/// slug rather than mutating this in place.
pub fn rendezvous(app_prefix: &str, slug: &str) -> NsConfig {
    make_config(app_prefix, format!("rvz:{slug}"), format!("rvz-{slug}"))
}

/// Builds the covering set of [`NsConfig`]s for the geo driver: the
/// center cell plus up to four neighbor cells already computed by the
/// caller (the external geohash collaborator decides which neighbors
/// are close enough to the peer's position to be worth covering;
/// passing 0-4 neighbors here is how the caller encodes "how close to
/// a boundary am I").
pub fn geo_covering(app_prefix: &str, center_geohash7: &str, neighbor_geohashes7: &[String]) -> Vec<NsConfig> {
    let mut configs = Vec::with_capacity(1 + neighbor_geohashes7.len().min(4));
    configs.push(geo_cell(app_prefix, center_geohash7));
    for cell in neighbor_geohashes7.iter().take(4) {
        configs.push(geo_cell(app_prefix, cell));
    }
    configs
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn router_ids_carry_the_level_suffix() {
        let cfg = custom("peerns", "lobby");
        assert_eq!((cfg.router_id)(1), "peerns-ns-lobby-1");
        assert_eq!((cfg.peer_slot_id)(), "peerns-ns-lobby-p1");
    }

    #[test]
    fn geo_covering_caps_at_five_cells() {
        let neighbors = vec!["a".into(), "b".into(), "c".into(), "d".into(), "e".into()];
        let cfgs = geo_covering("peerns", "center", &neighbors);
        assert_eq!(cfgs.len(), 5); // center + 4, fifth neighbor dropped
    }

    #[test]
    fn geo_covering_with_no_neighbors_is_just_the_center_cell() {
        let cfgs = geo_covering("peerns", "center", &[]);
        assert_eq!(cfgs.len(), 1);
    }
}
