//! End-to-end scenarios run entirely over [`LoopbackTransport`], the
//! same way the design document's test tooling section prescribes:
//! no real signaling service, no real network, fully deterministic.

use std::sync::Arc;
use std::time::Duration;

use peerns_overlay::config::OverlayConfig;
use peerns_overlay::identity::Identity;
use peerns_overlay::manager::OverlayManager;
use peerns_overlay::namespace::{self, drivers};
use peerns_overlay::signaling::SignalingGate;
use peerns_overlay::transport::{LoopbackTransport, SignalingTransport};
use peerns_overlay::types::Contact;

fn fast_config() -> OverlayConfig {
    let mut c = OverlayConfig::default();
    c.sg_base_interval_ms = 5;
    c.join_timeout_ms = 200;
    c.peer_slot_jitter_min_ms = 10;
    c.peer_slot_jitter_max_ms = 20;
    c.peer_slot_max_retries = 2;
    c.failover_jitter_min_ms = 1;
    c.failover_jitter_max_ms = 5;
    c.ping_interval_ms = 500;
    c.monitor_l1_interval_ms = 500;
    c.peer_ttl_ms = 5_000;
    c.peer_ttl_grace_ms = 1_000;
    c.contact_sweep_interval_ms = 50;
    c.rendezvous_sweep_interval_ms = 50;
    c.message_ack_timeout_ms = 5_000;
    c
}

/// S1-style scenario: three peers join the same custom namespace; the
/// first becomes router, the other two become members and each sees
/// the other in their registry mirror.
#[tokio::test]
async fn three_peers_converge_on_one_router_and_shared_registry() {
    let transport: Arc<dyn SignalingTransport> = Arc::new(LoopbackTransport::new());
    let gate = SignalingGate::spawn(fast_config(), peerns_overlay::signaling::default_probe());
    let ns_config = drivers::custom("peerns-test", "lobby");

    let first = namespace::spawn(
        ns_config.clone(), fast_config(), gate.clone(), transport.clone(), "a".into(), vec![1],
    );
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(first.snapshot().await.unwrap().role, namespace::NsRole::Router);

    let second = namespace::spawn(
        ns_config.clone(), fast_config(), gate.clone(), transport.clone(), "b".into(), vec![2],
    );
    let third = namespace::spawn(
        ns_config, fast_config(), gate, transport, "c".into(), vec![3],
    );
    tokio::time::sleep(Duration::from_millis(150)).await;

    assert_eq!(second.snapshot().await.unwrap().role, namespace::NsRole::Member);
    assert_eq!(third.snapshot().await.unwrap().role, namespace::NsRole::Member);
    // Router's registry should carry both members after their checkins.
    assert_eq!(first.snapshot().await.unwrap().registry_len, 2);

    first.teardown();
    second.teardown();
    third.teardown();
}

/// S2-style scenario: a direct-connect send/receive/ack round trip
/// between two [`OverlayManager`]s wired together purely through a
/// loopback transport endpoint — no namespace or rendezvous involved,
/// exercising the identity router's send path end to end.
#[tokio::test]
async fn direct_message_round_trips_and_gets_acked() {
    let transport: Arc<dyn SignalingTransport> = Arc::new(LoopbackTransport::new());

    let alice_identity = Identity::generate();
    let bob_identity = Identity::generate();
    let alice_fp = alice_identity.fingerprint();
    let bob_fp = bob_identity.fingerprint();
    let bob_public_key = bob_identity.public().encoded;
    let alice_public_key = alice_identity.public().encoded;

    let bob_endpoint = transport.create_endpoint("bob-addr").await.unwrap();

    let alice_dir = tempfile::tempdir().unwrap();
    let bob_dir = tempfile::tempdir().unwrap();
    let alice_storage = peerns_overlay::storage::Storage::open(alice_dir.path().to_path_buf()).unwrap();
    let bob_storage = peerns_overlay::storage::Storage::open(bob_dir.path().to_path_buf()).unwrap();

    let alice = OverlayManager::spawn(alice_identity, fast_config(), transport.clone(), alice_storage, "alice".into());
    let bob = OverlayManager::spawn(bob_identity, fast_config(), transport.clone(), bob_storage, "bob".into());

    let mut alice_contact = Contact::new(bob_fp, "bob".into(), bob_public_key);
    alice_contact.observe_address("bob-addr".into());
    alice.add_contact(alice_contact);

    let mut bob_contact = Contact::new(alice_fp, "alice".into(), alice_public_key);
    bob_contact.observe_address("alice-addr".into());
    bob.add_contact(bob_contact);

    let bob_clone = bob.clone();
    tokio::spawn(async move {
        loop {
            match bob_endpoint.accept().await {
                Some(channel) => {
                    let bob_for_reader = bob_clone.clone();
                    tokio::spawn(async move {
                        while let Some(bytes) = channel.recv().await {
                            bob_for_reader.handle_inbound("alice-addr".into(), bytes).await;
                        }
                    });
                }
                None => return,
            }
        }
    });

    let result = alice.send_text(bob_fp, "hello bob".into()).await;
    assert!(result.is_ok());

    tokio::time::sleep(Duration::from_millis(100)).await;

    alice.shutdown();
    bob.shutdown();
}
