//! Benchmarks the ID component's hot paths: keypair generation, ECDH
//! derivation, and AES-GCM message encryption, since all three sit on
//! the critical path of every contact connect and every chat message.

use criterion::{criterion_group, criterion_main, Criterion};
use peerns_overlay::identity::Identity;

fn bench_generate(c: &mut Criterion) {
    c.bench_function("identity_generate", |b| {
        b.iter(Identity::generate);
    });
}

fn bench_derive_shared(c: &mut Criterion) {
    let alice = Identity::generate();
    let bob_public = Identity::generate().public();
    c.bench_function("derive_shared", |b| {
        b.iter(|| alice.derive_shared(&bob_public).unwrap());
    });
}

fn bench_encrypt(c: &mut Criterion) {
    let alice = Identity::generate();
    let bob = Identity::generate();
    let key = alice.derive_shared(&bob.public()).unwrap();
    let plaintext = vec![0u8; 4096];
    c.bench_function("shared_key_encrypt_4kb", |b| {
        b.iter(|| key.encrypt(&plaintext).unwrap());
    });
}

fn bench_rendezvous_slug(c: &mut Criterion) {
    let alice = Identity::generate();
    let bob = Identity::generate();
    let key = alice.derive_shared(&bob.public()).unwrap();
    c.bench_function("rendezvous_slug", |b| {
        b.iter(|| key.rendezvous_slug(42));
    });
}

criterion_group!(benches, bench_generate, bench_derive_shared, bench_encrypt, bench_rendezvous_slug);
criterion_main!(benches);
