// RainTree and peerstore benchmarks.
//
// Covers view construction at block commit, per-level target lookup, the
// peerstore delta driving incremental refresh, and nonce deduplication on
// the inbound hot path.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use pocket_p2p::dedup::NonceDeduper;
use pocket_p2p::router::raintree::RainTreeView;
use pocket_p2p::{Peer, Peerstore, PrivateKey};

fn staked_set(size: usize) -> Peerstore {
    (0..size)
        .map(|i| {
            let key = PrivateKey::generate();
            let addr = format!("/ip4/10.{}.{}.{}/tcp/42069", (i >> 16) & 0xff, (i >> 8) & 0xff, i & 0xff)
                .parse()
                .unwrap();
            Peer::from_multiaddr(key.public_key(), addr).unwrap()
        })
        .collect()
}

fn bench_view_build(c: &mut Criterion) {
    let mut group = c.benchmark_group("raintree/view_build");
    for size in [10, 100, 1_000] {
        let peerstore = staked_set(size);
        let me = PrivateKey::generate().address();
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &peerstore, |b, ps| {
            b.iter(|| RainTreeView::new(me, ps.clone()));
        });
    }
    group.finish();
}

fn bench_targets(c: &mut Criterion) {
    let mut group = c.benchmark_group("raintree/targets_all_levels");
    for size in [10, 100, 1_000] {
        let view = RainTreeView::new(PrivateKey::generate().address(), staked_set(size));
        group.bench_with_input(BenchmarkId::from_parameter(size), &view, |b, view| {
            b.iter(|| {
                (1..=view.top())
                    .map(|level| view.targets(level).len())
                    .sum::<usize>()
            });
        });
    }
    group.finish();
}

fn bench_peerstore_delta(c: &mut Criterion) {
    let current = staked_set(500);
    let mut next = current.clone();
    for address in current.addresses().into_iter().take(25) {
        next.remove_peer(&address).unwrap();
    }
    for peer in staked_set(25).peer_list() {
        next.add_peer(peer).unwrap();
    }

    c.bench_function("peerstore/delta_500_churn_25", |b| {
        b.iter(|| current.delta(&next));
    });
}

fn bench_dedup(c: &mut Criterion) {
    let deduper = NonceDeduper::new(10_000);
    let mut nonce = 0u64;
    c.bench_function("dedup/observe", |b| {
        b.iter(|| {
            nonce = nonce.wrapping_add(0x9e37_79b9_7f4a_7c15);
            deduper.observe(nonce)
        });
    });
}

criterion_group!(
    benches,
    bench_view_build,
    bench_targets,
    bench_peerstore_delta,
    bench_dedup,
);
criterion_main!(benches);
