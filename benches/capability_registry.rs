//! Benchmark for capability-based backend ranking
//!
//! Registry populated by a full discovery pass over an in-memory store.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use unified_replication_operator::capability::{
    query_for_spec, score_backend, Capability, CapabilityLevel, CapabilityQuery,
    CapabilityRegistry, EnhancedDiscoveryConfig, EnhancedDiscoveryEngine,
};
use unified_replication_operator::crd::{
    Extensions, PowerStoreExtensions, ReplicationMode, ReplicationState,
    UnifiedVolumeReplicationSpec,
};
use unified_replication_operator::{Backend, DiscoveryConfig, DiscoveryEngine, MemoryResourceStore};

fn populated_registry() -> Arc<CapabilityRegistry> {
    let store = Arc::new(MemoryResourceStore::new());
    for backend in Backend::ALL {
        store.install_backend(backend);
    }

    let discovery = DiscoveryEngine::new(
        DiscoveryConfig {
            check_controllers: false,
            ..Default::default()
        },
        store.clone(),
    );
    let registry = Arc::new(CapabilityRegistry::new());
    let engine = EnhancedDiscoveryEngine::new(
        EnhancedDiscoveryConfig::default(),
        discovery,
        registry.clone(),
        store,
    );

    let rt = tokio::runtime::Runtime::new().unwrap();
    rt.block_on(engine.discover_with_capabilities(&CancellationToken::new()))
        .unwrap();
    registry
}

fn sample_spec() -> UnifiedVolumeReplicationSpec {
    UnifiedVolumeReplicationSpec {
        source_endpoint: Default::default(),
        destination_endpoint: Default::default(),
        volume_mapping: Default::default(),
        replication_state: ReplicationState::Promoting,
        replication_mode: ReplicationMode::Synchronous,
        schedule: Default::default(),
        extensions: Some(Extensions {
            powerstore: Some(PowerStoreExtensions {
                rpo_settings: Some("Five_Minutes".into()),
                volume_groups: vec!["vg-1".into()],
            }),
            ..Default::default()
        }),
    }
}

fn bench_query_ranking(c: &mut Criterion) {
    let mut group = c.benchmark_group("capability_registry");
    group.throughput(Throughput::Elements(1));

    let registry = populated_registry();
    let query = CapabilityQuery::new([Capability::AsyncReplication, Capability::Promotion])
        .with_optional([Capability::HealthMonitoring, Capability::AutoResync])
        .with_min_level(CapabilityLevel::Basic);

    group.bench_function("query_backends_by_capabilities", |b| {
        b.iter(|| registry.query_backends_by_capabilities(black_box(&query)));
    });

    group.bench_function("select_backend", |b| {
        b.iter(|| registry.select_backend(black_box(&query)));
    });

    group.finish();
}

fn bench_spec_mapping(c: &mut Criterion) {
    let mut group = c.benchmark_group("capability_mapping");
    group.throughput(Throughput::Elements(1));

    let registry = populated_registry();
    let spec = sample_spec();

    group.bench_function("query_for_spec", |b| {
        b.iter(|| query_for_spec(black_box(&spec)));
    });

    group.bench_function("validate_configuration", |b| {
        b.iter(|| registry.validate_configuration(black_box(Backend::PowerStore), black_box(&spec)));
    });

    let caps = registry.get_capabilities(Backend::PowerStore).unwrap();
    let query = query_for_spec(&spec);
    group.bench_function("score_backend", |b| {
        b.iter(|| score_backend(black_box(&caps), black_box(&query)));
    });

    group.finish();
}

criterion_group!(benches, bench_query_ranking, bench_spec_mapping);
criterion_main!(benches);
