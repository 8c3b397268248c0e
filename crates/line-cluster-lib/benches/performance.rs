//! Performance benchmarks for line-cluster-lib
//!
//! Run with: cargo bench --package line-cluster-lib

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use geo::{Coord, Rect};
use line_cluster_lib::{
    Category, ClusterIndex, ClusterOptions, Config, Entity, EntityStore, FilterState, MapEngine,
    Region, Viewport, query,
};
use std::sync::Arc;

/// Generate entities scattered around a city, short lines with a second anchor nearby
fn generate_entities(count: usize, base_lat: f64, base_lon: f64) -> Vec<Entity> {
    (0..count)
        .map(|i| {
            let t = i as f64 / count as f64;
            let lat = base_lat + (t * 977.0).sin() * 0.4 + (i % 13) as f64 * 0.001;
            let lon = base_lon + (t * 613.0).cos() * 0.6 + (i % 7) as f64 * 0.001;
            Entity::new(
                format!("line-{i}"),
                format!("Line {i}"),
                (lat, lon),
                (lat + 0.002, lon + 0.003),
            )
            .with_favorite(i % 5 == 0)
        })
        .collect()
}

fn shared(entities: Vec<Entity>) -> Vec<Arc<Entity>> {
    entities.into_iter().map(Arc::new).collect()
}

fn create_viewport(zoom: f64, min_lat: f64, min_lon: f64, max_lat: f64, max_lon: f64) -> Viewport {
    Viewport::new(
        zoom,
        Rect::new(
            Coord {
                x: min_lon,
                y: min_lat,
            },
            Coord {
                x: max_lon,
                y: max_lat,
            },
        ),
    )
}

// ============================================================================
// Core Benchmarks - Key performance indicators
// ============================================================================

fn bench_construction(c: &mut Criterion) {
    let mut group = c.benchmark_group("construction");
    group.sample_size(20);

    for count in [1_000, 10_000, 50_000] {
        let entities = shared(generate_entities(count, -23.55, -46.63));
        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(BenchmarkId::from_parameter(count), &entities, |b, e| {
            b.iter(|| ClusterIndex::build(e, ClusterOptions::default()).unwrap());
        });
    }

    group.finish();
}

fn bench_query_performance(c: &mut Criterion) {
    let mut group = c.benchmark_group("query");

    let entities = shared(generate_entities(50_000, -23.55, -46.63));
    let index = ClusterIndex::build(&entities, ClusterOptions::default()).unwrap();

    // Overview of the whole area
    let overview = create_viewport(8.0, -24.5, -47.5, -22.5, -45.5);
    group.bench_function("overview_50k", |b| {
        b.iter(|| query(&index, &overview));
    });

    // Street-level view
    let detail = create_viewport(16.0, -23.56, -46.64, -23.54, -46.62);
    group.bench_function("detail_50k", |b| {
        b.iter(|| query(&index, &detail));
    });

    // Whole world
    let world = create_viewport(2.0, -85.0, -180.0, 85.0, 180.0);
    group.bench_function("world_50k", |b| {
        b.iter(|| query(&index, &world));
    });

    group.finish();
}

fn bench_filter(c: &mut Criterion) {
    let mut group = c.benchmark_group("filter");

    let store = EntityStore::new(generate_entities(50_000, -23.55, -46.63), 1);
    let search = FilterState::new("line 12", Category::All);
    let favorites = FilterState::new("", Category::Favorites);

    group.bench_function("search_50k", |b| {
        b.iter(|| search.apply(&store));
    });
    group.bench_function("favorites_50k", |b| {
        b.iter(|| favorites.apply(&store));
    });

    group.finish();
}

fn bench_engine(c: &mut Criterion) {
    let mut group = c.benchmark_group("engine");
    group.sample_size(20);

    let mut engine = MapEngine::new(Config::default()).unwrap();
    engine.set_entities(generate_entities(20_000, -23.55, -46.63));
    engine.wait_for_rebuild(std::time::Duration::from_secs(60));

    let regions = [
        Region::new(-23.55, -46.63, 0.5, 0.5),
        Region::new(-23.40, -46.50, 0.1, 0.1),
    ];
    let mut flip = 0usize;
    group.bench_function("pan_20k", |b| {
        b.iter(|| {
            flip ^= 1;
            engine.set_region(&regions[flip]);
        });
    });

    // Toggling back and forth hits the memoized indexes
    let categories = [Category::Favorites, Category::All];
    group.bench_function("toggle_category_20k", |b| {
        b.iter(|| {
            flip ^= 1;
            engine.set_category(categories[flip].clone());
        });
    });

    group.finish();
}

// ============================================================================
// Criterion Configuration
// ============================================================================

criterion_group!(
    benches,
    bench_construction,
    bench_query_performance,
    bench_filter,
    bench_engine,
);

criterion_main!(benches);
