//! # Engine Benchmarks
//!
//! Throughput of the persistence engine over the in-memory driver.
//!
//! Run with: `cargo bench -p modelgraph-core`

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use modelgraph_core::{FieldValue, Fields, MemoryGraph, ModelDb, ObjectRef, SpecRegistry};
use std::hint::black_box;

const TRANSMISSION: &str = include_str!("../../../specs/resource_transmission.xml");

fn specs() -> SpecRegistry {
    SpecRegistry::from_xml_str(TRANSMISSION).expect("sample specification")
}

fn named(key: &str) -> Fields {
    let mut fields = Fields::new();
    fields.insert("key".to_string(), FieldValue::from(key));
    fields
}

/// One unit with `size` resources measured in it.
fn populated(size: usize) -> MemoryGraph {
    let graph = MemoryGraph::new();
    let mut db = ModelDb::new(specs(), graph.clone());
    let kg = db.create_object("Unit", named("kg")).expect("unit");
    let batch = (0..size)
        .map(|i| {
            let mut fields = named(&format!("r{i}"));
            fields.insert("density".to_string(), FieldValue::from(i as f64));
            fields.insert("unit_default".to_string(), FieldValue::from(kg.clone()));
            ("Resource", fields)
        })
        .collect();
    db.create_multiple_objects(batch).expect("resources");
    graph
}

/// A parent chain of `size` regions, built in memory only.
fn region_chain(db: &ModelDb<MemoryGraph>, size: usize) -> ObjectRef {
    let mut parent: Option<ObjectRef> = None;
    for i in 0..size {
        let mut fields = named(&format!("R{i}"));
        fields.insert(
            "parents".to_string(),
            FieldValue::from(parent.iter().cloned().collect::<Vec<_>>()),
        );
        parent = Some(db.construct_object("Region", fields).expect("region"));
    }
    parent.expect("non-empty chain")
}

// =============================================================================
// BENCHMARKS
// =============================================================================

fn bench_create(c: &mut Criterion) {
    let mut group = c.benchmark_group("create_multiple_objects");
    for size in [10, 100, 1000] {
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            b.iter(|| black_box(populated(size)));
        });
    }
    group.finish();
}

fn bench_full_load(c: &mut Criterion) {
    let mut group = c.benchmark_group("full_load_hub");
    for size in [10, 100, 1000] {
        let graph = populated(size);
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, _| {
            b.iter(|| {
                let mut db = ModelDb::new(specs(), graph.clone());
                black_box(db.get_object("Unit", "kg", false).expect("get"))
            });
        });
    }
    group.finish();
}

fn bench_add_chain(c: &mut Criterion) {
    let mut group = c.benchmark_group("add_object_chain");
    for size in [10, 100] {
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            b.iter(|| {
                let mut db = ModelDb::new(specs(), MemoryGraph::new());
                let leaf = region_chain(&db, size);
                black_box(db.add_object(&leaf).expect("add"))
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_create, bench_full_load, bench_add_chain);
criterion_main!(benches);
