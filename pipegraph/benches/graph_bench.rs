//! Benchmarks for graph hashing.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use pipegraph::graph::{compute_hashes, ExecutionGraph, GraphId, Node, VirtualParent};
use pipegraph::testing::fixtures::{dataset, operator_node, virtual_node};
use std::collections::HashMap;

fn chain(len: i64) -> ExecutionGraph {
    let mut graph = ExecutionGraph::new();
    graph.insert(dataset(1, "raw"));
    let mut prev = VirtualParent::dataset(1, "image");
    for id in 1..=len {
        let mut node = virtual_node(&operator_node(id, &format!("n{id}"), "resize", vec![]));
        node.parents.insert("input".to_string(), vec![prev]);
        prev = VirtualParent::operator(node.graph_id(), "output", "table");
        graph.insert(node);
    }
    graph
}

fn hash_benchmark(c: &mut Criterion) {
    let graph = chain(200);
    c.bench_function("hash_chain_200", |b| {
        b.iter(|| compute_hashes(black_box(&graph), &HashMap::new()))
    });

    let mut pinned = compute_hashes(&graph, &HashMap::new()).unwrap_or_default();
    pinned.remove(&GraphId::operator(200));
    c.bench_function("rehash_pinned_chain_200", |b| {
        b.iter(|| compute_hashes(black_box(&graph), &pinned))
    });
}

criterion_group!(benches, hash_benchmark);
criterion_main!(benches);
