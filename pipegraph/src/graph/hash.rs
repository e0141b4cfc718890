//! Content hashing of execution graph nodes.
//!
//! A node's hash covers its local configuration and the hashes of its
//! non-virtual parents. Virtual parents are left out because resolved nodes
//! cannot be enumerated statically.

use super::{ExecutionGraph, GraphId, Node};
use crate::errors::{CycleDetectedError, SchedulingError};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};

/// Computes the hex content hash of every node in `graph`.
///
/// Entries of `pinned` whose id is in the graph are taken as-is and never
/// recomputed. All other nodes are hashed as soon as every non-virtual parent
/// is hashed, so the result does not depend on iteration order.
///
/// # Errors
///
/// Returns [`SchedulingError::Cycle`] when some nodes can never be hashed, and
/// [`SchedulingError::MissingHash`] when a non-virtual parent is absent from
/// the graph.
pub fn compute_hashes(
    graph: &ExecutionGraph,
    pinned: &HashMap<GraphId, String>,
) -> Result<HashMap<GraphId, String>, SchedulingError> {
    let mut hashes: HashMap<GraphId, String> = pinned
        .iter()
        .filter(|(id, _)| graph.contains(id))
        .map(|(id, hash)| (id.clone(), hash.clone()))
        .collect();

    while hashes.len() < graph.len() {
        let mut progressed = false;

        for (id, node) in graph.iter() {
            if hashes.contains_key(id) {
                continue;
            }

            let mut edges = Vec::new();
            let mut blocked = false;
            for (label, parent) in node.graph_parents() {
                if parent.is_virtual() {
                    continue;
                }
                if !graph.contains(&parent) {
                    return Err(SchedulingError::MissingHash(parent.to_string()));
                }
                match hashes.get(&parent) {
                    Some(hash) => edges.push((label, hash.clone())),
                    None => {
                        blocked = true;
                        break;
                    }
                }
            }
            if blocked {
                continue;
            }

            hashes.insert(id.clone(), hash_node(&edges, &node.local_hash()));
            progressed = true;
        }

        if !progressed {
            return Err(cycle_error(graph, &hashes).into());
        }
    }

    Ok(hashes)
}

/// Hashes sorted `label=parentHash` lines followed by the local hash.
fn hash_node(edges: &[(String, String)], local_hash: &[u8]) -> String {
    let mut edges: Vec<&(String, String)> = edges.iter().collect();
    edges.sort_by(|a, b| a.0.cmp(&b.0));

    let mut hasher = Sha256::new();
    for (label, parent_hash) in edges {
        hasher.update(format!("{label}={parent_hash}\n").as_bytes());
    }
    hasher.update(local_hash);
    hex::encode(hasher.finalize())
}

/// Walks blocking edges among unhashed nodes until one repeats.
///
/// Every unhashed node has at least one unhashed non-virtual parent, so the
/// walk always closes a cycle.
fn cycle_error(graph: &ExecutionGraph, hashes: &HashMap<GraphId, String>) -> CycleDetectedError {
    let Some(start) = graph.ids().into_iter().find(|id| !hashes.contains_key(id)) else {
        return CycleDetectedError::new(Vec::new());
    };

    let mut path = vec![start.clone()];
    let mut seen: HashSet<GraphId> = HashSet::from([start.clone()]);
    let mut current = start;

    loop {
        let next = graph.get(&current).and_then(|node| {
            node.graph_parents()
                .into_values()
                .find(|p| !p.is_virtual() && !hashes.contains_key(p))
        });
        let Some(next) = next else {
            break;
        };
        if seen.contains(&next) {
            let begin = path.iter().position(|id| *id == next).unwrap_or(0);
            let mut cycle: Vec<String> =
                path[begin..].iter().map(|id| graph.display_name(id)).collect();
            cycle.push(graph.display_name(&next));
            return CycleDetectedError::new(cycle);
        }
        seen.insert(next.clone());
        path.push(next.clone());
        current = next;
    }

    CycleDetectedError::new(path.iter().map(|id| graph.display_name(id)).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::ParentRef;
    use crate::graph::{VirtualNode, VirtualParent};
    use crate::testing::fixtures::{dataset, operator_node, virtual_node};
    use pretty_assertions::assert_eq;

    fn op(id: i64, name: &str, params: &str, parents: Vec<VirtualParent>) -> VirtualNode {
        let mut node = virtual_node(&operator_node(id, name, "resize", vec![]));
        node.params = params.to_string();
        node.parents.insert("input".to_string(), parents);
        node
    }

    fn chain(params_a: &str) -> ExecutionGraph {
        let mut graph = ExecutionGraph::new();
        graph.insert(dataset(1, "raw"));
        graph.insert(op(10, "a", params_a, vec![VirtualParent::dataset(1, "image")]));
        graph.insert(op(
            11,
            "b",
            "{}",
            vec![VirtualParent::operator(GraphId::operator(10), "output", "image")],
        ));
        graph.insert(op(12, "sibling", "{}", vec![VirtualParent::dataset(1, "image")]));
        graph
    }

    #[test]
    fn test_hashes_are_hex_sha256() {
        let hashes = compute_hashes(&chain("{}"), &HashMap::new()).unwrap();
        assert_eq!(hashes.len(), 4);
        for hash in hashes.values() {
            assert_eq!(hash.len(), 64);
            assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
        }
    }

    #[test]
    fn test_hashes_are_stable() {
        let first = compute_hashes(&chain("{}"), &HashMap::new()).unwrap();
        let second = compute_hashes(&chain("{}"), &HashMap::new()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_parent_change_invalidates_descendants_only() {
        let before = compute_hashes(&chain("{}"), &HashMap::new()).unwrap();
        let after = compute_hashes(&chain(r#"{"w":1}"#), &HashMap::new()).unwrap();

        assert_ne!(before[&GraphId::operator(10)], after[&GraphId::operator(10)]);
        assert_ne!(before[&GraphId::operator(11)], after[&GraphId::operator(11)]);
        assert_eq!(before[&GraphId::operator(12)], after[&GraphId::operator(12)]);
        assert_eq!(before[&GraphId::dataset(1)], after[&GraphId::dataset(1)]);
    }

    #[test]
    fn test_virtual_parents_are_excluded() {
        let mut graph = chain("{}");
        let plain = compute_hashes(&graph, &HashMap::new()).unwrap();

        let raw = vec![VirtualParent::dataset(1, "image")];
        let mut materialize = op(11, "b-materialize", r#"{"x":2}"#, raw);
        materialize.virtual_key = "materialize-input-0".to_string();
        graph.insert(materialize);
        let mut b = op(
            11,
            "b",
            "{}",
            vec![VirtualParent::operator(GraphId::operator(10), "output", "image")],
        );
        b.parents.get_mut("input").unwrap().push(VirtualParent::operator(
            GraphId::virtual_operator(11, "materialize-input-0"),
            "outputs0",
            "image",
        ));
        graph.insert(b);

        let with_virtual = compute_hashes(&graph, &HashMap::new()).unwrap();
        assert_eq!(plain[&GraphId::operator(11)], with_virtual[&GraphId::operator(11)]);
    }

    #[test]
    fn test_pinned_hashes_are_kept() {
        let graph = chain("{}");
        let mut pinned = HashMap::new();
        pinned.insert(GraphId::operator(10), "pinned".to_string());
        pinned.insert(GraphId::operator(99), "not-in-graph".to_string());

        let hashes = compute_hashes(&graph, &pinned).unwrap();
        assert_eq!(hashes[&GraphId::operator(10)], "pinned");
        assert!(!hashes.contains_key(&GraphId::operator(99)));

        let unpinned = compute_hashes(&graph, &HashMap::new()).unwrap();
        assert_ne!(hashes[&GraphId::operator(11)], unpinned[&GraphId::operator(11)]);
    }

    #[test]
    fn test_cycle_fails_loudly() {
        let mut graph = ExecutionGraph::new();
        graph.insert(op(
            1,
            "a",
            "{}",
            vec![VirtualParent::operator(GraphId::operator(2), "output", "t")],
        ));
        graph.insert(op(
            2,
            "b",
            "{}",
            vec![VirtualParent::operator(GraphId::operator(1), "output", "t")],
        ));

        let err = compute_hashes(&graph, &HashMap::new()).unwrap_err();
        assert_eq!(err.code(), "GRAPH-CYCLE");
        match err {
            SchedulingError::Cycle(cycle) => {
                assert_eq!(cycle.cycle_path.first(), cycle.cycle_path.last());
                assert_eq!(cycle.cycle_path.len(), 3);
            }
            other => panic!("unexpected error {other}"),
        }
    }

    #[test]
    fn test_missing_parent_reported() {
        let mut graph = ExecutionGraph::new();
        graph.insert(op(1, "a", "{}", vec![VirtualParent::dataset(5, "image")]));
        let err = compute_hashes(&graph, &HashMap::new()).unwrap_err();
        assert!(matches!(err, SchedulingError::MissingHash(ref id) if id == "dataset-5"));
    }

    #[test]
    fn test_edge_labels_matter() {
        let orig = operator_node(3, "c", "resize", vec![vec![ParentRef::dataset(1)]]);
        let mut graph = ExecutionGraph::new();
        graph.insert(dataset(1, "raw"));
        let mut node = virtual_node(&orig);
        node.parents.clear();
        node.parents.insert("left".to_string(), vec![VirtualParent::dataset(1, "image")]);
        graph.insert(node.clone());
        let left = compute_hashes(&graph, &HashMap::new()).unwrap();

        node.parents.clear();
        node.parents.insert("right".to_string(), vec![VirtualParent::dataset(1, "image")]);
        graph.insert(node);
        let right = compute_hashes(&graph, &HashMap::new()).unwrap();

        assert_ne!(left[&GraphId::operator(3)], right[&GraphId::operator(3)]);
    }
}
