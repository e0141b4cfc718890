//! Helpers shared by operators whose tasks map keys one to one.

use super::{InputItems, InputKeys};
use crate::exec::Task;
use crate::graph::VirtualNode;
use std::collections::{BTreeMap, BTreeSet};

/// Groups items by key across every parent of every input.
///
/// Only keys present in all parents are kept. Each group holds, per input and
/// parent, the single item with that key.
#[must_use]
pub fn group_items(items: &InputItems) -> BTreeMap<String, InputItems> {
    let indexed: Vec<(&str, BTreeMap<&str, &crate::datasets::Item>)> = items
        .iter()
        .flat_map(|(name, plist)| {
            plist.iter().map(move |list| {
                let by_key = list.iter().map(|item| (item.key.as_str(), item)).collect();
                (name.as_str(), by_key)
            })
        })
        .collect();

    let Some((_, first)) = indexed.first() else {
        return BTreeMap::new();
    };
    let shared: Vec<&str> = first
        .keys()
        .filter(|key| indexed.iter().all(|(_, by_key)| by_key.contains_key(*key)))
        .copied()
        .collect();

    shared
        .into_iter()
        .map(|key| {
            let mut group = InputItems::new();
            for (name, by_key) in &indexed {
                let item = by_key[key].clone();
                group.entry((*name).to_string()).or_default().push(vec![item]);
            }
            (key.to_string(), group)
        })
        .collect()
}

/// One task per key shared by all parents, ordered by key.
#[must_use]
pub fn simple_tasks(items: &InputItems) -> Vec<Task> {
    group_items(items)
        .into_iter()
        .map(|(key, group)| Task::new(key).with_items(group))
        .collect()
}

/// Output keys of a one-to-one operator: the keys every parent has.
#[must_use]
pub fn map_output_keys(inputs: &InputKeys) -> Vec<String> {
    let mut lists = inputs.values().flatten();
    let Some(first) = lists.next() else {
        return Vec::new();
    };
    let mut keys: BTreeSet<&String> = first.iter().collect();
    for list in lists {
        let current: BTreeSet<&String> = list.iter().collect();
        keys.retain(|k| current.contains(k));
    }
    keys.into_iter().cloned().collect()
}

/// Input keys of a one-to-one operator: every parent needs the output keys.
#[must_use]
pub fn map_needed_inputs(node: &VirtualNode, outputs: &[String]) -> InputKeys {
    node.parents
        .iter()
        .map(|(name, plist)| (name.clone(), vec![outputs.to_vec(); plist.len()]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datasets::Item;
    use crate::graph::{GraphId, VirtualParent};
    use crate::testing::fixtures::{operator_node, virtual_node};
    use pretty_assertions::assert_eq;

    fn items(keys: &[&str]) -> Vec<Item> {
        keys.iter().map(|k| Item::new(*k)).collect()
    }

    #[test]
    fn test_group_items_intersects_parents() {
        let mut input = InputItems::new();
        input.insert("left".to_string(), vec![items(&["a", "b", "c"])]);
        input.insert("right".to_string(), vec![items(&["b", "c", "d"]), items(&["c", "b"])]);

        let groups = group_items(&input);
        assert_eq!(groups.keys().collect::<Vec<_>>(), vec!["b", "c"]);
        let b = &groups["b"];
        assert_eq!(b["left"].len(), 1);
        assert_eq!(b["right"].len(), 2);
        assert_eq!(b["right"][1][0].key, "b");
    }

    #[test]
    fn test_group_items_empty() {
        assert!(group_items(&InputItems::new()).is_empty());
        let mut input = InputItems::new();
        input.insert("x".to_string(), vec![]);
        assert!(group_items(&input).is_empty());
    }

    #[test]
    fn test_simple_tasks_sorted() {
        let mut input = InputItems::new();
        input.insert("input".to_string(), vec![items(&["z", "a", "m"])]);
        let tasks = simple_tasks(&input);
        assert_eq!(tasks.iter().map(|t| t.key.as_str()).collect::<Vec<_>>(), vec!["a", "m", "z"]);
        assert_eq!(tasks[0].items["input"][0][0].key, "a");
    }

    #[test]
    fn test_map_output_keys() {
        let mut inputs = InputKeys::new();
        inputs.insert(
            "input".to_string(),
            vec![
                vec!["k1".to_string(), "k2".to_string(), "k3".to_string()],
                vec!["k2".to_string(), "k3".to_string()],
            ],
        );
        assert_eq!(map_output_keys(&inputs), vec!["k2", "k3"]);
        assert!(map_output_keys(&InputKeys::new()).is_empty());
    }

    #[test]
    fn test_map_needed_inputs_matches_parent_shape() {
        let mut node = virtual_node(&operator_node(1, "n", "op", vec![]));
        node.parents.clear();
        node.parents.insert(
            "input".to_string(),
            vec![
                VirtualParent::dataset(1, "t"),
                VirtualParent::operator(GraphId::operator(2), "output", "t"),
            ],
        );
        let needed = map_needed_inputs(&node, &["k1".to_string()]);
        assert_eq!(needed["input"], vec![vec!["k1".to_string()], vec!["k1".to_string()]]);
    }
}
