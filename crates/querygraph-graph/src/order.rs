use crate::dependency::DependencyGraph;
use serde::Serialize;
use std::collections::BTreeSet;
use tracing::warn;

/// Construction order for the entities of one run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BuildOrder {
    /// Entities whose dependencies were all placed first.
    pub order: Vec<String>,
    /// Entities Kahn's algorithm could not place; only non-empty on a cyclic graph.
    pub unresolved: Vec<String>,
}

impl BuildOrder {
    /// The full sequence to build: resolved entities, then unresolved ones in
    /// mapping order.
    pub fn sequence(&self) -> impl Iterator<Item = &String> {
        self.order.iter().chain(self.unresolved.iter())
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.sequence().position(|entry| entry == name)
    }

    pub fn is_complete(&self) -> bool {
        self.unresolved.is_empty()
    }

    pub fn len(&self) -> usize {
        self.order.len() + self.unresolved.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Kahn's algorithm. The ready set is ordered by mapping index so
/// entities that become ready together come out in mapping order.
pub fn plan_build_order(graph: &DependencyGraph) -> BuildOrder {
    let nodes = graph.nodes();
    let mut in_degree: Vec<usize> = nodes.iter().map(|node| node.dependencies.len()).collect();
    let mut ready: BTreeSet<usize> = in_degree
        .iter()
        .enumerate()
        .filter(|(_, degree)| **degree == 0)
        .map(|(i, _)| i)
        .collect();
    let mut placed = vec![false; nodes.len()];
    let mut order = Vec::with_capacity(nodes.len());

    while let Some(current) = ready.pop_first() {
        placed[current] = true;
        order.push(nodes[current].name.clone());

        for dependent in &nodes[current].dependents {
            let Some(i) = graph.position(dependent) else {
                continue;
            };
            in_degree[i] = in_degree[i].saturating_sub(1);
            if in_degree[i] == 0 && !placed[i] {
                ready.insert(i);
            }
        }
    }

    let unresolved: Vec<String> = nodes
        .iter()
        .zip(&placed)
        .filter(|(_, placed)| !**placed)
        .map(|(node, _)| node.name.clone())
        .collect();
    if !unresolved.is_empty() {
        warn!(
            "Build order left {} entities unresolved: {}",
            unresolved.len(),
            unresolved.join(", ")
        );
    }

    BuildOrder { order, unresolved }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cycles::resolve_cycles;
    use querygraph_core::{Entity, JoinKind, Relationship};

    fn graph(names: &[&str], edges: &[(&str, &str)]) -> DependencyGraph {
        let entities: Vec<Entity> = names.iter().map(|n| Entity::new(*n)).collect();
        let relationships: Vec<Relationship> = edges
            .iter()
            .map(|(l, r)| Relationship::new(*l, *r, JoinKind::Left, format!("{l}.k = {r}.k")))
            .collect();
        DependencyGraph::build(&entities, &relationships)
    }

    #[test]
    fn test_no_relationships_keeps_mapping_order() {
        let order = plan_build_order(&graph(&["c", "a", "b"], &[]));
        assert_eq!(order.order, vec!["c", "a", "b"]);
        assert!(order.is_complete());
    }

    #[test]
    fn test_dependencies_come_first() {
        let edges = [("orders", "customers"), ("items", "orders"), ("items", "products")];
        let g = graph(&["items", "orders", "customers", "products"], &edges);
        let order = plan_build_order(&g);

        assert_eq!(order.len(), 4);
        for (dependent, dependency) in edges {
            assert!(order.position(dependency) < order.position(dependent));
        }
    }

    #[test]
    fn test_ready_ties_break_by_mapping_index() {
        // d unlocks both b and a at once; a comes first in the mapping
        let g = graph(&["a", "b", "c", "d"], &[("b", "d"), ("a", "d")]);
        let order = plan_build_order(&g);
        assert_eq!(order.order, vec!["c", "d", "a", "b"]);
    }

    #[test]
    fn test_cycle_leaves_entities_unresolved() {
        let g = graph(&["a", "b", "c", "d"], &[("a", "b"), ("b", "c"), ("c", "a")]);
        let order = plan_build_order(&g);

        assert_eq!(order.order, vec!["d"]);
        assert_eq!(order.unresolved, vec!["a", "b", "c"]);
        assert_eq!(
            order.sequence().cloned().collect::<Vec<_>>(),
            vec!["d", "a", "b", "c"]
        );
    }

    #[test]
    fn test_resolved_cycle_orders_everything() {
        let mut g = graph(&["a", "b", "c"], &[("a", "b"), ("b", "c"), ("c", "a")]);
        resolve_cycles(&mut g);
        let order = plan_build_order(&g);

        assert!(order.is_complete());
        assert_eq!(order.order, vec!["c", "b", "a"]);
    }

    #[test]
    fn test_duplicate_edges_count_twice() {
        let g = graph(&["a", "b"], &[("a", "b"), ("a", "b")]);
        let order = plan_build_order(&g);
        assert_eq!(order.order, vec!["b", "a"]);
    }
}
