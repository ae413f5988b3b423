//! Cycle detection and resolution.
//!
//! Detection is a depth-first walk with a recursion-stack set. Roots are taken
//! in mapping order and dependency edges in insertion order, so the first
//! cycle found for a given graph is always the same one.
//!
//! Resolution removes one edge per detected cycle until none remain: the edge
//! with the greatest `(dependent, dependency)` pair in lexical order.

use crate::dependency::DependencyGraph;
use serde::Serialize;
use std::collections::HashSet;
use tracing::debug;

/// An edge removed to make the graph acyclic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BrokenEdge {
    pub dependent: String,
    pub dependency: String,
    /// The cycle this edge was removed from, starting at the DFS entry point.
    pub cycle: Vec<String>,
}

impl BrokenEdge {
    pub fn describe(&self) -> String {
        format!(
            "{} -> {} (cycle: {} -> {})",
            self.dependent,
            self.dependency,
            self.cycle.join(" -> "),
            self.cycle.first().map(String::as_str).unwrap_or_default()
        )
    }
}

/// Returns the first cycle found, e.g. `[A, B, C]` for A -> B -> C -> A.
pub fn find_cycle(graph: &DependencyGraph) -> Option<Vec<String>> {
    let mut visited = HashSet::new();
    let mut rec_stack = HashSet::new();

    for root in 0..graph.len() {
        if visited.contains(&root) {
            continue;
        }
        let mut path = Vec::new();
        if let Some(cycle) = dfs_detect_cycle(graph, root, &mut visited, &mut rec_stack, &mut path)
        {
            return Some(
                cycle
                    .into_iter()
                    .map(|i| graph.nodes()[i].name.clone())
                    .collect(),
            );
        }
    }

    None
}

pub fn has_cycle(graph: &DependencyGraph) -> bool {
    find_cycle(graph).is_some()
}

fn dfs_detect_cycle(
    graph: &DependencyGraph,
    node: usize,
    visited: &mut HashSet<usize>,
    rec_stack: &mut HashSet<usize>,
    path: &mut Vec<usize>,
) -> Option<Vec<usize>> {
    visited.insert(node);
    rec_stack.insert(node);
    path.push(node);

    for neighbor in graph.dependency_positions(node) {
        if !visited.contains(&neighbor) {
            if let Some(cycle) = dfs_detect_cycle(graph, neighbor, visited, rec_stack, path) {
                return Some(cycle);
            }
        } else if rec_stack.contains(&neighbor) {
            // Back edge
            let start = path.iter().position(|&n| n == neighbor).unwrap_or(0);
            return Some(path[start..].to_vec());
        }
    }

    rec_stack.remove(&node);
    path.pop();
    None
}

/// Edges of a cycle path, closing back to its first node.
fn cycle_edges(cycle: &[String]) -> Vec<(&str, &str)> {
    cycle
        .iter()
        .zip(cycle.iter().cycle().skip(1))
        .map(|(dependent, dependency)| (dependent.as_str(), dependency.as_str()))
        .collect()
}

/// Breaks cycles until the graph is acyclic and returns the removed edges in
/// removal order.
pub fn resolve_cycles(graph: &mut DependencyGraph) -> Vec<BrokenEdge> {
    let mut broken = Vec::new();
    // Every round removes an edge, so the edge count bounds the loop.
    let max_rounds = graph.edge_count();

    for _ in 0..max_rounds {
        let Some(cycle) = find_cycle(graph) else {
            break;
        };
        let Some((dependent, dependency)) = cycle_edges(&cycle).into_iter().max() else {
            break;
        };
        let (dependent, dependency) = (dependent.to_string(), dependency.to_string());

        if !graph.remove_edge(&dependent, &dependency) {
            break;
        }
        debug!("Broke cycle edge {} -> {}", dependent, dependency);
        broken.push(BrokenEdge {
            dependent,
            dependency,
            cycle,
        });
    }

    broken
}

#[cfg(test)]
mod tests {
    use super::*;
    use querygraph_core::{Entity, JoinKind, Relationship};

    fn graph(names: &[&str], edges: &[(&str, &str)]) -> DependencyGraph {
        let entities: Vec<Entity> = names.iter().map(|n| Entity::new(*n)).collect();
        let relationships: Vec<Relationship> = edges
            .iter()
            .map(|(l, r)| Relationship::new(*l, *r, JoinKind::Inner, format!("{l}.id = {r}.id")))
            .collect();
        DependencyGraph::build(&entities, &relationships)
    }

    #[test]
    fn test_dag_has_no_cycle() {
        let g = graph(&["a", "b", "c"], &[("a", "b"), ("b", "c"), ("a", "c")]);
        assert!(!has_cycle(&g));
    }

    #[test]
    fn test_three_cycle_is_reported_in_path_order() {
        let g = graph(&["a", "b", "c"], &[("a", "b"), ("b", "c"), ("c", "a")]);
        assert_eq!(find_cycle(&g), Some(vec!["a".into(), "b".into(), "c".into()]));
    }

    #[test]
    fn test_resolution_breaks_lexically_greatest_edge() {
        let mut g = graph(&["a", "b", "c"], &[("a", "b"), ("b", "c"), ("c", "a")]);
        let broken = resolve_cycles(&mut g);

        assert_eq!(broken.len(), 1);
        assert_eq!(broken[0].dependent, "c");
        assert_eq!(broken[0].dependency, "a");
        assert!(!has_cycle(&g));
        assert_eq!(g.edge_count(), 2);
    }

    #[test]
    fn test_self_loop_is_a_cycle() {
        let mut g = graph(&["a", "b"], &[("a", "a"), ("a", "b")]);
        assert_eq!(find_cycle(&g), Some(vec!["a".to_string()]));

        let broken = resolve_cycles(&mut g);
        assert_eq!(broken.len(), 1);
        assert_eq!((broken[0].dependent.as_str(), broken[0].dependency.as_str()), ("a", "a"));
        assert!(!has_cycle(&g));
    }

    #[test]
    fn test_overlapping_cycles_all_resolved() {
        let mut g = graph(
            &["a", "b", "c", "d"],
            &[("a", "b"), ("b", "a"), ("b", "c"), ("c", "d"), ("d", "b")],
        );
        let broken = resolve_cycles(&mut g);

        assert_eq!(broken.len(), 2);
        assert_eq!((broken[0].dependent.as_str(), broken[0].dependency.as_str()), ("b", "a"));
        assert!(!has_cycle(&g));
    }

    #[test]
    fn test_resolution_is_deterministic() {
        let edges = [("x", "y"), ("y", "z"), ("z", "x"), ("z", "y")];
        let mut first = graph(&["x", "y", "z"], &edges);
        let mut second = graph(&["x", "y", "z"], &edges);
        assert_eq!(resolve_cycles(&mut first), resolve_cycles(&mut second));
    }

    #[test]
    fn test_describe_closes_the_cycle() {
        let mut g = graph(&["a", "b"], &[("a", "b"), ("b", "a")]);
        let broken = resolve_cycles(&mut g);
        assert_eq!(broken[0].describe(), "b -> a (cycle: a -> b -> a)");
    }
}
