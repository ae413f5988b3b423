use querygraph_core::{Entity, Relationship, StructuredMapping};
use serde::Serialize;
use std::collections::HashMap;
use tracing::debug;

/// One entity and its edges. The left side of a relationship depends on the
/// right side.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GraphNode {
    pub name: String,
    pub dependencies: Vec<String>,
    pub dependents: Vec<String>,
    pub entity: Entity,
}

impl GraphNode {
    fn new(entity: &Entity) -> Self {
        Self {
            name: entity.name.clone(),
            dependencies: Vec::new(),
            dependents: Vec::new(),
            entity: entity.clone(),
        }
    }
}

/// Directed dependency graph over the entities of one mapping.
///
/// Nodes keep mapping order and are looked up through a name index, so every
/// traversal is deterministic.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DependencyGraph {
    nodes: Vec<GraphNode>,
    #[serde(skip)]
    index: HashMap<String, usize>,
    /// Input positions of relationships naming an unknown entity
    skipped: Vec<usize>,
}

impl DependencyGraph {
    pub fn build(entities: &[Entity], relationships: &[Relationship]) -> Self {
        let mut graph = Self::default();
        for entity in entities {
            if graph.index.contains_key(&entity.name) {
                continue;
            }
            graph.index.insert(entity.name.clone(), graph.nodes.len());
            graph.nodes.push(GraphNode::new(entity));
        }

        for (position, relationship) in relationships.iter().enumerate() {
            let (Some(&left), Some(&right)) = (
                graph.index.get(&relationship.left),
                graph.index.get(&relationship.right),
            ) else {
                debug!(
                    "Skipping relationship {} -> {}: unknown entity",
                    relationship.left, relationship.right
                );
                graph.skipped.push(position);
                continue;
            };
            graph.nodes[left]
                .dependencies
                .push(relationship.right.clone());
            graph.nodes[right].dependents.push(relationship.left.clone());
        }

        graph
    }

    pub fn from_mapping(mapping: &StructuredMapping) -> Self {
        Self::build(&mapping.entities, &mapping.relationships)
    }

    pub fn nodes(&self) -> &[GraphNode] {
        &self.nodes
    }

    pub fn node(&self, name: &str) -> Option<&GraphNode> {
        self.position(name).map(|i| &self.nodes[i])
    }

    /// Mapping index of the entity.
    pub fn position(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn skipped_relationships(&self) -> &[usize] {
        &self.skipped
    }

    /// All `(dependent, dependency)` edges in node order, then insertion order.
    pub fn edges(&self) -> Vec<(String, String)> {
        self.nodes
            .iter()
            .flat_map(|node| {
                node.dependencies
                    .iter()
                    .map(move |dependency| (node.name.clone(), dependency.clone()))
            })
            .collect()
    }

    pub fn edge_count(&self) -> usize {
        self.nodes.iter().map(|node| node.dependencies.len()).sum()
    }

    pub(crate) fn dependency_positions(&self, position: usize) -> Vec<usize> {
        self.nodes[position]
            .dependencies
            .iter()
            .filter_map(|name| self.position(name))
            .collect()
    }

    /// Removes one occurrence of the edge from both adjacency lists.
    pub fn remove_edge(&mut self, dependent: &str, dependency: &str) -> bool {
        let (Some(left), Some(right)) = (self.position(dependent), self.position(dependency))
        else {
            return false;
        };

        let Some(slot) = self.nodes[left]
            .dependencies
            .iter()
            .position(|name| name == dependency)
        else {
            return false;
        };
        self.nodes[left].dependencies.remove(slot);

        if let Some(slot) = self.nodes[right]
            .dependents
            .iter()
            .position(|name| name == dependent)
        {
            self.nodes[right].dependents.remove(slot);
        }
        true
    }
}
