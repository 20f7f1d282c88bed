//! Dependency graph building and topological ordering

use crate::error::{Error, FieldError, Result, UnresolvedRef};
use crate::schema::Registry;
use crate::types::DeclarationSet;
use petgraph::Direction;
use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};

/// A reference from one declaration's attribute to another declaration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferenceEdge {
    /// Logical name of the referencing declaration
    pub from: String,
    /// Attribute path holding the reference
    pub attribute: String,
    /// Logical name of the referenced declaration
    pub to: String,
    /// Attribute of the target being read
    pub target_attribute: String,
}

/// Directed acyclic graph of declaration dependencies
///
/// Edges point from a dependency to its dependent, so the topological order
/// lists dependencies first. Node indices match declaration order.
#[derive(Debug)]
pub struct Graph {
    graph: DiGraph<String, ()>,
    node_map: HashMap<String, NodeIndex>,
    edges: Vec<ReferenceEdge>,
    order: Vec<String>,
}

impl Graph {
    /// Build the graph for a validated declaration set
    ///
    /// All unresolved references are reported together. A cycle fails with
    /// every participant named.
    pub fn build(set: &DeclarationSet, registry: &Registry) -> Result<Self> {
        let mut graph = DiGraph::with_capacity(set.len(), set.len());
        let mut node_map = HashMap::with_capacity(set.len());
        for decl in set.iter() {
            let idx = graph.add_node(decl.name().to_string());
            node_map.insert(decl.name().to_string(), idx);
        }

        let mut edges = Vec::new();
        let mut unresolved = Vec::new();
        let mut invalid = Vec::new();

        for decl in set.iter() {
            let address = decl.address.to_string();
            let schema = registry.schema_for(decl)?;

            for (path, reference) in decl.references() {
                let Some(target) = set.get(&reference.target) else {
                    unresolved.push(UnresolvedRef {
                        from: address.clone(),
                        attribute: path,
                        target: reference.target.clone(),
                    });
                    continue;
                };

                let top_level = top_level_attribute(&path);
                if let Some(attr) = schema.get(top_level)
                    && !attr.references.allows_kind(target.kind())
                {
                    invalid.push(FieldError::new(
                        &address,
                        &path,
                        format!(
                            "cannot reference '{}' of kind {}",
                            target.name(),
                            target.kind()
                        ),
                    ));
                    continue;
                }

                if !reference.is_identity()
                    && let Some(target_schema) = registry.lookup(target.kind())
                    && target_schema.get(&reference.attribute).is_none()
                {
                    invalid.push(FieldError::new(
                        &address,
                        &path,
                        format!(
                            "{} has no attribute '{}'",
                            target.address, reference.attribute
                        ),
                    ));
                    continue;
                }

                graph.update_edge(node_map[target.name()], node_map[decl.name()], ());
                edges.push(ReferenceEdge {
                    from: decl.name().to_string(),
                    attribute: path,
                    to: target.name().to_string(),
                    target_attribute: reference.attribute.clone(),
                });
            }
        }

        if !unresolved.is_empty() {
            return Err(Error::UnresolvedReference(unresolved));
        }
        if !invalid.is_empty() {
            return Err(Error::InvalidReference(invalid));
        }

        let participants = cycle_participants(&graph);
        if !participants.is_empty() {
            return Err(Error::CyclicDependency { participants });
        }

        let order = kahn_order(&graph);
        log::debug!("dependency order: {}", order.join(" -> "));

        Ok(Self {
            graph,
            node_map,
            edges,
            order,
        })
    }

    /// Logical names in topological order (dependencies first)
    ///
    /// Independent declarations keep their declaration order.
    pub fn order(&self) -> &[String] {
        &self.order
    }

    /// Every reference edge, in declaration order
    pub fn edges(&self) -> &[ReferenceEdge] {
        &self.edges
    }

    /// Direct dependencies of a declaration, in declaration order
    pub fn dependencies(&self, name: &str) -> Vec<String> {
        self.neighbors(name, Direction::Incoming)
    }

    /// Direct dependents of a declaration, in declaration order
    pub fn dependents(&self, name: &str) -> Vec<String> {
        self.neighbors(name, Direction::Outgoing)
    }

    fn neighbors(&self, name: &str, direction: Direction) -> Vec<String> {
        let Some(&idx) = self.node_map.get(name) else {
            return Vec::new();
        };
        let mut indices: Vec<NodeIndex> = self.graph.neighbors_directed(idx, direction).collect();
        indices.sort();
        indices
            .into_iter()
            .map(|i| self.graph[i].clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }
}

/// `network.subnet_id` -> `network`, `prefixes[0]` -> `prefixes`
fn top_level_attribute(path: &str) -> &str {
    let end = path.find(['.', '[']).unwrap_or(path.len());
    &path[..end]
}

/// Every node that sits on a cycle, in declaration order
fn cycle_participants(graph: &DiGraph<String, ()>) -> Vec<String> {
    let mut nodes: Vec<NodeIndex> = tarjan_scc(graph)
        .into_iter()
        .filter(|scc| scc.len() > 1 || graph.contains_edge(scc[0], scc[0]))
        .flatten()
        .collect();
    nodes.sort();
    nodes.into_iter().map(|i| graph[i].clone()).collect()
}

/// Kahn's algorithm, breaking ties by declaration order
fn kahn_order(graph: &DiGraph<String, ()>) -> Vec<String> {
    let mut in_degree: Vec<usize> = graph
        .node_indices()
        .map(|n| graph.neighbors_directed(n, Direction::Incoming).count())
        .collect();

    let mut ready: BinaryHeap<Reverse<NodeIndex>> = graph
        .node_indices()
        .filter(|n| in_degree[n.index()] == 0)
        .map(Reverse)
        .collect();

    let mut order = Vec::with_capacity(graph.node_count());
    while let Some(Reverse(node)) = ready.pop() {
        order.push(graph[node].clone());
        for next in graph.neighbors_directed(node, Direction::Outgoing) {
            in_degree[next.index()] -= 1;
            if in_degree[next.index()] == 0 {
                ready.push(Reverse(next));
            }
        }
    }
    order
}
