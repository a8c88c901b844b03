//! # Pipeline DAG
//!
//! Static dependency graph for one pipeline definition. Nodes are task
//! aliases, edges are the "needs" declarations, and the synthetic [`ROOT`]
//! node anchors the graph. [`Dag::check`] validates the shape at apply time;
//! [`Dag::next_nodes`] answers the fan-out question at run time.

use std::collections::{HashMap, HashSet};
use thiserror::Error;

/// Alias of the synthetic root node every pipeline graph hangs off
pub const ROOT: &str = "root";

/// Validation errors for a pipeline graph
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DagError {
    #[error("Duplicate node: {alias}")]
    DuplicateNode { alias: String },

    #[error("Unknown node: {alias}")]
    UnknownNode { alias: String },

    #[error("Root node must not declare needs")]
    RootWithNeeds,

    #[error("No node depends on the root node")]
    RootNotNeeded,

    #[error("Node {alias} declares no needs")]
    MissingNeeds { alias: String },

    #[error("Duplicate edge {from} -> {to}")]
    DuplicateEdge { from: String, to: String },
}

/// One node of the graph: an alias plus the aliases it waits on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DagNode {
    pub alias: String,
    pub needs: Vec<String>,
}

/// Directed acyclic graph of task aliases for one pipeline definition.
///
/// The root node is implicit: construction inserts it with no needs, and
/// every other node must reach it through its needs chain.
#[derive(Debug, Clone)]
pub struct Dag {
    nodes: Vec<DagNode>,
    index: HashMap<String, usize>,
}

impl Dag {
    pub fn new() -> Self {
        let mut dag = Self {
            nodes: Vec::new(),
            index: HashMap::new(),
        };
        // The synthetic root is always present.
        dag.index.insert(ROOT.to_string(), 0);
        dag.nodes.push(DagNode {
            alias: ROOT.to_string(),
            needs: Vec::new(),
        });
        dag
    }

    /// Add a node with the given alias, preserving definition order
    pub fn add_node(&mut self, alias: impl Into<String>) -> Result<(), DagError> {
        let alias = alias.into();
        if self.index.contains_key(&alias) {
            return Err(DagError::DuplicateNode { alias });
        }
        self.index.insert(alias.clone(), self.nodes.len());
        self.nodes.push(DagNode {
            alias,
            needs: Vec::new(),
        });
        Ok(())
    }

    /// Declare the needs edges for an existing node
    pub fn add_edge(&mut self, alias: &str, needs: Vec<String>) -> Result<(), DagError> {
        let idx = *self
            .index
            .get(alias)
            .ok_or_else(|| DagError::UnknownNode {
                alias: alias.to_string(),
            })?;
        for need in &needs {
            if !self.index.contains_key(need) {
                return Err(DagError::UnknownNode { alias: need.clone() });
            }
        }
        self.nodes[idx].needs.extend(needs);
        Ok(())
    }

    /// Validate the graph shape.
    ///
    /// Rejects: a root with needs, a graph where no node needs root, any
    /// non-root node with no needs, and a repeated directed edge (the static
    /// cycle signal).
    pub fn check(&self) -> Result<(), DagError> {
        let mut root_needed = false;
        let mut seen_edges: HashSet<(String, String)> = HashSet::new();

        for node in &self.nodes {
            if node.alias == ROOT {
                if !node.needs.is_empty() {
                    return Err(DagError::RootWithNeeds);
                }
                continue;
            }
            if node.needs.is_empty() {
                return Err(DagError::MissingNeeds {
                    alias: node.alias.clone(),
                });
            }
            for need in &node.needs {
                if need == ROOT {
                    root_needed = true;
                }
                if !seen_edges.insert((need.clone(), node.alias.clone())) {
                    return Err(DagError::DuplicateEdge {
                        from: need.clone(),
                        to: node.alias.clone(),
                    });
                }
            }
        }

        if self.nodes.len() > 1 && !root_needed {
            return Err(DagError::RootNotNeeded);
        }
        Ok(())
    }

    /// All nodes whose needs list contains `alias`, in definition order.
    ///
    /// This is the fan-out set evaluated after a node completes.
    pub fn next_nodes(&self, alias: &str) -> Vec<&DagNode> {
        self.nodes
            .iter()
            .filter(|node| node.needs.iter().any(|need| need == alias))
            .collect()
    }

    /// Look up a node by alias
    pub fn node(&self, alias: &str) -> Option<&DagNode> {
        self.index.get(alias).map(|idx| &self.nodes[*idx])
    }

    /// All non-root nodes in definition order
    pub fn task_nodes(&self) -> impl Iterator<Item = &DagNode> {
        self.nodes.iter().filter(|node| node.alias != ROOT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dag_of(edges: &[(&str, &[&str])]) -> Dag {
        let mut dag = Dag::new();
        for (alias, _) in edges {
            dag.add_node(*alias).unwrap();
        }
        for (alias, needs) in edges {
            dag.add_edge(alias, needs.iter().map(|s| s.to_string()).collect())
                .unwrap();
        }
        dag
    }

    #[test]
    fn valid_diamond_passes_check() {
        let dag = dag_of(&[
            ("a", &[ROOT]),
            ("b", &[ROOT]),
            ("c", &["a", "b"]),
        ]);
        assert!(dag.check().is_ok());
    }

    #[test]
    fn root_with_needs_is_rejected() {
        let mut dag = Dag::new();
        dag.add_node("a").unwrap();
        dag.add_edge(ROOT, vec!["a".to_string()]).unwrap();
        dag.add_edge("a", vec![ROOT.to_string()]).unwrap();
        assert_eq!(dag.check(), Err(DagError::RootWithNeeds));
    }

    #[test]
    fn graph_not_anchored_on_root_is_rejected() {
        let dag = dag_of(&[("a", &["b"]), ("b", &["a"])]);
        assert_eq!(dag.check(), Err(DagError::RootNotNeeded));
    }

    #[test]
    fn non_root_node_without_needs_is_rejected() {
        let mut dag = Dag::new();
        dag.add_node("a").unwrap();
        dag.add_node("b").unwrap();
        dag.add_edge("a", vec![ROOT.to_string()]).unwrap();
        assert_eq!(
            dag.check(),
            Err(DagError::MissingNeeds {
                alias: "b".to_string()
            })
        );
    }

    #[test]
    fn repeated_directed_edge_is_rejected() {
        let mut dag = Dag::new();
        dag.add_node("a").unwrap();
        dag.add_edge("a", vec![ROOT.to_string(), ROOT.to_string()])
            .unwrap();
        assert_eq!(
            dag.check(),
            Err(DagError::DuplicateEdge {
                from: ROOT.to_string(),
                to: "a".to_string()
            })
        );
    }

    #[test]
    fn unknown_need_is_rejected_at_edge_time() {
        let mut dag = Dag::new();
        dag.add_node("a").unwrap();
        let err = dag.add_edge("a", vec!["ghost".to_string()]).unwrap_err();
        assert_eq!(
            err,
            DagError::UnknownNode {
                alias: "ghost".to_string()
            }
        );
    }

    #[test]
    fn next_nodes_returns_fanout_in_definition_order() {
        let dag = dag_of(&[
            ("a", &[ROOT]),
            ("b", &[ROOT]),
            ("c", &["a", "b"]),
        ]);
        let after_root: Vec<&str> = dag
            .next_nodes(ROOT)
            .iter()
            .map(|node| node.alias.as_str())
            .collect();
        assert_eq!(after_root, vec!["a", "b"]);

        let after_a: Vec<&str> = dag
            .next_nodes("a")
            .iter()
            .map(|node| node.alias.as_str())
            .collect();
        assert_eq!(after_a, vec!["c"]);
        assert!(dag.next_nodes("c").is_empty());
    }
}
