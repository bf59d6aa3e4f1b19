//! Dependency graph between module instances.

use crate::stack::expr::{self, ExprError};
use crate::stack::model::StackConfig;
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap, HashMap};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum GraphError {
    #[error("Cyclic dependency: {}", .cycle.join(" -> "))]
    CyclicDependency { cycle: Vec<String> },

    #[error("Instance '{instance}' depends on unknown instance '{dependency}'")]
    UnknownDependency { instance: String, dependency: String },

    #[error("Instance '{0}' is declared more than once")]
    DuplicateInstance(String),

    #[error("Invalid expression in instance '{instance}': {source}")]
    Expression {
        instance: String,
        #[source]
        source: ExprError,
    },
}

/// Graph node: an instance and the instances whose outputs it consumes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphNode {
    pub name: String,
    pub dependencies: BTreeSet<String>,
}

impl GraphNode {
    pub fn new<I, S>(name: impl Into<String>, dependencies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            dependencies: dependencies.into_iter().map(Into::into).collect(),
        }
    }
}

/// Graph edge: `from` must be applied before `to`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphEdge {
    pub from: String,
    pub to: String,
}

/// Acyclic instance graph with a deterministic apply order
#[derive(Debug, Clone)]
pub struct ModuleGraph {
    nodes: Vec<GraphNode>,
    index: HashMap<String, usize>,
    dependents: Vec<Vec<usize>>,
    order: Vec<usize>,
}

impl ModuleGraph {
    /// Build from nodes in declaration order.
    ///
    /// Instances with no ordering constraint between them keep their
    /// declaration order, so the same configuration always applies the same way.
    pub fn build(nodes: Vec<GraphNode>) -> Result<Self, GraphError> {
        let mut index = HashMap::with_capacity(nodes.len());
        for (i, node) in nodes.iter().enumerate() {
            if index.insert(node.name.clone(), i).is_some() {
                return Err(GraphError::DuplicateInstance(node.name.clone()));
            }
        }

        let mut dependents = vec![Vec::new(); nodes.len()];
        let mut in_degree = vec![0usize; nodes.len()];
        for (i, node) in nodes.iter().enumerate() {
            for dep in &node.dependencies {
                let Some(&d) = index.get(dep) else {
                    return Err(GraphError::UnknownDependency {
                        instance: node.name.clone(),
                        dependency: dep.clone(),
                    });
                };
                dependents[d].push(i);
                in_degree[i] += 1;
            }
        }

        // Kahn's algorithm, always taking the earliest declared ready node
        let mut ready: BinaryHeap<Reverse<usize>> = in_degree
            .iter()
            .enumerate()
            .filter(|&(_, &deg)| deg == 0)
            .map(|(i, _)| Reverse(i))
            .collect();
        let mut remaining = in_degree.clone();
        let mut order = Vec::with_capacity(nodes.len());

        while let Some(Reverse(i)) = ready.pop() {
            order.push(i);
            for &next in &dependents[i] {
                remaining[next] -= 1;
                if remaining[next] == 0 {
                    ready.push(Reverse(next));
                }
            }
        }

        let graph = Self {
            nodes,
            index,
            dependents,
            order,
        };

        if graph.order.len() != graph.nodes.len() {
            return Err(GraphError::CyclicDependency {
                cycle: graph.find_cycle(&remaining),
            });
        }

        Ok(graph)
    }

    /// Build the graph of a stack's instances from their references and `depends_on`
    pub fn from_config(config: &StackConfig) -> Result<Self, GraphError> {
        let mut nodes = Vec::with_capacity(config.instances.len());
        for instance in &config.instances {
            let mut dependencies: BTreeSet<String> = instance.depends_on.iter().cloned().collect();
            for expr in instance.inputs.values() {
                let referenced =
                    expr::referenced_instances(expr).map_err(|source| GraphError::Expression {
                        instance: instance.name.clone(),
                        source,
                    })?;
                dependencies.extend(referenced);
            }
            nodes.push(GraphNode {
                name: instance.name.clone(),
                dependencies,
            });
        }
        Self::build(nodes)
    }

    /// Walk dependencies among the nodes Kahn's algorithm could not release.
    /// Every such node has at least one unreleased dependency, so the walk must revisit a node.
    fn find_cycle(&self, remaining: &[usize]) -> Vec<String> {
        let stuck = |i: usize| remaining[i] > 0;
        let Some(start) = (0..self.nodes.len()).find(|&i| stuck(i)) else {
            return Vec::new();
        };

        let mut path: Vec<usize> = Vec::new();
        let mut seen: HashMap<usize, usize> = HashMap::new();
        let mut current = start;
        loop {
            if let Some(&pos) = seen.get(&current) {
                let mut cycle: Vec<String> = path[pos..]
                    .iter()
                    .map(|&i| self.nodes[i].name.clone())
                    .collect();
                cycle.push(self.nodes[current].name.clone());
                return cycle;
            }
            seen.insert(current, path.len());
            path.push(current);

            let next = self.nodes[current]
                .dependencies
                .iter()
                .filter_map(|dep| self.index.get(dep).copied())
                .find(|&d| stuck(d));
            match next {
                Some(n) => current = n,
                None => return path.iter().map(|&i| self.nodes[i].name.clone()).collect(),
            }
        }
    }

    /// Instance names in apply order
    pub fn order(&self) -> Vec<&str> {
        self.order.iter().map(|&i| self.nodes[i].name.as_str()).collect()
    }

    /// Instance names in destroy order (dependents first)
    pub fn reverse_order(&self) -> Vec<&str> {
        self.order
            .iter()
            .rev()
            .map(|&i| self.nodes[i].name.as_str())
            .collect()
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

    /// Instances whose outputs `name` consumes
    pub fn dependencies(&self, name: &str) -> Vec<&str> {
        self.index
            .get(name)
            .map(|&i| {
                self.nodes[i]
                    .dependencies
                    .iter()
                    .map(String::as_str)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Instances that consume outputs of `name` directly
    pub fn dependents(&self, name: &str) -> Vec<&str> {
        self.index
            .get(name)
            .map(|&i| {
                self.dependents[i]
                    .iter()
                    .map(|&d| self.nodes[d].name.as_str())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Every instance downstream of `name`, in apply order
    pub fn transitive_dependents(&self, name: &str) -> Vec<&str> {
        let Some(&start) = self.index.get(name) else {
            return Vec::new();
        };
        let mut reached = vec![false; self.nodes.len()];
        let mut stack = vec![start];
        while let Some(i) = stack.pop() {
            for &d in &self.dependents[i] {
                if !reached[d] {
                    reached[d] = true;
                    stack.push(d);
                }
            }
        }
        self.order
            .iter()
            .filter(|&&i| reached[i])
            .map(|&i| self.nodes[i].name.as_str())
            .collect()
    }

    pub fn edges(&self) -> Vec<GraphEdge> {
        self.order
            .iter()
            .flat_map(|&i| {
                self.nodes[i].dependencies.iter().map(move |dep| GraphEdge {
                    from: dep.clone(),
                    to: self.nodes[i].name.clone(),
                })
            })
            .collect()
    }

    /// Render as Graphviz DOT
    pub fn to_dot(&self) -> String {
        let mut dot = String::from("digraph {\n  rankdir = \"LR\"\n");
        for &i in &self.order {
            dot.push_str(&format!("  \"module.{}\"\n", self.nodes[i].name));
        }
        for edge in self.edges() {
            dot.push_str(&format!(
                "  \"module.{}\" -> \"module.{}\"\n",
                edge.from, edge.to
            ));
        }
        dot.push_str("}\n");
        dot
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(name: &str, deps: &[&str]) -> GraphNode {
        GraphNode::new(name, deps.iter().copied())
    }

    #[test]
    fn test_dependencies_come_first() {
        let graph = ModuleGraph::build(vec![
            node("eks", &["vpc", "iam"]),
            node("rds", &["vpc", "sg"]),
            node("vpc", &[]),
            node("iam", &[]),
            node("sg", &["vpc"]),
        ])
        .unwrap();

        assert_eq!(graph.order(), vec!["vpc", "iam", "eks", "sg", "rds"]);
    }

    #[test]
    fn test_independent_instances_keep_declaration_order() {
        let graph = ModuleGraph::build(vec![
            node("c", &[]),
            node("a", &[]),
            node("b", &[]),
        ])
        .unwrap();
        assert_eq!(graph.order(), vec!["c", "a", "b"]);
        assert_eq!(graph.reverse_order(), vec!["b", "a", "c"]);
    }

    #[test]
    fn test_cycle_is_reported() {
        let err = ModuleGraph::build(vec![
            node("vpc", &[]),
            node("a", &["c", "vpc"]),
            node("b", &["a"]),
            node("c", &["b"]),
        ])
        .unwrap_err();

        match err {
            GraphError::CyclicDependency { cycle } => {
                assert_eq!(cycle.first(), cycle.last());
                assert_eq!(cycle.len(), 4);
                assert!(!cycle.contains(&"vpc".to_string()));
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_self_reference_is_a_cycle() {
        let err = ModuleGraph::build(vec![node("a", &["a"])]).unwrap_err();
        assert_eq!(
            err,
            GraphError::CyclicDependency {
                cycle: vec!["a".to_string(), "a".to_string()]
            }
        );
    }

    #[test]
    fn test_unknown_dependency_and_duplicates() {
        assert!(matches!(
            ModuleGraph::build(vec![node("eks", &["vpc"])]),
            Err(GraphError::UnknownDependency { .. })
        ));
        assert!(matches!(
            ModuleGraph::build(vec![node("vpc", &[]), node("vpc", &[])]),
            Err(GraphError::DuplicateInstance(_))
        ));
    }

    #[test]
    fn test_dependents() {
        let graph = ModuleGraph::build(vec![
            node("a", &[]),
            node("b", &["a"]),
            node("c", &["b"]),
            node("d", &[]),
        ])
        .unwrap();
        assert_eq!(graph.dependents("a"), vec!["b"]);
        assert_eq!(graph.transitive_dependents("a"), vec!["b", "c"]);
        assert_eq!(graph.dependencies("c"), vec!["b"]);
        assert!(graph.to_dot().contains("\"module.a\" -> \"module.b\""));
    }
}
