//! Dependency graph and execution planning.
//!
//! Deployments may depend on one another; the planner computes a
//! topological order (Kahn's algorithm), reconstructs a concrete cycle path
//! on failure, and groups independent nodes into parallel execution levels.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use thiserror::Error;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum EdgeType {
    /// Must be honored; a hard cycle is a schedulability failure
    Hard,
    /// Preference only, but still participates in ordering
    Soft,
}

#[derive(Debug, Error, PartialEq)]
pub enum GraphError {
    #[error("dependency cycle detected: {}", path.join(" -> "))]
    CycleDetected { path: Vec<String> },

    #[error("unknown node {0:?}")]
    UnknownNode(String),
}

/// Result of a topological sort. `order` has length V exactly when
/// `has_cycle` is false.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TopoResult {
    pub order: Vec<String>,
    pub has_cycle: bool,
    /// One concrete cycle, closed (first element repeated last)
    pub cycle_path: Vec<String>,
}

/// Parallelism-ready execution plan: nodes within a phase have no
/// dependencies on one another and may run concurrently.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ExecutionPlan {
    pub phases: Vec<Vec<String>>,
}

impl ExecutionPlan {
    pub fn node_count(&self) -> usize {
        self.phases.iter().map(Vec::len).sum()
    }
}

#[derive(Default)]
pub struct DependencyGraph {
    /// Insertion order preserved for deterministic traversal
    nodes: Vec<String>,
    node_index: HashMap<String, usize>,
    /// from → [(to, type)]
    edges: HashMap<String, Vec<(String, EdgeType)>>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        DependencyGraph::default()
    }

    /// Add a node. Idempotent.
    pub fn add_node(&mut self, id: &str) {
        if !self.node_index.contains_key(id) {
            self.node_index.insert(id.to_string(), self.nodes.len());
            self.nodes.push(id.to_string());
        }
    }

    /// Add a directed edge `from → to` meaning "`to` depends on `from`
    /// completing first". Endpoints are created as needed.
    pub fn add_edge(&mut self, from: &str, to: &str, edge_type: EdgeType) {
        self.add_node(from);
        self.add_node(to);
        self.edges
            .entry(from.to_string())
            .or_default()
            .push((to.to_string(), edge_type));
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.values().map(Vec::len).sum()
    }

    fn successors(&self, id: &str) -> &[(String, EdgeType)] {
        self.edges.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    #[cfg(test)]
    pub(crate) fn successors_for_test(&self, id: &str) -> &[(String, EdgeType)] {
        self.successors(id)
    }

    /// Kahn's algorithm over all edges (soft edges participate). O(V+E).
    pub fn topological_sort(&self) -> TopoResult {
        let mut in_degree: HashMap<&str, usize> =
            self.nodes.iter().map(|n| (n.as_str(), 0)).collect();
        for targets in self.edges.values() {
            for (to, _) in targets {
                if let Some(degree) = in_degree.get_mut(to.as_str()) {
                    *degree += 1;
                }
            }
        }

        let mut ready: VecDeque<&str> = self
            .nodes
            .iter()
            .filter(|n| in_degree.get(n.as_str()) == Some(&0))
            .map(String::as_str)
            .collect();

        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(node) = ready.pop_front() {
            order.push(node.to_string());
            for (to, _) in self.successors(node) {
                if let Some(degree) = in_degree.get_mut(to.as_str()) {
                    *degree -= 1;
                    if *degree == 0 {
                        ready.push_back(to.as_str());
                    }
                }
            }
        }

        if order.len() == self.nodes.len() {
            TopoResult {
                order,
                has_cycle: false,
                cycle_path: Vec::new(),
            }
        } else {
            TopoResult {
                order,
                has_cycle: true,
                cycle_path: self.find_cycle_path(),
            }
        }
    }

    /// DFS with an explicit recursion stack to reconstruct one concrete
    /// cycle. Only called after Kahn detected that one exists.
    fn find_cycle_path(&self) -> Vec<String> {
        let mut visited: HashSet<&str> = HashSet::new();
        let mut on_stack: HashSet<&str> = HashSet::new();
        let mut stack: Vec<&str> = Vec::new();

        for start in &self.nodes {
            if visited.contains(start.as_str()) {
                continue;
            }
            if let Some(path) =
                self.dfs_cycle(start.as_str(), &mut visited, &mut on_stack, &mut stack)
            {
                return path;
            }
        }
        Vec::new()
    }

    fn dfs_cycle<'a>(
        &'a self,
        node: &'a str,
        visited: &mut HashSet<&'a str>,
        on_stack: &mut HashSet<&'a str>,
        stack: &mut Vec<&'a str>,
    ) -> Option<Vec<String>> {
        visited.insert(node);
        on_stack.insert(node);
        stack.push(node);

        for (to, _) in self.successors(node) {
            if on_stack.contains(to.as_str()) {
                // Close the loop: slice the stack from the first occurrence
                let start = stack.iter().position(|n| *n == to.as_str())?;
                let mut path: Vec<String> =
                    stack[start..].iter().map(|s| s.to_string()).collect();
                path.push(to.clone());
                return Some(path);
            }
            if !visited.contains(to.as_str()) {
                if let Some(path) = self.dfs_cycle(to.as_str(), visited, on_stack, stack) {
                    return Some(path);
                }
            }
        }

        on_stack.remove(node);
        stack.pop();
        None
    }

    /// Compute the parallel execution plan.
    ///
    /// level(v) = 1 + max(level(u)) over direct predecessors u, leaves at
    /// 0; phase k is the set of nodes at level k. O(V+E).
    ///
    /// # Errors
    /// `CycleDetected` with a concrete path when the graph is cyclic.
    pub fn execution_order(&self) -> Result<ExecutionPlan, GraphError> {
        let topo = self.topological_sort();
        if topo.has_cycle {
            return Err(GraphError::CycleDetected {
                path: topo.cycle_path,
            });
        }

        // Predecessor map for level computation
        let mut predecessors: HashMap<&str, Vec<&str>> = HashMap::new();
        for (from, targets) in &self.edges {
            for (to, _) in targets {
                predecessors.entry(to.as_str()).or_default().push(from.as_str());
            }
        }

        let mut levels: HashMap<&str, usize> = HashMap::new();
        let mut max_level = 0;
        for node in &topo.order {
            let level = predecessors
                .get(node.as_str())
                .map(|preds| {
                    1 + preds
                        .iter()
                        .map(|p| levels.get(p).copied().unwrap_or(0))
                        .max()
                        .unwrap_or(0)
                })
                .unwrap_or(0);
            max_level = max_level.max(level);
            levels.insert(node.as_str(), level);
        }

        let mut phases = vec![Vec::new(); max_level + 1];
        // Insertion order within a phase follows topological order
        for node in &topo.order {
            if let Some(level) = levels.get(node.as_str()) {
                phases[*level].push(node.clone());
            }
        }

        Ok(ExecutionPlan { phases })
    }

    /// Check that `candidate` lists every node exactly once with each
    /// dependency before its dependents.
    pub fn is_valid_execution_order(&self, candidate: &[String]) -> bool {
        if candidate.len() != self.nodes.len() {
            return false;
        }
        let positions: HashMap<&str, usize> = candidate
            .iter()
            .enumerate()
            .map(|(i, n)| (n.as_str(), i))
            .collect();
        if positions.len() != self.nodes.len() {
            return false;
        }
        for node in &self.nodes {
            if !positions.contains_key(node.as_str()) {
                return false;
            }
        }
        for (from, targets) in &self.edges {
            let Some(from_pos) = positions.get(from.as_str()) else {
                return false;
            };
            for (to, _) in targets {
                let Some(to_pos) = positions.get(to.as_str()) else {
                    return false;
                };
                if from_pos >= to_pos {
                    return false;
                }
            }
        }
        true
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Tests can use unwrap/expect for brevity
#[path = "graph_test.rs"]
mod tests;
