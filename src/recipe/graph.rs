// src/recipe/graph.rs

//! Formula dependency graph
//!
//! Directed graph over the formulas of one build plan. An edge `a -> b`
//! means `a` depends on `b`. The scheduler uses the in-degrees (number of
//! unfinished dependencies) to find ready formulas and the reverse edges to
//! propagate failures to everything downstream.
//!
//! # Example
//!
//! ```
//! use formulary::recipe::FormulaGraph;
//!
//! let mut graph = FormulaGraph::new();
//! graph.add_formula("btrfs-progs", &["zlib", "lzo", "pkgconf"]);
//! graph.add_formula("zlib", &[]);
//!
//! let order = graph.topological_sort().unwrap();
//! assert_eq!(order, ["lzo", "pkgconf", "zlib", "btrfs-progs"]);
//! ```

use crate::error::{Error, Result};
use std::collections::{BTreeMap, BTreeSet, VecDeque};

/// A directed graph of formula dependencies
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FormulaGraph {
    /// formula -> formulas it depends on
    edges: BTreeMap<String, BTreeSet<String>>,
    /// formula -> formulas depending on it
    reverse_edges: BTreeMap<String, BTreeSet<String>>,
}

impl FormulaGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a formula with its dependencies
    ///
    /// Adding the same formula again merges the dependencies.
    pub fn add_formula(&mut self, name: &str, dependencies: &[&str]) {
        self.edges.entry(name.to_string()).or_default();
        self.reverse_edges.entry(name.to_string()).or_default();

        for dep in dependencies {
            self.add_edge(name, dep);
        }
    }

    /// Add the edge `from -> to` (`from` depends on `to`)
    pub fn add_edge(&mut self, from: &str, to: &str) {
        self.edges.entry(to.to_string()).or_default();
        self.reverse_edges.entry(to.to_string()).or_default();
        self.reverse_edges.entry(from.to_string()).or_default();

        self.edges
            .entry(from.to_string())
            .or_default()
            .insert(to.to_string());
        self.reverse_edges
            .entry(to.to_string())
            .or_default()
            .insert(from.to_string());
    }

    pub fn formula_count(&self) -> usize {
        self.edges.len()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.edges.contains_key(name)
    }

    pub fn formulas(&self) -> impl Iterator<Item = &str> {
        self.edges.keys().map(String::as_str)
    }

    /// Direct dependencies of a formula
    pub fn dependencies(&self, name: &str) -> Option<&BTreeSet<String>> {
        self.edges.get(name)
    }

    /// Formulas that directly depend on this formula
    pub fn dependents(&self, name: &str) -> Option<&BTreeSet<String>> {
        self.reverse_edges.get(name)
    }

    /// Number of dependencies each formula waits on
    pub fn in_degrees(&self) -> BTreeMap<String, usize> {
        self.edges
            .iter()
            .map(|(name, deps)| (name.clone(), deps.len()))
            .collect()
    }

    /// Kahn's algorithm; ready formulas are taken alphabetically
    pub fn topological_sort(&self) -> Result<Vec<String>> {
        let mut in_degrees = self.in_degrees();
        let mut result = Vec::with_capacity(self.edges.len());

        let mut ready: BTreeSet<String> = in_degrees
            .iter()
            .filter(|&(_, deg)| *deg == 0)
            .map(|(name, _)| name.clone())
            .collect();

        while let Some(node) = ready.pop_first() {
            if let Some(dependents) = self.reverse_edges.get(&node) {
                for dependent in dependents {
                    if let Some(deg) = in_degrees.get_mut(dependent) {
                        *deg = deg.saturating_sub(1);
                        if *deg == 0 {
                            ready.insert(dependent.clone());
                        }
                    }
                }
            }
            result.push(node);
        }

        if result.len() != self.edges.len() {
            let path = self
                .find_cycle()
                .unwrap_or_else(|| self.edges.keys().cloned().collect());
            return Err(Error::DependencyCycle { path });
        }

        Ok(result)
    }

    /// First cycle found by DFS, with the first node repeated at the end
    pub fn find_cycle(&self) -> Option<Vec<String>> {
        let mut visited = BTreeSet::new();
        let mut on_stack = BTreeSet::new();
        let mut path = Vec::new();

        for start in self.edges.keys() {
            if !visited.contains(start) {
                if let Some(cycle) =
                    self.find_cycle_dfs(start, &mut visited, &mut on_stack, &mut path)
                {
                    return Some(cycle);
                }
            }
        }
        None
    }

    fn find_cycle_dfs(
        &self,
        node: &str,
        visited: &mut BTreeSet<String>,
        on_stack: &mut BTreeSet<String>,
        path: &mut Vec<String>,
    ) -> Option<Vec<String>> {
        visited.insert(node.to_string());
        on_stack.insert(node.to_string());
        path.push(node.to_string());

        if let Some(deps) = self.edges.get(node) {
            for dep in deps {
                if on_stack.contains(dep) {
                    let start = path.iter().position(|x| x == dep).unwrap_or(0);
                    let mut cycle = path[start..].to_vec();
                    cycle.push(dep.clone());
                    return Some(cycle);
                }
                if !visited.contains(dep) {
                    if let Some(cycle) = self.find_cycle_dfs(dep, visited, on_stack, path) {
                        return Some(cycle);
                    }
                }
            }
        }

        path.pop();
        on_stack.remove(node);
        None
    }

    /// Everything a formula transitively depends on
    pub fn transitive_dependencies(&self, name: &str) -> BTreeSet<String> {
        Self::reachable(&self.edges, name)
    }

    /// Everything that transitively depends on a formula
    pub fn transitive_dependents(&self, name: &str) -> BTreeSet<String> {
        Self::reachable(&self.reverse_edges, name)
    }

    fn reachable(edges: &BTreeMap<String, BTreeSet<String>>, name: &str) -> BTreeSet<String> {
        let mut found = BTreeSet::new();
        let mut queue: VecDeque<&String> = edges.get(name).into_iter().flatten().collect();

        while let Some(next) = queue.pop_front() {
            if found.insert(next.clone()) {
                if let Some(more) = edges.get(next) {
                    queue.extend(more.iter().filter(|m| !found.contains(*m)));
                }
            }
        }

        found
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_graph() {
        let graph = FormulaGraph::new();
        assert_eq!(graph.formula_count(), 0);
        assert!(graph.topological_sort().unwrap().is_empty());
    }

    #[test]
    fn test_linear_dependencies() {
        let mut graph = FormulaGraph::new();
        graph.add_formula("wiki", &["go"]);
        assert_eq!(graph.topological_sort().unwrap(), vec!["go", "wiki"]);
    }

    #[test]
    fn test_diamond_dependencies() {
        let mut graph = FormulaGraph::new();
        graph.add_formula("app", &["left", "right"]);
        graph.add_formula("left", &["base"]);
        graph.add_formula("right", &["base"]);

        let order = graph.topological_sort().unwrap();
        assert_eq!(order, vec!["base", "left", "right", "app"]);
    }

    #[test]
    fn test_cycle_detection() {
        let mut graph = FormulaGraph::new();
        graph.add_formula("a", &["b"]);
        graph.add_formula("b", &["c"]);
        graph.add_formula("c", &["a"]);

        assert_eq!(
            graph.find_cycle().unwrap(),
            vec!["a", "b", "c", "a"]
        );
        match graph.topological_sort().unwrap_err() {
            Error::DependencyCycle { path } => assert_eq!(path, vec!["a", "b", "c", "a"]),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_self_cycle_detection() {
        let mut graph = FormulaGraph::new();
        graph.add_formula("a", &["a"]);
        assert_eq!(graph.find_cycle().unwrap(), vec!["a", "a"]);
        assert!(graph.topological_sort().is_err());
    }

    #[test]
    fn test_transitive_dependents() {
        let mut graph = FormulaGraph::new();
        graph.add_formula("btrfs-progs", &["e2fsprogs"]);
        graph.add_formula("e2fsprogs", &["util-linux"]);
        graph.add_formula("other", &[]);

        let dependents = graph.transitive_dependents("util-linux");
        assert_eq!(
            dependents.into_iter().collect::<Vec<_>>(),
            vec!["btrfs-progs", "e2fsprogs"]
        );
        assert_eq!(
            graph.transitive_dependencies("btrfs-progs").len(),
            2
        );
    }

    #[test]
    fn test_in_degrees() {
        let mut graph = FormulaGraph::new();
        graph.add_formula("wiki", &["go"]);
        let degrees = graph.in_degrees();
        assert_eq!(degrees["wiki"], 1);
        assert_eq!(degrees["go"], 0);
        assert_eq!(
            graph.dependents("go").unwrap().iter().collect::<Vec<_>>(),
            vec!["wiki"]
        );
    }

    #[test]
    fn test_add_formula_merges_deps() {
        let mut graph = FormulaGraph::new();
        graph.add_formula("a", &["b"]);
        graph.add_formula("a", &["c"]);
        assert_eq!(graph.dependencies("a").unwrap().len(), 2);
    }
}
