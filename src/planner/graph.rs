//! Dependency graph over resource descriptors.
//!
//! Edges point from a resource to the resources it references. Building
//! the graph resolves every reference and rejects cycles, so a built graph
//! always has a topological order.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::error::{GraphError, Result};
use crate::resource::ResourceDescriptor;

/// Resolved reference graph.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    /// Node names, sorted.
    names: Vec<String>,
    /// Name to node index.
    index: HashMap<String, usize>,
    /// For each node, the nodes it depends on.
    dependencies: Vec<BTreeSet<usize>>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    InProgress,
    Done,
}

impl DependencyGraph {
    /// Builds the graph for a descriptor set.
    ///
    /// # Errors
    ///
    /// Returns [`GraphError::UnknownReference`] if a reference names a
    /// resource outside the set, or [`GraphError::Cycle`] with the full
    /// cycle path if the references are cyclic.
    pub fn build(descriptors: &[ResourceDescriptor]) -> Result<Self> {
        let mut names: Vec<String> = descriptors.iter().map(|d| d.name.clone()).collect();
        names.sort();
        names.dedup();

        let index: HashMap<String, usize> = names
            .iter()
            .enumerate()
            .map(|(i, name)| (name.clone(), i))
            .collect();

        let mut dependencies = vec![BTreeSet::new(); names.len()];
        for descriptor in descriptors {
            let from = index[&descriptor.name];
            for reference in &descriptor.references {
                let to = index.get(&reference.name).ok_or_else(|| GraphError::UnknownReference {
                    from: descriptor.name.clone(),
                    to: reference.name.clone(),
                })?;
                dependencies[from].insert(*to);
            }
        }

        let graph = Self {
            names,
            index,
            dependencies,
        };
        graph.check_acyclic()?;
        Ok(graph)
    }

    /// Depth-first search in name order; reports the first cycle found.
    fn check_acyclic(&self) -> Result<()> {
        let mut marks = vec![Mark::Unvisited; self.names.len()];
        let mut stack = Vec::new();

        for node in 0..self.names.len() {
            if marks[node] == Mark::Unvisited {
                self.visit(node, &mut marks, &mut stack)?;
            }
        }
        Ok(())
    }

    fn visit(&self, node: usize, marks: &mut [Mark], stack: &mut Vec<usize>) -> Result<()> {
        marks[node] = Mark::InProgress;
        stack.push(node);

        for &dep in &self.dependencies[node] {
            match marks[dep] {
                Mark::Done => {}
                Mark::Unvisited => self.visit(dep, marks, stack)?,
                Mark::InProgress => {
                    let start = stack.iter().position(|&n| n == dep).unwrap_or(0);
                    let mut path: Vec<String> =
                        stack[start..].iter().map(|&n| self.names[n].clone()).collect();
                    path.push(self.names[dep].clone());
                    return Err(GraphError::Cycle { path }.into());
                }
            }
        }

        stack.pop();
        marks[node] = Mark::Done;
        Ok(())
    }

    /// Returns every name such that each dependency precedes its
    /// dependents. Ties are broken by name, so the order is stable.
    #[must_use]
    pub fn topological_order(&self) -> Vec<String> {
        let mut remaining: Vec<usize> = self.dependencies.iter().map(BTreeSet::len).collect();
        let dependents = self.dependents_index();

        let mut ready: BTreeSet<usize> = (0..self.names.len()).filter(|&n| remaining[n] == 0).collect();
        let mut order = Vec::with_capacity(self.names.len());

        while let Some(node) = ready.pop_first() {
            order.push(self.names[node].clone());
            for &dependent in &dependents[node] {
                remaining[dependent] -= 1;
                if remaining[dependent] == 0 {
                    ready.insert(dependent);
                }
            }
        }

        order
    }

    /// Depth of every node: 0 without dependencies, otherwise one more than
    /// its deepest dependency.
    #[must_use]
    pub fn ranks(&self) -> BTreeMap<String, usize> {
        let mut ranks: BTreeMap<String, usize> = BTreeMap::new();
        for name in self.topological_order() {
            let node = self.index[&name];
            let rank = self.dependencies[node]
                .iter()
                .filter_map(|&dep| ranks.get(&self.names[dep]))
                .map(|r| r + 1)
                .max()
                .unwrap_or(0);
            ranks.insert(name, rank);
        }
        ranks
    }

    /// Direct dependencies of `name`, sorted.
    #[must_use]
    pub fn dependencies_of(&self, name: &str) -> Vec<String> {
        self.index.get(name).map_or_else(Vec::new, |&node| {
            self.dependencies[node]
                .iter()
                .map(|&dep| self.names[dep].clone())
                .collect()
        })
    }

    /// Number of nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.names.len()
    }

    /// Returns true if the graph has no nodes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    fn dependents_index(&self) -> Vec<Vec<usize>> {
        let mut dependents = vec![Vec::new(); self.names.len()];
        for (node, deps) in self.dependencies.iter().enumerate() {
            for &dep in deps {
                dependents[dep].push(node);
            }
        }
        dependents
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::KestrelError;
    use crate::resource::ResourceKind;

    fn node(name: &str, deps: &[&str]) -> ResourceDescriptor {
        deps.iter().fold(
            ResourceDescriptor::new(ResourceKind::ResourceGroup, name),
            |d, dep| d.with_ref(ResourceKind::ResourceGroup, *dep),
        )
    }

    fn position(order: &[String], name: &str) -> usize {
        order.iter().position(|n| n == name).unwrap()
    }

    #[test]
    fn test_dependencies_precede_dependents() {
        let set = vec![
            node("vm", &["nic"]),
            node("nic", &["subnet", "ip"]),
            node("ip", &["rg"]),
            node("subnet", &["vnet"]),
            node("vnet", &["rg"]),
            node("rg", &[]),
        ];
        let graph = DependencyGraph::build(&set).unwrap();
        let order = graph.topological_order();

        assert_eq!(order.len(), 6);
        for d in &set {
            for r in &d.references {
                assert!(position(&order, &r.name) < position(&order, &d.name));
            }
        }
    }

    #[test]
    fn test_order_is_stable_by_name() {
        let set = vec![node("c", &[]), node("a", &[]), node("b", &["a"])];
        let order = DependencyGraph::build(&set).unwrap().topological_order();
        assert_eq!(order, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_two_node_cycle_names_both() {
        let set = vec![node("a", &["b"]), node("b", &["a"])];
        let err = DependencyGraph::build(&set).unwrap_err();

        match err {
            KestrelError::Graph(GraphError::Cycle { path }) => {
                assert_eq!(path, vec!["a", "b", "a"]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_longer_cycle_reports_only_cycle_members() {
        let set = vec![
            node("root", &["x"]),
            node("x", &["y"]),
            node("y", &["z"]),
            node("z", &["x"]),
        ];
        let err = DependencyGraph::build(&set).unwrap_err();
        assert_eq!(err.to_string(), "Dependency graph error: Reference cycle detected: x -> y -> z -> x");
    }

    #[test]
    fn test_unknown_reference() {
        let set = vec![node("nic", &["ghost"])];
        let err = DependencyGraph::build(&set).unwrap_err();
        assert!(matches!(
            err,
            KestrelError::Graph(GraphError::UnknownReference { ref to, .. }) if to == "ghost"
        ));
    }

    #[test]
    fn test_ranks() {
        let set = vec![node("rg", &[]), node("vnet", &["rg"]), node("subnet", &["vnet"]), node("ip", &["rg"])];
        let ranks = DependencyGraph::build(&set).unwrap().ranks();
        assert_eq!(ranks["rg"], 0);
        assert_eq!(ranks["vnet"], 1);
        assert_eq!(ranks["ip"], 1);
        assert_eq!(ranks["subnet"], 2);
    }
}
