//! The DAG itself: construction, cycle rejection, topological order,
//! readiness and statistics.

use crate::{BuildNode, NodeStatus, Target, TargetId};
use mason_error::{BuildError, ErrorCode, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

/// Aggregate graph statistics.
///
/// `parallelism` is the size of the widest depth group, an upper bound
/// on the widest antichain, sufficient for tuning worker counts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphStats {
    pub total_nodes: usize,
    pub total_edges: usize,
    pub max_depth: usize,
    pub parallelism: usize,
}

/// Mapping of id to node, with edges as id lookups.
///
/// The graph is mutated only during construction; during execution it is
/// shared by reference and only node status (atomic) and the fingerprint
/// fields change.
#[derive(Debug, Default)]
pub struct BuildGraph {
    nodes: HashMap<TargetId, BuildNode>,
    /// Insertion order, for deterministic iteration and Kahn seeding.
    insertion_order: Vec<TargetId>,
}

impl BuildGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Construct the full graph from a target stream.
    ///
    /// All nodes are inserted before any edge so forward references
    /// resolve; a cycle or unresolved dependency fails the whole
    /// construction and no partial graph is observable.
    pub fn from_targets(targets: impl IntoIterator<Item = Target>) -> Result<Self> {
        let targets: Vec<Target> = targets.into_iter().collect();
        let mut graph = Self::new();
        for target in &targets {
            graph.add_target(target.clone())?;
        }
        for target in &targets {
            for dep in &target.deps {
                graph.add_edge(&target.id, dep)?;
            }
        }
        tracing::debug!(
            nodes = graph.nodes.len(),
            edges = graph.stats().total_edges,
            "build graph constructed"
        );
        Ok(graph)
    }

    /// Insert a node for `target`. Edges from `target.deps` are wired by
    /// the caller (or by [`BuildGraph::from_targets`]).
    pub fn add_target(&mut self, target: Target) -> Result<()> {
        if self.nodes.contains_key(&target.id) {
            return Err(BuildError::new(
                ErrorCode::GraphInvalid,
                format!("duplicate target id {}", target.id),
            ));
        }
        let id = target.id.clone();
        self.nodes.insert(id.clone(), BuildNode::new(Arc::new(target)));
        self.insertion_order.push(id);
        Ok(())
    }

    /// Add the dependency edge `from -> to` (`from` depends on `to`).
    ///
    /// Self-edges are rejected, duplicate edges are idempotent, and an
    /// edge that would close a cycle is rejected with the cycle path
    /// while leaving the graph untouched.
    pub fn add_edge(&mut self, from: &TargetId, to: &TargetId) -> Result<()> {
        if from == to {
            return Err(BuildError::new(
                ErrorCode::EdgeInvalid,
                format!("self-dependency on {}", from),
            ));
        }
        if !self.nodes.contains_key(from) {
            return Err(node_not_found(from));
        }
        if !self.nodes.contains_key(to) {
            return Err(BuildError::new(
                ErrorCode::MissingDependency,
                format!("{} depends on unknown target {}", from, to),
            ));
        }
        if self.nodes[from].deps().contains(to) {
            return Ok(());
        }
        // from -> to closes a cycle iff `from` is already reachable
        // along dependency edges starting at `to`.
        if let Some(path) = self.find_path(to, from) {
            let mut cycle = Vec::with_capacity(path.len() + 1);
            cycle.push(from.to_string());
            cycle.extend(path.iter().map(|id| id.to_string()));
            return Err(BuildError::cycle(cycle));
        }

        self.nodes.get_mut(from).expect("checked above").push_dep(to.clone());
        self.nodes.get_mut(to).expect("checked above").push_dependent(from.clone());
        self.recompute_depths();
        Ok(())
    }

    /// DFS for a dependency path `start -> ... -> goal`, inclusive.
    fn find_path(&self, start: &TargetId, goal: &TargetId) -> Option<Vec<TargetId>> {
        let mut stack = vec![vec![start.clone()]];
        let mut visited = HashSet::new();
        while let Some(path) = stack.pop() {
            let current = path.last().expect("paths are non-empty");
            if current == goal {
                return Some(path);
            }
            if !visited.insert(current.clone()) {
                continue;
            }
            if let Some(node) = self.nodes.get(current) {
                for dep in node.deps() {
                    let mut next = path.clone();
                    next.push(dep.clone());
                    stack.push(next);
                }
            }
        }
        None
    }

    pub fn node(&self, id: &TargetId) -> Option<&BuildNode> {
        self.nodes.get(id)
    }

    /// Like [`BuildGraph::node`] but failing with `NodeNotFound`.
    pub fn node_checked(&self, id: &TargetId) -> Result<&BuildNode> {
        self.nodes.get(id).ok_or_else(|| node_not_found(id))
    }

    pub fn nodes(&self) -> impl Iterator<Item = &BuildNode> {
        self.insertion_order.iter().filter_map(|id| self.nodes.get(id))
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Targets with no dependencies; these are ready first.
    pub fn roots(&self) -> Vec<&BuildNode> {
        self.nodes().filter(|n| n.deps().is_empty()).collect()
    }

    /// Kahn's algorithm, leaves first: for every edge `u -> v` (u depends
    /// on v), v appears before u.
    pub fn topological_order(&self) -> Result<Vec<TargetId>> {
        let mut remaining_deps: HashMap<&TargetId, usize> = self
            .nodes
            .values()
            .map(|n| (n.id(), n.deps().len()))
            .collect();
        let mut queue: VecDeque<&TargetId> = self
            .insertion_order
            .iter()
            .filter(|id| remaining_deps.get(id) == Some(&0))
            .collect();
        let mut order = Vec::with_capacity(self.nodes.len());

        while let Some(id) = queue.pop_front() {
            order.push(id.clone());
            for dependent in self.nodes[id].dependents() {
                let count = remaining_deps
                    .get_mut(dependent)
                    .expect("dependent edges resolve");
                *count -= 1;
                if *count == 0 {
                    queue.push_back(dependent);
                }
            }
        }

        if order.len() != self.nodes.len() {
            // Unreachable once add_edge rejects cycles, kept as a guard.
            return Err(BuildError::new(
                ErrorCode::GraphCycle,
                "graph contains a cycle",
            ));
        }
        Ok(order)
    }

    /// Nodes whose every dependency is `Success` or `Cached` and which
    /// have not started yet.
    pub fn ready_nodes(&self) -> Vec<&BuildNode> {
        self.nodes()
            .filter(|n| n.status() == NodeStatus::Pending)
            .filter(|n| {
                n.deps()
                    .iter()
                    .all(|dep| self.nodes[dep].status().satisfies_dependents())
            })
            .collect()
    }

    /// Mark a node failed and cascade `Skipped` to every live transitive
    /// dependent. Sibling branches are never touched. Returns the skipped
    /// ids so the caller can emit events.
    pub fn mark_failed(&self, id: &TargetId) -> Result<Vec<TargetId>> {
        let node = self.node_checked(id)?;
        node.transition(NodeStatus::Failed)?;

        let mut skipped = Vec::new();
        let mut queue: VecDeque<&TargetId> = node.dependents().iter().collect();
        let mut seen = HashSet::new();
        while let Some(dependent_id) = queue.pop_front() {
            if !seen.insert(dependent_id.clone()) {
                continue;
            }
            let dependent = &self.nodes[dependent_id];
            if !dependent.status().is_terminal() {
                dependent.transition(NodeStatus::Skipped)?;
                skipped.push(dependent_id.clone());
                queue.extend(dependent.dependents().iter());
            }
        }
        Ok(skipped)
    }

    /// The target plus its transitive dependency closure.
    pub fn reachable_from(&self, id: &TargetId) -> Result<HashSet<TargetId>> {
        self.node_checked(id)?;
        let mut reachable = HashSet::new();
        let mut queue = VecDeque::from([id.clone()]);
        while let Some(current) = queue.pop_front() {
            if reachable.insert(current.clone()) {
                queue.extend(self.nodes[&current].deps().iter().cloned());
            }
        }
        Ok(reachable)
    }

    pub fn stats(&self) -> GraphStats {
        let total_edges = self.nodes.values().map(|n| n.deps().len()).sum();
        let max_depth = self.nodes.values().map(BuildNode::depth).max().unwrap_or(0);

        let mut by_depth: HashMap<usize, usize> = HashMap::new();
        for node in self.nodes.values() {
            *by_depth.entry(node.depth()).or_default() += 1;
        }
        let parallelism = by_depth.values().copied().max().unwrap_or(0);

        GraphStats {
            total_nodes: self.nodes.len(),
            total_edges,
            max_depth,
            parallelism,
        }
    }

    /// Critical-path cost per node: the node's own estimate plus the most
    /// expensive chain of dependents above it. Used as a priority-score
    /// term so long chains start early.
    pub fn critical_path_costs(&self) -> Result<HashMap<TargetId, u64>> {
        let order = self.topological_order()?;
        let mut costs: HashMap<TargetId, u64> = HashMap::with_capacity(order.len());
        for id in order.iter().rev() {
            let node = &self.nodes[id];
            let downstream = node
                .dependents()
                .iter()
                .filter_map(|d| costs.get(d).copied())
                .max()
                .unwrap_or(0);
            costs.insert(id.clone(), node.cost_estimate_ms() + downstream);
        }
        Ok(costs)
    }

    /// Depth = 0 for no-dep targets, `1 + max(dep.depth)` otherwise.
    fn recompute_depths(&mut self) {
        let order = match self.topological_order() {
            Ok(order) => order,
            // Only reachable mid-construction if a cycle slipped past
            // add_edge; depths stay stale and the cycle error surfaces.
            Err(_) => return,
        };
        for id in order {
            let depth = {
                let node = &self.nodes[&id];
                node.deps()
                    .iter()
                    .map(|dep| self.nodes[dep].depth() + 1)
                    .max()
                    .unwrap_or(0)
            };
            self.nodes.get_mut(&id).expect("in order").set_depth(depth);
        }
    }
}

fn node_not_found(id: &TargetId) -> BuildError {
    BuildError::new(ErrorCode::NodeNotFound, format!("no node for target {}", id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TargetKind;

    fn target(id: &str, deps: &[&str]) -> Target {
        Target::new(id, TargetKind::Library, "rust")
            .with_deps(deps.iter().map(|d| TargetId::from(*d)).collect())
    }

    fn graph(specs: &[(&str, &[&str])]) -> BuildGraph {
        BuildGraph::from_targets(specs.iter().map(|(id, deps)| target(id, deps))).unwrap()
    }

    fn complete(graph: &BuildGraph, id: &str) {
        let node = graph.node(&id.into()).unwrap();
        node.transition(NodeStatus::Ready).unwrap();
        node.transition(NodeStatus::Running).unwrap();
        node.transition(NodeStatus::Success).unwrap();
    }

    #[test]
    fn test_single_node_graph() {
        let g = graph(&[("//lib:lib", &[])]);
        assert_eq!(g.topological_order().unwrap(), vec![TargetId::from("//lib:lib")]);
        assert_eq!(g.ready_nodes().len(), 1);
    }

    #[test]
    fn test_topological_order_respects_edges() {
        let g = graph(&[
            ("//app:app", &["//lib:lib"]),
            ("//lib:lib", &["//core:core"]),
            ("//core:core", &[]),
        ]);
        let order = g.topological_order().unwrap();
        let index = |id: &str| order.iter().position(|t| t.as_str() == id).unwrap();
        assert!(index("//core:core") < index("//lib:lib"));
        assert!(index("//lib:lib") < index("//app:app"));
    }

    #[test]
    fn test_diamond_order() {
        let g = graph(&[
            ("top", &["left", "right"]),
            ("left", &["bottom"]),
            ("right", &["bottom"]),
            ("bottom", &[]),
        ]);
        let order = g.topological_order().unwrap();
        let index = |id: &str| order.iter().position(|t| t.as_str() == id).unwrap();
        assert!(index("bottom") < index("left"));
        assert!(index("bottom") < index("right"));
        assert!(index("left") < index("top"));
        assert!(index("right") < index("top"));
    }

    #[test]
    fn test_cycle_rejected_and_graph_unchanged() {
        let mut g = graph(&[("a", &["b"]), ("b", &[])]);
        let err = g.add_edge(&"b".into(), &"a".into()).unwrap_err();
        assert_eq!(err.code(), ErrorCode::GraphCycle);
        assert_eq!(err.extras().cycle_path, vec!["b", "a", "b"]);
        // Graph still contains only a -> b.
        assert_eq!(g.node(&"b".into()).unwrap().deps().len(), 0);
        assert_eq!(g.node(&"a".into()).unwrap().deps(), &[TargetId::from("b")]);
    }

    #[test]
    fn test_from_targets_with_cycle_fails() {
        let result = BuildGraph::from_targets(vec![
            target("a", &["b"]),
            target("b", &["a"]),
        ]);
        assert_eq!(result.unwrap_err().code(), ErrorCode::GraphCycle);
    }

    #[test]
    fn test_self_edge_rejected() {
        let mut g = graph(&[("n", &[])]);
        let err = g.add_edge(&"n".into(), &"n".into()).unwrap_err();
        assert_eq!(err.code(), ErrorCode::EdgeInvalid);
    }

    #[test]
    fn test_redundant_edge_is_idempotent() {
        let mut g = graph(&[("a", &["b"]), ("b", &[])]);
        g.add_edge(&"a".into(), &"b".into()).unwrap();
        assert_eq!(g.stats().total_edges, 1);
    }

    #[test]
    fn test_missing_dependency() {
        let result = BuildGraph::from_targets(vec![target("a", &["ghost"])]);
        assert_eq!(result.unwrap_err().code(), ErrorCode::MissingDependency);
    }

    #[test]
    fn test_duplicate_target_rejected() {
        let result = BuildGraph::from_targets(vec![target("a", &[]), target("a", &[])]);
        assert_eq!(result.unwrap_err().code(), ErrorCode::GraphInvalid);
    }

    #[test]
    fn test_chain_depths() {
        let specs: Vec<(String, Vec<String>)> = (0..10)
            .map(|i| {
                let deps = if i == 0 { vec![] } else { vec![format!("n{}", i - 1)] };
                (format!("n{}", i), deps)
            })
            .collect();
        let g = BuildGraph::from_targets(specs.iter().map(|(id, deps)| {
            Target::new(id.as_str(), TargetKind::Library, "rust")
                .with_deps(deps.iter().map(|d| TargetId::from(d.as_str())).collect())
        }))
        .unwrap();

        for i in 0..10 {
            let id = TargetId::from(format!("n{}", i).as_str());
            assert_eq!(g.node(&id).unwrap().depth(), i);
        }
        assert_eq!(g.stats().max_depth, 9);
    }

    #[test]
    fn test_independent_targets_parallelism() {
        let g = BuildGraph::from_targets(
            (0..10).map(|i| Target::new(format!("t{}", i).as_str(), TargetKind::Library, "rust")),
        )
        .unwrap();
        assert_eq!(g.stats().parallelism, 10);
    }

    #[test]
    fn test_readiness_tracks_completion() {
        let g = graph(&[("app", &["lib"]), ("lib", &[])]);
        let ready: Vec<&str> = g.ready_nodes().iter().map(|n| n.id().as_str()).collect();
        assert_eq!(ready, vec!["lib"]);

        complete(&g, "lib");
        let ready: Vec<&str> = g.ready_nodes().iter().map(|n| n.id().as_str()).collect();
        assert_eq!(ready, vec!["app"]);
    }

    #[test]
    fn test_cached_dep_unblocks_dependents() {
        let g = graph(&[("app", &["lib"]), ("lib", &[])]);
        let lib = g.node(&"lib".into()).unwrap();
        lib.transition(NodeStatus::Analyzing).unwrap();
        lib.transition(NodeStatus::Cached).unwrap();
        let ready: Vec<&str> = g.ready_nodes().iter().map(|n| n.id().as_str()).collect();
        assert_eq!(ready, vec!["app"]);
    }

    #[test]
    fn test_failure_skips_dependents_not_siblings() {
        let g = graph(&[
            ("app1", &["lib"]),
            ("app2", &[]),
            ("lib", &[]),
        ]);
        let lib = g.node(&"lib".into()).unwrap();
        lib.transition(NodeStatus::Ready).unwrap();
        lib.transition(NodeStatus::Running).unwrap();

        let skipped = g.mark_failed(&"lib".into()).unwrap();
        assert_eq!(skipped, vec![TargetId::from("app1")]);
        assert_eq!(g.node(&"app1".into()).unwrap().status(), NodeStatus::Skipped);
        assert_eq!(g.node(&"app2".into()).unwrap().status(), NodeStatus::Pending);
    }

    #[test]
    fn test_failure_cascade_is_transitive() {
        let g = graph(&[("c", &["b"]), ("b", &["a"]), ("a", &[])]);
        let a = g.node(&"a".into()).unwrap();
        a.transition(NodeStatus::Ready).unwrap();
        a.transition(NodeStatus::Running).unwrap();
        let mut skipped = g.mark_failed(&"a".into()).unwrap();
        skipped.sort();
        assert_eq!(skipped, vec![TargetId::from("b"), TargetId::from("c")]);
    }

    #[test]
    fn test_reachable_from() {
        let g = graph(&[
            ("app", &["lib"]),
            ("lib", &["core"]),
            ("core", &[]),
            ("other", &[]),
        ]);
        let reachable = g.reachable_from(&"lib".into()).unwrap();
        assert!(reachable.contains(&TargetId::from("lib")));
        assert!(reachable.contains(&TargetId::from("core")));
        assert!(!reachable.contains(&TargetId::from("app")));
        assert!(!reachable.contains(&TargetId::from("other")));
    }

    #[test]
    fn test_critical_path_costs() {
        let g = graph(&[("app", &["lib"]), ("lib", &[]), ("leaf", &[])]);
        g.node(&"app".into()).unwrap().record_duration_ms(100);
        g.node(&"lib".into()).unwrap().record_duration_ms(50);

        let costs = g.critical_path_costs().unwrap();
        // lib unlocks app, so its critical path includes app's cost.
        assert_eq!(costs[&TargetId::from("lib")], 150);
        assert_eq!(costs[&TargetId::from("app")], 100);
        assert_eq!(costs[&TargetId::from("leaf")], 1);
    }
}
