//! Source dependency graph for incremental remote builds.
//!
//! The graph stores the declared relation `A depends on B` for every source
//! and keeps the inverse relation in sync, so that a change to `B` can be
//! propagated to everything that has to be rebuilt after it.
//!
//! # Features
//!
//! - Arena of nodes indexed by source identity
//! - Declared dependency order is preserved
//! - Cycle-tolerant forward closure (visited-set guarded BFS)
//! - Deterministic build ordering using Kahn's algorithm with a
//!   caller-supplied precedence rank and a discovery-order fallback for cycles
//!
//! # Example
//!
//! ```
//! use fernbau_graph::DependencyGraph;
//!
//! let mut graph = DependencyGraph::<String>::new();
//!
//! // b.c depends on a.c
//! graph.add_dependency("b.c".to_string(), "a.c".to_string()).unwrap();
//!
//! // Changing a.c affects b.c as well
//! let affected = graph.forward_closure([&"a.c".to_string()]);
//! assert_eq!(affected, vec!["a.c".to_string(), "b.c".to_string()]);
//!
//! // a.c has to be built before b.c
//! let order = graph.order(&affected, |_| 0);
//! assert_eq!(order.targets, vec!["a.c".to_string(), "b.c".to_string()]);
//! ```

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};
use std::fmt;
use std::hash::Hash;

/// Node identifier in the graph arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Node({})", self.0)
    }
}

/// Error types for graph mutations.
#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    /// A source was declared as its own dependency
    #[error("{0} cannot depend on itself")]
    SelfDependency(String),
}

/// Result type for graph operations.
pub type GraphResult<T> = Result<T, GraphError>;

/// Result of ordering a set of build targets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildOrder<K> {
    /// Targets in build order (dependencies before dependents)
    pub targets: Vec<K>,

    /// Cycles that had to be broken, each listed in discovery order
    pub cycles: Vec<Vec<K>>,
}

impl<K> BuildOrder<K> {
    /// Whether the order had to fall back to discovery order anywhere.
    #[must_use]
    pub fn has_cycles(&self) -> bool {
        !self.cycles.is_empty()
    }
}

/// Dependency graph over source identities.
///
/// Nodes live in an arena and are addressed by [`NodeId`]; the identity map
/// translates keys such as relative source paths into ids. For every node
/// the graph keeps:
/// - `depends_on`: the declared dependencies, in declaration order
/// - `dependents`: the inverse relation, in edge insertion order
#[derive(Debug, Clone)]
pub struct DependencyGraph<K> {
    keys: Vec<K>,
    index: HashMap<K, NodeId>,
    depends_on: Vec<Vec<NodeId>>,
    dependents: Vec<Vec<NodeId>>,
}

impl<K> Default for DependencyGraph<K> {
    fn default() -> Self {
        Self {
            keys: Vec::new(),
            index: HashMap::new(),
            depends_on: Vec::new(),
            dependents: Vec::new(),
        }
    }
}

impl<K> DependencyGraph<K>
where
    K: Clone + Eq + Hash + fmt::Display,
{
    /// Create a new empty graph.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a graph from a declared `source -> [dependencies]` relation.
    ///
    /// Declaration order of each dependency list is kept. Duplicate entries
    /// and self references in raw input are dropped.
    pub fn from_declared<I, D>(declared: I) -> Self
    where
        I: IntoIterator<Item = (K, D)>,
        D: IntoIterator<Item = K>,
    {
        let mut graph = Self::new();
        for (source, dependencies) in declared {
            let source_id = graph.intern(source);
            for dependency in dependencies {
                let dependency_id = graph.intern(dependency);
                if dependency_id != source_id {
                    let _ = graph.link(source_id, dependency_id);
                }
            }
        }
        graph
    }

    fn intern(&mut self, key: K) -> NodeId {
        if let Some(&id) = self.index.get(&key) {
            return id;
        }

        let id = NodeId(self.keys.len());
        self.keys.push(key.clone());
        self.depends_on.push(Vec::new());
        self.dependents.push(Vec::new());
        let _ = self.index.insert(key, id);
        id
    }

    fn link(&mut self, source: NodeId, dependency: NodeId) -> bool {
        if self.depends_on[source.0].contains(&dependency) {
            return false;
        }
        self.depends_on[source.0].push(dependency);
        self.dependents[dependency.0].push(source);
        true
    }

    fn unlink(&mut self, source: NodeId, dependency: NodeId) -> bool {
        let Some(pos) = self.depends_on[source.0]
            .iter()
            .position(|&id| id == dependency)
        else {
            return false;
        };
        let _ = self.depends_on[source.0].remove(pos);
        self.dependents[dependency.0].retain(|&id| id != source);
        true
    }

    /// Look up the node id of a key.
    #[must_use]
    pub fn node_id(&self, key: &K) -> Option<NodeId> {
        self.index.get(key).copied()
    }

    /// Get the key stored for a node id.
    #[must_use]
    pub fn key(&self, id: NodeId) -> Option<&K> {
        self.keys.get(id.0)
    }

    /// Get the number of nodes in the graph.
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.keys.len()
    }

    /// Get the number of `depends on` edges in the graph.
    #[must_use]
    pub fn edge_count(&self) -> usize {
        self.depends_on.iter().map(Vec::len).sum()
    }

    /// Record that `source` depends on `dependency`.
    ///
    /// Returns `Ok(false)` if the edge already existed.
    ///
    /// # Errors
    ///
    /// Returns `GraphError::SelfDependency` if both keys are equal.
    pub fn add_dependency(&mut self, source: K, dependency: K) -> GraphResult<bool> {
        if source == dependency {
            return Err(GraphError::SelfDependency(source.to_string()));
        }
        let source_id = self.intern(source);
        let dependency_id = self.intern(dependency);
        Ok(self.link(source_id, dependency_id))
    }

    /// Record that `source` is a dependency of `dependent`.
    ///
    /// This is the reverse-direction insertion: the edge is stored in the
    /// dependency list of `dependent`, not of `source`.
    ///
    /// # Errors
    ///
    /// Returns `GraphError::SelfDependency` if both keys are equal.
    pub fn add_dependent(&mut self, source: K, dependent: K) -> GraphResult<bool> {
        self.add_dependency(dependent, source)
    }

    /// Remove the edge `source depends on dependency`.
    ///
    /// Returns `false` if there was no such edge.
    pub fn remove_dependency(&mut self, source: &K, dependency: &K) -> bool {
        match (self.node_id(source), self.node_id(dependency)) {
            (Some(source_id), Some(dependency_id)) => self.unlink(source_id, dependency_id),
            _ => false,
        }
    }

    /// Remove the edge `dependent depends on source`.
    ///
    /// Returns `false` if there was no such edge.
    pub fn remove_dependent(&mut self, source: &K, dependent: &K) -> bool {
        self.remove_dependency(dependent, source)
    }

    /// Direct dependencies of a source, in declaration order.
    #[must_use]
    pub fn dependencies(&self, key: &K) -> Vec<&K> {
        self.node_id(key)
            .map(|id| self.depends_on[id.0].iter().map(|d| &self.keys[d.0]).collect())
            .unwrap_or_default()
    }

    /// Direct dependents of a source, in edge insertion order.
    #[must_use]
    pub fn dependents(&self, key: &K) -> Vec<&K> {
        self.node_id(key)
            .map(|id| self.dependents[id.0].iter().map(|d| &self.keys[d.0]).collect())
            .unwrap_or_default()
    }

    /// The declared relation, one entry per source with at least one
    /// dependency, in node insertion order.
    #[must_use]
    pub fn declared(&self) -> Vec<(&K, Vec<&K>)> {
        self.keys
            .iter()
            .enumerate()
            .filter(|(i, _)| !self.depends_on[*i].is_empty())
            .map(|(i, key)| {
                let deps = self.depends_on[i].iter().map(|d| &self.keys[d.0]).collect();
                (key, deps)
            })
            .collect()
    }

    /// Every source that depends, directly or transitively, on a seed.
    ///
    /// The result starts with the seeds in the given order (duplicates
    /// removed) followed by the dependents in breadth-first discovery order.
    /// Each node is visited at most once, so cycles terminate. Seeds that are
    /// unknown to the graph are kept; they have no dependents.
    pub fn forward_closure<'a, I>(&self, seeds: I) -> Vec<K>
    where
        I: IntoIterator<Item = &'a K>,
        K: 'a,
    {
        let mut closure: Vec<K> = Vec::new();
        let mut seen: HashSet<K> = HashSet::new();
        let mut visited: HashSet<NodeId> = HashSet::new();
        let mut queue: VecDeque<NodeId> = VecDeque::new();

        for seed in seeds {
            if !seen.insert(seed.clone()) {
                continue;
            }
            closure.push(seed.clone());
            if let Some(id) = self.node_id(seed) {
                let _ = visited.insert(id);
                queue.push_back(id);
            }
        }

        while let Some(current) = queue.pop_front() {
            for &dependent in &self.dependents[current.0] {
                if visited.insert(dependent) {
                    let key = &self.keys[dependent.0];
                    if seen.insert(key.clone()) {
                        closure.push(key.clone());
                    }
                    queue.push_back(dependent);
                }
            }
        }

        closure
    }

    /// Order `targets` so that no target precedes one of its dependencies.
    ///
    /// The dependency relation is restricted to the target set. Among targets
    /// that are ready at the same time, the one with the lowest `rank` wins,
    /// then the one that appears first in `targets` (discovery order).
    ///
    /// When only cyclic targets remain, the cycle member with the lowest
    /// discovery index is emitted next and the cycle is reported in
    /// [`BuildOrder::cycles`]. Self references are ignored.
    pub fn order<F>(&self, targets: &[K], rank: F) -> BuildOrder<K>
    where
        F: Fn(&K) -> usize,
    {
        // Local indices follow discovery order, duplicates removed.
        let mut local: HashMap<&K, usize> = HashMap::new();
        let mut members: Vec<&K> = Vec::new();
        for target in targets {
            if !local.contains_key(target) {
                let _ = local.insert(target, members.len());
                members.push(target);
            }
        }

        let count = members.len();
        let mut deps: Vec<Vec<usize>> = vec![Vec::new(); count];
        let mut users: Vec<Vec<usize>> = vec![Vec::new(); count];
        for (i, member) in members.iter().enumerate() {
            for dependency in self.dependencies(member) {
                if let Some(&j) = local.get(dependency) {
                    if i != j && !deps[i].contains(&j) {
                        deps[i].push(j);
                        users[j].push(i);
                    }
                }
            }
        }

        let ranks: Vec<usize> = members.iter().map(|&m| rank(m)).collect();
        let mut pending: Vec<usize> = deps.iter().map(Vec::len).collect();
        let mut emitted = vec![false; count];
        let mut ready: BinaryHeap<Reverse<(usize, usize)>> = (0..count)
            .filter(|&i| pending[i] == 0)
            .map(|i| Reverse((ranks[i], i)))
            .collect();

        let mut order = Vec::with_capacity(count);
        let mut cycles = Vec::new();

        while order.len() < count {
            let next = if let Some(Reverse((_, i))) = ready.pop() {
                if emitted[i] {
                    continue;
                }
                i
            } else {
                let (chosen, cycle) = break_cycle(&deps, &emitted);
                cycles.push(cycle.into_iter().map(|i| K::clone(members[i])).collect());
                chosen
            };

            emitted[next] = true;
            order.push(K::clone(members[next]));

            for &user in &users[next] {
                if !emitted[user] {
                    pending[user] = pending[user].saturating_sub(1);
                    if pending[user] == 0 {
                        ready.push(Reverse((ranks[user], user)));
                    }
                }
            }
        }

        BuildOrder {
            targets: order,
            cycles,
        }
    }

    /// Find all cycles in the declared relation.
    ///
    /// Returns each cycle as the path of keys along `depends on` edges.
    #[must_use]
    pub fn find_cycles(&self) -> Vec<Vec<K>> {
        let mut cycles = Vec::new();
        let mut visited = HashSet::new();
        let mut on_stack = HashSet::new();
        let mut path = Vec::new();

        for start in 0..self.keys.len() {
            if visited.contains(&start) {
                continue;
            }

            // Iterative DFS: (node, next edge index)
            let mut stack: Vec<(usize, usize)> = vec![(start, 0)];
            let _ = visited.insert(start);
            let _ = on_stack.insert(start);
            path.push(start);

            while let Some(frame) = stack.last_mut() {
                let (node, edge) = *frame;
                if let Some(next) = self.depends_on[node].get(edge) {
                    frame.1 += 1;
                    let next = next.0;
                    if on_stack.contains(&next) {
                        if let Some(pos) = path.iter().position(|&id| id == next) {
                            cycles.push(path[pos..].iter().map(|&i| self.keys[i].clone()).collect());
                        }
                    } else if visited.insert(next) {
                        let _ = on_stack.insert(next);
                        path.push(next);
                        stack.push((next, 0));
                    }
                } else {
                    let _ = stack.pop();
                    let _ = path.pop();
                    let _ = on_stack.remove(&node);
                }
            }
        }

        cycles
    }
}

/// Pick the next node when no target is ready.
///
/// Returns the lowest-index remaining node that lies on a cycle, together
/// with the members of its strongly connected component (ascending).
fn break_cycle(deps: &[Vec<usize>], emitted: &[bool]) -> (usize, Vec<usize>) {
    let remaining: Vec<usize> = (0..deps.len()).filter(|&i| !emitted[i]).collect();

    for &candidate in &remaining {
        if can_reach(deps, emitted, candidate, candidate) {
            let component = remaining
                .iter()
                .copied()
                .filter(|&other| {
                    other == candidate
                        || (can_reach(deps, emitted, candidate, other)
                            && can_reach(deps, emitted, other, candidate))
                })
                .collect();
            return (candidate, component);
        }
    }

    // Every remaining node waits on another remaining node, so a cycle
    // always exists; this only guards against inconsistent counters.
    let first = remaining.first().copied().unwrap_or(0);
    (first, vec![first])
}

/// Check if there's a path of at least one edge from `start` to `end`
/// through nodes that have not been emitted yet.
fn can_reach(deps: &[Vec<usize>], emitted: &[bool], start: usize, end: usize) -> bool {
    let mut visited = HashSet::new();
    let mut queue: VecDeque<usize> = deps[start].iter().copied().filter(|&n| !emitted[n]).collect();

    while let Some(current) = queue.pop_front() {
        if current == end {
            return true;
        }
        if !visited.insert(current) {
            continue;
        }
        for &next in &deps[current] {
            if !emitted[next] && !visited.contains(&next) {
                queue.push_back(next);
            }
        }
    }

    false
}
