// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Entry dependency graph

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use crate::store::CacheKey;

/// Edges from an entry to the keys it depends on, with a reverse index.
///
/// Edges belong to the dependent entry: dropping an entry drops its
/// outgoing edges, while edges pointing at it stay until their owners go.
#[derive(Debug, Default)]
pub struct DependencyGraph {
    /// entry -> keys it depends on
    dependencies: HashMap<CacheKey, BTreeSet<CacheKey>>,
    /// key -> entries depending on it
    dependents: HashMap<CacheKey, BTreeSet<CacheKey>>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `entry` depends on each of `dependencies`; self edges are ignored
    pub fn add(&mut self, entry: &CacheKey, dependencies: impl IntoIterator<Item = CacheKey>) {
        for dependency in dependencies {
            if &dependency == entry {
                continue;
            }
            self.dependents
                .entry(dependency.clone())
                .or_default()
                .insert(entry.clone());
            self.dependencies
                .entry(entry.clone())
                .or_default()
                .insert(dependency);
        }
    }

    pub fn remove(&mut self, entry: &CacheKey, dependency: &CacheKey) -> bool {
        let removed = match self.dependencies.get_mut(entry) {
            Some(deps) => {
                let removed = deps.remove(dependency);
                if deps.is_empty() {
                    self.dependencies.remove(entry);
                }
                removed
            }
            None => false,
        };
        if removed {
            self.unlink_dependent(dependency, entry);
        }
        removed
    }

    /// Replace every outgoing edge of `entry`
    pub fn replace(&mut self, entry: &CacheKey, dependencies: impl IntoIterator<Item = CacheKey>) {
        self.remove_entry(entry);
        self.add(entry, dependencies);
    }

    /// Drop the outgoing edges owned by `entry`
    pub fn remove_entry(&mut self, entry: &CacheKey) -> usize {
        let Some(deps) = self.dependencies.remove(entry) else {
            return 0;
        };
        for dependency in &deps {
            self.unlink_dependent(dependency, entry);
        }
        deps.len()
    }

    pub fn dependencies_of(&self, entry: &CacheKey) -> BTreeSet<CacheKey> {
        self.dependencies.get(entry).cloned().unwrap_or_default()
    }

    pub fn dependents_of(&self, key: &CacheKey) -> BTreeSet<CacheKey> {
        self.dependents.get(key).cloned().unwrap_or_default()
    }

    pub fn edge_count(&self) -> usize {
        self.dependencies.values().map(BTreeSet::len).sum()
    }

    pub fn clear(&mut self) {
        self.dependencies.clear();
        self.dependents.clear();
    }

    /// Transitive dependents of `roots`, breadth first, excluding the roots.
    ///
    /// Each key is visited at most once, so cycles terminate. Keys in `stop`
    /// are neither returned nor traversed through. Returns the keys and the
    /// deepest level reached.
    pub fn cascade(
        &self,
        roots: &BTreeSet<CacheKey>,
        stop: &HashSet<CacheKey>,
        max_depth: usize,
    ) -> (Vec<CacheKey>, usize) {
        let mut visited: HashSet<&CacheKey> = roots.iter().collect();
        let mut queue: VecDeque<(&CacheKey, usize)> = roots.iter().map(|root| (root, 0)).collect();
        let mut reached = Vec::new();
        let mut deepest = 0;

        while let Some((key, depth)) = queue.pop_front() {
            if depth >= max_depth {
                continue;
            }
            let Some(dependents) = self.dependents.get(key) else {
                continue;
            };
            for dependent in dependents {
                if stop.contains(dependent) || !visited.insert(dependent) {
                    continue;
                }
                deepest = deepest.max(depth + 1);
                reached.push(dependent.clone());
                queue.push_back((dependent, depth + 1));
            }
        }

        (reached, deepest)
    }

    fn unlink_dependent(&mut self, dependency: &CacheKey, entry: &CacheKey) {
        if let Some(dependents) = self.dependents.get_mut(dependency) {
            dependents.remove(entry);
            if dependents.is_empty() {
                self.dependents.remove(dependency);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(k: &str) -> CacheKey {
        CacheKey::new("dashboard", k)
    }

    fn roots(keys: &[&str]) -> BTreeSet<CacheKey> {
        keys.iter().map(|k| key(k)).collect()
    }

    #[test]
    fn test_forward_and_reverse_indexes() {
        let mut graph = DependencyGraph::new();
        graph.add(&key("widget"), [key("stats"), key("users")]);

        assert_eq!(graph.dependencies_of(&key("widget")), roots(&["stats", "users"]));
        assert_eq!(graph.dependents_of(&key("stats")), roots(&["widget"]));
        assert_eq!(graph.edge_count(), 2);

        assert!(graph.remove(&key("widget"), &key("stats")));
        assert!(graph.dependents_of(&key("stats")).is_empty());
        assert_eq!(graph.edge_count(), 1);
    }

    #[test]
    fn test_remove_entry_keeps_incoming_edges() {
        let mut graph = DependencyGraph::new();
        graph.add(&key("b"), [key("a")]);
        graph.add(&key("c"), [key("b")]);

        assert_eq!(graph.remove_entry(&key("b")), 1);
        assert!(graph.dependents_of(&key("a")).is_empty());
        assert_eq!(graph.dependents_of(&key("b")), roots(&["c"]));
    }

    #[test]
    fn test_cascade_survives_cycles() {
        let mut graph = DependencyGraph::new();
        graph.add(&key("b"), [key("a")]);
        graph.add(&key("c"), [key("b")]);
        graph.add(&key("a"), [key("c")]);

        let (reached, depth) = graph.cascade(&roots(&["a"]), &HashSet::new(), 16);
        assert_eq!(reached, vec![key("b"), key("c")]);
        assert_eq!(depth, 2);
    }

    #[test]
    fn test_cascade_respects_depth_and_stop_set() {
        let mut graph = DependencyGraph::new();
        graph.add(&key("b"), [key("a")]);
        graph.add(&key("c"), [key("b")]);
        graph.add(&key("d"), [key("a")]);

        let (reached, _) = graph.cascade(&roots(&["a"]), &HashSet::new(), 1);
        assert_eq!(reached, vec![key("b"), key("d")]);

        let stop: HashSet<CacheKey> = [key("b")].into_iter().collect();
        let (reached, _) = graph.cascade(&roots(&["a"]), &stop, 16);
        assert_eq!(reached, vec![key("d")]);
    }

    #[test]
    fn test_self_edges_ignored() {
        let mut graph = DependencyGraph::new();
        graph.add(&key("a"), [key("a")]);
        assert_eq!(graph.edge_count(), 0);
    }
}
