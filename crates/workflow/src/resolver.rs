//! Dependency resolution over the adapter graph
//!
//! Kahn's algorithm with an ordered ready set: among adapters whose
//! dependencies are all placed, the smallest id goes next. The output is
//! therefore a pure function of the adapter set, independent of input order.

use crate::adapter::Adapter;
use crate::error::{Error, Result};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

/// A topological order of adapters plus their transitive ancestors
#[derive(Debug, Clone)]
pub struct ResolvedOrder {
    order: Vec<Arc<Adapter>>,
    ancestors: HashMap<String, BTreeSet<String>>,
}

impl ResolvedOrder {
    /// Adapters, dependencies first
    pub fn adapters(&self) -> &[Arc<Adapter>] {
        &self.order
    }

    /// Ids in resolved order
    pub fn ids(&self) -> Vec<&str> {
        self.order.iter().map(|a| a.id.as_str()).collect()
    }

    /// Every adapter `id` depends on, directly or transitively
    pub fn ancestors(&self, id: &str) -> Option<&BTreeSet<String>> {
        self.ancestors.get(id)
    }

    /// Whether `ancestor` is a (transitive) dependency of `of`
    pub fn is_ancestor(&self, ancestor: &str, of: &str) -> bool {
        self.ancestors
            .get(of)
            .is_some_and(|set| set.contains(ancestor))
    }

    /// Position of `id` in the order
    pub fn position(&self, id: &str) -> Option<usize> {
        self.order.iter().position(|a| a.id == id)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

/// Order `adapters` so that every adapter comes after its dependencies
///
/// Fails without a partial result when a dependency is missing, a version
/// pin does not match, or the graph has a cycle.
pub fn resolve(adapters: &[Arc<Adapter>]) -> Result<ResolvedOrder> {
    let by_id: BTreeMap<&str, &Arc<Adapter>> =
        adapters.iter().map(|a| (a.id.as_str(), a)).collect();

    for adapter in adapters {
        for dep in &adapter.dependencies {
            let Some(target) = by_id.get(dep.id.as_str()) else {
                return Err(Error::MissingDependency {
                    adapter: adapter.id.clone(),
                    dependency: dep.id.clone(),
                });
            };
            if let Some(pinned) = &dep.version
                && *pinned != target.version
            {
                return Err(Error::config(
                    adapter.id.clone(),
                    "dependencies",
                    format!(
                        "requires {}@{pinned} but {} is at version {}",
                        dep.id, dep.id, target.version
                    ),
                ));
            }
        }
    }

    let mut in_degree: BTreeMap<&str, usize> = BTreeMap::new();
    let mut dependents: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    for adapter in adapters {
        in_degree.insert(&adapter.id, adapter.dependencies.len());
        for dep in adapter.dependency_ids() {
            dependents.entry(dep).or_default().push(&adapter.id);
        }
    }

    let mut ready: BTreeSet<&str> = in_degree
        .iter()
        .filter(|(_, degree)| **degree == 0)
        .map(|(id, _)| *id)
        .collect();
    let mut order: Vec<Arc<Adapter>> = Vec::with_capacity(adapters.len());

    while let Some(id) = ready.pop_first() {
        if let Some(adapter) = by_id.get(id) {
            order.push(Arc::clone(adapter));
        }
        for dependent in dependents.get(id).into_iter().flatten() {
            if let Some(degree) = in_degree.get_mut(dependent) {
                *degree -= 1;
                if *degree == 0 {
                    ready.insert(dependent);
                }
            }
        }
    }

    if order.len() < by_id.len() {
        let placed: BTreeSet<&str> = order.iter().map(|a| a.id.as_str()).collect();
        let remaining: BTreeSet<&str> = by_id
            .keys()
            .copied()
            .filter(|id| !placed.contains(id))
            .collect();
        return Err(Error::Cycle {
            adapters: find_cycle(&by_id, &remaining),
        });
    }

    let mut ancestors: HashMap<String, BTreeSet<String>> = HashMap::new();
    for adapter in &order {
        let mut set = BTreeSet::new();
        for dep in adapter.dependency_ids() {
            set.insert(dep.to_string());
            if let Some(inherited) = ancestors.get(dep) {
                set.extend(inherited.iter().cloned());
            }
        }
        ancestors.insert(adapter.id.clone(), set);
    }

    log::debug!(
        "Resolved order: {}",
        order
            .iter()
            .map(|a| a.id.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    );

    Ok(ResolvedOrder { order, ancestors })
}

/// Extract one concrete cycle from the nodes Kahn's algorithm left behind
///
/// Every remaining node has at least one remaining dependency, so following
/// the smallest such dependency must eventually revisit a node.
fn find_cycle(by_id: &BTreeMap<&str, &Arc<Adapter>>, remaining: &BTreeSet<&str>) -> Vec<String> {
    let Some(start) = remaining.first().copied() else {
        return Vec::new();
    };

    let mut path: Vec<&str> = Vec::new();
    let mut current = start;
    while !path.contains(&current) {
        path.push(current);
        let next = by_id.get(current).and_then(|adapter| {
            adapter
                .dependency_ids()
                .filter(|dep| remaining.contains(dep))
                .min()
        });
        match next {
            Some(next) => current = next,
            None => break,
        }
    }

    let from = path.iter().position(|id| *id == current).unwrap_or(0);
    let mut cycle: Vec<String> = path[from..].iter().map(|id| id.to_string()).collect();
    // Walking dependencies yields the cycle backwards; report it in
    // dependency-to-dependent order, starting from the smallest id.
    cycle.reverse();
    if let Some(min_pos) = cycle
        .iter()
        .enumerate()
        .min_by(|a, b| a.1.cmp(b.1))
        .map(|(i, _)| i)
    {
        cycle.rotate_left(min_pos);
    }
    cycle
}
