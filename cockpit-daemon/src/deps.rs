use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use crate::config::ServiceDefinition;
use crate::errors::{DaemonError, Result};

/// Directed acyclic graph over service ids.
///
/// Built once from the declared `depends_on` lists and read-only afterwards.
/// Start order lists every service after all of its dependencies; stop order
/// is its exact reverse. Ties are broken by service id so the orders are
/// deterministic.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    /// service -> services it depends on
    dependencies: BTreeMap<String, Vec<String>>,
    /// service -> services that depend on it
    dependents: BTreeMap<String, Vec<String>>,
    start_order: Vec<String>,
    stop_order: Vec<String>,
}

impl DependencyGraph {
    /// Build the graph from service definitions
    pub fn build(services: &BTreeMap<String, ServiceDefinition>) -> Result<Self> {
        Self::from_dependencies(
            services
                .iter()
                .map(|(id, def)| (id.clone(), def.depends_on.clone()))
                .collect(),
        )
    }

    /// Build the graph from a `service -> dependencies` map
    pub fn from_dependencies(dependencies: BTreeMap<String, Vec<String>>) -> Result<Self> {
        // Validate all dependencies exist
        for (name, deps) in &dependencies {
            for dep in deps {
                if !dependencies.contains_key(dep) {
                    return Err(DaemonError::UnknownDependency {
                        service: name.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
        }

        let mut dependents: BTreeMap<String, Vec<String>> = dependencies
            .keys()
            .map(|name| (name.clone(), Vec::new()))
            .collect();
        for (name, deps) in &dependencies {
            for dep in dedup(deps) {
                if let Some(list) = dependents.get_mut(dep) {
                    list.push(name.clone());
                }
            }
        }

        let start_order = topological_sort(&dependencies, &dependents)?;
        let mut stop_order = start_order.clone();
        stop_order.reverse();

        Ok(Self {
            dependencies,
            dependents,
            start_order,
            stop_order,
        })
    }

    /// Every service after all of its dependencies
    pub fn start_order(&self) -> &[String] {
        &self.start_order
    }

    /// Exact reverse of the start order
    pub fn stop_order(&self) -> &[String] {
        &self.stop_order
    }

    pub fn contains(&self, service: &str) -> bool {
        self.dependencies.contains_key(service)
    }

    /// Direct dependencies of a service
    pub fn dependencies(&self, service: &str) -> &[String] {
        self.dependencies
            .get(service)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Direct dependents of a service
    pub fn dependents(&self, service: &str) -> &[String] {
        self.dependents
            .get(service)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// The service and all its transitive dependencies, in start order (service last)
    pub fn dependencies_of(&self, service: &str) -> Vec<String> {
        let needed = collect_reachable(service, &self.dependencies);
        self.start_order
            .iter()
            .filter(|s| needed.contains(s.as_str()))
            .cloned()
            .collect()
    }

    /// The service and all its transitive dependents, in stop order (service last)
    pub fn dependents_of(&self, service: &str) -> Vec<String> {
        let needed = collect_reachable(service, &self.dependents);
        self.stop_order
            .iter()
            .filter(|s| needed.contains(s.as_str()))
            .cloned()
            .collect()
    }

    /// Whether `service` depends on `other`, directly or transitively
    pub fn depends_on(&self, service: &str, other: &str) -> bool {
        service != other && collect_reachable(service, &self.dependencies).contains(other)
    }
}

fn dedup(items: &[String]) -> impl Iterator<Item = &String> {
    let mut seen = HashSet::new();
    items.iter().filter(move |item| seen.insert(item.as_str()))
}

fn collect_reachable<'a>(
    start: &'a str,
    edges: &'a BTreeMap<String, Vec<String>>,
) -> HashSet<&'a str> {
    let mut seen = HashSet::new();
    let mut stack = vec![start];
    while let Some(node) = stack.pop() {
        if !seen.insert(node) {
            continue;
        }
        if let Some(next) = edges.get(node) {
            stack.extend(next.iter().map(String::as_str));
        }
    }
    seen
}

/// Perform topological sort using Kahn's algorithm
fn topological_sort(
    dependencies: &BTreeMap<String, Vec<String>>,
    dependents: &BTreeMap<String, Vec<String>>,
) -> Result<Vec<String>> {
    let mut in_degree: HashMap<&str, usize> = dependencies
        .iter()
        .map(|(name, deps)| (name.as_str(), dedup(deps).count()))
        .collect();

    // Sorted ready set for deterministic ordering
    let mut ready: BTreeSet<&str> = in_degree
        .iter()
        .filter(|&(_, deg)| *deg == 0)
        .map(|(name, _)| *name)
        .collect();

    let mut result = Vec::with_capacity(dependencies.len());

    while let Some(node) = ready.pop_first() {
        result.push(node.to_string());

        for dependent in dependents.get(node).into_iter().flatten() {
            let deg = in_degree.get_mut(dependent.as_str()).ok_or_else(|| {
                DaemonError::Internal(format!("unknown service '{}' in dependency graph", dependent))
            })?;
            *deg -= 1;
            if *deg == 0 {
                ready.insert(dependent.as_str());
            }
        }
    }

    if result.len() != dependencies.len() {
        let placed: HashSet<&str> = result.iter().map(String::as_str).collect();
        let remaining: BTreeSet<&str> = dependencies
            .keys()
            .map(String::as_str)
            .filter(|name| !placed.contains(name))
            .collect();
        return Err(DaemonError::CyclicDependency {
            cycle: find_cycle(&remaining, dependencies),
        });
    }

    Ok(result)
}

/// Extract one concrete cycle (`a -> b -> a`) from the nodes Kahn's algorithm could not place.
fn find_cycle(remaining: &BTreeSet<&str>, dependencies: &BTreeMap<String, Vec<String>>) -> Vec<String> {
    // Every remaining node has at least one remaining dependency, so walking
    // dependency edges inside the remaining set must eventually revisit a node.
    let Some(&start) = remaining.iter().next() else {
        return Vec::new();
    };

    let mut path: Vec<&str> = Vec::new();
    let mut position: HashMap<&str, usize> = HashMap::new();
    let mut node = start;

    loop {
        if let Some(&idx) = position.get(node) {
            let mut cycle: Vec<String> = path[idx..].iter().map(|s| s.to_string()).collect();
            cycle.push(node.to_string());
            return cycle;
        }
        position.insert(node, path.len());
        path.push(node);

        let next = dependencies
            .get(node)
            .and_then(|deps| deps.iter().map(String::as_str).find(|d| remaining.contains(d)));
        match next {
            Some(next) => node = next,
            None => return remaining.iter().map(|s| s.to_string()).collect(),
        }
    }
}
