//! Dependency resolution.
//!
//! An edge A → B means "A depends on B". Dependencies name an extension or
//! one of its `implements` aliases. The order is a Kahn topological sort
//! whose ready set is kept sorted, so ties break by ascending name and the
//! result is deterministic. An extension's generation is its topological
//! depth: 0 with no dependencies, otherwise one more than its deepest
//! dependency.
//!
//! [`resolve_order`] is all-or-nothing. [`partition`] is what the loader
//! uses: it drops only the unsatisfiable subtrees and resolves the rest.

use parley_core::capability::LoadSlot;
use parley_core::error::DependencyError;
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

use crate::manifest::ExtensionDescriptor;

/// A descriptor placed in the load order.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedExtension {
    pub descriptor: ExtensionDescriptor,

    /// Topological depth
    pub generation: usize,

    /// Index in the load order
    pub position: usize,

    /// Extensions this one requires (resolved from names and aliases)
    pub requires: Vec<String>,

    /// Present optional dependencies it loads after
    pub after: Vec<String>,
}

impl ResolvedExtension {
    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn slot(&self) -> LoadSlot {
        LoadSlot::new(self.generation, self.position)
    }
}

/// Lenient resolution result.
#[derive(Debug, Default)]
pub struct Partition {
    /// Loadable extensions in load order
    pub order: Vec<ResolvedExtension>,

    /// Extensions left out with the reason, ordered by name
    pub rejected: Vec<(String, DependencyError)>,
}

#[derive(Debug, Default, Clone)]
struct Edges {
    required: BTreeSet<String>,
    optional: BTreeSet<String>,
}

impl Edges {
    fn all(&self) -> BTreeSet<String> {
        self.required.union(&self.optional).cloned().collect()
    }
}

/// Maps every provided name (extension names and aliases) to its providers.
struct ProviderIndex<'a> {
    by_name: BTreeMap<&'a str, &'a ExtensionDescriptor>,
    providers: BTreeMap<&'a str, Vec<&'a ExtensionDescriptor>>,
}

impl<'a> ProviderIndex<'a> {
    fn new(descriptors: &'a [ExtensionDescriptor]) -> Self {
        let mut by_name = BTreeMap::new();
        let mut providers: BTreeMap<&str, Vec<&ExtensionDescriptor>> = BTreeMap::new();
        for d in descriptors {
            by_name.insert(d.name.as_str(), d);
            for provided in d.provides() {
                providers.entry(provided).or_default().push(d);
            }
        }
        Self { by_name, providers }
    }

    fn duplicates(&self) -> Vec<DependencyError> {
        self.providers
            .iter()
            .filter(|(_, providers)| providers.len() > 1)
            .map(|(name, providers)| {
                let mut names: Vec<String> = providers.iter().map(|d| d.name.clone()).collect();
                names.sort();
                DependencyError::DuplicateProvider {
                    name: name.to_string(),
                    providers: names,
                }
            })
            .collect()
    }

    /// Edges of `d`, or the first unsatisfiable required dependency.
    fn edges(&self, d: &ExtensionDescriptor) -> Result<Edges, DependencyError> {
        let mut edges = Edges::default();

        for (dep, requirement) in &d.dependencies {
            let Some(providers) = self.providers.get(dep.as_str()) else {
                return Err(DependencyError::Missing {
                    extension: d.name.clone(),
                    dependency: dep.clone(),
                    requirement: requirement.clone(),
                });
            };
            if let [provider] = providers.as_slice() {
                if !requirement.matches(&provider.version) {
                    return Err(DependencyError::VersionMismatch {
                        extension: d.name.clone(),
                        dependency: dep.clone(),
                        requirement: requirement.clone(),
                        found: provider.version.clone(),
                    });
                }
            }
            // Several providers: every one of them is rejected as a duplicate,
            // and the edges make this extension fail with them.
            edges
                .required
                .extend(providers.iter().filter(|p| p.name != d.name).map(|p| p.name.clone()));
        }

        for (dep, requirement) in &d.optional_dependencies {
            match self.providers.get(dep.as_str()).map(Vec::as_slice) {
                Some([provider]) if requirement.matches(&provider.version) => {
                    if provider.name != d.name {
                        edges.optional.insert(provider.name.clone());
                    }
                }
                Some([provider]) => debug!(
                    extension = %d.name,
                    dependency = %dep,
                    found = %provider.version,
                    "Optional dependency version not compatible; ignoring"
                ),
                _ => {}
            }
        }

        Ok(edges)
    }
}

/// Kahn's algorithm with a name-ordered ready set.
///
/// Returns the order plus each node's generation, and the nodes that could
/// not be ordered.
fn kahn(graph: &BTreeMap<String, BTreeSet<String>>) -> (Vec<(String, usize)>, BTreeSet<String>) {
    let mut indegree: BTreeMap<&str, usize> = BTreeMap::new();
    let mut dependents: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    for (node, deps) in graph {
        indegree.insert(node.as_str(), deps.len());
        for dep in deps {
            dependents.entry(dep.as_str()).or_default().push(node.as_str());
        }
    }

    let mut ready: BTreeSet<&str> = indegree
        .iter()
        .filter(|(_, count)| **count == 0)
        .map(|(node, _)| *node)
        .collect();
    let mut generation: BTreeMap<&str, usize> = BTreeMap::new();
    let mut order = Vec::with_capacity(graph.len());

    while let Some(node) = ready.pop_first() {
        let depth = graph[node]
            .iter()
            .map(|dep| generation[dep.as_str()] + 1)
            .max()
            .unwrap_or(0);
        generation.insert(node, depth);
        order.push((node.to_string(), depth));

        for &dependent in dependents.get(node).into_iter().flatten() {
            if let Some(count) = indegree.get_mut(dependent) {
                *count -= 1;
                if *count == 0 {
                    ready.insert(dependent);
                }
            }
        }
    }

    let leftover = graph
        .keys()
        .filter(|node| !generation.contains_key(node.as_str()))
        .cloned()
        .collect();
    (order, leftover)
}

/// Every cycle among `nodes`, as strongly connected components (Tarjan).
///
/// Each cycle is sorted by name; cycles are sorted by their first member.
/// Nodes that merely depend on a cycle are not members of it.
fn find_cycles(graph: &BTreeMap<String, BTreeSet<String>>, nodes: &BTreeSet<String>) -> Vec<Vec<String>> {
    struct Tarjan<'g> {
        graph: &'g BTreeMap<String, BTreeSet<String>>,
        nodes: &'g BTreeSet<String>,
        index: BTreeMap<&'g str, usize>,
        lowlink: BTreeMap<&'g str, usize>,
        stack: Vec<&'g str>,
        on_stack: BTreeSet<&'g str>,
        next: usize,
        cycles: Vec<Vec<String>>,
    }

    impl<'g> Tarjan<'g> {
        fn visit(&mut self, v: &'g str) {
            self.index.insert(v, self.next);
            self.lowlink.insert(v, self.next);
            self.next += 1;
            self.stack.push(v);
            self.on_stack.insert(v);

            let graph = self.graph;
            for w in &graph[v] {
                let w = w.as_str();
                if !self.nodes.contains(w) {
                    continue;
                }
                if !self.index.contains_key(w) {
                    self.visit(w);
                    let low = self.lowlink[v].min(self.lowlink[w]);
                    self.lowlink.insert(v, low);
                } else if self.on_stack.contains(w) {
                    let low = self.lowlink[v].min(self.index[w]);
                    self.lowlink.insert(v, low);
                }
            }

            if self.lowlink[v] == self.index[v] {
                let mut component = Vec::new();
                while let Some(w) = self.stack.pop() {
                    self.on_stack.remove(w);
                    component.push(w.to_string());
                    if w == v {
                        break;
                    }
                }
                let self_loop = graph[v].contains(v);
                if component.len() > 1 || self_loop {
                    component.sort();
                    self.cycles.push(component);
                }
            }
        }
    }

    let mut tarjan = Tarjan {
        graph,
        nodes,
        index: BTreeMap::new(),
        lowlink: BTreeMap::new(),
        stack: Vec::new(),
        on_stack: BTreeSet::new(),
        next: 0,
        cycles: Vec::new(),
    };
    for node in nodes {
        if !tarjan.index.contains_key(node.as_str()) {
            tarjan.visit(node.as_str());
        }
    }
    let mut cycles = tarjan.cycles;
    cycles.sort();
    cycles
}

fn build_order(
    index: &ProviderIndex<'_>,
    edges: &BTreeMap<String, Edges>,
    order: Vec<(String, usize)>,
) -> Vec<ResolvedExtension> {
    order
        .into_iter()
        .filter_map(|(name, generation)| {
            let descriptor = index.by_name.get(name.as_str())?;
            let edges = edges.get(&name)?;
            Some(ResolvedExtension {
                descriptor: (*descriptor).clone(),
                generation,
                position: 0,
                requires: edges.required.iter().cloned().collect(),
                after: edges.optional.iter().cloned().collect(),
            })
        })
        .enumerate()
        .map(|(position, resolved)| ResolvedExtension { position, ..resolved })
        .collect()
}

/// Resolve a load order for every descriptor, or fail without partial results.
///
/// Errors are checked in this order: duplicate providers, missing or
/// incompatible dependencies (first by extension name), then cycles, which
/// are all reported together.
pub fn resolve_order(descriptors: &[ExtensionDescriptor]) -> Result<Vec<ResolvedExtension>, DependencyError> {
    let index = ProviderIndex::new(descriptors);
    if let Some(duplicate) = index.duplicates().into_iter().next() {
        return Err(duplicate);
    }

    let mut edges = BTreeMap::new();
    for (name, descriptor) in &index.by_name {
        edges.insert(name.to_string(), index.edges(descriptor)?);
    }

    let graph: BTreeMap<String, BTreeSet<String>> =
        edges.iter().map(|(n, e)| (n.clone(), e.all())).collect();
    let (order, leftover) = kahn(&graph);
    if !leftover.is_empty() {
        return Err(DependencyError::Cycle {
            cycles: find_cycles(&graph, &leftover),
        });
    }
    Ok(build_order(&index, &edges, order))
}

/// Resolve what can be resolved.
///
/// Unsatisfiable extensions are rejected with their own error; extensions
/// that require a rejected one are rejected as
/// [`DependencyError::FailedAncestor`]. Optional edges to rejected
/// extensions are simply dropped.
pub fn partition(descriptors: &[ExtensionDescriptor]) -> Partition {
    let index = ProviderIndex::new(descriptors);
    let mut rejected: BTreeMap<String, DependencyError> = BTreeMap::new();

    for duplicate in index.duplicates() {
        if let DependencyError::DuplicateProvider { providers, .. } = &duplicate {
            for provider in providers {
                rejected.entry(provider.clone()).or_insert_with(|| duplicate.clone());
            }
        }
    }

    let mut edges: BTreeMap<String, Edges> = BTreeMap::new();
    for (name, descriptor) in &index.by_name {
        match index.edges(descriptor) {
            Ok(e) => {
                edges.insert(name.to_string(), e);
            }
            Err(error) => {
                rejected.entry(name.to_string()).or_insert(error);
            }
        }
    }

    // Propagate failures down required edges until nothing changes.
    loop {
        let newly: Vec<(String, String)> = edges
            .iter()
            .filter(|(name, _)| !rejected.contains_key(*name))
            .filter_map(|(name, e)| {
                e.required
                    .iter()
                    .find(|dep| rejected.contains_key(*dep))
                    .map(|ancestor| (name.clone(), ancestor.clone()))
            })
            .collect();
        if newly.is_empty() {
            break;
        }
        for (extension, ancestor) in newly {
            rejected.insert(
                extension.clone(),
                DependencyError::FailedAncestor { extension, ancestor },
            );
        }
    }

    edges.retain(|name, _| !rejected.contains_key(name));
    let names: BTreeSet<String> = edges.keys().cloned().collect();
    for e in edges.values_mut() {
        e.optional.retain(|dep| names.contains(dep));
    }

    let graph: BTreeMap<String, BTreeSet<String>> =
        edges.iter().map(|(n, e)| (n.clone(), e.all())).collect();
    let (order, leftover) = kahn(&graph);

    if !leftover.is_empty() {
        for cycle in find_cycles(&graph, &leftover) {
            for member in &cycle {
                rejected.insert(
                    member.clone(),
                    DependencyError::Cycle {
                        cycles: vec![cycle.clone()],
                    },
                );
            }
        }
        for node in &leftover {
            if rejected.contains_key(node) {
                continue;
            }
            let ancestor = graph[node]
                .iter()
                .find(|dep| leftover.contains(*dep))
                .cloned()
                .unwrap_or_default();
            rejected.insert(
                node.clone(),
                DependencyError::FailedAncestor {
                    extension: node.clone(),
                    ancestor,
                },
            );
        }
    }

    Partition {
        order: build_order(&index, &edges, order),
        rejected: rejected.into_iter().collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use semver::Version;

    fn ext(name: &str, version: &str, deps: &[(&str, &str)]) -> ExtensionDescriptor {
        let mut text = format!("name = \"{name}\"\nversion = \"{version}\"\n[dependencies]\n");
        for (dep, req) in deps {
            text.push_str(&format!("\"{dep}\" = \"{req}\"\n"));
        }
        ExtensionDescriptor::from_toml(&text, name).unwrap()
    }

    fn names(order: &[ResolvedExtension]) -> Vec<&str> {
        order.iter().map(ResolvedExtension::name).collect()
    }

    #[test]
    fn dependencies_precede_dependents_with_name_ties() {
        let descriptors = vec![
            ext("zeta", "1.0.0", &[]),
            ext("greeter", "1.0.0", &[("console", "^0.1")]),
            ext("console", "0.1.3", &[]),
            ext("alpha", "1.0.0", &[]),
            ext("stats", "2.0.0", &[("greeter", "1"), ("console", "*")]),
        ];
        let order = resolve_order(&descriptors).unwrap();
        assert_eq!(names(&order), vec!["alpha", "console", "greeter", "stats", "zeta"]);

        let generation: BTreeMap<_, _> = order.iter().map(|r| (r.name(), r.generation)).collect();
        assert_eq!(generation["console"], 0);
        assert_eq!(generation["greeter"], 1);
        assert_eq!(generation["stats"], 2);
        assert_eq!(generation["zeta"], 0);

        let positions: Vec<usize> = order.iter().map(|r| r.position).collect();
        assert_eq!(positions, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn missing_and_mismatched_dependencies() {
        let err = resolve_order(&[ext("greeter", "1.0.0", &[("console", "*")])]).unwrap_err();
        assert!(matches!(err, DependencyError::Missing { ref dependency, .. } if dependency == "console"));

        let err = resolve_order(&[
            ext("greeter", "1.0.0", &[("console", "^1")]),
            ext("console", "0.9.0", &[]),
        ])
        .unwrap_err();
        match err {
            DependencyError::VersionMismatch { extension, found, .. } => {
                assert_eq!(extension, "greeter");
                assert_eq!(found, Version::new(0, 9, 0));
            }
            other => panic!("expected VersionMismatch, got {other:?}"),
        }
    }

    #[test]
    fn every_cycle_is_reported_exactly() {
        let descriptors = vec![
            ext("a", "1.0.0", &[("b", "*")]),
            ext("b", "1.0.0", &[("a", "*")]),
            ext("x", "1.0.0", &[("y", "*")]),
            ext("y", "1.0.0", &[("z", "*")]),
            ext("z", "1.0.0", &[("x", "*")]),
            // Blocked by a cycle but not part of one.
            ext("tail", "1.0.0", &[("a", "*")]),
            ext("free", "1.0.0", &[]),
        ];
        match resolve_order(&descriptors).unwrap_err() {
            DependencyError::Cycle { cycles } => {
                assert_eq!(
                    cycles,
                    vec![
                        vec!["a".to_string(), "b".to_string()],
                        vec!["x".to_string(), "y".to_string(), "z".to_string()],
                    ]
                );
            }
            other => panic!("expected Cycle, got {other:?}"),
        }
    }

    #[test]
    fn aliases_satisfy_dependencies() {
        let provider = ExtensionDescriptor::from_toml(
            "name = \"discord\"\nversion = \"0.3.0\"\nimplements = [\"chat-platform\"]",
            "discord",
        )
        .unwrap();
        let order = resolve_order(&[
            ext("greeter", "1.0.0", &[("chat-platform", ">=0.3")]),
            provider,
        ])
        .unwrap();
        assert_eq!(names(&order), vec!["discord", "greeter"]);
        assert_eq!(order[1].requires, vec!["discord"]);
    }

    #[test]
    fn duplicate_alias_is_rejected() {
        let a = ExtensionDescriptor::from_toml(
            "name = \"irc\"\nversion = \"1.0.0\"\nimplements = [\"chat-platform\"]",
            "irc",
        )
        .unwrap();
        let b = ExtensionDescriptor::from_toml(
            "name = \"twitch\"\nversion = \"1.0.0\"\nimplements = [\"chat-platform\"]",
            "twitch",
        )
        .unwrap();
        match resolve_order(&[a, b]).unwrap_err() {
            DependencyError::DuplicateProvider { name, providers } => {
                assert_eq!(name, "chat-platform");
                assert_eq!(providers, vec!["irc", "twitch"]);
            }
            other => panic!("expected DuplicateProvider, got {other:?}"),
        }
    }

    #[test]
    fn optional_dependencies_order_only_when_present() {
        let greeter = ExtensionDescriptor::from_toml(
            "name = \"greeter\"\nversion = \"1.0.0\"\n[optional_dependencies]\nstats = \">=1\"\nmissing = \"*\"",
            "greeter",
        )
        .unwrap();
        let order = resolve_order(&[greeter.clone(), ext("stats", "1.5.0", &[])]).unwrap();
        assert_eq!(names(&order), vec!["stats", "greeter"]);
        assert_eq!(order[1].after, vec!["stats"]);
        assert_eq!(order[1].generation, 1);

        // Incompatible version: ignored, no edge.
        let order = resolve_order(&[greeter, ext("stats", "0.5.0", &[])]).unwrap();
        assert_eq!(names(&order), vec!["greeter", "stats"]);
    }

    #[test]
    fn partition_keeps_independent_extensions() {
        let descriptors = vec![
            ext("a", "1.0.0", &[("b", "*")]),
            ext("b", "1.0.0", &[("a", "*")]),
            ext("tail", "1.0.0", &[("a", "*")]),
            ext("orphan", "1.0.0", &[("ghost", "*")]),
            ext("child", "1.0.0", &[("orphan", "*")]),
            ext("console", "0.1.0", &[]),
            ext("greeter", "1.0.0", &[("console", "*")]),
        ];
        let partition = partition(&descriptors);
        assert_eq!(names(&partition.order), vec!["console", "greeter"]);

        let rejected: BTreeMap<&str, &DependencyError> = partition
            .rejected
            .iter()
            .map(|(name, e)| (name.as_str(), e))
            .collect();
        assert_eq!(rejected.len(), 5);
        for member in ["a", "b"] {
            match rejected[member] {
                DependencyError::Cycle { cycles } => {
                    assert_eq!(cycles, &vec![vec!["a".to_string(), "b".to_string()]]);
                }
                other => panic!("expected Cycle, got {other:?}"),
            }
        }
        assert!(matches!(rejected["orphan"], DependencyError::Missing { .. }));
        assert!(matches!(
            rejected["child"],
            DependencyError::FailedAncestor { ancestor, .. } if ancestor == "orphan"
        ));
        assert!(matches!(
            rejected["tail"],
            DependencyError::FailedAncestor { ancestor, .. } if ancestor == "a"
        ));
    }
}
