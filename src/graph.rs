//! Dependency graph between containers.
//!
//! The graph is rebuilt from container labels on every scan and never
//! mutated afterwards. Nodes are composite keys; a dependency declared by
//! name refers to a container on the same host.
//!
//! Ordering is computed over the strongly connected components of the
//! graph, so a cycle only affects its own members: they are emitted
//! together, in name order, at the position the rest of the graph allows.

use std::collections::{BTreeSet, HashMap};

use log::warn;
use thiserror::Error;

use crate::error::{EngineError, Result};
use crate::types::{composite_key, ContainerInfo};

pub const DEPENDS_ON_LABEL: &str = "sentinel.depends-on";
pub const COMPOSE_DEPENDS_ON_LABEL: &str = "com.docker.compose.depends_on";
pub const COMPOSE_PROJECT_LABEL: &str = "com.docker.compose.project";
pub const COMPOSE_SERVICE_LABEL: &str = "com.docker.compose.service";

/// Returned by [`DependencyGraph::sort`] when the graph is not a DAG. Still
/// carries the best-effort order.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("dependency cycle detected: {}", format_cycles(.cycles))]
pub struct CycleError {
    pub order: Vec<String>,
    pub cycles: Vec<Vec<String>>,
}

fn format_cycles(cycles: &[Vec<String>]) -> String {
    cycles
        .iter()
        .map(|cycle| cycle.join(" -> "))
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DependencyNode {
    pub name: String,
    /// Declared dependencies, sorted. May name containers that are not in
    /// the graph.
    pub depends_on: Vec<String>,
    /// Containers in the graph that declare this one, sorted.
    pub dependents: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    nodes: HashMap<String, DependencyNode>,
    names: Vec<String>,
}

/// Parses a `sentinel.depends-on` value: comma separated names, blanks
/// ignored.
pub fn parse_depends_on(value: &str) -> Result<Vec<String>> {
    let mut names = Vec::new();
    for item in value.split(',') {
        let item = item.trim();
        if item.is_empty() {
            continue;
        }
        if item.chars().any(char::is_whitespace) || item.contains("::") {
            return Err(EngineError::validation(
                DEPENDS_ON_LABEL,
                format!("`{}` is not a container name", item),
            ));
        }
        names.push(item.to_string());
    }
    Ok(names)
}

/// Parses Compose's `service:condition:restart,...` form into service names.
pub fn parse_compose_depends_on(value: &str) -> Vec<String> {
    value
        .split(',')
        .filter_map(|item| item.split(':').next())
        .map(str::trim)
        .filter(|service| !service.is_empty())
        .map(str::to_string)
        .collect()
}

impl DependencyGraph {
    pub fn build(containers: &[ContainerInfo]) -> Self {
        let mut compose_services: HashMap<(String, String, String), String> = HashMap::new();
        for container in containers {
            if let (Some(project), Some(service)) = (
                container.label(COMPOSE_PROJECT_LABEL),
                container.label(COMPOSE_SERVICE_LABEL),
            ) {
                compose_services.insert(
                    (container.host_id.clone(), project.to_string(), service.to_string()),
                    container.key(),
                );
            }
        }

        let mut nodes: HashMap<String, DependencyNode> = HashMap::new();
        for container in containers {
            let key = container.key();
            let mut depends_on = BTreeSet::new();

            if let Some(value) = container.label(DEPENDS_ON_LABEL) {
                match parse_depends_on(value) {
                    Ok(names) => depends_on.extend(
                        names
                            .iter()
                            .map(|name| composite_key(&container.host_id, name)),
                    ),
                    Err(e) => warn!("Ignoring dependencies of {}: {}", key, e),
                }
            }

            if let Some(value) = container.label(COMPOSE_DEPENDS_ON_LABEL) {
                let project = container.label(COMPOSE_PROJECT_LABEL).unwrap_or_default();
                for service in parse_compose_depends_on(value) {
                    let lookup = (container.host_id.clone(), project.to_string(), service.clone());
                    let dependency = compose_services
                        .get(&lookup)
                        .cloned()
                        .unwrap_or_else(|| composite_key(&container.host_id, &service));
                    depends_on.insert(dependency);
                }
            }

            nodes.insert(
                key.clone(),
                DependencyNode {
                    name: key,
                    depends_on: depends_on.into_iter().collect(),
                    dependents: Vec::new(),
                },
            );
        }

        let mut dependents: HashMap<String, BTreeSet<String>> = HashMap::new();
        for node in nodes.values() {
            for dependency in &node.depends_on {
                if nodes.contains_key(dependency) {
                    dependents
                        .entry(dependency.clone())
                        .or_default()
                        .insert(node.name.clone());
                }
            }
        }
        for (name, set) in dependents {
            if let Some(node) = nodes.get_mut(&name) {
                node.dependents = set.into_iter().collect();
            }
        }

        let mut names: Vec<String> = nodes.keys().cloned().collect();
        names.sort();
        Self { nodes, names }
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn node(&self, name: &str) -> Option<&DependencyNode> {
        self.nodes.get(name)
    }

    pub fn dependencies(&self, name: &str) -> &[String] {
        self.nodes
            .get(name)
            .map(|n| n.depends_on.as_slice())
            .unwrap_or_default()
    }

    pub fn dependents(&self, name: &str) -> &[String] {
        self.nodes
            .get(name)
            .map(|n| n.dependents.as_slice())
            .unwrap_or_default()
    }

    /// Dependencies that are themselves nodes of the graph.
    fn edges<'a>(&'a self, name: &str) -> impl Iterator<Item = &'a String> + 'a {
        let nodes = &self.nodes;
        self.dependencies(name)
            .iter()
            .filter(move |dependency| nodes.contains_key(dependency.as_str()))
    }

    /// Dependency-first order. Fails exactly when the graph has a cycle; the
    /// error still carries the best-effort order.
    pub fn sort(&self) -> std::result::Result<Vec<String>, CycleError> {
        let order = self.update_order();
        let cycles = self.detect_cycles();
        if cycles.is_empty() {
            Ok(order)
        } else {
            Err(CycleError { order, cycles })
        }
    }

    /// Best-effort dependency-first order covering every node. Members of a
    /// cycle are placed together in name order.
    pub fn update_order(&self) -> Vec<String> {
        let components = self.strongly_connected_components();
        let mut component_of: HashMap<&str, usize> = HashMap::new();
        for (index, members) in components.iter().enumerate() {
            for member in members {
                component_of.insert(member.as_str(), index);
            }
        }

        // Edges run dependency component -> dependent component.
        let mut in_degree = vec![0usize; components.len()];
        let mut downstream: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); components.len()];
        for name in &self.names {
            let to = component_of[name.as_str()];
            for dependency in self.edges(name) {
                let from = component_of[dependency.as_str()];
                if from != to && downstream[from].insert(to) {
                    in_degree[to] += 1;
                }
            }
        }

        // Ready components keyed by their smallest member name.
        let mut ready: BTreeSet<(&str, usize)> = components
            .iter()
            .enumerate()
            .filter(|(index, _)| in_degree[*index] == 0)
            .map(|(index, members)| (members[0].as_str(), index))
            .collect();

        let mut order = Vec::with_capacity(self.names.len());
        while let Some(entry) = ready.pop_first() {
            let index = entry.1;
            order.extend(components[index].iter().cloned());
            for &next in &downstream[index] {
                in_degree[next] -= 1;
                if in_degree[next] == 0 {
                    ready.insert((components[next][0].as_str(), next));
                }
            }
        }
        order
    }

    /// Tarjan's algorithm. Each component's members are sorted.
    fn strongly_connected_components(&self) -> Vec<Vec<String>> {
        struct Tarjan<'a> {
            graph: &'a DependencyGraph,
            index: HashMap<&'a str, usize>,
            low: HashMap<&'a str, usize>,
            stack: Vec<&'a str>,
            on_stack: BTreeSet<&'a str>,
            next: usize,
            components: Vec<Vec<String>>,
        }

        impl<'a> Tarjan<'a> {
            fn visit(&mut self, name: &'a str) {
                self.index.insert(name, self.next);
                self.low.insert(name, self.next);
                self.next += 1;
                self.stack.push(name);
                self.on_stack.insert(name);

                let graph = self.graph;
                for dependency in graph.edges(name) {
                    let dependency = dependency.as_str();
                    if !self.index.contains_key(dependency) {
                        self.visit(dependency);
                        let low = self.low[name].min(self.low[dependency]);
                        self.low.insert(name, low);
                    } else if self.on_stack.contains(dependency) {
                        let low = self.low[name].min(self.index[dependency]);
                        self.low.insert(name, low);
                    }
                }

                if self.low[name] == self.index[name] {
                    let mut members = Vec::new();
                    while let Some(member) = self.stack.pop() {
                        self.on_stack.remove(member);
                        members.push(member.to_string());
                        if member == name {
                            break;
                        }
                    }
                    members.sort();
                    self.components.push(members);
                }
            }
        }

        let mut tarjan = Tarjan {
            graph: self,
            index: HashMap::new(),
            low: HashMap::new(),
            stack: Vec::new(),
            on_stack: BTreeSet::new(),
            next: 0,
            components: Vec::new(),
        };
        for name in &self.names {
            if !tarjan.index.contains_key(name.as_str()) {
                tarjan.visit(name);
            }
        }
        tarjan.components
    }

    /// Every elementary cycle, each starting at its smallest member and
    /// listed in dependency direction. Overlapping cycles through the same
    /// members are reported separately. Independent of [`sort`](Self::sort).
    pub fn detect_cycles(&self) -> Vec<Vec<String>> {
        // Johnson's circuit search, rooted at each member of a component in
        // name order and confined to the members not yet used as a root.
        struct Johnson<'a> {
            graph: &'a DependencyGraph,
            start: &'a str,
            allowed: BTreeSet<&'a str>,
            blocked: BTreeSet<&'a str>,
            blocked_by: HashMap<&'a str, BTreeSet<&'a str>>,
            path: Vec<&'a str>,
            found: BTreeSet<Vec<String>>,
        }

        impl<'a> Johnson<'a> {
            fn unblock(&mut self, name: &'a str) {
                self.blocked.remove(name);
                for waiting in self.blocked_by.remove(name).unwrap_or_default() {
                    if self.blocked.contains(waiting) {
                        self.unblock(waiting);
                    }
                }
            }

            fn circuit(&mut self, name: &'a str) -> bool {
                let next: Vec<&'a str> = self
                    .graph
                    .edges(name)
                    .map(String::as_str)
                    .filter(|dependency| self.allowed.contains(dependency))
                    .collect();
                self.path.push(name);
                self.blocked.insert(name);

                let mut closed = false;
                for &dependency in &next {
                    if dependency == self.start {
                        self.found
                            .insert(self.path.iter().map(|n| n.to_string()).collect());
                        closed = true;
                    } else if !self.blocked.contains(dependency) && self.circuit(dependency) {
                        closed = true;
                    }
                }

                if closed {
                    self.unblock(name);
                } else {
                    for &dependency in &next {
                        self.blocked_by.entry(dependency).or_default().insert(name);
                    }
                }
                self.path.pop();
                closed
            }
        }

        let mut found = BTreeSet::new();
        for component in self.strongly_connected_components() {
            for (position, start) in component.iter().enumerate() {
                let mut search = Johnson {
                    graph: self,
                    start,
                    allowed: component[position..].iter().map(String::as_str).collect(),
                    blocked: BTreeSet::new(),
                    blocked_by: HashMap::new(),
                    path: Vec::new(),
                    found: BTreeSet::new(),
                };
                search.circuit(start);
                found.extend(search.found);
            }
        }
        found.into_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn container(name: &str, depends_on: &str) -> ContainerInfo {
        let mut labels = HashMap::new();
        if !depends_on.is_empty() {
            labels.insert(DEPENDS_ON_LABEL.to_string(), depends_on.to_string());
        }
        ContainerInfo {
            id: format!("id-{}", name),
            name: name.to_string(),
            kind: Default::default(),
            image: "busybox:latest".into(),
            labels,
            host_id: String::new(),
            state: "running".into(),
            image_digest: String::new(),
        }
    }

    fn index_of(order: &[String], name: &str) -> usize {
        order.iter().position(|n| n == name).unwrap()
    }

    #[test]
    fn dependencies_precede_dependents() {
        let graph = DependencyGraph::build(&[
            container("app", "db, cache"),
            container("worker", "app,db"),
            container("db", "migrate"),
            container("cache", ""),
            container("migrate", ""),
        ]);
        let order = graph.sort().unwrap();
        assert_eq!(order.len(), 5);
        for name in ["app", "worker", "db", "cache", "migrate"] {
            for dependency in graph.dependencies(name) {
                assert!(index_of(&order, dependency) < index_of(&order, name));
            }
        }
        assert!(graph.detect_cycles().is_empty());
    }

    #[test]
    fn adjacency_lookups() {
        let graph = DependencyGraph::build(&[
            container("app", "db"),
            container("worker", "db"),
            container("db", ""),
        ]);
        assert_eq!(graph.dependencies("app"), ["db".to_string()]);
        assert_eq!(graph.dependents("db"), ["app".to_string(), "worker".to_string()]);
        assert!(graph.dependents("app").is_empty());
        assert!(graph.dependencies("unknown").is_empty());
    }

    #[test]
    fn cycle_does_not_block_unrelated_ordering() {
        // A <-> B is a cycle; D depends on C.
        let graph = DependencyGraph::build(&[
            container("A", "B"),
            container("B", "A"),
            container("C", ""),
            container("D", "C"),
        ]);
        let err = graph.sort().unwrap_err();
        assert_eq!(err.cycles, vec![vec!["A".to_string(), "B".to_string()]]);
        assert_eq!(err.order.len(), 4);
        assert!(index_of(&err.order, "C") < index_of(&err.order, "D"));
        assert_eq!(graph.update_order(), err.order);
    }

    #[test]
    fn cycle_members_precede_their_dependents() {
        let graph = DependencyGraph::build(&[
            container("x", "y"),
            container("y", "x"),
            container("app", "y"),
        ]);
        let order = graph.update_order();
        assert_eq!(order, vec!["x", "y", "app"]);
    }

    #[test]
    fn reports_every_independent_cycle() {
        let graph = DependencyGraph::build(&[
            container("a", "b"),
            container("b", "a"),
            container("p", "q"),
            container("q", "r"),
            container("r", "p"),
            container("solo", "solo"),
        ]);
        let cycles = graph.detect_cycles();
        assert_eq!(
            cycles,
            vec![
                vec!["a".to_string(), "b".to_string()],
                vec!["p".to_string(), "q".to_string(), "r".to_string()],
                vec!["solo".to_string()],
            ]
        );
    }

    #[test]
    fn overlapping_cycles_are_all_reported() {
        // a needs b and c, b needs c, c needs a: two cycles share a and c.
        let graph = DependencyGraph::build(&[
            container("a", "b,c"),
            container("b", "c"),
            container("c", "a"),
        ]);
        assert_eq!(
            graph.detect_cycles(),
            vec![
                vec!["a".to_string(), "b".to_string(), "c".to_string()],
                vec!["a".to_string(), "c".to_string()],
            ]
        );
        assert_eq!(graph.sort().unwrap_err().cycles.len(), 2);
        assert_eq!(graph.update_order(), vec!["a", "b", "c"]);
    }

    #[test]
    fn cycles_sharing_one_member_are_reported_apart() {
        let graph = DependencyGraph::build(&[
            container("hub", "left,right"),
            container("left", "hub"),
            container("right", "hub, right"),
        ]);
        assert_eq!(
            graph.detect_cycles(),
            vec![
                vec!["hub".to_string(), "left".to_string()],
                vec!["hub".to_string(), "right".to_string()],
                vec!["right".to_string()],
            ]
        );
    }

    #[test]
    fn missing_dependencies_are_kept_but_do_not_constrain_order() {
        let graph = DependencyGraph::build(&[container("app", "external-db")]);
        assert_eq!(graph.dependencies("app"), ["external-db".to_string()]);
        assert_eq!(graph.sort().unwrap(), vec!["app"]);
    }

    #[test]
    fn malformed_declaration_is_rejected() {
        assert!(parse_depends_on("db, my cache").is_err());
        assert_eq!(parse_depends_on(" db ,, cache ").unwrap(), vec!["db", "cache"]);
        let graph = DependencyGraph::build(&[container("app", "db, my cache"), container("db", "")]);
        assert!(graph.dependencies("app").is_empty());
    }

    #[test]
    fn compose_dependencies_resolve_to_container_names() {
        let mut app = container("shop-app-1", "");
        app.labels.insert(COMPOSE_PROJECT_LABEL.into(), "shop".into());
        app.labels.insert(COMPOSE_SERVICE_LABEL.into(), "app".into());
        app.labels.insert(
            COMPOSE_DEPENDS_ON_LABEL.into(),
            "db:service_healthy:false,cache:service_started:false".into(),
        );
        let mut db = container("shop-db-1", "");
        db.labels.insert(COMPOSE_PROJECT_LABEL.into(), "shop".into());
        db.labels.insert(COMPOSE_SERVICE_LABEL.into(), "db".into());

        let graph = DependencyGraph::build(&[app, db]);
        assert_eq!(
            graph.dependencies("shop-app-1"),
            ["cache".to_string(), "shop-db-1".to_string()]
        );
        assert_eq!(graph.dependents("shop-db-1"), ["shop-app-1".to_string()]);
    }

    #[test]
    fn remote_dependencies_stay_on_their_host() {
        let mut app = container("app", "db");
        app.host_id = "edge".into();
        let mut db = container("db", "");
        db.host_id = "edge".into();
        let local_db = container("db", "");

        let graph = DependencyGraph::build(&[app, db, local_db]);
        assert_eq!(graph.dependencies("edge::app"), ["edge::db".to_string()]);
        assert_eq!(graph.dependents("edge::db"), ["edge::app".to_string()]);
        assert!(graph.dependents("db").is_empty());
    }
}
