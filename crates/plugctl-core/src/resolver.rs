//! Dependency Resolver
//!
//! Builds the dependency graph of a root request breadth-first, checks
//! every requester's constraint, rejects cycles and emits an install plan
//! with dependencies first.
//!
//! Resolution does not backtrack: the first manifest fetched for a name
//! fixes that plugin's version, later requesters can only agree with it.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::fmt;
use std::path::PathBuf;

use tracing::{debug, info};

use crate::error::{PlugError, ResolutionKind, Result};
use crate::fetcher::{fetch_with_retry, Fetch, FetchedPlugin, RetryPolicy};
use crate::registry::PluginRegistry;
use crate::source::{DependencySpec, FetchDescriptor, Location};
use crate::version::{Constraint, Version};

const ROOT: &str = "<root>";

/// One plugin to install
#[derive(Debug, Clone)]
pub struct PlanStep {
    pub name: String,
    pub version: Version,
    pub location: Location,
    /// Content fetched during resolution; the orchestrator fetches again
    /// when absent
    pub fetched: Option<FetchedPlugin>,
}

impl fmt::Display for PlanStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.version)
    }
}

/// Topologically ordered install steps, dependencies first
#[derive(Debug, Clone, Default)]
pub struct InstallPlan {
    pub steps: Vec<PlanStep>,
}

impl InstallPlan {
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.name.as_str()).collect()
    }
}

struct Node {
    name: String,
    location: Location,
    fetched: FetchedPlugin,
    /// Indices of the nodes this one depends on
    deps: Vec<usize>,
}

impl Node {
    fn version(&self) -> &Version {
        &self.fetched.manifest.version
    }
}

/// Dependency Resolver
pub struct Resolver<'a> {
    fetcher: &'a dyn Fetch,
    registry: &'a PluginRegistry,
    retry: RetryPolicy,
    cwd: PathBuf,
}

impl<'a> Resolver<'a> {
    pub fn new(fetcher: &'a dyn Fetch, registry: &'a PluginRegistry) -> Self {
        Self {
            fetcher,
            registry,
            retry: RetryPolicy::default(),
            cwd: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Directory that relative origins of the root request resolve against
    pub fn with_cwd(mut self, cwd: PathBuf) -> Self {
        self.cwd = cwd;
        self
    }

    /// Resolve a root request into an install plan
    pub fn resolve(&self, root: &DependencySpec) -> Result<InstallPlan> {
        let nodes = self.build_graph(root)?;
        detect_cycles(&nodes)?;
        let order = topological_order(&nodes)?;

        let mut slots: Vec<Option<Node>> = nodes.into_iter().map(Some).collect();
        let steps: Vec<PlanStep> = order
            .into_iter()
            .filter_map(|index| slots[index].take())
            .map(|node| PlanStep {
                name: node.name,
                version: node.fetched.manifest.version,
                location: node.location,
                fetched: Some(node.fetched),
            })
            .collect();

        info!(
            root = %root.target_name,
            plan = %steps.iter().map(ToString::to_string).collect::<Vec<_>>().join(", "),
            "resolved install plan"
        );
        Ok(InstallPlan { steps })
    }

    /// Breadth-first graph construction; node index is discovery order
    fn build_graph(&self, root: &DependencySpec) -> Result<Vec<Node>> {
        let mut nodes: Vec<Node> = Vec::new();
        let mut by_name: HashMap<String, usize> = HashMap::new();
        let mut queue: VecDeque<(Option<usize>, DependencySpec)> = VecDeque::new();
        queue.push_back((None, root.clone()));

        while let Some((requester, spec)) = queue.pop_front() {
            let requester_name = requester.map_or(ROOT, |i| nodes[i].name.as_str()).to_string();
            let name = spec.target_name.clone();

            if spec.is_pinned_with_constraint() {
                return Err(PlugError::resolution(
                    ResolutionKind::PinnedConstraint,
                    &name,
                    format!(
                        "{} requires '{}': an explicit source cannot carry a version constraint",
                        requester_name, spec
                    ),
                ));
            }

            let referrer = requester.map(|i| &nodes[i].location);
            let (descriptor, entry_constraint) = self.descriptor_for(&spec, referrer)?;

            if let Some(&existing) = by_name.get(&name) {
                let node = &nodes[existing];
                if node.location != descriptor.location {
                    return Err(PlugError::resolution(
                        ResolutionKind::ConflictingOrigin,
                        &name,
                        format!(
                            "{} requires it from {}, but it was already resolved from {}",
                            requester_name, descriptor.location, node.location
                        ),
                    ));
                }
                check_constraint(&name, node.version(), &spec.constraint, &requester_name)?;
                if let Some(i) = requester {
                    nodes[i].deps.push(existing);
                }
                continue;
            }

            debug!(plugin = %name, location = %descriptor.location, requester = %requester_name, "fetching");
            let fetched = fetch_with_retry(self.fetcher, &descriptor, self.retry)?;

            if fetched.manifest.name != name {
                return Err(PlugError::resolution(
                    ResolutionKind::NameMismatch,
                    &name,
                    format!(
                        "{} declares name '{}'",
                        descriptor.location, fetched.manifest.name
                    ),
                ));
            }

            let version = fetched.manifest.version;
            check_constraint(&name, &version, &spec.constraint, &requester_name)?;
            check_constraint(&name, &version, &entry_constraint, "registry entry")?;

            let index = nodes.len();
            for dep in &fetched.manifest.depends_on {
                queue.push_back((Some(index), dep.clone()));
            }
            if let Some(i) = requester {
                nodes[i].deps.push(index);
            }

            by_name.insert(name.clone(), index);
            nodes.push(Node {
                name,
                location: descriptor.location,
                fetched,
                deps: Vec::new(),
            });
        }

        Ok(nodes)
    }

    /// Explicit origins never consult the registry
    fn descriptor_for(
        &self,
        spec: &DependencySpec,
        referrer: Option<&Location>,
    ) -> Result<(FetchDescriptor, Constraint)> {
        if let Some(descriptor) = FetchDescriptor::for_explicit(spec, referrer, &self.cwd)? {
            return Ok((descriptor, Constraint::ANY));
        }

        match self.registry.lookup(&spec.target_name)? {
            Some(target) => Ok((
                FetchDescriptor::new(&spec.target_name, target.location),
                target.constraint,
            )),
            None => Err(PlugError::resolution(
                ResolutionKind::UnknownPlugin,
                &spec.target_name,
                format!("no entry in {}", self.registry.path().display()),
            )),
        }
    }
}

fn check_constraint(name: &str, version: &Version, constraint: &Constraint, requester: &str) -> Result<()> {
    if constraint.matches(version) {
        return Ok(());
    }
    Err(PlugError::resolution(
        ResolutionKind::ConstraintViolation,
        name,
        format!(
            "{} requires {}{}, but {} was selected",
            requester, name, constraint, version
        ),
    ))
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    OnPath,
    Done,
}

/// Depth-first search keeping the open path so a cycle can be reported
/// as `a -> b -> a`.
fn detect_cycles(nodes: &[Node]) -> Result<()> {
    fn visit(nodes: &[Node], index: usize, marks: &mut [Mark], path: &mut Vec<usize>) -> Result<()> {
        marks[index] = Mark::OnPath;
        path.push(index);

        for &dep in &nodes[index].deps {
            match marks[dep] {
                Mark::Unvisited => visit(nodes, dep, marks, path)?,
                Mark::OnPath => {
                    let start = path.iter().position(|&i| i == dep).unwrap_or(0);
                    let cycle: Vec<&str> = path[start..]
                        .iter()
                        .chain(std::iter::once(&dep))
                        .map(|&i| nodes[i].name.as_str())
                        .collect();
                    return Err(PlugError::resolution(
                        ResolutionKind::CyclicDependency,
                        &nodes[dep].name,
                        cycle.join(" -> "),
                    ));
                }
                Mark::Done => {}
            }
        }

        path.pop();
        marks[index] = Mark::Done;
        Ok(())
    }

    let mut marks = vec![Mark::Unvisited; nodes.len()];
    let mut path = Vec::new();
    for index in 0..nodes.len() {
        if marks[index] == Mark::Unvisited {
            visit(nodes, index, &mut marks, &mut path)?;
        }
    }
    Ok(())
}

/// Kahn's algorithm; among ready nodes the earliest discovered goes first
fn topological_order(nodes: &[Node]) -> Result<Vec<usize>> {
    let mut pending: Vec<usize> = nodes.iter().map(|n| n.deps.len()).collect();
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); nodes.len()];
    for (index, node) in nodes.iter().enumerate() {
        for &dep in &node.deps {
            dependents[dep].push(index);
        }
    }

    let mut ready: BTreeSet<usize> = (0..nodes.len()).filter(|&i| pending[i] == 0).collect();
    let mut order = Vec::with_capacity(nodes.len());

    while let Some(index) = ready.pop_first() {
        order.push(index);
        for &dependent in &dependents[index] {
            pending[dependent] -= 1;
            if pending[dependent] == 0 {
                ready.insert(dependent);
            }
        }
    }

    if order.len() != nodes.len() {
        let stuck: Vec<&str> = (0..nodes.len())
            .filter(|i| !order.contains(i))
            .map(|i| nodes[i].name.as_str())
            .collect();
        return Err(PlugError::resolution(
            ResolutionKind::CyclicDependency,
            stuck.first().copied().unwrap_or(ROOT),
            format!("unresolvable ordering among {}", stuck.join(", ")),
        ));
    }
    Ok(order)
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::source::locate;

    fn resolve(fetcher: &MemoryFetcher, registry: &PluginRegistry, root: &str) -> Result<InstallPlan> {
        Resolver::new(fetcher, registry)
            .with_retry(RetryPolicy::none())
            .with_cwd(PathBuf::from(REGISTRY_DIR))
            .resolve(&locate(root).unwrap())
    }

    fn kind_of(result: Result<InstallPlan>) -> (ResolutionKind, String) {
        match result {
            Err(PlugError::Resolution { kind, message, .. }) => (kind, message),
            other => panic!("expected resolution error, got {:?}", other.map(|p| p.names().join(","))),
        }
    }

    #[test]
    fn test_dependencies_come_first() {
        let fetcher = MemoryFetcher::default()
            .serve("/virtual/p", &manifest("p", "1.0.0", &["q>=1.0.0"]))
            .serve("/virtual/q", &manifest("q", "1.2.0", &[]));
        let registry = registry(&[("p", None), ("q", None)]);

        let plan = resolve(&fetcher, &registry, "p").unwrap();
        assert_eq!(plan.names(), ["q", "p"]);
        assert_eq!(plan.steps[0].version, Version::new(1, 2, 0));
        assert!(plan.steps.iter().all(|s| s.fetched.is_some()));
    }

    #[test]
    fn test_diamond_fetches_shared_dependency_once() {
        let fetcher = MemoryFetcher::default()
            .serve("/virtual/r", &manifest("r", "1.0.0", &["a", "b"]))
            .serve("/virtual/a", &manifest("a", "1.0.0", &["c"]))
            .serve("/virtual/b", &manifest("b", "1.0.0", &["c>=1.0.0"]))
            .serve("/virtual/c", &manifest("c", "1.1.0", &[]));
        let registry = registry(&[("r", None), ("a", None), ("b", None), ("c", None)]);

        let plan = resolve(&fetcher, &registry, "r").unwrap();
        assert_eq!(plan.names(), ["c", "a", "b", "r"]);
        assert_eq!(
            fetcher.fetched().iter().filter(|p| p.ends_with("/c")).count(),
            1
        );
    }

    #[test]
    fn test_ties_follow_discovery_order() {
        let fetcher = MemoryFetcher::default()
            .serve("/virtual/r", &manifest("r", "1.0.0", &["zeta", "alpha", "mid"]))
            .serve("/virtual/zeta", &manifest("zeta", "1.0.0", &[]))
            .serve("/virtual/alpha", &manifest("alpha", "1.0.0", &[]))
            .serve("/virtual/mid", &manifest("mid", "1.0.0", &["alpha"]));
        let registry = registry(&[("r", None), ("zeta", None), ("alpha", None), ("mid", None)]);

        let plan = resolve(&fetcher, &registry, "r").unwrap();
        assert_eq!(plan.names(), ["zeta", "alpha", "mid", "r"]);
    }

    #[test]
    fn test_cycle_is_reported_with_path() {
        let fetcher = MemoryFetcher::default()
            .serve("/virtual/a", &manifest("a", "1.0.0", &["b"]))
            .serve("/virtual/b", &manifest("b", "1.0.0", &["a"]));
        let registry = registry(&[("a", None), ("b", None)]);

        let (kind, message) = kind_of(resolve(&fetcher, &registry, "a"));
        assert_eq!(kind, ResolutionKind::CyclicDependency);
        assert_eq!(message, "a -> b -> a");
    }

    #[test]
    fn test_self_dependency_is_a_cycle() {
        let fetcher = MemoryFetcher::default().serve("/virtual/a", &manifest("a", "1.0.0", &["a"]));
        let registry = registry(&[("a", None)]);

        let (kind, message) = kind_of(resolve(&fetcher, &registry, "a"));
        assert_eq!(kind, ResolutionKind::CyclicDependency);
        assert_eq!(message, "a -> a");
    }

    #[test]
    fn test_repeated_dependency_bounds_both_sides() {
        let fetcher = MemoryFetcher::default()
            .serve("/virtual/p", &manifest("p", "1.0.0", &["q>=1.0.0", "q<2.0.0"]))
            .serve("/virtual/q", &manifest("q", "1.5.0", &[]));
        let registry = registry(&[("p", None), ("q", None)]);

        let plan = resolve(&fetcher, &registry, "p").unwrap();
        assert_eq!(plan.names(), ["q", "p"]);
        assert_eq!(fetcher.fetched(), ["/virtual/p", "/virtual/q"]);
    }

    #[test]
    fn test_repeated_dependency_upper_bound_violation() {
        let fetcher = MemoryFetcher::default()
            .serve("/virtual/p", &manifest("p", "1.0.0", &["q>=1.0.0", "q<2.0.0"]))
            .serve("/virtual/q", &manifest("q", "2.3.0", &[]));
        let registry = registry(&[("p", None), ("q", None)]);

        let (kind, message) = kind_of(resolve(&fetcher, &registry, "p"));
        assert_eq!(kind, ResolutionKind::ConstraintViolation);
        assert!(message.contains("p requires q<2.0.0"));
    }

    #[test]
    fn test_later_requester_constraint_violation() {
        let fetcher = MemoryFetcher::default()
            .serve("/virtual/r", &manifest("r", "1.0.0", &["a", "b"]))
            .serve("/virtual/a", &manifest("a", "1.0.0", &["c"]))
            .serve("/virtual/b", &manifest("b", "1.0.0", &["c>=2.0.0"]))
            .serve("/virtual/c", &manifest("c", "1.5.0", &[]));
        let registry = registry(&[("r", None), ("a", None), ("b", None), ("c", None)]);

        let (kind, message) = kind_of(resolve(&fetcher, &registry, "r"));
        assert_eq!(kind, ResolutionKind::ConstraintViolation);
        assert!(message.contains("b requires c>=2.0.0"));
    }

    #[test]
    fn test_first_requester_constraint_is_checked() {
        let fetcher = MemoryFetcher::default()
            .serve("/virtual/p", &manifest("p", "1.0.0", &["q>=1.0.0"]))
            .serve("/virtual/q", &manifest("q", "0.9.0", &[]));
        let registry = registry(&[("p", None), ("q", None)]);

        let (kind, _) = kind_of(resolve(&fetcher, &registry, "p"));
        assert_eq!(kind, ResolutionKind::ConstraintViolation);
    }

    #[test]
    fn test_registry_entry_constraint_is_checked() {
        let fetcher = MemoryFetcher::default().serve("/virtual/q", &manifest("q", "1.0.0", &[]));
        let registry = registry(&[("q", Some(">=2.0.0"))]);

        let (kind, message) = kind_of(resolve(&fetcher, &registry, "q"));
        assert_eq!(kind, ResolutionKind::ConstraintViolation);
        assert!(message.contains("registry entry"));
    }

    #[test]
    fn test_conflicting_origin() {
        let fetcher = MemoryFetcher::default()
            .serve("/virtual/r", &manifest("r", "1.0.0", &["a", "b"]))
            .serve("/virtual/a", &manifest("a", "1.0.0", &["c"]))
            .serve("/virtual/b", &manifest("b", "1.0.0", &["c@file:///elsewhere/c"]))
            .serve("/virtual/c", &manifest("c", "1.0.0", &[]))
            .serve("/elsewhere/c", &manifest("c", "1.0.0", &[]));
        let registry = registry(&[("r", None), ("a", None), ("b", None), ("c", None)]);

        let (kind, _) = kind_of(resolve(&fetcher, &registry, "r"));
        assert_eq!(kind, ResolutionKind::ConflictingOrigin);
    }

    #[test]
    fn test_explicit_origin_skips_registry() {
        let fetcher = MemoryFetcher::default()
            .serve("/virtual/r", &manifest("r", "1.0.0", &["c@file:///vendored/c"]))
            .serve("/vendored/c", &manifest("c", "3.0.0", &[]));
        // `c` is deliberately absent from the registry
        let registry = registry(&[("r", None)]);

        let plan = resolve(&fetcher, &registry, "r").unwrap();
        assert_eq!(plan.names(), ["c", "r"]);
        assert_eq!(plan.steps[0].location, Location::Path(PathBuf::from("/vendored/c")));
        assert_eq!(fetcher.fetched(), ["/virtual/r", "/vendored/c"]);
    }

    #[test]
    fn test_relative_origin_follows_requester() {
        let fetcher = MemoryFetcher::default()
            .serve("/virtual/r", &manifest("r", "1.0.0", &["c@./shared/c"]))
            .serve("/virtual/shared/c", &manifest("c", "1.0.0", &[]));
        let registry = registry(&[("r", None)]);

        let plan = resolve(&fetcher, &registry, "r").unwrap();
        assert_eq!(plan.names(), ["c", "r"]);
    }

    #[test]
    fn test_unknown_plugin() {
        let fetcher = MemoryFetcher::default().serve("/virtual/r", &manifest("r", "1.0.0", &["ghost"]));
        let registry = registry(&[("r", None)]);

        let (kind, _) = kind_of(resolve(&fetcher, &registry, "r"));
        assert_eq!(kind, ResolutionKind::UnknownPlugin);
    }

    #[test]
    fn test_name_mismatch() {
        let fetcher = MemoryFetcher::default().serve("/virtual/a", &manifest("impostor", "1.0.0", &[]));
        let registry = registry(&[("a", None)]);

        let (kind, _) = kind_of(resolve(&fetcher, &registry, "a"));
        assert_eq!(kind, ResolutionKind::NameMismatch);
    }

    #[test]
    fn test_pinned_source_with_constraint_is_rejected() {
        let fetcher = MemoryFetcher::default()
            .serve("/virtual/r", &manifest("r", "1.0.0", &["c>=1.0.0@file:///vendored/c"]))
            .serve("/vendored/c", &manifest("c", "1.0.0", &[]));
        let registry = registry(&[("r", None)]);

        let (kind, _) = kind_of(resolve(&fetcher, &registry, "r"));
        assert_eq!(kind, ResolutionKind::PinnedConstraint);
        assert_eq!(fetcher.fetched(), ["/virtual/r"]);
    }

    #[test]
    fn test_fetch_error_surfaces() {
        let fetcher = MemoryFetcher::default().serve("/virtual/r", &manifest("r", "1.0.0", &["gone"]));
        let registry = registry(&[("r", None), ("gone", None)]);

        let err = resolve(&fetcher, &registry, "r").unwrap_err();
        assert!(matches!(err, PlugError::Fetch { transient: false, .. }));
    }
}
