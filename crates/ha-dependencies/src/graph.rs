//! Dependency edge storage and traversal

use std::collections::HashSet;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use ha_core::{AutomationDependency, AutomationIdentity, LifecycleError, LifecycleResult};
use ha_storage::{Storable, Storage, StorageResult};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Storage key for the dependency snapshot
pub const STORAGE_KEY: &str = "automation_lifecycle.dependencies";
/// Current storage version
pub const STORAGE_VERSION: u32 = 1;
/// Current minor version
pub const STORAGE_MINOR_VERSION: u32 = 1;

const DEFAULT_MAX_DEPTH: usize = 16;
const DEFAULT_TRAVERSAL_BUDGET: Duration = Duration::from_millis(250);

/// Persisted form of the graph
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DependencySnapshot {
    pub dependencies: Vec<AutomationDependency>,
}

impl Storable for DependencySnapshot {
    const KEY: &'static str = STORAGE_KEY;
    const VERSION: u32 = STORAGE_VERSION;
    const MINOR_VERSION: u32 = STORAGE_MINOR_VERSION;
}

/// Everything that would break if an automation disappeared
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockingDependents {
    /// Edges into the dependent closure, in discovery order
    pub dependency_ids: Vec<String>,
    /// Direct and transitive dependents, in discovery order
    pub automation_ids: Vec<String>,
}

impl BlockingDependents {
    pub fn is_empty(&self) -> bool {
        self.dependency_ids.is_empty()
    }
}

/// Report produced by [`DependencyGraph::analyze_dependencies`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyAnalysis {
    pub automation_id: String,
    pub connection_id: String,
    pub direct_dependents: Vec<String>,
    /// Dependents reachable only through another dependent
    pub transitive_dependents: Vec<String>,
    /// Edge counts per dependency type
    pub by_type: IndexMap<String, usize>,
    /// Each cycle as a closed path, e.g. `[a, b, a]`
    pub cycles: Vec<Vec<String>>,
    pub warnings: Vec<String>,
    /// The depth or time budget stopped the walk early
    pub truncated: bool,
}

/// Outcome of checking whether an automation may be retired
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetirementResolution {
    pub can_proceed: bool,
    pub blocking_dependency_ids: Vec<String>,
    pub blocking_automation_ids: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stop {
    Depth,
    Budget,
}

#[derive(Default)]
struct Traversal {
    edges: Vec<AutomationDependency>,
    /// (automation_id, distance from the root)
    dependents: Vec<(String, usize)>,
    stopped: Option<Stop>,
}

/// Directed graph of automation dependencies
pub struct DependencyGraph {
    /// Primary index: dependency_id -> edge
    edges: DashMap<String, AutomationDependency>,
    /// Index: source automation -> outgoing edge ids
    by_source: DashMap<AutomationIdentity, Vec<String>>,
    /// Index: target automation -> incoming edge ids
    by_target: DashMap<AutomationIdentity, Vec<String>>,
    max_depth: usize,
    traversal_budget: Duration,
}

impl Default for DependencyGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self {
            edges: DashMap::new(),
            by_source: DashMap::new(),
            by_target: DashMap::new(),
            max_depth: DEFAULT_MAX_DEPTH,
            traversal_budget: DEFAULT_TRAVERSAL_BUDGET,
        }
    }

    /// Override the traversal budgets
    pub fn with_limits(mut self, max_depth: usize, traversal_budget: Duration) -> Self {
        self.max_depth = max_depth;
        self.traversal_budget = traversal_budget;
        self
    }

    /// Record that `source` depends on `target`
    ///
    /// An identical edge (same pair and type) is returned instead of being
    /// duplicated.
    pub fn add_dependency(
        &self,
        source_automation_id: &str,
        target_automation_id: &str,
        connection_id: &str,
        dependency_type: &str,
    ) -> LifecycleResult<AutomationDependency> {
        let edge = AutomationDependency::new(
            source_automation_id,
            target_automation_id,
            connection_id,
            dependency_type,
        );
        if edge.is_self_reference() {
            return Err(LifecycleError::violation(
                "self_dependency",
                format!("automation {} cannot depend on itself", source_automation_id),
            ));
        }

        let source = AutomationIdentity::new(source_automation_id, connection_id);
        let mut outgoing = self.by_source.entry(source).or_default();
        let existing = outgoing.iter().find_map(|id| {
            self.edges
                .get(id)
                .filter(|e| {
                    e.target_automation_id == target_automation_id
                        && e.dependency_type == dependency_type
                })
                .map(|e| e.value().clone())
        });
        if let Some(existing) = existing {
            debug!(dependency = %existing, "Dependency already recorded");
            return Ok(existing);
        }

        outgoing.push(edge.dependency_id.clone());
        self.edges.insert(edge.dependency_id.clone(), edge.clone());
        self.by_target
            .entry(AutomationIdentity::new(target_automation_id, connection_id))
            .or_default()
            .push(edge.dependency_id.clone());
        drop(outgoing);

        info!(
            dependency_id = %edge.dependency_id,
            connection_id,
            "Added dependency {}",
            edge
        );
        Ok(edge)
    }

    /// Sever one edge
    pub fn remove_dependency(
        &self,
        dependency_id: &str,
        connection_id: &str,
    ) -> LifecycleResult<AutomationDependency> {
        match self.edges.get(dependency_id) {
            None => return Err(LifecycleError::not_found("dependency", dependency_id)),
            Some(edge) if edge.connection_id != connection_id => {
                return Err(LifecycleError::cross_tenant(
                    "dependency",
                    dependency_id,
                    connection_id,
                ))
            }
            Some(_) => {}
        }

        let (_, edge) = self
            .edges
            .remove(dependency_id)
            .ok_or_else(|| LifecycleError::not_found("dependency", dependency_id))?;
        let source = AutomationIdentity::new(&edge.source_automation_id, connection_id);
        if let Some(mut ids) = self.by_source.get_mut(&source) {
            ids.retain(|id| id != dependency_id);
        }
        let target = AutomationIdentity::new(&edge.target_automation_id, connection_id);
        if let Some(mut ids) = self.by_target.get_mut(&target) {
            ids.retain(|id| id != dependency_id);
        }
        self.by_source.remove_if(&source, |_, ids| ids.is_empty());
        self.by_target.remove_if(&target, |_, ids| ids.is_empty());

        info!(dependency_id, connection_id, "Removed dependency {}", edge);
        Ok(edge)
    }

    pub fn get(&self, dependency_id: &str) -> Option<AutomationDependency> {
        self.edges.get(dependency_id).map(|r| r.value().clone())
    }

    fn resolve(
        &self,
        index: &DashMap<AutomationIdentity, Vec<String>>,
        key: &AutomationIdentity,
    ) -> Vec<AutomationDependency> {
        index
            .get(key)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| self.edges.get(id).map(|r| r.value().clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Edges going out of an automation: what it depends on
    pub fn dependencies_of(
        &self,
        automation_id: &str,
        connection_id: &str,
    ) -> Vec<AutomationDependency> {
        self.resolve(
            &self.by_source,
            &AutomationIdentity::new(automation_id, connection_id),
        )
    }

    /// Edges coming into an automation: who depends on it
    pub fn dependents_of(
        &self,
        automation_id: &str,
        connection_id: &str,
    ) -> Vec<AutomationDependency> {
        self.resolve(
            &self.by_target,
            &AutomationIdentity::new(automation_id, connection_id),
        )
    }

    /// Breadth-first walk over reverse edges from `automation_id`
    fn traverse(&self, automation_id: &str, connection_id: &str) -> Traversal {
        let started = Instant::now();
        let mut traversal = Traversal::default();
        let mut visited: HashSet<String> = HashSet::from([automation_id.to_string()]);
        let mut frontier = vec![automation_id.to_string()];
        let mut depth = 0;

        while !frontier.is_empty() {
            if started.elapsed() > self.traversal_budget {
                traversal.stopped = Some(Stop::Budget);
                break;
            }

            let mut next = Vec::new();
            let mut level_edges = Vec::new();
            for node in &frontier {
                for edge in self.dependents_of(node, connection_id) {
                    // The root depending on its own dependents is a cycle, not a blocker
                    if edge.source_automation_id == automation_id {
                        continue;
                    }
                    if visited.insert(edge.source_automation_id.clone()) {
                        next.push(edge.source_automation_id.clone());
                    }
                    level_edges.push(edge);
                }
            }

            if depth >= self.max_depth && !next.is_empty() {
                traversal.stopped = Some(Stop::Depth);
                break;
            }

            depth += 1;
            traversal.edges.extend(level_edges);
            traversal
                .dependents
                .extend(next.iter().map(|id| (id.clone(), depth)));
            frontier = next;
        }

        traversal
    }

    /// Direct and transitive dependents of an automation
    ///
    /// Fails with `Timeout` when the dependent closure is deeper than the
    /// depth budget or the walk outlives the time budget.
    pub fn build(
        &self,
        automation_id: &str,
        connection_id: &str,
    ) -> LifecycleResult<BlockingDependents> {
        let traversal = self.traverse(automation_id, connection_id);
        match traversal.stopped {
            Some(Stop::Depth) => {
                warn!(
                    automation_id,
                    max_depth = self.max_depth,
                    "Dependency traversal exceeded depth budget"
                );
                return Err(LifecycleError::timeout(
                    format!("dependency traversal (depth {})", self.max_depth),
                    self.traversal_budget.as_millis() as u64,
                ));
            }
            Some(Stop::Budget) => {
                warn!(automation_id, "Dependency traversal exceeded time budget");
                return Err(LifecycleError::timeout(
                    "dependency traversal",
                    self.traversal_budget.as_millis() as u64,
                ));
            }
            None => {}
        }

        Ok(BlockingDependents {
            dependency_ids: traversal
                .edges
                .into_iter()
                .map(|e| e.dependency_id)
                .collect(),
            automation_ids: traversal.dependents.into_iter().map(|(id, _)| id).collect(),
        })
    }

    /// Dependents with a per-type breakdown and cycle warnings
    ///
    /// Never fails: budget overruns set `truncated` and cycles are reported
    /// as warnings.
    pub fn analyze_dependencies(
        &self,
        automation_id: &str,
        connection_id: &str,
    ) -> DependencyAnalysis {
        let traversal = self.traverse(automation_id, connection_id);
        let mut analysis = DependencyAnalysis {
            automation_id: automation_id.to_string(),
            connection_id: connection_id.to_string(),
            truncated: traversal.stopped.is_some(),
            ..Default::default()
        };

        for (id, distance) in &traversal.dependents {
            if *distance == 1 {
                analysis.direct_dependents.push(id.clone());
            } else {
                analysis.transitive_dependents.push(id.clone());
            }
        }
        for edge in &traversal.edges {
            *analysis
                .by_type
                .entry(edge.dependency_type.clone())
                .or_insert(0) += 1;
        }

        let mut scope: HashSet<String> = traversal
            .dependents
            .iter()
            .map(|(id, _)| id.clone())
            .collect();
        scope.insert(automation_id.to_string());
        analysis.cycles = self.find_cycles(automation_id, connection_id, &scope);

        for cycle in &analysis.cycles {
            let warning = format!("dependency cycle detected: {}", cycle.join(" -> "));
            warn!(automation_id, connection_id, "{}", warning);
            analysis.warnings.push(warning);
        }
        match traversal.stopped {
            Some(Stop::Depth) => analysis.warnings.push(format!(
                "dependents deeper than {} levels were not analyzed",
                self.max_depth
            )),
            Some(Stop::Budget) => analysis.warnings.push(format!(
                "analysis stopped after {}ms",
                self.traversal_budget.as_millis()
            )),
            None => {}
        }

        analysis
    }

    /// Depth-first search for cycles among `scope`, following reverse edges
    fn find_cycles(
        &self,
        root: &str,
        connection_id: &str,
        scope: &HashSet<String>,
    ) -> Vec<Vec<String>> {
        let mut cycles = Vec::new();
        let mut path = Vec::new();
        let mut done = HashSet::new();
        self.visit(root, connection_id, scope, &mut path, &mut done, &mut cycles);
        cycles
    }

    fn visit(
        &self,
        node: &str,
        connection_id: &str,
        scope: &HashSet<String>,
        path: &mut Vec<String>,
        done: &mut HashSet<String>,
        cycles: &mut Vec<Vec<String>>,
    ) {
        path.push(node.to_string());
        let mut seen = HashSet::new();
        for edge in self.dependents_of(node, connection_id) {
            let next = edge.source_automation_id;
            if !scope.contains(&next) || !seen.insert(next.clone()) {
                continue;
            }
            if let Some(start) = path.iter().position(|p| *p == next) {
                let mut cycle = path[start..].to_vec();
                cycle.push(next);
                cycles.push(cycle);
            } else if !done.contains(&next) {
                self.visit(&next, connection_id, scope, path, done, cycles);
            }
        }
        path.pop();
        done.insert(node.to_string());
    }

    /// Decide whether an automation may be retired
    ///
    /// Forcing lets the retirement proceed but still reports every blocking
    /// edge. No edge is ever removed here.
    pub fn resolve_for_retirement(
        &self,
        automation_id: &str,
        connection_id: &str,
        force: bool,
    ) -> LifecycleResult<RetirementResolution> {
        let blocking = self.build(automation_id, connection_id)?;
        let can_proceed = blocking.is_empty() || force;
        debug!(
            automation_id,
            blocking = blocking.dependency_ids.len(),
            force,
            can_proceed,
            "Resolved retirement dependencies"
        );
        Ok(RetirementResolution {
            can_proceed,
            blocking_dependency_ids: blocking.dependency_ids,
            blocking_automation_ids: blocking.automation_ids,
        })
    }

    pub fn len(&self) -> usize {
        self.edges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }

    pub fn export_snapshot(&self) -> DependencySnapshot {
        let mut dependencies: Vec<AutomationDependency> =
            self.edges.iter().map(|r| r.value().clone()).collect();
        dependencies.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        DependencySnapshot { dependencies }
    }

    /// Merge a snapshot; self-edges and known ids are skipped
    pub fn import_snapshot(&self, snapshot: DependencySnapshot) -> usize {
        let mut imported = 0;
        for edge in snapshot.dependencies {
            if edge.is_self_reference() || self.edges.contains_key(&edge.dependency_id) {
                warn!(dependency_id = %edge.dependency_id, "Skipping dependency on import");
                continue;
            }
            self.by_source
                .entry(AutomationIdentity::new(
                    &edge.source_automation_id,
                    &edge.connection_id,
                ))
                .or_default()
                .push(edge.dependency_id.clone());
            self.by_target
                .entry(AutomationIdentity::new(
                    &edge.target_automation_id,
                    &edge.connection_id,
                ))
                .or_default()
                .push(edge.dependency_id.clone());
            self.edges.insert(edge.dependency_id.clone(), edge);
            imported += 1;
        }
        imported
    }

    pub async fn save(&self, storage: &Storage) -> StorageResult<()> {
        storage.save(&self.export_snapshot()).await?;
        debug!("Saved {} dependencies to storage", self.len());
        Ok(())
    }

    pub async fn load(&self, storage: &Storage) -> StorageResult<usize> {
        let Some(snapshot) = storage.load::<DependencySnapshot>().await? else {
            return Ok(0);
        };
        let imported = self.import_snapshot(snapshot);
        info!("Loaded {} dependencies from storage", imported);
        Ok(imported)
    }
}
