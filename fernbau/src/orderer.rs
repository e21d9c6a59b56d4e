//! Build ordering policy
//!
//! Turns a change set into a [`BuildPlan`]: the changed sources are expanded
//! through the dependency graph to everything that depends on them, then
//! ordered so that dependencies come first. Ties are broken by object type
//! precedence and then by discovery order (new objects, changed sources,
//! closure additions).

use std::collections::{BTreeMap, HashMap, HashSet};

use fernbau_graph::DependencyGraph;
use tracing::{debug, info, warn};

use crate::changes::{ChangeSet, object_type};
use crate::plan::{BuildPlan, BuildTarget};

/// Configurable total order over object types.
///
/// Listed types rank in list order; every other type ranks after them.
#[derive(Debug, Clone, Default)]
pub struct ObjectTypePrecedence {
    ranks: HashMap<String, usize>,
}

impl ObjectTypePrecedence {
    pub fn new(order: &[String]) -> Self {
        let mut ranks = HashMap::new();
        for (rank, object_type) in order.iter().enumerate() {
            let _ = ranks.entry(object_type.to_lowercase()).or_insert(rank);
        }
        Self { ranks }
    }

    pub fn rank(&self, object_type: &str) -> usize {
        self.ranks
            .get(object_type)
            .copied()
            .unwrap_or(self.ranks.len())
    }
}

/// Sources and command overrides left out of a rerun
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Exclusions {
    pub sources: HashSet<String>,
    /// Source -> command overrides that must not run
    pub commands: HashMap<String, HashSet<String>>,
}

impl Exclusions {
    pub fn is_empty(&self) -> bool {
        self.sources.is_empty() && self.commands.is_empty()
    }

    pub fn excludes(&self, source: &str, command: Option<&str>) -> bool {
        if self.sources.contains(source) {
            return true;
        }
        match (self.commands.get(source), command) {
            (Some(ignored), Some(command)) => ignored.contains(command),
            _ => false,
        }
    }
}

/// A plan together with what had to be dropped or forced to produce it
#[derive(Debug, Clone)]
pub struct OrderedPlan {
    pub plan: BuildPlan,
    /// Cycles broken by discovery order
    pub cycles: Vec<Vec<String>>,
    /// Dependents that do not exist on disk
    pub missing: Vec<String>,
    /// Targets removed by exclusions
    pub excluded: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct BuildOrderer {
    precedence: ObjectTypePrecedence,
    commands: BTreeMap<String, String>,
}

impl BuildOrderer {
    pub fn new(precedence: ObjectTypePrecedence, commands: BTreeMap<String, String>) -> Self {
        Self {
            precedence,
            commands,
        }
    }

    /// Build the ordered plan for `changes`.
    ///
    /// `fingerprint` yields the current fingerprint of a source, or `None`
    /// when it is not on disk. Every target is fingerprinted here, closure
    /// additions included, so the table records the content that was
    /// planned.
    pub fn plan<F>(
        &self,
        changes: &ChangeSet,
        graph: &DependencyGraph<String>,
        fingerprint: F,
        exclusions: &Exclusions,
    ) -> OrderedPlan
    where
        F: Fn(&str) -> Option<String>,
    {
        let seeds: HashSet<&String> = changes.sources().collect();
        let closure = graph.forward_closure(changes.sources());
        debug!(
            "Closure of {} changed sources has {} members",
            seeds.len(),
            closure.len()
        );
        self.assemble(closure, &seeds, graph, fingerprint, exclusions)
    }

    /// Plan the targets of `previous` that did not build successfully.
    ///
    /// The closure is not expanded again; targets that vanished from disk
    /// are skipped.
    pub fn replan<F>(
        &self,
        previous: &BuildPlan,
        graph: &DependencyGraph<String>,
        fingerprint: F,
        exclusions: &Exclusions,
    ) -> OrderedPlan
    where
        F: Fn(&str) -> Option<String>,
    {
        let members: Vec<String> = previous.unfinished().map(|t| t.source.clone()).collect();
        debug!(
            "{} of {} previous targets are unfinished",
            members.len(),
            previous.targets.len()
        );
        self.assemble(members, &HashSet::new(), graph, fingerprint, exclusions)
    }

    fn assemble<F>(
        &self,
        members: Vec<String>,
        required: &HashSet<&String>,
        graph: &DependencyGraph<String>,
        fingerprint: F,
        exclusions: &Exclusions,
    ) -> OrderedPlan
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut missing = Vec::new();
        let mut excluded = Vec::new();
        let mut fingerprints = HashMap::with_capacity(members.len());
        let mut candidates = Vec::with_capacity(members.len());
        for source in members {
            let current = fingerprint(&source);
            if current.is_none() && !required.contains(&source) {
                warn!("Skipping {}: file does not exist", source);
                missing.push(source);
                continue;
            }
            let command = self.commands.get(&source).map(String::as_str);
            if exclusions.excludes(&source, command) {
                debug!("Excluding {} from plan", source);
                excluded.push(source);
                continue;
            }
            if let Some(current) = current {
                let _ = fingerprints.insert(source.clone(), current);
            }
            candidates.push(source);
        }

        let order = graph.order(&candidates, |source| {
            self.precedence
                .rank(&object_type(source).unwrap_or_default())
        });
        for cycle in &order.cycles {
            warn!(
                "Dependency cycle {}; building in discovery order",
                cycle.join(" -> ")
            );
        }

        let targets = order
            .targets
            .into_iter()
            .map(|source| BuildTarget {
                object_type: object_type(&source).unwrap_or_default(),
                fingerprint: fingerprints.remove(&source),
                command: self.commands.get(&source).cloned(),
                status: None,
                source,
            })
            .collect::<Vec<_>>();

        info!("Planned {} targets", targets.len());
        OrderedPlan {
            plan: BuildPlan::new(targets),
            cycles: order.cycles,
            missing,
            excluded,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::BuildStatus;

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    fn changes(new: &[&str], changed: &[&str]) -> ChangeSet {
        ChangeSet {
            new_objects: strings(new),
            changed_sources: strings(changed),
            stale_objects: Vec::new(),
        }
    }

    fn sources(plan: &OrderedPlan) -> Vec<&str> {
        plan.plan.sources().collect()
    }

    fn on_disk(source: &str) -> Option<String> {
        Some(format!("fp-{source}"))
    }

    fn orderer(precedence: &[&str]) -> BuildOrderer {
        BuildOrderer::new(ObjectTypePrecedence::new(&strings(precedence)), BTreeMap::new())
    }

    #[test]
    fn test_precedence_ranks() {
        let precedence = ObjectTypePrecedence::new(&strings(&["sql", "h"]));
        assert_eq!(precedence.rank("sql"), 0);
        assert_eq!(precedence.rank("h"), 1);
        assert_eq!(precedence.rank("c"), 2);
        assert_eq!(precedence.rank("cpp"), 2);
    }

    #[test]
    fn test_first_build_orders_all_sources() {
        let graph = DependencyGraph::from_declared([("b.c".to_string(), strings(&["a.c"]))]);
        let plan = orderer(&[]).plan(
            &changes(&["a.c", "b.c"], &[]),
            &graph,
            on_disk,
            &Exclusions::default(),
        );
        assert_eq!(sources(&plan), vec!["a.c", "b.c"]);
    }

    #[test]
    fn test_change_propagates_to_dependents() {
        let graph = DependencyGraph::from_declared([("b.c".to_string(), strings(&["a.c"]))]);

        let plan = orderer(&[]).plan(
            &changes(&[], &["a.c"]),
            &graph,
            on_disk,
            &Exclusions::default(),
        );

        assert_eq!(sources(&plan), vec!["a.c", "b.c"]);
        assert_eq!(plan.plan.targets[0].fingerprint.as_deref(), Some("fp-a.c"));
        assert_eq!(plan.plan.targets[1].fingerprint.as_deref(), Some("fp-b.c"));
    }

    #[test]
    fn test_leaf_change_builds_only_itself() {
        let graph = DependencyGraph::from_declared([("b.c".to_string(), strings(&["a.c"]))]);
        let plan = orderer(&[]).plan(
            &changes(&[], &["b.c"]),
            &graph,
            on_disk,
            &Exclusions::default(),
        );
        assert_eq!(sources(&plan), vec!["b.c"]);
    }

    #[test]
    fn test_precedence_breaks_ties() {
        let graph = DependencyGraph::new();
        let plan = orderer(&["sql"]).plan(
            &changes(&["main.c", "orders.sql"], &["util.c"]),
            &graph,
            on_disk,
            &Exclusions::default(),
        );
        assert_eq!(sources(&plan), vec!["orders.sql", "main.c", "util.c"]);
    }

    #[test]
    fn test_missing_dependents_are_skipped() {
        let graph = DependencyGraph::from_declared([("gone.c".to_string(), strings(&["a.c"]))]);
        let plan = orderer(&[]).plan(
            &changes(&[], &["a.c"]),
            &graph,
            |source| if source == "gone.c" { None } else { on_disk(source) },
            &Exclusions::default(),
        );
        assert_eq!(sources(&plan), vec!["a.c"]);
        assert_eq!(plan.missing, vec!["gone.c"]);
    }

    #[test]
    fn test_exclusions_remove_sources_and_commands() {
        let graph = DependencyGraph::from_declared([
            ("b.c".to_string(), strings(&["a.c"])),
            ("c.sql".to_string(), strings(&["a.c"])),
        ]);
        let mut commands = BTreeMap::new();
        let _ = commands.insert("c.sql".to_string(), "runsql c".to_string());
        let orderer = BuildOrderer::new(ObjectTypePrecedence::default(), commands);

        let mut exclusions = Exclusions::default();
        let _ = exclusions.sources.insert("b.c".to_string());
        let _ = exclusions
            .commands
            .entry("c.sql".to_string())
            .or_default()
            .insert("runsql c".to_string());

        let plan = orderer.plan(
            &changes(&[], &["a.c"]),
            &graph,
            on_disk,
            &exclusions,
        );
        assert_eq!(sources(&plan), vec!["a.c"]);
        assert_eq!(plan.excluded, vec!["b.c", "c.sql"]);
    }

    #[test]
    fn test_command_overrides_are_attached() {
        let mut commands = BTreeMap::new();
        let _ = commands.insert("a.c".to_string(), "cc -O2 a.c".to_string());
        let orderer = BuildOrderer::new(ObjectTypePrecedence::default(), commands);
        let plan = orderer.plan(
            &changes(&["a.c"], &[]),
            &DependencyGraph::new(),
            on_disk,
            &Exclusions::default(),
        );
        assert_eq!(plan.plan.targets[0].command.as_deref(), Some("cc -O2 a.c"));
        assert_eq!(plan.plan.targets[0].object_type, "c");
    }

    #[test]
    #[tracing_test::traced_test]
    fn test_cycles_are_reported() {
        let graph = DependencyGraph::from_declared([
            ("a.c".to_string(), strings(&["b.c"])),
            ("b.c".to_string(), strings(&["a.c"])),
        ]);
        let plan = orderer(&[]).plan(
            &changes(&[], &["a.c"]),
            &graph,
            on_disk,
            &Exclusions::default(),
        );
        assert_eq!(sources(&plan), vec!["a.c", "b.c"]);
        assert_eq!(plan.cycles.len(), 1);
        assert!(logs_contain("Dependency cycle a.c -> b.c"));
    }

    #[test]
    fn test_replan_keeps_unfinished_targets_only() {
        let graph = DependencyGraph::from_declared([
            ("b.c".to_string(), strings(&["a.c"])),
            ("c.c".to_string(), strings(&["b.c"])),
        ]);
        let mut previous = orderer(&[])
            .plan(&changes(&[], &["a.c"]), &graph, on_disk, &Exclusions::default())
            .plan;
        previous.targets[0].status = Some(BuildStatus::Success);
        previous.targets[1].status = Some(BuildStatus::Failure);

        let mut exclusions = Exclusions::default();
        let _ = exclusions.sources.insert("c.c".to_string());
        let plan = orderer(&[]).replan(&previous, &graph, on_disk, &exclusions);

        assert_eq!(sources(&plan), vec!["b.c"]);
        assert_eq!(plan.excluded, vec!["c.c"]);
        assert_eq!(plan.plan.targets[0].status, None);
        assert_eq!(plan.plan.targets[0].fingerprint.as_deref(), Some("fp-b.c"));
    }

    #[test]
    fn test_replan_skips_vanished_targets() {
        let mut previous = orderer(&[])
            .plan(
                &changes(&["a.c", "b.c"], &[]),
                &DependencyGraph::new(),
                on_disk,
                &Exclusions::default(),
            )
            .plan;
        previous.targets[0].status = Some(BuildStatus::Failure);

        let plan = orderer(&[]).replan(
            &previous,
            &DependencyGraph::new(),
            |source| if source == "a.c" { None } else { on_disk(source) },
            &Exclusions::default(),
        );
        assert_eq!(sources(&plan), vec!["b.c"]);
        assert_eq!(plan.missing, vec!["a.c"]);
    }
}
