//! Change planner - diffs declarations against recorded state
//!
//! Planning is pure: the same declarations, graph, state and drift report
//! always produce the same plan.

use crate::error::{Error, Result};
use crate::graph::Graph;
use crate::provider::{Provider, ProviderError};
use crate::schema::Registry;
use crate::state::{ResourceState, StateFile};
use crate::types::{Address, Attributes, DeclarationSet, Reference, ResourceDeclaration};
use rayon::prelude::*;
use serde::Serialize;
use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap, HashMap, HashSet};
use std::fmt;

/// What a plan entry will do
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeAction {
    Create,
    Update,
    Delete,
    NoOp,
    /// Recorded but gone remotely; needs a [`DriftResolution`]
    Drifted,
    /// Drop from state without calling the provider
    Forget,
}

impl ChangeAction {
    /// Whether applying this entry does anything
    pub fn is_change(&self) -> bool {
        !matches!(self, Self::NoOp)
    }

    pub fn symbol(&self) -> &'static str {
        match self {
            Self::Create => "+",
            Self::Update => "~",
            Self::Delete => "-",
            Self::NoOp => " ",
            Self::Drifted => "!",
            Self::Forget => "x",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::NoOp => "no-op",
            Self::Drifted => "drifted",
            Self::Forget => "forget",
        }
    }
}

impl fmt::Display for ChangeAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// How to resolve a drifted entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriftResolution {
    /// Create the resource again and replace its state entry
    Recreate,
    /// Drop the state entry and leave the resource alone
    Forget,
}

/// One step of a plan
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChangePlanEntry {
    pub action: ChangeAction,
    pub address: Address,
    /// Recorded identity, when the resource is in state
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identity: Option<String>,
    /// Last-applied attributes
    #[serde(skip_serializing_if = "Option::is_none")]
    pub before: Option<Attributes>,
    /// Desired attributes; unresolved references are known after apply
    #[serde(skip_serializing_if = "Option::is_none")]
    pub after: Option<Attributes>,
    /// Attributes that differ between `before` and `after`
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub changed: Vec<String>,
    /// Declared dependencies, or recorded ones for deletes
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<String>,
}

impl ChangePlanEntry {
    pub fn name(&self) -> &str {
        &self.address.name
    }

    pub fn kind(&self) -> &str {
        &self.address.kind
    }

    fn removal(action: ChangeAction, existing: &ResourceState) -> Self {
        Self {
            action,
            address: existing.address(),
            identity: Some(existing.identity.clone()),
            before: Some(existing.attributes.clone()),
            after: None,
            changed: Vec::new(),
            dependencies: existing.dependencies.clone(),
        }
    }
}

/// Counts of plan entries by action
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PlanSummary {
    pub create: usize,
    pub update: usize,
    pub delete: usize,
    pub no_op: usize,
    pub drifted: usize,
    pub forget: usize,
}

impl PlanSummary {
    pub fn total_changes(&self) -> usize {
        self.create + self.update + self.delete + self.drifted + self.forget
    }
}

impl fmt::Display for PlanSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} to create, {} to update, {} to delete",
            self.create, self.update, self.delete
        )?;
        if self.forget > 0 {
            write!(f, ", {} to forget", self.forget)?;
        }
        if self.drifted > 0 {
            write!(f, ", {} drifted", self.drifted)?;
        }
        Ok(())
    }
}

/// An ordered change plan
///
/// Creates, updates and no-ops come first in dependency order; deletes and
/// forgets follow in reverse dependency order.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Plan {
    entries: Vec<ChangePlanEntry>,
}

impl Plan {
    pub fn entries(&self) -> &[ChangePlanEntry] {
        &self.entries
    }

    pub fn into_entries(self) -> Vec<ChangePlanEntry> {
        self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries for a logical name (two when a resource is replaced)
    pub fn entries_for<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a ChangePlanEntry> {
        self.entries.iter().filter(move |e| e.name() == name)
    }

    pub fn summary(&self) -> PlanSummary {
        let mut summary = PlanSummary::default();
        for entry in &self.entries {
            match entry.action {
                ChangeAction::Create => summary.create += 1,
                ChangeAction::Update => summary.update += 1,
                ChangeAction::Delete => summary.delete += 1,
                ChangeAction::NoOp => summary.no_op += 1,
                ChangeAction::Drifted => summary.drifted += 1,
                ChangeAction::Forget => summary.forget += 1,
            }
        }
        summary
    }

    pub fn has_changes(&self) -> bool {
        self.entries.iter().any(|e| e.action.is_change())
    }

    /// Names of drifted entries still waiting for a resolution
    pub fn unresolved_drift(&self) -> Vec<String> {
        self.entries
            .iter()
            .filter(|e| e.action == ChangeAction::Drifted)
            .map(|e| e.name().to_string())
            .collect()
    }

    /// Resolve one drifted entry; returns `false` if `name` is not drifted
    pub fn resolve_drift(&mut self, name: &str, resolution: DriftResolution) -> bool {
        let Some(entry) = self
            .entries
            .iter_mut()
            .find(|e| e.action == ChangeAction::Drifted && e.name() == name)
        else {
            return false;
        };

        match resolution {
            DriftResolution::Recreate => {
                entry.action = ChangeAction::Create;
                entry.changed = entry
                    .after
                    .as_ref()
                    .map(|a| a.keys().cloned().collect())
                    .unwrap_or_default();
            }
            DriftResolution::Forget => {
                entry.action = ChangeAction::Forget;
                entry.after = None;
                entry.changed.clear();
            }
        }
        log::debug!("Resolved drift of {} as {:?}", entry.address, resolution);
        true
    }

    /// Resolve every drifted entry the same way
    pub fn resolve_all_drift(&mut self, resolution: DriftResolution) {
        for name in self.unresolved_drift() {
            self.resolve_drift(&name, resolution);
        }
    }
}

// ============================================================================
// Refresh
// ============================================================================

/// Result of reading every recorded resource through the provider
#[derive(Debug, Clone, Default)]
pub struct DriftReport {
    /// Recorded resources the provider no longer knows
    pub drifted: BTreeSet<String>,
    /// Reads that failed for other reasons; these are not treated as drift
    pub errors: Vec<(String, ProviderError)>,
}

impl DriftReport {
    /// A report with no drift, for planning without a refresh
    pub fn none() -> Self {
        Self::default()
    }

    pub fn is_drifted(&self, name: &str) -> bool {
        self.drifted.contains(name)
    }
}

/// Read every recorded resource in parallel and report what has drifted
///
/// State is not modified.
pub fn refresh(state: &StateFile, provider: &dyn Provider, jobs: usize) -> Result<DriftReport> {
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(jobs.max(1))
        .build()
        .map_err(|e| Error::WorkerPool(e.to_string()))?;

    let entries = state.by_serial();
    let results: Vec<(String, std::result::Result<Attributes, ProviderError>)> =
        pool.install(|| {
            entries
                .par_iter()
                .map(|r| (r.name.clone(), provider.read(&r.address(), &r.identity)))
                .collect()
        });

    let mut report = DriftReport::default();
    for (name, result) in results {
        match result {
            Ok(_) => {}
            Err(e) if e.is_not_found() => {
                log::info!("{name} no longer exists remotely");
                report.drifted.insert(name);
            }
            Err(e) => {
                log::warn!("Failed to refresh {name}: {e}");
                report.errors.push((name, e));
            }
        }
    }
    Ok(report)
}

// ============================================================================
// Planning
// ============================================================================

/// Build the change plan for a declaration set
pub fn plan(
    set: &DeclarationSet,
    graph: &Graph,
    registry: &Registry,
    state: &StateFile,
    drift: &DriftReport,
) -> Plan {
    let mut entries = Vec::with_capacity(set.len() + state.len());
    let mut removals: Vec<ChangePlanEntry> = Vec::new();
    // Names whose identity is unknown until apply
    let mut pending: HashSet<&str> = HashSet::new();

    for name in graph.order() {
        let Some(decl) = set.get(name) else {
            continue;
        };
        let dependencies = graph.dependencies(name);
        let desired = resolve_desired(decl, state, &pending);

        let entry = match state.get(name) {
            None => {
                pending.insert(decl.name());
                creation(decl, desired, dependencies)
            }
            Some(existing) if existing.kind != decl.kind() => {
                log::debug!("{} changes kind from {}, replacing", decl.address, existing.kind);
                removals.push(ChangePlanEntry::removal(ChangeAction::Delete, existing));
                pending.insert(decl.name());
                creation(decl, desired, dependencies)
            }
            Some(existing) if drift.is_drifted(name) => {
                pending.insert(decl.name());
                ChangePlanEntry {
                    action: ChangeAction::Drifted,
                    address: decl.address.clone(),
                    identity: Some(existing.identity.clone()),
                    before: Some(existing.attributes.clone()),
                    after: Some(desired),
                    changed: Vec::new(),
                    dependencies,
                }
            }
            Some(existing) => {
                let changed =
                    changed_attributes(registry, decl.kind(), &existing.attributes, &desired);
                let action = if changed.is_empty() {
                    ChangeAction::NoOp
                } else {
                    ChangeAction::Update
                };
                ChangePlanEntry {
                    action,
                    address: decl.address.clone(),
                    identity: Some(existing.identity.clone()),
                    before: Some(existing.attributes.clone()),
                    after: Some(desired),
                    changed,
                    dependencies,
                }
            }
        };
        entries.push(entry);
    }

    for existing in state.iter() {
        if set.contains(&existing.name) {
            continue;
        }
        let action = if drift.is_drifted(&existing.name) {
            ChangeAction::Forget
        } else {
            ChangeAction::Delete
        };
        removals.push(ChangePlanEntry::removal(action, existing));
    }

    entries.extend(order_removals(removals, state));
    Plan { entries }
}

fn creation(
    decl: &ResourceDeclaration,
    desired: Attributes,
    dependencies: Vec<String>,
) -> ChangePlanEntry {
    ChangePlanEntry {
        action: ChangeAction::Create,
        address: decl.address.clone(),
        identity: None,
        before: None,
        changed: desired.keys().cloned().collect(),
        after: Some(desired),
        dependencies,
    }
}

/// Resolve references from state, leaving pending targets as references
fn resolve_desired(
    decl: &ResourceDeclaration,
    state: &StateFile,
    pending: &HashSet<&str>,
) -> Attributes {
    let lookup = |r: &Reference| {
        if pending.contains(r.target.as_str()) {
            None
        } else {
            state.resolve(r)
        }
    };
    decl.attributes
        .iter()
        .map(|(k, v)| (k.clone(), v.resolve_with(&lookup)))
        .collect()
}

/// Attribute names whose desired value differs from the last-applied one
///
/// Computed attributes are ignored. A value still holding a reference is
/// known only after apply and always counts as changed.
fn changed_attributes(
    registry: &Registry,
    kind: &str,
    before: &Attributes,
    after: &Attributes,
) -> Vec<String> {
    let keys: BTreeSet<&String> = before.keys().chain(after.keys()).collect();
    keys.into_iter()
        .filter(|key| !registry.is_computed(kind, key))
        .filter(|key| match (before.get(*key), after.get(*key)) {
            (_, Some(value)) if value.has_reference() => true,
            (old, new) => old != new,
        })
        .cloned()
        .collect()
}

/// Order removals so dependents go before what they depended on
///
/// Ties are broken by reverse creation serial.
fn order_removals(removals: Vec<ChangePlanEntry>, state: &StateFile) -> Vec<ChangePlanEntry> {
    let serial = |name: &str| state.get(name).map_or(0, |r| r.serial);
    // For each removal, how many other removals still depend on it
    let mut blockers: HashMap<&str, usize> = removals.iter().map(|e| (e.name(), 0)).collect();
    for entry in &removals {
        for dep in &entry.dependencies {
            if dep != entry.name()
                && let Some(count) = blockers.get_mut(dep.as_str())
            {
                *count += 1;
            }
        }
    }

    let by_name: HashMap<&str, &ChangePlanEntry> =
        removals.iter().map(|e| (e.name(), e)).collect();
    let mut ready: BinaryHeap<(u64, Reverse<&str>)> = blockers
        .iter()
        .filter(|(_, count)| **count == 0)
        .map(|(name, _)| (serial(*name), Reverse(*name)))
        .collect();

    let mut ordered = Vec::with_capacity(removals.len());
    let mut seen = HashSet::new();
    while let Some((_, Reverse(name))) = ready.pop() {
        let entry = by_name[name];
        seen.insert(name);
        ordered.push(entry.clone());
        for dep in &entry.dependencies {
            if dep != name
                && let Some(count) = blockers.get_mut(dep.as_str())
            {
                *count -= 1;
                if *count == 0 {
                    ready.push((serial(dep), Reverse(dep.as_str())));
                }
            }
        }
    }

    // Recorded dependencies cannot form a cycle unless state was edited by
    // hand; fall back to reverse serial for whatever is left.
    let mut rest: Vec<&ChangePlanEntry> = removals
        .iter()
        .filter(|e| !seen.contains(e.name()))
        .collect();
    rest.sort_by_key(|e| Reverse(serial(e.name())));
    ordered.extend(rest.into_iter().cloned());
    ordered
}

/// Resolve every reference in `attributes` from state
///
/// Used by the applier once dependencies have been applied. Returns the
/// first reference that still cannot be resolved.
pub fn resolve_strict(
    attributes: &Attributes,
    state: &StateFile,
) -> std::result::Result<Attributes, Reference> {
    let mut missing: Option<Reference> = None;
    let resolved: Attributes = attributes
        .iter()
        .map(|(k, v)| {
            let value = v.resolve_with(&|r: &Reference| state.resolve(r));
            if missing.is_none() {
                let mut refs = Vec::new();
                value.collect_references(k, &mut refs);
                missing = refs.first().map(|(_, r)| (*r).clone());
            }
            (k.clone(), value)
        })
        .collect();
    missing.map_or(Ok(resolved), Err)
}
