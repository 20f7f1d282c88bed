//! Progress and drift-resolution traits
//!
//! These traits let the reconciler drive a terminal UI (or nothing at all)
//! without depending on a specific UI crate.

use crate::applier::EntryOutcome;
use crate::planner::{ChangePlanEntry, DriftResolution, Plan};
use crate::provider::ProviderError;
use std::io;
use std::time::Duration;

/// Progress callback for apply operations
///
/// All calls are made from the scheduling thread.
pub trait ProgressCallback: Send {
    /// Called once with the number of entries that will change something
    fn on_apply_start(&mut self, total: usize);

    /// Called when an entry is handed to a worker
    fn on_entry_start(&mut self, entry: &ChangePlanEntry);

    /// Called when a provider call failed transiently and will be retried
    ///
    /// `attempt` is the 1-indexed attempt that just failed.
    fn on_entry_retry(
        &mut self,
        _entry: &ChangePlanEntry,
        _attempt: u32,
        _max_attempts: u32,
        _error: &ProviderError,
        _delay: Duration,
    ) {
    }

    /// Called when an entry reaches its final outcome
    fn on_entry_complete(&mut self, entry: &ChangePlanEntry, outcome: &EntryOutcome);

    /// Called after the last entry
    fn on_apply_complete(&mut self);
}

/// No-op progress callback
pub struct NoProgress;

impl ProgressCallback for NoProgress {
    fn on_apply_start(&mut self, _total: usize) {}
    fn on_entry_start(&mut self, _entry: &ChangePlanEntry) {}
    fn on_entry_complete(&mut self, _entry: &ChangePlanEntry, _outcome: &EntryOutcome) {}
    fn on_apply_complete(&mut self) {}
}

/// Decides what to do with a resource that disappeared remotely
pub trait DriftResolver {
    /// Returning `None` leaves the entry unresolved, which makes apply refuse
    /// the plan.
    fn resolve(&mut self, entry: &ChangePlanEntry) -> io::Result<Option<DriftResolution>>;
}

/// Resolves every drifted entry the same way
pub struct FixedResolution(pub DriftResolution);

impl DriftResolver for FixedResolution {
    fn resolve(&mut self, _entry: &ChangePlanEntry) -> io::Result<Option<DriftResolution>> {
        Ok(Some(self.0))
    }
}

/// Ask `resolver` about every drifted entry of `plan`
///
/// Returns the number of entries resolved.
pub fn resolve_drift(plan: &mut Plan, resolver: &mut dyn DriftResolver) -> io::Result<usize> {
    let drifted: Vec<ChangePlanEntry> = plan
        .entries()
        .iter()
        .filter(|e| e.action == crate::planner::ChangeAction::Drifted)
        .cloned()
        .collect();

    let mut resolved = 0;
    for entry in &drifted {
        if let Some(resolution) = resolver.resolve(entry)?
            && plan.resolve_drift(entry.name(), resolution)
        {
            resolved += 1;
        }
    }
    Ok(resolved)
}
