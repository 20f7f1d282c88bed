//! Applier - executes a plan through a provider
//!
//! Entries run on a bounded rayon pool as soon as everything they wait on
//! has been applied. Provider calls happen on worker threads; results come
//! back over a channel to the scheduling thread, which is the only place
//! state is mutated and saved.

use crate::context::ProgressCallback;
use crate::error::{Error, Result};
use crate::planner::{ChangeAction, ChangePlanEntry, Plan, resolve_strict};
use crate::provider::{Created, Provider, ProviderError, ProviderResult};
use crate::retry::{RetryCallback, RetryPolicy, with_retry};
use crate::state::{StateFile, StateLock};
use crate::types::{Address, Attributes};
use std::any::Any;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::time::Duration;

/// Options for apply
#[derive(Debug, Clone)]
pub struct ApplyOptions {
    /// Maximum number of provider calls in flight
    pub jobs: usize,
    /// Retry policy for transient provider errors
    pub retry: RetryPolicy,
}

impl Default for ApplyOptions {
    fn default() -> Self {
        Self {
            jobs: 4,
            retry: RetryPolicy::default(),
        }
    }
}

/// Shared flag asking a running apply to stop
///
/// Entries already handed to a worker finish and are persisted; nothing
/// new is started.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Final outcome of one plan entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryOutcome {
    /// The provider confirmed the change and state was saved
    Applied(ChangeAction),
    /// Nothing to do
    NoOp,
    /// The provider call failed, or the entry could not be prepared
    Failed { reason: String },
    /// Not attempted because something it waits on failed
    Blocked { by: String },
    /// Not attempted because the run was cancelled
    Cancelled,
}

impl EntryOutcome {
    pub fn is_problem(&self) -> bool {
        matches!(
            self,
            Self::Failed { .. } | Self::Blocked { .. } | Self::Cancelled
        )
    }
}

impl fmt::Display for EntryOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Applied(action) => write!(f, "applied ({action})"),
            Self::NoOp => write!(f, "no-op"),
            Self::Failed { reason } => write!(f, "failed: {reason}"),
            Self::Blocked { by } => write!(f, "blocked by {by}"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Outcome of one entry, with what it was meant to do
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryReport {
    pub address: Address,
    pub action: ChangeAction,
    pub outcome: EntryOutcome,
}

/// Overall status of an apply run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyStatus {
    Success,
    Failed,
    Cancelled,
}

/// Summary counts of an apply run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplySummary {
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
    pub forgotten: usize,
    pub no_op: usize,
    pub failed: usize,
    pub blocked: usize,
    pub cancelled: usize,
}

impl ApplySummary {
    /// Total number of actual changes made
    pub fn total_changes(&self) -> usize {
        self.created + self.updated + self.deleted + self.forgotten
    }

    /// Add an outcome to the summary
    pub fn add_outcome(&mut self, outcome: &EntryOutcome) {
        match outcome {
            EntryOutcome::Applied(ChangeAction::Create) => self.created += 1,
            EntryOutcome::Applied(ChangeAction::Update) => self.updated += 1,
            EntryOutcome::Applied(ChangeAction::Delete) => self.deleted += 1,
            EntryOutcome::Applied(ChangeAction::Forget) => self.forgotten += 1,
            EntryOutcome::Applied(_) | EntryOutcome::NoOp => self.no_op += 1,
            EntryOutcome::Failed { .. } => self.failed += 1,
            EntryOutcome::Blocked { .. } => self.blocked += 1,
            EntryOutcome::Cancelled => self.cancelled += 1,
        }
    }
}

/// Per-entry results of an apply run, in plan order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyReport {
    pub entries: Vec<EntryReport>,
}

impl ApplyReport {
    pub fn get(&self, name: &str) -> Option<&EntryReport> {
        self.entries.iter().rev().find(|e| e.address.name == name)
    }

    pub fn summary(&self) -> ApplySummary {
        let mut summary = ApplySummary::default();
        for entry in &self.entries {
            summary.add_outcome(&entry.outcome);
        }
        summary
    }

    pub fn status(&self) -> ApplyStatus {
        let summary = self.summary();
        if summary.cancelled > 0 {
            ApplyStatus::Cancelled
        } else if summary.failed > 0 || summary.blocked > 0 {
            ApplyStatus::Failed
        } else {
            ApplyStatus::Success
        }
    }

    /// Whether nothing failed, was blocked or was cancelled
    pub fn is_success(&self) -> bool {
        self.status() == ApplyStatus::Success
    }
}

// ============================================================================
// Tasks
// ============================================================================

/// A provider call, owned so it can move to a worker
enum Operation {
    Create(Attributes),
    Update {
        identity: String,
        attributes: Attributes,
    },
    Delete {
        identity: String,
    },
}

enum Effect {
    Created(Created),
    Updated(Attributes),
    Deleted,
}

/// What a worker reports back to the scheduling thread
enum Message {
    Retrying {
        index: usize,
        attempt: u32,
        max_attempts: u32,
        error: ProviderError,
        delay: Duration,
    },
    Done(usize, ProviderResult<Effect>),
}

/// Forwards retry notices from a worker to the scheduling thread
struct RetryNotice {
    index: usize,
    tx: mpsc::Sender<Message>,
}

impl RetryCallback for RetryNotice {
    fn on_retry(&self, attempt: u32, max_attempts: u32, error: &ProviderError, delay: Duration) {
        let _ = self.tx.send(Message::Retrying {
            index: self.index,
            attempt,
            max_attempts,
            error: error.clone(),
            delay,
        });
    }
}

fn run_operation(
    provider: &dyn Provider,
    address: &Address,
    operation: &Operation,
    retry: &RetryPolicy,
    notice: &dyn RetryCallback,
) -> ProviderResult<Effect> {
    let notice = Some(notice);
    match operation {
        Operation::Create(attributes) => {
            with_retry(retry, notice, || provider.create(address, attributes)).map(Effect::Created)
        }
        Operation::Update {
            identity,
            attributes,
        } => with_retry(retry, notice, || provider.update(address, identity, attributes))
            .map(Effect::Updated),
        Operation::Delete { identity } => {
            match with_retry(retry, notice, || provider.delete(address, identity)) {
                Ok(()) => Ok(Effect::Deleted),
                Err(e) if e.is_not_found() => {
                    log::debug!("{address} was already gone");
                    Ok(Effect::Deleted)
                }
                Err(e) => Err(e),
            }
        }
    }
}

/// Run one operation on a worker; a panicking provider fails the entry
fn run_guarded(
    provider: &dyn Provider,
    address: &Address,
    operation: &Operation,
    retry: &RetryPolicy,
    notice: &dyn RetryCallback,
) -> ProviderResult<Effect> {
    panic::catch_unwind(AssertUnwindSafe(|| {
        run_operation(provider, address, operation, retry, notice)
    }))
    .unwrap_or_else(|payload| {
        let message = panic_message(payload.as_ref());
        log::error!("Provider panicked during {address}: {message}");
        Err(ProviderError::rejected(format!("provider panicked: {message}")))
    })
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}

// ============================================================================
// Scheduling
// ============================================================================

/// Execution DAG over plan entries
struct Schedule<'p> {
    entries: &'p [ChangePlanEntry],
    successors: Vec<Vec<usize>>,
    waiting: Vec<usize>,
    outcomes: Vec<Option<EntryOutcome>>,
    ready: BinaryHeap<Reverse<usize>>,
}

impl<'p> Schedule<'p> {
    fn new(entries: &'p [ChangePlanEntry], state: &StateFile) -> Self {
        let n = entries.len();
        let mut successors = vec![Vec::new(); n];
        let mut waiting = vec![0; n];

        let mut upserts: HashMap<&str, usize> = HashMap::new();
        let mut deletes: HashMap<&str, usize> = HashMap::new();
        for (i, entry) in entries.iter().enumerate() {
            match entry.action {
                ChangeAction::Create | ChangeAction::Update => {
                    upserts.insert(entry.name(), i);
                }
                ChangeAction::Delete => {
                    deletes.insert(entry.name(), i);
                }
                _ => {}
            }
        }

        let mut edge = |from: usize, to: usize| {
            if from != to && !successors[from].contains(&to) {
                successors[from].push(to);
                waiting[to] += 1;
            }
        };

        for (i, entry) in entries.iter().enumerate() {
            match entry.action {
                ChangeAction::Create | ChangeAction::Update => {
                    for dep in &entry.dependencies {
                        if let Some(&j) = upserts.get(dep.as_str()) {
                            edge(j, i);
                        }
                    }
                    if entry.action == ChangeAction::Create
                        && let Some(&d) = deletes.get(entry.name())
                    {
                        edge(d, i);
                    }
                }
                ChangeAction::Delete => {
                    // Whoever still depends on this resource in state must
                    // let go of it first
                    for (k, other) in entries.iter().enumerate() {
                        let Some(recorded) = state.get(other.name()) else {
                            continue;
                        };
                        if !recorded.dependencies.iter().any(|d| d == entry.name()) {
                            continue;
                        }
                        let lets_go = match other.action {
                            ChangeAction::Delete => true,
                            ChangeAction::Update => {
                                !other.dependencies.iter().any(|d| d == entry.name())
                            }
                            _ => false,
                        };
                        if lets_go {
                            edge(k, i);
                        }
                    }
                }
                _ => {}
            }
        }

        let mut outcomes = vec![None; n];
        let mut ready = BinaryHeap::new();
        for (i, entry) in entries.iter().enumerate() {
            match entry.action {
                ChangeAction::NoOp => outcomes[i] = Some(EntryOutcome::NoOp),
                _ if waiting[i] == 0 => ready.push(Reverse(i)),
                _ => {}
            }
        }

        Self {
            entries,
            successors,
            waiting,
            outcomes,
            ready,
        }
    }

    /// Record an outcome, releasing or blocking what waits on the entry
    fn finish(&mut self, i: usize, outcome: EntryOutcome, progress: &mut dyn ProgressCallback) {
        let failed = outcome.is_problem();
        progress.on_entry_complete(&self.entries[i], &outcome);
        self.outcomes[i] = Some(outcome);

        if !failed {
            for &next in &self.successors[i] {
                self.waiting[next] -= 1;
                if self.waiting[next] == 0 && self.outcomes[next].is_none() {
                    self.ready.push(Reverse(next));
                }
            }
            return;
        }

        let by = self.entries[i].name().to_string();
        let mut queue: VecDeque<usize> = self.successors[i].iter().copied().collect();
        while let Some(next) = queue.pop_front() {
            if self.outcomes[next].is_some() {
                continue;
            }
            let blocked = EntryOutcome::Blocked { by: by.clone() };
            log::info!("{} blocked by {by}", self.entries[next].address);
            progress.on_entry_complete(&self.entries[next], &blocked);
            self.outcomes[next] = Some(blocked);
            queue.extend(self.successors[next].iter().copied());
        }
    }
}

/// Count of entries that will do something
fn change_count(plan: &Plan) -> usize {
    plan.entries().iter().filter(|e| e.action.is_change()).count()
}

/// Apply a plan
///
/// Every confirmed provider operation is saved through `lock` before the
/// next result is looked at. Fails up front on unresolved drift; otherwise
/// per-entry problems end up in the report and only a state save failure
/// is returned as an error.
pub fn apply(
    plan: &Plan,
    provider: &dyn Provider,
    lock: &StateLock<'_>,
    state: &mut StateFile,
    options: &ApplyOptions,
    cancel: &CancelToken,
    progress: &mut dyn ProgressCallback,
) -> Result<ApplyReport> {
    let drifted = plan.unresolved_drift();
    if !drifted.is_empty() {
        return Err(Error::UnresolvedDrift { names: drifted });
    }

    let jobs = options.jobs.max(1);
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(jobs)
        .thread_name(|i| format!("forma-apply-{i}"))
        .build()
        .map_err(|e| Error::WorkerPool(e.to_string()))?;

    let entries = plan.entries();
    let mut schedule = Schedule::new(entries, state);
    let mut fatal: Option<Error> = None;
    // Resolved inputs of entries in flight
    let mut inputs: HashMap<usize, Attributes> = HashMap::new();

    progress.on_apply_start(change_count(plan));
    log::info!("Applying {} entries with {jobs} workers", change_count(plan));

    let (tx, rx) = mpsc::channel::<Message>();
    let retry = &options.retry;

    pool.in_place_scope(|scope| {
        let mut running = 0usize;
        loop {
            while running < jobs && fatal.is_none() && !cancel.is_cancelled() {
                let Some(Reverse(i)) = schedule.ready.pop() else {
                    break;
                };
                let entry = &entries[i];

                let operation = match prepare(entry, state) {
                    Ok(Some(operation)) => operation,
                    Ok(None) => {
                        // Forget: state only
                        state.remove(entry.name());
                        let outcome = match lock.save(state) {
                            Ok(()) => EntryOutcome::Applied(ChangeAction::Forget),
                            Err(e) => {
                                let reason = format!("state could not be saved: {e}");
                                fatal.get_or_insert(e);
                                EntryOutcome::Failed { reason }
                            }
                        };
                        schedule.finish(i, outcome, progress);
                        continue;
                    }
                    Err(reason) => {
                        log::warn!("{}: {reason}", entry.address);
                        schedule.finish(i, EntryOutcome::Failed { reason }, progress);
                        continue;
                    }
                };

                if let Operation::Create(attributes) | Operation::Update { attributes, .. } =
                    &operation
                {
                    inputs.insert(i, attributes.clone());
                }
                progress.on_entry_start(entry);
                log::debug!("Starting {} of {}", entry.action, entry.address);
                let tx = tx.clone();
                let address = entry.address.clone();
                scope.spawn(move |_| {
                    let notice = RetryNotice {
                        index: i,
                        tx: tx.clone(),
                    };
                    let result = run_guarded(provider, &address, &operation, retry, &notice);
                    let _ = tx.send(Message::Done(i, result));
                });
                running += 1;
            }

            if running == 0 {
                break;
            }
            let (i, result) = match rx.recv() {
                Ok(Message::Done(i, result)) => (i, result),
                Ok(Message::Retrying {
                    index,
                    attempt,
                    max_attempts,
                    error,
                    delay,
                }) => {
                    progress.on_entry_retry(&entries[index], attempt, max_attempts, &error, delay);
                    continue;
                }
                Err(_) => break,
            };
            running -= 1;

            let entry = &entries[i];
            let outcome = match result {
                Ok(effect) => {
                    record(entry, effect, inputs.remove(&i).unwrap_or_default(), state);
                    match lock.save(state) {
                        Ok(()) => EntryOutcome::Applied(entry.action),
                        Err(e) => {
                            log::error!(
                                "{} was applied but state could not be saved: {e}",
                                entry.address
                            );
                            let reason = format!("applied but state could not be saved: {e}");
                            fatal.get_or_insert(e);
                            EntryOutcome::Failed { reason }
                        }
                    }
                }
                Err(e) => {
                    log::warn!("{} of {} failed: {e}", entry.action, entry.address);
                    EntryOutcome::Failed {
                        reason: e.to_string(),
                    }
                }
            };
            schedule.finish(i, outcome, progress);
        }
    });

    if let Some(e) = fatal {
        progress.on_apply_complete();
        return Err(e);
    }

    let cancelled = cancel.is_cancelled();
    let mut report = ApplyReport::default();
    for (i, entry) in entries.iter().enumerate() {
        let outcome = match schedule.outcomes[i].take() {
            Some(outcome) => outcome,
            None => {
                let outcome = if cancelled {
                    EntryOutcome::Cancelled
                } else {
                    EntryOutcome::Failed {
                        reason: "waits on itself through recorded dependencies".to_string(),
                    }
                };
                progress.on_entry_complete(entry, &outcome);
                outcome
            }
        };
        report.entries.push(EntryReport {
            address: entry.address.clone(),
            action: entry.action,
            outcome,
        });
    }
    progress.on_apply_complete();

    let summary = report.summary();
    log::info!(
        "Apply finished: {} changed, {} failed, {} blocked, {} cancelled",
        summary.total_changes(),
        summary.failed,
        summary.blocked,
        summary.cancelled
    );
    Ok(report)
}

/// Turn an entry into a provider call
///
/// `Ok(None)` means the entry only touches state.
fn prepare(
    entry: &ChangePlanEntry,
    state: &StateFile,
) -> std::result::Result<Option<Operation>, String> {
    let identity = || {
        entry
            .identity
            .clone()
            .or_else(|| state.get(entry.name()).map(|r| r.identity.clone()))
            .ok_or_else(|| format!("{} has no recorded identity", entry.address))
    };
    let desired = || {
        let after = entry.after.clone().unwrap_or_default();
        resolve_strict(&after, state)
            .map_err(|r| format!("reference to {r} is not known after its dependencies"))
    };

    match entry.action {
        ChangeAction::Create => Ok(Some(Operation::Create(desired()?))),
        ChangeAction::Update => Ok(Some(Operation::Update {
            identity: identity()?,
            attributes: desired()?,
        })),
        ChangeAction::Delete => Ok(Some(Operation::Delete {
            identity: identity()?,
        })),
        ChangeAction::Forget => Ok(None),
        ChangeAction::NoOp | ChangeAction::Drifted => {
            Err(format!("{} cannot be applied", entry.action))
        }
    }
}

/// Record a confirmed provider operation in state
fn record(entry: &ChangePlanEntry, effect: Effect, inputs: Attributes, state: &mut StateFile) {
    match effect {
        Effect::Created(created) => {
            state.record_created(
                &entry.address,
                created.identity,
                inputs,
                created.attributes,
                entry.dependencies.clone(),
            );
        }
        Effect::Updated(outputs) => {
            if state
                .record_updated(entry.name(), inputs, outputs, entry.dependencies.clone())
                .is_none()
            {
                log::warn!("{} was updated but is missing from state", entry.address);
            }
        }
        Effect::Deleted => {
            state.remove(entry.name());
        }
    }
}
