//! End-to-end reconciliation against a scripted provider

use declarative::{
    Address, ApplyOptions, ApplyReport, ApplyStatus, Attributes, CancelToken, ChangeAction,
    ChangePlanEntry, Created, DeclarationSet, DriftReport, DriftResolution, EntryOutcome, Error,
    Graph, NoProgress, Plan, ProgressCallback, Provider, ProviderError, ProviderResult, Reference,
    Registry, ResourceDeclaration, ResourceSchema, RetryPolicy, StateStore, Value, ValueType,
};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, mpsc};
use std::thread;
use std::time::Duration;
use tempfile::TempDir;

// ============================================================================
// Scripted provider
// ============================================================================

#[derive(Default)]
struct ScriptedProvider {
    objects: Mutex<HashMap<String, Attributes>>,
    calls: Mutex<Vec<String>>,
    failures: Mutex<HashMap<String, VecDeque<ProviderError>>>,
    next_id: AtomicUsize,
    cancel_on_create: Mutex<Option<(String, CancelToken)>>,
    panic_on_create: Mutex<Option<String>>,
    create_delay: Mutex<Option<Duration>>,
    creating: AtomicUsize,
    peak_creating: AtomicUsize,
}

impl ScriptedProvider {
    fn fail(&self, name: &str, errors: Vec<ProviderError>) {
        self.failures
            .lock()
            .unwrap()
            .insert(name.to_string(), errors.into());
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn calls_for(&self, name: &str) -> usize {
        self.calls()
            .iter()
            .filter(|c| c.ends_with(&format!(":{name}")))
            .count()
    }

    fn clear_calls(&self) {
        self.calls.lock().unwrap().clear();
    }

    fn vanish(&self, identity: &str) {
        self.objects.lock().unwrap().remove(identity);
    }

    fn step(&self, verb: &str, address: &Address) -> ProviderResult<()> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("{verb}:{}", address.name));
        let scripted = self
            .failures
            .lock()
            .unwrap()
            .get_mut(&address.name)
            .and_then(VecDeque::pop_front);
        match scripted {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl Provider for ScriptedProvider {
    fn create(&self, address: &Address, attributes: &Attributes) -> ProviderResult<Created> {
        if let Some((name, token)) = self.cancel_on_create.lock().unwrap().as_ref()
            && *name == address.name
        {
            token.cancel();
        }
        let explode = self.panic_on_create.lock().unwrap().clone();
        if explode.as_deref() == Some(address.name.as_str()) {
            panic!("create of {} exploded", address.name);
        }

        let now = self.creating.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_creating.fetch_max(now, Ordering::SeqCst);
        let delay = *self.create_delay.lock().unwrap();
        if let Some(delay) = delay {
            thread::sleep(delay);
        }
        self.creating.fetch_sub(1, Ordering::SeqCst);

        self.step("create", address)?;

        let n = self.next_id.fetch_add(1, Ordering::SeqCst);
        let identity = format!("/{}/{}/{n}", address.kind, address.name);
        let mut live = attributes.clone();
        if address.kind == "kubernetes_cluster" {
            live.insert("principal_id".into(), Value::from(format!("principal-{n}")));
        }
        self.objects
            .lock()
            .unwrap()
            .insert(identity.clone(), live.clone());
        Ok(Created {
            identity,
            attributes: live,
        })
    }

    fn read(&self, _address: &Address, identity: &str) -> ProviderResult<Attributes> {
        self.objects
            .lock()
            .unwrap()
            .get(identity)
            .cloned()
            .ok_or_else(|| ProviderError::not_found(identity))
    }

    fn update(
        &self,
        address: &Address,
        identity: &str,
        attributes: &Attributes,
    ) -> ProviderResult<Attributes> {
        self.step("update", address)?;
        let mut objects = self.objects.lock().unwrap();
        let live = objects
            .get_mut(identity)
            .ok_or_else(|| ProviderError::not_found(identity))?;
        for (k, v) in attributes {
            live.insert(k.clone(), v.clone());
        }
        Ok(live.clone())
    }

    fn delete(&self, address: &Address, identity: &str) -> ProviderResult<()> {
        self.step("delete", address)?;
        self.objects
            .lock()
            .unwrap()
            .remove(identity)
            .map(|_| ())
            .ok_or_else(|| ProviderError::not_found(identity))
    }
}

// ============================================================================
// Fixtures
// ============================================================================

fn registry() -> Registry {
    let mut registry = Registry::new();
    registry
        .register(
            ResourceSchema::new("virtual_network")
                .required("address_space", ValueType::list_of(ValueType::String)),
        )
        .register(
            ResourceSchema::new("subnet")
                .required_ref("virtual_network_id", ValueType::String, &["virtual_network"])
                .required("address_prefixes", ValueType::list_of(ValueType::String)),
        )
        .register(
            ResourceSchema::new("kubernetes_cluster")
                .required_ref("subnet_id", ValueType::String, &["subnet"])
                .optional("node_count", ValueType::Number)
                .computed("principal_id", ValueType::String),
        )
        .register(ResourceSchema::new("node").optional_ref(
            "after",
            ValueType::list_of(ValueType::String),
            &[],
        ));
    registry
}

fn network_stack() -> Vec<ResourceDeclaration> {
    vec![
        ResourceDeclaration::new("virtual_network", "n1")
            .with("address_space", vec!["10.0.0.0/16"]),
        ResourceDeclaration::new("subnet", "s1")
            .with("virtual_network_id", Reference::identity("n1"))
            .with("address_prefixes", vec!["10.0.1.0/24"]),
        ResourceDeclaration::new("kubernetes_cluster", "c1")
            .with("subnet_id", Reference::identity("s1"))
            .with("node_count", 3.0),
    ]
}

fn node(name: &str, after: &[&str]) -> ResourceDeclaration {
    let refs: Vec<Value> = after
        .iter()
        .map(|n| Value::Ref(Reference::identity(*n)))
        .collect();
    ResourceDeclaration::new("node", name).with("after", Value::List(refs))
}

fn fast_options(jobs: usize) -> ApplyOptions {
    ApplyOptions {
        jobs,
        retry: RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            backoff_factor: 1.0,
            max_delay: Duration::from_millis(5),
        },
    }
}

struct Workspace {
    _dir: TempDir,
    store: StateStore,
    provider: ScriptedProvider,
}

impl Workspace {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let store = StateStore::in_dir(dir.path());
        Self {
            _dir: dir,
            store,
            provider: ScriptedProvider::default(),
        }
    }

    fn plan(&self, decls: Vec<ResourceDeclaration>, drift: &DriftReport) -> Plan {
        let registry = registry();
        let set = DeclarationSet::new(decls).unwrap();
        registry.validate_set(&set).unwrap();
        let graph = Graph::build(&set, &registry).unwrap();
        let state = self.store.load().unwrap();
        declarative::plan(&set, &graph, &registry, &state, drift)
    }

    fn apply_plan(
        &self,
        plan: &Plan,
        options: &ApplyOptions,
        cancel: &CancelToken,
    ) -> declarative::Result<ApplyReport> {
        let lock = self.store.lock("apply", Duration::ZERO)?;
        let mut state = lock.load()?;
        declarative::apply(
            plan,
            &self.provider,
            &lock,
            &mut state,
            options,
            cancel,
            &mut NoProgress,
        )
    }

    fn apply(&self, decls: Vec<ResourceDeclaration>) -> ApplyReport {
        let plan = self.plan(decls, &DriftReport::none());
        self.apply_plan(&plan, &fast_options(4), &CancelToken::new())
            .unwrap()
    }
}

fn actions(plan: &Plan) -> Vec<(ChangeAction, String)> {
    plan.entries()
        .iter()
        .map(|e| (e.action, e.name().to_string()))
        .collect()
}

fn outcome<'a>(report: &'a ApplyReport, name: &str) -> &'a EntryOutcome {
    &report.get(name).unwrap().outcome
}

fn position(calls: &[String], call: &str) -> usize {
    calls
        .iter()
        .position(|c| c == call)
        .unwrap_or_else(|| panic!("{call} was never made: {calls:?}"))
}

/// Records retry notices as `name:attempt/max`
#[derive(Default)]
struct RecordingProgress {
    retries: Vec<String>,
}

impl ProgressCallback for RecordingProgress {
    fn on_apply_start(&mut self, _total: usize) {}
    fn on_entry_start(&mut self, _entry: &ChangePlanEntry) {}

    fn on_entry_retry(
        &mut self,
        entry: &ChangePlanEntry,
        attempt: u32,
        max_attempts: u32,
        _error: &ProviderError,
        _delay: Duration,
    ) {
        self.retries.push(format!("{}:{attempt}/{max_attempts}", entry.name()));
    }

    fn on_entry_complete(&mut self, _entry: &ChangePlanEntry, _outcome: &EntryOutcome) {}
    fn on_apply_complete(&mut self) {}
}

// ============================================================================
// Scenarios
// ============================================================================

#[test]
fn test_network_stack_is_created_in_dependency_order() {
    let ws = Workspace::new();
    let plan = ws.plan(network_stack(), &DriftReport::none());
    assert_eq!(
        actions(&plan),
        vec![
            (ChangeAction::Create, "n1".to_string()),
            (ChangeAction::Create, "s1".to_string()),
            (ChangeAction::Create, "c1".to_string()),
        ]
    );

    let report = ws
        .apply_plan(&plan, &fast_options(4), &CancelToken::new())
        .unwrap();
    assert!(report.is_success());
    assert_eq!(report.summary().created, 3);
    assert_eq!(ws.provider.calls(), vec!["create:n1", "create:s1", "create:c1"]);

    let state = ws.store.load().unwrap();
    assert_eq!(state.len(), 3);
    let n1 = state.get("n1").unwrap();
    let s1 = state.get("s1").unwrap();
    let c1 = state.get("c1").unwrap();
    assert!(n1.serial < s1.serial && s1.serial < c1.serial);
    assert!(n1.created_at <= s1.created_at && s1.created_at <= c1.created_at);
    assert_eq!(
        s1.attributes["virtual_network_id"],
        Value::String(n1.identity.clone())
    );
    assert_eq!(s1.dependencies, vec!["n1"]);
    assert!(c1.outputs.contains_key("principal_id"));
}

#[test]
fn test_apply_then_plan_is_noop() {
    let ws = Workspace::new();
    assert!(ws.apply(network_stack()).is_success());

    let plan = ws.plan(network_stack(), &DriftReport::none());
    assert!(!plan.has_changes());
    assert_eq!(plan.summary().no_op, 3);

    let again = ws.plan(network_stack(), &DriftReport::none());
    assert_eq!(plan, again);
}

#[test]
fn test_failure_blocks_dependents_but_not_siblings() {
    let ws = Workspace::new();
    ws.provider
        .fail("b", vec![ProviderError::rejected("quota exceeded")]);

    let report = ws.apply(vec![
        node("a", &[]),
        node("b", &["a"]),
        node("c", &["b"]),
        node("d", &[]),
    ]);

    assert_eq!(outcome(&report, "a"), &EntryOutcome::Applied(ChangeAction::Create));
    assert!(
        matches!(outcome(&report, "b"), EntryOutcome::Failed { reason } if reason.contains("quota"))
    );
    assert_eq!(outcome(&report, "c"), &EntryOutcome::Blocked { by: "b".into() });
    assert_eq!(outcome(&report, "d"), &EntryOutcome::Applied(ChangeAction::Create));
    assert_eq!(report.status(), ApplyStatus::Failed);
    assert_eq!(ws.provider.calls_for("c"), 0);

    let state = ws.store.load().unwrap();
    let mut names: Vec<&str> = state.iter().map(|r| r.name.as_str()).collect();
    names.sort_unstable();
    assert_eq!(names, vec!["a", "d"]);

    // The next run picks up where this one stopped
    let plan = ws.plan(
        vec![node("a", &[]), node("b", &["a"]), node("c", &["b"]), node("d", &[])],
        &DriftReport::none(),
    );
    assert_eq!(
        actions(&plan),
        vec![
            (ChangeAction::NoOp, "a".to_string()),
            (ChangeAction::Create, "b".to_string()),
            (ChangeAction::Create, "c".to_string()),
            (ChangeAction::NoOp, "d".to_string()),
        ]
    );
}

#[test]
fn test_transient_errors_are_retried() {
    let ws = Workspace::new();
    ws.provider.fail(
        "n1",
        vec![
            ProviderError::transient("throttled"),
            ProviderError::transient("throttled"),
        ],
    );

    let report = ws.apply(network_stack());
    assert!(report.is_success());
    assert_eq!(ws.provider.calls_for("n1"), 3);
}

#[test]
fn test_retries_are_bounded() {
    let ws = Workspace::new();
    ws.provider.fail(
        "n1",
        vec![ProviderError::transient("throttled"); 5],
    );

    let report = ws.apply(network_stack());
    assert!(matches!(outcome(&report, "n1"), EntryOutcome::Failed { .. }));
    assert_eq!(outcome(&report, "c1"), &EntryOutcome::Blocked { by: "n1".into() });
    assert_eq!(ws.provider.calls_for("n1"), 3);
}

#[test]
fn test_retries_reach_progress() {
    let ws = Workspace::new();
    ws.provider.fail("a", vec![ProviderError::transient("throttled")]);
    let plan = ws.plan(vec![node("a", &[])], &DriftReport::none());

    let lock = ws.store.lock("apply", Duration::ZERO).unwrap();
    let mut state = lock.load().unwrap();
    let mut progress = RecordingProgress::default();
    let report = declarative::apply(
        &plan,
        &ws.provider,
        &lock,
        &mut state,
        &fast_options(2),
        &CancelToken::new(),
        &mut progress,
    )
    .unwrap();

    assert!(report.is_success());
    assert_eq!(progress.retries, vec!["a:1/3"]);
}

#[test]
fn test_panicking_provider_fails_the_entry() {
    let ws = Workspace::new();
    *ws.provider.panic_on_create.lock().unwrap() = Some("a".to_string());

    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let report = ws.apply(vec![node("a", &[]), node("b", &["a"]), node("c", &[])]);
        let state = ws.store.load().unwrap();
        let recorded: Vec<String> = state.iter().map(|r| r.name.clone()).collect();
        let _ = tx.send((report, recorded));
    });
    let (report, recorded) = rx
        .recv_timeout(Duration::from_secs(10))
        .expect("apply did not return after a provider panic");

    match outcome(&report, "a") {
        EntryOutcome::Failed { reason } => {
            assert!(reason.contains("provider panicked"), "{reason}");
            assert!(reason.contains("create of a exploded"), "{reason}");
        }
        other => panic!("expected Failed, got {other:?}"),
    }
    assert_eq!(outcome(&report, "b"), &EntryOutcome::Blocked { by: "a".into() });
    assert_eq!(outcome(&report, "c"), &EntryOutcome::Applied(ChangeAction::Create));
    assert_eq!(report.status(), ApplyStatus::Failed);
    assert_eq!(recorded, vec!["c"]);
}

#[test]
fn test_independent_branches_run_concurrently() {
    let ws = Workspace::new();
    *ws.provider.create_delay.lock().unwrap() = Some(Duration::from_millis(200));

    let report = ws.apply(vec![node("a", &[]), node("b", &[])]);
    assert!(report.is_success());
    assert_eq!(ws.provider.peak_creating.load(Ordering::SeqCst), 2);
}

#[test]
fn test_chain_runs_one_at_a_time() {
    let ws = Workspace::new();
    *ws.provider.create_delay.lock().unwrap() = Some(Duration::from_millis(20));

    let report = ws.apply(vec![node("a", &[]), node("b", &["a"]), node("c", &["b"])]);
    assert!(report.is_success());
    assert_eq!(ws.provider.peak_creating.load(Ordering::SeqCst), 1);
}

#[test]
fn test_repointed_dependent_is_updated_before_old_target_is_deleted() {
    let ws = Workspace::new();
    ws.apply(vec![
        ResourceDeclaration::new("virtual_network", "n-old")
            .with("address_space", vec!["10.0.0.0/16"]),
        ResourceDeclaration::new("subnet", "s1")
            .with("virtual_network_id", Reference::identity("n-old"))
            .with("address_prefixes", vec!["10.0.1.0/24"]),
    ]);
    ws.provider.clear_calls();

    let decls = vec![
        ResourceDeclaration::new("virtual_network", "n1")
            .with("address_space", vec!["10.1.0.0/16"]),
        ResourceDeclaration::new("subnet", "s1")
            .with("virtual_network_id", Reference::identity("n1"))
            .with("address_prefixes", vec!["10.0.1.0/24"]),
    ];
    let plan = ws.plan(decls, &DriftReport::none());
    assert_eq!(
        actions(&plan),
        vec![
            (ChangeAction::Create, "n1".to_string()),
            (ChangeAction::Update, "s1".to_string()),
            (ChangeAction::Delete, "n-old".to_string()),
        ]
    );

    let report = ws
        .apply_plan(&plan, &fast_options(4), &CancelToken::new())
        .unwrap();
    assert!(report.is_success());

    let calls = ws.provider.calls();
    assert!(position(&calls, "create:n1") < position(&calls, "update:s1"));
    assert!(position(&calls, "update:s1") < position(&calls, "delete:n-old"));

    let state = ws.store.load().unwrap();
    assert!(state.get("n-old").is_none());
    assert_eq!(state.get("s1").unwrap().dependencies, vec!["n1".to_string()]);
}

#[test]
fn test_removed_declarations_delete_dependents_first() {
    let ws = Workspace::new();
    assert!(ws.apply(network_stack()).is_success());
    ws.provider.clear_calls();

    let report = ws.apply(vec![]);
    assert!(report.is_success());
    assert_eq!(report.summary().deleted, 3);
    assert_eq!(ws.provider.calls(), vec!["delete:c1", "delete:s1", "delete:n1"]);
    assert!(ws.store.load().unwrap().is_empty());
}

#[test]
fn test_delete_of_vanished_resource_succeeds() {
    let ws = Workspace::new();
    assert!(ws.apply(vec![node("a", &[])]).is_success());
    let identity = ws.store.load().unwrap().get("a").unwrap().identity.clone();
    ws.provider.vanish(&identity);

    let report = ws.apply(vec![]);
    assert_eq!(outcome(&report, "a"), &EntryOutcome::Applied(ChangeAction::Delete));
    assert!(ws.store.load().unwrap().is_empty());
}

#[test]
fn test_kind_change_deletes_before_creating() {
    let ws = Workspace::new();
    assert!(ws.apply(vec![node("x", &[])]).is_success());
    ws.provider.clear_calls();

    let report = ws.apply(vec![
        ResourceDeclaration::new("virtual_network", "x").with("address_space", vec!["10.9.0.0/16"]),
    ]);
    assert!(report.is_success());
    assert_eq!(ws.provider.calls(), vec!["delete:x", "create:x"]);
    assert_eq!(ws.store.load().unwrap().get("x").unwrap().kind, "virtual_network");
}

#[test]
fn test_cancellation_persists_in_flight_work() {
    let ws = Workspace::new();
    let cancel = CancelToken::new();
    *ws.provider.cancel_on_create.lock().unwrap() = Some(("n1".into(), cancel.clone()));

    let mut decls = network_stack();
    decls.push(node("x", &[]));
    let plan = ws.plan(decls, &DriftReport::none());
    let report = ws.apply_plan(&plan, &fast_options(1), &cancel).unwrap();

    assert_eq!(report.status(), ApplyStatus::Cancelled);
    assert_eq!(outcome(&report, "n1"), &EntryOutcome::Applied(ChangeAction::Create));
    assert_eq!(outcome(&report, "s1"), &EntryOutcome::Cancelled);
    assert_eq!(outcome(&report, "x"), &EntryOutcome::Cancelled);

    let state = ws.store.load().unwrap();
    assert!(state.contains("n1"));
    assert_eq!(state.len(), 1);
}

#[test]
fn test_drift_must_be_resolved_before_apply() {
    let ws = Workspace::new();
    assert!(ws.apply(network_stack()).is_success());

    let state = ws.store.load().unwrap();
    let old_network = state.get("n1").unwrap().identity.clone();
    ws.provider.vanish(&old_network);

    let drift = declarative::refresh(&state, &ws.provider, 2).unwrap();
    assert!(drift.is_drifted("n1"));

    let mut plan = ws.plan(network_stack(), &drift);
    assert_eq!(plan.unresolved_drift(), vec!["n1"]);
    assert_eq!(plan.entries_for("s1").next().unwrap().action, ChangeAction::Update);

    let err = ws
        .apply_plan(&plan, &fast_options(2), &CancelToken::new())
        .unwrap_err();
    assert!(matches!(err, Error::UnresolvedDrift { .. }));
    assert_eq!(ws.store.load().unwrap(), state);

    plan.resolve_all_drift(DriftResolution::Recreate);
    let report = ws
        .apply_plan(&plan, &fast_options(2), &CancelToken::new())
        .unwrap();
    assert!(report.is_success());

    let state = ws.store.load().unwrap();
    let new_network = &state.get("n1").unwrap().identity;
    assert_ne!(new_network, &old_network);
    assert_eq!(
        state.get("s1").unwrap().attributes["virtual_network_id"],
        Value::String(new_network.clone())
    );
    assert!(!ws.plan(network_stack(), &DriftReport::none()).has_changes());
}

#[test]
fn test_forgotten_drift_leaves_state_only() {
    let ws = Workspace::new();
    assert!(ws.apply(vec![node("a", &[])]).is_success());
    let state = ws.store.load().unwrap();
    ws.provider.vanish(&state.get("a").unwrap().identity);

    let drift = declarative::refresh(&state, &ws.provider, 1).unwrap();
    let mut plan = ws.plan(vec![node("a", &[])], &drift);
    plan.resolve_all_drift(DriftResolution::Forget);
    ws.provider.clear_calls();

    let report = ws
        .apply_plan(&plan, &fast_options(1), &CancelToken::new())
        .unwrap();
    assert_eq!(outcome(&report, "a"), &EntryOutcome::Applied(ChangeAction::Forget));
    assert!(ws.provider.calls().is_empty());
    assert!(ws.store.load().unwrap().is_empty());
}

#[test]
fn test_apply_waits_for_state_lock() {
    let ws = Workspace::new();
    let _held = ws.store.lock("plan", Duration::ZERO).unwrap();

    let plan = ws.plan(network_stack(), &DriftReport::none());
    let err = ws
        .apply_plan(&plan, &fast_options(1), &CancelToken::new())
        .unwrap_err();
    assert!(matches!(err, Error::StateLocked { .. }));
    assert!(ws.provider.calls().is_empty());
}

#[test]
fn test_cycles_are_rejected_before_planning() {
    let registry = registry();
    let set =
        DeclarationSet::new(vec![node("a", &["b"]), node("b", &["a"]), node("c", &[])]).unwrap();
    match Graph::build(&set, &registry) {
        Err(Error::CyclicDependency { participants }) => assert_eq!(participants, vec!["a", "b"]),
        other => panic!("expected CyclicDependency, got {other:?}"),
    }
}
