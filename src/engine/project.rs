//! A declaration directory and everything derived from it

use anyhow::Result;
use declarative::{Graph, Registry, StateStore};
use std::path::{Path, PathBuf};

use crate::config::Settings;
use crate::declarations::{self, Loaded, Loader};
use crate::kinds;
use crate::paths;
use crate::provider::LocalProvider;

/// Where the declarations are and where their state lives
pub struct Project {
    pub dir: PathBuf,
    pub settings: Settings,
    pub state_dir: PathBuf,
    pub registry: Registry,
}

/// Declarations that passed validation, with their dependency graph
pub struct Validated {
    pub loaded: Loaded,
    pub graph: Graph,
}

impl Project {
    /// Open a declaration directory, reading its settings
    pub fn open(dir: &Path, state_dir: Option<&Path>) -> Result<Self> {
        let settings = Settings::load(dir)?;
        let state_dir = paths::state_dir(dir, state_dir, &settings)?;
        log::info!("State directory: {}", state_dir.display());

        Ok(Self {
            dir: dir.to_path_buf(),
            settings,
            state_dir,
            registry: kinds::registry(),
        })
    }

    pub fn store(&self) -> StateStore {
        StateStore::in_dir(&self.state_dir)
    }

    pub fn provider(&self) -> LocalProvider {
        LocalProvider::in_dir(&self.state_dir)
    }

    /// Load, validate and order the declarations
    ///
    /// `vars` are `NAME=VALUE` overrides from the command line.
    pub fn validate(&self, vars: &[String]) -> Result<Validated> {
        let overrides = declarations::parse_overrides(vars)?;
        let loaded = Loader::new(overrides)?.load(&self.dir)?;

        self.registry.validate_set(&loaded.set)?;
        let graph = Graph::build(&loaded.set, &self.registry)?;
        log::debug!("Dependency order: {}", graph.order().join(" → "));

        Ok(Validated { loaded, graph })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use declarative::{
        ApplyOptions, CancelToken, ChangeAction, DriftReport, DriftResolution, NoProgress, Plan,
        Provider, RetryPolicy, StateFile, StateLock,
    };
    use std::time::Duration;
    use tempfile::TempDir;

    fn sample() -> PathBuf {
        PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("infra")
    }

    fn plan_with(
        project: &Project,
        vars: &[String],
        state: &StateFile,
        drift: &DriftReport,
    ) -> Plan {
        let validated = project.validate(vars).unwrap();
        declarative::plan(
            &validated.loaded.set,
            &validated.graph,
            &project.registry,
            state,
            drift,
        )
    }

    fn apply(project: &Project, plan: &Plan, lock: &StateLock<'_>, state: &mut StateFile) {
        let options = ApplyOptions {
            jobs: 2,
            retry: RetryPolicy::no_retry(),
        };
        let report = declarative::apply(
            plan,
            &project.provider(),
            lock,
            state,
            &options,
            &CancelToken::new(),
            &mut NoProgress,
        )
        .unwrap();
        assert!(report.is_success(), "{report:?}");
    }

    #[test]
    fn test_sample_declarations_are_valid() {
        let state_dir = TempDir::new().unwrap();
        let project = Project::open(&sample(), Some(state_dir.path())).unwrap();
        assert_eq!(project.state_dir, state_dir.path());
        assert_eq!(project.settings.jobs, 4);

        let validated = project.validate(&[]).unwrap();
        assert_eq!(validated.loaded.set.len(), 7);
        let order = validated.graph.order();
        let position = |name: &str| order.iter().position(|n| n == name).unwrap();
        assert!(position("rg") < position("n1"));
        assert!(position("n1") < position("s1"));
        assert!(position("s1") < position("c1"));
        assert!(position("c1") < position("acr-pull"));
        assert!(position("acr") < position("acr-pull"));
    }

    #[test]
    fn test_sample_applies_and_converges() {
        let state_dir = TempDir::new().unwrap();
        let project = Project::open(&sample(), Some(state_dir.path())).unwrap();
        let store = project.store();
        let lock = store.lock("test", Duration::from_secs(1)).unwrap();
        let mut state = lock.load().unwrap();

        let plan = plan_with(&project, &[], &state, &DriftReport::none());
        assert_eq!(plan.summary().create, 7);
        apply(&project, &plan, &lock, &mut state);

        assert_eq!(state.len(), 7);
        let cluster = state.get("c1").unwrap();
        let pull = state.get("acr-pull").unwrap();
        assert_eq!(
            pull.attributes["principal_id"],
            cluster.outputs["principal_id"]
        );
        assert_eq!(
            state.get("s1").unwrap().attributes["virtual_network_id"],
            declarative::Value::String(state.get("n1").unwrap().identity.clone())
        );

        // Saved state reads back the same and plans nothing
        drop(lock);
        let reloaded = store.load().unwrap();
        assert_eq!(reloaded.resources, state.resources);
        let again = plan_with(&project, &[], &reloaded, &DriftReport::none());
        assert!(!again.has_changes());
    }

    #[test]
    fn test_variable_override_updates_in_place() {
        let state_dir = TempDir::new().unwrap();
        let project = Project::open(&sample(), Some(state_dir.path())).unwrap();
        let store = project.store();
        let lock = store.lock("test", Duration::from_secs(1)).unwrap();
        let mut state = lock.load().unwrap();
        let first = plan_with(&project, &[], &state, &DriftReport::none());
        apply(&project, &first, &lock, &mut state);
        let cluster_identity = state.get("c1").unwrap().identity.clone();

        let vars = ["location=westus".to_string()];
        let plan = plan_with(&project, &vars, &state, &DriftReport::none());
        let updated: Vec<&str> = plan
            .entries()
            .iter()
            .filter(|e| e.action == ChangeAction::Update)
            .map(|e| e.name())
            .collect();
        assert_eq!(updated.len(), 4, "{updated:?}");
        for name in ["rg", "n1", "acr", "c1"] {
            assert!(updated.contains(&name), "{name} should be updated");
        }

        apply(&project, &plan, &lock, &mut state);
        assert_eq!(state.get("c1").unwrap().identity, cluster_identity);
        assert!(!plan_with(&project, &vars, &state, &DriftReport::none()).has_changes());
    }

    #[test]
    fn test_deleted_cluster_is_recreated() {
        let state_dir = TempDir::new().unwrap();
        let project = Project::open(&sample(), Some(state_dir.path())).unwrap();
        let store = project.store();
        let lock = store.lock("test", Duration::from_secs(1)).unwrap();
        let mut state = lock.load().unwrap();
        let first = plan_with(&project, &[], &state, &DriftReport::none());
        apply(&project, &first, &lock, &mut state);

        let provider = project.provider();
        let cluster = state.get("c1").unwrap().clone();
        provider.delete(&cluster.address(), &cluster.identity).unwrap();

        let drift = declarative::refresh(&state, &provider, 2).unwrap();
        assert!(drift.is_drifted("c1"));
        assert_eq!(drift.drifted.len(), 1);

        let mut plan = plan_with(&project, &[], &state, &drift);
        assert_eq!(plan.unresolved_drift(), ["c1"]);
        assert!(plan.resolve_drift("c1", DriftResolution::Recreate));
        apply(&project, &plan, &lock, &mut state);

        let recreated = state.get("c1").unwrap();
        assert_ne!(recreated.identity, cluster.identity);
        assert_eq!(
            state.get("acr-pull").unwrap().attributes["principal_id"],
            recreated.outputs["principal_id"]
        );
    }
}
