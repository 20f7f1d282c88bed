//! # Declarative
//!
//! A reconciler for declared infrastructure.
//!
//! This crate takes a set of resource declarations, works out what has to
//! change compared to the recorded state, and drives a provider until the
//! two agree.
//!
//! ## Core Concepts
//!
//! - **ResourceDeclaration**: desired state of one resource, addressed by kind and logical name
//! - **Registry**: the resource kinds that exist and the attributes each accepts
//! - **Graph**: references between declarations, in dependency order
//! - **StateStore**: the lockable record of what has been applied
//! - **Plan**: ordered create/update/delete/no-op entries
//! - **apply**: executes a plan with bounded parallelism and per-resource retries
//!
//! ## Example
//!
//! ```ignore
//! use declarative::{
//!     ApplyOptions, CancelToken, DeclarationSet, DriftReport, Graph, NoProgress,
//!     Reference, Registry, ResourceDeclaration, ResourceSchema, StateStore, ValueType,
//! };
//! use std::time::Duration;
//!
//! let mut registry = Registry::new();
//! registry
//!     .register(ResourceSchema::new("virtual_network").required("address_space", ValueType::list_of(ValueType::String)))
//!     .register(ResourceSchema::new("subnet").required_ref("virtual_network_id", ValueType::String, &["virtual_network"]));
//!
//! let set = DeclarationSet::new(vec![
//!     ResourceDeclaration::new("virtual_network", "n1").with("address_space", vec!["10.0.0.0/16"]),
//!     ResourceDeclaration::new("subnet", "s1").with("virtual_network_id", Reference::identity("n1")),
//! ])?;
//! registry.validate_set(&set)?;
//! let graph = Graph::build(&set, &registry)?;
//!
//! let store = StateStore::in_dir(".forma");
//! let lock = store.lock("apply", Duration::from_secs(30))?;
//! let mut state = lock.load()?;
//!
//! let plan = declarative::plan(&set, &graph, &registry, &state, &DriftReport::none());
//! let report = declarative::apply(
//!     &plan, &provider, &lock, &mut state,
//!     &ApplyOptions::default(), &CancelToken::new(), &mut NoProgress,
//! )?;
//! assert!(report.is_success());
//! ```
//!
//! ## Callback Traits
//!
//! - [`Provider`]: performs create/read/update/delete calls
//! - [`ProgressCallback`]: receives progress updates during apply
//! - [`DriftResolver`]: decides what to do about resources that vanished
//!
//! This allows the crate to be used without hard dependencies on a
//! particular cloud API or UI framework.

pub mod applier;
pub mod context;
pub mod error;
pub mod graph;
pub mod planner;
pub mod provider;
pub mod retry;
pub mod schema;
pub mod state;
pub mod types;

// Re-export main types at crate root
pub use applier::{
    ApplyOptions, ApplyReport, ApplyStatus, ApplySummary, CancelToken, EntryOutcome, EntryReport,
    apply,
};
pub use context::{DriftResolver, FixedResolution, NoProgress, ProgressCallback, resolve_drift};
pub use error::{Error, FieldError, Result, UnresolvedRef};
pub use graph::{Graph, ReferenceEdge};
pub use planner::{
    ChangeAction, ChangePlanEntry, DriftReport, DriftResolution, Plan, PlanSummary, plan, refresh,
};
pub use provider::{Created, ErrorCategory, Provider, ProviderError, ProviderResult};
pub use retry::{RetryCallback, RetryPolicy, with_retry};
pub use schema::{AttributeSchema, Presence, ReferencePolicy, Registry, ResourceSchema, ValueType};
pub use state::{LockInfo, ResourceState, StateFile, StateLock, StateStore};
pub use types::{
    Address, Attributes, DeclarationSet, IDENTITY_ATTRIBUTE, Reference, ResourceDeclaration, Value,
};
