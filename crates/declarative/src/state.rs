//! Persisted, lockable resource state
//!
//! The state file is the only record of what exists. It is read freely but
//! written only through a [`StateLock`], which proves this process holds the
//! lock file next to it.

use crate::error::{Error, Result};
use crate::types::{Address, Attributes, IDENTITY_ATTRIBUTE, Reference, Value};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

/// Current state file schema version
pub const STATE_VERSION: u32 = 1;

/// File name used by [`StateStore::in_dir`]
pub const STATE_FILE_NAME: &str = "state.json";

const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(100);

// ============================================================================
// State Structures
// ============================================================================

/// Recorded state of one applied resource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceState {
    pub kind: String,
    pub name: String,
    /// Provider-assigned identity
    pub identity: String,
    /// Last-applied inputs, fully resolved
    #[serde(default)]
    pub attributes: Attributes,
    /// Attributes reported by the provider, including computed ones
    #[serde(default)]
    pub outputs: Attributes,
    /// Logical names this resource referenced when it was applied
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Creation order across the state file
    pub serial: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ResourceState {
    pub fn address(&self) -> Address {
        Address::new(&self.kind, &self.name)
    }

    /// Value of an attribute as other resources see it
    ///
    /// `id` is the identity; anything else comes from the provider outputs
    /// first, then from the applied inputs.
    pub fn attribute(&self, name: &str) -> Option<Value> {
        if name == IDENTITY_ATTRIBUTE {
            return Some(Value::String(self.identity.clone()));
        }
        self.outputs
            .get(name)
            .or_else(|| self.attributes.get(name))
            .cloned()
    }
}

/// The whole state file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateFile {
    /// Schema version of the file
    pub version: u32,
    /// Incremented on every write
    pub serial: u64,
    /// Identifies one line of history; survives every write
    pub lineage: String,
    /// Last creation serial handed out
    #[serde(default)]
    pub resource_serial: u64,
    pub last_updated: Option<DateTime<Utc>>,
    #[serde(default)]
    pub resources: BTreeMap<String, ResourceState>,
}

impl Default for StateFile {
    fn default() -> Self {
        Self::new()
    }
}

impl StateFile {
    /// Empty state with a fresh lineage
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            version: STATE_VERSION,
            serial: 0,
            lineage: format!(
                "{:x}-{:x}",
                now.timestamp_nanos_opt().unwrap_or_default(),
                std::process::id()
            ),
            resource_serial: 0,
            last_updated: None,
            resources: BTreeMap::new(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&ResourceState> {
        self.resources.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.resources.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ResourceState> {
        self.resources.values()
    }

    /// Entries in creation order
    pub fn by_serial(&self) -> Vec<&ResourceState> {
        let mut entries: Vec<&ResourceState> = self.resources.values().collect();
        entries.sort_by_key(|r| r.serial);
        entries
    }

    /// Record a newly created resource, replacing any previous entry
    pub fn record_created(
        &mut self,
        address: &Address,
        identity: String,
        attributes: Attributes,
        outputs: Attributes,
        dependencies: Vec<String>,
    ) -> &ResourceState {
        self.resource_serial += 1;
        let now = Utc::now();
        let entry = ResourceState {
            kind: address.kind.clone(),
            name: address.name.clone(),
            identity,
            attributes,
            outputs,
            dependencies,
            serial: self.resource_serial,
            created_at: now,
            updated_at: now,
        };
        self.resources.insert(address.name.clone(), entry);
        &self.resources[&address.name]
    }

    /// Record a successful in-place update
    ///
    /// Returns `None` if the resource is not in state.
    pub fn record_updated(
        &mut self,
        name: &str,
        attributes: Attributes,
        outputs: Attributes,
        dependencies: Vec<String>,
    ) -> Option<&ResourceState> {
        let entry = self.resources.get_mut(name)?;
        entry.attributes = attributes;
        entry.outputs = outputs;
        entry.dependencies = dependencies;
        entry.updated_at = Utc::now();
        Some(entry)
    }

    pub fn remove(&mut self, name: &str) -> Option<ResourceState> {
        self.resources.remove(name)
    }

    /// Resolve a reference from recorded state
    pub fn resolve(&self, reference: &Reference) -> Option<Value> {
        self.resources
            .get(&reference.target)
            .and_then(|r| r.attribute(&reference.attribute))
    }

    /// Reject files the store must not trust
    fn check(&self, path: &Path) -> Result<()> {
        let corrupt = |reason: String| Error::StateCorrupt {
            path: path.to_path_buf(),
            reason,
        };

        if self.version != STATE_VERSION {
            return Err(corrupt(format!(
                "unsupported version {} (expected {STATE_VERSION})",
                self.version
            )));
        }
        for (key, entry) in &self.resources {
            if key != &entry.name {
                return Err(corrupt(format!(
                    "entry '{key}' is recorded under name '{}'",
                    entry.name
                )));
            }
            if entry.serial > self.resource_serial {
                return Err(corrupt(format!(
                    "entry '{key}' has serial {} beyond counter {}",
                    entry.serial, self.resource_serial
                )));
            }
        }
        Ok(())
    }
}

// ============================================================================
// Lock
// ============================================================================

/// Who holds a state lock
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockInfo {
    pub id: String,
    pub operation: String,
    pub who: String,
    pub pid: u32,
    pub created_at: DateTime<Utc>,
}

impl LockInfo {
    fn new(operation: &str) -> Self {
        let now = Utc::now();
        let pid = std::process::id();
        Self {
            id: format!("{pid:x}-{:x}", now.timestamp_nanos_opt().unwrap_or_default()),
            operation: operation.to_string(),
            who: std::env::var("USER")
                .or_else(|_| std::env::var("USERNAME"))
                .unwrap_or_else(|_| "unknown".to_string()),
            pid,
            created_at: now,
        }
    }
}

impl fmt::Display for LockInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (pid {}, {} since {})",
            self.who,
            self.pid,
            self.operation,
            self.created_at.format("%Y-%m-%d %H:%M:%S UTC")
        )
    }
}

/// Proof that this process holds the state lock
///
/// The lock file is removed when the guard is dropped.
#[derive(Debug)]
pub struct StateLock<'a> {
    store: &'a StateStore,
    info: LockInfo,
}

impl StateLock<'_> {
    pub fn info(&self) -> &LockInfo {
        &self.info
    }

    pub fn load(&self) -> Result<StateFile> {
        self.store.load()
    }

    /// Persist state atomically, keeping one backup of the previous file
    pub fn save(&self, state: &mut StateFile) -> Result<()> {
        state.serial += 1;
        state.last_updated = Some(Utc::now());
        self.store.write(state)
    }
}

impl Drop for StateLock<'_> {
    fn drop(&mut self) {
        let path = self.store.lock_path();
        match self.store.lock_holder() {
            Ok(Some(holder)) if holder.id == self.info.id => {
                if let Err(e) = fs::remove_file(&path) {
                    log::warn!("Failed to release state lock {}: {e}", path.display());
                } else {
                    log::debug!("Released state lock {}", path.display());
                }
            }
            Ok(_) => log::warn!("State lock {} is no longer ours, leaving it", path.display()),
            Err(e) => log::warn!("Failed to read state lock {}: {e}", path.display()),
        }
    }
}

// ============================================================================
// Store
// ============================================================================

/// A state file on disk plus its lock and backup siblings
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

/// Write holder info into a lock file just created, removing it on failure
fn fill_lock(path: &Path, write: impl FnOnce() -> io::Result<()>) -> io::Result<()> {
    write().inspect_err(|_| {
        if let Err(e) = fs::remove_file(path) {
            log::warn!("Could not remove half-written lock {}: {e}", path.display());
        }
    })
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Store at `<dir>/state.json`
    pub fn in_dir(dir: impl AsRef<Path>) -> Self {
        Self::new(dir.as_ref().join(STATE_FILE_NAME))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn lock_path(&self) -> PathBuf {
        sibling(&self.path, ".lock")
    }

    pub fn backup_path(&self) -> PathBuf {
        sibling(&self.path, ".backup")
    }

    /// Load state from disk; a missing file is empty state
    pub fn load(&self) -> Result<StateFile> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                log::debug!("State file {} does not exist, using empty state", self.path.display());
                return Ok(StateFile::new());
            }
            Err(e) => return Err(e.into()),
        };

        let state: StateFile =
            serde_json::from_str(&content).map_err(|e| Error::StateCorrupt {
                path: self.path.clone(),
                reason: e.to_string(),
            })?;
        state.check(&self.path)?;

        log::debug!(
            "Loaded state from {} (serial {}, {} resources)",
            self.path.display(),
            state.serial,
            state.len()
        );
        Ok(state)
    }

    fn write(&self, state: &StateFile) -> Result<()> {
        if let Some(dir) = self.path.parent()
            && !dir.as_os_str().is_empty()
        {
            fs::create_dir_all(dir)?;
        }

        if self.path.exists() {
            fs::copy(&self.path, self.backup_path())?;
        }

        let tmp = sibling(&self.path, ".tmp");
        let content = serde_json::to_string_pretty(state)?;
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(content.as_bytes())?;
            file.write_all(b"\n")?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;

        log::debug!("Saved state to {} (serial {})", self.path.display(), state.serial);
        Ok(())
    }

    /// Acquire the state lock, polling until `timeout` expires
    pub fn lock(&self, operation: &str, timeout: Duration) -> Result<StateLock<'_>> {
        let lock_path = self.lock_path();
        if let Some(dir) = lock_path.parent()
            && !dir.as_os_str().is_empty()
        {
            fs::create_dir_all(dir)?;
        }

        let info = LockInfo::new(operation);
        let content = serde_json::to_string_pretty(&info)?;
        let deadline = Instant::now() + timeout;

        loop {
            match OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&lock_path)
            {
                Ok(mut file) => {
                    fill_lock(&lock_path, || {
                        file.write_all(content.as_bytes())?;
                        file.sync_all()
                    })?;
                    log::debug!("Acquired state lock {} for {operation}", lock_path.display());
                    return Ok(StateLock { store: self, info });
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    let now = Instant::now();
                    if now >= deadline {
                        let holder = self
                            .lock_holder()
                            .ok()
                            .flatten()
                            .map_or_else(|| "an unknown process".to_string(), |h| h.to_string());
                        return Err(Error::StateLocked {
                            path: lock_path,
                            holder,
                        });
                    }
                    log::trace!("State lock {} is held, waiting", lock_path.display());
                    thread::sleep(LOCK_POLL_INTERVAL.min(deadline - now));
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Current lock holder, if any
    ///
    /// A lock file that cannot be parsed still counts as held; its holder
    /// is reported as `None` only when no lock file exists.
    pub fn lock_holder(&self) -> Result<Option<LockInfo>> {
        let content = match fs::read_to_string(self.lock_path()) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_str(&content).ok())
    }

    pub fn is_locked(&self) -> bool {
        self.lock_path().exists()
    }

    /// Remove a stale lock regardless of who holds it
    ///
    /// Returns whether a lock file was removed.
    pub fn force_unlock(&self) -> Result<bool> {
        match fs::remove_file(self.lock_path()) {
            Ok(()) => {
                log::info!("Removed state lock {}", self.lock_path().display());
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}
