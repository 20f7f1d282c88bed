//! File-backed provider
//!
//! Keeps "cloud" objects in `cloud.json` inside the state directory so plans
//! can be applied without a cloud account. Identities look like Azure
//! resource ids with a BLAKE3 suffix; computed attributes are derived from
//! the identity so they are stable across reads.
//!
//! Like the real API, it refuses to create a child whose parent id does not
//! exist, and to delete an object another object still points at.

use chrono::{DateTime, Utc};
use declarative::{
    Address, Attributes, Created, IDENTITY_ATTRIBUTE, Provider, ProviderError, ProviderResult,
    Value,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::kinds;

/// File name of the local cloud inside the state directory
pub const CLOUD_FILE_NAME: &str = "cloud.json";

const IDENTITY_PREFIX: &str = "/subscriptions/local";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CloudObject {
    kind: String,
    name: String,
    attributes: Attributes,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Cloud {
    /// Bumped on every create so recreated objects get new identities
    #[serde(default)]
    generation: u64,
    #[serde(default)]
    objects: BTreeMap<String, CloudObject>,
}

/// Provider backed by a JSON file
pub struct LocalProvider {
    path: PathBuf,
    guard: Mutex<()>,
}

impl LocalProvider {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            guard: Mutex::new(()),
        }
    }

    /// Provider keeping its file in `dir`
    pub fn in_dir(dir: impl AsRef<Path>) -> Self {
        Self::new(dir.as_ref().join(CLOUD_FILE_NAME))
    }

    /// Run `f` against the cloud file, saving it if `f` succeeds and
    /// reports a change
    fn with_cloud<T>(
        &self,
        f: impl FnOnce(&mut Cloud) -> ProviderResult<(T, bool)>,
    ) -> ProviderResult<T> {
        let _guard = self
            .guard
            .lock()
            .map_err(|_| ProviderError::rejected("local cloud is unusable after a panic"))?;

        let mut cloud = self.load()?;
        let (value, changed) = f(&mut cloud)?;
        if changed {
            self.save(&cloud)?;
        }
        Ok(value)
    }

    fn load(&self) -> ProviderResult<Cloud> {
        if !self.path.exists() {
            return Ok(Cloud::default());
        }
        let content = fs::read_to_string(&self.path).map_err(|e| {
            ProviderError::transient(format!("could not read {}: {e}", self.path.display()))
        })?;
        serde_json::from_str(&content).map_err(|e| {
            ProviderError::rejected(format!(
                "{} is not a valid cloud file: {e}",
                self.path.display()
            ))
        })
    }

    fn save(&self, cloud: &Cloud) -> ProviderResult<()> {
        let write = || -> std::io::Result<()> {
            if let Some(parent) = self.path.parent() {
                fs::create_dir_all(parent)?;
            }
            let json = serde_json::to_string_pretty(cloud)?;
            let tmp = self.path.with_extension("json.tmp");
            let mut file = fs::File::create(&tmp)?;
            file.write_all(json.as_bytes())?;
            file.sync_all()?;
            fs::rename(&tmp, &self.path)
        };
        write().map_err(|e| {
            ProviderError::transient(format!("could not write {}: {e}", self.path.display()))
        })
    }
}

impl Provider for LocalProvider {
    fn create(&self, address: &Address, attributes: &Attributes) -> ProviderResult<Created> {
        self.with_cloud(|cloud| {
            check_parents(cloud, address, attributes)?;

            cloud.generation += 1;
            let identity = identity_for(address, attributes, cloud.generation);
            if cloud.objects.contains_key(&identity) {
                return Err(ProviderError::rejected(format!("{identity} already exists")));
            }

            let now = Utc::now();
            cloud.objects.insert(
                identity.clone(),
                CloudObject {
                    kind: address.kind.clone(),
                    name: address.name.clone(),
                    attributes: attributes.clone(),
                    created_at: now,
                    updated_at: now,
                },
            );
            log::debug!("Created {address} as {identity}");

            let live = live_attributes(&address.kind, &identity, attributes);
            Ok((
                Created {
                    identity,
                    attributes: live,
                },
                true,
            ))
        })
    }

    fn read(&self, address: &Address, identity: &str) -> ProviderResult<Attributes> {
        self.with_cloud(|cloud| {
            let object = find(cloud, address, identity)?;
            Ok((
                live_attributes(&object.kind, identity, &object.attributes),
                false,
            ))
        })
    }

    fn update(
        &self,
        address: &Address,
        identity: &str,
        attributes: &Attributes,
    ) -> ProviderResult<Attributes> {
        self.with_cloud(|cloud| {
            find(cloud, address, identity)?;
            check_parents(cloud, address, attributes)?;

            let object = cloud
                .objects
                .get_mut(identity)
                .ok_or_else(|| ProviderError::not_found(identity))?;
            object.attributes = attributes.clone();
            object.updated_at = Utc::now();
            log::debug!("Updated {address} ({identity})");

            Ok((live_attributes(&address.kind, identity, attributes), true))
        })
    }

    fn delete(&self, address: &Address, identity: &str) -> ProviderResult<()> {
        self.with_cloud(|cloud| {
            find(cloud, address, identity)?;

            let users: Vec<&str> = cloud
                .objects
                .iter()
                .filter(|(id, object)| {
                    id.as_str() != identity && mentions(&object.attributes, identity)
                })
                .map(|(_, object)| object.name.as_str())
                .collect();
            if !users.is_empty() {
                return Err(ProviderError::rejected(format!(
                    "{address} is still used by {}",
                    users.join(", ")
                )));
            }

            cloud.objects.remove(identity);
            log::debug!("Deleted {address} ({identity})");
            Ok(((), true))
        })
    }
}

fn find<'c>(
    cloud: &'c Cloud,
    address: &Address,
    identity: &str,
) -> ProviderResult<&'c CloudObject> {
    match cloud.objects.get(identity) {
        Some(object) if object.kind == address.kind => Ok(object),
        Some(object) => Err(ProviderError::rejected(format!(
            "{identity} is a {}, not a {}",
            object.kind, address.kind
        ))),
        None => Err(ProviderError::not_found(identity)),
    }
}

/// Reject attributes pointing at local identities that do not exist
fn check_parents(cloud: &Cloud, address: &Address, attributes: &Attributes) -> ProviderResult<()> {
    let mut ids = Vec::new();
    for value in attributes.values() {
        collect_identities(value, &mut ids);
    }
    match ids.into_iter().find(|id| !cloud.objects.contains_key(*id)) {
        Some(missing) => Err(ProviderError::rejected(format!(
            "{address} refers to {missing}, which does not exist"
        ))),
        None => Ok(()),
    }
}

fn collect_identities<'v>(value: &'v Value, out: &mut Vec<&'v str>) {
    match value {
        Value::String(s) if s.starts_with(IDENTITY_PREFIX) => out.push(s),
        Value::List(items) => items.iter().for_each(|v| collect_identities(v, out)),
        Value::Block(fields) => fields.values().for_each(|v| collect_identities(v, out)),
        _ => {}
    }
}

fn mentions(attributes: &Attributes, identity: &str) -> bool {
    let mut ids = Vec::new();
    for value in attributes.values() {
        collect_identities(value, &mut ids);
    }
    ids.contains(&identity)
}

// ============================================================================
// Identities and Computed Attributes
// ============================================================================

/// Azure resource provider type for a kind
fn resource_type(kind: &str) -> &'static str {
    match kind {
        kinds::RESOURCE_GROUP => "resourceGroups",
        kinds::VIRTUAL_NETWORK => "providers/Microsoft.Network/virtualNetworks",
        kinds::SUBNET => "providers/Microsoft.Network/subnets",
        kinds::CONTAINER_REGISTRY => "providers/Microsoft.ContainerRegistry/registries",
        kinds::KUBERNETES_CLUSTER => "providers/Microsoft.ContainerService/managedClusters",
        kinds::ROLE_ASSIGNMENT => "providers/Microsoft.Authorization/roleAssignments",
        kinds::RANDOM_ID => "providers/Forma.Random/ids",
        _ => "providers/Forma.Local/objects",
    }
}

fn identity_for(address: &Address, attributes: &Attributes, generation: u64) -> String {
    let display = attributes
        .get("name")
        .and_then(Value::as_str)
        .unwrap_or(&address.name);

    let mut hasher = blake3::Hasher::new();
    hasher.update(address.kind.as_bytes());
    hasher.update(b"\0");
    hasher.update(address.name.as_bytes());
    hasher.update(b"\0");
    hasher.update(&generation.to_le_bytes());
    let hash = hasher.finalize().to_hex();

    format!(
        "{IDENTITY_PREFIX}/{}/{display}-{}",
        resource_type(&address.kind),
        &hash.as_str()[..8]
    )
}

/// Hex digest of `identity` plus `extra`, `len` characters long
fn digest(identity: &str, extra: &str, len: usize) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(identity.as_bytes());
    hasher.update(extra.as_bytes());
    let mut hex = hasher.finalize().to_hex().to_string();
    hex.truncate(len);
    hex
}

fn text_attribute<'a>(inputs: &'a Attributes, key: &str) -> &'a str {
    inputs.get(key).and_then(Value::as_str).unwrap_or_default()
}

/// Inputs plus whatever the provider computes for the kind
fn live_attributes(kind: &str, identity: &str, inputs: &Attributes) -> Attributes {
    let mut live = inputs.clone();
    let text = |key| text_attribute(inputs, key);

    match kind {
        kinds::CONTAINER_REGISTRY => {
            let server = format!("{}.azurecr.io", text("name").to_lowercase());
            live.insert("login_server".to_string(), Value::String(server));
        }
        kinds::KUBERNETES_CLUSTER => {
            let fqdn = format!(
                "{}-{}.hcp.{}.azmk8s.io",
                text("dns_prefix"),
                digest(identity, "fqdn", 8),
                text("location")
            );
            let id = digest(identity, "principal", 32);
            let principal = format!(
                "{}-{}-{}-{}-{}",
                &id[..8],
                &id[8..12],
                &id[12..16],
                &id[16..20],
                &id[20..32]
            );
            live.insert("fqdn".to_string(), Value::String(fqdn));
            live.insert("principal_id".to_string(), Value::String(principal));
        }
        kinds::RANDOM_ID => {
            let bytes = match inputs.get("byte_length") {
                Some(Value::Number(n)) if *n >= 1.0 => *n as usize,
                _ => 8,
            };
            let keepers = inputs
                .get("keepers")
                .map(ToString::to_string)
                .unwrap_or_default();
            live.insert(
                "hex".to_string(),
                Value::String(digest(identity, &keepers, (bytes * 2).min(64))),
            );
        }
        _ => {}
    }
    live.remove(IDENTITY_ATTRIBUTE);
    live
}
