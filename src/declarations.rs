//! Declaration file loading
//!
//! A declaration directory holds any number of `*.toml` files (searched
//! recursively, read in path order). `forma.toml` at the top is settings,
//! not declarations, and hidden directories are skipped.
//!
//! ```toml
//! [variable.location]
//! default = "eastus"
//! description = "Azure region"
//!
//! [[resource]]
//! kind = "subnet"
//! name = "s1"
//! [resource.attributes]
//! address_prefixes = ["10.0.1.0/24"]
//! virtual_network_id = { ref = "n1" }
//! ```
//!
//! Variables are substituted here; the reconciler only ever sees values
//! and references.

use crate::config::SETTINGS_FILE;
use declarative::{DeclarationSet, Reference, ResourceDeclaration, Value};
use regex::Regex;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use walkdir::WalkDir;

/// Pattern every logical name and variable name must match
pub const NAME_PATTERN: &str = "^[a-z][a-z0-9_-]*$";

/// Prefix of environment variables that set declaration variables
pub const ENV_VAR_PREFIX: &str = "FORMA_VAR_";

/// Errors raised while turning files into a declaration set
#[derive(Debug, Error)]
pub enum DeclarationError {
    #[error("declaration directory {} does not exist", .0.display())]
    MissingDirectory(PathBuf),

    #[error("failed to read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to walk {}: {source}", .path.display())]
    Walk {
        path: PathBuf,
        source: walkdir::Error,
    },

    #[error("failed to parse {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("{}: {name}.{attribute}: {reason}", .path.display())]
    Malformed {
        path: PathBuf,
        name: String,
        attribute: String,
        reason: String,
    },

    #[error("invalid name '{name}' in {}: names must match ^[a-z][a-z0-9_-]*$", .path.display())]
    InvalidName { name: String, path: PathBuf },

    #[error(
        "variable '{name}' used by {used_by} has no value (add a default, set FORMA_VAR_{name} or pass --var {name}=...)"
    )]
    MissingVariable { name: String, used_by: String },

    #[error("variable '{name}' is declared twice ({} and {})", .first.display(), .second.display())]
    DuplicateVariable {
        name: String,
        first: PathBuf,
        second: PathBuf,
    },

    #[error("invalid --var '{0}': expected NAME=VALUE")]
    InvalidOverride(String),

    #[error(transparent)]
    Pattern(#[from] regex::Error),

    #[error(transparent)]
    Declaration(#[from] declarative::Error),
}

impl DeclarationError {
    /// Whether the declarations themselves are at fault, as opposed to
    /// the filesystem
    pub fn is_validation(&self) -> bool {
        match self {
            Self::MissingDirectory(_) | Self::Read { .. } | Self::Walk { .. } => false,
            Self::Declaration(e) => e.is_validation(),
            _ => true,
        }
    }
}

pub type Result<T> = std::result::Result<T, DeclarationError>;

// ============================================================================
// File Format
// ============================================================================

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct DeclarationFile {
    #[serde(default)]
    variable: BTreeMap<String, VariableSpec>,
    #[serde(default)]
    resource: Vec<RawResource>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct VariableSpec {
    default: Option<toml::Value>,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawResource {
    kind: String,
    name: String,
    #[serde(default)]
    attributes: toml::Table,
}

// ============================================================================
// Variables
// ============================================================================

/// Where a variable's value came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VariableSource {
    Override,
    Environment,
    Default,
}

/// A declared variable and its resolved value, if any
#[derive(Debug, Clone)]
pub struct Variable {
    pub name: String,
    pub description: Option<String>,
    pub value: Option<toml::Value>,
    pub source: Option<VariableSource>,
    pub declared_in: Option<PathBuf>,
}

/// Parse `NAME=VALUE` pairs given on the command line
pub fn parse_overrides(pairs: &[String]) -> Result<BTreeMap<String, String>> {
    let mut overrides = BTreeMap::new();
    for pair in pairs {
        let (name, value) = pair
            .split_once('=')
            .filter(|(name, _)| !name.is_empty())
            .ok_or_else(|| DeclarationError::InvalidOverride(pair.clone()))?;
        overrides.insert(name.to_string(), value.to_string());
    }
    Ok(overrides)
}

/// Interpret text from the command line or environment
///
/// Anything that reads as a TOML value (`3`, `true`, `["a", "b"]`) is taken
/// as that value; everything else is a plain string.
fn parse_text(text: &str) -> toml::Value {
    toml::from_str::<toml::Table>(&format!("value = {text}"))
        .ok()
        .and_then(|mut table| table.remove("value"))
        .unwrap_or_else(|| toml::Value::String(text.to_string()))
}

// ============================================================================
// Loading
// ============================================================================

/// Everything read from a declaration directory
#[derive(Debug)]
pub struct Loaded {
    pub set: DeclarationSet,
    pub files: Vec<PathBuf>,
    pub variables: BTreeMap<String, Variable>,
}

/// Loads declaration directories
pub struct Loader {
    names: Regex,
    overrides: BTreeMap<String, String>,
    env: BTreeMap<String, String>,
}

impl Loader {
    /// Loader reading `FORMA_VAR_*` from the process environment
    pub fn new(overrides: BTreeMap<String, String>) -> Result<Self> {
        let env = std::env::vars()
            .filter_map(|(key, value)| {
                key.strip_prefix(ENV_VAR_PREFIX)
                    .map(|name| (name.to_string(), value))
            })
            .collect();
        Self::with_env(overrides, env)
    }

    /// Loader with an explicit variable environment
    pub fn with_env(
        overrides: BTreeMap<String, String>,
        env: BTreeMap<String, String>,
    ) -> Result<Self> {
        Ok(Self {
            names: Regex::new(NAME_PATTERN)?,
            overrides,
            env,
        })
    }

    /// Read every declaration file under `dir`
    pub fn load(&self, dir: &Path) -> Result<Loaded> {
        if !dir.is_dir() {
            return Err(DeclarationError::MissingDirectory(dir.to_path_buf()));
        }

        let files = declaration_files(dir)?;
        log::info!("Reading {} declaration files from {}", files.len(), dir.display());

        let mut parsed = Vec::with_capacity(files.len());
        for path in &files {
            let content = fs::read_to_string(path).map_err(|source| DeclarationError::Read {
                path: path.clone(),
                source,
            })?;
            let file: DeclarationFile =
                toml::from_str(&content).map_err(|source| DeclarationError::Parse {
                    path: path.clone(),
                    source,
                })?;
            parsed.push((path.clone(), file));
        }

        let variables = self.collect_variables(&mut parsed)?;

        let mut declarations = Vec::new();
        for (path, file) in parsed {
            for raw in file.resource {
                declarations.push(self.declaration(&path, raw, &variables)?);
            }
        }

        let set = DeclarationSet::new(declarations)?;
        log::debug!("Loaded {} declarations", set.len());
        Ok(Loaded {
            set,
            files,
            variables,
        })
    }

    fn collect_variables(
        &self,
        parsed: &mut [(PathBuf, DeclarationFile)],
    ) -> Result<BTreeMap<String, Variable>> {
        let mut variables: BTreeMap<String, Variable> = BTreeMap::new();

        for (path, file) in parsed.iter_mut() {
            for (name, spec) in std::mem::take(&mut file.variable) {
                self.check_name(&name, path)?;
                if let Some(existing) = variables.get(&name) {
                    return Err(DeclarationError::DuplicateVariable {
                        name,
                        first: existing.declared_in.clone().unwrap_or_default(),
                        second: path.clone(),
                    });
                }
                let mut variable = Variable {
                    name: name.clone(),
                    description: spec.description,
                    value: None,
                    source: None,
                    declared_in: Some(path.clone()),
                };
                if let Some(default) = spec.default {
                    variable.value = Some(default);
                    variable.source = Some(VariableSource::Default);
                }
                variables.insert(name, variable);
            }
        }

        let mut set = |name: &str, text: &str, source: VariableSource| {
            let variable = variables.entry(name.to_string()).or_insert_with(|| {
                if source == VariableSource::Override {
                    log::warn!("--var {name} sets a variable that is not declared");
                }
                Variable {
                    name: name.to_string(),
                    description: None,
                    value: None,
                    source: None,
                    declared_in: None,
                }
            });
            variable.value = Some(parse_text(text));
            variable.source = Some(source);
        };
        for (name, text) in &self.env {
            set(name, text, VariableSource::Environment);
        }
        for (name, text) in &self.overrides {
            set(name, text, VariableSource::Override);
        }

        for variable in variables.values() {
            if let Some(source) = variable.source {
                log::debug!("Variable {} from {source:?}", variable.name);
            }
        }
        Ok(variables)
    }

    fn declaration(
        &self,
        path: &Path,
        raw: RawResource,
        variables: &BTreeMap<String, Variable>,
    ) -> Result<ResourceDeclaration> {
        self.check_name(&raw.name, path)?;

        let mut attributes = declarative::Attributes::new();
        for (attribute, value) in &raw.attributes {
            let site = Site {
                path,
                name: &raw.name,
                attribute,
            };
            attributes.insert(attribute.clone(), convert(value, Some(variables), &site)?);
        }

        let mut decl = ResourceDeclaration::new(raw.kind, raw.name).with_source(path);
        decl.attributes = attributes;
        Ok(decl)
    }

    fn check_name(&self, name: &str, path: &Path) -> Result<()> {
        if self.names.is_match(name) {
            Ok(())
        } else {
            Err(DeclarationError::InvalidName {
                name: name.to_string(),
                path: path.to_path_buf(),
            })
        }
    }
}

/// Sorted declaration files under `dir`
fn declaration_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let walker = WalkDir::new(dir)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !e.file_name().to_string_lossy().starts_with('.'));

    for entry in walker {
        let entry = entry.map_err(|source| DeclarationError::Walk {
            path: dir.to_path_buf(),
            source,
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        if path.extension().is_none_or(|ext| ext != "toml") {
            continue;
        }
        if entry.depth() == 1 && entry.file_name() == SETTINGS_FILE {
            continue;
        }
        files.push(path.to_path_buf());
    }
    files.sort();
    Ok(files)
}

// ============================================================================
// Value Conversion
// ============================================================================

/// Where a value is being converted, for error messages
struct Site<'a> {
    path: &'a Path,
    name: &'a str,
    attribute: &'a str,
}

impl Site<'_> {
    fn error(&self, reason: impl Into<String>) -> DeclarationError {
        DeclarationError::Malformed {
            path: self.path.to_path_buf(),
            name: self.name.to_string(),
            attribute: self.attribute.to_string(),
            reason: reason.into(),
        }
    }
}

/// Convert a TOML value, substituting `{ var }` and reading `{ ref, attr }`
///
/// `variables` is `None` while converting a variable's own value, which may
/// not refer to other variables.
fn convert(
    value: &toml::Value,
    variables: Option<&BTreeMap<String, Variable>>,
    site: &Site<'_>,
) -> Result<Value> {
    Ok(match value {
        toml::Value::String(s) => Value::String(s.clone()),
        toml::Value::Integer(i) => Value::Number(*i as f64),
        toml::Value::Float(f) if !f.is_finite() => {
            return Err(site.error(format!("number must be finite (found {f})")));
        }
        toml::Value::Float(f) => Value::Number(*f),
        toml::Value::Boolean(b) => Value::Bool(*b),
        toml::Value::Datetime(dt) => Value::String(dt.to_string()),
        toml::Value::Array(items) => Value::List(
            items
                .iter()
                .map(|item| convert(item, variables, site))
                .collect::<Result<_>>()?,
        ),
        toml::Value::Table(table) => {
            if let Some(var) = table.get("var") {
                return substitute(var, table, variables, site);
            }
            if table.contains_key("ref") {
                return reference(table, site);
            }
            let mut fields = BTreeMap::new();
            for (key, field) in table {
                fields.insert(key.clone(), convert(field, variables, site)?);
            }
            Value::Block(fields)
        }
    })
}

fn substitute(
    var: &toml::Value,
    table: &toml::Table,
    variables: Option<&BTreeMap<String, Variable>>,
    site: &Site<'_>,
) -> Result<Value> {
    if table.len() != 1 {
        return Err(site.error("a { var } table cannot have other keys"));
    }
    let Some(name) = var.as_str() else {
        return Err(site.error("var must be a variable name"));
    };
    let Some(variables) = variables else {
        return Err(site.error(format!("variable values cannot use other variables ({name})")));
    };

    match variables.get(name).and_then(|v| v.value.as_ref()) {
        Some(value) => convert(value, None, site),
        None => Err(DeclarationError::MissingVariable {
            name: name.to_string(),
            used_by: format!("{}.{}", site.name, site.attribute),
        }),
    }
}

fn reference(table: &toml::Table, site: &Site<'_>) -> Result<Value> {
    if let Some(extra) = table.keys().find(|k| *k != "ref" && *k != "attr") {
        return Err(site.error(format!("unexpected key '{extra}' in reference")));
    }
    let Some(target) = table.get("ref").and_then(toml::Value::as_str) else {
        return Err(site.error("ref must be a logical name"));
    };
    match table.get("attr") {
        None => Ok(Value::Ref(Reference::identity(target))),
        Some(attr) => match attr.as_str() {
            Some(attr) => Ok(Value::Ref(Reference::attribute(target, attr))),
            None => Err(site.error("attr must be an attribute name")),
        },
    }
}
