//! Core types for declarative resource management

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::PathBuf;

/// Attribute holding the provider-assigned identity of a resource
pub const IDENTITY_ATTRIBUTE: &str = "id";

/// Attribute name to value mapping, sorted for stable output
pub type Attributes = BTreeMap<String, Value>;

/// Address of a resource: its kind plus its logical name
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Address {
    pub kind: String,
    pub name: String,
}

impl Address {
    pub fn new(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.kind, self.name)
    }
}

fn default_reference_attribute() -> String {
    IDENTITY_ATTRIBUTE.to_string()
}

/// A typed reference from one declaration to another by logical name
///
/// In declaration files this is written `{ ref = "n1" }` for the identity,
/// or `{ ref = "c1", attr = "principal_id" }` for another attribute.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Reference {
    /// Logical name of the referenced declaration
    #[serde(rename = "ref")]
    pub target: String,
    /// Attribute of the target to read (defaults to its identity)
    #[serde(rename = "attr", default = "default_reference_attribute")]
    pub attribute: String,
}

impl Reference {
    /// Reference to the identity of `target`
    pub fn identity(target: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            attribute: default_reference_attribute(),
        }
    }

    /// Reference to a named attribute of `target`
    pub fn attribute(target: impl Into<String>, attribute: impl Into<String>) -> Self {
        Self {
            target: target.into(),
            attribute: attribute.into(),
        }
    }

    pub fn is_identity(&self) -> bool {
        self.attribute == IDENTITY_ATTRIBUTE
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.target, self.attribute)
    }
}

/// An attribute value
///
/// `Ref` only appears in declarations and in the `after` side of plan
/// entries whose value is not known until apply. Snapshots stored in state
/// are always fully resolved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Bool(bool),
    Number(f64),
    String(String),
    List(Vec<Value>),
    Ref(Reference),
    Block(BTreeMap<String, Value>),
}

impl Value {
    /// Short name of the value's type, for error messages
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Bool(_) => "bool",
            Self::Number(_) => "number",
            Self::String(_) => "string",
            Self::List(_) => "list",
            Self::Ref(_) => "reference",
            Self::Block(_) => "block",
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// Whether this value, or anything nested in it, is a reference
    pub fn has_reference(&self) -> bool {
        match self {
            Self::Ref(_) => true,
            Self::List(items) => items.iter().any(Value::has_reference),
            Self::Block(fields) => fields.values().any(Value::has_reference),
            _ => false,
        }
    }

    /// Collect every reference nested in this value with its attribute path
    pub fn collect_references<'a>(&'a self, path: &str, out: &mut Vec<(String, &'a Reference)>) {
        match self {
            Self::Ref(r) => out.push((path.to_string(), r)),
            Self::List(items) => {
                for (i, item) in items.iter().enumerate() {
                    item.collect_references(&format!("{path}[{i}]"), out);
                }
            }
            Self::Block(fields) => {
                for (key, field) in fields {
                    field.collect_references(&format!("{path}.{key}"), out);
                }
            }
            _ => {}
        }
    }

    /// Replace every reference using `lookup`; references it cannot
    /// resolve are left in place
    pub fn resolve_with<F>(&self, lookup: &F) -> Value
    where
        F: Fn(&Reference) -> Option<Value>,
    {
        match self {
            Self::Ref(r) => lookup(r).unwrap_or_else(|| self.clone()),
            Self::List(items) => Self::List(items.iter().map(|v| v.resolve_with(lookup)).collect()),
            Self::Block(fields) => Self::Block(
                fields
                    .iter()
                    .map(|(k, v)| (k.clone(), v.resolve_with(lookup)))
                    .collect(),
            ),
            _ => self.clone(),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Self::Number(n)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(items: Vec<T>) -> Self {
        Self::List(items.into_iter().map(Into::into).collect())
    }
}

impl From<Reference> for Value {
    fn from(r: Reference) -> Self {
        Self::Ref(r)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(b) => write!(f, "{b}"),
            Self::Number(n) if n.fract() == 0.0 && n.abs() < 1e15 => write!(f, "{}", *n as i64),
            Self::Number(n) => write!(f, "{n}"),
            Self::String(s) => write!(f, "{s:?}"),
            Self::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
            Self::Ref(r) => write!(f, "(known after apply: {r})"),
            Self::Block(fields) => {
                write!(f, "{{")?;
                for (i, (key, value)) in fields.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, " {key} = {value}")?;
                }
                write!(f, " }}")
            }
        }
    }
}

/// A static description of desired resource state
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceDeclaration {
    pub address: Address,
    pub attributes: Attributes,
    /// File the declaration was read from, if any
    pub source: Option<PathBuf>,
}

impl ResourceDeclaration {
    pub fn new(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            address: Address::new(kind, name),
            attributes: Attributes::new(),
            source: None,
        }
    }

    /// Builder-style attribute setter
    pub fn with(mut self, attribute: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.insert(attribute.into(), value.into());
        self
    }

    pub fn with_source(mut self, source: impl Into<PathBuf>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn kind(&self) -> &str {
        &self.address.kind
    }

    pub fn name(&self) -> &str {
        &self.address.name
    }

    /// Every reference held by this declaration, with attribute paths
    pub fn references(&self) -> Vec<(String, &Reference)> {
        let mut out = Vec::new();
        for (key, value) in &self.attributes {
            value.collect_references(key, &mut out);
        }
        out
    }

    fn origin(&self) -> String {
        self.source
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "<inline>".to_string())
    }
}

/// A validated collection of declarations with unique logical names
///
/// Declaration order is preserved and used to break ties when ordering.
#[derive(Debug, Clone, Default)]
pub struct DeclarationSet {
    declarations: Vec<ResourceDeclaration>,
    by_name: HashMap<String, usize>,
}

impl DeclarationSet {
    /// Build a set, rejecting duplicate logical names
    pub fn new(declarations: Vec<ResourceDeclaration>) -> Result<Self> {
        let mut by_name = HashMap::with_capacity(declarations.len());
        for (index, decl) in declarations.iter().enumerate() {
            if let Some(&first) = by_name.get(decl.name()) {
                let first: &ResourceDeclaration = &declarations[first];
                return Err(Error::DuplicateDeclaration {
                    name: decl.name().to_string(),
                    first: first.origin(),
                    second: decl.origin(),
                });
            }
            by_name.insert(decl.name().to_string(), index);
        }
        Ok(Self {
            declarations,
            by_name,
        })
    }

    pub fn get(&self, name: &str) -> Option<&ResourceDeclaration> {
        self.by_name.get(name).map(|&i| &self.declarations[i])
    }

    /// Position of a declaration in declaration order
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.by_name.get(name).copied()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ResourceDeclaration> {
        self.declarations.iter()
    }

    pub fn len(&self) -> usize {
        self.declarations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.declarations.is_empty()
    }
}
