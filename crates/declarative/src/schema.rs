//! Resource schema registry
//!
//! Every resource kind is registered with the attributes it accepts. The
//! registry validates declarations eagerly so malformed attributes fail
//! before a graph is ever built.

use crate::error::{Error, FieldError, Result};
use crate::types::{DeclarationSet, IDENTITY_ATTRIBUTE, ResourceDeclaration, Value};
use std::collections::BTreeMap;
use std::fmt;

/// Shape of an attribute value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValueType {
    String,
    Number,
    Bool,
    List(Box<ValueType>),
    /// Nested block of free-form fields
    Block,
}

impl ValueType {
    pub fn list_of(inner: ValueType) -> Self {
        Self::List(Box::new(inner))
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::String => write!(f, "string"),
            Self::Number => write!(f, "number"),
            Self::Bool => write!(f, "bool"),
            Self::List(inner) => write!(f, "list({inner})"),
            Self::Block => write!(f, "block"),
        }
    }
}

/// Whether an attribute must, may or must not be set by declarations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Presence {
    Required,
    Optional,
    /// Set by the provider only; excluded from diffing
    Computed,
}

/// Which declarations an attribute may reference
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReferencePolicy {
    /// Plain values only
    None,
    /// A reference to a declaration of any kind
    AnyKind,
    /// A reference to a declaration of one of these kinds
    Kinds(Vec<String>),
}

impl ReferencePolicy {
    pub fn allows_references(&self) -> bool {
        !matches!(self, Self::None)
    }

    pub fn allows_kind(&self, kind: &str) -> bool {
        match self {
            Self::None => false,
            Self::AnyKind => true,
            Self::Kinds(kinds) => kinds.iter().any(|k| k == kind),
        }
    }
}

/// Schema of a single attribute
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributeSchema {
    pub value_type: ValueType,
    pub presence: Presence,
    pub references: ReferencePolicy,
}

/// Schema of a resource kind
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceSchema {
    pub kind: String,
    pub attributes: BTreeMap<String, AttributeSchema>,
}

impl ResourceSchema {
    /// Start a schema; every kind gets a computed `id` attribute
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            attributes: BTreeMap::new(),
        }
        .computed(IDENTITY_ATTRIBUTE, ValueType::String)
    }

    fn attribute(
        mut self,
        name: &str,
        value_type: ValueType,
        presence: Presence,
        references: ReferencePolicy,
    ) -> Self {
        self.attributes.insert(
            name.to_string(),
            AttributeSchema {
                value_type,
                presence,
                references,
            },
        );
        self
    }

    pub fn required(self, name: &str, value_type: ValueType) -> Self {
        self.attribute(name, value_type, Presence::Required, ReferencePolicy::None)
    }

    pub fn optional(self, name: &str, value_type: ValueType) -> Self {
        self.attribute(name, value_type, Presence::Optional, ReferencePolicy::None)
    }

    pub fn computed(self, name: &str, value_type: ValueType) -> Self {
        self.attribute(name, value_type, Presence::Computed, ReferencePolicy::None)
    }

    /// A required attribute that may hold a reference to one of `kinds`
    ///
    /// An empty `kinds` slice allows references to any kind.
    pub fn required_ref(self, name: &str, value_type: ValueType, kinds: &[&str]) -> Self {
        self.attribute(name, value_type, Presence::Required, policy_for(kinds))
    }

    /// An optional attribute that may hold a reference to one of `kinds`
    pub fn optional_ref(self, name: &str, value_type: ValueType, kinds: &[&str]) -> Self {
        self.attribute(name, value_type, Presence::Optional, policy_for(kinds))
    }

    pub fn get(&self, attribute: &str) -> Option<&AttributeSchema> {
        self.attributes.get(attribute)
    }

    pub fn is_computed(&self, attribute: &str) -> bool {
        self.attributes
            .get(attribute)
            .is_some_and(|a| a.presence == Presence::Computed)
    }

    /// Validate one declaration, returning every field-level problem
    pub fn validate(&self, decl: &ResourceDeclaration) -> Vec<FieldError> {
        let address = decl.address.to_string();
        let mut errors = Vec::new();

        for (name, attr) in &self.attributes {
            if attr.presence == Presence::Required && !decl.attributes.contains_key(name) {
                errors.push(FieldError::new(&address, name, "required attribute is missing"));
            }
        }

        for (name, value) in &decl.attributes {
            let Some(attr) = self.attributes.get(name) else {
                errors.push(FieldError::new(&address, name, "unknown attribute"));
                continue;
            };
            if attr.presence == Presence::Computed {
                errors.push(FieldError::new(
                    &address,
                    name,
                    "attribute is computed by the provider and cannot be set",
                ));
                continue;
            }
            check_value(
                &address,
                name,
                value,
                &attr.value_type,
                attr.references.allows_references(),
                &mut errors,
            );
        }

        errors
    }
}

fn policy_for(kinds: &[&str]) -> ReferencePolicy {
    if kinds.is_empty() {
        ReferencePolicy::AnyKind
    } else {
        ReferencePolicy::Kinds(kinds.iter().map(|k| (*k).to_string()).collect())
    }
}

fn check_value(
    address: &str,
    path: &str,
    value: &Value,
    expected: &ValueType,
    allow_refs: bool,
    errors: &mut Vec<FieldError>,
) {
    match (value, expected) {
        (Value::Ref(_), _) if allow_refs => {}
        (Value::Ref(r), _) => errors.push(FieldError::new(
            address,
            path,
            format!("attribute cannot hold a reference (found reference to '{}')", r.target),
        )),
        // State is JSON, which has no infinity or NaN
        (Value::Number(n), ValueType::Number) if !n.is_finite() => errors.push(FieldError::new(
            address,
            path,
            format!("number must be finite (found {n})"),
        )),
        (Value::String(_), ValueType::String)
        | (Value::Number(_), ValueType::Number)
        | (Value::Bool(_), ValueType::Bool) => {}
        (Value::Block(fields), ValueType::Block) => {
            for (key, field) in fields {
                if !allow_refs && field.has_reference() {
                    errors.push(FieldError::new(
                        address,
                        format!("{path}.{key}"),
                        "attribute cannot hold a reference",
                    ));
                }
                if !is_finite(field) {
                    errors.push(FieldError::new(
                        address,
                        format!("{path}.{key}"),
                        "number must be finite",
                    ));
                }
            }
        }
        (Value::List(items), ValueType::List(inner)) => {
            for (i, item) in items.iter().enumerate() {
                check_value(address, &format!("{path}[{i}]"), item, inner, allow_refs, errors);
            }
        }
        (other, expected) => errors.push(FieldError::new(
            address,
            path,
            format!("expected {expected}, found {}", other.type_name()),
        )),
    }
}

fn is_finite(value: &Value) -> bool {
    match value {
        Value::Number(n) => n.is_finite(),
        Value::List(items) => items.iter().all(is_finite),
        Value::Block(fields) => fields.values().all(is_finite),
        Value::String(_) | Value::Bool(_) | Value::Ref(_) => true,
    }
}

/// Registry of known resource kinds
#[derive(Debug, Clone, Default)]
pub struct Registry {
    schemas: BTreeMap<String, ResourceSchema>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a schema, replacing any previous schema for the same kind
    pub fn register(&mut self, schema: ResourceSchema) -> &mut Self {
        self.schemas.insert(schema.kind.clone(), schema);
        self
    }

    /// Look up the schema of a kind
    pub fn lookup(&self, kind: &str) -> Option<&ResourceSchema> {
        self.schemas.get(kind)
    }

    /// Look up the schema a declaration needs, failing with `UnknownKind`
    pub fn schema_for(&self, decl: &ResourceDeclaration) -> Result<&ResourceSchema> {
        self.lookup(decl.kind()).ok_or_else(|| Error::UnknownKind {
            kind: decl.kind().to_string(),
            name: decl.name().to_string(),
        })
    }

    pub fn kinds(&self) -> impl Iterator<Item = &str> {
        self.schemas.keys().map(String::as_str)
    }

    /// Whether `attribute` of `kind` is computed-only
    ///
    /// Unknown kinds have no computed attributes beyond the identity.
    pub fn is_computed(&self, kind: &str, attribute: &str) -> bool {
        match self.lookup(kind) {
            Some(schema) => schema.is_computed(attribute),
            None => attribute == IDENTITY_ATTRIBUTE,
        }
    }

    /// Validate a whole declaration set
    ///
    /// An unknown kind fails immediately; field errors are collected across
    /// all declarations and reported together.
    pub fn validate_set(&self, set: &DeclarationSet) -> Result<()> {
        let mut errors = Vec::new();
        for decl in set.iter() {
            let schema = self.schema_for(decl)?;
            errors.extend(schema.validate(decl));
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(Error::Validation(errors))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Reference;

    fn subnet_schema() -> ResourceSchema {
        ResourceSchema::new("subnet")
            .required("address_prefixes", ValueType::list_of(ValueType::String))
            .required_ref("virtual_network_id", ValueType::String, &["virtual_network"])
            .optional("service_endpoints", ValueType::list_of(ValueType::String))
    }

    fn registry() -> Registry {
        let mut registry = Registry::new();
        registry
            .register(ResourceSchema::new("virtual_network").required(
                "address_space",
                ValueType::list_of(ValueType::String),
            ))
            .register(subnet_schema());
        registry
    }

    #[test]
    fn test_valid_declaration() {
        let decl = ResourceDeclaration::new("subnet", "s1")
            .with("address_prefixes", Value::List(vec!["10.0.1.0/24".into()]))
            .with("virtual_network_id", Reference::identity("n1"));
        assert!(subnet_schema().validate(&decl).is_empty());
    }

    #[test]
    fn test_field_errors_are_collected() {
        let decl = ResourceDeclaration::new("subnet", "s1")
            .with("address_prefixes", Value::List(vec![Value::Number(10.0)]))
            .with("colour", "blue")
            .with("id", "forced");

        let errors = subnet_schema().validate(&decl);
        let attributes: Vec<&str> = errors.iter().map(|e| e.attribute.as_str()).collect();
        assert!(attributes.contains(&"virtual_network_id"));
        assert!(attributes.contains(&"address_prefixes[0]"));
        assert!(attributes.contains(&"colour"));
        assert!(attributes.contains(&"id"));
        assert_eq!(errors.len(), 4);
    }

    #[test]
    fn test_reference_in_plain_attribute_rejected() {
        let decl = ResourceDeclaration::new("subnet", "s1")
            .with("address_prefixes", Value::List(vec![Value::Ref(Reference::identity("n1"))]))
            .with("virtual_network_id", Reference::identity("n1"));

        let errors = subnet_schema().validate(&decl);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].attribute, "address_prefixes[0]");
        assert!(errors[0].reason.contains("cannot hold a reference"));
    }

    #[test]
    fn test_non_finite_numbers_rejected() {
        let schema = ResourceSchema::new("random_id")
            .required("byte_length", ValueType::Number)
            .optional("keepers", ValueType::Block);
        let mut keepers = BTreeMap::new();
        keepers.insert("seed".to_string(), Value::Number(f64::NAN));
        let decl = ResourceDeclaration::new("random_id", "r")
            .with("byte_length", Value::Number(f64::INFINITY))
            .with("keepers", Value::Block(keepers));

        let errors = schema.validate(&decl);
        let attributes: Vec<&str> = errors.iter().map(|e| e.attribute.as_str()).collect();
        assert_eq!(attributes, vec!["byte_length", "keepers.seed"]);
        assert!(errors[0].reason.contains("finite"));

        let decl =
            ResourceDeclaration::new("random_id", "r").with("byte_length", Value::Number(8.0));
        assert!(schema.validate(&decl).is_empty());
    }

    #[test]
    fn test_unknown_kind() {
        let set = DeclarationSet::new(vec![ResourceDeclaration::new("dns_zone", "z")]).unwrap();
        match registry().validate_set(&set) {
            Err(Error::UnknownKind { kind, name }) => {
                assert_eq!(kind, "dns_zone");
                assert_eq!(name, "z");
            }
            other => panic!("expected UnknownKind, got {other:?}"),
        }
    }

    #[test]
    fn test_validate_set_reports_all_declarations() {
        let set = DeclarationSet::new(vec![
            ResourceDeclaration::new("virtual_network", "n1"),
            ResourceDeclaration::new("subnet", "s1"),
        ])
        .unwrap();

        match registry().validate_set(&set) {
            Err(Error::Validation(errors)) => {
                let addresses: Vec<&str> = errors.iter().map(|e| e.address.as_str()).collect();
                assert!(addresses.contains(&"virtual_network.n1"));
                assert!(addresses.contains(&"subnet.s1"));
            }
            other => panic!("expected Validation, got {other:?}"),
        }
    }

    #[test]
    fn test_computed_attributes() {
        let registry = registry();
        assert!(registry.is_computed("subnet", "id"));
        assert!(!registry.is_computed("subnet", "address_prefixes"));
        assert!(registry.is_computed("unknown_kind", "id"));
    }
}
