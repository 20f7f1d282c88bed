//! Built-in resource kinds
//!
//! These are the kinds the demo service's infrastructure is declared with.
//! Attributes ending in `_id` hold the identity of another resource and are
//! normally written as `{ ref = "..." }`.

use declarative::{Registry, ResourceSchema, ValueType};

pub const RESOURCE_GROUP: &str = "resource_group";
pub const VIRTUAL_NETWORK: &str = "virtual_network";
pub const SUBNET: &str = "subnet";
pub const CONTAINER_REGISTRY: &str = "container_registry";
pub const KUBERNETES_CLUSTER: &str = "kubernetes_cluster";
pub const ROLE_ASSIGNMENT: &str = "role_assignment";
pub const RANDOM_ID: &str = "random_id";

/// Registry with every built-in kind
pub fn registry() -> Registry {
    let string = || ValueType::String;
    let strings = || ValueType::list_of(ValueType::String);

    let mut registry = Registry::new();
    registry
        .register(
            ResourceSchema::new(RESOURCE_GROUP)
                .required("name", string())
                .required("location", string())
                .optional("tags", ValueType::Block),
        )
        .register(
            ResourceSchema::new(VIRTUAL_NETWORK)
                .required("name", string())
                .required("location", string())
                .required("address_space", strings())
                .required_ref("resource_group_id", string(), &[RESOURCE_GROUP])
                .optional("tags", ValueType::Block),
        )
        .register(
            ResourceSchema::new(SUBNET)
                .required("name", string())
                .required("address_prefixes", strings())
                .required_ref("virtual_network_id", string(), &[VIRTUAL_NETWORK]),
        )
        .register(
            ResourceSchema::new(CONTAINER_REGISTRY)
                .required("name", string())
                .required("location", string())
                .required_ref("resource_group_id", string(), &[RESOURCE_GROUP])
                .optional("sku", string())
                .optional("admin_enabled", ValueType::Bool)
                .optional("tags", ValueType::Block)
                .computed("login_server", string()),
        )
        .register(
            ResourceSchema::new(KUBERNETES_CLUSTER)
                .required("name", string())
                .required("location", string())
                .required("dns_prefix", string())
                .required_ref("resource_group_id", string(), &[RESOURCE_GROUP])
                .optional_ref("subnet_id", string(), &[SUBNET])
                .optional("node_count", ValueType::Number)
                .optional("vm_size", string())
                .optional("kubernetes_version", string())
                .optional("tags", ValueType::Block)
                .computed("fqdn", string())
                .computed("principal_id", string()),
        )
        .register(
            ResourceSchema::new(ROLE_ASSIGNMENT)
                .required_ref("scope", string(), &[])
                .required("role_definition_name", string())
                .required_ref("principal_id", string(), &[KUBERNETES_CLUSTER]),
        )
        .register(
            ResourceSchema::new(RANDOM_ID)
                .required("byte_length", ValueType::Number)
                .optional("keepers", ValueType::Block)
                .computed("hex", string()),
        );
    registry
}
