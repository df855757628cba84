//! The `ServingStack` custom resource: the desired-state object a user creates
//! to have the serving stack installed into a namespace.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use kube::{CustomResource, Resource, ResourceExt};
use rudder_core::{ObjectKey, ResourceId};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub use rudder_core::StackStatus;

/// Desired configuration of the serving stack.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "operator.rudder.dev",
    version = "v1alpha1",
    kind = "ServingStack",
    plural = "servingstacks",
    shortname = "ss",
    namespaced,
    status = "StackStatus",
    printcolumn = r#"{"name":"Version","type":"string","jsonPath":".status.version"}"#,
    printcolumn = r#"{"name":"Installed","type":"string","jsonPath":".status.conditions[?(@.type==\"Install\")].status"}"#,
    printcolumn = r#"{"name":"Available","type":"string","jsonPath":".status.conditions[?(@.type==\"DeploymentsAvailable\")].status"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ServingStackSpec {
    /// Per config map overrides, keyed by the config map name without its
    /// `config-` prefix (`autoscaler` targets `config-autoscaler`).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub config: BTreeMap<String, BTreeMap<String, String>>,

    /// Image registry overrides for workload containers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registry: Option<Registry>,
}

/// Where workload images are pulled from.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Registry {
    /// Image template; `${NAME}` is replaced with the container name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,

    /// Exact image per container name, wins over `default`
    #[serde(default, rename = "override", skip_serializing_if = "BTreeMap::is_empty")]
    pub override_: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub image_pull_secrets: Vec<SecretRef>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct SecretRef {
    pub name: String,
}

/// Canonical identity of a `ServingStack` with the given key.
pub fn stack_id(key: &ObjectKey) -> ResourceId {
    ResourceId::new(
        ServingStack::api_version(&()),
        ServingStack::kind(&()),
        Some(key.namespace.as_str()),
        key.name.clone(),
    )
}

impl ServingStack {
    pub fn key(&self) -> ObjectKey {
        ObjectKey::new(self.namespace().unwrap_or_default(), self.name_any())
    }

    pub fn resource_id(&self) -> ResourceId {
        stack_id(&self.key())
    }

    /// Status, created empty on first access.
    pub fn status_mut(&mut self) -> &mut StackStatus {
        self.status.get_or_insert_with(StackStatus::default)
    }

    pub fn is_ready(&self) -> bool {
        self.status.as_ref().map(|s| s.is_ready()).unwrap_or(false)
    }
}
