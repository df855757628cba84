//! Rudder core types: resource identities, status conditions and the error taxonomy
//! shared by every stage of the reconciler.

#![forbid(unsafe_code)]

use std::fmt;

use serde::{Deserialize, Serialize};

mod error;
mod status;

pub use error::{Error, Result};
pub use status::{Condition, ConditionStatus, StackStatus, DEPLOYMENTS_AVAILABLE, INSTALL};

pub mod prelude {
    pub use super::{Condition, ConditionStatus, Error, ObjectKey, ResourceId, Result, StackStatus};
}

/// Exact identity of a managed resource: `(apiVersion, kind, namespace, name)`.
///
/// `namespace` is `None` for cluster-scoped kinds.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceId {
    pub api_version: String,
    pub kind: String,
    pub namespace: Option<String>,
    pub name: String,
}

impl ResourceId {
    pub fn new(
        api_version: impl Into<String>,
        kind: impl Into<String>,
        namespace: Option<&str>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            api_version: api_version.into(),
            kind: kind.into(),
            namespace: namespace.map(|s| s.to_string()),
            name: name.into(),
        }
    }

    /// Split `apiVersion` into `(group, version)`; the core group is the empty string.
    pub fn group_version(&self) -> (&str, &str) {
        match self.api_version.split_once('/') {
            Some((g, v)) => (g, v),
            None => ("", self.api_version.as_str()),
        }
    }

    /// Extract the identity from a raw object. Fails when `apiVersion`, `kind` or
    /// `metadata.name` is missing.
    pub fn from_json(v: &serde_json::Value) -> Result<Self> {
        let api_version = v
            .get("apiVersion")
            .and_then(|s| s.as_str())
            .ok_or_else(|| Error::manifest("resource missing apiVersion"))?;
        let kind = v
            .get("kind")
            .and_then(|s| s.as_str())
            .ok_or_else(|| Error::manifest("resource missing kind"))?;
        let meta = v.get("metadata");
        let name = meta
            .and_then(|m| m.get("name"))
            .and_then(|s| s.as_str())
            .ok_or_else(|| Error::manifest(format!("{} missing metadata.name", kind)))?;
        let namespace = meta
            .and_then(|m| m.get("namespace"))
            .and_then(|s| s.as_str())
            .filter(|s| !s.is_empty());
        Ok(Self::new(api_version, kind, namespace, name))
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{} {} {}/{}", self.api_version, self.kind, ns, self.name),
            None => write!(f, "{} {} {}", self.api_version, self.kind, self.name),
        }
    }
}

/// Identity of a desired-state object handed to the reconciler by the trigger.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { namespace: namespace.into(), name: name.into() }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_version_splits_core_and_named_groups() {
        let svc = ResourceId::new("v1", "Service", Some("ns"), "a");
        assert_eq!(svc.group_version(), ("", "v1"));
        let dep = ResourceId::new("apps/v1", "Deployment", Some("ns"), "a");
        assert_eq!(dep.group_version(), ("apps", "v1"));
    }

    #[test]
    fn from_json_reads_identity_and_treats_empty_namespace_as_cluster_scoped() {
        let v = serde_json::json!({
            "apiVersion": "rbac.authorization.k8s.io/v1",
            "kind": "ClusterRole",
            "metadata": { "name": "serving-admin", "namespace": "" }
        });
        let id = ResourceId::from_json(&v).unwrap();
        assert_eq!(id.kind, "ClusterRole");
        assert_eq!(id.namespace, None);
        assert_eq!(id.to_string(), "rbac.authorization.k8s.io/v1 ClusterRole serving-admin");
    }

    #[test]
    fn from_json_errors_are_friendly() {
        let e = ResourceId::from_json(&serde_json::json!({ "kind": "Foo" })).unwrap_err();
        assert!(e.to_string().contains("missing apiVersion"), "e={}", e);
        let e = ResourceId::from_json(&serde_json::json!({ "apiVersion": "v1", "kind": "ConfigMap", "metadata": {} }))
            .unwrap_err();
        assert!(e.to_string().contains("ConfigMap missing metadata.name"), "e={}", e);
    }
}
