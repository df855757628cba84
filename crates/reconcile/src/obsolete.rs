//! Removal of resources created by earlier releases.
//!
//! Entries are only ever appended. Pruning is not gated on the previously
//! installed version, so a fresh install issues deletes that find nothing.

use metrics::counter;
use rudder_apply::delete;
use rudder_core::{ResourceId, Result};
use rudder_kubehub::ResourceClient;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObsoleteNamespace {
    Fixed(&'static str),
    /// The namespace of the stack being reconciled
    Stack,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObsoleteResource {
    pub api_version: &'static str,
    pub kind: &'static str,
    pub namespace: ObsoleteNamespace,
    pub name: &'static str,
    /// Release whose upgrade retired the resource
    pub since: &'static str,
}

impl ObsoleteResource {
    pub fn id(&self, stack_namespace: &str) -> ResourceId {
        let ns = match self.namespace {
            ObsoleteNamespace::Fixed(ns) => ns,
            ObsoleteNamespace::Stack => stack_namespace,
        };
        ResourceId::new(self.api_version, self.kind, Some(ns), self.name)
    }
}

pub const OBSOLETE_RESOURCES: &[ObsoleteResource] = &[
    // ingress gateway moved out of istio-system
    ObsoleteResource {
        api_version: "v1",
        kind: "Service",
        namespace: ObsoleteNamespace::Fixed("istio-system"),
        name: "knative-ingressgateway",
        since: "0.3",
    },
    ObsoleteResource {
        api_version: "apps/v1",
        kind: "Deployment",
        namespace: ObsoleteNamespace::Fixed("istio-system"),
        name: "knative-ingressgateway",
        since: "0.3",
    },
    ObsoleteResource {
        api_version: "autoscaling/v1",
        kind: "HorizontalPodAutoscaler",
        namespace: ObsoleteNamespace::Fixed("istio-system"),
        name: "knative-ingressgateway",
        since: "0.3",
    },
    ObsoleteResource {
        api_version: "v1",
        kind: "ConfigMap",
        namespace: ObsoleteNamespace::Stack,
        name: "config-controller",
        since: "0.5",
    },
];

/// Delete every obsolete resource by exact identity. Missing ones count as
/// already clean; any other failure stops the pass. Returns how many existed.
pub async fn delete_obsolete<C: ResourceClient + ?Sized>(client: &C, stack_namespace: &str) -> Result<usize> {
    let mut deleted = 0;
    for entry in OBSOLETE_RESOURCES {
        let id = entry.id(stack_namespace);
        if delete(client, &id).await? {
            counter!("prune_deleted", 1u64);
            info!(resource = %id, since = entry.since, "deleted obsolete resource");
            deleted += 1;
        }
    }
    Ok(deleted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rudder_kubehub::{MemoryHub, Verb};
    use serde_json::json;

    #[test]
    fn stack_scoped_entries_follow_the_stack_namespace() {
        let cm = OBSOLETE_RESOURCES.iter().find(|e| e.kind == "ConfigMap").unwrap();
        assert_eq!(cm.id("x").namespace.as_deref(), Some("x"));
        let svc = OBSOLETE_RESOURCES.iter().find(|e| e.kind == "Service").unwrap();
        assert_eq!(svc.id("x").namespace.as_deref(), Some("istio-system"));
    }

    #[tokio::test]
    async fn missing_targets_are_not_an_error() {
        let hub = MemoryHub::new();
        assert_eq!(delete_obsolete(&hub, "x").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn present_targets_are_removed_and_unrelated_ones_kept() {
        let hub = MemoryHub::new();
        hub.insert(json!({
            "apiVersion": "v1", "kind": "ConfigMap",
            "metadata": { "name": "config-controller", "namespace": "x" }
        }))
        .unwrap();
        hub.insert(json!({
            "apiVersion": "v1", "kind": "ConfigMap",
            "metadata": { "name": "config-controller", "namespace": "other" }
        }))
        .unwrap();
        assert_eq!(delete_obsolete(&hub, "x").await.unwrap(), 1);
        assert_eq!(hub.len(), 1);
        assert_eq!(hub.ids()[0].namespace.as_deref(), Some("other"));
    }

    #[tokio::test]
    async fn delete_failures_abort() {
        let hub = MemoryHub::new();
        let first = OBSOLETE_RESOURCES[0].id("x");
        hub.fail_on(Verb::Delete, first, "forbidden");
        let err = delete_obsolete(&hub, "x").await.unwrap_err();
        assert!(err.to_string().contains("forbidden"));
    }
}
