//! Rudder manifest engine: an ordered collection of resource templates that
//! can be rewritten by transformers and applied to, or deleted from, a cluster.
//!
//! Apply is a server-side apply per resource, in manifest order. Whether a
//! resource was created, changed or left alone is read off the live object
//! before and after the apply.

#![forbid(unsafe_code)]

use std::time::Instant;

use metrics::{counter, histogram};
use rudder_core::{Error, ResourceId, Result};
use rudder_kubehub::ResourceClient;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tracing::{debug, info};

mod diff;
mod load;
mod transform;

pub use diff::{diff_summary, strip_noisy, DiffSummary};
pub use load::parse_documents;
pub use transform::{config_maps, images, inject_namespace, inject_owner, is_cluster_scoped, Transformer};

/// One manifest entry. Always carries `apiVersion`, `kind` and `metadata.name`.
#[derive(Debug, Clone, PartialEq)]
pub struct Resource {
    raw: Json,
}

impl Resource {
    pub fn new(raw: Json) -> Result<Self> {
        ResourceId::from_json(&raw)?;
        if !raw.get("metadata").map(|m| m.is_object()).unwrap_or(false) {
            return Err(Error::manifest("metadata is not a map"));
        }
        Ok(Self { raw })
    }

    fn str_at(&self, pointer: &str) -> Option<&str> {
        self.raw.pointer(pointer).and_then(|v| v.as_str())
    }

    pub fn api_version(&self) -> &str {
        self.str_at("/apiVersion").unwrap_or_default()
    }

    pub fn kind(&self) -> &str {
        self.str_at("/kind").unwrap_or_default()
    }

    pub fn name(&self) -> &str {
        self.str_at("/metadata/name").unwrap_or_default()
    }

    pub fn namespace(&self) -> Option<&str> {
        self.str_at("/metadata/namespace").filter(|s| !s.is_empty())
    }

    pub fn id(&self) -> ResourceId {
        ResourceId::new(self.api_version(), self.kind(), self.namespace(), self.name())
    }

    pub fn as_json(&self) -> &Json {
        &self.raw
    }

    pub fn as_json_mut(&mut self) -> &mut Json {
        &mut self.raw
    }
}

/// What happened to one resource during apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Applied {
    Created,
    Updated,
    Unchanged,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplySummary {
    pub created: usize,
    pub updated: usize,
    pub unchanged: usize,
}

impl ApplySummary {
    fn record(&mut self, a: Applied) {
        match a {
            Applied::Created => self.created += 1,
            Applied::Updated => self.updated += 1,
            Applied::Unchanged => self.unchanged += 1,
        }
    }

    pub fn writes(&self) -> usize {
        self.created + self.updated
    }
}

/// Ordered collection of resources.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Manifest {
    resources: Vec<Resource>,
}

impl Manifest {
    pub fn new(resources: Vec<Resource>) -> Self {
        Self { resources }
    }

    pub fn resources(&self) -> &[Resource] {
        &self.resources
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    pub fn of_kind<'a>(&'a self, kind: &'a str) -> impl Iterator<Item = &'a Resource> + 'a {
        self.resources.iter().filter(move |r| r.kind() == kind)
    }

    /// Run each transformer, in order, over every resource. Resource order is
    /// preserved. On error the manifest may be partially rewritten.
    pub fn transform(&mut self, transformers: &[Transformer]) -> Result<()> {
        for t in transformers {
            for res in self.resources.iter_mut() {
                t(res)?;
            }
        }
        Ok(())
    }

    /// Apply every resource in order; stops at the first failure.
    pub async fn apply_all<C: ResourceClient + ?Sized>(&self, client: &C) -> Result<ApplySummary> {
        let t0 = Instant::now();
        let mut summary = ApplySummary::default();
        for res in &self.resources {
            summary.record(apply_one(client, res).await?);
        }
        histogram!("apply_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
        info!(
            created = summary.created,
            updated = summary.updated,
            unchanged = summary.unchanged,
            "manifest applied"
        );
        Ok(summary)
    }

    /// Delete every resource in reverse order. Absent resources are skipped.
    /// Returns how many were actually deleted.
    pub async fn delete_all<C: ResourceClient + ?Sized>(&self, client: &C) -> Result<usize> {
        let mut deleted = 0;
        for res in self.resources.iter().rev() {
            if delete(client, &res.id()).await? {
                deleted += 1;
            }
        }
        info!(deleted, total = self.resources.len(), "manifest deleted");
        Ok(deleted)
    }
}

fn resource_version(v: &Json) -> Option<&str> {
    v.pointer("/metadata/resourceVersion").and_then(|s| s.as_str())
}

/// Apply a single resource and classify the result against the live object.
pub async fn apply_one<C: ResourceClient + ?Sized>(client: &C, res: &Resource) -> Result<Applied> {
    let id = res.id();
    let live = client.get_opt(&id).await?;
    let applied = client.apply(res.as_json()).await?;
    match live {
        None => {
            counter!("apply_created", 1u64);
            debug!(resource = %id, "created");
            Ok(Applied::Created)
        }
        Some(live) if resource_version(&live) == resource_version(&applied) => {
            counter!("apply_unchanged", 1u64);
            Ok(Applied::Unchanged)
        }
        Some(live) => {
            let summary = diff_summary(&strip_noisy(applied), &strip_noisy(live));
            counter!("apply_updated", 1u64);
            debug!(resource = %id, adds = summary.adds, updates = summary.updates, removes = summary.removes, "updated");
            Ok(Applied::Updated)
        }
    }
}

/// Delete by exact identity. Returns `false` when there was nothing to delete.
pub async fn delete<C: ResourceClient + ?Sized>(client: &C, id: &ResourceId) -> Result<bool> {
    match client.delete(id).await {
        Ok(()) => {
            debug!(resource = %id, "deleted");
            Ok(true)
        }
        Err(e) if e.is_not_found() => Ok(false),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rudder_kubehub::{MemoryHub, Verb};
    use serde_json::json;

    fn sample() -> Manifest {
        Manifest::from_yaml_str(
            "\
apiVersion: v1
kind: Namespace
metadata:
  name: serving
---
apiVersion: v1
kind: ConfigMap
metadata:
  name: config-gc
  namespace: serving
data:
  retain: '1'
---
apiVersion: apps/v1
kind: Deployment
metadata:
  name: controller
  namespace: serving
spec:
  replicas: 1
",
        )
        .unwrap()
    }

    #[test]
    fn resource_requires_identity() {
        assert!(Resource::new(json!({ "apiVersion": "v1", "kind": "ConfigMap" })).is_err());
        assert!(Resource::new(json!({ "apiVersion": "v1", "kind": "ConfigMap", "metadata": { "name": "a" } })).is_ok());
    }

    #[test]
    fn transforms_preserve_order() {
        let mut m = sample();
        let before: Vec<_> = m.resources().iter().map(|r| (r.kind().to_string(), r.name().to_string())).collect();
        let rename_cm: Transformer = Box::new(|r: &mut Resource| -> Result<()> {
            if r.kind() == "ConfigMap" {
                r.as_json_mut()["data"]["touched"] = json!("yes");
            }
            Ok(())
        });
        m.transform(&[inject_namespace("x"), rename_cm]).unwrap();
        let after: Vec<_> = m.resources().iter().map(|r| (r.kind().to_string(), r.name().to_string())).collect();
        assert_eq!(after[1..], before[1..]);
        assert_eq!(after[0], ("Namespace".to_string(), "x".to_string()));
        assert_eq!(m.resources()[1].namespace(), Some("x"));
        assert_eq!(m.resources()[1].as_json()["data"]["touched"], "yes");
    }

    #[test]
    fn transform_error_is_returned() {
        let mut m = sample();
        let refuse: Transformer = Box::new(|r: &mut Resource| -> Result<()> {
            if r.kind() == "Deployment" {
                return Err(Error::transform("no deployments allowed"));
            }
            Ok(())
        });
        let err = m.transform(&[refuse]).unwrap_err();
        assert!(err.to_string().contains("no deployments allowed"));
    }

    #[tokio::test]
    async fn apply_twice_writes_once() {
        let hub = MemoryHub::new();
        let m = sample();
        let first = m.apply_all(&hub).await.unwrap();
        assert_eq!(first, ApplySummary { created: 3, updated: 0, unchanged: 0 });
        let applies: Vec<_> = hub.take_writes().into_iter().map(|(v, id)| (v, id.kind)).collect();
        assert_eq!(
            applies,
            vec![
                (Verb::Apply, "Namespace".to_string()),
                (Verb::Apply, "ConfigMap".to_string()),
                (Verb::Apply, "Deployment".to_string()),
            ]
        );
        let snapshot: Vec<_> = hub.ids().into_iter().map(|id| hub.object(&id)).collect();

        let second = m.apply_all(&hub).await.unwrap();
        assert_eq!(second, ApplySummary { created: 0, updated: 0, unchanged: 3 });
        assert!(hub.take_writes().is_empty());
        let again: Vec<_> = hub.ids().into_iter().map(|id| hub.object(&id)).collect();
        assert_eq!(snapshot, again);
    }

    #[tokio::test]
    async fn drift_is_repaired_and_live_only_fields_survive() {
        let hub = MemoryHub::new();
        let m = sample();
        m.apply_all(&hub).await.unwrap();
        let id = ResourceId::new("v1", "ConfigMap", Some("serving"), "config-gc");
        let mut live = hub.object(&id).unwrap();
        live["data"]["retain"] = json!("9");
        live["data"]["added-by-user"] = json!("kept");
        hub.insert(live).unwrap();

        let s = m.apply_all(&hub).await.unwrap();
        assert_eq!(s.updated, 1);
        let repaired = hub.object(&id).unwrap();
        assert_eq!(repaired["data"]["retain"], "1");
        assert_eq!(repaired["data"]["added-by-user"], "kept");
    }

    #[tokio::test]
    async fn server_normalized_objects_are_not_reapplied() {
        let hub = MemoryHub::new();
        let m = Manifest::from_yaml_str(
            "\
apiVersion: apps/v1
kind: Deployment
metadata:
  name: activator
  namespace: serving
  annotations: {}
spec:
  template:
    spec:
      containers:
      - name: activator
        image: activator:1
        resources:
          requests:
            cpu: 1000m
",
        )
        .unwrap();
        m.apply_all(&hub).await.unwrap();

        // Another writer stores the same object in the server's canonical form
        let id = ResourceId::new("apps/v1", "Deployment", Some("serving"), "activator");
        let mut live = hub.object(&id).unwrap();
        live["metadata"].as_object_mut().unwrap().remove("annotations");
        live["spec"]["template"]["spec"]["containers"][0]["resources"]["requests"]["cpu"] = "1".into();
        hub.insert(live).unwrap();
        hub.take_writes();

        for _ in 0..3 {
            let s = m.apply_all(&hub).await.unwrap();
            assert_eq!(s, ApplySummary { created: 0, updated: 0, unchanged: 1 });
            assert_eq!(s.writes(), 0);
        }
        assert!(hub.take_writes().is_empty());
    }

    #[tokio::test]
    async fn fields_dropped_from_the_template_are_removed() {
        let hub = MemoryHub::new();
        sample().apply_all(&hub).await.unwrap();
        let upgraded = Manifest::from_yaml_str(
            "\
apiVersion: v1
kind: ConfigMap
metadata:
  name: config-gc
  namespace: serving
data: {}
",
        )
        .unwrap();
        let s = upgraded.apply_all(&hub).await.unwrap();
        assert_eq!(s.updated, 1);
        let id = ResourceId::new("v1", "ConfigMap", Some("serving"), "config-gc");
        assert!(hub.object(&id).unwrap()["data"].get("retain").is_none());
    }

    #[tokio::test]
    async fn apply_stops_at_first_failure() {
        let hub = MemoryHub::new();
        let m = sample();
        let cm = ResourceId::new("v1", "ConfigMap", Some("serving"), "config-gc");
        hub.fail_on(Verb::Apply, cm, "quota exceeded");
        let err = m.apply_all(&hub).await.unwrap_err();
        assert!(err.to_string().contains("quota exceeded"));
        // Namespace went in, the deployment after the failure did not
        assert_eq!(hub.len(), 1);
    }

    #[tokio::test]
    async fn delete_all_runs_in_reverse_and_tolerates_missing() {
        let hub = MemoryHub::new();
        let m = sample();
        m.apply_all(&hub).await.unwrap();
        hub.take_writes();
        hub.remove(&ResourceId::new("v1", "ConfigMap", Some("serving"), "config-gc"));

        assert_eq!(m.delete_all(&hub).await.unwrap(), 2);
        let order: Vec<_> = hub.take_writes().into_iter().map(|(_, id)| id.kind).collect();
        assert_eq!(order, vec!["Deployment".to_string(), "Namespace".to_string()]);
        assert!(hub.is_empty());
        assert_eq!(m.delete_all(&hub).await.unwrap(), 0);
    }
}
