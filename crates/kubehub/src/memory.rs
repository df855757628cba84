//! In-memory hub with resource versions, optimistic concurrency and failure
//! injection. Mirrors the API server semantics the reconciler relies on.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use rudder_api::{stack_id, ServingStack};
use rudder_core::{Error, ObjectKey, ResourceId, Result};
use serde_json::Value as Json;
use uuid::Uuid;

use crate::{strip_managed_fields, ResourceClient, StackClient};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verb {
    Get,
    Apply,
    Delete,
    UpdateStatus,
}

#[derive(Debug, Clone)]
struct Failure {
    verb: Verb,
    id: ResourceId,
    message: String,
    conflict: bool,
    /// Calls left to fail; `None` fails until cleared
    remaining: Option<usize>,
}

#[derive(Default)]
struct Inner {
    objects: BTreeMap<ResourceId, Json>,
    /// Last configuration applied per object, standing in for managed fields
    applied: BTreeMap<ResourceId, Json>,
    stacks: BTreeMap<ObjectKey, ServingStack>,
    next_rv: u64,
    failures: Vec<Failure>,
    writes: Vec<(Verb, ResourceId)>,
}

impl Inner {
    fn bump(&mut self) -> String {
        self.next_rv += 1;
        self.next_rv.to_string()
    }

    fn check(&mut self, verb: Verb, id: &ResourceId) -> Result<()> {
        let Some(pos) = self.failures.iter().position(|f| f.verb == verb && &f.id == id) else {
            return Ok(());
        };
        let f = &mut self.failures[pos];
        let err = if f.conflict {
            Error::conflict(id, f.message.clone())
        } else {
            Error::api(id, f.message.clone())
        };
        let exhausted = match f.remaining.as_mut() {
            Some(n) => {
                *n = n.saturating_sub(1);
                *n == 0
            }
            None => false,
        };
        if exhausted {
            self.failures.remove(pos);
        }
        Err(err)
    }

    fn stamp(&mut self, obj: &mut Json, uid: Option<String>) {
        let rv = self.bump();
        if let Some(meta) = obj.get_mut("metadata").and_then(|m| m.as_object_mut()) {
            meta.insert("resourceVersion".into(), Json::String(rv));
            let uid = uid.unwrap_or_else(|| Uuid::new_v4().to_string());
            meta.insert("uid".into(), Json::String(uid));
        }
    }
}

/// Overlay `desired` onto `target`: objects merge recursively, anything else
/// is replaced by the desired value.
fn merge_into(target: &mut Json, desired: &Json) {
    match (target, desired) {
        (Json::Object(t), Json::Object(d)) => {
            for (k, dv) in d {
                match t.get_mut(k) {
                    Some(tv) => merge_into(tv, dv),
                    None => {
                        t.insert(k.clone(), dv.clone());
                    }
                }
            }
        }
        (t, d) => *t = d.clone(),
    }
}

/// Remove from `target` the fields `previous` applied that `desired` dropped.
fn prune_dropped(target: &mut Json, previous: &Json, desired: &Json) {
    let (Json::Object(t), Json::Object(p), Json::Object(d)) = (target, previous, desired) else {
        return;
    };
    for (k, pv) in p {
        match d.get(k) {
            None => {
                t.remove(k);
            }
            Some(dv) => {
                if let Some(tv) = t.get_mut(k) {
                    prune_dropped(tv, pv, dv);
                }
            }
        }
    }
}

/// Whole-core millicpu quantities in their canonical form, e.g. `1000m` is `1`.
fn canonical_quantity(q: &str) -> Option<String> {
    let milli: u64 = q.strip_suffix('m')?.parse().ok()?;
    (milli % 1000 == 0).then(|| (milli / 1000).to_string())
}

fn canonicalize_resources(v: &mut Json) {
    match v {
        Json::Object(map) => {
            for (k, child) in map.iter_mut() {
                if k == "resources" {
                    for bound in ["limits", "requests"] {
                        let Some(Json::Object(qs)) = child.get_mut(bound) else { continue };
                        for q in qs.values_mut() {
                            if let Some(c) = q.as_str().and_then(canonical_quantity) {
                                *q = Json::String(c);
                            }
                        }
                    }
                }
                canonicalize_resources(child);
            }
        }
        Json::Array(items) => items.iter_mut().for_each(canonicalize_resources),
        _ => {}
    }
}

/// Store the object the way the API server would: empty label or annotation
/// maps are not persisted and cpu quantities are canonical.
fn normalize(obj: &mut Json) {
    if let Some(meta) = obj.get_mut("metadata").and_then(|m| m.as_object_mut()) {
        for field in ["labels", "annotations"] {
            if meta.get(field).and_then(|v| v.as_object()).map(|m| m.is_empty()).unwrap_or(false) {
                meta.remove(field);
            }
        }
    }
    canonicalize_resources(obj);
}

fn meta_str<'a>(v: &'a Json, field: &str) -> Option<&'a str> {
    v.get("metadata").and_then(|m| m.get(field)).and_then(|s| s.as_str())
}

/// In-memory stand-in for the API server.
#[derive(Default)]
pub struct MemoryHub {
    inner: Mutex<Inner>,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Store an object as an external actor would, bypassing failure
    /// injection and the write log. Returns the stored copy.
    pub fn insert(&self, mut obj: Json) -> Result<Json> {
        let id = ResourceId::from_json(&obj)?;
        let mut inner = self.lock();
        let uid = inner.objects.get(&id).and_then(|o| meta_str(o, "uid")).map(str::to_string);
        normalize(&mut obj);
        inner.stamp(&mut obj, uid);
        inner.objects.insert(id, obj.clone());
        Ok(obj)
    }

    pub fn object(&self, id: &ResourceId) -> Option<Json> {
        self.lock().objects.get(id).cloned()
    }

    pub fn remove(&self, id: &ResourceId) -> Option<Json> {
        let mut inner = self.lock();
        inner.applied.remove(id);
        inner.objects.remove(id)
    }

    pub fn ids(&self) -> Vec<ResourceId> {
        self.lock().objects.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Create or replace a desired-state object, assigning uid and version.
    pub fn put_stack(&self, mut stack: ServingStack) -> ServingStack {
        let key = stack.key();
        let mut inner = self.lock();
        let rv = inner.bump();
        let uid = inner
            .stacks
            .get(&key)
            .and_then(|s| s.metadata.uid.clone())
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        stack.metadata.resource_version = Some(rv);
        stack.metadata.uid = Some(uid);
        inner.stacks.insert(key, stack.clone());
        stack
    }

    pub fn stack(&self, key: &ObjectKey) -> Option<ServingStack> {
        self.lock().stacks.get(key).cloned()
    }

    pub fn delete_stack(&self, key: &ObjectKey) -> Option<ServingStack> {
        self.lock().stacks.remove(key)
    }

    /// Make every `verb` on `id` fail with `message` until cleared.
    pub fn fail_on(&self, verb: Verb, id: ResourceId, message: impl Into<String>) {
        self.lock().failures.push(Failure { verb, id, message: message.into(), conflict: false, remaining: None });
    }

    /// Make the next `times` calls of `verb` on `id` fail with a conflict.
    pub fn conflict_on(&self, verb: Verb, id: ResourceId, times: usize) {
        self.lock().failures.push(Failure {
            verb,
            id,
            message: "the object has been modified".into(),
            conflict: true,
            remaining: Some(times),
        });
    }

    pub fn clear_failures(&self) {
        self.lock().failures.clear();
    }

    /// Drain the log of successful mutating calls made through the client traits.
    pub fn take_writes(&self) -> Vec<(Verb, ResourceId)> {
        std::mem::take(&mut self.lock().writes)
    }
}

#[async_trait]
impl ResourceClient for MemoryHub {
    async fn get(&self, id: &ResourceId) -> Result<Json> {
        let mut inner = self.lock();
        inner.check(Verb::Get, id)?;
        inner.objects.get(id).cloned().ok_or_else(|| Error::NotFound(id.clone()))
    }

    async fn apply(&self, obj: &Json) -> Result<Json> {
        let id = ResourceId::from_json(obj)?;
        let mut inner = self.lock();
        inner.check(Verb::Apply, &id)?;
        let mut desired = obj.clone();
        strip_managed_fields(&mut desired);
        let previous = inner.applied.insert(id.clone(), desired.clone());
        let live = inner.objects.get(&id).cloned();

        let mut next = match &live {
            Some(live) => {
                let mut next = live.clone();
                if let Some(previous) = &previous {
                    prune_dropped(&mut next, previous, &desired);
                }
                merge_into(&mut next, &desired);
                next
            }
            None => desired,
        };
        normalize(&mut next);
        if let Some(live) = live {
            if live == next {
                return Ok(live);
            }
        }
        let uid = next.get("metadata").and_then(|m| m.get("uid")).and_then(|u| u.as_str()).map(str::to_string);
        inner.stamp(&mut next, uid);
        inner.objects.insert(id.clone(), next.clone());
        inner.writes.push((Verb::Apply, id));
        Ok(next)
    }

    async fn delete(&self, id: &ResourceId) -> Result<()> {
        let mut inner = self.lock();
        inner.check(Verb::Delete, id)?;
        inner.objects.remove(id).ok_or_else(|| Error::NotFound(id.clone()))?;
        inner.applied.remove(id);
        inner.writes.push((Verb::Delete, id.clone()));
        Ok(())
    }
}

#[async_trait]
impl StackClient for MemoryHub {
    async fn get_stack(&self, key: &ObjectKey) -> Result<ServingStack> {
        let id = stack_id(key);
        let mut inner = self.lock();
        inner.check(Verb::Get, &id)?;
        inner.stacks.get(key).cloned().ok_or(Error::NotFound(id))
    }

    async fn update_stack_status(&self, stack: &ServingStack) -> Result<ServingStack> {
        let key = stack.key();
        let id = stack_id(&key);
        let mut inner = self.lock();
        inner.check(Verb::UpdateStatus, &id)?;
        let live = inner.stacks.get(&key).ok_or_else(|| Error::NotFound(id.clone()))?;
        if stack.metadata.resource_version != live.metadata.resource_version {
            return Err(Error::conflict(&id, "the object has been modified"));
        }
        let mut accepted = live.clone();
        accepted.status = stack.status.clone();
        accepted.metadata.resource_version = Some(inner.bump());
        inner.stacks.insert(key, accepted.clone());
        inner.writes.push((Verb::UpdateStatus, id));
        Ok(accepted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rudder_api::ServingStackSpec;

    fn cm(name: &str) -> Json {
        serde_json::json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": { "name": name, "namespace": "x" },
            "data": { "k": "v" }
        })
    }

    #[tokio::test]
    async fn apply_creates_then_is_a_no_op_for_the_same_config() {
        let hub = MemoryHub::new();
        let created = hub.apply(&cm("a")).await.unwrap();
        assert!(meta_str(&created, "uid").is_some());
        let again = hub.apply(&cm("a")).await.unwrap();
        assert_eq!(meta_str(&again, "resourceVersion"), meta_str(&created, "resourceVersion"));
        assert_eq!(hub.take_writes(), vec![(Verb::Apply, ResourceId::from_json(&created).unwrap())]);
    }

    #[tokio::test]
    async fn empty_metadata_maps_are_not_persisted() {
        let hub = MemoryHub::new();
        let mut obj = cm("a");
        obj["metadata"]["annotations"] = serde_json::json!({});
        let stored = hub.apply(&obj).await.unwrap();
        assert!(stored["metadata"].get("annotations").is_none());
        hub.take_writes();
        hub.apply(&obj).await.unwrap();
        assert!(hub.take_writes().is_empty());
    }

    #[test]
    fn cpu_quantities_are_canonical() {
        assert_eq!(canonical_quantity("1000m").as_deref(), Some("1"));
        assert_eq!(canonical_quantity("2000m").as_deref(), Some("2"));
        assert_eq!(canonical_quantity("500m"), None);
        assert_eq!(canonical_quantity("1Gi"), None);
    }

    #[tokio::test]
    async fn apply_removes_fields_dropped_since_the_last_apply() {
        let hub = MemoryHub::new();
        let mut v1 = cm("a");
        v1["data"]["old"] = Json::String("x".into());
        let live = hub.apply(&v1).await.unwrap();

        // Another writer owns this one
        let mut edited = live;
        edited["data"]["theirs"] = Json::String("y".into());
        hub.insert(edited).unwrap();

        let stored = hub.apply(&cm("a")).await.unwrap();
        assert!(stored["data"].get("old").is_none());
        assert_eq!(stored["data"]["theirs"], "y");
        assert_eq!(stored["data"]["k"], "v");
    }

    #[tokio::test]
    async fn counted_conflicts_run_out() {
        let hub = MemoryHub::new();
        let id = ResourceId::new("v1", "ConfigMap", Some("x"), "a");
        hub.conflict_on(Verb::Apply, id, 2);
        assert!(hub.apply(&cm("a")).await.unwrap_err().is_conflict());
        assert!(hub.apply(&cm("a")).await.unwrap_err().is_conflict());
        hub.apply(&cm("a")).await.unwrap();
    }

    #[tokio::test]
    async fn get_and_delete_report_not_found() {
        let hub = MemoryHub::new();
        let id = ResourceId::new("v1", "ConfigMap", Some("x"), "missing");
        assert!(hub.get(&id).await.unwrap_err().is_not_found());
        assert_eq!(hub.get_opt(&id).await.unwrap(), None);
        assert!(hub.delete(&id).await.unwrap_err().is_not_found());
        assert!(hub.take_writes().is_empty());
    }

    #[tokio::test]
    async fn injected_failures_apply_to_one_verb_and_identity() {
        let hub = MemoryHub::new();
        let id = ResourceId::new("v1", "ConfigMap", Some("x"), "a");
        hub.fail_on(Verb::Apply, id.clone(), "admission webhook denied");
        let err = hub.apply(&cm("a")).await.unwrap_err();
        assert!(err.to_string().contains("admission webhook denied"));
        // Unlimited failures stay until cleared
        assert!(hub.apply(&cm("a")).await.is_err());
        hub.apply(&cm("b")).await.unwrap();
        hub.clear_failures();
        hub.apply(&cm("a")).await.unwrap();
        assert_eq!(hub.len(), 2);
    }

    #[tokio::test]
    async fn status_update_returns_accepted_copy_with_new_version() {
        let hub = MemoryHub::new();
        let mut stack = ServingStack::new("serving", ServingStackSpec::default());
        stack.metadata.namespace = Some("x".into());
        let stored = hub.put_stack(stack);

        let mut local = stored.clone();
        local.status_mut().initialize_conditions();
        let accepted = hub.update_stack_status(&local).await.unwrap();
        assert_ne!(accepted.metadata.resource_version, stored.metadata.resource_version);
        assert_eq!(accepted.status, local.status);

        // Writing again from the old copy conflicts
        assert!(hub.update_stack_status(&local).await.unwrap_err().is_conflict());
    }
}
