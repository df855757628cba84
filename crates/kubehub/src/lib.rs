//! Rudder kubehub: access to live resources and to the `ServingStack` objects.
//!
//! The reconciler only talks to the cluster through [`ResourceClient`] and
//! [`StackClient`]. [`KubeHub`] implements both against a real API server;
//! [`MemoryHub`] implements both in memory.

#![forbid(unsafe_code)]

use async_trait::async_trait;
use kube::{
    api::{Api, DeleteParams, Patch, PatchParams, PostParams},
    core::{ApiResource, DynamicObject, GroupVersionKind},
    discovery::{Discovery, Scope},
    Client,
};
use metrics::counter;
use rudder_api::{stack_id, ServingStack};
use rudder_core::{Error, ObjectKey, ResourceId, Result};
use rustc_hash::FxHashMap;
use serde_json::Value as Json;
use tokio::sync::RwLock;
use tracing::debug;

mod memory;

pub use memory::{MemoryHub, Verb};

/// Untyped access to managed resources, addressed by exact identity.
#[async_trait]
pub trait ResourceClient: Send + Sync {
    /// Fetch the live object; `Error::NotFound` when absent.
    async fn get(&self, id: &ResourceId) -> Result<Json>;
    /// Server-side apply of `obj` under the [`FIELD_MANAGER`]: creates the
    /// object when absent, otherwise merges it into the live one. Fields the
    /// manager applied before but `obj` no longer carries are removed. A
    /// no-op apply leaves the resource version untouched.
    async fn apply(&self, obj: &Json) -> Result<Json>;
    async fn delete(&self, id: &ResourceId) -> Result<()>;

    async fn get_opt(&self, id: &ResourceId) -> Result<Option<Json>> {
        match self.get(id).await {
            Ok(v) => Ok(Some(v)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }
}

/// Access to the desired-state objects and their status subresource.
#[async_trait]
pub trait StackClient: Send + Sync {
    async fn get_stack(&self, key: &ObjectKey) -> Result<ServingStack>;
    /// Write the status subresource and return the server's accepted copy.
    async fn update_stack_status(&self, stack: &ServingStack) -> Result<ServingStack>;
}

/// Field manager owning everything the reconciler applies.
pub const FIELD_MANAGER: &str = "rudder";

/// Both client halves, as required by the reconciler.
pub trait Hub: ResourceClient + StackClient {}

impl<T: ResourceClient + StackClient> Hub for T {}

pub(crate) fn strip_managed_fields(v: &mut Json) {
    if let Some(meta) = v.get_mut("metadata") {
        if let Some(obj) = meta.as_object_mut() {
            obj.remove("managedFields");
        }
    }
}

/// Translate a kube error into the reconciler's taxonomy.
pub fn map_kube_err(id: &ResourceId, e: kube::Error) -> Error {
    match e {
        kube::Error::Api(ae) if ae.code == 404 => Error::NotFound(id.clone()),
        kube::Error::Api(ae) if ae.code == 409 => Error::conflict(id, ae.message),
        other => Error::api(id, other.to_string()),
    }
}

/// Kube-backed hub. API resources are resolved once per kind and cached.
pub struct KubeHub {
    client: Client,
    resources: RwLock<FxHashMap<GroupVersionKind, (ApiResource, bool)>>,
}

impl KubeHub {
    pub fn new(client: Client) -> Self {
        Self { client, resources: RwLock::new(FxHashMap::default()) }
    }

    pub async fn try_default() -> Result<Self> {
        let client = Client::try_default().await.map_err(|e| Error::Api {
            id: ResourceId::new("v1", "Client", None, "default"),
            message: e.to_string(),
        })?;
        Ok(Self::new(client))
    }

    pub fn client(&self) -> Client {
        self.client.clone()
    }

    async fn find_api_resource(&self, id: &ResourceId) -> Result<(ApiResource, bool)> {
        let (group, version) = id.group_version();
        let gvk = GroupVersionKind::gvk(group, version, &id.kind);
        if let Some(found) = self.resources.read().await.get(&gvk) {
            return Ok(found.clone());
        }
        let discovery = Discovery::new(self.client.clone())
            .filter(&[group])
            .run()
            .await
            .map_err(|e| Error::api(id, format!("discovery failed: {}", e)))?;
        for g in discovery.groups() {
            for (ar, caps) in g.recommended_resources() {
                if ar.group == gvk.group && ar.version == gvk.version && ar.kind == gvk.kind {
                    let namespaced = matches!(caps.scope, Scope::Namespaced);
                    debug!(kind = %id.kind, plural = %ar.plural, namespaced, "resolved api resource");
                    self.resources.write().await.insert(gvk, (ar.clone(), namespaced));
                    return Ok((ar, namespaced));
                }
            }
        }
        Err(Error::api(id, format!("GVK not found: {}/{}/{}", gvk.group, gvk.version, gvk.kind)))
    }

    async fn api_for(&self, id: &ResourceId) -> Result<Api<DynamicObject>> {
        let (ar, namespaced) = self.find_api_resource(id).await?;
        if !namespaced {
            return Ok(Api::all_with(self.client.clone(), &ar));
        }
        match id.namespace.as_deref() {
            Some(ns) => Ok(Api::namespaced_with(self.client.clone(), ns, &ar)),
            None => Err(Error::api(id, "namespace required for namespaced kind")),
        }
    }

    fn stacks(&self, namespace: &str) -> Api<ServingStack> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

fn to_json(obj: &DynamicObject) -> Result<Json> {
    let mut v = serde_json::to_value(obj)?;
    strip_managed_fields(&mut v);
    Ok(v)
}

#[async_trait]
impl ResourceClient for KubeHub {
    async fn get(&self, id: &ResourceId) -> Result<Json> {
        let api = self.api_for(id).await?;
        let obj = api.get(&id.name).await.map_err(|e| map_kube_err(id, e))?;
        to_json(&obj)
    }

    async fn apply(&self, obj: &Json) -> Result<Json> {
        let id = ResourceId::from_json(obj)?;
        let api = self.api_for(&id).await?;
        let pp = PatchParams::apply(FIELD_MANAGER).force();
        let applied = api
            .patch(&id.name, &pp, &Patch::Apply(obj))
            .await
            .map_err(|e| map_kube_err(&id, e))?;
        counter!("kube_writes_total", 1u64, "verb" => "apply");
        to_json(&applied)
    }

    async fn delete(&self, id: &ResourceId) -> Result<()> {
        let api = self.api_for(id).await?;
        api.delete(&id.name, &DeleteParams::background())
            .await
            .map_err(|e| map_kube_err(id, e))?;
        counter!("kube_writes_total", 1u64, "verb" => "delete");
        Ok(())
    }
}

#[async_trait]
impl StackClient for KubeHub {
    async fn get_stack(&self, key: &ObjectKey) -> Result<ServingStack> {
        self.stacks(&key.namespace)
            .get(&key.name)
            .await
            .map_err(|e| map_kube_err(&stack_id(key), e))
    }

    async fn update_stack_status(&self, stack: &ServingStack) -> Result<ServingStack> {
        let key = stack.key();
        let data = serde_json::to_vec(stack)?;
        let accepted = self
            .stacks(&key.namespace)
            .replace_status(&key.name, &PostParams::default(), data)
            .await
            .map_err(|e| map_kube_err(&stack_id(&key), e))?;
        counter!("kube_writes_total", 1u64, "verb" => "update_status");
        Ok(accepted)
    }
}
