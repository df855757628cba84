//! Manifest transformers: pure rewrites of a resource's payload.
//!
//! A transformer must leave resources it does not target untouched and must
//! never change the position of a resource in the manifest.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use rudder_core::{Error, Result};
use serde_json::{json, Value as Json};

use crate::Resource;

pub type Transformer = Box<dyn Fn(&mut Resource) -> Result<()> + Send + Sync>;

const CLUSTER_SCOPED: &[&str] = &[
    "APIService",
    "ClusterRole",
    "ClusterRoleBinding",
    "CustomResourceDefinition",
    "MutatingWebhookConfiguration",
    "Namespace",
    "PersistentVolume",
    "PriorityClass",
    "StorageClass",
    "ValidatingWebhookConfiguration",
];

pub fn is_cluster_scoped(kind: &str) -> bool {
    CLUSTER_SCOPED.contains(&kind)
}

fn set_service_account_namespaces(obj: &mut Json, ns: &str) {
    if let Some(subjects) = obj.get_mut("subjects").and_then(|s| s.as_array_mut()) {
        for subject in subjects.iter_mut() {
            if subject.get("kind").and_then(|k| k.as_str()) == Some("ServiceAccount") {
                subject["namespace"] = Json::String(ns.to_string());
            }
        }
    }
}

/// Move every namespaced resource into `ns`.
///
/// Also renames a `Namespace` resource, and points service account subjects,
/// webhook services and API service backends at `ns`.
pub fn inject_namespace(ns: impl Into<String>) -> Transformer {
    let ns: String = ns.into();
    Box::new(move |res: &mut Resource| -> Result<()> {
        let kind = res.kind().to_string();
        let obj = res.as_json_mut();
        match kind.as_str() {
            "Namespace" => {
                obj["metadata"]["name"] = Json::String(ns.clone());
            }
            "ClusterRoleBinding" => set_service_account_namespaces(obj, &ns),
            "MutatingWebhookConfiguration" | "ValidatingWebhookConfiguration" => {
                if let Some(hooks) = obj.get_mut("webhooks").and_then(|w| w.as_array_mut()) {
                    for hook in hooks.iter_mut() {
                        if let Some(svc) = hook.pointer_mut("/clientConfig/service") {
                            svc["namespace"] = Json::String(ns.clone());
                        }
                    }
                }
            }
            "APIService" => {
                if let Some(svc) = obj.pointer_mut("/spec/service") {
                    svc["namespace"] = Json::String(ns.clone());
                }
            }
            k if is_cluster_scoped(k) => {}
            _ => {
                obj["metadata"]["namespace"] = Json::String(ns.clone());
                if kind == "RoleBinding" {
                    set_service_account_namespaces(obj, &ns);
                }
            }
        }
        Ok(())
    })
}

/// Add `owner` as a controller reference to every namespaced resource living
/// in the owner's namespace. Already present references are not duplicated.
pub fn inject_owner(owner: OwnerReference, owner_namespace: impl Into<String>) -> Transformer {
    let owner_namespace: String = owner_namespace.into();
    Box::new(move |res: &mut Resource| -> Result<()> {
        if is_cluster_scoped(res.kind()) || res.namespace() != Some(owner_namespace.as_str()) {
            return Ok(());
        }
        let reference = serde_json::to_value(&owner)?;
        let meta = res
            .as_json_mut()
            .get_mut("metadata")
            .and_then(|m| m.as_object_mut())
            .ok_or_else(|| Error::transform("resource without metadata"))?;
        let refs = meta.entry("ownerReferences").or_insert_with(|| json!([]));
        let refs = refs
            .as_array_mut()
            .ok_or_else(|| Error::transform("metadata.ownerReferences is not a list"))?;
        if !refs.iter().any(|r| r.get("uid") == reference.get("uid")) {
            refs.push(reference);
        }
        Ok(())
    })
}

/// Merge `overrides[name]` into the data of ConfigMap `config-<name>`.
pub fn config_maps(overrides: BTreeMap<String, BTreeMap<String, String>>) -> Transformer {
    Box::new(move |res: &mut Resource| -> Result<()> {
        if res.kind() != "ConfigMap" {
            return Ok(());
        }
        let Some(entries) = res.name().strip_prefix("config-").and_then(|n| overrides.get(n)) else {
            return Ok(());
        };
        let entries = entries.clone();
        let obj = res
            .as_json_mut()
            .as_object_mut()
            .ok_or_else(|| Error::transform("ConfigMap is not an object"))?;
        let data = obj.entry("data").or_insert_with(|| json!({}));
        let data = data
            .as_object_mut()
            .ok_or_else(|| Error::transform("ConfigMap data is not a map"))?;
        for (k, v) in entries {
            data.insert(k, Json::String(v));
        }
        Ok(())
    })
}

/// Rewrite container images of Deployments.
///
/// An exact per-container override wins; otherwise `default` is used with
/// `${NAME}` replaced by the container name. Pull secrets are appended once.
pub fn images(
    default: Option<String>,
    overrides: BTreeMap<String, String>,
    pull_secrets: Vec<String>,
) -> Transformer {
    Box::new(move |res: &mut Resource| -> Result<()> {
        if res.kind() != "Deployment" {
            return Ok(());
        }
        let Some(pod) = res.as_json_mut().pointer_mut("/spec/template/spec") else {
            return Ok(());
        };
        if let Some(containers) = pod.get_mut("containers").and_then(|c| c.as_array_mut()) {
            for container in containers.iter_mut() {
                let name = container.get("name").and_then(|n| n.as_str()).unwrap_or_default().to_string();
                let image = overrides
                    .get(&name)
                    .cloned()
                    .or_else(|| default.as_ref().map(|d| d.replace("${NAME}", &name)));
                if let Some(image) = image {
                    container["image"] = Json::String(image);
                }
            }
        }
        if !pull_secrets.is_empty() {
            let pod = pod
                .as_object_mut()
                .ok_or_else(|| Error::transform("pod spec is not an object"))?;
            let secrets = pod.entry("imagePullSecrets").or_insert_with(|| json!([]));
            let secrets = secrets
                .as_array_mut()
                .ok_or_else(|| Error::transform("imagePullSecrets is not a list"))?;
            for name in &pull_secrets {
                if !secrets.iter().any(|s| s.get("name").and_then(|n| n.as_str()) == Some(name)) {
                    secrets.push(json!({ "name": name }));
                }
            }
        }
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn res(v: Json) -> Resource {
        Resource::new(v).unwrap()
    }

    #[test]
    fn namespace_injection_respects_scope() {
        let t = inject_namespace("x");
        let mut svc = res(json!({ "apiVersion": "v1", "kind": "Service", "metadata": { "name": "a", "namespace": "serving" } }));
        let mut role = res(json!({ "apiVersion": "rbac.authorization.k8s.io/v1", "kind": "ClusterRole", "metadata": { "name": "r" } }));
        let mut ns = res(json!({ "apiVersion": "v1", "kind": "Namespace", "metadata": { "name": "serving" } }));
        let mut crb = res(json!({
            "apiVersion": "rbac.authorization.k8s.io/v1",
            "kind": "ClusterRoleBinding",
            "metadata": { "name": "b" },
            "subjects": [
                { "kind": "ServiceAccount", "name": "controller", "namespace": "serving" },
                { "kind": "Group", "name": "system:masters" }
            ]
        }));
        for r in [&mut svc, &mut role, &mut ns, &mut crb] {
            t(r).unwrap();
        }
        assert_eq!(svc.namespace(), Some("x"));
        assert_eq!(role.namespace(), None);
        assert_eq!(ns.name(), "x");
        assert_eq!(crb.as_json()["subjects"][0]["namespace"], "x");
        assert!(crb.as_json()["subjects"][1].get("namespace").is_none());
    }

    #[test]
    fn owner_is_added_once_and_only_in_owner_namespace() {
        let owner = OwnerReference {
            api_version: "operator.rudder.dev/v1alpha1".into(),
            kind: "ServingStack".into(),
            name: "serving".into(),
            uid: "1234".into(),
            controller: Some(true),
            block_owner_deletion: Some(true),
        };
        let t = inject_owner(owner, "x");
        let mut inside = res(json!({ "apiVersion": "v1", "kind": "ConfigMap", "metadata": { "name": "a", "namespace": "x" } }));
        let mut outside = res(json!({ "apiVersion": "v1", "kind": "ConfigMap", "metadata": { "name": "a", "namespace": "y" } }));
        t(&mut inside).unwrap();
        t(&mut inside).unwrap();
        t(&mut outside).unwrap();
        let refs = inside.as_json()["metadata"]["ownerReferences"].as_array().unwrap();
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0]["uid"], "1234");
        assert_eq!(refs[0]["controller"], true);
        assert!(outside.as_json()["metadata"].get("ownerReferences").is_none());
    }

    #[test]
    fn config_overrides_target_prefixed_config_maps() {
        let mut overrides = BTreeMap::new();
        overrides.insert(
            "autoscaler".to_string(),
            BTreeMap::from([("enable-scale-to-zero".to_string(), "false".to_string())]),
        );
        let t = config_maps(overrides);
        let mut target = res(json!({
            "apiVersion": "v1", "kind": "ConfigMap",
            "metadata": { "name": "config-autoscaler", "namespace": "x" },
            "data": { "container-concurrency-target-default": "100" }
        }));
        let mut other = res(json!({ "apiVersion": "v1", "kind": "ConfigMap", "metadata": { "name": "config-gc", "namespace": "x" } }));
        t(&mut target).unwrap();
        t(&mut other).unwrap();
        assert_eq!(target.as_json()["data"]["enable-scale-to-zero"], "false");
        assert_eq!(target.as_json()["data"]["container-concurrency-target-default"], "100");
        assert!(other.as_json().get("data").is_none());
    }

    #[test]
    fn images_prefer_overrides_then_default_template() {
        let t = images(
            Some("mirror.local/${NAME}:v1".into()),
            BTreeMap::from([("queue".to_string(), "q:2".to_string())]),
            vec!["regcred".into()],
        );
        let mut dep = res(json!({
            "apiVersion": "apps/v1", "kind": "Deployment",
            "metadata": { "name": "controller", "namespace": "x" },
            "spec": { "template": { "spec": { "containers": [
                { "name": "controller", "image": "upstream/controller" },
                { "name": "queue", "image": "upstream/queue" }
            ] } } }
        }));
        t(&mut dep).unwrap();
        t(&mut dep).unwrap();
        let pod = &dep.as_json()["spec"]["template"]["spec"];
        assert_eq!(pod["containers"][0]["image"], "mirror.local/controller:v1");
        assert_eq!(pod["containers"][1]["image"], "q:2");
        assert_eq!(pod["imagePullSecrets"], json!([{ "name": "regcred" }]));
    }
}
