//! CRUD verbs over any `Api<K>`, typed or dynamic

use std::fmt::Debug;

use kube::api::{Api, DeleteParams, PostParams};
use kube::Resource;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::info;

use cilikube_common::{Error, Result};

use super::params::ListQuery;

/// One page of a list
#[derive(Debug, Serialize)]
pub struct Page<K> {
    /// Objects on this page
    pub items: Vec<K>,
    /// Token for the next page, absent on the last one
    #[serde(rename = "continue", skip_serializing_if = "Option::is_none")]
    pub continue_token: Option<String>,
    /// Resource version of the list
    #[serde(rename = "resourceVersion", skip_serializing_if = "Option::is_none")]
    pub resource_version: Option<String>,
}

pub(crate) async fn list<K>(api: &Api<K>, cluster: &str, query: &ListQuery) -> Result<Page<K>>
where
    K: Clone + DeserializeOwned + Debug,
{
    let list = api
        .list(&query.list_params())
        .await
        .map_err(|e| Error::upstream(cluster, e))?;
    Ok(Page {
        items: list.items,
        continue_token: list.metadata.continue_.filter(|c| !c.is_empty()),
        resource_version: list.metadata.resource_version,
    })
}

pub(crate) async fn get<K>(api: &Api<K>, cluster: &str, name: &str) -> Result<K>
where
    K: Clone + DeserializeOwned + Debug,
{
    api.get(name).await.map_err(|e| Error::upstream(cluster, e))
}

pub(crate) async fn create<K>(
    api: &Api<K>,
    cluster: &str,
    namespace: Option<&str>,
    mut object: K,
) -> Result<K>
where
    K: Resource + Clone + Serialize + DeserializeOwned + Debug,
{
    if let Some(namespace) = namespace {
        object.meta_mut().namespace = Some(namespace.to_string());
    }
    let created = api
        .create(&PostParams::default(), &object)
        .await
        .map_err(|e| Error::upstream(cluster, e))?;
    info!(
        cluster,
        namespace = ?created.meta().namespace,
        name = ?created.meta().name,
        "resource created"
    );
    Ok(created)
}

pub(crate) async fn replace<K>(
    api: &Api<K>,
    cluster: &str,
    namespace: Option<&str>,
    name: &str,
    mut object: K,
) -> Result<K>
where
    K: Resource + Clone + Serialize + DeserializeOwned + Debug,
{
    let meta = object.meta_mut();
    let body_name = meta.name.clone().unwrap_or_default();
    if body_name.is_empty() {
        meta.name = Some(name.to_string());
    } else if body_name != name {
        return Err(Error::validation(format!(
            "body name {} does not match path name {}",
            body_name, name
        )));
    }
    if let Some(namespace) = namespace {
        meta.namespace = Some(namespace.to_string());
    }
    api.replace(name, &PostParams::default(), &object)
        .await
        .map_err(|e| Error::upstream(cluster, e))
}

/// Fetch, merge `partial` into it, then replace at the fetched resource
/// version so a concurrent writer surfaces as a conflict
pub(crate) async fn patch<K>(api: &Api<K>, cluster: &str, name: &str, partial: Value) -> Result<K>
where
    K: Resource + Clone + Serialize + DeserializeOwned + Debug,
{
    if !partial.is_object() {
        return Err(Error::validation("patch body must be a JSON object"));
    }
    let current = get(api, cluster, name).await?;
    let object = merged_object(&current, name, &partial)?;
    api.replace(name, &PostParams::default(), &object)
        .await
        .map_err(|e| Error::upstream(cluster, e))
}

/// `current` with `partial` merge-patched in, name and resource version pinned
fn merged_object<K>(current: &K, name: &str, partial: &Value) -> Result<K>
where
    K: Resource + Serialize + DeserializeOwned,
{
    let resource_version = current.meta().resource_version.clone();
    let mut merged = serde_json::to_value(current).map_err(|e| Error::internal(e.to_string()))?;
    json_patch::merge(&mut merged, partial);

    let Some(meta) = merged.get_mut("metadata").and_then(Value::as_object_mut) else {
        return Err(Error::validation("patch must not remove metadata"));
    };
    meta.insert("name".into(), Value::String(name.to_string()));
    match resource_version {
        Some(rv) => meta.insert("resourceVersion".into(), Value::String(rv)),
        None => meta.remove("resourceVersion"),
    };

    serde_json::from_value(merged)
        .map_err(|e| Error::validation(format!("patched object is invalid: {}", e)))
}

pub(crate) async fn delete<K>(api: &Api<K>, cluster: &str, name: &str) -> Result<()>
where
    K: Clone + DeserializeOwned + Debug,
{
    api.delete(name, &DeleteParams::default())
        .await
        .map_err(|e| Error::upstream(cluster, e))?;
    info!(cluster, name, "resource deleted");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::apps::v1::Deployment;
    use serde_json::json;

    fn deployment() -> Deployment {
        serde_json::from_value(json!({
            "metadata": {
                "name": "web",
                "namespace": "default",
                "resourceVersion": "41",
                "labels": {"app": "web", "tier": "front"}
            },
            "spec": {
                "replicas": 1,
                "selector": {"matchLabels": {"app": "web"}},
                "template": {"spec": {"containers": [{"name": "nginx"}]}}
            }
        }))
        .unwrap()
    }

    #[test]
    fn merge_keeps_untouched_fields_and_drops_nulls() {
        let patch = json!({
            "metadata": {"labels": {"tier": null, "team": "core"}},
            "spec": {"replicas": 3}
        });
        let merged = merged_object(&deployment(), "web", &patch).unwrap();
        let labels = merged.metadata.labels.unwrap();
        assert_eq!(labels.get("app").map(String::as_str), Some("web"));
        assert_eq!(labels.get("team").map(String::as_str), Some("core"));
        assert!(!labels.contains_key("tier"));
        let spec = merged.spec.unwrap();
        assert_eq!(spec.replicas, Some(3));
        assert_eq!(spec.template.spec.unwrap().containers[0].name, "nginx");
    }

    #[test]
    fn merge_pins_name_and_fetched_version() {
        let patch = json!({"metadata": {"name": "other", "resourceVersion": "1"}});
        let merged = merged_object(&deployment(), "web", &patch).unwrap();
        assert_eq!(merged.metadata.name.as_deref(), Some("web"));
        assert_eq!(merged.metadata.resource_version.as_deref(), Some("41"));
    }

    #[test]
    fn removing_metadata_is_rejected() {
        let err = merged_object(&deployment(), "web", &json!({"metadata": null})).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }
}
