//! Built-in Kubernetes kinds served through typed clients
//!
//! Every kind gets the same handler set, instantiated per type. Namespaced
//! kinds live under `/namespaces/{namespace}/{plural}` with a cluster-wide
//! list at `/{plural}`; cluster-scoped kinds live under `/{plural}`.

use std::collections::HashMap;
use std::fmt::Debug;

use axum::extract::Path;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, ReplicaSet, StatefulSet};
use k8s_openapi::api::autoscaling::v2::HorizontalPodAutoscaler;
use k8s_openapi::api::batch::v1::{CronJob, Job};
use k8s_openapi::api::core::v1::{
    ConfigMap, Endpoints, Event, Namespace, Node, PersistentVolume, PersistentVolumeClaim, Pod,
    Secret, Service, ServiceAccount,
};
use k8s_openapi::api::networking::v1::{Ingress, NetworkPolicy};
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding, Role, RoleBinding};
use k8s_openapi::api::storage::v1::StorageClass;
use kube::core::{ClusterResourceScope, NamespaceResourceScope};
use kube::{Api, Client, Resource};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use cilikube_common::validation::{validate_namespace, validate_resource_name};
use cilikube_common::{Error, Result};

use super::params::ListQuery;
use super::verbs;
use super::watch::watch_response;
use crate::envelope::{created, message, ok, Envelope};
use crate::error::ApiError;
use crate::extract::{ApiJson, ApiQuery, TargetCluster};
use crate::server::AppState;

/// How a scope turns into an `Api` handle
pub trait KindScope {
    /// Whether objects of this scope live in a namespace
    const NAMESPACED: bool;

    /// Handle for `K`, limited to `namespace` when given and applicable
    fn api<K>(client: Client, namespace: Option<&str>) -> Api<K>
    where
        K: Resource<DynamicType = (), Scope = Self>;
}

impl KindScope for NamespaceResourceScope {
    const NAMESPACED: bool = true;

    fn api<K>(client: Client, namespace: Option<&str>) -> Api<K>
    where
        K: Resource<DynamicType = (), Scope = Self>,
    {
        match namespace {
            Some(namespace) => Api::namespaced(client, namespace),
            None => Api::all(client),
        }
    }
}

impl KindScope for ClusterResourceScope {
    const NAMESPACED: bool = false;

    fn api<K>(client: Client, _namespace: Option<&str>) -> Api<K>
    where
        K: Resource<DynamicType = (), Scope = Self>,
    {
        Api::all(client)
    }
}

/// A built-in kind the gateway can serve
pub trait Kind:
    Resource<DynamicType = (), Scope: KindScope>
    + Clone
    + Serialize
    + DeserializeOwned
    + Debug
    + Send
    + Sync
    + 'static
{
}

impl<K> Kind for K where
    K: Resource<DynamicType = (), Scope: KindScope>
        + Clone
        + Serialize
        + DeserializeOwned
        + Debug
        + Send
        + Sync
        + 'static
{
}

fn is_namespaced<K: Kind>() -> bool {
    <K::Scope as KindScope>::NAMESPACED
}

fn kind_api<K: Kind>(target: &TargetCluster, namespace: Option<&str>) -> Api<K> {
    <K::Scope as KindScope>::api::<K>(target.client.client().clone(), namespace)
}

/// Namespace and name taken from the route
#[derive(Debug, Default)]
struct ResourcePath {
    namespace: Option<String>,
    name: Option<String>,
}

impl ResourcePath {
    /// Cluster-scoped item routes may capture the name as `namespace`
    /// (the `Namespace` kind), so fall back to it for those kinds.
    fn of<K: Kind>(params: &HashMap<String, String>) -> Result<Self> {
        let path = if is_namespaced::<K>() {
            Self {
                namespace: params.get("namespace").cloned(),
                name: params.get("name").cloned(),
            }
        } else {
            Self {
                namespace: None,
                name: params.get("name").or_else(|| params.get("namespace")).cloned(),
            }
        };
        if let Some(namespace) = &path.namespace {
            validate_namespace(namespace)?;
        }
        if let Some(name) = &path.name {
            validate_resource_name(name)?;
        }
        Ok(path)
    }

    fn name(&self) -> Result<&str> {
        self.name
            .as_deref()
            .ok_or_else(|| Error::validation("resource name is required"))
    }
}

async fn list<K: Kind>(
    target: TargetCluster,
    Path(params): Path<HashMap<String, String>>,
    ApiQuery(query): ApiQuery<ListQuery>,
) -> std::result::Result<Response, ApiError> {
    let path = ResourcePath::of::<K>(&params)?;
    let api = kind_api::<K>(&target, path.namespace.as_deref());
    if query.watch {
        return Ok(watch_response(api, target.id.clone(), &query, None).await?);
    }
    let page = verbs::list(&api, &target.id, &query).await?;
    Ok(ok(page).into_response())
}

async fn get_one<K: Kind>(
    target: TargetCluster,
    Path(params): Path<HashMap<String, String>>,
) -> std::result::Result<Json<Envelope<K>>, ApiError> {
    let path = ResourcePath::of::<K>(&params)?;
    let api = kind_api::<K>(&target, path.namespace.as_deref());
    Ok(ok(verbs::get(&api, &target.id, path.name()?).await?))
}

async fn create<K: Kind>(
    target: TargetCluster,
    Path(params): Path<HashMap<String, String>>,
    ApiJson(object): ApiJson<K>,
) -> std::result::Result<(StatusCode, Json<Envelope<K>>), ApiError> {
    let path = ResourcePath::of::<K>(&params)?;
    let api = kind_api::<K>(&target, path.namespace.as_deref());
    let object = verbs::create(&api, &target.id, path.namespace.as_deref(), object).await?;
    Ok(created(object))
}

async fn replace<K: Kind>(
    target: TargetCluster,
    Path(params): Path<HashMap<String, String>>,
    ApiJson(object): ApiJson<K>,
) -> std::result::Result<Json<Envelope<K>>, ApiError> {
    let path = ResourcePath::of::<K>(&params)?;
    let api = kind_api::<K>(&target, path.namespace.as_deref());
    let object = verbs::replace(
        &api,
        &target.id,
        path.namespace.as_deref(),
        path.name()?,
        object,
    )
    .await?;
    Ok(ok(object))
}

async fn patch<K: Kind>(
    target: TargetCluster,
    Path(params): Path<HashMap<String, String>>,
    ApiJson(partial): ApiJson<Value>,
) -> std::result::Result<Json<Envelope<K>>, ApiError> {
    let path = ResourcePath::of::<K>(&params)?;
    let api = kind_api::<K>(&target, path.namespace.as_deref());
    Ok(ok(verbs::patch(&api, &target.id, path.name()?, partial).await?))
}

async fn delete<K: Kind>(
    target: TargetCluster,
    Path(params): Path<HashMap<String, String>>,
) -> std::result::Result<Json<Envelope<()>>, ApiError> {
    let path = ResourcePath::of::<K>(&params)?;
    let api = kind_api::<K>(&target, path.namespace.as_deref());
    let name = path.name()?;
    verbs::delete(&api, &target.id, name).await?;
    Ok(message(format!("{} deleted", name)))
}

async fn watch_one<K: Kind>(
    target: TargetCluster,
    Path(params): Path<HashMap<String, String>>,
    ApiQuery(query): ApiQuery<ListQuery>,
) -> std::result::Result<Response, ApiError> {
    let path = ResourcePath::of::<K>(&params)?;
    let api = kind_api::<K>(&target, path.namespace.as_deref());
    Ok(watch_response(api, target.id.clone(), &query, Some(path.name()?)).await?)
}

fn namespaced<K: Kind>(router: Router<AppState>, plural: &str) -> Router<AppState> {
    router
        .route(&format!("/{plural}"), get(list::<K>))
        .route(
            &format!("/namespaces/{{namespace}}/{plural}"),
            get(list::<K>).post(create::<K>),
        )
        .route(
            &format!("/namespaces/{{namespace}}/{plural}/{{name}}"),
            get(get_one::<K>)
                .put(replace::<K>)
                .patch(patch::<K>)
                .delete(delete::<K>),
        )
        .route(
            &format!("/namespaces/{{namespace}}/{plural}/{{name}}/watch"),
            get(watch_one::<K>),
        )
}

/// `param` names the item capture; `Namespace` uses `namespace` so its
/// routes share a prefix with the namespaced kinds.
fn cluster_scoped<K: Kind>(router: Router<AppState>, plural: &str, param: &str) -> Router<AppState> {
    router
        .route(&format!("/{plural}"), get(list::<K>).post(create::<K>))
        .route(
            &format!("/{plural}/{{{param}}}"),
            get(get_one::<K>)
                .put(replace::<K>)
                .patch(patch::<K>)
                .delete(delete::<K>),
        )
        .route(
            &format!("/{plural}/{{{param}}}/watch"),
            get(watch_one::<K>),
        )
}

/// Plural names of the namespaced kinds served
pub const NAMESPACED_KINDS: &[&str] = &[
    "pods",
    "services",
    "deployments",
    "statefulsets",
    "daemonsets",
    "replicasets",
    "jobs",
    "cronjobs",
    "configmaps",
    "secrets",
    "ingresses",
    "persistentvolumeclaims",
    "serviceaccounts",
    "roles",
    "rolebindings",
    "events",
    "endpoints",
    "networkpolicies",
    "horizontalpodautoscalers",
];

/// Plural names of the cluster-scoped kinds served
pub const CLUSTER_KINDS: &[&str] = &[
    "namespaces",
    "nodes",
    "persistentvolumes",
    "storageclasses",
    "clusterroles",
    "clusterrolebindings",
];

pub(crate) fn routes() -> Router<AppState> {
    let router = Router::new();

    let router = namespaced::<Pod>(router, "pods");
    let router = namespaced::<Service>(router, "services");
    let router = namespaced::<Deployment>(router, "deployments");
    let router = namespaced::<StatefulSet>(router, "statefulsets");
    let router = namespaced::<DaemonSet>(router, "daemonsets");
    let router = namespaced::<ReplicaSet>(router, "replicasets");
    let router = namespaced::<Job>(router, "jobs");
    let router = namespaced::<CronJob>(router, "cronjobs");
    let router = namespaced::<ConfigMap>(router, "configmaps");
    let router = namespaced::<Secret>(router, "secrets");
    let router = namespaced::<Ingress>(router, "ingresses");
    let router = namespaced::<PersistentVolumeClaim>(router, "persistentvolumeclaims");
    let router = namespaced::<ServiceAccount>(router, "serviceaccounts");
    let router = namespaced::<Role>(router, "roles");
    let router = namespaced::<RoleBinding>(router, "rolebindings");
    let router = namespaced::<Event>(router, "events");
    let router = namespaced::<Endpoints>(router, "endpoints");
    let router = namespaced::<NetworkPolicy>(router, "networkpolicies");
    let router = namespaced::<HorizontalPodAutoscaler>(router, "horizontalpodautoscalers");

    let router = cluster_scoped::<Namespace>(router, "namespaces", "namespace");
    let router = cluster_scoped::<Node>(router, "nodes", "name");
    let router = cluster_scoped::<PersistentVolume>(router, "persistentvolumes", "name");
    let router = cluster_scoped::<StorageClass>(router, "storageclasses", "name");
    let router = cluster_scoped::<ClusterRole>(router, "clusterroles", "name");
    cluster_scoped::<ClusterRoleBinding>(router, "clusterrolebindings", "name")
}
