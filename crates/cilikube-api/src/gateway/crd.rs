//! Custom resources addressed by group, version and plural

use axum::extract::Path;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Api, DynamicObject};
use serde_json::Value;
use tracing::debug;

use cilikube_cluster::ResourceScope;
use cilikube_common::validation::{validate_namespace, validate_resource_name};
use cilikube_common::{Error, Result};

use super::params::ListQuery;
use super::verbs;
use super::watch::watch_response;
use crate::envelope::{created, message, ok, Envelope};
use crate::error::ApiError;
use crate::extract::{ApiJson, ApiQuery, TargetCluster};
use crate::server::AppState;

/// Path alias for the core API group
pub const CORE_GROUP_ALIAS: &str = "core";

type Gvp = (String, String, String);
type GvpName = (String, String, String, String);

/// Whether the operation addresses a single object in a namespace
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Namespacing {
    /// Cluster-wide access is fine when no namespace is given
    Optional,
    /// Namespaced kinds need a namespace
    Required,
}

fn normalize_group(group: &str) -> &str {
    if group == CORE_GROUP_ALIAS {
        ""
    } else {
        group
    }
}

async fn dynamic_api(
    target: &TargetCluster,
    (group, version, plural): (&str, &str, &str),
    namespace: Option<&str>,
    namespacing: Namespacing,
) -> Result<(Api<DynamicObject>, Option<String>)> {
    let group = normalize_group(group);
    let found = target
        .client
        .resolve_resource(group, version, plural)
        .await
        .map_err(|e| Error::upstream(&target.id, e))?
        .ok_or_else(|| {
            Error::NotFound(format!(
                "resource {} in {}/{} is not served by cluster {}",
                plural, group, version, target.id
            ))
        })?;
    let client = target.client.client().clone();
    let ar = &found.api_resource;
    debug!(cluster = %target.id, group, version, plural, scope = ?found.scope, "custom resource resolved");

    match (found.scope, namespace) {
        (ResourceScope::Namespaced, Some(namespace)) => {
            validate_namespace(namespace)?;
            Ok((
                Api::namespaced_with(client, namespace, ar),
                Some(namespace.to_string()),
            ))
        }
        (ResourceScope::Namespaced, None) if namespacing == Namespacing::Required => Err(
            Error::validation(format!("{} is namespaced; the namespace query parameter is required", plural)),
        ),
        (ResourceScope::Namespaced, None) | (ResourceScope::Cluster, _) => {
            Ok((Api::all_with(client, ar), None))
        }
    }
}

async fn list_definitions(
    target: TargetCluster,
    ApiQuery(query): ApiQuery<ListQuery>,
) -> std::result::Result<Json<Envelope<verbs::Page<CustomResourceDefinition>>>, ApiError> {
    let api: Api<CustomResourceDefinition> = Api::all(target.client.client().clone());
    Ok(ok(verbs::list(&api, &target.id, &query).await?))
}

async fn get_definition(
    target: TargetCluster,
    Path(name): Path<String>,
) -> std::result::Result<Json<Envelope<CustomResourceDefinition>>, ApiError> {
    validate_resource_name(&name)?;
    let api: Api<CustomResourceDefinition> = Api::all(target.client.client().clone());
    Ok(ok(verbs::get(&api, &target.id, &name).await?))
}

async fn list_resources(
    target: TargetCluster,
    Path((group, version, plural)): Path<Gvp>,
    ApiQuery(query): ApiQuery<ListQuery>,
) -> std::result::Result<Response, ApiError> {
    let (api, _) = dynamic_api(
        &target,
        (&group, &version, &plural),
        query.namespace(),
        Namespacing::Optional,
    )
    .await?;
    if query.watch {
        return Ok(watch_response(api, target.id.clone(), &query, None).await?);
    }
    Ok(ok(verbs::list(&api, &target.id, &query).await?).into_response())
}

async fn create_resource(
    target: TargetCluster,
    Path((group, version, plural)): Path<Gvp>,
    ApiQuery(query): ApiQuery<ListQuery>,
    ApiJson(object): ApiJson<DynamicObject>,
) -> std::result::Result<(StatusCode, Json<Envelope<DynamicObject>>), ApiError> {
    let (api, namespace) = dynamic_api(
        &target,
        (&group, &version, &plural),
        query.namespace(),
        Namespacing::Required,
    )
    .await?;
    let object = verbs::create(&api, &target.id, namespace.as_deref(), object).await?;
    Ok(created(object))
}

async fn get_resource(
    target: TargetCluster,
    Path((group, version, plural, name)): Path<GvpName>,
    ApiQuery(query): ApiQuery<ListQuery>,
) -> std::result::Result<Json<Envelope<DynamicObject>>, ApiError> {
    validate_resource_name(&name)?;
    let (api, _) = dynamic_api(
        &target,
        (&group, &version, &plural),
        query.namespace(),
        Namespacing::Required,
    )
    .await?;
    Ok(ok(verbs::get(&api, &target.id, &name).await?))
}

async fn replace_resource(
    target: TargetCluster,
    Path((group, version, plural, name)): Path<GvpName>,
    ApiQuery(query): ApiQuery<ListQuery>,
    ApiJson(object): ApiJson<DynamicObject>,
) -> std::result::Result<Json<Envelope<DynamicObject>>, ApiError> {
    validate_resource_name(&name)?;
    let (api, namespace) = dynamic_api(
        &target,
        (&group, &version, &plural),
        query.namespace(),
        Namespacing::Required,
    )
    .await?;
    let object = verbs::replace(&api, &target.id, namespace.as_deref(), &name, object).await?;
    Ok(ok(object))
}

async fn patch_resource(
    target: TargetCluster,
    Path((group, version, plural, name)): Path<GvpName>,
    ApiQuery(query): ApiQuery<ListQuery>,
    ApiJson(partial): ApiJson<Value>,
) -> std::result::Result<Json<Envelope<DynamicObject>>, ApiError> {
    validate_resource_name(&name)?;
    let (api, _) = dynamic_api(
        &target,
        (&group, &version, &plural),
        query.namespace(),
        Namespacing::Required,
    )
    .await?;
    Ok(ok(verbs::patch(&api, &target.id, &name, partial).await?))
}

async fn delete_resource(
    target: TargetCluster,
    Path((group, version, plural, name)): Path<GvpName>,
    ApiQuery(query): ApiQuery<ListQuery>,
) -> std::result::Result<Json<Envelope<()>>, ApiError> {
    validate_resource_name(&name)?;
    let (api, _) = dynamic_api(
        &target,
        (&group, &version, &plural),
        query.namespace(),
        Namespacing::Required,
    )
    .await?;
    verbs::delete(&api, &target.id, &name).await?;
    Ok(message(format!("{} deleted", name)))
}

pub(crate) fn routes() -> Router<AppState> {
    Router::new()
        .route("/crds", get(list_definitions))
        .route("/crds/definition/{name}", get(get_definition))
        .route(
            "/crds/resources/{group}/{version}/{plural}",
            get(list_resources).post(create_resource),
        )
        .route(
            "/crds/resources/{group}/{version}/{plural}/{name}",
            get(get_resource)
                .put(replace_resource)
                .patch(patch_resource)
                .delete(delete_resource),
        )
}
