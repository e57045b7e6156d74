//! Query parameters shared by list and watch endpoints

use kube::api::{ListParams, WatchParams};
use serde::Deserialize;

/// Upper bound for watch timeouts; the API server rejects 295s and above
pub const MAX_WATCH_TIMEOUT_SECS: u32 = 290;

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

/// `labelSelector`, `fieldSelector`, `limit`, `continue`, `watch`,
/// `resourceVersion`, `timeoutSeconds` and (for custom resources) `namespace`
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ListQuery {
    /// Label selector, passed through unchanged
    pub label_selector: Option<String>,
    /// Field selector, passed through unchanged
    pub field_selector: Option<String>,
    /// Page size; 0 means no cap
    pub limit: Option<u32>,
    /// Continue token from a previous page, passed through verbatim
    #[serde(rename = "continue")]
    pub continue_token: Option<String>,
    /// Stream changes instead of listing
    pub watch: bool,
    /// Resource version to resume a watch from
    pub resource_version: Option<String>,
    /// Watch duration
    pub timeout_seconds: Option<u32>,
    /// Namespace for custom resources
    pub namespace: Option<String>,
}

impl ListQuery {
    /// kube list parameters
    pub fn list_params(&self) -> ListParams {
        let mut params = ListParams::default();
        if let Some(labels) = non_empty(&self.label_selector) {
            params = params.labels(labels);
        }
        if let Some(fields) = non_empty(&self.field_selector) {
            params = params.fields(fields);
        }
        if let Some(limit) = self.limit.filter(|l| *l > 0) {
            params = params.limit(limit);
        }
        if let Some(token) = self.continue_token.as_deref().filter(|t| !t.is_empty()) {
            params = params.continue_token(token);
        }
        params
    }

    /// kube watch parameters; `name` narrows the watch to one object
    pub fn watch_params(&self, name: Option<&str>) -> WatchParams {
        let mut params = WatchParams::default();
        if let Some(labels) = non_empty(&self.label_selector) {
            params = params.labels(labels);
        }
        match (name, non_empty(&self.field_selector)) {
            (Some(name), Some(fields)) => {
                params = params.fields(&format!("metadata.name={},{}", name, fields));
            }
            (Some(name), None) => {
                params = params.fields(&format!("metadata.name={}", name));
            }
            (None, Some(fields)) => params = params.fields(fields),
            (None, None) => {}
        }
        if let Some(timeout) = self.timeout_seconds.filter(|t| *t > 0) {
            params = params.timeout(timeout.min(MAX_WATCH_TIMEOUT_SECS));
        }
        params
    }

    /// Resource version to start a watch from; empty means "most recent"
    pub fn resource_version(&self) -> String {
        self.resource_version.clone().unwrap_or_default()
    }

    /// Namespace query parameter, if set
    pub fn namespace(&self) -> Option<&str> {
        non_empty(&self.namespace)
    }
}
