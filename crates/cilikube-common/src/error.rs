//! Error types for cilikube
//!
//! Errors are grouped by who caused them: the caller (validation, missing
//! selection), the registry (unknown or unavailable cluster), the credential
//! (unparseable kubeconfig, rejected auth) or the upstream API server. Upstream
//! errors keep the id of the cluster they came from so a failed request can be
//! traced back to the cluster that produced it.

use std::fmt;

use thiserror::Error;

/// Classification of an error returned by a Kubernetes API server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamKind {
    /// 404 - the object does not exist
    NotFound,
    /// 400/422 - the request or object was rejected as malformed
    Invalid,
    /// 409 - already exists or optimistic concurrency failure
    Conflict,
    /// 403 - RBAC denied the request
    Forbidden,
    /// 401 - the cluster credential was rejected
    Unauthorized,
    /// 410 - the requested resourceVersion is older than the server history
    Expired,
    /// Transport failure or any other status
    Other,
}

impl UpstreamKind {
    /// Classify an HTTP status code returned by the API server
    pub fn from_status(code: u16) -> Self {
        match code {
            404 => Self::NotFound,
            400 | 422 => Self::Invalid,
            409 => Self::Conflict,
            403 => Self::Forbidden,
            401 => Self::Unauthorized,
            410 => Self::Expired,
            _ => Self::Other,
        }
    }
}

impl fmt::Display for UpstreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::NotFound => "upstream not found",
            Self::Invalid => "invalid",
            Self::Conflict => "conflict",
            Self::Forbidden => "forbidden",
            Self::Unauthorized => "unauthorized",
            Self::Expired => "expired",
            Self::Other => "upstream error",
        };
        f.write_str(s)
    }
}

/// Main error type for cilikube operations
#[derive(Debug, Error)]
pub enum Error {
    /// The request named no cluster and no active cluster is set
    #[error("no cluster selected: pass clusterId or set an active cluster")]
    ClusterSelectionMissing,

    /// Unknown cluster id or name
    #[error("cluster not found: {0}")]
    ClusterNotFound(String),

    /// Cluster is registered but has no usable client
    #[error("cluster {cluster} unavailable: {reason}")]
    ClusterUnavailable {
        /// Cluster id
        cluster: String,
        /// Why the client is missing or failing
        reason: String,
    },

    /// No active cluster is selected
    #[error("no active cluster")]
    NoActive,

    /// Kubeconfig could not be parsed or lacks required fields
    #[error("invalid kubeconfig: {0}")]
    ConfigInvalid(String),

    /// The transport for a cluster could not be constructed
    #[error("cluster unreachable: {0}")]
    Unreachable(String),

    /// The cluster rejected the credential on first contact
    #[error("cluster rejected credentials: {0}")]
    AuthFailed(String),

    /// Error returned by a cluster's API server
    #[error("{kind} [{cluster}]: {message}")]
    Upstream {
        /// Cluster the request was routed to
        cluster: String,
        /// Error class
        kind: UpstreamKind,
        /// Upstream reason
        message: String,
    },

    /// A record with the same unique key already exists
    #[error("conflict: {0}")]
    Conflict(String),

    /// A stored record or sub-resource (e.g. a container) does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// Malformed request input
    #[error("validation error: {0}")]
    Validation(String),

    /// Request body exceeds the forwarding limit
    #[error("payload too large: {0}")]
    PayloadTooLarge(String),

    /// The stream peer closed the connection
    #[error("stream closed")]
    StreamClosed,

    /// Credential store failure
    #[error("storage error: {0}")]
    Storage(String),

    /// Static configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Internal/operational error
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Classify a kube-rs error returned while talking to `cluster`
    pub fn upstream(cluster: impl Into<String>, err: kube::Error) -> Self {
        let cluster = cluster.into();
        match err {
            kube::Error::Api(resp) => Self::Upstream {
                cluster,
                kind: UpstreamKind::from_status(resp.code),
                message: resp.message,
            },
            kube::Error::Auth(e) => Self::Upstream {
                cluster,
                kind: UpstreamKind::Unauthorized,
                message: e.to_string(),
            },
            other => Self::Upstream {
                cluster,
                kind: UpstreamKind::Other,
                message: other.to_string(),
            },
        }
    }

    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create an internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Upstream classification, if this error came from an API server
    pub fn upstream_kind(&self) -> Option<UpstreamKind> {
        match self {
            Self::Upstream { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    /// Whether this is an upstream 404
    pub fn is_upstream_not_found(&self) -> bool {
        self.upstream_kind() == Some(UpstreamKind::NotFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api_error(code: u16, message: &str) -> kube::Error {
        kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".to_string(),
            message: message.to_string(),
            reason: String::new(),
            code,
        })
    }

    #[test]
    fn upstream_errors_are_classified_by_status() {
        let cases = [
            (404, UpstreamKind::NotFound),
            (409, UpstreamKind::Conflict),
            (422, UpstreamKind::Invalid),
            (400, UpstreamKind::Invalid),
            (403, UpstreamKind::Forbidden),
            (401, UpstreamKind::Unauthorized),
            (410, UpstreamKind::Expired),
            (500, UpstreamKind::Other),
        ];

        for (code, expected) in cases {
            let err = Error::upstream("c1", api_error(code, "boom"));
            assert_eq!(err.upstream_kind(), Some(expected), "status {}", code);
        }
    }

    #[test]
    fn upstream_error_carries_cluster_and_message() {
        let err = Error::upstream("prod-eu", api_error(404, "pods \"web\" not found"));
        match &err {
            Error::Upstream {
                cluster, message, ..
            } => {
                assert_eq!(cluster, "prod-eu");
                assert_eq!(message, "pods \"web\" not found");
            }
            other => panic!("expected upstream error, got {:?}", other),
        }
        assert!(err.is_upstream_not_found());
        assert!(err.to_string().contains("[prod-eu]"));
    }

    #[test]
    fn non_upstream_errors_have_no_kind() {
        assert_eq!(Error::ClusterSelectionMissing.upstream_kind(), None);
        assert!(!Error::NotFound("x".into()).is_upstream_not_found());
    }
}
