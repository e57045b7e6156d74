//! HTTP surface for cilikube
//!
//! # Endpoints (under `/api/v1`)
//!
//! - `/clusters` - register, update, remove and activate clusters
//! - `/namespaces/{namespace}/{plural}`, `/{plural}` - built-in kinds
//! - `/crds`, `/crds/resources/{group}/{version}/{plural}` - custom resources
//! - `/namespaces/{namespace}/pods/{name}/logs|exec` - WebSocket streams
//! - `/proxy/{*path}`, `/clusters/{id}/proxy/{*path}` - transparent proxy
//!
//! Every resource and streaming request picks its cluster from `clusterId`
//! or `clusterName` in the query, falling back to the active cluster.

#![deny(missing_docs)]

pub mod envelope;
pub mod error;
pub mod extract;
pub mod gateway;
pub mod handlers;
pub mod server;
pub mod streaming;

pub use envelope::Envelope;
pub use error::ApiError;
pub use extract::TargetCluster;
pub use server::{build_router, start_server, AppState, ServerConfig};
