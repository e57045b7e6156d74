//! Cluster client registry for cilikube
//!
//! Owns everything between a stored kubeconfig and a ready kube client:
//!
//! - [`store`]: durable cluster records (SQL or in-memory)
//! - [`factory`]: kubeconfig parsing, client construction and probing
//! - [`registry`]: the live set of clients, health sweep and active cluster
//! - [`resolver`]: mapping a request's cluster selection to a client

#![deny(missing_docs)]

pub mod client;
pub mod discovery;
pub mod factory;
pub mod record;
pub mod registry;
pub mod resolver;
pub mod status;
pub mod store;

pub use client::ClusterClient;
pub use discovery::{DiscoveredResource, DiscoveryCache, ResourceScope};
pub use factory::{
    BuiltClient, ClientFactory, FactorySettings, KubeClientFactory, KubeconfigSource,
    ProbeOutcome,
};
pub use record::{ClusterRecord, ClusterSource};
pub use registry::{ClusterRegistry, ClusterUpdate, NewCluster, RegistrySettings};
pub use resolver::{ClusterSelector, ResolvedCluster};
pub use status::{ClusterDetails, ClusterPhase, ClusterStatus};
pub use store::{ClusterStore, MemoryClusterStore, SqlClusterStore, StoreError};
