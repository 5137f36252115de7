//! Symk8s kubehub: cluster connection and the narrow client seam the provider talks through.

#![forbid(unsafe_code)]

use std::fmt;

use anyhow::Result;
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Namespace, Service};
use serde::{Deserialize, Serialize};

pub mod connect;
pub mod kube_client;
#[cfg(feature = "fake")]
pub mod fake;

pub use connect::{connect, resolve_config, ConnectError};
pub use kube_client::KubeCluster;

/// Namespaced kinds whose population gates namespace deletion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ResourceKind {
    Pod,
    Deployment,
    Service,
    ReplicaSet,
    StatefulSet,
    DaemonSet,
    Job,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 7] = [
        ResourceKind::Pod,
        ResourceKind::Deployment,
        ResourceKind::Service,
        ResourceKind::ReplicaSet,
        ResourceKind::StatefulSet,
        ResourceKind::DaemonSet,
        ResourceKind::Job,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Pod => "pods",
            ResourceKind::Deployment => "deployments",
            ResourceKind::Service => "services",
            ResourceKind::ReplicaSet => "replicasets",
            ResourceKind::StatefulSet => "statefulsets",
            ResourceKind::DaemonSet => "daemonsets",
            ResourceKind::Job => "jobs",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Cluster operations used by the k8s target provider.
///
/// `get_*` return `Ok(None)` for missing objects and `delete_*` treat a missing
/// object as success. Everything else is surfaced as an error with context.
#[async_trait]
pub trait ClusterClient: Send + Sync {
    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Option<Deployment>>;
    async fn create_deployment(&self, namespace: &str, deployment: &Deployment) -> Result<Deployment>;
    async fn replace_deployment(&self, namespace: &str, deployment: &Deployment) -> Result<Deployment>;
    async fn delete_deployment(&self, namespace: &str, name: &str) -> Result<()>;

    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Service>>;
    async fn create_service(&self, namespace: &str, service: &Service) -> Result<Service>;
    async fn replace_service(&self, namespace: &str, service: &Service) -> Result<Service>;
    async fn delete_service(&self, namespace: &str, name: &str) -> Result<()>;

    async fn get_namespace(&self, name: &str) -> Result<Option<Namespace>>;
    async fn create_namespace(&self, name: &str) -> Result<()>;
    async fn delete_namespace(&self, name: &str) -> Result<()>;

    /// Number of objects of `kind` currently listed in `namespace`.
    async fn count(&self, namespace: &str, kind: ResourceKind) -> Result<usize>;
}

/// Name of a typed object, empty when unset.
pub fn object_name(meta: &k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta) -> &str {
    meta.name.as_deref().unwrap_or("")
}
