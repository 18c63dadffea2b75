#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod cleanup;
pub mod http;
pub mod registry;

pub use self::{
    cleanup::{CleanupCoordinator, Cleanuper, RegisterCleanuper},
    registry::Registry,
};
use anyhow::Result;
pub use jsonwebtoken::DecodingKey;
pub use kube::config::Kubeconfig;

/// The name under which the Kubernetes cluster runtime is installed in the
/// [`Registry`].
pub const KUBERNETES_RUNTIME: &str = "kubernetes";

/// The cluster a request was authorized for.
///
/// Bound onto the request's extensions by the authorization middleware once the
/// request's token has been verified. Downstream stages only ever read it.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ClusterContext {
    name: String,
}

/// Resolves token verification keys by key id.
#[async_trait::async_trait]
pub trait KeyLookup: Send + Sync {
    async fn lookup_key(&self, kid: &str) -> Result<DecodingKey>;
}

/// Resolves a cluster's name to its durable UUID.
#[async_trait::async_trait]
pub trait ClusterUuidResolver: Send + Sync {
    async fn cluster_uuid(&self, cluster: &str) -> Result<String>;
}

/// Produces the current API access configuration for a cluster.
#[async_trait::async_trait]
pub trait KubeconfigSource: Send + Sync {
    async fn kubeconfig(&self, cluster: &str) -> Result<Kubeconfig>;
}

/// Hands out API clients for managed clusters.
#[async_trait::async_trait]
pub trait ClusterClients: Send + Sync {
    async fn client(&self, cluster: &str) -> Result<kube::Client>;
}

// === impl ClusterContext ===

impl ClusterContext {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl std::fmt::Display for ClusterContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.name.fmt(f)
    }
}
