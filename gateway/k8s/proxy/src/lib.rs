//! Forwards authorized requests to the Kubernetes API server of the cluster
//! they were authorized for.
//!
//! The target cluster is taken solely from the request's [`ClusterContext`]
//! extension, never from its URI or `Host` header.
//!
//! [`ClusterContext`]: fleet_gateway_core::ClusterContext

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod connector;
mod dialer;
mod handler;

pub use self::{
    connector::{Connector, ProxyBody},
    handler::{Config, Connectors, Handler},
};
use fleet_gateway_core::http::BoxError;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("request has no cluster context")]
    MissingClusterContext,

    #[error("no connector for cluster {cluster}: {source}")]
    Connector {
        cluster: String,
        #[source]
        source: fleet_gateway_cache::Error,
    },

    #[error("failed to forward request to cluster {cluster}: {source}")]
    Forward {
        cluster: String,
        #[source]
        source: BoxError,
    },

    #[error("invalid cluster configuration: {0}")]
    Config(#[source] BoxError),
}

/// Installs the process-wide TLS crypto provider used by every connector.
///
/// Calling this more than once has no effect.
pub fn install_tls_provider() {
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
}
