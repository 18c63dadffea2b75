//! The `kubernetes` cluster runtime.
//!
//! Publishes the cleanup coordinator, the source of cluster kubeconfigs, and a
//! cache of API clients for managed clusters to the runtime registry.

use crate::{
    cache::ConnectionCache,
    core::{
        registry::{Capabilities, Runtime},
        CleanupCoordinator, Cleanuper, ClusterClients, KubeconfigSource, RegisterCleanuper,
    },
};
use anyhow::Result;
use kube::config::KubeConfigOptions;
use prometheus_client::metrics::gauge::Gauge;
use std::{fmt, num::NonZeroUsize, sync::Arc};
use tokio::time::Duration;

/// API clients for managed clusters, keyed by cluster name.
pub type ClientCache = ConnectionCache<String, LiveClient>;

#[derive(Clone, Debug)]
pub struct ClientCacheConfig {
    pub capacity: NonZeroUsize,
    pub ttl: Duration,
}

pub struct KubernetesRuntime {
    coordinator: Arc<CleanupCoordinator>,
    kubeconfigs: Arc<dyn KubeconfigSource>,
    clients: ClientCache,
}

/// A cached client, counted by a gauge for as long as it is alive.
#[derive(Clone)]
pub struct LiveClient(Arc<Live>);

struct Live {
    client: kube::Client,
    gauge: Gauge,
}

// === impl KubernetesRuntime ===

impl KubernetesRuntime {
    /// Builds the runtime and registers its client cache with `coordinator`.
    ///
    /// `live_clients` tracks the number of clients that have been built and
    /// not yet dropped.
    pub fn new(
        coordinator: Arc<CleanupCoordinator>,
        kubeconfigs: Arc<dyn KubeconfigSource>,
        config: ClientCacheConfig,
        live_clients: Gauge,
    ) -> Arc<Self> {
        let clients = {
            let kubeconfigs = kubeconfigs.clone();
            ConnectionCache::builder(config.capacity, config.ttl)
                .on_release(|cluster, _client: LiveClient, cause| {
                    tracing::debug!(%cluster, ?cause, "Releasing cluster client");
                })
                .build(move |cluster: String| {
                    let kubeconfigs = kubeconfigs.clone();
                    let gauge = live_clients.clone();
                    async move {
                        let client = build_client(&*kubeconfigs, &cluster).await?;
                        tracing::debug!(%cluster, "Built cluster client");
                        Ok(LiveClient::new(client, gauge))
                    }
                })
        };
        coordinator.register(Arc::new(clients.clone()));

        Arc::new(Self {
            coordinator,
            kubeconfigs,
            clients,
        })
    }

    pub fn clients(&self) -> &ClientCache {
        &self.clients
    }

    /// Returns a client for a health check of `cluster`.
    ///
    /// A cached client is reused without counting as a use, so checks neither
    /// keep idle clients alive nor displace recently used ones. Otherwise a
    /// short-lived client is built outside of the cache.
    pub async fn unrecorded_client(&self, cluster: &str) -> Result<kube::Client> {
        if let Some(live) = self.clients.peek(&cluster.to_string()) {
            return Ok(live.client());
        }
        build_client(&*self.kubeconfigs, cluster).await
    }

    /// Discards all state held for a removed cluster.
    pub fn cluster_removed(&self, cluster: &str) {
        self.coordinator.notify(cluster);
    }
}

impl Runtime for KubernetesRuntime {
    fn provide(self: Arc<Self>, caps: &mut Capabilities) {
        caps.insert::<dyn RegisterCleanuper>(self.coordinator.clone())
            .insert::<dyn Cleanuper>(self.coordinator.clone())
            .insert::<dyn KubeconfigSource>(self.kubeconfigs.clone())
            .insert::<dyn ClusterClients>(self);
    }
}

#[async_trait::async_trait]
impl ClusterClients for KubernetesRuntime {
    async fn client(&self, cluster: &str) -> Result<kube::Client> {
        let live = self.clients.get_or_create(cluster.to_string()).await?;
        Ok(live.client())
    }
}

impl fmt::Debug for KubernetesRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KubernetesRuntime")
            .field("coordinator", &self.coordinator)
            .field("clients", &self.clients)
            .finish_non_exhaustive()
    }
}

async fn build_client(kubeconfigs: &dyn KubeconfigSource, cluster: &str) -> Result<kube::Client> {
    let kubeconfig = kubeconfigs.kubeconfig(cluster).await?;
    let config = kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default()).await?;
    Ok(kube::Client::try_from(config)?)
}

// === impl LiveClient ===

impl LiveClient {
    fn new(client: kube::Client, gauge: Gauge) -> Self {
        gauge.inc();
        Self(Arc::new(Live { client, gauge }))
    }

    pub fn client(&self) -> kube::Client {
        self.0.client.clone()
    }
}

impl fmt::Debug for LiveClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("LiveClient").finish()
    }
}

impl Drop for Live {
    fn drop(&mut self) {
        self.gauge.dec();
    }
}
