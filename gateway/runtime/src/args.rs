use crate::{
    auth::{AuthMetrics, AuthorizeLayer, Verifier},
    cache,
    core::{CleanupCoordinator, KUBERNETES_RUNTIME},
    index::{ClusterIndex, KeyIndex, CLUSTER_LABEL, SIGNING_KEY_LABEL},
    proxy::{self, Handler},
    server::ServerArgs,
    ClientCacheConfig, KubernetesRuntime, Probe,
};
use anyhow::{bail, ensure, Result};
use clap::Parser;
use k8s_openapi::api::core::v1::Secret;
use kube::runtime::watcher;
use prometheus_client::{metrics::gauge::Gauge, registry::Registry};
use std::{num::NonZeroUsize, sync::Arc};
use tokio::time::Duration;
use tower::Layer;
use tracing::{info, info_span, Instrument};

#[derive(Debug, Parser)]
#[clap(
    name = "fleet-gateway",
    about = "An authenticating Kubernetes API gateway for a fleet of clusters"
)]
pub struct Args {
    #[clap(long, default_value = "fleet=info,warn", env = "FLEET_GATEWAY_LOG")]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    #[clap(flatten)]
    server: ServerArgs,

    #[clap(flatten)]
    admin: kubert::AdminArgs,

    /// The namespace watched for cluster records and signing keys.
    #[clap(long, default_value = "fleet-system")]
    namespace: String,

    #[clap(long, default_value = "100")]
    k8s_proxy_cache_capacity: NonZeroUsize,

    #[clap(long, default_value = "1800")]
    k8s_proxy_cache_ttl_secs: u64,

    #[clap(long, default_value = "100")]
    cluster_client_cache_capacity: NonZeroUsize,

    #[clap(long, default_value = "3600")]
    cluster_client_cache_ttl_secs: u64,

    #[clap(long, default_value = "30")]
    cache_sweep_interval_secs: u64,

    /// Only negotiate HTTP/1.1 with cluster API servers.
    ///
    /// Set this when the gateway is fronted by a proxy that does not speak
    /// HTTP/2.
    #[clap(long)]
    disable_backend_http2: bool,

    /// Reject tokens that do not carry a `cluster_uuid` claim.
    #[clap(long)]
    require_cluster_uuid: bool,

    /// How often to probe each cluster's API server. Zero disables probing.
    #[clap(long, default_value = "60")]
    cluster_probe_interval_secs: u64,
}

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            log_level,
            log_format,
            client,
            server,
            admin,
            namespace,
            k8s_proxy_cache_capacity,
            k8s_proxy_cache_ttl_secs,
            cluster_client_cache_capacity,
            cluster_client_cache_ttl_secs,
            cache_sweep_interval_secs,
            disable_backend_http2,
            require_cluster_uuid,
            cluster_probe_interval_secs,
        } = self;

        ensure!(
            k8s_proxy_cache_ttl_secs > 0,
            "--k8s-proxy-cache-ttl-secs must be positive"
        );
        ensure!(
            cluster_client_cache_ttl_secs > 0,
            "--cluster-client-cache-ttl-secs must be positive"
        );
        ensure!(
            cache_sweep_interval_secs > 0,
            "--cache-sweep-interval-secs must be positive"
        );

        proxy::install_tls_provider();

        // Cluster records and signing keys are indexed from the management
        // cluster. Cluster removals fan out to every cache through the
        // coordinator.
        let coordinator = Arc::new(CleanupCoordinator::new());
        let clusters = ClusterIndex::new(coordinator.clone());
        let keys = KeyIndex::default();

        let live_clients = Gauge::default();
        let kubernetes = KubernetesRuntime::new(
            coordinator.clone(),
            Arc::new(clusters.clone()),
            ClientCacheConfig {
                capacity: cluster_client_cache_capacity,
                ttl: Duration::from_secs(cluster_client_cache_ttl_secs),
            },
            live_clients.clone(),
        );
        let runtimes = crate::core::Registry::new();
        runtimes.install(KUBERNETES_RUNTIME, kubernetes.clone())?;

        let handler = Handler::from_registry(
            &runtimes,
            proxy::Config {
                capacity: k8s_proxy_cache_capacity,
                ttl: Duration::from_secs(k8s_proxy_cache_ttl_secs),
                http2: !disable_backend_http2,
            },
        )?;
        info!(
            cleanupers = coordinator.len(),
            http2 = !disable_backend_http2,
            "Cluster runtime installed"
        );

        let mut prom = <Registry>::default();
        let auth_metrics = AuthMetrics::register(prom.sub_registry_with_prefix("auth"));
        cache::metrics::register(
            prom.sub_registry_with_prefix("k8s_proxy_cache"),
            handler.connectors_cache(),
        );
        {
            let reg = prom.sub_registry_with_prefix("cluster_client_cache");
            cache::metrics::register(reg, kubernetes.clients());
            reg.register(
                "live_clients",
                "The number of cluster clients that have not yet been dropped",
                live_clients,
            );
        }
        let probe = if cluster_probe_interval_secs > 0 {
            Some(Probe::register(
                prom.sub_registry_with_prefix("cluster_probe"),
                clusters.clone(),
                kubernetes.clone(),
            ))
        } else {
            None
        };
        let rt_metrics = kubert::RuntimeMetrics::register(prom.sub_registry_with_prefix("kube"));

        let mut runtime = kubert::Runtime::builder()
            .with_log(log_level, log_format)
            .with_metrics(rt_metrics)
            .with_admin(admin.into_builder().with_prometheus(prom))
            .with_client(client)
            .build()
            .await?;
        let server = server.bind().await?;

        // Spawn resource watches.

        let cluster_records = runtime.watch_namespaced::<Secret>(
            namespace.clone(),
            watcher::Config::default().labels(CLUSTER_LABEL),
        );
        tokio::spawn(
            kubert::index::namespaced(clusters.index(), cluster_records)
                .instrument(info_span!("clusters")),
        );

        let signing_keys = runtime.watch_namespaced::<Secret>(
            namespace.clone(),
            watcher::Config::default().labels(SIGNING_KEY_LABEL),
        );
        tokio::spawn(
            kubert::index::namespaced(keys.index(), signing_keys)
                .instrument(info_span!("signing_keys")),
        );

        // Spawn cache maintenance.

        let sweep = Duration::from_secs(cache_sweep_interval_secs);
        tokio::spawn(
            handler
                .connectors_cache()
                .clone()
                .run_sweeper(sweep)
                .instrument(info_span!("k8s_proxy_cache")),
        );
        tokio::spawn(
            kubernetes
                .clients()
                .clone()
                .run_sweeper(sweep)
                .instrument(info_span!("cluster_client_cache")),
        );

        if let Some(probe) = probe {
            tokio::spawn(
                probe
                    .run(Duration::from_secs(cluster_probe_interval_secs))
                    .instrument(info_span!("cluster_probe")),
            );
        }

        let verifier = Verifier::new(Arc::new(keys), Arc::new(clusters))
            .require_cluster_uuid(require_cluster_uuid);
        let authorize = AuthorizeLayer::new(verifier, auth_metrics);
        tokio::spawn(
            server
                .serve(authorize.layer(handler), runtime.shutdown_handle())
                .instrument(info_span!("server")),
        );

        // Block the main thread on the shutdown signal. Once it fires, wait for
        // open connections to drain before exiting.
        if runtime.run().await.is_err() {
            bail!("Aborted");
        }

        Ok(())
    }
}
