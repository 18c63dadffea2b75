use crate::{index::ClusterIndex, KubernetesRuntime};
use futures::stream::{self, StreamExt};
use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{family::Family, gauge::Gauge},
    registry::Registry,
};
use std::{collections::BTreeSet, sync::Arc};
use tokio::time::{self, Duration, MissedTickBehavior};

const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// The number of clusters checked at once.
const CONCURRENCY: usize = 32;

/// Periodically checks that each known cluster's API server answers.
///
/// Checks never count as uses of the client cache.
pub struct Probe {
    clusters: ClusterIndex,
    runtime: Arc<KubernetesRuntime>,
    reachable: Family<ClusterLabels, Gauge>,
    probed: BTreeSet<String>,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct ClusterLabels {
    cluster: String,
}

// === impl Probe ===

impl Probe {
    pub fn register(
        reg: &mut Registry,
        clusters: ClusterIndex,
        runtime: Arc<KubernetesRuntime>,
    ) -> Self {
        let reachable = Family::default();
        reg.register(
            "reachable",
            "Whether the cluster's API server answered the last probe",
            reachable.clone(),
        );
        Self {
            clusters,
            runtime,
            reachable,
            probed: BTreeSet::new(),
        }
    }

    pub async fn run(mut self, period: Duration) {
        let mut interval = time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            self.probe_all().await;
        }
    }

    async fn probe_all(&mut self) {
        let clusters = self.clusters.clusters().into_iter().collect::<BTreeSet<_>>();

        for removed in self.probed.difference(&clusters) {
            self.reachable.remove(&ClusterLabels {
                cluster: removed.clone(),
            });
        }

        let this = &*self;
        let results = stream::iter(clusters.iter().cloned())
            .map(|cluster| async move {
                let result = this.probe(&cluster).await;
                (cluster, result)
            })
            .buffer_unordered(CONCURRENCY)
            .collect::<Vec<_>>()
            .await;

        for (cluster, result) in results {
            let reachable = match result {
                Ok(version) => {
                    tracing::trace!(%cluster, %version, "Cluster reachable");
                    1
                }
                Err(error) => {
                    tracing::debug!(%cluster, %error, "Cluster unreachable");
                    0
                }
            };
            self.reachable
                .get_or_create(&ClusterLabels {
                    cluster: cluster.clone(),
                })
                .set(reachable);
        }

        self.probed = clusters;
    }

    async fn probe(&self, cluster: &str) -> anyhow::Result<String> {
        let client = self.runtime.unrecorded_client(cluster).await?;
        let info = time::timeout(PROBE_TIMEOUT, client.apiserver_version()).await??;
        Ok(info.git_version)
    }
}
