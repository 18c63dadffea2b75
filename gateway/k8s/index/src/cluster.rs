use crate::{secret_data, CLUSTER_LABEL, CLUSTER_UUID_ANNOTATION, KUBECONFIG_KEY};
use ahash::AHashMap as HashMap;
use anyhow::{anyhow, bail, Context, Result};
use fleet_gateway_core::{Cleanuper, ClusterUuidResolver, Kubeconfig, KubeconfigSource};
use k8s_openapi::api::core::v1::Secret;
use kube::ResourceExt;
use parking_lot::RwLock;
use std::{fmt, sync::Arc};

/// Indexes cluster records by cluster name.
pub struct Index {
    clusters: HashMap<String, Cluster>,
    /// Maps each record's `Secret` name to the cluster it describes.
    by_secret: HashMap<String, String>,
    cleanup: Arc<dyn Cleanuper>,
}

pub type SharedIndex = Arc<RwLock<Index>>;

/// A handle on the cluster index that serves cluster lookups.
#[derive(Clone)]
pub struct ClusterIndex {
    index: SharedIndex,
}

#[derive(Debug)]
struct Cluster {
    secret: String,
    uuid: Option<String>,
    kubeconfig: Kubeconfig,
    raw_kubeconfig: Vec<u8>,
}

// === impl ClusterIndex ===

impl ClusterIndex {
    /// Creates an empty index that reports removed and recreated clusters to
    /// `cleanup`.
    pub fn new(cleanup: Arc<dyn Cleanuper>) -> Self {
        Self {
            index: Arc::new(RwLock::new(Index {
                clusters: HashMap::default(),
                by_secret: HashMap::default(),
                cleanup,
            })),
        }
    }

    /// The index to be updated by a `Secret` watch.
    pub fn index(&self) -> SharedIndex {
        self.index.clone()
    }

    /// The names of all known clusters, sorted.
    pub fn clusters(&self) -> Vec<String> {
        let mut names = self
            .index
            .read()
            .clusters
            .keys()
            .cloned()
            .collect::<Vec<_>>();
        names.sort();
        names
    }
}

#[async_trait::async_trait]
impl ClusterUuidResolver for ClusterIndex {
    async fn cluster_uuid(&self, cluster: &str) -> Result<String> {
        let index = self.index.read();
        let record = index
            .clusters
            .get(cluster)
            .ok_or_else(|| anyhow!("unknown cluster {cluster}"))?;
        record
            .uuid
            .clone()
            .ok_or_else(|| anyhow!("cluster {cluster} has no UUID"))
    }
}

#[async_trait::async_trait]
impl KubeconfigSource for ClusterIndex {
    async fn kubeconfig(&self, cluster: &str) -> Result<Kubeconfig> {
        match self.index.read().clusters.get(cluster) {
            Some(record) => Ok(record.kubeconfig.clone()),
            None => bail!("unknown cluster {cluster}"),
        }
    }
}

impl fmt::Debug for ClusterIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterIndex")
            .field("clusters", &self.clusters())
            .finish()
    }
}

// === impl Index ===

impl kubert::index::IndexNamespacedResource<Secret> for Index {
    fn apply(&mut self, secret: Secret) {
        let secret_name = secret.name_unchecked();
        let (name, record) = match Cluster::from_secret(&secret) {
            Ok(parsed) => parsed,
            Err(error) => {
                tracing::warn!(secret = %secret_name, %error, "Ignoring invalid cluster record");
                self.remove_secret(&secret_name);
                return;
            }
        };

        // The record may have been relabelled to describe another cluster.
        if let Some(previous) = self.by_secret.get(&secret_name) {
            if *previous != name {
                let previous = previous.clone();
                self.remove_cluster(&previous);
            }
        }

        match self.clusters.get(&name) {
            Some(current) if current.secret == record.secret && !current.is_replaced_by(&record) => {
                tracing::trace!(cluster = %name, "Cluster record unchanged");
            }
            Some(current) => {
                tracing::info!(cluster = %name, uuid = ?record.uuid, "Cluster record changed");
                if current.secret != record.secret {
                    tracing::warn!(
                        cluster = %name,
                        previous = %current.secret,
                        secret = %record.secret,
                        "Cluster is described by multiple records"
                    );
                    let previous = current.secret.clone();
                    self.by_secret.remove(&previous);
                }
                self.by_secret.insert(secret_name, name.clone());
                self.clusters.insert(name.clone(), record);
                self.cleanup.on_cluster_removed(&name);
            }
            None => {
                tracing::info!(cluster = %name, uuid = ?record.uuid, "Cluster added");
                self.by_secret.insert(secret_name, name.clone());
                self.clusters.insert(name, record);
            }
        }
    }

    fn delete(&mut self, _namespace: String, name: String) {
        self.remove_secret(&name);
    }
}

impl Index {
    fn remove_secret(&mut self, secret: &str) {
        if let Some(cluster) = self.by_secret.get(secret).cloned() {
            self.remove_cluster(&cluster);
        }
    }

    fn remove_cluster(&mut self, cluster: &str) {
        if let Some(record) = self.clusters.remove(cluster) {
            self.by_secret.remove(&record.secret);
            tracing::info!(%cluster, "Cluster removed");
            self.cleanup.on_cluster_removed(cluster);
        }
    }
}

impl fmt::Debug for Index {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Index")
            .field("clusters", &self.clusters)
            .field("by_secret", &self.by_secret)
            .finish_non_exhaustive()
    }
}

// === impl Cluster ===

impl Cluster {
    fn from_secret(secret: &Secret) -> Result<(String, Self)> {
        let name = secret
            .labels()
            .get(CLUSTER_LABEL)
            .filter(|name| !name.is_empty())
            .ok_or_else(|| anyhow!("missing {CLUSTER_LABEL} label"))?
            .clone();
        let uuid = secret
            .annotations()
            .get(CLUSTER_UUID_ANNOTATION)
            .filter(|uuid| !uuid.is_empty())
            .cloned();

        let raw_kubeconfig = secret_data(secret, KUBECONFIG_KEY)
            .ok_or_else(|| anyhow!("missing {KUBECONFIG_KEY} data"))?
            .to_vec();
        let yaml = std::str::from_utf8(&raw_kubeconfig).context("kubeconfig is not UTF-8")?;
        let kubeconfig = Kubeconfig::from_yaml(yaml).context("invalid kubeconfig")?;

        let record = Self {
            secret: secret.name_unchecked(),
            uuid,
            kubeconfig,
            raw_kubeconfig,
        };
        Ok((name, record))
    }

    /// A record with a different UUID or kubeconfig describes a recreated
    /// cluster, so state derived from the old record must be discarded.
    fn is_replaced_by(&self, other: &Self) -> bool {
        self.uuid != other.uuid || self.raw_kubeconfig != other.raw_kubeconfig
    }
}
