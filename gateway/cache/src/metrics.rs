use crate::{ConnectionCache, Eviction, Inner};
use prometheus_client::{
    collector::Collector,
    encoding::{DescriptorEncoder, EncodeLabelSet, EncodeLabelValue, EncodeMetric, LabelValueEncoder},
    metrics::{counter::Counter, family::Family, gauge::ConstGauge, MetricType},
    registry::Registry,
};
use std::{fmt, hash::Hash, sync::Arc};

#[derive(Clone, Debug, Default)]
pub struct CacheMetrics {
    hits: Counter,
    misses: Counter,
    evictions: Family<EvictionLabels, Counter>,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct EvictionLabels {
    cause: Eviction,
}

struct Instrumented<K, V>(Arc<Inner<K, V>>);

/// Registers a cache's metrics, including a gauge reporting its current size.
pub fn register<K, V>(reg: &mut Registry, cache: &ConnectionCache<K, V>)
where
    K: Clone + Eq + Hash + fmt::Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    cache.inner.metrics.register_into(reg);
    reg.register_collector(Box::new(Instrumented(cache.inner.clone())));
}

// === impl CacheMetrics ===

impl CacheMetrics {
    fn register_into(&self, reg: &mut Registry) {
        reg.register("hits", "Total number of cache hits", self.hits.clone());
        reg.register(
            "misses",
            "Total number of values constructed and inserted on a cache miss",
            self.misses.clone(),
        );
        reg.register(
            "evictions",
            "Total number of values released by the cache",
            self.evictions.clone(),
        );
    }

    pub fn hits(&self) -> u64 {
        self.hits.get()
    }

    pub fn misses(&self) -> u64 {
        self.misses.get()
    }

    pub fn evictions(&self, cause: Eviction) -> u64 {
        self.evictions.get_or_create(&EvictionLabels { cause }).get()
    }

    pub(crate) fn hit(&self) {
        self.hits.inc();
    }

    pub(crate) fn miss(&self) {
        self.misses.inc();
    }

    pub(crate) fn evicted(&self, cause: Eviction) {
        self.evictions.get_or_create(&EvictionLabels { cause }).inc();
    }
}

// === impl Eviction ===

impl Eviction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Removed => "removed",
            Self::Expired => "expired",
            Self::Capacity => "capacity",
            Self::Superseded => "superseded",
        }
    }
}

impl EncodeLabelValue for Eviction {
    fn encode(&self, encoder: &mut LabelValueEncoder<'_>) -> Result<(), fmt::Error> {
        use fmt::Write;
        encoder.write_str(self.as_str())
    }
}

// === impl Instrumented ===

impl<K: Eq + Hash + fmt::Debug, V> fmt::Debug for Instrumented<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Instrumented").field(&self.0).finish()
    }
}

impl<K, V> Collector for Instrumented<K, V>
where
    K: Eq + Hash + fmt::Debug + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    fn encode(&self, mut encoder: DescriptorEncoder<'_>) -> Result<(), fmt::Error> {
        let size = self.0.state.lock().entries.len();
        let size_encoder = encoder.encode_descriptor(
            "size",
            "The number of entries in the cache",
            None,
            MetricType::Gauge,
        )?;
        ConstGauge::new(size as i64).encode(size_encoder)?;
        Ok(())
    }
}
