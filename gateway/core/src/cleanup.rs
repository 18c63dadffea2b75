use parking_lot::Mutex;
use std::sync::Arc;

/// Reacts to a managed cluster being removed.
///
/// Implementations discard whatever state they hold for the cluster. They are
/// invoked synchronously while the coordinator's lock is held, so they must be
/// cheap and must not register further cleanupers.
pub trait Cleanuper: Send + Sync {
    fn on_cluster_removed(&self, cluster: &str);
}

/// Accepts cleanupers to be notified of cluster removals.
pub trait RegisterCleanuper: Send + Sync {
    fn register_cleanuper(&self, cleanuper: Arc<dyn Cleanuper>);
}

/// Fans a single cluster-removed event out to every registered cleanuper.
///
/// Caches register themselves here once, so the component that observes a
/// cluster's deletion needs no knowledge of which caches exist.
#[derive(Default)]
pub struct CleanupCoordinator {
    cleanupers: Mutex<Vec<Arc<dyn Cleanuper>>>,
}

// === impl CleanupCoordinator ===

impl CleanupCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, cleanuper: Arc<dyn Cleanuper>) {
        self.cleanupers.lock().push(cleanuper);
    }

    /// Invokes every registered cleanuper, in registration order.
    ///
    /// A panicking cleanuper is a bug; the panic is propagated to the caller.
    pub fn notify(&self, cluster: &str) {
        let cleanupers = self.cleanupers.lock();
        tracing::debug!(%cluster, cleanupers = cleanupers.len(), "Cluster removed");
        for cleanuper in cleanupers.iter() {
            cleanuper.on_cluster_removed(cluster);
        }
    }

    pub fn len(&self) -> usize {
        self.cleanupers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl RegisterCleanuper for CleanupCoordinator {
    fn register_cleanuper(&self, cleanuper: Arc<dyn Cleanuper>) {
        self.register(cleanuper);
    }
}

impl Cleanuper for CleanupCoordinator {
    fn on_cluster_removed(&self, cluster: &str) {
        self.notify(cluster);
    }
}

impl std::fmt::Debug for CleanupCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CleanupCoordinator")
            .field("cleanupers", &self.len())
            .finish()
    }
}
