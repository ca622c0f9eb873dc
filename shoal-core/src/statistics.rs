use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub type Counter = AtomicU64;

#[derive(Debug, Clone, Default)]
/// Live metrics around the core runtime.
pub struct CoreStatistics(Arc<CoreStatisticsInner>);

impl Deref for CoreStatistics {
    type Target = CoreStatisticsInner;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

#[derive(Debug, Default)]
pub struct CoreStatisticsInner {
    /// The number of nodes currently managed by the reconciler.
    pub(crate) num_managed_nodes: Counter,
    /// The number of endpoints currently in the connected state.
    pub(crate) num_connected_endpoints: Counter,
    /// The number of reconfigurations which ran to completion.
    pub(crate) num_reconfigurations: Counter,
    /// The number of proposed configs which were ignored.
    pub(crate) num_configs_ignored: Counter,
}

impl CoreStatisticsInner {
    /// The number of nodes currently managed by the reconciler.
    pub fn num_managed_nodes(&self) -> u64 {
        self.num_managed_nodes.load(Ordering::Relaxed)
    }

    /// The number of endpoints currently in the connected state.
    pub fn num_connected_endpoints(&self) -> u64 {
        self.num_connected_endpoints.load(Ordering::Relaxed)
    }

    /// The number of reconfigurations which ran to completion.
    pub fn num_reconfigurations(&self) -> u64 {
        self.num_reconfigurations.load(Ordering::Relaxed)
    }

    /// The number of proposed configs which were ignored.
    pub fn num_configs_ignored(&self) -> u64 {
        self.num_configs_ignored.load(Ordering::Relaxed)
    }
}
