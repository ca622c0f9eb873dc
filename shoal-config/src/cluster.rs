use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::bucket::BucketConfig;

/// An immutable snapshot of every currently open bucket's topology.
///
/// The provider replaces the whole snapshot on every accepted config and
/// broadcasts the new value, so holders of a [`ClusterConfig`] always see a
/// consistent view and never observe a half-applied update.
#[derive(Debug, Clone, Default)]
pub struct ClusterConfig {
    bucket_configs: HashMap<String, Arc<BucketConfig>>,
}

impl ClusterConfig {
    pub fn bucket_config(&self, bucket: &str) -> Option<&Arc<BucketConfig>> {
        self.bucket_configs.get(bucket)
    }

    pub fn set_bucket_config(&mut self, config: BucketConfig) {
        self.bucket_configs
            .insert(config.name().to_string(), Arc::new(config));
    }

    pub fn delete_bucket_config(&mut self, bucket: &str) {
        self.bucket_configs.remove(bucket);
    }

    pub fn has_bucket(&self, bucket: &str) -> bool {
        self.bucket_configs.contains_key(bucket)
    }

    pub fn bucket_configs(&self) -> &HashMap<String, Arc<BucketConfig>> {
        &self.bucket_configs
    }

    pub fn is_empty(&self) -> bool {
        self.bucket_configs.is_empty()
    }

    /// Every node hostname referenced by any open bucket.
    pub fn all_node_addresses(&self) -> HashSet<String> {
        self.bucket_configs
            .values()
            .flat_map(|config| config.nodes())
            .map(|node| node.host().to_string())
            .collect()
    }

    /// The cluster level capabilities, taken from the first open bucket.
    ///
    /// Cluster capabilities are identical across buckets, so any open
    /// bucket can answer for the cluster.
    pub fn cluster_capabilities(&self) -> HashMap<String, HashSet<String>> {
        self.bucket_configs
            .values()
            .next()
            .map(|config| config.cluster_capabilities().clone())
            .unwrap_or_default()
    }
}
