use std::collections::{HashMap, HashSet};
use std::fmt::{self, Display};

use crate::service::ServiceType;
use crate::Revision;

/// The stable identity of a remote node.
///
/// A node is identified by its hostname and cluster manager port, service
/// ports may move around freely without the node changing identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeIdentifier {
    host: String,
    manager_port: u16,
}

impl NodeIdentifier {
    pub fn new(host: impl Into<String>, manager_port: u16) -> Self {
        Self {
            host: host.into(),
            manager_port,
        }
    }

    #[inline]
    pub fn host(&self) -> &str {
        &self.host
    }

    #[inline]
    pub fn manager_port(&self) -> u16 {
        self.manager_port
    }
}

impl Display for NodeIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.manager_port)
    }
}

/// One remote node as described by a bucket configuration.
#[derive(Debug, Clone)]
pub struct NodeInfo {
    identifier: NodeIdentifier,
    services: HashMap<ServiceType, u16>,
    ssl_services: HashMap<ServiceType, u16>,
}

impl NodeInfo {
    pub fn new(
        identifier: NodeIdentifier,
        services: HashMap<ServiceType, u16>,
        ssl_services: HashMap<ServiceType, u16>,
    ) -> Self {
        Self {
            identifier,
            services,
            ssl_services,
        }
    }

    #[inline]
    pub fn identifier(&self) -> &NodeIdentifier {
        &self.identifier
    }

    #[inline]
    pub fn host(&self) -> &str {
        self.identifier.host()
    }

    /// Plaintext ports by service type.
    #[inline]
    pub fn services(&self) -> &HashMap<ServiceType, u16> {
        &self.services
    }

    /// TLS ports by service type.
    #[inline]
    pub fn ssl_services(&self) -> &HashMap<ServiceType, u16> {
        &self.ssl_services
    }

    /// True if the node hosts the given service on either port map.
    pub fn has_service(&self, service: ServiceType) -> bool {
        self.services.contains_key(&service) || self.ssl_services.contains_key(&service)
    }
}

/// How documents of a bucket are distributed across nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BucketType {
    /// Documents are spread over a fixed set of partitions, persisted to disk.
    Partitioned,
    /// Partitioned like [`BucketType::Partitioned`] but memory only and
    /// without a views surface.
    Ephemeral,
    /// A legacy cache bucket without a partition map.
    Memcached,
}

/// One `(master, replicas)` assignment of the partition map.
///
/// Indexes point into the partition host list of the owning map. An index of
/// `-1` means the slot is currently unassigned (mid rebalance).
#[derive(Debug, Clone)]
pub struct Partition {
    master: i32,
    replicas: Vec<i32>,
}

impl Partition {
    pub fn new(master: i32, replicas: Vec<i32>) -> Self {
        Self { master, replicas }
    }

    /// The partition host index of the active master, if one is assigned.
    pub fn master(&self) -> Option<u16> {
        u16::try_from(self.master).ok()
    }

    /// The partition host index of the n-th replica, if assigned.
    pub fn replica(&self, replica: usize) -> Option<u16> {
        self.replicas
            .get(replica)
            .and_then(|idx| u16::try_from(*idx).ok())
    }
}

/// The partition layout of one partitioned bucket.
#[derive(Debug, Clone)]
pub struct PartitionMap {
    partitions: Vec<Partition>,
    forward_partitions: Option<Vec<Partition>>,
    num_replicas: usize,
    /// Indexes into the owning config's node list, ordered as the server
    /// declared its partition host list.
    partition_host_indexes: Vec<usize>,
    primary_hosts: HashSet<String>,
}

impl PartitionMap {
    pub(crate) fn new(
        partitions: Vec<Partition>,
        forward_partitions: Option<Vec<Partition>>,
        num_replicas: usize,
        partition_host_indexes: Vec<usize>,
        primary_hosts: HashSet<String>,
    ) -> Self {
        Self {
            partitions,
            forward_partitions,
            num_replicas,
            partition_host_indexes,
            primary_hosts,
        }
    }

    #[inline]
    pub fn number_of_partitions(&self) -> usize {
        self.partitions.len()
    }

    #[inline]
    pub fn number_of_replicas(&self) -> usize {
        self.num_replicas
    }

    #[inline]
    pub fn has_fast_forward_map(&self) -> bool {
        self.forward_partitions.is_some()
    }

    /// Maps a document key onto its partition index.
    pub fn partition_for_key(&self, key: &[u8]) -> u16 {
        let hash = crc32fast::hash(key);
        (hash & (self.partitions.len() as u32 - 1)) as u16
    }

    /// Looks up the partition host index of the master for the given
    /// partition.
    ///
    /// Returns `None` when the partition is out of range or currently has
    /// no master assigned, callers are expected to hand such requests to
    /// their retry machinery rather than fail them.
    pub fn node_index_for_master(&self, partition: u16, use_fast_forward: bool) -> Option<u16> {
        self.partition_set(use_fast_forward)?
            .get(partition as usize)
            .and_then(Partition::master)
    }

    /// Looks up the partition host index of the n-th replica for the given
    /// partition.
    pub fn node_index_for_replica(
        &self,
        partition: u16,
        replica: usize,
        use_fast_forward: bool,
    ) -> Option<u16> {
        self.partition_set(use_fast_forward)?
            .get(partition as usize)
            .and_then(|p| p.replica(replica))
    }

    fn partition_set(&self, use_fast_forward: bool) -> Option<&Vec<Partition>> {
        if use_fast_forward {
            self.forward_partitions.as_ref()
        } else {
            Some(&self.partitions)
        }
    }

    pub(crate) fn partition_host_indexes(&self) -> &[usize] {
        &self.partition_host_indexes
    }

    pub(crate) fn primary_hosts(&self) -> &HashSet<String> {
        &self.primary_hosts
    }
}

/// The parsed topology of one bucket.
#[derive(Debug, Clone)]
pub struct BucketConfig {
    rev: Revision,
    uuid: String,
    name: String,
    origin: String,
    bucket_type: BucketType,
    nodes: Vec<NodeInfo>,
    partitions: Option<PartitionMap>,
    bucket_capabilities: HashSet<String>,
    cluster_capabilities: HashMap<String, HashSet<String>>,
}

impl BucketConfig {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        rev: Revision,
        uuid: String,
        name: String,
        origin: String,
        bucket_type: BucketType,
        nodes: Vec<NodeInfo>,
        partitions: Option<PartitionMap>,
        bucket_capabilities: HashSet<String>,
        cluster_capabilities: HashMap<String, HashSet<String>>,
    ) -> Self {
        Self {
            rev,
            uuid,
            name,
            origin,
            bucket_type,
            nodes,
            partitions,
            bucket_capabilities,
            cluster_capabilities,
        }
    }

    #[inline]
    pub fn rev(&self) -> Revision {
        self.rev
    }

    #[inline]
    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The host the raw config document was fetched from.
    #[inline]
    pub fn origin(&self) -> &str {
        &self.origin
    }

    #[inline]
    pub fn bucket_type(&self) -> BucketType {
        self.bucket_type
    }

    #[inline]
    pub fn nodes(&self) -> &[NodeInfo] {
        &self.nodes
    }

    /// The partition map, present for everything but memcached buckets.
    #[inline]
    pub fn partitions(&self) -> Option<&PartitionMap> {
        self.partitions.as_ref()
    }

    /// A config is tainted while the cluster rebalances, signalled by the
    /// presence of the fast-forward partition map.
    pub fn tainted(&self) -> bool {
        self.partitions
            .as_ref()
            .map(PartitionMap::has_fast_forward_map)
            .unwrap_or(false)
    }

    pub fn has_fast_forward_map(&self) -> bool {
        self.tainted()
    }

    /// Resolves a partition host index (as produced by the partition map
    /// lookups) to the node hosting that partition.
    pub fn node_at_index(&self, index: u16) -> Option<&NodeInfo> {
        let map = self.partitions.as_ref()?;
        let node_index = *map.partition_host_indexes().get(index as usize)?;
        self.nodes.get(node_index)
    }

    /// True if the given host currently masters at least one partition.
    pub fn has_primary_partitions_on_node(&self, host: &str) -> bool {
        self.partitions
            .as_ref()
            .map(|map| map.primary_hosts().contains(host))
            .unwrap_or(false)
    }

    #[inline]
    pub fn bucket_capabilities(&self) -> &HashSet<String> {
        &self.bucket_capabilities
    }

    #[inline]
    pub fn cluster_capabilities(&self) -> &HashMap<String, HashSet<String>> {
        &self.cluster_capabilities
    }
}
