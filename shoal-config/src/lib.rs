//! # Shoal Config
//! The typed topology model used by the shoal client runtime.
//!
//! A cluster is described as a set of named buckets, each carrying its own
//! node list, per-service port maps and (for partitioned buckets) a partition
//! map. Configurations arrive from the server as JSON documents and are parsed
//! into immutable [`BucketConfig`] values which the control plane snapshots
//! into [`ClusterConfig`] and broadcasts to its subscribers.

mod bucket;
mod cluster;
mod collections;
mod error;
mod parse;
mod service;

pub use bucket::{
    BucketConfig,
    BucketType,
    NodeIdentifier,
    NodeInfo,
    Partition,
    PartitionMap,
};
pub use cluster::ClusterConfig;
pub use collections::{
    decode_unsigned_leb128,
    encode_unsigned_leb128,
    parse_collections_manifest,
    CollectionIdentifier,
    CollectionMap,
    CollectionsManifest,
    ManifestCollection,
    ManifestScope,
};
pub use error::ConfigError;
pub use parse::parse_bucket_config;
pub use service::{ServiceScope, ServiceType};

/// The revision counter attached to every bucket configuration.
///
/// Revisions increase monotonically as the cluster topology changes, a
/// revision of `0` means the config carries no revision information at all.
pub type Revision = u64;
