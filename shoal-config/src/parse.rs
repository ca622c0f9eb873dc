use std::collections::{HashMap, HashSet};

use serde::Deserialize;
use tracing::warn;

use crate::bucket::{BucketConfig, BucketType, NodeIdentifier, NodeInfo, Partition, PartitionMap};
use crate::error::ConfigError;
use crate::service::ServiceType;

const DEFAULT_MANAGER_PORT: u16 = 8091;

/// The capability marker whose absence identifies an ephemeral bucket.
const COUCHAPI_CAPABILITY: &str = "couchapi";

#[derive(Debug, Deserialize)]
struct RawConfig {
    #[serde(default)]
    rev: u64,
    #[serde(default)]
    uuid: String,
    name: String,
    #[serde(default, rename = "nodeLocator")]
    node_locator: Option<String>,
    #[serde(default, rename = "nodesExt")]
    nodes_ext: Vec<RawNodeExt>,
    #[serde(default, rename = "vBucketServerMap")]
    server_map: Option<RawServerMap>,
    #[serde(default, rename = "bucketCapabilities")]
    bucket_capabilities: Option<Vec<String>>,
    #[serde(default, rename = "clusterCapabilities")]
    cluster_capabilities: HashMap<String, Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct RawNodeExt {
    #[serde(default)]
    hostname: Option<String>,
    #[serde(default)]
    services: HashMap<String, u16>,
}

#[derive(Debug, Deserialize)]
struct RawServerMap {
    #[serde(default, rename = "numReplicas")]
    num_replicas: usize,
    #[serde(default, rename = "serverList")]
    server_list: Vec<String>,
    #[serde(default, rename = "vBucketMap")]
    vbucket_map: Vec<Vec<i32>>,
    #[serde(default, rename = "vBucketMapForward")]
    vbucket_map_forward: Option<Vec<Vec<i32>>>,
}

/// Parses a raw bucket config document as served by the cluster.
///
/// The `origin` is the host the document was fetched from and doubles as
/// the hostname for nodes which do not announce one themselves (the server
/// omits it for the node the config was requested on).
///
/// Unknown fields are ignored so newer servers can extend the format
/// without breaking older clients.
pub fn parse_bucket_config(raw: &str, origin: &str) -> Result<BucketConfig, ConfigError> {
    let raw: RawConfig = serde_json::from_str(raw)?;

    let nodes = raw
        .nodes_ext
        .iter()
        .map(|entry| build_node_info(entry, origin))
        .collect::<Vec<_>>();

    let is_ketama = raw.node_locator.as_deref() == Some("ketama");
    let bucket_type = if is_ketama || raw.server_map.is_none() {
        BucketType::Memcached
    } else if matches!(
        &raw.bucket_capabilities,
        Some(caps) if !caps.iter().any(|cap| cap == COUCHAPI_CAPABILITY)
    ) {
        BucketType::Ephemeral
    } else {
        BucketType::Partitioned
    };

    let partitions = match (bucket_type, raw.server_map) {
        (BucketType::Memcached, _) | (_, None) => None,
        (_, Some(server_map)) => Some(build_partition_map(server_map, &nodes)?),
    };

    let bucket_capabilities = raw
        .bucket_capabilities
        .unwrap_or_default()
        .into_iter()
        .collect::<HashSet<_>>();
    let cluster_capabilities = raw
        .cluster_capabilities
        .into_iter()
        .map(|(service, caps)| (service, caps.into_iter().collect()))
        .collect();

    Ok(BucketConfig::new(
        raw.rev,
        raw.uuid,
        raw.name,
        origin.to_string(),
        bucket_type,
        nodes,
        partitions,
        bucket_capabilities,
        cluster_capabilities,
    ))
}

fn build_node_info(entry: &RawNodeExt, origin: &str) -> NodeInfo {
    let host = entry
        .hostname
        .clone()
        .unwrap_or_else(|| origin.to_string());

    let mut services = HashMap::new();
    let mut ssl_services = HashMap::new();
    for (name, port) in &entry.services {
        match ServiceType::from_wire_name(name) {
            Some((service, true)) => {
                ssl_services.insert(service, *port);
            },
            Some((service, false)) => {
                services.insert(service, *port);
            },
            // Servers announce services this client has no dispatch path
            // for (indexer, projector, ...), those are skipped.
            None => {},
        }
    }

    let manager_port = services
        .get(&ServiceType::Manager)
        .copied()
        .unwrap_or(DEFAULT_MANAGER_PORT);

    NodeInfo::new(NodeIdentifier::new(host, manager_port), services, ssl_services)
}

fn build_partition_map(
    server_map: RawServerMap,
    nodes: &[NodeInfo],
) -> Result<PartitionMap, ConfigError> {
    let declared = server_map.server_list.len();
    let mut host_indexes = Vec::with_capacity(declared);
    let mut unresolved = None;

    // Every entry contributes however many nodes it matches, the single
    // count check afterwards catches both gaps and duplicates.
    for raw_host in &server_map.server_list {
        let (host, port) = split_host_port(raw_host);
        let before = host_indexes.len();

        for (index, node) in nodes.iter().enumerate() {
            if !node.has_service(ServiceType::KeyValue) || node.host() != host {
                continue;
            }
            // A partition host with an unparseable port matches on hostname
            // alone, as does a node which only announces a TLS port.
            let port_matches = match node.services().get(&ServiceType::KeyValue) {
                Some(kv_port) => port == 0 || *kv_port == port,
                None => true,
            };
            if port_matches {
                host_indexes.push(index);
            }
        }

        if host_indexes.len() == before && unresolved.is_none() {
            unresolved = Some(raw_host.clone());
        }
    }

    if host_indexes.len() != declared {
        return Err(match unresolved {
            Some(raw_host) => ConfigError::UnresolvedPartitionHost(raw_host),
            None => ConfigError::PartitionHostMismatch {
                declared,
                resolved: host_indexes.len(),
            },
        });
    }

    let partitions = build_partitions(&server_map.vbucket_map);
    let forward_partitions = server_map
        .vbucket_map_forward
        .as_ref()
        .map(|rows| build_partitions(rows));

    let primary_hosts = partitions
        .iter()
        .filter_map(Partition::master)
        .filter_map(|index| host_indexes.get(index as usize))
        .filter_map(|node_index| nodes.get(*node_index))
        .map(|node| node.host().to_string())
        .collect::<HashSet<_>>();

    Ok(PartitionMap::new(
        partitions,
        forward_partitions,
        server_map.num_replicas,
        host_indexes,
        primary_hosts,
    ))
}

fn build_partitions(rows: &[Vec<i32>]) -> Vec<Partition> {
    rows.iter()
        .map(|row| {
            let master = row.first().copied().unwrap_or(-1);
            let replicas = row.iter().skip(1).copied().collect();
            Partition::new(master, replicas)
        })
        .collect()
}

/// Splits a `host:port` partition host entry, handling the IPv6 bracket
/// form `[::1]:11210`. An unparseable port falls back to `0` which matches
/// any key-value port during resolution.
fn split_host_port(raw: &str) -> (String, u16) {
    let (host, port_str) = if let Some(rest) = raw.strip_prefix('[') {
        match rest.split_once(']') {
            Some((host, remainder)) => {
                (host.to_string(), remainder.strip_prefix(':').unwrap_or(""))
            },
            None => (rest.to_string(), ""),
        }
    } else {
        match raw.rsplit_once(':') {
            Some((host, port)) => (host.to_string(), port),
            None => (raw.to_string(), ""),
        }
    };

    let port = match port_str.parse::<u16>() {
        Ok(port) => port,
        Err(_) => {
            warn!(
                address = %raw,
                "Could not parse port from partition host, falling back to 0.",
            );
            0
        },
    };

    (host, port)
}
