use std::sync::atomic::{AtomicUsize, Ordering};

use shoal_config::{ClusterConfig, ServiceType};

use crate::context::CoreContext;
use crate::node::Node;
use crate::request::Request;
use crate::retry::RetryReason;

/// Picks the node a request is dispatched to.
///
/// When no node satisfies the request right now, the request goes to the
/// retry orchestrator which may resubmit it once the topology caught up.
pub enum Locator {
    /// Partition addressed dispatch for the key-value service.
    KeyValue,
    /// Any node offering the manager service, stable smallest-identifier
    /// ordering for cache locality of admin requests.
    Manager,
    /// Round robin over the nodes offering the given service.
    RoundRobin {
        service: ServiceType,
        counter: AtomicUsize,
    },
}

impl Locator {
    pub fn round_robin(service: ServiceType) -> Self {
        Locator::RoundRobin {
            service,
            counter: AtomicUsize::new(0),
        }
    }

    pub fn dispatch(
        &self,
        request: Request,
        nodes: &[Node],
        config: &ClusterConfig,
        ctx: &CoreContext,
    ) {
        match self {
            Locator::KeyValue => dispatch_key_value(request, nodes, config, ctx),
            Locator::Manager => {
                let target = nodes
                    .iter()
                    .filter(|node| node.service_enabled(ServiceType::Manager))
                    .min_by_key(|node| node.identifier().clone());
                match target {
                    Some(node) => node.send(request),
                    None => ctx.maybe_retry(request, RetryReason::NodeNotAvailable),
                }
            },
            Locator::RoundRobin { service, counter } => {
                let candidates: Vec<&Node> = nodes
                    .iter()
                    .filter(|node| node.service_enabled(*service))
                    .collect();
                if candidates.is_empty() {
                    ctx.maybe_retry(request, RetryReason::NodeNotAvailable);
                    return;
                }
                let index = counter.fetch_add(1, Ordering::Relaxed) % candidates.len();
                candidates[index].send(request);
            },
        }
    }
}

/// Hashes the key onto its partition, resolves the partition's master (or
/// the requested replica) and dispatches to the owning node's key-value
/// service.
fn dispatch_key_value(
    request: Request,
    nodes: &[Node],
    config: &ClusterConfig,
    ctx: &CoreContext,
) {
    let Some(bucket) = request.bucket() else {
        ctx.maybe_retry(request, RetryReason::BucketNotAvailable);
        return;
    };
    let Some(bucket_config) = config.bucket_config(bucket) else {
        ctx.maybe_retry(request, RetryReason::BucketNotAvailable);
        return;
    };
    let Some(partitions) = bucket_config.partitions() else {
        // Memcached style buckets have no partition map to dispatch on.
        ctx.maybe_retry(request, RetryReason::PartitionNotAvailable);
        return;
    };
    // Requests without a key (collection manifest fetches and friends)
    // are addressed at partition 0.
    let partition = match request.key() {
        Some(key) => partitions.partition_for_key(key),
        None => 0,
    };
    let use_fast_forward = request.use_fast_forward() && partitions.has_fast_forward_map();
    let node_index = match request.replica() {
        Some(replica) => {
            partitions.node_index_for_replica(partition, replica, use_fast_forward)
        },
        None => partitions.node_index_for_master(partition, use_fast_forward),
    };

    let Some(node_index) = node_index else {
        trace!(
            bucket = %bucket,
            partition = partition,
            "Partition has no usable target, handing request to retry.",
        );
        ctx.maybe_retry(request, RetryReason::PartitionNotAvailable);
        return;
    };
    let Some(node_info) = bucket_config.node_at_index(node_index) else {
        ctx.maybe_retry(request, RetryReason::PartitionNotAvailable);
        return;
    };

    let target = nodes
        .iter()
        .find(|node| node.identifier() == node_info.identifier());
    match target {
        Some(node) => node.send(request),
        // The config references a node the reconciler has not converged
        // onto yet (or already dropped).
        None => ctx.maybe_retry(request, RetryReason::NodeNotAvailable),
    }
}
