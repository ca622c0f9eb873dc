mod utils;

use std::time::Duration;

use shoal_config::{NodeIdentifier, ServiceType};
use shoal_core::{ConfigIgnoredReason, Event, SeedNode, Transport};

use crate::utils::{create_cluster, multi_node_config, wait_for, TestCluster};

fn identifier(host: &str) -> NodeIdentifier {
    NodeIdentifier::new(host, 8091)
}

async fn cluster_with_bucket(hosts: &[&str]) -> TestCluster {
    let cluster = create_cluster([SeedNode::new(hosts[0])], false);
    cluster
        .kv_loader
        .set(hosts[0], multi_node_config("b", 1, hosts));
    cluster.core.open_bucket("b").await.expect("open bucket");

    let expected: Vec<NodeIdentifier> = hosts.iter().map(|host| identifier(host)).collect();
    let core = &cluster.core;
    assert!(
        wait_for(Duration::from_secs(1), || {
            let mut managed = core.managed_nodes();
            managed.sort();
            managed == expected
        })
        .await,
        "Initial topology should converge.",
    );
    cluster
}

#[tokio::test]
async fn test_stale_revision_is_ignored() -> anyhow::Result<()> {
    let cluster = cluster_with_bucket(&["10.0.0.1"]).await;

    // rev 7 applies, the replayed rev 5 must not.
    cluster
        .kv_refresher
        .push("b", multi_node_config("b", 7, &["10.0.0.1"]), "10.0.0.1");
    let core = &cluster.core;
    assert!(
        wait_for(Duration::from_secs(1), || {
            core.cluster_config()
                .bucket_config("b")
                .map(|config| config.rev() == 7)
                .unwrap_or(false)
        })
        .await
    );

    cluster
        .kv_refresher
        .push("b", multi_node_config("b", 5, &["10.0.0.1"]), "10.0.0.1");
    assert!(
        wait_for(Duration::from_secs(1), || {
            cluster.count_events(|e| {
                matches!(
                    e,
                    Event::ConfigIgnored {
                        reason: ConfigIgnoredReason::OldOrSameRevision,
                    },
                )
            }) == 1
        })
        .await
    );
    assert_eq!(
        cluster.core.cluster_config().bucket_config("b").unwrap().rev(),
        7,
    );

    cluster.core.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_removed_node_is_disconnected() -> anyhow::Result<()> {
    let cluster = cluster_with_bucket(&["10.0.0.1", "10.0.0.2"]).await;
    let core = &cluster.core;

    // Wait for node B's key-value endpoint to come up so the disconnect
    // is observable on its transport.
    assert!(
        wait_for(Duration::from_secs(1), || {
            cluster.factory.transport_for("10.0.0.2", 11210).is_some()
        })
        .await
    );

    cluster
        .kv_refresher
        .push("b", multi_node_config("b", 2, &["10.0.0.1"]), "10.0.0.1");

    assert!(
        wait_for(Duration::from_secs(1), || {
            core.managed_nodes() == vec![identifier("10.0.0.1")]
        })
        .await,
        "Node B should leave the managed set.",
    );
    assert!(
        wait_for(Duration::from_secs(1), || {
            !cluster
                .factory
                .transport_for("10.0.0.2", 11210)
                .unwrap()
                .is_active()
        })
        .await,
        "Node B's transport should be torn down.",
    );
    assert!(
        cluster.count_events(|e| matches!(e, Event::ReconfigurationCompleted { .. })) >= 1,
    );

    cluster.core.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_topology_round_trip_is_stable() -> anyhow::Result<()> {
    let cluster = cluster_with_bucket(&["10.0.0.1", "10.0.0.2"]).await;
    let core = &cluster.core;

    cluster
        .kv_refresher
        .push("b", multi_node_config("b", 2, &["10.0.0.1"]), "10.0.0.1");
    assert!(
        wait_for(Duration::from_secs(1), || {
            core.managed_nodes() == vec![identifier("10.0.0.1")]
        })
        .await
    );

    // Going back to the first topology yields the same managed set as
    // applying it directly.
    cluster.kv_refresher.push(
        "b",
        multi_node_config("b", 3, &["10.0.0.1", "10.0.0.2"]),
        "10.0.0.1",
    );
    assert!(
        wait_for(Duration::from_secs(1), || {
            let mut managed = core.managed_nodes();
            managed.sort();
            managed == vec![identifier("10.0.0.1"), identifier("10.0.0.2")]
        })
        .await
    );
    assert!(core.service_enabled_at(&identifier("10.0.0.2"), ServiceType::KeyValue));

    cluster.core.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_dropped_service_is_removed_from_node() -> anyhow::Result<()> {
    let cluster = cluster_with_bucket(&["10.0.0.1"]).await;
    let core = &cluster.core;
    assert!(core.service_enabled_at(&identifier("10.0.0.1"), ServiceType::Query));

    // The next config drops the query service from the node.
    let without_query = serde_json::json!({
        "rev": 2,
        "name": "b",
        "nodesExt": [
            {"hostname": "10.0.0.1", "services": {"kv": 11210, "mgmt": 8091}}
        ],
        "vBucketServerMap": {
            "numReplicas": 0,
            "serverList": ["10.0.0.1:11210"],
            "vBucketMap": (0..64).map(|_| vec![0]).collect::<Vec<_>>(),
        },
        "bucketCapabilities": ["couchapi"],
    })
    .to_string();
    cluster.kv_refresher.push("b", without_query, "10.0.0.1");

    assert!(
        wait_for(Duration::from_secs(1), || {
            !core.service_enabled_at(&identifier("10.0.0.1"), ServiceType::Query)
        })
        .await
    );
    // The node itself stays, key-value is still enabled.
    assert_eq!(core.managed_nodes(), vec![identifier("10.0.0.1")]);
    assert!(core.service_enabled_at(&identifier("10.0.0.1"), ServiceType::KeyValue));

    cluster.core.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_rapid_config_burst_converges_onto_last() -> anyhow::Result<()> {
    let cluster = cluster_with_bucket(&["10.0.0.1"]).await;
    let core = &cluster.core;

    // Three configs in quick succession. The barrier may coalesce the
    // middle one, but the final state must match the last config.
    cluster
        .kv_refresher
        .push("b", multi_node_config("b", 2, &["10.0.0.1", "10.0.0.2"]), "10.0.0.1");
    cluster
        .kv_refresher
        .push("b", multi_node_config("b", 3, &["10.0.0.2"]), "10.0.0.1");
    cluster.kv_refresher.push(
        "b",
        multi_node_config("b", 4, &["10.0.0.1", "10.0.0.2", "10.0.0.3"]),
        "10.0.0.1",
    );

    assert!(
        wait_for(Duration::from_secs(2), || {
            let mut managed = core.managed_nodes();
            managed.sort();
            managed
                == vec![
                    identifier("10.0.0.1"),
                    identifier("10.0.0.2"),
                    identifier("10.0.0.3"),
                ]
        })
        .await,
        "The managed set should converge onto the last config of the burst.",
    );
    assert_eq!(
        core.cluster_config().bucket_config("b").unwrap().rev(),
        4,
    );

    // Every skipped pass was replayed, nothing stays pending: the ignored
    // count can be anything (timing), but completions keep the system
    // quiescent afterwards.
    let completed =
        cluster.count_events(|e| matches!(e, Event::ReconfigurationCompleted { .. }));
    assert!(completed >= 1);

    cluster.core.shutdown().await;
    Ok(())
}
