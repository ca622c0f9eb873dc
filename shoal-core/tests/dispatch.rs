mod utils;

use std::collections::HashSet;
use std::time::Duration;

use shoal_config::{CollectionIdentifier, ServiceType};
use shoal_core::{CoreError, Request, RequestKind, Response, SeedNode};

use crate::utils::{create_cluster, multi_node_config, single_node_config, wait_for};

#[tokio::test]
async fn test_key_value_dispatch_reaches_partition_master() -> anyhow::Result<()> {
    let cluster = create_cluster([SeedNode::new("10.0.0.1")], false);
    cluster
        .kv_loader
        .set("10.0.0.1", single_node_config("b", 1, "10.0.0.1"));
    cluster.core.open_bucket("b").await?;

    assert!(
        wait_for(Duration::from_secs(1), || {
            cluster.factory.transport_for("10.0.0.1", 11210).is_some()
        })
        .await
    );

    // The key "k" hashes onto its partition, whose master is node 0.
    let config = cluster.core.cluster_config();
    let bucket = config.bucket_config("b").unwrap();
    let partitions = bucket.partitions().unwrap();
    let partition = partitions.partition_for_key(b"k");
    assert_eq!(partition as u32, crc32fast::hash(b"k") & 1023);
    let master = partitions.node_index_for_master(partition, false).unwrap();
    assert_eq!(bucket.node_at_index(master).unwrap().host(), "10.0.0.1");

    let request = Request::key_value("b", "k", "v", Duration::from_secs(2));
    cluster.core.send(request.clone());

    assert!(
        wait_for(Duration::from_secs(1), || {
            cluster
                .factory
                .written_to("10.0.0.1", 11210)
                .iter()
                .any(|written| written.id() == request.id())
        })
        .await,
        "The request should be written to the master's key-value transport.",
    );

    request.succeed(Response::success("ok"));
    assert!(request.response().await.is_ok());

    cluster.core.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_query_requests_round_robin_over_nodes() -> anyhow::Result<()> {
    let cluster = create_cluster([SeedNode::new("10.0.0.1")], false);
    cluster.kv_loader.set(
        "10.0.0.1",
        multi_node_config("b", 1, &["10.0.0.1", "10.0.0.2"]),
    );
    cluster.core.open_bucket("b").await?;

    let core = &cluster.core;
    assert!(
        wait_for(Duration::from_secs(1), || core.managed_nodes().len() == 2).await
    );

    let requests: Vec<Request> = (0..4)
        .map(|n| {
            Request::operation(
                ServiceType::Query,
                format!("select {n}"),
                Duration::from_secs(5),
            )
        })
        .collect();
    for request in &requests {
        cluster.core.send(request.clone());
    }

    // Query pools start cold, requests bounce through the retry
    // orchestrator until the endpoints come up, then every one of them
    // gets written exactly once.
    assert!(
        wait_for(Duration::from_secs(3), || {
            let written: usize = ["10.0.0.1", "10.0.0.2"]
                .iter()
                .map(|host| cluster.factory.written_to(host, 8093).len())
                .sum();
            written == requests.len()
        })
        .await,
        "All query requests should eventually be written.",
    );

    let hosts: HashSet<String> = cluster
        .factory
        .dialed()
        .into_iter()
        .filter(|address| address.port == 8093)
        .map(|address| address.host)
        .collect();
    assert_eq!(
        hosts,
        HashSet::from_iter(["10.0.0.1".to_string(), "10.0.0.2".to_string()]),
        "Round robin should touch both query nodes.",
    );

    cluster.core.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_undispatchable_request_times_out() {
    let cluster = create_cluster([SeedNode::new("10.0.0.1")], false);

    // No bucket was ever opened, dispatch loops through the retry
    // orchestrator until the timer fires.
    let request = Request::key_value("b", "k", "v", Duration::from_millis(150));
    cluster.core.send(request.clone());

    let outcome = request.response().await;
    assert!(matches!(outcome, Err(CoreError::Timeout(_))));

    cluster.core.shutdown().await;
}

#[tokio::test]
async fn test_collection_manifest_flows_through_dispatch() -> anyhow::Result<()> {
    let cluster = create_cluster([SeedNode::new("10.0.0.1")], false);
    cluster
        .kv_loader
        .set("10.0.0.1", single_node_config("b", 1, "10.0.0.1"));
    cluster.core.open_bucket("b").await?;

    assert!(
        wait_for(Duration::from_secs(1), || {
            cluster.factory.transport_for("10.0.0.1", 11210).is_some()
        })
        .await
    );

    // Answer the provider's manifest fetch like a server would.
    let factory = cluster.factory.clone();
    tokio::spawn(async move {
        let manifest = r#"{
            "uid": "a",
            "scopes": [{
                "name": "_default",
                "uid": "0",
                "collections": [{"name": "users", "uid": "8"}]
            }]
        }"#;
        loop {
            let pending = factory
                .written_to("10.0.0.1", 11210)
                .into_iter()
                .find(|request| request.kind() == RequestKind::CollectionManifest);
            if let Some(request) = pending {
                request.succeed(Response::success(manifest));
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    });

    cluster
        .core
        .configuration_provider()
        .refresh_collection_map("b", false)
        .await?;

    let identifier = CollectionIdentifier::new(
        "b",
        Some("_default".to_string()),
        Some("users".to_string()),
    );
    assert_eq!(
        cluster
            .core
            .configuration_provider()
            .collection_map()
            .get(&identifier),
        Some(vec![0x08]),
    );

    cluster.core.shutdown().await;
    Ok(())
}
