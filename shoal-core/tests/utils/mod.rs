#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use shoal_core::{
    ConfigLoader,
    ConfigRefresher,
    Core,
    CoreConfig,
    CoreError,
    EndpointAddress,
    Event,
    EventBus,
    ProposedBucketConfigContext,
    Request,
    SecurityConfig,
    SeedNode,
    Transport,
    TransportFactory,
};

/// An in-memory transport which records every written request.
pub struct MemoryTransport {
    address: EndpointAddress,
    written: Mutex<Vec<Request>>,
    inactive: AtomicBool,
}

impl MemoryTransport {
    pub fn written(&self) -> Vec<Request> {
        self.written.lock().clone()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn write(&self, request: Request) {
        self.written.lock().push(request);
    }

    fn is_active(&self) -> bool {
        !self.inactive.load(Ordering::SeqCst)
    }

    fn is_writable(&self) -> bool {
        self.is_active()
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }

    async fn disconnect(&self) -> Result<(), CoreError> {
        self.inactive.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Dials [`MemoryTransport`]s and keeps a log of every address touched.
#[derive(Default)]
pub struct MemoryTransportFactory {
    dialed: Mutex<Vec<EndpointAddress>>,
    transports: Mutex<Vec<Arc<MemoryTransport>>>,
}

impl MemoryTransportFactory {
    pub fn dialed(&self) -> Vec<EndpointAddress> {
        self.dialed.lock().clone()
    }

    pub fn dialed_ports(&self) -> HashSet<u16> {
        self.dialed.lock().iter().map(|address| address.port).collect()
    }

    pub fn transports(&self) -> Vec<Arc<MemoryTransport>> {
        self.transports.lock().clone()
    }

    /// The most recent transport dialed for the given host and port.
    pub fn transport_for(&self, host: &str, port: u16) -> Option<Arc<MemoryTransport>> {
        self.transports
            .lock()
            .iter()
            .rev()
            .find(|transport| {
                transport.address.host == host && transport.address.port == port
            })
            .cloned()
    }

    /// Every request written to any transport of the given host/port.
    pub fn written_to(&self, host: &str, port: u16) -> Vec<Request> {
        self.transports
            .lock()
            .iter()
            .filter(|transport| {
                transport.address.host == host && transport.address.port == port
            })
            .flat_map(|transport| transport.written())
            .collect()
    }
}

#[async_trait]
impl TransportFactory for MemoryTransportFactory {
    async fn connect(
        &self,
        address: &EndpointAddress,
        _security: &SecurityConfig,
    ) -> Result<Arc<dyn Transport>, CoreError> {
        self.dialed.lock().push(address.clone());
        let transport = Arc::new(MemoryTransport {
            address: address.clone(),
            written: Mutex::new(Vec::new()),
            inactive: AtomicBool::new(false),
        });
        self.transports.lock().push(transport.clone());
        Ok(transport)
    }
}

/// Serves static raw configs per host, recording every load call.
#[derive(Default)]
pub struct StaticConfigLoader {
    configs: Mutex<HashMap<String, String>>,
    calls: Mutex<Vec<(String, u16, String)>>,
}

impl StaticConfigLoader {
    pub fn set(&self, host: &str, raw: impl Into<String>) {
        self.configs.lock().insert(host.to_string(), raw.into());
    }

    pub fn calls(&self) -> Vec<(String, u16, String)> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl ConfigLoader for StaticConfigLoader {
    async fn load(
        &self,
        host: &str,
        port: u16,
        bucket: &str,
    ) -> Result<ProposedBucketConfigContext, CoreError> {
        self.calls
            .lock()
            .push((host.to_string(), port, bucket.to_string()));
        match self.configs.lock().get(host).cloned() {
            Some(config) => Ok(ProposedBucketConfigContext {
                bucket: bucket.to_string(),
                config,
                origin: host.to_string(),
            }),
            None => Err(CoreError::Connection(format!("{host}: connection refused"))),
        }
    }
}

/// A refresher driven by the test instead of a poll loop.
pub struct ManualRefresher {
    tx: flume::Sender<ProposedBucketConfigContext>,
    rx: flume::Receiver<ProposedBucketConfigContext>,
    registered: Mutex<HashSet<String>>,
    tainted: Mutex<HashSet<String>>,
    stopped: AtomicBool,
}

impl Default for ManualRefresher {
    fn default() -> Self {
        let (tx, rx) = flume::bounded(64);
        Self {
            tx,
            rx,
            registered: Mutex::new(HashSet::new()),
            tainted: Mutex::new(HashSet::new()),
            stopped: AtomicBool::new(false),
        }
    }
}

impl ManualRefresher {
    /// Pushes a raw config onto this refresher's stream, as a real
    /// refresher would after polling the cluster.
    pub fn push(&self, bucket: &str, config: impl Into<String>, origin: &str) {
        let _ = self.tx.send(ProposedBucketConfigContext {
            bucket: bucket.to_string(),
            config: config.into(),
            origin: origin.to_string(),
        });
    }

    pub fn registered(&self) -> HashSet<String> {
        self.registered.lock().clone()
    }

    pub fn tainted(&self) -> HashSet<String> {
        self.tainted.lock().clone()
    }
}

#[async_trait]
impl ConfigRefresher for ManualRefresher {
    fn configs(&self) -> flume::Receiver<ProposedBucketConfigContext> {
        self.rx.clone()
    }

    async fn register(&self, bucket: &str) -> Result<(), CoreError> {
        self.registered.lock().insert(bucket.to_string());
        Ok(())
    }

    async fn deregister(&self, bucket: &str) -> Result<(), CoreError> {
        self.registered.lock().remove(bucket);
        Ok(())
    }

    fn mark_tainted(&self, bucket: &str) {
        self.tainted.lock().insert(bucket.to_string());
    }

    fn mark_untainted(&self, bucket: &str) {
        self.tainted.lock().remove(bucket);
    }

    async fn shutdown(&self) -> Result<(), CoreError> {
        self.stopped.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// One fully wired core against in-memory collaborators.
pub struct TestCluster {
    pub core: Core,
    pub factory: Arc<MemoryTransportFactory>,
    pub kv_loader: Arc<StaticConfigLoader>,
    pub manager_loader: Arc<StaticConfigLoader>,
    pub kv_refresher: Arc<ManualRefresher>,
    pub manager_refresher: Arc<ManualRefresher>,
    pub events: Arc<Mutex<Vec<Event>>>,
}

impl TestCluster {
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    pub fn count_events(&self, matcher: impl Fn(&Event) -> bool) -> usize {
        self.events.lock().iter().filter(|event| matcher(event)).count()
    }
}

pub fn create_cluster(seeds: impl IntoIterator<Item = SeedNode>, tls: bool) -> TestCluster {
    let _ = tracing_subscriber::fmt::try_init();

    let factory = Arc::new(MemoryTransportFactory::default());
    let kv_loader = Arc::new(StaticConfigLoader::default());
    let manager_loader = Arc::new(StaticConfigLoader::default());
    let kv_refresher = Arc::new(ManualRefresher::default());
    let manager_refresher = Arc::new(ManualRefresher::default());

    let bus = EventBus::default();
    let events = collect_events(&bus);

    let core = Core::builder(
        CoreConfig::new(seeds).with_tls(tls),
        factory.clone(),
        kv_loader.clone(),
        manager_loader.clone(),
    )
    .with_refreshers(kv_refresher.clone(), manager_refresher.clone())
    .with_event_bus(bus)
    .build();

    TestCluster {
        core,
        factory,
        kv_loader,
        manager_loader,
        kv_refresher,
        manager_refresher,
        events,
    }
}

pub fn collect_events(bus: &EventBus) -> Arc<Mutex<Vec<Event>>> {
    let sink = Arc::new(Mutex::new(Vec::new()));
    let mut stream = bus.subscribe();
    let collected = sink.clone();
    tokio::spawn(async move {
        loop {
            match stream.recv().await {
                Ok(event) => collected.lock().push(event),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });
    sink
}

/// Polls the predicate until it holds or the timeout elapses.
pub async fn wait_for(timeout: Duration, mut predicate: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if predicate() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    predicate()
}

/// A single node bucket config: key-value and manager services, 1024
/// partitions all mastered by the node.
pub fn single_node_config(name: &str, rev: u64, host: &str) -> String {
    let vbucket_map: Vec<Vec<i32>> = vec![vec![0]; 1024];
    serde_json::json!({
        "rev": rev,
        "name": name,
        "uuid": "aa3f8a2b",
        "nodesExt": [
            {"hostname": host, "services": {"kv": 11210, "mgmt": 8091}}
        ],
        "vBucketServerMap": {
            "hashAlgorithm": "CRC",
            "numReplicas": 0,
            "serverList": [format!("{host}:11210")],
            "vBucketMap": vbucket_map,
        },
        "bucketCapabilities": ["couchapi", "cccp"],
    })
    .to_string()
}

/// A bucket config spanning several hosts, each carrying key-value,
/// manager and query. Partition masters round robin over the hosts.
pub fn multi_node_config(name: &str, rev: u64, hosts: &[&str]) -> String {
    let nodes_ext: Vec<serde_json::Value> = hosts
        .iter()
        .map(|host| {
            serde_json::json!({
                "hostname": host,
                "services": {"kv": 11210, "mgmt": 8091, "n1ql": 8093},
            })
        })
        .collect();
    let server_list: Vec<String> =
        hosts.iter().map(|host| format!("{host}:11210")).collect();
    let vbucket_map: Vec<Vec<i32>> = (0..64)
        .map(|partition| vec![(partition % hosts.len()) as i32])
        .collect();

    serde_json::json!({
        "rev": rev,
        "name": name,
        "uuid": "aa3f8a2b",
        "nodesExt": nodes_ext,
        "vBucketServerMap": {
            "hashAlgorithm": "CRC",
            "numReplicas": 0,
            "serverList": server_list,
            "vBucketMap": vbucket_map,
        },
        "bucketCapabilities": ["couchapi", "cccp"],
    })
    .to_string()
}

/// A config as served by a TLS-only deployment: the plaintext services
/// map is empty, everything lives on the SSL variants.
pub fn tls_only_config(name: &str, rev: u64, host: &str) -> String {
    let vbucket_map: Vec<Vec<i32>> = vec![vec![0]; 64];
    serde_json::json!({
        "rev": rev,
        "name": name,
        "uuid": "aa3f8a2b",
        "nodesExt": [
            {"hostname": host, "services": {"kvSSL": 11207, "mgmtSSL": 18091}}
        ],
        "vBucketServerMap": {
            "hashAlgorithm": "CRC",
            "numReplicas": 0,
            "serverList": [format!("{host}:11210")],
            "vBucketMap": vbucket_map,
        },
        "bucketCapabilities": ["couchapi", "cccp"],
    })
    .to_string()
}
