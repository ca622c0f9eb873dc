use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::config::SeedNode;
use crate::error::CoreError;
use crate::provider::{
    DEFAULT_KV_PORT,
    DEFAULT_KV_TLS_PORT,
    DEFAULT_MANAGER_PORT,
    DEFAULT_MANAGER_TLS_PORT,
};

/// How often a registered bucket is re-polled for a fresh config.
const POLL_INTERVAL: Duration = if cfg!(test) {
    Duration::from_millis(100)
} else {
    Duration::from_millis(2500)
};

/// The faster cadence used while a bucket's config is tainted (the cluster
/// is rebalancing and the topology moves quickly).
const TAINTED_POLL_INTERVAL: Duration = if cfg!(test) {
    Duration::from_millis(25)
} else {
    Duration::from_millis(250)
};

/// A raw config document on its way into the provider.
#[derive(Debug, Clone)]
pub struct ProposedBucketConfigContext {
    pub bucket: String,
    /// The raw JSON document as fetched from the server.
    pub config: String,
    /// The host the document was fetched from.
    pub origin: String,
}

/// Fetches one raw bucket config from one node.
///
/// Two implementations exist per deployment: one speaking the key-value
/// protocol and one asking the cluster manager over HTTP. Both are
/// collaborators of the core, which only consumes this seam.
#[async_trait]
pub trait ConfigLoader: Send + Sync + 'static {
    async fn load(
        &self,
        host: &str,
        port: u16,
        bucket: &str,
    ) -> Result<ProposedBucketConfigContext, CoreError>;
}

/// A background source of fresh bucket configs.
///
/// Refreshers publish proposed configs on their stream, the provider
/// subscribes and gates them by revision. Buckets are registered and
/// deregistered as they open and close, and marked tainted while the
/// cluster rebalances so the refresher can poll faster.
#[async_trait]
pub trait ConfigRefresher: Send + Sync + 'static {
    /// The stream of proposed configs this refresher produces.
    fn configs(&self) -> flume::Receiver<ProposedBucketConfigContext>;

    async fn register(&self, bucket: &str) -> Result<(), CoreError>;

    async fn deregister(&self, bucket: &str) -> Result<(), CoreError>;

    fn mark_tainted(&self, bucket: &str);

    fn mark_untainted(&self, bucket: &str);

    async fn shutdown(&self) -> Result<(), CoreError>;
}

/// Which port a polling refresher dials on each seed.
#[derive(Debug, Clone, Copy)]
enum PollSource {
    KeyValue,
    Manager,
}

#[derive(Debug, Clone)]
struct BucketRefreshState {
    tainted: Arc<AtomicBool>,
    stop: Arc<AtomicBool>,
}

/// The built-in interval polling refresher.
///
/// Round-robins the seed nodes and re-fetches each registered bucket's
/// config through the wrapped loader, switching to the tainted cadence
/// during rebalance.
pub struct PollingRefresher {
    inner: Arc<PollingRefresherInner>,
}

struct PollingRefresherInner {
    loader: Arc<dyn ConfigLoader>,
    seeds: Vec<SeedNode>,
    source: PollSource,
    tls: bool,
    proposed_tx: Mutex<Option<flume::Sender<ProposedBucketConfigContext>>>,
    proposed_rx: flume::Receiver<ProposedBucketConfigContext>,
    buckets: Mutex<HashMap<String, BucketRefreshState>>,
    stopped: AtomicBool,
    stop_signal: Notify,
}

impl PollingRefresher {
    pub fn key_value(loader: Arc<dyn ConfigLoader>, seeds: Vec<SeedNode>, tls: bool) -> Self {
        Self::new(loader, seeds, PollSource::KeyValue, tls)
    }

    pub fn manager(loader: Arc<dyn ConfigLoader>, seeds: Vec<SeedNode>, tls: bool) -> Self {
        Self::new(loader, seeds, PollSource::Manager, tls)
    }

    fn new(
        loader: Arc<dyn ConfigLoader>,
        seeds: Vec<SeedNode>,
        source: PollSource,
        tls: bool,
    ) -> Self {
        let (proposed_tx, proposed_rx) = flume::bounded(64);
        Self {
            inner: Arc::new(PollingRefresherInner {
                loader,
                seeds,
                source,
                tls,
                proposed_tx: Mutex::new(Some(proposed_tx)),
                proposed_rx,
                buckets: Mutex::new(HashMap::new()),
                stopped: AtomicBool::new(false),
                stop_signal: Notify::new(),
            }),
        }
    }
}

impl PollingRefresherInner {
    fn seed_port(&self, seed: &SeedNode) -> u16 {
        match self.source {
            PollSource::KeyValue => seed.kv_port.unwrap_or(if self.tls {
                DEFAULT_KV_TLS_PORT
            } else {
                DEFAULT_KV_PORT
            }),
            PollSource::Manager => seed.manager_port.unwrap_or(if self.tls {
                DEFAULT_MANAGER_TLS_PORT
            } else {
                DEFAULT_MANAGER_PORT
            }),
        }
    }
}

#[async_trait]
impl ConfigRefresher for PollingRefresher {
    fn configs(&self) -> flume::Receiver<ProposedBucketConfigContext> {
        self.inner.proposed_rx.clone()
    }

    async fn register(&self, bucket: &str) -> Result<(), CoreError> {
        if self.inner.stopped.load(Ordering::SeqCst) {
            return Err(CoreError::AlreadyShutdown);
        }

        let state = BucketRefreshState {
            tainted: Arc::new(AtomicBool::new(false)),
            stop: Arc::new(AtomicBool::new(false)),
        };
        {
            let mut buckets = self.inner.buckets.lock();
            if buckets.contains_key(bucket) {
                return Ok(());
            }
            buckets.insert(bucket.to_string(), state.clone());
        }

        let tx = self.inner.proposed_tx.lock().clone();
        let Some(tx) = tx else {
            return Err(CoreError::AlreadyShutdown);
        };

        debug!(bucket = %bucket, "Registering bucket for config polling.");
        tokio::spawn(poll_bucket(
            self.inner.clone(),
            bucket.to_string(),
            state,
            tx,
        ));
        Ok(())
    }

    async fn deregister(&self, bucket: &str) -> Result<(), CoreError> {
        let removed = self.inner.buckets.lock().remove(bucket);
        if let Some(state) = removed {
            debug!(bucket = %bucket, "Deregistering bucket from config polling.");
            state.stop.store(true, Ordering::SeqCst);
            self.inner.stop_signal.notify_waiters();
        }
        Ok(())
    }

    fn mark_tainted(&self, bucket: &str) {
        if let Some(state) = self.inner.buckets.lock().get(bucket) {
            state.tainted.store(true, Ordering::SeqCst);
        }
    }

    fn mark_untainted(&self, bucket: &str) {
        if let Some(state) = self.inner.buckets.lock().get(bucket) {
            state.tainted.store(false, Ordering::SeqCst);
        }
    }

    async fn shutdown(&self) -> Result<(), CoreError> {
        if self
            .inner
            .stopped
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(CoreError::AlreadyShutdown);
        }

        let buckets: Vec<BucketRefreshState> =
            self.inner.buckets.lock().drain().map(|(_, state)| state).collect();
        for state in buckets {
            state.stop.store(true, Ordering::SeqCst);
        }
        self.inner.stop_signal.notify_waiters();
        // Dropping the sender completes the stream once the poll tasks
        // released their clones.
        self.inner.proposed_tx.lock().take();
        Ok(())
    }
}

async fn poll_bucket(
    inner: Arc<PollingRefresherInner>,
    bucket: String,
    state: BucketRefreshState,
    tx: flume::Sender<ProposedBucketConfigContext>,
) {
    let mut cursor = 0usize;

    loop {
        let delay = if state.tainted.load(Ordering::SeqCst) {
            TAINTED_POLL_INTERVAL
        } else {
            POLL_INTERVAL
        };

        tokio::select! {
            _ = tokio::time::sleep(delay) => {},
            _ = inner.stop_signal.notified() => {},
        }
        if state.stop.load(Ordering::SeqCst) || inner.stopped.load(Ordering::SeqCst) {
            return;
        }
        if inner.seeds.is_empty() {
            continue;
        }

        let seed = inner.seeds[cursor % inner.seeds.len()].clone();
        cursor += 1;

        match inner.loader.load(&seed.address, inner.seed_port(&seed), &bucket).await {
            Ok(proposed) => {
                if tx.send_async(proposed).await.is_err() {
                    return;
                }
            },
            Err(error) => {
                debug!(
                    bucket = %bucket,
                    seed = %seed.address,
                    error = %error,
                    "Config refresh attempt failed.",
                );
            },
        }
    }
}
