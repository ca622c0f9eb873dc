use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use futures::stream::FuturesUnordered;
use futures::StreamExt;
use parking_lot::{Mutex, RwLock};
use shoal_config::{
    encode_unsigned_leb128,
    parse_bucket_config,
    parse_collections_manifest,
    BucketConfig,
    BucketType,
    ClusterConfig,
    CollectionIdentifier,
    CollectionMap,
};
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;

use crate::context::CoreContext;
use crate::error::CoreError;
use crate::events::{ConfigIgnoredReason, Event};
use crate::refresh::{ConfigLoader, ConfigRefresher, ProposedBucketConfigContext};
use crate::request::{Response, ResponseStatus};

pub(crate) const DEFAULT_KV_PORT: u16 = 11210;
pub(crate) const DEFAULT_KV_TLS_PORT: u16 = 11207;
pub(crate) const DEFAULT_MANAGER_PORT: u16 = 8091;
pub(crate) const DEFAULT_MANAGER_TLS_PORT: u16 = 18091;

/// The number of seed nodes probed concurrently during bootstrap.
const MAX_PARALLEL_LOADERS: usize = 5;

/// Fetches a raw collections manifest for one bucket.
///
/// Installed by the core after construction, the provider itself has no
/// dispatch path. Kept behind a narrow seam so the provider and the core
/// never form a strong reference cycle.
#[async_trait]
pub trait ManifestFetcher: Send + Sync + 'static {
    async fn fetch(&self, bucket: &str) -> Result<Response, CoreError>;
}

/// The configuration provider: bootstraps bucket configs from seed nodes,
/// gates refreshed configs by revision and broadcasts cluster snapshots to
/// its subscribers.
#[derive(Clone)]
pub struct ConfigurationProvider {
    inner: Arc<ProviderInner>,
}

pub(crate) struct ProviderInner {
    ctx: CoreContext,
    kv_loader: Arc<dyn ConfigLoader>,
    manager_loader: Arc<dyn ConfigLoader>,
    kv_refresher: Arc<dyn ConfigRefresher>,
    manager_refresher: Arc<dyn ConfigRefresher>,
    current: RwLock<ClusterConfig>,
    configs_tx: Mutex<Option<watch::Sender<ClusterConfig>>>,
    configs_rx: watch::Receiver<ClusterConfig>,
    shutdown: AtomicBool,
    collections: CollectionMap,
    manifest_fetcher: OnceLock<Box<dyn ManifestFetcher>>,
}

impl ConfigurationProvider {
    pub fn new(
        ctx: CoreContext,
        kv_loader: Arc<dyn ConfigLoader>,
        manager_loader: Arc<dyn ConfigLoader>,
        kv_refresher: Arc<dyn ConfigRefresher>,
        manager_refresher: Arc<dyn ConfigRefresher>,
    ) -> Self {
        let (configs_tx, configs_rx) = watch::channel(ClusterConfig::default());
        let inner = Arc::new(ProviderInner {
            ctx,
            kv_loader,
            manager_loader,
            kv_refresher,
            manager_refresher,
            current: RwLock::new(ClusterConfig::default()),
            configs_tx: Mutex::new(Some(configs_tx)),
            configs_rx,
            shutdown: AtomicBool::new(false),
            collections: CollectionMap::default(),
            manifest_fetcher: OnceLock::new(),
        });

        spawn_refresher_forwarder(&inner, inner.kv_refresher.clone());
        spawn_refresher_forwarder(&inner, inner.manager_refresher.clone());

        Self { inner }
    }

    /// The stream of cluster config snapshots. New subscribers immediately
    /// receive the latest snapshot, the stream completes after shutdown.
    pub fn configs(&self) -> WatchStream<ClusterConfig> {
        WatchStream::new(self.inner.configs_rx.clone())
    }

    /// The currently applied cluster config snapshot.
    pub fn config(&self) -> ClusterConfig {
        self.inner.current.read().clone()
    }

    pub fn collection_map(&self) -> &CollectionMap {
        &self.inner.collections
    }

    /// Bootstraps the given bucket from the configured seed nodes and
    /// registers it for background refreshing.
    pub async fn open_bucket(&self, name: &str) -> Result<(), CoreError> {
        self.inner.open_bucket(name).await
    }

    /// Offers a raw config to the provider, see
    /// [`ProviderInner::propose_bucket_config`] semantics: parse failures
    /// and stale revisions are swallowed and surfaced as events.
    pub fn propose_bucket_config(&self, proposed: ProposedBucketConfigContext) {
        self.inner.propose_bucket_config(proposed);
    }

    pub async fn close_bucket(&self, name: &str) -> Result<(), CoreError> {
        if self.inner.shutdown.load(Ordering::SeqCst) {
            return Err(CoreError::AlreadyShutdown);
        }
        self.inner.close_bucket_ignore_shutdown(name).await
    }

    /// Closes every open bucket, pushes one final snapshot, completes the
    /// config stream and shuts the refreshers down. The second call fails
    /// with [`CoreError::AlreadyShutdown`].
    pub async fn shutdown(&self) -> Result<(), CoreError> {
        self.inner.shutdown().await
    }

    /// Ensures the collection map for the bucket is populated, fetching
    /// and decoding the manifest when forced or missing.
    pub async fn refresh_collection_map(
        &self,
        bucket: &str,
        force: bool,
    ) -> Result<(), CoreError> {
        if !force && self.inner.collections.has_bucket_map(bucket) {
            return Ok(());
        }

        let fetcher = self.inner.manifest_fetcher.get().ok_or_else(|| {
            CoreError::Config("No collection manifest fetcher has been installed.".to_string())
        })?;

        let response = fetcher.fetch(bucket).await?;
        match response.status() {
            ResponseStatus::Success => {
                let raw = String::from_utf8_lossy(response.payload()).to_string();
                self.inner.parse_and_store_manifest(bucket, &raw);
                Ok(())
            },
            ResponseStatus::Unknown => Err(CoreError::CollectionsNotAvailable),
            status => Err(CoreError::UnexpectedStatus(status)),
        }
    }

    pub(crate) fn install_manifest_fetcher(&self, fetcher: Box<dyn ManifestFetcher>) {
        let _ = self.inner.manifest_fetcher.set(fetcher);
    }
}

/// Pumps a refresher's proposed configs into the provider. The task holds
/// the provider weakly so a dropped provider never lingers because of its
/// own refreshers.
fn spawn_refresher_forwarder(
    inner: &Arc<ProviderInner>,
    refresher: Arc<dyn ConfigRefresher>,
) {
    let stream = refresher.configs();
    let weak = Arc::downgrade(inner);
    tokio::spawn(async move {
        while let Ok(proposed) = stream.recv_async().await {
            let Some(inner) = weak.upgrade() else { break };
            inner.propose_bucket_config(proposed);
        }
    });
}

impl ProviderInner {
    async fn open_bucket(&self, name: &str) -> Result<(), CoreError> {
        if self.shutdown.load(Ordering::SeqCst) {
            return Err(CoreError::AlreadyShutdown);
        }

        let tls = self.ctx.config().security.tls_enabled;
        let default_kv = if tls { DEFAULT_KV_TLS_PORT } else { DEFAULT_KV_PORT };
        let default_manager = if tls {
            DEFAULT_MANAGER_TLS_PORT
        } else {
            DEFAULT_MANAGER_PORT
        };

        let mut attempts = FuturesUnordered::new();
        for seed in self
            .ctx
            .config()
            .seed_nodes
            .iter()
            .take(MAX_PARALLEL_LOADERS)
            .cloned()
        {
            let kv_loader = self.kv_loader.clone();
            let manager_loader = self.manager_loader.clone();
            let bucket = name.to_string();
            attempts.push(async move {
                let kv_port = seed.kv_port.unwrap_or(default_kv);
                match kv_loader.load(&seed.address, kv_port, &bucket).await {
                    Ok(proposed) => Ok(proposed),
                    Err(error) => {
                        debug!(
                            seed = %seed.address,
                            bucket = %bucket,
                            error = %error,
                            "Key-value loader failed, trying the cluster manager loader.",
                        );
                        let manager_port = seed.manager_port.unwrap_or(default_manager);
                        manager_loader.load(&seed.address, manager_port, &bucket).await
                    },
                }
            });
        }

        let mut loaded = None;
        while let Some(attempt) = attempts.next().await {
            match attempt {
                Ok(proposed) => {
                    loaded = Some(proposed);
                    break;
                },
                Err(error) => {
                    debug!(
                        bucket = %name,
                        error = %error,
                        "Seed node could not provide a bucket config.",
                    );
                },
            }
        }

        let outcome = match loaded {
            Some(proposed) => {
                self.propose_bucket_config(proposed);
                self.register_refresher(name).await
            },
            None => Err(CoreError::Config(format!(
                "Could not locate a single bucket configuration for bucket: {name}",
            ))),
        };

        if let Err(error) = outcome {
            if let Err(close_error) = self.close_bucket_ignore_shutdown(name).await {
                debug!(
                    bucket = %name,
                    error = %close_error,
                    "Cleanup after failed bucket open reported an error.",
                );
            }
            return Err(error);
        }
        Ok(())
    }

    /// Registers the refresher matching the loaded config: the key-value
    /// refresher for anything with a partition map, the manager refresher
    /// for memcached buckets.
    async fn register_refresher(&self, bucket: &str) -> Result<(), CoreError> {
        let bucket_type = self
            .current
            .read()
            .bucket_config(bucket)
            .map(|config| config.bucket_type());

        match bucket_type {
            None => Err(CoreError::Config(format!(
                "Bucket {bucket} has no applied config to register a refresher for.",
            ))),
            Some(BucketType::Memcached) => self.manager_refresher.register(bucket).await,
            Some(_) => self.kv_refresher.register(bucket).await,
        }
    }

    fn propose_bucket_config(&self, proposed: ProposedBucketConfigContext) {
        if self.shutdown.load(Ordering::SeqCst) {
            self.config_ignored(ConfigIgnoredReason::AlreadyShutdown);
            return;
        }

        match parse_bucket_config(&proposed.config, &proposed.origin) {
            Ok(config) => self.check_and_apply(config),
            Err(error) => {
                debug!(
                    bucket = %proposed.bucket,
                    origin = %proposed.origin,
                    error = %error,
                    "Ignoring bucket config which failed to parse.",
                );
                self.config_ignored(ConfigIgnoredReason::ParseFailure);
            },
        }
    }

    /// Applies the config unless its revision is stale. Revision 0 carries
    /// no revision information and is always accepted.
    fn check_and_apply(&self, config: BucketConfig) {
        let name = config.name().to_string();
        let rev = config.rev();

        let snapshot = {
            let mut current = self.current.write();
            let stale = current
                .bucket_config(&name)
                .map(|old| rev > 0 && rev <= old.rev())
                .unwrap_or(false);
            if stale {
                drop(current);
                self.config_ignored(ConfigIgnoredReason::OldOrSameRevision);
                return;
            }

            if config.tainted() {
                self.kv_refresher.mark_tainted(&name);
                self.manager_refresher.mark_tainted(&name);
            } else {
                self.kv_refresher.mark_untainted(&name);
                self.manager_refresher.mark_untainted(&name);
            }

            current.set_bucket_config(config);
            current.clone()
        };

        debug!(bucket = %name, rev = rev, "Applied new bucket config.");
        self.ctx.events().publish(Event::ConfigUpdated { bucket: name, rev });
        self.push_config(snapshot);
    }

    fn config_ignored(&self, reason: ConfigIgnoredReason) {
        self.ctx
            .statistics()
            .num_configs_ignored
            .fetch_add(1, Ordering::Relaxed);
        self.ctx.events().publish(Event::ConfigIgnored { reason });
    }

    async fn close_bucket_ignore_shutdown(&self, name: &str) -> Result<(), CoreError> {
        let snapshot = {
            let mut current = self.current.write();
            current.delete_bucket_config(name);
            current.clone()
        };
        self.push_config(snapshot);

        self.kv_refresher.deregister(name).await?;
        self.manager_refresher.deregister(name).await?;
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), CoreError> {
        if self
            .shutdown
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(CoreError::AlreadyShutdown);
        }

        let buckets: Vec<String> = {
            let current = self.current.read();
            current.bucket_configs().keys().cloned().collect()
        };
        for bucket in buckets {
            if let Err(error) = self.close_bucket_ignore_shutdown(&bucket).await {
                debug!(
                    bucket = %bucket,
                    error = %error,
                    "Failed to cleanly close bucket during provider shutdown.",
                );
            }
        }

        // One final (empty) snapshot so downstream consumers can tear
        // down, then the stream completes.
        let final_snapshot = self.current.read().clone();
        if let Some(tx) = self.configs_tx.lock().take() {
            let _ = tx.send(final_snapshot);
        }

        // Shutdown is best effort all the way through, a refresher that
        // fails to stop must not keep the other one alive.
        if let Err(error) = self.kv_refresher.shutdown().await {
            debug!(error = %error, "Key-value refresher failed to shut down cleanly.");
        }
        if let Err(error) = self.manager_refresher.shutdown().await {
            debug!(error = %error, "Cluster manager refresher failed to shut down cleanly.");
        }
        Ok(())
    }

    fn push_config(&self, snapshot: ClusterConfig) {
        if let Some(tx) = self.configs_tx.lock().as_ref() {
            let _ = tx.send(snapshot);
        }
    }

    /// Decodes a manifest and swaps in the bucket's collection id map.
    /// Decoding failures are surfaced as events and leave the old map
    /// untouched.
    fn parse_and_store_manifest(&self, bucket: &str, raw: &str) {
        let manifest = match parse_collections_manifest(raw) {
            Ok(manifest) => manifest,
            Err(error) => {
                self.ctx.events().publish(Event::CollectionMapDecodingFailed {
                    bucket: bucket.to_string(),
                    error: error.to_string(),
                });
                return;
            },
        };

        let mut entries = Vec::new();
        for scope in &manifest.scopes {
            for collection in &scope.collections {
                let id = match u64::from_str_radix(&collection.uid, 16) {
                    Ok(id) => id,
                    Err(error) => {
                        self.ctx.events().publish(Event::CollectionMapDecodingFailed {
                            bucket: bucket.to_string(),
                            error: format!(
                                "Invalid collection uid `{}`: {error}",
                                collection.uid,
                            ),
                        });
                        return;
                    },
                };

                entries.push((
                    CollectionIdentifier::new(
                        bucket,
                        Some(scope.name.clone()),
                        Some(collection.name.clone()),
                    ),
                    encode_unsigned_leb128(id),
                ));
            }
        }

        self.collections.replace_bucket(bucket, entries);
    }
}
