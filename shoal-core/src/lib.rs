//! # Shoal Core
//! The control plane of the shoal client runtime.
//!
//! A [`Core`] keeps a live view of the cluster topology across every open
//! bucket and converges its managed node/service/endpoint set onto each
//! new configuration the [`ConfigurationProvider`] publishes. Requests
//! enter through [`Core::send`], a service specific [`Locator`] picks the
//! node, the node picks the service, the service picks a pooled endpoint
//! and the endpoint writes to its transport.
//!
//! The actual I/O (transports, config loaders) and the per service wire
//! codecs are collaborators injected through traits, the core owns the
//! lifecycle and the routing.
//!
//! ## Getting started
//!
//! ```ignore
//! use std::sync::Arc;
//! use shoal_core::{Core, CoreConfig, SeedNode};
//!
//! let config = CoreConfig::new([SeedNode::new("10.143.200.1")]);
//! let core = Core::builder(config, transport_factory, kv_loader, manager_loader)
//!     .build();
//!
//! core.open_bucket("travel").await?;
//! core.send(request);
//! ```

#[macro_use]
extern crate tracing;

mod breaker;
mod config;
mod context;
mod endpoint;
mod error;
mod events;
mod locator;
mod node;
mod provider;
mod refresh;
mod request;
mod retry;
mod service;
mod statistics;
#[cfg(test)]
mod test_support;
mod transport;

pub use breaker::{BreakerState, CircuitBreaker};
pub use config::{
    CircuitBreakerConfig,
    CoreConfig,
    EndpointPoolConfig,
    SecurityConfig,
    SeedNode,
    TimeoutConfig,
};
pub use context::CoreContext;
pub use endpoint::{Endpoint, EndpointState};
pub use error::CoreError;
pub use events::{ConfigIgnoredReason, Event, EventBus};
pub use locator::Locator;
pub use node::Node;
pub use provider::{ConfigurationProvider, ManifestFetcher};
pub use refresh::{
    ConfigLoader,
    ConfigRefresher,
    PollingRefresher,
    ProposedBucketConfigContext,
};
pub use request::{
    CancellationReason,
    Request,
    RequestKind,
    Response,
    ResponseStatus,
    Timer,
};
pub use retry::{BestEffortRetry, RetryOrchestrator, RetryReason};
pub use service::Service;
pub use statistics::CoreStatistics;
pub use transport::{EndpointAddress, Transport, TransportFactory};

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::RwLock;
use shoal_config::{ClusterConfig, NodeIdentifier, ServiceScope, ServiceType};

/// Counts up core ids for each new instance, process wide.
static CORE_IDS: AtomicU64 = AtomicU64::new(0);

/// The locator set, one per service type. Shared across the lifetime of
/// the core, the round robin cursors live inside.
struct Locators {
    key_value: Locator,
    manager: Locator,
    query: Locator,
    search: Locator,
    analytics: Locator,
    views: Locator,
}

impl Locators {
    fn new() -> Self {
        Self {
            key_value: Locator::KeyValue,
            manager: Locator::Manager,
            query: Locator::round_robin(ServiceType::Query),
            search: Locator::round_robin(ServiceType::Search),
            analytics: Locator::round_robin(ServiceType::Analytics),
            views: Locator::round_robin(ServiceType::Views),
        }
    }

    fn get(&self, service: ServiceType) -> &Locator {
        match service {
            ServiceType::KeyValue => &self.key_value,
            ServiceType::Manager => &self.manager,
            ServiceType::Query => &self.query,
            ServiceType::Search => &self.search,
            ServiceType::Analytics => &self.analytics,
            ServiceType::Views => &self.views,
        }
    }
}

/// Builds a [`Core`] from its configuration and collaborators.
pub struct CoreBuilder {
    config: CoreConfig,
    transport_factory: Arc<dyn TransportFactory>,
    kv_loader: Arc<dyn ConfigLoader>,
    manager_loader: Arc<dyn ConfigLoader>,
    kv_refresher: Option<Arc<dyn ConfigRefresher>>,
    manager_refresher: Option<Arc<dyn ConfigRefresher>>,
    retry: Arc<dyn RetryOrchestrator>,
    events: EventBus,
}

impl CoreBuilder {
    /// Replaces the built-in polling refreshers with custom sources.
    pub fn with_refreshers(
        mut self,
        kv: Arc<dyn ConfigRefresher>,
        manager: Arc<dyn ConfigRefresher>,
    ) -> Self {
        self.kv_refresher = Some(kv);
        self.manager_refresher = Some(manager);
        self
    }

    pub fn with_retry_orchestrator(mut self, retry: Arc<dyn RetryOrchestrator>) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_event_bus(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    pub fn build(self) -> Core {
        let core_id = CORE_IDS.fetch_add(1, Ordering::Relaxed) + 1;
        let config = Arc::new(self.config);
        let ctx = CoreContext::new(
            core_id,
            config.clone(),
            self.events,
            CoreStatistics::default(),
            Timer::default(),
            self.retry,
            self.transport_factory,
        );

        let tls = config.security.tls_enabled;
        let kv_refresher = self.kv_refresher.unwrap_or_else(|| {
            Arc::new(PollingRefresher::key_value(
                self.kv_loader.clone(),
                config.seed_nodes.clone(),
                tls,
            ))
        });
        let manager_refresher = self.manager_refresher.unwrap_or_else(|| {
            Arc::new(PollingRefresher::manager(
                self.manager_loader.clone(),
                config.seed_nodes.clone(),
                tls,
            ))
        });

        let provider = ConfigurationProvider::new(
            ctx.clone(),
            self.kv_loader,
            self.manager_loader,
            kv_refresher,
            manager_refresher,
        );

        let inner = Arc::new(CoreInner {
            ctx: ctx.clone(),
            current_config: RwLock::new(provider.config()),
            provider,
            nodes: RwLock::new(Vec::new()),
            locators: Locators::new(),
            reconfigure_in_progress: AtomicBool::new(false),
            more_configs_pending: AtomicBool::new(false),
            shutdown: AtomicBool::new(false),
        });

        // Retries re-enter dispatch through a weak handle, a request
        // resubmitted after the core is gone gets cancelled instead.
        let weak = Arc::downgrade(&inner);
        ctx.bind_dispatcher(Box::new(move |request| match weak.upgrade() {
            Some(core) => CoreInner::send(&core, request, false),
            None => request.cancel(CancellationReason::Shutdown),
        }));

        inner
            .provider
            .install_manifest_fetcher(Box::new(CoreManifestFetcher {
                core: Arc::downgrade(&inner),
            }));

        let mut stream = inner.provider.configs();
        let weak = Arc::downgrade(&inner);
        tokio::spawn(async move {
            // The watch stream replays the latest snapshot on subscribe.
            // When that replay is still the initial empty config it only
            // seeds the local copy, there is nothing to converge onto yet.
            let mut first = true;
            while let Some(config) = stream.next().await {
                let Some(core) = weak.upgrade() else { break };
                let seed_only = first && config.is_empty();
                first = false;
                *core.current_config.write() = config;
                if seed_only {
                    continue;
                }
                CoreInner::reconfigure(&core);
            }
            debug!("Config stream completed, reconfiguration loop ends.");
        });

        info!(core_id = core_id, "Core created and subscribed to configs.");
        Core { inner }
    }
}

/// The main entry point into the runtime core.
pub struct Core {
    inner: Arc<CoreInner>,
}

pub(crate) struct CoreInner {
    ctx: CoreContext,
    provider: ConfigurationProvider,
    /// The latest received snapshot, replaced wholesale on every update.
    current_config: RwLock<ClusterConfig>,
    /// The managed node set, snapshot-cloned for iteration.
    nodes: RwLock<Vec<Node>>,
    locators: Locators,
    reconfigure_in_progress: AtomicBool,
    /// Set when a config arrives mid reconfiguration, at most one pending
    /// re-run is remembered.
    more_configs_pending: AtomicBool,
    shutdown: AtomicBool,
}

impl Core {
    pub fn builder(
        config: CoreConfig,
        transport_factory: Arc<dyn TransportFactory>,
        kv_loader: Arc<dyn ConfigLoader>,
        manager_loader: Arc<dyn ConfigLoader>,
    ) -> CoreBuilder {
        CoreBuilder {
            config,
            transport_factory,
            kv_loader,
            manager_loader,
            kv_refresher: None,
            manager_refresher: None,
            retry: Arc::new(BestEffortRetry),
            events: EventBus::default(),
        }
    }

    /// Dispatches a request, registering it for timeout supervision.
    pub fn send(&self, request: Request) {
        self.send_with(request, true);
    }

    /// Dispatches a request, optionally skipping timeout registration
    /// (used by internal resubmits which are already supervised).
    pub fn send_with(&self, request: Request, register_for_timeout: bool) {
        CoreInner::send(&self.inner, request, register_for_timeout);
    }

    /// Opens a bucket: bootstraps its config from the seed nodes and
    /// registers it for refreshing.
    pub async fn open_bucket(&self, name: &str) -> Result<(), CoreError> {
        let start = Instant::now();
        self.inner.provider.open_bucket(name).await?;
        self.inner.ctx.events().publish(Event::BucketOpened {
            bucket: name.to_string(),
            elapsed: start.elapsed(),
        });
        Ok(())
    }

    pub async fn close_bucket(&self, name: &str) -> Result<(), CoreError> {
        let start = Instant::now();
        self.inner.provider.close_bucket(name).await?;
        self.inner.ctx.events().publish(Event::BucketClosed {
            bucket: name.to_string(),
            elapsed: start.elapsed(),
        });
        Ok(())
    }

    /// Shuts the core down: closes every open bucket, shuts down the
    /// provider and publishes [`Event::ShutdownCompleted`]. Idempotent,
    /// later calls are no-ops. Requests arriving afterwards are cancelled
    /// with [`CancellationReason::Shutdown`].
    pub async fn shutdown(&self) {
        CoreInner::shutdown(self.inner.clone()).await;
    }

    /// The currently applied cluster config snapshot.
    pub fn cluster_config(&self) -> ClusterConfig {
        self.inner.provider.config()
    }

    pub fn configuration_provider(&self) -> &ConfigurationProvider {
        &self.inner.provider
    }

    pub fn context(&self) -> &CoreContext {
        &self.inner.ctx
    }

    pub fn statistics(&self) -> CoreStatistics {
        self.inner.ctx.statistics().clone()
    }

    /// The identifiers of the currently managed nodes.
    pub fn managed_nodes(&self) -> Vec<NodeIdentifier> {
        self.inner
            .nodes
            .read()
            .iter()
            .map(|node| node.identifier().clone())
            .collect()
    }

    /// Whether the given managed node currently has the service enabled.
    pub fn service_enabled_at(
        &self,
        identifier: &NodeIdentifier,
        service: ServiceType,
    ) -> bool {
        self.inner
            .nodes
            .read()
            .iter()
            .filter(|node| node.identifier() == identifier)
            .any(|node| node.service_enabled(service))
    }
}

impl Drop for Core {
    fn drop(&mut self) {
        if !self.inner.shutdown.load(Ordering::SeqCst) {
            let inner = self.inner.clone();
            tokio::spawn(async move {
                CoreInner::shutdown(inner).await;
            });
        }
    }
}

impl CoreInner {
    fn send(this: &Arc<CoreInner>, request: Request, register_for_timeout: bool) {
        if this.shutdown.load(Ordering::SeqCst) {
            request.cancel(CancellationReason::Shutdown);
            return;
        }

        if register_for_timeout {
            this.ctx.timer().register(&request);
        }

        let nodes = this.nodes.read().clone();
        let config = this.current_config.read().clone();
        this.locators
            .get(request.service_type())
            .dispatch(request, &nodes, &config, &this.ctx);
    }

    /// Converges the managed topology onto the current config.
    ///
    /// Only one reconciliation runs at a time. A config arriving while one
    /// is in flight sets the pending flag and is picked up by exactly one
    /// replay once the running pass finishes.
    fn reconfigure(this: &Arc<CoreInner>) {
        if this
            .reconfigure_in_progress
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            let core = this.clone();
            tokio::spawn(async move {
                let start = Instant::now();
                let snapshot = core.current_config.read().clone();
                match core.run_reconfigure(&snapshot) {
                    Ok(()) => {
                        core.ctx
                            .statistics()
                            .num_reconfigurations
                            .fetch_add(1, Ordering::Relaxed);
                        core.ctx.events().publish(Event::ReconfigurationCompleted {
                            elapsed: start.elapsed(),
                        });
                    },
                    Err(error) => {
                        warn!(error = %error, "Reconfiguration failed.");
                        core.ctx
                            .events()
                            .publish(Event::ReconfigurationErrorDetected {
                                error: error.to_string(),
                            });
                    },
                }
                core.ctx
                    .statistics()
                    .num_managed_nodes
                    .store(core.nodes.read().len() as u64, Ordering::Relaxed);
                CoreInner::clear_reconfigure_in_progress(&core);
            });
        } else {
            this.more_configs_pending.store(true, Ordering::SeqCst);
            this.ctx.events().publish(Event::ReconfigurationIgnored);
        }
    }

    fn clear_reconfigure_in_progress(this: &Arc<CoreInner>) {
        this.reconfigure_in_progress.store(false, Ordering::SeqCst);
        if this
            .more_configs_pending
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            CoreInner::reconfigure(this);
        }
    }

    fn run_reconfigure(&self, config: &ClusterConfig) -> Result<(), CoreError> {
        if config.is_empty() {
            let drained: Vec<Node> = {
                let mut nodes = self.nodes.write();
                nodes.drain(..).collect()
            };
            for node in drained {
                debug!(node = %node.identifier(), "No buckets remain open, disconnecting node.");
                node.disconnect();
            }
            return Ok(());
        }

        let tls = self.ctx.config().security.tls_enabled;
        for (bucket, bucket_config) in config.bucket_configs() {
            for node_info in bucket_config.nodes() {
                let services = if tls {
                    node_info.ssl_services()
                } else {
                    node_info.services()
                };

                for service in ServiceType::ALL {
                    if services.contains_key(&service) {
                        continue;
                    }
                    let scope = bucket_scope(service, bucket);
                    if let Err(error) =
                        self.remove_service_from(node_info.identifier(), service, scope)
                    {
                        self.service_reconfiguration_failed(
                            node_info.identifier(),
                            service,
                            &error,
                        );
                    }
                }

                for (service, port) in services {
                    let scope = bucket_scope(*service, bucket);
                    if let Err(error) =
                        self.ensure_service_at(node_info.identifier(), *service, *port, scope)
                    {
                        self.service_reconfiguration_failed(
                            node_info.identifier(),
                            *service,
                            &error,
                        );
                    }
                }
            }
        }

        let snapshot: Vec<Node> = self.nodes.read().clone();
        for node in snapshot {
            self.maybe_remove_node(&node, config);
        }
        Ok(())
    }

    /// Per service failures are logged and swallowed, the reconcile keeps
    /// going for everything else.
    fn service_reconfiguration_failed(
        &self,
        identifier: &NodeIdentifier,
        service: ServiceType,
        error: &CoreError,
    ) {
        warn!(
            node = %identifier,
            service = %service,
            error = %error,
            "Failed to reconfigure service on node.",
        );
        self.ctx.events().publish(Event::ServiceReconfigurationFailed {
            node: identifier.clone(),
            service,
            error: error.to_string(),
        });
    }

    /// Makes sure the service is enabled at the given node, creating the
    /// node if it is not managed yet.
    fn ensure_service_at(
        &self,
        identifier: &NodeIdentifier,
        service: ServiceType,
        port: u16,
        bucket: Option<&str>,
    ) -> Result<(), CoreError> {
        let node = {
            let mut nodes = self.nodes.write();
            let existing = nodes
                .iter()
                .find(|node| node.identifier() == identifier)
                .cloned();
            match existing {
                Some(node) => node,
                None => {
                    let node = Node::new(self.ctx.clone(), identifier.clone());
                    nodes.push(node.clone());
                    node
                },
            }
        };

        node.add_service(service, port, bucket);
        Ok(())
    }

    fn remove_service_from(
        &self,
        identifier: &NodeIdentifier,
        service: ServiceType,
        bucket: Option<&str>,
    ) -> Result<(), CoreError> {
        let nodes = self.nodes.read().clone();
        for node in nodes
            .iter()
            .filter(|node| node.identifier() == identifier)
            .filter(|node| node.service_enabled(service))
        {
            node.remove_service(service, bucket);
        }
        Ok(())
    }

    /// Removes the node when no current bucket references it anymore, or
    /// when it has no services left enabled.
    fn maybe_remove_node(&self, node: &Node, config: &ClusterConfig) {
        let still_present = config
            .bucket_configs()
            .values()
            .flat_map(|bucket_config| bucket_config.nodes())
            .any(|node_info| node_info.identifier() == node.identifier());

        if !still_present || !node.has_services_enabled() {
            debug!(node = %node.identifier(), "Removing node from managed set.");
            {
                let mut nodes = self.nodes.write();
                nodes.retain(|managed| managed.identifier() != node.identifier());
            }
            node.disconnect();
        }
    }

    async fn shutdown(this: Arc<CoreInner>) {
        let start = Instant::now();
        if this
            .shutdown
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }

        let buckets: Vec<String> = this
            .provider
            .config()
            .bucket_configs()
            .keys()
            .cloned()
            .collect();
        for bucket in buckets {
            let opened = Instant::now();
            match this.provider.close_bucket(&bucket).await {
                Ok(()) => this.ctx.events().publish(Event::BucketClosed {
                    bucket: bucket.clone(),
                    elapsed: opened.elapsed(),
                }),
                Err(error) => debug!(
                    bucket = %bucket,
                    error = %error,
                    "Failed to close bucket during shutdown.",
                ),
            }
        }

        if let Err(error) = this.provider.shutdown().await {
            debug!(error = %error, "Provider shutdown reported an error.");
        }

        info!(core_id = this.ctx.core_id(), "Core shutdown completed.");
        this.ctx.events().publish(Event::ShutdownCompleted {
            elapsed: start.elapsed(),
        });
    }
}

fn bucket_scope(service: ServiceType, bucket: &str) -> Option<&str> {
    match service.scope() {
        ServiceScope::Bucket => Some(bucket),
        ServiceScope::Cluster => None,
    }
}

/// The manifest fetch seam the provider uses, backed by the core's own
/// dispatch path through a weak handle.
struct CoreManifestFetcher {
    core: std::sync::Weak<CoreInner>,
}

#[async_trait]
impl ManifestFetcher for CoreManifestFetcher {
    async fn fetch(&self, bucket: &str) -> Result<Response, CoreError> {
        let core = self.core.upgrade().ok_or(CoreError::AlreadyShutdown)?;
        let timeout = core.ctx.config().timeouts.key_value_timeout;
        let request = Request::collection_manifest(bucket, timeout);
        CoreInner::send(&core, request.clone(), true);
        request.response().await
    }
}
