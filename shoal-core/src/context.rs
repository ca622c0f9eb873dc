use std::sync::{Arc, OnceLock};

use crate::config::CoreConfig;
use crate::events::EventBus;
use crate::request::{CancellationReason, Request, Timer};
use crate::retry::{RetryOrchestrator, RetryReason};
use crate::statistics::CoreStatistics;
use crate::transport::TransportFactory;

type Dispatcher = Box<dyn Fn(Request) + Send + Sync>;

/// The shared context threaded through every component of one core.
///
/// Cheap to clone. The dispatch back-reference is installed by the core
/// after construction and intentionally weak, so the context never keeps
/// a shut down core alive.
#[derive(Clone)]
pub struct CoreContext {
    inner: Arc<ContextInner>,
}

struct ContextInner {
    core_id: u64,
    config: Arc<CoreConfig>,
    events: EventBus,
    statistics: CoreStatistics,
    timer: Timer,
    retry: Arc<dyn RetryOrchestrator>,
    transport_factory: Arc<dyn TransportFactory>,
    dispatcher: OnceLock<Dispatcher>,
}

impl CoreContext {
    pub(crate) fn new(
        core_id: u64,
        config: Arc<CoreConfig>,
        events: EventBus,
        statistics: CoreStatistics,
        timer: Timer,
        retry: Arc<dyn RetryOrchestrator>,
        transport_factory: Arc<dyn TransportFactory>,
    ) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                core_id,
                config,
                events,
                statistics,
                timer,
                retry,
                transport_factory,
                dispatcher: OnceLock::new(),
            }),
        }
    }

    /// The process-wide unique id of the owning core.
    #[inline]
    pub fn core_id(&self) -> u64 {
        self.inner.core_id
    }

    #[inline]
    pub fn config(&self) -> &CoreConfig {
        &self.inner.config
    }

    #[inline]
    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    #[inline]
    pub fn statistics(&self) -> &CoreStatistics {
        &self.inner.statistics
    }

    #[inline]
    pub fn timer(&self) -> &Timer {
        &self.inner.timer
    }

    pub(crate) fn transport_factory(&self) -> &Arc<dyn TransportFactory> {
        &self.inner.transport_factory
    }

    /// Hands the request to the retry orchestrator because it could not be
    /// dispatched right now.
    pub(crate) fn maybe_retry(&self, request: Request, reason: RetryReason) {
        self.inner.retry.maybe_retry(self, request, reason);
    }

    pub(crate) fn bind_dispatcher(&self, dispatcher: Dispatcher) {
        let _ = self.inner.dispatcher.set(dispatcher);
    }

    /// Re-enters the dispatch path, used by retries. Requests re-dispatched
    /// after the owning core is gone are cancelled.
    pub(crate) fn redispatch(&self, request: Request) {
        match self.inner.dispatcher.get() {
            Some(dispatch) => dispatch(request),
            None => request.cancel(CancellationReason::Shutdown),
        }
    }
}
