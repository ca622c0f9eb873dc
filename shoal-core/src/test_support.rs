//! Shared fakes for the crate's unit tests.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::config::{CoreConfig, SecurityConfig};
use crate::context::CoreContext;
use crate::error::CoreError;
use crate::events::EventBus;
use crate::request::{Request, Timer};
use crate::retry::{RetryOrchestrator, RetryReason};
use crate::statistics::CoreStatistics;
use crate::transport::{EndpointAddress, Transport, TransportFactory};

#[derive(Default)]
pub(crate) struct RecordingTransport {
    written: Mutex<Vec<Request>>,
    inactive: AtomicBool,
    unwritable: AtomicBool,
}

impl RecordingTransport {
    pub(crate) fn written(&self) -> Vec<Request> {
        self.written.lock().clone()
    }

    #[allow(dead_code)]
    pub(crate) fn set_active(&self, active: bool) {
        self.inactive.store(!active, Ordering::SeqCst);
    }

    #[allow(dead_code)]
    pub(crate) fn set_writable(&self, writable: bool) {
        self.unwritable.store(!writable, Ordering::SeqCst);
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    fn write(&self, request: Request) {
        self.written.lock().push(request);
    }

    fn is_active(&self) -> bool {
        !self.inactive.load(Ordering::SeqCst)
    }

    fn is_writable(&self) -> bool {
        !self.unwritable.load(Ordering::SeqCst)
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }

    async fn disconnect(&self) -> Result<(), CoreError> {
        self.inactive.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
pub(crate) struct RecordingFactory {
    dialed: Mutex<Vec<EndpointAddress>>,
    transports: Mutex<Vec<Arc<RecordingTransport>>>,
    fail_connects: AtomicBool,
}

impl RecordingFactory {
    pub(crate) fn dialed(&self) -> Vec<EndpointAddress> {
        self.dialed.lock().clone()
    }

    pub(crate) fn transports(&self) -> Vec<Arc<RecordingTransport>> {
        self.transports.lock().clone()
    }

    pub(crate) fn fail_connects(&self, fail: bool) {
        self.fail_connects.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl TransportFactory for RecordingFactory {
    async fn connect(
        &self,
        address: &EndpointAddress,
        _security: &SecurityConfig,
    ) -> Result<Arc<dyn Transport>, CoreError> {
        self.dialed.lock().push(address.clone());
        if self.fail_connects.load(Ordering::SeqCst) {
            return Err(CoreError::Connection("connection refused".to_string()));
        }

        let transport = Arc::new(RecordingTransport::default());
        self.transports.lock().push(transport.clone());
        Ok(transport)
    }
}

/// Records the hand-off instead of resubmitting, so tests can assert on
/// the exact dispatch failures without background churn.
#[derive(Default)]
pub(crate) struct CapturingRetry {
    handed: Mutex<Vec<(u64, RetryReason)>>,
}

impl CapturingRetry {
    pub(crate) fn handed(&self) -> Vec<(u64, RetryReason)> {
        self.handed.lock().clone()
    }
}

impl RetryOrchestrator for CapturingRetry {
    fn maybe_retry(&self, _ctx: &CoreContext, request: Request, reason: RetryReason) {
        self.handed.lock().push((request.id(), reason));
    }
}

pub(crate) fn test_context(
    factory: Arc<dyn TransportFactory>,
    retry: Arc<dyn RetryOrchestrator>,
) -> CoreContext {
    test_context_with_config(CoreConfig::new([]), factory, retry)
}

pub(crate) fn test_context_with_config(
    config: CoreConfig,
    factory: Arc<dyn TransportFactory>,
    retry: Arc<dyn RetryOrchestrator>,
) -> CoreContext {
    CoreContext::new(
        0,
        Arc::new(config),
        EventBus::default(),
        CoreStatistics::default(),
        Timer::default(),
        retry,
        factory,
    )
}

pub(crate) async fn wait_until(
    timeout: Duration,
    mut predicate: impl FnMut() -> bool,
) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if predicate() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    predicate()
}
