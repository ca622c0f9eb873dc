use std::fmt::{self, Debug};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use shoal_config::ServiceType;
use tokio::sync::oneshot;

use crate::error::CoreError;

static REQUEST_IDS: AtomicU64 = AtomicU64::new(0);

/// Why a request was cancelled before it could complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancellationReason {
    /// The core was shut down before or while the request was in flight.
    Shutdown,
    /// The per operation timeout elapsed.
    Timeout,
    /// The retry orchestrator gave up on the request.
    NoMoreRetries,
}

/// The coarse status a completed response carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseStatus {
    Success,
    /// The server did not recognise the operation.
    Unknown,
    TemporaryFailure,
    ServerError,
}

/// A completed response as handed back by the transport layer.
#[derive(Debug, Clone)]
pub struct Response {
    status: ResponseStatus,
    payload: Bytes,
}

impl Response {
    pub fn new(status: ResponseStatus, payload: impl Into<Bytes>) -> Self {
        Self {
            status,
            payload: payload.into(),
        }
    }

    pub fn success(payload: impl Into<Bytes>) -> Self {
        Self::new(ResponseStatus::Success, payload)
    }

    #[inline]
    pub fn status(&self) -> ResponseStatus {
        self.status
    }

    #[inline]
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }
}

/// What a request asks the remote side to do.
///
/// The core does not understand operation payloads, encoding them is the
/// transport collaborator's job. The kind only distinguishes the requests
/// the core itself originates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    /// A caller submitted operation with an opaque payload.
    Operation,
    /// A collection manifest fetch issued by the configuration provider.
    CollectionManifest,
}

/// One in-flight operation travelling through the dispatch machinery.
///
/// Requests are cheap to clone and safe to complete from any thread, the
/// first completion (success, failure or cancellation) wins and the rest
/// are dropped.
#[derive(Clone)]
pub struct Request {
    inner: Arc<RequestInner>,
}

struct RequestInner {
    id: u64,
    service_type: ServiceType,
    kind: RequestKind,
    bucket: Option<String>,
    key: Option<Bytes>,
    payload: Bytes,
    replica: Option<usize>,
    use_fast_forward: AtomicBool,
    timeout: Duration,
    created_at: Instant,
    retry_attempts: AtomicU32,
    state: Mutex<CompletionState>,
}

struct CompletionState {
    /// `Some(success)` once the request completed.
    outcome: Option<bool>,
    cancellation: Option<CancellationReason>,
    tx: Option<oneshot::Sender<Result<Response, CoreError>>>,
    rx: Option<oneshot::Receiver<Result<Response, CoreError>>>,
    listeners: Vec<Box<dyn FnOnce(bool) + Send>>,
}

impl Request {
    fn build(
        service_type: ServiceType,
        kind: RequestKind,
        bucket: Option<String>,
        key: Option<Bytes>,
        payload: Bytes,
        replica: Option<usize>,
        timeout: Duration,
    ) -> Self {
        let (tx, rx) = oneshot::channel();
        Self {
            inner: Arc::new(RequestInner {
                id: REQUEST_IDS.fetch_add(1, Ordering::Relaxed) + 1,
                service_type,
                kind,
                bucket,
                key,
                payload,
                replica,
                use_fast_forward: AtomicBool::new(false),
                timeout,
                created_at: Instant::now(),
                retry_attempts: AtomicU32::new(0),
                state: Mutex::new(CompletionState {
                    outcome: None,
                    cancellation: None,
                    tx: Some(tx),
                    rx: Some(rx),
                    listeners: Vec::new(),
                }),
            }),
        }
    }

    /// A key-value operation addressed at the master of the key's partition.
    pub fn key_value(
        bucket: impl Into<String>,
        key: impl Into<Bytes>,
        payload: impl Into<Bytes>,
        timeout: Duration,
    ) -> Self {
        Self::build(
            ServiceType::KeyValue,
            RequestKind::Operation,
            Some(bucket.into()),
            Some(key.into()),
            payload.into(),
            None,
            timeout,
        )
    }

    /// A key-value read addressed at the n-th replica of the key's partition.
    pub fn key_value_replica(
        bucket: impl Into<String>,
        key: impl Into<Bytes>,
        payload: impl Into<Bytes>,
        replica: usize,
        timeout: Duration,
    ) -> Self {
        Self::build(
            ServiceType::KeyValue,
            RequestKind::Operation,
            Some(bucket.into()),
            Some(key.into()),
            payload.into(),
            Some(replica),
            timeout,
        )
    }

    /// An operation for one of the cluster scoped services.
    pub fn operation(
        service_type: ServiceType,
        payload: impl Into<Bytes>,
        timeout: Duration,
    ) -> Self {
        Self::build(
            service_type,
            RequestKind::Operation,
            None,
            None,
            payload.into(),
            None,
            timeout,
        )
    }

    /// The collection manifest fetch the configuration provider issues to
    /// populate its collection map.
    pub fn collection_manifest(bucket: impl Into<String>, timeout: Duration) -> Self {
        Self::build(
            ServiceType::KeyValue,
            RequestKind::CollectionManifest,
            Some(bucket.into()),
            None,
            Bytes::new(),
            None,
            timeout,
        )
    }

    #[inline]
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    #[inline]
    pub fn service_type(&self) -> ServiceType {
        self.inner.service_type
    }

    #[inline]
    pub fn kind(&self) -> RequestKind {
        self.inner.kind
    }

    #[inline]
    pub fn bucket(&self) -> Option<&str> {
        self.inner.bucket.as_deref()
    }

    #[inline]
    pub fn key(&self) -> Option<&Bytes> {
        self.inner.key.as_ref()
    }

    #[inline]
    pub fn payload(&self) -> &Bytes {
        &self.inner.payload
    }

    #[inline]
    pub fn replica(&self) -> Option<usize> {
        self.inner.replica
    }

    #[inline]
    pub fn timeout(&self) -> Duration {
        self.inner.timeout
    }

    /// Opt the request into the fast-forward partition map, used during
    /// rebalance to target the partition's future home.
    pub fn set_fast_forward(&self, enabled: bool) {
        self.inner.use_fast_forward.store(enabled, Ordering::Relaxed);
    }

    pub fn use_fast_forward(&self) -> bool {
        self.inner.use_fast_forward.load(Ordering::Relaxed)
    }

    pub(crate) fn next_retry_attempt(&self) -> u32 {
        self.inner.retry_attempts.fetch_add(1, Ordering::Relaxed)
    }

    /// True once the request has been completed, failed or cancelled.
    pub fn completed(&self) -> bool {
        self.inner.state.lock().outcome.is_some()
    }

    /// The cancellation reason, if the request was cancelled.
    pub fn cancellation_reason(&self) -> Option<CancellationReason> {
        self.inner.state.lock().cancellation
    }

    /// Completes the request successfully with the given response.
    pub fn succeed(&self, response: Response) {
        self.complete(Ok(response), None);
    }

    /// Fails the request with the given error.
    pub fn fail(&self, error: CoreError) {
        self.complete(Err(error), None);
    }

    /// Cancels the request.
    ///
    /// Cancellation is best effort, a request already on the wire is not
    /// recalled and its response, should it still arrive, is discarded.
    pub fn cancel(&self, reason: CancellationReason) {
        let error = match reason {
            CancellationReason::Timeout => CoreError::Timeout(self.inner.timeout),
            reason => CoreError::RequestCancelled(reason),
        };
        self.complete(Err(error), Some(reason));
    }

    /// Registers a hook invoked with the success flag when the request
    /// completes. A hook registered after completion fires immediately.
    pub(crate) fn on_completion(&self, listener: impl FnOnce(bool) + Send + 'static) {
        let mut state = self.inner.state.lock();
        match state.outcome {
            Some(success) => {
                drop(state);
                listener(success);
            },
            None => state.listeners.push(Box::new(listener)),
        }
    }

    /// Awaits the final outcome of the request.
    ///
    /// The outcome can only be consumed once, even across clones.
    pub async fn response(&self) -> Result<Response, CoreError> {
        let rx = self.inner.state.lock().rx.take();
        match rx {
            Some(rx) => match rx.await {
                Ok(outcome) => outcome,
                Err(_) => Err(CoreError::Dispatch(
                    "The request was dropped before completing.".to_string(),
                )),
            },
            None => Err(CoreError::Dispatch(
                "The response of this request was already consumed.".to_string(),
            )),
        }
    }

    fn complete(
        &self,
        outcome: Result<Response, CoreError>,
        cancellation: Option<CancellationReason>,
    ) {
        let (tx, listeners, success) = {
            let mut state = self.inner.state.lock();
            if state.outcome.is_some() {
                return;
            }
            let success = outcome.is_ok();
            state.outcome = Some(success);
            state.cancellation = cancellation;
            (state.tx.take(), std::mem::take(&mut state.listeners), success)
        };

        if let Some(tx) = tx {
            let _ = tx.send(outcome);
        }
        for listener in listeners {
            listener(success);
        }
    }
}

impl Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("id", &self.inner.id)
            .field("service_type", &self.inner.service_type)
            .field("kind", &self.inner.kind)
            .field("bucket", &self.inner.bucket)
            .field("timeout", &self.inner.timeout)
            .finish()
    }
}

/// Registers per operation timeouts against the runtime clock.
#[derive(Debug, Clone, Default)]
pub struct Timer;

impl Timer {
    /// Arms the request's timeout. On expiry the request is cancelled with
    /// [`CancellationReason::Timeout`], a request which completed first is
    /// left untouched.
    pub fn register(&self, request: &Request) {
        let request = request.clone();
        tokio::spawn(async move {
            tokio::time::sleep(request.timeout()).await;
            if !request.completed() {
                request.cancel(CancellationReason::Timeout);
            }
        });
    }
}
