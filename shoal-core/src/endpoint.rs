use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tokio::sync::Notify;

use crate::breaker::CircuitBreaker;
use crate::context::CoreContext;
use crate::error::CoreError;
use crate::events::Event;
use crate::request::Request;
use crate::retry::RetryReason;
use crate::transport::{EndpointAddress, Transport};

const STATE_DISCONNECTED: u8 = 0;
const STATE_CONNECTING: u8 = 1;
const STATE_CONNECTED: u8 = 2;
const STATE_DISCONNECTING: u8 = 3;

const RECONNECT_BACKOFF_BASE: Duration = Duration::from_millis(32);
const RECONNECT_BACKOFF_CAP: Duration = Duration::from_millis(4096);

/// How often a connected endpoint checks its transport for liveness.
const TRANSPORT_WATCH_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

/// One transport connection to one `(host, port, service)`.
///
/// The endpoint owns the connect/reconnect state machine, the write gate
/// and the per connection circuit breaker. Endpoints are single use, once
/// disconnected they stay down and their owning service creates a fresh
/// one when needed.
#[derive(Clone)]
pub struct Endpoint {
    inner: Arc<EndpointInner>,
}

struct EndpointInner {
    ctx: CoreContext,
    address: EndpointAddress,
    pipelined: bool,
    state: AtomicU8,
    disconnect_requested: AtomicBool,
    abort: Notify,
    /// Only tracked when not pipelined, a pipelined endpoint is always free.
    outstanding: AtomicUsize,
    created_at: Instant,
    last_response_nanos: AtomicU64,
    counted_connected: AtomicBool,
    breaker: CircuitBreaker,
    transport: RwLock<Option<Arc<dyn Transport>>>,
}

impl Endpoint {
    pub(crate) fn new(ctx: CoreContext, address: EndpointAddress, pipelined: bool) -> Self {
        let breaker = CircuitBreaker::new(ctx.config().circuit_breaker.clone());
        Self {
            inner: Arc::new(EndpointInner {
                ctx,
                address,
                pipelined,
                state: AtomicU8::new(STATE_DISCONNECTED),
                disconnect_requested: AtomicBool::new(false),
                abort: Notify::new(),
                outstanding: AtomicUsize::new(0),
                created_at: Instant::now(),
                last_response_nanos: AtomicU64::new(0),
                counted_connected: AtomicBool::new(false),
                breaker,
                transport: RwLock::new(None),
            }),
        }
    }

    /// Starts connecting if the endpoint is disconnected, no-op otherwise.
    pub fn connect(&self) {
        if self
            .inner
            .state
            .compare_exchange(
                STATE_DISCONNECTED,
                STATE_CONNECTING,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
        {
            let endpoint = self.clone();
            tokio::spawn(endpoint.run_connect());
        }
    }

    /// The connect loop, retrying with exponential backoff until a
    /// connection is established or a disconnect is requested.
    async fn run_connect(self) {
        let inner = &self.inner;
        let connect_timeout = inner.ctx.config().timeouts.connect_timeout;
        let mut attempt: u64 = 0;

        loop {
            attempt += 1;
            if inner.disconnect_requested.load(Ordering::SeqCst) {
                inner.state.store(STATE_DISCONNECTED, Ordering::SeqCst);
                inner.ctx.events().publish(Event::EndpointConnectionAborted {
                    address: inner.address.clone(),
                });
                return;
            }

            inner.ctx.events().publish(Event::EndpointConnecting {
                address: inner.address.clone(),
                attempt,
            });

            let started = Instant::now();
            let security = inner.ctx.config().security.clone();
            let connect = inner.ctx.transport_factory().connect(&inner.address, &security);

            let result = tokio::select! {
                result = tokio::time::timeout(connect_timeout, connect) => {
                    result.unwrap_or_else(|_| {
                        Err(CoreError::Connection(format!(
                            "Connect attempt timed out after {connect_timeout:?}.",
                        )))
                    })
                },
                _ = inner.abort.notified() => {
                    inner.state.store(STATE_DISCONNECTED, Ordering::SeqCst);
                    inner.ctx.events().publish(Event::EndpointConnectionAborted {
                        address: inner.address.clone(),
                    });
                    return;
                },
            };

            match result {
                Ok(transport) => {
                    if inner.disconnect_requested.load(Ordering::SeqCst) {
                        inner.ctx.events().publish(Event::EndpointConnectionIgnored {
                            address: inner.address.clone(),
                        });
                        let _ = transport.disconnect().await;
                        inner.state.store(STATE_DISCONNECTED, Ordering::SeqCst);
                        return;
                    }

                    *inner.transport.write() = Some(transport);
                    inner.breaker.reset();
                    inner.state.store(STATE_CONNECTED, Ordering::SeqCst);
                    if inner
                        .counted_connected
                        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                        .is_ok()
                    {
                        inner
                            .ctx
                            .statistics()
                            .num_connected_endpoints
                            .fetch_add(1, Ordering::Relaxed);
                    }

                    debug!(
                        endpoint = %inner.address,
                        attempt = attempt,
                        "Endpoint connected.",
                    );
                    inner.ctx.events().publish(Event::EndpointConnected {
                        address: inner.address.clone(),
                        elapsed: started.elapsed(),
                    });

                    if self.supervise_transport().await {
                        // The transport died underneath us, re-enter the
                        // connect loop with fresh backoff.
                        attempt = 0;
                        continue;
                    }
                    return;
                },
                Err(error) => {
                    debug!(
                        endpoint = %inner.address,
                        attempt = attempt,
                        error = %error,
                        "Endpoint connect attempt failed.",
                    );
                    inner.ctx.events().publish(Event::EndpointConnectionFailed {
                        address: inner.address.clone(),
                        attempt,
                        error: error.to_string(),
                    });

                    // The abort wakes the sleep early, the disconnect flag
                    // is checked again at the top of the loop either way.
                    tokio::select! {
                        _ = tokio::time::sleep(reconnect_backoff(attempt)) => {},
                        _ = inner.abort.notified() => {},
                    }
                },
            }
        }
    }

    /// Watches the established transport. Returns `true` when it died and
    /// the endpoint should reconnect, `false` on a requested disconnect.
    async fn supervise_transport(&self) -> bool {
        let inner = &self.inner;
        loop {
            tokio::select! {
                _ = tokio::time::sleep(TRANSPORT_WATCH_INTERVAL) => {},
                _ = inner.abort.notified() => return false,
            }
            if inner.disconnect_requested.load(Ordering::SeqCst) {
                return false;
            }

            let dead = {
                let transport = inner.transport.read();
                transport.as_ref().map(|t| !t.is_active()).unwrap_or(true)
            };
            if dead {
                warn!(
                    endpoint = %inner.address,
                    "Transport became inactive, reconnecting.",
                );
                inner.transport.write().take();
                if inner
                    .counted_connected
                    .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
                {
                    inner
                        .ctx
                        .statistics()
                        .num_connected_endpoints
                        .fetch_sub(1, Ordering::Relaxed);
                }
                inner.state.store(STATE_CONNECTING, Ordering::SeqCst);
                return true;
            }
        }
    }

    /// Requests a disconnect. Idempotent, aborts an in-flight connect and
    /// closes the transport if one is established.
    pub fn disconnect(&self) {
        if self
            .inner
            .disconnect_requested
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }

        self.inner.state.store(STATE_DISCONNECTING, Ordering::SeqCst);
        self.inner.abort.notify_waiters();

        let inner = self.inner.clone();
        tokio::spawn(async move {
            let transport = inner.transport.write().take();
            if let Some(transport) = transport {
                match transport.disconnect().await {
                    Ok(()) => {
                        inner.ctx.events().publish(Event::EndpointDisconnected {
                            address: inner.address.clone(),
                        });
                    },
                    Err(error) => {
                        inner.ctx.events().publish(Event::EndpointDisconnectionFailed {
                            address: inner.address.clone(),
                            error: error.to_string(),
                        });
                    },
                }
            }

            if inner
                .counted_connected
                .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                inner
                    .ctx
                    .statistics()
                    .num_connected_endpoints
                    .fetch_sub(1, Ordering::Relaxed);
            }
            inner.state.store(STATE_DISCONNECTED, Ordering::SeqCst);
        });
    }

    /// Sends a request over this endpoint, or hands it to the retry
    /// orchestrator when the endpoint cannot take it right now.
    pub fn send(&self, request: Request) {
        let inner = &self.inner;

        let transport = if self.can_write() {
            inner.transport.read().clone()
        } else {
            None
        };
        let Some(transport) = transport else {
            inner.ctx.maybe_retry(request, RetryReason::EndpointNotWritable);
            return;
        };

        if !inner.pipelined {
            inner.outstanding.fetch_add(1, Ordering::Relaxed);
        }
        if inner.ctx.config().circuit_breaker.enabled {
            inner.breaker.track();
            let shared = self.inner.clone();
            request.on_completion(move |success| {
                if success {
                    shared.breaker.mark_success();
                } else {
                    shared.breaker.mark_failure();
                }
            });
        }

        transport.write(request);
    }

    /// True iff the endpoint can take another request: pipelined endpoints
    /// always can, pooled ones only while nothing is outstanding.
    pub fn free(&self) -> bool {
        self.inner.pipelined || self.inner.outstanding.load(Ordering::Relaxed) == 0
    }

    /// Marks the response stream of one request as fully completed.
    ///
    /// Called from the outside because with streaming responses the actual
    /// completion can happen long after the response future resolved.
    pub fn mark_request_completion(&self) {
        if !self.inner.pipelined {
            let _ = self
                .inner
                .outstanding
                .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(1));
        }
        self.inner
            .last_response_nanos
            .store(self.inner.created_at.elapsed().as_nanos() as u64, Ordering::Relaxed);
    }

    /// Nanoseconds (relative to endpoint creation) of the last completed
    /// response, `0` if none completed yet.
    pub fn last_response_received(&self) -> u64 {
        self.inner.last_response_nanos.load(Ordering::Relaxed)
    }

    /// How long the endpoint has been without a completed response.
    pub fn idle_for(&self) -> Duration {
        let now = self.inner.created_at.elapsed().as_nanos() as u64;
        Duration::from_nanos(now.saturating_sub(self.last_response_received()))
    }

    /// Whether a write would currently reach the remote side.
    pub fn can_write(&self) -> bool {
        if self.state() != EndpointState::Connected {
            return false;
        }
        let usable = {
            let transport = self.inner.transport.read();
            transport
                .as_ref()
                .map(|t| t.is_active() && t.is_writable())
                .unwrap_or(false)
        };
        usable && self.inner.breaker.allows_request()
    }

    pub fn state(&self) -> EndpointState {
        match self.inner.state.load(Ordering::SeqCst) {
            STATE_CONNECTING => EndpointState::Connecting,
            STATE_CONNECTED => EndpointState::Connected,
            STATE_DISCONNECTING => EndpointState::Disconnecting,
            _ => EndpointState::Disconnected,
        }
    }

    pub fn address(&self) -> &EndpointAddress {
        &self.inner.address
    }

    #[cfg(test)]
    pub(crate) fn breaker(&self) -> &CircuitBreaker {
        &self.inner.breaker
    }
}

fn reconnect_backoff(attempt: u64) -> Duration {
    let exponent = attempt.saturating_sub(1).min(7) as u32;
    let backoff = RECONNECT_BACKOFF_BASE * 2u32.pow(exponent);
    backoff.min(RECONNECT_BACKOFF_CAP)
}
