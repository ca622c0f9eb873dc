use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use shoal_config::ServiceType;
use tokio::time::{interval, MissedTickBehavior};

use crate::config::EndpointPoolConfig;
use crate::context::CoreContext;
use crate::endpoint::Endpoint;
use crate::request::Request;
use crate::retry::RetryReason;
use crate::transport::EndpointAddress;

/// A bounded pool of endpoints for one service on one node.
///
/// The pool keeps `min_endpoints` warm, grows on demand up to
/// `max_endpoints` and, when an idle time is configured, shrinks back down
/// by disconnecting endpoints which have been quiet for too long.
#[derive(Clone)]
pub struct Service {
    inner: Arc<ServiceInner>,
}

struct ServiceInner {
    ctx: CoreContext,
    service_type: ServiceType,
    host: String,
    port: u16,
    bucket: Option<String>,
    pool: EndpointPoolConfig,
    endpoints: RwLock<Vec<Endpoint>>,
    disconnected: AtomicBool,
}

impl Service {
    pub(crate) fn new(
        ctx: CoreContext,
        service_type: ServiceType,
        host: impl Into<String>,
        port: u16,
        bucket: Option<String>,
    ) -> Self {
        let pool = ctx.config().pool_for(service_type).clone();
        let inner = Arc::new(ServiceInner {
            ctx,
            service_type,
            host: host.into(),
            port,
            bucket,
            pool,
            endpoints: RwLock::new(Vec::new()),
            disconnected: AtomicBool::new(false),
        });

        {
            let mut endpoints = inner.endpoints.write();
            for _ in 0..inner.pool.min_endpoints {
                let endpoint = create_endpoint(&inner);
                endpoint.connect();
                endpoints.push(endpoint);
            }
        }

        if let Some(idle_time) = inner.pool.idle_time {
            spawn_janitor(inner.clone(), idle_time);
        }

        Self { inner }
    }

    /// Picks a free endpoint for the request, growing the pool on demand.
    /// With nothing free and no room to grow the request goes to the retry
    /// orchestrator.
    pub fn send(&self, request: Request) {
        let inner = &self.inner;

        {
            let endpoints = inner.endpoints.read();
            if let Some(endpoint) = endpoints.iter().find(|endpoint| endpoint.free()) {
                endpoint.send(request);
                return;
            }
        }

        let grown = {
            let mut endpoints = inner.endpoints.write();
            if endpoints.len() < inner.pool.max_endpoints {
                let endpoint = create_endpoint(inner);
                endpoint.connect();
                endpoints.push(endpoint.clone());
                Some(endpoint)
            } else {
                None
            }
        };

        match grown {
            // The fresh endpoint is still connecting, its own write gate
            // hands the request to the retry machinery until it is up.
            Some(endpoint) => endpoint.send(request),
            None => inner.ctx.maybe_retry(request, RetryReason::NoFreeEndpoint),
        }
    }

    /// Disconnects every pooled endpoint and stops the janitor.
    pub fn disconnect(&self) {
        self.inner.disconnected.store(true, Ordering::SeqCst);
        let drained: Vec<Endpoint> = {
            let mut endpoints = self.inner.endpoints.write();
            endpoints.drain(..).collect()
        };
        for endpoint in drained {
            endpoint.disconnect();
        }
    }

    #[inline]
    pub fn service_type(&self) -> ServiceType {
        self.inner.service_type
    }

    #[inline]
    pub fn port(&self) -> u16 {
        self.inner.port
    }

    #[inline]
    pub fn bucket(&self) -> Option<&str> {
        self.inner.bucket.as_deref()
    }

    #[cfg(test)]
    pub(crate) fn endpoint_count(&self) -> usize {
        self.inner.endpoints.read().len()
    }
}

fn create_endpoint(inner: &Arc<ServiceInner>) -> Endpoint {
    let address = EndpointAddress {
        host: inner.host.clone(),
        port: inner.port,
        service: inner.service_type,
        bucket: inner.bucket.clone(),
    };
    Endpoint::new(inner.ctx.clone(), address, inner.pool.pipelined)
}

/// Periodically disconnects endpoints above the minimum which have been
/// idle past the configured threshold.
fn spawn_janitor(inner: Arc<ServiceInner>, idle_time: Duration) {
    tokio::spawn(async move {
        let period = (idle_time / 2).max(Duration::from_millis(50));
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;
            if inner.disconnected.load(Ordering::SeqCst) {
                return;
            }

            let idle: Vec<Endpoint> = {
                let mut endpoints = inner.endpoints.write();
                let mut removed = Vec::new();
                let mut index = 0;
                while endpoints.len() > inner.pool.min_endpoints
                    && index < endpoints.len()
                {
                    let endpoint = &endpoints[index];
                    if endpoint.free() && endpoint.idle_for() >= idle_time {
                        removed.push(endpoints.remove(index));
                    } else {
                        index += 1;
                    }
                }
                removed
            };

            for endpoint in idle {
                debug!(
                    endpoint = %endpoint.address(),
                    service = %inner.service_type,
                    "Disconnecting idle pooled endpoint.",
                );
                endpoint.disconnect();
            }
        }
    });
}
