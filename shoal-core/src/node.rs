use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use shoal_config::{NodeIdentifier, ServiceScope, ServiceType};

use crate::context::CoreContext;
use crate::events::Event;
use crate::request::Request;
use crate::retry::RetryReason;
use crate::service::Service;

/// Services are keyed by type plus, for bucket scoped types, the bucket
/// they belong to.
type ServiceKey = (ServiceType, Option<String>);

/// Everything the runtime manages on one remote node.
///
/// A node owns the services enabled on it and routes requests to the
/// matching service. Nodes are created by the reconciler and removed once
/// the topology no longer references them.
#[derive(Clone)]
pub struct Node {
    inner: Arc<NodeInner>,
}

struct NodeInner {
    ctx: CoreContext,
    identifier: NodeIdentifier,
    services: RwLock<HashMap<ServiceKey, Service>>,
}

impl Node {
    pub(crate) fn new(ctx: CoreContext, identifier: NodeIdentifier) -> Self {
        Self {
            inner: Arc::new(NodeInner {
                ctx,
                identifier,
                services: RwLock::new(HashMap::new()),
            }),
        }
    }

    #[inline]
    pub fn identifier(&self) -> &NodeIdentifier {
        &self.inner.identifier
    }

    /// Ensures a service of the given type exists at the given port.
    ///
    /// Idempotent when the service already runs on the same port. On a
    /// port mismatch the old service is replaced: disconnected, dropped
    /// and recreated at the new port.
    pub fn add_service(&self, service_type: ServiceType, port: u16, bucket: Option<&str>) {
        let key = service_key(service_type, bucket);
        let mut services = self.inner.services.write();

        if let Some(existing) = services.get(&key) {
            if existing.port() == port {
                trace!(
                    node = %self.inner.identifier,
                    service = %service_type,
                    "Service already enabled, ignoring add.",
                );
                return;
            }

            info!(
                node = %self.inner.identifier,
                service = %service_type,
                old_port = existing.port(),
                new_port = port,
                "Service port moved, replacing service.",
            );
            self.inner.ctx.events().publish(Event::ServiceReplaced {
                node: self.inner.identifier.clone(),
                service: service_type,
                old_port: existing.port(),
                new_port: port,
            });
            existing.disconnect();
        }

        let service = Service::new(
            self.inner.ctx.clone(),
            service_type,
            self.inner.identifier.host(),
            port,
            key.1.clone(),
        );
        services.insert(key, service);
    }

    /// Disconnects and removes the service, returns whether one existed.
    pub fn remove_service(&self, service_type: ServiceType, bucket: Option<&str>) -> bool {
        let key = service_key(service_type, bucket);
        let removed = self.inner.services.write().remove(&key);
        match removed {
            Some(service) => {
                debug!(
                    node = %self.inner.identifier,
                    service = %service_type,
                    "Removing service from node.",
                );
                service.disconnect();
                true
            },
            None => false,
        }
    }

    /// True if at least one service of the given type is enabled,
    /// regardless of bucket scope.
    pub fn service_enabled(&self, service_type: ServiceType) -> bool {
        self.inner
            .services
            .read()
            .keys()
            .any(|(enabled, _)| *enabled == service_type)
    }

    pub fn has_services_enabled(&self) -> bool {
        !self.inner.services.read().is_empty()
    }

    /// Routes the request to the matching service on this node.
    pub fn send(&self, request: Request) {
        let key = service_key(request.service_type(), request.bucket());
        let service = self.inner.services.read().get(&key).cloned();
        match service {
            Some(service) => service.send(request),
            None => {
                trace!(
                    node = %self.inner.identifier,
                    service = %request.service_type(),
                    "No matching service on node, handing request to retry.",
                );
                self.inner
                    .ctx
                    .maybe_retry(request, RetryReason::ServiceNotAvailable);
            },
        }
    }

    /// Shuts down every service on this node.
    pub fn disconnect(&self) {
        let drained: Vec<Service> = {
            let mut services = self.inner.services.write();
            services.drain().map(|(_, service)| service).collect()
        };
        for service in drained {
            service.disconnect();
        }
    }
}

fn service_key(service_type: ServiceType, bucket: Option<&str>) -> ServiceKey {
    let bucket = match service_type.scope() {
        ServiceScope::Bucket => bucket.map(str::to_string),
        ServiceScope::Cluster => None,
    };
    (service_type, bucket)
}
