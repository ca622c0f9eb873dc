use std::fmt::{self, Display};
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use shoal_config::ServiceType;

use crate::config::SecurityConfig;
use crate::error::CoreError;
use crate::request::Request;

/// The remote location one endpoint connects to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointAddress {
    pub host: String,
    pub port: u16,
    pub service: ServiceType,
    /// Set for bucket scoped services.
    pub bucket: Option<String>,
}

impl Display for EndpointAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}/{}", self.host, self.port, self.service)
    }
}

/// One live connection as provided by the transport collaborator.
///
/// The core never performs I/O itself, it gates and routes requests onto
/// transports. Writes are fire-and-forget enqueues, a transport that fails
/// to flush surfaces that by failing the affected requests and turning
/// inactive.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Enqueues a request on the connection.
    fn write(&self, request: Request);

    /// Whether the underlying connection is still alive.
    fn is_active(&self) -> bool;

    /// Whether the connection accepts further writes right now
    /// (backpressure gate).
    fn is_writable(&self) -> bool;

    fn local_addr(&self) -> Option<SocketAddr>;

    /// Closes the connection and releases its resources.
    async fn disconnect(&self) -> Result<(), CoreError>;
}

/// Dials new transports for endpoints.
#[async_trait]
pub trait TransportFactory: Send + Sync + 'static {
    /// Establishes a connection to the given address.
    ///
    /// TLS setup happens in here when the security config asks for it, a
    /// failure to construct the TLS machinery is reported as
    /// [`CoreError::Security`] and fails the attempt.
    async fn connect(
        &self,
        address: &EndpointAddress,
        security: &SecurityConfig,
    ) -> Result<Arc<dyn Transport>, CoreError>;
}
