use std::time::Duration;

use shoal_config::{NodeIdentifier, ServiceType};
use tokio::sync::broadcast;

use crate::transport::EndpointAddress;

/// Why a proposed bucket config was not applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigIgnoredReason {
    /// The raw document could not be parsed.
    ParseFailure,
    /// The revision was not newer than the currently applied one.
    OldOrSameRevision,
    /// The provider was already shut down when the config arrived.
    AlreadyShutdown,
}

/// Structured lifecycle events published on the [`EventBus`].
#[derive(Debug, Clone)]
pub enum Event {
    BucketOpened {
        bucket: String,
        elapsed: Duration,
    },
    BucketClosed {
        bucket: String,
        elapsed: Duration,
    },
    ShutdownCompleted {
        elapsed: Duration,
    },
    ReconfigurationCompleted {
        elapsed: Duration,
    },
    /// A config arrived while another reconfiguration was running, it will
    /// be picked up by the pending replay.
    ReconfigurationIgnored,
    ReconfigurationErrorDetected {
        error: String,
    },
    ServiceReconfigurationFailed {
        node: NodeIdentifier,
        service: ServiceType,
        error: String,
    },
    /// A node replaced a service because its port moved.
    ServiceReplaced {
        node: NodeIdentifier,
        service: ServiceType,
        old_port: u16,
        new_port: u16,
    },
    ConfigIgnored {
        reason: ConfigIgnoredReason,
    },
    ConfigUpdated {
        bucket: String,
        rev: u64,
    },
    CollectionMapDecodingFailed {
        bucket: String,
        error: String,
    },
    EndpointConnecting {
        address: EndpointAddress,
        attempt: u64,
    },
    EndpointConnected {
        address: EndpointAddress,
        elapsed: Duration,
    },
    EndpointConnectionFailed {
        address: EndpointAddress,
        attempt: u64,
        error: String,
    },
    /// A connect attempt was aborted because a disconnect was requested.
    EndpointConnectionAborted {
        address: EndpointAddress,
    },
    /// A connect attempt succeeded after a disconnect was requested, the
    /// fresh connection was thrown away.
    EndpointConnectionIgnored {
        address: EndpointAddress,
    },
    EndpointDisconnected {
        address: EndpointAddress,
    },
    EndpointDisconnectionFailed {
        address: EndpointAddress,
        error: String,
    },
}

const EVENT_BUS_CAPACITY: usize = 256;

/// A fire-and-forget broadcast bus for lifecycle events.
///
/// Publishing never blocks, events published while nobody listens are
/// dropped and slow subscribers lose the oldest events first.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl Default for EventBus {
    fn default() -> Self {
        let (tx, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        Self { tx }
    }
}

impl EventBus {
    pub fn publish(&self, event: Event) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}
