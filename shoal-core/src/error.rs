use std::time::Duration;

use thiserror::Error;

use crate::request::{CancellationReason, ResponseStatus};

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("Configuration error: {0}")]
    /// Bootstrap exhausted every seed node or a config level invariant broke.
    Config(String),

    #[error("Failed to parse bucket config: {0}")]
    /// The raw config document could not be turned into a typed config.
    InvalidConfig(#[from] shoal_config::ConfigError),

    #[error("The system is already shut down.")]
    /// The caller raced a terminal shutdown.
    AlreadyShutdown,

    #[error("Connection error: {0}")]
    /// The transport layer failed, absorbed by the endpoint reconnect loop
    /// unless a disconnect was requested.
    Connection(String),

    #[error("Could not set up the TLS machinery: {0}")]
    /// TLS handler construction failed, fatal to the connect attempt.
    Security(String),

    #[error("No eligible node or endpoint for dispatch: {0}")]
    /// Nothing can take the request right now, it went to the retry
    /// orchestrator instead.
    Dispatch(String),

    #[error("The request exceeded its timeout of {0:?}.")]
    Timeout(Duration),

    #[error("Service reconfiguration failed: {0}")]
    Service(String),

    #[error("The server does not support the collections API.")]
    CollectionsNotAvailable,

    #[error("The server returned an unexpected status: {0:?}")]
    UnexpectedStatus(ResponseStatus),

    #[error("The request was cancelled: {0:?}")]
    RequestCancelled(CancellationReason),
}
