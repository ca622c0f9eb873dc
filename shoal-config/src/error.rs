use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to decode bucket config JSON: {0}")]
    /// The raw document was not valid JSON or was missing required fields.
    InvalidJson(#[from] serde_json::Error),

    #[error("Partition host `{0}` could not be resolved against the node list.")]
    /// A `host:port` entry of the partition server list matched no node
    /// hosting the key-value service.
    UnresolvedPartitionHost(String),

    #[error(
        "The config declared {declared} partition hosts but only {resolved} \
        could be resolved against the node list."
    )]
    /// The declared and resolved partition host counts differ, which would
    /// make every partition lookup point at the wrong node.
    PartitionHostMismatch { declared: usize, resolved: usize },

    #[error("Failed to decode collections manifest: {0}")]
    /// The collections manifest JSON could not be decoded.
    InvalidManifest(String),
}
