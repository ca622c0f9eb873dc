use std::fmt::{self, Display};

/// The scope a service operates at.
///
/// Bucket scoped services keep one service instance per `(node, bucket)`
/// pair, cluster scoped services keep one instance per node regardless of
/// how many buckets are open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceScope {
    Bucket,
    Cluster,
}

/// The protocol surface one connection of the runtime speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ServiceType {
    /// The binary key-value protocol, partition addressed.
    KeyValue,
    /// The cluster manager HTTP surface used for admin operations and
    /// config bootstrap.
    Manager,
    /// The query service.
    Query,
    /// The full text search service.
    Search,
    /// The analytics service.
    Analytics,
    /// The views service.
    Views,
}

impl ServiceType {
    /// Every service type the runtime knows about.
    pub const ALL: [ServiceType; 6] = [
        ServiceType::KeyValue,
        ServiceType::Manager,
        ServiceType::Query,
        ServiceType::Search,
        ServiceType::Analytics,
        ServiceType::Views,
    ];

    /// The scope service instances of this type live at.
    pub fn scope(&self) -> ServiceScope {
        match self {
            ServiceType::KeyValue => ServiceScope::Bucket,
            _ => ServiceScope::Cluster,
        }
    }

    /// The identifier used for this service on the config wire format.
    pub fn wire_name(&self) -> &'static str {
        match self {
            ServiceType::KeyValue => "kv",
            ServiceType::Manager => "mgmt",
            ServiceType::Query => "n1ql",
            ServiceType::Search => "fts",
            ServiceType::Analytics => "cbas",
            ServiceType::Views => "capi",
        }
    }

    /// Resolves a wire identifier to `(service, is_tls)`.
    ///
    /// Unknown identifiers return `None` and are skipped by the parser, the
    /// server is free to announce services this client has no use for.
    pub(crate) fn from_wire_name(name: &str) -> Option<(ServiceType, bool)> {
        let service = match name {
            "kv" | "kvSSL" => ServiceType::KeyValue,
            "mgmt" | "mgmtSSL" => ServiceType::Manager,
            "n1ql" | "n1qlSSL" => ServiceType::Query,
            "fts" | "ftsSSL" => ServiceType::Search,
            "cbas" | "cbasSSL" => ServiceType::Analytics,
            "capi" | "capiSSL" => ServiceType::Views,
            _ => return None,
        };
        Some((service, name.ends_with("SSL")))
    }
}

impl Display for ServiceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.wire_name())
    }
}
