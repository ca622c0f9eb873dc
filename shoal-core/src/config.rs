use std::time::Duration;

use shoal_config::ServiceType;

/// One node the runtime may contact for its very first config.
#[derive(Debug, Clone)]
pub struct SeedNode {
    /// Hostname or address of the seed.
    pub address: String,
    /// Overrides the default (TLS dependent) key-value port.
    pub kv_port: Option<u16>,
    /// Overrides the default (TLS dependent) cluster manager port.
    pub manager_port: Option<u16>,
}

impl SeedNode {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            kv_port: None,
            manager_port: None,
        }
    }

    pub fn with_kv_port(mut self, port: u16) -> Self {
        self.kv_port = Some(port);
        self
    }

    pub fn with_manager_port(mut self, port: u16) -> Self {
        self.manager_port = Some(port);
        self
    }
}

/// Transport security settings.
///
/// The actual TLS machinery lives in the transport implementation, the core
/// only switches port maps and bootstrap defaults on this flag.
#[derive(Debug, Clone, Default)]
pub struct SecurityConfig {
    pub tls_enabled: bool,
}

/// The per concern timeouts of the runtime.
#[derive(Debug, Clone)]
pub struct TimeoutConfig {
    /// Hard cap for a single transport connect attempt.
    pub connect_timeout: Duration,
    /// Default per operation timeout for key-value requests.
    pub key_value_timeout: Duration,
    /// Default per operation timeout for management requests.
    pub management_timeout: Duration,
    /// Default per operation timeout for query/search/analytics/views.
    pub query_timeout: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            key_value_timeout: Duration::from_millis(2500),
            management_timeout: Duration::from_secs(75),
            query_timeout: Duration::from_secs(75),
        }
    }
}

/// Sizing of the endpoint pool a service keeps per node.
#[derive(Debug, Clone)]
pub struct EndpointPoolConfig {
    /// Endpoints kept warm even when idle.
    pub min_endpoints: usize,
    /// Hard upper bound on pooled endpoints.
    pub max_endpoints: usize,
    /// Pooled endpoints above the minimum are disconnected after this much
    /// inactivity. `None` disables shrinking.
    pub idle_time: Option<Duration>,
    /// Pipelined endpoints carry many concurrent requests on one
    /// connection and never count as busy.
    pub pipelined: bool,
}

impl EndpointPoolConfig {
    /// The key-value service multiplexes everything over one pipelined
    /// connection per node.
    pub fn key_value() -> Self {
        Self {
            min_endpoints: 1,
            max_endpoints: 1,
            idle_time: None,
            pipelined: true,
        }
    }

    pub fn manager() -> Self {
        Self {
            min_endpoints: 0,
            max_endpoints: 1,
            idle_time: Some(Duration::from_secs(60)),
            pipelined: false,
        }
    }

    /// The pool shape shared by the HTTP style request/response services.
    pub fn http(idle_time: Duration) -> Self {
        Self {
            min_endpoints: 0,
            max_endpoints: 12,
            idle_time: Some(idle_time),
            pipelined: false,
        }
    }
}

/// Failure-rate gating applied per endpoint.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    pub enabled: bool,
    /// Completions required inside the rolling window before the failure
    /// ratio is evaluated at all.
    pub volume_threshold: u64,
    /// Failure percentage at which the breaker opens.
    pub error_threshold_percentage: u32,
    /// How long an open breaker rejects before letting a canary through.
    pub sleep_window: Duration,
    /// Length of the rolling completion window.
    pub rolling_window: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            volume_threshold: 20,
            error_threshold_percentage: 50,
            sleep_window: Duration::from_secs(5),
            rolling_window: Duration::from_secs(60),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }
}

/// The static configuration of one [`crate::Core`] instance.
#[derive(Debug, Clone)]
pub struct CoreConfig {
    pub seed_nodes: Vec<SeedNode>,
    pub security: SecurityConfig,
    pub timeouts: TimeoutConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub key_value_pool: EndpointPoolConfig,
    pub manager_pool: EndpointPoolConfig,
    pub query_pool: EndpointPoolConfig,
    pub search_pool: EndpointPoolConfig,
    pub analytics_pool: EndpointPoolConfig,
    pub views_pool: EndpointPoolConfig,
}

impl CoreConfig {
    pub fn new(seed_nodes: impl IntoIterator<Item = SeedNode>) -> Self {
        Self {
            seed_nodes: seed_nodes.into_iter().collect(),
            security: SecurityConfig::default(),
            timeouts: TimeoutConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            key_value_pool: EndpointPoolConfig::key_value(),
            manager_pool: EndpointPoolConfig::manager(),
            query_pool: EndpointPoolConfig::http(Duration::from_secs(60)),
            search_pool: EndpointPoolConfig::http(Duration::from_secs(60)),
            analytics_pool: EndpointPoolConfig::http(Duration::from_secs(300)),
            views_pool: EndpointPoolConfig::http(Duration::from_secs(60)),
        }
    }

    pub fn with_tls(mut self, enabled: bool) -> Self {
        self.security.tls_enabled = enabled;
        self
    }

    pub fn with_timeouts(mut self, timeouts: TimeoutConfig) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn with_circuit_breaker(mut self, breaker: CircuitBreakerConfig) -> Self {
        self.circuit_breaker = breaker;
        self
    }

    pub fn with_pool(mut self, service: ServiceType, pool: EndpointPoolConfig) -> Self {
        match service {
            ServiceType::KeyValue => self.key_value_pool = pool,
            ServiceType::Manager => self.manager_pool = pool,
            ServiceType::Query => self.query_pool = pool,
            ServiceType::Search => self.search_pool = pool,
            ServiceType::Analytics => self.analytics_pool = pool,
            ServiceType::Views => self.views_pool = pool,
        }
        self
    }

    pub fn pool_for(&self, service: ServiceType) -> &EndpointPoolConfig {
        match service {
            ServiceType::KeyValue => &self.key_value_pool,
            ServiceType::Manager => &self.manager_pool,
            ServiceType::Query => &self.query_pool,
            ServiceType::Search => &self.search_pool,
            ServiceType::Analytics => &self.analytics_pool,
            ServiceType::Views => &self.views_pool,
        }
    }
}
