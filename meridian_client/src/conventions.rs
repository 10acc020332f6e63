use std::time::Duration;

use serde::Deserialize;

/// Policy selecting which node serves read requests.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Deserialize)]
pub enum ReadBalanceBehavior {
    /// Every read goes to the preferred node.
    #[default]
    None,
    /// Reads are spread across healthy members, keyed by session id.
    RoundRobin,
    /// Reads go to whichever node the speed test measured fastest.
    FastestNode,
}

/// Client-side conventions governing one request executor.
///
/// A value object fixed at construction time; the server can override the
/// read-balance behavior at runtime through the client configuration
/// endpoint, everything else stays as configured here.
#[derive(Clone, Debug)]
pub struct Conventions {
    read_balance_behavior: ReadBalanceBehavior,
    disable_topology_updates: bool,
    aggressive_cache_window: Duration,
    request_timeout: Duration,
    topology_refresh_interval: Duration,
    traffic_idle_window: Duration,
    cache_max_weight: u64,
    use_compression: bool,
}

impl Default for Conventions {
    fn default() -> Self {
        Self {
            read_balance_behavior: ReadBalanceBehavior::default(),
            disable_topology_updates: false,
            aggressive_cache_window: Duration::from_secs(24 * 60 * 60),
            request_timeout: Duration::from_secs(30),
            topology_refresh_interval: Duration::from_secs(60),
            traffic_idle_window: Duration::from_secs(5 * 60),
            cache_max_weight: 128 * 1024 * 1024,
            use_compression: true,
        }
    }
}

// Mutators
impl Conventions {
    pub fn with_read_balance_behavior(mut self, behavior: ReadBalanceBehavior) -> Self {
        self.read_balance_behavior = behavior;
        self
    }

    /// Pins the executor to the seed URLs instead of discovering the cluster.
    pub fn with_disable_topology_updates(mut self, disable: bool) -> Self {
        self.disable_topology_updates = disable;
        self
    }

    pub fn with_aggressive_cache_window(mut self, window: Duration) -> Self {
        self.aggressive_cache_window = window;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_topology_refresh_interval(mut self, interval: Duration) -> Self {
        self.topology_refresh_interval = interval;
        self
    }

    pub fn with_cache_max_weight(mut self, bytes: u64) -> Self {
        self.cache_max_weight = bytes;
        self
    }

    pub fn with_compression(mut self, use_compression: bool) -> Self {
        self.use_compression = use_compression;
        self
    }
}

// Getters
impl Conventions {
    pub fn read_balance_behavior(&self) -> ReadBalanceBehavior {
        self.read_balance_behavior
    }

    pub fn disable_topology_updates(&self) -> bool {
        self.disable_topology_updates
    }

    /// How long an aggressively cached entry may be served without asking the
    /// server at all.
    pub fn aggressive_cache_window(&self) -> Duration {
        self.aggressive_cache_window
    }

    /// Budget for a single attempt against a single node. Every failover
    /// attempt gets a fresh budget.
    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    pub fn topology_refresh_interval(&self) -> Duration {
        self.topology_refresh_interval
    }

    /// The background refresh only runs when no request went through for this
    /// long; normal traffic already proves liveness.
    pub fn traffic_idle_window(&self) -> Duration {
        self.traffic_idle_window
    }

    pub fn cache_max_weight(&self) -> u64 {
        self.cache_max_weight
    }

    pub fn use_compression(&self) -> bool {
        self.use_compression
    }
}
