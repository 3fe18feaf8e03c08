use serde::{Deserialize, Serialize};

use ferry_transport::{DEFAULT_MAX_MESSAGE_SIZE, MAX_MESSAGE_SIZE};

use crate::types::{DEFAULT_MIN_POW, DEFAULT_SYNC_ALLOWANCE, MESSAGE_QUEUE_LIMIT};

/// Static configuration of a [`Node`](crate::Node).
///
/// Everything here except `queue_capacity` and `workers` can later be
/// changed through the node's settings API.
///
/// ```rust
/// use ferry_protocol::NodeConfig;
///
/// let config = NodeConfig::default().min_pow(0.5).enable_confirmations(true);
/// assert_eq!(config.min_pow, 0.5);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Maximum accepted packet / envelope size in bytes.
    pub max_message_size: usize,
    /// PoW floor for admitted envelopes.
    pub min_pow: f64,
    /// Clock skew tolerated in seconds; also the grace window after a
    /// settings change.
    pub sync_allowance: u32,
    /// Capacity of each local delivery queue.
    pub queue_capacity: usize,
    /// Number of delivery workers; `None` uses the CPU count.
    pub workers: Option<usize>,
    /// Advertised in the handshake; received envelopes go to filters as
    /// direct messages.
    pub light_client: bool,
    /// Refuse peers that are light clients when we are one too.
    pub restrict_light_client_connections: bool,
    pub enable_confirmations: bool,
    /// Accept every topic. When false the node starts with an empty
    /// interest and widens it as filters are installed.
    pub full_node: bool,
    /// Advertise exact topic interest instead of a bloom filter.
    pub topic_interest_mode: bool,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            min_pow: DEFAULT_MIN_POW,
            sync_allowance: DEFAULT_SYNC_ALLOWANCE,
            queue_capacity: MESSAGE_QUEUE_LIMIT,
            workers: None,
            light_client: false,
            restrict_light_client_connections: false,
            enable_confirmations: false,
            full_node: true,
            topic_interest_mode: false,
        }
    }
}

impl NodeConfig {
    /// Set the packet ceiling (clamped to [`MAX_MESSAGE_SIZE`]).
    pub fn max_message_size(mut self, bytes: usize) -> Self {
        self.max_message_size = bytes.min(MAX_MESSAGE_SIZE);
        self
    }

    pub fn min_pow(mut self, pow: f64) -> Self {
        self.min_pow = pow;
        self
    }

    pub fn sync_allowance(mut self, seconds: u32) -> Self {
        self.sync_allowance = seconds;
        self
    }

    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity.max(1);
        self
    }

    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = Some(workers.max(1));
        self
    }

    pub fn light_client(mut self, enabled: bool) -> Self {
        self.light_client = enabled;
        self
    }

    pub fn restrict_light_client_connections(mut self, enabled: bool) -> Self {
        self.restrict_light_client_connections = enabled;
        self
    }

    pub fn enable_confirmations(mut self, enabled: bool) -> Self {
        self.enable_confirmations = enabled;
        self
    }

    pub fn full_node(mut self, enabled: bool) -> Self {
        self.full_node = enabled;
        self
    }

    pub fn topic_interest_mode(mut self, enabled: bool) -> Self {
        self.topic_interest_mode = enabled;
        self
    }

    pub(crate) fn worker_count(&self) -> usize {
        self.workers.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        })
    }
}

/// Default packets per second accepted from one IP.
pub const DEFAULT_LIMIT_PER_SEC_IP: u64 = 10;

/// Default packets per second accepted from one peer id.
pub const DEFAULT_LIMIT_PER_SEC_PEER_ID: u64 = 5;

/// Configuration of the per-peer packet rate limiter.
///
/// A limit of zero disables that dimension.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerRateLimiterConfig {
    pub limit_per_sec_ip: u64,
    pub limit_per_sec_peer_id: u64,
    pub whitelisted_ips: Vec<String>,
    /// Hex-encoded peer ids.
    pub whitelisted_peer_ids: Vec<String>,
}

impl Default for PeerRateLimiterConfig {
    fn default() -> Self {
        Self {
            limit_per_sec_ip: DEFAULT_LIMIT_PER_SEC_IP,
            limit_per_sec_peer_id: DEFAULT_LIMIT_PER_SEC_PEER_ID,
            whitelisted_ips: Vec::new(),
            whitelisted_peer_ids: Vec::new(),
        }
    }
}
