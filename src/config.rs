//! Configuration for the ESB client

use crate::codec::DEFAULT_MAX_FRAME;

use std::time::Duration;

/// Configuration for connecting to an ESB server
#[derive(Debug, Clone)]
pub struct EsbConfig {
    /// Server address (e.g., "localhost:8900")
    pub addr: String,

    /// Login name used when a send needs an implicit login
    pub name: Option<String>,

    /// Whether to automatically reconnect on disconnect
    pub auto_reconnect: bool,

    /// Initial delay before reconnecting
    pub reconnect_delay: Duration,

    /// Maximum delay between reconnection attempts
    pub max_reconnect_delay: Duration,

    /// Bound on login, subscribe and default RPC waits
    pub rpc_timeout: Duration,

    /// Number of outbound frames that may queue ahead of the writer
    pub outbound_buffer: usize,

    /// Size of the read buffer handed to the stream
    pub read_buffer_size: usize,

    /// Longest inbound frame accepted before it is dropped as a protocol error
    pub max_frame_size: usize,

    /// Capacity of the client event broadcast channel
    pub event_capacity: usize,
}

impl EsbConfig {
    /// Create a new configuration for the given server address
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            name: None,
            auto_reconnect: true,
            reconnect_delay: Duration::from_secs(1),
            max_reconnect_delay: Duration::from_secs(30),
            rpc_timeout: Duration::from_secs(10),
            outbound_buffer: 100,
            read_buffer_size: 65536,
            max_frame_size: DEFAULT_MAX_FRAME,
            event_capacity: 64,
        }
    }

    /// Build a configuration from `ESB_ADDR` and `ESB_NAME`
    pub fn from_env() -> Option<Self> {
        let addr = std::env::var("ESB_ADDR").ok()?;
        let mut config = Self::new(addr);
        config.name = std::env::var("ESB_NAME").ok().filter(|n| !n.is_empty());
        Some(config)
    }

    /// Set the default login name
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Disable automatic reconnection
    pub fn no_reconnect(mut self) -> Self {
        self.auto_reconnect = false;
        self
    }

    /// Set the reconnection delay range
    pub fn reconnect_delay(mut self, initial: Duration, max: Duration) -> Self {
        self.reconnect_delay = initial;
        self.max_reconnect_delay = max;
        self
    }

    /// Set the RPC timeout
    pub fn rpc_timeout(mut self, timeout: Duration) -> Self {
        self.rpc_timeout = timeout;
        self
    }

    /// Set the outbound queue depth
    pub fn outbound_buffer(mut self, frames: usize) -> Self {
        self.outbound_buffer = frames.max(1);
        self
    }

    /// Set the inbound frame size bound
    pub fn max_frame_size(mut self, bytes: usize) -> Self {
        self.max_frame_size = bytes.max(1);
        self
    }

    /// Delay before reconnect attempt `attempt` (zero based), without jitter
    pub(crate) fn backoff(&self, attempt: u32) -> Duration {
        std::cmp::min(
            self.reconnect_delay
                .saturating_mul(2u32.saturating_pow(attempt.min(16))),
            self.max_reconnect_delay,
        )
    }
}
