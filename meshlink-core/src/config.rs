//! Connection manager configuration.

use std::net::SocketAddr;
use std::time::Duration;

use crate::wire::DEFAULT_MAX_FRAME_LEN;

/// Default timeout for an outbound dial.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Pause after a non-fatal `accept()` error before accepting again.
pub const DEFAULT_ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(250);

/// Configuration for the connection coordinator.
#[derive(Debug, Clone)]
pub struct MeshConfig {
    /// Address the acceptor binds. Port 0 lets the OS pick one, which is then
    /// advertised through discovery. A specified IP is also used as the source
    /// address of outbound dials.
    pub bind_addr: SocketAddr,

    /// Timeout for establishing outbound connections.
    pub connect_timeout: Duration,

    /// Backoff between transient accept errors.
    pub accept_error_backoff: Duration,

    /// Largest frame payload accepted or sent.
    pub max_frame_len: usize,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 0)),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            accept_error_backoff: DEFAULT_ACCEPT_ERROR_BACKOFF,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }
}

impl MeshConfig {
    /// Create a new configuration with the specified bind address.
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            ..Default::default()
        }
    }

    /// Set the connection timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the accept error backoff.
    pub fn with_accept_error_backoff(mut self, backoff: Duration) -> Self {
        self.accept_error_backoff = backoff;
        self
    }

    /// Set the maximum frame length.
    pub fn with_max_frame_len(mut self, len: usize) -> Self {
        self.max_frame_len = len;
        self
    }

    /// Source IP for outbound dials, if the bind address pins one.
    pub fn dial_source_ip(&self) -> Option<std::net::IpAddr> {
        let ip = self.bind_addr.ip();
        (!ip.is_unspecified()).then_some(ip)
    }
}
