use std::net::SocketAddr;
use std::time::Duration;

/// Rendezvous server knobs.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// How long a `connect_request` waits for the target's `accept_connection`.
    pub accept_timeout: Duration,
    /// How long a negotiating session waits for the relay's `relay_ready`.
    pub relay_ready_timeout: Duration,
    /// Peers not heard from for this long are forgotten. `None` keeps them forever.
    pub peer_ttl: Option<Duration>,
    /// How often expiry is checked.
    pub gc_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            accept_timeout: Duration::from_secs(30),
            relay_ready_timeout: Duration::from_secs(10),
            peer_ttl: Some(Duration::from_secs(60)),
            gc_interval: Duration::from_secs(1),
        }
    }
}

/// Peer agent knobs.
#[derive(Debug, Clone)]
pub struct PeerConfig {
    /// Local bind address. Defaults to the unspecified address of the server's family.
    pub local_addr: Option<SocketAddr>,
    pub keepalive_interval: Duration,
    /// Per attempt wait for `register_response`.
    pub request_timeout: Duration,
    pub register_retries: usize,
    /// Overall wait for `relay_info` after `connect_request`. Kept above the
    /// server's accept + relay ready timeouts so its error arrives first.
    pub connect_timeout: Duration,
    /// Relay slots with no traffic for this long are closed.
    pub relay_idle_timeout: Duration,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            local_addr: None,
            keepalive_interval: Duration::from_secs(10),
            request_timeout: Duration::from_secs(10),
            register_retries: 3,
            connect_timeout: Duration::from_secs(40),
            relay_idle_timeout: Duration::from_secs(300),
        }
    }
}
