use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::codec::DEFAULT_MAX_FRAME_BYTES;
use crate::error::NsqError;

/// nsqd's default `--msg-timeout` based requeue delay.
pub const DEFAULT_REQUEUE_DELAY: Duration = Duration::from_secs(90);
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_RECONNECT_BACKOFF: Duration = Duration::from_secs(1);
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(30);
pub const DEFAULT_QUEUE_DEPTH: usize = 32;

/// Network address of one nsqd instance.
///
/// The identity key used by the pool is `"host:port"` (IPv6 hosts are
/// bracketed).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    host: String,
    port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Identity key, `"host:port"`.
    pub fn key(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for Endpoint {
    type Err = NsqError;

    /// Parse `"host:port"` or `"[v6]:port"`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .trim()
            .rsplit_once(':')
            .ok_or_else(|| NsqError::Configuration(format!("missing port in {:?}", s)))?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(NsqError::Configuration(format!("missing host in {:?}", s)));
        }
        let port = port
            .parse::<u16>()
            .map_err(|e| NsqError::Configuration(format!("invalid port in {:?}: {}", s, e)))?;
        Ok(Endpoint::new(host, port))
    }
}

/// Options shared by the pool, its connections and the client.
///
/// Builder-style setters return the updated value:
///
/// ```
/// use std::time::Duration;
/// use iridium_nsq::ClientConfig;
///
/// let config = ClientConfig::new().requeue_delay(Duration::from_secs(10));
/// assert_eq!(config.requeue_delay, Duration::from_secs(10));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// Delay passed with `REQ` when a handler fails
    pub requeue_delay: Duration,
    /// Timeout for each TCP connect attempt
    pub connect_timeout: Duration,
    /// First reconnect delay; doubled after each failed attempt
    pub reconnect_backoff: Duration,
    /// Cap for the reconnect delay
    pub max_backoff: Duration,
    /// Largest frame accepted from, or body sent to, nsqd
    pub max_frame_bytes: usize,
    /// Capacity of the per-connection command and frame queues
    pub queue_depth: usize,
}

impl ClientConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn requeue_delay(mut self, delay: Duration) -> Self {
        self.requeue_delay = delay;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn reconnect_backoff(mut self, backoff: Duration) -> Self {
        self.reconnect_backoff = backoff;
        self
    }

    pub fn max_backoff(mut self, backoff: Duration) -> Self {
        self.max_backoff = backoff;
        self
    }

    pub fn max_frame_bytes(mut self, bytes: usize) -> Self {
        self.max_frame_bytes = bytes;
        self
    }

    pub fn queue_depth(mut self, depth: usize) -> Self {
        self.queue_depth = depth.max(1);
        self
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            requeue_delay: DEFAULT_REQUEUE_DELAY,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            reconnect_backoff: DEFAULT_RECONNECT_BACKOFF,
            max_backoff: DEFAULT_MAX_BACKOFF,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            queue_depth: DEFAULT_QUEUE_DEPTH,
        }
    }
}

/// Parse a list of `"host:port"` strings, failing on the first bad entry.
pub fn parse_endpoints<I, S>(addrs: I) -> Result<Vec<Endpoint>, NsqError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    addrs.into_iter().map(|a| a.as_ref().parse()).collect()
}
