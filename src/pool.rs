use futures::future;
use rand::seq::IteratorRandom;
use std::collections::HashMap;
use tracing::{info, warn};

use crate::config::{ClientConfig, Endpoint};
use crate::connection::Connection;
use crate::error::NsqError;

/// The set of nsqd connections a `Client` publishes and subscribes through.
///
/// Connections are keyed by `Endpoint::key()` (`"host:port"`). Selection is
/// uniform at random with no affinity, so a caller that needs a stable
/// connection (the subscribe loop) must hold on to the one it got.
#[derive(Clone, Default)]
pub struct ConnectionPool {
    connections: HashMap<String, Connection>,
}

impl ConnectionPool {
    /// An empty pool; fill it with `add`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Connect to every endpoint concurrently and keep the ones that answer.
    ///
    /// Parameters
    /// - `endpoints`: nsqd addresses; duplicates collapse onto one entry.
    /// - `config`: connect timeout, backoff and queue settings for each
    ///   connection.
    ///
    /// Unreachable endpoints are logged and skipped. Fails with
    /// `NsqError::Configuration` when `endpoints` is empty or when none of
    /// them could be reached, so a returned pool is never empty.
    pub async fn connect<I>(endpoints: I, config: &ClientConfig) -> Result<Self, NsqError>
    where
        I: IntoIterator<Item = Endpoint>,
    {
        let endpoints: Vec<Endpoint> = endpoints.into_iter().collect();
        if endpoints.is_empty() {
            return Err(NsqError::Configuration("no nsqd endpoints configured".into()));
        }

        let attempts = future::join_all(
            endpoints
                .iter()
                .map(|endpoint| Connection::connect(endpoint.clone(), config)),
        )
        .await;

        let mut pool = Self::new();
        for (endpoint, attempt) in endpoints.iter().zip(attempts) {
            match attempt {
                Ok(conn) => {
                    pool.add(conn);
                }
                Err(e) => {
                    warn!(endpoint = %endpoint, error = %e, "skipping unreachable nsqd endpoint");
                }
            }
        }

        if pool.is_empty() {
            return Err(NsqError::Configuration(format!(
                "none of the {} configured nsqd endpoints could be reached",
                endpoints.len()
            )));
        }
        info!(connected = pool.len(), configured = endpoints.len(), "connection pool ready");
        Ok(pool)
    }

    /// Insert or replace the connection for its endpoint (last write wins).
    pub fn add(&mut self, connection: Connection) -> &mut Self {
        self.connections
            .insert(connection.endpoint().key(), connection);
        self
    }

    /// Pick a connection uniformly at random.
    pub fn select(&self) -> Result<Connection, NsqError> {
        self.connections
            .values()
            .choose(&mut rand::thread_rng())
            .cloned()
            .ok_or(NsqError::PoolExhausted)
    }

    /// Pick uniformly at random among connections with no subscription
    /// attached. `PoolExhausted` when every connection is taken.
    pub async fn select_free(&self) -> Result<Connection, NsqError> {
        let mut free = Vec::with_capacity(self.connections.len());
        for conn in self.connections.values() {
            if !conn.is_attached().await {
                free.push(conn);
            }
        }
        free.into_iter()
            .choose(&mut rand::thread_rng())
            .cloned()
            .ok_or(NsqError::PoolExhausted)
    }

    pub fn get(&self, key: &str) -> Option<&Connection> {
        self.connections.get(key)
    }

    pub fn endpoints(&self) -> impl Iterator<Item = &Endpoint> {
        self.connections.values().map(|c| c.endpoint())
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Ask every connection's background task to shut down.
    pub fn close(&self) {
        for conn in self.connections.values() {
            conn.close();
        }
    }
}
