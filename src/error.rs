use std::io;
use thiserror::Error;

use crate::frame::MessageId;

/// Errors produced by the pool, the codec and the client.
#[derive(Error, Debug)]
pub enum NsqError {
    /// No usable nsqd endpoint (empty list, unparsable address, or none reachable)
    #[error("configuration error: {0}")]
    Configuration(String),
    /// No connection registered at selection time
    #[error("connection pool exhausted: no connection available")]
    PoolExhausted,
    /// A command could not be framed
    #[error("encode error: {0}")]
    Encode(String),
    /// Socket read/write failed or the connection task has gone away
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),
    /// The message handler failed; the message is requeued
    #[error("handler failed for message {message_id}: {reason}")]
    Callback {
        message_id: MessageId,
        reason: String,
    },
}

impl NsqError {
    pub(crate) fn closed() -> Self {
        NsqError::Transport(io::Error::new(
            io::ErrorKind::BrokenPipe,
            "connection task has shut down",
        ))
    }
}
