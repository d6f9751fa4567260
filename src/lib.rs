//! Async client for the nsqd TCP protocol.
//!
//! A [`Client`] publishes (`PUB`, `MPUB`, `DPUB`) and subscribes through a
//! [`ConnectionPool`] of persistent connections, one per nsqd endpoint.
//! Each subscription binds to one pooled connection and runs a loop that
//! answers heartbeats and settles every message exactly once: `FIN` when
//! the handler succeeds, `REQ` when it fails.
//!
//! ```no_run
//! use iridium_nsq::{Client, ClientConfig, HandlerError, Message, parse_endpoints};
//!
//! # async fn run() -> Result<(), iridium_nsq::NsqError> {
//! let endpoints = parse_endpoints(["127.0.0.1:4150"])?;
//! let client = Client::connect(endpoints, ClientConfig::default()).await?;
//!
//! client.publish("events", "hello").await;
//!
//! let sub = client
//!     .topic("events")
//!     .channel("archive")
//!     .subscribe(|m: &Message| -> Result<(), HandlerError> {
//!         println!("{}", String::from_utf8_lossy(&m.body));
//!         Ok(())
//!     })
//!     .await;
//! # drop(sub);
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod codec;
pub mod config;
pub mod connection;
pub mod error;
pub mod frame;
pub mod pool;
pub mod subscription;

pub use client::{Channel, Client, ClientEvent, Handler, HandlerError, Resolution, Topic};
pub use codec::NsqCodec;
pub use config::{ClientConfig, Endpoint, parse_endpoints};
pub use connection::{Connection, ConnectionState};
pub use error::NsqError;
pub use frame::{Command, Frame, Message, MessageId};
pub use pool::ConnectionPool;
pub use subscription::{CancelHandle, Subscription};
