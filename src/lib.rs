//! Redis client core: a RESP2 codec, a pipelined FIFO command channel, a
//! pub/sub multiplexer and a connection pool over tokio.
//!
//! The building blocks compose bottom-up:
//!
//! - [`resp`]: encode [`RespValue`]s and incrementally decode frames out
//!   of a byte buffer, tolerating partial reads.
//! - [`Connection`]: one socket, one driver task. `send` pipelines
//!   commands in FIFO order; `subscribe`/`psubscribe` switch the
//!   connection into subscriber mode.
//! - [`ConnectionPool`]: lease/return with deadlines, backoff-driven
//!   refill, round-robin server rotation, and at most one pub/sub
//!   connection per pool.
//!
//! ```no_run
//! use redwire::{cmd, Connection, ConnectionConfig};
//!
//! # async fn example() -> redwire::Result<()> {
//! let config = ConnectionConfig::from_redis_url("redis://127.0.0.1:6379")?;
//! let connection = Connection::connect(config).await?;
//! let pong: String = connection.send(cmd("PING")).await?;
//! assert_eq!(pong, "PONG");
//! # Ok(())
//! # }
//! ```

mod channel;
mod command;
mod config;
mod connection;
mod error;
pub mod metrics;
mod pool;
mod pubsub;
pub mod resp;

pub use command::{Command, FromResp, ToArg, cmd};
pub use config::{
    ClosureCallback, ConnectionConfig, FactoryConfig, MaxConnectionsBehavior,
    MINIMUM_RETRY_TOLERANCE, PoolConfig, RetryStrategy, ServerAddress,
};
pub use connection::{Connection, ConnectionState};
pub use error::{Error, ParseErrorKind, Result};
pub use pool::{ConnectionPool, PoolState};
pub use pubsub::{
    MessageReceiver, PubSubMessage, PubSubStream, SubscribeHandler, SubscriptionKind,
    UnsubscribeHandler, UnsubscribeSource,
};
pub use resp::RespValue;
