use std::io;
use std::sync::Arc;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

/// A violation of the RESP grammar on the inbound byte stream.
///
/// Any of these is fatal to the connection that produced it: the transport
/// is closed and every queued response promise fails with the error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ParseErrorKind {
    /// The leading byte of a frame is not one of `+ - : $ *`.
    #[error("invalid leading token 0x{0:02x}")]
    InvalidToken(u8),

    /// A bulk string (or array) header declared a negative size other than
    /// the `-1` null marker.
    #[error("invalid bulk string size {0}")]
    InvalidBulkStringSize(i64),

    /// A bulk string's payload was not followed by CRLF at the declared
    /// length.
    #[error("bulk string payload does not match its declared size")]
    BulkStringSizeMismatch,

    /// Non-numeric payload where an ASCII decimal integer was required.
    #[error("invalid integer format")]
    InvalidIntegerFormat,
}

/// Everything this crate can fail with.
///
/// The enum is `Clone` so that a single transport failure can be handed to
/// every response promise queued on the connection; io errors are shared
/// behind an `Arc` for that reason.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// The server sent bytes that do not parse as RESP2. Fatal to the
    /// connection.
    #[error("protocol error: {0}")]
    Parse(#[from] ParseErrorKind),

    /// An error reply (`-ERR ...`) from the server. The connection stays
    /// healthy; only the command that provoked it fails.
    #[error("server error: {0}")]
    Redis(String),

    /// The reply arrived but could not be converted into the type the
    /// caller requested.
    #[error("cannot convert reply {value} into {target}")]
    Conversion {
        target: &'static str,
        value: String,
    },

    /// A send was issued after the connection began shutting down.
    #[error("connection closed")]
    ConnectionClosed,

    /// A subscription was requested while not permitted on this
    /// connection, or a conflicting subscription change is in flight.
    #[error("subscriptions are not permitted on this connection")]
    PubSubRaceCondition,

    /// A command other than the (P)SUBSCRIBE/(P)UNSUBSCRIBE/PING/QUIT set
    /// was issued while the connection is in subscriber mode.
    #[error("'{0}' is not allowed while the connection is in subscriber mode")]
    IllegalPubSubCommand(String),

    /// The pool is closing or closed.
    #[error("connection pool is closed")]
    PoolClosed,

    /// A pool close was requested while connections are still leased out.
    /// Reported through the close future; the pool keeps closing.
    #[error("connection pool still has leased connections")]
    PoolHasActiveConnections,

    /// A lease waiter's deadline expired before a connection was free.
    #[error("timed out waiting for a pooled connection")]
    TimedOutWaitingForConnection,

    /// The pool has no server addresses and its buffer of waiting
    /// requests is full.
    #[error("no connection targets are configured")]
    NoAvailableConnectionTargets,

    /// A configuration value could not be interpreted.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// An error surfaced verbatim from the transport. Fatal to the owning
    /// connection.
    #[error(transparent)]
    Io(Arc<io::Error>),
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(Arc::new(e))
    }
}
