//! Error types for kvlink operations

use thiserror::Error;

/// Result type alias for kvlink operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error taxonomy for the client, executor and pool.
///
/// Server-reported errors are deliberately absent here: a decoded `-ERR ...`
/// reply is a valid protocol outcome and travels through the `Ok` path as a
/// [`crate::resp::Response::Error`] value.
#[derive(Error, Debug)]
pub enum Error {
    /// Opening the transport to the server failed
    #[error("Connect error: {message}")]
    Connect { message: String },

    /// The server rejected the configured auth token
    #[error("Authentication failed: {message}")]
    Auth { message: String },

    /// The server rejected the configured database index
    #[error("Database select failed: {message}")]
    Db { message: String },

    /// No response arrived within the read timeout
    #[error("Timed out waiting for a response")]
    Timeout,

    /// The byte stream violated the response framing rules
    #[error("Protocol error: {message}")]
    Protocol { message: String },

    /// No session exists (never connected, or explicitly disconnected)
    #[error("Not connected")]
    NotConnected,

    /// Another caller holds the session lock; fail fast, never wait
    #[error("Connection is busy")]
    LockBusy,

    /// Transport failure that survived the one permitted reconnect attempt
    #[error("Disconnected: {message}")]
    Disconnected { message: String },

    /// I/O operation errors
    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },
}

impl Error {
    /// Create a connect error
    pub fn connect<S: Into<String>>(msg: S) -> Self {
        Error::Connect { message: msg.into() }
    }

    /// Create an authentication error
    pub fn auth<S: Into<String>>(msg: S) -> Self {
        Error::Auth { message: msg.into() }
    }

    /// Create a database-select error
    pub fn db<S: Into<String>>(msg: S) -> Self {
        Error::Db { message: msg.into() }
    }

    /// Create a protocol error
    pub fn protocol<S: Into<String>>(msg: S) -> Self {
        Error::Protocol { message: msg.into() }
    }

    /// Create a disconnected error
    pub fn disconnected<S: Into<String>>(msg: S) -> Self {
        Error::Disconnected { message: msg.into() }
    }

    /// True for failures of the transport itself, which the executor answers
    /// with its single reconnect-and-retry cycle. Protocol violations and
    /// lock contention are not transport failures and are never retried.
    pub fn is_connection_failure(&self) -> bool {
        matches!(
            self,
            Error::Io { .. } | Error::Timeout | Error::Disconnected { .. }
        )
    }

    /// Stable process exit code for this error.
    ///
    /// 0 success / 1 server-reported error (mapped by the console, not here) /
    /// 2 not-connected or needs-reconnect / 3 lock not acquired.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::NotConnected
            | Error::Disconnected { .. }
            | Error::Connect { .. }
            | Error::Auth { .. }
            | Error::Db { .. } => 2,
            Error::LockBusy => 3,
            _ => 1,
        }
    }
}
