//! Error types for the relay.

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

use crate::crypto::CryptoError;
use crate::resolver::ResolveError;

/// Result type alias for relay operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by the relay engine.
///
/// Everything except [`Error::LoopFault`] and [`Error::Config`] is contained
/// to the session it happened in.
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed handshake, unsupported address type or command.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Hostname lookup failed or timed out.
    #[error("failed to resolve {host}: {source}")]
    Resolution {
        host: String,
        #[source]
        source: ResolveError,
    },

    /// Remote refused or was unreachable.
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// Remote connect did not complete in time.
    #[error("connect to {0} timed out")]
    ConnectTimeout(SocketAddr),

    /// Socket error on an established connection.
    #[error("network error: {0}")]
    Io(#[from] io::Error),

    /// Cipher rejected the data.
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// The OS polling call failed; the loop cannot continue.
    #[error("event loop fault: {0}")]
    LoopFault(#[source] io::Error),

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Create a new protocol error
    pub fn protocol(msg: impl Into<String>) -> Self {
        Error::Protocol(msg.into())
    }

    /// Create a new configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Whether the error ends only the session it was raised in.
    pub fn is_session_fatal(&self) -> bool {
        !matches!(self, Error::LoopFault(_) | Error::Config(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_context() {
        let err = Error::Resolution {
            host: "example.com".into(),
            source: ResolveError::Timeout,
        };
        assert_eq!(err.to_string(), "failed to resolve example.com: lookup timed out");

        let err = Error::protocol("unsupported address type 9");
        assert_eq!(err.to_string(), "protocol error: unsupported address type 9");
    }

    #[test]
    fn only_loop_and_config_errors_escape_sessions() {
        assert!(Error::protocol("bad").is_session_fatal());
        assert!(Error::Crypto(CryptoError::Authentication).is_session_fatal());
        assert!(!Error::LoopFault(io::Error::other("epoll")).is_session_fatal());
        assert!(!Error::config("bad").is_session_fatal());
    }
}
