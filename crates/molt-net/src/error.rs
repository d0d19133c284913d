//! Error types for molt-net.
//!
//! Every failure the transport can produce is a [`NetError`]. Failures that are
//! caught locally (inside the accept loop, a handler task, or a broadcast) are
//! wrapped in a [`NetFailure`] and handed to the server's [`ErrorHook`].

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::address::NetAddress;

/// Errors that can occur in transport operations.
#[derive(Debug, Error)]
pub enum NetError {
    /// Dialing or accepting a connection failed.
    #[error("connection failed: {0}")]
    Connection(String),

    /// IO error on an established stream.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// A dial, read or write did not complete in time.
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// A length prefix or outgoing payload exceeds the maximum message size.
    #[error("message of {len} bytes exceeds the maximum message size")]
    Oversize {
        /// The offending length.
        len: usize,
    },

    /// The stream ended before a complete frame arrived.
    #[error("truncated message: expected {expected} bytes, received {received}")]
    Truncated {
        /// Bytes the frame announced.
        expected: usize,
        /// Bytes actually delivered before end of stream.
        received: usize,
    },

    /// A payload has the wrong fixed shape.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// No handler is registered for the message tag.
    #[error("no handler registered for tag {0:#04x}")]
    UnknownTag(u8),

    /// A value could not be marshalled.
    #[error("encode error: {0}")]
    Encode(String),

    /// A payload could not be unmarshalled into the expected type.
    #[error("decode error: {0}")]
    Decode(String),

    /// The listening socket failed; the accept loop has stopped.
    #[error("listener failed: {0}")]
    Listener(String),

    /// A textual address could not be parsed.
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    /// Configuration could not be loaded.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl NetError {
    /// Returns true for framing and payload-shape violations.
    ///
    /// These terminate only the offending connection.
    #[must_use]
    pub const fn is_protocol(&self) -> bool {
        matches!(
            self,
            Self::Oversize { .. } | Self::Truncated { .. } | Self::Protocol(_) | Self::UnknownTag(_)
        )
    }

    /// Returns true for stream-layer failures (dial, accept, read, write).
    #[must_use]
    pub const fn is_connection(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::Io(_) | Self::Timeout(_))
    }
}

/// A locally caught failure, reported to the [`ErrorHook`].
#[derive(Debug)]
pub enum NetFailure {
    /// Reading the tag or frame of an inbound connection failed, or the tag is unknown.
    Dispatch {
        /// Remote end of the connection.
        peer: SocketAddr,
        /// What went wrong.
        error: NetError,
    },

    /// A registered handler returned an error.
    Handler {
        /// Tag the handler is registered under.
        tag: u8,
        /// Remote end of the connection.
        peer: SocketAddr,
        /// The handler's error.
        error: NetError,
    },

    /// Contacting a peer failed during a broadcast or bootstrap.
    Outbound {
        /// The peer that could not be served.
        peer: NetAddress,
        /// What went wrong.
        error: NetError,
    },

    /// Accepting one connection failed; the listener keeps running.
    Accept {
        /// The accept error.
        error: NetError,
    },

    /// The listener failed and the accept loop stopped.
    Listener {
        /// The accept error.
        error: NetError,
    },
}

impl std::fmt::Display for NetFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Dispatch { peer, error } => write!(f, "dispatch from {peer} failed: {error}"),
            Self::Handler { tag, peer, error } => {
                write!(f, "handler {tag:#04x} for {peer} failed: {error}")
            }
            Self::Outbound { peer, error } => write!(f, "request to {peer} failed: {error}"),
            Self::Accept { error } => write!(f, "accept failed: {error}"),
            Self::Listener { error } => write!(f, "{error}"),
        }
    }
}

impl NetFailure {
    /// Returns the error carried by the failure.
    #[must_use]
    pub const fn error(&self) -> &NetError {
        match self {
            Self::Dispatch { error, .. }
            | Self::Handler { error, .. }
            | Self::Outbound { error, .. }
            | Self::Accept { error }
            | Self::Listener { error } => error,
        }
    }
}

/// Callback receiving every failure the transport swallows.
pub type ErrorHook = Arc<dyn Fn(&NetFailure) + Send + Sync>;

/// The hook installed when the owner does not provide one: logs at `warn`.
#[must_use]
pub fn log_failures() -> ErrorHook {
    Arc::new(|failure: &NetFailure| {
        tracing::warn!(failure = %failure, "transport failure");
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification() {
        assert!(NetError::Oversize { len: 70_000 }.is_protocol());
        assert!(NetError::Truncated { expected: 4, received: 1 }.is_protocol());
        assert!(NetError::UnknownTag(b'Z').is_protocol());
        assert!(!NetError::Decode("bad".into()).is_protocol());

        assert!(NetError::Timeout(Duration::from_secs(5)).is_connection());
        assert!(NetError::Connection("refused".into()).is_connection());
        assert!(!NetError::Protocol("bad".into()).is_connection());
    }

    #[test]
    fn failure_display_names_tag_and_peer() {
        let failure = NetFailure::Handler {
            tag: b'P',
            peer: "127.0.0.1:9000".parse().unwrap(),
            error: NetError::Protocol("invalid number of peers".into()),
        };
        let text = failure.to_string();
        assert!(text.contains("0x50"));
        assert!(text.contains("127.0.0.1:9000"));
    }
}
