//! TCP connections between peers.
//!
//! This module provides:
//! - [`Connection`]: an owned stream that speaks the framing protocol
//! - [`ping`]: the connect-and-disconnect liveness probe
//!
//! Connections are one-shot: a connection carries exactly one tagged request
//! and at most one response frame, and is closed when dropped.

use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::trace;

use crate::address::NetAddress;
use crate::codec;
use crate::error::NetError;
use crate::framing;

/// Default dial timeout.
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// A single connection to a peer.
#[derive(Debug)]
pub struct Connection {
    stream: TcpStream,
    remote_addr: SocketAddr,
    io_timeout: Option<Duration>,
}

impl Connection {
    /// Wraps an accepted stream. Every read and write is bounded by `io_timeout`.
    #[must_use]
    pub fn accepted(
        stream: TcpStream,
        remote_addr: SocketAddr,
        io_timeout: Option<Duration>,
    ) -> Self {
        Self {
            stream,
            remote_addr,
            io_timeout,
        }
    }

    /// Dials `addr`, failing if the connection is not established within `timeout`.
    ///
    /// Reads and writes on the returned connection are bounded by the same timeout.
    pub async fn dial(addr: &NetAddress, timeout: Duration) -> Result<Self, NetError> {
        let connect = TcpStream::connect((addr.host.as_str(), addr.port));
        let stream = tokio::time::timeout(timeout, connect)
            .await
            .map_err(|_| NetError::Timeout(timeout))?
            .map_err(|e| NetError::Connection(format!("dial {addr}: {e}")))?;
        let remote_addr = stream
            .peer_addr()
            .map_err(|e| NetError::Connection(format!("dial {addr}: {e}")))?;
        trace!(peer = %remote_addr, "dialed");

        Ok(Self {
            stream,
            remote_addr,
            io_timeout: Some(timeout),
        })
    }

    /// Returns the address of the remote end as observed on this connection.
    #[must_use]
    pub const fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Reads the one-byte message tag.
    pub async fn read_tag(&mut self) -> Result<u8, NetError> {
        let deadline = self.io_timeout;
        let stream = &mut self.stream;
        with_deadline(deadline, async move {
            stream.read_u8().await.map_err(|e| {
                if e.kind() == std::io::ErrorKind::UnexpectedEof {
                    NetError::Truncated {
                        expected: 1,
                        received: 0,
                    }
                } else {
                    NetError::Io(e)
                }
            })
        })
        .await
    }

    /// Reads one frame.
    pub async fn read_message(&mut self) -> Result<Vec<u8>, NetError> {
        let deadline = self.io_timeout;
        with_deadline(deadline, framing::read_message(&mut self.stream)).await
    }

    /// Writes one frame.
    pub async fn write_message(&mut self, payload: &[u8]) -> Result<(), NetError> {
        let deadline = self.io_timeout;
        with_deadline(deadline, framing::write_message(&mut self.stream, payload)).await
    }

    /// Sends a tagged request as a single write.
    pub async fn send_request(&mut self, tag: u8, payload: &[u8]) -> Result<(), NetError> {
        let bytes = framing::encode_request(tag, payload)?;
        self.send_raw(&bytes).await
    }

    /// Marshals `value` and sends it as a tagged request.
    pub async fn send_value<T: Serialize + ?Sized>(
        &mut self,
        tag: u8,
        value: &T,
    ) -> Result<(), NetError> {
        let payload = codec::marshal(value)?;
        self.send_request(tag, &payload).await
    }

    /// Sends a tagged request and reads the response frame.
    pub async fn request(&mut self, tag: u8, payload: &[u8]) -> Result<Vec<u8>, NetError> {
        self.send_request(tag, payload).await?;
        self.read_message().await
    }

    /// Writes pre-encoded bytes (a full request image) as one write.
    pub async fn send_raw(&mut self, bytes: &[u8]) -> Result<(), NetError> {
        let deadline = self.io_timeout;
        let stream = &mut self.stream;
        with_deadline(deadline, async move {
            stream.write_all(bytes).await?;
            stream.flush().await?;
            Ok(())
        })
        .await
    }
}

async fn with_deadline<T, F>(deadline: Option<Duration>, fut: F) -> Result<T, NetError>
where
    F: Future<Output = Result<T, NetError>>,
{
    match deadline {
        Some(limit) => tokio::time::timeout(limit, fut)
            .await
            .map_err(|_| NetError::Timeout(limit))?,
        None => fut.await,
    }
}

/// Returns whether `addr` accepts TCP connections within `timeout`.
///
/// Only proves reachability at the TCP level: nothing is sent and the
/// connection is closed immediately.
pub async fn ping(addr: &NetAddress, timeout: Duration) -> bool {
    match Connection::dial(addr, timeout).await {
        Ok(_) => true,
        Err(e) => {
            trace!(peer = %addr, error = %e, "ping failed");
            false
        }
    }
}
