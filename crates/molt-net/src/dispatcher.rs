//! The accept loop.
//!
//! [`Dispatcher::run`] owns the listening socket. Each accepted connection is
//! served on its own task: one tag byte, one frame, one handler call. The loop
//! never waits for a handler; it only waits for an admission permit when a
//! concurrency limit is configured.
//!
//! Accept errors are sorted by [`classify_accept_error`]. Only an unusable
//! socket stops the loop; running out of descriptors or buffers pauses it for
//! [`ACCEPT_BACKOFF`] and a connection dropped before accept is skipped.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Semaphore, watch};
use tracing::{debug, error, info, trace, warn};

use crate::connection::Connection;
use crate::error::{ErrorHook, NetError, NetFailure};
use crate::handler::HandlerTable;

/// Shared slot holding the server's error hook. Replaceable at runtime.
pub type HookSlot = Arc<RwLock<ErrorHook>>;

/// Pause after an accept error caused by resource exhaustion.
pub const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Source of inbound connections for the accept loop.
pub trait Accept: Send + Sync + 'static {
    /// Waits for the next inbound connection.
    fn accept(&self) -> impl Future<Output = io::Result<(TcpStream, SocketAddr)>> + Send;

    /// Returns the address the listener is bound to.
    fn local_addr(&self) -> io::Result<SocketAddr>;
}

impl Accept for TcpListener {
    fn accept(&self) -> impl Future<Output = io::Result<(TcpStream, SocketAddr)>> + Send {
        TcpListener::accept(self)
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        TcpListener::local_addr(self)
    }
}

/// How the accept loop reacts to an accept error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcceptFailure {
    /// The pending connection went away before it was accepted. Retry at once.
    Connection,
    /// Descriptors, buffers or memory ran out. Retry after [`ACCEPT_BACKOFF`].
    Exhausted,
    /// The socket is unusable. The loop stops.
    Fatal,
}

/// Sorts an accept error into an [`AcceptFailure`].
///
/// `EMFILE`, `ENFILE` and `ENOBUFS` have no stable [`io::ErrorKind`] of their
/// own, so anything not recognised as per-connection or fatal counts as
/// exhaustion.
#[must_use]
pub fn classify_accept_error(e: &io::Error) -> AcceptFailure {
    match e.kind() {
        io::ErrorKind::ConnectionAborted
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionRefused
        | io::ErrorKind::Interrupted
        | io::ErrorKind::WouldBlock
        | io::ErrorKind::TimedOut
        | io::ErrorKind::PermissionDenied => AcceptFailure::Connection,
        io::ErrorKind::InvalidInput | io::ErrorKind::Unsupported => AcceptFailure::Fatal,
        _ => AcceptFailure::Exhausted,
    }
}

/// Routes inbound connections to handlers by tag.
#[derive(Clone)]
pub struct Dispatcher {
    handlers: HandlerTable,
    hook: HookSlot,
    io_timeout: Option<Duration>,
    limiter: Option<Arc<Semaphore>>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("handlers", &self.handlers)
            .field("io_timeout", &self.io_timeout)
            .field(
                "available_permits",
                &self.limiter.as_ref().map(|l| l.available_permits()),
            )
            .finish()
    }
}

impl Dispatcher {
    /// Creates a dispatcher over `handlers`.
    ///
    /// `max_concurrent` bounds the number of handler tasks alive at once. A
    /// limit of zero would never admit a connection and is raised to one;
    /// [`ServerConfig::validate`](crate::ServerConfig::validate) rejects it
    /// before a server gets here.
    #[must_use]
    pub fn new(
        handlers: HandlerTable,
        hook: HookSlot,
        io_timeout: Option<Duration>,
        max_concurrent: Option<usize>,
    ) -> Self {
        Self {
            handlers,
            hook,
            io_timeout,
            limiter: max_concurrent.map(|max| Arc::new(Semaphore::new(max.max(1)))),
        }
    }

    /// Accepts connections until `shutdown` changes or its sender is dropped.
    ///
    /// Tasks already serving connections keep running after the loop exits.
    ///
    /// # Errors
    ///
    /// Returns [`NetError::Listener`] if the listener fails with an
    /// [`AcceptFailure::Fatal`] error; the loop stops.
    pub async fn run<L: Accept>(
        self,
        listener: L,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), NetError> {
        if let Ok(addr) = listener.local_addr() {
            info!(addr = %addr, "accepting connections");
        }

        loop {
            let permit = match &self.limiter {
                Some(limiter) => tokio::select! {
                    permit = Arc::clone(limiter).acquire_owned() => {
                        Some(permit.map_err(|e| NetError::Listener(e.to_string()))?)
                    }
                    _ = shutdown.changed() => break,
                },
                None => None,
            };

            tokio::select! {
                accept = listener.accept() => match accept {
                    Ok((stream, peer)) => {
                        let dispatcher = self.clone();
                        tokio::spawn(async move {
                            dispatcher.serve(stream, peer).await;
                            drop(permit);
                        });
                    }
                    Err(e) => self.accept_failed(e).await?,
                },
                _ = shutdown.changed() => break,
            }
        }

        info!("accept loop stopped");
        Ok(())
    }

    async fn accept_failed(&self, e: io::Error) -> Result<(), NetError> {
        let kind = classify_accept_error(&e);
        if kind == AcceptFailure::Fatal {
            error!(error = %e, "listener failed");
            self.report(&NetFailure::Listener {
                error: NetError::Listener(e.to_string()),
            });
            return Err(NetError::Listener(e.to_string()));
        }

        warn!(error = %e, ?kind, "accept failed");
        self.report(&NetFailure::Accept {
            error: NetError::Io(e),
        });
        if kind == AcceptFailure::Exhausted {
            tokio::time::sleep(ACCEPT_BACKOFF).await;
        }
        Ok(())
    }

    /// Serves one inbound connection to completion.
    pub async fn serve(&self, stream: TcpStream, peer: SocketAddr) {
        let mut conn = Connection::accepted(stream, peer, self.io_timeout);

        let (tag, payload) = match read_request(&mut conn).await {
            Ok(request) => request,
            Err(error) => {
                debug!(peer = %peer, error = %error, "dropping connection");
                self.report(&NetFailure::Dispatch { peer, error });
                return;
            }
        };

        let Some(handler) = self.handlers.get(tag) else {
            debug!(peer = %peer, tag, "no handler for tag");
            self.report(&NetFailure::Dispatch {
                peer,
                error: NetError::UnknownTag(tag),
            });
            return;
        };

        trace!(peer = %peer, tag, len = payload.len(), "dispatching");
        if let Err(error) = handler(conn, payload).await {
            self.report(&NetFailure::Handler { tag, peer, error });
        }
    }

    fn report(&self, failure: &NetFailure) {
        let hook = Arc::clone(&self.hook.read());
        hook(failure);
    }
}

async fn read_request(conn: &mut Connection) -> Result<(u8, Vec<u8>), NetError> {
    let tag = conn.read_tag().await?;
    let payload = conn.read_message().await?;
    Ok((tag, payload))
}
