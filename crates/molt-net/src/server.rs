//! The node's transport server.
//!
//! This module provides the main interface:
//! - [`Server`]: listener, handler table, address book and outbound operations
//! - [`BroadcastReport`]: what happened when contacting every known peer
//!
//! A server starts accepting as soon as it is bound. The gossip handlers are
//! registered by default and may be overwritten like any other handler.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::address::NetAddress;
use crate::address_book::AddressBook;
use crate::config::ServerConfig;
use crate::connection::{self, Connection};
use crate::dispatcher::{Accept, Dispatcher, HookSlot};
use crate::error::{ErrorHook, NetError, NetFailure, log_failures};
use crate::gossip;
use crate::handler::HandlerTable;

/// Outcome of a [`Server::broadcast`].
#[derive(Debug, Default)]
pub struct BroadcastReport {
    /// Peers the action completed for.
    pub delivered: Vec<NetAddress>,
    /// Peers that could not be dialed or whose action failed.
    pub failures: Vec<NetFailure>,
}

impl BroadcastReport {
    /// Returns the number of peers contacted.
    #[must_use]
    pub fn attempted(&self) -> usize {
        self.delivered.len() + self.failures.len()
    }

    /// Returns true if every contacted peer was served.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    /// Returns the peers that failed.
    pub fn failed_peers(&self) -> impl Iterator<Item = &NetAddress> {
        self.failures.iter().filter_map(|f| match f {
            NetFailure::Outbound { peer, .. } => Some(peer),
            _ => None,
        })
    }
}

struct ServerInner {
    config: ServerConfig,
    local_addr: SocketAddr,
    book: AddressBook,
    handlers: HandlerTable,
    hook: HookSlot,
    shutdown: watch::Sender<bool>,
    accept_task: Mutex<Option<JoinHandle<Result<(), NetError>>>>,
}

/// A bound transport server.
///
/// Cloning is cheap; all clones share one listener, book and handler table.
/// The accept loop stops when [`close`](Self::close) is called or the last
/// clone is dropped.
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("local_addr", &self.inner.local_addr)
            .field("own", &self.inner.book.own_address())
            .field("peers", &self.inner.book.len())
            .field("handlers", &self.inner.handlers)
            .finish_non_exhaustive()
    }
}

impl Server {
    /// Binds the listener described by `config` and starts accepting.
    ///
    /// # Errors
    ///
    /// Returns [`NetError::Config`] if the configuration is invalid and
    /// [`NetError::Listener`] if the socket cannot be bound.
    pub async fn bind(config: ServerConfig) -> Result<Self, NetError> {
        config.validate()?;
        let listener = TcpListener::bind((config.bind_host.as_str(), config.port))
            .await
            .map_err(|e| {
                NetError::Listener(format!("bind {}:{}: {e}", config.bind_host, config.port))
            })?;
        Self::start(config, listener)
    }

    /// Starts a server accepting from an already bound `listener`.
    pub(crate) fn start<L: Accept>(config: ServerConfig, listener: L) -> Result<Self, NetError> {
        let local_addr = listener
            .local_addr()
            .map_err(|e| NetError::Listener(e.to_string()))?;

        let own = NetAddress::new("", local_addr.port());
        let book = match config.rng_seed {
            Some(seed) => AddressBook::seeded(own, seed),
            None => AddressBook::new(own),
        };

        let handlers = HandlerTable::new();
        let verify = config.verify_announcements.then(|| config.dial_timeout());
        gossip::install(&handlers, &book, verify);

        let hook: HookSlot = Arc::new(RwLock::new(log_failures()));
        let dispatcher = Dispatcher::new(
            handlers.clone(),
            Arc::clone(&hook),
            config.io_timeout(),
            config.max_concurrent_handlers,
        );
        let (shutdown, shutdown_rx) = watch::channel(false);
        let accept_task = tokio::spawn(dispatcher.run(listener, shutdown_rx));

        info!(
            addr = %local_addr,
            max_handlers = ?config.max_concurrent_handlers,
            "server listening"
        );

        Ok(Self {
            inner: Arc::new(ServerInner {
                config,
                local_addr,
                book,
                handlers,
                hook,
                shutdown,
                accept_task: Mutex::new(Some(accept_task)),
            }),
        })
    }

    /// Returns the server configuration.
    #[must_use]
    pub fn config(&self) -> &ServerConfig {
        &self.inner.config
    }

    /// Returns the address the listener is bound to.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    /// Returns this node's own address as currently known.
    #[must_use]
    pub fn my_address(&self) -> NetAddress {
        self.inner.book.own_address()
    }

    /// Returns a snapshot of the known peers.
    #[must_use]
    pub fn address_book(&self) -> Vec<NetAddress> {
        self.inner.book.snapshot()
    }

    /// Returns the live address book.
    #[must_use]
    pub fn book(&self) -> &AddressBook {
        &self.inner.book
    }

    /// Returns the handler table.
    #[must_use]
    pub fn handlers(&self) -> &HandlerTable {
        &self.inner.handlers
    }

    /// Replaces the hook that observes locally caught failures.
    pub fn set_error_hook(&self, hook: ErrorHook) {
        *self.inner.hook.write() = hook;
    }

    /// Binds `handler` to `tag`, replacing any existing binding.
    pub fn register_handler<F, Fut>(&self, tag: u8, handler: F)
    where
        F: Fn(Connection, Vec<u8>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), NetError>> + Send + 'static,
    {
        if self.inner.handlers.register(tag, handler) {
            debug!(tag, "replaced handler");
        }
    }

    /// Binds a typed handler: `decode` turns the payload into a `T` for `apply`.
    pub fn register_rpc<T, D, F, Fut>(&self, tag: u8, decode: D, apply: F)
    where
        T: Send + 'static,
        D: Fn(&[u8]) -> Result<T, NetError> + Send + Sync + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), NetError>> + Send + 'static,
    {
        if self.inner.handlers.register_rpc(tag, decode, apply) {
            debug!(tag, "replaced handler");
        }
    }

    /// Binds a typed handler whose payload is decoded by the default codec.
    pub fn register_json_rpc<T, F, Fut>(&self, tag: u8, apply: F)
    where
        T: DeserializeOwned + Send + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), NetError>> + Send + 'static,
    {
        if self.inner.handlers.register_json_rpc(tag, apply) {
            debug!(tag, "replaced handler");
        }
    }

    /// Picks a known peer uniformly at random.
    #[must_use]
    pub fn random_peer(&self) -> Option<NetAddress> {
        self.inner.book.random_peer()
    }

    /// Adds a peer to the book. The node's own address is refused.
    pub fn add_peer(&self, addr: NetAddress) -> bool {
        self.inner.book.insert(addr)
    }

    /// Probes `addr` with a TCP connect bounded by the configured dial timeout.
    pub async fn ping(&self, addr: &NetAddress) -> bool {
        connection::ping(addr, self.inner.config.dial_timeout()).await
    }

    /// Dials every known peer and runs `action` on the connection.
    ///
    /// Best effort: a failing peer does not affect the others and nothing is
    /// retried. Every failure goes to the error hook and into the report.
    pub async fn broadcast<F, Fut>(&self, action: F) -> BroadcastReport
    where
        F: Fn(Connection) -> Fut,
        Fut: Future<Output = Result<(), NetError>>,
    {
        let results = self.fan_out(self.inner.book.snapshot(), action).await;

        let mut report = BroadcastReport::default();
        for (peer, result) in results {
            match result {
                Ok(()) => report.delivered.push(peer),
                Err(error) => {
                    let failure = NetFailure::Outbound { peer, error };
                    self.report(&failure);
                    report.failures.push(failure);
                }
            }
        }
        debug!(
            delivered = report.delivered.len(),
            failed = report.failures.len(),
            "broadcast complete"
        );
        report
    }

    /// Dials each of `peers` concurrently and runs `action` on each connection.
    pub(crate) async fn fan_out<T, F, Fut>(
        &self,
        peers: Vec<NetAddress>,
        action: F,
    ) -> Vec<(NetAddress, Result<T, NetError>)>
    where
        F: Fn(Connection) -> Fut,
        Fut: Future<Output = Result<T, NetError>>,
    {
        let timeout = self.inner.config.dial_timeout();
        let action = &action;
        join_all(peers.into_iter().map(|peer| async move {
            let result = match Connection::dial(&peer, timeout).await {
                Ok(conn) => action(conn).await,
                Err(e) => Err(e),
            };
            (peer, result)
        }))
        .await
    }

    pub(crate) fn report(&self, failure: &NetFailure) {
        let hook = Arc::clone(&self.inner.hook.read());
        hook(failure);
    }

    /// Returns true while the accept loop is running.
    #[must_use]
    pub fn is_accepting(&self) -> bool {
        self.inner
            .accept_task
            .lock()
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    /// Stops accepting new connections and waits for the accept loop to exit.
    ///
    /// Handlers already running are not cancelled. Calling `close` again is a no-op.
    ///
    /// # Errors
    ///
    /// Returns the listener error if the accept loop had already failed.
    pub async fn close(&self) -> Result<(), NetError> {
        // The loop may already be gone; a failed send is fine.
        let _ = self.inner.shutdown.send(true);
        let task = self.inner.accept_task.lock().take();
        match task {
            Some(task) => task
                .await
                .map_err(|e| NetError::Listener(format!("accept loop panicked: {e}")))?,
            None => Ok(()),
        }
    }
}
