//! # molt-net
//!
//! Node-to-node transport for the MOLT network.
//!
//! This crate provides:
//!
//! - Length-prefixed framing over TCP with a fixed maximum message size
//! - A tag-routed dispatcher serving each inbound connection on its own task
//! - Runtime registration of raw and typed handlers
//! - A shared address book of known peers
//! - Gossip handlers for hostname discovery, peer sharing and announcements
//! - Bootstrap from a list of seed addresses
//!
//! ## Core Types
//!
//! - [`Server`]: a bound node; owns the listener, handlers and address book
//! - [`Connection`]: one framed TCP stream
//! - [`NetAddress`]: a `host:port` pair as it travels on the wire
//! - [`AddressBook`]: the set of known peers, never containing the node itself
//! - [`NetError`]: every transport failure
//!
//! ## Example
//!
//! ```no_run
//! use molt_net::{NetAddress, Server, ServerConfig};
//!
//! # async fn run() -> Result<(), molt_net::NetError> {
//! let server = Server::bind(ServerConfig::new(4001)).await?;
//! server.register_json_rpc(b'J', |job: String| async move {
//!     tracing::info!(%job, "job received");
//!     Ok(())
//! });
//!
//! let seeds: Vec<NetAddress> = vec!["198.51.100.7:4001".parse()?];
//! let report = server.bootstrap(&seeds).await?;
//! println!("joined with {} peers", report.seeded.len() + report.discovered.len());
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod address;
pub mod address_book;
pub mod bootstrap;
pub mod codec;
pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod framing;
pub mod gossip;
pub mod handler;
pub mod server;

pub use address::NetAddress;
pub use address_book::AddressBook;
pub use bootstrap::BootstrapReport;
pub use config::ServerConfig;
pub use connection::{Connection, DEFAULT_DIAL_TIMEOUT, ping};
pub use dispatcher::{Accept, AcceptFailure, Dispatcher};
pub use error::{ErrorHook, NetError, NetFailure, log_failures};
pub use framing::MAX_MESSAGE_LEN;
pub use gossip::{ANNOUNCE_TAG, DEFAULT_PEER_REQUEST, HOSTNAME_TAG, SHARE_PEERS_TAG};
pub use handler::{BoxedHandler, HandlerFuture, HandlerTable};
pub use server::{BroadcastReport, Server};
