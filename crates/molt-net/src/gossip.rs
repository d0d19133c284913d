//! Built-in gossip handlers.
//!
//! Three message tags are reserved and bound on every server:
//!
//! | tag   | request                  | response                       |
//! |-------|--------------------------|--------------------------------|
//! | `'H'` | empty                    | requester's `host:port` as seen |
//! | `'P'` | one byte: requested count | marshalled `Vec<NetAddress>`   |
//! | `'A'` | marshalled `NetAddress`   | none                           |
//!
//! The client side of each exchange lives here too, so both halves of the
//! protocol are defined in one place.

use std::time::Duration;

use tracing::debug;

use crate::address::NetAddress;
use crate::address_book::AddressBook;
use crate::codec;
use crate::connection::{Connection, ping};
use crate::error::NetError;
use crate::handler::HandlerTable;

/// Asks for the requester's externally visible address.
pub const HOSTNAME_TAG: u8 = b'H';

/// Asks for a sample of the responder's peers.
pub const SHARE_PEERS_TAG: u8 = b'P';

/// Announces an address to be added to the responder's book.
pub const ANNOUNCE_TAG: u8 = b'A';

/// Number of peers requested during discovery unless configured otherwise.
pub const DEFAULT_PEER_REQUEST: u8 = 10;

/// Binds the three gossip handlers on `table`, operating on `book`.
///
/// With `verify_timeout` set, announced addresses must answer a [`ping`]
/// before they are inserted.
pub fn install(table: &HandlerTable, book: &AddressBook, verify_timeout: Option<Duration>) {
    table.register(HOSTNAME_TAG, send_hostname);

    let shared = book.clone();
    table.register(SHARE_PEERS_TAG, move |conn, payload| {
        share_peers(shared.clone(), conn, payload)
    });

    let shared = book.clone();
    table.register(ANNOUNCE_TAG, move |conn, payload| {
        add_peer(shared.clone(), verify_timeout, conn, payload)
    });
}

/// Replies with the remote address of the connection.
pub async fn send_hostname(mut conn: Connection, _payload: Vec<u8>) -> Result<(), NetError> {
    let observed = conn.remote_addr().to_string();
    conn.write_message(observed.as_bytes()).await
}

/// Replies with up to the requested number of peers, chosen at random.
pub async fn share_peers(
    book: AddressBook,
    mut conn: Connection,
    payload: Vec<u8>,
) -> Result<(), NetError> {
    let &[count] = payload.as_slice() else {
        return Err(NetError::Protocol(format!(
            "peer request must be 1 byte, got {}",
            payload.len()
        )));
    };
    let peers = book.sample(usize::from(count));
    debug!(peer = %conn.remote_addr(), requested = count, shared = peers.len(), "sharing peers");
    conn.write_message(&codec::marshal(&peers)?).await
}

/// Inserts the announced address into the book.
///
/// The announcer is trusted unless `verify_timeout` is set.
pub async fn add_peer(
    book: AddressBook,
    verify_timeout: Option<Duration>,
    _conn: Connection,
    payload: Vec<u8>,
) -> Result<(), NetError> {
    let addr: NetAddress = codec::unmarshal(&payload)?;
    if let Some(timeout) = verify_timeout {
        if !ping(&addr, timeout).await {
            return Err(NetError::Protocol(format!(
                "announced address {addr} is unreachable"
            )));
        }
    }
    if book.insert(addr.clone()) {
        debug!(peer = %addr, "peer announced");
    }
    Ok(())
}

/// Asks the remote node how it sees us.
pub async fn request_hostname(conn: &mut Connection) -> Result<NetAddress, NetError> {
    let reply = conn.request(HOSTNAME_TAG, &[]).await?;
    let text = String::from_utf8(reply).map_err(|e| NetError::Decode(e.to_string()))?;
    text.parse()
}

/// Asks the remote node for up to `count` of its peers.
pub async fn request_peers(conn: &mut Connection, count: u8) -> Result<Vec<NetAddress>, NetError> {
    let reply = conn.request(SHARE_PEERS_TAG, &[count]).await?;
    codec::unmarshal(&reply)
}

/// Tells the remote node to add `addr` to its book.
pub async fn announce(conn: &mut Connection, addr: &NetAddress) -> Result<(), NetError> {
    conn.send_value(ANNOUNCE_TAG, addr).await
}
