//! Integration tests for the gossip flow between live servers.
//!
//! Covers:
//! 1. Concurrent announcements into one address book
//! 2. Peer sharing bounds
//! 3. Handler replacement at runtime
//! 4. Broadcast and bootstrap across several nodes

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use molt_net::gossip::{announce, request_hostname, request_peers};
use molt_net::{
    ANNOUNCE_TAG, Connection, NetAddress, NetError, NetFailure, Server, ServerConfig, codec,
};
use parking_lot::Mutex;
use tokio::net::TcpListener;

// ============================================================================
// Helper Functions
// ============================================================================

const TIMEOUT: Duration = Duration::from_secs(2);

fn local_config() -> ServerConfig {
    ServerConfig::new(0)
        .with_bind_host("127.0.0.1")
        .with_dial_timeout(TIMEOUT)
}

async fn start() -> Server {
    Server::bind(local_config()).await.unwrap()
}

fn address_of(server: &Server) -> NetAddress {
    NetAddress::new("127.0.0.1", server.local_addr().port())
}

async fn dead_address() -> NetAddress {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    NetAddress::from(listener.local_addr().unwrap())
}

async fn dial(server: &Server) -> Connection {
    Connection::dial(&address_of(server), TIMEOUT).await.unwrap()
}

/// Polls until `cond` holds or a second has passed.
async fn eventually(cond: impl Fn() -> bool) -> bool {
    for _ in 0..50 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    cond()
}

// ============================================================================
// Announcements
// ============================================================================

#[tokio::test]
async fn concurrent_announcements_all_land() {
    let server = start().await;
    let senders: Vec<_> = (0..32u16)
        .map(|i| {
            let target = address_of(&server);
            tokio::spawn(async move {
                let mut conn = Connection::dial(&target, TIMEOUT).await.unwrap();
                announce(&mut conn, &NetAddress::new("10.1.0.1", 5000 + i))
                    .await
                    .unwrap();
            })
        })
        .collect();
    for sender in senders {
        sender.await.unwrap();
    }

    assert!(eventually(|| server.book().len() == 32).await);
}

#[tokio::test]
async fn repeated_announcement_is_idempotent() {
    let server = start().await;
    let addr = NetAddress::new("10.1.0.1", 5000);
    for _ in 0..3 {
        announce(&mut dial(&server).await, &addr).await.unwrap();
    }

    assert!(eventually(|| server.book().contains(&addr)).await);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(server.address_book(), vec![addr]);
}

#[tokio::test]
async fn announcing_our_own_address_is_ignored() {
    let server = start().await;
    let own = server.my_address();
    announce(&mut dial(&server).await, &own).await.unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(server.address_book().is_empty());
}

// ============================================================================
// Peer Sharing
// ============================================================================

#[tokio::test]
async fn shared_peers_are_bounded_and_known() {
    let server = start().await;
    for port in 1..=6 {
        server.add_peer(NetAddress::new("10.2.0.1", port));
    }

    for (count, expected) in [(0u8, 0usize), (4, 4), (6, 6), (200, 6)] {
        let peers = request_peers(&mut dial(&server).await, count).await.unwrap();
        assert_eq!(peers.len(), expected);
        assert!(peers.iter().all(|p| server.book().contains(p)));

        let mut unique = peers.clone();
        unique.sort();
        unique.dedup();
        assert_eq!(unique.len(), peers.len());
    }
}

#[tokio::test]
async fn malformed_peer_request_is_reported() {
    let server = start().await;
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    server.set_error_hook(Arc::new(move |f: &NetFailure| {
        sink.lock().push(f.error().is_protocol());
    }));

    let mut conn = dial(&server).await;
    conn.send_request(b'P', &[1, 2, 3]).await.unwrap();

    assert!(eventually(|| !seen.lock().is_empty()).await);
    assert_eq!(*seen.lock(), vec![true]);
}

#[tokio::test]
async fn hostname_reports_the_observed_address() {
    let server = start().await;
    let mut conn = dial(&server).await;
    let seen = request_hostname(&mut conn).await.unwrap();
    assert_eq!(seen.host, "127.0.0.1");
    assert_ne!(seen.port, 0);
}

// ============================================================================
// Handler Registration
// ============================================================================

#[tokio::test]
async fn replacing_a_handler_takes_effect_for_new_connections() {
    let server = start().await;
    server.register_handler(b'V', |mut conn, _| async move { conn.write_message(b"v1").await });
    assert_eq!(dial(&server).await.request(b'V', b"").await.unwrap(), b"v1");

    server.register_handler(b'V', |mut conn, _| async move { conn.write_message(b"v2").await });
    assert_eq!(dial(&server).await.request(b'V', b"").await.unwrap(), b"v2");
}

#[tokio::test]
async fn typed_rpc_rejects_undecodable_payloads() {
    #[derive(serde::Deserialize)]
    struct Job {
        units: usize,
    }

    let server = start().await;
    let total = Arc::new(AtomicUsize::new(0));
    let decode_failures = Arc::new(AtomicUsize::new(0));
    {
        let total = Arc::clone(&total);
        server.register_rpc(
            b'J',
            |payload: &[u8]| codec::unmarshal::<Job>(payload),
            move |job| {
                total.fetch_add(job.units, Ordering::SeqCst);
                async { Ok(()) }
            },
        );
        let counter = Arc::clone(&decode_failures);
        server.set_error_hook(Arc::new(move |f: &NetFailure| {
            if matches!(f.error(), NetError::Decode(_)) {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        }));
    }

    dial(&server).await.send_request(b'J', br#"{"units": 3}"#).await.unwrap();
    dial(&server).await.send_request(b'J', b"[]").await.unwrap();
    dial(&server).await.send_request(b'J', br#"{"units": 4}"#).await.unwrap();

    assert!(eventually(|| total.load(Ordering::SeqCst) == 7).await);
    assert!(eventually(|| decode_failures.load(Ordering::SeqCst) == 1).await);
}

// ============================================================================
// Broadcast and Bootstrap
// ============================================================================

#[tokio::test]
async fn broadcast_reports_each_dead_peer_once() {
    let server = start().await;
    let live = start().await;
    let dead = dead_address().await;
    server.add_peer(address_of(&live));
    server.add_peer(dead.clone());

    let payload = codec::marshal(&NetAddress::new("10.3.0.1", 1)).unwrap();
    let payload = payload.as_slice();
    let report = server
        .broadcast(|mut conn| async move { conn.send_request(ANNOUNCE_TAG, payload).await })
        .await;

    assert_eq!(report.delivered, vec![address_of(&live)]);
    assert_eq!(report.failed_peers().cloned().collect::<Vec<_>>(), vec![dead]);
    assert!(eventually(|| live.book().len() == 1).await);
}

#[tokio::test]
async fn three_nodes_find_each_other() {
    let seed = start().await;
    let first = start().await;
    let second = start().await;

    first.bootstrap(&[address_of(&seed)]).await.unwrap();
    assert!(eventually(|| seed.book().contains(&address_of(&first))).await);
    let report = second.bootstrap(&[address_of(&seed)]).await.unwrap();

    // `first` announced itself to `seed`, so `second` learns it through discovery.
    assert_eq!(report.discovered, vec![first.my_address()]);
    assert!(second.book().contains(&address_of(&seed)));
    assert!(second.book().contains(&address_of(&first)));
    assert!(eventually(|| first.book().contains(&address_of(&second))).await);
    assert!(eventually(|| seed.book().len() == 2).await);
}

#[tokio::test]
async fn closed_server_refuses_new_connections() {
    let server = start().await;
    let addr = address_of(&server);
    server.close().await.unwrap();
    assert!(matches!(
        Connection::dial(&addr, TIMEOUT).await,
        Err(NetError::Connection(_) | NetError::Timeout(_))
    ));
}
