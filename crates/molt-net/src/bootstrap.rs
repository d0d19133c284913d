//! Joining the network.
//!
//! Bootstrap runs four phases against a list of seed addresses:
//!
//! 1. ping every seed and keep the ones that answer
//! 2. ask known peers how they see us until one replies, and adopt that host
//! 3. ask every known peer for more peers, ping the new ones, keep the live ones
//! 4. announce our own address to everyone in the book
//!
//! Each phase is best effort. A node that reaches nobody ends up with an empty
//! book and an unspecified host, which is not an error.

use std::collections::BTreeSet;

use futures::future::join_all;
use tracing::{debug, info};

use crate::address::NetAddress;
use crate::codec;
use crate::connection::Connection;
use crate::error::{NetError, NetFailure};
use crate::gossip::{ANNOUNCE_TAG, request_hostname, request_peers};
use crate::server::Server;

/// What a [`Server::bootstrap`] run achieved.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BootstrapReport {
    /// Seeds that answered the initial ping.
    pub seeded: Vec<NetAddress>,
    /// The host a peer reported for us, if any peer did.
    pub hostname: Option<String>,
    /// Peers learned through discovery and found alive.
    pub discovered: Vec<NetAddress>,
    /// Peers that accepted our announcement.
    pub announced: Vec<NetAddress>,
}

impl Server {
    /// Joins the network through `seeds`.
    ///
    /// # Errors
    ///
    /// Only fails if our own address cannot be marshalled. Unreachable peers
    /// are reported to the error hook and skipped.
    pub async fn bootstrap(&self, seeds: &[NetAddress]) -> Result<BootstrapReport, NetError> {
        info!(seeds = seeds.len(), "bootstrapping");
        let mut report = BootstrapReport {
            seeded: self.ping_and_insert(seeds.to_vec()).await,
            ..BootstrapReport::default()
        };
        debug!(reachable = report.seeded.len(), "seeds pinged");

        report.hostname = self.learn_hostname().await;

        let candidates = self.collect_candidates().await;
        report.discovered = self.ping_and_insert(candidates).await;
        debug!(discovered = report.discovered.len(), "discovery finished");

        let payload = codec::marshal(&self.my_address())?;
        let payload = payload.as_slice();
        let announced = self
            .broadcast(|mut conn| async move { conn.send_request(ANNOUNCE_TAG, payload).await })
            .await;
        report.announced = announced.delivered;

        info!(
            own = %self.my_address(),
            peers = self.book().len(),
            announced = report.announced.len(),
            "bootstrap complete"
        );
        Ok(report)
    }

    async fn ping_and_insert(&self, candidates: Vec<NetAddress>) -> Vec<NetAddress> {
        let probes = candidates.into_iter().map(|addr| async move {
            let alive = self.ping(&addr).await;
            (addr, alive)
        });
        join_all(probes)
            .await
            .into_iter()
            .filter_map(|(addr, alive)| {
                if !alive {
                    debug!(peer = %addr, "peer unreachable");
                    return None;
                }
                self.add_peer(addr.clone()).then_some(addr)
            })
            .collect()
    }

    async fn learn_hostname(&self) -> Option<String> {
        let timeout = self.config().dial_timeout();
        for peer in self.address_book() {
            let observed = match Connection::dial(&peer, timeout).await {
                Ok(mut conn) => request_hostname(&mut conn).await,
                Err(e) => Err(e),
            };
            match observed {
                Ok(observed) => {
                    info!(host = %observed.host, via = %peer, "learned own host");
                    self.book().set_own_host(observed.host.clone());
                    return Some(observed.host);
                }
                Err(error) => self.report(&NetFailure::Outbound { peer, error }),
            }
        }
        None
    }

    async fn collect_candidates(&self) -> Vec<NetAddress> {
        let count = self.config().peer_request_count;
        let replies = self
            .fan_out(self.address_book(), |mut conn| async move {
                request_peers(&mut conn, count).await
            })
            .await;

        let own = self.my_address();
        let mut candidates = BTreeSet::new();
        for (peer, reply) in replies {
            match reply {
                Ok(peers) => {
                    debug!(via = %peer, received = peers.len(), "peers shared");
                    candidates.extend(
                        peers
                            .into_iter()
                            .filter(|p| *p != own && !self.book().contains(p)),
                    );
                }
                Err(error) => self.report(&NetFailure::Outbound { peer, error }),
            }
        }
        candidates.into_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::gossip::{HOSTNAME_TAG, SHARE_PEERS_TAG};
    use std::time::Duration;
    use tokio::net::TcpListener;

    fn local_config() -> ServerConfig {
        ServerConfig::new(0)
            .with_bind_host("127.0.0.1")
            .with_dial_timeout(Duration::from_secs(2))
            .with_rng_seed(3)
    }

    fn address_of(server: &Server) -> NetAddress {
        NetAddress::new("127.0.0.1", server.local_addr().port())
    }

    async fn eventually(cond: impl Fn() -> bool) -> bool {
        for _ in 0..100 {
            if cond() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        cond()
    }

    #[tokio::test]
    async fn joins_through_a_seed() {
        let p2 = Server::bind(local_config()).await.unwrap();
        let p3 = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            NetAddress::from(listener.local_addr().unwrap())
        };

        let p1 = Server::bind(local_config()).await.unwrap();
        p1.register_handler(HOSTNAME_TAG, |mut conn, _| async move {
            conn.write_message(b"203.0.113.5:4001").await
        });
        let shared = codec::marshal(&vec![address_of(&p2), p3.clone()]).unwrap();
        p1.register_handler(SHARE_PEERS_TAG, move |mut conn, _| {
            let shared = shared.clone();
            async move { conn.write_message(&shared).await }
        });

        let node = Server::bind(local_config()).await.unwrap();
        let report = node.bootstrap(&[address_of(&p1)]).await.unwrap();

        assert_eq!(report.seeded, vec![address_of(&p1)]);
        assert_eq!(report.hostname.as_deref(), Some("203.0.113.5"));
        assert_eq!(report.discovered, vec![address_of(&p2)]);
        assert_eq!(report.announced.len(), 2);

        let own = node.my_address();
        assert_eq!(own.host, "203.0.113.5");
        assert_eq!(own.port, node.local_addr().port());

        let mut book = node.address_book();
        book.sort();
        let mut expected = vec![address_of(&p1), address_of(&p2)];
        expected.sort();
        assert_eq!(book, expected);

        assert!(eventually(|| p1.book().contains(&own) && p2.book().contains(&own)).await);
    }

    #[tokio::test]
    async fn no_seeds_leaves_the_node_alone() {
        let node = Server::bind(local_config()).await.unwrap();
        let report = node.bootstrap(&[]).await.unwrap();

        assert_eq!(report, BootstrapReport::default());
        assert!(node.address_book().is_empty());
        assert!(node.my_address().is_unspecified());
    }

    #[tokio::test]
    async fn unreachable_seeds_are_skipped() {
        let dead = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            NetAddress::from(listener.local_addr().unwrap())
        };
        let node = Server::bind(local_config()).await.unwrap();
        let report = node.bootstrap(&[dead]).await.unwrap();

        assert!(report.seeded.is_empty());
        assert!(report.hostname.is_none());
        assert!(node.address_book().is_empty());
    }

    #[tokio::test]
    async fn discovery_excludes_our_own_address() {
        let node = Server::bind(local_config()).await.unwrap();
        let p1 = Server::bind(local_config()).await.unwrap();
        // p1 reports us as 127.0.0.1, and also knows our listening address.
        p1.add_peer(address_of(&node));

        let report = node.bootstrap(&[address_of(&p1)]).await.unwrap();

        assert_eq!(report.hostname.as_deref(), Some("127.0.0.1"));
        assert!(report.discovered.is_empty());
        assert_eq!(node.address_book(), vec![address_of(&p1)]);
    }
}
