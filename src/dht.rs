/*
src/dht.rs

The host side of the node: owns the local identity, the shared socket and
the routing tables, and drives the three background threads (inbound
listener, iterative node discovery, maintenance). Bootstrap runs on the
caller's thread and is the only operation that reports failure.
*/

use crate::id::NodeId;
use crate::node::Node;
use crate::server::{Handler, Server, Wire};
use crate::table::RoutingTable;
use anyhow::{bail, Result};
use log::{debug, info};
use mio::Poll;
use std::net::{SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Tunable parameters of the background loops. `search` adds a get_peers
/// lookup for that info-hash to every discovery round.
#[derive(Debug, Clone)]
pub struct Config {
    /// nodes queried per loop iteration, and the table size bootstrap
    /// must reach
    pub sample_count: usize,
    /// unanswered seed queries tolerated before bootstrap gives up
    pub max_bootstrap_errors: usize,
    pub bootstrap_iteration_timeout: Duration,
    pub find_iteration_timeout: Duration,
    pub gc_iteration_timeout: Duration,
    /// quiet time after which a node is considered stale
    pub gc_max_time: Duration,
    /// unanswered queries a stale node may accumulate before eviction
    pub gc_max_trans: usize,
    pub search: Option<NodeId>,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            sample_count: 8,
            max_bootstrap_errors: 5,
            bootstrap_iteration_timeout: Duration::from_secs(2),
            find_iteration_timeout: Duration::from_secs(2),
            gc_iteration_timeout: Duration::from_secs(1),
            gc_max_time: Duration::from_secs(60),
            gc_max_trans: 5,
            search: None,
        }
    }
}

pub struct Dht {
    pub id: NodeId,
    config: Config,
    wire: Arc<Wire>,
    contacts: Arc<RoutingTable>,
    peers: Arc<RoutingTable>,
    /// gates the discovery and maintenance loops
    running: Arc<AtomicBool>,
    /// gates the listener
    shutdown: Arc<AtomicBool>,
    poll: Option<Poll>,
    listener: Option<JoinHandle<()>>,
    finder: Option<JoinHandle<()>>,
    sweeper: Option<JoinHandle<()>>,
}

impl Dht {
    pub fn new(bind: SocketAddr, config: Config) -> Result<Dht> {
        let (wire, poll) = Wire::bind(bind)?;
        Ok(Dht {
            id: NodeId::random(),
            config,
            wire,
            contacts: Arc::new(RoutingTable::new()),
            peers: Arc::new(RoutingTable::new()),
            running: Arc::new(AtomicBool::new(false)),
            shutdown: Arc::new(AtomicBool::new(false)),
            poll: Some(poll),
            listener: None,
            finder: None,
            sweeper: None,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.wire.local_addr()
    }

    pub fn contact_count(&self) -> usize {
        self.contacts.count()
    }

    /// Starts the inbound listener. Calling it again is a no-op.
    pub fn start(&mut self) {
        let poll = match self.poll.take() {
            Some(poll) => poll,
            None => return,
        };
        let server = Server {
            handler: Handler {
                id: self.id,
                wire: self.wire.clone(),
                contacts: self.contacts.clone(),
                peers: self.peers.clone(),
            },
            poll,
            shutdown: self.shutdown.clone(),
        };
        info!("listening on {:?} with id {}", self.wire.local_addr(), self.id);
        self.listener = Some(thread::spawn(move || server.run()));
    }

    /// Queries `seed` until the contact table holds enough nodes for the
    /// background loops, then starts them. Fails once the seed has
    /// accumulated more than `max_bootstrap_errors` unanswered queries.
    pub fn bootstrap(&mut self, seed: SocketAddrV4) -> Result<()> {
        info!("bootstrapping against {}", seed);
        self.contacts.update_node(None, Node::new(seed, None));

        while self.contacts.count() <= self.config.sample_count {
            // the listener may have resolved the seed entry to its real id
            // in the meantime; follow the endpoint either way
            let node = self
                .contacts
                .boot_node()
                .or_else(|| self.contacts.node_by_addr(&seed));
            let node = match node {
                Some(node) => node,
                None => self.contacts.update_node(None, Node::new(seed, None)),
            };
            {
                let mut node = node.lock().unwrap();
                if node.trans.len() > self.config.max_bootstrap_errors {
                    bail!(
                        "seed {} left {} queries unanswered, giving up",
                        seed,
                        node.trans.len()
                    );
                }
                node.find_node(&self.wire, &self.id, &self.id);
            }
            thread::sleep(self.config.bootstrap_iteration_timeout);
        }

        info!("bootstrap done, {} nodes known", self.contacts.count());
        self.running.store(true, Ordering::SeqCst);

        let running = self.running.clone();
        let contacts = self.contacts.clone();
        let wire = self.wire.clone();
        let id = self.id;
        let config = self.config.clone();
        self.finder = Some(thread::spawn(move || {
            discover_loop(running, contacts, wire, id, config)
        }));

        let running = self.running.clone();
        let contacts = self.contacts.clone();
        let wire = self.wire.clone();
        let id = self.id;
        let config = self.config.clone();
        self.sweeper = Some(thread::spawn(move || {
            sweep_loop(running, contacts, wire, id, config)
        }));

        Ok(())
    }

    /// Stops the loops, then the listener. Returns once all three
    /// background threads have exited.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(finder) = self.finder.take() {
            let _ = finder.join();
        }
        if let Some(sweeper) = self.sweeper.take() {
            let _ = sweeper.join();
        }
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(listener) = self.listener.take() {
            let _ = listener.join();
        }
        debug!("dht stopped");
    }
}

fn discover_loop(
    running: Arc<AtomicBool>,
    contacts: Arc<RoutingTable>,
    wire: Arc<Wire>,
    id: NodeId,
    config: Config,
) {
    debug!("entering iterative node finding loop");
    while running.load(Ordering::SeqCst) {
        find_round(&contacts, &wire, &id, &config);
        thread::sleep(config.find_iteration_timeout);
    }
    debug!("iterative node finding loop stopped");
}

/// One discovery round. Random targets spread learning across the key
/// space instead of clustering around our own id.
fn find_round(contacts: &RoutingTable, wire: &Wire, id: &NodeId, config: &Config) {
    for (_, node) in contacts.sample(config.sample_count) {
        let mut node = node.lock().unwrap();
        node.find_node(wire, id, &NodeId::random());
        if let Some(info_hash) = &config.search {
            node.get_peers(wire, id, info_hash);
        }
    }
    debug!("current known nodes count: {}", contacts.count());
}

fn sweep_loop(
    running: Arc<AtomicBool>,
    contacts: Arc<RoutingTable>,
    wire: Arc<Wire>,
    id: NodeId,
    config: Config,
) {
    debug!("garbage collector started");
    // idle until the table is big enough to be worth pruning
    while running.load(Ordering::SeqCst) && contacts.count() <= config.sample_count {
        thread::sleep(config.gc_iteration_timeout);
    }

    debug!("entering garbage collector loop");
    while running.load(Ordering::SeqCst) {
        sweep_round(&contacts, &wire, &id, &config);
        thread::sleep(config.gc_iteration_timeout);
    }
    debug!("garbage collector stopped");
}

/// One maintenance pass: stale nodes are pinged, and evicted once too
/// many of those queries stay unanswered.
fn sweep_round(contacts: &RoutingTable, wire: &Wire, id: &NodeId, config: &Config) {
    for (key, node) in contacts.sample(config.sample_count) {
        let evict = {
            let mut node = node.lock().unwrap();
            if node.last_access.elapsed() > config.gc_max_time {
                if node.trans.len() > config.gc_max_trans {
                    debug!(
                        "removing {} with {} unanswered queries",
                        node,
                        node.trans.len()
                    );
                    true
                } else {
                    node.ping(wire, id);
                    false
                }
            } else {
                false
            }
        };
        // the table lock nests outside node locks, so evict only after
        // the node guard is gone
        if evict {
            contacts.remove_node(&key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compact::{encode_nodes, CompactNode};
    use crate::krpc::Message;
    use crate::node::{Query, Transaction};
    use std::net::{Ipv4Addr, UdpSocket as StdUdpSocket};
    use std::time::Instant;

    fn quick_config() -> Config {
        Config {
            bootstrap_iteration_timeout: Duration::from_millis(10),
            find_iteration_timeout: Duration::from_millis(10),
            gc_iteration_timeout: Duration::from_millis(10),
            ..Config::default()
        }
    }

    fn v4(addr: SocketAddr) -> SocketAddrV4 {
        match addr {
            SocketAddr::V4(addr) => addr,
            SocketAddr::V6(_) => panic!("expected an IPv4 address"),
        }
    }

    fn pending(query: Query) -> Transaction {
        Transaction {
            query,
            issued_at: Instant::now(),
        }
    }

    #[test]
    fn test_bootstrap_dead_seed_fails_in_bounded_time() {
        let mut dht = Dht::new("127.0.0.1:0".parse().unwrap(), quick_config()).unwrap();
        dht.start();

        // udp port 1 is a black hole: sends succeed, nothing answers
        let seed = SocketAddrV4::new(Ipv4Addr::LOCALHOST, 1);
        assert!(dht.bootstrap(seed).is_err());
        // a repeated attempt against the same dead seed fails again
        assert!(dht.bootstrap(seed).is_err());
        assert!(dht.finder.is_none());
        assert!(dht.sweeper.is_none());

        dht.stop();
    }

    #[test]
    fn test_bootstrap_populates_table() {
        let seed_sock = StdUdpSocket::bind("127.0.0.1:0").unwrap();
        seed_sock
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let seed_addr = v4(seed_sock.local_addr().unwrap());
        let seed_id = NodeId::random();

        // a minimal seed: answer every find_node with 8 fresh entries
        let seed_thread = thread::spawn(move || {
            let mut buf = [0u8; 2048];
            while let Ok((len, src)) = seed_sock.recv_from(&mut buf) {
                let query = match Message::from_bytes(&buf[..len]) {
                    Ok(query) => query,
                    Err(_) => continue,
                };
                let entries: Vec<CompactNode> = (0..8u16)
                    .map(|i| CompactNode {
                        id: NodeId::random(),
                        addr: SocketAddrV4::new(Ipv4Addr::LOCALHOST, 40000 + i),
                    })
                    .collect();
                let reply = Message::found_node(&query.t, &seed_id, encode_nodes(&entries));
                let _ = seed_sock.send_to(&reply.to_bytes().unwrap(), src);
            }
        });

        let mut dht = Dht::new("127.0.0.1:0".parse().unwrap(), quick_config()).unwrap();
        dht.start();
        dht.bootstrap(seed_addr).unwrap();

        // 8 advertised entries plus the resolved seed itself
        assert!(dht.contacts.count() >= 9);
        assert!(dht.contacts.boot_node().is_none());
        assert!(dht.contacts.node_by_id(&seed_id).is_some());

        dht.stop();
        seed_thread.join().unwrap();
    }

    #[test]
    fn test_ping_round_trip_between_two_hosts() {
        let mut h1 = Dht::new("127.0.0.1:0".parse().unwrap(), quick_config()).unwrap();
        let mut h2 = Dht::new("127.0.0.1:0".parse().unwrap(), quick_config()).unwrap();
        h1.start();
        h2.start();

        let h2_addr = v4(h2.local_addr().unwrap());
        let node = h1
            .contacts
            .update_node(Some(h2.id), Node::new(h2_addr, Some(h2.id)));
        node.lock().unwrap().ping(&h1.wire, &h1.id);

        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let answered = node.lock().unwrap().trans.is_empty();
            let learned = h2.contacts.node_by_id(&h1.id).is_some();
            if answered && learned {
                break;
            }
            assert!(Instant::now() < deadline, "ping round trip never completed");
            thread::sleep(Duration::from_millis(25));
        }

        h1.stop();
        h2.stop();
    }

    #[test]
    fn test_sweep_evicts_stale_node_with_unanswered_queries() {
        let (wire, _poll) = Wire::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let contacts = RoutingTable::new();
        let id = NodeId::random();

        let stale = NodeId::random();
        let addr = SocketAddrV4::new(Ipv4Addr::LOCALHOST, 9);
        let node = contacts.update_node(Some(stale), Node::new(addr, Some(stale)));
        {
            let mut node = node.lock().unwrap();
            node.last_access = Instant::now() - Duration::from_secs(120);
            for i in 0..6u8 {
                node.trans.insert(vec![0, i], pending(Query::Ping));
            }
        }

        sweep_round(&contacts, &wire, &id, &Config::default());
        assert_eq!(contacts.count(), 0);
    }

    #[test]
    fn test_sweep_pings_stale_node_below_eviction_threshold() {
        let (wire, _poll) = Wire::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let contacts = RoutingTable::new();
        let id = NodeId::random();

        let stale = NodeId::random();
        let addr = SocketAddrV4::new(Ipv4Addr::LOCALHOST, 9);
        let node = contacts.update_node(Some(stale), Node::new(addr, Some(stale)));
        node.lock().unwrap().last_access = Instant::now() - Duration::from_secs(120);

        sweep_round(&contacts, &wire, &id, &Config::default());
        assert_eq!(contacts.count(), 1);
        // the pass left a ping behind instead of evicting
        assert_eq!(node.lock().unwrap().trans.len(), 1);
    }

    #[test]
    fn test_fresh_node_is_left_alone() {
        let (wire, _poll) = Wire::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let contacts = RoutingTable::new();
        let id = NodeId::random();

        let fresh = NodeId::random();
        let addr = SocketAddrV4::new(Ipv4Addr::LOCALHOST, 9);
        let node = contacts.update_node(Some(fresh), Node::new(addr, Some(fresh)));

        sweep_round(&contacts, &wire, &id, &Config::default());
        assert_eq!(contacts.count(), 1);
        assert!(node.lock().unwrap().trans.is_empty());
    }
}
