use crate::id::NodeId;
use crate::krpc::Message;
use crate::server::Wire;
use rand::Rng;
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddrV4;
use std::time::Instant;

/// Queries this node issues. Inbound responses are dispatched by the kind
/// recorded here. announce_peer is answered but never sent, so it has no
/// outbound kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Query {
    Ping,
    FindNode,
    GetPeers,
}

/// An outstanding query a remote node owes us an answer to.
#[derive(Debug, Clone)]
pub struct Transaction {
    pub query: Query,
    pub issued_at: Instant,
}

/// State kept per remote peer. `id` is `None` for the bootstrap seed until
/// its first reply reveals the real id.
#[derive(Debug)]
pub struct Node {
    pub id: Option<NodeId>,
    pub addr: SocketAddrV4,
    /// last inbound activity; our own sends do not bump this, otherwise
    /// maintenance pings would reset the eviction clock
    pub last_access: Instant,
    /// outstanding queries keyed by transaction id
    pub trans: HashMap<Vec<u8>, Transaction>,
}

impl Node {
    pub fn new(addr: SocketAddrV4, id: Option<NodeId>) -> Node {
        Node {
            id,
            addr,
            last_access: Instant::now(),
            trans: HashMap::new(),
        }
    }

    pub fn update_access(&mut self) {
        self.last_access = Instant::now();
    }

    /// Removes transaction `t`; absent ids are a no-op.
    pub fn delete_trans(&mut self, t: &[u8]) {
        self.trans.remove(t);
    }

    pub fn ping(&mut self, wire: &Wire, sender: &NodeId) {
        let t = self.record(Query::Ping);
        self.transmit(wire, &Message::ping(&t, sender), "ping");
    }

    pub fn find_node(&mut self, wire: &Wire, sender: &NodeId, target: &NodeId) {
        let t = self.record(Query::FindNode);
        self.transmit(wire, &Message::find_node(&t, sender, target), "find_node");
    }

    pub fn get_peers(&mut self, wire: &Wire, sender: &NodeId, info_hash: &NodeId) {
        let t = self.record(Query::GetPeers);
        self.transmit(wire, &Message::get_peers(&t, sender, info_hash), "get_peers");
    }

    /// Acknowledges an inbound query, echoing its transaction id.
    pub fn pong(&self, wire: &Wire, t: &[u8], sender: &NodeId) {
        self.transmit(wire, &Message::pong(t, sender), "pong");
    }

    /// Answers a find_node query with an already compact-encoded node
    /// list, echoing the inbound transaction id.
    pub fn found_node(&self, wire: &Wire, nodes: Vec<u8>, t: &[u8], sender: &NodeId) {
        self.transmit(wire, &Message::found_node(t, sender, nodes), "found_node");
    }

    /// Picks a short transaction id not currently outstanding on this node
    /// and records the query under it.
    fn record(&mut self, query: Query) -> Vec<u8> {
        let mut rng = rand::thread_rng();
        let t = loop {
            let t: [u8; 2] = rng.gen();
            if !self.trans.contains_key(&t[..]) {
                break t.to_vec();
            }
        };
        self.trans.insert(
            t.clone(),
            Transaction {
                query,
                issued_at: Instant::now(),
            },
        );
        t
    }

    // a failed send stays recorded: if no reply ever comes the maintenance
    // loop ages this node out
    fn transmit(&self, wire: &Wire, msg: &Message, what: &str) {
        if let Err(e) = wire.send(msg, self.addr.into()) {
            log::warn!("failed to send {} to {}: {}", what, self, e);
        }
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.id {
            Some(id) => write!(f, "{}@{}", id, self.addr),
            None => write!(f, "seed@{}", self.addr),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn throwaway_wire() -> std::sync::Arc<Wire> {
        let (wire, _poll) = Wire::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        wire
    }

    fn discard_addr() -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::LOCALHOST, 9)
    }

    #[test]
    fn test_send_records_transaction() {
        let wire = throwaway_wire();
        let mut node = Node::new(discard_addr(), Some(NodeId::random()));
        node.ping(&wire, &NodeId::random());
        assert_eq!(node.trans.len(), 1);
        let trans = node.trans.values().next().unwrap();
        assert_eq!(trans.query, Query::Ping);
    }

    #[test]
    fn test_transaction_ids_are_unique() {
        let wire = throwaway_wire();
        let sender = NodeId::random();
        let mut node = Node::new(discard_addr(), Some(NodeId::random()));
        node.ping(&wire, &sender);
        node.find_node(&wire, &sender, &NodeId::random());
        node.get_peers(&wire, &sender, &NodeId::random());
        assert_eq!(node.trans.len(), 3);
    }

    #[test]
    fn test_replies_record_nothing() {
        let wire = throwaway_wire();
        let node = Node::new(discard_addr(), Some(NodeId::random()));
        node.pong(&wire, b"aa", &NodeId::random());
        node.found_node(&wire, vec![], b"aa", &NodeId::random());
        assert!(node.trans.is_empty());
    }

    #[test]
    fn test_delete_trans_absent_is_noop() {
        let wire = throwaway_wire();
        let mut node = Node::new(discard_addr(), Some(NodeId::random()));
        node.ping(&wire, &NodeId::random());
        node.delete_trans(b"no-such-id");
        assert_eq!(node.trans.len(), 1);
    }
}
