use crate::compact::CompactNode;
use crate::id::{self, NodeId};
use crate::node::Node;
use log::debug;
use rand::seq::IteratorRandom;
use std::collections::HashMap;
use std::net::SocketAddrV4;
use std::sync::{Arc, Mutex};

/// Flat, unbounded map of known nodes. The `None` key is the bootstrap
/// seed before its real id is learned; at most one such entry exists.
/// Internally synchronised, every method is atomic with respect to the
/// table lock. Node locks nest inside the table lock, never the other way
/// around.
#[derive(Default)]
pub struct RoutingTable {
    nodes: Mutex<HashMap<Option<NodeId>, Arc<Mutex<Node>>>>,
}

impl RoutingTable {
    pub fn new() -> RoutingTable {
        RoutingTable::default()
    }

    /// Inserts or replaces the entry for `id`, returning the stored
    /// handle.
    pub fn update_node(&self, id: Option<NodeId>, node: Node) -> Arc<Mutex<Node>> {
        let node = Arc::new(Mutex::new(node));
        self.nodes.lock().unwrap().insert(id, node.clone());
        node
    }

    /// Removes the entry for `id`; absent ids are a no-op.
    pub fn remove_node(&self, id: &Option<NodeId>) {
        self.nodes.lock().unwrap().remove(id);
    }

    pub fn node_by_id(&self, id: &NodeId) -> Option<Arc<Mutex<Node>>> {
        self.nodes.lock().unwrap().get(&Some(*id)).cloned()
    }

    /// The unresolved bootstrap entry, if any.
    pub fn boot_node(&self) -> Option<Arc<Mutex<Node>>> {
        self.nodes.lock().unwrap().get(&None).cloned()
    }

    /// Finds the node holding endpoint `addr`. The bootstrap loop uses
    /// this to keep addressing the seed once its entry has moved to a real
    /// id.
    pub fn node_by_addr(&self, addr: &SocketAddrV4) -> Option<Arc<Mutex<Node>>> {
        let nodes = self.nodes.lock().unwrap();
        nodes
            .values()
            .find(|n| n.lock().unwrap().addr == *addr)
            .cloned()
    }

    /// Finds the node with transaction `t` outstanding. Covers responses
    /// from senders whose id we have not learned yet.
    pub fn node_by_trans(&self, t: &[u8]) -> Option<Arc<Mutex<Node>>> {
        let nodes = self.nodes.lock().unwrap();
        nodes
            .values()
            .find(|n| n.lock().unwrap().trans.contains_key(t))
            .cloned()
    }

    /// Up to `k` known nodes closest to `target`, ascending by xor
    /// distance. Only nodes with a resolved id qualify.
    pub fn get_close_nodes(&self, target: &NodeId, k: usize) -> Vec<CompactNode> {
        let candidates: Vec<(NodeId, SocketAddrV4)> = {
            let nodes = self.nodes.lock().unwrap();
            nodes
                .iter()
                .filter_map(|(id, n)| id.map(|id| (id, n.lock().unwrap().addr)))
                .collect()
        };
        id::closest(target, candidates, k)
            .into_iter()
            .map(|(id, addr)| CompactNode { id, addr })
            .collect()
    }

    /// Up to `k` distinct entries chosen uniformly at random. The
    /// unresolved bootstrap entry may be among them.
    pub fn sample(&self, k: usize) -> Vec<(Option<NodeId>, Arc<Mutex<Node>>)> {
        let nodes = self.nodes.lock().unwrap();
        nodes
            .iter()
            .map(|(id, n)| (*id, n.clone()))
            .choose_multiple(&mut rand::thread_rng(), k)
    }

    /// Number of nodes with a resolved id.
    pub fn count(&self) -> usize {
        self.nodes.lock().unwrap().keys().filter(|id| id.is_some()).count()
    }

    /// Replaces the unresolved bootstrap entry with `id`, carrying its
    /// pending transactions and access time over. Runs as one table-wide
    /// critical section so no lookup can observe both entries or neither.
    pub fn resolve_boot(&self, id: NodeId, addr: SocketAddrV4) {
        let mut nodes = self.nodes.lock().unwrap();
        if let Some(boot) = nodes.remove(&None) {
            let mut resolved = Node::new(addr, Some(id));
            {
                let mut boot = boot.lock().unwrap();
                resolved.trans = std::mem::take(&mut boot.trans);
                resolved.last_access = boot.last_access;
            }
            debug!("bootstrap seed resolved to {}", resolved);
            nodes.insert(Some(id), Arc::new(Mutex::new(resolved)));
        }
    }
}
