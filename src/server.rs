use crate::compact::{decode_nodes, decode_peer, encode_nodes};
use crate::id::NodeId;
use crate::krpc::Message;
use crate::node::{Node, Query};
use crate::table::RoutingTable;
use anyhow::{Context, Result};
use log::{debug, error, info, warn};
use mio::net::UdpSocket;
use mio::{Events, Interest, Poll, Token};
use std::io::ErrorKind;
use std::net::{SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const LISTENER: Token = Token(0);
/// how long the listener blocks before rechecking the shutdown flag
const POLL_INTERVAL: Duration = Duration::from_millis(250);
/// individual messages fit in one ethernet frame
const RECV_BUF_LEN: usize = 2048;
/// a find_node answer carries at most this many entries
const FOUND_NODES: usize = 8;

/// The shared UDP socket. Writes serialise on the send lock; the
/// listener's read path does not take it.
pub struct Wire {
    socket: UdpSocket,
    send_lock: Mutex<()>,
}

impl Wire {
    /// Binds a non-blocking socket and registers it with a fresh poll for
    /// the listener thread.
    pub fn bind(addr: SocketAddr) -> Result<(Arc<Wire>, Poll)> {
        let mut socket =
            UdpSocket::bind(addr).with_context(|| format!("failed to bind {}", addr))?;
        let poll = Poll::new()?;
        poll.registry()
            .register(&mut socket, LISTENER, Interest::READABLE)?;
        Ok((
            Arc::new(Wire {
                socket,
                send_lock: Mutex::new(()),
            }),
            poll,
        ))
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub fn send(&self, msg: &Message, addr: SocketAddr) -> Result<()> {
        let buf = msg.to_bytes()?;
        let _guard = self.send_lock.lock().unwrap();
        self.socket.send_to(&buf, addr)?;
        Ok(())
    }

    fn recv(&self, buf: &mut [u8]) -> std::io::Result<(usize, SocketAddr)> {
        self.socket.recv_from(buf)
    }
}

/// Inbound datagram dispatch: decodes each datagram and routes it by its
/// message kind. Recoverable problems are logged and dropped, never
/// propagated.
pub struct Handler {
    pub id: NodeId,
    pub wire: Arc<Wire>,
    pub contacts: Arc<RoutingTable>,
    pub peers: Arc<RoutingTable>,
}

impl Handler {
    pub fn handle(&self, src: SocketAddr, buf: &[u8]) {
        let msg = match Message::from_bytes(buf) {
            Ok(msg) => msg,
            Err(e) => {
                debug!("dropping malformed datagram from {}: {}", src, e);
                return;
            }
        };
        match msg.y.as_str() {
            "q" => self.handle_query(src, msg),
            "r" => self.handle_response(src, msg),
            "e" => info!("error reply from {}: {:?}", src, msg.e),
            other => warn!("unknown message kind {:?} from {}", other, src),
        }
    }

    fn handle_query(&self, src: SocketAddr, msg: Message) {
        let addr = match ipv4(src) {
            Some(addr) => addr,
            None => {
                debug!("ignoring query from non-IPv4 source {}", src);
                return;
            }
        };
        let (query, args) = match (&msg.q, &msg.a) {
            (Some(query), Some(args)) => (query, args),
            _ => {
                debug!("dropping query from {} without q or a", src);
                return;
            }
        };
        let id = match NodeId::from_slice(&args.id) {
            Some(id) => id,
            None => {
                debug!("dropping query from {} with a bad sender id", src);
                return;
            }
        };

        let node = match self.contacts.node_by_id(&id) {
            Some(node) => node,
            None => {
                debug!("learned node {} at {} from its query", id, addr);
                self.contacts
                    .update_node(Some(id), Node::new(addr, Some(id)))
            }
        };
        node.lock().unwrap().update_access();

        match query.as_str() {
            "ping" => node.lock().unwrap().pong(&self.wire, &msg.t, &self.id),
            "find_node" => {
                let target = match args.target.as_deref().and_then(NodeId::from_slice) {
                    Some(target) => target,
                    None => {
                        debug!("dropping find_node from {} with a bad target", src);
                        return;
                    }
                };
                let close = self.contacts.get_close_nodes(&target, FOUND_NODES);
                node.lock()
                    .unwrap()
                    .found_node(&self.wire, encode_nodes(&close), &msg.t, &self.id);
            }
            // acknowledged only: no peer store and no announce tokens
            "get_peers" | "announce_peer" => {
                node.lock().unwrap().pong(&self.wire, &msg.t, &self.id)
            }
            other => warn!("unknown query type {:?} from {}", other, src),
        }
    }

    fn handle_response(&self, src: SocketAddr, msg: Message) {
        let reply = match &msg.r {
            Some(reply) => reply,
            None => {
                debug!("dropping response from {} without r", src);
                return;
            }
        };

        // correlate by sender id first, then by transaction scan; the scan
        // covers the unresolved seed and nodes replaced mid round-trip
        let by_id = NodeId::from_slice(&reply.id).and_then(|id| self.contacts.node_by_id(&id));
        let node = match by_id.or_else(|| self.contacts.node_by_trans(&msg.t)) {
            Some(node) => node,
            None => {
                warn!(
                    "orphan response from {}, no node owns transaction {:02x?}",
                    src, msg.t
                );
                return;
            }
        };

        let trans = match node.lock().unwrap().trans.remove(&msg.t) {
            Some(trans) => trans,
            None => {
                warn!(
                    "response from {} for unknown transaction {:02x?}",
                    src, msg.t
                );
                return;
            }
        };

        // some peers echo our observed address; noted, nothing more
        if let Some(ip) = &reply.ip {
            if let Ok(observed) = decode_peer(ip) {
                debug!("{} reports our address as {}", src, observed);
            }
        }

        match trans.query {
            Query::Ping => node.lock().unwrap().update_access(),
            Query::FindNode => {
                node.lock().unwrap().update_access();
                if let Some(blob) = &reply.nodes {
                    self.learn_nodes(blob, &self.contacts, src);
                }
            }
            Query::GetPeers => {
                node.lock().unwrap().update_access();
                if let Some(values) = &reply.values {
                    for value in values {
                        match decode_peer(value) {
                            Ok(peer) => info!("discovered peer {}", peer),
                            Err(e) => debug!("bad compact peer from {}: {}", src, e),
                        }
                    }
                }
                if let Some(blob) = &reply.nodes {
                    self.learn_nodes(blob, &self.peers, src);
                }
            }
        }

        // the first reply from the bootstrap seed reveals its real id;
        // move its entry over together with the outstanding transactions
        let unresolved = node.lock().unwrap().id.is_none();
        if unresolved {
            match (NodeId::from_slice(&reply.id), ipv4(src)) {
                (Some(id), Some(addr)) => self.contacts.resolve_boot(id, addr),
                _ => warn!("seed reply from {} carries an invalid id", src),
            }
        }
    }

    fn learn_nodes(&self, blob: &[u8], table: &RoutingTable, src: SocketAddr) {
        match decode_nodes(blob) {
            Ok(found) => {
                for entry in found {
                    debug!("adding {} at {} advertised by {}", entry.id, entry.addr, src);
                    table.update_node(Some(entry.id), Node::new(entry.addr, Some(entry.id)));
                }
            }
            Err(e) => warn!("bad compact node list from {}: {}", src, e),
        }
    }
}

/// Listener thread body: polls the socket, drains datagrams, dispatches
/// each one, and exits once `shutdown` is set.
pub struct Server {
    pub handler: Handler,
    pub poll: Poll,
    pub shutdown: Arc<AtomicBool>,
}

impl Server {
    pub fn run(mut self) {
        let mut events = Events::with_capacity(64);
        let mut buf = [0u8; RECV_BUF_LEN];

        while !self.shutdown.load(Ordering::SeqCst) {
            if let Err(e) = self.poll.poll(&mut events, Some(POLL_INTERVAL)) {
                if e.kind() == ErrorKind::Interrupted {
                    continue;
                }
                error!("poll failed: {}", e);
                break;
            }
            loop {
                match self.handler.wire.recv(&mut buf) {
                    Ok((len, src)) => self.handler.handle(src, &buf[..len]),
                    Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                    Err(e) => {
                        warn!("recv failed: {}", e);
                        break;
                    }
                }
            }
        }
        debug!("listener stopped");
    }
}

fn ipv4(addr: SocketAddr) -> Option<SocketAddrV4> {
    match addr {
        SocketAddr::V4(addr) => Some(addr),
        SocketAddr::V6(_) => None,
    }
}
