use crate::id::{NodeId, ID_LEN};
use byteorder::{BigEndian, ReadBytesExt};
use std::io::{self, Cursor, ErrorKind, Read};
use std::net::{Ipv4Addr, SocketAddrV4};

/// 20-byte id, 4-byte IPv4 address, 2-byte port, all in network order
pub const NODE_ENTRY_LEN: usize = 26;
/// 4-byte IPv4 address, 2-byte port
pub const PEER_ENTRY_LEN: usize = 6;

/// One entry of a compact node list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompactNode {
    pub id: NodeId,
    pub addr: SocketAddrV4,
}

/// Parses a concatenation of 26-byte node entries. The length must be an
/// exact multiple of the entry size.
pub fn decode_nodes(buf: &[u8]) -> io::Result<Vec<CompactNode>> {
    if buf.len() % NODE_ENTRY_LEN != 0 {
        return Err(io::Error::new(
            ErrorKind::InvalidData,
            format!(
                "compact node list of {} bytes is not a multiple of {}",
                buf.len(),
                NODE_ENTRY_LEN
            ),
        ));
    }
    let mut nodes = Vec::with_capacity(buf.len() / NODE_ENTRY_LEN);
    let mut rdr = Cursor::new(buf);
    for _ in 0..buf.len() / NODE_ENTRY_LEN {
        let mut id = [0u8; ID_LEN];
        rdr.read_exact(&mut id)?;
        let ip = rdr.read_u32::<BigEndian>()?;
        let port = rdr.read_u16::<BigEndian>()?;
        nodes.push(CompactNode {
            id: NodeId(id),
            addr: SocketAddrV4::new(Ipv4Addr::from(ip), port),
        });
    }
    Ok(nodes)
}

pub fn encode_nodes(nodes: &[CompactNode]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(nodes.len() * NODE_ENTRY_LEN);
    for node in nodes {
        buf.extend_from_slice(node.id.as_bytes());
        buf.extend_from_slice(&node.addr.ip().octets());
        buf.extend_from_slice(&node.addr.port().to_be_bytes());
    }
    buf
}

/// Parses a 6-byte compact peer entry.
pub fn decode_peer(buf: &[u8]) -> io::Result<SocketAddrV4> {
    if buf.len() != PEER_ENTRY_LEN {
        return Err(io::Error::new(
            ErrorKind::InvalidData,
            format!("compact peer entry should be {} bytes long", PEER_ENTRY_LEN),
        ));
    }
    let mut rdr = Cursor::new(buf);
    let ip = rdr.read_u32::<BigEndian>()?;
    let port = rdr.read_u16::<BigEndian>()?;
    Ok(SocketAddrV4::new(Ipv4Addr::from(ip), port))
}

pub fn encode_peer(addr: &SocketAddrV4) -> [u8; PEER_ENTRY_LEN] {
    let mut buf = [0u8; PEER_ENTRY_LEN];
    buf[..4].copy_from_slice(&addr.ip().octets());
    buf[4..].copy_from_slice(&addr.port().to_be_bytes());
    buf
}
