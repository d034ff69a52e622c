use crate::id::NodeId;
use serde::{Deserialize, Serialize};
use serde_bencode::value::Value;
use serde_bytes::ByteBuf;

/// One KRPC datagram: a bencoded dictionary discriminated by `y`. Fields
/// are declared in bencode key order so encoded dictionaries come out
/// sorted. Unknown keys are ignored on decode.
#[derive(Debug, Serialize, Deserialize)]
pub struct Message {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub a: Option<Args>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub e: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub q: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub r: Option<Reply>,
    #[serde(with = "serde_bytes")]
    pub t: Vec<u8>,
    pub y: String,
}

/// The `a` dictionary of a query.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Args {
    #[serde(with = "serde_bytes")]
    pub id: Vec<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "serde_bytes")]
    pub info_hash: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "serde_bytes")]
    pub target: Option<Vec<u8>>,
}

/// The `r` dictionary of a response. `token` comes back from get_peers
/// but is never used since this node does not announce.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Reply {
    #[serde(with = "serde_bytes")]
    pub id: Vec<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "serde_bytes")]
    pub ip: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "serde_bytes")]
    pub nodes: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "serde_bytes")]
    pub token: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub values: Option<Vec<ByteBuf>>,
}

impl Message {
    fn query(t: &[u8], name: &str, a: Args) -> Message {
        Message {
            a: Some(a),
            e: None,
            q: Some(name.to_string()),
            r: None,
            t: t.to_vec(),
            y: "q".to_string(),
        }
    }

    fn reply(t: &[u8], r: Reply) -> Message {
        Message {
            a: None,
            e: None,
            q: None,
            r: Some(r),
            t: t.to_vec(),
            y: "r".to_string(),
        }
    }

    pub fn ping(t: &[u8], id: &NodeId) -> Message {
        Message::query(
            t,
            "ping",
            Args {
                id: id.as_bytes().to_vec(),
                ..Args::default()
            },
        )
    }

    pub fn find_node(t: &[u8], id: &NodeId, target: &NodeId) -> Message {
        Message::query(
            t,
            "find_node",
            Args {
                id: id.as_bytes().to_vec(),
                target: Some(target.as_bytes().to_vec()),
                ..Args::default()
            },
        )
    }

    pub fn get_peers(t: &[u8], id: &NodeId, info_hash: &NodeId) -> Message {
        Message::query(
            t,
            "get_peers",
            Args {
                id: id.as_bytes().to_vec(),
                info_hash: Some(info_hash.as_bytes().to_vec()),
                ..Args::default()
            },
        )
    }

    /// Bare acknowledgement, also the answer to get_peers and
    /// announce_peer.
    pub fn pong(t: &[u8], id: &NodeId) -> Message {
        Message::reply(
            t,
            Reply {
                id: id.as_bytes().to_vec(),
                ..Reply::default()
            },
        )
    }

    /// find_node answer carrying an already compact-encoded node list.
    pub fn found_node(t: &[u8], id: &NodeId, nodes: Vec<u8>) -> Message {
        Message::reply(
            t,
            Reply {
                id: id.as_bytes().to_vec(),
                nodes: Some(nodes),
                ..Reply::default()
            },
        )
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_bencode::Error> {
        serde_bencode::to_bytes(self)
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Message, serde_bencode::Error> {
        serde_bencode::from_bytes(buf)
    }
}
