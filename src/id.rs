use rand::Rng;
use std::fmt;

pub const ID_LEN: usize = 20;

/// 160-bit identifier addressing a DHT participant. Info-hashes live in
/// the same key space, so lookups reuse this type.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub [u8; ID_LEN]);

/// Xor of two ids, ordered as a big-endian unsigned 160-bit integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Distance([u8; ID_LEN]);

impl NodeId {
    pub fn random() -> NodeId {
        let mut id = [0u8; ID_LEN];
        let mut rng = rand::thread_rng();
        rng.fill(&mut id);
        NodeId(id)
    }

    pub fn from_slice(bytes: &[u8]) -> Option<NodeId> {
        if bytes.len() != ID_LEN {
            return None;
        }
        let mut id = [0u8; ID_LEN];
        id.copy_from_slice(bytes);
        Some(NodeId(id))
    }

    /// Parses a 40-character hex string, e.g. an info-hash from the command
    /// line.
    pub fn from_hex(s: &str) -> Option<NodeId> {
        if s.len() != 2 * ID_LEN {
            return None;
        }
        let mut id = [0u8; ID_LEN];
        for (i, chunk) in s.as_bytes().chunks(2).enumerate() {
            let chunk = std::str::from_utf8(chunk).ok()?;
            id[i] = u8::from_str_radix(chunk, 16).ok()?;
        }
        Some(NodeId(id))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn distance(&self, other: &NodeId) -> Distance {
        let mut d = [0u8; ID_LEN];
        for i in 0..ID_LEN {
            d[i] = self.0[i] ^ other.0[i];
        }
        Distance(d)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self)
    }
}

/// Up to `k` candidates closest to `target`, ascending by xor distance,
/// ties broken by id bytes.
pub fn closest<T>(target: &NodeId, mut candidates: Vec<(NodeId, T)>, k: usize) -> Vec<(NodeId, T)> {
    candidates.sort_by_key(|c| (target.distance(&c.0), c.0));
    candidates.truncate(k);
    candidates
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_distance_symmetric() {
        let a = NodeId::random();
        let b = NodeId::random();
        assert_eq!(a.distance(&b), b.distance(&a));
    }

    #[test]
    fn test_distance_to_self_is_zero() {
        let a = NodeId::random();
        assert_eq!(a.distance(&a), Distance([0u8; ID_LEN]));
    }

    #[test]
    fn test_distance_xor_identity() {
        // for the xor metric, d(a, c) is exactly d(a, b) xor d(b, c)
        let a = NodeId::random();
        let b = NodeId::random();
        let c = NodeId::random();
        let ab = a.distance(&b);
        let bc = b.distance(&c);
        let mut combined = [0u8; ID_LEN];
        for i in 0..ID_LEN {
            combined[i] = ab.0[i] ^ bc.0[i];
        }
        assert_eq!(a.distance(&c), Distance(combined));
    }

    #[test]
    fn test_closest_orders_by_distance() {
        let target = NodeId([0u8; ID_LEN]);
        let mut near = [0u8; ID_LEN];
        near[ID_LEN - 1] = 1;
        let mut mid = [0u8; ID_LEN];
        mid[ID_LEN - 1] = 4;
        let mut far = [0u8; ID_LEN];
        far[0] = 0x80;

        let candidates = vec![
            (NodeId(far), "far"),
            (NodeId(near), "near"),
            (NodeId(mid), "mid"),
        ];
        let picked = closest(&target, candidates, 2);
        assert_eq!(picked.len(), 2);
        assert_eq!(picked[0].1, "near");
        assert_eq!(picked[1].1, "mid");
    }

    #[test]
    fn test_closest_caps_at_k() {
        let target = NodeId::random();
        let candidates: Vec<(NodeId, ())> = (0..10).map(|_| (NodeId::random(), ())).collect();
        assert_eq!(closest(&target, candidates, 3).len(), 3);
    }

    #[test]
    fn test_from_hex() {
        let id = NodeId::random();
        let hex = format!("{}", id);
        assert_eq!(NodeId::from_hex(&hex), Some(id));
        assert_eq!(NodeId::from_hex("deadbeef"), None);
        assert_eq!(NodeId::from_hex(&"zz".repeat(ID_LEN)), None);
    }

    #[test]
    fn test_from_slice_rejects_wrong_length() {
        assert!(NodeId::from_slice(&[0u8; 19]).is_none());
        assert!(NodeId::from_slice(&[0u8; 21]).is_none());
        assert!(NodeId::from_slice(&[0u8; 20]).is_some());
    }
}
