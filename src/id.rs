//! # Node Identifiers and Addresses
//!
//! Every participant of the overlay is identified by a [`NodeId`]: a 20-byte
//! hash with a base58 textual form. Stored values share the same 160-bit key
//! space ([`Key`]), which is what makes the XOR metric work for both peer
//! lookup and content lookup.
//!
//! ## Distance metric
//!
//! `distance(a, b) = a XOR b`, compared as a big-endian 160-bit integer.
//! [`bucket_index`] maps a pair of identifiers to the routing bucket that
//! holds their relationship: bucket `KEY_BIT_SIZE - 1` is the farthest half
//! of the key space, bucket `0` the closest sliver. Identical identifiers
//! have no differing bit and therefore no bucket.

use std::cmp::Ordering;
use std::fmt;
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

/// Length in bytes of a node identifier / storage key hash.
pub const NODE_HASH_LEN: usize = 20;

/// Number of bits in the key space; one routing bucket exists per bit.
pub const KEY_BIT_SIZE: usize = NODE_HASH_LEN * 8;

/// Storage keys live in the same 160-bit space as node identifiers.
pub type Key = [u8; NODE_HASH_LEN];

/// Compact alias for a node identifier, valid within one active node set.
pub type ShortId = u32;

/// A 20-byte overlay identifier with a base58 textual form.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId([u8; NODE_HASH_LEN]);

impl NodeId {
    /// The wildcard identifier: packets addressed to it are accepted by any
    /// origin of the receiving node.
    pub const WILDCARD: NodeId = NodeId([0u8; NODE_HASH_LEN]);

    pub fn from_bytes(bytes: [u8; NODE_HASH_LEN]) -> Self {
        Self(bytes)
    }

    /// Parse the base58 textual form. Fails on bad symbols or wrong length.
    pub fn from_base58(s: &str) -> Result<Self, IdParseError> {
        let bytes = bs58::decode(s)
            .into_vec()
            .map_err(|_| IdParseError::BadSymbol)?;
        if bytes.len() != NODE_HASH_LEN {
            return Err(IdParseError::BadLength(bytes.len()));
        }
        let mut arr = [0u8; NODE_HASH_LEN];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }

    pub fn to_base58(&self) -> String {
        bs58::encode(&self.0).into_string()
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; NODE_HASH_LEN] {
        &self.0
    }

    #[inline]
    pub fn hash_equal(&self, other: &[u8]) -> bool {
        self.0[..] == *other
    }

    pub fn is_wildcard(&self) -> bool {
        *self == Self::WILDCARD
    }

    #[inline]
    pub fn xor_distance(&self, other: &NodeId) -> Key {
        let mut out = [0u8; NODE_HASH_LEN];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        out
    }
}

impl From<Key> for NodeId {
    fn from(key: Key) -> Self {
        Self(key)
    }
}

impl From<NodeId> for Key {
    fn from(id: NodeId) -> Key {
        id.0
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", hex::encode(&self.0[..8]))
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_base58())
    }
}

/// Errors produced when parsing the textual identifier form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdParseError {
    BadSymbol,
    BadLength(usize),
}

impl fmt::Display for IdParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IdParseError::BadSymbol => write!(f, "identifier is not valid base58"),
            IdParseError::BadLength(len) => {
                write!(f, "identifier decodes to {} bytes, expected {}", len, NODE_HASH_LEN)
            }
        }
    }
}

impl std::error::Error for IdParseError {}

/// Compare two XOR distances as big-endian integers.
#[inline]
pub fn distance_cmp(a: &Key, b: &Key) -> Ordering {
    a.cmp(b)
}

/// Routing bucket index for the relationship between two identifiers.
///
/// The index is `KEY_BIT_SIZE - 1 - p` where `p` is the position of the
/// first differing bit read MSB-first, so a longer shared prefix lands in a
/// lower bucket. Returns `None` for identical identifiers.
pub fn bucket_index(a: &NodeId, b: &NodeId) -> Option<usize> {
    let dist = a.xor_distance(b);
    for (byte_idx, byte) in dist.iter().enumerate() {
        if *byte != 0 {
            let bit = byte_idx * 8 + byte.leading_zeros() as usize;
            return Some(KEY_BIT_SIZE - 1 - bit);
        }
    }
    None
}

/// A resolved network endpoint: host and port with a parsed IP.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Address(SocketAddr);

impl Address {
    /// Parse a `host:port` string. Unresolvable input is a configuration
    /// error and is fatal at the call sites that construct origins.
    pub fn new(addr: &str) -> anyhow::Result<Self> {
        let parsed: SocketAddr = addr
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid address {:?}: {}", addr, e))?;
        Ok(Self(parsed))
    }

    pub fn from_socket_addr(addr: SocketAddr) -> Self {
        Self(addr)
    }

    #[inline]
    pub fn socket_addr(&self) -> SocketAddr {
        self.0
    }

    pub fn ip_string(&self) -> String {
        self.0.ip().to_string()
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A peer as named in packets: identifier plus advertised endpoint.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct Peer {
    pub id: NodeId,
    pub address: Address,
}

impl Peer {
    pub fn new(id: NodeId, address: Address) -> Self {
        Self { id, address }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id_with_first_byte(b: u8) -> NodeId {
        let mut bytes = [0u8; NODE_HASH_LEN];
        bytes[0] = b;
        bytes[NODE_HASH_LEN - 1] = 1;
        NodeId::from_bytes(bytes)
    }

    #[test]
    fn base58_round_trip() {
        let id = id_with_first_byte(0xAB);
        let text = id.to_base58();
        let back = NodeId::from_base58(&text).unwrap();
        assert_eq!(id, back);
    }

    #[test]
    fn base58_rejects_wrong_length() {
        let text = bs58::encode(&[1u8; 8]).into_string();
        assert_eq!(NodeId::from_base58(&text), Err(IdParseError::BadLength(8)));
    }

    #[test]
    fn base58_rejects_bad_symbols() {
        assert_eq!(NodeId::from_base58("0OIl"), Err(IdParseError::BadSymbol));
    }

    #[test]
    fn distance_is_symmetric() {
        let a = id_with_first_byte(0x12);
        let b = id_with_first_byte(0x8F);
        assert_eq!(a.xor_distance(&b), b.xor_distance(&a));
    }

    #[test]
    fn bucket_index_from_first_differing_bit() {
        let zero = NodeId::from_bytes([0u8; NODE_HASH_LEN]);

        let mut top = [0u8; NODE_HASH_LEN];
        top[0] = 0x80;
        assert_eq!(bucket_index(&zero, &NodeId::from_bytes(top)), Some(KEY_BIT_SIZE - 1));

        let mut low = [0u8; NODE_HASH_LEN];
        low[NODE_HASH_LEN - 1] = 0x01;
        assert_eq!(bucket_index(&zero, &NodeId::from_bytes(low)), Some(0));
    }

    #[test]
    fn bucket_index_rejects_self() {
        let id = id_with_first_byte(7);
        assert_eq!(bucket_index(&id, &id), None);
    }

    #[test]
    fn address_parses_and_rejects() {
        let addr = Address::new("127.0.0.1:7081").unwrap();
        assert_eq!(addr.socket_addr().port(), 7081);
        assert_eq!(addr.ip_string(), "127.0.0.1");
        assert!(Address::new("not-an-endpoint").is_err());
    }
}
