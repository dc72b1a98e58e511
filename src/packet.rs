//! # Wire Packets
//!
//! Everything that crosses the wire is a [`Packet`]: sender and receiver
//! peers, a stable numeric [`PacketType`], a request identifier for
//! response correlation, a typed payload union and an optional error string.
//! Field order is fixed; the encoded form is the field sequence as written.
//!
//! ## Type codes
//!
//! | Type | Code | Type | Code |
//! |------|------|------|------|
//! | Ping | 1 | CheckOrigin | 8 |
//! | FindNode | 2 | ObtainIp | 9 |
//! | FindValue | 3 | RelayOwnership | 10 |
//! | Store | 4 | KnownOuterNodes | 11 |
//! | Rpc | 5 | Bootstrap | 12 |
//! | Relay | 6 | Genesis | 13 |
//! | Auth | 7 | | |
//!
//! Codes are part of the wire contract and must never be renumbered.
//!
//! All deserialization goes through [`deserialize_packet`], which enforces a
//! size limit before decoding.

use bincode::Options;
use serde::{Deserialize, Serialize};

use crate::id::{Key, NodeId, Peer, ShortId};

/// Upper bound on an encoded packet. Larger frames are rejected before
/// decoding.
pub const MAX_PACKET_SIZE: usize = 2 * 1024 * 1024;

fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_PACKET_SIZE as u64)
        .with_fixint_encoding()
}

pub fn serialize_packet(packet: &Packet) -> Result<Vec<u8>, bincode::Error> {
    bincode_options().serialize(packet)
}

pub fn deserialize_packet(bytes: &[u8]) -> Result<Packet, bincode::Error> {
    bincode_options().deserialize(bytes)
}

/// Packet type with stable numeric codes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
#[repr(u8)]
pub enum PacketType {
    Ping = 1,
    FindNode = 2,
    FindValue = 3,
    Store = 4,
    Rpc = 5,
    Relay = 6,
    Auth = 7,
    CheckOrigin = 8,
    ObtainIp = 9,
    RelayOwnership = 10,
    KnownOuterNodes = 11,
    Bootstrap = 12,
    Genesis = 13,
}

impl From<PacketType> for u8 {
    fn from(t: PacketType) -> u8 {
        t as u8
    }
}

impl TryFrom<u8> for PacketType {
    type Error = String;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        match code {
            1 => Ok(PacketType::Ping),
            2 => Ok(PacketType::FindNode),
            3 => Ok(PacketType::FindValue),
            4 => Ok(PacketType::Store),
            5 => Ok(PacketType::Rpc),
            6 => Ok(PacketType::Relay),
            7 => Ok(PacketType::Auth),
            8 => Ok(PacketType::CheckOrigin),
            9 => Ok(PacketType::ObtainIp),
            10 => Ok(PacketType::RelayOwnership),
            11 => Ok(PacketType::KnownOuterNodes),
            12 => Ok(PacketType::Bootstrap),
            13 => Ok(PacketType::Genesis),
            other => Err(format!("unknown packet type code {}", other)),
        }
    }
}

/// Relay protocol commands.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RelayCommand {
    Start,
    Stop,
}

/// Authentication protocol commands.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuthCommand {
    Begin,
    Revoke,
}

/// Relay request outcome as carried on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RelayState {
    Started,
    Stopped,
    NoAuth,
    Unknown,
    Error,
}

/// Discovery bootstrap outcome.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum BootstrapCode {
    Accepted,
    Rejected { reason: String },
    Redirected { host: String },
}

/// Static role a node announces during discovery.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StaticRole {
    Virtual,
    LightMaterial,
    HeavyMaterial,
    Unknown,
}

/// Wire form of a node's self-description, exchanged during genesis.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeStruct {
    pub id: NodeId,
    pub short_id: ShortId,
    pub role: StaticRole,
    pub public_key: Vec<u8>,
    pub address: String,
    pub version: String,
}

/// Request payloads, one variant per request-bearing packet type.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum RequestData {
    Ping,
    FindNode { target: Key },
    FindValue { target: Key },
    Store { data: Vec<u8> },
    Rpc { method: String, args: Vec<Vec<u8>> },
    Relay { command: RelayCommand },
    Auth { command: AuthCommand },
    CheckOrigin,
    ObtainIp,
    RelayOwnership { ready: bool },
    KnownOuterNodes { id: NodeId, outer_nodes: usize },
    Bootstrap,
    Genesis { last_pulse: u32, discovery: NodeStruct },
}

impl RequestData {
    pub fn packet_type(&self) -> PacketType {
        match self {
            RequestData::Ping => PacketType::Ping,
            RequestData::FindNode { .. } => PacketType::FindNode,
            RequestData::FindValue { .. } => PacketType::FindValue,
            RequestData::Store { .. } => PacketType::Store,
            RequestData::Rpc { .. } => PacketType::Rpc,
            RequestData::Relay { .. } => PacketType::Relay,
            RequestData::Auth { .. } => PacketType::Auth,
            RequestData::CheckOrigin => PacketType::CheckOrigin,
            RequestData::ObtainIp => PacketType::ObtainIp,
            RequestData::RelayOwnership { .. } => PacketType::RelayOwnership,
            RequestData::KnownOuterNodes { .. } => PacketType::KnownOuterNodes,
            RequestData::Bootstrap => PacketType::Bootstrap,
            RequestData::Genesis { .. } => PacketType::Genesis,
        }
    }
}

/// Response payloads. `Store` requests are fire-and-forget and have none.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ResponseData {
    Ping,
    FindNode {
        closest: Vec<Peer>,
    },
    FindValue {
        value: Option<Vec<u8>>,
        closest: Vec<Peer>,
    },
    Rpc {
        success: bool,
        result: Vec<u8>,
        error: String,
    },
    Relay {
        state: RelayState,
    },
    Auth {
        success: bool,
        key: Vec<u8>,
    },
    CheckOrigin {
        key: Vec<u8>,
    },
    ObtainIp {
        ip: String,
    },
    RelayOwnership {
        accepted: bool,
    },
    KnownOuterNodes {
        id: NodeId,
        outer_nodes: usize,
    },
    Bootstrap {
        code: BootstrapCode,
    },
    Genesis {
        last_pulse: u32,
        discovery: Option<NodeStruct>,
        error: String,
    },
}

/// Payload union: either a request or the response correlated to one.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum PacketData {
    Request(RequestData),
    Response(ResponseData),
}

/// A single overlay packet. Field order defines the wire layout.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Packet {
    pub sender: Peer,
    pub receiver: Peer,
    pub kind: PacketType,
    pub request_id: u64,
    /// Source endpoint as observed by the receiving transport. Never trusted
    /// from the sender; overwritten on receipt.
    pub remote_address: Option<String>,
    pub data: PacketData,
    pub error: Option<String>,
}

impl Packet {
    /// Build a request packet. The transport assigns the request identifier
    /// at send time.
    pub fn request(sender: Peer, receiver: Peer, data: RequestData) -> Self {
        Self {
            sender,
            receiver,
            kind: data.packet_type(),
            request_id: 0,
            remote_address: None,
            data: PacketData::Request(data),
            error: None,
        }
    }

    /// Build the response to `request`, addressed back at its sender.
    pub fn response(sender: Peer, request: &Packet, data: ResponseData) -> Self {
        Self {
            sender,
            receiver: request.sender,
            kind: request.kind,
            request_id: request.request_id,
            remote_address: None,
            data: PacketData::Response(data),
            error: None,
        }
    }

    /// Attach an error string to a response.
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    /// A packet is for me when its receiver hashes-equal one of my origin
    /// identifiers, or when the receiver is the wildcard.
    pub fn is_for_me(&self, origin_ids: &[NodeId]) -> bool {
        self.receiver.id.is_wildcard() || origin_ids.iter().any(|id| *id == self.receiver.id)
    }

    pub fn is_response(&self) -> bool {
        matches!(self.data, PacketData::Response(_))
    }
}
