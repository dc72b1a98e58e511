//! # Pulsenet - Pulse-Driven Distributed Network Core
//!
//! Pulsenet is the peer-to-peer backbone of a pulse-driven distributed
//! platform:
//!
//! - **Overlay**: Kademlia-style DHT over 20-byte identifiers with K=20
//!   buckets and α=3 iterative lookups
//! - **Transport**: framed packets over reliable byte streams with
//!   request-ID correlated futures
//! - **Reachability**: echo-key authentication, relay forwarding for
//!   indirectly reachable peers, subnet analysis and proxy election
//! - **Membership**: discovery bootstrap with genesis exchange, and a
//!   pulse-driven three-phase consensus over the active node set
//! - **Coordination**: deterministic per-pulse role selection mapping
//!   (entropy, object) to executor and validator references
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `id` | Node identifiers, addresses, XOR distance |
//! | `crypto` | `CryptoScheme` seam, default blake3/Ed25519 scheme, entropy selection |
//! | `packet` | Wire packets, stable type codes, typed payloads |
//! | `transport` | TCP packet transport, response futures, stop signal |
//! | `routing` | K-bucket routing tables with liveness-checked eviction |
//! | `store` | Content store with replication and expiration deadlines |
//! | `relay` | Relay client set and proxy rotation |
//! | `dht` | Iterative queries, packet dispatch, auth/relay/subnet add-ons |
//! | `bootstrap` | Discovery bootstrap and genesis exchange |
//! | `consensus` | Pulses, claims, merkle proofs, three-phase membership |
//! | `coordinator` | Deterministic role selection per pulse |
//!
//! ## Concurrency Model
//!
//! Components own their state behind cheap-to-clone handles; packet and
//! maintenance loops are plain tasks that exit on the transport's stop
//! signal. Handlers never hold a lock across a network send.

pub mod bootstrap;
pub mod consensus;
pub mod coordinator;
pub mod crypto;
pub mod dht;
pub mod id;
pub mod packet;
pub mod relay;
pub mod routing;
pub mod store;
pub mod transport;

pub use crypto::{CryptoScheme, PlatformScheme};
pub use dht::{BootstrapEntry, DhtConfig, DhtNode, Origin};
pub use id::{Address, Key, NodeId, Peer, ShortId, KEY_BIT_SIZE, NODE_HASH_LEN};
pub use packet::{Packet, PacketType};
pub use transport::{TcpTransport, Transport};
