//! # DHT Engine
//!
//! The node's view of the overlay: per-origin routing tables, the content
//! store, and the packet state machine that ties them to the transport.
//!
//! ## Iterative queries
//!
//! Four query kinds share one loop ([`DhtNode::iterate`]): `Store`,
//! `FindNode`, `FindValue` and `Bootstrap`. Each round contacts at most α
//! uncontacted members of the route set, merges the responses, re-sorts by
//! XOR distance and stops once a round brings no closer node — after a final
//! `query_rest` sweep that contacts every remaining member once.
//!
//! ## Overlay add-ons
//!
//! - **Echo-key authentication**: `Auth(Begin)` hands the caller a random
//!   512-byte key; the callee then proves the caller's origin by reading the
//!   key back over `CheckOrigin`.
//! - **Relay**: authenticated peers may register as relay clients; packets
//!   from their addresses that name a third-party receiver are
//!   re-encapsulated and forwarded.
//! - **Subnet analysis**: after `ObtainIp` sweeps, the node derives its home
//!   subnet, counts outer peers and gossips `KnownOuterNodes` to elect a
//!   well-connected candidate proxy.
//!
//! ## Maintenance
//!
//! A once-per-second tick drives bucket refresh (stale buckets trigger a
//! bootstrap iterate toward a random in-bucket identifier), replication of
//! published keys and expiration of stale records.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Result};
use rand::RngCore;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, info, trace, warn};

use crate::crypto::CryptoScheme;
use crate::id::{bucket_index, distance_cmp, Address, Key, NodeId, Peer};
use crate::packet::{
    AuthCommand, Packet, PacketData, PacketType, RelayCommand, RelayState, RequestData,
    ResponseData,
};
use crate::relay::{Proxy, Relay};
use crate::routing::{RoutingTable, UpsertOutcome, MAX_CONTACTS_IN_BUCKET, PARALLEL_CALLS};
use crate::store::ContentStore;
use crate::transport::Transport;

/// Size of the random key exchanged by the authentication handshake.
const AUTH_KEY_SIZE: usize = 512;

/// Hard ceiling on iterate rounds; a healthy lookup converges in a handful.
const MAX_ITERATE_ROUNDS: usize = 20;

/// Configuration for the DHT engine. All intervals have the defaults the
/// overlay was tuned with; operators override what they must.
#[derive(Clone, Debug)]
pub struct DhtConfig {
    /// Peers used to join the overlay. Entries without an identifier are
    /// pinged first and learned from their response.
    pub bootstrap_peers: Vec<BootstrapEntry>,
    /// TTL of a stored key/value pair from its original publication.
    pub expiration_interval: Duration,
    /// Inactivity window after which a bucket is refreshed.
    pub refresh_interval: Duration,
    /// Interval between replication passes over published keys.
    pub replicate_interval: Duration,
    /// Interval after which the original publisher must republish.
    /// Tracked but not acted upon; see the maintenance tick.
    pub republish_interval: Duration,
    /// Deadline for liveness pings during bucket eviction.
    pub ping_timeout: Duration,
    /// Deadline for a response to any packet.
    pub packet_timeout: Duration,
    /// Break equal outer-node counts toward the smaller identifier during
    /// `KnownOuterNodes` gossip instead of keeping the incumbent.
    pub deterministic_outer_tie_break: bool,
}

impl Default for DhtConfig {
    fn default() -> Self {
        Self {
            bootstrap_peers: Vec::new(),
            expiration_interval: Duration::from_secs(86_410),
            refresh_interval: Duration::from_secs(3_600),
            replicate_interval: Duration::from_secs(3_600),
            republish_interval: Duration::from_secs(86_400),
            ping_timeout: Duration::from_secs(1),
            packet_timeout: Duration::from_secs(10),
            deterministic_outer_tie_break: false,
        }
    }
}

/// One configured bootstrap peer.
#[derive(Clone, Debug)]
pub struct BootstrapEntry {
    /// Known identifier, if any. Unknown identifiers are learned by pinging.
    pub id: Option<NodeId>,
    pub address: Address,
}

/// The identities this node presents, all sharing one endpoint. Each
/// identity owns its own routing table.
#[derive(Clone, Debug)]
pub struct Origin {
    pub ids: Vec<NodeId>,
    pub address: Address,
}

impl Origin {
    pub fn single(id: NodeId, address: Address) -> Self {
        Self {
            ids: vec![id],
            address,
        }
    }
}

/// A procedure invocable over `Rpc` packets.
pub type RemoteProcedure = Arc<dyn Fn(Vec<Vec<u8>>) -> Result<Vec<u8>> + Send + Sync>;

/// Handler for protocol packet types layered above the DHT (discovery
/// bootstrap, genesis). Returns the response to send, if any.
pub type ProtocolHandler = Arc<dyn Fn(&Packet) -> Option<ResponseData> + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum IterateKind {
    Store,
    FindNode,
    FindValue,
    Bootstrap,
}

#[derive(Default)]
struct AuthInfo {
    sent_keys: HashMap<NodeId, Vec<u8>>,
    received_keys: HashMap<NodeId, Vec<u8>>,
    authenticated: HashSet<NodeId>,
}

/// The best-connected node of the home subnet as learned through gossip.
#[derive(Clone, Debug, Default)]
pub struct HighKnownOuterNodes {
    pub id: Option<NodeId>,
    pub outer_nodes: usize,
    pub self_known_outer_nodes: usize,
}

#[derive(Default)]
struct Subnet {
    /// IP (host part) to the identifiers observed behind it.
    subnet_ids: HashMap<String, Vec<NodeId>>,
    home_subnet_key: String,
    possible_relay_ids: Vec<NodeId>,
    possible_proxy_ids: Vec<NodeId>,
    high_known: HighKnownOuterNodes,
}

struct DhtInner<T: Transport> {
    origin: Origin,
    config: DhtConfig,
    transport: Arc<T>,
    scheme: Arc<dyn CryptoScheme>,
    tables: Vec<StdMutex<RoutingTable>>,
    store: ContentStore,
    relay: StdMutex<Relay>,
    proxy: StdMutex<Proxy>,
    auth: StdMutex<AuthInfo>,
    subnet: StdMutex<Subnet>,
    procedures: StdMutex<HashMap<String, RemoteProcedure>>,
    handlers: StdMutex<HashMap<PacketType, ProtocolHandler>>,
}

/// Handle to the DHT engine. Cheap to clone; all state lives behind the
/// shared inner.
pub struct DhtNode<T: Transport> {
    inner: Arc<DhtInner<T>>,
}

impl<T: Transport> Clone for DhtNode<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Transport> DhtNode<T> {
    pub fn new(
        origin: Origin,
        transport: Arc<T>,
        scheme: Arc<dyn CryptoScheme>,
        config: DhtConfig,
    ) -> Self {
        let tables = origin
            .ids
            .iter()
            .map(|id| StdMutex::new(RoutingTable::new(Peer::new(*id, origin.address))))
            .collect();
        Self {
            inner: Arc::new(DhtInner {
                origin,
                config,
                transport,
                scheme,
                tables,
                store: ContentStore::new(),
                relay: StdMutex::new(Relay::new()),
                proxy: StdMutex::new(Proxy::new()),
                auth: StdMutex::new(AuthInfo::default()),
                subnet: StdMutex::new(Subnet::default()),
                procedures: StdMutex::new(HashMap::new()),
                handlers: StdMutex::new(HashMap::new()),
            }),
        }
    }

    pub fn origin(&self) -> &Origin {
        &self.inner.origin
    }

    /// Base58 form of this node's primary identifier.
    pub fn origin_id(&self) -> String {
        self.inner.origin.ids[0].to_base58()
    }

    pub fn transport(&self) -> &Arc<T> {
        &self.inner.transport
    }

    pub fn scheme(&self) -> &Arc<dyn CryptoScheme> {
        &self.inner.scheme
    }

    /// Total contacts in the primary routing table.
    pub fn num_nodes(&self) -> usize {
        self.inner.tables[0].lock().expect("table poisoned").total_nodes()
    }

    /// Every peer currently known to the primary table.
    pub fn known_peers(&self) -> Vec<Peer> {
        self.inner.tables[0].lock().expect("table poisoned").all_peers()
    }

    pub fn is_authenticated(&self, id: &NodeId) -> bool {
        self.inner
            .auth
            .lock()
            .expect("auth poisoned")
            .authenticated
            .contains(id)
    }

    pub fn relay_clients_count(&self) -> usize {
        self.inner.relay.lock().expect("relay poisoned").clients_count()
    }

    pub fn proxy_count(&self) -> usize {
        self.inner.proxy.lock().expect("proxy poisoned").proxy_count()
    }

    fn origin_peer(&self, table: usize) -> Peer {
        Peer::new(self.inner.origin.ids[table], self.inner.origin.address)
    }

    fn table_for(&self, receiver: &NodeId) -> usize {
        if receiver.is_wildcard() {
            return 0;
        }
        self.inner
            .origin
            .ids
            .iter()
            .position(|id| id == receiver)
            .unwrap_or(0)
    }

    /// Register a handler for a protocol type layered above the DHT.
    pub fn register_packet_handler(&self, kind: PacketType, handler: ProtocolHandler) {
        self.inner
            .handlers
            .lock()
            .expect("handlers poisoned")
            .insert(kind, handler);
    }

    /// Register a procedure invocable through `Rpc` packets.
    pub fn remote_procedure_register(&self, name: &str, procedure: RemoteProcedure) {
        self.inner
            .procedures
            .lock()
            .expect("procedures poisoned")
            .insert(name.to_string(), procedure);
    }

    /// Begin serving: takes the transport's packet stream, spawns the packet
    /// and maintenance loops and starts accepting connections.
    pub async fn listen(&self) -> Result<()> {
        let packets = self
            .inner
            .transport
            .packets()
            .await
            .ok_or_else(|| anyhow!("transport packet stream already taken"))?;
        self.spawn_packet_loop(packets);
        self.spawn_maintenance_loop();
        self.inner.transport.start().await
    }

    /// Stop the transport; every background loop observes the signal.
    pub fn disconnect(&self) {
        self.inner.transport.stop();
    }

    // ------------------------------------------------------------------
    // Routing table upkeep
    // ------------------------------------------------------------------

    /// Insert a peer per the K-bucket policy. A full bucket pings its
    /// least-recently-seen head; the eviction verdict is applied when the
    /// ping settles.
    async fn add_peer(&self, table: usize, peer: Peer) {
        let outcome = {
            self.inner.tables[table]
                .lock()
                .expect("table poisoned")
                .upsert(peer)
        };
        if let UpsertOutcome::Full(pending) = outcome {
            let node = self.clone();
            tokio::spawn(async move {
                let alive = node.ping_peer(table, pending.head).await;
                node.inner.tables[table]
                    .lock()
                    .expect("table poisoned")
                    .apply_ping_result(pending, alive);
            });
        }
    }

    async fn ping_peer(&self, table: usize, peer: Peer) -> bool {
        let request = Packet::request(self.origin_peer(table), peer, RequestData::Ping);
        let future = match self.inner.transport.send_request(request).await {
            Ok(future) => future,
            Err(_) => return false,
        };
        matches!(
            tokio::time::timeout(self.inner.config.ping_timeout, future.response()).await,
            Ok(Some(_))
        )
    }

    // ------------------------------------------------------------------
    // Public overlay operations
    // ------------------------------------------------------------------

    /// Store data on the network. Returns the base58 key under which the
    /// value can be retrieved.
    pub async fn store(&self, data: Vec<u8>) -> Result<String> {
        let table = 0;
        let key = self.inner.scheme.id_hash(&data);
        let expiration = self.expiration_deadline(table, &key);
        let replication = Instant::now() + self.inner.config.replicate_interval;
        self.inner.store.store(key, data.clone(), replication, expiration, true)?;
        self.iterate(table, IterateKind::Store, &key, Some(&data)).await?;
        Ok(bs58::encode(&key).into_string())
    }

    /// Retrieve data by its base58 key, consulting the overlay on a local
    /// miss.
    pub async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let key = decode_key(key)?;
        if let Some(value) = self.inner.store.retrieve(&key) {
            return Ok(Some(value));
        }
        let (value, _) = self.iterate(0, IterateKind::FindValue, &key, None).await?;
        Ok(value)
    }

    /// Resolve a node's current network address by its base58 identifier.
    pub async fn find_node(&self, id_text: &str) -> Result<Option<Peer>> {
        let id = NodeId::from_base58(id_text)?;
        self.find_peer(0, &id).await
    }

    async fn find_peer(&self, table: usize, id: &NodeId) -> Result<Option<Peer>> {
        if self.inner.origin.ids[table] == *id {
            return Ok(Some(self.origin_peer(table)));
        }

        let head = {
            self.inner.tables[table]
                .lock()
                .expect("table poisoned")
                .closest(&(*id).into(), 1, &[])
        };
        if let Some(first) = head.first() {
            if first.id == *id {
                return Ok(Some(*first));
            }
        }

        {
            let mut proxy = self.inner.proxy.lock().expect("proxy poisoned");
            if proxy.proxy_count() > 0 {
                if let Some(via) = proxy.next_proxy() {
                    return Ok(Some(Peer::new(*id, via.address)));
                }
            }
        }

        debug!(target = %id, "node not in routing table, iterating through network");
        let (_, closest) = self
            .iterate(table, IterateKind::FindNode, &(*id).into(), None)
            .await?;
        Ok(closest.into_iter().find(|p| p.id == *id))
    }

    async fn require_peer(&self, table: usize, id: &NodeId) -> Result<Peer> {
        match self.find_peer(table, id).await? {
            Some(peer) => Ok(peer),
            None => bail!("target {} not found", id),
        }
    }

    /// Join the overlay through the configured bootstrap peers: ping
    /// identifier-less entries in parallel, then populate each table's
    /// neighborhood with a bootstrap iterate toward its own origin.
    pub async fn bootstrap(&self) -> Result<()> {
        if self.inner.config.bootstrap_peers.is_empty() {
            return Ok(());
        }

        let mut join: JoinSet<Option<(usize, Peer)>> = JoinSet::new();
        for table in 0..self.inner.tables.len() {
            for entry in self.inner.config.bootstrap_peers.clone() {
                match entry.id {
                    Some(id) => {
                        self.add_peer(table, Peer::new(id, entry.address)).await;
                    }
                    None => {
                        let node = self.clone();
                        join.spawn(async move {
                            let receiver = Peer::new(NodeId::WILDCARD, entry.address);
                            let request =
                                Packet::request(node.origin_peer(table), receiver, RequestData::Ping);
                            match node.inner.transport.send_request(request).await {
                                Ok(future) => future.response().await.map(|rsp| (table, rsp.sender)),
                                Err(e) => {
                                    debug!(address = %entry.address, error = %e, "bootstrap ping failed");
                                    None
                                }
                            }
                        });
                    }
                }
            }
        }
        while let Some(joined) = join.join_next().await {
            if let Ok(Some((table, sender))) = joined {
                self.add_peer(table, sender).await;
            }
        }

        for table in 0..self.inner.tables.len() {
            let populated = {
                self.inner.tables[table]
                    .lock()
                    .expect("table poisoned")
                    .total_nodes()
                    > 0
            };
            if populated {
                let target: Key = self.inner.origin.ids[table].into();
                self.iterate(table, IterateKind::Bootstrap, &target, None).await?;
            }
        }
        Ok(())
    }

    /// Call a procedure on a remote node. A call addressed at this node's
    /// own identifier is invoked directly.
    pub async fn remote_procedure_call(
        &self,
        target: &str,
        method: &str,
        args: Vec<Vec<u8>>,
    ) -> Result<Vec<u8>> {
        if target == self.origin_id() {
            let procedure = {
                self.inner
                    .procedures
                    .lock()
                    .expect("procedures poisoned")
                    .get(method)
                    .cloned()
            };
            return match procedure {
                Some(procedure) => procedure(args),
                None => bail!("unknown method {}", method),
            };
        }

        let id = NodeId::from_base58(target)?;
        let peer = self.require_peer(0, &id).await?;
        let request = Packet::request(
            self.origin_peer(0),
            peer,
            RequestData::Rpc {
                method: method.to_string(),
                args,
            },
        );
        let rsp = self.request_with_timeout(request).await?;
        self.add_peer(0, rsp.sender).await;
        match rsp.data {
            PacketData::Response(ResponseData::Rpc {
                success,
                result,
                error,
            }) => {
                if success {
                    Ok(result)
                } else {
                    bail!(error)
                }
            }
            other => bail!("unexpected rpc response: {:?}", other),
        }
    }

    // ------------------------------------------------------------------
    // Authentication, relay and subnet requests
    // ------------------------------------------------------------------

    /// Run an authentication command against a target node.
    pub async fn auth_request(&self, command: AuthCommand, target: &str) -> Result<()> {
        let id = NodeId::from_base58(target)?;
        let peer = self.require_peer(0, &id).await?;
        let request = Packet::request(self.origin_peer(0), peer, RequestData::Auth { command });
        let rsp = self.request_with_timeout(request).await?;
        match rsp.data {
            PacketData::Response(ResponseData::Auth { success, key }) => {
                if success && !key.is_empty() {
                    self.inner
                        .auth
                        .lock()
                        .expect("auth poisoned")
                        .received_keys
                        .insert(id, key);
                    Ok(())
                } else if success {
                    // Revocation acknowledged.
                    self.inner
                        .auth
                        .lock()
                        .expect("auth poisoned")
                        .received_keys
                        .remove(&id);
                    Ok(())
                } else {
                    bail!("authentication unsuccessful")
                }
            }
            other => bail!("unexpected auth response: {:?}", other),
        }
    }

    /// Run a relay command against a target node. On `Started` the target
    /// becomes one of this node's proxies; on `Stopped` it is removed.
    pub async fn relay_request(&self, command: RelayCommand, target: &str) -> Result<()> {
        let id = NodeId::from_base58(target)?;
        let peer = self.require_peer(0, &id).await?;
        let request = Packet::request(self.origin_peer(0), peer, RequestData::Relay { command });
        let rsp = self.request_with_timeout(request).await?;
        match rsp.data {
            PacketData::Response(ResponseData::Relay { state }) => match state {
                RelayState::Started => {
                    self.inner.proxy.lock().expect("proxy poisoned").add_proxy(peer);
                    Ok(())
                }
                RelayState::Stopped => {
                    self.inner.proxy.lock().expect("proxy poisoned").remove_proxy(&id);
                    Ok(())
                }
                RelayState::NoAuth => {
                    bail!("unable to execute relay because this node is not authenticated")
                }
                RelayState::Unknown => bail!("unknown relay command"),
                RelayState::Error => bail!("relay request error"),
            },
            other => bail!("unexpected relay response: {:?}", other),
        }
    }

    /// Ask a target to echo back the auth key we sent it. On a correct echo
    /// the target is marked authenticated.
    pub async fn check_origin_request(&self, target: &str) -> Result<()> {
        let id = NodeId::from_base58(target)?;
        let peer = self.require_peer(0, &id).await?;
        self.check_origin_to(0, peer).await
    }

    async fn check_origin_to(&self, table: usize, peer: Peer) -> Result<()> {
        let request = Packet::request(self.origin_peer(table), peer, RequestData::CheckOrigin);
        let rsp = self.request_with_timeout(request).await?;
        match rsp.data {
            PacketData::Response(ResponseData::CheckOrigin { key }) => {
                let mut auth = self.inner.auth.lock().expect("auth poisoned");
                let matches = auth
                    .sent_keys
                    .get(&peer.id)
                    .map(|sent| *sent == key)
                    .unwrap_or(false);
                if matches {
                    auth.sent_keys.remove(&peer.id);
                    auth.authenticated.insert(peer.id);
                }
                Ok(())
            }
            other => bail!("unexpected check-origin response: {:?}", other),
        }
    }

    /// Ask one peer which endpoint it observes for us, recording the
    /// answer in the subnet map.
    pub async fn obtain_ip_request(&self, target: &str) -> Result<()> {
        let id = NodeId::from_base58(target)?;
        let peer = self.require_peer(0, &id).await?;
        let request = Packet::request(self.origin_peer(0), peer, RequestData::ObtainIp);
        let rsp = self.request_with_timeout(request).await?;
        match rsp.data {
            PacketData::Response(ResponseData::ObtainIp { ip }) => {
                if ip.is_empty() {
                    bail!("received empty IP");
                }
                let host = ip
                    .parse::<std::net::SocketAddr>()
                    .map(|a| a.ip().to_string())
                    .unwrap_or(ip);
                let mut subnet = self.inner.subnet.lock().expect("subnet poisoned");
                let ids = subnet.subnet_ids.entry(host).or_default();
                if !ids.contains(&id) {
                    ids.push(id);
                }
                Ok(())
            }
            other => bail!("unexpected obtain-ip response: {:?}", other),
        }
    }

    /// Sweep `ObtainIp` over every known peer.
    pub async fn obtain_ip(&self) -> Result<()> {
        for table in 0..self.inner.tables.len() {
            let peers = {
                self.inner.tables[table]
                    .lock()
                    .expect("table poisoned")
                    .all_peers()
            };
            for peer in peers {
                self.obtain_ip_request(&peer.id.to_base58()).await?;
            }
        }
        Ok(())
    }

    /// Analyze the subnet map built by [`DhtNode::obtain_ip`]: derive the
    /// home subnet, count outer peers, gossip the count through the home
    /// subnet, and on a static single-subnet offer this node as a relay.
    pub async fn analyze_network(&self) -> Result<()> {
        let home = self.home_subnet_key().await?;

        let (members, self_outer) = {
            let mut subnet = self.inner.subnet.lock().expect("subnet poisoned");
            subnet.home_subnet_key = home.clone();
            if subnet.subnet_ids.len() > 1 {
                let mut outer = 0usize;
                for (ip, ids) in subnet.subnet_ids.iter() {
                    if *ip != home {
                        outer += ids.len();
                    }
                }
                subnet.high_known.self_known_outer_nodes = outer;
            }
            subnet.high_known.outer_nodes = subnet.high_known.self_known_outer_nodes;
            subnet.high_known.id = Some(self.inner.origin.ids[0]);
            (
                subnet.subnet_ids.get(&home).cloned().unwrap_or_default(),
                subnet.high_known.outer_nodes,
            )
        };

        for id in members {
            self.known_outer_nodes_request(&id.to_base58(), self_outer).await?;
        }

        let static_subnet = {
            let subnet = self.inner.subnet.lock().expect("subnet poisoned");
            if subnet.subnet_ids.len() == 1 && subnet.home_subnet_key.is_empty() {
                subnet.subnet_ids.values().next().cloned()
            } else {
                None
            }
        };
        if let Some(ids) = static_subnet {
            for id in ids {
                if let Err(e) = self.relay_ownership_request(&id.to_base58(), true).await {
                    debug!(target = %id, error = %e, "relay ownership offer failed");
                }
            }
        }
        Ok(())
    }

    async fn home_subnet_key(&self) -> Result<String> {
        let entries: Vec<(String, Vec<NodeId>)> = {
            let subnet = self.inner.subnet.lock().expect("subnet poisoned");
            subnet
                .subnet_ids
                .iter()
                .map(|(ip, ids)| (ip.clone(), ids.clone()))
                .collect()
        };

        let mut result = String::new();
        for (ip, ids) in entries {
            let prefix = slash16_prefix(&ip);
            let mut all_match = true;
            for id in &ids {
                let peer = match self.find_peer(0, id).await? {
                    Some(peer) => peer,
                    None => bail!("couldn't find a node"),
                };
                if !peer.address.ip_string().starts_with(&prefix) {
                    all_match = false;
                    break;
                }
            }
            if all_match {
                result = ip;
            }
        }
        Ok(result)
    }

    /// Offer or retract relay ownership toward a target.
    pub async fn relay_ownership_request(&self, target: &str, ready: bool) -> Result<()> {
        let id = NodeId::from_base58(target)?;
        let peer = self.require_peer(0, &id).await?;
        let request = Packet::request(
            self.origin_peer(0),
            peer,
            RequestData::RelayOwnership { ready },
        );
        let rsp = self.request_with_timeout(request).await?;
        match rsp.data {
            PacketData::Response(ResponseData::RelayOwnership { accepted }) => {
                if accepted {
                    let mut subnet = self.inner.subnet.lock().expect("subnet poisoned");
                    if !subnet.possible_relay_ids.contains(&id) {
                        subnet.possible_relay_ids.push(id);
                    }
                }
                Ok(())
            }
            other => bail!("unexpected relay-ownership response: {:?}", other),
        }
    }

    /// Gossip our outer-node count to a target; adopt the better record from
    /// its answer, and chase a better-connected peer with auth + relay when
    /// we have no proxy yet.
    pub async fn known_outer_nodes_request(&self, target: &str, outer_nodes: usize) -> Result<()> {
        let id = NodeId::from_base58(target)?;
        let peer = self.require_peer(0, &id).await?;
        let own_id = {
            let subnet = self.inner.subnet.lock().expect("subnet poisoned");
            subnet.high_known.id.unwrap_or(self.inner.origin.ids[0])
        };
        let request = Packet::request(
            self.origin_peer(0),
            peer,
            RequestData::KnownOuterNodes {
                id: own_id,
                outer_nodes,
            },
        );
        let rsp = self.request_with_timeout(request).await?;
        match rsp.data {
            PacketData::Response(ResponseData::KnownOuterNodes { id: best_id, outer_nodes }) => {
                let needs_proxy = self.absorb_known_outer(best_id, outer_nodes);
                if needs_proxy {
                    self.auth_request(AuthCommand::Begin, target).await?;
                    self.relay_request(RelayCommand::Start, target).await?;
                }
                Ok(())
            }
            other => bail!("unexpected known-outer-nodes response: {:?}", other),
        }
    }

    /// Fold a gossiped record into the high-known state. Returns whether
    /// this node should chase the reporter for a proxy.
    fn absorb_known_outer(&self, id: NodeId, outer_nodes: usize) -> bool {
        let mut subnet = self.inner.subnet.lock().expect("subnet poisoned");
        if outer_nodes > subnet.high_known.outer_nodes {
            subnet.high_known.outer_nodes = outer_nodes;
            subnet.high_known.id = Some(id);
        } else if self.inner.config.deterministic_outer_tie_break
            && outer_nodes == subnet.high_known.outer_nodes
        {
            let smaller = match subnet.high_known.id {
                Some(current) => id < current,
                None => true,
            };
            if smaller {
                subnet.high_known.id = Some(id);
            }
        }
        let proxyless = {
            self.inner.proxy.lock().expect("proxy poisoned").proxy_count() == 0
        };
        outer_nodes > subnet.high_known.self_known_outer_nodes && proxyless
    }

    /// Snapshot of the high-known-outer record, for diagnostics.
    pub fn high_known_outer(&self) -> HighKnownOuterNodes {
        self.inner
            .subnet
            .lock()
            .expect("subnet poisoned")
            .high_known
            .clone()
    }

    async fn request_with_timeout(&self, request: Packet) -> Result<Packet> {
        let future = self.inner.transport.send_request(request).await?;
        match tokio::time::timeout(self.inner.config.packet_timeout, future.response()).await {
            Ok(Some(rsp)) => Ok(rsp),
            Ok(None) => bail!("channel closed unexpectedly"),
            Err(_) => bail!("timeout"),
        }
    }

    // ------------------------------------------------------------------
    // Iterative query state machine
    // ------------------------------------------------------------------

    async fn iterate(
        &self,
        table: usize,
        kind: IterateKind,
        target: &Key,
        data: Option<&[u8]>,
    ) -> Result<(Option<Vec<u8>>, Vec<Peer>)> {
        let target_id = NodeId::from(*target);
        let origin_id = self.inner.origin.ids[table];

        let mut route_set = {
            self.inner.tables[table]
                .lock()
                .expect("table poisoned")
                .closest(target, PARALLEL_CALLS, &[])
        };
        if route_set.is_empty() {
            return Ok((None, Vec::new()));
        }

        if kind == IterateKind::Bootstrap {
            if let Some(bucket) = bucket_index(&origin_id, &target_id) {
                self.inner.tables[table]
                    .lock()
                    .expect("table poisoned")
                    .reset_refresh_time(bucket);
            }
        }

        let mut contacted: HashSet<NodeId> = HashSet::new();
        let mut query_rest = false;
        let mut closest_seen = route_set[0].id;
        let mut rounds = 0usize;

        loop {
            rounds += 1;
            if rounds > MAX_ITERATE_ROUNDS {
                warn!(target = %target_id, rounds, "iterate exceeded round limit");
                return Ok((None, route_set));
            }

            // Send batch: α closest uncontacted members, or everyone left
            // once query_rest is on.
            let batch: Vec<Peer> = route_set
                .iter()
                .filter(|p| !contacted.contains(&p.id))
                .take(if query_rest { route_set.len() } else { PARALLEL_CALLS })
                .cloned()
                .collect();

            let mut futures = Vec::new();
            let mut unreachable: Vec<NodeId> = Vec::new();
            for peer in batch {
                contacted.insert(peer.id);
                let request_data = match kind {
                    IterateKind::FindValue => RequestData::FindValue { target: *target },
                    _ => RequestData::FindNode { target: *target },
                };
                let request = Packet::request(self.origin_peer(table), peer, request_data);
                match self.inner.transport.send_request(request).await {
                    Ok(future) => futures.push(future),
                    Err(e) => {
                        // Unreachable now; drop from the route set but keep
                        // the routing table entry in case it comes back.
                        trace!(peer = %peer.id, error = %e, "query send failed");
                        unreachable.push(peer.id);
                    }
                }
            }
            route_set.retain(|p| !unreachable.contains(&p.id));

            // Collect responses up to the packet timeout.
            let mut responses = Vec::new();
            if !futures.is_empty() {
                let mut join = JoinSet::new();
                let deadline = self.inner.config.packet_timeout;
                for future in futures {
                    join.spawn(async move {
                        tokio::time::timeout(deadline, future.response())
                            .await
                            .ok()
                            .flatten()
                    });
                }
                while let Some(joined) = join.join_next().await {
                    if let Ok(Some(rsp)) = joined {
                        responses.push(rsp);
                    }
                }
            }

            // Merge: responders become contacts, their closest lists extend
            // the route set, errors evict the responder from this query.
            let mut errored: Vec<NodeId> = Vec::new();
            for rsp in responses {
                self.add_peer(table, rsp.sender).await;
                if rsp.error.is_some() {
                    errored.push(rsp.sender.id);
                    continue;
                }
                match rsp.data {
                    PacketData::Response(ResponseData::FindNode { closest }) => {
                        if let Some(first) = closest.first() {
                            if first.id == target_id {
                                return Ok((None, closest));
                            }
                        }
                        merge_route_set(&mut route_set, closest, &self.inner.origin.ids);
                    }
                    PacketData::Response(ResponseData::FindValue { value, closest }) => {
                        merge_route_set(&mut route_set, closest, &self.inner.origin.ids);
                        if kind == IterateKind::FindValue {
                            if let Some(value) = value {
                                return Ok((Some(value), Vec::new()));
                            }
                        }
                    }
                    other => {
                        trace!(payload = ?other, "ignoring unexpected query response payload");
                    }
                }
            }
            route_set.retain(|p| !errored.contains(&p.id));

            route_set.sort_by(|a, b| {
                let da = a.id.xor_distance(&target_id);
                let db = b.id.xor_distance(&target_id);
                distance_cmp(&da, &db).then_with(|| a.id.cmp(&b.id))
            });
            route_set.truncate(MAX_CONTACTS_IN_BUCKET);

            if route_set.is_empty() {
                return Ok((None, Vec::new()));
            }

            if route_set[0].id == closest_seen {
                if !query_rest {
                    // One more sweep over everyone not yet contacted.
                    query_rest = true;
                    continue;
                }
                return match kind {
                    IterateKind::Bootstrap | IterateKind::FindNode | IterateKind::FindValue => {
                        Ok((None, route_set))
                    }
                    IterateKind::Store => {
                        let payload = data.map(|d| d.to_vec()).unwrap_or_default();
                        for peer in route_set.iter().take(MAX_CONTACTS_IN_BUCKET) {
                            let request = Packet::request(
                                self.origin_peer(table),
                                *peer,
                                RequestData::Store {
                                    data: payload.clone(),
                                },
                            );
                            // No response is expected for a store.
                            if let Ok(future) = self.inner.transport.send_request(request).await {
                                future.cancel();
                            }
                        }
                        Ok((None, Vec::new()))
                    }
                };
            }
            closest_seen = route_set[0].id;
        }
    }

    // ------------------------------------------------------------------
    // Packet dispatch
    // ------------------------------------------------------------------

    fn spawn_packet_loop(&self, mut packets: mpsc::Receiver<Packet>) {
        let node = self.clone();
        let mut stopped = self.inner.transport.stopped();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    changed = stopped.changed() => {
                        if changed.is_err() || *stopped.borrow() {
                            break;
                        }
                    }
                    packet = packets.recv() => match packet {
                        Some(packet) => node.handle_packet(packet).await,
                        None => break,
                    }
                }
            }
            node.inner.transport.close();
            debug!("packet loop stopped");
        });
    }

    async fn handle_packet(&self, packet: Packet) {
        if packet.is_for_me(&self.inner.origin.ids) {
            let table = self.table_for(&packet.receiver.id);
            self.dispatch(table, packet).await;
            return;
        }
        let needs_relay = {
            self.inner
                .relay
                .lock()
                .expect("relay poisoned")
                .need_to_relay(&packet.sender.address.to_string())
        };
        if needs_relay {
            self.relay_onward(packet).await;
        } else {
            trace!(receiver = %packet.receiver.id, "dropping packet for unknown receiver");
        }
    }

    /// Re-encapsulate a relayed client's packet toward its resolved target.
    async fn relay_onward(&self, packet: Packet) {
        let target = match self.find_peer(0, &packet.receiver.id).await {
            Ok(Some(peer)) => peer,
            Ok(None) => {
                warn!(
                    receiver = %packet.receiver.id,
                    address = %packet.receiver.address,
                    "relay target not found"
                );
                return;
            }
            Err(e) => {
                warn!(error = %e, "relay target lookup failed");
                return;
            }
        };

        let forwarded = Packet {
            sender: Peer::new(packet.sender.id, self.inner.origin.address),
            receiver: Peer::new(packet.receiver.id, target.address),
            kind: packet.kind,
            request_id: packet.request_id,
            remote_address: None,
            data: packet.data,
            error: None,
        };
        match self.inner.transport.send_request(forwarded).await {
            Ok(future) => {
                let node = self.clone();
                tokio::spawn(async move {
                    match future.response().await {
                        Some(rsp) => {
                            node.add_peer(0, rsp.sender).await;
                            debug!(sender = %rsp.sender.id, "relayed request answered");
                        }
                        None => debug!("relayed request got no response"),
                    }
                });
            }
            Err(e) => debug!(error = %e, "failed to forward relayed packet"),
        }
    }

    async fn dispatch(&self, table: usize, packet: Packet) {
        let request = match &packet.data {
            PacketData::Request(request) => request.clone(),
            PacketData::Response(_) => return,
        };
        match request {
            RequestData::Ping => self.process_ping(table, &packet).await,
            RequestData::FindNode { target } => {
                self.process_find_node(table, &packet, target).await
            }
            RequestData::FindValue { target } => {
                self.process_find_value(table, &packet, target).await
            }
            RequestData::Store { data } => self.process_store(table, &packet, data).await,
            RequestData::Rpc { method, args } => {
                self.process_rpc(table, &packet, method, args).await
            }
            RequestData::Relay { command } => self.process_relay(table, &packet, command).await,
            RequestData::Auth { command } => self.process_auth(table, &packet, command).await,
            RequestData::CheckOrigin => self.process_check_origin(table, &packet).await,
            RequestData::ObtainIp => self.process_obtain_ip(table, &packet).await,
            RequestData::RelayOwnership { ready } => {
                self.process_relay_ownership(table, &packet, ready).await
            }
            RequestData::KnownOuterNodes { id, outer_nodes } => {
                self.process_known_outer(table, &packet, id, outer_nodes).await
            }
            RequestData::Bootstrap | RequestData::Genesis { .. } => {
                self.process_registered(table, &packet).await
            }
        }
    }

    async fn respond(&self, table: usize, request: &Packet, data: ResponseData) {
        let response = Packet::response(self.origin_peer(table), request, data);
        if let Err(e) = self
            .inner
            .transport
            .send_response(request.request_id, response)
            .await
        {
            debug!(error = %e, "failed to send response");
        }
    }

    async fn process_ping(&self, table: usize, packet: &Packet) {
        self.respond(table, packet, ResponseData::Ping).await;
    }

    async fn process_find_node(&self, table: usize, packet: &Packet, target: Key) {
        self.add_peer(table, packet.sender).await;
        let closest = {
            self.inner.tables[table]
                .lock()
                .expect("table poisoned")
                .closest(&target, MAX_CONTACTS_IN_BUCKET, &[packet.sender.id])
        };
        self.respond(table, packet, ResponseData::FindNode { closest }).await;
    }

    async fn process_find_value(&self, table: usize, packet: &Packet, target: Key) {
        self.add_peer(table, packet.sender).await;
        match self.inner.store.retrieve(&target) {
            Some(value) => {
                self.respond(
                    table,
                    packet,
                    ResponseData::FindValue {
                        value: Some(value),
                        closest: Vec::new(),
                    },
                )
                .await;
            }
            None => {
                let closest = {
                    self.inner.tables[table]
                        .lock()
                        .expect("table poisoned")
                        .closest(&target, MAX_CONTACTS_IN_BUCKET, &[packet.sender.id])
                };
                self.respond(
                    table,
                    packet,
                    ResponseData::FindValue {
                        value: None,
                        closest,
                    },
                )
                .await;
            }
        }
    }

    async fn process_store(&self, table: usize, packet: &Packet, data: Vec<u8>) {
        self.add_peer(table, packet.sender).await;
        let key = self.inner.scheme.id_hash(&data);
        let expiration = self.expiration_deadline(table, &key);
        let replication = Instant::now() + self.inner.config.replicate_interval;
        if let Err(e) = self.inner.store.store(key, data, replication, expiration, false) {
            debug!(error = %e, "failed to store data");
        }
    }

    async fn process_rpc(&self, table: usize, packet: &Packet, method: String, args: Vec<Vec<u8>>) {
        self.add_peer(table, packet.sender).await;
        let procedure = {
            self.inner
                .procedures
                .lock()
                .expect("procedures poisoned")
                .get(&method)
                .cloned()
        };
        let response = match procedure {
            Some(procedure) => match procedure(args) {
                Ok(result) => ResponseData::Rpc {
                    success: true,
                    result,
                    error: String::new(),
                },
                Err(e) => ResponseData::Rpc {
                    success: false,
                    result: Vec::new(),
                    error: e.to_string(),
                },
            },
            None => ResponseData::Rpc {
                success: false,
                result: Vec::new(),
                error: format!("unknown method {}", method),
            },
        };
        self.respond(table, packet, response).await;
    }

    async fn process_relay(&self, table: usize, packet: &Packet, command: RelayCommand) {
        let authenticated = {
            self.inner
                .auth
                .lock()
                .expect("auth poisoned")
                .authenticated
                .contains(&packet.sender.id)
        };
        let state = if !authenticated {
            info!(sender = %packet.sender.id, "relay request from unauthenticated node rejected");
            RelayState::NoAuth
        } else {
            self.add_peer(table, packet.sender).await;
            let mut relay = self.inner.relay.lock().expect("relay poisoned");
            let result = match command {
                RelayCommand::Start => relay.add_client(packet.sender).map(|_| RelayState::Started),
                RelayCommand::Stop => relay
                    .remove_client(&packet.sender.id)
                    .map(|_| RelayState::Stopped),
            };
            match result {
                Ok(state) => state,
                Err(e) => {
                    debug!(error = %e, "relay state change failed");
                    RelayState::Error
                }
            }
        };
        self.respond(table, packet, ResponseData::Relay { state }).await;
    }

    async fn process_auth(&self, table: usize, packet: &Packet, command: AuthCommand) {
        self.add_peer(table, packet.sender).await;
        match command {
            AuthCommand::Begin => {
                let already = {
                    self.inner
                        .auth
                        .lock()
                        .expect("auth poisoned")
                        .authenticated
                        .contains(&packet.sender.id)
                };
                if already {
                    self.respond(
                        table,
                        packet,
                        ResponseData::Auth {
                            success: false,
                            key: Vec::new(),
                        },
                    )
                    .await;
                    return;
                }

                let mut key = vec![0u8; AUTH_KEY_SIZE];
                rand::rngs::OsRng.fill_bytes(&mut key);
                {
                    let mut auth = self.inner.auth.lock().expect("auth poisoned");
                    auth.sent_keys.insert(packet.sender.id, key.clone());
                }
                self.respond(table, packet, ResponseData::Auth { success: true, key })
                    .await;

                // Verify the initiator can echo the key back.
                let node = self.clone();
                let sender = packet.sender;
                tokio::spawn(async move {
                    if let Err(e) = node.check_origin_to(table, sender).await {
                        debug!(target = %sender.id, error = %e, "origin check failed");
                    }
                });
            }
            AuthCommand::Revoke => {
                {
                    let mut auth = self.inner.auth.lock().expect("auth poisoned");
                    auth.authenticated.remove(&packet.sender.id);
                    auth.sent_keys.remove(&packet.sender.id);
                }
                self.respond(
                    table,
                    packet,
                    ResponseData::Auth {
                        success: true,
                        key: Vec::new(),
                    },
                )
                .await;
            }
        }
    }

    async fn process_check_origin(&self, table: usize, packet: &Packet) {
        let key = {
            self.inner
                .auth
                .lock()
                .expect("auth poisoned")
                .received_keys
                .get(&packet.sender.id)
                .cloned()
        };
        match key {
            Some(key) => self.respond(table, packet, ResponseData::CheckOrigin { key }).await,
            None => {
                info!(sender = %packet.sender.id, "check-origin request from unregistered node");
            }
        }
    }

    async fn process_obtain_ip(&self, table: usize, packet: &Packet) {
        let ip = packet.remote_address.clone().unwrap_or_default();
        self.respond(table, packet, ResponseData::ObtainIp { ip }).await;
    }

    async fn process_relay_ownership(&self, table: usize, packet: &Packet, ready: bool) {
        if ready {
            let mut subnet = self.inner.subnet.lock().expect("subnet poisoned");
            if !subnet.possible_proxy_ids.contains(&packet.sender.id) {
                subnet.possible_proxy_ids.push(packet.sender.id);
            }
        } else {
            let removed = {
                let mut subnet = self.inner.subnet.lock().expect("subnet poisoned");
                let before = subnet.possible_proxy_ids.len();
                subnet.possible_proxy_ids.retain(|id| *id != packet.sender.id);
                subnet.possible_proxy_ids.len() != before
            };
            if removed {
                let node = self.clone();
                let target = packet.sender.id.to_base58();
                tokio::spawn(async move {
                    if let Err(e) = node.auth_request(AuthCommand::Begin, &target).await {
                        debug!(error = %e, "auth request toward retracted proxy failed");
                        return;
                    }
                    if let Err(e) = node.relay_request(RelayCommand::Start, &target).await {
                        debug!(error = %e, "relay request toward retracted proxy failed");
                    }
                });
            }
        }
        self.respond(table, packet, ResponseData::RelayOwnership { accepted: true })
            .await;
    }

    async fn process_known_outer(
        &self,
        table: usize,
        packet: &Packet,
        id: NodeId,
        outer_nodes: usize,
    ) {
        let (best_id, best_outer) = {
            let subnet = self.inner.subnet.lock().expect("subnet poisoned");
            let own_id = subnet.high_known.id.unwrap_or(self.inner.origin.ids[table]);
            let own_outer = subnet.high_known.outer_nodes;
            if outer_nodes > own_outer {
                (id, outer_nodes)
            } else {
                (own_id, own_outer)
            }
        };
        self.respond(
            table,
            packet,
            ResponseData::KnownOuterNodes {
                id: best_id,
                outer_nodes: best_outer,
            },
        )
        .await;
    }

    async fn process_registered(&self, table: usize, packet: &Packet) {
        let handler = {
            self.inner
                .handlers
                .lock()
                .expect("handlers poisoned")
                .get(&packet.kind)
                .cloned()
        };
        match handler {
            Some(handler) => {
                if let Some(response) = handler(packet) {
                    self.respond(table, packet, response).await;
                }
            }
            None => debug!(kind = ?packet.kind, "no handler registered for packet type"),
        }
    }

    // ------------------------------------------------------------------
    // Maintenance
    // ------------------------------------------------------------------

    /// Expiration deadline for storing `key`, adapted to how well this part
    /// of the key space is covered: sparsely-covered keys persist longer to
    /// survive churn.
    pub(crate) fn expiration_deadline(&self, table: usize, key: &Key) -> Instant {
        let score = {
            self.inner.tables[table]
                .lock()
                .expect("table poisoned")
                .closeness_score(key)
        };
        let score = score.max(1);
        if score >= MAX_CONTACTS_IN_BUCKET {
            return Instant::now() + self.inner.config.expiration_interval;
        }
        let factor = (MAX_CONTACTS_IN_BUCKET as f64 / score as f64).exp();
        Instant::now() + self.inner.config.expiration_interval.mul_f64(factor)
    }

    fn spawn_maintenance_loop(&self) {
        let node = self.clone();
        let mut stopped = self.inner.transport.stopped();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(1));
            ticker.tick().await;
            loop {
                tokio::select! {
                    changed = stopped.changed() => {
                        if changed.is_err() || *stopped.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => node.maintenance_tick().await,
                }
            }
            debug!("maintenance loop stopped");
        });
    }

    async fn maintenance_tick(&self) {
        for table in 0..self.inner.tables.len() {
            // Refresh: stale buckets trigger a bootstrap iterate toward a
            // random identifier inside the bucket.
            let stale = {
                self.inner.tables[table]
                    .lock()
                    .expect("table poisoned")
                    .stale_buckets(self.inner.config.refresh_interval)
            };
            for bucket in stale {
                let target_id = {
                    self.inner.tables[table]
                        .lock()
                        .expect("table poisoned")
                        .random_id_in_bucket(bucket)
                };
                let target: Key = target_id.into();
                if let Err(e) = self.iterate(table, IterateKind::Bootstrap, &target, None).await {
                    debug!(bucket, error = %e, "bucket refresh failed");
                }
            }

            // Replication of keys this node published.
            let next = Instant::now() + self.inner.config.replicate_interval;
            for key in self.inner.store.keys_ready_to_replicate(next) {
                if let Some(value) = self.inner.store.retrieve(&key) {
                    if let Err(e) = self
                        .iterate(table, IterateKind::Store, &key, Some(&value))
                        .await
                    {
                        debug!(error = %e, "replication failed");
                    }
                }
            }
        }

        // TODO: republication by the original publisher after
        // `republish_interval`; the interval is tracked in config but the
        // pass itself is not implemented.
        self.inner.store.expire_keys();
    }
}

fn merge_route_set(route_set: &mut Vec<Peer>, found: Vec<Peer>, origin_ids: &[NodeId]) {
    for peer in found {
        if origin_ids.contains(&peer.id) || peer.id.is_wildcard() {
            continue;
        }
        if !route_set.iter().any(|p| p.id == peer.id) {
            route_set.push(peer);
        }
    }
}

fn slash16_prefix(ip: &str) -> String {
    let mut parts = ip.split('.');
    match (parts.next(), parts.next()) {
        (Some(a), Some(b)) => format!("{}.{}.", a, b),
        _ => ip.to_string(),
    }
}

fn decode_key(text: &str) -> Result<Key> {
    let id = NodeId::from_base58(text)?;
    Ok(id.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::PlatformScheme;
    use crate::transport::memory::{MemoryHub, MemoryTransport};
    use crate::transport::DEFAULT_PACKET_TIMEOUT;

    struct TestNet {
        hub: Arc<MemoryHub>,
        next_host: u8,
    }

    impl TestNet {
        fn new() -> Self {
            Self {
                hub: MemoryHub::new(),
                next_host: 1,
            }
        }

        async fn node(&mut self) -> DhtNode<MemoryTransport> {
            self.node_with_config(DhtConfig {
                packet_timeout: Duration::from_millis(500),
                ping_timeout: Duration::from_millis(200),
                ..DhtConfig::default()
            })
            .await
        }

        async fn node_with_config(&mut self, config: DhtConfig) -> DhtNode<MemoryTransport> {
            let host = self.next_host;
            self.next_host += 1;
            let addr = format!("10.0.0.{}:7000", host);
            let transport = self.hub.create(&addr, DEFAULT_PACKET_TIMEOUT);
            let scheme = Arc::new(PlatformScheme::generate());
            let origin = Origin::single(scheme.node_id(), Address::new(&addr).unwrap());
            let node = DhtNode::new(origin, transport, scheme as Arc<dyn CryptoScheme>, config);
            node.listen().await.unwrap();
            node
        }
    }

    async fn wait_for<F: Fn() -> bool>(cond: F, what: &str) {
        for _ in 0..100 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("timed out waiting for {}", what);
    }

    /// Wait for the echo handshake to land, re-driving the check-origin
    /// round if the server's spawned probe raced ahead of the auth key.
    async fn settle_handshake(server: &DhtNode<MemoryTransport>, client_id: &NodeId) {
        let client_b58 = client_id.to_base58();
        for _ in 0..50 {
            if server.is_authenticated(client_id) {
                return;
            }
            let _ = server.check_origin_request(&client_b58).await;
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("echo handshake never settled");
    }

    #[tokio::test]
    async fn bootstrap_populates_both_sides() {
        let mut net = TestNet::new();
        let seed = net.node().await;

        let config = DhtConfig {
            bootstrap_peers: vec![BootstrapEntry {
                id: None,
                address: seed.origin().address,
            }],
            packet_timeout: Duration::from_millis(500),
            ping_timeout: Duration::from_millis(200),
            ..DhtConfig::default()
        };
        let joiner = net.node_with_config(config).await;
        joiner.bootstrap().await.unwrap();

        assert_eq!(joiner.num_nodes(), 1);
        let seed_clone = seed.clone();
        wait_for(move || seed_clone.num_nodes() == 1, "seed to learn joiner").await;
    }

    #[tokio::test]
    async fn store_and_get_across_nodes() {
        let mut net = TestNet::new();
        let seed = net.node().await;
        let config = DhtConfig {
            bootstrap_peers: vec![BootstrapEntry {
                id: Some(seed.origin().ids[0]),
                address: seed.origin().address,
            }],
            packet_timeout: Duration::from_millis(500),
            ping_timeout: Duration::from_millis(200),
            ..DhtConfig::default()
        };
        let a = net.node_with_config(config.clone()).await;
        let b = net.node_with_config(config).await;
        a.bootstrap().await.unwrap();
        b.bootstrap().await.unwrap();

        let key = a.store(b"hello".to_vec()).await.unwrap();
        // The key is the base58 identifier hash of the content.
        let expected = bs58::encode(&a.scheme().id_hash(b"hello")).into_string();
        assert_eq!(key, expected);

        let value = b.get(&key).await.unwrap();
        assert_eq!(value, Some(b"hello".to_vec()));
    }

    #[tokio::test]
    async fn find_node_resolves_through_intermediary() {
        let mut net = TestNet::new();
        let seed = net.node().await;
        let config = DhtConfig {
            bootstrap_peers: vec![BootstrapEntry {
                id: None,
                address: seed.origin().address,
            }],
            packet_timeout: Duration::from_millis(500),
            ping_timeout: Duration::from_millis(200),
            ..DhtConfig::default()
        };
        let a = net.node_with_config(config.clone()).await;
        let b = net.node_with_config(config).await;
        a.bootstrap().await.unwrap();
        b.bootstrap().await.unwrap();

        let found = a.find_node(&b.origin_id()).await.unwrap();
        let found = found.expect("b not found");
        assert_eq!(found.id, b.origin().ids[0]);
        assert_eq!(found.address, b.origin().address);
    }

    #[tokio::test]
    async fn auth_handshake_and_revocation() {
        let mut net = TestNet::new();
        let server = net.node().await;
        let config = DhtConfig {
            bootstrap_peers: vec![BootstrapEntry {
                id: Some(server.origin().ids[0]),
                address: server.origin().address,
            }],
            packet_timeout: Duration::from_millis(500),
            ping_timeout: Duration::from_millis(200),
            ..DhtConfig::default()
        };
        let client = net.node_with_config(config).await;
        client.bootstrap().await.unwrap();

        let client_id = client.origin().ids[0];
        client
            .auth_request(AuthCommand::Begin, &server.origin_id())
            .await
            .unwrap();

        // The server spawns a check-origin probe right after answering; if
        // that raced ahead of our key arriving, drive another round.
        settle_handshake(&server, &client_id).await;

        // Revocation returns the state to pre-begin.
        client
            .auth_request(AuthCommand::Revoke, &server.origin_id())
            .await
            .unwrap();
        assert!(!server.is_authenticated(&client_id));
    }

    #[tokio::test]
    async fn relay_requires_authentication() {
        let mut net = TestNet::new();
        let server = net.node().await;
        let config = DhtConfig {
            bootstrap_peers: vec![BootstrapEntry {
                id: Some(server.origin().ids[0]),
                address: server.origin().address,
            }],
            packet_timeout: Duration::from_millis(500),
            ping_timeout: Duration::from_millis(200),
            ..DhtConfig::default()
        };
        let stranger = net.node_with_config(config).await;
        stranger.bootstrap().await.unwrap();

        let err = stranger
            .relay_request(RelayCommand::Start, &server.origin_id())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not authenticated"));
        assert_eq!(server.relay_clients_count(), 0);
        assert_eq!(stranger.proxy_count(), 0);
    }

    #[tokio::test]
    async fn relay_start_stop_round_trip_after_auth() {
        let mut net = TestNet::new();
        let server = net.node().await;
        let config = DhtConfig {
            bootstrap_peers: vec![BootstrapEntry {
                id: Some(server.origin().ids[0]),
                address: server.origin().address,
            }],
            packet_timeout: Duration::from_millis(500),
            ping_timeout: Duration::from_millis(200),
            ..DhtConfig::default()
        };
        let client = net.node_with_config(config).await;
        client.bootstrap().await.unwrap();

        let client_id = client.origin().ids[0];
        client
            .auth_request(AuthCommand::Begin, &server.origin_id())
            .await
            .unwrap();
        settle_handshake(&server, &client_id).await;

        client
            .relay_request(RelayCommand::Start, &server.origin_id())
            .await
            .unwrap();
        assert_eq!(server.relay_clients_count(), 1);
        assert_eq!(client.proxy_count(), 1);

        client
            .relay_request(RelayCommand::Stop, &server.origin_id())
            .await
            .unwrap();
        assert_eq!(server.relay_clients_count(), 0);
        assert_eq!(client.proxy_count(), 0);
    }

    #[tokio::test]
    async fn adaptive_expiration_bounds() {
        let mut net = TestNet::new();
        let node = net
            .node_with_config(DhtConfig {
                expiration_interval: Duration::from_secs(100),
                packet_timeout: Duration::from_millis(500),
                ping_timeout: Duration::from_millis(200),
                ..DhtConfig::default()
            })
            .await;

        let origin_id = node.origin().ids[0];
        // A key far from the origin: flip the top bit.
        let mut key: Key = origin_id.into();
        key[0] ^= 0x80;

        // Empty table: score 0 is treated as 1, lengthening the deadline by
        // exp(K).
        let deadline = node.expiration_deadline(0, &key);
        let base = Duration::from_secs(100);
        assert!(deadline > Instant::now() + base.mul_f64((MAX_CONTACTS_IN_BUCKET as f64 - 1.0).exp()));

        // Saturated coverage: exactly the base TTL.
        for i in 0..MAX_CONTACTS_IN_BUCKET as u8 {
            let mut bytes = key;
            bytes[crate::id::NODE_HASH_LEN - 1] = i + 1;
            node.add_peer(0, Peer::new(NodeId::from_bytes(bytes), node.origin().address))
                .await;
        }
        let deadline = node.expiration_deadline(0, &key);
        assert!(deadline <= Instant::now() + base);
        assert!(deadline > Instant::now() + base.mul_f64(0.9));
    }

    #[tokio::test]
    async fn known_outer_gossip_keeps_maximum() {
        let mut net = TestNet::new();
        let node = net.node().await;

        assert!(!node.absorb_known_outer(NodeId::from_bytes([1u8; 20]), 0));
        let better = NodeId::from_bytes([2u8; 20]);
        // A higher count is adopted and, with no proxy configured, chased.
        assert!(node.absorb_known_outer(better, 5));
        let high = node.high_known_outer();
        assert_eq!(high.id, Some(better));
        assert_eq!(high.outer_nodes, 5);

        // A lower count changes nothing.
        assert!(node.absorb_known_outer(NodeId::from_bytes([3u8; 20]), 2));
        assert_eq!(node.high_known_outer().id, Some(better));
    }

    #[tokio::test]
    async fn known_outer_tie_break_is_flag_gated() {
        let mut net = TestNet::new();
        let node = net
            .node_with_config(DhtConfig {
                deterministic_outer_tie_break: true,
                packet_timeout: Duration::from_millis(500),
                ping_timeout: Duration::from_millis(200),
                ..DhtConfig::default()
            })
            .await;

        let larger = NodeId::from_bytes([9u8; 20]);
        let smaller = NodeId::from_bytes([1u8; 20]);
        node.absorb_known_outer(larger, 5);
        node.absorb_known_outer(smaller, 5);
        assert_eq!(node.high_known_outer().id, Some(smaller));

        // Default behavior keeps the incumbent on ties.
        let plain = net.node().await;
        plain.absorb_known_outer(larger, 5);
        plain.absorb_known_outer(smaller, 5);
        assert_eq!(plain.high_known_outer().id, Some(larger));
    }

    #[tokio::test]
    async fn rpc_invocation_local_and_remote() {
        let mut net = TestNet::new();
        let server = net.node().await;
        server.remote_procedure_register(
            "concat",
            Arc::new(|args: Vec<Vec<u8>>| -> Result<Vec<u8>> {
                let mut out = Vec::new();
                for arg in args {
                    out.extend_from_slice(&arg);
                }
                Ok(out)
            }),
        );

        // Local invocation short-circuits the network.
        let result = server
            .remote_procedure_call(&server.origin_id(), "concat", vec![b"a".to_vec(), b"b".to_vec()])
            .await
            .unwrap();
        assert_eq!(result, b"ab");

        let config = DhtConfig {
            bootstrap_peers: vec![BootstrapEntry {
                id: Some(server.origin().ids[0]),
                address: server.origin().address,
            }],
            packet_timeout: Duration::from_millis(500),
            ping_timeout: Duration::from_millis(200),
            ..DhtConfig::default()
        };
        let client = net.node_with_config(config).await;
        client.bootstrap().await.unwrap();

        let result = client
            .remote_procedure_call(&server.origin_id(), "concat", vec![b"x".to_vec(), b"y".to_vec()])
            .await
            .unwrap();
        assert_eq!(result, b"xy");

        let err = client
            .remote_procedure_call(&server.origin_id(), "missing", vec![])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("unknown method"));
    }
}
