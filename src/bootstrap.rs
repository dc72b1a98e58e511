//! # Discovery Bootstrap
//!
//! Joining through certified discovery peers happens in two steps:
//!
//! 1. **Bootstrap** — ping a discovery node and send it a `Bootstrap`
//!    request. The answer is `Accepted`, `Rejected` with a reason, or
//!    `Redirected` at another host, which is followed. With infinity
//!    bootstrap enabled, a failed attempt retries with multiplicative
//!    backoff between the configured bounds.
//! 2. **Genesis** — once *all* discovery nodes answered the bootstrap
//!    round, each is sent this node's `NodeStruct` and last-seen pulse and
//!    returns its own. The highest pulse seen becomes the last ignored
//!    pulse; identifier or short-identifier collisions abort the join.
//!
//! The genesis exchange is gated on the local last pulse having been set at
//! least once (by an incoming pulse or a peer's genesis request), so a
//! fresh node never advertises a pulse it invented. Genesis answers
//! already received as requests are served from cache.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, RwLock};
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::consensus::{NetworkNode, NodeKeeper};
use crate::dht::DhtNode;
use crate::id::{Address, NodeId, Peer};
use crate::packet::{
    BootstrapCode, NodeStruct, Packet, PacketData, PacketType, RequestData, ResponseData,
};
use crate::transport::Transport;

/// A certified discovery peer from the node's certificate.
#[derive(Clone, Debug)]
pub struct DiscoveryNode {
    pub id: NodeId,
    pub address: Address,
}

/// Discovery bootstrap configuration.
#[derive(Clone, Debug)]
pub struct BootstrapConfig {
    pub discovery_nodes: Vec<DiscoveryNode>,
    /// Deadline for each bootstrap/genesis round.
    pub bootstrap_timeout: Duration,
    /// First retry delay when infinity bootstrap is on.
    pub min_timeout: Duration,
    /// Retry delay ceiling.
    pub max_timeout: Duration,
    /// Multiplier applied to the delay after each failed attempt.
    pub timeout_multiplier: u32,
    /// Retry discovery nodes forever instead of failing fast.
    pub infinity_bootstrap: bool,
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            discovery_nodes: Vec::new(),
            bootstrap_timeout: Duration::from_secs(10),
            min_timeout: Duration::from_millis(500),
            max_timeout: Duration::from_secs(10),
            timeout_multiplier: 2,
            infinity_bootstrap: false,
        }
    }
}

/// Driver of the discovery bootstrap protocol for one node.
pub struct Bootstrapper<T: Transport> {
    dht: DhtNode<T>,
    keeper: Arc<NodeKeeper>,
    config: BootstrapConfig,
    last_pulse: RwLock<u32>,
    pulse_persisted: StdMutex<bool>,
    gate_tx: watch::Sender<bool>,
    genesis_cache: StdMutex<HashMap<NodeId, (u32, NodeStruct)>>,
}

impl<T: Transport> Bootstrapper<T> {
    pub fn new(dht: DhtNode<T>, keeper: Arc<NodeKeeper>, config: BootstrapConfig) -> Arc<Self> {
        let (gate_tx, _) = watch::channel(false);
        Arc::new(Self {
            dht,
            keeper,
            config,
            last_pulse: RwLock::new(0),
            pulse_persisted: StdMutex::new(false),
            gate_tx,
            genesis_cache: StdMutex::new(HashMap::new()),
        })
    }

    /// Register the bootstrap and genesis packet handlers on the DHT.
    pub fn start(self: &Arc<Self>) {
        self.dht.register_packet_handler(
            PacketType::Bootstrap,
            Arc::new(move |_packet| {
                // TODO: redirect joiners toward less-loaded discovery nodes.
                Some(ResponseData::Bootstrap {
                    code: BootstrapCode::Accepted,
                })
            }),
        );
        let this = self.clone();
        self.dht.register_packet_handler(
            PacketType::Genesis,
            Arc::new(move |packet| this.process_genesis(packet)),
        );
    }

    fn process_genesis(&self, packet: &Packet) -> Option<ResponseData> {
        let (last_pulse, discovery) = match &packet.data {
            PacketData::Request(RequestData::Genesis {
                last_pulse,
                discovery,
            }) => (*last_pulse, discovery.clone()),
            _ => return None,
        };
        self.set_last_pulse(last_pulse);
        self.genesis_cache
            .lock()
            .expect("genesis cache poisoned")
            .insert(packet.sender.id, (last_pulse, discovery));
        Some(ResponseData::Genesis {
            last_pulse: self.last_pulse(),
            discovery: Some(self.keeper.origin().to_struct()),
            error: String::new(),
        })
    }

    /// Record the last pulse once. The first call closes the genesis gate;
    /// later calls are no-ops.
    pub fn set_last_pulse(&self, number: u32) {
        let mut persisted = self.pulse_persisted.lock().expect("pulse flag poisoned");
        if !*persisted {
            *self.last_pulse.write().expect("last pulse poisoned") = number;
            *persisted = true;
            let _ = self.gate_tx.send(true);
        }
    }

    fn force_set_last_pulse(&self, number: u32) {
        debug!(pulse = number, "network will start from pulse");
        *self.last_pulse.write().expect("last pulse poisoned") = number;
    }

    pub fn last_pulse(&self) -> u32 {
        *self.last_pulse.read().expect("last pulse poisoned")
    }

    async fn wait_gate(&self) {
        let mut rx = self.gate_tx.subscribe();
        if *rx.borrow() {
            return;
        }
        while rx.changed().await.is_ok() {
            if *rx.borrow() {
                return;
            }
        }
    }

    fn origin_peer(&self) -> Peer {
        Peer::new(self.dht.origin().ids[0], self.dht.origin().address)
    }

    async fn request(&self, request: Packet) -> Result<Packet> {
        let future = self.dht.transport().send_request(request).await?;
        match tokio::time::timeout(self.config.bootstrap_timeout, future.response()).await {
            Ok(Some(rsp)) => Ok(rsp),
            Ok(None) => bail!("channel closed unexpectedly"),
            Err(_) => bail!("bootstrap timeout"),
        }
    }

    async fn ping(&self, address: Address) -> Result<Peer> {
        let receiver = Peer::new(NodeId::WILDCARD, address);
        let request = Packet::request(self.origin_peer(), receiver, RequestData::Ping);
        let rsp = self.request(request).await?;
        Ok(rsp.sender)
    }

    /// Ping an address and run the bootstrap request, following redirects.
    async fn start_bootstrap(&self, address: Address) -> Result<Peer> {
        const MAX_REDIRECTS: usize = 8;
        let mut address = address;
        for _ in 0..MAX_REDIRECTS {
            let peer = self.ping(address).await?;
            let request = Packet::request(self.origin_peer(), peer, RequestData::Bootstrap);
            let rsp = self.request(request).await?;
            match rsp.data {
                PacketData::Response(ResponseData::Bootstrap { code }) => match code {
                    BootstrapCode::Accepted => return Ok(rsp.sender),
                    BootstrapCode::Rejected { reason } => bail!("rejected: {}", reason),
                    BootstrapCode::Redirected { host } => {
                        debug!(%host, "bootstrap redirected");
                        address = Address::new(&host)?;
                    }
                },
                other => bail!("unexpected bootstrap response: {:?}", other),
            }
        }
        bail!("too many bootstrap redirects")
    }

    /// One attempt with the configured retry policy applied.
    async fn bootstrap_with_retry(&self, address: Address) -> Result<Peer> {
        let mut delay = self.config.min_timeout;
        loop {
            match self.start_bootstrap(address).await {
                Ok(peer) => return Ok(peer),
                Err(e) if self.config.infinity_bootstrap => {
                    debug!(%address, error = %e, "bootstrap attempt failed, backing off");
                    tokio::time::sleep(delay).await;
                    delay = (delay * self.config.timeout_multiplier).min(self.config.max_timeout);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Step 1: bootstrap to any one discovery node.
    pub async fn bootstrap(self: &Arc<Self>) -> Result<Peer> {
        info!("bootstrapping to discovery node");
        let mut join: JoinSet<Result<Peer>> = JoinSet::new();
        for discovery in self.config.discovery_nodes.clone() {
            let this = self.clone();
            join.spawn(async move { this.bootstrap_with_retry(discovery.address).await });
        }

        let winner = tokio::time::timeout(self.config.bootstrap_timeout, async {
            while let Some(joined) = join.join_next().await {
                if let Ok(Ok(peer)) = joined {
                    return Some(peer);
                }
            }
            None
        })
        .await;
        match winner {
            Ok(Some(peer)) => Ok(peer),
            _ => bail!("failed to bootstrap to any of discovery nodes"),
        }
    }

    /// Step 2: the full exchange between certified discovery peers.
    pub async fn bootstrap_discovery(self: &Arc<Self>) -> Result<()> {
        info!("network bootstrap between discovery nodes");
        let origin_id = self.dht.origin().ids[0];
        let discovery_nodes: Vec<DiscoveryNode> = self
            .config
            .discovery_nodes
            .iter()
            .filter(|d| d.id != origin_id)
            .cloned()
            .collect();
        let required = discovery_nodes.len();
        if required == 0 {
            return Ok(());
        }

        // Keep running bootstrap rounds until every discovery node answered.
        let mut hosts: Vec<Peer>;
        loop {
            hosts = self.bootstrap_round(&discovery_nodes).await;
            if hosts.len() == required {
                break;
            }
            warn!(
                successful = hosts.len(),
                total = required,
                "bootstrap round incomplete, retrying"
            );
        }

        self.wait_gate().await;
        debug!("bootstrap gate passed");

        let (nodes, last_pulses) = self.collect_genesis(&hosts).await?;

        let max_ignored = last_pulses
            .into_iter()
            .fold(self.last_pulse(), |acc, pulse| acc.max(pulse));
        self.force_set_last_pulse(max_ignored);

        for node in &nodes {
            self.keeper
                .check_collision(node)
                .map_err(|e| anyhow!(e).context(format!("discovery check of node {} failed", node.id)))?;
        }
        let joined: Vec<String> = nodes.iter().map(|n| n.id.to_base58()).collect();
        self.keeper.add_active_nodes(nodes)?;
        info!(nodes = ?joined, "added active nodes");
        Ok(())
    }

    async fn bootstrap_round(self: &Arc<Self>, discovery_nodes: &[DiscoveryNode]) -> Vec<Peer> {
        let mut join: JoinSet<Result<Peer>> = JoinSet::new();
        for discovery in discovery_nodes {
            let address = discovery.address;
            let this = self.clone();
            join.spawn(async move { this.start_bootstrap(address).await });
        }

        let mut hosts = Vec::new();
        let collected = tokio::time::timeout(self.config.bootstrap_timeout, async {
            while let Some(joined) = join.join_next().await {
                if let Ok(Ok(peer)) = joined {
                    hosts.push(peer);
                }
            }
        })
        .await;
        if collected.is_err() {
            debug!("bootstrap round hit the deadline");
        }
        hosts
    }

    async fn collect_genesis(&self, hosts: &[Peer]) -> Result<(Vec<NetworkNode>, Vec<u32>)> {
        let mut nodes = Vec::new();
        let mut last_pulses = Vec::new();
        for host in hosts {
            let (last_pulse, wire) = self.send_genesis_request(*host).await?;
            let node = node_from_struct(wire)?;
            debug!(node = %node.id, last_pulse, "genesis info received");
            nodes.push(node);
            last_pulses.push(last_pulse);
        }
        Ok((nodes, last_pulses))
    }

    async fn send_genesis_request(&self, host: Peer) -> Result<(u32, NodeStruct)> {
        let cached = {
            self.genesis_cache
                .lock()
                .expect("genesis cache poisoned")
                .get(&host.id)
                .cloned()
        };
        if let Some(entry) = cached {
            info!(node = %host.id, "got genesis info from cache");
            return Ok(entry);
        }

        let request = Packet::request(
            self.origin_peer(),
            host,
            RequestData::Genesis {
                last_pulse: self.last_pulse(),
                discovery: self.keeper.origin().to_struct(),
            },
        );
        let rsp = self.request(request).await?;
        match rsp.data {
            PacketData::Response(ResponseData::Genesis {
                last_pulse,
                discovery,
                error,
            }) => match discovery {
                Some(node) => Ok((last_pulse, node)),
                None => bail!("error genesis response from discovery node: {}", error),
            },
            other => bail!("unexpected genesis response: {:?}", other),
        }
    }
}

/// Build a runtime node record from its wire form, validating the key.
fn node_from_struct(wire: NodeStruct) -> Result<NetworkNode> {
    if wire.public_key.is_empty() {
        bail!("error deserializing node public key");
    }
    Ok(NetworkNode::from_struct(wire))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::{generate_short_id, CollisionError};
    use crate::crypto::{CryptoScheme, PlatformScheme};
    use crate::dht::{DhtConfig, DhtNode, Origin};
    use crate::packet::StaticRole;
    use crate::transport::memory::{MemoryHub, MemoryTransport};
    use crate::transport::DEFAULT_PACKET_TIMEOUT;

    struct DiscoveryHarness {
        hub: Arc<MemoryHub>,
        next_host: u8,
    }

    struct DiscoveryMember {
        node: NetworkNode,
        dht: DhtNode<MemoryTransport>,
        keeper: Arc<NodeKeeper>,
    }

    impl DiscoveryHarness {
        fn new() -> Self {
            Self {
                hub: MemoryHub::new(),
                next_host: 1,
            }
        }

        async fn member(&mut self, short_id_override: Option<u32>) -> DiscoveryMember {
            let host = self.next_host;
            self.next_host += 1;
            let addr = format!("10.1.0.{}:7100", host);
            let transport = self.hub.create(&addr, DEFAULT_PACKET_TIMEOUT);
            let scheme = Arc::new(PlatformScheme::generate());
            let id = scheme.node_id();
            let node = NetworkNode {
                id,
                short_id: short_id_override
                    .unwrap_or_else(|| generate_short_id(scheme.as_ref(), &id)),
                role: StaticRole::Virtual,
                public_key: scheme.public_key(),
                address: addr.clone(),
                version: "test".into(),
            };
            let origin = Origin::single(id, Address::new(&addr).unwrap());
            let dht = DhtNode::new(
                origin,
                transport,
                scheme as Arc<dyn CryptoScheme>,
                DhtConfig {
                    packet_timeout: Duration::from_millis(500),
                    ping_timeout: Duration::from_millis(200),
                    ..DhtConfig::default()
                },
            );
            dht.listen().await.unwrap();
            let keeper = Arc::new(NodeKeeper::new(node.clone()));
            DiscoveryMember { node, dht, keeper }
        }

        fn bootstrapper(
            &self,
            member: &DiscoveryMember,
            others: &[&DiscoveryMember],
        ) -> Arc<Bootstrapper<MemoryTransport>> {
            let discovery_nodes = others
                .iter()
                .map(|m| DiscoveryNode {
                    id: m.node.id,
                    address: Address::new(&m.node.address).unwrap(),
                })
                .collect();
            let bootstrapper = Bootstrapper::new(
                member.dht.clone(),
                member.keeper.clone(),
                BootstrapConfig {
                    discovery_nodes,
                    bootstrap_timeout: Duration::from_secs(2),
                    ..BootstrapConfig::default()
                },
            );
            bootstrapper.start();
            bootstrapper
        }
    }

    #[tokio::test]
    async fn bootstrap_reaches_a_discovery_node() {
        let mut harness = DiscoveryHarness::new();
        let anchor = harness.member(None).await;
        let joiner = harness.member(None).await;

        let _anchor_boot = harness.bootstrapper(&anchor, &[&joiner]);
        let joiner_boot = harness.bootstrapper(&joiner, &[&anchor]);

        let found = joiner_boot.bootstrap().await.unwrap();
        assert_eq!(found.id, anchor.node.id);
    }

    #[tokio::test]
    async fn discovery_bootstrap_exchanges_genesis() {
        let mut harness = DiscoveryHarness::new();
        let a = harness.member(None).await;
        let b = harness.member(None).await;

        let a_boot = harness.bootstrapper(&a, &[&b]);
        let b_boot = harness.bootstrapper(&b, &[&a]);

        a_boot.set_last_pulse(3);
        b_boot.set_last_pulse(7);

        let a_task = {
            let boot = a_boot.clone();
            tokio::spawn(async move { boot.bootstrap_discovery().await })
        };
        let b_task = {
            let boot = b_boot.clone();
            tokio::spawn(async move { boot.bootstrap_discovery().await })
        };
        a_task.await.unwrap().unwrap();
        b_task.await.unwrap().unwrap();

        // Each side learned the other; the highest pulse wins everywhere.
        assert!(a.keeper.get_active_node(&b.node.id).is_some());
        assert!(b.keeper.get_active_node(&a.node.id).is_some());
        assert_eq!(a_boot.last_pulse(), 7);
        assert_eq!(b_boot.last_pulse(), 7);
    }

    #[tokio::test]
    async fn duplicate_short_id_aborts_the_join() {
        let mut harness = DiscoveryHarness::new();
        let a = harness.member(Some(4242)).await;
        // The impostor advertises the same short identifier.
        let impostor = harness.member(Some(4242)).await;

        let a_boot = harness.bootstrapper(&a, &[&impostor]);
        let _impostor_boot = harness.bootstrapper(&impostor, &[&a]);

        a_boot.set_last_pulse(1);
        let err = a_boot.bootstrap_discovery().await.unwrap_err();
        match err.downcast_ref::<CollisionError>() {
            Some(CollisionError::ShortId(short)) => assert_eq!(*short, 4242),
            other => panic!("expected a short-id collision, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn genesis_answers_are_cached() {
        let mut harness = DiscoveryHarness::new();
        let a = harness.member(None).await;
        let b = harness.member(None).await;

        let a_boot = harness.bootstrapper(&a, &[&b]);
        let b_boot = harness.bootstrapper(&b, &[&a]);
        a_boot.set_last_pulse(1);
        b_boot.set_last_pulse(2);

        // b's request seeds a's cache before a ever asks the network.
        let b_task = {
            let boot = b_boot.clone();
            tokio::spawn(async move { boot.bootstrap_discovery().await })
        };
        b_task.await.unwrap().unwrap();

        let cached = {
            a_boot
                .genesis_cache
                .lock()
                .unwrap()
                .get(&b.node.id)
                .cloned()
        };
        let cached = cached.expect("genesis request was not cached");
        assert_eq!(cached.1.id, b.node.id);
    }
}
