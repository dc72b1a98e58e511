//! # Pulse-Driven Membership Consensus
//!
//! Once per pulse every node runs three ordered phases, each budgeted at a
//! fraction of the pulse duration:
//!
//! 1. **Proof exchange** — the node computes a merkle proof over the pulse
//!    and its local state, signs it and trades proofs with every active
//!    peer. Claims accumulated since the last pulse ride along. Received
//!    proofs are partitioned into *valid* (signature verifies under the
//!    peer's registered public key) and *fault*.
//! 2. **Aggregation** — the valid proofs are folded into a globule merkle
//!    root, the aggregate is exchanged and disagreements logged.
//! 3. **Commit** — the new [`ActiveNodeSet`] (valid-proof peers plus self)
//!    is installed atomically in the [`NodeKeeper`].
//!
//! A phase-1 round that yields no valid proof at all fails the pulse; the
//! previous active set is retained. Later phases tolerate partial results.
//!
//! Network transfer is abstracted behind [`PhaseExchange`]; the production
//! implementation rides the DHT's RPC packets, tests script their own.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex as StdMutex, RwLock};
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::crypto::CryptoScheme;
use crate::dht::DhtNode;
use crate::id::{NodeId, ShortId};
use crate::packet::{NodeStruct, StaticRole};
use crate::transport::Transport;

/// Width of pulse entropy in bytes.
pub const ENTROPY_SIZE: usize = 64;

/// Fixed-width random material carried by every pulse.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Entropy(pub [u8; ENTROPY_SIZE]);

impl Entropy {
    pub fn zero() -> Self {
        Self([0u8; ENTROPY_SIZE])
    }

    pub fn from_bytes(bytes: [u8; ENTROPY_SIZE]) -> Self {
        Self(bytes)
    }
}

impl fmt::Debug for Entropy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Entropy({})", hex::encode(&self.0[..8]))
    }
}

impl Serialize for Entropy {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(&self.0)
    }
}

impl<'de> Deserialize<'de> for Entropy {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct EntropyVisitor;

        impl<'de> serde::de::Visitor<'de> for EntropyVisitor {
            type Value = Entropy;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{} entropy bytes", ENTROPY_SIZE)
            }

            fn visit_bytes<E: serde::de::Error>(self, v: &[u8]) -> Result<Entropy, E> {
                let arr: [u8; ENTROPY_SIZE] = v
                    .try_into()
                    .map_err(|_| E::invalid_length(v.len(), &self))?;
                Ok(Entropy(arr))
            }

            fn visit_byte_buf<E: serde::de::Error>(self, v: Vec<u8>) -> Result<Entropy, E> {
                self.visit_bytes(&v)
            }

            fn visit_seq<A: serde::de::SeqAccess<'de>>(self, mut seq: A) -> Result<Entropy, A::Error> {
                let mut arr = [0u8; ENTROPY_SIZE];
                for (i, slot) in arr.iter_mut().enumerate() {
                    *slot = seq
                        .next_element()?
                        .ok_or_else(|| serde::de::Error::invalid_length(i, &self))?;
                }
                Ok(Entropy(arr))
            }
        }

        deserializer.deserialize_bytes(EntropyVisitor)
    }
}

/// A time tick emitted by the external pulsar.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pulse {
    pub pulse_number: u32,
    pub prev_pulse_number: u32,
    pub next_pulse_number: u32,
    pub entropy: Entropy,
}

impl Pulse {
    pub fn new(pulse_number: u32, prev: u32, next: u32, entropy: Entropy) -> Self {
        Self {
            pulse_number,
            prev_pulse_number: prev,
            next_pulse_number: next,
            entropy,
        }
    }
}

/// Runtime record of an active network participant.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NetworkNode {
    pub id: NodeId,
    pub short_id: ShortId,
    pub role: StaticRole,
    pub public_key: Vec<u8>,
    pub address: String,
    pub version: String,
}

impl NetworkNode {
    pub fn from_struct(wire: NodeStruct) -> Self {
        Self {
            id: wire.id,
            short_id: wire.short_id,
            role: wire.role,
            public_key: wire.public_key,
            address: wire.address,
            version: wire.version,
        }
    }

    pub fn to_struct(&self) -> NodeStruct {
        NodeStruct {
            id: self.id,
            short_id: self.short_id,
            role: self.role,
            public_key: self.public_key.clone(),
            address: self.address.clone(),
            version: self.version.clone(),
        }
    }
}

/// Derive the compact alias a node is known by inside one active set.
pub fn generate_short_id(scheme: &dyn CryptoScheme, id: &NodeId) -> ShortId {
    let hash = scheme.reference_hash(id.as_bytes());
    u32::from_be_bytes([hash[0], hash[1], hash[2], hash[3]])
}

/// Identifier collision detected while merging nodes into an active set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CollisionError {
    NodeId(NodeId),
    ShortId(ShortId),
}

impl fmt::Display for CollisionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CollisionError::NodeId(id) => write!(f, "node ID collision: {}", id),
            CollisionError::ShortId(short) => write!(f, "short ID collision: {}", short),
        }
    }
}

impl std::error::Error for CollisionError {}

/// Snapshot of the nodes validated at one pulse, indexed both ways.
#[derive(Clone, Debug, Default)]
pub struct ActiveNodeSet {
    pulse_number: u32,
    by_id: HashMap<NodeId, NetworkNode>,
    by_short: HashMap<ShortId, NodeId>,
}

impl ActiveNodeSet {
    pub fn new(pulse_number: u32) -> Self {
        Self {
            pulse_number,
            by_id: HashMap::new(),
            by_short: HashMap::new(),
        }
    }

    pub fn pulse_number(&self) -> u32 {
        self.pulse_number
    }

    /// Insert a node, rejecting duplicate identifiers either way.
    pub fn insert(&mut self, node: NetworkNode) -> Result<(), CollisionError> {
        if self.by_id.contains_key(&node.id) {
            return Err(CollisionError::NodeId(node.id));
        }
        if self.by_short.contains_key(&node.short_id) {
            return Err(CollisionError::ShortId(node.short_id));
        }
        self.by_short.insert(node.short_id, node.id);
        self.by_id.insert(node.id, node);
        Ok(())
    }

    pub fn get(&self, id: &NodeId) -> Option<&NetworkNode> {
        self.by_id.get(id)
    }

    pub fn get_by_short(&self, short: ShortId) -> Option<&NetworkNode> {
        self.by_short.get(&short).and_then(|id| self.by_id.get(id))
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    /// Members in stable (lexicographic identifier) order.
    pub fn nodes(&self) -> Vec<NetworkNode> {
        let mut nodes: Vec<NetworkNode> = self.by_id.values().cloned().collect();
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        nodes
    }

    pub fn by_role(&self, role: StaticRole) -> Vec<NetworkNode> {
        let mut nodes: Vec<NetworkNode> = self
            .by_id
            .values()
            .filter(|n| n.role == role)
            .cloned()
            .collect();
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        nodes
    }
}

/// Holder of the origin record and the published active set, with history
/// per pulse for role queries against older pulses.
pub struct NodeKeeper {
    origin: NetworkNode,
    current: RwLock<Arc<ActiveNodeSet>>,
    history: StdMutex<HashMap<u32, Arc<ActiveNodeSet>>>,
}

impl NodeKeeper {
    /// Start with an active set containing only the origin.
    pub fn new(origin: NetworkNode) -> Self {
        let mut set = ActiveNodeSet::new(0);
        set.insert(origin.clone()).expect("empty set cannot collide");
        let set = Arc::new(set);
        let mut history = HashMap::new();
        history.insert(0, set.clone());
        Self {
            origin,
            current: RwLock::new(set),
            history: StdMutex::new(history),
        }
    }

    pub fn origin(&self) -> &NetworkNode {
        &self.origin
    }

    pub fn active(&self) -> Arc<ActiveNodeSet> {
        self.current.read().expect("keeper poisoned").clone()
    }

    /// Snapshot valid at a given pulse, falling back to the current set when
    /// the pulse matches it.
    pub fn active_at(&self, pulse_number: u32) -> Option<Arc<ActiveNodeSet>> {
        let current = self.active();
        if current.pulse_number() == pulse_number {
            return Some(current);
        }
        self.history
            .lock()
            .expect("keeper poisoned")
            .get(&pulse_number)
            .cloned()
    }

    pub fn get_active_node(&self, id: &NodeId) -> Option<NetworkNode> {
        self.active().get(id).cloned()
    }

    pub fn get_by_short_id(&self, short: ShortId) -> Option<NetworkNode> {
        self.active().get_by_short(short).cloned()
    }

    /// Reject a candidate that collides with the current set.
    pub fn check_collision(&self, node: &NetworkNode) -> Result<(), CollisionError> {
        let active = self.active();
        if active.get(&node.id).is_some() {
            return Err(CollisionError::NodeId(node.id));
        }
        if active.get_by_short(node.short_id).is_some() {
            return Err(CollisionError::ShortId(node.short_id));
        }
        Ok(())
    }

    /// Merge nodes into the current set (discovery bootstrap path).
    pub fn add_active_nodes(&self, nodes: Vec<NetworkNode>) -> Result<(), CollisionError> {
        let mut current = self.current.write().expect("keeper poisoned");
        let mut next = (**current).clone();
        for node in nodes {
            next.insert(node)?;
        }
        let next = Arc::new(next);
        self.history
            .lock()
            .expect("keeper poisoned")
            .insert(next.pulse_number(), next.clone());
        *current = next;
        Ok(())
    }

    /// Atomically replace the active set and record it in history.
    pub fn install(&self, set: ActiveNodeSet) {
        let set = Arc::new(set);
        self.history
            .lock()
            .expect("keeper poisoned")
            .insert(set.pulse_number(), set.clone());
        *self.current.write().expect("keeper poisoned") = set;
    }
}

/// A signed statement a node makes about itself, valid only within the
/// pulse it names.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum NodeClaim {
    Join {
        node: NodeStruct,
        pulse_number: u32,
        signature: Vec<u8>,
    },
    Announce {
        node: NodeStruct,
        unsync_bit_length: u16,
        pulse_number: u32,
        signature: Vec<u8>,
    },
    Leave {
        id: NodeId,
        pulse_number: u32,
        signature: Vec<u8>,
    },
}

impl NodeClaim {
    pub fn join(scheme: &dyn CryptoScheme, node: NodeStruct, pulse_number: u32) -> Self {
        let mut claim = NodeClaim::Join {
            node,
            pulse_number,
            signature: Vec::new(),
        };
        let signature = scheme.sign(&claim.signed_payload());
        if let NodeClaim::Join { signature: slot, .. } = &mut claim {
            *slot = signature;
        }
        claim
    }

    pub fn announce(
        scheme: &dyn CryptoScheme,
        node: NodeStruct,
        unsync_bit_length: u16,
        pulse_number: u32,
    ) -> Self {
        let mut claim = NodeClaim::Announce {
            node,
            unsync_bit_length,
            pulse_number,
            signature: Vec::new(),
        };
        let signature = scheme.sign(&claim.signed_payload());
        if let NodeClaim::Announce { signature: slot, .. } = &mut claim {
            *slot = signature;
        }
        claim
    }

    pub fn leave(scheme: &dyn CryptoScheme, id: NodeId, pulse_number: u32) -> Self {
        let mut claim = NodeClaim::Leave {
            id,
            pulse_number,
            signature: Vec::new(),
        };
        let signature = scheme.sign(&claim.signed_payload());
        if let NodeClaim::Leave { signature: slot, .. } = &mut claim {
            *slot = signature;
        }
        claim
    }

    /// The bytes covered by the claim signature: the claim with an empty
    /// signature slot.
    fn signed_payload(&self) -> Vec<u8> {
        let mut unsigned = self.clone();
        match &mut unsigned {
            NodeClaim::Join { signature, .. }
            | NodeClaim::Announce { signature, .. }
            | NodeClaim::Leave { signature, .. } => signature.clear(),
        }
        bincode::serialize(&unsigned).expect("claim serialization cannot fail")
    }

    pub fn claimant(&self) -> NodeId {
        match self {
            NodeClaim::Join { node, .. } => node.id,
            NodeClaim::Announce { node, .. } => node.id,
            NodeClaim::Leave { id, .. } => *id,
        }
    }

    pub fn pulse_number(&self) -> u32 {
        match self {
            NodeClaim::Join { pulse_number, .. }
            | NodeClaim::Announce { pulse_number, .. }
            | NodeClaim::Leave { pulse_number, .. } => *pulse_number,
        }
    }

    fn signature(&self) -> &[u8] {
        match self {
            NodeClaim::Join { signature, .. }
            | NodeClaim::Announce { signature, .. }
            | NodeClaim::Leave { signature, .. } => signature,
        }
    }

    /// Verify under the claimant's public key.
    pub fn verify(&self, scheme: &dyn CryptoScheme, public_key: &[u8]) -> bool {
        scheme.verify(public_key, &self.signed_payload(), self.signature())
    }

    /// Public key embedded in the claim, when it carries one.
    pub fn embedded_public_key(&self) -> Option<&[u8]> {
        match self {
            NodeClaim::Join { node, .. } => Some(&node.public_key),
            NodeClaim::Announce { node, .. } => Some(&node.public_key),
            NodeClaim::Leave { .. } => None,
        }
    }
}

/// Signed merkle statement over (pulse, local state).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PulseProof {
    pub state_hash: Vec<u8>,
    pub signature: Vec<u8>,
}

/// Merkle material builder shared by proof creation and verification.
pub struct MerkleCalculator {
    scheme: Arc<dyn CryptoScheme>,
}

impl MerkleCalculator {
    pub fn new(scheme: Arc<dyn CryptoScheme>) -> Self {
        Self { scheme }
    }

    pub fn pulse_hash(&self, pulse: &Pulse) -> Vec<u8> {
        let encoded = bincode::serialize(pulse).expect("pulse serialization cannot fail");
        self.scheme.reference_hash(&encoded)
    }

    fn merkle_pair(&self, left: &[u8], right: &[u8]) -> Vec<u8> {
        let mut material = Vec::with_capacity(left.len() + right.len());
        material.extend_from_slice(left);
        material.extend_from_slice(right);
        self.scheme.reference_hash(&material)
    }

    /// Sign the merkle root of (pulse hash, state hash) with our key.
    pub fn pulse_proof(&self, pulse: &Pulse, state: &[u8]) -> PulseProof {
        let state_hash = self.scheme.reference_hash(state);
        let root = self.merkle_pair(&self.pulse_hash(pulse), &state_hash);
        PulseProof {
            state_hash,
            signature: self.scheme.sign(&root),
        }
    }

    pub fn verify_pulse_proof(&self, pulse: &Pulse, proof: &PulseProof, public_key: &[u8]) -> bool {
        let root = self.merkle_pair(&self.pulse_hash(pulse), &proof.state_hash);
        self.scheme.verify(public_key, &root, &proof.signature)
    }

    /// Globule root over the proof set: per-member leaves in identifier
    /// order, reduced pairwise.
    pub fn globule_hash(&self, pulse: &Pulse, proofs: &[(NodeId, PulseProof)]) -> Vec<u8> {
        let pulse_hash = self.pulse_hash(pulse);
        let mut layer: Vec<Vec<u8>> = {
            let mut sorted: Vec<&(NodeId, PulseProof)> = proofs.iter().collect();
            sorted.sort_by(|a, b| a.0.cmp(&b.0));
            sorted
                .into_iter()
                .map(|(_, proof)| self.merkle_pair(&pulse_hash, &proof.state_hash))
                .collect()
        };
        if layer.is_empty() {
            return pulse_hash;
        }
        while layer.len() > 1 {
            let mut next = Vec::with_capacity(layer.len().div_ceil(2));
            let mut chunks = layer.chunks(2);
            for chunk in &mut chunks {
                match chunk {
                    [left, right] => next.push(self.merkle_pair(left, right)),
                    [single] => next.push(single.clone()),
                    _ => unreachable!("chunks of two"),
                }
            }
            layer = next;
        }
        layer.remove(0)
    }
}

/// Proofs and claims offered to a peer during phase 1.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Phase1Request {
    pub pulse: Pulse,
    pub proof: PulseProof,
    pub claims: Vec<NodeClaim>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Phase1Response {
    pub proof: PulseProof,
    pub claims: Vec<NodeClaim>,
}

/// Aggregate offered during phase 2.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Phase2Request {
    pub pulse_number: u32,
    pub globule_hash: Vec<u8>,
    pub member_ids: Vec<NodeId>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Phase2Response {
    pub globule_hash: Vec<u8>,
    pub approved: bool,
}

/// Carrier of phase messages between nodes.
#[async_trait]
pub trait PhaseExchange: Send + Sync + 'static {
    async fn exchange_phase1(
        &self,
        peer: &NetworkNode,
        request: Phase1Request,
    ) -> Result<Phase1Response>;

    async fn exchange_phase2(
        &self,
        peer: &NetworkNode,
        request: Phase2Request,
    ) -> Result<Phase2Response>;
}

/// Participation state of this node.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeState {
    Ready,
    Waiting,
}

/// Sparse bit list synthesized by waiting nodes from an announce claim.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SparseBitSet {
    bits: Vec<u8>,
    bit_length: u16,
}

impl SparseBitSet {
    pub fn zeros(bit_length: u16) -> Self {
        Self {
            bits: vec![0u8; (bit_length as usize).div_ceil(8)],
            bit_length,
        }
    }

    pub fn bit_length(&self) -> u16 {
        self.bit_length
    }

    pub fn set(&mut self, index: u16) {
        if index < self.bit_length {
            self.bits[(index / 8) as usize] |= 0x80 >> (index % 8);
        }
    }

    pub fn get(&self, index: u16) -> bool {
        if index >= self.bit_length {
            return false;
        }
        self.bits[(index / 8) as usize] & (0x80 >> (index % 8)) != 0
    }
}

/// Phase timing configuration.
#[derive(Clone, Debug)]
pub struct ConsensusConfig {
    /// Wall-clock length of one pulse.
    pub pulse_duration: Duration,
    /// Fraction of the pulse duration granted to each phase.
    pub phase_fraction: f64,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            pulse_duration: Duration::from_secs(10),
            phase_fraction: 0.2,
        }
    }
}

impl ConsensusConfig {
    fn phase_timeout(&self) -> Duration {
        self.pulse_duration.mul_f64(self.phase_fraction)
    }
}

/// The per-pulse membership engine.
pub struct Consensus<E: PhaseExchange> {
    keeper: Arc<NodeKeeper>,
    scheme: Arc<dyn CryptoScheme>,
    calculator: MerkleCalculator,
    exchange: Arc<E>,
    config: ConsensusConfig,
    state: StdMutex<NodeState>,
    local_state: StdMutex<Vec<u8>>,
    pending_claims: StdMutex<Vec<NodeClaim>>,
    pending_joins: StdMutex<HashMap<NodeId, NetworkNode>>,
    pending_leaves: StdMutex<HashSet<NodeId>>,
    last_globule: StdMutex<Option<(u32, Vec<u8>)>>,
    last_unsync: StdMutex<Option<SparseBitSet>>,
}

impl<E: PhaseExchange> Consensus<E> {
    pub fn new(
        keeper: Arc<NodeKeeper>,
        scheme: Arc<dyn CryptoScheme>,
        exchange: Arc<E>,
        config: ConsensusConfig,
    ) -> Self {
        Self {
            keeper,
            calculator: MerkleCalculator::new(scheme.clone()),
            scheme,
            exchange,
            config,
            state: StdMutex::new(NodeState::Ready),
            local_state: StdMutex::new(Vec::new()),
            pending_claims: StdMutex::new(Vec::new()),
            pending_joins: StdMutex::new(HashMap::new()),
            pending_leaves: StdMutex::new(HashSet::new()),
            last_globule: StdMutex::new(None),
            last_unsync: StdMutex::new(None),
        }
    }

    pub fn keeper(&self) -> &Arc<NodeKeeper> {
        &self.keeper
    }

    pub fn set_node_state(&self, state: NodeState) {
        *self.state.lock().expect("consensus poisoned") = state;
    }

    pub fn node_state(&self) -> NodeState {
        *self.state.lock().expect("consensus poisoned")
    }

    /// Material folded into this node's pulse proofs.
    pub fn set_local_state(&self, state: Vec<u8>) {
        *self.local_state.lock().expect("consensus poisoned") = state;
    }

    /// Queue a claim for the next pulse's phase-1 exchange.
    pub fn add_claim(&self, claim: NodeClaim) {
        self.pending_claims.lock().expect("consensus poisoned").push(claim);
    }

    fn claims_snapshot(&self) -> Vec<NodeClaim> {
        self.pending_claims.lock().expect("consensus poisoned").clone()
    }

    /// The unsync list synthesized during the last waiting-state pulse.
    pub fn last_unsync_list(&self) -> Option<SparseBitSet> {
        self.last_unsync.lock().expect("consensus poisoned").clone()
    }

    /// Fold verified claims for this pulse into the join/leave intents.
    fn absorb_claims(&self, pulse: &Pulse, claims: &[NodeClaim]) {
        for claim in claims {
            if claim.pulse_number() != pulse.pulse_number {
                debug!(
                    claimant = %claim.claimant(),
                    claim_pulse = claim.pulse_number(),
                    pulse = pulse.pulse_number,
                    "discarding claim from another pulse"
                );
                continue;
            }
            let verified = match claim.embedded_public_key() {
                Some(key) => claim.verify(self.scheme.as_ref(), key),
                None => match self.keeper.get_active_node(&claim.claimant()) {
                    Some(node) => claim.verify(self.scheme.as_ref(), &node.public_key),
                    None => false,
                },
            };
            if !verified {
                warn!(claimant = %claim.claimant(), "claim signature does not verify");
                continue;
            }
            match claim {
                NodeClaim::Join { node, .. } => {
                    self.pending_joins
                        .lock()
                        .expect("consensus poisoned")
                        .insert(node.id, NetworkNode::from_struct(node.clone()));
                }
                NodeClaim::Announce { .. } => {}
                NodeClaim::Leave { id, .. } => {
                    self.pending_leaves.lock().expect("consensus poisoned").insert(*id);
                }
            }
        }
    }

    /// Serve a peer's phase-1 exchange: absorb its claims, answer with our
    /// proof for the named pulse and our own pending claims.
    pub fn handle_phase1(&self, request: Phase1Request) -> Result<Phase1Response> {
        self.absorb_claims(&request.pulse, &request.claims);
        let local_state = self.local_state.lock().expect("consensus poisoned").clone();
        let proof = self.calculator.pulse_proof(&request.pulse, &local_state);
        Ok(Phase1Response {
            proof,
            claims: self.claims_snapshot(),
        })
    }

    /// Serve a peer's phase-2 exchange: approve when its aggregate matches
    /// the one we computed for that pulse.
    pub fn handle_phase2(&self, request: Phase2Request) -> Result<Phase2Response> {
        let ours = self.last_globule.lock().expect("consensus poisoned").clone();
        match ours {
            Some((pulse_number, hash)) if pulse_number == request.pulse_number => {
                let approved = hash == request.globule_hash;
                Ok(Phase2Response {
                    globule_hash: hash,
                    approved,
                })
            }
            _ => Ok(Phase2Response {
                globule_hash: Vec::new(),
                approved: false,
            }),
        }
    }

    /// Execute the three phases for one pulse.
    pub async fn on_pulse(&self, pulse: Pulse) -> Result<()> {
        let phase_timeout = self.config.phase_timeout();
        let origin = self.keeper.origin().clone();

        // Assemble the exchange set: active peers minus leavers, plus
        // verified joiners awaiting their first proof round.
        let leaves = self.pending_leaves.lock().expect("consensus poisoned").clone();
        let mut peers: Vec<NetworkNode> = self
            .keeper
            .active()
            .nodes()
            .into_iter()
            .filter(|n| n.id != origin.id && !leaves.contains(&n.id))
            .collect();
        {
            let joins = self.pending_joins.lock().expect("consensus poisoned");
            for node in joins.values() {
                if node.id != origin.id && !peers.iter().any(|p| p.id == node.id) {
                    peers.push(node.clone());
                }
            }
        }

        let local_state = self.local_state.lock().expect("consensus poisoned").clone();
        let own_proof = self.calculator.pulse_proof(&pulse, &local_state);
        let own_claims = self.claims_snapshot();

        // Phase 1: proof exchange, parallel to all.
        let mut join_set: JoinSet<(NetworkNode, Result<Phase1Response>)> = JoinSet::new();
        for peer in peers.clone() {
            let exchange = self.exchange.clone();
            let request = Phase1Request {
                pulse,
                proof: own_proof.clone(),
                claims: own_claims.clone(),
            };
            join_set.spawn(async move {
                let result =
                    match tokio::time::timeout(phase_timeout, exchange.exchange_phase1(&peer, request))
                        .await
                    {
                        Ok(result) => result,
                        Err(_) => Err(anyhow!("phase 1 exchange timed out")),
                    };
                (peer, result)
            });
        }

        let mut valid: Vec<(NetworkNode, PulseProof)> = Vec::new();
        let mut fault: Vec<NodeId> = Vec::new();
        let mut gathered_claims: Vec<NodeClaim> = Vec::new();
        while let Some(joined) = join_set.join_next().await {
            let (peer, result) = match joined {
                Ok(entry) => entry,
                Err(_) => continue,
            };
            match result {
                Ok(response) => {
                    if self
                        .calculator
                        .verify_pulse_proof(&pulse, &response.proof, &peer.public_key)
                    {
                        gathered_claims.extend(response.claims);
                        valid.push((peer, response.proof));
                    } else {
                        warn!(peer = %peer.id, "pulse proof signature mismatch, marking fault");
                        fault.push(peer.id);
                    }
                }
                Err(e) => {
                    debug!(peer = %peer.id, error = %e, "phase 1 exchange failed");
                }
            }
        }
        self.absorb_claims(&pulse, &gathered_claims);

        if self.node_state() == NodeState::Waiting {
            let announced = gathered_claims.iter().find_map(|claim| match claim {
                NodeClaim::Announce { unsync_bit_length, .. } => Some(*unsync_bit_length),
                _ => None,
            });
            if let Some(bit_length) = announced {
                debug!(bit_length, "synthesized sparse unsync list from announce claim");
                *self.last_unsync.lock().expect("consensus poisoned") =
                    Some(SparseBitSet::zeros(bit_length));
            }
        }

        if valid.is_empty() && !peers.is_empty() {
            bail!(
                "pulse {} failed: no valid pulse proofs gathered from {} peers",
                pulse.pulse_number,
                peers.len()
            );
        }

        // Phase 2: globule aggregation and reconciliation.
        let mut member_proofs: Vec<(NodeId, PulseProof)> = valid
            .iter()
            .map(|(peer, proof)| (peer.id, proof.clone()))
            .collect();
        member_proofs.push((origin.id, own_proof));
        let globule = self.calculator.globule_hash(&pulse, &member_proofs);
        *self.last_globule.lock().expect("consensus poisoned") =
            Some((pulse.pulse_number, globule.clone()));
        let member_ids: Vec<NodeId> = member_proofs.iter().map(|(id, _)| *id).collect();

        let mut join_set: JoinSet<(NodeId, Result<Phase2Response>)> = JoinSet::new();
        for (peer, _) in valid.clone() {
            let exchange = self.exchange.clone();
            let request = Phase2Request {
                pulse_number: pulse.pulse_number,
                globule_hash: globule.clone(),
                member_ids: member_ids.clone(),
            };
            join_set.spawn(async move {
                let result =
                    match tokio::time::timeout(phase_timeout, exchange.exchange_phase2(&peer, request))
                        .await
                    {
                        Ok(result) => result,
                        Err(_) => Err(anyhow!("phase 2 exchange timed out")),
                    };
                (peer.id, result)
            });
        }
        let mut agreements = 0usize;
        while let Some(joined) = join_set.join_next().await {
            if let Ok((peer_id, result)) = joined {
                match result {
                    Ok(response) if response.approved && response.globule_hash == globule => {
                        agreements += 1;
                    }
                    Ok(_) => {
                        debug!(peer = %peer_id, "globule aggregate disagreement");
                    }
                    Err(e) => {
                        debug!(peer = %peer_id, error = %e, "phase 2 exchange failed");
                    }
                }
            }
        }

        // Phase 3: commit.
        let mut set = ActiveNodeSet::new(pulse.pulse_number);
        set.insert(origin.clone())
            .map_err(|e| anyhow!("origin cannot join its own set: {}", e))?;
        for (peer, _) in &valid {
            if let Err(e) = set.insert(peer.clone()) {
                warn!(peer = %peer.id, error = %e, "dropping colliding member from new set");
            }
        }
        let installed = set.len();
        self.keeper.install(set);

        // Joiners that made it are no longer pending; leave intents are
        // consumed by this pulse either way.
        {
            let active = self.keeper.active();
            let mut joins = self.pending_joins.lock().expect("consensus poisoned");
            joins.retain(|id, _| active.get(id).is_none());
        }
        self.pending_leaves.lock().expect("consensus poisoned").clear();
        self.pending_claims.lock().expect("consensus poisoned").clear();

        info!(
            pulse = pulse.pulse_number,
            active = installed,
            valid = valid.len(),
            fault = fault.len(),
            agreements,
            "pulse committed"
        );
        Ok(())
    }
}

/// Phase exchange over the DHT's RPC packets.
pub struct DhtPhaseExchange<T: Transport> {
    dht: DhtNode<T>,
}

impl<T: Transport> DhtPhaseExchange<T> {
    pub fn new(dht: DhtNode<T>) -> Self {
        Self { dht }
    }
}

/// RPC method names the consensus engine answers on.
pub const PHASE1_METHOD: &str = "consensus.phase1";
pub const PHASE2_METHOD: &str = "consensus.phase2";

/// Register the phase procedures on a DHT node so peers can reach this
/// consensus instance.
pub fn register_consensus_procedures<T, E>(dht: &DhtNode<T>, consensus: Arc<Consensus<E>>)
where
    T: Transport,
    E: PhaseExchange,
{
    let phase1 = consensus.clone();
    dht.remote_procedure_register(
        PHASE1_METHOD,
        Arc::new(move |args: Vec<Vec<u8>>| -> Result<Vec<u8>> {
            let raw = args.first().ok_or_else(|| anyhow!("missing phase 1 argument"))?;
            let request: Phase1Request = bincode::deserialize(raw)?;
            let response = phase1.handle_phase1(request)?;
            Ok(bincode::serialize(&response)?)
        }),
    );
    let phase2 = consensus;
    dht.remote_procedure_register(
        PHASE2_METHOD,
        Arc::new(move |args: Vec<Vec<u8>>| -> Result<Vec<u8>> {
            let raw = args.first().ok_or_else(|| anyhow!("missing phase 2 argument"))?;
            let request: Phase2Request = bincode::deserialize(raw)?;
            let response = phase2.handle_phase2(request)?;
            Ok(bincode::serialize(&response)?)
        }),
    );
}

#[async_trait]
impl<T: Transport> PhaseExchange for DhtPhaseExchange<T> {
    async fn exchange_phase1(
        &self,
        peer: &NetworkNode,
        request: Phase1Request,
    ) -> Result<Phase1Response> {
        let args = vec![bincode::serialize(&request)?];
        let raw = self
            .dht
            .remote_procedure_call(&peer.id.to_base58(), PHASE1_METHOD, args)
            .await?;
        Ok(bincode::deserialize(&raw)?)
    }

    async fn exchange_phase2(
        &self,
        peer: &NetworkNode,
        request: Phase2Request,
    ) -> Result<Phase2Response> {
        let args = vec![bincode::serialize(&request)?];
        let raw = self
            .dht
            .remote_procedure_call(&peer.id.to_base58(), PHASE2_METHOD, args)
            .await?;
        Ok(bincode::deserialize(&raw)?)
    }
}
