//! # Jet Coordinator
//!
//! Deterministic role selection: given a pulse's entropy, a salt (object
//! reference or jet prefix) and a count, pick node references from the
//! active set so that every node computing the same query arrives at the
//! same answer.
//!
//! The selection recipe:
//!
//! 1. Candidates of the requested static role, sorted by identifier.
//! 2. `mix = circle_xor(entropy, salt)` — byte-wise XOR with the shorter
//!    array cycled.
//! 3. [`select_by_entropy`] draws the requested number of distinct
//!    candidates from the mix.
//!
//! Entropy for the current pulse comes from memory; older pulses consult
//! the [`PulseTracker`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, RwLock};

use anyhow::{anyhow, bail, Result};

use crate::consensus::{Entropy, NodeKeeper, Pulse};
use crate::crypto::{select_by_entropy, CryptoScheme};
use crate::id::NodeId;
use crate::packet::StaticRole;

/// A reference to a record or object in the platform's namespace. Shares
/// the identifier space of the overlay.
pub type RecordRef = NodeId;

pub const VIRTUAL_EXECUTOR_COUNT: usize = 1;
pub const VIRTUAL_VALIDATOR_COUNT: usize = 3;
pub const MATERIAL_EXECUTOR_COUNT: usize = 1;
pub const MATERIAL_VALIDATOR_COUNT: usize = 3;

/// Per-pulse responsibilities a node can be asked to fill.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DynamicRole {
    VirtualExecutor,
    VirtualValidator,
    LightExecutor,
    LightValidator,
    HeavyExecutor,
}

/// Coordinator-facing message union. [`extract_target`] and
/// [`extract_role`] are total over it; adding a variant without extending
/// both is a compile-time error.
#[derive(Clone, Debug)]
pub enum Message {
    CallMethod { object: RecordRef },
    CallConstructor { parent: RecordRef },
    GetObject { head: RecordRef },
    GetChildren { parent: RecordRef },
    RegisterChild { parent: RecordRef, child: RecordRef },
    ValidateRecord { object: RecordRef },
    ValidationResults { record: RecordRef },
    HeavyPayload,
}

/// The record reference a message is bound to.
pub fn extract_target(message: &Message) -> RecordRef {
    match message {
        Message::CallMethod { object } => *object,
        Message::CallConstructor { parent } => *parent,
        Message::GetObject { head } => *head,
        Message::GetChildren { parent } => *parent,
        Message::RegisterChild { parent, .. } => *parent,
        Message::ValidateRecord { object } => *object,
        Message::ValidationResults { record } => *record,
        Message::HeavyPayload => RecordRef::WILDCARD,
    }
}

/// The dynamic role expected to handle a message.
pub fn extract_role(message: &Message) -> DynamicRole {
    match message {
        Message::CallMethod { .. } => DynamicRole::VirtualExecutor,
        Message::CallConstructor { .. } => DynamicRole::VirtualExecutor,
        Message::GetObject { .. } => DynamicRole::LightExecutor,
        Message::GetChildren { .. } => DynamicRole::LightExecutor,
        Message::RegisterChild { .. } => DynamicRole::LightExecutor,
        Message::ValidateRecord { .. } => DynamicRole::LightExecutor,
        Message::ValidationResults { .. } => DynamicRole::VirtualExecutor,
        Message::HeavyPayload => DynamicRole::HeavyExecutor,
    }
}

/// XOR `value` against `src`, cycling `src` when it is shorter. The result
/// has the length of `value`.
pub fn circle_xor(value: &[u8], src: &[u8]) -> Vec<u8> {
    if src.is_empty() {
        return value.to_vec();
    }
    let mut result = vec![0u8; value.len()];
    for (i, slot) in result.iter_mut().enumerate() {
        *slot = value[i] ^ src[i % src.len()];
    }
    result
}

/// In-memory pulse history for entropy queries against non-current pulses.
#[derive(Default)]
pub struct PulseTracker {
    current: RwLock<Option<Pulse>>,
    history: StdMutex<HashMap<u32, Pulse>>,
}

impl PulseTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a pulse and make it current.
    pub fn append(&self, pulse: Pulse) {
        self.history
            .lock()
            .expect("pulse tracker poisoned")
            .insert(pulse.pulse_number, pulse);
        *self.current.write().expect("pulse tracker poisoned") = Some(pulse);
    }

    pub fn current(&self) -> Result<Pulse> {
        self.current
            .read()
            .expect("pulse tracker poisoned")
            .ok_or_else(|| anyhow!("no current pulse"))
    }

    pub fn get(&self, pulse_number: u32) -> Option<Pulse> {
        self.history
            .lock()
            .expect("pulse tracker poisoned")
            .get(&pulse_number)
            .copied()
    }
}

/// Mapping from object references to jet prefixes. The namespace is split
/// at a fixed bit depth.
#[derive(Clone, Copy, Debug)]
pub struct JetTree {
    depth_bits: usize,
}

impl Default for JetTree {
    fn default() -> Self {
        Self { depth_bits: 8 }
    }
}

impl JetTree {
    pub fn new(depth_bits: usize) -> Self {
        Self {
            depth_bits: depth_bits.max(1),
        }
    }

    /// The jet prefix owning an object.
    pub fn prefix_for(&self, object: &RecordRef) -> Vec<u8> {
        let bytes = self.depth_bits.div_ceil(8).min(crate::id::NODE_HASH_LEN);
        object.as_bytes()[..bytes].to_vec()
    }
}

/// Role-to-node resolution against the active set at a pulse.
pub struct JetCoordinator {
    keeper: Arc<NodeKeeper>,
    scheme: Arc<dyn CryptoScheme>,
    tracker: Arc<PulseTracker>,
    jets: JetTree,
}

impl JetCoordinator {
    pub fn new(
        keeper: Arc<NodeKeeper>,
        scheme: Arc<dyn CryptoScheme>,
        tracker: Arc<PulseTracker>,
    ) -> Self {
        Self {
            keeper,
            scheme,
            tracker,
            jets: JetTree::default(),
        }
    }

    pub fn with_jet_tree(mut self, jets: JetTree) -> Self {
        self.jets = jets;
        self
    }

    /// This node's reference.
    pub fn me(&self) -> RecordRef {
        self.keeper.origin().id
    }

    /// Whether `node` holds `role` for `object` at `pulse_number`.
    pub fn is_authorized(
        &self,
        role: DynamicRole,
        object: &RecordRef,
        pulse_number: u32,
        node: &NodeId,
    ) -> Result<bool> {
        let nodes = self.query_role(role, object, pulse_number)?;
        Ok(nodes.contains(node))
    }

    /// Node references responsible for `role`-bound operations on `object`
    /// at `pulse_number`. Deterministic: repeated queries return the same
    /// references.
    pub fn query_role(
        &self,
        role: DynamicRole,
        object: &RecordRef,
        pulse_number: u32,
    ) -> Result<Vec<NodeId>> {
        match role {
            DynamicRole::VirtualExecutor => {
                let nodes = self.virtuals_for_object(object, pulse_number, VIRTUAL_EXECUTOR_COUNT)?;
                Ok(nodes)
            }
            DynamicRole::VirtualValidator => self.virtual_validators_for_object(object, pulse_number),
            DynamicRole::LightExecutor => {
                let prefix = self.jets.prefix_for(object);
                let nodes =
                    self.light_materials_for_jet(&prefix, pulse_number, MATERIAL_EXECUTOR_COUNT)?;
                Ok(nodes)
            }
            DynamicRole::LightValidator => self.light_validators_for_object(object, pulse_number),
            DynamicRole::HeavyExecutor => self.heavy(pulse_number).map(|node| vec![node]),
        }
    }

    pub fn virtual_executor_for_object(
        &self,
        object: &RecordRef,
        pulse_number: u32,
    ) -> Result<NodeId> {
        let nodes = self.virtuals_for_object(object, pulse_number, VIRTUAL_EXECUTOR_COUNT)?;
        Ok(nodes[0])
    }

    /// Validators are drawn after skipping the executor slots, so the same
    /// node never validates what it executed.
    pub fn virtual_validators_for_object(
        &self,
        object: &RecordRef,
        pulse_number: u32,
    ) -> Result<Vec<NodeId>> {
        let nodes = self.virtuals_for_object(
            object,
            pulse_number,
            VIRTUAL_VALIDATOR_COUNT + VIRTUAL_EXECUTOR_COUNT,
        )?;
        Ok(nodes[VIRTUAL_EXECUTOR_COUNT..].to_vec())
    }

    pub fn light_executor_for_object(
        &self,
        object: &RecordRef,
        pulse_number: u32,
    ) -> Result<NodeId> {
        let prefix = self.jets.prefix_for(object);
        let nodes = self.light_materials_for_jet(&prefix, pulse_number, MATERIAL_EXECUTOR_COUNT)?;
        Ok(nodes[0])
    }

    pub fn light_validators_for_object(
        &self,
        object: &RecordRef,
        pulse_number: u32,
    ) -> Result<Vec<NodeId>> {
        let prefix = self.jets.prefix_for(object);
        let nodes = self.light_materials_for_jet(
            &prefix,
            pulse_number,
            MATERIAL_VALIDATOR_COUNT + MATERIAL_EXECUTOR_COUNT,
        )?;
        Ok(nodes[MATERIAL_EXECUTOR_COUNT..].to_vec())
    }

    /// The heavy-material node for a pulse, drawn from entropy directly.
    pub fn heavy(&self, pulse_number: u32) -> Result<NodeId> {
        let candidates = self.candidates(pulse_number, StaticRole::HeavyMaterial)?;
        let entropy = self.entropy(pulse_number)?;
        let nodes = get_refs(self.scheme.as_ref(), &entropy.0, candidates, 1)?;
        Ok(nodes[0])
    }

    fn virtuals_for_object(
        &self,
        object: &RecordRef,
        pulse_number: u32,
        count: usize,
    ) -> Result<Vec<NodeId>> {
        let candidates = self.candidates(pulse_number, StaticRole::Virtual)?;
        let entropy = self.entropy(pulse_number)?;
        let mix = circle_xor(&entropy.0, object.as_bytes());
        get_refs(self.scheme.as_ref(), &mix, candidates, count)
    }

    fn light_materials_for_jet(
        &self,
        prefix: &[u8],
        pulse_number: u32,
        count: usize,
    ) -> Result<Vec<NodeId>> {
        let candidates = self.candidates(pulse_number, StaticRole::LightMaterial)?;
        let entropy = self.entropy(pulse_number)?;
        let mix = circle_xor(&entropy.0, prefix);
        get_refs(self.scheme.as_ref(), &mix, candidates, count)
    }

    fn candidates(&self, pulse_number: u32, role: StaticRole) -> Result<Vec<NodeId>> {
        let set = self
            .keeper
            .active_at(pulse_number)
            .ok_or_else(|| anyhow!("no active node set recorded for pulse {}", pulse_number))?;
        let candidates: Vec<NodeId> = set.by_role(role).into_iter().map(|n| n.id).collect();
        if candidates.is_empty() {
            bail!("no active {:?} nodes for pulse {}", role, pulse_number);
        }
        Ok(candidates)
    }

    /// In-memory entropy for the current pulse, tracker lookup otherwise.
    fn entropy(&self, pulse_number: u32) -> Result<Entropy> {
        let current = self.tracker.current()?;
        if current.pulse_number == pulse_number {
            return Ok(current.entropy);
        }
        self.tracker
            .get(pulse_number)
            .map(|pulse| pulse.entropy)
            .ok_or_else(|| anyhow!("no pulse data recorded for pulse {}", pulse_number))
    }
}

fn get_refs(
    scheme: &dyn CryptoScheme,
    entropy: &[u8],
    mut candidates: Vec<NodeId>,
    count: usize,
) -> Result<Vec<NodeId>> {
    candidates.sort();
    select_by_entropy(scheme, entropy, &candidates, count).map_err(|e| anyhow!("{}", e))
}
