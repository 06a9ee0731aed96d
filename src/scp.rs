use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use log::debug;
use sha2::{Digest, Sha256};

use crate::ballot::Phase;
use crate::crypto::{Hash32, NodeId, SecretKey};
use crate::local_node::LocalNode;
use crate::quorum::QuorumSet;
use crate::slot::Slot;
use crate::statement::{Ballot, Envelope, SlotIndex, Value};
use crate::Result;

/// Capabilities the embedding application provides to the engine.
///
/// The engine never touches the network, a clock, or storage itself: values
/// are validated and combined by the host, envelopes are handed to the host
/// for gossip, and timers are armed through the host. The `ballot_did_*`
/// hooks are observability only.
pub trait Driver {
    /// Whether `value` is acceptable for this slot. A refusal keeps the
    /// engine from voting for or accepting the value; it is not an error.
    fn validate_value(&self, slot_index: SlotIndex, node_id: &NodeId, value: &Value) -> bool;

    /// Deterministically merges confirmed candidates into the value the
    /// ballot protocol will run on.
    fn combine_candidates(&mut self, slot_index: SlotIndex, candidates: &BTreeSet<Value>)
        -> Value;

    /// The slot has irrevocably decided `value`. Called exactly once per slot.
    fn value_externalized(&mut self, slot_index: SlotIndex, value: &Value);

    /// Hands a freshly signed envelope to the transport. Called only after
    /// the transition that produced it has fully completed.
    fn emit_envelope(&mut self, envelope: &Envelope);

    /// Cache lookup for a peer's quorum set. Returning `None` defers the
    /// envelope until the set is supplied via [`Scp::receive_quorum_set`].
    fn quorum_set(&self, hash: &Hash32) -> Option<QuorumSet>;

    /// Per-round hash used by nomination leader election. Overridable so
    /// tests can pin priorities; the default is a keyed SHA-256 extraction.
    fn compute_hash(
        &self,
        slot_index: SlotIndex,
        is_priority: bool,
        round_number: u32,
        node_id: &NodeId,
    ) -> u64 {
        let mut sha256 = Sha256::new();
        sha256.update(b"scp-hash");
        sha256.update(slot_index.to_be_bytes());
        sha256.update([u8::from(is_priority)]);
        sha256.update(round_number.to_be_bytes());
        sha256.update(node_id.as_bytes());
        let digest = sha256.finalize();
        let mut out = [0u8; 8];
        out.copy_from_slice(&digest[..8]);
        u64::from_be_bytes(out)
    }

    fn ballot_did_prepare(&mut self, _slot_index: SlotIndex, _ballot: &Ballot) {}
    fn ballot_did_prepared(&mut self, _slot_index: SlotIndex, _ballot: &Ballot) {}
    fn ballot_did_commit(&mut self, _slot_index: SlotIndex, _ballot: &Ballot) {}
    fn ballot_did_committed(&mut self, _slot_index: SlotIndex, _ballot: &Ballot) {}
    fn ballot_did_hear_from_quorum(&mut self, _slot_index: SlotIndex, _ballot: &Ballot) {}

    fn arm_ballot_timer(&mut self, _slot_index: SlotIndex, _delay: Duration) {}
    fn arm_nomination_timer(&mut self, _slot_index: SlotIndex, _delay: Duration) {}
}

/// One consensus participant: a slot registry over a single identity.
///
/// All calls are expected on one logical executor; the engine holds no locks
/// and never blocks.
pub struct Scp<D: Driver> {
    local_node: LocalNode,
    driver: D,
    slots: BTreeMap<SlotIndex, Slot>,
}

impl<D: Driver> Scp<D> {
    pub fn new(secret_key: SecretKey, quorum_set: QuorumSet, driver: D) -> Result<Self> {
        Ok(Self {
            local_node: LocalNode::new(secret_key, quorum_set)?,
            driver,
            slots: BTreeMap::new(),
        })
    }

    pub fn local_node(&self) -> &LocalNode {
        &self.local_node
    }

    pub fn node_id(&self) -> &NodeId {
        self.local_node.node_id()
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    pub fn driver_mut(&mut self) -> &mut D {
        &mut self.driver
    }

    pub fn update_quorum_set(&mut self, quorum_set: QuorumSet) -> Result<()> {
        self.local_node.update_quorum_set(quorum_set)
    }

    /// Feeds a signed envelope from the transport into its slot.
    ///
    /// Returns true when the envelope advanced or was absorbed into the
    /// slot's state (including deferral on an unknown quorum set); false when
    /// it was dropped as invalid, malformed or stale.
    pub fn receive_envelope(&mut self, envelope: Envelope) -> bool {
        let index = envelope.statement.slot_index;
        let slot = self
            .slots
            .entry(index)
            .or_insert_with(|| Slot::new(index, &self.local_node));
        slot.receive_envelope(&self.local_node, &mut self.driver, envelope)
    }

    /// Starts or re-drives nomination for a slot with a host-proposed value.
    /// `timed_out` marks a nomination-timer round change. Returns true iff a
    /// NOMINATE statement was emitted.
    pub fn nominate(&mut self, slot_index: SlotIndex, value: Value, timed_out: bool) -> bool {
        let slot = self
            .slots
            .entry(slot_index)
            .or_insert_with(|| Slot::new(slot_index, &self.local_node));
        slot.nominate(&self.local_node, &mut self.driver, value, timed_out)
    }

    /// Moves the ballot protocol onto `value`, seeding or bumping the
    /// current ballot. Used to start balloting and on ballot timeouts.
    pub fn bump_state(&mut self, slot_index: SlotIndex, value: Value, force: bool) -> bool {
        let slot = self
            .slots
            .entry(slot_index)
            .or_insert_with(|| Slot::new(slot_index, &self.local_node));
        slot.bump_state(&self.local_node, &mut self.driver, value, force)
    }

    /// Supplies a quorum set the host has retrieved; any envelopes deferred
    /// on its hash are re-dispatched in arrival order.
    pub fn receive_quorum_set(&mut self, quorum_set: QuorumSet) -> Result<()> {
        quorum_set.check_valid()?;
        let hash = quorum_set.hash()?;
        debug!("[SCP] quorum set {:?} resolved", hash);
        for slot in self.slots.values_mut() {
            slot.quorum_set_resolved(&self.local_node, &mut self.driver, &hash, &quorum_set);
        }
        Ok(())
    }

    pub fn phase(&self, slot_index: SlotIndex) -> Option<Phase> {
        self.slots.get(&slot_index).map(Slot::phase)
    }

    /// The composite value nomination last produced for this slot.
    pub fn latest_composite_candidate(&self, slot_index: SlotIndex) -> Option<&Value> {
        self.slots
            .get(&slot_index)
            .and_then(Slot::latest_composite_candidate)
    }

    /// The newest ballot envelope this node signed for the slot. After
    /// externalization this is the EXTERNALIZE statement, kept around so the
    /// host can rebroadcast it to late peers.
    pub fn latest_envelope(&self, slot_index: SlotIndex) -> Option<&Envelope> {
        self.slots.get(&slot_index).and_then(Slot::latest_envelope)
    }

    /// The decided value, once the slot has externalized.
    pub fn externalized_value(&self, slot_index: SlotIndex) -> Option<&Value> {
        self.slots
            .get(&slot_index)
            .and_then(Slot::externalized_value)
    }
}
