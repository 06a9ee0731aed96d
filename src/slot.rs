use std::collections::BTreeMap;

use log::debug;

use crate::ballot::{BallotProtocol, Phase};
use crate::crypto::{Hash32, NodeId};
use crate::local_node::LocalNode;
use crate::nomination::NominationProtocol;
use crate::quorum::{self, QuorumSet};
use crate::scp::Driver;
use crate::statement::{Envelope, Pledge, SlotIndex, Statement, Value};
use crate::{Error, Result};

/// Everything a protocol transition may reach for: the local identity, the
/// host driver, and the slot's resolved quorum sets. Emissions are buffered
/// here and only handed to the transport once the outermost transition has
/// completed.
pub(crate) struct Context<'a, D: Driver> {
    pub slot_index: SlotIndex,
    pub local_node: &'a LocalNode,
    pub driver: &'a mut D,
    quorum_sets: &'a BTreeMap<Hash32, QuorumSet>,
    singletons: &'a BTreeMap<NodeId, QuorumSet>,
    pub latest_composite: Option<Value>,
    emitted: Vec<Envelope>,
}

impl<'a, D: Driver> Context<'a, D> {
    pub fn emit(&mut self, envelope: Envelope) {
        self.emitted.push(envelope);
    }

    /// The quorum set a statement claims. An EXTERNALIZE statement stands on
    /// its sender's singleton set: an externalized node is self-authoritative.
    pub fn statement_quorum_set(&self, statement: &Statement) -> Option<&'a QuorumSet> {
        match &statement.pledge {
            Pledge::Externalize(_) => self.singletons.get(&statement.node_id),
            _ => self.quorum_sets.get(statement.quorum_set_hash()),
        }
    }

    /// The federated "accept" rule: a v-blocking set already accepts, or a
    /// quorum votes-or-accepts.
    pub fn federated_accept(
        &self,
        voted: impl Fn(&NodeId, &Statement) -> bool,
        accepted: impl Fn(&NodeId, &Statement) -> bool,
        statements: &BTreeMap<NodeId, Statement>,
    ) -> bool {
        if quorum::is_v_blocking(self.local_node.quorum_set(), statements, &accepted) {
            return true;
        }
        quorum::is_quorum(
            self.local_node.quorum_set(),
            statements,
            |st| self.statement_quorum_set(st),
            |node, st| accepted(node, st) || voted(node, st),
        )
    }

    /// The federated "confirm" rule: a quorum asserts the predicate.
    pub fn federated_ratify(
        &self,
        voted: impl Fn(&NodeId, &Statement) -> bool,
        statements: &BTreeMap<NodeId, Statement>,
    ) -> bool {
        quorum::is_quorum(
            self.local_node.quorum_set(),
            statements,
            |st| self.statement_quorum_set(st),
            voted,
        )
    }
}

/// One consensus round: routes envelopes into nomination and balloting and
/// owns the quorum sets resolved for this slot.
pub(crate) struct Slot {
    index: SlotIndex,
    nomination: NominationProtocol,
    ballot: BallotProtocol,
    quorum_sets: BTreeMap<Hash32, QuorumSet>,
    singletons: BTreeMap<NodeId, QuorumSet>,
    // envelopes waiting on a quorum set the host has not produced yet
    pending: BTreeMap<Hash32, Vec<Envelope>>,
}

impl Slot {
    pub fn new(index: SlotIndex, local_node: &LocalNode) -> Self {
        let mut quorum_sets = BTreeMap::new();
        quorum_sets.insert(
            *local_node.quorum_set_hash(),
            local_node.quorum_set().clone(),
        );
        quorum_sets.insert(
            *local_node.singleton_quorum_set_hash(),
            local_node.singleton_quorum_set().clone(),
        );
        let mut singletons = BTreeMap::new();
        singletons.insert(
            *local_node.node_id(),
            local_node.singleton_quorum_set().clone(),
        );
        Self {
            index,
            nomination: NominationProtocol::new(),
            ballot: BallotProtocol::new(),
            quorum_sets,
            singletons,
            pending: BTreeMap::new(),
        }
    }

    pub fn phase(&self) -> Phase {
        self.ballot.phase()
    }

    pub fn latest_composite_candidate(&self) -> Option<&Value> {
        self.nomination.latest_composite()
    }

    pub fn latest_envelope(&self) -> Option<&Envelope> {
        self.ballot.last_envelope()
    }

    pub fn externalized_value(&self) -> Option<&Value> {
        self.ballot.externalized_value()
    }

    pub fn receive_envelope<D: Driver>(
        &mut self,
        local_node: &LocalNode,
        driver: &mut D,
        envelope: Envelope,
    ) -> bool {
        match self.admit(local_node, driver, envelope) {
            Ok(valid) => valid,
            Err(err) => {
                debug!("[SCP] slot {}: dropping envelope: {}", self.index, err);
                false
            }
        }
    }

    fn admit<D: Driver>(
        &mut self,
        local_node: &LocalNode,
        driver: &mut D,
        envelope: Envelope,
    ) -> Result<bool> {
        let statement = &envelope.statement;
        if statement.slot_index != self.index {
            return Err(Error::WrongSlot {
                statement_slot: statement.slot_index,
                slot: self.index,
            });
        }
        envelope.verify()?;
        statement.check_sane()?;

        match &statement.pledge {
            Pledge::Externalize(_) => {
                let node_id = statement.node_id;
                self.singletons
                    .entry(node_id)
                    .or_insert_with(|| QuorumSet::singleton(node_id));
            }
            _ => {
                let hash = *statement.quorum_set_hash();
                if !self.quorum_sets.contains_key(&hash) {
                    match driver.quorum_set(&hash) {
                        Some(quorum_set) => {
                            quorum_set.check_valid()?;
                            if quorum_set.hash()? != hash {
                                return Err(Error::QuorumSetHashMismatch(hash));
                            }
                            self.quorum_sets.insert(hash, quorum_set);
                        }
                        None => {
                            debug!(
                                "[SCP] slot {}: deferring envelope until quorum set {:?} is known",
                                self.index, hash
                            );
                            self.pending.entry(hash).or_default().push(envelope);
                            return Ok(true);
                        }
                    }
                }
            }
        }

        self.dispatch(local_node, driver, &envelope)
    }

    fn dispatch<D: Driver>(
        &mut self,
        local_node: &LocalNode,
        driver: &mut D,
        envelope: &Envelope,
    ) -> Result<bool> {
        let mut ctx = Context {
            slot_index: self.index,
            local_node,
            driver,
            quorum_sets: &self.quorum_sets,
            singletons: &self.singletons,
            latest_composite: self.nomination.latest_composite().cloned(),
            emitted: Vec::new(),
        };

        let valid = match &envelope.statement.pledge {
            Pledge::Nominate(_) => {
                if self.ballot.phase() == Phase::Externalize {
                    // decided slots ignore nomination traffic
                    false
                } else {
                    let valid = self.nomination.process_envelope(&mut ctx, envelope)?;
                    if let Some(composite) = self.nomination.take_pending_bump() {
                        self.ballot.bump_state(&mut ctx, composite, false)?;
                    }
                    valid
                }
            }
            _ => self.ballot.process_envelope(&mut ctx, envelope)?,
        };

        let Context {
            driver, emitted, ..
        } = ctx;
        for outbound in &emitted {
            driver.emit_envelope(outbound);
        }
        Ok(valid)
    }

    pub fn nominate<D: Driver>(
        &mut self,
        local_node: &LocalNode,
        driver: &mut D,
        value: Value,
        timed_out: bool,
    ) -> bool {
        let mut ctx = Context {
            slot_index: self.index,
            local_node,
            driver,
            quorum_sets: &self.quorum_sets,
            singletons: &self.singletons,
            latest_composite: self.nomination.latest_composite().cloned(),
            emitted: Vec::new(),
        };

        let result = self.nomination.nominate(&mut ctx, &value, timed_out);
        let followup = match self.nomination.take_pending_bump() {
            Some(composite) => self.ballot.bump_state(&mut ctx, composite, false),
            None => Ok(false),
        };

        let Context {
            driver, emitted, ..
        } = ctx;
        for outbound in &emitted {
            driver.emit_envelope(outbound);
        }
        match (result, followup) {
            (Ok(updated), Ok(_)) => updated,
            (Err(err), _) | (_, Err(err)) => {
                debug!("[SCP] slot {}: nominate failed: {}", self.index, err);
                false
            }
        }
    }

    pub fn bump_state<D: Driver>(
        &mut self,
        local_node: &LocalNode,
        driver: &mut D,
        value: Value,
        force: bool,
    ) -> bool {
        let mut ctx = Context {
            slot_index: self.index,
            local_node,
            driver,
            quorum_sets: &self.quorum_sets,
            singletons: &self.singletons,
            latest_composite: self.nomination.latest_composite().cloned(),
            emitted: Vec::new(),
        };

        let result = self.ballot.bump_state(&mut ctx, value, force);

        let Context {
            driver, emitted, ..
        } = ctx;
        for outbound in &emitted {
            driver.emit_envelope(outbound);
        }
        match result {
            Ok(updated) => updated,
            Err(err) => {
                debug!("[SCP] slot {}: bump failed: {}", self.index, err);
                false
            }
        }
    }

    /// Re-dispatches, in arrival order, every envelope that was deferred on
    /// the newly resolved quorum set.
    pub fn quorum_set_resolved<D: Driver>(
        &mut self,
        local_node: &LocalNode,
        driver: &mut D,
        hash: &Hash32,
        quorum_set: &QuorumSet,
    ) {
        self.quorum_sets
            .entry(*hash)
            .or_insert_with(|| quorum_set.clone());
        let Some(deferred) = self.pending.remove(hash) else {
            return;
        };
        for envelope in deferred {
            if let Err(err) = self.dispatch(local_node, driver, &envelope) {
                debug!(
                    "[SCP] slot {}: dropping deferred envelope: {}",
                    self.index, err
                );
            }
        }
    }
}
