use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use log::{debug, info, trace};

use crate::crypto::NodeId;
use crate::quorum::QuorumSet;
use crate::scp::Driver;
use crate::slot::Context;
use crate::statement::{Envelope, Nomination, Pledge, Statement, Value};
use crate::{Error, Result};

/// Per-slot nomination: converge a quorum on a set of candidate values, then
/// have the host combine them into the composite the ballot protocol runs on.
pub(crate) struct NominationProtocol {
    round_number: u32,
    votes: BTreeSet<Value>,
    accepted: BTreeSet<Value>,
    candidates: BTreeSet<Value>,
    latest_nominations: BTreeMap<NodeId, Statement>,
    last_envelope: Option<Envelope>,
    round_leader: Option<NodeId>,
    started: bool,
    latest_composite: Option<Value>,
    // composite waiting to seed the ballot protocol once this handler returns
    pending_bump: Option<Value>,
}

fn nomination_votes(statement: &Statement, value: &Value) -> bool {
    matches!(&statement.pledge, Pledge::Nominate(nom) if nom.votes.contains(value))
}

fn nomination_accepts(statement: &Statement, value: &Value) -> bool {
    matches!(&statement.pledge, Pledge::Nominate(nom) if nom.accepted.contains(value))
}

impl NominationProtocol {
    pub fn new() -> Self {
        Self {
            round_number: 0,
            votes: BTreeSet::new(),
            accepted: BTreeSet::new(),
            candidates: BTreeSet::new(),
            latest_nominations: BTreeMap::new(),
            last_envelope: None,
            round_leader: None,
            started: false,
            latest_composite: None,
            pending_bump: None,
        }
    }

    pub fn latest_composite(&self) -> Option<&Value> {
        self.latest_composite.as_ref()
    }

    pub fn take_pending_bump(&mut self) -> Option<Value> {
        self.pending_bump.take()
    }

    /// Starts (or, on a round timeout, re-drives) nomination with a value the
    /// host wants decided. Votes follow the round leader: our own value when
    /// we lead, otherwise whatever the leader has nominated so far.
    pub fn nominate<D: Driver>(
        &mut self,
        ctx: &mut Context<D>,
        value: &Value,
        timed_out: bool,
    ) -> Result<bool> {
        if timed_out && !self.started {
            debug!(
                "[NOM] slot {}: timeout before nomination started",
                ctx.slot_index
            );
            return Ok(false);
        }
        self.started = true;
        if timed_out {
            self.round_number += 1;
        }
        self.update_round_leader(ctx);

        let adopted: Vec<Value> = if self.round_leader.as_ref() == Some(ctx.local_node.node_id())
        {
            vec![value.clone()]
        } else {
            self.round_leader
                .as_ref()
                .and_then(|leader| self.latest_nominations.get(leader))
                .map(|statement| self.leader_values(ctx, statement))
                .unwrap_or_default()
        };

        let mut updated = false;
        for vote in adopted {
            if self.votes.insert(vote) {
                updated = true;
            }
        }

        ctx.driver.arm_nomination_timer(
            ctx.slot_index,
            Duration::from_secs(u64::from(self.round_number) + 1),
        );

        if updated {
            self.emit_nomination(ctx)?;
            Ok(true)
        } else {
            debug!(
                "[NOM] slot {} round {}: nothing new to vote for",
                ctx.slot_index, self.round_number
            );
            Ok(false)
        }
    }

    pub fn process_envelope<D: Driver>(
        &mut self,
        ctx: &mut Context<D>,
        envelope: &Envelope,
    ) -> Result<bool> {
        let statement = &envelope.statement;
        let Pledge::Nominate(nom) = &statement.pledge else {
            return Ok(false);
        };

        if let Some(old) = self.latest_nominations.get(&statement.node_id) {
            if !statement.supersedes(old) {
                trace!(
                    "[NOM] slot {}: stale nomination from {:?}",
                    ctx.slot_index,
                    statement.node_id
                );
                return Ok(false);
            }
        }
        self.latest_nominations
            .insert(statement.node_id, statement.clone());

        if !self.started {
            return Ok(true);
        }

        let mut modified = false;
        let mut new_candidates = false;

        // promote the sender's votes we can federated-accept
        for value in &nom.votes {
            if self.accepted.contains(value) {
                continue;
            }
            let accepted_nominated =
                ctx.federated_accept(
                    |_, st| nomination_votes(st, value),
                    |_, st| nomination_accepts(st, value),
                    &self.latest_nominations,
                );
            if accepted_nominated {
                if ctx
                    .driver
                    .validate_value(ctx.slot_index, &statement.node_id, value)
                {
                    self.votes.insert(value.clone());
                    self.accepted.insert(value.clone());
                    modified = true;
                } else {
                    debug!(
                        "[NOM] slot {}: host rejected value {:?}",
                        ctx.slot_index, value
                    );
                }
            }
        }

        // promote accepted values a quorum stands behind
        for value in &nom.accepted {
            if self.candidates.contains(value) {
                continue;
            }
            if ctx.federated_ratify(
                |_, st| nomination_accepts(st, value),
                &self.latest_nominations,
            ) {
                self.candidates.insert(value.clone());
                new_candidates = true;
            }
        }

        // while no candidate is confirmed, adopt what the round leader votes for
        if self.candidates.is_empty() && self.round_leader.as_ref() == Some(&statement.node_id) {
            for value in self.leader_values(ctx, statement) {
                if self.votes.insert(value) {
                    modified = true;
                }
            }
        }

        if modified {
            self.emit_nomination(ctx)?;
        }

        if new_candidates {
            let composite = ctx
                .driver
                .combine_candidates(ctx.slot_index, &self.candidates);
            info!(
                "[NOM] slot {}: new candidates, composite is {:?}",
                ctx.slot_index, composite
            );
            self.latest_composite = Some(composite.clone());
            self.pending_bump = Some(composite);
        }

        Ok(true)
    }

    /// Picks the single top-priority node of this round's neighborhood.
    /// Ties break on the node id.
    fn update_round_leader<D: Driver>(&mut self, ctx: &Context<D>) {
        let quorum_set = ctx.local_node.quorum_set();
        let mut top: Option<(u64, NodeId)> = None;
        for node in quorum_set.transitive_nodes() {
            let priority = self.node_priority(ctx, quorum_set, &node);
            if priority == 0 {
                continue;
            }
            if top.map_or(true, |best| (priority, node) > best) {
                top = Some((priority, node));
            }
        }
        self.round_leader = top.map(|(_, node)| node);
        debug!(
            "[NOM] slot {} round {}: leader is {:?}",
            ctx.slot_index, self.round_number, self.round_leader
        );
    }

    fn node_priority<D: Driver>(
        &self,
        ctx: &Context<D>,
        quorum_set: &QuorumSet,
        node: &NodeId,
    ) -> u64 {
        let weight = quorum_set.node_weight(node);
        let in_neighborhood =
            ctx.driver
                .compute_hash(ctx.slot_index, false, self.round_number, node)
                < weight;
        if in_neighborhood {
            ctx.driver
                .compute_hash(ctx.slot_index, true, self.round_number, node)
        } else {
            0
        }
    }

    /// Validated values from a leader's nomination that we have not voted
    /// for yet.
    fn leader_values<D: Driver>(&self, ctx: &Context<D>, statement: &Statement) -> Vec<Value> {
        let Pledge::Nominate(nom) = &statement.pledge else {
            return Vec::new();
        };
        nom.votes
            .iter()
            .chain(nom.accepted.iter())
            .filter(|value| !self.votes.contains(*value))
            .filter(|value| {
                ctx.driver
                    .validate_value(ctx.slot_index, &statement.node_id, value)
            })
            .cloned()
            .collect()
    }

    /// Signs the current `(votes, accepted)` state, runs it through our own
    /// processing (our pledge counts toward our quorums and may cascade), and
    /// hands the newest resulting statement to the transport.
    fn emit_nomination<D: Driver>(&mut self, ctx: &mut Context<D>) -> Result<()> {
        let pledge = Pledge::Nominate(Nomination {
            quorum_set_hash: *ctx.local_node.quorum_set_hash(),
            votes: self.votes.clone(),
            accepted: self.accepted.clone(),
        });
        let envelope = ctx.local_node.sign_statement(ctx.slot_index, pledge)?;

        if self.process_envelope(ctx, &envelope)? {
            let newer = self
                .last_envelope
                .as_ref()
                .map_or(true, |last| envelope.statement.supersedes(&last.statement));
            if newer {
                self.last_envelope = Some(envelope.clone());
                ctx.emit(envelope);
            }
            Ok(())
        } else {
            Err(Error::BadLocalState)
        }
    }
}
