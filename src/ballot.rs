use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use log::{debug, info, trace, warn};

use crate::crypto::NodeId;
use crate::quorum;
use crate::scp::Driver;
use crate::slot::Context;
use crate::statement::{
    Ballot, Confirm, Envelope, Externalize, Pledge, Prepare, Statement, Value,
};
use crate::{Error, Result};

/// Where the slot stands on its way to a decision.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Phase {
    Prepare,
    Confirm,
    Externalize,
}

type Interval = (u32, u32);

/// The three-phase ballot machine: ratifies one value per slot by driving
/// `b`, `p`, `p'`, `c` and the confirmed-prepared ballot through federated
/// votes over the latest statement seen from each peer.
pub(crate) struct BallotProtocol {
    phase: Phase,
    // b: the ballot being prepared, or committed once past PREPARE
    current: Option<Ballot>,
    // p: highest ballot accepted as prepared
    prepared: Option<Ballot>,
    // p': highest prepared ballot disagreeing with p on value
    prepared_prime: Option<Ballot>,
    // the highest ballot confirmed prepared (its counter travels as n_p)
    confirmed_prepared: Option<Ballot>,
    // c: lowest ballot accepted as committed
    commit: Option<Ballot>,
    latest_statements: BTreeMap<NodeId, Statement>,
    last_envelope: Option<Envelope>,
    heard_from_quorum: bool,
}

fn has_prepared_ballot(ballot: &Ballot, statement: &Statement) -> bool {
    match &statement.pledge {
        Pledge::Nominate(_) => false,
        Pledge::Prepare(p) => p
            .prepared
            .as_ref()
            .map_or(false, |prepared| ballot.less_and_compatible(prepared)),
        Pledge::Confirm(c) => {
            let prepared = Ballot::new(c.n_prepared, c.commit.value.clone());
            ballot.less_and_compatible(&prepared)
        }
        Pledge::Externalize(e) => ballot.compatible(&e.commit),
    }
}

/// Does this statement accept committing every ballot in `interval`?
fn commit_predicate(ballot: &Ballot, interval: Interval, statement: &Statement) -> bool {
    match &statement.pledge {
        Pledge::Nominate(_) | Pledge::Prepare(_) => false,
        Pledge::Confirm(c) => {
            ballot.compatible(&c.commit)
                && c.commit.counter <= interval.0
                && interval.1 <= c.n_p
        }
        Pledge::Externalize(e) => {
            ballot.compatible(&e.commit)
                && e.commit.counter <= interval.0
                && interval.1 <= e.n_p
        }
    }
}

/// Does this statement vote to commit some ballot covering `interval`?
fn commit_vote_predicate(ballot: &Ballot, interval: Interval, statement: &Statement) -> bool {
    match &statement.pledge {
        Pledge::Nominate(_) => false,
        Pledge::Prepare(p) => {
            ballot.compatible(&p.ballot)
                && p.n_c != 0
                && p.n_c <= interval.0
                && interval.1 <= p.n_p
        }
        Pledge::Confirm(c) => ballot.compatible(&c.commit) && c.commit.counter <= interval.0,
        Pledge::Externalize(e) => ballot.compatible(&e.commit) && e.commit.counter <= interval.0,
    }
}

/// Grows `candidate` over adjacent boundary segments as long as `pred` holds,
/// pinning the lower bound first.
fn extend_interval(
    candidate: &mut Interval,
    boundaries: &BTreeSet<Interval>,
    mut pred: impl FnMut(Interval) -> bool,
) {
    for seg in boundaries {
        if candidate.1 != 0 && (candidate.1 < seg.0 || candidate.0 > seg.1) {
            // disjoint from what we have; later segments only get further away
            break;
        }
        for bound in [seg.0, seg.1] {
            let probe = if candidate.0 != 0 {
                (candidate.0, bound)
            } else {
                (bound, bound)
            };
            if pred(probe) {
                *candidate = probe;
            } else if candidate.0 != 0 {
                break;
            }
        }
    }
}

impl BallotProtocol {
    pub fn new() -> Self {
        Self {
            phase: Phase::Prepare,
            current: None,
            prepared: None,
            prepared_prime: None,
            confirmed_prepared: None,
            commit: None,
            latest_statements: BTreeMap::new(),
            last_envelope: None,
            heard_from_quorum: true,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn last_envelope(&self) -> Option<&Envelope> {
        self.last_envelope.as_ref()
    }

    pub fn externalized_value(&self) -> Option<&Value> {
        if self.phase == Phase::Externalize {
            self.commit.as_ref().map(|commit| &commit.value)
        } else {
            None
        }
    }

    fn is_newer_statement(&self, node_id: &NodeId, statement: &Statement) -> bool {
        self.latest_statements
            .get(node_id)
            .map_or(true, |old| statement.supersedes(old))
    }

    fn record_statement(&mut self, statement: &Statement) {
        self.latest_statements
            .insert(statement.node_id, statement.clone());
    }

    pub fn process_envelope<D: Driver>(
        &mut self,
        ctx: &mut Context<D>,
        envelope: &Envelope,
    ) -> Result<bool> {
        let statement = &envelope.statement;
        debug_assert_eq!(statement.slot_index, ctx.slot_index);

        let working = match statement.working_ballot() {
            Some(ballot) => ballot,
            None => return Ok(false),
        };

        if !self.is_newer_statement(&statement.node_id, statement) {
            trace!(
                "[BLT] slot {}: stale statement from {:?}",
                ctx.slot_index,
                statement.node_id
            );
            return Ok(false);
        }

        if !ctx
            .driver
            .validate_value(ctx.slot_index, &statement.node_id, &working.value)
        {
            trace!(
                "[BLT] slot {}: host rejected value from {:?}",
                ctx.slot_index,
                statement.node_id
            );
            return Ok(false);
        }

        if self.phase == Phase::Externalize {
            // the decision is frozen; late compatible statements (our own
            // EXTERNALIZE included) are absorbed, everything else is dropped
            let absorbed = self
                .commit
                .as_ref()
                .map_or(false, |commit| commit.value == working.value);
            if absorbed {
                self.record_statement(statement);
            }
            return Ok(absorbed);
        }

        match &statement.pledge {
            Pledge::Prepare(p) => {
                let stale_counter = self
                    .current
                    .as_ref()
                    .map_or(false, |current| current.counter > working.counter);
                if stale_counter {
                    return Ok(false);
                }
                let ballot = p.ballot.clone();
                self.record_statement(statement);
                self.advance(ctx, &ballot)?;
                Ok(true)
            }
            Pledge::Confirm(_) | Pledge::Externalize(_) => {
                // valid for any counter at or above the stated one; drive the
                // machine with our own working counter when we are ahead
                self.record_statement(statement);
                let my_counter = match self.phase {
                    Phase::Prepare => self.current.as_ref().map_or(0, |b| b.counter),
                    _ => self.prepared.as_ref().map_or(0, |b| b.counter),
                };
                let mut tick = working;
                if tick.counter < my_counter {
                    tick.counter = my_counter;
                }
                self.advance(ctx, &tick)?;
                Ok(true)
            }
            Pledge::Nominate(_) => Ok(false),
        }
    }

    /// External entry: move onto `value`, seeding the first ballot or raising
    /// the counter. `force` is set on timer-driven bumps.
    pub fn bump_state<D: Driver>(
        &mut self,
        ctx: &mut Context<D>,
        value: Value,
        force: bool,
    ) -> Result<bool> {
        if self.phase != Phase::Prepare {
            return Ok(false);
        }
        if !force && self.current.is_some() {
            return Ok(false);
        }

        let new_ballot = match &self.confirmed_prepared {
            // once a ballot is confirmed prepared we only raise the counter
            Some(confirmed) => Ballot::new(confirmed.counter + 1, confirmed.value.clone()),
            None => {
                let counter = self.current.as_ref().map_or(1, |b| b.counter + 1);
                Ballot::new(counter, value)
            }
        };
        debug!("[BLT] slot {}: bump to {:?}", ctx.slot_index, new_ballot);

        let updated = self.update_current_value(ctx, &new_ballot)?;
        if updated {
            ctx.driver.ballot_did_prepare(ctx.slot_index, &new_ballot);
            self.emit_current_state(ctx)?;
        }
        Ok(updated)
    }

    fn update_current_value<D: Driver>(
        &mut self,
        ctx: &mut Context<D>,
        ballot: &Ballot,
    ) -> Result<bool> {
        if self.phase != Phase::Prepare {
            return Ok(false);
        }
        if self.current.is_some()
            && self
                .commit
                .as_ref()
                .map_or(false, |commit| !commit.compatible(ballot))
        {
            return Ok(false);
        }

        let ordering = self.current.as_ref().map(|current| current.cmp(ballot));
        let updated = match ordering {
            None | Some(Ordering::Less) => {
                self.bump_to_ballot(ctx, ballot.clone());
                true
            }
            Some(Ordering::Equal) => false,
            Some(Ordering::Greater) => {
                // peers outside the protocol can ask for this; never regress
                warn!(
                    "[BLT] slot {}: refusing to bump backwards to {:?}",
                    ctx.slot_index, ballot
                );
                return Ok(false);
            }
        };

        self.check_invariants();
        Ok(updated)
    }

    fn bump_to_ballot<D: Driver>(&mut self, ctx: &mut Context<D>, ballot: Ballot) {
        debug_assert!(self.phase != Phase::Externalize);
        debug_assert!(self
            .current
            .as_ref()
            .map_or(true, |current| *current <= ballot));

        let got_bumped = self
            .current
            .as_ref()
            .map_or(true, |current| current.counter != ballot.counter);
        let counter = ballot.counter;
        self.current = Some(ballot);
        self.heard_from_quorum = false;

        if got_bumped {
            let seconds = 1u64.checked_shl(counter).unwrap_or(u64::MAX);
            ctx.driver
                .arm_ballot_timer(ctx.slot_index, Duration::from_secs(seconds));
        }
    }

    fn set_prepared(&mut self, ballot: &Ballot) -> bool {
        match self.prepared.clone() {
            Some(prepared) => {
                if prepared < *ballot {
                    if !prepared.compatible(ballot) {
                        self.prepared_prime = Some(prepared);
                    }
                    self.prepared = Some(ballot.clone());
                    true
                } else {
                    false
                }
            }
            None => {
                self.prepared = Some(ballot.clone());
                true
            }
        }
    }

    fn abandon_ballot<D: Driver>(&mut self, ctx: &mut Context<D>) -> Result<bool> {
        match ctx.latest_composite.clone() {
            Some(value) if !value.is_empty() => self.bump_state(ctx, value, true),
            _ => match self.current.clone() {
                Some(current) => self.bump_state(ctx, current.value, true),
                None => Ok(false),
            },
        }
    }

    fn advance<D: Driver>(&mut self, ctx: &mut Context<D>, ballot: &Ballot) -> Result<()> {
        trace!("[BLT] slot {}: advancing on {:?}", ctx.slot_index, ballot);
        self.check_heard_from_quorum(ctx);

        // each attempt that does work emits, which re-enters this machine
        // through our own statement; `run` keeps the outer pass from redoing
        // what the nested pass already did
        let mut run = true;
        if run && self.is_prepared_accept(ctx, ballot) {
            run = !self.attempt_prepared_accept(ctx, ballot)?;
        }
        if run && self.is_prepared_confirmed(ctx, ballot) {
            run = !self.attempt_prepared_confirmed(ctx, ballot)?;
        }
        if run {
            if let Some((low, high)) = self.is_accept_commit(ctx, ballot) {
                run = !self.attempt_accept_commit(ctx, &low, &high)?;
            }
        }
        if run {
            if let Some((low, high)) = self.is_confirm_commit(ctx, ballot) {
                run = !self.attempt_confirm_commit(ctx, &low, &high)?;
            }
        }
        if run {
            self.attempt_prepare(ctx)?;
        }
        Ok(())
    }

    fn check_heard_from_quorum<D: Driver>(&mut self, ctx: &mut Context<D>) {
        if self.heard_from_quorum {
            return;
        }
        let current = match self.current.clone() {
            Some(current) => current,
            None => return,
        };
        let counter = current.counter;
        let heard = quorum::is_quorum(
            ctx.local_node.quorum_set(),
            &self.latest_statements,
            |st| ctx.statement_quorum_set(st),
            |_, st| match &st.pledge {
                Pledge::Prepare(p) => counter <= p.ballot.counter,
                Pledge::Confirm(_) | Pledge::Externalize(_) => true,
                Pledge::Nominate(_) => false,
            },
        );
        if heard {
            self.heard_from_quorum = true;
            ctx.driver
                .ballot_did_hear_from_quorum(ctx.slot_index, &current);
        }
    }

    fn is_prepared_accept<D: Driver>(&self, ctx: &Context<D>, ballot: &Ballot) -> bool {
        if self.phase == Phase::Externalize {
            return false;
        }
        if self.phase == Phase::Confirm {
            // only worth it if the prepared interval can grow
            match &self.prepared {
                Some(prepared) if prepared.less_and_compatible(ballot) => {}
                _ => return false,
            }
        }
        if self.prepared.as_ref() == Some(ballot) {
            return false;
        }

        ctx.federated_accept(
            |_, st| match &st.pledge {
                Pledge::Nominate(_) => false,
                Pledge::Prepare(p) => *ballot == p.ballot,
                Pledge::Confirm(c) => ballot.compatible(&c.commit),
                Pledge::Externalize(e) => ballot.compatible(&e.commit),
            },
            |_, st| has_prepared_ballot(ballot, st),
            &self.latest_statements,
        )
    }

    fn attempt_prepared_accept<D: Driver>(
        &mut self,
        ctx: &mut Context<D>,
        ballot: &Ballot,
    ) -> Result<bool> {
        debug!(
            "[BLT] slot {}: accepting {:?} as prepared",
            ctx.slot_index, ballot
        );

        if self.current.is_none() {
            self.bump_to_ballot(ctx, ballot.clone());
        } else if self.phase == Phase::Prepare {
            let ordering = self.current.as_ref().map(|current| current.cmp(ballot));
            match ordering {
                None | Some(Ordering::Less) => self.bump_to_ballot(ctx, ballot.clone()),
                Some(Ordering::Equal) => {}
                Some(Ordering::Greater) => {
                    warn!(
                        "[BLT] slot {}: cannot prepare {:?} below the current ballot",
                        ctx.slot_index, ballot
                    );
                    return Ok(false);
                }
            }
        }

        let mut did_work = self.set_prepared(ballot);

        // a higher incompatible prepared ballot overrides a commit attempt
        // that never got confirmed
        let overridden = match (&self.commit, &self.confirmed_prepared) {
            (Some(_), Some(confirmed)) => {
                self.prepared
                    .as_ref()
                    .map_or(false, |p| confirmed.less_and_incompatible(p))
                    || self
                        .prepared_prime
                        .as_ref()
                        .map_or(false, |pp| confirmed.less_and_incompatible(pp))
            }
            _ => false,
        };
        if overridden {
            debug_assert!(self.phase == Phase::Prepare);
            self.commit = None;
            did_work = true;
        }

        if did_work {
            ctx.driver.ballot_did_prepared(ctx.slot_index, ballot);
            self.emit_current_state(ctx)?;
        }
        Ok(did_work)
    }

    fn is_prepared_confirmed<D: Driver>(&self, ctx: &Context<D>, ballot: &Ballot) -> bool {
        if self.phase != Phase::Prepare || self.prepared.is_none() {
            return false;
        }
        if self
            .confirmed_prepared
            .as_ref()
            .map_or(false, |confirmed| confirmed >= ballot)
        {
            return false;
        }
        ctx.federated_ratify(
            |_, st| has_prepared_ballot(ballot, st),
            &self.latest_statements,
        )
    }

    fn attempt_prepared_confirmed<D: Driver>(
        &mut self,
        ctx: &mut Context<D>,
        ballot: &Ballot,
    ) -> Result<bool> {
        debug!(
            "[BLT] slot {}: confirming {:?} as prepared",
            ctx.slot_index, ballot
        );

        let mut did_work = false;
        if self.confirmed_prepared.as_ref() != Some(ballot) {
            self.confirmed_prepared = Some(ballot.clone());
            did_work = true;
        }

        if self.commit.is_none() && self.confirmed_prepared >= self.current {
            let ok_vs_prepared = self
                .prepared
                .as_ref()
                .map_or(true, |p| !ballot.less_and_incompatible(p));
            let ok_vs_prime = self
                .prepared_prime
                .as_ref()
                .map_or(false, |pp| !ballot.less_and_incompatible(pp));
            if ok_vs_prepared || ok_vs_prime {
                self.current = Some(ballot.clone());
                self.commit = Some(ballot.clone());
                did_work = true;
            }
        }

        if did_work {
            self.emit_current_state(ctx)?;
        }
        Ok(did_work)
    }

    fn commit_boundaries(&self, ballot: &Ballot) -> BTreeSet<Interval> {
        let mut boundaries = BTreeSet::new();
        for statement in self.latest_statements.values() {
            match &statement.pledge {
                Pledge::Nominate(_) => {}
                Pledge::Prepare(p) => {
                    if ballot.compatible(&p.ballot) && p.n_c != 0 {
                        boundaries.insert((p.n_c, p.n_p));
                    }
                }
                Pledge::Confirm(c) => {
                    if ballot.compatible(&c.commit) {
                        boundaries.insert((c.commit.counter, c.n_p));
                    }
                }
                Pledge::Externalize(e) => {
                    if ballot.compatible(&e.commit) {
                        boundaries.insert((e.commit.counter, u32::MAX));
                    }
                }
            }
        }
        boundaries
    }

    fn is_accept_commit<D: Driver>(
        &self,
        ctx: &Context<D>,
        ballot: &Ballot,
    ) -> Option<(Ballot, Ballot)> {
        if self.phase == Phase::Externalize {
            return None;
        }
        if self.phase == Phase::Confirm
            && !self
                .confirmed_prepared
                .as_ref()
                .map_or(false, |confirmed| ballot.compatible(confirmed))
        {
            return None;
        }

        let mut boundaries = self.commit_boundaries(ballot);
        let mut candidate: Interval = (0, 0);

        if self.phase == Phase::Confirm {
            // only the upper bound can move once we accepted a commit
            let commit = self.commit.as_ref()?;
            let confirmed = self.confirmed_prepared.as_ref()?;
            candidate = (commit.counter, confirmed.counter);
            boundaries.retain(|seg| seg.1 > confirmed.counter);
        }
        if boundaries.is_empty() {
            return None;
        }

        extend_interval(&mut candidate, &boundaries, |interval| {
            ctx.federated_accept(
                |_, st| commit_vote_predicate(ballot, interval, st),
                |_, st| commit_predicate(ballot, interval, st),
                &self.latest_statements,
            )
        });

        if candidate.0 == 0 {
            return None;
        }
        if self.phase == Phase::Confirm {
            let confirmed = self.confirmed_prepared.as_ref()?;
            if candidate.1 <= confirmed.counter {
                return None;
            }
        }
        Some((
            Ballot::new(candidate.0, ballot.value.clone()),
            Ballot::new(candidate.1, ballot.value.clone()),
        ))
    }

    fn attempt_accept_commit<D: Driver>(
        &mut self,
        ctx: &mut Context<D>,
        low: &Ballot,
        high: &Ballot,
    ) -> Result<bool> {
        debug!(
            "[BLT] slot {}: accepting commit {:?}..{:?}",
            ctx.slot_index, low, high
        );

        let extends = self
            .confirmed_prepared
            .as_ref()
            .map_or(true, |confirmed| confirmed.less_and_compatible(high));
        if !extends {
            return Ok(false);
        }

        self.commit = Some(low.clone());
        self.confirmed_prepared = Some(high.clone());
        // in CONFIRM the working ballot is pinned above every counter
        self.current = Some(Ballot::new(u32::MAX, high.value.clone()));
        self.set_prepared(high);
        self.phase = Phase::Confirm;

        ctx.driver.ballot_did_commit(ctx.slot_index, high);
        self.emit_current_state(ctx)?;
        Ok(true)
    }

    fn is_confirm_commit<D: Driver>(
        &self,
        ctx: &Context<D>,
        ballot: &Ballot,
    ) -> Option<(Ballot, Ballot)> {
        if self.phase != Phase::Confirm {
            return None;
        }
        let commit = self.commit.as_ref()?;
        if !ballot.compatible(commit) {
            return None;
        }

        let boundaries = self.commit_boundaries(ballot);
        let mut candidate: Interval = (0, 0);
        extend_interval(&mut candidate, &boundaries, |interval| {
            ctx.federated_ratify(
                |_, st| commit_predicate(ballot, interval, st),
                &self.latest_statements,
            )
        });

        if candidate.0 == 0 {
            return None;
        }
        Some((
            Ballot::new(candidate.0, ballot.value.clone()),
            Ballot::new(candidate.1, ballot.value.clone()),
        ))
    }

    fn attempt_confirm_commit<D: Driver>(
        &mut self,
        ctx: &mut Context<D>,
        low: &Ballot,
        high: &Ballot,
    ) -> Result<bool> {
        self.commit = Some(low.clone());
        self.confirmed_prepared = Some(high.clone());
        self.phase = Phase::Externalize;
        info!("[BLT] slot {}: externalizing {:?}", ctx.slot_index, high);

        ctx.driver.ballot_did_committed(ctx.slot_index, high);
        self.emit_current_state(ctx)?;

        let value = self
            .current
            .as_ref()
            .map(|current| current.value.clone())
            .ok_or(Error::BadLocalState)?;
        ctx.driver.value_externalized(ctx.slot_index, &value);
        Ok(true)
    }

    /// When a v-blocking set is working above us (or committing above our
    /// confirmed-prepared ballot), our counter can never gather a quorum;
    /// abandon it and move up.
    fn attempt_prepare<D: Driver>(&mut self, ctx: &mut Context<D>) -> Result<bool> {
        if self.phase != Phase::Prepare {
            return Ok(false);
        }
        let current_counter = self.current.as_ref().map(|b| b.counter);
        let confirmed_prepared = self.confirmed_prepared.clone();
        let blocked = quorum::is_v_blocking(
            ctx.local_node.quorum_set(),
            &self.latest_statements,
            |_, st| match &st.pledge {
                Pledge::Nominate(_) => false,
                Pledge::Prepare(p) => {
                    current_counter.map_or(true, |counter| counter < p.ballot.counter)
                }
                Pledge::Confirm(c) => confirmed_prepared
                    .as_ref()
                    .map_or(false, |confirmed| c.commit.less_and_compatible(confirmed)),
                Pledge::Externalize(e) => confirmed_prepared
                    .as_ref()
                    .map_or(false, |confirmed| e.commit.less_and_compatible(confirmed)),
            },
        );
        if blocked {
            debug!(
                "[BLT] slot {}: v-blocking set is ahead, abandoning ballot",
                ctx.slot_index
            );
            return self.abandon_ballot(ctx);
        }
        Ok(false)
    }

    fn create_pledge<D: Driver>(&self, ctx: &Context<D>) -> Result<Pledge> {
        match self.phase {
            Phase::Prepare => {
                let ballot = self.current.clone().ok_or(Error::BadLocalState)?;
                Ok(Pledge::Prepare(Prepare {
                    quorum_set_hash: *ctx.local_node.quorum_set_hash(),
                    ballot,
                    prepared: self.prepared.clone(),
                    prepared_prime: self.prepared_prime.clone(),
                    n_c: self.commit.as_ref().map_or(0, |b| b.counter),
                    n_p: self.confirmed_prepared.as_ref().map_or(0, |b| b.counter),
                }))
            }
            Phase::Confirm => {
                let prepared = self.prepared.as_ref().ok_or(Error::BadLocalState)?;
                let commit = self.commit.clone().ok_or(Error::BadLocalState)?;
                let confirmed = self
                    .confirmed_prepared
                    .as_ref()
                    .ok_or(Error::BadLocalState)?;
                Ok(Pledge::Confirm(Confirm {
                    quorum_set_hash: *ctx.local_node.quorum_set_hash(),
                    n_prepared: prepared.counter,
                    commit,
                    n_p: confirmed.counter,
                }))
            }
            Phase::Externalize => {
                let commit = self.commit.clone().ok_or(Error::BadLocalState)?;
                let confirmed = self
                    .confirmed_prepared
                    .as_ref()
                    .ok_or(Error::BadLocalState)?;
                // peers may treat us as self-authoritative from here on
                Ok(Pledge::Externalize(Externalize {
                    commit_quorum_set_hash: *ctx.local_node.singleton_quorum_set_hash(),
                    commit,
                    n_p: confirmed.counter,
                }))
            }
        }
    }

    /// Signs the current state, runs it through our own processing (our
    /// pledge counts toward our quorums and may cascade further transitions),
    /// then hands the newest statement of the cascade to the transport.
    fn emit_current_state<D: Driver>(&mut self, ctx: &mut Context<D>) -> Result<()> {
        self.check_invariants();
        let pledge = self.create_pledge(ctx)?;
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

    fn check_invariants(&self) {
        if let Some(current) = &self.current {
            debug_assert!(current.counter != 0);
        }
        if let (Some(prime), Some(prepared)) = (&self.prepared_prime, &self.prepared) {
            debug_assert!(prime.less_and_incompatible(prepared));
        }
        if let Some(commit) = &self.commit {
            debug_assert!(self.confirmed_prepared.is_some());
            if let (Some(confirmed), Some(current)) = (&self.confirmed_prepared, &self.current) {
                debug_assert!(commit.less_and_compatible(confirmed));
                debug_assert!(confirmed.less_and_compatible(current));
            }
        }
        match self.phase {
            Phase::Prepare => {}
            Phase::Confirm => debug_assert!(self.commit.is_some()),
            Phase::Externalize => {
                debug_assert!(self.commit.is_some());
                debug_assert!(self.confirmed_prepared.is_some());
            }
        }
    }
}
