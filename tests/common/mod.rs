#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet};

use scp_core::{
    Ballot, Confirm, Driver, Envelope, Externalize, Hash32, NodeId, Nomination, Pledge, Prepare,
    QuorumSet, Scp, SecretKey, SlotIndex, Statement, Value,
};

/// In-memory host: records everything the engine hands back and lets tests
/// pin the nomination priority and the composite value.
pub struct TestDriver {
    pub envelopes: Vec<Envelope>,
    pub externalized: BTreeMap<SlotIndex, Value>,
    pub heard_from_quorum: BTreeMap<SlotIndex, Vec<Ballot>>,
    pub quorum_sets: BTreeMap<Hash32, QuorumSet>,
    pub expected_candidates: BTreeSet<Value>,
    pub composite: Option<Value>,
    pub priority_peer: Option<NodeId>,
}

impl TestDriver {
    pub fn new() -> Self {
        Self {
            envelopes: Vec::new(),
            externalized: BTreeMap::new(),
            heard_from_quorum: BTreeMap::new(),
            quorum_sets: BTreeMap::new(),
            expected_candidates: BTreeSet::new(),
            composite: None,
            priority_peer: None,
        }
    }

    pub fn store_quorum_set(&mut self, quorum_set: &QuorumSet) {
        self.quorum_sets
            .insert(quorum_set.hash().unwrap(), quorum_set.clone());
    }
}

impl Driver for TestDriver {
    fn validate_value(&self, _slot_index: SlotIndex, _node_id: &NodeId, _value: &Value) -> bool {
        true
    }

    fn combine_candidates(
        &mut self,
        _slot_index: SlotIndex,
        candidates: &BTreeSet<Value>,
    ) -> Value {
        assert_eq!(candidates, &self.expected_candidates);
        self.composite.clone().expect("composite value not primed")
    }

    fn value_externalized(&mut self, slot_index: SlotIndex, value: &Value) {
        let previous = self.externalized.insert(slot_index, value.clone());
        assert!(previous.is_none(), "value already externalized");
    }

    fn emit_envelope(&mut self, envelope: &Envelope) {
        self.envelopes.push(envelope.clone());
    }

    fn quorum_set(&self, hash: &Hash32) -> Option<QuorumSet> {
        self.quorum_sets.get(hash).cloned()
    }

    // pinned priorities instead of the keyed hash, so leader election is
    // scripted by the test
    fn compute_hash(
        &self,
        _slot_index: SlotIndex,
        is_priority: bool,
        _round_number: u32,
        node_id: &NodeId,
    ) -> u64 {
        if is_priority {
            if Some(*node_id) == self.priority_peer {
                1000
            } else {
                1
            }
        } else {
            0
        }
    }

    fn ballot_did_hear_from_quorum(&mut self, slot_index: SlotIndex, ballot: &Ballot) {
        self.heard_from_quorum
            .entry(slot_index)
            .or_default()
            .push(ballot.clone());
    }
}

pub struct Core5 {
    pub keys: Vec<SecretKey>,
    pub quorum_set: QuorumSet,
    pub quorum_set_hash: Hash32,
}

/// Five validators, threshold 4, local node = keys[0]. The same topology the
/// protocol's edge cases are usually discussed in: v-blocking needs 2 nodes,
/// a quorum needs 3 peers plus ourselves.
pub fn core5() -> Core5 {
    let keys: Vec<SecretKey> = (0..5u8).map(|i| SecretKey::from_bytes([i + 1; 32])).collect();
    let quorum_set = QuorumSet::new(4, keys.iter().map(SecretKey::node_id).collect(), vec![]);
    let quorum_set_hash = quorum_set.hash().unwrap();
    Core5 {
        keys,
        quorum_set,
        quorum_set_hash,
    }
}

pub fn new_scp(setup: &Core5) -> Scp<TestDriver> {
    let mut driver = TestDriver::new();
    driver.store_quorum_set(&setup.quorum_set);
    // default: the local node wins nomination priority
    driver.priority_peer = Some(setup.keys[0].node_id());
    Scp::new(setup.keys[0].clone(), setup.quorum_set.clone(), driver).unwrap()
}

/// Three distinct values with x < y < z.
pub fn xyz() -> (Value, Value, Value) {
    let mut values = vec![
        Value::new(Hash32::calculate(b"SEED_VALUE_HASH_x").to_bytes()),
        Value::new(Hash32::calculate(b"SEED_VALUE_HASH_y").to_bytes()),
        Value::new(Hash32::calculate(b"SEED_VALUE_HASH_z").to_bytes()),
    ];
    values.sort();
    let z = values.pop().unwrap();
    let y = values.pop().unwrap();
    let x = values.pop().unwrap();
    (x, y, z)
}

pub fn singleton_hash(secret: &SecretKey) -> Hash32 {
    QuorumSet::singleton(secret.node_id()).hash().unwrap()
}

pub fn make_envelope(secret: &SecretKey, slot_index: SlotIndex, pledge: Pledge) -> Envelope {
    let statement = Statement {
        node_id: secret.node_id(),
        slot_index,
        pledge,
    };
    let signature = secret.sign(&statement.to_bytes().unwrap());
    Envelope {
        statement,
        signature,
    }
}

pub fn make_prepare(
    secret: &SecretKey,
    quorum_set_hash: &Hash32,
    slot_index: SlotIndex,
    ballot: &Ballot,
    prepared: Option<&Ballot>,
    n_c: u32,
    n_p: u32,
    prepared_prime: Option<&Ballot>,
) -> Envelope {
    make_envelope(
        secret,
        slot_index,
        Pledge::Prepare(Prepare {
            quorum_set_hash: *quorum_set_hash,
            ballot: ballot.clone(),
            prepared: prepared.cloned(),
            prepared_prime: prepared_prime.cloned(),
            n_c,
            n_p,
        }),
    )
}

pub fn make_confirm(
    secret: &SecretKey,
    quorum_set_hash: &Hash32,
    slot_index: SlotIndex,
    n_prepared: u32,
    commit: &Ballot,
    n_p: u32,
) -> Envelope {
    make_envelope(
        secret,
        slot_index,
        Pledge::Confirm(Confirm {
            quorum_set_hash: *quorum_set_hash,
            n_prepared,
            commit: commit.clone(),
            n_p,
        }),
    )
}

pub fn make_externalize(
    secret: &SecretKey,
    quorum_set_hash: &Hash32,
    slot_index: SlotIndex,
    commit: &Ballot,
    n_p: u32,
) -> Envelope {
    make_envelope(
        secret,
        slot_index,
        Pledge::Externalize(Externalize {
            commit_quorum_set_hash: *quorum_set_hash,
            commit: commit.clone(),
            n_p,
        }),
    )
}

pub fn make_nominate(
    secret: &SecretKey,
    quorum_set_hash: &Hash32,
    slot_index: SlotIndex,
    votes: &[Value],
    accepted: &[Value],
) -> Envelope {
    make_envelope(
        secret,
        slot_index,
        Pledge::Nominate(Nomination {
            quorum_set_hash: *quorum_set_hash,
            votes: votes.iter().cloned().collect(),
            accepted: accepted.iter().cloned().collect(),
        }),
    )
}

pub fn verify_prepare(
    actual: &Envelope,
    secret: &SecretKey,
    quorum_set_hash: &Hash32,
    slot_index: SlotIndex,
    ballot: &Ballot,
    prepared: Option<&Ballot>,
    n_c: u32,
    n_p: u32,
    prepared_prime: Option<&Ballot>,
) {
    let expected = make_prepare(
        secret,
        quorum_set_hash,
        slot_index,
        ballot,
        prepared,
        n_c,
        n_p,
        prepared_prime,
    );
    assert_eq!(actual.statement, expected.statement);
}

pub fn verify_confirm(
    actual: &Envelope,
    secret: &SecretKey,
    quorum_set_hash: &Hash32,
    slot_index: SlotIndex,
    n_prepared: u32,
    commit: &Ballot,
    n_p: u32,
) {
    let expected = make_confirm(secret, quorum_set_hash, slot_index, n_prepared, commit, n_p);
    assert_eq!(actual.statement, expected.statement);
}

pub fn verify_externalize(
    actual: &Envelope,
    secret: &SecretKey,
    quorum_set_hash: &Hash32,
    slot_index: SlotIndex,
    commit: &Ballot,
    n_p: u32,
) {
    let expected = make_externalize(secret, quorum_set_hash, slot_index, commit, n_p);
    assert_eq!(actual.statement, expected.statement);
}

pub fn verify_nominate(
    actual: &Envelope,
    secret: &SecretKey,
    quorum_set_hash: &Hash32,
    slot_index: SlotIndex,
    votes: &[Value],
    accepted: &[Value],
) {
    let expected = make_nominate(secret, quorum_set_hash, slot_index, votes, accepted);
    assert_eq!(actual.statement, expected.statement);
}
