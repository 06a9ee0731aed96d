use std::collections::BTreeSet;
use core::fmt::Debug;

use serde::{Deserialize, Serialize};

use crate::crypto::{Hash32, NodeId, Signature};
use crate::{Error, Result};

pub type SlotIndex = u64;

/// An opaque consensus value, totally ordered by its bytes.
#[derive(Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct Value(Vec<u8>);

impl Value {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Debug for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "v:")?;
        for b in self.0.iter().take(3) {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

/// A ballot `(counter, value)`, ordered lexicographically.
///
/// Two ballots are compatible when they carry the same value; the ballot
/// protocol only ever commits within a run of compatible ballots.
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct Ballot {
    pub counter: u32,
    pub value: Value,
}

impl Ballot {
    pub fn new(counter: u32, value: Value) -> Self {
        Self { counter, value }
    }

    pub fn compatible(&self, other: &Ballot) -> bool {
        self.value == other.value
    }

    pub fn less_and_compatible(&self, other: &Ballot) -> bool {
        self <= other && self.compatible(other)
    }

    pub fn less_and_incompatible(&self, other: &Ballot) -> bool {
        self <= other && !self.compatible(other)
    }
}

impl Debug for Ballot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({},{:?})", self.counter, self.value)
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Nomination {
    pub quorum_set_hash: Hash32,
    pub votes: BTreeSet<Value>,
    pub accepted: BTreeSet<Value>,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Prepare {
    pub quorum_set_hash: Hash32,
    pub ballot: Ballot,
    pub prepared: Option<Ballot>,
    pub prepared_prime: Option<Ballot>,
    pub n_c: u32,
    pub n_p: u32,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Confirm {
    pub quorum_set_hash: Hash32,
    pub n_prepared: u32,
    pub commit: Ballot,
    pub n_p: u32,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Externalize {
    pub commit_quorum_set_hash: Hash32,
    pub commit: Ballot,
    pub n_p: u32,
}

#[derive(Clone, Eq, PartialEq, Serialize, Deserialize)]
pub enum Pledge {
    Nominate(Nomination),
    Prepare(Prepare),
    Confirm(Confirm),
    Externalize(Externalize),
}

impl Debug for Pledge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Pledge::Nominate(nom) => write!(f, "N{:?}-{:?}", nom.votes, nom.accepted),
            Pledge::Prepare(p) => write!(
                f,
                "P{:?}-p{:?}-p'{:?}-c{}-h{}",
                p.ballot, p.prepared, p.prepared_prime, p.n_c, p.n_p
            ),
            Pledge::Confirm(c) => write!(f, "C{}-{:?}-h{}", c.n_prepared, c.commit, c.n_p),
            Pledge::Externalize(e) => write!(f, "X{:?}-h{}", e.commit, e.n_p),
        }
    }
}

impl Pledge {
    /// Rank of a ballot pledge in the PREPARE < CONFIRM < EXTERNALIZE order.
    /// NOMINATE statements live in their own protocol and are never ranked
    /// against ballot statements.
    fn ballot_rank(&self) -> Option<u8> {
        match self {
            Pledge::Nominate(_) => None,
            Pledge::Prepare(_) => Some(0),
            Pledge::Confirm(_) => Some(1),
            Pledge::Externalize(_) => Some(2),
        }
    }
}

#[derive(Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct Statement {
    pub node_id: NodeId,
    pub slot_index: SlotIndex,
    pub pledge: Pledge,
}

impl Debug for Statement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}@{:?}", self.pledge, self.node_id)
    }
}

impl Statement {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(&self)?)
    }

    /// The quorum set hash this statement asks its audience to resolve.
    pub fn quorum_set_hash(&self) -> &Hash32 {
        match &self.pledge {
            Pledge::Nominate(nom) => &nom.quorum_set_hash,
            Pledge::Prepare(p) => &p.quorum_set_hash,
            Pledge::Confirm(c) => &c.quorum_set_hash,
            Pledge::Externalize(e) => &e.commit_quorum_set_hash,
        }
    }

    /// The ballot a peer is working on, as implied by its statement.
    ///
    /// A CONFIRM pledge works on `(n_prepared, commit.value)`; an EXTERNALIZE
    /// pledge stands for its commit ballot at every higher counter.
    pub fn working_ballot(&self) -> Option<Ballot> {
        match &self.pledge {
            Pledge::Nominate(_) => None,
            Pledge::Prepare(p) => Some(p.ballot.clone()),
            Pledge::Confirm(c) => Some(Ballot::new(c.n_prepared, c.commit.value.clone())),
            Pledge::Externalize(e) => Some(e.commit.clone()),
        }
    }

    /// Total "newer than" order between two statements from the same node.
    ///
    /// NOMINATE statements supersede by growing their vote/accept sets;
    /// ballot statements order by pledge kind, then by the pledge's own
    /// lexicographic key. EXTERNALIZE is terminal and never superseded.
    pub fn supersedes(&self, old: &Statement) -> bool {
        match (&old.pledge, &self.pledge) {
            (Pledge::Nominate(o), Pledge::Nominate(n)) => {
                let votes_grew = o.votes.is_subset(&n.votes) && o.votes.len() < n.votes.len();
                let accepted_grew =
                    o.accepted.is_subset(&n.accepted) && o.accepted.len() < n.accepted.len();
                o.votes.is_subset(&n.votes)
                    && o.accepted.is_subset(&n.accepted)
                    && (votes_grew || accepted_grew)
            }
            (Pledge::Prepare(o), Pledge::Prepare(n)) => {
                (&n.ballot, &n.prepared, &n.prepared_prime, n.n_p)
                    > (&o.ballot, &o.prepared, &o.prepared_prime, o.n_p)
            }
            (Pledge::Confirm(o), Pledge::Confirm(n)) => {
                (n.n_prepared, n.n_p) > (o.n_prepared, o.n_p)
            }
            (Pledge::Externalize(_), Pledge::Externalize(_)) => false,
            (o, n) => match (o.ballot_rank(), n.ballot_rank()) {
                (Some(or), Some(nr)) => nr > or,
                _ => false,
            },
        }
    }

    /// Structural pledge invariants; violating statements are dropped.
    pub fn check_sane(&self) -> Result<()> {
        match &self.pledge {
            Pledge::Nominate(nom) => {
                if nom.votes.is_empty() && nom.accepted.is_empty() {
                    return Err(Error::MalformedStatement("empty nomination"));
                }
            }
            Pledge::Prepare(p) => {
                if p.ballot.counter == 0 {
                    return Err(Error::MalformedStatement("prepare with null ballot"));
                }
                if let Some(prepared) = &p.prepared {
                    if !prepared.less_and_compatible(&p.ballot) {
                        return Err(Error::MalformedStatement(
                            "prepared ballot does not precede the working ballot",
                        ));
                    }
                }
                if let (Some(prime), Some(prepared)) = (&p.prepared_prime, &p.prepared) {
                    if !prime.less_and_incompatible(prepared) {
                        return Err(Error::MalformedStatement(
                            "prepared-prime must precede prepared with a different value",
                        ));
                    }
                }
                if p.n_p != 0 && p.prepared.as_ref().map_or(true, |b| p.n_p > b.counter) {
                    return Err(Error::MalformedStatement(
                        "confirmed-prepared counter exceeds prepared",
                    ));
                }
                if p.n_c != 0 && (p.n_p == 0 || p.n_p < p.n_c) {
                    return Err(Error::MalformedStatement(
                        "commit counter exceeds confirmed-prepared",
                    ));
                }
            }
            Pledge::Confirm(c) => {
                if c.commit.counter == 0 {
                    return Err(Error::MalformedStatement("confirm with null commit"));
                }
                if c.commit.counter > c.n_p || c.commit.counter > c.n_prepared {
                    return Err(Error::MalformedStatement(
                        "confirm commit above its prepared counters",
                    ));
                }
            }
            Pledge::Externalize(e) => {
                if e.commit.counter == 0 {
                    return Err(Error::MalformedStatement("externalize with null commit"));
                }
                if e.n_p < e.commit.counter {
                    return Err(Error::MalformedStatement(
                        "externalize commit above its confirmed counter",
                    ));
                }
            }
        }
        Ok(())
    }
}

/// A signed statement as it travels between nodes.
///
/// The signature covers the canonical (bincode) encoding of the statement
/// only, so two implementations agreeing on state produce identical bytes.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub statement: Statement,
    pub signature: Signature,
}

impl Envelope {
    pub fn verify(&self) -> Result<()> {
        let bytes = self.statement.to_bytes()?;
        self.statement.node_id.verify(&bytes, &self.signature)
    }
}
