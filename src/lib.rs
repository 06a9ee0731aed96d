//! Core engine of the Stellar Consensus Protocol (SCP), a federated
//! Byzantine agreement system: each node declares the quorum slices it
//! trusts, nomination converges a quorum on candidate values, and the ballot
//! protocol ratifies one value per slot through PREPARE, CONFIRM and
//! EXTERNALIZE pledges.
//!
//! The engine is in-memory, single-threaded and transport-agnostic: the
//! embedding application implements [`Driver`] and feeds signed envelopes in
//! through [`Scp`].

pub mod crypto;
pub mod error;
pub mod local_node;
pub mod quorum;
pub mod scp;
pub mod statement;

mod ballot;
mod nomination;
mod slot;

pub use crate::ballot::Phase;
pub use crate::crypto::{Hash32, NodeId, SecretKey, Signature};
pub use crate::local_node::LocalNode;
pub use crate::quorum::QuorumSet;
pub use crate::scp::{Driver, Scp};
pub use crate::statement::{
    Ballot, Confirm, Envelope, Externalize, Nomination, Pledge, Prepare, SlotIndex, Statement,
    Value,
};

pub use crate::error::Error;
pub type Result<T> = std::result::Result<T, Error>;
