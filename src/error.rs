use thiserror::Error;

use crate::crypto::{Hash32, NodeId};
use crate::statement::SlotIndex;

#[derive(Error, Debug)]
pub enum Error {
    #[error("envelope signature does not verify for {node_id:?}")]
    InvalidSignature { node_id: NodeId },
    #[error("statement is for slot {statement_slot}, delivered to slot {slot}")]
    WrongSlot {
        statement_slot: SlotIndex,
        slot: SlotIndex,
    },
    #[error("malformed statement: {0}")]
    MalformedStatement(&'static str),
    #[error("quorum set does not hash to {0:?}")]
    QuorumSetHashMismatch(Hash32),
    #[error("invalid quorum set: threshold {threshold} out of range for {members} members")]
    InvalidQuorumSet { threshold: u32, members: usize },
    #[error("failed to encode with bincode")]
    Encoding(#[from] bincode::Error),
    #[error("engine produced a statement it cannot process")]
    BadLocalState,
}
