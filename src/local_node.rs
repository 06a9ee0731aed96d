use crate::crypto::{Hash32, NodeId, SecretKey};
use crate::quorum::QuorumSet;
use crate::statement::{Envelope, Pledge, SlotIndex, Statement};
use crate::Result;

/// This node's identity and declared trust, shared by every slot.
#[derive(Debug)]
pub struct LocalNode {
    node_id: NodeId,
    secret_key: SecretKey,
    quorum_set: QuorumSet,
    quorum_set_hash: Hash32,
    // {{self}}, asserted alongside EXTERNALIZE statements
    singleton: QuorumSet,
    singleton_hash: Hash32,
}

impl LocalNode {
    pub fn new(secret_key: SecretKey, quorum_set: QuorumSet) -> Result<Self> {
        quorum_set.check_valid()?;
        let node_id = secret_key.node_id();
        let quorum_set_hash = quorum_set.hash()?;
        let singleton = QuorumSet::singleton(node_id);
        let singleton_hash = singleton.hash()?;
        Ok(Self {
            node_id,
            secret_key,
            quorum_set,
            quorum_set_hash,
            singleton,
            singleton_hash,
        })
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    pub fn quorum_set(&self) -> &QuorumSet {
        &self.quorum_set
    }

    pub fn quorum_set_hash(&self) -> &Hash32 {
        &self.quorum_set_hash
    }

    pub fn singleton_quorum_set(&self) -> &QuorumSet {
        &self.singleton
    }

    pub fn singleton_quorum_set_hash(&self) -> &Hash32 {
        &self.singleton_hash
    }

    /// Replaces the declared quorum set and its hash atomically.
    pub fn update_quorum_set(&mut self, quorum_set: QuorumSet) -> Result<()> {
        quorum_set.check_valid()?;
        self.quorum_set_hash = quorum_set.hash()?;
        self.quorum_set = quorum_set;
        Ok(())
    }

    pub fn sign_statement(&self, slot_index: SlotIndex, pledge: Pledge) -> Result<Envelope> {
        let statement = Statement {
            node_id: self.node_id,
            slot_index,
            pledge,
        };
        let signature = self.secret_key.sign(&statement.to_bytes()?);
        Ok(Envelope {
            statement,
            signature,
        })
    }
}
