use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::crypto::{Hash32, NodeId};
use crate::statement::Statement;
use crate::{Error, Result};

/// A node's declared trust structure: at least `threshold` of
/// `validators ∪ inner_sets` must be satisfied for a slice.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub struct QuorumSet {
    pub threshold: u32,
    pub validators: Vec<NodeId>,
    pub inner_sets: Vec<QuorumSet>,
}

impl QuorumSet {
    pub fn new(threshold: u32, validators: Vec<NodeId>, inner_sets: Vec<QuorumSet>) -> Self {
        Self {
            threshold,
            validators,
            inner_sets,
        }
    }

    /// The quorum set `{{node_id}}`: a node asserting only its own word.
    pub fn singleton(node_id: NodeId) -> Self {
        Self {
            threshold: 1,
            validators: vec![node_id],
            inner_sets: Vec::new(),
        }
    }

    pub fn hash(&self) -> Result<Hash32> {
        Ok(Hash32::calculate(&bincode::serialize(self)?))
    }

    fn members(&self) -> usize {
        self.validators.len() + self.inner_sets.len()
    }

    pub fn check_valid(&self) -> Result<()> {
        if self.threshold == 0 || self.threshold as usize > self.members() {
            return Err(Error::InvalidQuorumSet {
                threshold: self.threshold,
                members: self.members(),
            });
        }
        for inner in &self.inner_sets {
            inner.check_valid()?;
        }
        Ok(())
    }

    /// All nodes reachable through the set, transitively.
    pub fn transitive_nodes(&self) -> BTreeSet<NodeId> {
        let mut nodes = BTreeSet::new();
        self.collect_nodes(&mut nodes);
        nodes
    }

    fn collect_nodes(&self, nodes: &mut BTreeSet<NodeId>) {
        nodes.extend(self.validators.iter().copied());
        for inner in &self.inner_sets {
            inner.collect_nodes(nodes);
        }
    }

    /// True iff `nodes` satisfies at least `threshold` members of this set.
    pub fn is_quorum_slice(&self, nodes: &BTreeSet<NodeId>) -> bool {
        let mut threshold_left = self.threshold as i64;
        for validator in &self.validators {
            if nodes.contains(validator) {
                threshold_left -= 1;
                if threshold_left <= 0 {
                    return true;
                }
            }
        }
        for inner in &self.inner_sets {
            if inner.is_quorum_slice(nodes) {
                threshold_left -= 1;
                if threshold_left <= 0 {
                    return true;
                }
            }
        }
        false
    }

    /// True iff `nodes` intersects every slice of this set: removing them
    /// leaves fewer satisfied members than any slice needs.
    pub fn is_v_blocking(&self, nodes: &BTreeSet<NodeId>) -> bool {
        if self.threshold == 0 {
            return false;
        }
        let mut left_till_block = 1 + self.members() as i64 - self.threshold as i64;
        for validator in &self.validators {
            if nodes.contains(validator) {
                left_till_block -= 1;
                if left_till_block <= 0 {
                    return true;
                }
            }
        }
        for inner in &self.inner_sets {
            if inner.is_v_blocking(nodes) {
                left_till_block -= 1;
                if left_till_block <= 0 {
                    return true;
                }
            }
        }
        false
    }

    /// Probability weight of `node` within this set, normalized to
    /// `0..=u64::MAX`. Used by nomination leader election only.
    pub fn node_weight(&self, node: &NodeId) -> u64 {
        let n = u64::from(self.threshold);
        let d = self.members() as u64;
        if d == 0 {
            return 0;
        }
        for validator in &self.validators {
            if validator == node {
                return big_divide(u64::MAX, n, d);
            }
        }
        for inner in &self.inner_sets {
            let leaf_weight = inner.node_weight(node);
            if leaf_weight > 0 {
                return big_divide(leaf_weight, n, d);
            }
        }
        0
    }
}

// a * b / c without overflowing 64 bits
fn big_divide(a: u64, b: u64, c: u64) -> u64 {
    (u128::from(a) * u128::from(b) / u128::from(c)) as u64
}

fn filtered_nodes(
    map: &BTreeMap<NodeId, Statement>,
    filter: impl Fn(&NodeId, &Statement) -> bool,
) -> BTreeSet<NodeId> {
    map.iter()
        .filter(|(node, st)| filter(node, st))
        .map(|(node, _)| *node)
        .collect()
}

/// Tests whether the statements passing `filter` come from a v-blocking set
/// for `quorum_set`.
pub fn is_v_blocking(
    quorum_set: &QuorumSet,
    map: &BTreeMap<NodeId, Statement>,
    filter: impl Fn(&NodeId, &Statement) -> bool,
) -> bool {
    quorum_set.is_v_blocking(&filtered_nodes(map, filter))
}

/// Tests whether the statements passing `filter` form a quorum for
/// `quorum_set`: shrink the candidate set to the fixpoint where every member
/// still sees one of its own slices inside it. `qfun` resolves a statement's
/// claimed quorum set; nodes whose set is unknown drop out.
pub fn is_quorum<'q>(
    quorum_set: &QuorumSet,
    map: &BTreeMap<NodeId, Statement>,
    qfun: impl Fn(&Statement) -> Option<&'q QuorumSet>,
    filter: impl Fn(&NodeId, &Statement) -> bool,
) -> bool {
    let mut nodes = filtered_nodes(map, filter);
    loop {
        let shrunk: BTreeSet<NodeId> = nodes
            .iter()
            .filter(|node| {
                qfun(&map[*node]).map_or(false, |qset| qset.is_quorum_slice(&nodes))
            })
            .copied()
            .collect();
        if shrunk.len() == nodes.len() {
            break;
        }
        nodes = shrunk;
    }
    quorum_set.is_quorum_slice(&nodes)
}
