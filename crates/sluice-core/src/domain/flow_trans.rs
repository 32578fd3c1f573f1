//! Trans identity: one `FlowTrans` per external offer of data.

use crate::domain::flow_graph::FlowId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::hash::{Hash, Hasher};
use uuid::Uuid;

/// Unique identifier for one run of a flow, minted per offer
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FlowTransId(pub String);

impl FlowTransId {
    /// Mint a fresh trans id
    pub fn generate() -> Self {
        FlowTransId(Uuid::new_v4().to_string())
    }
}

/// One run of a flow. Every context created for the run carries this
/// identity; two trans values are equal exactly when their ids are equal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowTrans {
    /// The run identity
    pub id: FlowTransId,

    /// The flow definition this run executes
    pub flow_id: FlowId,

    /// When the data was offered
    pub started_at: DateTime<Utc>,
}

impl FlowTrans {
    /// Mint a new trans for a flow
    pub fn new(flow_id: FlowId) -> Self {
        Self {
            id: FlowTransId::generate(),
            flow_id,
            started_at: Utc::now(),
        }
    }
}

impl PartialEq for FlowTrans {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for FlowTrans {}

impl Hash for FlowTrans {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trans_ids_are_unique() {
        let a = FlowTransId::generate();
        let b = FlowTransId::generate();
        assert_ne!(a, b);
    }

    #[test]
    fn test_trans_equality_is_identity_based() {
        let flow_id = FlowId("flow1".to_string());
        let original = FlowTrans::new(flow_id.clone());

        // Same id, different metadata: still the same trans.
        let mut relabeled = original.clone();
        relabeled.flow_id = FlowId("renamed".to_string());
        relabeled.started_at = Utc::now();
        assert_eq!(original, relabeled);

        let other = FlowTrans::new(flow_id);
        assert_ne!(original, other);
    }

    #[test]
    fn test_trans_usable_as_map_key() {
        use std::collections::HashSet;

        let trans = FlowTrans::new(FlowId("flow1".to_string()));
        let mut set = HashSet::new();
        set.insert(trans.clone());
        assert!(set.contains(&trans));
    }
}
