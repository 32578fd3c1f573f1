//! Per-datum execution state: `FlowContext` tracks one unit of payload
//! through one trans of a flow.

use crate::domain::flow_graph::{EventId, FlowId, NodeId};
use crate::domain::flow_trans::{FlowTrans, FlowTransId};
use crate::error::FlowError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a flow context
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FlowContextId(pub String);

impl FlowContextId {
    /// Mint a fresh context id
    pub fn generate() -> Self {
        FlowContextId(Uuid::new_v4().to_string())
    }
}

/// Lifecycle of a context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContextStatus {
    /// Waiting at its position for the next execution round
    Ready,
    /// Parked on a manual task, waiting for an operator
    Pending,
    /// Reached a terminal node
    Archived,
    /// Terminally failed
    Failed,
}

/// Error details attached to a context that failed at a node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextErrorInfo {
    /// The node where execution failed
    pub node_id: NodeId,

    /// The failure cause
    pub cause: String,

    /// When the failure happened
    pub timestamp: DateTime<Utc>,
}

impl ContextErrorInfo {
    /// Record a failure at a node
    pub fn new(node_id: NodeId, cause: impl Into<String>) -> Self {
        Self {
            node_id,
            cause: cause.into(),
            timestamp: Utc::now(),
        }
    }
}

/// One unit of payload traveling through a flow instance.
///
/// Contexts are created when data is offered or emitted by a node, mutated
/// only by the executor while the instance lock is held, and archived when
/// they reach a terminal node or are explicitly purged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowContext<T> {
    /// Unique id of this context
    pub id: FlowContextId,

    /// The trans this context belongs to
    pub trans_id: FlowTransId,

    /// The flow definition being executed
    pub flow_id: FlowId,

    /// The node the context currently sits at
    pub position: NodeId,

    /// The event that carried the context into its current position
    pub triggered_event: Option<EventId>,

    /// Current lifecycle status
    pub status: ContextStatus,

    /// The business payload
    pub data: T,

    /// Failure details, set when execution failed at some node
    pub error: Option<ContextErrorInfo>,

    /// When the context was created
    pub created_at: DateTime<Utc>,

    /// When the context was last mutated
    pub updated_at: DateTime<Utc>,
}

impl<T> FlowContext<T> {
    /// Create a ready context at a node position
    pub fn new(trans: &FlowTrans, position: NodeId, data: T) -> Self {
        let now = Utc::now();
        Self {
            id: FlowContextId::generate(),
            trans_id: trans.id.clone(),
            flow_id: trans.flow_id.clone(),
            position,
            triggered_event: None,
            status: ContextStatus::Ready,
            data,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Move the context across an event to its target node
    pub fn advance(&mut self, event_id: EventId, target: NodeId) -> Result<(), FlowError> {
        if self.status != ContextStatus::Ready {
            return Err(FlowError::ContextStateError(format!(
                "Cannot advance context {} in status {:?}",
                self.id.0, self.status
            )));
        }
        self.position = target;
        self.triggered_event = Some(event_id);
        self.touch();
        Ok(())
    }

    /// Park the context on a manual task
    pub fn suspend(&mut self) -> Result<(), FlowError> {
        if self.status != ContextStatus::Ready {
            return Err(FlowError::ContextStateError(format!(
                "Cannot suspend context {} in status {:?}",
                self.id.0, self.status
            )));
        }
        self.status = ContextStatus::Pending;
        self.touch();
        Ok(())
    }

    /// Release the context from a manual task back into the drive loop
    pub fn resume(&mut self) -> Result<(), FlowError> {
        if self.status != ContextStatus::Pending {
            return Err(FlowError::ContextStateError(format!(
                "Cannot resume context {} in status {:?}",
                self.id.0, self.status
            )));
        }
        self.status = ContextStatus::Ready;
        self.touch();
        Ok(())
    }

    /// Archive the context at a terminal node
    pub fn archive(&mut self) -> Result<(), FlowError> {
        if self.status != ContextStatus::Ready {
            return Err(FlowError::ContextStateError(format!(
                "Cannot archive context {} in status {:?}",
                self.id.0, self.status
            )));
        }
        self.status = ContextStatus::Archived;
        self.touch();
        Ok(())
    }

    /// Terminally fail the context with error details
    pub fn fail(&mut self, error: ContextErrorInfo) -> Result<(), FlowError> {
        if self.is_terminal() {
            return Err(FlowError::ContextStateError(format!(
                "Cannot fail context {} in status {:?}",
                self.id.0, self.status
            )));
        }
        self.status = ContextStatus::Failed;
        self.error = Some(error);
        self.touch();
        Ok(())
    }

    /// Whether the context has finished its run
    pub fn is_terminal(&self) -> bool {
        matches!(self.status, ContextStatus::Archived | ContextStatus::Failed)
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

impl<T: Clone> FlowContext<T> {
    /// Clone the context onto another outgoing event, minting a fresh id.
    /// Parallel nodes use this to hand the same payload to every branch.
    pub fn fan_out(&self, event_id: EventId, target: NodeId) -> Self {
        let now = Utc::now();
        Self {
            id: FlowContextId::generate(),
            trans_id: self.trans_id.clone(),
            flow_id: self.flow_id.clone(),
            position: target,
            triggered_event: Some(event_id),
            status: ContextStatus::Ready,
            data: self.data.clone(),
            error: None,
            created_at: now,
            updated_at: now,
        }
    }
}

impl<T> FlowContext<T> {
    /// Mint a new context at the same position carrying different data.
    /// Jober invocations that return more records than they consumed use
    /// this for the surplus records.
    pub fn sibling(&self, data: T) -> Self {
        let now = Utc::now();
        Self {
            id: FlowContextId::generate(),
            trans_id: self.trans_id.clone(),
            flow_id: self.flow_id.clone(),
            position: self.position.clone(),
            triggered_event: self.triggered_event.clone(),
            status: ContextStatus::Ready,
            data,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }
}
