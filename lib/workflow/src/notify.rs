//! Status transition events.
//!
//! The runner emits one [`StatusEvent`] per node and workflow status
//! transition. Delivery is fire-and-forget: a notifier can drop events but
//! can never fail the transition that produced them.

use crate::execution::{NodeStatus, WorkflowStatus};
use crate::node::NodeId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strata_core::DispatchId;
use tokio::sync::mpsc;
use tracing::info;

/// A status transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum StatusEvent {
    /// A dispatch changed status.
    WorkflowStatusChanged {
        dispatch_id: DispatchId,
        status: WorkflowStatus,
        at: DateTime<Utc>,
    },
    /// A node changed status.
    NodeStatusChanged {
        dispatch_id: DispatchId,
        node_id: NodeId,
        status: NodeStatus,
        at: DateTime<Utc>,
    },
}

impl StatusEvent {
    /// Creates a workflow transition event stamped now.
    #[must_use]
    pub fn workflow(dispatch_id: &DispatchId, status: WorkflowStatus) -> Self {
        Self::WorkflowStatusChanged {
            dispatch_id: dispatch_id.clone(),
            status,
            at: Utc::now(),
        }
    }

    /// Creates a node transition event stamped now.
    #[must_use]
    pub fn node(dispatch_id: &DispatchId, node_id: NodeId, status: NodeStatus) -> Self {
        Self::NodeStatusChanged {
            dispatch_id: dispatch_id.clone(),
            node_id,
            status,
            at: Utc::now(),
        }
    }

    /// The dispatch the event belongs to.
    #[must_use]
    pub fn dispatch_id(&self) -> &DispatchId {
        match self {
            Self::WorkflowStatusChanged { dispatch_id, .. }
            | Self::NodeStatusChanged { dispatch_id, .. } => dispatch_id,
        }
    }
}

/// Receives status transition events.
///
/// Implementations decide what to do with them (forward, log, ignore).
pub trait Notifier: Send + Sync {
    /// Called for every transition.
    fn notify(&self, event: StatusEvent);
}

/// Discards all events.
#[derive(Debug, Clone, Default)]
pub struct NoopNotifier;

impl Notifier for NoopNotifier {
    fn notify(&self, _event: StatusEvent) {}
}

/// Sends events to an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
    sender: mpsc::UnboundedSender<StatusEvent>,
}

impl ChannelNotifier {
    /// Creates a notifier sending to `sender`.
    #[must_use]
    pub fn new(sender: mpsc::UnboundedSender<StatusEvent>) -> Self {
        Self { sender }
    }

    /// Creates a notifier together with its receiving end.
    #[must_use]
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<StatusEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self::new(sender), receiver)
    }
}

impl Notifier for ChannelNotifier {
    fn notify(&self, event: StatusEvent) {
        // Receiver may have been dropped.
        let _ = self.sender.send(event);
    }
}

/// Logs every event through `tracing`.
#[derive(Debug, Clone, Default)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify(&self, event: StatusEvent) {
        match &event {
            StatusEvent::WorkflowStatusChanged {
                dispatch_id, status, ..
            } => info!(%dispatch_id, %status, "workflow status changed"),
            StatusEvent::NodeStatusChanged {
                dispatch_id,
                node_id,
                status,
                ..
            } => info!(%dispatch_id, %node_id, %status, "node status changed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_notifier_forwards_events() {
        let (notifier, mut receiver) = ChannelNotifier::channel();
        let id = DispatchId::new();
        notifier.notify(StatusEvent::node(&id, NodeId::new(1), NodeStatus::Running));

        let event = receiver.try_recv().expect("event delivered");
        assert_eq!(event.dispatch_id(), &id);
        assert!(matches!(
            event,
            StatusEvent::NodeStatusChanged {
                status: NodeStatus::Running,
                ..
            }
        ));
    }

    #[test]
    fn channel_notifier_ignores_dropped_receiver() {
        let (notifier, receiver) = ChannelNotifier::channel();
        drop(receiver);
        notifier.notify(StatusEvent::workflow(&DispatchId::new(), WorkflowStatus::Completed));
    }

    #[test]
    fn event_serializes_with_tag() {
        let event = StatusEvent::workflow(&DispatchId::new(), WorkflowStatus::PendingPostprocessing);
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "workflow_status_changed");
        assert_eq!(json["status"], "PENDING_POSTPROCESSING");
    }
}
