use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{trace, warn};

use crate::models::audit_event::AuditEvent;

pub mod adapters;
pub mod task;

/// Handle for recording audit events. Cheap to clone; recording only
/// enqueues the event, a separate writer task persists it.
#[derive(Clone)]
pub struct AuditLog {
    tx_audit_events: UnboundedSender<AuditEvent>,
}

impl AuditLog {
    /// Create the handle together with the queue the writer drains.
    pub fn channel() -> (Self, UnboundedReceiver<AuditEvent>) {
        let (tx_audit_events, rx_audit_events) = mpsc::unbounded_channel();
        (Self { tx_audit_events }, rx_audit_events)
    }

    /// Enqueue `event`. Never blocks.
    pub fn record(&self, event: AuditEvent) {
        match self.tx_audit_events.send(event) {
            Ok(_) => trace!("Queued audit event."),
            Err(e) => warn!("Failed to queue audit event. Writer is gone. Event: {}", e.0),
        }
    }
}
