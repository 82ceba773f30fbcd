use std::sync::Arc;

use tokio::sync::mpsc::UnboundedReceiver;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, trace, warn};

use crate::models::audit_event::AuditEvent;

use super::adapters::AuditSink;

/// Task: drains queued audit events into `sink`, decoupling the pollers and
/// the dispatcher from storage latency. On cancellation everything already
/// queued is still persisted before the task exits.
#[tracing::instrument(skip_all)]
pub async fn task_audit_log_writer(
    token: CancellationToken,
    mut rx_audit_events: UnboundedReceiver<AuditEvent>,
    sink: Arc<dyn AuditSink>,
) {
    info!("Started.");
    loop {
        tokio::select! {
            _ = token.cancelled() => {
                warn!("Cancelled.");
                break;
            },
            event = rx_audit_events.recv() => match event {
                Some(event) => persist(sink.as_ref(), event),
                None => {
                    info!("All audit log handles dropped.");
                    return;
                }
            },
        };
    }

    rx_audit_events.close();
    let mut flushed = 0;
    while let Ok(event) = rx_audit_events.try_recv() {
        persist(sink.as_ref(), event);
        flushed += 1;
    }
    trace!("Flushed {} queued audit events.", flushed);
}

fn persist(sink: &dyn AuditSink, event: AuditEvent) {
    if let Err(e) = sink.persist(event) {
        error!("{}", e);
    }
}
