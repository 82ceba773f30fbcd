use std::cmp::Reverse;

use parking_lot::Mutex;
use thiserror::Error;
use tracing::info;

use crate::models::audit_event::AuditEvent;

#[derive(Error, Debug)]
pub enum AuditError {
    #[error("Failed to persist audit event. Error: {0}")]
    Persist(String),
}

/// Storage behind the audit log.
pub trait AuditSink: Send + Sync {
    fn persist(&self, event: AuditEvent) -> Result<(), AuditError>;
}

/// Writes every event to the application log.
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn persist(&self, event: AuditEvent) -> Result<(), AuditError> {
        info!(target: "audit", "{}", event);
        Ok(())
    }
}

/// Keeps events in memory for the lifetime of the process.
#[derive(Default)]
pub struct InMemoryAuditStore {
    events: Mutex<Vec<AuditEvent>>,
}

impl InMemoryAuditStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Events recorded for `username`, newest first.
    pub fn logs_for_user(&self, username: &str) -> Vec<AuditEvent> {
        let mut events: Vec<AuditEvent> = self
            .events
            .lock()
            .iter()
            .filter(|event| event.username == username)
            .cloned()
            .collect();
        events.sort_by_key(|event| Reverse(event.timestamp));
        events
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }
}

impl AuditSink for InMemoryAuditStore {
    fn persist(&self, event: AuditEvent) -> Result<(), AuditError> {
        self.events.lock().push(event);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;

    #[test]
    fn test_logs_for_user_are_newest_first() {
        let store = InMemoryAuditStore::new();
        let older = AuditEvent::command("ayse", "TEMP_ON", "ConfigScreen");
        let mut newer = AuditEvent::command("ayse", "TEMP_OFF", "ConfigScreen");
        newer.timestamp = older.timestamp + Duration::seconds(1);
        let other = AuditEvent::command("mehmet", "SERVO_STOP", "HomeScreen");

        store.persist(older).expect("Failed to persist.");
        store.persist(other).expect("Failed to persist.");
        store.persist(newer).expect("Failed to persist.");

        let commands: Vec<String> = store
            .logs_for_user("ayse")
            .into_iter()
            .map(|event| event.command)
            .collect();
        assert_eq!(commands, vec!["TEMP_OFF", "TEMP_ON"]);
        assert_eq!(store.len(), 3);
        assert!(store.logs_for_user("nobody").is_empty());
    }
}
