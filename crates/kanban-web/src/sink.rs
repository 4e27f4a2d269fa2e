use async_trait::async_trait;
use chrono::Utc;
use kanban_agents::EventSink;
use kanban_core::{AgentEvent, AttemptEvent, AttemptId, AttemptLog};
use kanban_store::SqliteStore;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::warn;

/// Persists each event for one attempt, then broadcasts it.
///
/// Persistence failures are logged and do not stop the broadcast.
pub struct StoreSink {
    store: Arc<SqliteStore>,
    attempt_id: AttemptId,
    events_tx: broadcast::Sender<AttemptEvent>,
}

impl StoreSink {
    pub fn new(
        store: Arc<SqliteStore>,
        attempt_id: AttemptId,
        events_tx: broadcast::Sender<AttemptEvent>,
    ) -> Self {
        Self {
            store,
            attempt_id,
            events_tx,
        }
    }

    fn persist(&self, event: &AgentEvent) -> Result<(), kanban_store::StoreError> {
        let now = Utc::now();
        self.store.append_event(&self.attempt_id, event, now)?;
        match event {
            AgentEvent::Log { level, message } => self.store.append_log(&AttemptLog {
                attempt_id: self.attempt_id.clone(),
                level: *level,
                message: message.clone(),
                created_at: now,
            }),
            AgentEvent::Session { id } => self
                .store
                .set_attempt_session(&self.attempt_id, id, now)
                .map(|_| ()),
            AgentEvent::Conversation { .. } => Ok(()),
        }
    }
}

#[async_trait]
impl EventSink for StoreSink {
    async fn emit(&self, event: AgentEvent) {
        if let Err(err) = self.persist(&event) {
            warn!(
                attempt_id = %self.attempt_id,
                kind = event.kind(),
                error = %err,
                "failed to persist agent event"
            );
        }
        // No subscribers is fine.
        let _ = self.events_tx.send(AttemptEvent {
            attempt_id: self.attempt_id.clone(),
            event,
        });
    }
}
