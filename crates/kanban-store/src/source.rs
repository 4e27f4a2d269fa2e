use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kanban_core::{AttemptId, AttemptLog};
use kanban_inbox::{AttemptLogSource, AttemptRowForInbox, InboxError, InboxSource};

use crate::store::SqliteStore;

#[async_trait]
impl InboxSource for SqliteStore {
    async fn list_inbox_rows(
        &self,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<AttemptRowForInbox>, InboxError> {
        SqliteStore::list_inbox_rows(self, since, limit)
            .map_err(|err| InboxError::Rows { source: err.into() })
    }
}

#[async_trait]
impl AttemptLogSource for SqliteStore {
    async fn list_attempt_logs(
        &self,
        attempt_id: &AttemptId,
    ) -> Result<Vec<AttemptLog>, InboxError> {
        SqliteStore::list_attempt_logs(self, attempt_id).map_err(|err| InboxError::Logs {
            attempt_id: attempt_id.0.clone(),
            source: err.into(),
        })
    }
}

#[cfg(test)]
mod tests {
    use crate::{AttemptRecord, BoardRecord, CardRecord, SqliteStore};
    use chrono::{Duration, Utc};
    use kanban_core::{AttemptId, AttemptLog, AttemptStatus, BoardId, CardId, InboxConfig, LogLevel};
    use kanban_inbox::build_inbox;

    #[tokio::test]
    async fn store_feeds_inbox_build() {
        let store = SqliteStore::open_in_memory().expect("store");
        store.migrate().expect("migrate");
        store
            .upsert_board(&BoardRecord {
                id: BoardId::new("B1"),
                name: "Core".to_string(),
            })
            .expect("board");
        for (card, column) in [("C1", "In Progress"), ("C2", "Done")] {
            store
                .upsert_card(&CardRecord {
                    id: CardId::new(card),
                    board_id: BoardId::new("B1"),
                    title: format!("Card {card}"),
                    description: None,
                    column_title: column.to_string(),
                    ticket_key: None,
                    updated_at: Utc::now(),
                })
                .expect("card");
        }

        let now = Utc::now();
        let mut failed = AttemptRecord::queued(
            AttemptId::new("A-FAIL"),
            BoardId::new("B1"),
            Some(CardId::new("C1")),
            "default",
            "/tmp/wt1",
            now - Duration::minutes(3),
        );
        failed.status = AttemptStatus::Failed;
        let mut resolved = AttemptRecord::queued(
            AttemptId::new("A-OK"),
            BoardId::new("B1"),
            Some(CardId::new("C2")),
            "default",
            "/tmp/wt2",
            now - Duration::minutes(2),
        );
        resolved.status = AttemptStatus::Succeeded;
        store.create_attempt(&failed).expect("create failed");
        store.create_attempt(&resolved).expect("create resolved");
        store
            .append_log(&AttemptLog {
                attempt_id: failed.id.clone(),
                level: LogLevel::Error,
                message: "Codex exited with code 1".to_string(),
                created_at: now,
            })
            .expect("log");

        let inbox = build_inbox(&store, &store, &InboxConfig::default(), now)
            .await
            .expect("build inbox");
        assert!(inbox.review.is_empty());
        assert!(inbox.stuck.is_empty());
        assert_eq!(inbox.failed.len(), 1);
        assert_eq!(
            inbox.failed[0].error_summary.as_deref(),
            Some("Codex exited with code 1")
        );
        assert_eq!(inbox.failed[0].card_title, "Card C1");
    }
}
