use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kanban_core::{AttemptId, AttemptLog};

use crate::error::InboxError;
use crate::model::AttemptRowForInbox;

/// Attempt rows joined with card, column and board metadata.
#[async_trait]
pub trait InboxSource: Send + Sync {
    /// Rows updated at or after `since`, most recent first, at most `limit`.
    async fn list_inbox_rows(
        &self,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<AttemptRowForInbox>, InboxError>;
}

#[async_trait]
pub trait AttemptLogSource: Send + Sync {
    /// Logs for one attempt in the order they were written.
    async fn list_attempt_logs(&self, attempt_id: &AttemptId)
        -> Result<Vec<AttemptLog>, InboxError>;
}
