//! Inbox read model.

use chrono::{DateTime, NaiveDateTime, Utc};
use kanban_core::{AttemptId, AttemptStatus, BoardId, CardId};
use serde::{Deserialize, Serialize};

/// One attempt joined with its card, column and board metadata.
///
/// Timestamps are kept as stored text; unparseable values are tolerated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptRowForInbox {
    pub attempt_id: AttemptId,
    pub project_id: BoardId,
    pub card_id: Option<CardId>,
    pub card_title: String,
    pub ticket_key: Option<String>,
    pub agent_id: String,
    pub status: AttemptStatus,
    pub created_at: String,
    pub updated_at: String,
    pub pr_url: Option<String>,
    pub pr_merged: bool,
    pub column_title: Option<String>,
}

impl AttemptRowForInbox {
    pub fn has_open_pr(&self) -> bool {
        self.pr_url
            .as_deref()
            .is_some_and(|url| !url.trim().is_empty())
            && !self.pr_merged
    }

    pub fn in_done_column(&self) -> bool {
        self.column_title.as_deref().is_some_and(is_done_column)
    }

    /// Start of the attempt in ms, falling back to `updated_at` then `now_ms`.
    pub fn started_ms(&self, now_ms: i64) -> i64 {
        parse_timestamp_ms(&self.created_at)
            .or_else(|| parse_timestamp_ms(&self.updated_at))
            .unwrap_or(now_ms)
    }

    /// Last activity in ms, falling back to `created_at` then `now_ms`.
    pub fn last_activity_ms(&self, now_ms: i64) -> i64 {
        parse_timestamp_ms(&self.updated_at)
            .or_else(|| parse_timestamp_ms(&self.created_at))
            .unwrap_or(now_ms)
    }
}

pub fn is_done_column(title: &str) -> bool {
    let title = title.trim();
    title.eq_ignore_ascii_case("done") || title.eq_ignore_ascii_case("closed")
}

/// Accepts RFC 3339 and SQLite's `YYYY-MM-DD HH:MM:SS[.fff]` (UTC).
pub fn parse_timestamp_ms(value: &str) -> Option<i64> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    if let Ok(parsed) = DateTime::parse_from_rfc3339(value) {
        return Some(parsed.timestamp_millis());
    }
    NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc().timestamp_millis())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InboxKind {
    Review,
    Failed,
    Stuck,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboxItem {
    pub kind: InboxKind,
    pub attempt_id: AttemptId,
    pub project_id: BoardId,
    pub card_id: Option<CardId>,
    pub card_title: String,
    pub ticket_key: Option<String>,
    pub agent_id: String,
    pub status: AttemptStatus,
    pub created_at: DateTime<Utc>,
    pub last_updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pr_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stuck_for_seconds: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Inbox {
    pub review: Vec<InboxItem>,
    pub failed: Vec<InboxItem>,
    pub stuck: Vec<InboxItem>,
}

impl Inbox {
    pub fn len(&self) -> usize {
        self.review.len() + self.failed.len() + self.stuck.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn push(&mut self, item: InboxItem) {
        match item.kind {
            InboxKind::Review => self.review.push(item),
            InboxKind::Failed => self.failed.push(item),
            InboxKind::Stuck => self.stuck.push(item),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn done_column_match_is_trimmed_and_case_insensitive() {
        assert!(is_done_column(" Done "));
        assert!(is_done_column("CLOSED"));
        assert!(!is_done_column("Done-ish"));
        assert!(!is_done_column("In Progress"));
    }

    #[test]
    fn parses_rfc3339_and_sqlite_timestamps() {
        assert_eq!(parse_timestamp_ms("1970-01-01T00:00:01Z"), Some(1_000));
        assert_eq!(parse_timestamp_ms("1970-01-01 00:00:02"), Some(2_000));
        assert_eq!(parse_timestamp_ms("1970-01-01 00:00:02.500"), Some(2_500));
        assert_eq!(parse_timestamp_ms("yesterday"), None);
        assert_eq!(parse_timestamp_ms(""), None);
    }

    #[test]
    fn invalid_timestamps_fall_back_to_now() {
        let row = AttemptRowForInbox {
            attempt_id: AttemptId::new("a"),
            project_id: BoardId::new("b"),
            card_id: None,
            card_title: "t".to_string(),
            ticket_key: None,
            agent_id: "codex".to_string(),
            status: AttemptStatus::Queued,
            created_at: "garbage".to_string(),
            updated_at: "also garbage".to_string(),
            pr_url: None,
            pr_merged: false,
            column_title: None,
        };
        assert_eq!(row.started_ms(42), 42);
        assert_eq!(row.last_activity_ms(42), 42);
    }

    #[test]
    fn open_pr_requires_unmerged_non_empty_url() {
        let mut row = AttemptRowForInbox {
            attempt_id: AttemptId::new("a"),
            project_id: BoardId::new("b"),
            card_id: None,
            card_title: "t".to_string(),
            ticket_key: None,
            agent_id: "codex".to_string(),
            status: AttemptStatus::Succeeded,
            created_at: String::new(),
            updated_at: String::new(),
            pr_url: Some("https://github.com/acme/app/pull/7".to_string()),
            pr_merged: false,
            column_title: Some("Review".to_string()),
        };
        assert!(row.has_open_pr());
        row.pr_merged = true;
        assert!(!row.has_open_pr());
        row.pr_merged = false;
        row.pr_url = Some("  ".to_string());
        assert!(!row.has_open_pr());
    }
}
