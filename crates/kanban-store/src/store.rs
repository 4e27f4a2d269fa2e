use chrono::{DateTime, SecondsFormat, Utc};
use kanban_core::{AgentEvent, AttemptId, AttemptLog, AttemptStatus, BoardId, CardId, LogLevel};
use kanban_inbox::AttemptRowForInbox;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::error::StoreError;
use crate::records::{AttemptRecord, BoardRecord, CardRecord};

/// SQLite-backed repository for boards, cards, attempts and their output.
///
/// Timestamps are written as fixed-width RFC 3339 (millisecond, `Z`) so text
/// ordering matches time ordering.
#[derive(Debug)]
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn migrate(&self) -> Result<(), StoreError> {
        self.conn().execute_batch(
            r#"
CREATE TABLE IF NOT EXISTS boards (
    board_id TEXT PRIMARY KEY,
    name TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS cards (
    card_id TEXT PRIMARY KEY,
    board_id TEXT NOT NULL REFERENCES boards(board_id),
    title TEXT NOT NULL,
    description TEXT,
    column_title TEXT NOT NULL,
    ticket_key TEXT,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_cards_board ON cards(board_id);

CREATE TABLE IF NOT EXISTS attempts (
    attempt_id TEXT PRIMARY KEY,
    board_id TEXT NOT NULL REFERENCES boards(board_id),
    card_id TEXT REFERENCES cards(card_id),
    agent TEXT NOT NULL,
    profile_id TEXT NOT NULL,
    status TEXT NOT NULL,
    session_id TEXT,
    worktree_path TEXT NOT NULL,
    branch_name TEXT,
    base_branch TEXT,
    pr_url TEXT,
    pr_merged INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_attempts_updated ON attempts(updated_at);
CREATE INDEX IF NOT EXISTS idx_attempts_card ON attempts(card_id, updated_at);

CREATE TABLE IF NOT EXISTS attempt_logs (
    log_id INTEGER PRIMARY KEY AUTOINCREMENT,
    attempt_id TEXT NOT NULL REFERENCES attempts(attempt_id),
    level TEXT NOT NULL,
    message TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_attempt_logs_attempt ON attempt_logs(attempt_id, log_id);

CREATE TABLE IF NOT EXISTS attempt_events (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    attempt_id TEXT NOT NULL REFERENCES attempts(attempt_id),
    kind_tag TEXT NOT NULL,
    payload_json TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_attempt_events_attempt ON attempt_events(attempt_id, seq);
"#,
        )?;
        Ok(())
    }

    pub fn upsert_board(&self, board: &BoardRecord) -> Result<(), StoreError> {
        self.conn().execute(
            r#"
INSERT INTO boards (board_id, name) VALUES (?1, ?2)
ON CONFLICT(board_id) DO UPDATE SET name = excluded.name
"#,
            params![board.id.0, board.name],
        )?;
        Ok(())
    }

    pub fn upsert_card(&self, card: &CardRecord) -> Result<(), StoreError> {
        self.conn().execute(
            r#"
INSERT INTO cards (card_id, board_id, title, description, column_title, ticket_key, updated_at)
VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
ON CONFLICT(card_id) DO UPDATE SET
  board_id = excluded.board_id,
  title = excluded.title,
  description = excluded.description,
  column_title = excluded.column_title,
  ticket_key = excluded.ticket_key,
  updated_at = excluded.updated_at
"#,
            params![
                card.id.0,
                card.board_id.0,
                card.title,
                card.description,
                card.column_title,
                card.ticket_key,
                timestamp(card.updated_at),
            ],
        )?;
        Ok(())
    }

    pub fn load_card(&self, card_id: &CardId) -> Result<Option<CardRecord>, StoreError> {
        let raw = self
            .conn()
            .query_row(
                r#"
SELECT card_id, board_id, title, description, column_title, ticket_key, updated_at
FROM cards WHERE card_id = ?1
"#,
                params![card_id.0],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, Option<String>>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, Option<String>>(5)?,
                        row.get::<_, String>(6)?,
                    ))
                },
            )
            .optional()?;
        raw.map(
            |(id, board_id, title, description, column_title, ticket_key, updated_at)| {
                Ok(CardRecord {
                    id: CardId(id),
                    board_id: BoardId(board_id),
                    title,
                    description,
                    column_title,
                    ticket_key,
                    updated_at: parse_timestamp(updated_at)?,
                })
            },
        )
        .transpose()
    }

    pub fn create_attempt(&self, attempt: &AttemptRecord) -> Result<(), StoreError> {
        self.conn().execute(
            r#"
INSERT INTO attempts (
    attempt_id, board_id, card_id, agent, profile_id, status, session_id,
    worktree_path, branch_name, base_branch, pr_url, pr_merged, created_at, updated_at
)
VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
"#,
            params![
                attempt.id.0,
                attempt.board_id.0,
                attempt.card_id.as_ref().map(|id| id.0.clone()),
                attempt.agent.as_str(),
                attempt.profile_id,
                attempt.status.as_str(),
                attempt.session_id,
                attempt.worktree_path,
                attempt.branch_name,
                attempt.base_branch,
                attempt.pr_url,
                attempt.pr_merged,
                timestamp(attempt.created_at),
                timestamp(attempt.updated_at),
            ],
        )?;
        Ok(())
    }

    /// Returns whether a row was updated.
    pub fn set_attempt_status(
        &self,
        attempt_id: &AttemptId,
        status: AttemptStatus,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let updated = self.conn().execute(
            "UPDATE attempts SET status = ?1, updated_at = ?2 WHERE attempt_id = ?3",
            params![status.as_str(), timestamp(at), attempt_id.0],
        )?;
        Ok(updated > 0)
    }

    /// Moves the attempt to `to` only if its current status is one of `from`.
    pub fn transition_attempt_status(
        &self,
        attempt_id: &AttemptId,
        from: &[AttemptStatus],
        to: AttemptStatus,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        if from.is_empty() {
            return Ok(false);
        }
        let placeholders = (0..from.len())
            .map(|index| format!("?{}", index + 4))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "UPDATE attempts SET status = ?1, updated_at = ?2 WHERE attempt_id = ?3 AND status IN ({placeholders})"
        );
        let mut values = vec![to.as_str().to_string(), timestamp(at), attempt_id.0.clone()];
        values.extend(from.iter().map(|status| status.as_str().to_string()));
        let updated = self
            .conn()
            .execute(&sql, rusqlite::params_from_iter(values.iter()))?;
        Ok(updated > 0)
    }

    pub fn set_attempt_session(
        &self,
        attempt_id: &AttemptId,
        session_id: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let updated = self.conn().execute(
            "UPDATE attempts SET session_id = ?1, updated_at = ?2 WHERE attempt_id = ?3",
            params![session_id, timestamp(at), attempt_id.0],
        )?;
        Ok(updated > 0)
    }

    pub fn set_attempt_pr(
        &self,
        attempt_id: &AttemptId,
        pr_url: Option<&str>,
        merged: bool,
        at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let updated = self.conn().execute(
            "UPDATE attempts SET pr_url = ?1, pr_merged = ?2, updated_at = ?3 WHERE attempt_id = ?4",
            params![pr_url, merged, timestamp(at), attempt_id.0],
        )?;
        Ok(updated > 0)
    }

    /// Marks attempts left queued, running or stopping by a previous process
    /// as failed. Returns the number of attempts touched.
    pub fn fail_interrupted_attempts(&self, at: DateTime<Utc>) -> Result<usize, StoreError> {
        let updated = self.conn().execute(
            r#"
UPDATE attempts SET status = ?1, updated_at = ?2
WHERE status IN (?3, ?4, ?5)
"#,
            params![
                AttemptStatus::Failed.as_str(),
                timestamp(at),
                AttemptStatus::Queued.as_str(),
                AttemptStatus::Running.as_str(),
                AttemptStatus::Stopping.as_str(),
            ],
        )?;
        Ok(updated)
    }

    pub fn load_attempt(&self, attempt_id: &AttemptId) -> Result<Option<AttemptRecord>, StoreError> {
        let raw = self
            .conn()
            .query_row(
                r#"
SELECT attempt_id, board_id, card_id, agent, profile_id, status, session_id,
       worktree_path, branch_name, base_branch, pr_url, pr_merged, created_at, updated_at
FROM attempts WHERE attempt_id = ?1
"#,
                params![attempt_id.0],
                |row| {
                    Ok(RawAttempt {
                        id: row.get(0)?,
                        board_id: row.get(1)?,
                        card_id: row.get(2)?,
                        agent: row.get(3)?,
                        profile_id: row.get(4)?,
                        status: row.get(5)?,
                        session_id: row.get(6)?,
                        worktree_path: row.get(7)?,
                        branch_name: row.get(8)?,
                        base_branch: row.get(9)?,
                        pr_url: row.get(10)?,
                        pr_merged: row.get(11)?,
                        created_at: row.get(12)?,
                        updated_at: row.get(13)?,
                    })
                },
            )
            .optional()?;
        raw.map(RawAttempt::into_record).transpose()
    }

    pub fn append_log(&self, log: &AttemptLog) -> Result<(), StoreError> {
        self.conn().execute(
            r#"
INSERT INTO attempt_logs (attempt_id, level, message, created_at)
VALUES (?1, ?2, ?3, ?4)
"#,
            params![
                log.attempt_id.0,
                log.level.as_str(),
                log.message,
                timestamp(log.created_at),
            ],
        )?;
        Ok(())
    }

    pub fn list_attempt_logs(&self, attempt_id: &AttemptId) -> Result<Vec<AttemptLog>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            r#"
SELECT level, message, created_at FROM attempt_logs
WHERE attempt_id = ?1 ORDER BY log_id ASC
"#,
        )?;
        let rows = stmt.query_map(params![attempt_id.0], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;
        let mut logs = Vec::new();
        for row in rows {
            let (level, message, created_at) = row?;
            logs.push(AttemptLog {
                attempt_id: attempt_id.clone(),
                level: parse_column::<LogLevel>("attempt_logs.level", &level)?,
                message,
                created_at: parse_timestamp(created_at)?,
            });
        }
        Ok(logs)
    }

    /// Appends an event and returns its sequence number.
    pub fn append_event(
        &self,
        attempt_id: &AttemptId,
        event: &AgentEvent,
        at: DateTime<Utc>,
    ) -> Result<i64, StoreError> {
        let payload = serde_json::to_string(event)?;
        let conn = self.conn();
        conn.execute(
            r#"
INSERT INTO attempt_events (attempt_id, kind_tag, payload_json, created_at)
VALUES (?1, ?2, ?3, ?4)
"#,
            params![attempt_id.0, event.kind(), payload, timestamp(at)],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Events for one attempt in arrival order.
    pub fn list_attempt_events(&self, attempt_id: &AttemptId) -> Result<Vec<AgentEvent>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare("SELECT payload_json FROM attempt_events WHERE attempt_id = ?1 ORDER BY seq ASC")?;
        let rows = stmt.query_map(params![attempt_id.0], |row| row.get::<_, String>(0))?;
        let mut events = Vec::new();
        for row in rows {
            let payload = row?;
            events.push(serde_json::from_str::<AgentEvent>(&payload)?);
        }
        Ok(events)
    }

    /// Attempts touched at or after `since`, joined with card, column and
    /// board, newest first.
    pub fn list_inbox_rows(
        &self,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<AttemptRowForInbox>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            r#"
SELECT a.attempt_id, a.board_id, a.card_id, COALESCE(c.title, ''), c.ticket_key,
       a.agent, a.status, a.created_at, a.updated_at, a.pr_url, a.pr_merged, c.column_title
FROM attempts a
LEFT JOIN cards c ON c.card_id = a.card_id
WHERE a.updated_at >= ?1
ORDER BY a.updated_at DESC, a.attempt_id ASC
LIMIT ?2
"#,
        )?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = stmt.query_map(params![timestamp(since), limit], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Option<String>>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, Option<String>>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, String>(6)?,
                row.get::<_, String>(7)?,
                row.get::<_, String>(8)?,
                row.get::<_, Option<String>>(9)?,
                row.get::<_, bool>(10)?,
                row.get::<_, Option<String>>(11)?,
            ))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (
                attempt_id,
                board_id,
                card_id,
                card_title,
                ticket_key,
                agent_id,
                status,
                created_at,
                updated_at,
                pr_url,
                pr_merged,
                column_title,
            ) = row?;
            out.push(AttemptRowForInbox {
                attempt_id: AttemptId(attempt_id),
                project_id: BoardId(board_id),
                card_id: card_id.map(CardId),
                card_title,
                ticket_key,
                agent_id,
                status: parse_column::<AttemptStatus>("attempts.status", &status)?,
                created_at,
                updated_at,
                pr_url,
                pr_merged,
                column_title,
            });
        }
        Ok(out)
    }
}

struct RawAttempt {
    id: String,
    board_id: String,
    card_id: Option<String>,
    agent: String,
    profile_id: String,
    status: String,
    session_id: Option<String>,
    worktree_path: String,
    branch_name: Option<String>,
    base_branch: Option<String>,
    pr_url: Option<String>,
    pr_merged: bool,
    created_at: String,
    updated_at: String,
}

impl RawAttempt {
    fn into_record(self) -> Result<AttemptRecord, StoreError> {
        Ok(AttemptRecord {
            id: AttemptId(self.id),
            board_id: BoardId(self.board_id),
            card_id: self.card_id.map(CardId),
            agent: parse_column("attempts.agent", &self.agent)?,
            profile_id: self.profile_id,
            status: parse_column("attempts.status", &self.status)?,
            session_id: self.session_id,
            worktree_path: self.worktree_path,
            branch_name: self.branch_name,
            base_branch: self.base_branch,
            pr_url: self.pr_url,
            pr_merged: self.pr_merged,
            created_at: parse_timestamp(self.created_at)?,
            updated_at: parse_timestamp(self.updated_at)?,
        })
    }
}

pub(crate) fn timestamp(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_timestamp(value: String) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(&value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|source| StoreError::TimestampParse { value, source })
}

fn parse_column<T>(column: &'static str, value: &str) -> Result<T, StoreError>
where
    T: FromStr<Err = String>,
{
    value
        .parse::<T>()
        .map_err(|message| StoreError::InvalidColumn { column, message })
}
