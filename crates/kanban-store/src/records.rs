use chrono::{DateTime, Utc};
use kanban_core::{AgentKind, AttemptId, AttemptStatus, BoardId, CardId};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoardRecord {
    pub id: BoardId,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CardRecord {
    pub id: CardId,
    pub board_id: BoardId,
    pub title: String,
    pub description: Option<String>,
    pub column_title: String,
    pub ticket_key: Option<String>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub id: AttemptId,
    pub board_id: BoardId,
    pub card_id: Option<CardId>,
    pub agent: AgentKind,
    pub profile_id: String,
    pub status: AttemptStatus,
    pub session_id: Option<String>,
    pub worktree_path: String,
    pub branch_name: Option<String>,
    pub base_branch: Option<String>,
    pub pr_url: Option<String>,
    pub pr_merged: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AttemptRecord {
    pub fn queued(
        id: AttemptId,
        board_id: BoardId,
        card_id: Option<CardId>,
        profile_id: impl Into<String>,
        worktree_path: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            board_id,
            card_id,
            agent: AgentKind::Codex,
            profile_id: profile_id.into(),
            status: AttemptStatus::Queued,
            session_id: None,
            worktree_path: worktree_path.into(),
            branch_name: None,
            base_branch: None,
            pr_url: None,
            pr_merged: false,
            created_at: now,
            updated_at: now,
        }
    }
}
