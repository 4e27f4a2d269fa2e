use kanban_core::{AgentEvent, AttemptEvent, AttemptId, AttemptStatus, CardId};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub const DEFAULT_PROFILE_ID: &str = "default";
pub const DEFAULT_BASE_BRANCH: &str = "main";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartAttemptRequest {
    pub card_id: CardId,
    #[serde(default)]
    pub profile_id: Option<String>,
    pub worktree_path: PathBuf,
    #[serde(default)]
    pub branch_name: Option<String>,
    #[serde(default)]
    pub base_branch: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FollowupRequest {
    pub prompt: String,
    #[serde(default)]
    pub profile_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptStatusResponse {
    pub attempt_id: AttemptId,
    pub status: AttemptStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptEventsResponse {
    pub attempt_id: AttemptId,
    pub events: Vec<AgentEvent>,
}

/// SSE event name for a fan-out message.
pub fn web_event_name(event: &AttemptEvent) -> &'static str {
    event.event.kind()
}
