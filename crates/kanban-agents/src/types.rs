use async_trait::async_trait;
use kanban_core::{AgentEvent, AttemptId, BoardId, CardId};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Receives every event a run produces, in emission order.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn emit(&self, event: AgentEvent);
}

/// Forwards events into an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<AgentEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<AgentEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl EventSink for ChannelSink {
    async fn emit(&self, event: AgentEvent) {
        let _ = self.tx.send(event);
    }
}

/// Per-attempt inputs handed to an adapter. Read-only apart from `sink`.
#[derive(Clone)]
pub struct AgentContext {
    pub attempt_id: AttemptId,
    pub board_id: BoardId,
    pub card_id: CardId,
    pub worktree_path: PathBuf,
    pub branch_name: String,
    pub base_branch: String,
    pub card_title: String,
    pub card_description: Option<String>,
    pub profile_id: String,
    pub session_id: Option<String>,
    pub followup_prompt: Option<String>,
    pub cancel: CancellationToken,
    pub sink: Arc<dyn EventSink>,
}

impl AgentContext {
    pub async fn emit(&self, event: AgentEvent) {
        self.sink.emit(event).await;
    }
}

/// A fully resolved process invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
    pub stdin: Option<String>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            env: Vec::new(),
            stdin: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Succeeded,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunOutcome {
    pub exit_code: Option<i32>,
    pub status: RunStatus,
    /// Last session id seen on the stream, if any.
    pub session_id: Option<String>,
}

/// Lifecycle of one agent run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Idle,
    DetectingInstallation,
    Spawning,
    Streaming,
    Succeeded,
    Failed,
    Cancelled,
    Closed,
}

impl RunPhase {
    pub fn as_str(self) -> &'static str {
        match self {
            RunPhase::Idle => "idle",
            RunPhase::DetectingInstallation => "detecting_installation",
            RunPhase::Spawning => "spawning",
            RunPhase::Streaming => "streaming",
            RunPhase::Succeeded => "succeeded",
            RunPhase::Failed => "failed",
            RunPhase::Cancelled => "cancelled",
            RunPhase::Closed => "closed",
        }
    }

    pub fn can_transition_to(self, next: RunPhase) -> bool {
        use RunPhase::*;
        matches!(
            (self, next),
            (Idle, DetectingInstallation)
                | (DetectingInstallation, Spawning)
                | (Spawning, Streaming)
                | (Spawning, Failed)
                | (Streaming, Succeeded | Failed | Cancelled)
                | (Succeeded | Failed | Cancelled, Closed)
        )
    }
}

impl From<RunStatus> for RunPhase {
    fn from(status: RunStatus) -> Self {
        match status {
            RunStatus::Succeeded => RunPhase::Succeeded,
            RunStatus::Failed => RunPhase::Failed,
            RunStatus::Cancelled => RunPhase::Cancelled,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kanban_core::LogLevel;

    #[test]
    fn run_phase_follows_the_documented_path() {
        let path = [
            RunPhase::Idle,
            RunPhase::DetectingInstallation,
            RunPhase::Spawning,
            RunPhase::Streaming,
            RunPhase::Cancelled,
            RunPhase::Closed,
        ];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{:?}", pair);
        }
        assert!(!RunPhase::Idle.can_transition_to(RunPhase::Streaming));
        assert!(!RunPhase::Closed.can_transition_to(RunPhase::Idle));
    }

    #[test]
    fn command_spec_builder_appends_args() {
        let spec = CommandSpec::new("codex").arg("exec").arg("--json");
        assert_eq!(spec.args, vec!["exec", "--json"]);
        assert!(spec.stdin.is_none());
    }

    #[tokio::test]
    async fn channel_sink_forwards_in_order() {
        let (sink, mut rx) = ChannelSink::new();
        sink.emit(AgentEvent::log(LogLevel::Info, "one")).await;
        sink.emit(AgentEvent::Session {
            id: "s-1".to_string(),
        })
        .await;

        assert_eq!(
            rx.recv().await,
            Some(AgentEvent::log(LogLevel::Info, "one"))
        );
        assert!(matches!(rx.recv().await, Some(AgentEvent::Session { id }) if id == "s-1"));
    }
}
