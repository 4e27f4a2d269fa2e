//! Normalized conversation model shared by every agent vendor.
//!
//! Items are append-only per attempt: once emitted an item is never edited.
//! Tool and automation items are only constructed after their begin/end pair
//! has been fully correlated.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationItem {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub body: ConversationBody,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConversationBody {
    Message {
        role: MessageRole,
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        format: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        profile_id: Option<String>,
    },
    Thinking {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        title: Option<String>,
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        format: Option<String>,
    },
    Tool {
        tool: ToolInvocation,
    },
    Error {
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        details: Option<Value>,
    },
    Automation(AutomationRun),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
    System,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolStatus {
    Created,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

/// One command or tool invocation made by the agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolInvocation {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    pub status: ToolStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl ToolInvocation {
    pub fn new(name: impl Into<String>, status: ToolStatus) -> Self {
        Self {
            name: name.into(),
            action: None,
            command: None,
            cwd: None,
            status,
            started_at: None,
            completed_at: None,
            duration_ms: None,
            exit_code: None,
            stdout: None,
            stderr: None,
            metadata: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AutomationStage {
    CopyFiles,
    Setup,
    Dev,
    Cleanup,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AutomationStatus {
    Running,
    Succeeded,
    Failed,
}

/// A worktree automation script run (copy files, setup, dev server, cleanup).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutomationRun {
    pub stage: AutomationStage,
    pub command: String,
    pub cwd: String,
    pub status: AutomationStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_failure: Option<bool>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
}

impl ConversationItem {
    pub fn new(timestamp: DateTime<Utc>, body: ConversationBody) -> Self {
        Self {
            id: None,
            timestamp,
            body,
        }
    }

    pub fn message(role: MessageRole, text: impl Into<String>) -> Self {
        Self::new(
            Utc::now(),
            ConversationBody::Message {
                role,
                text: text.into(),
                format: Some("markdown".to_string()),
                profile_id: None,
            },
        )
    }

    pub fn thinking(title: Option<String>, text: impl Into<String>) -> Self {
        Self::new(
            Utc::now(),
            ConversationBody::Thinking {
                title,
                text: text.into(),
                format: Some("markdown".to_string()),
            },
        )
    }

    pub fn tool(tool: ToolInvocation) -> Self {
        Self::new(Utc::now(), ConversationBody::Tool { tool })
    }

    pub fn error(text: impl Into<String>, details: Option<Value>) -> Self {
        Self::new(
            Utc::now(),
            ConversationBody::Error {
                text: text.into(),
                details,
            },
        )
    }

    pub fn automation(run: AutomationRun) -> Self {
        Self::new(Utc::now(), ConversationBody::Automation(run))
    }

    pub fn kind(&self) -> &'static str {
        match self.body {
            ConversationBody::Message { .. } => "message",
            ConversationBody::Thinking { .. } => "thinking",
            ConversationBody::Tool { .. } => "tool",
            ConversationBody::Error { .. } => "error",
            ConversationBody::Automation(_) => "automation",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 9, 30, 0)
            .single()
            .expect("valid timestamp")
    }

    #[test]
    fn message_item_serializes_flat_with_type_tag() {
        let item = ConversationItem::new(
            at(),
            ConversationBody::Message {
                role: MessageRole::Assistant,
                text: "done".to_string(),
                format: None,
                profile_id: Some("default".to_string()),
            },
        );

        let value = serde_json::to_value(&item).expect("serialize item");
        assert_eq!(value["type"], "message");
        assert_eq!(value["role"], "assistant");
        assert_eq!(value["profile_id"], "default");
        assert_eq!(value["timestamp"], "2026-03-01T09:30:00Z");
        assert!(value.get("id").is_none());
        assert!(value.get("format").is_none());
    }

    #[test]
    fn tool_item_omits_unset_fields() {
        let mut tool = ToolInvocation::new("exec", ToolStatus::Succeeded);
        tool.command = Some("cargo test".to_string());
        tool.exit_code = Some(0);
        let value = serde_json::to_value(ConversationItem::tool(tool)).expect("serialize tool");

        assert_eq!(value["type"], "tool");
        assert_eq!(value["tool"]["status"], "succeeded");
        assert_eq!(value["tool"]["command"], "cargo test");
        assert!(value["tool"].get("stderr").is_none());
    }

    #[test]
    fn automation_item_decodes_from_wire_shape() {
        let decoded: ConversationItem = serde_json::from_value(json!({
            "timestamp": "2026-03-01T09:30:00Z",
            "type": "automation",
            "stage": "copy_files",
            "command": "cp .env.example .env",
            "cwd": "/tmp/wt",
            "status": "failed",
            "allowed_failure": true,
            "started_at": "2026-03-01T09:29:58Z",
            "duration_ms": 2000,
            "exit_code": 1
        }))
        .expect("deserialize automation item");

        assert_eq!(decoded.kind(), "automation");
        let ConversationBody::Automation(run) = decoded.body else {
            panic!("expected automation body");
        };
        assert_eq!(run.stage, AutomationStage::CopyFiles);
        assert_eq!(run.status, AutomationStatus::Failed);
        assert_eq!(run.allowed_failure, Some(true));
    }

    #[test]
    fn error_item_keeps_details_payload() {
        let item = ConversationItem::error("boom", Some(json!({ "code": 2 })));
        let value = serde_json::to_value(&item).expect("serialize error");
        assert_eq!(value["type"], "error");
        assert_eq!(value["details"]["code"], 2);
    }
}
