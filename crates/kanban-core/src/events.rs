use serde::{Deserialize, Serialize};

use crate::conversation::ConversationItem;
use crate::types::AttemptId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            other => Err(format!(
                "invalid log level '{other}'. valid values: debug, info, warn, error"
            )),
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything an agent run can emit toward persistence and fan-out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    Log { level: LogLevel, message: String },
    Session { id: String },
    Conversation { item: ConversationItem },
}

impl AgentEvent {
    pub fn log(level: LogLevel, message: impl Into<String>) -> Self {
        AgentEvent::Log {
            level,
            message: message.into(),
        }
    }

    pub fn conversation(item: ConversationItem) -> Self {
        AgentEvent::Conversation { item }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            AgentEvent::Log { .. } => "log",
            AgentEvent::Session { .. } => "session",
            AgentEvent::Conversation { .. } => "conversation",
        }
    }
}

/// An [`AgentEvent`] scoped to the attempt that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptEvent {
    pub attempt_id: AttemptId,
    pub event: AgentEvent,
}
