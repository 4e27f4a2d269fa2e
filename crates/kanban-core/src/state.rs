//! Attempt lifecycle status as persisted on the attempt row.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    /// Created, waiting for the agent process to start
    Queued,
    /// Agent process is streaming
    Running,
    /// Cancellation requested, process not yet closed
    Stopping,
    Succeeded,
    Failed,
    /// Cancelled by an operator
    Stopped,
}

impl AttemptStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            AttemptStatus::Queued => "queued",
            AttemptStatus::Running => "running",
            AttemptStatus::Stopping => "stopping",
            AttemptStatus::Succeeded => "succeeded",
            AttemptStatus::Failed => "failed",
            AttemptStatus::Stopped => "stopped",
        }
    }

    /// Returns true once the attempt can no longer change on its own.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            AttemptStatus::Succeeded | AttemptStatus::Failed | AttemptStatus::Stopped
        )
    }

    pub fn is_in_flight(self) -> bool {
        matches!(
            self,
            AttemptStatus::Queued | AttemptStatus::Running | AttemptStatus::Stopping
        )
    }
}

impl std::str::FromStr for AttemptStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "queued" => Ok(AttemptStatus::Queued),
            "running" => Ok(AttemptStatus::Running),
            "stopping" => Ok(AttemptStatus::Stopping),
            "succeeded" => Ok(AttemptStatus::Succeeded),
            "failed" => Ok(AttemptStatus::Failed),
            "stopped" => Ok(AttemptStatus::Stopped),
            other => Err(format!(
                "invalid attempt status '{other}'. valid values: queued, running, stopping, succeeded, failed, stopped"
            )),
        }
    }
}

impl std::fmt::Display for AttemptStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
