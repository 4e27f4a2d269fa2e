//! Validation for daemon configuration.

use serde::{Deserialize, Serialize};

use crate::config::{AgentProfile, AppConfig, INBOX_LIMIT_HARD_CAP};

/// Flags the Codex command builder always sets itself.
const MANAGED_FLAGS: &[&str] = &["--json", "--sandbox", "--model"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationLevel {
    Error,
    Warning,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub level: ValidationLevel,
    pub code: &'static str,
    pub message: String,
}

pub trait Validate {
    fn validate(&self) -> Vec<ValidationIssue>;
}

pub fn has_errors(issues: &[ValidationIssue]) -> bool {
    issues
        .iter()
        .any(|issue| issue.level == ValidationLevel::Error)
}

impl Validate for AppConfig {
    fn validate(&self) -> Vec<ValidationIssue> {
        let mut issues = Vec::new();

        if self.server.bind.trim().is_empty() {
            issues.push(ValidationIssue {
                level: ValidationLevel::Error,
                code: "server.bind.empty",
                message: "server.bind must not be empty".to_string(),
            });
        }

        if self.runner.kill_grace_ms == 0 {
            issues.push(ValidationIssue {
                level: ValidationLevel::Error,
                code: "runner.kill_grace.zero",
                message: "kill_grace_ms cannot be 0; cancelled agents would never get SIGTERM"
                    .to_string(),
            });
        }

        if self.inbox.limit == 0 {
            issues.push(ValidationIssue {
                level: ValidationLevel::Error,
                code: "inbox.limit.zero",
                message: "inbox.limit must be greater than zero".to_string(),
            });
        } else if self.inbox.limit > INBOX_LIMIT_HARD_CAP {
            issues.push(ValidationIssue {
                level: ValidationLevel::Warning,
                code: "inbox.limit.clamped",
                message: format!(
                    "inbox.limit {} exceeds the hard cap and will be clamped to {INBOX_LIMIT_HARD_CAP}",
                    self.inbox.limit
                ),
            });
        }

        if self.inbox.scan_limit == 0 {
            issues.push(ValidationIssue {
                level: ValidationLevel::Error,
                code: "inbox.scan_limit.zero",
                message: "inbox.scan_limit must be greater than zero".to_string(),
            });
        }

        for profile in self.profiles.values() {
            issues.extend(profile.validate());
        }

        issues
    }
}

impl Validate for AgentProfile {
    fn validate(&self) -> Vec<ValidationIssue> {
        let mut issues = Vec::new();

        if self.model.trim().is_empty() {
            issues.push(ValidationIssue {
                level: ValidationLevel::Error,
                code: "profile.model.empty",
                message: "profile model must not be empty".to_string(),
            });
        }

        for arg in &self.extra_args {
            let flag = arg.split('=').next().unwrap_or(arg.as_str());
            if MANAGED_FLAGS.contains(&flag) {
                issues.push(ValidationIssue {
                    level: ValidationLevel::Warning,
                    code: "profile.extra_args.managed_flag",
                    message: format!("extra arg {arg} duplicates a flag the adapter already sets"),
                });
            }
        }

        if self.env.keys().any(|key| key.trim().is_empty()) {
            issues.push(ValidationIssue {
                level: ValidationLevel::Error,
                code: "profile.env.empty_key",
                message: "profile env contains an empty variable name".to_string(),
            });
        }

        if let Some(base) = &self.base_command {
            if base.first().map_or(true, |program| program.trim().is_empty()) {
                issues.push(ValidationIssue {
                    level: ValidationLevel::Error,
                    code: "profile.base_command.empty",
                    message: "base_command must name a program".to_string(),
                });
            }
        }

        issues
    }
}
