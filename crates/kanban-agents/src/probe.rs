use async_trait::async_trait;
use kanban_core::AgentProfile;
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;

use crate::util::shell_quote;

pub const CODEX_EXECUTABLE: &str = "codex";
pub const CODEX_NPX_FALLBACK: &[&str] = &["npx", "-y", "@openai/codex"];

/// Answers whether an executable is reachable on the login shell's PATH.
#[async_trait]
pub trait InstallationProbe: Send + Sync {
    async fn command_exists(&self, executable: &str) -> bool;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ShellInstallationProbe;

#[async_trait]
impl InstallationProbe for ShellInstallationProbe {
    async fn command_exists(&self, executable: &str) -> bool {
        Command::new("bash")
            .arg("-lc")
            .arg(format!("command -v -- {}", shell_quote(executable)))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map(|status| status.success())
            .unwrap_or(false)
    }
}

/// Picks the argv prefix used to launch Codex.
///
/// An explicit `base_command` on the profile wins and skips probing.
pub async fn resolve_codex_base(
    profile: &AgentProfile,
    probe: &dyn InstallationProbe,
) -> Vec<String> {
    if let Some(base) = profile
        .base_command
        .as_ref()
        .filter(|base| base.first().is_some_and(|program| !program.trim().is_empty()))
    {
        return base.clone();
    }

    if probe.command_exists(CODEX_EXECUTABLE).await {
        debug!(executable = CODEX_EXECUTABLE, "agent found on PATH");
        vec![CODEX_EXECUTABLE.to_string()]
    } else {
        debug!(
            executable = CODEX_EXECUTABLE,
            "agent not on PATH, falling back to npx"
        );
        CODEX_NPX_FALLBACK.iter().map(|part| part.to_string()).collect()
    }
}
