use async_trait::async_trait;
use kanban_core::{AgentEvent, AgentKind, AgentProfile, AttemptId, ConversationItem, LogLevel};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, trace, warn};

use crate::envelope::{handle_envelope, Dispatch};
use crate::error::AgentError;
use crate::grouper::Grouper;
use crate::probe::{resolve_codex_base, InstallationProbe, ShellInstallationProbe};
use crate::redact::{redact_json, redact_secrets};
use crate::runner::{CommandRunner, RunExit, RunHooks};
use crate::types::{AgentContext, CommandSpec, RunOutcome, RunPhase, RunStatus};
use crate::util::render_command_preview;

/// Target for raw envelope and command dumps of debug profiles.
pub const DEBUG_TARGET: &str = "kanban_agents::debug";

#[async_trait]
pub trait AgentAdapter: Send + Sync {
    fn kind(&self) -> AgentKind;

    /// Starts a fresh session for the card.
    async fn run(&self, ctx: &AgentContext, profile: &AgentProfile)
        -> Result<RunOutcome, AgentError>;

    /// Continues `ctx.session_id` with `ctx.followup_prompt`.
    async fn resume(
        &self,
        ctx: &AgentContext,
        profile: &AgentProfile,
    ) -> Result<RunOutcome, AgentError>;
}

pub struct CodexAdapter {
    probe: Arc<dyn InstallationProbe>,
    runner: CommandRunner,
}

impl CodexAdapter {
    pub fn new(runner: CommandRunner) -> Self {
        Self::with_probe(Arc::new(ShellInstallationProbe), runner)
    }

    pub fn with_probe(probe: Arc<dyn InstallationProbe>, runner: CommandRunner) -> Self {
        Self { probe, runner }
    }

    fn check_agent(&self, profile: &AgentProfile) -> Result<(), AgentError> {
        if profile.agent != self.kind() {
            return Err(AgentError::UnsupportedAgent {
                agent: profile.agent,
            });
        }
        Ok(())
    }

    async fn execute(
        &self,
        ctx: &AgentContext,
        profile: &AgentProfile,
        resume_session: Option<&str>,
        stdin: String,
    ) -> Result<RunOutcome, AgentError> {
        let mut phase = PhaseTracker::new(&ctx.attempt_id);
        phase.advance(RunPhase::DetectingInstallation);
        let base = resolve_codex_base(profile, self.probe.as_ref()).await;

        phase.advance(RunPhase::Spawning);
        let spec = build_codex_command(base, ctx, profile, resume_session, stdin);
        if profile.debug {
            debug!(
                target: DEBUG_TARGET,
                attempt_id = %ctx.attempt_id,
                command = %redact_secrets(&render_command_preview(&spec)),
                "agent command"
            );
        }

        let mut hooks = CodexRunHooks::new(ctx, profile.debug);
        phase.advance(RunPhase::Streaming);
        let result = self.runner.run(&spec, &ctx.cancel, &mut hooks).await;
        hooks.finish().await;
        debug!(
            attempt_id = %ctx.attempt_id,
            ignored_envelopes = hooks.grouper.ignored_envelopes(),
            "agent stream finished"
        );

        match result {
            Ok(exit) => {
                let status = run_status(&exit);
                match status {
                    RunStatus::Succeeded => {}
                    RunStatus::Failed => {
                        let code = exit
                            .code
                            .map_or_else(|| "a signal".to_string(), |code| format!("code {code}"));
                        ctx.emit(AgentEvent::log(
                            LogLevel::Error,
                            format!("Codex exited with {code}"),
                        ))
                        .await;
                    }
                    RunStatus::Cancelled => {
                        ctx.emit(AgentEvent::log(LogLevel::Warn, "Run cancelled"))
                            .await;
                    }
                }
                phase.advance(status.into());
                phase.advance(RunPhase::Closed);
                Ok(RunOutcome {
                    exit_code: exit.code,
                    status,
                    session_id: hooks.session_id,
                })
            }
            Err(err) => {
                ctx.emit(AgentEvent::conversation(ConversationItem::error(
                    format!("Failed to run Codex: {err}"),
                    None,
                )))
                .await;
                phase.advance(RunPhase::Failed);
                phase.advance(RunPhase::Closed);
                Err(err)
            }
        }
    }
}

#[async_trait]
impl AgentAdapter for CodexAdapter {
    fn kind(&self) -> AgentKind {
        AgentKind::Codex
    }

    async fn run(
        &self,
        ctx: &AgentContext,
        profile: &AgentProfile,
    ) -> Result<RunOutcome, AgentError> {
        self.check_agent(profile)?;
        let prompt = build_prompt(ctx, profile);
        self.execute(ctx, profile, None, prompt).await
    }

    async fn resume(
        &self,
        ctx: &AgentContext,
        profile: &AgentProfile,
    ) -> Result<RunOutcome, AgentError> {
        let Some(session_id) = ctx.session_id.as_deref().filter(|id| !id.trim().is_empty())
        else {
            return Err(AgentError::MissingSession {
                attempt_id: ctx.attempt_id.to_string(),
            });
        };
        self.check_agent(profile)?;
        let Some(followup) = ctx
            .followup_prompt
            .as_deref()
            .filter(|prompt| !prompt.trim().is_empty())
        else {
            return Err(AgentError::InvalidRequest {
                message: "followup prompt must not be empty".to_string(),
            });
        };
        self.execute(ctx, profile, Some(session_id), followup.to_string())
            .await
    }
}

pub fn default_adapter_for(
    kind: AgentKind,
    runner: CommandRunner,
) -> Result<Box<dyn AgentAdapter>, AgentError> {
    match kind {
        AgentKind::Codex => Ok(Box::new(CodexAdapter::new(runner))),
    }
}

fn run_status(exit: &RunExit) -> RunStatus {
    if exit.cancelled {
        RunStatus::Cancelled
    } else if exit.code == Some(0) {
        RunStatus::Succeeded
    } else {
        RunStatus::Failed
    }
}

/// Builds the Codex argv. The prompt always travels on stdin (`-`).
pub fn build_codex_command(
    base: Vec<String>,
    ctx: &AgentContext,
    profile: &AgentProfile,
    resume_session: Option<&str>,
    stdin: String,
) -> CommandSpec {
    let mut parts = base.into_iter();
    let program = parts.next().unwrap_or_else(|| "codex".to_string());
    let mut args: Vec<String> = parts.collect();

    args.extend(
        [
            "exec",
            "--json",
            "--skip-git-repo-check",
            "-C",
        ]
        .map(String::from),
    );
    args.push(ctx.worktree_path.display().to_string());

    if !profile.model.trim().is_empty() {
        args.push("--model".to_string());
        args.push(profile.model.clone());
    }
    if let Some(effort) = profile.reasoning_effort.as_deref().filter(|v| !v.is_empty()) {
        args.push("-c".to_string());
        args.push(format!("model_reasoning_effort={effort}"));
    }
    if let Some(sandbox) = profile.sandbox.as_deref().filter(|v| !v.is_empty()) {
        args.push("--sandbox".to_string());
        args.push(sandbox.to_string());
    }
    if let Some(approval) = profile.approval.as_deref().filter(|v| !v.is_empty()) {
        args.push("-c".to_string());
        args.push(format!("approval_policy={approval}"));
    }
    args.extend(profile.extra_args.iter().cloned());

    if let Some(session_id) = resume_session {
        args.push("resume".to_string());
        args.push(session_id.to_string());
    }
    args.push("-".to_string());

    CommandSpec {
        program,
        args,
        cwd: Some(ctx.worktree_path.clone()),
        env: profile
            .env
            .iter()
            .filter(|(key, _)| !key.trim().is_empty())
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect(),
        stdin: Some(stdin),
    }
}

pub fn build_prompt(ctx: &AgentContext, profile: &AgentProfile) -> String {
    let mut sections = Vec::new();

    let mut task = format!("# Task\n\n**Title:** {}\n", ctx.card_title.trim());
    if let Some(description) = ctx
        .card_description
        .as_deref()
        .map(str::trim)
        .filter(|d| !d.is_empty())
    {
        task.push('\n');
        task.push_str(description);
        task.push('\n');
    }
    sections.push(task);

    sections.push(format!(
        "# Repository\n\n\
         - Worktree: `{}`\n\
         - Branch: `{}`\n\
         - Base branch: `{}`\n",
        ctx.worktree_path.display(),
        ctx.branch_name,
        ctx.base_branch,
    ));

    let extra = profile.append_prompt.trim();
    if !extra.is_empty() {
        sections.push(format!("{extra}\n"));
    }

    sections.join("\n---\n\n")
}

struct PhaseTracker<'a> {
    attempt_id: &'a AttemptId,
    current: RunPhase,
}

impl<'a> PhaseTracker<'a> {
    fn new(attempt_id: &'a AttemptId) -> Self {
        Self {
            attempt_id,
            current: RunPhase::Idle,
        }
    }

    fn advance(&mut self, next: RunPhase) {
        if !self.current.can_transition_to(next) {
            warn!(
                attempt_id = %self.attempt_id,
                from = self.current.as_str(),
                to = next.as_str(),
                "unexpected run phase transition"
            );
        }
        debug!(
            attempt_id = %self.attempt_id,
            from = self.current.as_str(),
            to = next.as_str(),
            "run phase"
        );
        self.current = next;
    }
}

struct CodexRunHooks<'a> {
    ctx: &'a AgentContext,
    debug: bool,
    grouper: Grouper,
    session_id: Option<String>,
    pending: Vec<AgentEvent>,
}

impl<'a> CodexRunHooks<'a> {
    fn new(ctx: &'a AgentContext, debug: bool) -> Self {
        Self {
            ctx,
            debug,
            grouper: Grouper::new(),
            session_id: None,
            pending: Vec::new(),
        }
    }

    async fn drain(&mut self) {
        for event in std::mem::take(&mut self.pending) {
            if let AgentEvent::Session { id } = &event {
                self.session_id = Some(id.clone());
            }
            self.ctx.emit(event).await;
        }
    }

    async fn finish(&mut self) {
        self.grouper.finish(&mut self.pending);
        self.drain().await;
    }
}

#[async_trait]
impl<'a> RunHooks for CodexRunHooks<'a> {
    async fn on_stdout_json(&mut self, value: Value) {
        if self.debug {
            debug!(
                target: DEBUG_TARGET,
                attempt_id = %self.ctx.attempt_id,
                envelope = %redact_json(&value),
                "agent envelope"
            );
        }
        if handle_envelope(&value, &mut self.grouper, &mut self.pending) == Dispatch::Ignored {
            trace!(
                attempt_id = %self.ctx.attempt_id,
                kind = value.get("type").and_then(|kind| kind.as_str()).unwrap_or("-"),
                "ignored agent envelope"
            );
        }
        self.drain().await;
    }

    async fn on_stdout_text(&mut self, line: String) {
        self.ctx.emit(AgentEvent::log(LogLevel::Info, line)).await;
    }

    async fn on_stderr_text(&mut self, line: String) {
        self.ctx.emit(AgentEvent::log(LogLevel::Warn, line)).await;
    }

    async fn after_close(&mut self, exit: &RunExit) {
        debug!(
            attempt_id = %self.ctx.attempt_id,
            code = ?exit.code,
            cancelled = exit.cancelled,
            "codex process closed"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::tests::FakeProbe;
    use crate::types::ChannelSink;
    use kanban_core::{BoardId, CardId, ConversationBody, MessageRole, ToolStatus};
    use std::path::PathBuf;
    use std::time::Duration;
    use tokio::sync::mpsc::UnboundedReceiver;
    use tokio_util::sync::CancellationToken;

    fn context(worktree: PathBuf) -> (AgentContext, UnboundedReceiver<AgentEvent>) {
        let (sink, rx) = ChannelSink::new();
        let ctx = AgentContext {
            attempt_id: AttemptId::new("att-1"),
            board_id: BoardId::new("board-1"),
            card_id: CardId::new("card-1"),
            worktree_path: worktree,
            branch_name: "kanban/card-1".to_string(),
            base_branch: "main".to_string(),
            card_title: "Fix login redirect".to_string(),
            card_description: Some("Users land on /404 after login.".to_string()),
            profile_id: "default".to_string(),
            session_id: None,
            followup_prompt: None,
            cancel: CancellationToken::new(),
            sink: Arc::new(sink),
        };
        (ctx, rx)
    }

    fn profile() -> AgentProfile {
        AgentProfile::new(AgentKind::Codex, "gpt-5-codex")
    }

    fn drain(rx: &mut UnboundedReceiver<AgentEvent>) -> Vec<AgentEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    /// Profile whose "Codex" is a shell script replaying canned JSONL.
    fn scripted_profile(script: &str) -> AgentProfile {
        let mut profile = profile();
        profile.base_command = Some(vec![
            "sh".to_string(),
            "-c".to_string(),
            script.to_string(),
            "codex".to_string(),
        ]);
        profile
    }

    #[test]
    fn fresh_command_puts_flags_before_stdin_marker() {
        let (ctx, _rx) = context(PathBuf::from("/tmp/wt"));
        let mut profile = profile();
        profile.reasoning_effort = Some("high".to_string());
        profile.sandbox = Some("workspace-write".to_string());
        profile.approval = Some("never".to_string());
        profile.extra_args = vec!["--color".to_string(), "never".to_string()];
        profile
            .env
            .insert("OPENAI_BASE_URL".to_string(), "http://proxy".to_string());

        let spec = build_codex_command(
            vec!["npx".to_string(), "-y".to_string(), "@openai/codex".to_string()],
            &ctx,
            &profile,
            None,
            "prompt".to_string(),
        );

        assert_eq!(spec.program, "npx");
        assert_eq!(
            spec.args,
            vec![
                "-y",
                "@openai/codex",
                "exec",
                "--json",
                "--skip-git-repo-check",
                "-C",
                "/tmp/wt",
                "--model",
                "gpt-5-codex",
                "-c",
                "model_reasoning_effort=high",
                "--sandbox",
                "workspace-write",
                "-c",
                "approval_policy=never",
                "--color",
                "never",
                "-",
            ]
        );
        assert_eq!(spec.cwd, Some(PathBuf::from("/tmp/wt")));
        assert_eq!(spec.stdin.as_deref(), Some("prompt"));
        assert_eq!(
            spec.env,
            vec![("OPENAI_BASE_URL".to_string(), "http://proxy".to_string())]
        );
    }

    #[test]
    fn resume_command_inserts_session_before_stdin_marker() {
        let (ctx, _rx) = context(PathBuf::from("/tmp/wt"));
        let spec = build_codex_command(
            vec!["codex".to_string()],
            &ctx,
            &profile(),
            Some("sess-9"),
            "follow up".to_string(),
        );

        let tail: Vec<&str> = spec.args.iter().rev().take(3).map(String::as_str).collect();
        assert_eq!(tail, vec!["-", "sess-9", "resume"]);
        assert_eq!(spec.stdin.as_deref(), Some("follow up"));
    }

    #[test]
    fn prompt_sections_are_joined_with_rules() {
        let (ctx, _rx) = context(PathBuf::from("/tmp/wt"));
        let mut profile = profile();
        profile.append_prompt = "Run the tests before finishing.".to_string();

        let prompt = build_prompt(&ctx, &profile);
        assert!(prompt.starts_with("# Task\n\n**Title:** Fix login redirect\n"));
        assert!(prompt.contains("Users land on /404 after login."));
        assert!(prompt.contains("- Branch: `kanban/card-1`"));
        assert_eq!(prompt.matches("\n---\n\n").count(), 2);
        assert!(prompt.ends_with("Run the tests before finishing.\n"));
    }

    #[tokio::test]
    async fn resume_without_session_fails_before_probing() {
        let probe = Arc::new(FakeProbe::new(true));
        let adapter = CodexAdapter::with_probe(probe.clone(), CommandRunner::default());
        let (mut ctx, mut rx) = context(std::env::temp_dir());
        ctx.followup_prompt = Some("keep going".to_string());

        let err = adapter
            .resume(&ctx, &profile())
            .await
            .expect_err("resume without session must fail");

        assert!(matches!(err, AgentError::MissingSession { attempt_id } if attempt_id == "att-1"));
        assert_eq!(probe.call_count(), 0);
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn resume_requires_a_followup_prompt() {
        let probe = Arc::new(FakeProbe::new(true));
        let adapter = CodexAdapter::with_probe(probe.clone(), CommandRunner::default());
        let (mut ctx, _rx) = context(std::env::temp_dir());
        ctx.session_id = Some("sess-1".to_string());

        let err = adapter
            .resume(&ctx, &profile())
            .await
            .expect_err("empty followup must fail");
        assert!(matches!(err, AgentError::InvalidRequest { .. }));
        assert_eq!(probe.call_count(), 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn run_streams_envelopes_and_flushes_on_exit() {
        let script = r#"cat > /dev/null
echo '{"type":"session_meta","payload":{"id":"sess-42"}}'
echo '{"id":"1","msg":{"type":"agent_reasoning","text":"Checking routes"}}'
echo '{"id":"2","msg":{"type":"exec_command_begin","call_id":"c1","command":["bash","-lc","rg login"],"cwd":"/wt"}}'
echo '{"id":"3","msg":{"type":"exec_command_end","call_id":"c1","exit_code":0,"stdout":"src/login.rs"}}'
echo 'not json at all'
echo 'warning: slow' 1>&2
echo '{"id":"4","msg":{"type":"exec_command_begin","call_id":"c2","command":"cargo test"}}'
echo '{"id":"5","msg":{"type":"agent_reasoning","text":"Almost done"}}'
"#;
        let adapter = CodexAdapter::with_probe(
            Arc::new(FakeProbe::new(false)),
            CommandRunner::new(Duration::from_millis(500)),
        );
        let (ctx, mut rx) = context(std::env::temp_dir());

        let outcome = adapter
            .run(&ctx, &scripted_profile(script))
            .await
            .expect("run");

        assert_eq!(outcome.status, RunStatus::Succeeded);
        assert_eq!(outcome.exit_code, Some(0));
        assert_eq!(outcome.session_id.as_deref(), Some("sess-42"));

        let events = drain(&mut rx);
        assert!(matches!(&events[0], AgentEvent::Log { message, .. } if message == "Session id: sess-42"));
        assert!(matches!(&events[1], AgentEvent::Session { id } if id == "sess-42"));

        let conversation: Vec<&ConversationBody> = events
            .iter()
            .filter_map(|event| match event {
                AgentEvent::Conversation { item } => Some(&item.body),
                _ => None,
            })
            .collect();
        assert_eq!(conversation.len(), 4);
        assert!(matches!(conversation[0], ConversationBody::Thinking { text, .. } if text == "Checking routes"));
        assert!(matches!(conversation[1], ConversationBody::Tool { tool } if tool.status == ToolStatus::Succeeded && tool.command.as_deref() == Some("rg login")));
        assert!(matches!(conversation[2], ConversationBody::Thinking { text, .. } if text == "Almost done"));
        assert!(matches!(conversation[3], ConversationBody::Tool { tool } if tool.status == ToolStatus::Cancelled));

        assert!(events.iter().any(|event| matches!(event, AgentEvent::Log { level: LogLevel::Info, message } if message == "not json at all")));
        assert!(events.iter().any(|event| matches!(event, AgentEvent::Log { level: LogLevel::Warn, message } if message == "warning: slow")));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn resume_streams_followup_through_the_same_event_contract() {
        let script = r#"prompt=$(cat)
echo "args: $*" 1>&2
echo "stdin: $prompt"
echo '{"id":"1","msg":{"type":"agent_reasoning","text":"Re-reading the diff"}}'
echo '{"id":"2","msg":{"type":"task_complete","last_agent_message":"Addressed review"}}'
"#;
        let probe = Arc::new(FakeProbe::new(true));
        let adapter = CodexAdapter::with_probe(probe.clone(), CommandRunner::default());
        let (mut ctx, mut rx) = context(std::env::temp_dir());
        ctx.session_id = Some("sess-7".to_string());
        ctx.followup_prompt = Some("please fix the lint".to_string());

        let outcome = adapter
            .resume(&ctx, &scripted_profile(script))
            .await
            .expect("resume");

        assert_eq!(outcome.status, RunStatus::Succeeded);
        assert_eq!(probe.call_count(), 0);
        let events = drain(&mut rx);
        assert!(events.iter().any(|event| matches!(
            event,
            AgentEvent::Log { level: LogLevel::Warn, message } if message.ends_with("resume sess-7 -")
        )));
        assert!(events.iter().any(|event| matches!(
            event,
            AgentEvent::Log { level: LogLevel::Info, message } if message == "stdin: please fix the lint"
        )));

        let conversation: Vec<&ConversationBody> = events
            .iter()
            .filter_map(|event| match event {
                AgentEvent::Conversation { item } => Some(&item.body),
                _ => None,
            })
            .collect();
        assert_eq!(conversation.len(), 2);
        assert!(matches!(conversation[0], ConversationBody::Thinking { text, .. } if text == "Re-reading the diff"));
        assert!(matches!(
            conversation[1],
            ConversationBody::Message { role: MessageRole::Assistant, text, .. } if text == "Addressed review"
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failed_exit_is_reported_as_error_log() {
        let adapter = CodexAdapter::with_probe(
            Arc::new(FakeProbe::new(true)),
            CommandRunner::default(),
        );
        let (ctx, mut rx) = context(std::env::temp_dir());
        let script = r#"cat > /dev/null; echo '{"msg":{"type":"agent_message","message":"partial"}}'; exit 4"#;

        let outcome = adapter
            .run(&ctx, &scripted_profile(script))
            .await
            .expect("run");

        assert_eq!(outcome.status, RunStatus::Failed);
        assert_eq!(outcome.exit_code, Some(4));
        let events = drain(&mut rx);
        assert!(matches!(
            &events[0],
            AgentEvent::Conversation { item } if matches!(&item.body, ConversationBody::Message { role: MessageRole::Assistant, .. })
        ));
        assert!(matches!(events.last(), Some(AgentEvent::Log { level: LogLevel::Error, message }) if message == "Codex exited with code 4"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn cancelled_run_reports_cancelled_and_flushes() {
        let adapter = CodexAdapter::with_probe(
            Arc::new(FakeProbe::new(true)),
            CommandRunner::new(Duration::from_millis(500)),
        );
        let (ctx, mut rx) = context(std::env::temp_dir());
        let script = r#"cat > /dev/null
echo '{"msg":{"type":"agent_reasoning","text":"long task"}}'
exec sleep 30"#;
        let cancel = ctx.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            cancel.cancel();
        });

        let outcome = adapter
            .run(&ctx, &scripted_profile(script))
            .await
            .expect("run");

        assert_eq!(outcome.status, RunStatus::Cancelled);
        let events = drain(&mut rx);
        assert!(events.iter().any(|event| matches!(
            event,
            AgentEvent::Conversation { item } if matches!(&item.body, ConversationBody::Thinking { text, .. } if text == "long task")
        )));
        assert!(matches!(events.last(), Some(AgentEvent::Log { level: LogLevel::Warn, message }) if message == "Run cancelled"));
    }

    #[tokio::test]
    async fn spawn_failure_emits_error_item() {
        let adapter = CodexAdapter::with_probe(
            Arc::new(FakeProbe::new(true)),
            CommandRunner::default(),
        );
        let (ctx, mut rx) = context(std::env::temp_dir());
        let mut profile = profile();
        profile.base_command = Some(vec!["kanban-definitely-missing-binary".to_string()]);

        let err = adapter.run(&ctx, &profile).await.expect_err("spawn fails");
        assert!(matches!(err, AgentError::Spawn { .. }));
        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        assert!(matches!(
            &events[0],
            AgentEvent::Conversation { item } if matches!(&item.body, ConversationBody::Error { text, .. } if text.starts_with("Failed to run Codex"))
        ));
    }

    #[test]
    fn default_adapter_supports_codex() {
        let adapter =
            default_adapter_for(AgentKind::Codex, CommandRunner::default()).expect("adapter");
        assert_eq!(adapter.kind(), AgentKind::Codex);
    }
}
