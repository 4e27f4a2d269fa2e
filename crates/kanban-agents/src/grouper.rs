//! Per-run correlation state between streamed envelopes.
//!
//! One `Grouper` lives for exactly one agent run and is owned by that run's
//! hooks, so nothing is shared across attempts.

use chrono::{DateTime, Utc};
use kanban_core::{AgentEvent, ConversationItem, ToolInvocation, ToolStatus};
use serde_json::Value;
use std::collections::HashMap;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

impl OutputStream {
    /// Unknown or missing discriminators default to stdout.
    pub fn parse(value: Option<&str>) -> Self {
        match value {
            Some(stream) if stream.eq_ignore_ascii_case("stderr") => OutputStream::Stderr,
            _ => OutputStream::Stdout,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
struct OpenExecCall {
    seq: u64,
    command: String,
    cwd: Option<String>,
    started_at: DateTime<Utc>,
    stdout: String,
    stderr: String,
}

#[derive(Debug, Clone, PartialEq)]
struct OpenToolCall {
    seq: u64,
    server: Option<String>,
    tool: String,
    arguments: Option<Value>,
    started_at: DateTime<Utc>,
}

/// Completion data reported by an `exec_command_end`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecEnd {
    pub exit_code: Option<i64>,
    pub success: Option<bool>,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    pub duration_ms: Option<u64>,
}

/// Completion data reported for an MCP or function call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToolEnd {
    pub failed: bool,
    pub output: Option<String>,
    pub result: Option<Value>,
    pub duration_ms: Option<u64>,
}

#[derive(Debug, Default)]
pub struct Grouper {
    reasoning: String,
    reasoning_title: Option<String>,
    open_exec: HashMap<String, OpenExecCall>,
    open_tools: HashMap<String, OpenToolCall>,
    seq: u64,
    last_generated_exec: Option<String>,
    last_generated_tool: Option<String>,
    ignored_envelopes: u64,
}

impl Grouper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_reasoning(&mut self, text: &str) {
        self.reasoning.push_str(text);
    }

    pub fn has_pending_reasoning(&self) -> bool {
        !self.reasoning.trim().is_empty()
    }

    /// Flushes pending reasoning and seeds a new block headed by `title`.
    pub fn start_section(&mut self, title: &str, out: &mut Vec<AgentEvent>) {
        self.flush(out);
        let title = title.trim();
        if title.is_empty() {
            return;
        }
        self.reasoning_title = Some(title.to_string());
        self.reasoning = format!("### {title}\n\n");
    }

    /// Emits buffered reasoning as one `thinking` item. No-op when the buffer
    /// holds only whitespace.
    pub fn flush(&mut self, out: &mut Vec<AgentEvent>) {
        let text = std::mem::take(&mut self.reasoning);
        let title = self.reasoning_title.take();
        if let Some(title) = &title {
            let seed = format!("### {title}");
            if text.trim_end() == seed {
                return;
            }
        }
        if text.trim().is_empty() {
            return;
        }
        out.push(AgentEvent::conversation(ConversationItem::thinking(
            title, text,
        )));
    }

    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    /// Records an exec call and returns its correlation key. A call still
    /// open under the same key is closed into `out` as cancelled.
    pub fn begin_exec(
        &mut self,
        call_id: Option<&str>,
        command: String,
        cwd: Option<String>,
        out: &mut Vec<AgentEvent>,
    ) -> String {
        let seq = self.next_seq();
        let key = match call_id.filter(|id| !id.is_empty()) {
            Some(id) => id.to_string(),
            None => {
                let key = format!("exec-{seq}");
                self.last_generated_exec = Some(key.clone());
                key
            }
        };
        let replaced = self.open_exec.insert(
            key.clone(),
            OpenExecCall {
                seq,
                command,
                cwd,
                started_at: Utc::now(),
                stdout: String::new(),
                stderr: String::new(),
            },
        );
        if let Some(previous) = replaced {
            debug!(call_id = %key, "exec call reopened before it ended");
            let tool = cancelled_exec(&key, previous, Utc::now());
            out.push(AgentEvent::conversation(ConversationItem::tool(tool)));
        }
        key
    }

    fn resolve_exec_key(&self, call_id: Option<&str>) -> Option<String> {
        let key = match call_id.filter(|id| !id.is_empty()) {
            Some(id) => Some(id.to_string()),
            None => self.last_generated_exec.clone(),
        };
        key.filter(|key| self.open_exec.contains_key(key))
    }

    /// Appends streamed output. Returns false when no open call matched.
    pub fn exec_output(&mut self, call_id: Option<&str>, stream: OutputStream, chunk: &str) -> bool {
        let Some(key) = self.resolve_exec_key(call_id) else {
            return false;
        };
        let Some(call) = self.open_exec.get_mut(&key) else {
            return false;
        };
        match stream {
            OutputStream::Stdout => call.stdout.push_str(chunk),
            OutputStream::Stderr => call.stderr.push_str(chunk),
        }
        true
    }

    /// Closes an exec call and returns the combined tool invocation. Unknown
    /// keys yield `None`.
    pub fn end_exec(&mut self, call_id: Option<&str>, end: ExecEnd) -> Option<ToolInvocation> {
        let key = self.resolve_exec_key(call_id)?;
        let call = self.open_exec.remove(&key)?;
        if self.last_generated_exec.as_deref() == Some(key.as_str()) {
            self.last_generated_exec = None;
        }

        let completed_at = Utc::now();
        let succeeded = match (end.success, end.exit_code) {
            (Some(success), _) => success,
            (None, Some(code)) => code == 0,
            (None, None) => true,
        };
        let stdout = if call.stdout.is_empty() {
            end.stdout.filter(|s| !s.is_empty())
        } else {
            Some(call.stdout)
        };
        let stderr = if call.stderr.is_empty() {
            end.stderr.filter(|s| !s.is_empty())
        } else {
            Some(call.stderr)
        };

        let mut tool = ToolInvocation::new(
            "exec",
            if succeeded {
                ToolStatus::Succeeded
            } else {
                ToolStatus::Failed
            },
        );
        tool.action = Some("command".to_string());
        tool.command = Some(call.command);
        tool.cwd = call.cwd;
        tool.started_at = Some(call.started_at);
        tool.completed_at = Some(completed_at);
        tool.duration_ms = end.duration_ms.or_else(|| elapsed_ms(call.started_at, completed_at));
        tool.exit_code = end.exit_code;
        tool.stdout = stdout;
        tool.stderr = stderr;
        tool.metadata = Some(serde_json::json!({ "call_id": key }));
        Some(tool)
    }

    /// Same reopening rule as [`Grouper::begin_exec`].
    pub fn begin_tool(
        &mut self,
        call_id: Option<&str>,
        server: Option<String>,
        tool: String,
        arguments: Option<Value>,
        out: &mut Vec<AgentEvent>,
    ) -> String {
        let seq = self.next_seq();
        let key = match call_id.filter(|id| !id.is_empty()) {
            Some(id) => id.to_string(),
            None => {
                let key = format!("tool-{seq}");
                self.last_generated_tool = Some(key.clone());
                key
            }
        };
        let replaced = self.open_tools.insert(
            key.clone(),
            OpenToolCall {
                seq,
                server,
                tool,
                arguments,
                started_at: Utc::now(),
            },
        );
        if let Some(previous) = replaced {
            debug!(call_id = %key, "tool call reopened before it ended");
            let tool = cancelled_tool(&key, &previous, Utc::now());
            out.push(AgentEvent::conversation(ConversationItem::tool(tool)));
        }
        key
    }

    pub fn end_tool(&mut self, call_id: Option<&str>, end: ToolEnd) -> Option<ToolInvocation> {
        let key = match call_id.filter(|id| !id.is_empty()) {
            Some(id) => id.to_string(),
            None => self.last_generated_tool.clone()?,
        };
        let call = self.open_tools.remove(&key)?;
        if self.last_generated_tool.as_deref() == Some(key.as_str()) {
            self.last_generated_tool = None;
        }

        let completed_at = Utc::now();
        let mut tool = ToolInvocation::new(
            call.tool.clone(),
            if end.failed {
                ToolStatus::Failed
            } else {
                ToolStatus::Succeeded
            },
        );
        tool.action = Some(match &call.server {
            Some(_) => "mcp".to_string(),
            None => "function".to_string(),
        });
        tool.started_at = Some(call.started_at);
        tool.completed_at = Some(completed_at);
        tool.duration_ms = end.duration_ms.or_else(|| elapsed_ms(call.started_at, completed_at));
        tool.stdout = end.output;
        tool.metadata = Some(tool_metadata(&key, &call, end.result));
        Some(tool)
    }

    pub fn note_ignored(&mut self) {
        self.ignored_envelopes += 1;
    }

    pub fn ignored_envelopes(&self) -> u64 {
        self.ignored_envelopes
    }

    pub fn open_call_count(&self) -> usize {
        self.open_exec.len() + self.open_tools.len()
    }

    /// Flushes reasoning and closes every still-open call as `cancelled`, in
    /// the order the calls began. Safe to call repeatedly.
    pub fn finish(&mut self, out: &mut Vec<AgentEvent>) {
        self.flush(out);

        let completed_at = Utc::now();
        let mut dangling: Vec<(u64, ToolInvocation)> = Vec::new();
        for (key, call) in self.open_exec.drain() {
            let seq = call.seq;
            dangling.push((seq, cancelled_exec(&key, call, completed_at)));
        }
        for (key, call) in self.open_tools.drain() {
            dangling.push((call.seq, cancelled_tool(&key, &call, completed_at)));
        }
        self.last_generated_exec = None;
        self.last_generated_tool = None;

        dangling.sort_by_key(|(seq, _)| *seq);
        out.extend(
            dangling
                .into_iter()
                .map(|(_, tool)| AgentEvent::conversation(ConversationItem::tool(tool))),
        );
    }
}

fn cancelled_exec(key: &str, call: OpenExecCall, completed_at: DateTime<Utc>) -> ToolInvocation {
    let mut tool = ToolInvocation::new("exec", ToolStatus::Cancelled);
    tool.action = Some("command".to_string());
    tool.command = Some(call.command);
    tool.cwd = call.cwd;
    tool.started_at = Some(call.started_at);
    tool.completed_at = Some(completed_at);
    tool.duration_ms = elapsed_ms(call.started_at, completed_at);
    tool.stdout = Some(call.stdout).filter(|s| !s.is_empty());
    tool.stderr = Some(call.stderr).filter(|s| !s.is_empty());
    tool.metadata = Some(serde_json::json!({ "call_id": key }));
    tool
}

fn cancelled_tool(key: &str, call: &OpenToolCall, completed_at: DateTime<Utc>) -> ToolInvocation {
    let mut tool = ToolInvocation::new(call.tool.clone(), ToolStatus::Cancelled);
    tool.started_at = Some(call.started_at);
    tool.completed_at = Some(completed_at);
    tool.duration_ms = elapsed_ms(call.started_at, completed_at);
    tool.metadata = Some(tool_metadata(key, call, None));
    tool
}

fn tool_metadata(key: &str, call: &OpenToolCall, result: Option<Value>) -> Value {
    let mut metadata = serde_json::Map::new();
    metadata.insert("call_id".to_string(), Value::String(key.to_string()));
    if let Some(server) = &call.server {
        metadata.insert("server".to_string(), Value::String(server.clone()));
    }
    if let Some(arguments) = &call.arguments {
        metadata.insert("arguments".to_string(), arguments.clone());
    }
    if let Some(result) = result {
        metadata.insert("result".to_string(), result);
    }
    Value::Object(metadata)
}

fn elapsed_ms(start: DateTime<Utc>, end: DateTime<Utc>) -> Option<u64> {
    u64::try_from((end - start).num_milliseconds()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use kanban_core::ConversationBody;

    fn thinking_texts(events: &[AgentEvent]) -> Vec<(Option<String>, String)> {
        events
            .iter()
            .filter_map(|event| match event {
                AgentEvent::Conversation { item } => match &item.body {
                    ConversationBody::Thinking { title, text, .. } => {
                        Some((title.clone(), text.clone()))
                    }
                    _ => None,
                },
                _ => None,
            })
            .collect()
    }

    fn tools(events: &[AgentEvent]) -> Vec<ToolInvocation> {
        events
            .iter()
            .filter_map(|event| match event {
                AgentEvent::Conversation { item } => match &item.body {
                    ConversationBody::Tool { tool } => Some(tool.clone()),
                    _ => None,
                },
                _ => None,
            })
            .collect()
    }

    #[test]
    fn flush_twice_emits_once() {
        let mut grouper = Grouper::new();
        let mut out = Vec::new();
        grouper.push_reasoning("thinking ");
        grouper.push_reasoning("hard");
        grouper.flush(&mut out);
        grouper.flush(&mut out);

        assert_eq!(thinking_texts(&out), vec![(None, "thinking hard".to_string())]);
    }

    #[test]
    fn whitespace_only_buffer_is_not_emitted() {
        let mut grouper = Grouper::new();
        let mut out = Vec::new();
        grouper.push_reasoning("  \n ");
        grouper.flush(&mut out);
        assert!(out.is_empty());
        assert!(!grouper.has_pending_reasoning());
    }

    #[test]
    fn section_title_seeds_heading_and_title() {
        let mut grouper = Grouper::new();
        let mut out = Vec::new();
        grouper.push_reasoning("first");
        grouper.start_section("Plan", &mut out);
        grouper.push_reasoning("step one");
        grouper.flush(&mut out);

        assert_eq!(
            thinking_texts(&out),
            vec![
                (None, "first".to_string()),
                (Some("Plan".to_string()), "### Plan\n\nstep one".to_string()),
            ]
        );
    }

    #[test]
    fn heading_without_body_is_not_emitted() {
        let mut grouper = Grouper::new();
        let mut out = Vec::new();
        grouper.start_section("Empty", &mut out);
        grouper.flush(&mut out);
        assert!(out.is_empty());
    }

    #[test]
    fn heading_with_trailing_whitespace_is_not_emitted() {
        let mut grouper = Grouper::new();
        let mut out = Vec::new();
        grouper.start_section("Plan", &mut out);
        grouper.push_reasoning("  \n\t");
        grouper.flush(&mut out);
        assert!(out.is_empty());
    }

    #[test]
    fn reopened_call_id_cancels_the_earlier_call() {
        let mut grouper = Grouper::new();
        let mut out = Vec::new();
        grouper.begin_exec(Some("c1"), "first".to_string(), None, &mut out);
        grouper.exec_output(Some("c1"), OutputStream::Stdout, "early");
        grouper.begin_exec(Some("c1"), "second".to_string(), None, &mut out);

        let replaced = tools(&out);
        assert_eq!(replaced.len(), 1);
        assert_eq!(replaced[0].status, ToolStatus::Cancelled);
        assert_eq!(replaced[0].command.as_deref(), Some("first"));
        assert_eq!(replaced[0].stdout.as_deref(), Some("early"));

        grouper.begin_tool(Some("t1"), None, "read".to_string(), None, &mut out);
        grouper.begin_tool(Some("t1"), None, "write".to_string(), None, &mut out);
        let replaced = tools(&out);
        assert_eq!(replaced.len(), 2);
        assert_eq!(replaced[1].name, "read");
        assert_eq!(replaced[1].status, ToolStatus::Cancelled);

        let tool = grouper.end_exec(Some("c1"), ExecEnd::default()).expect("second call");
        assert_eq!(tool.command.as_deref(), Some("second"));
        assert_eq!(tool.stdout, None);
        assert_eq!(grouper.open_call_count(), 1);
    }

    #[test]
    fn exec_output_accumulates_per_stream() {
        let mut grouper = Grouper::new();
        let mut out: Vec<AgentEvent> = Vec::new();
        grouper.begin_exec(Some("c1"), "ls".to_string(), Some("/w".to_string()), &mut out);
        assert!(grouper.exec_output(Some("c1"), OutputStream::Stdout, "a"));
        assert!(grouper.exec_output(Some("c1"), OutputStream::Stderr, "warn"));
        assert!(grouper.exec_output(Some("c1"), OutputStream::Stdout, "b"));

        let tool = grouper
            .end_exec(
                Some("c1"),
                ExecEnd {
                    exit_code: Some(2),
                    stdout: Some("ignored".to_string()),
                    ..ExecEnd::default()
                },
            )
            .expect("tool");
        assert_eq!(tool.status, ToolStatus::Failed);
        assert_eq!(tool.stdout.as_deref(), Some("ab"));
        assert_eq!(tool.stderr.as_deref(), Some("warn"));
        assert_eq!(tool.cwd.as_deref(), Some("/w"));
        assert_eq!(grouper.open_call_count(), 0);
    }

    #[test]
    fn success_flag_overrides_exit_code() {
        let mut grouper = Grouper::new();
        let mut out: Vec<AgentEvent> = Vec::new();
        grouper.begin_exec(Some("c1"), "grep".to_string(), None, &mut out);
        let tool = grouper
            .end_exec(
                Some("c1"),
                ExecEnd {
                    exit_code: Some(1),
                    success: Some(true),
                    ..ExecEnd::default()
                },
            )
            .expect("tool");
        assert_eq!(tool.status, ToolStatus::Succeeded);
    }

    #[test]
    fn generated_keys_are_unique_and_resolve_latest() {
        let mut grouper = Grouper::new();
        let mut out: Vec<AgentEvent> = Vec::new();
        let first = grouper.begin_exec(None, "one".to_string(), None, &mut out);
        let second = grouper.begin_exec(None, "two".to_string(), None, &mut out);
        assert_ne!(first, second);

        assert!(grouper.exec_output(None, OutputStream::Stdout, "out"));
        let tool = grouper.end_exec(None, ExecEnd::default()).expect("tool");
        assert_eq!(tool.command.as_deref(), Some("two"));
        assert_eq!(tool.stdout.as_deref(), Some("out"));

        assert!(grouper.end_exec(None, ExecEnd::default()).is_none());
        assert_eq!(grouper.open_call_count(), 1);
    }

    #[test]
    fn unmatched_end_is_inert() {
        let mut grouper = Grouper::new();
        assert!(grouper.end_exec(Some("nope"), ExecEnd::default()).is_none());
        assert!(grouper.end_tool(Some("nope"), ToolEnd::default()).is_none());
        assert!(!grouper.exec_output(Some("nope"), OutputStream::Stdout, "x"));
    }

    #[test]
    fn exec_and_tool_keys_are_independent() {
        let mut grouper = Grouper::new();
        let mut out: Vec<AgentEvent> = Vec::new();
        grouper.begin_exec(Some("same"), "ls".to_string(), None, &mut out);
        grouper.begin_tool(
            Some("same"),
            Some("fs".to_string()),
            "read".to_string(),
            None,
            &mut out,
        );

        let tool = grouper
            .end_tool(Some("same"), ToolEnd::default())
            .expect("tool call");
        assert_eq!(tool.name, "read");
        assert_eq!(tool.action.as_deref(), Some("mcp"));
        assert_eq!(tool.metadata.as_ref().and_then(|m| m.get("server")), Some(&Value::from("fs")));
        assert_eq!(grouper.open_call_count(), 1);
    }

    #[test]
    fn finish_flushes_then_cancels_dangling_calls_in_order() {
        let mut grouper = Grouper::new();
        let mut out = Vec::new();
        grouper.begin_exec(Some("e1"), "sleep 10".to_string(), None, &mut out);
        grouper.exec_output(Some("e1"), OutputStream::Stdout, "partial");
        grouper.begin_tool(Some("t1"), None, "apply_patch".to_string(), None, &mut out);
        grouper.push_reasoning("unfinished thought");

        grouper.finish(&mut out);
        grouper.finish(&mut out);

        assert_eq!(out.len(), 3);
        assert_eq!(thinking_texts(&out[..1]).len(), 1);
        let dangling = tools(&out);
        assert_eq!(dangling.len(), 2);
        assert!(dangling.iter().all(|t| t.status == ToolStatus::Cancelled));
        assert_eq!(dangling[0].command.as_deref(), Some("sleep 10"));
        assert_eq!(dangling[0].stdout.as_deref(), Some("partial"));
        assert_eq!(dangling[1].name, "apply_patch");
        assert_eq!(grouper.open_call_count(), 0);
    }
}
