//! Maps Codex JSONL envelopes onto [`AgentEvent`]s.
//!
//! The wire format is versioned by the agent CLI, not by us. Every lookup is
//! optional and unknown shapes fall through to [`Dispatch::Ignored`]; nothing
//! here performs I/O or panics on unexpected input.

use kanban_core::{AgentEvent, ConversationItem, LogLevel, MessageRole};
use serde_json::Value;

use crate::grouper::{ExecEnd, Grouper, OutputStream, ToolEnd};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    Handled,
    Ignored,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TopLevelKind {
    SessionMeta,
    ResponseItem,
    EventMsg,
    ThreadStarted,
    /// Recognized envelopes that carry nothing for the transcript.
    Passive,
}

impl TopLevelKind {
    fn parse(value: &str) -> Option<Self> {
        match value {
            "session_meta" => Some(TopLevelKind::SessionMeta),
            "response_item" => Some(TopLevelKind::ResponseItem),
            "event_msg" => Some(TopLevelKind::EventMsg),
            "thread.started" => Some(TopLevelKind::ThreadStarted),
            "turn_context" | "compacted" | "turn.started" => Some(TopLevelKind::Passive),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MsgKind {
    AgentMessage,
    UserMessage,
    SessionMeta,
    SessionConfigured,
    AgentReasoning,
    AgentReasoningRawContent,
    AgentReasoningRawContentDelta,
    AgentReasoningSectionBreak,
    AgentReasoningSectionTitle,
    AgentReasoningSummary,
    ExecCommandBegin,
    ExecCommandOutputDelta,
    ExecCommandEnd,
    McpToolCallBegin,
    McpToolCallEnd,
    Error,
    StreamError,
    TaskStarted,
    TaskComplete,
    TokenCount,
    TurnAborted,
    Other,
}

impl MsgKind {
    fn parse(value: &str) -> Self {
        match value {
            "agent_message" => MsgKind::AgentMessage,
            "user_message" => MsgKind::UserMessage,
            "session_meta" => MsgKind::SessionMeta,
            "session_configured" => MsgKind::SessionConfigured,
            "agent_reasoning" => MsgKind::AgentReasoning,
            "agent_reasoning_raw_content" => MsgKind::AgentReasoningRawContent,
            "agent_reasoning_raw_content_delta" => MsgKind::AgentReasoningRawContentDelta,
            "agent_reasoning_section_break" => MsgKind::AgentReasoningSectionBreak,
            "agent_reasoning_section_title" => MsgKind::AgentReasoningSectionTitle,
            "agent_reasoning_summary" => MsgKind::AgentReasoningSummary,
            "exec_command_begin" => MsgKind::ExecCommandBegin,
            "exec_command_output_delta" => MsgKind::ExecCommandOutputDelta,
            "exec_command_end" => MsgKind::ExecCommandEnd,
            "mcp_tool_call_begin" => MsgKind::McpToolCallBegin,
            "mcp_tool_call_end" => MsgKind::McpToolCallEnd,
            "error" => MsgKind::Error,
            "stream_error" => MsgKind::StreamError,
            "task_started" => MsgKind::TaskStarted,
            "task_complete" => MsgKind::TaskComplete,
            "token_count" => MsgKind::TokenCount,
            "turn_aborted" => MsgKind::TurnAborted,
            _ => MsgKind::Other,
        }
    }
}

/// Translates one decoded stdout object, appending any resulting events to
/// `out` in emission order.
pub fn handle_envelope(
    envelope: &Value,
    grouper: &mut Grouper,
    out: &mut Vec<AgentEvent>,
) -> Dispatch {
    let dispatch = dispatch_envelope(envelope, grouper, out);
    if dispatch == Dispatch::Ignored {
        grouper.note_ignored();
    }
    dispatch
}

fn dispatch_envelope(envelope: &Value, grouper: &mut Grouper, out: &mut Vec<AgentEvent>) -> Dispatch {
    if let Some(kind) = str_field(envelope, "type").and_then(TopLevelKind::parse) {
        let payload = envelope.get("payload").unwrap_or(envelope);
        return match kind {
            TopLevelKind::SessionMeta => match session_id_of(payload) {
                Some(id) => {
                    emit_session(id, out);
                    Dispatch::Handled
                }
                None => Dispatch::Ignored,
            },
            TopLevelKind::ThreadStarted => match str_field(envelope, "thread_id") {
                Some(id) if !id.is_empty() => {
                    emit_session(id, out);
                    Dispatch::Handled
                }
                _ => Dispatch::Ignored,
            },
            TopLevelKind::ResponseItem => handle_response_item(payload, grouper, out),
            TopLevelKind::EventMsg => handle_msg(payload, grouper, out),
            TopLevelKind::Passive => Dispatch::Handled,
        };
    }

    if let Some(msg) = envelope.get("msg").filter(|msg| msg.is_object()) {
        if str_field(msg, "type").is_some() {
            return handle_msg(msg, grouper, out);
        }
    }

    if let Some(prompt) = str_field(envelope, "prompt") {
        emit_message(MessageRole::User, prompt, grouper, out);
        return Dispatch::Handled;
    }

    Dispatch::Ignored
}

fn handle_msg(msg: &Value, grouper: &mut Grouper, out: &mut Vec<AgentEvent>) -> Dispatch {
    let kind = str_field(msg, "type").map_or(MsgKind::Other, MsgKind::parse);
    match kind {
        MsgKind::AgentMessage => {
            let text = str_field(msg, "message").unwrap_or_default();
            emit_message(MessageRole::Assistant, text, grouper, out);
        }
        MsgKind::UserMessage => {
            let text = str_field(msg, "message").unwrap_or_default();
            emit_message(MessageRole::User, text, grouper, out);
        }
        MsgKind::SessionMeta | MsgKind::SessionConfigured => match session_id_of(msg) {
            Some(id) => emit_session(id, out),
            None => return Dispatch::Ignored,
        },
        MsgKind::AgentReasoning | MsgKind::AgentReasoningRawContent => {
            if let Some(text) = str_field(msg, "text") {
                grouper.push_reasoning(text);
            }
        }
        MsgKind::AgentReasoningRawContentDelta => {
            if let Some(delta) = str_field(msg, "delta") {
                grouper.push_reasoning(delta);
            }
        }
        MsgKind::AgentReasoningSectionBreak => grouper.flush(out),
        MsgKind::AgentReasoningSectionTitle => {
            let title = str_field(msg, "title")
                .or_else(|| str_field(msg, "text"))
                .unwrap_or_default();
            grouper.start_section(title, out);
        }
        MsgKind::AgentReasoningSummary => {
            let text = str_field(msg, "text")
                .or_else(|| str_field(msg, "summary"))
                .unwrap_or_default();
            emit_message(MessageRole::Assistant, text, grouper, out);
        }
        MsgKind::ExecCommandBegin => {
            grouper.flush(out);
            let command = msg.get("command").map(render_command).unwrap_or_default();
            let cwd = str_field(msg, "cwd").map(str::to_string);
            grouper.begin_exec(str_field(msg, "call_id"), command, cwd, out);
        }
        MsgKind::ExecCommandOutputDelta => {
            if let Some(chunk) = msg.get("chunk").and_then(chunk_text) {
                let stream = OutputStream::parse(str_field(msg, "stream"));
                grouper.exec_output(str_field(msg, "call_id"), stream, &chunk);
            }
        }
        MsgKind::ExecCommandEnd => {
            let end = ExecEnd {
                exit_code: msg.get("exit_code").and_then(Value::as_i64),
                success: msg.get("success").and_then(Value::as_bool),
                stdout: str_field(msg, "stdout").map(str::to_string),
                stderr: str_field(msg, "stderr").map(str::to_string),
                duration_ms: duration_ms(msg),
            };
            if let Some(tool) = grouper.end_exec(str_field(msg, "call_id"), end) {
                grouper.flush(out);
                out.push(AgentEvent::conversation(ConversationItem::tool(tool)));
            }
        }
        MsgKind::McpToolCallBegin => {
            grouper.flush(out);
            let invocation = msg.get("invocation").unwrap_or(msg);
            let tool = str_field(invocation, "tool").unwrap_or("tool").to_string();
            let server = str_field(invocation, "server").map(str::to_string);
            let arguments = invocation.get("arguments").cloned();
            grouper.begin_tool(str_field(msg, "call_id"), server, tool, arguments, out);
        }
        MsgKind::McpToolCallEnd => {
            let end = mcp_tool_end(msg);
            if let Some(tool) = grouper.end_tool(str_field(msg, "call_id"), end) {
                grouper.flush(out);
                out.push(AgentEvent::conversation(ConversationItem::tool(tool)));
            }
        }
        MsgKind::Error => {
            grouper.flush(out);
            let text = str_field(msg, "message").unwrap_or("agent reported an error");
            out.push(AgentEvent::conversation(ConversationItem::error(
                text,
                msg.get("details").cloned(),
            )));
        }
        MsgKind::StreamError => {
            let text = str_field(msg, "message").unwrap_or("stream interrupted");
            out.push(AgentEvent::log(LogLevel::Warn, format!("Stream error: {text}")));
        }
        MsgKind::TurnAborted => {
            let reason = str_field(msg, "reason").unwrap_or("unknown");
            out.push(AgentEvent::log(LogLevel::Warn, format!("Turn aborted: {reason}")));
        }
        MsgKind::TaskStarted => {
            let message = match msg.get("model_context_window").and_then(Value::as_u64) {
                Some(window) => format!("Task started (context window {window} tokens)"),
                None => "Task started".to_string(),
            };
            out.push(AgentEvent::log(LogLevel::Info, message));
        }
        MsgKind::TaskComplete => {
            grouper.flush(out);
            if let Some(text) = str_field(msg, "last_agent_message") {
                emit_message(MessageRole::Assistant, text, grouper, out);
            }
        }
        MsgKind::TokenCount => {
            out.push(AgentEvent::log(LogLevel::Info, token_usage_line(msg)));
        }
        MsgKind::Other => return Dispatch::Ignored,
    }
    Dispatch::Handled
}

fn handle_response_item(item: &Value, grouper: &mut Grouper, out: &mut Vec<AgentEvent>) -> Dispatch {
    match str_field(item, "type") {
        Some("message") => {
            let role = match str_field(item, "role") {
                Some("assistant") => MessageRole::Assistant,
                Some("system") | Some("developer") => MessageRole::System,
                _ => MessageRole::User,
            };
            let text = item.get("content").map(content_text).unwrap_or_default();
            emit_message(role, &text, grouper, out);
            Dispatch::Handled
        }
        Some("reasoning") => {
            let parts: Vec<&str> = item
                .get("summary")
                .and_then(Value::as_array)
                .map(|parts| parts.iter().filter_map(|part| str_field(part, "text")).collect())
                .unwrap_or_default();
            for part in parts {
                if grouper.has_pending_reasoning() {
                    grouper.push_reasoning("\n\n");
                }
                grouper.push_reasoning(part);
            }
            Dispatch::Handled
        }
        Some("function_call") => {
            grouper.flush(out);
            let name = str_field(item, "name").unwrap_or("function").to_string();
            let arguments = item.get("arguments").map(|raw| match raw.as_str() {
                Some(text) => serde_json::from_str(text).unwrap_or_else(|_| raw.clone()),
                None => raw.clone(),
            });
            grouper.begin_tool(str_field(item, "call_id"), None, name, arguments, out);
            Dispatch::Handled
        }
        Some("function_call_output") => {
            let output = item.get("output");
            let end = ToolEnd {
                failed: output
                    .and_then(|o| o.get("success"))
                    .and_then(Value::as_bool)
                    .is_some_and(|success| !success),
                output: output.and_then(|o| match o {
                    Value::String(text) => Some(text.clone()),
                    other => str_field(other, "content").map(str::to_string),
                }),
                result: None,
                duration_ms: None,
            };
            if let Some(tool) = grouper.end_tool(str_field(item, "call_id"), end) {
                grouper.flush(out);
                out.push(AgentEvent::conversation(ConversationItem::tool(tool)));
            }
            Dispatch::Handled
        }
        _ => Dispatch::Ignored,
    }
}

fn emit_session(id: &str, out: &mut Vec<AgentEvent>) {
    out.push(AgentEvent::log(LogLevel::Info, format!("Session id: {id}")));
    out.push(AgentEvent::Session { id: id.to_string() });
}

/// Flushes reasoning first so the thinking block precedes the message.
fn emit_message(role: MessageRole, text: &str, grouper: &mut Grouper, out: &mut Vec<AgentEvent>) {
    grouper.flush(out);
    if text.trim().is_empty() {
        return;
    }
    out.push(AgentEvent::conversation(ConversationItem::message(role, text)));
}

fn str_field<'a>(value: &'a Value, key: &str) -> Option<&'a str> {
    value.get(key).and_then(Value::as_str)
}

fn session_id_of(value: &Value) -> Option<&str> {
    str_field(value, "session_id")
        .or_else(|| str_field(value, "id"))
        .filter(|id| !id.is_empty())
}

/// Text-bearing parts joined by newlines; anything else counts as empty.
fn content_text(content: &Value) -> String {
    match content {
        Value::String(text) => text.clone(),
        Value::Array(parts) => parts
            .iter()
            .map(|part| match part {
                Value::String(text) => text.as_str(),
                other => str_field(other, "text").unwrap_or(""),
            })
            .collect::<Vec<_>>()
            .join("\n"),
        _ => String::new(),
    }
}

fn render_command(command: &Value) -> String {
    match command {
        Value::String(text) => text.clone(),
        Value::Array(parts) => {
            let parts: Vec<&str> = parts.iter().filter_map(Value::as_str).collect();
            match parts.as_slice() {
                [shell, flag, script] if is_shell(shell) && (*flag == "-lc" || *flag == "-c") => {
                    (*script).to_string()
                }
                _ => parts.join(" "),
            }
        }
        _ => String::new(),
    }
}

fn is_shell(program: &str) -> bool {
    let name = program.rsplit('/').next().unwrap_or(program);
    matches!(name, "bash" | "sh" | "zsh")
}

/// String chunks win over numbers, which win over `{ "Text": ... }` objects.
fn chunk_text(chunk: &Value) -> Option<String> {
    match chunk {
        Value::String(text) => Some(text.clone()),
        Value::Number(number) => Some(number.to_string()),
        other => str_field(other, "Text").map(str::to_string),
    }
}

fn duration_ms(msg: &Value) -> Option<u64> {
    if let Some(ms) = msg.get("duration_ms").and_then(Value::as_u64) {
        return Some(ms);
    }
    let duration = msg.get("duration")?;
    let secs = duration.get("secs").and_then(Value::as_u64)?;
    let nanos = duration.get("nanos").and_then(Value::as_u64).unwrap_or(0);
    secs.checked_mul(1_000)?.checked_add(nanos / 1_000_000)
}

fn mcp_tool_end(msg: &Value) -> ToolEnd {
    let result = msg.get("result");
    let (failed, output) = match result {
        Some(value) if value.get("Err").is_some() => {
            let err = value.get("Err").map(|err| match err.as_str() {
                Some(text) => text.to_string(),
                None => err.to_string(),
            });
            (true, err)
        }
        Some(value) => {
            let ok = value.get("Ok").unwrap_or(value);
            let is_error = ok.get("is_error").and_then(Value::as_bool).unwrap_or(false)
                || msg.get("is_error").and_then(Value::as_bool).unwrap_or(false);
            let text = ok.get("content").map(content_text).filter(|t| !t.is_empty());
            (is_error, text)
        }
        None => (
            msg.get("is_error").and_then(Value::as_bool).unwrap_or(false),
            None,
        ),
    };
    ToolEnd {
        failed,
        output,
        result: result.cloned(),
        duration_ms: duration_ms(msg),
    }
}

fn token_usage_line(msg: &Value) -> String {
    let usage = msg
        .get("info")
        .and_then(|info| info.get("total_token_usage"))
        .unwrap_or(msg);
    let field = |key: &str| usage.get(key).and_then(Value::as_u64);
    match (field("input_tokens"), field("output_tokens"), field("total_tokens")) {
        (None, None, None) => "Token usage updated".to_string(),
        (input, output, total) => format!(
            "Token usage: input={} output={} total={}",
            input.unwrap_or(0),
            output.unwrap_or(0),
            total.unwrap_or(0)
        ),
    }
}
