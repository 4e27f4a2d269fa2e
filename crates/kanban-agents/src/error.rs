use kanban_core::AgentKind;

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("no adapter available for agent {agent}")]
    UnsupportedAgent { agent: AgentKind },
    #[error("invalid run request: {message}")]
    InvalidRequest { message: String },
    #[error("cannot resume attempt {attempt_id}: no session id was captured")]
    MissingSession { attempt_id: String },
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("agent process io failed while {action}: {source}")]
    Io {
        action: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error("agent runtime error: {message}")]
    Runtime { message: String },
}
