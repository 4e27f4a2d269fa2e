pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, thiserror::Error)]
pub enum InboxError {
    #[error("failed to load attempt rows: {source}")]
    Rows {
        #[source]
        source: BoxError,
    },
    #[error("failed to load logs for attempt {attempt_id}: {source}")]
    Logs {
        attempt_id: String,
        #[source]
        source: BoxError,
    },
}
