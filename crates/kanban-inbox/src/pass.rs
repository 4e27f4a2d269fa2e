use chrono::{DateTime, Duration, Utc};
use futures::future::join_all;
use kanban_core::{AttemptLog, InboxConfig, LogLevel};
use tracing::{debug, warn};

use crate::classify::classify_rows;
use crate::error::InboxError;
use crate::model::{Inbox, InboxItem, InboxKind};
use crate::source::{AttemptLogSource, InboxSource};

pub const GENERIC_ERROR_SUMMARY: &str = "Attempt failed. Open the attempt to see its logs.";
const SUMMARY_MAX_CHARS: usize = 280;

/// Fetches one snapshot, classifies it and enriches failed items.
///
/// Only the row query can fail the build; log lookups fall back to
/// [`GENERIC_ERROR_SUMMARY`].
pub async fn build_inbox(
    rows: &dyn InboxSource,
    logs: &dyn AttemptLogSource,
    config: &InboxConfig,
    now: DateTime<Utc>,
) -> Result<Inbox, InboxError> {
    let window_hours = i64::try_from(config.window_hours).unwrap_or(i64::MAX);
    let since = now
        .checked_sub_signed(Duration::hours(window_hours.min(24 * 365 * 100)))
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH);
    let snapshot = rows.list_inbox_rows(since, config.scan_limit).await?;
    let now_ms = now.timestamp_millis();

    let mut items = classify_rows(&snapshot, now_ms);
    items.sort_by(|left, right| right.last_updated_at.cmp(&left.last_updated_at));
    items.truncate(config.effective_limit());

    enrich_failed(&mut items, logs).await;

    debug!(
        scanned = snapshot.len(),
        items = items.len(),
        "inbox pass complete"
    );

    let mut inbox = Inbox::default();
    for item in items {
        inbox.push(item);
    }
    Ok(inbox)
}

async fn enrich_failed(items: &mut [InboxItem], logs: &dyn AttemptLogSource) {
    let mut failed: Vec<&mut InboxItem> = items
        .iter_mut()
        .filter(|item| item.kind == InboxKind::Failed)
        .collect();
    let summaries = join_all(failed.iter().map(|item| {
        let attempt_id = item.attempt_id.clone();
        async move {
            match logs.list_attempt_logs(&attempt_id).await {
                Ok(entries) => summarize_logs(&entries),
                Err(err) => {
                    warn!(attempt_id = %attempt_id, error = %err, "inbox log enrichment failed");
                    GENERIC_ERROR_SUMMARY.to_string()
                }
            }
        }
    }))
    .await;

    for (item, summary) in failed.iter_mut().zip(summaries) {
        item.error_summary = Some(summary);
    }
}

/// Latest error log, else the last log, else a generic message.
pub fn summarize_logs(logs: &[AttemptLog]) -> String {
    let chosen = logs
        .iter()
        .rev()
        .find(|log| log.level == LogLevel::Error && !log.message.trim().is_empty())
        .or_else(|| logs.iter().rev().find(|log| !log.message.trim().is_empty()));
    match chosen {
        Some(log) => truncate_chars(log.message.trim(), SUMMARY_MAX_CHARS),
        None => GENERIC_ERROR_SUMMARY.to_string(),
    }
}

fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((cut, _)) => format!("{}...", &text[..cut]),
        None => text.to_string(),
    }
}
