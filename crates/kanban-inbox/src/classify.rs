use chrono::{DateTime, TimeZone, Utc};
use kanban_core::AttemptStatus;
use std::collections::HashMap;

use crate::model::{AttemptRowForInbox, InboxItem, InboxKind};

pub const STUCK_QUEUED_THRESHOLD_SECONDS: i64 = 600;
pub const STUCK_RUNNING_THRESHOLD_SECONDS: i64 = 1800;

pub const REASON_PR_OPEN: &str = "PR is still open or pending review";
pub const REASON_NOT_DONE: &str = "card is not in a Done column";

/// Per-card scratch state carried across one classification pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CardAggregationState {
    pub has_any_success: bool,
    pub has_resolved_success: bool,
    pub has_actionable_item: bool,
    pub has_stuck_item: bool,
}

impl CardAggregationState {
    /// Folds one row into the success flags. Run over every row of the card
    /// before classification starts.
    pub fn observe(&mut self, row: &AttemptRowForInbox) {
        if row.status != AttemptStatus::Succeeded {
            return;
        }
        self.has_any_success = true;
        if !row.has_open_pr() && row.in_done_column() {
            self.has_resolved_success = true;
        }
    }
}

/// Classifies a single row, mutating `state` as rules are evaluated.
pub fn classify(
    row: &AttemptRowForInbox,
    state: &mut CardAggregationState,
    now_ms: i64,
) -> Option<InboxItem> {
    let status = row.status;
    if state.has_actionable_item
        && !matches!(status, AttemptStatus::Queued | AttemptStatus::Running)
    {
        return None;
    }

    if status == AttemptStatus::Succeeded {
        let pr_open = row.has_open_pr();
        let not_done = !row.in_done_column();
        if (pr_open || not_done) && !state.has_resolved_success {
            state.has_actionable_item = true;
            let mut reasons = Vec::new();
            if pr_open {
                reasons.push(REASON_PR_OPEN);
            }
            if not_done {
                reasons.push(REASON_NOT_DONE);
            }
            let mut item = base_item(row, InboxKind::Review, now_ms);
            item.reason = Some(reasons.join("; "));
            return Some(item);
        }
        return None;
    }

    if matches!(status, AttemptStatus::Failed | AttemptStatus::Stopped) {
        if !state.has_any_success && !row.in_done_column() {
            state.has_actionable_item = true;
            return Some(base_item(row, InboxKind::Failed, now_ms));
        }
        return None;
    }

    let threshold = match status {
        AttemptStatus::Queued => STUCK_QUEUED_THRESHOLD_SECONDS,
        AttemptStatus::Running | AttemptStatus::Stopping => STUCK_RUNNING_THRESHOLD_SECONDS,
        _ => return None,
    };
    let elapsed = (now_ms - row.started_ms(now_ms)).max(0) / 1000;
    if elapsed < threshold || state.has_stuck_item {
        return None;
    }
    state.has_stuck_item = true;
    let mut item = base_item(row, InboxKind::Stuck, now_ms);
    item.stuck_for_seconds = Some(elapsed);
    Some(item)
}

/// Runs one pass over a snapshot of rows.
///
/// Rows are visited newest first. Rows without a card each get their own
/// state. Returned candidates are in visit order.
pub fn classify_rows(rows: &[AttemptRowForInbox], now_ms: i64) -> Vec<InboxItem> {
    let mut order: Vec<&AttemptRowForInbox> = rows.iter().collect();
    order.sort_by_key(|row| std::cmp::Reverse(row.last_activity_ms(now_ms)));

    let mut states: HashMap<&str, CardAggregationState> = HashMap::new();
    for row in &order {
        if let Some(card_id) = &row.card_id {
            states.entry(card_id.0.as_str()).or_default().observe(row);
        }
    }

    let mut items = Vec::new();
    for row in order {
        let candidate = match &row.card_id {
            Some(card_id) => {
                let state = states.entry(card_id.0.as_str()).or_default();
                classify(row, state, now_ms)
            }
            None => {
                let mut state = CardAggregationState::default();
                state.observe(row);
                classify(row, &mut state, now_ms)
            }
        };
        items.extend(candidate);
    }
    items
}

fn base_item(row: &AttemptRowForInbox, kind: InboxKind, now_ms: i64) -> InboxItem {
    InboxItem {
        kind,
        attempt_id: row.attempt_id.clone(),
        project_id: row.project_id.clone(),
        card_id: row.card_id.clone(),
        card_title: row.card_title.clone(),
        ticket_key: row.ticket_key.clone(),
        agent_id: row.agent_id.clone(),
        status: row.status,
        created_at: from_ms(row.started_ms(now_ms)),
        last_updated_at: from_ms(row.last_activity_ms(now_ms)),
        pr_url: row.pr_url.clone().filter(|url| !url.trim().is_empty()),
        reason: None,
        error_summary: None,
        stuck_for_seconds: None,
    }
}

fn from_ms(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}
