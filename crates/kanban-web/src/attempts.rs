use chrono::Utc;
use kanban_agents::{AgentContext, AgentError, RunStatus};
use kanban_core::{AgentEvent, AgentProfile, AttemptId, AttemptStatus, LogLevel};
use kanban_store::{AttemptRecord, CardRecord};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::WebError;
use crate::model::{FollowupRequest, StartAttemptRequest, DEFAULT_BASE_BRANCH, DEFAULT_PROFILE_ID};
use crate::registry::RegistryGuard;
use crate::sink::StoreSink;
use crate::state::WebState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunMode {
    Fresh,
    Resume,
}

impl RunMode {
    fn as_str(self) -> &'static str {
        match self {
            RunMode::Fresh => "fresh",
            RunMode::Resume => "resume",
        }
    }
}

/// Creates a queued attempt for the card and starts its run in the background.
pub async fn start_attempt(
    state: &WebState,
    request: StartAttemptRequest,
) -> Result<AttemptRecord, WebError> {
    let profile_id = request
        .profile_id
        .clone()
        .unwrap_or_else(|| DEFAULT_PROFILE_ID.to_string());
    let profile = resolve_profile(state, &profile_id)?;
    if request.worktree_path.as_os_str().is_empty() {
        return Err(WebError::BadRequest {
            message: "worktree_path must not be empty".to_string(),
        });
    }
    let card = state
        .store
        .load_card(&request.card_id)?
        .ok_or_else(|| WebError::NotFound {
            resource: format!("card:{}", request.card_id),
        })?;

    let mut record = AttemptRecord::queued(
        AttemptId::new(Uuid::new_v4().to_string()),
        card.board_id.clone(),
        Some(card.id.clone()),
        profile_id,
        request.worktree_path.display().to_string(),
        Utc::now(),
    );
    record.agent = profile.agent;
    record.branch_name = Some(
        request
            .branch_name
            .clone()
            .unwrap_or_else(|| format!("kanban/{}", card.id)),
    );
    record.base_branch = Some(
        request
            .base_branch
            .clone()
            .unwrap_or_else(|| DEFAULT_BASE_BRANCH.to_string()),
    );
    state.store.create_attempt(&record)?;

    let cancel = register(state, &record.id)?;
    let ctx = build_context(state, &record, &card, cancel, None);
    info!(attempt_id = %record.id, card_id = %card.id, "attempt queued");
    spawn_run(state.clone(), ctx, profile, RunMode::Fresh);
    Ok(record)
}

/// Resumes the attempt's agent session with a follow-up prompt.
pub async fn followup_attempt(
    state: &WebState,
    attempt_id: &AttemptId,
    request: FollowupRequest,
) -> Result<AttemptRecord, WebError> {
    let mut record = load_attempt(state, attempt_id)?;
    if state.registry.contains(attempt_id) || record.status.is_in_flight() {
        return Err(WebError::Conflict {
            message: format!("attempt {attempt_id} is still {}", record.status),
        });
    }
    if !record
        .session_id
        .as_deref()
        .is_some_and(|session| !session.trim().is_empty())
    {
        return Err(AgentError::MissingSession {
            attempt_id: attempt_id.to_string(),
        }
        .into());
    }
    if request.prompt.trim().is_empty() {
        return Err(AgentError::InvalidRequest {
            message: "followup prompt must not be empty".to_string(),
        }
        .into());
    }

    let profile_id = request
        .profile_id
        .clone()
        .unwrap_or_else(|| record.profile_id.clone());
    let profile = resolve_profile(state, &profile_id)?;
    let card_id = record.card_id.clone().ok_or_else(|| WebError::BadRequest {
        message: format!("attempt {attempt_id} is not linked to a card"),
    })?;
    let card = state
        .store
        .load_card(&card_id)?
        .ok_or_else(|| WebError::NotFound {
            resource: format!("card:{card_id}"),
        })?;

    let cancel = register(state, attempt_id)?;
    let now = Utc::now();
    state
        .store
        .set_attempt_status(attempt_id, AttemptStatus::Queued, now)?;
    record.status = AttemptStatus::Queued;
    record.updated_at = now;

    let ctx = build_context(state, &record, &card, cancel, Some(request.prompt));
    info!(attempt_id = %attempt_id, "followup queued");
    spawn_run(state.clone(), ctx, profile, RunMode::Resume);
    Ok(record)
}

/// Cancels a live run. The final status is written by the run task.
pub fn stop_attempt(state: &WebState, attempt_id: &AttemptId) -> Result<AttemptStatus, WebError> {
    if state.registry.cancel(attempt_id) {
        state.store.transition_attempt_status(
            attempt_id,
            &[AttemptStatus::Queued, AttemptStatus::Running],
            AttemptStatus::Stopping,
            Utc::now(),
        )?;
        info!(attempt_id = %attempt_id, "stop requested");
        return Ok(AttemptStatus::Stopping);
    }
    let record = load_attempt(state, attempt_id)?;
    Err(WebError::Conflict {
        message: format!("attempt {attempt_id} is not running (status {})", record.status),
    })
}

pub fn load_attempt(state: &WebState, attempt_id: &AttemptId) -> Result<AttemptRecord, WebError> {
    state
        .store
        .load_attempt(attempt_id)?
        .ok_or_else(|| WebError::NotFound {
            resource: format!("attempt:{attempt_id}"),
        })
}

fn resolve_profile(state: &WebState, profile_id: &str) -> Result<AgentProfile, WebError> {
    let profile = state
        .profile(profile_id)
        .cloned()
        .ok_or_else(|| WebError::BadRequest {
            message: format!("unknown profile '{profile_id}'"),
        })?;
    if profile.agent != state.adapter.kind() {
        return Err(AgentError::UnsupportedAgent {
            agent: profile.agent,
        }
        .into());
    }
    Ok(profile)
}

fn register(state: &WebState, attempt_id: &AttemptId) -> Result<CancellationToken, WebError> {
    state
        .registry
        .register(attempt_id)
        .ok_or_else(|| WebError::Conflict {
            message: format!("attempt {attempt_id} already has a live run"),
        })
}

fn build_context(
    state: &WebState,
    record: &AttemptRecord,
    card: &CardRecord,
    cancel: CancellationToken,
    followup_prompt: Option<String>,
) -> AgentContext {
    AgentContext {
        attempt_id: record.id.clone(),
        board_id: record.board_id.clone(),
        card_id: card.id.clone(),
        worktree_path: PathBuf::from(&record.worktree_path),
        branch_name: record.branch_name.clone().unwrap_or_default(),
        base_branch: record
            .base_branch
            .clone()
            .unwrap_or_else(|| DEFAULT_BASE_BRANCH.to_string()),
        card_title: card.title.clone(),
        card_description: card.description.clone(),
        profile_id: record.profile_id.clone(),
        session_id: record.session_id.clone(),
        followup_prompt,
        cancel,
        sink: Arc::new(StoreSink::new(
            state.store.clone(),
            record.id.clone(),
            state.events_tx(),
        )),
    }
}

fn spawn_run(state: WebState, ctx: AgentContext, profile: AgentProfile, mode: RunMode) {
    tokio::spawn(async move {
        let attempt_id = ctx.attempt_id.clone();
        let _guard = RegistryGuard::new(state.registry.clone(), attempt_id.clone());

        if let Err(err) = state.store.transition_attempt_status(
            &attempt_id,
            &[AttemptStatus::Queued],
            AttemptStatus::Running,
            Utc::now(),
        ) {
            warn!(attempt_id = %attempt_id, error = %err, "failed to mark attempt running");
        }
        info!(attempt_id = %attempt_id, mode = mode.as_str(), "attempt run started");

        let result = match mode {
            RunMode::Fresh => state.adapter.run(&ctx, &profile).await,
            RunMode::Resume => state.adapter.resume(&ctx, &profile).await,
        };
        let status = match &result {
            Ok(outcome) => match outcome.status {
                RunStatus::Succeeded => AttemptStatus::Succeeded,
                RunStatus::Failed => AttemptStatus::Failed,
                RunStatus::Cancelled => AttemptStatus::Stopped,
            },
            Err(err) => {
                ctx.emit(AgentEvent::log(LogLevel::Error, err.to_string()))
                    .await;
                AttemptStatus::Failed
            }
        };

        if let Err(err) = state
            .store
            .set_attempt_status(&attempt_id, status, Utc::now())
        {
            warn!(attempt_id = %attempt_id, error = %err, "failed to record attempt status");
        }
        info!(attempt_id = %attempt_id, status = %status, "attempt run finished");
    });
}
