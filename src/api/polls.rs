//! Poll lifecycle handlers.

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use serde::Serialize;
use serde_json::json;
use tracing::{info, warn};
use validator::Validate;

use super::dto::{
    validate_options_for_kind, AdminPollView, CreateOptionRequest, CreatePollRequest,
    FinalizeRequest, PatchOptionRequest, PatchPollRequest, PublicPollView,
};
use super::{enforce_bucket, request_context, AppState, RequestContext};
use crate::error::{codes, AppError};
use crate::live::LiveMessage;
use crate::mailer::OutboundEmail;
use crate::model::{
    normalize_email, ExpiryReminder, NotificationKind, PollAggregate, PollFlags, PollKind,
};
use crate::ratelimit::buckets;
use crate::scheduler::{manual_reminder_block, ReminderBlock};
use crate::store::{NewOption, NewPoll};

/// `POST /polls`
pub async fn create_poll(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<CreatePollRequest>,
) -> Result<impl IntoResponse, AppError> {
    let ctx = request_context(&state, &headers).await?;
    enforce_bucket(&state, buckets::POLL_CREATION, &ctx.client_key)?;
    body.validate()?;
    validate_options_for_kind(body.kind, &body.options)?;

    let reminder_enabled = body.enable_expiry_reminder.unwrap_or(false);
    if reminder_enabled && body.expires_at.is_none() {
        return Err(AppError::validation(
            "expiry reminders require an expiresAt",
        ));
    }

    let creator_email = ctx
        .user
        .as_ref()
        .map(|u| u.email.clone())
        .or_else(|| body.creator_email.as_deref().map(normalize_email));

    let new = NewPoll {
        kind: body.kind,
        title: body.title,
        description: body.description,
        creator_user_id: ctx.user.as_ref().map(|u| u.id),
        creator_email,
        expires_at: body.expires_at,
        flags: PollFlags {
            allow_vote_edit: body.allow_vote_edit.unwrap_or(false),
            allow_vote_withdrawal: body.allow_vote_withdrawal.unwrap_or(false),
            allow_multiple_slots: body.allow_multiple_slots.unwrap_or(false),
            allow_maybe: body.allow_maybe.unwrap_or(false),
            results_public: body.results_public.unwrap_or(true),
        },
        expiry_reminder: ExpiryReminder {
            enabled: reminder_enabled,
            hours_before: body.expiry_reminder_hours.unwrap_or(24),
            sent: false,
        },
        is_test_data: ctx.test_data,
    };
    let options = body
        .options
        .into_iter()
        .map(|o| NewOption {
            text: o.text,
            start_time: o.start_time,
            end_time: o.end_time,
            max_capacity: o.max_capacity,
            position: o.order,
        })
        .collect();

    let agg = state.store.create_poll(new, options).await?;
    info!(poll_id = %agg.poll.id, kind = agg.poll.kind.as_str(), "poll created");

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "poll": PublicPollView::from_aggregate(&agg),
            "publicToken": agg.poll.public_token,
            "adminToken": agg.poll.admin_token,
        })),
    ))
}

/// `GET /polls/public/:token`
pub async fn get_public(
    State(state): State<AppState>,
    Path(token): Path<String>,
) -> Result<Json<PublicPollView>, AppError> {
    let agg = state
        .store
        .poll_by_public_token(&token)
        .await?
        .ok_or(AppError::NotFound("Poll"))?;
    Ok(Json(PublicPollView::from_aggregate(&agg)))
}

/// Resolve an admin token and enforce the creator-session rule.
async fn admin_poll(
    state: &AppState,
    ctx: &RequestContext,
    token: &str,
) -> Result<PollAggregate, AppError> {
    let agg = state
        .store
        .poll_by_admin_token(token)
        .await?
        .ok_or(AppError::NotFound("Poll"))?;

    if let Some(creator_id) = agg.poll.creator_user_id {
        match &ctx.user {
            Some(user) if user.id == creator_id => {}
            Some(_) => return Err(AppError::forbidden("this poll belongs to another account")),
            None => return Err(AppError::Authentication),
        }
    }
    Ok(agg)
}

/// `GET /polls/admin/:token`
pub async fn get_admin(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(token): Path<String>,
) -> Result<Json<AdminPollView>, AppError> {
    let ctx = request_context(&state, &headers).await?;
    let agg = admin_poll(&state, &ctx, &token).await?;
    Ok(Json(AdminPollView::from_aggregate(&agg)))
}

/// `PATCH /polls/admin/:token`
pub async fn patch_admin(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(token): Path<String>,
    Json(body): Json<PatchPollRequest>,
) -> Result<Json<AdminPollView>, AppError> {
    let ctx = request_context(&state, &headers).await?;
    body.validate()?;
    let mut agg = admin_poll(&state, &ctx, &token).await?;

    body.apply(&mut agg.poll);
    state.store.update_poll(&agg.poll).await?;
    state.live.publish(agg.poll.id, LiveMessage::VoteUpdate);

    let reloaded = state
        .store
        .poll_by_id(agg.poll.id)
        .await?
        .ok_or(AppError::NotFound("Poll"))?;
    Ok(Json(AdminPollView::from_aggregate(&reloaded)))
}

/// `DELETE /polls/admin/:token`
pub async fn delete_admin(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(token): Path<String>,
) -> Result<StatusCode, AppError> {
    let ctx = request_context(&state, &headers).await?;
    let agg = admin_poll(&state, &ctx, &token).await?;
    state.store.delete_poll(agg.poll.id).await?;
    info!(poll_id = %agg.poll.id, "poll deleted");
    Ok(StatusCode::NO_CONTENT)
}

/// `POST /polls/admin/:token/finalize`: option id 0 clears.
pub async fn finalize(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(token): Path<String>,
    Json(body): Json<FinalizeRequest>,
) -> Result<Json<AdminPollView>, AppError> {
    let ctx = request_context(&state, &headers).await?;
    body.validate()?;
    let agg = admin_poll(&state, &ctx, &token).await?;

    let final_option = if body.option_id == 0 {
        None
    } else {
        if agg.option(body.option_id).is_none() {
            return Err(AppError::validation(format!(
                "option {} does not belong to this poll",
                body.option_id
            )));
        }
        Some(body.option_id)
    };
    state.store.set_final_option(agg.poll.id, final_option).await?;
    state.live.publish(agg.poll.id, LiveMessage::VoteUpdate);

    let reloaded = state
        .store
        .poll_by_id(agg.poll.id)
        .await?
        .ok_or(AppError::NotFound("Poll"))?;
    Ok(Json(AdminPollView::from_aggregate(&reloaded)))
}

/// `POST /polls/admin/:token/options`
pub async fn add_option(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(token): Path<String>,
    Json(body): Json<CreateOptionRequest>,
) -> Result<impl IntoResponse, AppError> {
    let ctx = request_context(&state, &headers).await?;
    body.validate()?;
    let agg = admin_poll(&state, &ctx, &token).await?;
    validate_options_for_kind(agg.poll.kind, std::slice::from_ref(&body))?;

    let option = state
        .store
        .add_option(
            agg.poll.id,
            NewOption {
                text: body.text,
                start_time: body.start_time,
                end_time: body.end_time,
                max_capacity: body.max_capacity,
                position: body.order,
            },
        )
        .await?;
    state.live.publish(agg.poll.id, LiveMessage::VoteUpdate);
    Ok((StatusCode::CREATED, Json(option)))
}

/// `PATCH /polls/admin/:token/options/:option_id`
pub async fn patch_option(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((token, option_id)): Path<(String, i64)>,
    Json(body): Json<PatchOptionRequest>,
) -> Result<Json<crate::model::PollOption>, AppError> {
    let ctx = request_context(&state, &headers).await?;
    body.validate()?;
    let agg = admin_poll(&state, &ctx, &token).await?;
    let mut option = agg
        .option(option_id)
        .cloned()
        .ok_or(AppError::NotFound("Option"))?;

    if let Some(text) = body.text {
        option.text = text;
    }
    if let Some(start) = body.start_time {
        option.start_time = start;
    }
    if let Some(end) = body.end_time {
        option.end_time = end;
    }
    if let Some(capacity) = body.max_capacity {
        option.max_capacity = capacity;
    }

    // The patched option must still satisfy its kind's shape.
    match agg.poll.kind {
        PollKind::Schedule if option.start_time.is_none() || option.end_time.is_none() => {
            return Err(AppError::validation(
                "schedule options require startTime and endTime",
            ));
        }
        PollKind::Survey if option.start_time.is_some() || option.end_time.is_some() => {
            return Err(AppError::validation("survey options must not carry times"));
        }
        _ if option.max_capacity.is_some() && agg.poll.kind != PollKind::Organization => {
            return Err(AppError::validation(
                "maxCapacity is only valid for organization polls",
            ));
        }
        _ => {}
    }

    state.store.update_option(&option).await?;
    state.live.publish(agg.poll.id, LiveMessage::VoteUpdate);
    Ok(Json(option))
}

/// `DELETE /polls/admin/:token/options/:option_id`: cascades votes.
pub async fn delete_option(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((token, option_id)): Path<(String, i64)>,
) -> Result<StatusCode, AppError> {
    let ctx = request_context(&state, &headers).await?;
    let agg = admin_poll(&state, &ctx, &token).await?;

    if !state.store.delete_option(agg.poll.id, option_id).await? {
        return Err(AppError::NotFound("Option"));
    }
    if agg.poll.kind == PollKind::Organization {
        if let Ok(slots) = state.engine.slot_snapshot(agg.poll.id).await {
            state
                .live
                .publish(agg.poll.id, LiveMessage::SlotUpdate { slots });
        }
    }
    state.live.publish(agg.poll.id, LiveMessage::VoteUpdate);
    Ok(StatusCode::NO_CONTENT)
}

/// `POST /polls/admin/:token/remind`: creator-triggered reminder to all
/// participants, capped by the notification log.
pub async fn manual_reminder(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(token): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    let ctx = request_context(&state, &headers).await?;
    enforce_bucket(&state, buckets::EMAIL, &ctx.client_key)?;
    let agg = admin_poll(&state, &ctx, &token).await?;

    match manual_reminder_block(&state.store, agg.poll.id, chrono::Utc::now()).await? {
        Some(ReminderBlock::LimitReached) => {
            return Err(AppError::conflict(
                codes::REMINDER_LIMIT_REACHED,
                "the reminder limit for this poll is reached",
            ));
        }
        Some(ReminderBlock::TooSoon { retry_after_secs }) => {
            return Err(AppError::BadRequest {
                message: format!(
                    "a reminder was sent recently; retry in {} seconds",
                    retry_after_secs
                ),
                code: Some(codes::REMINDER_TOO_SOON),
                details: Some(json!({ "retryAfter": retry_after_secs })),
            });
        }
        None => {}
    }

    let recipients: std::collections::BTreeSet<String> = agg
        .votes
        .iter()
        .map(|v| v.voter_email.clone())
        .filter(|e| !e.is_empty())
        .collect();

    let mut sent = 0usize;
    for recipient in &recipients {
        let email = OutboundEmail {
            poll_id: agg.poll.id,
            kind: NotificationKind::ManualReminder,
            to: recipient.clone(),
            subject: format!("Reminder: \"{}\"", agg.poll.title),
            body: format!(
                "The creator of \"{}\" asks you to review your votes:\n{}/poll/{}\n",
                agg.poll.title, state.base_url, agg.poll.public_token
            ),
        };
        if let Err(err) = state.mailer.send(email).await {
            warn!(poll_id = %agg.poll.id, error = %err, "manual reminder failed");
            continue;
        }
        sent += 1;
    }
    // One log row per trigger drives the cap, regardless of fan-out size.
    state
        .store
        .log_notification(
            agg.poll.id,
            NotificationKind::ManualReminder,
            agg.poll.creator_email.as_deref().unwrap_or("creator"),
        )
        .await?;

    Ok(Json(json!({ "success": true, "recipients": sent })))
}

/// Dashboard list entry: a poll plus its admin token.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnedPollEntry {
    #[serde(flatten)]
    poll: crate::model::Poll,
    admin_token: String,
}

/// `GET /polls/my-polls`
pub async fn my_polls(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<OwnedPollEntry>>, AppError> {
    let ctx = request_context(&state, &headers).await?;
    let user = ctx.user.ok_or(AppError::Authentication)?;

    let polls = state.store.polls_by_creator(user.id).await?;
    Ok(Json(
        polls
            .into_iter()
            .map(|poll| {
                let admin_token = poll.admin_token.clone();
                OwnedPollEntry { poll, admin_token }
            })
            .collect(),
    ))
}

/// `GET /polls/shared-polls`: polls this user has voted in.
pub async fn shared_polls(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<crate::model::Poll>>, AppError> {
    let ctx = request_context(&state, &headers).await?;
    let user = ctx.user.ok_or(AppError::Authentication)?;
    let polls = state.store.polls_voted_by(user.id, &user.email).await?;
    Ok(Json(polls))
}
