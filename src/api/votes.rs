//! Voting handlers: submit, withdraw, edit-by-token, my-votes, email-check.

use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use rand::Rng;
use serde_json::json;
use validator::Validate;

use super::dto::{EditVotesRequest, EmailCheckRequest, PublicPollView, VoteBulkRequest, WithdrawRequest};
use super::{device_cookie_header, enforce_bucket, map_vote_error, request_context, AppState};
use crate::engine::{BulkVote, VoteItem};
use crate::error::{codes, AppError};
use crate::identity::VoterIdentity;
use crate::ratelimit::buckets;

fn set_device_cookie(state: &AppState, identity: &VoterIdentity, headers: &mut HeaderMap) {
    if let Some(issued) = &identity.issued_token {
        if let Some(value) = device_cookie_header(state, &issued.token) {
            headers.insert(header::SET_COOKIE, value);
        }
    }
}

fn to_items(body_votes: Vec<super::dto::VoteItemRequest>) -> Vec<VoteItem> {
    body_votes
        .into_iter()
        .map(|v| VoteItem {
            option_id: v.option_id,
            response: v.response,
            comment: v.comment,
        })
        .collect()
}

/// `POST /polls/:token/vote` and its `/vote-bulk` alias. One transactional
/// path serves both.
pub async fn submit(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(token): Path<String>,
    Json(body): Json<VoteBulkRequest>,
) -> Result<impl IntoResponse, AppError> {
    let ctx = request_context(&state, &headers).await?;
    enforce_bucket(&state, buckets::VOTE, &ctx.client_key)?;
    body.validate()?;

    let identity = ctx.identity(&state);
    let receipt = state
        .engine
        .submit(
            &token,
            &identity,
            BulkVote {
                voter_name: body.voter_name,
                voter_email: body.voter_email,
                items: to_items(body.votes),
                is_test_data: ctx.test_data,
            },
        )
        .await
        .map_err(map_vote_error)?;

    let mut response_headers = HeaderMap::new();
    set_device_cookie(&state, &identity, &mut response_headers);

    Ok((
        response_headers,
        Json(json!({
            "success": true,
            "votes": receipt.votes,
            "voterEditToken": receipt.voter_edit_token,
        })),
    ))
}

/// `DELETE /polls/:token/vote`: withdraw all of the requester's votes.
pub async fn withdraw(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(token): Path<String>,
    body: Option<Json<WithdrawRequest>>,
) -> Result<impl IntoResponse, AppError> {
    let ctx = request_context(&state, &headers).await?;
    enforce_bucket(&state, buckets::VOTE, &ctx.client_key)?;
    let Json(body) = body.unwrap_or_default();

    let identity = ctx.identity(&state);
    let removed = state
        .engine
        .withdraw(
            &token,
            &identity,
            body.voter_email.as_deref(),
            body.voter_edit_token.as_deref(),
        )
        .await
        .map_err(map_vote_error)?;

    Ok(Json(json!({ "success": true, "removed": removed })))
}

/// `GET /polls/:token/my-votes`: has this browser/session voted here?
pub async fn my_votes(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(token): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let ctx = request_context(&state, &headers).await?;
    let agg = state
        .store
        .poll_by_public_token(&token)
        .await?
        .ok_or(AppError::NotFound("Poll"))?;

    let identity = ctx.identity(&state);
    let votes = state
        .store
        .votes_for_requester(
            agg.poll.id,
            identity.user_id(),
            identity.user.as_ref().map(|u| u.email.as_str()),
            Some(&identity.key.as_string()),
        )
        .await?;

    let mut response_headers = HeaderMap::new();
    set_device_cookie(&state, &identity, &mut response_headers);

    Ok((
        response_headers,
        Json(json!({ "hasVoted": !votes.is_empty(), "votes": votes })),
    ))
}

/// `GET /votes/edit/:edit_token`: the voter's rows plus the poll's public
/// shape. Never exposes other voters' data.
pub async fn get_by_edit_token(
    State(state): State<AppState>,
    Path(edit_token): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let votes = state.store.votes_by_edit_token(&edit_token).await?;
    let first = votes.first().ok_or(AppError::NotFoundCode {
        message: "no votes found for this token".into(),
        code: codes::NO_VOTES_FOUND,
    })?;

    let agg = state
        .store
        .poll_by_id(first.poll_id)
        .await?
        .ok_or(AppError::NotFound("Poll"))?;

    Ok(Json(json!({
        "poll": PublicPollView::from_aggregate(&agg),
        "votes": votes,
    })))
}

/// `PUT /votes/edit/:edit_token`: re-apply votes without the already-voted
/// check.
pub async fn put_by_edit_token(
    State(state): State<AppState>,
    Path(edit_token): Path<String>,
    Json(body): Json<EditVotesRequest>,
) -> Result<impl IntoResponse, AppError> {
    body.validate()?;
    let receipt = state
        .engine
        .update_by_edit_token(&edit_token, to_items(body.votes))
        .await
        .map_err(map_vote_error)?;

    Ok(Json(json!({
        "success": true,
        "votes": receipt.votes,
        "voterEditToken": receipt.voter_edit_token,
    })))
}

/// `POST /auth/email-check`: does this email belong to a registered
/// account? Separately rate-limited and randomly delayed against timing
/// enumeration.
pub async fn email_check(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<EmailCheckRequest>,
) -> Result<impl IntoResponse, AppError> {
    let ctx = request_context(&state, &headers).await?;
    enforce_bucket(&state, buckets::EMAIL_CHECK, &ctx.client_key)?;
    body.validate()?;

    let delay_ms = { rand::thread_rng().gen_range(100..=150) };
    tokio::time::sleep(std::time::Duration::from_millis(delay_ms)).await;

    let exists = state.store.user_by_email(&body.email).await?.is_some();
    Ok((StatusCode::OK, Json(json!({ "exists": exists }))))
}
