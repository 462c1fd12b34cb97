//! Result reads and the CSV export sink.

use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, HeaderValue};
use axum::response::IntoResponse;
use axum::Json;

use super::{request_context, AppState};
use crate::error::AppError;
use crate::model::PollAggregate;
use crate::results::{aggregate, can_view_results, matrix, to_csv, CellLabels, PollResults};

/// Resolve either token and apply the results-visibility rule.
async fn viewable_poll(
    state: &AppState,
    headers: &HeaderMap,
    token: &str,
) -> Result<PollAggregate, AppError> {
    let ctx = request_context(state, headers).await?;
    let agg = state
        .store
        .poll_by_any_token(token)
        .await?
        .ok_or(AppError::NotFound("Poll"))?;

    let via_admin_token = agg.poll.admin_token == token;
    let user_id = ctx.user.as_ref().map(|u| u.id);
    if !can_view_results(&agg.poll, via_admin_token, user_id) {
        return Err(AppError::results_private());
    }
    Ok(agg)
}

/// `GET /polls/:token/results`
pub async fn get_results(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(token): Path<String>,
) -> Result<Json<PollResults>, AppError> {
    let agg = viewable_poll(&state, &headers, &token).await?;
    Ok(Json(aggregate(&agg)))
}

/// `GET /polls/:token/export/csv`: the participant × option matrix as an
/// attachment.
pub async fn export_csv(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(token): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let agg = viewable_poll(&state, &headers, &token).await?;
    let results = aggregate(&agg);
    let csv = to_csv(&matrix(&agg.poll, &results, &CellLabels::default()));

    let mut filename: String = agg
        .poll
        .title
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .take(60)
        .collect();
    if filename.is_empty() {
        filename.push_str("poll");
    }

    let mut response_headers = HeaderMap::new();
    response_headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/csv; charset=utf-8"),
    );
    if let Ok(value) = HeaderValue::from_str(&format!("attachment; filename=\"{}.csv\"", filename))
    {
        response_headers.insert(header::CONTENT_DISPOSITION, value);
    }

    Ok((response_headers, csv))
}
