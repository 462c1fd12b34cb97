//! Public HTTP surface.
//!
//! Handlers are thin: parse and validate, resolve identity, enforce the
//! route's rate bucket, call a service, map outcomes. All domain decisions
//! live in the engine, the aggregator and the store; the error mapper turns
//! [`VoteRejection`]s into wire codes.

pub mod dto;
pub mod live;
pub mod polls;
pub mod results;
pub mod votes;

use axum::extract::{Request, State};
use axum::http::{header, HeaderMap, HeaderValue};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::engine::{VoteEngine, VoteError, VoteRejection};
use crate::error::{codes, AppError};
use crate::identity::{IdentityResolver, VoterIdentity};
use crate::live::LiveDispatcher;
use crate::mailer::Mailer;
use crate::model::User;
use crate::ratelimit::RateLimiter;
use crate::store::PollStore;
use crate::token::{TokenService, DEVICE_TOKEN_TTL_DAYS};

/// Device cookie name.
pub const DEVICE_COOKIE: &str = "deviceToken";

/// Session cookie name (a bearer header works too).
pub const SESSION_COOKIE: &str = "session";

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<PollStore>,
    pub tokens: Arc<TokenService>,
    pub ratelimit: Arc<RateLimiter>,
    pub engine: Arc<VoteEngine>,
    pub live: LiveDispatcher,
    pub mailer: Arc<dyn Mailer>,
    pub base_url: String,
    pub secure_cookies: bool,
    pub test_mode: bool,
}

/// Everything a handler needs to know about the requester.
pub struct RequestContext {
    pub user: Option<User>,
    pub device_cookie: Option<String>,
    pub user_agent: String,
    pub client_key: String,
    pub test_data: bool,
}

impl RequestContext {
    /// Resolve the canonical voter identity for this request.
    pub fn identity(&self, state: &AppState) -> VoterIdentity {
        IdentityResolver::new(&state.tokens).resolve(
            self.user.clone(),
            self.device_cookie.as_deref(),
            &self.user_agent,
            chrono::Utc::now(),
        )
    }
}

/// Build the request context: session resolution, device cookie, client key
/// for rate limiting, test-data marking.
pub async fn request_context(
    state: &AppState,
    headers: &HeaderMap,
) -> Result<RequestContext, AppError> {
    let session_token = bearer_token(headers).or_else(|| cookie_value(headers, SESSION_COOKIE));
    let user = match session_token {
        Some(token) => state.store.user_by_session(&token).await?,
        None => None,
    };

    let user_agent = headers
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();

    let test_data = state.test_mode
        && headers
            .get("x-test-data")
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.eq_ignore_ascii_case("true"));

    Ok(RequestContext {
        user,
        device_cookie: cookie_value(headers, DEVICE_COOKIE),
        user_agent,
        client_key: client_key(headers),
        test_data,
    })
}

/// Rate-limit key: forwarded client address when present, else a shared
/// bucket per direct peer. Good enough behind the expected reverse proxy.
fn client_key(headers: &HeaderMap) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .or_else(|| {
            headers
                .get("x-real-ip")
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        })
        .unwrap_or_else(|| "direct".to_string())
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_string)
}

/// Minimal cookie-header parsing; the names we read are our own.
pub fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    let cookies = headers.get(header::COOKIE)?.to_str().ok()?;
    cookies.split(';').find_map(|pair| {
        let (key, value) = pair.trim().split_once('=')?;
        (key == name).then(|| value.to_string())
    })
}

/// `Set-Cookie` for a freshly issued device token: HttpOnly, SameSite=Lax,
/// Secure on https deployments, 90-day max-age, path=/.
pub fn device_cookie_header(state: &AppState, token: &str) -> Option<HeaderValue> {
    let max_age = DEVICE_TOKEN_TTL_DAYS * 24 * 3600;
    let mut cookie = format!(
        "{}={}; Path=/; Max-Age={}; HttpOnly; SameSite=Lax",
        DEVICE_COOKIE, token, max_age
    );
    if state.secure_cookies {
        cookie.push_str("; Secure");
    }
    HeaderValue::from_str(&cookie).ok()
}

/// Count the request against a bucket; deny with 429.
pub fn enforce_bucket(state: &AppState, bucket: &str, key: &str) -> Result<(), AppError> {
    let decision = state.ratelimit.check(bucket, key);
    if decision.allowed {
        Ok(())
    } else {
        Err(AppError::RateLimited(decision))
    }
}

/// HTTP mapping for engine outcomes.
pub fn map_vote_error(err: VoteError) -> AppError {
    match err {
        VoteError::Db(e) => AppError::Database(e),
        VoteError::Rejected(rejection) => match rejection {
            VoteRejection::PollNotFound => AppError::NotFound("Poll"),
            VoteRejection::PollInactive => AppError::bad_request(
                codes::POLL_INACTIVE,
                "this poll is not accepting votes",
            ),
            VoteRejection::PollExpired => {
                AppError::bad_request(codes::POLL_EXPIRED, "this poll has expired")
            }
            VoteRejection::UnknownOption { option_id } => {
                AppError::validation(format!("option {} does not belong to this poll", option_id))
            }
            VoteRejection::MaybeNotAllowed => {
                AppError::validation("maybe responses are not enabled for this poll")
            }
            VoteRejection::RequiresLogin => AppError::conflict(
                codes::REQUIRES_LOGIN,
                "this email belongs to a registered account; sign in to vote",
            ),
            VoteRejection::EmailBelongsToAnotherUser => AppError::forbidden_code(
                codes::EMAIL_BELONGS_TO_ANOTHER_USER,
                "this email belongs to another account",
            ),
            VoteRejection::AlreadyVoted => {
                AppError::conflict(codes::ALREADY_VOTED, "you have already voted in this poll")
            }
            VoteRejection::DuplicateEmailVote => AppError::conflict(
                codes::DUPLICATE_EMAIL_VOTE,
                "a vote with this email already exists",
            ),
            VoteRejection::SlotFull { option_id } => AppError::bad_request(
                codes::SLOT_FULL,
                format!("option {} is already at capacity", option_id),
            ),
            VoteRejection::AlreadySignedUp { .. } => AppError::bad_request(
                codes::ALREADY_SIGNED_UP,
                "you are already signed up for a slot in this poll",
            ),
            VoteRejection::EditingNotAllowed => {
                AppError::forbidden("vote editing is disabled for this poll")
            }
            VoteRejection::WithdrawalNotAllowed => AppError::forbidden_code(
                codes::WITHDRAWAL_NOT_ALLOWED,
                "vote withdrawal is disabled for this poll",
            ),
            VoteRejection::NoVotesFound => AppError::NotFoundCode {
                message: "no votes found for this requester".into(),
                code: codes::NO_VOTES_FOUND,
            },
        },
    }
}

/// Catch-all bucket over every route; the specific buckets come on top in
/// their handlers.
async fn general_rate_limit(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let key = client_key(request.headers());
    let decision = state
        .ratelimit
        .check(crate::ratelimit::buckets::API_GENERAL, &key);
    if !decision.allowed {
        return AppError::RateLimited(decision).into_response();
    }
    next.run(request).await
}

/// The `/api/v1` router.
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_methods(Any)
        .allow_headers(Any)
        .allow_origin(Any);

    Router::new()
        .route("/api/v1/polls", post(polls::create_poll))
        .route("/api/v1/polls/my-polls", get(polls::my_polls))
        .route("/api/v1/polls/shared-polls", get(polls::shared_polls))
        .route("/api/v1/polls/public/:token", get(polls::get_public))
        .route(
            "/api/v1/polls/admin/:token",
            get(polls::get_admin)
                .patch(polls::patch_admin)
                .delete(polls::delete_admin),
        )
        .route("/api/v1/polls/admin/:token/finalize", post(polls::finalize))
        .route("/api/v1/polls/admin/:token/options", post(polls::add_option))
        .route(
            "/api/v1/polls/admin/:token/options/:option_id",
            axum::routing::patch(polls::patch_option).delete(polls::delete_option),
        )
        .route("/api/v1/polls/admin/:token/remind", post(polls::manual_reminder))
        .route("/api/v1/polls/:token/results", get(results::get_results))
        .route("/api/v1/polls/:token/export/csv", get(results::export_csv))
        .route(
            "/api/v1/polls/:token/vote",
            post(votes::submit).delete(votes::withdraw),
        )
        .route("/api/v1/polls/:token/vote-bulk", post(votes::submit))
        .route("/api/v1/polls/:token/my-votes", get(votes::my_votes))
        .route("/api/v1/polls/:token/live", get(live::subscribe))
        .route(
            "/api/v1/votes/edit/:edit_token",
            get(votes::get_by_edit_token).put(votes::put_by_edit_token),
        )
        .route("/api/v1/auth/email-check", post(votes::email_check))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            general_rate_limit,
        ))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cookie_parsing_handles_multiple_pairs() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::COOKIE,
            HeaderValue::from_static("theme_preference=dark; deviceToken=abc.def; session=s1"),
        );
        assert_eq!(cookie_value(&headers, DEVICE_COOKIE).as_deref(), Some("abc.def"));
        assert_eq!(cookie_value(&headers, SESSION_COOKIE).as_deref(), Some("s1"));
        assert_eq!(cookie_value(&headers, "missing"), None);
    }

    #[test]
    fn client_key_prefers_forwarded_for() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("203.0.113.9, 10.0.0.1"),
        );
        assert_eq!(client_key(&headers), "203.0.113.9");

        let empty = HeaderMap::new();
        assert_eq!(client_key(&empty), "direct");
    }

    #[test]
    fn bearer_extraction() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer tok"));
        assert_eq!(bearer_token(&headers).as_deref(), Some("tok"));
    }

    #[test]
    fn rejection_mapping_covers_the_wire_codes() {
        use axum::response::IntoResponse;

        let err = map_vote_error(VoteError::Rejected(VoteRejection::SlotFull { option_id: 3 }));
        let response = err.into_response();
        assert_eq!(response.status(), axum::http::StatusCode::BAD_REQUEST);

        let err = map_vote_error(VoteError::Rejected(VoteRejection::RequiresLogin));
        assert_eq!(
            err.into_response().status(),
            axum::http::StatusCode::CONFLICT
        );

        let err = map_vote_error(VoteError::Rejected(VoteRejection::NoVotesFound));
        assert_eq!(
            err.into_response().status(),
            axum::http::StatusCode::NOT_FOUND
        );
    }
}
