//! Router-level tests: wire formats, status codes, cookies, visibility and
//! rate-limit headers.

mod common;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use ballotbox::api;
use serde_json::{json, Value};
use tower::util::ServiceExt;

use common::test_app;

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("read body");
    serde_json::from_slice(&bytes).expect("json body")
}

fn post_json(uri: &str, body: &Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

async fn create_survey(router: &Router, extra: Value) -> (String, String, Vec<i64>) {
    let mut body = json!({
        "title": "Lunch spot",
        "type": "survey",
        "options": [{"text": "A"}, {"text": "B"}, {"text": "C"}],
    });
    if let (Value::Object(target), Value::Object(source)) = (&mut body, extra) {
        target.extend(source);
    }

    let response = router
        .clone()
        .oneshot(post_json("/api/v1/polls", &body))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let payload = body_json(response).await;

    let public = payload["publicToken"].as_str().unwrap().to_string();
    let admin = payload["adminToken"].as_str().unwrap().to_string();
    let options = payload["poll"]["options"]
        .as_array()
        .unwrap()
        .iter()
        .map(|o| o["id"].as_i64().unwrap())
        .collect();
    (public, admin, options)
}

#[tokio::test]
async fn create_then_fetch_preserves_the_poll() {
    let app = test_app().await;
    let router = api::router(app.state.clone());
    let (public, admin, _) = create_survey(&router, json!({})).await;
    assert_ne!(public, admin);

    let response = router
        .clone()
        .oneshot(get(&format!("/api/v1/polls/public/{}", public)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let payload = body_json(response).await;

    assert_eq!(payload["title"], "Lunch spot");
    assert_eq!(payload["type"], "survey");
    let texts: Vec<&str> = payload["options"]
        .as_array()
        .unwrap()
        .iter()
        .map(|o| o["text"].as_str().unwrap())
        .collect();
    assert_eq!(texts, ["A", "B", "C"]);
    // The public view never leaks the admin token.
    assert!(payload.get("adminToken").is_none());
}

#[tokio::test]
async fn vote_sets_device_cookie_and_results_tally() {
    let app = test_app().await;
    let router = api::router(app.state.clone());
    let (public, _, options) = create_survey(&router, json!({"allowMaybe": true})).await;

    let vote = json!({
        "voterName": "V1",
        "voterEmail": "v1@x.test",
        "votes": [
            {"optionId": options[0], "response": "yes"},
            {"optionId": options[1], "response": "no"},
            {"optionId": options[2], "response": "maybe"},
        ],
    });
    let response = router
        .clone()
        .oneshot(post_json(&format!("/api/v1/polls/{}/vote-bulk", public), &vote))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let cookie = response
        .headers()
        .get(header::SET_COOKIE)
        .expect("anonymous voters get a device cookie")
        .to_str()
        .unwrap()
        .to_string();
    assert!(cookie.starts_with("deviceToken="));
    assert!(cookie.contains("HttpOnly"));
    assert!(cookie.contains("SameSite=Lax"));

    let payload = body_json(response).await;
    assert_eq!(payload["success"], true);
    assert!(payload["voterEditToken"].is_null());

    let response = router
        .clone()
        .oneshot(get(&format!("/api/v1/polls/{}/results", public)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let results = body_json(response).await;
    let o1 = options[0].to_string();
    let o3 = options[2].to_string();
    assert_eq!(results["stats"][&o1]["yesCount"], 1);
    assert_eq!(results["stats"][&o3]["maybeCount"], 1);
    assert_eq!(results["participantCount"], 1);
}

#[tokio::test]
async fn private_results_need_the_admin_token() {
    let app = test_app().await;
    let router = api::router(app.state.clone());
    let (public, admin, _) = create_survey(&router, json!({"resultsPublic": false})).await;

    let response = router
        .clone()
        .oneshot(get(&format!("/api/v1/polls/{}/results", public)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    let payload = body_json(response).await;
    assert_eq!(payload["resultsPrivate"], true);

    let response = router
        .clone()
        .oneshot(get(&format!("/api/v1/polls/{}/results", admin)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn invalid_vote_bodies_are_400() {
    let app = test_app().await;
    let router = api::router(app.state.clone());
    let (public, _, options) = create_survey(&router, json!({})).await;

    // Bad email.
    let response = router
        .clone()
        .oneshot(post_json(
            &format!("/api/v1/polls/{}/vote", public),
            &json!({
                "voterName": "V",
                "voterEmail": "nope",
                "votes": [{"optionId": options[0], "response": "yes"}],
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    // Unknown option id.
    let response = router
        .clone()
        .oneshot(post_json(
            &format!("/api/v1/polls/{}/vote", public),
            &json!({
                "voterName": "V",
                "voterEmail": "v@x.test",
                "votes": [{"optionId": 424242, "response": "yes"}],
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn expired_poll_reports_poll_expired() {
    let app = test_app().await;
    let router = api::router(app.state.clone());
    let (public, _, options) = create_survey(&router, json!({})).await;

    let agg = app.store.poll_by_public_token(&public).await.unwrap().unwrap();
    let mut poll = agg.poll;
    poll.expires_at = Some(chrono::Utc::now() - chrono::Duration::seconds(1));
    app.store.update_poll(&poll).await.unwrap();

    let response = router
        .clone()
        .oneshot(post_json(
            &format!("/api/v1/polls/{}/vote", public),
            &json!({
                "voterName": "V",
                "voterEmail": "v@x.test",
                "votes": [{"optionId": options[0], "response": "yes"}],
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let payload = body_json(response).await;
    assert_eq!(payload["errorCode"], "POLL_EXPIRED");
}

#[tokio::test]
async fn rate_limit_denials_carry_headers() {
    let app = test_app().await;
    let router = api::router(app.state.clone());

    let request = |_: usize| {
        Request::builder()
            .method("POST")
            .uri("/api/v1/auth/email-check")
            .header(header::CONTENT_TYPE, "application/json")
            .header("x-forwarded-for", "198.51.100.7")
            .body(Body::from(
                json!({"email": "probe@x.test"}).to_string(),
            ))
            .unwrap()
    };

    for i in 0..10 {
        let response = router.clone().oneshot(request(i)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK, "request {} allowed", i);
    }

    let response = router.clone().oneshot(request(10)).await.unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert!(response.headers().get(header::RETRY_AFTER).is_some());
    assert_eq!(
        response
            .headers()
            .get("x-ratelimit-remaining")
            .and_then(|v| v.to_str().ok()),
        Some("0")
    );
    let payload = body_json(response).await;
    assert!(payload["retryAfter"].as_u64().is_some());
}

#[tokio::test]
async fn edit_token_round_trip_over_http() {
    let app = test_app().await;
    let router = api::router(app.state.clone());
    let (public, _, options) =
        create_survey(&router, json!({"allowVoteEdit": true})).await;

    let response = router
        .clone()
        .oneshot(post_json(
            &format!("/api/v1/polls/{}/vote", public),
            &json!({
                "voterName": "V",
                "voterEmail": "v@x.test",
                "votes": [{"optionId": options[0], "response": "yes"}],
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let payload = body_json(response).await;
    let edit_token = payload["voterEditToken"].as_str().unwrap().to_string();

    // GET returns exactly the submitted items plus the sanitised poll.
    let response = router
        .clone()
        .oneshot(get(&format!("/api/v1/votes/edit/{}", edit_token)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let payload = body_json(response).await;
    assert_eq!(payload["votes"].as_array().unwrap().len(), 1);
    assert_eq!(payload["votes"][0]["optionId"], options[0]);
    assert_eq!(payload["votes"][0]["response"], "yes");
    assert!(payload["poll"].get("adminToken").is_none());

    // PUT flips the response.
    let response = router
        .clone()
        .oneshot(
            Request::builder()
                .method("PUT")
                .uri(format!("/api/v1/votes/edit/{}", edit_token))
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(
                    json!({"votes": [{"optionId": options[0], "response": "no"}]}).to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = router
        .clone()
        .oneshot(get(&format!("/api/v1/polls/{}/results", public)))
        .await
        .unwrap();
    let results = body_json(response).await;
    let o1 = options[0].to_string();
    assert_eq!(results["stats"][&o1]["yesCount"], 0);
    assert_eq!(results["stats"][&o1]["noCount"], 1);

    // Unknown tokens 404 with the wire code.
    let response = router
        .clone()
        .oneshot(get("/api/v1/votes/edit/unknown-token"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let payload = body_json(response).await;
    assert_eq!(payload["errorCode"], "NO_VOTES_FOUND");
}

#[tokio::test]
async fn csv_export_returns_the_matrix() {
    let app = test_app().await;
    let router = api::router(app.state.clone());
    let (public, _, options) = create_survey(&router, json!({})).await;

    router
        .clone()
        .oneshot(post_json(
            &format!("/api/v1/polls/{}/vote", public),
            &json!({
                "voterName": "Ann",
                "voterEmail": "ann@x.test",
                "votes": [{"optionId": options[0], "response": "yes"}],
            }),
        ))
        .await
        .unwrap();

    let response = router
        .clone()
        .oneshot(get(&format!("/api/v1/polls/{}/export/csv", public)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response
        .headers()
        .get(header::CONTENT_TYPE)
        .unwrap()
        .to_str()
        .unwrap()
        .starts_with("text/csv"));

    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let csv = String::from_utf8(bytes.to_vec()).unwrap();
    let mut lines = csv.lines();
    assert_eq!(lines.next(), Some("Participant,A,B,C"));
    assert_eq!(lines.next(), Some("Ann,Yes,,"));
    assert_eq!(lines.next(), Some("Total,1,0,0"));
}

#[tokio::test]
async fn my_polls_requires_a_session() {
    let app = test_app().await;
    let router = api::router(app.state.clone());

    let response = router
        .clone()
        .oneshot(get("/api/v1/polls/my-polls"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let payload = body_json(response).await;
    assert_eq!(payload["requiresAuth"], true);

    // With a session the listing works.
    let user = app.store.create_user("owner@x.test", None).await.unwrap();
    let session = app
        .store
        .create_session(user.id, chrono::Duration::hours(1))
        .await
        .unwrap();
    let response = router
        .clone()
        .oneshot(
            Request::builder()
                .uri("/api/v1/polls/my-polls")
                .header(header::AUTHORIZATION, format!("Bearer {}", session))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await.as_array().unwrap().len(), 0);
}
