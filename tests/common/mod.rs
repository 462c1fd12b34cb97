//! Shared harness for integration tests: an in-memory store with the full
//! service stack wired the same way `serve` does it.
#![allow(dead_code)] // not every test target uses every helper

use std::sync::Arc;

use ballotbox::api::AppState;
use ballotbox::engine::VoteEngine;
use ballotbox::identity::{IdentityResolver, VoterIdentity};
use ballotbox::live::LiveDispatcher;
use ballotbox::mailer::{EmailCooldowns, Mailer, MockMailer};
use ballotbox::model::{ExpiryReminder, PollAggregate, PollFlags, PollKind};
use ballotbox::ratelimit::RateLimiter;
use ballotbox::store::{NewOption, NewPoll, PollStore};
use ballotbox::token::TokenService;

pub const BASE_URL: &str = "http://localhost:8080";

pub struct TestApp {
    pub store: Arc<PollStore>,
    pub engine: Arc<VoteEngine>,
    pub live: LiveDispatcher,
    pub mailer: MockMailer,
    pub tokens: Arc<TokenService>,
    pub state: AppState,
}

pub async fn test_app() -> TestApp {
    let store = Arc::new(PollStore::open_in_memory().await.expect("in-memory store"));
    let tokens = Arc::new(TokenService::new(b"integration-test-master-secret-32b!"));
    let live = LiveDispatcher::new();
    let mailer = MockMailer::new();
    let mailer_arc: Arc<dyn Mailer> = Arc::new(mailer.clone());
    let cooldowns = Arc::new(EmailCooldowns::new(chrono::Duration::seconds(30)));

    let engine = Arc::new(VoteEngine::new(
        Arc::clone(&store),
        live.clone(),
        Arc::clone(&mailer_arc),
        cooldowns,
        BASE_URL.to_string(),
    ));

    let state = AppState {
        store: Arc::clone(&store),
        tokens: Arc::clone(&tokens),
        ratelimit: Arc::new(RateLimiter::new()),
        engine: Arc::clone(&engine),
        live: live.clone(),
        mailer: mailer_arc,
        base_url: BASE_URL.to_string(),
        secure_cookies: false,
        test_mode: false,
    };

    TestApp {
        store,
        engine,
        live,
        mailer,
        tokens,
        state,
    }
}

impl TestApp {
    /// Fresh anonymous voter: a new device identity per call.
    pub fn anon_voter(&self) -> VoterIdentity {
        IdentityResolver::new(&self.tokens).resolve(None, None, "test-agent", chrono::Utc::now())
    }

    pub async fn create_poll(
        &self,
        kind: PollKind,
        flags: PollFlags,
        options: Vec<NewOption>,
    ) -> PollAggregate {
        self.store
            .create_poll(
                NewPoll {
                    kind,
                    title: "Test poll".into(),
                    description: None,
                    creator_user_id: None,
                    creator_email: Some("creator@example.test".into()),
                    expires_at: None,
                    flags,
                    expiry_reminder: ExpiryReminder::default(),
                    is_test_data: false,
                },
                options,
            )
            .await
            .expect("create poll")
    }
}

pub fn text_option(text: &str) -> NewOption {
    NewOption {
        text: text.into(),
        start_time: None,
        end_time: None,
        max_capacity: None,
        position: None,
    }
}

pub fn capped_option(text: &str, capacity: i64) -> NewOption {
    NewOption {
        text: text.into(),
        start_time: None,
        end_time: None,
        max_capacity: Some(capacity),
        position: None,
    }
}
