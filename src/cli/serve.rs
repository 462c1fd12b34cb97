//! `ballotbox serve`: wire the services together and run the HTTP server.

use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::api::{self, AppState};
use crate::config::AppConfig;
use crate::engine::VoteEngine;
use crate::live::LiveDispatcher;
use crate::mailer::{EmailCooldowns, LogMailer, Mailer};
use crate::ratelimit::RateLimiter;
use crate::scheduler::Scheduler;
use crate::store::PollStore;
use crate::token::TokenService;

pub async fn execute(config_path: Option<PathBuf>) -> Result<(), Box<dyn std::error::Error>> {
    let config_path = config_path.unwrap_or_else(super::default_config_path);
    let config = AppConfig::load(&config_path)?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_new(&config.logging.level).unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let store = Arc::new(PollStore::open(&config.database.path).await?);

    // Admin-settings overrides (rate buckets) are applied at startup and on
    // every scheduler tick thereafter.
    let ratelimit = Arc::new(RateLimiter::new());
    ratelimit.apply_overrides(&store.settings_all().await?);

    let tokens = Arc::new(TokenService::new(&config.master_secret_bytes()));
    let live = LiveDispatcher::new();
    let mailer: Arc<dyn Mailer> = Arc::new(LogMailer);
    let cooldowns = Arc::new(EmailCooldowns::new(config.confirmation_cooldown()?));

    let engine = Arc::new(VoteEngine::new(
        Arc::clone(&store),
        live.clone(),
        Arc::clone(&mailer),
        Arc::clone(&cooldowns),
        config.server.base_url.clone(),
    ));

    let scheduler = Scheduler::new(
        Arc::clone(&store),
        Arc::clone(&mailer),
        Arc::clone(&ratelimit),
        Arc::clone(&cooldowns),
        live.clone(),
        config.tick()?,
    );
    let _scheduler_handle = scheduler.spawn();

    let state = AppState {
        store,
        tokens,
        ratelimit,
        engine,
        live,
        mailer,
        base_url: config.server.base_url.clone(),
        secure_cookies: config.https_base_url(),
        test_mode: config.security.test_mode,
    };
    let app = api::router(state);

    let listener = tokio::net::TcpListener::bind(&config.server.bind).await?;
    info!(bind = %config.server.bind, base_url = %config.server.base_url, "listening");
    axum::serve(listener, app).await?;
    Ok(())
}
