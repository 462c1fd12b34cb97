//! Fixed-window rate limiting for the public API.
//!
//! Counters are keyed by `(bucket, client key)` where the client key is an
//! IP, an email, or a combination chosen by the caller. Each bucket has a
//! window length and a request cap, overridable at runtime through admin
//! settings (`ratelimit.<bucket>.max_requests` / `.window_ms` / `.enabled`).
//!
//! The first request of a new window counts as #1; entries older than their
//! window are reaped by a periodic sweep. The login limiter is separate: it
//! tracks failed attempts and locks the identifier for a cooldown once the
//! cap is reached.
//!
//! State is in-process. A multi-process deployment would put a shared store
//! behind the same interface.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::RwLock;

/// Bucket names used by the API surface.
pub mod buckets {
    pub const REGISTRATION: &str = "registration";
    pub const PASSWORD_RESET: &str = "password-reset";
    pub const POLL_CREATION: &str = "poll-creation";
    pub const VOTE: &str = "vote";
    pub const EMAIL: &str = "email";
    pub const API_GENERAL: &str = "api-general";
    pub const EMAIL_CHECK: &str = "email-check";
}

/// Per-bucket configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketConfig {
    pub window_ms: i64,
    pub max_requests: u32,
    pub enabled: bool,
}

impl BucketConfig {
    const fn new(window_ms: i64, max_requests: u32) -> Self {
        Self {
            window_ms,
            max_requests,
            enabled: true,
        }
    }
}

/// Outcome of a rate-limit check. When `allowed` is false the caller must
/// answer 429 with `Retry-After` and the `X-RateLimit-*` headers.
#[derive(Debug, Clone, Copy)]
pub struct Decision {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    pub reset_at: DateTime<Utc>,
    pub retry_after_secs: Option<u64>,
}

impl Decision {
    fn open(limit: u32, now: DateTime<Utc>) -> Self {
        Self {
            allowed: true,
            limit,
            remaining: limit,
            reset_at: now,
            retry_after_secs: None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Window {
    started_at: DateTime<Utc>,
    count: u32,
}

/// Login limiter state for one identifier+IP key.
#[derive(Debug, Clone, Copy)]
struct LoginState {
    failed_attempts: u32,
    first_attempt: DateTime<Utc>,
    locked_until: Option<DateTime<Utc>>,
}

/// Login limiter outcome.
#[derive(Debug, Clone, Copy)]
pub struct LoginDecision {
    pub locked: bool,
    pub retry_after_secs: Option<u64>,
}

/// Login limiter configuration: attempts per window, then lockout.
#[derive(Debug, Clone, Copy)]
pub struct LoginLimitConfig {
    pub max_attempts: u32,
    pub window_ms: i64,
    pub cooldown_ms: i64,
}

impl Default for LoginLimitConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            window_ms: 15 * 60 * 1000,
            cooldown_ms: 15 * 60 * 1000,
        }
    }
}

/// Fixed-window rate limiter with runtime-configurable buckets.
pub struct RateLimiter {
    configs: RwLock<HashMap<String, BucketConfig>>,
    windows: DashMap<(String, String), Window>,
    login: DashMap<String, LoginState>,
    login_config: RwLock<LoginLimitConfig>,
}

impl RateLimiter {
    /// Create a limiter with the default bucket table.
    pub fn new() -> Self {
        let mut configs = HashMap::new();
        configs.insert(buckets::REGISTRATION.into(), BucketConfig::new(60 * 60 * 1000, 5));
        configs.insert(buckets::PASSWORD_RESET.into(), BucketConfig::new(15 * 60 * 1000, 3));
        configs.insert(buckets::POLL_CREATION.into(), BucketConfig::new(60 * 1000, 10));
        configs.insert(buckets::VOTE.into(), BucketConfig::new(10 * 1000, 30));
        configs.insert(buckets::EMAIL.into(), BucketConfig::new(60 * 1000, 5));
        configs.insert(buckets::API_GENERAL.into(), BucketConfig::new(60 * 1000, 100));
        configs.insert(buckets::EMAIL_CHECK.into(), BucketConfig::new(60 * 1000, 10));

        Self {
            configs: RwLock::new(configs),
            windows: DashMap::new(),
            login: DashMap::new(),
            login_config: RwLock::new(LoginLimitConfig::default()),
        }
    }

    /// Count a request against `bucket` for `key` and decide whether it may
    /// proceed.
    pub fn check(&self, bucket: &str, key: &str) -> Decision {
        self.check_at(bucket, key, Utc::now())
    }

    /// Clock-injected variant of [`check`](Self::check).
    pub fn check_at(&self, bucket: &str, key: &str, now: DateTime<Utc>) -> Decision {
        let config = {
            let configs = self.configs.read().unwrap();
            match configs.get(bucket) {
                Some(c) => *c,
                None => return Decision::open(u32::MAX, now),
            }
        };
        if !config.enabled {
            return Decision::open(config.max_requests, now);
        }

        let window_len = Duration::milliseconds(config.window_ms);
        let mut entry = self
            .windows
            .entry((bucket.to_string(), key.to_string()))
            .or_insert(Window {
                started_at: now,
                count: 0,
            });

        // Window rollover: the current request becomes #1 of the new window.
        if now - entry.started_at >= window_len {
            entry.started_at = now;
            entry.count = 0;
        }
        entry.count += 1;

        let reset_at = entry.started_at + window_len;
        let allowed = entry.count <= config.max_requests;
        let remaining = config.max_requests.saturating_sub(entry.count);
        let retry_after_secs = if allowed {
            None
        } else {
            Some(seconds_until(now, reset_at))
        };

        Decision {
            allowed,
            limit: config.max_requests,
            remaining,
            reset_at,
            retry_after_secs,
        }
    }

    /// Record a failed login for `key` (identifier + IP). Locks the key for
    /// the configured cooldown once the attempt cap is reached.
    pub fn record_login_failure(&self, key: &str) -> LoginDecision {
        self.record_login_failure_at(key, Utc::now())
    }

    pub fn record_login_failure_at(&self, key: &str, now: DateTime<Utc>) -> LoginDecision {
        let config = *self.login_config.read().unwrap();
        let window = Duration::milliseconds(config.window_ms);

        let mut entry = self.login.entry(key.to_string()).or_insert(LoginState {
            failed_attempts: 0,
            first_attempt: now,
            locked_until: None,
        });

        if let Some(until) = entry.locked_until {
            if now < until {
                return LoginDecision {
                    locked: true,
                    retry_after_secs: Some(seconds_until(now, until)),
                };
            }
            entry.locked_until = None;
            entry.failed_attempts = 0;
            entry.first_attempt = now;
        }

        if now - entry.first_attempt >= window {
            entry.failed_attempts = 0;
            entry.first_attempt = now;
        }
        entry.failed_attempts += 1;

        if entry.failed_attempts >= config.max_attempts {
            let until = now + Duration::milliseconds(config.cooldown_ms);
            entry.locked_until = Some(until);
            return LoginDecision {
                locked: true,
                retry_after_secs: Some(seconds_until(now, until)),
            };
        }

        LoginDecision {
            locked: false,
            retry_after_secs: None,
        }
    }

    /// Is `key` currently locked out of login?
    pub fn login_locked(&self, key: &str) -> Option<u64> {
        self.login_locked_at(key, Utc::now())
    }

    pub fn login_locked_at(&self, key: &str, now: DateTime<Utc>) -> Option<u64> {
        let entry = self.login.get(key)?;
        let until = entry.locked_until?;
        (now < until).then(|| seconds_until(now, until))
    }

    /// Successful login clears the failure record.
    pub fn clear_login(&self, key: &str) {
        self.login.remove(key);
    }

    /// Apply admin-settings overrides of the form
    /// `ratelimit.<bucket>.<max_requests|window_ms|enabled>`.
    pub fn apply_overrides(&self, settings: &HashMap<String, String>) {
        let mut configs = self.configs.write().unwrap();
        for (key, value) in settings {
            let Some(rest) = key.strip_prefix("ratelimit.") else {
                continue;
            };
            let Some((bucket, field)) = rest.rsplit_once('.') else {
                continue;
            };
            let Some(config) = configs.get_mut(bucket) else {
                continue;
            };
            match field {
                "max_requests" => {
                    if let Ok(v) = value.parse() {
                        config.max_requests = v;
                    }
                }
                "window_ms" => {
                    if let Ok(v) = value.parse() {
                        config.window_ms = v;
                    }
                }
                "enabled" => {
                    if let Ok(v) = value.parse() {
                        config.enabled = v;
                    }
                }
                _ => {}
            }
        }
    }

    /// Drop window entries older than their bucket's window and expired
    /// login records. Called from the periodic sweep.
    pub fn sweep(&self) {
        self.sweep_at(Utc::now());
    }

    pub fn sweep_at(&self, now: DateTime<Utc>) {
        let configs = self.configs.read().unwrap();
        self.windows.retain(|(bucket, _), window| {
            let Some(config) = configs.get(bucket) else {
                return false;
            };
            now - window.started_at < Duration::milliseconds(config.window_ms)
        });
        drop(configs);

        let login_config = *self.login_config.read().unwrap();
        self.login.retain(|_, state| match state.locked_until {
            Some(until) => now < until,
            None => now - state.first_attempt < Duration::milliseconds(login_config.window_ms),
        });
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

fn seconds_until(now: DateTime<Utc>, at: DateTime<Utc>) -> u64 {
    let ms = (at - now).num_milliseconds().max(0);
    ((ms + 999) / 1000) as u64
}
