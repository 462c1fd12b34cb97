//! Outbound email, as a trait seam.
//!
//! SMTP delivery is an external collaborator; the core only enqueues. Every
//! send is fire-and-forget relative to the user request: failures are
//! logged, never surfaced as API errors. [`MockMailer`] records sends for
//! tests.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use uuid::Uuid;

use crate::model::NotificationKind;

/// One outbound message.
#[derive(Debug, Clone)]
pub struct OutboundEmail {
    pub poll_id: Uuid,
    pub kind: NotificationKind,
    pub to: String,
    pub subject: String,
    pub body: String,
}

#[derive(Debug, Error)]
pub enum MailerError {
    #[error("transport error: {0}")]
    Transport(String),
}

/// Email sink abstraction. Implementations must be cheap to clone behind an
/// `Arc` and safe to call concurrently.
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, email: OutboundEmail) -> Result<(), MailerError>;
}

/// Default sink: structured log lines instead of SMTP. Deployments plug a
/// real transport in behind the same trait.
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn send(&self, email: OutboundEmail) -> Result<(), MailerError> {
        tracing::info!(
            poll_id = %email.poll_id,
            kind = email.kind.as_str(),
            to = %email.to,
            subject = %email.subject,
            "outbound email"
        );
        Ok(())
    }
}

/// Records sends for assertions.
#[derive(Clone, Default)]
pub struct MockMailer {
    sent: Arc<Mutex<Vec<OutboundEmail>>>,
}

impl MockMailer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<OutboundEmail> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_to(&self, to: &str) -> usize {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.to == to)
            .count()
    }
}

#[async_trait]
impl Mailer for MockMailer {
    async fn send(&self, email: OutboundEmail) -> Result<(), MailerError> {
        self.sent.lock().unwrap().push(email);
        Ok(())
    }
}

/// Per-(poll, email) cooldown for voter-confirmation mail, so rapid edits do
/// not hammer an inbox. In-memory, swept periodically.
pub struct EmailCooldowns {
    window: Duration,
    last_sent: DashMap<(Uuid, String), DateTime<Utc>>,
}

impl EmailCooldowns {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last_sent: DashMap::new(),
        }
    }

    /// True when a send is allowed now; arms the cooldown as a side effect.
    pub fn check_and_arm(&self, poll_id: Uuid, email: &str, now: DateTime<Utc>) -> bool {
        let key = (poll_id, email.to_string());
        let mut entry = self.last_sent.entry(key).or_insert(now - self.window);
        if now - *entry < self.window {
            return false;
        }
        *entry = now;
        true
    }

    /// Drop entries past their window.
    pub fn sweep(&self, now: DateTime<Utc>) {
        let window = self.window;
        self.last_sent.retain(|_, sent_at| now - *sent_at < window);
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.last_sent.len()
    }
}
