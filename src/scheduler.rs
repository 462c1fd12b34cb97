//! Periodic housekeeping: expiry reminders, token purges, map sweeps.
//!
//! One tokio task ticks roughly every minute. Each tick is independent and
//! idempotent; the reminder flag is claimed atomically, so overlapping
//! processes would not double-send.
//!
//! The manual-reminder guard lives here too; the API handler consults it
//! before sending a creator-triggered reminder.

use chrono::{DateTime, Duration, Utc};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::live::LiveDispatcher;
use crate::mailer::{EmailCooldowns, Mailer, OutboundEmail};
use crate::model::{NotificationKind, Poll};
use crate::ratelimit::RateLimiter;
use crate::store::PollStore;

/// Creators may trigger at most this many manual reminders per poll.
pub const MAX_MANUAL_REMINDERS: i64 = 3;

/// Minimum spacing between manual reminders, in seconds (4 hours).
pub const MANUAL_REMINDER_MIN_GAP_SECS: i64 = 4 * 3600;

/// Why a manual reminder is currently blocked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReminderBlock {
    LimitReached,
    TooSoon { retry_after_secs: u64 },
}

/// Check the manual-reminder caps for a poll against the notification log.
pub async fn manual_reminder_block(
    store: &PollStore,
    poll_id: Uuid,
    now: DateTime<Utc>,
) -> Result<Option<ReminderBlock>, sqlx::Error> {
    let sent = store
        .notification_count(poll_id, NotificationKind::ManualReminder)
        .await?;
    if sent >= MAX_MANUAL_REMINDERS {
        return Ok(Some(ReminderBlock::LimitReached));
    }

    if let Some(last) = store
        .latest_notification_at(poll_id, NotificationKind::ManualReminder)
        .await?
    {
        let min_gap = Duration::seconds(MANUAL_REMINDER_MIN_GAP_SECS);
        let elapsed = now - last;
        if elapsed < min_gap {
            let wait = (min_gap - elapsed).num_seconds().max(1) as u64;
            return Ok(Some(ReminderBlock::TooSoon {
                retry_after_secs: wait,
            }));
        }
    }
    Ok(None)
}

/// The periodic sweeper.
pub struct Scheduler {
    store: Arc<PollStore>,
    mailer: Arc<dyn Mailer>,
    ratelimit: Arc<RateLimiter>,
    cooldowns: Arc<EmailCooldowns>,
    live: LiveDispatcher,
    tick: std::time::Duration,
}

impl Scheduler {
    pub fn new(
        store: Arc<PollStore>,
        mailer: Arc<dyn Mailer>,
        ratelimit: Arc<RateLimiter>,
        cooldowns: Arc<EmailCooldowns>,
        live: LiveDispatcher,
        tick: std::time::Duration,
    ) -> Self {
        Self {
            store,
            mailer,
            ratelimit,
            cooldowns,
            live,
            tick,
        }
    }

    /// Start the background task. Runs until the handle is aborted.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.tick);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                if let Err(err) = self.run_once(Utc::now()).await {
                    warn!(error = %err, "scheduler tick failed");
                }
            }
        })
    }

    /// One tick: reminders, purges, sweeps, settings refresh. Public for
    /// tests.
    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<(), sqlx::Error> {
        self.send_expiry_reminders(now).await?;

        // Admin settings may change bucket configs at runtime.
        self.ratelimit.apply_overrides(&self.store.settings_all().await?);

        let purged = self.store.purge_expired_one_shot_tokens(now).await?;
        if purged > 0 {
            debug!(purged, "expired one-shot tokens removed");
        }

        self.ratelimit.sweep_at(now);
        self.cooldowns.sweep(now);
        self.live.sweep();
        self.store.locks().sweep();
        Ok(())
    }

    async fn send_expiry_reminders(&self, now: DateTime<Utc>) -> Result<(), sqlx::Error> {
        for poll in self.store.polls_needing_expiry_reminder(now).await? {
            // Claim before sending; a concurrent tick loses the claim and
            // skips.
            if !self.store.mark_reminder_sent(poll.id).await? {
                continue;
            }
            info!(poll_id = %poll.id, "sending expiry reminder");
            self.remind_participants(&poll).await?;
        }
        Ok(())
    }

    async fn remind_participants(&self, poll: &Poll) -> Result<(), sqlx::Error> {
        let Some(agg) = self.store.poll_by_id(poll.id).await? else {
            return Ok(());
        };

        let mut recipients: BTreeSet<String> = agg
            .votes
            .iter()
            .map(|v| v.voter_email.clone())
            .filter(|e| !e.is_empty())
            .collect();
        if let Some(creator) = &poll.creator_email {
            recipients.insert(creator.clone());
        }

        let expires = poll
            .expires_at
            .map(|at| at.format("%Y-%m-%d %H:%M UTC").to_string())
            .unwrap_or_default();

        for recipient in recipients {
            let email = OutboundEmail {
                poll_id: poll.id,
                kind: NotificationKind::ExpiryReminder,
                to: recipient.clone(),
                subject: format!("\"{}\" closes soon", poll.title),
                body: format!(
                    "The poll \"{}\" closes at {}.\nCast or review your votes before then.\n",
                    poll.title, expires
                ),
            };
            if let Err(err) = self.mailer.send(email).await {
                warn!(poll_id = %poll.id, error = %err, "expiry reminder failed");
                continue;
            }
            self.store
                .log_notification(poll.id, NotificationKind::ExpiryReminder, &recipient)
                .await?;
        }
        Ok(())
    }
}
