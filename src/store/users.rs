//! Users, sessions, admin settings, notification logs and one-shot tokens.
//!
//! Account management (registration, password reset, OIDC) is an external
//! collaborator; the core only needs to resolve sessions to users, check
//! email ownership, and house-keep the collaborator's one-shot tokens.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use uuid::Uuid;

use super::rows::{from_ts, ts, NotificationRow, UserRow};
use super::PollStore;
use crate::model::{normalize_email, NotificationKind, NotificationLog, User};
use crate::token::mint_url_token;

impl PollStore {
    pub async fn create_user(
        &self,
        email: &str,
        display_name: Option<&str>,
    ) -> Result<User, sqlx::Error> {
        let email = normalize_email(email);
        let now = Utc::now();
        let result = sqlx::query(
            "INSERT INTO users (email, display_name, created_at) VALUES (?, ?, ?)",
        )
        .bind(&email)
        .bind(display_name)
        .bind(ts(now))
        .execute(&self.pool)
        .await?;

        Ok(User {
            id: result.last_insert_rowid(),
            email,
            display_name: display_name.map(str::to_string),
            created_at: now,
        })
    }

    pub async fn user_by_email(&self, email: &str) -> Result<Option<User>, sqlx::Error> {
        let row = sqlx::query_as::<_, UserRow>("SELECT * FROM users WHERE email = ?")
            .bind(normalize_email(email))
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(UserRow::into_user))
    }

    pub async fn user_by_id(&self, id: i64) -> Result<Option<User>, sqlx::Error> {
        let row = sqlx::query_as::<_, UserRow>("SELECT * FROM users WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(UserRow::into_user))
    }

    /// Mint a session for a user. The auth collaborator calls this after it
    /// has verified credentials; tests use it directly.
    pub async fn create_session(
        &self,
        user_id: i64,
        ttl: Duration,
    ) -> Result<String, sqlx::Error> {
        let token = mint_url_token();
        sqlx::query("INSERT INTO sessions (token, user_id, expires_at) VALUES (?, ?, ?)")
            .bind(&token)
            .bind(user_id)
            .bind(ts(Utc::now() + ttl))
            .execute(&self.pool)
            .await?;
        Ok(token)
    }

    pub async fn user_by_session(&self, token: &str) -> Result<Option<User>, sqlx::Error> {
        let row = sqlx::query_as::<_, UserRow>(
            "SELECT u.* FROM users u JOIN sessions s ON s.user_id = u.id
             WHERE s.token = ? AND s.expires_at > ?",
        )
        .bind(token)
        .bind(ts(Utc::now()))
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(UserRow::into_user))
    }

    pub async fn settings_all(&self) -> Result<HashMap<String, String>, sqlx::Error> {
        let rows = sqlx::query_as::<_, (String, String)>("SELECT key, value FROM settings")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.into_iter().collect())
    }

    pub async fn setting_set(&self, key: &str, value: &str) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO settings (key, value) VALUES (?, ?)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn log_notification(
        &self,
        poll_id: Uuid,
        kind: NotificationKind,
        recipient_email: &str,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "INSERT INTO notification_logs (poll_id, kind, recipient_email, created_at)
             VALUES (?, ?, ?, ?)",
        )
        .bind(poll_id.to_string())
        .bind(kind.as_str())
        .bind(normalize_email(recipient_email))
        .bind(ts(Utc::now()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn notification_count(
        &self,
        poll_id: Uuid,
        kind: NotificationKind,
    ) -> Result<i64, sqlx::Error> {
        sqlx::query_scalar(
            "SELECT COUNT(*) FROM notification_logs WHERE poll_id = ? AND kind = ?",
        )
        .bind(poll_id.to_string())
        .bind(kind.as_str())
        .fetch_one(&self.pool)
        .await
    }

    pub async fn latest_notification_at(
        &self,
        poll_id: Uuid,
        kind: NotificationKind,
    ) -> Result<Option<DateTime<Utc>>, sqlx::Error> {
        let latest: Option<i64> = sqlx::query_scalar(
            "SELECT MAX(created_at) FROM notification_logs WHERE poll_id = ? AND kind = ?",
        )
        .bind(poll_id.to_string())
        .bind(kind.as_str())
        .fetch_one(&self.pool)
        .await?;
        Ok(latest.map(from_ts))
    }

    pub async fn notifications_for_poll(
        &self,
        poll_id: Uuid,
    ) -> Result<Vec<NotificationLog>, sqlx::Error> {
        sqlx::query_as::<_, NotificationRow>(
            "SELECT * FROM notification_logs WHERE poll_id = ? ORDER BY created_at, id",
        )
        .bind(poll_id.to_string())
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(NotificationRow::into_log)
        .collect()
    }

    /// Insert a one-shot token on behalf of the auth collaborator.
    pub async fn insert_one_shot_token(
        &self,
        table: OneShotTokenKind,
        token: &str,
        user_id: i64,
        payload: Option<&str>,
        expires_at: DateTime<Utc>,
    ) -> Result<(), sqlx::Error> {
        let sql = match table {
            OneShotTokenKind::PasswordReset => {
                "INSERT INTO password_reset_tokens (token, user_id, payload, expires_at) VALUES (?, ?, ?, ?)"
            }
            OneShotTokenKind::EmailChange => {
                "INSERT INTO email_change_tokens (token, user_id, payload, expires_at) VALUES (?, ?, ?, ?)"
            }
        };
        sqlx::query(sql)
            .bind(token)
            .bind(user_id)
            .bind(payload)
            .bind(ts(expires_at))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Remove expired password-reset and email-change tokens. Returns the
    /// number purged; called from the periodic sweep.
    pub async fn purge_expired_one_shot_tokens(
        &self,
        now: DateTime<Utc>,
    ) -> Result<u64, sqlx::Error> {
        let mut purged = 0;
        for sql in [
            "DELETE FROM password_reset_tokens WHERE expires_at <= ?",
            "DELETE FROM email_change_tokens WHERE expires_at <= ?",
        ] {
            purged += sqlx::query(sql)
                .bind(ts(now))
                .execute(&self.pool)
                .await?
                .rows_affected();
        }
        Ok(purged)
    }
}

/// Which one-shot token table an insert targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OneShotTokenKind {
    PasswordReset,
    EmailChange,
}
