//! Row structs mirroring the SQLite schema and their domain conversions.
//!
//! The store keeps ids as TEXT and timestamps as unix milliseconds; these
//! types translate to the richer domain model. A row that fails to parse is
//! a corrupt database and surfaces as a decode error.

use chrono::{DateTime, Utc};
use sqlx::FromRow;
use uuid::Uuid;

use crate::model::{
    ExpiryReminder, NotificationKind, NotificationLog, Poll, PollFlags, PollKind, PollOption,
    User, Vote, VoteResponse,
};

pub(crate) fn ts(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

pub(crate) fn from_ts(millis: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_millis(millis).unwrap_or_default()
}

fn decode_err(message: String) -> sqlx::Error {
    sqlx::Error::Decode(message.into())
}

#[derive(Debug, FromRow)]
pub(crate) struct PollRow {
    pub id: String,
    pub kind: String,
    pub title: String,
    pub description: Option<String>,
    pub creator_user_id: Option<i64>,
    pub creator_email: Option<String>,
    pub admin_token: String,
    pub public_token: String,
    pub is_active: i64,
    pub expires_at: Option<i64>,
    pub allow_vote_edit: i64,
    pub allow_vote_withdrawal: i64,
    pub allow_multiple_slots: i64,
    pub allow_maybe: i64,
    pub results_public: i64,
    pub final_option_id: Option<i64>,
    pub reminder_enabled: i64,
    pub reminder_hours_before: i64,
    pub reminder_sent: i64,
    pub created_at: i64,
    pub updated_at: i64,
    pub is_test_data: i64,
}

impl PollRow {
    pub fn into_poll(self) -> Result<Poll, sqlx::Error> {
        let id = Uuid::parse_str(&self.id)
            .map_err(|e| decode_err(format!("bad poll id {:?}: {}", self.id, e)))?;
        let kind = PollKind::parse(&self.kind)
            .ok_or_else(|| decode_err(format!("bad poll kind {:?}", self.kind)))?;

        Ok(Poll {
            id,
            kind,
            title: self.title,
            description: self.description,
            creator_user_id: self.creator_user_id,
            creator_email: self.creator_email,
            admin_token: self.admin_token,
            public_token: self.public_token,
            is_active: self.is_active != 0,
            expires_at: self.expires_at.map(from_ts),
            flags: PollFlags {
                allow_vote_edit: self.allow_vote_edit != 0,
                allow_vote_withdrawal: self.allow_vote_withdrawal != 0,
                allow_multiple_slots: self.allow_multiple_slots != 0,
                allow_maybe: self.allow_maybe != 0,
                results_public: self.results_public != 0,
            },
            final_option_id: self.final_option_id,
            expiry_reminder: ExpiryReminder {
                enabled: self.reminder_enabled != 0,
                hours_before: self.reminder_hours_before,
                sent: self.reminder_sent != 0,
            },
            created_at: from_ts(self.created_at),
            updated_at: from_ts(self.updated_at),
            is_test_data: self.is_test_data != 0,
        })
    }
}

#[derive(Debug, FromRow)]
pub(crate) struct OptionRow {
    pub id: i64,
    pub poll_id: String,
    pub text: String,
    pub start_time: Option<i64>,
    pub end_time: Option<i64>,
    pub max_capacity: Option<i64>,
    pub position: i64,
}

impl OptionRow {
    pub fn into_option(self) -> Result<PollOption, sqlx::Error> {
        let poll_id = Uuid::parse_str(&self.poll_id)
            .map_err(|e| decode_err(format!("bad poll id {:?}: {}", self.poll_id, e)))?;
        Ok(PollOption {
            id: self.id,
            poll_id,
            text: self.text,
            start_time: self.start_time.map(from_ts),
            end_time: self.end_time.map(from_ts),
            max_capacity: self.max_capacity,
            position: self.position,
        })
    }
}

#[derive(Debug, FromRow)]
pub(crate) struct VoteRow {
    pub id: i64,
    pub poll_id: String,
    pub option_id: i64,
    pub voter_name: String,
    pub voter_email: String,
    pub user_id: Option<i64>,
    pub voter_key: String,
    pub response: String,
    pub comment: Option<String>,
    pub voter_edit_token: String,
    pub is_test_data: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

impl VoteRow {
    pub fn into_vote(self) -> Result<Vote, sqlx::Error> {
        let poll_id = Uuid::parse_str(&self.poll_id)
            .map_err(|e| decode_err(format!("bad poll id {:?}: {}", self.poll_id, e)))?;
        let response = VoteResponse::parse(&self.response)
            .ok_or_else(|| decode_err(format!("bad vote response {:?}", self.response)))?;
        Ok(Vote {
            id: self.id,
            poll_id,
            option_id: self.option_id,
            voter_name: self.voter_name,
            voter_email: self.voter_email,
            user_id: self.user_id,
            voter_key: self.voter_key,
            response,
            comment: self.comment,
            voter_edit_token: self.voter_edit_token,
            is_test_data: self.is_test_data != 0,
            created_at: from_ts(self.created_at),
            updated_at: from_ts(self.updated_at),
        })
    }
}

#[derive(Debug, FromRow)]
pub(crate) struct UserRow {
    pub id: i64,
    pub email: String,
    pub display_name: Option<String>,
    pub created_at: i64,
}

impl UserRow {
    pub fn into_user(self) -> User {
        User {
            id: self.id,
            email: self.email,
            display_name: self.display_name,
            created_at: from_ts(self.created_at),
        }
    }
}

#[derive(Debug, FromRow)]
pub(crate) struct NotificationRow {
    pub id: i64,
    pub poll_id: String,
    pub kind: String,
    pub recipient_email: String,
    pub created_at: i64,
}

impl NotificationRow {
    pub fn into_log(self) -> Result<NotificationLog, sqlx::Error> {
        let poll_id = Uuid::parse_str(&self.poll_id)
            .map_err(|e| decode_err(format!("bad poll id {:?}: {}", self.poll_id, e)))?;
        let kind = NotificationKind::parse(&self.kind)
            .ok_or_else(|| decode_err(format!("bad notification kind {:?}", self.kind)))?;
        Ok(NotificationLog {
            id: self.id,
            poll_id,
            kind,
            recipient_email: self.recipient_email,
            created_at: from_ts(self.created_at),
        })
    }
}
