//! Domain model for polls, options and votes.
//!
//! Three poll kinds share one schema:
//! - `schedule`: options are time ranges, voters pick the ones they can make
//! - `survey`: options are free-form labels
//! - `organization`: capacity-limited signup sheet
//!
//! All timestamps are UTC. Identifiers are opaque: polls use UUIDs, options
//! and votes use row ids local to the store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Poll kind discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PollKind {
    Schedule,
    Survey,
    Organization,
}

impl PollKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PollKind::Schedule => "schedule",
            PollKind::Survey => "survey",
            PollKind::Organization => "organization",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "schedule" => Some(PollKind::Schedule),
            "survey" => Some(PollKind::Survey),
            "organization" => Some(PollKind::Organization),
            _ => None,
        }
    }
}

/// A voter's answer for one option.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VoteResponse {
    Yes,
    Maybe,
    No,
}

impl VoteResponse {
    pub fn as_str(&self) -> &'static str {
        match self {
            VoteResponse::Yes => "yes",
            VoteResponse::Maybe => "maybe",
            VoteResponse::No => "no",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "yes" => Some(VoteResponse::Yes),
            "maybe" => Some(VoteResponse::Maybe),
            "no" => Some(VoteResponse::No),
            _ => None,
        }
    }
}

/// Behaviour flags set by the poll creator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PollFlags {
    pub allow_vote_edit: bool,
    pub allow_vote_withdrawal: bool,
    pub allow_multiple_slots: bool,
    pub allow_maybe: bool,
    pub results_public: bool,
}

impl Default for PollFlags {
    fn default() -> Self {
        Self {
            allow_vote_edit: false,
            allow_vote_withdrawal: false,
            allow_multiple_slots: false,
            allow_maybe: false,
            results_public: true,
        }
    }
}

/// Expiry-reminder settings and send state. Wire names carry the
/// `expiryReminder` prefix because the struct is flattened into the poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ExpiryReminder {
    #[serde(rename = "enableExpiryReminder")]
    pub enabled: bool,
    #[serde(rename = "expiryReminderHours")]
    pub hours_before: i64,
    #[serde(rename = "expiryReminderSent")]
    pub sent: bool,
}

/// A poll with its settings. Options and votes live in their own tables and
/// are loaded eagerly into a [`PollAggregate`] by the store.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Poll {
    pub id: Uuid,
    pub kind: PollKind,
    pub title: String,
    pub description: Option<String>,
    pub creator_user_id: Option<i64>,
    pub creator_email: Option<String>,
    #[serde(skip_serializing)]
    pub admin_token: String,
    pub public_token: String,
    pub is_active: bool,
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub flags: PollFlags,
    pub final_option_id: Option<i64>,
    #[serde(flatten)]
    pub expiry_reminder: ExpiryReminder,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing)]
    pub is_test_data: bool,
}

impl Poll {
    /// A poll is closed once deactivated or past its expiry. Closed polls
    /// reject every vote mutation.
    pub fn is_closed(&self, now: DateTime<Utc>) -> bool {
        !self.is_active || self.expires_at.is_some_and(|at| now >= at)
    }

    /// Why the poll is closed, if it is. Distinguishes the two wire errors.
    pub fn closed_reason(&self, now: DateTime<Utc>) -> Option<ClosedReason> {
        if !self.is_active {
            Some(ClosedReason::Inactive)
        } else if self.expires_at.is_some_and(|at| now >= at) {
            Some(ClosedReason::Expired)
        } else {
            None
        }
    }
}

/// Why a closed poll rejects mutations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClosedReason {
    Inactive,
    Expired,
}

/// One choice within a poll.
///
/// `start_time`/`end_time` are required for schedule polls, forbidden for
/// surveys and optional for organization polls. `max_capacity` caps yes-votes
/// on organization options. `position` is insertion-ordered but not dense.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PollOption {
    pub id: i64,
    #[serde(skip_serializing)]
    pub poll_id: Uuid,
    pub text: String,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub max_capacity: Option<i64>,
    pub position: i64,
}

/// A single (voter, option) response row.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Vote {
    pub id: i64,
    pub poll_id: Uuid,
    pub option_id: i64,
    pub voter_name: String,
    pub voter_email: String,
    pub user_id: Option<i64>,
    pub voter_key: String,
    pub response: VoteResponse,
    pub comment: Option<String>,
    #[serde(skip_serializing)]
    pub voter_edit_token: String,
    #[serde(skip_serializing)]
    pub is_test_data: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A poll with its options and votes eagerly loaded.
#[derive(Debug, Clone)]
pub struct PollAggregate {
    pub poll: Poll,
    pub options: Vec<PollOption>,
    pub votes: Vec<Vote>,
}

impl PollAggregate {
    pub fn option(&self, option_id: i64) -> Option<&PollOption> {
        self.options.iter().find(|o| o.id == option_id)
    }
}

/// Registered user, as far as the polling core needs one: a stable id and a
/// verified email for the ownership rule. Account management lives elsewhere.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: i64,
    pub email: String,
    pub display_name: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Outbound notification categories, logged for reminder-cap enforcement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    ManualReminder,
    ExpiryReminder,
    Creation,
    VoterConfirmation,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::ManualReminder => "manual_reminder",
            NotificationKind::ExpiryReminder => "expiry_reminder",
            NotificationKind::Creation => "creation",
            NotificationKind::VoterConfirmation => "voter_confirmation",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "manual_reminder" => Some(NotificationKind::ManualReminder),
            "expiry_reminder" => Some(NotificationKind::ExpiryReminder),
            "creation" => Some(NotificationKind::Creation),
            "voter_confirmation" => Some(NotificationKind::VoterConfirmation),
            _ => None,
        }
    }
}

/// One logged outbound email.
#[derive(Debug, Clone)]
pub struct NotificationLog {
    pub id: i64,
    pub poll_id: Uuid,
    pub kind: NotificationKind,
    pub recipient_email: String,
    pub created_at: DateTime<Utc>,
}

/// Lower-cases an email for storage and comparison. All email equality in
/// the system is case-insensitive; normalisation happens once, at the
/// boundary.
pub fn normalize_email(email: &str) -> String {
    email.trim().to_ascii_lowercase()
}
