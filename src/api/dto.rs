//! Request and response DTOs.
//!
//! Wire names are camelCase; request bodies carry `validator` rules and are
//! validated before any service call. Kind-specific option rules (schedule
//! needs time ranges, surveys forbid them, capacities are for organization
//! polls) live in [`validate_options_for_kind`] because they cut across
//! fields.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use validator::Validate;

use crate::error::AppError;
use crate::model::{Poll, PollAggregate, PollKind, PollOption, Vote, VoteResponse};

/// `Option<Option<T>>` pattern for PATCH bodies: absent = leave unchanged,
/// null = clear.
fn double_option<'de, T, D>(de: D) -> Result<Option<Option<T>>, D::Error>
where
    T: Deserialize<'de>,
    D: Deserializer<'de>,
{
    Option::<T>::deserialize(de).map(Some)
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CreatePollRequest {
    #[validate(length(min = 1, max = 200))]
    pub title: String,
    pub description: Option<String>,
    #[serde(rename = "type")]
    pub kind: PollKind,
    #[validate(email)]
    pub creator_email: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub enable_expiry_reminder: Option<bool>,
    #[validate(range(min = 1, max = 168))]
    pub expiry_reminder_hours: Option<i64>,
    pub allow_vote_edit: Option<bool>,
    pub allow_vote_withdrawal: Option<bool>,
    pub allow_multiple_slots: Option<bool>,
    pub allow_maybe: Option<bool>,
    pub results_public: Option<bool>,
    #[validate(length(min = 1), nested)]
    pub options: Vec<CreateOptionRequest>,
}

#[derive(Debug, Deserialize, Serialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CreateOptionRequest {
    #[validate(length(min = 1))]
    pub text: String,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    #[validate(range(min = 1))]
    pub max_capacity: Option<i64>,
    pub order: Option<i64>,
}

/// The cross-field option rules per poll kind.
pub fn validate_options_for_kind(
    kind: PollKind,
    options: &[CreateOptionRequest],
) -> Result<(), AppError> {
    for option in options {
        match kind {
            PollKind::Schedule => {
                if option.start_time.is_none() || option.end_time.is_none() {
                    return Err(AppError::validation(
                        "schedule options require startTime and endTime",
                    ));
                }
            }
            PollKind::Survey => {
                if option.start_time.is_some() || option.end_time.is_some() {
                    return Err(AppError::validation(
                        "survey options must not carry times",
                    ));
                }
            }
            PollKind::Organization => {}
        }
        if let (Some(start), Some(end)) = (option.start_time, option.end_time) {
            if end <= start {
                return Err(AppError::validation("endTime must be after startTime"));
            }
        }
        if option.max_capacity.is_some() && kind != PollKind::Organization {
            return Err(AppError::validation(
                "maxCapacity is only valid for organization polls",
            ));
        }
    }
    Ok(())
}

#[derive(Debug, Default, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct PatchPollRequest {
    #[validate(length(min = 1, max = 200))]
    pub title: Option<String>,
    #[serde(default, deserialize_with = "double_option")]
    pub description: Option<Option<String>>,
    pub is_active: Option<bool>,
    #[serde(default, deserialize_with = "double_option")]
    pub expires_at: Option<Option<DateTime<Utc>>>,
    pub enable_expiry_reminder: Option<bool>,
    #[validate(range(min = 1, max = 168))]
    pub expiry_reminder_hours: Option<i64>,
    pub allow_vote_edit: Option<bool>,
    pub allow_vote_withdrawal: Option<bool>,
    pub allow_multiple_slots: Option<bool>,
    pub allow_maybe: Option<bool>,
    pub results_public: Option<bool>,
}

impl PatchPollRequest {
    /// Apply onto a loaded poll. Only present fields change.
    pub fn apply(self, poll: &mut Poll) {
        if let Some(title) = self.title {
            poll.title = title;
        }
        if let Some(description) = self.description {
            poll.description = description;
        }
        if let Some(is_active) = self.is_active {
            poll.is_active = is_active;
        }
        if let Some(expires_at) = self.expires_at {
            poll.expires_at = expires_at;
        }
        if let Some(enabled) = self.enable_expiry_reminder {
            poll.expiry_reminder.enabled = enabled;
        }
        if let Some(hours) = self.expiry_reminder_hours {
            poll.expiry_reminder.hours_before = hours;
        }
        if let Some(v) = self.allow_vote_edit {
            poll.flags.allow_vote_edit = v;
        }
        if let Some(v) = self.allow_vote_withdrawal {
            poll.flags.allow_vote_withdrawal = v;
        }
        if let Some(v) = self.allow_multiple_slots {
            poll.flags.allow_multiple_slots = v;
        }
        if let Some(v) = self.allow_maybe {
            poll.flags.allow_maybe = v;
        }
        if let Some(v) = self.results_public {
            poll.flags.results_public = v;
        }
    }
}

#[derive(Debug, Default, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct PatchOptionRequest {
    #[validate(length(min = 1))]
    pub text: Option<String>,
    #[serde(default, deserialize_with = "double_option")]
    pub start_time: Option<Option<DateTime<Utc>>>,
    #[serde(default, deserialize_with = "double_option")]
    pub end_time: Option<Option<DateTime<Utc>>>,
    #[serde(default, deserialize_with = "double_option")]
    #[validate(custom(function = "validate_patch_capacity"))]
    pub max_capacity: Option<Option<i64>>,
}

fn validate_patch_capacity(
    value: i64,
) -> Result<(), validator::ValidationError> {
    if value < 1 {
        return Err(validator::ValidationError::new("max_capacity"));
    }
    Ok(())
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct FinalizeRequest {
    /// 0 clears the finalisation.
    #[validate(range(min = 0))]
    pub option_id: i64,
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct VoteBulkRequest {
    #[validate(length(min = 1))]
    pub voter_name: String,
    #[validate(email)]
    pub voter_email: String,
    #[validate(length(min = 1), nested)]
    pub votes: Vec<VoteItemRequest>,
}

#[derive(Debug, Deserialize, Serialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct VoteItemRequest {
    pub option_id: i64,
    pub response: VoteResponse,
    pub comment: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WithdrawRequest {
    pub voter_email: Option<String>,
    pub voter_edit_token: Option<String>,
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct EditVotesRequest {
    #[validate(length(min = 1), nested)]
    pub votes: Vec<VoteItemRequest>,
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct EmailCheckRequest {
    #[validate(email)]
    pub email: String,
}

/// Sanitised poll view for participants: settings and options, no admin
/// token, no votes.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicPollView {
    #[serde(flatten)]
    pub poll: Poll,
    pub options: Vec<PollOption>,
}

impl PublicPollView {
    pub fn from_aggregate(agg: &PollAggregate) -> Self {
        Self {
            poll: agg.poll.clone(),
            options: agg.options.clone(),
        }
    }
}

/// Full creator view: adds the admin token and raw votes.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdminPollView {
    #[serde(flatten)]
    pub poll: Poll,
    pub admin_token: String,
    pub options: Vec<PollOption>,
    pub votes: Vec<Vote>,
}

impl AdminPollView {
    pub fn from_aggregate(agg: &PollAggregate) -> Self {
        Self {
            poll: agg.poll.clone(),
            admin_token: agg.poll.admin_token.clone(),
            options: agg.options.clone(),
            votes: agg.votes.clone(),
        }
    }
}
