//! The vote engine: transactional create/update/withdraw with capacity,
//! dedup and edit rules.
//!
//! All writes for one voter in one poll serialise on an advisory lock keyed
//! by the poll and the voter's email (or voter key when no email is in
//! play). Inside the lock, a transaction first takes the poll row's write
//! lock, so every count it performs (capacity, single-slot, duplicates) is
//! stable until commit.
//!
//! Rejections are values ([`VoteRejection`]), not errors: the HTTP layer
//! maps them to statuses and wire codes. A per-item rejection mid-bulk
//! commits the items applied before it and then reports the rejection.
//!
//! Side effects (broadcasts, confirmation email) run only after commit.

use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::identity::VoterIdentity;
use crate::live::{LiveDispatcher, LiveMessage, SlotStatus};
use crate::mailer::{EmailCooldowns, Mailer, OutboundEmail};
use crate::model::{
    normalize_email, ClosedReason, NotificationKind, Poll, PollAggregate, PollKind, Vote,
    VoteResponse,
};
use crate::store::{votes, voter_lock_key, PollStore};
use crate::token::mint_url_token;

/// One option's worth of a bulk vote.
#[derive(Debug, Clone)]
pub struct VoteItem {
    pub option_id: i64,
    pub response: VoteResponse,
    pub comment: Option<String>,
}

/// A bulk vote submission, identity already resolved.
#[derive(Debug, Clone)]
pub struct BulkVote {
    pub voter_name: String,
    pub voter_email: String,
    pub items: Vec<VoteItem>,
    pub is_test_data: bool,
}

/// Successful submission: the applied rows and, when the poll allows edits,
/// the voter's edit token.
#[derive(Debug, Clone)]
pub struct VoteReceipt {
    pub votes: Vec<Vote>,
    pub voter_edit_token: Option<String>,
}

/// Why a submission (or one of its items) was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VoteRejection {
    PollNotFound,
    PollInactive,
    PollExpired,
    UnknownOption { option_id: i64 },
    MaybeNotAllowed,
    RequiresLogin,
    EmailBelongsToAnotherUser,
    AlreadyVoted,
    DuplicateEmailVote,
    SlotFull { option_id: i64 },
    AlreadySignedUp { option_id: i64 },
    EditingNotAllowed,
    WithdrawalNotAllowed,
    NoVotesFound,
}

#[derive(Debug, Error)]
pub enum VoteError {
    #[error("vote rejected")]
    Rejected(VoteRejection),
    #[error(transparent)]
    Db(#[from] sqlx::Error),
}

impl From<VoteRejection> for VoteError {
    fn from(rejection: VoteRejection) -> Self {
        VoteError::Rejected(rejection)
    }
}

/// The transactional writer for votes. Handlers call this; nothing else
/// touches vote rows.
pub struct VoteEngine {
    store: Arc<PollStore>,
    live: LiveDispatcher,
    mailer: Arc<dyn Mailer>,
    cooldowns: Arc<EmailCooldowns>,
    base_url: String,
}

impl VoteEngine {
    pub fn new(
        store: Arc<PollStore>,
        live: LiveDispatcher,
        mailer: Arc<dyn Mailer>,
        cooldowns: Arc<EmailCooldowns>,
        base_url: String,
    ) -> Self {
        Self {
            store,
            live,
            mailer,
            cooldowns,
            base_url,
        }
    }

    /// Submit a bulk vote against a poll's public token.
    pub async fn submit(
        &self,
        public_token: &str,
        identity: &VoterIdentity,
        bulk: BulkVote,
    ) -> Result<VoteReceipt, VoteError> {
        let agg = self
            .store
            .poll_by_public_token(public_token)
            .await?
            .ok_or(VoteRejection::PollNotFound)?;

        self.check_open(&agg.poll)?;
        self.check_items(&agg, &bulk.items)?;
        let user_id = self.check_email_ownership(identity, &bulk.voter_email).await?;

        let email = normalize_email(&bulk.voter_email);
        let lock_identity = if email.is_empty() {
            identity.key.as_string()
        } else {
            email.clone()
        };
        let _guard = self
            .store
            .locks()
            .acquire(voter_lock_key(agg.poll.id, &lock_identity))
            .await;

        let mut tx = self.store.begin().await?;
        crate::store::touch_poll(&mut tx, agg.poll.id).await?;

        let existing = votes::votes_by_poll_and_email(&mut tx, agg.poll.id, &email).await?;
        if !existing.is_empty() && !agg.poll.flags.allow_vote_edit {
            // Surveys report the duplicate-email variant; the other kinds
            // the generic one.
            let rejection = if agg.poll.kind == PollKind::Survey {
                VoteRejection::DuplicateEmailVote
            } else {
                VoteRejection::AlreadyVoted
            };
            return Err(rejection.into());
        }

        let edit_token = existing
            .first()
            .map(|v| v.voter_edit_token.clone())
            .unwrap_or_else(mint_url_token);
        let mut by_option: HashMap<i64, Vote> =
            existing.into_iter().map(|v| (v.option_id, v)).collect();

        let mut applied = Vec::with_capacity(bulk.items.len());
        let mut rejection = None;

        for item in &bulk.items {
            match self
                .apply_item(&mut tx, &agg, &bulk, &email, user_id, identity, &edit_token, &mut by_option, item)
                .await?
            {
                Ok(vote) => applied.push(vote),
                Err(item_rejection) => {
                    rejection = Some(item_rejection);
                    break;
                }
            }
        }

        // Partial success: items applied before a capacity rejection stay
        // committed.
        tx.commit().await?;

        if !applied.is_empty() {
            self.broadcast_after_commit(&agg.poll).await;
        }

        if let Some(rejection) = rejection {
            return Err(rejection.into());
        }

        self.enqueue_confirmation(&agg.poll, &bulk.voter_name, &email, &edit_token);

        Ok(VoteReceipt {
            votes: applied,
            voter_edit_token: agg.poll.flags.allow_vote_edit.then_some(edit_token),
        })
    }

    /// Re-apply votes through an edit token (`PUT /votes/edit/:token`).
    /// Same per-item semantics as a submission, minus the already-voted
    /// check.
    pub async fn update_by_edit_token(
        &self,
        edit_token: &str,
        items: Vec<VoteItem>,
    ) -> Result<VoteReceipt, VoteError> {
        let owned = self.store.votes_by_edit_token(edit_token).await?;
        let first = owned.first().ok_or(VoteRejection::NoVotesFound)?;

        let agg = self
            .store
            .poll_by_id(first.poll_id)
            .await?
            .ok_or(VoteRejection::PollNotFound)?;
        self.check_open(&agg.poll)?;
        if !agg.poll.flags.allow_vote_edit {
            return Err(VoteRejection::EditingNotAllowed.into());
        }
        self.check_items(&agg, &items)?;

        let email = first.voter_email.clone();
        let voter_name = first.voter_name.clone();
        let user_id = first.user_id;
        let voter_key = first.voter_key.clone();

        let _guard = self
            .store
            .locks()
            .acquire(voter_lock_key(agg.poll.id, &email))
            .await;

        let mut tx = self.store.begin().await?;
        crate::store::touch_poll(&mut tx, agg.poll.id).await?;

        let existing = votes::votes_by_poll_and_email(&mut tx, agg.poll.id, &email).await?;
        let mut by_option: HashMap<i64, Vote> =
            existing.into_iter().map(|v| (v.option_id, v)).collect();

        let bulk = BulkVote {
            voter_name,
            voter_email: email.clone(),
            items,
            is_test_data: first.is_test_data,
        };
        let pseudo_identity_key = voter_key;

        let mut applied = Vec::with_capacity(bulk.items.len());
        let mut rejection = None;
        for item in &bulk.items {
            match self
                .apply_item_raw(
                    &mut tx,
                    &agg,
                    &bulk,
                    &email,
                    user_id,
                    &pseudo_identity_key,
                    edit_token,
                    &mut by_option,
                    item,
                )
                .await?
            {
                Ok(vote) => applied.push(vote),
                Err(item_rejection) => {
                    rejection = Some(item_rejection);
                    break;
                }
            }
        }
        tx.commit().await?;

        if !applied.is_empty() {
            self.broadcast_after_commit(&agg.poll).await;
        }
        if let Some(rejection) = rejection {
            return Err(rejection.into());
        }

        Ok(VoteReceipt {
            votes: applied,
            voter_edit_token: Some(edit_token.to_string()),
        })
    }

    /// Remove all the requester's votes in one poll. Authorization chain:
    /// session email, then edit token, then supplied email bound to the
    /// requester's voter key.
    pub async fn withdraw(
        &self,
        public_token: &str,
        identity: &VoterIdentity,
        supplied_email: Option<&str>,
        supplied_edit_token: Option<&str>,
    ) -> Result<u64, VoteError> {
        let agg = self
            .store
            .poll_by_public_token(public_token)
            .await?
            .ok_or(VoteRejection::PollNotFound)?;
        self.check_open(&agg.poll)?;
        if !agg.poll.flags.allow_vote_withdrawal {
            return Err(VoteRejection::WithdrawalNotAllowed.into());
        }

        let lock_identity = identity
            .user
            .as_ref()
            .map(|u| u.email.clone())
            .or_else(|| supplied_email.map(normalize_email))
            .unwrap_or_else(|| identity.key.as_string());
        let _guard = self
            .store
            .locks()
            .acquire(voter_lock_key(agg.poll.id, &lock_identity))
            .await;

        let mut tx = self.store.begin().await?;
        crate::store::touch_poll(&mut tx, agg.poll.id).await?;

        let removed = if let Some(user) = &identity.user {
            votes::delete_votes_by_email(&mut tx, agg.poll.id, &user.email).await?
        } else if let Some(edit_token) = supplied_edit_token {
            votes::delete_votes_by_edit_token(&mut tx, agg.poll.id, edit_token).await?
        } else if let Some(email) = supplied_email {
            // Email alone is only honoured when those votes were cast from
            // this requester's device.
            let email = normalize_email(email);
            let theirs = votes::votes_by_poll_and_email(&mut tx, agg.poll.id, &email).await?;
            let key = identity.key.as_string();
            if theirs.iter().any(|v| v.voter_key == key) {
                votes::delete_votes_by_email(&mut tx, agg.poll.id, &email).await?
            } else {
                0
            }
        } else {
            votes::delete_votes_by_voter_key(&mut tx, agg.poll.id, &identity.key.as_string())
                .await?
        };

        tx.commit().await?;

        if removed == 0 {
            return Err(VoteRejection::NoVotesFound.into());
        }

        debug!(poll_id = %agg.poll.id, removed, "votes withdrawn");
        self.broadcast_after_commit(&agg.poll).await;
        Ok(removed)
    }

    fn check_open(&self, poll: &Poll) -> Result<(), VoteRejection> {
        match poll.closed_reason(Utc::now()) {
            None => Ok(()),
            Some(ClosedReason::Inactive) => Err(VoteRejection::PollInactive),
            Some(ClosedReason::Expired) => Err(VoteRejection::PollExpired),
        }
    }

    fn check_items(&self, agg: &PollAggregate, items: &[VoteItem]) -> Result<(), VoteRejection> {
        for item in items {
            if agg.option(item.option_id).is_none() {
                return Err(VoteRejection::UnknownOption {
                    option_id: item.option_id,
                });
            }
            if item.response == VoteResponse::Maybe && !agg.poll.flags.allow_maybe {
                return Err(VoteRejection::MaybeNotAllowed);
            }
        }
        Ok(())
    }

    /// Email-ownership rule. Returns the user id to record on the votes.
    async fn check_email_ownership(
        &self,
        identity: &VoterIdentity,
        voter_email: &str,
    ) -> Result<Option<i64>, VoteError> {
        let owner = self.store.user_by_email(voter_email).await?;
        match (owner, &identity.user) {
            (Some(_), None) => Err(VoteRejection::RequiresLogin.into()),
            (Some(owner), Some(session_user)) if owner.id != session_user.id => {
                Err(VoteRejection::EmailBelongsToAnotherUser.into())
            }
            (Some(owner), Some(_)) => Ok(Some(owner.id)),
            (None, session_user) => Ok(session_user.as_ref().map(|u| u.id)),
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn apply_item(
        &self,
        tx: &mut sqlx::Transaction<'static, sqlx::Sqlite>,
        agg: &PollAggregate,
        bulk: &BulkVote,
        email: &str,
        user_id: Option<i64>,
        identity: &VoterIdentity,
        edit_token: &str,
        by_option: &mut HashMap<i64, Vote>,
        item: &VoteItem,
    ) -> Result<Result<Vote, VoteRejection>, sqlx::Error> {
        let key = identity.key.as_string();
        self.apply_item_raw(tx, agg, bulk, email, user_id, &key, edit_token, by_option, item)
            .await
    }

    /// Apply one item: update the voter's existing row for the option, or
    /// insert a new one. Organization rules are evaluated here, inside the
    /// transaction.
    #[allow(clippy::too_many_arguments)]
    async fn apply_item_raw(
        &self,
        tx: &mut sqlx::Transaction<'static, sqlx::Sqlite>,
        agg: &PollAggregate,
        bulk: &BulkVote,
        email: &str,
        user_id: Option<i64>,
        voter_key: &str,
        edit_token: &str,
        by_option: &mut HashMap<i64, Vote>,
        item: &VoteItem,
    ) -> Result<Result<Vote, VoteRejection>, sqlx::Error> {
        let option = agg
            .option(item.option_id)
            .expect("options were validated before the lock");
        let becomes_yes = item.response == VoteResponse::Yes;

        if let Some(existing) = by_option.get(&item.option_id).cloned() {
            let was_yes = existing.response == VoteResponse::Yes;
            if becomes_yes && !was_yes {
                if let Some(rejection) = self
                    .check_organization_rules(tx, agg, option, email, voter_key)
                    .await?
                {
                    return Ok(Err(rejection));
                }
            }

            votes::update_vote(
                tx,
                existing.id,
                &bulk.voter_name,
                item.response,
                item.comment.as_deref(),
            )
            .await?;

            let mut updated = existing;
            updated.voter_name = bulk.voter_name.clone();
            updated.response = item.response;
            updated.comment = item.comment.clone();
            updated.updated_at = Utc::now();
            by_option.insert(item.option_id, updated.clone());
            return Ok(Ok(updated));
        }

        if becomes_yes {
            if let Some(rejection) = self
                .check_organization_rules(tx, agg, option, email, voter_key)
                .await?
            {
                return Ok(Err(rejection));
            }
        }

        let vote = votes::insert_vote(
            tx,
            votes::NewVote {
                poll_id: agg.poll.id,
                option_id: item.option_id,
                voter_name: bulk.voter_name.clone(),
                voter_email: email.to_string(),
                user_id,
                voter_key: voter_key.to_string(),
                response: item.response,
                comment: item.comment.clone(),
                voter_edit_token: edit_token.to_string(),
                is_test_data: bulk.is_test_data,
            },
        )
        .await?;
        by_option.insert(item.option_id, vote.clone());
        Ok(Ok(vote))
    }

    /// Capacity and single-slot checks for a yes on an organization option.
    async fn check_organization_rules(
        &self,
        tx: &mut sqlx::Transaction<'static, sqlx::Sqlite>,
        agg: &PollAggregate,
        option: &crate::model::PollOption,
        email: &str,
        voter_key: &str,
    ) -> Result<Option<VoteRejection>, sqlx::Error> {
        if agg.poll.kind != PollKind::Organization {
            return Ok(None);
        }

        if let Some(capacity) = option.max_capacity {
            let taken = votes::count_yes_for_option(tx, option.id).await?;
            if taken >= capacity {
                return Ok(Some(VoteRejection::SlotFull {
                    option_id: option.id,
                }));
            }
        }

        if !agg.poll.flags.allow_multiple_slots {
            let held = votes::count_yes_for_voter(tx, agg.poll.id, email, voter_key).await?;
            if held >= 1 {
                return Ok(Some(VoteRejection::AlreadySignedUp {
                    option_id: option.id,
                }));
            }
        }

        Ok(None)
    }

    /// Slot and vote updates for viewers, with post-commit counts.
    async fn broadcast_after_commit(&self, poll: &Poll) {
        if poll.kind == PollKind::Organization {
            match self.store.option_yes_counts(poll.id).await {
                Ok(counts) => {
                    let capacities: HashMap<i64, Option<i64>> = match self
                        .store
                        .poll_by_id(poll.id)
                        .await
                    {
                        Ok(Some(agg)) => agg
                            .options
                            .iter()
                            .map(|o| (o.id, o.max_capacity))
                            .collect(),
                        _ => HashMap::new(),
                    };
                    let slots: BTreeMap<i64, SlotStatus> = counts
                        .into_iter()
                        .map(|(option_id, current_count)| {
                            (
                                option_id,
                                SlotStatus {
                                    current_count,
                                    max_capacity: capacities.get(&option_id).copied().flatten(),
                                },
                            )
                        })
                        .collect();
                    self.live.publish(poll.id, LiveMessage::SlotUpdate { slots });
                }
                Err(err) => warn!(poll_id = %poll.id, error = %err, "slot update skipped"),
            }
        }
        self.live.publish(poll.id, LiveMessage::VoteUpdate);
    }

    /// Voter-confirmation email, behind the per-(poll, email) cooldown.
    /// Fire-and-forget: failures are logged, never surfaced.
    fn enqueue_confirmation(&self, poll: &Poll, voter_name: &str, email: &str, edit_token: &str) {
        if email.is_empty() {
            return;
        }
        if !self.cooldowns.check_and_arm(poll.id, email, Utc::now()) {
            debug!(poll_id = %poll.id, "confirmation suppressed by cooldown");
            return;
        }

        let body = if poll.flags.allow_vote_edit {
            format!(
                "Hi {},\n\nyour votes for \"{}\" were recorded.\nEdit them any time: {}/votes/edit/{}\n",
                voter_name, poll.title, self.base_url, edit_token
            )
        } else {
            format!(
                "Hi {},\n\nyour votes for \"{}\" were recorded.\n",
                voter_name, poll.title
            )
        };
        let email_out = OutboundEmail {
            poll_id: poll.id,
            kind: NotificationKind::VoterConfirmation,
            to: email.to_string(),
            subject: format!("Your votes for \"{}\"", poll.title),
            body,
        };

        let mailer = Arc::clone(&self.mailer);
        let store = Arc::clone(&self.store);
        let poll_id = poll.id;
        let recipient = email.to_string();
        tokio::spawn(async move {
            if let Err(err) = mailer.send(email_out).await {
                warn!(poll_id = %poll_id, error = %err, "confirmation email failed");
                return;
            }
            if let Err(err) = store
                .log_notification(poll_id, NotificationKind::VoterConfirmation, &recipient)
                .await
            {
                warn!(poll_id = %poll_id, error = %err, "notification log failed");
            }
        });
    }

    /// Poll id → slot occupancy, for handlers that need a snapshot (e.g. on
    /// live-channel join).
    pub async fn slot_snapshot(
        &self,
        poll_id: Uuid,
    ) -> Result<BTreeMap<i64, SlotStatus>, sqlx::Error> {
        let counts = self.store.option_yes_counts(poll_id).await?;
        let capacities: HashMap<i64, Option<i64>> = match self.store.poll_by_id(poll_id).await? {
            Some(agg) => agg.options.iter().map(|o| (o.id, o.max_capacity)).collect(),
            None => HashMap::new(),
        };
        Ok(counts
            .into_iter()
            .map(|(option_id, current_count)| {
                (
                    option_id,
                    SlotStatus {
                        current_count,
                        max_capacity: capacities.get(&option_id).copied().flatten(),
                    },
                )
            })
            .collect())
    }
}
