//! Poll and option CRUD.

use chrono::{DateTime, Utc};
use sqlx::SqliteConnection;
use uuid::Uuid;

use super::rows::{ts, OptionRow, PollRow, VoteRow};
use super::PollStore;
use crate::model::{
    normalize_email, ExpiryReminder, Poll, PollAggregate, PollFlags, PollKind, PollOption,
};
use crate::token::mint_url_token;

/// Input for poll creation. Tokens and timestamps are assigned by the store.
#[derive(Debug, Clone)]
pub struct NewPoll {
    pub kind: PollKind,
    pub title: String,
    pub description: Option<String>,
    pub creator_user_id: Option<i64>,
    pub creator_email: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub flags: PollFlags,
    pub expiry_reminder: ExpiryReminder,
    pub is_test_data: bool,
}

/// Input for option creation.
#[derive(Debug, Clone)]
pub struct NewOption {
    pub text: String,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub max_capacity: Option<i64>,
    pub position: Option<i64>,
}

impl PollStore {
    /// Create a poll with its options in one transaction. Both URL tokens
    /// are minted here; the caller receives them via the aggregate.
    pub async fn create_poll(
        &self,
        new: NewPoll,
        options: Vec<NewOption>,
    ) -> Result<PollAggregate, sqlx::Error> {
        let id = Uuid::new_v4();
        let admin_token = mint_url_token();
        let public_token = mint_url_token();
        let now = ts(Utc::now());

        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO polls (id, kind, title, description, creator_user_id, creator_email,
                admin_token, public_token, is_active, expires_at,
                allow_vote_edit, allow_vote_withdrawal, allow_multiple_slots, allow_maybe,
                results_public, final_option_id,
                reminder_enabled, reminder_hours_before, reminder_sent,
                created_at, updated_at, is_test_data)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, 1, ?, ?, ?, ?, ?, ?, NULL, ?, ?, 0, ?, ?, ?)",
        )
        .bind(id.to_string())
        .bind(new.kind.as_str())
        .bind(&new.title)
        .bind(&new.description)
        .bind(new.creator_user_id)
        .bind(new.creator_email.as_deref().map(normalize_email))
        .bind(&admin_token)
        .bind(&public_token)
        .bind(new.expires_at.map(ts))
        .bind(new.flags.allow_vote_edit as i64)
        .bind(new.flags.allow_vote_withdrawal as i64)
        .bind(new.flags.allow_multiple_slots as i64)
        .bind(new.flags.allow_maybe as i64)
        .bind(new.flags.results_public as i64)
        .bind(new.expiry_reminder.enabled as i64)
        .bind(new.expiry_reminder.hours_before)
        .bind(now)
        .bind(now)
        .bind(new.is_test_data as i64)
        .execute(&mut *tx)
        .await?;

        for (index, option) in options.iter().enumerate() {
            let position = option.position.unwrap_or(index as i64);
            sqlx::query(
                "INSERT INTO poll_options (poll_id, text, start_time, end_time, max_capacity, position)
                 VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(id.to_string())
            .bind(&option.text)
            .bind(option.start_time.map(ts))
            .bind(option.end_time.map(ts))
            .bind(option.max_capacity)
            .bind(position)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        self.poll_by_id(id)
            .await?
            .ok_or_else(|| sqlx::Error::RowNotFound)
    }

    pub async fn poll_by_id(&self, id: Uuid) -> Result<Option<PollAggregate>, sqlx::Error> {
        let row = sqlx::query_as::<_, PollRow>("SELECT * FROM polls WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        self.load_aggregate(row).await
    }

    pub async fn poll_by_public_token(
        &self,
        token: &str,
    ) -> Result<Option<PollAggregate>, sqlx::Error> {
        let row = sqlx::query_as::<_, PollRow>("SELECT * FROM polls WHERE public_token = ?")
            .bind(token)
            .fetch_optional(&self.pool)
            .await?;
        self.load_aggregate(row).await
    }

    pub async fn poll_by_admin_token(
        &self,
        token: &str,
    ) -> Result<Option<PollAggregate>, sqlx::Error> {
        let row = sqlx::query_as::<_, PollRow>("SELECT * FROM polls WHERE admin_token = ?")
            .bind(token)
            .fetch_optional(&self.pool)
            .await?;
        self.load_aggregate(row).await
    }

    /// Either token resolves the poll; used by result reads and the live
    /// channel where both audiences share one view.
    pub async fn poll_by_any_token(
        &self,
        token: &str,
    ) -> Result<Option<PollAggregate>, sqlx::Error> {
        let row = sqlx::query_as::<_, PollRow>(
            "SELECT * FROM polls WHERE public_token = ? OR admin_token = ?",
        )
        .bind(token)
        .bind(token)
        .fetch_optional(&self.pool)
        .await?;
        self.load_aggregate(row).await
    }

    async fn load_aggregate(
        &self,
        row: Option<PollRow>,
    ) -> Result<Option<PollAggregate>, sqlx::Error> {
        let Some(row) = row else {
            return Ok(None);
        };
        let poll = row.into_poll()?;

        let options = sqlx::query_as::<_, OptionRow>(
            "SELECT * FROM poll_options WHERE poll_id = ? ORDER BY position, id",
        )
        .bind(poll.id.to_string())
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(OptionRow::into_option)
        .collect::<Result<Vec<_>, _>>()?;

        let votes = sqlx::query_as::<_, VoteRow>(
            "SELECT * FROM votes WHERE poll_id = ? ORDER BY id",
        )
        .bind(poll.id.to_string())
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(VoteRow::into_vote)
        .collect::<Result<Vec<_>, _>>()?;

        Ok(Some(PollAggregate {
            poll,
            options,
            votes,
        }))
    }

    /// Persist the mutable fields of a poll. Read-modify-write: callers load
    /// the aggregate, apply their patch and save. Last write wins.
    pub async fn update_poll(&self, poll: &Poll) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE polls SET title = ?, description = ?, is_active = ?, expires_at = ?,
                allow_vote_edit = ?, allow_vote_withdrawal = ?, allow_multiple_slots = ?,
                allow_maybe = ?, results_public = ?, final_option_id = ?,
                reminder_enabled = ?, reminder_hours_before = ?, reminder_sent = ?,
                updated_at = ?
             WHERE id = ?",
        )
        .bind(&poll.title)
        .bind(&poll.description)
        .bind(poll.is_active as i64)
        .bind(poll.expires_at.map(ts))
        .bind(poll.flags.allow_vote_edit as i64)
        .bind(poll.flags.allow_vote_withdrawal as i64)
        .bind(poll.flags.allow_multiple_slots as i64)
        .bind(poll.flags.allow_maybe as i64)
        .bind(poll.flags.results_public as i64)
        .bind(poll.final_option_id)
        .bind(poll.expiry_reminder.enabled as i64)
        .bind(poll.expiry_reminder.hours_before)
        .bind(poll.expiry_reminder.sent as i64)
        .bind(ts(Utc::now()))
        .bind(poll.id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Delete a poll; options, votes and notification logs cascade.
    pub async fn delete_poll(&self, id: Uuid) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("DELETE FROM polls WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn add_option(
        &self,
        poll_id: Uuid,
        option: NewOption,
    ) -> Result<PollOption, sqlx::Error> {
        let position = match option.position {
            Some(p) => p,
            None => {
                sqlx::query_scalar::<_, i64>(
                    "SELECT COALESCE(MAX(position) + 1, 0) FROM poll_options WHERE poll_id = ?",
                )
                .bind(poll_id.to_string())
                .fetch_one(&self.pool)
                .await?
            }
        };

        let result = sqlx::query(
            "INSERT INTO poll_options (poll_id, text, start_time, end_time, max_capacity, position)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(poll_id.to_string())
        .bind(&option.text)
        .bind(option.start_time.map(ts))
        .bind(option.end_time.map(ts))
        .bind(option.max_capacity)
        .bind(position)
        .execute(&self.pool)
        .await?;

        Ok(PollOption {
            id: result.last_insert_rowid(),
            poll_id,
            text: option.text,
            start_time: option.start_time,
            end_time: option.end_time,
            max_capacity: option.max_capacity,
            position,
        })
    }

    pub async fn update_option(&self, option: &PollOption) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE poll_options SET text = ?, start_time = ?, end_time = ?, max_capacity = ?
             WHERE id = ? AND poll_id = ?",
        )
        .bind(&option.text)
        .bind(option.start_time.map(ts))
        .bind(option.end_time.map(ts))
        .bind(option.max_capacity)
        .bind(option.id)
        .bind(option.poll_id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Delete one option; its votes cascade.
    pub async fn delete_option(&self, poll_id: Uuid, option_id: i64) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("DELETE FROM poll_options WHERE id = ? AND poll_id = ?")
            .bind(option_id)
            .bind(poll_id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn set_final_option(
        &self,
        poll_id: Uuid,
        final_option_id: Option<i64>,
    ) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE polls SET final_option_id = ?, updated_at = ? WHERE id = ?")
            .bind(final_option_id)
            .bind(ts(Utc::now()))
            .bind(poll_id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Polls owned by a registered creator, newest first.
    pub async fn polls_by_creator(&self, user_id: i64) -> Result<Vec<Poll>, sqlx::Error> {
        sqlx::query_as::<_, PollRow>(
            "SELECT * FROM polls WHERE creator_user_id = ? ORDER BY created_at DESC, id",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(PollRow::into_poll)
        .collect()
    }

    /// Polls the user has participated in (by user id or email), newest
    /// first, excluding their own.
    pub async fn polls_voted_by(
        &self,
        user_id: i64,
        email: &str,
    ) -> Result<Vec<Poll>, sqlx::Error> {
        sqlx::query_as::<_, PollRow>(
            "SELECT DISTINCT p.* FROM polls p
             JOIN votes v ON v.poll_id = p.id
             WHERE (v.user_id = ? OR v.voter_email = ?)
               AND (p.creator_user_id IS NULL OR p.creator_user_id != ?)
             ORDER BY p.created_at DESC, p.id",
        )
        .bind(user_id)
        .bind(normalize_email(email))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(PollRow::into_poll)
        .collect()
    }

    /// Active polls whose expiry falls inside their reminder window and
    /// whose reminder has not been sent.
    pub async fn polls_needing_expiry_reminder(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<Poll>, sqlx::Error> {
        sqlx::query_as::<_, PollRow>(
            "SELECT * FROM polls
             WHERE reminder_enabled = 1 AND reminder_sent = 0 AND is_active = 1
               AND expires_at IS NOT NULL AND expires_at > ?
               AND expires_at <= ? + reminder_hours_before * 3600000",
        )
        .bind(ts(now))
        .bind(ts(now))
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(PollRow::into_poll)
        .collect()
    }

    /// Mark the expiry reminder sent. Returns false when another sweep got
    /// there first.
    pub async fn mark_reminder_sent(&self, poll_id: Uuid) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE polls SET reminder_sent = 1, updated_at = ? WHERE id = ? AND reminder_sent = 0",
        )
        .bind(ts(Utc::now()))
        .bind(poll_id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}

/// Take the write lock on the poll row at the start of a voting
/// transaction. Later reads (capacity counts, duplicate checks) then see a
/// state no concurrent writer can move underneath them.
pub(crate) async fn touch_poll(
    conn: &mut SqliteConnection,
    poll_id: Uuid,
) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE polls SET updated_at = updated_at WHERE id = ?")
        .bind(poll_id.to_string())
        .execute(conn)
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::VoteResponse;
    use crate::store::votes;

    fn new_poll(kind: PollKind) -> NewPoll {
        NewPoll {
            kind,
            title: "Team lunch".into(),
            description: Some("pick a spot".into()),
            creator_user_id: None,
            creator_email: Some("Owner@Example.com".into()),
            expires_at: None,
            flags: PollFlags::default(),
            expiry_reminder: ExpiryReminder::default(),
            is_test_data: false,
        }
    }

    fn three_options() -> Vec<NewOption> {
        ["A", "B", "C"]
            .into_iter()
            .map(|text| NewOption {
                text: text.into(),
                start_time: None,
                end_time: None,
                max_capacity: None,
                position: None,
            })
            .collect()
    }

    #[tokio::test]
    async fn create_then_fetch_round_trips() {
        let store = PollStore::open_in_memory().await.unwrap();
        let created = store
            .create_poll(new_poll(PollKind::Survey), three_options())
            .await
            .unwrap();

        assert_eq!(created.options.len(), 3);
        assert_ne!(created.poll.admin_token, created.poll.public_token);
        assert_eq!(created.poll.creator_email.as_deref(), Some("owner@example.com"));

        let fetched = store
            .poll_by_public_token(&created.poll.public_token)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(fetched.poll.id, created.poll.id);
        assert_eq!(fetched.poll.title, "Team lunch");
        // Insertion order preserved.
        let texts: Vec<_> = fetched.options.iter().map(|o| o.text.as_str()).collect();
        assert_eq!(texts, ["A", "B", "C"]);

        let by_admin = store
            .poll_by_admin_token(&created.poll.admin_token)
            .await
            .unwrap();
        assert!(by_admin.is_some());
        assert!(store.poll_by_public_token("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn delete_poll_cascades_to_options_and_votes() {
        let store = PollStore::open_in_memory().await.unwrap();
        let agg = store
            .create_poll(new_poll(PollKind::Survey), three_options())
            .await
            .unwrap();
        let option_id = agg.options[0].id;

        let mut tx = store.begin().await.unwrap();
        votes::insert_vote(
            &mut *tx,
            votes::NewVote {
                poll_id: agg.poll.id,
                option_id,
                voter_name: "V".into(),
                voter_email: "v@x.test".into(),
                user_id: None,
                voter_key: "device:abc".into(),
                response: VoteResponse::Yes,
                comment: None,
                voter_edit_token: "tok".into(),
                is_test_data: false,
            },
        )
        .await
        .unwrap();
        tx.commit().await.unwrap();

        assert!(store.delete_poll(agg.poll.id).await.unwrap());
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM votes")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(count, 0);
        let options: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM poll_options")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(options, 0);
    }

    #[tokio::test]
    async fn added_options_extend_the_order() {
        let store = PollStore::open_in_memory().await.unwrap();
        let agg = store
            .create_poll(new_poll(PollKind::Survey), three_options())
            .await
            .unwrap();

        let added = store
            .add_option(
                agg.poll.id,
                NewOption {
                    text: "D".into(),
                    start_time: None,
                    end_time: None,
                    max_capacity: None,
                    position: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(added.position, 3);

        assert!(store.delete_option(agg.poll.id, added.id).await.unwrap());
        assert!(!store.delete_option(agg.poll.id, added.id).await.unwrap());
    }

    #[tokio::test]
    async fn reminder_query_matches_only_polls_in_window() {
        let store = PollStore::open_in_memory().await.unwrap();
        let now = Utc::now();

        let mut inside = new_poll(PollKind::Schedule);
        inside.expires_at = Some(now + chrono::Duration::hours(2));
        inside.expiry_reminder = ExpiryReminder {
            enabled: true,
            hours_before: 24,
            sent: false,
        };
        let inside = store.create_poll(inside, three_options()).await.unwrap();

        let mut outside = new_poll(PollKind::Schedule);
        outside.expires_at = Some(now + chrono::Duration::hours(100));
        outside.expiry_reminder = ExpiryReminder {
            enabled: true,
            hours_before: 24,
            sent: false,
        };
        store.create_poll(outside, three_options()).await.unwrap();

        let due = store.polls_needing_expiry_reminder(now).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].id, inside.poll.id);

        assert!(store.mark_reminder_sent(inside.poll.id).await.unwrap());
        assert!(!store.mark_reminder_sent(inside.poll.id).await.unwrap());
        assert!(store
            .polls_needing_expiry_reminder(now)
            .await
            .unwrap()
            .is_empty());
    }
}
