//! Vote row primitives.
//!
//! The connection-level functions are called by the vote engine only, inside
//! a transaction that holds the voter's advisory lock; API handlers never
//! touch them. Pool-level reads used by the read model live on
//! [`PollStore`].

use chrono::Utc;
use sqlx::SqliteConnection;
use uuid::Uuid;

use super::rows::{ts, VoteRow};
use super::PollStore;
use crate::model::{normalize_email, Vote, VoteResponse};

/// Input for a vote insert. The edit token is decided by the engine (fresh
/// for a voter's first row, reused afterwards).
#[derive(Debug, Clone)]
pub(crate) struct NewVote {
    pub poll_id: Uuid,
    pub option_id: i64,
    pub voter_name: String,
    pub voter_email: String,
    pub user_id: Option<i64>,
    pub voter_key: String,
    pub response: VoteResponse,
    pub comment: Option<String>,
    pub voter_edit_token: String,
    pub is_test_data: bool,
}

pub(crate) async fn insert_vote(
    conn: &mut SqliteConnection,
    new: NewVote,
) -> Result<Vote, sqlx::Error> {
    let now = Utc::now();
    let email = normalize_email(&new.voter_email);
    let result = sqlx::query(
        "INSERT INTO votes (poll_id, option_id, voter_name, voter_email, user_id, voter_key,
            response, comment, voter_edit_token, is_test_data, created_at, updated_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(new.poll_id.to_string())
    .bind(new.option_id)
    .bind(&new.voter_name)
    .bind(&email)
    .bind(new.user_id)
    .bind(&new.voter_key)
    .bind(new.response.as_str())
    .bind(&new.comment)
    .bind(&new.voter_edit_token)
    .bind(new.is_test_data as i64)
    .bind(ts(now))
    .bind(ts(now))
    .execute(&mut *conn)
    .await?;

    Ok(Vote {
        id: result.last_insert_rowid(),
        poll_id: new.poll_id,
        option_id: new.option_id,
        voter_name: new.voter_name,
        voter_email: email,
        user_id: new.user_id,
        voter_key: new.voter_key,
        response: new.response,
        comment: new.comment,
        voter_edit_token: new.voter_edit_token,
        is_test_data: new.is_test_data,
        created_at: now,
        updated_at: now,
    })
}

/// Update an existing row's response (vote edit). Name and comment follow
/// the latest submission.
pub(crate) async fn update_vote(
    conn: &mut SqliteConnection,
    vote_id: i64,
    voter_name: &str,
    response: VoteResponse,
    comment: Option<&str>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE votes SET voter_name = ?, response = ?, comment = ?, updated_at = ? WHERE id = ?",
    )
    .bind(voter_name)
    .bind(response.as_str())
    .bind(comment)
    .bind(ts(Utc::now()))
    .bind(vote_id)
    .execute(conn)
    .await?;
    Ok(())
}

pub(crate) async fn votes_by_poll_and_email(
    conn: &mut SqliteConnection,
    poll_id: Uuid,
    email: &str,
) -> Result<Vec<Vote>, sqlx::Error> {
    sqlx::query_as::<_, VoteRow>(
        "SELECT * FROM votes WHERE poll_id = ? AND voter_email = ? ORDER BY id",
    )
    .bind(poll_id.to_string())
    .bind(normalize_email(email))
    .fetch_all(conn)
    .await?
    .into_iter()
    .map(VoteRow::into_vote)
    .collect()
}

/// Yes-votes currently held by an option. Evaluated inside the voting
/// transaction for the capacity check.
pub(crate) async fn count_yes_for_option(
    conn: &mut SqliteConnection,
    option_id: i64,
) -> Result<i64, sqlx::Error> {
    sqlx::query_scalar("SELECT COUNT(*) FROM votes WHERE option_id = ? AND response = 'yes'")
        .bind(option_id)
        .fetch_one(conn)
        .await
}

/// Yes-votes a voter holds across a poll's options, for the single-slot
/// rule.
pub(crate) async fn count_yes_for_voter(
    conn: &mut SqliteConnection,
    poll_id: Uuid,
    email: &str,
    voter_key: &str,
) -> Result<i64, sqlx::Error> {
    sqlx::query_scalar(
        "SELECT COUNT(*) FROM votes
         WHERE poll_id = ? AND response = 'yes' AND (voter_email = ? OR voter_key = ?)",
    )
    .bind(poll_id.to_string())
    .bind(normalize_email(email))
    .bind(voter_key)
    .fetch_one(conn)
    .await
}

pub(crate) async fn delete_votes_by_email(
    conn: &mut SqliteConnection,
    poll_id: Uuid,
    email: &str,
) -> Result<u64, sqlx::Error> {
    let result = sqlx::query("DELETE FROM votes WHERE poll_id = ? AND voter_email = ?")
        .bind(poll_id.to_string())
        .bind(normalize_email(email))
        .execute(conn)
        .await?;
    Ok(result.rows_affected())
}

pub(crate) async fn delete_votes_by_edit_token(
    conn: &mut SqliteConnection,
    poll_id: Uuid,
    edit_token: &str,
) -> Result<u64, sqlx::Error> {
    let result = sqlx::query("DELETE FROM votes WHERE poll_id = ? AND voter_edit_token = ?")
        .bind(poll_id.to_string())
        .bind(edit_token)
        .execute(conn)
        .await?;
    Ok(result.rows_affected())
}

pub(crate) async fn delete_votes_by_voter_key(
    conn: &mut SqliteConnection,
    poll_id: Uuid,
    voter_key: &str,
) -> Result<u64, sqlx::Error> {
    let result = sqlx::query("DELETE FROM votes WHERE poll_id = ? AND voter_key = ?")
        .bind(poll_id.to_string())
        .bind(voter_key)
        .execute(conn)
        .await?;
    Ok(result.rows_affected())
}

impl PollStore {
    /// All votes sharing an edit token, i.e. one voter's rows in one poll.
    pub async fn votes_by_edit_token(&self, edit_token: &str) -> Result<Vec<Vote>, sqlx::Error> {
        sqlx::query_as::<_, VoteRow>(
            "SELECT * FROM votes WHERE voter_edit_token = ? ORDER BY id",
        )
        .bind(edit_token)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(VoteRow::into_vote)
        .collect()
    }

    /// A requester's votes in one poll, matched by any of the identity
    /// facets that are present.
    pub async fn votes_for_requester(
        &self,
        poll_id: Uuid,
        user_id: Option<i64>,
        email: Option<&str>,
        voter_key: Option<&str>,
    ) -> Result<Vec<Vote>, sqlx::Error> {
        sqlx::query_as::<_, VoteRow>(
            "SELECT * FROM votes WHERE poll_id = ?
               AND ((? IS NOT NULL AND user_id = ?)
                 OR (? IS NOT NULL AND voter_email = ?)
                 OR (? IS NOT NULL AND voter_key = ?))
             ORDER BY id",
        )
        .bind(poll_id.to_string())
        .bind(user_id)
        .bind(user_id)
        .bind(email.map(normalize_email))
        .bind(email.map(normalize_email))
        .bind(voter_key)
        .bind(voter_key)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(VoteRow::into_vote)
        .collect()
    }

    /// Per-option yes-counts for a poll, used for slot_update broadcasts.
    pub async fn option_yes_counts(&self, poll_id: Uuid) -> Result<Vec<(i64, i64)>, sqlx::Error> {
        sqlx::query_as::<_, (i64, i64)>(
            "SELECT o.id, COUNT(v.id) FROM poll_options o
             LEFT JOIN votes v ON v.option_id = o.id AND v.response = 'yes'
             WHERE o.poll_id = ?
             GROUP BY o.id
             ORDER BY o.position, o.id",
        )
        .bind(poll_id.to_string())
        .fetch_all(&self.pool)
        .await
    }
}
