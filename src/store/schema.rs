//! Database schema.
//!
//! Idempotent DDL applied at startup and by `ballotbox migrate`. SQLite
//! types: ids are TEXT (UUID hyphenated), timestamps are unix milliseconds,
//! booleans are 0/1 integers.

use sqlx::SqlitePool;

const DDL: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS polls (
        id TEXT PRIMARY KEY,
        kind TEXT NOT NULL,
        title TEXT NOT NULL,
        description TEXT,
        creator_user_id INTEGER,
        creator_email TEXT,
        admin_token TEXT NOT NULL,
        public_token TEXT NOT NULL,
        is_active INTEGER NOT NULL DEFAULT 1,
        expires_at INTEGER,
        allow_vote_edit INTEGER NOT NULL DEFAULT 0,
        allow_vote_withdrawal INTEGER NOT NULL DEFAULT 0,
        allow_multiple_slots INTEGER NOT NULL DEFAULT 0,
        allow_maybe INTEGER NOT NULL DEFAULT 0,
        results_public INTEGER NOT NULL DEFAULT 1,
        final_option_id INTEGER,
        reminder_enabled INTEGER NOT NULL DEFAULT 0,
        reminder_hours_before INTEGER NOT NULL DEFAULT 24,
        reminder_sent INTEGER NOT NULL DEFAULT 0,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL,
        is_test_data INTEGER NOT NULL DEFAULT 0
    )",
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_polls_public_token ON polls(public_token)",
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_polls_admin_token ON polls(admin_token)",
    "CREATE INDEX IF NOT EXISTS idx_polls_expires_at ON polls(expires_at)",
    "CREATE TABLE IF NOT EXISTS poll_options (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        poll_id TEXT NOT NULL REFERENCES polls(id) ON DELETE CASCADE,
        text TEXT NOT NULL,
        start_time INTEGER,
        end_time INTEGER,
        max_capacity INTEGER,
        position INTEGER NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_poll_options_poll ON poll_options(poll_id, position)",
    "CREATE TABLE IF NOT EXISTS votes (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        poll_id TEXT NOT NULL REFERENCES polls(id) ON DELETE CASCADE,
        option_id INTEGER NOT NULL REFERENCES poll_options(id) ON DELETE CASCADE,
        voter_name TEXT NOT NULL,
        voter_email TEXT NOT NULL,
        user_id INTEGER,
        voter_key TEXT NOT NULL,
        response TEXT NOT NULL,
        comment TEXT,
        voter_edit_token TEXT NOT NULL,
        is_test_data INTEGER NOT NULL DEFAULT 0,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_votes_poll_option ON votes(poll_id, option_id)",
    "CREATE INDEX IF NOT EXISTS idx_votes_poll_email ON votes(poll_id, voter_email)",
    "CREATE INDEX IF NOT EXISTS idx_votes_edit_token ON votes(voter_edit_token)",
    "CREATE INDEX IF NOT EXISTS idx_votes_poll_voter_key ON votes(poll_id, voter_key)",
    "CREATE TABLE IF NOT EXISTS notification_logs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        poll_id TEXT NOT NULL REFERENCES polls(id) ON DELETE CASCADE,
        kind TEXT NOT NULL,
        recipient_email TEXT NOT NULL,
        created_at INTEGER NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_notification_logs_poll
        ON notification_logs(poll_id, kind, created_at)",
    "CREATE TABLE IF NOT EXISTS users (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        email TEXT NOT NULL,
        display_name TEXT,
        created_at INTEGER NOT NULL
    )",
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_users_email ON users(email)",
    "CREATE TABLE IF NOT EXISTS sessions (
        token TEXT PRIMARY KEY,
        user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
        expires_at INTEGER NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS password_reset_tokens (
        token TEXT PRIMARY KEY,
        user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
        payload TEXT,
        expires_at INTEGER NOT NULL,
        used_at INTEGER
    )",
    "CREATE TABLE IF NOT EXISTS email_change_tokens (
        token TEXT PRIMARY KEY,
        user_id INTEGER NOT NULL REFERENCES users(id) ON DELETE CASCADE,
        payload TEXT,
        expires_at INTEGER NOT NULL,
        used_at INTEGER
    )",
    "CREATE TABLE IF NOT EXISTS settings (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL
    )",
];

/// Apply the schema. Safe to run repeatedly.
pub async fn migrate(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    for statement in DDL {
        sqlx::query(statement).execute(pool).await?;
    }
    Ok(())
}
