//! Persistence layer over SQLite.
//!
//! [`PollStore`] owns the connection pool and exposes CRUD over polls,
//! options, votes, notifications, users and settings. Vote-row primitives
//! live in [`votes`] and are called by the vote engine only, inside a
//! transaction that holds the voter's advisory lock.
//!
//! Advisory locks are in-process async mutexes keyed by i64
//! ([`LockManager`]); a multi-process deployment would swap in a shared
//! implementation behind the same two calls (acquire, sweep).

mod polls;
mod rows;
mod schema;
mod users;
pub(crate) mod votes;

pub use polls::{NewOption, NewPoll};
pub(crate) use polls::touch_poll;
pub use users::OneShotTokenKind;

use dashmap::DashMap;
use sha2::{Digest, Sha256};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Sqlite, SqlitePool, Transaction};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

/// In-process advisory locks keyed by i64, mirroring the database advisory
/// lock interface. Guards are transaction-scoped by convention: the engine
/// acquires before `begin` and drops after commit.
pub struct LockManager {
    locks: DashMap<i64, Arc<Mutex<()>>>,
}

impl LockManager {
    fn new() -> Self {
        Self {
            locks: DashMap::new(),
        }
    }

    /// Acquire the lock for `key`, waiting if another holder is active.
    pub async fn acquire(&self, key: i64) -> OwnedMutexGuard<()> {
        let lock = self
            .locks
            .entry(key)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        lock.lock_owned().await
    }

    /// Drop lock entries nobody holds. Called from the periodic sweep.
    pub fn sweep(&self) {
        self.locks.retain(|_, lock| Arc::strong_count(lock) > 1);
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.locks.len()
    }
}

/// Advisory-lock key for one voter in one poll: first 8 bytes of
/// SHA-256(poll_id "/" identity), where identity is the lower-cased email
/// or, absent an email, the voter key.
pub fn voter_lock_key(poll_id: Uuid, identity: &str) -> i64 {
    let mut hasher = Sha256::new();
    hasher.update(poll_id.to_string().as_bytes());
    hasher.update(b"/");
    hasher.update(identity.as_bytes());
    let digest = hasher.finalize();
    i64::from_be_bytes(digest[..8].try_into().expect("digest is 32 bytes"))
}

/// SQLite-backed store for everything durable.
pub struct PollStore {
    pool: SqlitePool,
    locks: LockManager,
}

impl PollStore {
    /// Open (creating if missing) the database file and apply the schema.
    pub async fn open(path: &Path) -> Result<Self, sqlx::Error> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5))
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        schema::migrate(&pool).await?;
        Ok(Self {
            pool,
            locks: LockManager::new(),
        })
    }

    /// In-memory store for tests. A single connection keeps the one
    /// `:memory:` database alive and shared.
    pub async fn open_in_memory() -> Result<Self, sqlx::Error> {
        let options = SqliteConnectOptions::new()
            .filename(":memory:")
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        schema::migrate(&pool).await?;
        Ok(Self {
            pool,
            locks: LockManager::new(),
        })
    }

    /// Re-apply the schema (idempotent).
    pub async fn migrate(&self) -> Result<(), sqlx::Error> {
        schema::migrate(&self.pool).await
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    /// Begin a transaction. Writers should touch their poll row first so the
    /// write lock is taken before any read the transaction depends on.
    pub async fn begin(&self) -> Result<Transaction<'static, Sqlite>, sqlx::Error> {
        self.pool.begin().await
    }
}
