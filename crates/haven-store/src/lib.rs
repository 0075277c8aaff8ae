//! # haven-store
//!
//! Durable message store backed by a single SQLite database.
//!
//! Messages are keyed by their content hash, which makes replication and
//! re-submission idempotent, with a secondary index on
//! `(account, namespace, timestamp)` for ordered retrieval. Capacity is
//! enforced with `PRAGMA max_page_count`: once the database reaches the
//! configured size cap, inserts fail with [`StoreError::Full`] and the
//! aborted transaction leaves no partial state.
//!
//! Callers must arrange a periodic timer (every
//! [`haven_types::CLEANUP_PERIOD_SECS`] is recommended) that invokes
//! [`MessageStore::clean_expired`].

use std::path::Path;
use std::sync::Mutex;

use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use tracing::debug;

use haven_types::{
    AccountId, Message, NamespaceId, DB_PAGE_SIZE, DB_SIZE_LIMIT, RETRIEVE_DEFAULT_LIMIT,
    RETRIEVE_MAX_LIMIT,
};

/// Errors from store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// The database has reached its configured size cap.
    #[error("storage capacity exhausted")]
    Full,

    /// Insert refused because the hash already exists and the caller asked
    /// for duplicates to fail.
    #[error("duplicate message hash")]
    Duplicate,

    #[error("corrupt row: {0}")]
    CorruptRow(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// What to do when a store hits an existing hash.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DuplicateHandling {
    /// Coalesce the duplicate into success.
    Ignore,
    /// Surface the duplicate as [`StoreError::Duplicate`].
    Fail,
}

/// Outcome of a successful store call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StoreOutcome {
    /// The message was inserted.
    Stored,
    /// The hash was already present (only reachable with
    /// [`DuplicateHandling::Ignore`]).
    Duplicate,
}

/// The message database. Writers are serialized by the internal mutex;
/// readers share it too, which SQLite's in-process locking would otherwise
/// force anyway.
pub struct MessageStore {
    conn: Mutex<Connection>,
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS messages (
    hash TEXT NOT NULL PRIMARY KEY,
    account BLOB NOT NULL,
    namespace INTEGER NOT NULL,
    data BLOB NOT NULL,
    timestamp INTEGER NOT NULL,
    expiry INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_messages_account
    ON messages (account, namespace, timestamp);
";

impl MessageStore {
    /// Open (or create) the database at `path` with the given size cap.
    pub fn open(path: &Path, size_cap: u64) -> Result<Self> {
        let conn = Connection::open(path)?;
        configure(&conn, size_cap)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open the database with the default 3.5 GiB cap.
    pub fn open_default(path: &Path) -> Result<Self> {
        Self::open(path, DB_SIZE_LIMIT)
    }

    /// In-memory database for tests.
    pub fn open_in_memory(size_cap: u64) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        configure(&conn, size_cap)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Insert a message keyed by its content hash.
    pub fn store(&self, msg: &Message, dup: DuplicateHandling) -> Result<StoreOutcome> {
        let conn = self.lock();
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO messages (hash, account, namespace, data, timestamp, expiry)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                msg.hash,
                msg.account.as_bytes(),
                msg.namespace,
                msg.data,
                msg.timestamp_ms as i64,
                msg.expiry_ms as i64,
            ],
        );
        match inserted {
            Ok(1) => Ok(StoreOutcome::Stored),
            Ok(_) => match dup {
                DuplicateHandling::Ignore => Ok(StoreOutcome::Duplicate),
                DuplicateHandling::Fail => Err(StoreError::Duplicate),
            },
            Err(e) => Err(map_sqlite(e)),
        }
    }

    /// Store a batch; each item is atomic on its own, the batch is not.
    pub fn bulk_store(&self, msgs: &[Message]) -> Result<Vec<StoreOutcome>> {
        msgs.iter()
            .map(|m| self.store(m, DuplicateHandling::Ignore))
            .collect()
    }

    /// Retrieve messages for one `(account, namespace)` in ascending
    /// `(timestamp, hash)` order.
    ///
    /// `last_hash`, when present in the store, is an exclusive lower bound;
    /// an unknown hash is ignored. `limit` defaults to
    /// [`RETRIEVE_DEFAULT_LIMIT`] and is clamped to [`RETRIEVE_MAX_LIMIT`].
    pub fn retrieve(
        &self,
        account: &AccountId,
        namespace: NamespaceId,
        last_hash: Option<&str>,
        limit: Option<usize>,
    ) -> Result<Vec<Message>> {
        let limit = limit.unwrap_or(RETRIEVE_DEFAULT_LIMIT).min(RETRIEVE_MAX_LIMIT);
        let conn = self.lock();

        // Translate the exclusive bound into its (timestamp, hash) key.
        let bound: Option<(i64, String)> = match last_hash {
            Some(h) => conn
                .query_row(
                    "SELECT timestamp FROM messages WHERE hash = ?1",
                    params![h],
                    |row| row.get::<_, i64>(0),
                )
                .optional()?
                .map(|ts| (ts, h.to_string())),
            None => None,
        };
        let (bound_ts, bound_hash) = bound.unwrap_or((-1, String::new()));

        let mut stmt = conn.prepare_cached(
            "SELECT hash, account, namespace, data, timestamp, expiry FROM messages
             WHERE account = ?1 AND namespace = ?2 AND (timestamp, hash) > (?3, ?4)
             ORDER BY timestamp, hash
             LIMIT ?5",
        )?;
        let rows = stmt.query_map(
            params![account.as_bytes(), namespace, bound_ts, bound_hash, limit as i64],
            row_to_message,
        )?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(StoreError::from)
            .and_then(|msgs| msgs.into_iter().map(check_row).collect())
    }

    /// Look up a single message by content hash.
    pub fn retrieve_by_hash(&self, hash: &str) -> Result<Option<Message>> {
        let conn = self.lock();
        let row = conn
            .query_row(
                "SELECT hash, account, namespace, data, timestamp, expiry
                 FROM messages WHERE hash = ?1",
                params![hash],
                row_to_message,
            )
            .optional()?;
        row.map(check_row).transpose()
    }

    /// Total number of stored messages.
    pub fn count(&self) -> Result<u64> {
        let conn = self.lock();
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM messages", [], |row| row.get(0))?;
        Ok(n as u64)
    }

    /// Number of database pages in use.
    pub fn used_pages(&self) -> Result<u64> {
        let conn = self.lock();
        let pages: i64 = conn.pragma_query_value(None, "page_count", |row| row.get(0))?;
        let free: i64 = conn.pragma_query_value(None, "freelist_count", |row| row.get(0))?;
        Ok((pages - free).max(0) as u64)
    }

    /// A uniformly random stored message, for storage audits.
    pub fn random(&self) -> Result<Option<Message>> {
        let conn = self.lock();
        let row = conn
            .query_row(
                "SELECT hash, account, namespace, data, timestamp, expiry
                 FROM messages ORDER BY RANDOM() LIMIT 1",
                [],
                row_to_message,
            )
            .optional()?;
        row.map(check_row).transpose()
    }

    /// Remove all messages whose expiry is at or before `now_ms`.
    /// Idempotent; safe to call concurrently with store and retrieve.
    pub fn clean_expired(&self, now_ms: u64) -> Result<usize> {
        let conn = self.lock();
        let removed = conn.execute(
            "DELETE FROM messages WHERE expiry <= ?1",
            params![now_ms as i64],
        )?;
        if removed > 0 {
            debug!(removed, "expired messages removed");
        }
        Ok(removed)
    }

    /// Delete specific messages of an account; returns the hashes that were
    /// actually present.
    pub fn delete_by_hashes(&self, account: &AccountId, hashes: &[String]) -> Result<Vec<String>> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let mut deleted = Vec::new();
        {
            let mut stmt = tx.prepare_cached(
                "DELETE FROM messages WHERE account = ?1 AND hash = ?2 RETURNING hash",
            )?;
            for hash in hashes {
                if let Some(h) = stmt
                    .query_row(params![account.as_bytes(), hash], |row| {
                        row.get::<_, String>(0)
                    })
                    .optional()?
                {
                    deleted.push(h);
                }
            }
        }
        tx.commit()?;
        Ok(deleted)
    }

    /// Delete every message of an account, optionally restricted to one
    /// namespace; returns the deleted hashes.
    pub fn delete_all(
        &self,
        account: &AccountId,
        namespace: Option<NamespaceId>,
    ) -> Result<Vec<String>> {
        let conn = self.lock();
        collect_deleted(&conn, account, namespace, None)
    }

    /// Delete messages with `timestamp <= before_ms`; returns the deleted
    /// hashes.
    pub fn delete_before(
        &self,
        account: &AccountId,
        namespace: Option<NamespaceId>,
        before_ms: u64,
    ) -> Result<Vec<String>> {
        let conn = self.lock();
        collect_deleted(&conn, account, namespace, Some(before_ms))
    }

    /// Change the expiry of the given messages.
    ///
    /// By default the expiry can only be brought forward (shortened);
    /// `extend` additionally allows pushing it back. Returns
    /// `(hash, effective_expiry)` for every matched message.
    pub fn update_expiry(
        &self,
        account: &AccountId,
        hashes: &[String],
        new_expiry_ms: u64,
        extend: bool,
    ) -> Result<Vec<(String, u64)>> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let mut updated = Vec::new();
        {
            let sql = if extend {
                "UPDATE messages SET expiry = MAX(expiry, ?3)
                 WHERE account = ?1 AND hash = ?2 RETURNING hash, expiry"
            } else {
                "UPDATE messages SET expiry = MIN(expiry, ?3)
                 WHERE account = ?1 AND hash = ?2 RETURNING hash, expiry"
            };
            let mut stmt = tx.prepare_cached(sql)?;
            for hash in hashes {
                if let Some(row) = stmt
                    .query_row(
                        params![account.as_bytes(), hash, new_expiry_ms as i64],
                        |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)),
                    )
                    .optional()?
                {
                    updated.push((row.0, row.1 as u64));
                }
            }
        }
        tx.commit()?;
        Ok(updated)
    }

    /// Current expiries of the given messages, skipping unknown hashes.
    pub fn get_expiries(&self, account: &AccountId, hashes: &[String]) -> Result<Vec<(String, u64)>> {
        let conn = self.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT hash, expiry FROM messages WHERE account = ?1 AND hash = ?2",
        )?;
        let mut out = Vec::new();
        for hash in hashes {
            if let Some(row) = stmt
                .query_row(params![account.as_bytes(), hash], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
                })
                .optional()?
            {
                out.push((row.0, row.1 as u64));
            }
        }
        Ok(out)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        // Transactions keep the database consistent even if a holder
        // panicked, so a poisoned lock is still usable.
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn collect_deleted(
    conn: &Connection,
    account: &AccountId,
    namespace: Option<NamespaceId>,
    before_ms: Option<u64>,
) -> Result<Vec<String>> {
    let sql = match (namespace.is_some(), before_ms.is_some()) {
        (true, true) => {
            "DELETE FROM messages WHERE account = ?1 AND namespace = ?2 AND timestamp <= ?3 RETURNING hash"
        }
        (true, false) => "DELETE FROM messages WHERE account = ?1 AND namespace = ?2 RETURNING hash",
        (false, true) => "DELETE FROM messages WHERE account = ?1 AND timestamp <= ?2 RETURNING hash",
        (false, false) => "DELETE FROM messages WHERE account = ?1 RETURNING hash",
    };
    let mut stmt = conn.prepare_cached(sql)?;
    let mut deleted: Vec<String> = match (namespace, before_ms) {
        (Some(ns), Some(t)) => stmt
            .query_map(params![account.as_bytes(), ns, t as i64], |r| r.get(0))?
            .collect::<rusqlite::Result<_>>()?,
        (Some(ns), None) => stmt
            .query_map(params![account.as_bytes(), ns], |r| r.get(0))?
            .collect::<rusqlite::Result<_>>()?,
        (None, Some(t)) => stmt
            .query_map(params![account.as_bytes(), t as i64], |r| r.get(0))?
            .collect::<rusqlite::Result<_>>()?,
        (None, None) => stmt
            .query_map(params![account.as_bytes()], |r| r.get(0))?
            .collect::<rusqlite::Result<_>>()?,
    };
    deleted.sort();
    Ok(deleted)
}

fn configure(conn: &Connection, size_cap: u64) -> Result<()> {
    let max_pages = (size_cap / DB_PAGE_SIZE).max(1);
    conn.execute_batch(&format!(
        "PRAGMA page_size = {DB_PAGE_SIZE};
         PRAGMA journal_mode = WAL;
         PRAGMA synchronous = NORMAL;
         PRAGMA busy_timeout = 5000;
         PRAGMA max_page_count = {max_pages};"
    ))?;
    conn.execute_batch(SCHEMA)?;
    Ok(())
}

fn map_sqlite(e: rusqlite::Error) -> StoreError {
    if let rusqlite::Error::SqliteFailure(err, _) = &e {
        if err.code == ErrorCode::DiskFull {
            return StoreError::Full;
        }
    }
    StoreError::Sqlite(e)
}

type RawRow = (String, Vec<u8>, NamespaceId, Vec<u8>, i64, i64);

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
    ))
}

fn check_row(raw: RawRow) -> Result<Message> {
    let (hash, account, namespace, data, timestamp, expiry) = raw;
    let account = AccountId::from_stored(account)
        .map_err(|e| StoreError::CorruptRow(e.to_string()))?;
    Ok(Message {
        hash,
        account,
        namespace,
        data,
        timestamp_ms: timestamp as u64,
        expiry_ms: expiry as u64,
    })
}
