// The lease database: a transactional catalog of shares, leases, accounts,
// and crawler history.
//
// Mutating methods mark the connection dirty and batch into one SQL
// transaction; callers flush with `commit()` at logical boundaries
// (typically once per crawler slice). Dropping the connection mid-batch
// rolls the batch back. `add_history_entry` commits on its own because a
// history row must never straddle a slice transaction.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;

use holdfast_common::si::StorageIndex;
use holdfast_common::types::{LeaseInfo, ShareId, ShareState, ShareType, STARTER_ACCOUNT_ID,
    STARTER_LEASE_DURATION};

use crate::expiration::{ExpirationMode, ExpirationPolicy};

/// The only schema this build understands.
pub const SCHEMA_VERSION: i64 = 1;

/// History rows kept per database by default; the oldest are pruned on
/// insert.
pub const RETAINED_HISTORY_ENTRIES: usize = 10;

const SCHEMA_V1_SQL: &str = r#"
CREATE TABLE version (
    version         INTEGER NOT NULL
);
INSERT INTO version (version) VALUES (1);

CREATE TABLE shares (
    storage_index   VARCHAR(26) NOT NULL,
    shnum           INTEGER NOT NULL,
    prefix          VARCHAR(2) NOT NULL,
    backend_key     VARCHAR NULL,
    used_space      INTEGER NOT NULL,
    sharetype       INTEGER NOT NULL,
    state           INTEGER NOT NULL,
    PRIMARY KEY (storage_index, shnum)
);

CREATE INDEX shares_prefix_idx ON shares (prefix);

CREATE TABLE leases (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    storage_index   VARCHAR(26) NOT NULL,
    shnum           INTEGER NOT NULL,
    account_id      INTEGER NOT NULL,
    renewal_time    INTEGER NOT NULL,
    expiration_time INTEGER NOT NULL,
    FOREIGN KEY (storage_index, shnum) REFERENCES shares (storage_index, shnum),
    FOREIGN KEY (account_id) REFERENCES accounts (id)
);

CREATE INDEX leases_account_idx ON leases (account_id);
CREATE INDEX leases_renewal_idx ON leases (renewal_time);
CREATE INDEX leases_expiration_idx ON leases (expiration_time);

CREATE TABLE accounts (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    pubkey          VARCHAR(52),
    creation_time   INTEGER
);

CREATE UNIQUE INDEX accounts_pubkey_idx ON accounts (pubkey);

CREATE TABLE account_attributes (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    account_id      INTEGER,
    name            VARCHAR(20),
    value           VARCHAR
);

CREATE UNIQUE INDEX account_attributes_key_idx ON account_attributes (account_id, name);

INSERT INTO accounts (id, pubkey, creation_time) VALUES (0, 'anonymous', 0);
INSERT INTO accounts (id, pubkey, creation_time) VALUES (1, 'starter', 0);

CREATE TABLE crawler_history (
    cycle           INTEGER,
    json            TEXT
);

CREATE UNIQUE INDEX crawler_history_cycle_idx ON crawler_history (cycle);
"#;

#[derive(Debug, Error)]
pub enum LeaseDbError {
    #[error("share {si_s}/{shnum} is already in the shares table")]
    ShareAlreadyInDatabase { si_s: String, shnum: u32 },

    #[error("no share {si_s}/{shnum} in the shares table")]
    NonExistentShare { si_s: String, shnum: u32 },

    #[error("malformed account pubkey: {0:?}")]
    BadAccountName(String),

    #[error("lease database has schema version {found}, expected {SCHEMA_VERSION}")]
    SchemaMismatch { found: i64 },

    #[error("corrupt row in lease database: {0}")]
    CorruptRow(String),

    #[error("history entry JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

type Result<T> = std::result::Result<T, LeaseDbError>;

/// A row in the `shares` table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShareRecord {
    pub share_id: ShareId,
    pub prefix: String,
    pub backend_key: Option<String>,
    pub used_space: u64,
    pub sharetype: ShareType,
    pub state: ShareState,
}

#[derive(Debug)]
pub struct LeaseDb {
    conn: Connection,
    dirty: bool,
    retained_history_entries: usize,
}

impl LeaseDb {
    /// Open (creating if necessary) the lease database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        Self::initialize(Connection::open(path)?)
    }

    /// In-memory database for tests.
    pub fn open_in_memory() -> Result<Self> {
        Self::initialize(Connection::open_in_memory()?)
    }

    fn initialize(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "
            PRAGMA foreign_keys = ON;
            PRAGMA journal_mode = WAL;
            ",
        )?;

        let has_version: i64 = conn.query_row(
            "SELECT COUNT(1) FROM sqlite_master WHERE type = 'table' AND name = 'version'",
            [],
            |row| row.get(0),
        )?;

        if has_version == 0 {
            conn.execute_batch(SCHEMA_V1_SQL)?;
        } else {
            let found: i64 = conn.query_row("SELECT version FROM version", [], |row| row.get(0))?;
            if found != SCHEMA_VERSION {
                return Err(LeaseDbError::SchemaMismatch { found });
            }
        }

        Ok(Self { conn, dirty: false, retained_history_entries: RETAINED_HISTORY_ENTRIES })
    }

    pub fn schema_version(&self) -> Result<i64> {
        Ok(self.conn.query_row("SELECT version FROM version", [], |row| row.get(0))?)
    }

    pub fn set_retained_history_entries(&mut self, retained: usize) {
        self.retained_history_entries = retained;
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Start the batch transaction lazily on first mutation.
    fn touch(&mut self) -> Result<()> {
        if !self.dirty {
            self.conn.execute_batch("BEGIN")?;
            self.dirty = true;
        }
        Ok(())
    }

    /// Flush the current batch, if any.
    pub fn commit(&mut self) -> Result<()> {
        if self.dirty {
            self.conn.execute_batch("COMMIT")?;
            self.dirty = false;
        }
        Ok(())
    }

    /// Abandon the current batch, if any.
    pub fn rollback(&mut self) -> Result<()> {
        if self.dirty {
            self.conn.execute_batch("ROLLBACK")?;
            self.dirty = false;
        }
        Ok(())
    }

    // ── share management ───────────────────────────────────────────

    /// All shares whose prefix column matches, keyed by share id.
    pub fn get_shares_for_prefix(
        &self,
        prefix: &str,
    ) -> Result<HashMap<ShareId, (u64, ShareType)>> {
        let mut stmt = self.conn.prepare(
            "SELECT storage_index, shnum, used_space, sharetype FROM shares WHERE prefix = ?1",
        )?;
        let rows = stmt.query_map(params![prefix], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, i64>(3)?,
            ))
        })?;

        let mut shares = HashMap::new();
        for row in rows {
            let (si_s, shnum, used_space, sharetype) = row?;
            shares.insert(
                decode_share_id(&si_s, shnum)?,
                (used_space as u64, decode_sharetype(sharetype)?),
            );
        }
        Ok(shares)
    }

    /// Insert a share in state COMING with no backend key.
    pub fn add_new_share(
        &mut self,
        storage_index: &StorageIndex,
        shnum: u32,
        used_space: u64,
        sharetype: ShareType,
    ) -> Result<()> {
        let si_s = storage_index.to_base32();
        let prefix = storage_index.prefix();
        self.touch()?;
        let inserted = self.conn.execute(
            "INSERT INTO shares (storage_index, shnum, prefix, backend_key, used_space, \
             sharetype, state) \
             VALUES (?1, ?2, ?3, NULL, ?4, ?5, ?6)",
            params![
                si_s,
                shnum,
                prefix,
                used_space as i64,
                sharetype.code(),
                ShareState::Coming.code(),
            ],
        );

        match inserted {
            Ok(_) => Ok(()),
            Err(error) if is_constraint_violation(&error) => {
                Err(LeaseDbError::ShareAlreadyInDatabase { si_s, shnum })
            }
            Err(error) => Err(error.into()),
        }
    }

    /// Attach the crawler's starter lease to a share: account `starter`,
    /// renewed now, expiring two months out.
    pub fn add_starter_lease(
        &mut self,
        storage_index: &StorageIndex,
        shnum: u32,
        now: i64,
    ) -> Result<()> {
        let si_s = storage_index.to_base32();
        self.touch()?;
        self.conn.execute(
            "INSERT INTO leases (storage_index, shnum, account_id, renewal_time, \
             expiration_time) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![si_s, shnum, STARTER_ACCOUNT_ID, now, now + STARTER_LEASE_DURATION],
        )?;
        Ok(())
    }

    /// Record that the backend write completed. A share already on its way
    /// out (GOING) must not be re-stabilized; the guard makes that case look
    /// like a missing share.
    pub fn mark_share_as_stable(
        &mut self,
        storage_index: &StorageIndex,
        shnum: u32,
        used_space: u64,
        backend_key: Option<&str>,
    ) -> Result<()> {
        let si_s = storage_index.to_base32();
        self.touch()?;
        let changed = self.conn.execute(
            "UPDATE shares SET state = ?1, used_space = ?2, backend_key = ?3 \
             WHERE storage_index = ?4 AND shnum = ?5 AND state != ?6",
            params![
                ShareState::Stable.code(),
                used_space as i64,
                backend_key,
                si_s,
                shnum,
                ShareState::Going.code(),
            ],
        )?;
        if changed < 1 {
            return Err(LeaseDbError::NonExistentShare { si_s, shnum });
        }
        Ok(())
    }

    /// Record intent to delete. A COMING share aborting its upload must be
    /// removed outright instead, so the guard refuses it here.
    pub fn mark_share_as_going(&mut self, storage_index: &StorageIndex, shnum: u32) -> Result<()> {
        let si_s = storage_index.to_base32();
        self.touch()?;
        let changed = self.conn.execute(
            "UPDATE shares SET state = ?1 \
             WHERE storage_index = ?2 AND shnum = ?3 AND state != ?4",
            params![ShareState::Going.code(), si_s, shnum, ShareState::Coming.code()],
        )?;
        if changed < 1 {
            return Err(LeaseDbError::NonExistentShare { si_s, shnum });
        }
        Ok(())
    }

    /// Drop a share row and its leases. Absence is not an error.
    pub fn remove_deleted_share(&mut self, storage_index: &StorageIndex, shnum: u32) -> Result<()> {
        let si_s = storage_index.to_base32();
        self.touch()?;
        // Leases first, to keep the foreign key satisfied.
        self.conn.execute(
            "DELETE FROM leases WHERE storage_index = ?1 AND shnum = ?2",
            params![si_s, shnum],
        )?;
        self.conn.execute(
            "DELETE FROM shares WHERE storage_index = ?1 AND shnum = ?2",
            params![si_s, shnum],
        )?;
        Ok(())
    }

    pub fn change_share_space(
        &mut self,
        storage_index: &StorageIndex,
        shnum: u32,
        used_space: u64,
    ) -> Result<()> {
        let si_s = storage_index.to_base32();
        self.touch()?;
        let changed = self.conn.execute(
            "UPDATE shares SET used_space = ?1 WHERE storage_index = ?2 AND shnum = ?3",
            params![used_space as i64, si_s, shnum],
        )?;
        if changed < 1 {
            return Err(LeaseDbError::NonExistentShare { si_s, shnum });
        }
        Ok(())
    }

    /// Fetch one share row.
    pub fn get_share(
        &self,
        storage_index: &StorageIndex,
        shnum: u32,
    ) -> Result<Option<ShareRecord>> {
        let si_s = storage_index.to_base32();
        let row = self
            .conn
            .query_row(
                "SELECT storage_index, shnum, prefix, backend_key, used_space, sharetype, state \
                 FROM shares WHERE storage_index = ?1 AND shnum = ?2",
                params![si_s, shnum],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, Option<String>>(3)?,
                        row.get::<_, i64>(4)?,
                        row.get::<_, i64>(5)?,
                        row.get::<_, i64>(6)?,
                    ))
                },
            )
            .optional()?;

        let Some((si_s, shnum, prefix, backend_key, used_space, sharetype, state)) = row else {
            return Ok(None);
        };

        Ok(Some(ShareRecord {
            share_id: decode_share_id(&si_s, shnum)?,
            prefix,
            backend_key,
            used_space: used_space as u64,
            sharetype: decode_sharetype(sharetype)?,
            state: ShareState::from_code(state)
                .ok_or_else(|| LeaseDbError::CorruptRow(format!("share state {state}")))?,
        }))
    }

    // ── lease management ───────────────────────────────────────────

    /// Upsert the lease `(storage_index, shnum, account_id)` on one share,
    /// or on every share under `storage_index` when `shnum` is None.
    ///
    /// With `shnum = None` and no shares present this is a silent no-op;
    /// with a specific `shnum` a missing share is an error. Backdating is
    /// permitted: renewal times are not required to be monotonic.
    pub fn add_or_renew_leases(
        &mut self,
        storage_index: &StorageIndex,
        shnum: Option<u32>,
        account_id: i64,
        renewal_time: i64,
        expiration_time: i64,
    ) -> Result<()> {
        let si_s = storage_index.to_base32();

        let shnums: Vec<u32> = match shnum {
            Some(shnum) => {
                let found: Option<i64> = self
                    .conn
                    .query_row(
                        "SELECT shnum FROM shares WHERE storage_index = ?1 AND shnum = ?2",
                        params![si_s, shnum],
                        |row| row.get(0),
                    )
                    .optional()?;
                if found.is_none() {
                    return Err(LeaseDbError::NonExistentShare { si_s, shnum });
                }
                vec![shnum]
            }
            None => {
                let mut stmt = self
                    .conn
                    .prepare("SELECT shnum FROM shares WHERE storage_index = ?1")?;
                let rows = stmt.query_map(params![si_s], |row| row.get::<_, i64>(0))?;
                let mut shnums = Vec::new();
                for row in rows {
                    shnums.push(row? as u32);
                }
                shnums
            }
        };

        if shnums.is_empty() {
            return Ok(());
        }

        self.touch()?;
        for shnum in shnums {
            let existing: Option<i64> = self
                .conn
                .query_row(
                    "SELECT id FROM leases \
                     WHERE storage_index = ?1 AND shnum = ?2 AND account_id = ?3",
                    params![si_s, shnum, account_id],
                    |row| row.get(0),
                )
                .optional()?;

            match existing {
                Some(lease_id) => {
                    self.conn.execute(
                        "UPDATE leases SET renewal_time = ?1, expiration_time = ?2 WHERE id = ?3",
                        params![renewal_time, expiration_time, lease_id],
                    )?;
                }
                None => {
                    self.conn.execute(
                        "INSERT INTO leases (storage_index, shnum, account_id, renewal_time, \
                         expiration_time) \
                         VALUES (?1, ?2, ?3, ?4, ?5)",
                        params![si_s, shnum, account_id, renewal_time, expiration_time],
                    )?;
                }
            }
        }
        Ok(())
    }

    /// Every lease held by `account_id` on shares of `storage_index`.
    pub fn get_leases(&self, storage_index: &StorageIndex, account_id: i64) -> Result<Vec<LeaseInfo>> {
        let si_s = storage_index.to_base32();
        let mut stmt = self.conn.prepare(
            "SELECT shnum, renewal_time, expiration_time FROM leases \
             WHERE storage_index = ?1 AND account_id = ?2 \
             ORDER BY shnum ASC",
        )?;
        let rows = stmt.query_map(params![si_s, account_id], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?, row.get::<_, i64>(2)?))
        })?;

        let mut leases = Vec::new();
        for row in rows {
            let (shnum, renewal_time, expiration_time) = row?;
            leases.push(LeaseInfo {
                storage_index: *storage_index,
                shnum: shnum as u32,
                account_id,
                renewal_time,
                expiration_time,
            });
        }
        Ok(leases)
    }

    /// `now - renewal_time` for every lease on the share.
    pub fn get_lease_ages(
        &self,
        storage_index: &StorageIndex,
        shnum: u32,
        now: i64,
    ) -> Result<Vec<i64>> {
        let si_s = storage_index.to_base32();
        let mut stmt = self
            .conn
            .prepare("SELECT renewal_time FROM leases WHERE storage_index = ?1 AND shnum = ?2")?;
        let rows = stmt.query_map(params![si_s, shnum], |row| row.get::<_, i64>(0))?;

        let mut ages = Vec::new();
        for row in rows {
            ages.push(now - row?);
        }
        Ok(ages)
    }

    /// Shares with zero leases, as a negative join: these are the deletion
    /// candidates once the expired leases are gone.
    pub fn get_unleased_shares(&self, limit: Option<usize>) -> Result<Vec<(ShareId, ShareType)>> {
        // A negative LIMIT means "no limit" to SQLite.
        let limit = limit.map(|l| l as i64).unwrap_or(-1);
        let mut stmt = self.conn.prepare(
            "SELECT DISTINCT s.storage_index, s.shnum, s.sharetype \
             FROM shares s LEFT JOIN leases l \
             ON (s.storage_index = l.storage_index AND s.shnum = l.shnum) \
             WHERE l.storage_index IS NULL \
             ORDER BY s.storage_index ASC, s.shnum ASC \
             LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?, row.get::<_, i64>(2)?))
        })?;

        let mut shares = Vec::new();
        for row in rows {
            let (si_s, shnum, sharetype) = row?;
            shares.push((decode_share_id(&si_s, shnum)?, decode_sharetype(sharetype)?));
        }
        Ok(shares)
    }

    /// Delete every lease the policy considers expired as of `now`.
    ///
    /// Each mode reduces to a single range delete. The operation commits;
    /// returns the number of leases removed.
    pub fn remove_expired_leases(&mut self, policy: &ExpirationPolicy, now: i64) -> Result<u64> {
        if !policy.is_enabled() {
            return Ok(0);
        }

        self.touch()?;
        let deleted = match policy.mode() {
            ExpirationMode::Age { override_lease_duration: None } => self.conn.execute(
                "DELETE FROM leases WHERE expiration_time <= ?1",
                params![now],
            )?,
            ExpirationMode::Age { override_lease_duration: Some(duration) } => self.conn.execute(
                "DELETE FROM leases WHERE renewal_time + ?1 <= ?2",
                params![duration, now],
            )?,
            ExpirationMode::CutoffDate { cutoff_date } => self.conn.execute(
                "DELETE FROM leases WHERE renewal_time < ?1",
                params![cutoff_date],
            )?,
        };
        self.commit()?;
        Ok(deleted as u64)
    }

    // ── accounts ───────────────────────────────────────────────────

    /// Register an account keyed by its public key string.
    pub fn add_account(&mut self, pubkey: &str, creation_time: i64) -> Result<i64> {
        if pubkey.is_empty() || !pubkey.chars().all(|c| c.is_ascii_graphic()) {
            return Err(LeaseDbError::BadAccountName(pubkey.to_string()));
        }
        self.touch()?;
        self.conn.execute(
            "INSERT INTO accounts (pubkey, creation_time) VALUES (?1, ?2)",
            params![pubkey, creation_time],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn get_account_creation_time(&self, account_id: i64) -> Result<Option<i64>> {
        Ok(self
            .conn
            .query_row(
                "SELECT creation_time FROM accounts WHERE id = ?1",
                params![account_id],
                |row| row.get(0),
            )
            .optional()?)
    }

    /// All `(id, pubkey)` pairs, id ascending.
    pub fn get_all_accounts(&self) -> Result<Vec<(i64, String)>> {
        let mut stmt =
            self.conn.prepare("SELECT id, pubkey FROM accounts ORDER BY id ASC")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut accounts = Vec::new();
        for row in rows {
            accounts.push(row?);
        }
        Ok(accounts)
    }

    pub fn set_account_attribute(
        &mut self,
        account_id: i64,
        name: &str,
        value: &str,
    ) -> Result<()> {
        self.touch()?;
        self.conn.execute(
            "INSERT INTO account_attributes (account_id, name, value) VALUES (?1, ?2, ?3) \
             ON CONFLICT (account_id, name) DO UPDATE SET value = excluded.value",
            params![account_id, name, value],
        )?;
        Ok(())
    }

    pub fn get_account_attribute(&self, account_id: i64, name: &str) -> Result<Option<String>> {
        Ok(self
            .conn
            .query_row(
                "SELECT value FROM account_attributes WHERE account_id = ?1 AND name = ?2",
                params![account_id, name],
                |row| row.get(0),
            )
            .optional()?)
    }

    // ── crawler history ────────────────────────────────────────────

    /// Insert one cycle's history entry, pruning the oldest rows so the
    /// retained bound holds. Always commits.
    pub fn add_history_entry(&mut self, cycle: u64, entry: &serde_json::Value) -> Result<()> {
        let json = serde_json::to_string(entry)?;

        self.touch()?;
        let mut stmt = self.conn.prepare("SELECT cycle FROM crawler_history ORDER BY cycle ASC")?;
        let rows = stmt.query_map([], |row| row.get::<_, i64>(0))?;
        let mut cycles = Vec::new();
        for row in rows {
            cycles.push(row?);
        }
        drop(stmt);

        if self.retained_history_entries > 0 && cycles.len() >= self.retained_history_entries {
            let keep = self.retained_history_entries - 1;
            if keep == 0 {
                self.conn.execute("DELETE FROM crawler_history", [])?;
            } else {
                let first_cycle_to_retain = cycles[cycles.len() - keep];
                self.conn.execute(
                    "DELETE FROM crawler_history WHERE cycle < ?1",
                    params![first_cycle_to_retain],
                )?;
            }
        }

        self.conn.execute(
            "INSERT OR REPLACE INTO crawler_history (cycle, json) VALUES (?1, ?2)",
            params![cycle as i64, json],
        )?;
        self.commit()?;
        Ok(())
    }

    /// All retained history entries, keyed by cycle.
    pub fn get_history(&self) -> Result<std::collections::BTreeMap<u64, serde_json::Value>> {
        let mut stmt = self.conn.prepare("SELECT cycle, json FROM crawler_history")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)))?;

        let mut history = std::collections::BTreeMap::new();
        for row in rows {
            let (cycle, json) = row?;
            history.insert(cycle as u64, serde_json::from_str(&json)?);
        }
        Ok(history)
    }
}

fn is_constraint_violation(error: &rusqlite::Error) -> bool {
    matches!(
        error,
        rusqlite::Error::SqliteFailure(e, _)
            if e.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

fn decode_share_id(si_s: &str, shnum: i64) -> Result<ShareId> {
    let storage_index = StorageIndex::parse(si_s)
        .map_err(|_| LeaseDbError::CorruptRow(format!("storage index {si_s:?}")))?;
    Ok(ShareId::new(storage_index, shnum as u32))
}

fn decode_sharetype(code: i64) -> Result<ShareType> {
    ShareType::from_code(code)
        .ok_or_else(|| LeaseDbError::CorruptRow(format!("sharetype {code}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use holdfast_common::types::ANONYMOUS_ACCOUNT_ID;

    fn si(fill: u8) -> StorageIndex {
        StorageIndex::new([fill; 16])
    }

    fn db_with_share(storage_index: &StorageIndex, shnum: u32) -> LeaseDb {
        let mut db = LeaseDb::open_in_memory().unwrap();
        db.add_new_share(storage_index, shnum, 1000, ShareType::Immutable).unwrap();
        db.commit().unwrap();
        db
    }

    // ── schema ─────────────────────────────────────────────────────

    #[test]
    fn open_creates_schema_and_seeded_accounts() {
        let db = LeaseDb::open_in_memory().unwrap();
        assert_eq!(db.schema_version().unwrap(), 1);
        assert_eq!(
            db.get_all_accounts().unwrap(),
            vec![(0, "anonymous".to_string()), (1, "starter".to_string())]
        );
        assert_eq!(db.get_account_creation_time(0).unwrap(), Some(0));
        assert_eq!(db.get_account_creation_time(99).unwrap(), None);
    }

    #[test]
    fn reopening_existing_database_is_idempotent() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("leases.db");
        {
            let mut db = LeaseDb::open(&path).unwrap();
            db.add_new_share(&si(1), 0, 10, ShareType::Mutable).unwrap();
            db.commit().unwrap();
        }
        let db = LeaseDb::open(&path).unwrap();
        assert_eq!(db.schema_version().unwrap(), 1);
        assert!(db.get_share(&si(1), 0).unwrap().is_some());
    }

    #[test]
    fn unknown_schema_version_is_fatal() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("leases.db");
        {
            let db = LeaseDb::open(&path).unwrap();
            db.conn.execute("UPDATE version SET version = 7", []).unwrap();
        }
        match LeaseDb::open(&path) {
            Err(LeaseDbError::SchemaMismatch { found: 7 }) => {}
            other => panic!("expected schema mismatch, got {other:?}"),
        }
    }

    // ── share lifecycle ────────────────────────────────────────────

    #[test]
    fn new_share_starts_in_coming_state() {
        let db = db_with_share(&si(1), 0);
        let record = db.get_share(&si(1), 0).unwrap().unwrap();
        assert_eq!(record.state, ShareState::Coming);
        assert_eq!(record.used_space, 1000);
        assert_eq!(record.sharetype, ShareType::Immutable);
        assert_eq!(record.backend_key, None);
        assert_eq!(record.prefix, si(1).prefix());
    }

    #[test]
    fn duplicate_share_insert_is_rejected() {
        let mut db = db_with_share(&si(1), 0);
        match db.add_new_share(&si(1), 0, 500, ShareType::Mutable) {
            Err(LeaseDbError::ShareAlreadyInDatabase { shnum: 0, .. }) => {}
            other => panic!("expected ShareAlreadyInDatabase, got {other:?}"),
        }
    }

    #[test]
    fn stable_transition_records_space_and_backend_key() {
        let mut db = db_with_share(&si(1), 0);
        db.mark_share_as_stable(&si(1), 0, 2048, Some("key")).unwrap();
        let record = db.get_share(&si(1), 0).unwrap().unwrap();
        assert_eq!(record.state, ShareState::Stable);
        assert_eq!(record.used_space, 2048);
        assert_eq!(record.backend_key.as_deref(), Some("key"));
    }

    #[test]
    fn going_share_cannot_be_restabilized() {
        let mut db = db_with_share(&si(1), 0);
        db.mark_share_as_stable(&si(1), 0, 1000, None).unwrap();
        db.mark_share_as_going(&si(1), 0).unwrap();
        assert!(matches!(
            db.mark_share_as_stable(&si(1), 0, 1000, None),
            Err(LeaseDbError::NonExistentShare { .. })
        ));
        assert_eq!(db.get_share(&si(1), 0).unwrap().unwrap().state, ShareState::Going);
    }

    #[test]
    fn coming_share_cannot_be_marked_going() {
        let mut db = db_with_share(&si(1), 0);
        assert!(matches!(
            db.mark_share_as_going(&si(1), 0),
            Err(LeaseDbError::NonExistentShare { .. })
        ));
    }

    #[test]
    fn lifecycle_transitions_on_missing_share_fail() {
        let mut db = LeaseDb::open_in_memory().unwrap();
        assert!(matches!(
            db.mark_share_as_stable(&si(9), 3, 10, None),
            Err(LeaseDbError::NonExistentShare { .. })
        ));
        assert!(matches!(
            db.mark_share_as_going(&si(9), 3),
            Err(LeaseDbError::NonExistentShare { .. })
        ));
        assert!(matches!(
            db.change_share_space(&si(9), 3, 10),
            Err(LeaseDbError::NonExistentShare { .. })
        ));
    }

    #[test]
    fn remove_deleted_share_drops_leases_and_is_idempotent() {
        let mut db = db_with_share(&si(1), 0);
        db.add_or_renew_leases(&si(1), Some(0), ANONYMOUS_ACCOUNT_ID, 100, 200).unwrap();
        db.remove_deleted_share(&si(1), 0).unwrap();
        assert!(db.get_share(&si(1), 0).unwrap().is_none());
        assert!(db.get_leases(&si(1), ANONYMOUS_ACCOUNT_ID).unwrap().is_empty());
        // Absence is not an error.
        db.remove_deleted_share(&si(1), 0).unwrap();
    }

    #[test]
    fn change_share_space_updates_row() {
        let mut db = db_with_share(&si(1), 0);
        db.change_share_space(&si(1), 0, 4242).unwrap();
        assert_eq!(db.get_share(&si(1), 0).unwrap().unwrap().used_space, 4242);
    }

    #[test]
    fn get_shares_for_prefix_only_sees_matching_prefix() {
        let mut db = LeaseDb::open_in_memory().unwrap();
        db.add_new_share(&si(0), 0, 10, ShareType::Immutable).unwrap();
        db.add_new_share(&si(0), 1, 20, ShareType::Mutable).unwrap();
        db.add_new_share(&si(0xff), 0, 30, ShareType::Unknown).unwrap();
        db.commit().unwrap();

        let shares = db.get_shares_for_prefix(&si(0).prefix()).unwrap();
        assert_eq!(shares.len(), 2);
        assert_eq!(shares[&ShareId::new(si(0), 0)], (10, ShareType::Immutable));
        assert_eq!(shares[&ShareId::new(si(0), 1)], (20, ShareType::Mutable));
    }

    // ── leases ─────────────────────────────────────────────────────

    #[test]
    fn renewal_upserts_single_lease_row() {
        let mut db = db_with_share(&si(1), 0);
        db.add_or_renew_leases(&si(1), Some(0), 7, 1000, 2000).unwrap();
        db.add_or_renew_leases(&si(1), Some(0), 7, 3000, 4000).unwrap();
        db.commit().unwrap();

        let leases = db.get_leases(&si(1), 7).unwrap();
        assert_eq!(leases.len(), 1);
        assert_eq!(leases[0].renewal_time, 3000);
        assert_eq!(leases[0].expiration_time, 4000);
    }

    #[test]
    fn renewal_may_backdate() {
        let mut db = db_with_share(&si(1), 0);
        db.add_or_renew_leases(&si(1), Some(0), 7, 3000, 4000).unwrap();
        db.add_or_renew_leases(&si(1), Some(0), 7, 1000, 2000).unwrap();

        let leases = db.get_leases(&si(1), 7).unwrap();
        assert_eq!((leases[0].renewal_time, leases[0].expiration_time), (1000, 2000));
    }

    #[test]
    fn wildcard_shnum_touches_every_share_of_the_bucket() {
        let mut db = LeaseDb::open_in_memory().unwrap();
        db.add_new_share(&si(1), 0, 10, ShareType::Immutable).unwrap();
        db.add_new_share(&si(1), 1, 10, ShareType::Immutable).unwrap();
        db.add_or_renew_leases(&si(1), None, 7, 100, 200).unwrap();

        let leases = db.get_leases(&si(1), 7).unwrap();
        assert_eq!(leases.iter().map(|l| l.shnum).collect::<Vec<_>>(), vec![0, 1]);
    }

    #[test]
    fn wildcard_on_empty_bucket_is_a_silent_noop() {
        let mut db = LeaseDb::open_in_memory().unwrap();
        db.add_or_renew_leases(&si(1), None, 7, 100, 200).unwrap();
        assert!(db.get_leases(&si(1), 7).unwrap().is_empty());
    }

    #[test]
    fn specific_shnum_on_missing_share_fails() {
        let mut db = LeaseDb::open_in_memory().unwrap();
        assert!(matches!(
            db.add_or_renew_leases(&si(1), Some(0), 7, 100, 200),
            Err(LeaseDbError::NonExistentShare { .. })
        ));
    }

    #[test]
    fn distinct_accounts_hold_distinct_leases() {
        let mut db = db_with_share(&si(1), 0);
        db.add_or_renew_leases(&si(1), Some(0), 7, 100, 200).unwrap();
        db.add_or_renew_leases(&si(1), Some(0), 8, 300, 400).unwrap();

        assert_eq!(db.get_leases(&si(1), 7).unwrap().len(), 1);
        assert_eq!(db.get_leases(&si(1), 8).unwrap().len(), 1);
        assert_eq!(db.get_lease_ages(&si(1), 0, 500).unwrap().len(), 2);
    }

    #[test]
    fn lease_ages_are_measured_from_renewal() {
        let mut db = db_with_share(&si(1), 0);
        db.add_or_renew_leases(&si(1), Some(0), 7, 100, 200).unwrap();
        db.add_or_renew_leases(&si(1), Some(0), 8, 250, 400).unwrap();

        let mut ages = db.get_lease_ages(&si(1), 0, 300).unwrap();
        ages.sort_unstable();
        assert_eq!(ages, vec![50, 200]);
    }

    #[test]
    fn starter_lease_has_two_month_duration() {
        let mut db = db_with_share(&si(1), 0);
        db.add_starter_lease(&si(1), 0, 1_000_000).unwrap();

        let leases = db.get_leases(&si(1), STARTER_ACCOUNT_ID).unwrap();
        assert_eq!(leases.len(), 1);
        assert_eq!(leases[0].renewal_time, 1_000_000);
        assert_eq!(leases[0].expiration_time - leases[0].renewal_time, 5_184_000);
    }

    #[test]
    fn unleased_shares_reports_shares_without_any_lease() {
        let mut db = LeaseDb::open_in_memory().unwrap();
        db.add_new_share(&si(1), 0, 10, ShareType::Immutable).unwrap();
        db.add_new_share(&si(1), 1, 10, ShareType::Mutable).unwrap();
        db.add_new_share(&si(2), 0, 10, ShareType::Unknown).unwrap();
        db.add_or_renew_leases(&si(1), Some(0), 7, 100, 200).unwrap();
        db.commit().unwrap();

        let unleased = db.get_unleased_shares(None).unwrap();
        assert_eq!(
            unleased,
            vec![
                (ShareId::new(si(1), 1), ShareType::Mutable),
                (ShareId::new(si(2), 0), ShareType::Unknown),
            ]
        );

        let limited = db.get_unleased_shares(Some(1)).unwrap();
        assert_eq!(limited.len(), 1);
    }

    // ── expiration ─────────────────────────────────────────────────

    #[test]
    fn disabled_policy_removes_nothing() {
        let mut db = db_with_share(&si(1), 0);
        db.add_or_renew_leases(&si(1), Some(0), 7, 0, 1).unwrap();
        db.commit().unwrap();

        let removed = db.remove_expired_leases(&ExpirationPolicy::disabled(), i64::MAX).unwrap();
        assert_eq!(removed, 0);
        assert_eq!(db.get_leases(&si(1), 7).unwrap().len(), 1);
    }

    #[test]
    fn age_override_expires_only_past_renewal_window() {
        let mut db = db_with_share(&si(1), 0);
        db.add_or_renew_leases(&si(1), Some(0), 7, 1000, 2000).unwrap();
        db.commit().unwrap();

        let policy = ExpirationPolicy::new(
            true,
            ExpirationMode::Age { override_lease_duration: Some(100) },
        );
        assert_eq!(db.remove_expired_leases(&policy, 1050).unwrap(), 0);
        assert_eq!(db.get_leases(&si(1), 7).unwrap().len(), 1);

        assert_eq!(db.remove_expired_leases(&policy, 1101).unwrap(), 1);
        assert!(db.get_leases(&si(1), 7).unwrap().is_empty());
    }

    #[test]
    fn natural_age_mode_uses_lease_expiration_time() {
        let mut db = db_with_share(&si(1), 0);
        db.add_or_renew_leases(&si(1), Some(0), 7, 1000, 2000).unwrap();
        db.commit().unwrap();

        let policy =
            ExpirationPolicy::new(true, ExpirationMode::Age { override_lease_duration: None });
        assert_eq!(db.remove_expired_leases(&policy, 1999).unwrap(), 0);
        assert_eq!(db.remove_expired_leases(&policy, 2000).unwrap(), 1);
    }

    #[test]
    fn cutoff_policy_splits_on_renewal_time() {
        let mut db = LeaseDb::open_in_memory().unwrap();
        db.add_new_share(&si(1), 0, 10, ShareType::Immutable).unwrap();
        db.add_new_share(&si(1), 1, 10, ShareType::Immutable).unwrap();
        db.add_or_renew_leases(&si(1), Some(0), 7, 499, 10_000).unwrap();
        db.add_or_renew_leases(&si(1), Some(1), 7, 501, 10_000).unwrap();
        db.commit().unwrap();

        let policy = ExpirationPolicy::new(true, ExpirationMode::CutoffDate { cutoff_date: 500 });
        assert_eq!(db.remove_expired_leases(&policy, 9_999).unwrap(), 1);

        let surviving = db.get_leases(&si(1), 7).unwrap();
        assert_eq!(surviving.len(), 1);
        assert_eq!(surviving[0].shnum, 1);
        assert_eq!(surviving[0].renewal_time, 501);
    }

    // ── accounts ───────────────────────────────────────────────────

    #[test]
    fn add_account_assigns_next_id() {
        let mut db = LeaseDb::open_in_memory().unwrap();
        let id = db.add_account("pubkey-v0-alice", 12345).unwrap();
        assert_eq!(id, 2);
        assert_eq!(db.get_account_creation_time(id).unwrap(), Some(12345));
    }

    #[test]
    fn add_account_rejects_malformed_pubkeys() {
        let mut db = LeaseDb::open_in_memory().unwrap();
        assert!(matches!(db.add_account("", 0), Err(LeaseDbError::BadAccountName(_))));
        assert!(matches!(
            db.add_account("key with spaces", 0),
            Err(LeaseDbError::BadAccountName(_))
        ));
    }

    #[test]
    fn duplicate_pubkey_violates_unique_index() {
        let mut db = LeaseDb::open_in_memory().unwrap();
        db.add_account("pubkey-v0-alice", 0).unwrap();
        assert!(db.add_account("pubkey-v0-alice", 1).is_err());
    }

    #[test]
    fn account_attributes_upsert_on_conflict() {
        let mut db = LeaseDb::open_in_memory().unwrap();
        db.set_account_attribute(0, "quota", "100").unwrap();
        db.set_account_attribute(0, "quota", "200").unwrap();
        db.set_account_attribute(1, "quota", "300").unwrap();

        assert_eq!(db.get_account_attribute(0, "quota").unwrap().as_deref(), Some("200"));
        assert_eq!(db.get_account_attribute(1, "quota").unwrap().as_deref(), Some("300"));
        assert_eq!(db.get_account_attribute(0, "missing").unwrap(), None);
    }

    // ── history ────────────────────────────────────────────────────

    #[test]
    fn history_round_trips_json_values() {
        let mut db = LeaseDb::open_in_memory().unwrap();
        let entry = serde_json::json!({
            "cycle-start-finish-times": [100, 200],
            "expiration-enabled": false,
            "lease-age-histogram": [[0, 86400, 3]],
        });
        db.add_history_entry(4, &entry).unwrap();

        let history = db.get_history().unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[&4], entry);
    }

    #[test]
    fn history_is_pruned_to_retained_bound() {
        let mut db = LeaseDb::open_in_memory().unwrap();
        db.set_retained_history_entries(3);
        for cycle in 1..=5u64 {
            db.add_history_entry(cycle, &serde_json::json!({ "cycle": cycle })).unwrap();
        }

        let cycles: Vec<u64> = db.get_history().unwrap().keys().copied().collect();
        assert_eq!(cycles, vec![3, 4, 5]);
    }

    #[test]
    fn history_insert_commits_even_without_other_mutations() {
        let mut db = LeaseDb::open_in_memory().unwrap();
        db.add_history_entry(1, &serde_json::json!({})).unwrap();
        assert!(!db.is_dirty());
    }

    #[test]
    fn reinserting_a_cycle_replaces_the_entry() {
        let mut db = LeaseDb::open_in_memory().unwrap();
        db.add_history_entry(1, &serde_json::json!({ "v": 1 })).unwrap();
        db.add_history_entry(1, &serde_json::json!({ "v": 2 })).unwrap();

        let history = db.get_history().unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[&1], serde_json::json!({ "v": 2 }));
    }

    // ── batching ───────────────────────────────────────────────────

    #[test]
    fn mutations_mark_dirty_until_commit() {
        let mut db = LeaseDb::open_in_memory().unwrap();
        assert!(!db.is_dirty());
        db.add_new_share(&si(1), 0, 10, ShareType::Immutable).unwrap();
        assert!(db.is_dirty());
        db.commit().unwrap();
        assert!(!db.is_dirty());
    }

    #[test]
    fn rollback_discards_the_batch() {
        let mut db = LeaseDb::open_in_memory().unwrap();
        db.add_new_share(&si(1), 0, 10, ShareType::Immutable).unwrap();
        db.rollback().unwrap();
        assert!(!db.is_dirty());
        assert!(db.get_share(&si(1), 0).unwrap().is_none());
    }
}
