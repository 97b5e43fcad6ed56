use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use crate::flag::{BulkFailure, BulkOperationResult, Flag, FlagGrant};
use crate::FlagError;

const ALREADY_HAS_ACCESS: &str = "subject already has access";
const NO_ACCESS: &str = "subject does not have access";

/// Persistence contract every backend must satisfy. The evaluator holds
/// exactly one implementation and delegates to it without caching, so every
/// call reflects current store state.
#[async_trait]
pub trait StorageAdapter: Send + Sync {
    /// Never fails on a missing flag; that resolves to `false`.
    async fn is_enabled(&self, flag_name: &str, subject_id: &str) -> Result<bool, FlagError>;

    /// Idempotent upsert; repeat grants are not an error.
    async fn grant_access(&self, flag_name: &str, subject_id: &str) -> Result<(), FlagError>;

    /// No-op if the subject holds no grant.
    async fn revoke_access(&self, flag_name: &str, subject_id: &str) -> Result<(), FlagError>;

    /// Unlike the single-subject call, granting to a subject that already
    /// has access is reported in `failed`. One subject's outcome never
    /// aborts the rest. Fails with `NotFound` before touching any subject
    /// if the flag is missing.
    async fn grant_access_bulk(
        &self,
        flag_name: &str,
        subject_ids: &[String],
    ) -> Result<BulkOperationResult, FlagError>;

    /// Bulk counterpart of `revoke_access`; revoking a subject without
    /// access is reported in `failed`.
    async fn revoke_access_bulk(
        &self,
        flag_name: &str,
        subject_ids: &[String],
    ) -> Result<BulkOperationResult, FlagError>;

    async fn enable_for_all(&self, flag_name: &str) -> Result<(), FlagError>;

    /// Clears the override and every individual grant, so no subject keeps
    /// residual access without opting back in.
    async fn disable_for_all(&self, flag_name: &str) -> Result<(), FlagError>;

    /// Every flag for which `is_enabled` holds for this subject. Order is
    /// stable within one store state only.
    async fn get_active_flags(&self, subject_id: &str) -> Result<Vec<Flag>, FlagError>;

    /// Fails with `Conflict` if the name is taken.
    async fn create_flag(&self, name: &str) -> Result<Flag, FlagError>;

    /// Cascades to the flag's grants; no orphans survive.
    async fn delete_flag(&self, name: &str) -> Result<(), FlagError>;

    async fn list_flags(&self) -> Result<Vec<Flag>, FlagError>;

    async fn get_flag(&self, name: &str) -> Result<Option<Flag>, FlagError>;
}

struct FlagRecord {
    flag: Flag,
    grants: HashMap<String, FlagGrant>,
}

impl FlagRecord {
    fn has_access(&self, subject_id: &str) -> bool {
        self.flag.enabled_for_all
            || self
                .grants
                .get(subject_id)
                .map(|grant| grant.enabled)
                .unwrap_or(false)
    }
}

/// Reference backend: a concurrency-safe map keyed by flag name. Revoking
/// removes the grant outright rather than soft-disabling it.
pub struct MemoryAdapter {
    flags: RwLock<HashMap<String, FlagRecord>>,
    next_id: AtomicU64,
}

impl MemoryAdapter {
    pub fn new() -> Self {
        Self {
            flags: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    fn next_id(&self) -> String {
        self.next_id.fetch_add(1, Ordering::Relaxed).to_string()
    }

    pub async fn clear(&self) {
        self.flags.write().await.clear();
    }

    /// Test/bootstrap helper: create each flag and grant it to its subjects.
    pub async fn seed(&self, data: &[(&str, &[&str])]) -> Result<(), FlagError> {
        for (flag_name, subject_ids) in data {
            self.create_flag(flag_name).await?;
            for subject_id in *subject_ids {
                self.grant_access(flag_name, subject_id).await?;
            }
        }
        Ok(())
    }
}

impl Default for MemoryAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StorageAdapter for MemoryAdapter {
    async fn is_enabled(&self, flag_name: &str, subject_id: &str) -> Result<bool, FlagError> {
        let flags = self.flags.read().await;
        Ok(flags
            .get(flag_name)
            .map(|record| record.has_access(subject_id))
            .unwrap_or(false))
    }

    async fn grant_access(&self, flag_name: &str, subject_id: &str) -> Result<(), FlagError> {
        let mut flags = self.flags.write().await;
        let record = flags
            .get_mut(flag_name)
            .ok_or_else(|| FlagError::NotFound(flag_name.to_string()))?;

        if let Some(grant) = record.grants.get_mut(subject_id) {
            grant.enabled = true;
        } else {
            let grant = FlagGrant {
                id: self.next_id(),
                flag_id: record.flag.id.clone(),
                subject_id: subject_id.to_string(),
                enabled: true,
                created_at: Utc::now(),
            };
            record.grants.insert(subject_id.to_string(), grant);
        }
        record.flag.updated_at = Utc::now();
        Ok(())
    }

    async fn revoke_access(&self, flag_name: &str, subject_id: &str) -> Result<(), FlagError> {
        let mut flags = self.flags.write().await;
        let record = flags
            .get_mut(flag_name)
            .ok_or_else(|| FlagError::NotFound(flag_name.to_string()))?;

        if record.grants.remove(subject_id).is_some() {
            record.flag.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn grant_access_bulk(
        &self,
        flag_name: &str,
        subject_ids: &[String],
    ) -> Result<BulkOperationResult, FlagError> {
        let mut flags = self.flags.write().await;
        let record = flags
            .get_mut(flag_name)
            .ok_or_else(|| FlagError::NotFound(flag_name.to_string()))?;

        let mut result = BulkOperationResult::default();
        for subject_id in subject_ids {
            // Keyed off the grant alone: enabled_for_all does not make a
            // personal grant redundant, it only overrides evaluation.
            let already = record
                .grants
                .get(subject_id.as_str())
                .map(|grant| grant.enabled)
                .unwrap_or(false);
            if already {
                result.failed.push(BulkFailure {
                    subject_id: subject_id.clone(),
                    error: ALREADY_HAS_ACCESS.to_string(),
                });
                continue;
            }
            let grant = FlagGrant {
                id: self.next_id(),
                flag_id: record.flag.id.clone(),
                subject_id: subject_id.clone(),
                enabled: true,
                created_at: Utc::now(),
            };
            record.grants.insert(subject_id.clone(), grant);
            record.flag.updated_at = Utc::now();
            result.successful.push(subject_id.clone());
        }
        Ok(result)
    }

    async fn revoke_access_bulk(
        &self,
        flag_name: &str,
        subject_ids: &[String],
    ) -> Result<BulkOperationResult, FlagError> {
        let mut flags = self.flags.write().await;
        let record = flags
            .get_mut(flag_name)
            .ok_or_else(|| FlagError::NotFound(flag_name.to_string()))?;

        let mut result = BulkOperationResult::default();
        for subject_id in subject_ids {
            if record.grants.remove(subject_id.as_str()).is_some() {
                record.flag.updated_at = Utc::now();
                result.successful.push(subject_id.clone());
            } else {
                result.failed.push(BulkFailure {
                    subject_id: subject_id.clone(),
                    error: NO_ACCESS.to_string(),
                });
            }
        }
        Ok(result)
    }

    async fn enable_for_all(&self, flag_name: &str) -> Result<(), FlagError> {
        let mut flags = self.flags.write().await;
        let record = flags
            .get_mut(flag_name)
            .ok_or_else(|| FlagError::NotFound(flag_name.to_string()))?;

        record.flag.enabled_for_all = true;
        record.flag.updated_at = Utc::now();
        Ok(())
    }

    async fn disable_for_all(&self, flag_name: &str) -> Result<(), FlagError> {
        let mut flags = self.flags.write().await;
        let record = flags
            .get_mut(flag_name)
            .ok_or_else(|| FlagError::NotFound(flag_name.to_string()))?;

        record.flag.enabled_for_all = false;
        record.grants.clear();
        record.flag.updated_at = Utc::now();
        Ok(())
    }

    async fn get_active_flags(&self, subject_id: &str) -> Result<Vec<Flag>, FlagError> {
        let flags = self.flags.read().await;
        Ok(flags
            .values()
            .filter(|record| record.has_access(subject_id))
            .map(|record| record.flag.clone())
            .collect())
    }

    async fn create_flag(&self, name: &str) -> Result<Flag, FlagError> {
        let mut flags = self.flags.write().await;
        if flags.contains_key(name) {
            return Err(FlagError::Conflict(name.to_string()));
        }

        let now = Utc::now();
        let flag = Flag {
            id: self.next_id(),
            name: name.to_string(),
            enabled_for_all: false,
            created_at: now,
            updated_at: now,
        };
        flags.insert(
            name.to_string(),
            FlagRecord {
                flag: flag.clone(),
                grants: HashMap::new(),
            },
        );
        Ok(flag)
    }

    async fn delete_flag(&self, name: &str) -> Result<(), FlagError> {
        let mut flags = self.flags.write().await;
        // The record owns its grants, so removing it is the cascade.
        flags
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| FlagError::NotFound(name.to_string()))
    }

    async fn list_flags(&self) -> Result<Vec<Flag>, FlagError> {
        let flags = self.flags.read().await;
        Ok(flags.values().map(|record| record.flag.clone()).collect())
    }

    async fn get_flag(&self, name: &str) -> Result<Option<Flag>, FlagError> {
        let flags = self.flags.read().await;
        Ok(flags.get(name).map(|record| record.flag.clone()))
    }
}

#[cfg(feature = "rusqlite")]
pub use self::sqlite::SqliteAdapter;

#[cfg(feature = "rusqlite")]
mod sqlite {
    use std::path::Path;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use rusqlite::{params, Connection, ErrorCode, Row};

    use super::{StorageAdapter, ALREADY_HAS_ACCESS, NO_ACCESS};
    use crate::flag::{BulkFailure, BulkOperationResult, Flag};
    use crate::FlagError;

    const SCHEMA: &str = "
        CREATE TABLE IF NOT EXISTS flags (
            id INTEGER PRIMARY KEY,
            name TEXT NOT NULL UNIQUE,
            enabled_for_all INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS grants (
            id INTEGER PRIMARY KEY,
            flag_id INTEGER NOT NULL REFERENCES flags(id) ON DELETE CASCADE,
            subject_id TEXT NOT NULL,
            enabled INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL,
            UNIQUE(flag_id, subject_id)
        );
    ";

    /// Relational backend. Revoking soft-disables the grant row so the
    /// record survives for later re-grants; `disable_for_all` deletes the
    /// rows outright.
    pub struct SqliteAdapter {
        conn: Mutex<Connection>,
    }

    impl SqliteAdapter {
        pub fn new(path: impl AsRef<Path>) -> Result<Self, FlagError> {
            Self::from_connection(Connection::open(path)?)
        }

        pub fn in_memory() -> Result<Self, FlagError> {
            Self::from_connection(Connection::open_in_memory()?)
        }

        fn from_connection(conn: Connection) -> Result<Self, FlagError> {
            // Foreign keys are off by default in sqlite; the grant cascade
            // relies on them.
            conn.execute_batch("PRAGMA foreign_keys = ON")?;
            conn.execute_batch(SCHEMA)?;
            Ok(Self {
                conn: Mutex::new(conn),
            })
        }

        fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, FlagError> {
            self.conn
                .lock()
                .map_err(|_| FlagError::Storage("sqlite connection lock poisoned".to_string()))
        }
    }

    fn parse_ts(raw: &str) -> Result<DateTime<Utc>, FlagError> {
        DateTime::parse_from_rfc3339(raw)
            .map(|ts| ts.with_timezone(&Utc))
            .map_err(|e| FlagError::Storage(format!("bad timestamp {raw:?}: {e}")))
    }

    struct FlagRow {
        id: i64,
        name: String,
        enabled_for_all: bool,
        created_at: String,
        updated_at: String,
    }

    impl FlagRow {
        const COLUMNS: &'static str = "id, name, enabled_for_all, created_at, updated_at";

        fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
            Ok(Self {
                id: row.get(0)?,
                name: row.get(1)?,
                enabled_for_all: row.get::<_, i64>(2)? != 0,
                created_at: row.get(3)?,
                updated_at: row.get(4)?,
            })
        }

        fn into_flag(self) -> Result<Flag, FlagError> {
            Ok(Flag {
                id: self.id.to_string(),
                name: self.name,
                enabled_for_all: self.enabled_for_all,
                created_at: parse_ts(&self.created_at)?,
                updated_at: parse_ts(&self.updated_at)?,
            })
        }
    }

    fn flag_id(conn: &Connection, name: &str) -> Result<i64, FlagError> {
        match conn.query_row(
            "SELECT id FROM flags WHERE name = ?1",
            params![name],
            |row| row.get(0),
        ) {
            Ok(id) => Ok(id),
            Err(rusqlite::Error::QueryReturnedNoRows) => Err(FlagError::NotFound(name.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    fn touch_flag(conn: &Connection, id: i64) -> Result<(), FlagError> {
        conn.execute(
            "UPDATE flags SET updated_at = ?2 WHERE id = ?1",
            params![id, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    /// `Some(enabled)` if a grant row exists for the pair.
    fn grant_state(conn: &Connection, flag_id: i64, subject_id: &str) -> Result<Option<bool>, FlagError> {
        match conn.query_row(
            "SELECT enabled FROM grants WHERE flag_id = ?1 AND subject_id = ?2",
            params![flag_id, subject_id],
            |row| row.get::<_, i64>(0),
        ) {
            Ok(enabled) => Ok(Some(enabled != 0)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn upsert_grant(conn: &Connection, flag_id: i64, subject_id: &str) -> Result<(), FlagError> {
        conn.execute(
            "INSERT INTO grants (flag_id, subject_id, enabled, created_at)
             VALUES (?1, ?2, 1, ?3)
             ON CONFLICT(flag_id, subject_id) DO UPDATE SET enabled = 1",
            params![flag_id, subject_id, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    #[async_trait]
    impl StorageAdapter for SqliteAdapter {
        async fn is_enabled(&self, flag_name: &str, subject_id: &str) -> Result<bool, FlagError> {
            let conn = self.lock()?;
            let row = conn.query_row(
                "SELECT f.enabled_for_all, g.enabled
                 FROM flags f
                 LEFT JOIN grants g ON g.flag_id = f.id AND g.subject_id = ?2
                 WHERE f.name = ?1",
                params![flag_name, subject_id],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)? != 0,
                        row.get::<_, Option<i64>>(1)?.map(|v| v != 0),
                    ))
                },
            );
            match row {
                Ok((enabled_for_all, grant)) => Ok(enabled_for_all || grant.unwrap_or(false)),
                Err(rusqlite::Error::QueryReturnedNoRows) => Ok(false),
                Err(e) => Err(e.into()),
            }
        }

        async fn grant_access(&self, flag_name: &str, subject_id: &str) -> Result<(), FlagError> {
            let mut conn = self.lock()?;
            let tx = conn.transaction()?;
            let id = flag_id(&tx, flag_name)?;
            upsert_grant(&tx, id, subject_id)?;
            touch_flag(&tx, id)?;
            tx.commit()?;
            Ok(())
        }

        async fn revoke_access(&self, flag_name: &str, subject_id: &str) -> Result<(), FlagError> {
            let mut conn = self.lock()?;
            let tx = conn.transaction()?;
            let id = flag_id(&tx, flag_name)?;
            let changed = tx.execute(
                "UPDATE grants SET enabled = 0 WHERE flag_id = ?1 AND subject_id = ?2",
                params![id, subject_id],
            )?;
            if changed > 0 {
                touch_flag(&tx, id)?;
            }
            tx.commit()?;
            Ok(())
        }

        async fn grant_access_bulk(
            &self,
            flag_name: &str,
            subject_ids: &[String],
        ) -> Result<BulkOperationResult, FlagError> {
            let mut conn = self.lock()?;
            let tx = conn.transaction()?;
            let id = flag_id(&tx, flag_name)?;

            let mut result = BulkOperationResult::default();
            for subject_id in subject_ids {
                // A soft-disabled row does not confer access, so re-granting
                // it counts as success.
                if grant_state(&tx, id, subject_id)? == Some(true) {
                    result.failed.push(BulkFailure {
                        subject_id: subject_id.clone(),
                        error: ALREADY_HAS_ACCESS.to_string(),
                    });
                    continue;
                }
                upsert_grant(&tx, id, subject_id)?;
                touch_flag(&tx, id)?;
                result.successful.push(subject_id.clone());
            }
            tx.commit()?;
            Ok(result)
        }

        async fn revoke_access_bulk(
            &self,
            flag_name: &str,
            subject_ids: &[String],
        ) -> Result<BulkOperationResult, FlagError> {
            let mut conn = self.lock()?;
            let tx = conn.transaction()?;
            let id = flag_id(&tx, flag_name)?;

            let mut result = BulkOperationResult::default();
            for subject_id in subject_ids {
                if grant_state(&tx, id, subject_id)? != Some(true) {
                    result.failed.push(BulkFailure {
                        subject_id: subject_id.clone(),
                        error: NO_ACCESS.to_string(),
                    });
                    continue;
                }
                tx.execute(
                    "UPDATE grants SET enabled = 0 WHERE flag_id = ?1 AND subject_id = ?2",
                    params![id, subject_id],
                )?;
                touch_flag(&tx, id)?;
                result.successful.push(subject_id.clone());
            }
            tx.commit()?;
            Ok(result)
        }

        async fn enable_for_all(&self, flag_name: &str) -> Result<(), FlagError> {
            let conn = self.lock()?;
            let changed = conn.execute(
                "UPDATE flags SET enabled_for_all = 1, updated_at = ?2 WHERE name = ?1",
                params![flag_name, Utc::now().to_rfc3339()],
            )?;
            if changed == 0 {
                return Err(FlagError::NotFound(flag_name.to_string()));
            }
            Ok(())
        }

        async fn disable_for_all(&self, flag_name: &str) -> Result<(), FlagError> {
            let mut conn = self.lock()?;
            let tx = conn.transaction()?;
            let id = flag_id(&tx, flag_name)?;
            tx.execute(
                "UPDATE flags SET enabled_for_all = 0, updated_at = ?2 WHERE id = ?1",
                params![id, Utc::now().to_rfc3339()],
            )?;
            tx.execute("DELETE FROM grants WHERE flag_id = ?1", params![id])?;
            tx.commit()?;
            Ok(())
        }

        async fn get_active_flags(&self, subject_id: &str) -> Result<Vec<Flag>, FlagError> {
            let conn = self.lock()?;
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM flags f
                 WHERE f.enabled_for_all = 1
                    OR EXISTS (
                        SELECT 1 FROM grants g
                        WHERE g.flag_id = f.id AND g.subject_id = ?1 AND g.enabled = 1
                    )",
                FlagRow::COLUMNS
            ))?;
            let rows = stmt.query_map(params![subject_id], FlagRow::from_row)?;

            let mut flags = Vec::new();
            for row in rows {
                flags.push(row?.into_flag()?);
            }
            Ok(flags)
        }

        async fn create_flag(&self, name: &str) -> Result<Flag, FlagError> {
            let conn = self.lock()?;
            let now = Utc::now();
            let inserted = conn.execute(
                "INSERT INTO flags (name, enabled_for_all, created_at, updated_at)
                 VALUES (?1, 0, ?2, ?2)",
                params![name, now.to_rfc3339()],
            );
            match inserted {
                Ok(_) => Ok(Flag {
                    id: conn.last_insert_rowid().to_string(),
                    name: name.to_string(),
                    enabled_for_all: false,
                    created_at: now,
                    updated_at: now,
                }),
                Err(rusqlite::Error::SqliteFailure(e, _))
                    if e.code == ErrorCode::ConstraintViolation =>
                {
                    Err(FlagError::Conflict(name.to_string()))
                }
                Err(e) => Err(e.into()),
            }
        }

        async fn delete_flag(&self, name: &str) -> Result<(), FlagError> {
            let conn = self.lock()?;
            // ON DELETE CASCADE removes the flag's grant rows with it.
            let deleted = conn.execute("DELETE FROM flags WHERE name = ?1", params![name])?;
            if deleted == 0 {
                return Err(FlagError::NotFound(name.to_string()));
            }
            Ok(())
        }

        async fn list_flags(&self) -> Result<Vec<Flag>, FlagError> {
            let conn = self.lock()?;
            let mut stmt =
                conn.prepare(&format!("SELECT {} FROM flags", FlagRow::COLUMNS))?;
            let rows = stmt.query_map([], FlagRow::from_row)?;

            let mut flags = Vec::new();
            for row in rows {
                flags.push(row?.into_flag()?);
            }
            Ok(flags)
        }

        async fn get_flag(&self, name: &str) -> Result<Option<Flag>, FlagError> {
            let conn = self.lock()?;
            let row = conn.query_row(
                &format!("SELECT {} FROM flags WHERE name = ?1", FlagRow::COLUMNS),
                params![name],
                FlagRow::from_row,
            );
            match row {
                Ok(row) => Ok(Some(row.into_flag()?)),
                Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                Err(e) => Err(e.into()),
            }
        }
    }
}
