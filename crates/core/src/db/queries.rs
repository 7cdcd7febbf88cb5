//! Typed query helpers for the SnipSync database.

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::Database;
use crate::conflict::Conflict;
use crate::errors::{DatabaseError, SyncError};
use crate::models::{Artifact, AuditEntry, CycleToken, SyncStatus};

const KEY_LAST_SYNC_AT: &str = "last_sync_at";
const KEY_LAST_ERROR: &str = "last_error";
const KEY_IS_CONNECTED: &str = "is_connected";
const KEY_SYNC_STATE: &str = "sync_state";

// ---------------------------------------------------------------------------
// Domain structs returned by queries
// ---------------------------------------------------------------------------

/// Lifecycle of a persisted conflict.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStatus {
    /// Waiting for a decision; blocks the next cycle until cleaned up.
    Pending,
    /// A later merge settled it.
    Resolved,
    /// Discarded by automatic cleanup of a stale merge.
    Abandoned,
}

impl std::fmt::Display for ConflictStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Resolved => write!(f, "resolved"),
            Self::Abandoned => write!(f, "abandoned"),
        }
    }
}

impl ConflictStatus {
    pub fn from_str_val(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "resolved" => Some(Self::Resolved),
            "abandoned" => Some(Self::Abandoned),
            _ => None,
        }
    }
}

/// A row from the `conflicts` table.
#[derive(Debug, Clone)]
pub struct ConflictEntry {
    pub id: String,
    pub full_path: String,
    pub conflict_type: String,
    pub local: Option<Artifact>,
    pub remote: Option<Artifact>,
    pub baseline: Option<Artifact>,
    pub reason: String,
    pub status: String,
    pub detected_at: String,
    pub resolved_at: Option<String>,
}

/// A row from the `audit_log` table.
#[derive(Debug, Clone)]
pub struct AuditLogEntry {
    pub id: i64,
    pub action: String,
    pub details: Option<String>,
    pub success: bool,
    pub created_at: String,
}

enum LockAttempt {
    Acquired(CycleToken),
    Held { started_at: String },
}

// ---------------------------------------------------------------------------
// Query implementations
// ---------------------------------------------------------------------------

impl Database {
    // -- sync_lock ----------------------------------------------------------

    /// Start a cycle: take the sync lock and return its token.
    ///
    /// A live lock makes this fail with [`SyncError::AlreadyRunning`]; the
    /// second caller is rejected, not queued. A lock older than
    /// `lock_timeout` belongs to a cycle that died and is taken over.
    pub fn begin_cycle(&self, lock_timeout: Duration) -> Result<CycleToken, SyncError> {
        match self.transaction(|conn| try_acquire_lock(conn, lock_timeout))? {
            LockAttempt::Acquired(token) => {
                info!(token = %token.token, "sync lock acquired");
                Ok(token)
            }
            LockAttempt::Held { started_at } => Err(SyncError::AlreadyRunning { started_at }),
        }
    }

    /// Finish a cycle: release the lock and record the outcome.
    ///
    /// Fails with [`SyncError::LockLost`] if `token` is no longer the live
    /// lock; nothing is recorded in that case.
    pub fn end_cycle(
        &self,
        token: &CycleToken,
        last_error: Option<&str>,
        connected: bool,
    ) -> Result<(), SyncError> {
        let released = self.transaction(|conn| {
            let live: Option<String> = conn
                .query_row("SELECT token FROM sync_lock WHERE id = 1", [], |row| row.get(0))
                .optional()?;
            if live.as_deref() != Some(token.token.as_str()) {
                return Ok(false);
            }
            conn.execute("DELETE FROM sync_lock WHERE id = 1", [])?;

            let now = Utc::now().to_rfc3339();
            match last_error {
                Some(err) => put_state(conn, KEY_LAST_ERROR, err)?,
                None => {
                    conn.execute("DELETE FROM kv_state WHERE key = ?1", params![KEY_LAST_ERROR])?;
                    put_state(conn, KEY_LAST_SYNC_AT, &now)?;
                }
            }
            put_state(conn, KEY_IS_CONNECTED, if connected { "true" } else { "false" })?;
            put_state(conn, KEY_SYNC_STATE, "idle")?;
            Ok(true)
        })?;

        if released {
            info!(token = %token.token, "sync lock released");
            Ok(())
        } else {
            warn!(token = %token.token, "sync lock was taken over before the cycle ended");
            Err(SyncError::LockLost)
        }
    }

    /// Whether a cycle currently holds the lock.
    pub fn is_syncing(&self) -> Result<bool, DatabaseError> {
        let conn = self.conn();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM sync_lock", [], |row| row.get(0))?;
        Ok(count > 0)
    }

    /// Record the step the running cycle is in.
    pub fn set_sync_state(&self, state: &str) -> Result<(), DatabaseError> {
        self.set_state(KEY_SYNC_STATE, state)
    }

    /// Snapshot of the persisted sync state.
    pub fn sync_status(&self) -> Result<SyncStatus, DatabaseError> {
        let last_sync_at = self
            .get_state(KEY_LAST_SYNC_AT)?
            .map(|s| parse_time("kv_state", &s))
            .transpose()?;
        Ok(SyncStatus {
            state: self
                .get_state(KEY_SYNC_STATE)?
                .unwrap_or_else(|| "idle".to_string()),
            last_sync_at,
            last_error: self.get_state(KEY_LAST_ERROR)?,
            is_syncing: self.is_syncing()?,
            is_connected: self.get_state(KEY_IS_CONNECTED)?.as_deref() == Some("true"),
            pending_conflicts: self.count_conflicts_by_status(ConflictStatus::Pending)?,
        })
    }

    // -- conflicts ----------------------------------------------------------

    /// Persist an unresolved conflict as pending. Returns its id.
    pub fn insert_pending_conflict(
        &self,
        conflict: &Conflict,
        reason: &str,
    ) -> Result<String, DatabaseError> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now().to_rfc3339();
        let conn = self.conn();
        conn.execute(
            "INSERT INTO conflicts (id, full_path, conflict_type, local_json, remote_json, base_json, reason, status, detected_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'pending', ?8)",
            params![
                id,
                conflict.full_path,
                conflict.conflict_type.to_string(),
                to_json(conflict.local.as_ref())?,
                to_json(conflict.remote.as_ref())?,
                to_json(conflict.baseline.as_ref())?,
                reason,
                now,
            ],
        )?;
        debug!(id = %id, path = %conflict.full_path, "inserted pending conflict");
        Ok(id)
    }

    /// List conflicts, newest first, optionally filtered by status.
    pub fn list_conflicts(
        &self,
        status: Option<ConflictStatus>,
        limit: u32,
    ) -> Result<Vec<ConflictEntry>, DatabaseError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, full_path, conflict_type, local_json, remote_json, base_json, reason, status, detected_at, resolved_at
             FROM conflicts
             WHERE (?1 IS NULL OR status = ?1)
             ORDER BY detected_at DESC, full_path ASC
             LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(params![status.map(|s| s.to_string()), limit], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, Option<String>>(4)?,
                    row.get::<_, Option<String>>(5)?,
                    row.get::<_, String>(6)?,
                    row.get::<_, String>(7)?,
                    row.get::<_, String>(8)?,
                    row.get::<_, Option<String>>(9)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(
                |(id, full_path, conflict_type, local, remote, base, reason, status, detected_at, resolved_at)| {
                    Ok(ConflictEntry {
                        id,
                        full_path,
                        conflict_type,
                        local: from_json(local.as_deref())?,
                        remote: from_json(remote.as_deref())?,
                        baseline: from_json(base.as_deref())?,
                        reason,
                        status,
                        detected_at,
                        resolved_at,
                    })
                },
            )
            .collect()
    }

    /// All pending conflicts.
    pub fn pending_conflicts(&self) -> Result<Vec<ConflictEntry>, DatabaseError> {
        self.list_conflicts(Some(ConflictStatus::Pending), u32::MAX)
    }

    /// Detection time of the oldest pending conflict.
    pub fn oldest_pending_conflict_at(&self) -> Result<Option<DateTime<Utc>>, DatabaseError> {
        let conn = self.conn();
        let oldest: Option<String> = conn.query_row(
            "SELECT MIN(detected_at) FROM conflicts WHERE status = 'pending'",
            [],
            |row| row.get(0),
        )?;
        oldest.map(|s| parse_time("conflicts", &s)).transpose()
    }

    /// Move every pending conflict to `status`. Returns how many changed.
    pub fn mark_conflicts(&self, status: ConflictStatus) -> Result<usize, DatabaseError> {
        let now = Utc::now().to_rfc3339();
        let conn = self.conn();
        let changed = conn.execute(
            "UPDATE conflicts SET status = ?1, resolved_at = ?2 WHERE status = 'pending'",
            params![status.to_string(), now],
        )?;
        if changed > 0 {
            info!(count = changed, %status, "pending conflicts updated");
        }
        Ok(changed)
    }

    pub fn count_conflicts_by_status(&self, status: ConflictStatus) -> Result<i64, DatabaseError> {
        let conn = self.conn();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM conflicts WHERE status = ?1",
            params![status.to_string()],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    // -- audit_log ----------------------------------------------------------

    /// Insert an audit entry from the model type.
    pub fn insert_audit_entry(&self, entry: &AuditEntry) -> Result<i64, DatabaseError> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO audit_log (action, details, success, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![
                entry.action,
                entry.details,
                entry.success,
                entry.timestamp.to_rfc3339()
            ],
        )?;
        let id = conn.last_insert_rowid();
        debug!(id, action = %entry.action, success = entry.success, "inserted audit entry");
        Ok(id)
    }

    /// Return the most recent N audit entries, newest first.
    pub fn list_audit_log(&self, limit: u32) -> Result<Vec<AuditLogEntry>, DatabaseError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, action, details, success, created_at
             FROM audit_log ORDER BY id DESC LIMIT ?1",
        )?;
        let entries = stmt
            .query_map(params![limit], |row| {
                Ok(AuditLogEntry {
                    id: row.get(0)?,
                    action: row.get(1)?,
                    details: row.get(2)?,
                    success: row.get(3)?,
                    created_at: row.get(4)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    // -- kv_state -----------------------------------------------------------

    /// Get a key-value state entry.
    pub fn get_state(&self, key: &str) -> Result<Option<String>, DatabaseError> {
        let conn = self.conn();
        let value = conn
            .query_row(
                "SELECT value FROM kv_state WHERE key = ?1",
                params![key],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        Ok(value)
    }

    /// Set a key-value state entry (upsert).
    pub fn set_state(&self, key: &str, value: &str) -> Result<(), DatabaseError> {
        let conn = self.conn();
        put_state(&conn, key, value)
    }
}

fn try_acquire_lock(conn: &Connection, lock_timeout: Duration) -> Result<LockAttempt, DatabaseError> {
    let now = Utc::now();
    let existing: Option<(String, String)> = conn
        .query_row(
            "SELECT token, acquired_at FROM sync_lock WHERE id = 1",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;

    if let Some((stale_token, acquired_at)) = existing {
        let started = parse_time("sync_lock", &acquired_at)?;
        if now - started < lock_timeout {
            return Ok(LockAttempt::Held {
                started_at: acquired_at,
            });
        }
        warn!(stale_token = %stale_token, acquired_at = %acquired_at, "taking over abandoned sync lock");
    }

    let token = CycleToken {
        token: Uuid::new_v4().to_string(),
        acquired_at: now,
    };
    conn.execute(
        "INSERT INTO sync_lock (id, token, acquired_at) VALUES (1, ?1, ?2)
         ON CONFLICT(id) DO UPDATE SET token = excluded.token, acquired_at = excluded.acquired_at",
        params![token.token, now.to_rfc3339()],
    )?;
    put_state(conn, KEY_SYNC_STATE, "starting")?;
    Ok(LockAttempt::Acquired(token))
}

fn put_state(conn: &Connection, key: &str, value: &str) -> Result<(), DatabaseError> {
    let now = Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO kv_state (key, value, updated_at) VALUES (?1, ?2, ?3)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
        params![key, value, now],
    )?;
    debug!(key, value, "set kv_state");
    Ok(())
}

fn parse_time(entity: &str, value: &str) -> Result<DateTime<Utc>, DatabaseError> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| DatabaseError::Corrupt {
            entity: entity.to_string(),
            detail: format!("bad timestamp '{value}': {e}"),
        })
}

fn to_json(artifact: Option<&Artifact>) -> Result<Option<String>, DatabaseError> {
    artifact
        .map(serde_json::to_string)
        .transpose()
        .map_err(|e| DatabaseError::Corrupt {
            entity: "conflict".into(),
            detail: e.to_string(),
        })
}

fn from_json(value: Option<&str>) -> Result<Option<Artifact>, DatabaseError> {
    value
        .map(serde_json::from_str)
        .transpose()
        .map_err(|e| DatabaseError::Corrupt {
            entity: "conflict".into(),
            detail: e.to_string(),
        })
}
