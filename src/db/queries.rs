use std::fmt;
use std::str::FromStr;

use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rusqlite::{params, Row, TransactionBehavior};
use serde::{Deserialize, Serialize};

use super::{Database, DbError};

// ---------------------------------------------------------------------------
// Row types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboxStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl OutboxStatus {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for OutboxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OutboxStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown outbox status {other:?}")),
        }
    }
}

impl ToSql for OutboxStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for OutboxStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|e: String| FromSqlError::Other(e.into()))
    }
}

/// One delivery intent: a single notification for a single recipient.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutboxRow {
    pub id: String,
    pub tenant_id: String,
    pub event_type: String,
    pub payload_json: String,
    pub recipient_workspace_id: String,
    pub recipient_alias: String,
    pub status: OutboxStatus,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub message_id: Option<String>,
    pub created_at: String,
    pub claimed_at: Option<String>,
    pub processed_at: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OutboxStatsRow {
    pub pending: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
    /// Rows no longer selected because their retry budget is spent.
    pub exhausted: u64,
}

const OUTBOX_COLUMNS: &str = "id, tenant_id, event_type, payload_json, recipient_workspace_id, \
     recipient_alias, status, attempts, last_error, message_id, created_at, claimed_at, processed_at";

fn outbox_row(row: &Row<'_>) -> rusqlite::Result<OutboxRow> {
    Ok(OutboxRow {
        id: row.get(0)?,
        tenant_id: row.get(1)?,
        event_type: row.get(2)?,
        payload_json: row.get(3)?,
        recipient_workspace_id: row.get(4)?,
        recipient_alias: row.get(5)?,
        status: row.get(6)?,
        attempts: row.get(7)?,
        last_error: row.get(8)?,
        message_id: row.get(9)?,
        created_at: row.get(10)?,
        claimed_at: row.get(11)?,
        processed_at: row.get(12)?,
    })
}

// ---------------------------------------------------------------------------
// Outbox writes
// ---------------------------------------------------------------------------

pub fn insert_outbox_entry(db: &Database, row: &OutboxRow) -> Result<(), DbError> {
    insert_outbox_entries(db, std::slice::from_ref(row)).map(|_| ())
}

/// Insert every row or none of them.
pub fn insert_outbox_entries(db: &Database, rows: &[OutboxRow]) -> Result<usize, DbError> {
    let conn = db.conn();
    let tx = conn.unchecked_transaction()?;
    {
        let mut stmt = tx.prepare(&format!(
            "INSERT INTO notification_outbox ({OUTBOX_COLUMNS}) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)"
        ))?;
        for row in rows {
            stmt.execute(params![
                row.id,
                row.tenant_id,
                row.event_type,
                row.payload_json,
                row.recipient_workspace_id,
                row.recipient_alias,
                row.status,
                row.attempts,
                row.last_error,
                row.message_id,
                row.created_at,
                row.claimed_at,
                row.processed_at,
            ])?;
        }
    }
    tx.commit()?;
    Ok(rows.len())
}

/// Select up to `limit` eligible rows for `tenant_id`, oldest first, and mark
/// them `processing` with one more attempt, all under a write lock. A row
/// claimed here is invisible to every other claimer until it is marked
/// completed or failed.
pub fn claim_outbox_batch(
    db: &Database,
    tenant_id: &str,
    max_attempts: u32,
    limit: u32,
    claimed_at: &str,
) -> Result<Vec<OutboxRow>, DbError> {
    let mut conn = db.conn();
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    let mut rows = {
        let mut stmt = tx.prepare(&format!(
            "SELECT {OUTBOX_COLUMNS} FROM notification_outbox \
             WHERE tenant_id = ?1 AND status IN ('pending', 'failed') AND attempts < ?2 \
             ORDER BY created_at ASC, rowid ASC LIMIT ?3"
        ))?;
        let rows = stmt
            .query_map(params![tenant_id, max_attempts, limit], outbox_row)?
            .collect::<Result<Vec<_>, _>>()?;
        rows
    };

    {
        let mut stmt = tx.prepare(
            "UPDATE notification_outbox \
             SET status = 'processing', attempts = attempts + 1, claimed_at = ?2 \
             WHERE id = ?1",
        )?;
        for row in &mut rows {
            stmt.execute(params![row.id, claimed_at])?;
            row.status = OutboxStatus::Processing;
            row.attempts += 1;
            row.claimed_at = Some(claimed_at.to_string());
        }
    }

    tx.commit()?;
    Ok(rows)
}

pub fn mark_outbox_completed(
    db: &Database,
    id: &str,
    message_id: &str,
    processed_at: &str,
) -> Result<(), DbError> {
    let conn = db.conn();
    let updated = conn.execute(
        "UPDATE notification_outbox \
         SET status = 'completed', processed_at = ?2, message_id = ?3, last_error = NULL \
         WHERE id = ?1",
        params![id, processed_at, message_id],
    )?;
    if updated == 0 {
        return Err(DbError::NotFound(format!("outbox entry {id}")));
    }
    Ok(())
}

pub fn mark_outbox_failed(db: &Database, id: &str, error: &str) -> Result<(), DbError> {
    let conn = db.conn();
    let updated = conn.execute(
        "UPDATE notification_outbox SET status = 'failed', last_error = ?2 WHERE id = ?1",
        params![id, error],
    )?;
    if updated == 0 {
        return Err(DbError::NotFound(format!("outbox entry {id}")));
    }
    Ok(())
}

/// Delete `completed` rows of a tenant processed strictly before `cutoff`.
pub fn delete_completed_outbox_before(
    db: &Database,
    tenant_id: &str,
    cutoff: &str,
) -> Result<usize, DbError> {
    let conn = db.conn();
    let deleted = conn.execute(
        "DELETE FROM notification_outbox \
         WHERE tenant_id = ?1 AND status = 'completed' AND processed_at < ?2",
        params![tenant_id, cutoff],
    )?;
    Ok(deleted)
}

/// Return rows stuck in `processing` since before `claimed_before` to the
/// retry pool. The attempt they consumed is kept.
pub fn requeue_stale_outbox_claims(
    db: &Database,
    claimed_before: &str,
    reason: &str,
) -> Result<usize, DbError> {
    let conn = db.conn();
    let requeued = conn.execute(
        "UPDATE notification_outbox SET status = 'failed', last_error = ?2 \
         WHERE status = 'processing' AND claimed_at < ?1",
        params![claimed_before, reason],
    )?;
    Ok(requeued)
}

// ---------------------------------------------------------------------------
// Outbox reads
// ---------------------------------------------------------------------------

pub fn tenants_with_eligible_outbox(db: &Database, max_attempts: u32) -> Result<Vec<String>, DbError> {
    let conn = db.conn();
    let mut stmt = conn.prepare(
        "SELECT DISTINCT tenant_id FROM notification_outbox \
         WHERE status IN ('pending', 'failed') AND attempts < ?1 ORDER BY tenant_id",
    )?;
    let tenants = stmt
        .query_map(params![max_attempts], |row| row.get(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(tenants)
}

pub fn get_outbox_entry(db: &Database, id: &str) -> Result<Option<OutboxRow>, DbError> {
    let conn = db.conn();
    let mut stmt = conn.prepare(&format!(
        "SELECT {OUTBOX_COLUMNS} FROM notification_outbox WHERE id = ?1"
    ))?;
    let mut rows = stmt.query_map(params![id], outbox_row)?;
    match rows.next() {
        Some(row) => Ok(Some(row?)),
        None => Ok(None),
    }
}

pub fn list_outbox_for_tenant(db: &Database, tenant_id: &str) -> Result<Vec<OutboxRow>, DbError> {
    let conn = db.conn();
    let mut stmt = conn.prepare(&format!(
        "SELECT {OUTBOX_COLUMNS} FROM notification_outbox WHERE tenant_id = ?1 \
         ORDER BY created_at ASC, rowid ASC"
    ))?;
    let rows = stmt
        .query_map(params![tenant_id], outbox_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn outbox_stats(db: &Database, tenant_id: &str, max_attempts: u32) -> Result<OutboxStatsRow, DbError> {
    let conn = db.conn();
    let mut stmt = conn.prepare(
        "SELECT status, COUNT(*), SUM(CASE WHEN attempts >= ?2 THEN 1 ELSE 0 END) \
         FROM notification_outbox WHERE tenant_id = ?1 GROUP BY status",
    )?;
    let counts = stmt
        .query_map(params![tenant_id, max_attempts], |row| {
            Ok((
                row.get::<_, OutboxStatus>(0)?,
                row.get::<_, u64>(1)?,
                row.get::<_, u64>(2)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut stats = OutboxStatsRow::default();
    for (status, count, over_budget) in counts {
        match status {
            OutboxStatus::Pending => stats.pending = count,
            OutboxStatus::Processing => stats.processing = count,
            OutboxStatus::Completed => stats.completed = count,
            OutboxStatus::Failed => {
                stats.failed = count;
                stats.exhausted = over_budget;
            }
        }
    }
    Ok(stats)
}
