use rusqlite::Connection;

use super::DbError;

struct Migration {
    version: i64,
    sql: &'static str,
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        sql: r#"
CREATE TABLE notification_outbox (
    id                      TEXT PRIMARY KEY,
    tenant_id               TEXT NOT NULL,
    event_type              TEXT NOT NULL,
    payload_json            TEXT NOT NULL,
    recipient_workspace_id  TEXT NOT NULL,
    recipient_alias         TEXT NOT NULL,
    status                  TEXT NOT NULL DEFAULT 'pending'
        CHECK (status IN ('pending', 'processing', 'completed', 'failed')),
    attempts                INTEGER NOT NULL DEFAULT 0,
    last_error              TEXT,
    message_id              TEXT,
    created_at              TEXT NOT NULL,
    processed_at            TEXT
);

CREATE INDEX idx_outbox_eligible ON notification_outbox(tenant_id, status, created_at);
"#,
    },
    Migration {
        version: 2,
        sql: r#"
ALTER TABLE notification_outbox ADD COLUMN claimed_at TEXT;

CREATE INDEX idx_outbox_processed ON notification_outbox(tenant_id, status, processed_at);
CREATE INDEX idx_outbox_claimed ON notification_outbox(status, claimed_at);
"#,
    },
];

/// Apply every migration newer than the recorded schema version.
pub(super) fn apply_pending(conn: &Connection) -> Result<(), DbError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version     INTEGER PRIMARY KEY,
            applied_at  TEXT NOT NULL
        );",
    )?;

    let current: i64 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )?;

    for migration in MIGRATIONS.iter().filter(|m| m.version > current) {
        tracing::info!("outbox schema: applying v{}", migration.version);

        let tx = conn.unchecked_transaction()?;
        tx.execute_batch(migration.sql)
            .map_err(|e| DbError::Migration(format!("v{}: {e}", migration.version)))?;
        tx.execute(
            "INSERT INTO schema_version (version, applied_at) VALUES (?1, ?2)",
            rusqlite::params![migration.version, crate::clock::to_storage(chrono::Utc::now())],
        )?;
        tx.commit()?;
    }

    Ok(())
}
