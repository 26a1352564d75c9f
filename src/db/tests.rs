use crate::db::queries::{self, OutboxRow, OutboxStatus};
use crate::db::Database;

fn row(id: &str, tenant: &str, created_at: &str) -> OutboxRow {
    OutboxRow {
        id: id.to_string(),
        tenant_id: tenant.to_string(),
        event_type: "bead_status_change".to_string(),
        payload_json: r#"{"bead_id":"bd-1"}"#.to_string(),
        recipient_workspace_id: "w1".to_string(),
        recipient_alias: "alice".to_string(),
        status: OutboxStatus::Pending,
        attempts: 0,
        last_error: None,
        message_id: None,
        created_at: created_at.to_string(),
        claimed_at: None,
        processed_at: None,
    }
}

#[test]
fn migrations_are_idempotent_on_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("outbox.db");
    {
        let db = Database::open(&path).unwrap();
        queries::insert_outbox_entry(&db, &row("a", "t1", "2025-01-01T00:00:00.000000Z")).unwrap();
    }
    let db = Database::open(&path).unwrap();
    assert!(queries::get_outbox_entry(&db, "a").unwrap().is_some());
}

#[test]
fn claim_takes_oldest_first_and_marks_processing() {
    let db = Database::open_in_memory().unwrap();
    queries::insert_outbox_entries(
        &db,
        &[
            row("late", "t1", "2025-01-01T00:00:02.000000Z"),
            row("early", "t1", "2025-01-01T00:00:01.000000Z"),
            row("other", "t2", "2025-01-01T00:00:00.000000Z"),
        ],
    )
    .unwrap();

    let claimed = queries::claim_outbox_batch(&db, "t1", 3, 1, "2025-01-02T00:00:00.000000Z").unwrap();
    assert_eq!(claimed.len(), 1);
    assert_eq!(claimed[0].id, "early");
    assert_eq!(claimed[0].status, OutboxStatus::Processing);
    assert_eq!(claimed[0].attempts, 1);

    let stored = queries::get_outbox_entry(&db, "early").unwrap().unwrap();
    assert_eq!(stored.status, OutboxStatus::Processing);
    assert_eq!(stored.attempts, 1);
    assert_eq!(stored.claimed_at.as_deref(), Some("2025-01-02T00:00:00.000000Z"));

    let next = queries::claim_outbox_batch(&db, "t1", 3, 10, "2025-01-02T00:00:00.000000Z").unwrap();
    let ids: Vec<_> = next.iter().map(|r| r.id.as_str()).collect();
    assert_eq!(ids, vec!["late"]);
}

#[test]
fn exhausted_rows_are_not_claimed() {
    let db = Database::open_in_memory().unwrap();
    let mut spent = row("spent", "t1", "2025-01-01T00:00:00.000000Z");
    spent.status = OutboxStatus::Failed;
    spent.attempts = 3;
    queries::insert_outbox_entry(&db, &spent).unwrap();

    assert!(queries::claim_outbox_batch(&db, "t1", 3, 10, "now").unwrap().is_empty());
    assert!(queries::tenants_with_eligible_outbox(&db, 3).unwrap().is_empty());

    let stats = queries::outbox_stats(&db, "t1", 3).unwrap();
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.exhausted, 1);
}

#[test]
fn two_handles_never_claim_the_same_row() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("outbox.db");
    let first = Database::open(&path).unwrap();
    let second = Database::open(&path).unwrap();

    let rows: Vec<OutboxRow> = (0..6)
        .map(|i| row(&format!("r{i}"), "t1", &format!("2025-01-01T00:00:0{i}.000000Z")))
        .collect();
    queries::insert_outbox_entries(&first, &rows).unwrap();

    let a = queries::claim_outbox_batch(&first, "t1", 3, 4, "c").unwrap();
    let b = queries::claim_outbox_batch(&second, "t1", 3, 4, "c").unwrap();
    assert_eq!(a.len(), 4);
    assert_eq!(b.len(), 2);
    assert!(a.iter().all(|x| b.iter().all(|y| x.id != y.id)));
}

#[test]
fn completion_clears_error_and_cleanup_respects_cutoff() {
    let db = Database::open_in_memory().unwrap();
    queries::insert_outbox_entries(
        &db,
        &[
            row("old", "t1", "2025-01-01T00:00:00.000000Z"),
            row("new", "t1", "2025-01-01T00:00:01.000000Z"),
        ],
    )
    .unwrap();
    queries::mark_outbox_failed(&db, "old", "boom").unwrap();
    queries::mark_outbox_completed(&db, "old", "m-1", "2025-01-01T00:00:00.000000Z").unwrap();
    queries::mark_outbox_completed(&db, "new", "m-2", "2025-01-09T00:00:00.000000Z").unwrap();

    let old = queries::get_outbox_entry(&db, "old").unwrap().unwrap();
    assert_eq!(old.last_error, None);
    assert_eq!(old.message_id.as_deref(), Some("m-1"));

    let deleted =
        queries::delete_completed_outbox_before(&db, "t1", "2025-01-02T00:00:00.000000Z").unwrap();
    assert_eq!(deleted, 1);
    let remaining: Vec<_> = queries::list_outbox_for_tenant(&db, "t1")
        .unwrap()
        .into_iter()
        .map(|r| r.id)
        .collect();
    assert_eq!(remaining, vec!["new".to_string()]);
}

#[test]
fn stale_claims_are_requeued_with_attempts_kept() {
    let db = Database::open_in_memory().unwrap();
    queries::insert_outbox_entry(&db, &row("stuck", "t1", "2025-01-01T00:00:00.000000Z")).unwrap();
    queries::claim_outbox_batch(&db, "t1", 3, 10, "2025-01-01T00:00:00.000000Z").unwrap();

    assert_eq!(
        queries::requeue_stale_outbox_claims(&db, "2024-12-31T00:00:00.000000Z", "expired").unwrap(),
        0
    );
    assert_eq!(
        queries::requeue_stale_outbox_claims(&db, "2025-01-01T00:10:00.000000Z", "expired").unwrap(),
        1
    );
    let stuck = queries::get_outbox_entry(&db, "stuck").unwrap().unwrap();
    assert_eq!(stuck.status, OutboxStatus::Failed);
    assert_eq!(stuck.attempts, 1);
    assert_eq!(stuck.last_error.as_deref(), Some("expired"));
}

#[test]
fn marking_unknown_row_is_not_found() {
    let db = Database::open_in_memory().unwrap();
    assert!(matches!(
        queries::mark_outbox_failed(&db, "missing", "x"),
        Err(crate::db::DbError::NotFound(_))
    ));
}
