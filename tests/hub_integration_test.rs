// tests/hub_integration_test.rs
//! Hub wiring exercised through the public API only.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{MockDirectory, MockInbox};
use futures::StreamExt;
use pretty_assertions::assert_eq;
use serde_json::Value;
use beadhub_events::bus::Frame;
use beadhub_events::config::HubConfig;
use beadhub_events::outbox::{BeadStatusChange, SenderIdentity};
use beadhub_events::Hub;

fn hub_at(dir: &tempfile::TempDir, directory: MockDirectory, inbox: Arc<MockInbox>) -> Hub {
    let config = HubConfig {
        database_path: dir.path().join("events.db"),
        outbox_poll_interval_ms: 50,
        ..HubConfig::default()
    };
    Hub::open(config, Arc::new(directory), inbox).expect("open hub")
}

#[tokio::test]
async fn status_change_is_streamed_and_delivered_by_the_worker() {
    let dir = tempfile::tempdir().unwrap();
    let inbox = Arc::new(MockInbox::default());
    let hub = hub_at(
        &dir,
        MockDirectory::default().with_subscription("bd-9", "w1", "alice"),
        inbox.clone(),
    );

    let mut stream = hub.stream_workspaces(&["w1".into()], None, None).await.unwrap();
    let change = BeadStatusChange {
        bead_id: "bd-9".into(),
        repo: Some("acme/web".into()),
        branch: Some("main".into()),
        old_status: Some("in_progress".into()),
        new_status: "closed".into(),
        title: Some("Ship it".into()),
    };
    let recorded = hub
        .dispatch_status_changes(&[change], "tenant-1", &["w1".into()])
        .await
        .unwrap();
    assert_eq!(recorded, 1);

    let frame = tokio::time::timeout(Duration::from_secs(1), stream.next())
        .await
        .unwrap()
        .unwrap();
    let Frame::Data(data) = frame else {
        panic!("expected data frame, got {frame:?}");
    };
    let event: Value = serde_json::from_str(&data).unwrap();
    assert_eq!(event["type"], "bead.status_changed");
    assert_eq!(event["bead_id"], "bd-9");

    let worker = hub.start_outbox_worker(SenderIdentity::new("hub-agent", "beadhub"));
    let mut delivered = Vec::new();
    for _ in 0..40 {
        delivered = inbox.messages();
        if !delivered.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    worker.shutdown().await;

    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].to_workspace_id, "w1");
    assert_eq!(delivered[0].subject, "Bead status changed: bd-9");
}

#[tokio::test]
async fn chat_waiter_is_visible_until_the_stream_closes() {
    let dir = tempfile::tempdir().unwrap();
    let hub = hub_at(&dir, MockDirectory::default(), Arc::new(MockInbox::default()));

    let stream = hub
        .stream_chat("s1", "alice", Some(Duration::from_secs(60)), None)
        .await
        .unwrap();
    assert!(hub.is_waiting("s1", "alice").await.unwrap());
    assert!(!hub.is_waiting("s1", "bob").await.unwrap());

    drop(stream);
    for _ in 0..20 {
        if !hub.is_waiting("s1", "alice").await.unwrap() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("waiting entry survived a closed stream");
}
