//! Checkpoint durability and continuous-replication behavior.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{RecordingDelegate, TEST_TIMEOUT, local_checkpoint, push, replicate};
use serde_json::json;
use skiffdb::{
    ActivityLevel, Database, DocEndKind, NullDelegate, ReplicationMode, ReplicatorOptions,
};

#[tokio::test]
async fn checkpoints_never_regress() {
    let a = Database::memory();
    let b = Database::memory();
    for i in 0..5 {
        a.put(&format!("d{i}"), json!({"i": i})).await.unwrap();
    }
    push(&a, &b).await;
    let first = local_checkpoint(&a, &b).await.unwrap().local;
    assert_eq!(first, 5);

    a.put("d0", json!({"i": 0, "v": 2})).await.unwrap();
    push(&a, &b).await;
    let second = local_checkpoint(&a, &b).await.unwrap().local;
    assert!(second > first);
}

#[tokio::test]
async fn reset_rescans_but_resends_nothing_known() {
    let a = Database::memory();
    let b = Database::memory();
    for i in 0..10 {
        a.put(&format!("d{i}"), json!({"i": i})).await.unwrap();
    }
    push(&a, &b).await;

    // A reset rescans from zero; the peer already has every revision, so
    // nothing is transferred but the checkpoint is rebuilt.
    let delegate = replicate(
        &a,
        &b,
        ReplicatorOptions::push(ReplicationMode::OneShot),
        true,
    )
    .await;
    assert_eq!(delegate.count_of(DocEndKind::Completed), 0);
    assert_eq!(delegate.error_count(), 0);
    assert_eq!(local_checkpoint(&a, &b).await.unwrap().local, 10);
}

#[tokio::test]
async fn continuous_push_goes_idle_then_busy_on_new_writes() {
    let a = Database::memory();
    let b = Database::memory();
    a.put("first", json!({"v": 1})).await.unwrap();

    let (active_transport, passive_transport) = skiffdb::loopback_pair(64);
    let passive = b.replicator(
        ReplicatorOptions::passive(),
        Arc::new(NullDelegate),
        a.uuid_string(),
        passive_transport,
    );
    passive.start(false);

    let delegate = RecordingDelegate::new();
    let active = a.replicator(
        ReplicatorOptions::push(ReplicationMode::Continuous),
        delegate.clone(),
        b.uuid_string(),
        active_transport,
    );
    active.start(false);

    tokio::time::timeout(TEST_TIMEOUT, active.wait_for_level(ActivityLevel::Idle))
        .await
        .expect("reached idle");
    assert!(b.get("first").await.unwrap().is_some());

    // A new local write wakes the pusher back up.
    a.put("second", json!({"v": 2})).await.unwrap();
    tokio::time::timeout(TEST_TIMEOUT, async {
        loop {
            if b.get("second").await.unwrap().is_some() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("second doc replicated");
    assert!(delegate.levels().contains(&ActivityLevel::Busy));

    // Stop is clean and flushes the checkpoint.
    active.stop();
    tokio::time::timeout(TEST_TIMEOUT, active.wait_for_level(ActivityLevel::Stopped))
        .await
        .expect("stopped");
    assert_eq!(local_checkpoint(&a, &b).await.unwrap().local, 2);

    passive.stop();
    tokio::time::timeout(TEST_TIMEOUT, passive.wait_for_level(ActivityLevel::Stopped))
        .await
        .expect("passive stopped");
}

#[tokio::test]
async fn stop_is_idempotent() {
    let a = Database::memory();
    let b = Database::memory();
    let (active_transport, _passive_transport) = skiffdb::loopback_pair(8);
    let replicator = a.replicator(
        ReplicatorOptions::push(ReplicationMode::Continuous),
        Arc::new(NullDelegate),
        b.uuid_string(),
        active_transport,
    );
    replicator.start(false);
    replicator.stop();
    replicator.stop();
    tokio::time::timeout(TEST_TIMEOUT, replicator.wait_for_level(ActivityLevel::Stopped))
        .await
        .expect("stopped");
}
