//! End-to-end push/pull between two in-process databases over the loopback
//! transport.

mod common;

use common::{local_checkpoint, peer_checkpoint, push, pull};
use serde_json::json;
use skiffdb::{Database, DocEndKind, VersioningMode};

#[tokio::test]
async fn one_shot_push_of_100_docs() {
    let a = Database::memory();
    let b = Database::memory();
    for i in 1..=100 {
        a.put(&format!("{i:07}"), json!({"i": i})).await.unwrap();
    }

    let delegate = push(&a, &b).await;

    assert_eq!(delegate.count_of(DocEndKind::Completed), 100);
    assert_eq!(delegate.error_count(), 0);

    for i in 1..=100 {
        let id = format!("{i:07}");
        let ours = a.get(&id).await.unwrap().unwrap();
        let theirs = b.get(&id).await.unwrap().expect("doc replicated");
        assert_eq!(ours.rev_id, theirs.rev_id, "{id} revisions agree");
        assert_eq!(ours.body, theirs.body);
    }

    let checkpoint = local_checkpoint(&a, &b).await.expect("checkpoint saved");
    assert_eq!(checkpoint.local, 100);
    let mirrored = peer_checkpoint(&b, &a).await.expect("peer checkpoint saved");
    assert_eq!(mirrored.local, 100);
}

#[tokio::test]
async fn incremental_push_sends_only_edits() {
    let a = Database::memory();
    let b = Database::memory();
    for i in 1..=100 {
        a.put(&format!("{i:07}"), json!({"i": i})).await.unwrap();
    }
    push(&a, &b).await;

    let before: Vec<_> = [1u32, 50, 99]
        .iter()
        .map(|i| format!("{i:07}"))
        .collect();
    let untouched_rev = b.get(&before[1]).await.unwrap().unwrap().rev_id;

    a.put("0000001", json!({"i": 1, "edited": true})).await.unwrap();
    a.put("0000099", json!({"i": 99, "edited": true})).await.unwrap();

    let delegate = push(&a, &b).await;
    assert_eq!(delegate.docs().len(), 2);
    assert_eq!(delegate.count_of(DocEndKind::Completed), 2);

    for id in ["0000001", "0000099"] {
        let ours = a.get(id).await.unwrap().unwrap();
        let theirs = b.get(id).await.unwrap().unwrap();
        assert_eq!(ours.rev_id, theirs.rev_id);
        assert_eq!(theirs.body.unwrap()["edited"], true);
    }
    // Everyone else is untouched.
    assert_eq!(b.get(&before[1]).await.unwrap().unwrap().rev_id, untouched_rev);

    let checkpoint = local_checkpoint(&a, &b).await.unwrap();
    assert_eq!(checkpoint.local, 102);
}

#[tokio::test]
async fn repeated_push_is_a_no_op() {
    let a = Database::memory();
    let b = Database::memory();
    for i in 0..10 {
        a.put(&format!("d{i}"), json!({"i": i})).await.unwrap();
    }
    push(&a, &b).await;
    let delegate = push(&a, &b).await;
    assert!(delegate.docs().is_empty(), "nothing left to push");
}

#[tokio::test]
async fn one_shot_pull() {
    let a = Database::memory();
    let b = Database::memory();
    for i in 0..25 {
        b.put(&format!("d{i}"), json!({"i": i})).await.unwrap();
    }

    let delegate = pull(&a, &b).await;
    assert_eq!(delegate.count_of(DocEndKind::Completed), 25);
    assert_eq!(delegate.error_count(), 0);

    for i in 0..25 {
        let id = format!("d{i}");
        assert_eq!(
            a.get(&id).await.unwrap().unwrap().rev_id,
            b.get(&id).await.unwrap().unwrap().rev_id
        );
    }
    // The pull cursor reached the peer's last sequence.
    let checkpoint = local_checkpoint(&a, &b).await.unwrap();
    assert_eq!(checkpoint.remote, json!(25));
}

#[tokio::test]
async fn tombstones_replicate() {
    let a = Database::memory();
    let b = Database::memory();
    a.put("doomed", json!({"v": 1})).await.unwrap();
    push(&a, &b).await;
    assert!(!b.get("doomed").await.unwrap().unwrap().is_deleted());

    a.delete("doomed").await.unwrap();
    push(&a, &b).await;
    assert!(b.get("doomed").await.unwrap().unwrap().is_deleted());
}

#[tokio::test]
async fn tombstone_then_newer_live_revision_stays_live() {
    let a = Database::memory();
    let b = Database::memory();
    a.put("x", json!({"v": 1})).await.unwrap();
    pull(&b, &a).await;
    assert!(!b.get("x").await.unwrap().unwrap().is_deleted());

    a.delete("x").await.unwrap();
    pull(&b, &a).await;
    assert!(b.get("x").await.unwrap().unwrap().is_deleted());

    // A live revision with a strictly higher time from the same source
    // resurrects the doc.
    a.put("x", json!({"v": 2})).await.unwrap();
    pull(&b, &a).await;
    let revived = b.get("x").await.unwrap().unwrap();
    assert!(!revived.is_deleted());
    assert_eq!(revived.body.unwrap()["v"], 2);
}

#[tokio::test]
async fn full_sync_is_idempotent_both_ways() {
    let a = Database::memory();
    let b = Database::memory();
    for i in 0..20 {
        a.put(&format!("d{i}"), json!({"i": i})).await.unwrap();
    }
    push(&a, &b).await;

    // Pushing the other way moves nothing: B's docs are already on A.
    let delegate = push(&b, &a).await;
    assert_eq!(delegate.error_count(), 0);
    assert_eq!(delegate.count_of(DocEndKind::Completed), 0);

    for i in 0..20 {
        let id = format!("d{i}");
        assert_eq!(
            a.get(&id).await.unwrap().unwrap().rev_id,
            b.get(&id).await.unwrap().unwrap().rev_id
        );
    }
}

#[tokio::test]
async fn tree_mode_docs_replicate_with_history() {
    let a = Database::memory_with_mode(VersioningMode::Tree);
    let b = Database::memory_with_mode(VersioningMode::Tree);
    a.put("t", json!({"v": 1})).await.unwrap();
    a.put("t", json!({"v": 2})).await.unwrap();
    let r3 = a.put("t", json!({"v": 3})).await.unwrap();

    let delegate = push(&a, &b).await;
    assert_eq!(delegate.error_count(), 0);

    let theirs = b.get("t").await.unwrap().unwrap();
    assert_eq!(theirs.rev_id, r3);
    assert_eq!(theirs.rev_id.generation(), Some(3));
    let doc = b.document("t").await.unwrap().unwrap();
    // Ancestors arrived bodiless but present.
    assert!(doc.rev_tree().unwrap().len() >= 2);
}

#[tokio::test]
async fn blobs_are_fetched_during_sync() {
    use skiffdb::BlobStore as _;

    let a = Database::memory();
    let b = Database::memory();
    let key = a.blobs().put(b"picture bytes").await.unwrap();
    a.put(
        "with-blob",
        json!({"photo": {"@type": "blob", "digest": key.to_string(), "length": 13}}),
    )
    .await
    .unwrap();

    let delegate = push(&a, &b).await;
    assert_eq!(delegate.error_count(), 0);
    assert!(b.blobs().has(&key).await.unwrap());
    assert!(b.get("with-blob").await.unwrap().is_some());
}
