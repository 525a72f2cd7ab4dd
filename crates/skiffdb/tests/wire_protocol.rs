//! Wire-level tests that drive one side of the protocol by hand over the
//! loopback transport.

mod common;

use std::sync::Arc;

use common::{RecordingDelegate, TEST_TIMEOUT};
use serde_json::json;
use skiffdb::{
    ActivityLevel, Database, DocEndKind, Message, NullDelegate, ReplicationMode,
    ReplicatorOptions, Response, SourceId, Transport, loopback_pair,
};

/// Scenario: the peer revokes our access to a document. The next pull
/// delivers a `rev` with the `purged` flag; the local copy is removed and
/// a purge event is surfaced.
#[tokio::test]
async fn pulled_purge_flag_removes_document() {
    let db = Database::memory();
    db.put("revoked", json!({"secret": true})).await.unwrap();
    assert!(db.get("revoked").await.unwrap().is_some());

    let (active_transport, server_transport) = loopback_pair(16);

    // Hand-rolled passive peer: answer the handshake, then push a purge.
    let server = tokio::spawn(async move {
        loop {
            let Some(request) = server_transport.receive().await else {
                return;
            };
            match request.message.profile() {
                Some("getCheckpoint") => {
                    request.respond(Response::error("HTTP", 404, "no checkpoint"));
                }
                Some("setCheckpoint") => {
                    request.respond(Response::ok().with_property("rev", "1"));
                }
                Some("subChanges") => {
                    request.respond_ok();
                    let source = SourceId([0xaa; 20]);
                    let rev = Message::new("rev")
                        .with_property("id", "revoked")
                        .with_property("rev", format!("1@{source}"))
                        .with_property("purged", "true");
                    server_transport
                        .send(rev)
                        .await
                        .expect("rev accepted")
                        .into_result()
                        .expect("rev applied");
                    // Caught up: nothing else to send.
                    let done = Message::new("changes")
                        .with_json_body(&json!([]))
                        .unwrap();
                    let _ = server_transport.send(done).await;
                }
                _ => request.respond_ok(),
            }
        }
    });

    let delegate = RecordingDelegate::new();
    let replicator = db.replicator(
        ReplicatorOptions::pull(ReplicationMode::OneShot),
        delegate.clone(),
        "fake-server",
        active_transport,
    );
    tokio::time::timeout(TEST_TIMEOUT, replicator.run(false))
        .await
        .expect("pull finished");
    server.abort();

    assert!(db.get("revoked").await.unwrap().is_none(), "doc purged");
    assert_eq!(delegate.count_of(DocEndKind::Purge), 1);
    assert_eq!(delegate.error_count(), 0);
}

/// The passive side answers a hand-rolled active client: checkpoint save
/// and retrieval, change announcements, revision transfer.
#[tokio::test]
async fn passive_side_serves_a_manual_client() {
    let db = Database::memory();
    let (client_transport, passive_transport) = loopback_pair(16);
    let passive = db.replicator(
        ReplicatorOptions::passive(),
        Arc::new(NullDelegate),
        "manual-client",
        passive_transport,
    );
    passive.start(false);
    let client_source = SourceId([0xbb; 20]).to_string();

    // Unknown checkpoint: 404.
    let response = client_transport
        .send(Message::new("getCheckpoint").with_property("client", "cp-manual"))
        .await
        .unwrap();
    assert_eq!(response.error_code(), Some(404));

    // Save one and read it back.
    let response = client_transport
        .send(
            Message::new("setCheckpoint")
                .with_property("client", "cp-manual")
                .with_body(b"{\"local\":3}".to_vec()),
        )
        .await
        .unwrap();
    assert_eq!(response.property("rev"), Some("1"));
    let response = client_transport
        .send(Message::new("getCheckpoint").with_property("client", "cp-manual"))
        .await
        .unwrap();
    assert_eq!(response.property("rev"), Some("1"));

    // Announce and send one revision; the passive side stores it.
    let response = client_transport
        .send(
            Message::new("proposeChanges")
                .with_json_body(&json!([["doc1", format!("7@{client_source}"), "", 12]]))
                .unwrap(),
        )
        .await
        .unwrap();
    let verdicts: Vec<serde_json::Value> = response.json_body().unwrap();
    assert_eq!(verdicts, vec![json!(true)]);

    let response = client_transport
        .send(
            Message::new("rev")
                .with_property("id", "doc1")
                .with_property("rev", format!("7@{client_source}"))
                .with_body(b"{\"from\":\"client\"}".to_vec()),
        )
        .await
        .unwrap();
    assert!(!response.is_error());
    let stored = db.get("doc1").await.unwrap().unwrap();
    assert_eq!(stored.body.unwrap()["from"], "client");

    // Re-announcing the same revision is declined.
    let response = client_transport
        .send(
            Message::new("proposeChanges")
                .with_json_body(&json!([["doc1", format!("7@{client_source}"), "", 12]]))
                .unwrap(),
        )
        .await
        .unwrap();
    let verdicts: Vec<serde_json::Value> = response.json_body().unwrap();
    assert_eq!(verdicts, vec![json!(false)]);

    client_transport.close(1000, "done").await;
    tokio::time::timeout(TEST_TIMEOUT, passive.wait_for_level(ActivityLevel::Stopped))
        .await
        .expect("passive stopped");
}
