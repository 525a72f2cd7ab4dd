//! Handlers for the passive (serving) side of checkpoint and attachment
//! messages. A passive replicator exposes a collection to one connected
//! active peer per connection; each peer's checkpoint lives under its own
//! client ID in the `peer-checkpoints` keyspace.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use sha1::{Digest, Sha1};
use tracing::debug;

use skiffdb_core::blob::{BlobKey, BlobStore};
use skiffdb_core::error::{Error, Result};
use skiffdb_core::record::{ContentLevel, DocumentFlags, RecordUpdate, keyspace};
use skiffdb_core::store::RecordStore;
use skiffdb_net::blip::{IncomingRequest, Response};

/// Serves `getCheckpoint`: returns the stored body and its revision
/// counter, or a 404 for an unknown client.
pub(crate) async fn handle_get_checkpoint(
    store: &dyn RecordStore,
    request: IncomingRequest,
) {
    let Some(client) = request.message.property("client").map(str::to_string) else {
        request.respond(Response::error("HTTP", 400, "missing client ID"));
        return;
    };
    let result = store
        .get(keyspace::PEER_CHECKPOINTS, &client, ContentLevel::EntireBody)
        .await;
    match result {
        Ok(Some(record)) => {
            let rev = String::from_utf8_lossy(&record.extras).to_string();
            request.respond(
                Response::ok()
                    .with_property("rev", rev)
                    .with_body(record.body),
            );
        }
        Ok(None) => request.respond(Response::error("HTTP", 404, "no checkpoint")),
        Err(err) => request.respond(Response::from_error(&err)),
    }
}

/// Serves `setCheckpoint`: CAS on the revision counter; a stale `rev`
/// yields a 409 so the client re-reads before retrying.
pub(crate) async fn handle_set_checkpoint(
    store: &dyn RecordStore,
    request: IncomingRequest,
) {
    let message = &request.message;
    let Some(client) = message.property("client").map(str::to_string) else {
        request.respond(Response::error("HTTP", 400, "missing client ID"));
        return;
    };
    let given_rev = message.property("rev").unwrap_or_default().to_string();
    let result = save_peer_checkpoint(store, &client, &given_rev, message.body.clone()).await;
    match result {
        Ok(new_rev) => request.respond(Response::ok().with_property("rev", new_rev)),
        Err(err) => request.respond(Response::from_error(&err)),
    }
}

async fn save_peer_checkpoint(
    store: &dyn RecordStore,
    client: &str,
    given_rev: &str,
    body: Vec<u8>,
) -> Result<String> {
    let existing = store
        .get(keyspace::PEER_CHECKPOINTS, client, ContentLevel::EntireBody)
        .await?;
    let (stored_rev, expecting) = match &existing {
        Some(record) => (
            String::from_utf8_lossy(&record.extras).to_string(),
            Some((record.sequence, record.subsequence)),
        ),
        None => (String::new(), Some((0, 0))),
    };
    if stored_rev != given_rev {
        debug!(client, stored_rev, given_rev, "checkpoint rev mismatch");
        return Err(Error::Conflict);
    }
    let new_rev = (stored_rev.parse::<u64>().unwrap_or(0) + 1).to_string();
    let result = store
        .set(
            keyspace::PEER_CHECKPOINTS,
            RecordUpdate {
                doc_id: client.to_string(),
                version: vec![1],
                body,
                extras: new_rev.clone().into_bytes(),
                flags: DocumentFlags::NONE,
                new_sequence: true,
            },
            expecting,
        )
        .await?;
    match result {
        skiffdb_core::record::SetResult::Stored { .. } => Ok(new_rev),
        skiffdb_core::record::SetResult::Conflict => Err(Error::Conflict),
    }
}

/// Serves `getAttachment`: replies with the blob bytes.
pub(crate) async fn handle_get_attachment(blobs: &dyn BlobStore, request: IncomingRequest) {
    let digest = request.message.property("digest").unwrap_or_default();
    let key = match BlobKey::parse(digest) {
        Ok(k) => k,
        Err(err) => {
            request.respond(Response::from_error(&err));
            return;
        }
    };
    match blobs.get(&key).await {
        Ok(Some(data)) => request.respond(Response::ok().with_body(data)),
        Ok(None) => request.respond(Response::error("HTTP", 404, "no such attachment")),
        Err(err) => request.respond(Response::from_error(&err)),
    }
}

/// Serves `proveAttachment`: proves possession of a blob by hashing it
/// with the challenger's nonce, without sending the content.
pub(crate) async fn handle_prove_attachment(blobs: &dyn BlobStore, request: IncomingRequest) {
    let message = &request.message;
    let digest = message.property("digest").unwrap_or_default();
    let key = match BlobKey::parse(digest) {
        Ok(k) => k,
        Err(err) => {
            request.respond(Response::from_error(&err));
            return;
        }
    };
    let nonce = message.body.clone();
    match blobs.get(&key).await {
        Ok(Some(data)) => {
            request.respond(Response::ok().with_body(attachment_proof(&nonce, &data).into_bytes()))
        }
        Ok(None) => request.respond(Response::error("HTTP", 404, "no such attachment")),
        Err(err) => request.respond(Response::from_error(&err)),
    }
}

/// `base64(SHA-1(nonce || content))`, checked by the challenger.
pub(crate) fn attachment_proof(nonce: &[u8], content: &[u8]) -> String {
    let mut hasher = Sha1::new();
    hasher.update(nonce);
    hasher.update(content);
    STANDARD.encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use skiffdb_net::blip::{Message, profile};
    use skiffdb_store_memory::{MemoryBlobStore, MemoryStore};
    use tokio::sync::oneshot;

    fn request(message: Message) -> (IncomingRequest, oneshot::Receiver<Response>) {
        let (tx, rx) = oneshot::channel();
        (IncomingRequest::new(message, Some(tx)), rx)
    }

    #[tokio::test]
    async fn checkpoint_get_missing_is_404() {
        let store = MemoryStore::new();
        let (req, rx) = request(Message::new(profile::GET_CHECKPOINT).with_property("client", "c1"));
        handle_get_checkpoint(&store, req).await;
        let response = rx.await.unwrap();
        assert_eq!(response.error_code(), Some(404));
    }

    #[tokio::test]
    async fn checkpoint_set_then_get_round_trip() {
        let store = MemoryStore::new();

        let (req, rx) = request(
            Message::new(profile::SET_CHECKPOINT)
                .with_property("client", "c1")
                .with_body(b"{\"local\":5}".to_vec()),
        );
        handle_set_checkpoint(&store, req).await;
        let response = rx.await.unwrap();
        assert!(!response.is_error());
        assert_eq!(response.property("rev"), Some("1"));

        let (req, rx) = request(Message::new(profile::GET_CHECKPOINT).with_property("client", "c1"));
        handle_get_checkpoint(&store, req).await;
        let response = rx.await.unwrap();
        assert_eq!(response.property("rev"), Some("1"));
        assert_eq!(response.body, b"{\"local\":5}");
    }

    #[tokio::test]
    async fn checkpoint_set_with_stale_rev_conflicts() {
        let store = MemoryStore::new();
        let (req, rx) = request(
            Message::new(profile::SET_CHECKPOINT)
                .with_property("client", "c1")
                .with_body(b"{}".to_vec()),
        );
        handle_set_checkpoint(&store, req).await;
        rx.await.unwrap();

        // Save again without the rev we were given.
        let (req, rx) = request(
            Message::new(profile::SET_CHECKPOINT)
                .with_property("client", "c1")
                .with_body(b"{}".to_vec()),
        );
        handle_set_checkpoint(&store, req).await;
        let response = rx.await.unwrap();
        assert_eq!(response.error_code(), Some(409));

        // With the right rev it succeeds.
        let (req, rx) = request(
            Message::new(profile::SET_CHECKPOINT)
                .with_property("client", "c1")
                .with_property("rev", "1")
                .with_body(b"{}".to_vec()),
        );
        handle_set_checkpoint(&store, req).await;
        let response = rx.await.unwrap();
        assert_eq!(response.property("rev"), Some("2"));
    }

    #[tokio::test]
    async fn attachments_serve_and_prove() {
        let blobs = MemoryBlobStore::new();
        let key = skiffdb_core::blob::BlobStore::put(&blobs, b"blob bytes")
            .await
            .unwrap();

        let (req, rx) = request(
            Message::new(profile::GET_ATTACHMENT).with_property("digest", key.to_string()),
        );
        handle_get_attachment(&blobs, req).await;
        let response = rx.await.unwrap();
        assert_eq!(response.body, b"blob bytes");

        let (req, rx) = request(
            Message::new(profile::PROVE_ATTACHMENT)
                .with_property("digest", key.to_string())
                .with_body(b"nonce!".to_vec()),
        );
        handle_prove_attachment(&blobs, req).await;
        let response = rx.await.unwrap();
        assert_eq!(
            response.body,
            attachment_proof(b"nonce!", b"blob bytes").into_bytes()
        );
    }

    #[tokio::test]
    async fn unknown_attachment_is_404() {
        let blobs = MemoryBlobStore::new();
        let key = BlobKey::compute(b"never stored");
        let (req, rx) = request(
            Message::new(profile::GET_ATTACHMENT).with_property("digest", key.to_string()),
        );
        handle_get_attachment(&blobs, req).await;
        assert_eq!(rx.await.unwrap().error_code(), Some(404));
    }
}
