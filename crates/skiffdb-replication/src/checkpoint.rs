use std::collections::BTreeSet;
use std::sync::Mutex;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha1::{Digest, Sha1};
use tracing::{debug, warn};

use skiffdb_core::error::Result;
use skiffdb_core::record::{
    CollectionSpec, ContentLevel, DocumentFlags, RecordUpdate, keyspace,
};
use skiffdb_core::store::RecordStore;

/// Tracks which local sequences are still in flight. The completed floor —
/// the highest sequence below which everything is pushed or skipped — is
/// what a checkpoint may durably record.
#[derive(Debug, Default)]
pub struct SequenceSet {
    pending: BTreeSet<u64>,
    max_seen: u64,
}

impl SequenceSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, sequence: u64) {
        self.pending.insert(sequence);
        self.max_seen = self.max_seen.max(sequence);
    }

    /// Marks a sequence seen but already complete (e.g. filtered out).
    pub fn seen(&mut self, sequence: u64) {
        self.max_seen = self.max_seen.max(sequence);
    }

    pub fn complete(&mut self, sequence: u64) {
        self.pending.remove(&sequence);
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// The highest sequence with nothing pending at or below it.
    pub fn completed_floor(&self) -> u64 {
        match self.pending.first() {
            Some(&lowest) => lowest - 1,
            None => self.max_seen,
        }
    }

    pub fn clear(&mut self) {
        self.pending.clear();
        self.max_seen = 0;
    }
}

/// The durable cursor pair for one `(collection, peer)`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Highest local sequence fully pushed (or decided no-op).
    #[serde(default)]
    pub local: u64,
    /// The peer's opaque pull cursor, echoed back verbatim.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub remote: Value,
    /// Collection UUIDs pinned at first checkpoint; a later mismatch
    /// invalidates the checkpoint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuids: Option<Vec<String>>,
}

impl Checkpoint {
    pub fn to_body(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_body(body: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(body)?)
    }
}

/// Derives the deterministic checkpoint document ID for a replication
/// target: a hash of the local database UUID, the remote identity (URL or
/// the configured stable ID) and the collection path.
pub fn checkpoint_id(
    local_uuid: &str,
    remote_identity: &str,
    collection: &CollectionSpec,
) -> String {
    let input = serde_json::to_vec(&serde_json::json!([
        local_uuid,
        remote_identity,
        collection.to_string()
    ]))
    .expect("checkpoint id input serializes");
    let digest = Sha1::digest(&input);
    format!("cp-{}", URL_SAFE_NO_PAD.encode(digest))
}

#[derive(Debug, Default)]
struct CheckpointerState {
    checkpoint: Checkpoint,
    pending: SequenceSet,
    /// Peer-side revision of the checkpoint document, for CAS on save.
    remote_rev: Option<String>,
    dirty: bool,
    /// Set when the peer's checkpoint disagreed and a full re-scan is
    /// required.
    requires_reset: bool,
}

/// Durable replication-progress bookkeeping for one collection and peer.
///
/// Thread-safe: workers record progress from their own tasks; the
/// replicator drives debounced saves. `local` never regresses — progress
/// is only recorded through the pending-sequence floor, and a checkpoint
/// only becomes durable once every sequence at or below it has committed.
pub struct Checkpointer {
    id: String,
    collection: CollectionSpec,
    save_interval: Duration,
    state: Mutex<CheckpointerState>,
}

impl Checkpointer {
    pub fn new(
        local_uuid: &str,
        remote_identity: &str,
        collection: CollectionSpec,
        save_interval: Duration,
    ) -> Self {
        Checkpointer {
            id: checkpoint_id(local_uuid, remote_identity, &collection),
            collection,
            save_interval,
            state: Mutex::new(CheckpointerState::default()),
        }
    }

    pub fn checkpoint_id(&self) -> &str {
        &self.id
    }

    pub fn collection(&self) -> &CollectionSpec {
        &self.collection
    }

    pub fn save_interval(&self) -> Duration {
        self.save_interval
    }

    fn state(&self) -> std::sync::MutexGuard<'_, CheckpointerState> {
        self.state.lock().expect("checkpointer lock")
    }

    // ---- Progress bookkeeping --------------------------------------------

    pub fn add_pending_sequence(&self, sequence: u64) {
        self.state().pending.add(sequence);
    }

    /// Marks a sequence enumerated but not needing a push.
    pub fn note_sequence(&self, sequence: u64) {
        let mut state = self.state();
        state.pending.seen(sequence);
        self.advance_local(&mut state);
    }

    /// Marks a pushed sequence acknowledged; advances `local` to the new
    /// completed floor.
    pub fn complete_sequence(&self, sequence: u64) {
        let mut state = self.state();
        state.pending.complete(sequence);
        self.advance_local(&mut state);
    }

    fn advance_local(&self, state: &mut CheckpointerState) {
        let floor = state.pending.completed_floor();
        if floor > state.checkpoint.local {
            state.checkpoint.local = floor;
            state.dirty = true;
        }
    }

    pub fn pending_count(&self) -> usize {
        self.state().pending.pending_count()
    }

    pub fn local(&self) -> u64 {
        self.state().checkpoint.local
    }

    pub fn remote(&self) -> Value {
        self.state().checkpoint.remote.clone()
    }

    /// Records the peer's pull cursor after a batch is fully applied.
    pub fn set_remote(&self, cursor: Value) {
        let mut state = self.state();
        if state.checkpoint.remote != cursor {
            state.checkpoint.remote = cursor;
            state.dirty = true;
        }
    }

    pub fn is_dirty(&self) -> bool {
        self.state().dirty
    }

    pub fn requires_reset(&self) -> bool {
        self.state().requires_reset
    }

    /// Discards all progress; the next run re-scans from sequence zero.
    pub fn reset(&self) {
        let mut state = self.state();
        state.checkpoint = Checkpoint {
            uuids: state.checkpoint.uuids.clone(),
            ..Default::default()
        };
        state.pending.clear();
        state.dirty = true;
        state.requires_reset = false;
    }

    // ---- Persistence ------------------------------------------------------

    /// Loads the locally stored copy of this checkpoint.
    pub async fn load_local(&self, store: &dyn RecordStore) -> Result<()> {
        let record = store
            .get(keyspace::CHECKPOINTS, &self.id, ContentLevel::EntireBody)
            .await?;
        if let Some(record) = record {
            let checkpoint = Checkpoint::from_body(&record.body)?;
            debug!(id = %self.id, local = checkpoint.local, "loaded local checkpoint");
            let mut state = self.state();
            state.pending.seen(checkpoint.local);
            state.checkpoint = checkpoint;
            state.dirty = false;
        }
        Ok(())
    }

    /// Writes the local copy. The caller is responsible for having applied
    /// every sequence at or below `local` first.
    pub async fn save_local(&self, store: &dyn RecordStore) -> Result<bool> {
        let (body, was_dirty) = {
            let mut state = self.state();
            if !state.dirty {
                return Ok(false);
            }
            state.dirty = false;
            (state.checkpoint.to_body()?, true)
        };
        let result = store
            .set(
                keyspace::CHECKPOINTS,
                RecordUpdate {
                    doc_id: self.id.clone(),
                    version: vec![1],
                    body,
                    extras: Vec::new(),
                    flags: DocumentFlags::NONE,
                    new_sequence: true,
                },
                None,
            )
            .await;
        if result.is_err() {
            self.state().dirty = true;
        }
        result?;
        Ok(was_dirty)
    }

    /// Snapshot for a `setCheckpoint` message: `(rev-we-know, body)`.
    pub fn remote_save_payload(&self) -> Result<(Option<String>, Vec<u8>)> {
        let state = self.state();
        Ok((state.remote_rev.clone(), state.checkpoint.to_body()?))
    }

    pub fn set_remote_rev(&self, rev: Option<String>) {
        self.state().remote_rev = rev;
    }

    pub fn remote_rev(&self) -> Option<String> {
        self.state().remote_rev.clone()
    }

    /// Reconciles with what the peer has stored under our checkpoint ID.
    ///
    /// Agreement resumes from the stored cursors. Disagreement takes the
    /// peer's value for `remote` and keeps ours for `local`; a collection
    /// UUID mismatch forces a full reset instead.
    pub fn compare_with_peer(
        &self,
        peer: Option<&Checkpoint>,
        peer_rev: Option<String>,
        local_uuids: Option<&[String]>,
    ) {
        let mut state = self.state();
        state.remote_rev = peer_rev;
        match peer {
            None => {
                // Fresh peer: everything we think we pushed is suspect.
                if state.checkpoint.local != 0 || !state.checkpoint.remote.is_null() {
                    warn!(id = %self.id, "peer has no checkpoint; starting over");
                    state.checkpoint.local = 0;
                    state.checkpoint.remote = Value::Null;
                    state.pending.clear();
                    state.dirty = true;
                }
            }
            Some(peer_cp) => {
                if let (Some(pinned), Some(current)) = (&peer_cp.uuids, local_uuids)
                    && pinned != current
                {
                    warn!(id = %self.id, "collection UUID mismatch; resetting checkpoint");
                    state.requires_reset = true;
                    return;
                }
                if *peer_cp != state.checkpoint {
                    debug!(id = %self.id, "checkpoint mismatch; merging");
                    // The peer's view of its own cursor wins; ours of ours.
                    state.checkpoint.remote = peer_cp.remote.clone();
                    state.dirty = true;
                }
                let local = state.checkpoint.local;
                state.pending.seen(local);
            }
        }
        if state.checkpoint.uuids.is_none() {
            state.checkpoint.uuids = local_uuids.map(<[String]>::to_vec);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn checkpointer() -> Checkpointer {
        Checkpointer::new(
            "uuid-1",
            "wss://h/db",
            CollectionSpec::default_collection(),
            Duration::from_millis(500),
        )
    }

    #[test]
    fn sequence_set_floor() {
        let mut s = SequenceSet::new();
        assert_eq!(s.completed_floor(), 0);
        s.add(1);
        s.add(2);
        s.add(4);
        s.seen(5);
        assert_eq!(s.completed_floor(), 0);
        s.complete(1);
        assert_eq!(s.completed_floor(), 1);
        s.complete(2);
        // 4 still pending; 3 was never seen as pending.
        assert_eq!(s.completed_floor(), 3);
        s.complete(4);
        assert_eq!(s.completed_floor(), 5);
    }

    #[test]
    fn checkpoint_id_is_deterministic_and_scoped() {
        let coll = CollectionSpec::default_collection();
        let a = checkpoint_id("uuid-1", "wss://h/db", &coll);
        let b = checkpoint_id("uuid-1", "wss://h/db", &coll);
        assert_eq!(a, b);
        assert!(a.starts_with("cp-"));
        assert_ne!(a, checkpoint_id("uuid-2", "wss://h/db", &coll));
        assert_ne!(a, checkpoint_id("uuid-1", "wss://other/db", &coll));
        assert_ne!(
            a,
            checkpoint_id("uuid-1", "wss://h/db", &CollectionSpec::new("s", "c"))
        );
    }

    #[test]
    fn local_never_regresses() {
        let cp = checkpointer();
        cp.add_pending_sequence(1);
        cp.add_pending_sequence(2);
        cp.complete_sequence(2);
        assert_eq!(cp.local(), 0);
        cp.complete_sequence(1);
        assert_eq!(cp.local(), 2);
        // Completing out-of-order or re-adding earlier work can't go back.
        cp.add_pending_sequence(5);
        assert_eq!(cp.local(), 2);
        cp.complete_sequence(5);
        assert_eq!(cp.local(), 5);
    }

    #[test]
    fn skipped_sequences_advance_floor() {
        let cp = checkpointer();
        cp.note_sequence(1);
        cp.note_sequence(2);
        assert_eq!(cp.local(), 2);
        assert!(cp.is_dirty());
    }

    #[test]
    fn compare_with_matching_peer_resumes() {
        let cp = checkpointer();
        cp.note_sequence(9);
        let stored = Checkpoint {
            local: 9,
            remote: serde_json::json!(42),
            uuids: None,
        };
        // Simulate a prior run by loading the same state.
        cp.set_remote(serde_json::json!(42));
        cp.compare_with_peer(Some(&stored), Some("3".into()), None);
        assert_eq!(cp.local(), 9);
        assert_eq!(cp.remote(), serde_json::json!(42));
        assert_eq!(cp.remote_rev().as_deref(), Some("3"));
    }

    #[test]
    fn compare_with_missing_peer_starts_over() {
        let cp = checkpointer();
        cp.note_sequence(9);
        cp.set_remote(serde_json::json!(10));
        cp.compare_with_peer(None, None, None);
        assert_eq!(cp.local(), 0);
        assert!(cp.remote().is_null());
    }

    #[test]
    fn uuid_mismatch_requires_reset() {
        let cp = checkpointer();
        let stored = Checkpoint {
            local: 3,
            remote: Value::Null,
            uuids: Some(vec!["old-uuid".into()]),
        };
        cp.compare_with_peer(Some(&stored), None, Some(&["new-uuid".to_string()]));
        assert!(cp.requires_reset());
        cp.reset();
        assert_eq!(cp.local(), 0);
        assert!(!cp.requires_reset());
    }

    #[tokio::test]
    async fn save_and_load_round_trip() {
        use skiffdb_store_memory::MemoryStore;

        let store = MemoryStore::new();
        let cp = checkpointer();
        cp.note_sequence(7);
        cp.set_remote(serde_json::json!("cursor-7"));
        assert!(cp.save_local(&store).await.unwrap());
        assert!(!cp.save_local(&store).await.unwrap()); // clean now

        let cp2 = checkpointer();
        cp2.load_local(&store).await.unwrap();
        assert_eq!(cp2.local(), 7);
        assert_eq!(cp2.remote(), serde_json::json!("cursor-7"));
    }
}
