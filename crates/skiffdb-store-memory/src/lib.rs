//! In-memory implementations of the SkiffDB record store and blob store.
//!
//! Used by tests and loopback replication; the semantics mirror what a
//! durable store must provide: per-keyspace ascending sequences, CAS writes,
//! nestable transactions where only the outermost is real, and change
//! notifications delivered after the outermost commit.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use skiffdb_core::blob::{BlobKey, BlobStore};
use skiffdb_core::changes::{ChangeNotifier, ChangeReceiver};
use skiffdb_core::error::{Error, Result};
use skiffdb_core::record::{ContentLevel, Record, RecordUpdate, SetResult};
use skiffdb_core::store::RecordStore;

#[derive(Default, Clone)]
struct Keyspace {
    records: BTreeMap<String, Record>,
    by_seq: BTreeMap<u64, String>,
    last_seq: u64,
}

#[derive(Default)]
struct Inner {
    keyspaces: HashMap<String, Keyspace>,
}

struct TxState {
    depth: usize,
    snapshot: HashMap<String, Keyspace>,
    aborted: bool,
    pending: Vec<(String, u64, String)>,
}

/// An in-memory record store.
pub struct MemoryStore {
    uuid: Uuid,
    inner: RwLock<Inner>,
    tx: Mutex<Option<TxState>>,
    notifier: ChangeNotifier,
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore {
            uuid: Uuid::new_v4(),
            inner: RwLock::new(Inner::default()),
            tx: Mutex::new(None),
            notifier: ChangeNotifier::default(),
        }
    }

    /// A store with a fixed UUID, for tests that need stable checkpoint IDs.
    pub fn with_uuid(uuid: Uuid) -> Self {
        MemoryStore {
            uuid,
            ..Self::new()
        }
    }

    fn trim(record: &Record, content: ContentLevel) -> Record {
        let mut r = record.clone();
        r.content = content;
        match content {
            ContentLevel::MetaOnly => {
                r.body = Vec::new();
                r.extras = Vec::new();
            }
            ContentLevel::CurrentRevOnly => {
                r.extras = Vec::new();
            }
            ContentLevel::EntireBody => {}
        }
        r
    }

    async fn queue_or_send(&self, keyspace: &str, sequence: u64, doc_id: &str) {
        let mut tx = self.tx.lock().await;
        match tx.as_mut() {
            Some(state) => state
                .pending
                .push((keyspace.to_string(), sequence, doc_id.to_string())),
            None => self.notifier.notify(keyspace, sequence, doc_id),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    fn uuid(&self) -> Uuid {
        self.uuid
    }

    async fn get(
        &self,
        keyspace: &str,
        doc_id: &str,
        content: ContentLevel,
    ) -> Result<Option<Record>> {
        let inner = self.inner.read().await;
        Ok(inner
            .keyspaces
            .get(keyspace)
            .and_then(|ks| ks.records.get(doc_id))
            .map(|r| Self::trim(r, content)))
    }

    async fn get_by_sequence(&self, keyspace: &str, sequence: u64) -> Result<Option<Record>> {
        let inner = self.inner.read().await;
        Ok(inner.keyspaces.get(keyspace).and_then(|ks| {
            ks.by_seq
                .get(&sequence)
                .and_then(|id| ks.records.get(id))
                .map(|r| Self::trim(r, ContentLevel::EntireBody))
        }))
    }

    async fn set(
        &self,
        keyspace: &str,
        update: RecordUpdate,
        expecting: Option<(u64, u64)>,
    ) -> Result<SetResult> {
        let mut inner = self.inner.write().await;
        let ks = inner.keyspaces.entry(keyspace.to_string()).or_default();
        let existing = ks.records.get(&update.doc_id);

        if let Some(expected) = expecting {
            let actual = existing
                .map(|r| (r.sequence, r.subsequence))
                .unwrap_or((0, 0));
            if actual != expected {
                return Ok(SetResult::Conflict);
            }
        }

        let (sequence, subsequence) = match existing {
            Some(r) if !update.new_sequence => (r.sequence, r.subsequence + 1),
            _ => {
                ks.last_seq += 1;
                (ks.last_seq, 0)
            }
        };
        if let Some(old) = existing {
            let old_seq = old.sequence;
            if old_seq != sequence {
                ks.by_seq.remove(&old_seq);
            }
        }
        ks.by_seq.insert(sequence, update.doc_id.clone());
        ks.records.insert(
            update.doc_id.clone(),
            Record {
                doc_id: update.doc_id.clone(),
                version: update.version,
                body: update.body,
                extras: update.extras,
                sequence,
                subsequence,
                flags: update.flags,
                content: ContentLevel::EntireBody,
            },
        );
        drop(inner);
        self.queue_or_send(keyspace, sequence, &update.doc_id).await;
        Ok(SetResult::Stored { sequence, subsequence })
    }

    async fn enumerate(&self, keyspace: &str, since: u64, limit: usize) -> Result<Vec<Record>> {
        let inner = self.inner.read().await;
        let Some(ks) = inner.keyspaces.get(keyspace) else {
            return Ok(Vec::new());
        };
        let mut out = Vec::new();
        for (_, doc_id) in ks.by_seq.range(since + 1..) {
            if limit != 0 && out.len() >= limit {
                break;
            }
            if let Some(r) = ks.records.get(doc_id) {
                out.push(Self::trim(r, ContentLevel::EntireBody));
            }
        }
        Ok(out)
    }

    async fn last_sequence(&self, keyspace: &str) -> Result<u64> {
        let inner = self.inner.read().await;
        Ok(inner.keyspaces.get(keyspace).map(|ks| ks.last_seq).unwrap_or(0))
    }

    async fn purge(&self, keyspace: &str, doc_id: &str) -> Result<bool> {
        let mut inner = self.inner.write().await;
        let Some(ks) = inner.keyspaces.get_mut(keyspace) else {
            return Ok(false);
        };
        match ks.records.remove(doc_id) {
            Some(old) => {
                ks.by_seq.remove(&old.sequence);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn begin_transaction(&self) -> Result<()> {
        let mut tx = self.tx.lock().await;
        match tx.as_mut() {
            Some(state) => state.depth += 1,
            None => {
                let inner = self.inner.read().await;
                *tx = Some(TxState {
                    depth: 1,
                    snapshot: inner.keyspaces.clone(),
                    aborted: false,
                    pending: Vec::new(),
                });
            }
        }
        Ok(())
    }

    async fn commit(&self) -> Result<()> {
        let mut tx = self.tx.lock().await;
        let Some(state) = tx.as_mut() else {
            return Err(Error::Store("commit outside a transaction".into()));
        };
        state.depth -= 1;
        if state.depth > 0 {
            return Ok(());
        }
        let state = tx.take().expect("transaction state present");
        if state.aborted {
            // A nested abort poisons the whole transaction.
            let mut inner = self.inner.write().await;
            inner.keyspaces = state.snapshot;
            return Ok(());
        }
        for (keyspace, sequence, doc_id) in state.pending {
            self.notifier.notify(&keyspace, sequence, &doc_id);
        }
        Ok(())
    }

    async fn abort(&self) -> Result<()> {
        let mut tx = self.tx.lock().await;
        let Some(state) = tx.as_mut() else {
            return Err(Error::Store("abort outside a transaction".into()));
        };
        state.depth -= 1;
        state.aborted = true;
        if state.depth > 0 {
            return Ok(());
        }
        let state = tx.take().expect("transaction state present");
        let mut inner = self.inner.write().await;
        inner.keyspaces = state.snapshot;
        Ok(())
    }

    fn subscribe_changes(&self) -> ChangeReceiver {
        self.notifier.subscribe()
    }
}

// ---------------------------------------------------------------------------
// Blob store
// ---------------------------------------------------------------------------

/// Content-addressed in-memory blob storage.
#[derive(Default)]
pub struct MemoryBlobStore {
    blobs: RwLock<HashMap<BlobKey, Vec<u8>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, data: &[u8]) -> Result<BlobKey> {
        let key = BlobKey::compute(data);
        self.blobs.write().await.insert(key, data.to_vec());
        Ok(key)
    }

    async fn get(&self, key: &BlobKey) -> Result<Option<Vec<u8>>> {
        Ok(self.blobs.read().await.get(key).cloned())
    }

    async fn has(&self, key: &BlobKey) -> Result<bool> {
        Ok(self.blobs.read().await.contains_key(key))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use skiffdb_core::record::DocumentFlags;

    const KS: &str = "docs:_default._default";

    fn update(doc_id: &str, body: &[u8], new_sequence: bool) -> RecordUpdate {
        RecordUpdate {
            doc_id: doc_id.into(),
            version: vec![1, 0xaa],
            body: body.to_vec(),
            extras: Vec::new(),
            flags: DocumentFlags::NONE,
            new_sequence,
        }
    }

    #[tokio::test]
    async fn set_allocates_ascending_sequences() {
        let store = MemoryStore::new();
        let r1 = store.set(KS, update("a", b"{}", true), None).await.unwrap();
        let r2 = store.set(KS, update("b", b"{}", true), None).await.unwrap();
        assert_eq!(r1, SetResult::Stored { sequence: 1, subsequence: 0 });
        assert_eq!(r2, SetResult::Stored { sequence: 2, subsequence: 0 });
        assert_eq!(store.last_sequence(KS).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn cas_mismatch_is_conflict() {
        let store = MemoryStore::new();
        store.set(KS, update("a", b"{}", true), Some((0, 0))).await.unwrap();
        let r = store.set(KS, update("a", b"{}", true), Some((0, 0))).await.unwrap();
        assert_eq!(r, SetResult::Conflict);
        let r = store.set(KS, update("a", b"{}", true), Some((1, 0))).await.unwrap();
        assert_eq!(r, SetResult::Stored { sequence: 2, subsequence: 0 });
    }

    #[tokio::test]
    async fn in_place_rewrite_keeps_sequence() {
        let store = MemoryStore::new();
        store.set(KS, update("a", b"{}", true), None).await.unwrap();
        let r = store
            .set(KS, update("a", b"{\"x\":1}", false), Some((1, 0)))
            .await
            .unwrap();
        assert_eq!(r, SetResult::Stored { sequence: 1, subsequence: 1 });
        let rec = store.get(KS, "a", ContentLevel::EntireBody).await.unwrap().unwrap();
        assert_eq!(rec.sequence, 1);
        assert_eq!(rec.subsequence, 1);
    }

    #[tokio::test]
    async fn resequencing_moves_seq_index() {
        let store = MemoryStore::new();
        store.set(KS, update("a", b"{}", true), None).await.unwrap();
        store.set(KS, update("b", b"{}", true), None).await.unwrap();
        store.set(KS, update("a", b"{}", true), None).await.unwrap();
        let records = store.enumerate(KS, 0, 0).await.unwrap();
        let ids: Vec<&str> = records.iter().map(|r| r.doc_id.as_str()).collect();
        assert_eq!(ids, vec!["b", "a"]);
        assert!(store.get_by_sequence(KS, 1).await.unwrap().is_none());
        assert_eq!(store.get_by_sequence(KS, 3).await.unwrap().unwrap().doc_id, "a");
    }

    #[tokio::test]
    async fn enumerate_since_and_limit() {
        let store = MemoryStore::new();
        for i in 0..5 {
            store
                .set(KS, update(&format!("d{i}"), b"{}", true), None)
                .await
                .unwrap();
        }
        let all = store.enumerate(KS, 2, 0).await.unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].doc_id, "d2");
        let limited = store.enumerate(KS, 0, 2).await.unwrap();
        assert_eq!(limited.len(), 2);
    }

    #[tokio::test]
    async fn content_levels_trim_payloads() {
        let store = MemoryStore::new();
        let mut u = update("a", b"{\"x\":1}", true);
        u.extras = b"[1]".to_vec();
        store.set(KS, u, None).await.unwrap();
        let meta = store.get(KS, "a", ContentLevel::MetaOnly).await.unwrap().unwrap();
        assert!(meta.body.is_empty());
        assert!(meta.extras.is_empty());
        assert_eq!(meta.sequence, 1);
        let cur = store.get(KS, "a", ContentLevel::CurrentRevOnly).await.unwrap().unwrap();
        assert!(!cur.body.is_empty());
        assert!(cur.extras.is_empty());
    }

    #[tokio::test]
    async fn abort_discards_nested_writes() {
        let store = MemoryStore::new();
        store.set(KS, update("keep", b"{}", true), None).await.unwrap();

        store.begin_transaction().await.unwrap();
        store.set(KS, update("tx1", b"{}", true), None).await.unwrap();
        store.begin_transaction().await.unwrap();
        store.set(KS, update("tx2", b"{}", true), None).await.unwrap();
        store.abort().await.unwrap(); // nested abort poisons
        store.commit().await.unwrap(); // outermost commit rolls back

        assert!(store.get(KS, "tx1", ContentLevel::MetaOnly).await.unwrap().is_none());
        assert!(store.get(KS, "tx2", ContentLevel::MetaOnly).await.unwrap().is_none());
        assert!(store.get(KS, "keep", ContentLevel::MetaOnly).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn commit_delivers_deferred_notifications() {
        let store = MemoryStore::new();
        let mut rx = store.subscribe_changes();

        store.begin_transaction().await.unwrap();
        store.set(KS, update("a", b"{}", true), None).await.unwrap();
        // Not delivered yet; no await on rx here, just commit and observe.
        store.commit().await.unwrap();

        let n = rx.recv().await.unwrap();
        assert_eq!(n.doc_id, "a");
        assert_eq!(n.sequence, 1);
    }

    #[tokio::test]
    async fn purge_removes_record() {
        let store = MemoryStore::new();
        store.set(KS, update("a", b"{}", true), None).await.unwrap();
        assert!(store.purge(KS, "a").await.unwrap());
        assert!(!store.purge(KS, "a").await.unwrap());
        assert!(store.get(KS, "a", ContentLevel::MetaOnly).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn blob_store_round_trip() {
        let blobs = MemoryBlobStore::new();
        let key = blobs.put(b"attachment data").await.unwrap();
        assert!(blobs.has(&key).await.unwrap());
        assert_eq!(blobs.get(&key).await.unwrap().unwrap(), b"attachment data");
        let missing = BlobKey::compute(b"other");
        assert!(!blobs.has(&missing).await.unwrap());
    }
}
