//! SkiffDB: an embedded, sync-capable document versioning core.
//!
//! Documents carry their history either as a digest revision tree or as a
//! version vector; two databases exchange revisions over a BLIP-style
//! framed transport with durable checkpoints on both ends. This crate ties
//! the pieces together and offers a small [`Database`] facade; the real
//! machinery lives in the component crates, re-exported below.

use std::sync::Arc;

use serde_json::Value;

pub use skiffdb_core::{
    BlobKey, BlobStore, CollectionSpec, ContentLevel, DocumentFlags, DocumentRecord, Error,
    ErrorDomain, HybridClock, InsertResult, Record, RecordStore, RecordUpdate, RemoteId, Result,
    RevFlags, RevId, RevTree, Revision, SaveResult, SourceId, Version, VersionOrder,
    VersionVector, VersionVectorWithLegacy, VersioningMode,
};
pub use skiffdb_net::{
    Address, AuthChallenge, CookieJar, CookieProvider, Disposition, Headers, HttpLogic,
    IncomingRequest, LoopbackTransport, Message, ProxySpec, ProxyType, Response, Transport,
    loopback_pair,
};
pub use skiffdb_core::record::keyspace;
pub use skiffdb_replication::{
    ActivityLevel, Checkpoint, Checkpointer, ConflictPolicy, Connector, DocEndKind, Direction,
    NullDelegate, ReplicatedDoc, ReplicationMode, Replicator, ReplicatorConfig,
    ReplicatorDelegate, ReplicatorOptions, SingleShotConnector, Status, checkpoint_id,
};
pub use skiffdb_store_memory::{MemoryBlobStore, MemoryStore};

/// A database handle: a record store, a blob store, the shared clock and
/// source identity, plus the versioning mode new documents get.
#[derive(Clone)]
pub struct Database {
    store: Arc<dyn RecordStore>,
    blobs: Arc<dyn BlobStore>,
    clock: Arc<HybridClock>,
    source_id: SourceId,
    mode: VersioningMode,
    collection: CollectionSpec,
}

impl Database {
    /// An in-memory database whose new documents use version vectors.
    pub fn memory() -> Self {
        Self::memory_with_mode(VersioningMode::Vector)
    }

    pub fn memory_with_mode(mode: VersioningMode) -> Self {
        let store = Arc::new(MemoryStore::new());
        let source_id = SourceId::from_uuid(&store.uuid());
        Database {
            store,
            blobs: Arc::new(MemoryBlobStore::new()),
            clock: Arc::new(HybridClock::new()),
            source_id,
            mode,
            collection: CollectionSpec::default_collection(),
        }
    }

    pub fn store(&self) -> Arc<dyn RecordStore> {
        self.store.clone()
    }

    pub fn blobs(&self) -> Arc<dyn BlobStore> {
        self.blobs.clone()
    }

    pub fn clock(&self) -> Arc<HybridClock> {
        self.clock.clone()
    }

    pub fn source_id(&self) -> SourceId {
        self.source_id
    }

    pub fn collection(&self) -> &CollectionSpec {
        &self.collection
    }

    pub fn uuid_string(&self) -> String {
        self.store.uuid().to_string()
    }

    /// Writes a new revision of `doc_id`, creating the document if needed.
    pub async fn put(&self, doc_id: &str, body: Value) -> Result<RevId> {
        self.write(doc_id, body, DocumentFlags::NONE).await
    }

    /// Writes a deletion tombstone.
    pub async fn delete(&self, doc_id: &str) -> Result<RevId> {
        self.write(doc_id, Value::Object(Default::default()), DocumentFlags::DELETED)
            .await
    }

    async fn write(&self, doc_id: &str, body: Value, flags: DocumentFlags) -> Result<RevId> {
        let keyspace = self.collection.keyspace();
        let mut doc = match self
            .store
            .get(&keyspace, doc_id, ContentLevel::EntireBody)
            .await?
        {
            Some(record) => DocumentRecord::load(&record)?,
            None => DocumentRecord::new(doc_id, self.mode),
        };
        let rev = doc.set_current_revision(body, flags, None, &self.clock)?;
        match doc.save(self.store.as_ref(), &keyspace).await? {
            SaveResult::Conflict => Err(Error::Conflict),
            _ => Ok(rev),
        }
    }

    /// The current revision of a document, tombstones included.
    pub async fn get(&self, doc_id: &str) -> Result<Option<Revision>> {
        Ok(self.document(doc_id).await?.and_then(|d| d.current_revision()))
    }

    /// The full document record, or `None` if absent (or purged).
    pub async fn document(&self, doc_id: &str) -> Result<Option<DocumentRecord>> {
        let keyspace = self.collection.keyspace();
        match self
            .store
            .get(&keyspace, doc_id, ContentLevel::EntireBody)
            .await?
        {
            Some(record) => Ok(Some(DocumentRecord::load(&record)?)),
            None => Ok(None),
        }
    }

    /// Saves a mutated document record back.
    pub async fn save_document(&self, doc: &mut DocumentRecord) -> Result<SaveResult> {
        doc.save(self.store.as_ref(), &self.collection.keyspace()).await
    }

    pub async fn last_sequence(&self) -> Result<u64> {
        self.store.last_sequence(&self.collection.keyspace()).await
    }

    /// Builds a replicator for this database over an established transport.
    pub fn replicator(
        &self,
        options: ReplicatorOptions,
        delegate: Arc<dyn ReplicatorDelegate>,
        remote_identity: impl Into<String>,
        transport: Arc<dyn Transport>,
    ) -> Arc<Replicator> {
        Replicator::new(
            ReplicatorConfig {
                store: self.store.clone(),
                blobs: self.blobs.clone(),
                collections: vec![self.collection.clone()],
                options,
                delegate,
                remote_identity: remote_identity.into(),
                clock: self.clock.clone(),
                source_id: self.source_id,
            },
            Arc::new(SingleShotConnector::new(transport)),
        )
    }
}
