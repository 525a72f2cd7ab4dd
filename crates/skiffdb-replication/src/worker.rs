use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use skiffdb_core::blob::BlobStore;
use skiffdb_core::clock::HybridClock;
use skiffdb_core::record::CollectionSpec;
use skiffdb_core::store::RecordStore;
use skiffdb_core::version::SourceId;
use skiffdb_net::blip::Transport;

use crate::checkpoint::Checkpointer;
use crate::events::{ActivityLevel, BlobProgress, Direction, ReplicatedDoc};
use crate::options::ReplicatorOptions;

/// Everything a push/pull worker needs, shared by cloning. The mutable
/// state of each worker stays inside its own task; these are the shared
/// collaborators with their own synchronization.
#[derive(Clone)]
pub(crate) struct WorkerContext {
    pub store: Arc<dyn RecordStore>,
    pub blobs: Arc<dyn BlobStore>,
    pub transport: Arc<dyn Transport>,
    pub options: Arc<ReplicatorOptions>,
    pub collection: CollectionSpec,
    /// Position of the collection in the connection's collection list;
    /// multiplexed messages carry it as the `collection` property.
    pub collection_index: usize,
    pub checkpointer: Arc<Checkpointer>,
    pub clock: Arc<HybridClock>,
    pub source_id: SourceId,
    pub events: mpsc::UnboundedSender<WorkerEvent>,
    pub cancel: CancellationToken,
}

impl WorkerContext {
    pub fn keyspace(&self) -> String {
        self.collection.keyspace()
    }

    pub fn send_event(&self, event: WorkerEvent) {
        let _ = self.events.send(event);
    }

    pub fn set_level(&self, direction: Direction, level: ActivityLevel) {
        self.send_event(WorkerEvent::Level { direction, level });
    }

    pub fn doc_ended(&self, doc: ReplicatedDoc) {
        self.send_event(WorkerEvent::DocsEnded(vec![doc]));
    }
}

/// Notifications from workers up to the replicator.
#[derive(Debug)]
pub(crate) enum WorkerEvent {
    Level {
        direction: Direction,
        level: ActivityLevel,
    },
    Progress {
        completed: u64,
        total: u64,
        docs: u64,
    },
    DocsEnded(Vec<ReplicatedDoc>),
    BlobProgress(BlobProgress),
    /// A one-shot worker finished its sweep (including in-flight work).
    CaughtUp(Direction),
    /// A worker failed hard; the replicator decides retry vs stop.
    Failed(skiffdb_core::error::Error),
    /// The transport stopped delivering requests.
    ConnectionClosed,
}

// ---------------------------------------------------------------------------
// Wire formats shared by pusher and puller
// ---------------------------------------------------------------------------

/// One entry of a `changes` message: `[sequence, docID, revID, deleted,
/// bodySize]`, trailing zeros omitted by the encoder where possible.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ChangesEntry {
    pub sequence: Value,
    pub doc_id: String,
    pub rev_id: String,
    pub deleted: bool,
    pub body_size: u64,
}

impl ChangesEntry {
    pub fn to_json(&self) -> Value {
        Value::Array(vec![
            self.sequence.clone(),
            Value::from(self.doc_id.clone()),
            Value::from(self.rev_id.clone()),
            Value::from(u64::from(self.deleted)),
            Value::from(self.body_size),
        ])
    }

    pub fn from_json(value: &Value) -> Option<Self> {
        let arr = value.as_array()?;
        Some(ChangesEntry {
            sequence: arr.first()?.clone(),
            doc_id: arr.get(1)?.as_str()?.to_string(),
            rev_id: arr.get(2)?.as_str()?.to_string(),
            deleted: arr.get(3).and_then(Value::as_u64).unwrap_or(0) != 0,
            body_size: arr.get(4).and_then(Value::as_u64).unwrap_or(0),
        })
    }
}

/// One entry of a `proposeChanges` message: `[docID, revID,
/// remoteAncestorRevID, bodySize]`.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ProposeEntry {
    pub doc_id: String,
    pub rev_id: String,
    pub remote_ancestor: Option<String>,
    pub body_size: u64,
}

impl ProposeEntry {
    pub fn to_json(&self) -> Value {
        Value::Array(vec![
            Value::from(self.doc_id.clone()),
            Value::from(self.rev_id.clone()),
            Value::from(self.remote_ancestor.clone().unwrap_or_default()),
            Value::from(self.body_size),
        ])
    }

    pub fn from_json(value: &Value) -> Option<Self> {
        let arr = value.as_array()?;
        let ancestor = arr.get(2).and_then(Value::as_str).unwrap_or_default();
        Some(ProposeEntry {
            doc_id: arr.first()?.as_str()?.to_string(),
            rev_id: arr.get(1)?.as_str()?.to_string(),
            remote_ancestor: (!ancestor.is_empty()).then(|| ancestor.to_string()),
            body_size: arr.get(3).and_then(Value::as_u64).unwrap_or(0),
        })
    }
}

/// The receiver's verdict on one changes/proposeChanges entry.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum ChangeVerdict {
    /// Send the full revision.
    Wanted,
    /// Already known; skip it.
    NotWanted,
    /// Send it as a delta against this ancestor.
    DeltaFrom(String),
    /// Refused with an HTTP-ish status (e.g. 409 on a proposal).
    Refused(u16),
}

impl ChangeVerdict {
    pub fn to_json(&self) -> Value {
        match self {
            ChangeVerdict::Wanted => Value::Bool(true),
            ChangeVerdict::NotWanted => Value::Bool(false),
            ChangeVerdict::DeltaFrom(rev) => Value::from(rev.clone()),
            ChangeVerdict::Refused(status) => Value::from(*status),
        }
    }

    pub fn from_json(value: &Value) -> Self {
        match value {
            Value::Bool(true) => ChangeVerdict::Wanted,
            Value::Bool(false) => ChangeVerdict::NotWanted,
            Value::String(rev) => ChangeVerdict::DeltaFrom(rev.clone()),
            Value::Number(n) => {
                ChangeVerdict::Refused(n.as_u64().unwrap_or(500).min(u64::from(u16::MAX)) as u16)
            }
            _ => ChangeVerdict::NotWanted,
        }
    }
}
