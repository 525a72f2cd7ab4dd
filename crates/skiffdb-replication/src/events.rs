use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use skiffdb_core::error::Error;
use skiffdb_core::record::{CollectionSpec, DocumentFlags};

/// Lifecycle level of a replicator, surfaced in status callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivityLevel {
    Stopped,
    Offline,
    Connecting,
    Idle,
    Busy,
    Stopping,
}

impl fmt::Display for ActivityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ActivityLevel::Stopped => "stopped",
            ActivityLevel::Offline => "offline",
            ActivityLevel::Connecting => "connecting",
            ActivityLevel::Idle => "idle",
            ActivityLevel::Busy => "busy",
            ActivityLevel::Stopping => "stopping",
        };
        f.write_str(s)
    }
}

/// Unit-count progress of a replication pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Progress {
    pub completed: u64,
    pub total: u64,
    pub doc_count: u64,
}

/// A `(domain, code, message)` error as carried in events; cheap to clone
/// and stable across the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireError {
    pub domain: String,
    pub code: i32,
    pub message: String,
}

impl WireError {
    pub fn from_error(err: &Error) -> Self {
        let (domain, code, message) = err.to_wire();
        WireError { domain, code, message }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusFlags {
    pub will_retry: bool,
    pub host_reachable: bool,
    pub suspended: bool,
}

/// A replicator status snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    pub level: ActivityLevel,
    pub progress: Progress,
    pub error: Option<WireError>,
    pub flags: StatusFlags,
}

impl Status {
    pub fn stopped() -> Self {
        Status {
            level: ActivityLevel::Stopped,
            progress: Progress::default(),
            error: None,
            flags: StatusFlags {
                host_reachable: true,
                ..Default::default()
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Push,
    Pull,
}

/// Why a document's replication ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocEndKind {
    Completed,
    Conflict,
    Purge,
    Error,
}

/// One entry of a `documents_ended` callback batch.
#[derive(Debug, Clone)]
pub struct ReplicatedDoc {
    pub collection: CollectionSpec,
    pub direction: Direction,
    pub doc_id: String,
    pub rev_id: String,
    pub flags: DocumentFlags,
    pub sequence: u64,
    pub kind: DocEndKind,
    pub error: Option<WireError>,
    pub transient: bool,
}

/// Progress of one attachment transfer.
#[derive(Debug, Clone)]
pub struct BlobProgress {
    pub collection: CollectionSpec,
    pub direction: Direction,
    pub doc_id: String,
    pub property: String,
    pub key: String,
    pub bytes_completed: u64,
    pub bytes_total: u64,
    pub error: Option<WireError>,
}

/// Receives replicator notifications. Callbacks arrive on replicator tasks;
/// implementations must not block.
pub trait ReplicatorDelegate: Send + Sync {
    fn status_changed(&self, _status: &Status) {}
    fn documents_ended(&self, _docs: &[ReplicatedDoc]) {}
    fn blob_progress(&self, _progress: &BlobProgress) {}
}

/// A delegate that ignores everything.
pub struct NullDelegate;

impl ReplicatorDelegate for NullDelegate {}

/// Decides whether a revision crosses the replication boundary; returning
/// false suppresses it.
pub type ReplicationFilter =
    Arc<dyn Fn(&CollectionSpec, &str, &str, DocumentFlags, &Value) -> bool + Send + Sync>;
