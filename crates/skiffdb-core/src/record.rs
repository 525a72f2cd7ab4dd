use std::fmt;

use serde::{Deserialize, Serialize};

/// Document-level flag bits persisted on a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentFlags(pub u8);

impl DocumentFlags {
    pub const NONE: DocumentFlags = DocumentFlags(0);
    pub const DELETED: DocumentFlags = DocumentFlags(0x01);
    pub const CONFLICTED: DocumentFlags = DocumentFlags(0x02);
    pub const HAS_ATTACHMENTS: DocumentFlags = DocumentFlags(0x04);
    /// The current revision has been pushed to the default remote; stands in
    /// for rewriting the remote-revision state on every push.
    pub const SYNCED: DocumentFlags = DocumentFlags(0x08);

    pub fn contains(self, other: DocumentFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn union(self, other: DocumentFlags) -> DocumentFlags {
        DocumentFlags(self.0 | other.0)
    }

    pub fn difference(self, other: DocumentFlags) -> DocumentFlags {
        DocumentFlags(self.0 & !other.0)
    }
}

/// How much of a record the store was asked to load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ContentLevel {
    MetaOnly,
    CurrentRevOnly,
    EntireBody,
}

/// One persisted document: the current revision body plus an opaque extras
/// payload holding per-remote revision state (or a whole revision tree).
#[derive(Debug, Clone)]
pub struct Record {
    pub doc_id: String,
    /// Binary revision ID of the current revision; its leading byte
    /// classifies the record's versioning mode.
    pub version: Vec<u8>,
    pub body: Vec<u8>,
    pub extras: Vec<u8>,
    pub sequence: u64,
    /// Bumped when a record is rewritten without a new sequence.
    pub subsequence: u64,
    pub flags: DocumentFlags,
    pub content: ContentLevel,
}

impl Record {
    pub fn new(doc_id: impl Into<String>) -> Self {
        Record {
            doc_id: doc_id.into(),
            version: Vec::new(),
            body: Vec::new(),
            extras: Vec::new(),
            sequence: 0,
            subsequence: 0,
            flags: DocumentFlags::NONE,
            content: ContentLevel::EntireBody,
        }
    }

    pub fn exists(&self) -> bool {
        self.sequence > 0
    }
}

/// A pending write against the record store, CAS-checked on
/// `(doc_id, sequence, subsequence)`.
#[derive(Debug, Clone)]
pub struct RecordUpdate {
    pub doc_id: String,
    pub version: Vec<u8>,
    pub body: Vec<u8>,
    pub extras: Vec<u8>,
    pub flags: DocumentFlags,
    /// True to allocate a new sequence; false rewrites in place, bumping
    /// only the subsequence.
    pub new_sequence: bool,
}

/// Outcome of a `set`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetResult {
    /// Stored; carries the record's (possibly unchanged) sequence and its
    /// new subsequence.
    Stored { sequence: u64, subsequence: u64 },
    /// The expected sequence didn't match: somebody else wrote first.
    Conflict,
}

/// A named scope+collection pair; every operation is scoped to one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CollectionSpec {
    pub scope: String,
    pub name: String,
}

impl CollectionSpec {
    pub const DEFAULT_SCOPE: &'static str = "_default";
    pub const DEFAULT_NAME: &'static str = "_default";

    pub fn new(scope: impl Into<String>, name: impl Into<String>) -> Self {
        CollectionSpec {
            scope: scope.into(),
            name: name.into(),
        }
    }

    pub fn default_collection() -> Self {
        Self::new(Self::DEFAULT_SCOPE, Self::DEFAULT_NAME)
    }

    /// The record-store keyspace holding this collection's documents.
    pub fn keyspace(&self) -> String {
        format!("docs:{self}")
    }
}

impl Default for CollectionSpec {
    fn default() -> Self {
        Self::default_collection()
    }
}

impl fmt::Display for CollectionSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.scope, self.name)
    }
}

/// Reserved keyspaces.
pub mod keyspace {
    /// Durable replication cursors, active side.
    pub const CHECKPOINTS: &str = "checkpoints";
    /// Mirror of connected clients' checkpoints, passive side.
    pub const PEER_CHECKPOINTS: &str = "peer-checkpoints";
    /// Persisted (non-session) HTTP cookies.
    pub const COOKIES: &str = "cookies";
}
