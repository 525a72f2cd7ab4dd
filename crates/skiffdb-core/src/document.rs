use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha1::{Digest, Sha1};

use crate::clock::HybridClock;
use crate::error::{Error, Result};
use crate::record::{ContentLevel, DocumentFlags, Record, RecordUpdate, SetResult};
use crate::rev_tree::{self, RemoteId, RevFlags, RevTree};
use crate::revid::RevId;
use crate::store::RecordStore;
use crate::version::SourceId;
use crate::version_vector::VersionVector;

/// Metadata and properties of one document revision, as surfaced to
/// callers: the body, its identifier, and document-level flags.
#[derive(Debug, Clone)]
pub struct Revision {
    pub rev_id: RevId,
    pub body: Option<Value>,
    pub flags: DocumentFlags,
}

impl Revision {
    pub fn is_deleted(&self) -> bool {
        self.flags.contains(DocumentFlags::DELETED)
    }
}

/// Which history representation a document uses. Picked on first write,
/// stable for the record's lifetime; mixing modes is an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersioningMode {
    Tree,
    Vector,
}

/// Outcome of [`DocumentRecord::save`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveResult {
    /// The store's record moved under us; nothing was written.
    Conflict,
    /// No changes to write.
    NoSave,
    /// Written in place without a new sequence.
    NoNewSequence,
    /// Written with a freshly allocated sequence.
    NewSequence,
}

#[derive(Debug)]
enum Versioning {
    Tree(RevTree),
    Vector(VectorState),
}

#[derive(Debug, Default)]
struct VectorState {
    vector: VersionVector,
    /// Last digest-form revision ID from before this doc went vector-mode;
    /// reported to legacy peers in history lists.
    legacy_rev: Option<RevId>,
    /// Known revision per remote; index = RemoteId, entry 0 unused (the
    /// current revision lives in the record proper).
    remotes: Vec<Option<StoredRemoteRev>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredRemoteRev {
    rev: VersionVector,
    #[serde(skip_serializing_if = "Option::is_none")]
    body: Option<Value>,
    flags: DocumentFlags,
}

#[derive(Serialize, Deserialize)]
struct RawVectorExtras {
    revisions: Vec<Option<StoredRemoteRev>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    legacy: Option<RevId>,
}

/// The in-memory form of one persisted document: current revision plus
/// per-remote revision metadata, with history arithmetic delegated to a
/// revision tree or a version vector depending on the record's mode.
#[derive(Debug)]
pub struct DocumentRecord {
    doc_id: String,
    sequence: u64,
    subsequence: u64,
    flags: DocumentFlags,
    body: Option<Value>,
    versioning: Versioning,
    exists: bool,
    changed: bool,
    rev_id_changed: bool,
}

impl DocumentRecord {
    /// Starts a brand-new document in the given mode.
    pub fn new(doc_id: impl Into<String>, mode: VersioningMode) -> Self {
        DocumentRecord {
            doc_id: doc_id.into(),
            sequence: 0,
            subsequence: 0,
            flags: DocumentFlags::NONE,
            body: None,
            versioning: match mode {
                VersioningMode::Tree => Versioning::Tree(RevTree::new()),
                VersioningMode::Vector => Versioning::Vector(VectorState::default()),
            },
            exists: false,
            changed: false,
            rev_id_changed: false,
        }
    }

    /// Rebuilds a document from a stored record, classifying its mode by
    /// the leading byte of the version field (zero → vector form), with a
    /// fallback for legacy records that serialized the whole tree into the
    /// body slot.
    pub fn load(record: &Record) -> Result<Self> {
        if record.content < ContentLevel::EntireBody {
            return Err(Error::InvalidParameter(
                "document requires a fully loaded record".into(),
            ));
        }
        let mut doc = match record.version.first() {
            None => {
                if rev_tree::is_rev_tree(&record.body) {
                    // Legacy layout: no version column, tree in the body.
                    let tree = RevTree::decode(&record.body)?;
                    Self::from_tree(record, tree)
                } else {
                    return Err(Error::CorruptRevisionData(format!(
                        "record '{}' has no version",
                        record.doc_id
                    )));
                }
            }
            Some(0) => {
                let vector = VersionVector::from_binary(&record.version)?;
                let extras: RawVectorExtras = if record.extras.is_empty() {
                    RawVectorExtras {
                        revisions: Vec::new(),
                        legacy: None,
                    }
                } else {
                    serde_json::from_slice(&record.extras).map_err(|e| {
                        Error::CorruptRevisionData(format!("bad remote revisions: {e}"))
                    })?
                };
                if extras.legacy.as_ref().is_some_and(RevId::is_version) {
                    return Err(Error::CorruptRevisionData(
                        "legacy revision must be digest-form".into(),
                    ));
                }
                let body = if record.body.is_empty() {
                    None
                } else {
                    Some(serde_json::from_slice(&record.body)?)
                };
                DocumentRecord {
                    doc_id: record.doc_id.clone(),
                    sequence: record.sequence,
                    subsequence: record.subsequence,
                    flags: record.flags,
                    body,
                    versioning: Versioning::Vector(VectorState {
                        vector,
                        legacy_rev: extras.legacy,
                        remotes: extras.revisions,
                    }),
                    exists: true,
                    changed: false,
                    rev_id_changed: false,
                }
            }
            Some(_) => {
                let tree = RevTree::decode(&record.extras)?;
                Self::from_tree(record, tree)
            }
        };
        doc.apply_synced_flag();
        Ok(doc)
    }

    fn from_tree(record: &Record, tree: RevTree) -> DocumentRecord {
        DocumentRecord {
            doc_id: record.doc_id.clone(),
            sequence: record.sequence,
            subsequence: record.subsequence,
            flags: record.flags,
            body: None,
            versioning: Versioning::Tree(tree),
            exists: true,
            changed: false,
            rev_id_changed: false,
        }
    }

    /// The SYNCED flag records "current rev reached remote #1" without a
    /// rewrite of the remote-revision state; loading materializes it.
    fn apply_synced_flag(&mut self) {
        if !self.flags.contains(DocumentFlags::SYNCED) {
            return;
        }
        self.flags = self.flags.difference(DocumentFlags::SYNCED);
        if let Some(current) = self.current_revision() {
            let _ = self.set_remote_revision(rev_tree::DEFAULT_REMOTE, Some(current));
        }
        self.changed = true;
    }

    // ---- Accessors --------------------------------------------------------

    pub fn doc_id(&self) -> &str {
        &self.doc_id
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn exists(&self) -> bool {
        self.exists
    }

    pub fn changed(&self) -> bool {
        self.changed
    }

    pub fn flags(&self) -> DocumentFlags {
        self.flags
    }

    pub fn mode(&self) -> VersioningMode {
        match &self.versioning {
            Versioning::Tree(_) => VersioningMode::Tree,
            Versioning::Vector(_) => VersioningMode::Vector,
        }
    }

    pub fn is_conflicted(&self) -> bool {
        match &self.versioning {
            Versioning::Tree(tree) => tree.has_conflict(),
            Versioning::Vector(_) => self.flags.contains(DocumentFlags::CONFLICTED),
        }
    }

    pub fn current_rev_id(&self) -> Option<RevId> {
        match &self.versioning {
            Versioning::Tree(tree) => tree.current().map(|r| r.rev_id.clone()),
            Versioning::Vector(v) => v.vector.current().copied().map(RevId::Version),
        }
    }

    /// The full version vector of the current revision (vector mode only).
    pub fn current_vector(&self) -> Option<&VersionVector> {
        match &self.versioning {
            Versioning::Vector(v) if !v.vector.is_empty() => Some(&v.vector),
            _ => None,
        }
    }

    /// The last pre-upgrade digest revision ID, if this vector-mode doc has
    /// one to report to legacy peers.
    pub fn legacy_rev_id(&self) -> Option<&RevId> {
        match &self.versioning {
            Versioning::Vector(v) => v.legacy_rev.as_ref(),
            Versioning::Tree(_) => None,
        }
    }

    pub fn current_revision(&self) -> Option<Revision> {
        match &self.versioning {
            Versioning::Tree(tree) => tree.current().map(|current| Revision {
                rev_id: current.rev_id.clone(),
                body: current.body.clone(),
                flags: self.flags,
            }),
            Versioning::Vector(v) => v.vector.current().map(|version| Revision {
                rev_id: RevId::Version(*version),
                body: self.body.clone(),
                flags: self.flags,
            }),
        }
    }

    /// The revision this remote is known to have; remote 0 aliases current.
    pub fn remote_revision(&self, remote: RemoteId) -> Option<Revision> {
        if remote == rev_tree::NO_REMOTE {
            return self.current_revision();
        }
        match &self.versioning {
            Versioning::Tree(tree) => tree.remote_rev(remote).map(|rev| Revision {
                rev_id: rev.rev_id.clone(),
                body: rev.body.clone(),
                flags: if rev.is_deleted() {
                    DocumentFlags::DELETED
                } else {
                    DocumentFlags::NONE
                },
            }),
            Versioning::Vector(v) => v
                .remotes
                .get(remote as usize)
                .and_then(Option::as_ref)
                .and_then(|r| {
                    r.rev.current().map(|version| Revision {
                        rev_id: RevId::Version(*version),
                        body: r.body.clone(),
                        flags: r.flags,
                    })
                }),
        }
    }

    /// The full vector this remote is known to have (vector mode only).
    pub fn remote_vector(&self, remote: RemoteId) -> Option<&VersionVector> {
        match &self.versioning {
            Versioning::Vector(v) if remote != rev_tree::NO_REMOTE => v
                .remotes
                .get(remote as usize)
                .and_then(Option::as_ref)
                .map(|r| &r.rev),
            Versioning::Vector(v) => Some(&v.vector),
            Versioning::Tree(_) => None,
        }
    }

    // ---- Mutation ---------------------------------------------------------

    pub fn set_remote_revision(&mut self, remote: RemoteId, rev: Option<Revision>) -> Result<()> {
        if remote == rev_tree::NO_REMOTE {
            return Err(Error::InvalidParameter("remote 0 is the local database".into()));
        }
        match &mut self.versioning {
            Versioning::Tree(tree) => {
                let rev_id = rev.as_ref().map(|r| &r.rev_id);
                if rev_id.is_some_and(|r| r.is_version()) {
                    return Err(Error::BadRevisionId(
                        "tree-mode documents take digest revisions".into(),
                    ));
                }
                tree.set_remote_rev(remote, rev_id)?;
            }
            Versioning::Vector(v) => {
                let stored = match rev {
                    None => None,
                    Some(r) => {
                        let vector = match &r.rev_id {
                            RevId::Version(version) => {
                                // Recording our own revision carries the
                                // full current vector, not just its head.
                                if v.vector.current() == Some(version) {
                                    v.vector.clone()
                                } else {
                                    VersionVector::from_current(*version)
                                }
                            }
                            RevId::Digest { .. } => {
                                return Err(Error::BadRevisionId(
                                    "vector-mode documents take version revisions".into(),
                                ));
                            }
                        };
                        Some(StoredRemoteRev {
                            rev: vector,
                            body: r.body,
                            flags: r.flags,
                        })
                    }
                };
                let slot = remote as usize;
                if v.remotes.len() <= slot {
                    v.remotes.resize_with(slot + 1, || None);
                }
                v.remotes[slot] = stored;
            }
        }
        self.changed = true;
        Ok(())
    }

    /// Records the full vector a remote is known to have (vector mode).
    pub fn set_remote_vector(
        &mut self,
        remote: RemoteId,
        vector: VersionVector,
        body: Option<Value>,
        flags: DocumentFlags,
    ) -> Result<()> {
        let Versioning::Vector(v) = &mut self.versioning else {
            return Err(Error::BadRevisionId(
                "tree-mode documents take digest revisions".into(),
            ));
        };
        let slot = remote as usize;
        if remote == rev_tree::NO_REMOTE {
            return Err(Error::InvalidParameter("remote 0 is the local database".into()));
        }
        if v.remotes.len() <= slot {
            v.remotes.resize_with(slot + 1, || None);
        }
        v.remotes[slot] = Some(StoredRemoteRev { rev: vector, body, flags });
        self.changed = true;
        Ok(())
    }

    /// Replaces the current revision with a locally authored edit. Returns
    /// the new revision ID. Without an explicit `rev_id`, tree mode derives
    /// a digest child of the current revision and vector mode mints a new
    /// local version.
    pub fn set_current_revision(
        &mut self,
        body: Value,
        flags: DocumentFlags,
        rev_id: Option<RevId>,
        clock: &HybridClock,
    ) -> Result<RevId> {
        let new_id = match &mut self.versioning {
            Versioning::Tree(tree) => {
                if rev_id.as_ref().is_some_and(RevId::is_version) {
                    return Err(Error::BadRevisionId(
                        "tree-mode documents take digest revisions".into(),
                    ));
                }
                let parent = tree.current().map(|r| r.rev_id.clone());
                let deleted = flags.contains(DocumentFlags::DELETED);
                let new_id = match rev_id {
                    Some(id) => id,
                    None => generate_rev_id(parent.as_ref(), deleted, &body),
                };
                let mut rev_flags = RevFlags::NONE;
                if deleted {
                    rev_flags = rev_flags.union(RevFlags::DELETED);
                }
                if flags.contains(DocumentFlags::HAS_ATTACHMENTS) {
                    rev_flags = rev_flags.union(RevFlags::HAS_ATTACHMENTS);
                }
                let result =
                    tree.insert(new_id.clone(), Some(body), rev_flags, parent.as_ref(), false);
                if result.is_rejection() {
                    return Err(Error::Conflict);
                }
                new_id
            }
            Versioning::Vector(v) => {
                match rev_id {
                    None => v.vector.add_new_version(clock, SourceId::ME),
                    Some(RevId::Version(version)) => v.vector.add(version)?,
                    Some(RevId::Digest { .. }) => {
                        return Err(Error::BadRevisionId(
                            "vector-mode documents take version revisions".into(),
                        ));
                    }
                }
                self.body = Some(body);
                RevId::Version(*v.vector.current().expect("just added a version"))
            }
        };
        self.flags = flags.difference(DocumentFlags::SYNCED);
        self.changed = true;
        self.rev_id_changed = true;
        Ok(new_id)
    }

    /// Replaces the current revision wholesale with one pulled from a peer
    /// (vector mode): the peer's vector becomes ours.
    pub fn replace_current(
        &mut self,
        vector: VersionVector,
        body: Option<Value>,
        flags: DocumentFlags,
    ) -> Result<()> {
        let Versioning::Vector(v) = &mut self.versioning else {
            return Err(Error::BadRevisionId(
                "tree-mode documents take digest revisions".into(),
            ));
        };
        v.vector = vector;
        self.body = body;
        self.flags = flags.difference(DocumentFlags::SYNCED);
        self.changed = true;
        self.rev_id_changed = true;
        Ok(())
    }

    /// Remembers the digest revision this document had before switching to
    /// vector mode.
    pub fn set_legacy_rev_id(&mut self, rev_id: Option<RevId>) -> Result<()> {
        let Versioning::Vector(v) = &mut self.versioning else {
            return Err(Error::BadRevisionId("not a vector-mode document".into()));
        };
        if rev_id.as_ref().is_some_and(RevId::is_version) {
            return Err(Error::BadRevisionId("legacy revision must be digest-form".into()));
        }
        v.legacy_rev = rev_id;
        self.changed = true;
        Ok(())
    }

    /// Inserts a pulled revision plus ancestry (tree mode). Returns the
    /// common-ancestor index, as the tree reports it.
    pub fn insert_history(
        &mut self,
        history: &[RevId],
        body: Option<Value>,
        flags: DocumentFlags,
        allow_conflict: bool,
    ) -> Result<usize> {
        let Versioning::Tree(tree) = &mut self.versioning else {
            return Err(Error::BadRevisionId(
                "vector-mode documents take version revisions".into(),
            ));
        };
        let mut rev_flags = RevFlags::NONE;
        if flags.contains(DocumentFlags::DELETED) {
            rev_flags = rev_flags.union(RevFlags::DELETED);
        }
        if flags.contains(DocumentFlags::HAS_ATTACHMENTS) {
            rev_flags = rev_flags.union(RevFlags::HAS_ATTACHMENTS);
        }
        let idx = tree.insert_history(history, body, rev_flags, allow_conflict)?;
        let current = tree.current();
        self.flags = if current.is_some_and(|r| r.is_deleted()) {
            self.flags.union(DocumentFlags::DELETED)
        } else {
            self.flags.difference(DocumentFlags::DELETED)
        };
        self.flags = if tree.has_conflict() {
            self.flags.union(DocumentFlags::CONFLICTED)
        } else {
            self.flags.difference(DocumentFlags::CONFLICTED)
        };
        self.changed = true;
        self.rev_id_changed = true;
        Ok(idx)
    }

    /// Marks the current revision as pushed to remote #1 without rewriting
    /// remote state; persisted as the SYNCED flag.
    pub fn mark_synced(&mut self) {
        self.flags = self.flags.union(DocumentFlags::SYNCED);
        self.changed = true;
    }

    /// Flags an unresolved conflict with a peer's revision (vector mode;
    /// tree mode derives the flag from its branches).
    pub fn mark_conflicted(&mut self) {
        self.flags = self.flags.union(DocumentFlags::CONFLICTED);
        self.changed = true;
    }

    /// Direct access to the revision tree (tree mode).
    pub fn rev_tree(&self) -> Option<&RevTree> {
        match &self.versioning {
            Versioning::Tree(tree) => Some(tree),
            Versioning::Vector(_) => None,
        }
    }

    pub fn rev_tree_mut(&mut self) -> Option<&mut RevTree> {
        self.changed = true;
        match &mut self.versioning {
            Versioning::Tree(tree) => Some(tree),
            Versioning::Vector(_) => None,
        }
    }

    // ---- Conflict resolution ----------------------------------------------

    /// Resolves a vector-mode conflict against what `remote` holds: the new
    /// current vector is the merge of both, dominating each, with `body` as
    /// the merged content (defaults to the local body). Clears the
    /// conflicted flag atomically with the history change.
    pub fn resolve_vector_conflict(
        &mut self,
        remote: RemoteId,
        body: Option<Value>,
        clock: &HybridClock,
    ) -> Result<RevId> {
        let Versioning::Vector(v) = &mut self.versioning else {
            return Err(Error::BadRevisionId("not a vector-mode document".into()));
        };
        let theirs = v
            .remotes
            .get(remote as usize)
            .and_then(Option::as_ref)
            .map(|r| r.rev.clone())
            .ok_or_else(|| Error::NotFound(format!("no revision for remote {remote}")))?;
        v.vector = VersionVector::merge(&v.vector, &theirs, clock);
        if let Some(body) = body {
            self.body = Some(body);
        }
        self.flags = self.flags.difference(DocumentFlags::CONFLICTED);
        self.changed = true;
        self.rev_id_changed = true;
        Ok(RevId::Version(*v.vector.current().expect("merge is non-empty")))
    }

    /// Resolves a tree-mode conflict: the losing branch is closed, the
    /// winning branch stops being flagged, and an optional merged body is
    /// written as a child of the winner.
    pub fn resolve_tree_conflict(
        &mut self,
        winner: &RevId,
        loser: &RevId,
        merged_body: Option<Value>,
    ) -> Result<RevId> {
        let Versioning::Tree(tree) = &mut self.versioning else {
            return Err(Error::BadRevisionId("not a tree-mode document".into()));
        };
        tree.close_branch(loser)?;
        tree.mark_branch_not_conflict(winner);
        let new_id = match merged_body {
            Some(body) => {
                let new_id = generate_rev_id(Some(winner), false, &body);
                let result = tree.insert(new_id.clone(), Some(body), RevFlags::NONE, Some(winner), false);
                if result.is_rejection() {
                    return Err(Error::Conflict);
                }
                new_id
            }
            None => winner.clone(),
        };
        self.flags = self.flags.difference(DocumentFlags::CONFLICTED);
        self.changed = true;
        self.rev_id_changed = true;
        Ok(new_id)
    }

    // ---- Persistence ------------------------------------------------------

    /// Writes changes back to the record store. A new sequence is allocated
    /// only when the current revision ID changed (or the doc is new); a CAS
    /// miss leaves durable state untouched and reports `Conflict`.
    pub async fn save(&mut self, store: &dyn RecordStore, keyspace: &str) -> Result<SaveResult> {
        if !self.changed {
            return Ok(SaveResult::NoSave);
        }
        let new_sequence = self.rev_id_changed || !self.exists;
        let update = self.encode(new_sequence)?;
        let expecting = Some((self.sequence, self.subsequence));
        match store.set(keyspace, update, expecting).await? {
            SetResult::Conflict => Ok(SaveResult::Conflict),
            SetResult::Stored { sequence, subsequence } => {
                self.sequence = sequence;
                self.subsequence = subsequence;
                if let Versioning::Tree(tree) = &mut self.versioning {
                    tree.saved(sequence);
                }
                self.exists = true;
                self.changed = false;
                self.rev_id_changed = false;
                Ok(if new_sequence {
                    SaveResult::NewSequence
                } else {
                    SaveResult::NoNewSequence
                })
            }
        }
    }

    fn encode(&self, new_sequence: bool) -> Result<RecordUpdate> {
        let (version, body, extras, flags) = match &self.versioning {
            Versioning::Tree(tree) => {
                let current = tree
                    .current()
                    .ok_or_else(|| Error::InvalidParameter("document has no revisions".into()))?;
                let body = match &current.body {
                    Some(b) => serde_json::to_vec(b)?,
                    None => Vec::new(),
                };
                let mut flags = self.flags;
                if current.is_deleted() {
                    flags = flags.union(DocumentFlags::DELETED);
                }
                if tree.has_conflict() {
                    flags = flags.union(DocumentFlags::CONFLICTED);
                } else {
                    flags = flags.difference(DocumentFlags::CONFLICTED);
                }
                (current.rev_id.to_binary(), body, tree.encode()?, flags)
            }
            Versioning::Vector(v) => {
                if v.vector.is_empty() {
                    return Err(Error::InvalidParameter("document has no revisions".into()));
                }
                let body = match &self.body {
                    Some(b) => serde_json::to_vec(b)?,
                    None => Vec::new(),
                };
                let extras = if v.remotes.iter().all(Option::is_none) && v.legacy_rev.is_none() {
                    Vec::new()
                } else {
                    serde_json::to_vec(&RawVectorExtras {
                        revisions: v.remotes.clone(),
                        legacy: v.legacy_rev.clone(),
                    })?
                };
                (v.vector.to_binary(), body, extras, self.flags)
            }
        };
        Ok(RecordUpdate {
            doc_id: self.doc_id.clone(),
            version,
            body,
            extras,
            flags,
            new_sequence,
        })
    }
}

/// Derives a digest-form revision ID for a new tree-mode revision: SHA-1
/// over the parent's binary ID, the deletion flag, and the canonical JSON
/// body, truncated to 16 bytes. Deterministic across peers, so identical
/// edits converge on identical IDs.
pub fn generate_rev_id(parent: Option<&RevId>, deleted: bool, body: &Value) -> RevId {
    let parent_bin = parent.map(RevId::to_binary).unwrap_or_default();
    let canonical = serde_json::to_vec(body).unwrap_or_default();
    let mut hasher = Sha1::new();
    hasher.update([parent_bin.len().min(255) as u8]);
    hasher.update(&parent_bin);
    hasher.update([u8::from(deleted)]);
    hasher.update(&canonical);
    let digest = hasher.finalize();
    RevId::Digest {
        generation: parent.and_then(|p| p.generation()).unwrap_or(0) + 1,
        digest: digest[..16].to_vec(),
    }
}
