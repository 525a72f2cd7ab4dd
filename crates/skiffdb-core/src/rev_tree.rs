use std::cmp::Ordering;
use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::error::{Error, Result};
use crate::revid::RevId;

/// Small integer naming a replication peer from this document's point of
/// view; 0 is the local database.
pub type RemoteId = u32;

pub const NO_REMOTE: RemoteId = 0;
/// First (and usually only) remote server.
pub const DEFAULT_REMOTE: RemoteId = 1;

/// Default branch-depth limit applied when pruning.
pub const DEFAULT_MAX_DEPTH: usize = 20;

// ---------------------------------------------------------------------------
// Revision flags
// ---------------------------------------------------------------------------

/// Per-revision flag bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RevFlags(pub u8);

impl RevFlags {
    pub const NONE: RevFlags = RevFlags(0);
    /// Deletion/tombstone revision.
    pub const DELETED: RevFlags = RevFlags(0x01);
    /// No children.
    pub const LEAF: RevFlags = RevFlags(0x02);
    /// Inserted since the tree was decoded; not yet saved.
    pub const NEW: RevFlags = RevFlags(0x04);
    pub const HAS_ATTACHMENTS: RevFlags = RevFlags(0x08);
    /// Body survives even after this rev stops being a leaf.
    pub const KEEP_BODY: RevFlags = RevFlags(0x10);
    /// Unresolved conflicting revision; never selected as current.
    pub const CONFLICT: RevFlags = RevFlags(0x20);
    /// End of a closed conflicting branch.
    pub const CLOSED: RevFlags = RevFlags(0x40);
    /// Transient mark used by prune/purge passes.
    const PURGE: RevFlags = RevFlags(0x80);

    pub fn contains(self, other: RevFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn union(self, other: RevFlags) -> RevFlags {
        RevFlags(self.0 | other.0)
    }

    pub fn difference(self, other: RevFlags) -> RevFlags {
        RevFlags(self.0 & !other.0)
    }
}

// ---------------------------------------------------------------------------
// Rev
// ---------------------------------------------------------------------------

/// One node of a revision tree. Parents are arena indices into the owning
/// tree, which keeps the graph a forest and makes pruning a compaction pass.
#[derive(Debug, Clone)]
pub struct Rev {
    pub rev_id: RevId,
    parent: Option<u32>,
    pub sequence: u64,
    pub body: Option<Value>,
    flags: RevFlags,
}

impl Rev {
    pub fn flags(&self) -> RevFlags {
        self.flags
    }

    pub fn parent_index(&self) -> Option<u32> {
        self.parent
    }

    pub fn is_leaf(&self) -> bool {
        self.flags.contains(RevFlags::LEAF)
    }

    pub fn is_deleted(&self) -> bool {
        self.flags.contains(RevFlags::DELETED)
    }

    pub fn is_conflict(&self) -> bool {
        self.flags.contains(RevFlags::CONFLICT)
    }

    pub fn is_closed(&self) -> bool {
        self.flags.contains(RevFlags::CLOSED)
    }

    pub fn is_new(&self) -> bool {
        self.flags.contains(RevFlags::NEW)
    }

    pub fn keeps_body(&self) -> bool {
        self.flags.contains(RevFlags::KEEP_BODY)
    }

    /// A live leaf: present, not deleted, not the end of a closed branch.
    pub fn is_active(&self) -> bool {
        self.is_leaf() && !self.is_deleted() && !self.is_closed()
    }

    fn generation(&self) -> u32 {
        self.rev_id.generation().unwrap_or(0)
    }

    /// Liveness rank for the current-revision sort: live > deleted > closed.
    fn liveness(&self) -> u8 {
        if self.is_closed() {
            0
        } else if self.is_deleted() {
            1
        } else {
            2
        }
    }
}

/// Descending priority used to pick the current revision.
fn priority_cmp(a: &Rev, b: &Rev) -> Ordering {
    (a.is_leaf().cmp(&b.is_leaf()))
        .then_with(|| (!a.is_conflict()).cmp(&!b.is_conflict()))
        .then_with(|| a.liveness().cmp(&b.liveness()))
        .then_with(|| a.rev_id.compare(&b.rev_id).unwrap_or(Ordering::Equal))
}

// ---------------------------------------------------------------------------
// Insertion results
// ---------------------------------------------------------------------------

/// Outcome of inserting a revision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertResult {
    /// The revision already existed; nothing changed.
    Existing,
    Inserted,
    /// Rejected: would create a conflict and conflicts weren't allowed.
    Conflict,
    /// Rejected: parent missing or history malformed.
    BadHistory,
}

impl InsertResult {
    /// HTTP-style status code for the outcome.
    pub fn status(self) -> u16 {
        match self {
            InsertResult::Existing => 200,
            InsertResult::Inserted => 201,
            InsertResult::Conflict => 409,
            InsertResult::BadHistory => 400,
        }
    }

    pub fn is_rejection(self) -> bool {
        matches!(self, InsertResult::Conflict | InsertResult::BadHistory)
    }
}

// ---------------------------------------------------------------------------
// RevTree
// ---------------------------------------------------------------------------

/// The revision history of one tree-versioned document: a forest of digest
/// revisions with per-remote cursors and prune/purge policies.
#[derive(Debug, Clone, Default)]
pub struct RevTree {
    revs: Vec<Rev>,
    remotes: HashMap<RemoteId, u32>,
    rejected: Vec<u32>,
    prune_depth: usize,
    changed: bool,
}

impl RevTree {
    pub fn new() -> Self {
        RevTree {
            prune_depth: DEFAULT_MAX_DEPTH,
            ..Default::default()
        }
    }

    pub fn len(&self) -> usize {
        self.revs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.revs.is_empty()
    }

    pub fn revs(&self) -> &[Rev] {
        &self.revs
    }

    pub fn changed(&self) -> bool {
        self.changed
    }

    pub fn set_prune_depth(&mut self, depth: usize) {
        self.prune_depth = depth.max(1);
    }

    pub fn prune_depth(&self) -> usize {
        self.prune_depth
    }

    fn index_of(&self, rev_id: &RevId) -> Option<u32> {
        self.revs
            .iter()
            .position(|r| &r.rev_id == rev_id)
            .map(|i| i as u32)
    }

    pub fn get(&self, rev_id: &RevId) -> Option<&Rev> {
        self.index_of(rev_id).map(|i| &self.revs[i as usize])
    }

    pub fn get_by_sequence(&self, sequence: u64) -> Option<&Rev> {
        self.revs.iter().find(|r| r.sequence == sequence)
    }

    /// The current revision, chosen by the deterministic priority sort:
    /// leaf, then non-conflict, then live > deleted > closed, then the
    /// larger revision ID.
    pub fn current(&self) -> Option<&Rev> {
        self.revs.iter().max_by(|a, b| priority_cmp(a, b))
    }

    pub fn leaves(&self) -> impl Iterator<Item = &Rev> {
        self.revs.iter().filter(|r| r.is_leaf())
    }

    /// True while more than one live leaf exists.
    pub fn has_conflict(&self) -> bool {
        self.leaves().filter(|r| r.is_active()).count() > 1
            || self.leaves().any(|r| r.is_conflict() && !r.is_closed())
    }

    pub fn has_new_revisions(&self) -> bool {
        self.revs.iter().any(Rev::is_new)
    }

    /// The ancestor chain of a revision, starting at the revision itself.
    pub fn history(&self, rev_id: &RevId) -> Vec<&Rev> {
        let mut out = Vec::new();
        let mut next = self.index_of(rev_id);
        while let Some(i) = next {
            let rev = &self.revs[i as usize];
            out.push(rev);
            next = rev.parent;
        }
        out
    }

    pub fn is_ancestor(&self, ancestor: &RevId, descendant: &RevId) -> bool {
        let Some(target) = self.index_of(ancestor) else {
            return false;
        };
        let mut next = self.index_of(descendant).and_then(|i| self.revs[i as usize].parent);
        while let Some(i) = next {
            if i == target {
                return true;
            }
            next = self.revs[i as usize].parent;
        }
        false
    }

    fn depth_of(&self, index: u32) -> usize {
        let mut depth = 0;
        let mut next = self.revs[index as usize].parent;
        while let Some(i) = next {
            depth += 1;
            next = self.revs[i as usize].parent;
        }
        depth
    }

    // ---- Insertion --------------------------------------------------------

    /// Adds a leaf revision under `parent`. `parent` of `None` means a root
    /// insert, which in a non-empty tree is a new branch.
    pub fn insert(
        &mut self,
        rev_id: RevId,
        body: Option<Value>,
        flags: RevFlags,
        parent: Option<&RevId>,
        allow_conflict: bool,
    ) -> InsertResult {
        if rev_id.is_version() {
            return InsertResult::BadHistory;
        }
        if self.get(&rev_id).is_some() {
            return InsertResult::Existing;
        }
        let parent_idx = match parent {
            Some(pid) => match self.index_of(pid) {
                Some(i) => Some(i),
                None => return InsertResult::BadHistory,
            },
            None => None,
        };
        let generation = rev_id.generation().unwrap_or(0);
        match parent_idx {
            Some(p) => {
                let parent_gen = self.revs[p as usize].generation();
                if generation <= parent_gen {
                    return InsertResult::BadHistory;
                }
                if generation != parent_gen + 1 {
                    // Generation gaps are only tolerated past the prune
                    // horizon, where histories may have been compacted.
                    if self.depth_of(p) + 1 < self.prune_depth {
                        return InsertResult::BadHistory;
                    }
                    debug!(
                        rev = %rev_id,
                        parent = %self.revs[p as usize].rev_id,
                        "tolerating generation gap past prune depth"
                    );
                }
            }
            None => {
                if generation != 1 && self.is_empty() {
                    // A lone rev with generation > 1 is a compacted history;
                    // accept it as its own root.
                    debug!(rev = %rev_id, "inserting compacted root");
                }
            }
        }

        let branching = match parent_idx {
            Some(p) => !self.revs[p as usize].is_leaf(),
            None => !self.is_empty(),
        };
        if branching && !allow_conflict {
            return InsertResult::Conflict;
        }

        // A branch only counts as a conflict while another live leaf exists;
        // branching off a tombstone is a resurrection.
        let conflicting = branching && self.leaves().any(Rev::is_active);
        self.insert_unchecked(rev_id, body, flags, parent_idx, conflicting);
        InsertResult::Inserted
    }

    fn insert_unchecked(
        &mut self,
        rev_id: RevId,
        body: Option<Value>,
        flags: RevFlags,
        parent: Option<u32>,
        mark_conflict: bool,
    ) -> u32 {
        let mut flags = flags.union(RevFlags::LEAF).union(RevFlags::NEW);
        if mark_conflict {
            flags = flags.union(RevFlags::CONFLICT);
        }
        if let Some(p) = parent {
            self.revs[p as usize].flags = self.revs[p as usize].flags.difference(RevFlags::LEAF);
        }
        self.revs.push(Rev {
            rev_id,
            parent,
            sequence: 0,
            body,
            flags,
        });
        self.changed = true;
        (self.revs.len() - 1) as u32
    }

    /// Validates that `history` descends by generation, tolerating gaps only
    /// past the prune horizon.
    fn validate_history(&self, history: &[RevId]) -> bool {
        if history.is_empty() {
            return false;
        }
        let mut prev_gen: Option<u32> = None;
        for (i, rev) in history.iter().enumerate() {
            let Some(generation) = rev.generation() else {
                return false;
            };
            if generation == 0 {
                return false;
            }
            if let Some(prev) = prev_gen {
                if generation >= prev {
                    return false;
                }
                if prev != generation + 1 && i < self.prune_depth {
                    return false;
                }
                if prev != generation + 1 {
                    debug!(rev = %rev, "history has generation gap past prune depth");
                }
            }
            prev_gen = Some(generation);
        }
        true
    }

    /// Inserts a revision along with its ancestry. `history[0]` is the new
    /// leaf; each following entry is the parent of the one before it.
    /// Returns the index in `history` of the common ancestor.
    pub fn insert_history(
        &mut self,
        history: &[RevId],
        body: Option<Value>,
        flags: RevFlags,
        allow_conflict: bool,
    ) -> Result<usize> {
        if !self.validate_history(history) {
            return Err(Error::BadHistory("invalid revision history".into()));
        }
        if self.get(&history[0]).is_some() {
            return Ok(0);
        }

        // Walk down the history until a rev already in the tree is found.
        let common = history
            .iter()
            .enumerate()
            .skip(1)
            .find_map(|(i, rev)| self.index_of(rev).map(|idx| (i, idx)));

        let (ancestor_pos, mut parent_idx, branching) = match common {
            Some((i, idx)) => {
                let branching = !self.revs[idx as usize].is_leaf();
                (i, Some(idx), branching)
            }
            None => (history.len(), None, !self.is_empty()),
        };
        if branching && !allow_conflict {
            return Err(Error::Conflict);
        }
        // The whole new branch carries the conflict flag, decided before any
        // of it lands.
        let conflicting = branching && self.leaves().any(Rev::is_active);

        // Insert missing intermediates bodiless, oldest first; the new leaf
        // gets the body.
        for i in (0..ancestor_pos).rev() {
            let is_leaf = i == 0;
            let (rev_body, rev_flags) = if is_leaf {
                (body.clone(), flags)
            } else {
                (None, RevFlags::NONE)
            };
            let idx =
                self.insert_unchecked(history[i].clone(), rev_body, rev_flags, parent_idx, conflicting);
            // Intermediates stop being leaves as soon as their child lands;
            // insert_unchecked clears the flag.
            parent_idx = Some(idx);
        }
        Ok(ancestor_pos)
    }

    // ---- Conflict handling ------------------------------------------------

    /// Clears the conflict flag along a branch, from `rev_id` to the root.
    pub fn mark_branch_not_conflict(&mut self, rev_id: &RevId) {
        let mut next = self.index_of(rev_id);
        while let Some(i) = next {
            let rev = &mut self.revs[i as usize];
            if rev.is_conflict() {
                rev.flags = rev.flags.difference(RevFlags::CONFLICT);
                self.changed = true;
            }
            next = rev.parent;
        }
    }

    /// Closes a losing conflict branch: its leaf stops competing for the
    /// current revision and its body becomes prunable.
    pub fn close_branch(&mut self, rev_id: &RevId) -> Result<()> {
        let idx = self
            .index_of(rev_id)
            .ok_or_else(|| Error::NotFound(format!("revision {rev_id}")))?;
        let rev = &mut self.revs[idx as usize];
        if !rev.is_leaf() {
            return Err(Error::Conflict);
        }
        rev.flags = rev
            .flags
            .union(RevFlags::CLOSED)
            .difference(RevFlags::CONFLICT)
            .difference(RevFlags::KEEP_BODY);
        rev.body = None;
        self.changed = true;
        Ok(())
    }

    // ---- Bodies -----------------------------------------------------------

    pub fn keep_body(&mut self, rev_id: &RevId) -> Result<()> {
        let idx = self
            .index_of(rev_id)
            .ok_or_else(|| Error::NotFound(format!("revision {rev_id}")))?;
        self.revs[idx as usize].flags = self.revs[idx as usize].flags.union(RevFlags::KEEP_BODY);
        self.changed = true;
        Ok(())
    }

    /// Drops bodies of non-leaf revisions, except pinned ones.
    pub fn remove_non_leaf_bodies(&mut self) {
        for rev in &mut self.revs {
            if !rev.is_leaf() && !rev.keeps_body() && rev.body.is_some() {
                rev.body = None;
                rev.flags = rev.flags.difference(RevFlags::HAS_ATTACHMENTS);
                self.changed = true;
            }
        }
    }

    // ---- Remotes & rejections ---------------------------------------------

    pub fn remote_rev(&self, remote: RemoteId) -> Option<&Rev> {
        self.remotes.get(&remote).map(|&i| &self.revs[i as usize])
    }

    pub fn set_remote_rev(&mut self, remote: RemoteId, rev_id: Option<&RevId>) -> Result<()> {
        match rev_id {
            Some(id) => {
                let idx = self
                    .index_of(id)
                    .ok_or_else(|| Error::NotFound(format!("revision {id}")))?;
                self.remotes.insert(remote, idx);
            }
            None => {
                self.remotes.remove(&remote);
            }
        }
        self.changed = true;
        Ok(())
    }

    pub fn remote_revs(&self) -> impl Iterator<Item = (RemoteId, &Rev)> {
        self.remotes.iter().map(|(&r, &i)| (r, &self.revs[i as usize]))
    }

    fn is_remote_target(&self, index: u32) -> bool {
        self.remotes.values().any(|&i| i == index)
    }

    /// Records that the remote refused this revision on push; the pusher
    /// consults this set to avoid retrying.
    pub fn mark_rejected(&mut self, rev_id: &RevId) -> Result<()> {
        let idx = self
            .index_of(rev_id)
            .ok_or_else(|| Error::NotFound(format!("revision {rev_id}")))?;
        if !self.rejected.contains(&idx) {
            self.rejected.push(idx);
            self.changed = true;
        }
        Ok(())
    }

    pub fn rejected_revs(&self) -> Vec<&RevId> {
        self.rejected
            .iter()
            .map(|&i| &self.revs[i as usize].rev_id)
            .collect()
    }

    pub fn is_rejected(&self, rev_id: &RevId) -> bool {
        self.index_of(rev_id)
            .map(|i| self.rejected.contains(&i))
            .unwrap_or(false)
    }

    // ---- Prune & purge ----------------------------------------------------

    /// Limits every branch to `max_depth` revisions. Remote-cursor targets
    /// and `KEEP_BODY` revs are exempt; parent links that pointed at a
    /// pruned rev are rewired to the nearest surviving ancestor. Returns the
    /// number of revisions removed.
    pub fn prune(&mut self, max_depth: usize) -> usize {
        if self.revs.is_empty() || max_depth == 0 {
            return 0;
        }
        // Distance from the nearest descendant leaf, per rev.
        let mut dist = vec![usize::MAX; self.revs.len()];
        for (i, rev) in self.revs.iter().enumerate() {
            if !rev.is_leaf() {
                continue;
            }
            let mut d = 0;
            let mut next = Some(i as u32);
            while let Some(idx) = next {
                let slot = &mut dist[idx as usize];
                if *slot <= d {
                    break;
                }
                *slot = d;
                d += 1;
                next = self.revs[idx as usize].parent;
            }
        }
        for (i, rev) in self.revs.iter_mut().enumerate() {
            let pinned = rev.keeps_body();
            if dist[i] >= max_depth && !pinned {
                rev.flags = rev.flags.union(RevFlags::PURGE);
            }
        }
        // Remote cursors pin their targets.
        for &idx in self.remotes.values() {
            let rev = &mut self.revs[idx as usize];
            rev.flags = rev.flags.difference(RevFlags::PURGE);
        }
        self.compact()
    }

    pub fn prune_to_default(&mut self) -> usize {
        self.prune(self.prune_depth)
    }

    /// Removes a leaf revision and any ancestors not shared with other
    /// leaves or pinned by a remote cursor. Returns the number removed.
    pub fn purge(&mut self, rev_id: &RevId) -> usize {
        let Some(leaf) = self.index_of(rev_id) else {
            return 0;
        };
        if !self.revs[leaf as usize].is_leaf() {
            return 0;
        }
        let mut next = Some(leaf);
        while let Some(idx) = next {
            if self.is_remote_target(idx) && idx != leaf {
                break;
            }
            let has_other_children = self.revs.iter().enumerate().any(|(i, r)| {
                r.parent == Some(idx)
                    && !self.revs[i].flags.contains(RevFlags::PURGE)
            });
            if has_other_children {
                // Shared ancestor: it becomes a leaf only if nothing else
                // hangs off it, which `compact` recomputes.
                break;
            }
            let rev = &mut self.revs[idx as usize];
            rev.flags = rev.flags.union(RevFlags::PURGE);
            next = rev.parent;
        }
        self.compact()
    }

    /// Removes every revision. Returns the number removed.
    pub fn purge_all(&mut self) -> usize {
        let n = self.revs.len();
        self.revs.clear();
        self.remotes.clear();
        self.rejected.clear();
        if n > 0 {
            self.changed = true;
        }
        n
    }

    /// Drops PURGE-marked revs, remapping indices and rewiring parents to
    /// the nearest surviving ancestor.
    fn compact(&mut self) -> usize {
        let purged: Vec<bool> = self
            .revs
            .iter()
            .map(|r| r.flags.contains(RevFlags::PURGE))
            .collect();
        let count = purged.iter().filter(|&&p| p).count();
        if count == 0 {
            return 0;
        }
        // Surviving parent of each rev, skipping purged ancestors.
        let surviving_parent = |mut parent: Option<u32>| {
            while let Some(p) = parent {
                if !purged[p as usize] {
                    return Some(p);
                }
                parent = self.revs[p as usize].parent;
            }
            None
        };
        let mut remap = vec![None; self.revs.len()];
        let mut kept = 0u32;
        for (i, &gone) in purged.iter().enumerate() {
            if !gone {
                remap[i] = Some(kept);
                kept += 1;
            }
        }
        let mut new_revs = Vec::with_capacity(kept as usize);
        for (i, rev) in self.revs.iter().enumerate() {
            if purged[i] {
                continue;
            }
            let mut rev = rev.clone();
            rev.parent = surviving_parent(rev.parent).map(|p| remap[p as usize].unwrap());
            new_revs.push(rev);
        }
        self.remotes = self
            .remotes
            .iter()
            .filter_map(|(&r, &i)| remap[i as usize].map(|n| (r, n)))
            .collect();
        self.rejected = self
            .rejected
            .iter()
            .filter_map(|&i| remap[i as usize])
            .collect();
        self.revs = new_revs;
        // Recompute leaf flags: purging a subtree can expose its root.
        let has_child: Vec<bool> = (0..self.revs.len())
            .map(|i| self.revs.iter().any(|r| r.parent == Some(i as u32)))
            .collect();
        for (i, rev) in self.revs.iter_mut().enumerate() {
            if has_child[i] {
                rev.flags = rev.flags.difference(RevFlags::LEAF);
            } else {
                rev.flags = rev.flags.union(RevFlags::LEAF);
            }
        }
        self.changed = true;
        count
    }

    // ---- Persistence ------------------------------------------------------

    /// Assigns the newly allocated sequence to freshly inserted revs.
    pub fn saved(&mut self, new_sequence: u64) {
        for rev in &mut self.revs {
            if rev.is_new() {
                rev.sequence = new_sequence;
                rev.flags = rev.flags.difference(RevFlags::NEW);
            }
        }
        self.changed = false;
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut remotes: Vec<(RemoteId, u32)> =
            self.remotes.iter().map(|(&r, &i)| (r, i)).collect();
        remotes.sort_unstable();
        let raw = RawTree {
            revs: self
                .revs
                .iter()
                .map(|r| RawRev {
                    id: r.rev_id.clone(),
                    parent: r.parent,
                    seq: r.sequence,
                    flags: r.flags.difference(RevFlags::NEW).difference(RevFlags::PURGE),
                    body: r.body.clone(),
                })
                .collect(),
            remotes,
            rejected: self.rejected.clone(),
        };
        Ok(serde_json::to_vec(&raw)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let raw: RawTree = serde_json::from_slice(bytes)
            .map_err(|e| Error::CorruptRevisionData(format!("bad revision tree: {e}")))?;
        let len = raw.revs.len();
        let valid_idx = |i: u32| (i as usize) < len;
        let mut tree = RevTree::new();
        for r in &raw.revs {
            if r.id.is_version() || r.parent.map(|p| !valid_idx(p)).unwrap_or(false) {
                return Err(Error::CorruptRevisionData("bad revision tree node".into()));
            }
        }
        tree.revs = raw
            .revs
            .into_iter()
            .map(|r| Rev {
                rev_id: r.id,
                parent: r.parent,
                sequence: r.seq,
                body: r.body,
                flags: r.flags,
            })
            .collect();
        for (remote, idx) in raw.remotes {
            if !valid_idx(idx) {
                return Err(Error::CorruptRevisionData("bad remote cursor".into()));
            }
            tree.remotes.insert(remote, idx);
        }
        for idx in raw.rejected {
            if !valid_idx(idx) {
                return Err(Error::CorruptRevisionData("bad rejected rev".into()));
            }
            tree.rejected.push(idx);
        }
        Ok(tree)
    }
}

/// Quick classification of an extras/body blob as a serialized revision
/// tree, used to detect legacy records that stored the tree in the body.
pub fn is_rev_tree(bytes: &[u8]) -> bool {
    RevTree::decode(bytes).is_ok()
}

#[derive(Serialize, Deserialize)]
struct RawTree {
    revs: Vec<RawRev>,
    remotes: Vec<(RemoteId, u32)>,
    rejected: Vec<u32>,
}

#[derive(Serialize, Deserialize)]
struct RawRev {
    id: RevId,
    #[serde(skip_serializing_if = "Option::is_none")]
    parent: Option<u32>,
    seq: u64,
    flags: RevFlags,
    #[serde(skip_serializing_if = "Option::is_none")]
    body: Option<Value>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
