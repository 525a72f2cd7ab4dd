use std::collections::HashSet;

use serde_json::Value;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use skiffdb_core::document::DocumentRecord;
use skiffdb_core::error::{Error, Result};
use skiffdb_core::record::{ContentLevel, DocumentFlags, Record};
use skiffdb_core::rev_tree::DEFAULT_REMOTE;
use skiffdb_core::legacy::VersionVectorWithLegacy;
use skiffdb_core::revid::RevId;
use skiffdb_net::blip::{Message, profile};

use crate::delta::delta_if_smaller;
use crate::encryption::encrypt_properties;
use crate::events::{ActivityLevel, DocEndKind, Direction, ReplicatedDoc, WireError};
use crate::worker::{ChangeVerdict, ChangesEntry, ProposeEntry, WorkerContext, WorkerEvent};

const CHANGES_BATCH: usize = 200;
const MAX_REVS_IN_FLIGHT: usize = 8;

/// How one push run is parameterized; active pushes come from the local
/// options, passive ones from the peer's `subChanges`.
#[derive(Debug, Clone)]
pub(crate) struct PushParams {
    pub since: u64,
    pub continuous: bool,
    /// Use `proposeChanges` (active clients) instead of `changes`.
    pub proposing: bool,
    /// Active pushes drive the checkpointer; subChanges-driven ones don't.
    pub active: bool,
    pub doc_ids: Option<HashSet<String>>,
    pub skip_deleted: bool,
}

/// One queued outbound revision.
struct PendingRev {
    sequence: u64,
    remote_sequence: Value,
    doc_id: String,
    rev_id: String,
    body: Option<Value>,
    history: String,
    deleted: bool,
    /// Bodies of ancestors we still hold, keyed by wire revID, for delta
    /// encoding.
    ancestor_bodies: Vec<(String, Value)>,
    /// What the peer is known to have, named in proposals.
    remote_ancestor: Option<String>,
    is_tree: bool,
}

/// The push half of the replicator: enumerates local changes, negotiates
/// which revisions the peer wants, and streams `rev` messages with
/// backpressure. One pusher serves one collection on one connection.
pub(crate) struct Pusher {
    ctx: WorkerContext,
    params: PushParams,
}

impl Pusher {
    pub fn new(ctx: WorkerContext, params: PushParams) -> Self {
        Pusher { ctx, params }
    }

    pub async fn run(self) {
        if let Err(err) = self.run_inner().await {
            if !self.ctx.cancel.is_cancelled() {
                warn!(error = %err, "pusher failed");
                self.ctx.send_event(WorkerEvent::Failed(err));
            }
        }
    }

    async fn run_inner(&self) -> Result<()> {
        let keyspace = self.ctx.keyspace();
        let mut since = self.params.since;
        let mut changes = self.ctx.store.subscribe_changes();
        let mut announced_caught_up = false;

        loop {
            if self.ctx.cancel.is_cancelled() {
                return Ok(());
            }
            let records = self.ctx.store.enumerate(&keyspace, since, CHANGES_BATCH).await?;
            if records.is_empty() {
                if !announced_caught_up {
                    announced_caught_up = true;
                    // An empty changes message tells the peer we're caught
                    // up; one-shot subscribers use it to finish.
                    if !self.params.active {
                        let msg = Message::new(profile::CHANGES)
                            .with_property("collection", self.ctx.collection_index)
                            .with_json_body(&Value::Array(Vec::new()))?;
                        let _ = self.ctx.transport.send(msg).await;
                    }
                    self.ctx.set_level(Direction::Push, ActivityLevel::Idle);
                    if self.params.active {
                        self.ctx.send_event(WorkerEvent::CaughtUp(Direction::Push));
                    }
                }
                if !self.params.continuous {
                    return Ok(());
                }
                tokio::select! {
                    n = changes.recv() => {
                        if n.is_none() {
                            return Ok(());
                        }
                    }
                    _ = self.ctx.cancel.cancelled() => return Ok(()),
                }
                continue;
            }

            announced_caught_up = false;
            self.ctx.set_level(Direction::Push, ActivityLevel::Busy);
            since = records.last().expect("non-empty batch").sequence;
            let batch = self.collect_batch(records).await?;
            if !batch.is_empty() {
                self.push_batch(batch).await?;
            }
        }
    }

    /// Turns enumerated records into outbound rev candidates, applying
    /// filters. Skipped sequences still advance the checkpoint floor.
    async fn collect_batch(&self, records: Vec<Record>) -> Result<Vec<PendingRev>> {
        let mut out = Vec::new();
        for record in records {
            let sequence = record.sequence;
            match self.prepare_rev(&record) {
                Ok(Some(rev)) => out.push(rev),
                Ok(None) => {
                    if self.params.active {
                        self.ctx.checkpointer.note_sequence(sequence);
                    }
                }
                Err(err) => {
                    warn!(doc = record.doc_id, error = %err, "skipping unreadable document");
                    if self.params.active {
                        self.ctx.checkpointer.note_sequence(sequence);
                    }
                    self.ctx.doc_ended(ReplicatedDoc {
                        collection: self.ctx.collection.clone(),
                        direction: Direction::Push,
                        doc_id: record.doc_id.clone(),
                        rev_id: String::new(),
                        flags: record.flags,
                        sequence,
                        kind: DocEndKind::Error,
                        error: Some(WireError::from_error(&err)),
                        transient: false,
                    });
                }
            }
        }
        Ok(out)
    }

    fn prepare_rev(&self, record: &Record) -> Result<Option<PendingRev>> {
        if let Some(ids) = &self.params.doc_ids
            && !ids.contains(&record.doc_id)
        {
            return Ok(None);
        }
        let deleted = record.flags.contains(DocumentFlags::DELETED);
        if deleted && self.params.skip_deleted {
            return Ok(None);
        }
        let doc = DocumentRecord::load(record)?;
        let Some(current) = doc.current_revision() else {
            return Ok(None);
        };
        let rev_id_str = self.format_rev_id(&doc, &current.rev_id);
        let body = current.body.clone().unwrap_or(Value::Object(Default::default()));

        if let Some(filter) = &self.ctx.options.push_filter
            && !filter(
                &self.ctx.collection,
                &record.doc_id,
                &rev_id_str,
                record.flags,
                &body,
            )
        {
            return Ok(None);
        }
        // Never re-push what the peer already refused.
        if doc
            .rev_tree()
            .is_some_and(|tree| tree.is_rejected(&current.rev_id))
        {
            return Ok(None);
        }

        let (history, ancestor_bodies, remote_ancestor, is_tree) = match doc.rev_tree() {
            Some(tree) => {
                let history = tree
                    .history(&current.rev_id)
                    .iter()
                    .skip(1)
                    .take(self.ctx.options.prune_depth)
                    .map(|r| r.rev_id.to_string())
                    .collect::<Vec<_>>()
                    .join(",");
                let ancestors = tree
                    .revs()
                    .iter()
                    .filter(|r| r.rev_id != current.rev_id)
                    .filter_map(|r| r.body.clone().map(|b| (r.rev_id.to_string(), b)))
                    .collect();
                let remote_ancestor = tree
                    .remote_rev(DEFAULT_REMOTE)
                    .map(|r| r.rev_id.to_string());
                (history, ancestors, remote_ancestor, true)
            }
            None => {
                let vv = VersionVectorWithLegacy::new(
                    doc.current_vector().cloned().unwrap_or_default(),
                    doc.legacy_rev_id().cloned().into_iter().collect(),
                );
                let history = vv.to_history_ascii(&self.ctx.source_id);
                let remote_ancestor = doc
                    .remote_revision(DEFAULT_REMOTE)
                    .map(|r| self.format_remote_rev_id(&doc, DEFAULT_REMOTE, &r.rev_id));
                let ancestors = doc
                    .remote_revision(DEFAULT_REMOTE)
                    .and_then(|r| {
                        r.body
                            .map(|b| (self.format_remote_rev_id(&doc, DEFAULT_REMOTE, &r.rev_id), b))
                    })
                    .into_iter()
                    .collect();
                (history, ancestors, remote_ancestor, false)
            }
        };

        Ok(Some(PendingRev {
            sequence: record.sequence,
            remote_sequence: Value::from(record.sequence),
            doc_id: record.doc_id.clone(),
            rev_id: rev_id_str,
            body: Some(body),
            history,
            deleted,
            ancestor_bodies,
            remote_ancestor,
            is_tree,
        }))
    }

    /// Version-form revIDs go absolute on the wire; digest forms verbatim.
    fn format_rev_id(&self, doc: &DocumentRecord, rev_id: &RevId) -> String {
        match doc.current_vector() {
            Some(vector) => {
                let mut v = vector.clone();
                v.make_absolute(&self.ctx.source_id);
                v.current()
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| rev_id.to_string())
            }
            None => rev_id.to_string(),
        }
    }

    fn format_remote_rev_id(
        &self,
        doc: &DocumentRecord,
        remote: u32,
        rev_id: &RevId,
    ) -> String {
        match doc.remote_vector(remote) {
            Some(vector) => {
                let mut v = vector.clone();
                v.make_absolute(&self.ctx.source_id);
                v.current()
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| rev_id.to_string())
            }
            None => rev_id.to_string(),
        }
    }

    async fn push_batch(&self, batch: Vec<PendingRev>) -> Result<()> {
        if self.params.active {
            for rev in &batch {
                self.ctx.checkpointer.add_pending_sequence(rev.sequence);
            }
        }
        self.ctx.send_event(WorkerEvent::Progress {
            completed: 0,
            total: batch.len() as u64,
            docs: 0,
        });

        let entries: Vec<Value> = if self.params.proposing {
            batch
                .iter()
                .map(|r| {
                    ProposeEntry {
                        doc_id: r.doc_id.clone(),
                        rev_id: r.rev_id.clone(),
                        remote_ancestor: r.remote_ancestor.clone(),
                        body_size: r
                            .body
                            .as_ref()
                            .and_then(|b| serde_json::to_vec(b).ok())
                            .map(|b| b.len() as u64)
                            .unwrap_or(0),
                    }
                    .to_json()
                })
                .collect()
        } else {
            batch
                .iter()
                .map(|r| {
                    ChangesEntry {
                        sequence: r.remote_sequence.clone(),
                        doc_id: r.doc_id.clone(),
                        rev_id: r.rev_id.clone(),
                        deleted: r.deleted,
                        body_size: r
                            .body
                            .as_ref()
                            .and_then(|b| serde_json::to_vec(b).ok())
                            .map(|b| b.len() as u64)
                            .unwrap_or(0),
                    }
                    .to_json()
                })
                .collect()
        };

        let profile_name = if self.params.proposing {
            profile::PROPOSE_CHANGES
        } else {
            profile::CHANGES
        };
        let message = Message::new(profile_name)
            .with_property("collection", self.ctx.collection_index)
            .with_json_body(&Value::Array(entries))?;
        let response = self.ctx.transport.send(message).await?.into_result()?;
        let verdicts: Vec<ChangeVerdict> = response
            .json_body::<Vec<Value>>()
            .map(|items| items.iter().map(ChangeVerdict::from_json).collect())
            .unwrap_or_else(|_| batch.iter().map(|_| ChangeVerdict::Wanted).collect());

        let mut sends: JoinSet<()> = JoinSet::new();
        for (rev, verdict) in batch.into_iter().zip(
            verdicts
                .into_iter()
                .chain(std::iter::repeat(ChangeVerdict::Wanted)),
        ) {
            match verdict {
                ChangeVerdict::NotWanted => {
                    if self.params.active {
                        self.ctx.checkpointer.complete_sequence(rev.sequence);
                    }
                    self.ctx.send_event(WorkerEvent::Progress {
                        completed: 1,
                        total: 0,
                        docs: 0,
                    });
                }
                ChangeVerdict::Refused(status) => {
                    self.handle_refusal(&rev, status).await?;
                }
                ChangeVerdict::Wanted => {
                    self.spawn_rev_send(&mut sends, rev, None).await;
                }
                ChangeVerdict::DeltaFrom(ancestor) => {
                    self.spawn_rev_send(&mut sends, rev, Some(ancestor)).await;
                }
            }
        }
        // Drain before the next enumeration round: per-doc rev ordering
        // across batches falls out of this barrier.
        while sends.join_next().await.is_some() {}
        Ok(())
    }

    /// The peer refused a proposal (usually 409): remember the rejection so
    /// the rev isn't retried until it changes.
    async fn handle_refusal(&self, rev: &PendingRev, status: u16) -> Result<()> {
        debug!(doc = rev.doc_id, rev = rev.rev_id, status, "push refused");
        if rev.is_tree {
            let keyspace = self.ctx.keyspace();
            if let Some(record) = self
                .ctx
                .store
                .get(&keyspace, &rev.doc_id, ContentLevel::EntireBody)
                .await?
            {
                let mut doc = DocumentRecord::load(&record)?;
                if let Ok(parsed) = rev.rev_id.parse::<RevId>()
                    && let Some(tree) = doc.rev_tree_mut()
                    && tree.mark_rejected(&parsed).is_ok()
                {
                    let _ = doc.save(self.ctx.store.as_ref(), &keyspace).await?;
                }
            }
        }
        if self.params.active {
            self.ctx.checkpointer.complete_sequence(rev.sequence);
        }
        self.ctx.doc_ended(ReplicatedDoc {
            collection: self.ctx.collection.clone(),
            direction: Direction::Push,
            doc_id: rev.doc_id.clone(),
            rev_id: rev.rev_id.clone(),
            flags: DocumentFlags::NONE,
            sequence: rev.sequence,
            kind: DocEndKind::Error,
            error: Some(WireError {
                domain: "HTTP".into(),
                code: i32::from(status),
                message: "rejected by peer".into(),
            }),
            transient: false,
        });
        Ok(())
    }

    async fn spawn_rev_send(
        &self,
        sends: &mut JoinSet<()>,
        rev: PendingRev,
        delta_ancestor: Option<String>,
    ) {
        while sends.len() >= MAX_REVS_IN_FLIGHT {
            sends.join_next().await;
        }
        let ctx = self.ctx.clone();
        let active = self.params.active;
        sends.spawn(async move {
            send_one_rev(ctx, rev, delta_ancestor, active).await;
        });
    }
}

/// Builds and sends one `rev` message, processing the ack.
async fn send_one_rev(
    ctx: WorkerContext,
    rev: PendingRev,
    delta_ancestor: Option<String>,
    active: bool,
) {
    match try_send_rev(&ctx, &rev, delta_ancestor, active).await {
        Ok(()) => {}
        Err(err) => {
            let transient = err.is_transient();
            // Tell the peer not to wait for this revision.
            let (domain, code, _) = err.to_wire();
            let norev = Message::new(profile::NOREV)
                .with_property("collection", ctx.collection_index)
                .with_property("id", &rev.doc_id)
                .with_property("rev", &rev.rev_id)
                .with_property("sequence", rev.sequence)
                .with_property("error", format!("{domain}/{code}"))
                .with_no_reply();
            let _ = ctx.transport.send(norev).await;
            // Transient failures stay pending and retry on the next
            // connection; fatal ones are per-document.
            if !transient && active {
                ctx.checkpointer.complete_sequence(rev.sequence);
            }
            ctx.doc_ended(ReplicatedDoc {
                collection: ctx.collection.clone(),
                direction: Direction::Push,
                doc_id: rev.doc_id.clone(),
                rev_id: rev.rev_id.clone(),
                flags: DocumentFlags::NONE,
                sequence: rev.sequence,
                kind: DocEndKind::Error,
                error: Some(WireError::from_error(&err)),
                transient,
            });
        }
    }
}

async fn try_send_rev(
    ctx: &WorkerContext,
    rev: &PendingRev,
    delta_ancestor: Option<String>,
    active: bool,
) -> Result<()> {
    let mut body = rev.body.clone().unwrap_or(Value::Object(Default::default()));
    if let Some(encrypted) = encrypt_properties(
        &rev.doc_id,
        &body,
        ctx.options.property_encryptor.as_ref(),
    )? {
        body = encrypted;
    }

    // Delta-encode against the ancestor the peer named, when profitable.
    let mut delta_src = None;
    let mut payload = serde_json::to_vec(&body)?;
    if !ctx.options.no_deltas
        && let Some(ancestor_id) = delta_ancestor
        && let Some((_, ancestor_body)) = rev
            .ancestor_bodies
            .iter()
            .find(|(id, _)| *id == ancestor_id)
        && let Some((_, delta_bytes)) = delta_if_smaller(ancestor_body, &body)
    {
        payload = delta_bytes;
        delta_src = Some(ancestor_id);
    }

    let message = Message::new(profile::REV)
        .with_property("collection", ctx.collection_index)
        .with_property("id", &rev.doc_id)
        .with_property("rev", &rev.rev_id)
        .with_property("sequence", rev.sequence)
        .with_optional_property("history", (!rev.history.is_empty()).then_some(&rev.history))
        .with_optional_property("deleted", rev.deleted.then_some("true"))
        .with_optional_property("deltaSrc", delta_src)
        .with_body(payload);

    let response = ctx.transport.send(message).await?;
    if let Some((domain, code, msg)) = &response.error {
        return Err(Error::Remote {
            domain: domain.clone(),
            code: *code,
            message: msg.clone(),
        });
    }

    if active {
        mark_synced(ctx, &rev.doc_id, &rev.rev_id).await;
        ctx.checkpointer.complete_sequence(rev.sequence);
    }
    ctx.send_event(WorkerEvent::Progress {
        completed: 1,
        total: 0,
        docs: 1,
    });
    ctx.doc_ended(ReplicatedDoc {
        collection: ctx.collection.clone(),
        direction: Direction::Push,
        doc_id: rev.doc_id.clone(),
        rev_id: rev.rev_id.clone(),
        flags: if rev.deleted {
            DocumentFlags::DELETED
        } else {
            DocumentFlags::NONE
        },
        sequence: rev.sequence,
        kind: DocEndKind::Completed,
        error: None,
        transient: false,
    });
    Ok(())
}

/// Records "the default remote now has this rev" without racing local
/// writes: only when the doc's current revision is still the one pushed.
async fn mark_synced(ctx: &WorkerContext, doc_id: &str, pushed_rev: &str) {
    let keyspace = ctx.keyspace();
    let result: Result<()> = async {
        let Some(record) = ctx
            .store
            .get(&keyspace, doc_id, ContentLevel::EntireBody)
            .await?
        else {
            return Ok(());
        };
        let mut doc = DocumentRecord::load(&record)?;
        let still_current = match doc.current_vector() {
            Some(vector) => {
                let mut v = vector.clone();
                v.make_absolute(&ctx.source_id);
                v.current().map(|c| c.to_string()).as_deref() == Some(pushed_rev)
            }
            None => doc
                .current_rev_id()
                .map(|r| r.to_string())
                .as_deref()
                == Some(pushed_rev),
        };
        if !still_current {
            return Ok(());
        }
        match doc.rev_tree_mut() {
            Some(tree) => {
                let parsed: RevId = pushed_rev.parse()?;
                tree.set_remote_rev(DEFAULT_REMOTE, Some(&parsed))?;
            }
            None => doc.mark_synced(),
        }
        let _ = doc.save(ctx.store.as_ref(), &keyspace).await?;
        Ok(())
    }
    .await;
    if let Err(err) = result {
        debug!(doc = doc_id, error = %err, "could not record synced state");
    }
}

/// Parses the parameters of an incoming `subChanges` into push params for
/// the passive side.
pub(crate) fn sub_changes_params(message: &Message) -> PushParams {
    let since = message
        .int_property("since")
        .and_then(|n| u64::try_from(n).ok())
        .unwrap_or(0);
    let doc_ids: Option<HashSet<String>> = message
        .json_body::<Value>()
        .ok()
        .and_then(|v| {
            v.get("docIDs").and_then(Value::as_array).map(|a| {
                a.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
        })
        .filter(|ids: &HashSet<String>| !ids.is_empty());
    PushParams {
        since,
        continuous: message.bool_property("continuous"),
        proposing: false,
        active: false,
        doc_ids,
        skip_deleted: message.bool_property("activeOnly"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sub_changes_parsing() {
        let msg = Message::new(profile::SUB_CHANGES)
            .with_property("since", 42)
            .with_property("continuous", "true")
            .with_json_body(&serde_json::json!({"docIDs": ["a", "b"]}))
            .unwrap();
        let params = sub_changes_params(&msg);
        assert_eq!(params.since, 42);
        assert!(params.continuous);
        assert!(!params.proposing);
        assert!(!params.active);
        assert_eq!(params.doc_ids.unwrap().len(), 2);
    }

    #[test]
    fn sub_changes_defaults() {
        let msg = Message::new(profile::SUB_CHANGES);
        let params = sub_changes_params(&msg);
        assert_eq!(params.since, 0);
        assert!(!params.continuous);
        assert!(params.doc_ids.is_none());
    }
}
