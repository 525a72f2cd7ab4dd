use std::collections::VecDeque;

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use skiffdb_core::blob::find_blob_references;
use skiffdb_core::document::{DocumentRecord, VersioningMode};
use skiffdb_core::error::{Error, Result};
use skiffdb_core::legacy::VersionVectorWithLegacy;
use skiffdb_core::record::{ContentLevel, DocumentFlags};
use skiffdb_core::rev_tree::DEFAULT_REMOTE;
use skiffdb_core::revid::RevId;
use skiffdb_core::version::VersionOrder;
use skiffdb_net::blip::{IncomingRequest, Message, Response, profile};

use crate::delta::apply_delta;
use crate::encryption::decrypt_properties;
use crate::events::{ActivityLevel, BlobProgress, DocEndKind, Direction, ReplicatedDoc, WireError};
use crate::options::ConflictPolicy;
use crate::worker::{ChangeVerdict, ChangesEntry, ProposeEntry, WorkerContext, WorkerEvent};

/// Parameters of one pull run.
#[derive(Debug, Clone)]
pub(crate) struct PullParams {
    /// Active pullers subscribe with `subChanges` and own the checkpoint's
    /// remote cursor; passive ones only answer what the peer sends.
    pub active: bool,
    pub continuous: bool,
}

/// Revisions the peer announced in one `changes` batch; the remote cursor
/// advances only when a whole batch has been applied and committed.
#[derive(Debug)]
struct Batch {
    last_sequence: Value,
    outstanding: usize,
    failed: bool,
}

/// The pull half of the replicator: answers `changes` announcements with
/// verdicts, applies incoming `rev` messages to document records, and
/// advances the remote checkpoint cursor batch by batch.
pub(crate) struct Puller {
    ctx: WorkerContext,
    params: PullParams,
    rx: mpsc::Receiver<IncomingRequest>,
    batches: VecDeque<Batch>,
    /// Once a rev fails the cursor stops advancing for this connection.
    stalled: bool,
    caught_up: bool,
    announced_done: bool,
}

impl Puller {
    pub fn new(
        ctx: WorkerContext,
        params: PullParams,
        rx: mpsc::Receiver<IncomingRequest>,
    ) -> Self {
        Puller {
            ctx,
            params,
            rx,
            batches: VecDeque::new(),
            stalled: false,
            caught_up: false,
            announced_done: false,
        }
    }

    pub async fn run(mut self) {
        if self.params.active
            && let Err(err) = self.subscribe().await
        {
            warn!(error = %err, "subChanges failed");
            self.ctx.send_event(WorkerEvent::Failed(err));
            return;
        }
        loop {
            tokio::select! {
                _ = self.ctx.cancel.cancelled() => return,
                request = self.rx.recv() => {
                    let Some(request) = request else { return };
                    self.handle(request).await;
                }
            }
        }
    }

    async fn subscribe(&self) -> Result<()> {
        let options = &self.ctx.options;
        let message = Message::new(profile::SUB_CHANGES)
            .with_property("collection", self.ctx.collection_index)
            .with_property("since", self.ctx.checkpointer.remote())
            .with_optional_property(
                "continuous",
                self.params.continuous.then_some("true"),
            )
            .with_optional_property("filter", options.filter.clone())
            .with_optional_property(
                "channels",
                options.channels.as_ref().map(|c| c.join(",")),
            )
            .with_json_body(&serde_json::json!({
                "docIDs": options.doc_ids.clone().unwrap_or_default(),
            }))?;
        self.ctx.transport.send(message).await?.into_result()?;
        Ok(())
    }

    async fn handle(&mut self, request: IncomingRequest) {
        match request.message.profile() {
            Some(profile::CHANGES) => self.handle_changes(request, false).await,
            Some(profile::PROPOSE_CHANGES) => self.handle_changes(request, true).await,
            Some(profile::REV) => self.handle_rev(request).await,
            Some(profile::NOREV) => self.handle_norev(request),
            other => {
                debug!(profile = ?other, "puller ignoring unexpected message");
                request.respond(Response::error("BLIP", 404, "no handler"));
            }
        }
    }

    // ---- changes ----------------------------------------------------------

    async fn handle_changes(&mut self, request: IncomingRequest, proposed: bool) {
        let entries: Vec<Value> = request.message.json_body().unwrap_or_default();
        if entries.is_empty() {
            // The peer is caught up.
            self.caught_up = true;
            request.respond(Response::ok());
            self.ctx.set_level(Direction::Pull, ActivityLevel::Idle);
            self.maybe_done();
            return;
        }
        self.ctx.set_level(Direction::Pull, ActivityLevel::Busy);

        let mut verdicts = Vec::with_capacity(entries.len());
        let mut outstanding = 0usize;
        let mut last_sequence = Value::Null;
        for entry in &entries {
            let verdict = if proposed {
                match ProposeEntry::from_json(entry) {
                    Some(e) => self.verdict_for(&e.doc_id, &e.rev_id, Some(&e)).await,
                    None => ChangeVerdict::Refused(400),
                }
            } else {
                match ChangesEntry::from_json(entry) {
                    Some(e) => {
                        last_sequence = e.sequence.clone();
                        self.verdict_for(&e.doc_id, &e.rev_id, None).await
                    }
                    None => ChangeVerdict::Refused(400),
                }
            };
            if matches!(
                verdict,
                ChangeVerdict::Wanted | ChangeVerdict::DeltaFrom(_)
            ) {
                outstanding += 1;
            }
            verdicts.push(verdict.to_json());
        }

        self.ctx.send_event(WorkerEvent::Progress {
            completed: 0,
            total: outstanding as u64,
            docs: 0,
        });
        if self.params.active && !proposed {
            if outstanding == 0 {
                if !self.stalled && self.batches.is_empty() {
                    self.ctx.checkpointer.set_remote(last_sequence.clone());
                }
            } else {
                self.batches.push_back(Batch {
                    last_sequence,
                    outstanding,
                    failed: false,
                });
            }
        }

        let response = Response::ok()
            .with_property("maxHistory", self.ctx.options.prune_depth)
            .with_json_body(&Value::Array(verdicts));
        match response {
            Ok(r) => request.respond(r),
            Err(err) => request.respond(Response::from_error(&err)),
        }
    }

    /// Decides whether we need a revision the peer announced.
    async fn verdict_for(
        &self,
        doc_id: &str,
        rev_id: &str,
        proposal: Option<&ProposeEntry>,
    ) -> ChangeVerdict {
        let Ok(incoming) = rev_id.parse::<RevId>() else {
            return ChangeVerdict::Refused(400);
        };
        let keyspace = self.ctx.keyspace();
        let record = match self
            .ctx
            .store
            .get(&keyspace, doc_id, ContentLevel::EntireBody)
            .await
        {
            Ok(r) => r,
            Err(_) => return ChangeVerdict::Refused(500),
        };
        let Some(record) = record else {
            // Brand new to us; proposals are fine if they don't claim an
            // ancestor we'd need.
            return ChangeVerdict::Wanted;
        };
        let Ok(doc) = DocumentRecord::load(&record) else {
            return ChangeVerdict::Refused(500);
        };

        match (&incoming, doc.mode()) {
            (RevId::Digest { .. }, VersioningMode::Tree) => {
                let tree = doc.rev_tree().expect("tree mode");
                if tree.get(&incoming).is_some() {
                    return ChangeVerdict::NotWanted;
                }
                if let Some(p) = proposal {
                    let current = doc.current_rev_id().map(|r| r.to_string());
                    let matches_ancestor = match (&p.remote_ancestor, &current) {
                        (Some(a), Some(c)) => a == c,
                        (None, None) => true,
                        // A proposal with no ancestor against an existing
                        // doc (or vice versa) would branch.
                        _ => false,
                    };
                    if !matches_ancestor {
                        return ChangeVerdict::Refused(409);
                    }
                }
                match self.delta_hint(&doc) {
                    Some(ancestor) => ChangeVerdict::DeltaFrom(ancestor),
                    None => ChangeVerdict::Wanted,
                }
            }
            (RevId::Version(version), VersioningMode::Vector) => {
                let mut version = *version;
                if version.source() == &self.ctx.source_id {
                    version = skiffdb_core::version::Version::new(
                        version.time(),
                        skiffdb_core::version::SourceId::ME,
                    );
                }
                let local = doc.current_vector().cloned().unwrap_or_default();
                match local.compare_to_version(&version) {
                    VersionOrder::Same | VersionOrder::Newer => ChangeVerdict::NotWanted,
                    _ => match self.delta_hint(&doc) {
                        Some(ancestor) => ChangeVerdict::DeltaFrom(ancestor),
                        None => ChangeVerdict::Wanted,
                    },
                }
            }
            // Announcing the wrong kind of revision for an existing doc is
            // a per-document protocol error.
            _ => ChangeVerdict::Refused(400),
        }
    }

    /// Our current revision makes a delta base when we hold its body and
    /// deltas are enabled.
    fn delta_hint(&self, doc: &DocumentRecord) -> Option<String> {
        if self.ctx.options.no_deltas {
            return None;
        }
        let current = doc.current_revision()?;
        current.body.as_ref()?;
        Some(match doc.current_vector() {
            Some(vector) => {
                let mut v = vector.clone();
                v.make_absolute(&self.ctx.source_id);
                v.current()?.to_string()
            }
            None => current.rev_id.to_string(),
        })
    }

    // ---- rev --------------------------------------------------------------

    async fn handle_rev(&mut self, request: IncomingRequest) {
        let message = request.message.clone();
        let doc_id = message.property("id").unwrap_or_default().to_string();
        let rev_id = message.property("rev").unwrap_or_default().to_string();
        match self.apply_rev(&message).await {
            Ok(outcome) => {
                request.respond_ok();
                self.note_rev_done(true);
                self.ctx.send_event(WorkerEvent::Progress {
                    completed: 1,
                    total: 0,
                    docs: 1,
                });
                if let Some(doc) = outcome {
                    self.ctx.doc_ended(doc);
                }
            }
            Err(err) => {
                warn!(doc = doc_id, rev = rev_id, error = %err, "failed to apply rev");
                request.respond(Response::from_error(&err));
                self.note_rev_done(false);
                self.ctx.doc_ended(ReplicatedDoc {
                    collection: self.ctx.collection.clone(),
                    direction: Direction::Pull,
                    doc_id,
                    rev_id,
                    flags: DocumentFlags::NONE,
                    sequence: 0,
                    kind: DocEndKind::Error,
                    error: Some(WireError::from_error(&err)),
                    transient: err.is_transient(),
                });
            }
        }
    }

    fn handle_norev(&mut self, request: IncomingRequest) {
        debug!(
            doc = request.message.property("id").unwrap_or_default(),
            "peer could not send revision"
        );
        self.note_rev_done(false);
        request.respond_ok();
    }

    fn note_rev_done(&mut self, ok: bool) {
        if let Some(front) = self.batches.front_mut() {
            if !ok {
                front.failed = true;
            }
            front.outstanding = front.outstanding.saturating_sub(1);
            if front.outstanding == 0 {
                let batch = self.batches.pop_front().expect("front exists");
                if batch.failed {
                    self.stalled = true;
                }
                if self.params.active && !self.stalled {
                    self.ctx.checkpointer.set_remote(batch.last_sequence);
                }
            }
        }
        self.maybe_done();
    }

    fn maybe_done(&mut self) {
        if self.caught_up
            && self.batches.is_empty()
            && !self.params.continuous
            && !self.announced_done
        {
            self.announced_done = true;
            self.ctx.send_event(WorkerEvent::CaughtUp(Direction::Pull));
        }
    }

    /// Applies one incoming revision inside a record-store transaction.
    async fn apply_rev(&mut self, message: &Message) -> Result<Option<ReplicatedDoc>> {
        let doc_id = message
            .property("id")
            .ok_or_else(|| Error::InvalidParameter("rev without id".into()))?
            .to_string();
        let rev_id = message
            .property("rev")
            .ok_or_else(|| Error::InvalidParameter("rev without rev".into()))?
            .to_string();
        let keyspace = self.ctx.keyspace();

        // Revoked-access tombstones purge the local copy entirely.
        if message.bool_property("purged") {
            if !self.ctx.options.auto_purge {
                return Ok(None);
            }
            let existed = self.ctx.store.purge(&keyspace, &doc_id).await?;
            return Ok(existed.then(|| ReplicatedDoc {
                collection: self.ctx.collection.clone(),
                direction: Direction::Pull,
                doc_id,
                rev_id,
                flags: DocumentFlags::DELETED,
                sequence: 0,
                kind: DocEndKind::Purge,
                error: None,
                transient: false,
            }));
        }

        let deleted = message.bool_property("deleted");
        let mut flags = if deleted {
            DocumentFlags::DELETED
        } else {
            DocumentFlags::NONE
        };

        let mut body = self.decode_body(message, &doc_id).await?;
        if !self.ctx.options.no_decryption
            && let Some(decrypted) = decrypt_properties(
                &doc_id,
                &body,
                self.ctx.options.property_decryptor.as_ref(),
            )?
        {
            body = decrypted;
        }

        if let Some(filter) = &self.ctx.options.pull_filter
            && !filter(&self.ctx.collection, &doc_id, &rev_id, flags, &body)
        {
            // Filter rejection is not an error; the revision is simply not
            // applied.
            return Ok(None);
        }

        let blob_refs = find_blob_references(&body);
        if !blob_refs.is_empty() {
            flags = flags.union(DocumentFlags::HAS_ATTACHMENTS);
            for blob_ref in &blob_refs {
                self.fetch_blob(&doc_id, blob_ref).await?;
            }
        }

        let history = message.property("history").unwrap_or("").to_string();

        self.ctx.store.begin_transaction().await?;
        let result = self
            .insert_revision(&doc_id, &rev_id, &history, body.clone(), flags)
            .await;
        match &result {
            Ok(_) => self.ctx.store.commit().await?,
            Err(_) => self.ctx.store.abort().await?,
        }
        result
    }

    async fn decode_body(&self, message: &Message, doc_id: &str) -> Result<Value> {
        if message.body.is_empty() {
            return Ok(Value::Object(Default::default()));
        }
        let raw: Value = message.json_body()?;
        let Some(delta_src) = message.property("deltaSrc") else {
            return Ok(raw);
        };
        // Delta body: patch our copy of the named ancestor. A missing
        // ancestor means the peer must retry with the full body.
        let keyspace = self.ctx.keyspace();
        let base = self
            .ctx
            .store
            .get(&keyspace, doc_id, ContentLevel::EntireBody)
            .await?
            .and_then(|record| DocumentRecord::load(&record).ok())
            .and_then(|doc| self.body_of_rev(&doc, delta_src));
        let Some(base) = base else {
            return Err(Error::BadDelta(format!(
                "no local body for delta base '{delta_src}'"
            )));
        };
        apply_delta(&base, &raw)
    }

    fn body_of_rev(&self, doc: &DocumentRecord, rev_id: &str) -> Option<Value> {
        if let Some(tree) = doc.rev_tree() {
            let parsed: RevId = rev_id.parse().ok()?;
            return tree.get(&parsed).and_then(|r| r.body.clone());
        }
        // Vector mode: the hint we hand out is our own current version.
        let mut vector = doc.current_vector()?.clone();
        vector.make_absolute(&self.ctx.source_id);
        if vector.current()?.to_string() == rev_id {
            doc.current_revision()?.body
        } else {
            None
        }
    }

    async fn insert_revision(
        &self,
        doc_id: &str,
        rev_id: &str,
        history: &str,
        body: Value,
        flags: DocumentFlags,
    ) -> Result<Option<ReplicatedDoc>> {
        // One retry on a CAS race with a local writer.
        match self
            .try_insert_revision(doc_id, rev_id, history, body.clone(), flags)
            .await
        {
            Err(Error::TransactionBusy) => {
                self.try_insert_revision(doc_id, rev_id, history, body, flags)
                    .await
            }
            other => other,
        }
    }

    async fn try_insert_revision(
        &self,
        doc_id: &str,
        rev_id: &str,
        history: &str,
        body: Value,
        flags: DocumentFlags,
    ) -> Result<Option<ReplicatedDoc>> {
        let keyspace = self.ctx.keyspace();
        let incoming: RevId = rev_id
            .parse()
            .map_err(|_| Error::BadRevisionId(format!("bad incoming rev '{rev_id}'")))?;
        let record = self
            .ctx
            .store
            .get(&keyspace, doc_id, ContentLevel::EntireBody)
            .await?;
        let mut doc = match &record {
            Some(record) => DocumentRecord::load(record)?,
            None => DocumentRecord::new(
                doc_id,
                if incoming.is_version() {
                    VersioningMode::Vector
                } else {
                    VersioningMode::Tree
                },
            ),
        };

        let mut kind = DocEndKind::Completed;
        match (&incoming, doc.mode()) {
            (RevId::Digest { .. }, VersioningMode::Tree) => {
                let mut chain = vec![incoming.clone()];
                for ancestor in history.split(',').map(str::trim).filter(|s| !s.is_empty()) {
                    chain.push(ancestor.parse()?);
                }
                let allow_conflict = !self.ctx.options.no_incoming_conflicts;
                doc.insert_history(&chain, Some(body), flags, allow_conflict)?;
                if let Some(tree) = doc.rev_tree_mut() {
                    let _ = tree.set_remote_rev(DEFAULT_REMOTE, Some(&incoming));
                    tree.prune_to_default();
                }
                if doc.is_conflicted() {
                    kind = DocEndKind::Conflict;
                }
            }
            (RevId::Version(_), VersioningMode::Vector) => {
                let list = if history.is_empty() {
                    rev_id.to_string()
                } else {
                    history.to_string()
                };
                let incoming_history =
                    VersionVectorWithLegacy::parse_history(&[list.as_str()], &self.ctx.source_id)?;
                let incoming_vector = incoming_history.vector.clone();
                incoming_vector.update_clock(&self.ctx.clock, true);

                let local = doc.current_vector().cloned().unwrap_or_default();
                let order = if local.is_empty() {
                    VersionOrder::Older
                } else {
                    local.compare_to(&incoming_vector)
                };
                match order {
                    VersionOrder::Older => {
                        doc.replace_current(incoming_vector.clone(), Some(body), flags)?;
                        if let Some(legacy) = incoming_history.legacy.first() {
                            doc.set_legacy_rev_id(Some(legacy.clone()))?;
                        }
                        doc.set_remote_vector(
                            DEFAULT_REMOTE,
                            incoming_vector,
                            None,
                            flags,
                        )?;
                    }
                    VersionOrder::Same | VersionOrder::Newer => {
                        doc.set_remote_vector(DEFAULT_REMOTE, incoming_vector, None, flags)?;
                    }
                    VersionOrder::Conflicting => {
                        kind = self.resolve_pull_conflict(
                            &mut doc,
                            incoming_vector,
                            body,
                            flags,
                        )?;
                    }
                }
            }
            // Mixing modes on one document is forbidden by construction.
            _ => {
                return Err(Error::BadRevisionId(format!(
                    "document '{doc_id}' cannot accept revision '{rev_id}'"
                )));
            }
        }

        match doc.save(self.ctx.store.as_ref(), &keyspace).await? {
            skiffdb_core::document::SaveResult::Conflict => Err(Error::TransactionBusy),
            _ => Ok(Some(ReplicatedDoc {
                collection: self.ctx.collection.clone(),
                direction: Direction::Pull,
                doc_id: doc_id.to_string(),
                rev_id: rev_id.to_string(),
                flags: doc.flags(),
                sequence: doc.sequence(),
                kind,
                error: None,
                transient: false,
            })),
        }
    }

    /// A pulled revision conflicts with the local current one.
    fn resolve_pull_conflict(
        &self,
        doc: &mut DocumentRecord,
        incoming: skiffdb_core::version_vector::VersionVector,
        body: Value,
        flags: DocumentFlags,
    ) -> Result<DocEndKind> {
        match self.ctx.options.conflict_policy {
            ConflictPolicy::Manual => {
                // Keep both sides; the application resolves.
                doc.set_remote_vector(DEFAULT_REMOTE, incoming, Some(body), flags)?;
                doc.mark_conflicted();
                Ok(DocEndKind::Conflict)
            }
            ConflictPolicy::AutoTieBreak => {
                let local = doc.current_vector().cloned().unwrap_or_default();
                let me = skiffdb_core::version::SourceId::ME;
                let incoming_wins = match incoming.time_of(&me).cmp(&local.time_of(&me)) {
                    std::cmp::Ordering::Greater => true,
                    std::cmp::Ordering::Less => false,
                    std::cmp::Ordering::Equal => {
                        let inc_src = incoming.current().map(|v| *v.source());
                        let loc_src = local.current().map(|v| *v.source());
                        inc_src > loc_src
                    }
                };
                if incoming_wins {
                    doc.replace_current(incoming.clone(), Some(body), flags)?;
                    doc.set_remote_vector(DEFAULT_REMOTE, incoming, None, flags)?;
                } else {
                    doc.set_remote_vector(DEFAULT_REMOTE, incoming, Some(body), flags)?;
                }
                Ok(DocEndKind::Completed)
            }
        }
    }

    /// Pulls one referenced attachment the local blob store is missing.
    async fn fetch_blob(
        &self,
        doc_id: &str,
        blob_ref: &skiffdb_core::blob::BlobRef,
    ) -> Result<()> {
        if self.ctx.blobs.has(&blob_ref.key).await? {
            return Ok(());
        }
        let total = blob_ref.length.unwrap_or(0);
        let progress = |done, error: Option<WireError>| BlobProgress {
            collection: self.ctx.collection.clone(),
            direction: Direction::Pull,
            doc_id: doc_id.to_string(),
            property: blob_ref.property.clone(),
            key: blob_ref.key.to_string(),
            bytes_completed: done,
            bytes_total: total,
            error,
        };
        self.ctx
            .send_event(WorkerEvent::BlobProgress(progress(0, None)));

        let message = Message::new(profile::GET_ATTACHMENT)
            .with_property("digest", blob_ref.key.to_string())
            .with_property("docID", doc_id);
        let response = self.ctx.transport.send(message).await?.into_result()?;
        let data = response.body;
        if !blob_ref.key.verify(&data) {
            let err = Error::CorruptRevisionData(format!(
                "attachment digest mismatch for {}",
                blob_ref.key
            ));
            self.ctx.send_event(WorkerEvent::BlobProgress(progress(
                data.len() as u64,
                Some(WireError::from_error(&err)),
            )));
            return Err(err);
        }
        self.ctx.blobs.put(&data).await?;
        self.ctx.send_event(WorkerEvent::BlobProgress(progress(
            data.len() as u64,
            None,
        )));
        Ok(())
    }
}
