use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use skiffdb_core::blob::BlobStore;
use skiffdb_core::clock::HybridClock;
use skiffdb_core::document::DocumentRecord;
use skiffdb_core::error::{Error, NetworkError, Result};
use skiffdb_core::record::CollectionSpec;
use skiffdb_core::store::RecordStore;
use skiffdb_core::version::SourceId;
use skiffdb_net::blip::{IncomingRequest, Message, Response, Transport, profile};

use crate::checkpoint::{Checkpoint, Checkpointer};
use crate::events::{
    ActivityLevel, Direction, NullDelegate, Progress, ReplicatorDelegate, Status, StatusFlags,
    WireError,
};
use crate::options::{ReplicationMode, ReplicatorOptions};
use crate::passive;
use crate::puller::{PullParams, Puller};
use crate::pusher::{PushParams, Pusher, sub_changes_params};
use crate::worker::{WorkerContext, WorkerEvent};

/// Base delay of the exponential retry backoff.
const RETRY_BASE: Duration = Duration::from_secs(2);

/// Produces connected transports; called once per connection attempt so
/// the replicator can retry after transient failures.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn Transport>>;
}

/// A connector around an already-established transport; a reconnect
/// attempt fails as unreachable. Used for loopback replication and tests.
pub struct SingleShotConnector {
    transport: Mutex<Option<Arc<dyn Transport>>>,
}

impl SingleShotConnector {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        SingleShotConnector {
            transport: Mutex::new(Some(transport)),
        }
    }
}

#[async_trait]
impl Connector for SingleShotConnector {
    async fn connect(&self) -> Result<Arc<dyn Transport>> {
        self.transport
            .lock()
            .expect("connector lock")
            .take()
            .ok_or(Error::Network {
                code: NetworkError::Unreachable,
                message: "loopback transport cannot reconnect".into(),
            })
    }
}

/// Static configuration of one replicator.
pub struct ReplicatorConfig {
    pub store: Arc<dyn RecordStore>,
    pub blobs: Arc<dyn BlobStore>,
    pub collections: Vec<CollectionSpec>,
    pub options: ReplicatorOptions,
    pub delegate: Arc<dyn ReplicatorDelegate>,
    /// Remote URL (stable form) or the configured `remoteDBUniqueID`;
    /// feeds the checkpoint identity.
    pub remote_identity: String,
    pub clock: Arc<HybridClock>,
    pub source_id: SourceId,
}

enum ConnectionOutcome {
    /// One-shot work finished and checkpoints are flushed.
    Completed,
    StoppedByUser,
    Failed(Error),
}

struct Shared {
    options: Arc<ReplicatorOptions>,
    store: Arc<dyn RecordStore>,
    blobs: Arc<dyn BlobStore>,
    collections: Vec<CollectionSpec>,
    remote_identity: String,
    clock: Arc<HybridClock>,
    source_id: SourceId,
    delegate: Mutex<Arc<dyn ReplicatorDelegate>>,
    cancel: CancellationToken,
    status_tx: watch::Sender<Status>,
}

impl Shared {
    fn delegate(&self) -> Arc<dyn ReplicatorDelegate> {
        self.delegate.lock().expect("delegate lock").clone()
    }

    fn publish(&self, status: Status) {
        debug!(level = %status.level, "replicator status");
        self.delegate().status_changed(&status);
        let _ = self.status_tx.send(status);
    }

    fn set_level(&self, level: ActivityLevel, error: Option<WireError>, will_retry: bool) {
        let progress = self.status_tx.borrow().progress;
        self.publish(Status {
            level,
            progress,
            error,
            flags: StatusFlags {
                will_retry,
                host_reachable: true,
                suspended: false,
            },
        });
    }
}

/// The root of the replication actor tree: owns the connection lifecycle
/// and retry state machine, spawns a pusher and a puller per collection,
/// routes incoming messages, and drives checkpoint saves.
pub struct Replicator {
    shared: Arc<Shared>,
    connector: Arc<dyn Connector>,
    task: Mutex<Option<JoinHandle<()>>>,
    status_rx: watch::Receiver<Status>,
}

impl Replicator {
    pub fn new(config: ReplicatorConfig, connector: Arc<dyn Connector>) -> Arc<Self> {
        let (status_tx, status_rx) = watch::channel(Status::stopped());
        let collections = if config.collections.is_empty() {
            vec![CollectionSpec::default_collection()]
        } else {
            config.collections
        };
        Arc::new(Replicator {
            shared: Arc::new(Shared {
                options: Arc::new(config.options),
                store: config.store,
                blobs: config.blobs,
                collections,
                remote_identity: config.remote_identity,
                clock: config.clock,
                source_id: config.source_id,
                delegate: Mutex::new(config.delegate),
                cancel: CancellationToken::new(),
                status_tx,
            }),
            connector,
            task: Mutex::new(None),
            status_rx,
        })
    }

    /// Spawns the replicator's root task. `reset` discards checkpoints and
    /// re-scans from sequence zero.
    pub fn start(self: &Arc<Self>, reset: bool) {
        let mut task = self.task.lock().expect("task lock");
        if task.is_some() {
            return;
        }
        let this = self.clone();
        *task = Some(tokio::spawn(async move {
            this.run(reset).await;
        }));
    }

    /// Runs the full lifecycle inline, returning once `Stopped`.
    pub async fn run(self: &Arc<Self>, reset: bool) {
        let shared = &self.shared;
        let continuous = shared.options.is_continuous();
        let mut attempt: u32 = 0;
        let mut reset = reset;
        loop {
            if shared.cancel.is_cancelled() {
                shared.set_level(ActivityLevel::Stopped, None, false);
                return;
            }
            shared.set_level(ActivityLevel::Connecting, None, false);
            let transport = match self.connector.connect().await {
                Ok(t) => {
                    attempt = 0;
                    t
                }
                Err(err) => {
                    if self.should_retry(&err, attempt) {
                        self.go_offline(&err, attempt).await;
                        attempt += 1;
                        continue;
                    }
                    shared.set_level(
                        ActivityLevel::Stopped,
                        Some(WireError::from_error(&err)),
                        false,
                    );
                    return;
                }
            };

            let outcome = self.run_connection(transport, reset).await;
            reset = false;
            match outcome {
                ConnectionOutcome::Completed => {
                    info!("replication completed");
                    shared.set_level(ActivityLevel::Stopped, None, false);
                    return;
                }
                ConnectionOutcome::StoppedByUser => {
                    shared.set_level(ActivityLevel::Stopped, None, false);
                    return;
                }
                ConnectionOutcome::Failed(err) => {
                    attempt += 1;
                    if (continuous || err.is_transient()) && self.should_retry(&err, attempt) {
                        self.go_offline(&err, attempt).await;
                        continue;
                    }
                    shared.set_level(
                        ActivityLevel::Stopped,
                        Some(WireError::from_error(&err)),
                        false,
                    );
                    return;
                }
            }
        }
    }

    fn should_retry(&self, err: &Error, attempt: u32) -> bool {
        err.is_transient()
            && attempt < self.shared.options.max_retries
            && !self.shared.cancel.is_cancelled()
    }

    async fn go_offline(&self, err: &Error, attempt: u32) {
        let shared = &self.shared;
        let delay = retry_delay(attempt, shared.options.max_retry_interval);
        warn!(error = %err, retry_in = ?delay, "going offline");
        shared.set_level(ActivityLevel::Offline, Some(WireError::from_error(err)), true);
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shared.cancel.cancelled() => {}
        }
    }

    /// Requests a stop; idempotent and safe from any task. Workers drain,
    /// dirty checkpoints flush, then the status reaches `Stopped`.
    pub fn stop(&self) {
        self.shared.cancel.cancel();
    }

    /// Stops and silences the delegate: no callbacks are made after this
    /// returns, and the delegate reference is dropped.
    pub fn terminate(&self) {
        *self.shared.delegate.lock().expect("delegate lock") = Arc::new(NullDelegate);
        self.shared.cancel.cancel();
    }

    pub fn status(&self) -> Status {
        self.status_rx.borrow().clone()
    }

    /// Watches status transitions; useful for awaiting `Stopped` or `Idle`.
    pub fn subscribe_status(&self) -> watch::Receiver<Status> {
        self.status_rx.clone()
    }

    /// Waits until the replicator reaches the given level.
    pub async fn wait_for_level(&self, level: ActivityLevel) {
        let mut rx = self.subscribe_status();
        loop {
            if rx.borrow().level == level {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Document IDs with revisions still pending push, per the current
    /// checkpoint.
    pub async fn pending_document_ids(&self) -> Result<Vec<String>> {
        let shared = &self.shared;
        let mut out = Vec::new();
        for collection in &shared.collections {
            let checkpointer = self.make_checkpointer(collection);
            checkpointer.load_local(shared.store.as_ref()).await?;
            let since = checkpointer.local();
            let records = shared
                .store
                .enumerate(&collection.keyspace(), since, 0)
                .await?;
            for record in records {
                if let Some(ids) = &shared.options.doc_ids
                    && !ids.contains(&record.doc_id)
                {
                    continue;
                }
                if let Some(filter) = &shared.options.push_filter {
                    let Ok(doc) = DocumentRecord::load(&record) else {
                        continue;
                    };
                    let rev = doc
                        .current_rev_id()
                        .map(|r| r.to_string())
                        .unwrap_or_default();
                    let body = doc
                        .current_revision()
                        .and_then(|r| r.body)
                        .unwrap_or_default();
                    if !filter(collection, &record.doc_id, &rev, record.flags, &body) {
                        continue;
                    }
                }
                out.push(record.doc_id);
            }
        }
        Ok(out)
    }

    pub async fn is_document_pending(&self, doc_id: &str) -> Result<bool> {
        Ok(self.pending_document_ids().await?.iter().any(|d| d == doc_id))
    }

    fn make_checkpointer(&self, collection: &CollectionSpec) -> Arc<Checkpointer> {
        let shared = &self.shared;
        let identity = shared
            .options
            .remote_db_unique_id
            .clone()
            .unwrap_or_else(|| shared.remote_identity.clone());
        Arc::new(Checkpointer::new(
            &shared.store.uuid().to_string(),
            &identity,
            collection.clone(),
            shared.options.checkpoint_interval,
        ))
    }

    // ---- One connection ---------------------------------------------------

    async fn run_connection(
        &self,
        transport: Arc<dyn Transport>,
        reset: bool,
    ) -> ConnectionOutcome {
        let shared = self.shared.clone();
        let options = shared.options.clone();
        let connection_cancel = shared.cancel.child_token();
        let (events_tx, mut events_rx) = mpsc::unbounded_channel::<WorkerEvent>();

        // Checkpointers, loaded and reconciled with the peer.
        let setup = async {
            let mut checkpointers = Vec::new();
            for (index, collection) in shared.collections.iter().enumerate() {
                let checkpointer = self.make_checkpointer(collection);
                checkpointer.load_local(shared.store.as_ref()).await?;
                if reset {
                    checkpointer.reset();
                }
                if options.push.is_active() || options.pull.is_active() {
                    fetch_peer_checkpoint(&transport, &checkpointer, index).await?;
                    if checkpointer.requires_reset() {
                        checkpointer.reset();
                    }
                }
                checkpointers.push(checkpointer);
            }
            Ok::<_, Error>(checkpointers)
        };
        let checkpointers = tokio::select! {
            result = setup => match result {
                Ok(checkpointers) => checkpointers,
                Err(err) => return ConnectionOutcome::Failed(err),
            },
            _ = connection_cancel.cancelled() => {
                transport.close(1000, "stopped").await;
                return ConnectionOutcome::StoppedByUser;
            }
        };

        let context_for = |index: usize, checkpointer: Arc<Checkpointer>| WorkerContext {
            store: shared.store.clone(),
            blobs: shared.blobs.clone(),
            transport: transport.clone(),
            options: options.clone(),
            collection: shared.collections[index].clone(),
            collection_index: index,
            checkpointer,
            clock: shared.clock.clone(),
            source_id: shared.source_id,
            events: events_tx.clone(),
            cancel: connection_cancel.clone(),
        };

        // Pullers get a mailbox the dispatcher feeds.
        let mut puller_txs = Vec::new();
        let accepts_pulled_revs =
            options.pull.is_active() || options.pull == ReplicationMode::Passive
                || options.push == ReplicationMode::Passive;
        for (index, checkpointer) in checkpointers.iter().enumerate() {
            if accepts_pulled_revs {
                let (tx, rx) = mpsc::channel::<IncomingRequest>(64);
                let puller = Puller::new(
                    context_for(index, checkpointer.clone()),
                    PullParams {
                        active: options.pull.is_active(),
                        continuous: options.pull.is_continuous(),
                    },
                    rx,
                );
                tokio::spawn(puller.run());
                puller_txs.push(Some(tx));
            } else {
                puller_txs.push(None);
            }
        }

        // Active pushers.
        for (index, checkpointer) in checkpointers.iter().enumerate() {
            if options.push.is_active() {
                let params = PushParams {
                    since: checkpointer.local(),
                    continuous: options.push.is_continuous(),
                    proposing: !options.no_incoming_conflicts,
                    active: true,
                    doc_ids: options
                        .doc_ids
                        .as_ref()
                        .map(|ids| ids.iter().cloned().collect()),
                    skip_deleted: options.skip_deleted,
                };
                let pusher = Pusher::new(context_for(index, checkpointer.clone()), params);
                tokio::spawn(pusher.run());
            }
        }

        // Dispatcher: routes every incoming request to its handler.
        let dispatcher = {
            let transport = transport.clone();
            let shared = shared.clone();
            let puller_txs = puller_txs.clone();
            let checkpointers = checkpointers.clone();
            let events_tx = events_tx.clone();
            let cancel = connection_cancel.clone();
            let options = options.clone();
            tokio::spawn(async move {
                while let Some(request) = transport.receive().await {
                    if cancel.is_cancelled() {
                        break;
                    }
                    let index = request
                        .message
                        .int_property("collection")
                        .and_then(|n| usize::try_from(n).ok())
                        .unwrap_or(0)
                        .min(shared.collections.len().saturating_sub(1));
                    match request.message.profile() {
                        Some(profile::SUB_CHANGES) => {
                            let params = sub_changes_params(&request.message);
                            let ctx = WorkerContext {
                                store: shared.store.clone(),
                                blobs: shared.blobs.clone(),
                                transport: transport.clone(),
                                options: options.clone(),
                                collection: shared.collections[index].clone(),
                                collection_index: index,
                                checkpointer: checkpointers[index].clone(),
                                clock: shared.clock.clone(),
                                source_id: shared.source_id,
                                events: events_tx.clone(),
                                cancel: cancel.clone(),
                            };
                            request.respond_ok();
                            tokio::spawn(Pusher::new(ctx, params).run());
                        }
                        Some(
                            profile::CHANGES
                            | profile::PROPOSE_CHANGES
                            | profile::REV
                            | profile::NOREV,
                        ) => match &puller_txs[index] {
                            Some(tx) => {
                                if tx.send(request).await.is_err() {
                                    break;
                                }
                            }
                            None => request
                                .respond(Response::error("HTTP", 501, "pull not enabled")),
                        },
                        Some(profile::GET_CHECKPOINT) => {
                            passive::handle_get_checkpoint(shared.store.as_ref(), request)
                                .await;
                        }
                        Some(profile::SET_CHECKPOINT) => {
                            passive::handle_set_checkpoint(shared.store.as_ref(), request)
                                .await;
                        }
                        Some(profile::GET_ATTACHMENT) => {
                            passive::handle_get_attachment(shared.blobs.as_ref(), request)
                                .await;
                        }
                        Some(profile::PROVE_ATTACHMENT) => {
                            passive::handle_prove_attachment(shared.blobs.as_ref(), request)
                                .await;
                        }
                        other => {
                            debug!(profile = ?other, "no handler for profile");
                            request.respond(Response::error("BLIP", 404, "no handler"));
                        }
                    }
                }
                let _ = events_tx.send(WorkerEvent::ConnectionClosed);
            })
        };

        // Event loop: aggregates worker state, drives checkpoint saves,
        // and decides when the run is over.
        let mut push_done = !options.push.is_active();
        let mut pull_done = !options.pull.is_active();
        let mut push_level = if options.push.is_active() {
            ActivityLevel::Busy
        } else {
            ActivityLevel::Idle
        };
        let mut pull_level = if options.pull.is_active() {
            ActivityLevel::Busy
        } else {
            ActivityLevel::Idle
        };
        let mut progress = Progress::default();
        let mut save_timer = tokio::time::interval(options.checkpoint_interval.max(
            Duration::from_millis(50),
        ));
        save_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let passive_only = !options.is_active();

        let outcome = loop {
            tokio::select! {
                _ = connection_cancel.cancelled() => {
                    break ConnectionOutcome::StoppedByUser;
                }
                _ = save_timer.tick() => {
                    for (index, checkpointer) in checkpointers.iter().enumerate() {
                        if checkpointer.is_dirty() {
                            save_checkpoint(
                                &shared, &transport, checkpointer, index, passive_only,
                            )
                            .await;
                        }
                    }
                }
                event = events_rx.recv() => {
                    let Some(event) = event else {
                        break ConnectionOutcome::Failed(closed_error());
                    };
                    match event {
                        WorkerEvent::Level { direction, level } => {
                            match direction {
                                Direction::Push => push_level = level,
                                Direction::Pull => pull_level = level,
                            }
                            let overall = if push_level == ActivityLevel::Busy
                                || pull_level == ActivityLevel::Busy
                            {
                                ActivityLevel::Busy
                            } else {
                                ActivityLevel::Idle
                            };
                            shared.publish(Status {
                                level: overall,
                                progress,
                                error: None,
                                flags: StatusFlags {
                                    host_reachable: true,
                                    ..Default::default()
                                },
                            });
                        }
                        WorkerEvent::Progress { completed, total, docs } => {
                            progress.completed += completed;
                            progress.total += total;
                            progress.doc_count += docs;
                        }
                        WorkerEvent::DocsEnded(docs) => {
                            shared.delegate().documents_ended(&docs);
                        }
                        WorkerEvent::BlobProgress(blob) => {
                            shared.delegate().blob_progress(&blob);
                        }
                        WorkerEvent::CaughtUp(direction) => {
                            match direction {
                                Direction::Push => push_done = true,
                                Direction::Pull => pull_done = true,
                            }
                            if push_done && pull_done && !options.is_continuous() {
                                break ConnectionOutcome::Completed;
                            }
                        }
                        WorkerEvent::Failed(err) => {
                            break ConnectionOutcome::Failed(err);
                        }
                        WorkerEvent::ConnectionClosed => {
                            if passive_only {
                                // The active peer hung up; a passive run is
                                // simply over.
                                break ConnectionOutcome::Completed;
                            }
                            break ConnectionOutcome::Failed(closed_error());
                        }
                    }
                }
            }
        };

        // Teardown: stop workers, flush checkpoints, close the transport.
        connection_cancel.cancel();
        shared.set_level(ActivityLevel::Stopping, None, false);
        for (index, checkpointer) in checkpointers.iter().enumerate() {
            if checkpointer.is_dirty() {
                save_checkpoint(&shared, &transport, checkpointer, index, passive_only).await;
            }
        }
        transport.close(1000, "closing").await;
        dispatcher.abort();
        outcome
    }
}

fn closed_error() -> Error {
    Error::Network {
        code: NetworkError::ConnectionReset,
        message: "connection closed".into(),
    }
}

fn retry_delay(attempt: u32, max: Duration) -> Duration {
    let exp = RETRY_BASE.saturating_mul(1u32 << attempt.min(16));
    exp.min(max)
}

/// `getCheckpoint` exchange at connect time.
async fn fetch_peer_checkpoint(
    transport: &Arc<dyn Transport>,
    checkpointer: &Arc<Checkpointer>,
    index: usize,
) -> Result<()> {
    let message = Message::new(profile::GET_CHECKPOINT)
        .with_property("collection", index)
        .with_property("client", checkpointer.checkpoint_id());
    let response = transport.send(message).await?;
    match &response.error {
        Some((_, 404, _)) => {
            checkpointer.compare_with_peer(None, None, None);
            Ok(())
        }
        Some((domain, code, msg)) => Err(Error::Remote {
            domain: domain.clone(),
            code: *code,
            message: msg.clone(),
        }),
        None => {
            let rev = response.property("rev").map(str::to_string);
            let peer = Checkpoint::from_body(&response.body)?;
            checkpointer.compare_with_peer(Some(&peer), rev, None);
            Ok(())
        }
    }
}

/// Saves one dirty checkpoint locally and, for active runs, on the peer.
/// A 409 from the peer re-reads its copy and retries once.
async fn save_checkpoint(
    shared: &Arc<Shared>,
    transport: &Arc<dyn Transport>,
    checkpointer: &Arc<Checkpointer>,
    index: usize,
    passive_only: bool,
) {
    match checkpointer.save_local(shared.store.as_ref()).await {
        Ok(saved) => {
            if !saved || passive_only {
                return;
            }
        }
        Err(err) => {
            warn!(error = %err, "failed to save local checkpoint");
            return;
        }
    }
    for attempt in 0..2 {
        let (rev, body) = match checkpointer.remote_save_payload() {
            Ok(p) => p,
            Err(err) => {
                warn!(error = %err, "failed to encode checkpoint");
                return;
            }
        };
        let message = Message::new(profile::SET_CHECKPOINT)
            .with_property("collection", index)
            .with_property("client", checkpointer.checkpoint_id())
            .with_optional_property("rev", rev)
            .with_body(body);
        match transport.send(message).await {
            Ok(response) => match &response.error {
                None => {
                    checkpointer.set_remote_rev(response.property("rev").map(str::to_string));
                    return;
                }
                Some((_, 409, _)) if attempt == 0 => {
                    debug!("checkpoint conflict; re-reading peer copy");
                    if let Err(err) = refresh_remote_rev(transport, checkpointer, index).await {
                        warn!(error = %err, "could not refresh checkpoint rev");
                        return;
                    }
                }
                Some((domain, code, msg)) => {
                    warn!(domain, code, msg, "peer rejected checkpoint");
                    return;
                }
            },
            Err(err) => {
                debug!(error = %err, "could not save checkpoint on peer");
                return;
            }
        }
    }
}

async fn refresh_remote_rev(
    transport: &Arc<dyn Transport>,
    checkpointer: &Arc<Checkpointer>,
    index: usize,
) -> Result<()> {
    let message = Message::new(profile::GET_CHECKPOINT)
        .with_property("collection", index)
        .with_property("client", checkpointer.checkpoint_id());
    let response = transport.send(message).await?;
    match &response.error {
        Some((_, 404, _)) => {
            checkpointer.set_remote_rev(None);
            Ok(())
        }
        Some((domain, code, msg)) => Err(Error::Remote {
            domain: domain.clone(),
            code: *code,
            message: msg.clone(),
        }),
        None => {
            checkpointer.set_remote_rev(response.property("rev").map(str::to_string));
            Ok(())
        }
    }
}
