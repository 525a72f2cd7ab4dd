/// Shared helpers for loopback replication tests: two in-process databases
/// wired together through a transport pair, with a delegate that records
/// everything the replicator reports.
use std::sync::{Arc, Mutex};
use std::time::Duration;

use skiffdb::{
    ActivityLevel, Checkpoint, ContentLevel, Database, DocEndKind, NullDelegate, ReplicatedDoc,
    ReplicatorDelegate, ReplicatorOptions, Status, checkpoint_id, keyspace,
};

pub const TEST_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Default)]
pub struct RecordingDelegate {
    docs: Mutex<Vec<ReplicatedDoc>>,
    levels: Mutex<Vec<ActivityLevel>>,
}

impl RecordingDelegate {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn docs(&self) -> Vec<ReplicatedDoc> {
        self.docs.lock().unwrap().clone()
    }

    pub fn levels(&self) -> Vec<ActivityLevel> {
        self.levels.lock().unwrap().clone()
    }

    pub fn error_count(&self) -> usize {
        self.docs()
            .iter()
            .filter(|d| d.kind == DocEndKind::Error)
            .count()
    }

    pub fn count_of(&self, kind: DocEndKind) -> usize {
        self.docs().iter().filter(|d| d.kind == kind).count()
    }
}

impl ReplicatorDelegate for RecordingDelegate {
    fn status_changed(&self, status: &Status) {
        self.levels.lock().unwrap().push(status.level);
    }

    fn documents_ended(&self, docs: &[ReplicatedDoc]) {
        self.docs.lock().unwrap().extend_from_slice(docs);
    }
}

/// Runs one active replication between `active` and a passive peer to
/// completion, returning the recording delegate.
pub async fn replicate(
    active: &Database,
    passive: &Database,
    options: ReplicatorOptions,
    reset: bool,
) -> Arc<RecordingDelegate> {
    let (active_transport, passive_transport) = skiffdb::loopback_pair(64);
    let passive_repl = passive.replicator(
        ReplicatorOptions::passive(),
        Arc::new(NullDelegate),
        active.uuid_string(),
        passive_transport,
    );
    passive_repl.start(false);

    let delegate = RecordingDelegate::new();
    let active_repl = active.replicator(
        options,
        delegate.clone(),
        passive.uuid_string(),
        active_transport,
    );
    tokio::time::timeout(TEST_TIMEOUT, active_repl.run(reset))
        .await
        .expect("active replicator finished");
    tokio::time::timeout(
        TEST_TIMEOUT,
        passive_repl.wait_for_level(ActivityLevel::Stopped),
    )
    .await
    .expect("passive replicator stopped");
    delegate
}

pub async fn push(active: &Database, passive: &Database) -> Arc<RecordingDelegate> {
    replicate(
        active,
        passive,
        ReplicatorOptions::push(skiffdb::ReplicationMode::OneShot),
        false,
    )
    .await
}

pub async fn pull(active: &Database, passive: &Database) -> Arc<RecordingDelegate> {
    replicate(
        active,
        passive,
        ReplicatorOptions::pull(skiffdb::ReplicationMode::OneShot),
        false,
    )
    .await
}

/// The active side's durable checkpoint toward `passive`.
pub async fn local_checkpoint(active: &Database, passive: &Database) -> Option<Checkpoint> {
    let id = checkpoint_id(
        &active.uuid_string(),
        &passive.uuid_string(),
        active.collection(),
    );
    let record = active
        .store()
        .get(keyspace::CHECKPOINTS, &id, ContentLevel::EntireBody)
        .await
        .unwrap();
    record.map(|r| Checkpoint::from_body(&r.body).unwrap())
}

/// The passive side's mirror of the active peer's checkpoint.
pub async fn peer_checkpoint(passive: &Database, active: &Database) -> Option<Checkpoint> {
    let id = checkpoint_id(
        &active.uuid_string(),
        &passive.uuid_string(),
        active.collection(),
    );
    let record = passive
        .store()
        .get(keyspace::PEER_CHECKPOINTS, &id, ContentLevel::EntireBody)
        .await
        .unwrap();
    record.map(|r| Checkpoint::from_body(&r.body).unwrap())
}
