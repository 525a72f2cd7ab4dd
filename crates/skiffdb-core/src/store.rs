use async_trait::async_trait;
use uuid::Uuid;

use crate::changes::ChangeReceiver;
use crate::error::Result;
use crate::record::{ContentLevel, Record, RecordUpdate, SetResult};

/// The persistent key-value record store underneath the document layer.
///
/// Implementations provide per-keyspace sequence numbering, CAS writes and
/// nestable transactions (only the outermost is real; aborting it discards
/// every nested write). Actors only ever touch the store through these
/// methods, which carry their own synchronization.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Stable identity of this database, used to derive checkpoint IDs and
    /// the version-vector source ID.
    fn uuid(&self) -> Uuid;

    async fn get(
        &self,
        keyspace: &str,
        doc_id: &str,
        content: ContentLevel,
    ) -> Result<Option<Record>>;

    async fn get_by_sequence(&self, keyspace: &str, sequence: u64) -> Result<Option<Record>>;

    /// CAS write. `expecting` is the `(sequence, subsequence)` pair the
    /// caller last read, or `(0, 0)` for a brand-new record; `None` skips
    /// the check (last writer wins).
    async fn set(
        &self,
        keyspace: &str,
        update: RecordUpdate,
        expecting: Option<(u64, u64)>,
    ) -> Result<SetResult>;

    /// Records with `sequence > since`, ascending, at most `limit` (0 means
    /// no limit).
    async fn enumerate(&self, keyspace: &str, since: u64, limit: usize) -> Result<Vec<Record>>;

    async fn last_sequence(&self, keyspace: &str) -> Result<u64>;

    /// Completely removes a record (revocation purge). Returns whether it
    /// existed.
    async fn purge(&self, keyspace: &str, doc_id: &str) -> Result<bool>;

    async fn begin_transaction(&self) -> Result<()>;
    async fn commit(&self) -> Result<()>;
    async fn abort(&self) -> Result<()>;

    /// Subscribes to commit notifications; the replicator uses this to wake
    /// an idle continuous push.
    fn subscribe_changes(&self) -> ChangeReceiver;
}
