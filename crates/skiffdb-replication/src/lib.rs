//! The SkiffDB replication engine.
//!
//! A replicator is a tree of cooperative actors on one framed connection:
//! the root owns the lifecycle/retry state machine and the checkpointers,
//! and spawns a pusher and a puller per collection. Messages route through
//! an abstract [`Transport`](skiffdb_net::blip::Transport); the passive
//! side of the protocol (answering `subChanges`, serving checkpoints and
//! attachments) lives on the same dispatcher, so any replicator can accept
//! an active peer.

pub mod checkpoint;
pub mod delta;
pub mod encryption;
pub mod events;
pub mod options;
mod passive;
mod puller;
mod pusher;
mod replicator;
mod worker;

pub use checkpoint::{Checkpoint, Checkpointer, SequenceSet, checkpoint_id};
pub use encryption::{EncryptedValue, PropertyDecryptor, PropertyEncryptor};
pub use events::{
    ActivityLevel, BlobProgress, DocEndKind, Direction, NullDelegate, Progress, ReplicatedDoc,
    ReplicationFilter, ReplicatorDelegate, Status, StatusFlags, WireError,
};
pub use options::{AuthOptions, ConflictPolicy, ReplicationMode, ReplicatorOptions};
pub use replicator::{Connector, Replicator, ReplicatorConfig, SingleShotConnector};
