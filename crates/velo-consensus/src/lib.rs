use std::future::Future;
use std::time::Duration;

use velo_types::{Bike, VeloError};

pub mod fsm;
pub mod local;
pub mod snapshot;
pub mod snapstore;

pub use fsm::Fsm;
pub use local::{ClusterOptions, LocalCluster};
pub use snapshot::BikeSnapshot;
pub use snapstore::{FileSnapshotSink, FileSnapshotStore, SnapshotMeta};

/// Stable roles of a node in the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Leader,
    Follower,
}

/// What applying one committed command produced.
#[derive(Debug, Clone)]
pub enum ApplyOutcome {
    /// The command upserted this bike (identities populated).
    Applied(Bike),
    /// The command was consumed but could not be applied; the error travels
    /// back to the proposer, never into the consensus layer.
    Rejected(String),
    /// A non-command entry, or an entry this replica already absorbed.
    Noop,
}

// ---------------------------------------------------------------------------
// Cluster trait
// Uses RPITIT (Return Position Impl Trait In Trait, stable since Rust 1.75).
// The explicit `+ Send` bound on each future ensures generic callers can
// `.await` across thread boundaries.
// ---------------------------------------------------------------------------

/// The seam between the core and the consensus library.
///
/// The write router proposes through this; everything behind it (election,
/// replication RPCs, membership) belongs to the library, not the core.
pub trait Cluster: Send + Sync + 'static {
    fn role(&self) -> impl Future<Output = Role> + Send;

    /// Client-API address of the current leader, or `None` while the
    /// cluster has no leader (e.g. an election in progress).
    fn leader_api_addr(&self) -> impl Future<Output = Option<String>> + Send;

    /// Propose a command payload and wait for the applied outcome.
    /// A zero `timeout` means wait indefinitely; after a timeout the local
    /// effect on the log is indeterminate (the entry may still commit).
    fn apply(
        &self,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> impl Future<Output = Result<ApplyOutcome, VeloError>> + Send;

    /// Stop background work and wait for in-flight apply/snapshot to drain.
    fn shutdown(&self) -> impl Future<Output = Result<(), VeloError>> + Send;
}
