use std::future::Future;

use velo_types::{Bike, LogEntry, VeloError};

use crate::types::DeadLetter;

/// Durable, indexed log plus the small stable key/value namespace the
/// consensus library keeps its own metadata in.
///
/// Methods use RPITIT (`-> impl Future + Send`), matching the `Cluster`
/// trait style in `velo-consensus`. This avoids any `async-trait`
/// dependency.
pub trait LogStore: Send + Sync + 'static {
    /// Lowest present index, or 0 when the log is empty. Never fails on an
    /// empty log.
    fn first_index(&self) -> impl Future<Output = Result<u64, VeloError>> + Send;

    /// Highest present index, or 0 when the log is empty.
    fn last_index(&self) -> impl Future<Output = Result<u64, VeloError>> + Send;

    /// Entry at `index`. Fails with [`VeloError::NotFound`] when absent —
    /// the consensus library's `LogNotFound` sentinel.
    fn get_log(&self, index: u64) -> impl Future<Output = Result<LogEntry, VeloError>> + Send;

    /// Atomically persist all entries: either all become visible or none.
    /// Re-storing an existing index overwrites it (conflict resolution on
    /// divergent follower logs).
    fn store_logs(
        &self,
        entries: Vec<LogEntry>,
    ) -> impl Future<Output = Result<(), VeloError>> + Send;

    /// Remove the closed index range `[min, max]`. Used for both head
    /// truncation (compaction) and tail truncation (conflict resolution).
    /// Indices absent from the range are ignored.
    fn delete_range(&self, min: u64, max: u64)
        -> impl Future<Output = Result<(), VeloError>> + Send;

    /// Upsert an arbitrary byte key in the stable namespace.
    fn set(&self, key: Vec<u8>, value: Vec<u8>)
        -> impl Future<Output = Result<(), VeloError>> + Send;

    /// Read a stable key. Fails with [`VeloError::NotFound`] when the key
    /// is absent — the consensus library uses this to detect first boot,
    /// so it must never be conflated with a storage failure.
    fn get(&self, key: Vec<u8>) -> impl Future<Output = Result<Vec<u8>, VeloError>> + Send;

    /// [`LogStore::set`] with the value big-endian encoded.
    fn set_u64(&self, key: Vec<u8>, value: u64)
        -> impl Future<Output = Result<(), VeloError>> + Send;

    /// [`LogStore::get`] with the value big-endian decoded.
    fn get_u64(&self, key: Vec<u8>) -> impl Future<Output = Result<u64, VeloError>> + Send;
}

/// Transactional bike catalog: the world state produced by replaying the
/// committed log.
pub trait BikeStore: Send + Sync + 'static {
    /// Page of bikes ordered by identity descending (newest first), each
    /// populated with its components in identity-ascending order.
    /// `limit = 0` returns an empty page.
    fn get_bikes(
        &self,
        limit: u64,
        offset: u64,
    ) -> impl Future<Output = Result<Vec<Bike>, VeloError>> + Send;

    /// One bike by identity, with components. [`VeloError::NotFound`] when
    /// no bike has that identity.
    fn get_bike(&self, id: u64) -> impl Future<Output = Result<Bike, VeloError>> + Send;

    /// Upsert each bike by identity within a single transaction. Bikes and
    /// components with identity 0 are assigned `max(existing ids) + 1`,
    /// continuing incrementally through the batch; the returned bikes carry
    /// the assigned identities. On any failure the whole batch rolls back.
    fn store_bikes(
        &self,
        bikes: Vec<Bike>,
    ) -> impl Future<Output = Result<Vec<Bike>, VeloError>> + Send;

    /// [`BikeStore::store_bikes`] driven by the state machine: additionally
    /// records `index` as the last applied log index in the same
    /// transaction, so recovery replays exactly the un-applied suffix.
    fn apply_bikes(
        &self,
        index: u64,
        bikes: Vec<Bike>,
    ) -> impl Future<Output = Result<Vec<Bike>, VeloError>> + Send;

    /// Delete bikes with identity in the closed range `[min, max]` and
    /// their components, in a single transaction.
    fn delete_range(&self, min: u64, max: u64)
        -> impl Future<Output = Result<(), VeloError>> + Send;

    /// Page of bikes with identity strictly greater than `after_id`,
    /// ascending. Keyed pagination for the snapshot producer.
    fn scan_bikes(
        &self,
        after_id: u64,
        limit: u64,
    ) -> impl Future<Output = Result<Vec<Bike>, VeloError>> + Send;

    /// Log index of the last applied command, or 0 if none.
    fn last_applied(&self) -> impl Future<Output = Result<u64, VeloError>> + Send;

    /// Park a command that decoded or applied unsuccessfully, keyed by its
    /// log entry index.
    fn record_dead_letter(
        &self,
        index: u64,
        payload: Vec<u8>,
        error: String,
    ) -> impl Future<Output = Result<(), VeloError>> + Send;

    /// Oldest parked commands, up to `limit`.
    fn dead_letters(
        &self,
        limit: u64,
    ) -> impl Future<Output = Result<Vec<DeadLetter>, VeloError>> + Send;

    /// Wipe the catalog (bikes, components, dead letters, applied cursor)
    /// ahead of a snapshot restore.
    fn reset(&self) -> impl Future<Output = Result<(), VeloError>> + Send;
}
