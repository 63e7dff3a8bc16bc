use std::io::Read;
use std::sync::Arc;

use tokio::sync::mpsc;

use velo_storage::BikeStore;
use velo_types::{Bike, EntryKind, LogEntry, VeloError};

use crate::snapshot::{BikeSnapshot, SNAPSHOT_BATCH};
use crate::ApplyOutcome;

/// The deterministic transformer from committed log entries to catalog
/// mutations.
///
/// The consensus layer calls [`Fsm::apply`] strictly in committed-index
/// order, single-threaded per replica; the FSM relies on that and holds no
/// internal locks. Two replicas fed the same log suffix end up with
/// identical catalogs: identity assignment is `max(id) + 1` inside the
/// store transaction, JSON decoding is `serde_json` (duplicate keys
/// last-wins everywhere), and neither clocks nor randomness touch state.
pub struct Fsm<B> {
    store: Arc<B>,
}

impl<B> Clone for Fsm<B> {
    fn clone(&self) -> Self {
        Fsm { store: self.store.clone() }
    }
}

impl<B: BikeStore> Fsm<B> {
    pub fn new(store: Arc<B>) -> Self {
        Fsm { store }
    }

    /// Apply one committed entry.
    ///
    /// Only `Command` entries mutate state; every other kind is a
    /// successful no-op. Entries at or below the applied cursor are skipped
    /// so recovery can replay a log suffix idempotently. Structurally
    /// invalid commands (undecodable payload, empty name) are parked in the
    /// dead-letter keyspace and reported as `Rejected`; the entry is
    /// consumed either way. Operational storage failures propagate as
    /// errors without consuming the entry, so recovery retries them.
    pub async fn apply(&self, entry: &LogEntry) -> Result<ApplyOutcome, VeloError> {
        if entry.kind != EntryKind::Command {
            return Ok(ApplyOutcome::Noop);
        }
        if entry.index <= self.store.last_applied().await? {
            tracing::debug!(index = entry.index, "entry already applied, skipping");
            return Ok(ApplyOutcome::Noop);
        }

        let bike: Bike = match serde_json::from_slice(&entry.data) {
            Ok(bike) => bike,
            Err(e) => {
                let reason = format!("decode command: {e}");
                self.store
                    .record_dead_letter(entry.index, entry.data.clone(), reason.clone())
                    .await?;
                tracing::warn!(index = entry.index, error = %reason, "command dead-lettered");
                return Ok(ApplyOutcome::Rejected(reason));
            }
        };

        match self.store.apply_bikes(entry.index, vec![bike]).await {
            Ok(mut stored) => {
                let bike = stored
                    .pop()
                    .ok_or_else(|| VeloError::Storage("apply returned empty batch".into()))?;
                tracing::debug!(index = entry.index, bike_id = bike.id, "command applied");
                Ok(ApplyOutcome::Applied(bike))
            }
            Err(VeloError::InvalidArgument(msg)) => {
                self.store
                    .record_dead_letter(entry.index, entry.data.clone(), msg.clone())
                    .await?;
                tracing::warn!(index = entry.index, error = %msg, "command dead-lettered");
                Ok(ApplyOutcome::Rejected(msg))
            }
            Err(e) => Err(e),
        }
    }

    /// Point-in-time producer over the current catalog.
    pub fn snapshot(&self) -> BikeSnapshot<B> {
        BikeSnapshot::new(self.store.clone())
    }

    /// Log index of the last command this replica absorbed.
    pub async fn last_applied(&self) -> Result<u64, VeloError> {
        self.store.last_applied().await
    }

    /// Rebuild the catalog from a prior persist stream.
    ///
    /// Wipes the catalog, then upserts bikes from the stream of
    /// self-delimited JSON objects until end-of-stream. Identities ride in
    /// the stream, so `max(id)` afterwards equals the maximum at snapshot
    /// time and subsequent assignment continues correctly.
    pub async fn restore<R: Read + Send + 'static>(&self, reader: R) -> Result<(), VeloError> {
        self.store.reset().await?;

        let (tx, mut rx) = mpsc::channel::<Result<Bike, VeloError>>(SNAPSHOT_BATCH);
        tokio::task::spawn_blocking(move || {
            let stream = serde_json::Deserializer::from_reader(reader).into_iter::<Bike>();
            for item in stream {
                let item = item.map_err(|e| VeloError::Codec(format!("snapshot stream: {e}")));
                let failed = item.is_err();
                if tx.blocking_send(item).is_err() || failed {
                    return;
                }
            }
        });

        let mut restored = 0u64;
        while let Some(item) = rx.recv().await {
            let bike = item?;
            self.store.store_bikes(vec![bike]).await?;
            restored += 1;
        }
        tracing::info!(restored, "snapshot restore complete");
        Ok(())
    }
}
