use std::io::Write;
use std::sync::Arc;

use tokio::sync::mpsc;

use velo_storage::BikeStore;
use velo_types::{Bike, VeloError};

/// Page size for the producer and capacity of the handoff channel.
pub const SNAPSHOT_BATCH: usize = 500;

/// Streaming point-in-time serialisation of the whole catalog.
///
/// A producer task pages the catalog id-ascending in batches of
/// [`SNAPSHOT_BATCH`] and pushes bikes onto a bounded channel; the consumer
/// serialises each as a self-delimited JSON object and writes it to the
/// sink. A short page ends the stream (the producer drops its sender). Any
/// producer or sink error surfaces out of [`BikeSnapshot::persist`], at
/// which point the caller cancels the sink and discards the partial file;
/// sink cancellation from the outside shows up here as a write error, which
/// stops the stream promptly.
pub struct BikeSnapshot<B> {
    store: Arc<B>,
}

impl<B: BikeStore> BikeSnapshot<B> {
    pub fn new(store: Arc<B>) -> Self {
        BikeSnapshot { store }
    }

    /// Stream the catalog into `sink`, returning the sink for the caller to
    /// close (commit) on success. On error the sink is dropped here, which
    /// for a file-backed sink is the cancel path.
    pub async fn persist<W: Write + Send + 'static>(&self, mut sink: W) -> Result<W, VeloError> {
        let (tx, mut rx) = mpsc::channel::<Result<Bike, VeloError>>(SNAPSHOT_BATCH);

        let store = self.store.clone();
        tokio::spawn(async move {
            let mut after_id = 0u64;
            loop {
                let page = match store.scan_bikes(after_id, SNAPSHOT_BATCH as u64).await {
                    Ok(page) => page,
                    Err(e) => {
                        let _ = tx.send(Err(e)).await;
                        return;
                    }
                };
                let len = page.len();
                for bike in page {
                    after_id = bike.id;
                    if tx.send(Ok(bike)).await.is_err() {
                        // Consumer hung up (sink error); stop paging.
                        return;
                    }
                }
                if len < SNAPSHOT_BATCH {
                    return;
                }
            }
        });

        let consumer = tokio::task::spawn_blocking(move || -> Result<(W, u64), VeloError> {
            let mut persisted = 0u64;
            while let Some(item) = rx.blocking_recv() {
                let bike = item?;
                let data =
                    serde_json::to_vec(&bike).map_err(|e| VeloError::Codec(e.to_string()))?;
                sink.write_all(&data).map_err(|e| VeloError::Storage(e.to_string()))?;
                persisted += 1;
            }
            sink.flush().map_err(|e| VeloError::Storage(e.to_string()))?;
            Ok((sink, persisted))
        });

        let (sink, persisted) =
            consumer.await.map_err(|e| VeloError::Storage(e.to_string()))??;
        tracing::info!(persisted, "snapshot persisted");
        Ok(sink)
    }
}
