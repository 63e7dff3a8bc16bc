use std::io::BufReader;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

use velo_storage::{BikeStore, LogStore};
use velo_types::{EntryKind, LogEntry, VeloError};

use crate::fsm::Fsm;
use crate::snapstore::FileSnapshotStore;
use crate::{ApplyOutcome, Cluster, Role};

/// Stable-store key holding the driver's current term.
const CURRENT_TERM_KEY: &[u8] = b"CurrentTerm";

#[derive(Debug, Clone)]
pub struct ClusterOptions {
    /// Client-API address this node answers on; what `leader_api_addr`
    /// reports to the write router.
    pub api_addr: String,
    pub snapshot_interval: Duration,
    /// Un-snapshotted log entries required before a snapshot is taken.
    pub snapshot_threshold: u64,
    /// Snapshots kept on disk.
    pub snapshot_retain: usize,
    /// Entries left behind the snapshot when the head is truncated.
    pub trailing_logs: u64,
}

/// Deterministic single-node consensus driver.
///
/// Fills the consensus library's seat for a cluster of one: it assigns the
/// next log index, appends through the log store, applies through the FSM,
/// recovers from snapshot-plus-suffix on startup, and compacts the log
/// behind threshold-triggered snapshots. Applies are serialised by
/// `apply_lock`; the snapshot pass holds the same lock so every snapshot
/// captures the catalog exactly at its recorded index.
pub struct LocalCluster<L, B> {
    log: Arc<L>,
    bikes: Arc<B>,
    fsm: Fsm<B>,
    snapshots: FileSnapshotStore,
    opts: ClusterOptions,
    term: u64,
    apply_lock: Mutex<()>,
    stop_tx: watch::Sender<bool>,
    snapshot_task: Mutex<Option<JoinHandle<()>>>,
}

impl<L: LogStore, B: BikeStore> LocalCluster<L, B> {
    /// Bring the replica up to date and start the snapshot loop.
    ///
    /// Restores the newest snapshot if one exists, then replays the log
    /// suffix past whatever the catalog has already absorbed. Replay is
    /// idempotent: the FSM skips entries at or below the applied cursor.
    pub async fn recover(
        log: Arc<L>,
        bikes: Arc<B>,
        snapshots: FileSnapshotStore,
        opts: ClusterOptions,
    ) -> Result<Arc<Self>, VeloError> {
        let fsm = Fsm::new(bikes.clone());

        let term = match log.get_u64(CURRENT_TERM_KEY.to_vec()).await {
            Ok(term) => term,
            Err(VeloError::NotFound) => {
                // First boot.
                log.set_u64(CURRENT_TERM_KEY.to_vec(), 1).await?;
                1
            }
            Err(e) => return Err(e),
        };

        let mut replay_from = 1u64;
        if let Some(meta) = snapshots.latest()? {
            let data = snapshots.open_data(&meta)?;
            fsm.restore(BufReader::new(data)).await?;
            replay_from = meta.index + 1;
            tracing::info!(index = meta.index, id = %meta.id, "restored snapshot");
        }

        let first = log.first_index().await?;
        let last = log.last_index().await?;
        let start = replay_from.max(first).max(bikes.last_applied().await? + 1);
        let mut replayed = 0u64;
        if last > 0 && start <= last {
            for index in start..=last {
                let entry = match log.get_log(index).await {
                    Ok(entry) => entry,
                    Err(VeloError::NotFound) => continue,
                    Err(e) => return Err(e),
                };
                fsm.apply(&entry).await?;
                replayed += 1;
            }
        }
        tracing::info!(replayed, last_index = last, "log replay complete");

        let (stop_tx, _) = watch::channel(false);
        let cluster = Arc::new(LocalCluster {
            log,
            bikes,
            fsm,
            snapshots,
            opts,
            term,
            apply_lock: Mutex::new(()),
            stop_tx,
            snapshot_task: Mutex::new(None),
        });
        cluster.clone().spawn_snapshot_loop().await;
        Ok(cluster)
    }

    async fn spawn_snapshot_loop(self: Arc<Self>) {
        let this = self.clone();
        let mut stop_rx = self.stop_tx.subscribe();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(this.opts.snapshot_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = this.maybe_snapshot().await {
                            tracing::warn!(error = %e, "snapshot pass failed");
                        }
                    }
                    _ = stop_rx.changed() => return,
                }
            }
        });
        *self.snapshot_task.lock().await = Some(handle);
    }

    /// Take a snapshot and truncate the log head if the un-snapshotted
    /// suffix has reached the configured threshold.
    pub async fn maybe_snapshot(&self) -> Result<(), VeloError> {
        // Holding the apply lock pins the catalog to `last_applied` for the
        // whole persist, so the stream matches the recorded index.
        let _guard = self.apply_lock.lock().await;

        let last_applied = self.bikes.last_applied().await?;
        let covered = self.snapshots.latest()?.map(|m| m.index).unwrap_or(0);
        if last_applied <= covered || last_applied - covered < self.opts.snapshot_threshold {
            return Ok(());
        }

        let sink = self.snapshots.create(last_applied, self.term)?;
        // On error the sink is dropped unclosed and the partial snapshot
        // directory is removed.
        let sink = self.fsm.snapshot().persist(sink).await?;
        let meta = sink.close()?;
        self.snapshots.retain(self.opts.snapshot_retain)?;

        let first = self.log.first_index().await?;
        if first > 0 && last_applied > self.opts.trailing_logs {
            let cut = last_applied - self.opts.trailing_logs;
            if cut >= first {
                self.log.delete_range(first, cut).await?;
            }
        }
        tracing::info!(index = meta.index, "snapshot taken, log head truncated");
        Ok(())
    }

    async fn propose(&self, payload: Vec<u8>) -> Result<ApplyOutcome, VeloError> {
        let _guard = self.apply_lock.lock().await;
        let index = self
            .log
            .last_index()
            .await?
            .max(self.bikes.last_applied().await?)
            + 1;
        let entry = LogEntry {
            index,
            term: self.term,
            kind: EntryKind::Command,
            data: payload,
            extensions: Vec::new(),
        };
        self.log.store_logs(vec![entry.clone()]).await?;
        self.fsm.apply(&entry).await
    }
}

impl<L: LogStore, B: BikeStore> Cluster for LocalCluster<L, B> {
    async fn role(&self) -> Role {
        // A cluster of one is always its own leader.
        Role::Leader
    }

    async fn leader_api_addr(&self) -> Option<String> {
        Some(self.opts.api_addr.clone())
    }

    async fn apply(
        &self,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> Result<ApplyOutcome, VeloError> {
        if timeout.is_zero() {
            return self.propose(payload).await;
        }
        match tokio::time::timeout(timeout, self.propose(payload)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(VeloError::Timeout),
        }
    }

    async fn shutdown(&self) -> Result<(), VeloError> {
        let _ = self.stop_tx.send(true);
        if let Some(handle) = self.snapshot_task.lock().await.take() {
            let _ = handle.await;
        }
        // Drain any in-flight apply before reporting done.
        let _guard = self.apply_lock.lock().await;
        tracing::info!("cluster driver stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use velo_storage::{FjallBikeStore, FjallLogStore};

    fn options(dir: &std::path::Path) -> (ClusterOptions, FileSnapshotStore) {
        let opts = ClusterOptions {
            api_addr: "127.0.0.1:8001".into(),
            snapshot_interval: Duration::from_secs(3600),
            snapshot_threshold: 5,
            snapshot_retain: 1,
            trailing_logs: 2,
        };
        let snaps = FileSnapshotStore::open(&dir.join("snapshots")).unwrap();
        (opts, snaps)
    }

    async fn start(
        dir: &std::path::Path,
    ) -> (Arc<LocalCluster<FjallLogStore, FjallBikeStore>>, Arc<FjallBikeStore>) {
        let log = Arc::new(FjallLogStore::open(&dir.join("logs")).unwrap());
        let bikes = Arc::new(FjallBikeStore::open(&dir.join("bikes")).unwrap());
        let (opts, snaps) = options(dir);
        let cluster =
            LocalCluster::recover(log, bikes.clone(), snaps, opts).await.unwrap();
        (cluster, bikes)
    }

    fn payload(name: &str) -> Vec<u8> {
        format!(r#"{{"name":"{name}","components":[{{"name":"wheel"}}]}}"#).into_bytes()
    }

    #[tokio::test]
    async fn apply_commits_and_reads_back() {
        let dir = tempfile::tempdir().unwrap();
        let (cluster, bikes) = start(dir.path()).await;

        let outcome = cluster.apply(payload("Trek"), Duration::ZERO).await.unwrap();
        let bike = match outcome {
            ApplyOutcome::Applied(b) => b,
            other => panic!("expected Applied, got {other:?}"),
        };
        assert_eq!(bike.id, 1);
        assert_eq!(bikes.get_bike(1).await.unwrap().name, "Trek");

        cluster.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn restart_replays_without_duplicates() {
        let dir = tempfile::tempdir().unwrap();
        {
            let (cluster, _) = start(dir.path()).await;
            for name in ["Trek", "Giant", "Canyon"] {
                cluster.apply(payload(name), Duration::ZERO).await.unwrap();
            }
            cluster.shutdown().await.unwrap();
        }

        let (cluster, bikes) = start(dir.path()).await;
        let catalog = bikes.get_bikes(u64::MAX, 0).await.unwrap();
        assert_eq!(catalog.len(), 3);

        // Identity assignment continues where it left off.
        let outcome = cluster.apply(payload("Bianchi"), Duration::ZERO).await.unwrap();
        assert!(matches!(outcome, ApplyOutcome::Applied(b) if b.id == 4));
        cluster.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn snapshot_compacts_and_recovery_uses_it() {
        let dir = tempfile::tempdir().unwrap();
        let expected;
        {
            let (cluster, bikes) = start(dir.path()).await;
            for i in 1..=8 {
                cluster.apply(payload(&format!("bike-{i}")), Duration::ZERO).await.unwrap();
            }
            cluster.maybe_snapshot().await.unwrap();

            // threshold met: snapshot at 8, head cut to keep trailing 2
            assert_eq!(cluster.snapshots.latest().unwrap().unwrap().index, 8);
            assert_eq!(cluster.log.first_index().await.unwrap(), 7);
            assert_eq!(cluster.log.last_index().await.unwrap(), 8);

            expected = bikes.get_bikes(u64::MAX, 0).await.unwrap();
            cluster.shutdown().await.unwrap();
        }

        // Recovery restores the snapshot and replays the remaining suffix.
        let (cluster, bikes) = start(dir.path()).await;
        assert_eq!(bikes.get_bikes(u64::MAX, 0).await.unwrap(), expected);

        let outcome = cluster.apply(payload("bike-9"), Duration::ZERO).await.unwrap();
        assert!(matches!(outcome, ApplyOutcome::Applied(b) if b.id == 9));
        cluster.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn below_threshold_takes_no_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let (cluster, _) = start(dir.path()).await;

        cluster.apply(payload("Trek"), Duration::ZERO).await.unwrap();
        cluster.maybe_snapshot().await.unwrap();

        assert!(cluster.snapshots.latest().unwrap().is_none());
        assert_eq!(cluster.log.first_index().await.unwrap(), 1);
        cluster.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn rejected_command_reaches_the_proposer() {
        let dir = tempfile::tempdir().unwrap();
        let (cluster, bikes) = start(dir.path()).await;

        let outcome = cluster.apply(b"not json".to_vec(), Duration::ZERO).await.unwrap();
        assert!(matches!(outcome, ApplyOutcome::Rejected(_)));
        assert_eq!(bikes.dead_letters(10).await.unwrap().len(), 1);

        // The failed entry still consumed an index.
        let outcome = cluster.apply(payload("Trek"), Duration::ZERO).await.unwrap();
        assert!(matches!(outcome, ApplyOutcome::Applied(b) if b.id == 1));
        cluster.shutdown().await.unwrap();
    }
}
