use std::path::Path;
use std::sync::Arc;

use velo_types::{Bike, Component, LogEntry, VeloError};

use crate::keys::{
    bike_key, component_index_key, component_index_prefix, component_key, dead_letter_key,
    log_key, meta_key,
};
use crate::traits::{BikeStore, LogStore};
use crate::types::{ComponentRow, DeadLetter};

fn encode<T: serde::Serialize>(val: &T) -> Result<Vec<u8>, VeloError> {
    bincode::serde::encode_to_vec(val, bincode::config::standard())
        .map_err(|e| VeloError::Codec(e.to_string()))
}

fn decode<T: for<'de> serde::Deserialize<'de>>(bytes: &[u8]) -> Result<T, VeloError> {
    bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map(|(v, _)| v)
        .map_err(|e| VeloError::Codec(e.to_string()))
}

fn fjall_err(e: fjall::Error) -> VeloError {
    VeloError::Storage(e.to_string())
}

/// Highest 8-byte key present in a keyspace, decoded as u64.
fn max_id(ks: &fjall::Keyspace) -> Result<Option<u64>, VeloError> {
    match ks.range(log_key(0).to_vec()..=log_key(u64::MAX).to_vec()).next_back() {
        Some(guard) => {
            let (k, _) = guard.into_inner().map_err(fjall_err)?;
            let id_bytes: [u8; 8] =
                k[..8].try_into().map_err(|_| VeloError::Storage("short id key".into()))?;
            Ok(Some(u64::from_be_bytes(id_bytes)))
        }
        None => Ok(None),
    }
}

// ---------------------------------------------------------------------------
// FjallLogStore — the log store file
// ---------------------------------------------------------------------------

/// The two keyspaces of the log store file. One fjall database so that a
/// `store_logs` batch is a single atomic commit.
struct LogDb {
    db: fjall::Database,
    /// Replicated log entries: `index(8)` → bincode(LogEntry)
    log: fjall::Keyspace,
    /// Consensus metadata (current term, voted-for, …): raw key → raw value
    stable: fjall::Keyspace,
}

/// [`LogStore`] backed by fjall.
///
/// All blocking I/O is wrapped in `tokio::task::spawn_blocking`.
pub struct FjallLogStore {
    inner: Arc<LogDb>,
}

impl FjallLogStore {
    /// Open (or create) the log store file at `path`.
    pub fn open(path: &Path) -> Result<Self, VeloError> {
        let db = fjall::Database::builder(path).open().map_err(fjall_err)?;
        let log = db.keyspace("log", fjall::KeyspaceCreateOptions::default).map_err(fjall_err)?;
        let stable =
            db.keyspace("stable", fjall::KeyspaceCreateOptions::default).map_err(fjall_err)?;
        Ok(FjallLogStore { inner: Arc::new(LogDb { db, log, stable }) })
    }
}

impl LogStore for FjallLogStore {
    async fn first_index(&self) -> Result<u64, VeloError> {
        let store = self.inner.clone();
        tokio::task::spawn_blocking(move || -> Result<u64, VeloError> {
            match store.log.range(log_key(0).to_vec()..=log_key(u64::MAX).to_vec()).next() {
                Some(guard) => {
                    let (k, _) = guard.into_inner().map_err(fjall_err)?;
                    let idx: [u8; 8] = k[..8]
                        .try_into()
                        .map_err(|_| VeloError::Storage("short log key".into()))?;
                    Ok(u64::from_be_bytes(idx))
                }
                None => Ok(0),
            }
        })
        .await
        .map_err(|e| VeloError::Storage(e.to_string()))?
    }

    async fn last_index(&self) -> Result<u64, VeloError> {
        let store = self.inner.clone();
        tokio::task::spawn_blocking(move || Ok(max_id(&store.log)?.unwrap_or(0)))
            .await
            .map_err(|e| VeloError::Storage(e.to_string()))?
    }

    async fn get_log(&self, index: u64) -> Result<LogEntry, VeloError> {
        let store = self.inner.clone();
        tokio::task::spawn_blocking(move || -> Result<LogEntry, VeloError> {
            match store.log.get(log_key(index)).map_err(fjall_err)? {
                Some(b) => decode::<LogEntry>(&b),
                None => Err(VeloError::NotFound),
            }
        })
        .await
        .map_err(|e| VeloError::Storage(e.to_string()))?
    }

    async fn store_logs(&self, entries: Vec<LogEntry>) -> Result<(), VeloError> {
        let store = self.inner.clone();
        tokio::task::spawn_blocking(move || -> Result<(), VeloError> {
            let mut batch = store.db.batch();
            for entry in &entries {
                batch.insert(&store.log, log_key(entry.index).to_vec(), encode(entry)?);
            }
            batch.commit().map_err(fjall_err)
        })
        .await
        .map_err(|e| VeloError::Storage(e.to_string()))?
    }

    async fn delete_range(&self, min: u64, max: u64) -> Result<(), VeloError> {
        let store = self.inner.clone();
        tokio::task::spawn_blocking(move || -> Result<(), VeloError> {
            let keys: Vec<Vec<u8>> = store
                .log
                .range(log_key(min).to_vec()..=log_key(max).to_vec())
                .map(|g| g.into_inner().map(|(k, _)| k.to_vec()).map_err(fjall_err))
                .collect::<Result<_, _>>()?;

            if !keys.is_empty() {
                let mut batch = store.db.batch();
                for k in keys {
                    batch.remove(&store.log, k);
                }
                batch.commit().map_err(fjall_err)?;
            }
            Ok(())
        })
        .await
        .map_err(|e| VeloError::Storage(e.to_string()))?
    }

    async fn set(&self, key: Vec<u8>, value: Vec<u8>) -> Result<(), VeloError> {
        let store = self.inner.clone();
        tokio::task::spawn_blocking(move || store.stable.insert(key, value).map_err(fjall_err))
            .await
            .map_err(|e| VeloError::Storage(e.to_string()))?
    }

    async fn get(&self, key: Vec<u8>) -> Result<Vec<u8>, VeloError> {
        let store = self.inner.clone();
        tokio::task::spawn_blocking(move || -> Result<Vec<u8>, VeloError> {
            match store.stable.get(key).map_err(fjall_err)? {
                Some(v) => Ok(v.to_vec()),
                None => Err(VeloError::NotFound),
            }
        })
        .await
        .map_err(|e| VeloError::Storage(e.to_string()))?
    }

    async fn set_u64(&self, key: Vec<u8>, value: u64) -> Result<(), VeloError> {
        self.set(key, value.to_be_bytes().to_vec()).await
    }

    async fn get_u64(&self, key: Vec<u8>) -> Result<u64, VeloError> {
        let v = self.get(key).await?;
        let bytes: [u8; 8] = v
            .as_slice()
            .try_into()
            .map_err(|_| VeloError::Storage("stable value is not 8 bytes".into()))?;
        Ok(u64::from_be_bytes(bytes))
    }
}

// ---------------------------------------------------------------------------
// FjallBikeStore — the bike store file
// ---------------------------------------------------------------------------

/// The keyspaces of the bike store file. One fjall database so that a
/// catalog mutation (bikes, components, ownership index, applied cursor) is
/// a single atomic commit.
struct CatalogDb {
    db: fjall::Database,
    /// Bike catalog: `bike_id(8)` → bincode(name)
    bike: fjall::Keyspace,
    /// Components: `component_id(8)` → bincode(ComponentRow)
    component: fjall::Keyspace,
    /// Ownership index: `bike_id(8) ++ component_id(8)` → b""
    component_by_bike: fjall::Keyspace,
    /// Commands that failed to apply: `log_index(8)` → bincode(DeadLetter)
    dead_letter: fjall::Keyspace,
    /// Catalog bookkeeping (`last_applied`): label → bincode(u64)
    meta: fjall::Keyspace,
}

/// One bike's components, identity-ascending, via the ownership index.
fn load_components(store: &CatalogDb, bike_id: u64) -> Result<Vec<Component>, VeloError> {
    let mut components = Vec::new();
    for guard in store.component_by_bike.prefix(component_index_prefix(bike_id)) {
        let (k, _) = guard.into_inner().map_err(fjall_err)?;
        let id_bytes: [u8; 8] = k[8..16]
            .try_into()
            .map_err(|_| VeloError::Storage("short component index key".into()))?;
        let component_id = u64::from_be_bytes(id_bytes);
        let row = store
            .component
            .get(component_key(component_id))
            .map_err(fjall_err)?
            .ok_or_else(|| VeloError::Storage("component index points at nothing".into()))?;
        let row: ComponentRow = decode(&row)?;
        components.push(Component { id: component_id, bike_id: row.bike_id, name: row.name });
    }
    Ok(components)
}

/// Upsert a batch of bikes in one atomic write batch.
///
/// Identity assignment is a pure function of the current store contents:
/// `max(id) + 1` at batch start, continuing incrementally through the
/// batch. `apply_index` additionally records the log index that produced
/// this mutation in the same batch, so the applied cursor can never run
/// ahead of or behind the data it describes.
fn upsert_bikes(
    store: &CatalogDb,
    mut bikes: Vec<Bike>,
    apply_index: Option<u64>,
) -> Result<Vec<Bike>, VeloError> {
    let mut next_bike_id = max_id(&store.bike)?.map_or(1, |m| m + 1);
    let mut next_component_id = max_id(&store.component)?.map_or(1, |m| m + 1);

    let mut batch = store.db.batch();
    for bike in &mut bikes {
        if bike.name.is_empty() {
            return Err(VeloError::InvalidArgument("bike name must not be empty".into()));
        }
        if bike.id == 0 {
            bike.id = next_bike_id;
            next_bike_id += 1;
        } else if bike.id >= next_bike_id {
            next_bike_id = bike.id + 1;
        }
        batch.insert(&store.bike, bike_key(bike.id).to_vec(), encode(&bike.name)?);

        for component in &mut bike.components {
            component.bike_id = bike.id;
            if component.id == 0 {
                component.id = next_component_id;
                next_component_id += 1;
            } else {
                if component.id >= next_component_id {
                    next_component_id = component.id + 1;
                }
                // Re-homing an existing component invalidates its old index row.
                if let Some(existing) =
                    store.component.get(component_key(component.id)).map_err(fjall_err)?
                {
                    let existing: ComponentRow = decode(&existing)?;
                    if existing.bike_id != component.bike_id {
                        batch.remove(
                            &store.component_by_bike,
                            component_index_key(existing.bike_id, component.id).to_vec(),
                        );
                    }
                }
            }
            batch.insert(
                &store.component,
                component_key(component.id).to_vec(),
                encode(&ComponentRow {
                    bike_id: component.bike_id,
                    name: component.name.clone(),
                })?,
            );
            batch.insert(
                &store.component_by_bike,
                component_index_key(bike.id, component.id).to_vec(),
                Vec::new(),
            );
        }
    }
    if let Some(index) = apply_index {
        batch.insert(&store.meta, meta_key("last_applied"), encode(&index)?);
    }
    batch.commit().map_err(fjall_err)?;
    Ok(bikes)
}

/// [`BikeStore`] backed by fjall.
pub struct FjallBikeStore {
    inner: Arc<CatalogDb>,
}

impl FjallBikeStore {
    /// Open (or create) the bike store file at `path`.
    pub fn open(path: &Path) -> Result<Self, VeloError> {
        let db = fjall::Database::builder(path).open().map_err(fjall_err)?;
        let bike =
            db.keyspace("bike", fjall::KeyspaceCreateOptions::default).map_err(fjall_err)?;
        let component =
            db.keyspace("component", fjall::KeyspaceCreateOptions::default).map_err(fjall_err)?;
        let component_by_bike = db
            .keyspace("component_by_bike", fjall::KeyspaceCreateOptions::default)
            .map_err(fjall_err)?;
        let dead_letter = db
            .keyspace("dead_letter", fjall::KeyspaceCreateOptions::default)
            .map_err(fjall_err)?;
        let meta =
            db.keyspace("meta", fjall::KeyspaceCreateOptions::default).map_err(fjall_err)?;
        Ok(FjallBikeStore {
            inner: Arc::new(CatalogDb { db, bike, component, component_by_bike, dead_letter, meta }),
        })
    }
}

impl BikeStore for FjallBikeStore {
    async fn get_bikes(&self, limit: u64, offset: u64) -> Result<Vec<Bike>, VeloError> {
        let store = self.inner.clone();
        tokio::task::spawn_blocking(move || -> Result<Vec<Bike>, VeloError> {
            let mut page = Vec::new();
            let rows = store
                .bike
                .range(bike_key(0).to_vec()..=bike_key(u64::MAX).to_vec())
                .rev()
                .skip(offset as usize)
                .take(limit as usize);
            for guard in rows {
                let (k, v) = guard.into_inner().map_err(fjall_err)?;
                let id_bytes: [u8; 8] = k[..8]
                    .try_into()
                    .map_err(|_| VeloError::Storage("short bike key".into()))?;
                let id = u64::from_be_bytes(id_bytes);
                let name: String = decode(&v)?;
                let components = load_components(&store, id)?;
                page.push(Bike { id, name, components });
            }
            Ok(page)
        })
        .await
        .map_err(|e| VeloError::Storage(e.to_string()))?
    }

    async fn get_bike(&self, id: u64) -> Result<Bike, VeloError> {
        let store = self.inner.clone();
        tokio::task::spawn_blocking(move || -> Result<Bike, VeloError> {
            let name = match store.bike.get(bike_key(id)).map_err(fjall_err)? {
                Some(v) => decode::<String>(&v)?,
                None => return Err(VeloError::NotFound),
            };
            let components = load_components(&store, id)?;
            Ok(Bike { id, name, components })
        })
        .await
        .map_err(|e| VeloError::Storage(e.to_string()))?
    }

    async fn store_bikes(&self, bikes: Vec<Bike>) -> Result<Vec<Bike>, VeloError> {
        let store = self.inner.clone();
        tokio::task::spawn_blocking(move || upsert_bikes(&store, bikes, None))
            .await
            .map_err(|e| VeloError::Storage(e.to_string()))?
    }

    async fn apply_bikes(&self, index: u64, bikes: Vec<Bike>) -> Result<Vec<Bike>, VeloError> {
        let store = self.inner.clone();
        tokio::task::spawn_blocking(move || upsert_bikes(&store, bikes, Some(index)))
            .await
            .map_err(|e| VeloError::Storage(e.to_string()))?
    }

    async fn delete_range(&self, min: u64, max: u64) -> Result<(), VeloError> {
        let store = self.inner.clone();
        tokio::task::spawn_blocking(move || -> Result<(), VeloError> {
            let ids: Vec<u64> = store
                .bike
                .range(bike_key(min).to_vec()..=bike_key(max).to_vec())
                .map(|g| {
                    g.into_inner().map_err(fjall_err).and_then(|(k, _)| {
                        let id: [u8; 8] = k[..8]
                            .try_into()
                            .map_err(|_| VeloError::Storage("short bike key".into()))?;
                        Ok(u64::from_be_bytes(id))
                    })
                })
                .collect::<Result<_, _>>()?;

            let mut batch = store.db.batch();
            for id in ids {
                batch.remove(&store.bike, bike_key(id).to_vec());
                for guard in store.component_by_bike.prefix(component_index_prefix(id)) {
                    let (k, _) = guard.into_inner().map_err(fjall_err)?;
                    let comp_bytes: [u8; 8] = k[8..16]
                        .try_into()
                        .map_err(|_| VeloError::Storage("short component index key".into()))?;
                    let component_id = u64::from_be_bytes(comp_bytes);
                    batch.remove(&store.component, component_key(component_id).to_vec());
                    batch.remove(&store.component_by_bike, k.to_vec());
                }
            }
            batch.commit().map_err(fjall_err)
        })
        .await
        .map_err(|e| VeloError::Storage(e.to_string()))?
    }

    async fn scan_bikes(&self, after_id: u64, limit: u64) -> Result<Vec<Bike>, VeloError> {
        let store = self.inner.clone();
        tokio::task::spawn_blocking(move || -> Result<Vec<Bike>, VeloError> {
            let start = after_id.saturating_add(1);
            let mut page = Vec::new();
            let rows = store
                .bike
                .range(bike_key(start).to_vec()..=bike_key(u64::MAX).to_vec())
                .take(limit as usize);
            for guard in rows {
                let (k, v) = guard.into_inner().map_err(fjall_err)?;
                let id_bytes: [u8; 8] = k[..8]
                    .try_into()
                    .map_err(|_| VeloError::Storage("short bike key".into()))?;
                let id = u64::from_be_bytes(id_bytes);
                let name: String = decode(&v)?;
                let components = load_components(&store, id)?;
                page.push(Bike { id, name, components });
            }
            Ok(page)
        })
        .await
        .map_err(|e| VeloError::Storage(e.to_string()))?
    }

    async fn last_applied(&self) -> Result<u64, VeloError> {
        let store = self.inner.clone();
        tokio::task::spawn_blocking(move || -> Result<u64, VeloError> {
            match store.meta.get(meta_key("last_applied")).map_err(fjall_err)? {
                Some(b) => decode::<u64>(&b),
                None => Ok(0),
            }
        })
        .await
        .map_err(|e| VeloError::Storage(e.to_string()))?
    }

    async fn record_dead_letter(
        &self,
        index: u64,
        payload: Vec<u8>,
        error: String,
    ) -> Result<(), VeloError> {
        let store = self.inner.clone();
        tokio::task::spawn_blocking(move || -> Result<(), VeloError> {
            let letter = DeadLetter { index, payload, error };
            // The entry is consumed even though it failed: the applied
            // cursor advances in the same batch.
            let mut batch = store.db.batch();
            batch.insert(&store.dead_letter, dead_letter_key(index).to_vec(), encode(&letter)?);
            batch.insert(&store.meta, meta_key("last_applied"), encode(&index)?);
            batch.commit().map_err(fjall_err)
        })
        .await
        .map_err(|e| VeloError::Storage(e.to_string()))?
    }

    async fn dead_letters(&self, limit: u64) -> Result<Vec<DeadLetter>, VeloError> {
        let store = self.inner.clone();
        tokio::task::spawn_blocking(move || -> Result<Vec<DeadLetter>, VeloError> {
            store
                .dead_letter
                .range(dead_letter_key(0).to_vec()..=dead_letter_key(u64::MAX).to_vec())
                .take(limit as usize)
                .map(|g| {
                    g.into_inner().map_err(fjall_err).and_then(|(_, v)| decode::<DeadLetter>(&v))
                })
                .collect()
        })
        .await
        .map_err(|e| VeloError::Storage(e.to_string()))?
    }

    async fn reset(&self) -> Result<(), VeloError> {
        let store = self.inner.clone();
        tokio::task::spawn_blocking(move || -> Result<(), VeloError> {
            let mut batch = store.db.batch();
            for ks in [
                &store.bike,
                &store.component,
                &store.component_by_bike,
                &store.dead_letter,
                &store.meta,
            ] {
                let keys: Vec<Vec<u8>> = ks
                    .range(Vec::new()..)
                    .map(|g| g.into_inner().map(|(k, _)| k.to_vec()).map_err(fjall_err))
                    .collect::<Result<_, _>>()?;
                for k in keys {
                    batch.remove(ks, k);
                }
            }
            batch.commit().map_err(fjall_err)
        })
        .await
        .map_err(|e| VeloError::Storage(e.to_string()))?
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use velo_types::EntryKind;

    fn make_entry(index: u64, term: u64) -> LogEntry {
        LogEntry { index, term, kind: EntryKind::Command, data: Vec::new(), extensions: Vec::new() }
    }

    fn make_bike(name: &str, components: &[&str]) -> Bike {
        Bike {
            id: 0,
            name: name.into(),
            components: components
                .iter()
                .map(|n| Component { id: 0, bike_id: 0, name: (*n).into() })
                .collect(),
        }
    }

    fn open_log(dir: &std::path::Path) -> FjallLogStore {
        FjallLogStore::open(dir).expect("open log store")
    }

    fn open_bikes(dir: &std::path::Path) -> FjallBikeStore {
        FjallBikeStore::open(dir).expect("open bike store")
    }

    // -----------------------------------------------------------------------
    // FjallLogStore
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn log_store_empty_indices_are_zero() {
        let dir = tempfile::tempdir().unwrap();
        let log = open_log(dir.path());
        assert_eq!(log.first_index().await.unwrap(), 0);
        assert_eq!(log.last_index().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn log_store_basic() {
        let dir = tempfile::tempdir().unwrap();
        let log = open_log(dir.path());

        log.store_logs(vec![make_entry(1, 1), make_entry(2, 1), make_entry(3, 1)])
            .await
            .unwrap();

        assert_eq!(log.first_index().await.unwrap(), 1);
        assert_eq!(log.last_index().await.unwrap(), 3);

        let e = log.get_log(2).await.unwrap();
        assert_eq!(e.index, 2);
        assert_eq!(e.term, 1);

        assert!(matches!(log.get_log(9).await, Err(VeloError::NotFound)));
    }

    #[tokio::test]
    async fn log_store_overwrite_by_index() {
        let dir = tempfile::tempdir().unwrap();
        let log = open_log(dir.path());

        log.store_logs(vec![make_entry(5, 1)]).await.unwrap();
        log.store_logs(vec![make_entry(5, 3)]).await.unwrap();

        assert_eq!(log.get_log(5).await.unwrap().term, 3);
        assert_eq!(log.first_index().await.unwrap(), 5);
        assert_eq!(log.last_index().await.unwrap(), 5);
    }

    #[tokio::test]
    async fn log_store_delete_range_then_restore() {
        let dir = tempfile::tempdir().unwrap();
        let log = open_log(dir.path());

        log.store_logs((1..=5).map(|i| make_entry(i, 1)).collect()).await.unwrap();
        log.delete_range(1, 5).await.unwrap();
        assert_eq!(log.first_index().await.unwrap(), 0);
        assert_eq!(log.last_index().await.unwrap(), 0);

        // Deleting an empty range is not an error.
        log.delete_range(1, 100).await.unwrap();

        log.store_logs(vec![make_entry(42, 7)]).await.unwrap();
        assert_eq!(log.first_index().await.unwrap(), 42);
        assert_eq!(log.last_index().await.unwrap(), 42);
    }

    #[tokio::test]
    async fn log_store_head_truncation_keeps_tail() {
        let dir = tempfile::tempdir().unwrap();
        let log = open_log(dir.path());

        log.store_logs((1..=10).map(|i| make_entry(i, 1)).collect()).await.unwrap();
        log.delete_range(1, 7).await.unwrap();

        assert_eq!(log.first_index().await.unwrap(), 8);
        assert_eq!(log.last_index().await.unwrap(), 10);
        assert!(matches!(log.get_log(7).await, Err(VeloError::NotFound)));
    }

    #[tokio::test]
    async fn stable_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let log = open_log(dir.path());

        assert!(matches!(log.get(b"CurrentTerm".to_vec()).await, Err(VeloError::NotFound)));

        log.set(b"CurrentTerm".to_vec(), b"seven".to_vec()).await.unwrap();
        assert_eq!(log.get(b"CurrentTerm".to_vec()).await.unwrap(), b"seven");

        // Upsert semantics.
        log.set(b"CurrentTerm".to_vec(), b"eight".to_vec()).await.unwrap();
        assert_eq!(log.get(b"CurrentTerm".to_vec()).await.unwrap(), b"eight");
    }

    #[tokio::test]
    async fn stable_store_u64_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let log = open_log(dir.path());

        for v in [0u64, 1, 255, 256, u64::MAX - 1, u64::MAX] {
            log.set_u64(b"k".to_vec(), v).await.unwrap();
            assert_eq!(log.get_u64(b"k".to_vec()).await.unwrap(), v);
        }
        // Big-endian on the wire.
        assert_eq!(log.get(b"k".to_vec()).await.unwrap(), u64::MAX.to_be_bytes());
    }

    // -----------------------------------------------------------------------
    // FjallBikeStore
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn store_bikes_assigns_increasing_identities() {
        let dir = tempfile::tempdir().unwrap();
        let bikes = open_bikes(dir.path());

        let stored = bikes
            .store_bikes(vec![make_bike("Trek", &["wheel", "saddle"]), make_bike("Giant", &[])])
            .await
            .unwrap();

        assert_eq!(stored[0].id, 1);
        assert_eq!(stored[1].id, 2);
        assert_eq!(stored[0].components[0].id, 1);
        assert_eq!(stored[0].components[1].id, 2);
        assert_eq!(stored[0].components[0].bike_id, 1);

        // Assignment continues from the stored maximum on the next batch.
        let more = bikes.store_bikes(vec![make_bike("Canyon", &["fork"])]).await.unwrap();
        assert_eq!(more[0].id, 3);
        assert_eq!(more[0].components[0].id, 3);
    }

    #[tokio::test]
    async fn stored_bike_reads_back_deep_equal() {
        let dir = tempfile::tempdir().unwrap();
        let bikes = open_bikes(dir.path());

        let stored =
            bikes.store_bikes(vec![make_bike("Trek", &["wheel", "saddle"])]).await.unwrap();
        let read = bikes.get_bike(stored[0].id).await.unwrap();
        assert_eq!(read, stored[0]);
    }

    #[tokio::test]
    async fn upsert_by_identity_replaces_name() {
        let dir = tempfile::tempdir().unwrap();
        let bikes = open_bikes(dir.path());

        bikes.store_bikes(vec![make_bike("Trek", &[])]).await.unwrap();
        let renamed = Bike { id: 1, name: "Trek Madone".into(), components: Vec::new() };
        bikes.store_bikes(vec![renamed]).await.unwrap();

        assert_eq!(bikes.get_bike(1).await.unwrap().name, "Trek Madone");
        // No fresh identity was minted for the upsert.
        assert_eq!(bikes.store_bikes(vec![make_bike("Giant", &[])]).await.unwrap()[0].id, 2);
    }

    #[tokio::test]
    async fn empty_name_rolls_back_whole_batch() {
        let dir = tempfile::tempdir().unwrap();
        let bikes = open_bikes(dir.path());

        let res =
            bikes.store_bikes(vec![make_bike("Trek", &["wheel"]), make_bike("", &[])]).await;
        assert!(matches!(res, Err(VeloError::InvalidArgument(_))));
        assert!(bikes.get_bikes(10, 0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn get_bikes_newest_first_with_ascending_components() {
        let dir = tempfile::tempdir().unwrap();
        let bikes = open_bikes(dir.path());

        for i in 1..=5 {
            bikes
                .store_bikes(vec![make_bike(&format!("bike-{i}"), &["front", "rear"])])
                .await
                .unwrap();
        }

        let page = bikes.get_bikes(3, 0).await.unwrap();
        let ids: Vec<u64> = page.iter().map(|b| b.id).collect();
        assert_eq!(ids, vec![5, 4, 3]);
        for bike in &page {
            let comp_ids: Vec<u64> = bike.components.iter().map(|c| c.id).collect();
            let mut sorted = comp_ids.clone();
            sorted.sort_unstable();
            assert_eq!(comp_ids, sorted);
        }

        let next = bikes.get_bikes(3, 3).await.unwrap();
        let ids: Vec<u64> = next.iter().map(|b| b.id).collect();
        assert_eq!(ids, vec![2, 1]);

        assert!(bikes.get_bikes(0, 0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn delete_range_removes_bikes_and_components() {
        let dir = tempfile::tempdir().unwrap();
        let bikes = open_bikes(dir.path());

        for i in 1..=10 {
            bikes.store_bikes(vec![make_bike(&format!("bike-{i}"), &["wheel"])]).await.unwrap();
        }
        bikes.delete_range(3, 7).await.unwrap();

        assert!(matches!(bikes.get_bike(5).await, Err(VeloError::NotFound)));
        let ids: Vec<u64> =
            bikes.get_bikes(u64::MAX, 0).await.unwrap().iter().map(|b| b.id).collect();
        assert_eq!(ids, vec![10, 9, 8, 2, 1]);

        // Component rows for deleted bikes are gone too.
        let remaining = bikes
            .inner
            .component
            .range(component_key(0).to_vec()..=component_key(u64::MAX).to_vec())
            .count();
        assert_eq!(remaining, 5);
    }

    #[tokio::test]
    async fn scan_bikes_pages_ascending() {
        let dir = tempfile::tempdir().unwrap();
        let bikes = open_bikes(dir.path());

        for i in 1..=7 {
            bikes.store_bikes(vec![make_bike(&format!("bike-{i}"), &[])]).await.unwrap();
        }

        let first = bikes.scan_bikes(0, 3).await.unwrap();
        assert_eq!(first.iter().map(|b| b.id).collect::<Vec<_>>(), vec![1, 2, 3]);

        let last_seen = first.last().unwrap().id;
        let second = bikes.scan_bikes(last_seen, 10).await.unwrap();
        assert_eq!(second.iter().map(|b| b.id).collect::<Vec<_>>(), vec![4, 5, 6, 7]);
    }

    #[tokio::test]
    async fn applied_cursor_advances_with_data() {
        let dir = tempfile::tempdir().unwrap();
        let bikes = open_bikes(dir.path());

        assert_eq!(bikes.last_applied().await.unwrap(), 0);
        bikes.apply_bikes(4, vec![make_bike("Trek", &[])]).await.unwrap();
        assert_eq!(bikes.last_applied().await.unwrap(), 4);
    }

    #[tokio::test]
    async fn dead_letter_parks_payload_and_consumes_entry() {
        let dir = tempfile::tempdir().unwrap();
        let bikes = open_bikes(dir.path());

        bikes.record_dead_letter(9, b"not json".to_vec(), "expected value".into()).await.unwrap();

        let letters = bikes.dead_letters(10).await.unwrap();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].index, 9);
        assert_eq!(letters[0].payload, b"not json");
        assert_eq!(bikes.last_applied().await.unwrap(), 9);
    }

    #[tokio::test]
    async fn reset_wipes_the_catalog() {
        let dir = tempfile::tempdir().unwrap();
        let bikes = open_bikes(dir.path());

        bikes.apply_bikes(1, vec![make_bike("Trek", &["wheel"])]).await.unwrap();
        bikes.record_dead_letter(2, b"junk".to_vec(), "junk".into()).await.unwrap();

        bikes.reset().await.unwrap();
        assert!(bikes.get_bikes(10, 0).await.unwrap().is_empty());
        assert!(bikes.dead_letters(10).await.unwrap().is_empty());
        assert_eq!(bikes.last_applied().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn durability_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let bikes = open_bikes(dir.path());
            bikes.apply_bikes(3, vec![make_bike("Trek", &["wheel", "saddle"])]).await.unwrap();
        }
        let bikes = open_bikes(dir.path());
        let read = bikes.get_bike(1).await.unwrap();
        assert_eq!(read.name, "Trek");
        assert_eq!(read.components.len(), 2);
        assert_eq!(bikes.last_applied().await.unwrap(), 3);
    }
}
