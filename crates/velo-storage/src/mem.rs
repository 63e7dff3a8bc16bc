use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tokio::sync::RwLock;

use velo_types::{Bike, Component, LogEntry, VeloError};

use crate::traits::{BikeStore, LogStore};
use crate::types::{ComponentRow, DeadLetter};

// ---------------------------------------------------------------------------
// MemLogStore
// ---------------------------------------------------------------------------

struct MemLogInner {
    entries: BTreeMap<u64, LogEntry>,
    stable: HashMap<Vec<u8>, Vec<u8>>,
}

/// In-memory [`LogStore`] backed by a `BTreeMap`.
///
/// Intended for unit tests; not persisted across restarts.
pub struct MemLogStore {
    inner: Arc<RwLock<MemLogInner>>,
}

impl MemLogStore {
    pub fn new() -> Self {
        MemLogStore {
            inner: Arc::new(RwLock::new(MemLogInner {
                entries: BTreeMap::new(),
                stable: HashMap::new(),
            })),
        }
    }
}

impl Default for MemLogStore {
    fn default() -> Self {
        Self::new()
    }
}

impl LogStore for MemLogStore {
    async fn first_index(&self) -> Result<u64, VeloError> {
        Ok(self.inner.read().await.entries.keys().next().copied().unwrap_or(0))
    }

    async fn last_index(&self) -> Result<u64, VeloError> {
        Ok(self.inner.read().await.entries.keys().next_back().copied().unwrap_or(0))
    }

    async fn get_log(&self, index: u64) -> Result<LogEntry, VeloError> {
        self.inner.read().await.entries.get(&index).cloned().ok_or(VeloError::NotFound)
    }

    async fn store_logs(&self, entries: Vec<LogEntry>) -> Result<(), VeloError> {
        let mut g = self.inner.write().await;
        for entry in entries {
            g.entries.insert(entry.index, entry);
        }
        Ok(())
    }

    async fn delete_range(&self, min: u64, max: u64) -> Result<(), VeloError> {
        let mut g = self.inner.write().await;
        let doomed: Vec<u64> = g.entries.range(min..=max).map(|(k, _)| *k).collect();
        for k in doomed {
            g.entries.remove(&k);
        }
        Ok(())
    }

    async fn set(&self, key: Vec<u8>, value: Vec<u8>) -> Result<(), VeloError> {
        self.inner.write().await.stable.insert(key, value);
        Ok(())
    }

    async fn get(&self, key: Vec<u8>) -> Result<Vec<u8>, VeloError> {
        self.inner.read().await.stable.get(&key).cloned().ok_or(VeloError::NotFound)
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
// MemBikeStore
// ---------------------------------------------------------------------------

struct MemCatalog {
    bikes: BTreeMap<u64, String>,
    components: BTreeMap<u64, ComponentRow>,
    dead: BTreeMap<u64, DeadLetter>,
    last_applied: u64,
}

impl MemCatalog {
    fn components_of(&self, bike_id: u64) -> Vec<Component> {
        self.components
            .iter()
            .filter(|(_, row)| row.bike_id == bike_id)
            .map(|(id, row)| Component { id: *id, bike_id: row.bike_id, name: row.name.clone() })
            .collect()
    }

    fn upsert(&mut self, mut bikes: Vec<Bike>, apply_index: Option<u64>) -> Result<Vec<Bike>, VeloError> {
        // Validate up front so a failing batch leaves the catalog untouched.
        if bikes.iter().any(|b| b.name.is_empty()) {
            return Err(VeloError::InvalidArgument("bike name must not be empty".into()));
        }
        let mut next_bike_id = self.bikes.keys().next_back().map_or(1, |m| m + 1);
        let mut next_component_id = self.components.keys().next_back().map_or(1, |m| m + 1);
        for bike in &mut bikes {
            if bike.id == 0 {
                bike.id = next_bike_id;
                next_bike_id += 1;
            } else if bike.id >= next_bike_id {
                next_bike_id = bike.id + 1;
            }
            self.bikes.insert(bike.id, bike.name.clone());
            for component in &mut bike.components {
                component.bike_id = bike.id;
                if component.id == 0 {
                    component.id = next_component_id;
                    next_component_id += 1;
                } else if component.id >= next_component_id {
                    next_component_id = component.id + 1;
                }
                self.components.insert(
                    component.id,
                    ComponentRow { bike_id: component.bike_id, name: component.name.clone() },
                );
            }
        }
        if let Some(index) = apply_index {
            self.last_applied = index;
        }
        Ok(bikes)
    }
}

/// In-memory [`BikeStore`] twin of the fjall implementation.
///
/// Intended for unit tests elsewhere in the workspace.
pub struct MemBikeStore {
    inner: Arc<RwLock<MemCatalog>>,
}

impl MemBikeStore {
    pub fn new() -> Self {
        MemBikeStore {
            inner: Arc::new(RwLock::new(MemCatalog {
                bikes: BTreeMap::new(),
                components: BTreeMap::new(),
                dead: BTreeMap::new(),
                last_applied: 0,
            })),
        }
    }
}

impl Default for MemBikeStore {
    fn default() -> Self {
        Self::new()
    }
}

impl BikeStore for MemBikeStore {
    async fn get_bikes(&self, limit: u64, offset: u64) -> Result<Vec<Bike>, VeloError> {
        let g = self.inner.read().await;
        Ok(g.bikes
            .iter()
            .rev()
            .skip(offset as usize)
            .take(limit as usize)
            .map(|(id, name)| Bike { id: *id, name: name.clone(), components: g.components_of(*id) })
            .collect())
    }

    async fn get_bike(&self, id: u64) -> Result<Bike, VeloError> {
        let g = self.inner.read().await;
        let name = g.bikes.get(&id).cloned().ok_or(VeloError::NotFound)?;
        Ok(Bike { id, name, components: g.components_of(id) })
    }

    async fn store_bikes(&self, bikes: Vec<Bike>) -> Result<Vec<Bike>, VeloError> {
        self.inner.write().await.upsert(bikes, None)
    }

    async fn apply_bikes(&self, index: u64, bikes: Vec<Bike>) -> Result<Vec<Bike>, VeloError> {
        self.inner.write().await.upsert(bikes, Some(index))
    }

    async fn delete_range(&self, min: u64, max: u64) -> Result<(), VeloError> {
        let mut g = self.inner.write().await;
        let doomed: Vec<u64> = g.bikes.range(min..=max).map(|(k, _)| *k).collect();
        for id in doomed {
            g.bikes.remove(&id);
            g.components.retain(|_, row| row.bike_id != id);
        }
        Ok(())
    }

    async fn scan_bikes(&self, after_id: u64, limit: u64) -> Result<Vec<Bike>, VeloError> {
        let g = self.inner.read().await;
        Ok(g.bikes
            .range(after_id.saturating_add(1)..)
            .take(limit as usize)
            .map(|(id, name)| Bike { id: *id, name: name.clone(), components: g.components_of(*id) })
            .collect())
    }

    async fn last_applied(&self) -> Result<u64, VeloError> {
        Ok(self.inner.read().await.last_applied)
    }

    async fn record_dead_letter(
        &self,
        index: u64,
        payload: Vec<u8>,
        error: String,
    ) -> Result<(), VeloError> {
        let mut g = self.inner.write().await;
        g.dead.insert(index, DeadLetter { index, payload, error });
        g.last_applied = index;
        Ok(())
    }

    async fn dead_letters(&self, limit: u64) -> Result<Vec<DeadLetter>, VeloError> {
        let g = self.inner.read().await;
        Ok(g.dead.values().take(limit as usize).cloned().collect())
    }

    async fn reset(&self) -> Result<(), VeloError> {
        let mut g = self.inner.write().await;
        g.bikes.clear();
        g.components.clear();
        g.dead.clear();
        g.last_applied = 0;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

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

    #[tokio::test]
    async fn mem_bike_store_matches_contract() {
        let store = MemBikeStore::new();
        let stored =
            store.store_bikes(vec![make_bike("Trek", &["wheel", "saddle"])]).await.unwrap();
        assert_eq!(stored[0].id, 1);
        assert_eq!(stored[0].components[1].id, 2);

        let read = store.get_bike(1).await.unwrap();
        assert_eq!(read, stored[0]);

        store.delete_range(1, 1).await.unwrap();
        assert!(matches!(store.get_bike(1).await, Err(VeloError::NotFound)));
    }

    #[tokio::test]
    async fn mem_log_store_indices() {
        let store = MemLogStore::new();
        assert_eq!(store.first_index().await.unwrap(), 0);

        store
            .store_logs(vec![LogEntry {
                index: 4,
                term: 1,
                kind: velo_types::EntryKind::Noop,
                data: Vec::new(),
                extensions: Vec::new(),
            }])
            .await
            .unwrap();
        assert_eq!(store.first_index().await.unwrap(), 4);
        assert_eq!(store.last_index().await.unwrap(), 4);
    }
}
