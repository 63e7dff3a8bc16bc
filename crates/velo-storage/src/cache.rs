use std::sync::Mutex;

use velo_types::{LogEntry, VeloError};

use crate::traits::LogStore;

/// A fixed-size in-memory ring over the most recent log entries.
///
/// The consensus layer re-reads recent entries constantly (replication to
/// followers, commitment checks); this keeps those reads off disk. Entries
/// land in slot `index % capacity`, so a slot only answers for the exact
/// index it holds. Writes go to the ring and the wrapped store; everything
/// else delegates.
pub struct LogCache<S> {
    inner: S,
    slots: Mutex<Vec<Option<LogEntry>>>,
}

impl<S: LogStore> LogCache<S> {
    pub fn new(capacity: usize, inner: S) -> Self {
        LogCache { inner, slots: Mutex::new(vec![None; capacity.max(1)]) }
    }
}

impl<S: LogStore> LogStore for LogCache<S> {
    async fn first_index(&self) -> Result<u64, VeloError> {
        self.inner.first_index().await
    }

    async fn last_index(&self) -> Result<u64, VeloError> {
        self.inner.last_index().await
    }

    async fn get_log(&self, index: u64) -> Result<LogEntry, VeloError> {
        {
            let slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
            let slot = &slots[(index % slots.len() as u64) as usize];
            if let Some(entry) = slot {
                if entry.index == index {
                    return Ok(entry.clone());
                }
            }
        }
        self.inner.get_log(index).await
    }

    async fn store_logs(&self, entries: Vec<LogEntry>) -> Result<(), VeloError> {
        {
            let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
            let n = slots.len() as u64;
            for entry in &entries {
                slots[(entry.index % n) as usize] = Some(entry.clone());
            }
        }
        self.inner.store_logs(entries).await
    }

    async fn delete_range(&self, min: u64, max: u64) -> Result<(), VeloError> {
        {
            let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
            for slot in slots.iter_mut() {
                if slot.as_ref().is_some_and(|e| e.index >= min && e.index <= max) {
                    *slot = None;
                }
            }
        }
        self.inner.delete_range(min, max).await
    }

    async fn set(&self, key: Vec<u8>, value: Vec<u8>) -> Result<(), VeloError> {
        self.inner.set(key, value).await
    }

    async fn get(&self, key: Vec<u8>) -> Result<Vec<u8>, VeloError> {
        self.inner.get(key).await
    }

    async fn set_u64(&self, key: Vec<u8>, value: u64) -> Result<(), VeloError> {
        self.inner.set_u64(key, value).await
    }

    async fn get_u64(&self, key: Vec<u8>) -> Result<u64, VeloError> {
        self.inner.get_u64(key).await
    }
}
