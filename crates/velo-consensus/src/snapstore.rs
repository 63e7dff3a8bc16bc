use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use velo_types::VeloError;

fn io_err(e: std::io::Error) -> VeloError {
    VeloError::Storage(e.to_string())
}

/// Metadata identifying a snapshot.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SnapshotMeta {
    /// UUID v4 string identifying this snapshot.
    pub id: String,
    /// Log index the snapshot captures (everything ≤ index is inside).
    pub index: u64,
    pub term: u64,
}

/// On-disk snapshot layout: `<dir>/snap-<uuid>/{meta.json, state.bin}`.
///
/// A snapshot is written under a `.tmp` suffix and renamed into place on
/// [`FileSnapshotSink::close`], so a directory without the suffix is always
/// complete. Dropping an unclosed sink removes the partial directory — the
/// cancel path.
pub struct FileSnapshotStore {
    dir: PathBuf,
}

impl FileSnapshotStore {
    pub fn open(dir: &Path) -> Result<Self, VeloError> {
        fs::create_dir_all(dir).map_err(io_err)?;
        Ok(FileSnapshotStore { dir: dir.to_path_buf() })
    }

    /// Start a new snapshot at `index`.
    pub fn create(&self, index: u64, term: u64) -> Result<FileSnapshotSink, VeloError> {
        let id = uuid::Uuid::new_v4().to_string();
        let meta = SnapshotMeta { id: id.clone(), index, term };

        let final_path = self.dir.join(format!("snap-{id}"));
        let tmp_path = self.dir.join(format!("snap-{id}.tmp"));
        fs::create_dir_all(&tmp_path).map_err(io_err)?;

        let meta_bytes =
            serde_json::to_vec_pretty(&meta).map_err(|e| VeloError::Codec(e.to_string()))?;
        fs::write(tmp_path.join("meta.json"), meta_bytes).map_err(io_err)?;

        let file = File::create(tmp_path.join("state.bin")).map_err(io_err)?;
        Ok(FileSnapshotSink {
            meta,
            tmp_path,
            final_path,
            file: Some(BufWriter::new(file)),
            committed: false,
        })
    }

    /// Metadata of every complete snapshot, newest (highest index) first.
    pub fn list(&self) -> Result<Vec<SnapshotMeta>, VeloError> {
        let mut metas = Vec::new();
        for entry in fs::read_dir(&self.dir).map_err(io_err)? {
            let entry = entry.map_err(io_err)?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if !name.starts_with("snap-") || name.ends_with(".tmp") {
                continue;
            }
            let raw = fs::read(entry.path().join("meta.json")).map_err(io_err)?;
            let meta: SnapshotMeta =
                serde_json::from_slice(&raw).map_err(|e| VeloError::Codec(e.to_string()))?;
            metas.push(meta);
        }
        metas.sort_by(|a, b| b.index.cmp(&a.index).then_with(|| b.id.cmp(&a.id)));
        Ok(metas)
    }

    /// Newest complete snapshot, if any.
    pub fn latest(&self) -> Result<Option<SnapshotMeta>, VeloError> {
        Ok(self.list()?.into_iter().next())
    }

    /// Open the state stream of a snapshot for restore.
    pub fn open_data(&self, meta: &SnapshotMeta) -> Result<File, VeloError> {
        File::open(self.dir.join(format!("snap-{}", meta.id)).join("state.bin")).map_err(io_err)
    }

    /// Keep the newest `n` snapshots and delete the rest.
    pub fn retain(&self, n: usize) -> Result<(), VeloError> {
        for meta in self.list()?.into_iter().skip(n.max(1)) {
            fs::remove_dir_all(self.dir.join(format!("snap-{}", meta.id))).map_err(io_err)?;
        }
        Ok(())
    }
}

/// Write half of an in-progress snapshot.
pub struct FileSnapshotSink {
    meta: SnapshotMeta,
    tmp_path: PathBuf,
    final_path: PathBuf,
    file: Option<BufWriter<File>>,
    committed: bool,
}

impl FileSnapshotSink {
    pub fn id(&self) -> &str {
        &self.meta.id
    }

    pub fn meta(&self) -> &SnapshotMeta {
        &self.meta
    }

    /// Commit: flush, fsync, and rename the directory into place.
    pub fn close(mut self) -> Result<SnapshotMeta, VeloError> {
        let writer = self
            .file
            .take()
            .ok_or_else(|| VeloError::Storage("snapshot sink already closed".into()))?;
        let file = writer.into_inner().map_err(|e| VeloError::Storage(e.to_string()))?;
        file.sync_all().map_err(io_err)?;
        drop(file);
        fs::rename(&self.tmp_path, &self.final_path).map_err(io_err)?;
        self.committed = true;
        Ok(self.meta.clone())
    }
}

impl Write for FileSnapshotSink {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self.file.as_mut() {
            Some(f) => f.write(buf),
            None => Err(std::io::Error::other("snapshot sink closed")),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self.file.as_mut() {
            Some(f) => f.flush(),
            None => Ok(()),
        }
    }
}

impl Drop for FileSnapshotSink {
    fn drop(&mut self) {
        if !self.committed {
            drop(self.file.take());
            let _ = fs::remove_dir_all(&self.tmp_path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn close_commits_and_latest_finds_it() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSnapshotStore::open(dir.path()).unwrap();

        let mut sink = store.create(12, 1).unwrap();
        sink.write_all(b"{\"id\":1}").unwrap();
        let meta = sink.close().unwrap();

        let latest = store.latest().unwrap().unwrap();
        assert_eq!(latest.index, 12);
        assert_eq!(latest.id, meta.id);

        let mut data = String::new();
        use std::io::Read;
        store.open_data(&latest).unwrap().read_to_string(&mut data).unwrap();
        assert_eq!(data, "{\"id\":1}");
    }

    #[test]
    fn dropped_sink_leaves_no_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSnapshotStore::open(dir.path()).unwrap();

        {
            let mut sink = store.create(5, 1).unwrap();
            sink.write_all(b"partial").unwrap();
            // dropped without close: the cancel path
        }

        assert!(store.latest().unwrap().is_none());
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn retain_keeps_newest() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSnapshotStore::open(dir.path()).unwrap();

        for index in [3u64, 7, 11] {
            let sink = store.create(index, 1).unwrap();
            sink.close().unwrap();
        }
        store.retain(2).unwrap();

        let indices: Vec<u64> = store.list().unwrap().iter().map(|m| m.index).collect();
        assert_eq!(indices, vec![11, 7]);
    }
}
