//! Durable, per-key-locked persistence for encode records.
//!
//! Writes go to a temporary file and are renamed into place, so a reader
//! never observes a partially written record. Concurrent writers to the
//! same key serialize on a per-key mutex; writers to different keys do not
//! contend.

pub mod record;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tokio::sync::broadcast;

use crate::error::StoreError;
pub use record::{EncodeRecord, HISTORY_LIMIT};

const RECORD_EXTENSION: &str = "rq.json";

/// Event emitted whenever a record changes.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreEvent {
    /// Source file key whose record changed.
    pub key: String,
    /// What kind of change occurred.
    pub change: StoreChange,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreChange {
    /// The store itself wrote the record.
    Saved,
    /// A collaborator reported an out-of-band change on disk.
    External,
}

/// Metadata store adapter over a directory of JSON record files.
pub struct MetadataStore {
    directory: PathBuf,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    sender: broadcast::Sender<StoreEvent>,
}

impl MetadataStore {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        let (sender, _) = broadcast::channel(100);
        Self {
            directory: directory.into(),
            locks: Mutex::new(HashMap::new()),
            sender,
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Returns a receiver for record change events.
    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.sender.subscribe()
    }

    /// Reports an out-of-band change (e.g. from a file watcher) so
    /// subscribers can invalidate caches.
    pub fn notify_external_change(&self, key: &str) {
        let _ = self.sender.send(StoreEvent {
            key: key.to_string(),
            change: StoreChange::External,
        });
    }

    /// Loads the record for `key`; an absent file yields a fresh record.
    pub fn load(&self, key: &str) -> Result<EncodeRecord, StoreError> {
        let lock = self.key_lock(key);
        let _guard = lock.lock().unwrap_or_else(|p| p.into_inner());
        self.load_unlocked(key)
    }

    /// Saves the record for `key` atomically (temp file + rename).
    pub fn save(&self, key: &str, record: &EncodeRecord) -> Result<(), StoreError> {
        let lock = self.key_lock(key);
        let _guard = lock.lock().unwrap_or_else(|p| p.into_inner());
        self.save_unlocked(key, record)
    }

    /// Load-modify-save under the per-key lock, as a single observable
    /// update. Job-list changes and history appends go through here so a
    /// reader never sees one without the other.
    pub fn update<F>(&self, key: &str, mutate: F) -> Result<EncodeRecord, StoreError>
    where
        F: FnOnce(&mut EncodeRecord),
    {
        let lock = self.key_lock(key);
        let _guard = lock.lock().unwrap_or_else(|p| p.into_inner());
        let mut record = self.load_unlocked(key)?;
        mutate(&mut record);
        self.save_unlocked(key, &record)?;
        Ok(record)
    }

    /// Lists the source keys of all records in the store directory.
    pub fn keys(&self) -> Vec<String> {
        let pattern = self
            .directory
            .join(format!("*.{}", RECORD_EXTENSION))
            .to_string_lossy()
            .to_string();

        let paths = match glob::glob(&pattern) {
            Ok(paths) => paths,
            Err(e) => {
                log::error!("Bad record glob pattern '{}': {}", pattern, e);
                return Vec::new();
            }
        };

        let mut keys = Vec::new();
        for entry in paths.flatten() {
            match self.read_record_file(&entry) {
                Ok(record) => keys.push(record.file_name),
                Err(e) => log::warn!("Skipping unreadable record {}: {}", entry.display(), e),
            }
        }
        keys.sort();
        keys
    }

    fn record_path(&self, key: &str) -> PathBuf {
        let stem = Path::new(key)
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| key.to_string());
        self.directory.join(format!("{}.{}", stem, RECORD_EXTENSION))
    }

    fn key_lock(&self, key: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|p| p.into_inner());
        Arc::clone(locks.entry(key.to_string()).or_default())
    }

    fn load_unlocked(&self, key: &str) -> Result<EncodeRecord, StoreError> {
        let path = self.record_path(key);
        if !path.exists() {
            return Ok(EncodeRecord::new(key));
        }
        self.read_record_file(&path)
    }

    fn read_record_file(&self, path: &Path) -> Result<EncodeRecord, StoreError> {
        let content = std::fs::read_to_string(path).map_err(|e| StoreError::ReadRecord {
            path: path.to_path_buf(),
            source: e,
        })?;
        serde_json::from_str(&content).map_err(|e| StoreError::ParseJson {
            key: path.to_string_lossy().to_string(),
            source: e,
        })
    }

    fn save_unlocked(&self, key: &str, record: &EncodeRecord) -> Result<(), StoreError> {
        if !self.directory.exists() {
            std::fs::create_dir_all(&self.directory).map_err(|e| StoreError::CreateDirectory {
                path: self.directory.clone(),
                source: e,
            })?;
        }

        let path = self.record_path(key);
        let tmp_path = path.with_extension("tmp");

        let json = serde_json::to_string_pretty(record).map_err(|e| StoreError::ParseJson {
            key: key.to_string(),
            source: e,
        })?;

        std::fs::write(&tmp_path, json).map_err(|e| StoreError::WriteRecord {
            path: tmp_path.clone(),
            source: e,
        })?;

        std::fs::rename(&tmp_path, &path).map_err(|e| StoreError::Rename {
            from: tmp_path,
            to: path,
            source: e,
        })?;

        let _ = self.sender.send(StoreEvent {
            key: key.to_string(),
            change: StoreChange::Saved,
        });

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{Job, JobStatus};
    use tempfile::TempDir;

    fn sample_job(title: u32) -> Job {
        Job::new(
            "disc.img".to_string(),
            title,
            "Movie".to_string(),
            "Movie.mp4".to_string(),
            "Fast 1080p30".to_string(),
        )
    }

    #[test]
    fn test_load_missing_yields_fresh_record() {
        let dir = TempDir::new().unwrap();
        let store = MetadataStore::new(dir.path());

        let record = store.load("disc.img").unwrap();
        assert_eq!(record.file_name, "disc.img");
        assert!(record.jobs.is_empty());
        assert!(record.history.is_empty());
    }

    #[test]
    fn test_save_then_load_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = MetadataStore::new(dir.path());

        let mut record = EncodeRecord::new("disc.img");
        record.upsert_job(&sample_job(1));
        store.save("disc.img", &record).unwrap();

        let loaded = store.load("disc.img").unwrap();
        assert_eq!(loaded.jobs.len(), 1);
        assert_eq!(loaded.jobs[0].file_name, "disc.img");
    }

    #[test]
    fn test_save_leaves_no_temp_file() {
        let dir = TempDir::new().unwrap();
        let store = MetadataStore::new(dir.path());
        store.save("disc.img", &EncodeRecord::new("disc.img")).unwrap();

        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .flatten()
            .filter(|e| e.path().extension().is_some_and(|ext| ext == "tmp"))
            .collect();
        assert!(leftovers.is_empty());
        assert!(dir.path().join("disc.rq.json").exists());
    }

    #[test]
    fn test_update_is_single_save() {
        let dir = TempDir::new().unwrap();
        let store = MetadataStore::new(dir.path());
        let mut rx = store.subscribe();

        let mut job = sample_job(1);
        job.status = JobStatus::Completed;
        job.completed_at = Some(chrono::Utc::now());

        store
            .update("disc.img", |record| {
                record.upsert_job(&job);
                record.push_history(crate::job::HistoryEntry::from_job(&job));
            })
            .unwrap();

        // One save event for the combined job-list + history mutation
        let event = rx.try_recv().unwrap();
        assert_eq!(event.key, "disc.img");
        assert_eq!(event.change, StoreChange::Saved);
        assert!(rx.try_recv().is_err());

        let loaded = store.load("disc.img").unwrap();
        assert_eq!(loaded.jobs.len(), 1);
        assert_eq!(loaded.history.len(), 1);
    }

    #[test]
    fn test_history_capped_through_update() {
        let dir = TempDir::new().unwrap();
        let store = MetadataStore::new(dir.path());

        for _ in 0..(HISTORY_LIMIT + 3) {
            let mut job = sample_job(1);
            job.status = JobStatus::Failed;
            job.completed_at = Some(chrono::Utc::now());
            store
                .update("disc.img", |record| {
                    record.push_history(crate::job::HistoryEntry::from_job(&job));
                })
                .unwrap();
        }

        let loaded = store.load("disc.img").unwrap();
        assert_eq!(loaded.history.len(), HISTORY_LIMIT);
    }

    #[test]
    fn test_keys_listing() {
        let dir = TempDir::new().unwrap();
        let store = MetadataStore::new(dir.path());

        store.save("b.img", &EncodeRecord::new("b.img")).unwrap();
        store.save("a.img", &EncodeRecord::new("a.img")).unwrap();
        // Unrelated files are ignored
        std::fs::write(dir.path().join("notes.txt"), "hi").unwrap();

        assert_eq!(store.keys(), vec!["a.img".to_string(), "b.img".to_string()]);
    }

    #[test]
    fn test_external_change_notification() {
        let dir = TempDir::new().unwrap();
        let store = MetadataStore::new(dir.path());
        let mut rx = store.subscribe();

        store.notify_external_change("disc.img");

        let event = rx.try_recv().unwrap();
        assert_eq!(event.key, "disc.img");
        assert_eq!(event.change, StoreChange::External);
    }

    #[test]
    fn test_concurrent_updates_do_not_lose_writes() {
        let dir = TempDir::new().unwrap();
        let store = std::sync::Arc::new(MetadataStore::new(dir.path()));

        let mut handles = Vec::new();
        for i in 0..8 {
            let store = std::sync::Arc::clone(&store);
            handles.push(std::thread::spawn(move || {
                let job = Job::new(
                    "disc.img".to_string(),
                    i,
                    format!("Title {}", i),
                    format!("Title{}.mp4", i),
                    "Fast 1080p30".to_string(),
                );
                store
                    .update("disc.img", |record| record.upsert_job(&job))
                    .unwrap();
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        let loaded = store.load("disc.img").unwrap();
        assert_eq!(loaded.jobs.len(), 8);
    }
}
