//! Namespaced key-value store for task records.
//!
//! In-memory map with an optional on-disk spill (`task_{id}.json` files in
//! the data directory) so task state survives front-end detachment and
//! process restarts. Disk writes are best-effort: a failed write degrades to
//! memory-only operation with a warning, never an error on the hot path.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::RwLock;

use tracing::{debug, warn};

use crate::core::types::TaskRecord;

pub struct TaskStore {
    dir: Option<PathBuf>,
    records: RwLock<HashMap<String, TaskRecord>>,
}

impl TaskStore {
    /// Open the store, loading any records spilled by a previous process.
    /// `dir = None` keeps everything in memory (tests).
    pub fn open(dir: Option<PathBuf>) -> Self {
        let mut records = HashMap::new();
        if let Some(dir) = &dir {
            if let Err(e) = std::fs::create_dir_all(dir) {
                warn!("task store: cannot create {}: {e}", dir.display());
            }
            match std::fs::read_dir(dir) {
                Ok(entries) => {
                    for entry in entries.filter_map(|e| e.ok()) {
                        let path = entry.path();
                        let name = entry.file_name().to_string_lossy().to_string();
                        if !name.starts_with("task_") || !name.ends_with(".json") {
                            continue;
                        }
                        match std::fs::read_to_string(&path)
                            .ok()
                            .and_then(|s| serde_json::from_str::<TaskRecord>(&s).ok())
                        {
                            Some(record) => {
                                records.insert(record.id.clone(), record);
                            }
                            None => warn!("task store: skipping unreadable {}", path.display()),
                        }
                    }
                }
                Err(e) => warn!("task store: cannot list {}: {e}", dir.display()),
            }
        }
        debug!("task store: opened with {} record(s)", records.len());
        Self {
            dir,
            records: RwLock::new(records),
        }
    }

    fn record_path(&self, id: &str) -> Option<PathBuf> {
        self.dir.as_ref().map(|d| d.join(format!("task_{id}.json")))
    }

    pub fn put(&self, record: TaskRecord) {
        if let Some(path) = self.record_path(&record.id) {
            match serde_json::to_string(&record) {
                Ok(json) => {
                    if let Err(e) = std::fs::write(&path, json) {
                        warn!("task store: spill failed for {}: {e}", record.id);
                    }
                }
                Err(e) => warn!("task store: serialize failed for {}: {e}", record.id),
            }
        }
        self.records
            .write()
            .expect("task store lock")
            .insert(record.id.clone(), record);
    }

    pub fn get(&self, id: &str) -> Option<TaskRecord> {
        self.records.read().expect("task store lock").get(id).cloned()
    }

    pub fn remove(&self, id: &str) -> Option<TaskRecord> {
        if let Some(path) = self.record_path(id) {
            if path.exists() {
                if let Err(e) = std::fs::remove_file(&path) {
                    warn!("task store: remove failed for {id}: {e}");
                }
            }
        }
        self.records.write().expect("task store lock").remove(id)
    }

    pub fn all(&self) -> Vec<TaskRecord> {
        self.records
            .read()
            .expect("task store lock")
            .values()
            .cloned()
            .collect()
    }

    /// Remove every record matching `predicate`; returns the removed IDs.
    pub fn remove_where(&self, predicate: impl Fn(&TaskRecord) -> bool) -> Vec<String> {
        let ids: Vec<String> = {
            let records = self.records.read().expect("task store lock");
            records
                .values()
                .filter(|r| predicate(r))
                .map(|r| r.id.clone())
                .collect()
        };
        for id in &ids {
            self.remove(id);
        }
        ids
    }

    pub fn clear(&self) {
        let ids: Vec<String> = self
            .records
            .read()
            .expect("task store lock")
            .keys()
            .cloned()
            .collect();
        for id in ids {
            self.remove(&id);
        }
    }
}
