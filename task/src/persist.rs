// SPDX-License-Identifier: Apache-2.0
// Copyright Siphon Project Authors

//! On-disk task records: one JSON file per task, written atomically.

use crate::error::TaskError;
use crate::state::TaskState;
use chrono::{DateTime, Utc};
use config::TaskConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Current wire version of [`PersistedTask`].
pub const RECORD_VERSION: &str = "v1";

/// The durable record of one task, rewritten on every state transition so a
/// restart after a crash can pick up where it left off.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedTask {
    pub version: String,
    pub config: TaskConfig,
    pub state: TaskState,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub stopped_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub failure_reason: Option<String>,
    #[serde(default)]
    pub restart_count: u32,
}

/// Directory of `<task_id>.json` records.
pub struct TaskStore {
    dir: PathBuf,
}

impl TaskStore {
    /// Open (creating if needed) the record directory.
    ///
    /// # Errors
    ///
    /// Propagates directory creation failures.
    pub fn open(dir: &Path) -> Result<Self, TaskError> {
        fs::create_dir_all(dir)?;
        Ok(Self {
            dir: dir.to_owned(),
        })
    }

    fn record_path(&self, task_id: &str) -> PathBuf {
        self.dir.join(format!("{task_id}.json"))
    }

    /// Write one record atomically: temp file in the same directory, then
    /// rename over the target, so a partial write never replaces a good
    /// record.
    ///
    /// # Errors
    ///
    /// Propagates encoding and io failures.
    pub fn save(&self, record: &PersistedTask) -> Result<(), TaskError> {
        let path = self.record_path(&record.config.id);
        let tmp = self.dir.join(format!(".{}.json.tmp", record.config.id));
        fs::write(&tmp, serde_json::to_vec_pretty(record)?)?;
        fs::rename(&tmp, &path)?;
        debug!(task = %record.config.id, state = record.state.as_str(), "task record saved");
        Ok(())
    }

    /// Read every record in the directory. Corrupt files are skipped with a
    /// warning rather than failing the whole load.
    ///
    /// # Errors
    ///
    /// Propagates directory read failures.
    pub fn load_all(&self) -> Result<Vec<PersistedTask>, TaskError> {
        let mut records = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().is_none_or(|ext| ext != "json") {
                continue;
            }
            match fs::read(&path).map_err(TaskError::from).and_then(|bytes| {
                serde_json::from_slice::<PersistedTask>(&bytes).map_err(TaskError::from)
            }) {
                Ok(record) => records.push(record),
                Err(e) => warn!(path = %path.display(), "skipping unreadable task record: {e}"),
            }
        }
        Ok(records)
    }

    /// Delete one record, if present.
    ///
    /// # Errors
    ///
    /// Propagates io failures other than the file being absent.
    pub fn remove(&self, task_id: &str) -> Result<(), TaskError> {
        match fs::remove_file(self.record_path(task_id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Keep at most `max_history` terminal-state records, pruning oldest
    /// first (by stop time, then creation time). Returns how many were
    /// removed.
    ///
    /// # Errors
    ///
    /// Propagates directory read failures.
    pub fn prune_history(&self, max_history: usize) -> Result<usize, TaskError> {
        let mut terminal: Vec<PersistedTask> = self
            .load_all()?
            .into_iter()
            .filter(|r| r.state.is_terminal())
            .collect();
        if terminal.len() <= max_history {
            return Ok(0);
        }
        terminal.sort_by_key(|r| r.stopped_at.unwrap_or(r.created_at));
        let excess = terminal.len() - max_history;
        for record in &terminal[..excess] {
            self.remove(&record.config.id)?;
        }
        Ok(excess)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use chrono::TimeDelta;
    use pretty_assertions::assert_eq;

    fn tmp_store(tag: &str) -> TaskStore {
        let dir = std::env::temp_dir().join(format!("siphon-store-{}-{tag}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        TaskStore::open(&dir).unwrap()
    }

    fn record(id: &str, state: TaskState) -> PersistedTask {
        let config: TaskConfig = serde_json::from_value(serde_json::json!({
            "id": id,
            "capture": {"name": "afpacket"},
            "reporters": [{"name": "console"}],
        }))
        .unwrap();
        PersistedTask {
            version: RECORD_VERSION.to_owned(),
            config,
            state,
            created_at: Utc::now(),
            started_at: Some(Utc::now()),
            stopped_at: state.is_terminal().then(Utc::now),
            failure_reason: (state == TaskState::Failed).then(|| "boom".to_owned()),
            restart_count: 2,
        }
    }

    #[test]
    fn record_round_trips_all_fields() {
        let original = record("t1", TaskState::Failed);
        let json = serde_json::to_string(&original).unwrap();
        let back: PersistedTask = serde_json::from_str(&json).unwrap();
        assert_eq!(back, original);
        assert_eq!(back.version, "v1");
        assert_eq!(back.restart_count, 2);
        assert_eq!(back.failure_reason.as_deref(), Some("boom"));
    }

    #[test]
    fn save_then_load() {
        let store = tmp_store("save-load");
        let r1 = record("alpha", TaskState::Running);
        let r2 = record("beta", TaskState::Stopped);
        store.save(&r1).unwrap();
        store.save(&r2).unwrap();
        // Overwrite keeps one record per task.
        store.save(&r1).unwrap();
        let mut loaded = store.load_all().unwrap();
        loaded.sort_by(|a, b| a.config.id.cmp(&b.config.id));
        assert_eq!(loaded, vec![r1, r2]);
    }

    #[test]
    fn corrupt_records_are_skipped() {
        let store = tmp_store("corrupt");
        store.save(&record("good", TaskState::Stopped)).unwrap();
        fs::write(store.dir.join("bad.json"), b"{ not json").unwrap();
        let loaded = store.load_all().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].config.id, "good");
    }

    #[test]
    fn remove_is_idempotent() {
        let store = tmp_store("remove");
        store.save(&record("gone", TaskState::Stopped)).unwrap();
        store.remove("gone").unwrap();
        store.remove("gone").unwrap();
        assert!(store.load_all().unwrap().is_empty());
    }

    #[test]
    fn prune_drops_oldest_terminal_records() {
        let store = tmp_store("prune");
        for (i, id) in ["old", "mid", "new"].iter().enumerate() {
            let mut r = record(id, TaskState::Stopped);
            #[allow(clippy::cast_possible_wrap)]
            let offset = TimeDelta::seconds(i as i64 * 60);
            r.stopped_at = Some(Utc::now() + offset);
            store.save(&r).unwrap();
        }
        // A live record never counts against history.
        store.save(&record("live", TaskState::Running)).unwrap();
        assert_eq!(store.prune_history(2).unwrap(), 1);
        let ids: Vec<String> = store
            .load_all()
            .unwrap()
            .into_iter()
            .map(|r| r.config.id)
            .collect();
        assert!(!ids.contains(&"old".to_owned()));
        assert!(ids.contains(&"mid".to_owned()));
        assert!(ids.contains(&"new".to_owned()));
        assert!(ids.contains(&"live".to_owned()));
    }
}
