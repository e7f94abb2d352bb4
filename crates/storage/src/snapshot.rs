use std::collections::HashMap;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use snafu::ResultExt;

use super::error::{
    CreateDirectorySnafu, ReadFileSnafu, RenameTempFileSnafu, StorageResult, WriteFileSnafu,
};
use super::types::{Conversation, MessageRecord};

/// Fixed key the whole chat state is stored under.
pub const SNAPSHOT_KEY: &str = "murmur.chat-state";
pub const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationSnapshot {
    pub conversation: Conversation,
    pub records: Vec<MessageRecord>,
}

/// Single serialized image of every conversation and its history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub version: u32,
    pub saved_at_unix_ms: u64,
    pub conversations: Vec<ConversationSnapshot>,
}

impl Snapshot {
    pub fn empty() -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            saved_at_unix_ms: 0,
            conversations: Vec::new(),
        }
    }
}

/// Durable key/value channel for serialized snapshots.
pub trait SnapshotStore: Send + Sync {
    /// Short channel name used in logs and errors.
    fn channel(&self) -> &'static str;
    fn save(&self, key: &str, payload: &str) -> StorageResult<()>;
    fn load(&self, key: &str) -> StorageResult<Option<String>>;
}

/// Fallback channel: one JSON file per key inside a directory.
#[derive(Debug, Clone)]
pub struct JsonFileSnapshotStore {
    directory: PathBuf,
}

impl JsonFileSnapshotStore {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }

    pub fn path_for(&self, key: &str) -> PathBuf {
        let file_name = key
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '.' { c } else { '_' })
            .collect::<String>();
        self.directory.join(format!("{file_name}.json"))
    }
}

impl SnapshotStore for JsonFileSnapshotStore {
    fn channel(&self) -> &'static str {
        "json-file"
    }

    fn save(&self, key: &str, payload: &str) -> StorageResult<()> {
        std::fs::create_dir_all(&self.directory).context(CreateDirectorySnafu {
            stage: "json-snapshot-create-directory",
            path: self.directory.display().to_string(),
        })?;

        let target = self.path_for(key);
        let temp_path = target.with_extension("json.tmp");
        std::fs::write(&temp_path, payload).context(WriteFileSnafu {
            stage: "json-snapshot-write-temporary",
            path: temp_path.display().to_string(),
        })?;

        std::fs::rename(&temp_path, &target).context(RenameTempFileSnafu {
            stage: "json-snapshot-rename-temporary",
            from: temp_path.display().to_string(),
            to: target.display().to_string(),
        })?;

        Ok(())
    }

    fn load(&self, key: &str) -> StorageResult<Option<String>> {
        read_optional(&self.path_for(key))
    }
}

/// Volatile channel, used when no durable location is configured and in tests.
#[derive(Debug, Default)]
pub struct MemorySnapshotStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SnapshotStore for MemorySnapshotStore {
    fn channel(&self) -> &'static str {
        "memory"
    }

    fn save(&self, key: &str, payload: &str) -> StorageResult<()> {
        self.entries
            .lock()
            .insert(key.to_string(), payload.to_string());
        Ok(())
    }

    fn load(&self, key: &str) -> StorageResult<Option<String>> {
        Ok(self.entries.lock().get(key).cloned())
    }
}

fn read_optional(path: &Path) -> StorageResult<Option<String>> {
    match std::fs::read_to_string(path) {
        Ok(contents) => Ok(Some(contents)),
        Err(source) if source.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(source) => Err(source).context(ReadFileSnafu {
            stage: "json-snapshot-read",
            path: path.display().to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_file_store_round_trips_and_reports_missing_keys() {
        let directory = tempfile::tempdir().expect("tempdir");
        let store = JsonFileSnapshotStore::new(directory.path().join("nested"));

        assert_eq!(store.load(SNAPSHOT_KEY).expect("load missing"), None);
        store.save(SNAPSHOT_KEY, "{\"v\":1}").expect("save");
        store.save(SNAPSHOT_KEY, "{\"v\":2}").expect("overwrite");
        assert_eq!(
            store.load(SNAPSHOT_KEY).expect("load"),
            Some("{\"v\":2}".to_string())
        );
        assert!(!store.path_for(SNAPSHOT_KEY).with_extension("json.tmp").exists());
    }

    #[test]
    fn key_is_sanitized_into_a_file_name() {
        let store = JsonFileSnapshotStore::new("/tmp/murmur");
        let path = store.path_for("a/b:c");
        assert_eq!(path.file_name().and_then(|n| n.to_str()), Some("a_b_c.json"));
    }
}
