//! Durable checkpoint files, one per run scope.
//!
//! Layout: `<state_dir>/checkpoints/<scope>.json`. Writes go to a temp file
//! that is fsynced and then renamed over the target, so a reader sees either
//! the previous checkpoint or the new one, never a torn write.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use leadharvest_shared::{CURRENT_CHECKPOINT_VERSION, Checkpoint, HarvestError, Result, RunType};

const CHECKPOINT_DIR: &str = "checkpoints";

/// Reads and writes checkpoint files under a state directory.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    pub fn new(state_dir: &Path) -> Self {
        Self {
            dir: state_dir.join(CHECKPOINT_DIR),
        }
    }

    /// File backing `scope`.
    pub fn path(&self, scope: &str) -> PathBuf {
        self.dir.join(format!("{scope}.json"))
    }

    /// Load the checkpoint for `scope`.
    ///
    /// Missing, unparseable or mismatched files are all treated as absent;
    /// the latter two log a warning.
    pub fn load(&self, scope: &str, run_type: RunType) -> Option<Checkpoint> {
        let path = self.path(scope);
        let content = match fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!(?path, error = %e, "unreadable checkpoint, starting fresh");
                return None;
            }
        };

        let checkpoint: Checkpoint = match serde_json::from_str(&content) {
            Ok(cp) => cp,
            Err(e) => {
                warn!(?path, error = %e, "corrupt checkpoint, starting fresh");
                return None;
            }
        };

        if let Err(reason) = validate(&checkpoint, scope, run_type) {
            warn!(?path, reason, "invalid checkpoint, starting fresh");
            return None;
        }
        debug!(?path, key = %checkpoint.key, cursor = ?checkpoint.cursor, "checkpoint loaded");
        Some(checkpoint)
    }

    /// Atomically replace the checkpoint for `checkpoint.scope`.
    pub fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        fs::create_dir_all(&self.dir).map_err(|e| checkpoint_err(&self.dir, e))?;

        let path = self.path(&checkpoint.scope);
        let tmp = self.dir.join(format!("{}.json.tmp", checkpoint.scope));
        let json = serde_json::to_vec_pretty(checkpoint)
            .map_err(|e| HarvestError::Checkpoint(format!("serialize: {e}")))?;

        {
            let mut file = File::create(&tmp).map_err(|e| checkpoint_err(&tmp, e))?;
            file.write_all(&json).map_err(|e| checkpoint_err(&tmp, e))?;
            file.sync_all().map_err(|e| checkpoint_err(&tmp, e))?;
        }
        fs::rename(&tmp, &path).map_err(|e| checkpoint_err(&path, e))?;
        sync_dir(&self.dir);
        Ok(())
    }

    /// Delete the checkpoint for `scope`. Returns whether one existed.
    pub fn clear(&self, scope: &str) -> Result<bool> {
        let path = self.path(scope);
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(checkpoint_err(&path, e)),
        }
    }

    /// Raw file contents for display, without validation.
    pub fn read_raw(&self, scope: &str) -> Result<Option<String>> {
        let path = self.path(scope);
        match fs::read_to_string(&path) {
            Ok(s) => Ok(Some(s)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(HarvestError::io(path, e)),
        }
    }
}

fn checkpoint_err(path: &Path, e: std::io::Error) -> HarvestError {
    HarvestError::Checkpoint(format!("{}: {e}", path.display()))
}

/// Persist the rename itself. Not supported on every platform.
fn sync_dir(dir: &Path) {
    let handle = match File::open(dir) {
        Ok(handle) => handle,
        Err(e) => {
            debug!(?dir, error = %e, "cannot open checkpoint directory for fsync");
            return;
        }
    };
    if let Err(e) = handle.sync_all() {
        warn!(?dir, error = %e, "checkpoint directory fsync failed");
    }
}

fn validate(
    cp: &Checkpoint,
    scope: &str,
    run_type: RunType,
) -> std::result::Result<(), &'static str> {
    if cp.schema_version != CURRENT_CHECKPOINT_VERSION {
        return Err("unsupported schema version");
    }
    if cp.run_type != run_type {
        return Err("run type mismatch");
    }
    if cp.scope != scope {
        return Err("scope mismatch");
    }
    if cp.key.trim().is_empty() {
        return Err("empty query key");
    }
    if cp.key_done && cp.cursor.is_some() {
        return Err("finished key with a pending cursor");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use leadharvest_shared::{CheckpointPhase, RunCounts};
    use uuid::Uuid;

    use super::*;

    fn temp_store() -> (CheckpointStore, PathBuf) {
        let dir = std::env::temp_dir().join(format!("lh-cp-{}", Uuid::now_v7()));
        (CheckpointStore::new(&dir), dir)
    }

    fn checkpoint(scope: &str, key: &str, cursor: Option<&str>) -> Checkpoint {
        let now = Utc::now();
        Checkpoint {
            schema_version: CURRENT_CHECKPOINT_VERSION,
            run_type: RunType::Full,
            scope: scope.into(),
            key: key.into(),
            letters: vec![],
            cursor: cursor.map(String::from),
            key_done: false,
            phase: CheckpointPhase::InProgress,
            counts: RunCounts {
                created: 12,
                ..Default::default()
            },
            failed_keys: vec!["Ab".into()],
            run_started_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn letters_survive_and_default_when_absent() {
        let (store, dir) = temp_store();
        let mut cp = checkpoint("full", "B", None);
        cp.letters = vec!['B', 'D'];
        store.save(&cp).expect("save");
        assert_eq!(store.load("full", RunType::Full).unwrap().letters, vec!['B', 'D']);

        let json = serde_json::to_string(&checkpoint("full", "B", None)).unwrap();
        assert!(!json.contains("letters"));
        let parsed: Checkpoint = serde_json::from_str(&json).unwrap();
        assert!(parsed.letters.is_empty());
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn directory_sync_tolerates_missing_directory() {
        let dir = std::env::temp_dir().join(format!("lh-cp-missing-{}", Uuid::now_v7()));
        sync_dir(&dir);
        assert!(!dir.exists());
    }

    #[test]
    fn save_then_load() {
        let (store, dir) = temp_store();
        let cp = checkpoint("full", "A", Some("2"));
        store.save(&cp).expect("save");

        let loaded = store.load("full", RunType::Full).expect("loaded");
        assert_eq!(loaded, cp);
        assert!(!store.dir.join("full.json.tmp").exists());

        fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn overwrite_replaces_previous() {
        let (store, dir) = temp_store();
        store.save(&checkpoint("full", "A", Some("2"))).unwrap();
        store.save(&checkpoint("full", "Ab", None)).unwrap();

        let loaded = store.load("full", RunType::Full).unwrap();
        assert_eq!(loaded.key, "Ab");
        assert_eq!(loaded.cursor, None);

        fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn missing_file_is_absent() {
        let (store, _dir) = temp_store();
        assert!(store.load("full", RunType::Full).is_none());
        assert!(!store.clear("full").unwrap());
    }

    #[test]
    fn corrupt_file_is_treated_as_absent() {
        let (store, dir) = temp_store();
        fs::create_dir_all(&store.dir).unwrap();
        fs::write(store.path("full"), "{ not json").unwrap();
        assert!(store.load("full", RunType::Full).is_none());

        fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn mismatched_checkpoint_is_treated_as_absent() {
        let (store, dir) = temp_store();

        let mut wrong_version = checkpoint("full", "A", None);
        wrong_version.schema_version = 99;
        store.save(&wrong_version).unwrap();
        assert!(store.load("full", RunType::Full).is_none());

        store.save(&checkpoint("full", "A", None)).unwrap();
        assert!(store.load("full", RunType::Incremental).is_none());

        let mut empty_key = checkpoint("full", "", None);
        empty_key.key = "  ".into();
        store.save(&empty_key).unwrap();
        assert!(store.load("full", RunType::Full).is_none());

        fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn scopes_are_independent() {
        let (store, dir) = temp_store();
        store.save(&checkpoint("full-shard-0-of-2", "A", None)).unwrap();
        store.save(&checkpoint("full-shard-1-of-2", "Aa", None)).unwrap();

        assert_eq!(
            store.load("full-shard-0-of-2", RunType::Full).unwrap().key,
            "A"
        );
        assert_eq!(
            store.load("full-shard-1-of-2", RunType::Full).unwrap().key,
            "Aa"
        );
        assert!(store.clear("full-shard-0-of-2").unwrap());
        assert!(store.load("full-shard-0-of-2", RunType::Full).is_none());
        assert!(store.load("full-shard-1-of-2", RunType::Full).is_some());

        fs::remove_dir_all(dir).ok();
    }
}
