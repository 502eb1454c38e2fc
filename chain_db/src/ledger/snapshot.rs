//! On-disk ledger snapshots.
//!
//! A snapshot file is named `{slot}_{hash}` after the point its state
//! sits at and is committed by writing to a `.tmp` sibling and
//! renaming, so a crash can never leave a half-written snapshot under
//! the real name.

use super::LedgerState;
use anyhow::{bail, Context, Result};
use naos_common::{BlockHash, Point};
use std::fs::{self, File};
use std::io::BufReader;
#[cfg(test)]
use std::path::Path;
use std::path::PathBuf;
use tracing::{info, warn};

/// Identity of one snapshot on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotId {
    pub slot: u64,
    pub hash: BlockHash,
}

impl SnapshotId {
    pub fn point(&self) -> Point {
        Point::Specific(self.slot, self.hash)
    }

    fn file_name(&self) -> String {
        format!("{}_{}", self.slot, self.hash)
    }

    fn parse(name: &str) -> Option<SnapshotId> {
        let (slot, hash) = name.split_once('_')?;
        Some(SnapshotId {
            slot: slot.parse().ok()?,
            hash: hash.parse().ok()?,
        })
    }
}

/// Directory of retained ledger snapshots.
pub struct SnapshotStore {
    dir: PathBuf,
    retained: usize,
}

impl SnapshotStore {
    pub fn open(dir: impl Into<PathBuf>, retained: usize) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        // A leftover temp file is an interrupted write
        for entry in fs::read_dir(&dir)?.filter_map(|e| e.ok()) {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "tmp") {
                warn!("removing interrupted snapshot {}", path.display());
                fs::remove_file(&path)?;
            }
        }
        Ok(SnapshotStore {
            dir,
            retained: retained.max(2),
        })
    }

    /// Snapshots on disk, oldest first.
    pub fn list(&self) -> Result<Vec<SnapshotId>> {
        let mut snapshots: Vec<SnapshotId> = fs::read_dir(&self.dir)?
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| SnapshotId::parse(&entry.file_name().to_string_lossy()))
            .collect();
        snapshots.sort_by_key(|id| id.slot);
        Ok(snapshots)
    }

    /// Write a snapshot of the given state and prune old ones.
    pub fn write(&self, state: &LedgerState) -> Result<()> {
        let Point::Specific(slot, hash) = state.tip else {
            bail!("cannot snapshot the pre-genesis state");
        };
        let id = SnapshotId { slot, hash };
        let path = self.path_of(&id);
        let tmp = path.with_extension("tmp");

        let bytes = serde_json::to_vec(state)?;
        fs::write(&tmp, &bytes)?;
        File::open(&tmp)?.sync_all()?;
        fs::rename(&tmp, &path)?;
        info!(slot, "ledger snapshot written");

        self.prune()
    }

    pub fn load(&self, id: &SnapshotId) -> Result<LedgerState> {
        let path = self.path_of(id);
        let file = File::open(&path)
            .with_context(|| format!("snapshot {} unreadable", path.display()))?;
        let state: LedgerState = serde_json::from_reader(BufReader::new(file))
            .with_context(|| format!("snapshot {} undecodable", path.display()))?;
        if state.tip != id.point() {
            bail!("snapshot {} holds state at {}", path.display(), state.tip);
        }
        Ok(state)
    }

    pub fn delete(&self, id: &SnapshotId) -> Result<()> {
        let path = self.path_of(id);
        if path.exists() {
            fs::remove_file(&path)?;
        }
        Ok(())
    }

    fn prune(&self) -> Result<()> {
        let snapshots = self.list()?;
        if snapshots.len() > self.retained {
            for stale in &snapshots[..snapshots.len() - self.retained] {
                warn!(slot = stale.slot, "pruning old snapshot");
                self.delete(stale)?;
            }
        }
        Ok(())
    }

    fn path_of(&self, id: &SnapshotId) -> PathBuf {
        self.dir.join(id.file_name())
    }
}

/// Used by tests to damage a snapshot in place.
#[cfg(test)]
pub(crate) fn snapshot_path(dir: &Path, id: &SnapshotId) -> PathBuf {
    dir.join(id.file_name())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state_at(slot: u64, tag: u8) -> LedgerState {
        LedgerState {
            tip: Point::Specific(slot, BlockHash::new([tag; 32])),
            block_number: Some(slot),
            tip_is_ebb: false,
            chain_digest: BlockHash::new([tag; 32]),
            payload: serde_json::Value::Null,
        }
    }

    #[test]
    fn write_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::open(dir.path(), 2).unwrap();

        let state = state_at(10, 1);
        store.write(&state).unwrap();

        let ids = store.list().unwrap();
        assert_eq!(ids.len(), 1);
        assert_eq!(store.load(&ids[0]).unwrap(), state);
    }

    #[test]
    fn retains_only_newest() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::open(dir.path(), 2).unwrap();

        for slot in [10, 20, 30, 40] {
            store.write(&state_at(slot, slot as u8)).unwrap();
        }

        let ids = store.list().unwrap();
        assert_eq!(ids.len(), 2);
        assert_eq!(ids[0].slot, 30);
        assert_eq!(ids[1].slot, 40);
    }

    #[test]
    fn damaged_snapshot_fails_to_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = SnapshotStore::open(dir.path(), 2).unwrap();
        store.write(&state_at(10, 1)).unwrap();

        let id = store.list().unwrap().pop().unwrap();
        fs::write(snapshot_path(dir.path(), &id), b"not json").unwrap();
        assert!(store.load(&id).is_err());
    }

    #[test]
    fn interrupted_writes_are_cleaned_up() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("10_ab.tmp"), b"partial").unwrap();
        let store = SnapshotStore::open(dir.path(), 2).unwrap();
        assert!(store.list().unwrap().is_empty());
        assert!(!dir.path().join("10_ab.tmp").exists());
    }
}
