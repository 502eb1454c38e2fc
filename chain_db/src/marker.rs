//! Database root markers: network magic, clean-shutdown flag and the
//! advisory lock.

use crate::error::ChainDbError;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

const MAGIC_FILE: &str = "protocolMagicId";
const CLEAN_FILE: &str = "clean";
const LOCK_FILE: &str = "lock";

/// Check or initialize the network-magic marker.
///
/// An empty root gets the configured magic written; an existing marker
/// must agree, so a node cannot be pointed at a database belonging to a
/// different network.
pub fn check_magic(root: &Path, magic: u32) -> Result<(), ChainDbError> {
    let path = root.join(MAGIC_FILE);
    if path.exists() {
        let text = fs::read_to_string(&path)?;
        let found: u32 = text
            .trim()
            .parse()
            .map_err(|_| ChainDbError::Corruption(format!("unreadable magic marker: {text:?}")))?;
        if found != magic {
            return Err(ChainDbError::DbMarkerMismatch {
                found,
                expected: magic,
            });
        }
        Ok(())
    } else {
        fs::write(&path, format!("{magic}\n"))?;
        Ok(())
    }
}

/// Consume the clean-shutdown marker. Returns whether it was present.
pub fn take_clean_marker(root: &Path) -> Result<bool, ChainDbError> {
    let path = root.join(CLEAN_FILE);
    if path.exists() {
        fs::remove_file(&path)?;
        Ok(true)
    } else {
        Ok(false)
    }
}

/// Write the clean-shutdown marker.
pub fn write_clean_marker(root: &Path) -> Result<(), ChainDbError> {
    fs::write(root.join(CLEAN_FILE), [])?;
    Ok(())
}

/// Advisory exclusive lock on the database root, held for the lifetime
/// of the handle. Two processes sharing a root would corrupt it.
pub struct DirLock {
    path: PathBuf,
}

impl DirLock {
    pub fn acquire(root: &Path) -> Result<DirLock, ChainDbError> {
        let path = root.join(LOCK_FILE);
        match fs::OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(_) => Ok(DirLock { path }),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                Err(ChainDbError::Locked)
            }
            Err(err) => Err(err.into()),
        }
    }
}

impl Drop for DirLock {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_file(&self.path) {
            warn!("could not release lock {}: {err}", self.path.display());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn magic_marker_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        check_magic(dir.path(), 42).unwrap();
        check_magic(dir.path(), 42).unwrap();
        assert!(matches!(
            check_magic(dir.path(), 7),
            Err(ChainDbError::DbMarkerMismatch { found: 42, expected: 7 })
        ));
    }

    #[test]
    fn clean_marker_is_consumed() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!take_clean_marker(dir.path()).unwrap());
        write_clean_marker(dir.path()).unwrap();
        assert!(take_clean_marker(dir.path()).unwrap());
        assert!(!take_clean_marker(dir.path()).unwrap());
    }

    #[test]
    fn lock_is_exclusive_and_released() {
        let dir = tempfile::tempdir().unwrap();
        let lock = DirLock::acquire(dir.path()).unwrap();
        assert!(matches!(DirLock::acquire(dir.path()), Err(ChainDbError::Locked)));
        drop(lock);
        DirLock::acquire(dir.path()).unwrap();
    }
}
