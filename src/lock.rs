//! Single-instance guard.

use anyhow::{bail, Context, Result};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Exclusive lock held for the life of the process.
///
/// The file keeps the holder's PID so a second instance can name it.
#[derive(Debug)]
pub struct InstanceLock {
    _file: File,
    path: PathBuf,
}

impl InstanceLock {
    pub fn acquire(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        // Never unlink the file: a second process could then lock a fresh
        // inode at the same path while the first still holds the old one.
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path)
            .with_context(|| format!("Failed to open lock file: {}", path.display()))?;

        if file.try_lock_exclusive().is_err() {
            drop(file);
            let holder = fs::read_to_string(path)
                .ok()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty());
            match holder {
                Some(pid) => bail!("Another installer instance (PID {}) is running", pid),
                None => bail!(
                    "Another installer instance holds {}",
                    path.display()
                ),
            }
        }

        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        write!(file, "{}", std::process::id())?;
        file.flush()?;

        Ok(Self { _file: file, path: path.to_path_buf() })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_second_acquire_names_holder() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("installer.lock");

        let lock = InstanceLock::acquire(&path).unwrap();
        assert_eq!(
            fs::read_to_string(lock.path()).unwrap(),
            std::process::id().to_string()
        );

        let err = InstanceLock::acquire(&path).unwrap_err().to_string();
        assert!(err.contains(&std::process::id().to_string()));

        drop(lock);
        InstanceLock::acquire(&path).unwrap();
    }
}
