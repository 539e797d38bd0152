//! Base-system marker inside the target root.
//!
//! `system.txt` at the target root means the stage archive has already
//! been unpacked there. It is the only on-disk state the engine reads.

use anyhow::{bail, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::info;

use crate::credential::Credential;

pub const MARKER_FILE: &str = "system.txt";

/// Result of [`ensure_base_system`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BaseSystem {
    AlreadyUnpacked,
    UnpackedNow,
}

pub fn marker_path(target_root: &Path) -> PathBuf {
    target_root.join(MARKER_FILE)
}

pub fn is_unpacked(target_root: &Path) -> bool {
    marker_path(target_root).is_file()
}

/// Newest `stage3*.tar.xz` in the target root or its `boot/` directory.
pub fn find_stage_archive(target_root: &Path) -> Result<Option<PathBuf>> {
    let mut newest: Option<(SystemTime, PathBuf)> = None;

    for dir in [target_root.to_path_buf(), target_root.join("boot")] {
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => {
                return Err(e).with_context(|| format!("reading {}", dir.display()));
            }
        };
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if !(name.starts_with("stage3") && name.ends_with(".tar.xz")) {
                continue;
            }
            let modified = entry
                .metadata()
                .and_then(|m| m.modified())
                .with_context(|| format!("reading mtime of {}", entry.path().display()))?;
            if newest.as_ref().map_or(true, |(t, _)| modified > *t) {
                newest = Some((modified, entry.path()));
            }
        }
    }

    Ok(newest.map(|(_, path)| path))
}

/// Unpack `archive` into the target root unless the marker is present.
///
/// On success the marker is written and the archive removed.
pub fn ensure_base_system(
    target_root: &Path,
    archive: Option<&Path>,
    credential: &Credential,
) -> Result<BaseSystem> {
    if is_unpacked(target_root) {
        return Ok(BaseSystem::AlreadyUnpacked);
    }

    let found;
    let archive = match archive {
        Some(path) => path,
        None => {
            found = find_stage_archive(target_root)?;
            match found.as_deref() {
                Some(path) => path,
                None => bail!(
                    "No stage archive found.\n\n\
                     Looked for stage3*.tar.xz in {} and {}.",
                    target_root.display(),
                    target_root.join("boot").display()
                ),
            }
        }
    };

    info!(archive = %archive.display(), target_root = %target_root.display(), "unpacking stage archive");

    let root = target_root.display().to_string();
    let archive_str = archive.display().to_string();
    let marker = marker_path(target_root).display().to_string();

    credential
        .command(vec!["tar".into(), "xpf".into(), archive_str.clone(), "-C".into(), root])?
        .error_msg(format!("unpacking {}", archive.display()))
        .run()?;
    credential
        .command(vec!["touch".into(), marker])?
        .error_msg("writing base-system marker")
        .run()?;
    credential
        .command(vec!["rm".into(), "-f".into(), archive_str])?
        .error_msg(format!("removing {}", archive.display()))
        .run()?;

    Ok(BaseSystem::UnpackedNow)
}
