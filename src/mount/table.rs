//! Live mount table parsing (`/proc/self/mountinfo`).

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

/// Default location of the kernel's per-process mount table.
pub const MOUNTINFO: &str = "/proc/self/mountinfo";

/// One row of mountinfo.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountEntry {
    pub mount_point: PathBuf,
    pub fs_type: String,
    pub source: String,
}

#[derive(Debug, Clone, Default)]
pub struct MountTable {
    entries: Vec<MountEntry>,
}

impl MountTable {
    pub fn read(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("reading mount table '{}'", path.display()))?;
        Ok(Self::parse(&content))
    }

    /// Parse mountinfo text. Malformed rows are skipped.
    pub fn parse(content: &str) -> Self {
        let entries = content.lines().filter_map(parse_line).collect();
        Self { entries }
    }

    /// Whether anything is mounted exactly at `target`.
    pub fn is_mount_point(&self, target: &Path) -> bool {
        let wanted = normalize(target);
        self.entries.iter().any(|e| e.mount_point == wanted)
    }

    /// Where `device` is mounted, if anywhere.
    pub fn mount_point_of(&self, device: &str) -> Option<&Path> {
        self.entries
            .iter()
            .find(|e| e.source == device)
            .map(|e| e.mount_point.as_path())
    }
}

fn parse_line(line: &str) -> Option<MountEntry> {
    // id parent maj:min root mount_point options [optional...] - fstype source superopts
    let (head, tail) = line.split_once(" - ")?;
    let mount_point = head.split(' ').nth(4)?;
    let mut tail = tail.split(' ');
    let fs_type = tail.next()?;
    let source = tail.next()?;

    Some(MountEntry {
        mount_point: PathBuf::from(unescape(mount_point)),
        fs_type: fs_type.to_string(),
        source: unescape(source),
    })
}

/// Undo the kernel's octal escaping of space, tab, newline and backslash.
fn unescape(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 4 <= bytes.len() {
            let digits = &bytes[i + 1..i + 4];
            if digits.iter().all(|b| (b'0'..=b'7').contains(b)) {
                let value = digits
                    .iter()
                    .fold(0u32, |acc, b| acc * 8 + u32::from(b - b'0'));
                if let Ok(value) = u8::try_from(value) {
                    out.push(value);
                    i += 4;
                    continue;
                }
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Canonical form used for comparisons: resolved if it exists, without a
/// trailing slash otherwise.
pub(crate) fn normalize(path: &Path) -> PathBuf {
    if let Ok(resolved) = fs::canonicalize(path) {
        return resolved;
    }
    let text = path.to_string_lossy();
    let trimmed = text.trim_end_matches('/');
    if trimmed.is_empty() {
        PathBuf::from("/")
    } else {
        PathBuf::from(trimmed)
    }
}
