//! Terminal emulator discovery for steps the user interacts with.

use anyhow::{bail, Result};
use std::path::{Path, PathBuf};

/// Emulators tried in order.
pub const CANDIDATES: &[&str] = &[
    "qterminal",
    "gnome-terminal",
    "konsole",
    "xfce4-terminal",
    "lxterminal",
    "alacritty",
    "kitty",
    "xterm",
];

/// A terminal emulator found on the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminalLauncher {
    name: String,
    path: PathBuf,
}

impl TerminalLauncher {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
        }
    }

    /// First candidate on `PATH`.
    pub fn detect() -> Result<Self> {
        for name in CANDIDATES {
            if let Ok(path) = which::which(name) {
                return Ok(Self::new(*name, path));
            }
        }
        bail!(
            "No terminal emulator found.\n\n\
             Tried: {}\n\n\
             Install one of them to run interactive steps.",
            CANDIDATES.join(", ")
        )
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// argv that runs `inner` inside the emulator.
    ///
    /// gnome-terminal takes the command after `--`; the rest use `-e`.
    pub fn argv(&self, inner: Vec<String>) -> Vec<String> {
        let separator = if self.name == "gnome-terminal" { "--" } else { "-e" };
        let mut argv = vec![self.path.display().to_string(), separator.to_string()];
        argv.extend(inner);
        argv
    }
}
