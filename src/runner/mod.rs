//! Step execution inside the target root.
//!
//! [`StepExecutor`] is the seam between the sequencer and the host. The
//! live implementation, [`ChrootExecutor`], wraps every elevated command as
//! `[sudo ...] chroot <root> <shell> -lc <command>` and picks one of three
//! strategies: a pty-backed stream, a buffered capture, or a terminal
//! emulator the user interacts with.

mod lines;
mod pty;

pub use lines::LineSplitter;
pub use pty::stream_in_pty;

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::credential::Credential;
use crate::process::Cmd;
use crate::terminal::TerminalLauncher;

/// Exit code and combined output of a buffered command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Captured {
    pub code: i32,
    pub lines: Vec<String>,
}

/// Runs rendered step commands.
pub trait StepExecutor: Send {
    /// Run `command`, calling `on_line` for each output line as it arrives.
    fn stream(&mut self, command: &str, elevated: bool, on_line: &mut dyn FnMut(&str))
        -> Result<i32>;

    /// Run `command` to completion and return all of its output.
    fn capture(&mut self, command: &str, elevated: bool) -> Result<Captured>;

    /// Run `command` in a terminal emulator and wait for it to close.
    fn interactive(&mut self, command: &str, elevated: bool) -> Result<i32>;
}

/// [`StepExecutor`] targeting a chroot on the live host.
pub struct ChrootExecutor {
    credential: Credential,
    target_root: PathBuf,
    shell: String,
    terminal: Option<TerminalLauncher>,
}

impl ChrootExecutor {
    pub fn new(credential: Credential, target_root: &Path) -> Self {
        Self {
            credential,
            target_root: target_root.to_path_buf(),
            shell: "/bin/bash".to_string(),
            terminal: None,
        }
    }

    /// Login shell used inside the target root.
    pub fn shell(mut self, shell: impl Into<String>) -> Self {
        self.shell = shell.into();
        self
    }

    pub fn terminal(mut self, launcher: TerminalLauncher) -> Self {
        self.terminal = Some(launcher);
        self
    }

    /// `<shell> -lc <command>`, chrooted and elevated when `elevated`.
    pub fn argv(&self, command: &str, elevated: bool) -> Vec<String> {
        let script = vec![self.shell.clone(), "-lc".to_string(), command.to_string()];
        if !elevated {
            return script;
        }
        let mut inner = vec!["chroot".to_string(), self.target_root.display().to_string()];
        inner.extend(script);
        self.credential.wrap(inner)
    }

    fn secret_bytes(&self, elevated: bool) -> Option<Vec<u8>> {
        elevated
            .then(|| self.credential.secret().map(|s| s.stdin_line()))
            .flatten()
    }
}

impl StepExecutor for ChrootExecutor {
    fn stream(
        &mut self,
        command: &str,
        elevated: bool,
        on_line: &mut dyn FnMut(&str),
    ) -> Result<i32> {
        let argv = self.argv(command, elevated);
        debug!(elevated, "streaming command");
        let secret = self.secret_bytes(elevated);
        let credential = &self.credential;
        stream_in_pty(&argv, secret.as_deref(), &mut |line| {
            on_line(&credential.redact(line))
        })
    }

    fn capture(&mut self, command: &str, elevated: bool) -> Result<Captured> {
        let mut cmd = Cmd::from_argv(&self.argv(command, elevated))?.allow_fail();
        if let Some(bytes) = self.secret_bytes(elevated) {
            cmd = cmd.stdin_bytes(bytes);
        }
        let result = cmd.run()?;
        Ok(Captured {
            code: result.code(),
            lines: result
                .lines()
                .iter()
                .map(|l| self.credential.redact(l))
                .collect(),
        })
    }

    fn interactive(&mut self, command: &str, elevated: bool) -> Result<i32> {
        let launcher = match &self.terminal {
            Some(launcher) => launcher.clone(),
            None => TerminalLauncher::detect()?,
        };

        // The emulator itself is elevated so the secret can go to sudo's
        // stdin rather than to the user's terminal session.
        let script = vec![self.shell.clone(), "-lc".to_string(), command.to_string()];
        let argv = if elevated {
            let mut inner = vec!["chroot".to_string(), self.target_root.display().to_string()];
            inner.extend(script);
            self.credential.wrap(launcher.argv(inner))
        } else {
            launcher.argv(script)
        };

        let mut cmd = Cmd::from_argv(&argv)?.allow_fail();
        if let Some(bytes) = self.secret_bytes(elevated) {
            cmd = cmd.stdin_bytes(bytes);
        }
        let result = cmd
            .run()
            .with_context(|| format!("Failed to launch {}", launcher.name()))?;
        Ok(result.code())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credential::Secret;

    #[test]
    fn test_elevated_argv_is_chrooted() {
        let exec = ChrootExecutor::new(Credential::NonInteractiveElevation, Path::new("/mnt/gentoo"));
        assert_eq!(
            exec.argv("emerge --sync", true),
            vec!["sudo", "-n", "chroot", "/mnt/gentoo", "/bin/bash", "-lc", "emerge --sync"]
        );
        assert_eq!(
            exec.argv("lsblk", false),
            vec!["/bin/bash", "-lc", "lsblk"]
        );
    }

    #[test]
    fn test_secret_only_for_elevated_commands() {
        let exec = ChrootExecutor::new(
            Credential::ValidatedSecret(Secret::new("pw")),
            Path::new("/mnt/gentoo"),
        );
        assert_eq!(exec.secret_bytes(true), Some(b"pw\n".to_vec()));
        assert_eq!(exec.secret_bytes(false), None);
    }

    #[test]
    fn test_capture_unelevated() {
        let mut exec = ChrootExecutor::new(Credential::AlreadyPrivileged, Path::new("/"))
            .shell("bash");
        let captured = exec.capture("echo out; echo err >&2; exit 2", false).unwrap();
        assert_eq!(captured.code, 2);
        assert_eq!(captured.lines, vec!["out", "err"]);
    }

    #[test]
    fn test_stream_unelevated() {
        let mut exec = ChrootExecutor::new(Credential::AlreadyPrivileged, Path::new("/"))
            .shell("bash");
        let mut seen = Vec::new();
        let code = exec
            .stream("echo '>>> Emerging (1 of 1) a/b-1'", false, &mut |l| {
                seen.push(l.to_string())
            })
            .unwrap();
        assert_eq!(code, 0);
        assert_eq!(seen, vec![">>> Emerging (1 of 1) a/b-1"]);
    }
}
