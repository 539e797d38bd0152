//! Credential gate: obtain elevated privilege once per run.
//!
//! The gate resolves to one of three [`Credential`]s and the result is
//! reused for every mount and step in the run. Nothing is written to disk.
//!
//! ```rust,ignore
//! use distro_installer::credential::{acquire, SudoElevator, TtyPrompt};
//!
//! let credential = acquire(&SudoElevator, &mut TtyPrompt::new(), 3)?;
//! let argv = credential.wrap(vec!["mount".into(), "-t".into(), "proc".into()]);
//! ```

mod prompt;

pub use prompt::TtyPrompt;

use anyhow::Result;
use std::fmt;
use tracing::{debug, info, warn};

use crate::error::InstallError;
use crate::process::Cmd;

/// Default number of password attempts before giving up.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// An administrator password held in memory for the duration of a run.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    /// Bytes fed to `sudo -S`.
    pub fn stdin_line(&self) -> Vec<u8> {
        format!("{}\n", self.0).into_bytes()
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

/// How privileged commands are launched for this run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credential {
    /// The process already runs with euid 0.
    AlreadyPrivileged,
    /// `sudo -n` succeeds without asking.
    NonInteractiveElevation,
    /// A password that `sudo` accepted.
    ValidatedSecret(Secret),
}

impl Credential {
    /// Prefix `argv` with whatever elevation this credential needs.
    pub fn wrap(&self, argv: Vec<String>) -> Vec<String> {
        let prefix: &[&str] = match self {
            Credential::AlreadyPrivileged => &[],
            Credential::NonInteractiveElevation => &["sudo", "-n"],
            // -k forces sudo to consume the secret line even with a cached
            // ticket, so it never reaches the wrapped command's stdin.
            Credential::ValidatedSecret(_) => &["sudo", "-k", "-S", "-p", ""],
        };
        prefix
            .iter()
            .map(|s| s.to_string())
            .chain(argv)
            .collect()
    }

    /// Secret that must be written to the wrapped command's stdin, if any.
    pub fn secret(&self) -> Option<&Secret> {
        match self {
            Credential::ValidatedSecret(secret) => Some(secret),
            _ => None,
        }
    }

    /// Build a ready-to-run elevated [`Cmd`].
    pub fn command(&self, argv: Vec<String>) -> Result<Cmd> {
        let cmd = Cmd::from_argv(&self.wrap(argv))?;
        Ok(match self.secret() {
            Some(secret) => cmd.stdin_bytes(secret.stdin_line()),
            None => cmd,
        })
    }

    /// Replace the secret inside `line` so it never reaches logs.
    pub fn redact(&self, line: &str) -> String {
        match self.secret() {
            Some(secret) if !secret.expose().is_empty() && line.contains(secret.expose()) => {
                line.replace(secret.expose(), "***")
            }
            _ => line.to_string(),
        }
    }
}

/// Host privilege checks used by the gate.
pub trait Elevator {
    /// Whether the calling process already holds elevated privilege.
    fn is_privileged(&self) -> bool;

    /// Whether elevation succeeds silently (cached ticket, NOPASSWD rule).
    fn probe_non_interactive(&self) -> bool;

    /// Validate a candidate secret out-of-process; `true` only on exit 0.
    fn validate(&self, secret: &Secret) -> Result<bool>;
}

/// Source of candidate secrets. `Ok(None)` means the user cancelled.
pub trait SecretSource {
    fn read_secret(&mut self, attempt: u32, max_attempts: u32) -> Result<Option<Secret>>;
}

/// [`Elevator`] backed by `sudo`.
pub struct SudoElevator;

impl Elevator for SudoElevator {
    fn is_privileged(&self) -> bool {
        // SAFETY: geteuid has no preconditions and cannot fail.
        unsafe { libc::geteuid() == 0 }
    }

    fn probe_non_interactive(&self) -> bool {
        Cmd::new("sudo")
            .args(["-n", "true"])
            .allow_fail()
            .run()
            .map(|r| r.success())
            .unwrap_or(false)
    }

    fn validate(&self, secret: &Secret) -> Result<bool> {
        // -k drops any cached ticket so the candidate is actually checked.
        let result = Cmd::new("sudo")
            .args(["-k", "-S", "-p", "", "true"])
            .stdin_bytes(secret.stdin_line())
            .allow_fail()
            .run()?;
        Ok(result.success())
    }
}

/// Resolve the run's credential.
///
/// Returns [`InstallError::Credential`] once `max_attempts` secrets have been
/// rejected and [`InstallError::Cancelled`] if the source is closed. Neither
/// is ever downgraded to unprivileged execution.
pub fn acquire(
    elevator: &dyn Elevator,
    source: &mut dyn SecretSource,
    max_attempts: u32,
) -> Result<Credential, InstallError> {
    if elevator.is_privileged() {
        debug!("already running with elevated privilege");
        return Ok(Credential::AlreadyPrivileged);
    }

    if elevator.probe_non_interactive() {
        info!("non-interactive elevation available");
        return Ok(Credential::NonInteractiveElevation);
    }

    for attempt in 1..=max_attempts {
        let Some(secret) = source.read_secret(attempt, max_attempts)? else {
            return Err(InstallError::Cancelled);
        };

        if elevator.validate(&secret)? {
            info!(attempt, "administrator password accepted");
            return Ok(Credential::ValidatedSecret(secret));
        }

        warn!(attempt, max_attempts, "administrator password rejected");
    }

    Err(InstallError::Credential {
        attempts: max_attempts,
    })
}
