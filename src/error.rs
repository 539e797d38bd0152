//! Error taxonomy for the installation engine.
//!
//! Pre-run failures (mounts, credentials) abort before any step executes.
//! Step failures abort the rest of the plan but keep the outcomes gathered
//! so far. The sequencer reports a [`InstallError::RecoverableDependency`]
//! when the recovery policy re-runs a step; a step whose final outcome is a
//! failure ends the run as [`InstallError::StepExecution`].

use std::fmt;
use std::path::PathBuf;

use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum InstallError {
    #[error("failed to mount {}: {message}", target.display())]
    Mount { target: PathBuf, message: String },

    #[error("elevated credentials rejected after {attempts} attempt(s)")]
    Credential { attempts: u32 },

    #[error("step '{label}' failed with exit code {code}: {detail}")]
    StepExecution {
        label: String,
        code: i32,
        detail: String,
    },

    #[error("step '{label}' is blocked on a package configuration change ({signature})")]
    RecoverableDependency { label: String, signature: String },

    #[error("credential prompt cancelled by user")]
    Cancelled,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl InstallError {
    pub fn mount(target: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        InstallError::Mount {
            target: target.into(),
            message: message.into(),
        }
    }
}

/// Terminal result of a run as exposed to the controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum RunResult {
    Success,
    Failed { code: i32, message: String },
    AbortedByUser,
    CredentialExhausted,
}

impl RunResult {
    pub fn is_success(&self) -> bool {
        matches!(self, RunResult::Success)
    }

    /// Process exit code for the binary.
    pub fn exit_code(&self) -> i32 {
        match self {
            RunResult::Success => 0,
            RunResult::Failed { .. } => 1,
            RunResult::CredentialExhausted => 2,
            RunResult::AbortedByUser => 130,
        }
    }
}

impl From<&InstallError> for RunResult {
    fn from(err: &InstallError) -> Self {
        match err {
            InstallError::Credential { .. } => RunResult::CredentialExhausted,
            InstallError::Cancelled => RunResult::AbortedByUser,
            InstallError::StepExecution {
                label,
                code,
                detail,
            } => RunResult::Failed {
                code: *code,
                message: format!("{}: {}", label, detail),
            },
            other => RunResult::Failed {
                code: -1,
                message: other.to_string(),
            },
        }
    }
}

impl fmt::Display for RunResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunResult::Success => write!(f, "installation finished successfully"),
            RunResult::Failed { code, message } => {
                write!(f, "installation failed (exit code {code}): {message}")
            }
            RunResult::AbortedByUser => write!(f, "installation aborted by user"),
            RunResult::CredentialExhausted => {
                write!(f, "installation aborted: administrator password rejected")
            }
        }
    }
}
