//! Bounded automatic recovery for blocked package manager runs.
//!
//! When a package manager step fails because it wants configuration
//! changes accepted, the policy accepts them non-interactively and the
//! sequencer re-runs the identical command. Everything else, including a
//! second failure after the retry, is fatal.

use anyhow::{Context, Result};
use regex::Regex;

use crate::step::StepClassification;

pub const DEFAULT_SIGNATURES: &[&str] = &[
    "perhaps you need --autounmask-write",
    "use changes are necessary to proceed",
];

/// Remediation passes, run in order inside the target root.
pub const DEFAULT_REMEDIATION: &[&str] = &[
    "emerge --autounmask-write {package}",
    "yes | etc-update --automode -3",
];

pub const DEFAULT_BUILD_LOG_PATTERN: &str = r"(/var/tmp/portage/\S+/temp/build\.log)";

/// What the sequencer does with a failed step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Run `remediation` then the original command once more.
    Retry {
        signature: String,
        package: String,
        remediation: Vec<String>,
    },
    /// Surface `detail` as the failure.
    Fail { detail: String },
}

/// `(signatures, max_retries, remediation)` plus the build-log locator.
#[derive(Debug, Clone)]
pub struct RecoveryPolicy {
    signatures: Vec<String>,
    max_retries: u32,
    remediation: Vec<String>,
    build_log: Regex,
}

impl Default for RecoveryPolicy {
    fn default() -> Self {
        Self {
            signatures: DEFAULT_SIGNATURES.iter().map(|s| s.to_string()).collect(),
            max_retries: 1,
            remediation: DEFAULT_REMEDIATION.iter().map(|s| s.to_string()).collect(),
            build_log: Regex::new(DEFAULT_BUILD_LOG_PATTERN).expect("build log pattern is valid"),
        }
    }
}

impl RecoveryPolicy {
    /// `max_retries` is capped at one; a step is never retried twice.
    pub fn new(
        signatures: Vec<String>,
        max_retries: u32,
        remediation: Vec<String>,
        build_log_pattern: &str,
    ) -> Result<Self> {
        let build_log = Regex::new(build_log_pattern)
            .with_context(|| format!("invalid build log pattern '{}'", build_log_pattern))?;
        Ok(Self {
            signatures: signatures.into_iter().map(|s| s.to_lowercase()).collect(),
            max_retries: max_retries.min(1),
            remediation,
            build_log,
        })
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// First failure signature present in `output`, compared case-insensitively.
    pub fn matched_signature(&self, output: &str) -> Option<&str> {
        let haystack = output.to_lowercase();
        self.signatures
            .iter()
            .find(|sig| !sig.is_empty() && haystack.contains(&sig.to_lowercase()))
            .map(String::as_str)
    }

    /// Remediation commands with `{package}` filled in.
    pub fn remediation_for(&self, package: &str) -> Vec<String> {
        self.remediation
            .iter()
            .map(|cmd| cmd.replace("{package}", package))
            .collect()
    }

    /// Last build log path mentioned in `output`.
    pub fn build_log_path(&self, output: &str) -> Option<String> {
        self.build_log
            .captures_iter(output)
            .last()
            .and_then(|caps| caps.get(1).or_else(|| caps.get(0)))
            .map(|m| m.as_str().to_string())
    }

    /// Failure text: the build log when one is named, else the raw exit message.
    pub fn failure_detail(&self, output: &str, raw: &str) -> String {
        self.build_log_path(output)
            .unwrap_or_else(|| raw.to_string())
    }

    /// Decide how to handle a non-zero exit.
    ///
    /// `package` is the first package argument of the failed command; a
    /// command without one cannot be remediated.
    pub fn decide(
        &self,
        classification: StepClassification,
        output: &str,
        package: Option<&str>,
        retries_used: u32,
        raw: &str,
    ) -> Decision {
        if classification == StepClassification::PackageManagerStreaming
            && retries_used < self.max_retries
        {
            if let (Some(signature), Some(package)) = (self.matched_signature(output), package) {
                return Decision::Retry {
                    signature: signature.to_string(),
                    package: package.to_string(),
                    remediation: self.remediation_for(package),
                };
            }
        }
        Decision::Fail {
            detail: self.failure_detail(output, raw),
        }
    }
}
