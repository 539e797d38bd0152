//! Plan steps and command classification.
//!
//! A [`Step`] is produced by an external planner and never modified here.
//! Its command is an opaque, already-rendered shell string; the engine only
//! inspects it for known tool invocation tokens.

use serde::{Deserialize, Serialize};
use std::fmt;

/// One entry of the ordered step plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Step {
    pub label: String,
    pub command: String,
    #[serde(default = "default_true")]
    pub requires_elevation: bool,
    /// Run inside a terminal emulator so the user can interact with it.
    #[serde(default)]
    pub terminal: bool,
}

fn default_true() -> bool {
    true
}

impl Step {
    pub fn new(label: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            command: command.into(),
            requires_elevation: true,
            terminal: false,
        }
    }
}

/// How a step's output is consumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepClassification {
    /// Package manager run; parsed live for package/phase progress.
    PackageManagerStreaming,
    /// Kernel build; parsed live for milestones.
    KernelBuildStreaming,
    /// Output captured whole and inspected after exit.
    Buffered,
}

impl StepClassification {
    pub fn is_streaming(self) -> bool {
        !matches!(self, StepClassification::Buffered)
    }
}

impl fmt::Display for StepClassification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepClassification::PackageManagerStreaming => write!(f, "package-manager"),
            StepClassification::KernelBuildStreaming => write!(f, "kernel-build"),
            StepClassification::Buffered => write!(f, "buffered"),
        }
    }
}

/// Maps commands to a [`StepClassification`] by tool name.
#[derive(Debug, Clone)]
pub struct Classifier {
    package_manager: Vec<String>,
    kernel_build: Vec<String>,
}

impl Default for Classifier {
    fn default() -> Self {
        Self::new(vec!["emerge".into()], vec!["genkernel".into()])
    }
}

impl Classifier {
    pub fn new(package_manager: Vec<String>, kernel_build: Vec<String>) -> Self {
        Self {
            package_manager,
            kernel_build,
        }
    }

    pub fn package_manager_tools(&self) -> &[String] {
        &self.package_manager
    }

    /// Package-manager invocations win over kernel builds when both appear.
    pub fn classify(&self, command: &str) -> StepClassification {
        if invokes_any(command, &self.package_manager) {
            StepClassification::PackageManagerStreaming
        } else if invokes_any(command, &self.kernel_build) {
            StepClassification::KernelBuildStreaming
        } else {
            StepClassification::Buffered
        }
    }
}

/// Split a shell command into pipeline segments (`&&`, `||`, `;`, `|`,
/// newlines) and each segment into words.
fn segments(command: &str) -> Vec<Vec<&str>> {
    command
        .split(['\n', ';', '&', '|'])
        .map(|segment| {
            segment
                .split(|c: char| c.is_whitespace() || c == '(' || c == ')' || c == '`')
                .map(|word| word.trim_matches(['"', '\'']))
                .filter(|word| !word.is_empty())
                .collect::<Vec<_>>()
        })
        .filter(|words| !words.is_empty())
        .collect()
}

fn is_tool(word: &str, tools: &[String]) -> bool {
    let base = word.rsplit('/').next().unwrap_or(word);
    tools.iter().any(|tool| tool == base)
}

fn invokes_any(command: &str, tools: &[String]) -> bool {
    segments(command)
        .iter()
        .flatten()
        .any(|word| is_tool(word, tools))
}

/// First package argument given to one of `tools` in `command`.
///
/// Options (leading `-`) and bare numbers (option values such as
/// `--jobs 4`) are skipped; a segment without a package argument does not
/// end the search.
pub fn first_package_argument(command: &str, tools: &[String]) -> Option<String> {
    for words in segments(command) {
        let Some(pos) = words.iter().position(|w| is_tool(w, tools)) else {
            continue;
        };
        let found = words[pos + 1..].iter().find(|w| {
            !w.starts_with('-') && !w.chars().all(|c| c.is_ascii_digit()) && !is_tool(w, tools)
        });
        if let Some(package) = found {
            return Some(package.to_string());
        }
    }
    None
}
