//! Output markers the extractors look for.
//!
//! The defaults match what the package manager and kernel build tool print
//! today. Both lists are configuration so a tool upgrade that rewords its
//! output only needs a config change.

use anyhow::{bail, Context, Result};
use regex::Regex;
use serde::Deserialize;

/// A phase in a package's build pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PhaseMarker {
    /// Regular expression matched against each cleaned line.
    pub pattern: String,
    /// Text shown next to the package while in this phase.
    pub label: String,
    /// Source compilation phase: sub-progress is live here.
    #[serde(default)]
    pub compiling: bool,
    /// Package finished: sub-progress stays hidden for the rest of the step.
    #[serde(default)]
    pub completed: bool,
}

impl PhaseMarker {
    fn new(pattern: &str, label: &str) -> Self {
        Self {
            pattern: pattern.to_string(),
            label: label.to_string(),
            compiling: false,
            completed: false,
        }
    }

    fn compiling(mut self) -> Self {
        self.compiling = true;
        self
    }

    fn completed(mut self) -> Self {
        self.completed = true;
        self
    }
}

/// Ordered phase markers plus an optional completion marker.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PhaseVocabulary {
    pub phases: Vec<PhaseMarker>,
    /// Matched independently of the phases.
    #[serde(default)]
    pub completion: Option<String>,
}

impl PhaseVocabulary {
    /// unpack → compile → test → install → post-install
    pub fn primary() -> Self {
        Self {
            phases: vec![
                PhaseMarker::new(r">>> Unpacking source", "Unpacking source"),
                PhaseMarker::new(r">>> Compiling", "Compiling").compiling(),
                PhaseMarker::new(r">>> Testing", "Testing"),
                PhaseMarker::new(r">>> Installing", "Installing"),
                PhaseMarker::new(r">>> Running postinst", "Running postinst"),
            ],
            completion: Some(r">>> Completed".to_string()),
        }
    }

    /// unpack → install → complete → emerge → copy → check
    pub fn alternate() -> Self {
        Self {
            phases: vec![
                PhaseMarker::new(r">>> Unpacking", "Unpacking..."),
                PhaseMarker::new(r">>> Installing", "Installing..."),
                PhaseMarker::new(r">>> Completed", "Completed!").completed(),
                PhaseMarker::new(r">>> Emerging", "Emerging..."),
                PhaseMarker::new(r"Copying", "Copying..."),
                PhaseMarker::new(r"checking", "Checking..."),
            ],
            completion: None,
        }
    }

    /// Named preset (`primary` or `alternate`).
    pub fn preset(name: &str) -> Result<Self> {
        match name {
            "primary" => Ok(Self::primary()),
            "alternate" => Ok(Self::alternate()),
            other => bail!(
                "unknown phase vocabulary '{}'; expected 'primary' or 'alternate'",
                other
            ),
        }
    }

    pub fn compile(&self) -> Result<CompiledVocabulary> {
        if self.phases.is_empty() {
            bail!("phase vocabulary must contain at least one phase");
        }
        let phases = self
            .phases
            .iter()
            .map(|marker| {
                Regex::new(&marker.pattern)
                    .with_context(|| format!("invalid phase pattern '{}'", marker.pattern))
                    .map(|re| (re, marker.clone()))
            })
            .collect::<Result<Vec<_>>>()?;
        let completion = self
            .completion
            .as_deref()
            .map(|p| Regex::new(p).with_context(|| format!("invalid completion pattern '{}'", p)))
            .transpose()?;
        Ok(CompiledVocabulary { phases, completion })
    }
}

impl Default for PhaseVocabulary {
    fn default() -> Self {
        Self::primary()
    }
}

/// Regex-compiled form of a [`PhaseVocabulary`].
#[derive(Debug, Clone)]
pub struct CompiledVocabulary {
    phases: Vec<(Regex, PhaseMarker)>,
    completion: Option<Regex>,
}

impl CompiledVocabulary {
    pub fn len(&self) -> usize {
        self.phases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.phases.is_empty()
    }

    pub fn marker(&self, index: usize) -> Option<&PhaseMarker> {
        self.phases.get(index).map(|(_, m)| m)
    }

    /// Position of the first phase whose pattern matches `line`.
    pub fn match_phase(&self, line: &str) -> Option<usize> {
        self.phases.iter().position(|(re, _)| re.is_match(line))
    }

    pub fn is_completion(&self, line: &str) -> bool {
        self.completion.as_ref().is_some_and(|re| re.is_match(line))
    }
}

/// Kernel build milestones in the order the build tool reaches them.
pub fn default_kernel_milestones() -> Vec<String> {
    [
        "kernel: >> Initializing",
        "Running 'make mrproper'",
        "Running 'make oldconfig'",
        "We are now building Linux kernel",
        "Compiling",
        "Installing",
        "Generating module dependency data",
        "Compiling out-of-tree module",
        "Saving config of successful build",
        "initramfs: >> Initializing",
        "Appending devices cpio data",
        "Appending busybox cpio data",
        "Appending modprobed cpio data",
        "Deduping cpio data",
        "Compressing cpio data",
        "Kernel compiled successfully!",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}
