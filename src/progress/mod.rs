//! Live progress extraction from tool output.
//!
//! Each streaming [`StepClassification`] gets a small state machine that
//! turns cleaned output lines into [`ProgressUpdate`]s. The sequencer picks
//! one per step through [`extractor_for`] and otherwise treats it as opaque.
//!
//! - [`ansi`] - escape sequence removal applied before parsing
//! - [`vocabulary`] - phase markers and kernel milestones

pub mod ansi;
mod kernel;
mod package;
pub mod vocabulary;

pub use ansi::strip_ansi;
pub use kernel::KernelBuildExtractor;
pub use package::{normalize_atom, PackageManagerExtractor};
pub use vocabulary::{default_kernel_milestones, PhaseMarker, PhaseVocabulary};

use anyhow::Result;
use serde::Serialize;

use crate::step::StepClassification;

/// Default liveness increment while compiling without exact counts.
pub const DEFAULT_PULSE_STEP: f64 = 0.02;

/// One progress event for the controller.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressUpdate {
    /// Overall fraction for the current step, `0..=1`.
    pub main: f64,
    /// Sub-progress fraction, `None` when the indicator is hidden.
    pub sub: Option<f64>,
    pub label: String,
    /// Package, phase or milestone change. These must reach the
    /// controller; pure sub-progress ticks may be coalesced.
    pub transition: bool,
}

/// Per-step parser state, discarded when the step ends.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProgressState {
    pub phase_index: usize,
    /// Whether any phase marker has been seen for the current package.
    pub phase_known: bool,
    pub package_index: u32,
    pub total_packages: u32,
    pub current_package_name: String,
    pub sub_fraction: f64,
    pub sub_visible: bool,
}

impl ProgressState {
    /// `((package - 1) + (phase + 1) / phases) / packages`, clamped to `0..=1`.
    pub fn main_fraction(&self, num_phases: usize) -> f64 {
        if self.total_packages == 0 || num_phases == 0 {
            return 0.0;
        }
        let done = self.package_index.saturating_sub(1) as f64;
        let within = (self.phase_index + 1) as f64 / num_phases as f64;
        ((done + within) / self.total_packages as f64).clamp(0.0, 1.0)
    }
}

/// Line-at-a-time progress parser.
pub trait ProgressExtractor: Send {
    /// Consume one cleaned line. `None` means the line changed nothing
    /// worth reporting.
    fn feed(&mut self, line: &str) -> Option<ProgressUpdate>;

    /// Package-level state, for extractors that keep one.
    fn state(&self) -> Option<&ProgressState> {
        None
    }
}

/// Parser configuration shared by every step of a run.
#[derive(Debug, Clone)]
pub struct ParserSettings {
    pub vocabulary: PhaseVocabulary,
    pub kernel_milestones: Vec<String>,
    pub pulse_step: f64,
}

impl Default for ParserSettings {
    fn default() -> Self {
        Self {
            vocabulary: PhaseVocabulary::primary(),
            kernel_milestones: default_kernel_milestones(),
            pulse_step: DEFAULT_PULSE_STEP,
        }
    }
}

/// Fresh extractor for a step, or `None` for buffered steps.
pub fn extractor_for(
    classification: StepClassification,
    settings: &ParserSettings,
) -> Result<Option<Box<dyn ProgressExtractor>>> {
    Ok(match classification {
        StepClassification::PackageManagerStreaming => Some(Box::new(
            PackageManagerExtractor::new(settings.vocabulary.compile()?, settings.pulse_step),
        )),
        StepClassification::KernelBuildStreaming if !settings.kernel_milestones.is_empty() => {
            Some(Box::new(KernelBuildExtractor::new(
                settings.kernel_milestones.clone(),
            )))
        }
        StepClassification::KernelBuildStreaming | StepClassification::Buffered => None,
    })
}
