//! Progress extraction for kernel builds.

use super::{ProgressExtractor, ProgressUpdate};

/// Tracks which build milestone the kernel tool has reached.
///
/// Milestones only move forward: a later line that also contains an
/// earlier milestone's text (module builds print "Compiling" again) is
/// ignored.
pub struct KernelBuildExtractor {
    milestones: Vec<String>,
    reached: Option<usize>,
}

impl KernelBuildExtractor {
    pub fn new(milestones: Vec<String>) -> Self {
        Self {
            milestones,
            reached: None,
        }
    }

    /// Most advanced milestone mentioned on `line`.
    fn match_milestone(&self, line: &str) -> Option<usize> {
        self.milestones
            .iter()
            .rposition(|m| !m.is_empty() && line.contains(m.as_str()))
    }
}

impl ProgressExtractor for KernelBuildExtractor {
    fn feed(&mut self, line: &str) -> Option<ProgressUpdate> {
        let index = self.match_milestone(line)?;
        if self.reached.is_some_and(|r| index < r) {
            return None;
        }
        let transition = self.reached != Some(index);
        self.reached = Some(index);

        Some(ProgressUpdate {
            main: (index + 1) as f64 / self.milestones.len() as f64,
            sub: None,
            label: format!("[kernel] {}", self.milestones[index]),
            transition,
        })
    }
}
