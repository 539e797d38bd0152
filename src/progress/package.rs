//! Progress extraction for package manager output.

use regex::Regex;
use std::sync::OnceLock;

use super::vocabulary::CompiledVocabulary;
use super::{ProgressExtractor, ProgressState, ProgressUpdate};

static PACKAGE_RE: OnceLock<Regex> = OnceLock::new();
static FRACTION_RE: OnceLock<Regex> = OnceLock::new();
static PERCENT_RE: OnceLock<Regex> = OnceLock::new();
static VERSION_RE: OnceLock<Regex> = OnceLock::new();

/// `>>> Emerging (2 of 5) foo/bar-1.0::gentoo`
fn package_re() -> &'static Regex {
    PACKAGE_RE.get_or_init(|| {
        Regex::new(r">>> (?:Emerging|Installing)\s*\(\s*(\d+)\s+of\s+(\d+)\s*\)\s+(\S+)")
            .expect("package pattern is valid")
    })
}

/// `[ 12/340]` or `[3 of 9]`
fn fraction_re() -> &'static Regex {
    FRACTION_RE.get_or_init(|| {
        Regex::new(r"\[\s*(\d+)\s*(?:/|of)\s*(\d+)\s*\]").expect("fraction pattern is valid")
    })
}

/// `[ 42%]`
fn percent_re() -> &'static Regex {
    PERCENT_RE
        .get_or_init(|| Regex::new(r"\[\s*(\d{1,3})\s*%\]").expect("percent pattern is valid"))
}

/// Version tail: `-1.2.3`, `-1.2.3b`, `-1.2.3_rc1`, `-1.2.3_rc1-r2`, `-9999`.
fn version_re() -> &'static Regex {
    VERSION_RE.get_or_init(|| {
        Regex::new(r"-\d+(?:\.\d+)*[a-z]?(?:_(?:alpha|beta|pre|rc|p)\d*)*(?:-r\d+)?$")
            .expect("version pattern is valid")
    })
}

/// Reduce an atom identifier to a stable package name.
///
/// `foo/bar-1.2.3_rc1-r2::gentoo` becomes `foo/bar`.
pub fn normalize_atom(atom: &str) -> String {
    let atom = atom.split("::").next().unwrap_or(atom);
    let atom = atom.trim_start_matches(['=', '<', '>', '~']);
    match version_re().find(atom) {
        Some(m) => atom[..m.start()].to_string(),
        None => atom.to_string(),
    }
}

/// Sub-file progress carried by a line, as a fraction.
pub fn sub_fraction(line: &str) -> Option<f64> {
    if let Some(caps) = fraction_re().captures(line) {
        let n: f64 = caps[1].parse().ok()?;
        let m: f64 = caps[2].parse().ok()?;
        if m > 0.0 {
            return Some((n / m).clamp(0.0, 1.0));
        }
    }
    percent_re()
        .captures(line)
        .and_then(|caps| caps[1].parse::<f64>().ok())
        .map(|pct| (pct / 100.0).clamp(0.0, 1.0))
}

/// State machine over package manager output.
pub struct PackageManagerExtractor {
    vocabulary: CompiledVocabulary,
    state: ProgressState,
    pulse_step: f64,
    pulse_direction: f64,
    completed: bool,
}

impl PackageManagerExtractor {
    pub fn new(vocabulary: CompiledVocabulary, pulse_step: f64) -> Self {
        Self {
            vocabulary,
            state: ProgressState::default(),
            pulse_step,
            pulse_direction: 1.0,
            completed: false,
        }
    }

    fn in_compiling_phase(&self) -> bool {
        self.state.phase_known
            && self
                .vocabulary
                .marker(self.state.phase_index)
                .is_some_and(|m| m.compiling)
    }

    /// Advance the liveness indicator, bouncing between 0 and 1.
    fn pulse(&mut self) {
        let mut next = self.state.sub_fraction + self.pulse_step * self.pulse_direction;
        if next >= 1.0 {
            next = 1.0;
            self.pulse_direction = -1.0;
        } else if next <= 0.0 {
            next = 0.0;
            self.pulse_direction = 1.0;
        }
        self.state.sub_fraction = next;
    }

    fn label(&self) -> String {
        let mut label = format!(
            "[{}/{}] {}",
            self.state.package_index, self.state.total_packages, self.state.current_package_name
        );
        if self.state.phase_known {
            if let Some(marker) = self.vocabulary.marker(self.state.phase_index) {
                label.push_str("  ");
                label.push_str(&marker.label);
            }
        }
        label
    }
}

impl ProgressExtractor for PackageManagerExtractor {
    fn feed(&mut self, line: &str) -> Option<ProgressUpdate> {
        let mut transition = false;
        let mut touched = false;

        if let Some(caps) = package_re().captures(line) {
            let index: u32 = caps[1].parse().unwrap_or(self.state.package_index);
            let total: u32 = caps[2].parse().unwrap_or(self.state.total_packages);
            if index != self.state.package_index {
                // A new package starts its pipeline from the first phase.
                self.state.phase_index = 0;
                self.state.phase_known = false;
                self.completed = false;
            }
            self.state.package_index = index;
            self.state.total_packages = total;
            self.state.current_package_name = normalize_atom(&caps[3]);
            transition = true;
        }

        if let Some(phase) = self.vocabulary.match_phase(line) {
            self.state.phase_index = phase;
            self.state.phase_known = true;
            let marker = self.vocabulary.marker(phase);
            if marker.is_some_and(|m| m.completed) {
                self.completed = true;
            }
            self.state.sub_visible =
                marker.is_some_and(|m| m.compiling) && !self.completed;
            transition = true;
        }

        if self.vocabulary.is_completion(line) {
            self.completed = true;
            self.state.sub_visible = false;
            transition = true;
        }

        if !self.completed {
            match sub_fraction(line) {
                Some(fraction) => {
                    self.state.sub_fraction = fraction;
                    self.state.sub_visible = true;
                    touched = true;
                }
                None if self.in_compiling_phase() => {
                    self.pulse();
                    self.state.sub_visible = true;
                    touched = true;
                }
                None => {}
            }
        }

        if !(transition || touched) || self.state.total_packages == 0 {
            return None;
        }

        Some(ProgressUpdate {
            main: self.state.main_fraction(self.vocabulary.len()),
            sub: self.state.sub_visible.then_some(self.state.sub_fraction),
            label: self.label(),
            transition,
        })
    }

    fn state(&self) -> Option<&ProgressState> {
        Some(&self.state)
    }
}
