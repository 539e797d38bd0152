//! Installer configuration.
//!
//! Every field has a default, so a missing file yields the built-in
//! configuration. Unknown keys are rejected so typos fail loudly.
//!
//! ```toml
//! [installer]
//! target_root = "/mnt/gentoo"
//! verbose = true
//!
//! [classification]
//! watched = ["Compile kernel"]
//!
//! [parser]
//! vocabulary = "alternate"
//! ```

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use crate::credential::DEFAULT_MAX_ATTEMPTS;
use crate::progress::{
    default_kernel_milestones, ParserSettings, PhaseMarker, PhaseVocabulary, DEFAULT_PULSE_STEP,
};
use crate::recovery::{
    RecoveryPolicy, DEFAULT_BUILD_LOG_PATTERN, DEFAULT_REMEDIATION, DEFAULT_SIGNATURES,
};
use crate::sequencer::Sequencer;
use crate::step::Classifier;

/// Environment variable naming a config file.
pub const CONFIG_ENV: &str = "DISTRO_INSTALLER_CONFIG";

const APP_DIR: &str = "distro-installer";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct InstallerConfig {
    pub installer: InstallerSection,
    pub mounts: MountsSection,
    pub classification: ClassificationSection,
    pub parser: ParserSection,
    pub recovery: RecoverySection,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct InstallerSection {
    pub target_root: PathBuf,
    /// Login shell inside the target root.
    pub shell: String,
    pub verbose: bool,
    pub log_file: Option<PathBuf>,
    pub lock_file: PathBuf,
    pub max_credential_attempts: u32,
    pub report_dir: Option<PathBuf>,
}

impl Default for InstallerSection {
    fn default() -> Self {
        Self {
            target_root: PathBuf::from("/mnt/gentoo"),
            shell: "/bin/bash".to_string(),
            verbose: false,
            log_file: None,
            lock_file: std::env::temp_dir().join("distro-installer.lock"),
            max_credential_attempts: DEFAULT_MAX_ATTEMPTS,
            report_dir: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MountsSection {
    /// Boot/EFI partition mounted at `<root>/boot`.
    pub boot_source: Option<String>,
    pub display_sockets: bool,
    pub user_runtime: bool,
    pub resolv_conf: PathBuf,
}

impl Default for MountsSection {
    fn default() -> Self {
        Self {
            boot_source: None,
            display_sockets: true,
            user_runtime: true,
            resolv_conf: PathBuf::from("/etc/resolv.conf"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClassificationSection {
    pub package_manager: Vec<String>,
    pub kernel_build: Vec<String>,
    /// Step labels whose raw output is echoed to the invoking terminal.
    pub watched: Vec<String>,
}

impl Default for ClassificationSection {
    fn default() -> Self {
        Self {
            package_manager: vec!["emerge".to_string()],
            kernel_build: vec!["genkernel".to_string()],
            watched: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ParserSection {
    /// `primary` or `alternate`; ignored when `phases` is set.
    pub vocabulary: String,
    pub phases: Option<Vec<PhaseMarker>>,
    pub completion: Option<String>,
    pub kernel_milestones: Option<Vec<String>>,
    pub pulse_step: f64,
}

impl Default for ParserSection {
    fn default() -> Self {
        Self {
            vocabulary: "primary".to_string(),
            phases: None,
            completion: None,
            kernel_milestones: None,
            pulse_step: DEFAULT_PULSE_STEP,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RecoverySection {
    pub signatures: Vec<String>,
    pub max_retries: u32,
    /// Run in order; `{package}` is the failed command's first package.
    pub remediation: Vec<String>,
    pub build_log_pattern: String,
}

impl Default for RecoverySection {
    fn default() -> Self {
        Self {
            signatures: DEFAULT_SIGNATURES.iter().map(|s| s.to_string()).collect(),
            max_retries: 1,
            remediation: DEFAULT_REMEDIATION.iter().map(|s| s.to_string()).collect(),
            build_log_pattern: DEFAULT_BUILD_LOG_PATTERN.to_string(),
        }
    }
}

impl InstallerConfig {
    /// Load from the first config file found, or the defaults.
    ///
    /// Order: `explicit`, `$DISTRO_INSTALLER_CONFIG`, the user config dir.
    /// An explicitly named file must exist.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::from_file(path);
        }
        if let Some(path) = std::env::var_os(CONFIG_ENV) {
            return Self::from_file(Path::new(&path));
        }
        match default_config_path() {
            Some(path) if path.is_file() => Self::from_file(&path),
            _ => Ok(Self::default()),
        }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("reading installer config '{}'", path.display()))?;
        Self::from_toml_str(&text)
            .with_context(|| format!("parsing installer config '{}'", path.display()))
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if !self.installer.target_root.is_absolute() {
            bail!(
                "installer.target_root must be absolute, got '{}'",
                self.installer.target_root.display()
            );
        }
        if self.installer.max_credential_attempts == 0 {
            bail!("installer.max_credential_attempts must be at least 1");
        }
        if !(self.parser.pulse_step > 0.0 && self.parser.pulse_step <= 1.0) {
            bail!(
                "parser.pulse_step must be in (0, 1], got {}",
                self.parser.pulse_step
            );
        }
        if self.recovery.max_retries > 1 {
            bail!(
                "recovery.max_retries may be 0 or 1, got {}",
                self.recovery.max_retries
            );
        }
        // Surface bad patterns at load time rather than mid-run.
        self.parser_settings()?.vocabulary.compile()?;
        self.recovery_policy()?;
        Ok(())
    }

    pub fn classifier(&self) -> Classifier {
        Classifier::new(
            self.classification.package_manager.clone(),
            self.classification.kernel_build.clone(),
        )
    }

    pub fn parser_settings(&self) -> Result<ParserSettings> {
        let vocabulary = match &self.parser.phases {
            Some(phases) => PhaseVocabulary {
                phases: phases.clone(),
                completion: self.parser.completion.clone(),
            },
            None => PhaseVocabulary::preset(&self.parser.vocabulary)?,
        };
        Ok(ParserSettings {
            vocabulary,
            kernel_milestones: self
                .parser
                .kernel_milestones
                .clone()
                .unwrap_or_else(default_kernel_milestones),
            pulse_step: self.parser.pulse_step,
        })
    }

    pub fn recovery_policy(&self) -> Result<RecoveryPolicy> {
        RecoveryPolicy::new(
            self.recovery.signatures.clone(),
            self.recovery.max_retries,
            self.recovery.remediation.clone(),
            &self.recovery.build_log_pattern,
        )
    }

    /// Sequencer for a run; `verbose` adds to the configured setting.
    pub fn sequencer(&self, verbose: bool) -> Result<Sequencer> {
        Ok(Sequencer {
            classifier: self.classifier(),
            parser: self.parser_settings()?,
            recovery: self.recovery_policy()?,
            verbose: verbose || self.installer.verbose,
            watched: self
                .classification
                .watched
                .iter()
                .cloned()
                .collect::<BTreeSet<_>>(),
        })
    }

    /// Where run reports go: configured dir, else the user cache dir.
    pub fn report_dir(&self) -> PathBuf {
        self.installer
            .report_dir
            .clone()
            .or_else(|| dirs::cache_dir().map(|d| d.join(APP_DIR)))
            .unwrap_or_else(|| std::env::temp_dir().join(APP_DIR))
    }
}

/// `<config dir>/distro-installer/config.toml`
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join(APP_DIR).join("config.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_empty_file_is_default() {
        let config = InstallerConfig::from_toml_str("").unwrap();
        assert_eq!(config.installer.target_root, PathBuf::from("/mnt/gentoo"));
        assert_eq!(config.installer.max_credential_attempts, 3);
        assert_eq!(config.classification.package_manager, vec!["emerge"]);
        assert!(config.mounts.display_sockets);
        let sequencer = config.sequencer(false).unwrap();
        assert!(!sequencer.verbose);
        assert_eq!(sequencer.parser.vocabulary, PhaseVocabulary::primary());
    }

    #[test]
    fn test_sections_override_defaults() {
        let config = InstallerConfig::from_toml_str(
            r#"
[installer]
target_root = "/mnt/target"
verbose = true

[mounts]
boot_source = "/dev/nvme0n1p1"
display_sockets = false

[classification]
watched = ["Compile kernel", "Install programs"]

[parser]
vocabulary = "alternate"
pulse_step = 0.05
kernel_milestones = ["Initializing", "Done"]

[recovery]
max_retries = 0
"#,
        )
        .unwrap();

        assert_eq!(config.mounts.boot_source.as_deref(), Some("/dev/nvme0n1p1"));
        let sequencer = config.sequencer(false).unwrap();
        assert!(sequencer.verbose);
        assert!(sequencer.watched.contains("Compile kernel"));
        assert_eq!(sequencer.parser.vocabulary, PhaseVocabulary::alternate());
        assert_eq!(sequencer.parser.kernel_milestones.len(), 2);
        assert_eq!(sequencer.recovery.max_retries(), 0);
    }

    #[test]
    fn test_custom_phase_list() {
        let config = InstallerConfig::from_toml_str(
            r#"
[parser]
completion = "^>>> Done"

[[parser.phases]]
pattern = "^>>> Fetch"
label = "Fetching"

[[parser.phases]]
pattern = "^>>> Build"
label = "Building"
compiling = true
"#,
        )
        .unwrap();
        let settings = config.parser_settings().unwrap();
        assert_eq!(settings.vocabulary.phases.len(), 2);
        assert!(settings.vocabulary.phases[1].compiling);
        assert_eq!(settings.vocabulary.completion.as_deref(), Some("^>>> Done"));
    }

    #[test]
    fn test_rejects_invalid_values() {
        assert!(InstallerConfig::from_toml_str("[installer]\ntarget_root = \"relative\"").is_err());
        assert!(InstallerConfig::from_toml_str("[installer]\nmax_credential_attempts = 0").is_err());
        assert!(InstallerConfig::from_toml_str("[parser]\npulse_step = 0.0").is_err());
        assert!(InstallerConfig::from_toml_str("[parser]\nvocabulary = \"verbose\"").is_err());
        assert!(InstallerConfig::from_toml_str("[recovery]\nmax_retries = 3").is_err());
        assert!(InstallerConfig::from_toml_str("[recovery]\nbuild_log_pattern = \"(\"").is_err());
        assert!(InstallerConfig::from_toml_str("[installer]\ntypo = 1").is_err());
    }

    #[test]
    fn test_explicit_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[installer]\nshell = \"/bin/sh\"\n").unwrap();
        let config = InstallerConfig::load(Some(&path)).unwrap();
        assert_eq!(config.installer.shell, "/bin/sh");

        let missing = dir.path().join("absent.toml");
        let err = InstallerConfig::load(Some(&missing)).unwrap_err();
        assert!(format!("{:#}", err).contains("absent.toml"));
    }

    #[test]
    fn test_report_dir_override() {
        let config = InstallerConfig::from_toml_str("[installer]\nreport_dir = \"/var/log/inst\"").unwrap();
        assert_eq!(config.report_dir(), PathBuf::from("/var/log/inst"));
    }
}
