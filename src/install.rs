//! Run orchestration: credential gate, target preparation, then the plan.
//!
//! ```text
//! acquire credential ──► base system present? ──► bind system dirs ──► spawn worker
//!        │                       │                       │
//!        └─ Credential/Cancelled └─ missing marker       └─ Mount
//! ```
//!
//! Every pre-run failure is reported as the run's terminal result before
//! any step executes.

use anyhow::anyhow;
use std::path::{Path, PathBuf};
use std::thread::JoinHandle;
use tracing::info;

use crate::credential::{acquire, Credential, Elevator, SecretSource};
use crate::error::{InstallError, RunResult};
use crate::mount::{bind_system_dirs, release_target, MountOps, SystemDirs, SystemMounts};
use crate::runner::{ChrootExecutor, StepExecutor};
use crate::sentinel::{self, BaseSystem};
use crate::sequencer::{spawn_run, Reporter, RunEvent, RunOutcome, Sequencer};
use crate::step::Step;
use crate::terminal::TerminalLauncher;

/// What to do when the base-system marker is missing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BaseSystemPolicy {
    /// Refuse to run.
    Require,
    /// Unpack the given archive, or the newest one found in the target.
    Unpack(Option<PathBuf>),
}

/// Everything the run needs besides the plan itself.
#[derive(Debug, Clone)]
pub struct Installation {
    pub dirs: SystemDirs,
    pub base_system: BaseSystemPolicy,
    pub max_credential_attempts: u32,
}

impl Installation {
    pub fn target_root(&self) -> &Path {
        &self.dirs.target_root
    }
}

/// Host effects the orchestration needs once a credential exists.
pub trait Host {
    fn mounts(&mut self, credential: &Credential) -> &mut dyn MountOps;

    fn executor(&mut self, credential: &Credential) -> Box<dyn StepExecutor>;

    fn is_unpacked(&self, target_root: &Path) -> bool;

    fn unpack(
        &mut self,
        target_root: &Path,
        archive: Option<&Path>,
        credential: &Credential,
    ) -> anyhow::Result<BaseSystem>;
}

/// [`Host`] for the live system.
pub struct SystemHost {
    shell: String,
    terminal: Option<TerminalLauncher>,
    mounts: Option<SystemMounts>,
    target_root: PathBuf,
}

impl SystemHost {
    pub fn new(target_root: &Path, shell: impl Into<String>) -> Self {
        Self {
            shell: shell.into(),
            terminal: None,
            mounts: None,
            target_root: target_root.to_path_buf(),
        }
    }

    pub fn terminal(mut self, launcher: Option<TerminalLauncher>) -> Self {
        self.terminal = launcher;
        self
    }

    /// Detach the target root with the credential the run mounted it with.
    /// Does nothing if the run never reached the mount stage.
    pub fn release(&mut self) -> Result<Vec<PathBuf>, InstallError> {
        match self.mounts.as_mut() {
            Some(mounts) => release_target(mounts, &self.target_root),
            None => Ok(Vec::new()),
        }
    }
}

impl Host for SystemHost {
    fn mounts(&mut self, credential: &Credential) -> &mut dyn MountOps {
        self.mounts.insert(SystemMounts::new(credential.clone()))
    }

    fn executor(&mut self, credential: &Credential) -> Box<dyn StepExecutor> {
        let mut executor =
            ChrootExecutor::new(credential.clone(), &self.target_root).shell(self.shell.clone());
        if let Some(launcher) = &self.terminal {
            executor = executor.terminal(launcher.clone());
        }
        Box::new(executor)
    }

    fn is_unpacked(&self, target_root: &Path) -> bool {
        sentinel::is_unpacked(target_root)
    }

    fn unpack(
        &mut self,
        target_root: &Path,
        archive: Option<&Path>,
        credential: &Credential,
    ) -> anyhow::Result<BaseSystem> {
        sentinel::ensure_base_system(target_root, archive, credential)
    }
}

/// Gate, prepare and start a run.
///
/// On success the plan is executing on a worker thread whose handle is
/// returned. On failure the error has already been reported to `reporter`
/// as the run's terminal result and no step has run.
pub fn start_install(
    install: &Installation,
    host: &mut dyn Host,
    elevator: &dyn Elevator,
    secrets: &mut dyn SecretSource,
    sequencer: Sequencer,
    steps: Vec<Step>,
    reporter: Box<dyn Reporter>,
) -> Result<JoinHandle<Vec<RunOutcome>>, InstallError> {
    let credential = match prepare(install, host, elevator, secrets) {
        Ok(credential) => credential,
        Err(err) => {
            reporter.report(RunEvent::Log(err.to_string()));
            reporter.report(RunEvent::Finished(RunResult::from(&err)));
            return Err(err);
        }
    };

    info!(steps = steps.len(), target_root = %install.target_root().display(), "starting plan");
    let executor = host.executor(&credential);
    Ok(spawn_run(sequencer, steps, executor, reporter))
}

fn prepare(
    install: &Installation,
    host: &mut dyn Host,
    elevator: &dyn Elevator,
    secrets: &mut dyn SecretSource,
) -> Result<Credential, InstallError> {
    let credential = acquire(elevator, secrets, install.max_credential_attempts)?;
    let root = install.target_root();

    if !host.is_unpacked(root) {
        match &install.base_system {
            BaseSystemPolicy::Require => {
                return Err(InstallError::Other(anyhow!(
                    "base system missing: {} not found; run with --unpack or unpack a stage archive first",
                    sentinel::marker_path(root).display()
                )));
            }
            BaseSystemPolicy::Unpack(archive) => {
                host.unpack(root, archive.as_deref(), &credential)?;
            }
        }
    }

    bind_system_dirs(host.mounts(&credential), &install.dirs)?;
    Ok(credential)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credential::tests::{FakeElevator, ScriptedSource};
    use crate::mount::tests::FakeMounts;
    use crate::sequencer::tests::{FakeExecutor, RecordingReporter};
    use crate::sequencer::ChannelReporter;
    use std::sync::mpsc;

    #[derive(Default)]
    struct FakeHost {
        mounts: FakeMounts,
        unpacked: bool,
        unpack_calls: u32,
        executors: u32,
    }

    impl Host for FakeHost {
        fn mounts(&mut self, _credential: &Credential) -> &mut dyn MountOps {
            &mut self.mounts
        }

        fn executor(&mut self, _credential: &Credential) -> Box<dyn StepExecutor> {
            self.executors += 1;
            Box::new(FakeExecutor::default())
        }

        fn is_unpacked(&self, _target_root: &Path) -> bool {
            self.unpacked
        }

        fn unpack(
            &mut self,
            _target_root: &Path,
            _archive: Option<&Path>,
            _credential: &Credential,
        ) -> anyhow::Result<BaseSystem> {
            self.unpack_calls += 1;
            self.unpacked = true;
            Ok(BaseSystem::UnpackedNow)
        }
    }

    fn installation(policy: BaseSystemPolicy) -> Installation {
        Installation {
            dirs: SystemDirs {
                target_root: PathBuf::from("/mnt/gentoo"),
                boot_source: None,
                display_sockets: None,
                user_runtime: None,
                resolv_conf: PathBuf::from("/etc/resolv.conf"),
            },
            base_system: policy,
            max_credential_attempts: 3,
        }
    }

    fn steps() -> Vec<Step> {
        vec![Step::new("Sync", "emerge --sync"), Step::new("Locale", "locale-gen")]
    }

    #[test]
    fn test_rejected_credential_runs_nothing() {
        let mut host = FakeHost {
            unpacked: true,
            ..Default::default()
        };
        let elevator = FakeElevator::with_password("hunter2");
        let mut secrets = ScriptedSource::new(&[Some("a"), Some("b"), Some("c")]);
        let (tx, rx) = mpsc::channel();

        let err = start_install(
            &installation(BaseSystemPolicy::Require),
            &mut host,
            &elevator,
            &mut secrets,
            Sequencer::default(),
            steps(),
            Box::new(ChannelReporter::new(tx)),
        )
        .unwrap_err();

        assert!(matches!(err, InstallError::Credential { attempts: 3 }));
        assert_eq!(host.executors, 0);
        assert!(host.mounts.log.is_empty());

        let events: Vec<RunEvent> = rx.iter().collect();
        assert!(!events
            .iter()
            .any(|e| matches!(e, RunEvent::StepStarted { .. })));
        assert_eq!(
            events.last(),
            Some(&RunEvent::Finished(RunResult::CredentialExhausted))
        );
    }

    #[test]
    fn test_missing_base_system_stops_before_mounts() {
        let mut host = FakeHost::default();
        let elevator = FakeElevator {
            privileged: true,
            ..FakeElevator::with_password("x")
        };
        let reporter = Box::new(RecordingReporter::default());
        let err = start_install(
            &installation(BaseSystemPolicy::Require),
            &mut host,
            &elevator,
            &mut ScriptedSource::new(&[]),
            Sequencer::default(),
            steps(),
            reporter,
        )
        .unwrap_err();
        assert!(err.to_string().contains("system.txt"));
        assert!(host.mounts.log.is_empty());
        assert_eq!(host.executors, 0);
    }

    #[test]
    fn test_full_run() {
        let mut host = FakeHost::default();
        let elevator = FakeElevator {
            passwordless: true,
            ..FakeElevator::with_password("x")
        };
        let (tx, rx) = mpsc::channel();
        let handle = start_install(
            &installation(BaseSystemPolicy::Unpack(None)),
            &mut host,
            &elevator,
            &mut ScriptedSource::new(&[]),
            Sequencer::default(),
            steps(),
            Box::new(ChannelReporter::new(tx)),
        )
        .unwrap();

        let outcomes = handle.join().unwrap();
        assert_eq!(outcomes.len(), 2);
        assert_eq!(host.unpack_calls, 1);
        assert_eq!(host.mounts.mount_calls(), 5);

        let events: Vec<RunEvent> = rx.iter().collect();
        assert_eq!(events.last(), Some(&RunEvent::Finished(RunResult::Success)));
    }
}
