use anyhow::{anyhow, bail, Context, Result};
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use tracing::{info, warn};

use distro_installer::config::InstallerConfig;
use distro_installer::credential::{acquire, Credential, SudoElevator, TtyPrompt};
use distro_installer::disks::{DiskProbe, Lsblk};
use distro_installer::install::{start_install, BaseSystemPolicy, Installation, SystemHost};
use distro_installer::lock::InstanceLock;
use distro_installer::mount::{bind_system_dirs, mount_target_root, release_target, MountState, SystemDirs, SystemMounts};
use distro_installer::plan::{load_plan, validate_plan};
use distro_installer::report::{now_unix, RunReport};
use distro_installer::sentinel::{ensure_base_system, BaseSystem};
use distro_installer::sequencer::{run_result, ChannelReporter};
use distro_installer::terminal::TerminalLauncher;
use distro_installer::{InstallError, RunResult};

use crate::controller::Controller;

pub(crate) struct RunOptions {
    pub(crate) plan: PathBuf,
    pub(crate) config: Option<PathBuf>,
    pub(crate) verbose: bool,
    pub(crate) unpack: bool,
    pub(crate) release: bool,
}

impl RunOptions {
    pub(crate) fn parse(plan: &str, rest: &[String]) -> Result<Self> {
        let mut opts = Self {
            plan: PathBuf::from(plan),
            config: None,
            verbose: false,
            unpack: false,
            release: false,
        };
        let mut iter = rest.iter();
        while let Some(arg) = iter.next() {
            match arg.as_str() {
                "--config" => {
                    let value = iter.next().context("--config requires a path")?;
                    opts.config = Some(PathBuf::from(value));
                }
                "--verbose" | "-v" => opts.verbose = true,
                "--unpack" => opts.unpack = true,
                "--release" => opts.release = true,
                other => bail!("unknown option '{}' for run", other),
            }
        }
        Ok(opts)
    }
}

/// Devices for the `mount` command.
#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct MountOptions {
    pub(crate) root_device: Option<String>,
    pub(crate) boot_device: Option<String>,
}

impl MountOptions {
    pub(crate) fn parse(rest: &[String]) -> Result<Self> {
        let mut opts = Self::default();
        let mut iter = rest.iter();
        while let Some(arg) = iter.next() {
            match arg.as_str() {
                "--root" => opts.root_device = Some(iter.next().context("--root requires a device")?.clone()),
                "--boot" => opts.boot_device = Some(iter.next().context("--boot requires a device")?.clone()),
                other => bail!("unknown option '{}' for mount", other),
            }
        }
        Ok(opts)
    }
}

fn credential(config: &InstallerConfig) -> Result<Credential, InstallError> {
    acquire(
        &SudoElevator,
        &mut TtyPrompt::new(),
        config.installer.max_credential_attempts,
    )
}

pub(crate) fn run(opts: RunOptions) -> Result<RunResult> {
    let config = InstallerConfig::load(opts.config.as_deref())?;
    let _lock = InstanceLock::acquire(&config.installer.lock_file)?;

    let loaded = load_plan(&opts.plan)?;
    validate_plan(&loaded.plan, &Lsblk)
        .with_context(|| format!("validating plan '{}'", opts.plan.display()))?;
    info!(plan = %opts.plan.display(), fingerprint = %loaded.fingerprint, "plan loaded");

    let target_root = config.installer.target_root.clone();
    let boot_source = loaded
        .plan
        .profile
        .boot_partition
        .clone()
        .or_else(|| config.mounts.boot_source.clone());
    let install = Installation {
        dirs: SystemDirs::detect(
            &target_root,
            boot_source,
            config.mounts.display_sockets,
            config.mounts.user_runtime,
            &config.mounts.resolv_conf,
        ),
        base_system: if opts.unpack {
            BaseSystemPolicy::Unpack(None)
        } else {
            BaseSystemPolicy::Require
        },
        max_credential_attempts: config.installer.max_credential_attempts,
    };

    let launcher = if loaded.plan.steps.iter().any(|s| s.terminal) {
        Some(TerminalLauncher::detect()?)
    } else {
        None
    };
    let mut host = SystemHost::new(&target_root, config.installer.shell.clone()).terminal(launcher);
    let sequencer = config.sequencer(opts.verbose || config.installer.verbose)?;
    let mut controller = Controller::new(config.installer.log_file.as_deref())?;

    let started_at = now_unix();
    let (tx, rx) = mpsc::channel();
    let started = start_install(
        &install,
        &mut host,
        &SudoElevator,
        &mut TtyPrompt::new(),
        sequencer,
        loaded.plan.steps.clone(),
        Box::new(ChannelReporter::new(tx)),
    );

    let (outcomes, result) = match started {
        Ok(handle) => {
            let reported = controller.drain(rx);
            let outcomes = handle
                .join()
                .map_err(|_| anyhow!("installation worker panicked"))?;
            let result = reported.unwrap_or_else(|| run_result(&outcomes));
            (outcomes, result)
        }
        Err(err) => {
            controller.drain(rx);
            (Vec::new(), RunResult::from(&err))
        }
    };

    let report = RunReport::new(loaded.fingerprint, &target_root, started_at, outcomes, result.clone())?;
    match report.write(&config.report_dir()) {
        Ok(path) => info!(report = %path.display(), "run report written"),
        Err(e) => warn!(error = %format!("{:#}", e), "could not write run report"),
    }

    if opts.release {
        for target in host.release()? {
            eprintln!("released {}", target.display());
        }
    }

    eprintln!("{}", result);
    Ok(result)
}

pub(crate) fn mount(target_root: &Path, opts: MountOptions, config: &InstallerConfig) -> Result<()> {
    let credential = credential(config)?;
    let mut ops = SystemMounts::new(credential);

    if let Some(device) = &opts.root_device {
        match mount_target_root(&mut ops, device, target_root)? {
            MountState::AlreadyMounted => eprintln!("{} already mounted", target_root.display()),
            MountState::MountedNow => eprintln!("mounted {} at {}", device, target_root.display()),
        }
    }

    let dirs = SystemDirs::detect(
        target_root,
        opts.boot_device.or_else(|| config.mounts.boot_source.clone()),
        config.mounts.display_sockets,
        config.mounts.user_runtime,
        &config.mounts.resolv_conf,
    );
    let mounted = bind_system_dirs(&mut ops, &dirs)?;
    eprintln!("{} system mount(s) applied under {}", mounted, target_root.display());
    Ok(())
}

pub(crate) fn release(target_root: &Path, config: &InstallerConfig) -> Result<()> {
    let credential = credential(config)?;
    let released = release_target(&mut SystemMounts::new(credential), target_root)?;
    if released.is_empty() {
        eprintln!("nothing mounted under {}", target_root.display());
    }
    for target in released {
        eprintln!("released {}", target.display());
    }
    Ok(())
}

pub(crate) fn unpack(target_root: &Path, archive: Option<&Path>, config: &InstallerConfig) -> Result<()> {
    let credential = credential(config)?;
    match ensure_base_system(target_root, archive, &credential)? {
        BaseSystem::AlreadyUnpacked => eprintln!("base system already present in {}", target_root.display()),
        BaseSystem::UnpackedNow => eprintln!("base system unpacked into {}", target_root.display()),
    }
    Ok(())
}

pub(crate) fn disks() -> Result<()> {
    let probe = Lsblk;
    for disk in probe.list_disks()? {
        println!(
            "{:<14} {:>8}  {} {}",
            disk.path, disk.size, disk.vendor, disk.model
        );
        for part in probe.list_partitions(&disk.path)? {
            println!("  {}", part);
        }
    }
    Ok(())
}
