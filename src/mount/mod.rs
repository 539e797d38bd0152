//! Mount lifecycle for the target root.
//!
//! Every mount goes through [`ensure_mounted`], which consults the live
//! mount table first so a target is never mounted twice by this engine.
//! Privileged effects sit behind [`MountOps`]; [`SystemMounts`] runs the
//! real `mount`/`umount`/`mkdir`/`cp` commands with the run's credential.
//!
//! - [`table`] - mountinfo parsing
//! - [`system`] - the ordered special-filesystem sequence for a target root

pub mod system;
pub mod table;

pub use system::{bind_system_dirs, mount_target_root, release_target, SystemDirs};
pub use table::{MountTable, MOUNTINFO};

use anyhow::Result;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::credential::Credential;
use crate::error::InstallError;

/// How the source is attached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountMode {
    /// Plain mount, optionally with a filesystem type.
    None,
    /// `mount --bind`
    Bind,
    /// `mount --rbind`
    RecursiveBind,
}

/// A single mount to apply to the target root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountSpec {
    pub source: String,
    pub target: PathBuf,
    pub mode: MountMode,
    pub fs_type: Option<String>,
    pub options: Option<String>,
    /// Mark the new mount recursive-slave after attaching it.
    pub rslave: bool,
}

impl MountSpec {
    pub fn new(source: impl Into<String>, target: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            mode: MountMode::None,
            fs_type: None,
            options: None,
            rslave: false,
        }
    }

    pub fn fs_type(mut self, fs_type: impl Into<String>) -> Self {
        self.fs_type = Some(fs_type.into());
        self
    }

    pub fn options(mut self, options: impl Into<String>) -> Self {
        self.options = Some(options.into());
        self
    }

    pub fn bind(mut self) -> Self {
        self.mode = MountMode::Bind;
        self
    }

    /// Recursive bind, then recursive-slave.
    pub fn rbind_slave(mut self) -> Self {
        self.mode = MountMode::RecursiveBind;
        self.rslave = true;
        self
    }

    /// `mount` argv for this spec.
    pub fn argv(&self) -> Vec<String> {
        let mut argv = vec!["mount".to_string()];
        match self.mode {
            MountMode::None => {
                if let Some(fs_type) = &self.fs_type {
                    argv.extend(["-t".to_string(), fs_type.clone()]);
                }
            }
            MountMode::Bind => argv.push("--bind".to_string()),
            MountMode::RecursiveBind => argv.push("--rbind".to_string()),
        }
        if let Some(options) = &self.options {
            argv.extend(["-o".to_string(), options.clone()]);
        }
        argv.push(self.source.clone());
        argv.push(self.target.display().to_string());
        argv
    }
}

impl fmt::Display for MountSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.source, self.target.display())
    }
}

/// Result of [`ensure_mounted`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountState {
    AlreadyMounted,
    MountedNow,
}

/// Privileged mount-table effects.
pub trait MountOps {
    /// Inspect the live mount table for `target`.
    fn is_mounted(&self, target: &Path) -> Result<bool>;

    /// Mount point currently backed by `device`.
    fn mount_point_of(&self, device: &str) -> Result<Option<PathBuf>>;

    /// Create the mount point (and parents).
    fn create_dir(&mut self, target: &Path) -> Result<()>;

    /// Attach `spec` without any idempotency check.
    fn mount(&mut self, spec: &MountSpec) -> Result<()>;

    /// `mount --make-rslave target`
    fn make_rslave(&mut self, target: &Path) -> Result<()>;

    /// `umount -l target`
    fn unmount_lazy(&mut self, target: &Path) -> Result<()>;

    /// Copy a host file into the target, following symlinks.
    fn copy_file(&mut self, source: &Path, dest: &Path) -> Result<()>;
}

/// Mount `spec` unless its target is already a mount point.
pub fn ensure_mounted(ops: &mut dyn MountOps, spec: &MountSpec) -> Result<MountState, InstallError> {
    let mounted = ops
        .is_mounted(&spec.target)
        .map_err(|e| InstallError::mount(&spec.target, format!("{:#}", e)))?;
    if mounted {
        debug!(target = %spec.target.display(), "already mounted");
        return Ok(MountState::AlreadyMounted);
    }

    ops.create_dir(&spec.target)
        .and_then(|_| ops.mount(spec))
        .map_err(|e| InstallError::mount(&spec.target, format!("{:#}", e)))?;

    if spec.rslave {
        ops.make_rslave(&spec.target)
            .map_err(|e| InstallError::mount(&spec.target, format!("{:#}", e)))?;
    }

    info!(source = %spec.source, target = %spec.target.display(), "mounted");
    Ok(MountState::MountedNow)
}

/// [`MountOps`] on the live host.
pub struct SystemMounts {
    credential: Credential,
    mountinfo: PathBuf,
}

impl SystemMounts {
    pub fn new(credential: Credential) -> Self {
        Self {
            credential,
            mountinfo: PathBuf::from(MOUNTINFO),
        }
    }

    fn run(&self, argv: Vec<String>, what: &str) -> Result<()> {
        self.credential.command(argv)?.error_msg(what).run()?;
        Ok(())
    }
}

impl MountOps for SystemMounts {
    fn is_mounted(&self, target: &Path) -> Result<bool> {
        Ok(MountTable::read(&self.mountinfo)?.is_mount_point(target))
    }

    fn mount_point_of(&self, device: &str) -> Result<Option<PathBuf>> {
        Ok(MountTable::read(&self.mountinfo)?
            .mount_point_of(device)
            .map(Path::to_path_buf))
    }

    fn create_dir(&mut self, target: &Path) -> Result<()> {
        if target.is_dir() {
            return Ok(());
        }
        self.run(
            vec!["mkdir".into(), "-p".into(), target.display().to_string()],
            &format!("creating mount point {}", target.display()),
        )
    }

    fn mount(&mut self, spec: &MountSpec) -> Result<()> {
        self.run(spec.argv(), &format!("mount {}", spec))
    }

    fn make_rslave(&mut self, target: &Path) -> Result<()> {
        self.run(
            vec![
                "mount".into(),
                "--make-rslave".into(),
                target.display().to_string(),
            ],
            &format!("marking {} recursive-slave", target.display()),
        )
    }

    fn unmount_lazy(&mut self, target: &Path) -> Result<()> {
        self.run(
            vec!["umount".into(), "-l".into(), target.display().to_string()],
            &format!("unmounting {}", target.display()),
        )
    }

    fn copy_file(&mut self, source: &Path, dest: &Path) -> Result<()> {
        self.run(
            vec![
                "cp".into(),
                "-L".into(),
                source.display().to_string(),
                dest.display().to_string(),
            ],
            &format!("copying {} to {}", source.display(), dest.display()),
        )
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::BTreeSet;

    /// In-memory mount table that records every effect.
    #[derive(Default)]
    pub(crate) struct FakeMounts {
        pub mounted: BTreeSet<PathBuf>,
        pub log: Vec<String>,
        pub fail_on: Option<PathBuf>,
        pub sources: Vec<(String, PathBuf)>,
    }

    impl MountOps for FakeMounts {
        fn is_mounted(&self, target: &Path) -> Result<bool> {
            Ok(self.mounted.contains(target))
        }

        fn mount_point_of(&self, device: &str) -> Result<Option<PathBuf>> {
            Ok(self
                .sources
                .iter()
                .find(|(source, target)| source == device && self.mounted.contains(target))
                .map(|(_, target)| target.clone()))
        }

        fn create_dir(&mut self, target: &Path) -> Result<()> {
            self.log.push(format!("mkdir {}", target.display()));
            Ok(())
        }

        fn mount(&mut self, spec: &MountSpec) -> Result<()> {
            if self.fail_on.as_deref() == Some(spec.target.as_path()) {
                anyhow::bail!("mount exited with code 32");
            }
            self.log.push(spec.argv().join(" "));
            self.mounted.insert(spec.target.clone());
            self.sources.push((spec.source.clone(), spec.target.clone()));
            Ok(())
        }

        fn make_rslave(&mut self, target: &Path) -> Result<()> {
            self.log.push(format!("rslave {}", target.display()));
            Ok(())
        }

        fn unmount_lazy(&mut self, target: &Path) -> Result<()> {
            self.log.push(format!("umount {}", target.display()));
            self.mounted.remove(target);
            Ok(())
        }

        fn copy_file(&mut self, source: &Path, dest: &Path) -> Result<()> {
            self.log
                .push(format!("cp {} {}", source.display(), dest.display()));
            Ok(())
        }
    }

    impl FakeMounts {
        pub(crate) fn mount_calls(&self) -> usize {
            self.log.iter().filter(|l| l.starts_with("mount ")).count()
        }
    }

    #[test]
    fn test_ensure_mounted_twice_mounts_once() {
        let mut ops = FakeMounts::default();
        let spec = MountSpec::new("proc", "/mnt/gentoo/proc").fs_type("proc");

        assert_eq!(
            ensure_mounted(&mut ops, &spec).unwrap(),
            MountState::MountedNow
        );
        assert_eq!(
            ensure_mounted(&mut ops, &spec).unwrap(),
            MountState::AlreadyMounted
        );
        assert_eq!(ops.mount_calls(), 1);
    }

    #[test]
    fn test_rslave_applied_after_rbind() {
        let mut ops = FakeMounts::default();
        let spec = MountSpec::new("/sys", "/mnt/gentoo/sys").rbind_slave();
        ensure_mounted(&mut ops, &spec).unwrap();
        assert_eq!(
            ops.log,
            vec![
                "mkdir /mnt/gentoo/sys",
                "mount --rbind /sys /mnt/gentoo/sys",
                "rslave /mnt/gentoo/sys",
            ]
        );
    }

    #[test]
    fn test_mount_failure_names_target() {
        let mut ops = FakeMounts {
            fail_on: Some(PathBuf::from("/mnt/gentoo/dev")),
            ..Default::default()
        };
        let spec = MountSpec::new("/dev", "/mnt/gentoo/dev").rbind_slave();
        let err = ensure_mounted(&mut ops, &spec).unwrap_err();
        match err {
            InstallError::Mount { target, message } => {
                assert_eq!(target, PathBuf::from("/mnt/gentoo/dev"));
                assert!(message.contains("code 32"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_argv_shapes() {
        assert_eq!(
            MountSpec::new("devpts", "/r/dev/pts")
                .fs_type("devpts")
                .options("gid=5,mode=620")
                .argv(),
            vec!["mount", "-t", "devpts", "-o", "gid=5,mode=620", "devpts", "/r/dev/pts"]
        );
        assert_eq!(
            MountSpec::new("/tmp/.X11-unix", "/r/tmp/.X11-unix")
                .bind()
                .argv(),
            vec!["mount", "--bind", "/tmp/.X11-unix", "/r/tmp/.X11-unix"]
        );
        assert_eq!(
            MountSpec::new("/dev/sda1", "/r/boot").argv(),
            vec!["mount", "/dev/sda1", "/r/boot"]
        );
    }
}
