//! Special filesystems a target root needs to behave like a live system.
//!
//! [`bind_system_dirs`] applies them in a fixed order. A failure stops the
//! sequence; mounts made by earlier sub-steps stay in place and are the
//! caller's to release (see [`release_target`]).

use std::path::{Path, PathBuf};
use tracing::info;

use super::table::normalize;
use super::{ensure_mounted, MountOps, MountSpec, MountState};
use crate::error::InstallError;

/// Host X11 socket directory.
pub const X11_SOCKET_DIR: &str = "/tmp/.X11-unix";

/// devpts options granting the tty group terminal access.
pub const DEVPTS_OPTIONS: &str = "gid=5,mode=620";

/// Inputs for [`bind_system_dirs`], resolved against the host up front.
#[derive(Debug, Clone)]
pub struct SystemDirs {
    pub target_root: PathBuf,
    /// Boot/EFI partition mounted at `<root>/boot`.
    pub boot_source: Option<String>,
    /// Host display socket directory to bind, if present.
    pub display_sockets: Option<PathBuf>,
    /// Host per-user runtime directory (`/run/user/<uid>`), if present.
    pub user_runtime: Option<PathBuf>,
    /// Host name-resolution file copied into the target.
    pub resolv_conf: PathBuf,
}

impl SystemDirs {
    /// Resolve optional host directories from the live system.
    ///
    /// The user runtime directory belongs to the invoking user, so
    /// `SUDO_UID` wins over the effective uid.
    pub fn detect(
        target_root: &Path,
        boot_source: Option<String>,
        display_sockets: bool,
        user_runtime: bool,
        resolv_conf: &Path,
    ) -> Self {
        let display_sockets = display_sockets
            .then(|| PathBuf::from(X11_SOCKET_DIR))
            .filter(|p| p.exists());

        let user_runtime = user_runtime
            .then(|| PathBuf::from(format!("/run/user/{}", invoking_uid())))
            .filter(|p| p.exists());

        Self {
            target_root: target_root.to_path_buf(),
            boot_source,
            display_sockets,
            user_runtime,
            resolv_conf: resolv_conf.to_path_buf(),
        }
    }

    /// Mounts in application order.
    pub fn specs(&self) -> Vec<MountSpec> {
        let root = &self.target_root;
        let mut specs = Vec::new();

        if let Some(boot) = &self.boot_source {
            specs.push(MountSpec::new(boot.clone(), root.join("boot")));
        }
        specs.push(MountSpec::new("proc", root.join("proc")).fs_type("proc"));
        specs.push(MountSpec::new("/sys", root.join("sys")).rbind_slave());
        specs.push(MountSpec::new("/dev", root.join("dev")).rbind_slave());
        specs.push(
            MountSpec::new("devpts", root.join("dev/pts"))
                .fs_type("devpts")
                .options(DEVPTS_OPTIONS),
        );
        specs.push(MountSpec::new("/run", root.join("run")).rbind_slave());

        if let Some(sockets) = &self.display_sockets {
            specs.push(
                MountSpec::new(sockets.display().to_string(), reroot(root, sockets)).bind(),
            );
        }
        if let Some(runtime) = &self.user_runtime {
            specs.push(
                MountSpec::new(runtime.display().to_string(), reroot(root, runtime)).rbind_slave(),
            );
        }
        specs
    }
}

/// `<root>/<absolute host path>`
fn reroot(root: &Path, host_path: &Path) -> PathBuf {
    root.join(host_path.strip_prefix("/").unwrap_or(host_path))
}

fn invoking_uid() -> u32 {
    std::env::var("SUDO_UID")
        .ok()
        .and_then(|v| v.parse().ok())
        // SAFETY: getuid has no preconditions and cannot fail.
        .unwrap_or_else(|| unsafe { libc::getuid() })
}

/// Attach every special filesystem, then copy the name-resolution file.
///
/// Returns how many mounts were newly applied.
pub fn bind_system_dirs(ops: &mut dyn MountOps, dirs: &SystemDirs) -> Result<usize, InstallError> {
    let mut mounted_now = 0;
    for spec in dirs.specs() {
        if ensure_mounted(ops, &spec)? == MountState::MountedNow {
            mounted_now += 1;
        }
    }

    let dest = reroot(&dirs.target_root, &dirs.resolv_conf);
    ops.copy_file(&dirs.resolv_conf, &dest)
        .map_err(|e| InstallError::mount(&dest, format!("{:#}", e)))?;

    info!(
        target_root = %dirs.target_root.display(),
        mounted_now,
        "system directories ready"
    );
    Ok(mounted_now)
}

/// Mount the root partition at the target root.
///
/// A device that is already mounted somewhere else is refused.
pub fn mount_target_root(
    ops: &mut dyn MountOps,
    device: &str,
    target_root: &Path,
) -> Result<MountState, InstallError> {
    let current = ops
        .mount_point_of(device)
        .map_err(|e| InstallError::mount(target_root, format!("{:#}", e)))?;
    if let Some(elsewhere) = current {
        if normalize(&elsewhere) != normalize(target_root) {
            return Err(InstallError::mount(
                target_root,
                format!("{} is already mounted at {}", device, elsewhere.display()),
            ));
        }
    }
    ensure_mounted(ops, &MountSpec::new(device, target_root))
}

/// Lazily detach `<root>/boot` and the target root.
///
/// Detaching the root takes every nested special filesystem with it.
pub fn release_target(ops: &mut dyn MountOps, target_root: &Path) -> Result<Vec<PathBuf>, InstallError> {
    let mut released = Vec::new();
    for mount_point in [target_root.join("boot"), target_root.to_path_buf()] {
        let mounted = ops
            .is_mounted(&mount_point)
            .map_err(|e| InstallError::mount(&mount_point, format!("{:#}", e)))?;
        if !mounted {
            continue;
        }
        ops.unmount_lazy(&mount_point)
            .map_err(|e| InstallError::mount(&mount_point, format!("{:#}", e)))?;
        info!(target = %mount_point.display(), "released");
        released.push(mount_point);
    }
    Ok(released)
}
