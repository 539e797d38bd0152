use std::path::Path;
use std::process::ExitCode;

use anyhow::{bail, Result};
use distro_installer::config::InstallerConfig;
use distro_installer::RunResult;

mod commands;
mod controller;

use commands::{MountOptions, RunOptions};

fn usage() -> &'static str {
    "Usage:\n  distro-installer run <plan.toml> [--config <path>] [--verbose] [--unpack] [--release]\n  distro-installer mount <target_root> [--root <device>] [--boot <device>]\n  distro-installer release <target_root>\n  distro-installer unpack <target_root> [archive]\n  distro-installer disks"
}

fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let verbose = args.iter().any(|a| a == "--verbose" || a == "-v");
    init_tracing(verbose);

    match dispatch(&args) {
        Ok(result) => ExitCode::from(result.exit_code() as u8),
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose {
        "info,distro_installer=debug"
    } else {
        "info,distro_installer=info"
    };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default)),
        )
        .init();
}

fn dispatch(args: &[String]) -> Result<RunResult> {
    match args {
        [run, plan, rest @ ..] if run == "run" => commands::run(RunOptions::parse(plan, rest)?),
        [mount, root, rest @ ..] if mount == "mount" => {
            let opts = MountOptions::parse(rest)?;
            commands::mount(Path::new(root), opts, &InstallerConfig::load(None)?)?;
            Ok(RunResult::Success)
        }
        [release, root] if release == "release" => {
            commands::release(Path::new(root), &InstallerConfig::load(None)?)?;
            Ok(RunResult::Success)
        }
        [unpack, root] if unpack == "unpack" => {
            commands::unpack(Path::new(root), None, &InstallerConfig::load(None)?)?;
            Ok(RunResult::Success)
        }
        [unpack, root, archive] if unpack == "unpack" => {
            commands::unpack(
                Path::new(root),
                Some(Path::new(archive)),
                &InstallerConfig::load(None)?,
            )?;
            Ok(RunResult::Success)
        }
        [disks] if disks == "disks" => {
            commands::disks()?;
            Ok(RunResult::Success)
        }
        _ => bail!(usage()),
    }
}
