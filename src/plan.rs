//! Step plans produced by the external planner.
//!
//! A plan is a TOML file with an optional `[profile]` and an ordered list
//! of `[[step]]` tables. The engine never reorders or rewrites steps; it
//! only checks that the plan is runnable against this host.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use crate::disks::DiskProbe;
use crate::step::Step;

/// Planner inputs the engine can check.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Profile {
    pub username: Option<String>,
    pub target_disk: Option<String>,
    pub boot_partition: Option<String>,
    /// `uefi` or `bios`.
    pub firmware: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Plan {
    #[serde(default)]
    pub profile: Profile,
    #[serde(rename = "step", default)]
    pub steps: Vec<Step>,
}

/// A parsed plan plus the sha256 of the file it came from.
#[derive(Debug, Clone)]
pub struct LoadedPlan {
    pub plan: Plan,
    pub fingerprint: String,
}

pub fn load_plan(path: &Path) -> Result<LoadedPlan> {
    let bytes = fs::read(path).with_context(|| format!("reading plan '{}'", path.display()))?;
    let text = std::str::from_utf8(&bytes)
        .with_context(|| format!("plan '{}' is not UTF-8", path.display()))?;
    let plan: Plan =
        toml::from_str(text).with_context(|| format!("parsing plan '{}'", path.display()))?;
    Ok(LoadedPlan {
        plan,
        fingerprint: fingerprint(&bytes),
    })
}

/// Lowercase hex sha256.
pub fn fingerprint(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Check a plan before anything touches the host.
///
/// Steps need distinct non-empty labels and non-empty commands; the
/// profile's disk and boot partition must exist when given.
pub fn validate_plan(plan: &Plan, disks: &dyn DiskProbe) -> Result<()> {
    if plan.steps.is_empty() {
        bail!("plan contains no steps");
    }

    let mut seen = BTreeSet::new();
    for (i, step) in plan.steps.iter().enumerate() {
        let label = step.label.trim();
        if label.is_empty() {
            bail!("step {} has an empty label", i + 1);
        }
        if step.command.trim().is_empty() {
            bail!("step '{}' has an empty command", label);
        }
        if !seen.insert(label) {
            bail!("duplicate step label '{}'", label);
        }
    }

    if let Some(firmware) = &plan.profile.firmware {
        if firmware != "uefi" && firmware != "bios" {
            bail!(
                "profile.firmware must be 'uefi' or 'bios', got '{}'",
                firmware
            );
        }
    }

    if let Some(disk) = &plan.profile.target_disk {
        let available = disks.list_disks()?;
        if !available.iter().any(|d| &d.path == disk) {
            bail!(
                "target disk {} not found; available: {}",
                disk,
                available
                    .iter()
                    .map(|d| d.path.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            );
        }
        if let Some(boot) = &plan.profile.boot_partition {
            let partitions = disks.list_partitions(disk)?;
            if !partitions.contains(boot) {
                bail!("boot partition {} is not a partition of {}", boot, disk);
            }
        }
    } else if plan.profile.boot_partition.is_some() {
        bail!("profile.boot_partition requires profile.target_disk");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disks::Disk;
    use tempfile::TempDir;

    struct FakeDisks;

    impl DiskProbe for FakeDisks {
        fn list_disks(&self) -> Result<Vec<Disk>> {
            Ok(vec![Disk {
                path: "/dev/sda".into(),
                model: "QEMU HARDDISK".into(),
                vendor: "ATA".into(),
                size: "40G".into(),
            }])
        }

        fn list_partitions(&self, _disk: &str) -> Result<Vec<String>> {
            Ok(vec!["/dev/sda1".into(), "/dev/sda2".into()])
        }
    }

    const PLAN: &str = r#"
[profile]
username = "alice"
target_disk = "/dev/sda"
boot_partition = "/dev/sda1"
firmware = "uefi"

[[step]]
label = "Sync repository"
command = "emerge --sync"

[[step]]
label = "Set password"
command = "passwd alice"
terminal = true

[[step]]
label = "List host disks"
command = "lsblk"
requires_elevation = false
"#;

    fn parse(text: &str) -> Plan {
        toml::from_str(text).unwrap()
    }

    #[test]
    fn test_load_plan_keeps_order_and_fingerprint() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("plan.toml");
        fs::write(&path, PLAN).unwrap();

        let loaded = load_plan(&path).unwrap();
        let labels: Vec<_> = loaded.plan.steps.iter().map(|s| s.label.as_str()).collect();
        assert_eq!(labels, vec!["Sync repository", "Set password", "List host disks"]);
        assert!(loaded.plan.steps[1].terminal);
        assert!(!loaded.plan.steps[2].requires_elevation);
        assert_eq!(loaded.fingerprint, fingerprint(PLAN.as_bytes()));
        assert_eq!(loaded.fingerprint.len(), 64);
    }

    #[test]
    fn test_valid_plan() {
        validate_plan(&parse(PLAN), &FakeDisks).unwrap();
    }

    #[test]
    fn test_duplicate_and_empty_steps_rejected() {
        let dup = parse(
            "[[step]]\nlabel = \"A\"\ncommand = \"true\"\n[[step]]\nlabel = \"A\"\ncommand = \"false\"\n",
        );
        assert!(validate_plan(&dup, &FakeDisks).is_err());

        let empty_cmd = parse("[[step]]\nlabel = \"A\"\ncommand = \"  \"\n");
        assert!(validate_plan(&empty_cmd, &FakeDisks).is_err());

        assert!(validate_plan(&parse(""), &FakeDisks).is_err());
    }

    #[test]
    fn test_unknown_disk_rejected() {
        let plan = parse("[profile]\ntarget_disk = \"/dev/vdb\"\n[[step]]\nlabel = \"A\"\ncommand = \"true\"\n");
        let err = validate_plan(&plan, &FakeDisks).unwrap_err().to_string();
        assert!(err.contains("/dev/vdb"));
        assert!(err.contains("/dev/sda"));

        let plan = parse("[profile]\ntarget_disk = \"/dev/sda\"\nboot_partition = \"/dev/sdb1\"\n[[step]]\nlabel = \"A\"\ncommand = \"true\"\n");
        assert!(validate_plan(&plan, &FakeDisks).is_err());
    }

    #[test]
    fn test_unknown_keys_rejected() {
        assert!(toml::from_str::<Plan>("[[step]]\nlabel = \"A\"\ncommand = \"x\"\nretry = 2\n").is_err());
    }
}
