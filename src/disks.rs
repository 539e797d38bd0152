//! Disk enumeration via `lsblk`, used to check a plan's target disk.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::process::Cmd;

/// A whole disk as reported by `lsblk`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Disk {
    pub path: String,
    pub model: String,
    pub vendor: String,
    pub size: String,
}

/// Host block devices.
pub trait DiskProbe {
    fn list_disks(&self) -> Result<Vec<Disk>>;
    fn list_partitions(&self, disk: &str) -> Result<Vec<String>>;
}

/// [`DiskProbe`] backed by `lsblk`.
pub struct Lsblk;

impl DiskProbe for Lsblk {
    fn list_disks(&self) -> Result<Vec<Disk>> {
        let result = Cmd::new("lsblk")
            .args(["-J", "-o", "NAME,TYPE,SIZE,MODEL,VENDOR"])
            .error_msg("listing block devices")
            .run()?;
        parse_disks(&result.stdout)
    }

    fn list_partitions(&self, disk: &str) -> Result<Vec<String>> {
        let result = Cmd::new("lsblk")
            .args(["-ln", "-o", "NAME,TYPE", disk])
            .error_msg(format!("listing partitions of {}", disk))
            .run()?;
        Ok(parse_partitions(&result.stdout))
    }
}

#[derive(Deserialize)]
struct LsblkJson {
    blockdevices: Vec<LsblkDevice>,
}

#[derive(Deserialize)]
struct LsblkDevice {
    name: String,
    #[serde(rename = "type")]
    kind: String,
    size: Option<String>,
    model: Option<String>,
    vendor: Option<String>,
}

fn field(value: Option<String>) -> String {
    value.map(|v| v.trim().to_string()).unwrap_or_default()
}

/// Whole disks from `lsblk -J` output.
pub fn parse_disks(json: &str) -> Result<Vec<Disk>> {
    let parsed: LsblkJson = serde_json::from_str(json).context("parsing lsblk JSON output")?;
    Ok(parsed
        .blockdevices
        .into_iter()
        .filter(|dev| dev.kind == "disk")
        .map(|dev| Disk {
            path: format!("/dev/{}", dev.name),
            model: field(dev.model),
            vendor: field(dev.vendor),
            size: field(dev.size),
        })
        .collect())
}

/// Partition device paths from `lsblk -ln -o NAME,TYPE` output.
pub fn parse_partitions(text: &str) -> Vec<String> {
    text.lines()
        .filter_map(|line| {
            let mut cols = line.split_whitespace();
            match (cols.next(), cols.next()) {
                (Some(name), Some("part")) => Some(format!("/dev/{}", name)),
                _ => None,
            }
        })
        .collect()
}
