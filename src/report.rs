use anyhow::{Context, Result};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use time::OffsetDateTime;

use crate::error::RunResult;
use crate::sequencer::RunOutcome;

const RUN_REPORT_FILENAME: &str = "run-report.json";

/// Persisted audit trail of one run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub plan_fingerprint: String,
    pub target_root: PathBuf,
    pub started_at_unix: i64,
    pub finished_at_unix: i64,
    pub started_at_utc: String,
    pub outcomes: Vec<RunOutcome>,
    pub result: RunResult,
}

pub fn report_path(report_dir: &Path) -> PathBuf {
    report_dir.join(RUN_REPORT_FILENAME)
}

pub fn now_unix() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}

/// `YYYYMMDDTHHMMSSZ`
pub fn format_utc_compact(unix: i64) -> Result<String> {
    let at = OffsetDateTime::from_unix_timestamp(unix)
        .with_context(|| format!("timestamp {} out of range", unix))?;
    Ok(format!(
        "{:04}{:02}{:02}T{:02}{:02}{:02}Z",
        at.year(),
        at.month() as u8,
        at.day(),
        at.hour(),
        at.minute(),
        at.second()
    ))
}

impl RunReport {
    pub fn new(
        plan_fingerprint: String,
        target_root: &Path,
        started_at_unix: i64,
        outcomes: Vec<RunOutcome>,
        result: RunResult,
    ) -> Result<Self> {
        Ok(Self {
            plan_fingerprint,
            target_root: target_root.to_path_buf(),
            started_at_unix,
            finished_at_unix: now_unix(),
            started_at_utc: format_utc_compact(started_at_unix)?,
            outcomes,
            result,
        })
    }

    /// Write `run-report.json` into `report_dir`, replacing any previous one.
    pub fn write(&self, report_dir: &Path) -> Result<PathBuf> {
        fs::create_dir_all(report_dir)
            .with_context(|| format!("creating report directory '{}'", report_dir.display()))?;
        let path = report_path(report_dir);
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_vec_pretty(self).context("serializing run report")?;
        fs::write(&tmp, json).with_context(|| format!("writing '{}'", tmp.display()))?;
        fs::rename(&tmp, &path).with_context(|| format!("renaming to '{}'", path.display()))?;
        Ok(path)
    }
}
