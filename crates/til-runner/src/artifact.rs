use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::Result;
use chrono::Utc;
use serde::Serialize;
use til_core::ensure_dir;

use crate::config::Configuration;

pub const ADJUSTED_PROBLEM_FILE: &str = "adjusted.pddl";
pub const ADJUST_LOG_FILE: &str = "adjust.log";
pub const PLANNER_STDOUT_FILE: &str = "planner.out";
pub const PLANNER_STDERR_FILE: &str = "planner.error";
pub const PLAN_FILE: &str = "plan";
pub const VALIDATION_LOG_FILE: &str = "val.log";
pub const OUTCOME_FILE: &str = "outcome.json";

/// Per-run filesystem namespace,
/// `<results_root>/<domain_name>/<problem_name>/<adjustment>/`.
#[derive(Debug, Clone)]
pub struct ArtifactDir {
    pub dir: PathBuf,
    pub adjusted_problem: PathBuf,
    pub adjust_log: PathBuf,
    pub planner_stdout: PathBuf,
    pub planner_stderr: PathBuf,
    pub plan: PathBuf,
    pub validation_log: PathBuf,
    pub outcome: PathBuf,
}

impl ArtifactDir {
    pub fn new(results_root: &Path, configuration: &Configuration) -> ArtifactDir {
        let dir = results_root
            .join(&configuration.domain_name)
            .join(&configuration.problem_name)
            .join(configuration.adjustment.to_string());
        ArtifactDir {
            adjusted_problem: dir.join(ADJUSTED_PROBLEM_FILE),
            adjust_log: dir.join(ADJUST_LOG_FILE),
            planner_stdout: dir.join(PLANNER_STDOUT_FILE),
            planner_stderr: dir.join(PLANNER_STDERR_FILE),
            plan: dir.join(PLAN_FILE),
            validation_log: dir.join(VALIDATION_LOG_FILE),
            outcome: dir.join(OUTCOME_FILE),
            dir,
        }
    }

    pub fn prepare(&self) -> Result<()> {
        ensure_dir(&self.dir)
    }
}

pub fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }
    let ts = Utc::now().timestamp_micros();
    let pid = std::process::id();
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("tmpfile");
    let tmp = path.with_file_name(format!(".{}.tmp.{}.{}", name, pid, ts));
    let mut file = fs::File::create(&tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    fs::rename(&tmp, path)?;
    if let Some(parent) = path.parent() {
        if let Ok(dir) = fs::File::open(parent) {
            let _ = dir.sync_all();
        }
    }
    Ok(())
}

pub fn atomic_write_json_pretty<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    atomic_write_bytes(path, &bytes)
}
