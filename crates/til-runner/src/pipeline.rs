use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use til_plan::Plan;
use tracing::{info, warn};

use crate::artifact::{atomic_write_json_pretty, ArtifactDir};
use crate::config::{Adjustment, Configuration, Toolchain};
use crate::process::{run_bounded, BoundedExit, RunLimits};

pub const OUTCOME_SCHEMA_VERSION: &str = "til_outcome_v1";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    ValidationFailed,
    PlannerFailed { exit_code: i32 },
    TimedOut,
    Faulted { reason: String },
}

impl RunStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, RunStatus::Success)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunStatus::Success => f.write_str("success"),
            RunStatus::ValidationFailed => f.write_str("validation_failed"),
            RunStatus::PlannerFailed { exit_code } => {
                write!(f, "planner_failed (exit {})", exit_code)
            }
            RunStatus::TimedOut => f.write_str("timed_out"),
            RunStatus::Faulted { reason } => write!(f, "faulted: {}", reason),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunOutcome {
    pub configuration: Configuration,
    pub status: RunStatus,
    pub artifact_dir: PathBuf,
    /// Goal-achievement time; set by the aggregation pass, never here.
    pub gat: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutcomeRecord {
    pub schema_version: String,
    pub configuration: Configuration,
    pub status: RunStatus,
    pub artifact_dir: PathBuf,
    pub gat: Option<f64>,
    pub started_at: String,
    pub finished_at: String,
    pub wall_seconds: f64,
}

impl OutcomeRecord {
    pub fn into_outcome(self) -> RunOutcome {
        RunOutcome {
            configuration: self.configuration,
            status: self.status,
            artifact_dir: self.artifact_dir,
            gat: self.gat,
        }
    }
}

#[derive(Debug, Error)]
enum StepError {
    #[error("planner exited with status {0}")]
    PlannerExit(i32),
    #[error("wall clock limit exceeded")]
    Deadline,
    #[error(transparent)]
    Tool(#[from] anyhow::Error),
}

/// Drives one configuration through adjust, plan, extract, validate.
/// Every fault becomes a terminal `RunStatus`; nothing escapes to the
/// scheduler.
#[derive(Debug, Clone)]
pub struct ConfigurationPipeline {
    toolchain: Toolchain,
    results_root: PathBuf,
}

impl ConfigurationPipeline {
    pub fn new(toolchain: Toolchain, results_root: PathBuf) -> ConfigurationPipeline {
        ConfigurationPipeline {
            toolchain,
            results_root,
        }
    }

    pub fn results_root(&self) -> &Path {
        &self.results_root
    }

    pub fn execute(&self, configuration: &Configuration) -> RunOutcome {
        let started_at = Utc::now();
        let clock = Instant::now();
        let paths = ArtifactDir::new(&self.results_root, configuration);

        let status = match self.run_steps(configuration, &paths) {
            Ok(status) => status,
            Err(StepError::PlannerExit(code)) => RunStatus::PlannerFailed { exit_code: code },
            Err(StepError::Deadline) => RunStatus::TimedOut,
            Err(StepError::Tool(error)) => RunStatus::Faulted {
                reason: error.to_string(),
            },
        };
        info!(
            domain = %configuration.domain_name,
            problem = %configuration.problem_name,
            adjustment = %configuration.adjustment,
            status = %status,
            "run finished"
        );

        let outcome = RunOutcome {
            configuration: configuration.clone(),
            status,
            artifact_dir: paths.dir.clone(),
            gat: None,
        };
        if let Err(error) = write_outcome_record(&paths, &outcome, started_at, clock.elapsed()) {
            warn!(
                path = %paths.outcome.display(),
                error = %error,
                "failed to persist outcome record"
            );
        }
        outcome
    }

    fn run_steps(
        &self,
        configuration: &Configuration,
        paths: &ArtifactDir,
    ) -> Result<RunStatus, StepError> {
        paths.prepare()?;

        let resolved_problem = match configuration.adjustment {
            Adjustment::Offset(offset) => self.adjust_problem(configuration, offset, paths)?,
            Adjustment::Smart => configuration.problem.clone(),
        };
        self.run_planner(configuration, &resolved_problem, paths)?;
        self.extract_plan(configuration, paths)?;
        if self.run_validator(configuration, paths)? {
            Ok(RunStatus::Success)
        } else {
            Ok(RunStatus::ValidationFailed)
        }
    }

    fn adjust_problem(
        &self,
        configuration: &Configuration,
        offset: u64,
        paths: &ArtifactDir,
    ) -> Result<PathBuf, StepError> {
        let mut command = self.toolchain.adjuster.clone();
        command.push(path_arg(&configuration.domain));
        command.push(path_arg(&configuration.problem));
        command.push(offset.to_string());
        command.push(path_arg(&paths.adjusted_problem));

        let limits = RunLimits {
            time_limit: Duration::from_secs(configuration.time_limit_seconds),
            memory_limit_bytes: None,
        };
        match run_bounded(&command, limits, &paths.adjust_log, None)? {
            BoundedExit::Exited(0) => {}
            BoundedExit::Exited(code) => {
                return Err(StepError::Tool(anyhow!(
                    "adjuster_failed: exit status {}",
                    code
                )))
            }
            BoundedExit::TimedOut => return Err(StepError::Deadline),
        }
        if !paths.adjusted_problem.is_file() {
            return Err(StepError::Tool(anyhow!(
                "adjuster_failed: {} was not written",
                paths.adjusted_problem.display()
            )));
        }
        Ok(paths.adjusted_problem.clone())
    }

    fn run_planner(
        &self,
        configuration: &Configuration,
        resolved_problem: &Path,
        paths: &ArtifactDir,
    ) -> Result<(), StepError> {
        let variant = match configuration.adjustment {
            Adjustment::Smart => &self.toolchain.capable_planner,
            Adjustment::Offset(_) => &self.toolchain.deadline_oblivious_planner,
        };
        let mut command = variant.clone();
        command.push(path_arg(&configuration.domain));
        command.push(path_arg(resolved_problem));

        let limits = RunLimits {
            time_limit: Duration::from_secs(configuration.time_limit_seconds),
            memory_limit_bytes: Some(configuration.memory_limit_bytes),
        };
        match run_bounded(
            &command,
            limits,
            &paths.planner_stdout,
            Some(&paths.planner_stderr),
        )? {
            BoundedExit::Exited(0) => Ok(()),
            BoundedExit::Exited(code) => Err(StepError::PlannerExit(code)),
            BoundedExit::TimedOut => Err(StepError::Deadline),
        }
    }

    fn extract_plan(
        &self,
        configuration: &Configuration,
        paths: &ArtifactDir,
    ) -> Result<(), StepError> {
        let transcript = fs::read_to_string(&paths.planner_stdout)
            .map_err(|e| StepError::Tool(anyhow!("planner_transcript_unreadable: {}", e)))?;
        let mut plan = Plan::from_transcript(&transcript);
        if let Adjustment::Offset(offset) = configuration.adjustment {
            plan.shift(-(offset as f64));
        }
        fs::write(&paths.plan, plan.to_string())
            .map_err(|e| StepError::Tool(anyhow!("plan_write_failed: {}", e)))?;
        Ok(())
    }

    fn run_validator(
        &self,
        configuration: &Configuration,
        paths: &ArtifactDir,
    ) -> Result<bool, StepError> {
        let mut command = self.toolchain.validator.clone();
        command.push(path_arg(&configuration.domain));
        // Always the original problem; the adjusted variant only exists
        // to steer the planner.
        command.push(path_arg(&configuration.problem));
        command.push(path_arg(&paths.plan));

        let limits = RunLimits {
            time_limit: Duration::from_secs(configuration.time_limit_seconds),
            memory_limit_bytes: None,
        };
        match run_bounded(&command, limits, &paths.validation_log, None)? {
            BoundedExit::Exited(0) => Ok(true),
            BoundedExit::Exited(_) => Ok(false),
            BoundedExit::TimedOut => Err(StepError::Deadline),
        }
    }
}

fn write_outcome_record(
    paths: &ArtifactDir,
    outcome: &RunOutcome,
    started_at: DateTime<Utc>,
    wall: Duration,
) -> Result<()> {
    let record = OutcomeRecord {
        schema_version: OUTCOME_SCHEMA_VERSION.to_string(),
        configuration: outcome.configuration.clone(),
        status: outcome.status.clone(),
        artifact_dir: outcome.artifact_dir.clone(),
        gat: outcome.gat,
        started_at: started_at.to_rfc3339(),
        finished_at: Utc::now().to_rfc3339(),
        wall_seconds: wall.as_secs_f64(),
    };
    atomic_write_json_pretty(&paths.outcome, &record)
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}
