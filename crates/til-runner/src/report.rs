use std::fmt;
use std::fs;
use std::path::Path;

use anyhow::{anyhow, Result};
use chrono::Utc;
use serde::Serialize;
use tracing::warn;
use walkdir::WalkDir;

use crate::artifact::{atomic_write_json_pretty, OUTCOME_FILE, PLAN_FILE};
use crate::config::{Adjustment, Batch};
use crate::pipeline::{OutcomeRecord, RunOutcome, RunStatus, OUTCOME_SCHEMA_VERSION};

pub const BATCH_SCHEMA_VERSION: &str = "til_batch_v1";
pub const BATCH_FILE: &str = "batch.json";

#[derive(Debug, Clone, Serialize)]
pub struct ReportRow {
    pub domain: String,
    pub problem: String,
    pub adjustment: Adjustment,
    pub status: RunStatus,
    pub gat: Option<f64>,
    pub inconsistency: Option<String>,
}

impl fmt::Display for ReportRow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "domain: {} problem: {} adjustment: {} result: {}",
            self.domain, self.problem, self.adjustment, self.status
        )?;
        if let Some(gat) = self.gat {
            write!(f, " gat: {:.3}", gat)?;
        }
        if let Some(inconsistency) = &self.inconsistency {
            write!(f, " inconsistency: {}", inconsistency)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub success: usize,
    pub validation_failed: usize,
    pub planner_failed: usize,
    pub timed_out: usize,
    pub faulted: usize,
}

impl StatusCounts {
    fn record(&mut self, status: &RunStatus) {
        match status {
            RunStatus::Success => self.success += 1,
            RunStatus::ValidationFailed => self.validation_failed += 1,
            RunStatus::PlannerFailed { .. } => self.planner_failed += 1,
            RunStatus::TimedOut => self.timed_out += 1,
            RunStatus::Faulted { .. } => self.faulted += 1,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub rows: Vec<ReportRow>,
    pub counts: StatusCounts,
    pub inconsistencies: usize,
}

/// Phase two of the outcome lifecycle: recompute goal-achievement time
/// from each successful run's plan artifact. A success whose plan is
/// missing or malformed is reported, never silently skipped.
pub fn enrich_outcomes(outcomes: &mut [RunOutcome]) -> BatchReport {
    let mut rows = Vec::with_capacity(outcomes.len());
    let mut counts = StatusCounts::default();
    let mut inconsistencies = 0;

    for outcome in outcomes.iter_mut() {
        counts.record(&outcome.status);
        let mut inconsistency = None;
        if outcome.status.is_success() {
            match til_plan::gat_from_file(&outcome.artifact_dir.join(PLAN_FILE)) {
                Ok(gat) => {
                    outcome.gat = Some(gat);
                    if let Err(error) = refresh_record(outcome) {
                        warn!(
                            dir = %outcome.artifact_dir.display(),
                            error = %error,
                            "failed to refresh outcome record"
                        );
                    }
                }
                Err(error) => {
                    warn!(
                        domain = %outcome.configuration.domain_name,
                        problem = %outcome.configuration.problem_name,
                        adjustment = %outcome.configuration.adjustment,
                        error = %error,
                        "successful run with unusable plan artifact"
                    );
                    inconsistency = Some(error.to_string());
                    inconsistencies += 1;
                }
            }
        }
        rows.push(ReportRow {
            domain: outcome.configuration.domain_name.clone(),
            problem: outcome.configuration.problem_name.clone(),
            adjustment: outcome.configuration.adjustment,
            status: outcome.status.clone(),
            gat: outcome.gat,
            inconsistency,
        });
    }

    BatchReport {
        rows,
        counts,
        inconsistencies,
    }
}

fn refresh_record(outcome: &RunOutcome) -> Result<()> {
    let path = outcome.artifact_dir.join(OUTCOME_FILE);
    let mut record: OutcomeRecord = serde_json::from_slice(&fs::read(&path)?)?;
    record.gat = outcome.gat;
    atomic_write_json_pretty(&path, &record)
}

/// Rediscovers persisted outcomes under a results root, in lexical
/// path order. Unreadable or foreign records are skipped with a
/// warning.
pub fn scan_results(results_root: &Path) -> Result<Vec<RunOutcome>> {
    if !results_root.is_dir() {
        return Err(anyhow!("results_root_missing: {}", results_root.display()));
    }
    let mut outcomes = Vec::new();
    for entry in WalkDir::new(results_root).sort_by_file_name() {
        let entry = entry?;
        if !entry.file_type().is_file() || entry.file_name() != OUTCOME_FILE {
            continue;
        }
        let record: OutcomeRecord = match serde_json::from_slice(&fs::read(entry.path())?) {
            Ok(record) => record,
            Err(error) => {
                warn!(
                    path = %entry.path().display(),
                    error = %error,
                    "skipping unreadable outcome record"
                );
                continue;
            }
        };
        if record.schema_version != OUTCOME_SCHEMA_VERSION {
            warn!(
                path = %entry.path().display(),
                schema_version = %record.schema_version,
                "skipping outcome record with unknown schema"
            );
            continue;
        }
        outcomes.push(record.into_outcome());
    }
    Ok(outcomes)
}

#[derive(Debug, Clone, Serialize)]
pub struct ToolRecord {
    pub role: String,
    pub command: Vec<String>,
    /// Digest of the executable when the command names a file on disk;
    /// absent for PATH-resolved programs.
    pub exec_digest: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LimitsRecord {
    pub memory_bytes: u64,
    pub time_seconds: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchRecord {
    pub schema_version: String,
    pub batch: String,
    pub created_at: String,
    pub workers: usize,
    pub limits: Option<LimitsRecord>,
    pub total_runs: usize,
    pub counts: StatusCounts,
    pub inconsistencies: usize,
    pub tools: Vec<ToolRecord>,
}

pub fn write_batch_record(results_root: &Path, batch: &Batch, report: &BatchReport) -> Result<()> {
    // Limits are batch-wide in the definition file, so any
    // configuration can stand in for them.
    let limits = batch.configurations.first().map(|c| LimitsRecord {
        memory_bytes: c.memory_limit_bytes,
        time_seconds: c.time_limit_seconds,
    });
    let record = BatchRecord {
        schema_version: BATCH_SCHEMA_VERSION.to_string(),
        batch: batch.name.clone(),
        created_at: Utc::now().to_rfc3339(),
        workers: batch.workers,
        limits,
        total_runs: report.rows.len(),
        counts: report.counts.clone(),
        inconsistencies: report.inconsistencies,
        tools: vec![
            tool_record("capable_planner", &batch.toolchain.capable_planner),
            tool_record(
                "deadline_oblivious_planner",
                &batch.toolchain.deadline_oblivious_planner,
            ),
            tool_record("validator", &batch.toolchain.validator),
            tool_record("adjuster", &batch.toolchain.adjuster),
        ],
    };
    atomic_write_json_pretty(&results_root.join(BATCH_FILE), &record)
}

fn tool_record(role: &str, command: &[String]) -> ToolRecord {
    let exec_digest = command
        .first()
        .map(Path::new)
        .filter(|program| program.is_file())
        .and_then(|program| til_core::sha256_file(program).ok());
    ToolRecord {
        role: role.to_string(),
        command: command.to_vec(),
        exec_digest,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::ArtifactDir;
    use crate::config::Toolchain;
    use crate::testutil::{configuration, temp_root};

    const PLAN_TEXT: &str = "\
0.000: (drive truck1 depot1 market1) [40.000] ; (1)
42.500: (unload truck1 goods1) [2.000] ; (1)
";

    fn seeded_outcome(
        root: &Path,
        problem: &str,
        status: RunStatus,
        plan_text: Option<&str>,
    ) -> RunOutcome {
        let config = configuration(root, problem, Adjustment::Offset(10), 60);
        let paths = ArtifactDir::new(&root.join("results"), &config);
        paths.prepare().expect("prepare artifact dir");
        if let Some(text) = plan_text {
            fs::write(&paths.plan, text).expect("write plan");
        }
        let outcome = RunOutcome {
            configuration: config,
            status,
            artifact_dir: paths.dir.clone(),
            gat: None,
        };
        let record = OutcomeRecord {
            schema_version: OUTCOME_SCHEMA_VERSION.to_string(),
            configuration: outcome.configuration.clone(),
            status: outcome.status.clone(),
            artifact_dir: outcome.artifact_dir.clone(),
            gat: None,
            started_at: Utc::now().to_rfc3339(),
            finished_at: Utc::now().to_rfc3339(),
            wall_seconds: 0.1,
        };
        atomic_write_json_pretty(&paths.outcome, &record).expect("write outcome record");
        outcome
    }

    #[test]
    fn enrich_sets_gat_only_for_usable_successes() {
        let root = temp_root("report_enrich");
        let mut outcomes = vec![
            seeded_outcome(&root, "p0", RunStatus::Success, Some(PLAN_TEXT)),
            seeded_outcome(
                &root,
                "p1",
                RunStatus::PlannerFailed { exit_code: 4 },
                None,
            ),
            seeded_outcome(&root, "p2", RunStatus::Success, Some("0.0: (broken\n")),
        ];

        let report = enrich_outcomes(&mut outcomes);

        assert_eq!(outcomes[0].gat, Some(42.5));
        assert_eq!(outcomes[1].gat, None);
        assert_eq!(outcomes[2].gat, None);

        assert_eq!(report.counts.success, 2);
        assert_eq!(report.counts.planner_failed, 1);
        assert_eq!(report.inconsistencies, 1);
        assert!(report.rows[0].inconsistency.is_none());
        assert!(report.rows[2].inconsistency.is_some());

        // The enriched metric lands back in the persisted record.
        let record: OutcomeRecord = serde_json::from_slice(
            &fs::read(outcomes[0].artifact_dir.join(OUTCOME_FILE)).expect("read record"),
        )
        .expect("parse record");
        assert_eq!(record.gat, Some(42.5));

        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn report_rows_read_like_summary_lines() {
        let root = temp_root("report_rows");
        let mut outcomes = vec![seeded_outcome(&root, "p0", RunStatus::Success, Some(PLAN_TEXT))];
        let report = enrich_outcomes(&mut outcomes);

        assert_eq!(
            report.rows[0].to_string(),
            "domain: domain problem: p0 adjustment: 10 result: success gat: 42.500"
        );

        let failed = ReportRow {
            domain: "domain".to_string(),
            problem: "p9".to_string(),
            adjustment: Adjustment::Smart,
            status: RunStatus::TimedOut,
            gat: None,
            inconsistency: None,
        };
        assert_eq!(
            failed.to_string(),
            "domain: domain problem: p9 adjustment: smart result: timed_out"
        );

        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn scan_results_rediscovers_persisted_outcomes() {
        let root = temp_root("report_scan");
        seeded_outcome(&root, "p0", RunStatus::Success, Some(PLAN_TEXT));
        seeded_outcome(&root, "p1", RunStatus::TimedOut, None);

        // A stray unreadable record must not abort the scan.
        let stray = root.join("results").join("domain").join("p2").join("10");
        fs::create_dir_all(&stray).expect("create stray dir");
        fs::write(stray.join(OUTCOME_FILE), "not json").expect("write stray record");

        let outcomes = scan_results(&root.join("results")).expect("scan results");
        assert_eq!(outcomes.len(), 2);
        assert_eq!(outcomes[0].configuration.problem_name, "p0");
        assert_eq!(outcomes[1].configuration.problem_name, "p1");
        assert_eq!(outcomes[1].status, RunStatus::TimedOut);

        let missing = scan_results(&root.join("absent"));
        assert!(missing.is_err(), "missing root must error");

        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn batch_record_digests_on_disk_tools() {
        let root = temp_root("report_batch_record");
        let script = root.join("planner.sh");
        fs::write(&script, "#!/bin/sh\nexit 0\n").expect("write planner stub");
        let results_root = root.join("results");
        til_core::ensure_dir(&results_root).expect("results root");

        let mut outcomes = vec![seeded_outcome(&root, "p0", RunStatus::Success, Some(PLAN_TEXT))];
        let report = enrich_outcomes(&mut outcomes);
        let batch = Batch {
            name: "trucks".to_string(),
            results_root: results_root.clone(),
            workers: 3,
            toolchain: Toolchain {
                capable_planner: vec![script.to_string_lossy().into_owned()],
                deadline_oblivious_planner: vec![
                    script.to_string_lossy().into_owned(),
                    "--real-to-plan-time-multiplier".to_string(),
                    "0".to_string(),
                ],
                validator: vec!["validate-from-path".to_string()],
                adjuster: vec!["adjust-from-path".to_string()],
            },
            configurations: vec![outcomes[0].configuration.clone()],
        };
        write_batch_record(&results_root, &batch, &report).expect("write batch record");

        let value: serde_json::Value =
            serde_json::from_slice(&fs::read(results_root.join(BATCH_FILE)).expect("read"))
                .expect("parse batch record");
        assert_eq!(value["schema_version"], BATCH_SCHEMA_VERSION);
        assert_eq!(value["batch"], "trucks");
        assert_eq!(value["workers"], 3);
        assert_eq!(value["limits"]["memory_bytes"], 1u64 << 30);
        assert_eq!(value["total_runs"], 1);
        assert_eq!(value["counts"]["success"], 1);

        let expected_digest = til_core::sha256_file(&script).expect("digest script");
        assert_eq!(value["tools"][0]["exec_digest"], expected_digest.as_str());
        assert_eq!(value["tools"][2]["exec_digest"], serde_json::Value::Null);

        let _ = fs::remove_dir_all(&root);
    }
}
