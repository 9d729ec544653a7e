use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;

pub const DEFAULT_RESULTS_DIR: &str = "results";

/// Either the `smart` marker (capable planner, problem untouched) or a
/// positive TIL offset in time units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(try_from = "RawAdjustment")]
pub enum Adjustment {
    Smart,
    Offset(u64),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawAdjustment {
    Offset(u64),
    Marker(String),
}

impl TryFrom<RawAdjustment> for Adjustment {
    type Error = String;

    fn try_from(raw: RawAdjustment) -> Result<Self, Self::Error> {
        match raw {
            RawAdjustment::Offset(0) => Err("adjustment offset must be positive".to_string()),
            RawAdjustment::Offset(offset) => Ok(Adjustment::Offset(offset)),
            RawAdjustment::Marker(marker) if marker == "smart" => Ok(Adjustment::Smart),
            RawAdjustment::Marker(marker) => Err(format!(
                "adjustment must be 'smart' or a positive integer, got '{}'",
                marker
            )),
        }
    }
}

impl Serialize for Adjustment {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Adjustment::Smart => serializer.serialize_str("smart"),
            Adjustment::Offset(offset) => serializer.serialize_u64(*offset),
        }
    }
}

impl fmt::Display for Adjustment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Adjustment::Smart => f.write_str("smart"),
            Adjustment::Offset(offset) => write!(f, "{}", offset),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Configuration {
    pub domain: PathBuf,
    pub problem: PathBuf,
    pub domain_name: String,
    pub problem_name: String,
    pub memory_limit_bytes: u64,
    pub time_limit_seconds: u64,
    pub adjustment: Adjustment,
}

impl Configuration {
    pub fn new(
        domain: PathBuf,
        problem: PathBuf,
        memory_limit_bytes: u64,
        time_limit_seconds: u64,
        adjustment: Adjustment,
    ) -> Result<Configuration> {
        if memory_limit_bytes == 0 {
            return Err(anyhow!(
                "configuration_invalid: memory_limit_bytes must be positive"
            ));
        }
        if time_limit_seconds == 0 {
            return Err(anyhow!(
                "configuration_invalid: time_limit_seconds must be positive"
            ));
        }
        let domain_name = name_of(&domain)?;
        let problem_name = name_of(&problem)?;
        Ok(Configuration {
            domain,
            problem,
            domain_name,
            problem_name,
            memory_limit_bytes,
            time_limit_seconds,
            adjustment,
        })
    }

    /// `(domain_name, problem_name, adjustment)` — determines the
    /// artifact directory, so it must be unique within a batch.
    pub fn identity_key(&self) -> String {
        format!(
            "{}/{}/{}",
            self.domain_name, self.problem_name, self.adjustment
        )
    }
}

fn name_of(path: &Path) -> Result<String> {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .ok_or_else(|| anyhow!("configuration_invalid: no file name in {}", path.display()))
}

pub fn ensure_unique_identity_keys(configurations: &[Configuration]) -> Result<()> {
    let mut seen = HashSet::new();
    for configuration in configurations {
        let key = configuration.identity_key();
        if !seen.insert(key.clone()) {
            return Err(anyhow!("duplicate_identity_key: {}", key));
        }
    }
    Ok(())
}

/// Command lines for the external collaborators, each a program plus
/// leading arguments; the pipeline appends the positional arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Toolchain {
    pub capable_planner: Vec<String>,
    pub deadline_oblivious_planner: Vec<String>,
    pub validator: Vec<String>,
    pub adjuster: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct Batch {
    pub name: String,
    pub results_root: PathBuf,
    pub workers: usize,
    pub toolchain: Toolchain,
    pub configurations: Vec<Configuration>,
}

pub fn load_batch(path: &Path) -> Result<Batch> {
    let raw_yaml = fs::read_to_string(path)
        .map_err(|_| anyhow!("batch_config_missing: {}", path.display()))?;
    let yaml_value: serde_yaml::Value = serde_yaml::from_str(&raw_yaml)?;
    let config: Value = serde_json::to_value(yaml_value)?;
    validate_required_fields(&config)?;

    let batch_dir = path.parent().unwrap_or(Path::new("."));
    let name = config
        .pointer("/batch/name")
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .unwrap_or_else(|| default_batch_name(path));
    let results_root = PathBuf::from(
        config
            .pointer("/batch/results_dir")
            .and_then(|v| v.as_str())
            .unwrap_or(DEFAULT_RESULTS_DIR),
    );
    let workers = match config.pointer("/batch/workers") {
        None => 1,
        Some(value) => value
            .as_u64()
            .filter(|w| *w >= 1)
            .ok_or_else(|| anyhow!("batch_config_invalid: /batch/workers must be a positive integer"))?
            as usize,
    };

    let memory_limit_bytes = positive_field(&config, "/limits/memory_bytes")?;
    let time_limit_seconds = positive_field(&config, "/limits/time_seconds")?;

    let capable_planner = command_field(&config, "/tools/planner")?;
    let deadline_oblivious_planner = match config.pointer("/tools/deadline_oblivious") {
        Some(_) => command_field(&config, "/tools/deadline_oblivious")?,
        None => {
            // The oblivious variant cannot reason about absolute TIL
            // times; plan time is pinned to zero and the shifted
            // deadlines carry that information instead.
            let mut command = capable_planner.clone();
            command.push("--real-to-plan-time-multiplier".to_string());
            command.push("0".to_string());
            command
        }
    };
    let validator = command_field(&config, "/tools/validator")?;
    let adjuster = command_field(&config, "/tools/adjuster")?;

    let pairs = problems_field(&config, batch_dir)?;
    let adjustments = adjustments_field(&config)?;

    let mut configurations = Vec::with_capacity(pairs.len() * adjustments.len());
    for (domain, problem) in &pairs {
        for adjustment in &adjustments {
            configurations.push(Configuration::new(
                domain.clone(),
                problem.clone(),
                memory_limit_bytes,
                time_limit_seconds,
                *adjustment,
            )?);
        }
    }
    ensure_unique_identity_keys(&configurations)?;

    Ok(Batch {
        name,
        results_root,
        workers,
        toolchain: Toolchain {
            capable_planner,
            deadline_oblivious_planner,
            validator,
            adjuster,
        },
        configurations,
    })
}

fn default_batch_name(path: &Path) -> String {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| "batch".to_string())
}

fn validate_required_fields(config: &Value) -> Result<()> {
    let required: &[&str] = &[
        "/limits/memory_bytes",
        "/limits/time_seconds",
        "/tools/planner",
        "/tools/validator",
        "/tools/adjuster",
        "/problems",
        "/adjustments",
    ];
    let mut missing = Vec::new();
    for pointer in required {
        let value = config.pointer(pointer);
        let is_missing = match value {
            None => true,
            Some(Value::String(s)) => s.is_empty(),
            Some(Value::Number(n)) => n.as_u64() == Some(0),
            Some(Value::Array(a)) => a.is_empty(),
            _ => false,
        };
        if is_missing {
            missing.push(*pointer);
        }
    }
    if missing.is_empty() {
        Ok(())
    } else {
        Err(anyhow!(
            "batch_config_invalid: missing required fields:\n{}",
            missing
                .iter()
                .map(|p| format!("  - {}", p))
                .collect::<Vec<_>>()
                .join("\n")
        ))
    }
}

fn positive_field(config: &Value, pointer: &str) -> Result<u64> {
    config
        .pointer(pointer)
        .and_then(|v| v.as_u64())
        .filter(|v| *v > 0)
        .ok_or_else(|| anyhow!("batch_config_invalid: {} must be a positive integer", pointer))
}

fn command_field(config: &Value, pointer: &str) -> Result<Vec<String>> {
    let entries = config
        .pointer(pointer)
        .and_then(|v| v.as_array())
        .ok_or_else(|| anyhow!("batch_config_invalid: {} must be a list", pointer))?;
    let mut command = Vec::with_capacity(entries.len());
    for entry in entries {
        match entry {
            Value::String(text) => command.push(text.clone()),
            Value::Number(number) => command.push(number.to_string()),
            other => {
                return Err(anyhow!(
                    "batch_config_invalid: {} entries must be strings, got {}",
                    pointer,
                    other
                ))
            }
        }
    }
    if command.is_empty() {
        return Err(anyhow!("batch_config_invalid: {} must not be empty", pointer));
    }
    Ok(command)
}

fn problems_field(config: &Value, batch_dir: &Path) -> Result<Vec<(PathBuf, PathBuf)>> {
    let entries = config
        .pointer("/problems")
        .and_then(|v| v.as_array())
        .ok_or_else(|| anyhow!("batch_config_invalid: /problems must be a list"))?;
    let mut pairs = Vec::with_capacity(entries.len());
    for entry in entries {
        let domain = entry.pointer("/domain").and_then(|v| v.as_str());
        let problem = entry.pointer("/problem").and_then(|v| v.as_str());
        match (domain, problem) {
            (Some(domain), Some(problem)) => pairs.push((
                resolve_path(batch_dir, domain),
                resolve_path(batch_dir, problem),
            )),
            _ => {
                return Err(anyhow!(
                    "batch_config_invalid: /problems entries need domain and problem paths"
                ))
            }
        }
    }
    Ok(pairs)
}

fn adjustments_field(config: &Value) -> Result<Vec<Adjustment>> {
    let entries = config
        .pointer("/adjustments")
        .and_then(|v| v.as_array())
        .ok_or_else(|| anyhow!("batch_config_invalid: /adjustments must be a list"))?;
    let mut adjustments = Vec::with_capacity(entries.len());
    for entry in entries {
        let adjustment = match entry {
            Value::Number(number) => {
                let offset = number.as_u64().filter(|v| *v > 0).ok_or_else(|| {
                    anyhow!(
                        "batch_config_invalid: adjustment offsets must be positive integers, got {}",
                        number
                    )
                })?;
                Adjustment::Offset(offset)
            }
            Value::String(marker) if marker == "smart" => Adjustment::Smart,
            other => {
                return Err(anyhow!(
                    "batch_config_invalid: adjustment must be 'smart' or a positive integer, got {}",
                    other
                ))
            }
        };
        adjustments.push(adjustment);
    }
    Ok(adjustments)
}

fn resolve_path(batch_dir: &Path, raw: &str) -> PathBuf {
    let path = PathBuf::from(raw);
    if path.is_absolute() {
        path
    } else {
        batch_dir.join(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::temp_root;

    const BATCH_YAML: &str = "\
batch:
  name: trucks
  results_dir: out
  workers: 3
limits:
  memory_bytes: 4294967296
  time_seconds: 1800
tools:
  planner: [/opt/planner/plan]
  validator: [/opt/val/validate, -t, \"0.001\"]
  adjuster: [python3, adjust_til.py]
problems:
  - domain: trucks/domain.pddl
    problem: trucks/p07.pddl
  - domain: trucks/domain.pddl
    problem: trucks/p08.pddl
adjustments: [smart, 1, 10]
";

    fn write_batch_file(root: &std::path::Path, contents: &str) -> PathBuf {
        let path = root.join("batch.yaml");
        fs::write(&path, contents).expect("write batch file");
        path
    }

    #[test]
    fn load_batch_expands_cross_product() {
        let root = temp_root("config_load");
        let path = write_batch_file(&root, BATCH_YAML);

        let batch = load_batch(&path).expect("load batch");
        assert_eq!(batch.name, "trucks");
        assert_eq!(batch.workers, 3);
        assert_eq!(batch.results_root, PathBuf::from("out"));
        assert_eq!(batch.configurations.len(), 6);

        let first = &batch.configurations[0];
        assert_eq!(first.domain, root.join("trucks/domain.pddl"));
        assert_eq!(first.problem_name, "p07");
        assert_eq!(first.adjustment, Adjustment::Smart);
        assert_eq!(first.memory_limit_bytes, 4294967296);
        assert_eq!(batch.configurations[1].adjustment, Adjustment::Offset(1));
        assert_eq!(batch.configurations[5].adjustment, Adjustment::Offset(10));
        assert_eq!(batch.configurations[5].problem_name, "p08");

        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn deadline_oblivious_defaults_to_pinned_multiplier() {
        let root = temp_root("config_multiplier");
        let path = write_batch_file(&root, BATCH_YAML);

        let batch = load_batch(&path).expect("load batch");
        assert_eq!(
            batch.toolchain.deadline_oblivious_planner,
            vec![
                "/opt/planner/plan",
                "--real-to-plan-time-multiplier",
                "0"
            ]
        );
        assert_eq!(batch.toolchain.capable_planner, vec!["/opt/planner/plan"]);

        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn load_batch_reports_all_missing_fields() {
        let root = temp_root("config_missing");
        let path = write_batch_file(&root, "batch:\n  name: empty\n");

        let error = load_batch(&path).expect_err("incomplete batch must fail");
        let message = error.to_string();
        for pointer in [
            "/limits/memory_bytes",
            "/limits/time_seconds",
            "/tools/planner",
            "/tools/validator",
            "/tools/adjuster",
            "/problems",
            "/adjustments",
        ] {
            assert!(message.contains(pointer), "missing {} in: {}", pointer, message);
        }

        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn load_batch_rejects_zero_adjustment() {
        let root = temp_root("config_zero_adj");
        let path = write_batch_file(&root, &BATCH_YAML.replace("[smart, 1, 10]", "[0]"));

        let error = load_batch(&path).expect_err("zero offset must fail");
        assert!(error.to_string().contains("positive"), "{}", error);

        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn load_batch_rejects_duplicate_identity_keys() {
        let root = temp_root("config_dup");
        let duplicated = BATCH_YAML.replace("p08.pddl", "p07.pddl");
        let path = write_batch_file(&root, &duplicated);

        let error = load_batch(&path).expect_err("duplicate keys must fail");
        assert!(
            error.to_string().contains("duplicate_identity_key"),
            "{}",
            error
        );

        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn configuration_rejects_zero_limits() {
        let error = Configuration::new(
            PathBuf::from("d.pddl"),
            PathBuf::from("p.pddl"),
            0,
            60,
            Adjustment::Smart,
        )
        .expect_err("zero memory limit must fail");
        assert!(error.to_string().contains("memory_limit_bytes"));

        let error = Configuration::new(
            PathBuf::from("d.pddl"),
            PathBuf::from("p.pddl"),
            1024,
            0,
            Adjustment::Smart,
        )
        .expect_err("zero time limit must fail");
        assert!(error.to_string().contains("time_limit_seconds"));
    }

    #[test]
    fn identity_key_uses_stems_and_adjustment() {
        let configuration = Configuration::new(
            PathBuf::from("bench/trucks/domain.pddl"),
            PathBuf::from("bench/trucks/p07.pddl"),
            1024,
            60,
            Adjustment::Offset(10),
        )
        .expect("configuration");
        assert_eq!(configuration.identity_key(), "domain/p07/10");
        assert_eq!(configuration.domain_name, "domain");
        assert_eq!(configuration.problem_name, "p07");
    }

    #[test]
    fn adjustment_serde_round_trip() {
        let smart: Adjustment = serde_json::from_str("\"smart\"").expect("smart marker");
        assert_eq!(smart, Adjustment::Smart);
        let offset: Adjustment = serde_json::from_str("10").expect("offset");
        assert_eq!(offset, Adjustment::Offset(10));

        assert_eq!(serde_json::to_string(&Adjustment::Smart).expect("json"), "\"smart\"");
        assert_eq!(serde_json::to_string(&Adjustment::Offset(10)).expect("json"), "10");

        assert!(serde_json::from_str::<Adjustment>("\"clever\"").is_err());
        assert!(serde_json::from_str::<Adjustment>("0").is_err());
    }
}
