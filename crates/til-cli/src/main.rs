use anyhow::Result;
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "til", version = "0.1.0", about = "Timed-initial-literal planning experiments")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    Run {
        batch: PathBuf,
        #[arg(long)]
        workers: Option<usize>,
        #[arg(long)]
        json: bool,
    },
    Describe {
        batch: PathBuf,
        #[arg(long)]
        json: bool,
    },
    Report {
        #[arg(long, default_value = "results")]
        results_dir: PathBuf,
        #[arg(long)]
        json: bool,
    },
    Init {
        #[arg(long)]
        force: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing();
    let json_mode = command_json_mode(&cli.command);
    let result = run_command(cli.command);
    match result {
        Ok(Some(payload)) => {
            emit_json(&payload);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if json_mode {
                emit_json(&json_error("command_failed", err.to_string(), json!({})));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

// Diagnostics go to stderr so stdout stays machine-readable under
// --json.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn run_command(command: Commands) -> Result<Option<Value>> {
    match command {
        Commands::Run {
            batch,
            workers,
            json,
        } => {
            let mut batch = til_runner::load_batch(&batch)?;
            if let Some(workers) = workers {
                if workers == 0 {
                    return Err(anyhow::anyhow!("--workers must be a positive integer"));
                }
                batch.workers = workers;
            }
            info!(
                batch = %batch.name,
                runs = batch.configurations.len(),
                workers = batch.workers,
                "loaded batch"
            );

            let pipeline = til_runner::ConfigurationPipeline::new(
                batch.toolchain.clone(),
                batch.results_root.clone(),
            );
            let scheduler = til_runner::ExperimentScheduler::new(pipeline);
            let mut outcomes = scheduler.run_all_with_progress(
                &batch.configurations,
                batch.workers,
                &|completed, total| eprintln!("completed {}/{}", completed, total),
            )?;

            let report = til_runner::enrich_outcomes(&mut outcomes);
            til_runner::write_batch_record(&batch.results_root, &batch, &report)?;
            let record_path = batch.results_root.join(til_runner::BATCH_FILE);

            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "run",
                    "batch": batch.name,
                    "workers": batch.workers,
                    "results_root": batch.results_root.display().to_string(),
                    "record": record_path.display().to_string(),
                    "report": serde_json::to_value(&report)?
                })));
            }
            println!("batch: {}", batch.name);
            println!("workers: {}", batch.workers);
            println!("runs: {}", report.rows.len());
            for row in &report.rows {
                println!("{}", row);
            }
            print_counts(&report);
            println!("record: {}", record_path.display());
        }
        Commands::Describe { batch, json } => {
            let batch = til_runner::load_batch(&batch)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "describe",
                    "batch": batch_to_json(&batch)
                })));
            }
            print_batch(&batch);
        }
        Commands::Report { results_dir, json } => {
            let mut outcomes = til_runner::scan_results(&results_dir)?;
            let report = til_runner::enrich_outcomes(&mut outcomes);
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "report",
                    "results_root": results_dir.display().to_string(),
                    "report": serde_json::to_value(&report)?
                })));
            }
            println!("results_root: {}", results_dir.display());
            println!("runs: {}", report.rows.len());
            for row in &report.rows {
                println!("{}", row);
            }
            print_counts(&report);
        }
        Commands::Init { force } => {
            let cwd = std::env::current_dir()?;
            let path = cwd.join("batch.yaml");
            if !force && path.exists() {
                return Err(anyhow::anyhow!(format!(
                    "init file already exists (use --force): {}",
                    path.display()
                )));
            }
            std::fs::write(&path, BATCH_TEMPLATE)?;

            let show = path.strip_prefix(&cwd).unwrap_or(&path).display();
            println!("wrote: {}", show);
            println!("next: edit {} and fill in all fields marked REQUIRED", show);
            println!("next: til describe {}", show);
        }
    }
    Ok(None)
}

const BATCH_TEMPLATE: &str = "\
batch:
  # name: trucks                 # optional: defaults to the file stem
  results_dir: results
  workers: 1
limits:
  memory_bytes: 0                # REQUIRED: bytes, e.g. 4294967296
  time_seconds: 0                # REQUIRED: seconds, e.g. 1800
tools:
  planner: []                    # REQUIRED: capable planner, e.g. [./optic, -N]
  # deadline_oblivious: []       # optional: defaults to the planner command
  #                              #   plus --real-to-plan-time-multiplier 0
  validator: []                  # REQUIRED: e.g. [./validate, -t, '0.001']
  adjuster: []                   # REQUIRED: e.g. [python3, adjust_til.py]
problems: []                     # REQUIRED: e.g. [{domain: d.pddl, problem: p07.pddl}]
adjustments: []                  # REQUIRED: e.g. [smart, 1, 10, 100, 1000]
";

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Run { json, .. }
        | Commands::Describe { json, .. }
        | Commands::Report { json, .. } => *json,
        _ => false,
    }
}

fn batch_to_json(batch: &til_runner::Batch) -> Value {
    let limits = batch.configurations.first().map(|c| {
        json!({
            "memory_bytes": c.memory_limit_bytes,
            "time_seconds": c.time_limit_seconds
        })
    });
    json!({
        "name": batch.name,
        "results_root": batch.results_root.display().to_string(),
        "workers": batch.workers,
        "limits": limits,
        "capable_planner": batch.toolchain.capable_planner,
        "deadline_oblivious_planner": batch.toolchain.deadline_oblivious_planner,
        "validator": batch.toolchain.validator,
        "adjuster": batch.toolchain.adjuster,
        "runs": batch
            .configurations
            .iter()
            .map(|c| c.identity_key())
            .collect::<Vec<_>>()
    })
}

fn print_batch(batch: &til_runner::Batch) {
    println!("batch: {}", batch.name);
    println!("results_root: {}", batch.results_root.display());
    println!("workers: {}", batch.workers);
    if let Some(first) = batch.configurations.first() {
        println!("memory_limit_bytes: {}", first.memory_limit_bytes);
        println!("time_limit_seconds: {}", first.time_limit_seconds);
    }
    println!("capable_planner: {:?}", batch.toolchain.capable_planner);
    println!(
        "deadline_oblivious_planner: {:?}",
        batch.toolchain.deadline_oblivious_planner
    );
    println!("validator: {:?}", batch.toolchain.validator);
    println!("adjuster: {:?}", batch.toolchain.adjuster);
    println!("runs: {}", batch.configurations.len());
    for configuration in &batch.configurations {
        println!("run: {}", configuration.identity_key());
    }
}

fn print_counts(report: &til_runner::BatchReport) {
    println!("success: {}", report.counts.success);
    println!("validation_failed: {}", report.counts.validation_failed);
    println!("planner_failed: {}", report.counts.planner_failed);
    println!("timed_out: {}", report.counts.timed_out);
    println!("faulted: {}", report.counts.faulted);
    if report.inconsistencies > 0 {
        println!("inconsistencies: {}", report.inconsistencies);
    }
}
