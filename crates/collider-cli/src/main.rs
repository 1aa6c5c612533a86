use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use collider_runner::result_log::csv_path;
use collider_runner::{
    describe_experiment, load_experiment, run_experiments, Experiment, ExperimentSummary,
    ResultLog, RerunPolicy, RunReport,
};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "collider", version, about = "Staged parameter-sweep runner")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum RerunArg {
    #[value(name = "always")]
    Always,
    #[value(name = "if_needed")]
    IfNeeded,
    #[value(name = "from_stage")]
    FromStage,
    #[value(name = "only")]
    Only,
    #[value(name = "only_force")]
    OnlyForce,
}

impl RerunArg {
    fn keyword(self) -> &'static str {
        match self {
            RerunArg::Always => "always",
            RerunArg::IfNeeded => "if_needed",
            RerunArg::FromStage => "from_stage",
            RerunArg::Only => "only",
            RerunArg::OnlyForce => "only_force",
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Run every stage over the full parameter space.
    Run {
        experiment: PathBuf,
        /// Overrides the file's rerun mode.
        #[arg(long, value_enum)]
        rerun: Option<RerunArg>,
        /// Stage names for from_stage, only and only_force.
        #[arg(long, value_delimiter = ',')]
        stages: Vec<String>,
        #[arg(long)]
        load_factor: Option<f64>,
        #[arg(long)]
        json: bool,
    },
    /// Validate the experiment file and show what a run would do.
    Describe {
        experiment: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Rows per stage currently in the result log.
    Status {
        experiment: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Rewrite the CSV from the result snapshot.
    Export {
        experiment: PathBuf,
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(
            EnvFilter::from_default_env()
                .add_directive("collider=info".parse()?)
                .add_directive("collider_runner=info".parse()?),
        )
        .init();

    let cli = Cli::parse();
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
                emit_json(&json_error("command_failed", format!("{:#}", err), json!({})));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn run_command(command: Commands) -> Result<Option<Value>> {
    match command {
        Commands::Run {
            experiment,
            rerun,
            stages,
            load_factor,
            json,
        } => {
            let mut exp = load(&experiment)?;
            apply_overrides(&mut exp, rerun, &stages, load_factor)?;
            let report = run_experiments(&exp)
                .with_context(|| format!("run of {} failed", exp.name))?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "run",
                    "report": report_json(&report, &exp),
                })));
            }
            print_report(&report, &exp);
            Ok(None)
        }
        Commands::Describe { experiment, json } => {
            let summary = describe_experiment(&experiment)
                .with_context(|| format!("cannot describe {}", experiment.display()))?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "describe",
                    "summary": summary_json(&summary),
                })));
            }
            print_summary(&summary);
            Ok(None)
        }
        Commands::Status { experiment, json } => {
            let exp = load(&experiment)?;
            let log = ResultLog::open(&exp.output_dir, &exp.name, exp.space.names())?;
            let tuples = exp.space.combination_count();
            let counts = log.stage_counts();
            let stages: Vec<Value> = exp
                .order
                .names()
                .into_iter()
                .map(|name| {
                    let rows = counts.get(name).copied().unwrap_or(0);
                    json!({ "stage": name, "rows": rows, "complete": rows == tuples })
                })
                .collect();
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "status",
                    "experiment": exp.name,
                    "snapshot": log.snapshot_path().display().to_string(),
                    "tuples": tuples,
                    "rows": log.len(),
                    "stages": stages,
                })));
            }
            println!("experiment: {}", exp.name);
            println!("snapshot: {}", log.snapshot_path().display());
            println!("tuples: {}", tuples);
            for stage in stages.iter() {
                println!(
                    "  {}: {}/{}",
                    stage["stage"].as_str().unwrap_or_default(),
                    stage["rows"],
                    tuples
                );
            }
            Ok(None)
        }
        Commands::Export { experiment, json } => {
            let exp = load(&experiment)?;
            let log = ResultLog::open(&exp.output_dir, &exp.name, exp.space.names())?;
            if !log.snapshot_path().exists() {
                bail!(
                    "no result snapshot at {}; run the experiment first",
                    log.snapshot_path().display()
                );
            }
            log.save_csv()?;
            let path = csv_path(&exp.output_dir, &exp.name);
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "export",
                    "csv": path.display().to_string(),
                    "rows": log.len(),
                })));
            }
            println!("wrote {} rows to {}", log.len(), path.display());
            Ok(None)
        }
    }
}

fn load(path: &Path) -> Result<Experiment> {
    let exp = load_experiment(path).with_context(|| format!("cannot load {}", path.display()))?;
    tracing::debug!(
        experiment = %exp.name,
        output_dir = %exp.output_dir.display(),
        "loaded experiment file"
    );
    Ok(exp)
}

fn apply_overrides(
    exp: &mut Experiment,
    rerun: Option<RerunArg>,
    stages: &[String],
    load_factor: Option<f64>,
) -> Result<()> {
    match rerun {
        Some(mode) => {
            let policy = RerunPolicy::from_parts(mode.keyword(), stages)?;
            policy.resolve(&exp.order)?;
            tracing::info!(rerun = mode.keyword(), stages = ?stages, "rerun mode overridden");
            exp.policy = policy;
        }
        None if !stages.is_empty() => bail!("--stages requires --rerun"),
        None => {}
    }
    if let Some(lf) = load_factor {
        if !(lf.is_finite() && lf > 0.0) {
            bail!("--load-factor must be a positive number (found {})", lf);
        }
        exp.load_factor = lf;
    }
    Ok(())
}

fn report_json(report: &RunReport, exp: &Experiment) -> Value {
    json!({
        "experiment": report.experiment,
        "tuples": report.tuples,
        "stages": report.stages,
        "workers": report.workers,
        "executed": report.executed,
        "cache_hits": report.cache_hits,
        "rows_written": report.rows_written,
        "log_rows": report.log_rows,
        "completed": report.completed.len(),
        "started_at": report.started_at.to_rfc3339(),
        "finished_at": report.finished_at.to_rfc3339(),
        "results_csv": csv_path(&exp.output_dir, &exp.name).display().to_string(),
    })
}

fn print_report(report: &RunReport, exp: &Experiment) {
    println!("experiment: {}", report.experiment);
    println!("tuples: {}", report.tuples);
    println!("stages: {}", report.stages);
    println!("workers: {}", report.workers);
    println!("executed: {}", report.executed);
    println!("cache_hits: {}", report.cache_hits);
    println!("log_rows: {}", report.log_rows);
    println!(
        "elapsed: {:.3}s",
        (report.finished_at - report.started_at).num_milliseconds() as f64 / 1000.0
    );
    println!("results: {}", csv_path(&exp.output_dir, &exp.name).display());
}

fn summary_json(summary: &ExperimentSummary) -> Value {
    let stages: Vec<Value> = summary
        .stages
        .iter()
        .map(|s| {
            json!({
                "name": s.name,
                "kind": s.kind,
                "command": s.command,
                "timeout_s": s.timeout_s,
                "program_exists": s.program_exists,
            })
        })
        .collect();
    json!({
        "experiment": summary.name,
        "output_dir": summary.output_dir.display().to_string(),
        "parameters": summary.parameters,
        "tuples": summary.tuples,
        "stages": stages,
        "rerun": summary.rerun,
        "load_factor": summary.load_factor,
        "workers": summary.workers,
    })
}

fn print_summary(summary: &ExperimentSummary) {
    println!("experiment: {}", summary.name);
    println!("output_dir: {}", summary.output_dir.display());
    for (name, count) in summary.parameters.iter() {
        println!("parameter: {} ({} values)", name, count);
    }
    println!("tuples: {}", summary.tuples);
    println!("rerun: {}", summary.rerun);
    println!("load_factor: {}", summary.load_factor);
    println!("workers: {}", summary.workers);
    for stage in summary.stages.iter() {
        println!(
            "stage: {} [{}] timeout={}s {:?}",
            stage.name, stage.kind, stage.timeout_s, stage.command
        );
        if !stage.program_exists {
            println!("  warning: executable not found: {}", stage.command[0]);
        }
    }
}

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
        | Commands::Status { json, .. }
        | Commands::Export { json, .. } => *json,
    }
}
