//! Experiment file loading.
//!
//! ```yaml
//! experiment: demo
//! output_dir: out          # relative to this file; defaults to its directory
//! load_factor: 1.0
//! parameters:
//!   n: [1, 2]
//!   mode: [a]
//! stages:
//!   - name: prep
//!     kind: process        # process | process_output
//!     command: ["./prep.sh", "{n}", "{mode}"]
//!     timeout: 10
//! rerun:
//!   mode: from_stage       # always | if_needed | from_stage | only | only_force
//!   stages: [prep]
//! ```

use crate::error::{ColliderError, Result};
use crate::orchestrator::{worker_count, Experiment};
use crate::params::ParameterSpace;
use crate::predicate::RerunPolicy;
use crate::process::{intermediate_root, ProcessStage, ProcessStageConfig};
use crate::stage::{Stage, StageOrder};
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExperimentFile {
    pub experiment: String,
    #[serde(default)]
    pub output_dir: Option<String>,
    #[serde(default)]
    pub load_factor: Option<f64>,
    pub parameters: BTreeMap<String, Vec<Value>>,
    pub stages: Vec<StageDef>,
    #[serde(default)]
    pub rerun: Option<RerunDef>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StageDef {
    pub name: String,
    pub kind: String,
    pub command: Vec<String>,
    pub timeout: f64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RerunDef {
    pub mode: String,
    #[serde(default)]
    pub stages: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageKind {
    Process,
    ProcessOutput,
}

impl StageKind {
    pub fn parse(raw: &str) -> Result<Self> {
        match raw {
            "process" => Ok(StageKind::Process),
            "process_output" => Ok(StageKind::ProcessOutput),
            other => Err(ColliderError::config(format!(
                "unknown stage kind: {} (expected process or process_output)",
                other
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StageKind::Process => "process",
            StageKind::ProcessOutput => "process_output",
        }
    }
}

#[derive(Debug, Clone)]
pub struct StageSummary {
    pub name: String,
    pub kind: String,
    pub command: Vec<String>,
    pub timeout_s: f64,
    pub program_exists: bool,
}

#[derive(Debug, Clone)]
pub struct ExperimentSummary {
    pub name: String,
    pub output_dir: PathBuf,
    pub parameters: BTreeMap<String, usize>,
    pub tuples: usize,
    pub stages: Vec<StageSummary>,
    pub rerun: String,
    pub load_factor: f64,
    pub workers: usize,
}

pub fn read_experiment_file(path: &Path) -> Result<ExperimentFile> {
    let raw_yaml = fs::read_to_string(path)?;
    let yaml_value: serde_yaml::Value = serde_yaml::from_str(&raw_yaml)?;
    let json_value: Value = serde_json::to_value(yaml_value)?;
    validate_required_fields(&json_value)?;
    serde_json::from_value(json_value).map_err(|e| {
        ColliderError::config(format!("invalid experiment file {}: {}", path.display(), e))
    })
}

fn validate_required_fields(json_value: &Value) -> Result<()> {
    let required: &[&str] = &["/experiment", "/parameters", "/stages"];
    let mut missing: Vec<String> = Vec::new();
    for pointer in required {
        let is_missing = match json_value.pointer(pointer) {
            None | Some(Value::Null) => true,
            Some(Value::String(s)) => s.trim().is_empty(),
            Some(Value::Array(a)) => a.is_empty() && *pointer == "/stages",
            _ => false,
        };
        if is_missing {
            missing.push(pointer.to_string());
        }
    }
    if let Some(stages) = json_value.pointer("/stages").and_then(|v| v.as_array()) {
        for (idx, stage) in stages.iter().enumerate() {
            for field in ["name", "kind", "command", "timeout"] {
                if stage.get(field).map(|v| v.is_null()).unwrap_or(true) {
                    missing.push(format!("/stages/{}/{}", idx, field));
                }
            }
        }
    }
    if missing.is_empty() {
        Ok(())
    } else {
        Err(ColliderError::config(format!(
            "experiment file missing required fields:\n{}",
            missing
                .iter()
                .map(|p| format!("  - {}", p))
                .collect::<Vec<_>>()
                .join("\n")
        )))
    }
}

fn experiment_dir(path: &Path) -> PathBuf {
    path.parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."))
        .canonicalize()
        .unwrap_or_else(|_| PathBuf::from("."))
}

fn resolve_output_dir(file: &ExperimentFile, exp_dir: &Path) -> PathBuf {
    match file.output_dir.as_deref() {
        Some(dir) if Path::new(dir).is_absolute() => PathBuf::from(dir),
        Some(dir) => normalize_path(&exp_dir.join(dir)),
        None => exp_dir.to_path_buf(),
    }
}

/// Relative programs that look like paths are taken relative to the
/// experiment file; bare names are left for `PATH` lookup.
fn resolve_program(program: &str, exp_dir: &Path) -> String {
    let p = Path::new(program);
    if p.is_relative() && (program.starts_with('.') || program.contains('/')) {
        normalize_path(&exp_dir.join(p))
            .to_string_lossy()
            .to_string()
    } else {
        program.to_string()
    }
}

fn normalize_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for c in path.components() {
        match c {
            Component::CurDir => {}
            Component::ParentDir => {
                let _ = out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

fn rerun_policy(file: &ExperimentFile) -> Result<RerunPolicy> {
    match file.rerun.as_ref() {
        Some(def) => RerunPolicy::from_parts(&def.mode, &def.stages),
        None => Ok(RerunPolicy::default()),
    }
}

fn load_factor(file: &ExperimentFile) -> Result<f64> {
    let lf = file.load_factor.unwrap_or(1.0);
    if !(lf.is_finite() && lf > 0.0) {
        return Err(ColliderError::config(format!(
            "load_factor must be a positive number (found {})",
            lf
        )));
    }
    Ok(lf)
}

fn timeout(def: &StageDef) -> Result<Duration> {
    if !(def.timeout.is_finite() && def.timeout > 0.0) {
        return Err(ColliderError::config(format!(
            "stage {} timeout must be a positive number of seconds (found {})",
            def.name, def.timeout
        )));
    }
    Duration::try_from_secs_f64(def.timeout).map_err(|e| {
        ColliderError::config(format!(
            "stage {} timeout {} is out of range: {}",
            def.name, def.timeout, e
        ))
    })
}

/// Parses and validates an experiment file into a runnable `Experiment`.
/// Every configuration problem surfaces here, before any worker starts.
pub fn load_experiment(path: &Path) -> Result<Experiment> {
    let file = read_experiment_file(path)?;
    let exp_dir = experiment_dir(path);
    build_experiment(&file, &exp_dir)
}

pub fn build_experiment(file: &ExperimentFile, exp_dir: &Path) -> Result<Experiment> {
    if file.experiment.contains(['/', '\\']) {
        return Err(ColliderError::config(format!(
            "experiment name cannot contain path separators: {}",
            file.experiment
        )));
    }
    let space = ParameterSpace::new(file.parameters.clone())?;
    let parameters = space.names();
    let output_dir = resolve_output_dir(file, exp_dir);
    let root = intermediate_root(&output_dir, &file.experiment);

    let mut stages: Vec<Arc<dyn Stage>> = Vec::with_capacity(file.stages.len());
    let mut earlier: Vec<String> = Vec::new();
    for def in file.stages.iter() {
        let kind = StageKind::parse(&def.kind)?;
        let (program, args) = match def.command.split_first() {
            Some((program, args)) => (resolve_program(program, exp_dir), args.to_vec()),
            None => {
                return Err(ColliderError::config(format!(
                    "stage {} has an empty command",
                    def.name
                )))
            }
        };
        let config = ProcessStageConfig {
            name: def.name.clone(),
            program,
            args,
            timeout: timeout(def)?,
            persist_output: kind == StageKind::ProcessOutput,
        };
        stages.push(Arc::new(ProcessStage::new(
            config,
            &parameters,
            &earlier,
            root.clone(),
        )?));
        earlier.push(def.name.clone());
    }
    let order = StageOrder::new(stages)?;
    let policy = rerun_policy(file)?;
    policy.resolve(&order)?;

    Ok(Experiment {
        name: file.experiment.clone(),
        output_dir,
        space,
        order,
        policy,
        load_factor: load_factor(file)?,
    })
}

pub fn describe_experiment(path: &Path) -> Result<ExperimentSummary> {
    let file = read_experiment_file(path)?;
    let exp_dir = experiment_dir(path);
    let experiment = build_experiment(&file, &exp_dir)?;
    let available = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    let tuples = experiment.space.combination_count();

    let stages = file
        .stages
        .iter()
        .map(|def| {
            let command: Vec<String> = def
                .command
                .iter()
                .enumerate()
                .map(|(i, part)| {
                    if i == 0 {
                        resolve_program(part, &exp_dir)
                    } else {
                        part.clone()
                    }
                })
                .collect();
            let program = Path::new(&command[0]);
            let program_exists = if program.components().count() > 1 {
                program.exists()
            } else {
                true
            };
            StageSummary {
                name: def.name.clone(),
                kind: def.kind.clone(),
                command,
                timeout_s: def.timeout,
                program_exists,
            }
        })
        .collect();

    Ok(ExperimentSummary {
        name: experiment.name.clone(),
        output_dir: experiment.output_dir.clone(),
        parameters: file
            .parameters
            .iter()
            .map(|(k, v)| (k.clone(), v.len()))
            .collect(),
        tuples,
        stages,
        rerun: experiment.policy.resolve(&experiment.order)?.to_string(),
        load_factor: experiment.load_factor,
        workers: worker_count(available, experiment.load_factor, tuples),
    })
}
