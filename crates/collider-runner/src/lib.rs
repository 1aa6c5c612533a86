//! Staged experiment pipeline.
//!
//! Runs a fixed, linear sequence of stages over every combination of a
//! parameter space on a pool of worker threads, caching each
//! (stage, parameter tuple) result in a persisted log so later runs can skip
//! work that is already done.
//!
//! ```text
//! orchestrator -> task queue -> stage workers -> result queue -> handler
//!                     ^                                            |
//!                     +------------- next stage -------------------+
//!                                                                  v
//!                                                 writer queue -> writer -> log
//! ```

pub mod config;
pub mod error;
pub mod job;
pub mod orchestrator;
pub mod params;
pub mod predicate;
pub mod process;
pub mod queue;
pub mod result_log;
pub mod stage;
mod worker;

pub use config::{describe_experiment, load_experiment, ExperimentFile, ExperimentSummary};
pub use error::{ColliderError, Result};
pub use job::{CompletedJob, Job, JobState, JobStats, ResultRecord, StageResult};
pub use orchestrator::{run_experiments, worker_count, Experiment, RunReport};
pub use params::{ParameterSpace, ParameterTuple};
pub use predicate::{RerunMode, RerunPolicy, RerunPredicate};
pub use process::{ProcessStage, ProcessStageConfig};
pub use result_log::{LogRow, ResultLog};
pub use stage::{CallbackStage, Stage, StageOrder};

use chrono::Utc;
use std::fs;
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

static TMP_SEQ: AtomicU64 = AtomicU64::new(0);

pub fn ensure_dir(path: &Path) -> std::io::Result<()> {
    fs::create_dir_all(path)
}

/// Writes through a temp file in the same directory and renames over `path`,
/// so readers never see a half-written artifact.
pub fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }
    let ts = Utc::now().timestamp_micros();
    let pid = std::process::id();
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("tmpfile");
    let seq = TMP_SEQ.fetch_add(1, Ordering::Relaxed);
    let tmp = path.with_file_name(format!(".{}.tmp.{}.{}.{}", name, pid, seq, ts));
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
