use crate::error::{ColliderError, Result};
use crate::job::{CompletedJob, Job};
use crate::params::ParameterSpace;
use crate::predicate::RerunPolicy;
use crate::queue::{CompletionSignal, JoinableQueue};
use crate::result_log::ResultLog;
use crate::stage::StageOrder;
use crate::worker::{result_handler, result_writer, spawn_guarded, stage_worker, Pipeline};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Everything `run_experiments` needs; built by the config loader or by hand.
pub struct Experiment {
    pub name: String,
    /// Directory holding the result files and the intermediate tree.
    pub output_dir: PathBuf,
    pub space: ParameterSpace,
    pub order: StageOrder,
    pub policy: RerunPolicy,
    /// Available cores are divided by this to size the worker pool.
    pub load_factor: f64,
}

#[derive(Debug)]
pub struct RunReport {
    pub experiment: String,
    pub tuples: usize,
    pub stages: usize,
    pub workers: usize,
    pub executed: usize,
    pub cache_hits: usize,
    pub rows_written: usize,
    pub log_rows: usize,
    /// Terminal jobs sorted by index.
    pub completed: Vec<CompletedJob>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// `min(available / load_factor, tuples)`, never below one.
pub fn worker_count(available: usize, load_factor: f64, tuples: usize) -> usize {
    let load_factor = if load_factor.is_finite() && load_factor > 0.0 {
        load_factor
    } else {
        1.0
    };
    let by_cores = (available as f64 / load_factor).floor() as usize;
    by_cores.min(tuples).max(1)
}

pub fn run_experiments(exp: &Experiment) -> Result<RunReport> {
    let started_at = Utc::now();
    let tuples = exp.space.tuples();
    let total = tuples.len();
    let log = ResultLog::open(&exp.output_dir, &exp.name, exp.space.names())?;
    let predicate = exp.policy.resolve(&exp.order)?;
    predicate.validate(&exp.order, &tuples, &log)?;

    let available = thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    let workers = worker_count(available, exp.load_factor, total);
    tracing::info!(
        experiment = %exp.name,
        tuples = total,
        stages = exp.order.len(),
        workers,
        rerun = %predicate,
        cached_rows = log.len(),
        "starting experiment run"
    );

    let signal = CompletionSignal::new();
    let ctx = Arc::new(Pipeline {
        order: exp.order.clone(),
        predicate,
        log: Arc::new(RwLock::new(log)),
        tasks: JoinableQueue::new(),
        results: JoinableQueue::new(),
        writes: JoinableQueue::new(),
        signal: Arc::clone(&signal),
        total,
    });

    let handler = {
        let ctx = Arc::clone(&ctx);
        spawn_guarded("collider-handler".to_string(), Arc::clone(&signal), move || {
            result_handler(ctx)
        })?
    };
    let writer = {
        let ctx = Arc::clone(&ctx);
        spawn_guarded("collider-writer".to_string(), Arc::clone(&signal), move || {
            result_writer(ctx)
        })?
    };

    for (index, value) in tuples.into_iter().enumerate() {
        ctx.tasks.put(Job::new(index, value));
    }

    let mut pool = Vec::with_capacity(workers);
    for worker_id in 0..workers {
        let ctx_worker = Arc::clone(&ctx);
        let spawned = spawn_guarded(
            format!("collider-worker-{}", worker_id),
            Arc::clone(&signal),
            move || stage_worker(ctx_worker, worker_id),
        );
        match spawned {
            Ok(handle) => pool.push(handle),
            Err(err) => {
                signal.fail(err);
                break;
            }
        }
    }

    signal.wait();
    let failed = signal.is_failed();

    // After a failure the handler may still be routing; stop it first so no
    // job lands in the task queue behind the worker sentinels.
    let mut handler = Some(handler);
    let mut handler_report = None;
    if failed {
        ctx.results.put_shutdown();
        handler_report = join_thread(handler.take(), &signal);
    }

    if pool.is_empty() {
        let dropped = ctx.tasks.discard_pending();
        tracing::warn!(dropped, "no stage worker started; discarding queued jobs");
    }
    // Each worker consumes exactly one sentinel. Joining the threads rather
    // than the queue keeps a crashed consumer from blocking shutdown.
    for _ in 0..pool.len() {
        ctx.tasks.put_shutdown();
    }
    for handle in pool {
        join_thread(Some(handle), &signal);
    }

    if !failed {
        ctx.results.put_shutdown();
        handler_report = join_thread(handler.take(), &signal);
    }

    ctx.writes.put_shutdown();
    let writer_outcome = join_thread(Some(writer), &signal);

    if let Some(err) = signal.take_failure() {
        return Err(err);
    }
    let rows_written = match writer_outcome {
        Some(Ok(n)) => n,
        Some(Err(err)) => return Err(err),
        None => return Err(ColliderError::WorkerCrashed("result writer did not finish".into())),
    };
    let handler_report = handler_report.ok_or_else(|| {
        ColliderError::WorkerCrashed("result handler did not finish".to_string())
    })?;

    let mut completed = handler_report.completed;
    completed.sort_by_key(|job| job.index);
    let report = RunReport {
        experiment: exp.name.clone(),
        tuples: total,
        stages: exp.order.len(),
        workers,
        executed: handler_report.executed,
        cache_hits: handler_report.cache_hits,
        rows_written,
        log_rows: ctx.log.read().len(),
        completed,
        started_at,
        finished_at: Utc::now(),
    };
    tracing::info!(
        experiment = %report.experiment,
        executed = report.executed,
        cache_hits = report.cache_hits,
        rows = report.log_rows,
        elapsed_ms = (report.finished_at - report.started_at).num_milliseconds(),
        "experiment run finished"
    );
    Ok(report)
}

fn join_thread<T>(
    handle: Option<JoinHandle<Option<T>>>,
    signal: &CompletionSignal,
) -> Option<T> {
    let handle = handle?;
    let name = handle
        .thread()
        .name()
        .unwrap_or("collider-thread")
        .to_string();
    match handle.join() {
        Ok(out) => out,
        Err(_) => {
            signal.fail(ColliderError::WorkerCrashed(format!("{} could not be joined", name)));
            None
        }
    }
}
