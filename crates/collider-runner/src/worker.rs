//! The three pipeline loops: stage workers, the result handler and the
//! result writer. Each runs on its own thread and talks to the others only
//! through the queues in `Pipeline`.

use crate::error::{ColliderError, Result};
use crate::job::{CompletedJob, Job, JobState, StageResult};
use crate::predicate::RerunPredicate;
use crate::process::thread_cpu_time;
use crate::queue::{CompletionSignal, JoinableQueue, Message};
use crate::result_log::{LogRow, ResultLog};
use crate::stage::StageOrder;
use anyhow::anyhow;
use parking_lot::RwLock;
use serde_json::json;
use std::any::Any;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

/// Shared wiring handed to every pipeline thread.
pub(crate) struct Pipeline {
    pub order: StageOrder,
    pub predicate: RerunPredicate,
    pub log: Arc<RwLock<ResultLog>>,
    pub tasks: Arc<JoinableQueue<Job>>,
    pub results: Arc<JoinableQueue<StageResult>>,
    pub writes: Arc<JoinableQueue<LogRow>>,
    pub signal: Arc<CompletionSignal>,
    /// Number of parameter tuples in the run.
    pub total: usize,
}

#[derive(Debug, Default)]
pub(crate) struct HandlerReport {
    pub executed: usize,
    pub cache_hits: usize,
    pub completed: Vec<CompletedJob>,
}

/// Spawns a named thread; a panic inside `body` fails the run instead of
/// leaving the orchestrator waiting on a signal nobody will set.
pub(crate) fn spawn_guarded<T, F>(
    name: String,
    signal: Arc<CompletionSignal>,
    body: F,
) -> Result<JoinHandle<Option<T>>>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    let thread_name = name.clone();
    let handle = thread::Builder::new().name(thread_name).spawn(move || {
        match panic::catch_unwind(AssertUnwindSafe(body)) {
            Ok(out) => Some(out),
            Err(payload) => {
                signal.fail(ColliderError::WorkerCrashed(format!(
                    "{} panicked: {}",
                    name,
                    panic_message(payload.as_ref())
                )));
                None
            }
        }
    })?;
    Ok(handle)
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

pub(crate) fn stage_worker(ctx: Arc<Pipeline>, worker_id: usize) {
    tracing::debug!(worker_id, "stage worker started");
    loop {
        let job = match ctx.tasks.get() {
            Message::Item(job) => job,
            Message::Shutdown => {
                ctx.tasks.task_done();
                break;
            }
        };
        if !ctx.signal.is_failed() {
            match run_stage(&ctx, job) {
                Ok(result) => ctx.results.put(result),
                Err(err) => {
                    ctx.signal.fail(err);
                }
            }
        }
        ctx.tasks.task_done();
    }
    tracing::debug!(worker_id, "stage worker stopped");
}

fn run_stage(ctx: &Pipeline, mut job: Job) -> Result<StageResult> {
    let stage = ctx.order.get(job.stage).cloned().ok_or_else(|| {
        ColliderError::WorkerCrashed(format!(
            "job {} points at stage #{} but the pipeline has {} stages",
            job.index,
            job.stage,
            ctx.order.len()
        ))
    })?;
    let name = stage.name().to_string();
    let rerun = {
        let log = ctx.log.read();
        ctx.predicate.rerun(&name, job.stage, &job.value, &log)
    };
    tracing::debug!(
        index = job.index,
        stage = %name,
        value = %job.value,
        state = JobState::InFlight.as_str(),
        rerun,
        "stage picked up"
    );

    let data = if rerun {
        let wall = Instant::now();
        let cpu = thread_cpu_time();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            stage.execute(&job.value, &job.stats)
        }));
        let mut data = match outcome {
            Ok(Ok(data)) => data,
            Ok(Err(source)) => {
                return Err(ColliderError::StageFailed {
                    stage: name,
                    index: job.index,
                    source,
                })
            }
            Err(payload) => {
                return Err(ColliderError::StageFailed {
                    stage: name,
                    index: job.index,
                    source: anyhow!("panicked: {}", panic_message(payload.as_ref())),
                })
            }
        };
        data.insert("wall_time".to_string(), json!(wall.elapsed().as_secs_f64()));
        data.insert(
            "process_time".to_string(),
            json!((thread_cpu_time() - cpu).max(0.0)),
        );
        data
    } else {
        ctx.log.read().get_data(&name, &job.value)?
    };

    job.stats.record(&name, data.clone());
    Ok(StageResult {
        index: job.index,
        position: job.stage,
        row: LogRow {
            stage: name,
            value: job.value,
            data,
        },
        stats: job.stats,
        executed: rerun,
    })
}

pub(crate) fn result_handler(ctx: Arc<Pipeline>) -> HandlerReport {
    let mut report = HandlerReport::default();
    loop {
        let result = match ctx.results.get() {
            Message::Item(result) => result,
            Message::Shutdown => {
                ctx.results.task_done();
                break;
            }
        };
        if ctx.signal.is_failed() {
            ctx.results.task_done();
            continue;
        }
        if result.executed {
            report.executed += 1;
        } else {
            report.cache_hits += 1;
        }

        let state = JobState::after_stage(result.position, ctx.order.len());
        let persist = state == JobState::Terminal || result.executed;
        let StageResult {
            index,
            position,
            row,
            stats,
            executed,
        } = result;
        if state == JobState::Terminal {
            report.completed.push(CompletedJob {
                index,
                value: row.value.clone(),
                stats,
            });
        } else {
            ctx.tasks.put(Job {
                index,
                value: row.value.clone(),
                stage: position + 1,
                stats,
            });
        }
        tracing::debug!(
            index,
            stage = %row.stage,
            state = state.as_str(),
            executed,
            "stage result routed"
        );
        if persist {
            ctx.writes.put(row);
        }
        ctx.results.task_done();

        if report.completed.len() == ctx.total {
            if ctx.signal.complete() {
                tracing::info!(completed = ctx.total, "all jobs reached the terminal stage");
            }
            break;
        }
    }
    report
}

/// Persists forwarded rows. Returns the number of rows written, or the error
/// from the final persist.
pub(crate) fn result_writer(ctx: Arc<Pipeline>) -> Result<usize> {
    let mut per_stage: HashMap<String, usize> = HashMap::new();
    let mut written = 0usize;
    let mut broken = false;
    loop {
        let row = match ctx.writes.get() {
            Message::Item(row) => row,
            Message::Shutdown => {
                let outcome = {
                    let mut log = ctx.log.write();
                    log.save().and_then(|_| log.save_csv())
                };
                ctx.writes.task_done();
                outcome?;
                tracing::debug!(written, "result writer flushed and stopped");
                return Ok(written);
            }
        };
        if broken {
            ctx.writes.task_done();
            continue;
        }
        let seen = per_stage.entry(row.stage.clone()).or_insert(0);
        *seen += 1;
        let force_save = *seen == ctx.total;
        let stage = row.stage.clone();
        let outcome = ctx.log.write().put_result(row, force_save);
        match outcome {
            Ok(()) => {
                written += 1;
                if force_save {
                    tracing::info!(stage = %stage, "stage finished for every tuple; results saved");
                }
            }
            Err(err) => {
                broken = true;
                ctx.signal.fail(err);
            }
        }
        ctx.writes.task_done();
    }
}
