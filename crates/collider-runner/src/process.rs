//! Stages that shell out to an external program.
//!
//! Each run happens in `{root}/{sha256(tuple text)}`, where `root` is the
//! experiment's `{name}_intermediate` directory. Execution problems never
//! escape `execute`: they become a failure record with `timeout = true`.

use crate::error::{ColliderError, Result};
use crate::job::{JobStats, ResultRecord};
use crate::params::{render_value, ParameterTuple};
use crate::stage::Stage;
use crate::{atomic_write_bytes, ensure_dir};
use anyhow::{anyhow, Context};
use serde_json::{json, Value};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(5);
const READ_GRACE: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct ProcessStageConfig {
    pub name: String,
    pub program: String,
    pub args: Vec<String>,
    pub timeout: Duration,
    /// Also write captured stdout to `{workdir}/{name}`.
    pub persist_output: bool,
}

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Literal(String),
    Param(usize),
    Workdir,
    StageName,
    Output(String),
}

#[derive(Debug)]
pub struct ProcessStage {
    name: String,
    program: String,
    args: Vec<Vec<Segment>>,
    timeout: Duration,
    persist_output: bool,
    intermediate_root: PathBuf,
}

/// What the child did, as observed by the parent.
#[derive(Debug, Clone, Default)]
pub struct ProcessOutcome {
    pub stdout: Vec<u8>,
    pub cpu_user: f64,
    pub cpu_sys: f64,
    pub timed_out: bool,
    pub returncode: Option<i32>,
}

impl ProcessStage {
    /// `parameters` are the sorted parameter names; `earlier_stages` are the
    /// names of every stage before this one and bound `{output:<stage>}`.
    pub fn new(
        config: ProcessStageConfig,
        parameters: &[String],
        earlier_stages: &[String],
        intermediate_root: PathBuf,
    ) -> Result<Self> {
        if config.program.trim().is_empty() {
            return Err(ColliderError::config(format!(
                "stage {} has an empty command",
                config.name
            )));
        }
        if config.timeout.is_zero() {
            return Err(ColliderError::config(format!(
                "stage {} needs a positive timeout",
                config.name
            )));
        }
        let mut args = Vec::with_capacity(config.args.len());
        for raw in config.args.iter() {
            let segments = parse_template(raw, parameters).map_err(|e| {
                ColliderError::config(format!("stage {} argument '{}': {}", config.name, raw, e))
            })?;
            for seg in segments.iter() {
                if let Segment::Output(stage) = seg {
                    if !earlier_stages.iter().any(|s| s == stage) {
                        return Err(ColliderError::config(format!(
                            "stage {} references output of {}, which does not run before it",
                            config.name, stage
                        )));
                    }
                }
            }
            args.push(segments);
        }
        Ok(Self {
            name: config.name,
            program: config.program,
            args,
            timeout: config.timeout,
            persist_output: config.persist_output,
            intermediate_root,
        })
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn workdir(&self, value: &ParameterTuple) -> PathBuf {
        self.intermediate_root.join(value.digest())
    }

    pub fn output_path(&self, value: &ParameterTuple) -> PathBuf {
        self.workdir(value).join(&self.name)
    }

    pub fn command_line(&self, value: &ParameterTuple) -> Vec<String> {
        let workdir = self.workdir(value);
        let mut line = vec![self.program.clone()];
        for arg in self.args.iter() {
            let mut out = String::new();
            for seg in arg.iter() {
                match seg {
                    Segment::Literal(s) => out.push_str(s),
                    Segment::Param(idx) => {
                        if let Some(v) = value.get(*idx) {
                            out.push_str(&render_value(v));
                        }
                    }
                    Segment::Workdir => out.push_str(&workdir.to_string_lossy()),
                    Segment::StageName => out.push_str(&self.name),
                    Segment::Output(stage) => {
                        out.push_str(&workdir.join(stage).to_string_lossy())
                    }
                }
            }
            line.push(out);
        }
        line
    }

    fn try_execute(&self, value: &ParameterTuple) -> anyhow::Result<ResultRecord> {
        let workdir = self.workdir(value);
        ensure_dir(&workdir)
            .with_context(|| format!("creating working directory {}", workdir.display()))?;
        let line = self.command_line(value);
        let mut cmd = Command::new(&line[0]);
        cmd.args(&line[1..]).current_dir(&workdir);
        let outcome = run_with_timeout(cmd, self.timeout)
            .with_context(|| format!("running {}", line[0]))?;
        if self.persist_output {
            let path = self.output_path(value);
            atomic_write_bytes(&path, &outcome.stdout)
                .with_context(|| format!("writing stage output {}", path.display()))?;
        }
        if outcome.timed_out {
            tracing::warn!(
                stage = %self.name,
                value = %value,
                timeout_s = self.timeout.as_secs_f64(),
                "stage command killed after timeout"
            );
        }
        Ok(outcome_record(&outcome))
    }

    fn failure_record(&self) -> ResultRecord {
        let mut rec = ResultRecord::new();
        rec.insert("output".to_string(), json!(""));
        rec.insert("cpu_user".to_string(), json!(self.timeout.as_secs_f64()));
        rec.insert("cpu_sys".to_string(), json!(0.0));
        rec.insert("timeout".to_string(), json!(true));
        rec.insert("returncode".to_string(), Value::Null);
        rec
    }
}

impl Stage for ProcessStage {
    fn name(&self) -> &str {
        &self.name
    }

    fn execute(&self, value: &ParameterTuple, _stats: &JobStats) -> anyhow::Result<ResultRecord> {
        match self.try_execute(value) {
            Ok(rec) => Ok(rec),
            Err(err) => {
                tracing::warn!(
                    stage = %self.name,
                    value = %value,
                    error = %format!("{:#}", err),
                    "stage command failed; recording timeout result"
                );
                Ok(self.failure_record())
            }
        }
    }
}

fn outcome_record(outcome: &ProcessOutcome) -> ResultRecord {
    let mut rec = ResultRecord::new();
    rec.insert(
        "output".to_string(),
        json!(String::from_utf8_lossy(&outcome.stdout)),
    );
    rec.insert("cpu_user".to_string(), json!(outcome.cpu_user));
    rec.insert("cpu_sys".to_string(), json!(outcome.cpu_sys));
    rec.insert("timeout".to_string(), json!(outcome.timed_out));
    rec.insert(
        "returncode".to_string(),
        outcome.returncode.map(|c| json!(c)).unwrap_or(Value::Null),
    );
    rec
}

/// Splits an argument template into segments. `{name}` must be a parameter
/// in `parameters` or one of `workdir`, `stage`, `output:<stage>`.
fn parse_template(raw: &str, parameters: &[String]) -> std::result::Result<Vec<Segment>, String> {
    let mut segments = Vec::new();
    let mut literal = String::new();
    let mut chars = raw.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                literal.push('{');
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                literal.push('}');
            }
            '{' => {
                let mut name = String::new();
                let mut closed = false;
                for n in chars.by_ref() {
                    if n == '}' {
                        closed = true;
                        break;
                    }
                    name.push(n);
                }
                if !closed {
                    return Err("unterminated placeholder".to_string());
                }
                if !literal.is_empty() {
                    segments.push(Segment::Literal(std::mem::take(&mut literal)));
                }
                segments.push(placeholder(&name, parameters)?);
            }
            '}' => return Err("unmatched '}'".to_string()),
            other => literal.push(other),
        }
    }
    if !literal.is_empty() {
        segments.push(Segment::Literal(literal));
    }
    Ok(segments)
}

fn placeholder(name: &str, parameters: &[String]) -> std::result::Result<Segment, String> {
    match name {
        "workdir" => return Ok(Segment::Workdir),
        "stage" => return Ok(Segment::StageName),
        _ => {}
    }
    if let Some(stage) = name.strip_prefix("output:") {
        if stage.is_empty() {
            return Err("empty stage in output placeholder".to_string());
        }
        return Ok(Segment::Output(stage.to_string()));
    }
    parameters
        .iter()
        .position(|p| p == name)
        .map(Segment::Param)
        .ok_or_else(|| format!("unknown placeholder {{{}}}", name))
}

/// Runs `cmd` with stdout captured, killing its process group once `timeout`
/// elapses.
#[cfg(unix)]
pub fn run_with_timeout(mut cmd: Command, timeout: Duration) -> anyhow::Result<ProcessOutcome> {
    use std::os::unix::process::CommandExt;

    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .process_group(0);
    let mut child = cmd.spawn()?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("child stdout was not captured"))?;
    let reader = spawn_reader(stdout);

    let pid = child.id() as libc::pid_t;
    let started = Instant::now();
    let mut timed_out = false;
    let (status, usage) = loop {
        if let Some(done) = wait4(pid, libc::WNOHANG)? {
            break done;
        }
        if started.elapsed() >= timeout {
            timed_out = true;
            kill_group(pid);
            match wait4(pid, 0)? {
                Some(done) => break done,
                None => return Err(anyhow!("child {} vanished after kill", pid)),
            }
        }
        thread::sleep(POLL_INTERVAL);
    };

    // Backgrounded descendants left in the group would keep stdout open.
    kill_group(pid);
    let stdout = match collect_stdout(&reader, started, timeout)? {
        Some(buf) => buf,
        None => {
            timed_out = true;
            Vec::new()
        }
    };
    let returncode = if libc::WIFEXITED(status) {
        Some(libc::WEXITSTATUS(status))
    } else {
        None
    };
    Ok(ProcessOutcome {
        stdout,
        cpu_user: timeval_secs(&usage.ru_utime),
        cpu_sys: timeval_secs(&usage.ru_stime),
        timed_out,
        returncode,
    })
}

/// SIGKILLs every process still in the group led by `pid`. The group id
/// stays reserved while any member is alive, so a missing group is a no-op.
#[cfg(unix)]
fn kill_group(pid: libc::pid_t) {
    // SAFETY: kill has no memory-safety preconditions; ESRCH is ignored.
    unsafe {
        libc::kill(-pid, libc::SIGKILL);
    }
}

#[cfg(unix)]
fn wait4(pid: libc::pid_t, options: libc::c_int) -> std::io::Result<Option<(libc::c_int, libc::rusage)>> {
    loop {
        let mut status: libc::c_int = 0;
        // SAFETY: rusage is plain old data and fully written by a successful wait4.
        let mut usage: libc::rusage = unsafe { std::mem::zeroed() };
        let rc = unsafe { libc::wait4(pid, &mut status, options, &mut usage) };
        if rc == pid {
            return Ok(Some((status, usage)));
        }
        if rc == 0 {
            return Ok(None);
        }
        let err = std::io::Error::last_os_error();
        if err.kind() != std::io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

#[cfg(unix)]
fn timeval_secs(tv: &libc::timeval) -> f64 {
    tv.tv_sec as f64 + tv.tv_usec as f64 / 1_000_000.0
}

#[cfg(not(unix))]
pub fn run_with_timeout(mut cmd: Command, timeout: Duration) -> anyhow::Result<ProcessOutcome> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null());
    let mut child = cmd.spawn()?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("child stdout was not captured"))?;
    let reader = spawn_reader(stdout);
    let started = Instant::now();
    let mut timed_out = false;
    let status = loop {
        if let Some(status) = child.try_wait()? {
            break status;
        }
        if started.elapsed() >= timeout {
            timed_out = true;
            child.kill()?;
            break child.wait()?;
        }
        thread::sleep(POLL_INTERVAL);
    };
    let stdout = match collect_stdout(&reader, started, timeout)? {
        Some(buf) => buf,
        None => {
            timed_out = true;
            Vec::new()
        }
    };
    Ok(ProcessOutcome {
        stdout,
        cpu_user: 0.0,
        cpu_sys: 0.0,
        timed_out,
        returncode: status.code(),
    })
}

/// Drains `stdout` on its own thread; the result arrives on the receiver.
fn spawn_reader<R: Read + Send + 'static>(
    mut stdout: R,
) -> mpsc::Receiver<std::io::Result<Vec<u8>>> {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let mut buf = Vec::new();
        let res = stdout.read_to_end(&mut buf).map(|_| buf);
        let _ = tx.send(res);
    });
    rx
}

/// Waits for the captured stdout until the stage budget runs out, with a
/// short grace period for a child that exited right at the deadline.
/// `None` means the pipe was still held open when time ran out; the reader
/// thread is left to finish on its own.
fn collect_stdout(
    reader: &mpsc::Receiver<std::io::Result<Vec<u8>>>,
    started: Instant,
    timeout: Duration,
) -> anyhow::Result<Option<Vec<u8>>> {
    let budget = timeout
        .saturating_sub(started.elapsed())
        .max(READ_GRACE);
    match reader.recv_timeout(budget) {
        Ok(res) => Ok(Some(res?)),
        Err(mpsc::RecvTimeoutError::Timeout) => Ok(None),
        Err(mpsc::RecvTimeoutError::Disconnected) => Err(anyhow!("stdout reader panicked")),
    }
}

/// CPU seconds consumed by the calling thread.
#[cfg(unix)]
pub(crate) fn thread_cpu_time() -> f64 {
    // SAFETY: timespec is plain old data; clock_gettime only writes into it.
    let mut ts: libc::timespec = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::clock_gettime(libc::CLOCK_THREAD_CPUTIME_ID, &mut ts) };
    if rc != 0 {
        return 0.0;
    }
    ts.tv_sec as f64 + ts.tv_nsec as f64 / 1_000_000_000.0
}

#[cfg(not(unix))]
pub(crate) fn thread_cpu_time() -> f64 {
    0.0
}

/// `{dir}/{experiment}_intermediate`
pub fn intermediate_root(dir: &Path, experiment: &str) -> PathBuf {
    dir.join(format!("{}_intermediate", experiment))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn params() -> Vec<String> {
        vec!["mode".to_string(), "n".to_string()]
    }

    fn config(name: &str, program: &str, args: &[&str], timeout_ms: u64) -> ProcessStageConfig {
        ProcessStageConfig {
            name: name.to_string(),
            program: program.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            timeout: Duration::from_millis(timeout_ms),
            persist_output: false,
        }
    }

    fn tuple() -> ParameterTuple {
        ParameterTuple::new(vec![json!("fast"), json!(3)])
    }

    #[test]
    fn template_parser_handles_escapes_and_placeholders() {
        let segs = parse_template("--n={n}/{{x}}", &params()).expect("parse");
        assert_eq!(
            segs,
            vec![
                Segment::Literal("--n=".to_string()),
                Segment::Param(1),
                Segment::Literal("/{x}".to_string()),
            ]
        );
        assert!(parse_template("{n", &params()).is_err());
        assert!(parse_template("n}", &params()).is_err());
        assert!(parse_template("{output:}", &params()).is_err());
        assert_eq!(
            parse_template("{{n}}", &params()).expect("escaped"),
            vec![Segment::Literal("{n}".to_string())]
        );
    }

    #[test]
    fn unknown_placeholder_is_config_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = ProcessStage::new(
            config("prep", "echo", &["{missing}"], 1000),
            &params(),
            &[],
            dir.path().to_path_buf(),
        )
        .expect_err("unknown placeholder");
        assert!(err.to_string().contains("unknown placeholder"), "{}", err);
    }

    #[test]
    fn output_placeholder_must_name_earlier_stage() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = ProcessStage::new(
            config("run", "cat", &["{output:score}"], 1000),
            &params(),
            &["prep".to_string()],
            dir.path().to_path_buf(),
        )
        .expect_err("later stage");
        assert!(err.to_string().contains("does not run before it"), "{}", err);
    }

    #[test]
    fn command_line_renders_values_and_paths() {
        let dir = tempfile::tempdir().expect("tempdir");
        let stage = ProcessStage::new(
            config("run", "tool", &["{mode}", "-n{n}", "{output:prep}", "{stage}"], 1000),
            &params(),
            &["prep".to_string()],
            dir.path().to_path_buf(),
        )
        .expect("stage");
        let line = stage.command_line(&tuple());
        let workdir = dir.path().join(tuple().digest());
        assert_eq!(line[0], "tool");
        assert_eq!(line[1], "fast");
        assert_eq!(line[2], "-n3");
        assert_eq!(line[3], workdir.join("prep").to_string_lossy());
        assert_eq!(line[4], "run");
    }

    #[test]
    fn missing_executable_yields_timeout_record() {
        let dir = tempfile::tempdir().expect("tempdir");
        let stage = ProcessStage::new(
            config("prep", "/nonexistent/collider-test-binary", &["{n}"], 2500),
            &params(),
            &[],
            dir.path().to_path_buf(),
        )
        .expect("stage");
        let rec = stage
            .execute(&tuple(), &JobStats::new())
            .expect("never errors");
        assert_eq!(rec.get("timeout"), Some(&json!(true)));
        assert_eq!(rec.get("cpu_user"), Some(&json!(2.5)));
        assert_eq!(rec.get("output"), Some(&json!("")));
    }

    #[cfg(unix)]
    #[test]
    fn captures_stdout_and_exit_code() {
        let dir = tempfile::tempdir().expect("tempdir");
        let stage = ProcessStage::new(
            config("prep", "sh", &["-c", "echo {mode}-{n}; exit 3"], 5000),
            &params(),
            &[],
            dir.path().to_path_buf(),
        )
        .expect("stage");
        let rec = stage.execute(&tuple(), &JobStats::new()).expect("execute");
        assert_eq!(rec.get("output"), Some(&json!("fast-3\n")));
        assert_eq!(rec.get("timeout"), Some(&json!(false)));
        assert_eq!(rec.get("returncode"), Some(&json!(3)));
        assert!(stage.workdir(&tuple()).is_dir());
    }

    #[cfg(unix)]
    #[test]
    fn slow_command_is_killed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let stage = ProcessStage::new(
            config("prep", "sh", &["-c", "sleep 5"], 200),
            &params(),
            &[],
            dir.path().to_path_buf(),
        )
        .expect("stage");
        let started = Instant::now();
        let rec = stage.execute(&tuple(), &JobStats::new()).expect("execute");
        assert!(started.elapsed() < Duration::from_secs(4));
        assert_eq!(rec.get("timeout"), Some(&json!(true)));
        assert_eq!(rec.get("returncode"), Some(&Value::Null));
    }

    #[cfg(unix)]
    #[test]
    fn backgrounded_child_does_not_outlive_timeout() {
        let dir = tempfile::tempdir().expect("tempdir");
        let stage = ProcessStage::new(
            config("prep", "sh", &["-c", "sleep 5 & echo hi"], 1000),
            &params(),
            &[],
            dir.path().to_path_buf(),
        )
        .expect("stage");
        let started = Instant::now();
        let rec = stage.execute(&tuple(), &JobStats::new()).expect("execute");
        assert!(
            started.elapsed() < Duration::from_secs(3),
            "took {:?}",
            started.elapsed()
        );
        assert_eq!(rec.get("output"), Some(&json!("hi\n")));
        assert_eq!(rec.get("returncode"), Some(&json!(0)));
        assert_eq!(rec.get("timeout"), Some(&json!(false)));
    }

    #[cfg(unix)]
    #[test]
    fn stdout_held_outside_the_group_is_bounded_by_timeout() {
        // The grandchild moves to its own group, so only the read deadline
        // stops the wait.
        let perl_available = Command::new("perl")
            .arg("-e1")
            .status()
            .map(|s| s.success())
            .unwrap_or(false);
        if !perl_available {
            return;
        }
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "perl -e 'setpgrp(0,0); sleep 5' & sleep 0.2; echo hi"]);
        let started = Instant::now();
        let outcome = run_with_timeout(cmd, Duration::from_millis(300)).expect("run");
        assert!(
            started.elapsed() < Duration::from_secs(3),
            "took {:?}",
            started.elapsed()
        );
        assert!(outcome.timed_out);
    }

    #[cfg(unix)]
    #[test]
    fn persisted_output_lands_at_stage_path() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut cfg = config("prep", "sh", &["-c", "printf {n}"], 5000);
        cfg.persist_output = true;
        let stage = ProcessStage::new(cfg, &params(), &[], dir.path().to_path_buf())
            .expect("stage");
        stage.execute(&tuple(), &JobStats::new()).expect("execute");
        let written = fs::read(stage.output_path(&tuple())).expect("output file");
        assert_eq!(written, b"3");
    }
}
