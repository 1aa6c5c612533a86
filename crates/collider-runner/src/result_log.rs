//! Persisted cache of stage results.
//!
//! The log holds at most one row per (stage, parameter tuple). Rows keep
//! insertion order; replacing a key drops the old row and appends the new one
//! at the end. Two artifacts are written next to each other:
//!
//! - `{name}_results.json`: reload snapshot, read back on the next run
//! - `{name}_results.csv`: flat export with one column per parameter

use crate::error::{ColliderError, Result};
use crate::job::ResultRecord;
use crate::params::{render_value, ParameterTuple};
use crate::{atomic_write_bytes, ensure_dir};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};

/// Rows between unforced snapshot writes.
pub const SAVE_BATCH_SIZE: u64 = 1000;

const STAGE_COLUMN: &str = "Stage";
const SNAPSHOT_SCHEMA: &str = "collider_results_v1";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRow {
    pub stage: String,
    pub value: ParameterTuple,
    pub data: ResultRecord,
}

#[derive(Debug, Deserialize)]
struct Snapshot {
    schema_version: String,
    parameters: Vec<String>,
    rows: Vec<Map<String, Value>>,
}

pub struct ResultLog {
    snapshot_path: PathBuf,
    csv_path: PathBuf,
    parameters: Vec<String>,
    rows: BTreeMap<u64, LogRow>,
    index: HashMap<(String, String), u64>,
    next_seq: u64,
    processed: u64,
    saves: u64,
}

impl ResultLog {
    /// Open the log for `name` under `dir`, loading the snapshot if one exists.
    pub fn open(dir: &Path, name: &str, parameters: Vec<String>) -> Result<Self> {
        let mut log = Self {
            snapshot_path: snapshot_path(dir, name),
            csv_path: csv_path(dir, name),
            parameters,
            rows: BTreeMap::new(),
            index: HashMap::new(),
            next_seq: 0,
            processed: 0,
            saves: 0,
        };
        if log.snapshot_path.exists() {
            log.load_snapshot()?;
        }
        Ok(log)
    }

    fn load_snapshot(&mut self) -> Result<()> {
        let snapshot: Snapshot = serde_json::from_slice(&fs::read(&self.snapshot_path)?)?;
        if snapshot.schema_version != SNAPSHOT_SCHEMA {
            return Err(ColliderError::config(format!(
                "unsupported result snapshot schema {} in {}",
                snapshot.schema_version,
                self.snapshot_path.display()
            )));
        }
        if snapshot.parameters != self.parameters {
            return Err(ColliderError::config(format!(
                "result snapshot {} was written for parameters {:?}, experiment declares {:?}",
                self.snapshot_path.display(),
                snapshot.parameters,
                self.parameters
            )));
        }
        for mut flat in snapshot.rows {
            let stage = match flat.remove(STAGE_COLUMN) {
                Some(Value::String(s)) => s,
                _ => {
                    return Err(ColliderError::config(format!(
                        "result snapshot row without {} column",
                        STAGE_COLUMN
                    )))
                }
            };
            let mut values = Vec::with_capacity(self.parameters.len());
            for name in self.parameters.iter() {
                let v = flat.remove(name).ok_or_else(|| {
                    ColliderError::config(format!(
                        "result snapshot row for stage {} is missing parameter {}",
                        stage, name
                    ))
                })?;
                values.push(v);
            }
            self.insert_row(LogRow {
                stage,
                value: ParameterTuple::new(values),
                data: flat.into_iter().collect(),
            });
        }
        tracing::debug!(
            path = %self.snapshot_path.display(),
            rows = self.rows.len(),
            "loaded result snapshot"
        );
        Ok(())
    }

    pub fn parameters(&self) -> &[String] {
        &self.parameters
    }

    pub fn snapshot_path(&self) -> &Path {
        &self.snapshot_path
    }

    pub fn csv_path(&self) -> &Path {
        &self.csv_path
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Number of `save()` calls since the log was opened.
    pub fn save_count(&self) -> u64 {
        self.saves
    }

    pub fn rows(&self) -> impl Iterator<Item = &LogRow> {
        self.rows.values()
    }

    /// Replace the row for `(row.stage, row.value)` and persist on a forced
    /// save or every `SAVE_BATCH_SIZE` rows.
    pub fn put_result(&mut self, row: LogRow, force_save: bool) -> Result<()> {
        if let Some(clash) = row
            .data
            .keys()
            .find(|k| k.as_str() == STAGE_COLUMN || self.parameters.contains(*k))
        {
            return Err(ColliderError::config(format!(
                "stage {} produced field {} which collides with a log column",
                row.stage, clash
            )));
        }
        self.insert_row(row);
        self.processed += 1;
        if force_save || self.processed % SAVE_BATCH_SIZE == 0 {
            self.save()?;
        }
        Ok(())
    }

    fn insert_row(&mut self, row: LogRow) {
        let key = (row.stage.clone(), row.value.key());
        if let Some(old) = self.index.remove(&key) {
            self.rows.remove(&old);
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.rows.insert(seq, row);
        self.index.insert(key, seq);
    }

    pub fn get_stage_value_results(&self, stage: &str, value: &ParameterTuple) -> Option<&LogRow> {
        self.index
            .get(&(stage.to_string(), value.key()))
            .and_then(|seq| self.rows.get(seq))
    }

    pub fn has_result(&self, stage: &str, value: &ParameterTuple) -> bool {
        self.get_stage_value_results(stage, value).is_some()
    }

    pub fn get_data(&self, stage: &str, value: &ParameterTuple) -> Result<ResultRecord> {
        self.get_stage_value_results(stage, value)
            .map(|row| row.data.clone())
            .ok_or_else(|| ColliderError::NotFound {
                stage: stage.to_string(),
                value: value.to_string(),
            })
    }

    /// Row counts per stage name.
    pub fn stage_counts(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for row in self.rows.values() {
            *counts.entry(row.stage.clone()).or_insert(0) += 1;
        }
        counts
    }

    fn flat_row(&self, row: &LogRow) -> Map<String, Value> {
        let mut flat = Map::new();
        for (k, v) in row.data.iter() {
            flat.insert(k.clone(), v.clone());
        }
        flat.insert(STAGE_COLUMN.to_string(), Value::String(row.stage.clone()));
        for (name, v) in self.parameters.iter().zip(row.value.values()) {
            flat.insert(name.clone(), v.clone());
        }
        flat
    }

    pub fn save(&mut self) -> Result<()> {
        let rows: Vec<Value> = self
            .rows
            .values()
            .map(|row| Value::Object(self.flat_row(row)))
            .collect();
        let payload = json!({
            "schema_version": SNAPSHOT_SCHEMA,
            "saved_at": Utc::now().to_rfc3339(),
            "parameters": self.parameters,
            "rows": rows,
        });
        if let Some(parent) = self.snapshot_path.parent() {
            ensure_dir(parent)?;
        }
        atomic_write_bytes(&self.snapshot_path, &serde_json::to_vec(&payload)?)?;
        self.saves += 1;
        tracing::debug!(
            path = %self.snapshot_path.display(),
            rows = self.rows.len(),
            "saved result snapshot"
        );
        Ok(())
    }

    /// Header is `Stage`, the parameters, then every record field in sorted
    /// order. Missing fields are left empty.
    pub fn to_csv(&self) -> String {
        let fields: BTreeSet<&String> = self.rows.values().flat_map(|r| r.data.keys()).collect();
        let mut header: Vec<String> = vec![STAGE_COLUMN.to_string()];
        header.extend(self.parameters.iter().cloned());
        header.extend(fields.iter().map(|f| f.to_string()));

        let mut out = String::new();
        out.push_str(&csv_line(header.iter().map(|h| h.as_str())));
        for row in self.rows.values() {
            let mut cells: Vec<String> = Vec::with_capacity(header.len());
            cells.push(row.stage.clone());
            cells.extend(row.value.values().iter().map(csv_value));
            for field in fields.iter() {
                cells.push(row.data.get(*field).map(csv_value).unwrap_or_default());
            }
            out.push_str(&csv_line(cells.iter().map(|c| c.as_str())));
        }
        out
    }

    pub fn save_csv(&self) -> Result<()> {
        if let Some(parent) = self.csv_path.parent() {
            ensure_dir(parent)?;
        }
        atomic_write_bytes(&self.csv_path, self.to_csv().as_bytes())?;
        Ok(())
    }
}

pub fn snapshot_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!("{}_results.json", name))
}

pub fn csv_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!("{}_results.csv", name))
}

fn csv_value(v: &Value) -> String {
    match v {
        Value::Null => String::new(),
        other => render_value(other),
    }
}

fn csv_line<'a>(cells: impl Iterator<Item = &'a str>) -> String {
    let mut line = cells.map(csv_quote).collect::<Vec<_>>().join(",");
    line.push('\n');
    line
}

fn csv_quote(s: &str) -> String {
    if s.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", s.replace('"', "\"\""))
    } else {
        s.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(pairs: &[(&str, Value)]) -> ResultRecord {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    fn row(stage: &str, values: Vec<Value>, data: ResultRecord) -> LogRow {
        LogRow {
            stage: stage.to_string(),
            value: ParameterTuple::new(values),
            data,
        }
    }

    fn params() -> Vec<String> {
        vec!["mode".to_string(), "n".to_string()]
    }

    #[test]
    fn put_result_keeps_one_row_per_key() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut log = ResultLog::open(dir.path(), "exp", params()).expect("open");
        for i in 0..5 {
            log.put_result(
                row("prep", vec![json!("a"), json!(1)], record(&[("x", json!(i))])),
                false,
            )
            .expect("put");
            log.put_result(
                row("prep", vec![json!("a"), json!(2)], record(&[("x", json!(i))])),
                false,
            )
            .expect("put");
        }
        assert_eq!(log.len(), 2);
        let v = ParameterTuple::new(vec![json!("a"), json!(1)]);
        assert_eq!(
            log.get_data("prep", &v).expect("data").get("x"),
            Some(&json!(4))
        );
        assert!(!log.has_result("run", &v));
    }

    #[test]
    fn replaced_row_moves_to_the_end() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut log = ResultLog::open(dir.path(), "exp", params()).expect("open");
        log.put_result(row("a", vec![json!("m"), json!(1)], record(&[])), false)
            .expect("put");
        log.put_result(row("b", vec![json!("m"), json!(1)], record(&[])), false)
            .expect("put");
        log.put_result(row("a", vec![json!("m"), json!(1)], record(&[])), false)
            .expect("put");
        let stages: Vec<&str> = log.rows().map(|r| r.stage.as_str()).collect();
        assert_eq!(stages, vec!["b", "a"]);
    }

    #[test]
    fn get_data_reports_not_found() {
        let dir = tempfile::tempdir().expect("tempdir");
        let log = ResultLog::open(dir.path(), "exp", params()).expect("open");
        let err = log
            .get_data("prep", &ParameterTuple::new(vec![json!("a"), json!(1)]))
            .expect_err("empty log");
        assert!(matches!(err, ColliderError::NotFound { .. }), "{}", err);
    }

    #[test]
    fn forced_save_writes_snapshot() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut log = ResultLog::open(dir.path(), "exp", params()).expect("open");
        log.put_result(row("prep", vec![json!("a"), json!(1)], record(&[])), false)
            .expect("put");
        assert_eq!(log.save_count(), 0);
        assert!(!log.snapshot_path().exists());
        log.put_result(row("prep", vec![json!("a"), json!(2)], record(&[])), true)
            .expect("put");
        assert_eq!(log.save_count(), 1);
        assert!(log.snapshot_path().exists());
    }

    #[test]
    fn batch_threshold_triggers_save() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut log = ResultLog::open(dir.path(), "exp", vec!["n".to_string()]).expect("open");
        for i in 0..SAVE_BATCH_SIZE {
            log.put_result(row("prep", vec![json!(i)], record(&[])), false)
                .expect("put");
        }
        assert_eq!(log.save_count(), 1);
    }

    #[test]
    fn snapshot_round_trips_through_open() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut log = ResultLog::open(dir.path(), "exp", params()).expect("open");
        log.put_result(
            row(
                "prep",
                vec![json!("a"), json!(1)],
                record(&[("output", json!("hi")), ("timeout", json!(false))]),
            ),
            false,
        )
        .expect("put");
        log.save().expect("save");

        let reloaded = ResultLog::open(dir.path(), "exp", params()).expect("reopen");
        assert_eq!(reloaded.len(), 1);
        let data = reloaded
            .get_data("prep", &ParameterTuple::new(vec![json!("a"), json!(1)]))
            .expect("data");
        assert_eq!(data.get("output"), Some(&json!("hi")));
        assert_eq!(data.len(), 2);
    }

    #[test]
    fn snapshot_with_other_parameters_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut log = ResultLog::open(dir.path(), "exp", params()).expect("open");
        log.save().expect("save");
        let err = ResultLog::open(dir.path(), "exp", vec!["n".to_string()])
            .err()
            .expect("mismatch");
        assert!(err.to_string().contains("written for parameters"), "{}", err);
    }

    #[test]
    fn colliding_field_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut log = ResultLog::open(dir.path(), "exp", params()).expect("open");
        let err = log
            .put_result(
                row("prep", vec![json!("a"), json!(1)], record(&[("n", json!(3))])),
                false,
            )
            .expect_err("collision");
        assert!(err.to_string().contains("collides"), "{}", err);
        assert!(log.is_empty());
    }

    #[test]
    fn csv_export_has_union_of_columns() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut log = ResultLog::open(dir.path(), "exp", params()).expect("open");
        log.put_result(
            row(
                "prep",
                vec![json!("a"), json!(1)],
                record(&[("output", json!("x,y"))]),
            ),
            false,
        )
        .expect("put");
        log.put_result(
            row("run", vec![json!("a"), json!(1)], record(&[("score", json!(0.5))])),
            false,
        )
        .expect("put");
        let csv = log.to_csv();
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines[0], "Stage,mode,n,output,score");
        assert_eq!(lines[1], "prep,a,1,\"x,y\",");
        assert_eq!(lines[2], "run,a,1,,0.5");
        log.save_csv().expect("csv");
        assert_eq!(fs::read_to_string(log.csv_path()).expect("read"), csv);
    }
}
