use crate::params::ParameterTuple;
use crate::result_log::LogRow;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Field name -> value produced by one stage for one parameter tuple.
pub type ResultRecord = BTreeMap<String, Value>;

/// Per-job results keyed by stage name, kept in the order stages completed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobStats {
    entries: Vec<(String, ResultRecord)>,
}

impl JobStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a stage's record. A repeated stage name replaces the record in
    /// place instead of adding a second entry.
    pub fn record(&mut self, stage: &str, data: ResultRecord) {
        if let Some(slot) = self.entries.iter_mut().find(|(name, _)| name == stage) {
            slot.1 = data;
        } else {
            self.entries.push((stage.to_string(), data));
        }
    }

    pub fn get(&self, stage: &str) -> Option<&ResultRecord> {
        self.entries
            .iter()
            .find(|(name, _)| name == stage)
            .map(|(_, data)| data)
    }

    pub fn stage_names(&self) -> Vec<&str> {
        self.entries.iter().map(|(name, _)| name.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ResultRecord)> {
        self.entries.iter().map(|(name, data)| (name.as_str(), data))
    }
}

/// One parameter tuple's progress through the stage order.
#[derive(Debug, Clone)]
pub struct Job {
    pub index: usize,
    pub value: ParameterTuple,
    /// Position of the next stage to execute.
    pub stage: usize,
    pub stats: JobStats,
}

impl Job {
    pub fn new(index: usize, value: ParameterTuple) -> Self {
        Self {
            index,
            value,
            stage: 0,
            stats: JobStats::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    InFlight,
    Advancing,
    Terminal,
}

impl JobState {
    /// State a job enters once the stage at `position` has reported.
    pub fn after_stage(position: usize, stage_count: usize) -> Self {
        if position + 1 >= stage_count {
            JobState::Terminal
        } else {
            JobState::Advancing
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::InFlight => "in_flight",
            JobState::Advancing => "advancing",
            JobState::Terminal => "terminal",
        }
    }
}

/// Message from a stage worker to the result handler.
#[derive(Debug, Clone)]
pub struct StageResult {
    pub index: usize,
    pub position: usize,
    pub row: LogRow,
    pub stats: JobStats,
    /// False when the record came from the result log.
    pub executed: bool,
}

/// Final state of a job that left the terminal stage.
#[derive(Debug, Clone)]
pub struct CompletedJob {
    pub index: usize,
    pub value: ParameterTuple,
    pub stats: JobStats,
}
