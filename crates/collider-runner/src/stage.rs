use crate::error::{ColliderError, Result};
use crate::job::{JobStats, ResultRecord};
use crate::params::ParameterTuple;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

/// A named unit of work in the pipeline.
///
/// `execute` receives the tuple being processed and the records of every
/// earlier stage for that tuple. The returned record is all the scheduler
/// keeps; anything an implementation stores on itself is invisible to other
/// workers.
pub trait Stage: Send + Sync {
    fn name(&self) -> &str;

    fn execute(&self, value: &ParameterTuple, stats: &JobStats) -> anyhow::Result<ResultRecord>;
}

type StageFn = dyn Fn(&ParameterTuple, &JobStats) -> anyhow::Result<ResultRecord> + Send + Sync;

/// Stage backed by an in-process function.
pub struct CallbackStage {
    name: String,
    func: Box<StageFn>,
}

impl CallbackStage {
    pub fn new<F>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(&ParameterTuple, &JobStats) -> anyhow::Result<ResultRecord> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            func: Box::new(func),
        }
    }
}

impl Stage for CallbackStage {
    fn name(&self) -> &str {
        &self.name
    }

    fn execute(&self, value: &ParameterTuple, stats: &JobStats) -> anyhow::Result<ResultRecord> {
        (self.func)(value, stats)
    }
}

/// The fixed, linear sequence of stages every job traverses.
#[derive(Clone)]
pub struct StageOrder {
    stages: Vec<Arc<dyn Stage>>,
}

impl StageOrder {
    pub fn new(stages: Vec<Arc<dyn Stage>>) -> Result<Self> {
        if stages.is_empty() {
            return Err(ColliderError::config("pipeline needs at least one stage"));
        }
        let mut seen = BTreeSet::new();
        for stage in stages.iter() {
            if stage.name().trim().is_empty() {
                return Err(ColliderError::config("stage name cannot be empty"));
            }
            if !seen.insert(stage.name().to_string()) {
                return Err(ColliderError::config(format!(
                    "duplicate stage name: {}",
                    stage.name()
                )));
            }
        }
        Ok(Self { stages })
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn get(&self, position: usize) -> Option<&Arc<dyn Stage>> {
        self.stages.get(position)
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.stages.iter().position(|s| s.name() == name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    pub fn is_last(&self, position: usize) -> bool {
        position + 1 == self.stages.len()
    }
}

impl fmt::Debug for StageOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn noop(name: &str) -> Arc<dyn Stage> {
        Arc::new(CallbackStage::new(name, |_, _| Ok(ResultRecord::new())))
    }

    #[test]
    fn order_rejects_duplicates_and_empty() {
        assert!(StageOrder::new(vec![]).is_err());
        let err = StageOrder::new(vec![noop("a"), noop("a")]).expect_err("duplicate");
        assert!(err.to_string().contains("duplicate stage name"), "{}", err);
    }

    #[test]
    fn positions_follow_declaration() {
        let order = StageOrder::new(vec![noop("prep"), noop("run")]).expect("order");
        assert_eq!(order.position("run"), Some(1));
        assert_eq!(order.position("missing"), None);
        assert!(order.is_last(1));
        assert!(!order.is_last(0));
        assert_eq!(order.names(), vec!["prep", "run"]);
    }

    #[test]
    fn callback_sees_earlier_stats() {
        let stage = CallbackStage::new("double", |value, stats| {
            let base = stats
                .get("prep")
                .and_then(|r| r.get("x"))
                .and_then(|v| v.as_i64())
                .unwrap_or(0);
            let n = value.get(0).and_then(|v| v.as_i64()).unwrap_or(0);
            let mut out = ResultRecord::new();
            out.insert("y".to_string(), json!(base * n));
            Ok(out)
        });
        let mut stats = JobStats::new();
        let mut prep = ResultRecord::new();
        prep.insert("x".to_string(), json!(3));
        stats.record("prep", prep);
        let out = stage
            .execute(&ParameterTuple::new(vec![json!(2)]), &stats)
            .expect("execute");
        assert_eq!(out.get("y"), Some(&json!(6)));
    }
}
