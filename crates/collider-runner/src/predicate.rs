use crate::error::{ColliderError, Result};
use crate::params::ParameterTuple;
use crate::result_log::ResultLog;
use crate::stage::StageOrder;
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// Rerun policy as configured, naming stages by string.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum RerunPolicy {
    Always,
    #[default]
    IfNeeded,
    FromStage { stage: String },
    Only { stages: Vec<String> },
    OnlyForce { stages: Vec<String> },
}

impl RerunPolicy {
    /// Builds a policy from a mode keyword and its stage list.
    pub fn from_parts(mode: &str, stages: &[String]) -> Result<Self> {
        let kind: RerunMode = mode.parse()?;
        let policy = match kind {
            RerunMode::Always => RerunPolicy::Always,
            RerunMode::IfNeeded => RerunPolicy::IfNeeded,
            RerunMode::FromStage => match stages {
                [stage] => RerunPolicy::FromStage {
                    stage: stage.clone(),
                },
                _ => {
                    return Err(ColliderError::config(
                        "rerun mode from_stage takes exactly one stage",
                    ))
                }
            },
            RerunMode::Only => RerunPolicy::Only {
                stages: stages.to_vec(),
            },
            RerunMode::OnlyForce => RerunPolicy::OnlyForce {
                stages: stages.to_vec(),
            },
        };
        Ok(policy)
    }

    /// Resolves stage names against `order`; unknown names fail.
    pub fn resolve(&self, order: &StageOrder) -> Result<RerunPredicate> {
        let lookup = |name: &str| {
            order.position(name).ok_or_else(|| {
                ColliderError::config(format!("rerun policy names unknown stage: {}", name))
            })
        };
        let set = |names: &[String]| -> Result<BTreeSet<String>> {
            if names.is_empty() {
                return Err(ColliderError::config("rerun policy needs at least one stage"));
            }
            for name in names {
                lookup(name.as_str())?;
            }
            Ok(names.iter().cloned().collect())
        };
        Ok(match self {
            RerunPolicy::Always => RerunPredicate::Always,
            RerunPolicy::IfNeeded => RerunPredicate::IfNeeded,
            RerunPolicy::FromStage { stage } => RerunPredicate::FromStage {
                anchor: lookup(stage.as_str())?,
            },
            RerunPolicy::Only { stages } => RerunPredicate::Only { stages: set(stages)? },
            RerunPolicy::OnlyForce { stages } => RerunPredicate::OnlyForce { stages: set(stages)? },
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RerunMode {
    Always,
    IfNeeded,
    FromStage,
    Only,
    OnlyForce,
}

impl FromStr for RerunMode {
    type Err = ColliderError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "always" => Ok(RerunMode::Always),
            "if_needed" => Ok(RerunMode::IfNeeded),
            "from_stage" => Ok(RerunMode::FromStage),
            "only" => Ok(RerunMode::Only),
            "only_force" => Ok(RerunMode::OnlyForce),
            other => Err(ColliderError::config(format!(
                "unknown rerun mode: {} (expected always, if_needed, from_stage, only, only_force)",
                other
            ))),
        }
    }
}

/// Decides per (stage, tuple) whether to execute or reuse the cached row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RerunPredicate {
    Always,
    IfNeeded,
    /// Stages at or after `anchor` always run; earlier ones reuse the cache.
    FromStage { anchor: usize },
    Only { stages: BTreeSet<String> },
    /// Members always run; everything else must come from the cache.
    OnlyForce { stages: BTreeSet<String> },
}

impl RerunPredicate {
    pub fn rerun(
        &self,
        stage: &str,
        position: usize,
        value: &ParameterTuple,
        log: &ResultLog,
    ) -> bool {
        let needed = || !log.has_result(stage, value);
        match self {
            RerunPredicate::Always => true,
            RerunPredicate::IfNeeded => needed(),
            RerunPredicate::FromStage { anchor } => position >= *anchor || needed(),
            RerunPredicate::Only { stages } => stages.contains(stage) || needed(),
            RerunPredicate::OnlyForce { stages } => stages.contains(stage),
        }
    }

    /// Checks that every pair this predicate will serve from the cache is
    /// actually in the log. Only `OnlyForce` can skip a pair without looking.
    pub fn validate(
        &self,
        order: &StageOrder,
        tuples: &[ParameterTuple],
        log: &ResultLog,
    ) -> Result<()> {
        let RerunPredicate::OnlyForce { stages } = self else {
            return Ok(());
        };
        for name in order.names() {
            if stages.contains(name) {
                continue;
            }
            if let Some(missing) = tuples.iter().find(|v| !log.has_result(name, v)) {
                return Err(ColliderError::config(format!(
                    "only_force skips stage {} but the result log has no row for {}",
                    name, missing
                )));
            }
        }
        Ok(())
    }
}

impl fmt::Display for RerunPredicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RerunPredicate::Always => write!(f, "always"),
            RerunPredicate::IfNeeded => write!(f, "if_needed"),
            RerunPredicate::FromStage { anchor } => write!(f, "from_stage(#{})", anchor),
            RerunPredicate::Only { stages } => write!(f, "only({:?})", stages),
            RerunPredicate::OnlyForce { stages } => write!(f, "only_force({:?})", stages),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::ResultRecord;
    use crate::result_log::LogRow;
    use crate::stage::{CallbackStage, Stage};
    use serde_json::json;
    use std::sync::Arc;

    fn order() -> StageOrder {
        let stages: Vec<Arc<dyn Stage>> = ["prep", "run", "score"]
            .iter()
            .map(|n| {
                Arc::new(CallbackStage::new(*n, |_, _| Ok(ResultRecord::new()))) as Arc<dyn Stage>
            })
            .collect();
        StageOrder::new(stages).expect("order")
    }

    fn v(n: i64) -> ParameterTuple {
        ParameterTuple::new(vec![json!(n)])
    }

    fn log_with(dir: &std::path::Path, rows: &[(&str, i64)]) -> ResultLog {
        let mut log = ResultLog::open(dir, "exp", vec!["n".to_string()]).expect("open");
        for (stage, n) in rows {
            log.put_result(
                LogRow {
                    stage: stage.to_string(),
                    value: v(*n),
                    data: ResultRecord::new(),
                },
                false,
            )
            .expect("put");
        }
        log
    }

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn always_and_if_needed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let log = log_with(dir.path(), &[("prep", 1)]);
        assert!(RerunPredicate::Always.rerun("prep", 0, &v(1), &log));
        assert!(!RerunPredicate::IfNeeded.rerun("prep", 0, &v(1), &log));
        assert!(RerunPredicate::IfNeeded.rerun("prep", 0, &v(2), &log));
        assert!(RerunPredicate::IfNeeded.rerun("run", 1, &v(1), &log));
    }

    #[test]
    fn from_stage_forces_anchor_and_later() {
        let dir = tempfile::tempdir().expect("tempdir");
        let log = log_with(dir.path(), &[("prep", 1), ("run", 1), ("score", 1)]);
        let p = RerunPolicy::FromStage {
            stage: "run".to_string(),
        }
        .resolve(&order())
        .expect("resolve");
        assert!(!p.rerun("prep", 0, &v(1), &log));
        assert!(p.rerun("run", 1, &v(1), &log));
        assert!(p.rerun("score", 2, &v(1), &log));
        assert!(p.rerun("prep", 0, &v(2), &log));
    }

    #[test]
    fn only_falls_back_to_cache_check() {
        let dir = tempfile::tempdir().expect("tempdir");
        let log = log_with(dir.path(), &[("prep", 1), ("run", 1)]);
        let p = RerunPolicy::Only {
            stages: names(&["run"]),
        }
        .resolve(&order())
        .expect("resolve");
        assert!(!p.rerun("prep", 0, &v(1), &log));
        assert!(p.rerun("run", 1, &v(1), &log));
        assert!(p.rerun("score", 2, &v(1), &log));
    }

    #[test]
    fn only_force_ignores_the_cache() {
        let dir = tempfile::tempdir().expect("tempdir");
        let log = log_with(dir.path(), &[]);
        let p = RerunPolicy::OnlyForce {
            stages: names(&["run"]),
        }
        .resolve(&order())
        .expect("resolve");
        assert!(!p.rerun("prep", 0, &v(1), &log));
        assert!(p.rerun("run", 1, &v(1), &log));
        assert!(!p.rerun("score", 2, &v(1), &log));
    }

    #[test]
    fn only_force_validation_reports_missing_rows() {
        let dir = tempfile::tempdir().expect("tempdir");
        let log = log_with(dir.path(), &[("prep", 1), ("score", 1), ("prep", 2)]);
        let p = RerunPolicy::OnlyForce {
            stages: names(&["run"]),
        }
        .resolve(&order())
        .expect("resolve");
        p.validate(&order(), &[v(1)], &log).expect("complete for n=1");
        let err = p
            .validate(&order(), &[v(1), v(2)], &log)
            .expect_err("score missing for n=2");
        assert!(err.to_string().contains("stage score"), "{}", err);
        RerunPredicate::Always
            .validate(&order(), &[v(3)], &log)
            .expect("always never validates against the log");
    }

    #[test]
    fn unknown_stage_or_mode_fails() {
        assert!(RerunPolicy::FromStage {
            stage: "nope".to_string()
        }
        .resolve(&order())
        .is_err());
        assert!(RerunPolicy::Only { stages: vec![] }.resolve(&order()).is_err());
        assert!(RerunPolicy::from_parts("sometimes", &[]).is_err());
        assert!(RerunPolicy::from_parts("from_stage", &names(&["a", "b"])).is_err());
        assert_eq!(
            RerunPolicy::from_parts("only", &names(&["run"])).expect("only"),
            RerunPolicy::Only {
                stages: names(&["run"])
            }
        );
    }
}
