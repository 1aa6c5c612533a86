use crate::error::{ColliderError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;

/// Candidate values per parameter name.
///
/// Names are kept in a `BTreeMap`, so every iteration (cross product, log
/// columns, cache keys) sees them in the same sorted order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParameterSpace {
    params: BTreeMap<String, Vec<Value>>,
}

impl ParameterSpace {
    pub fn new(params: BTreeMap<String, Vec<Value>>) -> Result<Self> {
        for (name, candidates) in params.iter() {
            if name.trim().is_empty() {
                return Err(ColliderError::config("parameter name cannot be empty"));
            }
            if name == "Stage" {
                return Err(ColliderError::config(
                    "parameter name 'Stage' is reserved for the result log",
                ));
            }
            if candidates.is_empty() {
                return Err(ColliderError::config(format!(
                    "parameter {} has no candidate values",
                    name
                )));
            }
            for v in candidates {
                if !is_scalar(v) {
                    return Err(ColliderError::config(format!(
                        "parameter {} has non-scalar candidate {}",
                        name, v
                    )));
                }
            }
        }
        Ok(Self { params })
    }

    pub fn names(&self) -> Vec<String> {
        self.params.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    pub fn combination_count(&self) -> usize {
        self.params.values().map(|c| c.len()).product()
    }

    /// Every combination, last name varying fastest.
    pub fn tuples(&self) -> Vec<ParameterTuple> {
        let columns: Vec<&Vec<Value>> = self.params.values().collect();
        let total = self.combination_count();
        let mut out = Vec::with_capacity(total);
        let mut cursor = vec![0usize; columns.len()];
        for _ in 0..total {
            let values = cursor
                .iter()
                .zip(columns.iter())
                .map(|(i, col)| col[*i].clone())
                .collect();
            out.push(ParameterTuple::new(values));
            for pos in (0..cursor.len()).rev() {
                cursor[pos] += 1;
                if cursor[pos] < columns[pos].len() {
                    break;
                }
                cursor[pos] = 0;
            }
        }
        out
    }
}

fn is_scalar(v: &Value) -> bool {
    matches!(
        v,
        Value::String(_) | Value::Number(_) | Value::Bool(_) | Value::Null
    )
}

/// One concrete combination of parameter values, ordered by sorted name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParameterTuple {
    values: Vec<Value>,
}

impl ParameterTuple {
    pub fn new(values: Vec<Value>) -> Self {
        Self { values }
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn get(&self, idx: usize) -> Option<&Value> {
        self.values.get(idx)
    }

    /// Human-readable form: each value rendered with `render_value` and
    /// joined by `_`. Not unique across tuples; use `digest` for identity.
    pub fn text(&self) -> String {
        self.values
            .iter()
            .map(render_value)
            .collect::<Vec<_>>()
            .join("_")
    }

    /// Hex sha256 of the typed JSON key; names the per-tuple working
    /// directory.
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.key().as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Exact-match key for the result log.
    pub(crate) fn key(&self) -> String {
        Value::Array(self.values.clone()).to_string()
    }
}

impl fmt::Display for ParameterTuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.key())
    }
}

/// Strings render bare, everything else as compact JSON.
pub fn render_value(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn space(pairs: &[(&str, Vec<Value>)]) -> ParameterSpace {
        let mut map = BTreeMap::new();
        for (k, v) in pairs {
            map.insert(k.to_string(), v.clone());
        }
        ParameterSpace::new(map).expect("valid space")
    }

    #[test]
    fn tuples_follow_sorted_names() {
        let s = space(&[
            ("n", vec![json!(1), json!(2)]),
            ("mode", vec![json!("a"), json!("b")]),
        ]);
        assert_eq!(s.names(), vec!["mode".to_string(), "n".to_string()]);
        let tuples = s.tuples();
        assert_eq!(tuples.len(), 4);
        assert_eq!(tuples[0].values(), &[json!("a"), json!(1)]);
        assert_eq!(tuples[1].values(), &[json!("a"), json!(2)]);
        assert_eq!(tuples[2].values(), &[json!("b"), json!(1)]);
        assert_eq!(tuples[3].values(), &[json!("b"), json!(2)]);
    }

    #[test]
    fn empty_space_yields_single_empty_tuple() {
        let s = ParameterSpace::new(BTreeMap::new()).expect("empty space");
        let tuples = s.tuples();
        assert_eq!(tuples.len(), 1);
        assert!(tuples[0].values().is_empty());
    }

    #[test]
    fn digest_separates_tuples_with_equal_text() {
        let a = ParameterTuple::new(vec![json!("a_b"), json!("c")]);
        let b = ParameterTuple::new(vec![json!("a"), json!("b_c")]);
        assert_eq!(a.text(), b.text());
        assert_ne!(a.digest(), b.digest());

        let c = ParameterTuple::new(vec![json!("1")]);
        let d = ParameterTuple::new(vec![json!(1)]);
        assert_eq!(c.text(), d.text());
        assert_ne!(c.digest(), d.digest());
    }

    #[test]
    fn empty_candidate_list_is_rejected() {
        let mut map = BTreeMap::new();
        map.insert("n".to_string(), vec![]);
        let err = ParameterSpace::new(map).expect_err("should fail");
        assert!(err.to_string().contains("no candidate values"), "{}", err);
    }

    #[test]
    fn nested_values_are_rejected() {
        let mut map = BTreeMap::new();
        map.insert("n".to_string(), vec![json!([1, 2])]);
        assert!(ParameterSpace::new(map).is_err());
    }

    #[test]
    fn digest_is_stable_and_distinguishes_tuples() {
        let a = ParameterTuple::new(vec![json!("a"), json!(1)]);
        let b = ParameterTuple::new(vec![json!("a"), json!(2)]);
        assert_eq!(a.text(), "a_1");
        assert_eq!(a.digest(), a.clone().digest());
        assert_eq!(a.digest().len(), 64);
        assert_ne!(a.digest(), b.digest());
    }
}
