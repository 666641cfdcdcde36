use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Outputs of a node's dependencies, keyed by node id. Skipped dependencies
/// map to `None`.
pub type DependencyOutputs = BTreeMap<String, Option<Value>>;

/// Predicate over dependency outputs deciding whether a ready node runs.
///
/// Paths are JSON pointers (`/metrics/accuracy`) into one dependency's
/// output; the empty path addresses the whole output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Condition {
    Always,
    Never,
    Exists {
        node: String,
        #[serde(default)]
        path: String,
    },
    Equals {
        node: String,
        #[serde(default)]
        path: String,
        value: Value,
    },
    NotEquals {
        node: String,
        #[serde(default)]
        path: String,
        value: Value,
    },
    Truthy {
        node: String,
        #[serde(default)]
        path: String,
    },
    All {
        conditions: Vec<Condition>,
    },
    Any {
        conditions: Vec<Condition>,
    },
    Not {
        condition: Box<Condition>,
    },
}

impl Condition {
    pub fn equals(node: impl Into<String>, path: impl Into<String>, value: Value) -> Self {
        Condition::Equals {
            node: node.into(),
            path: path.into(),
            value,
        }
    }

    pub fn truthy(node: impl Into<String>, path: impl Into<String>) -> Self {
        Condition::Truthy {
            node: node.into(),
            path: path.into(),
        }
    }

    pub fn evaluate(&self, outputs: &DependencyOutputs) -> bool {
        match self {
            Condition::Always => true,
            Condition::Never => false,
            Condition::Exists { node, path } => lookup(outputs, node, path).is_some(),
            Condition::Equals { node, path, value } => {
                lookup(outputs, node, path).is_some_and(|found| found == value)
            }
            Condition::NotEquals { node, path, value } => {
                lookup(outputs, node, path).map_or(true, |found| found != value)
            }
            Condition::Truthy { node, path } => lookup(outputs, node, path).is_some_and(is_truthy),
            Condition::All { conditions } => conditions.iter().all(|c| c.evaluate(outputs)),
            Condition::Any { conditions } => conditions.iter().any(|c| c.evaluate(outputs)),
            Condition::Not { condition } => !condition.evaluate(outputs),
        }
    }

    /// Node ids this predicate reads.
    pub fn referenced_nodes(&self) -> BTreeSet<&str> {
        let mut nodes = BTreeSet::new();
        self.collect_nodes(&mut nodes);
        nodes
    }

    fn collect_nodes<'a>(&'a self, nodes: &mut BTreeSet<&'a str>) {
        match self {
            Condition::Always | Condition::Never => {}
            Condition::Exists { node, .. }
            | Condition::Equals { node, .. }
            | Condition::NotEquals { node, .. }
            | Condition::Truthy { node, .. } => {
                nodes.insert(node.as_str());
            }
            Condition::All { conditions } | Condition::Any { conditions } => {
                for condition in conditions {
                    condition.collect_nodes(nodes);
                }
            }
            Condition::Not { condition } => condition.collect_nodes(nodes),
        }
    }
}

fn lookup<'a>(outputs: &'a DependencyOutputs, node: &str, path: &str) -> Option<&'a Value> {
    let output = outputs.get(node)?.as_ref()?;
    output.pointer(path)
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}
