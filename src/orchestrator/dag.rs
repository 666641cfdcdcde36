use std::collections::HashSet;

use petgraph::algo::toposort;
use petgraph::graphmap::DiGraphMap;

use crate::error::{OrchestratorError, Result};
use crate::scheduler::job::JobNode;
use crate::scheduler::queue::{MAX_PRIORITY, MIN_PRIORITY};

/// Check a submitted node list before any execution is created.
///
/// Structural problems (duplicates, dangling edges, bad priorities) are
/// reported as `InvalidDag`; a dependency cycle as `CyclicGraph`.
pub fn validate(nodes: &[JobNode]) -> Result<()> {
    if nodes.is_empty() {
        return Err(OrchestratorError::InvalidDag(
            "DAG must contain at least one node".to_string(),
        ));
    }

    let mut ids = HashSet::new();
    for node in nodes {
        if node.id.trim().is_empty() {
            return Err(OrchestratorError::InvalidDag("node id cannot be empty".to_string()));
        }
        if node.handler_name.trim().is_empty() {
            return Err(OrchestratorError::InvalidDag(format!(
                "node '{}' has no handler",
                node.id
            )));
        }
        if !ids.insert(node.id.as_str()) {
            return Err(OrchestratorError::InvalidDag(format!(
                "duplicate node id '{}'",
                node.id
            )));
        }
        if !(MIN_PRIORITY..=MAX_PRIORITY).contains(&node.priority) {
            return Err(OrchestratorError::InvalidPriority(node.priority));
        }
        if node.retry_policy.max_attempts == 0 {
            return Err(OrchestratorError::InvalidDag(format!(
                "node '{}' must allow at least one attempt",
                node.id
            )));
        }
    }

    for node in nodes {
        for dep in &node.depends_on {
            if dep == &node.id {
                return Err(OrchestratorError::InvalidDag(format!(
                    "node '{}' cannot depend on itself",
                    node.id
                )));
            }
            if !ids.contains(dep.as_str()) {
                return Err(OrchestratorError::InvalidDag(format!(
                    "node '{}' depends on unknown node '{}'",
                    node.id, dep
                )));
            }
        }
        if let Some(condition) = &node.condition {
            for referenced in condition.referenced_nodes() {
                if !node.depends_on.contains(referenced) {
                    return Err(OrchestratorError::InvalidDag(format!(
                        "condition of node '{}' reads '{}', which is not a dependency",
                        node.id, referenced
                    )));
                }
            }
        }
    }

    // Edge direction: dependency -> dependent
    let mut graph: DiGraphMap<&str, ()> = DiGraphMap::new();
    for node in nodes {
        graph.add_node(node.id.as_str());
    }
    for node in nodes {
        for dep in &node.depends_on {
            graph.add_edge(dep.as_str(), node.id.as_str(), ());
        }
    }

    match toposort(&graph, None) {
        Ok(_) => Ok(()),
        Err(cycle) => Err(OrchestratorError::CyclicGraph(cycle.node_id().to_string())),
    }
}
