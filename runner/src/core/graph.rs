//! Static workflow graph: named steps and the edges between them.
//!
//! The graph is immutable, process-wide data. Each run owns its own
//! [`WorkflowState`](crate::core::state::WorkflowState); nothing in here is
//! mutated while runs execute.

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Named unit of work in the workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepName {
    Init,
    Plan,
    Generate,
    Validate,
}

impl StepName {
    pub const ALL: [StepName; 4] = [
        StepName::Init,
        StepName::Plan,
        StepName::Generate,
        StepName::Validate,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            StepName::Init => "init",
            StepName::Plan => "plan",
            StepName::Generate => "generate",
            StepName::Validate => "validate",
        }
    }
}

impl fmt::Display for StepName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outgoing edge of a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Edge {
    /// Unconditional transition.
    To(StepName),
    /// Evaluate the router to pick the next node.
    Route,
}

/// Step table plus edge table, interpreted by the engine's executor loop.
#[derive(Debug, Clone, Copy)]
pub struct WorkflowGraph {
    entry: StepName,
    edges: &'static [(StepName, Edge)],
}

/// The plan/generate/validate workflow.
pub static WORKFLOW: WorkflowGraph = WorkflowGraph {
    entry: StepName::Init,
    edges: &[
        (StepName::Init, Edge::To(StepName::Plan)),
        (StepName::Plan, Edge::To(StepName::Generate)),
        (StepName::Generate, Edge::To(StepName::Validate)),
        (StepName::Validate, Edge::Route),
    ],
};

impl WorkflowGraph {
    pub fn entry(&self) -> StepName {
        self.entry
    }

    /// Outgoing edge for `step`, or `None` if the table has no entry for it.
    pub fn edge(&self, step: StepName) -> Option<Edge> {
        self.edges
            .iter()
            .find(|(from, _)| *from == step)
            .map(|(_, edge)| *edge)
    }

    /// Structural checks: one edge per step, every step reachable from the entry.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        let mut seen = HashSet::new();
        for (from, _) in self.edges {
            if !seen.insert(*from) {
                errors.push(format!("step '{from}' has more than one outgoing edge"));
            }
        }
        for step in StepName::ALL {
            if !seen.contains(&step) {
                errors.push(format!("step '{step}' has no outgoing edge"));
            }
        }

        let mut reachable = HashSet::new();
        let mut cursor = Some(self.entry);
        while let Some(step) = cursor {
            if !reachable.insert(step) {
                break;
            }
            cursor = match self.edge(step) {
                Some(Edge::To(next)) => Some(next),
                // The router only ever loops back to generate.
                Some(Edge::Route) => Some(StepName::Generate),
                None => None,
            };
        }
        for step in StepName::ALL {
            if !reachable.contains(&step) {
                errors.push(format!("step '{step}' is unreachable from '{}'", self.entry));
            }
        }
        errors
    }
}
