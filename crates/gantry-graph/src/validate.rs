use serde::{Deserialize, Serialize};

use crate::node::NodeKind;
use crate::workflow::Workflow;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Error,
    Warning,
}

/// One static-analysis finding. `node_id` is None for workflow-level
/// findings such as a missing Start node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    pub node_id: Option<String>,
    pub message: String,
    pub severity: Severity,
}

impl Finding {
    fn error(node_id: Option<&str>, message: impl Into<String>) -> Self {
        Self {
            node_id: node_id.map(String::from),
            message: message.into(),
            severity: Severity::Error,
        }
    }

    fn warning(node_id: Option<&str>, message: impl Into<String>) -> Self {
        Self {
            node_id: node_id.map(String::from),
            message: message.into(),
            severity: Severity::Warning,
        }
    }
}

/// Static analysis over a workflow definition. Never executes anything;
/// all checks run independently and every finding is reported.
pub fn validate(workflow: &Workflow) -> Vec<Finding> {
    let mut findings = Vec::new();

    if !workflow.nodes.iter().any(|n| n.is_start()) {
        findings.push(Finding::error(None, "workflow has no start node"));
    }

    for node in &workflow.nodes {
        match &node.kind {
            NodeKind::Action { task, .. } => {
                if task.is_empty() {
                    findings.push(Finding::error(
                        Some(&node.id),
                        "action node has no script or command",
                    ));
                }
            }
            NodeKind::Decision {
                condition,
                true_path,
                false_path,
            } => {
                if condition.trim().is_empty() {
                    findings.push(Finding::error(
                        Some(&node.id),
                        "decision node has an empty condition",
                    ));
                }
                if true_path.is_none() && false_path.is_none() {
                    findings.push(Finding::warning(
                        Some(&node.id),
                        "decision node has neither branch target set",
                    ));
                }
            }
            NodeKind::Loop(cfg) => {
                if let crate::node::LoopBody::Task(task) = &cfg.body {
                    if task.is_empty() {
                        findings.push(Finding::error(
                            Some(&node.id),
                            "loop node has an empty task body",
                        ));
                    }
                }
                if cfg.iteration_spec().trim().is_empty() {
                    findings.push(Finding::error(
                        Some(&node.id),
                        "loop node has an empty iteration spec",
                    ));
                }
            }
            _ => {}
        }

        if !node.is_start() && workflow.incoming(&node.id) == 0 {
            findings.push(Finding::warning(
                Some(&node.id),
                "node has no incoming edge and is unreachable",
            ));
        }

        // Decision branch fields, not edges, are authoritative, so decisions
        // are exempt from the dead-end check.
        if !node.is_end() && !node.is_decision() && workflow.outgoing(&node.id) == 0 {
            findings.push(Finding::warning(
                Some(&node.id),
                "node has no outgoing edge and is a dead end",
            ));
        }
    }

    findings
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{LoopBody, LoopConfig, LoopMode, Node, TaskBody};

    fn errors(findings: &[Finding]) -> Vec<&Finding> {
        findings
            .iter()
            .filter(|f| f.severity == Severity::Error)
            .collect()
    }

    fn clean_workflow() -> Workflow {
        let mut wf = Workflow::new("clean");
        wf.add_node(Node::new("start", "Start", NodeKind::Start));
        wf.add_node(Node::new("act", "Run", NodeKind::Action {
            task: TaskBody::command("echo hi"),
            output_var: None,
        }));
        wf.add_node(Node::new("end", "End", NodeKind::End));
        wf.add_edge("start", "act");
        wf.add_edge("act", "end");
        wf
    }

    #[test]
    fn test_clean_workflow_has_no_findings() {
        assert!(validate(&clean_workflow()).is_empty());
    }

    #[test]
    fn test_missing_start_node() {
        let mut wf = Workflow::new("no-start");
        wf.add_node(Node::new("end", "End", NodeKind::End));

        let findings = validate(&wf);
        assert!(findings
            .iter()
            .any(|f| f.severity == Severity::Error && f.node_id.is_none()));
    }

    #[test]
    fn test_empty_action_body() {
        let mut wf = clean_workflow();
        wf.add_node(Node::new("bad", "Empty", NodeKind::Action {
            task: TaskBody::default(),
            output_var: None,
        }));
        wf.add_edge("act", "bad");
        wf.add_edge("bad", "end");

        let findings = validate(&wf);
        assert_eq!(errors(&findings).len(), 1);
        assert_eq!(errors(&findings)[0].node_id.as_deref(), Some("bad"));
    }

    #[test]
    fn test_decision_findings() {
        let mut wf = clean_workflow();
        wf.add_node(Node::new("dec", "Branch", NodeKind::Decision {
            condition: "  ".into(),
            true_path: None,
            false_path: None,
        }));
        wf.add_edge("act", "dec");

        let findings = validate(&wf);
        let dec: Vec<_> = findings
            .iter()
            .filter(|f| f.node_id.as_deref() == Some("dec"))
            .collect();
        // Empty condition is an error, missing branches a warning; no
        // dead-end warning because decisions are exempt.
        assert_eq!(dec.len(), 2);
        assert!(dec.iter().any(|f| f.severity == Severity::Error));
        assert!(dec.iter().any(|f| f.severity == Severity::Warning));
    }

    #[test]
    fn test_loop_findings() {
        let mut wf = clean_workflow();
        wf.add_node(Node::new(
            "lp",
            "Repeat",
            NodeKind::Loop(LoopConfig {
                mode: LoopMode::Count,
                count: String::new(),
                list_var: String::new(),
                condition: String::new(),
                item_var: "_loop_item".into(),
                error_delay_secs: None,
                body: LoopBody::Task(TaskBody::default()),
            }),
        ));
        wf.add_edge("act", "lp");
        wf.add_edge("lp", "end");

        let findings = validate(&wf);
        let lp_errors: Vec<_> = errors(&findings)
            .into_iter()
            .filter(|f| f.node_id.as_deref() == Some("lp"))
            .collect();
        // Empty body and empty iteration spec are independent errors
        assert_eq!(lp_errors.len(), 2);
    }

    #[test]
    fn test_unreachable_and_dead_end_warnings() {
        let mut wf = clean_workflow();
        wf.add_node(Node::new("orphan", "Orphan", NodeKind::Delay { seconds: 1 }));

        let findings = validate(&wf);
        let orphan: Vec<_> = findings
            .iter()
            .filter(|f| f.node_id.as_deref() == Some("orphan"))
            .collect();
        assert_eq!(orphan.len(), 2);
        assert!(orphan.iter().all(|f| f.severity == Severity::Warning));
    }
}
