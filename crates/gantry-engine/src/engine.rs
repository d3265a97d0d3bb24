use std::path::{Path, PathBuf};
use std::time::Duration;

use futures::future::BoxFuture;
use serde::Serialize;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use gantry_core::error::{GantryError, Result};
use gantry_core::{Context, EngineConfig};
use gantry_graph::{
    DatabaseConfig, FailurePolicy, LoopBody, LoopConfig, LoopMode, Node, NodeKind, TaskBody,
    Workflow,
};

use crate::database;
use crate::expr;
use crate::run_log::{LogEntry, RunLog};
use crate::task;

/// Hard cap on while-mode loop passes.
const WHILE_LOOP_CAP: usize = 1000;

/// Timeout applied to each loop-body script pass.
const LOOP_TASK_TIMEOUT_SECS: u64 = 120;

/// Context key holding the zero-based index of the current loop pass.
const LOOP_INDEX_VAR: &str = "_loop_index";

/// Final state of one workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Reached a terminal point with no failures.
    Success,
    /// Reached a terminal point, but at least one continue-policy node
    /// failed along the way.
    Partial,
    /// Aborted by a stop-policy failure.
    Error,
    /// Ended by a cooperative stop request.
    Stopped,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Success => "success",
            Self::Partial => "partial",
            Self::Error => "error",
            Self::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// What `Engine::execute` hands back: final status, the run's context,
/// the full ordered log (bridged sub-workflow lines included), and the
/// escalated error message if the run aborted.
#[derive(Debug)]
pub struct RunResult {
    pub status: RunStatus,
    pub context: Context,
    pub logs: Vec<LogEntry>,
    pub error: Option<String>,
}

/// Cooperative stop flag, settable from outside the executing call stack.
///
/// Honored only at node-boundary checks: in-flight work is never
/// interrupted, the next boundary check converts the request into a
/// `Stopped` result.
#[derive(Debug, Clone, Default)]
pub struct StopHandle {
    token: CancellationToken,
}

impl StopHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.token.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// The workflow execution engine.
///
/// Single-threaded and synchronous in structure: one node handler runs to
/// completion before the next dispatch, with no parallelism between
/// sibling nodes. The engine owns a private context seeded from the
/// workflow's variables and never mutates the definition itself.
pub struct Engine {
    workflow: Workflow,
    config: EngineConfig,
    log: RunLog,
    stop: StopHandle,
    context: Context,
    had_failures: bool,
}

impl Engine {
    /// Engine for a top-level run, with a file-backed run log.
    pub fn new(workflow: Workflow, config: EngineConfig) -> Self {
        let log = RunLog::create(&config.logs_dir, &workflow.name);
        Self::with_log(workflow, config, log)
    }

    /// Engine logging into an existing record (nested runs, tests).
    pub fn with_log(workflow: Workflow, config: EngineConfig, log: RunLog) -> Self {
        let context = Context::from_map(workflow.variables.clone());
        Self {
            workflow,
            config,
            log,
            stop: StopHandle::new(),
            context,
            had_failures: false,
        }
    }

    pub fn with_stop(mut self, stop: StopHandle) -> Self {
        self.stop = stop;
        self
    }

    /// Handle for requesting a cooperative stop from outside the run.
    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    pub fn log(&self) -> &RunLog {
        &self.log
    }

    /// Merge extra seed variables into the run context before execution.
    pub fn seed(&mut self, context: &Context) {
        self.context.merge(context);
    }

    /// Drive the workflow to completion.
    ///
    /// Never panics and never returns an Err: every escalated failure is
    /// caught here, logged, and surfaced as status `Error`.
    pub async fn execute(mut self) -> RunResult {
        self.log
            .info(format!("Workflow '{}' started", self.workflow.name));

        let outcome = self.run().await;

        match outcome {
            Ok(status) => {
                self.log
                    .info(format!("Workflow '{}' finished: {}", self.workflow.name, status));
                RunResult {
                    status,
                    context: self.context,
                    logs: self.log.entries(),
                    error: None,
                }
            }
            Err(e) => {
                self.log
                    .error(format!("Workflow '{}' failed: {}", self.workflow.name, e));
                RunResult {
                    status: RunStatus::Error,
                    context: self.context,
                    logs: self.log.entries(),
                    error: Some(e.to_string()),
                }
            }
        }
    }

    /// The control loop. Boxed so nested workflow invocation can recurse.
    fn run(&mut self) -> BoxFuture<'_, Result<RunStatus>> {
        Box::pin(async move {
            let Some(start) = self.workflow.start_node() else {
                self.log.warning("Workflow has no nodes, nothing to run");
                return Ok(RunStatus::Success);
            };
            let mut current_id = start.id.clone();

            loop {
                if self.stop.is_stopped() {
                    self.log.warning("Stop requested, ending run");
                    return Ok(RunStatus::Stopped);
                }

                let node = match self.workflow.node(&current_id) {
                    Some(n) => n.clone(),
                    None => {
                        // Dangling edges are tolerated, never fatal
                        self.log.warning(format!(
                            "Next node '{}' not found, ending workflow",
                            current_id
                        ));
                        return Ok(self.final_status());
                    }
                };

                let next = match self.dispatch(&node).await {
                    Ok(next) => next,
                    Err(e) => {
                        self.log.error(format!(
                            "Node '{}' ({}) failed: {}",
                            node.id,
                            node.kind.name(),
                            e
                        ));
                        match node.on_failure {
                            FailurePolicy::Stop => return Err(e),
                            FailurePolicy::Continue => {
                                self.had_failures = true;
                                self.log.info(format!(
                                    "Node '{}' policy is continue, proceeding",
                                    node.id
                                ));
                                self.follower(&node.id)
                            }
                        }
                    }
                };

                match next {
                    Some(id) => current_id = id,
                    None => {
                        self.log.info("End of workflow reached");
                        return Ok(self.final_status());
                    }
                }
            }
        })
    }

    fn final_status(&self) -> RunStatus {
        if self.had_failures {
            RunStatus::Partial
        } else {
            RunStatus::Success
        }
    }

    /// The ordinary follower: target of the node's first outgoing edge.
    fn follower(&self, node_id: &str) -> Option<String> {
        self.workflow.next_node_id(node_id).map(String::from)
    }

    /// Run one node and return the id of the next node, or None at a
    /// terminal point. Dispatch is an exhaustive match over the closed
    /// kind set, so every kind has a handler by construction.
    async fn dispatch(&mut self, node: &Node) -> Result<Option<String>> {
        if !node.enabled {
            self.log
                .info(format!("Node '{}' is disabled, passing through", node.id));
            return Ok(self.follower(&node.id));
        }

        debug!(node = %node.id, kind = node.kind.name(), "Dispatching node");

        match &node.kind {
            NodeKind::Start | NodeKind::Annotation { .. } => Ok(self.follower(&node.id)),
            NodeKind::End => Ok(None),
            NodeKind::Delay { seconds } => {
                self.log
                    .info(format!("Node '{}': waiting {}s", node.id, seconds));
                tokio::time::sleep(Duration::from_secs(*seconds)).await;
                Ok(self.follower(&node.id))
            }
            NodeKind::Action { task, output_var } => {
                self.run_action(node, task, output_var.as_deref()).await
            }
            NodeKind::Decision {
                condition,
                true_path,
                false_path,
            } => self.run_decision(node, condition, true_path.as_deref(), false_path.as_deref()),
            NodeKind::Loop(cfg) => self.run_loop(node, cfg).await,
            NodeKind::Database(cfg) => self.run_database(node, cfg),
            NodeKind::Subflow { workflow } => {
                self.invoke_subworkflow(&node.id, workflow).await?;
                Ok(self.follower(&node.id))
            }
        }
    }

    async fn run_action(
        &mut self,
        node: &Node,
        task: &TaskBody,
        output_var: Option<&str>,
    ) -> Result<Option<String>> {
        self.log
            .info(format!("Node '{}': running task", node.id));
        let output = task::run_task(&node.id, task, &self.context, &self.log, None).await?;

        if !output.success() {
            return Err(GantryError::Node {
                node: node.id.clone(),
                message: format!("task exited with code {}", output.exit_code),
            });
        }

        if let Some(var) = output_var {
            self.context
                .set(var, Value::String(output.stdout.trim().to_string()));
        }
        // A trailing JSON-object line is a context patch, independent of
        // the declared output variable
        if let Some(patch) = output.last_json_object() {
            self.context.merge_object(&patch);
            debug!(node = %node.id, "Merged task JSON output into context");
        }

        Ok(self.follower(&node.id))
    }

    fn run_decision(
        &mut self,
        node: &Node,
        condition: &str,
        true_path: Option<&str>,
        false_path: Option<&str>,
    ) -> Result<Option<String>> {
        let fallback = self.follower(&node.id);

        if condition.trim().is_empty() {
            self.log.warning(format!(
                "Decision '{}' has an empty condition, taking the true branch",
                node.id
            ));
            return Ok(true_path.map(String::from).or(fallback));
        }

        // Evaluation failures always mean false, independent of the
        // node's failure policy
        let outcome = match expr::evaluate_bool(condition, &self.context) {
            Ok(b) => b,
            Err(e) => {
                self.log.warning(format!(
                    "Decision '{}' condition '{}' failed to evaluate ({}), treating as false",
                    node.id, condition, e
                ));
                false
            }
        };

        self.log.info(format!(
            "Decision '{}': '{}' evaluated {}",
            node.id, condition, outcome
        ));

        Ok(if outcome {
            true_path.map(String::from).or(fallback)
        } else {
            false_path.map(String::from).or(fallback)
        })
    }

    async fn run_loop(&mut self, node: &Node, cfg: &LoopConfig) -> Result<Option<String>> {
        match cfg.mode {
            LoopMode::Count => {
                let count = self.resolve_count(node, &cfg.count);
                self.log
                    .info(format!("Loop '{}': {} passes", node.id, count));
                for index in 0..count {
                    if self.stop.is_stopped() {
                        self.log
                            .warning(format!("Loop '{}': stop requested, leaving loop", node.id));
                        break;
                    }
                    self.run_loop_pass(node, cfg, index, json!(index)).await?;
                }
            }
            LoopMode::List => {
                let items = self.resolve_items(node, cfg);
                self.log.info(format!(
                    "Loop '{}': iterating {} items from '{}'",
                    node.id,
                    items.len(),
                    cfg.list_var
                ));
                for (index, item) in items.into_iter().enumerate() {
                    if self.stop.is_stopped() {
                        self.log
                            .warning(format!("Loop '{}': stop requested, leaving loop", node.id));
                        break;
                    }
                    self.run_loop_pass(node, cfg, index, item).await?;
                }
            }
            LoopMode::While => {
                let mut passes = 0;
                loop {
                    if passes >= WHILE_LOOP_CAP {
                        self.log.warning(format!(
                            "Loop '{}': reached the {}-pass cap, stopping",
                            node.id, WHILE_LOOP_CAP
                        ));
                        break;
                    }
                    if self.stop.is_stopped() {
                        self.log
                            .warning(format!("Loop '{}': stop requested, leaving loop", node.id));
                        break;
                    }
                    let keep_going = match expr::evaluate_bool(&cfg.condition, &self.context) {
                        Ok(b) => b,
                        Err(e) => {
                            self.log.warning(format!(
                                "Loop '{}' condition failed to evaluate ({}), ending loop",
                                node.id, e
                            ));
                            false
                        }
                    };
                    if !keep_going {
                        break;
                    }
                    self.run_loop_pass(node, cfg, passes, json!(passes)).await?;
                    passes += 1;
                }
            }
        }

        Ok(self.follower(&node.id))
    }

    /// One loop pass: publish index and item, run the body, and apply the
    /// node's failure policy to a failing pass.
    async fn run_loop_pass(
        &mut self,
        node: &Node,
        cfg: &LoopConfig,
        index: usize,
        item: Value,
    ) -> Result<()> {
        self.context.set(LOOP_INDEX_VAR, json!(index));
        self.context.set(cfg.item_var.clone(), item);

        let result = match &cfg.body {
            LoopBody::Task(task) => self.run_loop_task(node, task).await,
            LoopBody::Workflow(reference) => self.invoke_subworkflow(&node.id, reference).await,
        };

        if let Err(e) = result {
            match node.on_failure {
                FailurePolicy::Stop => return Err(e),
                FailurePolicy::Continue => {
                    self.had_failures = true;
                    self.log
                        .error(format!("Loop '{}' pass {} failed: {}", node.id, index, e));
                    if let Some(delay) = cfg.error_delay_secs {
                        self.log
                            .info(format!("Pausing {}s before the next pass", delay));
                        tokio::time::sleep(Duration::from_secs(delay)).await;
                    }
                }
            }
        }
        Ok(())
    }

    async fn run_loop_task(&mut self, node: &Node, task: &TaskBody) -> Result<()> {
        let output = task::run_task(
            &node.id,
            task,
            &self.context,
            &self.log,
            Some(LOOP_TASK_TIMEOUT_SECS),
        )
        .await?;

        if !output.success() {
            return Err(GantryError::Node {
                node: node.id.clone(),
                message: format!("loop task exited with code {}", output.exit_code),
            });
        }

        if let Some(patch) = output.last_json_object() {
            self.context.merge_object(&patch);
        }
        Ok(())
    }

    /// Count-mode iteration source: integer literal, or an expression
    /// over the context. Unparseable specs default to a single pass.
    fn resolve_count(&self, node: &Node, spec: &str) -> usize {
        let spec = spec.trim();
        if let Ok(n) = spec.parse::<i64>() {
            return n.max(0) as usize;
        }
        match expr::evaluate(spec, &self.context) {
            Ok(value) => match value.as_f64() {
                Some(f) if f >= 0.0 => f as usize,
                _ => {
                    self.log.warning(format!(
                        "Loop '{}' count '{}' is not a number, defaulting to 1",
                        node.id, spec
                    ));
                    1
                }
            },
            Err(e) => {
                self.log.warning(format!(
                    "Loop '{}' count '{}' did not parse ({}), defaulting to 1",
                    node.id, spec, e
                ));
                1
            }
        }
    }

    /// List-mode iteration source: a context array item-wise, a mapping
    /// as `[key, value]` pairs, anything else empty with a warning.
    fn resolve_items(&self, node: &Node, cfg: &LoopConfig) -> Vec<Value> {
        match self.context.get(&cfg.list_var) {
            Some(Value::Array(items)) => items.clone(),
            Some(Value::Object(map)) => map
                .iter()
                .map(|(k, v)| json!([k, v]))
                .collect(),
            Some(other) => {
                self.log.warning(format!(
                    "Loop '{}': variable '{}' is {} rather than a sequence or mapping, nothing to iterate",
                    node.id,
                    cfg.list_var,
                    other
                ));
                Vec::new()
            }
            None => {
                self.log.warning(format!(
                    "Loop '{}': no context variable '{}', nothing to iterate",
                    node.id, cfg.list_var
                ));
                Vec::new()
            }
        }
    }

    fn run_database(&mut self, node: &Node, cfg: &DatabaseConfig) -> Result<Option<String>> {
        self.log.info(format!(
            "Node '{}': query against '{}'",
            node.id, cfg.database
        ));

        match database::execute_query(cfg, &self.context) {
            Ok(result) => {
                self.context.set(cfg.result_var.clone(), result);
                Ok(self.follower(&node.id))
            }
            Err(e) => {
                // The error is recorded in the result variable either way;
                // the failure policy decides whether the run survives
                self.context
                    .set(cfg.result_var.clone(), json!({ "error": e.to_string() }));
                Err(e)
            }
        }
    }

    /// Run a referenced workflow with a copy of the current context and
    /// merge its final context back on non-error completion.
    async fn invoke_subworkflow(&mut self, node_id: &str, reference: &str) -> Result<()> {
        let path = resolve_workflow_path(reference, &self.config.workflows_dir)?;
        let child_workflow = Workflow::load(&path)?;
        let child_name = child_workflow.name.clone();

        self.log.info(format!(
            "Node '{}': invoking sub-workflow '{}'",
            node_id, child_name
        ));

        let mut child = Engine::with_log(
            child_workflow,
            self.config.clone(),
            self.log.with_prefix(&child_name),
        )
        .with_stop(self.stop.clone());
        child.seed(&self.context);

        let result = child.execute().await;

        match result.status {
            RunStatus::Error => Err(GantryError::Node {
                node: node_id.to_string(),
                message: result
                    .error
                    .unwrap_or_else(|| format!("sub-workflow '{}' failed", child_name)),
            }),
            status => {
                // Children may mutate ancestor state, but only through
                // this explicit merge-back
                self.context.merge(&result.context);
                if status == RunStatus::Partial {
                    self.had_failures = true;
                }
                Ok(())
            }
        }
    }
}

/// Fixed search order for sub-workflow references: an absolute path, the
/// configured workflows directory, then the bare name, each also tried
/// with `.json` appended when missing.
pub fn resolve_workflow_path(reference: &str, workflows_dir: &Path) -> Result<PathBuf> {
    let as_path = Path::new(reference);
    if as_path.is_absolute() {
        if as_path.exists() {
            return Ok(as_path.to_path_buf());
        }
        return Err(GantryError::WorkflowNotFound(reference.to_string()));
    }

    let with_ext = if reference.ends_with(".json") {
        None
    } else {
        Some(format!("{}.json", reference))
    };

    let mut candidates = vec![workflows_dir.join(reference)];
    if let Some(named) = &with_ext {
        candidates.push(workflows_dir.join(named));
    }
    candidates.push(PathBuf::from(reference));
    if let Some(named) = &with_ext {
        candidates.push(PathBuf::from(named));
    }

    candidates
        .into_iter()
        .find(|c| c.exists())
        .ok_or_else(|| GantryError::WorkflowNotFound(reference.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run_log::LogLevel;

    fn test_config(dir: &Path) -> EngineConfig {
        EngineConfig {
            workflows_dir: dir.to_path_buf(),
            logs_dir: dir.join("logs"),
            log_level: "gantry=info,warn".into(),
        }
    }

    fn engine(workflow: Workflow) -> Engine {
        let dir = std::env::temp_dir();
        Engine::with_log(workflow, test_config(&dir), RunLog::in_memory())
    }

    fn marker_action(id: &str, key: &str, value: &str) -> Node {
        Node::new(id, id, NodeKind::Action {
            task: TaskBody::command(format!("echo '{{\"{}\": \"{}\"}}'", key, value)),
            output_var: None,
        })
    }

    #[tokio::test]
    async fn test_decision_branch_scenario() {
        let mut wf = Workflow::new("branching");
        wf.set_variable("x", json!(10));
        wf.add_node(Node::new("start", "Start", NodeKind::Start));
        wf.add_node(Node::new("dec", "Branch", NodeKind::Decision {
            condition: "x > 5".into(),
            true_path: Some("a".into()),
            false_path: Some("b".into()),
        }));
        wf.add_node(marker_action("a", "took", "a"));
        wf.add_node(marker_action("b", "took", "b"));
        wf.add_node(Node::new("end", "End", NodeKind::End));
        wf.add_edge("start", "dec");
        wf.add_edge("a", "end");
        wf.add_edge("b", "end");

        let result = engine(wf).execute().await;
        assert_eq!(result.status, RunStatus::Success);
        assert_eq!(result.context.get_str("took"), Some("a"));
    }

    #[tokio::test]
    async fn test_decision_evaluation_failure_is_false() {
        let mut wf = Workflow::new("bad-condition");
        wf.add_node(Node::new("start", "Start", NodeKind::Start));
        wf.add_node(Node::new("dec", "Branch", NodeKind::Decision {
            condition: "x +".into(),
            true_path: Some("a".into()),
            false_path: Some("b".into()),
        }));
        wf.add_node(marker_action("a", "took", "a"));
        wf.add_node(marker_action("b", "took", "b"));
        wf.add_edge("start", "dec");

        let result = engine(wf).execute().await;
        // Always false, never an escalated failure
        assert_eq!(result.status, RunStatus::Success);
        assert_eq!(result.context.get_str("took"), Some("b"));
    }

    #[tokio::test]
    async fn test_empty_condition_takes_true_branch() {
        let mut wf = Workflow::new("empty-condition");
        wf.add_node(Node::new("dec", "Branch", NodeKind::Decision {
            condition: String::new(),
            true_path: Some("a".into()),
            false_path: Some("b".into()),
        }));
        wf.add_node(marker_action("a", "took", "a"));
        wf.add_node(marker_action("b", "took", "b"));

        let result = engine(wf).execute().await;
        assert_eq!(result.context.get_str("took"), Some("a"));
        assert!(result
            .logs
            .iter()
            .any(|e| e.level == LogLevel::Warning && e.message.contains("empty condition")));
    }

    #[tokio::test]
    async fn test_no_start_node_falls_back_to_first() {
        let mut wf = Workflow::new("no-start");
        wf.add_node(marker_action("first", "ran", "yes"));
        wf.add_node(Node::new("end", "End", NodeKind::End));
        wf.add_edge("first", "end");

        let result = engine(wf).execute().await;
        assert_eq!(result.status, RunStatus::Success);
        assert_eq!(result.context.get_str("ran"), Some("yes"));
    }

    #[tokio::test]
    async fn test_count_loop_increments_context() {
        let mut wf = Workflow::new("count-loop");
        wf.add_node(Node::new("start", "Start", NodeKind::Start));
        wf.add_node(Node::new(
            "lp",
            "Repeat",
            NodeKind::Loop(LoopConfig {
                mode: LoopMode::Count,
                count: "3".into(),
                list_var: String::new(),
                condition: String::new(),
                item_var: "_loop_item".into(),
                error_delay_secs: None,
                body: LoopBody::Task(TaskBody::command(
                    r#"echo "{\"n\": $((${VAR_n:-0}+1))}""#,
                )),
            }),
        ));
        wf.add_node(Node::new("end", "End", NodeKind::End));
        wf.add_edge("start", "lp");
        wf.add_edge("lp", "end");

        let result = engine(wf).execute().await;
        assert_eq!(result.status, RunStatus::Success);
        assert_eq!(result.context.get("n"), Some(&json!(3)));
        assert_eq!(result.context.get(LOOP_INDEX_VAR), Some(&json!(2)));
    }

    #[tokio::test]
    async fn test_count_from_context_variable() {
        let mut wf = Workflow::new("count-var");
        wf.set_variable("times", json!(2));
        wf.add_node(Node::new(
            "lp",
            "Repeat",
            NodeKind::Loop(LoopConfig {
                mode: LoopMode::Count,
                count: "times".into(),
                list_var: String::new(),
                condition: String::new(),
                item_var: "_loop_item".into(),
                error_delay_secs: None,
                body: LoopBody::Task(TaskBody::command(
                    r#"echo "{\"n\": $((${VAR_n:-0}+1))}""#,
                )),
            }),
        ));

        let result = engine(wf).execute().await;
        assert_eq!(result.context.get("n"), Some(&json!(2)));
    }

    #[tokio::test]
    async fn test_unparseable_count_defaults_to_one() {
        let mut wf = Workflow::new("bad-count");
        wf.add_node(Node::new(
            "lp",
            "Repeat",
            NodeKind::Loop(LoopConfig {
                mode: LoopMode::Count,
                count: "definitely not a number +".into(),
                list_var: String::new(),
                condition: String::new(),
                item_var: "_loop_item".into(),
                error_delay_secs: None,
                body: LoopBody::Task(TaskBody::command(
                    r#"echo "{\"n\": $((${VAR_n:-0}+1))}""#,
                )),
            }),
        ));

        let result = engine(wf).execute().await;
        assert_eq!(result.context.get("n"), Some(&json!(1)));
        assert!(result
            .logs
            .iter()
            .any(|e| e.level == LogLevel::Warning && e.message.contains("defaulting to 1")));
    }

    #[tokio::test]
    async fn test_list_loop_over_array() {
        let mut wf = Workflow::new("list-loop");
        wf.set_variable("names", json!(["ada", "grace"]));
        wf.add_node(Node::new(
            "lp",
            "Each",
            NodeKind::Loop(LoopConfig {
                mode: LoopMode::List,
                count: String::new(),
                list_var: "names".into(),
                condition: String::new(),
                item_var: "who".into(),
                error_delay_secs: None,
                body: LoopBody::Task(TaskBody::command(
                    r#"echo "{\"last\": \"$VAR_who\"}""#,
                )),
            }),
        ));

        let result = engine(wf).execute().await;
        assert_eq!(result.status, RunStatus::Success);
        assert_eq!(result.context.get_str("last"), Some("grace"));
        assert_eq!(result.context.get(LOOP_INDEX_VAR), Some(&json!(1)));
    }

    #[tokio::test]
    async fn test_list_loop_over_mapping_publishes_pairs() {
        let mut wf = Workflow::new("map-loop");
        wf.set_variable("settings", json!({"tier": "gold"}));
        wf.add_node(Node::new(
            "lp",
            "Each",
            NodeKind::Loop(LoopConfig {
                mode: LoopMode::List,
                count: String::new(),
                list_var: "settings".into(),
                condition: String::new(),
                item_var: "entry".into(),
                error_delay_secs: None,
                body: LoopBody::Task(TaskBody::command(":")),
            }),
        ));

        let result = engine(wf).execute().await;
        assert_eq!(result.context.get("entry"), Some(&json!(["tier", "gold"])));
    }

    #[tokio::test]
    async fn test_missing_list_variable_iterates_nothing() {
        let mut wf = Workflow::new("no-list");
        wf.add_node(Node::new(
            "lp",
            "Each",
            NodeKind::Loop(LoopConfig {
                mode: LoopMode::List,
                count: String::new(),
                list_var: "ghost".into(),
                condition: String::new(),
                item_var: "item".into(),
                error_delay_secs: None,
                body: LoopBody::Task(TaskBody::command("exit 1")),
            }),
        ));

        let result = engine(wf).execute().await;
        // The failing body never ran
        assert_eq!(result.status, RunStatus::Success);
        assert!(result
            .logs
            .iter()
            .any(|e| e.level == LogLevel::Warning && e.message.contains("nothing to iterate")));
    }

    #[tokio::test]
    async fn test_while_loop_hits_cap() {
        let mut wf = Workflow::new("runaway-while");
        wf.add_node(Node::new(
            "lp",
            "Forever",
            NodeKind::Loop(LoopConfig {
                mode: LoopMode::While,
                count: String::new(),
                list_var: String::new(),
                condition: "true".into(),
                item_var: "_loop_item".into(),
                error_delay_secs: None,
                body: LoopBody::Task(TaskBody::command(":")),
            }),
        ));

        let result = engine(wf).execute().await;
        assert_eq!(result.status, RunStatus::Success);
        // Exactly 1000 passes: the last published index is 999
        assert_eq!(result.context.get(LOOP_INDEX_VAR), Some(&json!(999)));
        assert!(result
            .logs
            .iter()
            .any(|e| e.message.contains("1000-pass cap")));
    }

    #[tokio::test]
    async fn test_while_loop_condition_progress() {
        let mut wf = Workflow::new("counted-while");
        wf.add_node(Node::new(
            "lp",
            "Until",
            NodeKind::Loop(LoopConfig {
                mode: LoopMode::While,
                count: String::new(),
                list_var: String::new(),
                condition: "n < 3".into(),
                item_var: "_loop_item".into(),
                error_delay_secs: None,
                body: LoopBody::Task(TaskBody::command(
                    r#"echo "{\"n\": $((${VAR_n:-0}+1))}""#,
                )),
            }),
        ));

        let result = engine(wf).execute().await;
        assert_eq!(result.context.get("n"), Some(&json!(3)));
    }

    #[tokio::test]
    async fn test_disabled_node_passes_through() {
        let mut wf = Workflow::new("disabled");
        wf.add_node(Node::new("start", "Start", NodeKind::Start));
        wf.add_node(
            Node::new("broken", "Broken", NodeKind::Action {
                task: TaskBody::command("exit 1"),
                output_var: None,
            })
            .disabled(),
        );
        wf.add_node(marker_action("after", "reached", "yes"));
        wf.add_edge("start", "broken");
        wf.add_edge("broken", "after");

        let result = engine(wf).execute().await;
        assert_eq!(result.status, RunStatus::Success);
        assert_eq!(result.context.get_str("reached"), Some("yes"));
    }

    #[tokio::test]
    async fn test_action_output_var_and_json_patch() {
        let mut wf = Workflow::new("outputs");
        wf.add_node(Node::new("act", "Emit", NodeKind::Action {
            task: TaskBody::command(r#"echo intro; echo '{"a": 1}'"#),
            output_var: Some("raw".into()),
        }));

        let result = engine(wf).execute().await;
        // Both effects apply: trimmed stdout and the trailing JSON patch
        assert_eq!(result.context.get_str("raw"), Some("intro\n{\"a\": 1}"));
        assert_eq!(result.context.get("a"), Some(&json!(1)));
    }

    #[tokio::test]
    async fn test_failure_policy_stop_aborts() {
        let mut wf = Workflow::new("fail-stop");
        wf.add_node(Node::new("bad", "Bad", NodeKind::Action {
            task: TaskBody::command("exit 7"),
            output_var: None,
        }));
        wf.add_node(marker_action("after", "reached", "yes"));
        wf.add_edge("bad", "after");

        let result = engine(wf).execute().await;
        assert_eq!(result.status, RunStatus::Error);
        assert!(result.error.as_deref().is_some_and(|e| e.contains("code 7")));
        assert_eq!(result.context.get("reached"), None);
    }

    #[tokio::test]
    async fn test_failure_policy_continue_is_partial() {
        let mut wf = Workflow::new("fail-continue");
        wf.add_node(
            Node::new("bad", "Bad", NodeKind::Action {
                task: TaskBody::command("exit 7"),
                output_var: None,
            })
            .with_policy(FailurePolicy::Continue),
        );
        wf.add_node(marker_action("after", "reached", "yes"));
        wf.add_edge("bad", "after");

        let result = engine(wf).execute().await;
        assert_eq!(result.status, RunStatus::Partial);
        assert!(result.error.is_none());
        assert_eq!(result.context.get_str("reached"), Some("yes"));
    }

    #[tokio::test]
    async fn test_dangling_edge_ends_as_success() {
        let mut wf = Workflow::new("dangling");
        wf.add_node(Node::new("start", "Start", NodeKind::Start));
        wf.add_edge("start", "ghost");

        let result = engine(wf).execute().await;
        assert_eq!(result.status, RunStatus::Success);
        assert!(result
            .logs
            .iter()
            .any(|e| e.level == LogLevel::Warning && e.message.contains("not found")));
    }

    #[tokio::test]
    async fn test_stop_requested_before_run() {
        let mut wf = Workflow::new("stopped");
        wf.add_node(marker_action("act", "ran", "yes"));

        let eng = engine(wf);
        eng.stop_handle().stop();
        let result = eng.execute().await;

        assert_eq!(result.status, RunStatus::Stopped);
        assert_eq!(result.context.get("ran"), None);
    }

    #[tokio::test]
    async fn test_subflow_merges_context_back() {
        let dir = tempfile::tempdir().unwrap();

        let mut child = Workflow::new("child-flow");
        child.add_node(marker_action("set", "from_child", "hello"));
        child.save(&dir.path().join("child.json")).unwrap();

        let mut parent = Workflow::new("parent-flow");
        parent.add_node(Node::new("sub", "Call", NodeKind::Subflow {
            workflow: "child".into(),
        }));

        let result = Engine::with_log(parent, test_config(dir.path()), RunLog::in_memory())
            .execute()
            .await;

        assert_eq!(result.status, RunStatus::Success);
        assert_eq!(result.context.get_str("from_child"), Some("hello"));
        // Child lines arrive bridged into the parent stream
        assert!(result
            .logs
            .iter()
            .any(|e| e.message.starts_with("[child-flow]")));
    }

    #[tokio::test]
    async fn test_subflow_error_respects_parent_policy() {
        let dir = tempfile::tempdir().unwrap();

        let mut child = Workflow::new("failing-child");
        child.add_node(marker_action("set", "from_child", "hello"));
        child.add_node(Node::new("bad", "Bad", NodeKind::Action {
            task: TaskBody::command("exit 1"),
            output_var: None,
        }));
        child.add_edge("set", "bad");
        child.save(&dir.path().join("failing-child.json")).unwrap();

        // Continue policy: the parent survives and nothing is merged
        let mut parent = Workflow::new("parent-continue");
        parent.add_node(
            Node::new("sub", "Call", NodeKind::Subflow {
                workflow: "failing-child".into(),
            })
            .with_policy(FailurePolicy::Continue),
        );
        parent.add_node(marker_action("after", "reached", "yes"));
        parent.add_edge("sub", "after");

        let result = Engine::with_log(parent, test_config(dir.path()), RunLog::in_memory())
            .execute()
            .await;
        assert_eq!(result.status, RunStatus::Partial);
        assert_eq!(result.context.get("from_child"), None);
        assert_eq!(result.context.get_str("reached"), Some("yes"));

        // Stop policy: the parent aborts
        let mut parent = Workflow::new("parent-stop");
        parent.add_node(Node::new("sub", "Call", NodeKind::Subflow {
            workflow: "failing-child".into(),
        }));

        let result = Engine::with_log(parent, test_config(dir.path()), RunLog::in_memory())
            .execute()
            .await;
        assert_eq!(result.status, RunStatus::Error);
    }

    #[tokio::test]
    async fn test_loop_body_as_subworkflow() {
        let dir = tempfile::tempdir().unwrap();

        let mut child = Workflow::new("bump");
        child.add_node(Node::new("inc", "Increment", NodeKind::Action {
            task: TaskBody::command(r#"echo "{\"n\": $((${VAR_n:-0}+1))}""#),
            output_var: None,
        }));
        child.save(&dir.path().join("bump.json")).unwrap();

        let mut wf = Workflow::new("loop-subflow");
        wf.add_node(Node::new(
            "lp",
            "Repeat",
            NodeKind::Loop(LoopConfig {
                mode: LoopMode::Count,
                count: "2".into(),
                list_var: String::new(),
                condition: String::new(),
                item_var: "_loop_item".into(),
                error_delay_secs: None,
                body: LoopBody::Workflow("bump".into()),
            }),
        ));

        let result = Engine::with_log(wf, test_config(dir.path()), RunLog::in_memory())
            .execute()
            .await;
        assert_eq!(result.status, RunStatus::Success);
        assert_eq!(result.context.get("n"), Some(&json!(2)));
    }

    #[test]
    fn test_resolve_workflow_path_order() {
        let dir = tempfile::tempdir().unwrap();
        let workflows = dir.path().join("workflows");
        std::fs::create_dir_all(&workflows).unwrap();
        std::fs::write(workflows.join("deploy.json"), "{}").unwrap();

        // Bare name resolves inside the workflows directory, .json appended
        let resolved = resolve_workflow_path("deploy", &workflows).unwrap();
        assert_eq!(resolved, workflows.join("deploy.json"));

        // Absolute paths are taken as-is
        let absolute = workflows.join("deploy.json");
        let resolved = resolve_workflow_path(absolute.to_str().unwrap(), &workflows).unwrap();
        assert_eq!(resolved, absolute);

        // Missing references are reported, not invented
        assert!(matches!(
            resolve_workflow_path("ghost", &workflows),
            Err(GantryError::WorkflowNotFound(_))
        ));
    }
}
