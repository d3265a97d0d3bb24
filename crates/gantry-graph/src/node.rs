use serde::{Deserialize, Serialize};

/// Cosmetic canvas position carried through for editor round-trips.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

/// Per-node choice controlling whether a task failure aborts the run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Abort the whole run on failure.
    #[default]
    Stop,
    /// Log the failure and continue to the node's normal follower.
    Continue,
}

/// The externally-executed work unit attached to an Action or Loop node.
///
/// A script path is preferred over a raw shell command when both are set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskBody {
    /// Path to an executable script.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script: Option<String>,
    /// Raw shell command, run via `sh -c`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
}

impl TaskBody {
    pub fn script(path: impl Into<String>) -> Self {
        Self {
            script: Some(path.into()),
            command: None,
        }
    }

    pub fn command(cmd: impl Into<String>) -> Self {
        Self {
            script: None,
            command: Some(cmd.into()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.script.as_deref().unwrap_or("").is_empty()
            && self.command.as_deref().unwrap_or("").is_empty()
    }
}

/// Iteration mode for Loop nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopMode {
    /// Fixed number of passes: integer literal or context variable.
    Count,
    /// One pass per item of a context sequence or mapping.
    List,
    /// Re-evaluated boolean condition, capped at 1000 passes.
    While,
}

/// What a Loop node runs on each pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopBody {
    /// An Action-style task body.
    Task(TaskBody),
    /// A nested workflow reference.
    Workflow(String),
}

fn default_item_var() -> String {
    "_loop_item".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoopConfig {
    pub mode: LoopMode,
    /// Count mode: integer literal or the name of a context variable.
    #[serde(default)]
    pub count: String,
    /// List mode: name of the context variable holding the sequence/mapping.
    #[serde(default)]
    pub list_var: String,
    /// While mode: boolean expression re-evaluated before each pass.
    #[serde(default)]
    pub condition: String,
    /// Context key under which the current item is published.
    #[serde(default = "default_item_var")]
    pub item_var: String,
    /// Pause between passes after a failure under the continue policy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_delay_secs: Option<u64>,
    pub body: LoopBody,
}

impl LoopConfig {
    /// The iteration spec relevant to this loop's mode, for validation.
    pub fn iteration_spec(&self) -> &str {
        match self.mode {
            LoopMode::Count => &self.count,
            LoopMode::List => &self.list_var,
            LoopMode::While => &self.condition,
        }
    }
}

/// SQL statement class of a Database node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DbOperation {
    Select,
    Insert,
    Update,
    Delete,
}

impl DbOperation {
    pub fn is_select(&self) -> bool {
        matches!(self, Self::Select)
    }
}

fn default_result_var() -> String {
    "db_result".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Path of the SQLite database file.
    pub database: String,
    /// SQL text with `{var}` placeholders substituted from the context.
    pub query: String,
    pub operation: DbOperation,
    /// Context key receiving the query result.
    #[serde(default = "default_result_var")]
    pub result_var: String,
}

/// The closed set of task types a graph node may be.
///
/// Serialized with an internal `type` tag so the wire form of a node is a
/// single flat object: `{id, type, label, position, ...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeKind {
    /// Entry marker. At most one per workflow.
    Start,
    /// Terminal marker, no follower.
    End,
    /// Documentation-only, pass-through at runtime.
    Annotation {
        #[serde(default)]
        text: String,
    },
    /// Run a task body as a child process.
    Action {
        #[serde(default)]
        task: TaskBody,
        /// Context key receiving the trimmed full stdout on success.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        output_var: Option<String>,
    },
    /// Boolean branch. `true_path`/`false_path` are authoritative over
    /// edges; each falls back to the ordinary outgoing edge when unset.
    Decision {
        #[serde(default)]
        condition: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        true_path: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        false_path: Option<String>,
    },
    Loop(LoopConfig),
    Database(DatabaseConfig),
    /// Pause for a fixed number of seconds.
    Delay { seconds: u64 },
    /// Invoke another serialized workflow with a copy of the context.
    Subflow { workflow: String },
}

impl NodeKind {
    /// Short lowercase name used in log lines.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::End => "end",
            Self::Annotation { .. } => "annotation",
            Self::Action { .. } => "action",
            Self::Decision { .. } => "decision",
            Self::Loop(_) => "loop",
            Self::Database(_) => "database",
            Self::Delay { .. } => "delay",
            Self::Subflow { .. } => "subflow",
        }
    }
}

fn default_enabled() -> bool {
    true
}

/// A node in the workflow graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Unique identifier within the workflow.
    pub id: String,
    /// Human-readable label.
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub position: Position,
    /// Disabled nodes never run their body but still pass execution
    /// through their single outgoing edge.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub on_failure: FailurePolicy,
    #[serde(flatten)]
    pub kind: NodeKind,
}

impl Node {
    pub fn new(id: impl Into<String>, label: impl Into<String>, kind: NodeKind) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
            position: Position::default(),
            enabled: true,
            on_failure: FailurePolicy::default(),
            kind,
        }
    }

    pub fn with_position(mut self, x: f64, y: f64) -> Self {
        self.position = Position { x, y };
        self
    }

    pub fn with_policy(mut self, policy: FailurePolicy) -> Self {
        self.on_failure = policy;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn is_start(&self) -> bool {
        matches!(self.kind, NodeKind::Start)
    }

    pub fn is_end(&self) -> bool {
        matches!(self.kind, NodeKind::End)
    }

    pub fn is_decision(&self) -> bool {
        matches!(self.kind, NodeKind::Decision { .. })
    }
}
