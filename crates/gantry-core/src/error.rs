use thiserror::Error;

#[derive(Debug, Error)]
pub enum GantryError {
    // Workflow definition errors
    #[error("Workflow error: {0}")]
    Workflow(String),

    #[error("Workflow file not found: {0}")]
    WorkflowNotFound(String),

    // Node execution errors
    #[error("Node '{node}' failed: {message}")]
    Node { node: String, message: String },

    #[error("Task timeout after {timeout_secs}s in node '{node}'")]
    TaskTimeout { node: String, timeout_secs: u64 },

    // Expression errors
    #[error("Expression error: {0}")]
    Expression(String),

    // Database errors
    #[error("Database error: {0}")]
    Database(String),

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, GantryError>;
