use thiserror::Error;

#[derive(Debug, Error)]
pub enum TesseraError {
    // Run initialization errors
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    // Prompt template errors
    #[error("Template error at line {line}, column {column}: {message}\n{pointer}")]
    Template {
        message: String,
        line: usize,
        column: usize,
        /// The offending template line followed by a caret under the column.
        pointer: String,
    },

    // Output errors
    #[error("Output does not match schema: {0}")]
    SchemaValidation(String),

    // LLM errors
    #[error("LLM request failed: {0}")]
    LlmRequest(String),

    #[error("LLM streaming error: {0}")]
    LlmStream(String),

    #[error("LLM response parse error: {0}")]
    LlmParse(String),

    #[error("Model not found: {0}")]
    ModelNotFound(String),

    // Tool errors
    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    #[error("Tool execution failed: {tool}: {message}")]
    ToolExecution { tool: String, message: String },

    #[error("Tool timeout after {timeout_secs}s: {tool}")]
    ToolTimeout { tool: String, timeout_secs: u64 },

    #[error("Tool input validation failed: {0}")]
    ToolValidation(String),

    // Node execution errors
    #[error("Activity {activity} timed out after {timeout_secs}s")]
    ActivityTimeout {
        activity: String,
        timeout_secs: u64,
    },

    #[error("Node exceeded max steps ({0})")]
    MaxStepsExceeded(usize),

    // Scheduling invariant violations
    #[error("Node {0} completed without an output")]
    MissingOutput(String),

    #[error("Scheduler stalled with nodes still pending: {0}")]
    Stalled(String),

    // Host errors
    #[error("Execution not found: {0}")]
    ExecutionNotFound(String),

    #[error("Execution terminated: {0}")]
    ExecutionTerminated(String),

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl TesseraError {
    /// Whether the error comes from the host rather than from the run itself.
    ///
    /// Event consumers treat these as a clean end of stream.
    pub fn is_host_error(&self) -> bool {
        matches!(
            self,
            TesseraError::ExecutionNotFound(_) | TesseraError::ExecutionTerminated(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, TesseraError>;
