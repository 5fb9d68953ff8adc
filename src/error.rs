//! Error types for llmcmd

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Process exit code for a successful session.
pub const EXIT_OK: i32 = 0;
/// Process exit code when a tool reported a terminal error.
pub const EXIT_TOOL: i32 = 1;
/// Process exit code for configuration problems (bad key, unknown preset).
pub const EXIT_CONFIG: i32 = 2;
/// Process exit code when the call or token budget ran out without a clean exit.
pub const EXIT_BUDGET: i32 = 3;
/// Process exit code for LLM transport failures that survived retries.
pub const EXIT_TRANSPORT: i32 = 4;
/// Base for signal-coded aborts (`64 + signal`).
pub const EXIT_SIGNAL_BASE: i32 = 64;

/// Main error type for the crate
#[derive(Error, Debug)]
pub enum Error {
    /// HTTP request error
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error on a handle, pipe, or real file
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid configuration (missing API key, malformed key, unknown preset)
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// API error from the model endpoint with no usable status code
    /// (malformed or empty responses)
    #[error("API error: {0}")]
    Api(String),

    /// Non-success HTTP status from the model endpoint. The numeric code
    /// is kept so the retry classifier can tell transient 5xx/429 apart
    /// from caller errors.
    #[error("API error {status}: {message}")]
    HttpStatus {
        /// The HTTP status code the endpoint returned.
        status: u16,
        /// The response body, or a substitute when it could not be read.
        message: String,
    },

    /// Call-count or weighted-token budget exhausted
    #[error("Budget exhausted: {0}")]
    Budget(String),

    /// Tool-call error (returned to the model, never out of the loop)
    #[error("Tool error: {0}")]
    Tool(String),

    /// Pipeline script parse or execution error
    #[error("Pipeline error: {0}")]
    Pipeline(String),

    /// FS-proxy protocol violation
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Timeout error
    #[error("Request timeout")]
    Timeout,

    /// Session cancelled (timeout or signal)
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// Other errors
    #[error("Error: {0}")]
    Other(String),
}

impl Error {
    /// Create a new config error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Create a new API error
    pub fn api(msg: impl Into<String>) -> Self {
        Error::Api(msg.into())
    }

    /// Create a new API error carrying the HTTP status code
    pub fn http_status(status: u16, message: impl Into<String>) -> Self {
        Error::HttpStatus {
            status,
            message: message.into(),
        }
    }

    /// Create a new budget error
    pub fn budget(msg: impl Into<String>) -> Self {
        Error::Budget(msg.into())
    }

    /// Create a new tool error
    pub fn tool(msg: impl Into<String>) -> Self {
        Error::Tool(msg.into())
    }

    /// Create a new pipeline error
    pub fn pipeline(msg: impl Into<String>) -> Self {
        Error::Pipeline(msg.into())
    }

    /// Create a new protocol error
    pub fn protocol(msg: impl Into<String>) -> Self {
        Error::Protocol(msg.into())
    }

    /// Create a new invalid input error
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Error::InvalidInput(msg.into())
    }

    /// Create a new cancellation error
    pub fn cancelled(msg: impl Into<String>) -> Self {
        Error::Cancelled(msg.into())
    }

    /// Create a new other error
    pub fn other(msg: impl Into<String>) -> Self {
        Error::Other(msg.into())
    }

    /// Create a timeout error
    pub fn timeout() -> Self {
        Error::Timeout
    }

    /// Map this error to the process exit code named in the CLI contract.
    ///
    /// Configuration problems exit 2, budget exhaustion 3, transport
    /// failures 4; everything else is a tool-level failure (1).
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Config(_) | Error::InvalidInput(_) => EXIT_CONFIG,
            Error::Budget(_) => EXIT_BUDGET,
            Error::Http(_) | Error::Api(_) | Error::HttpStatus { .. } | Error::Timeout => {
                EXIT_TRANSPORT
            }
            Error::Cancelled(_) => EXIT_SIGNAL_BASE,
            _ => EXIT_TOOL,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_config() {
        let err = Error::config("missing API key");
        assert!(matches!(err, Error::Config(_)));
        assert_eq!(err.to_string(), "Invalid configuration: missing API key");
        assert_eq!(err.exit_code(), EXIT_CONFIG);
    }

    #[test]
    fn test_error_api() {
        let err = Error::api("response contained no choices");
        assert!(matches!(err, Error::Api(_)));
        assert_eq!(
            err.to_string(),
            "API error: response contained no choices"
        );
        assert_eq!(err.exit_code(), EXIT_TRANSPORT);
    }

    #[test]
    fn test_error_http_status() {
        let err = Error::http_status(503, "Service Unavailable");
        assert!(matches!(err, Error::HttpStatus { status: 503, .. }));
        assert_eq!(err.to_string(), "API error 503: Service Unavailable");
        assert_eq!(err.exit_code(), EXIT_TRANSPORT);
    }

    #[test]
    fn test_error_budget() {
        let err = Error::budget("weighted tokens exhausted");
        assert!(matches!(err, Error::Budget(_)));
        assert_eq!(err.exit_code(), EXIT_BUDGET);
    }

    #[test]
    fn test_error_tool() {
        let err = Error::tool("invalid file descriptor");
        assert!(matches!(err, Error::Tool(_)));
        assert_eq!(err.to_string(), "Tool error: invalid file descriptor");
        assert_eq!(err.exit_code(), EXIT_TOOL);
    }

    #[test]
    fn test_error_pipeline() {
        let err = Error::pipeline("command not found: frobnicate");
        assert!(matches!(err, Error::Pipeline(_)));
        assert_eq!(err.exit_code(), EXIT_TOOL);
    }

    #[test]
    fn test_error_timeout() {
        let err = Error::timeout();
        assert!(matches!(err, Error::Timeout));
        assert_eq!(err.to_string(), "Request timeout");
        assert_eq!(err.exit_code(), EXIT_TRANSPORT);
    }

    #[test]
    fn test_error_from_serde_json() {
        let json_err = serde_json::from_str::<serde_json::Value>("invalid json").unwrap_err();
        let err: Error = json_err.into();
        assert!(matches!(err, Error::Json(_)));
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe closed");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn test_result_type_alias() {
        fn _returns_result() -> Result<i32> {
            Ok(42)
        }

        fn _returns_error() -> Result<i32> {
            Err(Error::timeout())
        }
    }
}
