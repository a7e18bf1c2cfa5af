use thiserror::Error;

/// Main error type for the Shotgun optimizer
#[derive(Error, Debug)]
pub enum SgError {
    #[error("Shape error: {0}")]
    Shape(#[from] ShapeError),

    #[error("Evaluation error: {0}")]
    Evaluation(#[from] EvaluationError),

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Optimization error: {0}")]
    Optimization(#[from] OptimizationError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// A row does not match the key set it was built against.
///
/// Shape errors are raised at construction time, so a malformed row never
/// reaches the pipeline.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ShapeError {
    #[error("missing key: {key}")]
    MissingKey { key: String },

    #[error("unknown key: {key}")]
    UnknownKey { key: String },

    #[error("duplicate key: {key}")]
    DuplicateKey { key: String },

    #[error("non-finite value {value} for key {key}")]
    NonFinite { key: String, value: f64 },

    #[error("key set must not be empty")]
    EmptyKeySet,

    #[error("key set mismatch: expected [{expected}], got [{actual}]")]
    SchemaMismatch { expected: String, actual: String },
}

/// Per-request evaluation failure.
///
/// These travel inside pipeline results back to the requester, which is why
/// they are cloneable and carry owned strings rather than boxed sources.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EvaluationError {
    #[error("required input missing: {key}")]
    MissingInput { key: String },

    #[error("input {key}={value} outside domain [{low}, {high}]")]
    OutOfDomain {
        key: String,
        value: f64,
        low: f64,
        high: f64,
    },

    #[error("evaluation failed: {message}")]
    Failed { message: String },

    #[error("evaluation timed out after {timeout_ms} ms")]
    TimedOut { timeout_ms: u64 },

    #[error("evaluator panicked: {message}")]
    Panicked { message: String },

    #[error("evaluation cancelled")]
    Cancelled,

    #[error("request rejected: {0}")]
    Rejected(PipelineError),

    #[error(transparent)]
    Shape(#[from] ShapeError),
}

impl EvaluationError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
        }
    }
}

/// Errors raised by the request/result queues themselves.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PipelineError {
    #[error("request queue full (capacity {capacity})")]
    Full { capacity: usize },

    #[error("pipeline is shut down")]
    ShutDown,

    #[error("pipeline channel disconnected")]
    Disconnected,
}

/// Errors surfaced by external cache stores. The in-memory caches never
/// produce these.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    #[error("cache store unavailable: {message}")]
    Unavailable { message: String },

    #[error("corrupt cache entry: {message}")]
    Corrupt { message: String },
}

/// Fatal outcome of an `optimize` call.
#[derive(Error, Debug)]
pub enum OptimizationError {
    #[error("no climber produced a valid result ({climbers} climbers, {failures} failed evaluations)")]
    NoValidResult { climbers: usize, failures: u64 },

    #[error("invalid optimizer configuration: {message}")]
    InvalidConfig { message: String },

    #[error("failed to start optimizer: {message}")]
    Startup { message: String },

    #[error("search space does not match evaluator: {0}")]
    Shape(#[from] ShapeError),

    #[error("pipeline failure: {0}")]
    Pipeline(#[from] PipelineError),
}

impl From<SgError> for OptimizationError {
    fn from(error: SgError) -> Self {
        match error {
            SgError::Optimization(e) => e,
            SgError::Config(message) => Self::InvalidConfig { message },
            SgError::Shape(e) => Self::Shape(e),
            SgError::Pipeline(e) => Self::Pipeline(e),
            other => Self::Startup {
                message: other.to_string(),
            },
        }
    }
}

/// Result type alias for Shotgun operations
pub type SgResult<T> = Result<T, SgError>;

/// Macro for creating configuration errors
#[macro_export]
macro_rules! config_error {
    ($($arg:tt)*) => {
        $crate::SgError::Config(format!($($arg)*))
    };
}
