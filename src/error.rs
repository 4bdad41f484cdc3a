// =============================================================================
// Error taxonomy
// =============================================================================
//
//   ConfigError  raised while loading the config file; fatal at startup.
//   FetchError   raised by a data source for one fetch call.
//   TaskError    what the orchestrator records for a failed task; never
//                escapes `Ingestion::run`.
// =============================================================================

use thiserror::Error;

use crate::market_data::kline::KlineError;
use crate::market_data::OrderingError;

/// Failure of a single `DataSource::fetch` call.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Parameter bag missing a key, or holding a value the source rejects.
    #[error("invalid parameters: {0}")]
    Validation(String),

    /// The upstream could not be reached (DNS, TLS, timeout, I/O).
    #[error("transport error: {0}")]
    Transport(String),

    /// The upstream answered with a non-success HTTP status.
    #[error("upstream returned HTTP {status}: {body}")]
    Http { status: u16, body: String },

    /// The upstream answered, but the payload could not be normalized.
    #[error("parse error: {0}")]
    Parse(String),
}

impl FetchError {
    /// Short machine-friendly label, used as a structured log field.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::Transport(_) => "transport",
            Self::Http { .. } => "http",
            Self::Parse(_) => "parse",
        }
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            Self::Parse(err.to_string())
        } else {
            Self::Transport(err.to_string())
        }
    }
}

impl From<KlineError> for FetchError {
    fn from(err: KlineError) -> Self {
        Self::Parse(err.to_string())
    }
}

impl From<OrderingError> for FetchError {
    fn from(err: OrderingError) -> Self {
        Self::Parse(err.to_string())
    }
}

/// Why a task is missing from the aggregate result.
#[derive(Debug, Error)]
pub enum TaskError {
    /// The task names a source that is not in the registry.
    #[error("unknown data source: {0}")]
    UnknownSource(String),

    /// The task cannot be told apart from another one (blank or reused name).
    #[error("invalid task: {0}")]
    InvalidTask(String),

    /// The source was found but the fetch failed.
    #[error(transparent)]
    Fetch(#[from] FetchError),

    /// The run was cancelled before or while this task ran.
    #[error("cancelled before completion")]
    Cancelled,
}

impl TaskError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::UnknownSource(_) | Self::InvalidTask(_) => "configuration",
            Self::Fetch(e) => e.kind(),
            Self::Cancelled => "cancelled",
        }
    }
}

/// Failure while loading or validating the ingestion config.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config from {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("task name '{0}' is declared more than once")]
    DuplicateTask(String),

    #[error("task #{0} has an empty name")]
    EmptyTaskName(usize),
}
