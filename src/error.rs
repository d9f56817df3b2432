use thiserror::Error;

/// Everything that can fail a dispatch request.
///
/// Unknown bounds are not a failure (they only disable splitting), and a row
/// whose HAVING evaluation fails is dropped by the evaluator.
#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("SQL parse error: {0}")]
    Parse(String),

    #[error("Missing `sql` field")]
    MissingSql,

    #[error("Unsupported query: {0}")]
    Unsupported(String),

    #[error("Worker error (partition {worker}): {detail}")]
    Worker { worker: usize, detail: String },

    #[error("Worker transport error: {0}")]
    Transport(String),

    #[error("Merge error: {0}")]
    Merge(String),

    #[error("Bounds provider error: {0}")]
    Bounds(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl DispatchError {
    /// True for failures caused by the request itself rather than by a
    /// worker or the dispatcher.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            DispatchError::Parse(_) | DispatchError::MissingSql | DispatchError::Unsupported(_)
        )
    }

    /// True for failures that originate in a worker call.
    pub fn is_upstream_error(&self) -> bool {
        matches!(self, DispatchError::Worker { .. } | DispatchError::Transport(_))
    }
}

pub type Result<T> = std::result::Result<T, DispatchError>;
