/// Engine error taxonomy
///
/// Every failure inside the orchestration core is one of these kinds. Only
/// `Script` carries a recovery policy of its own (cascade to the owning run);
/// all other kinds abort the processing of the single row they occurred on.

use thiserror::Error;

/// Errors raised by the codec, index engine, store and executors
#[derive(Debug, Error)]
pub enum EngineError {
    /// Declared data type and encountered data disagree
    #[error("decode error: {0}")]
    Decode(String),

    /// A task could not be handed to its executor (process, remote node, HTTP)
    #[error("dispatch error: {0}")]
    Dispatch(String),

    /// The embedded script raised or produced an unusable output
    #[error("script error: {0}")]
    Script(String),

    /// Definitions or persisted rows violate an engine invariant
    #[error("consistency error: {0}")]
    Consistency(String),

    /// The backing store rejected a statement
    #[error("store error: {0}")]
    Store(#[from] sqlx::Error),
}

impl From<reqwest::Error> for EngineError {
    fn from(err: reqwest::Error) -> Self {
        EngineError::Dispatch(err.to_string())
    }
}

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        EngineError::Dispatch(err.to_string())
    }
}

impl EngineError {
    pub fn is_script(&self) -> bool {
        matches!(self, EngineError::Script(_))
    }
}

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = EngineError::Decode("repetition count 3 does not match length 2".to_string());
        assert_eq!(err.to_string(), "decode error: repetition count 3 does not match length 2");

        let err = EngineError::Consistency("workflow 4 has 3 terminal instances".to_string());
        assert_eq!(err.to_string(), "consistency error: workflow 4 has 3 terminal instances");
    }

    #[test]
    fn test_io_errors_are_dispatch_errors() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "no such program");
        let err: EngineError = io.into();
        assert!(matches!(err, EngineError::Dispatch(_)));
        assert!(!err.is_script());
    }
}
