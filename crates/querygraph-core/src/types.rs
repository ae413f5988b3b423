use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Result set returned by a query engine.
///
/// Validation only looks at whether a query succeeded; rows are carried for
/// callers that execute the final query themselves.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<serde_json::Value>>,
}

impl QueryResult {
    pub fn new(columns: Vec<String>, rows: Vec<Vec<serde_json::Value>>) -> Self {
        Self { columns, rows }
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }
}

/// Failure reported by a query engine.
///
/// `Rejected` and `Timeout` are query-level outcomes and are recorded against the
/// fragment being validated. `Connectivity` means the engine itself cannot be
/// reached and ends the run.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("query rejected: {0}")]
    Rejected(String),

    #[error("query timed out after {}s", .0.as_secs())]
    Timeout(Duration),

    #[error("engine unreachable: {0}")]
    Connectivity(String),
}

impl EngineError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, EngineError::Connectivity(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_connectivity_is_fatal() {
        assert!(EngineError::Connectivity("refused".into()).is_fatal());
        assert!(!EngineError::Rejected("syntax".into()).is_fatal());
        assert!(!EngineError::Timeout(Duration::from_secs(10)).is_fatal());
    }

    #[test]
    fn test_timeout_message_uses_seconds() {
        let err = EngineError::Timeout(Duration::from_secs(15));
        assert_eq!(err.to_string(), "query timed out after 15s");
    }
}
