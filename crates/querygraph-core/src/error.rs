use crate::types::EngineError;
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum QueryGraphError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Extraction error: {0}")]
    Extraction(String),

    #[error("Invalid mapping: {0}")]
    InvalidMapping(String),

    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("Session not found: {0}")]
    SessionNotFound(Uuid),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
}

pub type Result<T> = std::result::Result<T, QueryGraphError>;
