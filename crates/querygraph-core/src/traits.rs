use crate::{
    ConnectionDetails, EngineError, QueryResult, QueryVersion, Result, RunState, SessionRecord,
    StructuredMapping, ValidationStatus,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Turns raw spreadsheet-derived text into a structured mapping.
#[async_trait]
pub trait MappingExtractor: Send + Sync {
    async fn extract(&self, raw_text: &str) -> Result<StructuredMapping>;
}

/// Executes a query with a per-call timeout.
#[async_trait]
pub trait QueryEngine: Send + Sync {
    async fn execute(&self, sql: &str, timeout: Duration)
        -> std::result::Result<QueryResult, EngineError>;
}

/// Opens a query engine from opaque connection parameters.
#[async_trait]
pub trait EngineConnector: Send + Sync {
    async fn connect(
        &self,
        details: &ConnectionDetails,
    ) -> std::result::Result<Arc<dyn QueryEngine>, EngineError>;
}

/// Records run progress and generated query versions.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn create_session(&self, id: Uuid) -> Result<()>;
    async fn record_status(&self, id: Uuid, state: RunState, detail: Option<String>) -> Result<()>;
    async fn record_query_version(
        &self,
        id: Uuid,
        sql: String,
        validation: ValidationStatus,
        warnings: Vec<String>,
    ) -> Result<u32>;
    async fn prior_versions(&self, id: Uuid) -> Result<Vec<QueryVersion>>;
    async fn get_session(&self, id: Uuid) -> Result<Option<SessionRecord>>;
    async fn remove_session(&self, id: Uuid) -> Result<bool>;
    async fn evict_expired(&self, now: DateTime<Utc>) -> Result<usize>;
}

/// Connector that hands out an engine the caller already owns.
#[derive(Clone)]
pub struct SharedEngine {
    engine: Arc<dyn QueryEngine>,
}

impl SharedEngine {
    pub fn new(engine: Arc<dyn QueryEngine>) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl EngineConnector for SharedEngine {
    async fn connect(
        &self,
        _details: &ConnectionDetails,
    ) -> std::result::Result<Arc<dyn QueryEngine>, EngineError> {
        Ok(self.engine.clone())
    }
}
