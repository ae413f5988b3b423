//! Databricks SQL warehouse adapter over the Statement Execution API.

use crate::statement::{http_error, warehouse_id, StatementRequest, StatementResponse};
use async_trait::async_trait;
use querygraph_core::{
    ConnectionDetails, EngineConfig, EngineConnector, EngineError, QueryEngine, QueryResult,
};
use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use url::Url;

const STATEMENTS_PATH: &str = "/api/2.0/sql/statements";

/// One warehouse session. Read-only: every statement is a smoke query.
pub struct DatabricksEngine {
    client: Client,
    endpoint: Url,
    token: String,
    warehouse_id: String,
    catalog: Option<String>,
    schema: Option<String>,
}

impl std::fmt::Debug for DatabricksEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabricksEngine")
            .field("endpoint", &self.endpoint.as_str())
            .field("warehouse_id", &self.warehouse_id)
            .field("catalog", &self.catalog)
            .field("schema", &self.schema)
            .finish()
    }
}

impl DatabricksEngine {
    pub fn new(details: &ConnectionDetails, request_timeout: Duration) -> Result<Self, EngineError> {
        let missing = |field: &str| {
            EngineError::Connectivity(format!("connection details are missing {}", field))
        };
        let hostname = details
            .server_hostname
            .as_deref()
            .ok_or_else(|| missing("server_hostname"))?;
        let http_path = details.http_path.as_deref().ok_or_else(|| missing("http_path"))?;
        let token = details
            .access_token
            .clone()
            .ok_or_else(|| missing("access_token"))?;

        let warehouse_id = warehouse_id(http_path).ok_or_else(|| {
            EngineError::Connectivity(format!(
                "http_path '{}' does not name a SQL warehouse",
                http_path
            ))
        })?;

        let client = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| EngineError::Connectivity(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            endpoint: statements_url(hostname)?,
            token,
            warehouse_id,
            catalog: details.catalog.clone(),
            schema: details.database.clone(),
        })
    }

    pub fn warehouse_id(&self) -> &str {
        &self.warehouse_id
    }
}

/// Accepts a bare hostname or a full URL.
fn statements_url(hostname: &str) -> Result<Url, EngineError> {
    let hostname = hostname.trim().trim_end_matches('/');
    let base = if hostname.contains("://") {
        hostname.to_string()
    } else {
        format!("https://{}", hostname)
    };
    Url::parse(&base)
        .and_then(|url| url.join(STATEMENTS_PATH))
        .map_err(|e| EngineError::Connectivity(format!("invalid server hostname '{}': {}", hostname, e)))
}

#[async_trait]
impl QueryEngine for DatabricksEngine {
    async fn execute(&self, sql: &str, timeout: Duration) -> Result<QueryResult, EngineError> {
        let mut request = StatementRequest::new(sql, &self.warehouse_id, timeout);
        request.catalog = self.catalog.as_deref();
        request.schema = self.schema.as_deref();

        let response = self
            .client
            .post(self.endpoint.clone())
            .bearer_auth(&self.token)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    EngineError::Timeout(timeout)
                } else {
                    EngineError::Connectivity(format!("request to warehouse failed: {}", e))
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(http_error(status.as_u16(), &body));
        }

        let statement: StatementResponse = response.json().await.map_err(|e| {
            EngineError::Connectivity(format!("unreadable warehouse response: {}", e))
        })?;
        debug!(
            "Statement {} finished as {}",
            statement.statement_id.as_deref().unwrap_or("<unknown>"),
            statement.status.state
        );

        statement.into_result(timeout)
    }
}

/// Opens Databricks engines. Per-request details win; the configured engine
/// defaults fill whatever is missing.
#[derive(Clone, Default)]
pub struct DatabricksConnector {
    defaults: EngineConfig,
}

impl DatabricksConnector {
    pub fn new(defaults: EngineConfig) -> Self {
        Self { defaults }
    }
}

#[async_trait]
impl EngineConnector for DatabricksConnector {
    async fn connect(
        &self,
        details: &ConnectionDetails,
    ) -> Result<Arc<dyn QueryEngine>, EngineError> {
        let merged = details.merged_with(&self.defaults.to_connection_details());
        let engine = DatabricksEngine::new(
            &merged,
            Duration::from_secs(self.defaults.request_timeout_secs),
        )?;
        info!(
            "Connected to warehouse {} at {}",
            engine.warehouse_id,
            engine.endpoint.host_str().unwrap_or_default()
        );
        Ok(Arc::new(engine))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn details() -> ConnectionDetails {
        ConnectionDetails {
            server_hostname: Some("adb-123.azuredatabricks.net".to_string()),
            http_path: Some("/sql/1.0/warehouses/abc123".to_string()),
            access_token: Some("dapi-token".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_statements_url() {
        assert_eq!(
            statements_url("adb-123.azuredatabricks.net").unwrap().as_str(),
            "https://adb-123.azuredatabricks.net/api/2.0/sql/statements"
        );
        assert_eq!(
            statements_url("http://localhost:8080/").unwrap().as_str(),
            "http://localhost:8080/api/2.0/sql/statements"
        );
    }

    #[test]
    fn test_engine_requires_complete_details() {
        let mut incomplete = details();
        incomplete.access_token = None;
        let err = DatabricksEngine::new(&incomplete, Duration::from_secs(5)).unwrap_err();
        assert!(err.is_fatal());
        assert!(err.to_string().contains("access_token"));
    }

    #[test]
    fn test_debug_hides_token() {
        let engine = DatabricksEngine::new(&details(), Duration::from_secs(5)).unwrap();
        assert_eq!(engine.warehouse_id(), "abc123");
        assert!(!format!("{:?}", engine).contains("dapi-token"));
    }

    #[test]
    fn test_connector_fills_gaps_from_defaults() {
        let connector = DatabricksConnector::new(EngineConfig {
            access_token: Some("from-config".to_string()),
            ..Default::default()
        });
        let mut request = details();
        request.access_token = None;

        tokio_test::assert_ok!(tokio_test::block_on(connector.connect(&request)));
        assert!(tokio_test::block_on(connector.connect(&ConnectionDetails::default())).is_err());
    }
}
