//! Databricks SQL Statement Execution API wire types.

use querygraph_core::{EngineError, QueryResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// The API only accepts a synchronous wait of 0 or 5 to 50 seconds.
pub(crate) fn wait_timeout(timeout: Duration) -> String {
    format!("{}s", timeout.as_secs().clamp(5, 50))
}

/// Extracts the warehouse id from `/sql/1.0/warehouses/<id>` or the older
/// `/sql/1.0/endpoints/<id>` form.
pub(crate) fn warehouse_id(http_path: &str) -> Option<String> {
    let mut segments = http_path.trim_matches('/').split('/');
    while let Some(segment) = segments.next() {
        if segment == "warehouses" || segment == "endpoints" {
            return segments
                .next()
                .filter(|id| !id.is_empty())
                .map(str::to_string);
        }
    }
    None
}

#[derive(Debug, Serialize)]
pub(crate) struct StatementRequest<'a> {
    pub statement: &'a str,
    pub warehouse_id: &'a str,
    pub wait_timeout: String,
    pub on_wait_timeout: &'static str,
    pub disposition: &'static str,
    pub format: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub catalog: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema: Option<&'a str>,
}

impl<'a> StatementRequest<'a> {
    pub fn new(statement: &'a str, warehouse_id: &'a str, timeout: Duration) -> Self {
        Self {
            statement,
            warehouse_id,
            wait_timeout: wait_timeout(timeout),
            on_wait_timeout: "CANCEL",
            disposition: "INLINE",
            format: "JSON_ARRAY",
            catalog: None,
            schema: None,
        }
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct StatementResponse {
    #[serde(default)]
    pub statement_id: Option<String>,
    pub status: StatementStatus,
    #[serde(default)]
    pub manifest: Option<Manifest>,
    #[serde(default)]
    pub result: Option<ResultChunk>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct StatementStatus {
    pub state: String,
    #[serde(default)]
    pub error: Option<ServiceError>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ServiceError {
    #[serde(default)]
    pub error_code: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

impl ServiceError {
    fn describe(&self) -> String {
        match (&self.error_code, &self.message) {
            (Some(code), Some(message)) => format!("{}: {}", code, message),
            (None, Some(message)) => message.clone(),
            (Some(code), None) => code.clone(),
            (None, None) => "unknown error".to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct Manifest {
    pub schema: ManifestSchema,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ManifestSchema {
    #[serde(default)]
    pub columns: Vec<ColumnInfo>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ColumnInfo {
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ResultChunk {
    #[serde(default)]
    pub data_array: Vec<Vec<serde_json::Value>>,
}

/// Error body returned with a non-success HTTP status.
#[derive(Debug, Deserialize)]
pub(crate) struct ApiError {
    #[serde(default)]
    pub error_code: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

impl StatementResponse {
    /// Maps the terminal statement state to a result. A statement still pending
    /// after the synchronous wait was cancelled by the service, so it counts as
    /// a timeout.
    pub fn into_result(self, timeout: Duration) -> Result<QueryResult, EngineError> {
        let error_text = || {
            self.status
                .error
                .as_ref()
                .map(ServiceError::describe)
                .unwrap_or_else(|| format!("statement {}", self.status.state.to_lowercase()))
        };

        match self.status.state.as_str() {
            "SUCCEEDED" => {}
            "FAILED" | "CLOSED" => return Err(EngineError::Rejected(error_text())),
            "CANCELED" | "PENDING" | "RUNNING" => return Err(EngineError::Timeout(timeout)),
            other => {
                return Err(EngineError::Rejected(format!(
                    "unexpected statement state {}",
                    other
                )))
            }
        }

        let columns = self
            .manifest
            .map(|m| m.schema.columns.into_iter().map(|c| c.name).collect())
            .unwrap_or_default();
        let rows = self.result.map(|r| r.data_array).unwrap_or_default();
        Ok(QueryResult::new(columns, rows))
    }
}

/// Classifies a non-success HTTP status. Bad statements come back as 400;
/// everything else means the warehouse cannot serve this run.
pub(crate) fn http_error(status: u16, body: &str) -> EngineError {
    let detail = serde_json::from_str::<ApiError>(body)
        .ok()
        .and_then(|e| match (e.error_code, e.message) {
            (Some(code), Some(message)) => Some(format!("{}: {}", code, message)),
            (_, Some(message)) => Some(message),
            (Some(code), None) => Some(code),
            (None, None) => None,
        })
        .unwrap_or_else(|| body.trim().to_string());

    match status {
        400 => EngineError::Rejected(detail),
        401 | 403 => EngineError::Connectivity(format!("authentication failed ({}): {}", status, detail)),
        _ => EngineError::Connectivity(format!("warehouse returned {}: {}", status, detail)),
    }
}
