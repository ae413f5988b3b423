#![allow(dead_code)]

use async_trait::async_trait;
use querygraph_core::{
    ConnectionDetails, EngineConnector, EngineError, Entity, Filter, JoinKind, MappingExtractor,
    OutputColumn, QueryEngine, QueryGraphError, QueryResult, Relationship, Result,
    StructuredMapping,
};
use querygraph_orchestrator::{Narrator, ProgressEvent, RunOutcome};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Engine double: rejects queries containing any configured pattern, fails
/// with a connectivity error or stalls on others, and records everything it
/// receives.
#[derive(Default)]
pub struct ScriptedEngine {
    reject: Vec<String>,
    unreachable: Vec<String>,
    stall: Vec<String>,
    queries: Mutex<Vec<String>>,
}

impl ScriptedEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rejecting(mut self, pattern: &str) -> Self {
        self.reject.push(pattern.to_string());
        self
    }

    pub fn unreachable_on(mut self, pattern: &str) -> Self {
        self.unreachable.push(pattern.to_string());
        self
    }

    /// Matching queries never answer within any sane timeout.
    pub fn stalling_on(mut self, pattern: &str) -> Self {
        self.stall.push(pattern.to_string());
        self
    }

    pub fn queries(&self) -> Vec<String> {
        self.queries.lock().unwrap().clone()
    }
}

#[async_trait]
impl QueryEngine for ScriptedEngine {
    async fn execute(
        &self,
        sql: &str,
        _timeout: Duration,
    ) -> std::result::Result<QueryResult, EngineError> {
        self.queries.lock().unwrap().push(sql.to_string());
        if self.stall.iter().any(|p| sql.contains(p.as_str())) {
            tokio::time::sleep(Duration::from_secs(24 * 3600)).await;
        }
        if self.unreachable.iter().any(|p| sql.contains(p.as_str())) {
            return Err(EngineError::Connectivity("connection reset".to_string()));
        }
        if let Some(pattern) = self.reject.iter().find(|p| sql.contains(p.as_str())) {
            return Err(EngineError::Rejected(format!("scripted rejection of '{}'", pattern)));
        }
        Ok(QueryResult::new(vec!["n".to_string()], vec![vec![serde_json::json!(1)]]))
    }
}

/// Hands out one shared engine and remembers the details it was asked for.
pub struct ScriptedConnector {
    pub engine: Arc<ScriptedEngine>,
    pub seen: Mutex<Vec<ConnectionDetails>>,
    refuse: bool,
}

impl ScriptedConnector {
    pub fn new(engine: ScriptedEngine) -> Self {
        Self {
            engine: Arc::new(engine),
            seen: Mutex::new(Vec::new()),
            refuse: false,
        }
    }

    pub fn refusing() -> Self {
        Self {
            refuse: true,
            ..Self::new(ScriptedEngine::new())
        }
    }
}

#[async_trait]
impl EngineConnector for ScriptedConnector {
    async fn connect(
        &self,
        details: &ConnectionDetails,
    ) -> std::result::Result<Arc<dyn QueryEngine>, EngineError> {
        self.seen.lock().unwrap().push(details.clone());
        if self.refuse {
            return Err(EngineError::Connectivity("warehouse is stopped".to_string()));
        }
        Ok(self.engine.clone())
    }
}

pub struct StaticExtractor(pub StructuredMapping);

#[async_trait]
impl MappingExtractor for StaticExtractor {
    async fn extract(&self, _raw_text: &str) -> Result<StructuredMapping> {
        Ok(self.0.clone())
    }
}

pub struct FailingExtractor;

#[async_trait]
impl MappingExtractor for FailingExtractor {
    async fn extract(&self, _raw_text: &str) -> Result<StructuredMapping> {
        Err(QueryGraphError::Extraction(
            "response is not a structured mapping".to_string(),
        ))
    }
}

/// Orders joined to customers, filtered on open orders.
pub fn orders_customers() -> StructuredMapping {
    StructuredMapping {
        entities: vec![
            Entity::new("orders").with_schema("sales"),
            Entity::new("customers"),
        ],
        relationships: vec![Relationship::new(
            "orders",
            "customers",
            JoinKind::Inner,
            "orders.customer_id = customers.id",
        )],
        output_columns: vec![OutputColumn::new("customers", "name").with_alias("customer_name")],
        filters: vec![Filter::new("orders", "status", "=", "'open'")],
        ..Default::default()
    }
}

pub fn entities(names: &[&str]) -> Vec<Entity> {
    names.iter().map(|name| Entity::new(*name)).collect()
}

pub fn left_join(left: &str, right: &str) -> Relationship {
    Relationship::new(
        left,
        right,
        JoinKind::Left,
        format!("{}.{}_id = {}.id", left, right, right),
    )
}

/// Runs against a fresh narrator and returns every event with the outcome.
pub async fn run_collect(
    orchestrator: &querygraph_orchestrator::Orchestrator,
    mapping: StructuredMapping,
) -> (Vec<ProgressEvent>, RunOutcome) {
    let (mut narrator, mut rx) = Narrator::channel(1024);
    let outcome = orchestrator
        .run_mapping(mapping, &ConnectionDetails::default(), &mut narrator)
        .await;
    drop(narrator);

    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }
    (events, outcome)
}

pub fn count_kind(events: &[ProgressEvent], kind: &str) -> usize {
    events.iter().filter(|e| e.kind() == kind).count()
}
