//! The generation pipeline.
//!
//! One run walks `Started -> Parsing -> GraphBuilt -> OrderPlanned ->
//! BuildingFragments -> Assembling -> FinalValidation` and ends in a terminal
//! state. Every stage narrates through the run's [`Narrator`]; validation
//! calls are made one at a time against the engine opened for the run.

use crate::assembler::{final_smoke_query, Assembler};
use crate::events::{NarrationError, Narrator, ProgressEvent};
use crate::fragments::{FragmentBuilder, Validation};
use crate::run::{FailureKind, OrchestrationRun, RunOutcome, RunStatus};
use futures::stream::{self, Stream};
use querygraph_core::{
    ConnectionDetails, EngineConnector, EngineError, InvalidTransition, MappingExtractor,
    OrchestratorConfig, QueryEngine, RunState, SessionStore, StructuredMapping,
};
use querygraph_graph::{find_cycle, plan_build_order, resolve_cycles, DependencyGraph};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Why the pipeline stopped before producing a query.
#[derive(Debug)]
enum Halt {
    Abandoned,
    Failed(FailureKind, String),
}

impl From<NarrationError> for Halt {
    fn from(err: NarrationError) -> Self {
        match err {
            NarrationError::Abandoned => Halt::Abandoned,
            NarrationError::AlreadyTerminated => Halt::Failed(FailureKind::Internal, err.to_string()),
        }
    }
}

impl From<InvalidTransition> for Halt {
    fn from(err: InvalidTransition) -> Self {
        Halt::Failed(FailureKind::Internal, err.to_string())
    }
}

fn connectivity(err: EngineError) -> Halt {
    Halt::Failed(FailureKind::EngineConnectivity, err.to_string())
}

enum Input {
    Raw(String),
    Mapping(StructuredMapping),
}

/// A spawned run: its progress events and, once finished, its outcome.
pub struct RunHandle {
    pub run_id: Uuid,
    pub events: mpsc::Receiver<ProgressEvent>,
    pub outcome: JoinHandle<RunOutcome>,
}

impl RunHandle {
    /// Drains every event, then waits for the outcome.
    pub async fn collect(mut self) -> Result<(Vec<ProgressEvent>, RunOutcome), JoinError> {
        let mut events = Vec::new();
        while let Some(event) = self.events.recv().await {
            events.push(event);
        }
        let outcome = self.outcome.await?;
        Ok((events, outcome))
    }

    pub fn into_stream(self) -> (impl Stream<Item = ProgressEvent> + Send, JoinHandle<RunOutcome>) {
        let events = stream::unfold(self.events, |mut rx| async move {
            rx.recv().await.map(|event| (event, rx))
        });
        (events, self.outcome)
    }
}

#[derive(Clone)]
pub struct Orchestrator {
    connector: Arc<dyn EngineConnector>,
    extractor: Option<Arc<dyn MappingExtractor>>,
    sessions: Option<Arc<dyn SessionStore>>,
    config: OrchestratorConfig,
}

impl Orchestrator {
    pub fn new(connector: Arc<dyn EngineConnector>, config: OrchestratorConfig) -> Self {
        Self {
            connector,
            extractor: None,
            sessions: None,
            config,
        }
    }

    pub fn with_extractor(mut self, extractor: Arc<dyn MappingExtractor>) -> Self {
        self.extractor = Some(extractor);
        self
    }

    pub fn with_session_store(mut self, sessions: Arc<dyn SessionStore>) -> Self {
        self.sessions = Some(sessions);
        self
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Spawns a run that starts from raw text.
    pub fn stream(&self, raw_text: impl Into<String>, details: ConnectionDetails) -> RunHandle {
        self.spawn(Input::Raw(raw_text.into()), details)
    }

    /// Spawns a run over an existing mapping, skipping extraction.
    pub fn stream_mapping(&self, mapping: StructuredMapping, details: ConnectionDetails) -> RunHandle {
        self.spawn(Input::Mapping(mapping), details)
    }

    fn spawn(&self, input: Input, details: ConnectionDetails) -> RunHandle {
        let (mut narrator, events) = Narrator::channel(self.config.event_buffer);
        let run_id = Uuid::new_v4();
        let this = self.clone();
        let outcome = tokio::spawn(async move {
            this.execute(run_id, input, &details, &mut narrator).await
        });
        RunHandle {
            run_id,
            events,
            outcome,
        }
    }

    #[instrument(skip(self, raw_text, details, narrator))]
    pub async fn run(
        &self,
        raw_text: &str,
        details: &ConnectionDetails,
        narrator: &mut Narrator,
    ) -> RunOutcome {
        self.execute(Uuid::new_v4(), Input::Raw(raw_text.to_string()), details, narrator)
            .await
    }

    #[instrument(skip(self, mapping, details, narrator), fields(entities = mapping.entities.len()))]
    pub async fn run_mapping(
        &self,
        mapping: StructuredMapping,
        details: &ConnectionDetails,
        narrator: &mut Narrator,
    ) -> RunOutcome {
        self.execute(Uuid::new_v4(), Input::Mapping(mapping), details, narrator)
            .await
    }

    async fn execute(
        &self,
        run_id: Uuid,
        input: Input,
        details: &ConnectionDetails,
        narrator: &mut Narrator,
    ) -> RunOutcome {
        info!("Starting run {}", run_id);
        let mut run = OrchestrationRun::new(run_id);
        if let Some(sessions) = &self.sessions {
            if let Err(e) = sessions.create_session(run_id).await {
                warn!("Failed to open session {}: {}", run_id, e);
            }
        }

        let result = self.pipeline(&mut run, input, details, narrator).await;
        self.finish(run, result, narrator).await
    }

    async fn pipeline(
        &self,
        run: &mut OrchestrationRun,
        input: Input,
        details: &ConnectionDetails,
        narrator: &mut Narrator,
    ) -> Result<String, Halt> {
        narrator.status("🤖 Starting query generation...").await?;

        // Parsing
        self.transition(run, RunState::Parsing, None).await?;
        let mapping = self.parse(input, narrator).await?;
        narrator
            .status(format!(
                "✅ Mapping ready - found {} tables, {} relationships",
                mapping.entities.len(),
                mapping.relationships.len()
            ))
            .await?;
        for rule in &mapping.business_rules {
            narrator.status(format!("📋 Business rule: {}", rule.rule)).await?;
        }

        // Graph and cycles
        narrator.status("🔗 Building dependency graph...").await?;
        let mut graph = DependencyGraph::from_mapping(&mapping);
        for &index in graph.skipped_relationships() {
            let rel = &mapping.relationships[index];
            debug!("Ignoring relationship {} -> {}: unknown entity", rel.left, rel.right);
        }
        self.transition(run, RunState::GraphBuilt, None).await?;

        narrator.status("🔄 Checking for cyclic references...").await?;
        match find_cycle(&graph) {
            Some(cycle) => {
                narrator
                    .warning(format!(
                        "⚠️ Cyclic reference detected: {}. Breaking edges to continue",
                        cycle.join(" -> ")
                    ))
                    .await?;
                run.broken_edges = resolve_cycles(&mut graph);
                for edge in &run.broken_edges {
                    narrator
                        .status(format!("🔧 Dropped dependency {}", edge.describe()))
                        .await?;
                }
                narrator.status("✅ Cyclic references resolved").await?;
            }
            None => narrator.status("✅ No cyclic references found").await?,
        }

        // Build order
        narrator.status("📋 Creating execution order...").await?;
        run.build_order = plan_build_order(&graph);
        for name in &run.build_order.unresolved {
            narrator
                .warning(format!("⚠️ {} has unresolved dependencies, placed last", name))
                .await?;
        }
        self.transition(run, RunState::OrderPlanned, None).await?;
        let sequence: Vec<String> = run.build_order.sequence().cloned().collect();
        narrator
            .status(format!(
                "✅ Execution order created - {} steps: {}",
                sequence.len(),
                sequence.join(" -> ")
            ))
            .await?;

        // Fragments
        self.transition(run, RunState::BuildingFragments, None).await?;
        narrator.status("🏗️ Building SQL components...").await?;
        let engine = self
            .connector
            .connect(&details.merged_with(&mapping.connection))
            .await
            .map_err(connectivity)?;
        let builder = FragmentBuilder::new(
            engine.clone(),
            Duration::from_secs(self.config.fragment_timeout_secs),
        );

        for name in &sequence {
            let Some(entity) = mapping.entity(name) else {
                continue;
            };
            narrator
                .status(format!("🧪 Testing table {}...", entity.qualified_name()))
                .await?;
            let fragment = builder.build_entity(entity).await.map_err(connectivity)?;
            match &fragment.validation {
                Validation::Passed => narrator.status(format!("✅ {} validated", name)).await?,
                Validation::Failed(reason) => {
                    narrator
                        .warning(format!("⚠️ Table {} failed validation: {}", name, reason))
                        .await?
                }
                Validation::Untested => {}
            }
            run.fragments.insert(fragment);
        }

        if !mapping.relationships.is_empty() {
            narrator.status("🔗 Testing JOIN sections...").await?;
        }
        for rel in &mapping.relationships {
            let fragment = builder
                .build_join(rel, mapping.entity(&rel.left), mapping.entity(&rel.right))
                .await
                .map_err(connectivity)?;
            match &fragment.validation {
                Validation::Passed => {
                    narrator
                        .status(format!("✅ Join {} -> {} validated", rel.left, rel.right))
                        .await?
                }
                Validation::Failed(reason) => {
                    narrator
                        .warning(format!(
                            "⚠️ Join {} -> {} failed validation: {}",
                            rel.left, rel.right, reason
                        ))
                        .await?
                }
                Validation::Untested => {}
            }
            run.fragments.insert(fragment);
        }

        // Assembly
        self.transition(run, RunState::Assembling, None).await?;
        narrator.status("🔧 Constructing final SQL...").await?;
        let assembled = Assembler::new(self.config.use_cte_preamble)
            .assemble(&mapping, &run.build_order, &run.fragments)
            .map_err(|e| Halt::Failed(FailureKind::NoViableBaseEntity, e.to_string()))?;
        for skipped in &assembled.skipped_joins {
            narrator.warning(format!("⚠️ {}", skipped.describe())).await?;
        }
        if !assembled.unconnected_entities.is_empty() {
            narrator
                .warning(format!(
                    "⚠️ Not joined to {}, left out of the query: {}",
                    assembled.anchor,
                    assembled.unconnected_entities.join(", ")
                ))
                .await?;
        }
        if !assembled.dropped_columns.is_empty() {
            narrator
                .warning(format!(
                    "⚠️ Output columns dropped, their tables are not in the query: {}",
                    assembled.dropped_columns.join(", ")
                ))
                .await?;
        }
        if !assembled.dropped_filters.is_empty() {
            narrator
                .warning(format!(
                    "⚠️ Filters dropped, their tables are not in the query: {}",
                    assembled.dropped_filters.join(", ")
                ))
                .await?;
        }
        if !assembled.deferred_filters.is_empty() {
            narrator
                .warning(format!(
                    "⚠️ Aggregate filters are not applied: {}",
                    assembled.deferred_filters.join(", ")
                ))
                .await?;
        }
        narrator
            .status(format!("📊 Assembled query:\n{}", assembled.sql))
            .await?;
        run.final_query = Some(assembled.sql.clone());

        // Final validation
        self.transition(run, RunState::FinalValidation, None).await?;
        narrator.status("🧪 Testing final SQL...").await?;
        self.final_validation(engine.as_ref(), &assembled.sql).await?;

        Ok(assembled.sql)
    }

    async fn parse(&self, input: Input, narrator: &mut Narrator) -> Result<StructuredMapping, Halt> {
        let extraction_failed = |reason: String| Halt::Failed(FailureKind::Extraction, reason);
        match input {
            Input::Raw(text) => {
                let extractor = self
                    .extractor
                    .as_ref()
                    .ok_or_else(|| extraction_failed("no mapping extractor configured".to_string()))?;
                narrator.status("🔍 Analyzing input structure...").await?;
                extractor
                    .extract(&text)
                    .await
                    .map_err(|e| extraction_failed(e.to_string()))
            }
            Input::Mapping(mapping) => {
                mapping.validate().map_err(|e| extraction_failed(e.to_string()))?;
                Ok(mapping)
            }
        }
    }

    async fn final_validation(&self, engine: &dyn QueryEngine, sql: &str) -> Result<(), Halt> {
        let timeout = Duration::from_secs(self.config.final_timeout_secs);
        let failed = |reason: String| {
            Halt::Failed(
                FailureKind::FinalValidation,
                format!("assembled query failed final validation: {}", reason),
            )
        };
        match tokio::time::timeout(timeout, engine.execute(&final_smoke_query(sql), timeout)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) if e.is_fatal() => Err(connectivity(e)),
            Ok(Err(e)) => Err(failed(e.to_string())),
            Err(_) => Err(failed(format!("timed out after {}s", timeout.as_secs()))),
        }
    }

    async fn transition(
        &self,
        run: &mut OrchestrationRun,
        next: RunState,
        detail: Option<String>,
    ) -> Result<(), InvalidTransition> {
        run.advance(next)?;
        debug!("Run {} -> {}", run.id(), next);
        if let Some(sessions) = &self.sessions {
            if let Err(e) = sessions.record_status(run.id(), next, detail).await {
                warn!("Failed to record status for session {}: {}", run.id(), e);
            }
        }
        Ok(())
    }

    async fn finish(
        &self,
        mut run: OrchestrationRun,
        result: Result<String, Halt>,
        narrator: &mut Narrator,
    ) -> RunOutcome {
        let (status, error) = match result {
            Ok(sql) => self.succeed(&mut run, sql, narrator).await,
            Err(Halt::Abandoned) => {
                info!("Run {} abandoned by its receiver", run.id());
                self.fail(&mut run, "abandoned".to_string()).await;
                (RunStatus::Abandoned, None)
            }
            Err(Halt::Failed(kind, message)) => {
                warn!("Run {} failed ({}): {}", run.id(), kind, message);
                self.fail(&mut run, message.clone()).await;
                let status = match narrator.error(format!("❌ {}", message)).await {
                    Err(NarrationError::Abandoned) => RunStatus::Abandoned,
                    _ => RunStatus::Failed(kind),
                };
                let _ = narrator.close("Query generation finished").await;
                (status, Some(message))
            }
        };

        let outcome = run.into_outcome(status, narrator.warnings().to_vec(), error);
        self.record_version(&outcome).await;
        info!("Run {} finished: {:?}", outcome.run_id, outcome.status);
        outcome
    }

    async fn succeed(
        &self,
        run: &mut OrchestrationRun,
        sql: String,
        narrator: &mut Narrator,
    ) -> (RunStatus, Option<String>) {
        let (status, state, message) = if narrator.warning_count() == 0 {
            (
                RunStatus::Succeeded,
                RunState::Succeeded,
                "✅ SQL generation completed successfully!".to_string(),
            )
        } else {
            (
                RunStatus::SucceededWithWarnings,
                RunState::SucceededWithWarnings,
                format!(
                    "✅ SQL generation completed with {} warning(s)",
                    narrator.warning_count()
                ),
            )
        };
        if let Err(e) = self.transition(run, state, None).await {
            let message = e.to_string();
            let _ = narrator.error(format!("❌ {}", message)).await;
            let _ = narrator.close("Query generation finished").await;
            return (RunStatus::Failed(FailureKind::Internal), Some(message));
        }

        if narrator.status(message).await.is_err() || narrator.sql_generated(sql).await.is_err() {
            return (RunStatus::Abandoned, None);
        }
        let _ = narrator.close("Query generation finished").await;
        (status, None)
    }

    async fn fail(&self, run: &mut OrchestrationRun, detail: String) {
        if let Err(e) = self.transition(run, RunState::Failed, Some(detail)).await {
            debug!("Run {} already terminal: {}", run.id(), e);
        }
    }

    async fn record_version(&self, outcome: &RunOutcome) {
        let (Some(sessions), Some(sql)) = (&self.sessions, &outcome.final_query) else {
            return;
        };
        match sessions
            .record_query_version(
                outcome.run_id,
                sql.clone(),
                outcome.validation_status(),
                outcome.warnings.clone(),
            )
            .await
        {
            Ok(version) => debug!("Session {} stored query version {}", outcome.run_id, version),
            Err(e) => warn!("Failed to store query version for {}: {}", outcome.run_id, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use querygraph_core::{Entity, QueryResult, SharedEngine};

    struct OkEngine;

    #[async_trait]
    impl QueryEngine for OkEngine {
        async fn execute(&self, _sql: &str, _timeout: Duration) -> Result<QueryResult, EngineError> {
            Ok(QueryResult::default())
        }
    }

    fn orchestrator() -> Orchestrator {
        Orchestrator::new(
            Arc::new(SharedEngine::new(Arc::new(OkEngine))),
            OrchestratorConfig::default(),
        )
    }

    fn single_table() -> StructuredMapping {
        StructuredMapping {
            entities: vec![Entity::new("orders")],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_stream_ends_with_sql_then_close() {
        let handle = orchestrator().stream_mapping(single_table(), ConnectionDetails::default());
        let (events, outcome) = handle.collect().await.unwrap();

        let kinds: Vec<&str> = events.iter().map(|e| e.kind()).collect();
        assert_eq!(&kinds[kinds.len() - 3..], &["status", "sql_generated", "close"]);
        assert_eq!(
            events[events.len() - 3].data(),
            "✅ SQL generation completed successfully!"
        );
        assert_eq!(outcome.status, RunStatus::Succeeded);
        assert_eq!(outcome.state, RunState::Succeeded);
        assert_eq!(outcome.final_query.as_deref(), Some("SELECT *\nFROM orders"));
    }

    #[tokio::test]
    async fn test_raw_text_without_extractor_fails_extraction() {
        let (mut narrator, _rx) = Narrator::channel(64);
        let outcome = orchestrator()
            .run("orders sheet", &ConnectionDetails::default(), &mut narrator)
            .await;
        assert_eq!(outcome.status, RunStatus::Failed(FailureKind::Extraction));
        assert_eq!(outcome.state, RunState::Failed);
    }

    #[tokio::test]
    async fn test_into_stream_yields_events_in_order() {
        use futures::StreamExt;

        let handle = orchestrator().stream_mapping(single_table(), ConnectionDetails::default());
        let (events, outcome) = handle.into_stream();
        let events: Vec<ProgressEvent> = events.collect().await;
        assert!(matches!(events.first(), Some(ProgressEvent::Status(_))));
        assert!(matches!(events.last(), Some(ProgressEvent::Close(_))));
        assert!(outcome.await.unwrap().is_success());
    }
}
