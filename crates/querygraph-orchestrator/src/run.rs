use crate::fragments::{Fragment, FragmentSet};
use querygraph_core::{InvalidTransition, RunState, ValidationStatus};
use querygraph_graph::{BrokenEdge, BuildOrder};
use serde::Serialize;
use std::fmt;
use uuid::Uuid;

/// Why a run ended in failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Extraction,
    EngineConnectivity,
    NoViableBaseEntity,
    /// Assembled, but the final smoke test failed. The query text is kept.
    FinalValidation,
    /// The pipeline broke its own state machine or narration contract.
    Internal,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FailureKind::Extraction => "extraction failure",
            FailureKind::EngineConnectivity => "engine connectivity failure",
            FailureKind::NoViableBaseEntity => "no viable base entity",
            FailureKind::FinalValidation => "final validation failure",
            FailureKind::Internal => "internal error",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum RunStatus {
    Succeeded,
    SucceededWithWarnings,
    Failed(FailureKind),
    /// The event receiver went away before the run finished.
    Abandoned,
}

impl RunStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, RunStatus::Succeeded | RunStatus::SucceededWithWarnings)
    }
}

/// Everything a caller can inspect once a run is over.
#[derive(Debug, Clone, Serialize)]
pub struct RunOutcome {
    pub run_id: Uuid,
    pub status: RunStatus,
    pub state: RunState,
    pub final_query: Option<String>,
    pub warnings: Vec<String>,
    pub error: Option<String>,
    pub broken_edges: Vec<BrokenEdge>,
    pub build_order: BuildOrder,
    pub fragments: Vec<Fragment>,
}

impl RunOutcome {
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// Validation status recorded with the query version.
    pub fn validation_status(&self) -> ValidationStatus {
        match self.status {
            RunStatus::Succeeded => ValidationStatus::Passed,
            RunStatus::SucceededWithWarnings => ValidationStatus::Warnings,
            RunStatus::Failed(FailureKind::FinalValidation) => ValidationStatus::Failed,
            _ => ValidationStatus::NotValidated,
        }
    }
}

/// Mutable state of one orchestration run.
#[derive(Debug)]
pub struct OrchestrationRun {
    id: Uuid,
    state: RunState,
    pub broken_edges: Vec<BrokenEdge>,
    pub build_order: BuildOrder,
    pub fragments: FragmentSet,
    pub final_query: Option<String>,
}

impl OrchestrationRun {
    pub fn new(id: Uuid) -> Self {
        Self {
            id,
            state: RunState::Started,
            broken_edges: Vec::new(),
            build_order: BuildOrder::default(),
            fragments: FragmentSet::new(),
            final_query: None,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn advance(&mut self, next: RunState) -> Result<(), InvalidTransition> {
        self.state.advance(next)
    }

    pub fn into_outcome(
        self,
        status: RunStatus,
        warnings: Vec<String>,
        error: Option<String>,
    ) -> RunOutcome {
        RunOutcome {
            run_id: self.id,
            status,
            state: self.state,
            final_query: self.final_query,
            warnings,
            error,
            broken_edges: self.broken_edges,
            build_order: self.build_order,
            fragments: self.fragments.iter().cloned().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_moves_forward_only() {
        let mut run = OrchestrationRun::new(Uuid::new_v4());
        run.advance(RunState::Parsing).unwrap();
        assert!(run.advance(RunState::OrderPlanned).is_err());
        assert!(run.advance(RunState::Started).is_err());
        run.advance(RunState::Failed).unwrap();
        assert!(run.advance(RunState::Parsing).is_err());
        assert_eq!(run.state(), RunState::Failed);
    }

    #[test]
    fn test_outcome_keeps_query_on_final_validation_failure() {
        let mut run = OrchestrationRun::new(Uuid::new_v4());
        run.final_query = Some("SELECT 1".to_string());
        let outcome = run.into_outcome(
            RunStatus::Failed(FailureKind::FinalValidation),
            Vec::new(),
            Some("query rejected".to_string()),
        );
        assert!(!outcome.is_success());
        assert_eq!(outcome.final_query.as_deref(), Some("SELECT 1"));
        assert_eq!(outcome.validation_status(), ValidationStatus::Failed);
    }

    #[test]
    fn test_status_serialization() {
        let json = serde_json::to_string(&RunStatus::Failed(FailureKind::NoViableBaseEntity)).unwrap();
        assert_eq!(json, r#"{"status":"failed","reason":"no_viable_base_entity"}"#);
        assert_eq!(
            serde_json::to_string(&RunStatus::Succeeded).unwrap(),
            r#"{"status":"succeeded"}"#
        );
    }
}
