use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Lifecycle of one orchestration run. Transitions are strictly forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Started,
    Parsing,
    GraphBuilt,
    OrderPlanned,
    BuildingFragments,
    Assembling,
    FinalValidation,
    Succeeded,
    SucceededWithWarnings,
    Failed,
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("invalid run transition {from} -> {to}")]
pub struct InvalidTransition {
    pub from: RunState,
    pub to: RunState,
}

impl RunState {
    fn stage(&self) -> u8 {
        match self {
            RunState::Started => 0,
            RunState::Parsing => 1,
            RunState::GraphBuilt => 2,
            RunState::OrderPlanned => 3,
            RunState::BuildingFragments => 4,
            RunState::Assembling => 5,
            RunState::FinalValidation => 6,
            RunState::Succeeded | RunState::SucceededWithWarnings | RunState::Failed => 7,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunState::Succeeded | RunState::SucceededWithWarnings | RunState::Failed
        )
    }

    /// A run may fail from any live state; every other move is exactly one stage forward.
    pub fn can_advance_to(&self, next: RunState) -> bool {
        if self.is_terminal() {
            return false;
        }
        if next == RunState::Failed {
            return true;
        }
        next.stage() == self.stage() + 1
    }

    pub fn advance(&mut self, next: RunState) -> Result<(), InvalidTransition> {
        if !self.can_advance_to(next) {
            return Err(InvalidTransition {
                from: *self,
                to: next,
            });
        }
        *self = next;
        Ok(())
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunState::Started => "started",
            RunState::Parsing => "parsing",
            RunState::GraphBuilt => "graph_built",
            RunState::OrderPlanned => "order_planned",
            RunState::BuildingFragments => "building_fragments",
            RunState::Assembling => "assembling",
            RunState::FinalValidation => "final_validation",
            RunState::Succeeded => "succeeded",
            RunState::SucceededWithWarnings => "succeeded_with_warnings",
            RunState::Failed => "failed",
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
