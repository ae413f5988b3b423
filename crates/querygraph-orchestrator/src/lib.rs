pub mod assembler;
pub mod events;
pub mod fragments;
pub mod orchestrator;
pub mod run;

pub use assembler::*;
pub use events::*;
pub use fragments::*;
pub use orchestrator::*;
pub use run::*;
