//! The resumable phase state machine.
//!
//! - [`state`]: persisted [`WorkflowState`] and its [`StateStore`]
//! - [`phases`]: phase tables per [`WorkflowPath`]
//! - [`transitions`]: pure `(state, results) -> state` functions
//! - [`machine`]: [`WorkflowMachine`], the only writer of workflow state
//! - [`effects`]: the [`PhaseEffects`] seam and its live implementation
//! - [`prompts`] / [`publish`]: per-phase prompts and the final publish step

pub mod effects;
pub mod machine;
pub mod phases;
pub mod prompts;
pub mod publish;
pub mod state;
pub mod transitions;

pub use effects::{LiveEffects, PhaseEffects};
pub use machine::{MachineSettings, WorkflowMachine, WorkflowRun};
pub use phases::{DECISION_PHASE, PhaseKind, last_phase, phase_kind, phases};
pub use prompts::PromptLibrary;
pub use publish::PublishReport;
pub use state::{StateStore, TaskStatus, WorkflowPath, WorkflowState};
pub use transitions::{Halt, PhaseInput, Transition, apply};
