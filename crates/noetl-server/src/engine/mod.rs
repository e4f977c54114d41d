//! The execution engine: event fold, orchestration, and scheduling.

pub mod orchestrator;
pub mod projection;
pub mod scheduler;

pub use orchestrator::{
    CommandRequest, Completion, EngineError, EvalOutcome, EventDraft, Orchestrator,
};
pub use projection::{LoopFrame, Projection, StepProjection};
pub use scheduler::{Scheduler, SchedulerError};
