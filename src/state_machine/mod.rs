mod job;
mod state;

pub use job::{AuditRecord, GenerationRequest, Progress, RetryConfig, TransitionRecord};
pub use state::{
    FailureReason, GenerationStatus, StateMachine, StatusUpdate, Transition, UpdateKind,
    UpdateSource,
};
