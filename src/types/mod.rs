//! Domain types: submissions, stage records, the per-submission state machine
//! and the bus message contracts.

mod messages;
mod state;
mod submission;

pub use messages::{topics, StageFailure, StageInput, StageResult};
pub use state::{
    CompletionResult, EventOutcome, FailureReport, OverallStatus, StaleReason, SubmissionState,
    Transition, TIMEOUT_ERROR,
};
pub use submission::{
    StageKind, StagePayload, StageRecord, StageStatus, Submission, UnknownStageKind,
};
