//! Bus message contracts
//!
//! Payloads exchanged with intake, stage workers and the completion
//! publisher. Everything travels as JSON.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::state::{FailureReport, SubmissionState};
use super::submission::{StageKind, StagePayload};

/// Topic names.
pub mod topics {
    use super::StageKind;

    pub const SUBMISSION_CREATED: &str = "submission.created";
    pub const SUBMISSION_COMPLETED: &str = "submission.completed";

    pub fn stage_input(kind: StageKind) -> String {
        format!("stage.{}.input", kind.as_str())
    }

    pub fn stage_result(kind: StageKind) -> String {
        format!("stage.{}.result", kind.as_str())
    }

    pub fn stage_failure(kind: StageKind) -> String {
        format!("stage.{}.failure", kind.as_str())
    }
}

/// Work order sent to a stage worker on `stage.<kind>.input`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageInput {
    pub submission_id: String,
    pub kind: StageKind,
    /// 1-based attempt number; workers echo it back
    pub attempt: u32,
    pub audio_urls: Vec<String>,
    /// Outputs of the stages this one depends on (empty for stage 1)
    #[serde(default)]
    pub dependency_results: BTreeMap<StageKind, StagePayload>,
}

impl StageInput {
    /// Build the input for `kind` from a committed state snapshot.
    pub fn from_state(state: &SubmissionState, kind: StageKind) -> Self {
        Self {
            submission_id: state.submission.id.clone(),
            kind,
            attempt: state.current_attempt(kind),
            audio_urls: state.submission.audio_urls.clone(),
            dependency_results: state.results_for(kind.dependencies()),
        }
    }
}

/// Successful stage output on `stage.<kind>.result`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageResult {
    pub submission_id: String,
    pub kind: StageKind,
    pub payload: StagePayload,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempt: Option<u32>,
}

/// Worker-reported failure on `stage.<kind>.failure`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageFailure {
    pub submission_id: String,
    pub kind: StageKind,
    pub error: String,
    pub retryable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempt: Option<u32>,
}

impl StageFailure {
    pub fn report(&self) -> FailureReport {
        FailureReport {
            error: self.error.clone(),
            retryable: self.retryable,
            attempt: self.attempt,
        }
    }
}
