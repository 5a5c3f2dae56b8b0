//! Submission state machine
//!
//! `SubmissionState` holds every `StageRecord` for one submission and applies
//! stage events to them. All methods are pure: they mutate the state in place
//! and return a `Transition` describing what the caller must publish. The
//! tracker runs them inside a compare-and-swap loop, so a transition is only
//! acted on once its state has been committed.
//!
//! ```text
//!   start ──► Transcription ─┐
//!         └─► AudioFeatures ─┴─► Grammar, Pronunciation, Lexical, Fluency ──► Completed
//!   any stage Failed (fatal or budget exhausted) ─────────────────────────────► Failed
//! ```

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::submission::{StageKind, StagePayload, StageRecord, StageStatus, Submission};

/// Error recorded when a dispatched stage stays silent past its deadline.
pub const TIMEOUT_ERROR: &str = "stage timed out";

// ============================================================================
// Overall status and completion
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OverallStatus {
    Running,
    Completed,
    Failed,
}

impl OverallStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }
}

/// Aggregated outcome, published once on `submission.completed`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionResult {
    pub submission_id: String,
    /// Results of every stage that succeeded
    pub per_stage_results: BTreeMap<StageKind, StagePayload>,
    pub overall_status: OverallStatus,
    /// Stage that aborted the submission (Failed only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_stage: Option<StageKind>,
    /// Last error of the failed stage (Failed only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub completed_at: DateTime<Utc>,
}

// ============================================================================
// Transitions
// ============================================================================

/// Why an event was ignored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum StaleReason {
    /// No active state exists for the submission
    UnknownSubmission,
    /// The submission already reached Completed or Failed
    Terminal,
    /// The stage has no attempt in flight
    NotDispatched,
    /// A failure for an attempt that has since been superseded
    AttemptMismatch { current: u32, reported: u32 },
}

/// What an event did to the state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum EventOutcome {
    /// A new submission was created and its entry stages dispatched
    Created,
    /// A stage result or failure was recorded
    Applied,
    /// A failure was recorded and the stage re-dispatched
    Retried,
    /// The event repeats one already applied
    Duplicate,
    Stale(StaleReason),
}

/// Side effects owed after a committed state change.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub outcome: EventOutcome,
    /// Stages whose input must be published (newly dispatched or retried)
    pub dispatch: Vec<StageKind>,
    /// Set on the single transition into a terminal status
    pub completion: Option<CompletionResult>,
}

impl Transition {
    fn ignored(outcome: EventOutcome) -> Self {
        Self {
            outcome,
            dispatch: Vec::new(),
            completion: None,
        }
    }

    fn stale(reason: StaleReason) -> Self {
        Self::ignored(EventOutcome::Stale(reason))
    }
}

/// A failure as reported by a worker or synthesised by the timeout sweep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureReport {
    pub error: String,
    pub retryable: bool,
    /// Attempt the failure refers to, when the reporter knows it
    pub attempt: Option<u32>,
}

impl FailureReport {
    pub fn timeout(attempt: u32) -> Self {
        Self {
            error: TIMEOUT_ERROR.to_string(),
            retryable: true,
            attempt: Some(attempt),
        }
    }
}

// ============================================================================
// Submission State
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmissionState {
    pub submission: Submission,
    pub stages: BTreeMap<StageKind, StageRecord>,
    pub overall_status: OverallStatus,
    /// Built on the terminal transition; kept until it has been published
    #[serde(default)]
    pub completion: Option<CompletionResult>,
    #[serde(default)]
    pub completion_published: bool,
    /// When the current publisher of `completion` took it on
    #[serde(default)]
    pub completion_claimed_at: Option<DateTime<Utc>>,
}

impl SubmissionState {
    /// Fresh state with every stage `Pending`.
    pub fn new(submission: Submission) -> Self {
        let stages = StageKind::ALL
            .into_iter()
            .map(|kind| (kind, StageRecord::new(submission.id.clone(), kind)))
            .collect();
        Self {
            submission,
            stages,
            overall_status: OverallStatus::Running,
            completion: None,
            completion_published: false,
            completion_claimed_at: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.submission.id
    }

    pub fn is_terminal(&self) -> bool {
        self.overall_status.is_terminal()
    }

    pub fn stage(&self, kind: StageKind) -> Option<&StageRecord> {
        self.stages.get(&kind)
    }

    pub fn status_of(&self, kind: StageKind) -> StageStatus {
        self.stage(kind).map_or(StageStatus::Pending, |r| r.status)
    }

    /// Attempt number currently in flight for `kind`.
    pub fn current_attempt(&self, kind: StageKind) -> u32 {
        self.stage(kind).map_or(1, StageRecord::current_attempt)
    }

    fn record_mut(&mut self, kind: StageKind) -> &mut StageRecord {
        let id = self.submission.id.clone();
        self.stages
            .entry(kind)
            .or_insert_with(|| StageRecord::new(id, kind))
    }

    /// Results of the given stages that have succeeded.
    pub fn results_for(&self, kinds: &[StageKind]) -> BTreeMap<StageKind, StagePayload> {
        kinds
            .iter()
            .filter_map(|kind| {
                let record = self.stage(*kind)?;
                match (&record.status, &record.result) {
                    (StageStatus::Succeeded, Some(payload)) => Some((*kind, payload.clone())),
                    _ => None,
                }
            })
            .collect()
    }

    /// Pending stages whose dependencies have all succeeded.
    pub fn ready_stages(&self) -> Vec<StageKind> {
        StageKind::ALL
            .into_iter()
            .filter(|kind| self.status_of(*kind) == StageStatus::Pending)
            .filter(|kind| {
                kind.dependencies()
                    .iter()
                    .all(|dep| self.status_of(*dep) == StageStatus::Succeeded)
            })
            .collect()
    }

    fn all_succeeded(&self) -> bool {
        StageKind::ALL
            .into_iter()
            .all(|kind| self.status_of(kind) == StageStatus::Succeeded)
    }

    fn mark_dispatched(&mut self, kind: StageKind, now: DateTime<Utc>) {
        let record = self.record_mut(kind);
        record.status = StageStatus::Dispatched;
        record.dispatched_at = Some(now);
        record.input_published = false;
    }

    fn dispatch_ready(&mut self, now: DateTime<Utc>) -> Vec<StageKind> {
        let ready = self.ready_stages();
        for kind in &ready {
            self.mark_dispatched(*kind, now);
        }
        ready
    }

    fn finish(
        &mut self,
        status: OverallStatus,
        failure: Option<(StageKind, String)>,
        now: DateTime<Utc>,
    ) -> CompletionResult {
        let (failed_stage, error) = match failure {
            Some((kind, err)) => (Some(kind), Some(err)),
            None => (None, None),
        };
        let completion = CompletionResult {
            submission_id: self.submission.id.clone(),
            per_stage_results: self.results_for(&StageKind::ALL),
            overall_status: status,
            failed_stage,
            error,
            completed_at: now,
        };
        self.overall_status = status;
        self.completion = Some(completion.clone());
        self.completion_published = false;
        // The event that finishes the submission publishes its completion
        self.completion_claimed_at = Some(now);
        completion
    }

    /// Dispatch every stage with no dependencies.
    pub fn start(&mut self, now: DateTime<Utc>) -> Transition {
        if self.is_terminal() || self.stages.values().any(|r| r.status != StageStatus::Pending) {
            return Transition::ignored(EventOutcome::Duplicate);
        }
        Transition {
            outcome: EventOutcome::Created,
            dispatch: self.dispatch_ready(now),
            completion: None,
        }
    }

    /// Record a successful stage result.
    ///
    /// Readiness is re-evaluated on every success, so stage 2 is dispatched by
    /// whichever stage 1 result commits second, whatever the arrival order.
    pub fn apply_result(
        &mut self,
        kind: StageKind,
        payload: StagePayload,
        now: DateTime<Utc>,
    ) -> Transition {
        if self.is_terminal() {
            return Transition::stale(StaleReason::Terminal);
        }
        match self.status_of(kind) {
            StageStatus::Succeeded => return Transition::ignored(EventOutcome::Duplicate),
            StageStatus::Pending => return Transition::stale(StaleReason::NotDispatched),
            StageStatus::Failed => return Transition::stale(StaleReason::Terminal),
            StageStatus::Dispatched => {}
        }

        let record = self.record_mut(kind);
        record.status = StageStatus::Succeeded;
        record.result = Some(payload);
        record.completed_at = Some(now);

        let dispatch = self.dispatch_ready(now);
        let completion = if self.all_succeeded() {
            Some(self.finish(OverallStatus::Completed, None, now))
        } else {
            None
        };

        Transition {
            outcome: EventOutcome::Applied,
            dispatch,
            completion,
        }
    }

    /// Record a stage failure, re-dispatching while the retry budget allows.
    ///
    /// `max_attempts` bounds the total attempts per stage: a stage may fail
    /// `max_attempts - 1` times and still be retried.
    pub fn apply_failure(
        &mut self,
        kind: StageKind,
        failure: FailureReport,
        max_attempts: u32,
        now: DateTime<Utc>,
    ) -> Transition {
        if self.is_terminal() {
            return Transition::stale(StaleReason::Terminal);
        }
        if self.status_of(kind) != StageStatus::Dispatched {
            return Transition::stale(StaleReason::NotDispatched);
        }
        let current = self.current_attempt(kind);
        if let Some(reported) = failure.attempt {
            if reported != current {
                return Transition::stale(StaleReason::AttemptMismatch { current, reported });
            }
        }

        let record = self.record_mut(kind);
        record.attempt_count = record.attempt_count.saturating_add(1);
        record.last_error = Some(failure.error.clone());

        if failure.retryable && record.attempt_count < max_attempts {
            record.dispatched_at = Some(now);
            record.input_published = false;
            return Transition {
                outcome: EventOutcome::Retried,
                dispatch: vec![kind],
                completion: None,
            };
        }

        record.status = StageStatus::Failed;
        record.completed_at = Some(now);
        let completion = self.finish(OverallStatus::Failed, Some((kind, failure.error)), now);

        Transition {
            outcome: EventOutcome::Applied,
            dispatch: Vec::new(),
            completion: Some(completion),
        }
    }

    /// Whether the in-flight attempt of `kind` reached the bus and has since
    /// outlived `timeout`. An input that never left the coordinator is not a
    /// silent worker and does not expire.
    pub fn is_expired(&self, kind: StageKind, now: DateTime<Utc>, timeout: Duration) -> bool {
        if self.is_terminal() {
            return false;
        }
        match self.stage(kind) {
            Some(record) if record.status == StageStatus::Dispatched && record.input_published => {
                record
                    .dispatched_at
                    .map_or(true, |sent| now.signed_duration_since(sent) >= timeout)
            }
            _ => false,
        }
    }

    /// Record that `attempt` of `kind` was accepted by the bus.
    ///
    /// Ignored once the stage moved on (answered, retried or finished). The
    /// stage deadline restarts from `now`.
    pub fn mark_input_published(&mut self, kind: StageKind, attempt: u32, now: DateTime<Utc>) {
        if self.is_terminal() || self.current_attempt(kind) != attempt {
            return;
        }
        let record = self.record_mut(kind);
        if record.status == StageStatus::Dispatched && !record.input_published {
            record.input_published = true;
            record.dispatched_at = Some(now);
        }
    }

    /// Take over dispatched inputs that never reached the bus and whose last
    /// publisher has had `lease` to deliver them. Does not touch the retry
    /// budget.
    pub fn claim_unsent_inputs(&mut self, now: DateTime<Utc>, lease: Duration) -> Vec<StageKind> {
        if self.is_terminal() {
            return Vec::new();
        }
        let claimed: Vec<StageKind> = self
            .stages
            .values()
            .filter(|r| r.status == StageStatus::Dispatched && !r.input_published)
            .filter(|r| {
                r.dispatched_at
                    .map_or(true, |at| now.signed_duration_since(at) >= lease)
            })
            .map(|r| r.kind)
            .collect();
        for kind in &claimed {
            self.record_mut(*kind).dispatched_at = Some(now);
        }
        claimed
    }

    /// Take over publication of an unsent completion whose current publisher
    /// has held it for at least `lease`.
    pub fn claim_completion(
        &mut self,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Option<CompletionResult> {
        if self.completion_published {
            return None;
        }
        let completion = self.completion.clone()?;
        let free = self
            .completion_claimed_at
            .map_or(true, |at| now.signed_duration_since(at) >= lease);
        if !free {
            return None;
        }
        self.completion_claimed_at = Some(now);
        Some(completion)
    }

    /// Give up a completion claim after a failed publish.
    pub fn release_completion(&mut self) {
        if !self.completion_published {
            self.completion_claimed_at = None;
        }
    }

    /// Dispatched stages that have outlived `timeout`.
    pub fn expired_stages(&self, now: DateTime<Utc>, timeout: Duration) -> Vec<StageKind> {
        StageKind::ALL
            .into_iter()
            .filter(|kind| self.is_expired(*kind, now, timeout))
            .collect()
    }
}
