//! Pipeline Coordinator - dependency-gated fan-out/fan-in per submission
//!
//! ```text
//! submission.created ──► create state, dispatch stage 1
//! stage.<kind>.result ──► record, dispatch newly ready stage 2, maybe complete
//! stage.<kind>.failure ─► retry within budget, or fail the submission
//! sweep (timer) ────────► re-publish unsent inputs and completions,
//!                         time out stages whose worker went silent
//! ```
//!
//! Every event is one CAS update on the tracker entry. The update closure
//! only computes; publishing happens afterwards from the committed snapshot,
//! so a lost CAS race never leaks a dispatch.
//!
//! GUARANTEE: a submission's completion is built exactly once (on the CAS
//! that makes it terminal) and is archived only after it was published.
//! Publication is leased: the finishing event holds the claim, and the sweep
//! only takes it over once `publish_lease` has passed or the holder released
//! it after a failed publish.

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::bus::{publish_with_backoff, BackoffPolicy, BusError, MessageBus};
use crate::config::defaults::PUBLISH_LEASE_MARGIN_SECS;
use crate::config::PipelineConfig;
use crate::storage::{SubmissionTracker, TrackerError};
use crate::types::{
    topics, CompletionResult, EventOutcome, FailureReport, OverallStatus, StageFailure,
    StageInput, StageKind, StageResult, StaleReason, Submission, SubmissionState, Transition,
};

#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error(transparent)]
    Tracker(#[from] TrackerError),
    #[error(transparent)]
    Bus(#[from] BusError),
}

impl CoordinatorError {
    /// Whether the triggering message should be left unacknowledged.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Tracker(e) => e.is_transient(),
            Self::Bus(e) => e.is_transient(),
        }
    }
}

/// Coordinator tunables, derived from `PipelineConfig`.
#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    /// Total attempts per stage
    pub max_attempts: u32,
    pub stage_timeout: Duration,
    pub publish_backoff: BackoffPolicy,
    /// How long a publisher may hold an unsent input or completion before
    /// the sweep takes it over
    pub publish_lease: Duration,
}

impl CoordinatorSettings {
    /// Lease that outlasts the worst-case backoff of `policy`.
    pub fn lease_for(policy: &BackoffPolicy) -> Duration {
        policy.max_total_delay() + Duration::from_secs(PUBLISH_LEASE_MARGIN_SECS)
    }
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self::from(&PipelineConfig::default())
    }
}

impl From<&PipelineConfig> for CoordinatorSettings {
    fn from(config: &PipelineConfig) -> Self {
        let publish_backoff = BackoffPolicy::from(&config.publish);
        Self {
            max_attempts: config.retry.max_attempts.max(1),
            stage_timeout: config.timeouts.stage_timeout(),
            publish_lease: Self::lease_for(&publish_backoff),
            publish_backoff,
        }
    }
}

/// Point-in-time copy of the coordinator counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CoordinatorStats {
    pub submissions_accepted: u64,
    pub duplicates: u64,
    pub stale_events: u64,
    pub stages_dispatched: u64,
    pub retries: u64,
    pub timeouts: u64,
    pub completed: u64,
    pub failed: u64,
    pub publish_failures: u64,
}

#[derive(Default)]
struct Counters {
    submissions_accepted: AtomicU64,
    duplicates: AtomicU64,
    stale_events: AtomicU64,
    stages_dispatched: AtomicU64,
    retries: AtomicU64,
    timeouts: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    publish_failures: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// Result of one timeout sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub scanned: usize,
    pub redispatched: usize,
    pub timed_out: usize,
    pub republished: usize,
    pub archived: usize,
}

/// Publishes owed after a committed transition, captured from the new state.
struct Effects {
    outcome: EventOutcome,
    inputs: Vec<StageInput>,
    completion: Option<CompletionResult>,
}

impl Effects {
    fn capture(state: &SubmissionState, transition: Transition) -> Self {
        Self {
            inputs: transition
                .dispatch
                .iter()
                .map(|kind| StageInput::from_state(state, *kind))
                .collect(),
            outcome: transition.outcome,
            completion: transition.completion,
        }
    }
}

pub struct PipelineCoordinator {
    tracker: SubmissionTracker,
    bus: Arc<dyn MessageBus>,
    settings: CoordinatorSettings,
    counters: Counters,
}

impl PipelineCoordinator {
    pub fn new(
        tracker: SubmissionTracker,
        bus: Arc<dyn MessageBus>,
        settings: CoordinatorSettings,
    ) -> Self {
        info!(
            backend = tracker.backend_name(),
            max_attempts = settings.max_attempts,
            stage_timeout_secs = settings.stage_timeout.as_secs(),
            "Initializing pipeline coordinator"
        );
        Self {
            tracker,
            bus,
            settings,
            counters: Counters::default(),
        }
    }

    pub fn tracker(&self) -> &SubmissionTracker {
        &self.tracker
    }

    // ========================================================================
    // Event handlers
    // ========================================================================

    /// Create the submission's state and dispatch its entry stages.
    ///
    /// A second `submission.created` for a known id (running, finished or
    /// archived) changes nothing.
    pub async fn on_submission_created(
        &self,
        submission: Submission,
    ) -> Result<EventOutcome, CoordinatorError> {
        let now = Utc::now();
        let mut state = SubmissionState::new(submission);
        let transition = state.start(now);

        if !self.tracker.create_if_absent(&state)? {
            bump(&self.counters.duplicates);
            debug!(submission_id = %state.id(), "Duplicate submission.created ignored");
            return Ok(EventOutcome::Duplicate);
        }

        bump(&self.counters.submissions_accepted);
        info!(
            submission_id = %state.id(),
            audio_files = state.submission.audio_urls.len(),
            "Submission accepted"
        );
        let effects = Effects::capture(&state, transition);
        Ok(self.execute(state.id(), None, effects).await)
    }

    /// Record a stage success and dispatch whatever it unblocked.
    pub async fn on_stage_result(
        &self,
        result: StageResult,
    ) -> Result<EventOutcome, CoordinatorError> {
        let now = Utc::now();
        let StageResult {
            submission_id,
            kind,
            payload,
            ..
        } = result;

        let committed = self.tracker.update(&submission_id, |state| {
            let transition = state.apply_result(kind, payload.clone(), now);
            Effects::capture(state, transition)
        })?;

        let effects = match committed {
            Some(effects) => effects,
            None => self.missing_state(&submission_id)?,
        };
        Ok(self.execute(&submission_id, Some(kind), effects).await)
    }

    /// Record a stage failure: retry within budget or fail the submission.
    pub async fn on_stage_failure(
        &self,
        failure: StageFailure,
    ) -> Result<EventOutcome, CoordinatorError> {
        let now = Utc::now();
        let report = failure.report();
        let max_attempts = self.settings.max_attempts;

        let committed = self.tracker.update(&failure.submission_id, |state| {
            let transition = state.apply_failure(failure.kind, report.clone(), max_attempts, now);
            Effects::capture(state, transition)
        })?;

        let effects = match committed {
            Some(effects) => effects,
            None => self.missing_state(&failure.submission_id)?,
        };
        if effects.outcome == EventOutcome::Retried {
            warn!(
                submission_id = %failure.submission_id,
                kind = %failure.kind,
                error = %failure.error,
                "Stage failed, retrying"
            );
        }
        Ok(self
            .execute(&failure.submission_id, Some(failure.kind), effects)
            .await)
    }

    /// Stale outcome for an event whose submission has no active state.
    fn missing_state(&self, id: &str) -> Result<Effects, CoordinatorError> {
        let reason = if self.tracker.get_archived(id)?.is_some() {
            StaleReason::Terminal
        } else {
            StaleReason::UnknownSubmission
        };
        Ok(Effects {
            outcome: EventOutcome::Stale(reason),
            inputs: Vec::new(),
            completion: None,
        })
    }

    // ========================================================================
    // Timeout sweep
    // ========================================================================

    /// Finish publications a crash or bus outage left behind, then fail
    /// stages whose worker stayed silent past the stage timeout.
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<SweepReport, CoordinatorError> {
        let timeout =
            chrono::Duration::from_std(self.settings.stage_timeout).unwrap_or(chrono::Duration::MAX);
        let lease =
            chrono::Duration::from_std(self.settings.publish_lease).unwrap_or(chrono::Duration::MAX);
        let entries = self.tracker.active()?;
        let mut report = SweepReport {
            scanned: entries.len(),
            ..SweepReport::default()
        };

        for entry in entries {
            let state = entry.state;
            let id = state.id().to_string();

            if state.is_terminal() {
                if state.completion_published {
                    if self.archive(&id) {
                        report.archived += 1;
                    }
                } else {
                    match self.reclaim_completion(&id, now, lease).await {
                        Ok(true) => report.republished += 1,
                        Ok(false) => {}
                        Err(e) => {
                            warn!(
                                submission_id = %id,
                                error = %e,
                                "Completion reclaim failed, will retry next sweep"
                            );
                        }
                    }
                }
                continue;
            }

            match self.redispatch_unsent(&id, now, lease).await {
                Ok(count) => report.redispatched += count,
                Err(e) => {
                    warn!(
                        submission_id = %id,
                        error = %e,
                        "Re-dispatch failed, will retry next sweep"
                    );
                }
            }

            for kind in state.expired_stages(now, timeout) {
                match self.time_out_stage(&id, kind, now, timeout).await {
                    Ok(true) => report.timed_out += 1,
                    Ok(false) => {}
                    Err(e) => {
                        warn!(
                            submission_id = %id,
                            kind = %kind,
                            error = %e,
                            "Timeout handling failed, will retry next sweep"
                        );
                    }
                }
            }
        }

        if report.timed_out > 0 || report.republished > 0 || report.redispatched > 0 {
            info!(
                scanned = report.scanned,
                redispatched = report.redispatched,
                timed_out = report.timed_out,
                republished = report.republished,
                archived = report.archived,
                "Timeout sweep finished"
            );
        } else {
            debug!(scanned = report.scanned, archived = report.archived, "Timeout sweep finished");
        }
        Ok(report)
    }

    /// Claim an unsent completion in the freshest state and publish it.
    /// Returns whether this sweep took it over.
    async fn reclaim_completion(
        &self,
        id: &str,
        now: DateTime<Utc>,
        lease: chrono::Duration,
    ) -> Result<bool, CoordinatorError> {
        let claimed = self
            .tracker
            .update(id, |state| state.claim_completion(now, lease))?;
        let Some(Some(completion)) = claimed else {
            return Ok(false);
        };
        warn!(submission_id = %id, "Re-publishing unsent completion");
        self.publish_completion(&completion).await;
        Ok(true)
    }

    /// Publish again the inputs of the current attempts that never reached
    /// the bus. The retry budget is left untouched.
    async fn redispatch_unsent(
        &self,
        id: &str,
        now: DateTime<Utc>,
        lease: chrono::Duration,
    ) -> Result<usize, CoordinatorError> {
        let claimed = self.tracker.update(id, |state| {
            state
                .claim_unsent_inputs(now, lease)
                .into_iter()
                .map(|kind| StageInput::from_state(state, kind))
                .collect::<Vec<_>>()
        })?;
        let inputs = claimed.unwrap_or_default();
        for input in &inputs {
            warn!(
                submission_id = %id,
                kind = %input.kind,
                attempt = input.attempt,
                "Re-dispatching input that never reached the bus"
            );
        }
        join_all(inputs.iter().map(|input| self.dispatch(input))).await;
        Ok(inputs.len())
    }

    /// Feed a synthetic retryable failure for `kind` if it is still expired
    /// in the freshest state. Returns whether it was applied.
    async fn time_out_stage(
        &self,
        id: &str,
        kind: StageKind,
        now: DateTime<Utc>,
        timeout: chrono::Duration,
    ) -> Result<bool, CoordinatorError> {
        let max_attempts = self.settings.max_attempts;
        let committed = self.tracker.update(id, |state| {
            if !state.is_expired(kind, now, timeout) {
                return None;
            }
            let report = FailureReport::timeout(state.current_attempt(kind));
            let transition = state.apply_failure(kind, report, max_attempts, now);
            Some(Effects::capture(state, transition))
        })?;

        let Some(Some(effects)) = committed else {
            return Ok(false);
        };
        bump(&self.counters.timeouts);
        warn!(
            submission_id = %id,
            kind = %kind,
            retry = effects.outcome == EventOutcome::Retried,
            "Stage timed out"
        );
        self.execute(id, Some(kind), effects).await;
        Ok(true)
    }

    // ========================================================================
    // Side effects
    // ========================================================================

    /// Account for the outcome, then publish the dispatches and completion.
    async fn execute(&self, id: &str, kind: Option<StageKind>, effects: Effects) -> EventOutcome {
        let kind_label = kind.map_or("-", StageKind::as_str);
        match &effects.outcome {
            EventOutcome::Duplicate => {
                bump(&self.counters.duplicates);
                debug!(submission_id = %id, kind = kind_label, "Duplicate event ignored");
            }
            EventOutcome::Stale(reason) => {
                bump(&self.counters.stale_events);
                warn!(
                    submission_id = %id,
                    kind = kind_label,
                    reason = ?reason,
                    "Stale event dropped"
                );
            }
            EventOutcome::Retried => bump(&self.counters.retries),
            EventOutcome::Created | EventOutcome::Applied => {}
        }

        join_all(effects.inputs.iter().map(|input| self.dispatch(input))).await;

        if let Some(completion) = &effects.completion {
            match completion.overall_status {
                OverallStatus::Completed => {
                    bump(&self.counters.completed);
                    info!(submission_id = %id, "Submission completed");
                }
                OverallStatus::Failed => {
                    bump(&self.counters.failed);
                    info!(
                        submission_id = %id,
                        failed_stage = ?completion.failed_stage,
                        error = completion.error.as_deref().unwrap_or(""),
                        partial_results = completion.per_stage_results.len(),
                        "Submission failed"
                    );
                }
                OverallStatus::Running => {}
            }
            self.publish_completion(completion).await;
        }

        effects.outcome
    }

    /// Publish one stage input and record that it reached the bus. A publish
    /// that exhausts its backoff is left for the sweep to re-dispatch.
    async fn dispatch(&self, input: &StageInput) {
        let payload = match serde_json::to_vec(input) {
            Ok(payload) => payload,
            Err(e) => {
                error!(
                    submission_id = %input.submission_id,
                    kind = %input.kind,
                    error = %e,
                    "Cannot encode stage input"
                );
                return;
            }
        };

        let topic = topics::stage_input(input.kind);
        match publish_with_backoff(
            self.bus.as_ref(),
            &topic,
            &payload,
            &self.settings.publish_backoff,
        )
        .await
        {
            Ok(()) => {
                bump(&self.counters.stages_dispatched);
                debug!(
                    submission_id = %input.submission_id,
                    kind = %input.kind,
                    attempt = input.attempt,
                    "Stage dispatched"
                );
                let sent_at = Utc::now();
                if let Err(e) = self.tracker.update(&input.submission_id, |state| {
                    state.mark_input_published(input.kind, input.attempt, sent_at);
                }) {
                    warn!(
                        submission_id = %input.submission_id,
                        kind = %input.kind,
                        error = %e,
                        "Could not record dispatch, sweep will publish the input again"
                    );
                }
            }
            Err(e) => {
                bump(&self.counters.publish_failures);
                error!(
                    submission_id = %input.submission_id,
                    kind = %input.kind,
                    error = %e,
                    "Stage dispatch failed, sweep will retry"
                );
            }
        }
    }

    /// Publish a completion, mark it published and archive the submission.
    ///
    /// On publish failure the claim is released so the next sweep tries again.
    async fn publish_completion(&self, completion: &CompletionResult) {
        let id = completion.submission_id.as_str();
        let payload = match serde_json::to_vec(completion) {
            Ok(payload) => payload,
            Err(e) => {
                error!(submission_id = %id, error = %e, "Cannot encode completion");
                return;
            }
        };

        if let Err(e) = publish_with_backoff(
            self.bus.as_ref(),
            topics::SUBMISSION_COMPLETED,
            &payload,
            &self.settings.publish_backoff,
        )
        .await
        {
            bump(&self.counters.publish_failures);
            error!(submission_id = %id, error = %e, "Completion publish failed, sweep will retry");
            if let Err(e) = self.tracker.update(id, SubmissionState::release_completion) {
                warn!(
                    submission_id = %id,
                    error = %e,
                    "Could not release completion claim, sweep waits for the lease"
                );
            }
            return;
        }

        if let Err(e) = self.tracker.update(id, |state| {
            state.completion_published = true;
        }) {
            warn!(submission_id = %id, error = %e, "Could not mark completion published");
            return;
        }
        self.archive(id);
    }

    fn archive(&self, id: &str) -> bool {
        match self.tracker.archive(id) {
            Ok(archived) => archived,
            Err(e) => {
                warn!(submission_id = %id, error = %e, "Archiving failed, sweep will retry");
                false
            }
        }
    }

    // ========================================================================
    // Statistics
    // ========================================================================

    pub fn stats(&self) -> CoordinatorStats {
        let c = &self.counters;
        let read = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        CoordinatorStats {
            submissions_accepted: read(&c.submissions_accepted),
            duplicates: read(&c.duplicates),
            stale_events: read(&c.stale_events),
            stages_dispatched: read(&c.stages_dispatched),
            retries: read(&c.retries),
            timeouts: read(&c.timeouts),
            completed: read(&c.completed),
            failed: read(&c.failed),
            publish_failures: read(&c.publish_failures),
        }
    }
}
