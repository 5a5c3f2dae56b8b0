//! Simulated stage workers
//!
//! Stand-ins for the real analysis services, used by `parlance run` and the
//! integration tests. A worker consumes `stage.<kind>.input`, waits a random
//! latency and answers on `stage.<kind>.result` or `stage.<kind>.failure`,
//! echoing the input's attempt number.
//!
//! Outcomes come from a per-(submission, kind) script when one is set,
//! otherwise from the configured failure rate.

use async_trait::async_trait;
use rand::Rng;
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info};

use crate::bus::{publish_json, BusError, Message, MessageBus, MessageHandler, Nack};
use crate::config::defaults::{SIMULATED_MAX_LATENCY_MS, SIMULATED_MIN_LATENCY_MS};
use crate::types::{topics, StageFailure, StageInput, StageKind, StagePayload, StageResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerOutcome {
    Succeed,
    FailRetryable,
    FailFatal,
    /// Consume the input and never answer
    Silent,
}

/// Shared decision source for every simulated worker.
pub struct WorkerBehavior {
    /// Probability that an unscripted attempt fails
    failure_rate: f64,
    /// Share of failures that are not retryable
    fatal_share: f64,
    min_latency_ms: u64,
    max_latency_ms: u64,
    script: Mutex<HashMap<(String, StageKind), VecDeque<WorkerOutcome>>>,
    handled: AtomicU64,
}

impl WorkerBehavior {
    pub fn new(failure_rate: f64) -> Self {
        Self {
            failure_rate: failure_rate.clamp(0.0, 1.0),
            fatal_share: 0.2,
            min_latency_ms: SIMULATED_MIN_LATENCY_MS,
            max_latency_ms: SIMULATED_MAX_LATENCY_MS,
            script: Mutex::new(HashMap::new()),
            handled: AtomicU64::new(0),
        }
    }

    /// Always succeed, no latency. For deterministic tests.
    pub fn reliable() -> Self {
        Self::new(0.0).with_latency(0, 0)
    }

    #[must_use]
    pub fn with_latency(mut self, min_ms: u64, max_ms: u64) -> Self {
        self.min_latency_ms = min_ms;
        self.max_latency_ms = max_ms.max(min_ms);
        self
    }

    #[must_use]
    pub fn with_fatal_share(mut self, share: f64) -> Self {
        self.fatal_share = share.clamp(0.0, 1.0);
        self
    }

    /// Queue outcomes for successive attempts of one stage of one submission.
    pub fn script(&self, submission_id: &str, kind: StageKind, outcomes: &[WorkerOutcome]) {
        if let Ok(mut script) = self.script.lock() {
            script
                .entry((submission_id.to_string(), kind))
                .or_default()
                .extend(outcomes.iter().copied());
        }
    }

    /// Inputs handled so far across all workers.
    pub fn handled(&self) -> u64 {
        self.handled.load(Ordering::Relaxed)
    }

    fn decide(&self, input: &StageInput) -> (WorkerOutcome, Duration) {
        let scripted = self.script.lock().ok().and_then(|mut script| {
            script
                .get_mut(&(input.submission_id.clone(), input.kind))
                .and_then(VecDeque::pop_front)
        });

        let mut rng = rand::thread_rng();
        let outcome = scripted.unwrap_or_else(|| {
            if rng.gen_bool(self.failure_rate) {
                if rng.gen_bool(self.fatal_share) {
                    WorkerOutcome::FailFatal
                } else {
                    WorkerOutcome::FailRetryable
                }
            } else {
                WorkerOutcome::Succeed
            }
        });
        let latency = if self.max_latency_ms > self.min_latency_ms {
            rng.gen_range(self.min_latency_ms..=self.max_latency_ms)
        } else {
            self.min_latency_ms
        };
        (outcome, Duration::from_millis(latency))
    }
}

/// Plausible output for a stage.
fn fake_payload(input: &StageInput) -> StagePayload {
    let seed = input.submission_id.len() as f64;
    match input.kind {
        StageKind::Transcription => json!({
            "text": format!("transcript of {} recording(s)", input.audio_urls.len()),
            "confidence": 0.92,
        }),
        StageKind::AudioFeatures => json!({
            "speech_rate_wpm": 110.0 + seed,
            "pause_ratio": 0.18,
        }),
        kind => json!({
            "score": 6.5,
            "band": kind.as_str(),
            "based_on": input.dependency_results.keys().map(|k| k.as_str()).collect::<Vec<_>>(),
        }),
    }
}

pub struct SimulatedWorker {
    kind: StageKind,
    bus: Arc<dyn MessageBus>,
    behavior: Arc<WorkerBehavior>,
}

impl SimulatedWorker {
    pub fn new(kind: StageKind, bus: Arc<dyn MessageBus>, behavior: Arc<WorkerBehavior>) -> Self {
        Self {
            kind,
            bus,
            behavior,
        }
    }

    async fn respond(&self, input: &StageInput, outcome: WorkerOutcome) -> Result<(), BusError> {
        let bus = self.bus.as_ref();
        match outcome {
            WorkerOutcome::Succeed => {
                let result = StageResult {
                    submission_id: input.submission_id.clone(),
                    kind: input.kind,
                    payload: fake_payload(input),
                    attempt: Some(input.attempt),
                };
                publish_json(bus, &topics::stage_result(self.kind), &result).await
            }
            WorkerOutcome::FailRetryable | WorkerOutcome::FailFatal => {
                let retryable = outcome == WorkerOutcome::FailRetryable;
                let failure = StageFailure {
                    submission_id: input.submission_id.clone(),
                    kind: input.kind,
                    error: if retryable {
                        format!("{} backend temporarily unavailable", self.kind)
                    } else {
                        format!("{} rejected the audio", self.kind)
                    },
                    retryable,
                    attempt: Some(input.attempt),
                };
                publish_json(bus, &topics::stage_failure(self.kind), &failure).await
            }
            WorkerOutcome::Silent => Ok(()),
        }
    }
}

#[async_trait]
impl MessageHandler for SimulatedWorker {
    async fn handle(&self, message: &Message) -> Result<(), Nack> {
        let Ok(input) = message.decode::<StageInput>() else {
            return Ok(());
        };
        let (outcome, latency) = self.behavior.decide(&input);
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        debug!(
            submission_id = %input.submission_id,
            kind = %self.kind,
            attempt = input.attempt,
            outcome = ?outcome,
            "Simulated worker answering"
        );
        self.behavior.handled.fetch_add(1, Ordering::Relaxed);
        self.respond(&input, outcome)
            .await
            .map_err(|e| Nack::new(e.to_string()))
    }
}

/// Subscribe one simulated worker per stage kind.
pub async fn spawn_workers(
    bus: Arc<dyn MessageBus>,
    behavior: Arc<WorkerBehavior>,
) -> Result<(), BusError> {
    for kind in StageKind::ALL {
        let worker = SimulatedWorker::new(kind, Arc::clone(&bus), Arc::clone(&behavior));
        bus.subscribe(&topics::stage_input(kind), Arc::new(worker)).await?;
    }
    info!(
        workers = StageKind::ALL.len(),
        failure_rate = behavior.failure_rate,
        "Simulated stage workers subscribed"
    );
    Ok(())
}
