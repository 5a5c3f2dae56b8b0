//! Pipeline Scenario Tests
//!
//! Drives the coordinator through the in-process bus and tracker, with and
//! without simulated workers, and asserts on what ends up published:
//! exactly-once completion, dependency ordering, retry budgets, fail-fast,
//! idempotence under duplicate delivery and timeout recovery.

use async_trait::async_trait;
use parlance::bus::{
    publish_json, BackoffPolicy, BusError, InMemoryBus, MessageBus, MessageHandler,
};
use parlance::config::BusConfig;
use parlance::pipeline::{subscribe_coordinator, CoordinatorSettings, PipelineCoordinator};
use parlance::simulation::{spawn_workers, WorkerBehavior, WorkerOutcome};
use parlance::storage::{InMemoryTracker, SubmissionTracker};
use parlance::types::{
    topics, CompletionResult, EventOutcome, OverallStatus, StageFailure, StageInput, StageKind,
    StageResult, StageStatus, Submission,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(5);

fn fast_bus() -> Arc<InMemoryBus> {
    Arc::new(InMemoryBus::new(BusConfig {
        max_concurrent_handlers: 16,
        redelivery_delay_ms: 5,
        max_redeliveries: 50,
    }))
}

fn settings(max_attempts: u32, stage_timeout: Duration) -> CoordinatorSettings {
    CoordinatorSettings {
        max_attempts,
        stage_timeout,
        publish_backoff: BackoffPolicy {
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            max_attempts: 3,
        },
        publish_lease: Duration::from_secs(5),
    }
}

fn coordinator_on(
    bus: &Arc<InMemoryBus>,
    tracker: SubmissionTracker,
    settings: CoordinatorSettings,
) -> Arc<PipelineCoordinator> {
    let handle: Arc<dyn MessageBus> = bus.clone();
    Arc::new(PipelineCoordinator::new(tracker, handle, settings))
}

/// Coordinator and simulated workers wired to one bus.
async fn live_pipeline(
    behavior: WorkerBehavior,
    settings: CoordinatorSettings,
) -> (Arc<InMemoryBus>, Arc<PipelineCoordinator>) {
    let bus = fast_bus();
    let coordinator = coordinator_on(&bus, SubmissionTracker::in_memory(), settings);
    subscribe_coordinator(bus.as_ref(), &coordinator).await.unwrap();
    let handle: Arc<dyn MessageBus> = bus.clone();
    spawn_workers(handle, Arc::new(behavior)).await.unwrap();
    (bus, coordinator)
}

fn submission(id: &str) -> Submission {
    Submission::new(id, vec![format!("https://cdn.test/{id}/take-1.wav")])
}

fn ok(id: &str, kind: StageKind) -> StageResult {
    StageResult {
        submission_id: id.to_string(),
        kind,
        payload: json!({ "stage": kind.as_str(), "submission": id }),
        attempt: None,
    }
}

fn failed(id: &str, kind: StageKind, retryable: bool) -> StageFailure {
    StageFailure {
        submission_id: id.to_string(),
        kind,
        error: format!("{kind} crashed"),
        retryable,
        attempt: None,
    }
}

fn inputs(bus: &InMemoryBus, kind: StageKind) -> Vec<StageInput> {
    bus.published_payloads(&topics::stage_input(kind))
}

fn completions(bus: &InMemoryBus) -> Vec<CompletionResult> {
    bus.published_payloads(topics::SUBMISSION_COMPLETED)
}

/// Bus whose broker is slow to acknowledge completions.
struct SlowCompletions {
    inner: Arc<InMemoryBus>,
    delay: Duration,
}

#[async_trait]
impl MessageBus for SlowCompletions {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BusError> {
        if topic == topics::SUBMISSION_COMPLETED {
            tokio::time::sleep(self.delay).await;
        }
        self.inner.publish(topic, payload).await
    }

    async fn subscribe(
        &self,
        topic: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<(), BusError> {
        self.inner.subscribe(topic, handler).await
    }
}

const STAGE_TWO: [StageKind; 4] = [
    StageKind::Grammar,
    StageKind::Pronunciation,
    StageKind::Lexical,
    StageKind::Fluency,
];

// ============================================================================
// End-to-end runs with simulated workers
// ============================================================================

#[tokio::test]
async fn all_stages_succeed_and_complete_once() {
    let (bus, coordinator) =
        live_pipeline(WorkerBehavior::reliable(), settings(3, Duration::from_secs(60))).await;

    publish_json(bus.as_ref(), topics::SUBMISSION_CREATED, &submission("S1"))
        .await
        .unwrap();
    assert!(bus.wait_for(topics::SUBMISSION_COMPLETED, 1, WAIT).await);
    assert!(bus.wait_idle(WAIT).await);

    let done = completions(&bus);
    assert_eq!(done.len(), 1);
    assert_eq!(done[0].overall_status, OverallStatus::Completed);
    assert_eq!(done[0].per_stage_results.len(), 6);
    assert!(done[0].failed_stage.is_none());

    for kind in StageKind::ALL {
        assert_eq!(inputs(&bus, kind).len(), 1, "{kind} dispatched more than once");
    }
    assert!(coordinator.tracker().get("S1").unwrap().is_none());
    assert_eq!(coordinator.stats().completed, 1);
    bus.shutdown().await;
}

#[tokio::test]
async fn stage_two_never_starts_before_both_stage_one_results() {
    let behavior = WorkerBehavior::new(0.0).with_latency(0, 5);
    let (bus, _coordinator) = live_pipeline(behavior, settings(3, Duration::from_secs(60))).await;

    let count = 25;
    for n in 0..count {
        publish_json(bus.as_ref(), topics::SUBMISSION_CREATED, &submission(&format!("S{n}")))
            .await
            .unwrap();
    }
    assert!(bus.wait_for(topics::SUBMISSION_COMPLETED, count, WAIT).await);
    assert!(bus.wait_idle(WAIT).await);

    for kind in STAGE_TWO {
        let sent = inputs(&bus, kind);
        assert_eq!(sent.len(), count, "{kind} must be dispatched once per submission");
        for input in sent {
            assert!(input.dependency_results.contains_key(&StageKind::Transcription));
            assert!(input.dependency_results.contains_key(&StageKind::AudioFeatures));
        }
    }
    assert_eq!(completions(&bus).len(), count);
    bus.shutdown().await;
}

#[tokio::test]
async fn retryable_failures_within_budget_still_complete() {
    let behavior = WorkerBehavior::reliable();
    behavior.script(
        "S2",
        StageKind::Transcription,
        &[
            WorkerOutcome::FailRetryable,
            WorkerOutcome::FailRetryable,
            WorkerOutcome::Succeed,
        ],
    );
    let (bus, coordinator) = live_pipeline(behavior, settings(3, Duration::from_secs(60))).await;

    publish_json(bus.as_ref(), topics::SUBMISSION_CREATED, &submission("S2"))
        .await
        .unwrap();
    assert!(bus.wait_for(topics::SUBMISSION_COMPLETED, 1, WAIT).await);

    let done = completions(&bus);
    assert_eq!(done[0].overall_status, OverallStatus::Completed);
    let attempts: Vec<u32> = inputs(&bus, StageKind::Transcription)
        .iter()
        .map(|i| i.attempt)
        .collect();
    assert_eq!(attempts, vec![1, 2, 3]);
    assert_eq!(coordinator.stats().retries, 2);
    bus.shutdown().await;
}

#[tokio::test]
async fn exhausted_budget_fails_without_dispatching_dependents() {
    let behavior = WorkerBehavior::reliable();
    behavior.script(
        "S3",
        StageKind::Transcription,
        &[WorkerOutcome::FailRetryable; 3],
    );
    let (bus, _coordinator) = live_pipeline(behavior, settings(3, Duration::from_secs(60))).await;

    publish_json(bus.as_ref(), topics::SUBMISSION_CREATED, &submission("S3"))
        .await
        .unwrap();
    assert!(bus.wait_for(topics::SUBMISSION_COMPLETED, 1, WAIT).await);
    assert!(bus.wait_idle(WAIT).await);

    let done = completions(&bus);
    assert_eq!(done.len(), 1);
    assert_eq!(done[0].overall_status, OverallStatus::Failed);
    assert_eq!(done[0].failed_stage, Some(StageKind::Transcription));
    assert_eq!(inputs(&bus, StageKind::Transcription).len(), 3);
    for kind in STAGE_TWO {
        assert!(inputs(&bus, kind).is_empty());
    }
    bus.shutdown().await;
}

#[tokio::test]
async fn silent_worker_is_recovered_by_timeout_sweep() {
    let behavior = WorkerBehavior::reliable();
    behavior.script("S4", StageKind::Grammar, &[WorkerOutcome::Silent]);
    let (bus, coordinator) = live_pipeline(behavior, settings(3, Duration::from_millis(50))).await;

    publish_json(bus.as_ref(), topics::SUBMISSION_CREATED, &submission("S4"))
        .await
        .unwrap();
    assert!(bus.wait_for(&topics::stage_input(StageKind::Grammar), 1, WAIT).await);
    assert!(bus.wait_idle(WAIT).await);
    assert!(completions(&bus).is_empty());

    tokio::time::sleep(Duration::from_millis(60)).await;
    let report = coordinator.sweep(chrono::Utc::now()).await.unwrap();
    assert_eq!(report.timed_out, 1);

    assert!(bus.wait_for(topics::SUBMISSION_COMPLETED, 1, WAIT).await);
    assert_eq!(completions(&bus)[0].overall_status, OverallStatus::Completed);
    let grammar = inputs(&bus, StageKind::Grammar);
    assert_eq!(grammar.len(), 2);
    assert_eq!(grammar[1].attempt, 2);
    bus.shutdown().await;
}

#[tokio::test]
async fn duplicate_submission_created_is_a_no_op() {
    let (bus, coordinator) =
        live_pipeline(WorkerBehavior::reliable(), settings(3, Duration::from_secs(60))).await;

    for _ in 0..3 {
        publish_json(bus.as_ref(), topics::SUBMISSION_CREATED, &submission("S5"))
            .await
            .unwrap();
    }
    assert!(bus.wait_for(topics::SUBMISSION_COMPLETED, 1, WAIT).await);
    assert!(bus.wait_idle(WAIT).await);

    // Late duplicate after archiving
    publish_json(bus.as_ref(), topics::SUBMISSION_CREATED, &submission("S5"))
        .await
        .unwrap();
    assert!(bus.wait_idle(WAIT).await);

    assert_eq!(completions(&bus).len(), 1);
    assert_eq!(inputs(&bus, StageKind::Transcription).len(), 1);
    assert_eq!(coordinator.stats().submissions_accepted, 1);
    assert_eq!(coordinator.stats().duplicates, 3);
    bus.shutdown().await;
}

#[tokio::test]
async fn storage_outage_is_survived_through_redelivery() {
    let backend = Arc::new(InMemoryTracker::new());
    let bus = fast_bus();
    let coordinator = coordinator_on(
        &bus,
        SubmissionTracker::new(backend.clone()),
        settings(3, Duration::from_secs(60)),
    );
    subscribe_coordinator(bus.as_ref(), &coordinator).await.unwrap();
    let handle: Arc<dyn MessageBus> = bus.clone();
    spawn_workers(handle, Arc::new(WorkerBehavior::reliable()))
        .await
        .unwrap();

    backend.set_available(false);
    publish_json(bus.as_ref(), topics::SUBMISSION_CREATED, &submission("S6"))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(inputs(&bus, StageKind::Transcription).is_empty());

    backend.set_available(true);
    assert!(bus.wait_for(topics::SUBMISSION_COMPLETED, 1, WAIT).await);
    assert_eq!(completions(&bus)[0].overall_status, OverallStatus::Completed);
    assert!(bus.dead_letters().is_empty());
    bus.shutdown().await;
}

// ============================================================================
// Coordinator driven directly
// ============================================================================

#[tokio::test]
async fn scenario_fatal_failure_after_partial_success() {
    let bus = fast_bus();
    let coordinator = coordinator_on(
        &bus,
        SubmissionTracker::in_memory(),
        settings(3, Duration::from_secs(60)),
    );

    coordinator.on_submission_created(submission("S1")).await.unwrap();
    coordinator.on_stage_result(ok("S1", StageKind::Transcription)).await.unwrap();
    coordinator.on_stage_result(ok("S1", StageKind::AudioFeatures)).await.unwrap();
    for kind in STAGE_TWO {
        assert_eq!(inputs(&bus, kind).len(), 1);
    }

    for kind in [StageKind::Grammar, StageKind::Pronunciation, StageKind::Lexical] {
        coordinator.on_stage_result(ok("S1", kind)).await.unwrap();
    }
    let outcome = coordinator
        .on_stage_failure(failed("S1", StageKind::Fluency, false))
        .await
        .unwrap();
    assert_eq!(outcome, EventOutcome::Applied);

    let done = completions(&bus);
    assert_eq!(done.len(), 1);
    let completion = &done[0];
    assert_eq!(completion.overall_status, OverallStatus::Failed);
    assert_eq!(completion.failed_stage, Some(StageKind::Fluency));
    assert_eq!(completion.error.as_deref(), Some("fluency crashed"));
    assert_eq!(completion.per_stage_results.len(), 5);
    assert!(!completion.per_stage_results.contains_key(&StageKind::Fluency));

    // Nothing after the terminal transition has any effect
    let published = bus.published_count();
    coordinator
        .on_stage_failure(failed("S1", StageKind::Fluency, false))
        .await
        .unwrap();
    coordinator.on_stage_result(ok("S1", StageKind::Fluency)).await.unwrap();
    assert_eq!(bus.published_count(), published);
}

#[tokio::test]
async fn duplicate_result_leaves_state_unchanged() {
    let bus = fast_bus();
    let coordinator = coordinator_on(
        &bus,
        SubmissionTracker::in_memory(),
        settings(3, Duration::from_secs(60)),
    );
    coordinator.on_submission_created(submission("S7")).await.unwrap();

    let first = coordinator
        .on_stage_result(ok("S7", StageKind::Transcription))
        .await
        .unwrap();
    let once = coordinator.tracker().get("S7").unwrap().unwrap();

    let second = coordinator
        .on_stage_result(ok("S7", StageKind::Transcription))
        .await
        .unwrap();
    let twice = coordinator.tracker().get("S7").unwrap().unwrap();

    assert_eq!(first, EventOutcome::Applied);
    assert_eq!(second, EventOutcome::Duplicate);
    assert_eq!(once, twice);
    assert_eq!(
        twice.state.status_of(StageKind::Transcription),
        StageStatus::Succeeded
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_stage_one_results_dispatch_stage_two_once() {
    let bus = fast_bus();
    let coordinator = coordinator_on(
        &bus,
        SubmissionTracker::in_memory(),
        settings(3, Duration::from_secs(60)),
    );

    let ids: Vec<String> = (0..40).map(|n| format!("C{n}")).collect();
    for id in &ids {
        coordinator.on_submission_created(submission(id)).await.unwrap();
    }

    let mut racers = Vec::new();
    for id in &ids {
        for kind in [StageKind::Transcription, StageKind::AudioFeatures] {
            let coordinator = Arc::clone(&coordinator);
            let result = ok(id, kind);
            racers.push(tokio::spawn(async move {
                coordinator.on_stage_result(result).await
            }));
        }
    }
    for racer in racers {
        racer.await.unwrap().unwrap();
    }

    for kind in STAGE_TWO {
        let sent = inputs(&bus, kind);
        assert_eq!(sent.len(), ids.len(), "{kind} dispatched {} times", sent.len());
        for id in &ids {
            assert_eq!(sent.iter().filter(|i| &i.submission_id == id).count(), 1);
        }
    }
}

#[tokio::test]
async fn duplicated_retryable_failure_consumes_one_retry() {
    let bus = fast_bus();
    let coordinator = coordinator_on(
        &bus,
        SubmissionTracker::in_memory(),
        settings(2, Duration::from_secs(60)),
    );
    coordinator.on_submission_created(submission("S8")).await.unwrap();

    let mut failure = failed("S8", StageKind::AudioFeatures, true);
    failure.attempt = Some(1);
    assert_eq!(
        coordinator.on_stage_failure(failure.clone()).await.unwrap(),
        EventOutcome::Retried
    );
    // Redelivered copy of the same failure must not exhaust the budget
    assert!(matches!(
        coordinator.on_stage_failure(failure).await.unwrap(),
        EventOutcome::Stale(_)
    ));
    assert!(completions(&bus).is_empty());

    let state = coordinator.tracker().get("S8").unwrap().unwrap().state;
    assert_eq!(state.stage(StageKind::AudioFeatures).unwrap().attempt_count, 1);
    assert_eq!(state.status_of(StageKind::AudioFeatures), StageStatus::Dispatched);
}

#[tokio::test]
async fn every_submission_terminates_once_sweeps_have_fired() {
    let bus = fast_bus();
    let coordinator = coordinator_on(
        &bus,
        SubmissionTracker::in_memory(),
        settings(3, Duration::from_millis(1)),
    );
    coordinator.on_submission_created(submission("S9")).await.unwrap();

    // No worker ever answers: each sweep burns one attempt of each stage
    let mut now = chrono::Utc::now();
    for _ in 0..3 {
        now += chrono::Duration::seconds(1);
        coordinator.sweep(now).await.unwrap();
    }

    let done = completions(&bus);
    assert_eq!(done.len(), 1);
    assert_eq!(done[0].overall_status, OverallStatus::Failed);
    assert_eq!(done[0].error.as_deref(), Some(parlance::types::TIMEOUT_ERROR));
    assert!(coordinator.tracker().get("S9").unwrap().is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn sweep_leaves_in_flight_completion_to_its_publisher() {
    let bus = fast_bus();
    let slow: Arc<dyn MessageBus> = Arc::new(SlowCompletions {
        inner: bus.clone(),
        delay: Duration::from_millis(200),
    });
    let coordinator = Arc::new(PipelineCoordinator::new(
        SubmissionTracker::in_memory(),
        slow,
        settings(3, Duration::from_secs(60)),
    ));
    coordinator.on_submission_created(submission("L1")).await.unwrap();

    let finishing = {
        let coordinator = Arc::clone(&coordinator);
        tokio::spawn(async move {
            coordinator
                .on_stage_failure(failed("L1", StageKind::Transcription, false))
                .await
        })
    };

    // Terminal state committed, completion still waiting on the broker
    tokio::time::sleep(Duration::from_millis(50)).await;
    let report = coordinator.sweep(chrono::Utc::now()).await.unwrap();
    assert_eq!(report.republished, 0);

    finishing.await.unwrap().unwrap();
    let report = coordinator
        .sweep(chrono::Utc::now() + chrono::Duration::hours(1))
        .await
        .unwrap();
    assert_eq!(report.republished, 0);

    let done = completions(&bus);
    assert_eq!(done.len(), 1);
    assert_eq!(done[0].failed_stage, Some(StageKind::Transcription));
    assert!(coordinator.tracker().get_archived("L1").unwrap().is_some());
}

#[tokio::test]
async fn bus_outage_during_dispatch_keeps_the_retry_budget() {
    let bus = fast_bus();
    let coordinator = coordinator_on(
        &bus,
        SubmissionTracker::in_memory(),
        settings(3, Duration::from_secs(60)),
    );

    // Two inputs, three publish attempts each
    bus.fail_next_publishes(6);
    coordinator.on_submission_created(submission("O1")).await.unwrap();
    assert_eq!(bus.published_count(), 0);

    let mut now = chrono::Utc::now();
    for _ in 0..2 {
        now += chrono::Duration::seconds(6);
        bus.fail_next_publishes(6);
        let report = coordinator.sweep(now).await.unwrap();
        assert_eq!(report.redispatched, 2);
        assert_eq!(report.timed_out, 0);
    }

    now += chrono::Duration::seconds(6);
    let report = coordinator.sweep(now).await.unwrap();
    assert_eq!(report.redispatched, 2);
    assert_eq!(report.timed_out, 0);

    for kind in [StageKind::Transcription, StageKind::AudioFeatures] {
        let sent = inputs(&bus, kind);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].attempt, 1);
    }
    let state = coordinator.tracker().get("O1").unwrap().unwrap().state;
    for kind in [StageKind::Transcription, StageKind::AudioFeatures] {
        let record = state.stage(kind).unwrap();
        assert_eq!(record.status, StageStatus::Dispatched);
        assert_eq!(record.attempt_count, 0);
        assert!(record.input_published);
    }
    assert!(completions(&bus).is_empty());
    assert_eq!(coordinator.stats().timeouts, 0);

    // Silence after the inputs went out does cost an attempt
    let report = coordinator
        .sweep(now + chrono::Duration::seconds(61))
        .await
        .unwrap();
    assert_eq!(report.timed_out, 2);
    assert_eq!(inputs(&bus, StageKind::Transcription).len(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn final_stage_success_racing_its_fatal_failure_finishes_once() {
    let bus = fast_bus();
    let coordinator = coordinator_on(
        &bus,
        SubmissionTracker::in_memory(),
        settings(3, Duration::from_secs(60)),
    );

    let ids: Vec<String> = (0..30).map(|n| format!("R{n}")).collect();
    for id in &ids {
        coordinator.on_submission_created(submission(id)).await.unwrap();
        for kind in [
            StageKind::Transcription,
            StageKind::AudioFeatures,
            StageKind::Grammar,
            StageKind::Pronunciation,
            StageKind::Lexical,
        ] {
            coordinator.on_stage_result(ok(id, kind)).await.unwrap();
        }
    }

    // Two workers answered the same fluency input differently
    let mut racers = Vec::new();
    for id in &ids {
        let winner = Arc::clone(&coordinator);
        let result = ok(id, StageKind::Fluency);
        racers.push(tokio::spawn(async move { winner.on_stage_result(result).await }));

        let loser = Arc::clone(&coordinator);
        let failure = failed(id, StageKind::Fluency, false);
        racers.push(tokio::spawn(async move { loser.on_stage_failure(failure).await }));
    }
    let mut applied = 0;
    for racer in racers {
        match racer.await.unwrap().unwrap() {
            EventOutcome::Applied => applied += 1,
            EventOutcome::Stale(_) => {}
            other => panic!("unexpected outcome {other:?}"),
        }
    }
    assert_eq!(applied, ids.len());

    let done = completions(&bus);
    assert_eq!(done.len(), ids.len());
    for id in &ids {
        let mine: Vec<&CompletionResult> =
            done.iter().filter(|c| &c.submission_id == id).collect();
        assert_eq!(mine.len(), 1, "{id} completed {} times", mine.len());

        let archived = coordinator.tracker().get_archived(id).unwrap().unwrap();
        assert_eq!(mine[0].overall_status, archived.state.overall_status);
        assert_eq!(archived.state.completion.as_ref(), Some(mine[0]));
        match mine[0].overall_status {
            OverallStatus::Completed => assert_eq!(mine[0].per_stage_results.len(), 6),
            OverallStatus::Failed => {
                assert_eq!(mine[0].failed_stage, Some(StageKind::Fluency));
                assert_eq!(mine[0].per_stage_results.len(), 5);
            }
            OverallStatus::Running => panic!("{id} published a running state"),
        }
    }
}
