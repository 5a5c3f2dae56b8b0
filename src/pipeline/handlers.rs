//! Bus handlers feeding the coordinator.
//!
//! Acknowledgement policy:
//! - handled, duplicate or stale: ack
//! - undecodable payload: ack (redelivery cannot fix it), logged
//! - transient tracker or bus error: nack, so the bus redelivers

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{error, warn};

use super::coordinator::{CoordinatorError, PipelineCoordinator};
use crate::bus::{Message, MessageHandler, Nack};
use crate::types::{EventOutcome, StageFailure, StageKind, StageResult, Submission};

/// Which coordinator entry point a subscription feeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    SubmissionCreated,
    StageResult(StageKind),
    StageFailure(StageKind),
}

pub struct CoordinatorHandler {
    coordinator: Arc<PipelineCoordinator>,
    route: Route,
}

impl CoordinatorHandler {
    pub fn new(coordinator: Arc<PipelineCoordinator>, route: Route) -> Self {
        Self { coordinator, route }
    }

    async fn dispatch(&self, message: &Message) -> Result<Option<EventOutcome>, CoordinatorError> {
        match self.route {
            Route::SubmissionCreated => {
                let Some(submission) = decode::<Submission>(message) else {
                    return Ok(None);
                };
                self.coordinator.on_submission_created(submission).await.map(Some)
            }
            Route::StageResult(kind) => {
                let Some(result) = decode::<StageResult>(message) else {
                    return Ok(None);
                };
                if !kind_matches(message, kind, result.kind) {
                    return Ok(None);
                }
                self.coordinator.on_stage_result(result).await.map(Some)
            }
            Route::StageFailure(kind) => {
                let Some(failure) = decode::<StageFailure>(message) else {
                    return Ok(None);
                };
                if !kind_matches(message, kind, failure.kind) {
                    return Ok(None);
                }
                self.coordinator.on_stage_failure(failure).await.map(Some)
            }
        }
    }
}

fn decode<T: serde::de::DeserializeOwned>(message: &Message) -> Option<T> {
    match message.decode() {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(
                topic = %message.topic,
                message_id = %message.id,
                error = %e,
                "Dropping undecodable message"
            );
            None
        }
    }
}

fn kind_matches(message: &Message, expected: StageKind, found: StageKind) -> bool {
    if expected == found {
        return true;
    }
    warn!(
        topic = %message.topic,
        message_id = %message.id,
        payload_kind = %found,
        "Dropping message whose stage kind does not match its topic"
    );
    false
}

#[async_trait]
impl MessageHandler for CoordinatorHandler {
    async fn handle(&self, message: &Message) -> Result<(), Nack> {
        match self.dispatch(message).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_retryable() => {
                warn!(
                    topic = %message.topic,
                    delivery = message.delivery_attempt,
                    error = %e,
                    "Event not processed, requesting redelivery"
                );
                Err(Nack::new(e.to_string()))
            }
            Err(e) => {
                error!(
                    topic = %message.topic,
                    message_id = %message.id,
                    error = %e,
                    "Event dropped on permanent error"
                );
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::InMemoryBus;
    use crate::pipeline::CoordinatorSettings;
    use crate::storage::{InMemoryTracker, SubmissionTracker};
    use serde_json::json;

    fn handler_with_backend(route: Route) -> (CoordinatorHandler, Arc<InMemoryTracker>) {
        let backend = Arc::new(InMemoryTracker::new());
        let coordinator = PipelineCoordinator::new(
            SubmissionTracker::new(backend.clone()),
            Arc::new(InMemoryBus::default()),
            CoordinatorSettings::default(),
        );
        (CoordinatorHandler::new(Arc::new(coordinator), route), backend)
    }

    fn message<T: serde::Serialize>(topic: &str, value: &T) -> Message {
        Message::new(topic, serde_json::to_vec(value).unwrap())
    }

    #[tokio::test]
    async fn test_garbage_is_acked() {
        let (handler, _) = handler_with_backend(Route::SubmissionCreated);
        let msg = Message::new("submission.created", b"not json".to_vec());
        assert!(handler.handle(&msg).await.is_ok());
    }

    #[tokio::test]
    async fn test_storage_outage_is_nacked() {
        let (handler, backend) = handler_with_backend(Route::SubmissionCreated);
        backend.set_available(false);

        let msg = message("submission.created", &Submission::new("S1", vec![]));
        assert!(handler.handle(&msg).await.is_err());

        backend.set_available(true);
        assert!(handler.handle(&msg).await.is_ok());
    }

    #[tokio::test]
    async fn test_kind_mismatch_is_dropped() {
        let (handler, backend) = handler_with_backend(Route::StageResult(StageKind::Grammar));
        let result = StageResult {
            submission_id: "S1".into(),
            kind: StageKind::Lexical,
            payload: json!({}),
            attempt: None,
        };
        // Would nack if it reached the tracker
        backend.set_available(false);
        assert!(handler.handle(&message("stage.grammar.result", &result)).await.is_ok());
    }
}
