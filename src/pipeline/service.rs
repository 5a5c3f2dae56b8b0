//! Wiring between the coordinator and the bus.

use std::sync::Arc;
use tracing::info;

use super::coordinator::{CoordinatorError, PipelineCoordinator};
use super::handlers::{CoordinatorHandler, Route};
use crate::bus::MessageBus;
use crate::types::{topics, StageKind};

/// Every topic the coordinator consumes, with the route it feeds.
pub fn coordinator_routes() -> Vec<(String, Route)> {
    let mut routes = vec![(topics::SUBMISSION_CREATED.to_string(), Route::SubmissionCreated)];
    for kind in StageKind::ALL {
        routes.push((topics::stage_result(kind), Route::StageResult(kind)));
        routes.push((topics::stage_failure(kind), Route::StageFailure(kind)));
    }
    routes
}

/// Subscribe `coordinator` to all of its topics. Returns the subscription count.
pub async fn subscribe_coordinator(
    bus: &dyn MessageBus,
    coordinator: &Arc<PipelineCoordinator>,
) -> Result<usize, CoordinatorError> {
    let routes = coordinator_routes();
    for (topic, route) in &routes {
        let handler = Arc::new(CoordinatorHandler::new(Arc::clone(coordinator), *route));
        bus.subscribe(topic, handler).await?;
    }
    info!(subscriptions = routes.len(), "Coordinator subscribed to bus");
    Ok(routes.len())
}
