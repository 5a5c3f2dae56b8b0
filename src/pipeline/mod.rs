//! Pipeline Module - submission coordination over the message bus
//!
//! - `coordinator`: per-submission state transitions and their publishes
//! - `handlers`: bus handlers decoding events for the coordinator
//! - `service`: subscribes the coordinator to its topics

pub mod coordinator;
pub mod handlers;
pub mod service;

pub use coordinator::{
    CoordinatorError, CoordinatorSettings, CoordinatorStats, PipelineCoordinator, SweepReport,
};
pub use handlers::{CoordinatorHandler, Route};
pub use service::{coordinator_routes, subscribe_coordinator};
