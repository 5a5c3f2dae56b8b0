//! Parlance: Spoken-Submission Analysis Coordinator
//!
//! Drives each spoken submission through a two-stage analysis pipeline over
//! an at-least-once message bus.
//!
//! ## Architecture
//!
//! - **Types**: submission, stage and state-machine types plus bus contracts
//! - **Storage**: durable per-submission state with compare-and-swap updates
//! - **Bus**: message bus traits, in-process bus, publish backoff
//! - **Pipeline**: the coordinator and its bus handlers
//! - **Background**: stage-timeout sweeps and archive pruning
//! - **Simulation**: stand-in stage workers for demos and tests

pub mod background;
pub mod bus;
pub mod config;
pub mod pipeline;
pub mod simulation;
pub mod storage;
pub mod types;

// Re-export configuration
pub use config::PipelineConfig;

// Re-export commonly used types
pub use types::{
    topics, CompletionResult, EventOutcome, OverallStatus, StageFailure, StageInput, StageKind,
    StageResult, StageStatus, Submission, SubmissionState,
};

// Re-export the coordinator
pub use pipeline::{CoordinatorSettings, CoordinatorStats, PipelineCoordinator};

// Re-export storage
pub use storage::{SledTracker, SubmissionTracker, TrackerError, TrackerStats};

// Re-export bus components
pub use bus::{InMemoryBus, MessageBus, MessageHandler};
