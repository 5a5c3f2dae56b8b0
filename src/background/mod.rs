//! Background services: stage-timeout sweeps and archive pruning
//!
//! Runs as a tokio task under the service's cancellation token.

pub mod timeout_sweep;

pub use timeout_sweep::TimeoutSweeper;
