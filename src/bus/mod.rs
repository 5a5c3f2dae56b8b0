//! Message Bus Adapter
//!
//! The coordinator only sees the bus through two traits:
//! - [`MessageBus`]: fire-and-forget `publish` plus `subscribe`
//! - [`MessageHandler`]: invoked once per delivery; `Err(Nack)` asks for
//!   redelivery, `Ok(())` acknowledges
//!
//! Delivery is assumed at-least-once, unordered and without deduplication.
//! Everything above this module compensates for that.

mod backoff;
mod memory;

pub use backoff::{publish_with_backoff, BackoffPolicy};
pub use memory::InMemoryBus;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Clone, thiserror::Error)]
pub enum BusError {
    /// The broker rejected or dropped the publish; retrying may succeed
    #[error("bus transport error: {0}")]
    Transport(String),
    #[error("bus is closed")]
    Closed,
    #[error("message serialization error: {0}")]
    Serialization(String),
}

impl BusError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}

impl From<serde_json::Error> for BusError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Negative acknowledgement: the message should be delivered again.
#[derive(Debug, Clone, thiserror::Error)]
#[error("message not acknowledged: {reason}")]
pub struct Nack {
    pub reason: String,
}

impl Nack {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// One delivery of a published payload.
#[derive(Debug, Clone)]
pub struct Message {
    /// Stable across redeliveries of the same publish
    pub id: Uuid,
    pub topic: String,
    pub payload: Vec<u8>,
    /// 1 on first delivery
    pub delivery_attempt: u32,
    pub published_at: DateTime<Utc>,
}

impl Message {
    pub fn new(topic: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            id: Uuid::new_v4(),
            topic: topic.into(),
            payload,
            delivery_attempt: 1,
            published_at: Utc::now(),
        }
    }

    /// Decode the JSON payload.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, BusError> {
        Ok(serde_json::from_slice(&self.payload)?)
    }

    pub(crate) fn redelivery(&self) -> Self {
        Self {
            delivery_attempt: self.delivery_attempt.saturating_add(1),
            ..self.clone()
        }
    }
}

#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: &Message) -> Result<(), Nack>;
}

#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Hand `payload` to the bus. Fails only on transport errors.
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BusError>;

    /// Deliver every later publish on `topic` to `handler`.
    async fn subscribe(&self, topic: &str, handler: Arc<dyn MessageHandler>)
        -> Result<(), BusError>;
}

/// Serialize `value` as JSON and publish it once.
pub async fn publish_json<T>(bus: &dyn MessageBus, topic: &str, value: &T) -> Result<(), BusError>
where
    T: Serialize + ?Sized,
{
    let payload = serde_json::to_vec(value)?;
    bus.publish(topic, payload).await
}
