//! Message bus seam: what the dispatcher pulls envelopes from and where
//! unprocessable messages end up.

pub mod channel;
pub mod rabbit;

use async_trait::async_trait;

use crate::error;

pub type DeliveryTag = u64;

/// A message exactly as the bus handed it over.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEnvelope {
    pub payload: Vec<u8>,
    pub delivery_tag: DeliveryTag,
    pub redelivered: bool,
    /// Deliveries so far, including this one. Always at least 1.
    pub delivery_count: u32,
    /// False when the bus only flagged a redelivery without saying how many
    /// times the message was delivered before.
    pub count_known: bool,
}

impl RawEnvelope {
    pub fn new(payload: impl Into<Vec<u8>>, delivery_tag: DeliveryTag) -> Self {
        Self {
            payload: payload.into(),
            delivery_tag,
            redelivered: false,
            delivery_count: 1,
            count_known: true,
        }
    }
}

/// Pull-based view of a bus subscription with manual acknowledgment.
#[async_trait]
pub trait MessageSource: Send + Sync {
    /// Waits until a message is available. Fails with `ConnectionLost` when
    /// the subscription is gone.
    async fn next_envelope(&self) -> error::Result<RawEnvelope>;

    async fn ack(&self, tag: DeliveryTag) -> error::Result<()>;

    async fn nack(&self, tag: DeliveryTag, requeue: bool) -> error::Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetter {
    pub payload: Vec<u8>,
    pub reason: String,
    pub attempts: u32,
    pub failed_at: i64,
}

#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn publish(&self, letter: DeadLetter) -> error::Result<()>;
}
