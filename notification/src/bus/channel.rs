//! In-process bus with broker-like delivery semantics.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex,
    },
};

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex as AsyncMutex};

use super::{DeadLetter, DeadLetterSink, DeliveryTag, MessageSource, RawEnvelope};
use crate::error::{self, PipelineError};

#[derive(Default)]
struct Deliveries {
    in_flight: HashMap<DeliveryTag, RawEnvelope>,
    acked: Vec<DeliveryTag>,
    nacked: Vec<DeliveryTag>,
}

pub struct ChannelSource {
    sender: Mutex<Option<mpsc::UnboundedSender<RawEnvelope>>>,
    receiver: AsyncMutex<mpsc::UnboundedReceiver<RawEnvelope>>,
    next_tag: AtomicU64,
    deliveries: Mutex<Deliveries>,
}

impl Default for ChannelSource {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelSource {
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            sender: Mutex::new(Some(sender)),
            receiver: AsyncMutex::new(receiver),
            next_tag: AtomicU64::new(1),
            deliveries: Mutex::new(Deliveries::default()),
        }
    }

    fn tag(&self) -> DeliveryTag {
        self.next_tag.fetch_add(1, Ordering::SeqCst)
    }

    fn enqueue(&self, envelope: RawEnvelope) -> error::Result<()> {
        let sender = self.sender.lock().unwrap();
        let Some(sender) = sender.as_ref() else {
            return Err(PipelineError::connection_lost("channel closed"));
        };
        sender
            .send(envelope)
            .map_err(|_| PipelineError::connection_lost("channel closed"))
    }

    pub fn publish(&self, payload: impl Into<Vec<u8>>) -> error::Result<DeliveryTag> {
        let envelope = RawEnvelope::new(payload, self.tag());
        let tag = envelope.delivery_tag;
        self.enqueue(envelope)?;
        Ok(tag)
    }

    /// Stops accepting messages. Already queued ones are still delivered,
    /// after which `next_envelope` reports `ConnectionLost`.
    pub fn close(&self) {
        self.sender.lock().unwrap().take();
    }

    /// Brings a closed source back with an empty queue. Deliveries still in
    /// flight from before the close keep their tags and can be settled.
    pub async fn reopen(&self) {
        let (sender, receiver) = mpsc::unbounded_channel();
        *self.receiver.lock().await = receiver;
        *self.sender.lock().unwrap() = Some(sender);
    }

    pub fn acked(&self) -> Vec<DeliveryTag> {
        self.deliveries.lock().unwrap().acked.clone()
    }

    pub fn nacked(&self) -> Vec<DeliveryTag> {
        self.deliveries.lock().unwrap().nacked.clone()
    }

    pub fn in_flight(&self) -> usize {
        self.deliveries.lock().unwrap().in_flight.len()
    }
}

#[async_trait]
impl MessageSource for ChannelSource {
    async fn next_envelope(&self) -> error::Result<RawEnvelope> {
        let mut receiver = self.receiver.lock().await;
        let Some(envelope) = receiver.recv().await else {
            return Err(PipelineError::connection_lost("channel closed"));
        };
        self.deliveries
            .lock()
            .unwrap()
            .in_flight
            .insert(envelope.delivery_tag, envelope.clone());
        Ok(envelope)
    }

    async fn ack(&self, tag: DeliveryTag) -> error::Result<()> {
        let mut deliveries = self.deliveries.lock().unwrap();
        if deliveries.in_flight.remove(&tag).is_none() {
            return Err(PipelineError::ack_failure(format!("unknown delivery tag {}", tag)));
        }
        deliveries.acked.push(tag);
        Ok(())
    }

    async fn nack(&self, tag: DeliveryTag, requeue: bool) -> error::Result<()> {
        let envelope = {
            let mut deliveries = self.deliveries.lock().unwrap();
            let Some(envelope) = deliveries.in_flight.remove(&tag) else {
                return Err(PipelineError::ack_failure(format!("unknown delivery tag {}", tag)));
            };
            deliveries.nacked.push(tag);
            envelope
        };

        if requeue {
            self.enqueue(RawEnvelope {
                payload: envelope.payload,
                delivery_tag: self.tag(),
                redelivered: true,
                delivery_count: envelope.delivery_count + 1,
                count_known: true,
            })?;
        }
        Ok(())
    }
}

pub struct ChannelDeadLetters {
    sender: mpsc::UnboundedSender<DeadLetter>,
}

impl ChannelDeadLetters {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<DeadLetter>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

#[async_trait]
impl DeadLetterSink for ChannelDeadLetters {
    async fn publish(&self, letter: DeadLetter) -> error::Result<()> {
        self.sender
            .send(letter)
            .map_err(|e| PipelineError::ack_failure(format!("dead-letter channel closed: {}", e)))
    }
}
