//! Turns a processing outcome into exactly one ack, requeue or dead-letter.

use std::{
    collections::{HashMap, VecDeque},
    future::Future,
    sync::{Arc, Mutex},
    time::Duration,
};

use common::default_timestamp;

use crate::{
    bus::{DeadLetter, DeadLetterSink, MessageSource, RawEnvelope},
    error::{self, PipelineError},
};

/// Lifecycle of a single message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageState {
    Received,
    Decoded,
    Deduplicated,
    Duplicate,
    Written,
    Acked,
    Failed,
}

impl MessageState {
    pub fn can_advance_to(self, next: MessageState) -> bool {
        use MessageState::*;

        match (self, next) {
            (Acked, _) | (Failed, _) => false,
            (_, Failed) => true,
            (Received, Decoded)
            | (Decoded, Deduplicated)
            | (Decoded, Duplicate)
            | (Deduplicated, Written)
            | (Deduplicated, Duplicate)
            | (Duplicate, Acked)
            | (Written, Acked) => true,
            _ => false,
        }
    }

    pub fn advance(&mut self, next: MessageState) {
        debug_assert!(
            self.can_advance_to(next),
            "illegal message transition {:?} -> {:?}",
            self,
            next
        );
        *self = next;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessingOutcome {
    Written,
    Duplicate,
    Failed(PipelineError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AckDecision {
    Ack,
    Requeue,
    DeadLetter { reason: String },
}

const TRACKED_REDELIVERIES: usize = 10_000;
const MAX_BACKOFF_STEPS: u32 = 10;

/// Counts redeliveries the broker flagged without counting them itself.
/// Keyed by event id, so copies of one event share an entry here; only used
/// when an envelope arrives without an exact count. Oldest entries are
/// evicted first.
pub struct RedeliveryTracker {
    capacity: usize,
    attempts: Mutex<(HashMap<String, u32>, VecDeque<String>)>,
}

impl Default for RedeliveryTracker {
    fn default() -> Self {
        Self::new(TRACKED_REDELIVERIES)
    }
}

impl RedeliveryTracker {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            attempts: Mutex::new((HashMap::new(), VecDeque::new())),
        }
    }

    /// Returns the attempt number of a redelivery. The untracked first
    /// delivery counts as attempt 1.
    pub fn record(&self, key: &str, delivery_count: u32) -> u32 {
        let mut guard = self.attempts.lock().unwrap();
        let (attempts, order) = &mut *guard;
        if !attempts.contains_key(key) {
            while order.len() >= self.capacity {
                if let Some(evicted) = order.pop_front() {
                    attempts.remove(&evicted);
                }
            }
            order.push_back(key.to_string());
        }
        let seen = attempts.entry(key.to_string()).or_insert(1);
        *seen = (*seen + 1).max(delivery_count);
        *seen
    }

    pub fn clear(&self, key: &str) {
        let mut guard = self.attempts.lock().unwrap();
        let (attempts, order) = &mut *guard;
        if attempts.remove(key).is_some() {
            order.retain(|tracked| tracked != key);
        }
    }

    pub fn tracked(&self) -> usize {
        self.attempts.lock().unwrap().0.len()
    }
}

pub struct AckController {
    source: Arc<dyn MessageSource>,
    dead_letters: Arc<dyn DeadLetterSink>,
    max_redeliveries: u32,
    ack_timeout: Duration,
    requeue_delay: Duration,
    tracker: RedeliveryTracker,
}

impl AckController {
    pub fn new(
        source: Arc<dyn MessageSource>,
        dead_letters: Arc<dyn DeadLetterSink>,
        max_redeliveries: u32,
        ack_timeout: Duration,
        requeue_delay: Duration,
    ) -> Self {
        Self {
            source,
            dead_letters,
            max_redeliveries,
            ack_timeout,
            requeue_delay,
            tracker: RedeliveryTracker::default(),
        }
    }

    /// `event_id` is `None` when the payload never decoded.
    pub fn decide(
        &self,
        envelope: &RawEnvelope,
        event_id: Option<&str>,
        outcome: &ProcessingOutcome,
    ) -> (AckDecision, u32) {
        let err = match outcome {
            ProcessingOutcome::Written | ProcessingOutcome::Duplicate => {
                return (AckDecision::Ack, envelope.delivery_count)
            }
            ProcessingOutcome::Failed(PipelineError::ConstraintViolation { .. }) => {
                return (AckDecision::Ack, envelope.delivery_count)
            }
            ProcessingOutcome::Failed(err) => err,
        };

        if !err.is_retryable() {
            return (
                AckDecision::DeadLetter {
                    reason: err.to_string(),
                },
                envelope.delivery_count,
            );
        }

        let attempts = if envelope.count_known {
            envelope.delivery_count
        } else {
            let key = event_id
                .map(str::to_string)
                .unwrap_or_else(|| format!("tag:{}", envelope.delivery_tag));
            self.tracker.record(&key, envelope.delivery_count)
        };
        if attempts.saturating_sub(1) >= self.max_redeliveries {
            (
                AckDecision::DeadLetter {
                    reason: format!("{} (gave up after {} attempts)", err, attempts),
                },
                attempts,
            )
        } else {
            (AckDecision::Requeue, attempts)
        }
    }

    /// Applies the decision for `outcome` against the bus and returns the
    /// terminal state of the message.
    pub async fn settle(
        &self,
        envelope: &RawEnvelope,
        event_id: Option<&str>,
        outcome: ProcessingOutcome,
    ) -> MessageState {
        let (decision, attempts) = self.decide(envelope, event_id, &outcome);
        let tag = envelope.delivery_tag;

        match decision {
            AckDecision::Ack => {
                self.forget(event_id);
                self.acknowledge("ack", tag, self.source.ack(tag)).await;
                MessageState::Acked
            }
            AckDecision::Requeue => {
                log::warn!(
                    "Requeueing delivery {} (event {:?}, attempt {}): {:?}",
                    tag,
                    event_id,
                    attempts,
                    outcome
                );
                // A classic queue hands a requeued message straight back.
                tokio::time::sleep(self.requeue_delay * attempts.min(MAX_BACKOFF_STEPS)).await;
                self.acknowledge("nack", tag, self.source.nack(tag, true))
                    .await;
                MessageState::Failed
            }
            AckDecision::DeadLetter { reason } => {
                let letter = DeadLetter {
                    payload: envelope.payload.clone(),
                    reason,
                    attempts,
                    failed_at: default_timestamp(),
                };
                match self.dead_letters.publish(letter).await {
                    Ok(()) => {
                        log::warn!(
                            "Dead-lettered delivery {} (event {:?}) after {} attempt(s): {:?}",
                            tag,
                            event_id,
                            attempts,
                            outcome
                        );
                        self.forget(event_id);
                        self.acknowledge("ack", tag, self.source.ack(tag)).await;
                    }
                    Err(err) => {
                        log::error!(
                            "Dead-letter publish failed for delivery {}, requeueing: {}",
                            tag,
                            err
                        );
                        self.acknowledge("nack", tag, self.source.nack(tag, true))
                            .await;
                    }
                }
                MessageState::Failed
            }
        }
    }

    fn forget(&self, event_id: Option<&str>) {
        if let Some(event_id) = event_id {
            self.tracker.clear(event_id);
        }
    }

    /// Ack failures are logged only. The broker redelivers unacknowledged
    /// messages and the idempotency guard absorbs the repeat.
    async fn acknowledge(
        &self,
        action: &str,
        tag: u64,
        request: impl Future<Output = error::Result<()>>,
    ) {
        let failure = match tokio::time::timeout(self.ack_timeout, request).await {
            Ok(Ok(())) => return,
            Ok(Err(err)) => err,
            Err(_) => PipelineError::ack_failure(format!("{} timed out after {:?}", action, self.ack_timeout)),
        };
        log::warn!("{} of delivery {} failed: {}", action, tag, failure);
    }
}
