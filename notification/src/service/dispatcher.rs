//! Worker pool that drives every envelope from the bus to a settled state.

use std::{sync::Arc, time::Duration};

use futures::future::join_all;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{
    ack::{AckController, MessageState, ProcessingOutcome},
    decoder::EventDecoder,
    guard::IdempotencyGuard,
    writer::{NotificationListener, NotificationWriter, WriteOutcome},
};
use crate::{
    bus::{DeadLetterSink, MessageSource, RawEnvelope},
    config::DispatcherSettings,
    repositories::EventLedger,
};

pub struct Dispatcher {
    source: Arc<dyn MessageSource>,
    decoder: EventDecoder,
    guard: IdempotencyGuard,
    writer: NotificationWriter,
    acks: AckController,
    concurrency: usize,
    reconnect_delay: Duration,
}

impl Dispatcher {
    pub fn new(
        source: Arc<dyn MessageSource>,
        dead_letters: Arc<dyn DeadLetterSink>,
        ledger: Arc<dyn EventLedger>,
        listener: Option<Arc<dyn NotificationListener>>,
        settings: &DispatcherSettings,
    ) -> Self {
        let guard = IdempotencyGuard::new(ledger, settings.processed_cache_size);
        Self {
            writer: NotificationWriter::new(guard.clone(), settings.store_timeout, listener),
            acks: AckController::new(
                source.clone(),
                dead_letters,
                settings.max_redeliveries,
                settings.ack_timeout,
                settings.requeue_delay,
            ),
            source,
            decoder: EventDecoder,
            guard,
            concurrency: settings.concurrency.max(1),
            reconnect_delay: settings.reconnect_delay,
        }
    }

    /// Runs one envelope through decode, dedup, write and settlement.
    pub async fn process(&self, envelope: RawEnvelope) -> MessageState {
        let mut state = MessageState::Received;

        let event = match self.decoder.decode(&envelope) {
            Ok(event) => event,
            Err(err) => {
                log::warn!("Rejecting delivery {}: {}", envelope.delivery_tag, err);
                return self
                    .acks
                    .settle(&envelope, None, ProcessingOutcome::Failed(err))
                    .await;
            }
        };
        state.advance(MessageState::Decoded);
        let event_id = Some(event.event_id.as_str());

        let outcome = match self.guard.has_processed(&event.event_id).await {
            Ok(true) => {
                log::debug!("Event {} already processed, skipping", event.event_id);
                state.advance(MessageState::Duplicate);
                ProcessingOutcome::Duplicate
            }
            Ok(false) => {
                state.advance(MessageState::Deduplicated);
                match self.writer.write(&event).await {
                    Ok(WriteOutcome::Written(notification)) => {
                        log::info!(
                            "Notification {} created for {} from event {}",
                            notification.id,
                            notification.recipient_id,
                            event.event_id
                        );
                        state.advance(MessageState::Written);
                        ProcessingOutcome::Written
                    }
                    Ok(WriteOutcome::Duplicate) => {
                        state.advance(MessageState::Duplicate);
                        ProcessingOutcome::Duplicate
                    }
                    Err(err) => ProcessingOutcome::Failed(err),
                }
            }
            Err(err) => ProcessingOutcome::Failed(err),
        };

        let settled = self.acks.settle(&envelope, event_id, outcome).await;
        state.advance(settled);
        state
    }

    /// Starts the worker pool. Workers stop taking new messages once `cancel`
    /// fires; a message already taken is always settled first.
    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) -> DispatcherHandle {
        log::info!("Starting {} dispatcher worker(s)", self.concurrency);
        let workers = (0..self.concurrency)
            .map(|worker| tokio::spawn(self.clone().run_worker(worker, cancel.clone())))
            .collect();
        DispatcherHandle { workers }
    }

    async fn run_worker(self: Arc<Self>, worker: usize, cancel: CancellationToken) {
        log::debug!("Worker {} started", worker);
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                next = self.source.next_envelope() => next,
            };

            match next {
                Ok(envelope) => {
                    let state = self.process(envelope).await;
                    log::trace!("Worker {} settled a message as {:?}", worker, state);
                }
                Err(err) => {
                    if err.is_retryable() {
                        log::warn!("Worker {}: {}; retrying in {:?}", worker, err, self.reconnect_delay);
                    } else {
                        log::error!("Worker {}: {}", worker, err);
                    }
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(self.reconnect_delay) => {}
                    }
                }
            }
        }
        log::debug!("Worker {} stopped", worker);
    }
}

pub struct DispatcherHandle {
    workers: Vec<JoinHandle<()>>,
}

impl DispatcherHandle {
    pub async fn join(self) {
        for result in join_all(self.workers).await {
            if let Err(err) = result {
                log::error!("Dispatcher worker ended abnormally: {}", err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicU32, Ordering},
        Mutex,
    };

    use async_trait::async_trait;
    use common::entities::{
        notification::NotificationRecord, processed_event::ProcessedEventRecord,
    };
    use mongodb::bson::oid::ObjectId;
    use serde_json::json;
    use tokio::sync::{mpsc, Barrier};

    use super::*;
    use crate::{
        bus::{
            channel::{ChannelDeadLetters, ChannelSource},
            DeadLetter,
        },
        error::{self, PipelineError},
        repositories::{memory::InMemoryEventLedger, CommitOutcome},
    };

    /// Fails the first `failures` commits, then behaves like the inner ledger.
    struct FlakyLedger {
        inner: InMemoryEventLedger,
        failures: AtomicU32,
    }

    impl FlakyLedger {
        fn new(failures: u32) -> Self {
            Self {
                inner: InMemoryEventLedger::new(),
                failures: AtomicU32::new(failures),
            }
        }
    }

    #[async_trait]
    impl EventLedger for FlakyLedger {
        async fn has_processed(&self, event_id: &str) -> error::Result<bool> {
            self.inner.has_processed(event_id).await
        }

        async fn commit(
            &self,
            notification: &NotificationRecord,
            processed: &ProcessedEventRecord,
        ) -> error::Result<CommitOutcome> {
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                return Err(PipelineError::store_unavailable("primary stepped down"));
            }
            self.inner.commit(notification, processed).await
        }

        async fn find_by_recipient(&self, recipient_id: &str) -> error::Result<Vec<NotificationRecord>> {
            self.inner.find_by_recipient(recipient_id).await
        }

        async fn find_by_id(&self, id: &ObjectId) -> error::Result<Option<NotificationRecord>> {
            self.inner.find_by_id(id).await
        }
    }

    /// Holds the first two pre-checks until both have run, so two workers
    /// carrying the same event both reach `commit`.
    struct RacingLedger {
        inner: InMemoryEventLedger,
        prechecks: AtomicU32,
        barrier: Barrier,
        outcomes: Mutex<Vec<CommitOutcome>>,
    }

    impl RacingLedger {
        fn new() -> Self {
            Self {
                inner: InMemoryEventLedger::new(),
                prechecks: AtomicU32::new(0),
                barrier: Barrier::new(2),
                outcomes: Mutex::new(vec![]),
            }
        }
    }

    #[async_trait]
    impl EventLedger for RacingLedger {
        async fn has_processed(&self, event_id: &str) -> error::Result<bool> {
            let processed = self.inner.has_processed(event_id).await?;
            if self.prechecks.fetch_add(1, Ordering::SeqCst) < 2 {
                self.barrier.wait().await;
            }
            Ok(processed)
        }

        async fn commit(
            &self,
            notification: &NotificationRecord,
            processed: &ProcessedEventRecord,
        ) -> error::Result<CommitOutcome> {
            let outcome = self.inner.commit(notification, processed).await?;
            self.outcomes.lock().unwrap().push(outcome);
            Ok(outcome)
        }

        async fn find_by_recipient(&self, recipient_id: &str) -> error::Result<Vec<NotificationRecord>> {
            self.inner.find_by_recipient(recipient_id).await
        }

        async fn find_by_id(&self, id: &ObjectId) -> error::Result<Option<NotificationRecord>> {
            self.inner.find_by_id(id).await
        }
    }

    struct Harness<L> {
        source: Arc<ChannelSource>,
        ledger: Arc<L>,
        dead_letters: mpsc::UnboundedReceiver<DeadLetter>,
        dispatcher: Arc<Dispatcher>,
    }

    impl<L: EventLedger + 'static> Harness<L> {
        fn new(ledger: L, settings: DispatcherSettings) -> Self {
            let source = Arc::new(ChannelSource::new());
            let ledger = Arc::new(ledger);
            let (sink, dead_letters) = ChannelDeadLetters::new();
            let dispatcher = Arc::new(Dispatcher::new(
                source.clone(),
                Arc::new(sink),
                ledger.clone(),
                None,
                &settings,
            ));
            Self {
                source,
                ledger,
                dead_letters,
                dispatcher,
            }
        }

        /// Processes messages one by one until the queue stays empty,
        /// requeued ones included.
        async fn drain(&self) -> Vec<MessageState> {
            let mut states = vec![];
            while let Ok(Ok(envelope)) =
                tokio::time::timeout(Duration::from_millis(50), self.source.next_envelope()).await
            {
                states.push(self.dispatcher.process(envelope).await);
            }
            states
        }
    }

    fn settings() -> DispatcherSettings {
        DispatcherSettings {
            concurrency: 2,
            max_redeliveries: 5,
            store_timeout: Duration::from_secs(1),
            ack_timeout: Duration::from_secs(1),
            reconnect_delay: Duration::from_millis(10),
            requeue_delay: Duration::ZERO,
            processed_cache_size: 0,
        }
    }

    fn product_created(event_id: &str) -> Vec<u8> {
        serde_json::to_vec(&json!({
            "eventId": event_id,
            "type": "ProductCreated",
            "occurredAt": "2024-03-01T10:00:00Z",
            "payload": {"userId": "u1", "name": "Desk lamp"}
        }))
        .unwrap()
    }

    #[actix_web::test]
    async fn test_single_delivery_writes_once() {
        let harness = Harness::new(InMemoryEventLedger::new(), settings());
        harness.source.publish(product_created("evt-1")).unwrap();
        harness.source.publish(product_created("evt-2")).unwrap();

        let states = harness.drain().await;

        assert_eq!(states, vec![MessageState::Acked, MessageState::Acked]);
        let notifications = harness.ledger.notifications();
        assert_eq!(notifications.len(), 2);
        assert_eq!(notifications[0].source_event_id, "evt-1");
        assert_eq!(notifications[1].source_event_id, "evt-2");
        assert_eq!(harness.source.acked().len(), 2);
    }

    #[actix_web::test]
    async fn test_redelivered_event_writes_once() {
        let harness = Harness::new(InMemoryEventLedger::new(), settings());
        for _ in 0..4 {
            harness.source.publish(product_created("evt-1")).unwrap();
        }

        let states = harness.drain().await;

        assert_eq!(states, vec![MessageState::Acked; 4]);
        assert_eq!(harness.ledger.notifications().len(), 1);
        assert_eq!(harness.ledger.processed_count(), 1);
        assert_eq!(harness.source.acked().len(), 4);
    }

    #[actix_web::test]
    async fn test_invalid_json_is_dead_lettered() {
        let mut harness = Harness::new(InMemoryEventLedger::new(), settings());
        let tag = harness.source.publish(b"{\"eventId\": ".to_vec()).unwrap();

        let states = harness.drain().await;

        assert_eq!(states, vec![MessageState::Failed]);
        assert!(harness.ledger.notifications().is_empty());
        assert_eq!(harness.source.acked(), vec![tag]);
        let letter = harness.dead_letters.try_recv().unwrap();
        assert_eq!(letter.payload, b"{\"eventId\": ".to_vec());
        assert!(letter.reason.starts_with("malformed payload"));
    }

    #[actix_web::test]
    async fn test_unknown_type_is_dead_lettered() {
        let mut harness = Harness::new(InMemoryEventLedger::new(), settings());
        let payload = serde_json::to_vec(&json!({
            "eventId": "evt-9",
            "type": "OrderShipped",
            "occurredAt": "2024-03-01T10:00:00Z",
            "payload": {"userId": "u1"}
        }))
        .unwrap();
        harness.source.publish(payload).unwrap();

        assert_eq!(harness.drain().await, vec![MessageState::Failed]);
        assert!(harness.ledger.notifications().is_empty());
        assert_eq!(harness.source.acked().len(), 1);
        assert_eq!(
            harness.dead_letters.try_recv().unwrap().reason,
            "unknown event type: OrderShipped"
        );
    }

    #[actix_web::test]
    async fn test_store_failure_then_retry_writes_once() {
        let mut harness = Harness::new(FlakyLedger::new(1), settings());
        harness.source.publish(product_created("evt-1")).unwrap();

        // First attempt is requeued, the redelivery succeeds.
        let first = harness.source.next_envelope().await.unwrap();
        assert_eq!(harness.dispatcher.process(first).await, MessageState::Failed);
        assert_eq!(harness.source.nacked().len(), 1);

        let states = harness.drain().await;

        assert_eq!(states, vec![MessageState::Acked]);
        assert_eq!(harness.ledger.inner.notifications().len(), 1);
        assert!(harness.dead_letters.try_recv().is_err());
    }

    #[actix_web::test]
    async fn test_persistent_store_failure_is_dead_lettered() {
        let mut harness = Harness::new(
            FlakyLedger::new(u32::MAX),
            DispatcherSettings {
                max_redeliveries: 3,
                ..settings()
            },
        );
        let first_tag = harness.source.publish(product_created("evt-1")).unwrap();

        let states = harness.drain().await;

        // Original delivery plus three redeliveries.
        assert_eq!(states, vec![MessageState::Failed; 4]);
        assert_eq!(harness.source.nacked().len(), 3);
        assert!(!harness.source.acked().contains(&first_tag));
        assert_eq!(harness.source.acked().len(), 1);
        assert!(harness.ledger.inner.notifications().is_empty());

        let letter = harness.dead_letters.try_recv().unwrap();
        assert_eq!(letter.attempts, 4);
        assert!(letter.reason.contains("store unavailable"));
    }

    #[actix_web::test]
    async fn test_copies_of_one_event_retry_independently() {
        let mut harness = Harness::new(
            FlakyLedger::new(2),
            DispatcherSettings {
                max_redeliveries: 1,
                ..settings()
            },
        );
        harness.source.publish(product_created("evt-1")).unwrap();
        harness.source.publish(product_created("evt-1")).unwrap();

        let states = harness.drain().await;

        // Both first deliveries fail and are requeued, not dead-lettered.
        assert_eq!(
            states,
            vec![
                MessageState::Failed,
                MessageState::Failed,
                MessageState::Acked,
                MessageState::Acked
            ]
        );
        assert!(harness.dead_letters.try_recv().is_err());
        assert_eq!(harness.ledger.inner.notifications().len(), 1);
    }

    #[actix_web::test]
    async fn test_concurrent_duplicates_write_once() {
        let harness = Harness::new(RacingLedger::new(), settings());
        harness.source.publish(product_created("evt-1")).unwrap();
        harness.source.publish(product_created("evt-1")).unwrap();

        let cancel = CancellationToken::new();
        let workers = harness.dispatcher.clone().spawn(cancel.clone());

        let settled = async {
            while harness.source.acked().len() < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        };
        tokio::time::timeout(Duration::from_secs(5), settled)
            .await
            .expect("both deliveries should be acked");

        cancel.cancel();
        workers.join().await;

        // Both passed the pre-check; the atomic commit picked the winner.
        let mut outcomes = harness.ledger.outcomes.lock().unwrap().clone();
        outcomes.sort_by_key(|outcome| *outcome == CommitOutcome::AlreadyProcessed);
        assert_eq!(
            outcomes,
            vec![CommitOutcome::Committed, CommitOutcome::AlreadyProcessed]
        );
        assert_eq!(harness.ledger.inner.notifications().len(), 1);
        assert_eq!(harness.source.in_flight(), 0);
    }

    #[actix_web::test]
    async fn test_shutdown_settles_in_flight_messages() {
        let harness = Harness::new(InMemoryEventLedger::new(), settings());
        let cancel = CancellationToken::new();
        let workers = harness.dispatcher.clone().spawn(cancel.clone());

        harness.source.publish(product_created("evt-1")).unwrap();
        let settled = async {
            while harness.source.acked().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        };
        tokio::time::timeout(Duration::from_secs(5), settled)
            .await
            .expect("delivery should be acked");

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), workers.join())
            .await
            .expect("idle workers should stop on cancel");

        assert_eq!(harness.source.in_flight(), 0);
        assert_eq!(harness.ledger.notifications().len(), 1);
    }

    #[actix_web::test]
    async fn test_lost_connection_does_not_stop_workers() {
        let harness = Harness::new(InMemoryEventLedger::new(), settings());
        harness.source.close();

        let cancel = CancellationToken::new();
        let workers = harness.dispatcher.clone().spawn(cancel.clone());
        tokio::time::sleep(Duration::from_millis(50)).await;

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), workers.join())
            .await
            .expect("workers should stop on cancel while reconnecting");
    }

    #[actix_web::test]
    async fn test_workers_resume_after_reconnect() {
        let harness = Harness::new(InMemoryEventLedger::new(), settings());
        harness.source.close();

        let cancel = CancellationToken::new();
        let workers = harness.dispatcher.clone().spawn(cancel.clone());
        tokio::time::sleep(Duration::from_millis(30)).await;

        harness.source.reopen().await;
        harness.source.publish(product_created("evt-1")).unwrap();
        let settled = async {
            while harness.source.acked().is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        };
        tokio::time::timeout(Duration::from_secs(5), settled)
            .await
            .expect("delivery after reconnect should be acked");

        cancel.cancel();
        workers.join().await;
        assert_eq!(harness.ledger.notifications().len(), 1);
    }
}
