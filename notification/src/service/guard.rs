use std::{
    collections::{HashSet, VecDeque},
    sync::{Arc, Mutex},
};

use common::entities::{notification::NotificationRecord, processed_event::ProcessedEventRecord};

use crate::{
    error,
    repositories::{CommitOutcome, EventLedger},
};

/// Bounded set of event ids known to be processed. Oldest entries go first.
struct RecentlyProcessed {
    capacity: usize,
    order: VecDeque<String>,
    ids: HashSet<String>,
}

impl RecentlyProcessed {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            order: VecDeque::new(),
            ids: HashSet::new(),
        }
    }

    fn contains(&self, event_id: &str) -> bool {
        self.ids.contains(event_id)
    }

    fn insert(&mut self, event_id: &str) {
        if self.capacity == 0 || self.ids.contains(event_id) {
            return;
        }
        while self.order.len() >= self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.ids.remove(&evicted);
            }
        }
        self.order.push_back(event_id.to_string());
        self.ids.insert(event_id.to_string());
    }
}

/// Suppresses repeated effects of the same event under at-least-once delivery.
///
/// `has_processed` is a fast pre-check; the authoritative check happens again
/// inside `commit`, in the same transaction as the write.
#[derive(Clone)]
pub struct IdempotencyGuard {
    ledger: Arc<dyn EventLedger>,
    recent: Arc<Mutex<RecentlyProcessed>>,
}

impl IdempotencyGuard {
    pub fn new(ledger: Arc<dyn EventLedger>, cache_size: usize) -> Self {
        Self {
            ledger,
            recent: Arc::new(Mutex::new(RecentlyProcessed::new(cache_size))),
        }
    }

    pub async fn has_processed(&self, event_id: &str) -> error::Result<bool> {
        let cached = self.recent.lock().unwrap().contains(event_id);
        if cached {
            return Ok(true);
        }
        let processed = self.ledger.has_processed(event_id).await?;
        if processed {
            self.remember(event_id);
        }
        Ok(processed)
    }

    /// Check-not-processed, insert the notification, mark processed: one unit.
    pub async fn commit(&self, notification: &NotificationRecord) -> error::Result<CommitOutcome> {
        let processed = ProcessedEventRecord::now(notification.source_event_id.clone());
        let outcome = self.ledger.commit(notification, &processed).await?;
        self.remember(&notification.source_event_id);
        Ok(outcome)
    }

    /// Records an id that lost a duplicate-key race, so redeliveries skip the store.
    pub fn remember(&self, event_id: &str) {
        self.recent.lock().unwrap().insert(event_id);
    }
}
