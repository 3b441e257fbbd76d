use std::{collections::HashMap, sync::Mutex};

use async_trait::async_trait;
use common::entities::{notification::NotificationRecord, processed_event::ProcessedEventRecord};
use mongodb::bson::oid::ObjectId;

use super::{CommitOutcome, EventLedger};
use crate::error::{self, PipelineError};

#[derive(Default)]
struct LedgerState {
    processed: HashMap<String, ProcessedEventRecord>,
    notifications: Vec<NotificationRecord>,
}

/// Process-local ledger. One lock covers both collections, which makes
/// `commit` atomic.
#[derive(Default)]
pub struct InMemoryEventLedger {
    state: Mutex<LedgerState>,
}

impl InMemoryEventLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts with notifications that have no ledger entry, as left behind by
    /// writes made before the ledger existed. Their `source_event_id` stays
    /// unique, like the index on the Mongo collection.
    pub fn with_orphans(notifications: Vec<NotificationRecord>) -> Self {
        Self {
            state: Mutex::new(LedgerState {
                processed: HashMap::new(),
                notifications,
            }),
        }
    }

    pub fn notifications(&self) -> Vec<NotificationRecord> {
        self.state.lock().unwrap().notifications.clone()
    }

    pub fn processed_count(&self) -> usize {
        self.state.lock().unwrap().processed.len()
    }
}

#[async_trait]
impl EventLedger for InMemoryEventLedger {
    async fn has_processed(&self, event_id: &str) -> error::Result<bool> {
        Ok(self.state.lock().unwrap().processed.contains_key(event_id))
    }

    async fn commit(
        &self,
        notification: &NotificationRecord,
        processed: &ProcessedEventRecord,
    ) -> error::Result<CommitOutcome> {
        let mut state = self.state.lock().unwrap();
        if state.processed.contains_key(&processed.event_id) {
            return Ok(CommitOutcome::AlreadyProcessed);
        }
        if state
            .notifications
            .iter()
            .any(|n| n.source_event_id == notification.source_event_id)
        {
            return Err(PipelineError::ConstraintViolation {
                reason: format!(
                    "notification for event {} already exists",
                    notification.source_event_id
                ),
            });
        }

        state.notifications.push(notification.clone());
        state
            .processed
            .insert(processed.event_id.clone(), processed.clone());
        Ok(CommitOutcome::Committed)
    }

    async fn find_by_recipient(&self, recipient_id: &str) -> error::Result<Vec<NotificationRecord>> {
        let state = self.state.lock().unwrap();
        let mut found: Vec<NotificationRecord> = state
            .notifications
            .iter()
            .filter(|n| n.recipient_id == recipient_id)
            .cloned()
            .collect();
        found.sort_by_key(|n| std::cmp::Reverse(n.created_at));
        Ok(found)
    }

    async fn find_by_id(&self, id: &ObjectId) -> error::Result<Option<NotificationRecord>> {
        let state = self.state.lock().unwrap();
        Ok(state.notifications.iter().find(|n| &n.id == id).cloned())
    }
}
