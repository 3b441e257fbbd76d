pub mod memory;
pub mod notifications;

use async_trait::async_trait;
use common::entities::{notification::NotificationRecord, processed_event::ProcessedEventRecord};
use mongodb::bson::oid::ObjectId;

use crate::error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    Committed,
    AlreadyProcessed,
}

/// Storage behind the idempotency guard and the notification writer.
#[async_trait]
pub trait EventLedger: Send + Sync {
    async fn has_processed(&self, event_id: &str) -> error::Result<bool>;

    /// In one atomic unit: verify `processed.event_id` is not yet processed,
    /// insert `notification`, and record `processed`.
    async fn commit(
        &self,
        notification: &NotificationRecord,
        processed: &ProcessedEventRecord,
    ) -> error::Result<CommitOutcome>;

    async fn find_by_recipient(&self, recipient_id: &str) -> error::Result<Vec<NotificationRecord>>;

    async fn find_by_id(&self, id: &ObjectId) -> error::Result<Option<NotificationRecord>>;
}
