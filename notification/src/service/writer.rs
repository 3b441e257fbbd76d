use std::{sync::Arc, time::Duration};

use common::{default_timestamp, entities::notification::NotificationRecord};
use mongodb::bson::oid::ObjectId;

use super::{decoder::DomainEvent, decoder::EventType, guard::IdempotencyGuard};
use crate::{
    error::{self, PipelineError},
    repositories::CommitOutcome,
};

/// Told about every notification right after it is persisted.
pub trait NotificationListener: Send + Sync {
    fn notify(&self, notification: &NotificationRecord);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    Written(NotificationRecord),
    Duplicate,
}

pub fn notification_body(event: &DomainEvent) -> String {
    match event.kind {
        EventType::ProductCreated => match event.text("name").or_else(|| event.text("productName")) {
            Some(name) => format!("A new product \"{}\" was created under your account.", name),
            None => "A new product was created under your account.".to_string(),
        },
    }
}

pub struct NotificationWriter {
    guard: IdempotencyGuard,
    store_timeout: Duration,
    listener: Option<Arc<dyn NotificationListener>>,
}

impl NotificationWriter {
    pub fn new(
        guard: IdempotencyGuard,
        store_timeout: Duration,
        listener: Option<Arc<dyn NotificationListener>>,
    ) -> Self {
        Self {
            guard,
            store_timeout,
            listener,
        }
    }

    fn build(&self, event: &DomainEvent) -> error::Result<NotificationRecord> {
        let recipient_id = event.recipient_id().ok_or_else(|| {
            PipelineError::malformed(format!("event {} has no recipient", event.event_id))
        })?;

        Ok(NotificationRecord {
            id: ObjectId::new(),
            recipient_id: recipient_id.to_string(),
            source_event_id: event.event_id.clone(),
            kind: event.kind.to_string(),
            body: notification_body(event),
            created_at: default_timestamp(),
        })
    }

    /// Persists the notification for `event`. Call only after the guard has
    /// reported the event as not yet processed.
    pub async fn write(&self, event: &DomainEvent) -> error::Result<WriteOutcome> {
        let notification = self.build(event)?;

        let committed = tokio::time::timeout(self.store_timeout, self.guard.commit(&notification))
            .await
            .map_err(|_| {
                PipelineError::store_unavailable(format!(
                    "store transaction timed out after {:?}",
                    self.store_timeout
                ))
            })?;

        match committed {
            Ok(CommitOutcome::Committed) => {
                if let Some(listener) = &self.listener {
                    listener.notify(&notification);
                }
                Ok(WriteOutcome::Written(notification))
            }
            Ok(CommitOutcome::AlreadyProcessed) => Ok(WriteOutcome::Duplicate),
            Err(PipelineError::ConstraintViolation { reason }) => {
                log::info!(
                    "Event {} was written by a concurrent delivery: {}",
                    event.event_id,
                    reason
                );
                self.guard.remember(&event.event_id);
                Ok(WriteOutcome::Duplicate)
            }
            Err(err) => Err(err),
        }
    }
}
