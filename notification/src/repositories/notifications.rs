use async_trait::async_trait;
use common::{
    entities::{notification::NotificationRecord, processed_event::ProcessedEventRecord},
    repository::{mongo_repository::MongoRepository, Repository},
};
use mongodb::{
    bson::{doc, oid::ObjectId, Bson},
    error::{ErrorKind, WriteFailure},
    Client, ClientSession,
};

use super::{CommitOutcome, EventLedger};
use crate::error::{self, PipelineError};

const DUPLICATE_KEY: i32 = 11000;

pub const NOTIFICATIONS_COLLECTION: &str = "notifications";
pub const PROCESSED_EVENTS_COLLECTION: &str = "processed_events";

/// MongoDB-backed ledger. Commits run in a multi-document transaction, so the
/// deployment must be a replica set.
pub struct MongoEventLedger {
    client: Client,
    notifications: MongoRepository<NotificationRecord>,
    processed: MongoRepository<ProcessedEventRecord>,
}

impl MongoEventLedger {
    pub async fn connect(uri: &str, database: &str) -> anyhow::Result<Self> {
        let client = Client::with_uri_str(uri).await?;
        client
            .database(database)
            .run_command(doc! {"ping": 1}, None)
            .await?;

        let ledger = Self {
            notifications: MongoRepository::new(&client, database, NOTIFICATIONS_COLLECTION),
            processed: MongoRepository::new(&client, database, PROCESSED_EVENTS_COLLECTION),
            client,
        };
        ledger.notifications.ensure_index("source_event_id", true).await?;
        ledger.notifications.ensure_index("recipient_id", false).await?;
        ledger.processed.ensure_index("event_id", true).await?;

        Ok(ledger)
    }

    async fn commit_in(
        &self,
        session: &mut ClientSession,
        notification: &NotificationRecord,
        processed: &ProcessedEventRecord,
    ) -> mongodb::error::Result<CommitOutcome> {
        let existing = self
            .processed
            .collection
            .find_one_with_session(doc! {"event_id": processed.event_id.as_str()}, None, session)
            .await?;
        if existing.is_some() {
            return Ok(CommitOutcome::AlreadyProcessed);
        }

        self.notifications
            .collection
            .insert_one_with_session(notification, None, session)
            .await?;
        self.processed
            .collection
            .insert_one_with_session(processed, None, session)
            .await?;
        Ok(CommitOutcome::Committed)
    }
}

fn is_duplicate_key(err: &mongodb::error::Error) -> bool {
    match err.kind.as_ref() {
        ErrorKind::Write(WriteFailure::WriteError(e)) => e.code == DUPLICATE_KEY,
        ErrorKind::Command(e) => e.code == DUPLICATE_KEY,
        _ => false,
    }
}

fn classify(err: mongodb::error::Error) -> PipelineError {
    if is_duplicate_key(&err) {
        PipelineError::ConstraintViolation {
            reason: err.to_string(),
        }
    } else {
        PipelineError::store_unavailable(err)
    }
}

#[async_trait]
impl EventLedger for MongoEventLedger {
    async fn has_processed(&self, event_id: &str) -> error::Result<bool> {
        let found = self
            .processed
            .find("event_id", &Bson::String(event_id.to_string()))
            .await
            .map_err(PipelineError::store_unavailable)?;
        Ok(found.is_some())
    }

    async fn commit(
        &self,
        notification: &NotificationRecord,
        processed: &ProcessedEventRecord,
    ) -> error::Result<CommitOutcome> {
        let mut session = self.client.start_session(None).await.map_err(classify)?;
        session.start_transaction(None).await.map_err(classify)?;

        match self.commit_in(&mut session, notification, processed).await {
            Ok(CommitOutcome::Committed) => {
                session.commit_transaction().await.map_err(classify)?;
                Ok(CommitOutcome::Committed)
            }
            Ok(CommitOutcome::AlreadyProcessed) => {
                if let Err(err) = session.abort_transaction().await {
                    log::debug!("Abort of read-only transaction failed: {}", err);
                }
                Ok(CommitOutcome::AlreadyProcessed)
            }
            Err(err) => {
                if let Err(abort) = session.abort_transaction().await {
                    log::debug!("Abort after failed commit failed: {}", abort);
                }
                Err(classify(err))
            }
        }
    }

    async fn find_by_recipient(&self, recipient_id: &str) -> error::Result<Vec<NotificationRecord>> {
        self.notifications
            .find_many("recipient_id", &Bson::String(recipient_id.to_string()))
            .await
            .map_err(PipelineError::store_unavailable)
    }

    async fn find_by_id(&self, id: &ObjectId) -> error::Result<Option<NotificationRecord>> {
        self.notifications
            .find("id", &Bson::ObjectId(*id))
            .await
            .map_err(PipelineError::store_unavailable)
    }
}
