use mongodb::bson::oid::ObjectId;
use serde::{Deserialize, Serialize};

use crate::repository::Entity;

/// Stored notification. Written once per source event and never updated.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct NotificationRecord {
    pub id: ObjectId,
    pub recipient_id: String,
    pub source_event_id: String,
    pub kind: String,
    pub body: String,
    pub created_at: i64,
}

impl Entity for NotificationRecord {
    fn timestamp(&self) -> i64 {
        self.created_at
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct PublicNotification {
    pub id: String,
    pub recipient_id: String,
    pub source_event_id: String,
    pub kind: String,
    pub body: String,
    pub created_at: i64,
}

impl From<NotificationRecord> for PublicNotification {
    fn from(notification: NotificationRecord) -> Self {
        Self {
            id: notification.id.to_hex(),
            recipient_id: notification.recipient_id,
            source_event_id: notification.source_event_id,
            kind: notification.kind,
            body: notification.body,
            created_at: notification.created_at,
        }
    }
}
