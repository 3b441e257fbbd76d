use serde::{Deserialize, Serialize};

use crate::{default_timestamp, repository::Entity};

/// Ledger entry marking an event id as fully handled.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ProcessedEventRecord {
    pub event_id: String,
    pub processed_at: i64,
}

impl ProcessedEventRecord {
    pub fn now(event_id: impl Into<String>) -> Self {
        Self {
            event_id: event_id.into(),
            processed_at: default_timestamp(),
        }
    }
}

impl Entity for ProcessedEventRecord {
    fn timestamp(&self) -> i64 {
        self.processed_at
    }
}
