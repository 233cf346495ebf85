use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::entry::EventDraft;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionStatus {
    Active,
    Committed,
    Aborted,
}

impl std::fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Active => "active",
            Self::Committed => "committed",
            Self::Aborted => "aborted",
        };
        f.write_str(s)
    }
}

/// Events staged for an all-or-nothing commit.
///
/// Positions are assigned at commit time, so an aborted transaction never
/// consumes offsets.
#[derive(Debug, Clone)]
pub(crate) struct Transaction {
    pub id: String,
    pub producer_id: String,
    pub events: Vec<EventDraft>,
    pub started_at: DateTime<Utc>,
    pub timeout: Duration,
    pub status: TransactionStatus,
}

impl Transaction {
    pub fn new(producer_id: impl Into<String>, timeout: Duration) -> Self {
        Self {
            id: weft_core::types::new_id(),
            producer_id: producer_id.into(),
            events: Vec::new(),
            started_at: Utc::now(),
            timeout,
            status: TransactionStatus::Active,
        }
    }

    pub fn is_expired(&self) -> bool {
        let elapsed = (Utc::now() - self.started_at).to_std().unwrap_or_default();
        elapsed >= self.timeout
    }
}
