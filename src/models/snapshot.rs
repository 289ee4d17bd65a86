use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::models::Product;

/// The persisted record of all products' last-known state, keyed by product
/// id. Read-only during a run's diff phase; replaced wholesale by the
/// orchestrator after a fully successful run.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Snapshot {
    pub generated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub products: BTreeMap<String, Product>,
}

impl Snapshot {
    pub fn from_products<'a>(
        products: impl IntoIterator<Item = &'a Product>,
        generated_at: DateTime<Utc>,
    ) -> Self {
        Snapshot {
            generated_at: Some(generated_at),
            products: products
                .into_iter()
                .map(|p| (p.key(), p.clone()))
                .collect(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&Product> {
        self.products.get(key)
    }

    pub fn len(&self) -> usize {
        self.products.len()
    }

    pub fn is_empty(&self) -> bool {
        self.products.is_empty()
    }
}

/// A composed notification held back by quiet hours, flushed on the first
/// eligible run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PendingMessage {
    pub chat_id: String,
    pub thread_id: Option<i64>,
    pub text: String,
    pub queued_at: DateTime<Utc>,
}

/// Everything the state file holds: the diff baseline plus router
/// bookkeeping (deferred queue, heartbeat markers).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PersistedState {
    pub snapshot: Snapshot,
    #[serde(default)]
    pub pending: Vec<PendingMessage>,
    /// Heartbeat time ("HH:MM") -> date it last fired.
    #[serde(default)]
    pub heartbeats_sent: BTreeMap<String, NaiveDate>,
}
