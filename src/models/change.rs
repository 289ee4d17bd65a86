use rust_decimal::Decimal;
use serde::Serialize;

use crate::models::StockLevel;

/// One observed difference between the current scrape and the prior snapshot.
///
/// Events are produced fresh each run and never persisted; only the snapshot
/// that triggered them is.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ChangeEvent {
    pub product_id: String,
    pub kind: ChangeKind,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum ChangeKind {
    NewListing,
    PriceDrop {
        old: Decimal,
        new: Decimal,
        percent: f64,
    },
    PriceRise {
        old: Decimal,
        new: Decimal,
        percent: f64,
    },
    Restock {
        level: Option<StockLevel>,
        /// Quantity at or below the small-restock threshold: recorded, but
        /// excluded from "changes" reports.
        suppressed: bool,
    },
    OutOfStock,
    DeliveryDateChange {
        old: Option<String>,
        new: String,
    },
}

impl ChangeEvent {
    pub fn is_suppressed(&self) -> bool {
        matches!(self.kind, ChangeKind::Restock { suppressed: true, .. })
    }
}
