use serde::{Deserialize, Serialize};

pub mod change;
pub mod product;
pub mod snapshot;

// Re-exports for convenience
pub use change::*;
pub use product::*;
pub use snapshot::*;

// Common enums used across models
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Availability {
    InStock,
    Preorder,
    OutOfStock,
    Unknown,
}

impl Availability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Availability::InStock => "in_stock",
            Availability::Preorder => "preorder",
            Availability::OutOfStock => "out_of_stock",
            Availability::Unknown => "unknown",
        }
    }

    /// Purchasable states: the ones a restock transition lands on.
    pub fn is_orderable(&self) -> bool {
        matches!(self, Availability::InStock | Availability::Preorder)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ReportType {
    Full,
    Changes,
}
