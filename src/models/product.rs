use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::models::Availability;

/// One catalog listing as seen during a single run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Product {
    pub url: String,
    pub name: String,
    /// Parsed from the name; `None` when the name carries no capacity.
    pub capacity_ah: Option<u32>,
    /// Parsed price; `None` when the price text is absent or unparseable.
    pub price: Option<Decimal>,
    /// Raw price text as shown on the card, kept for display.
    pub price_text: Option<String>,
    pub currency: String,
    pub listed_stock_text: Option<String>,
    pub availability: Availability,
    /// Expected delivery date text, preorder listings only.
    pub delivery_date: Option<String>,
    /// Set only by the stock probe.
    pub real_stock: Option<StockLevel>,
    /// Variant dropdown labels seen on the detail page, if any.
    #[serde(default)]
    pub variant_options: Vec<String>,
    pub seen_at: DateTime<Utc>,
}

/// Quantity determined by the stock probe.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StockLevel {
    Exact(u32),
    /// The cart accepted the sentinel quantity without complaint.
    Unlimited,
    OutOfStock,
    /// The response text matched no known phrasing.
    Unknown,
}

impl StockLevel {
    pub fn count(&self) -> Option<u32> {
        match self {
            StockLevel::Exact(n) => Some(*n),
            StockLevel::OutOfStock => Some(0),
            StockLevel::Unlimited | StockLevel::Unknown => None,
        }
    }
}

impl Product {
    /// Stable identity, matching the history database key format.
    pub fn key(&self) -> String {
        format!("{}_{}", self.url, self.capacity_ah.unwrap_or(0))
    }

    /// Whether the listing warrants a real-stock probe: orderable, but the
    /// card discloses no count.
    pub fn needs_stock_probe(&self) -> bool {
        self.availability.is_orderable() && self.real_stock.is_none()
    }

    /// Capacity filter used by recipient routing. Listings without a parsed
    /// capacity fail any positive threshold.
    pub fn meets_capacity(&self, min_capacity_ah: u32) -> bool {
        if min_capacity_ah == 0 {
            return true;
        }
        self.capacity_ah.is_some_and(|c| c >= min_capacity_ah)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn sample_product(url: &str, capacity: Option<u32>) -> Product {
        Product {
            url: url.to_string(),
            name: "EVE LF280K 280Ah LiFePO4".to_string(),
            capacity_ah: capacity,
            price: None,
            price_text: None,
            currency: "EUR".to_string(),
            listed_stock_text: None,
            availability: Availability::InStock,
            delivery_date: None,
            real_stock: None,
            variant_options: Vec::new(),
            seen_at: Utc::now(),
        }
    }

    #[test]
    fn test_key_includes_capacity() {
        let product = sample_product("https://shop.example/lf280k", Some(280));
        assert_eq!(product.key(), "https://shop.example/lf280k_280");

        let no_capacity = sample_product("https://shop.example/lf280k", None);
        assert_eq!(no_capacity.key(), "https://shop.example/lf280k_0");
    }

    #[test]
    fn test_needs_stock_probe() {
        let mut product = sample_product("https://shop.example/a", Some(280));
        assert!(product.needs_stock_probe());

        product.real_stock = Some(StockLevel::Exact(4));
        assert!(!product.needs_stock_probe());

        product.real_stock = None;
        product.availability = Availability::OutOfStock;
        assert!(!product.needs_stock_probe());
    }

    #[test]
    fn test_meets_capacity() {
        let product = sample_product("https://shop.example/a", Some(280));
        assert!(product.meets_capacity(0));
        assert!(product.meets_capacity(200));
        assert!(!product.meets_capacity(300));

        let unparsed = sample_product("https://shop.example/b", None);
        assert!(unparsed.meets_capacity(0));
        assert!(!unparsed.meets_capacity(200));
    }

    #[test]
    fn test_stock_level_count() {
        assert_eq!(StockLevel::Exact(12).count(), Some(12));
        assert_eq!(StockLevel::OutOfStock.count(), Some(0));
        assert_eq!(StockLevel::Unlimited.count(), None);
        assert_eq!(StockLevel::Unknown.count(), None);
    }
}
