use std::collections::BTreeMap;

use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;

use crate::config::RunContext;
use crate::models::{ChangeEvent, ChangeKind, Product, Snapshot};

/// Diffs the current scrape against the prior snapshot.
///
/// Events come out ordered by product id so identical inputs always produce
/// identical output; diffing a scrape against a snapshot of itself produces
/// nothing.
pub struct ChangeDetector {
    price_alert_threshold: f64,
    small_restock_threshold: u32,
}

impl ChangeDetector {
    pub fn new(ctx: &RunContext) -> Self {
        Self {
            price_alert_threshold: ctx.price_alert_threshold,
            small_restock_threshold: ctx.small_restock_threshold,
        }
    }

    pub fn detect(&self, current: &[Product], prior: &Snapshot) -> Vec<ChangeEvent> {
        let current_by_key: BTreeMap<String, &Product> =
            current.iter().map(|p| (p.key(), p)).collect();

        let mut events = Vec::new();
        for (key, product) in &current_by_key {
            let Some(previous) = prior.get(key) else {
                events.push(ChangeEvent {
                    product_id: key.clone(),
                    kind: ChangeKind::NewListing,
                });
                continue;
            };

            if let Some(kind) = self.price_event(previous, product) {
                events.push(ChangeEvent {
                    product_id: key.clone(),
                    kind,
                });
            }

            if let Some(kind) = self.availability_event(previous, product) {
                events.push(ChangeEvent {
                    product_id: key.clone(),
                    kind,
                });
            }

            if let Some(kind) = delivery_event(previous, product) {
                events.push(ChangeEvent {
                    product_id: key.clone(),
                    kind,
                });
            }
        }

        events
    }

    fn price_event(&self, previous: &Product, current: &Product) -> Option<ChangeKind> {
        // An absent price on either side is no price signal at all.
        let old = previous.price?;
        let new = current.price?;
        if old.is_zero() {
            return None;
        }

        let percent = ((new - old) / old * Decimal::from(100)).to_f64()?;
        if percent.abs() < self.price_alert_threshold {
            return None;
        }

        if new < old {
            Some(ChangeKind::PriceDrop { old, new, percent })
        } else {
            Some(ChangeKind::PriceRise { old, new, percent })
        }
    }

    fn availability_event(&self, previous: &Product, current: &Product) -> Option<ChangeKind> {
        use crate::models::Availability::OutOfStock;

        if previous.availability == OutOfStock && current.availability.is_orderable() {
            // Small restocks are recorded but suppressed from "changes"
            // reports; an unknown quantity is treated as a real restock.
            let suppressed = current
                .real_stock
                .and_then(|level| level.count())
                .is_some_and(|n| n <= self.small_restock_threshold);
            return Some(ChangeKind::Restock {
                level: current.real_stock,
                suppressed,
            });
        }

        if previous.availability.is_orderable() && current.availability == OutOfStock {
            return Some(ChangeKind::OutOfStock);
        }

        None
    }
}

fn delivery_event(previous: &Product, current: &Product) -> Option<ChangeKind> {
    use crate::models::Availability::Preorder;

    if current.availability != Preorder {
        return None;
    }
    let new = current.delivery_date.clone()?;
    if previous.delivery_date.as_deref() == Some(new.as_str()) {
        return None;
    }
    Some(ChangeKind::DeliveryDateChange {
        old: previous.delivery_date.clone(),
        new,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal::Decimal;
    use std::str::FromStr;

    use crate::config::{AppConfig, RunContext};
    use crate::models::{Availability, StockLevel};

    fn test_ctx() -> RunContext {
        let mut config = crate::config::tests::valid_config();
        config.monitor.price_alert_threshold = 5.0;
        config.monitor.small_restock_threshold = 16;
        ctx_from(&config)
    }

    fn ctx_from(config: &AppConfig) -> RunContext {
        RunContext::from_config(config, chrono::Local::now(), true).unwrap()
    }

    fn product(url: &str, price: &str, availability: Availability) -> Product {
        Product {
            url: url.to_string(),
            name: "EVE LF280K 280Ah".to_string(),
            capacity_ah: Some(280),
            price: Decimal::from_str(price).ok(),
            price_text: Some(format!("€{price}")),
            currency: "EUR".to_string(),
            listed_stock_text: None,
            availability,
            delivery_date: None,
            real_stock: None,
            variant_options: Vec::new(),
            seen_at: Utc::now(),
        }
    }

    fn snapshot_of(products: &[Product]) -> Snapshot {
        Snapshot::from_products(products, Utc::now())
    }

    #[test]
    fn test_idempotence_on_unchanged_inputs() {
        let detector = ChangeDetector::new(&test_ctx());
        let current = vec![
            product("https://s/a", "89.95", Availability::InStock),
            product("https://s/b", "105.50", Availability::Preorder),
        ];
        let prior = snapshot_of(&current);

        assert!(detector.detect(&current, &prior).is_empty());
        // And again, to make sure detection has no hidden state.
        assert!(detector.detect(&current, &prior).is_empty());
    }

    #[test]
    fn test_new_listing() {
        let detector = ChangeDetector::new(&test_ctx());
        let current = vec![product("https://s/a", "89.95", Availability::InStock)];

        let events = detector.detect(&current, &Snapshot::default());
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, ChangeKind::NewListing);
    }

    #[test]
    fn test_price_drop_above_threshold() {
        let detector = ChangeDetector::new(&test_ctx());
        let prior = snapshot_of(&[product("https://s/a", "100", Availability::InStock)]);
        let current = vec![product("https://s/a", "90", Availability::InStock)];

        let events = detector.detect(&current, &prior);
        assert_eq!(events.len(), 1);
        match &events[0].kind {
            ChangeKind::PriceDrop { old, new, percent } => {
                assert_eq!(old.to_string(), "100");
                assert_eq!(new.to_string(), "90");
                assert!((percent + 10.0).abs() < 1e-9);
            }
            other => panic!("expected price drop, got {other:?}"),
        }
    }

    #[test]
    fn test_price_change_below_threshold_ignored() {
        let detector = ChangeDetector::new(&test_ctx());
        let prior = snapshot_of(&[product("https://s/a", "100", Availability::InStock)]);
        let current = vec![product("https://s/a", "97", Availability::InStock)];

        assert!(detector.detect(&current, &prior).is_empty());
    }

    #[test]
    fn test_price_rise() {
        let detector = ChangeDetector::new(&test_ctx());
        let prior = snapshot_of(&[product("https://s/a", "100", Availability::InStock)]);
        let current = vec![product("https://s/a", "110", Availability::InStock)];

        let events = detector.detect(&current, &prior);
        assert!(matches!(events[0].kind, ChangeKind::PriceRise { .. }));
    }

    #[test]
    fn test_absent_price_produces_no_event() {
        let detector = ChangeDetector::new(&test_ctx());
        let mut with_price = product("https://s/a", "100", Availability::InStock);
        let prior = snapshot_of(&[with_price.clone()]);
        with_price.price = None;
        with_price.price_text = None;

        assert!(detector.detect(&[with_price], &prior).is_empty());
    }

    #[test]
    fn test_restock_above_threshold() {
        let detector = ChangeDetector::new(&test_ctx());
        let prior = snapshot_of(&[product("https://s/a", "100", Availability::OutOfStock)]);
        let mut restocked = product("https://s/a", "100", Availability::InStock);
        restocked.real_stock = Some(StockLevel::Exact(40));

        let events = detector.detect(&[restocked], &prior);
        assert_eq!(events.len(), 1);
        assert_eq!(
            events[0].kind,
            ChangeKind::Restock {
                level: Some(StockLevel::Exact(40)),
                suppressed: false,
            }
        );
    }

    #[test]
    fn test_small_restock_suppressed() {
        let detector = ChangeDetector::new(&test_ctx());
        let prior = snapshot_of(&[product("https://s/a", "100", Availability::OutOfStock)]);
        let mut restocked = product("https://s/a", "100", Availability::InStock);
        restocked.real_stock = Some(StockLevel::Exact(3));

        let events = detector.detect(&[restocked], &prior);
        assert_eq!(events.len(), 1);
        assert!(events[0].is_suppressed());
    }

    #[test]
    fn test_restock_with_unknown_quantity_not_suppressed() {
        let detector = ChangeDetector::new(&test_ctx());
        let prior = snapshot_of(&[product("https://s/a", "100", Availability::OutOfStock)]);
        let restocked = product("https://s/a", "100", Availability::Preorder);

        let events = detector.detect(&[restocked], &prior);
        assert_eq!(events.len(), 1);
        assert_eq!(
            events[0].kind,
            ChangeKind::Restock {
                level: None,
                suppressed: false,
            }
        );
    }

    #[test]
    fn test_out_of_stock_transition() {
        let detector = ChangeDetector::new(&test_ctx());
        let prior = snapshot_of(&[product("https://s/a", "100", Availability::InStock)]);
        let current = vec![product("https://s/a", "100", Availability::OutOfStock)];

        let events = detector.detect(&current, &prior);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, ChangeKind::OutOfStock);
    }

    #[test]
    fn test_delivery_date_change_on_preorder() {
        let detector = ChangeDetector::new(&test_ctx());
        let mut before = product("https://s/a", "100", Availability::Preorder);
        before.delivery_date = Some("August 2026".to_string());
        let prior = snapshot_of(&[before]);

        let mut after = product("https://s/a", "100", Availability::Preorder);
        after.delivery_date = Some("October 2026".to_string());

        let events = detector.detect(&[after], &prior);
        assert_eq!(events.len(), 1);
        assert_eq!(
            events[0].kind,
            ChangeKind::DeliveryDateChange {
                old: Some("August 2026".to_string()),
                new: "October 2026".to_string(),
            }
        );
    }

    #[test]
    fn test_delivery_date_ignored_for_in_stock() {
        let detector = ChangeDetector::new(&test_ctx());
        let mut before = product("https://s/a", "100", Availability::InStock);
        before.delivery_date = Some("August 2026".to_string());
        let prior = snapshot_of(&[before]);

        let mut after = product("https://s/a", "100", Availability::InStock);
        after.delivery_date = Some("October 2026".to_string());

        assert!(detector.detect(&[after], &prior).is_empty());
    }

    #[test]
    fn test_events_ordered_by_product_id() {
        let detector = ChangeDetector::new(&test_ctx());
        let current = vec![
            product("https://s/zebra", "10", Availability::InStock),
            product("https://s/alpha", "10", Availability::InStock),
        ];

        let events = detector.detect(&current, &Snapshot::default());
        assert_eq!(events.len(), 2);
        assert!(events[0].product_id < events[1].product_id);
    }

    #[test]
    fn test_price_drop_and_restock_together() {
        let detector = ChangeDetector::new(&test_ctx());
        let prior = snapshot_of(&[product("https://s/a", "100", Availability::OutOfStock)]);
        let mut current = product("https://s/a", "90", Availability::InStock);
        current.real_stock = Some(StockLevel::Exact(40));

        let events = detector.detect(&[current], &prior);
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0].kind, ChangeKind::PriceDrop { .. }));
        assert!(matches!(events[1].kind, ChangeKind::Restock { .. }));
    }
}
