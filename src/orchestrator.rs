use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use chrono::{Local, Utc};
use tokio::time::sleep;

use crate::browser::BrowserSession;
use crate::catalog::CatalogScraper;
use crate::config::{AppConfig, RunContext};
use crate::detector::ChangeDetector;
use crate::history::HistoryDb;
use crate::models::{ChangeEvent, Product, Snapshot};
use crate::notify::{NotificationRouter, TelegramTransport};
use crate::probe::{ProbeExit, StockProbe};
use crate::state::{RunLock, StateStore};

/// Outcome summary of one pipeline run.
#[derive(Debug, Default)]
pub struct RunReport {
    pub skipped: bool,
    pub products: usize,
    pub events: Vec<ChangeEvent>,
    pub messages_sent: usize,
    pub warnings: Vec<String>,
}

/// Sequences one execution: scrape → probe → diff → notify → history →
/// persist. State is written only when everything before it succeeded.
pub struct RunOrchestrator {
    config: AppConfig,
}

impl RunOrchestrator {
    pub fn new(config: AppConfig) -> Self {
        Self { config }
    }

    pub async fn run_once(&self, dry_run: bool) -> Result<RunReport> {
        let lock_timeout = Duration::from_secs(self.config.state.run_timeout);
        let Some(_lock) = RunLock::acquire(&self.config.state.lock_path, lock_timeout)? else {
            tracing::warn!("another run is in progress, skipping this trigger");
            return Ok(RunReport {
                skipped: true,
                ..RunReport::default()
            });
        };

        let ctx = RunContext::from_config(&self.config, Local::now(), dry_run)?;
        let store = StateStore::new(&self.config.state.path);
        let mut state = store.load()?;
        tracing::info!(
            prior_products = state.snapshot.len(),
            pending = state.pending.len(),
            "run started"
        );

        // Scrape. A failed or empty catalog fetch is run-fatal: diffing
        // against nothing would flood recipients with phantom removals.
        let session = Arc::new(BrowserSession::launch(&self.config.scraper)?);
        let scraper = CatalogScraper::new(Arc::clone(&session), self.config.scraper.clone())?;
        let mut products = scraper
            .scrape(&ctx)
            .await
            .context("catalog scrape failed")?;
        if products.is_empty() {
            bail!("catalog scrape returned no products; markup may have changed");
        }

        // Probe real stock, serialized and throttled.
        let mut warnings = Vec::new();
        if ctx.fetch_real_stock {
            self.probe_stock(&ctx, &session, &mut products, &state.snapshot, &mut warnings)
                .await;
        }

        merge_prior_fields(&mut products, &state.snapshot);

        // Diff against the prior snapshot.
        let detector = ChangeDetector::new(&ctx);
        let events = detector.detect(&products, &state.snapshot);
        tracing::info!(events = events.len(), "change detection complete");

        // Notify.
        let transport = TelegramTransport::new(&self.config.telegram)?;
        let router = NotificationRouter::new(&transport, &self.config.telegram.recipients);
        let routing = router.dispatch(&ctx, &events, &products, &state).await;
        warnings.extend(routing.warnings.iter().cloned());

        // History recording is best-effort.
        if self.config.history.enabled {
            if let Err(e) = self.record_history(&products).await {
                let warning = format!("history recording failed: {e}");
                tracing::warn!("{warning}");
                warnings.push(warning);
            }
        }

        // Persist: the new baseline plus router bookkeeping. A failure here
        // aborts without having touched the previous state file.
        state.snapshot = Snapshot::from_products(&products, Utc::now());
        state.pending = routing.deferred;
        let today = ctx.now.date_naive();
        for time in &routing.heartbeats_marked {
            state.heartbeats_sent.insert(time.clone(), today);
        }
        store.save(&state).context("state persistence failed")?;

        tracing::info!(
            products = products.len(),
            events = events.len(),
            sent = routing.messages_sent,
            warnings = warnings.len(),
            "run complete"
        );

        Ok(RunReport {
            skipped: false,
            products: products.len(),
            events,
            messages_sent: routing.messages_sent,
            warnings,
        })
    }

    async fn probe_stock(
        &self,
        ctx: &RunContext,
        session: &Arc<BrowserSession>,
        products: &mut [Product],
        prior: &Snapshot,
        warnings: &mut Vec<String>,
    ) {
        let probe = StockProbe::new(Arc::clone(session));
        let attempts = self.config.scraper.retry_attempts.max(1);
        let retry_delay = Duration::from_millis(self.config.scraper.retry_delay_ms);

        for product in products.iter_mut() {
            if !product.needs_stock_probe() {
                continue;
            }
            sleep(ctx.detail_fetch_delay).await;

            let mut outcome = probe.probe(&product.url).await;
            for _ in 1..attempts {
                if !matches!(outcome.exit, ProbeExit::NetworkFailure { .. }) {
                    break;
                }
                sleep(retry_delay).await;
                outcome = probe.probe(&product.url).await;
            }

            match outcome.exit {
                ProbeExit::NetworkFailure { ref reason }
                | ProbeExit::InteractionFailed { ref reason } => {
                    // Retries exhausted: keep the previously known level
                    // rather than overwriting it with nothing.
                    let retained = prior.get(&product.key()).and_then(|p| p.real_stock);
                    warnings.push(format!("stock probe failed for {}: {reason}", product.url));
                    product.real_stock = retained;
                }
                _ => {
                    product.real_stock = Some(outcome.level);
                    product.variant_options = outcome.variant_options;
                }
            }
        }
    }

    async fn record_history(&self, products: &[Product]) -> crate::Result<()> {
        let db = HistoryDb::connect(&self.config.history.db_path).await?;
        db.sync_products(products).await?;
        db.record_changes(products, Utc::now()).await?;
        Ok(())
    }
}

/// Per-field fallback for recoverable parse gaps: an item whose price or
/// delivery date failed to parse this run keeps its previously known value
/// in the new snapshot.
fn merge_prior_fields(products: &mut [Product], prior: &Snapshot) {
    for product in products.iter_mut() {
        let Some(previous) = prior.get(&product.key()) else {
            continue;
        };

        if product.price.is_none() && previous.price.is_some() {
            tracing::debug!(url = %product.url, "price unparsed, retaining prior value");
            product.price = previous.price;
            product.price_text = previous.price_text.clone();
        }

        if product.availability == crate::models::Availability::Preorder
            && product.delivery_date.is_none()
            && previous.delivery_date.is_some()
        {
            product.delivery_date = previous.delivery_date.clone();
        }

        if product.variant_options.is_empty() && !previous.variant_options.is_empty() {
            product.variant_options = previous.variant_options.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal::Decimal;
    use std::str::FromStr;

    use crate::models::Availability;

    fn product(url: &str, price: Option<&str>) -> Product {
        Product {
            url: url.to_string(),
            name: "EVE LF280K 280Ah".to_string(),
            capacity_ah: Some(280),
            price: price.and_then(|p| Decimal::from_str(p).ok()),
            price_text: price.map(|p| format!("€{p}")),
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
    fn test_merge_retains_prior_price_on_parse_gap() {
        let prior_product = product("https://s/a", Some("89.95"));
        let prior = Snapshot::from_products(&[prior_product], Utc::now());

        let mut current = vec![product("https://s/a", None)];
        merge_prior_fields(&mut current, &prior);

        assert_eq!(current[0].price, Decimal::from_str("89.95").ok());
        assert_eq!(current[0].price_text.as_deref(), Some("€89.95"));
    }

    #[test]
    fn test_merge_keeps_fresh_price() {
        let prior_product = product("https://s/a", Some("89.95"));
        let prior = Snapshot::from_products(&[prior_product], Utc::now());

        let mut current = vec![product("https://s/a", Some("79.95"))];
        merge_prior_fields(&mut current, &prior);

        assert_eq!(current[0].price, Decimal::from_str("79.95").ok());
    }

    #[test]
    fn test_merge_retains_delivery_date_for_preorder() {
        let mut prior_product = product("https://s/a", Some("89.95"));
        prior_product.availability = Availability::Preorder;
        prior_product.delivery_date = Some("September 2026".to_string());
        let prior = Snapshot::from_products(&[prior_product], Utc::now());

        let mut fresh = product("https://s/a", Some("89.95"));
        fresh.availability = Availability::Preorder;
        let mut current = vec![fresh];
        merge_prior_fields(&mut current, &prior);

        assert_eq!(current[0].delivery_date.as_deref(), Some("September 2026"));
    }

    #[test]
    fn test_merge_ignores_new_products() {
        let prior = Snapshot::default();
        let mut current = vec![product("https://s/new", None)];
        merge_prior_fields(&mut current, &prior);
        assert_eq!(current[0].price, None);
    }
}
