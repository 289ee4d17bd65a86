use std::sync::Arc;

use chrono::Utc;
use scraper::{ElementRef, Html, Selector};
use tokio::time::sleep;
use url::Url;

use crate::browser::BrowserSession;
use crate::config::{RunContext, ScraperConfig};
use crate::models::{Availability, Product};
use crate::utils::error::{MonitorError, Result};
use crate::utils::text::{clean_price, extract_capacity};

const PRODUCT_CARD: &str = "li.product-item";
const PRODUCT_LINK: &str = "a.product-item-link";
const PRODUCT_PRICE: &str = "span.price";
const CART_BUTTON: &str = "button.btn--cart";
const STOCK_TEXT: &str = "div.stock span, p.stock span";

/// Scrapes the catalog listing into product summaries.
///
/// The listing itself is JS-rendered and goes through the browser session;
/// preorder detail pages are static enough for a plain HTTP fetch.
pub struct CatalogScraper {
    session: Arc<BrowserSession>,
    http: reqwest::Client,
    config: ScraperConfig,
}

impl CatalogScraper {
    pub fn new(session: Arc<BrowserSession>, config: ScraperConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .timeout(std::time::Duration::from_secs(config.request_timeout))
            .build()?;
        Ok(Self {
            session,
            http,
            config,
        })
    }

    /// Fetch and parse the catalog page. A malformed card is skipped with a
    /// logged reason; only a failed page fetch aborts the batch.
    pub async fn scrape(&self, ctx: &RunContext) -> Result<Vec<Product>> {
        tracing::info!(url = %ctx.catalog_url, "fetching catalog page");
        let html = self
            .session
            .fetch_html(&ctx.catalog_url, Some(PRODUCT_CARD))?;
        tracing::info!(chars = html.len(), "catalog page loaded");

        let mut products = parse_catalog(&html, &ctx.catalog_url)?;
        tracing::info!(count = products.len(), "parsed product cards");

        if ctx.fetch_delivery_dates {
            for product in &mut products {
                if product.availability != Availability::Preorder {
                    continue;
                }
                sleep(ctx.detail_fetch_delay).await;
                match self.fetch_delivery_date(&product.url).await {
                    Ok(Some(date)) => {
                        tracing::debug!(url = %product.url, date = %date, "delivery date found");
                        product.delivery_date = Some(date);
                    }
                    Ok(None) => {
                        tracing::debug!(url = %product.url, "no delivery date on detail page");
                    }
                    Err(e) => {
                        // Transient; the orchestrator retains the prior date.
                        tracing::warn!(url = %product.url, error = %e, "delivery date fetch failed");
                    }
                }
            }
        }

        Ok(products)
    }

    /// Bounded-retry fetch of a preorder detail page.
    pub async fn fetch_delivery_date(&self, url: &str) -> Result<Option<String>> {
        let attempts = self.config.retry_attempts.max(1);
        let mut last_err: Option<MonitorError> = None;

        for attempt in 1..=attempts {
            match self.fetch_detail_page(url).await {
                Ok(html) => return Ok(extract_delivery_date(&html)),
                Err(e) => {
                    tracing::debug!(url, attempt, error = %e, "detail page fetch failed");
                    last_err = Some(e);
                    if attempt < attempts {
                        sleep(std::time::Duration::from_millis(self.config.retry_delay_ms)).await;
                    }
                }
            }
        }

        Err(last_err.unwrap_or_else(|| MonitorError::Parse {
            message: format!("detail fetch failed for {url}"),
        }))
    }

    async fn fetch_detail_page(&self, url: &str) -> Result<String> {
        let response = self.http.get(url).send().await?.error_for_status()?;
        Ok(response.text().await?)
    }
}

/// Parse the listing HTML into products. Pure; exercised directly in tests.
pub fn parse_catalog(html: &str, base_url: &str) -> Result<Vec<Product>> {
    let document = Html::parse_document(html);
    let card_selector = Selector::parse(PRODUCT_CARD)
        .map_err(|e| MonitorError::Parse {
            message: format!("Invalid card selector: {e:?}"),
        })?;

    let base = Url::parse(base_url).map_err(|e| MonitorError::Parse {
        message: format!("Invalid catalog base URL '{base_url}': {e}"),
    })?;

    let mut products = Vec::new();
    for card in document.select(&card_selector) {
        match parse_card(card, &base) {
            Ok(product) => {
                if product.capacity_ah.is_none() {
                    tracing::debug!(name = %product.name, "no capacity in product name");
                }
                products.push(product);
            }
            Err(reason) => {
                tracing::warn!(reason = %reason, "skipping malformed product card");
            }
        }
    }

    Ok(products)
}

fn parse_card(card: ElementRef<'_>, base: &Url) -> std::result::Result<Product, String> {
    let link_selector = Selector::parse(PRODUCT_LINK).map_err(|e| format!("{e:?}"))?;
    let price_selector = Selector::parse(PRODUCT_PRICE).map_err(|e| format!("{e:?}"))?;
    let cart_selector = Selector::parse(CART_BUTTON).map_err(|e| format!("{e:?}"))?;
    let stock_selector = Selector::parse(STOCK_TEXT).map_err(|e| format!("{e:?}"))?;

    let link = card
        .select(&link_selector)
        .next()
        .ok_or("missing product link")?;

    let name = element_text(link);
    if name.is_empty() {
        return Err("empty product name".to_string());
    }

    let href = link.value().attr("href").ok_or("missing href")?;
    let url = base
        .join(href)
        .map_err(|e| format!("bad product href '{href}': {e}"))?
        .to_string();

    let price_text = card.select(&price_selector).next().map(element_text);
    let price = price_text.as_deref().and_then(clean_price);

    let availability = match card.select(&cart_selector).next() {
        Some(button) => {
            let is_preorder = button
                .value()
                .classes()
                .any(|c| c.to_lowercase().contains("preorder"));
            if is_preorder {
                Availability::Preorder
            } else {
                Availability::InStock
            }
        }
        // No cart button on a card means the listing is not orderable.
        None => Availability::OutOfStock,
    };

    let listed_stock_text = card
        .select(&stock_selector)
        .next()
        .map(element_text)
        .filter(|t| !t.is_empty());

    Ok(Product {
        capacity_ah: extract_capacity(&name),
        url,
        name,
        price,
        price_text,
        currency: "EUR".to_string(),
        listed_stock_text,
        availability,
        delivery_date: None,
        real_stock: None,
        variant_options: Vec::new(),
        seen_at: Utc::now(),
    })
}

fn element_text(element: ElementRef<'_>) -> String {
    element
        .text()
        .collect::<Vec<_>>()
        .join(" ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Pull an expected-delivery date out of a preorder detail page.
///
/// Tries dedicated markup first, then falls back to phrase patterns; new
/// storefront phrasings extend the table.
pub fn extract_delivery_date(html: &str) -> Option<String> {
    let document = Html::parse_document(html);

    for selector in [
        "div.delivery-date",
        "div.preorder-date",
        "p.availability-date",
    ] {
        if let Ok(sel) = Selector::parse(selector) {
            if let Some(el) = document.select(&sel).next() {
                let text = element_text(el);
                if !text.is_empty() {
                    return Some(text);
                }
            }
        }
    }

    let body_text: String = document.root_element().text().collect::<Vec<_>>().join(" ");
    let patterns = [
        r"(?i)expected (?:delivery|in stock)[:\s]+([A-Za-z]+\s+\d{4}|\d{1,2}[-./]\d{1,2}[-./]\d{2,4})",
        r"(?i)verwachte? levering[:\s]+([A-Za-z]+\s+\d{4}|\d{1,2}[-./]\d{1,2}[-./]\d{2,4})",
    ];
    for pattern in patterns {
        if let Some(caps) = regex::Regex::new(pattern).ok()?.captures(&body_text) {
            return Some(caps.get(1)?.as_str().trim().to_string());
        }
    }

    None
}
