use std::sync::Arc;

use regex::Regex;
use scraper::{Html, Selector};

use crate::browser::BrowserSession;
use crate::models::StockLevel;
use crate::utils::error::MonitorError;

/// Quantity the probe asks the cart for. Any storefront limit below this
/// produces a "most you may purchase" style response carrying the real count.
const PROBE_QUANTITY: u32 = 9999;

const VARIANT_SELECT: &str = "select.super-attribute-select";
const ADD_TO_CART_BUTTON: &str = "#product-addtocart-button";
const RESPONSE_MESSAGE: &str = "div.message-error, div.message-success, div.mage-error, [role=alert]";

/// How a probe run ended. Every exit is logged distinctly; conflating them
/// (or silently swallowing one) hides exactly the failures worth auditing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeExit {
    /// No variant dropdown on the page; went straight to the cart.
    NoDropdown,
    /// A dropdown existed and an option was chosen.
    DropdownResolved { option: String },
    /// The primary click did not register; the dispatched-event fallback did.
    FallbackInteraction,
    /// The response text matched no known phrasing; carries the literal text.
    MessageUnrecognized { text: String },
    /// Neither the primary click nor the fallback registered.
    InteractionFailed { reason: String },
    /// Page load or element lookup failed.
    NetworkFailure { reason: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProbeOutcome {
    pub level: StockLevel,
    pub exit: ProbeExit,
    /// Dropdown labels seen on the detail page, recorded on the product.
    pub variant_options: Vec<String>,
}

/// One option of the variant dropdown.
#[derive(Debug, Clone, PartialEq)]
pub struct VariantOption {
    pub value: String,
    pub label: String,
    pub enabled: bool,
}

enum PatternKind {
    Quantity,
    Unlimited,
    OutOfStock,
}

struct ResponsePattern {
    regex: Regex,
    kind: PatternKind,
}

/// The text-level half of the probe: variant choice and response-phrase
/// extraction. Ordered and data-driven — a new storefront phrasing is one
/// more table row, not another branch.
pub struct StockPatterns {
    responses: Vec<ResponsePattern>,
    negative: Vec<Regex>,
    variant_keywords: Vec<Regex>,
}

impl Default for StockPatterns {
    fn default() -> Self {
        Self::new()
    }
}

impl StockPatterns {
    pub fn new() -> Self {
        let quantity = [
            // English storefront
            r"(?i)\bonly\s+(\d+)\s+left\b",
            r"(?i)\bthe most you (?:can|may) purchase is\s+(\d+)",
            // Dutch storefront
            r"(?i)\bslechts\s+(\d+)\s+beschikbaar\b",
            r"(?i)\bmaximaal\s+(\d+)\s+(?:stuks?|bestellen)\b",
            // Ukrainian storefront
            r"(?i)\bдоступно лише\s+(\d+)\b",
            r"(?i)\bлише\s+(\d+)\s+шт\b",
        ];
        let unlimited = [
            r"(?i)\badded .{0,40}to your (?:shopping )?cart\b",
            r"(?i)\bu hebt .{0,40}aan uw winkelwagen toegevoegd\b",
        ];
        let out_of_stock = [
            r"(?i)\bout of stock\b",
            r"(?i)\bproduct is not available\b",
            r"(?i)\bniet op voorraad\b",
            r"(?i)\bнемає в наявності\b",
        ];

        let mut responses = Vec::new();
        for p in quantity {
            responses.push(ResponsePattern {
                regex: Regex::new(p).unwrap(),
                kind: PatternKind::Quantity,
            });
        }
        for p in unlimited {
            responses.push(ResponsePattern {
                regex: Regex::new(p).unwrap(),
                kind: PatternKind::Unlimited,
            });
        }
        for p in out_of_stock {
            responses.push(ResponsePattern {
                regex: Regex::new(p).unwrap(),
                kind: PatternKind::OutOfStock,
            });
        }

        // Lines matching any of these are shipping/notice boilerplate, not
        // stock messages. Whole-word only.
        let negative = ["shipping", "delivery", "verzending", "levertijd", "доставка"]
            .iter()
            .map(|w| word_regex(w))
            .collect();

        // Variant priority keywords, most specific first. Whole-word only:
        // "bus" must not match inside "busy" or "bushing".
        let variant_keywords = ["busbar", "busbars", "verbindingsstrip", "шина"]
            .iter()
            .map(|w| word_regex(w))
            .collect();

        StockPatterns {
            responses,
            negative,
            variant_keywords,
        }
    }

    /// Extract a stock level from an inline cart response.
    ///
    /// Lines containing negative keywords are dropped before matching so a
    /// shipping notice next to the cart cannot masquerade as a stock message.
    pub fn extract(&self, text: &str) -> StockLevel {
        let lines: Vec<&str> = text
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .filter(|l| !self.negative.iter().any(|re| re.is_match(l)))
            .collect();

        for pattern in &self.responses {
            for line in &lines {
                if let Some(caps) = pattern.regex.captures(line) {
                    return match pattern.kind {
                        PatternKind::Quantity => caps
                            .get(1)
                            .and_then(|m| m.as_str().parse().ok())
                            .map(StockLevel::Exact)
                            .unwrap_or(StockLevel::Unknown),
                        PatternKind::Unlimited => StockLevel::Unlimited,
                        PatternKind::OutOfStock => StockLevel::OutOfStock,
                    };
                }
            }
        }

        StockLevel::Unknown
    }

    /// Deterministic variant choice: first enabled option whose label
    /// whole-word-matches a priority keyword; first enabled option otherwise.
    pub fn choose_variant<'a>(&self, options: &'a [VariantOption]) -> Option<&'a VariantOption> {
        let enabled: Vec<&VariantOption> = options.iter().filter(|o| o.enabled).collect();

        for keyword in &self.variant_keywords {
            if let Some(option) = enabled.iter().find(|o| keyword.is_match(&o.label)) {
                return Some(option);
            }
        }
        enabled.first().copied()
    }
}

fn word_regex(word: &str) -> Regex {
    Regex::new(&format!(r"(?i)\b{}\b", regex::escape(word))).unwrap()
}

/// Parse the variant dropdown options out of a detail page. Pure.
pub fn parse_variant_options(html: &str) -> Vec<VariantOption> {
    let document = Html::parse_document(html);
    let Ok(select) = Selector::parse(VARIANT_SELECT) else {
        return Vec::new();
    };
    let Ok(option_sel) = Selector::parse("option") else {
        return Vec::new();
    };

    let Some(dropdown) = document.select(&select).next() else {
        return Vec::new();
    };

    dropdown
        .select(&option_sel)
        .filter_map(|opt| {
            let value = opt.value().attr("value").unwrap_or_default().to_string();
            // The placeholder "Choose an option..." row has an empty value.
            if value.is_empty() {
                return None;
            }
            let label = opt
                .text()
                .collect::<String>()
                .split_whitespace()
                .collect::<Vec<_>>()
                .join(" ");
            Some(VariantOption {
                enabled: opt.value().attr("disabled").is_none(),
                value,
                label,
            })
        })
        .collect()
}

/// Collect the inline response text shown after an add-to-cart attempt. Pure.
pub fn extract_response_text(html: &str) -> Option<String> {
    let document = Html::parse_document(html);
    let sel = Selector::parse(RESPONSE_MESSAGE).ok()?;

    let mut parts = Vec::new();
    for el in document.select(&sel) {
        let text = el
            .text()
            .collect::<Vec<_>>()
            .join(" ")
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ");
        if !text.is_empty() {
            parts.push(text);
        }
    }

    if parts.is_empty() {
        None
    } else {
        Some(parts.join("\n"))
    }
}

/// Determines true remaining stock for a single product by simulating an
/// add-to-cart with an oversized quantity and reading the storefront's
/// complaint.
///
/// The probe owns no persistent state; it only returns what it saw.
pub struct StockProbe {
    session: Arc<BrowserSession>,
    patterns: StockPatterns,
}

impl StockProbe {
    pub fn new(session: Arc<BrowserSession>) -> Self {
        Self {
            session,
            patterns: StockPatterns::new(),
        }
    }

    /// Run the full interaction chain against a product detail page.
    ///
    /// Never returns an error: every failure mode collapses to a
    /// `ProbeOutcome` whose exit reason is logged by the caller's run log.
    pub async fn probe(&self, product_url: &str) -> ProbeOutcome {
        match self.probe_inner(product_url) {
            Ok(outcome) => outcome,
            Err(e) => {
                let reason = e.to_string();
                tracing::warn!(url = product_url, reason = %reason, "stock probe network failure");
                ProbeOutcome {
                    level: StockLevel::Unknown,
                    exit: ProbeExit::NetworkFailure { reason },
                    variant_options: Vec::new(),
                }
            }
        }
    }

    fn probe_inner(&self, product_url: &str) -> crate::Result<ProbeOutcome> {
        let tab = self.session.open(product_url)?;
        let html = tab
            .get_content()
            .map_err(|e| MonitorError::Browser(format!("Failed to get detail page: {e}")))?;

        // Step 1-2: resolve the variant dropdown, if any.
        let options = parse_variant_options(&html);
        let labels: Vec<String> = options.iter().map(|o| o.label.clone()).collect();
        let mut exit = if options.is_empty() {
            tracing::debug!(url = product_url, "no variant dropdown, probing directly");
            ProbeExit::NoDropdown
        } else {
            match self.patterns.choose_variant(&options) {
                Some(option) => {
                    tracing::debug!(
                        url = product_url,
                        option = %option.label,
                        "variant dropdown resolved"
                    );
                    self.select_variant(&tab, &option.value)?;
                    ProbeExit::DropdownResolved {
                        option: option.label.clone(),
                    }
                }
                None => {
                    // Dropdown present but every option disabled: the cart
                    // cannot be exercised at all.
                    tracing::warn!(url = product_url, "variant dropdown has no enabled options");
                    return Ok(ProbeOutcome {
                        level: StockLevel::OutOfStock,
                        exit: ProbeExit::InteractionFailed {
                            reason: "variant dropdown has no enabled options".to_string(),
                        },
                        variant_options: labels,
                    });
                }
            }
        };

        // Step 3: oversized quantity, then the purchase-intent interaction.
        self.set_quantity(&tab, PROBE_QUANTITY)?;
        match self.click_add_to_cart(&tab) {
            Ok(fallback_used) => {
                if fallback_used {
                    tracing::info!(url = product_url, "primary click failed, fallback dispatch used");
                    exit = ProbeExit::FallbackInteraction;
                }
            }
            Err(reason) => {
                tracing::warn!(url = product_url, reason = %reason, "add-to-cart interaction failed");
                return Ok(ProbeOutcome {
                    level: StockLevel::Unknown,
                    exit: ProbeExit::InteractionFailed { reason },
                    variant_options: labels,
                });
            }
        }

        // Step 4-6: read and classify the inline response.
        let response = self.wait_for_response(&tab)?;
        match response {
            Some(text) => {
                let level = self.patterns.extract(&text);
                if level == StockLevel::Unknown {
                    // Never silently discard an unmatched response.
                    tracing::warn!(
                        url = product_url,
                        response = %text,
                        "unrecognized cart response"
                    );
                    exit = ProbeExit::MessageUnrecognized { text };
                } else {
                    tracing::info!(url = product_url, level = ?level, "stock probe result");
                }
                Ok(ProbeOutcome {
                    level,
                    exit,
                    variant_options: labels,
                })
            }
            None => {
                tracing::warn!(url = product_url, "cart produced no response message");
                Ok(ProbeOutcome {
                    level: StockLevel::Unknown,
                    exit: ProbeExit::MessageUnrecognized {
                        text: String::new(),
                    },
                    variant_options: labels,
                })
            }
        }
    }

    fn select_variant(&self, tab: &headless_chrome::Tab, value: &str) -> crate::Result<()> {
        let js = format!(
            r#"
            (function() {{
                const select = document.querySelector('{VARIANT_SELECT}');
                if (!select) return false;
                select.value = '{}';
                select.dispatchEvent(new Event('change', {{ bubbles: true }}));
                return true;
            }})()
            "#,
            value.replace('\'', "\\'"),
        );
        tab.evaluate(&js, false)
            .map_err(|e| MonitorError::Browser(format!("Variant selection failed: {e}")))?;
        Ok(())
    }

    fn set_quantity(&self, tab: &headless_chrome::Tab, quantity: u32) -> crate::Result<()> {
        let js = format!(
            r#"
            (function() {{
                const qty = document.querySelector('input#qty, input[name="qty"]');
                if (!qty) return false;
                qty.value = '{quantity}';
                qty.dispatchEvent(new Event('change', {{ bubbles: true }}));
                return true;
            }})()
            "#
        );
        tab.evaluate(&js, false)
            .map_err(|e| MonitorError::Browser(format!("Setting quantity failed: {e}")))?;
        Ok(())
    }

    /// Preferred interaction first, dispatched-event fallback second; both
    /// produce the same observable (the inline response read afterwards).
    /// Returns whether the fallback was needed.
    fn click_add_to_cart(
        &self,
        tab: &headless_chrome::Tab,
    ) -> std::result::Result<bool, String> {
        let primary = tab
            .find_element(ADD_TO_CART_BUTTON)
            .and_then(|button| button.click().map(|_| ()));

        match primary {
            Ok(()) => Ok(false),
            Err(primary_err) => {
                let js = format!(
                    r#"
                    (function() {{
                        const btn = document.querySelector('{ADD_TO_CART_BUTTON}');
                        if (!btn) return false;
                        btn.click();
                        return true;
                    }})()
                    "#
                );
                match tab.evaluate(&js, false) {
                    Ok(result) => {
                        let clicked = result
                            .value
                            .as_ref()
                            .and_then(|v| v.as_bool())
                            .unwrap_or(false);
                        if clicked {
                            Ok(true)
                        } else {
                            Err(format!(
                                "button missing for dispatched click (primary: {primary_err})"
                            ))
                        }
                    }
                    Err(fallback_err) => Err(format!(
                        "primary: {primary_err}; fallback: {fallback_err}"
                    )),
                }
            }
        }
    }

    fn wait_for_response(&self, tab: &headless_chrome::Tab) -> crate::Result<Option<String>> {
        if tab
            .wait_for_element_with_custom_timeout(RESPONSE_MESSAGE, self.session.timeout())
            .is_err()
        {
            return Ok(None);
        }
        let html = tab
            .get_content()
            .map_err(|e| MonitorError::Browser(format!("Failed to read cart response: {e}")))?;
        Ok(extract_response_text(&html))
    }
}
