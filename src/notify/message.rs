use std::collections::BTreeMap;

use uuid::Uuid;

use crate::config::{Recipient, RunContext};
use crate::models::{Availability, ChangeEvent, ChangeKind, Product, StockLevel};
use crate::utils::text::{extract_grade, shorten_name};

const DETAIL_PREFIX: &str = "└──▷";

/// Builds the Markdown reports sent to recipients.
pub struct MessageBuilder<'a> {
    ctx: &'a RunContext,
}

impl<'a> MessageBuilder<'a> {
    pub fn new(ctx: &'a RunContext) -> Self {
        Self { ctx }
    }

    fn header(&self, header_url: &str) -> String {
        if header_url.is_empty() {
            "🔋 *LiFePO4 Monitor*\n\n".to_string()
        } else {
            format!("[🔋 LiFePO4 Monitor]({header_url})\n\n")
        }
    }

    fn footer(&self, recipient: &Recipient, is_update: bool) -> String {
        let status = if is_update { "🔄" } else { "🆕" };
        let mut footer = format!(
            "\n\n{status} {}",
            self.ctx.now.format("%d.%m.%Y %H:%M:%S")
        );
        if let (Some(name), Some(url)) = (&recipient.name, &recipient.url) {
            footer.push_str(&format!("\n\n💬 [{name}]({url})"));
        } else if let Some(name) = &recipient.name {
            footer.push_str(&format!("\n\n💬 {name}"));
        }
        footer
    }

    fn graph_link(&self, product: &Product) -> String {
        if !self.ctx.generate_graphs {
            return String::new();
        }
        let Some(base) = &self.ctx.graph_base_url else {
            return String::new();
        };
        // Stable per-product id shared with the external graph renderer.
        let graph_id = Uuid::new_v5(&Uuid::NAMESPACE_URL, product.key().as_bytes())
            .simple()
            .to_string();
        format!(
            " [📈Stat]({}/graph_{}.html)",
            base.trim_end_matches('/'),
            &graph_id[..8]
        )
    }

    fn grade_display(product: &Product) -> String {
        match extract_grade(&product.name) {
            Some(grade) => {
                let emoji = if grade.contains('A') { "🅰️" } else { "🅱️" };
                format!("{emoji} {grade} | ")
            }
            None => String::new(),
        }
    }

    fn capacity_link(product: &Product) -> String {
        match product.capacity_ah {
            Some(c) => format!("[{c}Ah]({})", product.url),
            None => format!("[?Ah]({})", product.url),
        }
    }

    fn stock_display(product: &Product) -> String {
        match product.real_stock {
            Some(StockLevel::Exact(n)) => format!(" `[{n} pcs]`"),
            Some(StockLevel::OutOfStock) => " `[0 pcs]`".to_string(),
            Some(StockLevel::Unlimited) | Some(StockLevel::Unknown) | None => {
                if product.availability == Availability::InStock {
                    " `[in stock]`".to_string()
                } else {
                    String::new()
                }
            }
        }
    }

    fn product_line(&self, product: &Product) -> String {
        let price = product.price_text.as_deref().unwrap_or("N/A");
        let stock = Self::stock_display(product);

        let (status, detail) = match product.availability {
            Availability::Preorder => {
                let status = format!(" [📦Pre]({})", product.url);
                let detail = product
                    .delivery_date
                    .as_ref()
                    .map(|date| format!("\n  [{DETAIL_PREFIX} {date}]({}){stock}", product.url))
                    .unwrap_or_else(|| stock.clone());
                (status, detail)
            }
            Availability::InStock => (format!(" [✅In]({}){stock}", product.url), String::new()),
            Availability::OutOfStock => (format!(" ❌Out{stock}"), String::new()),
            Availability::Unknown => (String::new(), String::new()),
        };

        format!(
            "• {} {}{} | {}{}{}{}",
            Self::capacity_link(product),
            Self::grade_display(product),
            shorten_name(&product.name),
            price,
            status,
            detail,
            self.graph_link(product),
        )
    }

    fn price_change_line(
        &self,
        product: &Product,
        old: &rust_decimal::Decimal,
        new: &rust_decimal::Decimal,
        percent: f64,
    ) -> String {
        let emoji = if percent > 0.0 { "🔴" } else { "🟢" };
        let sign = if percent > 0.0 { "+" } else { "" };
        format!(
            "• {} {}{} | €{old} → €{new} ({emoji}{sign}{percent:.1}%){}",
            Self::capacity_link(product),
            Self::grade_display(product),
            shorten_name(&product.name),
            self.graph_link(product),
        )
    }

    /// Compose a changes-only report. `None` when there is nothing to say.
    pub fn changes_report(
        &self,
        recipient: &Recipient,
        events: &[&ChangeEvent],
        products: &BTreeMap<String, &Product>,
        header_url: &str,
    ) -> Option<String> {
        if events.is_empty() {
            return None;
        }

        let mut new_listings = Vec::new();
        let mut price_changes = Vec::new();
        let mut availability = Vec::new();
        let mut delivery = Vec::new();

        for event in events {
            let Some(product) = products.get(&event.product_id) else {
                continue;
            };
            match &event.kind {
                ChangeKind::NewListing => new_listings.push(self.product_line(product)),
                ChangeKind::PriceDrop { old, new, percent }
                | ChangeKind::PriceRise { old, new, percent } => {
                    price_changes.push(self.price_change_line(product, old, new, *percent));
                }
                ChangeKind::Restock { .. } => {
                    availability.push(format!(
                        "• ✅ {} {}{} | restocked{}{}",
                        Self::capacity_link(product),
                        Self::grade_display(product),
                        shorten_name(&product.name),
                        Self::stock_display(product),
                        self.graph_link(product),
                    ));
                }
                ChangeKind::OutOfStock => {
                    availability.push(format!(
                        "• ❌ {} {}{} | out of stock{}",
                        Self::capacity_link(product),
                        Self::grade_display(product),
                        shorten_name(&product.name),
                        self.graph_link(product),
                    ));
                }
                ChangeKind::DeliveryDateChange { old, new } => {
                    let change = match old {
                        Some(old) => format!("{old} → {new}"),
                        None => new.clone(),
                    };
                    delivery.push(format!(
                        "• {} {} {DETAIL_PREFIX} {change}",
                        Self::capacity_link(product),
                        shorten_name(&product.name),
                    ));
                }
            }
        }

        if new_listings.is_empty()
            && price_changes.is_empty()
            && availability.is_empty()
            && delivery.is_empty()
        {
            return None;
        }

        let mut msg = self.header(header_url);
        for (title, lines) in [
            ("✨ *New listings", &new_listings),
            ("💰 *Price changes", &price_changes),
            ("📦 *Availability", &availability),
            ("🚚 *Delivery dates", &delivery),
        ] {
            if !lines.is_empty() {
                msg.push_str(&format!("{title} ({}):*\n", lines.len()));
                msg.push_str(&lines.join("\n"));
                msg.push_str("\n\n");
            }
        }

        let mut msg = msg.trim_end().to_string();
        msg.push_str(&self.footer(recipient, true));
        Some(msg)
    }

    /// Compose the complete catalog report sent to full-type recipients
    /// every run.
    pub fn full_report(
        &self,
        recipient: &Recipient,
        products: &[&Product],
        header_url: &str,
    ) -> String {
        let in_stock = products
            .iter()
            .filter(|p| p.availability == Availability::InStock)
            .count();
        let preorder = products
            .iter()
            .filter(|p| p.availability == Availability::Preorder)
            .count();
        let out = products
            .iter()
            .filter(|p| p.availability == Availability::OutOfStock)
            .count();

        let mut msg = self.header(header_url);
        msg.push_str("📊 *Summary:*\n");
        msg.push_str(&format!("✅ In stock: {in_stock}\n"));
        msg.push_str(&format!("📦 Pre-order: {preorder}\n"));
        msg.push_str(&format!("❌ Out of stock: {out}\n\n"));

        msg.push_str(&format!("📋 *Catalog ({}):*\n", products.len()));
        for product in products {
            msg.push_str(&self.product_line(product));
            msg.push('\n');
        }

        let mut msg = msg.trim_end().to_string();
        msg.push_str(&self.footer(recipient, false));
        msg
    }

    /// Scheduled liveness ping, independent of scrape results.
    pub fn heartbeat(&self) -> String {
        format!(
            "💓 *Monitor alive* — scheduled check-in\n🔄 {}",
            self.ctx.now.format("%d.%m.%Y %H:%M:%S")
        )
    }
}
