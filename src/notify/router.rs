use std::collections::BTreeMap;

use chrono::{Duration as ChronoDuration, Utc};
use tokio_retry::Retry;
use tokio_retry::strategy::ExponentialBackoff;

use crate::config::{Recipient, RunContext};
use crate::models::{ChangeEvent, PendingMessage, PersistedState, Product, ReportType};
use crate::notify::{MessageBuilder, Transport};
use crate::utils::text::mask_sensitive;

/// Deferred messages older than this are dropped instead of flushed; a
/// day-old restock report is stale news.
const PENDING_MAX_AGE_HOURS: i64 = 24;

/// Attempts per recipient: one initial try plus this many retries.
const SEND_RETRIES: usize = 2;

/// What one dispatch pass did; the orchestrator folds this back into the
/// persisted state.
#[derive(Debug, Default)]
pub struct RoutingReport {
    pub messages_sent: usize,
    pub deferred: Vec<PendingMessage>,
    /// Heartbeat times ("HH:MM") that fired this run.
    pub heartbeats_marked: Vec<String>,
    pub warnings: Vec<String>,
}

/// Fans reports out to recipients: capacity filtering, quiet-hours deferral,
/// heartbeats, and per-recipient retry isolation.
pub struct NotificationRouter<'a> {
    transport: &'a dyn Transport,
    recipients: &'a [Recipient],
}

impl<'a> NotificationRouter<'a> {
    pub fn new(transport: &'a dyn Transport, recipients: &'a [Recipient]) -> Self {
        Self {
            transport,
            recipients,
        }
    }

    pub async fn dispatch(
        &self,
        ctx: &RunContext,
        events: &[ChangeEvent],
        products: &[Product],
        state: &PersistedState,
    ) -> RoutingReport {
        let mut report = RoutingReport::default();
        let builder = MessageBuilder::new(ctx);
        let quiet = ctx.quiet_hours.contains(ctx.now.time());
        let by_key: BTreeMap<String, &Product> = products.iter().map(|p| (p.key(), p)).collect();

        // Header branding falls back to the primary recipient's URL.
        let primary_url = self
            .recipients
            .first()
            .and_then(|r| r.url.clone())
            .unwrap_or_default();

        self.dispatch_heartbeats(ctx, &builder, state, quiet, &mut report)
            .await;
        self.flush_pending(ctx, state, quiet, &mut report).await;

        for recipient in self.recipients {
            let min_capacity = recipient.min_capacity_ah.unwrap_or(ctx.min_capacity_ah);
            let header_url = recipient.url.as_deref().unwrap_or(&primary_url);

            let text = match recipient.report {
                ReportType::Full => {
                    let filtered: Vec<&Product> = products
                        .iter()
                        .filter(|p| p.meets_capacity(min_capacity))
                        .collect();
                    Some(builder.full_report(recipient, &filtered, header_url))
                }
                ReportType::Changes => {
                    let filtered: Vec<&ChangeEvent> = events
                        .iter()
                        .filter(|e| !e.is_suppressed())
                        .filter(|e| {
                            by_key
                                .get(&e.product_id)
                                .is_some_and(|p| p.meets_capacity(min_capacity))
                        })
                        .collect();
                    builder.changes_report(recipient, &filtered, &by_key, header_url)
                }
            };

            let Some(text) = text else {
                tracing::debug!(
                    chat = %mask_sensitive(&recipient.chat_id),
                    "nothing to report for recipient"
                );
                continue;
            };

            if quiet {
                tracing::info!(
                    chat = %mask_sensitive(&recipient.chat_id),
                    "quiet hours, deferring report"
                );
                report.deferred.push(PendingMessage {
                    chat_id: recipient.chat_id.clone(),
                    thread_id: recipient.thread_id,
                    text,
                    queued_at: Utc::now(),
                });
                continue;
            }

            self.send_isolated(ctx, &recipient.chat_id, recipient.thread_id, &text, false, &mut report)
                .await;
        }

        report
    }

    /// Heartbeats are a liveness signal independent of scrape results: they
    /// fire at their configured times even inside quiet hours (silently).
    async fn dispatch_heartbeats(
        &self,
        ctx: &RunContext,
        builder: &MessageBuilder<'_>,
        state: &PersistedState,
        quiet: bool,
        report: &mut RoutingReport,
    ) {
        let today = ctx.now.date_naive();
        let now_time = ctx.now.time();

        for time in &ctx.heartbeat_times {
            let key = time.format("%H:%M").to_string();
            if now_time < *time {
                continue;
            }
            if state.heartbeats_sent.get(&key) == Some(&today) {
                continue;
            }

            tracing::info!(time = %key, "heartbeat due");
            let text = builder.heartbeat();
            for recipient in self.recipients {
                self.send_isolated(
                    ctx,
                    &recipient.chat_id,
                    recipient.thread_id,
                    &text,
                    quiet,
                    report,
                )
                .await;
            }
            report.heartbeats_marked.push(key);
        }
    }

    /// Flush messages deferred by an earlier quiet window. Failures and
    /// still-quiet runs keep them queued; stale ones are dropped.
    async fn flush_pending(
        &self,
        ctx: &RunContext,
        state: &PersistedState,
        quiet: bool,
        report: &mut RoutingReport,
    ) {
        for pending in &state.pending {
            let age = Utc::now() - pending.queued_at;
            if age > ChronoDuration::hours(PENDING_MAX_AGE_HOURS) {
                tracing::warn!(
                    chat = %mask_sensitive(&pending.chat_id),
                    "dropping stale deferred message"
                );
                continue;
            }
            if quiet {
                report.deferred.push(pending.clone());
                continue;
            }

            tracing::info!(
                chat = %mask_sensitive(&pending.chat_id),
                "flushing deferred message"
            );
            self.send_isolated(
                ctx,
                &pending.chat_id,
                pending.thread_id,
                &pending.text,
                false,
                report,
            )
            .await;
        }
    }

    /// One recipient's failure never blocks the others: bounded retries with
    /// backoff, then a run-level warning.
    async fn send_isolated(
        &self,
        ctx: &RunContext,
        chat_id: &str,
        thread_id: Option<i64>,
        text: &str,
        silent: bool,
        report: &mut RoutingReport,
    ) {
        if ctx.dry_run {
            tracing::info!(
                chat = %mask_sensitive(chat_id),
                "[DRY RUN] would send:\n{text}"
            );
            report.messages_sent += 1;
            return;
        }

        let strategy = ExponentialBackoff::from_millis(500).take(SEND_RETRIES);
        let result = Retry::spawn(strategy, || {
            self.transport.send(chat_id, thread_id, text, silent)
        })
        .await;

        match result {
            Ok(()) => report.messages_sent += 1,
            Err(e) => {
                let warning = format!(
                    "delivery to {} failed after retries: {e}",
                    mask_sensitive(chat_id)
                );
                tracing::error!("{warning}");
                report.warnings.push(warning);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::{Local, TimeZone, Utc};
    use rust_decimal::Decimal;
    use std::str::FromStr;
    use tokio::sync::Mutex;

    use crate::models::{Availability, ChangeKind, Snapshot, StockLevel};
    use crate::utils::error::{MonitorError, Result};

    struct RecordingTransport {
        sent: Mutex<Vec<(String, String, bool)>>,
        fail_chat: Option<String>,
    }

    impl RecordingTransport {
        fn new() -> Self {
            Self {
                sent: Mutex::new(Vec::new()),
                fail_chat: None,
            }
        }

        fn failing_for(chat: &str) -> Self {
            Self {
                sent: Mutex::new(Vec::new()),
                fail_chat: Some(chat.to_string()),
            }
        }

        async fn sent(&self) -> Vec<(String, String, bool)> {
            self.sent.lock().await.clone()
        }
    }

    #[async_trait]
    impl Transport for RecordingTransport {
        async fn send(
            &self,
            chat_id: &str,
            _thread_id: Option<i64>,
            text: &str,
            silent: bool,
        ) -> Result<()> {
            if self.fail_chat.as_deref() == Some(chat_id) {
                return Err(MonitorError::Transport("simulated outage".to_string()));
            }
            self.sent
                .lock()
                .await
                .push((chat_id.to_string(), text.to_string(), silent));
            Ok(())
        }
    }

    fn ctx_at(hour: u32) -> RunContext {
        // No heartbeat schedule; heartbeat behavior has its own tests.
        let mut config = crate::config::tests::valid_config();
        config.monitor.heartbeat_times.clear();
        let now = Local
            .with_ymd_and_hms(2026, 8, 6, hour, 15, 0)
            .single()
            .unwrap();
        RunContext::from_config(&config, now, false).unwrap()
    }

    fn ctx_with_heartbeat(hour: u32) -> RunContext {
        let config = crate::config::tests::valid_config();
        let now = Local
            .with_ymd_and_hms(2026, 8, 6, hour, 15, 0)
            .single()
            .unwrap();
        RunContext::from_config(&config, now, false).unwrap()
    }

    fn product(url: &str, capacity: u32) -> Product {
        Product {
            url: url.to_string(),
            name: format!("Cell {capacity}Ah"),
            capacity_ah: Some(capacity),
            price: Decimal::from_str("89.95").ok(),
            price_text: Some("€89.95".to_string()),
            currency: "EUR".to_string(),
            listed_stock_text: None,
            availability: Availability::InStock,
            delivery_date: None,
            real_stock: None,
            variant_options: Vec::new(),
            seen_at: Utc::now(),
        }
    }

    fn recipients() -> Vec<Recipient> {
        vec![
            Recipient {
                chat_id: "-1001".to_string(),
                thread_id: None,
                report: ReportType::Full,
                min_capacity_ah: None,
                url: Some("https://t.me/group".to_string()),
                name: None,
            },
            Recipient {
                chat_id: "-1002".to_string(),
                thread_id: None,
                report: ReportType::Changes,
                min_capacity_ah: Some(200),
                url: None,
                name: None,
            },
        ]
    }

    fn restock_event(product: &Product, suppressed: bool) -> ChangeEvent {
        ChangeEvent {
            product_id: product.key(),
            kind: ChangeKind::Restock {
                level: Some(StockLevel::Exact(if suppressed { 3 } else { 40 })),
                suppressed,
            },
        }
    }

    #[tokio::test]
    async fn test_full_recipient_always_gets_report() {
        let transport = RecordingTransport::new();
        let recipients = recipients();
        let router = NotificationRouter::new(&transport, &recipients);
        let products = vec![product("https://s/a", 280)];

        let report = router
            .dispatch(&ctx_at(12), &[], &products, &PersistedState::default())
            .await;

        let sent = transport.sent().await;
        assert_eq!(report.messages_sent, 1);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "-1001");
        // The changes recipient stays silent with no events.
    }

    #[tokio::test]
    async fn test_suppressed_events_skip_changes_recipients() {
        let transport = RecordingTransport::new();
        let recipients = recipients();
        let router = NotificationRouter::new(&transport, &recipients);
        let item = product("https://s/a", 280);
        let events = vec![restock_event(&item, true)];
        let products = vec![item];

        router
            .dispatch(&ctx_at(12), &events, &products, &PersistedState::default())
            .await;

        let sent = transport.sent().await;
        // Only the full report goes out; the suppressed restock produced no
        // changes message.
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "-1001");
    }

    #[tokio::test]
    async fn test_capacity_filter_per_recipient() {
        let transport = RecordingTransport::new();
        let recipients = recipients();
        let router = NotificationRouter::new(&transport, &recipients);
        // Below the changes recipient's 200Ah floor.
        let small = product("https://s/small", 100);
        let events = vec![restock_event(&small, false)];
        let products = vec![small];

        router
            .dispatch(&ctx_at(12), &events, &products, &PersistedState::default())
            .await;

        let sent = transport.sent().await;
        assert_eq!(sent.len(), 1, "only the full report should go out");
        assert_eq!(sent[0].0, "-1001");
    }

    #[tokio::test]
    async fn test_quiet_hours_defer_reports() {
        let transport = RecordingTransport::new();
        let recipients = recipients();
        let router = NotificationRouter::new(&transport, &recipients);
        let item = product("https://s/a", 280);
        let events = vec![restock_event(&item, false)];
        let products = vec![item];

        // 22:15 is inside the 21-8 window.
        let report = router
            .dispatch(&ctx_at(22), &events, &products, &PersistedState::default())
            .await;

        assert!(transport.sent().await.is_empty());
        assert_eq!(report.deferred.len(), 2);
        assert_eq!(report.messages_sent, 0);
    }

    #[tokio::test]
    async fn test_deferred_messages_flush_outside_quiet_hours() {
        let transport = RecordingTransport::new();
        let recipients = recipients();
        let router = NotificationRouter::new(&transport, &recipients);

        let state = PersistedState {
            snapshot: Snapshot::default(),
            pending: vec![PendingMessage {
                chat_id: "-1002".to_string(),
                thread_id: None,
                text: "deferred report".to_string(),
                queued_at: Utc::now(),
            }],
            heartbeats_sent: Default::default(),
        };

        let report = router.dispatch(&ctx_at(12), &[], &[], &state).await;

        let sent = transport.sent().await;
        assert!(sent.iter().any(|(chat, text, _)| chat == "-1002" && text == "deferred report"));
        assert!(report.deferred.is_empty());
    }

    #[tokio::test]
    async fn test_stale_deferred_messages_dropped() {
        let transport = RecordingTransport::new();
        let recipients = recipients();
        let router = NotificationRouter::new(&transport, &recipients);

        let state = PersistedState {
            snapshot: Snapshot::default(),
            pending: vec![PendingMessage {
                chat_id: "-1002".to_string(),
                thread_id: None,
                text: "ancient news".to_string(),
                queued_at: Utc::now() - ChronoDuration::hours(30),
            }],
            heartbeats_sent: Default::default(),
        };

        let report = router.dispatch(&ctx_at(12), &[], &[], &state).await;

        assert!(transport.sent().await.is_empty());
        assert!(report.deferred.is_empty());
    }

    #[tokio::test]
    async fn test_heartbeat_fires_inside_quiet_hours() {
        let transport = RecordingTransport::new();
        let recipients = recipients();
        let router = NotificationRouter::new(&transport, &recipients);

        // 22:15, quiet; the 8:00 heartbeat has not fired today.
        let report = router
            .dispatch(&ctx_with_heartbeat(22), &[], &[], &PersistedState::default())
            .await;

        let sent = transport.sent().await;
        assert_eq!(sent.len(), 2, "heartbeat goes to every recipient");
        assert!(sent.iter().all(|(_, text, silent)| text.contains("Monitor alive") && *silent));
        assert_eq!(report.heartbeats_marked, vec!["08:00".to_string()]);
    }

    #[tokio::test]
    async fn test_heartbeat_not_repeated_same_day() {
        let transport = RecordingTransport::new();
        let recipients = recipients();
        let router = NotificationRouter::new(&transport, &recipients);

        let mut state = PersistedState::default();
        state.heartbeats_sent.insert(
            "08:00".to_string(),
            chrono::NaiveDate::from_ymd_opt(2026, 8, 6).unwrap(),
        );

        let report = router.dispatch(&ctx_with_heartbeat(12), &[], &[], &state).await;

        assert!(transport.sent().await.is_empty());
        assert!(report.heartbeats_marked.is_empty());
    }

    #[tokio::test]
    async fn test_delivery_failure_is_isolated() {
        let transport = RecordingTransport::failing_for("-1001");
        let recipients = recipients();
        let router = NotificationRouter::new(&transport, &recipients);
        let item = product("https://s/a", 280);
        let events = vec![restock_event(&item, false)];
        let products = vec![item];

        let report = router
            .dispatch(&ctx_at(12), &events, &products, &PersistedState::default())
            .await;

        let sent = transport.sent().await;
        // The failing full-report recipient did not stop the changes one.
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "-1002");
        assert_eq!(report.warnings.len(), 1);
        assert!(report.warnings[0].contains("failed after retries"));
    }

    #[tokio::test]
    async fn test_dry_run_sends_nothing() {
        let transport = RecordingTransport::new();
        let recipients = recipients();
        let router = NotificationRouter::new(&transport, &recipients);
        let products = vec![product("https://s/a", 280)];

        let mut config = crate::config::tests::valid_config();
        config.monitor.heartbeat_times.clear();
        let now = Local.with_ymd_and_hms(2026, 8, 6, 12, 15, 0).single().unwrap();
        let ctx = RunContext::from_config(&config, now, true).unwrap();

        let report = router
            .dispatch(&ctx, &[], &products, &PersistedState::default())
            .await;

        assert!(transport.sent().await.is_empty());
        // Dry run still counts what would have gone out.
        assert_eq!(report.messages_sent, 1);
    }
}
