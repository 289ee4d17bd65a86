use std::collections::HashSet;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Local, NaiveTime};
use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::models::ReportType;
use crate::utils::text::mask_sensitive;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub monitor: MonitorConfig,
    pub scraper: ScraperConfig,
    pub telegram: TelegramConfig,
    pub state: StateConfig,
    pub history: HistoryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    pub catalog_url: String,
    /// Global capacity floor; recipients may override it per entry.
    pub min_capacity_ah: u32,
    /// Relative price change (percent) that triggers a price event.
    pub price_alert_threshold: f64,
    /// Restocks at or below this quantity stay out of "changes" reports.
    pub small_restock_threshold: u32,
    pub fetch_delivery_dates: bool,
    pub fetch_real_stock: bool,
    pub generate_graphs: bool,
    pub graph_base_url: Option<String>,
    /// Pause between detail-page fetches and probes, in milliseconds.
    pub detail_fetch_delay_ms: u64,
    /// Quiet window start hour (0-23); wraps midnight when start > end.
    pub quiet_hours_start: u8,
    pub quiet_hours_end: u8,
    /// Liveness ping times, "H:MM" or "HH:MM".
    pub heartbeat_times: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScraperConfig {
    pub retry_attempts: u32,
    pub retry_delay_ms: u64,
    /// Navigation/selector timeout, seconds.
    pub request_timeout: u64,
    pub user_agent: String,
    pub chrome_path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramConfig {
    pub bot_token: String,
    /// Override for tests; the real API otherwise.
    pub api_base: String,
    #[serde(default)]
    pub recipients: Vec<Recipient>,
}

/// One notification target. The first configured recipient is the primary
/// and must carry the header `url`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Recipient {
    pub chat_id: String,
    pub thread_id: Option<i64>,
    #[serde(rename = "type")]
    pub report: ReportType,
    pub min_capacity_ah: Option<u32>,
    pub url: Option<String>,
    pub name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateConfig {
    pub path: PathBuf,
    pub lock_path: PathBuf,
    /// A lock file older than this many seconds is presumed left by a
    /// crashed run.
    pub run_timeout: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryConfig {
    pub enabled: bool,
    pub db_path: String,
}

impl AppConfig {
    /// Layered load: built-in defaults, `config/default`, `config/<run_mode>`,
    /// `config/local`, then `CELLWATCH_`-prefixed environment variables.
    /// Recipients may also arrive as a JSON array in
    /// `CELLWATCH_RECIPIENTS_JSON`, which is the cron-friendly form.
    pub fn load(run_mode: Option<&str>) -> Result<Self, ConfigError> {
        let run_mode = run_mode
            .map(str::to_string)
            .unwrap_or_else(|| env::var("RUN_MODE").unwrap_or_else(|_| "development".into()));

        let s = Config::builder()
            .set_default(
                "monitor.catalog_url",
                "https://www.nkon.nl/rechargeable/lifepo4/prismatisch.html?___store=en",
            )?
            .set_default("monitor.min_capacity_ah", 200)?
            .set_default("monitor.price_alert_threshold", 5.0)?
            .set_default("monitor.small_restock_threshold", 16)?
            .set_default("monitor.fetch_delivery_dates", true)?
            .set_default("monitor.fetch_real_stock", true)?
            .set_default("monitor.generate_graphs", false)?
            .set_default("monitor.detail_fetch_delay_ms", 2000)?
            .set_default("monitor.quiet_hours_start", 21)?
            .set_default("monitor.quiet_hours_end", 8)?
            .set_default("monitor.heartbeat_times", vec!["8:00".to_string()])?
            .set_default("scraper.retry_attempts", 3)?
            .set_default("scraper.retry_delay_ms", 5000)?
            .set_default("scraper.request_timeout", 30)?
            .set_default(
                "scraper.user_agent",
                "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
            )?
            .set_default("telegram.bot_token", "")?
            .set_default("telegram.api_base", "https://api.telegram.org")?
            .set_default("state.path", "data/state.json")?
            .set_default("state.lock_path", "data/run.lock")?
            .set_default("state.run_timeout", 3600)?
            .set_default("history.enabled", true)?
            .set_default("history.db_path", "data/history.db")?
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{run_mode}")).required(false))
            .add_source(File::with_name("config/local").required(false))
            .add_source(Environment::with_prefix("CELLWATCH").separator("__"))
            .build()?;

        let mut config: AppConfig = s.try_deserialize()?;

        if let Ok(raw) = env::var("CELLWATCH_RECIPIENTS_JSON") {
            config.telegram.recipients = serde_json::from_str(&raw).map_err(|e| {
                ConfigError::Message(format!("CELLWATCH_RECIPIENTS_JSON is not valid JSON: {e}"))
            })?;
        }

        if config.scraper.chrome_path.is_none() {
            config.scraper.chrome_path = env::var("CHROME_PATH").ok();
        }

        config.normalize_recipients();
        config.validate()?;
        Ok(config)
    }

    /// A chat id must not receive both report types: when it appears in a
    /// changes-type entry, its full-type entry is dropped.
    pub fn normalize_recipients(&mut self) {
        let changes_ids: HashSet<String> = self
            .telegram
            .recipients
            .iter()
            .filter(|r| r.report == ReportType::Changes)
            .map(|r| r.chat_id.clone())
            .collect();

        self.telegram.recipients.retain(|r| {
            let keep = r.report == ReportType::Changes || !changes_ids.contains(&r.chat_id);
            if !keep {
                tracing::info!(
                    chat_id = %mask_sensitive(&r.chat_id),
                    "dropping full-report entry duplicated by a changes entry"
                );
            }
            keep
        });
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if Url::parse(&self.monitor.catalog_url).is_err() {
            return Err(ConfigError::Message("Invalid catalog URL format".into()));
        }

        if self.monitor.quiet_hours_start > 23 || self.monitor.quiet_hours_end > 23 {
            return Err(ConfigError::Message(
                "Quiet hours must be hours in the 0-23 range".into(),
            ));
        }

        if self.monitor.price_alert_threshold < 0.0 {
            return Err(ConfigError::Message(
                "price_alert_threshold cannot be negative".into(),
            ));
        }

        for t in &self.monitor.heartbeat_times {
            if parse_heartbeat_time(t).is_none() {
                return Err(ConfigError::Message(format!(
                    "Invalid heartbeat time '{t}', expected HH:MM"
                )));
            }
        }

        if !self.telegram.recipients.is_empty() {
            if self.telegram.bot_token.is_empty() {
                return Err(ConfigError::Message(
                    "telegram.bot_token is required when recipients are configured".into(),
                ));
            }

            for (i, r) in self.telegram.recipients.iter().enumerate() {
                if r.chat_id.is_empty() {
                    return Err(ConfigError::Message(format!(
                        "Recipient #{} has an empty chat_id",
                        i + 1
                    )));
                }
            }

            // The primary recipient brands every header; without its URL the
            // reports have no landing link.
            if self.telegram.recipients[0].url.is_none() {
                return Err(ConfigError::Message(
                    "The first recipient must carry the header url".into(),
                ));
            }
        }

        if self.scraper.request_timeout == 0 {
            return Err(ConfigError::Message(
                "scraper.request_timeout must be greater than 0".into(),
            ));
        }

        Ok(())
    }
}

/// Accepts "8:00" and "08:00".
pub fn parse_heartbeat_time(s: &str) -> Option<NaiveTime> {
    let (h, m) = s.trim().split_once(':')?;
    let hour: u32 = h.parse().ok()?;
    let minute: u32 = m.parse().ok()?;
    NaiveTime::from_hms_opt(hour, minute, 0)
}

/// Daily window during which routine notifications are deferred.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuietHours {
    pub start: u8,
    pub end: u8,
}

impl QuietHours {
    pub fn contains(&self, t: NaiveTime) -> bool {
        use chrono::Timelike;
        let hour = t.hour() as u8;
        if self.start > self.end {
            // Window wraps midnight, e.g. 21 - 8.
            hour >= self.start || hour < self.end
        } else {
            self.start <= hour && hour < self.end
        }
    }
}

/// The read-only configuration for one run. Built once by the orchestrator
/// and passed to every component; no ambient globals.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub catalog_url: String,
    pub min_capacity_ah: u32,
    pub price_alert_threshold: f64,
    pub small_restock_threshold: u32,
    pub fetch_delivery_dates: bool,
    pub fetch_real_stock: bool,
    pub generate_graphs: bool,
    pub graph_base_url: Option<String>,
    pub detail_fetch_delay: Duration,
    pub quiet_hours: QuietHours,
    pub heartbeat_times: Vec<NaiveTime>,
    pub now: DateTime<Local>,
    pub dry_run: bool,
}

impl RunContext {
    pub fn from_config(
        config: &AppConfig,
        now: DateTime<Local>,
        dry_run: bool,
    ) -> Result<Self, ConfigError> {
        let monitor = &config.monitor;
        let heartbeat_times = monitor
            .heartbeat_times
            .iter()
            .map(|t| {
                parse_heartbeat_time(t)
                    .ok_or_else(|| ConfigError::Message(format!("Invalid heartbeat time '{t}'")))
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(RunContext {
            catalog_url: monitor.catalog_url.clone(),
            min_capacity_ah: monitor.min_capacity_ah,
            price_alert_threshold: monitor.price_alert_threshold,
            small_restock_threshold: monitor.small_restock_threshold,
            fetch_delivery_dates: monitor.fetch_delivery_dates,
            fetch_real_stock: monitor.fetch_real_stock,
            generate_graphs: monitor.generate_graphs,
            graph_base_url: monitor.graph_base_url.clone(),
            detail_fetch_delay: Duration::from_millis(monitor.detail_fetch_delay_ms),
            quiet_hours: QuietHours {
                start: monitor.quiet_hours_start,
                end: monitor.quiet_hours_end,
            },
            heartbeat_times,
            now,
            dry_run,
        })
    }
}
