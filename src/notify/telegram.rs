use async_trait::async_trait;
use reqwest::Client;
use serde_json::{Value, json};

use crate::config::TelegramConfig;
use crate::notify::Transport;
use crate::utils::error::{MonitorError, Result};
use crate::utils::text::mask_sensitive;

/// Telegram caps message text at 4096 characters.
pub const MESSAGE_LIMIT: usize = 4096;

pub struct TelegramTransport {
    client: Client,
    api_base: String,
    bot_token: String,
}

impl TelegramTransport {
    pub fn new(config: &TelegramConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(15))
            .build()?;
        Ok(TelegramTransport {
            client,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            bot_token: config.bot_token.clone(),
        })
    }

    async fn send_chunk(
        &self,
        chat_id: &str,
        thread_id: Option<i64>,
        text: &str,
        silent: bool,
    ) -> Result<()> {
        let url = format!("{}/bot{}/sendMessage", self.api_base, self.bot_token);

        // Numeric ids go out as numbers, usernames as strings.
        let chat: Value = chat_id
            .parse::<i64>()
            .map(Value::from)
            .unwrap_or_else(|_| Value::from(chat_id));

        let mut payload = json!({
            "chat_id": chat,
            "text": text,
            "parse_mode": "Markdown",
            "disable_web_page_preview": true,
            "disable_notification": silent,
        });
        if let Some(thread) = thread_id {
            payload["message_thread_id"] = json!(thread);
        }

        let response = self.client.post(&url).json(&payload).send().await?;
        let body: Value = response.json().await?;

        if body.get("ok").and_then(Value::as_bool).unwrap_or(false) {
            tracing::info!(chat = %mask_sensitive(chat_id), "message delivered");
            Ok(())
        } else {
            let description = body
                .get("description")
                .and_then(Value::as_str)
                .unwrap_or("unknown Telegram error");
            Err(MonitorError::Transport(format!(
                "send to {} failed: {description}",
                mask_sensitive(chat_id)
            )))
        }
    }
}

#[async_trait]
impl Transport for TelegramTransport {
    async fn send(
        &self,
        chat_id: &str,
        thread_id: Option<i64>,
        text: &str,
        silent: bool,
    ) -> Result<()> {
        for chunk in split_message(text, MESSAGE_LIMIT) {
            self.send_chunk(chat_id, thread_id, &chunk, silent).await?;
        }
        Ok(())
    }
}

/// Split on line boundaries so a report never tears mid-row; a single line
/// longer than the limit is hard-split at character boundaries.
pub fn split_message(text: &str, limit: usize) -> Vec<String> {
    if text.chars().count() <= limit {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut current = String::new();

    for line in text.lines() {
        let mut pieces: Vec<String> = Vec::new();
        if line.chars().count() > limit {
            let mut piece = String::new();
            for c in line.chars() {
                if piece.chars().count() == limit {
                    pieces.push(std::mem::take(&mut piece));
                }
                piece.push(c);
            }
            if !piece.is_empty() {
                pieces.push(piece);
            }
        } else {
            pieces.push(line.to_string());
        }

        for piece in pieces {
            let needed = piece.chars().count() + if current.is_empty() { 0 } else { 1 };
            if current.chars().count() + needed > limit && !current.is_empty() {
                chunks.push(std::mem::take(&mut current));
            }
            if !current.is_empty() {
                current.push('\n');
            }
            current.push_str(&piece);
        }
    }

    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}
