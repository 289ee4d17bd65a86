pub mod message;
pub mod router;
pub mod telegram;

use async_trait::async_trait;

pub use message::MessageBuilder;
pub use router::{NotificationRouter, RoutingReport};
pub use telegram::TelegramTransport;

use crate::utils::error::Result;

/// The outbound messaging seam. The router only ever talks through this, so
/// tests substitute a recording fake and the Telegram implementation stays
/// replaceable.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(
        &self,
        chat_id: &str,
        thread_id: Option<i64>,
        text: &str,
        silent: bool,
    ) -> Result<()>;
}
