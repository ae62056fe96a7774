use async_trait::async_trait;

use crate::{
    domain::{ChatId, UserId},
    Result,
};

/// Inbound message envelope as delivered by the transport adapter.
#[derive(Clone, Debug)]
pub struct InboundMessage {
    pub user_id: UserId,
    pub chat_id: ChatId,
    pub username: Option<String>,
    pub text: String,
}

/// Outbound port: accepts text chunks for best-effort, at-least-once delivery.
///
/// Telegram is the first implementation; delivery failures surface as
/// `Error::Transport`, which callers log and never retry.
#[async_trait]
pub trait ReplySink: Send + Sync {
    async fn send_text(&self, chat_id: ChatId, html: &str) -> Result<()>;
}
