//! Collaborator contracts.
//!
//! The core never talks to a chat platform, a database, or a rate limiter
//! directly; front-ends supply implementations of these traits. Storage and
//! rate-limit hooks are optional, and their failures must never block the
//! main flow.

use async_trait::async_trait;
use courier_protocol::AgentResponse;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChatId(pub i64);

/// Handle to a message previously sent through the transport, sufficient to
/// edit or delete it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRef {
    pub chat: ChatId,
    pub message_id: i64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ParseMode {
    #[default]
    Plain,
    Markdown,
    Html,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InlineButton {
    pub label: String,
    pub callback_data: String,
}

/// Two-dimensional ordered grid of buttons attached to a message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InlineKeyboard {
    pub rows: Vec<Vec<InlineButton>>,
}

impl InlineKeyboard {
    /// Lay buttons out left-to-right, `columns` per row.
    pub fn grid(buttons: Vec<InlineButton>, columns: usize) -> Self {
        let columns = columns.max(1);
        let mut rows = Vec::new();
        let mut row = Vec::new();
        for button in buttons {
            row.push(button);
            if row.len() >= columns {
                rows.push(std::mem::take(&mut row));
            }
        }
        if !row.is_empty() {
            rows.push(row);
        }
        Self { rows }
    }
}

/// Chat-platform operations the core depends on.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    async fn send_message(
        &self,
        chat: ChatId,
        text: &str,
        parse_mode: ParseMode,
        reply_markup: Option<InlineKeyboard>,
    ) -> anyhow::Result<MessageRef>;

    /// Implementations must treat the platform's "message is not modified"
    /// rejection as success; re-sending an identical body is a no-op.
    async fn edit_message(
        &self,
        message: &MessageRef,
        text: &str,
        parse_mode: ParseMode,
    ) -> anyhow::Result<()>;

    async fn delete_message(&self, message: &MessageRef) -> anyhow::Result<()>;

    async fn send_document(
        &self,
        chat: ChatId,
        bytes: Vec<u8>,
        filename: &str,
        caption: Option<&str>,
    ) -> anyhow::Result<()>;
}

/// Optional audit/history persistence. Fire-and-forget: callers log
/// failures and move on.
#[async_trait]
pub trait InteractionStorage: Send + Sync {
    async fn save_interaction(
        &self,
        user_id: i64,
        session_id: &str,
        prompt: &str,
        response: &AgentResponse,
    ) -> anyhow::Result<()>;

    async fn record_command(
        &self,
        user_id: i64,
        command: &str,
        args: &[String],
        success: bool,
    ) -> anyhow::Result<()>;
}

/// Optional pre-dispatch rate limiting.
#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Returns whether the request may proceed, with a user-facing reason
    /// when it may not.
    async fn check(&self, user_id: i64, estimated_cost: f64) -> (bool, Option<String>);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grid_layout_fills_rows_in_order() {
        let buttons: Vec<InlineButton> = (1..=5)
            .map(|i| InlineButton {
                label: format!("b{i}"),
                callback_data: format!("cb:{i}"),
            })
            .collect();
        let keyboard = InlineKeyboard::grid(buttons, 2);
        assert_eq!(keyboard.rows.len(), 3);
        assert_eq!(keyboard.rows[0].len(), 2);
        assert_eq!(keyboard.rows[2].len(), 1);
        assert_eq!(keyboard.rows[2][0].label, "b5");
    }

    #[test]
    fn zero_columns_is_clamped() {
        let keyboard = InlineKeyboard::grid(
            vec![InlineButton {
                label: "x".to_string(),
                callback_data: "cb:x".to_string(),
            }],
            0,
        );
        assert_eq!(keyboard.rows.len(), 1);
    }
}
