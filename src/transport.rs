//! Chat transport abstraction. [`crate::telegram::TelegramClient`] is the
//! production implementation; tests substitute an in-memory fake.

use std::time::Duration;

use async_trait::async_trait;

use crate::{
    error::TransportError,
    types::{InboundUpdate, MessageId, OutboundMessage, ThreadId, UpdateCursor},
};

#[async_trait]
pub trait ChatTransport: Send + Sync {
    /// Open a new conversation thread and return its id.
    async fn create_thread(&self, title: &str) -> Result<ThreadId, TransportError>;

    /// Close a thread so it no longer accepts replies.
    async fn archive_thread(&self, thread_id: ThreadId) -> Result<(), TransportError>;

    async fn send_message(
        &self,
        thread_id: ThreadId,
        message: &OutboundMessage,
    ) -> Result<MessageId, TransportError>;

    /// Long-poll for inbound updates after `cursor`. Blocks server-side for up
    /// to `timeout` when nothing is pending.
    async fn fetch_updates(
        &self,
        cursor: Option<UpdateCursor>,
        timeout: Duration,
    ) -> Result<Vec<InboundUpdate>, TransportError>;

    /// Confirm every update before `cursor` as consumed, so a restarted
    /// poller does not see it again.
    async fn acknowledge(&self, cursor: UpdateCursor) -> Result<(), TransportError>;

    /// Dismiss the client-side spinner of a button tap with a short notice.
    async fn answer_button(&self, tap_id: &str, text: &str) -> Result<(), TransportError>;

    /// Remove the keyboard from an answered prompt.
    async fn clear_buttons(&self, message_id: MessageId) -> Result<(), TransportError>;

    /// Show a short-lived "typing" indicator in a thread.
    async fn send_typing(&self, thread_id: ThreadId) -> Result<(), TransportError>;
}
