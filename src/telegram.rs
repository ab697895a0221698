//! Telegram Bot API implementation of [`ChatTransport`].
//!
//! Each assistant session gets a forum topic in one supergroup. Replies come
//! back through `getUpdates` long polling, which also serves as the
//! acknowledgement mechanism: requesting `offset = n` confirms every update
//! below `n`.

use std::time::Duration;

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize};
use serde_json::{json, Value};

use crate::{
    error::TransportError,
    helpers::truncate_with_ellipsis,
    transport::ChatTransport,
    types::{
        InboundEvent, InboundKind, InboundUpdate, MessageId, OutboundMessage, SenderIdentity,
        ThreadId, UpdateCursor, GENERAL_THREAD,
    },
};

pub const DEFAULT_API_BASE_URL: &str = "https://api.telegram.org";

const MAX_MESSAGE_LEN: usize = 4000;
const MAX_TOPIC_NAME_LEN: usize = 128;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
/// Slack on top of the server-side long-poll timeout.
const POLL_GRACE: Duration = Duration::from_secs(10);

#[derive(Debug, Deserialize)]
struct TgResponse<T> {
    ok: bool,
    result: Option<T>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    error_code: Option<u16>,
}

#[derive(Debug, Deserialize)]
struct TgUpdate {
    update_id: i64,
    #[serde(default)]
    message: Option<TgMessage>,
    #[serde(default)]
    callback_query: Option<TgCallbackQuery>,
}

#[derive(Debug, Deserialize)]
struct TgMessage {
    message_id: i64,
    chat: TgChat,
    #[serde(default)]
    from: Option<TgUser>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    message_thread_id: Option<i64>,
    #[serde(default)]
    reply_markup: Option<TgInlineKeyboard>,
}

#[derive(Debug, Deserialize)]
struct TgChat {
    id: i64,
}

#[derive(Debug, Deserialize)]
struct TgUser {
    id: i64,
}

#[derive(Debug, Deserialize)]
struct TgCallbackQuery {
    id: String,
    from: TgUser,
    #[serde(default)]
    message: Option<TgMessage>,
    #[serde(default)]
    data: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TgInlineKeyboard {
    #[serde(default)]
    inline_keyboard: Vec<Vec<TgInlineButton>>,
}

#[derive(Debug, Deserialize)]
struct TgInlineButton {
    text: String,
    #[serde(default)]
    callback_data: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TgForumTopic {
    message_thread_id: i64,
}

#[derive(Debug, Deserialize)]
struct TgSentMessage {
    message_id: i64,
}

#[derive(Clone)]
pub struct TelegramClient {
    http: reqwest::Client,
    base_url: String,
    bot_token: String,
    chat_id: i64,
}

impl TelegramClient {
    pub fn new(base_url: impl Into<String>, bot_token: impl Into<String>, chat_id: i64) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            bot_token: bot_token.into(),
            chat_id,
        }
    }

    pub fn chat_id(&self) -> i64 {
        self.chat_id
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/bot{}/{}", self.base_url, self.bot_token, method)
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        body: &Value,
        timeout: Duration,
    ) -> Result<T, TransportError> {
        let res = self
            .http
            .post(self.method_url(method))
            .timeout(timeout)
            .json(body)
            .send()
            .await?;
        let status = res.status().as_u16();
        let parsed: TgResponse<T> = res.json().await?;
        if !parsed.ok {
            return Err(TransportError::Api {
                method: method.to_string(),
                code: parsed.error_code.unwrap_or(status),
                description: parsed.description.unwrap_or_default(),
            });
        }
        parsed.result.ok_or_else(|| TransportError::MissingField {
            method: method.to_string(),
            field: "result".to_string(),
        })
    }

    fn message_body(&self, thread_id: ThreadId, message: &OutboundMessage, html: bool) -> Value {
        let mut body = json!({
            "chat_id": self.chat_id,
            "text": truncate_with_ellipsis(&message.text, MAX_MESSAGE_LEN),
        });
        if html {
            body["parse_mode"] = json!("HTML");
        }
        // The General topic rejects an explicit `message_thread_id`.
        if thread_id > GENERAL_THREAD {
            body["message_thread_id"] = json!(thread_id);
        }
        if !message.buttons.is_empty() {
            let keyboard: Vec<Vec<Value>> = message
                .buttons
                .iter()
                .map(|row| {
                    row.iter()
                        .map(|b| json!({"text": b.label, "callback_data": b.payload}))
                        .collect()
                })
                .collect();
            body["reply_markup"] = json!({ "inline_keyboard": keyboard });
        }
        body
    }
}

fn map_update(update: TgUpdate) -> InboundUpdate {
    let next_cursor = update.update_id + 1;
    let event = if let Some(cq) = update.callback_query {
        cq.data.map(|data| {
            let message = cq.message.as_ref();
            let label = message
                .and_then(|m| m.reply_markup.as_ref())
                .and_then(|markup| {
                    markup
                        .inline_keyboard
                        .iter()
                        .flatten()
                        .find(|b| b.callback_data.as_deref() == Some(data.as_str()))
                        .map(|b| b.text.clone())
                });
            InboundEvent {
                sender: SenderIdentity {
                    user_id: cq.from.id,
                    chat_id: message.map(|m| m.chat.id),
                },
                thread_id: message.and_then(|m| m.message_thread_id),
                kind: InboundKind::Button {
                    tap_id: cq.id.clone(),
                    message_id: message.map(|m| m.message_id),
                    data,
                    label,
                },
            }
        })
    } else if let Some(msg) = update.message {
        match (msg.from, msg.text) {
            (Some(from), Some(text)) if !text.trim().is_empty() => Some(InboundEvent {
                sender: SenderIdentity {
                    user_id: from.id,
                    chat_id: Some(msg.chat.id),
                },
                thread_id: msg.message_thread_id,
                kind: InboundKind::Text {
                    message_id: msg.message_id,
                    text,
                },
            }),
            _ => None,
        }
    } else {
        None
    };
    InboundUpdate { next_cursor, event }
}

fn is_markup_rejection(error: &TransportError) -> bool {
    matches!(
        error,
        TransportError::Api { code: 400, description, .. } if description.contains("parse entities")
    )
}

#[async_trait]
impl ChatTransport for TelegramClient {
    async fn create_thread(&self, title: &str) -> Result<ThreadId, TransportError> {
        let topic: TgForumTopic = self
            .call(
                "createForumTopic",
                &json!({
                    "chat_id": self.chat_id,
                    "name": truncate_with_ellipsis(title, MAX_TOPIC_NAME_LEN),
                }),
                REQUEST_TIMEOUT,
            )
            .await?;
        Ok(topic.message_thread_id)
    }

    async fn archive_thread(&self, thread_id: ThreadId) -> Result<(), TransportError> {
        let _: Value = self
            .call(
                "closeForumTopic",
                &json!({
                    "chat_id": self.chat_id,
                    "message_thread_id": thread_id,
                }),
                REQUEST_TIMEOUT,
            )
            .await?;
        Ok(())
    }

    async fn send_message(
        &self,
        thread_id: ThreadId,
        message: &OutboundMessage,
    ) -> Result<MessageId, TransportError> {
        let body = self.message_body(thread_id, message, true);
        match self
            .call::<TgSentMessage>("sendMessage", &body, REQUEST_TIMEOUT)
            .await
        {
            Ok(sent) => Ok(sent.message_id),
            Err(error) if is_markup_rejection(&error) => {
                tracing::warn!(
                    target = "pane_relay::telegram",
                    thread_id = thread_id,
                    error = %error,
                    "HTML rejected, resending as plain text"
                );
                let plain = self.message_body(thread_id, message, false);
                let sent: TgSentMessage =
                    self.call("sendMessage", &plain, REQUEST_TIMEOUT).await?;
                Ok(sent.message_id)
            }
            Err(error) => Err(error),
        }
    }

    async fn fetch_updates(
        &self,
        cursor: Option<UpdateCursor>,
        timeout: Duration,
    ) -> Result<Vec<InboundUpdate>, TransportError> {
        let mut body = json!({
            "timeout": timeout.as_secs(),
            "allowed_updates": ["message", "callback_query"],
        });
        if let Some(offset) = cursor {
            body["offset"] = json!(offset);
        }
        let updates: Vec<TgUpdate> = self
            .call("getUpdates", &body, timeout + POLL_GRACE)
            .await?;
        Ok(updates.into_iter().map(map_update).collect())
    }

    async fn acknowledge(&self, cursor: UpdateCursor) -> Result<(), TransportError> {
        let _: Vec<Value> = self
            .call(
                "getUpdates",
                &json!({"offset": cursor, "timeout": 0, "limit": 1}),
                REQUEST_TIMEOUT,
            )
            .await?;
        Ok(())
    }

    async fn answer_button(&self, tap_id: &str, text: &str) -> Result<(), TransportError> {
        let _: Value = self
            .call(
                "answerCallbackQuery",
                &json!({
                    "callback_query_id": tap_id,
                    "text": truncate_with_ellipsis(text, 200),
                }),
                REQUEST_TIMEOUT,
            )
            .await?;
        Ok(())
    }

    async fn clear_buttons(&self, message_id: MessageId) -> Result<(), TransportError> {
        let _: Value = self
            .call(
                "editMessageReplyMarkup",
                &json!({
                    "chat_id": self.chat_id,
                    "message_id": message_id,
                    "reply_markup": {"inline_keyboard": []},
                }),
                REQUEST_TIMEOUT,
            )
            .await?;
        Ok(())
    }

    async fn send_typing(&self, thread_id: ThreadId) -> Result<(), TransportError> {
        let mut body = json!({"chat_id": self.chat_id, "action": "typing"});
        if thread_id > GENERAL_THREAD {
            body["message_thread_id"] = json!(thread_id);
        }
        let _: Value = self.call("sendChatAction", &body, REQUEST_TIMEOUT).await?;
        Ok(())
    }
}
