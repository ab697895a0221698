//! Attention events rendered as chat messages in the session's thread.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use serde_json::Value;

use crate::{
    helpers::{html_escape, truncate_with_ellipsis},
    hook::{AttentionEvent, Question, ToolOutcome, ASK_USER_QUESTION_TOOL},
    prompt::{choice_buttons, permission_buttons},
    store::SessionStore,
    transport::ChatTransport,
    types::{MessageId, OutboundMessage, SessionStatus, ThreadId},
};

const DETAIL_LIMIT: usize = 300;
const TOOL_COMMAND_LIMIT: usize = 100;
const TOOL_ERROR_LIMIT: usize = 200;
/// A tool result only gets a follow-up if its prompt was posted this recently.
const PERMISSION_FOLLOW_UP_SECS: i64 = 300;
/// Leaves room for the header and markup inside the 4096-char message limit.
const STOP_BODY_LIMIT: usize = 3500;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmitOutcome {
    Sent {
        thread_id: ThreadId,
        message_id: MessageId,
    },
    /// No live session with that id, or nothing worth posting; nothing was sent.
    Dropped,
}

pub struct NotificationEmitter {
    store: SessionStore,
    transport: Arc<dyn ChatTransport>,
}

impl NotificationEmitter {
    pub fn new(store: SessionStore, transport: Arc<dyn ChatTransport>) -> Self {
        Self { store, transport }
    }

    /// Post an attention event. Any attention event ends the busy indicator;
    /// a permission prompt is remembered so its tool result can be reported.
    pub async fn emit(&self, session_id: &str, event: &AttentionEvent) -> Result<EmitOutcome> {
        let resolved = self
            .store
            .with_lock(|registry| {
                let Some(session) = registry.find_by_session_id(session_id) else {
                    return Ok::<_, anyhow::Error>(None);
                };
                if session.is_closed() {
                    return Ok(None);
                }
                let thread_id = session.thread_id;
                registry.update(session_id, |session| {
                    session.busy = false;
                    if event.marks_idle() {
                        session.touch(SessionStatus::Idle);
                    }
                    if event.awaits_tool_result() {
                        session.permission_shown_at = Some(Utc::now());
                    }
                });
                Ok(Some(thread_id))
            })
            .context("failed to resolve session thread")?;

        let Some(thread_id) = resolved else {
            tracing::warn!(
                target = "pane_relay::notifier",
                session_id = %session_id,
                "no live session registered; dropping notification"
            );
            return Ok(EmitOutcome::Dropped);
        };

        self.deliver(session_id, thread_id, format_event(session_id, event))
            .await
    }

    /// Report a tool result, but only for a tool whose permission prompt was
    /// posted to the thread. Auto-approved tools stay quiet.
    pub async fn follow_up(&self, session_id: &str, outcome: &ToolOutcome) -> Result<EmitOutcome> {
        let now = Utc::now();
        let resolved = self
            .store
            .with_lock(|registry| {
                let Some(session) = registry.find_by_session_id(session_id) else {
                    return Ok::<_, anyhow::Error>(None);
                };
                if session.is_closed() {
                    return Ok(None);
                }
                let thread_id = session.thread_id;
                let Some(shown_at) = session.permission_shown_at else {
                    return Ok(None);
                };
                registry.update(session_id, |session| session.permission_shown_at = None);
                let recent = (now - shown_at).num_seconds() < PERMISSION_FOLLOW_UP_SECS;
                Ok(recent.then_some(thread_id))
            })
            .context("failed to resolve session thread")?;

        let Some(thread_id) = resolved else {
            tracing::debug!(
                target = "pane_relay::notifier",
                session_id = %session_id,
                "no pending permission prompt; tool result not reported"
            );
            return Ok(EmitOutcome::Dropped);
        };
        match format_tool_outcome(outcome) {
            Some(message) => self.deliver(session_id, thread_id, message).await,
            None => Ok(EmitOutcome::Dropped),
        }
    }

    async fn deliver(
        &self,
        session_id: &str,
        thread_id: ThreadId,
        message: OutboundMessage,
    ) -> Result<EmitOutcome> {
        let message_id = self
            .transport
            .send_message(thread_id, &message)
            .await
            .with_context(|| format!("failed to deliver notification to thread {thread_id}"))?;
        tracing::info!(
            target = "pane_relay::notifier",
            session_id = %session_id,
            thread_id = thread_id,
            message_id = message_id,
            buttons = message.button_count(),
            "notification sent"
        );
        Ok(EmitOutcome::Sent {
            thread_id,
            message_id,
        })
    }
}

pub fn format_event(session_id: &str, event: &AttentionEvent) -> OutboundMessage {
    match event {
        AttentionEvent::Permission {
            tool_name,
            tool_input,
        } => OutboundMessage {
            text: format_permission(tool_name, tool_input),
            buttons: permission_buttons(session_id),
        },
        AttentionEvent::Question { questions } => format_questions(session_id, questions),
        AttentionEvent::Notification {
            kind,
            title,
            message,
        } => OutboundMessage::text(format_notification(kind, title.as_deref(), message.as_deref())),
        AttentionEvent::Stop {
            may_need_input,
            last_message,
        } => {
            let mut text = "\u{1F6D1} <b>Stopped</b>".to_string();
            if *may_need_input {
                text.push_str(" (may need input)");
            }
            if let Some(body) = last_message.as_deref().filter(|b| !b.trim().is_empty()) {
                text.push_str(&format!(
                    "\n<i>{}</i>",
                    html_escape(&truncate_with_ellipsis(body, STOP_BODY_LIMIT))
                ));
            }
            OutboundMessage::text(text)
        }
    }
}

/// `None` for an answered question; the selection was already confirmed.
pub fn format_tool_outcome(outcome: &ToolOutcome) -> Option<OutboundMessage> {
    match outcome {
        ToolOutcome::Completed { tool_name, .. } if tool_name == ASK_USER_QUESTION_TOOL => None,
        ToolOutcome::Completed {
            tool_name,
            tool_input,
        } => {
            let field = |name: &str| {
                tool_input
                    .get(name)
                    .and_then(Value::as_str)
                    .filter(|s| !s.is_empty())
            };
            let mut text = format!("\u{2705} <b>Allowed</b>: {}", html_escape(tool_name));
            match tool_name.as_str() {
                "Bash" => {
                    if let Some(desc) = field("description") {
                        text.push_str(&format!("\n<i>{}</i>", html_escape(desc)));
                    } else if let Some(cmd) = field("command") {
                        text.push_str(&format!(
                            "\n<code>{}</code>",
                            html_escape(&truncate_with_ellipsis(cmd, TOOL_COMMAND_LIMIT))
                        ));
                    }
                }
                "Write" | "Edit" => {
                    if let Some(path) = field("file_path") {
                        text.push_str(&format!("\n<code>{}</code>", html_escape(path)));
                    }
                }
                _ => {}
            }
            Some(OutboundMessage::text(text))
        }
        ToolOutcome::Failed { tool_name, error } => {
            let mut text = format!("\u{274C} <b>Denied/Failed</b>: {}", html_escape(tool_name));
            if let Some(error) = error {
                text.push_str(&format!(
                    "\n<i>{}</i>",
                    html_escape(&truncate_with_ellipsis(error, TOOL_ERROR_LIMIT))
                ));
            }
            Some(OutboundMessage::text(text))
        }
    }
}

fn format_permission(tool_name: &str, tool_input: &Value) -> String {
    let field = |name: &str| {
        tool_input
            .get(name)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
    };
    let mut lines = vec![
        "\u{1F510} <b>Permission needed</b>".to_string(),
        format!("\nTool: <b>{}</b>", html_escape(tool_name)),
    ];
    match tool_name {
        "Bash" => {
            if let Some(desc) = field("description") {
                lines.push(format!("<i>{}</i>", html_escape(desc)));
            }
            if let Some(cmd) = field("command") {
                lines.push(format!(
                    "<code>{}</code>",
                    html_escape(&truncate_with_ellipsis(cmd, DETAIL_LIMIT))
                ));
            }
        }
        "Write" | "Edit" | "Read" => {
            if let Some(path) = field("file_path") {
                lines.push(format!("File: <code>{}</code>", html_escape(path)));
            }
        }
        "WebFetch" => {
            if let Some(url) = field("url") {
                lines.push(format!("URL: <code>{}</code>", html_escape(url)));
            }
        }
        _ => {
            if !tool_input.is_null() {
                let details =
                    serde_json::to_string_pretty(tool_input).unwrap_or_else(|_| tool_input.to_string());
                lines.push(format!(
                    "<code>{}</code>",
                    html_escape(&truncate_with_ellipsis(&details, DETAIL_LIMIT))
                ));
            }
        }
    }
    lines.join("\n")
}

/// Only the first question gets buttons; the assistant's menu answers one
/// question at a time.
fn format_questions(session_id: &str, questions: &[Question]) -> OutboundMessage {
    if questions.is_empty() {
        return OutboundMessage::text("\u{2753} Question (no details)");
    }
    let mut lines = vec!["\u{2753} <b>Question for you</b>".to_string()];
    for question in questions {
        lines.push(format!("\n<b>{}</b>", html_escape(&question.question)));
        if question.multi_select {
            lines.push("<i>(multiple selections allowed)</i>".to_string());
        }
        for option in &question.options {
            match option.description.as_deref().filter(|d| !d.is_empty()) {
                Some(desc) => lines.push(format!(
                    "  \u{2022} <b>{}</b>: <i>{}</i>",
                    html_escape(&option.label),
                    html_escape(desc)
                )),
                None => lines.push(format!("  \u{2022} <b>{}</b>", html_escape(&option.label))),
            }
        }
    }
    lines.push("\n<i>Or type a custom answer below</i>".to_string());

    let labels: Vec<String> = questions[0]
        .options
        .iter()
        .map(|o| o.label.clone())
        .collect();
    let buttons = if labels.is_empty() {
        Vec::new()
    } else {
        choice_buttons(session_id, &labels)
    };
    OutboundMessage {
        text: lines.join("\n"),
        buttons,
    }
}

fn format_notification(kind: &str, title: Option<&str>, message: Option<&str>) -> String {
    let (emoji, label) = match kind {
        "permission_prompt" => ("\u{1F510}", "Permission needed"),
        "idle_prompt" => ("\u{1F4A4}", "Idle / waiting for input"),
        "elicitation_dialog" => ("\u{2753}", "Question for you"),
        "auth_success" => ("\u{1F511}", "Auth success"),
        "compact" | "context_compaction" | "compacting" => ("\u{1F4E6}", "Compacting context"),
        "" => ("\u{1F514}", "Notification"),
        other => ("\u{1F514}", other),
    };
    let mut text = format!("{emoji} <b>{}</b>", html_escape(label));
    if let Some(title) = title.filter(|t| *t != label) {
        text.push_str(&format!("\n<b>{}</b>", html_escape(title)));
    }
    if let Some(message) = message {
        text.push_str(&format!(
            "\n<i>{}</i>",
            html_escape(&truncate_with_ellipsis(message, DETAIL_LIMIT))
        ));
    }
    text
}
