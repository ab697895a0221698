//! Long-poll loop that turns chat replies into keystrokes.
//!
//! One cycle fetches a batch, then handles each update in order: authorize,
//! resolve the owning session, translate, inject, acknowledge. Shutdown is
//! observed only between cycles or while waiting on the network, never while
//! keys are being written.

use std::{
    sync::{Arc, LazyLock},
    time::Duration,
};

use rand::Rng;
use regex::Regex;
use tokio::sync::watch;

use crate::{
    error::StoreError,
    helpers::{html_escape, truncate_with_ellipsis},
    inject::PaneInjector,
    prompt::{ButtonAction, KeySequence},
    registrar::short_id,
    store::{Registry, SessionStore},
    transport::ChatTransport,
    types::{
        InboundEvent, InboundKind, InboundUpdate, MessageId, OutboundMessage, Session,
        SessionStatus, ThreadId, UpdateCursor, GENERAL_THREAD,
    },
};

const CONFIRM_TEXT_LIMIT: usize = 200;
const TAP_NOTICE_LIMIT: usize = 50;

static BRIDGE_COMMAND: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^/(tel_help|tel_sessions)(?:@\w+)?(?:\s|$)").expect("valid regex")
});

/// 1 s doubling up to 30 s, plus up to 250 ms of jitter.
pub fn reconnect_delay(attempt: u32) -> Duration {
    let base_ms = (1_000u64).saturating_mul(2u64.saturating_pow(attempt.saturating_sub(1)));
    let bounded = base_ms.min(30_000);
    let jitter = rand::thread_rng().gen_range(0..=250);
    Duration::from_millis(bounded + jitter)
}

/// The one human allowed to drive the panes, in the one group the bridge uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthorizedSender {
    pub user_id: i64,
    pub chat_id: i64,
}

impl AuthorizedSender {
    fn permits(&self, event: &InboundEvent) -> bool {
        event.sender.user_id == self.user_id
            && event.sender.chat_id.map_or(true, |chat| chat == self.chat_id)
    }
}

/// What happened to one inbound event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    Injected { session_id: String },
    InjectFailed { session_id: String },
    Command,
    Unauthorized,
    /// Unknown thread, closed session, stale or unreadable button.
    Discarded,
}

pub struct ReplyRouter {
    store: SessionStore,
    transport: Arc<dyn ChatTransport>,
    injector: Arc<dyn PaneInjector>,
    authorized: AuthorizedSender,
    poll_timeout: Duration,
    cursor: Option<UpdateCursor>,
    failures: u32,
}

impl ReplyRouter {
    pub fn new(
        store: SessionStore,
        transport: Arc<dyn ChatTransport>,
        injector: Arc<dyn PaneInjector>,
        authorized: AuthorizedSender,
        poll_timeout: Duration,
    ) -> Self {
        Self {
            store,
            transport,
            injector,
            authorized,
            poll_timeout,
            cursor: None,
            failures: 0,
        }
    }

    pub fn cursor(&self) -> Option<UpdateCursor> {
        self.cursor
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            target = "pane_relay::router",
            poll_timeout_secs = self.poll_timeout.as_secs(),
            "reply router started"
        );
        loop {
            if *shutdown.borrow() {
                break;
            }
            let fetched = tokio::select! {
                fetched = self.transport.fetch_updates(self.cursor, self.poll_timeout) => fetched,
                _ = shutdown.changed() => break,
            };
            let retry_after = match fetched {
                Ok(updates) => match self.process_batch(updates).await {
                    Ok(()) => {
                        self.failures = 0;
                        None
                    }
                    Err(error) => {
                        let delay = self.back_off();
                        tracing::error!(
                            target = "pane_relay::router",
                            error = %error,
                            attempt = self.failures,
                            delay_ms = delay.as_millis() as u64,
                            "session registry unavailable; retrying batch"
                        );
                        Some(delay)
                    }
                },
                Err(error) => {
                    let delay = self.back_off();
                    tracing::warn!(
                        target = "pane_relay::router",
                        error = %error,
                        attempt = self.failures,
                        delay_ms = delay.as_millis() as u64,
                        "fetching updates failed"
                    );
                    Some(delay)
                }
            };
            if let Some(delay) = retry_after {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown.changed() => break,
                }
            }
        }
        tracing::info!(target = "pane_relay::router", "reply router stopped");
    }

    /// Fetch and registry failures share one counter; any clean cycle resets it.
    fn back_off(&mut self) -> Duration {
        self.failures = self.failures.saturating_add(1);
        reconnect_delay(self.failures)
    }

    /// Handle a fetched batch in order. A registry failure stops the batch
    /// before its update is acknowledged, so it is fetched again next cycle.
    pub async fn process_batch(&mut self, updates: Vec<InboundUpdate>) -> Result<(), StoreError> {
        for update in updates {
            if let Some(event) = update.event {
                let disposition = self.handle_event(event).await?;
                tracing::debug!(
                    target = "pane_relay::router",
                    cursor = update.next_cursor,
                    disposition = ?disposition,
                    "update handled"
                );
            }
            self.advance(update.next_cursor).await;
        }
        Ok(())
    }

    async fn advance(&mut self, cursor: UpdateCursor) {
        self.cursor = Some(cursor);
        if let Err(error) = self.transport.acknowledge(cursor).await {
            // The next fetch passes the same cursor and confirms it anyway.
            tracing::debug!(
                target = "pane_relay::router",
                cursor = cursor,
                error = %error,
                "acknowledge failed"
            );
        }
    }

    pub async fn handle_event(&self, event: InboundEvent) -> Result<Disposition, StoreError> {
        if !self.authorized.permits(&event) {
            tracing::debug!(
                target = "pane_relay::router",
                user_id = event.sender.user_id,
                "ignoring event from unauthorized sender"
            );
            return Ok(Disposition::Unauthorized);
        }
        match event.kind {
            InboundKind::Text { text, .. } => self.handle_text(event.thread_id, text).await,
            InboundKind::Button {
                tap_id,
                message_id,
                data,
                label,
            } => {
                self.handle_button(event.thread_id, &tap_id, message_id, &data, label)
                    .await
            }
        }
    }

    async fn handle_text(
        &self,
        thread_id: Option<ThreadId>,
        text: String,
    ) -> Result<Disposition, StoreError> {
        if let Some(caps) = BRIDGE_COMMAND.captures(text.trim_start()) {
            let reply = match &caps[1] {
                "tel_sessions" => sessions_listing(&self.store.load()?),
                _ => help_text(),
            };
            self.post(thread_id.unwrap_or(GENERAL_THREAD), reply).await;
            return Ok(Disposition::Command);
        }

        let Some(thread_id) = thread_id else {
            tracing::debug!(
                target = "pane_relay::router",
                "ignoring text outside a session thread"
            );
            return Ok(Disposition::Discarded);
        };
        let Some(session) = self.claim_by_thread(thread_id).await? else {
            return Ok(Disposition::Discarded);
        };

        let keys = KeySequence::submit_text(&text);
        match self.injector.write_keys(&session.pane_address, &keys).await {
            Ok(()) => {
                tracing::info!(
                    target = "pane_relay::router",
                    session_id = %session.session_id,
                    chars = text.chars().count(),
                    "text injected"
                );
                self.mark_busy(&session).await;
                self.post(
                    thread_id,
                    format!(
                        "\u{2705} <code>{}</code>",
                        html_escape(&truncate_with_ellipsis(&text, CONFIRM_TEXT_LIMIT))
                    ),
                )
                .await;
                Ok(Disposition::Injected {
                    session_id: session.session_id,
                })
            }
            Err(error) => {
                self.report_inject_failure(&session, thread_id, &error).await;
                Ok(Disposition::InjectFailed {
                    session_id: session.session_id,
                })
            }
        }
    }

    async fn handle_button(
        &self,
        thread_id: Option<ThreadId>,
        tap_id: &str,
        message_id: Option<MessageId>,
        data: &str,
        label: Option<String>,
    ) -> Result<Disposition, StoreError> {
        let decoded = match ButtonAction::decode(data) {
            Ok(decoded) => decoded,
            Err(error) => {
                tracing::warn!(
                    target = "pane_relay::router",
                    payload = %data,
                    error = %error,
                    "unreadable button payload"
                );
                self.answer(tap_id, "Unknown action").await;
                return Ok(Disposition::Discarded);
            }
        };

        let session = match thread_id {
            Some(thread_id) => self.claim_by_thread(thread_id).await?,
            None => match decoded.session_id.as_deref() {
                Some(session_id) => self.claim_by_session(session_id).await?,
                None => None,
            },
        };
        let Some(session) = session else {
            self.answer(tap_id, "Session is no longer active").await;
            return Ok(Disposition::Discarded);
        };
        if let Some(owner) = decoded.session_id.as_deref() {
            if owner != session.session_id {
                tracing::warn!(
                    target = "pane_relay::router",
                    thread_id = session.thread_id,
                    prompt_session = %owner,
                    live_session = %session.session_id,
                    "button belongs to an earlier session"
                );
                self.answer(tap_id, "This prompt has expired").await;
                if let Some(message_id) = message_id {
                    self.clear(message_id).await;
                }
                return Ok(Disposition::Discarded);
            }
        }

        let keys = decoded.action.keys();
        let label = label.unwrap_or_else(|| decoded.action.describe());
        match self.injector.write_keys(&session.pane_address, &keys).await {
            Ok(()) => {
                tracing::info!(
                    target = "pane_relay::router",
                    session_id = %session.session_id,
                    kind = ?decoded.action.kind(),
                    label = %label,
                    "selection injected"
                );
                self.mark_busy(&session).await;
                self.answer(
                    tap_id,
                    &format!("Selected: {}", truncate_with_ellipsis(&label, TAP_NOTICE_LIMIT)),
                )
                .await;
                if let Some(message_id) = message_id {
                    self.clear(message_id).await;
                }
                self.post(
                    session.thread_id,
                    format!(
                        "\u{2705} Selected: <code>{}</code>",
                        html_escape(&truncate_with_ellipsis(&label, CONFIRM_TEXT_LIMIT))
                    ),
                )
                .await;
                Ok(Disposition::Injected {
                    session_id: session.session_id,
                })
            }
            Err(error) => {
                self.answer(tap_id, "Failed to send").await;
                self.report_inject_failure(&session, session.thread_id, &error)
                    .await;
                Ok(Disposition::InjectFailed {
                    session_id: session.session_id,
                })
            }
        }
    }

    async fn claim_by_thread(&self, thread_id: ThreadId) -> Result<Option<Session>, StoreError> {
        let session = self
            .claim(move |registry| registry.find_by_thread_id(thread_id).cloned())
            .await?;
        if session.is_none() {
            tracing::warn!(
                target = "pane_relay::router",
                thread_id = thread_id,
                "no live session for thread"
            );
        }
        Ok(session)
    }

    async fn claim_by_session(&self, session_id: &str) -> Result<Option<Session>, StoreError> {
        let id = session_id.to_string();
        let session = self
            .claim(move |registry| registry.find_by_session_id(&id).cloned())
            .await?;
        if session.is_none() {
            tracing::warn!(
                target = "pane_relay::router",
                session_id = %session_id,
                "no live session for button"
            );
        }
        Ok(session)
    }

    /// Resolve a session and mark it active in one critical section. Closed
    /// sessions resolve to `None`; an unknown key leaves the registry as it was.
    async fn claim<F>(&self, find: F) -> Result<Option<Session>, StoreError>
    where
        F: FnOnce(&Registry) -> Option<Session> + Send + 'static,
    {
        let store = self.store.clone();
        let claimed = tokio::task::spawn_blocking(move || {
            store.with_lock(|registry| {
                let Some(found) = find(registry) else {
                    return Ok::<_, StoreError>(None);
                };
                if found.is_closed() {
                    return Ok(None);
                }
                Ok(registry
                    .touch(&found.session_id, SessionStatus::Active)
                    .cloned())
            })
        })
        .await;
        match claimed {
            Ok(result) => result,
            Err(join_error) => Err(StoreError::io(
                self.store.path(),
                std::io::Error::other(join_error),
            )),
        }
    }

    /// Flag the session as working on a reply and show the typing indicator
    /// right away. The keys are already in the pane, so a registry failure
    /// here is logged rather than retried.
    async fn mark_busy(&self, session: &Session) {
        let store = self.store.clone();
        let session_id = session.session_id.clone();
        let marked = tokio::task::spawn_blocking(move || {
            store.with_lock(|registry| {
                registry.update(&session_id, |s| s.busy = true);
                Ok::<_, StoreError>(())
            })
        })
        .await;
        match marked {
            Ok(Ok(())) => {}
            Ok(Err(error)) => tracing::warn!(
                target = "pane_relay::router",
                session_id = %session.session_id,
                error = %error,
                "failed to mark session busy"
            ),
            Err(error) => tracing::warn!(
                target = "pane_relay::router",
                session_id = %session.session_id,
                error = %error,
                "busy marker task failed"
            ),
        }
        if let Err(error) = self.transport.send_typing(session.thread_id).await {
            tracing::debug!(
                target = "pane_relay::router",
                thread_id = session.thread_id,
                error = %error,
                "failed to send typing indicator"
            );
        }
    }

    async fn report_inject_failure(
        &self,
        session: &Session,
        thread_id: ThreadId,
        error: &crate::error::InjectError,
    ) {
        tracing::warn!(
            target = "pane_relay::router",
            session_id = %session.session_id,
            pane = %session.pane_address,
            error = %error,
            "injection failed; dropping reply"
        );
        self.post(
            thread_id,
            "\u{274C} Failed to send. Is the pane still open?".to_string(),
        )
        .await;
    }

    async fn post(&self, thread_id: ThreadId, text: String) {
        if let Err(error) = self
            .transport
            .send_message(thread_id, &OutboundMessage::text(text))
            .await
        {
            tracing::warn!(
                target = "pane_relay::router",
                thread_id = thread_id,
                error = %error,
                "failed to post reply"
            );
        }
    }

    async fn answer(&self, tap_id: &str, text: &str) {
        if let Err(error) = self.transport.answer_button(tap_id, text).await {
            tracing::debug!(
                target = "pane_relay::router",
                error = %error,
                "failed to answer button tap"
            );
        }
    }

    async fn clear(&self, message_id: MessageId) {
        if let Err(error) = self.transport.clear_buttons(message_id).await {
            tracing::debug!(
                target = "pane_relay::router",
                message_id = message_id,
                error = %error,
                "failed to clear buttons"
            );
        }
    }
}

fn help_text() -> String {
    [
        "<b>pane-relay</b>",
        "",
        "Each assistant session has its own topic. Text sent in a topic is typed",
        "into that session's pane and submitted; buttons answer the prompt they",
        "were sent with.",
        "",
        "<b>Bridge commands:</b>",
        "/tel_sessions - list registered sessions",
        "/tel_help - show this help",
        "",
        "Any other /command is passed through to the assistant.",
    ]
    .join("\n")
}

fn sessions_listing(registry: &Registry) -> String {
    if registry.is_empty() {
        return "No sessions registered.".to_string();
    }
    let mut lines = vec![format!("<b>Sessions ({})</b>", registry.len())];
    for session in registry.iter() {
        let marker = match session.status {
            SessionStatus::Active => "\u{1F7E2}",
            SessionStatus::Idle => "\u{1F4A4}",
            SessionStatus::Closed => "\u{26AB}",
        };
        let mut line = format!(
            "{marker} <code>{}</code> {} (pane {}, topic {})",
            html_escape(short_id(&session.session_id)),
            session.status.as_str(),
            html_escape(&session.pane_address),
            session.thread_id
        );
        if let Some(cwd) = &session.cwd {
            line.push_str(&format!("\n    {}", html_escape(cwd)));
        }
        lines.push(line);
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::{reconnect_delay, AuthorizedSender, BRIDGE_COMMAND};
    use crate::types::{InboundEvent, InboundKind, SenderIdentity};

    #[test]
    fn backoff_with_jitter_stays_bounded() {
        let d1 = reconnect_delay(1);
        let d10 = reconnect_delay(10);
        assert!(d1.as_millis() >= 1000 && d1.as_millis() <= 1250);
        assert!(d10.as_millis() >= 30_000 && d10.as_millis() <= 30_250);
    }

    #[test]
    fn bridge_commands_match_only_their_own_names() {
        assert!(BRIDGE_COMMAND.is_match("/tel_help"));
        assert!(BRIDGE_COMMAND.is_match("/tel_sessions@relay_bot"));
        assert!(BRIDGE_COMMAND.is_match("/tel_sessions now"));
        assert!(!BRIDGE_COMMAND.is_match("/compact"));
        assert!(!BRIDGE_COMMAND.is_match("/tel_helpme"));
        assert!(!BRIDGE_COMMAND.is_match("please /tel_help"));
    }

    #[test]
    fn authorization_needs_user_and_chat() {
        let auth = AuthorizedSender {
            user_id: 7,
            chat_id: -100,
        };
        let event = |user_id, chat_id| InboundEvent {
            sender: SenderIdentity { user_id, chat_id },
            thread_id: Some(5),
            kind: InboundKind::Text {
                message_id: 1,
                text: "hi".into(),
            },
        };
        assert!(auth.permits(&event(7, Some(-100))));
        assert!(auth.permits(&event(7, None)));
        assert!(!auth.permits(&event(8, Some(-100))));
        assert!(!auth.permits(&event(7, Some(-200))));
    }
}
