//! Session start and end handling.
//!
//! Platform side effects (topic creation, topic closing) happen while the
//! registry lock is held and before the mutation is committed, so a failed
//! side effect never leaves a registry entry pointing at a thread that does
//! not exist.

use std::{path::Path, sync::Arc};

use anyhow::{Context, Result};

use crate::{
    helpers::{html_escape, truncate_with_ellipsis},
    store::SessionStore,
    transport::ChatTransport,
    types::{OutboundMessage, Session, SessionStatus, ThreadId},
};

const SHORT_ID_LEN: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    Registered(Session),
    /// A live entry already existed; nothing was created.
    AlreadyRegistered(Session),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndOutcome {
    Removed(Session),
    /// No entry for this session; the registry was not touched.
    Unknown,
    /// Closing the thread failed. The entry is kept as `closed` so the router
    /// refuses it, and a later end event retries.
    ArchiveFailed(Session),
}

pub struct SessionRegistrar {
    store: SessionStore,
    transport: Arc<dyn ChatTransport>,
    host: String,
}

impl SessionRegistrar {
    pub fn new(store: SessionStore, transport: Arc<dyn ChatTransport>) -> Self {
        let host = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .map(|h| h.split('.').next().unwrap_or_default().to_string())
            .unwrap_or_default();
        Self {
            store,
            transport,
            host,
        }
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub async fn on_start(
        &self,
        session_id: &str,
        pane_address: &str,
        cwd: Option<String>,
    ) -> Result<StartOutcome> {
        let mut guard = self.store.lock().context("failed to lock session registry")?;

        let previous = guard.registry().find_by_session_id(session_id).cloned();
        if let Some(existing) = &previous {
            if !existing.is_closed() {
                tracing::debug!(
                    target = "pane_relay::registrar",
                    session_id = %session_id,
                    thread_id = existing.thread_id,
                    "session already registered"
                );
                return Ok(StartOutcome::AlreadyRegistered(existing.clone()));
            }
        }

        let title = thread_title(&self.host, cwd.as_deref(), session_id);
        let thread_id = self
            .transport
            .create_thread(&title)
            .await
            .with_context(|| format!("failed to create thread for session {session_id}"))?;

        let session = Session::new(session_id, thread_id, pane_address, cwd);
        if let Err(error) = guard.registry_mut().insert(session.clone()) {
            self.close_orphan(thread_id).await;
            return Err(error).context("failed to record session");
        }
        if let Err(error) = guard.commit() {
            self.close_orphan(thread_id).await;
            return Err(error).context("failed to write session registry");
        }

        tracing::info!(
            target = "pane_relay::registrar",
            session_id = %session_id,
            thread_id = thread_id,
            pane = %pane_address,
            "session registered"
        );

        if let Some(stale) = previous {
            // A closed leftover from an earlier run whose thread never closed.
            if let Err(error) = self.transport.archive_thread(stale.thread_id).await {
                tracing::debug!(
                    target = "pane_relay::registrar",
                    thread_id = stale.thread_id,
                    error = %error,
                    "stale thread could not be closed"
                );
            }
        }

        let started = started_message(&session);
        if let Err(error) = self.transport.send_message(thread_id, &started).await {
            tracing::warn!(
                target = "pane_relay::registrar",
                session_id = %session_id,
                error = %error,
                "failed to post start message"
            );
        }

        Ok(StartOutcome::Registered(session))
    }

    pub async fn on_end(&self, session_id: &str) -> Result<EndOutcome> {
        // Unlocked read: the farewell is best-effort and must not extend the
        // critical section.
        if let Some(session) = self
            .store
            .load()
            .context("failed to read session registry")?
            .find_by_session_id(session_id)
            .filter(|s| !s.is_closed())
        {
            let ended = OutboundMessage::text("\u{1F534} <b>Session ended</b>");
            if let Err(error) = self.transport.send_message(session.thread_id, &ended).await {
                tracing::debug!(
                    target = "pane_relay::registrar",
                    session_id = %session_id,
                    error = %error,
                    "failed to post end message"
                );
            }
        }

        let mut guard = self.store.lock().context("failed to lock session registry")?;
        let Some(session) = guard.registry().find_by_session_id(session_id).cloned() else {
            tracing::debug!(
                target = "pane_relay::registrar",
                session_id = %session_id,
                "end for unknown session"
            );
            return Ok(EndOutcome::Unknown);
        };

        match self.transport.archive_thread(session.thread_id).await {
            Ok(()) => {}
            Err(error) if error.is_thread_gone() => {
                tracing::debug!(
                    target = "pane_relay::registrar",
                    thread_id = session.thread_id,
                    error = %error,
                    "thread already closed"
                );
            }
            Err(error) => {
                tracing::warn!(
                    target = "pane_relay::registrar",
                    session_id = %session_id,
                    thread_id = session.thread_id,
                    error = %error,
                    "failed to close thread; keeping entry as closed"
                );
                let closed = guard
                    .registry_mut()
                    .touch(session_id, SessionStatus::Closed)
                    .cloned()
                    .unwrap_or(session);
                guard.commit().context("failed to write session registry")?;
                return Ok(EndOutcome::ArchiveFailed(closed));
            }
        }

        guard.registry_mut().remove(session_id);
        guard.commit().context("failed to write session registry")?;
        tracing::info!(
            target = "pane_relay::registrar",
            session_id = %session_id,
            thread_id = session.thread_id,
            "session removed"
        );
        Ok(EndOutcome::Removed(session))
    }

    /// Close a thread that no registry entry ended up referencing.
    async fn close_orphan(&self, thread_id: ThreadId) {
        if let Err(error) = self.transport.archive_thread(thread_id).await {
            tracing::warn!(
                target = "pane_relay::registrar",
                thread_id = thread_id,
                error = %error,
                "failed to close orphaned thread"
            );
        }
    }
}

pub fn short_id(session_id: &str) -> &str {
    match session_id.char_indices().nth(SHORT_ID_LEN) {
        Some((end, _)) => &session_id[..end],
        None => session_id,
    }
}

/// `<project> @ <host> [<short id>]`, with missing parts left out.
pub fn thread_title(host: &str, cwd: Option<&str>, session_id: &str) -> String {
    let project = cwd
        .map(Path::new)
        .and_then(Path::file_name)
        .and_then(|n| n.to_str())
        .filter(|n| !n.is_empty())
        .unwrap_or("session");
    let mut title = project.to_string();
    if !host.is_empty() {
        title.push_str(" @ ");
        title.push_str(host);
    }
    title.push_str(&format!(" [{}]", short_id(session_id)));
    truncate_with_ellipsis(&title, 128)
}

fn started_message(session: &Session) -> OutboundMessage {
    let mut text = format!(
        "\u{1F7E2} <b>Session started</b>\nPane: <code>{}</code>",
        html_escape(&session.pane_address)
    );
    if let Some(cwd) = &session.cwd {
        text.push_str(&format!("\nDirectory: <code>{}</code>", html_escape(cwd)));
    }
    text.push_str("\n\nReplies in this topic are typed into the pane.");
    OutboundMessage::text(text)
}
