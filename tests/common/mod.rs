//! In-memory stand-ins for the chat platform and tmux.

#![allow(dead_code)]

use std::{
    sync::{
        atomic::{AtomicBool, AtomicI64, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use parking_lot::Mutex;

use pane_relay::{
    error::{InjectError, TransportError},
    inject::PaneInjector,
    prompt::KeySequence,
    store::SessionStore,
    transport::ChatTransport,
    types::{
        InboundEvent, InboundKind, InboundUpdate, MessageId, OutboundMessage, SenderIdentity,
        ThreadId, UpdateCursor,
    },
};

pub const USER: i64 = 7;
pub const CHAT: i64 = -100_500;

#[derive(Default)]
pub struct FakeTransport {
    next_thread: AtomicI64,
    next_message: AtomicI64,
    pub fail_create: AtomicBool,
    pub fail_archive: AtomicBool,
    pub fail_fetch: AtomicBool,
    pub created: Mutex<Vec<(ThreadId, String)>>,
    pub archived: Mutex<Vec<ThreadId>>,
    pub sent: Mutex<Vec<(ThreadId, OutboundMessage)>>,
    pub acked: Mutex<Vec<UpdateCursor>>,
    pub answers: Mutex<Vec<(String, String)>>,
    pub cleared: Mutex<Vec<MessageId>>,
    pub typing: Mutex<Vec<ThreadId>>,
    /// Unacknowledged updates; redelivered on every fetch until confirmed.
    pub pending: Mutex<Vec<InboundUpdate>>,
    pub fetches: AtomicI64,
    /// Runs inside `create_thread`, while the caller holds the registry lock.
    pub on_create: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl FakeTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            next_thread: AtomicI64::new(100),
            next_message: AtomicI64::new(1_000),
            ..Self::default()
        })
    }

    pub fn api_error(method: &str) -> TransportError {
        TransportError::Api {
            method: method.into(),
            code: 502,
            description: "Bad Gateway".into(),
        }
    }

    pub fn sent_texts(&self) -> Vec<String> {
        self.sent.lock().iter().map(|(_, m)| m.text.clone()).collect()
    }
}

#[async_trait]
impl ChatTransport for FakeTransport {
    async fn create_thread(&self, title: &str) -> Result<ThreadId, TransportError> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(Self::api_error("createForumTopic"));
        }
        // Widen the window between reading and committing the registry.
        tokio::time::sleep(Duration::from_millis(5)).await;
        if let Some(hook) = self.on_create.lock().take() {
            hook();
        }
        let id = self.next_thread.fetch_add(1, Ordering::SeqCst);
        self.created.lock().push((id, title.to_string()));
        Ok(id)
    }

    async fn archive_thread(&self, thread_id: ThreadId) -> Result<(), TransportError> {
        if self.fail_archive.load(Ordering::SeqCst) {
            return Err(Self::api_error("closeForumTopic"));
        }
        self.archived.lock().push(thread_id);
        Ok(())
    }

    async fn send_message(
        &self,
        thread_id: ThreadId,
        message: &OutboundMessage,
    ) -> Result<MessageId, TransportError> {
        self.sent.lock().push((thread_id, message.clone()));
        Ok(self.next_message.fetch_add(1, Ordering::SeqCst))
    }

    async fn fetch_updates(
        &self,
        cursor: Option<UpdateCursor>,
        _timeout: Duration,
    ) -> Result<Vec<InboundUpdate>, TransportError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if self.fail_fetch.load(Ordering::SeqCst) {
            return Err(Self::api_error("getUpdates"));
        }
        let batch: Vec<InboundUpdate> = self
            .pending
            .lock()
            .iter()
            .filter(|u| cursor.map_or(true, |c| u.next_cursor > c))
            .cloned()
            .collect();
        if batch.is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        Ok(batch)
    }

    async fn acknowledge(&self, cursor: UpdateCursor) -> Result<(), TransportError> {
        self.acked.lock().push(cursor);
        self.pending.lock().retain(|u| u.next_cursor > cursor);
        Ok(())
    }

    async fn answer_button(&self, tap_id: &str, text: &str) -> Result<(), TransportError> {
        self.answers.lock().push((tap_id.to_string(), text.to_string()));
        Ok(())
    }

    async fn clear_buttons(&self, message_id: MessageId) -> Result<(), TransportError> {
        self.cleared.lock().push(message_id);
        Ok(())
    }

    async fn send_typing(&self, thread_id: ThreadId) -> Result<(), TransportError> {
        self.typing.lock().push(thread_id);
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeInjector {
    pub fail: AtomicBool,
    pub writes: Mutex<Vec<(String, KeySequence)>>,
}

impl FakeInjector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl PaneInjector for FakeInjector {
    async fn write_keys(&self, pane: &str, keys: &KeySequence) -> Result<(), InjectError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(InjectError::Rejected {
                pane: pane.to_string(),
                stderr: "can't find pane".into(),
            });
        }
        self.writes.lock().push((pane.to_string(), keys.clone()));
        Ok(())
    }
}

pub fn store_in(dir: &tempfile::TempDir) -> SessionStore {
    SessionStore::new(dir.path().join("sessions.json"), Duration::from_secs(5))
}

pub fn text_from(user_id: i64, thread_id: Option<ThreadId>, text: &str) -> InboundEvent {
    InboundEvent {
        sender: SenderIdentity {
            user_id,
            chat_id: Some(CHAT),
        },
        thread_id,
        kind: InboundKind::Text {
            message_id: 1,
            text: text.to_string(),
        },
    }
}

pub fn tap_from(user_id: i64, thread_id: Option<ThreadId>, payload: &str) -> InboundEvent {
    InboundEvent {
        sender: SenderIdentity {
            user_id,
            chat_id: Some(CHAT),
        },
        thread_id,
        kind: InboundKind::Button {
            tap_id: "tap-1".into(),
            message_id: Some(55),
            data: payload.to_string(),
            label: None,
        },
    }
}
