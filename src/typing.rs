//! Keeps the chat's "typing" indicator alive for sessions working on a reply.
//!
//! The router flags a session busy after typing into its pane; the next
//! attention event from that session clears the flag. Telegram drops the
//! indicator after about five seconds, so it is re-sent on a shorter period.

use std::{sync::Arc, time::Duration};

use tokio::{sync::watch, time::MissedTickBehavior};

use crate::{store::SessionStore, transport::ChatTransport, types::ThreadId};

pub const TYPING_INTERVAL: Duration = Duration::from_secs(4);

pub struct TypingIndicator {
    store: SessionStore,
    transport: Arc<dyn ChatTransport>,
    interval: Duration,
}

impl TypingIndicator {
    pub fn new(store: SessionStore, transport: Arc<dyn ChatTransport>) -> Self {
        Self {
            store,
            transport,
            interval: TYPING_INTERVAL,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = ticker.tick() => {
                    self.pulse().await;
                }
                _ = shutdown.changed() => break,
            }
        }
        tracing::debug!(target = "pane_relay::typing", "typing indicator stopped");
    }

    /// Send one round of indicators. Returns the threads that were pinged.
    pub async fn pulse(&self) -> Vec<ThreadId> {
        // Read-only and unlocked: the registry is only ever replaced by rename.
        let registry = match self.store.load() {
            Ok(registry) => registry,
            Err(error) => {
                tracing::debug!(
                    target = "pane_relay::typing",
                    error = %error,
                    "registry unreadable; skipping typing round"
                );
                return Vec::new();
            }
        };
        let busy: Vec<ThreadId> = registry
            .iter()
            .filter(|s| s.busy && !s.is_closed())
            .map(|s| s.thread_id)
            .collect();
        for &thread_id in &busy {
            if let Err(error) = self.transport.send_typing(thread_id).await {
                tracing::debug!(
                    target = "pane_relay::typing",
                    thread_id = thread_id,
                    error = %error,
                    "failed to send typing indicator"
                );
            }
        }
        busy
    }
}
