//! Error types for the registry, the chat transport and pane injection.

use std::{path::PathBuf, time::Duration};

use thiserror::Error;

use crate::types::ThreadId;

/// Errors raised by the session registry.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Filesystem failure while reading, locking or replacing the registry.
    #[error("registry I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The registry file exists but does not parse. It is never overwritten.
    #[error("registry file {path} is corrupt: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// Another process held the registry lock for longer than the allowed wait.
    #[error("timed out after {waited:?} waiting for registry lock {path}")]
    LockTimeout { path: PathBuf, waited: Duration },

    /// Two live sessions would share one chat thread.
    #[error("thread {thread_id} is already bound to live session {existing}")]
    DuplicateThread { thread_id: ThreadId, existing: String },

    #[error("failed to serialize registry: {0}")]
    Serialize(#[source] serde_json::Error),
}

impl StoreError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Errors raised by the chat transport.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The Bot API answered with `ok: false`.
    #[error("{method} failed ({code}): {description}")]
    Api {
        method: String,
        code: u16,
        description: String,
    },

    /// The API answered `ok: true` without a field the bridge needs.
    #[error("{method} response is missing `{field}`")]
    MissingField { method: String, field: String },
}

impl TransportError {
    /// Transient failures worth another attempt after a backoff.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Http(error) => error.is_connect() || error.is_timeout() || error.is_request(),
            Self::Api { code, .. } => *code == 429 || (500..=599).contains(code),
            Self::MissingField { .. } => false,
        }
    }

    /// The thread was already closed or deleted on the platform side.
    pub fn is_thread_gone(&self) -> bool {
        match self {
            Self::Api { description, .. } => {
                description.contains("TOPIC_NOT_MODIFIED")
                    || description.contains("TOPIC_ID_INVALID")
                    || description.contains("thread not found")
            }
            _ => false,
        }
    }
}

/// Errors raised while typing into a terminal pane.
#[derive(Error, Debug)]
pub enum InjectError {
    #[error("failed to run tmux: {0}")]
    Spawn(#[from] std::io::Error),

    /// tmux refused the command, typically because the pane is gone.
    #[error("tmux rejected keys for pane {pane}: {stderr}")]
    Rejected { pane: String, stderr: String },

    #[error("tmux timed out writing to pane {pane}")]
    Timeout { pane: String },
}

#[cfg(test)]
mod tests {
    use super::{StoreError, TransportError};

    #[test]
    fn api_errors_classify_retryable_statuses() {
        let api = |code| TransportError::Api {
            method: "getUpdates".into(),
            code,
            description: "x".into(),
        };
        assert!(api(502).is_retryable());
        assert!(api(429).is_retryable());
        assert!(!api(400).is_retryable());
        assert!(!api(403).is_retryable());
    }

    #[test]
    fn closed_topic_counts_as_gone() {
        let err = TransportError::Api {
            method: "closeForumTopic".into(),
            code: 400,
            description: "Bad Request: TOPIC_NOT_MODIFIED".into(),
        };
        assert!(err.is_thread_gone());
        assert!(!err.is_retryable());
    }

    #[test]
    fn duplicate_thread_message_names_both_sides() {
        let err = StoreError::DuplicateThread {
            thread_id: 7,
            existing: "abc".into(),
        };
        assert_eq!(
            err.to_string(),
            "thread 7 is already bound to live session abc"
        );
    }
}
