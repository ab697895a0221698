use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Forum topic identifier (`message_thread_id` on the Telegram side).
pub type ThreadId = i64;

/// The group's General thread, used for bridge output not tied to a session.
pub const GENERAL_THREAD: ThreadId = 1;

/// Identifier of a message inside the group chat.
pub type MessageId = i64;

/// Opaque position in the inbound update stream; the next update to fetch.
pub type UpdateCursor = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Idle,
    Closed,
}

impl SessionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Active => "active",
            SessionStatus::Idle => "idle",
            SessionStatus::Closed => "closed",
        }
    }
}

/// One live assistant session and the chat thread it is bridged to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    pub thread_id: ThreadId,
    pub pane_address: String,
    pub status: SessionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    /// A reply was typed into the pane and the assistant has not asked for
    /// attention since.
    #[serde(default, skip_serializing_if = "is_false")]
    pub busy: bool,
    /// When a permission prompt was last posted and its tool result has not
    /// been reported yet.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permission_shown_at: Option<DateTime<Utc>>,
}

fn is_false(value: &bool) -> bool {
    !value
}

impl Session {
    pub fn new(
        session_id: impl Into<String>,
        thread_id: ThreadId,
        pane_address: impl Into<String>,
        cwd: Option<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            session_id: session_id.into(),
            thread_id,
            pane_address: pane_address.into(),
            status: SessionStatus::Active,
            cwd,
            created_at: now,
            last_activity_at: now,
            busy: false,
            permission_shown_at: None,
        }
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.status, SessionStatus::Closed)
    }

    pub fn touch(&mut self, status: SessionStatus) {
        self.status = status;
        self.last_activity_at = Utc::now();
    }
}

/// Who sent an inbound event, used for the authorization check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SenderIdentity {
    pub user_id: i64,
    /// `None` for button taps on messages the transport could not attribute to a chat.
    pub chat_id: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundKind {
    Text {
        message_id: MessageId,
        text: String,
    },
    Button {
        tap_id: String,
        /// Message that carried the tapped keyboard.
        message_id: Option<MessageId>,
        /// Raw button payload, decoded by the prompt policy.
        data: String,
        /// Label of the tapped button when the transport can recover it.
        label: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundEvent {
    pub sender: SenderIdentity,
    pub thread_id: Option<ThreadId>,
    pub kind: InboundKind,
}

/// One fetched update. `event` is `None` for update types the bridge ignores,
/// but the cursor still has to advance past them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundUpdate {
    pub next_cursor: UpdateCursor,
    pub event: Option<InboundEvent>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundButton {
    pub label: String,
    pub payload: String,
}

/// An HTML-formatted chat message with an optional inline keyboard.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutboundMessage {
    pub text: String,
    pub buttons: Vec<Vec<OutboundButton>>,
}

impl OutboundMessage {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            buttons: Vec::new(),
        }
    }

    pub fn button_count(&self) -> usize {
        self.buttons.iter().map(Vec::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::{Session, SessionStatus};

    #[test]
    fn new_session_starts_active() {
        let session = Session::new("s1", 42, "%3", None);
        assert_eq!(session.status, SessionStatus::Active);
        assert_eq!(session.created_at, session.last_activity_at);
        assert!(!session.is_closed());
    }

    #[test]
    fn transient_flags_are_omitted_until_set() {
        let mut session = Session::new("s1", 42, "%3", None);
        let json = serde_json::to_value(&session).unwrap();
        assert!(json.get("busy").is_none());
        assert!(json.get("permission_shown_at").is_none());

        session.busy = true;
        let back: Session = serde_json::from_value(serde_json::to_value(&session).unwrap()).unwrap();
        assert!(back.busy);
    }

    #[test]
    fn status_serializes_snake_case() {
        let json = serde_json::to_string(&SessionStatus::Idle).unwrap();
        assert_eq!(json, "\"idle\"");
    }
}
