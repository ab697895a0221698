//! Prompt-shape policy shared by the notifier and the router.
//!
//! The router runs in a different process from the notifier and keeps no record
//! of what was asked. Each button therefore carries its own [`ButtonAction`],
//! encoded into the button payload together with the owning session id, and
//! the router turns that action straight into a [`KeySequence`].
//!
//! The assistant's select menus accept number keys for the options they
//! number, and arrow navigation for the built-in entries listed after them.

use thiserror::Error;

use crate::types::OutboundButton;

/// The assistant offers at most four defined options per question.
pub const MAX_DEFINED_OPTIONS: usize = 4;

/// Telegram rejects `callback_data` longer than this.
pub const MAX_PAYLOAD_BYTES: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptKind {
    Permission,
    DefinedChoice,
    OpenEnded,
}

/// Permission menu entries in terminal order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionChoice {
    Yes,
    AlwaysAllow,
    No,
}

impl PermissionChoice {
    pub const ALL: [PermissionChoice; 3] = [
        PermissionChoice::Yes,
        PermissionChoice::AlwaysAllow,
        PermissionChoice::No,
    ];

    pub fn index(self) -> usize {
        match self {
            PermissionChoice::Yes => 0,
            PermissionChoice::AlwaysAllow => 1,
            PermissionChoice::No => 2,
        }
    }

    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    pub fn label(self) -> &'static str {
        match self {
            PermissionChoice::Yes => "\u{2705} Yes",
            PermissionChoice::AlwaysAllow => "\u{1F513} Always allow",
            PermissionChoice::No => "\u{274C} No",
        }
    }
}

/// Built-in entries the assistant appends after the defined options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Affordance {
    /// Type a custom answer.
    Other,
    /// Discuss the question instead of answering.
    Chat,
}

impl Affordance {
    fn offset(self) -> usize {
        match self {
            Affordance::Other => 0,
            Affordance::Chat => 1,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Affordance::Other => "\u{270F}\u{FE0F} Other",
            Affordance::Chat => "\u{1F4AC} Chat about it",
        }
    }
}

/// What a button does, carried end-to-end in its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ButtonAction {
    Permission(PermissionChoice),
    Choice { index: usize, defined: usize },
    Navigate { affordance: Affordance, defined: usize },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PayloadError {
    #[error("empty button payload")]
    Empty,
    #[error("unknown button tag `{0}`")]
    UnknownTag(String),
    #[error("malformed button payload `{0}`")]
    Malformed(String),
    #[error("option {index} out of range for {defined} defined options")]
    OutOfRange { index: usize, defined: usize },
}

/// A decoded button payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedPayload {
    pub action: ButtonAction,
    /// Correlation token naming the session the prompt was sent for.
    pub session_id: Option<String>,
}

impl ButtonAction {
    pub fn kind(&self) -> PromptKind {
        match self {
            ButtonAction::Permission(_) => PromptKind::Permission,
            ButtonAction::Choice { .. } => PromptKind::DefinedChoice,
            ButtonAction::Navigate { .. } => PromptKind::OpenEnded,
        }
    }

    /// Short description for confirmations when the button label is unknown.
    pub fn describe(&self) -> String {
        match *self {
            ButtonAction::Permission(choice) => choice.label().to_string(),
            ButtonAction::Choice { index, .. } => format!("Option {}", index + 1),
            ButtonAction::Navigate { affordance, .. } => affordance.label().to_string(),
        }
    }

    /// Keystrokes that make this selection in the terminal UI.
    pub fn keys(&self) -> KeySequence {
        match *self {
            ButtonAction::Permission(choice) => KeySequence::option_number(choice.index()),
            ButtonAction::Choice { index, .. } => KeySequence::option_number(index),
            ButtonAction::Navigate {
                affordance,
                defined,
            } => KeySequence::navigate_to(defined + affordance.offset()),
        }
    }

    /// Encode as `<tag>:<fields>[@<session_id>]`. The session id is dropped if
    /// it would push the payload past the transport limit.
    pub fn encode(&self, session_id: &str) -> String {
        let body = match *self {
            ButtonAction::Permission(choice) => format!("p:{}", choice.index()),
            ButtonAction::Choice { index, defined } => format!("c:{index}:{defined}"),
            ButtonAction::Navigate {
                affordance: Affordance::Other,
                defined,
            } => format!("o:{defined}"),
            ButtonAction::Navigate {
                affordance: Affordance::Chat,
                defined,
            } => format!("h:{defined}"),
        };
        let full = format!("{body}@{session_id}");
        if session_id.is_empty() || full.len() > MAX_PAYLOAD_BYTES {
            body
        } else {
            full
        }
    }

    pub fn decode(payload: &str) -> Result<DecodedPayload, PayloadError> {
        let payload = payload.trim();
        if payload.is_empty() {
            return Err(PayloadError::Empty);
        }
        let (body, session_id) = match payload.split_once('@') {
            Some((body, sid)) if !sid.is_empty() => (body, Some(sid.to_string())),
            Some((body, _)) => (body, None),
            None => (payload, None),
        };

        let mut parts = body.split(':');
        let tag = parts.next().unwrap_or_default();
        let fields = parts
            .map(|p| p.parse::<usize>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| PayloadError::Malformed(payload.to_string()))?;

        let action = match (tag, fields.as_slice()) {
            ("p", [index]) => ButtonAction::Permission(PermissionChoice::from_index(*index).ok_or(
                PayloadError::OutOfRange {
                    index: *index,
                    defined: PermissionChoice::ALL.len(),
                },
            )?),
            ("c", [index, defined]) => {
                check_defined(*defined, payload)?;
                if index >= defined {
                    return Err(PayloadError::OutOfRange {
                        index: *index,
                        defined: *defined,
                    });
                }
                ButtonAction::Choice {
                    index: *index,
                    defined: *defined,
                }
            }
            ("o", [defined]) | ("h", [defined]) => {
                check_defined(*defined, payload)?;
                let affordance = if tag == "o" {
                    Affordance::Other
                } else {
                    Affordance::Chat
                };
                ButtonAction::Navigate {
                    affordance,
                    defined: *defined,
                }
            }
            ("p" | "c" | "o" | "h", _) => return Err(PayloadError::Malformed(payload.to_string())),
            (other, _) => return Err(PayloadError::UnknownTag(other.to_string())),
        };

        Ok(DecodedPayload { action, session_id })
    }
}

fn check_defined(defined: usize, payload: &str) -> Result<(), PayloadError> {
    if defined > MAX_DEFINED_OPTIONS {
        return Err(PayloadError::Malformed(payload.to_string()));
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Key {
    /// Characters typed as-is.
    Literal(String),
    Down,
    Enter,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct KeySequence {
    pub keys: Vec<Key>,
}

impl KeySequence {
    /// Number key for a zero-based option position (`0` → `"1"`).
    pub fn option_number(index: usize) -> Self {
        Self {
            keys: vec![Key::Literal((index + 1).to_string())],
        }
    }

    /// Move the cursor down `steps` entries from the top, then select.
    pub fn navigate_to(steps: usize) -> Self {
        let mut keys = vec![Key::Down; steps];
        keys.push(Key::Enter);
        Self { keys }
    }

    /// Type `text` verbatim, then submit.
    pub fn submit_text(text: &str) -> Self {
        Self {
            keys: vec![Key::Literal(text.to_string()), Key::Enter],
        }
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

/// The fixed Yes / Always allow / No keyboard.
pub fn permission_buttons(session_id: &str) -> Vec<Vec<OutboundButton>> {
    let button = |choice: PermissionChoice| OutboundButton {
        label: choice.label().to_string(),
        payload: ButtonAction::Permission(choice).encode(session_id),
    };
    vec![
        vec![
            button(PermissionChoice::Yes),
            button(PermissionChoice::AlwaysAllow),
        ],
        vec![button(PermissionChoice::No)],
    ]
}

/// One row per defined option in the given order, then the Other / Chat row.
/// Labels beyond [`MAX_DEFINED_OPTIONS`] are ignored.
pub fn choice_buttons(session_id: &str, labels: &[String]) -> Vec<Vec<OutboundButton>> {
    let defined = labels.len().min(MAX_DEFINED_OPTIONS);
    let mut rows: Vec<Vec<OutboundButton>> = labels
        .iter()
        .take(defined)
        .enumerate()
        .map(|(index, label)| {
            vec![OutboundButton {
                label: label.clone(),
                payload: ButtonAction::Choice { index, defined }.encode(session_id),
            }]
        })
        .collect();
    rows.push(
        [Affordance::Other, Affordance::Chat]
            .into_iter()
            .map(|affordance| OutboundButton {
                label: affordance.label().to_string(),
                payload: ButtonAction::Navigate {
                    affordance,
                    defined,
                }
                .encode(session_id),
            })
            .collect(),
    );
    rows
}
