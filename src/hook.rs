//! Hook payloads delivered by the assistant on stdin, one JSON object per
//! process invocation.

use std::{
    fs::File,
    io::{Read, Seek, SeekFrom},
    path::Path,
};

use serde::Deserialize;
use serde_json::Value;

use crate::prompt::PromptKind;

/// How much of the transcript tail is scanned for the last assistant reply.
const TRANSCRIPT_TAIL_BYTES: u64 = 100_000;

pub const ASK_USER_QUESTION_TOOL: &str = "AskUserQuestion";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct HookPayload {
    #[serde(default)]
    pub hook_event_name: String,
    #[serde(default)]
    pub session_id: String,
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub tool_name: Option<String>,
    #[serde(default)]
    pub tool_input: Option<Value>,
    #[serde(default)]
    pub notification_type: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub stop_hook_active: bool,
    #[serde(default)]
    pub transcript_path: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleEvent {
    Start { cwd: Option<String> },
    End,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct QuestionOption {
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Question {
    #[serde(default)]
    pub question: String,
    #[serde(default, rename = "multiSelect")]
    pub multi_select: bool,
    #[serde(default)]
    pub options: Vec<QuestionOption>,
}

/// Something the human should look at.
#[derive(Debug, Clone, PartialEq)]
pub enum AttentionEvent {
    Permission {
        tool_name: String,
        tool_input: Value,
    },
    Question {
        questions: Vec<Question>,
    },
    Notification {
        kind: String,
        title: Option<String>,
        message: Option<String>,
    },
    Stop {
        may_need_input: bool,
        last_message: Option<String>,
    },
}

impl AttentionEvent {
    /// Shape of the reply this event asks for, if it asks for one via buttons.
    pub fn prompt_kind(&self) -> Option<PromptKind> {
        match self {
            AttentionEvent::Permission { .. } => Some(PromptKind::Permission),
            AttentionEvent::Question { questions } => {
                match questions.first() {
                    Some(q) if !q.options.is_empty() => Some(PromptKind::DefinedChoice),
                    _ => Some(PromptKind::OpenEnded),
                }
            }
            AttentionEvent::Notification { .. } | AttentionEvent::Stop { .. } => None,
        }
    }

    /// Posted from a `PermissionRequest`, so a tool result will follow.
    pub fn awaits_tool_result(&self) -> bool {
        matches!(
            self,
            AttentionEvent::Permission { .. } | AttentionEvent::Question { .. }
        )
    }

    /// Idle and stop events park the session until the human answers.
    pub fn marks_idle(&self) -> bool {
        match self {
            AttentionEvent::Notification { kind, .. } => kind == "idle_prompt",
            AttentionEvent::Stop { .. } => true,
            _ => false,
        }
    }
}

/// Result of a tool call, reported after it ran or was refused.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolOutcome {
    Completed {
        tool_name: String,
        tool_input: Value,
    },
    Failed {
        tool_name: String,
        error: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum HookEvent {
    Lifecycle {
        session_id: String,
        event: LifecycleEvent,
    },
    Attention {
        session_id: String,
        event: AttentionEvent,
    },
    ToolResult {
        session_id: String,
        outcome: ToolOutcome,
    },
    Ignored {
        hook_event_name: String,
    },
}

pub fn parse_payload(input: &str) -> Result<HookPayload, serde_json::Error> {
    if input.trim().is_empty() {
        return Ok(HookPayload::default());
    }
    serde_json::from_str(input)
}

impl HookPayload {
    pub fn into_event(self) -> HookEvent {
        let session_id = self.session_id.trim().to_string();
        if session_id.is_empty() {
            return HookEvent::Ignored {
                hook_event_name: self.hook_event_name,
            };
        }
        match self.hook_event_name.as_str() {
            "SessionStart" => HookEvent::Lifecycle {
                session_id,
                event: LifecycleEvent::Start { cwd: self.cwd },
            },
            "SessionEnd" => HookEvent::Lifecycle {
                session_id,
                event: LifecycleEvent::End,
            },
            "PermissionRequest" => {
                let tool_name = self.tool_name.unwrap_or_else(|| "unknown".to_string());
                let tool_input = self.tool_input.unwrap_or(Value::Null);
                let event = if tool_name == ASK_USER_QUESTION_TOOL {
                    AttentionEvent::Question {
                        questions: parse_questions(&tool_input),
                    }
                } else {
                    AttentionEvent::Permission {
                        tool_name,
                        tool_input,
                    }
                };
                HookEvent::Attention { session_id, event }
            }
            "PostToolUse" => HookEvent::ToolResult {
                session_id,
                outcome: ToolOutcome::Completed {
                    tool_name: self.tool_name.unwrap_or_else(|| "unknown".to_string()),
                    tool_input: self.tool_input.unwrap_or(Value::Null),
                },
            },
            "PostToolUseFailure" => HookEvent::ToolResult {
                session_id,
                outcome: ToolOutcome::Failed {
                    tool_name: self.tool_name.unwrap_or_else(|| "unknown".to_string()),
                    error: self.error.filter(|e| !e.is_empty()),
                },
            },
            "Notification" => HookEvent::Attention {
                session_id,
                event: AttentionEvent::Notification {
                    kind: self.notification_type.unwrap_or_default(),
                    title: self.title.filter(|t| !t.is_empty()),
                    message: self.message.filter(|m| !m.is_empty()),
                },
            },
            "Stop" => {
                let last_message = self
                    .transcript_path
                    .as_deref()
                    .filter(|p| !p.is_empty())
                    .and_then(|p| last_assistant_text(Path::new(p)));
                HookEvent::Attention {
                    session_id,
                    event: AttentionEvent::Stop {
                        may_need_input: self.stop_hook_active,
                        last_message,
                    },
                }
            }
            _ => HookEvent::Ignored {
                hook_event_name: self.hook_event_name,
            },
        }
    }
}

fn parse_questions(tool_input: &Value) -> Vec<Question> {
    tool_input
        .get("questions")
        .cloned()
        .and_then(|q| serde_json::from_value(q).ok())
        .unwrap_or_default()
}

/// Text of the most recent assistant message in a JSONL transcript, searching
/// only the tail of the file.
pub fn last_assistant_text(path: &Path) -> Option<String> {
    let tail = match read_tail(path, TRANSCRIPT_TAIL_BYTES) {
        Ok(tail) => tail,
        Err(error) => {
            tracing::warn!(
                target = "pane_relay::hook",
                path = %path.display(),
                error = %error,
                "failed to read transcript"
            );
            return None;
        }
    };
    tail.lines().rev().find_map(|line| {
        let entry: Value = serde_json::from_str(line).ok()?;
        let message = match entry.get("type").and_then(Value::as_str) {
            Some("assistant") => entry.get("message")?,
            Some("progress") => {
                let inner = entry.get("data")?.get("message")?;
                if inner.get("type").and_then(Value::as_str) != Some("assistant") {
                    return None;
                }
                inner.get("message")?
            }
            _ => return None,
        };
        let parts: Vec<&str> = message
            .get("content")?
            .as_array()?
            .iter()
            .filter(|block| block.get("type").and_then(Value::as_str) == Some("text"))
            .filter_map(|block| block.get("text").and_then(Value::as_str))
            .collect();
        (!parts.is_empty()).then(|| parts.join("\n"))
    })
}

fn read_tail(path: &Path, max: u64) -> std::io::Result<String> {
    let mut file = File::open(path)?;
    let size = file.metadata()?.len();
    file.seek(SeekFrom::Start(size.saturating_sub(max)))?;
    let mut buf = Vec::new();
    file.read_to_end(&mut buf)?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}
