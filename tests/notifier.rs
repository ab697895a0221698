mod common;

use chrono::{Duration, Utc};
use common::{store_in, FakeTransport};
use pane_relay::{
    error::StoreError,
    hook::{AttentionEvent, Question, QuestionOption, ToolOutcome},
    notifier::{EmitOutcome, NotificationEmitter},
    prompt::{ButtonAction, Key, PromptKind},
    types::{Session, SessionStatus},
};
use serde_json::json;

fn seed(dir: &tempfile::TempDir, session_id: &str, thread_id: i64) {
    store_in(dir)
        .with_lock(|registry| registry.insert(Session::new(session_id, thread_id, "%1", None)))
        .unwrap();
}

#[tokio::test]
async fn permission_prompt_offers_three_ordered_options() {
    let dir = tempfile::tempdir().unwrap();
    seed(&dir, "s1", 42);
    let transport = FakeTransport::new();
    let emitter = NotificationEmitter::new(store_in(&dir), transport.clone());

    let outcome = emitter
        .emit(
            "s1",
            &AttentionEvent::Permission {
                tool_name: "Bash".into(),
                tool_input: json!({"command": "cargo publish"}),
            },
        )
        .await
        .unwrap();

    assert!(matches!(outcome, EmitOutcome::Sent { thread_id: 42, .. }));
    let sent = transport.sent.lock();
    let (thread, message) = &sent[0];
    assert_eq!(*thread, 42);
    let buttons: Vec<_> = message.buttons.iter().flatten().collect();
    assert_eq!(buttons.len(), 3);
    let labels: Vec<&str> = buttons.iter().map(|b| b.label.as_str()).collect();
    assert_eq!(labels, vec!["\u{2705} Yes", "\u{1F513} Always allow", "\u{274C} No"]);

    let second = ButtonAction::decode(&buttons[1].payload).unwrap();
    assert_eq!(second.action.kind(), PromptKind::Permission);
    assert_eq!(second.action.keys().keys, vec![Key::Literal("2".into())]);
}

#[tokio::test]
async fn defined_choice_renders_one_button_per_label() {
    let dir = tempfile::tempdir().unwrap();
    seed(&dir, "s1", 42);
    let transport = FakeTransport::new();
    let emitter = NotificationEmitter::new(store_in(&dir), transport.clone());
    let options = ["Red", "Green", "Blue"]
        .into_iter()
        .map(|label| QuestionOption {
            label: label.into(),
            description: None,
        })
        .collect();

    emitter
        .emit(
            "s1",
            &AttentionEvent::Question {
                questions: vec![Question {
                    question: "Colour?".into(),
                    multi_select: false,
                    options,
                }],
            },
        )
        .await
        .unwrap();

    let sent = transport.sent.lock();
    let message = &sent[0].1;
    let choices: Vec<_> = message
        .buttons
        .iter()
        .flatten()
        .filter(|b| {
            ButtonAction::decode(&b.payload).unwrap().action.kind() == PromptKind::DefinedChoice
        })
        .collect();
    assert_eq!(choices.len(), 3);
    assert_eq!(choices[0].label, "Red");
    let first = ButtonAction::decode(&choices[0].payload).unwrap();
    assert_eq!(first.action.keys().keys, vec![Key::Literal("1".into())]);
}

#[tokio::test]
async fn idle_event_marks_session_idle_without_buttons() {
    let dir = tempfile::tempdir().unwrap();
    seed(&dir, "s1", 42);
    let transport = FakeTransport::new();
    let emitter = NotificationEmitter::new(store_in(&dir), transport.clone());

    emitter
        .emit(
            "s1",
            &AttentionEvent::Stop {
                may_need_input: false,
                last_message: Some("Done.".into()),
            },
        )
        .await
        .unwrap();

    let registry = store_in(&dir).load().unwrap();
    assert_eq!(
        registry.find_by_session_id("s1").unwrap().status,
        SessionStatus::Idle
    );
    assert!(transport.sent.lock()[0].1.buttons.is_empty());
}

#[tokio::test]
async fn unknown_session_is_dropped_quietly() {
    let dir = tempfile::tempdir().unwrap();
    let transport = FakeTransport::new();
    let emitter = NotificationEmitter::new(store_in(&dir), transport.clone());

    let outcome = emitter
        .emit(
            "never-registered",
            &AttentionEvent::Notification {
                kind: "idle_prompt".into(),
                title: None,
                message: None,
            },
        )
        .await
        .unwrap();

    assert_eq!(outcome, EmitOutcome::Dropped);
    assert!(transport.sent.lock().is_empty());
    assert!(!store_in(&dir).path().exists());
}

#[tokio::test]
async fn closed_session_gets_no_notifications() {
    let dir = tempfile::tempdir().unwrap();
    seed(&dir, "s1", 42);
    store_in(&dir)
        .with_lock(|registry| {
            registry.touch("s1", SessionStatus::Closed);
            Ok::<_, pane_relay::error::StoreError>(())
        })
        .unwrap();
    let transport = FakeTransport::new();
    let emitter = NotificationEmitter::new(store_in(&dir), transport.clone());

    let outcome = emitter
        .emit(
            "s1",
            &AttentionEvent::Permission {
                tool_name: "Read".into(),
                tool_input: json!({"file_path": "/etc/hosts"}),
            },
        )
        .await
        .unwrap();

    assert_eq!(outcome, EmitOutcome::Dropped);
    assert!(transport.sent.lock().is_empty());
}

fn permission(tool_name: &str) -> AttentionEvent {
    AttentionEvent::Permission {
        tool_name: tool_name.into(),
        tool_input: json!({"command": "cargo test", "file_path": "/src/lib.rs"}),
    }
}

#[tokio::test]
async fn attention_event_clears_busy_flag() {
    let dir = tempfile::tempdir().unwrap();
    seed(&dir, "s1", 42);
    store_in(&dir)
        .with_lock(|registry| {
            registry.update("s1", |s| s.busy = true);
            Ok::<_, StoreError>(())
        })
        .unwrap();
    let transport = FakeTransport::new();
    let emitter = NotificationEmitter::new(store_in(&dir), transport.clone());

    emitter
        .emit(
            "s1",
            &AttentionEvent::Notification {
                kind: "auth_success".into(),
                title: None,
                message: None,
            },
        )
        .await
        .unwrap();

    let registry = store_in(&dir).load().unwrap();
    let session = registry.find_by_session_id("s1").unwrap();
    assert!(!session.busy);
    assert_eq!(session.status, SessionStatus::Active);
}

#[tokio::test]
async fn tool_result_follows_a_shown_prompt_once() {
    let dir = tempfile::tempdir().unwrap();
    seed(&dir, "s1", 42);
    let transport = FakeTransport::new();
    let emitter = NotificationEmitter::new(store_in(&dir), transport.clone());
    let completed = ToolOutcome::Completed {
        tool_name: "Bash".into(),
        tool_input: json!({"command": "cargo test"}),
    };

    emitter.emit("s1", &permission("Bash")).await.unwrap();
    let first = emitter.follow_up("s1", &completed).await.unwrap();
    let second = emitter.follow_up("s1", &completed).await.unwrap();

    assert!(matches!(first, EmitOutcome::Sent { thread_id: 42, .. }));
    assert_eq!(second, EmitOutcome::Dropped);
    let texts = transport.sent_texts();
    assert_eq!(texts.len(), 2);
    assert_eq!(
        texts[1],
        "\u{2705} <b>Allowed</b>: Bash\n<code>cargo test</code>"
    );
    let registry = store_in(&dir).load().unwrap();
    assert!(registry
        .find_by_session_id("s1")
        .unwrap()
        .permission_shown_at
        .is_none());
}

#[tokio::test]
async fn auto_approved_tool_is_not_reported() {
    let dir = tempfile::tempdir().unwrap();
    seed(&dir, "s1", 42);
    let transport = FakeTransport::new();
    let emitter = NotificationEmitter::new(store_in(&dir), transport.clone());
    let path = store_in(&dir).path().to_path_buf();
    let before = std::fs::read(&path).unwrap();

    let outcome = emitter
        .follow_up(
            "s1",
            &ToolOutcome::Failed {
                tool_name: "Write".into(),
                error: Some("disk full".into()),
            },
        )
        .await
        .unwrap();

    assert_eq!(outcome, EmitOutcome::Dropped);
    assert!(transport.sent.lock().is_empty());
    assert_eq!(std::fs::read(&path).unwrap(), before);
}

#[tokio::test]
async fn expired_prompt_is_consumed_without_a_report() {
    let dir = tempfile::tempdir().unwrap();
    seed(&dir, "s1", 42);
    store_in(&dir)
        .with_lock(|registry| {
            registry.update("s1", |s| {
                s.permission_shown_at = Some(Utc::now() - Duration::minutes(6))
            });
            Ok::<_, StoreError>(())
        })
        .unwrap();
    let transport = FakeTransport::new();
    let emitter = NotificationEmitter::new(store_in(&dir), transport.clone());

    let outcome = emitter
        .follow_up(
            "s1",
            &ToolOutcome::Failed {
                tool_name: "Edit".into(),
                error: None,
            },
        )
        .await
        .unwrap();

    assert_eq!(outcome, EmitOutcome::Dropped);
    assert!(transport.sent.lock().is_empty());
    let registry = store_in(&dir).load().unwrap();
    assert!(registry
        .find_by_session_id("s1")
        .unwrap()
        .permission_shown_at
        .is_none());
}

#[tokio::test]
async fn denied_tool_is_reported_after_its_prompt() {
    let dir = tempfile::tempdir().unwrap();
    seed(&dir, "s1", 42);
    let transport = FakeTransport::new();
    let emitter = NotificationEmitter::new(store_in(&dir), transport.clone());

    emitter.emit("s1", &permission("Edit")).await.unwrap();
    emitter
        .follow_up(
            "s1",
            &ToolOutcome::Failed {
                tool_name: "Edit".into(),
                error: Some("User refused".into()),
            },
        )
        .await
        .unwrap();

    let texts = transport.sent_texts();
    assert_eq!(
        texts.last().unwrap(),
        "\u{274C} <b>Denied/Failed</b>: Edit\n<i>User refused</i>"
    );
}
