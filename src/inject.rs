use std::time::Duration;

use async_trait::async_trait;
use tokio::{process::Command, time::sleep};

use crate::{
    error::InjectError,
    prompt::{Key, KeySequence},
};

const COMMAND_TIMEOUT: Duration = Duration::from_secs(5);
/// Pause between navigation keys so the TUI redraws before the next one.
const NAV_KEY_GAP: Duration = Duration::from_millis(50);

/// Terminal injection collaborator. Fire-and-forget: success means the
/// multiplexer accepted the keys, not that the program consumed them.
#[async_trait]
pub trait PaneInjector: Send + Sync {
    async fn write_keys(&self, pane: &str, keys: &KeySequence) -> Result<(), InjectError>;
}

#[derive(Debug, Clone)]
pub struct TmuxInjector {
    program: String,
}

impl Default for TmuxInjector {
    fn default() -> Self {
        Self::new("tmux")
    }
}

impl TmuxInjector {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    async fn send_keys(&self, pane: &str, key: &Key) -> Result<(), InjectError> {
        let mut command = Command::new(&self.program);
        command.args(send_keys_args(pane, key)).kill_on_drop(true);
        let output = tokio::time::timeout(COMMAND_TIMEOUT, command.output())
            .await
            .map_err(|_| InjectError::Timeout {
                pane: pane.to_string(),
            })??;
        if !output.status.success() {
            return Err(InjectError::Rejected {
                pane: pane.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }
}

fn send_keys_args(pane: &str, key: &Key) -> Vec<String> {
    let mut args = vec!["send-keys".to_string(), "-t".to_string(), pane.to_string()];
    match key {
        Key::Literal(text) => {
            args.push("-l".to_string());
            args.push("--".to_string());
            args.push(escape_trailing_semicolon(text));
        }
        Key::Down => args.push("Down".to_string()),
        Key::Enter => args.push("Enter".to_string()),
    }
    args
}

/// tmux splits its own command line on an argument ending in `;` and turns a
/// trailing `\;` into `;`, even after `-l --`. Rewriting the last `;` as `\;`
/// makes tmux hand back the text unchanged.
fn escape_trailing_semicolon(text: &str) -> String {
    match text.strip_suffix(';') {
        Some(head) => format!("{head}\\;"),
        None => text.to_string(),
    }
}

#[async_trait]
impl PaneInjector for TmuxInjector {
    async fn write_keys(&self, pane: &str, keys: &KeySequence) -> Result<(), InjectError> {
        for (i, key) in keys.keys.iter().enumerate() {
            if i > 0 && matches!(key, Key::Down | Key::Enter) {
                sleep(NAV_KEY_GAP).await;
            }
            self.send_keys(pane, key).await?;
        }
        tracing::debug!(
            target = "pane_relay::inject",
            pane = %pane,
            keys = keys.keys.len(),
            "keys written"
        );
        Ok(())
    }
}

/// Pane the current process runs in, if any.
pub async fn current_pane() -> Option<String> {
    if let Ok(pane) = std::env::var("TMUX_PANE") {
        if !pane.trim().is_empty() {
            return Some(pane.trim().to_string());
        }
    }
    std::env::var_os("TMUX")?;
    let mut command = Command::new("tmux");
    command
        .args(["display-message", "-p", "#{pane_id}"])
        .kill_on_drop(true);
    let output = tokio::time::timeout(COMMAND_TIMEOUT, command.output())
        .await
        .ok()?
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let pane = String::from_utf8_lossy(&output.stdout).trim().to_string();
    (!pane.is_empty()).then_some(pane)
}

#[cfg(test)]
mod tests {
    use super::{send_keys_args, PaneInjector, TmuxInjector};
    use crate::{
        error::InjectError,
        prompt::{Key, KeySequence},
    };

    #[test]
    fn literal_text_is_sent_without_key_lookup() {
        let args = send_keys_args("%3", &Key::Literal("Enter".into()));
        assert_eq!(args, vec!["send-keys", "-t", "%3", "-l", "--", "Enter"]);
    }

    #[test]
    fn trailing_semicolon_survives_tmux_argument_parsing() {
        let literal = |text: &str| send_keys_args("%3", &Key::Literal(text.into())).pop().unwrap();
        assert_eq!(literal("run tests;"), "run tests\\;");
        assert_eq!(literal(";"), "\\;");
        // tmux strips one backslash from a trailing `\;`, so it gets one more.
        assert_eq!(literal("a\\;"), "a\\\\;");
        assert_eq!(literal("a;b"), "a;b");
        assert_eq!(literal("ends with \\"), "ends with \\");
    }

    #[test]
    fn navigation_keys_use_tmux_names() {
        assert_eq!(
            send_keys_args("%3", &Key::Down),
            vec!["send-keys", "-t", "%3", "Down"]
        );
        assert_eq!(
            send_keys_args("%3", &Key::Enter),
            vec!["send-keys", "-t", "%3", "Enter"]
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn accepted_keys_succeed() {
        let injector = TmuxInjector::new("true");
        injector
            .write_keys("%1", &KeySequence::navigate_to(2))
            .await
            .unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failing_tmux_is_rejected() {
        let injector = TmuxInjector::new("false");
        let err = injector
            .write_keys("%9", &KeySequence::submit_text("hi"))
            .await
            .unwrap_err();
        assert!(matches!(err, InjectError::Rejected { pane, .. } if pane == "%9"));
    }

    #[tokio::test]
    async fn missing_binary_is_a_spawn_error() {
        let injector = TmuxInjector::new("pane-relay-no-such-binary");
        let err = injector
            .write_keys("%1", &KeySequence::option_number(0))
            .await
            .unwrap_err();
        assert!(matches!(err, InjectError::Spawn(_)));
    }
}
