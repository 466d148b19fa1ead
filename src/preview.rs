//! Preview Surface contract.
//!
//! What a UI sees of a [`SandboxSession`](crate::session::SandboxSession):
//! a [`PreviewSnapshot`] it can poll, and a stream of [`SessionEvent`]s it
//! can follow. The terminal renderer used by the CLI lives here too.

use crate::output::{LineKind, TerminalLine};
use crate::session::LifecycleState;
use console::{style, Emoji};
use serde::{Deserialize, Serialize};

static CHECK: Emoji<'_, '_> = Emoji("✅ ", "[OK]");
static CROSS: Emoji<'_, '_> = Emoji("❌ ", "[ERR]");
static RUNNING: Emoji<'_, '_> = Emoji("▶️  ", "[>]");

/// Change notifications emitted by a session, in the order they happen.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEvent {
    StateChanged {
        from: LifecycleState,
        to: LifecycleState,
    },
    Line(TerminalLine),
    Ready {
        endpoint: String,
    },
    Failed {
        message: String,
    },
    LogCleared,
}

/// Point-in-time view of a session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreviewSnapshot {
    pub state: LifecycleState,
    pub log: Vec<TerminalLine>,
    /// Present only while `state` is `ready`.
    pub endpoint: Option<String>,
    /// Present only while `state` is `error`.
    pub error: Option<String>,
}

impl PreviewSnapshot {
    /// Whether a UI should offer a restart action.
    pub fn restart_available(&self) -> bool {
        matches!(self.state, LifecycleState::Ready | LifecycleState::Error)
    }

    pub fn errors(&self) -> impl Iterator<Item = &TerminalLine> {
        self.log.iter().filter(|line| line.kind == LineKind::Error)
    }
}

/// Style one log line for a terminal.
pub fn render_line(line: &TerminalLine) -> String {
    match line.kind {
        LineKind::Command => format!("{} {}", style("$").dim(), style(&line.text).bold()),
        LineKind::Info => style(&line.text).cyan().to_string(),
        LineKind::Success => style(&line.text).green().to_string(),
        LineKind::Error => style(&line.text).red().to_string(),
        LineKind::Output => line.text.clone(),
        LineKind::Muted => style(&line.text).dim().to_string(),
    }
}

/// One-line banner for the lifecycle state.
pub fn render_state(state: LifecycleState, endpoint: Option<&str>, error: Option<&str>) -> String {
    match state {
        LifecycleState::Ready => format!(
            "{}{} {}",
            CHECK,
            style("Preview ready at").green(),
            style(endpoint.unwrap_or("(unknown endpoint)")).bold().underlined()
        ),
        LifecycleState::Error => format!(
            "{}{} {}\n    {}",
            CROSS,
            style("Preview failed:").red().bold(),
            error.unwrap_or("unknown error"),
            style("Restart to try again.").dim()
        ),
        LifecycleState::Idle => style("Idle").dim().to_string(),
        in_flight => format!("{}{}…", RUNNING, style(capitalize(in_flight.as_str())).yellow()),
    }
}

/// Everything a snapshot shows, log first.
pub fn render_snapshot(snapshot: &PreviewSnapshot) -> String {
    let mut out = String::new();
    for line in &snapshot.log {
        out.push_str(&render_line(line));
        out.push('\n');
    }
    out.push_str(&render_state(
        snapshot.state,
        snapshot.endpoint.as_deref(),
        snapshot.error.as_deref(),
    ));
    out
}

/// Terminal text for an event, if it prints anything.
pub fn render_event(event: &SessionEvent) -> Option<String> {
    match event {
        SessionEvent::Line(line) => Some(render_line(line)),
        SessionEvent::StateChanged { to, .. } if to.is_in_flight() => {
            Some(render_state(*to, None, None))
        }
        SessionEvent::Ready { endpoint } => {
            Some(render_state(LifecycleState::Ready, Some(endpoint), None))
        }
        SessionEvent::Failed { message } => {
            Some(render_state(LifecycleState::Error, None, Some(message)))
        }
        SessionEvent::StateChanged { .. } | SessionEvent::LogCleared => None,
    }
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plain(s: &str) -> String {
        console::strip_ansi_codes(s).into_owned()
    }

    #[test]
    fn error_state_always_has_message_and_restart_hint() {
        let text = plain(&render_state(
            LifecycleState::Error,
            None,
            Some("Install failed with exit code 1"),
        ));
        assert!(text.contains("Install failed with exit code 1"));
        assert!(text.contains("Restart"));

        let text = plain(&render_state(LifecycleState::Error, None, None));
        assert!(text.contains("unknown error"));
    }

    #[test]
    fn ready_state_shows_endpoint() {
        let text = plain(&render_state(
            LifecycleState::Ready,
            Some("http://localhost:3000"),
            None,
        ));
        assert!(text.contains("http://localhost:3000"));
    }

    #[test]
    fn in_flight_banner_names_the_stage() {
        assert!(plain(&render_state(LifecycleState::Installing, None, None)).contains("Installing"));
    }

    #[test]
    fn lines_keep_their_text() {
        let line = TerminalLine::command("npm install");
        assert_eq!(plain(&render_line(&line)), "$ npm install");
        let line = TerminalLine::error("npm ERR! 404");
        assert_eq!(plain(&render_line(&line)), "npm ERR! 404");
    }

    #[test]
    fn snapshot_restart_availability() {
        let mut snapshot = PreviewSnapshot::default();
        assert!(!snapshot.restart_available());
        snapshot.state = LifecycleState::Error;
        assert!(snapshot.restart_available());
        snapshot.state = LifecycleState::Starting;
        assert!(!snapshot.restart_available());
    }

    #[test]
    fn events_serialize_with_tag() {
        let event = SessionEvent::StateChanged {
            from: LifecycleState::Idle,
            to: LifecycleState::Booting,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "state_changed");
        assert_eq!(json["to"], "booting");

        let json = serde_json::to_value(SessionEvent::Line(TerminalLine::info("fetching"))).unwrap();
        assert_eq!(json["event"], "line");
        assert_eq!(json["kind"], "info");
    }

    #[test]
    fn quiet_events_render_nothing() {
        assert!(render_event(&SessionEvent::LogCleared).is_none());
        assert!(render_event(&SessionEvent::StateChanged {
            from: LifecycleState::Ready,
            to: LifecycleState::Idle,
        })
        .is_none());
    }
}
