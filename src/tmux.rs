//! Thin tmux integration for interactive sandbox sessions.
//!
//! ExitBox attaches the agent to the user's current tmux pane (or plain
//! tty) and, when the run ends, scrapes the pane's scrollback for the
//! agent's resume identifier.

use crate::cmd::Cmd;

/// How much scrollback to scan for a resume token.
const SCROLLBACK_LINES: u16 = 1000;

/// The current tmux pane id, if any.
pub fn current_pane() -> Option<String> {
    std::env::var("TMUX_PANE").ok().filter(|p| !p.is_empty())
}

/// Capture the trailing scrollback of a pane. None when tmux is absent or
/// the pane is gone; resume capture treats that as "nothing to resume".
pub fn capture_scrollback(pane_id: &str) -> Option<String> {
    capture_pane(pane_id, SCROLLBACK_LINES)
}

fn capture_pane(pane_id: &str, lines: u16) -> Option<String> {
    let start_line = format!("-{}", lines);
    Cmd::new("tmux")
        .args(["capture-pane", "-p", "-S", start_line.as_str(), "-t", pane_id])
        .run_and_capture_stdout()
        .ok()
}
