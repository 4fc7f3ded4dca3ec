//! Terminal theme helpers.
//!
//! Respects the `NO_COLOR` env-var and the `--no-color` CLI flag.
//!
//! | Token    | Hex       | Usage                         |
//! |----------|-----------|-------------------------------|
//! | accent   | `#FF5A2D` | headings, user entries        |
//! | info     | `#FF8A5B` | informational values          |
//! | success  | `#2FBF71` | success states, agent entries |
//! | warn     | `#FFB020` | warnings, stopped sessions    |
//! | error    | `#E23D2D` | errors, failures              |
//! | muted    | `#8B7F77` | de-emphasis, metadata         |

use colored::Colorize;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::chat::{ChatEntry, Role};
use crate::session::{SessionState, TaskSession};

// ── Global color toggle ─────────────────────────────────────────────────────

static COLOR_DISABLED: AtomicBool = AtomicBool::new(false);

/// Disable colour globally.
pub fn disable_color() {
    COLOR_DISABLED.store(true, Ordering::Relaxed);
    colored::control::set_override(false);
}

/// Initialise the colour system from `NO_COLOR` and the `--no-color` flag.
pub fn init_color(no_color_flag: bool) {
    if no_color_flag
        || std::env::var("NO_COLOR")
            .map(|v| !v.is_empty())
            .unwrap_or(false)
    {
        disable_color();
    }
}

fn is_color() -> bool {
    !COLOR_DISABLED.load(Ordering::Relaxed)
}

pub mod palette {
    pub const ACCENT: (u8, u8, u8) = (0xFF, 0x5A, 0x2D);
    pub const INFO: (u8, u8, u8) = (0xFF, 0x8A, 0x5B);
    pub const SUCCESS: (u8, u8, u8) = (0x2F, 0xBF, 0x71);
    pub const WARN: (u8, u8, u8) = (0xFF, 0xB0, 0x20);
    pub const ERROR: (u8, u8, u8) = (0xE2, 0x3D, 0x2D);
    pub const MUTED: (u8, u8, u8) = (0x8B, 0x7F, 0x77);
}

// ── Themed formatting helpers ───────────────────────────────────────────────

fn apply(text: &str, rgb: (u8, u8, u8)) -> String {
    if is_color() {
        text.truecolor(rgb.0, rgb.1, rgb.2).to_string()
    } else {
        text.to_string()
    }
}

fn apply_bold(text: &str, rgb: (u8, u8, u8)) -> String {
    if is_color() {
        text.truecolor(rgb.0, rgb.1, rgb.2).bold().to_string()
    } else {
        text.to_string()
    }
}

pub fn accent(text: &str) -> String {
    apply(text, palette::ACCENT)
}

pub fn info(text: &str) -> String {
    apply(text, palette::INFO)
}

pub fn success(text: &str) -> String {
    apply(text, palette::SUCCESS)
}

pub fn warn(text: &str) -> String {
    apply(text, palette::WARN)
}

pub fn error(text: &str) -> String {
    apply(text, palette::ERROR)
}

pub fn muted(text: &str) -> String {
    apply(text, palette::MUTED)
}

/// Bold heading in accent colour.
pub fn heading(text: &str) -> String {
    apply_bold(text, palette::ACCENT)
}

// ── Composite icons ─────────────────────────────────────────────────────────

pub fn icon_ok(label: &str) -> String {
    format!("{} {}", success("✓"), label)
}

pub fn icon_fail(label: &str) -> String {
    format!("{} {}", error("✗"), label)
}

pub fn icon_warn(label: &str) -> String {
    format!("{} {}", warn("⚠"), label)
}

/// Format "  Label : value" with the label dimmed and the value highlighted.
pub fn label_value(label: &str, value: &str) -> String {
    format!("  {} : {}", muted(label), info(value))
}

// ── Chat rendering ──────────────────────────────────────────────────────────

fn role_tag(role: Role) -> String {
    let tag = format!("[{}]", role.as_str());
    match role {
        Role::User => apply_bold(&tag, palette::ACCENT),
        Role::Agent => success(&tag),
        Role::System => muted(&tag),
    }
}

/// One chat entry as terminal lines: `HH:MM:SS [role] text`, continuation
/// lines indented under the text.
pub fn render_entry(entry: &ChatEntry) -> String {
    let stamp = muted(&entry.created_at.format("%H:%M:%S").to_string());
    let mut lines = entry.text.lines();
    let first = lines.next().unwrap_or_default();
    let mut out = format!("{} {} {}", stamp, role_tag(entry.role), first);
    let indent = " ".repeat(9 + entry.role.as_str().len() + 3);
    for line in lines {
        out.push('\n');
        out.push_str(&indent);
        out.push_str(line);
    }
    out
}

pub fn render_state(state: SessionState) -> String {
    match state {
        SessionState::Running => info(state.as_str()),
        SessionState::Completed => success(state.as_str()),
        SessionState::Failed => error(state.as_str()),
        SessionState::Stopped => warn(state.as_str()),
    }
}

/// Status line for a session, e.g. `✓ Task T1 completed (1.2s)`.
pub fn render_session(session: &TaskSession) -> String {
    let duration = session
        .duration()
        .map(|d| format!(" ({:.1}s)", d.num_milliseconds() as f64 / 1000.0))
        .unwrap_or_default();
    let label = format!(
        "Task {} {}{}",
        session.task_id(),
        render_state(session.state()),
        muted(&duration)
    );
    match session.state() {
        SessionState::Completed => icon_ok(&label),
        SessionState::Failed => icon_fail(&label),
        SessionState::Stopped => icon_warn(&label),
        SessionState::Running => format!("{} {}", info("…"), label),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_rendering_without_color() {
        disable_color();
        assert_eq!(accent("hello"), "hello");
        assert_eq!(icon_ok("done"), "✓ done");
        assert_eq!(icon_fail("bad"), "✗ bad");

        let entry = ChatEntry::system("Task finished\nOutput: hi");
        let rendered = render_entry(&entry);
        let mut lines = rendered.lines();
        assert!(lines.next().unwrap().ends_with("[system] Task finished"));
        let second = lines.next().unwrap();
        assert_eq!(second.trim_start(), "Output: hi");
        assert_eq!(second.find('O'), rendered.find("Task"));

        let mut session = TaskSession::start("T1");
        assert!(render_session(&session).contains("Task T1 running"));
        session.finish(SessionState::Stopped);
        assert!(render_session(&session).starts_with("⚠ Task T1 stopped"));
    }
}
