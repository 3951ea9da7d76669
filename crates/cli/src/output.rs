// Output format auto-detection for the CLI.
//
// TTY → human-readable text. Piped/redirected → structured JSON lines.
// `--json` forces JSON output regardless of terminal.

use serde::Serialize;
use std::io::{self, IsTerminal, Write};

use livecount_client::PresenceState;

const ANSI_RED: &str = "\x1b[31m";
const ANSI_RESET: &str = "\x1b[0m";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Human,
    /// One JSON object per line.
    Json,
}

impl OutputFormat {
    /// JSON if `--json` was passed or stdout is not a TTY.
    pub fn detect(json_flag: bool) -> Self {
        if json_flag {
            return Self::Json;
        }
        Self::detect_from_terminal(io::stdout().is_terminal())
    }

    pub fn detect_from_terminal(is_tty: bool) -> Self {
        if is_tty {
            Self::Human
        } else {
            Self::Json
        }
    }
}

/// Write a value to stdout in the selected format.
pub fn print_output<T, F>(format: OutputFormat, value: &T, human_fn: F) -> io::Result<()>
where
    T: Serialize,
    F: FnOnce(&T) -> String,
{
    write_output(&mut io::stdout().lock(), format, value, human_fn)
}

/// Write a value to a provided writer (useful for testing).
pub fn write_output<W, T, F>(
    writer: &mut W,
    format: OutputFormat,
    value: &T,
    human_fn: F,
) -> io::Result<()>
where
    W: Write,
    T: Serialize,
    F: FnOnce(&T) -> String,
{
    match format {
        OutputFormat::Human => writeln!(writer, "{}", human_fn(value)),
        OutputFormat::Json => {
            serde_json::to_writer(&mut *writer, value).map_err(io::Error::other)?;
            writeln!(writer)?;
            writer.flush()
        }
    }
}

/// Write an error to stderr in the selected format.
pub fn print_error(format: OutputFormat, code: &str, message: &str) {
    let mut err = io::stderr().lock();
    match format {
        OutputFormat::Human => {
            let line = render_human_error(message, io::stderr().is_terminal());
            let _ = writeln!(err, "{line}");
        }
        OutputFormat::Json => {
            let obj = serde_json::json!({
                "error": {
                    "code": code,
                    "message": message,
                }
            });
            let _ = serde_json::to_writer(&mut err, &obj);
            let _ = writeln!(err);
        }
    }
}

fn render_human_error(message: &str, is_tty: bool) -> String {
    if is_tty {
        format!("{ANSI_RED}error:{ANSI_RESET} {message}")
    } else {
        format!("error: {message}")
    }
}

/// A state change, as printed by `watch` and `online`.
#[derive(Debug, Clone, Serialize)]
pub struct StateLine<'a> {
    pub scope: &'a str,
    #[serde(flatten)]
    pub state: &'a PresenceState,
}

/// `/blog/post-1  3 viewers  leader connected`
pub fn format_state_line(line: &StateLine<'_>) -> String {
    let state = line.state;
    let noun = if state.count == 1 { "viewer" } else { "viewers" };
    let mut parts = vec![format!("{}  {} {noun}", line.scope, state.count)];
    if state.leader {
        parts.push("leader".into());
    }
    if state.connected {
        parts.push("connected".into());
    } else if state.connecting {
        parts.push("connecting".into());
    }
    if state.fallback_active {
        parts.push("polling".into());
    }
    if let Some(error) = &state.error {
        parts.push(format!("({error})"));
    }
    parts.join("  ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detect_tty_returns_human() {
        assert_eq!(OutputFormat::detect_from_terminal(true), OutputFormat::Human);
    }

    #[test]
    fn detect_pipe_returns_json() {
        assert_eq!(OutputFormat::detect_from_terminal(false), OutputFormat::Json);
    }

    #[test]
    fn detect_json_flag_overrides_tty() {
        assert_eq!(OutputFormat::detect(true), OutputFormat::Json);
    }

    #[test]
    fn json_line_flattens_state() {
        let state = PresenceState { count: 3, leader: true, ..Default::default() };
        let line = StateLine { scope: "/blog/post-1", state: &state };
        let mut buf = Vec::new();
        write_output(&mut buf, OutputFormat::Json, &line, format_state_line).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&buf).unwrap();
        assert_eq!(value["scope"], "/blog/post-1");
        assert_eq!(value["count"], 3);
        assert_eq!(value["leader"], true);
        assert!(value["error"].is_null());
    }

    #[test]
    fn human_line_lists_flags() {
        let state = PresenceState {
            count: 1,
            connecting: true,
            fallback_active: true,
            error: Some("ws-error".into()),
            ..Default::default()
        };
        let text = format_state_line(&StateLine { scope: "site", state: &state });
        assert_eq!(text, "site  1 viewer  connecting  polling  (ws-error)");
    }

    #[test]
    fn write_output_json_does_not_call_human_fn() {
        let mut buf = Vec::new();
        write_output(&mut buf, OutputFormat::Json, &serde_json::json!({"ok": true}), |_| {
            unreachable!("human_fn should not be called in JSON mode")
        })
        .unwrap();
        assert_eq!(String::from_utf8(buf).unwrap(), "{\"ok\":true}\n");
    }

    #[test]
    fn render_human_error_uses_color_for_tty() {
        assert!(render_human_error("boom", true).starts_with(ANSI_RED));
        assert_eq!(render_human_error("boom", false), "error: boom");
    }
}
