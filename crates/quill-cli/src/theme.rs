//! CLI styling.

use colored::Colorize;

/// CLI theme configuration.
pub(crate) struct Theme;

impl Theme {
    /// Format a header.
    pub(crate) fn header(text: &str) -> String {
        format!("{}", text.bold().cyan())
    }

    /// Format a success message.
    pub(crate) fn success(text: &str) -> String {
        format!("{} {}", "✓".green(), text)
    }

    /// Format an error message.
    pub(crate) fn error(text: &str) -> String {
        format!("{} {}", "✗".red(), text.red())
    }

    /// Format a warning message.
    pub(crate) fn warning(text: &str) -> String {
        format!("{} {}", "!".yellow(), text.yellow())
    }

    /// Format an info message.
    pub(crate) fn info(text: &str) -> String {
        format!("{} {}", "i".blue(), text)
    }

    pub(crate) fn dimmed(text: &str) -> String {
        format!("{}", text.dimmed())
    }

    pub(crate) fn separator() -> String {
        "━".repeat(60).dimmed().to_string()
    }

    /// Colour an addon state word.
    pub(crate) fn state(state: &str) -> String {
        match state {
            "started" | "applied" => state.green().to_string(),
            "failed" => state.red().to_string(),
            "enabled" => state.yellow().to_string(),
            _ => state.dimmed().to_string(),
        }
    }
}
