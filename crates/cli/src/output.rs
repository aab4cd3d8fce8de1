//! Terminal rendering for `arti`.
//!
//! Colored status lines, durations and symbols shared by every `arti` command. Colors are only
//! emitted when the target stream supports them.

use std::fmt::Display;
use std::time::Duration;

use anyhow::Context;
use owo_colors::{OwoColorize, Stream};

pub mod symbols {
  pub const SUCCESS: &str = "✓";
  pub const ERROR: &str = "✗";
  pub const WARNING: &str = "⚠";
  pub const INFO: &str = "•";
  pub const ARROW: &str = "→";
  pub const ADD: &str = "+";
  pub const MODIFY: &str = "~";
  pub const SKIP: &str = "-";
  pub const WAIT: &str = "?";
  pub const NONE: &str = " ";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tone {
  Good,
  Bad,
  Warn,
  Note,
  Muted,
}

/// Render `text` in `tone` if `stream` supports color.
pub fn paint(text: impl Display, tone: Tone, stream: Stream) -> String {
  let text = text.to_string();
  match tone {
    Tone::Good => text.if_supports_color(stream, |s| s.green()).to_string(),
    Tone::Bad => text.if_supports_color(stream, |s| s.red()).to_string(),
    Tone::Warn => text.if_supports_color(stream, |s| s.yellow()).to_string(),
    Tone::Note => text.if_supports_color(stream, |s| s.cyan()).to_string(),
    Tone::Muted => text.if_supports_color(stream, |s| s.dimmed()).to_string(),
  }
}

/// Short form of a 16-digit fingerprint.
pub fn short_fingerprint(fingerprint: &str) -> &str {
  let len = fingerprint.len().min(8);
  &fingerprint[..len]
}

/// Human duration: `850ms`, `2.40s`, or `3m 7s` past a minute.
pub fn format_duration(duration: Duration) -> String {
  let ms = duration.as_millis();
  match ms {
    0..1_000 => format!("{ms}ms"),
    1_000..60_000 => format!("{}.{:02}s", ms / 1_000, ms % 1_000 / 10),
    _ => format!("{}m {}s", ms / 60_000, ms % 60_000 / 1_000),
  }
}

/// One indented line per unit: `symbol unit detail`, the detail muted.
pub fn print_unit_line(symbol: &str, tone: Tone, unit: impl Display, detail: &str) {
  let detail = if detail.is_empty() {
    String::new()
  } else {
    format!(" {}", paint(detail, Tone::Muted, Stream::Stdout))
  };
  println!("  {} {}{}", paint(symbol, tone, Stream::Stdout), unit, detail);
}

pub fn print_success(message: &str) {
  println!("{} {}", paint(symbols::SUCCESS, Tone::Good, Stream::Stdout), message);
}

pub fn print_error(message: &str) {
  eprintln!(
    "{} {}",
    paint(symbols::ERROR, Tone::Bad, Stream::Stderr),
    paint(message, Tone::Bad, Stream::Stderr)
  );
}

pub fn print_warning(message: &str) {
  eprintln!(
    "{} {}",
    paint(symbols::WARNING, Tone::Warn, Stream::Stderr),
    paint(message, Tone::Warn, Stream::Stderr)
  );
}

pub fn print_info(message: &str) {
  println!("{} {}", paint(symbols::INFO, Tone::Note, Stream::Stdout), message);
}

pub fn print_stat(label: &str, value: &str) {
  println!("  {}: {}", paint(label, Tone::Muted, Stream::Stdout), value);
}

pub fn print_header(message: &str) {
  println!("{}", message.if_supports_color(Stream::Stdout, |s| s.bold()));
}

pub fn print_json(value: &impl serde::Serialize) -> anyhow::Result<()> {
  let rendered = serde_json::to_string_pretty(value).context("Failed to render JSON output")?;
  println!("{rendered}");
  Ok(())
}
