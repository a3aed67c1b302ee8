//! Source-span rendering and the global `tracing` subscriber.
//!
//! The teacher reaches for `miette` for its own diagnostics; this crate's
//! narrower error surface (§7 of SPEC_FULL.md) is rendered with a small
//! in-crate helper instead of pulling in a full diagnostics framework.

use crate::config::LogFormat;
use crate::errors::Span;

/// Render `message` with a `path:line:col: message` header followed by the
/// offending source line and a caret under the span, in the teacher's own
/// span-based error-reporting style.
pub fn render_error(path: &str, source: &str, span: Span, message: &str) -> String {
    let (line, col) = line_col_of(source, span.start);
    let line_text = source.lines().nth(line.saturating_sub(1)).unwrap_or("");
    let caret_len = (span.end.saturating_sub(span.start)).max(1);
    let mut out = format!("{path}:{line}:{col}: {message}\n");
    out.push_str(line_text);
    out.push('\n');
    out.push_str(&" ".repeat(col.saturating_sub(1)));
    out.push_str(&"^".repeat(caret_len));
    out
}

fn line_col_of(source: &str, byte_offset: usize) -> (usize, usize) {
    let mut line = 1usize;
    let mut col = 1usize;
    for (i, ch) in source.char_indices() {
        if i >= byte_offset {
            break;
        }
        if ch == '\n' {
            line += 1;
            col = 1;
        } else {
            col += 1;
        }
    }
    (line, col)
}

/// Install the process-wide `tracing` subscriber, honoring `RUST_LOG` and
/// the configured output format.
pub fn install_subscriber(format: LogFormat) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Pretty => {
            let _ = subscriber.with_target(false).try_init();
        }
        LogFormat::Json => {
            let _ = subscriber.json().try_init();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_error_points_at_offending_column() {
        let source = "| x |\nx := 1 + .";
        let span = Span::new(11, 11);
        let rendered = render_error("script.tlk", source, span, "unexpected token");
        assert!(rendered.contains("script.tlk:2:6: unexpected token"));
    }
}
