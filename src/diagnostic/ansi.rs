use crate::lexer::SourceMap;

use super::Diagnostic;

/// Renders a diagnostic as a caret-underlined source snippet.
pub struct AnsiRenderer {
    pub use_color: bool,
}

impl AnsiRenderer {
    fn bold(&self, s: &str) -> String {
        if self.use_color { format!("\x1b[1m{s}\x1b[0m") } else { s.to_string() }
    }

    fn bold_red(&self, s: &str) -> String {
        if self.use_color { format!("\x1b[1;31m{s}\x1b[0m") } else { s.to_string() }
    }

    fn cyan(&self, s: &str) -> String {
        if self.use_color { format!("\x1b[36m{s}\x1b[0m") } else { s.to_string() }
    }

    pub fn render(&self, d: &Diagnostic, source: &str) -> String {
        let mut out = String::new();
        out.push_str(&format!(
            "{}: {}\n",
            self.bold_red("error"),
            self.bold(&d.message)
        ));

        let map = SourceMap::new(source);
        let line_text = map.line_text(source, d.line);

        // "  --> line:col"
        out.push_str(&format!("  {} {}:{}\n", self.cyan("-->"), d.line, d.col));

        let gutter = d.line.to_string().len();
        let pipe = self.cyan("|");
        let pad = " ".repeat(gutter);

        out.push_str(&format!("{pad} {pipe}\n"));
        let line_num = self.cyan(&format!("{:>gutter$}", d.line));
        out.push_str(&format!("{line_num} {pipe} {line_text}\n"));

        // Caret line under the offending span, clamped to the line.
        let indent = " ".repeat(d.col.saturating_sub(1));
        let width = d
            .span
            .end
            .saturating_sub(d.span.start)
            .clamp(1, line_text.len().saturating_sub(d.col - 1).max(1));
        let carets = self.bold_red(&"^".repeat(width));
        out.push_str(&format!("{pad} {pipe} {indent}{carets}\n"));
        out.push_str(&format!("{pad} {pipe}\n"));

        out
    }
}
