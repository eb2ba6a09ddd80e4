use serde::Serialize;

use super::Diagnostic;

#[derive(Serialize)]
struct Payload<'a> {
    severity: &'static str,
    message: &'a str,
    line: usize,
    col: usize,
    start: usize,
    end: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    lexeme: Option<&'a str>,
}

/// One JSON object per diagnostic, single line, for tooling consumers.
pub fn render(d: &Diagnostic) -> String {
    let payload = Payload {
        severity: "error",
        message: &d.message,
        line: d.line,
        col: d.col,
        start: d.span.start,
        end: d.span.end,
        lexeme: d.lexeme.as_deref(),
    };
    serde_json::to_string(&payload).unwrap_or_else(|_| {
        r#"{"severity":"error","message":"internal error serializing diagnostic"}"#.to_string()
    })
}
