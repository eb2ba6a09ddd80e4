pub mod ansi;
pub mod json;

use crate::compiler::CompileError;
use crate::lexer::{SourceMap, Span};

/// A compile error resolved against its source text, ready to render.
/// Runtime errors keep their own plain-text trace format; only the
/// compiler produces span-labelled diagnostics.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub message: String,
    pub span: Span,
    /// 1-based.
    pub line: usize,
    /// 1-based.
    pub col: usize,
    /// The offending token's text; `None` at end of input.
    pub lexeme: Option<String>,
}

impl Diagnostic {
    pub fn from_compile_error(error: &CompileError, source: &str) -> Self {
        let map = SourceMap::new(source);
        let (line, col) = map.lookup(error.span.start);
        Diagnostic {
            message: error.message.clone(),
            span: error.span,
            line,
            col,
            lexeme: error.lexeme.clone(),
        }
    }
}
