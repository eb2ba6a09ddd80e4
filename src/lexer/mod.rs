use logos::Logos;

pub mod source_map;
pub use source_map::SourceMap;

/// Byte range within source text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

#[derive(Logos, Debug, PartialEq, Clone)]
#[logos(skip r"[ \t\r\n]+")]
#[logos(skip("//[^\n]*", allow_greedy = true))]
pub enum Token {
    // Single-character punctuation
    #[token("(")]
    LeftParen,
    #[token(")")]
    RightParen,
    #[token("{")]
    LeftBrace,
    #[token("}")]
    RightBrace,
    #[token(",")]
    Comma,
    #[token(".")]
    Dot,
    #[token("-")]
    Minus,
    #[token("+")]
    Plus,
    #[token(";")]
    Semicolon,
    #[token("/")]
    Slash,
    #[token("*")]
    Star,

    // One- or two-character operators
    #[token("!")]
    Bang,
    #[token("!=")]
    BangEqual,
    #[token("=")]
    Equal,
    #[token("==")]
    EqualEqual,
    #[token(">")]
    Greater,
    #[token(">=")]
    GreaterEqual,
    #[token("<")]
    Less,
    #[token("<=")]
    LessEqual,

    // Keywords
    #[token("and")]
    And,
    #[token("class")]
    Class,
    #[token("else")]
    Else,
    #[token("false")]
    False,
    #[token("for")]
    For,
    #[token("fun")]
    Fun,
    #[token("if")]
    If,
    #[token("nil")]
    Nil,
    #[token("or")]
    Or,
    #[token("print")]
    Print,
    #[token("return")]
    Return,
    #[token("super")]
    Super,
    #[token("this")]
    This,
    #[token("true")]
    True,
    #[token("var")]
    Var,
    #[token("while")]
    While,

    // Literals
    #[regex(r"[0-9]+(\.[0-9]+)?", |lex| lex.slice().parse::<f64>().ok())]
    Number(f64),

    // Strings have no escape sequences and may span lines.
    #[regex(r#""[^"]*""#, |lex| {
        let s = lex.slice();
        Some(s[1..s.len() - 1].to_string())
    })]
    Str(String),

    #[regex(r"[A-Za-z_][A-Za-z0-9_]*", |lex| lex.slice().to_string())]
    Identifier(String),
}

#[derive(Debug, thiserror::Error)]
#[error("scan error at offset {}: {message}", span.start)]
pub struct ScanError {
    pub span: Span,
    pub message: String,
}

/// Lex source into tokens with byte spans. Unrecognized input does not abort
/// the scan; each bad stretch becomes a `ScanError` and lexing continues, so
/// one pass can report every scan-level problem alongside parse errors.
pub fn lex(source: &str) -> (Vec<(Token, Span)>, Vec<ScanError>) {
    let mut lexer = Token::lexer(source);
    let mut tokens = Vec::new();
    let mut errors = Vec::new();

    while let Some(result) = lexer.next() {
        let span = lexer.span();
        let span = Span { start: span.start, end: span.end };
        match result {
            Ok(token) => tokens.push((token, span)),
            Err(()) => {
                let snippet = &source[span.start..span.end];
                let message = if snippet.starts_with('"') {
                    "unterminated string".to_string()
                } else {
                    format!("unexpected character '{snippet}'")
                };
                errors.push(ScanError { span, message });
            }
        }
    }

    (tokens, errors)
}
