//! Tokenizer for the kernel language.
//!
//! Invalid characters and malformed literals are reported to the session and
//! skipped, so the parser always receives a well-formed token stream ending in
//! [`TokenKind::Eof`].

use crate::core::{CompileSession, Span};
use crate::frontend::ast::Type;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TokenKind {
    Ident,
    Int { value: u64, suffix: Option<Type> },
    Float(f64),

    // Keywords
    Fn,
    Pub,
    Extern,
    Let,
    Mut,
    If,
    Else,
    While,
    Return,
    True,
    False,
    As,

    // Punctuation
    LParen,
    RParen,
    LBrace,
    RBrace,
    Comma,
    Colon,
    Semi,
    Arrow,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Amp,
    AmpAmp,
    Pipe,
    PipePipe,
    Caret,
    Shl,
    Shr,
    Bang,
    Assign,
    EqEq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    PlusEq,
    MinusEq,
    StarEq,
    SlashEq,

    Eof,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Token<'a> {
    pub kind: TokenKind,
    pub text: &'a str,
    pub span: Span,
}

fn keyword(text: &str) -> Option<TokenKind> {
    Some(match text {
        "fn" => TokenKind::Fn,
        "pub" => TokenKind::Pub,
        "extern" => TokenKind::Extern,
        "let" => TokenKind::Let,
        "mut" => TokenKind::Mut,
        "if" => TokenKind::If,
        "else" => TokenKind::Else,
        "while" => TokenKind::While,
        "return" => TokenKind::Return,
        "true" => TokenKind::True,
        "false" => TokenKind::False,
        "as" => TokenKind::As,
        _ => return None,
    })
}

/// Split the session source into tokens.
pub fn tokenize<'a>(session: &mut CompileSession<'a>) -> Vec<Token<'a>> {
    let source = session.source();
    let bytes = source.as_bytes();
    let mut tokens = Vec::new();
    let mut pos = 0;

    while pos < bytes.len() {
        let ch = bytes[pos];

        if ch.is_ascii_whitespace() {
            pos += 1;
            continue;
        }

        // Line comment
        if ch == b'/' && bytes.get(pos + 1) == Some(&b'/') {
            while pos < bytes.len() && bytes[pos] != b'\n' {
                pos += 1;
            }
            continue;
        }

        let start = pos;

        if ch.is_ascii_alphabetic() || ch == b'_' {
            while pos < bytes.len() && (bytes[pos].is_ascii_alphanumeric() || bytes[pos] == b'_') {
                pos += 1;
            }
            let text = &source[start..pos];
            let kind = keyword(text).unwrap_or(TokenKind::Ident);
            tokens.push(Token {
                kind,
                text,
                span: Span::new(start, pos),
            });
            continue;
        }

        if ch.is_ascii_digit() {
            pos = lex_number(session, source, start, &mut tokens);
            continue;
        }

        let two = bytes.get(pos + 1).copied();
        let (kind, len) = match (ch, two) {
            (b'-', Some(b'>')) => (TokenKind::Arrow, 2),
            (b'&', Some(b'&')) => (TokenKind::AmpAmp, 2),
            (b'|', Some(b'|')) => (TokenKind::PipePipe, 2),
            (b'<', Some(b'<')) => (TokenKind::Shl, 2),
            (b'>', Some(b'>')) => (TokenKind::Shr, 2),
            (b'=', Some(b'=')) => (TokenKind::EqEq, 2),
            (b'!', Some(b'=')) => (TokenKind::Ne, 2),
            (b'<', Some(b'=')) => (TokenKind::Le, 2),
            (b'>', Some(b'=')) => (TokenKind::Ge, 2),
            (b'+', Some(b'=')) => (TokenKind::PlusEq, 2),
            (b'-', Some(b'=')) => (TokenKind::MinusEq, 2),
            (b'*', Some(b'=')) => (TokenKind::StarEq, 2),
            (b'/', Some(b'=')) => (TokenKind::SlashEq, 2),
            (b'(', _) => (TokenKind::LParen, 1),
            (b')', _) => (TokenKind::RParen, 1),
            (b'{', _) => (TokenKind::LBrace, 1),
            (b'}', _) => (TokenKind::RBrace, 1),
            (b',', _) => (TokenKind::Comma, 1),
            (b':', _) => (TokenKind::Colon, 1),
            (b';', _) => (TokenKind::Semi, 1),
            (b'+', _) => (TokenKind::Plus, 1),
            (b'-', _) => (TokenKind::Minus, 1),
            (b'*', _) => (TokenKind::Star, 1),
            (b'/', _) => (TokenKind::Slash, 1),
            (b'%', _) => (TokenKind::Percent, 1),
            (b'&', _) => (TokenKind::Amp, 1),
            (b'|', _) => (TokenKind::Pipe, 1),
            (b'^', _) => (TokenKind::Caret, 1),
            (b'!', _) => (TokenKind::Bang, 1),
            (b'=', _) => (TokenKind::Assign, 1),
            (b'<', _) => (TokenKind::Lt, 1),
            (b'>', _) => (TokenKind::Gt, 1),
            _ => {
                // Skip the whole (possibly multi-byte) character.
                let len = source[pos..].chars().next().map_or(1, char::len_utf8);
                session.error(
                    Span::new(pos, pos + len),
                    format!("unexpected character `{}`", &source[pos..pos + len]),
                );
                pos += len;
                continue;
            }
        };

        pos += len;
        tokens.push(Token {
            kind,
            text: &source[start..pos],
            span: Span::new(start, pos),
        });
    }

    tokens.push(Token {
        kind: TokenKind::Eof,
        text: "",
        span: Span::new(source.len(), source.len()),
    });
    tokens
}

/// Lex an integer or float literal starting at `start`, returning the new position.
fn lex_number<'a>(
    session: &mut CompileSession<'a>,
    source: &'a str,
    start: usize,
    tokens: &mut Vec<Token<'a>>,
) -> usize {
    let bytes = source.as_bytes();
    let mut pos = start;
    while pos < bytes.len() && (bytes[pos].is_ascii_digit() || bytes[pos] == b'_') {
        pos += 1;
    }

    let mut is_float = false;
    if pos + 1 < bytes.len() && bytes[pos] == b'.' && bytes[pos + 1].is_ascii_digit() {
        is_float = true;
        pos += 1;
        while pos < bytes.len() && (bytes[pos].is_ascii_digit() || bytes[pos] == b'_') {
            pos += 1;
        }
    }
    let digits_end = pos;

    // Type suffix: i32, i64, f64
    while pos < bytes.len() && bytes[pos].is_ascii_alphanumeric() {
        pos += 1;
    }
    let suffix_text = &source[digits_end..pos];
    let digits: String = source[start..digits_end].chars().filter(|&c| c != '_').collect();
    let span = Span::new(start, pos);

    let suffix = match suffix_text {
        "" => None,
        "i32" => Some(Type::I32),
        "i64" => Some(Type::I64),
        "f64" => Some(Type::F64),
        other => {
            session.error(span, format!("invalid literal suffix `{}`", other));
            None
        }
    };

    let kind = if is_float || suffix == Some(Type::F64) {
        if suffix.is_some() && suffix != Some(Type::F64) {
            session.error(span, "float literal with integer suffix");
        }
        match digits.parse::<f64>() {
            Ok(value) => TokenKind::Float(value),
            Err(_) => {
                session.error(span, "malformed float literal");
                TokenKind::Float(0.0)
            }
        }
    } else {
        match digits.parse::<u64>() {
            Ok(value) => TokenKind::Int { value, suffix },
            Err(_) => {
                session.error(span, "integer literal is too large");
                TokenKind::Int { value: 0, suffix }
            }
        }
    };

    tokens.push(Token {
        kind,
        text: &source[start..pos],
        span,
    });
    pos
}

#[cfg(test)]
mod tests {
    use super::*;
    use bumpalo::Bump;

    fn kinds(src: &str) -> (Vec<TokenKind>, usize) {
        let arena = Bump::new();
        let mut session = CompileSession::new(&arena, "", src);
        let kinds = tokenize(&mut session).into_iter().map(|t| t.kind).collect();
        (kinds, session.error_count())
    }

    #[test]
    fn test_keywords_and_operators() {
        let (kinds, errors) = kinds("pub fn f(x: i64) -> i64 { x += 1; x << 2 }");
        assert_eq!(errors, 0);
        assert_eq!(kinds[0], TokenKind::Pub);
        assert_eq!(kinds[1], TokenKind::Fn);
        assert!(kinds.contains(&TokenKind::Arrow));
        assert!(kinds.contains(&TokenKind::PlusEq));
        assert!(kinds.contains(&TokenKind::Shl));
        assert_eq!(*kinds.last().unwrap(), TokenKind::Eof);
    }

    #[test]
    fn test_numeric_literals() {
        let (kinds, errors) = kinds("42 7i32 1_000i64 2.5 3f64");
        assert_eq!(errors, 0);
        assert_eq!(kinds[0], TokenKind::Int { value: 42, suffix: None });
        assert_eq!(kinds[1], TokenKind::Int { value: 7, suffix: Some(Type::I32) });
        assert_eq!(kinds[2], TokenKind::Int { value: 1000, suffix: Some(Type::I64) });
        assert_eq!(kinds[3], TokenKind::Float(2.5));
        assert_eq!(kinds[4], TokenKind::Float(3.0));
    }

    #[test]
    fn test_bad_characters_are_reported_and_skipped() {
        let (kinds, errors) = kinds("let x = 1 $ 2; // trailing comment");
        assert_eq!(errors, 1);
        assert!(!kinds.is_empty());
        assert_eq!(kinds.iter().filter(|k| matches!(k, TokenKind::Int { .. })).count(), 2);
    }

    #[test]
    fn test_literal_overflow() {
        let (_, errors) = kinds("99999999999999999999999");
        assert_eq!(errors, 1);
    }
}
