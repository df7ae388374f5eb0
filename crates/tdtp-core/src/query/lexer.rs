//! TDTQL lexer.
//!
//! Byte-offset-preserving tokenizer. Keywords are case-insensitive;
//! identifiers are `[A-Za-z_][A-Za-z0-9_]*`; strings are single- or
//! double-quoted with backslash escapes; numbers take an optional
//! leading `-` and at most one `.`. Anything else becomes an `Illegal`
//! token that the parser reports with its byte offset.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    Select,
    From,
    Where,
    And,
    Or,
    Not,
    In,
    Between,
    Like,
    Is,
    Null,
    Order,
    By,
    Asc,
    Desc,
    Limit,
    Offset,
    Ident,
    Number,
    Str,
    Star,
    Comma,
    LParen,
    RParen,
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    Illegal,
    Eof,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    /// Literal text; for `Str` the unescaped content, for `Illegal` the
    /// offending input slice.
    pub literal: String,
    /// Byte offset of the first input byte of the token.
    pub offset: usize,
}

fn keyword(word: &str) -> Option<TokenKind> {
    let upper = word.to_ascii_uppercase();
    Some(match upper.as_str() {
        "SELECT" => TokenKind::Select,
        "FROM" => TokenKind::From,
        "WHERE" => TokenKind::Where,
        "AND" => TokenKind::And,
        "OR" => TokenKind::Or,
        "NOT" => TokenKind::Not,
        "IN" => TokenKind::In,
        "BETWEEN" => TokenKind::Between,
        "LIKE" => TokenKind::Like,
        "IS" => TokenKind::Is,
        "NULL" => TokenKind::Null,
        "ORDER" => TokenKind::Order,
        "BY" => TokenKind::By,
        "ASC" => TokenKind::Asc,
        "DESC" => TokenKind::Desc,
        "LIMIT" => TokenKind::Limit,
        "OFFSET" => TokenKind::Offset,
        _ => return None,
    })
}

/// Tokenize the whole input. The result always ends with an `Eof` token
/// carrying the input length as its offset.
pub fn tokenize(input: &str) -> Vec<Token> {
    let bytes = input.as_bytes();
    let mut tokens = Vec::new();
    let mut pos = 0;

    while pos < bytes.len() {
        let b = bytes[pos];
        if b.is_ascii_whitespace() {
            pos += 1;
            continue;
        }
        let start = pos;
        let token = match b {
            b'*' => one(TokenKind::Star, "*", start, &mut pos),
            b',' => one(TokenKind::Comma, ",", start, &mut pos),
            b'(' => one(TokenKind::LParen, "(", start, &mut pos),
            b')' => one(TokenKind::RParen, ")", start, &mut pos),
            b'=' => one(TokenKind::Eq, "=", start, &mut pos),
            b'>' => {
                if bytes.get(pos + 1) == Some(&b'=') {
                    two(TokenKind::Gte, ">=", start, &mut pos)
                } else {
                    one(TokenKind::Gt, ">", start, &mut pos)
                }
            }
            b'<' => {
                if bytes.get(pos + 1) == Some(&b'=') {
                    two(TokenKind::Lte, "<=", start, &mut pos)
                } else if bytes.get(pos + 1) == Some(&b'>') {
                    two(TokenKind::Ne, "<>", start, &mut pos)
                } else {
                    one(TokenKind::Lt, "<", start, &mut pos)
                }
            }
            b'!' => {
                if bytes.get(pos + 1) == Some(&b'=') {
                    two(TokenKind::Ne, "!=", start, &mut pos)
                } else {
                    one(TokenKind::Illegal, "!", start, &mut pos)
                }
            }
            b'\'' | b'"' => lex_string(input, start, &mut pos),
            b'-' => {
                if bytes.get(pos + 1).is_some_and(|n| n.is_ascii_digit()) {
                    lex_number(input, start, &mut pos)
                } else {
                    one(TokenKind::Illegal, "-", start, &mut pos)
                }
            }
            b'0'..=b'9' => lex_number(input, start, &mut pos),
            b if b.is_ascii_alphabetic() || b == b'_' => lex_word(input, start, &mut pos),
            _ => {
                // consume one (possibly multi-byte) character
                let ch_len = input[start..].chars().next().map_or(1, |c| c.len_utf8());
                pos += ch_len;
                Token {
                    kind: TokenKind::Illegal,
                    literal: input[start..pos].to_string(),
                    offset: start,
                }
            }
        };
        tokens.push(token);
    }

    tokens.push(Token {
        kind: TokenKind::Eof,
        literal: String::new(),
        offset: bytes.len(),
    });
    tokens
}

fn one(kind: TokenKind, literal: &str, start: usize, pos: &mut usize) -> Token {
    *pos += 1;
    Token { kind, literal: literal.to_string(), offset: start }
}

fn two(kind: TokenKind, literal: &str, start: usize, pos: &mut usize) -> Token {
    *pos += 2;
    Token { kind, literal: literal.to_string(), offset: start }
}

fn lex_word(input: &str, start: usize, pos: &mut usize) -> Token {
    let bytes = input.as_bytes();
    while *pos < bytes.len() && (bytes[*pos].is_ascii_alphanumeric() || bytes[*pos] == b'_') {
        *pos += 1;
    }
    let word = &input[start..*pos];
    Token {
        kind: keyword(word).unwrap_or(TokenKind::Ident),
        literal: word.to_string(),
        offset: start,
    }
}

fn lex_number(input: &str, start: usize, pos: &mut usize) -> Token {
    let bytes = input.as_bytes();
    if bytes[*pos] == b'-' {
        *pos += 1;
    }
    let mut seen_dot = false;
    while *pos < bytes.len() {
        match bytes[*pos] {
            b'0'..=b'9' => *pos += 1,
            b'.' if !seen_dot && bytes.get(*pos + 1).is_some_and(|n| n.is_ascii_digit()) => {
                seen_dot = true;
                *pos += 1;
            }
            _ => break,
        }
    }
    Token {
        kind: TokenKind::Number,
        literal: input[start..*pos].to_string(),
        offset: start,
    }
}

fn lex_string(input: &str, start: usize, pos: &mut usize) -> Token {
    let quote = input.as_bytes()[start] as char;
    let mut literal = String::new();
    let mut escaped = false;

    for (i, ch) in input[start + 1..].char_indices() {
        if escaped {
            literal.push(ch);
            escaped = false;
            continue;
        }
        match ch {
            '\\' => escaped = true,
            c if c == quote => {
                *pos = start + 1 + i + c.len_utf8();
                return Token { kind: TokenKind::Str, literal, offset: start };
            }
            c => literal.push(c),
        }
    }

    // unterminated string
    *pos = input.len();
    Token {
        kind: TokenKind::Illegal,
        literal: input[start..].to_string(),
        offset: start,
    }
}
