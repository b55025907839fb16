//! Minimal SQL lexer.
//!
//! Just enough structure that dialect rewrites can never fire inside a
//! string or quoted identifier: words, quoted identifiers with doubled-quote
//! escapes, single-quoted strings, numbers, `::`, punctuation. Comments
//! (`--` and `/* */`) are consumed and discarded.

use crate::{Result, SnowglobeError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenKind {
    /// Unquoted identifier or keyword, original case preserved.
    Word(String),
    /// `"..."` quoted identifier; the payload has `""` collapsed to `"`.
    Quoted(String),
    /// `'...'` string literal; the payload keeps `''` escapes verbatim.
    Str(String),
    Number(String),
    /// The `::` cast operator.
    Cast,
    Punct(char),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub kind: TokenKind,
    /// Byte offset of the first character in the source text.
    pub start: usize,
    /// Byte offset one past the last character.
    pub end: usize,
}

impl Token {
    /// Case-insensitive keyword test; never matches quoted identifiers.
    pub fn is_kw(&self, kw: &str) -> bool {
        matches!(&self.kind, TokenKind::Word(w) if w.eq_ignore_ascii_case(kw))
    }

    pub fn is_punct(&self, c: char) -> bool {
        self.kind == TokenKind::Punct(c)
    }

    /// Identifier storage key: unquoted words fold to upper case, quoted
    /// identifiers keep their exact spelling.
    pub fn ident_key(&self) -> Option<String> {
        match &self.kind {
            TokenKind::Word(w) => Some(w.to_ascii_uppercase()),
            TokenKind::Quoted(q) => Some(q.clone()),
            _ => None,
        }
    }
}

pub fn tokenize(sql: &str) -> Result<Vec<Token>> {
    let bytes = sql.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        let c = bytes[i] as char;

        if c.is_ascii_whitespace() {
            i += 1;
            continue;
        }

        // -- line comment
        if c == '-' && bytes.get(i + 1) == Some(&b'-') {
            while i < bytes.len() && bytes[i] != b'\n' {
                i += 1;
            }
            continue;
        }

        // /* block comment */
        if c == '/' && bytes.get(i + 1) == Some(&b'*') {
            let mut j = i + 2;
            loop {
                match bytes.get(j) {
                    Some(&b'*') if bytes.get(j + 1) == Some(&b'/') => {
                        i = j + 2;
                        break;
                    }
                    Some(_) => j += 1,
                    None => {
                        return Err(SnowglobeError::Translation(
                            "unterminated block comment".to_owned(),
                        ))
                    }
                }
            }
            continue;
        }

        if c == '\'' {
            let (payload, next) = scan_quoted(sql, i, '\'')?;
            tokens.push(Token {
                kind: TokenKind::Str(payload),
                start: i,
                end: next,
            });
            i = next;
            continue;
        }

        if c == '"' {
            let (payload, next) = scan_quoted(sql, i, '"')?;
            // Doubled quotes inside a quoted identifier collapse to one.
            tokens.push(Token {
                kind: TokenKind::Quoted(payload.replace("\"\"", "\"")),
                start: i,
                end: next,
            });
            i = next;
            continue;
        }

        if c.is_ascii_digit() {
            let start = i;
            while i < bytes.len() && (bytes[i] as char).is_ascii_digit() {
                i += 1;
            }
            if bytes.get(i) == Some(&b'.') {
                i += 1;
                while i < bytes.len() && (bytes[i] as char).is_ascii_digit() {
                    i += 1;
                }
            }
            if matches!(bytes.get(i), Some(&b'e' | &b'E')) {
                let mut j = i + 1;
                if matches!(bytes.get(j), Some(&b'+' | &b'-')) {
                    j += 1;
                }
                if bytes.get(j).is_some_and(u8::is_ascii_digit) {
                    i = j;
                    while i < bytes.len() && (bytes[i] as char).is_ascii_digit() {
                        i += 1;
                    }
                }
            }
            tokens.push(Token {
                kind: TokenKind::Number(sql[start..i].to_owned()),
                start,
                end: i,
            });
            continue;
        }

        if c.is_ascii_alphabetic() || c == '_' {
            let start = i;
            while i < bytes.len() {
                let b = bytes[i] as char;
                if b.is_ascii_alphanumeric() || b == '_' || b == '$' {
                    i += 1;
                } else {
                    break;
                }
            }
            tokens.push(Token {
                kind: TokenKind::Word(sql[start..i].to_owned()),
                start,
                end: i,
            });
            continue;
        }

        if c == ':' && bytes.get(i + 1) == Some(&b':') {
            tokens.push(Token {
                kind: TokenKind::Cast,
                start: i,
                end: i + 2,
            });
            i += 2;
            continue;
        }

        tokens.push(Token {
            kind: TokenKind::Punct(c),
            start: i,
            end: i + c.len_utf8(),
        });
        i += c.len_utf8();
    }

    Ok(tokens)
}

/// Scan a `'…'` or `"…"` region starting at `start`; returns the raw payload
/// (doubled delimiters kept) and the offset past the closing delimiter.
fn scan_quoted(sql: &str, start: usize, delim: char) -> Result<(String, usize)> {
    let bytes = sql.as_bytes();
    let d = delim as u8;
    let mut i = start + 1;
    loop {
        match bytes.get(i) {
            Some(&b) if b == d => {
                if bytes.get(i + 1) == Some(&d) {
                    i += 2;
                } else {
                    return Ok((sql[start + 1..i].to_owned(), i + 1));
                }
            }
            Some(_) => i += 1,
            None => {
                return Err(SnowglobeError::Translation(format!(
                    "unterminated {delim} literal"
                )))
            }
        }
    }
}

/// Split a multi-statement text on top-level semicolons. Literals and
/// comments never split; empty statements are dropped.
pub fn split_statements(sql: &str) -> Result<Vec<String>> {
    let tokens = tokenize(sql)?;
    let mut out = Vec::new();
    let mut stmt_start: Option<usize> = None;
    let mut last_end = 0;

    for t in &tokens {
        if t.is_punct(';') {
            if let Some(s) = stmt_start.take() {
                out.push(sql[s..last_end].to_owned());
            }
        } else {
            if stmt_start.is_none() {
                stmt_start = Some(t.start);
            }
            last_end = t.end;
        }
    }
    if let Some(s) = stmt_start {
        out.push(sql[s..last_end].to_owned());
    }
    Ok(out)
}

/// Render a token stream back to SQL text. Tokens are space-separated, which
/// is always valid even if not always pretty.
pub fn render(tokens: &[Token]) -> String {
    render_kinds(tokens.iter().map(|t| &t.kind))
}

pub fn render_kinds<'a, I>(kinds: I) -> String
where
    I: IntoIterator<Item = &'a TokenKind>,
{
    let mut out = String::new();
    for kind in kinds {
        let piece = match kind {
            TokenKind::Word(w) | TokenKind::Number(w) => w.clone(),
            TokenKind::Quoted(q) => format!("\"{}\"", q.replace('"', "\"\"")),
            TokenKind::Str(s) => format!("'{s}'"),
            TokenKind::Cast => "::".to_owned(),
            TokenKind::Punct(c) => c.to_string(),
        };
        // No space before the piece after an opening paren or before
        // closers/separators; purely cosmetic, the SQL is valid either way.
        let tight = matches!(kind, TokenKind::Punct(')' | ',' | ';' | '.'))
            || out.ends_with(['(', '.'])
            || matches!(kind, TokenKind::Cast)
            || out.ends_with("::");
        if !out.is_empty() && !tight {
            out.push(' ');
        }
        out.push_str(&piece);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(sql: &str) -> Vec<TokenKind> {
        tokenize(sql).unwrap().into_iter().map(|t| t.kind).collect()
    }

    #[test]
    fn words_numbers_strings() {
        assert_eq!(
            kinds("SELECT 1.5e2, 'it''s'"),
            vec![
                TokenKind::Word("SELECT".into()),
                TokenKind::Number("1.5e2".into()),
                TokenKind::Punct(','),
                TokenKind::Str("it''s".into()),
            ]
        );
    }

    #[test]
    fn quoted_identifier_keeps_case_and_unescapes() {
        assert_eq!(
            kinds(r#"select "My""Col" from t"#),
            vec![
                TokenKind::Word("select".into()),
                TokenKind::Quoted("My\"Col".into()),
                TokenKind::Word("from".into()),
                TokenKind::Word("t".into()),
            ]
        );
    }

    #[test]
    fn comments_are_discarded() {
        assert_eq!(
            kinds("select 1 -- trailing\n/* block\nstill block */ + 2"),
            vec![
                TokenKind::Word("select".into()),
                TokenKind::Number("1".into()),
                TokenKind::Punct('+'),
                TokenKind::Number("2".into()),
            ]
        );
    }

    #[test]
    fn keywords_never_match_inside_strings() {
        // The whole point of lexing before rewriting.
        let toks = tokenize("select 'IFF the user' from t").unwrap();
        assert!(!toks.iter().any(|t| t.is_kw("IFF")));
    }

    #[test]
    fn cast_operator() {
        assert_eq!(
            kinds("x::DATE"),
            vec![
                TokenKind::Word("x".into()),
                TokenKind::Cast,
                TokenKind::Word("DATE".into()),
            ]
        );
    }

    #[test]
    fn split_respects_literals() {
        let parts = split_statements("select 'a;b'; select 2;").unwrap();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0], "select 'a;b'");
        assert_eq!(parts[1], "select 2");
    }

    #[test]
    fn unterminated_string_is_an_error() {
        assert!(tokenize("select 'oops").is_err());
    }

    #[test]
    fn render_round_trip_is_executable() {
        let sql = "INSERT INTO t VALUES (1, 'A'), (2, 'B')";
        let rendered = render(&tokenize(sql).unwrap());
        // Re-lexing the rendering yields the same token kinds.
        assert_eq!(kinds(sql), kinds(&rendered));
    }
}
