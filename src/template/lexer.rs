//! Two-level scanner for template source.
//!
//! [`scan`] splits the source into literal text and `{{...}}` tags in one
//! left-to-right pass, dropping comments and applying `~` whitespace
//! control. [`tokenize`] then breaks a single tag body into argument tokens.

use serde_json::Number;

use crate::error::TemplateParseError;

/// Longest tag excerpt carried in a parse error.
const MAX_FRAGMENT_CHARS: usize = 80;

#[derive(Debug, Clone, PartialEq)]
pub enum Segment<'a> {
    Text(String),
    Tag {
        /// Tag content between the delimiters, `~` markers removed.
        body: &'a str,
        /// Byte offset of `body` in the source.
        body_offset: usize,
        /// The whole tag including delimiters, for error fragments.
        raw: &'a str,
        /// Byte offset of the opening `{{`.
        offset: usize,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Str(String),
    Number(Number),
    Bool(bool),
    Null,
    /// Identifier or variable path (`name`, `this.title`, `@index`, `email-SendEmail`).
    Ident(String),
    /// `key=`; the value follows as the next token.
    Key(String),
    LParen,
    RParen,
}

pub fn fragment(raw: &str) -> String {
    if raw.chars().count() <= MAX_FRAGMENT_CHARS {
        return raw.to_owned();
    }
    let mut cut: String = raw.chars().take(MAX_FRAGMENT_CHARS).collect();
    cut.push('…');
    cut
}

pub fn scan(source: &str) -> Result<Vec<Segment<'_>>, TemplateParseError> {
    let mut segments = Vec::new();
    let mut pos = 0;
    let mut trim_next = false;

    while pos < source.len() {
        let Some(rel) = source[pos..].find("{{") else {
            push_text(&mut segments, &source[pos..], trim_next, false);
            break;
        };
        let start = pos + rel;
        let text = &source[pos..start];

        let triple = source[start + 2..].starts_with('{');
        let mut body_start = start + 2 + usize::from(triple);
        let trim_before = source[body_start..].starts_with('~');
        if trim_before {
            body_start += 1;
        }

        let rest = &source[body_start..];
        if rest.starts_with("!--") {
            let plain = rest.find("--}}").map(|i| (i, 4, false));
            let tilde = rest.find("--~}}").map(|i| (i, 5, true));
            let close = match (plain, tilde) {
                (Some(a), Some(b)) => Some(if a.0 < b.0 { a } else { b }),
                (a, b) => a.or(b),
            };
            let Some((end_rel, close_len, trim_after)) = close else {
                return Err(unterminated(source, start, "comment"));
            };
            push_text(&mut segments, text, trim_next, trim_before);
            trim_next = trim_after;
            pos = body_start + end_rel + close_len;
            continue;
        }
        if rest.starts_with('!') {
            let Some(end_rel) = rest.find("}}") else {
                return Err(unterminated(source, start, "comment"));
            };
            let end = body_start + end_rel;
            let trim_after = source[..end].ends_with('~');
            push_text(&mut segments, text, trim_next, trim_before);
            trim_next = trim_after;
            pos = end + 2;
            continue;
        }

        let close = if triple { "}}}" } else { "}}" };
        let Some(body_end) = find_close(source, body_start, close) else {
            return Err(unterminated(source, start, "tag"));
        };
        let tag_end = body_end + close.len();
        let (body_end, trim_after) = if source[..body_end].ends_with('~') {
            (body_end - 1, true)
        } else {
            (body_end, false)
        };

        push_text(&mut segments, text, trim_next, trim_before);
        segments.push(Segment::Tag {
            body: &source[body_start..body_end.max(body_start)],
            body_offset: body_start,
            raw: &source[start..tag_end],
            offset: start,
        });
        trim_next = trim_after;
        pos = tag_end;
    }

    Ok(segments)
}

fn push_text(segments: &mut Vec<Segment<'_>>, text: &str, trim_start: bool, trim_end: bool) {
    let mut text = text;
    if trim_start {
        text = text.trim_start();
    }
    if trim_end {
        text = text.trim_end();
    }
    if !text.is_empty() {
        segments.push(Segment::Text(text.to_owned()));
    }
}

/// Find `close` at or after `from`, skipping over quoted strings.
fn find_close(source: &str, from: usize, close: &str) -> Option<usize> {
    let mut quote: Option<char> = None;
    let mut escaped = false;
    for (i, c) in source[from..].char_indices() {
        let at = from + i;
        if let Some(q) = quote {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == q {
                quote = None;
            }
            continue;
        }
        if c == '"' || c == '\'' {
            quote = Some(c);
        } else if source[at..].starts_with(close) {
            return Some(at);
        }
    }
    None
}

fn unterminated(source: &str, offset: usize, what: &str) -> TemplateParseError {
    let line_end = source[offset..]
        .find('\n')
        .map_or(source.len(), |n| offset + n);
    TemplateParseError::at(
        source,
        offset,
        format!("unterminated {what}"),
        &fragment(&source[offset..line_end]),
    )
}

/// Tokenize one tag body. Offsets are absolute positions in `source`.
pub fn tokenize(
    source: &str,
    body: &str,
    body_offset: usize,
    raw: &str,
) -> Result<Vec<(Token, usize)>, TemplateParseError> {
    let mut tokens = Vec::new();
    let mut chars = body.char_indices().peekable();
    let err = |at: usize, msg: &str| TemplateParseError::at(source, body_offset + at, msg, &fragment(raw));

    while let Some(&(i, c)) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
            continue;
        }
        match c {
            '(' => {
                chars.next();
                tokens.push((Token::LParen, body_offset + i));
            }
            ')' => {
                chars.next();
                tokens.push((Token::RParen, body_offset + i));
            }
            '"' | '\'' => {
                chars.next();
                let mut value = String::new();
                let mut closed = false;
                while let Some((_, ch)) = chars.next() {
                    match ch {
                        '\\' => match chars.next() {
                            Some((_, 'n')) => value.push('\n'),
                            Some((_, 't')) => value.push('\t'),
                            Some((_, other)) => value.push(other),
                            None => break,
                        },
                        q if q == c => {
                            closed = true;
                            break;
                        }
                        other => value.push(other),
                    }
                }
                if !closed {
                    return Err(err(i, "unterminated string literal"));
                }
                tokens.push((Token::Str(value), body_offset + i));
            }
            '=' => return Err(err(i, "named argument is missing its name")),
            _ => {
                let mut word = String::new();
                while let Some(&(_, ch)) = chars.peek() {
                    if ch.is_whitespace() || matches!(ch, '(' | ')' | '=' | '"' | '\'') {
                        break;
                    }
                    word.push(ch);
                    chars.next();
                }
                if let Some(&(_, '=')) = chars.peek() {
                    chars.next();
                    if !is_identifier(&word) {
                        return Err(err(i, "malformed named argument"));
                    }
                    tokens.push((Token::Key(word), body_offset + i));
                    continue;
                }
                tokens.push((classify_word(word), body_offset + i));
            }
        }
    }

    Ok(tokens)
}

fn classify_word(word: String) -> Token {
    match word.as_str() {
        "true" => return Token::Bool(true),
        "false" => return Token::Bool(false),
        "null" | "undefined" => return Token::Null,
        _ => {}
    }
    if looks_numeric(&word) {
        if let Ok(n) = word.parse::<i64>() {
            return Token::Number(Number::from(n));
        }
        if let Some(n) = word.parse::<f64>().ok().and_then(Number::from_f64) {
            return Token::Number(n);
        }
    }
    Token::Ident(word)
}

fn looks_numeric(word: &str) -> bool {
    let digits = word.strip_prefix('-').unwrap_or(word);
    digits.chars().next().is_some_and(|c| c.is_ascii_digit())
}

fn is_identifier(word: &str) -> bool {
    !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_alphanumeric() || matches!(c, '_' | '-' | '@' | '$'))
}
