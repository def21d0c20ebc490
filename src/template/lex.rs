//! Splits a template into literal text and tokenised actions.

use super::ParseError;

#[derive(Clone, Debug, PartialEq)]
pub(crate) enum Tok {
    /// Function name or keyword.
    Ident(String),
    /// `$name.A.B`; an empty name is the root `$`.
    Var(String, Vec<String>),
    /// `.A.B` on the current dot.
    Field(Vec<String>),
    Dot,
    Str(String),
    Int(i64),
    Bool(bool),
    Declare,
    Assign,
    LParen,
    RParen,
    Pipe,
}

#[derive(Debug)]
pub(crate) enum Item {
    Text(String),
    Action { line: usize, toks: Vec<Tok> },
}

const OPEN: &str = "{{";
const CLOSE: &str = "}}";

pub(crate) fn lex(src: &str) -> Result<Vec<Item>, ParseError> {
    let mut items = Vec::new();
    let mut rest = src;
    let mut trim_next = false;

    loop {
        let text_end = rest.find(OPEN).unwrap_or(rest.len());
        let mut text = &rest[..text_end];
        if trim_next {
            text = text.trim_start();
        }
        rest = &rest[text_end..];
        if rest.is_empty() {
            push_text(&mut items, text);
            return Ok(items);
        }

        let line = line_of(src, rest);
        rest = &rest[OPEN.len()..];

        if let Some(after) = trim_marker(rest) {
            text = text.trim_end();
            rest = after;
        }
        push_text(&mut items, text);

        let trimmed = rest.trim_start();
        if let Some(comment) = trimmed.strip_prefix("/*") {
            let end = comment
                .find("*/")
                .ok_or_else(|| ParseError::new(line, "unclosed comment"))?;
            let after = comment[end + 2..].trim_start();
            (rest, trim_next) = close_action(after, line)?;
            continue;
        }

        let (toks, after, trim) = lex_action(rest, line)?;
        items.push(Item::Action { line, toks });
        rest = after;
        trim_next = trim;
    }
}

fn push_text(items: &mut Vec<Item>, text: &str) {
    if !text.is_empty() {
        items.push(Item::Text(text.to_owned()));
    }
}

fn line_of(src: &str, rest: &str) -> usize {
    let offset = src.len() - rest.len();
    src[..offset].bytes().filter(|b| *b == b'\n').count() + 1
}

/// `{{- ` : a dash followed by whitespace right after the delimiter.
fn trim_marker(s: &str) -> Option<&str> {
    let after = s.strip_prefix('-')?;
    after.starts_with(|c: char| c.is_ascii_whitespace()).then_some(after)
}

/// Consumes `}}` or `-}}` (the latter only after whitespace, which the caller
/// has already skipped). Returns the remainder and whether to trim after.
fn close_action(s: &str, line: usize) -> Result<(&str, bool), ParseError> {
    if let Some(after) = s.strip_prefix("-}}") {
        return Ok((after, true));
    }
    if let Some(after) = s.strip_prefix(CLOSE) {
        return Ok((after, false));
    }
    Err(ParseError::new(line, "unclosed action"))
}

fn lex_action(mut s: &str, line: usize) -> Result<(Vec<Tok>, &str, bool), ParseError> {
    let mut toks = Vec::new();

    loop {
        let trimmed = s.trim_start();
        let spaced = trimmed.len() != s.len();
        s = trimmed;

        if s.is_empty() {
            return Err(ParseError::new(line, "unclosed action"));
        }
        if s.starts_with(CLOSE) || (spaced && s.starts_with("-}}")) {
            let (after, trim) = close_action(s, line)?;
            return Ok((toks, after, trim));
        }

        let c = s.chars().next().unwrap_or_default();
        match c {
            '(' => { toks.push(Tok::LParen); s = &s[1..]; }
            ')' => { toks.push(Tok::RParen); s = &s[1..]; }
            '|' => { toks.push(Tok::Pipe); s = &s[1..]; }
            '=' => { toks.push(Tok::Assign); s = &s[1..]; }
            ':' => {
                s = s
                    .strip_prefix(":=")
                    .ok_or_else(|| ParseError::new(line, "expected :="))?;
                toks.push(Tok::Declare);
            }
            '"' => {
                let (value, after) = lex_quoted(&s[1..], line)?;
                toks.push(Tok::Str(value));
                s = after;
            }
            '`' => {
                let end = s[1..]
                    .find('`')
                    .ok_or_else(|| ParseError::new(line, "unterminated raw string"))?;
                toks.push(Tok::Str(s[1..1 + end].to_owned()));
                s = &s[end + 2..];
            }
            '$' => {
                let (name, after) = take_word(&s[1..]);
                let (fields, after) = take_fields(after);
                toks.push(Tok::Var(name.to_owned(), fields));
                s = after;
            }
            '.' => {
                let (fields, after) = take_fields(s);
                if fields.is_empty() {
                    toks.push(Tok::Dot);
                    s = &s[1..];
                } else {
                    toks.push(Tok::Field(fields));
                    s = after;
                }
            }
            '-' | '0'..='9' => {
                let digits_start = usize::from(c == '-');
                let len = s[digits_start..]
                    .find(|c: char| !c.is_ascii_digit())
                    .unwrap_or(s.len() - digits_start);
                if len == 0 {
                    return Err(ParseError::new(line, format!("bad number syntax near {:?}", truncate(s))));
                }
                let end = digits_start + len;
                let n = s[..end]
                    .parse()
                    .map_err(|_| ParseError::new(line, format!("bad number {:?}", &s[..end])))?;
                toks.push(Tok::Int(n));
                s = &s[end..];
            }
            c if is_word_char(c) => {
                let (word, after) = take_word(s);
                toks.push(match word {
                    "true" => Tok::Bool(true),
                    "false" => Tok::Bool(false),
                    _ => Tok::Ident(word.to_owned()),
                });
                s = after;
            }
            other => {
                return Err(ParseError::new(line, format!("unexpected {other:?} in action")));
            }
        }
    }
}

fn lex_quoted(s: &str, line: usize) -> Result<(String, &str), ParseError> {
    let mut value = String::new();
    let mut chars = s.char_indices();
    while let Some((i, c)) = chars.next() {
        match c {
            '"' => return Ok((value, &s[i + 1..])),
            '\\' => match chars.next() {
                Some((_, 'n')) => value.push('\n'),
                Some((_, 't')) => value.push('\t'),
                Some((_, '\\')) => value.push('\\'),
                Some((_, '"')) => value.push('"'),
                Some((_, other)) => {
                    return Err(ParseError::new(line, format!("unknown escape \\{other}")));
                }
                None => break,
            },
            '\n' => break,
            c => value.push(c),
        }
    }
    Err(ParseError::new(line, "unterminated quoted string"))
}

fn is_word_char(c: char) -> bool {
    c == '_' || c.is_alphanumeric()
}

fn take_word(s: &str) -> (&str, &str) {
    let end = s.find(|c: char| !is_word_char(c)).unwrap_or(s.len());
    s.split_at(end)
}

/// Reads a `.A.B` chain; stops at the first `.` not followed by a word.
fn take_fields(mut s: &str) -> (Vec<String>, &str) {
    let mut fields = Vec::new();
    while let Some(after_dot) = s.strip_prefix('.') {
        let (word, after) = take_word(after_dot);
        if word.is_empty() {
            break;
        }
        fields.push(word.to_owned());
        s = after;
    }
    (fields, s)
}

fn truncate(s: &str) -> &str {
    &s[..s.char_indices().nth(8).map_or(s.len(), |(i, _)| i)]
}
