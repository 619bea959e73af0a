//! Parser for the URL-safe path query surface syntax.
//!
//! Grammar:
//!
//! ```text
//! path      := elem ("/" elem)*
//! elem      := predlist [ "(" predlist ")" [ order ("," order)* ] ]
//! predlist  := [ pred (";" pred)* ]
//! pred      := tag [ op val ("," val)* ] | tag ":absent:"
//! op        := "=" | "!=" | ":lt:" | ":leq:" | ":gt:" | ":geq:" | ":like:"
//!            | ":regexp:" | ":!regexp:" | ":ciregexp:" | ":!ciregexp:"
//!            | ":word:" | ":!word:"
//! val       := "@(" path ")" | literal
//! order     := tag (":asc:" | ":desc:")
//! ```
//!
//! Reserved characters (`/ ; , ( ) = : ! @ %`) are structural; payload
//! occurrences must be percent-encoded by the client. The parser holds no
//! mutable state beyond the operator table built once at startup.

use crate::ast::{Direction, OrderTag, Path, PathElem, PredValue, Predicate, PredicateOp};
use percent_encoding::{AsciiSet, CONTROLS, percent_decode_str, utf8_percent_encode};
use std::collections::HashMap;
use std::sync::LazyLock;
use thiserror::Error;

/// Parse failure: always a client error, never a system fault.
#[derive(Debug, Error, PartialEq)]
pub enum ParseError {
    #[error("empty path")]
    EmptyPath,

    #[error("unexpected end of input at byte {0}")]
    UnexpectedEnd(usize),

    #[error("unexpected character {found:?} at byte {pos}")]
    Unexpected { pos: usize, found: char },

    #[error("empty tag name at byte {0}")]
    EmptyTag(usize),

    #[error("unknown operator token ':{token}:' at byte {pos}")]
    UnknownOperator { pos: usize, token: String },

    #[error("invalid percent-encoding at byte {0}")]
    InvalidEncoding(usize),

    #[error("operator {op} takes no values (at byte {pos})")]
    UnexpectedValues { pos: usize, op: &'static str },
}

/// Characters that are structural in the path grammar and must be
/// percent-encoded when they appear in payload.
const RESERVED: &[char] = &['/', ';', ',', '(', ')', '=', ':', '!', '@', '%'];

const PAYLOAD_ESCAPES: &AsciiSet = &CONTROLS
    .add(b'/')
    .add(b';')
    .add(b',')
    .add(b'(')
    .add(b')')
    .add(b'=')
    .add(b':')
    .add(b'!')
    .add(b'@')
    .add(b'%')
    .add(b' ');

/// Percent-encode a payload string for embedding in path syntax.
pub fn encode_payload(s: &str) -> String {
    utf8_percent_encode(s, PAYLOAD_ESCAPES).to_string()
}

static OP_TOKENS: LazyLock<HashMap<&'static str, PredicateOp>> = LazyLock::new(|| {
    HashMap::from([
        ("absent", PredicateOp::Absent),
        ("lt", PredicateOp::Lt),
        ("leq", PredicateOp::Leq),
        ("gt", PredicateOp::Gt),
        ("geq", PredicateOp::Geq),
        ("like", PredicateOp::Like),
        ("regexp", PredicateOp::Regexp),
        ("!regexp", PredicateOp::NotRegexp),
        ("ciregexp", PredicateOp::CiRegexp),
        ("!ciregexp", PredicateOp::NotCiRegexp),
        ("word", PredicateOp::Word),
        ("!word", PredicateOp::NotWord),
    ])
});

/// Parse a complete path. Trailing input is an error.
pub fn parse_path(input: &str) -> Result<Path, ParseError> {
    let mut s = Scanner::new(input);
    let path = parse_path_inner(&mut s, false)?;
    match s.peek() {
        None => Ok(path),
        Some(found) => Err(ParseError::Unexpected { pos: s.pos, found }),
    }
}

struct Scanner<'a> {
    src: &'a str,
    pos: usize,
}

impl<'a> Scanner<'a> {
    fn new(src: &'a str) -> Self {
        Self { src, pos: 0 }
    }

    fn rest(&self) -> &'a str {
        &self.src[self.pos..]
    }

    fn peek(&self) -> Option<char> {
        self.rest().chars().next()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += c.len_utf8();
        Some(c)
    }

    fn eat(&mut self, c: char) -> bool {
        if self.peek() == Some(c) {
            self.bump();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, c: char) -> Result<(), ParseError> {
        match self.peek() {
            Some(found) if found == c => {
                self.bump();
                Ok(())
            }
            Some(found) => Err(ParseError::Unexpected {
                pos: self.pos,
                found,
            }),
            None => Err(ParseError::UnexpectedEnd(self.pos)),
        }
    }

    /// Scan raw payload up to the next reserved character and percent-decode.
    fn scan_payload(&mut self) -> Result<String, ParseError> {
        let start = self.pos;
        while let Some(c) = self.peek() {
            if RESERVED.contains(&c) && c != '%' {
                break;
            }
            if c == '%' {
                // Keep the escape sequence raw for the decoder below.
                self.bump();
                continue;
            }
            self.bump();
        }
        let raw = &self.src[start..self.pos];
        percent_decode_str(raw)
            .decode_utf8()
            .map(|cow| cow.into_owned())
            .map_err(|_| ParseError::InvalidEncoding(start))
    }

    /// Scan a `:token:` operator body after the opening `:` was consumed.
    fn scan_op_token(&mut self) -> Result<String, ParseError> {
        let start = self.pos;
        while let Some(c) = self.peek() {
            if c == ':' {
                let token = self.src[start..self.pos].to_string();
                self.bump();
                return Ok(token);
            }
            if c.is_ascii_alphanumeric() || c == '!' {
                self.bump();
            } else {
                return Err(ParseError::Unexpected {
                    pos: self.pos,
                    found: c,
                });
            }
        }
        Err(ParseError::UnexpectedEnd(self.pos))
    }
}

fn parse_path_inner(s: &mut Scanner<'_>, nested: bool) -> Result<Path, ParseError> {
    let mut elems = vec![parse_elem(s, nested)?];
    while s.eat('/') {
        elems.push(parse_elem(s, nested)?);
    }
    Ok(Path { elems })
}

fn at_elem_end(s: &Scanner<'_>, nested: bool) -> bool {
    match s.peek() {
        None => true,
        Some('/') => true,
        Some(')') => nested,
        _ => false,
    }
}

fn parse_elem(s: &mut Scanner<'_>, nested: bool) -> Result<PathElem, ParseError> {
    let subjpreds = parse_predlist(s, nested)?;

    let mut listpreds = Vec::new();
    let mut ordertags = Vec::new();
    if s.eat('(') {
        // Inside the projection group the closing paren is always a
        // terminator, whatever the nesting level.
        listpreds = parse_predlist(s, true)?;
        s.expect(')')?;
        ordertags = parse_ordertags(s, nested)?;
    }

    if subjpreds.is_empty() && listpreds.is_empty() && ordertags.is_empty() {
        return Err(ParseError::EmptyPath);
    }

    Ok(PathElem {
        subjpreds,
        listpreds,
        ordertags,
    })
}

fn parse_predlist(s: &mut Scanner<'_>, nested: bool) -> Result<Vec<Predicate>, ParseError> {
    let mut preds = Vec::new();
    if at_elem_end(s, nested) || s.peek() == Some('(') {
        return Ok(preds);
    }
    loop {
        preds.push(parse_pred(s, nested)?);
        if !s.eat(';') {
            break;
        }
    }
    Ok(preds)
}

fn parse_pred(s: &mut Scanner<'_>, nested: bool) -> Result<Predicate, ParseError> {
    let tag_pos = s.pos;
    let tag = s.scan_payload()?;
    if tag.is_empty() {
        return Err(ParseError::EmptyTag(tag_pos));
    }

    let op = match s.peek() {
        Some('=') => {
            s.bump();
            Some(PredicateOp::Equal)
        }
        Some('!') => {
            s.bump();
            s.expect('=')?;
            Some(PredicateOp::NotEqual)
        }
        Some(':') => {
            s.bump();
            let token_pos = s.pos;
            let token = s.scan_op_token()?;
            match OP_TOKENS.get(token.as_str()) {
                Some(op) => Some(*op),
                None => {
                    return Err(ParseError::UnknownOperator {
                        pos: token_pos,
                        token,
                    });
                }
            }
        }
        _ => None,
    };

    let values = match op {
        Some(op) if op.takes_values() => parse_values(s)?,
        Some(PredicateOp::Absent) => {
            // ":absent:" must stand alone; a following payload would be a
            // stray value.
            if !at_elem_end(s, nested) && !matches!(s.peek(), Some(';') | Some('(') | Some(')')) {
                return Err(ParseError::UnexpectedValues {
                    pos: s.pos,
                    op: PredicateOp::Absent.token(),
                });
            }
            Vec::new()
        }
        _ => Vec::new(),
    };

    Ok(Predicate { tag, op, values })
}

fn parse_values(s: &mut Scanner<'_>) -> Result<Vec<PredValue>, ParseError> {
    let mut values = Vec::new();
    loop {
        if s.rest().starts_with("@(") {
            s.bump();
            s.bump();
            let sub = parse_path_inner(s, true)?;
            s.expect(')')?;
            values.push(PredValue::Subquery(sub));
        } else {
            values.push(PredValue::Literal(s.scan_payload()?));
        }
        if !s.eat(',') {
            break;
        }
    }
    Ok(values)
}

fn parse_ordertags(s: &mut Scanner<'_>, nested: bool) -> Result<Vec<OrderTag>, ParseError> {
    let mut tags = Vec::new();
    while !at_elem_end(s, nested) {
        let tag_pos = s.pos;
        let tag = s.scan_payload()?;
        if tag.is_empty() {
            return Err(ParseError::EmptyTag(tag_pos));
        }
        s.expect(':')?;
        let token_pos = s.pos;
        let token = s.scan_op_token()?;
        let dir = match token.as_str() {
            "asc" => Direction::Asc,
            "desc" => Direction::Desc,
            _ => {
                return Err(ParseError::UnknownOperator {
                    pos: token_pos,
                    token,
                });
            }
        };
        tags.push(OrderTag { tag, dir });
        if !s.eat(',') {
            break;
        }
    }
    Ok(tags)
}
