//! Incremental XML stream framing.
//!
//! XMPP streams are two open-ended XML documents; this parser consumes the
//! byte stream in whatever chunks the transport produces and yields complete
//! top-level fragments: the stream header, each stanza-level element, and
//! the closing tag. It enforces the wire restrictions of RFC 6120 §11.1
//! (no comments, no processing instructions past the prolog, no CDATA, no
//! DTDs) and a nesting-depth bound.
//!
//! The parser never blocks and never over-consumes: incomplete trailing
//! input stays buffered until more bytes arrive.

use crate::element::{Element, Node};
use crate::error::ParseError;

/// Maximum element nesting below the stream root.
const MAX_DEPTH: usize = 32;

/// A complete top-level fragment.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// The `<stream:stream …>` header; attributes only, never children.
    StreamOpen(Element),
    /// A complete stanza-level element.
    Element(Element),
    /// The `</stream:stream>` close tag.
    StreamClose,
}

/// Incremental parser for one direction of an XMPP stream.
#[derive(Debug, Default)]
pub struct StreamParser {
    buf: Vec<u8>,
    pos: usize,
    stack: Vec<Element>,
    /// Bytes already folded into the partially-built element.
    partial_bytes: usize,
    saw_prolog: bool,
}

enum Token {
    Open(Element, bool), // element, self_closing
    Close(String),
    Text(String),
    Prolog,
}

impl StreamParser {
    /// A fresh parser expecting a stream header.
    pub fn new() -> Self {
        Self::default()
    }

    /// Discard all state. Used after STARTTLS and SASL stream restarts,
    /// where the next bytes begin a brand-new stream.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Append raw bytes from the transport.
    pub fn feed(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Bytes belonging to the fragment currently being assembled. The
    /// transport compares this against its stanza size cap.
    pub fn pending_bytes(&self) -> usize {
        self.partial_bytes + (self.buf.len() - self.pos)
    }

    /// Pull the next complete fragment, or `None` when more input is needed.
    pub fn next_event(&mut self) -> Result<Option<StreamEvent>, ParseError> {
        loop {
            self.compact();
            let start = self.pos;
            let token = match self.scan_token()? {
                Some(t) => t,
                None => return Ok(None),
            };
            let consumed = self.pos - start;

            match token {
                Token::Prolog => continue,
                Token::Text(text) => {
                    match self.stack.last_mut() {
                        Some(top) => {
                            self.partial_bytes += consumed;
                            top.push_node(Node::Text(text));
                        }
                        None => {
                            // Whitespace keep-alives between stanzas are
                            // legal; any other stream-level text is not.
                            if !text.chars().all(char::is_whitespace) {
                                return Err(ParseError::InvalidXml(
                                    "character data at stream level".into(),
                                ));
                            }
                        }
                    }
                    continue;
                }
                Token::Open(element, self_closing) => {
                    if self.stack.is_empty() && is_stream_root(element.name()) {
                        if self_closing {
                            return Err(ParseError::InvalidXml(
                                "self-closing stream header".into(),
                            ));
                        }
                        return Ok(Some(StreamEvent::StreamOpen(element)));
                    }
                    if self_closing {
                        match self.stack.last_mut() {
                            Some(top) => {
                                self.partial_bytes += consumed;
                                top.push_node(Node::Element(element));
                                continue;
                            }
                            None => {
                                self.partial_bytes = 0;
                                return Ok(Some(StreamEvent::Element(element)));
                            }
                        }
                    }
                    if self.stack.len() >= MAX_DEPTH {
                        return Err(ParseError::TooDeep(self.stack.len()));
                    }
                    self.partial_bytes += consumed;
                    self.stack.push(element);
                    continue;
                }
                Token::Close(name) => {
                    if self.stack.is_empty() {
                        if is_stream_root(&name) {
                            return Ok(Some(StreamEvent::StreamClose));
                        }
                        return Err(ParseError::InvalidXml(format!(
                            "unmatched close tag </{name}>"
                        )));
                    }
                    let element = self.stack.pop().expect("stack checked non-empty");
                    if element.name() != name {
                        return Err(ParseError::InvalidXml(format!(
                            "close tag </{}> does not match <{}>",
                            name,
                            element.name()
                        )));
                    }
                    match self.stack.last_mut() {
                        Some(top) => {
                            self.partial_bytes += consumed;
                            top.push_node(Node::Element(element));
                            continue;
                        }
                        None => {
                            self.partial_bytes = 0;
                            return Ok(Some(StreamEvent::Element(element)));
                        }
                    }
                }
            }
        }
    }

    fn compact(&mut self) {
        if self.pos > 0 {
            self.buf.drain(..self.pos);
            self.pos = 0;
        }
    }

    /// Scan one token starting at `self.pos`, advancing past it on success.
    /// Returns `None` when the buffered input ends mid-token.
    fn scan_token(&mut self) -> Result<Option<Token>, ParseError> {
        if self.pos >= self.buf.len() {
            return Ok(None);
        }
        if self.buf[self.pos] != b'<' {
            // Character data runs until the next tag.
            let rel = match memchr(b'<', &self.buf[self.pos..]) {
                Some(i) => i,
                None => {
                    // Stream-level whitespace can be consumed eagerly;
                    // anything else waits for its terminating tag.
                    if self.stack.is_empty() {
                        let text = utf8(&self.buf[self.pos..], self.pos)?.to_owned();
                        if text.chars().all(char::is_whitespace) {
                            self.pos = self.buf.len();
                            return Ok(Some(Token::Text(text)));
                        }
                    }
                    return Ok(None);
                }
            };
            let raw = utf8(&self.buf[self.pos..self.pos + rel], self.pos)?;
            let text = decode_entities(raw)?;
            self.pos += rel;
            return Ok(Some(Token::Text(text)));
        }

        // A tag: find its '>' outside quoted attribute values.
        let end_rel = match find_tag_end(&self.buf[self.pos..]) {
            Some(i) => i,
            None => return Ok(None),
        };
        let raw = utf8(&self.buf[self.pos..self.pos + end_rel + 1], self.pos)?.to_owned();
        let inner = &raw[1..raw.len() - 1];

        if let Some(rest) = inner.strip_prefix('?') {
            if !rest.ends_with('?') {
                return Err(ParseError::InvalidXml("malformed processing instruction".into()));
            }
            if !rest.starts_with("xml") || self.saw_prolog {
                return Err(ParseError::RestrictedXml("processing instruction"));
            }
            self.saw_prolog = true;
            self.pos += end_rel + 1;
            return Ok(Some(Token::Prolog));
        }
        if inner.starts_with('!') {
            // Comments, CDATA and DOCTYPE are all forbidden on XMPP streams.
            return Err(ParseError::RestrictedXml("comment, CDATA or DTD"));
        }
        if let Some(name) = inner.strip_prefix('/') {
            let name = name.trim_end();
            validate_name(name)?;
            self.pos += end_rel + 1;
            return Ok(Some(Token::Close(name.to_owned())));
        }

        let (body, self_closing) = match inner.strip_suffix('/') {
            Some(b) => (b, true),
            None => (inner, false),
        };
        let element = parse_open_tag(body)?;
        self.pos += end_rel + 1;
        Ok(Some(Token::Open(element, self_closing)))
    }
}

fn is_stream_root(name: &str) -> bool {
    name == "stream:stream" || name == "stream"
}

fn memchr(needle: u8, haystack: &[u8]) -> Option<usize> {
    haystack.iter().position(|&b| b == needle)
}

/// Locate the closing '>' of a tag, honouring quoted attribute values.
fn find_tag_end(buf: &[u8]) -> Option<usize> {
    let mut quote: Option<u8> = None;
    for (i, &b) in buf.iter().enumerate() {
        match quote {
            Some(q) => {
                if b == q {
                    quote = None;
                }
            }
            None => match b {
                b'"' | b'\'' => quote = Some(b),
                b'>' => return Some(i),
                _ => {}
            },
        }
    }
    None
}

fn utf8(bytes: &[u8], offset: usize) -> Result<&str, ParseError> {
    std::str::from_utf8(bytes).map_err(|e| ParseError::InvalidUtf8(offset + e.valid_up_to()))
}

fn validate_name(name: &str) -> Result<(), ParseError> {
    let ok = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_alphanumeric() || matches!(c, ':' | '-' | '_' | '.'))
        && !name.starts_with(|c: char| c.is_ascii_digit() || matches!(c, '-' | '.'));
    if ok {
        Ok(())
    } else {
        Err(ParseError::InvalidXml(format!("bad element name {name:?}")))
    }
}

/// Parse `name attr="v" …` (angle brackets and any trailing '/' stripped).
fn parse_open_tag(body: &str) -> Result<Element, ParseError> {
    let body = body.trim();
    let name_end = body
        .find(|c: char| c.is_whitespace())
        .unwrap_or(body.len());
    let name = &body[..name_end];
    validate_name(name)?;
    let mut element = Element::new(name);

    let mut rest = body[name_end..].trim_start();
    while !rest.is_empty() {
        let eq = rest.find('=').ok_or_else(|| {
            ParseError::InvalidXml(format!("attribute without value near {rest:?}"))
        })?;
        let attr_name = rest[..eq].trim_end();
        validate_name(attr_name)
            .map_err(|_| ParseError::InvalidXml(format!("bad attribute name {attr_name:?}")))?;
        let after_eq = rest[eq + 1..].trim_start();
        let mut chars = after_eq.char_indices();
        let quote = match chars.next() {
            Some((_, c @ ('"' | '\''))) => c,
            _ => {
                return Err(ParseError::InvalidXml(format!(
                    "unquoted attribute value near {after_eq:?}"
                )))
            }
        };
        let close = after_eq[1..].find(quote).ok_or_else(|| {
            ParseError::InvalidXml("unterminated attribute value".into())
        })?;
        let raw_value = &after_eq[1..1 + close];
        element.push_attr(attr_name.to_owned(), decode_entities(raw_value)?);
        rest = after_eq[1 + close + 1..].trim_start();
    }
    Ok(element)
}

/// Resolve the five predefined entities plus numeric character references.
fn decode_entities(s: &str) -> Result<String, ParseError> {
    if !s.contains('&') {
        return Ok(s.to_owned());
    }
    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        let after = &rest[amp + 1..];
        let semi = after
            .find(';')
            .ok_or_else(|| ParseError::UnknownEntity(truncate(after)))?;
        let entity = &after[..semi];
        match entity {
            "amp" => out.push('&'),
            "lt" => out.push('<'),
            "gt" => out.push('>'),
            "quot" => out.push('"'),
            "apos" => out.push('\''),
            _ => {
                let code = entity
                    .strip_prefix("#x")
                    .map(|h| u32::from_str_radix(h, 16))
                    .or_else(|| entity.strip_prefix('#').map(|d| d.parse::<u32>()))
                    .and_then(|r| r.ok())
                    .and_then(char::from_u32);
                match code {
                    Some(c) => out.push(c),
                    None => return Err(ParseError::UnknownEntity(entity.to_owned())),
                }
            }
        }
        rest = &after[semi + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

fn truncate(s: &str) -> String {
    s.chars().take(16).collect()
}
