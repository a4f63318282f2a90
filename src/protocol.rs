//! Low-level MOS framing, envelope decoding and wire encoding.
//!
//! MOS peers write one XML document per request or reply onto a TCP stream with
//! no length prefix or delimiter, historically as UTF-16BE text. [`MosParser`]
//! recovers the document boundaries by tracking the nesting depth of the root
//! element, and [`decode_message`] pulls the envelope fields out of a single
//! document.

use crate::error::ParseError;
use crate::message::{MessageId, ParsedMosMessage};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use quick_xml::escape::unescape;
use quick_xml::events::Event;
use quick_xml::name::QName;
use quick_xml::Reader;
use serde::{Deserialize, Serialize};

/// Default cap on the size of a single buffered document.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 10 * 1024 * 1024; // 10 MB

/// Text encoding used when writing documents to the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WireEncoding {
    /// 16-bit big-endian, no byte-order mark.
    #[default]
    Utf16be,
    /// 8-bit UTF-8.
    Utf8,
}

/// Encoding detected on an inbound stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamEncoding {
    Utf8,
    Utf16Be,
    Utf16Le,
}

/// Encode a document for the wire.
pub fn encode(xml: &str, encoding: WireEncoding) -> Bytes {
    let mut out = BytesMut::new();
    encode_into(xml, encoding, &mut out);
    out.freeze()
}

/// Append the wire form of `xml` to `out`.
pub fn encode_into(xml: &str, encoding: WireEncoding, out: &mut BytesMut) {
    match encoding {
        WireEncoding::Utf16be => {
            out.reserve(xml.len() * 2);
            for unit in xml.encode_utf16() {
                out.put_u16(unit);
            }
        }
        WireEncoding::Utf8 => out.extend_from_slice(xml.as_bytes()),
    }
}

/// Stateful framer that splits a byte stream into complete XML documents.
#[derive(Debug)]
pub struct MosParser {
    /// Bytes not yet decoded (partial code units or sequences).
    raw: BytesMut,
    /// Encoding of the stream, detected from the first bytes.
    encoding: Option<StreamEncoding>,
    /// Decoded text not yet emitted as a document.
    text: String,
    /// Offset in `text` where scanning resumes.
    scan: usize,
    /// Offset in `text` of the `<` that opened the current document.
    doc_start: Option<usize>,
    /// Element nesting depth inside the current document.
    depth: usize,
    /// The current document overflowed and is dropped up to its closing tag.
    discarding: bool,
    max_size: usize,
}

impl MosParser {
    /// Create a new parser.
    pub fn new() -> Self {
        Self::with_max_size(DEFAULT_MAX_MESSAGE_SIZE)
    }

    /// Create a parser that rejects documents larger than `max_size` bytes of text.
    pub fn with_max_size(max_size: usize) -> Self {
        Self {
            raw: BytesMut::new(),
            encoding: None,
            text: String::new(),
            scan: 0,
            doc_start: None,
            depth: 0,
            discarding: false,
            max_size,
        }
    }

    /// Add data to the internal buffer.
    ///
    /// Fails if the pending document grows beyond the size limit. That document
    /// is then dropped in full: the rest of it, up to the tag that closes its
    /// root, is skipped silently as it arrives.
    pub fn push(&mut self, data: &[u8]) -> Result<(), ParseError> {
        self.raw.put_slice(data);
        if self.encoding.is_none() {
            self.detect_encoding();
        }
        self.decode_available();

        if !self.discarding && self.text.len() > self.max_size {
            let len = self.text.len();
            let head: String = self.text.chars().take(256).collect();
            if self.doc_start.is_some() || self.text[self.scan..].contains('<') {
                self.discarding = true;
            } else {
                self.text.clear();
                self.reset_document();
            }
            return Err(ParseError::new(
                format!("message too large: {} bytes", len),
                head,
            ));
        }
        Ok(())
    }

    /// Add data and return the first complete document, if any.
    ///
    /// Further documents already buffered are returned by [`next_document`](Self::next_document).
    pub fn parse(&mut self, data: &[u8]) -> Result<Option<String>, ParseError> {
        self.push(data)?;
        Ok(self.next_document())
    }

    /// Return the next complete document from the buffer, or `None` if more
    /// data is needed.
    pub fn next_document(&mut self) -> Option<String> {
        loop {
            if self.doc_start.is_none() {
                // Anything before the first '<' is noise.
                match self.text[self.scan..].find('<') {
                    Some(i) => {
                        self.scan += i;
                        self.doc_start = Some(self.scan);
                    }
                    None => {
                        self.text.clear();
                        self.scan = 0;
                        return None;
                    }
                }
            }

            let tag_start = match self.text[self.scan..].find('<') {
                Some(i) => self.scan + i,
                None => {
                    self.scan = self.text.len();
                    self.trim_discarded();
                    return None;
                }
            };

            let (kind, len) = match classify_tag(&self.text[tag_start..]) {
                Some(tag) => tag,
                None => {
                    self.scan = tag_start;
                    self.trim_discarded();
                    return None;
                }
            };
            self.scan = tag_start + len;

            let complete = match kind {
                TagKind::Open => {
                    self.depth += 1;
                    false
                }
                TagKind::Close => {
                    self.depth = self.depth.saturating_sub(1);
                    self.depth == 0
                }
                TagKind::SelfClosing => self.depth == 0,
                TagKind::Markup => false,
            };

            if complete {
                let document = self.take_document();
                if self.discarding {
                    self.discarding = false;
                    continue;
                }
                return Some(document);
            }
        }
    }

    /// Drop the scanned part of a document being discarded.
    fn trim_discarded(&mut self) {
        if self.discarding {
            self.text.drain(..self.scan);
            self.scan = 0;
            self.doc_start = Some(0);
        }
    }

    /// Drain every complete document currently buffered.
    pub fn documents(&mut self) -> impl Iterator<Item = String> + '_ {
        std::iter::from_fn(move || self.next_document())
    }

    /// Signal end of stream.
    ///
    /// Returns the unterminated fragment that was pending, if any, and resets
    /// the parser so the fragment can never merge into a later document.
    pub fn finish(&mut self) -> Option<String> {
        let mut fragment = match self.doc_start {
            Some(_) if self.discarding => String::new(),
            Some(start) => self.text[start..].to_string(),
            None => String::new(),
        };
        if !self.raw.is_empty() && self.doc_start.is_some() && !self.discarding {
            fragment.push_str(&String::from_utf8_lossy(&self.raw));
        }
        self.clear();
        if fragment.trim().is_empty() {
            None
        } else {
            Some(fragment)
        }
    }

    /// Get the number of buffered bytes and characters not yet emitted.
    pub fn buffer_len(&self) -> usize {
        self.raw.len() + self.text.len()
    }

    /// Clear the internal buffer.
    pub fn clear(&mut self) {
        self.raw.clear();
        self.text.clear();
        self.encoding = None;
        self.discarding = false;
        self.reset_document();
    }

    fn reset_document(&mut self) {
        self.scan = 0;
        self.doc_start = None;
        self.depth = 0;
    }

    fn take_document(&mut self) -> String {
        let start = self.doc_start.unwrap_or(0);
        let doc = self.text[start..self.scan].to_string();
        self.text.drain(..self.scan);
        self.reset_document();
        doc
    }

    fn detect_encoding(&mut self) {
        if self.raw.len() < 2 {
            return;
        }
        let encoding = match (self.raw[0], self.raw[1]) {
            (0xFE, 0xFF) => {
                self.raw.advance(2);
                StreamEncoding::Utf16Be
            }
            (0xFF, 0xFE) => {
                self.raw.advance(2);
                StreamEncoding::Utf16Le
            }
            (0x00, _) => StreamEncoding::Utf16Be,
            (_, 0x00) => StreamEncoding::Utf16Le,
            (0xEF, 0xBB) if self.raw.len() >= 3 && self.raw[2] == 0xBF => {
                self.raw.advance(3);
                StreamEncoding::Utf8
            }
            _ => StreamEncoding::Utf8,
        };
        self.encoding = Some(encoding);
    }

    fn decode_available(&mut self) {
        match self.encoding {
            None => {}
            Some(StreamEncoding::Utf8) => self.decode_utf8(),
            Some(StreamEncoding::Utf16Be) => self.decode_utf16(u16::from_be_bytes),
            Some(StreamEncoding::Utf16Le) => self.decode_utf16(u16::from_le_bytes),
        }
    }

    fn decode_utf8(&mut self) {
        loop {
            match std::str::from_utf8(&self.raw) {
                Ok(s) => {
                    self.text.push_str(s);
                    self.raw.clear();
                    return;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    self.text
                        .push_str(&String::from_utf8_lossy(&self.raw[..valid]));
                    match e.error_len() {
                        Some(bad) => {
                            self.text.push(char::REPLACEMENT_CHARACTER);
                            self.raw.advance(valid + bad);
                        }
                        None => {
                            // Incomplete sequence at the end, wait for more.
                            self.raw.advance(valid);
                            return;
                        }
                    }
                }
            }
        }
    }

    fn decode_utf16(&mut self, unit: fn([u8; 2]) -> u16) {
        let mut units: Vec<u16> = self
            .raw
            .chunks_exact(2)
            .map(|pair| unit([pair[0], pair[1]]))
            .collect();

        // Hold back a trailing high surrogate until its pair arrives.
        if matches!(units.last(), Some(u) if (0xD800..=0xDBFF).contains(u)) {
            units.pop();
        }

        self.text.extend(
            char::decode_utf16(units.iter().copied())
                .map(|c| c.unwrap_or(char::REPLACEMENT_CHARACTER)),
        );
        self.raw.advance(units.len() * 2);
    }
}

impl Default for MosParser {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TagKind {
    Open,
    Close,
    SelfClosing,
    /// Comments, processing instructions, CDATA and DOCTYPE.
    Markup,
}

/// Classify the tag at the start of `s` (which begins with `<`).
/// Returns the kind and byte length, or `None` if the tag is not complete yet.
fn classify_tag(s: &str) -> Option<(TagKind, usize)> {
    for (open, close) in [("<!--", "-->"), ("<![CDATA[", "]]>"), ("<?", "?>")] {
        if s.starts_with(open) {
            return s[open.len()..]
                .find(close)
                .map(|i| (TagKind::Markup, open.len() + i + close.len()));
        }
        if open.starts_with(s) {
            return None;
        }
    }

    let end = find_tag_end(s)?;
    let kind = if s.starts_with("<!") {
        TagKind::Markup
    } else if s.starts_with("</") {
        TagKind::Close
    } else if s[..end].ends_with('/') {
        TagKind::SelfClosing
    } else {
        TagKind::Open
    };
    Some((kind, end + 1))
}

/// Find the `>` closing the tag at the start of `s`, skipping quoted attribute
/// values and DOCTYPE internal subsets.
fn find_tag_end(s: &str) -> Option<usize> {
    let mut quote: Option<u8> = None;
    let mut brackets = 0usize;
    for (i, b) in s.bytes().enumerate().skip(1) {
        match (quote, b) {
            (Some(q), _) if b == q => quote = None,
            (Some(_), _) => {}
            (None, b'"') | (None, b'\'') => quote = Some(b),
            (None, b'[') => brackets += 1,
            (None, b']') => brackets = brackets.saturating_sub(1),
            (None, b'>') if brackets == 0 => return Some(i),
            _ => {}
        }
    }
    None
}

/// Decode a single MOS document into its envelope fields.
///
/// The root must be `mos` and contain exactly one body element besides
/// `mosID`, `ncsID` and `messageID`. A missing or empty `messageID` is allowed.
pub fn decode_message(text: &str) -> Result<ParsedMosMessage, ParseError> {
    let fail = |reason: &dyn std::fmt::Display| ParseError::new(reason, text);

    let mut reader = Reader::from_str(text);
    reader.config_mut().trim_text(true);

    let mut root_open = false;
    let mut root_closed = false;
    let mut message_id = None;
    let mut mos_id = String::new();
    let mut ncs_id = String::new();
    let mut body: Option<(String, String)> = None;

    loop {
        let before = reader.buffer_position() as usize;
        let event = reader.read_event().map_err(|e| fail(&e))?;
        match event {
            Event::Start(e) if !root_open => {
                check_root(e.name()).map_err(|reason| fail(&reason))?;
                root_open = true;
            }
            Event::Empty(e) if !root_open => {
                check_root(e.name()).map_err(|reason| fail(&reason))?;
                return Err(fail(&"missing message body"));
            }
            Event::Start(e) => {
                let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                match name.as_str() {
                    "mosID" | "ncsID" | "messageID" => {
                        let raw = reader.read_text(e.name()).map_err(|e| fail(&e))?;
                        let value = unescape(&raw).map_err(|e| fail(&e))?.trim().to_string();
                        assign_field(&name, value, &mut mos_id, &mut ncs_id, &mut message_id)
                            .map_err(|reason| fail(&reason))?;
                    }
                    _ => {
                        let end_name = e.name().as_ref().to_vec();
                        reader.read_to_end(QName(&end_name)).map_err(|e| fail(&e))?;
                        let after = reader.buffer_position() as usize;
                        set_body(&mut body, name, &text[before..after]).map_err(|r| fail(&r))?;
                    }
                }
            }
            Event::Empty(e) => {
                let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                match name.as_str() {
                    "mosID" | "ncsID" | "messageID" => {
                        assign_field(&name, String::new(), &mut mos_id, &mut ncs_id, &mut message_id)
                            .map_err(|reason| fail(&reason))?;
                    }
                    _ => {
                        let after = reader.buffer_position() as usize;
                        set_body(&mut body, name, &text[before..after]).map_err(|r| fail(&r))?;
                    }
                }
            }
            Event::End(_) => {
                root_closed = true;
                break;
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if !root_open || !root_closed {
        return Err(fail(&"unexpected end of document"));
    }
    let (body_tag, body_xml) = body.ok_or_else(|| fail(&"missing message body"))?;

    Ok(ParsedMosMessage {
        message_id,
        mos_id,
        ncs_id,
        body_tag,
        body_xml,
        raw: text.to_string(),
    })
}

fn check_root(name: QName<'_>) -> Result<(), String> {
    if name.as_ref() == b"mos" {
        Ok(())
    } else {
        Err(format!(
            "unexpected root element <{}>",
            String::from_utf8_lossy(name.as_ref())
        ))
    }
}

fn assign_field(
    name: &str,
    value: String,
    mos_id: &mut String,
    ncs_id: &mut String,
    message_id: &mut Option<MessageId>,
) -> Result<(), String> {
    match name {
        "mosID" => *mos_id = value,
        "ncsID" => *ncs_id = value,
        _ => {
            *message_id = if value.is_empty() {
                None
            } else {
                Some(
                    value
                        .parse()
                        .map_err(|_| format!("invalid messageID \"{}\"", value))?,
                )
            };
        }
    }
    Ok(())
}

fn set_body(body: &mut Option<(String, String)>, tag: String, xml: &str) -> Result<(), String> {
    if let Some((existing, _)) = body {
        return Err(format!(
            "multiple body elements: <{}> and <{}>",
            existing, tag
        ));
    }
    *body = Some((tag, xml.trim().to_string()));
    Ok(())
}
