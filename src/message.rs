//! Message types for the MOS protocol.

use crate::error::{MosError, Result};
use quick_xml::escape::escape;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

/// Process-wide message ID counter. IDs start at 1 and are never reused.
static NEXT_MESSAGE_ID: AtomicU64 = AtomicU64::new(1);

/// Identifier used to correlate a reply with its request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(u64);

impl MessageId {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Allocate the next process-unique message ID.
    pub fn next() -> Self {
        Self(NEXT_MESSAGE_ID.fetch_add(1, Ordering::SeqCst))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for MessageId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        s.trim().parse().map(Self)
    }
}

/// The three MOS port roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PortType {
    /// General purpose and push messages.
    Lower,
    /// Running-order and advanced workflow messages.
    Upper,
    /// Read-only queries.
    Query,
}

impl PortType {
    pub const ALL: [PortType; 3] = [PortType::Lower, PortType::Upper, PortType::Query];

    pub fn as_str(&self) -> &'static str {
        match self {
            PortType::Lower => "lower",
            PortType::Upper => "upper",
            PortType::Query => "query",
        }
    }

    /// The TCP port conventionally assigned to this role.
    pub fn default_port(&self) -> u16 {
        match self {
            PortType::Lower => 10540,
            PortType::Upper => 10541,
            PortType::Query => 10542,
        }
    }
}

impl FromStr for PortType {
    type Err = MosError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "lower" => Ok(PortType::Lower),
            "upper" => Ok(PortType::Upper),
            "query" => Ok(PortType::Query),
            _ => Err(MosError::UnknownPort(s.to_string())),
        }
    }
}

impl fmt::Display for PortType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The single body element of a MOS message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MosBody {
    /// Element name, which identifies the message type (e.g. `heartbeat`).
    pub tag: String,
    /// Inner XML of the element, already escaped.
    pub content: String,
}

impl MosBody {
    pub fn new(tag: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            content: content.into(),
        }
    }

    /// A body element with no content, rendered as `<tag/>`.
    pub fn empty(tag: impl Into<String>) -> Self {
        Self::new(tag, String::new())
    }

    pub fn to_xml(&self) -> String {
        if self.content.is_empty() {
            format!("<{}/>", self.tag)
        } else {
            format!("<{tag}>{}</{tag}>", self.content, tag = self.tag)
        }
    }
}

/// An outbound MOS message.
///
/// The message ID is assigned the first time the message is queued for sending,
/// so a message handed over between connections keeps its original ID.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MosMessage {
    /// Correlation ID, `None` until the message is first queued.
    pub message_id: Option<MessageId>,
    /// Port role this message travels on.
    pub port: PortType,
    /// Sender ID (`mosID`).
    pub mos_id: String,
    /// Receiver ID (`ncsID`).
    pub ncs_id: String,
    /// The body element.
    pub body: MosBody,
}

impl MosMessage {
    /// Create a message for `port`. Sender and receiver IDs are filled in by
    /// the server connection that executes it.
    pub fn new(port: PortType, body: MosBody) -> Self {
        Self {
            message_id: None,
            port,
            mos_id: String::new(),
            ncs_id: String::new(),
            body,
        }
    }

    /// A heartbeat carrying the current time.
    pub fn heartbeat(port: PortType) -> Self {
        let time = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S,%3fZ");
        Self::new(port, MosBody::new("heartbeat", format!("<time>{}</time>", time)))
    }

    pub fn with_ids(mut self, mos_id: impl Into<String>, ncs_id: impl Into<String>) -> Self {
        self.mos_id = mos_id.into();
        self.ncs_id = ncs_id.into();
        self
    }

    pub fn with_message_id(mut self, id: MessageId) -> Self {
        self.message_id = Some(id);
        self
    }

    /// Return the message ID, allocating one if the message has none yet.
    pub fn ensure_message_id(&mut self) -> MessageId {
        *self.message_id.get_or_insert_with(MessageId::next)
    }

    /// Get the body tag, which names the message type.
    pub fn message_type(&self) -> &str {
        &self.body.tag
    }

    /// Serialize the envelope to XML text.
    pub fn to_xml(&self) -> String {
        let mut xml = String::with_capacity(96 + self.body.content.len());
        xml.push_str("<mos><mosID>");
        xml.push_str(&escape(self.mos_id.as_str()));
        xml.push_str("</mosID><ncsID>");
        xml.push_str(&escape(self.ncs_id.as_str()));
        xml.push_str("</ncsID>");
        if let Some(id) = self.message_id {
            xml.push_str("<messageID>");
            xml.push_str(&id.to_string());
            xml.push_str("</messageID>");
        }
        xml.push_str(&self.body.to_xml());
        xml.push_str("</mos>");
        xml
    }
}

/// A MOS message decoded from the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedMosMessage {
    /// Correlation ID, absent on some unsolicited pushes.
    pub message_id: Option<MessageId>,
    /// Sender ID (`mosID`).
    pub mos_id: String,
    /// Receiver ID (`ncsID`).
    pub ncs_id: String,
    /// Body element name.
    pub body_tag: String,
    /// Raw XML of the body element, including its own tags.
    pub body_xml: String,
    /// The complete document as received.
    pub raw: String,
}

impl ParsedMosMessage {
    /// Get the body tag, which names the message type.
    pub fn message_type(&self) -> &str {
        &self.body_tag
    }
}
