use std::fmt;
use std::fmt::{Display, Formatter, Debug};

use bytes::Bytes;

use crate::riverpool::common::Result;
use crate::riverpool::pg::protocol::{Tag, MessageReader, MessageErrorBuilder, ErrorSeverity, ProtocolVersion};


/// A single protocol message: its kind tag and the payload that follows the header.
/// The payload is stored without the length prefix, the framer adds or removes it
/// depending on the protocol version of the connection the message travels over.
#[derive(Clone, Default)]
pub struct Message {
    tag: Tag,
    body: Bytes,
}

impl Message {
    pub fn new(tag: Tag, body: Bytes) -> Self {
        Message { tag, body }
    }

    /// Return a new Message of type Tag::ERROR_RESPONSE with severity ERROR and the given error code and error message
    pub fn new_error(version: ProtocolVersion, error_code: &str, error_msg: &str) -> Self {
        MessageErrorBuilder::new(ErrorSeverity::Error, error_code, error_msg).finish(version)
    }

    /// Return a new Message of type Tag::ERROR_RESPONSE with severity FATAL
    pub fn new_fatal(version: ProtocolVersion, error_code: &str, error_msg: &str) -> Self {
        MessageErrorBuilder::new(ErrorSeverity::Fatal, error_code, error_msg).finish(version)
    }

    pub fn tag(&self) -> Tag {
        self.tag
    }

    /// is_empty returns true if Message is the default (untagged, no payload) Message
    pub fn is_empty(&self) -> bool {
        self.tag == Tag::UNTAGGED && self.body.is_empty()
    }

    /// len returns the length of the payload, excluding the tag and any length prefix
    pub fn len(&self) -> u32 {
        self.body.len() as u32
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn body_bytes(&self) -> &Bytes {
        &self.body
    }

    pub fn into_body(self) -> Bytes {
        self.body
    }

    pub fn reader(&self) -> MessageReader<'_> {
        MessageReader::new(self)
    }

    /// first_str returns the null-terminated string at the start of the payload,
    /// e.g. the query text of a Query or the command tag of a CommandComplete.
    pub fn first_str(&self) -> Result<&str> {
        MessageReader::new(self).read_str()
    }

    /// Is returns true if other and msg are the same because they share the same backing buffer
    pub fn is(&self, other: &Message) -> bool {
        self.tag == other.tag && self.body.as_ptr() == other.body.as_ptr()
    }
}

impl PartialEq for Message {
    fn eq(&self, other: &Self) -> bool {
        self.tag == other.tag && self.body == other.body
    }
}

impl Eq for Message {}

impl Display for Message {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            f.write_str("Empty")
        } else {
            f.write_fmt(format_args!("{}(len={})", self.tag, self.body.len()))
        }
    }
}

impl Debug for Message {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(self, f)?;
        f.write_str(" Message")
    }
}
