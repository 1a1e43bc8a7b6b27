use std::fmt::{Debug, Display, Formatter};

use crate::riverpool::common::{Error, Result};

/// Tag is the message kind byte that starts every protocol message (except the startup packet).
/// The same byte means different things depending on the direction of the message,
/// so several of the constants below share a value.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Default)]
pub struct Tag(u8);

impl Tag {
    pub const UNTAGGED: Tag = Tag(0); // Startup, CancelRequest, SSLRequest
    // Frontend
    pub const BIND: Tag = Tag::new_unchecked('B');
    pub const CLOSE: Tag = Tag::new_unchecked('C'); // close prepared statement or portal
    pub const COPY_FAIL: Tag = Tag::new_unchecked('f');
    pub const DESCRIBE: Tag = Tag::new_unchecked('D');
    pub const EXECUTE: Tag = Tag::new_unchecked('E');
    pub const FLUSH: Tag = Tag::new_unchecked('H');
    pub const FUNCTION_CALL: Tag = Tag::new_unchecked('F');
    pub const PARSE: Tag = Tag::new_unchecked('P');
    pub const PASSWORD_MESSAGE: Tag = Tag::new_unchecked('p');
    pub const QUERY: Tag = Tag::new_unchecked('Q');
    pub const SYNC: Tag = Tag::new_unchecked('S');
    pub const TERMINATE: Tag = Tag::new_unchecked('X');
    // Frontend + Backend
    pub const COPY_DATA: Tag = Tag::new_unchecked('d');
    pub const COPY_DONE: Tag = Tag::new_unchecked('c');
    // Backend
    pub const AUTHENTICATION: Tag = Tag::new_unchecked('R');
    pub const BACKEND_KEY_DATA: Tag = Tag::new_unchecked('K');
    pub const BIND_COMPLETE: Tag = Tag::new_unchecked('2');
    pub const CLOSE_COMPLETE: Tag = Tag::new_unchecked('3');
    pub const COMMAND_COMPLETE: Tag = Tag::new_unchecked('C');
    pub const COPY_IN_RESPONSE: Tag = Tag::new_unchecked('G');
    pub const COPY_OUT_RESPONSE: Tag = Tag::new_unchecked('H');
    pub const COPY_BOTH_RESPONSE: Tag = Tag::new_unchecked('W');
    pub const DATA_ROW: Tag = Tag::new_unchecked('D');
    pub const EMPTY_QUERY: Tag = Tag::new_unchecked('I');
    pub const FUNCTION_CALL_RESPONSE: Tag = Tag::new_unchecked('V');
    pub const NEGOTIATE_PROTOCOL_VERSION: Tag = Tag::new_unchecked('v');
    pub const NO_DATA: Tag = Tag::new_unchecked('n');
    pub const PARAMETER_DESCRIPTION: Tag = Tag::new_unchecked('t');
    pub const PARSE_COMPLETE: Tag = Tag::new_unchecked('1');
    pub const PORTAL_SUSPENDED: Tag = Tag::new_unchecked('s');
    pub const READY_FOR_QUERY: Tag = Tag::new_unchecked('Z');
    pub const ROW_DESCRIPTION: Tag = Tag::new_unchecked('T');
    // Backend, legacy protocol only
    pub const BINARY_ROW: Tag = Tag::new_unchecked('B');
    pub const CURSOR_RESPONSE: Tag = Tag::new_unchecked('P');
    // Backend Async Messages (can also be synchronous, depending on context)
    pub const ERROR_RESPONSE: Tag = Tag::new_unchecked('E');
    pub const PARAMETER_STATUS: Tag = Tag::new_unchecked('S');
    pub const NOTICE_RESPONSE: Tag = Tag::new_unchecked('N');
    pub const NOTIFICATION_RESPONSE: Tag = Tag::new_unchecked('A');

    /// new returns the Tag for b, or an error if b is not a known message kind in either direction.
    pub fn new(b: u8) -> Result<Self> {
        let tag = Tag(b);
        if tag.name() == "Unknown" {
            Err(Error::protocol_error(format!("unknown message tag '{}'", b as char)))
        } else {
            Ok(tag)
        }
    }

    pub const fn new_unchecked(c: char) -> Self {
        Tag(c as u8)
    }

    pub const fn from_u8(b: u8) -> Self {
        Tag(b)
    }

    pub const fn as_u8(&self) -> u8 {
        self.0
    }

    pub fn as_char(&self) -> char {
        self.0 as char
    }

    /// name returns a descriptive name for the tag. Tags that are reused across directions
    /// are named for both, e.g. "CommandComplete/Close".
    pub fn name(&self) -> &'static str {
        match self.0 {
            0 => "Untagged",
            b'1' => "ParseComplete",
            b'2' => "BindComplete",
            b'3' => "CloseComplete",
            b'A' => "NotificationResponse",
            b'B' => "Bind/BinaryRow",
            b'C' => "CommandComplete/Close",
            b'D' => "DataRow/Describe",
            b'E' => "ErrorResponse/Execute",
            b'F' => "FunctionCall",
            b'G' => "CopyInResponse",
            b'H' => "CopyOutResponse/Flush",
            b'I' => "EmptyQueryResponse",
            b'K' => "BackendKeyData",
            b'N' => "NoticeResponse",
            b'P' => "Parse/CursorResponse",
            b'Q' => "Query",
            b'R' => "Authentication",
            b'S' => "ParameterStatus/Sync",
            b'T' => "RowDescription",
            b'V' => "FunctionCallResponse",
            b'W' => "CopyBothResponse",
            b'X' => "Terminate",
            b'Z' => "ReadyForQuery",
            b'c' => "CopyDone",
            b'd' => "CopyData",
            b'f' => "CopyFail",
            b'n' => "NoData",
            b'p' => "PasswordMessage",
            b's' => "PortalSuspended",
            b't' => "ParameterDescription",
            b'v' => "NegotiateProtocolVersion",
            _ => "Unknown",
        }
    }
}

impl Display for Tag {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.0.is_ascii_graphic() {
            f.write_fmt(format_args!("{}('{}')", self.name(), self.0 as char))
        } else {
            f.write_fmt(format_args!("{}({})", self.name(), self.0))
        }
    }
}

impl Debug for Tag {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Display::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tag_names() {
        assert_eq!(Tag::READY_FOR_QUERY.to_string(), "ReadyForQuery('Z')");
        assert_eq!(Tag::UNTAGGED.to_string(), "Untagged(0)");
        assert_eq!(Tag::COMMAND_COMPLETE, Tag::CLOSE);
        assert!(Tag::new(b'!').is_err());
        assert_eq!(Tag::new(b'Q').unwrap(), Tag::QUERY);
    }
}
