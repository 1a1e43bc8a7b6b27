use std::fmt;
use std::fmt::{Display, Formatter};
use std::str::FromStr;

use strum::EnumString;

use crate::riverpool::{Error, Result};
use crate::riverpool::pg::protocol::{Message, ProtocolVersion, Tag};

#[derive(EnumString, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Debug)]
#[strum(serialize_all = "UPPERCASE", ascii_case_insensitive)]
#[repr(u8)]
pub enum ErrorSeverity {
    Log,
    Info,
    Debug,
    Notice,
    Warning,
    Error,
    Fatal,
    Panic,
}

impl ErrorSeverity {
    pub fn as_str(&self) -> &'static str {
        match *self {
            ErrorSeverity::Panic => "PANIC",
            ErrorSeverity::Fatal => "FATAL",
            ErrorSeverity::Error => "ERROR",
            ErrorSeverity::Warning => "WARNING",
            ErrorSeverity::Notice => "NOTICE",
            ErrorSeverity::Debug => "DEBUG",
            ErrorSeverity::Info => "INFO",
            ErrorSeverity::Log => "LOG",
        }
    }
}

impl Display for ErrorSeverity {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Default for ErrorSeverity {
    fn default() -> Self {
        ErrorSeverity::Log
    }
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct ErrorFieldTag(u8);

impl ErrorFieldTag {
    pub const NULL_TERMINATOR: ErrorFieldTag = ErrorFieldTag::new_unchecked(0);
    pub const LOCALIZED_SEVERITY: ErrorFieldTag = ErrorFieldTag::new_unchecked(b'S');
    pub const SEVERITY: ErrorFieldTag = ErrorFieldTag::new_unchecked(b'V');
    pub const CODE: ErrorFieldTag = ErrorFieldTag::new_unchecked(b'C');
    pub const MESSAGE: ErrorFieldTag = ErrorFieldTag::new_unchecked(b'M');
    pub const MESSAGE_DETAIL: ErrorFieldTag = ErrorFieldTag::new_unchecked(b'D');
    pub const MESSAGE_HINT: ErrorFieldTag = ErrorFieldTag::new_unchecked(b'H');
    pub const POSITION: ErrorFieldTag = ErrorFieldTag::new_unchecked(b'P');
    pub const WHERE: ErrorFieldTag = ErrorFieldTag::new_unchecked(b'W');
    pub const FILE: ErrorFieldTag = ErrorFieldTag::new_unchecked(b'F');
    pub const LINE: ErrorFieldTag = ErrorFieldTag::new_unchecked(b'L');
    pub const ROUTINE: ErrorFieldTag = ErrorFieldTag::new_unchecked(b'R');

    pub const fn new_unchecked(b: u8) -> Self {
        ErrorFieldTag(b)
    }

    pub fn as_u8(&self) -> u8 {
        self.0
    }
}

impl Display for ErrorFieldTag {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let name = match *self {
            ErrorFieldTag::NULL_TERMINATOR => "null terminator",
            ErrorFieldTag::LOCALIZED_SEVERITY => "localized severity",
            ErrorFieldTag::SEVERITY => "severity",
            ErrorFieldTag::CODE => "code",
            ErrorFieldTag::MESSAGE => "message",
            ErrorFieldTag::MESSAGE_DETAIL => "message detail",
            ErrorFieldTag::MESSAGE_HINT => "message hint",
            ErrorFieldTag::POSITION => "position",
            ErrorFieldTag::WHERE => "where",
            ErrorFieldTag::FILE => "file",
            ErrorFieldTag::LINE => "line",
            ErrorFieldTag::ROUTINE => "routine",
            _ => { return f.write_fmt(format_args!("error field '{}'", self.0 as char)); },
        };
        f.write_str(name)
    }
}

/// The fields of an ErrorResponse or NoticeResponse we care about.
/// A V2 message carries only a string, so code is empty and message is the whole text.
#[derive(Clone, Debug, Default)]
pub struct ErrorFields {
    pub severity: String,
    pub code: String,
    pub message: String,
    pub detail: Option<String>,
    pub hint: Option<String>,
}

impl ErrorFields {
    pub fn parse(msg: &Message, version: ProtocolVersion) -> Result<Self> {
        if msg.tag() != Tag::ERROR_RESPONSE && msg.tag() != Tag::NOTICE_RESPONSE {
            return Err(Error::protocol_error(format!("expected error or notice, got {}", msg.tag())));
        }
        let r = msg.reader();
        let mut fields = ErrorFields::default();
        if version.is_legacy() {
            let text = r.read_str()?;
            if let Some(i) = text.find(':') {
                fields.severity = text[..i].trim().to_string();
            }
            fields.message = text.to_string();
            return Ok(fields);
        }
        loop {
            let field = ErrorFieldTag::new_unchecked(r.read_byte());
            if r.has_error() || field == ErrorFieldTag::NULL_TERMINATOR {
                break;
            }
            let value = r.read_str()?.to_string();
            match field {
                ErrorFieldTag::LOCALIZED_SEVERITY => fields.severity = value,
                ErrorFieldTag::CODE => fields.code = value,
                ErrorFieldTag::MESSAGE => fields.message = value,
                ErrorFieldTag::MESSAGE_DETAIL => fields.detail = Some(value),
                ErrorFieldTag::MESSAGE_HINT => fields.hint = Some(value),
                _ => (),
            }
        }
        Ok(fields)
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn hint(&self) -> Option<&str> {
        self.hint.as_deref()
    }

    pub fn severity(&self) -> Option<ErrorSeverity> {
        ErrorSeverity::from_str(&self.severity).ok()
    }

    /// is_panic_or_fatal returns true if the backend is about to close the connection
    pub fn is_panic_or_fatal(&self) -> bool {
        matches!(self.severity(), Some(ErrorSeverity::Panic) | Some(ErrorSeverity::Fatal))
    }
}
