use std::fmt::Debug;
use std::fmt::Display;
use std::{fmt, io, result};
use std::net::AddrParseError;
use std::sync::PoisonError;

#[derive(Debug, PartialEq, Eq)]
pub struct Error {
    err: Box<ErrorKind>, // use a Box to keep the Result type smaller
}

#[derive(Debug)]
pub enum ErrorKind {
    LowMemoryError,
    Timeout,
    ClosedError,
    PoisonError,
    IOError(io::Error),
    /// The byte stream is no longer framed correctly, nothing can be recovered.
    ProtocolError(String),
    /// Backends answered the same request differently.
    DisagreementError(String),
    /// Backends returned structurally different row descriptions.
    SchemaMismatchError(String),
    StringError(String),
    YAMLError(serde_yaml::Error),
    UTF8Error(std::str::Utf8Error),
}

pub type Result<T> = result::Result<T, Error>;

impl Error {
    pub fn new<S: ToString>(s: S) -> Self {
        Self::from_kind(ErrorKind::StringError(s.to_string()))
    }

    fn from_kind(kind: ErrorKind) -> Self {
        Error {
            err: Box::new(kind),
        }
    }

    pub fn low_mem() -> Self {
        Self::from_kind(ErrorKind::LowMemoryError)
    }

    pub fn timeout() -> Self {
        Self::from_kind(ErrorKind::Timeout)
    }

    pub fn closed() -> Self {
        Self::from_kind(ErrorKind::ClosedError)
    }

    pub fn protocol_error<S: ToString>(s: S) -> Self {
        Self::from_kind(ErrorKind::ProtocolError(s.to_string()))
    }

    pub fn disagreement<S: ToString>(s: S) -> Self {
        Self::from_kind(ErrorKind::DisagreementError(s.to_string()))
    }

    pub fn schema_mismatch<S: ToString>(s: S) -> Self {
        Self::from_kind(ErrorKind::SchemaMismatchError(s.to_string()))
    }

    pub fn kind(&self) -> &ErrorKind {
        &self.err
    }

    /// is_session_fatal returns true if the session cannot continue after this error.
    /// Timeouts are advisory, and a disagreement has already been reported to the client.
    pub fn is_session_fatal(&self) -> bool {
        !matches!(*self.err, ErrorKind::Timeout | ErrorKind::DisagreementError(_))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(*self.err, ErrorKind::Timeout)
    }

    pub fn is_closed(&self) -> bool {
        matches!(*self.err, ErrorKind::ClosedError)
    }
}

impl From<&str> for Error {
    fn from(err: &str) -> Self {
        Error::new(err)
    }
}

impl From<String> for Error {
    fn from(err: String) -> Self {
        Error::from_kind(ErrorKind::StringError(err))
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        let kind = match err.kind() {
            io::ErrorKind::UnexpectedEof => ErrorKind::ClosedError,
            io::ErrorKind::TimedOut => ErrorKind::Timeout,
            io::ErrorKind::OutOfMemory => ErrorKind::LowMemoryError,
            _ => ErrorKind::IOError(err),
        };
        Error::from_kind(kind)
    }
}

impl From<tokio::time::error::Elapsed> for Error {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Error::timeout()
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(err: serde_yaml::Error) -> Self {
        Error::from_kind(ErrorKind::YAMLError(err))
    }
}

impl From<std::str::Utf8Error> for Error {
    fn from(err: std::str::Utf8Error) -> Self {
        Error::from_kind(ErrorKind::UTF8Error(err))
    }
}

impl From<AddrParseError> for Error {
    fn from(err: AddrParseError) -> Self {
        Error::new(err)
    }
}

impl<Guard> From<PoisonError<Guard>> for Error {
    fn from(_: PoisonError<Guard>) -> Self {
        Error::from_kind(ErrorKind::PoisonError)
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        Display::fmt(&self.err, f)
    }
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ErrorKind::LowMemoryError => f.write_str("not enough memory to handle this request"),
            ErrorKind::Timeout => f.write_str("operation timed out"),
            ErrorKind::ClosedError => f.write_str("socket/file is closed"),
            ErrorKind::PoisonError => f.write_str("another thread panicked while holding the mutex"),
            ErrorKind::IOError(e) => Display::fmt(&e, f),
            ErrorKind::ProtocolError(s) => f.write_str(s),
            ErrorKind::DisagreementError(s) => f.write_str(s),
            ErrorKind::SchemaMismatchError(s) => f.write_str(s),
            ErrorKind::StringError(s) => f.write_str(s),
            ErrorKind::YAMLError(e) => Display::fmt(&e, f),
            ErrorKind::UTF8Error(e) => Display::fmt(&e, f),
        }
    }
}

impl PartialEq for ErrorKind {
    fn eq(&self, other: &Self) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other)
    }
}

impl Eq for ErrorKind {}
