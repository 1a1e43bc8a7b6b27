use std::fmt;
use std::fmt::{Display, Formatter};

use bytes::{Bytes, BytesMut, BufMut};

use crate::riverpool::{Error, Result};
use crate::riverpool::pg::protocol::{Message, ServerParams, Tag};

pub const SSL_REQUEST: i32 = 80877103;
pub const CANCEL_REQUEST_CODE: i32 = 80877102;
pub const PROTOCOL_V2: i32 = 2 << 16;
pub const PROTOCOL_V3: i32 = 3 << 16;

/// Size of the fixed V2 startup packet body, after the length prefix
const V2_STARTUP_LEN: usize = 4 + 64 + 32 + 64 + 64 + 64;

/// The wire format generation negotiated at startup.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum ProtocolVersion {
    /// Legacy: no length prefix after the tag, null-terminated string payloads
    V2,
    /// Modern: tag + 4-byte length including itself + payload
    V3,
}

impl ProtocolVersion {
    pub fn from_code(code: i32) -> Result<Self> {
        match code >> 16 {
            2 => Ok(ProtocolVersion::V2),
            3 => Ok(ProtocolVersion::V3),
            major => Err(Error::protocol_error(format!("unsupported frontend protocol {}.{}", major, code & 0xffff))),
        }
    }

    pub fn major(&self) -> i32 {
        match self {
            ProtocolVersion::V2 => 2,
            ProtocolVersion::V3 => 3,
        }
    }

    pub fn is_legacy(&self) -> bool {
        *self == ProtocolVersion::V2
    }
}

impl Default for ProtocolVersion {
    fn default() -> Self {
        ProtocolVersion::V3
    }
}

impl Display for ProtocolVersion {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_fmt(format_args!("{}.0", self.major()))
    }
}

/// The first packet a client sends. All three forms are untagged and length-prefixed.
#[derive(Clone, Debug)]
pub enum StartupPacket {
    SslRequest,
    CancelRequest{pid: i32, key: i32},
    Startup{version: ProtocolVersion, params: ServerParams, raw: Bytes},
}

impl StartupPacket {
    /// parse decodes the body of the startup packet (everything after the length prefix)
    pub fn parse(body: &Bytes) -> Result<Self> {
        let msg = Message::new(Tag::UNTAGGED, body.clone());
        let r = msg.reader();
        let code = r.read_i32();
        r.error()?;
        match code {
            SSL_REQUEST => Ok(StartupPacket::SslRequest),
            CANCEL_REQUEST_CODE => {
                let pid = r.read_i32();
                let key = r.read_i32();
                r.error()?;
                Ok(StartupPacket::CancelRequest{pid, key})
            },
            _ => {
                let version = ProtocolVersion::from_code(code)?;
                let params = match version {
                    ProtocolVersion::V3 => parse_v3_params(&msg)?,
                    ProtocolVersion::V2 => parse_v2_params(body)?,
                };
                if params.get("user").is_none() {
                    return Err(Error::protocol_error("user is a required parameter"));
                }
                Ok(StartupPacket::Startup{version, params, raw: body.clone()})
            }
        }
    }

    /// encode_cancel builds the 16 byte cancel packet sent to a backend
    pub fn encode_cancel(pid: i32, key: i32) -> Bytes {
        let mut buf = BytesMut::with_capacity(16);
        buf.put_i32(16);
        buf.put_i32(CANCEL_REQUEST_CODE);
        buf.put_i32(pid);
        buf.put_i32(key);
        buf.freeze()
    }
}

fn parse_v3_params(msg: &Message) -> Result<ServerParams> {
    let r = msg.reader();
    r.seek(4)?; // skip the version number
    let mut params = ServerParams::new();
    while let Ok(name) = r.read_str() {
        if name.is_empty() {
            break; // the null-terminator at the end of the message
        }
        let value = r.read_str()?;
        params.add(name.to_string(), value.to_string());
    }
    if params.get("database").is_none() {
        if let Some(user) = params.get("user").map(str::to_string) {
            params.add("database".to_string(), user);
        }
    }
    Ok(params)
}

fn fixed_str(field: &[u8]) -> Result<String> {
    let end = memchr::memchr(0, field).unwrap_or(field.len());
    Ok(std::str::from_utf8(&field[..end])?.to_string())
}

fn parse_v2_params(body: &[u8]) -> Result<ServerParams> {
    if body.len() < V2_STARTUP_LEN {
        return Err(Error::protocol_error("short V2 startup packet"));
    }
    let mut params = ServerParams::new();
    let database = fixed_str(&body[4..68])?;
    let user = fixed_str(&body[68..100])?;
    let options = fixed_str(&body[100..164])?;
    if !user.is_empty() {
        params.add("user".to_string(), user.clone());
    }
    params.add("database".to_string(), if database.is_empty() { user } else { database });
    if !options.is_empty() {
        params.add("options".to_string(), options);
    }
    Ok(params)
}
