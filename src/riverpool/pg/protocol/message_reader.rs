use std::cell::Cell;
use std::convert::TryInto;

use crate::riverpool::pg::protocol::Message;
use crate::riverpool::{Error, Result};


/// MessageReader reads typed values from the payload of a Message.
pub struct MessageReader<'a> {
    pub msg: &'a Message,
    pos: Cell<u32>, // track position for read_xxx methods
    read_past_end: Cell<bool>, // true if we tried to read past the end of the message
}

impl<'a> MessageReader<'a> {
    pub fn new(msg: &'a Message) -> Self {
        MessageReader{
            msg,
            pos: Cell::new(0),
            read_past_end: Cell::new(false),
        }
    }

    pub fn len(&self) -> u32 {
        self.msg.len()
    }

    /// error returns an Error if has_error() is true
    pub fn error(&self) -> Result<()> {
        if self.has_error() {
            Err(self.past_end_error())
        } else {
            Ok(())
        }
    }

    fn past_end_error(&self) -> Error {
        Error::protocol_error(format!("attempted to read past end of {:?}", self.msg))
    }

    /// has_error returns true if any of the read_* methods attempted to read beyond the end of the Message
    pub fn has_error(&self) -> bool {
        self.read_past_end.get()
    }

    fn advance(&self, n: u32) -> Option<&'a [u8]> {
        let pos = self.pos.get();
        let new_pos = pos + n;
        if new_pos > self.msg.len() {
            self.read_past_end.set(true);
            return None;
        }
        self.pos.set(new_pos);
        Some(&self.msg.body()[pos as usize..new_pos as usize])
    }

    /// read_byte reads a single byte and returns it.
    /// Returns 0 if no bytes left, use error() or has_error() to distinguish between that and an actual 0.
    pub fn read_byte(&self) -> u8 {
        self.advance(1).map(|b| b[0]).unwrap_or(0)
    }

    /// read_i16 reads an i16 and returns it.
    /// Returns 0 if no bytes left, use error() or has_error() to distinguish between that and an actual 0.
    pub fn read_i16(&self) -> i16 {
        match self.advance(2) {
            Some(b) => i16::from_be_bytes([b[0], b[1]]),
            None => 0,
        }
    }

    /// read_i32 reads an i32 and returns it.
    /// Returns 0 if no bytes left, use error() or has_error() to distinguish between that and an actual 0.
    pub fn read_i32(&self) -> i32 {
        match self.advance(4).and_then(|b| b.try_into().ok()) {
            Some(b) => i32::from_be_bytes(b),
            None => 0,
        }
    }

    /// read_str reads and returns a null-terminated utf-8 string
    pub fn read_str(&self) -> Result<&'a str> {
        let bytes = self.read_null_terminated_bytes()?;
        std::str::from_utf8(bytes).map_err(Error::from)
    }

    /// read_null_terminated_bytes reads and returns a null-terminated slice of bytes (without the null)
    pub fn read_null_terminated_bytes(&self) -> Result<&'a [u8]> {
        let msg: &'a Message = self.msg;
        let pos = self.pos.get() as usize;
        let bytes = &msg.body()[pos.min(msg.body().len())..];
        if let Some(i) = memchr::memchr(0, bytes) {
            self.pos.set((pos + i + 1) as u32);
            Ok(&bytes[..i])
        } else {
            self.read_past_end.set(true);
            Err(self.past_end_error())
        }
    }

    /// read_bytes reads and returns a slice of bytes of the specified length
    pub fn read_bytes(&self, len: u32) -> Result<&'a [u8]> {
        self.advance(len).ok_or_else(|| self.past_end_error())
    }

    /// read_to_end returns the remaining bytes of the payload
    pub fn read_to_end(&self) -> &'a [u8] {
        let msg: &'a Message = self.msg;
        let pos = self.pos.get();
        self.pos.set(msg.len());
        &msg.body()[pos as usize..]
    }

    pub fn seek(&self, pos: u32) -> Result<u32> {
        if pos > self.len() {
            return Err(Error::protocol_error("cannot seek beyond end of message"));
        }
        Ok(self.pos.replace(pos))
    }

    pub fn tell(&self) -> u32 {
        self.pos.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use crate::riverpool::pg::protocol::Tag;

    #[test]
    fn test_read_values() {
        let msg = Message::new(Tag::ROW_DESCRIPTION, Bytes::from_static(b"\x00\x01id\x00\x00\x00\x00\x17"));
        let r = msg.reader();
        assert_eq!(r.read_i16(), 1);
        assert_eq!(r.read_str().unwrap(), "id");
        assert_eq!(r.read_i32(), 23);
        assert!(!r.has_error());
        assert_eq!(r.read_byte(), 0);
        assert!(r.has_error());
        assert!(r.error().is_err());
    }

    #[test]
    fn test_missing_terminator() {
        let msg = Message::new(Tag::QUERY, Bytes::from_static(b"SELECT 1"));
        assert!(msg.reader().read_str().is_err());
    }
}
