use bytes::{BytesMut, BufMut};

use crate::riverpool::pg::protocol::{Tag, Message, ServerParams};

/// MessageBuilder accumulates the payload of a single Message.
/// The framer adds the length prefix (or not) when the Message is sent.
pub struct MessageBuilder {
    tag: Tag,
    data: BytesMut,
}

impl MessageBuilder {
    pub fn new(tag: Tag) -> Self {
        MessageBuilder {
            tag,
            data: BytesMut::with_capacity(256), // typically we build short messages
        }
    }

    pub fn reserve(&mut self, additional_size: usize) {
        self.data.reserve(additional_size)
    }

    pub fn bytes_mut(&mut self) -> &mut BytesMut {
        &mut self.data
    }

    pub fn tag(&self) -> Tag {
        self.tag
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn finish(self) -> Message {
        Message::new(self.tag, self.data.freeze())
    }

    pub fn write_byte(&mut self, b: u8) -> &mut Self {
        self.data.put_u8(b);
        self
    }

    pub fn write_str(&mut self, s: &str) -> &mut Self {
        self.write_bytes(s.as_bytes());
        self.write_byte(0)
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) -> &mut Self {
        self.data.extend_from_slice(bytes);
        self
    }

    pub fn write_i16(&mut self, i: i16) -> &mut Self {
        self.data.put_i16(i);
        self
    }

    pub fn write_i32(&mut self, i: i32) -> &mut Self {
        self.data.put_i32(i);
        self
    }

    pub fn write_params(&mut self, params: &ServerParams) -> &mut Self {
        for (k, v) in params.iter() {
            self.write_str(k);
            self.write_str(v);
        }
        self
    }
}
