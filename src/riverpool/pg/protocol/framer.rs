use bytes::{BufMut, Bytes, BytesMut};
use tracing::trace;

use crate::riverpool::{Error, Result};
use crate::riverpool::pg::protocol::{Message, ProtocolVersion, Tag};
use crate::riverpool::pg::stream::{Peer, PoolStream};

/// Declared lengths above this are treated as a framing error
pub const MAX_MESSAGE_LEN: u32 = 1 << 30;
/// The largest startup packet we accept, including the length field
pub const MAX_STARTUP_LEN: i32 = 10000;

/// The result of decoding a message header. length is the payload length for the modern
/// format and None for the legacy format, where the tag determines the layout.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct Header {
    pub tag: Tag,
    pub length: Option<u32>,
}

/// decode_header reads the tag byte and, for V3, the length that follows it.
pub async fn decode_header(stream: &mut PoolStream) -> Result<Header> {
    let tag = Tag::from_u8(stream.read_byte().await?);
    if stream.protocol.is_legacy() {
        return Ok(Header{tag, length: None});
    }
    let declared = stream.read_i32().await?;
    if declared < 4 || declared as u32 > MAX_MESSAGE_LEN {
        return Err(Error::protocol_error(format!("InvalidFraming: {} declared length {}", tag, declared)));
    }
    Ok(Header{tag, length: Some(declared as u32 - 4)})
}

/// read_payload reads the body of the message described by header.
pub async fn read_payload(stream: &mut PoolStream, header: Header) -> Result<Bytes> {
    match header.length {
        Some(len) => stream.read_exact(len as usize).await,
        None => match stream.peer {
            Peer::Backend(_) => read_legacy_backend_payload(stream, header.tag).await,
            Peer::Frontend => read_legacy_frontend_payload(stream, header.tag).await,
        }
    }
}

/// read_message reads one complete message.
pub async fn read_message(stream: &mut PoolStream) -> Result<Message> {
    let header = decode_header(stream).await?;
    let body = read_payload(stream, header).await?;
    let msg = Message::new(header.tag, body);
    if msg.tag() == Tag::ROW_DESCRIPTION && matches!(stream.peer, Peer::Backend(_)) {
        stream.row_fields = msg.reader().read_i16().max(0) as usize;
    }
    trace!(peer = ?stream.peer, %msg, "read message");
    Ok(msg)
}

/// read_startup reads the untagged, length-prefixed first packet of a connection and returns its body.
pub async fn read_startup(stream: &mut PoolStream) -> Result<Bytes> {
    let len = stream.read_i32().await?;
    if !(8..=MAX_STARTUP_LEN).contains(&len) {
        return Err(Error::protocol_error(format!("InvalidFraming: startup packet length {}", len)));
    }
    stream.read_exact(len as usize - 4).await
}

/// encode appends the wire form of msg to buf. Untagged messages always carry a length.
pub fn encode(protocol: ProtocolVersion, msg: &Message, buf: &mut BytesMut) {
    let tag = msg.tag();
    buf.reserve(msg.body().len() + 5);
    if tag != Tag::UNTAGGED {
        buf.put_u8(tag.as_u8());
    }
    if tag == Tag::UNTAGGED || !protocol.is_legacy() {
        buf.put_i32(msg.len() as i32 + 4);
    }
    buf.extend_from_slice(msg.body());
}

/// write_message encodes msg into the stream's write buffer without flushing.
pub fn write_message(stream: &mut PoolStream, msg: &Message) -> Result<()> {
    let protocol = stream.protocol;
    let mut buf = BytesMut::new();
    encode(protocol, msg, &mut buf);
    stream.write(&buf)
}

/// encode_and_send encodes msg and flushes it to the peer.
pub async fn encode_and_send(stream: &mut PoolStream, msg: &Message) -> Result<()> {
    write_message(stream, msg)?;
    stream.flush().await
}

/// encoded_bytes returns the wire form of msg for the given protocol
pub fn encoded_bytes(protocol: ProtocolVersion, msg: &Message) -> Bytes {
    let mut buf = BytesMut::new();
    encode(protocol, msg, &mut buf);
    buf.freeze()
}

async fn read_into(stream: &mut PoolStream, buf: &mut BytesMut, n: usize) -> Result<()> {
    let bytes = stream.read_exact(n).await?;
    buf.extend_from_slice(&bytes);
    Ok(())
}

async fn read_string_into(stream: &mut PoolStream, buf: &mut BytesMut) -> Result<()> {
    let bytes = stream.read_string().await?;
    buf.extend_from_slice(&bytes);
    Ok(())
}

async fn read_i32_into(stream: &mut PoolStream, buf: &mut BytesMut) -> Result<i32> {
    let i = stream.read_i32().await?;
    buf.put_i32(i);
    Ok(i)
}

async fn read_i16_into(stream: &mut PoolStream, buf: &mut BytesMut) -> Result<i16> {
    let i = stream.read_i16().await?;
    buf.put_i16(i);
    Ok(i)
}

/// Legacy data rows: a null bitmap then, per non-null column, an i32 size and the data.
/// AsciiRow sizes include the size field itself, BinaryRow sizes don't.
async fn read_legacy_row(stream: &mut PoolStream, buf: &mut BytesMut, size_includes_self: bool) -> Result<()> {
    let num_fields = stream.row_fields;
    let bitmap_len = (num_fields + 7) / 8;
    let bitmap = stream.read_exact(bitmap_len).await?;
    buf.extend_from_slice(&bitmap);
    for i in 0..num_fields {
        let not_null = bitmap[i / 8] & (0x80 >> (i % 8)) != 0;
        if !not_null {
            continue;
        }
        let mut size = read_i32_into(stream, buf).await?;
        if size_includes_self {
            size -= 4;
        }
        if size < 0 || size as u32 > MAX_MESSAGE_LEN {
            return Err(Error::protocol_error(format!("InvalidFraming: legacy row field size {}", size)));
        }
        read_into(stream, buf, size as usize).await?;
    }
    Ok(())
}

async fn read_legacy_backend_payload(stream: &mut PoolStream, tag: Tag) -> Result<Bytes> {
    let mut buf = BytesMut::new();
    match tag {
        Tag::NOTIFICATION_RESPONSE => {
            read_i32_into(stream, &mut buf).await?;
            read_string_into(stream, &mut buf).await?;
        },
        Tag::BINARY_ROW => read_legacy_row(stream, &mut buf, false).await?,
        Tag::DATA_ROW => read_legacy_row(stream, &mut buf, true).await?,
        Tag::COMMAND_COMPLETE | Tag::ERROR_RESPONSE | Tag::NOTICE_RESPONSE | Tag::CURSOR_RESPONSE | Tag::EMPTY_QUERY => {
            read_string_into(stream, &mut buf).await?;
        },
        Tag::COPY_IN_RESPONSE | Tag::COPY_OUT_RESPONSE | Tag::READY_FOR_QUERY => (),
        Tag::BACKEND_KEY_DATA => read_into(stream, &mut buf, 8).await?,
        Tag::AUTHENTICATION => {
            match read_i32_into(stream, &mut buf).await? {
                4 => read_into(stream, &mut buf, 2).await?, // crypt salt
                5 => read_into(stream, &mut buf, 4).await?, // md5 salt
                _ => (),
            }
        },
        Tag::ROW_DESCRIPTION => {
            let num_fields = read_i16_into(stream, &mut buf).await?;
            for _ in 0..num_fields {
                read_string_into(stream, &mut buf).await?;
                read_into(stream, &mut buf, 4 + 2 + 4).await?;
            }
        },
        Tag::FUNCTION_CALL_RESPONSE => {
            let b = stream.read_byte().await?;
            buf.put_u8(b);
            if b == b'G' {
                let len = read_i32_into(stream, &mut buf).await?;
                if len < 0 {
                    return Err(Error::protocol_error("InvalidFraming: negative function result length"));
                }
                read_into(stream, &mut buf, len as usize + 1).await?; // result + trailing '0'
            }
        },
        _ => return Err(Error::protocol_error(format!("InvalidFraming: unknown legacy backend message {}", tag))),
    }
    Ok(buf.freeze())
}

async fn read_legacy_frontend_payload(stream: &mut PoolStream, tag: Tag) -> Result<Bytes> {
    let mut buf = BytesMut::new();
    match tag {
        Tag::QUERY => read_string_into(stream, &mut buf).await?,
        Tag::TERMINATE => (),
        Tag::FUNCTION_CALL => {
            read_string_into(stream, &mut buf).await?;
            read_i32_into(stream, &mut buf).await?; // function oid
            let nargs = read_i32_into(stream, &mut buf).await?;
            for _ in 0..nargs {
                let len = read_i32_into(stream, &mut buf).await?;
                if len < 0 {
                    return Err(Error::protocol_error("InvalidFraming: negative function argument length"));
                }
                read_into(stream, &mut buf, len as usize).await?;
            }
        },
        _ => return Err(Error::protocol_error(format!("InvalidFraming: unknown legacy frontend message {}", tag))),
    }
    Ok(buf.freeze())
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_env_log::test;
    use tokio::io::{duplex, AsyncWriteExt};
    use crate::riverpool::pg::protocol::MessageBuilder;

    fn pipe(peer: Peer, protocol: ProtocolVersion) -> (tokio::io::DuplexStream, PoolStream) {
        let (remote, local) = duplex(1 << 16);
        (remote, PoolStream::new(local, peer, protocol))
    }

    #[test(tokio::test)]
    async fn test_v3_round_trip() {
        let (mut remote, mut stream) = pipe(Peer::Frontend, ProtocolVersion::V3);
        let msg = Message::new(Tag::QUERY, Bytes::from_static(b"SELECT 1\0"));
        let wire = encoded_bytes(ProtocolVersion::V3, &msg);
        assert_eq!(&wire[..5], &[b'Q', 0, 0, 0, 13]);
        remote.write_all(&wire).await.unwrap();
        remote.write_all(&encoded_bytes(ProtocolVersion::V3, &Message::new(Tag::SYNC, Bytes::new()))).await.unwrap();

        assert_eq!(read_message(&mut stream).await.unwrap(), msg);
        let sync = read_message(&mut stream).await.unwrap();
        assert_eq!(sync.tag(), Tag::SYNC);
        assert_eq!(sync.len(), 0);
    }

    #[test(tokio::test)]
    async fn test_invalid_length() {
        let (mut remote, mut stream) = pipe(Peer::Backend(0), ProtocolVersion::V3);
        remote.write_all(&[b'C', 0, 0, 0, 3]).await.unwrap();
        let err = read_message(&mut stream).await.unwrap_err();
        assert!(matches!(err.kind(), crate::riverpool::ErrorKind::ProtocolError(_)));
    }

    #[test(tokio::test)]
    async fn test_legacy_rows() {
        let (mut remote, mut stream) = pipe(Peer::Backend(0), ProtocolVersion::V2);
        let mut rd = MessageBuilder::new(Tag::ROW_DESCRIPTION);
        rd.write_i16(2).write_str("a").write_i32(23).write_i16(4).write_i32(-1)
            .write_str("b").write_i32(25).write_i16(-1).write_i32(-1);
        let rd = rd.finish();
        // second column is null
        let mut row = MessageBuilder::new(Tag::DATA_ROW);
        row.write_byte(0x80).write_i32(5).write_byte(b'7');
        let row = row.finish();
        let cc = Message::new(Tag::COMMAND_COMPLETE, Bytes::from_static(b"SELECT\0"));
        let z = Message::new(Tag::READY_FOR_QUERY, Bytes::new());
        for m in [&rd, &row, &cc, &z] {
            remote.write_all(&encoded_bytes(ProtocolVersion::V2, m)).await.unwrap();
        }

        assert_eq!(read_message(&mut stream).await.unwrap(), rd);
        assert_eq!(stream.row_fields, 2);
        assert_eq!(read_message(&mut stream).await.unwrap(), row);
        assert_eq!(read_message(&mut stream).await.unwrap(), cc);
        assert_eq!(read_message(&mut stream).await.unwrap(), z);
    }

    #[test(tokio::test)]
    async fn test_legacy_function_result() {
        let (mut remote, mut stream) = pipe(Peer::Backend(1), ProtocolVersion::V2);
        remote.write_all(b"VG\x00\x00\x00\x02hi0V0").await.unwrap();
        let first = read_message(&mut stream).await.unwrap();
        assert_eq!(first.body(), b"G\x00\x00\x00\x02hi0");
        let second = read_message(&mut stream).await.unwrap();
        assert_eq!(second.body(), b"0");
    }

    #[test(tokio::test)]
    async fn test_startup_length() {
        let (mut remote, mut stream) = pipe(Peer::Frontend, ProtocolVersion::V3);
        remote.write_all(&[0, 0, 0, 8, 4, 210, 22, 47]).await.unwrap();
        let body = read_startup(&mut stream).await.unwrap();
        assert_eq!(&body[..], &[4, 210, 22, 47]);

        remote.write_all(&[0, 0, 0, 2]).await.unwrap();
        assert!(read_startup(&mut stream).await.is_err());
    }
}
