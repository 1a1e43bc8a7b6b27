use std::fmt;
use std::fmt::{Debug, Formatter};
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt, AsyncRead, ReadBuf};
use tracing::trace;

use crate::riverpool::{Error, Result};
use crate::riverpool::pg::protocol::{ProtocolVersion, ServerParams};
use crate::riverpool::server::Transport;

/// Raw reads pull at most this many bytes off the wire at a time
pub const READ_CHUNK_SIZE: usize = 1024;
/// The pending buffer may not grow beyond this, the largest legal message plus one chunk
pub const MAX_BUFFER_SIZE: usize = (1 << 30) + READ_CHUNK_SIZE;

/// Transaction state characters as reported by ReadyForQuery
pub const TSTATE_IDLE: u8 = b'I';
pub const TSTATE_IN_TRANSACTION: u8 = b'T';
pub const TSTATE_ERROR: u8 = b'E';

/// Which side of the proxy a stream talks to. Legacy message layouts depend on it.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum Peer {
    Frontend,
    Backend(usize),
}

/// PoolStream buffers reads and writes on one connection.
///
/// Reads are served from the pending buffer first. When that runs dry a single raw read of up
/// to READ_CHUNK_SIZE bytes refills it, and anything beyond what the caller asked for stays
/// pending for the next call. Bytes can be pushed back with unread. Writes accumulate in the
/// write buffer until flush.
pub struct PoolStream {
    io: Box<dyn Transport>,
    pending: BytesMut,
    wbuf: BytesMut,
    timeout: Option<Duration>,
    eof: bool,
    no_forward: bool,
    raw_reads: u64,
    pub peer: Peer,
    pub protocol: ProtocolVersion,
    /// Transaction state: 'I' idle, 'T' in a transaction block, 'E' in a failed transaction
    pub tstate: u8,
    pub params: ServerParams,
    /// Number of fields in the last RowDescription, needed to frame legacy data rows
    pub row_fields: usize,
    pub pid: i32,
    pub key: i32,
}

impl PoolStream {
    pub fn new<T: Transport + 'static>(io: T, peer: Peer, protocol: ProtocolVersion) -> Self {
        PoolStream {
            io: Box::new(io),
            pending: BytesMut::with_capacity(READ_CHUNK_SIZE),
            wbuf: BytesMut::with_capacity(READ_CHUNK_SIZE),
            timeout: None,
            eof: false,
            no_forward: false,
            raw_reads: 0,
            peer,
            protocol,
            tstate: TSTATE_IDLE,
            params: ServerParams::new(),
            row_fields: 0,
            pid: 0,
            key: 0,
        }
    }

    /// set_timeout sets the wait applied to the next blocking reads. 0 means wait forever.
    pub fn set_timeout(&mut self, secs: u64) {
        self.timeout = if secs == 0 { None } else { Some(Duration::from_secs(secs)) };
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// set_no_forward suppresses all writes, used while draining responses nobody should see.
    pub fn set_no_forward(&mut self, value: bool) {
        self.no_forward = value;
    }

    pub fn is_eof(&self) -> bool {
        self.eof
    }

    /// has_pending returns true if a read could be served without touching the socket
    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// raw_reads counts the read syscalls issued so far
    pub fn raw_reads(&self) -> u64 {
        self.raw_reads
    }

    fn check_growth(&self, additional: usize) -> Result<()> {
        if self.pending.len() + additional > MAX_BUFFER_SIZE {
            Err(Error::low_mem())
        } else {
            Ok(())
        }
    }

    fn append_read(&mut self, chunk: &[u8]) -> Result<usize> {
        self.raw_reads += 1;
        if chunk.is_empty() {
            self.eof = true;
            return Err(Error::closed());
        }
        self.check_growth(chunk.len())?;
        self.pending.extend_from_slice(chunk);
        trace!(peer = ?self.peer, n = chunk.len(), "raw read");
        Ok(chunk.len())
    }

    /// fill performs one raw read into the pending buffer, honoring the configured timeout.
    async fn fill(&mut self) -> Result<usize> {
        if self.eof {
            return Err(Error::closed());
        }
        let mut chunk = [0u8; READ_CHUNK_SIZE];
        let n = loop {
            let read = self.io.read(&mut chunk);
            let res = match self.timeout {
                Some(dur) => tokio::time::timeout(dur, read).await?,
                None => read.await,
            };
            match res {
                Ok(n) => break n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::from(e)),
            }
        };
        self.append_read(&chunk[..n])
    }

    /// poll_fill is the readiness primitive for multiplexed waits. When it returns Ready(Ok) the
    /// pending buffer holds new bytes. If it returns Pending nothing was consumed.
    pub fn poll_fill(&mut self, cx: &mut Context<'_>) -> Poll<Result<usize>> {
        if self.eof {
            return Poll::Ready(Err(Error::closed()));
        }
        let mut chunk = [0u8; READ_CHUNK_SIZE];
        let mut buf = ReadBuf::new(&mut chunk);
        match Pin::new(&mut self.io).poll_read(cx, &mut buf) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Err(e)) => Poll::Ready(Err(Error::from(e))),
            Poll::Ready(Ok(())) => {
                let filled = buf.filled().to_vec();
                Poll::Ready(self.append_read(&filled))
            }
        }
    }

    /// read_exact returns exactly n bytes, or an error
    pub async fn read_exact(&mut self, n: usize) -> Result<Bytes> {
        while self.pending.len() < n {
            self.fill().await?;
        }
        Ok(self.pending.split_to(n).freeze())
    }

    pub async fn read_byte(&mut self) -> Result<u8> {
        if self.pending.is_empty() {
            self.fill().await?;
        }
        Ok(self.pending.get_u8())
    }

    pub async fn read_i16(&mut self) -> Result<i16> {
        let mut b = self.read_exact(2).await?;
        Ok(b.get_i16())
    }

    pub async fn read_i32(&mut self) -> Result<i32> {
        let mut b = self.read_exact(4).await?;
        Ok(b.get_i32())
    }

    /// read_string returns the bytes up to and including the next null terminator
    pub async fn read_string(&mut self) -> Result<Bytes> {
        let mut searched = 0;
        loop {
            if let Some(i) = memchr::memchr(0, &self.pending[searched..]) {
                return Ok(self.pending.split_to(searched + i + 1).freeze());
            }
            searched = self.pending.len();
            self.fill().await?;
        }
    }

    /// read_line returns the bytes up to and including the next newline
    pub async fn read_line(&mut self) -> Result<Bytes> {
        let mut searched = 0;
        loop {
            if let Some(i) = memchr::memchr(b'\n', &self.pending[searched..]) {
                return Ok(self.pending.split_to(searched + i + 1).freeze());
            }
            searched = self.pending.len();
            self.fill().await?;
        }
    }

    /// unread pushes bytes back so the next read sees them first
    pub fn unread(&mut self, bytes: &[u8]) -> Result<()> {
        self.check_growth(bytes.len())?;
        let mut joined = BytesMut::with_capacity(bytes.len() + self.pending.len());
        joined.extend_from_slice(bytes);
        joined.extend_from_slice(&self.pending);
        self.pending = joined;
        Ok(())
    }

    /// write buffers bytes to be sent on the next flush
    pub fn write(&mut self, bytes: &[u8]) -> Result<()> {
        if self.no_forward {
            return Ok(());
        }
        if self.wbuf.len() + bytes.len() > MAX_BUFFER_SIZE {
            return Err(Error::low_mem());
        }
        self.wbuf.extend_from_slice(bytes);
        Ok(())
    }

    /// flush writes the whole write buffer, retrying on partial writes and transient errors
    pub async fn flush(&mut self) -> Result<()> {
        while !self.wbuf.is_empty() {
            match self.io.write(&self.wbuf).await {
                Ok(0) => {
                    self.eof = true;
                    return Err(Error::closed());
                },
                Ok(n) => self.wbuf.advance(n),
                Err(e) if matches!(e.kind(), io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock) => {
                    tokio::task::yield_now().await;
                },
                Err(e) => return Err(Error::from(e)),
            }
        }
        self.wbuf.clear();
        self.io.flush().await.map_err(Error::from)
    }

    /// write_and_flush is write followed by flush
    pub async fn write_and_flush(&mut self, bytes: &[u8]) -> Result<()> {
        self.write(bytes)?;
        self.flush().await
    }

    /// shutdown flushes and closes the write half
    pub async fn shutdown(&mut self) -> Result<()> {
        self.flush().await?;
        self.io.shutdown().await.map_err(Error::from)
    }
}

impl Debug for PoolStream {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_fmt(format_args!("PoolStream({:?}, protocol={}, tstate={}, pending={})",
            self.peer, self.protocol, self.tstate as char, self.pending.len()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_env_log::test;
    use tokio::io::duplex;

    #[test(tokio::test)]
    async fn test_pending_is_replayed() {
        let (mut remote, local) = duplex(4096);
        let mut stream = PoolStream::new(local, Peer::Frontend, ProtocolVersion::V3);
        remote.write_all(b"0123456789abcde").await.unwrap();

        let first = stream.read_exact(10).await.unwrap();
        assert_eq!(&first[..], b"0123456789");
        assert_eq!(stream.raw_reads(), 1);
        let rest = stream.read_exact(5).await.unwrap();
        assert_eq!(&rest[..], b"abcde");
        assert_eq!(stream.raw_reads(), 1);
        assert!(!stream.has_pending());
    }

    #[test(tokio::test)]
    async fn test_unread() {
        let (mut remote, local) = duplex(4096);
        let mut stream = PoolStream::new(local, Peer::Backend(0), ProtocolVersion::V3);
        remote.write_all(b"XYZ").await.unwrap();
        let x = stream.read_byte().await.unwrap();
        stream.unread(&[x]).unwrap();
        assert_eq!(&stream.read_exact(3).await.unwrap()[..], b"XYZ");
    }

    #[test(tokio::test)]
    async fn test_read_string() {
        let (mut remote, local) = duplex(4096);
        let mut stream = PoolStream::new(local, Peer::Backend(0), ProtocolVersion::V2);
        remote.write_all(b"SELECT").await.unwrap();
        let reader = tokio::spawn(async move {
            let s = stream.read_string().await.unwrap();
            (s, stream)
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        remote.write_all(b" 1\0rest").await.unwrap();
        let (s, stream) = reader.await.unwrap();
        assert_eq!(&s[..], b"SELECT 1\0");
        assert_eq!(stream.pending_len(), 4);
    }

    #[test(tokio::test)]
    async fn test_eof() {
        let (remote, local) = duplex(64);
        let mut stream = PoolStream::new(local, Peer::Frontend, ProtocolVersion::V3);
        drop(remote);
        assert!(stream.read_byte().await.unwrap_err().is_closed());
        assert!(stream.is_eof());
    }

    #[test(tokio::test)]
    async fn test_timeout() {
        let (_remote, local) = duplex(64);
        let mut stream = PoolStream::new(local, Peer::Backend(1), ProtocolVersion::V3);
        stream.set_timeout(1);
        assert!(stream.read_byte().await.unwrap_err().is_timeout());
    }

    #[test(tokio::test)]
    async fn test_write_flush_and_no_forward() {
        let (mut remote, local) = duplex(64);
        let mut stream = PoolStream::new(local, Peer::Frontend, ProtocolVersion::V3);
        stream.set_no_forward(true);
        stream.write_and_flush(b"hidden").await.unwrap();
        stream.set_no_forward(false);
        stream.write_and_flush(b"shown").await.unwrap();
        let mut buf = [0u8; 5];
        remote.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"shown");
    }
}
