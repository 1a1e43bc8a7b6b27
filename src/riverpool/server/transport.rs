use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::debug;

use crate::riverpool::Result;

/// Transport is any bidirectional byte channel a PoolStream can wrap.
/// Production code uses TcpStream, tests use tokio::io::duplex pipes.
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Transport for T {}

/// connect opens a TCP connection to a backend, giving up after connect_timeout.
pub async fn connect(host: &str, port: u16, connect_timeout: Duration) -> Result<TcpStream> {
    let addr = format!("{}:{}", host, port);
    let stream = tokio::time::timeout(connect_timeout, TcpStream::connect(&addr)).await??;
    stream.set_nodelay(true)?;
    debug!(%addr, "connected to backend");
    Ok(stream)
}
