#![allow(dead_code)]

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::AtomicU16;
use std::sync::atomic::Ordering::Relaxed;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpSocket};
use tokio::task::JoinHandle;

pub const TEST_DATABASE: &str = "riverpool_test";
pub const TEST_USER: &str = TEST_DATABASE;
pub const PROTOCOL_V3: i32 = 196608;

pub static LISTEN_PORT: AtomicU16 = AtomicU16::new(10101);

pub fn listener() -> TcpListener {
    let mut port: u16 = 0;
    for _ in 0..10 {
        port = LISTEN_PORT.fetch_add(1, Relaxed);
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port);
        let sock = TcpSocket::new_v4().unwrap();
        if sock.bind(addr).is_ok() {
            return sock.listen(32).expect("couldn't listen on socket");
        }
    }
    panic!("couldn't find an available listen port between {}-{}", port - 10, port);
}

pub fn message(tag: u8, body: &[u8]) -> Vec<u8> {
    let mut out = vec![tag];
    out.extend_from_slice(&(body.len() as i32 + 4).to_be_bytes());
    out.extend_from_slice(body);
    out
}

pub fn cstr(s: &str) -> Vec<u8> {
    let mut out = s.as_bytes().to_vec();
    out.push(0);
    out
}

pub fn startup_packet(user: &str, database: &str) -> Vec<u8> {
    let mut body = PROTOCOL_V3.to_be_bytes().to_vec();
    for s in ["user", user, "database", database] {
        body.extend(cstr(s));
    }
    body.push(0);
    let mut out = (body.len() as i32 + 4).to_be_bytes().to_vec();
    out.extend(body);
    out
}

pub async fn read_message<R: AsyncRead + Unpin>(r: &mut R) -> std::io::Result<(u8, Vec<u8>)> {
    let tag = r.read_u8().await?;
    let len = r.read_i32().await?;
    let mut body = vec![0u8; (len - 4) as usize];
    r.read_exact(&mut body).await?;
    Ok((tag, body))
}

/// read_until_ready returns the tags of the messages up to and including ReadyForQuery
pub async fn read_until_ready<R: AsyncRead + Unpin>(r: &mut R) -> String {
    let mut tags = String::new();
    loop {
        let (tag, _) = read_message(r).await.unwrap();
        tags.push(tag as char);
        if tag == b'Z' {
            return tags;
        }
    }
}

async fn write_all<W: AsyncWrite + Unpin>(w: &mut W, msgs: &[Vec<u8>]) -> std::io::Result<()> {
    for msg in msgs {
        w.write_all(msg).await?;
    }
    w.flush().await
}

/// postgres runs a trust-authenticating mock server that accepts one connection.
/// SELECT gets one row back, anything else an empty CommandComplete. The task returns
/// the statements it received.
pub fn postgres(listener: TcpListener, pid: i32) -> JoinHandle<Vec<String>> {
    tokio::spawn(async move {
        let (mut sock, _) = listener.accept().await.unwrap();
        let len = sock.read_i32().await.unwrap();
        let mut startup = vec![0u8; (len - 4) as usize];
        sock.read_exact(&mut startup).await.unwrap();

        let mut key_data = pid.to_be_bytes().to_vec();
        key_data.extend_from_slice(&7i32.to_be_bytes());
        let mut params = cstr("server_version");
        params.extend(cstr("9.0"));
        write_all(&mut sock, &[
            message(b'R', &0i32.to_be_bytes()),
            message(b'S', &params),
            message(b'K', &key_data),
            message(b'Z', b"I"),
        ]).await.unwrap();

        let mut log = Vec::new();
        while let Ok((tag, body)) = read_message(&mut sock).await {
            match tag {
                b'Q' => {
                    let query = String::from_utf8_lossy(&body[..body.len() - 1]).to_string();
                    let mut replies = Vec::new();
                    if query.to_ascii_uppercase().starts_with("SELECT") {
                        let mut row_desc = 1i16.to_be_bytes().to_vec();
                        row_desc.extend(cstr("?column?"));
                        for v in [0i32.to_be_bytes().to_vec(), 0i16.to_be_bytes().to_vec(), 23i32.to_be_bytes().to_vec(),
                                  4i16.to_be_bytes().to_vec(), (-1i32).to_be_bytes().to_vec(), 0i16.to_be_bytes().to_vec()] {
                            row_desc.extend(v);
                        }
                        let mut row = 1i16.to_be_bytes().to_vec();
                        row.extend_from_slice(&1i32.to_be_bytes());
                        row.push(b'1');
                        replies.push(message(b'T', &row_desc));
                        replies.push(message(b'D', &row));
                        replies.push(message(b'C', &cstr("SELECT 1")));
                    } else {
                        replies.push(message(b'C', &cstr(&query.to_ascii_uppercase())));
                    }
                    replies.push(message(b'Z', b"I"));
                    log.push(query);
                    write_all(&mut sock, &replies).await.unwrap();
                },
                b'X' => break,
                _ => (),
            }
        }
        log
    })
}
