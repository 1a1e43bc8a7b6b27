use std::io;
#[cfg(unix)]
use std::os::unix::io::AsRawFd;

use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tracing::{debug, error};

use crate::riverpool::{Error, Result};
use crate::riverpool::config::LISTEN_BACKLOG;


pub struct Listener {
    pub address: String,
    listener: TcpListener,
}

impl Listener {
    pub fn new(address: String, reuseport: bool) -> Result<Self> {
        let addr = address.parse()?;
        let sock = TcpSocket::new_v4()?;
        #[cfg(unix)]
        {
            if reuseport {
                sock.set_reuseport(true)?;
            }
            // Clients always speak first, so don't wake up until they do
            #[cfg(target_os = "linux")]
            unsafe {
                let optval: libc::c_int = 1;
                let ret = libc::setsockopt(
                    sock.as_raw_fd(),
                    libc::SOL_TCP,
                    libc::TCP_DEFER_ACCEPT,
                    &optval as *const _ as *const libc::c_void,
                    std::mem::size_of_val(&optval) as libc::socklen_t);
                if ret != 0 {
                    return Err(Error::from(io::Error::last_os_error()));
                }
            }
        }
        sock.set_reuseaddr(true)?;
        sock.bind(addr)?;
        let listener = sock.listen(LISTEN_BACKLOG)?;
        Ok(Self {
            address,
            listener,
        })
    }

    /// accept returns the next client connection, or None once the socket can no longer accept
    pub async fn accept(&self) -> Option<TcpStream> {
        loop {
            match self.listener.accept().await {
                Ok((sock, remote_addr)) => {
                    debug!(%remote_addr, server = %self.address.as_str(), "accept connection");
                    if let Err(e) = sock.set_nodelay(true) {
                        debug!(%e, "could not set TCP_NODELAY");
                    }
                    return Some(sock);
                },
                Err(e) => {
                    match e.raw_os_error().unwrap_or(0) {
                        libc::ECONNABORTED |
                        libc::EMFILE | // process file-descriptor limit
                        libc::ENFILE | // system wide file-descriptor limit
                        libc::ENOBUFS | // out of memory
                        libc::ENOMEM | // out of memory
                        libc::EPROTO | // protocol error
                        libc::EINTR => {
                            error!(%e, "accept error");
                            continue;
                        },
                        _ => {
                            error!(%e, server = %self.address.as_str(), "unrecoverable accept error");
                            return None;
                        },
                    }
                },
            }
        }
    }
}
