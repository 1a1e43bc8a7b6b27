use std::sync::Mutex;
use std::time::Duration;

use fnv::FnvHashMap;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::riverpool::Result;
use crate::riverpool::pg::protocol::StartupPacket;
use crate::riverpool::server::transport::connect;

/// Where to deliver a cancel request for one backend of a session
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CancelTarget {
    pub host: String,
    pub port: u16,
    pub pid: i32,
    pub key: i32,
}

/// CancelRegistry maps the (pid, key) a client was given to the backend connections of its session.
#[derive(Default)]
pub struct CancelRegistry {
    sessions: Mutex<FnvHashMap<(i32, i32), Vec<CancelTarget>>>,
}

impl CancelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, pid: i32, key: i32, targets: Vec<CancelTarget>) -> Result<()> {
        self.sessions.lock()?.insert((pid, key), targets);
        Ok(())
    }

    pub fn unregister(&self, pid: i32, key: i32) -> Result<()> {
        self.sessions.lock()?.remove(&(pid, key));
        Ok(())
    }

    pub fn lookup(&self, pid: i32, key: i32) -> Result<Option<Vec<CancelTarget>>> {
        Ok(self.sessions.lock()?.get(&(pid, key)).cloned())
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().map_or(0, |s| s.len())
    }

    /// cancel forwards a client's cancel request to every backend of the matching session.
    /// Returns how many backends were sent the request.
    pub async fn cancel(&self, pid: i32, key: i32, connect_timeout: Duration) -> Result<usize> {
        let targets = match self.lookup(pid, key)? {
            Some(targets) => targets,
            None => {
                info!(pid, "cancel request for unknown session");
                return Ok(0);
            }
        };
        let mut sent = 0;
        for target in &targets {
            match send_cancel(target, connect_timeout).await {
                Ok(()) => sent += 1,
                Err(e) => warn!(%e, host = %target.host, port = target.port, "could not send cancel request"),
            }
        }
        Ok(sent)
    }
}

async fn send_cancel(target: &CancelTarget, connect_timeout: Duration) -> Result<()> {
    let mut stream = connect(&target.host, target.port, connect_timeout).await?;
    stream.write_all(&StartupPacket::encode_cancel(target.pid, target.key)).await?;
    stream.shutdown().await?;
    debug!(host = %target.host, port = target.port, pid = target.pid, "sent cancel request");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(port: u16, pid: i32) -> CancelTarget {
        CancelTarget{host: "localhost".to_string(), port, pid, key: 7}
    }

    #[test]
    fn test_register_unregister() {
        let registry = CancelRegistry::new();
        registry.register(100, 7, vec![target(5432, 100), target(5433, 200)]).unwrap();
        assert_eq!(registry.len(), 1);
        let targets = registry.lookup(100, 7).unwrap().unwrap();
        assert_eq!(targets[1].pid, 200);
        assert!(registry.lookup(100, 8).unwrap().is_none());
        registry.unregister(100, 7).unwrap();
        assert_eq!(registry.len(), 0);
    }

    #[tokio::test]
    async fn test_cancel_unknown_session() {
        let registry = CancelRegistry::new();
        assert_eq!(registry.cancel(1, 2, Duration::from_millis(10)).await.unwrap(), 0);
    }
}
