use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering::{AcqRel, Acquire};
use std::time::Duration;

use tracing::{debug, info, info_span, warn, Instrument};

use crate::riverpool::{Error, Result};
use crate::riverpool::config::ConfigHandle;
use crate::riverpool::pg::dispatch::{DispatchState, Dispatcher};
use crate::riverpool::pg::node_status::NodeStatusTable;
use crate::riverpool::pg::protocol::{error_codes, framer, Message, ProtocolVersion, StartupPacket};
use crate::riverpool::pg::stream::{Peer, PoolStream};
use crate::riverpool::server::cancel::CancelRegistry;
use crate::riverpool::server::listener::Listener;
use crate::riverpool::server::startup::{authenticate, cancel_targets, connect_backends, read_client_startup};
use crate::riverpool::server::transport::Transport;

/// PoolService accepts client connections and runs one session task per client.
pub struct PoolService {
    listener: Listener,
    shared: Arc<Shared>,
}

/// State shared by every session of the service
pub struct Shared {
    pub config: Arc<ConfigHandle>,
    pub status: Arc<NodeStatusTable>,
    pub cancels: CancelRegistry,
    active: AtomicUsize,
}

impl Shared {
    pub fn new(config: Arc<ConfigHandle>, status: Arc<NodeStatusTable>) -> Arc<Self> {
        Arc::new(Self{config, status, cancels: CancelRegistry::new(), active: AtomicUsize::new(0)})
    }

    pub fn active_sessions(&self) -> usize {
        self.active.load(Acquire)
    }
}

/// SessionGuard counts a session as active for as long as it lives
struct SessionGuard(Arc<Shared>);

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, AcqRel);
    }
}

impl PoolService {
    pub fn new(address: String, reuseport: bool, shared: Arc<Shared>) -> Result<Self> {
        Ok(Self{
            listener: Listener::new(address, reuseport)?,
            shared,
        })
    }

    pub async fn run(&self) {
        info!(address = %self.listener.address.as_str(), "starting pool service");
        while let Some(sock) = self.listener.accept().await {
            let max_connections = self.shared.config.get().max_connections as usize;
            let active = self.shared.active.fetch_add(1, AcqRel) + 1;
            let guard = SessionGuard(self.shared.clone());
            if active > max_connections {
                warn!(limit = max_connections, "reached connection limit");
                continue;
            }
            let shared = self.shared.clone();
            tokio::spawn(async move {
                let _guard = guard;
                if let Err(e) = run_session(sock, shared).await {
                    warn!(%e, "session ended with an error");
                }
            }.instrument(info_span!("session", id = active)));
        }
    }
}

/// run_session serves one client from its startup packet to the end of the session
pub async fn run_session<T: Transport + 'static>(io: T, shared: Arc<Shared>) -> Result<()> {
    let mut frontend = PoolStream::new(io, Peer::Frontend, ProtocolVersion::V3);
    let (version, params, raw) = match read_client_startup(&mut frontend).await? {
        StartupPacket::Startup{version, params, raw} => (version, params, raw),
        StartupPacket::CancelRequest{pid, key} => {
            let timeout = Duration::from_secs(shared.config.get().connect_timeout_seconds as u64);
            let sent = shared.cancels.cancel(pid, key, timeout).await?;
            debug!(pid, sent, "relayed cancel request");
            return Ok(());
        },
        StartupPacket::SslRequest => return Err(Error::protocol_error("repeated SSL request")),
    };
    frontend.protocol = version;
    let database = params.get("database").unwrap_or_default().to_string();
    info!(user = params.get("user").unwrap_or_default(), %database, %version, "client connected");

    let settings = shared.config.get();
    let mut backends = match connect_backends(&settings, &shared.status, version, &raw).await {
        Ok(backends) => backends,
        Err(e) => {
            let msg = Message::new_fatal(version, error_codes::CONNECTION_FAILURE, &e.to_string());
            framer::encode_and_send(&mut frontend, &msg).await?;
            return Err(e);
        }
    };
    let (pid, key) = authenticate(&mut frontend, &mut backends).await?;
    shared.cancels.register(pid, key, cancel_targets(&settings, &backends))?;

    let mut dispatcher = Dispatcher::new(frontend, backends, shared.config.clone(), database);
    let state = dispatcher.run().await;
    debug!(%state, "dispatch loop finished");
    if state == DispatchState::Closed {
        let state = dispatcher.run_reset().await;
        debug!(%state, "reset finished");
    }
    dispatcher.terminate_backends().await;
    shared.cancels.unregister(pid, key)
}
