use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, info, warn};

use crate::riverpool::{Error, Result};
use crate::riverpool::config::Settings;
use crate::riverpool::pg::backend_set::{BackendSet, Routing};
use crate::riverpool::pg::node_status::{NodeStatus, NodeStatusTable};
use crate::riverpool::pg::protocol::{error_codes, framer, Message, ProtocolVersion, StartupPacket, Tag};
use crate::riverpool::pg::stream::{Peer, PoolStream};
use crate::riverpool::server::cancel::CancelTarget;
use crate::riverpool::server::transport::connect;

/// read_client_startup reads the client's first packet. SSL requests are declined with 'N'
/// and the packet that follows is read instead.
pub async fn read_client_startup(frontend: &mut PoolStream) -> Result<StartupPacket> {
    loop {
        let body = framer::read_startup(frontend).await?;
        match StartupPacket::parse(&body)? {
            StartupPacket::SslRequest => {
                debug!("declining SSL request");
                frontend.write_and_flush(b"N").await?;
            },
            packet => return Ok(packet),
        }
    }
}

/// connect_backends opens a connection to every backend that is up and sends it the client's
/// startup packet. Nodes that can't be reached are marked down.
pub async fn connect_backends(settings: &Settings, status: &Arc<NodeStatusTable>, version: ProtocolVersion, raw: &Bytes) -> Result<BackendSet> {
    let mut backends = BackendSet::new(status.clone(), settings.weights());
    let connect_timeout = Duration::from_secs(settings.connect_timeout_seconds as u64);
    for (node, config) in settings.backends.iter().enumerate() {
        if !status.is_up(node) {
            continue;
        }
        match connect(&config.host, config.port, connect_timeout).await {
            Ok(sock) => {
                status.set(node, NodeStatus::Up);
                let mut stream = PoolStream::new(sock, Peer::Backend(node), version);
                send_startup(&mut stream, raw).await?;
                backends.set_backend(node, stream);
            },
            Err(e) => {
                warn!(node, host = %config.host, port = config.port, %e, "could not connect to backend");
                status.degenerate(&[node]);
            }
        }
    }
    if backends.valid_nodes(Routing::Replicate).is_empty() {
        return Err(Error::new("no backend node is available"));
    }
    Ok(backends)
}

/// send_startup relays the client's startup packet to a backend
pub async fn send_startup(stream: &mut PoolStream, raw: &Bytes) -> Result<()> {
    framer::encode_and_send(stream, &Message::new(Tag::UNTAGGED, raw.clone())).await
}

/// authenticate reads each backend's response to the startup packet up to ReadyForQuery.
/// Only trust authentication is supported. The reference node's parameters, key data and
/// ReadyForQuery are forwarded to the client, and its (pid, key) is returned.
pub async fn authenticate(frontend: &mut PoolStream, backends: &mut BackendSet) -> Result<(i32, i32)> {
    let nodes = backends.valid_nodes(Routing::Replicate);
    let reference = backends.reference_node_id(Routing::Replicate).ok_or_else(|| Error::new("no valid backend node"))?;
    for node in nodes.iter() {
        let is_reference = node == reference;
        loop {
            let stream = backends.get_mut(node).ok_or_else(Error::closed)?;
            let msg = framer::read_message(stream).await?;
            match msg.tag() {
                Tag::AUTHENTICATION => {
                    let code = msg.reader().read_i32();
                    if code != 0 {
                        warn!(node, code, "backend requires authentication, only trust is supported");
                        let fatal = Message::new_fatal(frontend.protocol, error_codes::INVALID_AUTHORIZATION_SPECIFICATION,
                            "authentication method not supported, only trust authentication is available");
                        framer::encode_and_send(frontend, &fatal).await?;
                        return Err(Error::new(format!("backend {} requested authentication code {}", node, code)));
                    }
                    if is_reference {
                        framer::write_message(frontend, &msg)?;
                    }
                },
                Tag::PARAMETER_STATUS => {
                    let (name, value) = {
                        let r = msg.reader();
                        (r.read_str()?.to_string(), r.read_str()?.to_string())
                    };
                    stream.params.set(name, value);
                    if is_reference {
                        framer::write_message(frontend, &msg)?;
                    }
                },
                Tag::BACKEND_KEY_DATA => {
                    let r = msg.reader();
                    stream.pid = r.read_i32();
                    stream.key = r.read_i32();
                    if is_reference {
                        framer::write_message(frontend, &msg)?;
                    }
                },
                Tag::NOTICE_RESPONSE => {
                    if is_reference {
                        framer::write_message(frontend, &msg)?;
                    }
                },
                Tag::ERROR_RESPONSE => {
                    if is_reference {
                        framer::encode_and_send(frontend, &msg).await?;
                    }
                    return Err(Error::new(format!("backend {} rejected the session", node)));
                },
                Tag::READY_FOR_QUERY => {
                    if let Some(&state) = msg.body().first() {
                        stream.tstate = state;
                    }
                    if is_reference {
                        framer::write_message(frontend, &msg)?;
                    }
                    break;
                },
                tag => return Err(Error::protocol_error(format!("unexpected {} during startup from backend {}", tag, node))),
            }
        }
    }
    frontend.flush().await?;
    let stream = backends.get(reference).ok_or_else(Error::closed)?;
    info!(reference, pid = stream.pid, "session established");
    Ok((stream.pid, stream.key))
}

/// cancel_targets lists where a cancel request for this session must go
pub fn cancel_targets(settings: &Settings, backends: &BackendSet) -> Vec<CancelTarget> {
    backends.connected_nodes().iter()
        .filter_map(|node| {
            let config = settings.backends.get(node)?;
            let stream = backends.get(node)?;
            Some(CancelTarget{host: config.host.clone(), port: config.port, pid: stream.pid, key: stream.key})
        })
        .collect()
}
