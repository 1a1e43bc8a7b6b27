mod common;

use std::path::PathBuf;
use std::sync::Arc;

use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt};

use riverpool::config::{parse_config, ConfigHandle};
use riverpool::pg::NodeStatusTable;
use riverpool::server::{run_session, Shared};

fn shared(ports: &[u16]) -> Arc<Shared> {
    let mut yaml = String::from("connect_timeout_seconds: 2\nbackends:\n");
    for port in ports {
        yaml.push_str(&format!("  - host: 127.0.0.1\n    port: {}\n", port));
    }
    let settings = parse_config(&yaml, PathBuf::from("riverpool.yaml")).unwrap();
    let status = Arc::new(NodeStatusTable::new(settings.num_backends()));
    Shared::new(ConfigHandle::new(settings), status)
}

#[tokio::test]
async fn test_session_over_two_backends() {
    let l0 = common::listener();
    let l1 = common::listener();
    let shared = shared(&[l0.local_addr().unwrap().port(), l1.local_addr().unwrap().port()]);
    let b0 = common::postgres(l0, 100);
    let b1 = common::postgres(l1, 200);

    let (mut client, server) = duplex(64 * 1024);
    let session = tokio::spawn(run_session(server, shared.clone()));

    client.write_all(&common::startup_packet(common::TEST_USER, common::TEST_DATABASE)).await.unwrap();
    assert_eq!(common::read_until_ready(&mut client).await, "RSKZ");

    client.write_all(&common::message(b'Q', &common::cstr("SELECT 1"))).await.unwrap();
    assert_eq!(common::read_until_ready(&mut client).await, "TDCZ");
    // the client gets the reference node's key data
    assert_eq!(shared.cancels.len(), 1);
    assert!(shared.cancels.lookup(100, 7).unwrap().is_some());
    client.write_all(&common::message(b'X', &[])).await.unwrap();

    session.await.unwrap().unwrap();
    assert_eq!(shared.cancels.len(), 0);
    for backend in [b0, b1] {
        let log = backend.await.unwrap();
        assert_eq!(log, vec!["BEGIN", "SELECT 1", "COMMIT", "DISCARD ALL"]);
    }
}

#[tokio::test]
async fn test_unreachable_backends() {
    // bind then drop a listener so nothing is listening on the port
    let port = common::listener().local_addr().unwrap().port();
    let shared = shared(&[port]);

    let (mut client, server) = duplex(64 * 1024);
    let session = tokio::spawn(run_session(server, shared.clone()));
    client.write_all(&common::startup_packet(common::TEST_USER, common::TEST_DATABASE)).await.unwrap();

    let (tag, body) = common::read_message(&mut client).await.unwrap();
    assert_eq!(tag, b'E');
    assert!(String::from_utf8_lossy(&body).contains("08006"));
    assert!(session.await.unwrap().is_err());
    assert!(!shared.status.is_up(0));
}

#[tokio::test]
async fn test_cancel_request_for_unknown_session() {
    let shared = shared(&[5432]);
    let (mut client, server) = duplex(1024);
    let session = tokio::spawn(run_session(server, shared));

    let mut packet = 16i32.to_be_bytes().to_vec();
    packet.extend_from_slice(&80877102i32.to_be_bytes());
    packet.extend_from_slice(&1i32.to_be_bytes());
    packet.extend_from_slice(&2i32.to_be_bytes());
    client.write_all(&packet).await.unwrap();

    session.await.unwrap().unwrap();
    let mut buf = Vec::new();
    // the session closes without answering
    assert_eq!(client.read_to_end(&mut buf).await.unwrap(), 0);
}
