use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use fnv::FnvHashMap;
use tokio::io::duplex;
use tokio::task::JoinHandle;
use tokio::time::sleep;

use crate::riverpool::config::{parse_config, ConfigHandle, Settings};
use crate::riverpool::pg::{BackendSet, DispatchState, Dispatcher, NodeStatusTable, Peer, PoolStream, Timings};
use crate::riverpool::pg::protocol::{framer, ErrorFields, Message, MessageBuilder, MessageErrorBuilder, ErrorSeverity, ProtocolVersion, Tag};

pub const TEST_DATABASE: &str = "riverpool_test";

/// config builds settings for n backends on top of the defaults, then lets the test adjust them
pub fn config(n: usize, adjust: impl FnOnce(&mut Settings)) -> Arc<ConfigHandle> {
    let mut yaml = String::from("backends:\n");
    for i in 0..n {
        yaml.push_str(&format!("  - host: db{}\n    port: {}\n", i, 5432 + i));
    }
    let mut settings = parse_config(&yaml, PathBuf::from("riverpool.yaml")).expect("invalid test config");
    adjust(&mut settings);
    ConfigHandle::new(settings)
}

/// fast_timings shrinks every wait so idle and keepalive paths run quickly
pub fn fast_timings() -> Timings {
    Timings{
        tick: Duration::from_millis(10),
        keepalive: Duration::from_millis(50),
        admin_shutdown_grace: Duration::from_millis(1),
        drop_database_grace: Duration::from_millis(1),
        reset_timeout_seconds: 2,
    }
}

pub fn message(tag: Tag, build: impl FnOnce(&mut MessageBuilder)) -> Message {
    let mut mb = MessageBuilder::new(tag);
    build(&mut mb);
    mb.finish()
}

pub fn row_description(columns: &[&str]) -> Message {
    message(Tag::ROW_DESCRIPTION, |mb| {
        mb.write_i16(columns.len() as i16);
        for name in columns {
            mb.write_str(name).write_i32(0).write_i16(0).write_i32(25).write_i16(-1).write_i32(-1).write_i16(0);
        }
    })
}

pub fn data_row(values: &[&str]) -> Message {
    message(Tag::DATA_ROW, |mb| {
        mb.write_i16(values.len() as i16);
        for value in values {
            mb.write_i32(value.len() as i32).write_bytes(value.as_bytes());
        }
    })
}

pub fn command_complete(tag: &str) -> Message {
    message(Tag::COMMAND_COMPLETE, |mb| { mb.write_str(tag); })
}

pub fn error_response(code: &str, text: &str) -> Message {
    MessageErrorBuilder::new(ErrorSeverity::Error, code, text).finish(ProtocolVersion::V3)
}

pub fn severity_response(severity: ErrorSeverity, code: &str, text: &str) -> Message {
    MessageErrorBuilder::new(severity, code, text).finish(ProtocolVersion::V3)
}

pub fn parameter_status(name: &str, value: &str) -> Message {
    message(Tag::PARAMETER_STATUS, |mb| { mb.write_str(name).write_str(value); })
}

/// select_reply is what a backend answers to a one column, one row SELECT
pub fn select_reply(value: &str) -> Vec<Message> {
    vec![row_description(&["?column?"]), data_row(&[value]), command_complete("SELECT 1")]
}

/// Responder produces the messages a mock backend answers to a statement, without ReadyForQuery
pub type Responder = Box<dyn FnMut(&str) -> Vec<Message> + Send>;

/// How one backend of a test session behaves
pub enum MockNode {
    Scripted(Responder),
    /// like Scripted, but statements passed to the responder are answered after a pause
    Delayed(Responder, Duration),
    /// the test reads and writes the backend's end of the connection itself, see TestSession::raw
    Raw,
}

/// MockBackend plays a trust-authenticated Postgres server over a duplex pipe. Transaction
/// control and reset statements are answered by the mock itself. Everything else goes to the
/// responder. The task returns every statement it received.
struct MockBackend {
    stream: PoolStream,
    responder: Responder,
    delay: Duration,
    tstate: u8,
    statements: FnvHashMap<String, String>,
    portals: FnvHashMap<String, String>,
    log: Vec<String>,
}

impl MockBackend {
    async fn send(&mut self, msg: &Message) {
        framer::write_message(&mut self.stream, msg).unwrap();
    }

    async fn ready(&mut self) {
        let state = self.tstate;
        self.send(&message(Tag::READY_FOR_QUERY, |mb| { mb.write_byte(state); })).await;
        self.stream.flush().await.unwrap();
    }

    async fn answer(&mut self, query: &str) -> Vec<Message> {
        self.log.push(query.to_string());
        let upper = query.trim().to_ascii_uppercase();
        match upper.as_str() {
            "BEGIN" => {
                self.tstate = b'T';
                vec![command_complete("BEGIN")]
            },
            "COMMIT" => {
                self.tstate = b'I';
                vec![command_complete("COMMIT")]
            },
            "ABORT" | "ROLLBACK" => {
                self.tstate = b'I';
                vec![command_complete("ROLLBACK")]
            },
            "DISCARD ALL" => vec![command_complete("DISCARD ALL")],
            _ if upper.starts_with("DEALLOCATE") => vec![command_complete("DEALLOCATE")],
            // temp table lookups from the relation cache
            _ if upper.contains("PG_CLASS") => {
                vec![row_description(&["count"]), data_row(&["0"]), command_complete("SELECT 1")]
            },
            _ => {
                if !self.delay.is_zero() {
                    sleep(self.delay).await;
                }
                let replies = (self.responder)(query);
                if self.tstate == b'T' && replies.iter().any(|m| m.tag() == Tag::ERROR_RESPONSE) {
                    self.tstate = b'E';
                }
                replies
            }
        }
    }

    async fn run(mut self) -> Vec<String> {
        let mut skip_till_sync = false;
        loop {
            let msg = match framer::read_message(&mut self.stream).await {
                Ok(msg) => msg,
                Err(_) => break,
            };
            match msg.tag() {
                Tag::QUERY => {
                    let query = msg.first_str().unwrap().to_string();
                    for reply in self.answer(&query).await {
                        self.send(&reply).await;
                    }
                    self.ready().await;
                },
                Tag::PARSE => {
                    let r = msg.reader();
                    let name = r.read_str().unwrap().to_string();
                    let query = r.read_str().unwrap().to_string();
                    if !skip_till_sync {
                        self.statements.insert(name, query);
                        self.send(&message(Tag::PARSE_COMPLETE, |_| ())).await;
                    }
                },
                Tag::BIND => {
                    let r = msg.reader();
                    let portal = r.read_str().unwrap().to_string();
                    let statement = r.read_str().unwrap().to_string();
                    if !skip_till_sync {
                        match self.statements.get(&statement).cloned() {
                            Some(query) => {
                                self.portals.insert(portal, query);
                                self.send(&message(Tag::BIND_COMPLETE, |_| ())).await;
                            },
                            None => {
                                self.send(&error_response("26000", "prepared statement does not exist")).await;
                                skip_till_sync = true;
                            }
                        }
                    }
                },
                Tag::DESCRIBE if !skip_till_sync => self.send(&message(Tag::NO_DATA, |_| ())).await,
                Tag::EXECUTE => {
                    let portal = msg.reader().read_str().unwrap().to_string();
                    if !skip_till_sync {
                        let query = self.portals.get(&portal).cloned().unwrap_or_default();
                        for reply in self.answer(&query).await {
                            if reply.tag() != Tag::ROW_DESCRIPTION {
                                self.send(&reply).await;
                            }
                        }
                    }
                },
                Tag::CLOSE if !skip_till_sync => self.send(&message(Tag::CLOSE_COMPLETE, |_| ())).await,
                Tag::FLUSH => self.stream.flush().await.unwrap(),
                Tag::SYNC => {
                    skip_till_sync = false;
                    self.ready().await;
                },
                Tag::TERMINATE => break,
                _ => (),
            }
        }
        self.log
    }
}

/// spawn_backend starts a mock backend and returns the proxy's end of the connection
pub fn spawn_backend(node: usize, responder: Responder, delay: Duration) -> (PoolStream, JoinHandle<Vec<String>>) {
    let (proxy_end, remote) = raw_backend(node);
    let mock = MockBackend{
        stream: remote,
        responder,
        delay,
        tstate: b'I',
        statements: FnvHashMap::default(),
        portals: FnvHashMap::default(),
        log: Vec::new(),
    };
    let handle = tokio::spawn(mock.run());
    (proxy_end, handle)
}

/// raw_backend returns the proxy's end of a backend connection and the backend's end
pub fn raw_backend(node: usize) -> (PoolStream, PoolStream) {
    let (local, remote) = duplex(1 << 16);
    (PoolStream::new(local, Peer::Backend(node), ProtocolVersion::V3), PoolStream::new(remote, Peer::Frontend, ProtocolVersion::V3))
}

/// TestSession is a dispatcher wired to a test client and mock backends
pub struct TestSession {
    pub dispatcher: Dispatcher,
    pub client: PoolStream,
    pub status: Arc<NodeStatusTable>,
    /// scripted and delayed backends, in node order
    pub backends: Vec<JoinHandle<Vec<String>>>,
    /// the backend end of every Raw node, in node order
    pub raw: Vec<PoolStream>,
}

pub fn session(config: Arc<ConfigHandle>, responders: Vec<Responder>) -> TestSession {
    session_with(config, responders.into_iter().map(MockNode::Scripted).collect())
}

pub fn session_with(config: Arc<ConfigHandle>, nodes: Vec<MockNode>) -> TestSession {
    let settings = config.get();
    let status = Arc::new(NodeStatusTable::new(settings.num_backends()));
    let mut set = BackendSet::new(status.clone(), settings.weights());
    let mut handles = Vec::new();
    let mut raw = Vec::new();
    for (node, mock) in nodes.into_iter().enumerate() {
        let stream = match mock {
            MockNode::Scripted(responder) => spawn_scripted(&mut handles, node, responder, Duration::default()),
            MockNode::Delayed(responder, delay) => spawn_scripted(&mut handles, node, responder, delay),
            MockNode::Raw => {
                let (proxy_end, remote) = raw_backend(node);
                raw.push(remote);
                proxy_end
            },
        };
        set.set_backend(node, stream);
    }
    let (client_end, proxy_end) = duplex(1 << 16);
    let frontend = PoolStream::new(proxy_end, Peer::Frontend, ProtocolVersion::V3);
    let mut dispatcher = Dispatcher::new(frontend, set, config, TEST_DATABASE.to_string());
    dispatcher.set_timings(fast_timings());
    TestSession{
        dispatcher,
        // the client reads what backends send, so it frames like a backend connection
        client: PoolStream::new(client_end, Peer::Backend(0), ProtocolVersion::V3),
        status,
        backends: handles,
        raw,
    }
}

fn spawn_scripted(handles: &mut Vec<JoinHandle<Vec<String>>>, node: usize, responder: Responder, delay: Duration) -> PoolStream {
    let (stream, handle) = spawn_backend(node, responder, delay);
    handles.push(handle);
    stream
}

/// wait_until polls cond until it holds, panicking if it doesn't within a second
pub async fn wait_until(mut cond: impl FnMut() -> bool) {
    for _ in 0..500 {
        if cond() {
            return;
        }
        sleep(Duration::from_millis(2)).await;
    }
    panic!("condition not reached in time");
}

pub fn responder<F: FnMut(&str) -> Vec<Message> + Send + 'static>(f: F) -> Responder {
    Box::new(f)
}

/// same_reply gives every backend the same canned answer
pub fn same_reply(n: usize, reply: fn(&str) -> Vec<Message>) -> Vec<Responder> {
    (0..n).map(|_| responder(reply)).collect()
}

pub async fn send_query(client: &mut PoolStream, query: &str) {
    let msg = message(Tag::QUERY, |mb| { mb.write_str(query); });
    framer::encode_and_send(client, &msg).await.unwrap();
}

pub async fn send(client: &mut PoolStream, msg: &Message) {
    framer::encode_and_send(client, msg).await.unwrap();
}

pub async fn send_terminate(client: &mut PoolStream) {
    send(client, &Message::new(Tag::TERMINATE, Bytes::new())).await;
}

/// read_until_ready collects the messages the client receives up to and including ReadyForQuery
pub async fn read_until_ready(client: &mut PoolStream) -> Vec<Message> {
    let mut messages = Vec::new();
    loop {
        let msg = framer::read_message(client).await.unwrap();
        let done = msg.tag() == Tag::READY_FOR_QUERY;
        messages.push(msg);
        if done {
            return messages;
        }
    }
}

pub fn tags(messages: &[Message]) -> String {
    messages.iter().map(|m| m.tag().as_char()).collect()
}

pub fn error_code(msg: &Message) -> String {
    ErrorFields::parse(msg, ProtocolVersion::V3).unwrap().code().to_string()
}

pub fn error_text(msg: &Message) -> String {
    ErrorFields::parse(msg, ProtocolVersion::V3).unwrap().message().to_string()
}

/// run_dispatcher runs the dispatch loop in its own task and hands the dispatcher back at the end
pub fn run_dispatcher(mut dispatcher: Dispatcher) -> JoinHandle<(Dispatcher, DispatchState)> {
    tokio::spawn(async move {
        let state = dispatcher.run().await;
        (dispatcher, state)
    })
}

/// finish terminates the backends and returns the statements each one received
pub async fn finish(dispatcher: &mut Dispatcher, backends: Vec<JoinHandle<Vec<String>>>) -> Vec<Vec<String>> {
    dispatcher.terminate_backends().await;
    let mut logs = Vec::new();
    for handle in backends {
        logs.push(handle.await.unwrap());
    }
    logs
}
