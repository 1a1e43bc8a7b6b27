use std::sync::Arc;
use std::task::Poll;
use std::time::Duration;

use futures::future::poll_fn;
use strum::Display;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use crate::riverpool::{Error, ErrorKind, Result};
use crate::riverpool::config::{
    ConfigHandle, Settings, ADMIN_SHUTDOWN_GRACE_SECONDS, DROP_DATABASE_GRACE_SECONDS, KEEPALIVE_INTERVAL_SECONDS,
    RESET_TIMEOUT_SECONDS,
};
use crate::riverpool::pg::backend_set::{BackendSet, Routing};
use crate::riverpool::pg::node_set::NodeSet;
use crate::riverpool::pg::protocol::{error_codes, framer, ErrorFields, Message, MessageBuilder, Tag};
use crate::riverpool::pg::reconciler::detect_admin_shutdown;
use crate::riverpool::pg::relcache::{RelCache, TempTableLoader};
use crate::riverpool::pg::session_context::{ResetState, SessionContext};
use crate::riverpool::pg::simple_query::do_query;
use crate::riverpool::pg::stream::{PoolStream, TSTATE_IDLE};

/// Where the dispatch loop of a session stands
#[derive(Display, Debug, Copy, Clone, Eq, PartialEq)]
pub enum DispatchState {
    /// waiting for input
    Idle,
    ReceivingBackend,
    ReceivingFrontend,
    /// running the reset statements before the backends can be reused
    ResetPending,
    Closed,
    /// backends disagreed on a response
    Errored,
    Fatal,
}

impl DispatchState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, DispatchState::Closed | DispatchState::Errored | DispatchState::Fatal)
    }
}

/// The result of one step of the reset sequence
#[derive(Display, Debug, Copy, Clone, Eq, PartialEq)]
pub enum ResetOutcome {
    /// ABORT while no backend was in a transaction
    Skipped,
    Issued,
    Done,
    Failed,
}

/// Which party has data to read
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Readiness {
    Frontend,
    Backend(usize),
}

/// Wait intervals used by the dispatch loop
#[derive(Debug, Copy, Clone)]
pub struct Timings {
    /// idle limit tick
    pub tick: Duration,
    pub keepalive: Duration,
    pub admin_shutdown_grace: Duration,
    pub drop_database_grace: Duration,
    pub reset_timeout_seconds: u64,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(1),
            keepalive: Duration::from_secs(KEEPALIVE_INTERVAL_SECONDS),
            admin_shutdown_grace: Duration::from_secs(ADMIN_SHUTDOWN_GRACE_SECONDS),
            drop_database_grace: Duration::from_secs(DROP_DATABASE_GRACE_SECONDS),
            reset_timeout_seconds: RESET_TIMEOUT_SECONDS,
        }
    }
}

/// wait_readable resolves when the frontend (if given) or one of nodes has data to read.
/// Backends are checked before the frontend, and buffered data counts as readable.
pub async fn wait_readable(mut frontend: Option<&mut PoolStream>, backends: &mut BackendSet, nodes: NodeSet) -> Result<Readiness> {
    poll_fn(|cx| {
        for node in nodes.iter() {
            if backends.get(node).map_or(false, PoolStream::has_pending) {
                return Poll::Ready(Ok(Readiness::Backend(node)));
            }
        }
        if let Some(fe) = frontend.as_mut() {
            if fe.has_pending() {
                return Poll::Ready(Ok(Readiness::Frontend));
            }
        }
        for node in nodes.iter() {
            if let Some(stream) = backends.get_mut(node) {
                match stream.poll_fill(cx) {
                    Poll::Ready(Ok(_)) => return Poll::Ready(Ok(Readiness::Backend(node))),
                    Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                    Poll::Pending => (),
                }
            }
        }
        if let Some(fe) = frontend.as_mut() {
            match fe.poll_fill(cx) {
                Poll::Ready(Ok(_)) => return Poll::Ready(Ok(Readiness::Frontend)),
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => (),
            }
        }
        Poll::Pending
    }).await
}

/// Dispatcher runs the request/response loop of one client session over its backends.
pub struct Dispatcher {
    pub(crate) frontend: PoolStream,
    pub(crate) backends: BackendSet,
    pub(crate) ctx: SessionContext,
    pub(crate) settings: Arc<Settings>,
    config: Arc<ConfigHandle>,
    settings_generation: u64,
    pub(crate) relcache: RelCache<bool>,
    pub(crate) database: String,
    pub(crate) timings: Timings,
    state: DispatchState,
}

impl Dispatcher {
    pub fn new(frontend: PoolStream, backends: BackendSet, config: Arc<ConfigHandle>, database: String) -> Self {
        let settings = config.get();
        let mut ctx = SessionContext::new(backends.num_backends(), settings.load_balance_seed);
        if settings.load_balance_mode {
            ctx.load_balance_node = backends.select_target_for_load_balance(&mut ctx.rng);
        }
        Self {
            frontend,
            backends,
            ctx,
            relcache: RelCache::new(settings.relcache_size, Box::new(TempTableLoader)),
            settings_generation: config.generation(),
            settings,
            config,
            database,
            timings: Timings::default(),
            state: DispatchState::Idle,
        }
    }

    pub fn set_timings(&mut self, timings: Timings) {
        self.timings = timings;
    }

    pub fn state(&self) -> DispatchState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: DispatchState) {
        self.state = state;
    }

    pub fn session(&self) -> &SessionContext {
        &self.ctx
    }

    pub fn backends(&self) -> &BackendSet {
        &self.backends
    }

    /// run processes requests until the client leaves or the session fails,
    /// and returns the terminal state.
    pub async fn run(&mut self) -> DispatchState {
        if let Err(e) = self.run_loop().await {
            self.state = match e.kind() {
                ErrorKind::DisagreementError(_) => DispatchState::Errored,
                ErrorKind::ClosedError | ErrorKind::IOError(_) if self.frontend.is_eof() => {
                    info!("client closed the connection");
                    DispatchState::Closed
                },
                _ => {
                    warn!(%e, "session failed");
                    let msg = Message::new_fatal(self.frontend.protocol, error_codes::INTERNAL_ERROR, &e.to_string());
                    let _ = framer::encode_and_send(&mut self.frontend, &msg).await;
                    DispatchState::Fatal
                }
            };
        }
        self.state
    }

    async fn run_loop(&mut self) -> Result<()> {
        self.state = DispatchState::Idle;
        while !self.state.is_terminal() {
            self.check_reload();
            if !self.ctx.in_progress && self.backends.status().in_recovery() && self.settings.client_idle_limit_in_recovery == -1 {
                self.close_idle(true).await?;
                break;
            }
            self.check_load_balance_node();

            if self.ctx.in_progress {
                self.state = DispatchState::ReceivingBackend;
                self.process_backend_response().await?;
            } else if self.frontend.has_pending() {
                self.state = DispatchState::ReceivingFrontend;
                self.process_frontend_request().await?;
            } else if let Some(node) = self.pending_backend() {
                self.state = DispatchState::ReceivingBackend;
                self.process_idle_backend(node).await?;
            } else {
                match self.wait_for_activity().await? {
                    None => break,
                    Some(Readiness::Frontend) => {
                        self.state = DispatchState::ReceivingFrontend;
                        self.process_frontend_request().await?;
                    },
                    Some(Readiness::Backend(node)) => {
                        self.state = DispatchState::ReceivingBackend;
                        self.process_idle_backend(node).await?;
                    },
                }
            }
            if !self.state.is_terminal() {
                self.state = DispatchState::Idle;
            }
        }
        Ok(())
    }

    /// check_reload picks up a reloaded configuration between requests
    fn check_reload(&mut self) {
        let generation = self.config.generation();
        if generation != self.settings_generation {
            self.settings = self.config.get();
            self.settings_generation = generation;
            info!(generation, "session picked up reloaded configuration");
        }
    }

    /// check_load_balance_node selects a new load balance node if the chosen one went down
    fn check_load_balance_node(&mut self) {
        if !self.settings.load_balance_mode {
            return;
        }
        let up = self.ctx.load_balance_node.map_or(false, |n| self.backends.is_valid(n, Routing::Replicate));
        if !up {
            self.ctx.load_balance_node = self.backends.select_target_for_load_balance(&mut self.ctx.rng);
            debug!(node = ?self.ctx.load_balance_node, "reselected load balance node");
        }
    }

    fn pending_backend(&self) -> Option<usize> {
        self.backends.valid_nodes(Routing::Replicate).iter()
            .find(|&node| self.backends.get(node).map_or(false, PoolStream::has_pending))
    }

    /// wait_for_activity blocks until the client or a backend is readable. With idle limits set it
    /// wakes up every tick and counts idle ticks. Returns None if the session was closed for being idle.
    async fn wait_for_activity(&mut self) -> Result<Option<Readiness>> {
        let mut idle = 0;
        let mut idle_in_recovery = 0;
        loop {
            let nodes = self.backends.valid_nodes(Routing::Replicate);
            if !self.settings.has_idle_limits() {
                return wait_readable(Some(&mut self.frontend), &mut self.backends, nodes).await.map(Some);
            }
            let tick = self.timings.tick;
            match timeout(tick, wait_readable(Some(&mut self.frontend), &mut self.backends, nodes)).await {
                Ok(ready) => return ready.map(Some),
                Err(_) => {
                    if self.backends.status().in_recovery() {
                        let limit = self.settings.client_idle_limit_in_recovery;
                        if limit == -1 {
                            self.close_idle(true).await?;
                            return Ok(None);
                        }
                        if limit > 0 {
                            idle_in_recovery += 1;
                            if idle_in_recovery > limit {
                                self.close_idle(true).await?;
                                return Ok(None);
                            }
                        }
                    } else if self.settings.client_idle_limit > 0 {
                        idle += 1;
                        if idle > self.settings.client_idle_limit {
                            self.close_idle(false).await?;
                            return Ok(None);
                        }
                    }
                },
            }
        }
    }

    /// close_idle tells the client why it is being disconnected and ends the session
    async fn close_idle(&mut self, in_recovery: bool) -> Result<()> {
        let text = if in_recovery {
            "connection terminated due to online recovery"
        } else {
            "connection terminated due to client idle limit"
        };
        info!(in_recovery, "{}", text);
        let msg = Message::new_error(self.frontend.protocol, error_codes::OPERATOR_INTERVENTION, text);
        framer::encode_and_send(&mut self.frontend, &msg).await?;
        self.state = DispatchState::Closed;
        Ok(())
    }

    /// process_idle_backend handles data from a backend while no request is in flight:
    /// shutdown notices, notifications and parameter changes.
    async fn process_idle_backend(&mut self, node: usize) -> Result<()> {
        let stream = self.backends.get_mut(node).ok_or_else(Error::closed)?;
        if detect_admin_shutdown(stream).await? {
            self.backends.status().degenerate(&[node]);
            sleep(self.timings.admin_shutdown_grace).await;
            if self.backends.valid_nodes(Routing::Replicate).is_empty() {
                return Err(Error::closed());
            }
            return Ok(());
        }
        let stream = self.backends.get_mut(node).ok_or_else(Error::closed)?;
        let msg = framer::read_message(stream).await?;
        let is_reference = self.reference_node().ok() == Some(node);
        match msg.tag() {
            Tag::NOTIFICATION_RESPONSE | Tag::NOTICE_RESPONSE | Tag::PARAMETER_STATUS if is_reference => {
                framer::encode_and_send(&mut self.frontend, &msg).await?;
            },
            Tag::ERROR_RESPONSE => {
                let protocol = self.backends.get(node).map_or(self.frontend.protocol, |s| s.protocol);
                let fields = ErrorFields::parse(&msg, protocol)?;
                warn!(node, code = fields.code(), message = fields.message(), "error from idle backend");
                if fields.is_panic_or_fatal() {
                    if is_reference {
                        framer::encode_and_send(&mut self.frontend, &msg).await?;
                    }
                    self.state = DispatchState::Fatal;
                }
            },
            tag => debug!(node, %tag, "discarding message from idle backend"),
        }
        Ok(())
    }

    /// reference_node returns the node whose answers are authoritative
    pub(crate) fn reference_node(&self) -> Result<usize> {
        self.backends.reference_node_id(Routing::Replicate)
            .ok_or_else(|| Error::new("no valid backend node"))
    }

    /// response_nodes are the valid nodes the request in flight was sent to
    pub(crate) fn response_nodes(&self) -> NodeSet {
        let valid = self.backends.valid_nodes(Routing::Replicate);
        match self.ctx.where_to_send() {
            Some(nodes) => valid.intersection(nodes),
            None => valid,
        }
    }

    /// response_reference is the reference node if it takes part in the response,
    /// otherwise the first node that does
    pub(crate) fn response_reference(&self, nodes: NodeSet) -> Result<usize> {
        match self.backends.reference_node_id(Routing::Replicate) {
            Some(node) if nodes.contains(node) => Ok(node),
            _ => self.ctx.virtual_master_node_id()
                .filter(|&n| nodes.contains(n))
                .or_else(|| nodes.first())
                .ok_or_else(|| Error::new("no valid backend node")),
        }
    }

    /// send_to_nodes writes msg to every node in nodes, optionally followed by a Flush, and flushes
    pub(crate) async fn send_to_nodes(&mut self, nodes: NodeSet, msg: &Message, append_flush: bool) -> Result<()> {
        let log = self.settings.log_per_node_statement;
        for node in nodes.iter() {
            let stream = self.backends.get_mut(node).ok_or_else(Error::closed)?;
            framer::write_message(stream, msg)?;
            if append_flush {
                framer::write_message(stream, &Message::new(Tag::FLUSH, Default::default()))?;
            }
            stream.flush().await?;
            if log {
                info!(node, tag = %msg.tag(), statement = %self.ctx.last_query, "sent to node");
            }
        }
        Ok(())
    }

    /// wait_for_query_response waits until node starts answering. While waiting it checks the
    /// client every keepalive interval so a vanished client is noticed.
    pub(crate) async fn wait_for_query_response(&mut self, node: usize) -> Result<()> {
        loop {
            let nodes = NodeSet::single(node);
            match timeout(self.timings.keepalive, wait_readable(None, &mut self.backends, nodes)).await {
                Ok(ready) => return ready.map(|_| ()),
                Err(_) => {
                    if !self.frontend.protocol.is_legacy() {
                        debug!(node, "checking client while waiting for response");
                        let mut mb = MessageBuilder::new(Tag::PARAMETER_STATUS);
                        mb.write_str("pgpool_dummy_param").write_str("pgpool_dummy_value");
                        framer::encode_and_send(&mut self.frontend, &mb.finish()).await?;
                    }
                }
            }
        }
    }

    /// run_reset runs the reset statements on every backend. On success the session state is
    /// cleared and Idle is returned, ready for reuse. Any failure returns Closed.
    pub async fn run_reset(&mut self) -> DispatchState {
        self.state = DispatchState::ResetPending;
        self.ctx.reset_index = 0;
        loop {
            match self.reset_backend().await {
                Ok(ResetOutcome::Skipped) | Ok(ResetOutcome::Issued) => self.ctx.reset_index += 1,
                Ok(ResetOutcome::Done) => {
                    for (_, stream) in self.backends.iter_mut() {
                        stream.tstate = TSTATE_IDLE;
                    }
                    self.ctx.reset_for_reuse();
                    // the next client sees none of this one's temporary tables
                    self.relcache.clear();
                    self.state = DispatchState::Idle;
                    return self.state;
                },
                Ok(ResetOutcome::Failed) => {
                    self.state = DispatchState::Closed;
                    return self.state;
                },
                Err(e) => {
                    warn!(%e, "reset failed");
                    self.state = DispatchState::Closed;
                    return self.state;
                }
            }
        }
    }

    /// reset_backend performs the next step of the reset sequence
    pub async fn reset_backend(&mut self) -> Result<ResetOutcome> {
        let nodes = self.backends.valid_nodes(Routing::Replicate);
        let index = self.ctx.reset_index;
        let query = match self.settings.reset_query_list.get(index) {
            Some(query) => query.clone(),
            None => return self.deallocate_next(nodes).await,
        };
        if query.trim().eq_ignore_ascii_case("ABORT")
            && nodes.iter().all(|n| self.backends.get(n).map_or(true, |s| s.tstate == TSTATE_IDLE)) {
            debug!("skipping ABORT, no backend is in a transaction");
            return Ok(ResetOutcome::Skipped);
        }
        if !self.run_reset_statement(nodes, &query).await? {
            return Ok(ResetOutcome::Failed);
        }
        let upper = query.trim().to_ascii_uppercase();
        if upper == "DISCARD ALL" || upper == "DEALLOCATE ALL" {
            self.ctx.forget_prepare(None);
            self.ctx.clear_sent_messages();
        }
        Ok(ResetOutcome::Issued)
    }

    /// deallocate_next drops one remaining prepared statement, Done when there are none left
    async fn deallocate_next(&mut self, nodes: NodeSet) -> Result<ResetOutcome> {
        if let Some(name) = self.ctx.prepared_sql_names().into_iter().next() {
            self.ctx.forget_prepare(Some(&name));
            let query = format!("DEALLOCATE {}", name);
            return Ok(if self.run_reset_statement(nodes, &query).await? { ResetOutcome::Issued } else { ResetOutcome::Failed });
        }
        if let Some(name) = self.ctx.prepared_statement_names().into_iter().next() {
            self.ctx.remove_sent_message(Tag::PARSE, &name);
            let query = format!("DEALLOCATE \"{}\"", name.replace('"', "\"\""));
            return Ok(if self.run_reset_statement(nodes, &query).await? { ResetOutcome::Issued } else { ResetOutcome::Failed });
        }
        Ok(ResetOutcome::Done)
    }

    /// run_reset_statement runs query on every node with the reset timeout.
    /// An error response from any node is a failure.
    async fn run_reset_statement(&mut self, nodes: NodeSet, query: &str) -> Result<bool> {
        self.ctx.reset_state = ResetState::Awaiting;
        let reset_timeout = self.timings.reset_timeout_seconds;
        let mut ok = true;
        for node in nodes.iter() {
            let stream = self.backends.get_mut(node).ok_or_else(Error::closed)?;
            stream.set_timeout(reset_timeout);
            let result = do_query(stream, query).await;
            stream.set_timeout(0);
            match result {
                Ok(r) => if let Some(err) = r.error {
                    warn!(node, query, error = err.message(), "reset statement failed");
                    ok = false;
                    break;
                },
                Err(e) => {
                    warn!(node, query, %e, "reset statement failed");
                    ok = false;
                    break;
                }
            }
        }
        self.ctx.reset_state = ResetState::NotResetting;
        Ok(ok)
    }

    /// terminate sends Terminate to every connected backend and closes them
    pub async fn terminate_backends(&mut self) {
        let terminate = Message::new(Tag::TERMINATE, Default::default());
        for (node, stream) in self.backends.iter_mut() {
            if framer::write_message(stream, &terminate).is_ok() {
                if let Err(e) = stream.shutdown().await {
                    debug!(node, %e, "error closing backend connection");
                }
            }
        }
    }
}
