use bytes::Bytes;
use tracing::{debug, info};

use crate::riverpool::{Error, Result};
use crate::riverpool::pg::backend_set::Routing;
use crate::riverpool::pg::dispatch::{DispatchState, Dispatcher};
use crate::riverpool::pg::node_set::NodeSet;
use crate::riverpool::pg::parallel::is_parallel_eligible;
use crate::riverpool::pg::protocol::{framer, Message, Tag};
use crate::riverpool::pg::query_context::{QueryContextId, QueryPhase};
use crate::riverpool::pg::reporting;
use crate::riverpool::pg::sent_message::SentMessage;
use crate::riverpool::pg::simple_query::do_command;
use crate::riverpool::pg::sql::ParsedStatement;
use crate::riverpool::pg::stream::TSTATE_IDLE;

impl Dispatcher {
    /// process_frontend_request reads one message from the client and sends it on to the backends
    pub(crate) async fn process_frontend_request(&mut self) -> Result<()> {
        let msg = framer::read_message(&mut self.frontend).await?;
        match msg.tag() {
            Tag::TERMINATE => {
                debug!("client sent terminate");
                self.set_state(DispatchState::Closed);
                Ok(())
            },
            Tag::QUERY => self.simple_query(msg).await,
            Tag::PARSE => self.parse(msg).await,
            Tag::BIND => self.bind(msg).await,
            Tag::DESCRIBE => self.describe(msg).await,
            Tag::EXECUTE => self.execute(msg).await,
            Tag::CLOSE => self.close(msg).await,
            Tag::SYNC => self.sync(msg).await,
            Tag::FLUSH => {
                let nodes = self.backends.valid_nodes(Routing::Replicate);
                self.send_to_nodes(nodes, &msg, false).await
            },
            Tag::FUNCTION_CALL => {
                let nodes = self.write_nodes();
                self.ctx.begin_sync(nodes);
                self.send_to_nodes(nodes, &msg, false).await?;
                self.ctx.pending_step = Some(Tag::FUNCTION_CALL);
                self.ctx.in_progress = true;
                Ok(())
            },
            // copy data outside of a COPY, the backends will complain about it
            Tag::COPY_DATA | Tag::COPY_DONE | Tag::COPY_FAIL => {
                let nodes = self.backends.valid_nodes(Routing::Replicate);
                self.send_to_nodes(nodes, &msg, false).await
            },
            tag => Err(Error::protocol_error(format!("unexpected message {} from client", tag))),
        }
    }

    /// write_nodes are the nodes a statement that is not load balanced goes to: every valid node
    /// when replicating, otherwise just the reference node.
    pub(crate) fn write_nodes(&self) -> NodeSet {
        if self.settings.replication_mode || self.settings.parallel_mode {
            self.backends.valid_nodes(Routing::Replicate)
        } else {
            self.reference_node().map(NodeSet::single).unwrap_or_default()
        }
    }

    async fn simple_query(&mut self, msg: Message) -> Result<()> {
        let query = msg.first_str()?.to_string();
        if self.settings.log_statement {
            info!(statement = %query, "statement");
        }
        let parsed = ParsedStatement::parse(&query);
        if parsed.show_name().map_or(false, |name| name.eq_ignore_ascii_case("pool_status")) {
            self.ctx.last_query = query;
            return self.send_pool_status().await;
        }
        if self.settings.parallel_mode && is_parallel_eligible(&parsed) {
            return self.parallel_exec(&query, parsed).await;
        }

        let nodes = self.route_query(&query, &parsed).await?;
        match &parsed {
            ParsedStatement::Prepare{name, ..} => self.ctx.remember_prepare(name, nodes),
            ParsedStatement::Deallocate{name} => self.ctx.forget_prepare(name.as_deref()),
            _ => (),
        }
        let strict = parsed.is_strict();
        let needs_transaction = parsed.needs_transaction();
        self.ctx.start_query(&query, parsed, nodes);
        self.ctx.pending_step = Some(Tag::QUERY);

        if self.settings.replication_mode && needs_transaction && nodes.len() > 1 {
            self.start_internal_transaction(nodes).await?;
        }

        let reference = self.response_reference(nodes)?;
        if strict && nodes.len() > 1 {
            // the reference node goes first so the others see its locks and sequence values
            self.send_to_nodes(NodeSet::single(reference), &msg, false).await?;
            self.wait_for_query_response(reference).await?;
            let mut rest = nodes;
            rest.remove(reference);
            self.send_to_nodes(rest, &msg, false).await?;
        } else {
            self.send_to_nodes(nodes, &msg, false).await?;
        }
        self.ctx.set_query_state(QueryPhase::Executed);
        self.ctx.in_progress = true;
        Ok(())
    }

    /// route_query decides which nodes receive a statement
    async fn route_query(&mut self, query: &str, parsed: &ParsedStatement) -> Result<NodeSet> {
        if let ParsedStatement::Execute{name} = parsed {
            if let Some(nodes) = self.ctx.prepared_send_set(name) {
                let nodes = nodes.intersection(self.backends.valid_nodes(Routing::Replicate));
                if !nodes.is_empty() {
                    return Ok(nodes);
                }
            }
        }
        if self.load_balance_enabled(query, parsed).await? {
            if let Some(node) = self.ctx.load_balance_node {
                debug!(node, "load balancing statement");
                self.ctx.routing = Routing::LoadBalance(node);
                return Ok(NodeSet::single(node));
            }
        }
        self.ctx.routing = Routing::Replicate;
        Ok(self.write_nodes())
    }

    /// load_balance_enabled returns true if the statement can run on the load balance node alone
    pub(crate) async fn load_balance_enabled(&mut self, query: &str, parsed: &ParsedStatement) -> Result<bool> {
        let settings = &self.settings;
        if !settings.load_balance_mode || !(settings.replication_mode || settings.parallel_mode) {
            return Ok(false);
        }
        if self.frontend.protocol.is_legacy() || self.ctx.writing_transaction || self.ctx.failed_transaction {
            return Ok(false);
        }
        if !parsed.is_select(query, settings.ignore_leading_white_space) || parsed.is_sequence_mutation() {
            return Ok(false);
        }
        let reference = self.reference_node()?;
        let stream = self.backends.get_mut(reference).ok_or_else(Error::closed)?;
        if stream.tstate != TSTATE_IDLE {
            return Ok(false);
        }
        for relation in parsed.relations() {
            if self.relcache.lookup(stream, &self.database, relation).await? {
                debug!(relation, "statement uses a temporary table, not load balancing");
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// start_internal_transaction opens a transaction on every idle node, so a replicated write
    /// commits everywhere or nowhere
    async fn start_internal_transaction(&mut self, nodes: NodeSet) -> Result<()> {
        for node in nodes.iter() {
            if self.ctx.internal_transaction_started.contains(node) {
                continue;
            }
            let stream = self.backends.get_mut(node).ok_or_else(Error::closed)?;
            if stream.tstate != TSTATE_IDLE {
                continue;
            }
            if self.settings.log_per_node_statement {
                info!(node, statement = "BEGIN", "sent to node");
            }
            do_command(stream, "BEGIN").await?;
            self.ctx.internal_transaction_started.insert(node);
            self.ctx.writing_transaction = false;
        }
        Ok(())
    }

    /// forward_extended sends an extended protocol message, followed by a Flush, and records the step
    async fn forward_extended(&mut self, msg: &Message, nodes: NodeSet, step: Tag, phase: QueryPhase) -> Result<()> {
        self.ctx.doing_extended_query = true;
        self.send_to_nodes(nodes, msg, true).await?;
        self.ctx.set_query_state(phase);
        if !self.ctx.ignore_till_sync {
            self.ctx.pending_step = Some(step);
            self.ctx.in_progress = true;
        }
        Ok(())
    }

    /// lookup_statement finds the context of a named statement (Parse) or portal (Bind)
    fn lookup_statement(&self, kind: Tag, name: &str) -> Option<(QueryContextId, NodeSet)> {
        let sent = self.ctx.get_sent_message(kind, name)?;
        let ctx = self.ctx.query_context(sent.query_context)?;
        Some((sent.query_context, ctx.where_to_send()))
    }

    /// referenced_nodes makes the context of the referenced statement or portal current and
    /// returns where it was sent. Unknown names go to every valid node, which will report the error.
    fn referenced_nodes(&mut self, kind: Tag, name: &str) -> NodeSet {
        let valid = self.backends.valid_nodes(Routing::Replicate);
        match self.lookup_statement(kind, name) {
            Some((id, nodes)) => {
                self.ctx.set_current(id);
                let nodes = nodes.intersection(valid);
                if nodes.is_empty() { valid } else { nodes }
            },
            None => {
                debug!(%kind, name, "no such statement or portal");
                self.ctx.begin_sync(valid);
                valid
            }
        }
    }

    async fn parse(&mut self, msg: Message) -> Result<()> {
        let (name, query) = {
            let r = msg.reader();
            (r.read_str()?.to_string(), r.read_str()?.to_string())
        };
        if self.settings.log_statement {
            info!(statement = %query, name = %name, "parse");
        }
        let parsed = ParsedStatement::parse(&query);
        let nodes = self.route_query(&query, &parsed).await?;
        let id = self.ctx.start_query(&query, parsed, nodes);
        let contents: Bytes = msg.body_bytes().clone();
        self.ctx.add_sent_message(SentMessage::new(Tag::PARSE, name, contents, id));
        self.forward_extended(&msg, nodes, Tag::PARSE, QueryPhase::Parsed).await
    }

    async fn bind(&mut self, msg: Message) -> Result<()> {
        let (portal, statement) = {
            let r = msg.reader();
            (r.read_str()?.to_string(), r.read_str()?.to_string())
        };
        let nodes = self.referenced_nodes(Tag::PARSE, &statement);
        if let Some(id) = self.ctx.current_id() {
            self.ctx.add_sent_message(SentMessage::new(Tag::BIND, portal, msg.body_bytes().clone(), id));
        }
        self.forward_extended(&msg, nodes, Tag::BIND, QueryPhase::Bound).await
    }

    async fn describe(&mut self, msg: Message) -> Result<()> {
        let (kind, name) = {
            let r = msg.reader();
            (r.read_byte(), r.read_str()?.to_string())
        };
        let kind = if kind == b'S' { Tag::PARSE } else { Tag::BIND };
        let nodes = self.referenced_nodes(kind, &name);
        self.forward_extended(&msg, nodes, Tag::DESCRIBE, QueryPhase::Described).await
    }

    async fn execute(&mut self, msg: Message) -> Result<()> {
        let portal = msg.reader().read_str()?.to_string();
        let nodes = self.referenced_nodes(Tag::BIND, &portal);
        if let Some(query) = self.ctx.current().map(|q| q.query().to_string()) {
            if self.settings.log_statement {
                info!(statement = %query, portal = %portal, "execute");
            }
            self.ctx.last_query = query;
        }
        self.forward_extended(&msg, nodes, Tag::EXECUTE, QueryPhase::Executed).await
    }

    async fn close(&mut self, msg: Message) -> Result<()> {
        let (kind, name) = {
            let r = msg.reader();
            (r.read_byte(), r.read_str()?.to_string())
        };
        let kind = if kind == b'S' { Tag::PARSE } else { Tag::BIND };
        let nodes = self.referenced_nodes(kind, &name);
        self.ctx.remove_sent_message(kind, &name);
        self.forward_extended(&msg, nodes, Tag::CLOSE, QueryPhase::NotSent).await
    }

    async fn sync(&mut self, msg: Message) -> Result<()> {
        let nodes = self.backends.valid_nodes(Routing::Replicate);
        self.ctx.begin_sync(nodes);
        self.send_to_nodes(nodes, &msg, false).await?;
        self.ctx.pending_step = Some(Tag::SYNC);
        self.ctx.in_progress = true;
        Ok(())
    }

    /// send_pool_status answers SHOW pool_status without involving the backends
    pub(crate) async fn send_pool_status(&mut self) -> Result<()> {
        let rows = reporting::pool_status(&self.settings, &self.backends);
        let tstate = self.reference_node().ok()
            .and_then(|n| self.backends.get(n))
            .map_or(TSTATE_IDLE, |s| s.tstate);
        reporting::send_rows(&mut self.frontend, &rows, tstate).await
    }
}
