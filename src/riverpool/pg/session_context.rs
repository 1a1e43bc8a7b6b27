use fnv::FnvHashMap;
use rand::SeedableRng;
use rand::rngs::StdRng;
use tracing::debug;

use crate::riverpool::pg::backend_set::Routing;
use crate::riverpool::pg::node_set::{NodeSet, MAX_BACKENDS};
use crate::riverpool::pg::protocol::Tag;
use crate::riverpool::pg::query_context::{QueryContext, QueryContextArena, QueryContextId, QueryPhase};
use crate::riverpool::pg::sent_message::{AddOutcome, SentMessage, SentMessageList};
use crate::riverpool::pg::sql::ParsedStatement;

/// The most SQL-level PREPARE names whose send set we remember
pub const MAX_PREPARED_STATEMENTS: usize = 128;

/// Where the connection reset sequence stands
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ResetState {
    NotResetting,
    /// a reset statement was issued, its response is being drained
    Awaiting,
}

/// SessionContext is the per-client state threaded through the dispatch loop.
pub struct SessionContext {
    contexts: QueryContextArena,
    current: Option<QueryContextId>,
    sent_messages: SentMessageList,
    /// SQL-level PREPARE name -> send set
    prepared_send_map: FnvHashMap<String, NodeSet>,
    /// A query was sent and its response has not been fully returned yet
    pub in_progress: bool,
    pub doing_extended_query: bool,
    pub command_success: bool,
    pub writing_transaction: bool,
    pub failed_transaction: bool,
    pub ignore_till_sync: bool,
    /// Backends returned different affected row counts for the last write.
    /// Stays set until the next query starts.
    pub mismatch_ntuples: bool,
    /// Affected rows per node for the last write, -1 for nodes that did not take part
    pub ntuples: Vec<i64>,
    /// Routing of the statement in flight
    pub routing: Routing,
    /// The load balance node chosen for this session
    pub load_balance_node: Option<usize>,
    pub reset_state: ResetState,
    /// Index of the next reset statement to issue
    pub reset_index: usize,
    /// Nodes on which the proxy opened a transaction the client doesn't know about
    pub internal_transaction_started: NodeSet,
    /// The last statement text from the client, used in diagnostics
    pub last_query: String,
    /// The step the request in flight is waiting to complete
    pub pending_step: Option<Tag>,
    /// Copy-in relay is active
    pub in_copy_in: bool,
    pub rng: StdRng,
}

impl SessionContext {
    pub fn new(num_backends: usize, seed: Option<u64>) -> Self {
        Self {
            contexts: QueryContextArena::default(),
            current: None,
            sent_messages: SentMessageList::default(),
            prepared_send_map: FnvHashMap::default(),
            in_progress: false,
            doing_extended_query: false,
            command_success: false,
            writing_transaction: false,
            failed_transaction: false,
            ignore_till_sync: false,
            mismatch_ntuples: false,
            ntuples: vec![-1; num_backends.min(MAX_BACKENDS)],
            routing: Routing::Replicate,
            load_balance_node: None,
            reset_state: ResetState::NotResetting,
            reset_index: 0,
            internal_transaction_started: NodeSet::empty(),
            last_query: String::new(),
            pending_step: None,
            in_copy_in: false,
            rng: match seed {
                Some(seed) => StdRng::seed_from_u64(seed),
                None => StdRng::from_entropy(),
            },
        }
    }

    /// start_query begins a new query: a fresh context with reset phases and the given send set
    /// becomes current. The previous current context is destroyed unless a sent message still
    /// references it. The row count mismatch flag from the previous query is cleared.
    pub fn start_query(&mut self, query: &str, parsed: ParsedStatement, where_to_send: NodeSet) -> QueryContextId {
        let id = self.contexts.insert(QueryContext::new(query.to_string(), parsed, where_to_send));
        let previous = self.current.replace(id);
        if let Some(prev) = previous {
            self.destroy_if_unused(prev);
        }
        self.last_query = query.to_string();
        self.mismatch_ntuples = false;
        self.command_success = false;
        debug!(query, ?where_to_send, "start query");
        id
    }

    /// begin_sync makes a context for a Sync or FunctionCall current without touching the
    /// last query text or the row count flags
    pub fn begin_sync(&mut self, where_to_send: NodeSet) -> QueryContextId {
        let id = self.contexts.insert(QueryContext::new(String::new(), ParsedStatement::Empty, where_to_send));
        if let Some(prev) = self.current.replace(id) {
            self.destroy_if_unused(prev);
        }
        id
    }

    pub fn current_id(&self) -> Option<QueryContextId> {
        self.current
    }

    pub fn current(&self) -> Option<&QueryContext> {
        self.current.and_then(|id| self.contexts.get(id))
    }

    pub fn current_mut(&mut self) -> Option<&mut QueryContext> {
        match self.current {
            Some(id) => self.contexts.get_mut(id),
            None => None,
        }
    }

    pub fn query_context(&self, id: QueryContextId) -> Option<&QueryContext> {
        self.contexts.get(id)
    }

    /// set_current makes an existing context current, e.g. the one behind a named statement
    pub fn set_current(&mut self, id: QueryContextId) {
        if self.contexts.contains(id) && self.current != Some(id) {
            if let Some(prev) = self.current.replace(id) {
                self.destroy_if_unused(prev);
            }
        }
    }

    /// is_node_targeted returns true if the current query goes to node.
    /// With no current query every node is a target.
    pub fn is_node_targeted(&self, node: usize) -> bool {
        self.current().map_or(true, |ctx| ctx.is_node_targeted(node))
    }

    pub fn where_to_send(&self) -> Option<NodeSet> {
        self.current().map(QueryContext::where_to_send)
    }

    pub fn virtual_master_node_id(&self) -> Option<usize> {
        self.current().and_then(QueryContext::virtual_master_node_id)
    }

    pub fn set_query_state(&mut self, phase: QueryPhase) {
        if let Some(ctx) = self.current_mut() {
            ctx.set_phase_for_targets(phase);
        }
    }

    /// query_done ends the current query. The context survives if sent messages use it.
    pub fn query_done(&mut self) {
        if let Some(id) = self.current.take() {
            self.destroy_if_unused(id);
        }
        self.in_progress = false;
        self.pending_step = None;
        self.routing = Routing::Replicate;
    }

    /// can_query_context_destroy returns true when no sent message references the context
    /// and it is not the current one
    pub fn can_query_context_destroy(&self, id: QueryContextId) -> bool {
        self.contexts.refs(id) == 0 && self.current != Some(id)
    }

    fn destroy_if_unused(&mut self, id: QueryContextId) {
        if self.can_query_context_destroy(id) {
            self.contexts.remove(id);
        }
    }

    /// live_contexts returns the number of query contexts still allocated
    pub fn live_contexts(&self) -> usize {
        self.contexts.len()
    }

    /// add_sent_message stores message and takes a reference on its query context.
    /// An unnamed entry of the same kind is replaced, a named one is kept as is.
    pub fn add_sent_message(&mut self, message: SentMessage) {
        let id = message.query_context;
        match self.sent_messages.add(message) {
            AddOutcome::Added => self.contexts.add_ref(id),
            AddOutcome::Replaced(old) => {
                self.contexts.add_ref(id);
                self.release_message(old);
            },
            AddOutcome::Kept => (),
        }
    }

    pub fn get_sent_message(&self, kind: Tag, name: &str) -> Option<&SentMessage> {
        self.sent_messages.get(kind, name)
    }

    /// remove_sent_message drops the entry and its reference on the query context
    pub fn remove_sent_message(&mut self, kind: Tag, name: &str) -> bool {
        match self.sent_messages.remove(kind, name) {
            Some(old) => {
                self.release_message(old);
                true
            },
            None => false,
        }
    }

    fn release_message(&mut self, message: SentMessage) {
        let id = message.query_context;
        if self.contexts.release(id) == 0 {
            self.destroy_if_unused(id);
        }
    }

    pub fn clear_sent_messages(&mut self) {
        for message in self.sent_messages.drain() {
            self.release_message(message);
        }
    }

    /// prepared_statement_names returns the names of named statements created with Parse
    pub fn prepared_statement_names(&self) -> Vec<String> {
        self.sent_messages.names(Tag::PARSE).into_iter().filter(|n| !n.is_empty()).collect()
    }

    /// remember_prepare records the send set of an SQL-level PREPARE
    pub fn remember_prepare(&mut self, name: &str, nodes: NodeSet) {
        if self.prepared_send_map.len() >= MAX_PREPARED_STATEMENTS && !self.prepared_send_map.contains_key(name) {
            debug!(name, "too many prepared statements, send set not remembered");
            return;
        }
        self.prepared_send_map.insert(name.to_string(), nodes);
    }

    pub fn prepared_send_set(&self, name: &str) -> Option<NodeSet> {
        self.prepared_send_map.get(name).copied()
    }

    pub fn forget_prepare(&mut self, name: Option<&str>) {
        match name {
            Some(name) => { self.prepared_send_map.remove(name); },
            None => self.prepared_send_map.clear(),
        }
    }

    pub fn prepared_sql_names(&self) -> Vec<String> {
        self.prepared_send_map.keys().cloned().collect()
    }

    /// reset_for_reuse clears everything a client could have left behind
    pub fn reset_for_reuse(&mut self) {
        self.query_done();
        self.clear_sent_messages();
        self.prepared_send_map.clear();
        self.ignore_till_sync = false;
        self.doing_extended_query = false;
        self.writing_transaction = false;
        self.failed_transaction = false;
        self.internal_transaction_started = NodeSet::empty();
        self.reset_state = ResetState::NotResetting;
        self.reset_index = 0;
        self.pending_step = None;
        self.in_copy_in = false;
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;

    fn ctx() -> SessionContext {
        SessionContext::new(3, Some(1))
    }

    fn parse_msg(session: &mut SessionContext, name: &str) -> QueryContextId {
        let id = session.start_query("SELECT 1", ParsedStatement::parse("SELECT 1"), NodeSet::all(3));
        session.add_sent_message(SentMessage::new(Tag::PARSE, name.to_string(), Bytes::new(), id));
        id
    }

    #[test]
    fn test_context_outlives_query_while_referenced() {
        let mut session = ctx();
        let id = parse_msg(&mut session, "s1");
        session.query_done();
        assert!(session.query_context(id).is_some());
        assert!(!session.can_query_context_destroy(id));

        // a new query does not destroy a referenced context
        session.start_query("SELECT 2", ParsedStatement::parse("SELECT 2"), NodeSet::single(1));
        assert!(session.query_context(id).is_some());
        assert!(session.is_node_targeted(1));
        assert!(!session.is_node_targeted(0));
        assert_eq!(session.virtual_master_node_id(), Some(1));

        assert!(session.remove_sent_message(Tag::PARSE, "s1"));
        assert!(session.query_context(id).is_none());
    }

    #[test]
    fn test_unreferenced_context_destroyed_on_next_query() {
        let mut session = ctx();
        let first = session.start_query("SELECT 1", ParsedStatement::parse("SELECT 1"), NodeSet::all(3));
        session.start_query("SELECT 2", ParsedStatement::parse("SELECT 2"), NodeSet::all(3));
        assert!(session.query_context(first).is_none());
        assert_eq!(session.live_contexts(), 1);
    }

    #[test]
    fn test_unnamed_statement_replaced() {
        let mut session = ctx();
        let first = parse_msg(&mut session, "");
        let second = parse_msg(&mut session, "");
        session.query_done();
        assert!(session.query_context(first).is_none());
        assert!(session.query_context(second).is_some());
        assert_eq!(session.get_sent_message(Tag::PARSE, "").unwrap().query_context, second);
    }

    #[test]
    fn test_named_statement_kept() {
        let mut session = ctx();
        let first = parse_msg(&mut session, "s");
        let second = parse_msg(&mut session, "s");
        assert_eq!(session.get_sent_message(Tag::PARSE, "s").unwrap().query_context, first);
        session.query_done();
        // the second context was never referenced
        assert!(session.query_context(second).is_none());
        assert_eq!(session.prepared_statement_names(), vec!["s".to_string()]);
        session.clear_sent_messages();
        assert_eq!(session.live_contexts(), 0);
    }

    #[test]
    fn test_prepared_send_map() {
        let mut session = ctx();
        for i in 0..MAX_PREPARED_STATEMENTS + 5 {
            session.remember_prepare(&format!("P{}", i), NodeSet::single(0));
        }
        assert_eq!(session.prepared_sql_names().len(), MAX_PREPARED_STATEMENTS);
        assert_eq!(session.prepared_send_set("P0"), Some(NodeSet::single(0)));
        session.forget_prepare(None);
        assert!(session.prepared_send_set("P0").is_none());
    }
}
