use tracing::{debug, info, trace, warn};

use crate::riverpool::{Error, Result};
use crate::riverpool::pg::dispatch::{DispatchState, Dispatcher};
use crate::riverpool::pg::node_set::NodeSet;
use crate::riverpool::pg::protocol::{framer, ErrorFields, Message, MessageBuilder, Tag};
use crate::riverpool::pg::query_context::QueryPhase;
use crate::riverpool::pg::reconciler::{
    compare_lengths, compare_row_descriptions, extract_ntuples, ntuples_mismatch_notice, read_messages,
    reconcile_kind, reconcile_row_counts, RowCountOutcome,
};
use crate::riverpool::pg::simple_query::{do_command, update_legacy_tstate};
use crate::riverpool::pg::stream::{TSTATE_ERROR, TSTATE_IDLE, TSTATE_IN_TRANSACTION};

/// completes_step returns true if a backend message of kind ends the request step.
/// Simple queries, function calls and Sync end only at ReadyForQuery.
pub fn completes_step(step: Tag, kind: Tag) -> bool {
    if kind == Tag::READY_FOR_QUERY {
        return true;
    }
    match step {
        Tag::QUERY | Tag::FUNCTION_CALL | Tag::SYNC => false,
        _ if kind == Tag::ERROR_RESPONSE => true,
        Tag::PARSE => kind == Tag::PARSE_COMPLETE,
        Tag::BIND => kind == Tag::BIND_COMPLETE,
        Tag::CLOSE => kind == Tag::CLOSE_COMPLETE,
        Tag::DESCRIBE => kind == Tag::ROW_DESCRIPTION || kind == Tag::NO_DATA,
        Tag::EXECUTE => matches!(kind, Tag::COMMAND_COMPLETE | Tag::PORTAL_SUSPENDED | Tag::EMPTY_QUERY),
        _ => false,
    }
}

impl Dispatcher {
    /// process_backend_response reconciles the next message of every node the request went to
    /// and forwards the result to the client.
    pub(crate) async fn process_backend_response(&mut self) -> Result<()> {
        let nodes = self.response_nodes();
        if nodes.is_empty() {
            return Err(Error::new("no valid backend node for the response"));
        }
        let reference = self.response_reference(nodes)?;
        let kind = reconcile_kind(&mut self.frontend, &mut self.backends, &self.ctx, &self.settings, nodes, reference).await?;
        trace!(%kind, ?nodes, reference, "reconciled kind");

        match kind {
            Tag::READY_FOR_QUERY => self.ready_for_query(nodes, reference).await?,
            Tag::COMMAND_COMPLETE => self.command_complete(nodes, reference).await?,
            Tag::ERROR_RESPONSE => self.error_response(nodes, reference).await?,
            Tag::ROW_DESCRIPTION => self.row_description(nodes, reference).await?,
            Tag::COPY_IN_RESPONSE => self.copy_in_response(nodes, reference).await?,
            Tag::COPY_OUT_RESPONSE if self.frontend.protocol.is_legacy() => self.legacy_copy_out(nodes, reference).await?,
            _ => self.forward_from_reference(nodes, reference, kind).await?,
        }

        if let Some(step) = self.ctx.pending_step {
            if kind != Tag::READY_FOR_QUERY && completes_step(step, kind) {
                self.ctx.in_progress = false;
            }
        }
        let drained = nodes.iter().any(|n| self.backends.get(n).map_or(true, |s| !s.has_pending()));
        if drained || !self.ctx.in_progress {
            self.frontend.flush().await?;
        }
        Ok(())
    }

    fn reference_message(messages: &[(usize, Message)], reference: usize) -> Result<&Message> {
        messages.iter()
            .find(|(node, _)| *node == reference)
            .map(|(_, msg)| msg)
            .ok_or_else(|| Error::new("reference node did not answer"))
    }

    /// forward_from_reference reads the message from every node and forwards the reference node's copy
    async fn forward_from_reference(&mut self, nodes: NodeSet, reference: usize, kind: Tag) -> Result<()> {
        let messages = read_messages(&mut self.backends, nodes).await?;
        compare_lengths(&messages, reference);
        if matches!(kind, Tag::PARSE_COMPLETE | Tag::BIND_COMPLETE | Tag::CLOSE_COMPLETE) {
            self.ctx.command_success = true;
        }
        let msg = Self::reference_message(&messages, reference)?;
        framer::write_message(&mut self.frontend, msg)
    }

    async fn ready_for_query(&mut self, nodes: NodeSet, reference: usize) -> Result<()> {
        let messages = read_messages(&mut self.backends, nodes).await?;
        for (node, msg) in &messages {
            if let Some(stream) = self.backends.get_mut(*node) {
                if !stream.protocol.is_legacy() {
                    if let Some(&state) = msg.body().first() {
                        stream.tstate = state;
                    }
                }
            }
        }
        let states: Vec<u8> = nodes.iter().filter_map(|n| self.backends.get(n).map(|s| s.tstate)).collect();
        if states.windows(2).any(|w| w[0] != w[1]) {
            warn!(states = ?states.iter().map(|&s| s as char).collect::<Vec<_>>(), "transaction state differs between backends");
        }

        let mut msg = Self::reference_message(&messages, reference)?.clone();
        if !self.ctx.internal_transaction_started.is_empty() {
            self.end_internal_transaction(reference).await?;
            if let Some(stream) = self.backends.get(reference) {
                if !stream.protocol.is_legacy() {
                    let mut mb = MessageBuilder::new(Tag::READY_FOR_QUERY);
                    mb.write_byte(stream.tstate);
                    msg = mb.finish();
                }
            }
        }

        let tstate = self.backends.get(reference).map_or(TSTATE_IDLE, |s| s.tstate);
        self.ctx.failed_transaction = tstate == TSTATE_ERROR;
        if tstate == TSTATE_IDLE {
            self.ctx.writing_transaction = false;
        } else if tstate == TSTATE_IN_TRANSACTION {
            let wrote = self.ctx.current().map_or(false, |q| !q.parsed.is_select(q.query(), self.settings.ignore_leading_white_space));
            if wrote {
                self.ctx.writing_transaction = true;
            }
        }

        framer::write_message(&mut self.frontend, &msg)?;
        self.ctx.doing_extended_query = false;
        self.ctx.ignore_till_sync = false;
        self.ctx.query_done();
        Ok(())
    }

    /// end_internal_transaction commits the transactions the proxy opened itself,
    /// on the secondary nodes first and then on the reference node.
    async fn end_internal_transaction(&mut self, reference: usize) -> Result<()> {
        let started = self.ctx.internal_transaction_started;
        self.ctx.internal_transaction_started = NodeSet::empty();
        let secondaries = started.iter().filter(|&n| n != reference);
        let order: Vec<usize> = secondaries.chain(Some(reference).filter(|&r| started.contains(r))).collect();
        for node in order {
            let stream = self.backends.get_mut(node).ok_or_else(Error::closed)?;
            debug!(node, "committing internal transaction");
            do_command(stream, "COMMIT").await?;
        }
        Ok(())
    }

    async fn command_complete(&mut self, nodes: NodeSet, reference: usize) -> Result<()> {
        let messages = read_messages(&mut self.backends, nodes).await?;
        let mut ntuples = vec![-1i64; self.backends.num_backends()];
        for (node, msg) in &messages {
            if let Some(stream) = self.backends.get_mut(*node) {
                update_legacy_tstate(stream, msg);
            }
            ntuples[*node] = extract_ntuples(msg.first_str()?);
        }
        let msg = Self::reference_message(&messages, reference)?;
        let command_tag = msg.first_str()?.to_string();
        self.ctx.command_success = true;

        match reconcile_row_counts(&ntuples, &command_tag, self.settings.parallel_mode) {
            RowCountOutcome::Agreed => framer::write_message(&mut self.frontend, msg)?,
            RowCountOutcome::Summed(total) => {
                let keyword = command_tag.split(' ').next().unwrap_or("UPDATE");
                let mut mb = MessageBuilder::new(Tag::COMMAND_COMPLETE);
                mb.write_str(&format!("{} {}", keyword, total));
                framer::write_message(&mut self.frontend, &mb.finish())?;
            },
            RowCountOutcome::Mismatch => {
                self.ctx.mismatch_ntuples = true;
                let counts: Vec<String> = nodes.iter().map(|n| format!("{}[{}]", n, ntuples[n])).collect();
                warn!(query = %self.ctx.last_query, counts = %counts.join(" "),
                    "pgpool detected difference of the number of inserted, updated or deleted tuples");
                let notice = ntuples_mismatch_notice(self.frontend.protocol, &self.ctx.last_query);
                framer::write_message(&mut self.frontend, &notice)?;
                framer::write_message(&mut self.frontend, msg)?;
            },
        }
        self.ctx.ntuples = ntuples;
        Ok(())
    }

    async fn error_response(&mut self, nodes: NodeSet, reference: usize) -> Result<()> {
        let messages = read_messages(&mut self.backends, nodes).await?;
        for (node, msg) in &messages {
            if let Some(stream) = self.backends.get_mut(*node) {
                update_legacy_tstate(stream, msg);
            }
        }
        let msg = Self::reference_message(&messages, reference)?;
        let protocol = self.backends.get(reference).map_or(self.frontend.protocol, |s| s.protocol);
        let fields = ErrorFields::parse(msg, protocol)?;
        debug!(reference, code = fields.code(), message = fields.message(), "error response");
        framer::write_message(&mut self.frontend, msg)?;
        self.ctx.set_query_state(QueryPhase::Errored);

        if fields.is_panic_or_fatal() {
            self.frontend.flush().await?;
            info!(code = fields.code(), message = fields.message(), "backend is closing the session");
            self.set_state(DispatchState::Fatal);
            return Ok(());
        }
        if self.ctx.doing_extended_query {
            self.ctx.ignore_till_sync = true;
        }
        Ok(())
    }

    async fn row_description(&mut self, nodes: NodeSet, reference: usize) -> Result<()> {
        let messages = read_messages(&mut self.backends, nodes).await?;
        let protocol = self.backends.get(reference).map_or(self.frontend.protocol, |s| s.protocol);
        compare_row_descriptions(&messages, reference, protocol)?;
        let msg = Self::reference_message(&messages, reference)?;
        framer::write_message(&mut self.frontend, msg)
    }

    /// copy_in_response forwards CopyInResponse, then relays the client's copy data to every node
    /// until the client finishes or aborts the copy.
    async fn copy_in_response(&mut self, nodes: NodeSet, reference: usize) -> Result<()> {
        let messages = read_messages(&mut self.backends, nodes).await?;
        let msg = Self::reference_message(&messages, reference)?;
        framer::encode_and_send(&mut self.frontend, msg).await?;
        self.ctx.in_copy_in = true;
        let result = self.relay_copy_in(nodes).await;
        self.ctx.in_copy_in = false;
        result
    }

    async fn relay_copy_in(&mut self, nodes: NodeSet) -> Result<()> {
        if self.frontend.protocol.is_legacy() {
            loop {
                let line = self.frontend.read_line().await?;
                self.write_to_nodes(nodes, &line)?;
                if &line[..] == b"\\.\n" || &line[..] == b"\\.\r\n" {
                    break;
                }
            }
        } else {
            loop {
                let msg = framer::read_message(&mut self.frontend).await?;
                match msg.tag() {
                    Tag::COPY_DATA => self.write_message_to_nodes(nodes, &msg)?,
                    Tag::COPY_DONE | Tag::COPY_FAIL => {
                        self.write_message_to_nodes(nodes, &msg)?;
                        break;
                    },
                    // flush and sync may arrive inside an extended protocol COPY
                    Tag::FLUSH | Tag::SYNC => self.write_message_to_nodes(nodes, &msg)?,
                    tag => return Err(Error::protocol_error(format!("unexpected {} during COPY FROM STDIN", tag))),
                }
            }
        }
        for node in nodes.iter() {
            if let Some(stream) = self.backends.get_mut(node) {
                stream.flush().await?;
            }
        }
        Ok(())
    }

    fn write_to_nodes(&mut self, nodes: NodeSet, bytes: &[u8]) -> Result<()> {
        for node in nodes.iter() {
            self.backends.get_mut(node).ok_or_else(Error::closed)?.write(bytes)?;
        }
        Ok(())
    }

    fn write_message_to_nodes(&mut self, nodes: NodeSet, msg: &Message) -> Result<()> {
        for node in nodes.iter() {
            framer::write_message(self.backends.get_mut(node).ok_or_else(Error::closed)?, msg)?;
        }
        Ok(())
    }

    /// legacy_copy_out relays the raw lines of a V2 COPY TO STDOUT. Only the reference node's
    /// lines reach the client.
    async fn legacy_copy_out(&mut self, nodes: NodeSet, reference: usize) -> Result<()> {
        let messages = read_messages(&mut self.backends, nodes).await?;
        framer::write_message(&mut self.frontend, Self::reference_message(&messages, reference)?)?;
        for node in nodes.iter() {
            let stream = self.backends.get_mut(node).ok_or_else(Error::closed)?;
            loop {
                let line = stream.read_line().await?;
                let done = &line[..] == b"\\.\n";
                if node == reference {
                    self.frontend.write(&line)?;
                }
                if done {
                    break;
                }
            }
        }
        self.frontend.flush().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_completes_step() {
        assert!(completes_step(Tag::PARSE, Tag::PARSE_COMPLETE));
        assert!(!completes_step(Tag::PARSE, Tag::BIND_COMPLETE));
        assert!(completes_step(Tag::BIND, Tag::ERROR_RESPONSE));
        assert!(completes_step(Tag::DESCRIBE, Tag::NO_DATA));
        assert!(!completes_step(Tag::DESCRIBE, Tag::PARAMETER_DESCRIPTION));
        assert!(completes_step(Tag::EXECUTE, Tag::PORTAL_SUSPENDED));
        assert!(!completes_step(Tag::QUERY, Tag::ERROR_RESPONSE));
        assert!(!completes_step(Tag::SYNC, Tag::ERROR_RESPONSE));
        assert!(completes_step(Tag::QUERY, Tag::READY_FOR_QUERY));
    }
}
