use tokio::time::sleep;
use tracing::{debug, info, trace};

use crate::riverpool::{Error, Result};
use crate::riverpool::pg::backend_set::Routing;
use crate::riverpool::pg::dispatch::{wait_readable, Dispatcher, Readiness};
use crate::riverpool::pg::node_set::NodeSet;
use crate::riverpool::pg::protocol::{framer, Message, Tag};
use crate::riverpool::pg::query_context::QueryPhase;
use crate::riverpool::pg::simple_query::{query_message, update_legacy_tstate};
use crate::riverpool::pg::sql::ParsedStatement;

/// is_parallel_eligible returns true if a simple query can be broadcast and drained without
/// reconciling every message. Writes need their row counts summed, and transaction control
/// and COPY FROM STDIN need the reconciled path.
pub fn is_parallel_eligible(parsed: &ParsedStatement) -> bool {
    !(parsed.is_insert() || parsed.is_update_or_delete() || parsed.is_transaction_control() || parsed.is_copy_from_stdin())
}

impl Dispatcher {
    /// parallel_exec sends query to every valid node and drains the answers concurrently.
    /// The first node to answer is the primary and only its stream reaches the client, plus the
    /// first error from anyone. The trailing ReadyForQuery is left for the reconciled path.
    pub(crate) async fn parallel_exec(&mut self, query: &str, parsed: ParsedStatement) -> Result<()> {
        if parsed.is_drop_database() {
            info!("DROP DATABASE, asking the pool to close idle connections");
            self.backends.status().request_close_idle();
            sleep(self.timings.drop_database_grace).await;
        }

        let nodes = self.backends.valid_nodes(Routing::Replicate);
        if nodes.is_empty() {
            return Err(Error::new("no valid backend node"));
        }
        let strict = parsed.is_strict();
        self.ctx.routing = Routing::Replicate;
        self.ctx.start_query(query, parsed, nodes);
        self.ctx.pending_step = Some(Tag::QUERY);

        let msg = query_message(query);
        for node in nodes.iter() {
            self.send_to_nodes(NodeSet::single(node), &msg, false).await?;
            if strict {
                debug!(node, "waiting for node to complete the statement");
                self.wait_for_query_response(node).await?;
            }
        }
        self.ctx.set_query_state(QueryPhase::Executed);

        let mut pending = nodes;
        let mut first_node = None;
        let mut error_forwarded = false;
        let mut completion: Option<Message> = None;
        while !pending.is_empty() {
            let node = match wait_readable(None, &mut self.backends, pending).await? {
                Readiness::Backend(node) => node,
                Readiness::Frontend => continue,
            };
            let primary = *first_node.get_or_insert(node);
            let stream = self.backends.get_mut(node).ok_or_else(Error::closed)?;
            let msg = framer::read_message(stream).await?;
            update_legacy_tstate(stream, &msg);
            trace!(node, tag = %msg.tag(), primary, "parallel response");

            match msg.tag() {
                Tag::ERROR_RESPONSE => {
                    if !error_forwarded {
                        framer::write_message(&mut self.frontend, &msg)?;
                        error_forwarded = true;
                    }
                    pending.remove(node);
                },
                Tag::COMMAND_COMPLETE | Tag::COPY_DONE | Tag::EMPTY_QUERY => {
                    if node == primary || completion.is_none() {
                        completion = Some(msg);
                    }
                    pending.remove(node);
                },
                Tag::READY_FOR_QUERY => {
                    // a node that skipped straight to ReadyForQuery, leave it for the reconciler
                    let stream = self.backends.get_mut(node).ok_or_else(Error::closed)?;
                    stream.unread(&framer::encoded_bytes(stream.protocol, &msg))?;
                    pending.remove(node);
                },
                _ if node == primary => framer::write_message(&mut self.frontend, &msg)?,
                tag => trace!(node, %tag, "discarding message from secondary node"),
            }
        }

        if !error_forwarded {
            if let Some(msg) = completion {
                framer::write_message(&mut self.frontend, &msg)?;
            }
        }
        self.frontend.flush().await?;
        self.ctx.in_progress = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parallel_eligible() {
        assert!(is_parallel_eligible(&ParsedStatement::parse("SELECT * FROM t")));
        assert!(is_parallel_eligible(&ParsedStatement::parse("CREATE TABLE t (id int)")));
        assert!(!is_parallel_eligible(&ParsedStatement::parse("UPDATE t SET a = 1")));
        assert!(!is_parallel_eligible(&ParsedStatement::parse("DELETE FROM t")));
        assert!(!is_parallel_eligible(&ParsedStatement::parse("INSERT INTO t VALUES (1)")));
        assert!(!is_parallel_eligible(&ParsedStatement::parse("BEGIN")));
        assert!(!is_parallel_eligible(&ParsedStatement::parse("COPY t FROM STDIN")));
    }
}
