use std::fmt::Write;

use fnv::FnvHashMap;
use tracing::{debug, error, warn};

use crate::riverpool::{Error, Result};
use crate::riverpool::config::Settings;
use crate::riverpool::pg::backend_set::BackendSet;
use crate::riverpool::pg::node_set::NodeSet;
use crate::riverpool::pg::protocol::{
    error_codes, framer, ErrorFields, ErrorSeverity, Message, MessageErrorBuilder, ProtocolVersion, RowDescription, Tag,
};
use crate::riverpool::pg::session_context::SessionContext;
use crate::riverpool::pg::stream::PoolStream;

pub const KIND_MISMATCH_HINT: &str = "check data consistency among db nodes";
pub const NTUPLES_MISMATCH_HINT: &str = "check data consistency between master and other db node";

/// The outcome of the kind vote
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct KindDecision {
    pub kind: Tag,
    /// nodes whose kind differs from kind
    pub mismatched: Vec<usize>,
}

/// decide_kind picks the authoritative message kind from the kinds each node answered with.
/// If all agree that kind wins. Otherwise a kind seen on more than half of the nodes wins,
/// and if there is no such kind the reference node's kind wins.
pub fn decide_kind(kinds: &[(usize, Tag)], reference: usize) -> KindDecision {
    let mut counts: FnvHashMap<Tag, usize> = FnvHashMap::default();
    for (_, kind) in kinds {
        *counts.entry(*kind).or_insert(0) += 1;
    }
    let reference_kind = kinds.iter()
        .find(|(node, _)| *node == reference)
        .or_else(|| kinds.first())
        .map(|(_, kind)| *kind)
        .unwrap_or_default();

    let kind = if counts.len() <= 1 {
        reference_kind
    } else {
        let n = kinds.len();
        match counts.iter().max_by_key(|entry| *entry.1) {
            Some((&kind, &count)) if count > n / 2 => kind,
            _ => reference_kind,
        }
    };
    let mismatched = kinds.iter().filter(|(_, k)| *k != kind).map(|(node, _)| *node).collect();
    KindDecision{kind, mismatched}
}

/// peek_tag returns the tag of the next message without consuming it
pub async fn peek_tag(stream: &mut PoolStream) -> Result<Tag> {
    let b = stream.read_byte().await?;
    stream.unread(&[b])?;
    Ok(Tag::from_u8(b))
}

/// peek_message returns the next message and pushes it back
pub async fn peek_message(stream: &mut PoolStream) -> Result<Message> {
    let msg = framer::read_message(stream).await?;
    stream.unread(&framer::encoded_bytes(stream.protocol, &msg))?;
    Ok(msg)
}

/// read_kind peeks the tag of the next message on one backend. V3 ParameterStatus messages
/// in front of it are consumed and recorded on the connection.
pub async fn read_kind(stream: &mut PoolStream) -> Result<Tag> {
    loop {
        let tag = peek_tag(stream).await?;
        if tag != Tag::PARAMETER_STATUS || stream.protocol.is_legacy() {
            return Ok(tag);
        }
        let msg = framer::read_message(stream).await?;
        let r = msg.reader();
        let name = r.read_str()?.to_string();
        let value = r.read_str()?.to_string();
        debug!(peer = ?stream.peer, %name, %value, "skipping parameter status");
        stream.params.set(name, value);
    }
}

/// read_kinds peeks the next message kind on every node in nodes
pub async fn read_kinds(backends: &mut BackendSet, nodes: NodeSet) -> Result<Vec<(usize, Tag)>> {
    let mut kinds = Vec::with_capacity(nodes.len());
    for node in nodes.iter() {
        let stream = backends.get_mut(node).ok_or_else(|| Error::closed())?;
        kinds.push((node, read_kind(stream).await?));
    }
    Ok(kinds)
}

/// read_messages reads one whole message from every node in nodes
pub async fn read_messages(backends: &mut BackendSet, nodes: NodeSet) -> Result<Vec<(usize, Message)>> {
    let mut messages = Vec::with_capacity(nodes.len());
    for node in nodes.iter() {
        let stream = backends.get_mut(node).ok_or_else(|| Error::closed())?;
        messages.push((node, framer::read_message(stream).await?));
    }
    Ok(messages)
}

/// reconcile_kind votes on the next message kind of every node in nodes.
/// On disagreement the client gets an XX000 error describing what each node returned.
/// With replication_stop_on_mismatch the disagreeing nodes are fenced. Either way the call fails.
pub async fn reconcile_kind(
    frontend: &mut PoolStream,
    backends: &mut BackendSet,
    ctx: &SessionContext,
    settings: &Settings,
    nodes: NodeSet,
    reference: usize,
) -> Result<Tag> {
    let kinds = read_kinds(backends, nodes).await?;
    let decision = decide_kind(&kinds, reference);
    if decision.mismatched.is_empty() {
        return Ok(decision.kind);
    }

    let mut details = String::new();
    for &(node, kind) in &kinds {
        if kind == Tag::ERROR_RESPONSE || kind == Tag::NOTICE_RESPONSE {
            let stream = backends.get_mut(node).ok_or_else(|| Error::closed())?;
            let protocol = stream.protocol;
            let msg = peek_message(stream).await?;
            let fields = ErrorFields::parse(&msg, protocol)?;
            let _ = write!(details, "{}[{}: {}] ", node, kind, fields.message().trim_end());
        } else {
            let _ = write!(details, "{}[{}] ", node, kind);
        }
    }
    let text = format!("kind mismatch among backends. Possible last query was: \"{}\" kind details are: {}",
        ctx.last_query, details.trim_end());
    error!(%text, hint = KIND_MISMATCH_HINT, "kind mismatch");

    let msg = MessageErrorBuilder::new(ErrorSeverity::Error, error_codes::INTERNAL_ERROR, &text)
        .hint(KIND_MISMATCH_HINT)
        .finish(frontend.protocol);
    framer::encode_and_send(frontend, &msg).await?;

    // while a query is in flight only the nodes it was sent to are held responsible
    let degenerate: Vec<usize> = decision.mismatched.iter().copied()
        .filter(|&node| !ctx.in_progress || ctx.is_node_targeted(node))
        .collect();
    if settings.replication_stop_on_mismatch && !degenerate.is_empty() {
        backends.status().degenerate(&degenerate);
    }
    Err(Error::disagreement(text))
}

/// extract_ntuples returns the affected row count from a command tag.
/// UPDATE n and DELETE n carry it after the keyword, INSERT oid n after the oid. Anything else is 0.
pub fn extract_ntuples(command_tag: &str) -> i64 {
    let tag = command_tag.trim_end_matches('\0');
    let count = if tag.starts_with("UPDATE ") || tag.starts_with("DELETE ") {
        tag.get(7..)
    } else if let Some(rest) = tag.strip_prefix("INSERT ") {
        rest.split_once(' ').map(|(_, n)| n)
    } else {
        None
    };
    count.and_then(|n| n.trim().parse().ok()).unwrap_or(0)
}

/// The outcome of comparing the affected row counts of every node
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum RowCountOutcome {
    Agreed,
    /// parallel mode: the counts are added up
    Summed(i64),
    Mismatch,
}

/// reconcile_row_counts compares per-node counts, ignoring nodes that did not take part (-1)
pub fn reconcile_row_counts(ntuples: &[i64], command_tag: &str, parallel_mode: bool) -> RowCountOutcome {
    let counts: Vec<i64> = ntuples.iter().copied().filter(|&n| n >= 0).collect();
    if parallel_mode && (command_tag.starts_with("UPDATE") || command_tag.starts_with("DELETE")) {
        return RowCountOutcome::Summed(counts.iter().sum());
    }
    match counts.first() {
        Some(first) if counts.iter().any(|n| n != first) => RowCountOutcome::Mismatch,
        _ => RowCountOutcome::Agreed,
    }
}

/// ntuples_mismatch_notice builds the notice sent to the client when row counts differ
pub fn ntuples_mismatch_notice(version: ProtocolVersion, last_query: &str) -> Message {
    let text = format!("pgpool detected difference of the number of inserted, updated or deleted tuples. Possible last query was: \"{}\"", last_query);
    MessageErrorBuilder::new(ErrorSeverity::Notice, error_codes::DATA_CORRUPTED, &text)
        .hint(NTUPLES_MISMATCH_HINT)
        .finish(version)
}

/// compare_row_descriptions checks every node's RowDescription against the reference node's.
/// Structural differences are a SchemaMismatch error.
pub fn compare_row_descriptions(messages: &[(usize, Message)], reference: usize, version: ProtocolVersion) -> Result<()> {
    let reference_msg = match messages.iter().find(|(node, _)| *node == reference) {
        Some((_, msg)) => msg,
        None => return Ok(()),
    };
    let expected = RowDescription::parse(reference_msg, version)?;
    for (node, msg) in messages {
        if *node != reference {
            RowDescription::parse(msg, version)?.compare(&expected, *node)?;
        }
    }
    Ok(())
}

/// compare_lengths logs, but tolerates, messages whose length differs from the reference node's
pub fn compare_lengths(messages: &[(usize, Message)], reference: usize) {
    if let Some((_, expected)) = messages.iter().find(|(node, _)| *node == reference) {
        for (node, msg) in messages {
            if msg.len() != expected.len() {
                debug!(node, reference, tag = %msg.tag(), len = msg.len(), expected = expected.len(),
                    "message length differs from reference node");
            }
        }
    }
}

/// is_admin_shutdown returns true for the messages a backend sends when it is shut down
/// by an administrator (ERROR 57P01) or crashes (NOTICE 57P02).
pub fn is_admin_shutdown(msg: &Message, version: ProtocolVersion) -> bool {
    if version.is_legacy() {
        return false;
    }
    match ErrorFields::parse(msg, version) {
        Ok(fields) => match msg.tag() {
            Tag::ERROR_RESPONSE => fields.code() == error_codes::ADMIN_SHUTDOWN,
            Tag::NOTICE_RESPONSE => fields.code() == error_codes::CRASH_SHUTDOWN,
            _ => false,
        },
        Err(_) => false,
    }
}

/// detect_admin_shutdown checks the next message of a backend. A shutdown message is consumed
/// and true is returned, anything else is pushed back.
pub async fn detect_admin_shutdown(stream: &mut PoolStream) -> Result<bool> {
    let tag = peek_tag(stream).await?;
    if tag != Tag::ERROR_RESPONSE && tag != Tag::NOTICE_RESPONSE {
        return Ok(false);
    }
    let msg = framer::read_message(stream).await?;
    if is_admin_shutdown(&msg, stream.protocol) {
        warn!(peer = ?stream.peer, "backend is shutting down");
        return Ok(true);
    }
    stream.unread(&framer::encoded_bytes(stream.protocol, &msg))?;
    Ok(false)
}
