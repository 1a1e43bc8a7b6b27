use bytes::Bytes;
use tracing::debug;

use crate::riverpool::pg::protocol::Tag;
use crate::riverpool::pg::query_context::QueryContextId;

/// SentMessage remembers a Parse ('P') or Bind ('B') that was forwarded to the backends,
/// so later Bind/Describe/Execute/Close messages naming it reach the same nodes.
#[derive(Debug, Clone)]
pub struct SentMessage {
    pub kind: Tag,
    /// statement name for Parse, portal name for Bind. Empty is the unnamed one.
    pub name: String,
    pub contents: Bytes,
    pub query_context: QueryContextId,
}

impl SentMessage {
    pub fn new(kind: Tag, name: String, contents: Bytes, query_context: QueryContextId) -> Self {
        Self { kind, name, contents, query_context }
    }
}

/// The list of sent messages of one session, keyed by (kind, name).
#[derive(Debug, Default)]
pub struct SentMessageList {
    messages: Vec<SentMessage>,
}

/// The result of adding a message to the list
pub enum AddOutcome {
    Added,
    /// an unnamed entry of the same kind was replaced, the old entry is returned
    Replaced(SentMessage),
    /// a named entry of the same kind and name already exists, the new message was not stored
    Kept,
}

impl SentMessageList {
    /// add stores message. An existing unnamed entry is replaced, an existing named entry is kept.
    pub fn add(&mut self, message: SentMessage) -> AddOutcome {
        match self.messages.iter().position(|m| m.kind == message.kind && m.name == message.name) {
            Some(i) => {
                debug!(kind = %message.kind, name = %message.name, "sent message already exists");
                if message.name.is_empty() {
                    let old = std::mem::replace(&mut self.messages[i], message);
                    AddOutcome::Replaced(old)
                } else {
                    AddOutcome::Kept
                }
            },
            None => {
                self.messages.push(message);
                AddOutcome::Added
            }
        }
    }

    pub fn get(&self, kind: Tag, name: &str) -> Option<&SentMessage> {
        self.messages.iter().find(|m| m.kind == kind && m.name == name)
    }

    pub fn remove(&mut self, kind: Tag, name: &str) -> Option<SentMessage> {
        let i = self.messages.iter().position(|m| m.kind == kind && m.name == name)?;
        Some(self.messages.remove(i))
    }

    /// drain removes every entry
    pub fn drain(&mut self) -> Vec<SentMessage> {
        std::mem::take(&mut self.messages)
    }

    /// references counts the entries backed by the given query context
    pub fn references(&self, id: QueryContextId) -> usize {
        self.messages.iter().filter(|m| m.query_context == id).count()
    }

    pub fn names(&self, kind: Tag) -> Vec<String> {
        self.messages.iter().filter(|m| m.kind == kind).map(|m| m.name.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}
