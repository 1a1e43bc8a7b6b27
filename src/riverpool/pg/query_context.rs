use strum::Display;

use crate::riverpool::pg::node_set::{NodeSet, MAX_BACKENDS};
use crate::riverpool::pg::sql::ParsedStatement;

/// How far one backend has progressed through a (possibly multi-step) query.
#[derive(Display, Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd)]
pub enum QueryPhase {
    NotSent,
    Parsed,
    Bound,
    Described,
    Executed,
    Errored,
}

impl Default for QueryPhase {
    fn default() -> Self {
        QueryPhase::NotSent
    }
}

/// QueryContext is the scratch state of one query execution.
#[derive(Debug, Clone)]
pub struct QueryContext {
    pub original_query: String,
    pub rewritten_query: Option<String>,
    pub parsed: ParsedStatement,
    where_to_send: NodeSet,
    phases: [QueryPhase; MAX_BACKENDS],
}

impl QueryContext {
    pub fn new(query: String, parsed: ParsedStatement, where_to_send: NodeSet) -> Self {
        Self {
            original_query: query,
            rewritten_query: None,
            parsed,
            where_to_send,
            phases: [QueryPhase::NotSent; MAX_BACKENDS],
        }
    }

    /// query returns the text that is actually sent to the backends
    pub fn query(&self) -> &str {
        self.rewritten_query.as_deref().unwrap_or(&self.original_query)
    }

    pub fn where_to_send(&self) -> NodeSet {
        self.where_to_send
    }

    pub fn set_where_to_send(&mut self, nodes: NodeSet) {
        self.where_to_send = nodes;
    }

    pub fn is_node_targeted(&self, node: usize) -> bool {
        self.where_to_send.contains(node)
    }

    /// virtual_master_node_id is the first node in the send set. It stands in for the
    /// reference node when the reference node is not a target of this query.
    pub fn virtual_master_node_id(&self) -> Option<usize> {
        self.where_to_send.first()
    }

    pub fn phase(&self, node: usize) -> QueryPhase {
        self.phases.get(node).copied().unwrap_or_default()
    }

    pub fn set_phase(&mut self, node: usize, phase: QueryPhase) {
        if let Some(p) = self.phases.get_mut(node) {
            *p = phase;
        }
    }

    /// set_phase_for_targets records phase for every node in the send set
    pub fn set_phase_for_targets(&mut self, phase: QueryPhase) {
        for node in self.where_to_send.iter() {
            self.phases[node] = phase;
        }
    }

    pub fn reset_phases(&mut self) {
        self.phases = [QueryPhase::NotSent; MAX_BACKENDS];
    }
}

/// Handle to a QueryContext stored in a QueryContextArena
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct QueryContextId(usize);

struct Slot {
    ctx: QueryContext,
    refs: usize,
}

/// QueryContextArena owns the query contexts of a session. A context stays alive while
/// sent messages reference it, the reference counts are explicit.
#[derive(Default)]
pub struct QueryContextArena {
    slots: Vec<Option<Slot>>,
    free: Vec<usize>,
}

impl QueryContextArena {
    pub fn insert(&mut self, ctx: QueryContext) -> QueryContextId {
        let slot = Some(Slot{ctx, refs: 0});
        match self.free.pop() {
            Some(i) => {
                self.slots[i] = slot;
                QueryContextId(i)
            },
            None => {
                self.slots.push(slot);
                QueryContextId(self.slots.len() - 1)
            }
        }
    }

    pub fn get(&self, id: QueryContextId) -> Option<&QueryContext> {
        self.slots.get(id.0).and_then(|s| s.as_ref()).map(|s| &s.ctx)
    }

    pub fn get_mut(&mut self, id: QueryContextId) -> Option<&mut QueryContext> {
        self.slots.get_mut(id.0).and_then(|s| s.as_mut()).map(|s| &mut s.ctx)
    }

    pub fn refs(&self, id: QueryContextId) -> usize {
        self.slots.get(id.0).and_then(|s| s.as_ref()).map_or(0, |s| s.refs)
    }

    pub fn add_ref(&mut self, id: QueryContextId) {
        if let Some(Some(slot)) = self.slots.get_mut(id.0) {
            slot.refs += 1;
        }
    }

    /// release drops one reference and returns the remaining count
    pub fn release(&mut self, id: QueryContextId) -> usize {
        match self.slots.get_mut(id.0) {
            Some(Some(slot)) => {
                slot.refs = slot.refs.saturating_sub(1);
                slot.refs
            },
            _ => 0,
        }
    }

    pub fn remove(&mut self, id: QueryContextId) -> Option<QueryContext> {
        let slot = self.slots.get_mut(id.0)?.take()?;
        self.free.push(id.0);
        Some(slot.ctx)
    }

    pub fn contains(&self, id: QueryContextId) -> bool {
        self.get(id).is_some()
    }

    /// len returns the number of live contexts
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phases() {
        let mut ctx = QueryContext::new("SELECT 1".to_string(), ParsedStatement::parse("SELECT 1"), NodeSet::all(3));
        ctx.set_phase_for_targets(QueryPhase::Parsed);
        ctx.set_phase(1, QueryPhase::Bound);
        assert_eq!(ctx.phase(0), QueryPhase::Parsed);
        assert_eq!(ctx.phase(1), QueryPhase::Bound);
        assert_eq!(ctx.phase(3), QueryPhase::NotSent);
        assert_eq!(ctx.virtual_master_node_id(), Some(0));
        ctx.reset_phases();
        assert_eq!(ctx.phase(1), QueryPhase::NotSent);
    }

    #[test]
    fn test_arena_reuses_slots() {
        let mut arena = QueryContextArena::default();
        let a = arena.insert(QueryContext::new(String::new(), ParsedStatement::Empty, NodeSet::empty()));
        arena.add_ref(a);
        assert_eq!(arena.refs(a), 1);
        assert_eq!(arena.release(a), 0);
        assert!(arena.remove(a).is_some());
        assert!(!arena.contains(a));
        let b = arena.insert(QueryContext::new(String::new(), ParsedStatement::Empty, NodeSet::empty()));
        assert_eq!(a, b);
        assert_eq!(arena.len(), 1);
    }
}
