use tracing::debug;

use crate::riverpool::Result;
use crate::riverpool::pg::simple_query::do_query;
use crate::riverpool::pg::stream::PoolStream;

/// RelCacheLoader knows how to fetch one kind of relation metadata from a backend.
pub trait RelCacheLoader<V>: Send + Sync {
    /// query returns the SQL that fetches the metadata for relation
    fn query(&self, relation: &str) -> String;
    /// register turns the first column of the first row (None if no rows or NULL) into a value
    fn register(&self, first_value: Option<&[u8]>) -> V;
    /// unregister is called when a value is evicted
    fn unregister(&self, _value: V) {}
}

struct RelCacheEntry<V> {
    database: String,
    relation: String,
    value: V,
    hits: u64,
}

/// RelCache is a small per-session cache of relation metadata keyed by (database, relation).
/// When full, the entry with the fewest hits is evicted.
pub struct RelCache<V: Clone> {
    max_entries: usize,
    entries: Vec<RelCacheEntry<V>>,
    loader: Box<dyn RelCacheLoader<V>>,
}

impl<V: Clone> RelCache<V> {
    pub fn new(max_entries: usize, loader: Box<dyn RelCacheLoader<V>>) -> Self {
        Self {
            max_entries: max_entries.max(1),
            entries: Vec::with_capacity(max_entries),
            loader,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// get returns a cached value without querying the backend
    pub fn get(&mut self, database: &str, relation: &str) -> Option<V> {
        let entry = self.entries.iter_mut().find(|e| e.database == database && e.relation == relation)?;
        entry.hits += 1;
        Some(entry.value.clone())
    }

    /// lookup returns the cached value, or runs the loader's query on backend and caches the result
    pub async fn lookup(&mut self, backend: &mut PoolStream, database: &str, relation: &str) -> Result<V> {
        if let Some(value) = self.get(database, relation) {
            return Ok(value);
        }
        let query = self.loader.query(relation);
        let result = do_query(backend, &query).await?;
        let value = self.loader.register(result.first_value());
        self.insert(database, relation, value.clone());
        Ok(value)
    }

    fn insert(&mut self, database: &str, relation: &str, value: V) {
        if self.entries.len() >= self.max_entries {
            let victim = self.entries.iter().enumerate()
                .min_by_key(|(_, e)| e.hits)
                .map(|(i, _)| i);
            if let Some(i) = victim {
                let evicted = self.entries.swap_remove(i);
                debug!(database = %evicted.database, relation = %evicted.relation, "evicting relcache entry");
                self.loader.unregister(evicted.value);
            }
        }
        self.entries.push(RelCacheEntry {
            database: database.to_string(),
            relation: relation.to_string(),
            value,
            hits: 1,
        });
    }

    /// clear drops every entry, e.g. when the session is reset for another client
    pub fn clear(&mut self) {
        for entry in self.entries.drain(..) {
            self.loader.unregister(entry.value);
        }
    }
}

/// TempTableLoader answers "is this relation a temporary table?"
pub struct TempTableLoader;

impl RelCacheLoader<bool> for TempTableLoader {
    fn query(&self, relation: &str) -> String {
        let name = relation.rsplit('.').next().unwrap_or(relation).replace('\'', "''");
        format!("SELECT count(*) FROM pg_class AS c, pg_namespace AS n WHERE c.relname = '{}' AND c.relnamespace = n.oid AND n.nspname ~ '^pg_temp_'", name)
    }

    fn register(&self, first_value: Option<&[u8]>) -> bool {
        first_value
            .and_then(|v| std::str::from_utf8(v).ok())
            .and_then(|v| v.trim().parse::<i64>().ok())
            .map_or(false, |n| n > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingLoader(Arc<AtomicUsize>);

    impl RelCacheLoader<u32> for CountingLoader {
        fn query(&self, relation: &str) -> String {
            format!("SELECT 1 FROM {}", relation)
        }

        fn register(&self, _first_value: Option<&[u8]>) -> u32 {
            7
        }

        fn unregister(&self, _value: u32) {
            self.0.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn test_evicts_least_hit() {
        let evictions = Arc::new(AtomicUsize::new(0));
        let mut cache = RelCache::new(2, Box::new(CountingLoader(evictions.clone())));
        cache.insert("db", "a", 1);
        cache.insert("db", "b", 2);
        assert_eq!(cache.get("db", "a"), Some(1));
        cache.insert("db", "c", 3);
        assert_eq!(evictions.load(Ordering::Relaxed), 1);
        assert_eq!(cache.get("db", "b"), None);
        assert_eq!(cache.get("db", "a"), Some(1));
        assert_eq!(cache.get("other", "a"), None);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_temp_table_loader() {
        let loader = TempTableLoader;
        assert!(loader.query("public.o'brien").contains("c.relname = 'o''brien'"));
        assert!(loader.register(Some(b"1")));
        assert!(!loader.register(Some(b"0")));
        assert!(!loader.register(None));
    }
}
