//! Registry of live queries.
//!
//! Queries enter the registry when they are created and are indexed by
//! correlation id once the server assigns one. Jobs built with the same
//! [`QueryRegistry`] share it; a pool hands one registry to all of its jobs.
//!
//! Entries are weak: the registry never keeps a query, or the job it is
//! bound to, alive. Dropped queries disappear from every view.

use std::sync::{Arc, Weak};

use futures_util::future::join_all;
use indexmap::IndexMap;
use parking_lot::Mutex;

use crate::error::Result;
use crate::job::SqlJob;
use crate::query::{Query, QueryInner};
use crate::state::QueryState;

#[derive(Debug, Default)]
struct Entries {
    correlated: IndexMap<String, Weak<QueryInner>>,
    uncorrelated: Vec<Weak<QueryInner>>,
}

impl Entries {
    fn live(&self) -> impl Iterator<Item = Arc<QueryInner>> + '_ {
        self.correlated
            .values()
            .chain(self.uncorrelated.iter())
            .filter_map(Weak::upgrade)
    }

    fn prune(&mut self, keep: impl Fn(&QueryInner) -> bool) {
        self.correlated
            .retain(|_, q| q.upgrade().is_some_and(|q| keep(&q)));
        self.uncorrelated
            .retain(|q| q.upgrade().is_some_and(|q| keep(&q)));
    }

    fn len(&self) -> usize {
        self.correlated.len() + self.uncorrelated.len()
    }
}

/// Shared handle to a set of queries.
#[derive(Debug, Clone, Default)]
pub struct QueryRegistry {
    entries: Arc<Mutex<Entries>>,
}

impl QueryRegistry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn register(&self, query: &Arc<QueryInner>) {
        let mut entries = self.entries.lock();
        entries.uncorrelated.retain(|q| q.strong_count() > 0);
        entries.uncorrelated.push(Arc::downgrade(query));
    }

    pub(crate) fn correlate(&self, id: &str, query: &Arc<QueryInner>) {
        let mut entries = self.entries.lock();
        entries
            .uncorrelated
            .retain(|q| q.strong_count() > 0 && !std::ptr::eq(q.as_ptr(), Arc::as_ptr(query)));
        entries.correlated.insert(id.to_string(), Arc::downgrade(query));
    }

    /// Look up a query by correlation id.
    ///
    /// The returned handle decodes rows as JSON values.
    #[must_use]
    pub fn by_id(&self, id: &str) -> Option<Query> {
        if id.is_empty() {
            return None;
        }
        self.entries
            .lock()
            .correlated
            .get(id)
            .and_then(Weak::upgrade)
            .map(Query::from_inner)
    }

    /// Correlation ids of queries that have not finished, optionally
    /// restricted to one job.
    #[must_use]
    pub fn open_ids(&self, job: Option<&SqlJob>) -> Vec<String> {
        self.entries
            .lock()
            .correlated
            .iter()
            .filter_map(|(id, q)| q.upgrade().map(|q| (id, q)))
            .filter(|(_, q)| q.state().is_open())
            .filter(|(_, q)| job.is_none_or(|job| q.job().ptr_eq(job)))
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Number of live tracked queries, correlated or not.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().live().count()
    }

    /// Whether no queries are tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Close every finished or failed query concurrently, then forget the
    /// finished ones. Failed queries stay registered.
    ///
    /// All closes are awaited before the first error, if any, is returned.
    pub async fn cleanup(&self) -> Result<()> {
        let targets: Vec<Arc<QueryInner>> = self
            .entries
            .lock()
            .live()
            .filter(|q| matches!(q.state(), QueryState::RunDone | QueryState::Error))
            .collect();

        let results = join_all(targets.iter().map(|q| q.close())).await;

        {
            let mut entries = self.entries.lock();
            let before = entries.len();
            entries.prune(|q| q.state() != QueryState::RunDone);
            let pruned = before - entries.len();
            if pruned > 0 {
                tracing::debug!(pruned, "query registry cleaned up");
            }
        }

        results.into_iter().find_map(|r| r.err()).map_or(Ok(()), Err)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::config::JdbcOptions;
    use crate::query::QueryOptions;
    use serde_json::Value;

    #[test]
    fn test_empty_id_lookup() {
        let registry = QueryRegistry::new();
        assert!(registry.by_id("").is_none());
        assert!(registry.by_id("query1").is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_correlate_moves_entry() {
        let job = SqlJob::new(JdbcOptions::new());
        let query = job.query::<Value>("values 1", QueryOptions::new());
        let registry = job.registry();
        assert_eq!(registry.len(), 1);

        let inner = registry.entries.lock().uncorrelated[0].upgrade().unwrap();
        registry.correlate("query7", &inner);

        assert_eq!(registry.len(), 1);
        let found = registry.by_id("query7").unwrap();
        assert_eq!(found.sql(), query.sql());
        assert_eq!(registry.open_ids(None), vec!["query7".to_string()]);
        assert_eq!(registry.open_ids(Some(&job)), vec!["query7".to_string()]);

        let other = SqlJob::new(JdbcOptions::new());
        assert!(registry.open_ids(Some(&other)).is_empty());
    }

    #[tokio::test]
    async fn test_cleanup_prunes_finished_queries() {
        let job = SqlJob::new(JdbcOptions::new());
        let done = job.query::<Value>("values 1", QueryOptions::new());
        let _pending = job.query::<Value>("values 2", QueryOptions::new());
        done.close().await.unwrap();

        job.registry().cleanup().await.unwrap();
        assert_eq!(job.registry().len(), 1);
    }

    #[test]
    fn test_dropped_queries_are_forgotten() {
        let job = SqlJob::new(JdbcOptions::new());
        let kept = job.query::<Value>("values 1", QueryOptions::new());
        let dropped = job.query::<Value>("values 2", QueryOptions::new());
        let registry = job.registry().clone();
        assert_eq!(registry.len(), 2);

        drop(dropped);
        assert_eq!(registry.len(), 1);

        let inner = registry.entries.lock().uncorrelated[0].upgrade().unwrap();
        registry.correlate("query9", &inner);
        assert!(registry.by_id("query9").is_some());
        drop(inner);
        drop(kept);
        assert!(registry.by_id("query9").is_none());
        assert!(registry.open_ids(None).is_empty());
        assert!(registry.is_empty());
    }
}
