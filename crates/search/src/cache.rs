//! Prefix-search result caching.
//!
//! A cache is keyed by a caller-opaque token (typically a stable workspace
//! id) and maps file patterns to rows. A row is created when a score-sorted
//! search starts, resolves exactly once with the complete walk result, and
//! is never torn down by its creator's cancellation: a later narrowing query
//! may still want it. Rows die only with `clear`.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use crate::cancel::CancellationToken;
use crate::error::{Result, SearchError};
use crate::progress::SearchStats;
use crate::query::RawFileMatch;
use crate::rank::ScoreMemo;

const ROW_WAIT_POLL: Duration = Duration::from_millis(25);

/// Complete result of one cache-backed walk.
#[derive(Debug)]
pub struct RowData {
    pub results: Vec<RawFileMatch>,
    pub stats: SearchStats,
}

enum RowState {
    Pending,
    Ready(Arc<RowData>),
    Failed(String),
}

struct RowInner {
    state: Mutex<RowState>,
    ready: Condvar,
}

/// A shareable handle to one in-flight or completed result list.
#[derive(Clone)]
pub struct CacheRow {
    inner: Arc<RowInner>,
}

impl CacheRow {
    fn new_pending() -> Self {
        Self {
            inner: Arc::new(RowInner {
                state: Mutex::new(RowState::Pending),
                ready: Condvar::new(),
            }),
        }
    }

    /// Resolves the row. The first resolution wins; later calls are no-ops.
    pub fn resolve(&self, data: RowData) {
        let Ok(mut state) = self.inner.state.lock() else {
            return;
        };
        if matches!(*state, RowState::Pending) {
            *state = RowState::Ready(Arc::new(data));
            self.inner.ready.notify_all();
        }
    }

    /// Fails the row; waiters receive the message as an internal error.
    pub fn fail(&self, message: String) {
        let Ok(mut state) = self.inner.state.lock() else {
            return;
        };
        if matches!(*state, RowState::Pending) {
            *state = RowState::Failed(message);
            self.inner.ready.notify_all();
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.inner
            .state
            .lock()
            .map(|state| !matches!(*state, RowState::Pending))
            .unwrap_or(false)
    }

    fn is_failed(&self) -> bool {
        self.inner
            .state
            .lock()
            .map(|state| matches!(*state, RowState::Failed(_)))
            .unwrap_or(true)
    }

    /// Blocks until the row resolves or `token` is cancelled. The row itself
    /// keeps running either way.
    pub fn wait(&self, token: &CancellationToken) -> Result<Arc<RowData>> {
        let mut state = self
            .inner
            .state
            .lock()
            .map_err(|_| SearchError::Internal("cache row lock poisoned".to_string()))?;
        loop {
            match &*state {
                RowState::Ready(data) => return Ok(data.clone()),
                RowState::Failed(message) => {
                    return Err(SearchError::Internal(message.clone()))
                }
                RowState::Pending => {}
            }
            if token.is_cancelled().is_none() {
                return Err(SearchError::Canceled);
            }
            let (next, _) = self
                .inner
                .ready
                .wait_timeout(state, ROW_WAIT_POLL)
                .map_err(|_| SearchError::Internal("cache row lock poisoned".to_string()))?;
            state = next;
        }
    }
}

/// One cache: rows per file pattern, plus the scorer memo shared by every
/// ranking that runs against this cache.
pub struct SearchCache {
    rows: Mutex<HashMap<String, CacheRow>>,
    scorer_memo: Mutex<ScoreMemo>,
}

impl SearchCache {
    fn new() -> Self {
        Self {
            rows: Mutex::new(HashMap::new()),
            scorer_memo: Mutex::new(ScoreMemo::new()),
        }
    }

    /// Returns the row to use for `pattern` plus whether the caller must
    /// produce it: an existing row whose pattern the new one narrows, or a
    /// freshly registered pending row.
    pub fn row_for(&self, pattern: &str) -> (CacheRow, bool) {
        let Ok(mut rows) = self.rows.lock() else {
            return (CacheRow::new_pending(), true);
        };

        // Drop rows whose producer failed so they can be retried.
        rows.retain(|_, row| !row.is_failed());

        let best = rows
            .iter()
            .filter(|(cached, _)| narrows(cached, pattern))
            .max_by_key(|(cached, _)| cached.len())
            .map(|(_, row)| row.clone());
        if let Some(row) = best {
            return (row, false);
        }

        let row = CacheRow::new_pending();
        rows.insert(pattern.to_string(), row.clone());
        (row, true)
    }

    /// Runs a ranking against this cache's scorer memo.
    pub fn with_scorer_memo<T>(&self, rank: impl FnOnce(&mut ScoreMemo) -> T) -> T {
        let mut memo = self
            .scorer_memo
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        rank(&mut memo)
    }
}

/// `pattern` narrows `cached` when it extends it and does not widen the
/// search domain: a pattern with a path separator may only reuse a cached
/// pattern that also had one.
fn narrows(cached: &str, pattern: &str) -> bool {
    pattern.starts_with(cached) && (!pattern.contains('/') || cached.contains('/'))
}

/// Process-wide table of caches.
#[derive(Default)]
pub struct CacheRegistry {
    caches: Mutex<HashMap<String, Arc<SearchCache>>>,
}

impl CacheRegistry {
    pub fn get_or_create(&self, key: &str) -> Arc<SearchCache> {
        let mut caches = self
            .caches
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        caches
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(SearchCache::new()))
            .clone()
    }

    /// Evicts a cache and every row in it.
    pub fn clear(&self, key: &str) {
        let mut caches = self
            .caches
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if caches.remove(key).is_some() {
            tracing::debug!(cache_key = key, "search cache cleared");
        }
    }
}
