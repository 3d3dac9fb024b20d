//! SearchService - public API for file and text searches.
//!
//! A search runs on its own worker thread and reports through a channel of
//! [`SearchProgress`] items: zero or more match batches, then exactly one
//! terminal (`success` or `error`). Cancellation is idempotent and
//! synchronous from the caller's view; the engines observe it and wind
//! down, and the stream ends with an `error` terminal carrying the
//! cancellation.
//!
//! Folder queries are dispatched to providers by URI scheme; the on-disk
//! engines are registered for `file`. Score-sorted file searches go through
//! the prefix cache, whose rows deliberately outlive their creator's
//! cancellation so narrowing queries can reuse in-flight work.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Instant;

use crossbeam_channel::{Receiver, Sender};

use crate::cache::{CacheRegistry, RowData, SearchCache};
use crate::cancel::CancellationToken;
use crate::error::{Result, SearchError};
use crate::progress::{BatchedCollector, FileMatch, SearchProgress, SearchStats};
use crate::query::{
    FolderQuery, GlobExpression, RawFileMatch, SearchQuery, TextQuery, FILE_SCHEME,
};
use crate::rank;
use crate::text::TextSearchEngine;
use crate::walk::{FileWalker, Traversal, WalkOptions};


// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Externally supplied defaults and engine knobs.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Excludes merged into every folder query that does not override them.
    pub default_excludes: Option<GlobExpression>,
    /// Encoding assumed for folders that do not declare one.
    pub default_encoding: Option<String>,
    /// Result cap applied when a query does not set its own.
    pub default_max_results: Option<usize>,
    /// Path of the external search binary.
    pub ripgrep_path: PathBuf,
    /// Whether the external binary may be used for traversal.
    pub use_ripgrep: bool,
    /// Test override: force one traversal backend.
    pub forced_traversal: Option<Traversal>,
    /// Progress batch size when the query does not request one.
    pub default_batch_size: usize,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            default_excludes: None,
            default_encoding: None,
            default_max_results: None,
            ripgrep_path: PathBuf::from("rg"),
            use_ripgrep: true,
            forced_traversal: None,
            default_batch_size: 512,
        }
    }
}

impl ServiceConfig {
    pub fn with_default_excludes(mut self, excludes: GlobExpression) -> Self {
        self.default_excludes = Some(excludes);
        self
    }

    pub fn with_default_encoding(mut self, encoding: impl Into<String>) -> Self {
        self.default_encoding = Some(encoding.into());
        self
    }

    pub fn with_ripgrep_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.ripgrep_path = path.into();
        self
    }

    pub fn with_ripgrep(mut self, enabled: bool) -> Self {
        self.use_ripgrep = enabled;
        self
    }

    pub fn with_traversal(mut self, traversal: Traversal) -> Self {
        self.forced_traversal = Some(traversal);
        self
    }

    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.default_batch_size = size.max(1);
        self
    }

    fn walk_options(&self) -> WalkOptions {
        WalkOptions {
            ripgrep_path: self.ripgrep_path.clone(),
            use_ripgrep: self.use_ripgrep,
            forced_traversal: self.forced_traversal,
        }
    }
}

// ---------------------------------------------------------------------------
// Providers
// ---------------------------------------------------------------------------

/// What an engine reports when its part of a search finishes.
pub struct EngineOutcome {
    pub limit_hit: bool,
    pub stats: SearchStats,
    /// Errors that aborted individual roots; the rest of the search kept
    /// going.
    pub root_errors: Vec<(PathBuf, SearchError)>,
}

/// One backend capable of searching the roots of a given URI scheme.
pub trait SearchProvider: Send + Sync {
    fn file_search(
        &self,
        query: &SearchQuery,
        token: &CancellationToken,
        on_match: &(dyn Fn(RawFileMatch) + Sync),
    ) -> Result<EngineOutcome>;

    fn text_search(
        &self,
        query: &TextQuery,
        token: &CancellationToken,
        on_file: &mut dyn FnMut(FileMatch),
    ) -> Result<EngineOutcome>;
}

/// The built-in on-disk engines.
struct LocalProvider {
    walk_options: WalkOptions,
}

impl SearchProvider for LocalProvider {
    fn file_search(
        &self,
        query: &SearchQuery,
        token: &CancellationToken,
        on_match: &(dyn Fn(RawFileMatch) + Sync),
    ) -> Result<EngineOutcome> {
        let walker = FileWalker::new(query, &self.walk_options);
        let outcome = walker.walk(token, on_match);
        Ok(EngineOutcome {
            limit_hit: outcome.limit_hit,
            stats: outcome.stats,
            root_errors: outcome.root_errors,
        })
    }

    fn text_search(
        &self,
        query: &TextQuery,
        token: &CancellationToken,
        on_file: &mut dyn FnMut(FileMatch),
    ) -> Result<EngineOutcome> {
        let engine = TextSearchEngine::new(query, &self.walk_options.ripgrep_path);
        let (limit_hit, stats) = engine.search(token, on_file)?;
        Ok(EngineOutcome {
            limit_hit,
            stats,
            root_errors: Vec::new(),
        })
    }
}

// ---------------------------------------------------------------------------
// Search operations
// ---------------------------------------------------------------------------

/// A running search: its progress stream plus a cancellation handle.
pub struct SearchOperation {
    progress: Receiver<SearchProgress>,
    token: CancellationToken,
}

impl SearchOperation {
    /// The progress stream. Ends with exactly one terminal item.
    pub fn progress(&self) -> Receiver<SearchProgress> {
        self.progress.clone()
    }

    /// Requests cancellation. Idempotent; the stream still terminates, with
    /// a cancellation error.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Drains the stream until its terminal item.
    pub fn collect(self) -> Vec<SearchProgress> {
        let mut items = Vec::new();
        for item in self.progress.iter() {
            let terminal = item.is_terminal();
            items.push(item);
            if terminal {
                break;
            }
        }
        items
    }
}

// ---------------------------------------------------------------------------
// Service
// ---------------------------------------------------------------------------

/// Entry point for all searches. Cheap to clone; clones share providers,
/// caches, and configuration.
#[derive(Clone)]
pub struct SearchService {
    inner: Arc<ServiceInner>,
}

struct ServiceInner {
    config: ServiceConfig,
    caches: CacheRegistry,
    providers: Mutex<HashMap<String, Arc<dyn SearchProvider>>>,
}

impl SearchService {
    pub fn new(config: ServiceConfig) -> Self {
        let local: Arc<dyn SearchProvider> = Arc::new(LocalProvider {
            walk_options: config.walk_options(),
        });
        let mut providers: HashMap<String, Arc<dyn SearchProvider>> = HashMap::new();
        providers.insert(FILE_SCHEME.to_string(), local);
        Self {
            inner: Arc::new(ServiceInner {
                config,
                caches: CacheRegistry::default(),
                providers: Mutex::new(providers),
            }),
        }
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.inner.config
    }

    /// Registers an external provider for a URI scheme.
    pub fn register_provider(&self, scheme: impl Into<String>, provider: Arc<dyn SearchProvider>) {
        if let Ok(mut providers) = self.inner.providers.lock() {
            providers.insert(scheme.into(), provider);
        }
    }

    /// Fills query defaults from the service configuration. Idempotent.
    pub fn extend_query(&self, query: &mut SearchQuery) {
        let config = &self.inner.config;
        if let Some(defaults) = &config.default_excludes {
            for fq in &mut query.folder_queries {
                let excludes = fq.excludes.get_or_insert_with(GlobExpression::new);
                for (glob, value) in defaults {
                    excludes.entry(glob.clone()).or_insert_with(|| value.clone());
                }
            }
        }
        if let Some(encoding) = &config.default_encoding {
            for fq in &mut query.folder_queries {
                fq.file_encoding.get_or_insert_with(|| encoding.clone());
            }
        }
        if query.max_results.is_none() {
            query.max_results = config.default_max_results;
        }
    }

    /// Starts a file search and returns its progress stream.
    pub fn file_search(&self, mut query: SearchQuery) -> SearchOperation {
        self.extend_query(&mut query);
        let token = CancellationToken::new();
        let (tx, rx) = crossbeam_channel::unbounded();
        let inner = self.inner.clone();
        let worker_token = token.clone();
        thread::spawn(move || {
            let started = Instant::now();
            let result = run_file_search(&inner, &query, &worker_token, &tx);
            send_terminal(&tx, result, started, "file");
        });
        SearchOperation {
            progress: rx,
            token,
        }
    }

    /// Starts a text search and returns its progress stream.
    pub fn text_search(&self, mut query: TextQuery) -> SearchOperation {
        self.extend_query(&mut query.search);
        let token = CancellationToken::new();
        let (tx, rx) = crossbeam_channel::unbounded();
        let inner = self.inner.clone();
        let worker_token = token.clone();
        thread::spawn(move || {
            let started = Instant::now();
            let result = run_text_search(&inner, &query, &worker_token, &tx);
            send_terminal(&tx, result, started, "text");
        });
        SearchOperation {
            progress: rx,
            token,
        }
    }

    /// Evicts a result cache. Acknowledged by returning.
    pub fn clear_cache(&self, key: &str) {
        self.inner.caches.clear(key);
    }
}

// ---------------------------------------------------------------------------
// Worker plumbing
// ---------------------------------------------------------------------------

fn send_terminal(
    tx: &Sender<SearchProgress>,
    result: Result<(bool, SearchStats)>,
    started: Instant,
    kind: &str,
) {
    let terminal = match result {
        Ok((limit_hit, stats)) => {
            tracing::info!(
                kind,
                results = stats.result_count,
                limit_hit,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "search complete"
            );
            SearchProgress::success(limit_hit, stats)
        }
        Err(error) => {
            if !error.is_canceled() {
                tracing::warn!(kind, %error, "search failed");
            }
            SearchProgress::error(&error)
        }
    };
    let _ = tx.send(terminal);
}

fn make_collector(
    inner: &ServiceInner,
    batch_size: Option<usize>,
    tx: &Sender<SearchProgress>,
    token: &CancellationToken,
) -> BatchedCollector {
    match batch_size {
        Some(size) => BatchedCollector::strict(size.max(1), tx.clone(), token.clone()),
        None => BatchedCollector::new(inner.config.default_batch_size, tx.clone(), token.clone()),
    }
}

fn provider_for(inner: &ServiceInner, scheme: &str) -> Result<Arc<dyn SearchProvider>> {
    inner
        .providers
        .lock()
        .ok()
        .and_then(|providers| providers.get(scheme).cloned())
        .ok_or_else(|| SearchError::UnknownScheme(scheme.to_string()))
}

/// Splits a query into per-scheme sub-queries, preserving folder order.
/// Extra files carry no scheme and ride with the `file` partition.
fn partition_by_scheme(query: &SearchQuery) -> Vec<(String, SearchQuery)> {
    let mut order: Vec<String> = Vec::new();
    let mut folders: HashMap<String, Vec<FolderQuery>> = HashMap::new();
    for fq in &query.folder_queries {
        let scheme = fq.scheme().to_string();
        if !folders.contains_key(&scheme) {
            order.push(scheme.clone());
        }
        folders.entry(scheme).or_default().push(fq.clone());
    }
    if !query.extra_files.is_empty() && !folders.contains_key(FILE_SCHEME) {
        order.push(FILE_SCHEME.to_string());
        folders.insert(FILE_SCHEME.to_string(), Vec::new());
    }

    order
        .into_iter()
        .map(|scheme| {
            let mut sub = query.clone();
            sub.folder_queries = folders.remove(&scheme).unwrap_or_default();
            sub.extra_files = if scheme == FILE_SCHEME {
                query.extra_files.clone()
            } else {
                Vec::new()
            };
            (scheme, sub)
        })
        .collect()
}

fn absorb_stats(stats: &mut SearchStats, other: SearchStats) {
    stats.traversal = other.traversal;
    stats.file_walk_time = stats.file_walk_time.max(other.file_walk_time);
    stats.cmd_time += other.cmd_time;
    stats.directories_walked += other.directories_walked;
    stats.files_walked += other.files_walked;
    stats.cmd_result_count += other.cmd_result_count;
    stats.sorting_time = match (stats.sorting_time, other.sorting_time) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (a, b) => a.or(b),
    };
    stats.from_cache = match (stats.from_cache, other.from_cache) {
        (Some(a), Some(b)) => Some(a || b),
        (a, b) => a.or(b),
    };
}

// ---------------------------------------------------------------------------
// File search
// ---------------------------------------------------------------------------

fn run_file_search(
    inner: &Arc<ServiceInner>,
    query: &SearchQuery,
    token: &CancellationToken,
    tx: &Sender<SearchProgress>,
) -> Result<(bool, SearchStats)> {
    let collector = make_collector(inner, query.batch_size, tx, token);
    let emitted = AtomicUsize::new(0);
    let mut limit_hit = false;
    let mut stats = SearchStats::default();
    let mut first_error: Option<SearchError> = None;

    for (scheme, sub_query) in partition_by_scheme(query) {
        token.is_cancelled().ok_or(SearchError::Canceled)?;
        let provider = match provider_for(inner, &scheme) {
            Ok(provider) => provider,
            Err(error) => {
                first_error.get_or_insert(error);
                continue;
            }
        };
        let partition = if query.sort_by_score {
            run_sorted_partition(inner, provider, &sub_query, token, &collector, &emitted)
        } else {
            run_streaming_partition(provider, &sub_query, token, &collector, &emitted)
        };
        match partition {
            Ok((partition_limit, partition_stats, partition_error)) => {
                limit_hit |= partition_limit;
                absorb_stats(&mut stats, partition_stats);
                if let Some(error) = partition_error {
                    first_error.get_or_insert(error);
                }
            }
            Err(error) if error.is_canceled() => return Err(error),
            Err(error) => {
                first_error.get_or_insert(error);
            }
        }
    }

    collector.finish();
    token.is_cancelled().ok_or(SearchError::Canceled)?;

    let total = emitted.load(Ordering::Relaxed);
    if total == 0 {
        if let Some(error) = first_error {
            return Err(error);
        }
    }
    stats.result_count = total;
    Ok((limit_hit, stats))
}

fn run_streaming_partition(
    provider: Arc<dyn SearchProvider>,
    query: &SearchQuery,
    token: &CancellationToken,
    collector: &BatchedCollector,
    emitted: &AtomicUsize,
) -> Result<(bool, SearchStats, Option<SearchError>)> {
    let outcome = provider.file_search(query, token, &|raw| {
        emitted.fetch_add(1, Ordering::Relaxed);
        collector.add(
            FileMatch::file(raw.absolute_path().to_string_lossy().into_owned()),
            1,
        );
    })?;
    let first_root_error = outcome.root_errors.into_iter().next().map(|(_, error)| error);
    Ok((outcome.limit_hit, outcome.stats, first_root_error))
}

fn run_sorted_partition(
    inner: &Arc<ServiceInner>,
    provider: Arc<dyn SearchProvider>,
    query: &SearchQuery,
    token: &CancellationToken,
    collector: &BatchedCollector,
    emitted: &AtomicUsize,
) -> Result<(bool, SearchStats, Option<SearchError>)> {
    // The collection walk runs unbounded; the limit is applied after
    // ranking so the cap keeps the best results, not the first found.
    let mut unbounded = query.clone();
    unbounded.max_results = None;
    unbounded.exists = false;

    let (data, from_cache, cache): (Arc<RowData>, bool, Option<Arc<SearchCache>>) =
        match &query.cache_key {
            Some(key) => {
                let cache = inner.caches.get_or_create(key);
                let (row, fresh) = cache.row_for(&query.file_pattern);
                if fresh {
                    let producer_row = row.clone();
                    let producer_query = unbounded.clone();
                    let producer = provider.clone();
                    thread::spawn(move || produce_row(producer, producer_query, producer_row));
                }
                (row.wait(token)?, !fresh, Some(cache))
            }
            None => {
                let collected: Mutex<Vec<RawFileMatch>> = Mutex::new(Vec::new());
                let outcome = provider.file_search(&unbounded, token, &|raw| {
                    if let Ok(mut collected) = collected.lock() {
                        collected.push(raw);
                    }
                })?;
                let results = collected.into_inner().unwrap_or_default();
                if results.is_empty() {
                    if let Some((_, error)) = outcome.root_errors.into_iter().next() {
                        return Err(error);
                    }
                }
                (
                    Arc::new(RowData {
                        results,
                        stats: outcome.stats,
                    }),
                    false,
                    None,
                )
            }
        };
    token.is_cancelled().ok_or(SearchError::Canceled)?;

    let sort_started = Instant::now();
    let limit = query.max_results.unwrap_or(usize::MAX);
    let (top, matched) = match &cache {
        Some(cache) => cache.with_scorer_memo(|memo| {
            rank::top_scored(&data.results, &query.file_pattern, limit, memo)
        }),
        None => {
            let mut memo = rank::ScoreMemo::new();
            rank::top_scored(&data.results, &query.file_pattern, limit, &mut memo)
        }
    };
    let sorting_time = sort_started.elapsed().as_millis() as u64;

    let mut stats = data.stats.clone();
    stats.sorting_time = Some(sorting_time);
    stats.from_cache = Some(from_cache);

    if query.exists {
        return Ok((matched > 0, stats, None));
    }

    let limit_hit = query
        .max_results
        .map_or(false, |max_results| matched > max_results);
    if !top.is_empty() {
        let size = top.len();
        emitted.fetch_add(size, Ordering::Relaxed);
        let items: Vec<FileMatch> = top
            .iter()
            .map(|raw| FileMatch::file(raw.absolute_path().to_string_lossy().into_owned()))
            .collect();
        collector.add_many(items, size);
    }
    Ok((limit_hit, stats, None))
}

/// Produces a cache row on its own thread, under the row's own token: the
/// row must outlive any one consumer's cancellation.
fn produce_row(provider: Arc<dyn SearchProvider>, query: SearchQuery, row: crate::cache::CacheRow) {
    let collected: Mutex<Vec<RawFileMatch>> = Mutex::new(Vec::new());
    match provider.file_search(&query, &CancellationToken::noop(), &|raw| {
        if let Ok(mut collected) = collected.lock() {
            collected.push(raw);
        }
    }) {
        Ok(outcome) => {
            let results = collected.into_inner().unwrap_or_default();
            if results.is_empty() {
                if let Some((_, error)) = outcome.root_errors.into_iter().next() {
                    row.fail(error.to_string());
                    return;
                }
            }
            row.resolve(RowData {
                results,
                stats: outcome.stats,
            });
        }
        Err(error) => row.fail(error.to_string()),
    }
}

// ---------------------------------------------------------------------------
// Text search
// ---------------------------------------------------------------------------

fn run_text_search(
    inner: &Arc<ServiceInner>,
    query: &TextQuery,
    token: &CancellationToken,
    tx: &Sender<SearchProgress>,
) -> Result<(bool, SearchStats)> {
    let collector = make_collector(inner, query.search.batch_size, tx, token);
    let mut limit_hit = false;
    let mut stats = SearchStats::default();
    let mut first_error: Option<SearchError> = None;
    let mut total = 0usize;

    for (scheme, sub_query) in partition_text_query(query) {
        token.is_cancelled().ok_or(SearchError::Canceled)?;
        let provider = match provider_for(inner, &scheme) {
            Ok(provider) => provider,
            Err(error) => {
                first_error.get_or_insert(error);
                continue;
            }
        };
        let mut on_file = |file: FileMatch| {
            let size = file.result_size();
            total += size;
            collector.add(file, size);
        };
        match provider.text_search(&sub_query, token, &mut on_file) {
            Ok(outcome) => {
                limit_hit |= outcome.limit_hit;
                absorb_stats(&mut stats, outcome.stats);
                if let Some((_, error)) = outcome.root_errors.into_iter().next() {
                    first_error.get_or_insert(error);
                }
            }
            Err(error) if error.is_canceled() => return Err(error),
            Err(error) => {
                first_error.get_or_insert(error);
            }
        }
    }

    collector.finish();
    token.is_cancelled().ok_or(SearchError::Canceled)?;

    if total == 0 {
        if let Some(error) = first_error {
            return Err(error);
        }
    }
    stats.result_count = total;
    Ok((limit_hit, stats))
}

fn partition_text_query(query: &TextQuery) -> Vec<(String, TextQuery)> {
    partition_by_scheme(&query.search)
        .into_iter()
        .map(|(scheme, search)| {
            (
                scheme,
                TextQuery {
                    search,
                    pattern: query.pattern.clone(),
                    previews: query.previews,
                },
            )
        })
        .collect()
}
