//! Progress stream items and time/size-bounded batching.
//!
//! Everything emitted on a search's progress stream is serde-serializable
//! with camelCase fields so it can cross an IPC boundary unchanged. A stream
//! carries zero or more match batches and informational messages followed by
//! exactly one terminal item.

use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{select, tick, Receiver, Sender};
use serde::{Deserialize, Serialize};

use crate::cancel::CancellationToken;
use crate::error::SearchError;
use crate::walk::Traversal;

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

/// A 0-based range confined to one line. Columns are byte offsets into the
/// UTF-8 text they refer to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OneLineRange {
    pub start_line: usize,
    pub start_col: usize,
    pub end_line: usize,
    pub end_col: usize,
}

impl OneLineRange {
    pub fn new(line: usize, start_col: usize, end_col: usize) -> Self {
        Self {
            start_line: line,
            start_col,
            end_line: line,
            end_col,
        }
    }
}

/// Single-line rendering of a match context, markers stripped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchPreview {
    pub text: String,
    /// Match ranges within `text`.
    pub matches: Vec<OneLineRange>,
}

/// One text match: where it sits in the document and how to preview it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TextMatch {
    pub preview: MatchPreview,
    /// Document range of the match.
    pub range: OneLineRange,
}

/// A matched file, with per-line text matches for text searches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileMatch {
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub matches: Option<Vec<TextMatch>>,
}

impl FileMatch {
    pub fn file(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            matches: None,
        }
    }

    pub fn with_matches(path: impl Into<String>, matches: Vec<TextMatch>) -> Self {
        Self {
            path: path.into(),
            matches: Some(matches),
        }
    }

    /// Number of results this file contributes to limits and batching.
    pub fn result_size(&self) -> usize {
        match &self.matches {
            Some(matches) => matches.len().max(1),
            None => 1,
        }
    }
}

/// Informational progress.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worked: Option<u64>,
}

/// Engine statistics reported with the success terminal.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchStats {
    pub traversal: Traversal,
    /// Wall-clock of the whole walk, milliseconds.
    pub file_walk_time: u64,
    /// Time spent inside external commands, milliseconds.
    pub cmd_time: u64,
    pub directories_walked: usize,
    pub files_walked: usize,
    /// Candidates the external command reported before local filtering.
    pub cmd_result_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sorting_time: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_cache: Option<bool>,
    pub result_count: usize,
}

/// Error payload of the error terminal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPayload {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

impl From<&SearchError> for ErrorPayload {
    fn from(error: &SearchError) -> Self {
        Self {
            message: error.to_string(),
            stack: None,
        }
    }
}

/// Terminal item of a progress stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SearchOutcome {
    #[serde(rename_all = "camelCase")]
    Success { limit_hit: bool, stats: SearchStats },
    Error { error: ErrorPayload },
}

/// An item on the progress stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum SearchProgress {
    Matches(Vec<FileMatch>),
    Message(ProgressMessage),
    Outcome(SearchOutcome),
}

impl SearchProgress {
    pub fn success(limit_hit: bool, stats: SearchStats) -> Self {
        SearchProgress::Outcome(SearchOutcome::Success { limit_hit, stats })
    }

    pub fn error(error: &SearchError) -> Self {
        SearchProgress::Outcome(SearchOutcome::Error {
            error: ErrorPayload::from(error),
        })
    }

    /// True for either terminal variant.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SearchProgress::Outcome(_))
    }
}

// ---------------------------------------------------------------------------
// Batched collector
// ---------------------------------------------------------------------------

/// How many results flush immediately before batching kicks in, so first
/// results reach the consumer fast.
pub const START_BATCHING_AFTER: usize = 50;

/// Idle flush delay for a partially filled batch.
pub const BATCH_FLUSH_DELAY: Duration = Duration::from_secs(4);

const FLUSH_POLL: Duration = Duration::from_millis(500);

enum CollectorMessage {
    One(FileMatch, usize),
    Many(Vec<FileMatch>, usize),
    Flush,
}

/// Batches file matches by size and time before they reach the consumer.
///
/// Runs on its own thread; `add`/`add_many` never block the engine. Batches
/// are suppressed once the token is cancelled.
pub struct BatchedCollector {
    tx: Option<Sender<CollectorMessage>>,
    handle: Option<JoinHandle<()>>,
}

impl BatchedCollector {
    /// Collector with the warm-up threshold: the first
    /// [`START_BATCHING_AFTER`] results flush immediately.
    pub fn new(
        max_batch_size: usize,
        out: Sender<SearchProgress>,
        token: CancellationToken,
    ) -> Self {
        Self::with_threshold(max_batch_size, START_BATCHING_AFTER, out, token)
    }

    /// Collector that batches strictly from the first result. Used when the
    /// caller asked for an explicit batch size.
    pub fn strict(
        max_batch_size: usize,
        out: Sender<SearchProgress>,
        token: CancellationToken,
    ) -> Self {
        Self::with_threshold(max_batch_size, 0, out, token)
    }

    fn with_threshold(
        max_batch_size: usize,
        start_batching_after: usize,
        out: Sender<SearchProgress>,
        token: CancellationToken,
    ) -> Self {
        let (tx, rx) = crossbeam_channel::unbounded();
        let handle = thread::spawn(move || {
            run_collector(max_batch_size, start_batching_after, rx, out, token)
        });
        Self {
            tx: Some(tx),
            handle: Some(handle),
        }
    }

    pub fn add(&self, item: FileMatch, size: usize) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(CollectorMessage::One(item, size));
        }
    }

    pub fn add_many(&self, items: Vec<FileMatch>, size: usize) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(CollectorMessage::Many(items, size));
        }
    }

    pub fn flush(&self) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(CollectorMessage::Flush);
        }
    }

    /// Flushes the final batch and joins the collector thread.
    pub fn finish(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        // Dropping the sender disconnects the channel; the thread flushes
        // and exits.
        self.tx.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for BatchedCollector {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_collector(
    max_batch_size: usize,
    start_batching_after: usize,
    rx: Receiver<CollectorMessage>,
    out: Sender<SearchProgress>,
    token: CancellationToken,
) {
    let ticker = tick(FLUSH_POLL);
    let mut batch: Vec<FileMatch> = Vec::new();
    let mut batch_size = 0usize;
    let mut total_completed = 0usize;
    let mut oldest_pending: Option<Instant> = None;

    let flush = |batch: &mut Vec<FileMatch>,
                     batch_size: &mut usize,
                     total_completed: &mut usize,
                     oldest_pending: &mut Option<Instant>| {
        if batch.is_empty() {
            return;
        }
        *total_completed += *batch_size;
        *batch_size = 0;
        *oldest_pending = None;
        let items = std::mem::take(batch);
        if token.is_cancelled().is_some() {
            let _ = out.send(SearchProgress::Matches(items));
        }
    };

    loop {
        select! {
            recv(rx) -> message => match message {
                Ok(CollectorMessage::One(item, size)) => {
                    batch.push(item);
                    batch_size += size;
                    if oldest_pending.is_none() {
                        oldest_pending = Some(Instant::now());
                    }
                    if total_completed < start_batching_after || batch_size >= max_batch_size {
                        flush(&mut batch, &mut batch_size, &mut total_completed, &mut oldest_pending);
                    }
                }
                Ok(CollectorMessage::Many(items, size)) => {
                    batch.extend(items);
                    batch_size += size;
                    if oldest_pending.is_none() {
                        oldest_pending = Some(Instant::now());
                    }
                    if total_completed < start_batching_after || batch_size >= max_batch_size {
                        flush(&mut batch, &mut batch_size, &mut total_completed, &mut oldest_pending);
                    }
                }
                Ok(CollectorMessage::Flush) => {
                    flush(&mut batch, &mut batch_size, &mut total_completed, &mut oldest_pending);
                }
                Err(_) => {
                    flush(&mut batch, &mut batch_size, &mut total_completed, &mut oldest_pending);
                    break;
                }
            },
            recv(ticker) -> _ => {
                let stale = oldest_pending
                    .map(|at| at.elapsed() >= BATCH_FLUSH_DELAY)
                    .unwrap_or(false);
                if stale {
                    flush(&mut batch, &mut batch_size, &mut total_completed, &mut oldest_pending);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain_batches(rx: &Receiver<SearchProgress>) -> Vec<Vec<FileMatch>> {
        let mut batches = Vec::new();
        while let Ok(item) = rx.try_recv() {
            if let SearchProgress::Matches(items) = item {
                batches.push(items);
            }
        }
        batches
    }

    #[test]
    fn warm_up_flushes_each_result() {
        let (out_tx, out_rx) = crossbeam_channel::unbounded();
        let collector = BatchedCollector::new(10, out_tx, CancellationToken::noop());
        for i in 0..5 {
            collector.add(FileMatch::file(format!("/fx/{i}")), 1);
        }
        collector.finish();

        let batches = drain_batches(&out_rx);
        assert_eq!(batches.len(), 5);
        assert!(batches.iter().all(|batch| batch.len() == 1));
    }

    #[test]
    fn strict_collector_batches_from_the_start() {
        let (out_tx, out_rx) = crossbeam_channel::unbounded();
        let collector = BatchedCollector::strict(10, out_tx, CancellationToken::noop());
        for i in 0..25 {
            collector.add(FileMatch::file(format!("/fx/{i}")), 1);
        }
        collector.finish();

        let sizes: Vec<usize> = drain_batches(&out_rx)
            .iter()
            .map(|batch| batch.len())
            .collect();
        assert_eq!(sizes, vec![10, 10, 5]);
    }

    #[test]
    fn cancelled_collector_emits_nothing() {
        let (out_tx, out_rx) = crossbeam_channel::unbounded();
        let token = CancellationToken::new();
        token.cancel();
        let collector = BatchedCollector::strict(2, out_tx, token);
        collector.add(FileMatch::file("/fx/a"), 1);
        collector.add(FileMatch::file("/fx/b"), 1);
        collector.finish();
        assert!(drain_batches(&out_rx).is_empty());
    }

    #[test]
    fn match_item_wire_shape() {
        let item = SearchProgress::Matches(vec![FileMatch::with_matches(
            "/fx/a.txt",
            vec![TextMatch {
                preview: MatchPreview {
                    text: "hello world".to_string(),
                    matches: vec![OneLineRange::new(0, 6, 11)],
                },
                range: OneLineRange::new(3, 6, 11),
            }],
        )]);
        let json = serde_json::to_value(&item).unwrap();
        assert_eq!(json[0]["path"], "/fx/a.txt");
        assert_eq!(json[0]["matches"][0]["preview"]["text"], "hello world");
        assert_eq!(json[0]["matches"][0]["range"]["startLine"], 3);
        assert_eq!(json[0]["matches"][0]["preview"]["matches"][0]["endCol"], 11);
    }

    #[test]
    fn terminal_wire_shapes() {
        let success = SearchProgress::success(true, SearchStats::default());
        let json = serde_json::to_value(&success).unwrap();
        assert_eq!(json["type"], "success");
        assert_eq!(json["limitHit"], true);
        assert_eq!(json["stats"]["traversal"], "native");

        let error = SearchProgress::error(&SearchError::Canceled);
        let json = serde_json::to_value(&error).unwrap();
        assert_eq!(json["type"], "error");
        assert_eq!(json["error"]["message"], "search was canceled");
    }

    #[test]
    fn range_roundtrips_through_serialization() {
        let range = OneLineRange::new(7, 2, 9);
        let json = serde_json::to_string(&range).unwrap();
        let back: OneLineRange = serde_json::from_str(&json).unwrap();
        assert_eq!(range, back);
    }
}
