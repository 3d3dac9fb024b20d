//! Workspace file and text search engine.
//!
//! Two query kinds run over one or more root folders: *file search* ranks
//! paths against a fuzzy pattern, *text search* finds matching lines through
//! a child grep process whose colorized output is decoded incrementally.
//!
//! ## Architecture
//!
//! The [`service::SearchService`] accepts queries and hands back a
//! cancellable progress stream (a channel of [`progress::SearchProgress`]
//! items ending in exactly one terminal). Underneath, the walker traverses
//! roots through one of four backends, the text driver feeds a streaming
//! parser, and a batching collector sits between the engines and the
//! consumer. Score-sorted file searches go through a per-workspace prefix
//! cache that survives query cancellation.
//!
//! ## Module Structure
//!
//! - `glob` - include/exclude expression compilation and matching
//! - `walk` - multi-backend file walker and directory tree
//! - `text` - child process driver and output parser
//! - `rank` - fuzzy scoring and top-K selection
//! - `cache` - prefix-result cache with narrowing reuse
//! - `progress` - wire types and batched progress delivery
//! - `service` - public API tying the engines together

pub mod cancel;
pub mod cache;
pub mod error;
pub mod glob;
pub mod process;
pub mod progress;
pub mod query;
pub mod rank;
pub mod service;
pub mod text;
pub mod walk;

pub use cancel::CancellationToken;
pub use error::{Result, SearchError};
pub use progress::{FileMatch, SearchOutcome, SearchProgress, SearchStats, TextMatch};
pub use query::{
    ContentPattern, FolderQuery, GlobExpression, GlobValue, PreviewOptions, RawFileMatch,
    SearchQuery, TextQuery,
};
pub use service::{SearchOperation, SearchService, ServiceConfig};
pub use walk::Traversal;
