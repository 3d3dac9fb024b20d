//! File walker: traverses folder roots through one of four backends and
//! produces candidate file matches.
//!
//! Backend choice happens once per walk. An external listing tool is
//! preferred; the native walker is mandatory when per-file size checks are
//! needed, because external tools do not report sizes reliably. Roots are
//! traversed in parallel and results within one root arrive in the
//! backend's emission order; no cross-root order is guaranteed.

pub mod command;
pub mod native;
pub mod tree;

use std::ops::ControlFlow;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::cancel::CancellationToken;
use crate::error::SearchError;
use crate::glob::{CompiledExpression, GlobMatch};
use crate::progress::SearchStats;
use crate::query::{FolderQuery, RawFileMatch, SearchQuery};
use crate::rank;

pub use tree::DirectoryTree;

/// Which traversal backend a walk used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Traversal {
    #[default]
    Native,
    Ripgrep,
    MacFind,
    LinuxFind,
}

/// Walker knobs supplied by the service configuration.
#[derive(Debug, Clone)]
pub struct WalkOptions {
    /// Path of the external listing/search binary.
    pub ripgrep_path: PathBuf,
    /// Whether the external tool may be used at all.
    pub use_ripgrep: bool,
    /// Test override: always use this backend.
    pub forced_traversal: Option<Traversal>,
}

impl Default for WalkOptions {
    fn default() -> Self {
        Self {
            ripgrep_path: PathBuf::from("rg"),
            use_ripgrep: true,
            forced_traversal: None,
        }
    }
}

/// What a finished walk reports back to the service.
#[derive(Debug)]
pub struct WalkOutcome {
    pub limit_hit: bool,
    pub stats: SearchStats,
    /// Errors that aborted individual roots; other roots kept going.
    pub root_errors: Vec<(PathBuf, SearchError)>,
}

#[derive(Default)]
pub(crate) struct WalkState {
    results: AtomicUsize,
    directories: AtomicUsize,
    files: AtomicUsize,
    cmd_results: AtomicUsize,
    cmd_time_ms: AtomicU64,
    limit_hit: AtomicBool,
}

/// Traverses the folder roots of one query.
pub struct FileWalker<'q> {
    pub(crate) query: &'q SearchQuery,
    pub(crate) options: &'q WalkOptions,
    pub(crate) pattern_lower: String,
    global_excludes: CompiledExpression,
    global_includes: Option<CompiledExpression>,
    pub(crate) state: WalkState,
}

impl<'q> FileWalker<'q> {
    pub fn new(query: &'q SearchQuery, options: &'q WalkOptions) -> Self {
        let global_excludes = query
            .exclude_pattern
            .as_ref()
            .map(CompiledExpression::compile)
            .unwrap_or_default();
        let global_includes = query.include_pattern.as_ref().map(CompiledExpression::compile);
        Self {
            query,
            options,
            pattern_lower: query.file_pattern.to_ascii_lowercase(),
            global_excludes,
            global_includes,
            state: WalkState::default(),
        }
    }

    /// Runs the walk. `on_match` is called from multiple threads, one root
    /// per thread; per-root emission order follows the backend.
    pub fn walk(
        &self,
        token: &CancellationToken,
        on_match: &(dyn Fn(RawFileMatch) + Sync),
    ) -> WalkOutcome {
        let started = Instant::now();
        let traversal = self.pick_traversal();
        tracing::debug!(
            ?traversal,
            folders = self.query.folder_queries.len(),
            extra_files = self.query.extra_files.len(),
            pattern = %self.query.file_pattern,
            "starting file walk"
        );

        self.walk_extra_files(token, on_match);

        let errors: Mutex<Vec<(PathBuf, SearchError)>> = Mutex::new(Vec::new());
        rayon::scope(|scope| {
            for fq in &self.query.folder_queries {
                let errors = &errors;
                scope.spawn(move |_| {
                    if let Err(error) = self.walk_folder(fq, traversal, token, on_match) {
                        if error.is_canceled() {
                            return;
                        }
                        tracing::warn!(
                            folder = %fq.folder.display(),
                            %error,
                            "folder traversal failed"
                        );
                        if let Ok(mut errors) = errors.lock() {
                            errors.push((fq.folder.clone(), error));
                        }
                    }
                });
            }
        });

        let stats = SearchStats {
            traversal,
            file_walk_time: started.elapsed().as_millis() as u64,
            cmd_time: self.state.cmd_time_ms.load(Ordering::Relaxed),
            directories_walked: self.state.directories.load(Ordering::Relaxed),
            files_walked: self.state.files.load(Ordering::Relaxed),
            cmd_result_count: self.state.cmd_results.load(Ordering::Relaxed),
            result_count: self.state.results.load(Ordering::Relaxed),
            ..SearchStats::default()
        };
        WalkOutcome {
            limit_hit: self.state.limit_hit.load(Ordering::Relaxed),
            stats,
            root_errors: errors.into_inner().unwrap_or_default(),
        }
    }

    fn pick_traversal(&self) -> Traversal {
        if let Some(forced) = self.options.forced_traversal {
            return forced;
        }
        // Size limits require local stat calls.
        if self.query.max_filesize.is_some() {
            return Traversal::Native;
        }
        if self.options.use_ripgrep {
            return Traversal::Ripgrep;
        }
        if cfg!(target_os = "macos") {
            return Traversal::MacFind;
        }
        if cfg!(target_os = "linux") {
            return Traversal::LinuxFind;
        }
        Traversal::Native
    }

    /// Extra files bypass directory walks: they are filtered against the
    /// global excludes and matched against include + file pattern directly.
    fn walk_extra_files(
        &self,
        token: &CancellationToken,
        on_match: &(dyn Fn(RawFileMatch) + Sync),
    ) {
        for path in &self.query.extra_files {
            if token.is_cancelled().is_none() {
                return;
            }
            let basename = match path.file_name() {
                Some(name) => name.to_string_lossy().into_owned(),
                None => continue,
            };
            if self.global_excludes.matches_absolute(&path.to_string_lossy())
                || self
                    .global_excludes
                    .matches_file(&basename, &basename)
                    .is_hit()
            {
                continue;
            }
            if let Some(includes) = &self.global_includes {
                let included = !matches!(
                    includes.matches_file(&basename, &basename),
                    GlobMatch::Miss
                ) || includes.matches_absolute(&path.to_string_lossy());
                if !included {
                    continue;
                }
            }
            let base = path.parent().map(PathBuf::from).unwrap_or_default();
            let candidate = RawFileMatch::new(base, basename);
            if self.gate_and_emit(candidate, token, on_match).is_break() {
                return;
            }
        }
    }

    fn walk_folder(
        &self,
        fq: &FolderQuery,
        traversal: Traversal,
        token: &CancellationToken,
        on_match: &(dyn Fn(RawFileMatch) + Sync),
    ) -> Result<(), SearchError> {
        if !fq.folder.exists() {
            return Err(SearchError::RootNotFound(fq.folder.clone()));
        }
        let excludes =
            CompiledExpression::merged(self.query.exclude_pattern.as_ref(), fq.excludes.as_ref());
        let includes = match (&self.query.include_pattern, &fq.includes) {
            (None, None) => None,
            (global, folder) => Some(CompiledExpression::merged(
                global.as_ref(),
                folder.as_ref(),
            )),
        };

        match traversal {
            Traversal::Native => {
                native::walk_root(self, fq, &excludes, includes.as_ref(), token, on_match)
            }
            _ => command::walk_root(
                self,
                fq,
                &excludes,
                includes.as_ref(),
                traversal,
                token,
                on_match,
            ),
        }
    }

    /// Final gate for one candidate: fuzzy pattern, exists-mode, and the
    /// result cap. Returns `Break` when the walk must stop.
    pub(crate) fn gate_and_emit(
        &self,
        candidate: RawFileMatch,
        token: &CancellationToken,
        on_match: &(dyn Fn(RawFileMatch) + Sync),
    ) -> ControlFlow<()> {
        if token.is_cancelled().is_none() {
            return ControlFlow::Break(());
        }
        if !self.pattern_lower.is_empty()
            && !rank::matches_fuzzy(&self.pattern_lower, &candidate.relative_path)
        {
            return ControlFlow::Continue(());
        }
        if self.query.exists {
            self.state.limit_hit.store(true, Ordering::Relaxed);
            return ControlFlow::Break(());
        }
        let previous = self.state.results.fetch_add(1, Ordering::SeqCst);
        if let Some(max) = self.query.max_results {
            if previous >= max {
                self.state.results.fetch_sub(1, Ordering::SeqCst);
                self.state.limit_hit.store(true, Ordering::Relaxed);
                return ControlFlow::Break(());
            }
        }
        on_match(candidate);
        ControlFlow::Continue(())
    }

    pub(crate) fn note_directory(&self) {
        self.state.directories.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn note_file(&self) {
        self.state.files.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn note_cmd_result(&self) {
        self.state.cmd_results.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn note_cmd_time(&self, millis: u64) {
        self.state.cmd_time_ms.fetch_add(millis, Ordering::Relaxed);
    }
}
