//! Native recursive directory traversal.
//!
//! Used when an external listing tool is unavailable or when per-file size
//! checks are required. Entries are visited in name order so emission within
//! a root is deterministic. Symbolic links are resolved through their
//! canonical path and a visited set breaks cycles.

use std::collections::HashSet;
use std::fs;
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};

use crate::cancel::CancellationToken;
use crate::error::Result;
use crate::glob::{CompiledExpression, GlobMatch};
use crate::query::{FolderQuery, RawFileMatch};
use crate::walk::FileWalker;

pub(crate) fn walk_root(
    walker: &FileWalker<'_>,
    fq: &FolderQuery,
    excludes: &CompiledExpression,
    includes: Option<&CompiledExpression>,
    token: &CancellationToken,
    on_match: &(dyn Fn(RawFileMatch) + Sync),
) -> Result<()> {
    let mut visited = HashSet::new();
    visited.insert(fs::canonicalize(&fq.folder)?);

    let mut walk = RootWalk {
        walker,
        fq,
        excludes,
        includes,
        token,
        on_match,
        visited,
        counter: 0,
    };
    let _ = walk.descend(&fq.folder, "");
    Ok(())
}

struct RootWalk<'a> {
    walker: &'a FileWalker<'a>,
    fq: &'a FolderQuery,
    excludes: &'a CompiledExpression,
    includes: Option<&'a CompiledExpression>,
    token: &'a CancellationToken,
    on_match: &'a (dyn Fn(RawFileMatch) + Sync),
    visited: HashSet<PathBuf>,
    counter: usize,
}

impl RootWalk<'_> {
    fn descend(&mut self, directory: &Path, relative_prefix: &str) -> ControlFlow<()> {
        let entries = match fs::read_dir(directory) {
            Ok(entries) => entries,
            Err(error) => {
                // Unreadable directories are transient: log and move on.
                tracing::debug!(
                    directory = %directory.display(),
                    %error,
                    "skipping unreadable directory"
                );
                return ControlFlow::Continue(());
            }
        };
        let mut entries: Vec<fs::DirEntry> = entries.filter_map(|entry| entry.ok()).collect();
        entries.sort_by_key(fs::DirEntry::file_name);

        let sibling_names: Option<HashSet<String>> =
            self.excludes.has_sibling_clauses().then(|| {
                entries
                    .iter()
                    .map(|entry| entry.file_name().to_string_lossy().into_owned())
                    .collect()
            });

        for entry in &entries {
            self.counter += 1;
            if self.token.is_cancelled_sparse(self.counter).is_none() {
                return ControlFlow::Break(());
            }

            let name = entry.file_name().to_string_lossy().into_owned();
            let relative = if relative_prefix.is_empty() {
                name.clone()
            } else {
                format!("{relative_prefix}/{name}")
            };
            let absolute = entry.path();

            let excluded = match self.excludes.matches_entry(&relative, &name) {
                GlobMatch::Hit => true,
                GlobMatch::Miss => false,
                GlobMatch::WhenSibling(sibling) => sibling_names
                    .as_ref()
                    .map(|names| names.contains(&sibling))
                    .unwrap_or(false),
            } || self.excludes.matches_absolute(&absolute.to_string_lossy());
            if excluded {
                continue;
            }

            let Ok(file_type) = entry.file_type() else {
                continue;
            };

            if file_type.is_symlink() {
                if !self.walker.query.follow_symlinks {
                    continue;
                }
                let Ok(metadata) = fs::metadata(&absolute) else {
                    // Dangling link.
                    continue;
                };
                if metadata.is_dir() {
                    let Ok(canonical) = fs::canonicalize(&absolute) else {
                        continue;
                    };
                    if !self.visited.insert(canonical) {
                        // Cycle: the canonical target was already walked.
                        continue;
                    }
                    self.walker.note_directory();
                    if self.descend(&absolute, &relative).is_break() {
                        return ControlFlow::Break(());
                    }
                } else if self
                    .handle_file(&absolute, relative, name, Some(metadata.len()))
                    .is_break()
                {
                    return ControlFlow::Break(());
                }
                continue;
            }

            if file_type.is_dir() {
                self.walker.note_directory();
                if self.descend(&absolute, &relative).is_break() {
                    return ControlFlow::Break(());
                }
            } else {
                let size = if self.walker.query.max_filesize.is_some() {
                    match entry.metadata() {
                        Ok(metadata) => Some(metadata.len()),
                        // Size gate required but unverifiable: skip.
                        Err(_) => continue,
                    }
                } else {
                    None
                };
                if self.handle_file(&absolute, relative, name, size).is_break() {
                    return ControlFlow::Break(());
                }
            }
        }
        ControlFlow::Continue(())
    }

    fn handle_file(
        &mut self,
        absolute: &Path,
        relative: String,
        basename: String,
        size: Option<u64>,
    ) -> ControlFlow<()> {
        self.walker.note_file();

        if let (Some(max), Some(size)) = (self.walker.query.max_filesize, size) {
            if size > max {
                return ControlFlow::Continue(());
            }
        }

        if let Some(includes) = self.includes {
            let included = !matches!(
                includes.matches_file(&relative, &basename),
                GlobMatch::Miss
            ) || includes.matches_absolute(&absolute.to_string_lossy());
            if !included {
                return ControlFlow::Continue(());
            }
        }

        let mut candidate = RawFileMatch::new(self.fq.folder.clone(), relative);
        candidate.basename = basename;
        candidate.size = size;
        self.walker.gate_and_emit(candidate, self.token, self.on_match)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::{glob_expression, GlobExpression, GlobValue, SearchQuery, SiblingClause};
    use crate::walk::{Traversal, WalkOptions};
    use std::sync::Mutex;
    use tempfile::TempDir;

    fn native_options() -> WalkOptions {
        WalkOptions {
            forced_traversal: Some(Traversal::Native),
            ..WalkOptions::default()
        }
    }

    fn run_walk(query: &SearchQuery) -> (Vec<String>, bool) {
        let options = native_options();
        let walker = FileWalker::new(query, &options);
        let collected: Mutex<Vec<String>> = Mutex::new(Vec::new());
        let outcome = walker.walk(&CancellationToken::noop(), &|candidate| {
            collected.lock().unwrap().push(candidate.relative_path);
        });
        let mut paths = collected.into_inner().unwrap();
        paths.sort();
        (paths, outcome.limit_hit)
    }

    fn fixture(files: &[&str]) -> TempDir {
        let dir = TempDir::new().unwrap();
        for file in files {
            let path = dir.path().join(file);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).unwrap();
            }
            std::fs::write(path, b"content").unwrap();
        }
        dir
    }

    #[test]
    fn walks_all_files() {
        let dir = fixture(&["a.txt", "sub/b.txt", "sub/deep/c.txt"]);
        let query = SearchQuery::single_folder(dir.path());
        let (paths, limit) = run_walk(&query);
        assert_eq!(paths, vec!["a.txt", "sub/b.txt", "sub/deep/c.txt"]);
        assert!(!limit);
    }

    #[test]
    fn applies_excludes_and_prunes_directories() {
        let dir = fixture(&["keep.rs", "target/debug/drop.rs", "notes/drop.log"]);
        let mut query = SearchQuery::single_folder(dir.path());
        query.exclude_pattern = Some(glob_expression(["**/target", "*.log"]));
        let (paths, _) = run_walk(&query);
        assert_eq!(paths, vec!["keep.rs"]);
    }

    #[test]
    fn include_expression_gates_files_not_directories() {
        let dir = fixture(&["src/lib.rs", "src/notes.md", "doc/guide.md"]);
        let mut query = SearchQuery::single_folder(dir.path());
        query.include_pattern = Some(glob_expression(["*.md"]));
        let (paths, _) = run_walk(&query);
        assert_eq!(paths, vec!["doc/guide.md", "src/notes.md"]);
    }

    #[test]
    fn sibling_clause_consults_the_directory() {
        let dir = fixture(&["app.js", "app.ts", "lone.js"]);
        let mut excludes = GlobExpression::new();
        excludes.insert(
            "**/*.js".to_string(),
            GlobValue::Sibling(SiblingClause {
                when: "$(basename).ts".to_string(),
            }),
        );
        let mut query = SearchQuery::single_folder(dir.path());
        query.exclude_pattern = Some(excludes);
        let (paths, _) = run_walk(&query);
        assert_eq!(paths, vec!["app.ts", "lone.js"]);
    }

    #[test]
    fn fuzzy_pattern_filters_candidates() {
        let dir = fixture(&["main.rs", "lib.rs", "readme.md"]);
        let query = SearchQuery::single_folder(dir.path()).with_file_pattern("mrs");
        let (paths, _) = run_walk(&query);
        assert_eq!(paths, vec!["main.rs"]);
    }

    #[test]
    fn max_filesize_skips_large_files() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("small.bin"), vec![0u8; 10]).unwrap();
        std::fs::write(dir.path().join("large.bin"), vec![0u8; 4096]).unwrap();
        let mut query = SearchQuery::single_folder(dir.path());
        query.max_filesize = Some(100);
        let (paths, _) = run_walk(&query);
        assert_eq!(paths, vec!["small.bin"]);
    }

    #[test]
    fn max_results_stops_early_and_sets_limit() {
        let dir = fixture(&["a.txt", "b.txt", "c.txt"]);
        let query = SearchQuery::single_folder(dir.path()).with_max_results(2);
        let (paths, limit) = run_walk(&query);
        assert_eq!(paths.len(), 2);
        assert!(limit);
    }

    #[test]
    fn exists_reports_limit_without_results() {
        let dir = fixture(&["a.txt"]);
        let mut query = SearchQuery::single_folder(dir.path());
        query.exists = true;
        let (paths, limit) = run_walk(&query);
        assert!(paths.is_empty());
        assert!(limit);
    }

    #[test]
    fn extra_files_bypass_directory_walks() {
        let dir = fixture(&["inside.txt"]);
        let loose = TempDir::new().unwrap();
        let loose_path = loose.path().join("loose.txt");
        std::fs::write(&loose_path, b"x").unwrap();

        let mut query = SearchQuery::single_folder(dir.path());
        query.extra_files = vec![loose_path];
        let (paths, _) = run_walk(&query);
        assert_eq!(paths, vec!["inside.txt", "loose.txt"]);
    }

    #[test]
    fn missing_root_is_a_root_error_not_a_panic() {
        let query = SearchQuery::single_folder("/definitely/not/here");
        let options = native_options();
        let walker = FileWalker::new(&query, &options);
        let outcome = walker.walk(&CancellationToken::noop(), &|_| {});
        assert_eq!(outcome.root_errors.len(), 1);
        assert!(matches!(
            outcome.root_errors[0].1,
            crate::error::SearchError::RootNotFound(_)
        ));
    }

    #[test]
    fn cancellation_stops_the_walk() {
        let dir = fixture(&["a.txt", "b.txt"]);
        let query = SearchQuery::single_folder(dir.path());
        let options = native_options();
        let walker = FileWalker::new(&query, &options);
        let token = CancellationToken::new();
        token.cancel();
        let collected: Mutex<Vec<String>> = Mutex::new(Vec::new());
        walker.walk(&token, &|candidate| {
            collected.lock().unwrap().push(candidate.relative_path);
        });
        assert!(collected.into_inner().unwrap().is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn symlink_cycles_are_broken() {
        let dir = fixture(&["sub/real.txt"]);
        std::os::unix::fs::symlink(dir.path(), dir.path().join("sub/loop")).unwrap();

        let query = SearchQuery::single_folder(dir.path());
        let (paths, _) = run_walk(&query);
        // The cycle link back to the root is walked at most zero times; the
        // real file appears exactly once.
        assert_eq!(paths, vec!["sub/real.txt"]);
    }

    #[cfg(unix)]
    #[test]
    fn symlinks_are_skipped_when_disabled() {
        let dir = fixture(&["real.txt"]);
        let other = fixture(&["linked.txt"]);
        std::os::unix::fs::symlink(
            other.path().join("linked.txt"),
            dir.path().join("link.txt"),
        )
        .unwrap();

        let mut query = SearchQuery::single_folder(dir.path());
        query.follow_symlinks = false;
        let (paths, _) = run_walk(&query);
        assert_eq!(paths, vec!["real.txt"]);

        query.follow_symlinks = true;
        let (paths, _) = run_walk(&query);
        assert_eq!(paths, vec!["link.txt", "real.txt"]);
    }
}
