//! Command-backed file listing: the external search tool's `--files` mode,
//! or POSIX `find` when the tool is disabled.
//!
//! Plain excludes ride along as command arguments. Sibling-dependent
//! excludes cannot, so when any are present the streamed listing is
//! collected into a [`DirectoryTree`] and replayed with sibling
//! information; otherwise every line is forwarded as it arrives.

use std::io::{BufRead, BufReader};
use std::process::Command;
use std::time::Instant;

use crate::cancel::CancellationToken;
use crate::error::{Result, SearchError};
use crate::glob::{CompiledExpression, GlobMatch};
use crate::process::{ChildGuard, StderrCapture};
use crate::query::{leafname, FolderQuery, RawFileMatch};
use crate::text::driver::{normalize_glob_path, rationalize_command_error};
use crate::walk::{DirectoryTree, FileWalker, Traversal};

pub(crate) fn walk_root(
    walker: &FileWalker<'_>,
    fq: &FolderQuery,
    excludes: &CompiledExpression,
    includes: Option<&CompiledExpression>,
    traversal: Traversal,
    token: &CancellationToken,
    on_match: &(dyn Fn(RawFileMatch) + Sync),
) -> Result<()> {
    let started = Instant::now();
    let (command, program) = match traversal {
        Traversal::Ripgrep => (
            ripgrep_list_command(walker, fq, excludes),
            walker.options.ripgrep_path.to_string_lossy().into_owned(),
        ),
        Traversal::MacFind => (
            find_command(fq, excludes, true, walker.query.follow_symlinks),
            "find".to_string(),
        ),
        Traversal::LinuxFind => (
            find_command(fq, excludes, false, walker.query.follow_symlinks),
            "find".to_string(),
        ),
        Traversal::Native => {
            return Err(SearchError::Internal(
                "native traversal has no command backend".to_string(),
            ))
        }
    };

    let guard = ChildGuard::spawn(command, &program, token.clone())?;
    let stderr = StderrCapture::start(guard.take_stderr());
    let stdout = guard
        .take_stdout()
        .ok_or_else(|| SearchError::Internal("child stdout was not piped".to_string()))?;
    let mut reader = BufReader::new(stdout);

    let needs_tree = excludes.has_sibling_clauses();
    let mut tree = DirectoryTree::new();
    let mut stopped = false;
    let mut saw_lines = false;
    let mut counter = 0usize;
    let mut line = String::new();

    loop {
        counter += 1;
        if token.is_cancelled_sparse(counter).is_none() {
            guard.kill();
            stderr.join();
            walker.note_cmd_time(started.elapsed().as_millis() as u64);
            return Err(SearchError::Canceled);
        }
        line.clear();
        let read = match reader.read_line(&mut line) {
            Ok(read) => read,
            Err(error) => {
                guard.kill();
                stderr.join();
                return Err(SearchError::Io(error));
            }
        };
        if read == 0 {
            break;
        }
        let relative = normalize_listing_line(&line);
        if relative.is_empty() {
            continue;
        }
        saw_lines = true;
        walker.note_cmd_result();

        if needs_tree {
            tree.add(relative);
        } else if process_candidate(walker, fq, excludes, includes, relative, token, on_match)
            .is_none()
        {
            stopped = true;
            guard.kill();
            break;
        }
    }

    if token.is_cancelled().is_none() {
        stderr.join();
        walker.note_cmd_time(started.elapsed().as_millis() as u64);
        return Err(SearchError::Canceled);
    }
    let code = guard.wait()?;
    walker.note_cmd_time(started.elapsed().as_millis() as u64);
    let stderr_text = stderr.join();

    // Exit 1 means "nothing found" for the search tool, and for `find` it
    // covers unreadable subtrees, which are transient when paths were still
    // listed.
    let benign = stopped
        || code == 0
        || (traversal == Traversal::Ripgrep && code == 1)
        || (code == 1 && saw_lines);
    if !benign {
        return Err(rationalize_command_error(&program, code, &stderr_text));
    }

    if needs_tree && !stopped {
        let literal = (!walker.query.file_pattern.is_empty())
            .then_some(walker.query.file_pattern.as_str());
        tree.match_tree(excludes, literal, &mut |entry| {
            process_candidate(
                walker,
                fq,
                excludes,
                includes,
                &entry.relative_path,
                token,
                on_match,
            )
            .is_some()
        });
    }
    Ok(())
}

/// Strips the line terminator and any `./` prefix the tool printed.
fn normalize_listing_line(line: &str) -> &str {
    let trimmed = line.trim_end_matches(['\n', '\r']);
    trimmed.strip_prefix("./").unwrap_or(trimmed)
}

/// Applies the residual filters the command could not: the exclude halves it
/// did not receive, includes, and the final gate. Returns `None` to stop.
fn process_candidate(
    walker: &FileWalker<'_>,
    fq: &FolderQuery,
    excludes: &CompiledExpression,
    includes: Option<&CompiledExpression>,
    relative: &str,
    token: &CancellationToken,
    on_match: &(dyn Fn(RawFileMatch) + Sync),
) -> Option<()> {
    let basename = leafname(relative);
    let absolute = fq.folder.join(relative);

    // The command's own filtering is a best-effort prefilter; re-check with
    // the compiled expression so approximated terms never leak results.
    if excludes.matches_file(relative, basename).is_hit()
        || excludes.matches_absolute(&absolute.to_string_lossy())
    {
        return Some(());
    }
    if let Some(includes) = includes {
        let included = !matches!(includes.matches_file(relative, basename), GlobMatch::Miss)
            || includes.matches_absolute(&absolute.to_string_lossy());
        if !included {
            return Some(());
        }
    }
    walker.note_file();
    let candidate = RawFileMatch::new(fq.folder.clone(), relative);
    if walker.gate_and_emit(candidate, token, on_match).is_break() {
        return None;
    }
    Some(())
}

/// `--files` listing through the external search tool, excludes as globs.
fn ripgrep_list_command(
    walker: &FileWalker<'_>,
    fq: &FolderQuery,
    excludes: &CompiledExpression,
) -> Command {
    let mut command = Command::new(&walker.options.ripgrep_path);
    command.current_dir(&fq.folder);
    command.arg("--files").arg("--hidden");
    if walker.query.follow_symlinks {
        command.arg("--follow");
    }
    if walker.query.disregard_ignore_files || fq.disregard_ignore_files {
        command.arg("--no-ignore");
    } else if fq.disregard_parent_ignore_files {
        command.arg("--no-ignore-parent");
    }
    for glob in excludes.relative_sources() {
        command.arg("-g").arg(format!("!{}", normalize_glob_path(glob)));
    }
    command.arg("--no-config").arg("--no-ignore-global");
    command
}

/// POSIX `find` with a prune expression built from the exclude expression's
/// basename and path terms. The macOS variant matches case-insensitively to
/// mirror its default filesystem.
fn find_command(
    fq: &FolderQuery,
    excludes: &CompiledExpression,
    case_insensitive: bool,
    follow_symlinks: bool,
) -> Command {
    let mut command = Command::new("find");
    command.current_dir(&fq.folder);
    if follow_symlinks {
        command.arg("-L");
    }
    command.arg(".");

    let name_flag = if case_insensitive { "-iname" } else { "-name" };
    let path_flag = if case_insensitive { "-ipath" } else { "-path" };
    let basename_terms = excludes.basename_terms();
    let path_terms = excludes.path_terms();

    if !basename_terms.is_empty() || !path_terms.is_empty() {
        command.arg("(");
        let mut first = true;
        for term in &basename_terms {
            if !first {
                command.arg("-o");
            }
            command.arg(name_flag).arg(term);
            first = false;
        }
        for term in &path_terms {
            if !first {
                command.arg("-o");
            }
            command.arg(path_flag).arg(find_path_term(term));
            first = false;
        }
        command.arg(")").arg("-prune").arg("-o");
    }

    command.arg("-type").arg("f").arg("-print");
    command
}

/// Converts a glob path term to `find -path` form. `find` patterns let `*`
/// cross separators, so `**` collapses to `*`; exactness is restored by the
/// post-check in [`process_candidate`].
fn find_path_term(term: &str) -> String {
    format!("./{}", term.replace("**", "*"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::{glob_expression, SearchQuery};
    use crate::walk::WalkOptions;

    fn args_of(command: &Command) -> Vec<String> {
        command
            .get_args()
            .map(|arg| arg.to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn ripgrep_listing_arguments() {
        let query = SearchQuery::single_folder("/ws");
        let options = WalkOptions::default();
        let walker = FileWalker::new(&query, &options);
        let fq = &query.folder_queries[0];
        let excludes = CompiledExpression::compile(&glob_expression(["**/node_modules"]));

        let command = ripgrep_list_command(&walker, fq, &excludes);
        let args = args_of(&command);
        assert_eq!(
            args,
            vec![
                "--files",
                "--hidden",
                "--follow",
                "-g",
                "!**/node_modules",
                "--no-config",
                "--no-ignore-global",
            ]
        );
        assert_eq!(
            command.get_current_dir().unwrap(),
            std::path::Path::new("/ws")
        );
    }

    #[test]
    fn ripgrep_listing_honors_ignore_policy() {
        let mut query = SearchQuery::single_folder("/ws");
        query.disregard_ignore_files = true;
        let options = WalkOptions::default();
        let walker = FileWalker::new(&query, &options);
        let command = ripgrep_list_command(
            &walker,
            &query.folder_queries[0],
            &CompiledExpression::empty(),
        );
        assert!(args_of(&command).contains(&"--no-ignore".to_string()));
    }

    #[test]
    fn find_arguments_with_prune_expression() {
        let query = SearchQuery::single_folder("/ws");
        let fq = &query.folder_queries[0];
        let excludes =
            CompiledExpression::compile(&glob_expression(["*.png", "src/gen/**"]));

        let command = find_command(fq, &excludes, false, true);
        let args = args_of(&command);
        assert_eq!(
            args,
            vec![
                "-L", ".", "(", "-name", "*.png", "-o", "-path", "./src/gen/*", ")",
                "-prune", "-o", "-type", "f", "-print",
            ]
        );
    }

    #[test]
    fn find_without_excludes_lists_plain_files() {
        let query = SearchQuery::single_folder("/ws");
        let command = find_command(
            &query.folder_queries[0],
            &CompiledExpression::empty(),
            false,
            false,
        );
        assert_eq!(args_of(&command), vec![".", "-type", "f", "-print"]);
    }

    #[test]
    fn mac_find_matches_case_insensitively() {
        let query = SearchQuery::single_folder("/ws");
        let excludes = CompiledExpression::compile(&glob_expression(["*.tmp"]));
        let command = find_command(&query.folder_queries[0], &excludes, true, false);
        let args = args_of(&command);
        assert!(args.contains(&"-iname".to_string()));
        assert!(!args.contains(&"-name".to_string()));
    }

    #[test]
    fn listing_lines_are_normalized() {
        assert_eq!(normalize_listing_line("./src/lib.rs\n"), "src/lib.rs");
        assert_eq!(normalize_listing_line("plain.txt\r\n"), "plain.txt");
        assert_eq!(normalize_listing_line("\n"), "");
    }
}
