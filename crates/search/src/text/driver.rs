//! Text search driver: builds the child search command, streams its output
//! through the parser, and enforces limits and the exit-code policy.
//!
//! Exit code 1 with data on stdout is the tool's "no more matches" exit and
//! counts as success. Any other nonzero exit surfaces the first stderr line,
//! filtered through a whitelist of known user-fatal prefixes.

use std::collections::{HashMap, HashSet};
use std::ffi::OsString;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Instant;

use crate::cancel::CancellationToken;
use crate::error::{Result, SearchError};
use crate::glob::CompiledExpression;
use crate::process::{ChildGuard, StderrCapture};
use crate::progress::{FileMatch, SearchStats};
use crate::query::{leafname, to_relative_string, ContentPattern, SearchQuery, TextQuery};
use crate::text::parser::GrepOutputParser;
use crate::walk::Traversal;

/// First-stderr-line prefixes that indicate a user-fatal input error rather
/// than a tool failure.
const FATAL_STDERR_PREFIXES: &[&str] =
    &["regex parse error", "error parsing glob", "unsupported encoding"];

const READ_BUFFER_SIZE: usize = 16 * 1024;

/// One text search over the query's folders and extra files, executed by a
/// single child process.
pub struct TextSearchEngine<'a> {
    query: &'a TextQuery,
    program: PathBuf,
}

impl<'a> TextSearchEngine<'a> {
    pub fn new(query: &'a TextQuery, program: impl Into<PathBuf>) -> Self {
        Self {
            query,
            program: program.into(),
        }
    }

    /// Runs the search, reporting complete per-file matches in output order.
    /// Returns whether the result limit stopped the search, plus stats.
    pub fn search(
        &self,
        token: &CancellationToken,
        on_file: &mut dyn FnMut(FileMatch),
    ) -> Result<(bool, SearchStats)> {
        let search = &self.query.search;
        let started = Instant::now();
        let program_name = self.program.to_string_lossy().into_owned();

        let args = build_args(self.query);
        tracing::debug!(
            program = %program_name,
            folders = search.folder_queries.len(),
            "starting text search"
        );

        let mut command = Command::new(&self.program);
        command.args(&args);
        let guard = ChildGuard::spawn(command, &program_name, token.clone())?;
        let stderr = StderrCapture::start(guard.take_stderr());
        let mut stdout = guard
            .take_stdout()
            .ok_or_else(|| SearchError::Internal("child stdout was not piped".to_string()))?;

        let effective_max = if search.exists {
            Some(1)
        } else {
            search.max_results
        };
        let mut parser = GrepOutputParser::new(self.query.previews, effective_max);
        if let Some(first_extra) = search.extra_files.first() {
            parser = parser.with_fallback_file(first_extra.clone());
        }

        let mut sibling_filter = SiblingFilter::new(self.query);
        let suppress_results = search.exists;
        let mut emitted = 0usize;
        let mut emit = |file: FileMatch| {
            if sibling_filter.excluded(&file) {
                return;
            }
            if suppress_results {
                return;
            }
            emitted += file.result_size();
            on_file(file);
        };

        let mut buffer = [0u8; READ_BUFFER_SIZE];
        let mut saw_data = false;
        let mut limit_hit = false;
        loop {
            if token.is_cancelled().is_none() {
                guard.kill();
                stderr.join();
                return Err(SearchError::Canceled);
            }
            let read = match stdout.read(&mut buffer) {
                Ok(0) => break,
                Ok(read) => read,
                Err(error) if error.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(error) => {
                    guard.kill();
                    stderr.join();
                    return Err(SearchError::Io(error));
                }
            };
            saw_data = true;
            if let Err(error) = parser.on_data(&buffer[..read], &mut emit) {
                guard.kill();
                stderr.join();
                return Err(error);
            }
            if parser.hit_limit() {
                limit_hit = true;
                guard.kill();
                break;
            }
        }
        if token.is_cancelled().is_none() {
            stderr.join();
            return Err(SearchError::Canceled);
        }
        parser.flush(&mut emit)?;
        let limit_hit = limit_hit || parser.hit_limit();

        let code = guard.wait()?;
        let stderr_text = stderr.join();
        if !(limit_hit || code == 0 || (code == 1 && saw_data)) {
            return Err(rationalize_command_error(&program_name, code, &stderr_text));
        }

        let stats = SearchStats {
            traversal: Traversal::Ripgrep,
            cmd_time: started.elapsed().as_millis() as u64,
            cmd_result_count: parser.result_count(),
            result_count: emitted,
            ..SearchStats::default()
        };
        tracing::debug!(
            results = stats.result_count,
            cmd_time_ms = stats.cmd_time,
            limit_hit,
            "text search finished"
        );
        Ok((limit_hit, stats))
    }
}

// ---------------------------------------------------------------------------
// Sibling post-filtering
// ---------------------------------------------------------------------------

/// Sibling-dependent excludes cannot be expressed as command arguments, so
/// they are applied to the child's output. One directory listing serves all
/// sibling lookups under that directory.
struct SiblingFilter {
    folders: Vec<(PathBuf, CompiledExpression)>,
    listings: HashMap<PathBuf, HashSet<String>>,
}

impl SiblingFilter {
    fn new(query: &TextQuery) -> Self {
        let folders = query
            .search
            .folder_queries
            .iter()
            .filter_map(|fq| {
                let compiled = CompiledExpression::merged(
                    query.search.exclude_pattern.as_ref(),
                    fq.excludes.as_ref(),
                );
                compiled
                    .has_sibling_clauses()
                    .then(|| (fq.folder.clone(), compiled))
            })
            .collect();
        Self {
            folders,
            listings: HashMap::new(),
        }
    }

    fn excluded(&mut self, file: &FileMatch) -> bool {
        if self.folders.is_empty() {
            return false;
        }
        let path = Path::new(&file.path);
        let Some((folder, excludes)) = self
            .folders
            .iter()
            .find(|(folder, _)| path.starts_with(folder))
        else {
            return false;
        };
        let Ok(relative) = path.strip_prefix(folder) else {
            return false;
        };
        let relative = to_relative_string(relative);
        let basename = leafname(&relative).to_string();
        let parent = path.parent().map(Path::to_path_buf).unwrap_or_default();
        let listing = self
            .listings
            .entry(parent.clone())
            .or_insert_with(|| directory_names(&parent));
        excludes.matches_with_siblings(&relative, &basename, &mut |name| listing.contains(name))
    }
}

fn directory_names(directory: &Path) -> HashSet<String> {
    let Ok(entries) = std::fs::read_dir(directory) else {
        return HashSet::new();
    };
    entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .collect()
}

// ---------------------------------------------------------------------------
// Argument synthesis
// ---------------------------------------------------------------------------

/// Builds the full child argument vector for a text query.
pub(crate) fn build_args(query: &TextQuery) -> Vec<OsString> {
    let search = &query.search;
    let mut args: Vec<OsString> = [
        "--hidden",
        "--heading",
        "--line-number",
        "--color",
        "ansi",
        "--colors",
        "path:none",
        "--colors",
        "line:none",
        "--colors",
        "match:fg:red",
        "--colors",
        "match:style:nobold",
    ]
    .iter()
    .map(OsString::from)
    .collect();

    args.push(
        if query.pattern.is_case_sensitive {
            "--case-sensitive"
        } else {
            "--ignore-case"
        }
        .into(),
    );

    for glob in include_glob_args(search) {
        args.push("-g".into());
        args.push(glob.into());
    }
    for glob in exclude_glob_args(search) {
        args.push("-g".into());
        args.push(format!("!{glob}").into());
    }

    if let Some(max_filesize) = search.max_filesize {
        args.push("--max-filesize".into());
        args.push(max_filesize.to_string().into());
    }

    if search.disregard_ignore_files
        || search
            .folder_queries
            .iter()
            .any(|fq| fq.disregard_ignore_files)
    {
        args.push("--no-ignore".into());
    } else if search
        .folder_queries
        .iter()
        .any(|fq| fq.disregard_parent_ignore_files)
    {
        args.push("--no-ignore-parent".into());
    }

    if search.follow_symlinks {
        args.push("--follow".into());
    }

    if let Some(encoding) = search.common_encoding() {
        args.push("--encoding".into());
        args.push(encoding.into());
    }

    args.push("--no-config".into());
    args.push("--no-ignore-global".into());

    let (pattern, as_regex) = synthesize_pattern(&query.pattern);
    if as_regex {
        args.push("--regexp".into());
        args.push(pattern.into());
    } else {
        // Literal text rides behind `--` so a leading dash is never read as
        // a flag.
        args.push("--fixed-strings".into());
        args.push("--".into());
        args.push(pattern.into());
    }

    for fq in &search.folder_queries {
        args.push(fq.folder.clone().into());
    }
    for file in &search.extra_files {
        args.push(file.clone().into());
    }
    args
}

/// Rewrites the content pattern into the form handed to the child. Returns
/// the pattern and whether it must run as a regex.
pub(crate) fn synthesize_pattern(pattern: &ContentPattern) -> (String, bool) {
    // A bare `--` as literal text would terminate option parsing twice;
    // force regex mode and escape it.
    if !pattern.is_regex && pattern.pattern == "--" {
        return (escape_regex("--"), true);
    }

    let mut as_regex = pattern.is_regex;
    let mut text = pattern.pattern.clone();
    if pattern.is_word_match {
        let inner = if pattern.is_regex {
            text
        } else {
            escape_regex(&pattern.pattern)
        };
        text = format!("\\b(?:{inner})\\b");
        as_regex = true;
    }
    if as_regex {
        text = rewrite_trailing_dollar(&text);
    }
    (text, as_regex)
}

/// Escapes regex metacharacters in literal text.
pub(crate) fn escape_regex(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len() * 2);
    for ch in text.chars() {
        if matches!(
            ch,
            '\\' | '^'
                | '$'
                | '.'
                | '|'
                | '?'
                | '*'
                | '+'
                | '('
                | ')'
                | '['
                | ']'
                | '{'
                | '}'
                | '-'
        ) {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped
}

/// Rewrites an unescaped trailing `$` to `\r?$` so Windows line endings
/// still match end-of-line patterns.
pub(crate) fn rewrite_trailing_dollar(pattern: &str) -> String {
    let Some(body) = pattern.strip_suffix('$') else {
        return pattern.to_string();
    };
    let trailing_backslashes = body.chars().rev().take_while(|ch| *ch == '\\').count();
    if trailing_backslashes % 2 == 1 {
        return pattern.to_string();
    }
    format!("{body}\\r?$")
}

/// Exclude globs for the command line, folder-joined when the query spans
/// several folders. Globs shared by every folder and starting with `**` are
/// hoisted into a single relative argument.
pub(crate) fn exclude_glob_args(search: &SearchQuery) -> Vec<String> {
    let per_folder: Vec<(&Path, CompiledExpression)> = search
        .folder_queries
        .iter()
        .map(|fq| {
            (
                fq.folder.as_path(),
                CompiledExpression::merged(search.exclude_pattern.as_ref(), fq.excludes.as_ref()),
            )
        })
        .collect();
    let multi_folder = per_folder.len() > 1;

    let mut hoisted: Vec<String> = Vec::new();
    if multi_folder {
        if let Some((_, first)) = per_folder.first() {
            for glob in first.relative_sources() {
                if glob.starts_with("**")
                    && per_folder
                        .iter()
                        .all(|(_, compiled)| compiled.relative_sources().any(|g| g == glob))
                {
                    hoisted.push(glob.to_string());
                }
            }
        }
    }

    let mut args: Vec<String> = hoisted.iter().map(|glob| normalize_glob_path(glob)).collect();
    for (folder, compiled) in &per_folder {
        for glob in compiled.relative_sources() {
            if hoisted.iter().any(|h| h == glob) {
                continue;
            }
            if multi_folder {
                let joined = folder.join(glob);
                args.push(normalize_glob_path(&joined.to_string_lossy()));
            } else {
                args.push(normalize_glob_path(glob));
            }
        }
        for glob in compiled.absolute_sources() {
            let normalized = normalize_glob_path(glob);
            if !args.contains(&normalized) {
                args.push(normalized);
            }
        }
    }
    args
}

/// Include globs for the command line.
pub(crate) fn include_glob_args(search: &SearchQuery) -> Vec<String> {
    let mut args = Vec::new();
    for fq in &search.folder_queries {
        let compiled =
            CompiledExpression::merged(search.include_pattern.as_ref(), fq.includes.as_ref());
        for glob in compiled.relative_sources().chain(compiled.absolute_sources()) {
            let normalized = normalize_glob_path(glob);
            if !args.contains(&normalized) {
                args.push(normalized);
            }
        }
    }
    args
}

/// Normalizes a glob path for the child: backslashes become forward slashes
/// (a UNC `\\` prefix survives as `//`) and a drive root like `C:/` is
/// rewritten to `/` to satisfy the tool's absolute-path convention.
pub(crate) fn normalize_glob_path(glob: &str) -> String {
    let (unc_prefix, rest) = match glob.strip_prefix("\\\\") {
        Some(rest) => ("//", rest),
        None => ("", glob),
    };
    let mut normalized = format!("{unc_prefix}{}", rest.replace('\\', "/"));
    let bytes = normalized.as_bytes();
    if bytes.len() >= 3
        && bytes[0].is_ascii_alphabetic()
        && bytes[1] == b':'
        && bytes[2] == b'/'
    {
        normalized.replace_range(..2, "");
    }
    normalized
}

/// Maps a failed child exit to a search error. User-fatal input errors are
/// recognized by their first stderr line.
pub(crate) fn rationalize_command_error(
    program: &str,
    code: i32,
    stderr: &str,
) -> SearchError {
    let first_line = stderr
        .lines()
        .find(|line| !line.trim().is_empty())
        .unwrap_or("")
        .trim();
    let message = first_line.strip_prefix("rg: ").unwrap_or(first_line);
    let lowered = message.to_ascii_lowercase();
    if FATAL_STDERR_PREFIXES
        .iter()
        .any(|prefix| lowered.starts_with(prefix))
    {
        return SearchError::InvalidPattern(message.to_string());
    }
    SearchError::CommandFailed {
        program: program.to_string(),
        code,
        stderr: message.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::{glob_expression, FolderQuery};

    fn args_of(query: &TextQuery) -> Vec<String> {
        build_args(query)
            .into_iter()
            .map(|arg| arg.to_string_lossy().into_owned())
            .collect()
    }

    fn text_query(pattern: ContentPattern) -> TextQuery {
        TextQuery::new(SearchQuery::single_folder("/ws"), pattern)
    }

    #[test]
    fn literal_pattern_rides_behind_double_dash() {
        let args = args_of(&text_query(ContentPattern::literal("-foo")));
        let position = args.iter().position(|a| a == "--fixed-strings").unwrap();
        assert_eq!(args[position + 1], "--");
        assert_eq!(args[position + 2], "-foo");
        assert_eq!(args[position + 3], "/ws");
        assert!(args.contains(&"--ignore-case".to_string()));
        assert!(args.contains(&"--no-config".to_string()));
        assert!(args.contains(&"--no-ignore-global".to_string()));
        assert!(args.contains(&"--follow".to_string()));
    }

    #[test]
    fn regex_pattern_uses_the_flag_form() {
        let args = args_of(&text_query(ContentPattern::regex("fo+")));
        let position = args.iter().position(|a| a == "--regexp").unwrap();
        assert_eq!(args[position + 1], "fo+");
        assert!(!args.contains(&"--fixed-strings".to_string()));
    }

    #[test]
    fn case_sensitive_flag() {
        let mut pattern = ContentPattern::literal("x");
        pattern.is_case_sensitive = true;
        let args = args_of(&text_query(pattern));
        assert!(args.contains(&"--case-sensitive".to_string()));
        assert!(!args.contains(&"--ignore-case".to_string()));
    }

    #[test]
    fn word_match_wraps_with_boundaries() {
        let mut pattern = ContentPattern::literal("a.b");
        pattern.is_word_match = true;
        let (text, as_regex) = synthesize_pattern(&pattern);
        assert!(as_regex);
        assert_eq!(text, "\\b(?:a\\.b)\\b");

        let mut regex = ContentPattern::regex("ab|cd");
        regex.is_word_match = true;
        let (text, as_regex) = synthesize_pattern(&regex);
        assert!(as_regex);
        assert_eq!(text, "\\b(?:ab|cd)\\b");
    }

    #[test]
    fn bare_double_dash_is_forced_to_regex() {
        let (text, as_regex) = synthesize_pattern(&ContentPattern::literal("--"));
        assert!(as_regex);
        assert_eq!(text, "\\-\\-");
    }

    #[test]
    fn trailing_dollar_matches_crlf() {
        assert_eq!(rewrite_trailing_dollar("end$"), "end\\r?$");
        assert_eq!(rewrite_trailing_dollar("end\\$"), "end\\$");
        assert_eq!(rewrite_trailing_dollar("end\\\\$"), "end\\\\\\r?$");
        assert_eq!(rewrite_trailing_dollar("plain"), "plain");
        let (text, _) = synthesize_pattern(&ContentPattern::regex("line$"));
        assert_eq!(text, "line\\r?$");
    }

    #[test]
    fn encoding_requires_folder_agreement() {
        let mut query = TextQuery::new(
            SearchQuery::new(vec![FolderQuery::new("/a"), FolderQuery::new("/b")]),
            ContentPattern::literal("x"),
        );
        assert!(!args_of(&query).contains(&"--encoding".to_string()));

        for fq in &mut query.search.folder_queries {
            fq.file_encoding = Some("shiftjis".to_string());
        }
        let args = args_of(&query);
        let position = args.iter().position(|a| a == "--encoding").unwrap();
        assert_eq!(args[position + 1], "shiftjis");
    }

    #[test]
    fn ignore_policy_switches() {
        let mut query = text_query(ContentPattern::literal("x"));
        assert!(!args_of(&query).contains(&"--no-ignore".to_string()));

        query.search.folder_queries[0].disregard_parent_ignore_files = true;
        assert!(args_of(&query).contains(&"--no-ignore-parent".to_string()));

        query.search.disregard_ignore_files = true;
        let args = args_of(&query);
        assert!(args.contains(&"--no-ignore".to_string()));
        assert!(!args.contains(&"--no-ignore-parent".to_string()));
    }

    #[test]
    fn single_folder_excludes_stay_relative() {
        let mut query = text_query(ContentPattern::literal("x"));
        query.search.folder_queries[0].excludes =
            Some(glob_expression(["**/node_modules", "out/**"]));
        let globs = exclude_glob_args(&query.search);
        assert_eq!(globs, vec!["**/node_modules", "out/**"]);
    }

    #[test]
    fn multi_folder_excludes_are_joined_and_shared_globs_hoisted() {
        let shared = glob_expression(["**/node_modules", "dist/**"]);
        let mut query = TextQuery::new(
            SearchQuery::new(vec![
                FolderQuery::new("/a").with_excludes(shared.clone()),
                FolderQuery::new("/b").with_excludes(shared),
            ]),
            ContentPattern::literal("x"),
        );
        query.search.folder_queries[1]
            .excludes
            .as_mut()
            .unwrap()
            .insert("extra/**".to_string(), crate::query::GlobValue::Always(true));

        let globs = exclude_glob_args(&query.search);
        // `**/node_modules` is common to both folders and starts with `**`,
        // so it appears once, unjoined.
        assert_eq!(
            globs.iter().filter(|g| g.contains("node_modules")).count(),
            1
        );
        assert!(globs.contains(&"**/node_modules".to_string()));
        // `dist/**` is shared but does not start with `**`: joined per folder.
        assert!(globs.contains(&"/a/dist/**".to_string()));
        assert!(globs.contains(&"/b/dist/**".to_string()));
        assert!(globs.contains(&"/b/extra/**".to_string()));
    }

    #[test]
    fn glob_path_normalization() {
        assert_eq!(normalize_glob_path("src\\gen\\**"), "src/gen/**");
        assert_eq!(normalize_glob_path("C:/Users/me/**"), "/Users/me/**");
        assert_eq!(normalize_glob_path("c:\\code\\**"), "/code/**");
        assert_eq!(
            normalize_glob_path("\\\\server\\share\\**"),
            "//server/share/**"
        );
        assert_eq!(normalize_glob_path("**/plain"), "**/plain");
    }

    #[test]
    fn stderr_whitelist_classification() {
        let error = rationalize_command_error("rg", 2, "regex parse error:\n  oops");
        assert!(matches!(error, SearchError::InvalidPattern(_)));

        let error = rationalize_command_error("rg", 2, "rg: error parsing glob '[': oops");
        assert!(matches!(error, SearchError::InvalidPattern(_)));

        let error = rationalize_command_error("rg", 2, "rg: unsupported encoding: base64");
        assert!(matches!(error, SearchError::InvalidPattern(_)));

        let error = rationalize_command_error("rg", 137, "something exploded");
        match error {
            SearchError::CommandFailed { code, stderr, .. } => {
                assert_eq!(code, 137);
                assert_eq!(stderr, "something exploded");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
