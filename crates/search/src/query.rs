//! Query data model for file and text searches.
//!
//! These are the payload types callers hand to the [`SearchService`]. They
//! are serde-serializable with camelCase field names so they can cross an
//! IPC boundary unchanged.
//!
//! [`SearchService`]: crate::service::SearchService

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Scheme handled by the built-in on-disk engines.
pub const FILE_SCHEME: &str = "file";

// ---------------------------------------------------------------------------
// Glob expressions
// ---------------------------------------------------------------------------

/// A mapping from glob string to its activation value.
///
/// `true` always applies the glob, `false` disables it, and a sibling clause
/// applies it only when a derived sibling file exists in the same directory
/// (e.g. exclude `foo.js` when `foo.ts` exists).
pub type GlobExpression = BTreeMap<String, GlobValue>;

/// Value side of a glob expression entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum GlobValue {
    Always(bool),
    Sibling(SiblingClause),
}

impl GlobValue {
    pub fn is_enabled(&self) -> bool {
        !matches!(self, GlobValue::Always(false))
    }
}

/// `{ "when": "$(basename).ts" }` — the `$(basename)` placeholder is replaced
/// with the candidate's file stem to derive the sibling name to look for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SiblingClause {
    pub when: String,
}

/// Convenience constructor used throughout the tests.
pub fn glob_expression<I, S>(globs: I) -> GlobExpression
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    globs
        .into_iter()
        .map(|glob| (glob.into(), GlobValue::Always(true)))
        .collect()
}

// ---------------------------------------------------------------------------
// Folder queries
// ---------------------------------------------------------------------------

/// A single root folder plus the excludes/includes/encoding that apply to it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FolderQuery {
    /// Absolute root path of this folder.
    pub folder: PathBuf,
    /// URI scheme of the root; `file` when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheme: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub excludes: Option<GlobExpression>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub includes: Option<GlobExpression>,
    /// Encoding of files under this root, when known to differ from UTF-8.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_encoding: Option<String>,
    /// Do not honor ignore files (.gitignore etc.) under this root.
    #[serde(default)]
    pub disregard_ignore_files: bool,
    /// Do not honor ignore files in parent directories of this root.
    #[serde(default)]
    pub disregard_parent_ignore_files: bool,
}

impl FolderQuery {
    pub fn new(folder: impl Into<PathBuf>) -> Self {
        Self {
            folder: folder.into(),
            scheme: None,
            excludes: None,
            includes: None,
            file_encoding: None,
            disregard_ignore_files: false,
            disregard_parent_ignore_files: false,
        }
    }

    pub fn with_excludes(mut self, excludes: GlobExpression) -> Self {
        self.excludes = Some(excludes);
        self
    }

    pub fn with_includes(mut self, includes: GlobExpression) -> Self {
        self.includes = Some(includes);
        self
    }

    pub fn scheme(&self) -> &str {
        self.scheme.as_deref().unwrap_or(FILE_SCHEME)
    }
}

// ---------------------------------------------------------------------------
// Search queries
// ---------------------------------------------------------------------------

/// Common request shape shared by file and text searches.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchQuery {
    /// Roots to traverse, in caller order. Must be nonempty.
    pub folder_queries: Vec<FolderQuery>,
    /// Loose files searched in addition to the folder roots.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extra_files: Vec<PathBuf>,
    /// Fuzzy file pattern; empty matches everything.
    #[serde(default)]
    pub file_pattern: String,
    /// Include expression applied globally, on top of per-folder includes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub include_pattern: Option<GlobExpression>,
    /// Exclude expression applied globally, on top of per-folder excludes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exclude_pattern: Option<GlobExpression>,
    /// Stop after this many results and report `limitHit`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_results: Option<usize>,
    /// Return on the first match without reporting it.
    #[serde(default)]
    pub exists: bool,
    /// Skip files larger than this many bytes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_filesize: Option<u64>,
    /// Rank file results by fuzzy score instead of discovery order.
    #[serde(default)]
    pub sort_by_score: bool,
    /// Opaque token sharing result memoization across related queries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_key: Option<String>,
    /// Search ignored files too.
    #[serde(default)]
    pub disregard_ignore_files: bool,
    /// Follow symbolic links during traversal.
    #[serde(default = "default_true")]
    pub follow_symlinks: bool,
    /// Explicit progress batch size; batches strictly when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<usize>,
}

fn default_true() -> bool {
    true
}

impl SearchQuery {
    pub fn new(folder_queries: Vec<FolderQuery>) -> Self {
        Self {
            folder_queries,
            extra_files: Vec::new(),
            file_pattern: String::new(),
            include_pattern: None,
            exclude_pattern: None,
            max_results: None,
            exists: false,
            max_filesize: None,
            sort_by_score: false,
            cache_key: None,
            disregard_ignore_files: false,
            follow_symlinks: true,
            batch_size: None,
        }
    }

    pub fn single_folder(folder: impl Into<PathBuf>) -> Self {
        Self::new(vec![FolderQuery::new(folder)])
    }

    pub fn with_file_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.file_pattern = pattern.into();
        self
    }

    pub fn with_max_results(mut self, max: usize) -> Self {
        self.max_results = Some(max);
        self
    }

    /// Encoding shared by every folder of the query, if there is one and it
    /// is not UTF-8. Used to decide whether an `--encoding` switch can be
    /// passed to the external searcher.
    pub fn common_encoding(&self) -> Option<&str> {
        let mut encodings = self
            .folder_queries
            .iter()
            .map(|fq| fq.file_encoding.as_deref());
        let first = encodings.next()??;
        if !encodings.all(|enc| enc == Some(first)) {
            return None;
        }
        let normalized = first.to_ascii_lowercase();
        if normalized == "utf8" || normalized == "utf-8" {
            None
        } else {
            Some(first)
        }
    }
}

// ---------------------------------------------------------------------------
// Text search
// ---------------------------------------------------------------------------

/// The content pattern of a text search.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentPattern {
    pub pattern: String,
    #[serde(default)]
    pub is_regex: bool,
    #[serde(default)]
    pub is_case_sensitive: bool,
    #[serde(default)]
    pub is_word_match: bool,
    /// Caller's word-separator set; informational for word matches, which
    /// are expressed through `\b` boundaries in the synthesized pattern.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub word_separators: Option<String>,
}

impl ContentPattern {
    pub fn literal(pattern: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            is_regex: false,
            is_case_sensitive: false,
            is_word_match: false,
            word_separators: None,
        }
    }

    pub fn regex(pattern: impl Into<String>) -> Self {
        Self {
            is_regex: true,
            ..Self::literal(pattern)
        }
    }
}

/// Bounds on the single-line preview rendered for each match.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreviewOptions {
    /// Maximum preview characters kept before a line's first match.
    pub chars_before: usize,
    /// Maximum preview characters kept after a line's last match.
    pub chars_after: usize,
}

impl Default for PreviewOptions {
    fn default() -> Self {
        Self {
            chars_before: 100,
            chars_after: 250,
        }
    }
}

/// A complete text search request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TextQuery {
    #[serde(flatten)]
    pub search: SearchQuery,
    pub pattern: ContentPattern,
    #[serde(default)]
    pub previews: PreviewOptions,
}

impl TextQuery {
    pub fn new(search: SearchQuery, pattern: ContentPattern) -> Self {
        Self {
            search,
            pattern,
            previews: PreviewOptions::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// Raw file matches
// ---------------------------------------------------------------------------

/// A candidate produced by the file walker.
///
/// `base.join(relative_path)` is the absolute path; `basename` is the leaf
/// name of `relative_path`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFileMatch {
    pub base: PathBuf,
    pub relative_path: String,
    pub basename: String,
    pub size: Option<u64>,
}

impl RawFileMatch {
    pub fn new(base: impl Into<PathBuf>, relative_path: impl Into<String>) -> Self {
        let relative_path = relative_path.into();
        let basename = leafname(&relative_path).to_string();
        Self {
            base: base.into(),
            relative_path,
            basename,
            size: None,
        }
    }

    pub fn with_size(mut self, size: u64) -> Self {
        self.size = Some(size);
        self
    }

    pub fn absolute_path(&self) -> PathBuf {
        self.base.join(&self.relative_path)
    }
}

/// Leaf name of a `/`-separated relative path.
pub fn leafname(relative_path: &str) -> &str {
    relative_path
        .rsplit('/')
        .next()
        .unwrap_or(relative_path)
}

/// Normalizes an OS path fragment to the `/`-separated relative form used
/// across the engine.
pub fn to_relative_string(path: &Path) -> String {
    let text = path.to_string_lossy();
    if std::path::MAIN_SEPARATOR == '/' {
        text.into_owned()
    } else {
        text.replace(std::path::MAIN_SEPARATOR, "/")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_match_derives_basename() {
        let m = RawFileMatch::new("/root", "src/lib.rs");
        assert_eq!(m.basename, "lib.rs");
        assert_eq!(m.absolute_path(), PathBuf::from("/root/src/lib.rs"));
    }

    #[test]
    fn leafname_of_bare_name() {
        assert_eq!(leafname("file.txt"), "file.txt");
        assert_eq!(leafname("a/b/file.txt"), "file.txt");
    }

    #[test]
    fn common_encoding_requires_agreement() {
        let mut query = SearchQuery::new(vec![
            FolderQuery::new("/a"),
            FolderQuery::new("/b"),
        ]);
        assert_eq!(query.common_encoding(), None);

        for fq in &mut query.folder_queries {
            fq.file_encoding = Some("shiftjis".to_string());
        }
        assert_eq!(query.common_encoding(), Some("shiftjis"));

        query.folder_queries[1].file_encoding = Some("gbk".to_string());
        assert_eq!(query.common_encoding(), None);
    }

    #[test]
    fn utf8_is_not_a_common_encoding() {
        let mut query = SearchQuery::single_folder("/a");
        query.folder_queries[0].file_encoding = Some("utf-8".to_string());
        assert_eq!(query.common_encoding(), None);
    }

    #[test]
    fn glob_value_deserializes_both_forms() {
        let expr: GlobExpression = serde_json::from_str(
            r#"{"**/*.js": {"when": "$(basename).ts"}, "**/node_modules": true}"#,
        )
        .unwrap();
        assert_eq!(
            expr.get("**/node_modules"),
            Some(&GlobValue::Always(true))
        );
        assert_eq!(
            expr.get("**/*.js"),
            Some(&GlobValue::Sibling(SiblingClause {
                when: "$(basename).ts".to_string()
            }))
        );
    }
}
