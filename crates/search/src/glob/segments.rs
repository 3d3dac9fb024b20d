//! Glob segment and wildcard matching primitives.
//!
//! Patterns are `/`-separated; `*` and `?` match within one segment, `**`
//! crosses segment boundaries, and `{a,b}` alternations are expanded at
//! parse time.

// ---------------------------------------------------------------------------
// Wildcard matching
// ---------------------------------------------------------------------------

/// Matches a pattern with wildcards (`*` and `?`) against a candidate string.
pub fn wildcard_matches(pattern: &str, candidate: &str) -> bool {
    let pattern_chars = pattern.chars().collect::<Vec<_>>();
    let candidate_chars = candidate.chars().collect::<Vec<_>>();

    let mut pattern_index = 0usize;
    let mut candidate_index = 0usize;
    let mut star_index: Option<usize> = None;
    let mut star_candidate_index = 0usize;

    while candidate_index < candidate_chars.len() {
        if pattern_index < pattern_chars.len()
            && (pattern_chars[pattern_index] == '?'
                || pattern_chars[pattern_index] == candidate_chars[candidate_index])
        {
            pattern_index += 1;
            candidate_index += 1;
            continue;
        }

        if pattern_index < pattern_chars.len() && pattern_chars[pattern_index] == '*' {
            star_index = Some(pattern_index);
            pattern_index += 1;
            star_candidate_index = candidate_index;
            continue;
        }

        if let Some(last_star_index) = star_index {
            pattern_index = last_star_index + 1;
            star_candidate_index += 1;
            candidate_index = star_candidate_index;
            continue;
        }

        return false;
    }

    while pattern_index < pattern_chars.len() && pattern_chars[pattern_index] == '*' {
        pattern_index += 1;
    }

    pattern_index == pattern_chars.len()
}

// ---------------------------------------------------------------------------
// Brace expansion
// ---------------------------------------------------------------------------

/// Expands one level of `{a,b}` alternations into separate globs.
///
/// Globs without braces are returned unchanged. Unbalanced braces are left
/// as literal text.
pub fn expand_braces(glob: &str) -> Vec<String> {
    let Some(open) = glob.find('{') else {
        return vec![glob.to_string()];
    };
    let Some(close_offset) = glob[open..].find('}') else {
        return vec![glob.to_string()];
    };
    let close = open + close_offset;

    let prefix = &glob[..open];
    let body = &glob[open + 1..close];
    let suffix = &glob[close + 1..];

    body.split(',')
        .flat_map(|alternative| expand_braces(&format!("{prefix}{alternative}{suffix}")))
        .collect()
}

// ---------------------------------------------------------------------------
// Parsed glob patterns
// ---------------------------------------------------------------------------

/// One `/`-separated component of a glob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GlobSegment {
    /// `**`: matches zero or more path segments.
    GlobStar,
    /// A concrete segment, possibly containing `*`/`?`.
    Text(String),
}

/// A single glob after brace expansion, split into segments.
#[derive(Debug, Clone)]
pub struct GlobPattern {
    segments: Vec<GlobSegment>,
    basename_only: bool,
}

impl GlobPattern {
    /// Parses one glob string into the patterns it denotes (brace expansion
    /// can produce several).
    pub fn parse(glob: &str) -> Vec<GlobPattern> {
        expand_braces(glob)
            .into_iter()
            .map(|expanded| {
                let normalized = expanded.replace('\\', "/");
                let trimmed = normalized.trim_start_matches('/');
                let basename_only = !trimmed.contains('/');
                let segments = trimmed
                    .split('/')
                    .filter(|segment| !segment.is_empty())
                    .map(|segment| {
                        if segment == "**" {
                            GlobSegment::GlobStar
                        } else {
                            GlobSegment::Text(segment.to_string())
                        }
                    })
                    .collect();
                GlobPattern {
                    segments,
                    basename_only,
                }
            })
            .collect()
    }

    /// True when the glob names a bare file name (no `/`), which matches the
    /// basename of a candidate at any depth.
    pub fn is_basename_only(&self) -> bool {
        self.basename_only
    }

    /// Matches a `/`-separated relative path against this glob.
    ///
    /// Basename-only globs match the final segment at any depth. Path globs
    /// match the whole path, with `**` spanning any number of segments.
    pub fn matches(&self, relative_path: &str, basename: &str) -> bool {
        if self.basename_only {
            let Some(GlobSegment::Text(pattern)) = self.segments.first() else {
                return false;
            };
            return wildcard_matches(pattern, basename);
        }
        let path_segments = relative_path
            .split('/')
            .filter(|segment| !segment.is_empty())
            .collect::<Vec<_>>();
        segments_match(&self.segments, &path_segments)
    }

    /// Matches a path or any of its ancestor directories, mirroring how an
    /// external tool prunes a directory subtree on a glob hit.
    pub fn matches_path_or_ancestor(&self, relative_path: &str) -> bool {
        if self.basename_only {
            let Some(GlobSegment::Text(pattern)) = self.segments.first() else {
                return false;
            };
            return relative_path
                .split('/')
                .filter(|segment| !segment.is_empty())
                .any(|segment| wildcard_matches(pattern, segment));
        }

        let path_segments = relative_path
            .split('/')
            .filter(|segment| !segment.is_empty())
            .collect::<Vec<_>>();
        (1..=path_segments.len())
            .any(|prefix_len| segments_match(&self.segments, &path_segments[..prefix_len]))
    }
}

/// Recursive segment matcher with `**` support.
fn segments_match(pattern: &[GlobSegment], path: &[&str]) -> bool {
    match pattern.first() {
        None => path.is_empty(),
        Some(GlobSegment::GlobStar) => {
            // `**` consumes zero or more leading path segments.
            (0..=path.len()).any(|skip| segments_match(&pattern[1..], &path[skip..]))
        }
        Some(GlobSegment::Text(text)) => match path.first() {
            Some(first) if wildcard_matches(text, first) => {
                segments_match(&pattern[1..], &path[1..])
            }
            _ => false,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcard_literal_and_star() {
        assert!(wildcard_matches("foo", "foo"));
        assert!(!wildcard_matches("foo", "foobar"));
        assert!(wildcard_matches("*.png", "shot.png"));
        assert!(!wildcard_matches("*.png", "shot.png.bak"));
        assert!(wildcard_matches("f?o", "fao"));
        assert!(!wildcard_matches("f?o", "fo"));
        assert!(wildcard_matches("*", "anything"));
        assert!(wildcard_matches("a*c*e", "abcde"));
    }

    #[test]
    fn brace_expansion() {
        assert_eq!(expand_braces("*.txt"), vec!["*.txt"]);
        assert_eq!(
            expand_braces("**/*.{js,ts}"),
            vec!["**/*.js", "**/*.ts"]
        );
        assert_eq!(
            expand_braces("{a,b}/{c,d}"),
            vec!["a/c", "a/d", "b/c", "b/d"]
        );
        // Unbalanced braces stay literal.
        assert_eq!(expand_braces("foo{bar"), vec!["foo{bar"]);
    }

    #[test]
    fn basename_glob_matches_any_depth() {
        let patterns = GlobPattern::parse("*.png");
        assert_eq!(patterns.len(), 1);
        let pattern = &patterns[0];
        assert!(pattern.is_basename_only());
        assert!(pattern.matches("shot.png", "shot.png"));
        assert!(pattern.matches("assets/img/shot.png", "shot.png"));
        assert!(!pattern.matches("assets/img/shot.jpg", "shot.jpg"));
    }

    #[test]
    fn globstar_crosses_segments() {
        let pattern = &GlobPattern::parse("**/node_modules/**")[0];
        assert!(pattern.matches("node_modules/a/b.js", "b.js"));
        assert!(pattern.matches("pkg/node_modules/x.js", "x.js"));
        assert!(!pattern.matches("src/main.rs", "main.rs"));
    }

    #[test]
    fn globstar_prefix_matches_at_root() {
        let pattern = &GlobPattern::parse("**/target")[0];
        assert!(pattern.matches("target", "target"));
        assert!(pattern.matches("crates/search/target", "target"));
        assert!(!pattern.matches("target/debug/foo", "foo"));
        assert!(pattern.matches_path_or_ancestor("target/debug/foo"));
    }

    #[test]
    fn ancestor_matching_prunes_subtrees() {
        let pattern = &GlobPattern::parse("node_modules")[0];
        assert!(pattern.matches_path_or_ancestor("node_modules/a/deep/file.js"));
        assert!(!pattern.matches_path_or_ancestor("src/node_modules.rs"));

        let path_pattern = &GlobPattern::parse("out/build")[0];
        assert!(path_pattern.matches_path_or_ancestor("out/build/a.o"));
        assert!(!path_pattern.matches_path_or_ancestor("out/other/a.o"));
    }

    #[test]
    fn path_glob_with_wildcards() {
        let pattern = &GlobPattern::parse("src/*/generated")[0];
        assert!(pattern.matches("src/api/generated", "generated"));
        assert!(!pattern.matches("src/api/deep/generated", "generated"));
    }
}
