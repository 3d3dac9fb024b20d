//! Compiled include/exclude expressions.
//!
//! An expression maps glob strings to activation values (see
//! [`GlobExpression`]). Compilation splits the keys into an absolute-path
//! half and a relative-path half so candidates can be tested without joining
//! paths, and keeps sibling clauses in a deferred form that is resolved once
//! the candidate's directory listing is available.

use crate::query::{GlobExpression, GlobValue};

use super::segments::{expand_braces, GlobPattern};

/// Outcome of testing a candidate against an expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GlobMatch {
    /// No glob applies.
    Miss,
    /// An unconditional glob applies.
    Hit,
    /// A sibling clause applies if the named sibling exists in the
    /// candidate's directory.
    WhenSibling(String),
}

impl GlobMatch {
    pub fn is_hit(&self) -> bool {
        matches!(self, GlobMatch::Hit)
    }
}

/// One expression entry after parsing.
#[derive(Debug, Clone)]
struct CompiledPattern {
    source: String,
    globs: Vec<GlobPattern>,
    /// Sibling template with a `$(basename)` placeholder, when conditional.
    sibling: Option<String>,
}

impl CompiledPattern {
    fn new(source: &str, sibling: Option<String>) -> Self {
        Self {
            source: source.to_string(),
            globs: GlobPattern::parse(source),
            sibling,
        }
    }

    fn matches_entry(&self, relative_path: &str, basename: &str) -> bool {
        self.globs
            .iter()
            .any(|glob| glob.matches(relative_path, basename))
    }

    fn matches_file(&self, relative_path: &str, basename: &str) -> bool {
        if self.sibling.is_some() {
            // Sibling clauses apply to the candidate itself, never to an
            // ancestor directory.
            return self.matches_entry(relative_path, basename);
        }
        self.globs
            .iter()
            .any(|glob| glob.matches_path_or_ancestor(relative_path))
    }
}

/// A compiled expression, split into absolute and relative halves.
#[derive(Debug, Clone, Default)]
pub struct CompiledExpression {
    relative: Vec<CompiledPattern>,
    absolute: Vec<CompiledPattern>,
}

impl CompiledExpression {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Compiles one raw expression.
    pub fn compile(expression: &GlobExpression) -> Self {
        let mut compiled = Self::default();
        compiled.extend(expression);
        compiled
    }

    /// Compiles the union of a global and a per-folder expression.
    pub fn merged(
        global: Option<&GlobExpression>,
        folder: Option<&GlobExpression>,
    ) -> Self {
        let mut compiled = Self::default();
        if let Some(expression) = global {
            compiled.extend(expression);
        }
        if let Some(expression) = folder {
            compiled.extend(expression);
        }
        compiled
    }

    fn extend(&mut self, expression: &GlobExpression) {
        for (glob, value) in expression {
            let sibling = match value {
                GlobValue::Always(true) => None,
                GlobValue::Always(false) => continue,
                GlobValue::Sibling(clause) => Some(clause.when.clone()),
            };
            let pattern = CompiledPattern::new(glob, sibling);
            if is_absolute_glob(glob) {
                self.absolute.push(pattern);
            } else {
                self.relative.push(pattern);
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.relative.is_empty() && self.absolute.is_empty()
    }

    pub fn has_sibling_clauses(&self) -> bool {
        self.relative
            .iter()
            .chain(self.absolute.iter())
            .any(|pattern| pattern.sibling.is_some())
    }

    /// Tests a single traversal entry (file or directory) against the
    /// relative half. A directory hit prunes the subtree in the walker.
    pub fn matches_entry(&self, relative_path: &str, basename: &str) -> GlobMatch {
        self.first_match(relative_path, basename, false)
    }

    /// Tests a complete file path against the relative half, treating a hit
    /// on any ancestor directory as a hit on the file. This mirrors how an
    /// external tool prunes directories, and is used when post-filtering
    /// streamed command output.
    pub fn matches_file(&self, relative_path: &str, basename: &str) -> GlobMatch {
        self.first_match(relative_path, basename, true)
    }

    fn first_match(
        &self,
        relative_path: &str,
        basename: &str,
        ancestors: bool,
    ) -> GlobMatch {
        let mut deferred: Option<String> = None;
        for pattern in &self.relative {
            let hit = if ancestors {
                pattern.matches_file(relative_path, basename)
            } else {
                pattern.matches_entry(relative_path, basename)
            };
            if !hit {
                continue;
            }
            match &pattern.sibling {
                None => return GlobMatch::Hit,
                Some(template) => {
                    let sibling = sibling_name(template, basename);
                    // A file is not its own sibling.
                    if sibling != basename && deferred.is_none() {
                        deferred = Some(sibling);
                    }
                }
            }
        }
        match deferred {
            Some(sibling) => GlobMatch::WhenSibling(sibling),
            None => GlobMatch::Miss,
        }
    }

    /// Tests an absolute path against the absolute half.
    pub fn matches_absolute(&self, absolute_path: &str) -> bool {
        if self.absolute.is_empty() {
            return false;
        }
        let normalized = absolute_path.replace('\\', "/");
        let trimmed = normalized.trim_start_matches('/');
        let basename = trimmed.rsplit('/').next().unwrap_or(trimmed);
        self.absolute
            .iter()
            .filter(|pattern| pattern.sibling.is_none())
            .any(|pattern| pattern.matches_file(trimmed, basename))
    }

    /// Fully resolves the relative half for a file, consulting the
    /// candidate's directory listing for sibling clauses.
    pub fn matches_with_siblings(
        &self,
        relative_path: &str,
        basename: &str,
        has_sibling: &mut dyn FnMut(&str) -> bool,
    ) -> bool {
        match self.matches_file(relative_path, basename) {
            GlobMatch::Miss => false,
            GlobMatch::Hit => true,
            GlobMatch::WhenSibling(sibling) => has_sibling(&sibling),
        }
    }

    /// Bare filename patterns (`*.png`, `foo`) usable as command-line name
    /// filters. Sibling clauses are never extracted; they are post-applied.
    pub fn basename_terms(&self) -> Vec<String> {
        let mut terms = Vec::new();
        for pattern in &self.relative {
            if pattern.sibling.is_some() {
                continue;
            }
            for expanded in expand_braces(&pattern.source) {
                let stripped = expanded.strip_prefix("**/").unwrap_or(&expanded);
                if !stripped.is_empty() && !stripped.contains('/') {
                    terms.push(stripped.to_string());
                }
            }
        }
        terms
    }

    /// Patterns containing path separators, usable as command-line path
    /// filters.
    pub fn path_terms(&self) -> Vec<String> {
        let mut terms = Vec::new();
        for pattern in &self.relative {
            if pattern.sibling.is_some() {
                continue;
            }
            for expanded in expand_braces(&pattern.source) {
                let stripped = expanded.strip_prefix("**/").unwrap_or(&expanded);
                if stripped.contains('/') {
                    terms.push(expanded);
                }
            }
        }
        terms
    }

    /// Source strings of every enabled, unconditional relative glob. Used to
    /// build external command glob arguments.
    pub fn relative_sources(&self) -> impl Iterator<Item = &str> {
        self.relative
            .iter()
            .filter(|pattern| pattern.sibling.is_none())
            .map(|pattern| pattern.source.as_str())
    }

    /// Source strings of every enabled, unconditional absolute glob.
    pub fn absolute_sources(&self) -> impl Iterator<Item = &str> {
        self.absolute
            .iter()
            .filter(|pattern| pattern.sibling.is_none())
            .map(|pattern| pattern.source.as_str())
    }
}

/// Derives the sibling filename from a clause template by substituting the
/// candidate's stem for `$(basename)`.
pub fn sibling_name(template: &str, basename: &str) -> String {
    let stem = match basename.rfind('.') {
        Some(dot) if dot > 0 => &basename[..dot],
        _ => basename,
    };
    template.replace("$(basename)", stem)
}

/// Keys starting at a path root are evaluated against absolute paths.
fn is_absolute_glob(glob: &str) -> bool {
    if glob.starts_with('/') || glob.starts_with("\\\\") {
        return true;
    }
    // Windows drive roots, e.g. `C:/` or `C:\`.
    let mut chars = glob.chars();
    matches!(
        (chars.next(), chars.next(), chars.next()),
        (Some(drive), Some(':'), Some('/' | '\\')) if drive.is_ascii_alphabetic()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::{glob_expression, SiblingClause};

    fn expression_with_sibling(glob: &str, when: &str) -> GlobExpression {
        let mut expression = GlobExpression::new();
        expression.insert(
            glob.to_string(),
            GlobValue::Sibling(SiblingClause {
                when: when.to_string(),
            }),
        );
        expression
    }

    #[test]
    fn disabled_globs_are_dropped() {
        let mut expression = glob_expression(["**/target"]);
        expression.insert("**/dist".to_string(), GlobValue::Always(false));
        let compiled = CompiledExpression::compile(&expression);
        assert_eq!(compiled.matches_entry("target", "target"), GlobMatch::Hit);
        assert_eq!(compiled.matches_entry("dist", "dist"), GlobMatch::Miss);
    }

    #[test]
    fn splits_absolute_and_relative_halves() {
        let expression = glob_expression(["**/*.log", "/var/tmp/**"]);
        let compiled = CompiledExpression::compile(&expression);
        assert_eq!(compiled.matches_entry("app.log", "app.log"), GlobMatch::Hit);
        assert!(compiled.matches_absolute("/var/tmp/scratch.txt"));
        assert!(!compiled.matches_absolute("/home/user/app.rs"));
    }

    #[test]
    fn sibling_clause_defers_until_listing() {
        let expression = expression_with_sibling("**/*.js", "$(basename).ts");
        let compiled = CompiledExpression::compile(&expression);
        assert!(compiled.has_sibling_clauses());
        assert_eq!(
            compiled.matches_entry("src/app.js", "app.js"),
            GlobMatch::WhenSibling("app.ts".to_string())
        );

        let mut with_ts = |name: &str| name == "app.ts";
        assert!(compiled.matches_with_siblings("src/app.js", "app.js", &mut with_ts));
        let mut without_ts = |_: &str| false;
        assert!(!compiled.matches_with_siblings("src/app.js", "app.js", &mut without_ts));
    }

    #[test]
    fn a_file_is_not_its_own_sibling() {
        let expression = expression_with_sibling("**/*.ts", "$(basename).ts");
        let compiled = CompiledExpression::compile(&expression);
        assert_eq!(
            compiled.matches_entry("src/app.ts", "app.ts"),
            GlobMatch::Miss
        );
    }

    #[test]
    fn plain_hit_wins_over_sibling_clause() {
        let mut expression = expression_with_sibling("**/*.js", "$(basename).ts");
        expression.insert("**/app.js".to_string(), GlobValue::Always(true));
        let compiled = CompiledExpression::compile(&expression);
        assert_eq!(
            compiled.matches_entry("src/app.js", "app.js"),
            GlobMatch::Hit
        );
    }

    #[test]
    fn file_matching_sees_ancestor_hits() {
        let compiled = CompiledExpression::compile(&glob_expression(["**/node_modules"]));
        assert_eq!(
            compiled.matches_entry("node_modules/lib/index.js", "index.js"),
            GlobMatch::Miss
        );
        assert_eq!(
            compiled.matches_file("node_modules/lib/index.js", "index.js"),
            GlobMatch::Hit
        );
    }

    #[test]
    fn merged_applies_both_halves() {
        let global = glob_expression(["**/*.tmp"]);
        let folder = glob_expression(["build/**"]);
        let compiled = CompiledExpression::merged(Some(&global), Some(&folder));
        assert_eq!(compiled.matches_entry("a.tmp", "a.tmp"), GlobMatch::Hit);
        assert_eq!(
            compiled.matches_file("build/out.o", "out.o"),
            GlobMatch::Hit
        );
        assert_eq!(compiled.matches_entry("src/a.rs", "a.rs"), GlobMatch::Miss);
    }

    #[test]
    fn term_extraction() {
        let expression = glob_expression(["**/*.png", "foo", "src/gen/**", "**/*.{jpg,gif}"]);
        let compiled = CompiledExpression::compile(&expression);

        let mut basenames = compiled.basename_terms();
        basenames.sort();
        assert_eq!(basenames, vec!["*.gif", "*.jpg", "*.png", "foo"]);

        assert_eq!(compiled.path_terms(), vec!["src/gen/**"]);
    }

    #[test]
    fn sibling_name_substitutes_stem() {
        assert_eq!(sibling_name("$(basename).ts", "app.js"), "app.ts");
        assert_eq!(sibling_name("$(basename).d.ts", "util.js"), "util.d.ts");
        assert_eq!(sibling_name("$(basename).ts", "noext"), "noext.ts");
        // Dotfiles keep their full name as the stem.
        assert_eq!(sibling_name("$(basename).ts", ".env"), ".env.ts");
    }

    #[test]
    fn absolute_glob_detection() {
        assert!(is_absolute_glob("/var/log/**"));
        assert!(is_absolute_glob("C:/Users/**"));
        assert!(is_absolute_glob("\\\\server\\share\\**"));
        assert!(!is_absolute_glob("**/node_modules"));
        assert!(!is_absolute_glob("src/**"));
    }
}
