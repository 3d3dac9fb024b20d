//! In-memory directory tree for post-filtering streamed file listings.
//!
//! External listing tools cannot evaluate sibling clauses, so when an
//! exclude expression carries any, the walker collects the tool's output
//! into this tree and replays it with full sibling information.

use std::collections::{HashMap, HashSet};

use crate::glob::CompiledExpression;
use crate::query::leafname;

/// One file or directory seen in the streamed listing.
#[derive(Debug, Clone)]
pub struct TreeEntry {
    pub relative_path: String,
    pub basename: String,
}

/// Two-level tree: the root's entries plus a map from each relative
/// directory path to the entries directly inside it.
#[derive(Debug, Default)]
pub struct DirectoryTree {
    root_entries: Vec<TreeEntry>,
    path_to_entries: HashMap<String, Vec<TreeEntry>>,
    known: HashSet<String>,
}

impl DirectoryTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.root_entries.is_empty()
    }

    /// Inserts a streamed relative file path, creating intermediate
    /// directory entries on first sight. Paths arrive in backend emission
    /// order and that order is preserved per directory.
    pub fn add(&mut self, relative_path: &str) {
        let mut start = 0usize;
        while let Some(offset) = relative_path[start..].find('/') {
            let end = start + offset;
            let dir = &relative_path[..end];
            start = end + 1;
            if !self.known.insert(dir.to_string()) {
                continue;
            }
            self.insert_entry(dir);
            self.path_to_entries.entry(dir.to_string()).or_default();
        }
        if self.known.insert(relative_path.to_string()) {
            self.insert_entry(relative_path);
        }
    }

    fn insert_entry(&mut self, relative_path: &str) {
        let entry = TreeEntry {
            relative_path: relative_path.to_string(),
            basename: leafname(relative_path).to_string(),
        };
        match relative_path.rfind('/') {
            Some(split) => self
                .path_to_entries
                .entry(relative_path[..split].to_string())
                .or_default()
                .push(entry),
            None => self.root_entries.push(entry),
        }
    }

    /// Walks the tree depth-first, applying the exclude expression with
    /// sibling information, and reports every surviving file.
    ///
    /// A file whose relative path equals `literal_file_pattern` is reported
    /// even when a sibling clause would exclude it; users who typed an exact
    /// path mean it.
    pub fn match_tree(
        &self,
        excludes: &CompiledExpression,
        literal_file_pattern: Option<&str>,
        on_file: &mut dyn FnMut(&TreeEntry) -> bool,
    ) {
        self.walk_entries(&self.root_entries, excludes, literal_file_pattern, on_file);
    }

    fn walk_entries(
        &self,
        entries: &[TreeEntry],
        excludes: &CompiledExpression,
        literal_file_pattern: Option<&str>,
        on_file: &mut dyn FnMut(&TreeEntry) -> bool,
    ) -> bool {
        // One sibling set serves every entry of this directory.
        let siblings: HashSet<&str> = entries
            .iter()
            .map(|entry| entry.basename.as_str())
            .collect();

        for entry in entries {
            let excluded = excludes.matches_with_siblings(
                &entry.relative_path,
                &entry.basename,
                &mut |name| siblings.contains(name),
            );

            match self.path_to_entries.get(&entry.relative_path) {
                Some(children) => {
                    if excluded {
                        continue;
                    }
                    if !self.walk_entries(children, excludes, literal_file_pattern, on_file) {
                        return false;
                    }
                }
                None => {
                    if excluded && literal_file_pattern != Some(entry.relative_path.as_str()) {
                        continue;
                    }
                    if !on_file(entry) {
                        return false;
                    }
                }
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::{glob_expression, GlobExpression, GlobValue, SiblingClause};

    fn collect(tree: &DirectoryTree, excludes: &CompiledExpression) -> Vec<String> {
        let mut files = Vec::new();
        tree.match_tree(excludes, None, &mut |entry| {
            files.push(entry.relative_path.clone());
            true
        });
        files
    }

    #[test]
    fn preserves_emission_order() {
        let mut tree = DirectoryTree::new();
        for path in ["b.txt", "a/inner.txt", "a.txt"] {
            tree.add(path);
        }
        let files = collect(&tree, &CompiledExpression::empty());
        assert_eq!(files, vec!["b.txt", "a/inner.txt", "a.txt"]);
    }

    #[test]
    fn excluded_directory_prunes_subtree() {
        let mut tree = DirectoryTree::new();
        tree.add("src/main.rs");
        tree.add("target/debug/out");
        let excludes = CompiledExpression::compile(&glob_expression(["**/target"]));
        assert_eq!(collect(&tree, &excludes), vec!["src/main.rs"]);
    }

    #[test]
    fn sibling_clause_uses_directory_listing() {
        let mut expression = GlobExpression::new();
        expression.insert(
            "**/*.js".to_string(),
            GlobValue::Sibling(SiblingClause {
                when: "$(basename).ts".to_string(),
            }),
        );
        let excludes = CompiledExpression::compile(&expression);

        let mut tree = DirectoryTree::new();
        tree.add("src/app.js");
        tree.add("src/app.ts");
        tree.add("src/lone.js");
        assert_eq!(
            collect(&tree, &excludes),
            vec!["src/app.ts", "src/lone.js"]
        );
    }

    #[test]
    fn literal_pattern_overrides_exclusion() {
        let mut expression = GlobExpression::new();
        expression.insert(
            "**/*.js".to_string(),
            GlobValue::Sibling(SiblingClause {
                when: "$(basename).ts".to_string(),
            }),
        );
        let excludes = CompiledExpression::compile(&expression);

        let mut tree = DirectoryTree::new();
        tree.add("src/app.js");
        tree.add("src/app.ts");

        let mut files = Vec::new();
        tree.match_tree(&excludes, Some("src/app.js"), &mut |entry| {
            files.push(entry.relative_path.clone());
            true
        });
        assert_eq!(files, vec!["src/app.js", "src/app.ts"]);
    }

    #[test]
    fn stops_when_callback_declines() {
        let mut tree = DirectoryTree::new();
        tree.add("a.txt");
        tree.add("b.txt");
        tree.add("c.txt");

        let mut seen = 0usize;
        tree.match_tree(&CompiledExpression::empty(), None, &mut |_| {
            seen += 1;
            seen < 2
        });
        assert_eq!(seen, 2);
    }
}
