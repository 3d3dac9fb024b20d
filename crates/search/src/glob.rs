//! Include/exclude glob matching.
//!
//! Expressions come in from the query layer as glob-to-value maps and are
//! compiled once per search into [`CompiledExpression`]s, which the walker
//! and the text driver share.

pub mod expression;
pub mod segments;

pub use expression::{sibling_name, CompiledExpression, GlobMatch};
pub use segments::{expand_braces, wildcard_matches, GlobPattern};
