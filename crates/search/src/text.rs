//! Text search: a child search process drives the match stream.

pub mod driver;
pub mod parser;

pub use driver::TextSearchEngine;
pub use parser::{GrepOutputParser, MATCH_END, MATCH_START};
