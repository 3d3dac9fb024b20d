//! Streaming decoder for colorized search-tool output.
//!
//! The child process is configured so that file headers and line numbers are
//! wrapped in reset sequences and match runs are wrapped in
//! [`MATCH_START`]/[`MATCH_END`]:
//!
//! ```text
//! ESC[0m<path>ESC[0m
//! ESC[0m<1-based line number>ESC[0m:<line text with match markers>
//! ```
//!
//! Chunks arrive as raw bytes. Incomplete trailing UTF-8 sequences are
//! carried into the next chunk, then lines are split on `\r?\n` with the
//! last (possibly incomplete) line carried forward. Matches within a line
//! are scanned with a small outside-match / inside-match state machine.

use std::path::PathBuf;

use memchr::memchr;

use crate::error::{Result, SearchError};
use crate::progress::{FileMatch, MatchPreview, OneLineRange, TextMatch};
use crate::query::PreviewOptions;

/// Start of a match run: reset followed by red foreground.
pub const MATCH_START: &str = "\u{1b}[0m\u{1b}[31m";
/// End of a match run.
pub const MATCH_END: &str = "\u{1b}[0m";

const RESET: &str = "\u{1b}[0m";
const BOM: char = '\u{feff}';

/// Emits one [`FileMatch`] per file, with that file's matches complete and
/// in output order before the next file begins.
pub struct GrepOutputParser {
    previews: PreviewOptions,
    max_results: Option<usize>,
    /// File to attribute headerless matches to; set when the query searched
    /// a single loose file, for which no header is printed.
    fallback_file: Option<PathBuf>,
    carry_bytes: Vec<u8>,
    carry_line: String,
    current: Option<PendingFile>,
    num_results: usize,
    hit_limit: bool,
}

struct PendingFile {
    path: String,
    matches: Vec<TextMatch>,
}

impl GrepOutputParser {
    pub fn new(previews: PreviewOptions, max_results: Option<usize>) -> Self {
        Self {
            previews,
            max_results,
            fallback_file: None,
            carry_bytes: Vec::new(),
            carry_line: String::new(),
            current: None,
            num_results: 0,
            hit_limit: false,
        }
    }

    pub fn with_fallback_file(mut self, path: PathBuf) -> Self {
        self.fallback_file = Some(path);
        self
    }

    /// True once the result cap was reached; the caller should stop the
    /// producer.
    pub fn hit_limit(&self) -> bool {
        self.hit_limit
    }

    /// Matches decoded so far, capped matches included.
    pub fn result_count(&self) -> usize {
        self.num_results
    }

    /// Feeds one chunk of child output.
    pub fn on_data(
        &mut self,
        bytes: &[u8],
        emit: &mut dyn FnMut(FileMatch),
    ) -> Result<()> {
        if self.hit_limit {
            return Ok(());
        }
        let decoded = self.decode_chunk(bytes);
        let mut text = std::mem::take(&mut self.carry_line);
        text.push_str(&decoded);

        let mut start = 0usize;
        while let Some(offset) = memchr(b'\n', &text.as_bytes()[start..]) {
            let end = start + offset;
            let line = text[start..end]
                .strip_suffix('\r')
                .unwrap_or(&text[start..end]);
            self.handle_line(line, emit)?;
            start = end + 1;
            if self.hit_limit {
                return Ok(());
            }
        }
        self.carry_line = text[start..].to_string();
        Ok(())
    }

    /// Flushes the pending file after the producer is done. The carried
    /// final line, if any, is processed first.
    pub fn flush(&mut self, emit: &mut dyn FnMut(FileMatch)) -> Result<()> {
        if !self.carry_line.is_empty() && !self.hit_limit {
            let line = std::mem::take(&mut self.carry_line);
            let text = line.strip_suffix('\r').unwrap_or(&line);
            self.handle_line(text, emit)?;
        }
        if let Some(pending) = self.current.take() {
            emit(pending.into_file_match());
        }
        Ok(())
    }

    /// Appends bytes to the UTF-8 carry buffer and decodes the longest valid
    /// prefix, leaving an incomplete trailing sequence for the next chunk.
    fn decode_chunk(&mut self, bytes: &[u8]) -> String {
        self.carry_bytes.extend_from_slice(bytes);
        let buffered = std::mem::take(&mut self.carry_bytes);
        match std::str::from_utf8(&buffered) {
            Ok(text) => text.to_string(),
            Err(error) => {
                let valid = error.valid_up_to();
                let mut decoded =
                    String::from_utf8_lossy(&buffered[..valid]).into_owned();
                match error.error_len() {
                    // Incomplete trailing sequence: keep for the next chunk.
                    None => self.carry_bytes = buffered[valid..].to_vec(),
                    // Invalid sequence mid-stream: substitute and move on.
                    Some(bad) => {
                        decoded.push(char::REPLACEMENT_CHARACTER);
                        let rest = &buffered[valid + bad..];
                        decoded.push_str(&self.recurse_decode(rest));
                    }
                }
                decoded
            }
        }
    }

    fn recurse_decode(&mut self, rest: &[u8]) -> String {
        if rest.is_empty() {
            String::new()
        } else {
            self.decode_chunk(rest)
        }
    }

    fn handle_line(&mut self, line: &str, emit: &mut dyn FnMut(FileMatch)) -> Result<()> {
        if line.is_empty() {
            return Ok(());
        }

        if let Some(path) = parse_file_header(line) {
            if let Some(pending) = self.current.take() {
                emit(pending.into_file_match());
            }
            self.current = Some(PendingFile {
                path: path.to_string(),
                matches: Vec::new(),
            });
            return Ok(());
        }

        let Some((line_number, content)) = parse_result_line(line) else {
            // Context or unrecognized output is ignored; only headers and
            // numbered result lines carry matches.
            return Ok(());
        };

        if self.current.is_none() {
            match &self.fallback_file {
                Some(path) => {
                    self.current = Some(PendingFile {
                        path: path.to_string_lossy().into_owned(),
                        matches: Vec::new(),
                    });
                }
                None => {
                    return Err(SearchError::Protocol(
                        "match data received before any file header".to_string(),
                    ))
                }
            }
        }

        let line0 = line_number - 1;
        let content = if line0 == 0 {
            content.strip_prefix(BOM).unwrap_or(content)
        } else {
            content
        };

        let (preview_full, ranges) = scan_match_line(content);
        if ranges.is_empty() {
            return Ok(());
        }

        let mut kept = Vec::new();
        for range in ranges {
            self.num_results += 1;
            kept.push(range);
            if let Some(max) = self.max_results {
                if self.num_results >= max {
                    self.hit_limit = true;
                    break;
                }
            }
        }

        let pending = self
            .current
            .as_mut()
            .expect("pending file was just ensured");
        pending
            .matches
            .extend(build_matches(&preview_full, &kept, line0, &self.previews));

        if self.hit_limit {
            // Finish the line, emit the file, and let the driver stop the
            // child.
            if let Some(pending) = self.current.take() {
                emit(pending.into_file_match());
            }
        }
        Ok(())
    }
}

impl PendingFile {
    fn into_file_match(self) -> FileMatch {
        FileMatch::with_matches(self.path, self.matches)
    }
}

// ---------------------------------------------------------------------------
// Line classification
// ---------------------------------------------------------------------------

/// `ESC[0m<path>ESC[0m` with no escapes inside the path.
fn parse_file_header(line: &str) -> Option<&str> {
    let inner = line.strip_prefix(RESET)?.strip_suffix(RESET)?;
    if inner.is_empty() || inner.contains('\u{1b}') {
        return None;
    }
    Some(inner)
}

/// `ESC[0m<digits>ESC[0m:<content>`; returns the 1-based line number and the
/// content with match markers still embedded.
fn parse_result_line(line: &str) -> Option<(usize, &str)> {
    let rest = line.strip_prefix(RESET)?;
    let marker = rest.find(RESET)?;
    let digits = &rest[..marker];
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let after = &rest[marker + RESET.len()..];
    let content = after.strip_prefix(':')?;
    let line_number: usize = digits.parse().ok()?;
    if line_number == 0 {
        return None;
    }
    Some((line_number, content))
}

// ---------------------------------------------------------------------------
// Match-run scanning
// ---------------------------------------------------------------------------

/// Walks a result line, stripping markers while accumulating real byte
/// positions. Returns the stripped preview text and the match ranges within
/// it.
///
/// A line that ends inside a match (the `\r`-before-newline case, or a match
/// reaching end of line) gets a synthetic match end.
fn scan_match_line(content: &str) -> (String, Vec<(usize, usize)>) {
    let mut preview = String::with_capacity(content.len());
    let mut ranges = Vec::new();
    let mut inside: Option<usize> = None;
    let mut rest = content;

    while !rest.is_empty() {
        if inside.is_none() {
            if let Some(stripped) = rest.strip_prefix(MATCH_START) {
                inside = Some(preview.len());
                rest = stripped;
                continue;
            }
        } else if let Some(stripped) = rest.strip_prefix(MATCH_END) {
            let start = inside.take().expect("inside-match state has a start");
            ranges.push((start, preview.len()));
            rest = stripped;
            continue;
        }
        let ch = rest.chars().next().expect("nonempty remainder");
        preview.push(ch);
        rest = &rest[ch.len_utf8()..];
    }

    if let Some(start) = inside {
        ranges.push((start, preview.len()));
    }
    (preview, ranges)
}

/// Builds wire matches for one line, applying preview truncation around the
/// matched region.
fn build_matches(
    preview_full: &str,
    ranges: &[(usize, usize)],
    line0: usize,
    previews: &PreviewOptions,
) -> Vec<TextMatch> {
    let first_start = ranges.first().map(|(start, _)| *start).unwrap_or(0);
    let last_end = ranges
        .last()
        .map(|(_, end)| *end)
        .unwrap_or(preview_full.len());

    let head = floor_char_boundary(
        preview_full,
        first_start.saturating_sub(previews.chars_before),
    );
    let tail = ceil_char_boundary(
        preview_full,
        (last_end + previews.chars_after).min(preview_full.len()),
    );
    let text = preview_full[head..tail].to_string();

    ranges
        .iter()
        .map(|&(start, end)| TextMatch {
            preview: MatchPreview {
                text: text.clone(),
                matches: vec![OneLineRange::new(line0, start - head, end - head)],
            },
            range: OneLineRange::new(line0, start, end),
        })
        .collect()
}

fn floor_char_boundary(text: &str, mut index: usize) -> usize {
    index = index.min(text.len());
    while index > 0 && !text.is_char_boundary(index) {
        index -= 1;
    }
    index
}

fn ceil_char_boundary(text: &str, mut index: usize) -> usize {
    index = index.min(text.len());
    while index < text.len() && !text.is_char_boundary(index) {
        index += 1;
    }
    index
}
