//! Fuzzy scoring and ranked selection for file results.
//!
//! Scoring uses ASCII case folding and a greedy leftmost subsequence match.
//! Selection keeps the top K candidates in a bounded binary heap, so ranking
//! N candidates costs O(N log K) without sorting the tail.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};

use crate::query::RawFileMatch;

/// Memoized scores, keyed on `(candidate relative path, query pattern)`.
/// Append-only for the life of its owning cache.
pub type ScoreMemo = HashMap<(String, String), Option<i64>>;

// ---------------------------------------------------------------------------
// Scoring
// ---------------------------------------------------------------------------

const BONUS_START_OF_STRING: i64 = 8;
const BONUS_CONTIGUOUS: i64 = 4;
const BONUS_WORD_BOUNDARY: i64 = 2;
const BONUS_EXACT: i64 = 1 << 20;
const SCORE_SCALE: i64 = 8;

/// True when every pattern character appears in order in the candidate.
/// An empty pattern matches everything.
pub fn matches_fuzzy(pattern_lower: &str, candidate: &str) -> bool {
    let mut pattern = pattern_lower.chars();
    let Some(mut wanted) = pattern.next() else {
        return true;
    };
    for ch in candidate.chars() {
        if ch.to_ascii_lowercase() == wanted {
            match pattern.next() {
                Some(next) => wanted = next,
                None => return true,
            }
        }
    }
    false
}

/// Scores a candidate string against a lowercased pattern.
///
/// `None` when the pattern is not a subsequence of the candidate. Higher is
/// better. The score rewards matches at the start of the string, contiguous
/// runs, and word-boundary hits, and penalizes gaps and long candidates.
pub fn score_str(pattern_lower: &str, candidate: &str) -> Option<i64> {
    if pattern_lower.is_empty() {
        return Some(0);
    }

    let chars: Vec<char> = candidate.chars().collect();
    let mut positions = Vec::with_capacity(pattern_lower.chars().count());
    let mut pattern = pattern_lower.chars();
    let mut wanted = pattern.next()?;

    for (index, ch) in chars.iter().enumerate() {
        if ch.to_ascii_lowercase() == wanted {
            positions.push(index);
            match pattern.next() {
                Some(next) => wanted = next,
                None => break,
            }
        }
    }
    if positions.len() < pattern_lower.chars().count() {
        return None;
    }

    let mut score = 0i64;
    for (i, &position) in positions.iter().enumerate() {
        if position == 0 {
            score += BONUS_START_OF_STRING;
        } else if is_word_boundary(chars[position - 1]) {
            score += BONUS_WORD_BOUNDARY;
        }
        if i > 0 && positions[i - 1] + 1 == position {
            score += BONUS_CONTIGUOUS;
        }
    }

    let span = positions[positions.len() - 1] - positions[0] + 1;
    let gaps = (span - positions.len()) as i64;
    score -= gaps;

    let mut total = score * SCORE_SCALE - chars.len() as i64;
    if chars.len() == pattern_lower.chars().count()
        && chars
            .iter()
            .zip(pattern_lower.chars())
            .all(|(c, p)| c.to_ascii_lowercase() == p)
    {
        total += BONUS_EXACT;
    }
    Some(total)
}

fn is_word_boundary(previous: char) -> bool {
    matches!(previous, '/' | '\\' | '_' | '-' | '.' | ' ')
}

/// Scores a raw file match, preferring basename hits over path-only hits.
pub fn score_candidate(pattern_lower: &str, candidate: &RawFileMatch) -> Option<i64> {
    let path_score = score_str(pattern_lower, &candidate.relative_path);
    let basename_score =
        score_str(pattern_lower, &candidate.basename).map(|score| score * 2);
    match (basename_score, path_score) {
        (Some(b), Some(p)) => Some(b.max(p)),
        (Some(b), None) => Some(b),
        (None, Some(p)) => Some(p),
        (None, None) => None,
    }
}

/// Memoizing wrapper around [`score_candidate`].
pub fn score_candidate_memo(
    memo: &mut ScoreMemo,
    pattern_lower: &str,
    candidate: &RawFileMatch,
) -> Option<i64> {
    let key = (candidate.relative_path.clone(), pattern_lower.to_string());
    if let Some(score) = memo.get(&key) {
        return *score;
    }
    let score = score_candidate(pattern_lower, candidate);
    memo.insert(key, score);
    score
}

// ---------------------------------------------------------------------------
// Ranked selection
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct Ranked {
    score: i64,
    candidate: RawFileMatch,
}

impl Ranked {
    /// Total order: higher score first, then shorter path, then descending
    /// path text. Deterministic, so ranking twice is stable.
    fn ordering(&self, other: &Self) -> Ordering {
        self.score
            .cmp(&other.score)
            .then_with(|| {
                other
                    .candidate
                    .relative_path
                    .len()
                    .cmp(&self.candidate.relative_path.len())
            })
            .then_with(|| {
                self.candidate
                    .relative_path
                    .cmp(&other.candidate.relative_path)
            })
    }
}

impl PartialEq for Ranked {
    fn eq(&self, other: &Self) -> bool {
        self.ordering(other) == Ordering::Equal
    }
}

impl Eq for Ranked {}

impl PartialOrd for Ranked {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Ranked {
    fn cmp(&self, other: &Self) -> Ordering {
        self.ordering(other)
    }
}

/// Comparator for full result lists: orders the better candidate first.
/// Non-matching candidates sink to the end.
pub fn compare(
    a: &RawFileMatch,
    b: &RawFileMatch,
    pattern_lower: &str,
    memo: &mut ScoreMemo,
) -> Ordering {
    let ranked_a = Ranked {
        score: score_candidate_memo(memo, pattern_lower, a).unwrap_or(i64::MIN),
        candidate: a.clone(),
    };
    let ranked_b = Ranked {
        score: score_candidate_memo(memo, pattern_lower, b).unwrap_or(i64::MIN),
        candidate: b.clone(),
    };
    ranked_b.cmp(&ranked_a)
}

/// Selects the `limit` best-scoring candidates for `pattern`, best first.
/// Also returns how many candidates matched the pattern at all, so callers
/// can tell whether the limit cut anything off.
///
/// Candidates that do not match the pattern are dropped. Scores are read
/// through (and recorded into) `memo`.
pub fn top_scored(
    candidates: &[RawFileMatch],
    pattern: &str,
    limit: usize,
    memo: &mut ScoreMemo,
) -> (Vec<RawFileMatch>, usize) {
    let pattern_lower = pattern.to_ascii_lowercase();

    let mut heap: BinaryHeap<std::cmp::Reverse<Ranked>> = BinaryHeap::new();
    let mut matched = 0usize;
    for candidate in candidates {
        let Some(score) = score_candidate_memo(memo, &pattern_lower, candidate) else {
            continue;
        };
        matched += 1;
        if limit == 0 {
            continue;
        }
        let ranked = Ranked {
            score,
            candidate: candidate.clone(),
        };
        if heap.len() < limit {
            heap.push(std::cmp::Reverse(ranked));
            continue;
        }
        if let Some(std::cmp::Reverse(worst)) = heap.peek() {
            if ranked > *worst {
                heap.pop();
                heap.push(std::cmp::Reverse(ranked));
            }
        }
    }

    let mut rows: Vec<Ranked> = heap.into_iter().map(|std::cmp::Reverse(r)| r).collect();
    rows.sort_by(|a, b| b.cmp(a));
    (rows.into_iter().map(|row| row.candidate).collect(), matched)
}
