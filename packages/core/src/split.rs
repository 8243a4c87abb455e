//! Deterministic batch allocation and context-aware text splitting.
//!
//! Two pure algorithm families used by the partition engine:
//! - [`allocate_batch()`]: capacity-weighted batch distribution with
//!   min/max clamping and deterministic leftover placement
//! - [`split_sentences()`] / [`split_text()`]: punctuation-boundary
//!   sentence splitting with greedy accumulation and context overlap

use std::sync::OnceLock;

use regex::Regex;

use crate::error::CoreError;

// ---------------------------------------------------------------------------
// Batch allocation
// ---------------------------------------------------------------------------

/// Result of a capacity-weighted batch allocation.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchAllocation {
    /// Items assigned to each node, same order as the input scores.
    pub sizes: Vec<u32>,
    /// Normalized capacity weights, same order as the input scores.
    pub weights: Vec<f64>,
    /// `sum_i (1 - |a_i/B - w_i|) * w_i` in `[0, 1]`. Emitted for
    /// observability; 1.0 means allocation matched weights exactly.
    pub efficiency: f64,
}

/// Distributes `total` batch items across nodes proportionally to their
/// capacity scores.
///
/// Initial allocation is `round(total * w_i)` clamped to
/// `[min_size, max_size]`. Leftover items (positive or negative after
/// rounding and clamping) are settled deterministically starting from the
/// last node with remaining headroom, so repeated runs over the same inputs
/// produce identical plans.
///
/// A `total` of zero yields an empty allocation, not an error.
///
/// # Errors
///
/// Returns [`CoreError::InvalidAllocation`] when no scores are given, when
/// the score sum is not positive, or when the min/max bounds cannot absorb
/// the batch.
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn allocate_batch(
    total: u32,
    scores: &[f64],
    min_size: u32,
    max_size: u32,
) -> Result<BatchAllocation, CoreError> {
    if total == 0 {
        return Ok(BatchAllocation {
            sizes: Vec::new(),
            weights: Vec::new(),
            efficiency: 1.0,
        });
    }
    if scores.is_empty() {
        return Err(CoreError::InvalidAllocation(
            "no capacity scores".to_string(),
        ));
    }
    if min_size > max_size {
        return Err(CoreError::InvalidAllocation(format!(
            "min {min_size} exceeds max {max_size}"
        )));
    }

    let sum: f64 = scores.iter().sum();
    if sum <= 0.0 || !sum.is_finite() {
        return Err(CoreError::InvalidAllocation(format!(
            "capacity score sum {sum} is not positive"
        )));
    }

    let weights: Vec<f64> = scores.iter().map(|c| c / sum).collect();

    let mut sizes: Vec<u32> = weights
        .iter()
        .map(|w| {
            let ideal = (f64::from(total) * w).round() as u32;
            ideal.clamp(min_size, max_size)
        })
        .collect();

    // Settle rounding leftovers: walk from the last node toward the first,
    // growing or shrinking within [min_size, max_size].
    let mut assigned: i64 = sizes.iter().map(|&s| i64::from(s)).sum();
    let target = i64::from(total);

    for idx in (0..sizes.len()).rev() {
        if assigned == target {
            break;
        }
        if assigned < target {
            let headroom = i64::from(max_size) - i64::from(sizes[idx]);
            let take = headroom.min(target - assigned);
            if take > 0 {
                sizes[idx] += take as u32;
                assigned += take;
            }
        } else {
            let slack = i64::from(sizes[idx]) - i64::from(min_size);
            let give = slack.min(assigned - target);
            if give > 0 {
                sizes[idx] -= give as u32;
                assigned -= give;
            }
        }
    }

    if assigned != target {
        return Err(CoreError::InvalidAllocation(format!(
            "bounds [{min_size}, {max_size}] over {} nodes cannot absorb a batch of {total}",
            scores.len()
        )));
    }

    let efficiency = sizes
        .iter()
        .zip(weights.iter())
        .map(|(&a, &w)| (1.0 - (f64::from(a) / f64::from(total) - w).abs()) * w)
        .sum::<f64>()
        .clamp(0.0, 1.0);

    tracing::trace!(total, nodes = sizes.len(), efficiency, "batch allocated");
    Ok(BatchAllocation {
        sizes,
        weights,
        efficiency,
    })
}

// ---------------------------------------------------------------------------
// Sentence splitting
// ---------------------------------------------------------------------------

fn sentence_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    // A run of non-terminators followed by terminator punctuation, or a
    // trailing fragment with no terminator.
    RE.get_or_init(|| Regex::new(r"[^.!?]+[.!?]+|[^.!?]+$").expect("sentence regex is valid"))
}

/// Splits text into sentences at `.`, `!`, `?` boundaries.
///
/// A trailing fragment without terminal punctuation is kept as its own
/// sentence. Whitespace around sentences is trimmed; empty fragments are
/// dropped.
#[must_use]
pub fn split_sentences(text: &str) -> Vec<String> {
    sentence_regex()
        .find_iter(text)
        .map(|m| m.as_str().trim())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// A text fragment produced by the context-aware splitter.
#[derive(Debug, Clone, PartialEq)]
pub struct TextChunk {
    pub content: String,
    /// The sentence immediately before this chunk, present when overlap is
    /// requested and this is not the first chunk.
    pub context_before: Option<String>,
    /// The sentence immediately after this chunk, present when overlap is
    /// requested and this is not the last chunk.
    pub context_after: Option<String>,
}

/// Greedy sentence accumulator with optional single-sentence context
/// overlap.
///
/// Sentences are appended to a pending buffer; when appending the next
/// sentence would push the buffer past `max_size` characters, the buffer is
/// emitted as a chunk and a new one starts. A sentence longer than
/// `max_size` is emitted as its own chunk rather than dropped.
#[must_use]
pub fn split_text(text: &str, max_size: usize, overlap: usize) -> Vec<TextChunk> {
    let sentences = split_sentences(text);
    if sentences.is_empty() {
        return Vec::new();
    }

    // First pass: group sentence indices into chunks.
    let mut groups: Vec<(usize, usize)> = Vec::new(); // inclusive ranges
    let mut start = 0;
    let mut len = 0usize;
    for (i, sentence) in sentences.iter().enumerate() {
        let addition = if len == 0 {
            sentence.len()
        } else {
            len + 1 + sentence.len()
        };
        if len > 0 && addition > max_size {
            groups.push((start, i - 1));
            start = i;
            len = sentence.len();
        } else {
            len = addition;
        }
    }
    groups.push((start, sentences.len() - 1));

    // Second pass: materialize chunks with neighbour context.
    let last_group = groups.len() - 1;
    groups
        .iter()
        .enumerate()
        .map(|(gi, &(lo, hi))| {
            let content = sentences[lo..=hi].join(" ");
            let context_before = if overlap > 0 && gi > 0 {
                Some(sentences[lo - 1].clone())
            } else {
                None
            };
            let context_after = if overlap > 0 && gi < last_group {
                Some(sentences[hi + 1].clone())
            } else {
                None
            };
            TextChunk {
                content,
                context_before,
                context_after,
            }
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
