//! Document splitting.
//!
//! Two parent-splitting strategies:
//! - `fixed`: overlapping character windows snapped back to natural
//!   boundaries (paragraph break, then sentence end, then whitespace) so
//!   chunks don't cut words in half.
//! - `semantic`: sentences are embedded and a breakpoint is inserted
//!   wherever adjacent-sentence similarity drops below a percentile
//!   threshold; oversized segments are re-split with the fixed strategy.
//!
//! Children are always fixed windows over their parent.

use anyhow::Result;

use crate::config::ChunkingConfig;
use crate::gateway::{cosine_similarity, Embedder};

/// Split `text` into overlapping windows of at most `size` chars, snapping
/// each window end back to the nearest natural boundary. Consecutive windows
/// share roughly `overlap` characters.
pub fn split_fixed(text: &str, size: usize, overlap: usize) -> Vec<String> {
    let text = text.trim();
    if text.is_empty() || size == 0 {
        return Vec::new();
    }
    if text.len() <= size {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut start = 0usize;

    while start < text.len() {
        let hard_end = (start + size).min(text.len());
        let end = if hard_end == text.len() {
            hard_end
        } else {
            snap_boundary(text, start, hard_end)
        };

        let piece = text[start..end].trim();
        if !piece.is_empty() {
            chunks.push(piece.to_string());
        }

        if end == text.len() {
            break;
        }
        // Advance relative to the snapped end so overlap stays meaningful
        // even when snapping shortened the window.
        start = end.saturating_sub(overlap).max(start + 1);
        start = align_char_boundary(text, start);
    }

    chunks
}

/// Pick the best split point in `(start, hard_end]`: paragraph break, then
/// sentence end, then whitespace, else the hard cut. Only boundaries in the
/// back half of the window are considered, to avoid degenerate tiny chunks.
fn snap_boundary(text: &str, start: usize, hard_end: usize) -> usize {
    let hard_end = align_char_boundary(text, hard_end);
    let window = &text[start..hard_end];
    let min_offset = window.len() / 2;

    if let Some(pos) = window.rfind("\n\n") {
        if pos >= min_offset {
            return start + pos;
        }
    }
    for pat in [". ", "! ", "? ", ".\n"] {
        if let Some(pos) = window.rfind(pat) {
            if pos >= min_offset {
                return start + pos + pat.len();
            }
        }
    }
    if let Some(pos) = window.rfind(char::is_whitespace) {
        if pos >= min_offset {
            return start + pos;
        }
    }
    hard_end
}

fn align_char_boundary(text: &str, mut idx: usize) -> usize {
    while idx < text.len() && !text.is_char_boundary(idx) {
        idx += 1;
    }
    idx.min(text.len())
}

fn split_sentences(text: &str) -> Vec<String> {
    let mut sentences = Vec::new();
    let mut current = String::new();
    for line in text.split_inclusive(['.', '!', '?', '\n']) {
        current.push_str(line);
        if current.trim().len() >= 20 || line.ends_with('\n') {
            let s = current.trim();
            if !s.is_empty() {
                sentences.push(s.to_string());
            }
            current.clear();
        }
    }
    let tail = current.trim();
    if !tail.is_empty() {
        sentences.push(tail.to_string());
    }
    sentences
}

/// Split `text` at embedding-similarity breakpoints.
///
/// Adjacent sentences are scored with cosine similarity; a breakpoint is
/// inserted wherever the similarity falls below the `percentile`-th
/// percentile of all adjacent similarities. Any resulting segment larger
/// than `max_chars` is re-split with [`split_fixed`]. Embedding failure
/// degrades to the fixed strategy.
pub async fn split_semantic(
    embedder: &dyn Embedder,
    text: &str,
    max_chars: usize,
    overlap: usize,
    percentile: f64,
) -> Vec<String> {
    let sentences = split_sentences(text);
    if sentences.len() < 3 {
        return split_fixed(text, max_chars, overlap);
    }

    let vectors = match embedder.embed(&sentences).await {
        Ok(v) if v.len() == sentences.len() => v,
        Ok(_) | Err(_) => {
            tracing::warn!("Semantic splitting unavailable, falling back to fixed windows");
            return split_fixed(text, max_chars, overlap);
        }
    };

    let similarities: Vec<f32> = vectors
        .windows(2)
        .map(|pair| cosine_similarity(&pair[0], &pair[1]))
        .collect();

    let threshold = {
        let mut sorted = similarities.clone();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let idx = ((100.0 - percentile) / 100.0 * (sorted.len() - 1) as f64).round() as usize;
        sorted[idx.min(sorted.len() - 1)]
    };

    let mut segments = Vec::new();
    let mut current = String::new();
    for (i, sentence) in sentences.iter().enumerate() {
        if !current.is_empty() {
            current.push(' ');
        }
        current.push_str(sentence);
        let break_here = i < similarities.len() && similarities[i] < threshold;
        if break_here || current.len() >= max_chars {
            segments.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        segments.push(current);
    }

    segments
        .into_iter()
        .flat_map(|seg| {
            if seg.len() > max_chars {
                split_fixed(&seg, max_chars, overlap)
            } else {
                vec![seg]
            }
        })
        .collect()
}

/// Split one document into parent passages according to `config`.
pub async fn split_parents(
    embedder: &dyn Embedder,
    config: &ChunkingConfig,
    text: &str,
) -> Result<Vec<String>> {
    let parents = match config.strategy.as_str() {
        "semantic" => {
            split_semantic(
                embedder,
                text,
                config.parent_chars,
                config.parent_overlap,
                config.semantic_percentile,
            )
            .await
        }
        _ => split_fixed(text, config.parent_chars, config.parent_overlap),
    };
    Ok(parents)
}

/// Split one parent passage into overlapping child passages.
pub fn split_children(config: &ChunkingConfig, parent: &str) -> Vec<String> {
    split_fixed(parent, config.child_chars, config.child_overlap)
}
