//! Length-constrained thread splitting
//!
//! Splits arbitrary text into an ordered sequence of segments, each
//! within a caller-supplied length budget under a caller-supplied
//! counting function, appending " i/N" counters when splitting
//! actually occurs. Pure and total: no side effects, no failures for
//! any input, identical input always yields identical output.

use unicode_segmentation::UnicodeSegmentation;

/// Clusters reserved per window during splitting so the counter
/// suffix fits without re-splitting.
pub const COUNTER_RESERVE: usize = 6;

/// A soft break candidate must retain at least this share of the
/// greedy-fill window, otherwise the window hard-breaks.
const SOFT_BREAK_RETENTION_PCT: usize = 55;

/// Fixed counted weight of a link-like token under [`weighted_len`].
const LINK_WEIGHT: usize = 23;

/// Split `text` into segments of at most `max_len` as measured by
/// `count`, with the default counter reserve.
pub fn segment(text: &str, max_len: usize, count: &dyn Fn(&str) -> usize) -> Vec<String> {
    segment_with_reserve(text, max_len, count, COUNTER_RESERVE)
}

/// Like [`segment`], with an explicit per-window counter reserve.
pub fn segment_with_reserve(
    text: &str,
    max_len: usize,
    count: &dyn Fn(&str) -> usize,
    reserve: usize,
) -> Vec<String> {
    let trimmed = text.trim();
    if count(trimmed) <= max_len {
        return vec![trimmed.to_string()];
    }

    let budget = max_len.saturating_sub(reserve).max(1);

    let mut windows: Vec<String> = Vec::new();
    let mut rest = trimmed;
    loop {
        rest = rest.trim_start();
        if rest.is_empty() {
            break;
        }
        if count(rest) <= budget {
            push_window(&mut windows, rest);
            break;
        }
        match close_window(rest, budget, count) {
            WindowBreak::Soft(end) => {
                push_window(&mut windows, &rest[..end]);
                rest = &rest[end..];
            }
            WindowBreak::Hard(end) => {
                // No break point retains enough of this window: close
                // at the maximum fitting cluster. When this is the
                // first window the text is effectively unbreakable and
                // the single-window rule below hard-trims it; later
                // windows keep the remainder flowing into the thread.
                push_window(&mut windows, &rest[..end]);
                if windows.len() <= 1 {
                    break;
                }
                rest = &rest[end..];
            }
        }
    }

    if windows.len() <= 1 {
        let only = windows.pop().unwrap_or_default();
        return vec![hard_trim(&only, max_len, count)];
    }

    let n = windows.len();
    windows
        .iter()
        .enumerate()
        .map(|(i, window)| {
            let suffix = format!(" {}/{}", i + 1, n);
            let body_budget = max_len.saturating_sub(count(&suffix));
            format!("{}{}", hard_trim(window, body_budget, count), suffix)
        })
        .collect()
}

enum WindowBreak {
    /// Break at a whitespace/punctuation boundary (byte offset).
    Soft(usize),
    /// Break at the maximum fitting grapheme cluster (byte offset).
    Hard(usize),
}

fn push_window(windows: &mut Vec<String>, window: &str) {
    let window = window.trim();
    if !window.is_empty() {
        windows.push(window.to_string());
    }
}

/// Find where to close the next window of `rest` under `budget`.
///
/// Scans grapheme clusters greedily, remembering the last candidate
/// break point (after whitespace or sentence punctuation). The
/// candidate wins only if it retains at least
/// [`SOFT_BREAK_RETENTION_PCT`] of the greedy fill.
fn close_window(rest: &str, budget: usize, count: &dyn Fn(&str) -> usize) -> WindowBreak {
    let mut greedy_end = 0usize;
    let mut greedy_count = 0usize;
    // (byte end, counted length) of the last soft candidate seen
    let mut soft: Option<(usize, usize)> = None;

    for (start, cluster) in rest.grapheme_indices(true) {
        let end = start + cluster.len();
        let counted = count(&rest[..end]);
        if counted > budget {
            break;
        }
        greedy_end = end;
        greedy_count = counted;
        if is_break_cluster(cluster) {
            soft = Some((end, counted));
        }
    }

    if greedy_end == 0 {
        // Even the first cluster exceeds the budget; never cut inside
        // a multi-codepoint cluster.
        let first = rest
            .graphemes(true)
            .next()
            .map(|g| g.len())
            .unwrap_or(rest.len());
        return WindowBreak::Hard(first);
    }

    if let Some((end, counted)) = soft {
        if counted * 100 >= greedy_count * SOFT_BREAK_RETENTION_PCT {
            return WindowBreak::Soft(end);
        }
    }

    WindowBreak::Hard(greedy_end)
}

fn is_break_cluster(cluster: &str) -> bool {
    let mut chars = cluster.chars();
    match (chars.next(), chars.next()) {
        (Some(c), None) => c.is_whitespace() || matches!(c, '.' | '!' | '?' | ',' | ';' | ':'),
        _ => false,
    }
}

/// Trim `text` to the largest grapheme prefix whose count fits
/// `limit`. Used for the single-window fallback and for making room
/// for counter suffixes.
fn hard_trim(text: &str, limit: usize, count: &dyn Fn(&str) -> usize) -> String {
    let text = text.trim();
    if count(text) <= limit {
        return text.to_string();
    }

    let mut end = 0usize;
    for (start, cluster) in text.grapheme_indices(true) {
        let candidate = start + cluster.len();
        if count(&text[..candidate]) > limit {
            break;
        }
        end = candidate;
    }
    text[..end].trim_end().to_string()
}

/// Raw grapheme-cluster count.
pub fn grapheme_len(text: &str) -> usize {
    text.graphemes(true).count()
}

/// Weighted count: link-like tokens cost a fixed [`LINK_WEIGHT`], wide
/// (CJK-range) characters cost two, everything else one. Whitespace
/// between tokens counts one per character.
pub fn weighted_len(text: &str) -> usize {
    let mut total = 0usize;
    let mut rest = text;
    while !rest.is_empty() {
        let ws_end = rest
            .find(|c: char| !c.is_whitespace())
            .unwrap_or(rest.len());
        total += rest[..ws_end].chars().count();
        rest = &rest[ws_end..];
        if rest.is_empty() {
            break;
        }

        let token_end = rest
            .find(|c: char| c.is_whitespace())
            .unwrap_or(rest.len());
        let token = &rest[..token_end];
        if token.starts_with("http://") || token.starts_with("https://") {
            total += LINK_WEIGHT;
        } else {
            total += token
                .chars()
                .map(|c| if is_wide(c) { 2 } else { 1 })
                .sum::<usize>();
        }
        rest = &rest[token_end..];
    }
    total
}

fn is_wide(c: char) -> bool {
    matches!(u32::from(c),
        0x1100..=0x115F
            | 0x2E80..=0xA4CF
            | 0xAC00..=0xD7A3
            | 0xF900..=0xFAFF
            | 0xFE30..=0xFE4F
            | 0xFF00..=0xFF60
            | 0xFFE0..=0xFFE6
            | 0x20000..=0x2FFFD
            | 0x30000..=0x3FFFD
    )
}
