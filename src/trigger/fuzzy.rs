//! Partial fuzzy similarity between a trigger phrase and a transcript

/// Similarity of two strings in `0.0..=1.0` based on insert/delete edits:
/// `2 * lcs / (len_a + len_b)`
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn ratio(a: &[char], b: &[char]) -> f64 {
    let total = a.len() + b.len();
    if total == 0 {
        return 1.0;
    }
    (2 * lcs_len(a, b)) as f64 / total as f64
}

/// Best [`ratio`] of the shorter string against every same-length window of
/// the longer one
///
/// Lets a short phrase score highly when it appears, slightly misheard,
/// anywhere inside a long transcript.
#[must_use]
pub fn partial_ratio(a: &str, b: &str) -> f64 {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let (short, long) = if a.len() <= b.len() { (a, b) } else { (b, a) };

    if short.is_empty() {
        return if long.is_empty() { 1.0 } else { 0.0 };
    }

    let mut best = 0.0_f64;
    for window in long.windows(short.len()) {
        best = best.max(ratio(&short, window));
        if best >= 1.0 {
            break;
        }
    }
    best
}

/// Longest common subsequence length, two-row dynamic programming
fn lcs_len(a: &[char], b: &[char]) -> usize {
    let mut prev = vec![0usize; b.len() + 1];
    let mut curr = vec![0usize; b.len() + 1];

    for ca in a {
        for (j, cb) in b.iter().enumerate() {
            curr[j + 1] = if ca == cb {
                prev[j] + 1
            } else {
                curr[j].max(prev[j + 1])
            };
        }
        std::mem::swap(&mut prev, &mut curr);
    }

    prev[b.len()]
}
