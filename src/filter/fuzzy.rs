//! Approximate substring matching.
//!
//! `fuzzy_contains` reports whether some substring of the haystack is within
//! a given Damerau-Levenshtein (optimal string alignment) distance of the
//! needle. The table is computed column by column over the haystack with a
//! free starting position, so memory stays at three needle-sized rows.

/// True when the needle occurs in the haystack with at most `max_distance`
/// insertions, deletions, substitutions or adjacent transpositions.
pub fn fuzzy_contains(haystack: &[char], needle: &[char], max_distance: usize) -> bool {
    let m = needle.len();
    if m <= max_distance {
        return true;
    }

    // prev[i]: distance of needle[..i] against the best substring ending at
    // the previous haystack position.
    let mut prev2 = vec![0usize; m + 1];
    let mut prev: Vec<usize> = (0..=m).collect();
    let mut cur = vec![0usize; m + 1];

    for j in 1..=haystack.len() {
        cur[0] = 0;
        for i in 1..=m {
            let cost = usize::from(needle[i - 1] != haystack[j - 1]);
            let mut best = (prev[i] + 1).min(cur[i - 1] + 1).min(prev[i - 1] + cost);
            if i > 1 && j > 1 && needle[i - 1] == haystack[j - 2] && needle[i - 2] == haystack[j - 1] {
                best = best.min(prev2[i - 2] + 1);
            }
            cur[i] = best;
        }
        if cur[m] <= max_distance {
            return true;
        }
        std::mem::swap(&mut prev2, &mut prev);
        std::mem::swap(&mut prev, &mut cur);
    }
    false
}
