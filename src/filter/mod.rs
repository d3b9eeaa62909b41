//! Filter specifications and the machinery that turns them into filtered
//! views: per-line predicates, spread-aware indices and the bulk passes
//! (sequential and parallel) that build them.

pub mod fuzzy;
pub mod index;
pub mod parallel;
pub mod predicate;

use serde::{Deserialize, Serialize};
use tracing::warn;

pub use index::{FilterIndex, PassContext, PassEnd, PassResult, rebuild};
pub use parallel::{build_filter_pool, parallel_rebuild};
pub use predicate::{CompiledFilter, RangeScanner};

/// Largest accepted spread-before/behind count
pub const MAX_SPREAD: usize = 99;

/// A filter as entered by the user.
///
/// A pass works on its own copy, so editing a spec never affects a pass
/// that is already running.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterSpec {
    /// The pattern string
    pub search_text: String,
    pub case_sensitive: bool,
    /// Whether to treat the pattern as a regex
    pub is_regex: bool,
    /// Keep the lines that do not match
    pub invert: bool,
    /// Edit distance tolerated by approximate matching (0 = exact)
    pub fuzzy: usize,
    /// Context lines shown before each hit
    pub spread_before: usize,
    /// Context lines shown after each hit
    pub spread_behind: usize,
    /// Test only these columns (as produced by the view's columnizer)
    pub columns: Option<Vec<usize>>,
    /// End-of-block pattern; enables range mode when set
    pub range_text: Option<String>,
    /// Keep filtering lines appended after the pass
    pub filter_tail: bool,
}

impl Default for FilterSpec {
    fn default() -> Self {
        Self {
            search_text: String::new(),
            case_sensitive: false,
            is_regex: false,
            invert: false,
            fuzzy: 0,
            spread_before: 0,
            spread_behind: 0,
            columns: None,
            range_text: None,
            filter_tail: true,
        }
    }
}

impl FilterSpec {
    /// Case-insensitive substring filter
    pub fn literal(text: impl Into<String>) -> Self {
        Self {
            search_text: text.into(),
            ..Self::default()
        }
    }

    pub fn regex(pattern: impl Into<String>) -> Self {
        Self {
            search_text: pattern.into(),
            is_regex: true,
            ..Self::default()
        }
    }

    pub fn case_sensitive(mut self) -> Self {
        self.case_sensitive = true;
        self
    }

    pub fn inverted(mut self) -> Self {
        self.invert = true;
        self
    }

    pub fn with_spread(mut self, before: usize, behind: usize) -> Self {
        self.spread_before = before;
        self.spread_behind = behind;
        self
    }

    pub fn with_fuzzy(mut self, tolerance: usize) -> Self {
        self.fuzzy = tolerance;
        self
    }

    pub fn with_columns(mut self, columns: Vec<usize>) -> Self {
        self.columns = Some(columns);
        self
    }

    pub fn with_range(mut self, end_text: impl Into<String>) -> Self {
        self.range_text = Some(end_text.into());
        self
    }

    pub fn without_tail(mut self) -> Self {
        self.filter_tail = false;
        self
    }

    pub fn is_range_search(&self) -> bool {
        self.range_text.as_deref().is_some_and(|t| !t.is_empty())
    }

    /// Copy with spread counts limited to `max_spread`
    pub fn clamped(&self, max_spread: usize) -> Self {
        let mut spec = self.clone();
        if spec.spread_before > max_spread || spec.spread_behind > max_spread {
            warn!(
                before = spec.spread_before,
                behind = spec.spread_behind,
                max_spread,
                "Clamping filter spread"
            );
            spec.spread_before = spec.spread_before.min(max_spread);
            spec.spread_behind = spec.spread_behind.min(max_spread);
        }
        spec
    }
}
