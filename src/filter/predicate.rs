use std::sync::Arc;

use regex::{Regex, RegexBuilder};

use super::FilterSpec;
use super::fuzzy::fuzzy_contains;
use crate::columnizer::Columnizer;
use crate::error::{EngineError, Result};

/// A single pattern, ready to test lines against
#[derive(Clone, Debug)]
pub(crate) enum Matcher {
    /// Substring test. The needle is lowercased when case-insensitive.
    Literal { needle: String, case_sensitive: bool },
    Regex(Regex),
    Fuzzy {
        needle: Vec<char>,
        tolerance: usize,
        case_sensitive: bool,
    },
}

impl Matcher {
    pub(crate) fn literal(text: &str, case_sensitive: bool) -> Self {
        let needle = if case_sensitive {
            text.to_string()
        } else {
            text.to_lowercase()
        };
        Matcher::Literal {
            needle,
            case_sensitive,
        }
    }

    pub(crate) fn regex(pattern: &str, case_sensitive: bool) -> Result<Self> {
        RegexBuilder::new(pattern)
            .case_insensitive(!case_sensitive)
            .build()
            .map(Matcher::Regex)
            .map_err(|e| EngineError::invalid_pattern(pattern, e))
    }

    fn fuzzy(text: &str, tolerance: usize, case_sensitive: bool) -> Self {
        let needle = if case_sensitive {
            text.chars().collect()
        } else {
            text.to_lowercase().chars().collect()
        };
        Matcher::Fuzzy {
            needle,
            tolerance,
            case_sensitive,
        }
    }

    pub(crate) fn is_match(&self, text: &str) -> bool {
        match self {
            Matcher::Literal {
                needle,
                case_sensitive: true,
            } => text.contains(needle.as_str()),
            Matcher::Literal { needle, .. } => text.to_lowercase().contains(needle.as_str()),
            Matcher::Regex(regex) => regex.is_match(text),
            Matcher::Fuzzy {
                needle,
                tolerance,
                case_sensitive,
            } => {
                let haystack: Vec<char> = if *case_sensitive {
                    text.chars().collect()
                } else {
                    text.to_lowercase().chars().collect()
                };
                fuzzy_contains(&haystack, needle, *tolerance)
            }
        }
    }
}

/// A `FilterSpec` compiled for repeated evaluation.
///
/// Compilation happens once per pass; a pattern that fails to compile aborts
/// the pass before anything is touched. Regex takes precedence over fuzzy
/// matching when both are requested.
#[derive(Clone)]
pub struct CompiledFilter {
    spec: FilterSpec,
    start: Matcher,
    end: Option<Matcher>,
    columnizer: Arc<dyn Columnizer>,
}

impl std::fmt::Debug for CompiledFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledFilter")
            .field("spec", &self.spec)
            .field("columnizer", &self.columnizer.name())
            .finish()
    }
}

impl CompiledFilter {
    pub fn compile(spec: FilterSpec, columnizer: Arc<dyn Columnizer>) -> Result<Self> {
        let start = Self::matcher_for(&spec, &spec.search_text)?;
        let end = match spec.range_text.as_deref() {
            Some(text) if !text.is_empty() => Some(Self::matcher_for(&spec, text)?),
            _ => None,
        };
        Ok(Self {
            spec,
            start,
            end,
            columnizer,
        })
    }

    fn matcher_for(spec: &FilterSpec, text: &str) -> Result<Matcher> {
        if spec.is_regex {
            Matcher::regex(text, spec.case_sensitive)
        } else if spec.fuzzy > 0 {
            Ok(Matcher::fuzzy(text, spec.fuzzy, spec.case_sensitive))
        } else {
            Ok(Matcher::literal(text, spec.case_sensitive))
        }
    }

    pub fn spec(&self) -> &FilterSpec {
        &self.spec
    }

    pub fn is_range_search(&self) -> bool {
        self.end.is_some()
    }

    /// (spread before, spread behind)
    pub fn spread(&self) -> (usize, usize) {
        (self.spec.spread_before, self.spec.spread_behind)
    }

    /// Text the patterns are tested against: the whole line, or the selected
    /// columns joined by a single space.
    fn searchable<'a>(&self, line: &'a str) -> std::borrow::Cow<'a, str> {
        match self.spec.columns.as_deref() {
            Some(columns) if !columns.is_empty() => {
                let split = self.columnizer.split(line);
                let selected: Vec<&str> = columns
                    .iter()
                    .filter_map(|&c| split.get(c).copied())
                    .collect();
                std::borrow::Cow::Owned(selected.join(" "))
            }
            _ => std::borrow::Cow::Borrowed(line),
        }
    }

    /// Per-line predicate, ignoring range mode
    pub fn matches(&self, line: &str) -> bool {
        self.start.is_match(&self.searchable(line)) != self.spec.invert
    }

    /// Test a line in file order. Range mode needs the scanner state carried
    /// over from the previous line; otherwise this is `matches`.
    pub fn test(&self, line: &str, scanner: &mut RangeScanner) -> bool {
        match &self.end {
            None => self.matches(line),
            Some(end) => {
                let text = self.searchable(line);
                scanner.step(|| self.start.is_match(&text), || end.is_match(&text)) != self.spec.invert
            }
        }
    }
}

/// Block state for range searches.
///
/// A block opens on a line matching the search text and closes on the next
/// line matching the range text; both boundary lines belong to the block.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RangeScanner {
    in_range: bool,
}

impl RangeScanner {
    pub fn in_range(&self) -> bool {
        self.in_range
    }

    fn step(&mut self, opens: impl FnOnce() -> bool, closes: impl FnOnce() -> bool) -> bool {
        if self.in_range {
            if closes() {
                self.in_range = false;
            }
            true
        } else if opens() {
            self.in_range = true;
            true
        } else {
            false
        }
    }
}
