//! Incremental search over a view's source.
//!
//! A search walks from a start line in one direction, optionally wrapping
//! around once, and stops at the first matching line. The source may grow or
//! roll over meanwhile; only single line lookups are synchronized, so a
//! result can refer to a line that was renumbered by a concurrent rollover.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::Result;
use crate::filter::predicate::Matcher;
use crate::sources::LineSource;
use crate::task::CancelToken;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    #[default]
    Forward,
    Backward,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchParams {
    pub term: String,
    pub case_sensitive: bool,
    pub is_regex: bool,
    pub direction: Direction,
    /// Continue from the other end when a boundary is reached
    pub wrap: bool,
    /// Line to start from; the start line itself is examined first
    pub start_line: usize,
}

impl SearchParams {
    pub fn new(term: impl Into<String>) -> Self {
        Self {
            term: term.into(),
            case_sensitive: false,
            is_regex: false,
            direction: Direction::Forward,
            wrap: true,
            start_line: 0,
        }
    }

    pub fn from_line(mut self, line: usize) -> Self {
        self.start_line = line;
        self
    }

    pub fn backward(mut self) -> Self {
        self.direction = Direction::Backward;
        self
    }

    pub fn regex(mut self) -> Self {
        self.is_regex = true;
        self
    }

    pub fn case_sensitive(mut self) -> Self {
        self.case_sensitive = true;
        self
    }

    pub fn no_wrap(mut self) -> Self {
        self.wrap = false;
        self
    }

    pub(crate) fn matcher(&self) -> Result<Matcher> {
        if self.is_regex {
            Matcher::regex(&self.term, self.case_sensitive)
        } else {
            Ok(Matcher::literal(&self.term, self.case_sensitive))
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SearchResult {
    Found(usize),
    NotFound,
    Cancelled,
}

/// Run a search to completion on the current thread.
///
/// Examines at most one line per line of the source: with wrapping enabled
/// the walk stops when it gets back to where it started.
pub fn search(
    source: &dyn LineSource,
    params: &SearchParams,
    cancel: &CancelToken,
    progress_interval: usize,
    progress: &dyn Fn(usize, usize),
) -> Result<SearchResult> {
    let matcher = params.matcher()?;
    let total = source.line_count();
    if total == 0 {
        return Ok(SearchResult::NotFound);
    }
    let interval = progress_interval.max(1);
    let forward = params.direction == Direction::Forward;

    let step = |line: usize| -> Option<usize> {
        if forward {
            (line + 1 < total).then_some(line + 1)
        } else {
            line.checked_sub(1)
        }
    };

    let mut position = if forward {
        (params.start_line < total).then_some(params.start_line)
    } else {
        Some(params.start_line.min(total - 1))
    };
    let mut wrapped = false;
    let mut visited = 0;

    while visited < total {
        let Some(line) = position else {
            if params.wrap && !wrapped {
                wrapped = true;
                position = Some(if forward { 0 } else { total - 1 });
                continue;
            }
            break;
        };

        visited += 1;
        if visited % interval == 0 {
            if cancel.is_cancelled() {
                debug!(line, visited, "Search cancelled");
                return Ok(SearchResult::Cancelled);
            }
            progress(visited, total);
        }

        match source.line(line) {
            Some(text) if matcher.is_match(&text) => return Ok(SearchResult::Found(line)),
            Some(_) => position = step(line),
            // Shrunk underneath us: treat as reaching the boundary
            None => position = None,
        }
    }
    Ok(SearchResult::NotFound)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EngineError;
    use crate::sources::MemorySource;

    fn no_progress(_done: usize, _total: usize) {}

    fn run(source: &MemorySource, params: &SearchParams) -> SearchResult {
        search(source, params, &CancelToken::new(), 1000, &no_progress).unwrap()
    }

    fn lines(n: usize, hits: &[usize]) -> MemorySource {
        MemorySource::with_lines(
            "t",
            (0..n).map(|i| {
                if hits.contains(&i) {
                    format!("{i} needle")
                } else {
                    format!("{i} hay")
                }
            }),
        )
    }

    #[test]
    fn test_forward_from_start_line() {
        let source = lines(10, &[2, 6]);
        assert_eq!(run(&source, &SearchParams::new("needle").from_line(3)), SearchResult::Found(6));
        assert_eq!(run(&source, &SearchParams::new("needle").from_line(6)), SearchResult::Found(6));
    }

    #[test]
    fn test_forward_wraps_once() {
        let source = lines(10, &[2]);
        assert_eq!(run(&source, &SearchParams::new("needle").from_line(5)), SearchResult::Found(2));
        assert_eq!(
            run(&source, &SearchParams::new("needle").from_line(5).no_wrap()),
            SearchResult::NotFound
        );
    }

    #[test]
    fn test_backward() {
        let source = lines(10, &[2, 6]);
        assert_eq!(
            run(&source, &SearchParams::new("needle").from_line(5).backward()),
            SearchResult::Found(2)
        );
        assert_eq!(
            run(&source, &SearchParams::new("needle").from_line(1).backward()),
            SearchResult::Found(6)
        );
    }

    #[test]
    fn test_not_found_visits_every_line_once() {
        struct Counting {
            inner: MemorySource,
            reads: parking_lot::Mutex<usize>,
        }
        impl LineSource for Counting {
            fn name(&self) -> String {
                self.inner.name()
            }
            fn line_count(&self) -> usize {
                self.inner.line_count()
            }
            fn line(&self, index: usize) -> Option<std::sync::Arc<str>> {
                *self.reads.lock() += 1;
                self.inner.line(index)
            }
            fn subscribe(&self, listener: std::sync::Arc<dyn crate::sources::SourceListener>) {
                self.inner.subscribe(listener)
            }
        }
        let source = Counting {
            inner: lines(25, &[]),
            reads: parking_lot::Mutex::new(0),
        };
        let params = SearchParams::new("needle").from_line(13);
        let result = search(&source, &params, &CancelToken::new(), 1000, &no_progress).unwrap();
        assert_eq!(result, SearchResult::NotFound);
        assert_eq!(*source.reads.lock(), 25);
    }

    #[test]
    fn test_start_past_end() {
        let source = lines(5, &[1]);
        assert_eq!(run(&source, &SearchParams::new("needle").from_line(50)), SearchResult::Found(1));
        assert_eq!(
            run(&source, &SearchParams::new("needle").from_line(50).backward()),
            SearchResult::Found(1)
        );
    }

    #[test]
    fn test_regex_and_case() {
        let source = MemorySource::with_lines("t", ["Started", "took 1200ms", "STOPPED"]);
        assert_eq!(run(&source, &SearchParams::new(r"\d{4}ms").regex()), SearchResult::Found(1));
        assert_eq!(run(&source, &SearchParams::new("stopped")), SearchResult::Found(2));
        assert_eq!(
            run(&source, &SearchParams::new("stopped").case_sensitive()),
            SearchResult::NotFound
        );
    }

    #[test]
    fn test_invalid_regex() {
        let source = lines(3, &[]);
        let err = search(&source, &SearchParams::new("(").regex(), &CancelToken::new(), 1000, &no_progress)
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidPattern { .. }));
    }

    #[test]
    fn test_cancelled() {
        let source = lines(5000, &[]);
        let cancel = CancelToken::new();
        cancel.cancel();
        let result = search(&source, &SearchParams::new("needle"), &cancel, 1000, &no_progress).unwrap();
        assert_eq!(result, SearchResult::Cancelled);
    }

    #[test]
    fn test_empty_source() {
        let source = MemorySource::new("empty");
        assert_eq!(run(&source, &SearchParams::new("x")), SearchResult::NotFound);
    }
}
