use std::collections::VecDeque;

use tracing::debug;

use super::{CompiledFilter, RangeScanner};
use crate::sources::LineSource;
use crate::task::CancelToken;

/// Matched and hit line lists of a filtered view.
///
/// `matched` holds hits plus their spread context, sorted and without
/// duplicates. `recent` is the bounded window of the lines most recently
/// added, used to skip re-adding context lines shared by nearby hits.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FilterIndex {
    matched: Vec<usize>,
    hits: Vec<usize>,
    recent: VecDeque<usize>,
    window_cap: usize,
    /// Lines below this still belong to the spread of an earlier hit
    pending_until: usize,
}

impl FilterIndex {
    pub fn new(window_cap: usize) -> Self {
        Self {
            window_cap: window_cap.max(1),
            ..Self::default()
        }
    }

    pub fn matched_lines(&self) -> &[usize] {
        &self.matched
    }

    pub fn hit_lines(&self) -> &[usize] {
        &self.hits
    }

    pub fn matched_count(&self) -> usize {
        self.matched.len()
    }

    pub fn hit_count(&self) -> usize {
        self.hits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.matched.is_empty()
    }

    pub fn contains(&self, line: usize) -> bool {
        self.matched.binary_search(&line).is_ok()
    }

    pub fn is_hit(&self, line: usize) -> bool {
        self.hits.binary_search(&line).is_ok()
    }

    /// Row of `line` in the filtered view
    pub fn position_of(&self, line: usize) -> Option<usize> {
        self.matched.binary_search(&line).ok()
    }

    /// Record a hit and its spread.
    ///
    /// Context lines are bounded to `[0, available)`; context behind the hit
    /// that is not available yet is picked up by `add_context` once those
    /// lines are processed. Returns the newly added lines in ascending order.
    pub fn add_hit(&mut self, line: usize, before: usize, behind: usize, available: usize) -> Vec<usize> {
        insert_sorted(&mut self.hits, line);
        let first = line.saturating_sub(before);
        let last = line.saturating_add(behind).min(available.saturating_sub(1)).max(line);
        let added = (first..=last).filter(|&l| self.try_add(l)).collect();
        self.pending_until = self.pending_until.max(line.saturating_add(behind).saturating_add(1));
        added
    }

    /// Add a non-hit line if it falls in the spread of an earlier hit
    pub fn add_context(&mut self, line: usize) -> bool {
        line < self.pending_until && self.try_add(line)
    }

    fn try_add(&mut self, line: usize) -> bool {
        if self.recent.contains(&line) || !insert_sorted(&mut self.matched, line) {
            return false;
        }
        self.recent.push_back(line);
        if self.recent.len() > self.window_cap {
            self.recent.pop_front();
        }
        true
    }

    /// Process one line in file order
    pub fn process_line(
        &mut self,
        filter: &CompiledFilter,
        scanner: &mut RangeScanner,
        line_no: usize,
        text: &str,
        available: usize,
    ) {
        if filter.test(text, scanner) {
            let (before, behind) = filter.spread();
            self.add_hit(line_no, before, behind, available);
        } else {
            self.add_context(line_no);
        }
    }

    /// Process `[start, end)` in order.
    ///
    /// Returns the first line that could not be read, if any.
    pub fn process_range(
        &mut self,
        filter: &CompiledFilter,
        scanner: &mut RangeScanner,
        source: &dyn LineSource,
        start: usize,
        end: usize,
    ) -> Result<(), usize> {
        for line_no in start..end {
            let text = source.line(line_no).ok_or(line_no)?;
            self.process_line(filter, scanner, line_no, &text, end);
        }
        Ok(())
    }

    /// Renumber after a rollover dropped `offset` leading lines.
    ///
    /// The recent window is re-seeded from the tail of the matched lines.
    pub fn shift(&mut self, offset: usize) {
        if offset == 0 {
            return;
        }
        shift_sorted(&mut self.matched, offset);
        shift_sorted(&mut self.hits, offset);
        let seed = self.matched.len().saturating_sub(self.window_cap);
        self.recent = self.matched[seed..].iter().copied().collect();
        self.pending_until = self.pending_until.saturating_sub(offset);
    }

    pub fn clear(&mut self) {
        *self = Self::new(self.window_cap);
    }
}

/// Insert keeping `lines` sorted; false if already present
pub(crate) fn insert_sorted(lines: &mut Vec<usize>, line: usize) -> bool {
    match lines.last() {
        None => {
            lines.push(line);
            true
        }
        Some(&last) if last < line => {
            lines.push(line);
            true
        }
        _ => match lines.binary_search(&line) {
            Ok(_) => false,
            Err(pos) => {
                lines.insert(pos, line);
                true
            }
        },
    }
}

fn shift_sorted(lines: &mut Vec<usize>, offset: usize) {
    let dropped = lines.partition_point(|&l| l < offset);
    lines.drain(..dropped);
    for l in lines.iter_mut() {
        *l -= offset;
    }
}

/// Why a bulk pass stopped
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PassEnd {
    Completed,
    Cancelled,
    /// A line lookup failed at this line
    SourceEnded(usize),
    /// The source renumbered its lines while the pass was reading; the
    /// result mixes two numberings and must be thrown away
    Renumbered,
}

/// What a bulk pass produced
#[derive(Clone, Debug)]
pub struct PassResult {
    pub index: FilterIndex,
    /// Scanner state after the last scanned line
    pub scanner: RangeScanner,
    /// Lines `[0, scanned_to)` were examined
    pub scanned_to: usize,
    pub end: PassEnd,
}

/// Inputs shared by sequential and parallel passes
pub struct PassContext<'a> {
    pub source: &'a dyn LineSource,
    pub cancel: &'a CancelToken,
    pub progress_interval: usize,
    pub window_cap: usize,
    pub progress: &'a (dyn Fn(usize, usize) + Sync),
    /// True once the source renumbered its lines after the pass started
    pub renumbered: &'a (dyn Fn() -> bool + Sync),
}

/// Build an index over the whole source in a single thread.
///
/// The line count is sampled once; later growth is left to the tail path.
/// Cancellation and renumbering are polled every `progress_interval` lines.
/// Cancellation yields the partial index.
pub fn rebuild(filter: &CompiledFilter, ctx: &PassContext<'_>) -> PassResult {
    let mut index = FilterIndex::new(ctx.window_cap);
    let mut scanner = RangeScanner::default();
    if (ctx.renumbered)() {
        return PassResult {
            index,
            scanner,
            scanned_to: 0,
            end: PassEnd::Renumbered,
        };
    }
    let total = ctx.source.line_count();
    let interval = ctx.progress_interval.max(1);

    for line_no in 0..total {
        if line_no > 0 && line_no % interval == 0 {
            if ctx.cancel.is_cancelled() {
                debug!(line_no, total, "Filter pass cancelled");
                return PassResult {
                    index,
                    scanner,
                    scanned_to: line_no,
                    end: PassEnd::Cancelled,
                };
            }
            if (ctx.renumbered)() {
                debug!(line_no, total, "Source renumbered during filter pass");
                return PassResult {
                    index,
                    scanner,
                    scanned_to: line_no,
                    end: PassEnd::Renumbered,
                };
            }
            (ctx.progress)(line_no, total);
        }
        let Some(text) = ctx.source.line(line_no) else {
            debug!(line_no, total, "Source ended during filter pass");
            return PassResult {
                index,
                scanner,
                scanned_to: line_no,
                end: PassEnd::SourceEnded(line_no),
            };
        };
        index.process_line(filter, &mut scanner, line_no, &text, total);
    }

    PassResult {
        index,
        scanner,
        scanned_to: total,
        end: PassEnd::Completed,
    }
}
