//! Per-line annotations that follow line renumbering on rollover:
//! bookmarks and row height overrides.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bookmark {
    pub line: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

impl Bookmark {
    pub fn new(line: usize) -> Self {
        Self { line, comment: None }
    }
}

/// Bookmarks keyed by line number
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BookmarkSet {
    marks: BTreeMap<usize, Bookmark>,
}

impl BookmarkSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or remove the bookmark at `line`; true if it now exists
    pub fn toggle(&mut self, line: usize) -> bool {
        if self.marks.remove(&line).is_some() {
            false
        } else {
            self.marks.insert(line, Bookmark::new(line));
            true
        }
    }

    /// Add a bookmark unless one exists; false if it was already there
    pub fn add(&mut self, bookmark: Bookmark) -> bool {
        if self.marks.contains_key(&bookmark.line) {
            return false;
        }
        self.marks.insert(bookmark.line, bookmark);
        true
    }

    /// Add or replace the bookmark at its line
    pub fn set(&mut self, bookmark: Bookmark) {
        self.marks.insert(bookmark.line, bookmark);
    }

    pub fn remove(&mut self, line: usize) -> Option<Bookmark> {
        self.marks.remove(&line)
    }

    pub fn remove_many(&mut self, lines: &[usize]) -> usize {
        lines.iter().filter(|l| self.marks.remove(l).is_some()).count()
    }

    /// Attach a comment, bookmarking the line if needed
    pub fn set_comment(&mut self, line: usize, comment: impl Into<String>) {
        let comment = comment.into();
        self.marks.entry(line).or_insert_with(|| Bookmark::new(line)).comment =
            (!comment.is_empty()).then_some(comment);
    }

    pub fn get(&self, line: usize) -> Option<&Bookmark> {
        self.marks.get(&line)
    }

    pub fn contains(&self, line: usize) -> bool {
        self.marks.contains_key(&line)
    }

    pub fn len(&self) -> usize {
        self.marks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.marks.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Bookmark> {
        self.marks.values()
    }

    pub fn clear(&mut self) {
        self.marks.clear();
    }

    /// First bookmark after `from` (before, when `forward` is false),
    /// wrapping around the ends
    pub fn next_from(&self, from: usize, forward: bool) -> Option<usize> {
        self.next_matching(from, forward, |_| true)
    }

    /// Like `next_from`, skipping lines for which `visible` is false
    pub fn next_matching(&self, from: usize, forward: bool, visible: impl Fn(usize) -> bool) -> Option<usize> {
        let mut candidates: Box<dyn Iterator<Item = usize>> = if forward {
            Box::new(
                self.marks
                    .range(from.saturating_add(1)..)
                    .chain(self.marks.range(..=from))
                    .map(|(&l, _)| l),
            )
        } else {
            Box::new(
                self.marks
                    .range(..from)
                    .rev()
                    .chain(self.marks.range(from..).rev())
                    .map(|(&l, _)| l),
            )
        };
        candidates.find(|&l| visible(l))
    }

    /// Renumber after `offset` leading lines were dropped
    pub fn shift(&mut self, offset: usize) {
        if offset == 0 {
            return;
        }
        self.marks = std::mem::take(&mut self.marks)
            .into_values()
            .filter_map(|mut mark| {
                mark.line = mark.line.checked_sub(offset)?;
                Some((mark.line, mark))
            })
            .collect();
    }
}

/// Rows displayed taller than the default height
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RowHeightOverrides {
    heights: BTreeMap<usize, u32>,
    default_height: u32,
    step: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowHeight {
    pub line: usize,
    pub height: u32,
}

impl RowHeightOverrides {
    pub fn new(default_height: u32, step: u32) -> Self {
        Self {
            heights: BTreeMap::new(),
            default_height,
            step: step.max(1),
        }
    }

    pub fn height(&self, line: usize) -> u32 {
        self.heights.get(&line).copied().unwrap_or(self.default_height)
    }

    /// Set an explicit height; heights at or below the default drop the entry
    pub fn set(&mut self, line: usize, height: u32) {
        if height <= self.default_height {
            self.heights.remove(&line);
        } else {
            self.heights.insert(line, height);
        }
    }

    pub fn increase(&mut self, line: usize) -> u32 {
        let height = self.height(line).saturating_add(self.step);
        self.set(line, height);
        height
    }

    pub fn decrease(&mut self, line: usize) -> u32 {
        let height = self.height(line).saturating_sub(self.step).max(self.default_height);
        self.set(line, height);
        height
    }

    pub fn len(&self) -> usize {
        self.heights.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heights.is_empty()
    }

    pub fn entries(&self) -> Vec<RowHeight> {
        self.heights
            .iter()
            .map(|(&line, &height)| RowHeight { line, height })
            .collect()
    }

    pub fn clear(&mut self) {
        self.heights.clear();
    }

    pub fn shift(&mut self, offset: usize) {
        if offset == 0 {
            return;
        }
        self.heights = std::mem::take(&mut self.heights)
            .into_iter()
            .filter_map(|(line, height)| Some((line.checked_sub(offset)?, height)))
            .collect();
    }
}
