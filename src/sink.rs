//! Cascading sinks: derived views fed with the lines of a parent view that
//! pass a second filter.
//!
//! A sink owns an in-memory store that is itself a `LineSource`, so a view
//! opened on it can have sinks of its own.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{EngineError, Result};
use crate::filter::{CompiledFilter, FilterIndex, FilterSpec, RangeScanner};
use crate::sources::MemorySource;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SinkId(pub u64);

impl fmt::Display for SinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

pub struct CascadingSink {
    id: SinkId,
    filter: Arc<CompiledFilter>,
    /// Parent lines already forwarded, for spread and deduplication
    index: FilterIndex,
    scanner: RangeScanner,
    store: Arc<MemorySource>,
    /// Parent line of every store line; `None` once a rollover dropped it
    origin: Vec<Option<usize>>,
    /// Parent lines below this were already offered
    next_line: usize,
    dead: bool,
}

impl CascadingSink {
    pub(crate) fn new(id: SinkId, filter: Arc<CompiledFilter>, store: Arc<MemorySource>, window_cap: usize) -> Self {
        Self {
            id,
            filter,
            index: FilterIndex::new(window_cap),
            scanner: RangeScanner::default(),
            store,
            origin: Vec::new(),
            next_line: 0,
            dead: false,
        }
    }

    pub fn id(&self) -> SinkId {
        self.id
    }

    pub fn spec(&self) -> &FilterSpec {
        self.filter.spec()
    }

    /// The derived line store
    pub fn store(&self) -> Arc<MemorySource> {
        self.store.clone()
    }

    pub fn is_dead(&self) -> bool {
        self.dead
    }

    /// Parent line behind a store line
    pub fn original_line(&self, derived: usize) -> Option<usize> {
        self.origin.get(derived).copied().flatten()
    }

    /// Lines written to the store so far
    pub fn fed_count(&self) -> usize {
        self.origin.len()
    }

    /// Append one parent line to the store. A failed write kills the sink.
    pub fn feed(&mut self, line_no: usize, text: Arc<str>) -> Result<()> {
        if self.dead {
            return Err(EngineError::SinkWriteFailure(self.id));
        }
        if let Err(e) = self.store.append(text) {
            warn!(sink = %self.id, error = %e, "Cascading sink write failed");
            self.dead = true;
            return Err(EngineError::SinkWriteFailure(self.id));
        }
        self.origin.push(Some(line_no));
        Ok(())
    }

    /// Parent lines `[0, offered_to)` have been offered
    pub fn offered_to(&self) -> usize {
        self.next_line
    }

    /// Offer a parent line, in file order.
    ///
    /// Lines below the last one offered are ignored. `fetch` reads other
    /// parent lines when a hit pulls in spread context; lines it cannot read
    /// are skipped.
    pub(crate) fn process_line(
        &mut self,
        line_no: usize,
        text: &Arc<str>,
        available: usize,
        fetch: &dyn Fn(usize) -> Option<Arc<str>>,
    ) {
        if self.dead || line_no < self.next_line {
            return;
        }
        self.next_line = line_no + 1;
        let added = if self.filter.test(text, &mut self.scanner) {
            let (before, behind) = self.filter.spread();
            self.index.add_hit(line_no, before, behind, available)
        } else if self.index.add_context(line_no) {
            vec![line_no]
        } else {
            return;
        };
        for line in added {
            let text = if line == line_no {
                text.clone()
            } else {
                match fetch(line) {
                    Some(text) => text,
                    None => continue,
                }
            };
            if self.feed(line, text).is_err() {
                return;
            }
        }
    }

    /// Renumber parent lines after a parent rollover
    pub(crate) fn shift(&mut self, offset: usize) {
        if offset == 0 {
            return;
        }
        self.index.shift(offset);
        self.next_line = self.next_line.saturating_sub(offset);
        for origin in &mut self.origin {
            *origin = origin.and_then(|line| line.checked_sub(offset));
        }
    }

    pub(crate) fn mark_dead(&mut self) {
        self.dead = true;
    }

    /// Release the store; views opened on it see it as closed
    pub(crate) fn close(&mut self) {
        self.dead = true;
        self.store.close();
        debug!(sink = %self.id, "Cascading sink closed");
    }
}

/// The sinks attached to one view
#[derive(Default)]
pub struct SinkList {
    sinks: Vec<CascadingSink>,
    next_id: u64,
}

impl SinkList {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn allocate_id(&mut self) -> SinkId {
        self.next_id += 1;
        SinkId(self.next_id)
    }

    pub(crate) fn insert(&mut self, sink: CascadingSink) {
        self.sinks.push(sink);
    }

    pub fn get(&self, id: SinkId) -> Option<&CascadingSink> {
        self.sinks.iter().find(|s| s.id == id)
    }

    pub(crate) fn remove(&mut self, id: SinkId) -> Option<CascadingSink> {
        let pos = self.sinks.iter().position(|s| s.id == id)?;
        Some(self.sinks.remove(pos))
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }

    pub fn ids(&self) -> Vec<SinkId> {
        self.sinks.iter().map(|s| s.id).collect()
    }

    pub fn specs(&self) -> Vec<FilterSpec> {
        self.sinks.iter().map(|s| s.spec().clone()).collect()
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut CascadingSink> {
        self.sinks.iter_mut()
    }

    /// Drop dead sinks, closing their stores. Returns the removed ids.
    pub(crate) fn prune_dead(&mut self) -> Vec<SinkId> {
        let mut pruned = Vec::new();
        self.sinks.retain_mut(|sink| {
            if sink.dead {
                sink.close();
                pruned.push(sink.id);
                false
            } else {
                true
            }
        });
        pruned
    }

    pub(crate) fn mark_all_dead(&mut self) {
        for sink in &mut self.sinks {
            sink.mark_dead();
        }
    }

    pub(crate) fn shift(&mut self, offset: usize) {
        for sink in &mut self.sinks {
            sink.shift(offset);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::columnizer::PlainColumnizer;
    use crate::sources::LineSource;

    fn sink(spec: FilterSpec) -> CascadingSink {
        let filter = Arc::new(CompiledFilter::compile(spec, Arc::new(PlainColumnizer)).unwrap());
        CascadingSink::new(SinkId(1), filter, Arc::new(MemorySource::new("sink")), 10)
    }

    fn offer(sink: &mut CascadingSink, parent: &[&str]) {
        let lines: Vec<Arc<str>> = parent.iter().map(|&l| Arc::from(l)).collect();
        let fetch = |i: usize| lines.get(i).cloned();
        for (i, text) in lines.iter().enumerate() {
            sink.process_line(i, text, lines.len(), &fetch);
        }
    }

    #[test]
    fn test_feeds_hits_with_spread() {
        let mut sink = sink(FilterSpec::literal("err").with_spread(1, 0));
        offer(&mut sink, &["a", "b", "ERR 1", "c", "ERR 2"]);
        let store = sink.store();
        let text: Vec<String> = (0..store.line_count())
            .filter_map(|i| store.line(i).map(|l| l.to_string()))
            .collect();
        assert_eq!(text, vec!["b", "ERR 1", "c", "ERR 2"]);
        assert_eq!(sink.original_line(0), Some(1));
        assert_eq!(sink.original_line(3), Some(4));
    }

    #[test]
    fn test_lines_offered_twice_are_fed_once() {
        let mut sink = sink(FilterSpec::literal("err").with_spread(0, 1));
        offer(&mut sink, &["ERR 0", "a", "ERR 2"]);
        offer(&mut sink, &["ERR 0", "a", "ERR 2"]);
        assert_eq!(sink.fed_count(), 3);
        assert_eq!(sink.offered_to(), 3);
    }

    #[test]
    fn test_shift_drops_mapping() {
        let mut sink = sink(FilterSpec::literal("x"));
        offer(&mut sink, &["x0", "y", "x2"]);
        sink.shift(1);
        assert_eq!(sink.original_line(0), None);
        assert_eq!(sink.original_line(1), Some(1));
    }

    #[test]
    fn test_write_failure_kills_sink() {
        let mut sink = sink(FilterSpec::literal("x"));
        sink.store().close();
        let err = sink.feed(0, Arc::from("x")).unwrap_err();
        assert!(matches!(err, EngineError::SinkWriteFailure(SinkId(1))));
        assert!(sink.is_dead());
    }

    #[test]
    fn test_prune_dead_closes_store() {
        let mut list = SinkList::new();
        let id = list.allocate_id();
        let filter = Arc::new(CompiledFilter::compile(FilterSpec::literal("x"), Arc::new(PlainColumnizer)).unwrap());
        let store = Arc::new(MemorySource::new("sink"));
        let mut s = CascadingSink::new(id, filter, store.clone(), 10);
        s.mark_dead();
        list.insert(s);
        assert_eq!(list.prune_dead(), vec![id]);
        assert!(list.is_empty());
        assert!(store.is_closed());
    }

    #[test]
    fn test_sink_id_display() {
        assert_eq!(SinkId(3).to_string(), "#3");
    }
}
