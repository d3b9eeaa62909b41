//! Tail coordination.
//!
//! Each view runs one coordinator on a dedicated blocking thread. Source
//! events are queued by a listener and drained strictly in arrival order; a
//! drain step first applies rollover renumbering to every line-indexed
//! structure, then feeds the new lines to the tail filter and to each live
//! cascading sink. Finished filter passes and freshly seeded sinks are
//! installed through the same queue, so they line up with every renumbering
//! queued before them.
//!
//! Lock order when both are needed: `sinks` before `filter`. Bookmarks, row
//! heights and the selection are never held together with another lock.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, trace, warn};

use crate::annotations::{BookmarkSet, RowHeightOverrides};
use crate::columnizer::Columnizer;
use crate::config::EngineConfig;
use crate::filter::{CompiledFilter, FilterIndex, PassEnd, PassResult, RangeScanner};
use crate::sink::{CascadingSink, SinkId, SinkList};
use crate::sources::{GrowthEvent, LineSource, SourceEvent, SourceListener};

/// Notifications for observers of a view
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ViewEvent {
    /// New lines were processed
    Updated {
        line_count: usize,
        matched: usize,
        hits: usize,
    },
    /// Every line number dropped by `offset`
    RolledOver { offset: usize },
    /// A bulk filter pass was installed
    FilterApplied { matched: usize, hits: usize },
    SinkPruned(SinkId),
    /// Reading `line` failed; the view stops following the source
    SourceLost { line: Option<usize> },
    /// Content restarted from line 0
    SourceRestored { line_count: usize },
    /// Time synchronization moved the selection
    SyncScroll { line: usize },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CoordinatorStatus {
    Idle,
    Draining,
    SourceLost,
}

/// Filter-related state of a view
pub(crate) struct FilterState {
    pub(crate) filter: Option<Arc<CompiledFilter>>,
    pub(crate) index: FilterIndex,
    pub(crate) scanner: RangeScanner,
    /// Lines `[0, processed)` have been handed to the filter and sinks
    pub(crate) processed: usize,
    /// Tail filtering applies from this line on; `None` while a bulk pass runs
    pub(crate) filter_from: Option<usize>,
}

impl FilterState {
    fn new(window_cap: usize) -> Self {
        Self {
            filter: None,
            index: FilterIndex::new(window_cap),
            scanner: RangeScanner::default(),
            processed: 0,
            filter_from: Some(0),
        }
    }
}

/// State shared between a view, its coordinator and background passes
pub(crate) struct ViewState {
    pub(crate) config: EngineConfig,
    pub(crate) source: RwLock<Arc<dyn LineSource>>,
    pub(crate) columnizer: RwLock<Arc<dyn Columnizer>>,
    pub(crate) filter: Mutex<FilterState>,
    pub(crate) bookmarks: Mutex<BookmarkSet>,
    pub(crate) row_heights: Mutex<RowHeightOverrides>,
    pub(crate) sinks: Mutex<SinkList>,
    pub(crate) selected: Mutex<Option<usize>>,
    pub(crate) status: RwLock<CoordinatorStatus>,
    pub(crate) events: broadcast::Sender<ViewEvent>,
    /// Renumberings announced so far: rollovers, restarts and reattaches.
    ///
    /// Bumped when the renumbering is queued, before its lines are readable,
    /// so a reader that samples it first can tell whether the numbering moved
    /// under it.
    pub(crate) renumbered: Arc<AtomicU64>,
}

impl ViewState {
    pub(crate) fn new(
        config: EngineConfig,
        source: Arc<dyn LineSource>,
        columnizer: Arc<dyn Columnizer>,
    ) -> Self {
        let (events, _) = broadcast::channel(config.event_buffer.max(1));
        Self {
            filter: Mutex::new(FilterState::new(config.context_window_cap())),
            row_heights: Mutex::new(RowHeightOverrides::new(
                config.default_row_height,
                config.row_height_step,
            )),
            bookmarks: Mutex::new(BookmarkSet::new()),
            sinks: Mutex::new(SinkList::new()),
            selected: Mutex::new(None),
            status: RwLock::new(CoordinatorStatus::Idle),
            source: RwLock::new(source),
            columnizer: RwLock::new(columnizer),
            events,
            renumbered: Arc::new(AtomicU64::new(0)),
            config,
        }
    }

    pub(crate) fn emit(&self, event: ViewEvent) {
        // No receivers is fine
        let _ = self.events.send(event);
    }

    pub(crate) fn current_source(&self) -> Arc<dyn LineSource> {
        self.source.read().clone()
    }

    pub(crate) fn renumber_epoch(&self) -> u64 {
        self.renumbered.load(Ordering::Acquire)
    }

    /// Renumber every line-indexed structure after `offset` lines were dropped
    fn shift_all(&self, offset: usize) {
        {
            let mut state = self.filter.lock();
            state.index.shift(offset);
            state.processed = state.processed.saturating_sub(offset);
            if let Some(from) = state.filter_from.as_mut() {
                *from = from.saturating_sub(offset);
            }
        }
        self.bookmarks.lock().shift(offset);
        self.row_heights.lock().shift(offset);
        self.sinks.lock().shift(offset);
        let mut selected = self.selected.lock();
        *selected = selected.and_then(|line| line.checked_sub(offset));
    }

    /// Feed `[processed, end)` to the tail filter and the live sinks.
    ///
    /// A range that was already processed is ignored. Returns the first line
    /// that could not be read.
    fn process_new_lines(&self, end: usize) -> Result<(), usize> {
        let source = self.current_source();
        let fetch = |line: usize| source.line(line);
        let mut sinks = self.sinks.lock();
        let mut state = self.filter.lock();

        let start = state.processed;
        if end <= start {
            return Ok(());
        }
        let tail_filter = state
            .filter
            .clone()
            .filter(|f| f.spec().filter_tail && state.filter_from.is_some());
        if tail_filter.is_none() && sinks.is_empty() {
            state.processed = end;
            return Ok(());
        }
        trace!(start, end, sinks = sinks.len(), tail = tail_filter.is_some(), "Processing new lines");

        for line_no in start..end {
            let Some(text) = source.line(line_no) else {
                state.processed = line_no;
                return Err(line_no);
            };
            if let (Some(filter), Some(from)) = (&tail_filter, state.filter_from) {
                if line_no >= from {
                    let FilterState { index, scanner, .. } = &mut *state;
                    index.process_line(filter, scanner, line_no, &text, end);
                }
            }
            for sink in sinks.iter_mut() {
                sink.process_line(line_no, &text, end, &fetch);
            }
        }
        state.processed = end;
        Ok(())
    }

    /// Put a finished pass in place unless a newer filter replaced it.
    ///
    /// Lines the coordinator processed past the pass are filtered to catch up.
    /// Returns (matched, hits, scanned lines).
    fn install_pass(&self, filter: &Arc<CompiledFilter>, result: PassResult) -> Option<(usize, usize, usize)> {
        let source = self.current_source();
        let mut current = self.filter.lock();
        if !current.filter.as_ref().is_some_and(|f| Arc::ptr_eq(f, filter)) {
            return None;
        }

        let PassResult {
            mut index,
            mut scanner,
            scanned_to,
            end,
        } = result;
        let resume = if end == PassEnd::Cancelled {
            current.processed
        } else {
            scanned_to
        };
        if end != PassEnd::Cancelled && filter.spec().filter_tail && current.processed > resume {
            if let Err(line) = index.process_range(filter, &mut scanner, source.as_ref(), resume, current.processed) {
                debug!(line, "Catch-up stopped at unreadable line");
            }
        }

        current.index = index;
        current.scanner = scanner;
        current.filter_from = Some(resume);
        Some((current.index.matched_count(), current.index.hit_count(), scanned_to))
    }

    /// Register a sink seeded up to `offered_to`, feeding it whatever the
    /// coordinator processed beyond that first
    fn attach_sink(&self, mut sink: CascadingSink) {
        let source = self.current_source();
        let fetch = |line: usize| source.line(line);
        let processed = self.filter.lock().processed;
        for line_no in sink.offered_to()..processed {
            let Some(text) = source.line(line_no) else {
                warn!(sink = %sink.id(), line_no, "Source ended while catching up sink");
                break;
            };
            sink.process_line(line_no, &text, processed, &fetch);
        }
        info!(sink = %sink.id(), fed = sink.fed_count(), "Opened cascading sink");
        self.sinks.lock().insert(sink);
    }

    fn prune_sinks(&self) {
        let pruned = self.sinks.lock().prune_dead();
        for id in pruned {
            info!(sink = %id, "Pruned dead cascading sink");
            self.emit(ViewEvent::SinkPruned(id));
        }
    }

    fn set_status(&self, status: CoordinatorStatus) {
        *self.status.write() = status;
    }
}

/// Whether an event moves existing lines to new numbers
fn renumbers(event: &SourceEvent) -> bool {
    match event {
        SourceEvent::Growth(growth) => growth.is_rollover && growth.rollover_offset > 0,
        SourceEvent::Restored => true,
        SourceEvent::Lost => false,
    }
}

/// How the coordinator dealt with a finished filter pass
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum PassInstall {
    Installed { matched: usize, hits: usize, scanned: usize },
    /// The source renumbered since the pass started; run it again
    Stale,
    /// A newer filter replaced this one, or the view is gone
    Superseded,
}

/// How the coordinator dealt with a freshly seeded sink
pub(crate) enum SinkAttach {
    Attached,
    /// The source renumbered while seeding; seed again
    Stale,
    Closed,
}

enum Command {
    Source {
        generation: u64,
        event: SourceEvent,
    },
    Reattach(Arc<dyn LineSource>),
    InstallPass {
        filter: Arc<CompiledFilter>,
        result: PassResult,
        epoch: u64,
        reply: oneshot::Sender<PassInstall>,
    },
    AttachSink {
        sink: CascadingSink,
        epoch: u64,
        reply: oneshot::Sender<SinkAttach>,
    },
    Flush(oneshot::Sender<()>),
    Shutdown,
}

/// Queues source events for the coordinator without blocking the source.
///
/// Unsubscribes itself once the view was reattached to another source.
struct QueueListener {
    tx: mpsc::UnboundedSender<Command>,
    generation: u64,
    current: Arc<AtomicU64>,
    renumbered: Arc<AtomicU64>,
}

impl SourceListener for QueueListener {
    fn on_event(&self, event: SourceEvent) -> bool {
        if self.current.load(Ordering::Acquire) != self.generation {
            return false;
        }
        if renumbers(&event) {
            self.renumbered.fetch_add(1, Ordering::AcqRel);
        }
        self.tx
            .send(Command::Source {
                generation: self.generation,
                event,
            })
            .is_ok()
    }
}

/// Sending side of a view's coordinator queue, usable from background tasks
#[derive(Clone)]
pub(crate) struct CoordinatorLink {
    tx: mpsc::UnboundedSender<Command>,
}

impl CoordinatorLink {
    /// Hand a finished pass to the coordinator and wait until it was applied.
    ///
    /// Blocks; call from a blocking task only.
    pub(crate) fn install_pass(&self, filter: Arc<CompiledFilter>, result: PassResult, epoch: u64) -> PassInstall {
        let (reply, wait) = oneshot::channel();
        let command = Command::InstallPass {
            filter,
            result,
            epoch,
            reply,
        };
        if self.tx.send(command).is_err() {
            return PassInstall::Superseded;
        }
        wait.blocking_recv().unwrap_or(PassInstall::Superseded)
    }

    /// Hand a seeded sink to the coordinator
    pub(crate) async fn attach_sink(&self, sink: CascadingSink, epoch: u64) -> SinkAttach {
        let (reply, wait) = oneshot::channel();
        if self.tx.send(Command::AttachSink { sink, epoch, reply }).is_err() {
            return SinkAttach::Closed;
        }
        wait.await.unwrap_or(SinkAttach::Closed)
    }
}

/// Handle to a view's coordinator. Dropping it stops the coordinator.
pub struct TailCoordinator {
    tx: mpsc::UnboundedSender<Command>,
}

impl TailCoordinator {
    /// Subscribe to the view's source and start draining.
    ///
    /// Lines already present are processed as one initial growth.
    pub(crate) fn spawn(state: Arc<ViewState>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let source = state.current_source();
        let current = Arc::new(AtomicU64::new(0));
        source.subscribe(Arc::new(QueueListener {
            tx: tx.clone(),
            generation: 0,
            current: current.clone(),
            renumbered: state.renumbered.clone(),
        }));
        let _ = tx.send(Command::Source {
            generation: 0,
            event: SourceEvent::Growth(GrowthEvent::appended(0, source.line_count())),
        });
        let drain = Drain {
            applied: state.renumber_epoch(),
            state,
            tx: tx.clone(),
            generation: 0,
            current,
        };
        tokio::task::spawn_blocking(move || drain.run(rx));
        Self { tx }
    }

    pub(crate) fn link(&self) -> CoordinatorLink {
        CoordinatorLink { tx: self.tx.clone() }
    }

    /// Wait until every event queued before this call has been drained
    pub async fn flush(&self) {
        let (done, wait) = oneshot::channel();
        if self.tx.send(Command::Flush(done)).is_ok() {
            let _ = wait.await;
        }
    }

    /// Switch to a new source. Its content is processed from line 0.
    pub(crate) fn reattach(&self, source: Arc<dyn LineSource>) {
        let _ = self.tx.send(Command::Reattach(source));
    }
}

impl Drop for TailCoordinator {
    fn drop(&mut self) {
        let _ = self.tx.send(Command::Shutdown);
    }
}

struct Drain {
    state: Arc<ViewState>,
    tx: mpsc::UnboundedSender<Command>,
    /// Events from sources of older generations are ignored
    generation: u64,
    current: Arc<AtomicU64>,
    /// Renumberings drained so far; catches up with `ViewState::renumbered`
    applied: u64,
}

impl Drain {
    fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>) {
        while let Some(command) = rx.blocking_recv() {
            match command {
                Command::Source { generation, event } => {
                    if renumbers(&event) {
                        self.applied += 1;
                    }
                    if generation != self.generation {
                        trace!(generation, "Ignoring event from detached source");
                        continue;
                    }
                    match event {
                        SourceEvent::Growth(growth) => self.on_growth(growth),
                        SourceEvent::Lost => self.on_lost(None),
                        SourceEvent::Restored => self.restart(),
                    }
                }
                Command::Reattach(source) => {
                    self.generation += 1;
                    self.current.store(self.generation, Ordering::Release);
                    info!(source = %source.name(), "Reattaching view");
                    source.subscribe(Arc::new(QueueListener {
                        tx: self.tx.clone(),
                        generation: self.generation,
                        current: self.current.clone(),
                        renumbered: self.state.renumbered.clone(),
                    }));
                    *self.state.source.write() = source;
                    self.state.renumbered.fetch_add(1, Ordering::AcqRel);
                    self.applied += 1;
                    self.restart();
                }
                Command::InstallPass {
                    filter,
                    result,
                    epoch,
                    reply,
                } => {
                    let outcome = if !self.is_current(epoch) {
                        PassInstall::Stale
                    } else {
                        match self.state.install_pass(&filter, result) {
                            Some((matched, hits, scanned)) => PassInstall::Installed { matched, hits, scanned },
                            None => PassInstall::Superseded,
                        }
                    };
                    let _ = reply.send(outcome);
                }
                Command::AttachSink { sink, epoch, reply } => {
                    let outcome = if !self.is_current(epoch) {
                        SinkAttach::Stale
                    } else {
                        self.state.attach_sink(sink);
                        SinkAttach::Attached
                    };
                    let _ = reply.send(outcome);
                }
                Command::Flush(done) => {
                    let _ = done.send(());
                }
                Command::Shutdown => break,
            }
        }
        // Listeners still registered with the source unsubscribe on their next event
        self.current.store(u64::MAX, Ordering::Release);
        debug!("Tail coordinator stopped");
    }

    /// Whether line numbers read at `epoch` match both the drained state and
    /// the source as it reads now
    fn is_current(&self, epoch: u64) -> bool {
        epoch == self.applied && epoch == self.state.renumber_epoch()
    }

    fn on_growth(&self, growth: GrowthEvent) {
        if *self.state.status.read() == CoordinatorStatus::SourceLost {
            trace!(?growth, "Discarding growth while source is lost");
            return;
        }
        self.state.set_status(CoordinatorStatus::Draining);

        if growth.is_rollover && growth.rollover_offset > 0 {
            debug!(offset = growth.rollover_offset, "Applying rollover");
            self.state.shift_all(growth.rollover_offset);
            self.state.emit(ViewEvent::RolledOver {
                offset: growth.rollover_offset,
            });
        }

        match self.state.process_new_lines(growth.new_line_count) {
            Ok(()) => {
                self.state.prune_sinks();
                self.state.set_status(CoordinatorStatus::Idle);
                let (matched, hits) = {
                    let state = self.state.filter.lock();
                    (state.index.matched_count(), state.index.hit_count())
                };
                self.state.emit(ViewEvent::Updated {
                    line_count: growth.new_line_count,
                    matched,
                    hits,
                });
            }
            Err(line) => self.on_lost(Some(line)),
        }
    }

    fn on_lost(&self, line: Option<usize>) {
        warn!(line = ?line, source = %self.state.current_source().name(), "Source lost");
        self.state.set_status(CoordinatorStatus::SourceLost);
        self.state.sinks.lock().mark_all_dead();
        self.state.prune_sinks();
        self.state.emit(ViewEvent::SourceLost { line });
    }

    /// Forget everything derived from the old content and process the
    /// current content from line 0
    fn restart(&self) {
        let old = self.state.filter.lock().processed;
        self.state.shift_all(old);
        {
            let mut state = self.state.filter.lock();
            state.scanner = RangeScanner::default();
            if state.filter_from.is_some() {
                state.filter_from = Some(0);
            }
        }
        self.state.bookmarks.lock().clear();
        self.state.row_heights.lock().clear();
        self.state.prune_sinks();
        self.state.set_status(CoordinatorStatus::Idle);

        let line_count = self.state.current_source().line_count();
        info!(line_count, "Source restored");
        self.state.emit(ViewEvent::SourceRestored { line_count });
        self.on_growth(GrowthEvent::appended(0, line_count));
    }
}
