//! Presentation-facing API.
//!
//! An `Engine` owns what views share: configuration, the filter worker pool
//! and the time sync registry. Each `LogView` follows one line source with
//! its own coordinator, filter, annotations and cascading sinks.
//!
//! Views must be created and filtered from within a Tokio runtime.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use chrono::NaiveDateTime;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::annotations::{Bookmark, RowHeight};
use crate::columnizer::{Columnizer, PlainColumnizer, columnizer_by_name};
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::filter::{
    CompiledFilter, FilterSpec, PassContext, PassEnd, RangeScanner, build_filter_pool, parallel_rebuild, rebuild,
};
use crate::persist::ViewPersistence;
use crate::search::{self, SearchParams, SearchResult};
use crate::sink::{CascadingSink, SinkId};
use crate::sources::{LineSource, MemorySource};
use crate::tail::{CoordinatorStatus, PassInstall, SinkAttach, TailCoordinator, ViewEvent, ViewState};
use crate::task::{CancelToken, TaskHandle, TaskOutcome, task_channel};
use crate::timesync::{GroupId, TimeSyncMember, TimeSyncRegistry, ViewId, effective_timestamp};

/// Shared services for a set of views
pub struct Engine {
    config: EngineConfig,
    pool: Option<Arc<rayon::ThreadPool>>,
    timesync: TimeSyncRegistry,
    next_view: AtomicU64,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Arc<Self> {
        let pool = if config.parallel_filter {
            build_filter_pool(config.worker_count).map(Arc::new)
        } else {
            None
        };
        info!(
            workers = pool.as_ref().map(|p| p.current_num_threads()).unwrap_or(0),
            max_spread = config.max_spread,
            "Engine started"
        );
        Arc::new(Self {
            config,
            pool,
            timesync: TimeSyncRegistry::new(),
            next_view: AtomicU64::new(1),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn timesync(&self) -> &TimeSyncRegistry {
        &self.timesync
    }

    /// Open a view using the plain columnizer
    pub fn open_view(self: &Arc<Self>, source: Arc<dyn LineSource>) -> LogView {
        self.open_view_with(source, Arc::new(PlainColumnizer))
    }

    pub fn open_view_with(self: &Arc<Self>, source: Arc<dyn LineSource>, columnizer: Arc<dyn Columnizer>) -> LogView {
        let id = self.next_view.fetch_add(1, Ordering::Relaxed);
        debug!(view = id, source = %source.name(), "Opening view");
        let state = Arc::new(ViewState::new(self.config.clone(), source, columnizer));
        let member: Arc<dyn TimeSyncMember> = state.clone();
        self.timesync.register(id, Arc::downgrade(&member));
        let coordinator = TailCoordinator::spawn(state.clone());
        LogView {
            id,
            engine: self.clone(),
            state,
            coordinator,
            running_filter: Mutex::new(None),
            origin: None,
        }
    }

    /// Open a view on the store of one of `parent`'s cascading sinks.
    ///
    /// Dropping the returned view closes the sink.
    pub fn open_sink_view(self: &Arc<Self>, parent: &LogView, sink: SinkId) -> Result<LogView> {
        let store = parent.sink_source(sink).ok_or(EngineError::UnknownSink(sink))?;
        let columnizer = parent.state.columnizer.read().clone();
        let mut view = self.open_view_with(store, columnizer);
        view.origin = Some(SinkOrigin {
            parent: Arc::downgrade(&parent.state),
            sink,
        });
        Ok(view)
    }
}

/// Where a derived view's lines come from
struct SinkOrigin {
    parent: Weak<ViewState>,
    sink: SinkId,
}

/// Copy of a view's filter results
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FilterSnapshot {
    pub spec: Option<FilterSpec>,
    pub matched_lines: Vec<usize>,
    pub hit_lines: Vec<usize>,
    /// Lines of the source processed so far
    pub line_count: usize,
}

/// Result of a bulk filter pass
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FilterSummary {
    pub matched: usize,
    pub hits: usize,
    /// Lines examined by the pass itself
    pub scanned: usize,
    pub elapsed: Duration,
    pub parallel: bool,
}

pub struct LogView {
    id: ViewId,
    engine: Arc<Engine>,
    state: Arc<ViewState>,
    coordinator: TailCoordinator,
    running_filter: Mutex<Option<CancelToken>>,
    origin: Option<SinkOrigin>,
}

impl LogView {
    pub fn id(&self) -> ViewId {
        self.id
    }

    pub fn source(&self) -> Arc<dyn LineSource> {
        self.state.current_source()
    }

    pub fn line_count(&self) -> usize {
        self.state.current_source().line_count()
    }

    pub fn status(&self) -> CoordinatorStatus {
        *self.state.status.read()
    }

    /// Observe updates, rollovers, sink pruning and loss of the source
    pub fn subscribe(&self) -> broadcast::Receiver<ViewEvent> {
        self.state.events.subscribe()
    }

    /// Wait until every source event queued so far has been processed
    pub async fn flush(&self) {
        self.coordinator.flush().await;
    }

    /// Follow a different source. Line numbering restarts; the filter is
    /// re-applied to the new content and annotations are reset.
    pub fn reattach(&self, source: Arc<dyn LineSource>) {
        self.coordinator.reattach(source);
    }

    pub fn columnizer(&self) -> Arc<dyn Columnizer> {
        self.state.columnizer.read().clone()
    }

    /// Takes effect for the next filter pass
    pub fn set_columnizer(&self, columnizer: Arc<dyn Columnizer>) {
        *self.state.columnizer.write() = columnizer;
    }

    // Filtering

    pub fn filter_snapshot(&self) -> FilterSnapshot {
        let state = self.state.filter.lock();
        FilterSnapshot {
            spec: state.filter.as_ref().map(|f| f.spec().clone()),
            matched_lines: state.index.matched_lines().to_vec(),
            hit_lines: state.index.hit_lines().to_vec(),
            line_count: state.processed,
        }
    }

    pub fn matched_count(&self) -> usize {
        self.state.filter.lock().index.matched_count()
    }

    pub fn hit_count(&self) -> usize {
        self.state.filter.lock().index.hit_count()
    }

    pub fn is_filtered(&self) -> bool {
        self.state.filter.lock().filter.is_some()
    }

    /// Source line shown at `row` of the filtered view
    pub fn filtered_line(&self, row: usize) -> Option<usize> {
        self.state.filter.lock().index.matched_lines().get(row).copied()
    }

    /// Replace the active filter and rebuild the index in the background.
    ///
    /// A running pass is cancelled first. An invalid pattern is reported here
    /// and leaves the current filter untouched.
    pub fn start_filter(&self, spec: FilterSpec) -> Result<TaskHandle<FilterSummary>> {
        let spec = spec.clamped(self.state.config.max_spread);
        let columnizer = self.columnizer();
        let filter = Arc::new(CompiledFilter::compile(spec, columnizer)?);

        let cancel = CancelToken::new();
        if let Some(previous) = self.running_filter.lock().replace(cancel.clone()) {
            previous.cancel();
        }

        {
            let mut state = self.state.filter.lock();
            state.filter = Some(filter.clone());
            state.index.clear();
            state.scanner = RangeScanner::default();
            state.filter_from = None;
        }

        let (handle, reporter) = task_channel(cancel.clone());
        let state = self.state.clone();
        let pool = self.engine.pool.clone();
        let link = self.coordinator.link();
        tokio::task::spawn_blocking(move || {
            let progress = reporter.progress_sender();
            let report = |done: usize, total: usize| progress.report(done, total);
            let parallel = state.config.parallel_filter && pool.is_some();
            let started = Instant::now();

            // A pass that saw the source renumber runs again on the new numbering
            let outcome = loop {
                let epoch = state.renumber_epoch();
                let source = state.current_source();
                let renumbered = || state.renumber_epoch() != epoch;
                let ctx = PassContext {
                    source: source.as_ref(),
                    cancel: &cancel,
                    progress_interval: state.config.progress_interval,
                    window_cap: state.config.context_window_cap(),
                    progress: &report,
                    renumbered: &renumbered,
                };
                let result = match pool.as_deref() {
                    Some(pool) if parallel => parallel_rebuild(&filter, &ctx, pool),
                    _ => rebuild(&filter, &ctx),
                };
                let end = result.end;

                let install = if end == PassEnd::Renumbered || renumbered() {
                    PassInstall::Stale
                } else {
                    link.install_pass(filter.clone(), result, epoch)
                };
                match install {
                    PassInstall::Stale if cancel.is_cancelled() => {
                        break TaskOutcome::Cancelled(FilterSummary::default());
                    }
                    PassInstall::Stale => {
                        debug!(epoch, "Source renumbered during filter pass, starting over");
                    }
                    PassInstall::Superseded => {
                        debug!("Filter pass superseded");
                        break TaskOutcome::Cancelled(FilterSummary::default());
                    }
                    PassInstall::Installed { matched, hits, scanned } => {
                        let elapsed = started.elapsed();
                        let summary = FilterSummary {
                            matched,
                            hits,
                            scanned,
                            elapsed,
                            parallel,
                        };
                        info!(
                            pattern = %filter.spec().search_text,
                            matched,
                            hits,
                            scanned,
                            elapsed_ms = elapsed.as_millis() as u64,
                            parallel,
                            "Filter pass finished"
                        );
                        state.emit(ViewEvent::FilterApplied { matched, hits });
                        break match end {
                            PassEnd::Cancelled => TaskOutcome::Cancelled(summary),
                            PassEnd::SourceEnded(line) => TaskOutcome::Failed(EngineError::SourceUnavailable {
                                source_name: source.name(),
                                line,
                            }),
                            PassEnd::Completed | PassEnd::Renumbered => TaskOutcome::Completed(summary),
                        };
                    }
                }
            };
            reporter.finish(outcome);
        });
        Ok(handle)
    }

    /// Cancel the running filter pass, if any
    pub fn cancel_filter(&self) {
        if let Some(cancel) = self.running_filter.lock().take() {
            cancel.cancel();
        }
    }

    /// Drop the active filter; the view shows every line again
    pub fn clear_filter(&self) {
        self.cancel_filter();
        {
            let mut state = self.state.filter.lock();
            state.filter = None;
            state.index.clear();
            state.scanner = RangeScanner::default();
            state.filter_from = Some(0);
        }
        self.state.emit(ViewEvent::FilterApplied { matched: 0, hits: 0 });
    }

    // Search

    /// Search the source in the background
    pub fn search(&self, params: SearchParams) -> Result<TaskHandle<SearchResult>> {
        params.matcher()?;
        let cancel = CancelToken::new();
        let (handle, reporter) = task_channel(cancel.clone());
        let source = self.state.current_source();
        let interval = self.state.config.progress_interval;
        tokio::task::spawn_blocking(move || {
            let progress = reporter.progress_sender();
            let report = |done: usize, total: usize| progress.report(done, total);
            let outcome = match search::search(source.as_ref(), &params, &cancel, interval, &report) {
                Ok(SearchResult::Cancelled) => TaskOutcome::Cancelled(SearchResult::Cancelled),
                Ok(result) => TaskOutcome::Completed(result),
                Err(e) => TaskOutcome::Failed(e),
            };
            reporter.finish(outcome);
        });
        Ok(handle)
    }

    // Cascading sinks

    /// Start forwarding lines that pass `spec` to a new derived store.
    ///
    /// Lines already in the source are fed on a blocking task before the sink
    /// is registered; later appends follow.
    pub async fn open_cascading_sink(&self, spec: FilterSpec) -> Result<SinkId> {
        let spec = spec.clamped(self.state.config.max_spread);
        let filter = Arc::new(CompiledFilter::compile(spec, self.columnizer())?);
        let id = self.state.sinks.lock().allocate_id();
        let link = self.coordinator.link();

        loop {
            let state = self.state.clone();
            let filter = filter.clone();
            let (sink, epoch) = tokio::task::spawn_blocking(move || seed_sink(&state, id, filter))
                .await
                .map_err(|_| EngineError::Cancelled)?;
            match link.attach_sink(sink, epoch).await {
                SinkAttach::Attached => return Ok(id),
                SinkAttach::Stale => debug!(sink = %id, "Source renumbered while seeding sink, seeding again"),
                SinkAttach::Closed => return Err(EngineError::ViewClosed),
            }
        }
    }

    pub fn close_cascading_sink(&self, id: SinkId) -> Result<()> {
        let mut sink = self
            .state
            .sinks
            .lock()
            .remove(id)
            .ok_or(EngineError::UnknownSink(id))?;
        sink.close();
        Ok(())
    }

    /// Derived store of a sink, usable as the source of another view
    pub fn sink_source(&self, id: SinkId) -> Option<Arc<MemorySource>> {
        self.state.sinks.lock().get(id).map(|s| s.store())
    }

    pub fn sink_ids(&self) -> Vec<SinkId> {
        self.state.sinks.lock().ids()
    }

    /// Line of this view a sink's derived line came from
    pub fn sink_original_line(&self, id: SinkId, derived: usize) -> Option<usize> {
        self.state.sinks.lock().get(id)?.original_line(derived)
    }

    // Bookmarks

    pub fn toggle_bookmark(&self, line: usize) -> bool {
        self.state.bookmarks.lock().toggle(line)
    }

    /// Bookmark without disturbing an existing entry
    pub fn add_bookmark(&self, line: usize) -> bool {
        self.state.bookmarks.lock().add(Bookmark::new(line))
    }

    /// Bookmark set by a trigger; replaces any existing comment
    pub fn set_bookmark_from_trigger(&self, line: usize, comment: impl Into<String>) {
        self.state.bookmarks.lock().set(Bookmark {
            line,
            comment: Some(comment.into()),
        });
    }

    pub fn set_bookmark_comment(&self, line: usize, comment: impl Into<String>) {
        self.state.bookmarks.lock().set_comment(line, comment);
    }

    pub fn remove_bookmarks(&self, lines: &[usize]) -> usize {
        self.state.bookmarks.lock().remove_many(lines)
    }

    pub fn is_bookmarked(&self, line: usize) -> bool {
        self.state.bookmarks.lock().contains(line)
    }

    pub fn bookmarks(&self) -> Vec<Bookmark> {
        self.state.bookmarks.lock().iter().cloned().collect()
    }

    pub fn next_bookmark(&self, from: usize, forward: bool) -> Option<usize> {
        self.state.bookmarks.lock().next_from(from, forward)
    }

    /// Next bookmark on a line shown by the filtered view
    pub fn next_visible_bookmark(&self, from: usize, forward: bool) -> Option<usize> {
        let visible = {
            let state = self.state.filter.lock();
            state.filter.as_ref().map(|_| state.index.clone())
        };
        let marks = self.state.bookmarks.lock();
        match visible {
            Some(index) => marks.next_matching(from, forward, |line| index.contains(line)),
            None => marks.next_from(from, forward),
        }
    }

    // Row heights

    pub fn row_height(&self, line: usize) -> u32 {
        self.state.row_heights.lock().height(line)
    }

    pub fn increase_row_height(&self, line: usize) -> u32 {
        self.state.row_heights.lock().increase(line)
    }

    pub fn decrease_row_height(&self, line: usize) -> u32 {
        self.state.row_heights.lock().decrease(line)
    }

    pub fn row_heights(&self) -> Vec<RowHeight> {
        self.state.row_heights.lock().entries()
    }

    // Selection and time sync

    pub fn selected_line(&self) -> Option<usize> {
        *self.state.selected.lock()
    }

    /// Select a line. A synchronized view moves the rest of its group to the
    /// line's timestamp.
    pub fn select_line(&self, line: usize) {
        *self.state.selected.lock() = Some(line);
        if !self.engine.timesync.is_synced(self.id) {
            return;
        }
        if let Some(timestamp) = effective_timestamp(self.state.as_ref(), line) {
            self.engine.timesync.set_timestamp(self.id, timestamp);
        }
    }

    pub fn join_time_sync(&self, other: &LogView) -> Result<GroupId> {
        self.engine.timesync.join(self.id, other.id)
    }

    pub fn leave_time_sync(&self) {
        self.engine.timesync.leave(self.id);
    }

    pub fn time_sync_group(&self) -> Option<GroupId> {
        self.engine.timesync.group_of(self.id)
    }

    /// Announce a timestamp to the group; returns how many views followed
    pub fn set_timestamp(&self, timestamp: NaiveDateTime) -> usize {
        self.engine.timesync.set_timestamp(self.id, timestamp)
    }

    // Persistence

    pub fn persistence(&self) -> ViewPersistence {
        let (filter, matched_count) = {
            let state = self.state.filter.lock();
            (
                state.filter.as_ref().map(|f| f.spec().clone()),
                state.index.matched_count(),
            )
        };
        ViewPersistence {
            source_name: self.state.current_source().name(),
            columnizer: self.columnizer().name().to_string(),
            filter,
            matched_count,
            bookmarks: self.bookmarks(),
            row_heights: self.row_heights(),
            sinks: self.state.sinks.lock().specs(),
            selected_line: self.selected_line(),
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        self.persistence().save(path)
    }

    /// Re-apply saved state: annotations directly, the filter and sinks by
    /// running them again over the current content.
    pub async fn restore(&self, saved: &ViewPersistence) -> Result<RestoredView> {
        match columnizer_by_name(&saved.columnizer) {
            Some(columnizer) => self.set_columnizer(columnizer),
            None if saved.columnizer.is_empty() => {}
            None => warn!(columnizer = %saved.columnizer, "Unknown columnizer, keeping current"),
        }
        {
            let mut marks = self.state.bookmarks.lock();
            marks.clear();
            for mark in &saved.bookmarks {
                marks.set(mark.clone());
            }
        }
        {
            let mut rows = self.state.row_heights.lock();
            rows.clear();
            for row in &saved.row_heights {
                rows.set(row.line, row.height);
            }
        }
        *self.state.selected.lock() = saved.selected_line;

        let filter = saved.filter.clone().map(|spec| self.start_filter(spec)).transpose()?;
        let mut sinks = Vec::with_capacity(saved.sinks.len());
        for spec in &saved.sinks {
            sinks.push(self.open_cascading_sink(spec.clone()).await?);
        }
        Ok(RestoredView { filter, sinks })
    }

    pub async fn load(&self, path: &Path) -> Result<RestoredView> {
        let saved = ViewPersistence::load(path)?;
        self.restore(&saved).await
    }
}

/// What `LogView::restore` started
pub struct RestoredView {
    pub filter: Option<TaskHandle<FilterSummary>>,
    pub sinks: Vec<SinkId>,
}

impl Drop for LogView {
    fn drop(&mut self) {
        self.cancel_filter();
        self.engine.timesync.unregister(self.id);
        if let Some(origin) = &self.origin {
            if let Some(parent) = origin.parent.upgrade() {
                if let Some(mut sink) = parent.sinks.lock().remove(origin.sink) {
                    sink.close();
                }
            }
        }
    }
}

/// Feed a new sink every line the source holds now.
///
/// Returns the sink with the renumbering epoch its line numbers belong to.
/// Seeding stops early once the source renumbers; the coordinator then
/// rejects the sink as stale.
fn seed_sink(state: &ViewState, id: SinkId, filter: Arc<CompiledFilter>) -> (CascadingSink, u64) {
    let epoch = state.renumber_epoch();
    let source = state.current_source();
    let fetch = |line: usize| source.line(line);
    let store = Arc::new(MemorySource::new(format!("{} {}", source.name(), id)));
    let mut sink = CascadingSink::new(id, filter, store, state.config.context_window_cap());

    let end = source.line_count();
    let interval = state.config.progress_interval.max(1);
    for line_no in 0..end {
        if line_no % interval == 0 && state.renumber_epoch() != epoch {
            break;
        }
        let Some(text) = source.line(line_no) else {
            warn!(sink = %id, line_no, "Source ended while seeding sink");
            break;
        };
        sink.process_line(line_no, &text, end, &fetch);
    }
    debug!(sink = %id, seeded = sink.offered_to(), fed = sink.fed_count(), "Seeded cascading sink");
    (sink, epoch)
}

impl TimeSyncMember for ViewState {
    fn line_count(&self) -> usize {
        self.current_source().line_count()
    }

    fn timestamp_at(&self, line: usize) -> Option<NaiveDateTime> {
        let text = self.current_source().line(line)?;
        self.columnizer.read().timestamp(&text)
    }

    fn current_line(&self) -> Option<usize> {
        *self.selected.lock()
    }

    fn sync_to_line(&self, line: usize) {
        *self.selected.lock() = Some(line);
        self.emit(ViewEvent::SyncScroll { line });
    }
}
