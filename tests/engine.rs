use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{NaiveDate, NaiveDateTime};

use barkview::columnizer::TimestampColumnizer;
use barkview::sources::SourceListener;
use barkview::{
    CoordinatorStatus, Engine, EngineConfig, FilterSpec, LineSource, LogView, MemorySource, SearchParams,
    SearchResult, TaskOutcome, ViewEvent,
};

fn engine() -> Arc<Engine> {
    Engine::new(EngineConfig {
        worker_count: 3,
        progress_interval: 100,
        ..EngineConfig::default()
    })
}

fn numbered(count: usize) -> Vec<String> {
    (0..count).map(|i| format!("line {i}")).collect()
}

async fn filter(view: &LogView, spec: FilterSpec) {
    let outcome = view.start_filter(spec).unwrap().outcome().await;
    assert!(outcome.is_completed(), "filter pass did not complete: {outcome:?}");
}

fn errors_every_seventh(lines: std::ops::Range<usize>) -> Vec<String> {
    lines
        .map(|i| if i % 7 == 0 { format!("ERROR {i}") } else { format!("ok {i}") })
        .collect()
}

/// Rolls the wrapped source over the first time `trigger` is read
struct RollsOverWhenRead {
    inner: Arc<MemorySource>,
    trigger: usize,
    offset: usize,
    fired: AtomicBool,
}

impl LineSource for RollsOverWhenRead {
    fn name(&self) -> String {
        self.inner.name()
    }
    fn line_count(&self) -> usize {
        self.inner.line_count()
    }
    fn line(&self, index: usize) -> Option<Arc<str>> {
        if index == self.trigger && !self.fired.swap(true, Ordering::SeqCst) {
            self.inner.rollover(self.offset, std::iter::empty::<String>());
        }
        self.inner.line(index)
    }
    fn subscribe(&self, listener: Arc<dyn SourceListener>) {
        self.inner.subscribe(listener)
    }
}

/// Delivers every event of the wrapped source twice
struct DeliversTwice(Arc<MemorySource>);

struct Twice(Arc<dyn SourceListener>);

impl SourceListener for Twice {
    fn on_event(&self, event: barkview::SourceEvent) -> bool {
        self.0.on_event(event) && self.0.on_event(event)
    }
}

impl LineSource for DeliversTwice {
    fn name(&self) -> String {
        self.0.name()
    }
    fn line_count(&self) -> usize {
        self.0.line_count()
    }
    fn line(&self, index: usize) -> Option<Arc<str>> {
        self.0.line(index)
    }
    fn subscribe(&self, listener: Arc<dyn SourceListener>) {
        self.0.subscribe(Arc::new(Twice(listener)))
    }
}

fn at_seconds(seconds: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2024, 1, 1)
        .unwrap()
        .and_hms_opt(0, seconds / 60, seconds % 60)
        .unwrap()
}

fn stamped(seconds: &[u32], text: &str) -> Vec<String> {
    seconds
        .iter()
        .map(|&s| format!("{} {text}", at_seconds(s).format("%Y-%m-%d %H:%M:%S")))
        .collect()
}

#[tokio::test]
async fn test_spread_around_single_hit() {
    let engine = engine();
    let mut lines = numbered(10);
    lines[5] = "ERROR disk full".to_string();
    let source = Arc::new(MemorySource::with_lines("app.log", lines));
    let view = engine.open_view(source);

    filter(&view, FilterSpec::literal("ERROR").with_spread(1, 1)).await;

    let snapshot = view.filter_snapshot();
    assert_eq!(snapshot.hit_lines, vec![5]);
    assert_eq!(snapshot.matched_lines, vec![4, 5, 6]);
    assert_eq!(view.filtered_line(1), Some(5));
}

#[tokio::test]
async fn test_spread_behind_completes_as_lines_arrive() {
    let engine = engine();
    let source = Arc::new(MemorySource::with_lines("app.log", ["a", "b", "ERROR x"]));
    let view = engine.open_view(source.clone());
    filter(&view, FilterSpec::literal("error").with_spread(1, 2)).await;
    assert_eq!(view.filter_snapshot().matched_lines, vec![1, 2]);

    source.append_lines(["c", "d", "e"]).unwrap();
    view.flush().await;
    assert_eq!(view.filter_snapshot().matched_lines, vec![1, 2, 3, 4]);
}

#[tokio::test]
async fn test_time_sync_group_of_five() {
    let engine = engine();
    let a = engine.open_view_with(
        Arc::new(MemorySource::with_lines("a", stamped(&[80, 100, 120], "a"))),
        Arc::new(TimestampColumnizer),
    );
    let b = engine.open_view_with(
        Arc::new(MemorySource::with_lines("b", stamped(&[90, 95, 100, 105], "b"))),
        Arc::new(TimestampColumnizer),
    );
    let c = engine.open_view_with(
        Arc::new(MemorySource::with_lines("c", stamped(&[10, 20], "c"))),
        Arc::new(TimestampColumnizer),
    );
    let d = engine.open_view_with(
        Arc::new(MemorySource::with_lines("d", stamped(&[99, 99, 101], "d"))),
        Arc::new(TimestampColumnizer),
    );
    // Every line is later than the group timestamp
    let e = engine.open_view_with(
        Arc::new(MemorySource::with_lines("e", stamped(&[200, 300], "e"))),
        Arc::new(TimestampColumnizer),
    );

    let group = a.join_time_sync(&b).unwrap();
    for other in [&c, &d, &e] {
        assert_eq!(a.join_time_sync(other).unwrap(), group);
    }
    assert_eq!(engine.timesync().members(group).len(), 5);

    assert_eq!(a.set_timestamp(at_seconds(100)), 4);
    assert_eq!(b.selected_line(), Some(2));
    assert_eq!(c.selected_line(), Some(1));
    // Earliest of equal timestamps
    assert_eq!(d.selected_line(), Some(0));
    assert_eq!(e.selected_line(), None);
    assert_eq!(engine.timesync().current_timestamp(group), Some(at_seconds(100)));
}

#[tokio::test]
async fn test_dropped_view_leaves_group() {
    let engine = engine();
    let a = engine.open_view(Arc::new(MemorySource::with_lines("a", stamped(&[1], "a"))));
    let b = engine.open_view(Arc::new(MemorySource::with_lines("b", stamped(&[1], "b"))));
    let c = engine.open_view(Arc::new(MemorySource::with_lines("c", stamped(&[1], "c"))));
    let group = a.join_time_sync(&b).unwrap();
    a.join_time_sync(&c).unwrap();

    drop(c);
    assert_eq!(engine.timesync().members(group).len(), 2);
    drop(b);
    // A group of one dissolves
    assert_eq!(a.time_sync_group(), None);
}

#[tokio::test]
async fn test_rollover_renumbers_bookmarks() {
    let engine = engine();
    let source = Arc::new(MemorySource::with_lines("app.log", numbered(10)));
    let view = engine.open_view(source.clone());
    view.flush().await;
    view.toggle_bookmark(2);
    view.toggle_bookmark(7);
    let mut events = view.subscribe();

    source.rollover(3, std::iter::empty::<String>());
    view.flush().await;

    let lines: Vec<usize> = view.bookmarks().iter().map(|b| b.line).collect();
    assert_eq!(lines, vec![4]);
    assert_eq!(events.recv().await.unwrap(), ViewEvent::RolledOver { offset: 3 });
}

#[tokio::test]
async fn test_rollover_renumbers_filter_index() {
    let engine = engine();
    let source = Arc::new(MemorySource::with_lines("app.log", ["ERROR 0", "ok", "ERROR 2", "ok", "ERROR 4"]));
    let view = engine.open_view(source.clone());
    filter(&view, FilterSpec::literal("error")).await;

    source.rollover(2, ["ERROR 5"]);
    view.flush().await;
    assert_eq!(view.filter_snapshot().hit_lines, vec![0, 2, 3]);
}

#[tokio::test]
async fn test_cascading_sinks_feed_derived_views() {
    let engine = engine();
    let source = Arc::new(MemorySource::with_lines(
        "app.log",
        ["db connect", "http ok", "db timeout", "cache miss"],
    ));
    let parent = engine.open_view(source.clone());
    parent.flush().await;

    let sink = parent.open_cascading_sink(FilterSpec::literal("db")).await.unwrap();
    let store = parent.sink_source(sink).unwrap();
    assert_eq!(store.line_count(), 2);
    assert_eq!(parent.sink_original_line(sink, 1), Some(2));

    let derived = engine.open_sink_view(&parent, sink).unwrap();
    derived.flush().await;
    let nested = derived.open_cascading_sink(FilterSpec::literal("timeout")).await.unwrap();
    let nested_store = derived.sink_source(nested).unwrap();
    assert_eq!(nested_store.line_count(), 1);

    source.append_lines(["db timeout again", "http ok"]).unwrap();
    parent.flush().await;
    derived.flush().await;
    assert_eq!(store.line_count(), 3);
    assert_eq!(nested_store.line_count(), 2);
    assert_eq!(nested_store.line(1).as_deref(), Some("db timeout again"));
    assert_eq!(derived.sink_original_line(nested, 1), Some(2));

    drop(derived);
    assert!(parent.sink_ids().is_empty());
    assert!(store.is_closed());
}

#[tokio::test]
async fn test_lost_source_prunes_sinks() {
    let engine = engine();
    let source = Arc::new(MemorySource::with_lines("app.log", ["db a", "db b"]));
    let parent = engine.open_view(source.clone());
    parent.flush().await;
    let sink = parent.open_cascading_sink(FilterSpec::literal("db")).await.unwrap();
    let derived = engine.open_sink_view(&parent, sink).unwrap();
    derived.flush().await;
    let mut events = parent.subscribe();

    source.mark_lost();
    parent.flush().await;
    assert_eq!(parent.status(), CoordinatorStatus::SourceLost);
    assert!(parent.sink_ids().is_empty());

    let mut pruned = false;
    while let Ok(event) = events.try_recv() {
        pruned |= event == ViewEvent::SinkPruned(sink);
    }
    assert!(pruned);

    derived.flush().await;
    assert_eq!(derived.status(), CoordinatorStatus::SourceLost);
}

#[tokio::test]
async fn test_filter_pass_races_with_tail() {
    let engine = engine();
    let source = Arc::new(MemorySource::with_lines("app.log", errors_every_seventh(0..5000)));
    let view = engine.open_view(source.clone());
    let spec = FilterSpec::literal("error").with_spread(2, 1);

    let handle = view.start_filter(spec.clone()).unwrap();
    for text in errors_every_seventh(5000..6000) {
        source.append(text).unwrap();
    }
    assert!(handle.outcome().await.is_completed());
    view.flush().await;

    let fresh = engine.open_view(source);
    fresh.flush().await;
    filter(&fresh, spec).await;

    let live = view.filter_snapshot();
    let rebuilt = fresh.filter_snapshot();
    assert_eq!(live.line_count, 6000);
    assert_eq!(live.hit_lines, rebuilt.hit_lines);
    assert_eq!(live.matched_lines, rebuilt.matched_lines);
}

#[tokio::test]
async fn test_rollover_during_filter_pass_reruns_it() {
    let engine = engine();
    let inner = Arc::new(MemorySource::with_lines("app.log", errors_every_seventh(0..5000)));
    let source = Arc::new(RollsOverWhenRead {
        inner: inner.clone(),
        trigger: 2500,
        offset: 1000,
        fired: AtomicBool::new(false),
    });
    let view = engine.open_view(source.clone());
    let spec = FilterSpec::literal("ERROR");

    filter(&view, spec.clone()).await;
    view.flush().await;
    assert!(source.fired.load(Ordering::SeqCst));

    let fresh = engine.open_view(inner.clone());
    fresh.flush().await;
    filter(&fresh, spec).await;

    let live = view.filter_snapshot();
    let rebuilt = fresh.filter_snapshot();
    assert_eq!(live.line_count, 4000);
    assert_eq!(live.hit_lines, rebuilt.hit_lines);
    assert_eq!(live.matched_lines, rebuilt.matched_lines);
    for &line in &live.hit_lines {
        assert!(inner.line(line).unwrap().contains("ERROR"), "line {line} is not a hit");
    }
}

#[tokio::test]
async fn test_duplicate_growth_events_change_nothing() {
    let engine = engine();
    let inner = Arc::new(MemorySource::with_lines("app.log", ["ok", "ERROR 1", "ok"]));
    let view = engine.open_view(Arc::new(DeliversTwice(inner.clone())));
    filter(&view, FilterSpec::literal("error").with_spread(1, 1)).await;
    let sink = view.open_cascading_sink(FilterSpec::literal("error")).await.unwrap();
    let store = view.sink_source(sink).unwrap();
    assert_eq!(store.line_count(), 1);

    inner.append_lines(["ok", "ERROR 4", "ok", "ok"]).unwrap();
    view.flush().await;

    let snapshot = view.filter_snapshot();
    assert_eq!(snapshot.matched_lines, vec![0, 1, 2, 3, 4, 5]);
    assert_eq!(snapshot.hit_lines, vec![1, 4]);
    assert_eq!(snapshot.line_count, 7);
    assert_eq!(store.line_count(), 2);
    assert_eq!(view.sink_original_line(sink, 1), Some(4));
}

#[tokio::test]
async fn test_sink_opened_while_source_grows() {
    let engine = engine();
    let source = Arc::new(MemorySource::with_lines("app.log", errors_every_seventh(0..3000)));
    let view = engine.open_view(source.clone());

    let opening = view.open_cascading_sink(FilterSpec::literal("error"));
    let appending = async {
        for text in errors_every_seventh(3000..3500) {
            source.append(text).unwrap();
            tokio::task::yield_now().await;
        }
    };
    let (sink, ()) = tokio::join!(opening, appending);
    let sink = sink.unwrap();
    view.flush().await;

    let store = view.sink_source(sink).unwrap();
    assert_eq!(store.line_count(), 500);
    let origins: Vec<usize> = (0..500).filter_map(|i| view.sink_original_line(sink, i)).collect();
    assert_eq!(origins, (0..3500).step_by(7).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_newer_filter_supersedes_running_pass() {
    let engine = engine();
    let source = Arc::new(MemorySource::with_lines("app.log", numbered(20_000)));
    let view = engine.open_view(source);

    let first = view.start_filter(FilterSpec::literal("line 1")).unwrap();
    filter(&view, FilterSpec::literal("line 19999")).await;

    // The superseded pass never installs, whichever way it ended
    first.outcome().await;
    assert_eq!(view.filter_snapshot().hit_lines, vec![19999]);
}

#[tokio::test]
async fn test_search_wraps_around() {
    let engine = engine();
    let source = Arc::new(MemorySource::with_lines("app.log", ["panic: boom", "ok", "ok"]));
    let view = engine.open_view(source);

    let found = view.search(SearchParams::new("PANIC").from_line(1)).unwrap().outcome().await;
    assert!(matches!(found, TaskOutcome::Completed(SearchResult::Found(0))));

    let missing = view
        .search(SearchParams::new("PANIC").from_line(1).no_wrap())
        .unwrap()
        .outcome()
        .await;
    assert!(matches!(missing, TaskOutcome::Completed(SearchResult::NotFound)));

    assert!(view.search(SearchParams::new("(").regex()).is_err());
}

#[tokio::test]
async fn test_reattach_resets_annotations() {
    let engine = engine();
    let first = Arc::new(MemorySource::with_lines("first.log", ["ERROR a", "ok"]));
    let view = engine.open_view(first);
    filter(&view, FilterSpec::literal("error")).await;
    view.toggle_bookmark(1);

    let second = Arc::new(MemorySource::with_lines("second.log", ["ok", "ok", "ERROR b"]));
    view.reattach(second);
    view.flush().await;

    assert!(view.bookmarks().is_empty());
    assert_eq!(view.filter_snapshot().hit_lines, vec![2]);
    assert_eq!(view.source().name(), "second.log");
}
