use std::io;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::debug;

use super::{GrowthEvent, LineSource, SourceEvent, SourceListener};

/// In-memory append-only line store.
///
/// Serves as the backing store of cascading sinks and as the buffer the
/// binary fills from a tailed file. Every mutation notifies listeners while
/// the store is still locked, so listeners observe events in mutation order.
pub struct MemorySource {
    name: String,
    inner: RwLock<Inner>,
    listeners: Mutex<Vec<Arc<dyn SourceListener>>>,
}

#[derive(Default)]
struct Inner {
    lines: Vec<Arc<str>>,
    /// Lookups fail while lost
    lost: bool,
    /// Released: lookups and appends fail for good
    closed: bool,
}

impl MemorySource {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            inner: RwLock::new(Inner::default()),
            listeners: Mutex::new(Vec::new()),
        }
    }

    /// Source pre-filled with lines. No events are emitted for them.
    pub fn with_lines<I, S>(name: impl Into<String>, lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<Arc<str>>,
    {
        let source = Self::new(name);
        source.inner.write().lines = lines.into_iter().map(Into::into).collect();
        source
    }

    /// Append one line
    pub fn append(&self, line: impl Into<Arc<str>>) -> io::Result<()> {
        self.append_lines(std::iter::once(line.into())).map(|_| ())
    }

    /// Append a batch of lines, emitting a single growth event
    pub fn append_lines<I, S>(&self, lines: I) -> io::Result<usize>
    where
        I: IntoIterator<Item = S>,
        S: Into<Arc<str>>,
    {
        let mut inner = self.inner.write();
        if inner.closed {
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                format!("source '{}' is closed", self.name),
            ));
        }
        let previous = inner.lines.len();
        inner.lines.extend(lines.into_iter().map(Into::into));
        let added = inner.lines.len() - previous;
        if added > 0 && !inner.lost {
            self.notify(SourceEvent::Growth(GrowthEvent::appended(previous, inner.lines.len())));
        }
        Ok(added)
    }

    /// Drop the first `offset` lines and append `replacement`, as happens when
    /// a log file is rotated or truncated and rewritten.
    pub fn rollover<I, S>(&self, offset: usize, replacement: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<Arc<str>>,
    {
        let mut inner = self.inner.write();
        if inner.closed {
            return;
        }
        let previous = inner.lines.len();
        let offset = offset.min(previous);
        inner.lines.drain(..offset);
        inner.lines.extend(replacement.into_iter().map(Into::into));
        debug!(source = %self.name, offset, previous, now = inner.lines.len(), "Source rolled over");
        if !inner.lost {
            self.notify(SourceEvent::Growth(GrowthEvent::rollover(
                previous,
                inner.lines.len(),
                offset,
            )));
        }
    }

    /// Make every lookup fail until `restart` is called
    pub fn mark_lost(&self) {
        let mut inner = self.inner.write();
        if inner.lost || inner.closed {
            return;
        }
        inner.lost = true;
        debug!(source = %self.name, "Source lost");
        self.notify(SourceEvent::Lost);
    }

    /// Replace the whole content and make the source readable again
    pub fn restart<I, S>(&self, lines: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<Arc<str>>,
    {
        let mut inner = self.inner.write();
        if inner.closed {
            return;
        }
        inner.lines = lines.into_iter().map(Into::into).collect();
        inner.lost = false;
        debug!(source = %self.name, lines = inner.lines.len(), "Source restarted");
        self.notify(SourceEvent::Restored);
    }

    /// Release the stored lines. Further appends fail.
    ///
    /// Listeners get a final `Lost` event and are then dropped.
    pub fn close(&self) {
        let mut inner = self.inner.write();
        if inner.closed {
            return;
        }
        inner.closed = true;
        inner.lines = Vec::new();
        if !inner.lost {
            self.notify(SourceEvent::Lost);
        }
        self.listeners.lock().clear();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.read().closed
    }

    pub fn is_lost(&self) -> bool {
        self.inner.read().lost
    }

    fn notify(&self, event: SourceEvent) {
        self.listeners.lock().retain(|listener| listener.on_event(event));
    }
}

impl LineSource for MemorySource {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn line_count(&self) -> usize {
        self.inner.read().lines.len()
    }

    fn line(&self, index: usize) -> Option<Arc<str>> {
        let inner = self.inner.read();
        if inner.lost || inner.closed {
            return None;
        }
        inner.lines.get(index).cloned()
    }

    fn subscribe(&self, listener: Arc<dyn SourceListener>) {
        self.listeners.lock().push(listener);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<SourceEvent>>,
    }

    impl SourceListener for Recorder {
        fn on_event(&self, event: SourceEvent) -> bool {
            self.events.lock().push(event);
            true
        }
    }

    #[test]
    fn test_append_emits_growth() {
        let source = MemorySource::with_lines("test", ["a", "b"]);
        let recorder = Arc::new(Recorder::default());
        source.subscribe(recorder.clone());

        assert_eq!(source.append_lines(["c", "d"]).unwrap(), 2);
        assert_eq!(source.line_count(), 4);
        assert_eq!(source.line(3).as_deref(), Some("d"));
        assert_eq!(
            *recorder.events.lock(),
            vec![SourceEvent::Growth(GrowthEvent::appended(2, 4))]
        );
    }

    #[test]
    fn test_rollover_drops_leading_lines() {
        let source = MemorySource::with_lines("test", (0..10).map(|i| i.to_string()));
        let recorder = Arc::new(Recorder::default());
        source.subscribe(recorder.clone());

        source.rollover(3, ["new"]);
        assert_eq!(source.line_count(), 8);
        assert_eq!(source.line(0).as_deref(), Some("3"));
        assert_eq!(source.line(7).as_deref(), Some("new"));
        assert_eq!(
            *recorder.events.lock(),
            vec![SourceEvent::Growth(GrowthEvent::rollover(10, 8, 3))]
        );
    }

    #[test]
    fn test_lost_source_hides_lines_until_restart() {
        let source = MemorySource::with_lines("test", ["a"]);
        let recorder = Arc::new(Recorder::default());
        source.subscribe(recorder.clone());

        source.mark_lost();
        assert!(source.line(0).is_none());
        // Growth while lost is not announced
        source.append("b").unwrap();

        source.restart(["x", "y"]);
        assert_eq!(source.line(1).as_deref(), Some("y"));
        assert_eq!(
            *recorder.events.lock(),
            vec![SourceEvent::Lost, SourceEvent::Restored]
        );
    }

    #[test]
    fn test_closed_source_rejects_appends() {
        let source = MemorySource::with_lines("test", ["a"]);
        let recorder = Arc::new(Recorder::default());
        source.subscribe(recorder.clone());
        source.close();
        assert_eq!(*recorder.events.lock(), vec![SourceEvent::Lost]);
        assert!(source.is_closed());
        assert!(source.append("b").is_err());
        assert_eq!(source.line_count(), 0);
        assert!(source.line(0).is_none());
    }

    #[test]
    fn test_listener_returning_false_is_dropped() {
        struct Once;
        impl SourceListener for Once {
            fn on_event(&self, _event: SourceEvent) -> bool {
                false
            }
        }
        let source = MemorySource::new("test");
        source.subscribe(Arc::new(Once));
        source.append("a").unwrap();
        assert!(source.listeners.lock().is_empty());
    }
}
