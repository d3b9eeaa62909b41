//! Line source abstraction.
//!
//! The engine only reads from sources; it never buffers or tails files
//! itself. A source provides:
//! - line lookup by index and the current line count
//! - `SourceEvent`s (growth, rollover, loss, restoration) pushed to listeners
//!
//! `MemorySource` is the in-process implementation used for cascading sink
//! stores and tests; `file::FileFeed` pumps a tailed file into one.

pub mod file;
pub mod memory;

use std::sync::Arc;

pub use memory::MemorySource;

/// Notification that a source grew or rolled over.
///
/// On rollover every line number from before the event shifts down by
/// `rollover_offset`; lines that would become negative are gone.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GrowthEvent {
    pub previous_line_count: usize,
    pub new_line_count: usize,
    pub is_rollover: bool,
    pub rollover_offset: usize,
}

impl GrowthEvent {
    pub fn appended(previous_line_count: usize, new_line_count: usize) -> Self {
        Self {
            previous_line_count,
            new_line_count,
            is_rollover: false,
            rollover_offset: 0,
        }
    }

    pub fn rollover(previous_line_count: usize, new_line_count: usize, offset: usize) -> Self {
        Self {
            previous_line_count,
            new_line_count,
            is_rollover: true,
            rollover_offset: offset,
        }
    }

    /// First line (in post-rollover numbering) that has not been seen yet
    pub fn first_new_line(&self) -> usize {
        if self.is_rollover {
            self.previous_line_count.saturating_sub(self.rollover_offset)
        } else {
            self.previous_line_count
        }
    }
}

/// Events emitted by line sources
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SourceEvent {
    Growth(GrowthEvent),
    /// Lines can no longer be read
    Lost,
    /// The source is readable again; its content restarted from line 0
    Restored,
}

/// Receiver side of source notifications.
///
/// `on_event` must not block: implementations enqueue and return. Returning
/// `false` unsubscribes the listener.
pub trait SourceListener: Send + Sync {
    fn on_event(&self, event: SourceEvent) -> bool;
}

/// Read access to an append-only, possibly rolling-over sequence of lines
pub trait LineSource: Send + Sync {
    /// Get the display name for this source
    fn name(&self) -> String;

    /// Number of lines currently available
    fn line_count(&self) -> usize;

    /// Line text, or `None` if the line is out of range or the source is gone
    fn line(&self, index: usize) -> Option<Arc<str>>;

    /// Register for growth/rollover/loss notifications.
    ///
    /// A rollover or restore must reach listeners before any reader can see
    /// the renumbered lines.
    fn subscribe(&self, listener: Arc<dyn SourceListener>);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_new_line_for_append() {
        assert_eq!(GrowthEvent::appended(10, 15).first_new_line(), 10);
    }

    #[test]
    fn test_first_new_line_for_rollover() {
        assert_eq!(GrowthEvent::rollover(10, 12, 3).first_new_line(), 7);
        // Whole content replaced
        assert_eq!(GrowthEvent::rollover(10, 4, 10).first_new_line(), 0);
        assert_eq!(GrowthEvent::rollover(10, 4, 25).first_new_line(), 0);
    }
}
