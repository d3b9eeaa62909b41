//! Live filtering and cascading views over growing log sources.
//!
//! An [`Engine`] opens [`LogView`]s on top of [`LineSource`]s. Each view keeps
//! a filter index current as its source grows or rolls over, can spawn
//! cascading sinks whose matches feed a derived view, and can join a
//! time-sync group that scrolls every member to the same timestamp.

pub mod annotations;
pub mod columnizer;
pub mod config;
pub mod error;
pub mod filter;
pub mod persist;
pub mod search;
pub mod sink;
pub mod sources;
pub mod tail;
pub mod task;
pub mod timesync;
pub mod view;

pub use annotations::{Bookmark, RowHeight};
pub use columnizer::{Columnizer, columnizer_by_name};
pub use config::EngineConfig;
pub use error::{EngineError, Result};
pub use filter::{FilterSpec, MAX_SPREAD};
pub use persist::ViewPersistence;
pub use search::{Direction, SearchParams, SearchResult};
pub use sink::SinkId;
pub use sources::{GrowthEvent, LineSource, MemorySource, SourceEvent};
pub use tail::{CoordinatorStatus, ViewEvent};
pub use task::{CancelToken, TaskEvent, TaskHandle, TaskOutcome};
pub use timesync::{GroupId, TimeSyncMember, ViewId};
pub use view::{Engine, FilterSnapshot, FilterSummary, LogView, RestoredView};
