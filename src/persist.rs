//! Saved view state.
//!
//! Written as JSON next to whatever the caller chooses. Loading never
//! restores indices directly: the saved filter is re-run so the index always
//! matches the current content.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::annotations::{Bookmark, RowHeight};
use crate::error::Result;
use crate::filter::FilterSpec;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ViewPersistence {
    pub source_name: String,
    pub columnizer: String,
    pub filter: Option<FilterSpec>,
    /// Matched line count at save time, for display before the filter reruns
    pub matched_count: usize,
    pub bookmarks: Vec<Bookmark>,
    pub row_heights: Vec<RowHeight>,
    /// Filters of the cascading sinks, reopened on restore
    pub sinks: Vec<FilterSpec>,
    pub selected_line: Option<usize>,
}

impl ViewPersistence {
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        debug!(path = %path.display(), "Saved view state");
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&json)?)
    }
}
