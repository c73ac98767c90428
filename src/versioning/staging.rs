//! Per-session staging area.
//!
//! Records paths the agent explicitly wrote (force-included in the next
//! checkpoint even when an ignore rule would exclude them) and paths it
//! explicitly deleted. Cleared atomically on checkpoint creation and on
//! restore. Entries from a previous session are void.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::Result;
use serde::{Deserialize, Serialize};

/// A staged operation for one path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum StageEntry {
    /// Force-include the path; `hash` addresses the staged blob content.
    Add { hash: String },
    /// Force-exclude the path from the next checkpoint tree.
    Remove,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StagingDoc {
    /// Session the entries belong to; entries for another session are stale.
    #[serde(default)]
    session: String,
    #[serde(default)]
    entries: BTreeMap<String, StageEntry>,
}

/// File-backed staging area for one dialog.
pub struct StagingArea {
    path: PathBuf,
}

impl StagingArea {
    pub fn new(checkpoints_dir: &Path) -> Self {
        Self {
            path: checkpoints_dir.join("staging.json"),
        }
    }

    fn load(&self) -> StagingDoc {
        std::fs::read_to_string(&self.path)
            .ok()
            .and_then(|text| serde_json::from_str(&text).ok())
            .unwrap_or_default()
    }

    fn save(&self, doc: &StagingDoc) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_string_pretty(doc)?)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    /// Record a force-add for `path` under `session`.
    pub fn stage_add(&self, session: &str, path: &str, hash: &str) -> Result<()> {
        let mut doc = self.load();
        if doc.session != session {
            doc.entries.clear();
            doc.session = session.to_string();
        }
        doc.entries
            .insert(path.to_string(), StageEntry::Add { hash: hash.to_string() });
        self.save(&doc)
    }

    /// Record a force-remove for `path` under `session`.
    pub fn stage_remove(&self, session: &str, path: &str) -> Result<()> {
        let mut doc = self.load();
        if doc.session != session {
            doc.entries.clear();
            doc.session = session.to_string();
        }
        doc.entries.insert(path.to_string(), StageEntry::Remove);
        self.save(&doc)
    }

    /// Entries valid for `session`. Stale entries (other session) are empty.
    pub fn entries(&self, session: &str) -> BTreeMap<String, StageEntry> {
        let doc = self.load();
        if doc.session == session {
            doc.entries
        } else {
            BTreeMap::new()
        }
    }

    /// All staged paths for `session`, regardless of operation.
    pub fn paths(&self, session: &str) -> Vec<String> {
        self.entries(session).into_keys().collect()
    }

    /// Drop all entries.
    pub fn clear(&self) -> Result<()> {
        if self.path.exists() {
            self.save(&StagingDoc::default())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn add_then_remove_keeps_last_operation() {
        let dir = TempDir::new().unwrap();
        let staging = StagingArea::new(dir.path());
        staging.stage_add("session_1", "a.txt", "h1").unwrap();
        staging.stage_remove("session_1", "a.txt").unwrap();

        let entries = staging.entries("session_1");
        assert_eq!(entries.get("a.txt"), Some(&StageEntry::Remove));
    }

    #[test]
    fn entries_scoped_to_session() {
        let dir = TempDir::new().unwrap();
        let staging = StagingArea::new(dir.path());
        staging.stage_add("session_1", "a.txt", "h1").unwrap();

        assert!(staging.entries("session_2").is_empty());
        // Writing under the new session discards the stale entries.
        staging.stage_add("session_2", "b.txt", "h2").unwrap();
        let entries = staging.entries("session_2");
        assert_eq!(entries.len(), 1);
        assert!(entries.contains_key("b.txt"));
    }

    #[test]
    fn clear_empties_everything() {
        let dir = TempDir::new().unwrap();
        let staging = StagingArea::new(dir.path());
        staging.stage_add("session_1", "a.txt", "h1").unwrap();
        staging.clear().unwrap();
        assert!(staging.entries("session_1").is_empty());
    }
}
