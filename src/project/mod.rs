//! Project handle: workdir plus the `.agentsmithy/` state directory.
//!
//! The project owns the dialogs index (`dialogs/index.json`), which tracks
//! dialog metadata and the "current" dialog pointer. Message content lives in
//! the SQLite dialog store, checkpoints in per-dialog object stores.

pub mod runtime;
pub mod status;

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};

use status::StatusManager;

pub use runtime::ensure_singleton_and_select_port;
pub use status::{ScanStatus, ServerStatus};

/// Name of the hidden state directory inside a workdir.
pub const STATE_DIR_NAME: &str = ".agentsmithy";

/// Metadata for one dialog, as stored in the dialogs index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DialogMeta {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub initial_checkpoint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_approved_at: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct DialogsIndex {
    #[serde(skip_serializing_if = "Option::is_none")]
    current_dialog_id: Option<String>,
    #[serde(default)]
    dialogs: Vec<DialogMeta>,
}

/// A project rooted at an absolute workdir path.
pub struct Project {
    root: PathBuf,
    state_dir: PathBuf,
    index_lock: Mutex<()>,
}

impl Project {
    /// Open (creating state directories as needed) the project at `workdir`.
    pub fn open(workdir: &Path) -> Result<Self> {
        let root = workdir
            .canonicalize()
            .with_context(|| format!("workdir does not exist: {}", workdir.display()))?;
        let state_dir = root.join(STATE_DIR_NAME);
        std::fs::create_dir_all(state_dir.join("dialogs"))?;
        std::fs::create_dir_all(state_dir.join("rag"))?;
        Ok(Self {
            root,
            state_dir,
            index_lock: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    pub fn name(&self) -> String {
        self.root
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.root.display().to_string())
    }

    pub fn dialogs_dir(&self) -> PathBuf {
        self.state_dir.join("dialogs")
    }

    pub fn dialog_dir(&self, dialog_id: &str) -> PathBuf {
        self.dialogs_dir().join(dialog_id)
    }

    pub fn rag_dir(&self) -> PathBuf {
        self.state_dir.join("rag")
    }

    /// Path of the shared dialog database.
    pub fn dialog_db_path(&self) -> PathBuf {
        self.dialogs_dir().join("messages.sqlite")
    }

    pub fn status_path(&self) -> PathBuf {
        self.state_dir.join("status.json")
    }

    pub fn status_manager(&self) -> StatusManager {
        StatusManager::new(self.status_path())
    }

    fn index_path(&self) -> PathBuf {
        self.dialogs_dir().join("index.json")
    }

    fn load_index(&self) -> DialogsIndex {
        std::fs::read_to_string(self.index_path())
            .ok()
            .and_then(|text| serde_json::from_str(&text).ok())
            .unwrap_or_default()
    }

    fn save_index(&self, index: &DialogsIndex) -> Result<()> {
        let path = self.index_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_string_pretty(index)?)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// Allocate a new dialog id: lexicographically sortable timestamp plus a
    /// short random suffix for same-second collisions.
    fn new_dialog_id() -> String {
        let stamp = Utc::now().format("%Y%m%d-%H%M%S");
        let suffix = &uuid::Uuid::new_v4().simple().to_string()[..8];
        format!("{stamp}-{suffix}")
    }

    /// Create a dialog and (optionally) make it current.
    pub fn create_dialog(&self, title: Option<String>, set_current: bool) -> Result<String> {
        let _guard = self.index_lock.lock().unwrap_or_else(|p| p.into_inner());
        let mut index = self.load_index();
        let id = Self::new_dialog_id();
        let now = Utc::now().to_rfc3339();
        index.dialogs.push(DialogMeta {
            id: id.clone(),
            title,
            created_at: now.clone(),
            updated_at: now,
            initial_checkpoint: None,
            last_approved_at: None,
        });
        if set_current || index.current_dialog_id.is_none() {
            index.current_dialog_id = Some(id.clone());
        }
        std::fs::create_dir_all(self.dialog_dir(&id))?;
        self.save_index(&index)?;
        Ok(id)
    }

    pub fn get_current_dialog_id(&self) -> Option<String> {
        let _guard = self.index_lock.lock().unwrap_or_else(|p| p.into_inner());
        self.load_index().current_dialog_id
    }

    pub fn set_current_dialog_id(&self, dialog_id: &str) -> Result<()> {
        let _guard = self.index_lock.lock().unwrap_or_else(|p| p.into_inner());
        let mut index = self.load_index();
        if !index.dialogs.iter().any(|d| d.id == dialog_id) {
            anyhow::bail!("Dialog not found: {dialog_id}");
        }
        index.current_dialog_id = Some(dialog_id.to_string());
        self.save_index(&index)
    }

    pub fn get_dialog_meta(&self, dialog_id: &str) -> Option<DialogMeta> {
        let _guard = self.index_lock.lock().unwrap_or_else(|p| p.into_inner());
        self.load_index()
            .dialogs
            .into_iter()
            .find(|d| d.id == dialog_id)
    }

    /// List dialogs sorted by `sort_by` (`created_at` | `updated_at` | `title`).
    pub fn list_dialogs(
        &self,
        sort_by: &str,
        descending: bool,
        limit: Option<usize>,
        offset: usize,
    ) -> Vec<DialogMeta> {
        let _guard = self.index_lock.lock().unwrap_or_else(|p| p.into_inner());
        let mut dialogs = self.load_index().dialogs;
        dialogs.sort_by(|a, b| {
            let ord = match sort_by {
                "created_at" => a.created_at.cmp(&b.created_at),
                "title" => a.title.cmp(&b.title),
                _ => a.updated_at.cmp(&b.updated_at),
            };
            if descending {
                ord.reverse()
            } else {
                ord
            }
        });
        dialogs
            .into_iter()
            .skip(offset)
            .take(limit.unwrap_or(usize::MAX))
            .collect()
    }

    /// Update metadata fields for a dialog; bumps `updated_at`.
    pub fn upsert_dialog_meta(
        &self,
        dialog_id: &str,
        title: Option<String>,
        initial_checkpoint: Option<String>,
        last_approved_at: Option<String>,
    ) -> Result<()> {
        let _guard = self.index_lock.lock().unwrap_or_else(|p| p.into_inner());
        let mut index = self.load_index();
        let meta = index
            .dialogs
            .iter_mut()
            .find(|d| d.id == dialog_id)
            .with_context(|| format!("Dialog not found: {dialog_id}"))?;
        if let Some(title) = title {
            meta.title = Some(title);
        }
        if let Some(checkpoint) = initial_checkpoint {
            meta.initial_checkpoint = Some(checkpoint);
        }
        if let Some(approved) = last_approved_at {
            meta.last_approved_at = Some(approved);
        }
        meta.updated_at = Utc::now().to_rfc3339();
        self.save_index(&index)
    }

    pub fn touch_dialog(&self, dialog_id: &str) {
        let _guard = self.index_lock.lock().unwrap_or_else(|p| p.into_inner());
        let mut index = self.load_index();
        if let Some(meta) = index.dialogs.iter_mut().find(|d| d.id == dialog_id) {
            meta.updated_at = Utc::now().to_rfc3339();
            let _ = self.save_index(&index);
        }
    }

    /// Remove a dialog from the index and delete its state directory.
    pub fn delete_dialog(&self, dialog_id: &str) -> Result<()> {
        let _guard = self.index_lock.lock().unwrap_or_else(|p| p.into_inner());
        let mut index = self.load_index();
        index.dialogs.retain(|d| d.id != dialog_id);
        if index.current_dialog_id.as_deref() == Some(dialog_id) {
            index.current_dialog_id = index.dialogs.last().map(|d| d.id.clone());
        }
        self.save_index(&index)?;
        let dir = self.dialog_dir(dialog_id);
        if dir.exists() {
            std::fs::remove_dir_all(&dir)
                .with_context(|| format!("removing dialog dir {}", dir.display()))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn open_creates_state_layout() {
        let dir = TempDir::new().unwrap();
        let project = Project::open(dir.path()).unwrap();
        assert!(project.dialogs_dir().is_dir());
        assert!(project.rag_dir().is_dir());
    }

    #[test]
    fn first_dialog_becomes_current() {
        let dir = TempDir::new().unwrap();
        let project = Project::open(dir.path()).unwrap();
        let id = project.create_dialog(None, false).unwrap();
        assert_eq!(project.get_current_dialog_id().as_deref(), Some(id.as_str()));
    }

    #[test]
    fn dialog_ids_sort_by_creation_order() {
        let dir = TempDir::new().unwrap();
        let project = Project::open(dir.path()).unwrap();
        let a = project.create_dialog(None, true).unwrap();
        let b = project.create_dialog(None, true).unwrap();
        // Lexicographic comparison must respect creation order.
        assert!(a <= b);
        assert_eq!(project.get_current_dialog_id().as_deref(), Some(b.as_str()));
    }

    #[test]
    fn upsert_sets_title_and_initial_checkpoint() {
        let dir = TempDir::new().unwrap();
        let project = Project::open(dir.path()).unwrap();
        let id = project.create_dialog(None, true).unwrap();
        project
            .upsert_dialog_meta(&id, Some("Refactor".into()), Some("abc".into()), None)
            .unwrap();
        let meta = project.get_dialog_meta(&id).unwrap();
        assert_eq!(meta.title.as_deref(), Some("Refactor"));
        assert_eq!(meta.initial_checkpoint.as_deref(), Some("abc"));
    }

    #[test]
    fn delete_dialog_removes_dir_and_repoints_current() {
        let dir = TempDir::new().unwrap();
        let project = Project::open(dir.path()).unwrap();
        let a = project.create_dialog(None, true).unwrap();
        let b = project.create_dialog(None, true).unwrap();
        project.delete_dialog(&b).unwrap();
        assert!(!project.dialog_dir(&b).exists());
        assert_eq!(project.get_current_dialog_id().as_deref(), Some(a.as_str()));
    }
}
