//! Per-dialog checkpointing: content-addressed snapshots with rollback,
//! session-scoped approval, and force-staging.
//!
//! Each dialog owns a shadow object store under
//! `.agentsmithy/dialogs/<dialog_id>/checkpoints/`, isolated from the
//! project's own VCS. Two refs matter: `main` (last approved tip, only ever
//! advanced by approval) and the active `session_N` tip.

pub mod diff;
pub mod ignore;
pub mod sessions;
pub mod staging;
pub mod store;

use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use chrono::Utc;
use serde::Serialize;
use sqlx::SqlitePool;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use diff::{changed_file, ChangedFile};
use self::ignore::IgnoreMatcher;
use sessions::{next_session_name, SessionStore};
use staging::{StageEntry, StagingArea};
use store::{Commit, ObjectStore, MODE_EXEC, MODE_FILE};

/// One checkpoint in history listings.
#[derive(Debug, Clone, Serialize)]
pub struct CheckpointInfo {
    pub commit_id: String,
    pub message: String,
}

/// Result of [`VersioningTracker::restore_checkpoint`].
#[derive(Debug, Clone, Serialize)]
pub struct RestoreOutcome {
    pub restored_to: String,
    pub new_checkpoint: String,
    pub restored_files: Vec<String>,
    pub skipped_files: Vec<String>,
}

/// Result of [`VersioningTracker::approve_all`].
#[derive(Debug, Clone, Serialize)]
pub struct ApproveOutcome {
    pub approved_commit: String,
    pub new_session: String,
    pub commits_approved: usize,
}

/// Result of [`VersioningTracker::reset_to_approved`].
#[derive(Debug, Clone, Serialize)]
pub struct ResetOutcome {
    pub reset_to: String,
    pub new_session: String,
}

/// Pre-edit byte snapshots for a scoped file mutation.
///
/// `start_edit` captures the current bytes of the paths about to change;
/// `abort` writes them back, `finalize` discards them. Independent of
/// checkpoints.
#[derive(Debug, Default)]
pub struct EditSnapshot {
    snapshots: Vec<(PathBuf, Vec<u8>)>,
}

impl EditSnapshot {
    /// Restore the captured bytes (failed edit).
    pub fn abort(self) {
        for (path, content) in self.snapshots {
            if let Some(parent) = path.parent() {
                let _ = std::fs::create_dir_all(parent);
            }
            if let Err(e) = std::fs::write(&path, &content) {
                warn!(file = %path.display(), error = %e, "Failed to restore pre-edit snapshot");
            }
        }
    }

    /// Drop the captured bytes (successful edit).
    pub fn finalize(self) {}
}

/// Checkpoint and staging operations for one dialog.
///
/// All public operations serialize on an internal lock: staging, checkpoint
/// creation and restore never interleave within a dialog.
pub struct VersioningTracker {
    project_root: PathBuf,
    dialog_id: String,
    store: ObjectStore,
    staging: StagingArea,
    sessions: SessionStore,
    extra_excludes: Vec<String>,
    op_lock: Mutex<()>,
}

impl VersioningTracker {
    pub fn new(
        project_root: &Path,
        dialog_id: &str,
        pool: SqlitePool,
        extra_excludes: Vec<String>,
    ) -> Result<Self> {
        let checkpoints_dir = project_root
            .join(".agentsmithy")
            .join("dialogs")
            .join(dialog_id)
            .join("checkpoints");
        let store = ObjectStore::open(&checkpoints_dir)?;
        let staging = StagingArea::new(&checkpoints_dir);
        Ok(Self {
            project_root: project_root.to_path_buf(),
            dialog_id: dialog_id.to_string(),
            store,
            staging,
            sessions: SessionStore::new(pool),
            extra_excludes,
            op_lock: Mutex::new(()),
        })
    }

    pub fn dialog_id(&self) -> &str {
        &self.dialog_id
    }

    /// Name of the session currently accepting checkpoints.
    pub async fn active_session_name(&self) -> Result<String> {
        Ok(self.sessions.ensure_active(&self.dialog_id).await?.session_name)
    }

    // ---- path helpers ----

    /// Relative forward-slash form of `path` (absolute or already relative).
    fn rel_path(&self, path: &Path) -> String {
        let rel = path.strip_prefix(&self.project_root).unwrap_or(path);
        rel.to_string_lossy().replace('\\', "/")
    }

    fn abs_path(&self, rel: &str) -> PathBuf {
        self.project_root.join(rel)
    }

    fn matcher(&self) -> IgnoreMatcher {
        IgnoreMatcher::for_project(&self.project_root, &self.extra_excludes)
    }

    // ---- workdir scanning ----

    /// Walk the workdir honoring ignores; returns rel path -> absolute path.
    fn scan_workdir(&self) -> BTreeMap<String, PathBuf> {
        let matcher = self.matcher();
        let mut files = BTreeMap::new();
        let root = self.project_root.clone();
        let walker = WalkDir::new(&root).follow_links(false).into_iter();
        for entry in walker.filter_entry(|e| {
            if e.depth() == 0 {
                return true;
            }
            let rel = e
                .path()
                .strip_prefix(&root)
                .map(|p| p.to_string_lossy().replace('\\', "/"))
                .unwrap_or_default();
            !matcher.is_ignored(&rel, e.file_type().is_dir())
        }) {
            let entry = match entry {
                Ok(e) => e,
                Err(_) => continue,
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let rel = self.rel_path(entry.path());
            files.insert(rel, entry.path().to_path_buf());
        }
        files
    }

    fn file_mode(path: &Path) -> u32 {
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Ok(meta) = std::fs::metadata(path) {
                if meta.permissions().mode() & 0o111 != 0 {
                    return MODE_EXEC;
                }
            }
        }
        MODE_FILE
    }

    /// Snapshot the merged view of workdir + staging into blob hashes.
    fn snapshot_tree(&self, session: &str) -> Result<BTreeMap<String, (u32, String)>> {
        let mut files = BTreeMap::new();
        for (rel, abs) in self.scan_workdir() {
            let content = match std::fs::read(&abs) {
                Ok(c) => c,
                Err(_) => continue,
            };
            let hash = self.store.put_blob(&content)?;
            files.insert(rel, (Self::file_mode(&abs), hash));
        }
        // Staging overrides the filters: staged adds force their way in,
        // staged removes force their way out.
        for (path, entry) in self.staging.entries(session) {
            match entry {
                StageEntry::Add { hash } => {
                    if self.store.has_object(&hash) {
                        files.insert(path, (MODE_FILE, hash));
                    } else if let Ok(content) = std::fs::read(self.abs_path(&path)) {
                        let hash = self.store.put_blob(&content)?;
                        files.insert(path, (MODE_FILE, hash));
                    }
                }
                StageEntry::Remove => {
                    files.remove(&path);
                }
            }
        }
        Ok(files)
    }

    // ---- metadata ----

    fn metadata_path(&self) -> PathBuf {
        self.store.root().join("metadata.json")
    }

    fn record_metadata(&self, commit_id: &str, message: &str) {
        let path = self.metadata_path();
        let mut data: serde_json::Map<String, serde_json::Value> =
            std::fs::read_to_string(&path)
                .ok()
                .and_then(|text| serde_json::from_str(&text).ok())
                .unwrap_or_default();
        data.insert(
            commit_id.to_string(),
            serde_json::json!({ "message": message }),
        );
        if let Ok(text) = serde_json::to_string_pretty(&data) {
            let _ = std::fs::write(&path, text);
        }
    }

    // ---- checkpoints ----

    /// Create a checkpoint of the current project state.
    pub async fn create_checkpoint(&self, message: &str) -> Result<CheckpointInfo> {
        let _guard = self.op_lock.lock().await;
        self.create_checkpoint_locked(message).await
    }

    async fn create_checkpoint_locked(&self, message: &str) -> Result<CheckpointInfo> {
        let session = self.sessions.ensure_active(&self.dialog_id).await?;
        let session_name = session.session_name.clone();

        let parent = self
            .store
            .read_ref(&session_name)
            .or_else(|| self.store.read_ref("main"));

        let files = self.snapshot_tree(&session_name)?;
        let tree = self.store.write_tree_from_paths(&files)?;
        let commit = Commit {
            tree,
            parents: parent.into_iter().collect(),
            message: message.to_string(),
            author_time: Utc::now().timestamp(),
        };
        let commit_id = self.store.put_commit(&commit)?;

        self.store.write_ref(&session_name, &commit_id)?;
        if self.store.read_ref("main").is_none() {
            self.store.write_ref("main", &commit_id)?;
        }

        self.staging.clear()?;
        self.record_metadata(&commit_id, message);
        self.sessions
            .increment_checkpoints(&self.dialog_id, &session_name)
            .await?;

        debug!(
            dialog_id = %self.dialog_id,
            checkpoint = %&commit_id[..8],
            session = %session_name,
            files = files.len(),
            "Created checkpoint"
        );
        Ok(CheckpointInfo {
            commit_id,
            message: message.to_string(),
        })
    }

    pub fn has_commit(&self, commit_id: &str) -> bool {
        self.store.get_commit(commit_id).is_ok()
    }

    /// History reachable from the active session tip, oldest first.
    pub async fn list_checkpoints(&self) -> Result<Vec<CheckpointInfo>> {
        let session = self.sessions.ensure_active(&self.dialog_id).await?;
        let tip = match self
            .store
            .read_ref(&session.session_name)
            .or_else(|| self.store.read_ref("main"))
        {
            Some(tip) => tip,
            None => return Ok(Vec::new()),
        };

        let metadata: serde_json::Map<String, serde_json::Value> =
            std::fs::read_to_string(self.metadata_path())
                .ok()
                .and_then(|text| serde_json::from_str(&text).ok())
                .unwrap_or_default();

        let mut checkpoints = Vec::new();
        let mut visited = HashSet::new();
        let mut queue = VecDeque::from([tip]);
        while let Some(commit_id) = queue.pop_front() {
            if !visited.insert(commit_id.clone()) {
                continue;
            }
            let commit = match self.store.get_commit(&commit_id) {
                Ok(c) => c,
                Err(_) => continue,
            };
            let message = metadata
                .get(&commit_id)
                .and_then(|m| m.get("message"))
                .and_then(|m| m.as_str())
                .map(|m| m.to_string())
                .unwrap_or_else(|| commit.message.clone());
            checkpoints.push(CheckpointInfo { commit_id, message });
            queue.extend(commit.parents);
        }
        checkpoints.reverse();
        Ok(checkpoints)
    }

    /// Restore the project to `commit_id`, then checkpoint the restore so it
    /// is itself undoable. Best-effort per file: unwritable paths are skipped
    /// and reported, not fatal.
    pub async fn restore_checkpoint(&self, commit_id: &str) -> Result<RestoreOutcome> {
        let _guard = self.op_lock.lock().await;
        let session = self.sessions.ensure_active(&self.dialog_id).await?;
        let session_name = session.session_name.clone();

        let target_commit = self
            .store
            .get_commit(commit_id)
            .with_context(|| format!("checkpoint not found: {commit_id}"))?;
        let target_files = self.store.collect_tree_files(&target_commit.tree)?;

        // Paths known to HEAD or staged now but absent from the target get
        // deleted so the workdir matches the snapshot.
        let mut known: BTreeSet<String> = self.staging.paths(&session_name).into_iter().collect();
        if let Some(head) = self.store.read_ref(&session_name) {
            if let Ok(head_commit) = self.store.get_commit(&head) {
                if let Ok(head_files) = self.store.collect_tree_files(&head_commit.tree) {
                    known.extend(head_files.into_keys());
                }
            }
        }

        let mut deleted_dirs: BTreeSet<PathBuf> = BTreeSet::new();
        let mut skipped_files = Vec::new();
        for path in known.iter() {
            if target_files.contains_key(path) {
                continue;
            }
            let abs = self.abs_path(path);
            if abs.exists() {
                match std::fs::remove_file(&abs) {
                    Ok(()) => {
                        if let Some(parent) = abs.parent() {
                            deleted_dirs.insert(parent.to_path_buf());
                        }
                    }
                    Err(e) => {
                        debug!(file = %abs.display(), error = %e, "Skipped delete during restore");
                        skipped_files.push(path.clone());
                    }
                }
            }
        }

        let mut restored_files = Vec::new();
        for (path, (_mode, blob)) in &target_files {
            let content = match self.store.get_blob(blob) {
                Ok(c) => c,
                Err(e) => {
                    warn!(file = %path, error = %e, "Missing blob during restore");
                    skipped_files.push(path.clone());
                    continue;
                }
            };
            let abs = self.abs_path(path);
            let write = || -> std::io::Result<()> {
                if let Some(parent) = abs.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::write(&abs, &content)
            };
            match write() {
                Ok(()) => restored_files.push(path.clone()),
                Err(e) => {
                    debug!(file = %abs.display(), error = %e, "Skipped file during restore");
                    skipped_files.push(path.clone());
                }
            }
        }

        if restored_files.is_empty() && !target_files.is_empty() {
            bail!("restore failed: no files could be written");
        }

        self.staging.clear()?;
        self.prune_empty_dirs(&deleted_dirs);

        let short = &commit_id[..commit_id.len().min(8)];
        let new_checkpoint = self
            .create_checkpoint_locked(&format!("Restored to {short}"))
            .await?;

        info!(
            dialog_id = %self.dialog_id,
            checkpoint = %short,
            restored = restored_files.len(),
            skipped = skipped_files.len(),
            "Checkpoint restore completed"
        );
        Ok(RestoreOutcome {
            restored_to: commit_id.to_string(),
            new_checkpoint: new_checkpoint.commit_id,
            restored_files,
            skipped_files,
        })
    }

    fn prune_empty_dirs(&self, dirs: &BTreeSet<PathBuf>) {
        for dir in dirs {
            let mut current = dir.clone();
            while current != self.project_root && current.starts_with(&self.project_root) {
                match std::fs::remove_dir(&current) {
                    Ok(()) => match current.parent() {
                        Some(parent) => current = parent.to_path_buf(),
                        None => break,
                    },
                    // Not empty or already gone.
                    Err(_) => break,
                }
            }
        }
    }

    // ---- staging ----

    /// Record that the agent wrote `path`; the next checkpoint includes it
    /// even if an ignore rule matches.
    pub async fn stage_file(&self, path: &Path) -> Result<()> {
        let _guard = self.op_lock.lock().await;
        let session = self.sessions.ensure_active(&self.dialog_id).await?;
        let rel = self.rel_path(path);
        let content = std::fs::read(self.abs_path(&rel))
            .with_context(|| format!("reading staged file {rel}"))?;
        let hash = self.store.put_blob(&content)?;
        self.staging.stage_add(&session.session_name, &rel, &hash)
    }

    /// Record that the agent deleted `path`.
    pub async fn stage_file_deletion(&self, path: &Path) -> Result<()> {
        let _guard = self.op_lock.lock().await;
        let session = self.sessions.ensure_active(&self.dialog_id).await?;
        let rel = self.rel_path(path);
        self.staging.stage_remove(&session.session_name, &rel)
    }

    // ---- edit snapshots ----

    /// Capture current bytes of `paths` ahead of a mutation.
    pub fn start_edit<'a>(&self, paths: impl IntoIterator<Item = &'a Path>) -> EditSnapshot {
        let mut snapshot = EditSnapshot::default();
        for path in paths {
            let abs = if path.is_absolute() {
                path.to_path_buf()
            } else {
                self.project_root.join(path)
            };
            if let Ok(content) = std::fs::read(&abs) {
                snapshot.snapshots.push((abs, content));
            }
        }
        snapshot
    }

    // ---- session workflow ----

    /// Whether the working state differs from the active session tip.
    pub async fn has_uncommitted_changes(&self) -> Result<bool> {
        let session = self.sessions.ensure_active(&self.dialog_id).await?;
        self.working_tree_differs(&session.session_name)
    }

    fn working_tree_differs(&self, session_name: &str) -> Result<bool> {
        let tip = match self.store.read_ref(session_name) {
            Some(tip) => tip,
            None => return Ok(true),
        };
        let tip_tree = self.store.get_commit(&tip)?.tree;
        let files = self.snapshot_tree(session_name)?;
        let current_tree = self.store.write_tree_from_paths(&files)?;
        Ok(tip_tree != current_tree)
    }

    fn count_commits_between(&self, base: &str, head: &str) -> usize {
        if base == head {
            return 0;
        }
        let mut count = 0;
        let mut visited = HashSet::new();
        let mut queue = VecDeque::from([head.to_string()]);
        while let Some(commit_id) = queue.pop_front() {
            if commit_id == base || !visited.insert(commit_id.clone()) {
                continue;
            }
            count += 1;
            if let Ok(commit) = self.store.get_commit(&commit_id) {
                queue.extend(commit.parents);
            }
        }
        count
    }

    /// Merge the active session into `main` and start a fresh session.
    pub async fn approve_all(&self, message: Option<&str>) -> Result<ApproveOutcome> {
        let _guard = self.op_lock.lock().await;
        let session = self.sessions.ensure_active(&self.dialog_id).await?;
        let session_name = session.session_name.clone();

        // Capture command-made changes so the approval covers the real state.
        if self.working_tree_differs(&session_name)? {
            self.create_checkpoint_locked("Auto-commit before approval")
                .await?;
        }

        let session_head = self
            .store
            .read_ref(&session_name)
            .context("session ref not initialized")?;
        let main_head = self.store.read_ref("main").context("main ref not initialized")?;

        let new_session = next_session_name(&session_name);

        if session_head == main_head {
            // Nothing to approve; still rotate the session.
            self.sessions
                .close(&self.dialog_id, &session_name, "merged", Some(&main_head))
                .await?;
            self.sessions.create(&self.dialog_id, &new_session).await?;
            self.store.write_ref(&new_session, &main_head)?;
            return Ok(ApproveOutcome {
                approved_commit: main_head,
                new_session,
                commits_approved: 0,
            });
        }

        let commits_approved = self.count_commits_between(&main_head, &session_head);

        let session_tree = self.store.get_commit(&session_head)?.tree;
        let merge_message = message.unwrap_or("Approved session").to_string();
        let merge_commit = Commit {
            tree: session_tree,
            parents: vec![main_head.clone(), session_head.clone()],
            message: merge_message.clone(),
            author_time: Utc::now().timestamp(),
        };
        let merge_id = self.store.put_commit(&merge_commit)?;

        self.store.write_ref("main", &merge_id)?;
        self.store.write_ref(&session_name, &merge_id)?;
        self.record_metadata(&merge_id, &merge_message);

        self.sessions
            .close(&self.dialog_id, &session_name, "merged", Some(&merge_id))
            .await?;
        self.sessions.create(&self.dialog_id, &new_session).await?;
        self.store.write_ref(&new_session, &merge_id)?;

        info!(
            dialog_id = %self.dialog_id,
            approved = %&merge_id[..8],
            commits = commits_approved,
            new_session = %new_session,
            "Approved session"
        );
        Ok(ApproveOutcome {
            approved_commit: merge_id,
            new_session,
            commits_approved,
        })
    }

    /// Abandon the active session and materialize the `main` tip.
    pub async fn reset_to_approved(&self) -> Result<ResetOutcome> {
        let _guard = self.op_lock.lock().await;
        let session = self.sessions.ensure_active(&self.dialog_id).await?;
        let session_name = session.session_name.clone();

        let main_head = self.store.read_ref("main").context("main ref not initialized")?;
        let main_files = self
            .store
            .collect_tree_files(&self.store.get_commit(&main_head)?.tree)?;

        // Current working files plus staged paths that main doesn't have.
        let mut known: BTreeSet<String> = self.scan_workdir().into_keys().collect();
        known.extend(self.staging.paths(&session_name));
        if let Some(head) = self.store.read_ref(&session_name) {
            if let Ok(head_commit) = self.store.get_commit(&head) {
                if let Ok(head_files) = self.store.collect_tree_files(&head_commit.tree) {
                    known.extend(head_files.into_keys());
                }
            }
        }

        let mut deleted_dirs: BTreeSet<PathBuf> = BTreeSet::new();
        for path in known {
            if main_files.contains_key(&path) {
                continue;
            }
            let abs = self.abs_path(&path);
            if abs.exists() {
                if std::fs::remove_file(&abs).is_ok() {
                    if let Some(parent) = abs.parent() {
                        deleted_dirs.insert(parent.to_path_buf());
                    }
                }
            }
        }

        for (path, (_mode, blob)) in &main_files {
            if let Ok(content) = self.store.get_blob(blob) {
                let abs = self.abs_path(path);
                if let Some(parent) = abs.parent() {
                    let _ = std::fs::create_dir_all(parent);
                }
                if let Err(e) = std::fs::write(&abs, &content) {
                    debug!(file = %abs.display(), error = %e, "Skipped file during reset");
                }
            }
        }

        self.staging.clear()?;
        self.prune_empty_dirs(&deleted_dirs);

        let new_session = next_session_name(&session_name);
        self.sessions
            .close(&self.dialog_id, &session_name, "abandoned", None)
            .await?;
        self.sessions.create(&self.dialog_id, &new_session).await?;
        self.store.write_ref(&new_session, &main_head)?;

        info!(
            dialog_id = %self.dialog_id,
            reset_to = %&main_head[..8],
            new_session = %new_session,
            "Reset to approved state"
        );
        Ok(ResetOutcome {
            reset_to: main_head,
            new_session,
        })
    }

    /// Diff of the working state (workdir + staging) against the `main` tip.
    ///
    /// Covers committed-but-unapproved changes, staged force-adds, and
    /// command-made changes that were never staged.
    pub async fn get_staged_files(&self) -> Result<Vec<ChangedFile>> {
        let _guard = self.op_lock.lock().await;
        let session = self.sessions.ensure_active(&self.dialog_id).await?;
        let session_name = session.session_name.clone();

        let base_files = match self.store.read_ref("main") {
            Some(main_head) => self
                .store
                .collect_tree_files(&self.store.get_commit(&main_head)?.tree)?,
            None => BTreeMap::new(),
        };

        // Working view: filtered workdir scan, then staging overrides.
        let mut current: BTreeMap<String, Vec<u8>> = BTreeMap::new();
        for (rel, abs) in self.scan_workdir() {
            if let Ok(content) = std::fs::read(&abs) {
                current.insert(rel, content);
            }
        }
        for (path, entry) in self.staging.entries(&session_name) {
            match entry {
                StageEntry::Add { hash } => {
                    let content = self
                        .store
                        .get_blob(&hash)
                        .or_else(|_| std::fs::read(self.abs_path(&path)));
                    if let Ok(content) = content {
                        current.insert(path, content);
                    }
                }
                StageEntry::Remove => {
                    current.remove(&path);
                }
            }
        }

        let mut paths: BTreeSet<String> = base_files.keys().cloned().collect();
        paths.extend(current.keys().cloned());

        let mut changes = Vec::new();
        for path in paths {
            let old = match base_files.get(&path) {
                Some((_mode, blob)) => Some(self.store.get_blob(blob)?),
                None => None,
            };
            let new = current.get(&path).cloned();
            if let Some(change) = changed_file(&path, old.as_deref(), new.as_deref()) {
                changes.push(change);
            }
        }
        Ok(changes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use diff::ChangeStatus;
    use tempfile::TempDir;

    async fn make_tracker(dir: &TempDir) -> VersioningTracker {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        let sessions = SessionStore::new(pool.clone());
        sessions.ensure_schema().await.unwrap();
        VersioningTracker::new(dir.path(), "d1", pool, Vec::new()).unwrap()
    }

    fn write(dir: &TempDir, rel: &str, content: &str) {
        let path = dir.path().join(rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, content).unwrap();
    }

    fn read(dir: &TempDir, rel: &str) -> Option<String> {
        std::fs::read_to_string(dir.path().join(rel)).ok()
    }

    #[tokio::test]
    async fn checkpoint_then_restore_roundtrip() {
        let dir = TempDir::new().unwrap();
        let tracker = make_tracker(&dir).await;

        write(&dir, "main.py", "print('hi')\n");
        let cp = tracker.create_checkpoint("Before user message: test").await.unwrap();

        write(&dir, "main.py", "print('changed')\n");
        write(&dir, "extra.txt", "junk\n");
        tracker.create_checkpoint("after edits").await.unwrap();

        let outcome = tracker.restore_checkpoint(&cp.commit_id).await.unwrap();
        assert_eq!(outcome.restored_to, cp.commit_id);
        assert_eq!(read(&dir, "main.py").as_deref(), Some("print('hi')\n"));
        // extra.txt was in HEAD but not the target: deleted.
        assert!(read(&dir, "extra.txt").is_none());
        // The restore itself produced a new checkpoint.
        assert!(tracker.has_commit(&outcome.new_checkpoint));
    }

    #[tokio::test]
    async fn restore_is_undoable() {
        let dir = TempDir::new().unwrap();
        let tracker = make_tracker(&dir).await;

        write(&dir, "a.txt", "v1\n");
        let cp1 = tracker.create_checkpoint("v1").await.unwrap();
        write(&dir, "a.txt", "v2\n");
        let cp2 = tracker.create_checkpoint("v2").await.unwrap();

        tracker.restore_checkpoint(&cp1.commit_id).await.unwrap();
        assert_eq!(read(&dir, "a.txt").as_deref(), Some("v1\n"));

        tracker.restore_checkpoint(&cp2.commit_id).await.unwrap();
        assert_eq!(read(&dir, "a.txt").as_deref(), Some("v2\n"));
    }

    #[tokio::test]
    async fn idempotent_checkpoint_reuses_tree() {
        let dir = TempDir::new().unwrap();
        let tracker = make_tracker(&dir).await;

        write(&dir, "a.txt", "stable\n");
        let cp1 = tracker.create_checkpoint("one").await.unwrap();
        let cp2 = tracker.create_checkpoint("two").await.unwrap();

        let c1 = tracker.store.get_commit(&cp1.commit_id).unwrap();
        let c2 = tracker.store.get_commit(&cp2.commit_id).unwrap();
        assert_eq!(c1.tree, c2.tree);
        assert_eq!(c2.parents, vec![cp1.commit_id]);
    }

    #[tokio::test]
    async fn ignored_file_force_staged_appears_in_tree() {
        let dir = TempDir::new().unwrap();
        let tracker = make_tracker(&dir).await;
        std::fs::write(dir.path().join(".gitignore"), ".venv/\n").unwrap();

        write(&dir, ".venv/config.py", "SETTING = 1\n");
        tracker
            .stage_file(Path::new(".venv/config.py"))
            .await
            .unwrap();
        // A second ignored file that was never staged stays invisible.
        write(&dir, ".venv/other.py", "x = 2\n");

        let cp = tracker.create_checkpoint("stage test").await.unwrap();
        let commit = tracker.store.get_commit(&cp.commit_id).unwrap();
        let files = tracker.store.collect_tree_files(&commit.tree).unwrap();
        assert!(files.contains_key(".venv/config.py"));
        assert!(!files.contains_key(".venv/other.py"));
    }

    #[tokio::test]
    async fn staged_deletion_removes_from_tree() {
        let dir = TempDir::new().unwrap();
        let tracker = make_tracker(&dir).await;
        std::fs::write(dir.path().join(".gitignore"), ".venv/\n").unwrap();

        write(&dir, ".venv/tool.py", "old\n");
        tracker.stage_file(Path::new(".venv/tool.py")).await.unwrap();
        tracker.create_checkpoint("with ignored file").await.unwrap();

        std::fs::remove_file(dir.path().join(".venv/tool.py")).unwrap();
        tracker
            .stage_file_deletion(Path::new(".venv/tool.py"))
            .await
            .unwrap();
        let cp = tracker.create_checkpoint("after delete").await.unwrap();
        let commit = tracker.store.get_commit(&cp.commit_id).unwrap();
        let files = tracker.store.collect_tree_files(&commit.tree).unwrap();
        assert!(!files.contains_key(".venv/tool.py"));
    }

    #[tokio::test]
    async fn approve_fast_forwards_main_and_rotates_session() {
        let dir = TempDir::new().unwrap();
        let tracker = make_tracker(&dir).await;

        write(&dir, "a.txt", "A\n");
        tracker.create_checkpoint("first").await.unwrap();
        write(&dir, "b.txt", "B\n");
        tracker.create_checkpoint("second").await.unwrap();

        // First checkpoint initialized main, so only the second commit is
        // ahead of it.
        let outcome = tracker.approve_all(None).await.unwrap();
        assert_eq!(outcome.commits_approved, 1);
        assert_eq!(outcome.new_session, "session_2");
        assert_eq!(
            tracker.store.read_ref("main").as_deref(),
            Some(outcome.approved_commit.as_str())
        );
        assert_eq!(
            tracker.active_session_name().await.unwrap(),
            "session_2"
        );
    }

    #[tokio::test]
    async fn approve_captures_command_made_changes() {
        let dir = TempDir::new().unwrap();
        let tracker = make_tracker(&dir).await;

        write(&dir, "a.txt", "A\n");
        tracker.create_checkpoint("first").await.unwrap();
        // Change made outside any tool (e.g. run_command): no staging.
        write(&dir, "a.txt", "MUTATED\n");

        let outcome = tracker.approve_all(None).await.unwrap();
        let main_files = tracker
            .store
            .collect_tree_files(&tracker.store.get_commit(&outcome.approved_commit).unwrap().tree)
            .unwrap();
        let blob = tracker.store.get_blob(&main_files["a.txt"].1).unwrap();
        assert_eq!(blob, b"MUTATED\n");
    }

    #[tokio::test]
    async fn reset_materializes_main_tip() {
        let dir = TempDir::new().unwrap();
        let tracker = make_tracker(&dir).await;

        write(&dir, "keep.txt", "approved\n");
        tracker.create_checkpoint("base").await.unwrap();
        tracker.approve_all(None).await.unwrap();

        write(&dir, "keep.txt", "scratch\n");
        write(&dir, "new.txt", "unapproved\n");
        tracker.create_checkpoint("work").await.unwrap();

        let outcome = tracker.reset_to_approved().await.unwrap();
        assert_eq!(outcome.new_session, "session_3");
        assert_eq!(read(&dir, "keep.txt").as_deref(), Some("approved\n"));
        assert!(read(&dir, "new.txt").is_none());
    }

    #[tokio::test]
    async fn staged_files_reports_all_three_sources() {
        let dir = TempDir::new().unwrap();
        let tracker = make_tracker(&dir).await;

        write(&dir, "committed.txt", "old\n");
        write(&dir, "deleted.txt", "doomed\n");
        tracker.create_checkpoint("base").await.unwrap();
        tracker.approve_all(None).await.unwrap();

        // (i) committed-but-unapproved change
        write(&dir, "committed.txt", "new\n");
        tracker.create_checkpoint("session work").await.unwrap();
        // (iii) command-made deletion, never staged
        std::fs::remove_file(dir.path().join("deleted.txt")).unwrap();
        // (ii) fresh file in the workdir
        write(&dir, "added.txt", "brand new\n");

        let changes = tracker.get_staged_files().await.unwrap();
        let by_path = |p: &str| changes.iter().find(|c| c.path == p);

        let committed = by_path("committed.txt").unwrap();
        assert_eq!(committed.status, ChangeStatus::Modified);
        assert_eq!(committed.base_content.as_deref(), Some("old\n"));

        let deleted = by_path("deleted.txt").unwrap();
        assert_eq!(deleted.status, ChangeStatus::Deleted);
        assert_eq!(deleted.base_content.as_deref(), Some("doomed\n"));

        let added = by_path("added.txt").unwrap();
        assert_eq!(added.status, ChangeStatus::Added);
        assert!(added.base_content.is_none());
    }

    #[tokio::test]
    async fn command_made_deletion_absent_from_next_checkpoint() {
        let dir = TempDir::new().unwrap();
        let tracker = make_tracker(&dir).await;

        write(&dir, "x.txt", "content\n");
        tracker.create_checkpoint("with x").await.unwrap();

        std::fs::remove_file(dir.path().join("x.txt")).unwrap();
        let cp = tracker.create_checkpoint("after rm").await.unwrap();
        let commit = tracker.store.get_commit(&cp.commit_id).unwrap();
        let files = tracker.store.collect_tree_files(&commit.tree).unwrap();
        assert!(!files.contains_key("x.txt"));
    }

    #[tokio::test]
    async fn edit_snapshot_abort_restores_bytes() {
        let dir = TempDir::new().unwrap();
        let tracker = make_tracker(&dir).await;

        write(&dir, "f.txt", "original\n");
        let snapshot = tracker.start_edit([Path::new("f.txt")]);
        write(&dir, "f.txt", "clobbered\n");
        snapshot.abort();
        assert_eq!(read(&dir, "f.txt").as_deref(), Some("original\n"));
    }

    #[tokio::test]
    async fn state_dir_never_enters_tree() {
        let dir = TempDir::new().unwrap();
        let tracker = make_tracker(&dir).await;

        write(&dir, "real.txt", "yes\n");
        let cp = tracker.create_checkpoint("scan").await.unwrap();
        let commit = tracker.store.get_commit(&cp.commit_id).unwrap();
        let files = tracker.store.collect_tree_files(&commit.tree).unwrap();
        assert!(files.keys().all(|p| !p.starts_with(".agentsmithy")));
    }
}
