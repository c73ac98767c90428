//! Content-addressed object store for checkpoints.
//!
//! Git-shaped object model without git: blobs hold file bytes, trees hold
//! sorted directory entries, commits point at a tree and a parent chain.
//! Objects are addressed by SHA-256 over `"<kind> <len>\0" + body`, so equal
//! content always hashes to the same id regardless of when it was written.
//!
//! Layout under a dialog's `checkpoints/` directory:
//!
//! ```text
//! objects/<hh>/<rest-of-hash>
//! refs/{main, session_N}
//! metadata.json
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use sha2::{Digest, Sha256};

/// Regular-file mode recorded in tree entries.
pub const MODE_FILE: u32 = 0o100644;
/// Executable-file mode.
pub const MODE_EXEC: u32 = 0o100755;

/// What a tree entry points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Blob,
    Tree,
}

impl EntryKind {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Blob => "blob",
            Self::Tree => "tree",
        }
    }
}

/// One entry of a tree object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeEntry {
    pub mode: u32,
    pub kind: EntryKind,
    pub hash: String,
}

/// A tree object: sorted map of path component to entry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Tree {
    pub entries: BTreeMap<String, TreeEntry>,
}

impl Tree {
    /// Canonical serialized form. Entry order is the BTreeMap order, so the
    /// hash is deterministic for a given set of entries.
    fn serialize(&self) -> Vec<u8> {
        let mut out = String::new();
        for (name, entry) in &self.entries {
            out.push_str(&format!(
                "{:o} {} {}\t{}\n",
                entry.mode,
                entry.kind.as_str(),
                entry.hash,
                name
            ));
        }
        out.into_bytes()
    }

    fn deserialize(body: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(body).context("tree object is not UTF-8")?;
        let mut entries = BTreeMap::new();
        for line in text.lines() {
            let (head, name) = line
                .split_once('\t')
                .with_context(|| format!("malformed tree entry: {line}"))?;
            let mut parts = head.split(' ');
            let mode = u32::from_str_radix(parts.next().unwrap_or(""), 8)
                .context("malformed tree entry mode")?;
            let kind = match parts.next() {
                Some("blob") => EntryKind::Blob,
                Some("tree") => EntryKind::Tree,
                other => bail!("unknown tree entry kind: {other:?}"),
            };
            let hash = parts
                .next()
                .context("missing tree entry hash")?
                .to_string();
            entries.insert(name.to_string(), TreeEntry { mode, kind, hash });
        }
        Ok(Self { entries })
    }
}

/// A commit object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Commit {
    pub tree: String,
    pub parents: Vec<String>,
    pub message: String,
    pub author_time: i64,
}

impl Commit {
    fn serialize(&self) -> Vec<u8> {
        let mut out = format!("tree {}\n", self.tree);
        for parent in &self.parents {
            out.push_str(&format!("parent {parent}\n"));
        }
        out.push_str(&format!("author_time {}\n\n", self.author_time));
        out.push_str(&self.message);
        out.into_bytes()
    }

    fn deserialize(body: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(body).context("commit object is not UTF-8")?;
        let (header, message) = text
            .split_once("\n\n")
            .context("commit object missing header separator")?;
        let mut tree = None;
        let mut parents = Vec::new();
        let mut author_time = 0i64;
        for line in header.lines() {
            if let Some(hash) = line.strip_prefix("tree ") {
                tree = Some(hash.to_string());
            } else if let Some(hash) = line.strip_prefix("parent ") {
                parents.push(hash.to_string());
            } else if let Some(secs) = line.strip_prefix("author_time ") {
                author_time = secs.parse().unwrap_or(0);
            }
        }
        Ok(Self {
            tree: tree.context("commit object missing tree")?,
            parents,
            message: message.to_string(),
            author_time,
        })
    }
}

fn object_hash(kind: &str, body: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("{kind} {}\0", body.len()).as_bytes());
    hasher.update(body);
    let digest = hasher.finalize();
    let mut hex = String::with_capacity(64);
    for byte in digest {
        hex.push_str(&format!("{byte:02x}"));
    }
    hex
}

/// Hash file content the way the store would, without writing anything.
pub fn blob_hash(content: &[u8]) -> String {
    object_hash("blob", content)
}

/// The on-disk object store for one dialog's checkpoint repo.
pub struct ObjectStore {
    root: PathBuf,
}

impl ObjectStore {
    pub fn open(root: &Path) -> Result<Self> {
        std::fs::create_dir_all(root.join("objects"))?;
        std::fs::create_dir_all(root.join("refs"))?;
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_path(&self, hash: &str) -> PathBuf {
        self.root.join("objects").join(&hash[..2]).join(&hash[2..])
    }

    fn write_object(&self, kind: &str, body: &[u8]) -> Result<String> {
        let hash = object_hash(kind, body);
        let path = self.object_path(&hash);
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let tmp = path.with_extension("tmp");
            std::fs::write(&tmp, body)?;
            std::fs::rename(&tmp, &path)?;
        }
        Ok(hash)
    }

    fn read_object(&self, hash: &str) -> Result<Vec<u8>> {
        if hash.len() < 3 {
            bail!("invalid object id: {hash}");
        }
        std::fs::read(self.object_path(hash)).with_context(|| format!("object not found: {hash}"))
    }

    pub fn has_object(&self, hash: &str) -> bool {
        hash.len() >= 3 && self.object_path(hash).exists()
    }

    pub fn put_blob(&self, content: &[u8]) -> Result<String> {
        self.write_object("blob", content)
    }

    pub fn get_blob(&self, hash: &str) -> Result<Vec<u8>> {
        self.read_object(hash)
    }

    pub fn put_tree(&self, tree: &Tree) -> Result<String> {
        self.write_object("tree", &tree.serialize())
    }

    pub fn get_tree(&self, hash: &str) -> Result<Tree> {
        Tree::deserialize(&self.read_object(hash)?)
    }

    pub fn put_commit(&self, commit: &Commit) -> Result<String> {
        self.write_object("commit", &commit.serialize())
    }

    pub fn get_commit(&self, hash: &str) -> Result<Commit> {
        Commit::deserialize(&self.read_object(hash)?)
    }

    // ---- refs ----

    fn ref_path(&self, name: &str) -> PathBuf {
        self.root.join("refs").join(name)
    }

    pub fn read_ref(&self, name: &str) -> Option<String> {
        std::fs::read_to_string(self.ref_path(name))
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }

    pub fn write_ref(&self, name: &str, commit_id: &str) -> Result<()> {
        let path = self.ref_path(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, format!("{commit_id}\n"))?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    pub fn ref_exists(&self, name: &str) -> bool {
        self.ref_path(name).exists()
    }

    /// Build a nested tree from a flat map of `relative/path -> (mode, blob)`.
    /// Writes all intermediate tree objects; returns the root tree hash.
    pub fn write_tree_from_paths(&self, files: &BTreeMap<String, (u32, String)>) -> Result<String> {
        #[derive(Default)]
        struct Dir {
            files: BTreeMap<String, (u32, String)>,
            dirs: BTreeMap<String, Dir>,
        }

        let mut root = Dir::default();
        for (path, (mode, hash)) in files {
            let mut node = &mut root;
            let mut components: Vec<&str> = path.split('/').collect();
            let file_name = components.pop().unwrap_or_default();
            for component in components {
                node = node.dirs.entry(component.to_string()).or_default();
            }
            node.files
                .insert(file_name.to_string(), (*mode, hash.clone()));
        }

        fn write_dir(store: &ObjectStore, dir: &Dir) -> Result<String> {
            let mut tree = Tree::default();
            for (name, child) in &dir.dirs {
                let hash = write_dir(store, child)?;
                tree.entries.insert(
                    name.clone(),
                    TreeEntry {
                        mode: 0o040000,
                        kind: EntryKind::Tree,
                        hash,
                    },
                );
            }
            for (name, (mode, hash)) in &dir.files {
                tree.entries.insert(
                    name.clone(),
                    TreeEntry {
                        mode: *mode,
                        kind: EntryKind::Blob,
                        hash: hash.clone(),
                    },
                );
            }
            store.put_tree(&tree)
        }

        write_dir(self, &root)
    }

    /// Flatten a tree into `relative/path -> (mode, blob hash)`.
    pub fn collect_tree_files(&self, tree_hash: &str) -> Result<BTreeMap<String, (u32, String)>> {
        let mut files = BTreeMap::new();
        self.collect_into(tree_hash, "", &mut files)?;
        Ok(files)
    }

    fn collect_into(
        &self,
        tree_hash: &str,
        prefix: &str,
        out: &mut BTreeMap<String, (u32, String)>,
    ) -> Result<()> {
        let tree = self.get_tree(tree_hash)?;
        for (name, entry) in tree.entries {
            let path = if prefix.is_empty() {
                name
            } else {
                format!("{prefix}/{name}")
            };
            match entry.kind {
                EntryKind::Tree => self.collect_into(&entry.hash, &path, out)?,
                EntryKind::Blob => {
                    out.insert(path, (entry.mode, entry.hash));
                }
            }
        }
        Ok(())
    }
}
