//! File filtering for checkpoint trees.
//!
//! The checkpoint walk honors the union of the project's `.gitignore` and a
//! hardcoded exclusion list covering VCS metadata, dependency/build/cache
//! directories, binary artifacts and editor junk. Matching (including `!`
//! negation and last-match-wins ordering) is the `ignore` crate's gitignore
//! implementation; the hardcoded list is layered on top as extra lines. The
//! tool's own state (`.agentsmithy/`, the RAG store) is always excluded
//! regardless of configuration.

use std::path::Path;

use ignore::gitignore::{Gitignore, GitignoreBuilder};

/// Exclusions applied on top of `.gitignore`. Build artifacts, caches and
/// dependencies across the common language ecosystems.
pub const DEFAULT_EXCLUDES: &[&str] = &[
    // Version control
    ".git/",
    ".svn/",
    ".hg/",
    // Agent state
    ".agentsmithy/",
    "chroma_db/",
    // Python
    ".venv/",
    "venv/",
    "env/",
    "__pycache__/",
    "*.pyc",
    "*.pyo",
    ".pytest_cache/",
    ".mypy_cache/",
    ".ruff_cache/",
    ".tox/",
    "htmlcov/",
    "*.egg-info/",
    "dist/",
    "build/",
    // Node.js
    "node_modules/",
    ".npm/",
    ".yarn/",
    ".next/",
    ".nuxt/",
    ".cache/",
    // JVM
    "target/",
    ".gradle/",
    "*.class",
    "*.jar",
    "*.war",
    // C / C++
    "*.o",
    "*.obj",
    "*.a",
    "*.so",
    "*.dylib",
    "*.dll",
    "*.exe",
    "cmake-build-*/",
    "CMakeFiles/",
    // Go
    "vendor/",
    // .NET
    "bin/",
    "obj/",
    "*.pdb",
    // Swift / iOS
    ".build/",
    "DerivedData/",
    "Pods/",
    // Databases
    "*.db",
    "*.sqlite",
    "*.sqlite3",
    // OS / editor junk
    ".DS_Store",
    "Thumbs.db",
    "desktop.ini",
    "*.swp",
    "*.swo",
    "*~",
    // Logs and temp files
    "*.log",
    "logs/",
    "tmp/",
    "temp/",
    "*.tmp",
    "*.bak",
];

/// Exclusions that configuration cannot remove: the store must never
/// checkpoint its own state or foreign VCS metadata. Added last so no
/// earlier `!` line can re-include them.
const MANDATORY_EXCLUDES: &[&str] = &[".git/", ".agentsmithy/", "chroma_db/"];

/// Merged gitignore-semantics matcher for one project.
pub struct IgnoreMatcher {
    gitignore: Gitignore,
}

impl IgnoreMatcher {
    /// Build from the project `.gitignore` (if present), the default list,
    /// and any configured extras.
    pub fn for_project(project_root: &Path, extra: &[String]) -> Self {
        let mut builder = GitignoreBuilder::new(project_root);

        let gitignore_path = project_root.join(".gitignore");
        if gitignore_path.exists() {
            // A broken .gitignore must not stop checkpointing.
            if let Some(e) = builder.add(&gitignore_path) {
                tracing::warn!(error = %e, "Failed to parse .gitignore; continuing");
            }
        }

        let extra_lines = extra.iter().map(String::as_str);
        for line in DEFAULT_EXCLUDES
            .iter()
            .copied()
            .chain(extra_lines)
            .chain(MANDATORY_EXCLUDES.iter().copied())
        {
            if let Err(e) = builder.add_line(None, line) {
                tracing::warn!(pattern = line, error = %e, "Skipping invalid ignore pattern");
            }
        }

        let gitignore = builder.build().unwrap_or_else(|e| {
            tracing::warn!(error = %e, "Failed to build ignore matcher; excluding nothing");
            Gitignore::empty()
        });
        Self { gitignore }
    }

    /// Whether a path relative to the project root is excluded. Paths inside
    /// an excluded directory are excluded too.
    pub fn is_ignored(&self, rel_path: &str, is_dir: bool) -> bool {
        self.gitignore
            .matched_path_or_any_parents(Path::new(rel_path), is_dir)
            .is_ignore()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn matcher_with(patterns: &[&str]) -> IgnoreMatcher {
        let mut builder = GitignoreBuilder::new("/");
        for pattern in patterns {
            builder.add_line(None, pattern).unwrap();
        }
        IgnoreMatcher {
            gitignore: builder.build().unwrap(),
        }
    }

    #[test]
    fn directory_patterns_cover_subtree() {
        let m = matcher_with(&["node_modules/"]);
        assert!(m.is_ignored("node_modules", true));
        assert!(m.is_ignored("node_modules/lodash/index.js", false));
        assert!(m.is_ignored("web/node_modules/x.js", false));
        assert!(!m.is_ignored("src/node_modules.rs", false));
    }

    #[test]
    fn extension_patterns_match_filename() {
        let m = matcher_with(&["*.pyc"]);
        assert!(m.is_ignored("main.pyc", false));
        assert!(m.is_ignored("pkg/sub/util.pyc", false));
        assert!(!m.is_ignored("main.py", false));
    }

    #[test]
    fn wildcard_directory_patterns() {
        let m = matcher_with(&["cmake-build-*/"]);
        assert!(m.is_ignored("cmake-build-debug/CMakeCache.txt", false));
        assert!(!m.is_ignored("cmake/readme.md", false));
    }

    #[test]
    fn exact_patterns_match_path_or_component() {
        let m = matcher_with(&[".DS_Store"]);
        assert!(m.is_ignored(".DS_Store", false));
        assert!(m.is_ignored("docs/.DS_Store", false));
    }

    #[test]
    fn negation_reincludes_a_file() {
        let m = matcher_with(&["*.log", "!keep.log"]);
        assert!(m.is_ignored("debug.log", false));
        assert!(!m.is_ignored("keep.log", false));
        assert!(m.is_ignored("sub/other.log", false));
    }

    #[test]
    fn agent_state_always_excluded_by_defaults() {
        let dir = TempDir::new().unwrap();
        let m = IgnoreMatcher::for_project(dir.path(), &[]);
        assert!(m.is_ignored(".agentsmithy/status.json", false));
        assert!(m.is_ignored(".git/HEAD", false));
    }

    #[test]
    fn gitignore_patterns_are_merged() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(".gitignore"), "secrets.txt\n# comment\n\nout/\n")
            .unwrap();
        let m = IgnoreMatcher::for_project(dir.path(), &[]);
        assert!(m.is_ignored("secrets.txt", false));
        assert!(m.is_ignored("out/app.bin", false));
        assert!(!m.is_ignored("src/main.rs", false));
    }

    #[test]
    fn gitignore_negation_is_honored() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(".gitignore"), "*.log\n!keep.log\n").unwrap();
        let m = IgnoreMatcher::for_project(dir.path(), &[]);
        assert!(m.is_ignored("debug.log", false));
        assert!(!m.is_ignored("keep.log", false));
    }

    #[test]
    fn negation_cannot_reinclude_agent_state() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(".gitignore"), "!.agentsmithy/\n!.git/\n").unwrap();
        let m = IgnoreMatcher::for_project(dir.path(), &[]);
        assert!(m.is_ignored(".agentsmithy/status.json", false));
        assert!(m.is_ignored(".git/HEAD", false));
    }

    #[test]
    fn double_star_patterns() {
        let m = matcher_with(&["**/generated.rs"]);
        assert!(m.is_ignored("generated.rs", false));
        assert!(m.is_ignored("src/deep/generated.rs", false));
    }

    #[test]
    fn extra_excludes_are_applied() {
        let dir = TempDir::new().unwrap();
        let m = IgnoreMatcher::for_project(dir.path(), &["*.generated".to_string()]);
        assert!(m.is_ignored("schema.generated", false));
    }
}
