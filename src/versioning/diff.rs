//! Unified diffs and the changed-file model for the session view.

use serde::{Deserialize, Serialize};
use similar::TextDiff;

/// Files larger than this get no inline diff or base content.
pub const MAX_DIFF_CONTENT_BYTES: usize = 1024 * 1024;

/// Change status of a file relative to the approved (`main`) tip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeStatus {
    Added,
    Modified,
    Deleted,
}

/// One changed file in `get_staged_files` output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangedFile {
    pub path: String,
    pub status: ChangeStatus,
    pub additions: usize,
    pub deletions: usize,
    /// Unified diff with `--- a/<path>` / `+++ b/<path>` headers; absent for
    /// binary or oversized files.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diff: Option<String>,
    /// Content at the `main` tip; absent for added, binary or oversized files.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_content: Option<String>,
    pub is_binary: bool,
    pub is_too_large: bool,
}

/// Heuristic binary check: NUL byte in the first 8 KiB.
pub fn looks_binary(content: &[u8]) -> bool {
    content.iter().take(8192).any(|&b| b == 0)
}

/// Produce a unified diff between two text versions of `path`.
pub fn unified_diff(path: &str, old: &str, new: &str) -> String {
    TextDiff::from_lines(old, new)
        .unified_diff()
        .context_radius(3)
        .header(&format!("a/{path}"), &format!("b/{path}"))
        .to_string()
}

/// Count `+`/`-` body lines of a unified diff (headers excluded).
pub fn diff_stats(diff: &str) -> (usize, usize) {
    let mut additions = 0;
    let mut deletions = 0;
    for line in diff.lines() {
        if line.starts_with("+++") || line.starts_with("---") {
            continue;
        }
        if line.starts_with('+') {
            additions += 1;
        } else if line.starts_with('-') {
            deletions += 1;
        }
    }
    (additions, deletions)
}

/// Build a [`ChangedFile`] from optional old and new content.
///
/// `old` is the `main`-tip version (None = file is new), `new` is the working
/// version (None = file is gone).
pub fn changed_file(path: &str, old: Option<&[u8]>, new: Option<&[u8]>) -> Option<ChangedFile> {
    let status = match (old, new) {
        (None, Some(_)) => ChangeStatus::Added,
        (Some(_), None) => ChangeStatus::Deleted,
        (Some(old), Some(new)) if old != new => ChangeStatus::Modified,
        _ => return None,
    };

    let is_binary = old.map(looks_binary).unwrap_or(false) || new.map(looks_binary).unwrap_or(false);
    let is_too_large = old.map(|c| c.len() > MAX_DIFF_CONTENT_BYTES).unwrap_or(false)
        || new.map(|c| c.len() > MAX_DIFF_CONTENT_BYTES).unwrap_or(false);

    let (diff, additions, deletions) = if is_binary || is_too_large {
        (None, 0, 0)
    } else {
        let old_text = old.map(|c| String::from_utf8_lossy(c).into_owned());
        let new_text = new.map(|c| String::from_utf8_lossy(c).into_owned());
        let diff = unified_diff(
            path,
            old_text.as_deref().unwrap_or(""),
            new_text.as_deref().unwrap_or(""),
        );
        let (additions, deletions) = diff_stats(&diff);
        (Some(diff), additions, deletions)
    };

    let base_content = match (status, old) {
        (ChangeStatus::Added, _) => None,
        (_, Some(old)) if !is_binary && !is_too_large => {
            Some(String::from_utf8_lossy(old).into_owned())
        }
        _ => None,
    };

    Some(ChangedFile {
        path: path.to_string(),
        status,
        additions,
        deletions,
        diff,
        base_content,
        is_binary,
        is_too_large,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unified_diff_has_standard_headers() {
        let diff = unified_diff("src/main.rs", "old line\n", "new line\n");
        assert!(diff.contains("--- a/src/main.rs"));
        assert!(diff.contains("+++ b/src/main.rs"));
        assert!(diff.contains("-old line"));
        assert!(diff.contains("+new line"));
    }

    #[test]
    fn stats_count_body_lines_only() {
        let diff = unified_diff("f", "a\nb\nc\n", "a\nB\nc\nd\n");
        let (additions, deletions) = diff_stats(&diff);
        assert_eq!(additions, 2);
        assert_eq!(deletions, 1);
    }

    #[test]
    fn added_file_has_no_base_content() {
        let cf = changed_file("x.txt", None, Some(b"hello\n")).unwrap();
        assert_eq!(cf.status, ChangeStatus::Added);
        assert!(cf.base_content.is_none());
        assert_eq!(cf.additions, 1);
    }

    #[test]
    fn deleted_file_keeps_base_content() {
        let cf = changed_file("x.txt", Some(b"bye\n"), None).unwrap();
        assert_eq!(cf.status, ChangeStatus::Deleted);
        assert_eq!(cf.base_content.as_deref(), Some("bye\n"));
        assert_eq!(cf.deletions, 1);
    }

    #[test]
    fn unchanged_file_is_skipped() {
        assert!(changed_file("x.txt", Some(b"same"), Some(b"same")).is_none());
    }

    #[test]
    fn binary_files_get_no_diff() {
        let cf = changed_file("bin", Some(b"a\0b"), Some(b"c\0d")).unwrap();
        assert!(cf.is_binary);
        assert!(cf.diff.is_none());
        assert!(cf.base_content.is_none());
    }

    #[test]
    fn applying_diff_reproduces_new_content() {
        // Round-trip property: base + diff = current.
        let old = "one\ntwo\nthree\n";
        let new = "one\n2\nthree\nfour\n";
        let diff = unified_diff("f.txt", old, new);

        // Minimal unified-diff application for the test.
        let mut result: Vec<String> = old.lines().map(|s| s.to_string()).collect();
        let mut offset: isize = 0;
        let mut lines = diff.lines().peekable();
        while let Some(line) = lines.next() {
            if !line.starts_with("@@") {
                continue;
            }
            let header = line.trim_start_matches("@@").trim_end_matches("@@").trim();
            let old_part = header.split(' ').next().unwrap().trim_start_matches('-');
            let old_start: isize = old_part.split(',').next().unwrap().parse().unwrap();
            let mut pos = (old_start - 1 + offset).max(0) as usize;
            while let Some(&body) = lines.peek() {
                if body.starts_with("@@") {
                    break;
                }
                lines.next();
                if let Some(ctx) = body.strip_prefix(' ') {
                    assert_eq!(result[pos], ctx);
                    pos += 1;
                } else if let Some(del) = body.strip_prefix('-') {
                    assert_eq!(result[pos], del);
                    result.remove(pos);
                    offset -= 1;
                } else if let Some(add) = body.strip_prefix('+') {
                    result.insert(pos, add.to_string());
                    pos += 1;
                    offset += 1;
                } else {
                    break;
                }
            }
        }
        assert_eq!(result.join("\n") + "\n", new);
    }
}
