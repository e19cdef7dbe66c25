//! Run-scoped scratch directory.
//!
//! Everything ephemeral lives under `<tempdir>/WorkingTemp/<run_id>/`: one
//! subdirectory per command keyword plus format-specific staging files.
//! The whole subtree is removed on drop unless a path was explicitly
//! protected (archives staged in scratch that the upload agent still
//! needs, diagnostics the operator asked to keep).

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

/// Fixed parent directory name under the temp root.
pub const WORKING_SUBDIR: &str = "WorkingTemp";

/// Owns the run's scratch subtree.
pub struct ScratchDir {
    root: PathBuf,
    protected: BTreeSet<PathBuf>,
    keep_all: bool,
}

impl ScratchDir {
    /// Create `<temp_dir>/WorkingTemp/<run_id>/`.
    pub fn create(temp_dir: &Path, run_id: &str) -> Result<Self> {
        let root = temp_dir.join(WORKING_SUBDIR).join(run_id);
        fs::create_dir_all(&root)
            .with_context(|| format!("failed to create scratch {}", root.display()))?;
        Ok(Self {
            root,
            protected: BTreeSet::new(),
            keep_all: false,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The per-command subdirectory, created on first use.
    pub fn command_dir(&self, keyword: &str) -> Result<PathBuf> {
        let dir = self.root.join(keyword);
        fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create {}", dir.display()))?;
        Ok(dir)
    }

    /// Exempt `path` from cleanup.
    pub fn protect(&mut self, path: &Path) {
        self.protected.insert(path.to_path_buf());
    }

    /// Keep the entire subtree (diagnostics).
    pub fn keep_all(&mut self) {
        self.keep_all = true;
    }

    fn cleanup(&self) {
        if self.keep_all {
            return;
        }
        if self.protected.is_empty() {
            fs::remove_dir_all(&self.root).ok();
            return;
        }
        // Remove everything except protected paths and their ancestors.
        let Ok(entries) = fs::read_dir(&self.root) else {
            return;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let shielded = self
                .protected
                .iter()
                .any(|p| p.starts_with(&path) || p == &path);
            if shielded {
                continue;
            }
            if path.is_dir() {
                fs::remove_dir_all(&path).ok();
            } else {
                fs::remove_file(&path).ok();
            }
        }
    }
}

impl Drop for ScratchDir {
    fn drop(&mut self) {
        self.cleanup();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn scratch_is_removed_on_drop() {
        let td = tempdir().expect("tempdir");
        let root = {
            let scratch = ScratchDir::create(td.path(), "run1").expect("create");
            let cmd = scratch.command_dir("ps").expect("command dir");
            fs::write(cmd.join("out.txt"), b"x").expect("write");
            scratch.root().to_path_buf()
        };
        assert!(!root.exists());
    }

    #[test]
    fn protected_paths_survive_cleanup() {
        let td = tempdir().expect("tempdir");
        let (root, kept) = {
            let mut scratch = ScratchDir::create(td.path(), "run2").expect("create");
            let staged = scratch.root().join("staged.zip");
            fs::write(&staged, b"archive").expect("write");
            let doomed = scratch.command_dir("doomed").expect("command dir");
            fs::write(doomed.join("x"), b"x").expect("write");
            scratch.protect(&staged);
            (scratch.root().to_path_buf(), staged)
        };
        assert!(kept.exists());
        assert!(!root.join("doomed").exists());
    }

    #[test]
    fn keep_all_disables_cleanup() {
        let td = tempdir().expect("tempdir");
        let root = {
            let mut scratch = ScratchDir::create(td.path(), "run3").expect("create");
            scratch.keep_all();
            scratch.root().to_path_buf()
        };
        assert!(root.exists());
    }

    #[test]
    fn layout_follows_the_working_temp_convention() {
        let td = tempdir().expect("tempdir");
        let scratch = ScratchDir::create(td.path(), "runX").expect("create");
        assert_eq!(
            scratch.root(),
            td.path().join(WORKING_SUBDIR).join("runX").as_path()
        );
    }
}
